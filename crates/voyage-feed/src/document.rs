//! Tolerant typed view over one feed document.
//!
//! Every field is optional and coerced leniently (numbers arrive as strings,
//! id lists arrive as comma-separated text, sections are maps or arrays
//! depending on the line). Deserializing a JSON object into [`FeedDocument`]
//! never fails on field shape; the priority rules that resolve synonyms live
//! in the accessors here and in `pricing`.

use std::collections::BTreeMap;

use chrono::NaiveDate;
use serde::{de::DeserializeOwned, Deserialize, Deserializer};
use serde_json::Value;
use voyage_core::CabinCategory;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct FeedDocument {
    #[serde(deserialize_with = "loose::opt_i64")]
    pub cruiseid: Option<i64>,
    #[serde(deserialize_with = "loose::opt_i64")]
    pub codetocruiseid: Option<i64>,
    #[serde(deserialize_with = "loose::opt_i32")]
    pub lineid: Option<i32>,
    #[serde(deserialize_with = "loose::opt_i32")]
    pub shipid: Option<i32>,
    #[serde(deserialize_with = "loose::opt_text")]
    pub name: Option<String>,
    #[serde(deserialize_with = "loose::opt_date")]
    pub saildate: Option<NaiveDate>,
    #[serde(deserialize_with = "loose::opt_date")]
    pub startdate: Option<NaiveDate>,
    #[serde(deserialize_with = "loose::opt_i32")]
    pub nights: Option<i32>,
    #[serde(deserialize_with = "loose::opt_i32")]
    pub sailnights: Option<i32>,
    #[serde(deserialize_with = "loose::opt_i32")]
    pub startportid: Option<i32>,
    #[serde(deserialize_with = "loose::opt_i32")]
    pub endportid: Option<i32>,
    #[serde(deserialize_with = "loose::id_list")]
    pub portids: Vec<i32>,
    #[serde(deserialize_with = "loose::id_list")]
    pub regionids: Vec<i32>,
    pub ports: Value,
    pub regions: Value,
    #[serde(deserialize_with = "loose::objects")]
    pub itinerary: Vec<FeedItineraryEntry>,
    pub prices: Value,
    pub cabins: Value,
    #[serde(deserialize_with = "loose::object")]
    pub cheapest: FeedCheapest,
    #[serde(deserialize_with = "loose::opt_f64")]
    pub cheapestinside: Option<f64>,
    #[serde(deserialize_with = "loose::opt_f64")]
    pub cheapestinterior: Option<f64>,
    #[serde(deserialize_with = "loose::opt_f64")]
    pub cheapestoutside: Option<f64>,
    #[serde(deserialize_with = "loose::opt_f64")]
    pub cheapestoceanview: Option<f64>,
    #[serde(deserialize_with = "loose::opt_f64")]
    pub cheapestbalcony: Option<f64>,
    #[serde(deserialize_with = "loose::opt_f64")]
    pub cheapestsuite: Option<f64>,
    pub altsailings: Value,
    #[serde(deserialize_with = "loose::object")]
    pub linecontent: FeedLineContent,
    #[serde(deserialize_with = "loose::object")]
    pub shipcontent: FeedShipContent,
    #[serde(deserialize_with = "loose::opt_text")]
    pub currency: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct FeedCheapest {
    pub combined: Value,
    pub prices: Value,
    pub cachedprices: Value,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct FeedLineContent {
    #[serde(deserialize_with = "loose::opt_text")]
    pub name: Option<String>,
    #[serde(deserialize_with = "loose::opt_text")]
    pub enginename: Option<String>,
    #[serde(deserialize_with = "loose::opt_text")]
    pub code: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct FeedShipContent {
    #[serde(deserialize_with = "loose::opt_text")]
    pub name: Option<String>,
    #[serde(deserialize_with = "loose::opt_text")]
    pub code: Option<String>,
    #[serde(deserialize_with = "loose::opt_i32")]
    pub tonnage: Option<i32>,
    #[serde(deserialize_with = "loose::opt_i32")]
    pub occupancy: Option<i32>,
    #[serde(deserialize_with = "loose::opt_f64")]
    pub starrating: Option<f64>,
    #[serde(deserialize_with = "loose::opt_year")]
    pub launched: Option<i32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct FeedItineraryEntry {
    #[serde(deserialize_with = "loose::opt_i32")]
    pub day: Option<i32>,
    #[serde(deserialize_with = "loose::opt_i32")]
    pub orderid: Option<i32>,
    #[serde(deserialize_with = "loose::opt_i32")]
    pub portid: Option<i32>,
    #[serde(deserialize_with = "loose::opt_text")]
    pub name: Option<String>,
    #[serde(deserialize_with = "loose::opt_text")]
    pub arrivetime: Option<String>,
    #[serde(deserialize_with = "loose::opt_text")]
    pub departtime: Option<String>,
    #[serde(deserialize_with = "loose::opt_text")]
    pub description: Option<String>,
    #[serde(deserialize_with = "loose::flag")]
    pub tender: bool,
    #[serde(deserialize_with = "loose::opt_f64")]
    pub latitude: Option<f64>,
    #[serde(deserialize_with = "loose::opt_f64")]
    pub longitude: Option<f64>,
}

/// One priced cell of the `prices[rate][cabin][occupancy]` matrix, unscaled.
#[derive(Debug, Clone, PartialEq)]
pub struct MatrixCell {
    pub rate_code: String,
    pub cabin_code: String,
    pub occupancy_code: String,
    pub price: f64,
    pub taxes: Option<f64>,
    pub ncf: Option<f64>,
    pub gratuity: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FeedAltSailing {
    pub id: i64,
    pub sail_date: Option<NaiveDate>,
    pub ship_id: Option<i32>,
    pub price: Option<f64>,
}

const INTERIOR_KEYS: &[&str] = &["inside", "interior"];
const OCEANVIEW_KEYS: &[&str] = &["outside", "oceanview"];
const BALCONY_KEYS: &[&str] = &["balcony"];
const SUITE_KEYS: &[&str] = &["suite"];

pub(crate) fn category_keys(category: CabinCategory) -> &'static [&'static str] {
    match category {
        CabinCategory::Interior => INTERIOR_KEYS,
        CabinCategory::Oceanview => OCEANVIEW_KEYS,
        CabinCategory::Balcony => BALCONY_KEYS,
        CabinCategory::Suite => SUITE_KEYS,
    }
}

/// First parseable value among the category's key synonyms in a price map.
pub(crate) fn category_value(section: &Value, category: CabinCategory) -> Option<f64> {
    category_keys(category)
        .iter()
        .find_map(|key| section.get(*key).and_then(loose::number))
}

impl FeedDocument {
    pub fn sail_date(&self) -> Option<NaiveDate> {
        self.saildate.or(self.startdate)
    }

    pub fn nights(&self) -> Option<i32> {
        self.nights.or(self.sailnights)
    }

    pub fn direct_price(&self, category: CabinCategory) -> Option<f64> {
        match category {
            CabinCategory::Interior => self.cheapestinside.or(self.cheapestinterior),
            CabinCategory::Oceanview => self.cheapestoutside.or(self.cheapestoceanview),
            CabinCategory::Balcony => self.cheapestbalcony,
            CabinCategory::Suite => self.cheapestsuite,
        }
    }

    pub fn line_name(&self) -> Option<String> {
        self.linecontent
            .name
            .clone()
            .or_else(|| self.linecontent.enginename.clone())
    }

    /// Port names keyed by id. `ports` is either an id→name map, an id→object
    /// map, an array of `{id, name}` objects, or an array of names aligned
    /// with `portids`.
    pub fn port_names(&self) -> BTreeMap<i32, String> {
        named_section(&self.ports, &self.portids)
    }

    pub fn region_names(&self) -> BTreeMap<i32, String> {
        named_section(&self.regions, &self.regionids)
    }

    /// Cabin type hint (`codtype`, then `name`) from the `cabins` section.
    pub fn cabin_hint(&self, cabin_code: &str) -> Option<String> {
        let cabin = self.cabins.get(cabin_code)?;
        cabin
            .get("codtype")
            .and_then(loose::text)
            .or_else(|| cabin.get("name").and_then(loose::text))
    }

    pub fn price_matrix(&self) -> Vec<MatrixCell> {
        let mut cells = Vec::new();
        let Some(rates) = self.prices.as_object() else {
            return cells;
        };
        for (rate_code, cabins) in rates {
            let Some(cabins) = cabins.as_object() else {
                continue;
            };
            for (cabin_code, occupancies) in cabins {
                if occupancies.get("price").is_some() {
                    cells.extend(matrix_cell(rate_code, cabin_code, "", occupancies));
                    continue;
                }
                let Some(occupancies) = occupancies.as_object() else {
                    continue;
                };
                for (occupancy_code, cell) in occupancies {
                    cells.extend(matrix_cell(rate_code, cabin_code, occupancy_code, cell));
                }
            }
        }
        cells
    }

    pub fn alt_sailings(&self) -> Vec<FeedAltSailing> {
        let entries: Vec<(Option<&str>, &Value)> = match &self.altsailings {
            Value::Object(map) => map.iter().map(|(k, v)| (Some(k.as_str()), v)).collect(),
            Value::Array(items) => items.iter().map(|v| (None, v)).collect(),
            _ => Vec::new(),
        };
        entries
            .into_iter()
            .filter_map(|(key, entry)| {
                let id = ["codetocruiseid", "cruiseid", "id"]
                    .iter()
                    .find_map(|k| entry.get(*k).and_then(loose::integer))
                    .or_else(|| key.and_then(|k| k.trim().parse().ok()))?;
                Some(FeedAltSailing {
                    id,
                    sail_date: ["saildate", "startdate"]
                        .iter()
                        .find_map(|k| entry.get(*k).and_then(loose::date)),
                    ship_id: entry
                        .get("shipid")
                        .and_then(loose::integer)
                        .and_then(|v| i32::try_from(v).ok()),
                    price: ["leadprice", "price", "cheapestprice"]
                        .iter()
                        .find_map(|k| entry.get(*k).and_then(loose::number)),
                })
            })
            .collect()
    }
}

fn matrix_cell(rate: &str, cabin: &str, occupancy: &str, cell: &Value) -> Option<MatrixCell> {
    let price = loose::number(cell).or_else(|| {
        ["price", "adultprice"]
            .iter()
            .find_map(|k| cell.get(*k).and_then(loose::number))
    })?;
    let field = |key: &str| cell.get(key).and_then(loose::number);
    Some(MatrixCell {
        rate_code: rate.to_string(),
        cabin_code: cabin.to_string(),
        occupancy_code: occupancy.to_string(),
        price,
        taxes: field("taxes"),
        ncf: field("ncf"),
        gratuity: field("gratuity"),
    })
}

fn named_section(section: &Value, aligned_ids: &[i32]) -> BTreeMap<i32, String> {
    let mut names = BTreeMap::new();
    match section {
        Value::Object(map) => {
            for (key, value) in map {
                let Ok(id) = key.trim().parse::<i32>() else {
                    continue;
                };
                let name = loose::text(value).or_else(|| value.get("name").and_then(loose::text));
                if let Some(name) = name {
                    names.insert(id, name);
                }
            }
        }
        Value::Array(items) => {
            for (idx, item) in items.iter().enumerate() {
                if let Some(obj) = item.as_object() {
                    let id = obj
                        .get("id")
                        .and_then(loose::integer)
                        .and_then(|v| i32::try_from(v).ok());
                    let name = obj.get("name").and_then(loose::text);
                    if let (Some(id), Some(name)) = (id, name) {
                        names.insert(id, name);
                    }
                } else if let (Some(id), Some(name)) = (aligned_ids.get(idx), loose::text(item)) {
                    names.insert(*id, name);
                }
            }
        }
        _ => {}
    }
    names
}

/// Lenient coercions shared by the document model and the pricing engine.
pub(crate) mod loose {
    use super::*;

    pub fn number(value: &Value) -> Option<f64> {
        let parsed = match value {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().replace(',', "").parse::<f64>().ok(),
            _ => None,
        };
        parsed.filter(|v| v.is_finite())
    }

    pub fn integer(value: &Value) -> Option<i64> {
        match value {
            Value::Number(n) => n
                .as_i64()
                .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64)),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn text(value: &Value) -> Option<String> {
        match value {
            Value::String(s) => Some(s.trim())
                .filter(|s| !s.is_empty())
                .map(ToString::to_string),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    pub fn date(value: &Value) -> Option<NaiveDate> {
        let text = text(value)?;
        let head = text.get(..10)?;
        NaiveDate::parse_from_str(head, "%Y-%m-%d").ok()
    }

    fn to_i32(value: &Value) -> Option<i32> {
        integer(value).and_then(|v| i32::try_from(v).ok())
    }

    pub fn opt_i64<'de, D: Deserializer<'de>>(d: D) -> Result<Option<i64>, D::Error> {
        Ok(integer(&Value::deserialize(d)?))
    }

    pub fn opt_i32<'de, D: Deserializer<'de>>(d: D) -> Result<Option<i32>, D::Error> {
        Ok(to_i32(&Value::deserialize(d)?))
    }

    pub fn opt_f64<'de, D: Deserializer<'de>>(d: D) -> Result<Option<f64>, D::Error> {
        Ok(number(&Value::deserialize(d)?))
    }

    pub fn opt_text<'de, D: Deserializer<'de>>(d: D) -> Result<Option<String>, D::Error> {
        Ok(text(&Value::deserialize(d)?))
    }

    pub fn opt_date<'de, D: Deserializer<'de>>(d: D) -> Result<Option<NaiveDate>, D::Error> {
        Ok(date(&Value::deserialize(d)?))
    }

    /// A bare year or any date whose first four characters are the year.
    pub fn opt_year<'de, D: Deserializer<'de>>(d: D) -> Result<Option<i32>, D::Error> {
        let value = Value::deserialize(d)?;
        Ok(to_i32(&value).or_else(|| text(&value).and_then(|t| t.get(..4)?.parse().ok())))
    }

    pub fn flag<'de, D: Deserializer<'de>>(d: D) -> Result<bool, D::Error> {
        Ok(match Value::deserialize(d)? {
            Value::Bool(b) => b,
            Value::Number(n) => n.as_f64().is_some_and(|v| v != 0.0),
            Value::String(s) => matches!(s.trim().to_ascii_lowercase().as_str(), "y" | "yes" | "true" | "1"),
            _ => false,
        })
    }

    /// `[1, "2"]`, `"1,2"` and a single scalar all become id lists.
    pub fn id_list<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<i32>, D::Error> {
        Ok(match Value::deserialize(d)? {
            Value::Array(items) => items.iter().filter_map(to_i32).collect(),
            Value::String(s) => s
                .split(',')
                .filter_map(|part| part.trim().parse().ok())
                .collect(),
            other => to_i32(&other).into_iter().collect(),
        })
    }

    /// Array elements that deserialize as `T`; anything else is skipped.
    pub fn objects<'de, D, T>(d: D) -> Result<Vec<T>, D::Error>
    where
        D: Deserializer<'de>,
        T: DeserializeOwned,
    {
        let items = match Value::deserialize(d)? {
            Value::Array(items) => items,
            Value::Object(map) => map.into_iter().map(|(_, v)| v).collect(),
            _ => Vec::new(),
        };
        Ok(items
            .into_iter()
            .filter(Value::is_object)
            .filter_map(|item| serde_json::from_value(item).ok())
            .collect())
    }

    /// An object section, or the default when the field holds anything else.
    pub fn object<'de, D, T>(d: D) -> Result<T, D::Error>
    where
        D: Deserializer<'de>,
        T: DeserializeOwned + Default,
    {
        let value = Value::deserialize(d)?;
        if !value.is_object() {
            return Ok(T::default());
        }
        Ok(serde_json::from_value(value).unwrap_or_default())
    }
}
