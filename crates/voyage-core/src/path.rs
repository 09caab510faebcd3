//! Feed directory convention: `/YYYY/MM/<lineId>/<shipId>/<cruiseId>.json`.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{LineId, ShipId};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PathError {
    #[error("feed path `{0}` does not have five segments")]
    Shape(String),
    #[error("feed path `{path}` has an invalid {segment}")]
    Segment { path: String, segment: &'static str },
}

pub fn month_dir(year: i32, month: u32) -> String {
    format!("/{year:04}/{month:02}")
}

pub fn line_dir(year: i32, month: u32, line_id: LineId) -> String {
    format!("{}/{line_id}", month_dir(year, month))
}

pub fn ship_dir(year: i32, month: u32, line_id: LineId, ship_id: ShipId) -> String {
    format!("{}/{ship_id}", line_dir(year, month, line_id))
}

pub fn feed_path(year: i32, month: u32, line_id: LineId, ship_id: ShipId, cruise_id: i64) -> String {
    format!("{}/{cruise_id}.json", ship_dir(year, month, line_id, ship_id))
}

/// One document location in the feed tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CruiseRef {
    pub year: i32,
    pub month: u32,
    pub line_id: LineId,
    pub ship_id: ShipId,
    pub cruise_id: i64,
}

impl CruiseRef {
    pub fn path(&self) -> String {
        feed_path(self.year, self.month, self.line_id, self.ship_id, self.cruise_id)
    }

    /// Accepts paths with or without the leading slash.
    pub fn parse(path: &str) -> Result<Self, PathError> {
        let segments: Vec<&str> = path.trim().trim_start_matches('/').split('/').collect();
        let [year, month, line, ship, file] = segments.as_slice() else {
            return Err(PathError::Shape(path.to_string()));
        };
        let bad = |segment: &'static str| PathError::Segment {
            path: path.to_string(),
            segment,
        };

        let year: i32 = year.parse().map_err(|_| bad("year"))?;
        let month: u32 = month
            .parse()
            .ok()
            .filter(|m| (1..=12).contains(m))
            .ok_or_else(|| bad("month"))?;
        let line_id: LineId = line.parse().map_err(|_| bad("line id"))?;
        let ship_id: ShipId = ship.parse().map_err(|_| bad("ship id"))?;
        let cruise_id: i64 = file
            .strip_suffix(".json")
            .ok_or_else(|| bad("file name"))?
            .parse()
            .map_err(|_| bad("cruise id"))?;

        Ok(Self {
            year,
            month,
            line_id,
            ship_id,
            cruise_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_fixed_directory_convention() {
        assert_eq!(feed_path(2025, 5, 22, 231, 8734921), "/2025/05/22/231/8734921.json");
        assert_eq!(line_dir(2026, 11, 7), "/2026/11/7");
    }

    #[test]
    fn parse_is_inverse_of_path() {
        let cref = CruiseRef::parse("2025/05/22/231/8734921.json").unwrap();
        assert_eq!(
            cref,
            CruiseRef {
                year: 2025,
                month: 5,
                line_id: 22,
                ship_id: 231,
                cruise_id: 8734921,
            }
        );
        assert_eq!(cref.path(), "/2025/05/22/231/8734921.json");
    }

    #[test]
    fn rejects_malformed_paths() {
        assert!(matches!(CruiseRef::parse("/2025/05/22/231"), Err(PathError::Shape(_))));
        assert!(matches!(
            CruiseRef::parse("/2025/13/22/231/1.json"),
            Err(PathError::Segment { segment: "month", .. })
        ));
        assert!(matches!(
            CruiseRef::parse("/2025/05/22/231/1.xml"),
            Err(PathError::Segment { segment: "file name", .. })
        ));
    }
}
