//! Feed document parsing, corruption repair, price reconciliation and normalization.

use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::warn;

pub mod document;
pub mod normalize;
pub mod pricing;

pub use document::{FeedAltSailing, FeedDocument, FeedItineraryEntry, MatrixCell};
pub use normalize::{Normalizer, ValidationError};
pub use pricing::{classify_cabin, PricingRules, DEFAULT_SCALE_FACTOR};

pub const CRATE_NAME: &str = "voyage-feed";

/// Diagnostic detail for a document whose stored form could not be rebuilt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorruptionReport {
    pub indices: usize,
    pub reconstructed_len: usize,
    pub reason: String,
}

impl std::fmt::Display for CorruptionReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} indices, {} bytes rebuilt, {}",
            self.indices, self.reconstructed_len, self.reason
        )
    }
}

#[derive(Debug, Error)]
pub enum DocumentError {
    #[error("document is not valid JSON: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("character-indexed document could not be rebuilt: {0}")]
    Corrupt(CorruptionReport),
    #[error("document root is {0}, expected an object")]
    NotAnObject(&'static str),
}

/// How a document had to be repaired before it could be read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Repair {
    /// Stored as a JSON string holding the JSON text.
    DoubleEncoded,
    /// Stored as `{"0": "{", "1": "\"", ...}`, one character per index.
    CharIndexed { indices: usize, reconstructed_len: usize },
}

/// A downloaded (or stored) document after repair, with its typed view.
#[derive(Debug, Clone)]
pub struct ParsedDocument {
    pub path: String,
    pub raw: Value,
    pub doc: FeedDocument,
    pub repair: Option<Repair>,
    /// SHA-256 hex of the canonical serialization of `raw`.
    pub content_hash: String,
}

impl ParsedDocument {
    pub fn from_bytes(path: impl Into<String>, bytes: &[u8]) -> Result<Self, DocumentError> {
        let value: Value = serde_json::from_slice(bytes)?;
        Self::from_value(path, value)
    }

    pub fn from_value(path: impl Into<String>, value: Value) -> Result<Self, DocumentError> {
        let path = path.into();
        let (raw, repair) = repair_document(value)?;
        if let Some(repair) = repair {
            warn!(%path, ?repair, "repaired corrupted feed document");
        }
        let doc: FeedDocument = serde_json::from_value(raw.clone())?;
        let content_hash = content_hash(&raw);
        Ok(Self {
            path,
            raw,
            doc,
            repair,
            content_hash,
        })
    }
}

pub fn content_hash(value: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(value.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

/// Undo the known storage defects and return an object-rooted document.
pub fn repair_document(value: Value) -> Result<(Value, Option<Repair>), DocumentError> {
    match value {
        Value::Object(map) if is_char_indexed(&map) => {
            let (text, indices) = reconstruct_char_indexed(&map);
            let reconstructed_len = text.len();
            let corrupt = |reason: String| {
                DocumentError::Corrupt(CorruptionReport {
                    indices,
                    reconstructed_len,
                    reason,
                })
            };
            let inner: Value = serde_json::from_str(&text).map_err(|e| corrupt(e.to_string()))?;
            if !inner.is_object() {
                return Err(corrupt(format!("rebuilt text is {}", kind(&inner))));
            }
            Ok((
                inner,
                Some(Repair::CharIndexed {
                    indices,
                    reconstructed_len,
                }),
            ))
        }
        Value::Object(map) => Ok((Value::Object(map), None)),
        Value::String(text) => match serde_json::from_str::<Value>(&text)? {
            inner @ Value::Object(_) => {
                let (inner, nested) = repair_document(inner)?;
                Ok((inner, nested.or(Some(Repair::DoubleEncoded))))
            }
            other => Err(DocumentError::NotAnObject(kind(&other))),
        },
        other => Err(DocumentError::NotAnObject(kind(&other))),
    }
}

fn is_char_indexed(map: &Map<String, Value>) -> bool {
    ["0", "1"]
        .iter()
        .all(|k| map.get(*k).is_some_and(Value::is_string))
}

/// Concatenate indices `0..n` until the first gap or non-string entry.
fn reconstruct_char_indexed(map: &Map<String, Value>) -> (String, usize) {
    let mut text = String::with_capacity(map.len());
    let mut indices = 0usize;
    while let Some(Value::String(piece)) = map.get(&indices.to_string()) {
        text.push_str(piece);
        indices += 1;
    }
    (text, indices)
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// The character-indexed form the storage defect produces for `value`.
pub fn char_indexed(value: &Value) -> Value {
    let text = value.to_string();
    Value::Object(
        text.chars()
            .enumerate()
            .map(|(i, c)| (i.to_string(), Value::String(c.to_string())))
            .collect(),
    )
}
