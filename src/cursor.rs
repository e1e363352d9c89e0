//! The keyset cursor: an opaque ordered key-tuple marking "first row not yet
//! scanned" (spec §3 "Cursor").

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// An ordered key-tuple. Each element is a JSON scalar taken from the
/// configured sort-column(s) of the source table, compared componentwise in
/// declaration order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cursor(pub Vec<serde_json::Value>);

impl Cursor {
    pub fn new(key: Vec<serde_json::Value>) -> Self {
        Self(key)
    }

    /// Componentwise comparison over the leading sort keys. `Value` doesn't
    /// implement `Ord` (floats), so we compare the JSON representations the
    /// way the source adapter produces them: numbers numerically, strings
    /// lexicographically, and treat a length mismatch as a logic error
    /// (cursors are always produced by the same scan for a given table).
    pub fn keyset_cmp(&self, other: &Cursor) -> Ordering {
        for (a, b) in self.0.iter().zip(other.0.iter()) {
            match cmp_value(a, b) {
                Ordering::Equal => continue,
                ord => return ord,
            }
        }
        self.0.len().cmp(&other.0.len())
    }

    pub fn is_strictly_before(&self, other: &Cursor) -> bool {
        self.keyset_cmp(other) == Ordering::Less
    }
}

fn cmp_value(a: &serde_json::Value, b: &serde_json::Value) -> Ordering {
    use serde_json::Value as V;
    match (a, b) {
        (V::Number(x), V::Number(y)) => x
            .as_f64()
            .unwrap_or(f64::NAN)
            .partial_cmp(&y.as_f64().unwrap_or(f64::NAN))
            .unwrap_or(Ordering::Equal),
        (V::String(x), V::String(y)) => x.cmp(y),
        (V::Bool(x), V::Bool(y)) => x.cmp(y),
        _ => Ordering::Equal,
    }
}

/// A primary-key tuple. Kept separate from `Cursor` even though both are
/// ordered JSON scalar vectors: the cursor marks scan position over the
/// sort column(s), the PK tuple identifies a row and may cover different
/// columns entirely.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PrimaryKey(pub Vec<String>);

impl PrimaryKey {
    pub fn new(parts: Vec<String>) -> Self {
        Self(parts)
    }
}
