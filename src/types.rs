//! Core types for the transfer engine: the scroll cursor and the label key.

use std::collections::BTreeMap;
use std::fmt;

/// Scroll cursor persisted between runs.
///
/// `value` is opaque: it is exactly what the source returned as a hit's
/// `sort` field, and is handed back verbatim as `search_after` on the next
/// query. It is never constructed from anything else.
///
/// A state is the *zero state* iff `timestamp` is `None` — there is no
/// separate sentinel string for "absent".
#[derive(Clone, Debug, Default, PartialEq)]
pub struct State {
    pub timestamp: Option<String>,
    pub value: Vec<serde_json::Value>,
    pub transferred: u64,
}

impl State {
    pub fn zero() -> Self {
        Self::default()
    }

    pub fn is_zero(&self) -> bool {
        self.timestamp.is_none()
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "State(ts={:?}, value={:?}, transferred={})",
            self.timestamp, self.value, self.transferred
        )
    }
}

/// An immutable string→string label mapping, used as a stream key.
///
/// Backed by a `BTreeMap` so that equality, hashing (via the derived `Hash`
/// on the sorted entries) and canonical iteration order all come for
/// free — the protobuf encoder's canonical `{k="v", ...}` string relies on
/// exactly this sorted order.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LabelSet(BTreeMap<String, String>);

impl LabelSet {
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Canonical protobuf label string: `{k="v", k2="v2"}`, keys sorted.
    ///
    /// `BTreeMap` iteration is already lexicographic by key, so this is
    /// just a formatting pass, not an actual sort.
    pub fn canonical_string(&self) -> String {
        let tokens: Vec<String> = self
            .0
            .iter()
            .map(|(k, v)| format!("{k}=\"{v}\""))
            .collect();
        format!("{{{}}}", tokens.join(", "))
    }
}

impl From<BTreeMap<String, String>> for LabelSet {
    fn from(map: BTreeMap<String, String>) -> Self {
        Self(map)
    }
}

impl FromIterator<(String, String)> for LabelSet {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// A single log line, derived from one source document.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Entry {
    pub timestamp_nanos: i64,
    pub line: String,
}

/// Convert a fractional-seconds timestamp into nanoseconds at millisecond
/// resolution: `floor(seconds * 1000) * 1_000_000`.
pub fn seconds_to_nanos(seconds: f64) -> i64 {
    ((seconds * 1000.0).floor() as i64) * 1_000_000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_state_has_no_timestamp() {
        assert!(State::zero().is_zero());
        let mut s = State::zero();
        s.timestamp = Some("2024-01-01T00:00:00Z".into());
        assert!(!s.is_zero());
    }

    #[test]
    fn canonical_label_string_sorts_keys() {
        let mut labels = LabelSet::new();
        labels.insert("job", "logs");
        labels.insert("env", "prod");
        assert_eq!(labels.canonical_string(), r#"{env="prod", job="logs"}"#);
    }

    #[test]
    fn millisecond_resolution_nanos() {
        let nanos = seconds_to_nanos(1_700_000_000.123_456);
        assert_eq!(nanos % 1_000_000, 0);
        assert_eq!(nanos, 1_700_000_000_123 * 1_000_000);
    }
}
