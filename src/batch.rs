//! In-memory grouping of entries by label set until a byte threshold fires.

use std::collections::HashMap;

use crate::proto::{Entry as ProtoEntry, PushRequest, StreamAdapter, Timestamp};
use crate::types::{Entry, LabelSet};

/// A frozen group of entries sharing one [`LabelSet`], plus the accumulated
/// batch of such groups.
#[derive(Default)]
pub struct Batch {
    streams: HashMap<LabelSet, Vec<Entry>>,
    total_size: usize,
}

impl Batch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one entry, grouping by `labels`. Allocates a fresh stream the
    /// first time a given label set is seen.
    pub fn push(&mut self, labels: LabelSet, timestamp_nanos: i64, line: String) {
        self.total_size += line.len();
        self.streams
            .entry(labels)
            .or_default()
            .push(Entry { timestamp_nanos, line });
    }

    pub fn streams_count(&self) -> usize {
        self.streams.len()
    }

    pub fn total_docs(&self) -> usize {
        self.streams.values().map(Vec::len).sum()
    }

    pub fn total_size(&self) -> usize {
        self.total_size
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    /// `{"streams": [{"stream": <labels>, "values": [["<nanos>", <line>], ...]}, ...]}`
    pub fn encode_json(&self) -> Vec<u8> {
        let streams: Vec<serde_json::Value> = self
            .streams
            .iter()
            .map(|(labels, entries)| {
                let stream_labels: serde_json::Map<String, serde_json::Value> = labels
                    .iter()
                    .map(|(k, v)| (k.to_string(), serde_json::Value::String(v.to_string())))
                    .collect();
                let values: Vec<serde_json::Value> = entries
                    .iter()
                    .map(|e| {
                        serde_json::json!([e.timestamp_nanos.to_string(), e.line])
                    })
                    .collect();
                serde_json::json!({
                    "stream": stream_labels,
                    "values": values,
                })
            })
            .collect();

        let body = serde_json::json!({ "streams": streams });
        serde_json::to_vec(&body).expect("JSON value serialization is infallible")
    }

    /// `PushRequest { streams: [StreamAdapter { labels, entries }] }`,
    /// ready for the caller to compress (snappy) or not.
    pub fn encode_protobuf(&self) -> PushRequest {
        let streams = self
            .streams
            .iter()
            .map(|(labels, entries)| StreamAdapter {
                labels: labels.canonical_string(),
                entries: entries
                    .iter()
                    .map(|e| ProtoEntry {
                        timestamp: Some(Timestamp::from_nanos(e.timestamp_nanos)),
                        line: e.line.clone(),
                    })
                    .collect(),
            })
            .collect();

        PushRequest { streams }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> LabelSet {
        let mut l = LabelSet::new();
        for (k, v) in pairs {
            l.insert(*k, *v);
        }
        l
    }

    #[test]
    fn push_groups_by_label_set() {
        let mut batch = Batch::new();
        batch.push(labels(&[("job", "a")]), 1, "one".into());
        batch.push(labels(&[("job", "a")]), 2, "two".into());
        batch.push(labels(&[("job", "b")]), 3, "three".into());

        assert_eq!(batch.streams_count(), 2);
        assert_eq!(batch.total_docs(), 3);
        assert_eq!(batch.total_size(), "one".len() + "two".len() + "three".len());
    }

    #[test]
    fn json_encoding_has_decimal_string_nanos() {
        let mut batch = Batch::new();
        batch.push(labels(&[("job", "a")]), 1_700_000_000_000_000_000, "line".into());
        let encoded = batch.encode_json();
        let value: serde_json::Value = serde_json::from_slice(&encoded).unwrap();
        let ts = value["streams"][0]["values"][0][0].as_str().unwrap();
        assert_eq!(ts, "1700000000000000000");
    }

    #[test]
    fn protobuf_encoding_uses_canonical_label_string() {
        let mut batch = Batch::new();
        batch.push(labels(&[("job", "logs"), ("env", "prod")]), 1, "x".into());
        let req = batch.encode_protobuf();
        assert_eq!(req.streams.len(), 1);
        assert_eq!(req.streams[0].labels, r#"{env="prod", job="logs"}"#);
    }
}
