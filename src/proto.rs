//! Hand-derived `prost::Message` types for the sink's protobuf push mode.
//!
//! There is no `.proto` source for this message set in reach of this crate,
//! so these are written directly with `prost`'s derive macro rather than
//! generated by `prost-build` — a supported way to use the crate when you
//! already know the wire shape.

use prost::Message;

#[derive(Clone, PartialEq, Message)]
pub struct PushRequest {
    #[prost(message, repeated, tag = "1")]
    pub streams: Vec<StreamAdapter>,
}

#[derive(Clone, PartialEq, Message)]
pub struct StreamAdapter {
    #[prost(string, tag = "1")]
    pub labels: String,
    #[prost(message, repeated, tag = "2")]
    pub entries: Vec<Entry>,
}

#[derive(Clone, PartialEq, Message)]
pub struct Entry {
    #[prost(message, optional, tag = "1")]
    pub timestamp: Option<Timestamp>,
    #[prost(string, tag = "2")]
    pub line: String,
}

#[derive(Clone, Copy, PartialEq, Message)]
pub struct Timestamp {
    #[prost(int64, tag = "1")]
    pub seconds: i64,
    #[prost(int32, tag = "2")]
    pub nanos: i32,
}

impl Timestamp {
    pub fn from_nanos(timestamp_nanos: i64) -> Self {
        Self {
            seconds: timestamp_nanos.div_euclid(1_000_000_000),
            nanos: timestamp_nanos.rem_euclid(1_000_000_000) as i32,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamp_splits_seconds_and_nanos() {
        let ts = Timestamp::from_nanos(1_700_000_000_123_000_000);
        assert_eq!(ts.seconds, 1_700_000_000);
        assert_eq!(ts.nanos, 123_000_000);
    }

    #[test]
    fn push_request_round_trips_through_protobuf_bytes() {
        let req = PushRequest {
            streams: vec![StreamAdapter {
                labels: r#"{job="logs"}"#.to_string(),
                entries: vec![Entry {
                    timestamp: Some(Timestamp::from_nanos(1)),
                    line: "hello".to_string(),
                }],
            }],
        };

        let bytes = req.encode_to_vec();
        let decoded = PushRequest::decode(bytes.as_slice()).unwrap();
        assert_eq!(decoded, req);
    }
}
