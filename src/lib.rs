//! Resumable, backpressured bulk transfer from a search index to a log sink.
//!
//! Scrolls a search-index cluster with `search_after` pagination, groups
//! documents by label set, and pushes them to a Loki-style push API with a
//! single-writer worker and a durable checkpoint, so a transfer can be
//! restarted after a crash without losing its place.

pub mod batch;
pub mod checkpoint;
pub mod config;
pub mod error;
pub mod orchestrator;
pub mod proto;
pub mod retry;
pub mod sink;
pub mod source;
pub mod types;

pub use checkpoint::{CheckpointStore, DatabaseCheckpointStore, DummyCheckpointStore};
pub use config::{Config, ConfigError, PushMode, StateMode};
pub use error::TransferError;
pub use orchestrator::{ExitCode, LabelProjector, TimestampExtractor, TransferOrchestrator};
pub use retry::StopSignal;
pub use sink::SinkClient;
pub use source::{Scroller, SourceClient};
pub use types::{Entry, LabelSet, State};
