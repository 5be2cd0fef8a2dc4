//! Process entry point: load config, init logging, run the transfer, map
//! the result to an exit code.

use std::sync::Arc;

use chrono::DateTime;
use index_transfer::{
    CheckpointStore, Config, DatabaseCheckpointStore, DummyCheckpointStore, ExitCode,
    LabelProjector, SinkClient, SourceClient, StateMode, TimestampExtractor, TransferOrchestrator,
};
use serde_json::Value;
use tracing_subscriber::fmt::time::UtcTime;

/// Groups every document into a single stream keyed by the source index
/// name. Replace with a custom [`LabelProjector`] for per-field routing.
struct SingleStreamProjector {
    job: String,
}

impl LabelProjector for SingleStreamProjector {
    fn project(&self, _document: &Value) -> Option<index_transfer::LabelSet> {
        let mut labels = index_transfer::LabelSet::new();
        labels.insert("job", self.job.clone());
        Some(labels)
    }
}

/// Parses the configured timestamp field as RFC3339 and returns fractional
/// seconds since the epoch. Skips documents with a missing or unparsable
/// timestamp.
struct Rfc3339TimestampExtractor {
    field: String,
}

impl TimestampExtractor for Rfc3339TimestampExtractor {
    fn extract(&self, document: &Value) -> Option<f64> {
        let raw = document.get(&self.field)?.as_str()?;
        let parsed = DateTime::parse_from_rfc3339(raw).ok()?;
        Some(parsed.timestamp() as f64 + parsed.timestamp_subsec_nanos() as f64 / 1e9)
    }
}

fn init_logging() {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_timer(UtcTime::rfc_3339())
        .with_thread_ids(false)
        .with_thread_names(false)
        .init();
}

#[tokio::main]
async fn main() {
    let config = match Config::from_env() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("configuration error: {err}");
            std::process::exit(ExitCode::Error as i32);
        }
    };

    init_logging();

    let source = match SourceClient::builder()
        .hosts(config.source.hosts.clone())
        .basic_auth(config.source.user.clone(), config.source.password.clone())
        .timeout(config.source.timeout)
        .build()
    {
        Ok(client) => client,
        Err(err) => {
            tracing::error!(error = %err, "failed to build source client");
            std::process::exit(ExitCode::Error as i32);
        }
    };

    let sink = match SinkClient::new(
        config.sink.url.clone(),
        config.sink.username.clone(),
        config.sink.password.clone(),
        config.sink.tenant_id.clone(),
        config.sink.push_mode,
        config.dry_run,
    ) {
        Ok(client) => client,
        Err(err) => {
            tracing::error!(error = %err, "failed to build sink client");
            std::process::exit(ExitCode::Error as i32);
        }
    };

    let checkpoint: Arc<dyn CheckpointStore> = if config.dry_run || config.checkpoint.mode == StateMode::None {
        Arc::new(DummyCheckpointStore::new(config.source.index.clone()))
    } else {
        let db_url = config
            .checkpoint
            .db_url
            .clone()
            .expect("Config::from_env validates STATE_DB_URL is set when STATE_MODE=db");
        Arc::new(DatabaseCheckpointStore::new(config.source.index.clone(), db_url))
    };

    let label_projector = Arc::new(SingleStreamProjector {
        job: config.source.index.clone(),
    });
    let timestamp_extractor = Arc::new(Rfc3339TimestampExtractor {
        field: config.source.timestamp_field.clone(),
    });

    let orchestrator = TransferOrchestrator::new(
        config,
        checkpoint,
        source,
        sink,
        label_projector,
        timestamp_extractor,
    );

    let exit_code = match orchestrator.run().await {
        Ok(code) => code,
        Err(_) => ExitCode::Error,
    };

    std::process::exit(exit_code as i32);
}
