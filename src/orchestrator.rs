//! Wires the checkpoint store, scroller, batch buffer, and sink together:
//! the top-level state machine, the single-writer sink worker, progress/ETA
//! logging, and signal handling.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::batch::Batch;
use crate::checkpoint::CheckpointStore;
use crate::config::Config;
use crate::error::TransferError;
use crate::retry::{run_until_stopped, sleep_unless_stopped, Outcome, StopSignal};
use crate::sink::SinkClient;
use crate::source::{Document, Scroller, SourceClient};
use crate::types::{seconds_to_nanos, LabelSet, State};

/// Projects a source document onto the sink's label space. User-supplied.
///
/// Any `Fn(&Value) -> Option<LabelSet> + Send + Sync` implements this
/// directly, so a plain closure can be boxed into an `Arc<dyn
/// LabelProjector>` without a wrapper type.
pub trait LabelProjector: Send + Sync {
    /// Return `None` to skip the document entirely.
    fn project(&self, document: &Value) -> Option<LabelSet>;
}

impl<F> LabelProjector for F
where
    F: Fn(&Value) -> Option<LabelSet> + Send + Sync,
{
    fn project(&self, document: &Value) -> Option<LabelSet> {
        self(document)
    }
}

/// Extracts the fractional-seconds timestamp from a source document.
/// User-supplied; same closure-friendly shape as [`LabelProjector`].
pub trait TimestampExtractor: Send + Sync {
    /// Return `None` to skip the document entirely.
    fn extract(&self, document: &Value) -> Option<f64>;
}

impl<F> TimestampExtractor for F
where
    F: Fn(&Value) -> Option<f64> + Send + Sync,
{
    fn extract(&self, document: &Value) -> Option<f64> {
        self(document)
    }
}

/// Reads a nested string field by path, e.g. `json_str_at(doc, &["_source",
/// "kubernetes", "namespace"])`. A small helper for custom projectors that
/// need to reach into arbitrary document shapes.
pub fn json_str_at<'a>(value: &'a Value, path: &[&str]) -> Option<&'a str> {
    let mut current = value;
    for segment in path {
        current = current.get(segment)?;
    }
    current.as_str()
}

/// Process exit codes per the documented contract.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExitCode {
    Success = 0,
    Error = 1,
    DrainTimeout = 2,
    ForcedShutdown = 3,
}

struct ProgressTracker {
    total: u64,
    transferred: Arc<AtomicU64>,
    started_at: Instant,
    window_start: Instant,
    window_transferred: u64,
}

impl ProgressTracker {
    fn new(total: u64, transferred: Arc<AtomicU64>) -> Self {
        let window_transferred = transferred.load(Ordering::Relaxed);
        Self {
            total,
            transferred,
            started_at: Instant::now(),
            window_start: Instant::now(),
            window_transferred,
        }
    }

    fn tick(&mut self) {
        let now_transferred = self.transferred.load(Ordering::Relaxed);
        let elapsed = self.window_start.elapsed().as_secs_f64();
        let speed = if elapsed > 0.0 {
            (now_transferred.saturating_sub(self.window_transferred)) as f64 / elapsed
        } else {
            0.0
        };
        let remaining = self.total.saturating_sub(now_transferred);
        let eta_secs = if speed > 0.0 { remaining as f64 / speed } else { 0.0 };
        let pct = if self.total > 0 {
            (now_transferred as f64 / self.total as f64) * 100.0
        } else {
            100.0
        };

        info!(
            transferred = now_transferred,
            total = self.total,
            pct = format!("{:.1}", pct),
            speed_per_sec = format!("{:.1}", speed),
            eta_secs = format!("{:.0}", eta_secs),
            elapsed_secs = self.started_at.elapsed().as_secs(),
            "transfer progress"
        );

        self.window_start = Instant::now();
        self.window_transferred = now_transferred;
    }
}

struct SinkJob {
    batch: Batch,
    latest_state: State,
    /// Set only for the drain phase's trailing flush: a batch handed to the
    /// sink worker after a graceful stop has already fired, which must
    /// still be attempted once rather than bailing on `stop.is_set()`.
    final_flush: bool,
}

/// Runs the full transfer: Init -> Connect -> Count -> Stream -> Drain ->
/// Shutdown.
pub struct TransferOrchestrator {
    config: Config,
    checkpoint: Arc<dyn CheckpointStore>,
    source: SourceClient,
    sink: SinkClient,
    label_projector: Arc<dyn LabelProjector>,
    timestamp_extractor: Arc<dyn TimestampExtractor>,
}

impl TransferOrchestrator {
    pub fn new(
        config: Config,
        checkpoint: Arc<dyn CheckpointStore>,
        source: SourceClient,
        sink: SinkClient,
        label_projector: Arc<dyn LabelProjector>,
        timestamp_extractor: Arc<dyn TimestampExtractor>,
    ) -> Self {
        Self {
            config,
            checkpoint,
            source,
            sink,
            label_projector,
            timestamp_extractor,
        }
    }

    pub async fn run(&self) -> Result<ExitCode, TransferError> {
        let stop = StopSignal::new();
        let signal_task = spawn_signal_listener(stop.clone());

        let outcome = self.run_with(&stop).await;

        signal_task.abort();

        outcome
    }

    /// Runs the transfer against a caller-supplied stop signal, without
    /// installing the process-wide OS signal listener. `run` uses this
    /// internally; it is also the seam a caller drives shutdown through
    /// directly (tests, or an embedder with its own signal plumbing).
    ///
    /// A second stop (`stop.force()`) is a hard escape hatch: it races
    /// against the whole transfer — including an already-started drain or a
    /// stuck sink push — and wins immediately, skipping drain and cleanup
    /// entirely rather than merely changing the exit code reported at the
    /// end.
    pub async fn run_with(&self, stop: &StopSignal) -> Result<ExitCode, TransferError> {
        let outcome = tokio::select! {
            _ = stop.wait_forced() => Ok(ExitCode::ForcedShutdown),
            result = self.run_inner(stop) => result,
        };

        match outcome {
            Ok(code) => Ok(code),
            Err(err) => {
                error!(error = %err, "transfer failed");
                Err(err)
            }
        }
    }

    async fn run_inner(&self, stop: &StopSignal) -> Result<ExitCode, TransferError> {
        // -- Connect --
        self.checkpoint.init(stop).await?;
        if stop.is_set() {
            return Ok(ExitCode::ForcedShutdown);
        }
        if self.config.checkpoint.start_over {
            self.checkpoint.cleanup().await?;
        }
        let initial_state = self.checkpoint.load().await?;
        let scroller = Arc::new(self.build_scroller(&initial_state));

        // -- Count --
        let total = scroller.count(stop).await?;
        if total == 0 {
            info!("source index has no matching documents, nothing to transfer");
            return Ok(ExitCode::Success);
        }

        // -- Stream --
        let transferred = Arc::new(AtomicU64::new(initial_state.transferred));

        let (tx, rx) = mpsc::channel::<SinkJob>(self.config.sink.pool_load_factor);
        let worker = self.spawn_sink_worker(rx, Arc::clone(&transferred), stop.clone());

        let eta_task = self.spawn_eta_ticker(total, Arc::clone(&transferred), stop.clone());

        let current_batch = Mutex::new(Batch::new());
        let mut latest_state: Option<State> = None;

        loop {
            if stop.is_set() {
                break;
            }

            let doc = match run_until_stopped(stop, scroller.next(stop)).await {
                Outcome::Stopped => break,
                Outcome::Completed(Ok(None)) => break,
                Outcome::Completed(Ok(Some(doc))) => doc,
                Outcome::Completed(Err(err)) => return Err(err.into()),
            };

            if let Some(job) = self.project_and_push(doc, &current_batch).await? {
                latest_state = Some(job.state_snapshot());
                if job.should_flush {
                    self.flush(&current_batch, job.state, &tx, stop).await?;
                }
            }
        }

        // -- Drain --
        let drain_result = self
            .drain(&current_batch, latest_state, &tx, stop)
            .await;

        drop(tx);
        eta_task.abort();

        let wait_result = match self.config.execute_timeout {
            Some(timeout) => tokio::time::timeout(timeout, worker).await,
            None => Ok(worker.await),
        };

        match wait_result {
            Err(_) => return Ok(ExitCode::DrainTimeout),
            Ok(Err(join_err)) => {
                error!(error = %join_err, "sink worker task panicked");
                return Err(TransferError::Config("sink worker task panicked".to_string()));
            }
            Ok(Ok(Err(err))) => return Err(err),
            Ok(Ok(Ok(()))) => {}
        }

        drain_result?;

        if stop.forced() {
            Ok(ExitCode::ForcedShutdown)
        } else {
            Ok(ExitCode::Success)
        }
    }

    fn build_scroller(&self, initial_state: &State) -> Scroller {
        let mut sort_field = serde_json::Map::new();
        sort_field.insert(
            self.config.source.timestamp_field.clone(),
            Value::String("asc".to_string()),
        );
        let sort = Value::Array(vec![Value::Object(sort_field)]);

        Scroller::new(
            self.source.clone(),
            self.config.source.index.clone(),
            self.config.source.batch_size,
            sort,
            initial_state.value.clone(),
            self.config.source.timestamp_field.clone(),
            self.config.source.max_date.clone(),
            self.config.source.timeout,
        )
    }

    async fn project_and_push(
        &self,
        doc: Document,
        current_batch: &Mutex<Batch>,
    ) -> Result<Option<ProjectedPush>, TransferError> {
        let labels = match self.label_projector.project(&doc.source) {
            Some(labels) => labels,
            None => return Ok(None),
        };
        let seconds = match self.timestamp_extractor.extract(&doc.source) {
            Some(seconds) => seconds,
            None => return Ok(None),
        };

        let line = serde_json::to_string(&sorted_keys(&doc.source))
            .map_err(|e| TransferError::Config(format!("failed to serialize document: {e}")))?;
        let timestamp_nanos = seconds_to_nanos(seconds);

        let should_flush = {
            let mut batch = current_batch.lock().await;
            batch.push(labels, timestamp_nanos, line);
            batch.total_size() >= self.config.sink.batch_bytes
        };

        Ok(Some(ProjectedPush {
            state: doc.state,
            should_flush,
        }))
    }

    async fn flush(
        &self,
        current_batch: &Mutex<Batch>,
        state: State,
        tx: &mpsc::Sender<SinkJob>,
        stop: &StopSignal,
    ) -> Result<(), TransferError> {
        let batch = {
            let mut guard = current_batch.lock().await;
            std::mem::take(&mut *guard)
        };
        if batch.is_empty() {
            return Ok(());
        }

        let job = SinkJob {
            batch,
            latest_state: state,
            final_flush: false,
        };

        if run_until_stopped(stop, tx.send(job)).await.is_stopped() {
            return Ok(());
        }
        Ok(())
    }

    async fn drain(
        &self,
        current_batch: &Mutex<Batch>,
        latest_state: Option<State>,
        tx: &mpsc::Sender<SinkJob>,
        stop: &StopSignal,
    ) -> Result<(), TransferError> {
        let remaining = {
            let mut guard = current_batch.lock().await;
            std::mem::take(&mut *guard)
        };

        if !remaining.is_empty() {
            if let Some(state) = latest_state {
                let job = SinkJob {
                    batch: remaining,
                    latest_state: state,
                    final_flush: true,
                };
                let _ = tx.send(job).await;
            }
        }
        let _ = stop;
        Ok(())
    }

    fn spawn_sink_worker(
        &self,
        mut rx: mpsc::Receiver<SinkJob>,
        transferred: Arc<AtomicU64>,
        stop: StopSignal,
    ) -> JoinHandle<Result<(), TransferError>> {
        let sink = self.sink.clone();
        let checkpoint = Arc::clone(&self.checkpoint);
        let wait_timeout = self.config.sink.wait_timeout;

        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                let streams = job.batch.streams_count();
                let docs = job.batch.total_docs();
                let pre_size = job.batch.total_size();

                let (status, post_size) = if job.final_flush {
                    sink.push_final(&job.batch).await?
                } else {
                    sink.push(&job.batch, &stop).await?
                };

                let mut state = job.latest_state;
                state.transferred = transferred.fetch_add(docs as u64, Ordering::Relaxed) + docs as u64;
                checkpoint.save(&state).await?;

                info!(
                    streams,
                    docs,
                    pre_size,
                    post_size,
                    status,
                    transferred = state.transferred,
                    "batch pushed"
                );

                if !wait_timeout.is_zero() {
                    sleep_unless_stopped(&stop, wait_timeout).await;
                }
            }
            Ok(())
        })
    }

    fn spawn_eta_ticker(
        &self,
        total: u64,
        transferred: Arc<AtomicU64>,
        stop: StopSignal,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut tracker = ProgressTracker::new(total, transferred);
            loop {
                if sleep_unless_stopped(&stop, Duration::from_secs(10)).await.is_stopped() {
                    break;
                }
                tracker.tick();
            }
        })
    }
}

struct ProjectedPush {
    state: State,
    should_flush: bool,
}

impl ProjectedPush {
    fn state_snapshot(&self) -> State {
        self.state.clone()
    }
}

fn sorted_keys(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let sorted: std::collections::BTreeMap<String, Value> = map
                .iter()
                .map(|(k, v)| (k.clone(), sorted_keys(v)))
                .collect();
            serde_json::to_value(sorted).unwrap_or(Value::Null)
        }
        Value::Array(items) => Value::Array(items.iter().map(sorted_keys).collect()),
        other => other.clone(),
    }
}

fn spawn_signal_listener(stop: StopSignal) -> JoinHandle<()> {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigint = match signal(SignalKind::interrupt()) {
                Ok(s) => s,
                Err(_) => return,
            };
            let mut sigterm = match signal(SignalKind::terminate()) {
                Ok(s) => s,
                Err(_) => return,
            };

            tokio::select! {
                _ = sigint.recv() => {},
                _ = sigterm.recv() => {},
            }
            stop.fire();

            tokio::select! {
                _ = sigint.recv() => {},
                _ = sigterm.recv() => {},
            }
            stop.force();
        }

        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
            stop.fire();
            let _ = tokio::signal::ctrl_c().await;
            stop.force();
        }
    })
}
