//! Lazy, prefetching `(document, state)` sequence over a search index.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::error::SourceError;
use crate::retry::{sleep_unless_stopped, StopSignal};
use crate::types::State;

use super::SourceClient;

/// A hit pulled from the source, paired with the cursor state it implies.
pub struct Document {
    pub source: Value,
    pub state: State,
}

struct Buffer {
    hits: VecDeque<Value>,
    cursor: Vec<Value>,
    exhausted: bool,
    refill: Option<JoinHandle<Result<Option<RefillResult>, SourceError>>>,
}

struct RefillResult {
    hits: Vec<Value>,
    next_cursor: Vec<Value>,
}

/// Produces documents in the order the source returns them under a fixed
/// sort, maintaining at most one in-flight refill and prefetching once the
/// buffer has drained below `2B/3`.
pub struct Scroller {
    client: SourceClient,
    index: String,
    batch_size: u64,
    sort: Value,
    timestamp_field: String,
    max_date: Option<String>,
    request_timeout: Duration,
    buffer: Mutex<Buffer>,
}

impl Scroller {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        client: SourceClient,
        index: impl Into<String>,
        batch_size: u64,
        sort: Value,
        initial_search_after: Vec<Value>,
        timestamp_field: impl Into<String>,
        max_date: Option<String>,
        request_timeout: Duration,
    ) -> Self {
        Self {
            client,
            index: index.into(),
            batch_size,
            sort,
            timestamp_field: timestamp_field.into(),
            max_date,
            request_timeout,
            buffer: Mutex::new(Buffer {
                hits: VecDeque::new(),
                cursor: initial_search_after,
                exhausted: false,
                refill: None,
            }),
        }
    }

    /// Queries `_count` with the scroller's max-date filter, retrying every
    /// ~1s until success or `stop` fires (returns 0 in that case).
    pub async fn count(&self, stop: &StopSignal) -> Result<u64, SourceError> {
        loop {
            if stop.is_set() {
                return Ok(0);
            }
            match self
                .client
                .count(&self.index, &self.timestamp_field, self.max_date.as_deref())
                .await
            {
                Ok(count) => return Ok(count),
                Err(err) if err.is_retryable() => {
                    warn!(error = %err, "count query failed, retrying");
                    if sleep_unless_stopped(stop, Duration::from_secs(1)).await.is_stopped() {
                        return Ok(0);
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Pop the next document, prefetching in the background as needed.
    /// Returns `None` once the source is exhausted or `stop` fires.
    pub async fn next(&self, stop: &StopSignal) -> Result<Option<Document>, SourceError> {
        loop {
            if stop.is_set() {
                return Ok(None);
            }

            let mut guard = self.buffer.lock().await;

            if guard.hits.is_empty() {
                if guard.exhausted {
                    return Ok(None);
                }

                self.await_or_start_refill(&mut guard, stop).await?;

                if guard.hits.is_empty() {
                    // Either exhausted, or the refill was cancelled by stop.
                    return Ok(None);
                }
            }

            let threshold = (self.batch_size * 2 / 3) as usize;
            if guard.hits.len() < threshold && guard.refill.is_none() && !guard.exhausted {
                self.spawn_refill(&mut guard, stop);
            }

            let hit = guard.hits.pop_front().expect("checked non-empty above");
            drop(guard);

            return Ok(Some(self.document_from_hit(hit)));
        }
    }

    fn document_from_hit(&self, hit: Value) -> Document {
        let source = hit.get("_source").cloned().unwrap_or(Value::Null);
        let timestamp = source
            .get(&self.timestamp_field)
            .and_then(Value::as_str)
            .map(str::to_string);
        let value = hit
            .get("sort")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        Document {
            source,
            state: State {
                timestamp,
                value,
                transferred: 0,
            },
        }
    }

    /// Wait for an in-flight refill to land, or run one synchronously if
    /// none is in flight (the foreground-refill path for an empty buffer).
    async fn await_or_start_refill(
        &self,
        guard: &mut Buffer,
        stop: &StopSignal,
    ) -> Result<(), SourceError> {
        if let Some(handle) = guard.refill.take() {
            match handle.await {
                Ok(Ok(Some(result))) => self.apply_refill(guard, result),
                Ok(Ok(None)) => { /* stop fired while the background refill was retrying */ }
                Ok(Err(err)) => return Err(err),
                Err(_) => { /* task was aborted or panicked; treat as empty */ }
            }
            return Ok(());
        }

        match self.fetch_with_retry(guard.cursor.clone(), stop).await? {
            Some(result) => self.apply_refill(guard, result),
            None => { /* stop fired mid-retry */ }
        }
        Ok(())
    }

    fn apply_refill(&self, guard: &mut Buffer, result: RefillResult) {
        if result.hits.is_empty() {
            guard.exhausted = true;
        } else {
            guard.hits.extend(result.hits);
            guard.cursor = result.next_cursor;
        }
    }

    /// Spawn the background prefetch. Runs through the same
    /// retry-until-success-or-stop loop as the foreground fetch
    /// ([`fetch_with_retry`](Self::fetch_with_retry)) — a transient failure
    /// here must not escape the spawned task and abort the transfer.
    fn spawn_refill(&self, guard: &mut Buffer, stop: &StopSignal) {
        let client = self.client.clone();
        let index = self.index.clone();
        let batch_size = self.batch_size;
        let sort = self.sort.clone();
        let timestamp_field = self.timestamp_field.clone();
        let max_date = self.max_date.clone();
        let request_timeout = self.request_timeout;
        let cursor = guard.cursor.clone();
        let stop = stop.clone();

        guard.refill = Some(tokio::spawn(async move {
            run_search_with_retry(
                &client,
                &index,
                batch_size,
                &sort,
                &cursor,
                &timestamp_field,
                max_date.as_deref(),
                request_timeout,
                &stop,
            )
            .await
        }));
    }

    /// Foreground fetch used when the buffer is empty and nothing is
    /// in-flight: retries transient failures every ~2s until success or stop.
    async fn fetch_with_retry(
        &self,
        cursor: Vec<Value>,
        stop: &StopSignal,
    ) -> Result<Option<RefillResult>, SourceError> {
        run_search_with_retry(
            &self.client,
            &self.index,
            self.batch_size,
            &self.sort,
            &cursor,
            &self.timestamp_field,
            self.max_date.as_deref(),
            self.request_timeout,
            stop,
        )
        .await
    }
}

/// Runs one search, retrying transient failures every ~2s until success or
/// `stop` fires (in which case `Ok(None)`). Shared by the foreground fetch
/// and the background prefetch task so neither can let a retryable error
/// escape unretried.
#[allow(clippy::too_many_arguments)]
async fn run_search_with_retry(
    client: &SourceClient,
    index: &str,
    batch_size: u64,
    sort: &Value,
    cursor: &[Value],
    timestamp_field: &str,
    max_date: Option<&str>,
    request_timeout: Duration,
    stop: &StopSignal,
) -> Result<Option<RefillResult>, SourceError> {
    loop {
        if stop.is_set() {
            return Ok(None);
        }

        match run_search(
            client,
            index,
            batch_size,
            sort,
            cursor,
            timestamp_field,
            max_date,
            request_timeout,
        )
        .await
        {
            Ok(result) => return Ok(Some(result)),
            Err(err) if err.is_retryable() => {
                warn!(error = %err, "scroller search failed, retrying");
                if sleep_unless_stopped(stop, Duration::from_secs(2))
                    .await
                    .is_stopped()
                {
                    return Ok(None);
                }
            }
            Err(err) => return Err(err),
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_search(
    client: &SourceClient,
    index: &str,
    batch_size: u64,
    sort: &Value,
    cursor: &[Value],
    timestamp_field: &str,
    max_date: Option<&str>,
    request_timeout: Duration,
) -> Result<RefillResult, SourceError> {
    let search_after = if cursor.is_empty() { None } else { Some(cursor) };
    let response = client
        .search(
            index,
            batch_size,
            sort,
            search_after,
            timestamp_field,
            max_date,
            request_timeout,
        )
        .await?;

    if let Some(err) = response.get("error") {
        return Err(SourceError::ResponseError(err.to_string()));
    }
    if response.get("timed_out").and_then(Value::as_bool) == Some(true) {
        return Err(SourceError::TimedOut);
    }

    let shards = response.get("_shards").cloned().unwrap_or(Value::Null);
    let total = shards.get("total").and_then(Value::as_u64).unwrap_or(0);
    let successful = shards.get("successful").and_then(Value::as_u64).unwrap_or(total);
    let failed = shards.get("failed").and_then(Value::as_u64).unwrap_or(0);
    let has_failures = shards
        .get("failures")
        .and_then(Value::as_array)
        .is_some_and(|f| !f.is_empty());

    if successful + failed < total || has_failures {
        return Err(SourceError::ShardFailure {
            total,
            successful,
            failed,
        });
    }

    let hits = response
        .get("hits")
        .and_then(|h| h.get("hits"))
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    let next_cursor = hits
        .last()
        .and_then(|h| h.get("sort"))
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_else(|| cursor.to_vec());

    Ok(RefillResult { hits, next_cursor })
}

#[allow(dead_code)]
fn assert_send_sync<T: Send + Sync>() {}

#[allow(dead_code)]
fn _scroller_is_send_sync() {
    assert_send_sync::<Arc<Scroller>>();
}
