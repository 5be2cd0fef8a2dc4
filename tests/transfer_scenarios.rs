//! End-to-end scenarios against a mocked search-index source and a mocked
//! Loki-style sink. Each test drives the public API the binary itself uses
//! (`SourceClient`, `Scroller`, `SinkClient`, `TransferOrchestrator`) rather
//! than reaching into internals.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use index_transfer::config::{CheckpointConfig, Config, SinkConfig, SourceConfig};
use index_transfer::error::CheckpointError;
use index_transfer::retry::run_until_stopped;
use index_transfer::source::Scroller;
use index_transfer::{
    CheckpointStore, DummyCheckpointStore, ExitCode, LabelProjector, LabelSet, PushMode,
    SinkClient, SourceClient, State, StateMode, StopSignal, TimestampExtractor,
    TransferOrchestrator,
};
use serde_json::{json, Value};
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

const INDEX: &str = "test-index";

/// Replays a fixed list of responses in call order, repeating the last one
/// for any call past the end of the list.
struct Sequence {
    calls: AtomicUsize,
    responses: Vec<ResponseTemplate>,
}

impl Sequence {
    fn new(responses: Vec<ResponseTemplate>) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            responses,
        }
    }
}

impl Respond for Sequence {
    fn respond(&self, _request: &Request) -> ResponseTemplate {
        let idx = self.calls.fetch_add(1, Ordering::SeqCst);
        self.responses
            .get(idx)
            .or_else(|| self.responses.last())
            .cloned()
            .expect("Sequence must be constructed with at least one response")
    }
}

/// Records every request body it receives, then always answers 204.
struct Recorder {
    bodies: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl Respond for Recorder {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        self.bodies.lock().unwrap().push(request.body.clone());
        ResponseTemplate::new(204)
    }
}

/// Replays a fixed list of responses in call order like [`Sequence`], but
/// fires a [`StopSignal`] as a side effect of serving one specific call —
/// lets a test pin exactly when stop fires relative to an in-flight request
/// without a real signal or a timing-based sleep.
struct FireOnCall {
    target_call: usize,
    calls: AtomicUsize,
    stop: StopSignal,
    responses: Vec<ResponseTemplate>,
}

impl Respond for FireOnCall {
    fn respond(&self, _request: &Request) -> ResponseTemplate {
        let idx = self.calls.fetch_add(1, Ordering::SeqCst);
        if idx == self.target_call {
            self.stop.fire();
        }
        self.responses
            .get(idx)
            .or_else(|| self.responses.last())
            .cloned()
            .expect("FireOnCall must be constructed with at least one response")
    }
}

/// A checkpoint store that loads a fixed, caller-supplied state and records
/// every save, instead of the always-zero [`DummyCheckpointStore`].
struct FixedCheckpointStore {
    initial: State,
    saved: Mutex<Vec<State>>,
}

impl FixedCheckpointStore {
    fn new(initial: State) -> Self {
        Self {
            initial,
            saved: Mutex::new(Vec::new()),
        }
    }

    fn last_saved(&self) -> State {
        self.saved
            .lock()
            .unwrap()
            .last()
            .cloned()
            .expect("save was never called")
    }
}

#[async_trait]
impl CheckpointStore for FixedCheckpointStore {
    async fn init(&self, _stop: &StopSignal) -> Result<(), CheckpointError> {
        Ok(())
    }

    async fn load(&self) -> Result<State, CheckpointError> {
        Ok(self.initial.clone())
    }

    async fn save(&self, state: &State) -> Result<(), CheckpointError> {
        self.saved.lock().unwrap().push(state.clone());
        Ok(())
    }

    async fn cleanup(&self) -> Result<(), CheckpointError> {
        Ok(())
    }
}

fn hit(timestamp: &str, sort: i64, fields: Value) -> Value {
    let mut source = json!({ "@timestamp": timestamp });
    source
        .as_object_mut()
        .unwrap()
        .extend(fields.as_object().cloned().unwrap_or_default());
    json!({ "_source": source, "sort": [sort] })
}

fn search_response(hits: Vec<Value>) -> Value {
    json!({
        "_shards": { "total": 1, "successful": 1, "failed": 0 },
        "hits": { "hits": hits },
    })
}

fn shard_failure_response() -> Value {
    json!({
        "_shards": { "total": 2, "successful": 1, "failed": 1 },
        "hits": { "hits": [] },
    })
}

async fn mount_count(server: &MockServer, count: u64) {
    Mock::given(method("GET"))
        .and(path(format!("/{INDEX}/_count")))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "count": count })))
        .mount(server)
        .await;
}

fn sort_by_timestamp() -> Value {
    json!([{ "@timestamp": "asc" }])
}

fn build_source_client(es_uri: &str) -> SourceClient {
    SourceClient::builder()
        .hosts(vec![es_uri.to_string()])
        .basic_auth(None, None)
        .timeout(Duration::from_secs(5))
        .build()
        .expect("source client builds with a valid URI")
}

fn build_config(es_uri: &str, loki_uri: &str, batch_size: u64, batch_bytes: usize) -> Config {
    Config {
        dry_run: false,
        source: SourceConfig {
            hosts: vec![es_uri.to_string()],
            user: None,
            password: None,
            index: INDEX.to_string(),
            batch_size,
            timeout: Duration::from_secs(5),
            max_date: None,
            timestamp_field: "@timestamp".to_string(),
        },
        sink: SinkConfig {
            url: loki_uri.to_string(),
            username: None,
            password: None,
            tenant_id: None,
            batch_bytes,
            pool_load_factor: 4,
            push_mode: PushMode::Json,
            wait_timeout: Duration::from_secs(0),
        },
        checkpoint: CheckpointConfig {
            mode: StateMode::None,
            db_url: None,
            start_over: false,
        },
        execute_timeout: None,
    }
}

fn single_stream_projector() -> Arc<dyn LabelProjector> {
    Arc::new(|_doc: &Value| {
        let mut labels = LabelSet::new();
        labels.insert("job", INDEX);
        Some(labels)
    })
}

fn rfc3339_extractor() -> Arc<dyn TimestampExtractor> {
    Arc::new(|doc: &Value| {
        let raw = doc.get("@timestamp")?.as_str()?;
        let parsed = chrono::DateTime::parse_from_rfc3339(raw).ok()?;
        Some(parsed.timestamp() as f64 + parsed.timestamp_subsec_nanos() as f64 / 1e9)
    })
}

/// Scenario 1: a fresh run against a tiny index transfers every document and
/// exits successfully, with no prior checkpoint.
#[tokio::test]
async fn fresh_tiny_run_transfers_all_documents() {
    let es = MockServer::start().await;
    let loki = MockServer::start().await;

    mount_count(&es, 2).await;
    Mock::given(method("POST"))
        .and(path(format!("/{INDEX}/_search")))
        .respond_with(Sequence::new(vec![
            ResponseTemplate::new(200).set_body_json(search_response(vec![
                hit("2024-01-01T00:00:00Z", 1, json!({"msg": "one"})),
                hit("2024-01-01T00:00:01Z", 2, json!({"msg": "two"})),
            ])),
            ResponseTemplate::new(200).set_body_json(search_response(vec![])),
        ]))
        .mount(&es)
        .await;

    let bodies = Arc::new(Mutex::new(Vec::new()));
    Mock::given(method("POST"))
        .and(path("/loki/api/v1/push"))
        .respond_with(Recorder {
            bodies: Arc::clone(&bodies),
        })
        .mount(&loki)
        .await;

    let config = build_config(&es.uri(), &loki.uri(), 10, 1024 * 1024);
    let source = build_source_client(&es.uri());
    let sink = SinkClient::new(loki.uri(), None, None, None, PushMode::Json, false).unwrap();
    let checkpoint: Arc<dyn CheckpointStore> = Arc::new(DummyCheckpointStore::new(INDEX));

    let orchestrator = TransferOrchestrator::new(
        config,
        checkpoint,
        source,
        sink,
        single_stream_projector(),
        rfc3339_extractor(),
    );

    let exit_code = tokio::time::timeout(Duration::from_secs(10), orchestrator.run())
        .await
        .expect("orchestrator should finish well within the test timeout")
        .expect("transfer should not error");

    assert_eq!(exit_code, ExitCode::Success);

    let pushed = bodies.lock().unwrap();
    assert_eq!(pushed.len(), 1, "both documents should fit in one drained batch");
    let parsed: Value = serde_json::from_slice(&pushed[0]).unwrap();
    let values = parsed["streams"][0]["values"].as_array().unwrap();
    assert_eq!(values.len(), 2);
}

/// Scenario 2: resuming from a saved cursor sends that cursor as
/// `search_after` and only transfers documents past it.
#[tokio::test]
async fn resume_sends_the_saved_cursor_and_advances_transferred_count() {
    let es = MockServer::start().await;
    let loki = MockServer::start().await;

    mount_count(&es, 5).await;

    Mock::given(method("POST"))
        .and(path(format!("/{INDEX}/_search")))
        .and(body_partial_json(json!({ "search_after": [1] })))
        .respond_with(ResponseTemplate::new(200).set_body_json(search_response(vec![hit(
            "2024-01-01T00:00:01Z",
            2,
            json!({"msg": "second"}),
        )])))
        .mount(&es)
        .await;

    Mock::given(method("POST"))
        .and(path(format!("/{INDEX}/_search")))
        .and(body_partial_json(json!({ "search_after": [2] })))
        .respond_with(ResponseTemplate::new(200).set_body_json(search_response(vec![])))
        .mount(&es)
        .await;

    Mock::given(method("POST"))
        .and(path("/loki/api/v1/push"))
        .respond_with(ResponseTemplate::new(204))
        .mount(&loki)
        .await;

    let config = build_config(&es.uri(), &loki.uri(), 10, 1024 * 1024);
    let source = build_source_client(&es.uri());
    let sink = SinkClient::new(loki.uri(), None, None, None, PushMode::Json, false).unwrap();

    let initial = State {
        timestamp: Some("2024-01-01T00:00:00Z".to_string()),
        value: vec![json!(1)],
        transferred: 1,
    };
    let checkpoint = Arc::new(FixedCheckpointStore::new(initial));
    let checkpoint_dyn: Arc<dyn CheckpointStore> = checkpoint.clone();

    let orchestrator = TransferOrchestrator::new(
        config,
        checkpoint_dyn,
        source,
        sink,
        single_stream_projector(),
        rfc3339_extractor(),
    );

    let exit_code = tokio::time::timeout(Duration::from_secs(10), orchestrator.run())
        .await
        .expect("orchestrator should finish well within the test timeout")
        .expect("transfer should not error");

    assert_eq!(exit_code, ExitCode::Success);
    assert_eq!(checkpoint.last_saved().transferred, 2);
}

/// Scenario 3: the sink rejects the first push with a 500 and succeeds on
/// retry; the transfer still completes and the checkpoint still advances.
#[tokio::test]
async fn sink_retries_after_a_500_then_succeeds() {
    let es = MockServer::start().await;
    let loki = MockServer::start().await;

    mount_count(&es, 1).await;
    Mock::given(method("POST"))
        .and(path(format!("/{INDEX}/_search")))
        .respond_with(Sequence::new(vec![
            ResponseTemplate::new(200).set_body_json(search_response(vec![hit(
                "2024-01-01T00:00:00Z",
                1,
                json!({"msg": "one"}),
            )])),
            ResponseTemplate::new(200).set_body_json(search_response(vec![])),
        ]))
        .mount(&es)
        .await;

    Mock::given(method("POST"))
        .and(path("/loki/api/v1/push"))
        .respond_with(Sequence::new(vec![
            ResponseTemplate::new(500).set_body_string("internal error"),
            ResponseTemplate::new(204),
        ]))
        .mount(&loki)
        .await;

    let config = build_config(&es.uri(), &loki.uri(), 10, 1024 * 1024);
    let source = build_source_client(&es.uri());
    let sink = SinkClient::new(loki.uri(), None, None, None, PushMode::Json, false).unwrap();
    let checkpoint = Arc::new(FixedCheckpointStore::new(State::zero()));
    let checkpoint_dyn: Arc<dyn CheckpointStore> = checkpoint.clone();

    let orchestrator = TransferOrchestrator::new(
        config,
        checkpoint_dyn,
        source,
        sink,
        single_stream_projector(),
        rfc3339_extractor(),
    );

    // The sink's retry delay is a fixed 2s sleep, so allow enough headroom.
    let exit_code = tokio::time::timeout(Duration::from_secs(10), orchestrator.run())
        .await
        .expect("orchestrator should finish well within the test timeout")
        .expect("transfer should not error");

    assert_eq!(exit_code, ExitCode::Success);
    assert_eq!(checkpoint.last_saved().transferred, 1);
}

/// Scenario 4: firing the stop signal while a scroll request is in flight
/// interrupts it immediately rather than waiting for the request to finish.
#[tokio::test]
async fn stop_signal_interrupts_an_in_flight_scroll_request() {
    let es = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path(format!("/{INDEX}/_search")))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(search_response(vec![hit(
                    "2024-01-01T00:00:00Z",
                    1,
                    json!({}),
                )]))
                .set_delay(Duration::from_secs(2)),
        )
        .mount(&es)
        .await;

    let client = build_source_client(&es.uri());
    let scroller = Scroller::new(
        client,
        INDEX,
        10,
        sort_by_timestamp(),
        vec![],
        "@timestamp",
        None,
        Duration::from_secs(5),
    );

    let stop = StopSignal::new();
    let stop_clone = stop.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        stop_clone.fire();
    });

    let outcome = tokio::time::timeout(
        Duration::from_millis(500),
        run_until_stopped(&stop, scroller.next(&stop)),
    )
    .await
    .expect("stop should interrupt the in-flight request well before it would finish");

    assert!(outcome.is_stopped());
}

/// Scenario 5: a shard-partial-failure response is retried and the scroller
/// recovers once the source returns a clean page.
#[tokio::test]
async fn shard_partial_failure_is_retried_then_succeeds() {
    let es = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path(format!("/{INDEX}/_search")))
        .respond_with(Sequence::new(vec![
            ResponseTemplate::new(200).set_body_json(shard_failure_response()),
            ResponseTemplate::new(200).set_body_json(search_response(vec![hit(
                "2024-01-01T00:00:00Z",
                1,
                json!({"msg": "recovered"}),
            )])),
        ]))
        .mount(&es)
        .await;

    let client = build_source_client(&es.uri());
    let scroller = Scroller::new(
        client,
        INDEX,
        10,
        sort_by_timestamp(),
        vec![],
        "@timestamp",
        None,
        Duration::from_secs(5),
    );

    let stop = StopSignal::new();
    // The scroller's retry delay on a retryable source error is a fixed 2s
    // sleep, so allow enough headroom for exactly one retry.
    let doc = tokio::time::timeout(Duration::from_secs(6), scroller.next(&stop))
        .await
        .expect("scroller should recover well within the test timeout")
        .expect("shard failure is retryable, not a hard error")
        .expect("the retried page has a document");

    assert_eq!(doc.source["msg"], "recovered");
}

/// Scenario 6: documents the label projector skips never reach the sink.
#[tokio::test]
async fn label_projector_skips_documents_that_return_none() {
    let es = MockServer::start().await;
    let loki = MockServer::start().await;

    mount_count(&es, 2).await;
    Mock::given(method("POST"))
        .and(path(format!("/{INDEX}/_search")))
        .respond_with(Sequence::new(vec![
            ResponseTemplate::new(200).set_body_json(search_response(vec![
                hit("2024-01-01T00:00:00Z", 1, json!({"skip": true, "msg": "dropped"})),
                hit("2024-01-01T00:00:01Z", 2, json!({"msg": "kept"})),
            ])),
            ResponseTemplate::new(200).set_body_json(search_response(vec![])),
        ]))
        .mount(&es)
        .await;

    let bodies = Arc::new(Mutex::new(Vec::new()));
    Mock::given(method("POST"))
        .and(path("/loki/api/v1/push"))
        .respond_with(Recorder {
            bodies: Arc::clone(&bodies),
        })
        .mount(&loki)
        .await;

    let config = build_config(&es.uri(), &loki.uri(), 10, 1024 * 1024);
    let source = build_source_client(&es.uri());
    let sink = SinkClient::new(loki.uri(), None, None, None, PushMode::Json, false).unwrap();
    let checkpoint: Arc<dyn CheckpointStore> = Arc::new(DummyCheckpointStore::new(INDEX));

    let skip_flagged: Arc<dyn LabelProjector> = Arc::new(|doc: &Value| {
        if doc.get("skip").and_then(Value::as_bool) == Some(true) {
            return None;
        }
        let mut labels = LabelSet::new();
        labels.insert("job", INDEX);
        Some(labels)
    });

    let orchestrator = TransferOrchestrator::new(
        config,
        checkpoint,
        source,
        sink,
        skip_flagged,
        rfc3339_extractor(),
    );

    let exit_code = tokio::time::timeout(Duration::from_secs(10), orchestrator.run())
        .await
        .expect("orchestrator should finish well within the test timeout")
        .expect("transfer should not error");

    assert_eq!(exit_code, ExitCode::Success);

    let pushed = bodies.lock().unwrap();
    assert_eq!(pushed.len(), 1);
    let parsed: Value = serde_json::from_slice(&pushed[0]).unwrap();
    let values = parsed["streams"][0]["values"].as_array().unwrap();
    assert_eq!(values.len(), 1, "the skipped document must not appear in the pushed batch");
    assert_eq!(values[0][1], json!("{\"@timestamp\":\"2024-01-01T00:00:01Z\",\"msg\":\"kept\"}"));
}

/// Scenario 7: a plain stop that fires while the second scroll request is in
/// flight still drains the partial batch accumulated so far, through the
/// orchestrator's actual drain path, and reports success.
#[tokio::test]
async fn graceful_stop_mid_scroll_still_drains_the_partial_batch_with_exit_zero() {
    let es = MockServer::start().await;
    let loki = MockServer::start().await;

    mount_count(&es, 5).await;

    let stop = StopSignal::new();

    Mock::given(method("POST"))
        .and(path(format!("/{INDEX}/_search")))
        .respond_with(FireOnCall {
            target_call: 1,
            calls: AtomicUsize::new(0),
            stop: stop.clone(),
            responses: vec![
                ResponseTemplate::new(200).set_body_json(search_response(vec![hit(
                    "2024-01-01T00:00:00Z",
                    1,
                    json!({"msg": "first"}),
                )])),
                ResponseTemplate::new(200).set_body_json(search_response(vec![hit(
                    "2024-01-01T00:00:01Z",
                    2,
                    json!({"msg": "second"}),
                )])),
            ],
        })
        .mount(&es)
        .await;

    let bodies = Arc::new(Mutex::new(Vec::new()));
    Mock::given(method("POST"))
        .and(path("/loki/api/v1/push"))
        .respond_with(Recorder {
            bodies: Arc::clone(&bodies),
        })
        .mount(&loki)
        .await;

    // batch_size 1 keeps the scroller's prefetch threshold at zero, so every
    // document goes through a synchronous foreground fetch and the stop
    // lands deterministically on the second `_search` call.
    let config = build_config(&es.uri(), &loki.uri(), 1, 1024 * 1024);
    let source = build_source_client(&es.uri());
    let sink = SinkClient::new(loki.uri(), None, None, None, PushMode::Json, false).unwrap();
    let checkpoint: Arc<dyn CheckpointStore> = Arc::new(DummyCheckpointStore::new(INDEX));

    let orchestrator = TransferOrchestrator::new(
        config,
        checkpoint,
        source,
        sink,
        single_stream_projector(),
        rfc3339_extractor(),
    );

    let exit_code = tokio::time::timeout(Duration::from_secs(10), orchestrator.run_with(&stop))
        .await
        .expect("orchestrator should finish well within the test timeout")
        .expect("transfer should not error");

    assert_eq!(
        exit_code,
        ExitCode::Success,
        "a plain stop mid-scroll must still drain the pending batch and report success"
    );

    let pushed = bodies.lock().unwrap();
    assert_eq!(
        pushed.len(),
        1,
        "the partial batch accumulated before stop fired must still be flushed"
    );
    let parsed: Value = serde_json::from_slice(&pushed[0]).unwrap();
    let values = parsed["streams"][0]["values"].as_array().unwrap();
    assert_eq!(values.len(), 1);
    assert_eq!(
        values[0][1],
        json!("{\"@timestamp\":\"2024-01-01T00:00:00Z\",\"msg\":\"first\"}")
    );
}

/// Scenario 8: a forced (second) stop pre-empts a hung sink push instead of
/// waiting for it, and reports the forced exit code without running drain.
#[tokio::test]
async fn forced_stop_skips_drain_and_a_hung_push() {
    let es = MockServer::start().await;
    let loki = MockServer::start().await;

    mount_count(&es, 1).await;
    Mock::given(method("POST"))
        .and(path(format!("/{INDEX}/_search")))
        .respond_with(Sequence::new(vec![
            ResponseTemplate::new(200).set_body_json(search_response(vec![hit(
                "2024-01-01T00:00:00Z",
                1,
                json!({"msg": "one"}),
            )])),
            ResponseTemplate::new(200).set_body_json(search_response(vec![])),
        ]))
        .mount(&es)
        .await;

    Mock::given(method("POST"))
        .and(path("/loki/api/v1/push"))
        .respond_with(ResponseTemplate::new(204).set_delay(Duration::from_secs(5)))
        .mount(&loki)
        .await;

    // batch_bytes 0 forces an immediate flush after the first document, so
    // the sink worker is already mid-push against the delayed mock by the
    // time the forced stop arrives.
    let config = build_config(&es.uri(), &loki.uri(), 10, 0);
    let source = build_source_client(&es.uri());
    let sink = SinkClient::new(loki.uri(), None, None, None, PushMode::Json, false).unwrap();
    let checkpoint: Arc<dyn CheckpointStore> = Arc::new(DummyCheckpointStore::new(INDEX));

    let orchestrator = TransferOrchestrator::new(
        config,
        checkpoint,
        source,
        sink,
        single_stream_projector(),
        rfc3339_extractor(),
    );

    let stop = StopSignal::new();
    let stop_clone = stop.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(150)).await;
        stop_clone.force();
    });

    let exit_code = tokio::time::timeout(Duration::from_secs(1), orchestrator.run_with(&stop))
        .await
        .expect("a forced stop must pre-empt a hung push instead of waiting out its delay")
        .expect("transfer should not error");

    assert_eq!(exit_code, ExitCode::ForcedShutdown);
}
