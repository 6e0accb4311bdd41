use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use anyhow::anyhow;
use async_trait::async_trait;
use serde_json::{Value, json};
use stepwise_engine::{
    CacheConfig, CacheStatus, CachedSource, DriverControl, DriverEvent, DriverStatus, Engine, EngineConfig, FetchRequest,
    JsonFetcher, PipelineDriver, PipelineError, Step, builtin_resolvers,
};
use tokio::{
    runtime::Handle,
    sync::{Notify, mpsc},
    time::timeout,
};

/// Serves canned JSON per URL, each response held back until its gate opens.
struct GatedFetcher {
    responses: HashMap<String, Value>,
    gates: HashMap<String, Arc<Notify>>,
    calls: AtomicUsize,
}

impl GatedFetcher {
    fn new(responses: &[(&str, Value)]) -> Arc<Self> {
        Arc::new(Self {
            responses: responses.iter().map(|(url, value)| (url.to_string(), value.clone())).collect(),
            gates: responses.iter().map(|(url, _)| (url.to_string(), Arc::new(Notify::new()))).collect(),
            calls: AtomicUsize::new(0),
        })
    }

    fn release(&self, url: &str) {
        self.gates[url].notify_one();
    }
}

#[async_trait]
impl JsonFetcher for GatedFetcher {
    async fn fetch(&self, request: &FetchRequest) -> anyhow::Result<Value> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let gate = self.gates.get(&request.url).ok_or_else(|| anyhow!("HTTP 404 from {}", request.url))?;
        gate.notified().await;
        self.responses
            .get(&request.url)
            .cloned()
            .ok_or_else(|| anyhow!("HTTP 404 from {}", request.url))
    }
}

/// Answers every request immediately with the URL it was asked for.
#[derive(Default)]
struct EchoFetcher {
    calls: AtomicUsize,
}

#[async_trait]
impl JsonFetcher for EchoFetcher {
    async fn fetch(&self, request: &FetchRequest) -> anyhow::Result<Value> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(json!({ "url": request.url }))
    }
}

fn engine_with(fetcher: Arc<GatedFetcher>) -> Arc<Engine> {
    let source = CachedSource::new(fetcher, CacheConfig::default(), Handle::current());
    Arc::new(Engine::new(builtin_resolvers(), EngineConfig::default()).with_source(source))
}

fn fetch_step(url: &str) -> Step {
    Step::new("fetch").with_property("url", json!(url))
}

async fn next_event(events: &mut mpsc::UnboundedReceiver<DriverEvent>) -> DriverEvent {
    timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("driver event in time")
        .expect("driver still running")
}

#[tokio::test]
async fn suspended_run_reruns_when_the_fetch_settles() {
    let fetcher = GatedFetcher::new(&[("https://example.com/apps", json!({ "apps": ["api", "web"] }))]);
    let engine = engine_with(Arc::clone(&fetcher));
    let definition = vec![
        fetch_step("https://example.com/apps").with_property("placeholder", json!("loading apps")),
        Step::new("property").with_property("path", json!("apps[1]")),
    ];
    let (_control_tx, control_rx) = mpsc::unbounded_channel();
    let (event_tx, mut events) = mpsc::unbounded_channel();
    let driver = tokio::spawn(PipelineDriver::new(engine, definition).drive(control_rx, event_tx));

    assert!(matches!(next_event(&mut events).await, DriverEvent::RunStarted { generation: 1, .. }));
    assert_eq!(
        next_event(&mut events).await,
        DriverEvent::Suspended {
            generation: 1,
            awaiting: vec!["GET https://example.com/apps".to_string()],
            placeholder: Some(json!("loading apps")),
        }
    );

    fetcher.release("https://example.com/apps");

    assert!(matches!(next_event(&mut events).await, DriverEvent::RunStarted { generation: 2, .. }));
    assert_eq!(
        next_event(&mut events).await,
        DriverEvent::Rendered {
            generation: 2,
            value: json!("web"),
        }
    );
    assert!(matches!(
        next_event(&mut events).await,
        DriverEvent::Finished {
            generation: 2,
            status: DriverStatus::Completed,
            ..
        }
    ));
    assert_eq!(driver.await.expect("join"), DriverStatus::Completed);
    assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn completions_for_a_replaced_definition_are_discarded() {
    let fetcher = GatedFetcher::new(&[
        ("https://example.com/old", json!("old")),
        ("https://example.com/new", json!("new")),
    ]);
    let engine = engine_with(Arc::clone(&fetcher));
    let (control_tx, control_rx) = mpsc::unbounded_channel();
    let (event_tx, mut events) = mpsc::unbounded_channel();
    let driver = tokio::spawn(
        PipelineDriver::new(Arc::clone(&engine), vec![fetch_step("https://example.com/old")]).drive(control_rx, event_tx),
    );

    assert!(matches!(next_event(&mut events).await, DriverEvent::RunStarted { generation: 1, .. }));
    assert!(matches!(next_event(&mut events).await, DriverEvent::Suspended { generation: 1, .. }));

    control_tx
        .send(DriverControl::Replace(vec![fetch_step("https://example.com/new")]))
        .expect("send replace");
    assert!(matches!(next_event(&mut events).await, DriverEvent::RunStarted { generation: 2, .. }));
    assert!(matches!(
        next_event(&mut events).await,
        DriverEvent::Suspended { generation: 2, ref awaiting, .. } if awaiting == &["GET https://example.com/new".to_string()]
    ));

    fetcher.release("https://example.com/old");
    assert_eq!(
        next_event(&mut events).await,
        DriverEvent::StaleDiscarded {
            generation: 2,
            key: "GET https://example.com/old".to_string(),
        }
    );

    fetcher.release("https://example.com/new");
    assert!(matches!(next_event(&mut events).await, DriverEvent::RunStarted { generation: 3, .. }));
    assert_eq!(
        next_event(&mut events).await,
        DriverEvent::Rendered {
            generation: 3,
            value: json!("new"),
        }
    );
    assert!(matches!(next_event(&mut events).await, DriverEvent::Finished { generation: 3, .. }));
    assert_eq!(driver.await.expect("join"), DriverStatus::Completed);

    let source = engine.source().expect("source");
    assert_eq!(
        source.peek("GET https://example.com/old"),
        Some(CacheStatus::Complete(json!("old")))
    );
}

#[tokio::test]
async fn failed_fetch_surfaces_as_an_async_source_error() {
    let fetcher = GatedFetcher::new(&[]);
    let engine = engine_with(Arc::clone(&fetcher));
    let definition = [fetch_step("https://example.com/missing")];
    let source = engine.source().expect("source").clone();
    let mut settlements = source.subscribe();

    let first = engine.execute(&definition, Value::Null, None).expect("first run");
    assert!(!first.is_done());
    timeout(Duration::from_secs(5), settlements.recv())
        .await
        .expect("settled in time")
        .expect("event");

    let error = engine.execute(&definition, Value::Null, None).expect_err("failed entry");
    match error {
        PipelineError::AsyncSource { key, message } => {
            assert_eq!(key, "GET https://example.com/missing");
            assert!(message.contains("HTTP 404"), "unexpected message: {message}");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn pipeline_converges_when_it_needs_more_entries_than_the_cache_holds() {
    let fetcher = Arc::new(EchoFetcher::default());
    let config = CacheConfig {
        max_entries: 1,
        ..Default::default()
    };
    let source = CachedSource::new(fetcher.clone(), config, Handle::current());
    let engine = Arc::new(Engine::new(builtin_resolvers(), EngineConfig::default()).with_source(source));
    let definition = vec![
        fetch_step("https://example.com/a"),
        fetch_step("https://example.com/b"),
        fetch_step("https://example.com/c"),
    ];
    let (_control_tx, control_rx) = mpsc::unbounded_channel();
    let (event_tx, mut events) = mpsc::unbounded_channel();

    let status = timeout(
        Duration::from_secs(5),
        PipelineDriver::new(Arc::clone(&engine), definition)
            .with_max_runs(20)
            .drive(control_rx, event_tx),
    )
    .await
    .expect("driver finished in time");

    assert_eq!(status, DriverStatus::Completed);
    assert_eq!(fetcher.calls.load(Ordering::SeqCst), 3);
    let mut rendered = None;
    while let Ok(event) = events.try_recv() {
        if let DriverEvent::Rendered { value, .. } = event {
            rendered = Some(value);
        }
    }
    assert_eq!(rendered, Some(json!({ "url": "https://example.com/c" })));

    // The lease ends with the driver, so the cap applies again.
    assert_eq!(engine.source().expect("source").len(), 1);
}
