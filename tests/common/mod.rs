//! Shared test harness: a runner wired with a scripted provider, an
//! immediate cost fetcher, and a memory event sink, over a scratch DATA_DIR.

#![allow(dead_code)]

use std::sync::Arc;

use async_trait::async_trait;
use windlass::agent::{ChatProvider, ScriptedProvider, ScriptedReply};
use windlass::cascade::registry::Registries;
use windlass::cascade::spec::CascadeSpec;
use windlass::config::WindlassConfig;
use windlass::echo::{CostFetcher, CostUpdate, EchoError, EchoStore};
use windlass::events::{EventBus, MemorySink};
use windlass::runner::{CascadeRunner, RunnerParts};

/// Cost fetcher that reports fixed usage on the first poll.
pub struct ImmediateCostFetcher(pub CostUpdate);

#[async_trait]
impl CostFetcher for ImmediateCostFetcher {
    async fn fetch(&self, _request_id: &str) -> Result<Option<CostUpdate>, EchoError> {
        Ok(Some(self.0.clone()))
    }
}

pub fn default_cost_update() -> CostUpdate {
    CostUpdate {
        cost: Some(0.001),
        tokens_in: Some(100),
        tokens_out: Some(25),
        tokens_reasoning: None,
        provider: Some("test".to_string()),
    }
}

pub struct TestHarness {
    pub runner: Arc<CascadeRunner>,
    pub provider: Arc<ScriptedProvider>,
    pub events: MemorySink,
    tmp: tempfile::TempDir,
}

impl TestHarness {
    pub fn data_dir(&self) -> std::path::PathBuf {
        self.tmp.path().to_path_buf()
    }
}

/// Build a harness with scripted replies and default registries.
pub async fn harness(replies: Vec<ScriptedReply>) -> TestHarness {
    harness_with(replies, |_| {}).await
}

/// Build a harness, letting the caller register cascades and stages.
pub async fn harness_with(
    replies: Vec<ScriptedReply>,
    configure: impl FnOnce(&mut Registries),
) -> TestHarness {
    let tmp = tempfile::tempdir().expect("tempdir");
    let config = WindlassConfig {
        provider_base_url: "http://127.0.0.1:1/unused".to_string(),
        provider_api_key: String::new(),
        data_dir: tmp.path().to_path_buf(),
        deterministic_embeddings: true,
        heartbeat_lease_seconds: 60,
        ..WindlassConfig::default()
    };
    let pool = EchoStore::open_pool(&config.store_path())
        .await
        .expect("engine pool");

    let provider = Arc::new(ScriptedProvider::new(replies));
    let events = MemorySink::new();
    let bus = EventBus::with_sink(events.clone());

    let mut registries = Registries::new();
    configure(&mut registries);

    let runner = CascadeRunner::assemble(RunnerParts {
        config,
        pool,
        provider: provider.clone() as Arc<dyn ChatProvider>,
        cost_fetcher: Arc::new(ImmediateCostFetcher(default_cost_update())),
        bus,
        registries,
    });
    TestHarness {
        runner,
        provider,
        events,
        tmp,
    }
}

/// Parse a YAML cascade and panic on config errors.
pub fn spec(yaml: &str) -> CascadeSpec {
    let spec = CascadeSpec::from_yaml_str(yaml).expect("cascade yaml");
    spec.validate().expect("cascade validation");
    spec
}

/// Poll until `predicate` returns Some, or panic after ~2s.
pub async fn wait_for<T, F, Fut>(mut predicate: F) -> T
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Option<T>>,
{
    for _ in 0..200 {
        if let Some(value) = predicate().await {
            return value;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    panic!("condition not reached within timeout");
}
