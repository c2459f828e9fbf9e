//! End-to-end tests for the runner control plane.
//!
//! A real controller (protocol listener, lifecycle loop, reconciler) runs
//! against an in-process launcher whose "runners" are tokio tasks speaking
//! the wire protocol through `RunnerClient`. These tests validate that:
//! - dispatch spawns runners on demand and releases in-flight slots
//! - sync runners never take two requests at once
//! - run-once runners are retired after their single request, even when
//!   the handler fails or times out
//! - an idle pool runner is reused while a concurrent request spawns
//! - a runner dying mid-request surfaces as a lost connection
//! - the key/value store and chunked payloads work across the socket
//! - a second `init` for a bound runner is rejected
//! - controller shutdown drains every runner

use async_trait::async_trait;
use bytes::Bytes;
use runner_controller::catalog::{Action, InMemoryActionStore, InMemoryKeyValueStore, RunnerMode};
use runner_controller::dispatch::{DispatchErrorKind, HandleReply, HttpRequest, HttpResponse, JobRequest};
use runner_controller::protocol::{JobHandler, RunnerClient, RunnerContext};
use runner_controller::runtime::{LaunchSpec, ProcessExit, ProcessHandle, RunnerLauncher, RunnerStatus};
use runner_controller::utils::config::ProtocolConfig;
use runner_controller::{Controller, ControllerConfig, Result};
use parking_lot::Mutex;
use serde_json::json;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

// ---------------------------------------------------------------------------
// In-process runners
// ---------------------------------------------------------------------------

/// Echoes HTTP bodies; `/slow` sleeps first, `/hang` outlives any test
/// timeout, `/fail` replies with an error, `/store` round-trips a value
struct EchoHandler;

#[async_trait]
impl JobHandler for EchoHandler {
    async fn handle(&self, request: JobRequest, ctx: RunnerContext) -> HandleReply {
        let JobRequest::Http(http) = request else {
            return HandleReply::default();
        };

        let body = match http.path.as_str() {
            "/slow" => {
                tokio::time::sleep(Duration::from_millis(300)).await;
                http.body
            }
            "/hang" => {
                tokio::time::sleep(Duration::from_secs(2)).await;
                http.body
            }
            "/fail" => return HandleReply::error("handler blew up"),
            "/store" => {
                if let Err(e) = ctx.store.set("visits", json!(41)).await {
                    return HandleReply::error(e.to_string());
                }
                match ctx.store.get("visits").await {
                    Ok(value) => value.map(|v| v.to_string()),
                    Err(e) => return HandleReply::error(e.to_string()),
                }
            }
            _ => http.body,
        };

        HandleReply {
            http: Some(HttpResponse {
                status: 200,
                headers: BTreeMap::new(),
                body,
            }),
            ..Default::default()
        }
    }
}

struct TaskHandle {
    cancel: CancellationToken,
}

impl ProcessHandle for TaskHandle {
    fn kill(&self) {
        self.cancel.cancel();
    }
}

#[derive(Default)]
struct InProcessLauncher {
    launched: AtomicUsize,
    handles: Mutex<HashMap<String, CancellationToken>>,
}

impl InProcessLauncher {
    /// Terminate a runner task as if its process crashed
    fn crash(&self, runner_id: &str) -> bool {
        match self.handles.lock().get(runner_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }
}

async fn run_runner(spec: &LaunchSpec) -> Result<()> {
    let addr = (spec.controller_host.as_str(), spec.controller_port);
    let mut client = RunnerClient::connect(addr, &spec.runner_id, ProtocolConfig::default()).await?;
    client.handshake().await?;
    client.serve(Arc::new(EchoHandler)).await
}

#[async_trait]
impl RunnerLauncher for InProcessLauncher {
    async fn launch(&self, spec: LaunchSpec) -> Result<Arc<dyn ProcessHandle>> {
        self.launched.fetch_add(1, Ordering::SeqCst);
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        self.handles.lock().insert(spec.runner_id.clone(), cancel.clone());

        tokio::spawn(async move {
            let code = tokio::select! {
                _ = token.cancelled() => None,
                result = run_runner(&spec) => Some(if result.is_ok() { 0 } else { 1 }),
            };
            let _ = spec.exits.send(ProcessExit {
                runner_id: spec.runner_id.clone(),
                code,
            });
        });

        Ok(Arc::new(TaskHandle { cancel }))
    }

    async fn list_workers(&self) -> Result<Vec<String>> {
        Ok(vec![])
    }

    async fn kill_worker(&self, _runner_id: &str) -> Result<()> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

struct Harness {
    controller: Controller,
    launcher: Arc<InProcessLauncher>,
    store: Arc<InMemoryKeyValueStore>,
}

fn action(id: &str, job_id: &str, mode: RunnerMode) -> Action {
    Action {
        id: id.to_string(),
        job_id: job_id.to_string(),
        runner_mode: mode,
        runner_min_count: 0,
        runner_max_count: 0,
        runner_asynchronous: false,
        runner_timeout: 5,
        runner_max_age: 0,
        runner_max_age_hard: 0,
        archive: format!("{}.tar", id),
    }
}

async fn start(actions: Vec<Action>) -> Harness {
    start_with(actions, |_| {}).await
}

async fn start_with(actions: Vec<Action>, tune: impl FnOnce(&mut ControllerConfig)) -> Harness {
    let mut config = ControllerConfig::default();
    config.server.port = 0;
    config.dispatch.ready_wait_secs = 5;
    config.reconcile.interval_ms = 100;
    config.reconcile.shutdown_grace_secs = 2;
    tune(&mut config);

    let store = InMemoryActionStore::new();
    for action in actions {
        store.publish(action, Bytes::from_static(b"archive"));
    }

    let launcher = Arc::new(InProcessLauncher::default());
    let kv = Arc::new(InMemoryKeyValueStore::new());
    let controller = Controller::start(config, launcher.clone(), Arc::new(store), kv.clone())
        .await
        .unwrap();

    Harness {
        controller,
        launcher,
        store: kv,
    }
}

fn http(path: &str, body: &str) -> JobRequest {
    JobRequest::Http(HttpRequest {
        method: "POST".to_string(),
        path: path.to_string(),
        headers: BTreeMap::new(),
        query: BTreeMap::new(),
        body: Some(body.to_string()),
    })
}

async fn eventually(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_first_dispatch_spawns_runner() {
    let h = start(vec![action("a1", "j1", RunnerMode::Standard)]).await;

    let response = h.controller.dispatch("j1", &http("/", "hello")).await;
    assert!(response.success, "dispatch failed: {:?}", response.error);
    assert!(response.duration >= 0);
    assert_eq!(response.http.unwrap().body.as_deref(), Some("hello"));

    let runners = h.controller.manager().registry().for_action("a1");
    assert!(!runners.is_empty());
    assert!(runners.iter().all(|r| r.requests_processing == 0));
    assert!(runners.iter().any(|r| r.status == RunnerStatus::Ready));

    h.controller.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_sync_runners_take_one_request_each() {
    let h = start(vec![action("a1", "j1", RunnerMode::Standard)]).await;

    let one = http("/slow", "one");
    let two = http("/slow", "two");
    let (first, second) = tokio::join!(h.controller.dispatch("j1", &one), h.controller.dispatch("j1", &two));
    assert!(first.success, "first failed: {:?}", first.error);
    assert!(second.success, "second failed: {:?}", second.error);
    assert!(h.launcher.launched.load(Ordering::SeqCst) >= 2);

    h.controller.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_run_once_runner_retired_after_request() {
    let h = start(vec![action("a1", "j1", RunnerMode::RunOnce)]).await;

    let response = h.controller.dispatch("j1", &http("/", "once")).await;
    assert!(response.success, "dispatch failed: {:?}", response.error);
    assert_eq!(h.launcher.launched.load(Ordering::SeqCst), 1);

    let registry = h.controller.manager().registry().clone();
    assert!(eventually(Duration::from_secs(3), || registry.is_empty()).await);
    assert!(h.controller.manager().hub().connections().is_empty());

    let again = h.controller.dispatch("j1", &http("/", "twice")).await;
    assert!(again.success);
    assert_eq!(h.launcher.launched.load(Ordering::SeqCst), 2);

    h.controller.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_on_demand_runners_survive_aggressive_scale_down() {
    // a short tick keeps the autoscaler retiring idle runners between rounds
    let h = start_with(vec![action("a1", "j1", RunnerMode::Standard)], |config| {
        config.reconcile.interval_ms = 20;
    })
    .await;

    for round in 0..20u64 {
        let one = http("/", "one");
        let two = http("/", "two");
        let (first, second) = tokio::join!(h.controller.dispatch("j1", &one), h.controller.dispatch("j1", &two));
        assert!(first.success, "round {} first failed: {:?}", round, first.error);
        assert!(second.success, "round {} second failed: {:?}", round, second.error);
        tokio::time::sleep(Duration::from_millis(round * 7 % 45)).await;
    }

    h.controller.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_idle_runner_reused_while_second_request_spawns() {
    // no autoscale ticks after startup, so the pool changes only through dispatch
    let h = start_with(vec![action("a1", "j1", RunnerMode::Standard)], |config| {
        config.reconcile.interval_ms = 60_000;
    })
    .await;

    let warm = h.controller.dispatch("j1", &http("/", "warm")).await;
    assert!(warm.success, "warm-up failed: {:?}", warm.error);
    assert_eq!(h.launcher.launched.load(Ordering::SeqCst), 1);
    let idle_id = h.controller.manager().registry().for_action("a1").remove(0).id;

    let one = http("/slow", "one");
    let two = http("/slow", "two");
    let (first, second) = tokio::join!(h.controller.dispatch("j1", &one), h.controller.dispatch("j1", &two));
    assert!(first.success, "first failed: {:?}", first.error);
    assert!(second.success, "second failed: {:?}", second.error);
    assert_eq!(h.launcher.launched.load(Ordering::SeqCst), 2);

    let runners = h.controller.manager().registry().for_action("a1");
    assert_eq!(runners.len(), 2);
    assert!(runners.iter().any(|r| r.id == idle_id));
    assert!(runners.iter().all(|r| r.requests_processing == 0 && !r.reserved));

    h.controller.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_run_once_runner_retired_after_handler_error() {
    let h = start(vec![action("a1", "j1", RunnerMode::RunOnce)]).await;

    let response = h.controller.dispatch("j1", &http("/fail", "")).await;
    assert!(!response.success);
    assert_eq!(response.error.as_deref(), Some("handler blew up"));
    assert_eq!(response.error_kind, None);

    let registry = h.controller.manager().registry().clone();
    assert!(eventually(Duration::from_secs(3), || registry.is_empty()).await);
    assert!(h.controller.manager().hub().connections().is_empty());

    h.controller.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_run_once_runner_retired_after_timeout() {
    let mut once = action("a1", "j1", RunnerMode::RunOnce);
    once.runner_timeout = 1;
    let h = start(vec![once]).await;

    let response = h.controller.dispatch("j1", &http("/hang", "")).await;
    assert!(!response.success);
    assert_eq!(response.error_kind, Some(DispatchErrorKind::Timeout));
    assert_eq!(response.duration, -1);

    // the runner drains its stuck request, then exits
    let registry = h.controller.manager().registry().clone();
    assert!(eventually(Duration::from_secs(5), || registry.is_empty()).await);
    assert!(h.controller.manager().hub().connections().is_empty());
    assert_eq!(h.launcher.launched.load(Ordering::SeqCst), 1);

    h.controller.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_runner_crash_mid_request_loses_connection() {
    let h = start_with(vec![action("a1", "j1", RunnerMode::Standard)], |config| {
        config.reconcile.interval_ms = 60_000;
    })
    .await;

    let warm = h.controller.dispatch("j1", &http("/", "warm")).await;
    assert!(warm.success, "warm-up failed: {:?}", warm.error);
    let runner_id = h.controller.manager().registry().for_action("a1").remove(0).id;

    let request = http("/hang", "doomed");
    let registry = h.controller.manager().registry().clone();
    let crash = async {
        let busy = eventually(Duration::from_secs(3), || {
            registry.get(&runner_id).map_or(false, |r| r.requests_processing == 1)
        })
        .await;
        assert!(busy, "request never reached the runner");
        assert!(h.launcher.crash(&runner_id));
    };
    let (response, ()) = tokio::join!(h.controller.dispatch("j1", &request), crash);

    assert!(!response.success);
    assert_eq!(response.error_kind, Some(DispatchErrorKind::ConnectionLost));
    assert!(eventually(Duration::from_secs(3), || !registry.contains(&runner_id)).await);

    h.controller.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_store_round_trip() {
    let h = start(vec![action("a1", "j1", RunnerMode::Standard)]).await;

    let response = h.controller.dispatch("j1", &http("/store", "")).await;
    assert!(response.success, "dispatch failed: {:?}", response.error);
    assert_eq!(response.http.unwrap().body.as_deref(), Some("41"));
    assert_eq!(h.store.len(), 1);

    h.controller.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_large_payload_round_trip() {
    let h = start(vec![action("a1", "j1", RunnerMode::Standard)]).await;

    let body: String = (0..5000).map(|i| char::from(b'a' + (i % 26) as u8)).collect();
    let response = h.controller.dispatch("j1", &http("/", &body)).await;
    assert!(response.success, "dispatch failed: {:?}", response.error);
    assert_eq!(response.http.unwrap().body, Some(body));

    h.controller.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_second_init_rejected() {
    let h = start(vec![action("a1", "j1", RunnerMode::Standard)]).await;

    let response = h.controller.dispatch("j1", &http("/", "x")).await;
    assert!(response.success);
    let runner = h.controller.manager().registry().for_action("a1").remove(0);

    let mut impostor = RunnerClient::connect(
        h.controller.local_addr(),
        &runner.id,
        ProtocolConfig::default(),
    )
    .await
    .unwrap();
    assert!(impostor.handshake().await.is_err());

    // the original runner keeps serving
    let response = h.controller.dispatch("j1", &http("/", "y")).await;
    assert!(response.success);

    h.controller.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_unknown_job() {
    let h = start(vec![]).await;

    let response = h.controller.dispatch("nope", &JobRequest::Schedule).await;
    assert!(!response.success);
    assert_eq!(response.duration, -1);
    assert_eq!(h.launcher.launched.load(Ordering::SeqCst), 0);

    h.controller.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_shutdown_drains_runners() {
    let mut pooled = action("a1", "j1", RunnerMode::Standard);
    pooled.runner_min_count = 2;
    let h = start(vec![pooled]).await;

    let registry = h.controller.manager().registry().clone();
    let ready = eventually(Duration::from_secs(5), || {
        registry
            .for_action("a1")
            .iter()
            .filter(|r| r.status == RunnerStatus::Ready)
            .count()
            >= 2
    })
    .await;
    assert!(ready, "min count never reached");

    let hub = h.controller.manager().hub().clone();
    h.controller.shutdown().await;
    assert!(registry.is_empty());
    assert!(hub.connections().is_empty());
}
