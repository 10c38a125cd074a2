use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode, header};
use chrono::{TimeDelta, Utc};
use httpmock::Method::POST;
use httpmock::MockServer;
use sandbox::{
    ExecRequest, ExecutionResult, ExecutionWorker, LanguageProfile, Outcome, Phase,
    ResourceLimits, WorkerFactory,
};
use sandbox_process::{ProcessConfig, ProcessFactory, missing_programs};
use sandboxd::audit::AuditHook;
use sandboxd::config::{AuditConfig, SandboxConfig};
use sandboxd::languages::LanguageRegistry;
use sandboxd::limiter::ExecutionLimiter;
use sandboxd::orchestrator::{OrchestratorParts, Policy};
use sandboxd::reaper::ExpiryReaper;
use sandboxd::registry::ContainerRegistry;
use sandboxd::status::StatusTracker;
use sandboxd::storage::ScratchStorage;
use sandboxd::types::SandboxState;
use sandboxd::{SandboxOrchestrator, ServiceError, SubmissionRouter, api};
use serde_json::{Value, json};
use tokio::sync::{Notify, Semaphore};
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn shell_profile(id: &str, wall_clock_ms: u64, max_output_bytes: usize) -> LanguageProfile {
    LanguageProfile {
        language_id: id.into(),
        aliases: vec![],
        file_extension: ".sh".into(),
        compile_command: None,
        run_command: vec!["sh".into(), "{source}".into()],
        limits: ResourceLimits {
            cpu_ms: 5_000,
            memory_mb: 256,
            wall_clock_ms,
            max_output_bytes,
        },
        compile_wall_clock_ms: None,
    }
}

/// Worker that blocks until the test releases it (or the run is cancelled)
/// and records how many runs overlapped.
struct Gate {
    release: Semaphore,
    started: Notify,
    active: AtomicUsize,
    peak: AtomicUsize,
}

impl Default for Gate {
    fn default() -> Self {
        Self {
            release: Semaphore::new(0),
            started: Notify::new(),
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }
}

impl Gate {
    fn open(&self, runs: usize) {
        self.release.add_permits(runs);
    }

    async fn wait_started(&self) {
        tokio::time::timeout(Duration::from_secs(5), self.started.notified())
            .await
            .unwrap();
    }
}

struct GatedWorker(Arc<Gate>);

#[async_trait]
impl ExecutionWorker for GatedWorker {
    fn name(&self) -> &str {
        "gated"
    }

    async fn run(&self, request: &ExecRequest<'_>) -> sandbox::Result<ExecutionResult> {
        let gate = &self.0;
        let active = gate.active.fetch_add(1, Ordering::SeqCst) + 1;
        gate.peak.fetch_max(active, Ordering::SeqCst);
        gate.started.notify_one();

        let released = tokio::select! {
            permit = gate.release.acquire() => {
                permit.unwrap().forget();
                true
            }
            _ = request.cancel.cancelled() => false,
        };
        gate.active.fetch_sub(1, Ordering::SeqCst);

        if !released {
            return Ok(ExecutionResult::cancelled(Duration::ZERO));
        }
        Ok(ExecutionResult {
            stdout: "done\n".into(),
            stderr: String::new(),
            exit_code: Some(0),
            signal: None,
            duration_ms: 1,
            truncated: false,
            outcome: Outcome::Completed,
            phase: Phase::Run,
        })
    }
}

struct GatedFactory(Arc<Gate>);

impl WorkerFactory for GatedFactory {
    fn name(&self) -> &str {
        "gated"
    }

    fn worker_for(&self, _profile: &LanguageProfile) -> Arc<dyn ExecutionWorker> {
        Arc::new(GatedWorker(self.0.clone()))
    }
}

enum Backend {
    Process,
    Gated(Arc<Gate>),
}

struct Harness {
    _dir: tempfile::TempDir,
    orchestrator: SandboxOrchestrator,
    storage: Arc<ScratchStorage>,
    limiter: Arc<ExecutionLimiter>,
    reaper: ExpiryReaper,
}

async fn build(config: SandboxConfig, backend: Backend, audit: AuditHook) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let storage = Arc::new(ScratchStorage::new(dir.path()));
    storage.prepare().await.unwrap();

    let factory: Arc<dyn WorkerFactory> = match backend {
        Backend::Process => {
            let process = ProcessConfig::new(storage.runs_dir().to_path_buf())
                .with_private_dir(dir.path().to_path_buf());
            Arc::new(ProcessFactory::new(process).await.unwrap())
        }
        Backend::Gated(gate) => Arc::new(GatedFactory(gate)),
    };
    let languages = LanguageRegistry::new(vec![
        shell_profile("shell", 10_000, 4_096),
        shell_profile("strict", 500, 64),
    ])
    .unwrap();

    let registry = Arc::new(ContainerRegistry::new());
    let limiter = Arc::new(ExecutionLimiter::new(
        config.max_concurrent,
        config.max_queued,
    ));
    let orchestrator = SandboxOrchestrator::new(OrchestratorParts {
        registry: registry.clone(),
        languages: Arc::new(languages),
        factory,
        storage: storage.clone(),
        limiter: limiter.clone(),
        audit,
        policy: Policy::from_config(&config).unwrap(),
    });
    let reaper = ExpiryReaper::new(
        orchestrator.reclaimer().clone(),
        registry,
        limiter.clone(),
        &config,
    )
    .unwrap();

    Harness {
        _dir: dir,
        orchestrator,
        storage,
        limiter,
        reaper,
    }
}

async fn process_harness(config: SandboxConfig) -> Harness {
    build(config, Backend::Process, AuditHook::disabled()).await
}

async fn gated_harness(config: SandboxConfig) -> (Harness, Arc<Gate>) {
    let gate = Arc::new(Gate::default());
    let harness = build(config, Backend::Gated(gate.clone()), AuditHook::disabled()).await;
    (harness, gate)
}

fn stored_sources(h: &Harness) -> usize {
    std::fs::read_dir(h.storage.sources_dir()).unwrap().count()
}

async fn call(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string())),
        None => builder.body(Body::empty()),
    }
    .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let json = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, json)
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

#[tokio::test]
async fn submit_then_execute_leaves_sandbox_idle() {
    let h = process_harness(SandboxConfig::default()).await;

    let record = h.orchestrator.create("shell", "echo hi").await.unwrap();
    assert_eq!(record.state, SandboxState::Ready);
    assert!(record.expires_at > record.created_at);
    assert_eq!(
        record.source_path,
        h.storage.sources_dir().join(format!("{}.sh", record.id))
    );
    assert_eq!(std::fs::read_to_string(&record.source_path).unwrap(), "echo hi");

    let result = h.orchestrator.execute(record.id).await.unwrap();
    assert_eq!(result.stdout, "hi\n");
    assert_eq!(result.exit_code, Some(0));
    assert_eq!(result.outcome, Outcome::Completed);

    let status = h.orchestrator.status(record.id).unwrap();
    assert_eq!(status.summary.state, SandboxState::Idle);
    assert_eq!(status.last_result, Some(result));

    // Idle sandboxes can be re-run.
    let again = h.orchestrator.execute(record.id).await.unwrap();
    assert_eq!(again.stdout, "hi\n");
}

#[tokio::test]
async fn python_hello_when_installed() {
    let python = LanguageRegistry::new(vec![])
        .unwrap()
        .resolve("python")
        .unwrap();
    let path = std::env::var("PATH").unwrap_or_default();
    if !missing_programs(&python, &path).is_empty() {
        return;
    }
    let h = process_harness(SandboxConfig::default()).await;

    let record = h.orchestrator.create("py", "print('hi')").await.unwrap();
    assert_eq!(record.language, "python");
    let result = h.orchestrator.execute(record.id).await.unwrap();
    assert_eq!(result.stdout, "hi\n");
    assert_eq!(result.outcome, Outcome::Completed);
}

#[tokio::test]
async fn unsupported_language_creates_nothing() {
    let h = process_harness(SandboxConfig::default()).await;

    let err = h.orchestrator.create("brainfuck", "+[]").await.unwrap_err();
    assert_eq!(err.code(), "UnsupportedLanguage");
    assert!(h.orchestrator.list().unwrap().is_empty());
    assert_eq!(stored_sources(&h), 0);
}

#[tokio::test]
async fn oversized_code_is_rejected() {
    let config = SandboxConfig {
        max_source_bytes: 16,
        ..SandboxConfig::default()
    };
    let h = process_harness(config).await;

    let err = h
        .orchestrator
        .create("shell", &"x".repeat(17))
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::PayloadTooLarge { size: 17, limit: 16 }));
    assert!(h.orchestrator.list().unwrap().is_empty());

    h.orchestrator.create("shell", &"x".repeat(16)).await.unwrap();
}

#[tokio::test]
async fn timeout_is_reported_not_raised() {
    let h = process_harness(SandboxConfig::default()).await;
    let record = h.orchestrator.create("strict", "sleep 30").await.unwrap();

    let result = h.orchestrator.execute(record.id).await.unwrap();
    assert_eq!(result.outcome, Outcome::Timeout);
    assert_eq!(result.exit_code, None);
    assert!(result.duration_ms < 5_000, "took {}ms", result.duration_ms);
    assert_eq!(
        h.orchestrator.status(record.id).unwrap().summary.state,
        SandboxState::Idle
    );
}

#[tokio::test]
async fn flood_of_output_is_truncated() {
    let h = process_harness(SandboxConfig::default()).await;
    let code = "i=0; while [ $i -lt 500 ]; do echo 0123456789; i=$((i+1)); done";
    let record = h.orchestrator.create("strict", code).await.unwrap();

    let result = h.orchestrator.execute(record.id).await.unwrap();
    assert!(result.truncated);
    assert!(result.stdout.len() <= 64, "{} bytes", result.stdout.len());
}

#[tokio::test]
async fn sandboxes_cannot_reach_each_other_or_the_daemon() {
    let h = process_harness(SandboxConfig::default()).await;
    let victim = h
        .orchestrator
        .create("shell", "echo victim-secret-4711")
        .await
        .unwrap();
    let attack = format!(
        "cat {src} ../../sources/* 2>/dev/null; \
         rm -f {src} ../../sources/* 2>/dev/null; \
         echo ppid=$PPID; \
         kill -0 {daemon} 2>/dev/null && echo daemon-visible; \
         kill -KILL $PPID 2>/dev/null; \
         echo attack-done",
        src = victim.source_path.display(),
        daemon = std::process::id(),
    );
    let attacker = h.orchestrator.create("shell", &attack).await.unwrap();

    let result = h.orchestrator.execute(attacker.id).await.unwrap();
    assert_eq!(result.outcome, Outcome::Completed);
    assert_eq!(result.stdout, "ppid=1\nattack-done\n", "stderr: {}", result.stderr);
    assert!(victim.source_path.exists());

    let result = h.orchestrator.execute(victim.id).await.unwrap();
    assert_eq!(result.stdout, "victim-secret-4711\n");
}

#[tokio::test]
async fn storage_failure_marks_sandbox_failed() {
    let h = process_harness(SandboxConfig::default()).await;
    std::fs::remove_dir_all(h.storage.sources_dir()).unwrap();

    let err = h.orchestrator.create("shell", "echo hi").await.unwrap_err();
    assert_eq!(err.code(), "InternalOrchestrationError");

    let listed = h.orchestrator.list().unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].state, SandboxState::Failed);
    let err = h.orchestrator.execute(listed[0].id).await.unwrap_err();
    assert_eq!(err.code(), "InternalOrchestrationError");
}

#[tokio::test]
async fn run_on_submit_starts_execution() {
    let config = SandboxConfig {
        run_on_submit: true,
        ..SandboxConfig::default()
    };
    let (h, gate) = gated_harness(config).await;
    gate.open(1);

    let record = h.orchestrator.create("shell", "echo hi").await.unwrap();
    let mut last_result = None;
    for _ in 0..200 {
        last_result = h.orchestrator.status(record.id).unwrap().last_result;
        if last_result.is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(last_result.unwrap().stdout, "done\n");
}

// ---------------------------------------------------------------------------
// Concurrency
// ---------------------------------------------------------------------------

#[tokio::test]
async fn second_execute_on_same_sandbox_is_busy() {
    let (h, gate) = gated_harness(SandboxConfig::default()).await;
    let record = h.orchestrator.create("shell", "true").await.unwrap();

    let first = tokio::spawn({
        let orchestrator = h.orchestrator.clone();
        async move { orchestrator.execute(record.id).await }
    });
    gate.wait_started().await;

    let err = h.orchestrator.execute(record.id).await.unwrap_err();
    assert_eq!(err.code(), "SandboxBusy");
    assert!(matches!(err, ServiceError::Busy(_)));

    gate.open(1);
    assert_eq!(first.await.unwrap().unwrap().outcome, Outcome::Completed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_executes_are_single_flight() {
    let (h, gate) = gated_harness(SandboxConfig::default()).await;
    let record = h.orchestrator.create("shell", "true").await.unwrap();

    let attempts: Vec<_> = (0..8)
        .map(|_| {
            let orchestrator = h.orchestrator.clone();
            tokio::spawn(async move { orchestrator.execute(record.id).await })
        })
        .collect();
    gate.wait_started().await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    gate.open(8);

    let mut completed = 0;
    let mut busy = 0;
    for attempt in attempts {
        match attempt.await.unwrap() {
            Ok(_) => completed += 1,
            Err(ServiceError::Busy(_)) => busy += 1,
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!(completed, 1);
    assert_eq!(busy, 7);
    assert_eq!(gate.peak.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn saturated_pool_rejects_with_busy() {
    let config = SandboxConfig {
        max_concurrent: 1,
        max_queued: 0,
        ..SandboxConfig::default()
    };
    let (h, gate) = gated_harness(config).await;
    let a = h.orchestrator.create("shell", "true").await.unwrap();
    let b = h.orchestrator.create("shell", "true").await.unwrap();

    let first = tokio::spawn({
        let orchestrator = h.orchestrator.clone();
        async move { orchestrator.execute(a.id).await }
    });
    gate.wait_started().await;

    let err = h.orchestrator.execute(b.id).await.unwrap_err();
    assert!(matches!(err, ServiceError::Overloaded));
    assert_eq!(err.code(), "SandboxBusy");
    assert_eq!(
        h.orchestrator.status(b.id).unwrap().summary.state,
        SandboxState::Ready
    );

    gate.open(1);
    first.await.unwrap().unwrap();
}

#[tokio::test]
async fn queued_execution_waits_for_a_slot() {
    let config = SandboxConfig {
        max_concurrent: 1,
        max_queued: 1,
        ..SandboxConfig::default()
    };
    let (h, gate) = gated_harness(config).await;
    let a = h.orchestrator.create("shell", "true").await.unwrap();
    let b = h.orchestrator.create("shell", "true").await.unwrap();

    let spawn_execute = |id| {
        let orchestrator = h.orchestrator.clone();
        tokio::spawn(async move { orchestrator.execute(id).await })
    };
    let first = spawn_execute(a.id);
    gate.wait_started().await;
    let second = spawn_execute(b.id);
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(h.limiter.running(), 1);
    assert_eq!(h.limiter.queued(), 1);
    assert_eq!(
        h.orchestrator.status(b.id).unwrap().summary.state,
        SandboxState::Running
    );

    gate.open(2);
    assert_eq!(first.await.unwrap().unwrap().outcome, Outcome::Completed);
    assert_eq!(second.await.unwrap().unwrap().outcome, Outcome::Completed);
    assert_eq!(gate.peak.load(Ordering::SeqCst), 1);
}

// ---------------------------------------------------------------------------
// Extend, terminate, reaping
// ---------------------------------------------------------------------------

#[tokio::test]
async fn extend_is_clamped_and_monotonic() {
    let config = SandboxConfig {
        default_ttl_secs: 60,
        max_lifetime_secs: 120,
        ..SandboxConfig::default()
    };
    let h = process_harness(config).await;
    let record = h.orchestrator.create("shell", "true").await.unwrap();

    let clamped = h.orchestrator.extend(record.id, 1_000).unwrap();
    assert_eq!(clamped, record.created_at + TimeDelta::seconds(120));

    let shorter = h.orchestrator.extend(record.id, 1).unwrap();
    assert_eq!(shorter, clamped);

    let status = h.orchestrator.status(record.id).unwrap();
    assert_eq!(status.summary.extension_count, 2);
    assert_eq!(status.summary.expires_at, clamped);
}

#[tokio::test]
async fn extend_refuses_expired_and_reclaimed() {
    let h = process_harness(SandboxConfig::default()).await;
    let record = h.orchestrator.create("shell", "true").await.unwrap();
    h.orchestrator
        .registry()
        .transition(record.id, |r| {
            r.expires_at = r.created_at + TimeDelta::milliseconds(1);
            Ok(())
        })
        .unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;

    let err = h.orchestrator.extend(record.id, 60).unwrap_err();
    assert_eq!(err.code(), "SandboxExpired");
    let err = h.orchestrator.execute(record.id).await.unwrap_err();
    assert_eq!(err.code(), "SandboxExpired");

    let report = h.reaper.sweep(Utc::now()).await.unwrap();
    assert_eq!(report.reclaimed, 1);
    let err = h.orchestrator.extend(record.id, 60).unwrap_err();
    assert_eq!(err.code(), "SandboxNotFound");
    assert!(h.orchestrator.list().unwrap().is_empty());
}

#[tokio::test]
async fn idle_sandbox_is_reaped_after_ttl() {
    let config = SandboxConfig {
        default_ttl_secs: 60,
        ..SandboxConfig::default()
    };
    let h = process_harness(config).await;
    let record = h.orchestrator.create("shell", "echo hi").await.unwrap();
    h.orchestrator.execute(record.id).await.unwrap();

    let report = h.reaper.sweep(Utc::now()).await.unwrap();
    assert_eq!(report.reclaimed, 0);

    let report = h
        .reaper
        .sweep(Utc::now() + TimeDelta::seconds(61))
        .await
        .unwrap();
    assert_eq!(report.expired, 1);
    assert_eq!(report.reclaimed, 1);
    assert!(!record.source_path.exists());
    assert!(h.orchestrator.list().unwrap().is_empty());
    let err = h.orchestrator.status(record.id).unwrap_err();
    assert_eq!(err.code(), "SandboxNotFound");
}

#[tokio::test]
async fn terminate_cancels_running_execution() {
    let (h, gate) = gated_harness(SandboxConfig::default()).await;
    let record = h.orchestrator.create("shell", "true").await.unwrap();

    let pending = tokio::spawn({
        let orchestrator = h.orchestrator.clone();
        async move { orchestrator.execute(record.id).await }
    });
    gate.wait_started().await;

    let state = h.orchestrator.terminate(record.id).await.unwrap();
    assert_eq!(state, SandboxState::Running);

    let result = pending.await.unwrap().unwrap();
    assert_eq!(result.outcome, Outcome::Cancelled);
    assert!(!record.source_path.exists());
    let err = h.orchestrator.status(record.id).unwrap_err();
    assert_eq!(err.code(), "SandboxNotFound");
}

#[tokio::test]
async fn terminate_reclaims_idle_sandbox_now() {
    let h = process_harness(SandboxConfig::default()).await;
    let record = h.orchestrator.create("shell", "true").await.unwrap();

    let state = h.orchestrator.terminate(record.id).await.unwrap();
    assert_eq!(state, SandboxState::Reclaimed);
    assert!(!record.source_path.exists());
    assert!(h.orchestrator.list().unwrap().is_empty());

    let err = h.orchestrator.execute(record.id).await.unwrap_err();
    assert_eq!(err.code(), "SandboxNotFound");
    let err = h.orchestrator.terminate(record.id).await.unwrap_err();
    assert_eq!(err.code(), "SandboxNotFound");
}

#[tokio::test]
async fn shutdown_cancels_and_reclaims_everything() {
    let (h, gate) = gated_harness(SandboxConfig::default()).await;
    let running = h.orchestrator.create("shell", "true").await.unwrap();
    h.orchestrator.create("shell", "true").await.unwrap();

    let pending = tokio::spawn({
        let orchestrator = h.orchestrator.clone();
        async move { orchestrator.execute(running.id).await }
    });
    gate.wait_started().await;

    h.orchestrator.shutdown(Duration::from_secs(5)).await;

    assert_eq!(pending.await.unwrap().unwrap().outcome, Outcome::Cancelled);
    assert!(h.orchestrator.list().unwrap().is_empty());
    assert_eq!(stored_sources(&h), 0);
}

#[tokio::test]
async fn reaper_publishes_occupancy() {
    let h = process_harness(SandboxConfig::default()).await;
    h.orchestrator.create("shell", "true").await.unwrap();

    let status_path = h.storage.sources_dir().parent().unwrap().join("status.json");
    let tracker = Arc::new(StatusTracker::new(status_path.clone()));
    let stop = CancellationToken::new();
    let task = tokio::spawn(h.reaper.with_status(tracker).run(stop.clone()));

    let mut published = Value::Null;
    for _ in 0..200 {
        if let Ok(content) = std::fs::read_to_string(&status_path) {
            published = serde_json::from_str(&content).unwrap();
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    stop.cancel();
    task.await.unwrap();

    assert_eq!(published["active_sandboxes"], 1);
    assert_eq!(published["running_executions"], 0);
}

// ---------------------------------------------------------------------------
// HTTP surface
// ---------------------------------------------------------------------------

#[tokio::test]
async fn http_submit_execute_and_poll() {
    let h = process_harness(SandboxConfig::default()).await;
    let app = api::router(SubmissionRouter::new(h.orchestrator.clone()));

    let (status, submitted) = call(
        &app,
        "POST",
        "/submit",
        Some(json!({"language": "Shell", "code": "echo hi"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(submitted["state"], "Ready");
    let id = submitted["id"].as_str().unwrap().to_string();
    assert_eq!(submitted["pollUrl"], format!("/sandboxes/{id}"));
    assert!(submitted["expiresAt"].as_str().unwrap().ends_with('Z'));

    let (status, result) = call(&app, "POST", "/execute", Some(json!({"id": id}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(result["stdout"], "hi\n");
    assert_eq!(result["exitCode"], 0);
    assert_eq!(result["outcome"], "Completed");

    let poll_url = submitted["pollUrl"].as_str().unwrap();
    let (status, polled) = call(&app, "GET", poll_url, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(polled["state"], "Idle");
    assert_eq!(polled["lastOutcome"], "Completed");
    assert_eq!(polled["lastResult"]["stdout"], "hi\n");

    let (status, extended) = call(
        &app,
        "POST",
        "/extend",
        Some(json!({"id": id, "ttlSeconds": 600})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(extended["newExpiresAt"].is_string());

    let (status, listed) = call(&app, "GET", "/list", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(listed["sandboxes"].as_array().unwrap().len(), 1);

    let (status, terminated) = call(&app, "POST", "/terminate", Some(json!({"id": id}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(terminated["state"], "Reclaimed");

    let (status, body) = call(&app, "GET", poll_url, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "SandboxNotFound");
}

#[tokio::test]
async fn http_errors_use_taxonomy() {
    let config = SandboxConfig {
        max_source_bytes: 16,
        ..SandboxConfig::default()
    };
    let h = process_harness(config).await;
    let app = api::router(SubmissionRouter::new(h.orchestrator.clone()));

    let (status, body) = call(
        &app,
        "POST",
        "/submit",
        Some(json!({"language": "brainfuck", "code": "+"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "UnsupportedLanguage");

    let (status, body) = call(
        &app,
        "POST",
        "/submit",
        Some(json!({"language": "shell", "code": "x".repeat(17)})),
    )
    .await;
    assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
    assert_eq!(body["error"]["code"], "PayloadTooLarge");

    let (status, body) = call(&app, "POST", "/execute", Some(json!({"id": "nope"}))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "SandboxNotFound");

    let (status, body) = call(
        &app,
        "POST",
        "/execute",
        Some(json!({"id": uuid::Uuid::new_v4().to_string()})),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "SandboxNotFound");

    let (status, body) = call(&app, "POST", "/extend", Some(json!({"id": "x"}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "InvalidRequest");

    let record = h.orchestrator.create("shell", "true").await.unwrap();
    let (status, body) = call(
        &app,
        "POST",
        "/extend",
        Some(json!({"id": record.id.to_string(), "ttlSeconds": 0})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "InvalidRequest");

    let request = Request::builder()
        .method("POST")
        .uri("/submit")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from("{not json"))
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn http_oversized_body_is_413() {
    let config = SandboxConfig {
        max_source_bytes: 16,
        ..SandboxConfig::default()
    };
    let h = process_harness(config).await;
    let app = api::router(SubmissionRouter::new(h.orchestrator.clone()));

    let (status, body) = call(
        &app,
        "POST",
        "/submit",
        Some(json!({"language": "shell", "code": "x".repeat(200_000)})),
    )
    .await;
    assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
    assert_eq!(body["error"]["code"], "PayloadTooLarge");
}

#[tokio::test]
async fn http_busy_and_expired_status_codes() {
    let (h, gate) = gated_harness(SandboxConfig::default()).await;
    let app = api::router(SubmissionRouter::new(h.orchestrator.clone()));
    let record = h.orchestrator.create("shell", "true").await.unwrap();
    let id = record.id.to_string();

    let pending = tokio::spawn({
        let app = app.clone();
        let id = id.clone();
        async move { call(&app, "POST", "/execute", Some(json!({"id": id}))).await }
    });
    gate.wait_started().await;

    let (status, body) = call(&app, "POST", "/execute", Some(json!({"id": id}))).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["code"], "SandboxBusy");

    gate.open(1);
    assert_eq!(pending.await.unwrap().0, StatusCode::OK);

    h.orchestrator
        .registry()
        .transition(record.id, |r| {
            r.expires_at = r.created_at + TimeDelta::milliseconds(1);
            Ok(())
        })
        .unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    let (status, body) = call(&app, "POST", "/execute", Some(json!({"id": id}))).await;
    assert_eq!(status, StatusCode::GONE);
    assert_eq!(body["error"]["code"], "SandboxExpired");
}

// ---------------------------------------------------------------------------
// Audit webhook
// ---------------------------------------------------------------------------

#[tokio::test]
async fn audit_webhook_receives_lifecycle_events() {
    let server = MockServer::start_async().await;
    let submitted = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/audit")
                .header("Authorization", "Bearer audit-token")
                .json_body_includes(r#"{"event": "submitted", "language": "shell"}"#);
            then.status(204);
        })
        .await;
    let executed = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/audit")
                .json_body_includes(r#"{"event": "executed", "outcome": "Completed"}"#);
            then.status(204);
        })
        .await;
    let reclaimed = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/audit")
                .json_body_includes(r#"{"event": "reclaimed", "forced": false}"#);
            then.status(204);
        })
        .await;

    let stop = CancellationToken::new();
    let (hook, sink) = AuditHook::spawn(
        &AuditConfig {
            url: server.url("/audit"),
            token: Some("audit-token".into()),
            queue_size: 16,
        },
        stop.clone(),
    )
    .unwrap();
    let h = build(SandboxConfig::default(), Backend::Process, hook).await;

    let record = h.orchestrator.create("shell", "echo hi").await.unwrap();
    h.orchestrator.execute(record.id).await.unwrap();
    h.orchestrator.terminate(record.id).await.unwrap();

    stop.cancel();
    sink.await.unwrap();

    submitted.assert_calls_async(1).await;
    executed.assert_calls_async(1).await;
    reclaimed.assert_calls_async(1).await;
}

#[tokio::test]
async fn unreachable_webhook_never_blocks_the_core() {
    let stop = CancellationToken::new();
    let (hook, sink) = AuditHook::spawn(
        &AuditConfig {
            url: "http://127.0.0.1:9/audit".into(),
            token: None,
            queue_size: 1,
        },
        stop.clone(),
    )
    .unwrap();
    let h = build(SandboxConfig::default(), Backend::Process, hook).await;

    let record = tokio::time::timeout(
        Duration::from_secs(5),
        h.orchestrator.create("shell", "echo hi"),
    )
    .await
    .unwrap()
    .unwrap();
    let result = tokio::time::timeout(Duration::from_secs(10), h.orchestrator.execute(record.id))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(result.outcome, Outcome::Completed);

    stop.cancel();
    sink.await.unwrap();
}
