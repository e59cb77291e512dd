//! Kubectl Executor (C6) — translates a parsed `K8sAPIRequest` into a
//! concrete operation against the local control plane and captures its
//! result.

use std::collections::HashMap;
use std::io::Write as _;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::error::BridgeError;
use crate::model::{HttpMethod, K8sApiRequest, K8sApiResult};

/// Default truncation ceiling for captured stdout/stderr, per §7. Overridden
/// by `Config::max_captured_output_bytes` when the executor is constructed
/// through `with_options`.
pub const MAX_CAPTURED_OUTPUT_BYTES: usize = 64 * 1024;

/// Window a request id is remembered for idempotency de-duplication, per
/// §4.6's "short-window set" — long enough to catch a client's retry burst,
/// not a record kept forever.
const DEDUPE_WINDOW: Duration = Duration::from_secs(300);

/// Translates method + resource + payload into a kubectl-compatible argv,
/// per the table in §4.6.
fn build_argv(request: &K8sApiRequest) -> Result<Vec<String>, BridgeError> {
    let ns_flag = vec!["-n".to_string(), request.namespace.clone()];

    match request.method {
        HttpMethod::Get => {
            let mut argv = vec!["get".to_string(), request.resource.clone()];
            if let Some(name) = &request.name {
                argv.push(name.clone());
            }
            argv.extend(ns_flag);
            argv.extend(["-o".to_string(), "json".to_string()]);
            Ok(argv)
        }
        HttpMethod::Post | HttpMethod::Put => {
            if request.payload.is_empty() {
                return Err(BridgeError::ExecutorFailure("payload must be non-empty for apply".to_string()));
            }
            let mut argv = vec!["apply".to_string(), "-f".to_string(), "-".to_string()];
            argv.extend(ns_flag);
            Ok(argv)
        }
        HttpMethod::Delete => {
            let mut argv = vec!["delete".to_string(), request.resource.clone()];
            if let Some(name) = &request.name {
                argv.push(name.clone());
            }
            argv.extend(ns_flag);
            Ok(argv)
        }
        HttpMethod::Patch => {
            let name = request
                .name
                .as_ref()
                .ok_or_else(|| BridgeError::ExecutorFailure("patch requires a resource name".to_string()))?;
            if request.payload.is_empty() {
                return Err(BridgeError::ExecutorFailure("patch requires a non-empty payload".to_string()));
            }
            let patch = String::from_utf8_lossy(&request.payload).to_string();
            let mut argv = vec![
                "patch".to_string(),
                request.resource.clone(),
                name.clone(),
                "--patch".to_string(),
                patch,
            ];
            argv.extend(ns_flag);
            Ok(argv)
        }
    }
}

/// Probes and caches control-plane reachability for a short window, so
/// every request doesn't pay a fresh probe round trip.
pub struct ReachabilityProbe {
    last_check: Mutex<Option<(Instant, bool)>>,
    ttl: Duration,
}

impl ReachabilityProbe {
    pub fn new(ttl: Duration) -> Self {
        Self {
            last_check: Mutex::new(None),
            ttl,
        }
    }

    pub async fn is_reachable(&self) -> bool {
        let mut last = self.last_check.lock().await;
        if let Some((checked_at, reachable)) = *last {
            if checked_at.elapsed() < self.ttl {
                return reachable;
            }
        }

        let reachable = Command::new("kubectl")
            .args(["version", "--client=false"])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map(|status| status.success())
            .unwrap_or(false);

        *last = Some((Instant::now(), reachable));
        reachable
    }
}

#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(&self, request: &K8sApiRequest) -> K8sApiResult;

    /// Control-plane reachability, polled by C9's periodic health loop
    /// (§4.9). Defaults to always-healthy for executors with no external
    /// dependency to probe.
    async fn health_check(&self) -> bool {
        true
    }
}

/// Shells out to `kubectl` per request, serialized by a bounded worker
/// pool (`exec_parallelism`) and guarded by idempotency de-duplication and
/// control-plane reachability checks.
pub struct KubectlExecutor {
    node_id: String,
    exec_timeout: Duration,
    probe: ReachabilityProbe,
    seen_requests: Mutex<HashMap<String, Instant>>,
    semaphore: tokio::sync::Semaphore,
    queue_capacity: usize,
    queued: std::sync::atomic::AtomicUsize,
    max_captured_output_bytes: usize,
}

impl KubectlExecutor {
    pub fn new(node_id: String, exec_timeout: Duration, exec_parallelism: usize) -> Self {
        Self::with_queue_capacity(node_id, exec_timeout, exec_parallelism, 1024)
    }

    pub fn with_queue_capacity(
        node_id: String,
        exec_timeout: Duration,
        exec_parallelism: usize,
        queue_capacity: usize,
    ) -> Self {
        Self::with_options(
            node_id,
            exec_timeout,
            exec_parallelism,
            queue_capacity,
            MAX_CAPTURED_OUTPUT_BYTES,
        )
    }

    pub fn with_options(
        node_id: String,
        exec_timeout: Duration,
        exec_parallelism: usize,
        queue_capacity: usize,
        max_captured_output_bytes: usize,
    ) -> Self {
        Self {
            node_id,
            exec_timeout,
            probe: ReachabilityProbe::new(Duration::from_secs(5)),
            seen_requests: Mutex::new(HashMap::new()),
            semaphore: tokio::sync::Semaphore::new(exec_parallelism),
            queue_capacity,
            queued: std::sync::atomic::AtomicUsize::new(0),
            max_captured_output_bytes,
        }
    }

    /// Control-plane-not-ready path, §7: a request arriving while the
    /// probe is down waits (queued, bounded by `queue_capacity`) for the
    /// probe to recover rather than failing outright; a queue already at
    /// capacity fails the request immediately instead of growing further.
    async fn wait_for_control_plane(&self, request: &K8sApiRequest) -> Result<(), K8sApiResult> {
        use std::sync::atomic::Ordering;

        if self.probe.is_reachable().await {
            return Ok(());
        }

        if self.queued.fetch_add(1, Ordering::SeqCst) >= self.queue_capacity {
            self.queued.fetch_sub(1, Ordering::SeqCst);
            return Err(K8sApiResult {
                request_id: request.request_id.clone(),
                success: false,
                output: String::new(),
                error: "control plane not reachable and retry queue is full".to_string(),
                execution_time_ms: 0,
                executor: self.node_id.clone(),
                timestamp: Utc::now(),
            });
        }

        warn!(request_id = %request.request_id, "control plane unreachable, request queued for retry");
        loop {
            tokio::time::sleep(Duration::from_secs(5)).await;
            if self.probe.is_reachable().await {
                self.queued.fetch_sub(1, Ordering::SeqCst);
                return Ok(());
            }
        }
    }

    fn truncate(&self, output: Vec<u8>) -> String {
        let mut s = String::from_utf8_lossy(&output).to_string();
        if s.len() > self.max_captured_output_bytes {
            s.truncate(self.max_captured_output_bytes);
            s.push_str("...<truncated>");
        }
        s
    }

    fn unsupported_method_result(request: &K8sApiRequest) -> K8sApiResult {
        K8sApiResult {
            request_id: request.request_id.clone(),
            success: false,
            output: String::new(),
            error: "unsupported method".to_string(),
            execution_time_ms: 0,
            executor: String::new(),
            timestamp: Utc::now(),
        }
    }

    async fn run_kubectl(&self, request: &K8sApiRequest) -> K8sApiResult {
        let start = Instant::now();

        let argv = match build_argv(request) {
            Ok(argv) => argv,
            Err(e) => {
                return K8sApiResult {
                    request_id: request.request_id.clone(),
                    success: false,
                    output: String::new(),
                    error: e.to_string(),
                    execution_time_ms: start.elapsed().as_millis() as u64,
                    executor: self.node_id.clone(),
                    timestamp: Utc::now(),
                };
            }
        };

        let mut cmd = Command::new("kubectl");
        cmd.args(&argv)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let needs_stdin = matches!(request.method, HttpMethod::Post | HttpMethod::Put);
        if needs_stdin {
            cmd.stdin(Stdio::piped());
        } else {
            cmd.stdin(Stdio::null());
        }

        let spawn_result = cmd.spawn();
        let mut child = match spawn_result {
            Ok(child) => child,
            Err(e) => {
                return K8sApiResult {
                    request_id: request.request_id.clone(),
                    success: false,
                    output: String::new(),
                    error: format!("failed to spawn kubectl: {e}"),
                    execution_time_ms: start.elapsed().as_millis() as u64,
                    executor: self.node_id.clone(),
                    timestamp: Utc::now(),
                };
            }
        };

        if needs_stdin {
            if let Some(mut stdin) = child.stdin.take() {
                let payload = request.payload.clone();
                let _ = tokio::task::spawn_blocking(move || stdin.write_all(&payload)).await;
            }
        }

        let wait = tokio::time::timeout(self.exec_timeout, child.wait_with_output()).await;

        let (success, output, error) = match wait {
            Ok(Ok(output)) => {
                if output.status.success() {
                    (true, self.truncate(output.stdout), String::new())
                } else {
                    let code = output.status.code().map(|c| c.to_string()).unwrap_or_else(|| "signal".to_string());
                    let stderr = self.truncate(output.stderr);
                    (false, String::new(), format!("{code},{stderr}"))
                }
            }
            Ok(Err(e)) => (false, String::new(), format!("io error: {e}")),
            Err(_) => {
                warn!(request_id = %request.request_id, "kubectl exec timed out, killing child");
                (false, String::new(), "execution timed out".to_string())
            }
        };

        K8sApiResult {
            request_id: request.request_id.clone(),
            success,
            output,
            error,
            execution_time_ms: start.elapsed().as_millis() as u64,
            executor: self.node_id.clone(),
            timestamp: Utc::now(),
        }
    }
}

#[async_trait]
impl Executor for KubectlExecutor {
    async fn execute(&self, request: &K8sApiRequest) -> K8sApiResult {
        {
            let mut seen = self.seen_requests.lock().await;
            seen.retain(|_, seen_at| seen_at.elapsed() < DEDUPE_WINDOW);
            if seen.insert(request.request_id.clone(), Instant::now()).is_some() {
                info!(request_id = %request.request_id, "duplicate request suppressed");
                return K8sApiResult {
                    request_id: request.request_id.clone(),
                    success: true,
                    output: "duplicate suppressed".to_string(),
                    error: String::new(),
                    execution_time_ms: 0,
                    executor: self.node_id.clone(),
                    timestamp: Utc::now(),
                };
            }
        }

        if !matches!(
            request.method,
            HttpMethod::Get | HttpMethod::Post | HttpMethod::Put | HttpMethod::Delete | HttpMethod::Patch
        ) {
            return Self::unsupported_method_result(request);
        }

        if let Err(queue_full_result) = self.wait_for_control_plane(request).await {
            return queue_full_result;
        }

        let _permit = self.semaphore.acquire().await;
        self.run_kubectl(request).await
    }

    async fn health_check(&self) -> bool {
        self.probe.is_reachable().await
    }
}

/// Lightweight stand-in used by the gateway/poller test suite, where
/// shelling out to a real `kubectl` binary is neither available nor
/// desired.
pub struct FakeExecutor {
    pub scripted: Arc<Mutex<std::collections::HashMap<String, K8sApiResult>>>,
}

impl FakeExecutor {
    pub fn new() -> Self {
        Self {
            scripted: Arc::new(Mutex::new(std::collections::HashMap::new())),
        }
    }

    pub async fn script(&self, request_id: impl Into<String>, result: K8sApiResult) {
        self.scripted.lock().await.insert(request_id.into(), result);
    }
}

#[async_trait]
impl Executor for FakeExecutor {
    async fn execute(&self, request: &K8sApiRequest) -> K8sApiResult {
        if let Some(result) = self.scripted.lock().await.get(&request.request_id).cloned() {
            return result;
        }
        K8sApiResult {
            request_id: request.request_id.clone(),
            success: true,
            output: format!("fake:{}:{}", request.method, request.resource),
            error: String::new(),
            execution_time_ms: 1,
            executor: "fake-node".to_string(),
            timestamp: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_request(method: HttpMethod, name: Option<&str>, payload: &[u8]) -> K8sApiRequest {
        K8sApiRequest {
            request_id: "req-1".to_string(),
            method,
            resource: "pods".to_string(),
            namespace: "default".to_string(),
            name: name.map(|s| s.to_string()),
            payload: payload.to_vec(),
            seal_token: "seal_x".to_string(),
            requester: "0xabc".to_string(),
            priority: 5,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn get_maps_to_get_argv() {
        let argv = build_argv(&sample_request(HttpMethod::Get, None, b"")).unwrap();
        assert_eq!(argv, vec!["get", "pods", "-n", "default", "-o", "json"]);
    }

    #[test]
    fn patch_requires_name_and_payload() {
        let result = build_argv(&sample_request(HttpMethod::Patch, None, b""));
        assert!(result.is_err());
    }

    #[test]
    fn post_requires_nonempty_payload() {
        let result = build_argv(&sample_request(HttpMethod::Post, None, b""));
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn fake_executor_duplicate_request_is_scriptable() {
        let executor = FakeExecutor::new();
        let request = sample_request(HttpMethod::Get, None, b"");
        let result = executor.execute(&request).await;
        assert!(result.success);
    }

    #[tokio::test]
    async fn unreachable_control_plane_with_full_queue_fails_immediately() {
        // `kubectl` is not on PATH in the test sandbox, so the reachability
        // probe always reports down; a zero-capacity queue must then fail
        // the request immediately rather than looping forever.
        let executor = KubectlExecutor::with_queue_capacity(
            "node-1".to_string(),
            Duration::from_secs(1),
            1,
            0,
        );
        let request = sample_request(HttpMethod::Get, None, b"");
        let result = executor.execute(&request).await;
        assert!(!result.success);
        assert!(result.error.contains("queue is full") || result.error.contains("not reachable"));
    }
}
