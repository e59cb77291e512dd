//! Request Correlator (C5) — maps request fingerprints to pending-response
//! handles, with await-with-timeout, idempotent single-writer completion,
//! and a TTL eviction sweeper.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{oneshot, Mutex};
use tracing::warn;

use crate::error::BridgeError;
use crate::model::{K8sApiResult, RequestId, WalletAddress};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingMeta {
    pub requester: WalletAddress,
    pub method: String,
    pub path: String,
}

struct Entry {
    meta: PendingMeta,
    started_at: DateTime<Utc>,
    completion: Option<oneshot::Sender<K8sApiResult>>,
}

/// Handle returned by `register`, passed to `await_response`.
pub struct Handle {
    request_id: RequestId,
    receiver: oneshot::Receiver<K8sApiResult>,
}

pub enum AwaitOutcome {
    Response(K8sApiResult),
    Timeout,
    Canceled,
}

/// Structural changes (register/complete/cancel/sweep) go through a single
/// mutex; once registered, a handle's completion signal is a plain
/// one-shot channel, so the awaiting task never contends on the map lock
/// while it waits.
pub struct Correlator {
    entries: Arc<Mutex<HashMap<RequestId, Entry>>>,
    max_lifetime: Duration,
}

impl Correlator {
    pub fn new(max_lifetime: Duration) -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            max_lifetime,
        }
    }

    /// Creates a `PendingResponse` for `request_id`. Fails if one already
    /// exists — callers must mint a fresh `request_id` per inbound intent.
    pub async fn register(&self, request_id: RequestId, meta: PendingMeta) -> Result<Handle, BridgeError> {
        let mut entries = self.entries.lock().await;
        if entries.contains_key(&request_id) {
            return Err(BridgeError::AlreadyRegistered(request_id));
        }

        let (tx, rx) = oneshot::channel();
        entries.insert(
            request_id.clone(),
            Entry {
                meta,
                started_at: Utc::now(),
                completion: Some(tx),
            },
        );

        Ok(Handle {
            request_id,
            receiver: rx,
        })
    }

    /// Blocks until completion, timeout, or channel closure (cancellation).
    /// Always releases its wait slot, even on timeout.
    pub async fn await_response(&self, handle: Handle, timeout: Duration) -> AwaitOutcome {
        match tokio::time::timeout(timeout, handle.receiver).await {
            Ok(Ok(response)) => AwaitOutcome::Response(response),
            Ok(Err(_)) => AwaitOutcome::Canceled,
            Err(_) => {
                // The entry itself is left for the sweeper; a late
                // `complete` still succeeds harmlessly against a closed
                // receiver.
                AwaitOutcome::Timeout
            }
        }
    }

    /// Idempotent completion: a second call for the same `request_id` is a
    /// no-op. Wakes the waiter exactly once and removes the entry — a
    /// `PendingResponse` is removed exactly once, on completion or
    /// eviction (§3).
    pub async fn complete(&self, result: K8sApiResult) {
        let mut entries = self.entries.lock().await;
        if let Some(mut entry) = entries.remove(&result.request_id) {
            if let Some(sender) = entry.completion.take() {
                let _ = sender.send(result);
            }
        }
    }

    /// Best-effort cancellation: frees the handle even if no waiter has
    /// attached yet.
    pub async fn cancel(&self, request_id: &str) {
        self.entries.lock().await.remove(request_id);
    }

    /// Background sweeper: removes entries older than `max_lifetime`
    /// regardless of completion status. Intended to run every 30s on its
    /// own task for the lifetime of the process.
    pub async fn sweep_once(&self) -> usize {
        let mut entries = self.entries.lock().await;
        let now = Utc::now();
        let max_lifetime = self.max_lifetime;
        let before = entries.len();
        entries.retain(|request_id, entry| {
            let age = now.signed_duration_since(entry.started_at);
            let expired = age.to_std().map(|d| d >= max_lifetime).unwrap_or(true);
            if expired {
                warn!(request_id, "evicting stale pending response");
            }
            !expired
        });
        before - entries.len()
    }

    pub async fn run_sweeper(self: Arc<Self>, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(Duration::from_secs(30));
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.sweep_once().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }

    #[cfg(test)]
    pub async fn pending_meta(&self, request_id: &str) -> Option<PendingMeta> {
        self.entries.lock().await.get(request_id).map(|e| e.meta.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_result(request_id: &str) -> K8sApiResult {
        K8sApiResult {
            request_id: request_id.to_string(),
            success: true,
            output: "ok".to_string(),
            error: String::new(),
            execution_time_ms: 5,
            executor: "node-1".to_string(),
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn register_then_complete_delivers_response() {
        let correlator = Correlator::new(Duration::from_secs(300));
        let handle = correlator
            .register(
                "req-1".to_string(),
                PendingMeta {
                    requester: "0xabc".to_string(),
                    method: "GET".to_string(),
                    path: "/api/v1/pods".to_string(),
                },
            )
            .await
            .unwrap();

        correlator.complete(sample_result("req-1")).await;

        match correlator.await_response(handle, Duration::from_secs(1)).await {
            AwaitOutcome::Response(result) => assert_eq!(result.request_id, "req-1"),
            _ => panic!("expected a response"),
        }
    }

    #[tokio::test]
    async fn duplicate_register_fails() {
        let correlator = Correlator::new(Duration::from_secs(300));
        let meta = PendingMeta {
            requester: "0xabc".to_string(),
            method: "GET".to_string(),
            path: "/".to_string(),
        };
        correlator.register("req-1".to_string(), meta.clone()).await.unwrap();
        let result = correlator.register("req-1".to_string(), meta).await;
        assert!(matches!(result, Err(BridgeError::AlreadyRegistered(_))));
    }

    #[tokio::test]
    async fn await_times_out_without_panicking() {
        let correlator = Correlator::new(Duration::from_secs(300));
        let handle = correlator
            .register(
                "req-2".to_string(),
                PendingMeta {
                    requester: "0xabc".to_string(),
                    method: "GET".to_string(),
                    path: "/".to_string(),
                },
            )
            .await
            .unwrap();

        let outcome = correlator
            .await_response(handle, Duration::from_millis(10))
            .await;
        assert!(matches!(outcome, AwaitOutcome::Timeout));

        // A late completion after the timeout must not panic.
        correlator.complete(sample_result("req-2")).await;
    }

    #[tokio::test]
    async fn double_complete_is_a_no_op() {
        let correlator = Correlator::new(Duration::from_secs(300));
        let handle = correlator
            .register(
                "req-3".to_string(),
                PendingMeta {
                    requester: "0xabc".to_string(),
                    method: "GET".to_string(),
                    path: "/".to_string(),
                },
            )
            .await
            .unwrap();

        correlator.complete(sample_result("req-3")).await;
        correlator.complete(sample_result("req-3")).await;

        match correlator.await_response(handle, Duration::from_secs(1)).await {
            AwaitOutcome::Response(result) => assert_eq!(result.request_id, "req-3"),
            _ => panic!("expected a response"),
        }
    }

    #[tokio::test]
    async fn sweeper_evicts_stale_entries() {
        let correlator = Correlator::new(Duration::from_millis(1));
        correlator
            .register(
                "req-4".to_string(),
                PendingMeta {
                    requester: "0xabc".to_string(),
                    method: "GET".to_string(),
                    path: "/".to_string(),
                },
            )
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        let evicted = correlator.sweep_once().await;
        assert_eq!(evicted, 1);
        assert!(correlator.pending_meta("req-4").await.is_none());
    }
}
