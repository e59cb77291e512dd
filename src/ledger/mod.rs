//! Ledger Adapter (C1) — the core's only window onto the smart-contract
//! ledger. Everything upstream sees is one of the three operations on
//! [`LedgerAdapter`]; the concrete transport lives behind the trait so the
//! rest of the core never depends on `reqwest` or the wire format directly.

mod http;
mod mock;

pub use http::HttpLedgerAdapter;
pub use mock::MockLedgerAdapter;

use crate::error::BridgeError;
use crate::model::EventCursor;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

/// Event kinds the core both emits and observes. `emit_*` entry functions
/// and the `*Event` move event types share this enum — the mapping
/// between variant and on-chain name lives in the adapter implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    K8sApiRequest,
    K8sApiResult,
    WorkerNode,
    ClusterState,
    SetJoinToken,
}

impl EventKind {
    /// Entry function name on the contract used to emit this kind.
    pub fn entry_function(&self) -> &'static str {
        match self {
            EventKind::K8sApiRequest => "emit_k8s_api_request",
            EventKind::K8sApiResult => "emit_k8s_api_result",
            EventKind::WorkerNode => "emit_worker_node_event",
            EventKind::ClusterState => "emit_cluster_state_event",
            EventKind::SetJoinToken => "set_join_token",
        }
    }

    /// On-chain move event type name this kind is observed under.
    pub fn event_type(&self) -> &'static str {
        match self {
            EventKind::K8sApiRequest => "K8sAPIRequestEvent",
            EventKind::K8sApiResult => "K8sAPIResultEvent",
            EventKind::WorkerNode => "WorkerNodeEvent",
            EventKind::ClusterState => "ClusterStateEvent",
            EventKind::SetJoinToken => "JoinTokenSetEvent",
        }
    }
}

/// A single observed ledger event: its monotone cursor, its kind, and the
/// raw `parsedJson` payload handlers deserialize into the concrete record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEvent {
    pub cursor: EventCursor,
    pub kind: EventKind,
    pub parsed_json: Value,
}

/// Filter applied by `QueryEvents`. `package`/`module` narrow the move
/// event source; `event_type` narrows by the kind's on-chain name.
#[derive(Debug, Clone)]
pub struct EventFilter {
    pub package: String,
    pub module: String,
    pub event_type: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Order {
    Ascending,
    Descending,
}

/// State of a contract-owned object, as returned by `QueryObject`.
#[derive(Debug, Clone)]
pub enum ObjectState {
    Found(Value),
    NotFound,
}

/// The three operations the rest of the core consumes from the ledger.
///
/// All three are cancellation-aware via `tokio`'s ambient task cancellation
/// (callers wrap calls in `tokio::time::timeout`); implementations back off
/// exponentially with jitter on `BridgeError::Transient` and surface
/// `Rejected`/`Fatal` immediately.
#[async_trait]
pub trait LedgerAdapter: Send + Sync {
    /// Submit a transaction invoking `kind`'s emit entry. The idempotency
    /// key is a deterministic hash of `fields`; retrying the same fields
    /// must never duplicate the on-chain effect.
    async fn emit_event(&self, kind: EventKind, fields: Value) -> Result<String, BridgeError>;

    /// Read events of the filtered type(s) strictly after `cursor`,
    /// oldest-first, up to `limit` entries. Malformed entries are logged
    /// and skipped rather than failing the whole batch.
    async fn query_events(
        &self,
        filter: &EventFilter,
        cursor: EventCursor,
        limit: u32,
        order: Order,
    ) -> Result<(Vec<LedgerEvent>, EventCursor), BridgeError>;

    /// Read a contract-owned object's current state.
    async fn query_object(&self, id: &str) -> Result<ObjectState, BridgeError>;
}

/// Backoff schedule shared by every adapter implementation: exponential
/// with a jittered ceiling, so a flapping ledger RPC never busy-loops the
/// poller while still recovering promptly once it comes back.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    pub base: Duration,
    pub max: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(200),
            max: Duration::from_secs(30),
        }
    }
}

impl Backoff {
    /// Delay for retry attempt `n` (0-indexed), with up to 50% jitter.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = self.base.saturating_mul(1u32 << attempt.min(16));
        let capped = exp.min(self.max);
        let jitter_frac: f64 = rand::random::<f64>() * 0.5;
        capped.mul_f64(1.0 - jitter_frac)
    }
}
