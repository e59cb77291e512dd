//! Worker Registry & Scheduler (C7) — tracks worker identities through the
//! five-state lifecycle, issues cluster-join credentials on registration,
//! and scores/picks workers for a requester's API traffic.
//!
//! Grounding: the `Arc<RwLock<HashMap<..>>>` + broadcast-event shape
//! mirrors `MetanodeClusterManager`'s node registry and `event_tx`
//! channel, narrowed to the single `WorkerNode` record this spec needs.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, RwLock};
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::BridgeError;
use crate::ledger::{EventKind, LedgerAdapter};
use crate::model::{NodeId, WalletAddress, WorkerAction, WorkerNode, WorkerNodeEvent, WorkerStatus};
use crate::seal::{SealTokenValidator, StakeSource};

/// The local control plane's boot-token facility: issues a credential a
/// worker can use to join the cluster. Kept as a trait so the registry
/// never depends on the concrete control-plane binary.
#[async_trait]
pub trait JoinTokenIssuer: Send + Sync {
    async fn issue(&self, node_id: &NodeId) -> Result<String, BridgeError>;
}

/// Mints a fresh random token string. Stands in for the real control
/// plane's bootstrap-token API (`kubeadm token create`-shaped), which the
/// spec treats as out-of-scope tooling the core merely invokes.
pub struct RandomJoinTokenIssuer;

#[async_trait]
impl JoinTokenIssuer for RandomJoinTokenIssuer {
    async fn issue(&self, _node_id: &NodeId) -> Result<String, BridgeError> {
        Ok(format!("join_{}", Uuid::new_v4().simple()))
    }
}

/// Emitted on every worker state transition. Consumed by the readiness
/// aggregation and by tests — an internal signal, never a wire event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerTransitioned {
    pub node_id: NodeId,
    pub from: Option<WorkerStatus>,
    pub to: WorkerStatus,
}

struct Inner {
    workers: HashMap<NodeId, WorkerNode>,
    owners: HashMap<WalletAddress, Vec<NodeId>>,
    load: HashMap<NodeId, u32>,
}

/// Worker registry: single `RwLock` guards structural changes; the
/// scheduler reads a cloned snapshot rather than holding the lock across
/// its scoring pass.
pub struct WorkerRegistry<L: LedgerAdapter, S: StakeSource> {
    inner: RwLock<Inner>,
    ledger: Arc<L>,
    validator: Arc<SealTokenValidator<S>>,
    issuer: Arc<dyn JoinTokenIssuer>,
    min_node_stake: u64,
    heartbeat_timeout: Duration,
    events: broadcast::Sender<WorkerTransitioned>,
}

impl<L: LedgerAdapter, S: StakeSource> WorkerRegistry<L, S> {
    pub fn new(
        ledger: Arc<L>,
        validator: Arc<SealTokenValidator<S>>,
        issuer: Arc<dyn JoinTokenIssuer>,
        min_node_stake: u64,
        heartbeat_timeout: Duration,
    ) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            inner: RwLock::new(Inner {
                workers: HashMap::new(),
                owners: HashMap::new(),
                load: HashMap::new(),
            }),
            ledger,
            validator,
            issuer,
            min_node_stake,
            heartbeat_timeout,
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WorkerTransitioned> {
        self.events.subscribe()
    }

    fn notify(&self, node_id: &NodeId, from: Option<WorkerStatus>, to: WorkerStatus) {
        let _ = self.events.send(WorkerTransitioned {
            node_id: node_id.clone(),
            from,
            to,
        });
    }

    /// Restores a previously persisted registry snapshot on warm restart
    /// (§6 "persisted state"). Caller is responsible for reconciling
    /// against the ledger within the first poll cycle, per §4.9.
    pub async fn restore(&self, workers: Vec<WorkerNode>) {
        let mut inner = self.inner.write().await;
        for worker in workers {
            inner.owners.entry(worker.owner_wallet.clone()).or_default().push(worker.node_id.clone());
            inner.workers.insert(worker.node_id.clone(), worker);
        }
    }

    pub async fn snapshot(&self) -> Vec<WorkerNode> {
        self.inner.read().await.workers.values().cloned().collect()
    }

    pub async fn active_workers(&self) -> Vec<NodeId> {
        self.inner
            .read()
            .await
            .workers
            .values()
            .filter(|w| w.status == WorkerStatus::Active)
            .map(|w| w.node_id.clone())
            .collect()
    }

    pub async fn get(&self, node_id: &str) -> Option<WorkerNode> {
        self.inner.read().await.workers.get(node_id).cloned()
    }

    /// Applies a `WorkerNodeEvent` observed by the poller (§4.7). Returns
    /// the issued join token on a successful registration, so the caller
    /// can publish it on-chain via `set_join_token`.
    pub async fn apply_event(&self, event: WorkerNodeEvent) -> Result<Option<String>, BridgeError> {
        match event.action {
            WorkerAction::Register => self.register(event).await.map(Some),
            WorkerAction::Unregister => {
                self.unregister(&event.node_id).await;
                Ok(None)
            }
            WorkerAction::Heartbeat => {
                self.heartbeat(&event.node_id, event.timestamp).await;
                Ok(None)
            }
        }
    }

    /// Registration flow, §4.7:
    /// 1. validate seal token + minimum stake
    /// 2. reject node-id already owned by a different wallet
    /// 3. issue a join token locally
    /// 4. store it on the record and emit `set_join_token` on-chain
    /// 5. mark `pending -> active`
    async fn register(&self, event: WorkerNodeEvent) -> Result<String, BridgeError> {
        let (_, _) = self.validator.validate(&event.seal_token).await?;

        if event.stake_amount < self.min_node_stake {
            return Err(BridgeError::StakeInsufficient {
                have: event.stake_amount,
                need: self.min_node_stake,
            });
        }

        {
            let inner = self.inner.read().await;
            if let Some(existing) = inner.workers.get(&event.node_id) {
                if existing.owner_wallet != event.worker_address {
                    warn!(node_id = %event.node_id, "node-id already registered under a different owner");
                    return Err(BridgeError::AlreadyRegistered(event.node_id));
                }
            }
        }

        let join_token = self.issuer.issue(&event.node_id).await?;

        self.ledger
            .emit_event(
                EventKind::SetJoinToken,
                serde_json::json!({
                    "node_id": event.node_id,
                    // TODO: confirm the real `set_join_token` entry's argument
                    // order/types against the deployed Move module before
                    // wiring this against a live contract (spec.md §9).
                    "join_token": join_token,
                }),
            )
            .await?;

        let now = Utc::now();
        let mut inner = self.inner.write().await;
        inner.owners.entry(event.worker_address.clone()).or_default().push(event.node_id.clone());
        inner.workers.insert(
            event.node_id.clone(),
            WorkerNode {
                node_id: event.node_id.clone(),
                owner_wallet: event.worker_address,
                stake_amount: event.stake_amount,
                status: WorkerStatus::Active,
                seal_token: event.seal_token,
                join_token: Some(join_token.clone()),
                registered_at: now,
                last_heartbeat: now,
                total_pods_served: 0,
                reputation_score: WorkerNode::DEFAULT_REPUTATION,
            },
        );
        drop(inner);

        info!(node_id = %event.node_id, "worker registered and activated");
        self.notify(&event.node_id, Some(WorkerStatus::Pending), WorkerStatus::Active);
        Ok(join_token)
    }

    async fn unregister(&self, node_id: &str) {
        let mut inner = self.inner.write().await;
        if let Some(worker) = inner.workers.remove(node_id) {
            if let Some(ids) = inner.owners.get_mut(&worker.owner_wallet) {
                ids.retain(|id| id != node_id);
            }
            inner.load.remove(node_id);
        }
    }

    async fn heartbeat(&self, node_id: &str, at: DateTime<Utc>) {
        let mut inner = self.inner.write().await;
        let Some(worker) = inner.workers.get_mut(node_id) else {
            return;
        };
        worker.last_heartbeat = at;
        if worker.status == WorkerStatus::Offline {
            worker.status = WorkerStatus::Active;
            drop(inner);
            self.notify(node_id, Some(WorkerStatus::Offline), WorkerStatus::Active);
        }
    }

    /// Marks a worker `busy`/`active` for load-weighting purposes while an
    /// API request is in flight against it.
    pub async fn mark_busy(&self, node_id: &str) {
        let mut inner = self.inner.write().await;
        *inner.load.entry(node_id.to_string()).or_insert(0) += 1;
        if let Some(worker) = inner.workers.get_mut(node_id) {
            if worker.status == WorkerStatus::Active {
                worker.status = WorkerStatus::Busy;
            }
        }
    }

    pub async fn mark_idle(&self, node_id: &str, served_one_more: bool) {
        let mut inner = self.inner.write().await;
        if let Some(load) = inner.load.get_mut(node_id) {
            *load = load.saturating_sub(1);
        }
        let load_now = inner.load.get(node_id).copied().unwrap_or(0);
        if let Some(worker) = inner.workers.get_mut(node_id) {
            if served_one_more {
                worker.total_pods_served += 1;
            }
            if worker.status == WorkerStatus::Busy && load_now == 0 {
                worker.status = WorkerStatus::Active;
            }
        }
    }

    /// Flips workers silent for longer than `heartbeat_timeout` to
    /// `offline`, removing them from `active_workers`. Intended to run on
    /// its own 30s-interval task for the process lifetime.
    pub async fn sweep_heartbeats(&self) -> Vec<NodeId> {
        let now = Utc::now();
        let mut offlined = Vec::new();
        let mut inner = self.inner.write().await;
        for worker in inner.workers.values_mut() {
            if worker.status == WorkerStatus::Active || worker.status == WorkerStatus::Busy {
                let silence = now.signed_duration_since(worker.last_heartbeat);
                if silence.to_std().map(|d| d >= self.heartbeat_timeout).unwrap_or(false) {
                    worker.status = WorkerStatus::Offline;
                    offlined.push(worker.node_id.clone());
                }
            }
        }
        drop(inner);
        for node_id in &offlined {
            warn!(node_id = %node_id, "worker heartbeat timed out, marking offline");
            self.notify(node_id, Some(WorkerStatus::Active), WorkerStatus::Offline);
        }
        offlined
    }

    pub async fn slash(&self, node_id: &str) {
        let mut inner = self.inner.write().await;
        if let Some(worker) = inner.workers.get_mut(node_id) {
            let from = worker.status;
            worker.status = WorkerStatus::Slashed;
            drop(inner);
            self.notify(node_id, Some(from), WorkerStatus::Slashed);
        }
    }

    /// Scheduling policy (§4.7): candidates are workers owned by
    /// `requester` with status `active`; score by load and reputation,
    /// doubled for high-priority requests; ties broken by earlier
    /// `registered_at`.
    pub async fn pick_worker(&self, requester: &WalletAddress, priority: u8) -> Option<NodeId> {
        let inner = self.inner.read().await;
        let node_ids = inner.owners.get(requester)?;

        let mut best: Option<(&WorkerNode, f64)> = None;
        for node_id in node_ids {
            let Some(worker) = inner.workers.get(node_id) else { continue };
            if worker.status != WorkerStatus::Active {
                continue;
            }
            let load = inner.load.get(node_id).copied().unwrap_or(0);
            let reputation = worker.reputation_score as f64;
            let base_score = if load == 0 {
                reputation * 10.0
            } else {
                reputation / (load as f64 + 1.0)
            };
            let score = if priority >= 8 { base_score * 2.0 } else { base_score };

            best = match best {
                None => Some((worker, score)),
                Some((current, current_score)) => {
                    if score > current_score
                        || (score == current_score && worker.registered_at < current.registered_at)
                    {
                        Some((worker, score))
                    } else {
                        Some((current, current_score))
                    }
                }
            };
        }

        best.map(|(w, _)| w.node_id.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::MockLedgerAdapter;
    use crate::model::SUI;
    use crate::seal::StakeInfo;
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use base64::Engine;
    use ed25519_dalek::{Signer, SigningKey};
    use rand::rngs::OsRng;
    use std::sync::OnceLock;

    fn signing_key() -> &'static SigningKey {
        static KEY: OnceLock<SigningKey> = OnceLock::new();
        KEY.get_or_init(|| SigningKey::generate(&mut OsRng))
    }

    struct AlwaysActiveStake;

    #[async_trait::async_trait]
    impl StakeSource for AlwaysActiveStake {
        async fn stake_status(&self, _wallet: &WalletAddress) -> Result<StakeInfo, BridgeError> {
            Ok(StakeInfo {
                stake_amount: SUI,
                active: true,
                public_key: signing_key().verifying_key().to_bytes(),
            })
        }
    }

    fn validator() -> Arc<SealTokenValidator<AlwaysActiveStake>> {
        Arc::new(SealTokenValidator::new(Arc::new(AlwaysActiveStake), SUI / 2, Duration::from_secs(300)))
    }

    /// Builds a wire-format seal token signed by the fixed test keypair, in
    /// the same shape `seal::parse_seal_token`/`verify_signature` expect.
    fn signed_seal_token(wallet: &str, stake: u64) -> String {
        #[derive(serde::Serialize)]
        struct Wire {
            wallet_address: String,
            signature: String,
            challenge: String,
            issued_at: DateTime<Utc>,
            expires_at: DateTime<Utc>,
            stake_amount: u64,
        }

        let issued_at = Utc::now();
        let challenge = "chal-registry-test".to_string();
        let mut message = Vec::new();
        message.extend_from_slice(challenge.as_bytes());
        message.extend_from_slice(issued_at.to_rfc3339().as_bytes());
        message.extend_from_slice(wallet.as_bytes());
        let signature = signing_key().sign(&message);

        let wire = Wire {
            wallet_address: wallet.to_string(),
            signature: hex::encode(signature.to_bytes()),
            challenge,
            issued_at,
            expires_at: issued_at + chrono::Duration::minutes(5),
            stake_amount: stake,
        };
        let json = serde_json::to_vec(&wire).unwrap();
        format!("seal_{}", URL_SAFE_NO_PAD.encode(json))
    }

    fn sample_event(node_id: &str, owner: &str) -> WorkerNodeEvent {
        WorkerNodeEvent {
            action: WorkerAction::Register,
            node_id: node_id.to_string(),
            seal_token: signed_seal_token(owner, SUI),
            stake_amount: SUI,
            worker_address: owner.to_string(),
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn heartbeat_timeout_removes_from_active_workers() {
        let ledger = Arc::new(MockLedgerAdapter::new());
        let registry = WorkerRegistry::new(
            ledger,
            validator(),
            Arc::new(RandomJoinTokenIssuer),
            SUI,
            Duration::from_millis(1),
        );

        let mut inner = registry.inner.write().await;
        inner.workers.insert(
            "w1".to_string(),
            WorkerNode {
                node_id: "w1".to_string(),
                owner_wallet: "0xowner".to_string(),
                stake_amount: SUI,
                status: WorkerStatus::Active,
                seal_token: "seal_x".to_string(),
                join_token: None,
                registered_at: Utc::now() - chrono::Duration::seconds(10),
                last_heartbeat: Utc::now() - chrono::Duration::seconds(10),
                total_pods_served: 0,
                reputation_score: 100,
            },
        );
        inner.owners.entry("0xowner".to_string()).or_default().push("w1".to_string());
        drop(inner);

        let offlined = registry.sweep_heartbeats().await;
        assert_eq!(offlined, vec!["w1".to_string()]);
        assert!(registry.active_workers().await.is_empty());
    }

    #[tokio::test]
    async fn scheduler_prefers_idle_high_reputation_worker() {
        let ledger = Arc::new(MockLedgerAdapter::new());
        let registry = WorkerRegistry::new(ledger, validator(), Arc::new(RandomJoinTokenIssuer), SUI, Duration::from_secs(300));

        let mut inner = registry.inner.write().await;
        for (id, load, rep) in [("w1", 3u32, 100i64), ("w2", 0u32, 100i64)] {
            inner.workers.insert(
                id.to_string(),
                WorkerNode {
                    node_id: id.to_string(),
                    owner_wallet: "0xowner".to_string(),
                    stake_amount: SUI,
                    status: WorkerStatus::Active,
                    seal_token: "seal_x".to_string(),
                    join_token: None,
                    registered_at: Utc::now(),
                    last_heartbeat: Utc::now(),
                    total_pods_served: 0,
                    reputation_score: rep,
                },
            );
            inner.owners.entry("0xowner".to_string()).or_default().push(id.to_string());
            if load > 0 {
                inner.load.insert(id.to_string(), load);
            }
        }
        drop(inner);

        let picked = registry.pick_worker(&"0xowner".to_string(), 5).await;
        assert_eq!(picked, Some("w2".to_string()));
    }

    #[tokio::test]
    async fn no_candidates_when_owner_has_no_active_workers() {
        let ledger = Arc::new(MockLedgerAdapter::new());
        let registry = WorkerRegistry::new(ledger, validator(), Arc::new(RandomJoinTokenIssuer), SUI, Duration::from_secs(300));
        let picked = registry.pick_worker(&"0xnobody".to_string(), 5).await;
        assert_eq!(picked, None);
    }

    #[tokio::test]
    async fn register_rejects_node_id_owned_by_different_wallet() {
        let ledger = Arc::new(MockLedgerAdapter::new());
        let registry = WorkerRegistry::new(ledger, validator(), Arc::new(RandomJoinTokenIssuer), SUI, Duration::from_secs(300));

        registry.apply_event(sample_event("w1", "0xowner-a")).await.unwrap();
        let result = registry.apply_event(sample_event("w1", "0xowner-b")).await;
        assert!(result.is_err());
    }
}
