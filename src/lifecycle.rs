//! Lifecycle & Supervision (C9) — startup ordering, one root cancellation
//! signal, periodic sweepers, and staged shutdown.
//!
//! Grounding: staged startup/shutdown follows `daemon_tree.rs` and
//! `MetanodeClusterManager`'s construction order (registries and
//! channels built before the tree that depends on them is spun up);
//! narrowed here to the concrete C1..C8 ordering spec.md §4.9 mandates.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use axum::extract::State as AxumState;
use axum::routing::get;
use prometheus::{Encoder, Registry, TextEncoder};
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::attestation::{attestor_for_mode, Attestor};
use crate::config::Config;
use crate::correlator::Correlator;
use crate::executor::Executor;
use crate::gateway::{self, GatewayState};
use crate::ledger::LedgerAdapter;
use crate::model::WorkerStatus;
use crate::persistence;
use crate::poller::EventPoller;
use crate::registry::{JoinTokenIssuer, WorkerRegistry};
use crate::seal::{LedgerStakeSource, SealTokenValidator};

const CONTRACT_MODULE: &str = "k8s_bridge";
const GATEWAY_DRAIN_GRACE: Duration = Duration::from_secs(10);
const HEARTBEAT_SWEEP_INTERVAL: Duration = Duration::from_secs(30);
const CURSOR_FLUSH_INTERVAL: Duration = Duration::from_secs(10);

type Stake<L> = LedgerStakeSource<L>;

/// Bundles every long-lived component the bridge needs, wired together in
/// the order §4.9 specifies. Generic over the ledger adapter only — the
/// stake source is always the same ledger, fixed as `LedgerStakeSource<L>`.
pub struct Bridge<L: LedgerAdapter + 'static> {
    config: Config,
    ledger: Arc<L>,
    correlator: Arc<Correlator>,
    executor: Arc<dyn Executor>,
    registry: Arc<WorkerRegistry<L, Stake<L>>>,
    poller: Arc<EventPoller<L, Stake<L>>>,
    attestor: Arc<dyn Attestor>,
    validator: Arc<SealTokenValidator<Stake<L>>>,
    metrics_registry: Registry,
    ready: Arc<AtomicBool>,
    node_id: String,
}

impl<L: LedgerAdapter + 'static> Bridge<L> {
    /// Startup order, §4.9: attestation self-test, then a ledger
    /// connectivity probe, before any of C5/C6/C7/C4 are constructed.
    /// Either failing before C8 binds is a fatal, typed startup error.
    pub async fn bootstrap(
        config: Config,
        ledger: Arc<L>,
        executor: Arc<dyn Executor>,
        join_issuer: Arc<dyn JoinTokenIssuer>,
        node_id: String,
    ) -> Result<Self> {
        let attestor: Arc<dyn Attestor> = Arc::from(attestor_for_mode(config.tee_mode, &node_id));
        attestor.attest().await.context("attestation self-test failed")?;
        info!("attestation self-test passed");

        probe_ledger(&ledger).await.context("ledger connectivity probe failed")?;
        info!("ledger connectivity probe passed");

        let stake_source = Arc::new(LedgerStakeSource::new(ledger.clone()));
        let validator = Arc::new(SealTokenValidator::with_admin_tier(
            stake_source,
            config.min_user_stake,
            config.min_admin_stake,
            Duration::from_secs(config.seal_cache_ttl_secs),
        ));

        let correlator = Arc::new(Correlator::new(Duration::from_secs(config.pending_ttl_secs)));

        let registry = Arc::new(WorkerRegistry::new(
            ledger.clone(),
            validator.clone(),
            join_issuer,
            config.min_node_stake,
            Duration::from_secs(config.heartbeat_timeout_secs),
        ));

        if let Ok(snapshot) = persistence::load_workers(&config.workers_state_path) {
            if !snapshot.workers.is_empty() {
                info!(count = snapshot.workers.len(), "restored worker registry from disk");
                registry.restore(snapshot.workers).await;
            }
        }

        let metrics_registry = Registry::new();
        let poller = Arc::new(EventPoller::new(
            ledger.clone(),
            correlator.clone(),
            executor.clone(),
            registry.clone(),
            node_id.clone(),
            config.contract_package_id.clone(),
            CONTRACT_MODULE.to_string(),
            Duration::from_secs(config.poll_interval_secs),
            config.event_batch_limit,
            config.queue_capacity,
            &metrics_registry,
        ));

        if let Ok(snapshot) = persistence::load_cursors(&config.cursor_state_path) {
            poller.restore_cursors(&snapshot.cursors);
        }

        Ok(Self {
            config,
            ledger,
            correlator,
            executor,
            registry,
            poller,
            attestor,
            validator,
            metrics_registry,
            ready: Arc::new(AtomicBool::new(false)),
            node_id,
        })
    }

    pub fn metrics_registry(&self) -> &Registry {
        &self.metrics_registry
    }

    /// Runs until a shutdown signal (ctrl-c) arrives, then drains in the
    /// reverse order of startup: gateway first (10s grace), then the
    /// poller, then registry/executor/correlator, then the ledger is left
    /// to its own `Drop`/connection-pool teardown.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut background = Vec::new();
        background.extend(self.poller.clone().spawn(shutdown_rx.clone()));
        background.push(tokio::spawn(self.correlator.clone().run_sweeper(shutdown_rx.clone())));
        background.push(tokio::spawn(self.clone().heartbeat_sweep_loop(shutdown_rx.clone())));
        background.push(tokio::spawn(self.clone().cursor_flush_loop(shutdown_rx.clone())));
        background.push(tokio::spawn(self.clone().health_check_loop(shutdown_rx.clone())));
        background.push(tokio::spawn(self.clone().readiness_watch_loop(shutdown_rx.clone())));
        background.push(tokio::spawn(self.clone().metrics_server_loop(shutdown_rx.clone())));

        let gateway_state = Arc::new(GatewayState {
            ledger: self.ledger.clone(),
            correlator: self.correlator.clone(),
            validator: self.validator.clone(),
            attestor: self.attestor.clone(),
            await_timeout: Duration::from_secs(self.config.gateway_await_timeout_secs),
            ready: self.ready.clone(),
        });
        let router = gateway::build_router(gateway_state);

        let addr: SocketAddr = format!("{}:{}", self.config.listen_address, self.config.listen_port)
            .parse()
            .context("invalid listen_address/listen_port")?;
        let listener = tokio::net::TcpListener::bind(addr).await.context("failed to bind gateway listener")?;
        info!(%addr, "gateway bound, serving kubectl pass-through traffic");

        let mut shutdown_rx_for_serve = shutdown_rx.clone();
        let ctrl_c_watcher = tokio::spawn(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "failed to install ctrl-c handler");
            }
            let _ = shutdown_tx.send(true);
        });

        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx_for_serve.changed().await;
                info!("gateway draining in-flight requests");
            })
            .await
            .context("gateway server error")?;

        ctrl_c_watcher.abort();
        for handle in background {
            let _ = tokio::time::timeout(GATEWAY_DRAIN_GRACE, handle).await;
        }

        self.flush_state().await;
        info!("bridge shut down cleanly");
        Ok(())
    }

    async fn heartbeat_sweep_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(HEARTBEAT_SWEEP_INTERVAL);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.registry.sweep_heartbeats().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    }

    async fn cursor_flush_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(CURSOR_FLUSH_INTERVAL);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.flush_state().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    }

    async fn health_check_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(HEARTBEAT_SWEEP_INTERVAL);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if !self.executor.health_check().await {
                        warn!("control-plane health check failed");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    }

    /// `/readyz` per §6 is ready once the gateway has bound (true by the
    /// time this loop starts) and the poller has completed at least one
    /// successful poll.
    async fn readiness_watch_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(Duration::from_millis(200));
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if self.poller.has_polled_once() {
                        self.ready.store(true, Ordering::SeqCst);
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    }

    /// Serves `/metrics` for Prometheus scraping on `config.metrics_address`,
    /// separate from the gateway listener so a scraper never competes with
    /// kubectl pass-through traffic for the same port.
    async fn metrics_server_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let addr: SocketAddr = match self.config.metrics_address.parse() {
            Ok(addr) => addr,
            Err(e) => {
                warn!(error = %e, address = %self.config.metrics_address, "invalid metrics_address, metrics exporter disabled");
                return;
            }
        };

        let listener = match tokio::net::TcpListener::bind(addr).await {
            Ok(listener) => listener,
            Err(e) => {
                warn!(error = %e, %addr, "failed to bind metrics listener, metrics exporter disabled");
                return;
            }
        };
        info!(%addr, "metrics exporter bound");

        let router = axum::Router::new()
            .route("/metrics", get(metrics_handler))
            .with_state(self.metrics_registry.clone());

        if let Err(e) = axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                let _ = shutdown.changed().await;
            })
            .await
        {
            warn!(error = %e, "metrics exporter server error");
        }
    }

    async fn flush_state(&self) {
        let cursors = self.poller.cursor_snapshot();
        if let Err(e) = persistence::save_cursors(&self.config.cursor_state_path, &cursors) {
            warn!(error = %e, "failed to persist cursor state");
        }
        let workers = self.registry.snapshot().await;
        if let Err(e) = persistence::save_workers(&self.config.workers_state_path, &workers) {
            warn!(error = %e, "failed to persist worker registry snapshot");
        }
    }
}

/// Renders the process metrics registry in Prometheus text exposition
/// format. `metrics_address` is intentionally a separate bind from the
/// gateway port (§11) so scraping never shares a listener with kubectl
/// pass-through traffic.
async fn metrics_handler(AxumState(registry): AxumState<Registry>) -> String {
    let metric_families = registry.gather();
    let mut buffer = Vec::new();
    if let Err(e) = TextEncoder::new().encode(&metric_families, &mut buffer) {
        error!(error = %e, "failed to encode metrics");
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

/// A cheap, bounded probe that the ledger RPC endpoint is reachable
/// before any downstream component is constructed. Any definite answer
/// (found or not-found) counts as reachable; only a transport-level
/// failure is fatal at startup.
async fn probe_ledger<L: LedgerAdapter>(ledger: &Arc<L>) -> Result<()> {
    match tokio::time::timeout(Duration::from_secs(10), ledger.query_object("__startup_probe__")).await {
        Ok(Ok(_)) => Ok(()),
        Ok(Err(e)) => Err(anyhow!("ledger rejected startup probe: {e}")),
        Err(_) => Err(anyhow!("ledger did not respond to startup probe within 10s")),
    }
}

/// Marks a worker slashed and logs the taxonomy tag expected by §7's
/// "worker anomalies ... no user-facing error path" clause. Exposed for
/// the (out-of-band) slashing-event path; no direct spec.md caller today
/// since slashing detection lives on the ledger side of the boundary.
#[allow(dead_code)]
pub async fn slash_worker<L: LedgerAdapter + 'static>(bridge: &Bridge<L>, node_id: &str) {
    bridge.registry.slash(node_id).await;
    info!(node_id, status = ?WorkerStatus::Slashed, "worker slashed");
}
