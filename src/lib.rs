//! `seal-control` — the event-driven orchestration core of a
//! blockchain-mediated Kubernetes control bridge.
//!
//! See each module's doc comment for its place in the pipeline: ledger
//! ingestion (`ledger`, `poller`), stake-authenticated admission (`seal`),
//! request correlation (`correlator`), execution (`executor`), worker
//! lifecycle (`registry`), the HTTP edge (`gateway`), and process
//! supervision (`lifecycle`).

pub mod attestation;
pub mod config;
pub mod correlator;
pub mod error;
pub mod executor;
pub mod gateway;
pub mod ledger;
pub mod lifecycle;
pub mod model;
pub mod persistence;
pub mod poller;
pub mod registry;
pub mod seal;
pub mod util;
