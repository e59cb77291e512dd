//! Error taxonomy shared by every component (C1-C9).

use thiserror::Error;

/// Canonical error type returned by the core's fallible operations.
///
/// Each variant corresponds to a taxonomy entry; the HTTP edge (C8) maps
/// these onto Kubernetes `Status` bodies, and the logging call sites attach
/// the variant name as the error taxonomy tag.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("malformed seal token: {0}")]
    Malformed(String),

    #[error("seal token expired")]
    Expired,

    #[error("stake below required tier: have {have}, need {need}")]
    StakeInsufficient { have: u64, need: u64 },

    #[error("wallet stake is not active")]
    StakeInactive,

    #[error("ledger unavailable: {0}")]
    LedgerUnavailable(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("transient failure: {0}")]
    Transient(String),

    #[error("rejected by ledger: {0}")]
    Rejected(String),

    #[error("fatal error: {0}")]
    Fatal(String),

    #[error("control plane not ready")]
    ControlPlaneNotReady,

    #[error("executor failure: {0}")]
    ExecutorFailure(String),

    #[error("correlator timeout")]
    CorrelatorTimeout,

    #[error("request not found: {0}")]
    NotFound(String),

    #[error("request already registered: {0}")]
    AlreadyRegistered(String),
}

impl BridgeError {
    /// A short, stable tag used in structured logs and in `Status.reason`.
    pub fn tag(&self) -> &'static str {
        match self {
            BridgeError::Malformed(_) => "Malformed",
            BridgeError::Expired => "Expired",
            BridgeError::StakeInsufficient { .. } => "StakeInsufficient",
            BridgeError::StakeInactive => "StakeInactive",
            BridgeError::LedgerUnavailable(_) => "LedgerUnavailable",
            BridgeError::Config(_) => "Config",
            BridgeError::Transient(_) => "Transient",
            BridgeError::Rejected(_) => "Rejected",
            BridgeError::Fatal(_) => "Fatal",
            BridgeError::ControlPlaneNotReady => "ControlPlaneNotReady",
            BridgeError::ExecutorFailure(_) => "ExecutorFailure",
            BridgeError::CorrelatorTimeout => "CorrelatorTimeout",
            BridgeError::NotFound(_) => "NotFound",
            BridgeError::AlreadyRegistered(_) => "AlreadyRegistered",
        }
    }

    /// HTTP status code this error maps to at the gateway edge.
    pub fn http_status(&self) -> u16 {
        match self {
            BridgeError::Malformed(_)
            | BridgeError::Expired
            | BridgeError::StakeInsufficient { .. }
            | BridgeError::StakeInactive => 401,
            BridgeError::NotFound(_) => 404,
            BridgeError::AlreadyRegistered(_) => 409,
            BridgeError::CorrelatorTimeout => 504,
            BridgeError::ControlPlaneNotReady | BridgeError::LedgerUnavailable(_) => 503,
            BridgeError::Config(_) | BridgeError::Fatal(_) => 500,
            BridgeError::Transient(_) | BridgeError::Rejected(_) | BridgeError::ExecutorFailure(_) => 502,
        }
    }
}
