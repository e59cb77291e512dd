//! Attestation Provider (C3) — a single `attest()` call producing an
//! opaque blob the rest of the core never inspects, only republishes
//! alongside cluster-verification emits and on `/api/v1/attestation`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::TeeMode;
use crate::error::BridgeError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attestation {
    pub measurement: String,
    pub signature: String,
    pub certificate: String,
    pub tee_type: String,
    pub security_level: String,
    pub generated_at: DateTime<Utc>,
}

#[async_trait]
pub trait Attestor: Send + Sync {
    async fn attest(&self) -> Result<Attestation, BridgeError>;
}

/// Deterministic, hardware-free attestation for local/dev runs. The
/// measurement is a BLAKE3 hash of the enclave identity string, which is
/// sufficient to exercise every downstream consumer of the blob.
pub struct SimulatedAttestor {
    enclave_identity: String,
}

impl SimulatedAttestor {
    pub fn new(enclave_identity: impl Into<String>) -> Self {
        Self {
            enclave_identity: enclave_identity.into(),
        }
    }
}

#[async_trait]
impl Attestor for SimulatedAttestor {
    async fn attest(&self) -> Result<Attestation, BridgeError> {
        let measurement = blake3::hash(self.enclave_identity.as_bytes()).to_hex().to_string();
        Ok(Attestation {
            measurement,
            signature: format!("sim-sig-{}", &self.enclave_identity),
            certificate: "simulated".to_string(),
            tee_type: "simulation".to_string(),
            security_level: "none".to_string(),
            generated_at: Utc::now(),
        })
    }
}

/// Real-hardware attestation. This core does not implement any specific
/// TEE vendor SDK; wiring one in is the replacement described in §4.3 —
/// until then, constructing this in `tee_mode = real` without hardware
/// wiring is itself a configuration error.
pub struct RealAttestor;

#[async_trait]
impl Attestor for RealAttestor {
    async fn attest(&self) -> Result<Attestation, BridgeError> {
        Err(BridgeError::Config(
            "real attestation hardware is not wired into this build".to_string(),
        ))
    }
}

/// Construct the attestor implied by `tee_mode`.
pub fn attestor_for_mode(mode: TeeMode, enclave_identity: &str) -> Box<dyn Attestor> {
    match mode {
        TeeMode::Simulation => Box::new(SimulatedAttestor::new(enclave_identity.to_string())),
        TeeMode::Real => Box::new(RealAttestor),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn simulated_attestation_is_deterministic() {
        let a = SimulatedAttestor::new("node-1").attest().await.unwrap();
        let b = SimulatedAttestor::new("node-1").attest().await.unwrap();
        assert_eq!(a.measurement, b.measurement);
    }

    #[tokio::test]
    async fn real_attestor_without_hardware_errors() {
        let result = RealAttestor.attest().await;
        assert!(result.is_err());
    }
}
