//! Configuration loading and validation.
//!
//! All tunables named in the external-interfaces configuration list, plus
//! the ambient logging/metrics/persistence settings the rest of the
//! process needs at startup.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TeeMode {
    Simulation,
    Real,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Pretty,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub listen_address: String,
    pub listen_port: u16,

    pub ledger_rpc_url: String,
    pub contract_package_id: String,
    pub signer_handle: Option<String>,

    pub min_node_stake: u64,
    pub min_user_stake: u64,
    pub min_admin_stake: u64,

    pub poll_interval_secs: u64,
    pub event_batch_limit: u32,

    pub gateway_await_timeout_secs: u64,
    pub exec_timeout_secs: u64,
    pub exec_parallelism: usize,

    pub heartbeat_timeout_secs: u64,
    pub pending_ttl_secs: u64,
    pub seal_cache_ttl_secs: u64,

    pub queue_capacity: usize,
    pub max_captured_output_bytes: usize,

    pub tee_mode: TeeMode,

    pub cursor_state_path: String,
    pub workers_state_path: String,

    pub metrics_address: String,
    pub log_level: String,
    pub log_format: LogFormat,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_address: "0.0.0.0".to_string(),
            listen_port: 8080,
            ledger_rpc_url: "http://localhost:9000".to_string(),
            contract_package_id: "0x0".to_string(),
            signer_handle: None,
            min_node_stake: 1_000_000_000,
            min_user_stake: 500_000_000,
            min_admin_stake: 10_000_000_000,
            poll_interval_secs: 3,
            event_batch_limit: 50,
            gateway_await_timeout_secs: 30,
            exec_timeout_secs: 60,
            exec_parallelism: 4,
            heartbeat_timeout_secs: 300,
            pending_ttl_secs: 300,
            seal_cache_ttl_secs: 300,
            queue_capacity: 1024,
            max_captured_output_bytes: 64 * 1024,
            tee_mode: TeeMode::Simulation,
            cursor_state_path: "./cursor.state".to_string(),
            workers_state_path: "./workers.state".to_string(),
            metrics_address: "0.0.0.0:9090".to_string(),
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file and validate it eagerly.
    pub fn load_from_file(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate cross-field invariants that a malformed TOML file could
    /// otherwise smuggle past `serde`.
    pub fn validate(&self) -> Result<()> {
        if self.tee_mode == TeeMode::Real && self.signer_handle.is_none() {
            return Err(anyhow!("tee_mode = real requires signer_handle to be set"));
        }

        if self.listen_port == 0 {
            return Err(anyhow!("listen_port must be nonzero"));
        }

        if self.poll_interval_secs == 0 {
            return Err(anyhow!("poll_interval_secs must be positive"));
        }

        if self.exec_parallelism == 0 {
            return Err(anyhow!("exec_parallelism must be positive"));
        }

        if self.min_node_stake == 0 || self.min_user_stake == 0 {
            return Err(anyhow!("minimum stake tunables must be positive"));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn real_tee_without_signer_is_rejected() {
        let mut config = Config::default();
        config.tee_mode = TeeMode::Real;
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_port_is_rejected() {
        let mut config = Config::default();
        config.listen_port = 0;
        assert!(config.validate().is_err());
    }
}
