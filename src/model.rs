//! Shared data model: identifiers, the seal token, permission derivation,
//! and the event/record types that flow between C1, C4, C5, C6, and C7.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

pub type RequestId = String;
pub type NodeId = String;
pub type WalletAddress = String;
pub type EventCursor = u64;

/// One SUI, expressed in the ledger's native MIST denomination.
pub const SUI: u64 = 1_000_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Delete,
    Patch,
}

impl HttpMethod {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Some(HttpMethod::Get),
            "POST" => Some(HttpMethod::Post),
            "PUT" => Some(HttpMethod::Put),
            "DELETE" => Some(HttpMethod::Delete),
            "PATCH" => Some(HttpMethod::Patch),
            _ => None,
        }
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Delete => "DELETE",
            HttpMethod::Patch => "PATCH",
        };
        f.write_str(s)
    }
}

/// A `(resource, verb)` permission pair. `"*"` on either side is a wildcard.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Permission {
    pub resource: String,
    pub verb: String,
}

impl Permission {
    pub fn new(resource: impl Into<String>, verb: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            verb: verb.into(),
        }
    }

    pub fn wildcard() -> Self {
        Self::new("*", "*")
    }

    pub fn grants(&self, resource: &str, verb: &str) -> bool {
        (self.resource == "*" || self.resource == resource)
            && (self.verb == "*" || self.verb == verb)
    }
}

/// `build_permission(method, resource)`: GET maps to `read`, everything
/// else maps to `write`.
pub fn build_permission(method: HttpMethod, resource: &str) -> String {
    let verb = if method == HttpMethod::Get { "read" } else { "write" };
    format!("{resource}:{verb}")
}

/// Stake-tier permission derivation table from the data model. Cumulative:
/// higher tiers include every grant below them, so the result set is
/// monotonic in stake. The wildcard tier's threshold is the deployment's
/// configured `min_admin_stake` (default 10 SUI, per §6); every other tier
/// boundary is fixed by the data model.
pub fn permissions_for_stake(stake_mist: u64, min_admin_stake: u64) -> HashSet<Permission> {
    let mut grants = HashSet::new();

    if stake_mist >= min_admin_stake {
        grants.insert(Permission::wildcard());
        return grants;
    }
    if stake_mist >= SUI / 2 {
        grants.insert(Permission::new("pods", "read"));
        grants.insert(Permission::new("services", "read"));
        grants.insert(Permission::new("configmaps", "read"));
    }
    if stake_mist >= SUI {
        grants.insert(Permission::new("nodes", "write"));
        grants.insert(Permission::new("pods", "write"));
        grants.insert(Permission::new("services", "write"));
    }
    if stake_mist >= 5 * SUI {
        grants.insert(Permission::new("deployments", "write"));
        grants.insert(Permission::new("secrets", "read"));
        grants.insert(Permission::new("namespaces", "write"));
    }

    grants
}

/// Bearer credential parsed from an `Authorization: Bearer seal_...` header.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SealToken {
    pub wallet_address: WalletAddress,
    pub signature: String,
    pub challenge: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub stake_amount: u64,
    pub permissions: Vec<Permission>,
}

pub const SEAL_TOKEN_PREFIX: &str = "seal_";
pub const SEAL_TOKEN_MIN_LEN: usize = 32;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct K8sApiRequest {
    pub request_id: RequestId,
    pub method: HttpMethod,
    pub resource: String,
    pub namespace: String,
    pub name: Option<String>,
    pub payload: Vec<u8>,
    pub seal_token: String,
    pub requester: WalletAddress,
    pub priority: u8,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct K8sApiResult {
    pub request_id: RequestId,
    pub success: bool,
    pub output: String,
    pub error: String,
    pub execution_time_ms: u64,
    pub executor: NodeId,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerAction {
    Register,
    Unregister,
    Heartbeat,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerNodeEvent {
    pub action: WorkerAction,
    pub node_id: NodeId,
    pub seal_token: String,
    pub stake_amount: u64,
    pub worker_address: WalletAddress,
    pub timestamp: DateTime<Utc>,
}

/// Five-state worker lifecycle (§4.7). `slashed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    Pending,
    Active,
    Busy,
    Offline,
    Slashed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerNode {
    pub node_id: NodeId,
    pub owner_wallet: WalletAddress,
    pub stake_amount: u64,
    pub status: WorkerStatus,
    pub seal_token: String,
    pub join_token: Option<String>,
    pub registered_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    pub total_pods_served: u64,
    pub reputation_score: i64,
}

impl WorkerNode {
    pub const DEFAULT_REPUTATION: i64 = 100;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KubernetesStatus {
    #[serde(rename = "apiVersion")]
    pub api_version: String,
    pub kind: String,
    pub status: String,
    pub reason: String,
    pub message: String,
    pub code: u16,
}

impl KubernetesStatus {
    pub fn failure(reason: &str, message: impl Into<String>, code: u16) -> Self {
        Self {
            api_version: "v1".to_string(),
            kind: "Status".to_string(),
            status: "Failure".to_string(),
            reason: reason.to_string(),
            message: message.into(),
            code,
        }
    }
}

/// Walk a kubectl-shaped path into `(namespace, resource)`.
///
/// `/api/v1/namespaces/<ns>/<resource>/...` -> `(ns, resource)`
/// `/api/v1/<resource>` -> `("default", resource)`
/// An empty or unparseable resource segment becomes `"unknown"`.
pub fn parse_k8s_path(path: &str) -> (String, String) {
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();

    if let Some(ns_idx) = segments.iter().position(|s| *s == "namespaces") {
        let namespace = segments.get(ns_idx + 1).map(|s| s.to_string());
        let resource = segments.get(ns_idx + 2).map(|s| s.to_string());
        return (
            namespace.unwrap_or_else(|| "default".to_string()),
            resource.unwrap_or_else(|| "unknown".to_string()),
        );
    }

    // No explicit namespace segment: first segment after the api group
    // version prefix (api/v1, apis/<group>/<version>) is the resource.
    let skip = if segments.first().map(|s| *s) == Some("apis") { 3 } else { 2 };
    let resource = segments.get(skip).map(|s| s.to_string());
    (
        "default".to_string(),
        resource.unwrap_or_else(|| "unknown".to_string()),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permission_derivation_is_monotonic() {
        let low = permissions_for_stake(SUI / 2, 10 * SUI);
        let mid = permissions_for_stake(SUI, 10 * SUI);
        let high = permissions_for_stake(10 * SUI, 10 * SUI);
        assert!(low.is_subset(&mid));
        assert!(mid.is_subset(&high));
    }

    #[test]
    fn stake_at_boundary_grants_tier() {
        let grants = permissions_for_stake(SUI, 10 * SUI);
        assert!(grants.contains(&Permission::new("nodes", "write")));
    }

    #[test]
    fn build_permission_maps_get_to_read() {
        assert_eq!(build_permission(HttpMethod::Get, "pods"), "pods:read");
        assert_eq!(build_permission(HttpMethod::Post, "pods"), "pods:write");
        assert_eq!(build_permission(HttpMethod::Delete, "pods"), "pods:write");
    }

    #[test]
    fn parse_k8s_path_with_namespace() {
        assert_eq!(
            parse_k8s_path("/api/v1/namespaces/default/pods"),
            ("default".to_string(), "pods".to_string())
        );
    }

    #[test]
    fn parse_k8s_path_without_namespace_defaults() {
        assert_eq!(
            parse_k8s_path("/api/v1/pods"),
            ("default".to_string(), "pods".to_string())
        );
    }

    #[test]
    fn parse_k8s_path_unknown_resource() {
        assert_eq!(
            parse_k8s_path("/api/v1"),
            ("default".to_string(), "unknown".to_string())
        );
    }
}
