//! Gateway (C8) — the HTTP frontend. Receives kubectl-shaped requests,
//! extracts seal tokens, emits on-chain requests via C1, and awaits
//! correlated responses via C5.
//!
//! Grounding: router/handler shape follows `bpci-enterprise/src/cli/web.rs`
//! (axum `Router`, `TcpListener::bind`, `tower_http::cors::CorsLayer`,
//! graceful `axum::serve`), generalized from its fixed `/health`/`/api/*`
//! demo endpoints to the kubectl pass-through contract of §4.8.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get};
use axum::{Json, Router};
use serde_json::json;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};
use uuid::Uuid;

use crate::attestation::Attestor;
use crate::correlator::{AwaitOutcome, Correlator, PendingMeta};
use crate::ledger::{EventKind, LedgerAdapter};
use crate::model::{build_permission, parse_k8s_path, HttpMethod, K8sApiRequest, KubernetesStatus};
use crate::seal::{SealTokenValidator, StakeSource};

pub struct GatewayState<L: LedgerAdapter, S: StakeSource> {
    pub ledger: Arc<L>,
    pub correlator: Arc<Correlator>,
    pub validator: Arc<SealTokenValidator<S>>,
    pub attestor: Arc<dyn Attestor>,
    pub await_timeout: Duration,
    /// Set once C4 has completed its first poll cycle, per §6 `/readyz`.
    pub ready: Arc<AtomicBool>,
}

pub fn build_router<L: LedgerAdapter + 'static, S: StakeSource + 'static>(
    state: Arc<GatewayState<L, S>>,
) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz::<L, S>))
        .route("/api/v1/attestation", get(attestation_endpoint::<L, S>))
        .route("/api", get(discovery_api))
        .route("/apis", get(discovery_apis))
        .route("/api/v1", get(resource_list_core))
        .route("/apis/apps/v1", get(resource_list_apps))
        .route("/api/*path", any(kubectl_passthrough::<L, S>))
        .route("/apis/*path", any(kubectl_passthrough::<L, S>))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn healthz() -> &'static str {
    "OK"
}

async fn readyz<L: LedgerAdapter + 'static, S: StakeSource + 'static>(
    State(state): State<Arc<GatewayState<L, S>>>,
) -> Response {
    if state.ready.load(Ordering::SeqCst) {
        (StatusCode::OK, "Ready").into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "Not Ready").into_response()
    }
}

async fn attestation_endpoint<L: LedgerAdapter + 'static, S: StakeSource + 'static>(
    State(state): State<Arc<GatewayState<L, S>>>,
) -> Response {
    match state.attestor.attest().await {
        Ok(attestation) => Json(attestation).into_response(),
        Err(e) => {
            warn!(error = %e, "attestation failed");
            status_response(KubernetesStatus::failure("AttestationFailed", e.to_string(), 500))
        }
    }
}

fn resource_entry(name: &str, kind: &str) -> serde_json::Value {
    json!({
        "name": name,
        "singularName": kind.to_lowercase(),
        "namespaced": true,
        "kind": kind,
        "verbs": ["create", "delete", "get", "list", "patch", "update", "watch"],
    })
}

async fn discovery_api() -> Json<serde_json::Value> {
    Json(json!({
        "kind": "APIVersions",
        "versions": ["v1"],
        "serverAddressByClientCIDRs": [],
    }))
}

async fn discovery_apis() -> Json<serde_json::Value> {
    Json(json!({
        "kind": "APIGroupList",
        "groups": [{
            "name": "apps",
            "versions": [{"groupVersion": "apps/v1", "version": "v1"}],
            "preferredVersion": {"groupVersion": "apps/v1", "version": "v1"},
        }],
    }))
}

async fn resource_list_core() -> Json<serde_json::Value> {
    Json(json!({
        "kind": "APIResourceList",
        "groupVersion": "v1",
        "resources": [
            resource_entry("pods", "Pod"),
            resource_entry("services", "Service"),
            resource_entry("nodes", "Node"),
            resource_entry("configmaps", "ConfigMap"),
            resource_entry("secrets", "Secret"),
            resource_entry("namespaces", "Namespace"),
        ],
    }))
}

async fn resource_list_apps() -> Json<serde_json::Value> {
    Json(json!({
        "kind": "APIResourceList",
        "groupVersion": "apps/v1",
        "resources": [resource_entry("deployments", "Deployment")],
    }))
}

fn status_response(status: KubernetesStatus) -> Response {
    let code = StatusCode::from_u16(status.code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (code, Json(status)).into_response()
}

fn extract_bearer(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
}

/// The kubectl pass-through contract, §4.8. Matches `ANY /api/*` and
/// `ANY /apis/*`.
async fn kubectl_passthrough<L: LedgerAdapter + 'static, S: StakeSource + 'static>(
    State(state): State<Arc<GatewayState<L, S>>>,
    method: axum::http::Method,
    uri: axum::http::Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let path = uri.path().to_string();

    let Some(raw_token) = extract_bearer(&headers) else {
        return status_response(KubernetesStatus::failure("Unauthorized", "missing bearer token", 401));
    };

    let (token, permissions) = match state.validator.validate(raw_token).await {
        Ok(pair) => pair,
        Err(e) => {
            return status_response(KubernetesStatus::failure("Unauthorized", e.to_string(), 401));
        }
    };

    let Some(http_method) = HttpMethod::from_str(method.as_str()) else {
        return status_response(KubernetesStatus::failure(
            "MethodNotAllowed",
            format!("unsupported method {method}"),
            405,
        ));
    };

    let (namespace, resource) = parse_k8s_path(&path);
    let required = build_permission(http_method, &resource);
    let (req_resource, req_verb) = required.split_once(':').unwrap_or((resource.as_str(), "read"));
    let authorized = permissions.iter().any(|p| p.grants(req_resource, req_verb));
    if !authorized {
        return status_response(KubernetesStatus::failure(
            "Forbidden",
            format!("missing permission {required}"),
            403,
        ));
    }

    let request_id = Uuid::new_v4().to_string();
    let name = path
        .rsplit('/')
        .next()
        .filter(|s| !s.is_empty() && *s != resource)
        .map(|s| s.to_string());

    let request = K8sApiRequest {
        request_id: request_id.clone(),
        method: http_method,
        resource,
        namespace,
        name,
        payload: body.to_vec(),
        seal_token: raw_token.to_string(),
        requester: token.wallet_address.clone(),
        priority: 5,
        timestamp: chrono::Utc::now(),
    };

    let handle = match state
        .correlator
        .register(
            request_id.clone(),
            PendingMeta {
                requester: token.wallet_address.clone(),
                method: method.to_string(),
                path: path.clone(),
            },
        )
        .await
    {
        Ok(handle) => handle,
        Err(e) => {
            return status_response(KubernetesStatus::failure("AlreadyExists", e.to_string(), 409));
        }
    };

    let fields = match serde_json::to_value(&request) {
        Ok(v) => v,
        Err(e) => {
            state.correlator.cancel(&request_id).await;
            return status_response(KubernetesStatus::failure("InternalError", e.to_string(), 500));
        }
    };

    if let Err(e) = state.ledger.emit_event(EventKind::K8sApiRequest, fields).await {
        state.correlator.cancel(&request_id).await;
        return status_response(KubernetesStatus::failure("ServiceUnavailable", e.to_string(), 503));
    }

    info!(request_id = %request_id, %path, "kubectl request submitted on-chain, awaiting result");

    match state.correlator.await_response(handle, state.await_timeout).await {
        AwaitOutcome::Response(result) => {
            if result.success {
                (StatusCode::OK, result.output).into_response()
            } else {
                status_response(KubernetesStatus::failure("ExecutionFailed", result.error, 502))
            }
        }
        AwaitOutcome::Timeout => {
            status_response(KubernetesStatus::failure("RequestTimeout", "timed out awaiting on-chain result", 504))
        }
        AwaitOutcome::Canceled => {
            status_response(KubernetesStatus::failure("Canceled", "request was canceled", 499))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Permission;

    #[test]
    fn permission_mapping_matches_build_permission() {
        let permissions = vec![Permission::new("pods", "read")];
        let required = build_permission(HttpMethod::Get, "pods");
        let (resource, verb) = required.split_once(':').unwrap();
        assert!(permissions.iter().any(|p| p.grants(resource, verb)));
    }

    #[test]
    fn wildcard_permission_grants_write_for_deletes() {
        let permissions = vec![Permission::wildcard()];
        let required = build_permission(HttpMethod::Delete, "secrets");
        let (resource, verb) = required.split_once(':').unwrap();
        assert!(permissions.iter().any(|p| p.grants(resource, verb)));
    }

    #[test]
    fn missing_bearer_header_is_detected() {
        let headers = HeaderMap::new();
        assert!(extract_bearer(&headers).is_none());
    }
}
