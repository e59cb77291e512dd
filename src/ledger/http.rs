use super::{Backoff, EventFilter, EventKind, EventCursor, LedgerAdapter, LedgerEvent, ObjectState, Order};
use crate::error::BridgeError;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, warn};

const MAX_EMIT_ATTEMPTS: u32 = 5;
const QUERY_TIMEOUT: Duration = Duration::from_secs(10);
const OBJECT_QUERY_TIMEOUT: Duration = Duration::from_secs(5);

/// Speaks to the ledger's JSON-RPC surface over `reqwest`. This is the
/// adapter wired up in production; tests and `tee_mode = simulation` runs
/// use [`super::MockLedgerAdapter`] instead.
pub struct HttpLedgerAdapter {
    client: reqwest::Client,
    rpc_url: String,
    package_id: String,
    signer_handle: Option<String>,
    backoff: Backoff,
}

impl HttpLedgerAdapter {
    pub fn new(rpc_url: String, package_id: String, signer_handle: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            rpc_url,
            package_id,
            signer_handle,
            backoff: Backoff::default(),
        }
    }

    async fn call_rpc(&self, method: &str, params: Value) -> Result<Value, BridgeError> {
        let body = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params,
        });

        let resp = self
            .client
            .post(&self.rpc_url)
            .json(&body)
            .send()
            .await
            .map_err(|e| BridgeError::Transient(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(BridgeError::Transient(format!(
                "ledger rpc returned status {}",
                resp.status()
            )));
        }

        let envelope: Value = resp
            .json()
            .await
            .map_err(|e| BridgeError::Transient(e.to_string()))?;

        if let Some(err) = envelope.get("error") {
            return Err(BridgeError::Rejected(err.to_string()));
        }

        Ok(envelope.get("result").cloned().unwrap_or(Value::Null))
    }
}

#[async_trait]
impl LedgerAdapter for HttpLedgerAdapter {
    async fn emit_event(&self, kind: EventKind, fields: Value) -> Result<String, BridgeError> {
        let signer = self
            .signer_handle
            .as_ref()
            .ok_or_else(|| BridgeError::Fatal("no signer handle configured".to_string()))?;

        let idempotency_key = crate::util::deterministic_hash(&fields);

        let params = json!({
            "package": self.package_id,
            "function": kind.entry_function(),
            "signer": signer,
            "arguments": fields,
            "idempotency_key": idempotency_key,
        });

        let mut attempt = 0;
        loop {
            match self.call_rpc("emit_transaction", params.clone()).await {
                Ok(result) => {
                    let digest = result
                        .get("digest")
                        .and_then(|v| v.as_str())
                        .unwrap_or(&idempotency_key)
                        .to_string();
                    return Ok(digest);
                }
                Err(BridgeError::Transient(msg)) => {
                    attempt += 1;
                    if attempt >= MAX_EMIT_ATTEMPTS {
                        return Err(BridgeError::LedgerUnavailable(msg));
                    }
                    let delay = self.backoff.delay(attempt);
                    warn!(attempt, ?delay, "transient ledger failure, retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(other) => return Err(other),
            }
        }
    }

    async fn query_events(
        &self,
        filter: &EventFilter,
        cursor: EventCursor,
        limit: u32,
        order: Order,
    ) -> Result<(Vec<LedgerEvent>, EventCursor), BridgeError> {
        let params = json!({
            "package": filter.package,
            "module": filter.module,
            "event_type": filter.event_type,
            "cursor": cursor,
            "limit": limit,
            "descending": matches!(order, Order::Descending),
        });

        let result = tokio::time::timeout(QUERY_TIMEOUT, self.call_rpc("query_events", params))
            .await
            .map_err(|_| BridgeError::Transient("query_events timed out".to_string()))??;

        let raw_events = result
            .get("data")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();

        let mut events = Vec::with_capacity(raw_events.len());
        let mut next_cursor = cursor;

        for raw in raw_events {
            let Some(event_cursor) = raw.get("cursor").and_then(|v| v.as_u64()) else {
                debug!("skipping malformed event: missing cursor");
                continue;
            };
            let Some(parsed_json) = raw.get("parsedJson").cloned() else {
                debug!(cursor = event_cursor, "skipping malformed event: missing parsedJson");
                continue;
            };

            next_cursor = next_cursor.max(event_cursor);
            events.push(LedgerEvent {
                cursor: event_cursor,
                kind: kind_from_event_type(&filter.event_type),
                parsed_json,
            });
        }

        Ok((events, next_cursor))
    }

    async fn query_object(&self, id: &str) -> Result<ObjectState, BridgeError> {
        let params = json!({ "object_id": id });

        let result = tokio::time::timeout(
            OBJECT_QUERY_TIMEOUT,
            self.call_rpc("query_object", params),
        )
        .await
        .map_err(|_| BridgeError::Transient("query_object timed out".to_string()))??;

        if result.is_null() {
            Ok(ObjectState::NotFound)
        } else {
            Ok(ObjectState::Found(result))
        }
    }
}

fn kind_from_event_type(event_type: &str) -> EventKind {
    match event_type {
        "K8sAPIRequestEvent" => EventKind::K8sApiRequest,
        "K8sAPIResultEvent" => EventKind::K8sApiResult,
        "WorkerNodeEvent" => EventKind::WorkerNode,
        "JoinTokenSetEvent" => EventKind::SetJoinToken,
        _ => EventKind::ClusterState,
    }
}
