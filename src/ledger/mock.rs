use super::{EventFilter, EventKind, EventCursor, LedgerAdapter, LedgerEvent, ObjectState, Order};
use crate::error::BridgeError;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;

/// In-memory ledger used by `tee_mode = simulation` and by the test suite.
/// Events are appended with a monotonically increasing cursor and can be
/// queried back exactly like the real adapter.
#[derive(Default)]
pub struct MockLedgerAdapter {
    events: RwLock<Vec<LedgerEvent>>,
    objects: RwLock<HashMap<String, Value>>,
    next_cursor: AtomicU64,
}

impl MockLedgerAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Test/simulation hook: seed an object so `query_object` can resolve it.
    pub async fn put_object(&self, id: impl Into<String>, state: Value) {
        self.objects.write().await.insert(id.into(), state);
    }

    /// Test hook: append an event directly, bypassing `emit_event`'s
    /// idempotency bookkeeping, to simulate ledger-originated events.
    pub async fn push_event(&self, kind: EventKind, parsed_json: Value) -> EventCursor {
        let cursor = self.next_cursor.fetch_add(1, Ordering::SeqCst) + 1;
        self.events.write().await.push(LedgerEvent {
            cursor,
            kind,
            parsed_json,
        });
        cursor
    }
}

#[async_trait]
impl LedgerAdapter for MockLedgerAdapter {
    async fn emit_event(&self, kind: EventKind, fields: Value) -> Result<String, BridgeError> {
        let digest = crate::util::deterministic_hash(&fields);
        let cursor = self.push_event(kind, fields).await;
        Ok(format!("{digest}#{cursor}"))
    }

    async fn query_events(
        &self,
        filter: &EventFilter,
        cursor: EventCursor,
        limit: u32,
        order: Order,
    ) -> Result<(Vec<LedgerEvent>, EventCursor), BridgeError> {
        let events = self.events.read().await;
        let mut matching: Vec<LedgerEvent> = events
            .iter()
            .filter(|e| e.cursor > cursor && e.kind.event_type() == filter.event_type)
            .cloned()
            .collect();

        matching.sort_by_key(|e| e.cursor);
        if order == Order::Descending {
            matching.reverse();
        }
        matching.truncate(limit as usize);

        let next_cursor = matching
            .iter()
            .map(|e| e.cursor)
            .max()
            .unwrap_or(cursor);

        Ok((matching, next_cursor))
    }

    async fn query_object(&self, id: &str) -> Result<ObjectState, BridgeError> {
        match self.objects.read().await.get(id) {
            Some(v) => Ok(ObjectState::Found(v.clone())),
            None => Ok(ObjectState::NotFound),
        }
    }
}
