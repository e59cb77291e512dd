//! Persisted state, §6: `cursor.state` and `workers.state`, two small JSON
//! files restored on startup and reconciled with the ledger within the
//! first poll cycle (§4.9).

use std::collections::HashMap;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::ledger::EventCursor;
use crate::model::WorkerNode;

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct CursorSnapshot {
    pub cursors: HashMap<String, EventCursor>,
}

pub fn load_cursors(path: &str) -> Result<CursorSnapshot> {
    match std::fs::read_to_string(path) {
        Ok(content) => Ok(serde_json::from_str(&content)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(CursorSnapshot::default()),
        Err(e) => Err(e.into()),
    }
}

pub fn save_cursors(path: &str, cursors: &HashMap<String, EventCursor>) -> Result<()> {
    let snapshot = CursorSnapshot {
        cursors: cursors.clone(),
    };
    let content = serde_json::to_string_pretty(&snapshot)?;
    std::fs::write(path, content)?;
    Ok(())
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct WorkersSnapshot {
    pub workers: Vec<WorkerNode>,
}

pub fn load_workers(path: &str) -> Result<WorkersSnapshot> {
    match std::fs::read_to_string(path) {
        Ok(content) => Ok(serde_json::from_str(&content)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(WorkersSnapshot::default()),
        Err(e) => Err(e.into()),
    }
}

pub fn save_workers(path: &str, workers: &[WorkerNode]) -> Result<()> {
    let snapshot = WorkersSnapshot {
        workers: workers.to_vec(),
    };
    let content = serde_json::to_string_pretty(&snapshot)?;
    std::fs::write(path, content)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_cursor_file_yields_empty_snapshot() {
        let snapshot = load_cursors("/tmp/seal-control-nonexistent-cursor.state").unwrap();
        assert!(snapshot.cursors.is_empty());
    }

    #[test]
    fn cursor_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cursor.state");
        let path = path.to_str().unwrap();

        let mut cursors = HashMap::new();
        cursors.insert("K8sAPIRequestEvent".to_string(), 42u64);
        save_cursors(path, &cursors).unwrap();

        let loaded = load_cursors(path).unwrap();
        assert_eq!(loaded.cursors.get("K8sAPIRequestEvent"), Some(&42));
    }

    #[test]
    fn workers_round_trip_through_disk() {
        use crate::model::{WorkerNode, WorkerStatus};

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("workers.state");
        let path = path.to_str().unwrap();

        let worker = WorkerNode {
            node_id: "w1".to_string(),
            owner_wallet: "0xabc".to_string(),
            stake_amount: 1_000_000_000,
            status: WorkerStatus::Active,
            seal_token: "seal_x".to_string(),
            join_token: Some("join_x".to_string()),
            registered_at: chrono::Utc::now(),
            last_heartbeat: chrono::Utc::now(),
            total_pods_served: 3,
            reputation_score: 100,
        };
        save_workers(path, &[worker]).unwrap();

        let loaded = load_workers(path).unwrap();
        assert_eq!(loaded.workers.len(), 1);
        assert_eq!(loaded.workers[0].node_id, "w1");
    }
}
