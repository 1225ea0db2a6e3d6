//! Thin store-backed accessor for [`Session`] records at `agent:session:<sid>`
//! (spec §6). Shared by the worker-side orchestrator (writes progress) and
//! the daemon-side cleanup sweep (reads/requeues orphans), so it lives here
//! rather than duplicated in both crates.

use std::sync::Arc;
use std::time::Duration;

use crate::store::{Store, StoreError};
use crate::types::Session;

fn session_key(session_id: &str) -> String {
    format!("agent:session:{session_id}")
}

const SESSION_TTL: Duration = Duration::from_secs(86_400);

#[derive(Clone)]
pub struct SessionStore {
    store: Arc<dyn Store>,
}

impl SessionStore {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub async fn save(&self, session: &Session) -> Result<(), StoreError> {
        let payload = serde_json::to_string(session).expect("Session serializes");
        self.store.set(&session_key(&session.id), &payload, Some(SESSION_TTL)).await
    }

    pub async fn load(&self, session_id: &str) -> Result<Option<Session>, StoreError> {
        match self.store.get(&session_key(session_id)).await? {
            Some(raw) => Ok(serde_json::from_str(&raw).ok()),
            None => Ok(None),
        }
    }

    pub async fn delete(&self, session_id: &str) -> Result<bool, StoreError> {
        self.store.delete(&session_key(session_id)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::types::{SessionStatus, WorkType};

    #[tokio::test]
    async fn save_then_load_round_trips() {
        let s = SessionStore::new(Arc::new(MemoryStore::default()));
        let session = Session::new("s1", "t1", "T-1", WorkType::Development, "org1", 3);
        s.save(&session).await.unwrap();
        let loaded = s.load("s1").await.unwrap().unwrap();
        assert_eq!(loaded.status, SessionStatus::Pending);
        assert_eq!(loaded.ticket_identifier, "T-1");
    }

    #[tokio::test]
    async fn load_missing_returns_none() {
        let s = SessionStore::new(Arc::new(MemoryStore::default()));
        assert!(s.load("nope").await.unwrap().is_none());
    }
}
