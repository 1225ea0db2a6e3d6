//! Pending-prompts inbox (spec §4.10): per-session FIFO queue workers poll
//! between agent turns to forward user follow-ups into a running session.

use std::sync::Arc;

use crate::store::Store;
use crate::types::PendingPrompt;

fn prompts_key(session_id: &str) -> String {
    format!("session:prompts:{session_id}")
}

#[derive(Debug, thiserror::Error)]
pub enum PendingPromptsError {
    #[error("store error: {0}")]
    Store(#[from] crate::store::StoreError),
}

pub type Result<T> = std::result::Result<T, PendingPromptsError>;

pub struct PendingPromptsInbox {
    store: Arc<dyn Store>,
}

impl PendingPromptsInbox {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub async fn push(&self, session_id: &str, prompt: &str) -> Result<PendingPrompt> {
        let entry = PendingPrompt::new(session_id, prompt);
        let payload = serde_json::to_string(&entry).expect("PendingPrompt serializes");
        self.store.rpush(&prompts_key(session_id), &payload).await?;
        Ok(entry)
    }

    pub async fn list(&self, session_id: &str) -> Result<Vec<PendingPrompt>> {
        let raw = self.store.lrange(&prompts_key(session_id), 0, -1).await?;
        Ok(raw.into_iter().filter_map(|r| serde_json::from_str(&r).ok()).collect())
    }

    pub async fn len(&self, session_id: &str) -> Result<i64> {
        Ok(self.store.llen(&prompts_key(session_id)).await?)
    }

    /// Claim and remove a specific prompt by id (scan-then-`lrem`).
    pub async fn claim(&self, session_id: &str, prompt_id: &str) -> Result<Option<PendingPrompt>> {
        let all = self.list(session_id).await?;
        let Some(found) = all.into_iter().find(|p| p.id == prompt_id) else {
            return Ok(None);
        };
        let payload = serde_json::to_string(&found).expect("PendingPrompt serializes");
        self.store.lrem(&prompts_key(session_id), &payload).await?;
        Ok(Some(found))
    }

    /// FIFO pop of the oldest pending prompt.
    pub async fn pop(&self, session_id: &str) -> Result<Option<PendingPrompt>> {
        let all = self.list(session_id).await?;
        let Some(first) = all.into_iter().next() else {
            return Ok(None);
        };
        self.claim(session_id, &first.id).await
    }
}
