use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::Mutex;

use crate::error::{Error, Result};
use crate::models::{QaExchange, SessionContext};

/// Keyed storage for prescription conversations.
///
/// Keys are opaque session identifiers. Concurrent reads of one session are
/// safe; writes to one session are serialized so the accumulated Q&A history
/// stays consistent. Retention policy belongs to the implementation.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn put(&self, session_id: String, context: SessionContext) -> Result<()>;
    async fn get(&self, session_id: &str) -> Result<Option<SessionContext>>;
    async fn append_exchange(&self, session_id: &str, exchange: QaExchange) -> Result<()>;
    async fn delete(&self, session_id: &str) -> Result<()>;
}

/// Process-lifetime in-memory store. Each session carries its own mutex so
/// appends to one session serialize without coordinating across sessions.
pub struct InMemorySessionStore {
    sessions: DashMap<String, Arc<Mutex<SessionContext>>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
        }
    }
}

impl Default for InMemorySessionStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn put(&self, session_id: String, context: SessionContext) -> Result<()> {
        self.sessions
            .insert(session_id, Arc::new(Mutex::new(context)));
        Ok(())
    }

    async fn get(&self, session_id: &str) -> Result<Option<SessionContext>> {
        // Clone the Arc out of the map entry before awaiting the lock so no
        // map shard guard is held across an await point.
        let entry = self.sessions.get(session_id).map(|e| e.value().clone());
        match entry {
            Some(slot) => Ok(Some(slot.lock().await.clone())),
            None => Ok(None),
        }
    }

    async fn append_exchange(&self, session_id: &str, exchange: QaExchange) -> Result<()> {
        let entry = self.sessions.get(session_id).map(|e| e.value().clone());
        let slot = entry.ok_or_else(|| Error::UnknownSession(session_id.to_string()))?;
        slot.lock().await.exchanges.push(exchange);
        Ok(())
    }

    async fn delete(&self, session_id: &str) -> Result<()> {
        self.sessions.remove(session_id);
        Ok(())
    }
}
