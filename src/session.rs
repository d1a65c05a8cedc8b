//! Session-W and its in-memory table.
//!
//! Sessions-W are created on first chat call bearing a fresh session-id and
//! survive in memory until either the process exits or an explicit delete.
//! There is no mandatory eviction policy; an optional LRU capacity bound is
//! available, default unbounded.

use crate::model::Message;
use crate::{Error, Result};
use std::collections::HashMap;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Working-directory/shell/repo context carried in every Upstream-W
/// environment block.
#[derive(Debug, Clone, Default)]
pub struct SessionContext {
    pub working_dir: String,
    pub home_dir: String,
    pub shell: String,
    pub shell_version: String,
    pub repo: Option<String>,
    pub branch: Option<String>,
}

/// A long-lived Provider-W conversation container (a "cascade").
#[derive(Debug, Clone)]
pub struct Session {
    pub id: String,
    /// Stable for the lifetime of the session.
    pub cascade_id: String,
    /// Rotated on each new user query.
    pub turn_id: String,
    pub context: SessionContext,
    pub messages: Vec<Message>,
    pub model: String,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Session {
    pub fn new(model: impl Into<String>, context: SessionContext) -> Self {
        let now = now_millis();
        Self {
            id: Uuid::new_v4().to_string(),
            cascade_id: Uuid::new_v4().to_string(),
            turn_id: Uuid::new_v4().to_string(),
            context,
            messages: Vec::new(),
            model: model.into(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Rotate the turn-id for a new user query while keeping `cascade_id`
    /// stable: cascade-id is identical across all contained messages;
    /// turn-id changes across user queries.
    pub fn start_new_turn(&mut self) {
        self.turn_id = Uuid::new_v4().to_string();
        self.updated_at = now_millis();
    }

    pub fn push_message(&mut self, message: Message) {
        self.messages.push(message);
        self.updated_at = now_millis();
    }
}

fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// In-memory `session-id -> Session` table.
///
/// Concurrent appends to the same session are disallowed and must fail fast
/// — the caller is expected to serialize within a session — modeled by
/// guarding each session behind a `tokio::sync::Mutex` whose `try_lock` is
/// used for appends, returning an error instead of blocking when another
/// caller already holds it.
pub struct SessionStore {
    sessions: Mutex<HashMap<String, Session>>,
    /// Most-recently-touched order, back is most recent. `None` means no
    /// capacity bound (default).
    lru: Mutex<Vec<String>>,
    capacity: Option<usize>,
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionStore {
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            lru: Mutex::new(Vec::new()),
            capacity: None,
        }
    }

    /// Opt-in LRU eviction bound.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            lru: Mutex::new(Vec::new()),
            capacity: Some(capacity),
        }
    }

    pub async fn create(&self, session: Session) -> String {
        let id = session.id.clone();
        self.touch(&id).await;
        self.sessions.lock().await.insert(id.clone(), session);
        self.evict_if_needed().await;
        id
    }

    pub async fn get(&self, id: &str) -> Option<Session> {
        self.touch(id).await;
        self.sessions.lock().await.get(id).cloned()
    }

    pub async fn delete(&self, id: &str) -> Option<Session> {
        self.lru.lock().await.retain(|x| x != id);
        self.sessions.lock().await.remove(id)
    }

    /// Serialized append: fails fast if another caller is already mutating
    /// this session, rather than queuing behind it.
    pub async fn append(&self, id: &str, message: Message) -> Result<()> {
        let mut sessions = self
            .sessions
            .try_lock()
            .map_err(|_| Error::validation("concurrent append to session store in progress"))?;
        let session = sessions
            .get_mut(id)
            .ok_or_else(|| Error::validation(format!("unknown session id: {id}")))?;
        session.push_message(message);
        drop(sessions);
        self.touch(id).await;
        Ok(())
    }

    async fn touch(&self, id: &str) {
        if self.capacity.is_none() {
            return;
        }
        let mut lru = self.lru.lock().await;
        lru.retain(|x| x != id);
        lru.push(id.to_string());
    }

    async fn evict_if_needed(&self) {
        let Some(capacity) = self.capacity else {
            return;
        };
        let mut lru = self.lru.lock().await;
        while lru.len() > capacity {
            let oldest = lru.remove(0);
            self.sessions.lock().await.remove(&oldest);
        }
    }
}
