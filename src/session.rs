//! Agent conversation sessions: a [`crate::cache::Cache`] specialized to
//! store message history, free-form context, and metadata per session id.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::cache::Cache;
use crate::clock::SharedClock;
use crate::error::Result;

/// A single conversation turn, stored as opaque JSON so callers can keep
/// whatever message shape their own request/response types use.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMessage {
    pub role: String,
    pub content: String,
    #[serde(flatten)]
    pub extra: HashMap<String, Value>,
}

/// Persisted session state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    pub user_id: String,
    pub created_at: f64,
    pub updated_at: f64,
    pub messages: Vec<SessionMessage>,
    pub context: HashMap<String, Value>,
    pub metadata: HashMap<String, Value>,
}

/// Conversation-aware session store over a [`Cache`].
///
/// `get_or_create`/`update` inherit the underlying cache's non-atomic
/// read-modify-write: two concurrent calls against the same session id can
/// race and one writer's update can be lost. Serializing access per session
/// id (e.g. routing through a per-key queue upstream) is the caller's
/// responsibility if that matters for a given deployment.
pub struct SessionStore {
    cache: Cache,
    clock: SharedClock,
    max_messages: usize,
}

impl SessionStore {
    pub fn new(cache: Cache, clock: SharedClock, max_messages: usize) -> Self {
        Self { cache, clock, max_messages }
    }

    /// Derive an opaque session id from `user_id` and the current time. Not
    /// a capability token: it identifies a session, it doesn't authorize
    /// access to it.
    fn generate_session_id(&self, user_id: &str) -> String {
        let now = self.clock.now();
        let data = format!("{user_id}:{now}");
        let digest = Sha256::digest(data.as_bytes());
        format!("{digest:x}")[..24].to_string()
    }

    pub async fn create_session(
        &self,
        user_id: &str,
        metadata: Option<HashMap<String, Value>>,
    ) -> Result<String> {
        let session_id = self.generate_session_id(user_id);
        let now = self.clock.now();
        let session = Session {
            session_id: session_id.clone(),
            user_id: user_id.to_string(),
            created_at: now,
            updated_at: now,
            messages: Vec::new(),
            context: HashMap::new(),
            metadata: metadata.unwrap_or_default(),
        };
        self.cache.set(&session_id, &session, None).await?;
        Ok(session_id)
    }

    pub async fn get_session(&self, session_id: &str) -> Result<Option<Session>> {
        self.cache.get(session_id).await
    }

    pub async fn add_message(&self, session_id: &str, message: SessionMessage) -> Result<bool> {
        let now = self.clock.now();
        let max_messages = self.max_messages;
        let updated = self
            .cache
            .update::<Session, _>(
                session_id,
                move |mut session| {
                    session.messages.push(message);
                    session.updated_at = now;
                    if session.messages.len() > max_messages {
                        let overflow = session.messages.len() - max_messages;
                        session.messages.drain(0..overflow);
                    }
                    session
                },
                None,
            )
            .await?;
        Ok(updated.is_some())
    }

    pub async fn get_messages(&self, session_id: &str) -> Result<Vec<SessionMessage>> {
        Ok(self.get_session(session_id).await?.map(|s| s.messages).unwrap_or_default())
    }

    pub async fn set_context(&self, session_id: &str, key: &str, value: Value) -> Result<bool> {
        let now = self.clock.now();
        let key = key.to_string();
        let updated = self
            .cache
            .update::<Session, _>(
                session_id,
                move |mut session| {
                    session.context.insert(key, value);
                    session.updated_at = now;
                    session
                },
                None,
            )
            .await?;
        Ok(updated.is_some())
    }

    pub async fn get_context(&self, session_id: &str, key: &str) -> Result<Option<Value>> {
        Ok(self.get_session(session_id).await?.and_then(|s| s.context.get(key).cloned()))
    }

    pub async fn clear_messages(&self, session_id: &str) -> Result<bool> {
        let now = self.clock.now();
        let updated = self
            .cache
            .update::<Session, _>(
                session_id,
                move |mut session| {
                    session.messages.clear();
                    session.updated_at = now;
                    session
                },
                None,
            )
            .await?;
        Ok(updated.is_some())
    }

    /// Fetch `session_id` or create one for `user_id` under a freshly
    /// generated id, returning whichever session was in play. Note this
    /// does not reuse `session_id` as the lookup key for creation — callers
    /// that want idempotent resume-or-create by a caller-chosen id should
    /// use `get_session` + `create_session` directly instead.
    pub async fn get_or_create(&self, session_id: &str, user_id: &str) -> Result<Session> {
        if let Some(existing) = self.get_session(session_id).await? {
            return Ok(existing);
        }
        let new_id = self.create_session(user_id, None).await?;
        Ok(self.get_session(&new_id).await?.expect("just created"))
    }

    pub async fn delete_session(&self, session_id: &str) -> Result<bool> {
        self.cache.delete(session_id).await
    }
}
