//! Persisted chat messages

use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use confab_billing::{UsageMessage, UsageStore};
use confab_core::{MessagePart, Role};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A message row as persisted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredMessage {
    /// Caller-chosen, unique within its conversation
    pub message_id: String,
    pub conversation_id: String,
    pub user_id: String,
    pub role: Role,
    pub created_at: DateTime<Utc>,
    pub model: String,
    #[serde(default)]
    pub parts: Vec<MessagePart>,
    pub input_tokens: Option<u64>,
    pub output_tokens: Option<u64>,
    #[serde(default)]
    pub was_forked: bool,
    #[serde(default)]
    pub used_own_key: bool,
    pub discarded_at: Option<DateTime<Utc>>,
}

impl StoredMessage {
    /// Create a message with no parts and no token counts
    pub fn new(
        user_id: impl Into<String>,
        conversation_id: impl Into<String>,
        message_id: impl Into<String>,
        role: Role,
        model: impl Into<String>,
    ) -> Self {
        Self {
            message_id: message_id.into(),
            conversation_id: conversation_id.into(),
            user_id: user_id.into(),
            role,
            created_at: Utc::now(),
            model: model.into(),
            parts: vec![],
            input_tokens: None,
            output_tokens: None,
            was_forked: false,
            used_own_key: false,
            discarded_at: None,
        }
    }

    /// Set the parts
    pub fn with_parts(mut self, parts: Vec<MessagePart>) -> Self {
        self.parts = parts;
        self
    }

    /// Set the creation time
    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }

    /// Mark as paid with the user's own provider key
    pub fn with_own_key(mut self) -> Self {
        self.used_own_key = true;
        self
    }

    /// The billing view of this row
    pub fn to_usage(&self) -> UsageMessage {
        UsageMessage {
            message_id: self.message_id.clone(),
            conversation_id: self.conversation_id.clone(),
            user_id: self.user_id.clone(),
            role: self.role,
            created_at: self.created_at,
            model: self.model.clone(),
            input_tokens: self.input_tokens,
            output_tokens: self.output_tokens,
            was_forked: self.was_forked,
            used_own_key: self.used_own_key,
            discarded_at: self.discarded_at,
        }
    }
}

/// What `append` did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    Inserted,
    /// A row with the same `(conversation_id, message_id)` was already there
    AlreadyExists,
}

/// Persistence for chat messages.
///
/// Rows are keyed by `(conversation_id, message_id)`. Appending an existing
/// key is a no-op, so retried requests are safe. The same message id in a
/// different (forked) conversation is a separate row. Every mutation is
/// checked against the conversation's owner.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Insert a message unless its key already exists
    async fn append(&self, message: StoredMessage) -> Result<AppendOutcome>;

    /// Replace a message's parts
    async fn update_parts(
        &self,
        user_id: &str,
        conversation_id: &str,
        message_id: &str,
        parts: Vec<MessagePart>,
    ) -> Result<()>;

    /// Attach token counts
    async fn set_token_counts(
        &self,
        user_id: &str,
        conversation_id: &str,
        message_id: &str,
        input_tokens: u64,
        output_tokens: u64,
    ) -> Result<()>;

    /// Mark a message as discarded (edited away or regenerated)
    async fn discard(
        &self,
        user_id: &str,
        conversation_id: &str,
        message_id: &str,
        at: DateTime<Utc>,
    ) -> Result<()>;

    /// Fetch one message
    async fn get(&self, conversation_id: &str, message_id: &str) -> Result<Option<StoredMessage>>;

    /// All messages of a conversation in insertion order
    async fn list(&self, conversation_id: &str) -> Result<Vec<StoredMessage>>;

    /// Copy a conversation into `target`, keeping message ids and marking
    /// every copy as forked. Returns the number of rows inserted.
    async fn fork(&self, user_id: &str, source: &str, target: &str) -> Result<usize> {
        let messages = self.list(source).await?;
        if messages.iter().any(|m| m.user_id != user_id) {
            return Err(Error::forbidden(user_id, source));
        }

        let mut copied = 0;
        for message in messages {
            let copy = StoredMessage {
                conversation_id: target.to_string(),
                was_forked: true,
                ..message
            };
            if self.append(copy).await? == AppendOutcome::Inserted {
                copied += 1;
            }
        }
        Ok(copied)
    }
}

#[derive(Debug, Default)]
struct StoreState {
    owners: HashMap<String, String>,
    messages: Vec<StoredMessage>,
    index: HashMap<(String, String), usize>,
}

impl StoreState {
    fn message_mut(
        &mut self,
        user_id: &str,
        conversation_id: &str,
        message_id: &str,
    ) -> Result<&mut StoredMessage> {
        match self.owners.get(conversation_id) {
            Some(owner) if owner != user_id => {
                return Err(Error::forbidden(user_id, conversation_id));
            }
            Some(_) => {}
            None => return Err(Error::NotFound(format!("{}/{}", conversation_id, message_id))),
        }
        let key = (conversation_id.to_string(), message_id.to_string());
        let index = *self
            .index
            .get(&key)
            .ok_or_else(|| Error::NotFound(format!("{}/{}", conversation_id, message_id)))?;
        Ok(&mut self.messages[index])
    }
}

/// Messages held in memory
#[derive(Debug, Default)]
pub struct InMemoryMessageStore {
    state: RwLock<StoreState>,
}

impl InMemoryMessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of rows across all conversations
    pub fn len(&self) -> usize {
        self.state.read().messages.len()
    }

    /// Check if the store has no rows
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl MessageStore for InMemoryMessageStore {
    async fn append(&self, message: StoredMessage) -> Result<AppendOutcome> {
        let mut state = self.state.write();

        let owner = state.owners.get(&message.conversation_id).cloned();
        match owner {
            Some(owner) if owner != message.user_id => {
                return Err(Error::forbidden(&message.user_id, &message.conversation_id));
            }
            Some(_) => {}
            None => {
                state
                    .owners
                    .insert(message.conversation_id.clone(), message.user_id.clone());
            }
        }

        let key = (message.conversation_id.clone(), message.message_id.clone());
        if state.index.contains_key(&key) {
            tracing::debug!("Message {}/{} already stored", key.0, key.1);
            return Ok(AppendOutcome::AlreadyExists);
        }

        let position = state.messages.len();
        state.messages.push(message);
        state.index.insert(key, position);
        Ok(AppendOutcome::Inserted)
    }

    async fn update_parts(
        &self,
        user_id: &str,
        conversation_id: &str,
        message_id: &str,
        parts: Vec<MessagePart>,
    ) -> Result<()> {
        let mut state = self.state.write();
        state.message_mut(user_id, conversation_id, message_id)?.parts = parts;
        Ok(())
    }

    async fn set_token_counts(
        &self,
        user_id: &str,
        conversation_id: &str,
        message_id: &str,
        input_tokens: u64,
        output_tokens: u64,
    ) -> Result<()> {
        let mut state = self.state.write();
        let message = state.message_mut(user_id, conversation_id, message_id)?;
        message.input_tokens = Some(input_tokens);
        message.output_tokens = Some(output_tokens);
        Ok(())
    }

    async fn discard(
        &self,
        user_id: &str,
        conversation_id: &str,
        message_id: &str,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let mut state = self.state.write();
        let message = state.message_mut(user_id, conversation_id, message_id)?;
        message.discarded_at.get_or_insert(at);
        Ok(())
    }

    async fn get(&self, conversation_id: &str, message_id: &str) -> Result<Option<StoredMessage>> {
        let state = self.state.read();
        let key = (conversation_id.to_string(), message_id.to_string());
        Ok(state.index.get(&key).map(|&i| state.messages[i].clone()))
    }

    async fn list(&self, conversation_id: &str) -> Result<Vec<StoredMessage>> {
        Ok(self
            .state
            .read()
            .messages
            .iter()
            .filter(|m| m.conversation_id == conversation_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl UsageStore for InMemoryMessageStore {
    async fn usage_since(
        &self,
        user_id: &str,
        since: DateTime<Utc>,
    ) -> confab_billing::Result<Vec<UsageMessage>> {
        Ok(self
            .state
            .read()
            .messages
            .iter()
            .filter(|m| m.user_id == user_id && m.created_at >= since)
            .map(StoredMessage::to_usage)
            .collect())
    }
}
