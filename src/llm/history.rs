//! In-memory conversation history.
//!
//! Keyed by `(user, conversation?)`, falling back to the user alone.
//! `entry` hands back the per-key mutex so one generation call can hold
//! it from history read to append; other keys stay unblocked.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};

use super::types::ChatMessage;

type Key = (String, Option<String>);

/// Per-conversation message log with FIFO truncation.
#[derive(Default)]
pub struct Conversation {
    messages: Vec<ChatMessage>,
}

impl Conversation {
    /// Append one message, dropping the oldest entries past `limit`.
    pub fn push(&mut self, message: ChatMessage, limit: usize) {
        self.messages.push(message);
        if self.messages.len() > limit {
            let excess = self.messages.len() - limit;
            self.messages.drain(..excess);
        }
    }

    /// The most recent `n` messages in chronological order.
    pub fn recent(&self, n: usize) -> &[ChatMessage] {
        let start = self.messages.len().saturating_sub(n);
        &self.messages[start..]
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

/// Injectable keyed store of conversations.
#[derive(Default)]
pub struct ConversationStore {
    conversations: RwLock<HashMap<Key, Arc<Mutex<Conversation>>>>,
}

impl ConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// The shared handle for one conversation key, created on first
    /// use.
    pub async fn entry(
        &self,
        user_id: &str,
        conversation_id: Option<&str>,
    ) -> Arc<Mutex<Conversation>> {
        let key = (user_id.to_string(), conversation_id.map(str::to_string));

        if let Some(existing) = self.conversations.read().await.get(&key) {
            return existing.clone();
        }

        let mut map = self.conversations.write().await;
        map.entry(key)
            .or_insert_with(|| Arc::new(Mutex::new(Conversation::default())))
            .clone()
    }

    /// Snapshot of a conversation's messages; empty when the key has
    /// never been used.
    pub async fn history(
        &self,
        user_id: &str,
        conversation_id: Option<&str>,
    ) -> Vec<ChatMessage> {
        let key = (user_id.to_string(), conversation_id.map(str::to_string));
        let Some(entry) = self.conversations.read().await.get(&key).cloned() else {
            return Vec::new();
        };

        let conversation = entry.lock().await;
        conversation.messages().to_vec()
    }

    /// Drop a conversation entirely. Returns whether one existed.
    pub async fn clear(&self, user_id: &str, conversation_id: Option<&str>) -> bool {
        let key = (user_id.to_string(), conversation_id.map(str::to_string));
        self.conversations.write().await.remove(&key).is_some()
    }
}
