//! Ordered per-conversation message sequences with optimistic placeholders.
//!
//! Insertion order is authoritative: entries are never re-sorted by
//! `created_at`, because server timestamps can tie.

use std::collections::{HashMap, HashSet};

use chrono::Utc;
use shared::{
    domain::{ConversationId, MessageId, UserId},
    protocol::{Message, MessageDraft, UploadState},
};
use tracing::debug;

#[derive(Debug, Default, Clone)]
pub struct MessageStore {
    messages: Vec<Message>,
    /// Ids confirmed while a history fetch is in flight; `None` when idle.
    live_during_refresh: Option<HashSet<MessageId>>,
}

impl MessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn get(&self, id: &MessageId) -> Option<&Message> {
        self.messages.iter().find(|message| &message.id == id)
    }

    pub fn contains(&self, id: &MessageId) -> bool {
        self.position(id).is_some()
    }

    pub fn pending_count(&self) -> usize {
        self.messages.iter().filter(|m| m.is_pending()).count()
    }

    fn position(&self, id: &MessageId) -> Option<usize> {
        self.messages.iter().position(|message| &message.id == id)
    }

    fn note_live(&mut self, id: &MessageId) {
        if let Some(live) = self.live_during_refresh.as_mut() {
            live.insert(id.clone());
        }
    }

    /// Starts remembering confirmed arrivals so the next `replace_history`
    /// keeps them even if the fetched page predates them.
    pub fn begin_refresh(&mut self) {
        self.live_during_refresh.get_or_insert_with(HashSet::new);
    }

    pub fn cancel_refresh(&mut self) {
        self.live_during_refresh = None;
    }

    /// Appends a server-confirmed message. Returns `false` when a message with
    /// the same id is already present.
    pub fn append_confirmed(&mut self, message: Message) -> bool {
        if self.contains(&message.id) {
            debug!(message_id = %message.id, "store: duplicate confirmed message ignored");
            return false;
        }
        self.note_live(&message.id);
        self.messages.push(message);
        true
    }

    pub fn append_placeholder(&mut self, local_id: MessageId, draft: MessageDraft) -> MessageId {
        if let Some(index) = self.position(&local_id) {
            self.messages.remove(index);
        }
        let placeholder = draft.into_placeholder(local_id.clone(), Utc::now());
        self.messages.push(placeholder);
        local_id
    }

    /// Swaps a placeholder for its confirmed message without moving it.
    /// Returns `false` when the placeholder is gone (already resolved or dropped).
    pub fn resolve_placeholder(&mut self, local_id: &MessageId, mut confirmed: Message) -> bool {
        let Some(index) = self.position(local_id) else {
            return false;
        };

        confirmed.upload_state = UploadState::None;
        let confirmed_id = confirmed.id.clone();
        self.note_live(&confirmed_id);
        self.messages[index] = confirmed;

        // An echo of the confirmed message may have been appended while the
        // upload was in flight; the placeholder slot wins.
        let mut current = 0;
        self.messages.retain(|message| {
            let keep = current == index || message.id != confirmed_id;
            current += 1;
            keep
        });
        true
    }

    pub fn drop_placeholder(&mut self, local_id: &MessageId) -> bool {
        match self.position(local_id) {
            Some(index) => {
                self.messages.remove(index);
                true
            }
            None => false,
        }
    }

    /// Removes one entry, confirmed or pending.
    pub fn remove(&mut self, id: &MessageId) -> Option<Message> {
        let index = self.position(id)?;
        if let Some(live) = self.live_during_refresh.as_mut() {
            live.remove(id);
        }
        Some(self.messages.remove(index))
    }

    /// Replaces the sequence with fetched history. Messages confirmed since
    /// `begin_refresh` that the page does not contain follow the history,
    /// and in-flight placeholders stay at the tail.
    pub fn replace_history(&mut self, history: Vec<Message>) {
        let live = self.live_during_refresh.take().unwrap_or_default();
        let mut pending = Vec::new();
        let mut arrived = Vec::new();
        for message in self.messages.drain(..) {
            if message.is_pending() {
                pending.push(message);
            } else if live.contains(&message.id) {
                arrived.push(message);
            }
        }

        for message in history {
            if !self.contains(&message.id) {
                self.messages.push(message);
            }
        }
        for message in arrived {
            if !self.contains(&message.id) {
                debug!(message_id = %message.id, "store: kept message newer than fetched history");
                self.messages.push(message);
            }
        }
        self.messages.extend(pending);
    }

    /// Whether the message at `index` has the same sender as the one before it.
    pub fn is_same_user_as_previous(&self, index: usize) -> bool {
        if index == 0 || index >= self.messages.len() {
            return false;
        }
        self.messages[index - 1].sender.id == self.messages[index].sender.id
    }

    /// Whether `index` is the last message and was written by someone other than `me`.
    pub fn is_last_from_other(&self, index: usize, me: &UserId) -> bool {
        index + 1 == self.messages.len() && &self.messages[index].sender.id != me
    }
}

/// Attaches a reply target to a draft. The target is not checked against any store.
pub fn apply_reply(mut draft: MessageDraft, reply_to_id: Option<MessageId>) -> MessageDraft {
    draft.reply_to_id = reply_to_id;
    draft
}

#[derive(Debug, Default)]
pub struct ConversationStores {
    stores: HashMap<ConversationId, MessageStore>,
}

impl ConversationStores {
    pub fn get(&self, conversation_id: &ConversationId) -> Option<&MessageStore> {
        self.stores.get(conversation_id)
    }

    pub fn entry(&mut self, conversation_id: &ConversationId) -> &mut MessageStore {
        self.stores.entry(conversation_id.clone()).or_default()
    }

    pub fn snapshot(&self, conversation_id: &ConversationId) -> Vec<Message> {
        self.stores
            .get(conversation_id)
            .map(|store| store.messages().to_vec())
            .unwrap_or_default()
    }

    pub fn clear(&mut self) {
        self.stores.clear();
    }
}

#[cfg(test)]
#[path = "tests/store_tests.rs"]
mod tests;
