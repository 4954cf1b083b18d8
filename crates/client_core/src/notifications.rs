use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use shared::{
    domain::{ConversationId, MessageId},
    protocol::Message,
};

const BADGE_CAP: usize = 99;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationEntry {
    pub message: Message,
    pub text: String,
    pub received_at: DateTime<Utc>,
    pub is_read: bool,
}

impl NotificationEntry {
    pub fn new(message: Message, received_at: DateTime<Utc>) -> Self {
        let text = notification_text(&message);
        Self {
            message,
            text,
            received_at,
            is_read: false,
        }
    }

    pub fn id(&self) -> &MessageId {
        &self.message.id
    }

    pub fn conversation_id(&self) -> &ConversationId {
        &self.message.conversation_id
    }
}

pub fn notification_text(message: &Message) -> String {
    let sender = &message.sender.display_name;
    match &message.attachment {
        Some(attachment) => {
            let name = if attachment.name.is_empty() {
                &message.body
            } else {
                &attachment.name
            };
            format!("{sender} has sent you a file: \"{name}\"")
        }
        None => format!("{sender} has sent you a message: \"{}\"", message.body),
    }
}

/// Label for an unread badge; `None` hides the badge.
pub fn badge_label(count: usize) -> Option<String> {
    match count {
        0 => None,
        n if n > BADGE_CAP => Some(format!("{BADGE_CAP}+")),
        n => Some(n.to_string()),
    }
}

/// Most-recent-first backlog of messages for conversations that are not open.
#[derive(Debug, Default)]
pub struct NotificationBacklog {
    entries: VecDeque<NotificationEntry>,
}

impl NotificationBacklog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `false` if the message is already in the backlog.
    pub fn add(&mut self, message: Message) -> bool {
        self.add_at(message, Utc::now())
    }

    pub fn add_at(&mut self, message: Message, received_at: DateTime<Utc>) -> bool {
        if self.contains(&message.id) {
            return false;
        }
        self.entries
            .push_front(NotificationEntry::new(message, received_at));
        true
    }

    pub fn contains(&self, message_id: &MessageId) -> bool {
        self.entries.iter().any(|entry| entry.id() == message_id)
    }

    pub fn get(&self, message_id: &MessageId) -> Option<&NotificationEntry> {
        self.entries.iter().find(|entry| entry.id() == message_id)
    }

    pub fn mark_read(&mut self, message_id: &MessageId) -> bool {
        match self.entries.iter_mut().find(|entry| entry.id() == message_id) {
            Some(entry) => {
                entry.is_read = true;
                true
            }
            None => false,
        }
    }

    /// Marks the entry read and returns the conversation to switch to.
    pub fn select(&mut self, message_id: &MessageId) -> Option<ConversationId> {
        let entry = self
            .entries
            .iter_mut()
            .find(|entry| entry.id() == message_id)?;
        entry.is_read = true;
        Some(entry.conversation_id().clone())
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn entries(&self) -> impl Iterator<Item = &NotificationEntry> {
        self.entries.iter()
    }

    pub fn snapshot(&self) -> Vec<NotificationEntry> {
        self.entries.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn unread_count(&self) -> usize {
        self.entries.iter().filter(|entry| !entry.is_read).count()
    }

    pub fn unread_count_for(&self, conversation_id: &ConversationId) -> usize {
        self.entries
            .iter()
            .filter(|entry| !entry.is_read && entry.conversation_id() == conversation_id)
            .count()
    }
}

#[cfg(test)]
#[path = "tests/notifications_tests.rs"]
mod tests;
