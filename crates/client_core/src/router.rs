use std::{collections::HashMap, sync::Arc};

use shared::{
    domain::{Conversation, ConversationId, UserId},
    protocol::Message,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteDecision {
    Append,
    Notify,
}

/// Decides whether the signed-in user may post into a conversation.
pub trait SendPolicy: Send + Sync {
    fn can_send(&self, conversation: &Conversation, user_id: &UserId) -> bool;
}

/// Regular member view: sending is always allowed.
pub struct MemberPolicy;

impl SendPolicy for MemberPolicy {
    fn can_send(&self, _conversation: &Conversation, _user_id: &UserId) -> bool {
        true
    }
}

/// Admin view: only group conversations administered by the user.
pub struct GroupAdminPolicy;

impl SendPolicy for GroupAdminPolicy {
    fn can_send(&self, conversation: &Conversation, user_id: &UserId) -> bool {
        conversation.is_group && conversation.is_admin(user_id)
    }
}

/// Monitoring view: never sends.
pub struct ReadOnlyPolicy;

impl SendPolicy for ReadOnlyPolicy {
    fn can_send(&self, _conversation: &Conversation, _user_id: &UserId) -> bool {
        false
    }
}

/// Tracks the conversation currently on screen.
///
/// Inbound handlers must call [`ConversationRouter::route`] at dispatch time;
/// the current value is never captured when a handler is registered.
pub struct ConversationRouter {
    current: Option<ConversationId>,
    directory: HashMap<ConversationId, Conversation>,
    policy: Arc<dyn SendPolicy>,
}

impl Default for ConversationRouter {
    fn default() -> Self {
        Self::new(Arc::new(MemberPolicy))
    }
}

impl ConversationRouter {
    pub fn new(policy: Arc<dyn SendPolicy>) -> Self {
        Self {
            current: None,
            directory: HashMap::new(),
            policy,
        }
    }

    /// Records conversation metadata used for titles and send policy checks.
    pub fn register(&mut self, conversation: Conversation) {
        self.directory.insert(conversation.id.clone(), conversation);
    }

    /// Returns the previously current conversation id, if it changed.
    pub fn set_current(&mut self, conversation_id: Option<ConversationId>) -> Option<ConversationId> {
        let previous = std::mem::replace(&mut self.current, conversation_id);
        match (&previous, &self.current) {
            (Some(prev), Some(next)) if prev == next => None,
            _ => previous,
        }
    }

    pub fn current_id(&self) -> Option<&ConversationId> {
        self.current.as_ref()
    }

    pub fn current(&self) -> Option<&Conversation> {
        self.current.as_ref().and_then(|id| self.directory.get(id))
    }

    pub fn conversation(&self, conversation_id: &ConversationId) -> Option<&Conversation> {
        self.directory.get(conversation_id)
    }

    pub fn is_current(&self, conversation_id: &ConversationId) -> bool {
        self.current.as_ref() == Some(conversation_id)
    }

    pub fn route(&self, message: &Message) -> RouteDecision {
        if self.is_current(&message.conversation_id) {
            RouteDecision::Append
        } else {
            RouteDecision::Notify
        }
    }

    /// Unregistered conversations are checked as an unnamed 1:1 conversation.
    pub fn can_send(&self, conversation_id: &ConversationId, user_id: &UserId) -> bool {
        match self.directory.get(conversation_id) {
            Some(conversation) => self.policy.can_send(conversation, user_id),
            None => {
                let unknown = Conversation {
                    id: conversation_id.clone(),
                    is_group: false,
                    display_name: String::new(),
                    members: Vec::new(),
                    group_admin: None,
                };
                self.policy.can_send(&unknown, user_id)
            }
        }
    }
}

#[cfg(test)]
#[path = "tests/router_tests.rs"]
mod tests;
