//! Local composing state machine and remote typing indicator.
//!
//! Both halves are plain values driven by explicit instants; the client owns
//! the single timer that calls [`TypingController::expire`].

use std::time::Duration;

use shared::{
    domain::{ConversationId, UserId},
    protocol::{ClientRequest, TypingPayload},
};
use tokio::time::Instant;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypingEmit {
    Typing(ConversationId),
    StopTyping(ConversationId),
}

impl From<TypingEmit> for ClientRequest {
    fn from(value: TypingEmit) -> Self {
        match value {
            TypingEmit::Typing(conversation_id) => ClientRequest::Typing(conversation_id),
            TypingEmit::StopTyping(conversation_id) => ClientRequest::StopTyping(conversation_id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum LocalState {
    Idle,
    Composing {
        conversation_id: ConversationId,
        deadline: Instant,
    },
}

#[derive(Debug)]
pub struct TypingController {
    timeout: Duration,
    state: LocalState,
}

impl TypingController {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            state: LocalState::Idle,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn is_composing(&self) -> bool {
        matches!(self.state, LocalState::Composing { .. })
    }

    pub fn deadline(&self) -> Option<Instant> {
        match &self.state {
            LocalState::Composing { deadline, .. } => Some(*deadline),
            LocalState::Idle => None,
        }
    }

    /// Only the first keystroke after idle emits; later ones push the deadline.
    pub fn keystroke(&mut self, conversation_id: &ConversationId, now: Instant) -> Vec<TypingEmit> {
        let previous = std::mem::replace(
            &mut self.state,
            LocalState::Composing {
                conversation_id: conversation_id.clone(),
                deadline: now + self.timeout,
            },
        );
        match previous {
            LocalState::Composing {
                conversation_id: active,
                ..
            } if &active == conversation_id => Vec::new(),
            LocalState::Composing {
                conversation_id: active,
                ..
            } => vec![
                TypingEmit::StopTyping(active),
                TypingEmit::Typing(conversation_id.clone()),
            ],
            LocalState::Idle => vec![TypingEmit::Typing(conversation_id.clone())],
        }
    }

    /// Called by the timer. Emits only if the deadline really passed.
    pub fn expire(&mut self, now: Instant) -> Option<TypingEmit> {
        if self.deadline().is_some_and(|deadline| deadline <= now) {
            self.force_idle()
        } else {
            None
        }
    }

    /// Message sent or conversation left: back to idle right away.
    pub fn force_idle(&mut self) -> Option<TypingEmit> {
        match std::mem::replace(&mut self.state, LocalState::Idle) {
            LocalState::Composing {
                conversation_id, ..
            } => Some(TypingEmit::StopTyping(conversation_id)),
            LocalState::Idle => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypingSignal {
    pub conversation_id: ConversationId,
    pub user_id: Option<UserId>,
    pub active: bool,
    pub last_seen_at: Instant,
}

/// Remote composing indicator for the open conversation. Last writer wins.
#[derive(Debug)]
pub struct RemoteTyping {
    timeout: Duration,
    signal: Option<TypingSignal>,
}

impl RemoteTyping {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            signal: None,
        }
    }

    pub fn signal(&self) -> Option<&TypingSignal> {
        self.signal.as_ref()
    }

    /// Returns `true` if the signal was accepted for the open conversation.
    pub fn observe_typing(
        &mut self,
        payload: &TypingPayload,
        current: Option<&ConversationId>,
        now: Instant,
    ) -> bool {
        if current != Some(&payload.conversation_id) {
            return false;
        }
        self.signal = Some(TypingSignal {
            conversation_id: payload.conversation_id.clone(),
            user_id: payload.user_id.clone(),
            active: true,
            last_seen_at: now,
        });
        true
    }

    pub fn observe_stop(&mut self, payload: &TypingPayload, current: Option<&ConversationId>) -> bool {
        if current != Some(&payload.conversation_id) {
            return false;
        }
        match &mut self.signal {
            Some(signal) if signal.conversation_id == payload.conversation_id => {
                let was_active = signal.active;
                signal.active = false;
                was_active
            }
            _ => false,
        }
    }

    pub fn is_typing(&self, now: Instant) -> bool {
        self.signal.as_ref().is_some_and(|signal| {
            signal.active && now.saturating_duration_since(signal.last_seen_at) < self.timeout
        })
    }

    pub fn expires_at(&self) -> Option<Instant> {
        self.signal
            .as_ref()
            .filter(|signal| signal.active)
            .map(|signal| signal.last_seen_at + self.timeout)
    }

    pub fn clear(&mut self) {
        self.signal = None;
    }
}

#[cfg(test)]
#[path = "tests/typing_tests.rs"]
mod tests;
