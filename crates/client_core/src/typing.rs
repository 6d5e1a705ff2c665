//! Debounced typing signals.
//!
//! [`TypingCoordinator`] is pure bookkeeping: it is told about compose
//! activity and timer expiry and answers with the writes to perform and the
//! timer to (re)arm. Every re-arm bumps a token so an older timer that fires
//! late is recognised and ignored.

use std::time::Duration;

use shared::{
    domain::{ConversationId, UserId},
    protocol::{Document, Patch, CONVERSATIONS},
    records::{fields, ConversationRecord},
};
use tokio::time::Instant;

use crate::{
    error::{SyncError, SyncResult},
    store::RemoteStore,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypingWrite {
    Set(ConversationId),
    Clear(ConversationId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TypingTimer {
    pub token: u64,
    pub deadline: Instant,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TypingActions {
    pub write: Option<TypingWrite>,
    pub arm: Option<TypingTimer>,
}

#[derive(Debug)]
pub struct TypingCoordinator {
    debounce: Duration,
    conversation: Option<ConversationId>,
    signal_set: bool,
    deadline: Option<Instant>,
    token: u64,
}

impl TypingCoordinator {
    pub fn new(debounce: Duration) -> Self {
        Self {
            debounce,
            conversation: None,
            signal_set: false,
            deadline: None,
            token: 0,
        }
    }

    /// Switch to another conversation (or none). A signal still set on the
    /// previous conversation is cleared.
    pub fn activate(&mut self, conversation: Option<ConversationId>) -> Option<TypingWrite> {
        let clear = if self.signal_set {
            self.conversation.take().map(TypingWrite::Clear)
        } else {
            None
        };
        self.conversation = conversation;
        self.signal_set = false;
        self.deadline = None;
        self.token += 1;
        clear
    }

    pub fn on_compose(&mut self, non_empty: bool, now: Instant) -> TypingActions {
        let Some(conversation) = self.conversation.clone() else {
            return TypingActions::default();
        };
        self.token += 1;

        if !non_empty {
            self.deadline = None;
            let write = if self.signal_set {
                self.signal_set = false;
                Some(TypingWrite::Clear(conversation))
            } else {
                None
            };
            return TypingActions { write, arm: None };
        }

        let write = if self.signal_set {
            None
        } else {
            self.signal_set = true;
            Some(TypingWrite::Set(conversation))
        };
        let deadline = now + self.debounce;
        self.deadline = Some(deadline);
        TypingActions {
            write,
            arm: Some(TypingTimer {
                token: self.token,
                deadline,
            }),
        }
    }

    /// Timer expiry. Stale tokens and early wakeups do nothing.
    pub fn on_deadline(&mut self, token: u64, now: Instant) -> Option<TypingWrite> {
        if token != self.token || !self.deadline.is_some_and(|deadline| now >= deadline) {
            return None;
        }
        self.deadline = None;
        if !self.signal_set {
            return None;
        }
        self.signal_set = false;
        self.conversation.clone().map(TypingWrite::Clear)
    }

    pub fn is_signal_set(&self) -> bool {
        self.signal_set
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }
}

/// Who is typing according to a conversation document, excluding `me`.
pub fn typing_members(document: Option<&Document>, me: &UserId) -> SyncResult<Vec<UserId>> {
    let Some(document) = document else {
        return Ok(Vec::new());
    };
    let record = ConversationRecord::from_document(document)?;
    Ok(record.typing_members(me))
}

pub async fn write_typing(store: &dyn RemoteStore, me: &UserId, write: &TypingWrite) -> SyncResult<()> {
    let (conversation, patch) = match write {
        TypingWrite::Set(conversation) => (
            conversation,
            Patch::new().server_timestamp(fields::typing_of(me)),
        ),
        TypingWrite::Clear(conversation) => (conversation, Patch::new().delete(fields::typing_of(me))),
    };
    store
        .update_document(CONVERSATIONS, conversation.as_str(), patch)
        .await
        .map_err(SyncError::from)
}
