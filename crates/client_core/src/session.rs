//! The read model published to the presentation layer.

use shared::{
    domain::{ConversationId, DisplayType, UserId},
    records::{ConversationRecord, MessageRecord},
};

use crate::error::SyncError;

/// A conversation as shown in the roster. Everything except `conversation`
/// is derived locally and never written back.
#[derive(Debug, Clone, PartialEq)]
pub struct RosterEntry {
    pub conversation: ConversationRecord,
    pub display_name: String,
    pub display_photo: Option<String>,
    pub relative_time: String,
    /// The other member of a two-party conversation.
    pub counterpart_id: Option<UserId>,
    pub is_group: bool,
}

impl RosterEntry {
    pub fn id(&self) -> &ConversationId {
        &self.conversation.id
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RosterFilter {
    #[default]
    All,
    Unread,
    Favourites,
    Groups,
}

impl RosterFilter {
    pub fn matches(self, entry: &RosterEntry) -> bool {
        match self {
            RosterFilter::All => true,
            RosterFilter::Unread => entry.conversation.unread_count > 0,
            RosterFilter::Favourites => entry.conversation.is_favourite,
            RosterFilter::Groups => entry.is_group,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MessageView {
    pub record: MessageRecord,
    pub display_type: DisplayType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SlotKind {
    Roster,
    Messages,
    Typing,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SlotPhase {
    #[default]
    Idle,
    Subscribing,
    Live,
    Error,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubscriptionStatus {
    pub roster: SlotPhase,
    pub messages: SlotPhase,
    pub typing: SlotPhase,
}

impl SubscriptionStatus {
    pub fn get(&self, kind: SlotKind) -> SlotPhase {
        match kind {
            SlotKind::Roster => self.roster,
            SlotKind::Messages => self.messages,
            SlotKind::Typing => self.typing,
        }
    }

    pub fn set(&mut self, kind: SlotKind, phase: SlotPhase) {
        match kind {
            SlotKind::Roster => self.roster = phase,
            SlotKind::Messages => self.messages = phase,
            SlotKind::Typing => self.typing = phase,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionState {
    pub identity: Option<UserId>,
    pub roster: Vec<RosterEntry>,
    pub roster_loading: bool,
    pub active_conversation: Option<ConversationId>,
    /// Only ever holds messages of `active_conversation`.
    pub messages: Vec<MessageView>,
    pub typing: Vec<UserId>,
    pub subscriptions: SubscriptionStatus,
}

impl SessionState {
    pub fn filtered_roster(&self, filter: RosterFilter) -> Vec<&RosterEntry> {
        self.roster.iter().filter(|entry| filter.matches(entry)).collect()
    }

    pub fn roster_entry(&self, id: &ConversationId) -> Option<&RosterEntry> {
        self.roster.iter().find(|entry| entry.id() == id)
    }

    pub fn active_entry(&self) -> Option<&RosterEntry> {
        self.active_conversation
            .as_ref()
            .and_then(|id| self.roster_entry(id))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    IdentityChanged(Option<UserId>),
    RosterUpdated,
    ActiveConversationChanged(Option<ConversationId>),
    MessagesUpdated,
    TypingUpdated,
    SubscriptionChanged { kind: SlotKind, phase: SlotPhase },
    SubscriptionFailed { kind: SlotKind, error: SyncError },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: &str, unread: u32, favourite: bool, members: usize) -> RosterEntry {
        RosterEntry {
            conversation: ConversationRecord {
                id: ConversationId::from(id),
                members: (0..members).map(|i| UserId::new(format!("u{i}"))).collect(),
                unread_count: unread,
                is_favourite: favourite,
                ..ConversationRecord::default()
            },
            display_name: id.into(),
            display_photo: None,
            relative_time: String::new(),
            counterpart_id: None,
            is_group: members > 2,
        }
    }

    #[test]
    fn filters_select_matching_entries() {
        let state = SessionState {
            roster: vec![
                entry("plain", 0, false, 2),
                entry("unread", 3, false, 2),
                entry("fav", 0, true, 2),
                entry("group", 0, false, 3),
            ],
            ..SessionState::default()
        };
        let ids = |filter: RosterFilter| -> Vec<String> {
            state
                .filtered_roster(filter)
                .into_iter()
                .map(|e| e.id().to_string())
                .collect()
        };
        assert_eq!(ids(RosterFilter::All).len(), 4);
        assert_eq!(ids(RosterFilter::Unread), vec!["unread"]);
        assert_eq!(ids(RosterFilter::Favourites), vec!["fav"]);
        assert_eq!(ids(RosterFilter::Groups), vec!["group"]);
    }
}
