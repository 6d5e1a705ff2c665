use std::collections::HashMap;

use chrono::{DateTime, Utc};
use shared::{
    domain::{ConversationId, UserId},
    protocol::Document,
    records::{ConversationRecord, ProfileRecord},
};
use tracing::warn;

use crate::session::RosterEntry;

pub const UNKNOWN_USER: &str = "Unknown User";

/// Profile point-reads keyed by identity. Every read carries a sequence
/// number; a completion only lands if it is newer than the last one applied.
#[derive(Debug, Default)]
pub struct ProfileCache {
    entries: HashMap<UserId, CachedProfile>,
    next_seq: u64,
}

#[derive(Debug, Default)]
struct CachedProfile {
    profile: Option<ProfileRecord>,
    applied_seq: u64,
    pending_seq: Option<u64>,
}

impl ProfileCache {
    /// Sequence number of a read to issue, or `None` when the profile is
    /// already known or being fetched.
    pub fn request(&mut self, user_id: &UserId) -> Option<u64> {
        let entry = self.entries.entry(user_id.clone()).or_default();
        if entry.applied_seq > 0 || entry.pending_seq.is_some() {
            return None;
        }
        self.next_seq += 1;
        entry.pending_seq = Some(self.next_seq);
        Some(self.next_seq)
    }

    /// Force a fresh read. The current profile stays visible until the read
    /// completes.
    pub fn invalidate(&mut self, user_id: &UserId) -> u64 {
        self.next_seq += 1;
        let entry = self.entries.entry(user_id.clone()).or_default();
        entry.pending_seq = Some(self.next_seq);
        self.next_seq
    }

    /// Returns true when the visible profile changed.
    pub fn complete(&mut self, user_id: &UserId, seq: u64, profile: Option<ProfileRecord>) -> bool {
        let entry = self.entries.entry(user_id.clone()).or_default();
        if entry.pending_seq == Some(seq) {
            entry.pending_seq = None;
        }
        if seq <= entry.applied_seq {
            return false;
        }
        entry.applied_seq = seq;
        let changed = entry.profile != profile;
        entry.profile = profile;
        changed
    }

    /// A failed read leaves the entry retryable on the next snapshot.
    pub fn fail(&mut self, user_id: &UserId, seq: u64) {
        if let Some(entry) = self.entries.get_mut(user_id) {
            if entry.pending_seq == Some(seq) {
                entry.pending_seq = None;
            }
        }
    }

    pub fn get(&self, user_id: &UserId) -> Option<&ProfileRecord> {
        self.entries.get(user_id).and_then(|entry| entry.profile.as_ref())
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// Cached roster records in store order plus everything needed to derive
/// the display roster.
#[derive(Debug, Default)]
pub struct RosterSynchronizer {
    records: Vec<ConversationRecord>,
    profiles: ProfileCache,
    /// Hidden conversation -> its `lastMessageTime` when it was hidden.
    hidden: HashMap<ConversationId, Option<i64>>,
}

impl RosterSynchronizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the cached records with a snapshot. Returns the profile reads
    /// needed to display it.
    pub fn apply_snapshot(&mut self, documents: &[Document], me: &UserId) -> Vec<(UserId, u64)> {
        self.records = documents
            .iter()
            .filter_map(|doc| match ConversationRecord::from_document(doc) {
                Ok(record) => Some(record),
                Err(err) => {
                    warn!(conversation_id = %doc.id, error = %err, "roster: skipping malformed conversation");
                    None
                }
            })
            .collect();

        let mut fetches = Vec::new();
        for record in &self.records {
            for member in record.other_members(me) {
                if let Some(seq) = self.profiles.request(member) {
                    fetches.push((member.clone(), seq));
                }
            }
        }
        fetches
    }

    pub fn profiles_mut(&mut self) -> &mut ProfileCache {
        &mut self.profiles
    }

    pub fn record(&self, id: &ConversationId) -> Option<&ConversationRecord> {
        self.records.iter().find(|record| &record.id == id)
    }

    /// The existing two-party conversation between `me` and `other`.
    pub fn existing_with(&self, me: &UserId, other: &UserId) -> Option<ConversationId> {
        self.records
            .iter()
            .find(|record| record.is_pair(me, other))
            .map(|record| record.id.clone())
    }

    pub fn hide(&mut self, id: &ConversationId) {
        let marker = self.record(id).and_then(|record| record.last_message_time);
        self.hidden.insert(id.clone(), marker);
    }

    fn is_hidden(&self, record: &ConversationRecord) -> bool {
        self.hidden
            .get(&record.id)
            .is_some_and(|marker| record.last_message_time <= *marker)
    }

    pub fn clear(&mut self) {
        self.records.clear();
        self.profiles.clear();
        self.hidden.clear();
    }

    /// Display roster: hidden entries removed, newest activity first,
    /// conversations without messages last, ties in store order.
    pub fn derive(&self, me: &UserId, now: DateTime<Utc>) -> Vec<RosterEntry> {
        let mut entries: Vec<RosterEntry> = self
            .records
            .iter()
            .filter(|record| !self.is_hidden(record))
            .map(|record| self.derive_entry(record, me, now))
            .collect();
        entries.sort_by(|a, b| {
            match (
                a.conversation.last_message_time,
                b.conversation.last_message_time,
            ) {
                (Some(x), Some(y)) => y.cmp(&x),
                (Some(_), None) => std::cmp::Ordering::Less,
                (None, Some(_)) => std::cmp::Ordering::Greater,
                (None, None) => std::cmp::Ordering::Equal,
            }
        });
        entries
    }

    fn derive_entry(&self, record: &ConversationRecord, me: &UserId, now: DateTime<Utc>) -> RosterEntry {
        let others: Vec<&UserId> = record.other_members(me).collect();
        let name_of = |user: &UserId| -> String {
            self.profiles
                .get(user)
                .and_then(ProfileRecord::best_name)
                .unwrap_or(UNKNOWN_USER)
                .to_owned()
        };

        let (display_name, display_photo, counterpart_id) = match others.as_slice() {
            [counterpart] => (
                name_of(*counterpart),
                self.profiles
                    .get(*counterpart)
                    .and_then(|profile| profile.photo_url.clone()),
                Some((*counterpart).clone()),
            ),
            [] => (UNKNOWN_USER.to_owned(), None, None),
            many => (
                many.iter()
                    .map(|user| name_of(*user))
                    .collect::<Vec<_>>()
                    .join(", "),
                None,
                None,
            ),
        };

        RosterEntry {
            conversation: record.clone(),
            display_name,
            display_photo,
            relative_time: relative_time(record.last_message_at(), now),
            counterpart_id,
            is_group: record.members.len() > 2,
        }
    }
}

/// Bucketed age of the last message relative to `now`.
pub fn relative_time(at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> String {
    let Some(at) = at else {
        return String::new();
    };
    let elapsed = now.signed_duration_since(at);
    let minutes = elapsed.num_minutes();
    if minutes < 1 {
        "Now".to_owned()
    } else if minutes < 60 {
        format!("{minutes}m ago")
    } else if elapsed.num_hours() < 24 {
        format!("{}h ago", elapsed.num_hours())
    } else if elapsed.num_days() < 7 {
        format!("{}d ago", elapsed.num_days())
    } else {
        at.format("%Y-%m-%d").to_string()
    }
}

#[cfg(test)]
#[path = "tests/roster_tests.rs"]
mod tests;
