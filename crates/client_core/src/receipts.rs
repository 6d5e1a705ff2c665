use std::collections::HashSet;

use futures::future::join_all;
use shared::{
    domain::{ConversationId, MessageId, MessageStatus},
    protocol::{messages_collection, Patch, CONVERSATIONS},
    records::fields,
};

use crate::{
    error::{SyncError, SyncResult},
    store::RemoteStore,
};

/// Tracks read-receipt writes in flight for the active conversation so a
/// burst of snapshots marks each message once.
#[derive(Debug, Default)]
pub struct ReadReceipts {
    conversation: Option<ConversationId>,
    inflight: HashSet<MessageId>,
}

impl ReadReceipts {
    pub fn reset(&mut self, conversation: Option<ConversationId>) {
        self.conversation = conversation;
        self.inflight.clear();
    }

    /// The subset of `unread` not already being marked. Those ids are
    /// recorded as in flight.
    pub fn pending(&mut self, conversation: &ConversationId, unread: Vec<MessageId>) -> Vec<MessageId> {
        if self.conversation.as_ref() != Some(conversation) {
            return Vec::new();
        }
        unread
            .into_iter()
            .filter(|id| self.inflight.insert(id.clone()))
            .collect()
    }

    /// Forget a finished batch. Completions for another conversation are
    /// ignored.
    pub fn settle(&mut self, conversation: &ConversationId, ids: &[MessageId]) {
        if self.conversation.as_ref() != Some(conversation) {
            return;
        }
        for id in ids {
            self.inflight.remove(id);
        }
    }

    pub fn inflight(&self) -> usize {
        self.inflight.len()
    }
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct ReceiptOutcome {
    pub marked: Vec<MessageId>,
    pub failed: Vec<(MessageId, SyncError)>,
}

pub async fn mark_conversation_read(
    store: &dyn RemoteStore,
    conversation: &ConversationId,
) -> SyncResult<()> {
    store
        .update_document(
            CONVERSATIONS,
            conversation.as_str(),
            Patch::new().set(fields::UNREAD_COUNT, 0),
        )
        .await
        .map_err(SyncError::from)
}

/// One status write per message, all in parallel. A message that no longer
/// exists counts as marked.
pub async fn mark_messages_read(
    store: &dyn RemoteStore,
    conversation: &ConversationId,
    ids: &[MessageId],
) -> ReceiptOutcome {
    let collection = messages_collection(conversation);
    let writes = ids.iter().map(|id| {
        let collection = collection.as_str();
        async move {
            let result = store
                .update_document(
                    collection,
                    id.as_str(),
                    Patch::new().set(fields::STATUS, MessageStatus::Read.as_str()),
                )
                .await
                .map_err(SyncError::from);
            (id.clone(), result)
        }
    });

    let mut outcome = ReceiptOutcome::default();
    for (id, result) in join_all(writes).await {
        match result {
            Ok(()) => outcome.marked.push(id),
            Err(err) if err.is_not_found() => outcome.marked.push(id),
            Err(err) => outcome.failed.push((id, err)),
        }
    }
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_skips_ids_already_in_flight() {
        let conversation = ConversationId::from("c1");
        let mut receipts = ReadReceipts::default();
        receipts.reset(Some(conversation.clone()));

        let first = receipts.pending(
            &conversation,
            vec![MessageId::from("m1"), MessageId::from("m2")],
        );
        assert_eq!(first.len(), 2);
        let second = receipts.pending(
            &conversation,
            vec![MessageId::from("m2"), MessageId::from("m3")],
        );
        assert_eq!(second, vec![MessageId::from("m3")]);

        receipts.settle(&conversation, &first);
        assert_eq!(receipts.inflight(), 1);
    }

    #[test]
    fn other_conversations_are_ignored() {
        let mut receipts = ReadReceipts::default();
        receipts.reset(Some(ConversationId::from("c1")));
        let other = ConversationId::from("c2");
        assert!(receipts
            .pending(&other, vec![MessageId::from("m1")])
            .is_empty());
        receipts.settle(&other, &[MessageId::from("m1")]);
        assert_eq!(receipts.inflight(), 0);
    }
}
