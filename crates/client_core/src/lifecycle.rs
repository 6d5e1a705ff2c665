use std::sync::Arc;

use shared::{
    domain::{ConversationId, UserId},
    error::StoreError,
    protocol::{messages_collection, Direction, Query, SnapshotEvent, CONVERSATIONS},
    records::fields,
};
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, info};

use crate::{
    session::{SlotKind, SlotPhase},
    store::{RemoteStore, Subscription, SubscriptionHandle},
};

/// What a slot subscribes to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlotTarget {
    /// Conversations the identity is a member of.
    Roster(UserId),
    /// Message log of one conversation, oldest first.
    Messages(ConversationId),
    /// The conversation record itself, for its typing map.
    Typing(ConversationId),
}

impl SlotTarget {
    pub fn kind(&self) -> SlotKind {
        match self {
            SlotTarget::Roster(_) => SlotKind::Roster,
            SlotTarget::Messages(_) => SlotKind::Messages,
            SlotTarget::Typing(_) => SlotKind::Typing,
        }
    }

    async fn subscribe(&self, store: &dyn RemoteStore) -> Result<Subscription, StoreError> {
        match self {
            SlotTarget::Roster(user_id) => {
                store
                    .subscribe_query(
                        Query::collection(CONVERSATIONS)
                            .where_array_contains(fields::MEMBERS, user_id.as_str()),
                    )
                    .await
            }
            SlotTarget::Messages(conversation) => {
                store
                    .subscribe_query(
                        Query::collection(messages_collection(conversation))
                            .order_by(fields::CREATED_AT, Direction::Ascending),
                    )
                    .await
            }
            SlotTarget::Typing(conversation) => {
                store
                    .subscribe_document(CONVERSATIONS, conversation.as_str())
                    .await
            }
        }
    }
}

/// Delivered to the session loop. `generation` identifies which start of a
/// slot produced the message.
#[derive(Debug)]
pub enum SlotMessage {
    Established {
        kind: SlotKind,
        generation: u64,
        result: Result<Subscription, StoreError>,
    },
    Snapshot {
        kind: SlotKind,
        generation: u64,
        event: SnapshotEvent,
    },
}

#[derive(Debug, PartialEq)]
pub enum Establish {
    Live,
    Stale,
    Failed(StoreError),
}

#[derive(Debug, Default)]
struct Slot {
    phase: SlotPhase,
    generation: u64,
    target: Option<SlotTarget>,
    handle: Option<SubscriptionHandle>,
    forwarder: Option<JoinHandle<()>>,
}

/// Owns the roster, messages and typing subscriptions of one session.
///
/// Starting a slot first tears down whatever that slot held, synchronously,
/// so two subscriptions of the same kind are never live together. Results
/// that arrive for an older generation are unsubscribed and dropped.
pub struct SubscriptionLifecycle {
    store: Arc<dyn RemoteStore>,
    tx: mpsc::UnboundedSender<SlotMessage>,
    roster: Slot,
    messages: Slot,
    typing: Slot,
    next_generation: u64,
}

impl SubscriptionLifecycle {
    pub fn new(store: Arc<dyn RemoteStore>) -> (Self, mpsc::UnboundedReceiver<SlotMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let lifecycle = Self {
            store,
            tx,
            roster: Slot::default(),
            messages: Slot::default(),
            typing: Slot::default(),
            next_generation: 0,
        };
        (lifecycle, rx)
    }

    fn slot(&self, kind: SlotKind) -> &Slot {
        match kind {
            SlotKind::Roster => &self.roster,
            SlotKind::Messages => &self.messages,
            SlotKind::Typing => &self.typing,
        }
    }

    fn slot_mut(&mut self, kind: SlotKind) -> &mut Slot {
        match kind {
            SlotKind::Roster => &mut self.roster,
            SlotKind::Messages => &mut self.messages,
            SlotKind::Typing => &mut self.typing,
        }
    }

    pub fn phase(&self, kind: SlotKind) -> SlotPhase {
        self.slot(kind).phase
    }

    pub fn target(&self, kind: SlotKind) -> Option<&SlotTarget> {
        self.slot(kind).target.as_ref()
    }

    /// True while `generation` is the live subscription of `kind`.
    pub fn is_current(&self, kind: SlotKind, generation: u64) -> bool {
        let slot = self.slot(kind);
        slot.generation == generation && slot.phase == SlotPhase::Live
    }

    /// Stop the slot's current subscription, then request a new one.
    pub fn start(&mut self, target: SlotTarget) -> u64 {
        let kind = target.kind();
        self.stop(kind);

        self.next_generation += 1;
        let generation = self.next_generation;
        let slot = self.slot_mut(kind);
        slot.phase = SlotPhase::Subscribing;
        slot.generation = generation;
        slot.target = Some(target.clone());
        info!(?kind, generation, ?target, "lifecycle: subscribing");

        let store = Arc::clone(&self.store);
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let result = target.subscribe(store.as_ref()).await;
            if let Err(rejected) = tx.send(SlotMessage::Established {
                kind,
                generation,
                result,
            }) {
                // Session loop is gone; nobody will ever stop this one.
                if let SlotMessage::Established {
                    result: Ok(subscription),
                    ..
                } = rejected.0
                {
                    store.unsubscribe(subscription.handle);
                }
            }
        });
        generation
    }

    /// Install a finished subscribe call if it still belongs to the slot.
    pub fn establish(
        &mut self,
        kind: SlotKind,
        generation: u64,
        result: Result<Subscription, StoreError>,
    ) -> Establish {
        let current = {
            let slot = self.slot(kind);
            slot.generation == generation && slot.phase == SlotPhase::Subscribing
        };
        if !current {
            if let Ok(subscription) = result {
                self.store.unsubscribe(subscription.handle);
            }
            debug!(?kind, generation, "lifecycle: dropped stale subscription");
            return Establish::Stale;
        }

        let mut subscription = match result {
            Ok(subscription) => subscription,
            Err(err) => {
                let slot = self.slot_mut(kind);
                slot.phase = SlotPhase::Error;
                slot.target = None;
                return Establish::Failed(err);
            }
        };

        let tx = self.tx.clone();
        let forwarder = tokio::spawn(async move {
            while let Some(event) = subscription.events.recv().await {
                if tx
                    .send(SlotMessage::Snapshot {
                        kind,
                        generation,
                        event,
                    })
                    .is_err()
                {
                    break;
                }
            }
        });

        let slot = self.slot_mut(kind);
        slot.phase = SlotPhase::Live;
        slot.handle = Some(subscription.handle);
        slot.forwarder = Some(forwarder);
        info!(?kind, generation, "lifecycle: live");
        Establish::Live
    }

    /// Move a live slot to `Error` after the store reported a failure on it.
    /// Returns false when the error belongs to an older generation.
    pub fn fail(&mut self, kind: SlotKind, generation: u64) -> bool {
        if !self.is_current(kind, generation) {
            return false;
        }
        self.release(kind);
        let slot = self.slot_mut(kind);
        slot.phase = SlotPhase::Error;
        slot.target = None;
        true
    }

    /// Unsubscribe and return the slot to `Idle`. Any pending subscribe call
    /// becomes stale.
    pub fn stop(&mut self, kind: SlotKind) {
        self.release(kind);
        let slot = self.slot_mut(kind);
        if slot.phase != SlotPhase::Idle {
            debug!(?kind, generation = slot.generation, "lifecycle: stopped");
        }
        slot.phase = SlotPhase::Idle;
        slot.target = None;
    }

    pub fn stop_all(&mut self) {
        for kind in [SlotKind::Roster, SlotKind::Messages, SlotKind::Typing] {
            self.stop(kind);
        }
    }

    fn release(&mut self, kind: SlotKind) {
        let slot = self.slot_mut(kind);
        let handle = slot.handle.take();
        if let Some(forwarder) = slot.forwarder.take() {
            forwarder.abort();
        }
        if let Some(handle) = handle {
            self.store.unsubscribe(handle);
        }
    }
}

impl Drop for SubscriptionLifecycle {
    fn drop(&mut self) {
        self.stop_all();
    }
}

#[cfg(test)]
#[path = "tests/lifecycle_tests.rs"]
mod tests;
