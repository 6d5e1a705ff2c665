//! The single-writer session loop.
//!
//! One task owns every piece of session state. Identity changes, user
//! commands, subscription snapshots and completions of background writes all
//! arrive as messages and are applied one at a time in arrival order. Remote
//! writes go through one [`OrderedWriter`] so they reach the store in the
//! order the session issued them; anything they report back is checked
//! against the current identity epoch and active conversation before it is
//! applied.

use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use shared::{
    domain::{ConversationId, MessageId, UserId},
    error::StoreError,
    protocol::{Patch, Query, SnapshotEvent, CONVERSATIONS, USERS},
    records::{fields, ConversationRecord, ProfileRecord},
};
use tokio::{
    sync::{broadcast, mpsc, oneshot, watch},
    task::JoinHandle,
    time::Instant,
};
use tracing::{debug, info, warn};

use crate::{
    config::SyncSettings,
    directory,
    error::{BatchFailure, SyncError, SyncResult, ValidationError},
    lifecycle::{Establish, SlotMessage, SlotTarget, SubscriptionLifecycle},
    messages::{self, MessageStream, OutgoingMessage},
    receipts::{self, ReadReceipts, ReceiptOutcome},
    roster::RosterSynchronizer,
    session::{SessionEvent, SessionState, SlotKind, SlotPhase, SubscriptionStatus},
    store::RemoteStore,
    typing::{self, TypingActions, TypingCoordinator, TypingTimer, TypingWrite},
    writer::OrderedWriter,
};

type Reply<T> = oneshot::Sender<SyncResult<T>>;

enum Command {
    SelectConversation {
        conversation: Option<ConversationId>,
        reply: Reply<()>,
    },
    Send {
        message: OutgoingMessage,
        reply: Reply<MessageId>,
    },
    DeleteMessage {
        id: MessageId,
        reply: Reply<()>,
    },
    DeleteMessages {
        ids: Vec<MessageId>,
        reply: Reply<()>,
    },
    ComposeActivity {
        non_empty: bool,
        reply: Reply<()>,
    },
    CreateConversation {
        other: UserId,
        reply: Reply<ConversationId>,
    },
    ToggleFavourite {
        conversation: ConversationId,
        reply: Reply<bool>,
    },
    HideConversation {
        conversation: ConversationId,
        reply: Reply<()>,
    },
    InvalidateProfile {
        user: UserId,
        reply: Reply<()>,
    },
    SearchContacts {
        needle: String,
        reply: Reply<Vec<ProfileRecord>>,
    },
    Shutdown {
        reply: Reply<()>,
    },
}

enum Internal {
    ProfileLoaded {
        epoch: u64,
        user: UserId,
        seq: u64,
        result: Result<Option<ProfileRecord>, StoreError>,
    },
    ReceiptsSettled {
        epoch: u64,
        conversation: ConversationId,
        ids: Vec<MessageId>,
        outcome: ReceiptOutcome,
    },
    TypingDeadline {
        token: u64,
    },
}

/// Client side of a running session. Cheap to clone; every clone talks to
/// the same session loop.
#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::Sender<Command>,
    state: watch::Receiver<SessionState>,
    events: broadcast::Sender<SessionEvent>,
}

/// Start a session loop that follows `identity` and synchronizes against
/// `store`. The identity current at call time is applied before this returns.
pub fn spawn_session(
    store: Arc<dyn RemoteStore>,
    identity: watch::Receiver<Option<UserId>>,
    settings: SyncSettings,
) -> SessionHandle {
    let (command_tx, command_rx) = mpsc::channel(settings.command_buffer.max(1));
    let (state_tx, state_rx) = watch::channel(SessionState::default());
    let (events, _) = broadcast::channel(settings.event_buffer.max(1));
    let (internal_tx, internal_rx) = mpsc::unbounded_channel();
    let (lifecycle, slot_rx) = SubscriptionLifecycle::new(Arc::clone(&store));

    let mut engine = SessionEngine {
        typing: TypingCoordinator::new(settings.typing_debounce()),
        store,
        settings,
        identity: None,
        epoch: 0,
        lifecycle,
        roster: RosterSynchronizer::new(),
        roster_loading: false,
        active: None,
        messages: MessageStream::default(),
        receipts: ReadReceipts::default(),
        typing_timer: None,
        typing_ids: Vec::new(),
        writer: OrderedWriter::spawn(),
        state_tx,
        events: events.clone(),
        internal_tx,
    };

    let mut identity = identity;
    let initial = identity.borrow_and_update().clone();
    engine.set_identity(initial);

    tokio::spawn(engine.run(command_rx, identity, slot_rx, internal_rx));

    SessionHandle {
        commands: command_tx,
        state: state_rx,
        events,
    }
}

impl SessionHandle {
    pub fn state(&self) -> SessionState {
        self.state.borrow().clone()
    }

    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state.clone()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    async fn request<T>(&self, build: impl FnOnce(Reply<T>) -> Command) -> SyncResult<T> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(build(reply))
            .await
            .map_err(|_| SyncError::SessionClosed)?;
        rx.await.map_err(|_| SyncError::SessionClosed)?
    }

    /// Make `conversation` the active one, or clear the selection.
    pub async fn select_conversation(
        &self,
        conversation: Option<ConversationId>,
    ) -> SyncResult<()> {
        self.request(|reply| Command::SelectConversation {
            conversation,
            reply,
        })
        .await
    }

    pub async fn send(&self, message: OutgoingMessage) -> SyncResult<MessageId> {
        self.request(|reply| Command::Send { message, reply }).await
    }

    pub async fn send_text(&self, text: impl Into<String>) -> SyncResult<MessageId> {
        self.send(OutgoingMessage::text(text)).await
    }

    pub async fn delete_message(&self, id: MessageId) -> SyncResult<()> {
        self.request(|reply| Command::DeleteMessage { id, reply })
            .await
    }

    /// Parallel delete. Succeeded deletions stay in effect when others fail.
    pub async fn delete_messages(&self, ids: Vec<MessageId>) -> SyncResult<()> {
        self.request(|reply| Command::DeleteMessages { ids, reply })
            .await
    }

    pub async fn set_compose_activity(&self, non_empty: bool) -> SyncResult<()> {
        self.request(|reply| Command::ComposeActivity { non_empty, reply })
            .await
    }

    /// Id of the two-party conversation with `other`, created if needed.
    pub async fn create_conversation(&self, other: UserId) -> SyncResult<ConversationId> {
        self.request(|reply| Command::CreateConversation { other, reply })
            .await
    }

    /// Returns the new favourite flag.
    pub async fn toggle_favourite(&self, conversation: ConversationId) -> SyncResult<bool> {
        self.request(|reply| Command::ToggleFavourite {
            conversation,
            reply,
        })
        .await
    }

    pub async fn hide_conversation(&self, conversation: ConversationId) -> SyncResult<()> {
        self.request(|reply| Command::HideConversation {
            conversation,
            reply,
        })
        .await
    }

    pub async fn invalidate_profile(&self, user: UserId) -> SyncResult<()> {
        self.request(|reply| Command::InvalidateProfile { user, reply })
            .await
    }

    pub async fn search_contacts(&self, needle: impl Into<String>) -> SyncResult<Vec<ProfileRecord>> {
        let needle = needle.into();
        self.request(|reply| Command::SearchContacts { needle, reply })
            .await
    }

    /// Stop every subscription, publish offline presence and end the loop.
    pub async fn shutdown(&self) -> SyncResult<()> {
        self.request(|reply| Command::Shutdown { reply }).await
    }
}

struct SessionEngine {
    store: Arc<dyn RemoteStore>,
    settings: SyncSettings,
    identity: Option<UserId>,
    /// Bumped on every identity change; completions from an older epoch are
    /// dropped.
    epoch: u64,
    lifecycle: SubscriptionLifecycle,
    roster: RosterSynchronizer,
    roster_loading: bool,
    active: Option<ConversationId>,
    messages: MessageStream,
    receipts: ReadReceipts,
    typing: TypingCoordinator,
    typing_timer: Option<JoinHandle<()>>,
    typing_ids: Vec<UserId>,
    /// Every remote write, in issue order.
    writer: OrderedWriter,
    state_tx: watch::Sender<SessionState>,
    events: broadcast::Sender<SessionEvent>,
    internal_tx: mpsc::UnboundedSender<Internal>,
}

impl SessionEngine {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut identity: watch::Receiver<Option<UserId>>,
        mut slots: mpsc::UnboundedReceiver<SlotMessage>,
        mut internal: mpsc::UnboundedReceiver<Internal>,
    ) {
        let mut identity_open = true;
        loop {
            tokio::select! {
                changed = identity.changed(), if identity_open => match changed {
                    Ok(()) => {
                        let next = identity.borrow_and_update().clone();
                        self.set_identity(next);
                    }
                    Err(_) => {
                        debug!("session: identity source closed");
                        identity_open = false;
                    }
                },
                command = commands.recv() => match command {
                    Some(Command::Shutdown { reply }) => {
                        self.teardown().await;
                        let _ = reply.send(Ok(()));
                        break;
                    }
                    Some(command) => self.handle_command(command),
                    None => {
                        self.teardown().await;
                        break;
                    }
                },
                Some(message) = slots.recv() => self.handle_slot_message(message),
                Some(message) = internal.recv() => self.handle_internal(message),
            }
        }
        info!("session: stopped");
    }

    fn me(&self) -> SyncResult<UserId> {
        self.identity
            .clone()
            .ok_or(SyncError::Validation(ValidationError::NoIdentity))
    }

    fn active_conversation(&self) -> SyncResult<(UserId, ConversationId)> {
        let me = self.me()?;
        let active = self
            .active
            .clone()
            .ok_or(SyncError::Validation(ValidationError::NoActiveConversation))?;
        Ok((me, active))
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    fn publish(&self) {
        let roster = match &self.identity {
            Some(me) => self.roster.derive(me, Utc::now()),
            None => Vec::new(),
        };
        let messages = match &self.identity {
            Some(me) => self.messages.views(me),
            None => Vec::new(),
        };
        let mut subscriptions = SubscriptionStatus::default();
        for kind in [SlotKind::Roster, SlotKind::Messages, SlotKind::Typing] {
            subscriptions.set(kind, self.lifecycle.phase(kind));
        }
        self.state_tx.send_replace(SessionState {
            identity: self.identity.clone(),
            roster,
            roster_loading: self.roster_loading,
            active_conversation: self.active.clone(),
            messages,
            typing: self.typing_ids.clone(),
            subscriptions,
        });
    }

    fn emit_phase(&self, kind: SlotKind) {
        self.emit(SessionEvent::SubscriptionChanged {
            kind,
            phase: self.lifecycle.phase(kind),
        });
    }

    fn start_slot(&mut self, target: SlotTarget) {
        let kind = target.kind();
        self.lifecycle.start(target);
        self.emit_phase(kind);
    }

    fn stop_slot(&mut self, kind: SlotKind) {
        if self.lifecycle.phase(kind) != SlotPhase::Idle {
            self.lifecycle.stop(kind);
            self.emit_phase(kind);
        }
    }

    // ---- identity ----

    fn set_identity(&mut self, identity: Option<UserId>) {
        if self.identity == identity {
            return;
        }
        self.release_identity();
        self.epoch += 1;
        self.identity = identity.clone();
        info!(user_id = ?identity, epoch = self.epoch, "session: identity changed");

        if let Some(me) = identity.clone() {
            if self.settings.publish_presence {
                let store = Arc::clone(&self.store);
                let user = me.clone();
                self.writer.submit(async move {
                    directory::publish_presence(store.as_ref(), &user, true).await;
                });
            }
            self.roster_loading = true;
            self.start_slot(SlotTarget::Roster(me));
        }

        self.emit(SessionEvent::IdentityChanged(identity));
        self.publish();
    }

    /// Stop everything the current identity owns and clear session state.
    /// Returns the identity that was released.
    fn clear_session(&mut self) -> Option<UserId> {
        let previous = self.identity.take()?;
        if let Some(write) = self.typing.activate(None) {
            self.queue_typing_write(previous.clone(), write);
        }
        self.cancel_typing_timer();
        for kind in [SlotKind::Messages, SlotKind::Typing, SlotKind::Roster] {
            self.stop_slot(kind);
        }
        self.roster.clear();
        self.roster_loading = false;
        self.active = None;
        self.messages.reset(None);
        self.receipts.reset(None);
        self.typing_ids.clear();
        Some(previous)
    }

    /// Returns true when an identity was released.
    fn release_identity(&mut self) -> bool {
        let Some(previous) = self.clear_session() else {
            return false;
        };
        if self.settings.publish_presence {
            let store = Arc::clone(&self.store);
            self.writer.submit(async move {
                directory::publish_presence(store.as_ref(), &previous, false).await;
            });
        }
        true
    }

    /// Release everything and wait for every queued write, the offline
    /// presence write included.
    async fn teardown(&mut self) {
        if self.release_identity() {
            self.emit(SessionEvent::IdentityChanged(None));
        }
        self.lifecycle.stop_all();
        self.publish();
        self.writer.flush().await;
    }

    // ---- commands ----

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::SelectConversation {
                conversation,
                reply,
            } => {
                let _ = reply.send(self.select_conversation(conversation));
            }
            Command::Send { message, reply } => self.send(message, reply),
            Command::DeleteMessage { id, reply } => self.delete_message(id, reply),
            Command::DeleteMessages { ids, reply } => self.delete_messages(ids, reply),
            Command::ComposeActivity { non_empty, reply } => {
                let _ = reply.send(self.compose_activity(non_empty));
            }
            Command::CreateConversation { other, reply } => self.create_conversation(other, reply),
            Command::ToggleFavourite {
                conversation,
                reply,
            } => self.toggle_favourite(conversation, reply),
            Command::HideConversation {
                conversation,
                reply,
            } => {
                let _ = reply.send(self.hide_conversation(conversation));
            }
            Command::InvalidateProfile { user, reply } => {
                let _ = reply.send(self.invalidate_profile(user));
            }
            Command::SearchContacts { needle, reply } => self.search_contacts(needle, reply),
            Command::Shutdown { reply } => {
                let _ = reply.send(Ok(()));
            }
        }
    }

    fn select_conversation(&mut self, conversation: Option<ConversationId>) -> SyncResult<()> {
        let me = match (&conversation, self.me()) {
            (Some(_), Err(err)) => return Err(err),
            (_, me) => me.ok(),
        };

        if conversation.is_some() && conversation == self.active {
            if let Some(active) = &conversation {
                self.queue_mark_conversation_read(active.clone());
            }
            return Ok(());
        }

        if let Some(write) = self.typing.activate(conversation.clone()) {
            if let Some(me) = &me {
                self.queue_typing_write(me.clone(), write);
            }
        }
        self.cancel_typing_timer();

        // Both slots go idle before anything for the new conversation starts.
        self.stop_slot(SlotKind::Messages);
        self.stop_slot(SlotKind::Typing);
        self.messages.reset(conversation.clone());
        self.receipts.reset(conversation.clone());
        self.typing_ids.clear();
        self.active = conversation.clone();
        info!(conversation_id = ?conversation, "session: active conversation changed");

        if let Some(active) = conversation.clone() {
            self.queue_mark_conversation_read(active.clone());
            self.start_slot(SlotTarget::Messages(active.clone()));
            self.start_slot(SlotTarget::Typing(active));
        }

        self.emit(SessionEvent::ActiveConversationChanged(conversation));
        self.emit(SessionEvent::MessagesUpdated);
        self.emit(SessionEvent::TypingUpdated);
        self.publish();
        Ok(())
    }

    fn send(&mut self, message: OutgoingMessage, reply: Reply<MessageId>) {
        let (me, active) = match self.active_conversation() {
            Ok(pair) => pair,
            Err(err) => {
                let _ = reply.send(Err(err));
                return;
            }
        };
        if message.is_empty() {
            let _ = reply.send(Err(ValidationError::EmptyPayload.into()));
            return;
        }

        let store = Arc::clone(&self.store);
        self.writer.submit(async move {
            let result = messages::send_message(store.as_ref(), &active, &me, &message).await;
            let _ = reply.send(result);
        });
    }

    fn delete_message(&mut self, id: MessageId, reply: Reply<()>) {
        let (me, active) = match self.active_conversation() {
            Ok(pair) => pair,
            Err(err) => {
                let _ = reply.send(Err(err));
                return;
            }
        };
        let plan = self.messages.plan_deletion(&me, std::slice::from_ref(&id));
        if !plan.forbidden.is_empty() {
            let _ = reply.send(Err(ValidationError::NotMessageOwner(id).into()));
            return;
        }
        if plan.remote.is_empty() {
            debug!(message_id = %id, "messages: delete of unknown message is a no-op");
            let _ = reply.send(Ok(()));
            return;
        }

        let store = Arc::clone(&self.store);
        self.writer.submit(async move {
            let result = match messages::delete_messages(store.as_ref(), &active, &plan.remote)
                .await
                .pop()
            {
                Some((_, Err(err))) if !err.is_not_found() => Err(err),
                _ => Ok(()),
            };
            let _ = reply.send(result);
        });
    }

    fn delete_messages(&mut self, ids: Vec<MessageId>, reply: Reply<()>) {
        let (me, active) = match self.active_conversation() {
            Ok(pair) => pair,
            Err(err) => {
                let _ = reply.send(Err(err));
                return;
            }
        };
        let attempted = ids.len();
        let plan = self.messages.plan_deletion(&me, &ids);
        let mut failures: Vec<(String, SyncError)> = plan
            .missing
            .iter()
            .map(|id| (id.to_string(), SyncError::not_found(format!("message {id}"))))
            .chain(plan.forbidden.iter().map(|id| {
                (
                    id.to_string(),
                    SyncError::from(ValidationError::NotMessageOwner(id.clone())),
                )
            }))
            .collect();

        let store = Arc::clone(&self.store);
        self.writer.submit(async move {
            for (id, result) in messages::delete_messages(store.as_ref(), &active, &plan.remote).await {
                if let Err(err) = result {
                    failures.push((id.to_string(), err));
                }
            }
            let result = if failures.is_empty() {
                Ok(())
            } else {
                warn!(
                    conversation_id = %active,
                    attempted,
                    failed = failures.len(),
                    "messages: batch delete partially failed"
                );
                Err(SyncError::Batch(BatchFailure {
                    attempted,
                    failures,
                }))
            };
            let _ = reply.send(result);
        });
    }

    fn compose_activity(&mut self, non_empty: bool) -> SyncResult<()> {
        let Some(me) = self.identity.clone() else {
            return Ok(());
        };
        let TypingActions { write, arm } = self.typing.on_compose(non_empty, Instant::now());
        if let Some(write) = write {
            self.queue_typing_write(me, write);
        }
        match arm {
            Some(timer) => self.arm_typing_timer(timer),
            None => self.cancel_typing_timer(),
        }
        Ok(())
    }

    fn create_conversation(&mut self, other: UserId, reply: Reply<ConversationId>) {
        let me = match self.me() {
            Ok(me) => me,
            Err(err) => {
                let _ = reply.send(Err(err));
                return;
            }
        };
        if other == me {
            let _ = reply.send(Err(ValidationError::SelfConversation.into()));
            return;
        }
        if let Some(existing) = self.roster.existing_with(&me, &other) {
            let _ = reply.send(Ok(existing));
            return;
        }

        // Queued behind earlier creates, so a second create for the same pair
        // finds the first one's record.
        let store = Arc::clone(&self.store);
        self.writer.submit(async move {
            let result = find_or_create_conversation(store.as_ref(), &me, &other).await;
            let _ = reply.send(result);
        });
    }

    fn toggle_favourite(&mut self, conversation: ConversationId, reply: Reply<bool>) {
        if let Err(err) = self.me() {
            let _ = reply.send(Err(err));
            return;
        }
        let Some(record) = self.roster.record(&conversation) else {
            let _ = reply.send(Err(SyncError::not_found(format!(
                "conversation {conversation}"
            ))));
            return;
        };
        let next = !record.is_favourite;

        let store = Arc::clone(&self.store);
        self.writer.submit(async move {
            let result = store
                .update_document(
                    CONVERSATIONS,
                    conversation.as_str(),
                    Patch::new().set(fields::IS_FAVOURITE, next),
                )
                .await
                .map(|()| next)
                .map_err(SyncError::from);
            let _ = reply.send(result);
        });
    }

    fn hide_conversation(&mut self, conversation: ConversationId) -> SyncResult<()> {
        self.me()?;
        self.roster.hide(&conversation);
        info!(conversation_id = %conversation, "roster: conversation hidden");
        if self.active.as_ref() == Some(&conversation) {
            self.select_conversation(None)?;
        }
        self.emit(SessionEvent::RosterUpdated);
        self.publish();
        Ok(())
    }

    fn invalidate_profile(&mut self, user: UserId) -> SyncResult<()> {
        self.me()?;
        let seq = self.roster.profiles_mut().invalidate(&user);
        self.spawn_profile_fetch(user, seq);
        Ok(())
    }

    fn search_contacts(&mut self, needle: String, reply: Reply<Vec<ProfileRecord>>) {
        let me = match self.me() {
            Ok(me) => me,
            Err(err) => {
                let _ = reply.send(Err(err));
                return;
            }
        };
        let store = Arc::clone(&self.store);
        tokio::spawn(async move {
            let _ = reply.send(directory::search_contacts(store.as_ref(), &me, &needle).await);
        });
    }

    // ---- subscriptions ----

    fn handle_slot_message(&mut self, message: SlotMessage) {
        match message {
            SlotMessage::Established {
                kind,
                generation,
                result,
            } => match self.lifecycle.establish(kind, generation, result) {
                Establish::Live => {
                    self.emit_phase(kind);
                    self.publish();
                }
                Establish::Stale => {}
                Establish::Failed(err) => self.slot_failed(kind, err),
            },
            SlotMessage::Snapshot {
                kind,
                generation,
                event,
            } => {
                if !self.lifecycle.is_current(kind, generation) {
                    debug!(?kind, generation, "session: dropped stale snapshot");
                    return;
                }
                match event {
                    SnapshotEvent::Error(err) => {
                        self.lifecycle.fail(kind, generation);
                        self.slot_failed(kind, err);
                    }
                    event => match kind {
                        SlotKind::Roster => self.on_roster_snapshot(event),
                        SlotKind::Messages => self.on_messages_snapshot(event),
                        SlotKind::Typing => self.on_typing_snapshot(event),
                    },
                }
            }
        }
    }

    /// The slot's slice of session state degrades to empty; nothing retries.
    fn slot_failed(&mut self, kind: SlotKind, err: StoreError) {
        warn!(?kind, error = %err, "session: subscription failed");
        self.emit_phase(kind);
        self.emit(SessionEvent::SubscriptionFailed {
            kind,
            error: err.into(),
        });
        self.lifecycle.stop(kind);
        self.emit_phase(kind);

        match kind {
            SlotKind::Roster => {
                self.roster.clear();
                self.roster_loading = false;
                self.emit(SessionEvent::RosterUpdated);
            }
            SlotKind::Messages => {
                self.messages.reset(self.active.clone());
                self.emit(SessionEvent::MessagesUpdated);
            }
            SlotKind::Typing => {
                self.typing_ids.clear();
                self.emit(SessionEvent::TypingUpdated);
            }
        }
        self.publish();
    }

    fn on_roster_snapshot(&mut self, event: SnapshotEvent) {
        let Some(me) = self.identity.clone() else {
            return;
        };
        let SnapshotEvent::Query(documents) = event else {
            warn!("roster: unexpected snapshot shape");
            return;
        };
        let fetches = self.roster.apply_snapshot(&documents, &me);
        self.roster_loading = false;
        debug!(conversations = documents.len(), profile_reads = fetches.len(), "roster: snapshot applied");
        for (user, seq) in fetches {
            self.spawn_profile_fetch(user, seq);
        }

        if let Some(active) = self.active.clone() {
            if self
                .roster
                .record(&active)
                .is_some_and(|record| record.unread_count > 0)
            {
                self.queue_mark_conversation_read(active);
            }
        }

        self.emit(SessionEvent::RosterUpdated);
        self.publish();
    }

    fn on_messages_snapshot(&mut self, event: SnapshotEvent) {
        let Some(me) = self.identity.clone() else {
            return;
        };
        let Some(active) = self.active.clone() else {
            return;
        };
        let SnapshotEvent::Query(documents) = event else {
            warn!("messages: unexpected snapshot shape");
            return;
        };
        self.messages.apply_snapshot(&documents);
        debug!(conversation_id = %active, messages = self.messages.len(), "messages: snapshot applied");
        self.emit(SessionEvent::MessagesUpdated);
        self.publish();

        if self.messages.is_empty() {
            return;
        }
        if self
            .roster
            .record(&active)
            .map_or(true, |record| record.unread_count > 0)
        {
            self.queue_mark_conversation_read(active.clone());
        }
        let pending = self
            .receipts
            .pending(&active, self.messages.unread_for(&me));
        if !pending.is_empty() {
            self.queue_mark_messages_read(active, pending);
        }
    }

    fn on_typing_snapshot(&mut self, event: SnapshotEvent) {
        let Some(me) = self.identity.clone() else {
            return;
        };
        let SnapshotEvent::Document(document) = event else {
            warn!("typing: unexpected snapshot shape");
            return;
        };
        let typing_ids = match typing::typing_members(document.as_ref(), &me) {
            Ok(ids) => ids,
            Err(err) => {
                warn!(error = %err, "typing: malformed conversation record");
                Vec::new()
            }
        };
        if typing_ids != self.typing_ids {
            self.typing_ids = typing_ids;
            self.emit(SessionEvent::TypingUpdated);
            self.publish();
        }
    }

    // ---- background work ----

    fn handle_internal(&mut self, message: Internal) {
        match message {
            Internal::ProfileLoaded {
                epoch,
                user,
                seq,
                result,
            } => {
                if epoch != self.epoch {
                    debug!(user_id = %user, "roster: dropped profile read from previous identity");
                    return;
                }
                match result {
                    Ok(profile) => {
                        if self.roster.profiles_mut().complete(&user, seq, profile) {
                            self.emit(SessionEvent::RosterUpdated);
                            self.publish();
                        }
                    }
                    Err(err) => {
                        warn!(user_id = %user, error = %err, "roster: profile read failed");
                        self.roster.profiles_mut().fail(&user, seq);
                    }
                }
            }
            Internal::ReceiptsSettled {
                epoch,
                conversation,
                ids,
                outcome,
            } => {
                if epoch != self.epoch || self.active.as_ref() != Some(&conversation) {
                    debug!(conversation_id = %conversation, "receipts: dropped stale completion");
                    return;
                }
                self.receipts.settle(&conversation, &ids);
                if !outcome.failed.is_empty() {
                    warn!(
                        conversation_id = %conversation,
                        marked = outcome.marked.len(),
                        failed = outcome.failed.len(),
                        "receipts: some read receipts failed"
                    );
                }
            }
            Internal::TypingDeadline { token } => {
                let Some(me) = self.identity.clone() else {
                    return;
                };
                if let Some(write) = self.typing.on_deadline(token, Instant::now()) {
                    self.typing_timer = None;
                    self.queue_typing_write(me, write);
                }
            }
        }
    }

    fn spawn_profile_fetch(&self, user: UserId, seq: u64) {
        let store = Arc::clone(&self.store);
        let tx = self.internal_tx.clone();
        let epoch = self.epoch;
        tokio::spawn(async move {
            let result = store
                .get_document(USERS, user.as_str())
                .await
                .and_then(|document| {
                    document
                        .as_ref()
                        .map(ProfileRecord::from_document)
                        .transpose()
                });
            let _ = tx.send(Internal::ProfileLoaded {
                epoch,
                user,
                seq,
                result,
            });
        });
    }

    fn queue_mark_conversation_read(&self, conversation: ConversationId) {
        let store = Arc::clone(&self.store);
        self.writer.submit(async move {
            match receipts::mark_conversation_read(store.as_ref(), &conversation).await {
                Ok(()) => debug!(conversation_id = %conversation, "receipts: unread count reset"),
                Err(err) => warn!(conversation_id = %conversation, error = %err, "receipts: unread reset failed"),
            }
        });
    }

    fn queue_mark_messages_read(&self, conversation: ConversationId, ids: Vec<MessageId>) {
        let store = Arc::clone(&self.store);
        let tx = self.internal_tx.clone();
        let epoch = self.epoch;
        self.writer.submit(async move {
            let outcome = receipts::mark_messages_read(store.as_ref(), &conversation, &ids).await;
            let _ = tx.send(Internal::ReceiptsSettled {
                epoch,
                conversation,
                ids,
                outcome,
            });
        });
    }

    fn queue_typing_write(&self, me: UserId, write: TypingWrite) {
        let store = Arc::clone(&self.store);
        self.writer.submit(async move {
            if let Err(err) = typing::write_typing(store.as_ref(), &me, &write).await {
                warn!(user_id = %me, ?write, error = %err, "typing: signal write failed");
            }
        });
    }

    fn arm_typing_timer(&mut self, timer: TypingTimer) {
        self.cancel_typing_timer();
        let tx = self.internal_tx.clone();
        self.typing_timer = Some(tokio::spawn(async move {
            tokio::time::sleep_until(timer.deadline).await;
            let _ = tx.send(Internal::TypingDeadline { token: timer.token });
        }));
    }

    fn cancel_typing_timer(&mut self) {
        if let Some(timer) = self.typing_timer.take() {
            timer.abort();
        }
    }
}

/// Return the two-party conversation between `me` and `other`, creating it
/// when the store has none. Runs on the ordered writer.
async fn find_or_create_conversation(
    store: &dyn RemoteStore,
    me: &UserId,
    other: &UserId,
) -> SyncResult<ConversationId> {
    let candidates = store
        .query_documents(
            Query::collection(CONVERSATIONS).where_array_contains(fields::MEMBERS, me.as_str()),
        )
        .await?;
    for document in &candidates {
        match ConversationRecord::from_document(document) {
            Ok(record) if record.is_pair(me, other) => {
                debug!(conversation_id = %record.id, "roster: reusing existing conversation");
                return Ok(record.id);
            }
            Ok(_) => {}
            Err(err) => warn!(conversation_id = %document.id, error = %err, "roster: skipping malformed conversation"),
        }
    }

    let patch = Patch::new()
        .set(
            fields::MEMBERS,
            Value::from(vec![me.as_str(), other.as_str()]),
        )
        .server_timestamp(fields::CREATED_AT)
        .set(fields::LAST_MESSAGE_TEXT, "")
        .set(fields::LAST_MESSAGE_TIME, Value::Null)
        .set(fields::LAST_MESSAGE_SENDER_ID, Value::Null)
        .set(fields::UNREAD_COUNT, 0)
        .set(fields::IS_FAVOURITE, false);
    let id = ConversationId(store.add_document(CONVERSATIONS, patch).await?);
    info!(conversation_id = %id, other = %other, "roster: conversation created");
    Ok(id)
}

#[cfg(test)]
#[path = "tests/engine_tests.rs"]
mod tests;
