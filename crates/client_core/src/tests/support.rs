//! Scripted in-memory store shared by the unit tests.

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use serde_json::{Map, Value};
use shared::{
    error::StoreError,
    protocol::{Document, FieldValue, Patch, Query, SnapshotEvent},
};
use tokio::sync::mpsc;

use crate::store::{RemoteStore, Subscription, SubscriptionHandle};

#[derive(Debug, Clone, PartialEq)]
pub enum Write {
    Add {
        collection: String,
        id: String,
        patch: Patch,
    },
    Update {
        collection: String,
        id: String,
        patch: Patch,
    },
    Delete {
        collection: String,
        id: String,
    },
}

impl Write {
    pub fn collection(&self) -> &str {
        match self {
            Write::Add { collection, .. }
            | Write::Update { collection, .. }
            | Write::Delete { collection, .. } => collection,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            Write::Add { id, .. } | Write::Update { id, .. } | Write::Delete { id, .. } => id,
        }
    }

    pub fn patch(&self) -> Option<&Patch> {
        match self {
            Write::Add { patch, .. } | Write::Update { patch, .. } => Some(patch),
            Write::Delete { .. } => None,
        }
    }
}

#[derive(Debug, Clone)]
enum Target {
    Query(Query),
    Document { collection: String, id: String },
}

impl Target {
    fn collection(&self) -> &str {
        match self {
            Target::Query(query) => &query.collection,
            Target::Document { collection, .. } => collection,
        }
    }
}

struct Live {
    target: Target,
    tx: mpsc::UnboundedSender<SnapshotEvent>,
}

#[derive(Default)]
struct Inner {
    /// collection -> documents in insertion order
    collections: HashMap<String, Vec<Document>>,
    live: HashMap<u64, Live>,
    next_handle: u64,
    next_id: u64,
    clock: i64,
    writes: Vec<Write>,
    failing_subscriptions: HashSet<String>,
    failing_writes: HashSet<String>,
    peak_message_logs: usize,
    /// field path -> how long a server-timestamp write to it stalls
    slow_timestamp_writes: HashMap<String, Duration>,
}

impl Inner {
    fn read(&self, target: &Target) -> SnapshotEvent {
        let documents = self
            .collections
            .get(target.collection())
            .cloned()
            .unwrap_or_default();
        match target {
            Target::Query(query) => SnapshotEvent::Query(query.apply(documents)),
            Target::Document { id, .. } => {
                SnapshotEvent::Document(documents.into_iter().find(|doc| &doc.id == id))
            }
        }
    }

    fn live_in(&self, collection: &str) -> usize {
        self.live
            .values()
            .filter(|live| live.target.collection() == collection)
            .count()
    }

    /// Store clock in epoch millis, strictly increasing.
    fn tick(&mut self) -> i64 {
        self.clock = (self.clock + 1).max(1_700_000_000_000);
        self.clock
    }
}

/// Keeps documents in memory and records every write. Subscriptions get the
/// current state on subscribe; later snapshots are only sent when a test
/// calls [`FakeStore::refresh`] or [`FakeStore::push`].
#[derive(Default, Clone)]
pub struct FakeStore {
    inner: Arc<Mutex<Inner>>,
}

impl FakeStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("fake store lock")
    }

    pub fn seed(&self, collection: &str, id: &str, value: Value) {
        let Value::Object(fields) = value else {
            panic!("seed documents must be objects");
        };
        let mut inner = self.lock();
        let documents = inner.collections.entry(collection.to_owned()).or_default();
        documents.retain(|doc| doc.id != id);
        documents.push(Document::new(id, fields));
    }

    pub fn document(&self, collection: &str, id: &str) -> Option<Document> {
        self.lock()
            .collections
            .get(collection)
            .and_then(|docs| docs.iter().find(|doc| doc.id == id).cloned())
    }

    pub fn documents(&self, collection: &str) -> Vec<Document> {
        self.lock()
            .collections
            .get(collection)
            .cloned()
            .unwrap_or_default()
    }

    /// Re-send current state to every live subscription on `collection`.
    pub fn refresh(&self, collection: &str) {
        let inner = self.lock();
        for live in inner.live.values() {
            if live.target.collection() == collection {
                let _ = live.tx.send(inner.read(&live.target));
            }
        }
    }

    pub fn push(&self, collection: &str, event: SnapshotEvent) {
        let inner = self.lock();
        for live in inner.live.values() {
            if live.target.collection() == collection {
                let _ = live.tx.send(event.clone());
            }
        }
    }

    pub fn live_subscriptions(&self, collection: &str) -> usize {
        self.lock().live_in(collection)
    }

    pub fn live_queries(&self, collection: &str) -> usize {
        self.lock()
            .live
            .values()
            .filter(|live| matches!(&live.target, Target::Query(q) if q.collection == collection))
            .count()
    }

    pub fn live_document_watches(&self, collection: &str, id: &str) -> usize {
        self.lock()
            .live
            .values()
            .filter(|live| {
                matches!(&live.target, Target::Document { collection: c, id: i } if c == collection && i == id)
            })
            .count()
    }

    /// Most message-log subscriptions ever live at once, across all
    /// conversations.
    pub fn peak_message_logs(&self) -> usize {
        self.lock().peak_message_logs
    }

    pub fn total_live(&self) -> usize {
        self.lock().live.len()
    }

    pub fn fail_subscriptions_to(&self, collection: &str) {
        self.lock().failing_subscriptions.insert(collection.to_owned());
    }

    pub fn fail_writes_to(&self, collection: &str) {
        self.lock().failing_writes.insert(collection.to_owned());
    }

    /// Stall every update that sets `path` to the server timestamp. The write
    /// is recorded and applied only once the stall ends, like a slow network.
    pub fn delay_server_timestamp_writes(&self, path: &str, delay: Duration) {
        self.lock()
            .slow_timestamp_writes
            .insert(path.to_owned(), delay);
    }

    pub fn writes(&self) -> Vec<Write> {
        self.lock().writes.clone()
    }

    /// Writes to one document that touch `field`.
    pub fn writes_touching(&self, collection: &str, id: &str, field: &str) -> Vec<Write> {
        self.writes()
            .into_iter()
            .filter(|write| write.collection() == collection && write.id() == id)
            .filter(|write| write.patch().is_some_and(|patch| patch.value_of(field).is_some()))
            .collect()
    }

    fn subscribe(&self, target: Target) -> Result<Subscription, StoreError> {
        let mut inner = self.lock();
        let collection = target.collection().to_owned();
        if inner.failing_subscriptions.contains(&collection) {
            return Err(StoreError::permission_denied(format!(
                "subscribe to {collection} denied"
            )));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(inner.read(&target));
        inner.next_handle += 1;
        let handle = inner.next_handle;
        inner.live.insert(handle, Live { target, tx });
        let message_logs = inner
            .live
            .values()
            .filter(|live| live.target.collection().ends_with("/messages"))
            .count();
        inner.peak_message_logs = inner.peak_message_logs.max(message_logs);
        Ok(Subscription {
            handle: SubscriptionHandle(handle),
            events: rx,
        })
    }

    fn check_write(&self, inner: &Inner, collection: &str) -> Result<(), StoreError> {
        if inner.failing_writes.contains(collection) {
            return Err(StoreError::unavailable(format!("writes to {collection} failing")));
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteStore for FakeStore {
    async fn subscribe_query(&self, query: Query) -> Result<Subscription, StoreError> {
        self.subscribe(Target::Query(query))
    }

    async fn subscribe_document(
        &self,
        collection: &str,
        document_id: &str,
    ) -> Result<Subscription, StoreError> {
        self.subscribe(Target::Document {
            collection: collection.to_owned(),
            id: document_id.to_owned(),
        })
    }

    fn unsubscribe(&self, handle: SubscriptionHandle) {
        self.lock().live.remove(&handle.0);
    }

    async fn get_document(
        &self,
        collection: &str,
        document_id: &str,
    ) -> Result<Option<Document>, StoreError> {
        Ok(self.document(collection, document_id))
    }

    async fn query_documents(&self, query: Query) -> Result<Vec<Document>, StoreError> {
        let documents = self.documents(&query.collection);
        Ok(query.apply(documents))
    }

    async fn add_document(&self, collection: &str, patch: Patch) -> Result<String, StoreError> {
        let mut inner = self.lock();
        inner.next_id += 1;
        let id = format!("doc{}", inner.next_id);
        inner.writes.push(Write::Add {
            collection: collection.to_owned(),
            id: id.clone(),
            patch: patch.clone(),
        });
        self.check_write(&inner, collection)?;
        let now = inner.tick();
        let mut fields = Map::new();
        storage::apply_patch(&mut fields, &patch, now);
        inner
            .collections
            .entry(collection.to_owned())
            .or_default()
            .push(Document::new(id.clone(), fields));
        Ok(id)
    }

    async fn update_document(
        &self,
        collection: &str,
        document_id: &str,
        patch: Patch,
    ) -> Result<(), StoreError> {
        let stall = {
            let inner = self.lock();
            inner
                .slow_timestamp_writes
                .iter()
                .filter(|(path, _)| patch.value_of(path) == Some(&FieldValue::ServerTimestamp))
                .map(|(_, delay)| *delay)
                .max()
        };
        if let Some(delay) = stall {
            tokio::time::sleep(delay).await;
        }
        let mut inner = self.lock();
        inner.writes.push(Write::Update {
            collection: collection.to_owned(),
            id: document_id.to_owned(),
            patch: patch.clone(),
        });
        self.check_write(&inner, collection)?;
        let now = inner.tick();
        let document = inner
            .collections
            .get_mut(collection)
            .and_then(|docs| docs.iter_mut().find(|doc| doc.id == document_id))
            .ok_or_else(|| StoreError::not_found(format!("{collection}/{document_id}")))?;
        storage::apply_patch(&mut document.fields, &patch, now);
        Ok(())
    }

    async fn delete_document(
        &self,
        collection: &str,
        document_id: &str,
    ) -> Result<(), StoreError> {
        let mut inner = self.lock();
        inner.writes.push(Write::Delete {
            collection: collection.to_owned(),
            id: document_id.to_owned(),
        });
        self.check_write(&inner, collection)?;
        let documents = inner.collections.entry(collection.to_owned()).or_default();
        let before = documents.len();
        documents.retain(|doc| doc.id != document_id);
        if documents.len() == before {
            return Err(StoreError::not_found(format!("{collection}/{document_id}")));
        }
        Ok(())
    }
}

/// Poll `check` until it holds or two seconds pass.
pub async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}
