use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex, PoisonError,
    },
};

use async_trait::async_trait;
use shared::{
    error::StoreError,
    protocol::{Document, Patch, Query, SnapshotEvent},
};
use storage::Storage;
use tokio::{
    sync::{broadcast::error::RecvError, mpsc},
    task::JoinHandle,
};
use tracing::{debug, warn};

use crate::store::{RemoteStore, Subscription, SubscriptionHandle};

/// [`RemoteStore`] backed by the local sqlite document store.
pub struct SqliteRemoteStore {
    storage: Storage,
    next_handle: AtomicU64,
    watchers: Mutex<HashMap<SubscriptionHandle, JoinHandle<()>>>,
}

enum WatchTarget {
    Query(Query),
    Document { collection: String, id: String },
}

impl WatchTarget {
    fn collection(&self) -> &str {
        match self {
            WatchTarget::Query(query) => &query.collection,
            WatchTarget::Document { collection, .. } => collection,
        }
    }

    async fn read(&self, storage: &Storage) -> Result<SnapshotEvent, StoreError> {
        match self {
            WatchTarget::Query(query) => storage
                .query_documents(query)
                .await
                .map(SnapshotEvent::Query)
                .map_err(unavailable),
            WatchTarget::Document { collection, id } => storage
                .get_document(collection, id)
                .await
                .map(SnapshotEvent::Document)
                .map_err(unavailable),
        }
    }
}

fn unavailable(err: anyhow::Error) -> StoreError {
    StoreError::unavailable(format!("{err:#}"))
}

impl SqliteRemoteStore {
    pub fn new(storage: Storage) -> Self {
        Self {
            storage,
            next_handle: AtomicU64::new(1),
            watchers: Mutex::new(HashMap::new()),
        }
    }

    pub async fn open(database_url: &str) -> anyhow::Result<Self> {
        Ok(Self::new(Storage::new(database_url).await?))
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    /// Number of subscriptions that have not been unsubscribed.
    pub fn live_subscriptions(&self) -> usize {
        self.watchers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    async fn watch(&self, target: WatchTarget) -> Result<Subscription, StoreError> {
        // Subscribe to the feed before the first read so no write slips between.
        let mut changes = self.storage.subscribe_changes();
        let initial = target.read(&self.storage).await?;

        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(initial.clone());

        let storage = self.storage.clone();
        let handle = SubscriptionHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        let task = tokio::spawn(async move {
            let mut last = initial;
            loop {
                tokio::select! {
                    _ = tx.closed() => break,
                    change = changes.recv() => match change {
                        Ok(notice) if notice.collection != target.collection() => continue,
                        Ok(_) => {}
                        Err(RecvError::Lagged(skipped)) => {
                            debug!(handle = handle.0, skipped, "store: change feed lagged, re-reading");
                        }
                        Err(RecvError::Closed) => break,
                    },
                }

                let next = match target.read(&storage).await {
                    Ok(next) => next,
                    Err(err) => {
                        warn!(handle = handle.0, error = %err, "store: watcher read failed");
                        let _ = tx.send(SnapshotEvent::Error(err));
                        break;
                    }
                };
                if next != last {
                    last = next.clone();
                    if tx.send(next).is_err() {
                        break;
                    }
                }
            }
        });

        self.watchers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(handle, task);
        Ok(Subscription { handle, events: rx })
    }
}

impl Drop for SqliteRemoteStore {
    fn drop(&mut self) {
        let watchers = self.watchers.get_mut().unwrap_or_else(PoisonError::into_inner);
        for (_, task) in watchers.drain() {
            task.abort();
        }
    }
}

#[async_trait]
impl RemoteStore for SqliteRemoteStore {
    async fn subscribe_query(&self, query: Query) -> Result<Subscription, StoreError> {
        self.watch(WatchTarget::Query(query)).await
    }

    async fn subscribe_document(
        &self,
        collection: &str,
        document_id: &str,
    ) -> Result<Subscription, StoreError> {
        self.watch(WatchTarget::Document {
            collection: collection.to_owned(),
            id: document_id.to_owned(),
        })
        .await
    }

    fn unsubscribe(&self, handle: SubscriptionHandle) {
        let task = self
            .watchers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&handle);
        if let Some(task) = task {
            task.abort();
        }
    }

    async fn get_document(
        &self,
        collection: &str,
        document_id: &str,
    ) -> Result<Option<Document>, StoreError> {
        self.storage
            .get_document(collection, document_id)
            .await
            .map_err(unavailable)
    }

    async fn query_documents(&self, query: Query) -> Result<Vec<Document>, StoreError> {
        self.storage
            .query_documents(&query)
            .await
            .map_err(unavailable)
    }

    async fn add_document(&self, collection: &str, patch: Patch) -> Result<String, StoreError> {
        self.storage
            .add_document(collection, &patch)
            .await
            .map_err(unavailable)
    }

    async fn update_document(
        &self,
        collection: &str,
        document_id: &str,
        patch: Patch,
    ) -> Result<(), StoreError> {
        let updated = self
            .storage
            .update_document(collection, document_id, &patch)
            .await
            .map_err(unavailable)?;
        if updated {
            Ok(())
        } else {
            Err(StoreError::not_found(format!("{collection}/{document_id}")))
        }
    }

    async fn delete_document(
        &self,
        collection: &str,
        document_id: &str,
    ) -> Result<(), StoreError> {
        let deleted = self
            .storage
            .delete_document(collection, document_id)
            .await
            .map_err(unavailable)?;
        if deleted {
            Ok(())
        } else {
            Err(StoreError::not_found(format!("{collection}/{document_id}")))
        }
    }
}
