use async_trait::async_trait;
use shared::{
    error::StoreError,
    protocol::{Document, Patch, Query, SnapshotEvent},
};
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionHandle(pub u64);

/// A live subscription. Snapshots arrive on `events` in the order the store
/// produced them; the first one is the current state at subscribe time.
#[derive(Debug)]
pub struct Subscription {
    pub handle: SubscriptionHandle,
    pub events: mpsc::UnboundedReceiver<SnapshotEvent>,
}

/// The document store the session synchronizes against.
///
/// Timestamps written through [`Patch::server_timestamp`] are assigned by the
/// store, never by the caller's clock.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn subscribe_query(&self, query: Query) -> Result<Subscription, StoreError>;

    async fn subscribe_document(
        &self,
        collection: &str,
        document_id: &str,
    ) -> Result<Subscription, StoreError>;

    /// Stops delivery immediately. Unknown handles are ignored.
    fn unsubscribe(&self, handle: SubscriptionHandle);

    async fn get_document(
        &self,
        collection: &str,
        document_id: &str,
    ) -> Result<Option<Document>, StoreError>;

    async fn query_documents(&self, query: Query) -> Result<Vec<Document>, StoreError>;

    async fn add_document(&self, collection: &str, patch: Patch) -> Result<String, StoreError>;

    /// Fails with a `NotFound` code when the document does not exist.
    async fn update_document(
        &self,
        collection: &str,
        document_id: &str,
        patch: Patch,
    ) -> Result<(), StoreError>;

    /// Fails with a `NotFound` code when the document does not exist.
    async fn delete_document(&self, collection: &str, document_id: &str)
        -> Result<(), StoreError>;
}
