//! Conversation synchronization core for a real-time messaging client.
//!
//! A session follows the signed-in identity, keeps the conversation roster,
//! the active conversation's message log and its typing indicators in sync
//! with a document store, and performs the client-side writes (messages,
//! previews, receipts, typing signals) against that store.

pub mod config;
pub mod directory;
pub mod engine;
pub mod error;
pub mod lifecycle;
pub mod messages;
pub mod receipts;
pub mod roster;
pub mod session;
pub mod sqlite_store;
pub mod store;
pub mod typing;
pub mod writer;

pub use config::{load_settings, SyncSettings};
pub use engine::{spawn_session, SessionHandle};
pub use error::{BatchFailure, SyncError, SyncResult, ValidationError};
pub use messages::OutgoingMessage;
pub use session::{
    MessageView, RosterEntry, RosterFilter, SessionEvent, SessionState, SlotKind, SlotPhase,
};
pub use sqlite_store::SqliteRemoteStore;
pub use store::{RemoteStore, Subscription, SubscriptionHandle};

#[cfg(test)]
#[path = "tests/support.rs"]
mod test_support;
