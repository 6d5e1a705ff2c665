//! Profile directory: contact search and presence writes.

use shared::{
    domain::UserId,
    protocol::{Document, Patch, Query, USERS},
    records::{fields, ProfileRecord},
};
use tracing::{debug, warn};

use crate::{
    error::{SyncError, SyncResult},
    store::RemoteStore,
};

/// Profiles matching `needle` on any of their name fields or email,
/// excluding `me` and profiles without a usable name.
pub fn filter_contacts(documents: &[Document], me: &UserId, needle: &str) -> Vec<ProfileRecord> {
    let needle = needle.trim().to_lowercase();
    let mut matches: Vec<ProfileRecord> = documents
        .iter()
        .filter(|doc| doc.id != me.as_str())
        .filter_map(|doc| ProfileRecord::from_document(doc).ok())
        .filter(|profile| profile.best_name().is_some())
        .filter(|profile| needle.is_empty() || profile_matches(profile, &needle))
        .collect();
    matches.sort_by_cached_key(|profile| {
        profile
            .best_name()
            .map(str::to_lowercase)
            .unwrap_or_default()
    });
    matches
}

fn profile_matches(profile: &ProfileRecord, needle: &str) -> bool {
    [
        &profile.display_name,
        &profile.full_name,
        &profile.username,
        &profile.email,
    ]
    .into_iter()
    .filter_map(|value| value.as_deref())
    .any(|value| value.to_lowercase().contains(needle))
}

pub async fn search_contacts(
    store: &dyn RemoteStore,
    me: &UserId,
    needle: &str,
) -> SyncResult<Vec<ProfileRecord>> {
    let documents = store
        .query_documents(Query::collection(USERS))
        .await
        .map_err(SyncError::from)?;
    Ok(filter_contacts(&documents, me, needle))
}

pub fn presence_patch(online: bool) -> Patch {
    Patch::new()
        .set(fields::IS_ONLINE, online)
        .set(fields::PRESENCE_STATUS, if online { "online" } else { "offline" })
        .server_timestamp(fields::LAST_SEEN)
}

/// Best effort: failures are logged and swallowed.
pub async fn publish_presence(store: &dyn RemoteStore, me: &UserId, online: bool) {
    match store
        .update_document(USERS, me.as_str(), presence_patch(online))
        .await
    {
        Ok(()) => debug!(user_id = %me, online, "presence: published"),
        Err(err) => warn!(user_id = %me, online, error = %err, "presence: update failed"),
    }
}
