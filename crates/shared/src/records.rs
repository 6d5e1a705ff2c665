//! Typed views over the documents kept in the remote store.
//!
//! Every optional field has one canonical absence: `None` (or the type's
//! default where noted). A stored `null` and a missing key decode the same.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use crate::{
    domain::{ConversationId, MessageId, MessageStatus, UserId},
    error::StoreError,
    protocol::Document,
};

pub mod fields {
    pub const MEMBERS: &str = "members";
    pub const CREATED_AT: &str = "createdAt";
    pub const LAST_MESSAGE_TEXT: &str = "lastMessage";
    pub const LAST_MESSAGE_TIME: &str = "lastMessageTime";
    pub const LAST_MESSAGE_SENDER_ID: &str = "lastMessageSenderId";
    pub const UNREAD_COUNT: &str = "unreadCount";
    pub const IS_FAVOURITE: &str = "isFavourite";
    pub const TYPING: &str = "typing";

    pub const SENDER_ID: &str = "senderId";
    pub const TEXT: &str = "text";
    pub const STATUS: &str = "status";
    pub const IMAGE_URL: &str = "imageURL";
    pub const FILE_URL: &str = "fileURL";
    pub const FILE_NAME: &str = "fileName";
    pub const FILE_TYPE: &str = "fileType";
    pub const VOICE_DURATION: &str = "voiceDuration";

    pub const DISPLAY_NAME: &str = "displayName";
    pub const FULL_NAME: &str = "fullName";
    pub const USERNAME: &str = "username";
    pub const EMAIL: &str = "email";
    pub const PHOTO_URL: &str = "photoURL";
    pub const IS_ONLINE: &str = "isOnline";
    pub const PRESENCE_STATUS: &str = "status";
    pub const LAST_SEEN: &str = "lastSeenTimestamp";

    /// Path of one member's typing signal inside a conversation record.
    pub fn typing_of(user_id: &crate::domain::UserId) -> String {
        format!("{TYPING}.{}", user_id.0)
    }
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

pub fn millis_to_datetime(millis: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp_millis(millis)
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationRecord {
    #[serde(skip)]
    pub id: ConversationId,
    #[serde(default, deserialize_with = "null_as_default")]
    pub members: Vec<UserId>,
    /// Empty when nothing has been sent yet.
    #[serde(
        default,
        rename = "lastMessage",
        deserialize_with = "null_as_default"
    )]
    pub last_message_text: String,
    /// Store clock, epoch millis.
    #[serde(default)]
    pub last_message_time: Option<i64>,
    #[serde(default)]
    pub last_message_sender_id: Option<UserId>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub unread_count: u32,
    #[serde(default, deserialize_with = "null_as_default")]
    pub is_favourite: bool,
    /// Member -> time of their last typing signal. A `null` value and a
    /// missing key both mean "not typing"; writers always delete the key.
    #[serde(default, deserialize_with = "null_as_default")]
    pub typing: BTreeMap<UserId, Option<i64>>,
}

impl ConversationRecord {
    pub fn from_document(doc: &Document) -> Result<Self, StoreError> {
        let mut record: Self = doc.decode()?;
        record.id = ConversationId(doc.id.clone());
        Ok(record)
    }

    pub fn last_message_at(&self) -> Option<DateTime<Utc>> {
        self.last_message_time.and_then(millis_to_datetime)
    }

    pub fn has_member(&self, user_id: &UserId) -> bool {
        self.members.contains(user_id)
    }

    pub fn other_members<'a>(&'a self, me: &'a UserId) -> impl Iterator<Item = &'a UserId> + 'a {
        self.members.iter().filter(move |member| *member != me)
    }

    /// True for the single two-party conversation between `a` and `b`.
    pub fn is_pair(&self, a: &UserId, b: &UserId) -> bool {
        self.members.len() == 2 && self.has_member(a) && self.has_member(b)
    }

    /// Members with a present typing signal, excluding `me`, in key order.
    pub fn typing_members(&self, me: &UserId) -> Vec<UserId> {
        self.typing
            .iter()
            .filter(|(member, signal)| *member != me && signal.is_some())
            .map(|(member, _)| member.clone())
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Attachment {
    Image {
        url: String,
    },
    File {
        url: String,
        name: String,
        mime_type: Option<String>,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRecord {
    #[serde(skip)]
    pub id: MessageId,
    #[serde(default, deserialize_with = "null_as_default")]
    pub sender_id: UserId,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default, rename = "imageURL")]
    pub image_url: Option<String>,
    #[serde(default, rename = "fileURL")]
    pub file_url: Option<String>,
    #[serde(default)]
    pub file_name: Option<String>,
    #[serde(default)]
    pub file_type: Option<String>,
    #[serde(default, alias = "duration")]
    pub voice_duration: Option<u32>,
    /// Store clock, epoch millis. `None` only for a write the store has not
    /// stamped yet.
    #[serde(default)]
    pub created_at: Option<i64>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub status: MessageStatus,
}

impl MessageRecord {
    pub fn from_document(doc: &Document) -> Result<Self, StoreError> {
        let mut record: Self = doc.decode()?;
        record.id = MessageId(doc.id.clone());
        Ok(record)
    }

    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        self.created_at.and_then(millis_to_datetime)
    }

    pub fn attachment(&self) -> Option<Attachment> {
        if let Some(url) = &self.image_url {
            return Some(Attachment::Image { url: url.clone() });
        }
        self.file_url.as_ref().map(|url| Attachment::File {
            url: url.clone(),
            name: self.file_name.clone().unwrap_or_default(),
            mime_type: self.file_type.clone(),
        })
    }

    pub fn is_read(&self) -> bool {
        self.status == MessageStatus::Read
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileRecord {
    #[serde(skip)]
    pub id: UserId,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub full_name: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default, rename = "photoURL")]
    pub photo_url: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub is_online: bool,
}

impl ProfileRecord {
    pub fn from_document(doc: &Document) -> Result<Self, StoreError> {
        let mut record: Self = doc.decode()?;
        record.id = UserId(doc.id.clone());
        Ok(record)
    }

    /// First non-blank of display name, full name, username, email.
    pub fn best_name(&self) -> Option<&str> {
        [
            &self.display_name,
            &self.full_name,
            &self.username,
            &self.email,
        ]
        .into_iter()
        .filter_map(|value| value.as_deref())
        .map(str::trim)
        .find(|value| !value.is_empty())
    }
}
