use std::fmt;

use serde::{Deserialize, Serialize};

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(
            Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_owned())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

id_newtype!(UserId);
id_newtype!(ConversationId);
id_newtype!(MessageId);

/// Delivery status stored on a message record. Only ever advances.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    #[default]
    Sent,
    Delivered,
    Read,
}

impl MessageStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageStatus::Sent => "sent",
            MessageStatus::Delivered => "delivered",
            MessageStatus::Read => "read",
        }
    }
}

/// View-relative direction of a message. Never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisplayType {
    Sent,
    Received,
}

impl DisplayType {
    pub fn for_sender(sender_id: &UserId, me: &UserId) -> Self {
        if sender_id == me {
            DisplayType::Sent
        } else {
            DisplayType::Received
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_type_is_relative_to_viewer() {
        let alice = UserId::from("alice");
        let bob = UserId::from("bob");
        assert_eq!(DisplayType::for_sender(&alice, &alice), DisplayType::Sent);
        assert_eq!(DisplayType::for_sender(&alice, &bob), DisplayType::Received);
    }

    #[test]
    fn status_serializes_lowercase() {
        let raw = serde_json::to_string(&MessageStatus::Delivered).expect("serialize");
        assert_eq!(raw, "\"delivered\"");
        let parsed: MessageStatus = serde_json::from_str("\"read\"").expect("parse");
        assert_eq!(parsed, MessageStatus::Read);
        assert!(MessageStatus::Sent < MessageStatus::Read);
    }
}
