use futures::future::join_all;
use shared::{
    domain::{ConversationId, DisplayType, MessageId, MessageStatus, UserId},
    protocol::{messages_collection, Document, Patch, CONVERSATIONS},
    records::{fields, Attachment, MessageRecord},
};
use tracing::{info, warn};

use crate::{
    error::{SyncError, SyncResult},
    session::MessageView,
    store::RemoteStore,
};

/// Messages of the active conversation, in the order the store delivered
/// them. Nothing here re-sorts.
#[derive(Debug, Default)]
pub struct MessageStream {
    conversation: Option<ConversationId>,
    messages: Vec<MessageRecord>,
}

impl MessageStream {
    pub fn reset(&mut self, conversation: Option<ConversationId>) {
        self.conversation = conversation;
        self.messages.clear();
    }

    pub fn conversation(&self) -> Option<&ConversationId> {
        self.conversation.as_ref()
    }

    pub fn apply_snapshot(&mut self, documents: &[Document]) {
        self.messages = documents
            .iter()
            .filter_map(|doc| match MessageRecord::from_document(doc) {
                Ok(record) => Some(record),
                Err(err) => {
                    warn!(message_id = %doc.id, error = %err, "messages: skipping malformed message");
                    None
                }
            })
            .collect();
    }

    pub fn views(&self, me: &UserId) -> Vec<MessageView> {
        self.messages
            .iter()
            .map(|record| MessageView {
                display_type: DisplayType::for_sender(&record.sender_id, me),
                record: record.clone(),
            })
            .collect()
    }

    /// Received messages not yet marked read.
    pub fn unread_for(&self, me: &UserId) -> Vec<MessageId> {
        self.messages
            .iter()
            .filter(|record| &record.sender_id != me && !record.is_read())
            .map(|record| record.id.clone())
            .collect()
    }

    pub fn find(&self, id: &MessageId) -> Option<&MessageRecord> {
        self.messages.iter().find(|record| &record.id == id)
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Split a delete request into ids to delete remotely, ids not present
    /// locally and ids owned by someone else.
    pub fn plan_deletion(&self, me: &UserId, ids: &[MessageId]) -> DeletionPlan {
        let mut plan = DeletionPlan::default();
        for id in ids {
            match self.find(id) {
                None => plan.missing.push(id.clone()),
                Some(record) if &record.sender_id != me => plan.forbidden.push(id.clone()),
                Some(_) => plan.remote.push(id.clone()),
            }
        }
        plan
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DeletionPlan {
    pub remote: Vec<MessageId>,
    pub missing: Vec<MessageId>,
    pub forbidden: Vec<MessageId>,
}

/// A composed message. Attachments are references to blobs uploaded
/// elsewhere.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutgoingMessage {
    pub text: Option<String>,
    pub attachment: Option<Attachment>,
    pub voice_duration: Option<u32>,
}

impl OutgoingMessage {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Self::default()
        }
    }

    pub fn with_attachment(mut self, attachment: Attachment) -> Self {
        self.attachment = Some(attachment);
        self
    }

    pub fn with_voice_duration(mut self, seconds: u32) -> Self {
        self.voice_duration = Some(seconds);
        self
    }

    fn trimmed_text(&self) -> Option<&str> {
        self.text
            .as_deref()
            .map(str::trim)
            .filter(|text| !text.is_empty())
    }

    pub fn is_empty(&self) -> bool {
        self.trimmed_text().is_none() && self.attachment.is_none() && self.voice_duration.is_none()
    }

    /// Text for the conversation's last-message preview.
    pub fn preview_text(&self) -> String {
        if let Some(text) = self.trimmed_text() {
            return text.to_owned();
        }
        if let Some(seconds) = self.voice_duration {
            return format!("Voice message ({seconds}s)");
        }
        match &self.attachment {
            Some(Attachment::Image { .. }) => "Photo".to_owned(),
            Some(Attachment::File { name, .. }) => format!("File: {name}"),
            None => String::new(),
        }
    }

    pub fn to_patch(&self, sender: &UserId) -> Patch {
        let mut patch = Patch::new()
            .set(fields::SENDER_ID, sender.as_str())
            .set(fields::STATUS, MessageStatus::Sent.as_str())
            .server_timestamp(fields::CREATED_AT);
        if let Some(text) = self.trimmed_text() {
            patch = patch.set(fields::TEXT, text);
        }
        match &self.attachment {
            Some(Attachment::Image { url }) => {
                patch = patch.set(fields::IMAGE_URL, url.as_str());
            }
            Some(Attachment::File {
                url,
                name,
                mime_type,
            }) => {
                patch = patch
                    .set(fields::FILE_URL, url.as_str())
                    .set(fields::FILE_NAME, name.as_str());
                if let Some(mime_type) = mime_type {
                    patch = patch.set(fields::FILE_TYPE, mime_type.as_str());
                }
            }
            None => {}
        }
        if let Some(seconds) = self.voice_duration {
            patch = patch.set(fields::VOICE_DURATION, seconds);
        }
        patch
    }
}

/// Append the message, then refresh the conversation preview. The two writes
/// are independent; a failed preview update does not undo the append.
pub async fn send_message(
    store: &dyn RemoteStore,
    conversation: &ConversationId,
    sender: &UserId,
    message: &OutgoingMessage,
) -> SyncResult<MessageId> {
    let id = store
        .add_document(&messages_collection(conversation), message.to_patch(sender))
        .await?;
    let message_id = MessageId(id);

    let preview = Patch::new()
        .set(fields::LAST_MESSAGE_TEXT, message.preview_text())
        .server_timestamp(fields::LAST_MESSAGE_TIME)
        .set(fields::LAST_MESSAGE_SENDER_ID, sender.as_str());
    if let Err(err) = store
        .update_document(CONVERSATIONS, conversation.as_str(), preview)
        .await
    {
        warn!(
            conversation_id = %conversation,
            message_id = %message_id,
            error = %err,
            "messages: preview update failed after append"
        );
    }

    info!(conversation_id = %conversation, message_id = %message_id, "messages: sent");
    Ok(message_id)
}

/// Delete every id in parallel. Each result is reported individually.
pub async fn delete_messages(
    store: &dyn RemoteStore,
    conversation: &ConversationId,
    ids: &[MessageId],
) -> Vec<(MessageId, SyncResult<()>)> {
    let collection = messages_collection(conversation);
    let deletes = ids.iter().map(|id| {
        let collection = collection.as_str();
        async move {
            let result = store
                .delete_document(collection, id.as_str())
                .await
                .map_err(SyncError::from);
            (id.clone(), result)
        }
    });
    join_all(deletes).await
}
