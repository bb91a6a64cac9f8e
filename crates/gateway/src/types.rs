use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{MessageId, UserId};

/// Another user the local user can hold a one-to-one conversation with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Peer {
    #[serde(rename = "_id")]
    pub id: UserId,
    #[serde(default)]
    pub full_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile_pic: Option<String>,
}

impl Peer {
    pub fn new(id: impl Into<UserId>, full_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            full_name: full_name.into(),
            email: None,
            profile_pic: None,
        }
    }
}

/// One message as materialized by the gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    #[serde(rename = "_id")]
    pub id: MessageId,
    pub sender_id: UserId,
    pub receiver_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<ReplySnapshot>,
}

impl Message {
    /// True when `user` is either participant.
    pub fn involves(&self, user: &UserId) -> bool {
        self.sender_id == *user || self.receiver_id == *user
    }

    /// True when the message was exchanged between exactly these two users, in either direction.
    pub fn is_between(&self, left: &UserId, right: &UserId) -> bool {
        (self.sender_id == *left && self.receiver_id == *right)
            || (self.sender_id == *right && self.receiver_id == *left)
    }

    pub fn reply_to_id(&self) -> Option<&MessageId> {
        self.reply_to.as_ref().map(|snapshot| &snapshot.message_id)
    }

    pub fn has_text(&self) -> bool {
        self.text
            .as_deref()
            .is_some_and(|text| !text.trim().is_empty())
    }

    pub fn has_image(&self) -> bool {
        self.image
            .as_deref()
            .is_some_and(|image| !image.trim().is_empty())
    }
}

/// Shallow copy of a replied-to message, taken when the reply is read.
///
/// The reference is weak: the target may have been deleted since, in which case only the id
/// survives and [`ReplySnapshot::preview`] reports [`ReplyPreview::Missing`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "ReplyWire", into = "ReplyWire")]
pub struct ReplySnapshot {
    pub message_id: MessageId,
    pub text: Option<String>,
    pub image: Option<String>,
}

impl ReplySnapshot {
    /// Reference without any denormalized content.
    pub fn unresolved(message_id: MessageId) -> Self {
        Self {
            message_id,
            text: None,
            image: None,
        }
    }

    pub fn of(message: &Message) -> Self {
        Self {
            message_id: message.id.clone(),
            text: message.text.clone(),
            image: message.image.clone(),
        }
    }

    pub fn preview(&self) -> ReplyPreview<'_> {
        if let Some(text) = self.text.as_deref()
            && !text.trim().is_empty()
        {
            return ReplyPreview::Text(text);
        }

        if self
            .image
            .as_deref()
            .is_some_and(|image| !image.trim().is_empty())
        {
            return ReplyPreview::Image;
        }

        ReplyPreview::Missing
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyPreview<'a> {
    Text(&'a str),
    Image,
    Missing,
}

// The backend sends `replyTo` either as a bare id or as a populated document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum ReplyWire {
    Id(MessageId),
    Populated {
        #[serde(rename = "_id")]
        id: MessageId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        text: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        image: Option<String>,
    },
}

impl From<ReplyWire> for ReplySnapshot {
    fn from(value: ReplyWire) -> Self {
        match value {
            ReplyWire::Id(message_id) => Self::unresolved(message_id),
            ReplyWire::Populated { id, text, image } => Self {
                message_id: id,
                text,
                image,
            },
        }
    }
}

impl From<ReplySnapshot> for ReplyWire {
    fn from(value: ReplySnapshot) -> Self {
        Self::Populated {
            id: value.message_id,
            text: value.text,
            image: value.image,
        }
    }
}

/// User-authored content before the gateway assigns an id and timestamp.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Draft {
    pub text: Option<String>,
    pub image: Option<String>,
}

impl Draft {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            image: None,
        }
    }

    pub fn image(image: impl Into<String>) -> Self {
        Self {
            text: None,
            image: Some(image.into()),
        }
    }

    pub fn with_image(mut self, image: impl Into<String>) -> Self {
        self.image = Some(image.into());
        self
    }

    /// Trims text and drops blank parts.
    pub fn normalized(self) -> Self {
        Self {
            text: self
                .text
                .map(|text| text.trim().to_string())
                .filter(|text| !text.is_empty()),
            image: self
                .image
                .map(|image| image.trim().to_string())
                .filter(|image| !image.is_empty()),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_none() && self.image.is_none()
    }
}

/// Body of `POST /messages/send/{peer}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    pub reply_to: Option<MessageId>,
}

impl SendRequest {
    pub fn new(draft: Draft, reply_to: Option<MessageId>) -> Self {
        Self {
            text: draft.text,
            image: draft.image,
            reply_to,
        }
    }
}

/// Notification delivered on the session-wide push channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload")]
pub enum PushEvent {
    #[serde(rename = "newMessage")]
    NewMessage(Message),
    /// Full snapshot of the users currently connected.
    #[serde(rename = "getOnlineUsers")]
    OnlineUsers(Vec<UserId>),
}
