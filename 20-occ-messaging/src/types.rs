//! Identifiers, messages, and requests shared by every layer of the engine.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::StoreError;

pub type UserId = u32;
pub type ChannelId = u32;
pub type MessageId = u32;
pub type Timestamp = u64;

/// Number of channels every user follows.
///
/// The store, handlers, and dispatcher are generic over this count so tests can
/// build smaller worlds, but every production path uses this value.
pub const CHANNELS_PER_USER: usize = 4;

/// Size of a message text buffer; stored text must be strictly shorter.
pub const MESSAGE_LENGTH: usize = 256;

/// Upper bound on messages returned per followed channel by a single fetch.
pub const MAX_RETURNED_MESSAGES: MessageId = 20;

/// Message payload with a bounded length.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct MessageText(String);

impl MessageText {
    pub fn new(text: impl Into<String>) -> Result<Self, StoreError> {
        let text = text.into();
        if text.len() >= MESSAGE_LENGTH {
            return Err(StoreError::TextTooLong {
                len: text.len(),
                max: MESSAGE_LENGTH - 1,
            });
        }
        Ok(Self(text))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageText {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A message committed to a channel log. Immutable once written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Message {
    pub channel_id: ChannelId,
    pub message_id: MessageId,
    pub author_id: UserId,
    pub timestamp: Timestamp,
    pub text: MessageText,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Post,
    Fetch,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Post => f.write_str("post"),
            Action::Fetch => f.write_str("fetch"),
        }
    }
}

/// One unit of workload. A post always targets one of the author's followed channels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Fetch {
        user_id: UserId,
    },
    Post {
        user_id: UserId,
        channel_id: ChannelId,
        text: MessageText,
    },
}

impl Request {
    pub fn action(&self) -> Action {
        match self {
            Request::Fetch { .. } => Action::Fetch,
            Request::Post { .. } => Action::Post,
        }
    }

    pub fn user_id(&self) -> UserId {
        match self {
            Request::Fetch { user_id } | Request::Post { user_id, .. } => *user_id,
        }
    }
}
