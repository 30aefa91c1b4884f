use thiserror::Error;

use crate::types::{ChannelId, MessageId, UserId};

/// Failures surfaced by the shard store and the handlers built on it.
///
/// OCC staleness is not an error; it is reported through
/// [`Outcome`](crate::protocol::Outcome). These variants mean a caller broke a
/// precondition, so nothing was mutated.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("user {user_id} does not exist (user count {user_count})")]
    UnknownUser { user_id: UserId, user_count: u32 },

    #[error("channel {channel_id} does not exist (channel count {channel_count})")]
    UnknownChannel {
        channel_id: ChannelId,
        channel_count: u32,
    },

    #[error("user {user_id} does not follow channel {channel_id}")]
    NotFollowed {
        user_id: UserId,
        channel_id: ChannelId,
    },

    #[error("channel {channel_id} log is full ({capacity} messages)")]
    CapacityExhausted {
        channel_id: ChannelId,
        capacity: MessageId,
    },

    #[error("message slot ({channel_id}, {message_id}) is already written")]
    SlotOccupied {
        channel_id: ChannelId,
        message_id: MessageId,
    },

    #[error("message slot ({channel_id}, {message_id}) has not been written")]
    MissingMessage {
        channel_id: ChannelId,
        message_id: MessageId,
    },

    #[error("range [{from}, {to}) is outside channel {channel_id} (next message {next_message_id})")]
    RangeOutOfBounds {
        channel_id: ChannelId,
        from: MessageId,
        to: MessageId,
        next_message_id: MessageId,
    },

    #[error("cursor for channel {channel_id} cannot move from {current} to {requested}")]
    CursorOutOfRange {
        channel_id: ChannelId,
        current: MessageId,
        requested: MessageId,
    },

    #[error("message text is {len} bytes, at most {max} allowed")]
    TextTooLong { len: usize, max: usize },

    #[error("invalid store shape: {0}")]
    InvalidShape(String),

    #[error("store invariant violated: {0}")]
    InvariantViolation(String),
}
