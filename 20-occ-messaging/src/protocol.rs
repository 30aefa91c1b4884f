//! Prepare/execute handlers for FETCH and POST.
//!
//! Every request runs as two tasks. The prepare task only snapshots counters;
//! the execute task re-checks the snapshot against the shard it owns and
//! commits only if nothing moved in between. A stale snapshot aborts with no
//! mutation, so handlers never need locks beyond the single shard they commit
//! to.

use serde::Serialize;
use tracing::trace;

use crate::error::StoreError;
use crate::store::ShardStore;
use crate::types::{
    ChannelId, MAX_RETURNED_MESSAGES, Message, MessageId, MessageText, Timestamp, UserId,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ShardKey {
    User(UserId),
    Channel(ChannelId),
    Slot {
        channel_id: ChannelId,
        message_id: MessageId,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessMode {
    ReadOnly,
    Exclusive,
}

/// A shard a task touches and how.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct ShardAccess {
    pub key: ShardKey,
    pub mode: AccessMode,
}

impl ShardAccess {
    fn read(key: ShardKey) -> Self {
        Self {
            key,
            mode: AccessMode::ReadOnly,
        }
    }

    fn exclusive(key: ShardKey) -> Self {
        Self {
            key,
            mode: AccessMode::Exclusive,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AbortReason {
    /// Another request committed to the shard after this one prepared.
    Stale,
    /// The channel log has no free slot left.
    CapacityExhausted,
    /// The task failed outright (bad input or a panicked worker).
    Fault,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum Outcome {
    Committed,
    Aborted(AbortReason),
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Committed)
    }
}

/// Lifecycle of a single request as it moves through the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestPhase {
    Created,
    Preparing,
    PrepareReady,
    Executing,
    Committed,
    Aborted,
}

impl RequestPhase {
    pub fn settled(outcome: Outcome) -> Self {
        match outcome {
            Outcome::Committed => RequestPhase::Committed,
            Outcome::Aborted(_) => RequestPhase::Aborted,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, RequestPhase::Committed | RequestPhase::Aborted)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrepareFetchResponse<const C: usize> {
    pub read_cursors: [MessageId; C],
    pub write_cursors: [MessageId; C],
}

/// Shards read by [`prepare_fetch`].
pub fn prepare_fetch_shards<const C: usize>(
    user_id: UserId,
    followed_channels: &[ChannelId; C],
) -> Vec<ShardAccess> {
    std::iter::once(ShardAccess::read(ShardKey::User(user_id)))
        .chain(
            followed_channels
                .iter()
                .map(|&channel_id| ShardAccess::read(ShardKey::Channel(channel_id))),
        )
        .collect()
}

/// Snapshots the user's read cursors and the write cursor of every followed channel.
///
/// The snapshots come from different shards and are not taken atomically.
pub fn prepare_fetch<const C: usize>(
    store: &ShardStore<C>,
    user_id: UserId,
) -> Result<PrepareFetchResponse<C>, StoreError> {
    let followed = store.followed_channels(user_id)?;
    let read_cursors = store.read_user_cursor(user_id)?;
    let mut write_cursors = [0; C];
    for (cursor, &channel_id) in write_cursors.iter_mut().zip(followed.iter()) {
        *cursor = store.read_channel_cursor(channel_id)?;
    }
    trace!(user_id, ?read_cursors, ?write_cursors, "fetch prepared");
    Ok(PrepareFetchResponse {
        read_cursors,
        write_cursors,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecuteFetchData<const C: usize> {
    pub user_id: UserId,
    pub followed_channels: [ChannelId; C],
    pub read_cursors: [MessageId; C],
    pub write_cursors: [MessageId; C],
}

impl<const C: usize> ExecuteFetchData<C> {
    pub fn new(
        user_id: UserId,
        followed_channels: [ChannelId; C],
        prepared: PrepareFetchResponse<C>,
    ) -> Self {
        Self {
            user_id,
            followed_channels,
            read_cursors: prepared.read_cursors,
            write_cursors: prepared.write_cursors,
        }
    }

    /// Cursor each slot moves to on commit.
    pub fn upper_bounds(&self) -> [MessageId; C] {
        let mut upper = [0; C];
        for (i, bound) in upper.iter_mut().enumerate() {
            let from = self.read_cursors[i];
            *bound = self.write_cursors[i]
                .min(from.saturating_add(MAX_RETURNED_MESSAGES))
                .max(from);
        }
        upper
    }

    /// The user shard exclusively, plus every message slot the fetch returns.
    pub fn shards(&self) -> Vec<ShardAccess> {
        let upper = self.upper_bounds();
        let mut shards = vec![ShardAccess::exclusive(ShardKey::User(self.user_id))];
        for (i, &channel_id) in self.followed_channels.iter().enumerate() {
            shards.extend((self.read_cursors[i]..upper[i]).map(|message_id| {
                ShardAccess::read(ShardKey::Slot {
                    channel_id,
                    message_id,
                })
            }));
        }
        shards
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecuteFetchResponse<const C: usize> {
    pub outcome: Outcome,
    /// Returned messages, one list per followed-channel slot.
    pub messages: [Vec<Message>; C],
}

impl<const C: usize> ExecuteFetchResponse<C> {
    fn aborted(reason: AbortReason) -> Self {
        Self {
            outcome: Outcome::Aborted(reason),
            messages: std::array::from_fn(|_| Vec::new()),
        }
    }

    pub fn message_count(&self) -> usize {
        self.messages.iter().map(Vec::len).sum()
    }
}

/// Validates the read-cursor snapshot, returns up to
/// [`MAX_RETURNED_MESSAGES`] per slot, and advances the cursors.
///
/// The returned range never extends past the prepare-time write cursor, so a
/// fetch never sees messages committed after it prepared and never skips any.
pub fn execute_fetch<const C: usize>(
    store: &ShardStore<C>,
    data: &ExecuteFetchData<C>,
) -> Result<ExecuteFetchResponse<C>, StoreError> {
    let mut user = store.lock_user(data.user_id)?;

    if let Some(channel_id) = data
        .followed_channels
        .iter()
        .zip(user.followed_channels().iter())
        .find_map(|(requested, actual)| (requested != actual).then_some(*requested))
    {
        return Err(StoreError::NotFollowed {
            user_id: data.user_id,
            channel_id,
        });
    }

    if user.read_cursors() != data.read_cursors {
        trace!(user_id = data.user_id, "fetch stale");
        return Ok(ExecuteFetchResponse::aborted(AbortReason::Stale));
    }

    let upper = data.upper_bounds();
    let mut messages: [Vec<Message>; C] = std::array::from_fn(|_| Vec::new());
    for (i, list) in messages.iter_mut().enumerate() {
        *list = store.read_message_range(data.followed_channels[i], data.read_cursors[i], upper[i])?;
    }

    if !user.try_advance(&data.read_cursors, &upper)? {
        return Ok(ExecuteFetchResponse::aborted(AbortReason::Stale));
    }

    let response = ExecuteFetchResponse {
        outcome: Outcome::Committed,
        messages,
    };
    trace!(
        user_id = data.user_id,
        messages = response.message_count(),
        "fetch committed"
    );
    Ok(response)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PreparePostResponse {
    pub next_message_id: MessageId,
}

/// Shards read by [`prepare_post`].
pub fn prepare_post_shards(channel_id: ChannelId) -> Vec<ShardAccess> {
    vec![ShardAccess::read(ShardKey::Channel(channel_id))]
}

pub fn prepare_post<const C: usize>(
    store: &ShardStore<C>,
    channel_id: ChannelId,
) -> Result<PreparePostResponse, StoreError> {
    let next_message_id = store.read_channel_cursor(channel_id)?;
    trace!(channel_id, next_message_id, "post prepared");
    Ok(PreparePostResponse { next_message_id })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutePostData {
    pub channel_id: ChannelId,
    pub expected_next_message_id: MessageId,
    pub author_id: UserId,
    pub timestamp: Timestamp,
    pub text: MessageText,
}

impl ExecutePostData {
    /// The channel cursor and the claimed message slot, both exclusively.
    pub fn shards(&self) -> Vec<ShardAccess> {
        vec![
            ShardAccess::exclusive(ShardKey::Channel(self.channel_id)),
            ShardAccess::exclusive(ShardKey::Slot {
                channel_id: self.channel_id,
                message_id: self.expected_next_message_id,
            }),
        ]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutePostResponse {
    pub outcome: Outcome,
    /// Id of the committed message.
    pub message_id: Option<MessageId>,
}

impl ExecutePostResponse {
    fn aborted(reason: AbortReason) -> Self {
        Self {
            outcome: Outcome::Aborted(reason),
            message_id: None,
        }
    }
}

/// Claims slot `expected_next_message_id` if the channel cursor still points at it.
///
/// The slot is written before the cursor moves past it.
pub fn execute_post<const C: usize>(
    store: &ShardStore<C>,
    data: ExecutePostData,
) -> Result<ExecutePostResponse, StoreError> {
    let ExecutePostData {
        channel_id,
        expected_next_message_id: expected,
        author_id,
        timestamp,
        text,
    } = data;

    let mut channel = store.lock_channel(channel_id)?;
    if channel.next_message_id() != expected {
        trace!(channel_id, expected, "post stale");
        return Ok(ExecutePostResponse::aborted(AbortReason::Stale));
    }
    if expected >= store.capacity() {
        trace!(channel_id, expected, "post rejected, channel full");
        return Ok(ExecutePostResponse::aborted(AbortReason::CapacityExhausted));
    }

    channel.write_message_slot(expected, author_id, timestamp, text)?;
    if !channel.try_advance(expected, expected + 1)? {
        return Ok(ExecutePostResponse::aborted(AbortReason::Stale));
    }

    trace!(channel_id, message_id = expected, "post committed");
    Ok(ExecutePostResponse {
        outcome: Outcome::Committed,
        message_id: Some(expected),
    })
}
