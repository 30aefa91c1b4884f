//! Partitioned in-memory state for users, channels, and message slots.
//!
//! State is split into three kinds of shard:
//!
//! - one **user shard** per user: the followed-channel list (fixed at
//!   construction) and the per-slot read cursors;
//! - one **channel shard** per channel: the write cursor `next_message_id`;
//! - one **slot** per `(channel, message_id)`: a write-once message cell.
//!
//! Each user and channel shard has its own mutex that is only held by the
//! exclusive compare-and-commit paths. Read-only snapshots of channel cursors
//! and message slots go through atomics and `OnceLock`, so they never wait on a
//! writer. A slot is always filled before the write cursor that exposes it is
//! published with `Release` ordering, which keeps the cursor from outpacing
//! the data.
//!
//! The store does not order competing writers. Higher-level OCC (see
//! [`protocol`](crate::protocol)) decides who wins; the store only offers the
//! compare-and-commit primitives.

use std::sync::{
    Mutex, MutexGuard, OnceLock, PoisonError,
    atomic::{AtomicU32, Ordering},
};

use rand::{Rng, seq::index};

use crate::error::StoreError;
use crate::types::{
    CHANNELS_PER_USER, ChannelId, Message, MessageId, MessageText, Timestamp, UserId,
};

struct UserShard<const C: usize> {
    followed: [ChannelId; C],
    read_cursors: Mutex<[MessageId; C]>,
}

struct ChannelShard {
    write_lock: Mutex<()>,
    next_message_id: AtomicU32,
    log: Box<[OnceLock<Message>]>,
}

impl ChannelShard {
    fn new(capacity: MessageId) -> Self {
        Self {
            write_lock: Mutex::new(()),
            next_message_id: AtomicU32::new(0),
            log: (0..capacity).map(|_| OnceLock::new()).collect(),
        }
    }

    fn slot(&self, message_id: MessageId) -> Option<&Message> {
        self.log.get(message_id as usize).and_then(OnceLock::get)
    }
}

/// Shared store holding every shard of the messaging world.
pub struct ShardStore<const C: usize = CHANNELS_PER_USER> {
    users: Box<[UserShard<C>]>,
    channels: Box<[ChannelShard]>,
    capacity: MessageId,
}

impl<const C: usize> ShardStore<C> {
    /// Creates a store where each user follows `C` distinct channels sampled
    /// without replacement.
    pub fn new<R>(
        user_count: u32,
        channel_count: u32,
        capacity: MessageId,
        rng: &mut R,
    ) -> Result<Self, StoreError>
    where
        R: Rng + ?Sized,
    {
        if (channel_count as usize) < C {
            return Err(StoreError::InvalidShape(format!(
                "{channel_count} channels cannot give every user {C} distinct followed channels"
            )));
        }

        let followed = (0..user_count)
            .map(|_| {
                let picked = index::sample(rng, channel_count as usize, C);
                let mut ids = [0; C];
                for (slot, channel) in ids.iter_mut().zip(picked.iter()) {
                    *slot = channel as ChannelId;
                }
                ids
            })
            .collect();

        Self::with_followed(channel_count, capacity, followed)
    }

    /// Creates a store from explicit followed-channel lists, one per user.
    pub fn with_followed(
        channel_count: u32,
        capacity: MessageId,
        followed: Vec<[ChannelId; C]>,
    ) -> Result<Self, StoreError> {
        if C == 0 {
            return Err(StoreError::InvalidShape(
                "users must follow at least one channel".to_string(),
            ));
        }
        if followed.is_empty() || u32::try_from(followed.len()).is_err() {
            return Err(StoreError::InvalidShape(format!(
                "user count {} is out of range",
                followed.len()
            )));
        }
        if channel_count == 0 || capacity == 0 {
            return Err(StoreError::InvalidShape(
                "channel count and message capacity must be non-zero".to_string(),
            ));
        }

        let mut users = Vec::with_capacity(followed.len());
        for (user_id, channels) in followed.into_iter().enumerate() {
            for (i, &channel_id) in channels.iter().enumerate() {
                if channel_id >= channel_count {
                    return Err(StoreError::UnknownChannel {
                        channel_id,
                        channel_count,
                    });
                }
                if channels[..i].contains(&channel_id) {
                    return Err(StoreError::InvalidShape(format!(
                        "user {user_id} follows channel {channel_id} twice"
                    )));
                }
            }
            users.push(UserShard {
                followed: channels,
                read_cursors: Mutex::new([0; C]),
            });
        }

        let channels = (0..channel_count)
            .map(|_| ChannelShard::new(capacity))
            .collect();

        Ok(Self {
            users: users.into_boxed_slice(),
            channels,
            capacity,
        })
    }

    pub fn user_count(&self) -> u32 {
        self.users.len() as u32
    }

    pub fn channel_count(&self) -> u32 {
        self.channels.len() as u32
    }

    /// Maximum number of messages a single channel log can hold.
    pub fn capacity(&self) -> MessageId {
        self.capacity
    }

    fn user(&self, user_id: UserId) -> Result<&UserShard<C>, StoreError> {
        self.users
            .get(user_id as usize)
            .ok_or(StoreError::UnknownUser {
                user_id,
                user_count: self.user_count(),
            })
    }

    fn channel(&self, channel_id: ChannelId) -> Result<&ChannelShard, StoreError> {
        self.channels
            .get(channel_id as usize)
            .ok_or(StoreError::UnknownChannel {
                channel_id,
                channel_count: self.channel_count(),
            })
    }

    /// Channels followed by `user_id`. Never changes after construction.
    pub fn followed_channels(&self, user_id: UserId) -> Result<[ChannelId; C], StoreError> {
        Ok(self.user(user_id)?.followed)
    }

    /// Index of `channel_id` in the user's followed list.
    pub fn followed_slot(&self, user_id: UserId, channel_id: ChannelId) -> Result<usize, StoreError> {
        self.user(user_id)?
            .followed
            .iter()
            .position(|&followed| followed == channel_id)
            .ok_or(StoreError::NotFollowed {
                user_id,
                channel_id,
            })
    }

    /// Snapshot of a channel's write cursor.
    pub fn read_channel_cursor(&self, channel_id: ChannelId) -> Result<MessageId, StoreError> {
        Ok(self.channel(channel_id)?.next_message_id.load(Ordering::Acquire))
    }

    /// Snapshot of every read cursor of a user.
    pub fn read_user_cursor(&self, user_id: UserId) -> Result<[MessageId; C], StoreError> {
        Ok(*lock(&self.user(user_id)?.read_cursors))
    }

    /// Takes exclusive ownership of a channel shard until the writer is dropped.
    pub fn lock_channel(&self, channel_id: ChannelId) -> Result<ChannelWriter<'_>, StoreError> {
        let shard = self.channel(channel_id)?;
        Ok(ChannelWriter {
            channel_id,
            capacity: self.capacity,
            _guard: lock(&shard.write_lock),
            shard,
        })
    }

    /// Takes exclusive ownership of a user shard until the writer is dropped.
    pub fn lock_user(&self, user_id: UserId) -> Result<UserWriter<'_, C>, StoreError> {
        let shard = self.user(user_id)?;
        Ok(UserWriter {
            store: self,
            followed: shard.followed,
            cursors: lock(&shard.read_cursors),
        })
    }

    /// Moves the write cursor from `expected` to `new` if it still reads `expected`.
    pub fn try_advance_channel_cursor(
        &self,
        channel_id: ChannelId,
        expected: MessageId,
        new: MessageId,
    ) -> Result<bool, StoreError> {
        self.lock_channel(channel_id)?.try_advance(expected, new)
    }

    /// Moves all read cursors of a user at once if they still equal `expected`.
    pub fn try_advance_user_cursor(
        &self,
        user_id: UserId,
        expected: &[MessageId; C],
        new: &[MessageId; C],
    ) -> Result<bool, StoreError> {
        self.lock_user(user_id)?.try_advance(expected, new)
    }

    /// Writes a message into a slot that has never been written.
    ///
    /// Callers must own the slot through a successful cursor check; writing
    /// does not make the message visible until the write cursor passes it.
    pub fn write_message_slot(
        &self,
        channel_id: ChannelId,
        message_id: MessageId,
        author_id: UserId,
        timestamp: Timestamp,
        text: MessageText,
    ) -> Result<(), StoreError> {
        self.lock_channel(channel_id)?
            .write_message_slot(message_id, author_id, timestamp, text)
    }

    /// Reads the committed messages `[from, to)` of a channel in id order.
    pub fn read_message_range(
        &self,
        channel_id: ChannelId,
        from: MessageId,
        to: MessageId,
    ) -> Result<Vec<Message>, StoreError> {
        let shard = self.channel(channel_id)?;
        let next_message_id = shard.next_message_id.load(Ordering::Acquire);
        if from > to || to > next_message_id {
            return Err(StoreError::RangeOutOfBounds {
                channel_id,
                from,
                to,
                next_message_id,
            });
        }

        (from..to)
            .map(|message_id| {
                shard
                    .slot(message_id)
                    .cloned()
                    .ok_or(StoreError::MissingMessage {
                        channel_id,
                        message_id,
                    })
            })
            .collect()
    }

    /// Verifies log contiguity and read-cursor bounds across the whole store.
    ///
    /// Each shard is checked while held exclusively, so the result is exact
    /// once no writers are running.
    pub fn check_invariants(&self) -> Result<(), StoreError> {
        for (channel_id, shard) in self.channels.iter().enumerate() {
            let _guard = lock(&shard.write_lock);
            let next = shard.next_message_id.load(Ordering::Acquire);
            if next > self.capacity {
                return Err(StoreError::InvariantViolation(format!(
                    "channel {channel_id} cursor {next} exceeds capacity {}",
                    self.capacity
                )));
            }
            for (message_id, slot) in shard.log.iter().enumerate() {
                let message_id = message_id as MessageId;
                match (slot.get(), message_id < next) {
                    (Some(message), true) => {
                        if message.message_id != message_id
                            || message.channel_id != channel_id as ChannelId
                        {
                            return Err(StoreError::InvariantViolation(format!(
                                "slot ({channel_id}, {message_id}) holds message ({}, {})",
                                message.channel_id, message.message_id
                            )));
                        }
                    }
                    (None, true) => {
                        return Err(StoreError::InvariantViolation(format!(
                            "channel {channel_id} has a gap at {message_id} below cursor {next}"
                        )));
                    }
                    (Some(_), false) => {
                        return Err(StoreError::InvariantViolation(format!(
                            "channel {channel_id} has a message at {message_id} past cursor {next}"
                        )));
                    }
                    (None, false) => {}
                }
            }
        }

        for (user_id, shard) in self.users.iter().enumerate() {
            let cursors = lock(&shard.read_cursors);
            for (&channel_id, &cursor) in shard.followed.iter().zip(cursors.iter()) {
                let next = self.read_channel_cursor(channel_id)?;
                if cursor > next {
                    return Err(StoreError::InvariantViolation(format!(
                        "user {user_id} read cursor {cursor} is past channel {channel_id} cursor {next}"
                    )));
                }
            }
        }

        Ok(())
    }
}

/// Exclusive handle on one channel shard.
pub struct ChannelWriter<'a> {
    channel_id: ChannelId,
    capacity: MessageId,
    shard: &'a ChannelShard,
    _guard: MutexGuard<'a, ()>,
}

impl ChannelWriter<'_> {
    pub fn channel_id(&self) -> ChannelId {
        self.channel_id
    }

    pub fn next_message_id(&self) -> MessageId {
        self.shard.next_message_id.load(Ordering::Acquire)
    }

    pub fn write_message_slot(
        &mut self,
        message_id: MessageId,
        author_id: UserId,
        timestamp: Timestamp,
        text: MessageText,
    ) -> Result<(), StoreError> {
        if message_id >= self.capacity {
            return Err(StoreError::CapacityExhausted {
                channel_id: self.channel_id,
                capacity: self.capacity,
            });
        }
        let message = Message {
            channel_id: self.channel_id,
            message_id,
            author_id,
            timestamp,
            text,
        };
        self.shard.log[message_id as usize]
            .set(message)
            .map_err(|_| StoreError::SlotOccupied {
                channel_id: self.channel_id,
                message_id,
            })
    }

    /// Compare-and-commit on the write cursor.
    ///
    /// Returns `Ok(false)` without mutation when the cursor moved away from
    /// `expected`. Every slot in `[expected, new)` must already be written.
    pub fn try_advance(&mut self, expected: MessageId, new: MessageId) -> Result<bool, StoreError> {
        let current = self.next_message_id();
        if current != expected {
            return Ok(false);
        }
        if new < current || new > self.capacity {
            return Err(StoreError::CursorOutOfRange {
                channel_id: self.channel_id,
                current,
                requested: new,
            });
        }
        if let Some(message_id) = (current..new).find(|&id| self.shard.slot(id).is_none()) {
            return Err(StoreError::MissingMessage {
                channel_id: self.channel_id,
                message_id,
            });
        }
        self.shard.next_message_id.store(new, Ordering::Release);
        Ok(true)
    }
}

/// Exclusive handle on one user shard's read cursors.
pub struct UserWriter<'a, const C: usize> {
    store: &'a ShardStore<C>,
    followed: [ChannelId; C],
    cursors: MutexGuard<'a, [MessageId; C]>,
}

impl<const C: usize> UserWriter<'_, C> {
    pub fn followed_channels(&self) -> [ChannelId; C] {
        self.followed
    }

    pub fn read_cursors(&self) -> [MessageId; C] {
        *self.cursors
    }

    /// Compare-and-commit over all `C` read cursors as one decision.
    ///
    /// Cursors may only move forward and never past their channel's write cursor.
    pub fn try_advance(
        &mut self,
        expected: &[MessageId; C],
        new: &[MessageId; C],
    ) -> Result<bool, StoreError> {
        if *self.cursors != *expected {
            return Ok(false);
        }
        for i in 0..C {
            let channel_id = self.followed[i];
            let bound = self.store.read_channel_cursor(channel_id)?;
            if new[i] < expected[i] || new[i] > bound {
                return Err(StoreError::CursorOutOfRange {
                    channel_id,
                    current: expected[i],
                    requested: new[i],
                });
            }
        }
        *self.cursors = *new;
        Ok(true)
    }
}

// Every critical section commits with a single store after validation, so a
// panic while holding a shard never leaves it half-updated.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use rand::{SeedableRng, rngs::StdRng};

    use super::*;

    fn text(s: &str) -> MessageText {
        MessageText::new(s).expect("short text")
    }

    fn small_store() -> ShardStore<2> {
        ShardStore::with_followed(5, 8, vec![[1, 3], [0, 1]]).expect("valid store")
    }

    #[test]
    fn sampled_followed_channels_are_distinct_and_in_range() {
        let mut rng = StdRng::seed_from_u64(7);
        let store: ShardStore<4> = ShardStore::new(50, 6, 10, &mut rng).expect("valid store");

        for user in 0..store.user_count() {
            let followed = store.followed_channels(user).expect("user exists");
            for (i, channel) in followed.iter().enumerate() {
                assert!(*channel < 6);
                assert!(!followed[..i].contains(channel));
            }
        }
    }

    #[test]
    fn rejects_too_few_channels() {
        let mut rng = StdRng::seed_from_u64(1);
        let result = ShardStore::<4>::new(2, 3, 10, &mut rng);
        assert!(matches!(result, Err(StoreError::InvalidShape(_))));
    }

    #[test]
    fn rejects_duplicate_followed_channel() {
        let result = ShardStore::<2>::with_followed(5, 8, vec![[2, 2]]);
        assert!(matches!(result, Err(StoreError::InvalidShape(_))));
    }

    #[test]
    fn channel_cursor_advances_only_from_expected_value() -> anyhow::Result<()> {
        let store = small_store();
        store.write_message_slot(1, 0, 0, 1, text("a"))?;

        assert!(!store.try_advance_channel_cursor(1, 3, 4)?);
        assert_eq!(store.read_channel_cursor(1)?, 0);

        assert!(store.try_advance_channel_cursor(1, 0, 1)?);
        assert_eq!(store.read_channel_cursor(1)?, 1);

        assert!(!store.try_advance_channel_cursor(1, 0, 1)?);
        Ok(())
    }

    #[test]
    fn channel_cursor_cannot_expose_unwritten_slots() {
        let store = small_store();
        let result = store.try_advance_channel_cursor(2, 0, 1);
        assert_eq!(
            result,
            Err(StoreError::MissingMessage {
                channel_id: 2,
                message_id: 0
            })
        );
        assert_eq!(store.read_channel_cursor(2), Ok(0));
    }

    #[test]
    fn slots_are_write_once_and_bounded_by_capacity() {
        let store = small_store();
        store
            .write_message_slot(0, 0, 1, 1, text("first"))
            .expect("empty slot");
        assert_eq!(
            store.write_message_slot(0, 0, 1, 2, text("second")),
            Err(StoreError::SlotOccupied {
                channel_id: 0,
                message_id: 0
            })
        );
        assert_eq!(
            store.write_message_slot(0, 8, 1, 3, text("overflow")),
            Err(StoreError::CapacityExhausted {
                channel_id: 0,
                capacity: 8
            })
        );
    }

    #[test]
    fn message_range_is_limited_to_committed_messages() -> anyhow::Result<()> {
        let store = small_store();
        for id in 0..3 {
            store.write_message_slot(3, id, 0, u64::from(id), text(&format!("m{id}")))?;
        }
        assert!(store.try_advance_channel_cursor(3, 0, 3)?);

        let messages = store.read_message_range(3, 1, 3)?;
        let ids: Vec<_> = messages.iter().map(|m| m.message_id).collect();
        assert_eq!(ids, vec![1, 2]);
        assert_eq!(messages[0].text.as_str(), "m1");

        assert!(matches!(
            store.read_message_range(3, 0, 4),
            Err(StoreError::RangeOutOfBounds { .. })
        ));
        assert!(store.read_message_range(3, 2, 2)?.is_empty());
        Ok(())
    }

    #[test]
    fn user_cursor_commit_is_all_or_nothing() -> anyhow::Result<()> {
        let store = small_store();
        store.write_message_slot(1, 0, 0, 0, text("x"))?;
        assert!(store.try_advance_channel_cursor(1, 0, 1)?);

        assert!(!store.try_advance_user_cursor(0, &[1, 0], &[1, 0])?);
        assert_eq!(store.read_user_cursor(0)?, [0, 0]);

        // Slot 1 follows channel 3, which is still empty.
        assert!(matches!(
            store.try_advance_user_cursor(0, &[0, 0], &[1, 1]),
            Err(StoreError::CursorOutOfRange { channel_id: 3, .. })
        ));
        assert_eq!(store.read_user_cursor(0)?, [0, 0]);

        assert!(store.try_advance_user_cursor(0, &[0, 0], &[1, 0])?);
        assert_eq!(store.read_user_cursor(0)?, [1, 0]);
        Ok(())
    }

    #[test]
    fn unknown_ids_are_reported() {
        let store = small_store();
        assert_eq!(
            store.read_user_cursor(9),
            Err(StoreError::UnknownUser {
                user_id: 9,
                user_count: 2
            })
        );
        assert_eq!(
            store.read_channel_cursor(5),
            Err(StoreError::UnknownChannel {
                channel_id: 5,
                channel_count: 5
            })
        );
        assert_eq!(
            store.followed_slot(0, 2),
            Err(StoreError::NotFollowed {
                user_id: 0,
                channel_id: 2
            })
        );
    }

    #[test]
    fn invariant_check_flags_a_slot_written_past_the_cursor() -> anyhow::Result<()> {
        let store = small_store();
        store.check_invariants()?;

        store.write_message_slot(4, 0, 1, 0, text("orphan"))?;
        assert!(matches!(
            store.check_invariants(),
            Err(StoreError::InvariantViolation(_))
        ));
        Ok(())
    }
}
