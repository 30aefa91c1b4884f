//! Request/response surface over the two-phase handlers.
//!
//! `post` and `fetch` chain prepare and execute on the calling thread and
//! retry when the execute step loses a conflict, which is how the engine is
//! meant to be exposed to callers that want a single answer per call.

use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use thiserror::Error;
use tracing::debug;

use crate::error::StoreError;
use crate::protocol::{
    AbortReason, ExecuteFetchData, ExecutePostData, Outcome, execute_fetch, execute_post,
    prepare_fetch, prepare_post,
};
use crate::store::ShardStore;
use crate::types::{Action, CHANNELS_PER_USER, ChannelId, Message, MessageId, MessageText, UserId};

pub const DEFAULT_MAX_ATTEMPTS: u32 = 64;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("{action} by user {user_id} lost {attempts} conflicts in a row")]
    Conflict {
        action: Action,
        user_id: UserId,
        attempts: u32,
    },

    #[error("channel {channel_id} has no room for more messages")]
    CapacityExhausted { channel_id: ChannelId },
}

pub struct MessagingService<const C: usize = CHANNELS_PER_USER> {
    store: Arc<ShardStore<C>>,
    clock: AtomicU64,
    max_attempts: u32,
}

impl<const C: usize> MessagingService<C> {
    pub fn new(store: Arc<ShardStore<C>>, max_attempts: u32) -> Self {
        Self {
            store,
            clock: AtomicU64::new(0),
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn store(&self) -> &Arc<ShardStore<C>> {
        &self.store
    }

    /// Appends `text` to `channel_id` and returns the id it was committed under.
    pub fn post(
        &self,
        user_id: UserId,
        channel_id: ChannelId,
        text: &str,
    ) -> Result<MessageId, ServiceError> {
        self.store.followed_slot(user_id, channel_id)?;
        let text = MessageText::new(text)?;

        for attempt in 1..=self.max_attempts {
            let prepared = prepare_post(&self.store, channel_id)?;
            let response = execute_post(
                &self.store,
                ExecutePostData {
                    channel_id,
                    expected_next_message_id: prepared.next_message_id,
                    author_id: user_id,
                    timestamp: self.clock.fetch_add(1, Ordering::Relaxed),
                    text: text.clone(),
                },
            )?;

            match (response.outcome, response.message_id) {
                (Outcome::Committed, Some(message_id)) => return Ok(message_id),
                (Outcome::Aborted(AbortReason::CapacityExhausted), _) => {
                    return Err(ServiceError::CapacityExhausted { channel_id });
                }
                _ => debug!(user_id, channel_id, attempt, "post conflicted, retrying"),
            }
        }

        Err(ServiceError::Conflict {
            action: Action::Post,
            user_id,
            attempts: self.max_attempts,
        })
    }

    /// Returns the next page of unread messages across every followed channel,
    /// grouped by followed-channel slot and ordered by id within each channel.
    pub fn fetch(&self, user_id: UserId) -> Result<Vec<Message>, ServiceError> {
        let followed = self.store.followed_channels(user_id)?;

        for attempt in 1..=self.max_attempts {
            let prepared = prepare_fetch(&self.store, user_id)?;
            let data = ExecuteFetchData::new(user_id, followed, prepared);
            let response = execute_fetch(&self.store, &data)?;
            if response.outcome.is_success() {
                return Ok(response.messages.into_iter().flatten().collect());
            }
            debug!(user_id, attempt, "fetch conflicted, retrying");
        }

        Err(ServiceError::Conflict {
            action: Action::Fetch,
            user_id,
            attempts: self.max_attempts,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;

    fn service(capacity: MessageId) -> MessagingService<2> {
        let store = ShardStore::with_followed(4, capacity, vec![[0, 1], [1, 2], [1, 3]])
            .expect("valid store");
        MessagingService::new(Arc::new(store), DEFAULT_MAX_ATTEMPTS)
    }

    #[test]
    fn serial_posts_lose_no_updates() -> anyhow::Result<()> {
        let service = service(100);
        for expected in 0..30 {
            let id = service.post(0, 1, &format!("post {expected}"))?;
            assert_eq!(id, expected);
        }

        let store = service.store();
        assert_eq!(store.read_channel_cursor(1)?, 30);
        let log = store.read_message_range(1, 0, 30)?;
        let ids: Vec<_> = log.iter().map(|m| m.message_id).collect();
        assert_eq!(ids, (0..30).collect::<Vec<_>>());
        store.check_invariants()?;
        Ok(())
    }

    #[test]
    fn racing_posters_get_dense_distinct_ids() -> anyhow::Result<()> {
        let service = MessagingService::new(
            Arc::new(ShardStore::<2>::with_followed(
                4,
                1000,
                vec![[0, 1], [1, 2], [1, 3]],
            )?),
            u32::MAX,
        );

        let mut ids: Vec<MessageId> = thread::scope(|scope| {
            let handles: Vec<_> = (0..3)
                .map(|user_id| {
                    let service = &service;
                    scope.spawn(move || {
                        (0..50)
                            .map(|i| service.post(user_id, 1, &format!("{user_id}:{i}")))
                            .collect::<Result<Vec<_>, _>>()
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|handle| handle.join().expect("poster thread"))
                .collect::<Result<Vec<Vec<_>>, _>>()
                .map(|lists| lists.into_iter().flatten().collect())
        })?;

        ids.sort_unstable();
        assert_eq!(ids, (0..150).collect::<Vec<_>>());
        service.store().check_invariants()?;
        Ok(())
    }

    #[test]
    fn drained_fetch_returns_nothing_and_succeeds() -> anyhow::Result<()> {
        let service = service(100);
        service.post(1, 1, "a")?;
        service.post(1, 2, "b")?;

        let first = service.fetch(1)?;
        let texts: Vec<_> = first.iter().map(|m| m.text.as_str()).collect();
        assert_eq!(texts, vec!["a", "b"]);

        for _ in 0..3 {
            assert!(service.fetch(1)?.is_empty());
        }
        Ok(())
    }

    #[test]
    fn post_to_unfollowed_channel_is_rejected() {
        let service = service(100);
        let error = service.post(0, 3, "nope").expect_err("user 0 does not follow 3");
        assert!(matches!(
            error,
            ServiceError::Store(StoreError::NotFollowed {
                user_id: 0,
                channel_id: 3
            })
        ));
    }

    #[test]
    fn full_channel_reports_capacity() -> anyhow::Result<()> {
        let service = service(2);
        service.post(0, 0, "one")?;
        service.post(0, 0, "two")?;
        let error = service.post(0, 0, "three").expect_err("log is full");
        assert!(matches!(
            error,
            ServiceError::CapacityExhausted { channel_id: 0 }
        ));
        assert_eq!(service.store().read_channel_cursor(0)?, 2);
        Ok(())
    }
}
