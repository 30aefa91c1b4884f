//! Random FETCH/POST request streams.

use rand::{Rng, seq::SliceRandom};

use crate::error::StoreError;
use crate::store::ShardStore;
use crate::types::{ChannelId, MessageText, Request, UserId};

/// Request counts derived from a total and a fetch:post ratio.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkloadPlan {
    pub fetch_requests: u64,
    pub post_requests: u64,
}

impl WorkloadPlan {
    /// `post = total / (ratio + 1)` and `fetch = post * ratio`, so the
    /// planned total can fall a little short of `total_requests`.
    pub fn new(total_requests: u64, request_ratio: u32) -> Self {
        let post_requests = total_requests / (u64::from(request_ratio) + 1);
        Self {
            fetch_requests: post_requests * u64::from(request_ratio),
            post_requests,
        }
    }

    pub fn total(&self) -> u64 {
        self.fetch_requests + self.post_requests
    }
}

pub fn message_text(user_id: UserId, channel_id: ChannelId) -> Result<MessageText, StoreError> {
    MessageText::new(format!(
        "This is a message from user {user_id} on channel {channel_id}"
    ))
}

/// Builds a shuffled request stream for `store`.
///
/// Fetches and posts pick users uniformly; each post goes to a uniformly
/// chosen channel among its author's followed channels.
pub fn generate<const C: usize, R>(
    store: &ShardStore<C>,
    plan: &WorkloadPlan,
    rng: &mut R,
) -> Result<Vec<Request>, StoreError>
where
    R: Rng + ?Sized,
{
    let user_count = store.user_count();
    let mut requests = Vec::with_capacity(plan.total() as usize);

    for _ in 0..plan.fetch_requests {
        requests.push(Request::Fetch {
            user_id: rng.gen_range(0..user_count),
        });
    }

    for _ in 0..plan.post_requests {
        let user_id = rng.gen_range(0..user_count);
        let followed = store.followed_channels(user_id)?;
        let channel_id = followed[rng.gen_range(0..C)];
        requests.push(Request::Post {
            user_id,
            channel_id,
            text: message_text(user_id, channel_id)?,
        });
    }

    requests.shuffle(rng);
    Ok(requests)
}
