//! Two-stage request pipeline.
//!
//! The dispatcher owns a queue of requests and two sets of in-flight tasks:
//!
//! - **pending**: prepare tasks whose snapshot has not come back yet;
//! - **executing**: execute tasks whose commit decision has not come back yet.
//!
//! Each turn of the loop reaps whatever has finished in either set (in any
//! order), turns finished prepares into execute tasks, and admits one new
//! request if there is room. Only when nothing can be admitted does the loop
//! park on the first task to complete. Handlers run on the tokio worker pool;
//! the loop itself never touches shard state except to read the immutable
//! followed-channel lists.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, anyhow, ensure};
use futures::{FutureExt, StreamExt, future::BoxFuture, stream::FuturesUnordered};
use tracing::{debug, trace, warn};

use crate::error::StoreError;
use crate::protocol::{
    AbortReason, ExecuteFetchData, ExecuteFetchResponse, ExecutePostData, ExecutePostResponse,
    Outcome, PrepareFetchResponse, PreparePostResponse, RequestPhase, execute_fetch, execute_post,
    prepare_fetch, prepare_fetch_shards, prepare_post, prepare_post_shards,
};
use crate::stats::{Completion, RunReport, Stats};
use crate::store::ShardStore;
use crate::types::{CHANNELS_PER_USER, Request, Timestamp};

pub const DEFAULT_MAX_IN_FLIGHT: usize = 1024;

/// What to do with a request whose execute found a stale snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Extra attempts after the first. Zero drops the request and counts it as failed.
    pub max_retries: u32,
}

impl RetryPolicy {
    pub fn drop_on_conflict() -> Self {
        Self { max_retries: 0 }
    }

    pub fn bounded(max_retries: u32) -> Self {
        Self { max_retries }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchOptions {
    /// Upper bound on requests that are preparing or executing at once.
    pub max_in_flight: usize,
    pub retry: RetryPolicy,
}

impl Default for DispatchOptions {
    fn default() -> Self {
        Self {
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
            retry: RetryPolicy::default(),
        }
    }
}

pub struct Dispatcher<const C: usize = CHANNELS_PER_USER> {
    store: Arc<ShardStore<C>>,
    options: DispatchOptions,
}

impl<const C: usize> Dispatcher<C> {
    pub fn new(store: Arc<ShardStore<C>>, options: DispatchOptions) -> anyhow::Result<Self> {
        ensure!(options.max_in_flight > 0, "max in-flight requests must be non-zero");
        Ok(Self { store, options })
    }

    pub fn store(&self) -> &Arc<ShardStore<C>> {
        &self.store
    }

    /// Drives every request through prepare and execute and returns the tally.
    ///
    /// Must be called from within a tokio runtime.
    pub async fn run<I>(&self, requests: I) -> RunReport
    where
        I: IntoIterator<Item = Request>,
    {
        let mut run = Run::new(requests);
        let mut pending: InFlight<Prepared<C>> = FuturesUnordered::new();
        let mut executing: InFlight<Executed<C>> = FuturesUnordered::new();
        let started = Instant::now();

        loop {
            while let Some(Some(landed)) = pending.next().now_or_never() {
                self.on_prepared(landed, &mut executing, &mut run);
            }
            while let Some(Some(landed)) = executing.next().now_or_never() {
                self.on_executed(landed, &mut run);
            }

            if pending.len() + executing.len() < self.options.max_in_flight {
                if let Some(tracked) = run.admit() {
                    pending.push(self.submit_prepare(tracked));
                    continue;
                }
            }

            if run.queue.is_empty() && pending.is_empty() && executing.is_empty() {
                break;
            }

            tokio::select! {
                Some(landed) = pending.next(), if !pending.is_empty() => {
                    self.on_prepared(landed, &mut executing, &mut run);
                }
                Some(landed) = executing.next(), if !executing.is_empty() => {
                    self.on_executed(landed, &mut run);
                }
                else => {}
            }
        }

        let elapsed = started.elapsed();
        debug!(
            requests = run.completions.len(),
            elapsed_ns = elapsed.as_nanos() as u64,
            "dispatch finished"
        );
        RunReport::new(elapsed, run.stats, run.completions)
    }

    fn submit_prepare(&self, tracked: Tracked) -> BoxFuture<'static, Landed<Prepared<C>>> {
        let store = Arc::clone(&self.store);
        let task: Task<Prepared<C>> = match tracked.request {
            Request::Fetch { user_id } => {
                if let Ok(followed) = self.store.followed_channels(user_id) {
                    trace!(
                        sequence = tracked.sequence,
                        shards = ?prepare_fetch_shards(user_id, &followed),
                        "submitting fetch prepare"
                    );
                }
                Box::new(move || prepare_fetch(&store, user_id).map(Prepared::Fetch))
            }
            Request::Post { channel_id, .. } => {
                trace!(
                    sequence = tracked.sequence,
                    shards = ?prepare_post_shards(channel_id),
                    "submitting post prepare"
                );
                Box::new(move || prepare_post(&store, channel_id).map(Prepared::Post))
            }
        };
        submit(tracked, task)
    }

    fn on_prepared(
        &self,
        landed: Landed<Prepared<C>>,
        executing: &mut InFlight<Executed<C>>,
        run: &mut Run,
    ) {
        let Landed {
            mut tracked,
            result,
        } = landed;
        let action = tracked.request.action();

        let task = result.and_then(|timed| {
            run.stats.record_prepare(action, timed.elapsed);
            trace!(
                sequence = tracked.sequence,
                %action,
                elapsed_ns = timed.elapsed.as_nanos() as u64,
                "prepare finished"
            );
            tracked.phase = RequestPhase::PrepareReady;
            self.execute_task(&tracked, timed.value)
        });

        match task {
            Ok(task) => {
                tracked.phase = RequestPhase::Executing;
                executing.push(submit(tracked, task));
            }
            Err(error) => {
                warn!(sequence = tracked.sequence, %action, error = %format!("{error:#}"), "prepare failed");
                run.complete(tracked, Outcome::Aborted(AbortReason::Fault), 0);
            }
        }
    }

    /// Builds the execute task from a prepare snapshot plus the request's own data.
    fn execute_task(&self, tracked: &Tracked, prepared: Prepared<C>) -> anyhow::Result<Task<Executed<C>>> {
        let store = Arc::clone(&self.store);
        match (&tracked.request, prepared) {
            (Request::Fetch { user_id }, Prepared::Fetch(prepared)) => {
                let followed = self.store.followed_channels(*user_id)?;
                let data = ExecuteFetchData::new(*user_id, followed, prepared);
                trace!(sequence = tracked.sequence, shards = ?data.shards(), "submitting fetch execute");
                Ok(Box::new(move || execute_fetch(&store, &data).map(Executed::Fetch)))
            }
            (
                Request::Post {
                    user_id,
                    channel_id,
                    text,
                },
                Prepared::Post(prepared),
            ) => {
                self.store.followed_slot(*user_id, *channel_id)?;
                let data = ExecutePostData {
                    channel_id: *channel_id,
                    expected_next_message_id: prepared.next_message_id,
                    author_id: *user_id,
                    timestamp: tracked.timestamp,
                    text: text.clone(),
                };
                trace!(sequence = tracked.sequence, shards = ?data.shards(), "submitting post execute");
                Ok(Box::new(move || execute_post(&store, data).map(Executed::Post)))
            }
            (request, _) => Err(anyhow!(
                "prepare result does not match {} request",
                request.action()
            )),
        }
    }

    fn on_executed(&self, landed: Landed<Executed<C>>, run: &mut Run) {
        let Landed { tracked, result } = landed;
        let action = tracked.request.action();

        let (outcome, messages) = match result {
            Ok(timed) => {
                run.stats.record_execute(action, timed.elapsed);
                trace!(
                    sequence = tracked.sequence,
                    %action,
                    elapsed_ns = timed.elapsed.as_nanos() as u64,
                    "execute finished"
                );
                match timed.value {
                    Executed::Fetch(response) => (response.outcome, response.message_count()),
                    Executed::Post(response) => (response.outcome, 0),
                }
            }
            Err(error) => {
                warn!(sequence = tracked.sequence, %action, error = %format!("{error:#}"), "execute failed");
                (Outcome::Aborted(AbortReason::Fault), 0)
            }
        };

        if outcome == Outcome::Aborted(AbortReason::Stale)
            && tracked.attempts <= self.options.retry.max_retries
        {
            debug!(
                sequence = tracked.sequence,
                %action,
                attempts = tracked.attempts,
                "retrying stale request"
            );
            run.stats.record_retry(action);
            run.requeue(tracked);
            return;
        }

        run.complete(tracked, outcome, messages);
    }
}

enum Prepared<const C: usize> {
    Fetch(PrepareFetchResponse<C>),
    Post(PreparePostResponse),
}

enum Executed<const C: usize> {
    Fetch(ExecuteFetchResponse<C>),
    Post(ExecutePostResponse),
}

type Task<T> = Box<dyn FnOnce() -> Result<T, StoreError> + Send>;

type InFlight<T> = FuturesUnordered<BoxFuture<'static, Landed<T>>>;

/// A request plus the bookkeeping that follows it through both stages.
struct Tracked {
    sequence: u64,
    timestamp: Timestamp,
    attempts: u32,
    phase: RequestPhase,
    request: Request,
}

struct Timed<T> {
    value: T,
    elapsed: Duration,
}

/// A finished task reunited with the request that launched it.
struct Landed<T> {
    tracked: Tracked,
    result: anyhow::Result<Timed<T>>,
}

fn submit<T>(tracked: Tracked, task: Task<T>) -> BoxFuture<'static, Landed<T>>
where
    T: Send + 'static,
{
    let handle = tokio::spawn(async move {
        let started = Instant::now();
        task().map(|value| Timed {
            value,
            elapsed: started.elapsed(),
        })
    });

    handle
        .map(move |joined| {
            let result = joined
                .context("handler task did not complete")
                .and_then(|outcome| outcome.map_err(anyhow::Error::from));
            Landed { tracked, result }
        })
        .boxed()
}

/// Per-run state: the unsubmitted queue, the logical clock, and the tally.
struct Run {
    queue: VecDeque<Tracked>,
    clock: Timestamp,
    stats: Stats,
    completions: Vec<Completion>,
}

impl Run {
    fn new<I>(requests: I) -> Self
    where
        I: IntoIterator<Item = Request>,
    {
        let queue: VecDeque<_> = requests
            .into_iter()
            .enumerate()
            .map(|(sequence, request)| Tracked {
                sequence: sequence as u64,
                timestamp: 0,
                attempts: 0,
                phase: RequestPhase::Created,
                request,
            })
            .collect();
        let completions = Vec::with_capacity(queue.len());
        Self {
            queue,
            clock: 0,
            stats: Stats::default(),
            completions,
        }
    }

    /// Pops the next request and stamps it with the logical clock.
    fn admit(&mut self) -> Option<Tracked> {
        let mut tracked = self.queue.pop_front()?;
        tracked.timestamp = self.clock;
        self.clock += 1;
        tracked.attempts += 1;
        tracked.phase = RequestPhase::Preparing;
        Some(tracked)
    }

    fn requeue(&mut self, mut tracked: Tracked) {
        tracked.phase = RequestPhase::Created;
        self.queue.push_front(tracked);
    }

    fn complete(&mut self, mut tracked: Tracked, outcome: Outcome, messages: usize) {
        tracked.phase = RequestPhase::settled(outcome);
        debug_assert!(tracked.phase.is_terminal());
        trace!(sequence = tracked.sequence, phase = ?tracked.phase, messages, "request settled");

        let completion = Completion {
            sequence: tracked.sequence,
            action: tracked.request.action(),
            user_id: tracked.request.user_id(),
            outcome,
            attempts: tracked.attempts,
            messages,
        };
        self.stats.record_completion(&completion);
        self.completions.push(completion);
    }
}
