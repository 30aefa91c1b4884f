//! Integration tests for the dispatcher driving real handlers on a tokio runtime.

use std::sync::Arc;

use anyhow::Result;
use occ_messaging::{
    dispatch::{DispatchOptions, Dispatcher, RetryPolicy},
    protocol::{AbortReason, Outcome},
    store::ShardStore,
    types::{Action, MessageText, Request},
    workload::{WorkloadPlan, generate},
};
use rand::{SeedableRng, rngs::StdRng};

fn post(user_id: u32, channel_id: u32, text: &str) -> Request {
    Request::Post {
        user_id,
        channel_id,
        text: MessageText::new(text).expect("short text"),
    }
}

fn serial() -> DispatchOptions {
    DispatchOptions {
        max_in_flight: 1,
        retry: RetryPolicy::drop_on_conflict(),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn random_workload_keeps_store_consistent() -> Result<()> {
    let mut rng = StdRng::seed_from_u64(42);
    let store = ShardStore::<4>::new(20, 10, 2000, &mut rng)?;
    let plan = WorkloadPlan::new(4000, 3);
    let requests = generate(&store, &plan, &mut rng)?;
    let store = Arc::new(store);

    let dispatcher = Dispatcher::new(Arc::clone(&store), DispatchOptions::default())?;
    let report = dispatcher.run(requests).await;

    assert_eq!(report.completions.len() as u64, plan.total());
    assert_eq!(report.stats.fetch.requests, plan.fetch_requests);
    assert_eq!(report.stats.post.requests, plan.post_requests);
    store.check_invariants()?;

    // Every committed post occupies exactly one slot.
    let mut posted = 0u64;
    for channel in 0..store.channel_count() {
        posted += u64::from(store.read_channel_cursor(channel)?);
    }
    assert_eq!(posted, report.stats.post.committed);

    // Every returned message advanced exactly one read cursor by one.
    let mut consumed = 0u64;
    for user in 0..store.user_count() {
        consumed += store.read_user_cursor(user)?.iter().map(|&c| u64::from(c)).sum::<u64>();
    }
    assert_eq!(consumed, report.stats.fetch.messages);

    for completion in &report.completions {
        if completion.action == Action::Post {
            assert_eq!(completion.messages, 0);
        }
        if !completion.is_success() {
            assert!(matches!(completion.outcome, Outcome::Aborted(AbortReason::Stale)));
        }
    }
    Ok(())
}

#[tokio::test]
async fn post_then_fetch_runs_through_both_phases() -> Result<()> {
    let store = Arc::new(ShardStore::<2>::with_followed(5, 10, vec![[1, 3], [0, 2]])?);
    let dispatcher = Dispatcher::new(Arc::clone(&store), serial())?;

    let report = dispatcher
        .run([post(0, 1, "hello"), Request::Fetch { user_id: 0 }])
        .await;

    assert_eq!(report.completions.len(), 2);
    assert!(report.completions.iter().all(|c| c.is_success()));
    assert_eq!(report.completions[1].messages, 1);
    assert_eq!(report.stats.fetch.messages, 1);

    let log = store.read_message_range(1, 0, 1)?;
    assert_eq!(log[0].author_id, 0);
    assert_eq!(log[0].text.as_str(), "hello");
    assert_eq!(store.read_user_cursor(0)?, [1, 0]);
    Ok(())
}

#[tokio::test]
async fn serial_posts_fill_ids_in_order() -> Result<()> {
    let store = Arc::new(ShardStore::<2>::with_followed(3, 100, vec![[0, 1]])?);
    let dispatcher = Dispatcher::new(Arc::clone(&store), serial())?;

    let requests: Vec<_> = (0..25).map(|i| post(0, 0, &format!("m{i}"))).collect();
    let report = dispatcher.run(requests).await;

    assert_eq!(report.stats.post.committed, 25);
    let log = store.read_message_range(0, 0, 25)?;
    for (i, message) in log.iter().enumerate() {
        assert_eq!(message.message_id as usize, i);
        assert_eq!(message.text.as_str(), format!("m{i}"));
    }
    // Logical timestamps follow admission order.
    assert!(log.windows(2).all(|pair| pair[0].timestamp < pair[1].timestamp));
    Ok(())
}

#[tokio::test]
async fn overlapping_posts_without_retry_count_conflicts() -> Result<()> {
    let store = Arc::new(ShardStore::<2>::with_followed(3, 100, vec![[0, 1], [0, 2]])?);
    let dispatcher = Dispatcher::new(
        Arc::clone(&store),
        DispatchOptions {
            max_in_flight: 64,
            retry: RetryPolicy::drop_on_conflict(),
        },
    )?;

    let requests: Vec<_> = (0..10).map(|i| post(i % 2, 0, "race")).collect();
    let report = dispatcher.run(requests).await;

    let post_stats = &report.stats.post;
    assert_eq!(post_stats.requests, 10);
    assert!(post_stats.committed >= 1);
    assert_eq!(post_stats.committed + post_stats.failed, 10);
    assert_eq!(post_stats.failed, post_stats.stale);
    assert_eq!(post_stats.retries, 0);
    assert_eq!(u64::from(store.read_channel_cursor(0)?), post_stats.committed);
    store.check_invariants()?;
    Ok(())
}

#[tokio::test]
async fn bounded_retry_lands_every_conflicting_post() -> Result<()> {
    let store = Arc::new(ShardStore::<2>::with_followed(3, 100, vec![[0, 1]])?);
    let dispatcher = Dispatcher::new(
        Arc::clone(&store),
        DispatchOptions {
            max_in_flight: 64,
            retry: RetryPolicy::bounded(1000),
        },
    )?;

    let requests: Vec<_> = (0..20).map(|i| post(0, 1, &format!("r{i}"))).collect();
    let report = dispatcher.run(requests).await;

    assert_eq!(report.stats.post.committed, 20);
    assert_eq!(report.stats.post.failed, 0);
    assert_eq!(store.read_channel_cursor(1)?, 20);

    let mut timestamps: Vec<_> = store
        .read_message_range(1, 0, 20)?
        .iter()
        .map(|m| m.timestamp)
        .collect();
    timestamps.sort_unstable();
    timestamps.dedup();
    assert_eq!(timestamps.len(), 20);
    store.check_invariants()?;
    Ok(())
}

#[tokio::test]
async fn full_channel_is_reported_not_retried() -> Result<()> {
    let store = Arc::new(ShardStore::<2>::with_followed(3, 3, vec![[0, 1]])?);
    let dispatcher = Dispatcher::new(
        Arc::clone(&store),
        DispatchOptions {
            max_in_flight: 1,
            retry: RetryPolicy::bounded(5),
        },
    )?;

    let requests: Vec<_> = (0..6).map(|_| post(0, 0, "fill")).collect();
    let report = dispatcher.run(requests).await;

    assert_eq!(report.stats.post.committed, 3);
    assert_eq!(report.stats.post.capacity_exhausted, 3);
    assert_eq!(report.stats.post.retries, 0);
    assert_eq!(store.read_channel_cursor(0)?, 3);
    Ok(())
}

#[tokio::test]
async fn drained_fetches_succeed_with_no_messages() -> Result<()> {
    let store = Arc::new(ShardStore::<2>::with_followed(3, 100, vec![[0, 1]])?);
    let dispatcher = Dispatcher::new(Arc::clone(&store), serial())?;

    let mut requests: Vec<_> = (0..30).map(|_| post(0, 0, "backlog")).collect();
    requests.extend((0..4).map(|_| Request::Fetch { user_id: 0 }));
    let report = dispatcher.run(requests).await;

    let fetched: Vec<_> = report.completions[30..].iter().map(|c| c.messages).collect();
    assert_eq!(fetched, vec![20, 10, 0, 0]);
    assert!(report.completions.iter().all(|c| c.is_success()));
    Ok(())
}

#[tokio::test]
async fn bad_request_faults_without_stopping_the_run() -> Result<()> {
    let store = Arc::new(ShardStore::<2>::with_followed(3, 100, vec![[0, 1]])?);
    let dispatcher = Dispatcher::new(Arc::clone(&store), DispatchOptions::default())?;

    let report = dispatcher
        .run([
            Request::Fetch { user_id: 9 },
            post(0, 2, "not followed"),
            post(0, 1, "fine"),
        ])
        .await;

    let mut by_sequence = report.completions.clone();
    by_sequence.sort_by_key(|c| c.sequence);
    assert_eq!(by_sequence[0].outcome, Outcome::Aborted(AbortReason::Fault));
    assert_eq!(by_sequence[1].outcome, Outcome::Aborted(AbortReason::Fault));
    assert_eq!(by_sequence[2].outcome, Outcome::Committed);
    assert_eq!(report.stats.fetch.faults + report.stats.post.faults, 2);
    assert_eq!(store.read_channel_cursor(2)?, 0);
    Ok(())
}

#[test]
fn zero_in_flight_is_rejected() -> Result<()> {
    let store = Arc::new(ShardStore::<2>::with_followed(3, 10, vec![[0, 1]])?);
    let options = DispatchOptions {
        max_in_flight: 0,
        retry: RetryPolicy::default(),
    };
    assert!(Dispatcher::new(store, options).is_err());
    Ok(())
}
