use std::sync::Arc;

use anyhow::{Context, Result};
use rand::{SeedableRng, rngs::StdRng};
use tokio::runtime::{Builder, Runtime};
use tracing::info;

use crate::cli::BenchConfig;
use crate::dispatch::Dispatcher;
use crate::stats::RunReport;
use crate::store::ShardStore;
use crate::types::CHANNELS_PER_USER;
use crate::workload;

/// Multi-threaded runtime sized by `--workers`.
pub fn build_runtime(config: &BenchConfig) -> Result<Runtime> {
    let mut builder = Builder::new_multi_thread();
    if let Some(workers) = config.workers {
        builder.worker_threads(workers);
    }
    builder
        .thread_name("occ-handler")
        .enable_all()
        .build()
        .context("failed to start tokio runtime")
}

/// Builds the store and workload from `config` and runs them through the dispatcher.
pub async fn run(config: &BenchConfig) -> Result<RunReport> {
    let mut rng = StdRng::seed_from_u64(config.seed);
    let store: ShardStore<CHANNELS_PER_USER> = ShardStore::new(
        config.user_count,
        config.channel_count,
        config.message_capacity,
        &mut rng,
    )
    .context("failed to build shard store")?;
    let requests =
        workload::generate(&store, &config.plan, &mut rng).context("failed to generate workload")?;

    info!(
        users = config.user_count,
        channels = config.channel_count,
        capacity = config.message_capacity,
        fetches = config.plan.fetch_requests,
        posts = config.plan.post_requests,
        max_in_flight = config.dispatch.max_in_flight,
        max_retries = config.dispatch.retry.max_retries,
        "starting benchmark"
    );

    let store = Arc::new(store);
    let dispatcher = Dispatcher::new(Arc::clone(&store), config.dispatch)?;
    let report = dispatcher.run(requests).await;

    if config.verify {
        store
            .check_invariants()
            .context("store invariants violated after run")?;
        info!("store invariants hold");
    }

    info!(
        elapsed_ns = report.elapsed_nanos,
        fetch_failed = report.stats.fetch.failed,
        post_failed = report.stats.post.failed,
        messages = report.stats.fetch.messages,
        "benchmark finished"
    );
    Ok(report)
}
