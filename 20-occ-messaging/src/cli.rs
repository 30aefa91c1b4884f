use anyhow::{Result, ensure};
use clap::Parser;

use crate::dispatch::{DEFAULT_MAX_IN_FLIGHT, DispatchOptions, RetryPolicy};
use crate::types::{CHANNELS_PER_USER, MessageId};
use crate::workload::WorkloadPlan;

#[derive(Parser, Debug, Clone)]
#[command(
    author,
    version,
    about = "Benchmark a sharded channel-messaging store under optimistic concurrency"
)]
pub struct Cli {
    /// Number of users.
    #[arg(short = 'n', long = "users")]
    pub users: u32,

    /// Number of channels; must be at least the channels each user follows.
    #[arg(short = 'k', long = "channels")]
    pub channels: u32,

    /// Message capacity of each channel log.
    #[arg(short = 'm', long = "messages")]
    pub messages: MessageId,

    /// Total number of requests to generate.
    #[arg(short = 't', long = "requests")]
    pub requests: u64,

    /// Fetch requests issued per post request.
    #[arg(short = 'r', long = "ratio", default_value_t = 1)]
    pub ratio: u32,

    /// Tokio worker threads running the handlers. Defaults to one per core.
    #[arg(long)]
    pub workers: Option<usize>,

    /// Maximum number of requests preparing or executing at once.
    #[arg(long, default_value_t = DEFAULT_MAX_IN_FLIGHT)]
    pub max_in_flight: usize,

    /// Times a request that lost an OCC conflict is resubmitted before it counts as failed.
    #[arg(long, default_value_t = 0)]
    pub max_retries: u32,

    /// Seed for channel assignment and workload generation.
    #[arg(long, default_value_t = 0)]
    pub seed: u64,

    /// Print the report as JSON.
    #[arg(long)]
    pub json: bool,

    /// Check store invariants after the run.
    #[arg(long)]
    pub verify: bool,
}

/// Validated benchmark settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BenchConfig {
    pub user_count: u32,
    pub channel_count: u32,
    pub message_capacity: MessageId,
    pub plan: WorkloadPlan,
    pub workers: Option<usize>,
    pub dispatch: DispatchOptions,
    pub seed: u64,
    pub json: bool,
    pub verify: bool,
}

impl BenchConfig {
    pub fn from_cli(cli: &Cli) -> Result<Self> {
        ensure!(cli.users > 0, "--users must be greater than zero");
        ensure!(cli.channels > 0, "--channels must be greater than zero");
        ensure!(cli.messages > 0, "--messages must be greater than zero");
        ensure!(cli.requests > 0, "--requests must be greater than zero");
        ensure!(cli.ratio > 0, "--ratio must be greater than zero");
        ensure!(
            cli.channels as usize >= CHANNELS_PER_USER,
            "you must specify at least {CHANNELS_PER_USER} channels"
        );
        ensure!(
            cli.max_in_flight > 0,
            "--max-in-flight must be greater than zero"
        );
        if let Some(workers) = cli.workers {
            ensure!(workers > 0, "--workers must be greater than zero");
        }

        let plan = WorkloadPlan::new(cli.requests, cli.ratio);
        ensure!(
            plan.post_requests > 0,
            "the number of requests is too low for the chosen ratio; \
             increase --requests or decrease --ratio"
        );

        Ok(Self {
            user_count: cli.users,
            channel_count: cli.channels,
            message_capacity: cli.messages,
            plan,
            workers: cli.workers,
            dispatch: DispatchOptions {
                max_in_flight: cli.max_in_flight,
                retry: RetryPolicy::bounded(cli.max_retries),
            },
            seed: cli.seed,
            json: cli.json,
            verify: cli.verify,
        })
    }
}
