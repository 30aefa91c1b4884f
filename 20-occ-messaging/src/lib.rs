//! Channel-messaging benchmark built on sharded state and optimistic concurrency.
//!
//! A fixed population of users each follow a fixed set of channels. Channels
//! hold append-only logs. A shuffled stream of POST (append) and FETCH (read
//! unread messages) requests is pushed through a two-phase pipeline: a
//! read-only prepare task snapshots counters, then an execute task validates
//! the snapshot against the one shard it commits to and either commits or
//! aborts without side effects.
//!
//! - [`store`] holds the per-user, per-channel, and per-slot shards and their
//!   compare-and-commit primitives.
//! - [`protocol`] implements the prepare/execute handlers for both request kinds.
//! - [`dispatch`] keeps many requests in flight on the tokio worker pool and
//!   reaps finished tasks out of order.
//! - [`stats`] aggregates latencies and outcomes into a [`stats::RunReport`].
//! - [`workload`] generates the random request stream.
//! - [`service`] chains the handlers into blocking `post`/`fetch` calls that
//!   retry on conflict.
//! - [`cli`] and [`bench`] parse options and wire everything together for the
//!   `occ-messaging` binary.

pub mod bench;
pub mod cli;
pub mod dispatch;
pub mod error;
pub mod protocol;
pub mod service;
pub mod stats;
pub mod store;
pub mod types;
pub mod workload;
