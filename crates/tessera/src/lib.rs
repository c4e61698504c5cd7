// Copyright (c) 2025 Cloudflare, Inc.
// Licensed under the BSD-3-Clause license found in the LICENSE file or at https://opensource.org/licenses/BSD-3-Clause

//! The append pipeline for a static-CT log.
//!
//! An [`Appender`] accepts entries, batches them, assigns contiguous
//! indices, and integrates them into a tiled Merkle tree in an object
//! store, publishing signed checkpoints on a bounded cadence. Around it sit
//! the antispam index (deduplication), the publication awaiter (blocking
//! until an index is covered by a checkpoint), and the storage traits the
//! whole pipeline is written against.

pub mod antispam;
pub mod appender;
pub mod awaiter;
mod integrate;
pub mod metrics;
pub mod storage;

pub use antispam::*;
pub use appender::*;
pub use awaiter::*;
pub use metrics::SequencerMetrics;
pub use storage::*;

use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tlog::UnixTimestamp;

/// Object-store key of the log's checkpoint.
pub const CHECKPOINT_KEY: &str = "checkpoint";

/// Returns the current Unix timestamp at millisecond precision.
///
/// # Panics
///
/// Panics if the system clock is set before the Unix epoch.
pub fn now_millis() -> UnixTimestamp {
    u64::try_from(
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before Unix epoch")
            .as_millis(),
    )
    .unwrap()
}

/// An error from the append pipeline.
#[derive(thiserror::Error, Debug)]
pub enum TesseraError {
    /// Admission limits exceeded; the client should back off and retry.
    #[error("pushback: {0}")]
    Pushback(&'static str),
    /// The entry's pool failed to sequence; resubmitting is safe.
    #[error("entry was not sequenced")]
    NotSequenced,
    /// A deadline expired while waiting on storage.
    #[error("storage deadline exceeded")]
    DeadlineExceeded,
    /// The appender is shutting down.
    #[error("shutting down")]
    ShuttingDown,
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

/// Options for constructing an [`Appender`].
#[derive(Clone, Debug)]
pub struct AppendOptions {
    /// Log identity baked into checkpoints.
    pub origin: String,
    /// Maximum number of entries in a single sequencing batch.
    pub batch_max_size: usize,
    /// Maximum time an entry waits in the pool before its batch is flushed.
    pub batch_max_age: Duration,
    /// Maximum interval between checkpoint publications.
    pub checkpoint_interval: Duration,
    /// Maximum number of entries assigned or queued but not yet integrated
    /// before `add` starts pushing back.
    pub pushback_max_outstanding: u64,
    /// Maximum number of entries in the in-memory antispam cache.
    pub antispam_cache_size: usize,
    /// Maximum permitted antispam follower lag, in entries, before `add`
    /// starts pushing back.
    pub pushback_max_antispam_lag: u64,
    /// How often the antispam follower and checkpoint poller wake up.
    pub poll_interval: Duration,
}

impl Default for AppendOptions {
    fn default() -> Self {
        Self {
            origin: String::new(),
            batch_max_size: 256,
            batch_max_age: Duration::from_millis(250),
            checkpoint_interval: Duration::from_millis(1500),
            pushback_max_outstanding: 4096,
            antispam_cache_size: 256_000,
            pushback_max_antispam_lag: 1 << 20,
            poll_interval: Duration::from_millis(200),
        }
    }
}
