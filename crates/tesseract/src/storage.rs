// Copyright (c) 2025 Cloudflare, Inc.
// Licensed under the BSD-3-Clause license found in the LICENSE file or at https://opensource.org/licenses/BSD-3-Clause

//! The CT storage layer: gluing the append pipeline to the submission path.
//!
//! `add` submits an entry and waits for its index assignment. New entries
//! keep the timestamp assigned at queue admission; duplicates take the
//! recovery path, which waits for the checkpoint covering the prior index,
//! reads the historical entry bundle, and extracts the originally committed
//! timestamp. The timestamp of a leaf is therefore never rewritten by a
//! resubmission, and by entry determinism the SCT reissued for a duplicate
//! is byte-identical to the original.

use crate::{IssuerRecord, IssuerStore};
use static_ct::{extract_timestamp_from_bundle, Entry};
use std::time::Duration;
use tessera::{
    Appender, LogReader, ObjectStore, PublicationAwaiter, ResettingCounter, TesseraError,
};
use tlog::{split_leaf_index, UnixTimestamp};
use tokio::sync::watch;
use tokio::time::Instant;

/// An entry's committed coordinates.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SequencedEntry {
    pub index: u64,
    pub timestamp: UnixTimestamp,
    pub is_duplicate: bool,
}

/// An error from the submission path, already classified for the HTTP
/// surface.
#[derive(thiserror::Error, Debug)]
pub enum AddError {
    /// Admission limits exceeded; clients should back off.
    #[error("pushback: {0}")]
    Pushback(String),
    /// The backend did not answer within the deadline, or failed.
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),
    /// An invariant was violated.
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<TesseraError> for AddError {
    fn from(e: TesseraError) -> Self {
        match e {
            TesseraError::Pushback(reason) => AddError::Pushback(reason.to_string()),
            TesseraError::DeadlineExceeded
            | TesseraError::NotSequenced
            | TesseraError::ShuttingDown
            | TesseraError::Storage(_) => AddError::StorageUnavailable(e.to_string()),
        }
    }
}

/// Options for [`CTStorage`].
#[derive(Clone, Debug)]
pub struct CTStorageOptions {
    /// Wait for integration before answering non-duplicate submissions.
    pub enable_publication_awaiter: bool,
    /// Maximum concurrent duplicate recoveries per reset interval.
    pub max_dedupe_in_flight: u64,
    /// Bound on every blocking storage wait.
    pub http_deadline: Duration,
    /// Cadence of the checkpoint poller backing the awaiter.
    pub poll_interval: Duration,
}

impl Default for CTStorageOptions {
    fn default() -> Self {
        Self {
            enable_publication_awaiter: true,
            max_dedupe_in_flight: 100,
            http_deadline: Duration::from_secs(10),
            poll_interval: Duration::from_millis(200),
        }
    }
}

/// The submission-facing storage surface of the log.
pub struct CTStorage<O: ObjectStore, I: IssuerStore> {
    appender: Appender,
    reader: LogReader<O>,
    awaiter: PublicationAwaiter,
    issuers: I,
    dedupe_in_flight: std::sync::Arc<ResettingCounter>,
    opts: CTStorageOptions,
    shutdown_tx: watch::Sender<bool>,
}

impl<O: ObjectStore, I: IssuerStore> CTStorage<O, I> {
    /// Wires the storage layer together and starts the checkpoint poller
    /// and the dedupe-counter reset ticker.
    pub fn new(
        appender: Appender,
        reader: LogReader<O>,
        issuers: I,
        opts: CTStorageOptions,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let awaiter =
            PublicationAwaiter::new(reader.clone(), opts.poll_interval, shutdown_rx.clone());
        // Reset each second so sustained duplicate traffic shares capacity.
        let dedupe_in_flight = ResettingCounter::new(Duration::from_secs(1), shutdown_rx);
        Self {
            appender,
            reader,
            awaiter,
            issuers,
            dedupe_in_flight,
            opts,
            shutdown_tx,
        }
    }

    /// Stops the appender and this layer's background tasks.
    pub fn shutdown(&self) {
        self.appender.shutdown();
        let _ = self.shutdown_tx.send(true);
    }

    /// Submits an entry and waits until its coordinates are known.
    ///
    /// # Errors
    ///
    /// Returns [`AddError::Pushback`] under admission control and
    /// [`AddError::StorageUnavailable`] when the backend fails or the
    /// deadline passes.
    pub async fn add(&self, entry: Entry) -> Result<SequencedEntry, AddError> {
        let deadline = Instant::now() + self.opts.http_deadline;
        let timestamp = entry.timestamp;

        let future = self.appender.add(entry)?;
        let assignment = tokio::time::timeout_at(deadline, future.resolve())
            .await
            .map_err(|_| AddError::StorageUnavailable("assignment timed out".to_string()))??;

        if assignment.is_duplicate {
            return self.recover_duplicate(assignment.index, deadline).await;
        }

        if self.opts.enable_publication_awaiter {
            self.awaiter.await_index(assignment.index, deadline).await?;
        }

        Ok(SequencedEntry {
            index: assignment.index,
            timestamp,
            is_duplicate: false,
        })
    }

    /// Stores every certificate of an accepted chain above the leaf under
    /// its content hash.
    ///
    /// # Errors
    ///
    /// Returns [`AddError::StorageUnavailable`] if the backend rejects the
    /// writes.
    pub async fn add_issuer_chain(&self, issuers_der: &[Vec<u8>]) -> Result<(), AddError> {
        let records: Vec<IssuerRecord> = issuers_der
            .iter()
            .map(|der| IssuerRecord::from_der(der.clone()))
            .collect();
        self.issuers
            .add_issuers_if_not_exist(&records)
            .await
            .map_err(|e| AddError::StorageUnavailable(format!("storing issuers: {e:#}")))
    }

    /// Recovers the committed coordinates of a duplicate: wait for the
    /// checkpoint covering `index`, then read the timestamp out of the
    /// historical entry bundle.
    async fn recover_duplicate(
        &self,
        index: u64,
        deadline: Instant,
    ) -> Result<SequencedEntry, AddError> {
        if self.dedupe_in_flight.increment() >= self.opts.max_dedupe_in_flight {
            return Err(AddError::Pushback(
                "too many duplicate submissions".to_string(),
            ));
        }

        let (tree_size, _checkpoint) = self.awaiter.await_index(index, deadline).await?;

        let (bundle_index, index_in_bundle) = split_leaf_index(index);
        let bundle = self
            .reader
            .read_entry_bundle(bundle_index, tree_size)
            .await
            .map_err(|e| {
                AddError::StorageUnavailable(format!(
                    "fetching entry bundle {bundle_index}: {e:#}"
                ))
            })?;
        let timestamp = extract_timestamp_from_bundle(&bundle, index_in_bundle).map_err(|e| {
            AddError::Internal(format!(
                "extracting timestamp of entry {index_in_bundle} in bundle {bundle_index}: {e}"
            ))
        })?;

        Ok(SequencedEntry {
            index,
            timestamp,
            is_duplicate: true,
        })
    }
}
