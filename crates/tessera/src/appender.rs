// Copyright (c) 2025 Cloudflare, Inc.
// Licensed under the BSD-3-Clause license found in the LICENSE file or at https://opensource.org/licenses/BSD-3-Clause

//! The appender: admission, pooling, and index assignment.
//!
//! `add` is synchronous and cheap. It applies admission control (pushback
//! on outstanding work and antispam lag), deduplicates against the pool and
//! the antispam index, and enqueues new entries. A sequencer task flushes
//! the pool into batches when they reach `batch_max_size` or their oldest
//! entry reaches `batch_max_age`, assigns contiguous indices in submission
//! order, resolves the entries' futures, and hands the batch to the
//! integrator. Futures therefore resolve at *assignment*; integration and
//! checkpoint publication follow within the checkpoint interval.

use crate::{
    antispam::run_follower,
    integrate::{self, AssignedBatch, IntegratorContext, TreeState},
    Antispam, AppendOptions, LogReader, ObjectStore, SequencerMetrics, TesseraError,
};
use log::{debug, info};
use parking_lot::Mutex;
use prometheus::Registry;
use static_ct::{Entry, IdentityHash};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tlog::{CheckpointSigner, VerifierList};
use tokio::sync::{mpsc, watch, Notify};
use tokio::time::Instant;

/// The result of waiting on an [`IndexFuture`]: the entry's assigned index,
/// and whether it deduplicated against a prior identical leaf.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct AssignResult {
    pub index: u64,
    pub is_duplicate: bool,
}

/// A future for an entry's index assignment.
pub struct IndexFuture {
    inner: FutureInner,
    is_duplicate: bool,
}

enum FutureInner {
    Ready(u64),
    Pending(watch::Receiver<Option<u64>>),
}

impl IndexFuture {
    /// Waits until the entry's batch is assigned.
    ///
    /// # Errors
    ///
    /// Returns [`TesseraError::NotSequenced`] if the appender shut down
    /// before the entry's pool was flushed.
    pub async fn resolve(self) -> Result<AssignResult, TesseraError> {
        let index = match self.inner {
            FutureInner::Ready(index) => index,
            FutureInner::Pending(mut rx) => {
                let assigned = rx
                    .wait_for(Option::is_some)
                    .await
                    .map_err(|_| TesseraError::NotSequenced)?;
                (*assigned).unwrap()
            }
        };
        Ok(AssignResult {
            index,
            is_duplicate: self.is_duplicate,
        })
    }
}

struct PendingEntry {
    entry: Entry,
    identity: IdentityHash,
    tx: watch::Sender<Option<u64>>,
    enqueued: Instant,
}

#[derive(Default)]
struct Pool {
    pending: Vec<PendingEntry>,
    // Identity -> receiver for entries currently queued, so concurrent
    // resubmissions share one future.
    dedup: std::collections::HashMap<IdentityHash, watch::Receiver<Option<u64>>>,
}

struct Inner {
    opts: AppendOptions,
    pool: Mutex<Pool>,
    antispam: Arc<Antispam>,
    outstanding: Arc<AtomicU64>,
    flush_notify: Notify,
    shutdown_tx: watch::Sender<bool>,
    metrics: SequencerMetrics,
}

/// The write half of a log: assigns indices to entries and integrates them
/// into the tree. The storage backend is only needed at construction; the
/// handle itself is backend-agnostic.
pub struct Appender {
    inner: Arc<Inner>,
}

impl Appender {
    /// Loads the log from the store (creating and publishing an empty
    /// checkpoint if it does not exist yet), starts the sequencer,
    /// integrator, and antispam follower, and returns the appender together
    /// with a reader for the same store.
    ///
    /// # Errors
    ///
    /// Returns an error if the stored state fails to load or verify, or if
    /// the initial checkpoint cannot be published.
    pub async fn new<O: ObjectStore>(
        store: Arc<O>,
        signer: Box<dyn CheckpointSigner>,
        opts: AppendOptions,
        registry: &Registry,
    ) -> Result<(Self, LogReader<O>), anyhow::Error> {
        let origin = opts.origin.clone();
        let metrics = SequencerMetrics::new(registry);
        let reader = LogReader::new(Arc::clone(&store));
        let verifiers = VerifierList::new(vec![signer.verifier()]);

        let state = match integrate::load(&reader, store.as_ref(), &verifiers, &origin).await? {
            Some((state, timestamp)) => {
                info!(
                    "{origin}: loaded log; size={}, timestamp={timestamp}",
                    state.size()
                );
                state
            }
            None => {
                let state = TreeState::new();
                integrate::publish_checkpoint(store.as_ref(), signer.as_ref(), &origin, &state)
                    .await?;
                info!("{origin}: created log");
                state
            }
        };
        let size = state.size();

        let antispam = Arc::new(Antispam::new(opts.antispam_cache_size));
        antispam.note_published(size);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let outstanding = Arc::new(AtomicU64::new(0));
        let (batch_tx, batch_rx) = mpsc::channel(16);

        let inner = Arc::new(Inner {
            opts: opts.clone(),
            pool: Mutex::new(Pool::default()),
            antispam: Arc::clone(&antispam),
            outstanding: Arc::clone(&outstanding),
            flush_notify: Notify::new(),
            shutdown_tx,
            metrics: metrics.clone(),
        });

        tokio::spawn(run_sequencer(
            Arc::clone(&inner),
            batch_tx,
            size,
            shutdown_rx.clone(),
        ));
        tokio::spawn(integrate::run_integrator(
            IntegratorContext {
                state,
                store,
                signer,
                opts: opts.clone(),
                antispam: Arc::clone(&antispam),
                outstanding,
                metrics,
            },
            batch_rx,
            shutdown_rx.clone(),
        ));
        tokio::spawn(run_follower(
            antispam,
            reader.clone(),
            origin,
            opts.poll_interval,
            shutdown_rx,
        ));

        Ok((Self { inner }, reader))
    }

    /// Submits an entry for sequencing.
    ///
    /// Returns a future that resolves once the entry's index is assigned.
    /// A resubmission of an already-known leaf resolves to the prior index
    /// with `is_duplicate` set.
    ///
    /// # Errors
    ///
    /// Returns [`TesseraError::Pushback`] when admission limits are
    /// exceeded, or [`TesseraError::ShuttingDown`].
    pub fn add(&self, entry: Entry) -> Result<IndexFuture, TesseraError> {
        let inner = &*self.inner;
        if *inner.shutdown_tx.borrow() {
            return Err(TesseraError::ShuttingDown);
        }

        let identity = entry.identity_hash();
        let mut pool = inner.pool.lock();

        // Admission control. Outstanding covers both queued entries and
        // assigned-but-unintegrated ones.
        if inner.outstanding.load(Ordering::Relaxed) >= inner.opts.pushback_max_outstanding {
            inner.metrics.entry_count.with_label_values(&["pushback"]).inc();
            return Err(TesseraError::Pushback("too many outstanding entries"));
        }
        if inner.antispam.lag() > inner.opts.pushback_max_antispam_lag {
            inner.metrics.entry_count.with_label_values(&["pushback"]).inc();
            return Err(TesseraError::Pushback("antispam follower lagging"));
        }

        // An identical entry already in the pool shares its future; the
        // later submitter is the duplicate.
        if let Some(rx) = pool.dedup.get(&identity) {
            inner.metrics.entry_count.with_label_values(&["pool"]).inc();
            return Ok(IndexFuture {
                inner: FutureInner::Pending(rx.clone()),
                is_duplicate: true,
            });
        }

        // A previously assigned identical entry resolves immediately.
        if let Some(index) = inner.antispam.lookup(&identity) {
            inner.metrics.entry_count.with_label_values(&["cache"]).inc();
            return Ok(IndexFuture {
                inner: FutureInner::Ready(index),
                is_duplicate: true,
            });
        }

        let (tx, rx) = watch::channel(None);
        pool.pending.push(PendingEntry {
            entry,
            identity,
            tx,
            enqueued: Instant::now(),
        });
        pool.dedup.insert(identity, rx.clone());
        let pool_len = pool.pending.len();
        drop(pool);

        inner.outstanding.fetch_add(1, Ordering::Relaxed);
        inner.metrics.entry_count.with_label_values(&["new"]).inc();
        // Wake the sequencer to start the age timer for a fresh pool, and to
        // flush immediately once a full batch is ready.
        if pool_len == 1 || pool_len >= inner.opts.batch_max_size {
            inner.flush_notify.notify_one();
        }

        Ok(IndexFuture {
            inner: FutureInner::Pending(rx),
            is_duplicate: false,
        })
    }

    /// The antispam layer, exposed for admission monitoring.
    pub fn antispam(&self) -> &Antispam {
        &self.inner.antispam
    }

    /// Signals all background tasks to drain and stop. Queued entries are
    /// flushed and integrated on the way out.
    pub fn shutdown(&self) {
        let _ = self.inner.shutdown_tx.send(true);
    }
}

/// Flushes pools into assigned batches until shutdown.
async fn run_sequencer(
    inner: Arc<Inner>,
    batch_tx: mpsc::Sender<AssignedBatch>,
    mut next_index: u64,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let deadline = {
            let pool = inner.pool.lock();
            pool.pending
                .first()
                .map(|e| e.enqueued + inner.opts.batch_max_age)
        };
        tokio::select! {
            _ = shutdown.changed() => {
                // Drain: flush everything still queued so assigned SCT
                // promises are kept, then close the channel to let the
                // integrator publish and exit.
                flush(&inner, &mut next_index, &batch_tx, true).await;
                info!("{}: sequencer stopped; next_index={next_index}", inner.opts.origin);
                return;
            }
            _ = inner.flush_notify.notified() => {}
            () = async {
                match deadline {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    None => std::future::pending().await,
                }
            } => {}
        }
        flush(&inner, &mut next_index, &batch_tx, false).await;
    }
}

/// Takes ripe batches out of the pool, assigns their indices, resolves
/// their futures, and forwards them to the integrator.
async fn flush(
    inner: &Inner,
    next_index: &mut u64,
    batch_tx: &mpsc::Sender<AssignedBatch>,
    drain: bool,
) {
    loop {
        let mut batch_entries = Vec::new();
        let mut senders = Vec::new();
        let first_index = *next_index;
        {
            let mut pool = inner.pool.lock();
            let ripe = drain
                || pool.pending.len() >= inner.opts.batch_max_size
                || pool
                    .pending
                    .first()
                    .is_some_and(|e| e.enqueued.elapsed() >= inner.opts.batch_max_age);
            if pool.pending.is_empty() || !ripe {
                return;
            }
            let take = pool.pending.len().min(inner.opts.batch_max_size);
            let drained: Vec<_> = pool.pending.drain(..take).collect();
            for pending in drained {
                let index = *next_index;
                *next_index += 1;
                // Populate the cache and drop the pool marker while still
                // holding the lock, so a resubmission always hits one of
                // the two.
                inner.antispam.cache_assignment(pending.identity, index);
                pool.dedup.remove(&pending.identity);
                batch_entries.push(pending.entry);
                senders.push((pending.tx, index));
            }
        }

        debug!(
            "{}: assigned batch; first_index={first_index}, entries={}",
            inner.opts.origin,
            batch_entries.len()
        );
        for (tx, index) in senders {
            // A dropped receiver means the submitter went away; the index
            // stays committed regardless.
            let _ = tx.send(Some(index));
        }
        if batch_tx
            .send(AssignedBatch {
                first_index,
                entries: batch_entries,
            })
            .await
            .is_err()
        {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{now_millis, CHECKPOINT_KEY};
    use crate::{MemoryObjectStore, UploadOptions};
    use p256::ecdsa::SigningKey;
    use static_ct::{BundleIterator, CtCheckpointSigner, CtCheckpointVerifier};
    use std::time::Duration;
    use tlog::{open_checkpoint, record_hash, split_leaf_index, tree_hash, Hash};

    const ORIGIN: &str = "example.com/test-log";

    fn signing_key() -> SigningKey {
        SigningKey::from_slice(&[11; 32]).unwrap()
    }

    fn verifiers() -> VerifierList {
        let verifier =
            CtCheckpointVerifier::new(ORIGIN, signing_key().verifying_key()).unwrap();
        VerifierList::new(vec![Box::new(verifier)])
    }

    fn test_opts() -> AppendOptions {
        AppendOptions {
            origin: ORIGIN.to_string(),
            batch_max_size: 64,
            batch_max_age: Duration::from_millis(20),
            checkpoint_interval: Duration::from_millis(20),
            poll_interval: Duration::from_millis(20),
            ..AppendOptions::default()
        }
    }

    async fn new_appender(
        store: Arc<MemoryObjectStore>,
        opts: AppendOptions,
    ) -> (Appender, LogReader<MemoryObjectStore>) {
        let signer = Box::new(CtCheckpointSigner::new(ORIGIN, signing_key()).unwrap());
        Appender::new(store, signer, opts, &Registry::new())
            .await
            .unwrap()
    }

    fn entry(i: u64) -> Entry {
        Entry {
            timestamp: now_millis(),
            certificate: format!("certificate {i}").into_bytes(),
            chain_fingerprints: vec![[0xcc; 32]],
            ..Entry::default()
        }
    }

    async fn wait_for_size(reader: &LogReader<MemoryObjectStore>, want: u64) -> Vec<u8> {
        for _ in 0..500 {
            let raw = reader.read_checkpoint().await.unwrap();
            let (checkpoint, _) = open_checkpoint(ORIGIN, &verifiers(), &raw).unwrap();
            if checkpoint.size() >= want {
                return raw;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("checkpoint never reached size {want}");
    }

    async fn leaf_hashes(reader: &LogReader<MemoryObjectStore>, size: u64) -> Vec<Hash> {
        let mut hashes = Vec::new();
        let mut index = 0;
        while index < size {
            let (bundle_index, _) = split_leaf_index(index);
            let bundle = reader.read_entry_bundle(bundle_index, size).await.unwrap();
            let width = tlog::tile_width(size, bundle_index);
            for parsed in BundleIterator::new(&bundle, usize::from(width)) {
                let parsed = parsed.unwrap();
                hashes.push(record_hash(&parsed.entry.merkle_tree_leaf()));
                index += 1;
            }
        }
        assert_eq!(index, size);
        hashes
    }

    #[tokio::test]
    async fn test_add_and_publish() {
        let store = Arc::new(MemoryObjectStore::new());
        let (appender, reader) = new_appender(Arc::clone(&store), test_opts()).await;

        let mut futures = Vec::new();
        for i in 0..5 {
            futures.push(appender.add(entry(i)).unwrap());
        }
        for (i, future) in futures.into_iter().enumerate() {
            let result = future.resolve().await.unwrap();
            assert_eq!(result.index, i as u64);
            assert!(!result.is_duplicate);
        }

        // The checkpoint root must match the tree recomputed from the
        // published bundles.
        let raw = wait_for_size(&reader, 5).await;
        let (checkpoint, _) = open_checkpoint(ORIGIN, &verifiers(), &raw).unwrap();
        assert_eq!(checkpoint.size(), 5);
        let hashes = leaf_hashes(&reader, 5).await;
        assert_eq!(tree_hash(&hashes), *checkpoint.hash());

        appender.shutdown();
    }

    #[tokio::test]
    async fn test_add_spanning_tile_boundary() {
        let store = Arc::new(MemoryObjectStore::new());
        let (appender, reader) = new_appender(Arc::clone(&store), test_opts()).await;

        let n = 300u64;
        let futures: Vec<_> = (0..n).map(|i| appender.add(entry(i)).unwrap()).collect();
        for future in futures {
            future.resolve().await.unwrap();
        }
        let raw = wait_for_size(&reader, n).await;
        let (checkpoint, _) = open_checkpoint(ORIGIN, &verifiers(), &raw).unwrap();
        let hashes = leaf_hashes(&reader, n).await;
        assert_eq!(tree_hash(&hashes), *checkpoint.hash());

        // The full first tile and bundle exist under their final paths.
        assert!(store.fetch("tile/data/000").await.unwrap().is_some());
        assert!(store.fetch("tile/0/000").await.unwrap().is_some());

        appender.shutdown();
    }

    #[tokio::test]
    async fn test_duplicates() {
        let store = Arc::new(MemoryObjectStore::new());
        let (appender, reader) = new_appender(Arc::clone(&store), test_opts()).await;

        // Concurrent duplicate: the pool shares one future.
        let first = appender.add(entry(0)).unwrap();
        let second = appender.add(entry(0)).unwrap();
        let first = first.resolve().await.unwrap();
        let second = second.resolve().await.unwrap();
        assert!(!first.is_duplicate);
        assert!(second.is_duplicate);
        assert_eq!(first.index, second.index);

        // Sequential duplicate: the antispam cache remembers assignments.
        wait_for_size(&reader, 1).await;
        let third = appender.add(entry(0)).unwrap().resolve().await.unwrap();
        assert!(third.is_duplicate);
        assert_eq!(third.index, first.index);

        appender.shutdown();
    }

    #[tokio::test]
    async fn test_pushback_outstanding() {
        let store = Arc::new(MemoryObjectStore::new());
        let opts = AppendOptions {
            pushback_max_outstanding: 2,
            batch_max_age: Duration::from_secs(3600),
            batch_max_size: 1000,
            ..test_opts()
        };
        let (appender, _reader) = new_appender(store, opts).await;

        appender.add(entry(0)).unwrap();
        appender.add(entry(1)).unwrap();
        assert!(matches!(
            appender.add(entry(2)),
            Err(TesseraError::Pushback(_))
        ));
        appender.shutdown();
    }

    #[tokio::test]
    async fn test_restart_recovers_state() {
        let store = Arc::new(MemoryObjectStore::new());
        let n = 300u64;
        {
            let (appender, reader) = new_appender(Arc::clone(&store), test_opts()).await;
            let futures: Vec<_> = (0..n).map(|i| appender.add(entry(i)).unwrap()).collect();
            for future in futures {
                future.resolve().await.unwrap();
            }
            wait_for_size(&reader, n).await;
            appender.shutdown();
            // Give the drain a moment to finish publishing.
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        // Reload from the same store and keep appending.
        let (appender, reader) = new_appender(Arc::clone(&store), test_opts()).await;
        let result = appender.add(entry(n)).unwrap().resolve().await.unwrap();
        assert_eq!(result.index, n);
        let raw = wait_for_size(&reader, n + 1).await;
        let (checkpoint, _) = open_checkpoint(ORIGIN, &verifiers(), &raw).unwrap();
        let hashes = leaf_hashes(&reader, n + 1).await;
        assert_eq!(tree_hash(&hashes), *checkpoint.hash());

        appender.shutdown();
    }

    #[tokio::test]
    async fn test_corrupt_checkpoint_fails_load() {
        let store = Arc::new(MemoryObjectStore::new());
        {
            let (appender, reader) = new_appender(Arc::clone(&store), test_opts()).await;
            appender.add(entry(0)).unwrap().resolve().await.unwrap();
            wait_for_size(&reader, 1).await;
            appender.shutdown();
        }
        store
            .upload(CHECKPOINT_KEY, b"garbage", &UploadOptions::checkpoint())
            .await
            .unwrap();
        let signer = Box::new(CtCheckpointSigner::new(ORIGIN, signing_key()).unwrap());
        assert!(
            Appender::new(store, signer, test_opts(), &Registry::new())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_follower_populates_index() {
        let store = Arc::new(MemoryObjectStore::new());
        let first_entry = entry(0);
        {
            let (appender, reader) = new_appender(Arc::clone(&store), test_opts()).await;
            appender.add(first_entry.clone()).unwrap().resolve().await.unwrap();
            appender.add(entry(1)).unwrap().resolve().await.unwrap();
            wait_for_size(&reader, 2).await;
            appender.shutdown();
        }

        // A fresh appender has an empty cache; the follower rebuilds the
        // index from the published bundles.
        let (appender, _reader) = new_appender(Arc::clone(&store), test_opts()).await;
        for _ in 0..500 {
            if appender.antispam().follower_position() >= 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(appender.antispam().follower_position(), 2);
        let result = appender.add(first_entry).unwrap().resolve().await.unwrap();
        assert!(result.is_duplicate);
        assert_eq!(result.index, 0);
        appender.shutdown();
    }
}
