// Copyright (c) 2025 Cloudflare, Inc.
// Licensed under the BSD-3-Clause license found in the LICENSE file or at https://opensource.org/licenses/BSD-3-Clause

//! Antispam: mapping entry identity hashes to previously assigned indices.
//!
//! Two layers back the lookup. A bounded in-memory FIFO cache is written
//! synchronously at assignment time and absorbs hot duplicates. Behind it,
//! a follower walks the published entry bundles and builds the durable
//! index, so resubmissions keep deduplicating after a restart. The follower
//! is eventually consistent: in the window before it catches up, a leaf
//! evicted from the cache can be assigned twice, which static-CT accepts.

use crate::{LogReader, ObjectStore};
use log::{debug, warn};
use parking_lot::{Mutex, RwLock};
use static_ct::{BundleIterator, IdentityHash};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tlog::{split_leaf_index, Checkpoint, Note, TILE_WIDTH};
use tokio::sync::watch;

/// The deduplication index consulted by the appender.
pub struct Antispam {
    cache: Mutex<FifoCache>,
    index: RwLock<HashMap<IdentityHash, u64>>,
    follower_position: AtomicU64,
    published_size: AtomicU64,
}

impl Antispam {
    pub(crate) fn new(cache_size: usize) -> Self {
        Self {
            cache: Mutex::new(FifoCache::new(cache_size)),
            index: RwLock::new(HashMap::new()),
            follower_position: AtomicU64::new(0),
            published_size: AtomicU64::new(0),
        }
    }

    /// Returns the index previously assigned to this identity, if known.
    pub fn lookup(&self, identity: &IdentityHash) -> Option<u64> {
        if let Some(index) = self.cache.lock().get(identity) {
            return Some(index);
        }
        self.index.read().get(identity).copied()
    }

    /// Records an assignment in the in-memory cache. Called by the
    /// sequencer under the pool lock, so a resubmission arriving right
    /// after its twin was taken out of the pool still hits.
    pub(crate) fn cache_assignment(&self, identity: IdentityHash, index: u64) {
        self.cache.lock().put(identity, index);
    }

    /// How far the follower trails the published tree, in entries.
    pub fn lag(&self) -> u64 {
        self.published_size
            .load(Ordering::Relaxed)
            .saturating_sub(self.follower_position.load(Ordering::Relaxed))
    }

    /// The follower's current position.
    pub fn follower_position(&self) -> u64 {
        self.follower_position.load(Ordering::Relaxed)
    }

    pub(crate) fn note_published(&self, size: u64) {
        self.published_size.store(size, Ordering::Relaxed);
    }
}

/// Walks published entry bundles and populates the durable antispam index.
/// Runs until `shutdown` flips.
pub(crate) async fn run_follower<O: ObjectStore>(
    antispam: Arc<Antispam>,
    reader: LogReader<O>,
    origin: String,
    poll_interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => return,
            () = tokio::time::sleep(poll_interval) => {}
        }
        if let Err(e) = follow_once(&antispam, &reader, &origin).await {
            warn!("{origin}: antispam follower: {e:#}");
        }
    }
}

async fn follow_once<O: ObjectStore>(
    antispam: &Antispam,
    reader: &LogReader<O>,
    origin: &str,
) -> anyhow::Result<()> {
    let size = match published_size(reader).await? {
        Some(size) => size,
        None => return Ok(()),
    };
    antispam.note_published(size);

    let mut position = antispam.follower_position.load(Ordering::Relaxed);
    while position < size {
        let (bundle_index, index_in_bundle) = split_leaf_index(position);
        let bundle = reader.read_entry_bundle(bundle_index, size).await?;

        // Parse whatever the bundle holds; it may have grown past the
        // checkpoint we read, and indexing assigned-but-uncovered entries
        // only makes deduplication better.
        let mut batch = Vec::new();
        for (i, parsed) in BundleIterator::new(&bundle, TILE_WIDTH as usize).enumerate() {
            let parsed = parsed?;
            if (i as u64) < index_in_bundle {
                continue;
            }
            batch.push((
                parsed.entry.identity_hash(),
                bundle_index * TILE_WIDTH + i as u64,
            ));
        }
        let parsed_up_to = bundle_index * TILE_WIDTH + index_in_bundle + batch.len() as u64;
        {
            let mut index = antispam.index.write();
            for (identity, leaf_index) in batch {
                index.insert(identity, leaf_index);
            }
        }
        position = parsed_up_to.max(position + 1).min((bundle_index + 1) * TILE_WIDTH);
        antispam
            .follower_position
            .store(position, Ordering::Relaxed);
    }
    debug!("{origin}: antispam follower at {position}");
    Ok(())
}

/// Reads the size line of the published checkpoint, without verifying
/// signatures; the follower trusts its own store.
async fn published_size<O: ObjectStore>(reader: &LogReader<O>) -> anyhow::Result<Option<u64>> {
    let raw = match reader.read_checkpoint().await {
        Ok(raw) => raw,
        Err(_) => return Ok(None), // not created yet
    };
    let note = Note::from_bytes(&raw).map_err(|e| anyhow::anyhow!("bad checkpoint note: {e}"))?;
    let checkpoint =
        Checkpoint::from_bytes(note.text()).map_err(|e| anyhow::anyhow!("bad checkpoint: {e}"))?;
    Ok(Some(checkpoint.size()))
}

/// A fixed-size FIFO map from identity hash to assigned index.
struct FifoCache {
    max_size: usize,
    map: HashMap<IdentityHash, u64>,
    fifo: VecDeque<IdentityHash>,
}

impl FifoCache {
    fn new(max_size: usize) -> Self {
        assert_ne!(max_size, 0);
        Self {
            max_size,
            map: HashMap::with_capacity(max_size.min(1 << 16)),
            fifo: VecDeque::with_capacity(max_size.min(1 << 16)),
        }
    }

    fn get(&self, key: &IdentityHash) -> Option<u64> {
        self.map.get(key).copied()
    }

    fn put(&mut self, key: IdentityHash, value: u64) {
        if self.map.contains_key(&key) {
            return;
        }
        if self.map.len() == self.max_size {
            // Evict the oldest entry to make room.
            self.map.remove(&self.fifo.pop_front().unwrap());
        }
        self.fifo.push_back(key);
        self.map.insert(key, value);
    }
}

/// A per-second counter used to bound concurrent duplicate recoveries.
/// Incremented by callers, reset to zero by a background ticker so
/// sustained duplicate traffic shares capacity fairly.
pub struct ResettingCounter {
    count: AtomicU64,
}

impl ResettingCounter {
    /// Returns a new counter and spawns its reset ticker.
    pub fn new(reset_interval: Duration, mut shutdown: watch::Receiver<bool>) -> Arc<Self> {
        let counter = Arc::new(Self {
            count: AtomicU64::new(0),
        });
        let ticker = Arc::clone(&counter);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => return,
                    () = tokio::time::sleep(reset_interval) => {
                        ticker.count.store(0, Ordering::Relaxed);
                    }
                }
            }
        });
        counter
    }

    /// Increments the counter, returning the pre-increment value.
    pub fn increment(&self) -> u64 {
        self.count.fetch_add(1, Ordering::Relaxed)
    }
}
