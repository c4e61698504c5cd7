// Copyright (c) 2025 Cloudflare, Inc.
// Licensed under the BSD-3-Clause license found in the LICENSE file or at https://opensource.org/licenses/BSD-3-Clause

//! The integrator: extends the tiled Merkle tree with assigned batches,
//! uploads entry bundles and hash tiles, and publishes signed checkpoints.
//!
//! Tree state is a [`CompactRange`] for the root plus, per level, the
//! entries of the rightmost (possibly incomplete) tile. Full tiles and
//! bundles are staged for upload the moment they complete; frontier
//! partials are uploaded under their `.p/<width>` paths at publication
//! time, just before the checkpoint that makes them reachable.

use crate::{
    metrics::SequencerMetrics, now_millis, Antispam, AppendOptions, LogReader, ObjectStore,
    UploadOptions, CHECKPOINT_KEY,
};
use anyhow::{anyhow, bail, Context};
use log::{debug, info, warn};
use static_ct::{BundleIterator, Entry};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tlog::{
    record_hash, tree_hash, Checkpoint, CheckpointSigner, CompactRange, Hash, Note, Tile,
    TileLevel, UnixTimestamp, VerifierList, HASH_SIZE, TILE_WIDTH,
};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

/// A batch of entries with indices `[first_index, first_index + len)`.
pub(crate) struct AssignedBatch {
    pub(crate) first_index: u64,
    pub(crate) entries: Vec<Entry>,
}

/// A staged object write.
struct Upload {
    key: String,
    data: Vec<u8>,
    opts: UploadOptions,
}

/// The in-memory tree frontier.
pub(crate) struct TreeState {
    range: CompactRange,
    // levels[l] holds the entries of the rightmost incomplete tile at tile
    // level l, in order. Invariant: levels[l].len() == (size >> 8l) % 256.
    levels: Vec<Vec<Hash>>,
    // Serialized entries of the current partial bundle.
    bundle: Vec<u8>,
}

impl TreeState {
    pub(crate) fn new() -> Self {
        Self {
            range: CompactRange::new(),
            levels: Vec::new(),
            bundle: Vec::new(),
        }
    }

    pub(crate) fn size(&self) -> u64 {
        self.range.size()
    }

    pub(crate) fn root(&self) -> Hash {
        self.range.root()
    }

    /// Appends one entry at `index`, staging any tiles that complete.
    fn append(&mut self, entry: &Entry, index: u64, uploads: &mut Vec<Upload>) {
        debug_assert_eq!(index, self.range.size());

        self.bundle.extend_from_slice(&entry.bundle_leaf());
        let leaf_hash = record_hash(&entry.merkle_tree_leaf());
        self.range.push_leaf(leaf_hash);
        self.push_hash(0, leaf_hash, uploads);

        let size = self.range.size();
        if size % TILE_WIDTH == 0 {
            uploads.push(Upload {
                key: Tile::new(TileLevel::Entries, size / TILE_WIDTH - 1, TILE_WIDTH as u16)
                    .path(),
                data: std::mem::take(&mut self.bundle),
                opts: UploadOptions::immutable(),
            });
        }
    }

    /// Adds a hash to the frontier tile at `level`; completing a tile stages
    /// it and carries its subtree root up one level.
    fn push_hash(&mut self, level: usize, hash: Hash, uploads: &mut Vec<Upload>) {
        if self.levels.len() == level {
            self.levels.push(Vec::new());
        }
        self.levels[level].push(hash);
        if self.levels[level].len() < TILE_WIDTH as usize {
            return;
        }

        let entries = std::mem::take(&mut self.levels[level]);
        let total = self.range.size() >> (8 * level as u32);
        uploads.push(Upload {
            key: Tile::new(
                TileLevel::Hash(level as u8),
                total / TILE_WIDTH - 1,
                TILE_WIDTH as u16,
            )
            .path(),
            data: hashes_to_bytes(&entries),
            opts: UploadOptions::immutable(),
        });
        // The completed tile's 256 entries form a perfect subtree whose root
        // is the next entry one level up.
        self.push_hash(level + 1, tree_hash(&entries), uploads);
    }

    /// The frontier partials to upload before publishing a checkpoint.
    fn partial_uploads(&self) -> Vec<Upload> {
        let size = self.range.size();
        let mut uploads = Vec::new();
        if size % TILE_WIDTH != 0 {
            uploads.push(Upload {
                key: Tile::new(
                    TileLevel::Entries,
                    size / TILE_WIDTH,
                    (size % TILE_WIDTH) as u16,
                )
                .path(),
                data: self.bundle.clone(),
                opts: UploadOptions::immutable(),
            });
        }
        for (level, entries) in self.levels.iter().enumerate() {
            if entries.is_empty() {
                continue;
            }
            let total = size >> (8 * level as u32);
            uploads.push(Upload {
                key: Tile::new(TileLevel::Hash(level as u8), total / TILE_WIDTH, entries.len() as u16)
                    .path(),
                data: hashes_to_bytes(entries),
                opts: UploadOptions::immutable(),
            });
        }
        uploads
    }
}

fn hashes_to_bytes(hashes: &[Hash]) -> Vec<u8> {
    let mut data = Vec::with_capacity(hashes.len() * HASH_SIZE);
    for h in hashes {
        data.extend_from_slice(&h.0);
    }
    data
}

/// Reconstructs the tree state from the object store, verifying the
/// recomputed root against the stored checkpoint. Returns `None` if the log
/// has not been created yet.
pub(crate) async fn load<O: ObjectStore>(
    reader: &LogReader<O>,
    store: &O,
    verifiers: &VerifierList,
    origin: &str,
) -> anyhow::Result<Option<(TreeState, UnixTimestamp)>> {
    let Some(raw) = store.fetch(CHECKPOINT_KEY).await? else {
        return Ok(None);
    };
    let (checkpoint, timestamp) = tlog::open_checkpoint(origin, verifiers, &raw)
        .map_err(|e| anyhow!("failed to open stored checkpoint: {e}"))?;
    let size = checkpoint.size();

    let mut state = TreeState::new();
    if size == 0 {
        return Ok(Some((state, timestamp.unwrap_or_default())));
    }

    // The frontier is the base-256 decomposition of the size: each level's
    // partial tile holds (size >> 8l) % 256 perfect-subtree roots. Feed them
    // into the compact range from the highest level down.
    let mut top = 0u8;
    while (size >> (8 * (u32::from(top) + 1))) > 0 {
        top += 1;
    }
    state.levels = vec![Vec::new(); usize::from(top) + 1];
    for level in (0..=top).rev() {
        let total = size >> (8 * u32::from(level));
        let width = (total % TILE_WIDTH) as u16;
        if width == 0 {
            continue;
        }
        let data = reader
            .read_tile(level, total / TILE_WIDTH, size)
            .await
            .with_context(|| format!("loading frontier tile at level {level}"))?;
        if data.len() < usize::from(width) * HASH_SIZE {
            bail!("frontier tile at level {level} is truncated");
        }
        let mut entries = Vec::with_capacity(usize::from(width));
        for chunk in data[..usize::from(width) * HASH_SIZE].chunks_exact(HASH_SIZE) {
            entries.push(Hash(chunk.try_into().unwrap()));
        }
        for hash in &entries {
            state
                .range
                .push_subtree(1 << (8 * u32::from(level)), *hash)
                .map_err(|e| anyhow!("bad frontier decomposition: {e}"))?;
        }
        state.levels[usize::from(level)] = entries;
    }

    if state.range.size() != size {
        bail!(
            "frontier covers {} leaves, checkpoint says {size}",
            state.range.size()
        );
    }
    if state.range.root() != *checkpoint.hash() {
        bail!(
            "recomputed root {} does not match checkpoint root {}",
            state.range.root(),
            checkpoint.hash()
        );
    }

    // Reload the partial bundle and verify it against the level-0 frontier.
    // The store may hand back a full bundle if a crash left uploads ahead of
    // the checkpoint; only the covered prefix is carried forward.
    if size % TILE_WIDTH != 0 {
        let mut bundle = reader
            .read_entry_bundle(size / TILE_WIDTH, size)
            .await
            .context("loading frontier entry bundle")?;
        let width = (size % TILE_WIDTH) as usize;
        let covered_len = {
            let mut iter = BundleIterator::new(&bundle, width);
            let mut count = 0;
            for (i, parsed) in iter.by_ref().enumerate() {
                let parsed = parsed.map_err(|e| anyhow!("bad frontier bundle entry {i}: {e}"))?;
                let got = record_hash(&parsed.entry.merkle_tree_leaf());
                if got != state.levels[0][i] {
                    bail!("frontier bundle entry {i} does not match its tile hash");
                }
                count += 1;
            }
            if count != width {
                bail!("frontier bundle holds {count} entries, expected {width}");
            }
            iter.position()
        };
        bundle.truncate(covered_len);
        state.bundle = bundle;
    }

    Ok(Some((state, timestamp.unwrap_or_default())))
}

/// Signs and uploads a checkpoint for the current tree.
pub(crate) async fn publish_checkpoint<O: ObjectStore>(
    store: &O,
    signer: &dyn CheckpointSigner,
    origin: &str,
    state: &TreeState,
) -> anyhow::Result<Vec<u8>> {
    let checkpoint = Checkpoint::new(origin, state.size(), state.root())
        .map_err(|e| anyhow!("malformed checkpoint: {e}"))?;
    let timestamp = now_millis();
    let mut note =
        Note::new(&checkpoint.to_bytes()).map_err(|e| anyhow!("malformed note text: {e}"))?;
    note.add_raw_signature(
        signer
            .sign(timestamp, &checkpoint)
            .map_err(|e| anyhow!("failed to sign checkpoint: {e}"))?,
    );
    let bytes = note.to_bytes();
    store
        .upload(CHECKPOINT_KEY, &bytes, &UploadOptions::checkpoint())
        .await?;
    Ok(bytes)
}

pub(crate) struct IntegratorContext<O> {
    pub(crate) state: TreeState,
    pub(crate) store: Arc<O>,
    pub(crate) signer: Box<dyn CheckpointSigner>,
    pub(crate) opts: AppendOptions,
    pub(crate) antispam: Arc<Antispam>,
    pub(crate) outstanding: Arc<AtomicU64>,
    pub(crate) metrics: SequencerMetrics,
}

/// Consumes assigned batches until the channel closes, integrating entries
/// and publishing checkpoints at most every `checkpoint_interval`.
pub(crate) async fn run_integrator<O: ObjectStore>(
    mut ctx: IntegratorContext<O>,
    mut batch_rx: mpsc::Receiver<AssignedBatch>,
    shutdown: watch::Receiver<bool>,
) {
    let origin = ctx.opts.origin.clone();
    let mut staged: Vec<Upload> = Vec::new();
    let mut dirty: u64 = 0;
    let mut last_publish = Instant::now();

    loop {
        let deadline = last_publish + ctx.opts.checkpoint_interval;
        tokio::select! {
            batch = batch_rx.recv() => match batch {
                Some(batch) => {
                    let started = now_millis();
                    for (i, entry) in batch.entries.iter().enumerate() {
                        ctx.state.append(entry, batch.first_index + i as u64, &mut staged);
                    }
                    dirty += batch.entries.len() as u64;
                    ctx.metrics
                        .seq_batch_size
                        .observe(batch.entries.len() as f64);
                    debug!(
                        "{origin}: integrated batch; first_index={}, entries={}, duration_ms={}",
                        batch.first_index,
                        batch.entries.len(),
                        now_millis() - started,
                    );
                }
                None => {
                    // The sequencer is gone; publish whatever is left.
                    if dirty > 0 {
                        publish(&ctx, &mut staged, &mut dirty, &shutdown).await;
                    }
                    info!("{origin}: integrator stopped; size={}", ctx.state.size());
                    return;
                }
            },
            () = tokio::time::sleep_until(deadline), if dirty > 0 => {
                let started = now_millis();
                publish(&ctx, &mut staged, &mut dirty, &shutdown).await;
                last_publish = Instant::now();
                ctx.metrics
                    .seq_duration
                    .observe((now_millis() - started) as f64 / 1e3);
            }
        }
    }
}

/// Uploads staged tiles, frontier partials, and a fresh checkpoint. Storage
/// errors are retried: the entries' futures already resolved, so the only
/// way forward is through.
async fn publish<O: ObjectStore>(
    ctx: &IntegratorContext<O>,
    staged: &mut Vec<Upload>,
    dirty: &mut u64,
    shutdown: &watch::Receiver<bool>,
) {
    let origin = &ctx.opts.origin;
    for upload in staged.drain(..).chain(ctx.state.partial_uploads()) {
        if !upload_with_retry(ctx.store.as_ref(), &upload, origin, shutdown).await {
            return;
        }
        ctx.metrics.seq_tiles.inc();
    }
    loop {
        match publish_checkpoint(ctx.store.as_ref(), ctx.signer.as_ref(), origin, &ctx.state).await
        {
            Ok(_) => break,
            Err(e) => {
                warn!("{origin}: checkpoint publication failed, retrying: {e:#}");
                if retry_pause(shutdown).await {
                    return;
                }
            }
        }
    }

    let size = ctx.state.size();
    ctx.antispam.note_published(size);
    ctx.outstanding.fetch_sub(*dirty, Ordering::Relaxed);
    ctx.metrics.tree_size.set(size as f64);
    ctx.metrics.tree_time.set(now_millis() as f64 / 1e3);
    info!("{origin}: published checkpoint; size={size}, new_entries={dirty}");
    *dirty = 0;
}

async fn upload_with_retry<O: ObjectStore>(
    store: &O,
    upload: &Upload,
    origin: &str,
    shutdown: &watch::Receiver<bool>,
) -> bool {
    loop {
        match store.upload(&upload.key, &upload.data, &upload.opts).await {
            Ok(()) => return true,
            Err(e) => {
                warn!("{origin}: upload of {} failed, retrying: {e:#}", upload.key);
                if retry_pause(shutdown).await {
                    return false;
                }
            }
        }
    }
}

// Returns true if shutdown was requested during the pause.
async fn retry_pause(shutdown: &watch::Receiver<bool>) -> bool {
    let mut shutdown = shutdown.clone();
    tokio::select! {
        _ = shutdown.changed() => true,
        () = tokio::time::sleep(Duration::from_secs(1)) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(i: u64) -> Entry {
        Entry {
            timestamp: 1_700_000_000_000 + i,
            certificate: i.to_be_bytes().to_vec(),
            chain_fingerprints: vec![[0xaa; 32]],
            ..Entry::default()
        }
    }

    #[test]
    fn test_tree_state_roots_match_naive() {
        let mut state = TreeState::new();
        let mut uploads = Vec::new();
        let mut leaf_hashes = Vec::new();
        for i in 0..600u64 {
            let e = entry(i);
            leaf_hashes.push(record_hash(&e.merkle_tree_leaf()));
            state.append(&e, i, &mut uploads);
            assert_eq!(state.size(), i + 1);
            assert_eq!(state.root(), tree_hash(&leaf_hashes));
        }
        // 600 leaves: two full bundles, two full level-0 tiles. A completed
        // level-0 tile is staged before the bundle that shares its boundary.
        let full_keys: Vec<&str> = uploads.iter().map(|u| u.key.as_str()).collect();
        assert_eq!(
            full_keys,
            vec!["tile/0/000", "tile/data/000", "tile/0/001", "tile/data/001"]
        );
        // Frontier: partial bundle and partial tiles at levels 0 and 1.
        let mut partial_keys: Vec<String> =
            state.partial_uploads().into_iter().map(|u| u.key).collect();
        partial_keys.sort();
        assert_eq!(
            partial_keys,
            vec!["tile/0/002.p/88", "tile/1/000.p/2", "tile/data/002.p/88"]
        );
    }

    #[test]
    fn test_tree_state_level_cascade() {
        // 65536 leaves complete a level-1 tile.
        let mut state = TreeState::new();
        let mut uploads = Vec::new();
        let e = entry(7);
        for i in 0..65536u64 {
            state.append(&e, i, &mut uploads);
        }
        assert!(uploads.iter().any(|u| u.key == "tile/1/000"));
        assert_eq!(state.levels[0].len(), 0);
        assert_eq!(state.levels[1].len(), 0);
        assert_eq!(state.levels[2].len(), 1);
    }
}
