// Copyright (c) 2025 Cloudflare, Inc.
// Licensed under the BSD-3-Clause license found in the LICENSE file or at https://opensource.org/licenses/BSD-3-Clause

//! Storage traits and the built-in backends.
//!
//! The pipeline is written against [`ObjectStore`], a minimal
//! upload/fetch/put-if-absent capability set. Cloud drivers implement the
//! same surface out of tree; in tree there is an in-memory store for tests
//! and a directory-backed store whose layout is directly servable as the
//! log's static read path.

use crate::CHECKPOINT_KEY;
use anyhow::{anyhow, Context};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tlog::{tile_width, Tile, TileLevel};

/// Upload options, recorded per object class.
#[derive(Clone, Debug, Default)]
pub struct UploadOptions {
    /// MIME type of the data. Defaults to `application/octet-stream`.
    pub content_type: Option<String>,
    /// True if the object is never rewritten after upload, so the read path
    /// may cache it forever.
    pub immutable: bool,
}

impl UploadOptions {
    pub fn immutable() -> Self {
        Self {
            content_type: None,
            immutable: true,
        }
    }

    pub fn checkpoint() -> Self {
        Self {
            content_type: Some("text/plain; charset=utf-8".to_string()),
            immutable: false,
        }
    }
}

/// A write-mostly object store holding the log's public assets.
pub trait ObjectStore: Send + Sync + 'static {
    /// Writes an object, replacing any existing one.
    fn upload(
        &self,
        key: &str,
        data: &[u8],
        opts: &UploadOptions,
    ) -> impl std::future::Future<Output = anyhow::Result<()>> + Send;

    /// Reads an object, returning `None` if it does not exist.
    fn fetch(
        &self,
        key: &str,
    ) -> impl std::future::Future<Output = anyhow::Result<Option<Vec<u8>>>> + Send;

    /// Writes an object only if the key is vacant. Returns whether a write
    /// happened; an existing object is left untouched.
    fn upload_if_absent(
        &self,
        key: &str,
        data: &[u8],
        opts: &UploadOptions,
    ) -> impl std::future::Future<Output = anyhow::Result<bool>> + Send;
}

/// An in-memory [`ObjectStore`] for tests and experimentation.
#[derive(Default)]
pub struct MemoryObjectStore {
    objects: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// All stored keys, sorted. Handy for asserting on upload layouts.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.objects.read().keys().cloned().collect();
        keys.sort();
        keys
    }
}

impl ObjectStore for MemoryObjectStore {
    async fn upload(&self, key: &str, data: &[u8], _opts: &UploadOptions) -> anyhow::Result<()> {
        self.objects
            .write()
            .insert(key.to_string(), data.to_vec());
        Ok(())
    }

    async fn fetch(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>> {
        Ok(self.objects.read().get(key).cloned())
    }

    async fn upload_if_absent(
        &self,
        key: &str,
        data: &[u8],
        _opts: &UploadOptions,
    ) -> anyhow::Result<bool> {
        let mut objects = self.objects.write();
        if objects.contains_key(key) {
            return Ok(false);
        }
        objects.insert(key.to_string(), data.to_vec());
        Ok(true)
    }
}

/// A directory-backed [`ObjectStore`]. Objects are plain files under the
/// root, so the log's read path can be served by any static file server
/// pointed at the same directory.
pub struct DirObjectStore {
    root: PathBuf,
}

impl DirObjectStore {
    /// Opens (and creates, if needed) the store rooted at `root`.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub fn new(root: PathBuf) -> anyhow::Result<Self> {
        std::fs::create_dir_all(&root)
            .with_context(|| format!("failed to create object store root {}", root.display()))?;
        Ok(Self { root })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }
}

impl ObjectStore for DirObjectStore {
    async fn upload(&self, key: &str, data: &[u8], _opts: &UploadOptions) -> anyhow::Result<()> {
        let path = self.path_for(key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        // Write-then-rename so readers never observe a torn object.
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, data).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn fetch(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>> {
        match tokio::fs::read(self.path_for(key)).await {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn upload_if_absent(
        &self,
        key: &str,
        data: &[u8],
        opts: &UploadOptions,
    ) -> anyhow::Result<bool> {
        if tokio::fs::try_exists(self.path_for(key)).await? {
            return Ok(false);
        }
        self.upload(key, data, opts).await?;
        Ok(true)
    }
}

/// Read access to the log's published state: `{ReadCheckpoint, ReadTile,
/// ReadEntryBundle}`.
pub struct LogReader<O> {
    store: Arc<O>,
}

impl<O> Clone for LogReader<O> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
        }
    }
}

impl<O: ObjectStore> LogReader<O> {
    pub fn new(store: Arc<O>) -> Self {
        Self { store }
    }

    /// Reads the latest published checkpoint note.
    ///
    /// # Errors
    ///
    /// Returns an error on storage failure or if no checkpoint exists.
    pub async fn read_checkpoint(&self) -> anyhow::Result<Vec<u8>> {
        self.store
            .fetch(CHECKPOINT_KEY)
            .await?
            .ok_or_else(|| anyhow!("no checkpoint in object storage"))
    }

    /// Reads a hash tile, choosing the partial path when the tree frontier
    /// truncates it.
    ///
    /// # Errors
    ///
    /// Returns an error on storage failure or if the tile does not exist.
    pub async fn read_tile(&self, level: u8, index: u64, tree_size: u64) -> anyhow::Result<Vec<u8>> {
        self.read(TileLevel::Hash(level), index, level_width(tree_size, level, index))
            .await
    }

    /// Reads the entry bundle at `index`, choosing the partial path when the
    /// tree frontier truncates it.
    ///
    /// # Errors
    ///
    /// Returns an error on storage failure or if the bundle does not exist.
    pub async fn read_entry_bundle(&self, index: u64, tree_size: u64) -> anyhow::Result<Vec<u8>> {
        self.read(TileLevel::Entries, index, tile_width(tree_size, index))
            .await
    }

    async fn read(&self, level: TileLevel, index: u64, width: u16) -> anyhow::Result<Vec<u8>> {
        if width == 0 {
            return Err(anyhow!("tile {level:?}/{index} is beyond the tree"));
        }
        // A full tile may exist even when the width math says partial, if the
        // tree has since grown: prefer it, it is a superset.
        let full = Tile::new(level, index, tlog::TILE_WIDTH as u16);
        if let Some(data) = self.store.fetch(&full.path()).await? {
            return Ok(data);
        }
        let tile = Tile::new(level, index, width);
        self.store
            .fetch(&tile.path())
            .await?
            .ok_or_else(|| anyhow!("missing object: {}", tile.path()))
    }
}

/// The number of populated entries in hash tile `(level, index)` for a tree
/// of `tree_size` leaves.
fn level_width(tree_size: u64, level: u8, index: u64) -> u16 {
    // Entries at tile level L are roots of 256^L leaves each.
    let shift = 8 * u32::from(level);
    if shift >= u64::BITS {
        return 0;
    }
    tile_width(tree_size >> shift, index)
}
