// Copyright (c) 2025 Cloudflare, Inc.
// Licensed under the BSD-3-Clause license found in the LICENSE file or at https://opensource.org/licenses/BSD-3-Clause

//! Content-addressed, write-once storage of issuer certificates.
//!
//! Every certificate above the leaf of an accepted chain is stored under
//! `issuer/<hex(SHA-256(DER))>`. Keys are written at most once; a put that
//! would overwrite identical content is a success no-op, and a put that
//! would overwrite different content is an integrity error.

use anyhow::{anyhow, bail};
use parking_lot::RwLock;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tessera::{ObjectStore, UploadOptions};

/// A CT log references on the order of tens of thousands of unique issuers,
/// so 2^20 cached keys is plenty. If the cache ever fills, caching stops but
/// writes continue.
const MAX_CACHED_ISSUER_KEYS: usize = 1 << 20;

/// An issuer certificate keyed by the hex SHA-256 of its DER.
#[derive(Clone, Debug)]
pub struct IssuerRecord {
    pub key: String,
    pub der: Vec<u8>,
}

impl IssuerRecord {
    pub fn from_der(der: Vec<u8>) -> Self {
        let fingerprint: [u8; 32] = Sha256::digest(&der).into();
        Self {
            key: hex::encode(fingerprint),
            der,
        }
    }
}

/// Write-once storage of issuer certificates: `{AddIssuersIfNotExist}`.
pub trait IssuerStore: Send + Sync + 'static {
    /// Stores each record under its key unless the key already exists.
    /// "Already exists with the same content" is not an error.
    fn add_issuers_if_not_exist(
        &self,
        records: &[IssuerRecord],
    ) -> impl std::future::Future<Output = anyhow::Result<()>> + Send;
}

/// An in-memory issuer store for tests.
#[derive(Default)]
pub struct MemoryIssuerStore {
    map: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryIssuerStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.map.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.read().is_empty()
    }
}

impl IssuerStore for MemoryIssuerStore {
    async fn add_issuers_if_not_exist(&self, records: &[IssuerRecord]) -> anyhow::Result<()> {
        let mut map = self.map.write();
        for record in records {
            map.entry(record.key.clone())
                .or_insert_with(|| record.der.clone());
        }
        Ok(())
    }
}

/// An issuer store backed by an [`ObjectStore`] with put-if-absent.
pub struct ObjectIssuerStore<O> {
    store: Arc<O>,
}

impl<O: ObjectStore> ObjectIssuerStore<O> {
    pub fn new(store: Arc<O>) -> Self {
        Self { store }
    }

    fn opts() -> UploadOptions {
        UploadOptions {
            content_type: Some("application/pkix-cert".to_string()),
            immutable: true,
        }
    }
}

impl<O: ObjectStore> IssuerStore for ObjectIssuerStore<O> {
    async fn add_issuers_if_not_exist(&self, records: &[IssuerRecord]) -> anyhow::Result<()> {
        for record in records {
            let path = format!("issuer/{}", record.key);
            if self
                .store
                .upload_if_absent(&path, &record.der, &Self::opts())
                .await?
            {
                log::info!("observed new issuer; path={path}");
                continue;
            }
            // The key exists: verify the stored bytes are what we would have
            // written. Anything else means the store was corrupted.
            let existing = self
                .store
                .fetch(&path)
                .await?
                .ok_or_else(|| anyhow!("issuer {path} vanished during put"))?;
            if existing != record.der {
                bail!("invalid existing issuer at {path}");
            }
        }
        Ok(())
    }
}

/// A caching wrapper that suppresses redundant backend puts. Only keys are
/// cached, never certificate bytes. A full cache stops caching but never
/// stops writing.
pub struct CachedIssuers<I> {
    inner: I,
    seen: RwLock<HashSet<String>>,
}

impl<I: IssuerStore> CachedIssuers<I> {
    pub fn new(inner: I) -> Self {
        Self {
            inner,
            seen: RwLock::new(HashSet::new()),
        }
    }
}

impl<I: IssuerStore> IssuerStore for CachedIssuers<I> {
    async fn add_issuers_if_not_exist(&self, records: &[IssuerRecord]) -> anyhow::Result<()> {
        let missing: Vec<IssuerRecord> = {
            let seen = self.seen.read();
            records
                .iter()
                .filter(|r| !seen.contains(&r.key))
                .cloned()
                .collect()
        };
        if missing.is_empty() {
            return Ok(());
        }
        self.inner.add_issuers_if_not_exist(&missing).await?;
        let mut seen = self.seen.write();
        for record in &missing {
            if seen.len() >= MAX_CACHED_ISSUER_KEYS {
                log::warn!("issuer key cache full; caching stopped");
                break;
            }
            seen.insert(record.key.clone());
        }
        Ok(())
    }
}
