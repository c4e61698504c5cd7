// Copyright (c) 2025 Cloudflare, Inc.
// Licensed under the BSD-3-Clause license found in the LICENSE file or at https://opensource.org/licenses/BSD-3-Clause

//! The publication awaiter: blocking until a leaf index is covered by a
//! published checkpoint.
//!
//! One ticker polls the stored checkpoint on a fixed cadence, snapshots the
//! tree size, and broadcasts it; every waiter whose index is now covered
//! wakes at once. There is deliberately no per-waiter polling task.

use crate::{LogReader, ObjectStore, TesseraError};
use log::warn;
use std::time::Duration;
use tlog::{Checkpoint, Note};
use tokio::sync::watch;
use tokio::time::Instant;

/// The latest observation of the published checkpoint.
#[derive(Clone, Default)]
struct Published {
    size: u64,
    checkpoint: Vec<u8>,
}

/// Blocks callers until the published tree covers their index.
pub struct PublicationAwaiter {
    rx: watch::Receiver<Published>,
}

impl PublicationAwaiter {
    /// Starts the checkpoint poller and returns the awaiter. The poller
    /// stops when `shutdown` flips.
    pub fn new<O: ObjectStore>(
        reader: LogReader<O>,
        poll_interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> Self {
        let (tx, rx) = watch::channel(Published::default());
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => return,
                    () = tokio::time::sleep(poll_interval) => {}
                }
                match poll_once(&reader).await {
                    Ok(Some(published)) => {
                        if published.size > tx.borrow().size {
                            let _ = tx.send(published);
                        }
                    }
                    Ok(None) => {}
                    Err(e) => warn!("checkpoint poller: {e:#}"),
                }
            }
        });
        Self { rx }
    }

    /// Waits until the published tree size exceeds `index`, returning the
    /// tree size and the raw checkpoint note that first covered it.
    ///
    /// # Errors
    ///
    /// Returns [`TesseraError::DeadlineExceeded`] if `deadline` passes
    /// first, or [`TesseraError::ShuttingDown`] if the poller stopped.
    pub async fn await_index(
        &self,
        index: u64,
        deadline: Instant,
    ) -> Result<(u64, Vec<u8>), TesseraError> {
        let mut rx = self.rx.clone();
        let result = match tokio::time::timeout_at(
            deadline,
            rx.wait_for(|published| published.size > index),
        )
        .await
        {
            Ok(Ok(published)) => Ok((published.size, published.checkpoint.clone())),
            Ok(Err(_)) => Err(TesseraError::ShuttingDown),
            Err(_) => Err(TesseraError::DeadlineExceeded),
        };
        result
    }

    /// The most recently observed published size.
    pub fn published_size(&self) -> u64 {
        self.rx.borrow().size
    }
}

async fn poll_once<O: ObjectStore>(reader: &LogReader<O>) -> anyhow::Result<Option<Published>> {
    let raw = match reader.read_checkpoint().await {
        Ok(raw) => raw,
        Err(_) => return Ok(None), // log not created yet
    };
    let note = Note::from_bytes(&raw).map_err(|e| anyhow::anyhow!("bad checkpoint note: {e}"))?;
    let checkpoint =
        Checkpoint::from_bytes(note.text()).map_err(|e| anyhow::anyhow!("bad checkpoint: {e}"))?;
    Ok(Some(Published {
        size: checkpoint.size(),
        checkpoint: raw,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{MemoryObjectStore, UploadOptions, CHECKPOINT_KEY};
    use std::sync::Arc;

    fn checkpoint_note(size: u64) -> Vec<u8> {
        use base64::prelude::*;
        // An unverified note is enough for the awaiter, which only parses.
        // The signature is a key id plus an opaque blob.
        let body = format!("example.com/log\n{size}\n{}\n", tlog::record_hash(b"root"));
        let sig = BASE64_STANDARD.encode([0, 0, 0, 1, 0xab, 0xcd]);
        format!("{body}\n\u{2014} example.com/log {sig}\n").into_bytes()
    }

    #[tokio::test]
    async fn test_awaiter_resolves_when_covered() {
        let store = Arc::new(MemoryObjectStore::new());
        store
            .upload(CHECKPOINT_KEY, &checkpoint_note(3), &UploadOptions::checkpoint())
            .await
            .unwrap();
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let awaiter = PublicationAwaiter::new(
            LogReader::new(Arc::clone(&store)),
            Duration::from_millis(10),
            shutdown_rx,
        );

        // Index 2 is covered by size 3.
        let (size, raw) = awaiter
            .await_index(2, Instant::now() + Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(size, 3);
        assert_eq!(raw, checkpoint_note(3));

        // Index 5 is not covered until a bigger checkpoint lands.
        let waiter = awaiter.await_index(5, Instant::now() + Duration::from_secs(5));
        store
            .upload(CHECKPOINT_KEY, &checkpoint_note(10), &UploadOptions::checkpoint())
            .await
            .unwrap();
        let (size, _) = waiter.await.unwrap();
        assert_eq!(size, 10);
    }

    #[tokio::test]
    async fn test_awaiter_deadline() {
        let store = Arc::new(MemoryObjectStore::new());
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let awaiter = PublicationAwaiter::new(
            LogReader::new(store),
            Duration::from_millis(10),
            shutdown_rx,
        );
        let err = awaiter
            .await_index(0, Instant::now() + Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, TesseraError::DeadlineExceeded));
    }
}
