// Copyright (c) 2025 Cloudflare, Inc.
// Licensed under the BSD-3-Clause license found in the LICENSE file or at https://opensource.org/licenses/BSD-3-Clause

//! Metrics for the sequencing and integration pipeline.

use prometheus::{
    register_counter_vec_with_registry, register_counter_with_registry,
    register_gauge_with_registry, register_histogram_with_registry, Counter, CounterVec, Gauge,
    Histogram, Registry,
};

#[derive(Clone)]
pub struct SequencerMetrics {
    /// Entries submitted, by outcome source (new, pool, cache, pushback).
    pub entry_count: CounterVec,
    /// Entries per sequencing batch.
    pub seq_batch_size: Histogram,
    /// Duration of publication rounds in seconds.
    pub seq_duration: Histogram,
    /// Tiles and bundles uploaded, including partials.
    pub seq_tiles: Counter,
    /// Size of the latest published tree head.
    pub tree_size: Gauge,
    /// Timestamp of the latest published tree head.
    pub tree_time: Gauge,
}

impl SequencerMetrics {
    /// Registers the pipeline metrics with the given registry.
    ///
    /// # Panics
    ///
    /// Panics if metrics with these names are already registered.
    pub fn new(r: &Registry) -> Self {
        let entry_count = register_counter_vec_with_registry!(
            "sequencing_entries_total",
            "Entries submitted to be sequenced, by source.",
            &["source"],
            r
        )
        .unwrap();
        let seq_batch_size = register_histogram_with_registry!(
            "sequencing_batch_entries",
            "Number of entries in flushed batches.",
            vec![1.0, 16.0, 64.0, 256.0, 1024.0, 4096.0],
            r
        )
        .unwrap();
        let seq_duration = register_histogram_with_registry!(
            "sequencing_publish_duration_seconds",
            "Duration of publication rounds, successful or not.",
            vec![0.1, 0.5, 1.0, 2.0, 4.0, 8.0],
            r
        )
        .unwrap();
        let seq_tiles = register_counter_with_registry!(
            "sequencing_uploaded_tiles_total",
            "Number of tiles and bundles uploaded, including partials.",
            r
        )
        .unwrap();
        let tree_size = register_gauge_with_registry!(
            "tree_size_leaves_total",
            "Size of the latest published tree head.",
            r
        )
        .unwrap();
        let tree_time = register_gauge_with_registry!(
            "tree_timestamp_seconds",
            "Timestamp of the latest published tree head.",
            r
        )
        .unwrap();
        Self {
            entry_count,
            seq_batch_size,
            seq_duration,
            seq_tiles,
            tree_size,
            tree_time,
        }
    }
}
