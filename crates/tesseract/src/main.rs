// Copyright (c) 2025 Cloudflare, Inc.
// Licensed under the BSD-3-Clause license found in the LICENSE file or at https://opensource.org/licenses/BSD-3-Clause

//! The TesseraCT server binary.

use anyhow::Context;
use clap::Parser;
use log::{info, warn};
use prometheus::Registry;
use static_ct::CtCheckpointSigner;
use std::sync::Arc;
use tesseract::{
    router, AppState, CTStorage, CTStorageOptions, CachedIssuers, Flags, HttpMetrics,
    ObjectIssuerStore,
};
use tessera::{AppendOptions, Appender, DirObjectStore};
use tokio::net::TcpListener;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let flags = Flags::parse();
    let config = flags
        .validate()
        .context("invalid configuration")?;

    let registry = Registry::new();
    let store = Arc::new(
        DirObjectStore::new(flags.storage_dir.clone()).context("opening storage directory")?,
    );
    let signer = CtCheckpointSigner::new(&flags.origin, config.signing_key.clone())
        .map_err(|e| anyhow::anyhow!("building checkpoint signer: {e}"))?;

    let (appender, reader) = Appender::new(
        Arc::clone(&store),
        Box::new(signer),
        AppendOptions {
            origin: flags.origin.clone(),
            batch_max_size: flags.batch_max_size,
            batch_max_age: flags.batch_max_age,
            checkpoint_interval: flags.checkpoint_interval,
            pushback_max_outstanding: flags.pushback_max_outstanding,
            antispam_cache_size: config.antispam_cache_size,
            pushback_max_antispam_lag: flags.pushback_max_antispam_lag,
            ..AppendOptions::default()
        },
        &registry,
    )
    .await
    .context("loading log")?;

    let issuers = CachedIssuers::new(ObjectIssuerStore::new(Arc::clone(&store)));
    let storage = CTStorage::new(
        appender,
        reader,
        issuers,
        CTStorageOptions {
            enable_publication_awaiter: flags.enable_publication_awaiter,
            max_dedupe_in_flight: flags.pushback_max_dedupe_in_flight,
            http_deadline: flags.http_deadline,
            ..CTStorageOptions::default()
        },
    );

    let state = Arc::new(AppState {
        storage,
        roots: config.roots,
        policy: config.policy,
        signing_key: config.signing_key,
        metrics: HttpMetrics::new(&registry),
        mask_internal_errors: flags.mask_internal_errors,
    });
    let app = router(Arc::clone(&state), &flags.path_prefix);

    let listener = TcpListener::bind(&flags.http_endpoint)
        .await
        .with_context(|| format!("binding {}", flags.http_endpoint))?;
    info!(
        "{}: serving on http://{}",
        flags.origin,
        listener.local_addr()?
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    info!("{}: draining", flags.origin);
    state.storage.shutdown();
    // Give the sequencer and integrator a moment to flush and publish.
    tokio::time::sleep(std::time::Duration::from_secs(1)).await;
    info!("{}: shut down", flags.origin);
    Ok(())
}

/// Resolves when SIGINT or SIGTERM arrives.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("failed to install SIGINT handler: {e}");
            std::future::pending::<()>().await;
        }
    };
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };
    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
    warn!("signal received, shutting down");
}
