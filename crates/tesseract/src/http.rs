// Copyright (c) 2025 Cloudflare, Inc.
// Licensed under the BSD-3-Clause license found in the LICENSE file or at https://opensource.org/licenses/BSD-3-Clause

//! The HTTP surface: `add-chain`, `add-pre-chain`, `get-roots`, `healthz`,
//! and `metrics`. Static tiles and checkpoints are served by the object
//! store directly, not by this process.

use crate::{metrics::HttpMetrics, AddError, CTStorage, IssuerStore};
use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use log::{debug, warn};
use p256::ecdsa::SigningKey;
use static_ct::{
    build_entry, signed_certificate_timestamp, validate_chain, AddChainRequest, CertPool,
    ChainPolicy, GetRootsResponse, StaticCTError,
};
use std::sync::Arc;
use tessera::{now_millis, ObjectStore};
use x509_cert::der::Encode;

/// Everything the handlers need, shared across requests.
pub struct AppState<O: ObjectStore, I: IssuerStore> {
    pub storage: CTStorage<O, I>,
    pub roots: CertPool,
    pub policy: ChainPolicy,
    pub signing_key: SigningKey,
    pub metrics: HttpMetrics,
    pub mask_internal_errors: bool,
}

/// Builds the server's router. `path_prefix` is prepended to the CT
/// endpoints: `HOST:PATH_PREFIX/ct/v1/ENDPOINT`.
pub fn router<O: ObjectStore, I: IssuerStore>(
    state: Arc<AppState<O, I>>,
    path_prefix: &str,
) -> Router {
    let api = Router::new()
        .route("/ct/v1/add-chain", post(add_chain::<O, I>))
        .route("/ct/v1/add-pre-chain", post(add_pre_chain::<O, I>))
        .route("/ct/v1/get-roots", get(get_roots::<O, I>));

    let prefix = path_prefix.trim_end_matches('/');
    let app = if prefix.is_empty() {
        Router::new().merge(api)
    } else if prefix.starts_with('/') {
        Router::new().nest(prefix, api)
    } else {
        Router::new().nest(&format!("/{prefix}"), api)
    };

    app.route("/healthz", get(healthz))
        .route("/metrics", get(metrics_handler::<O, I>))
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

async fn metrics_handler<O: ObjectStore, I: IssuerStore>(
    State(state): State<Arc<AppState<O, I>>>,
) -> Response {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.encode(),
    )
        .into_response()
}

async fn get_roots<O: ObjectStore, I: IssuerStore>(
    State(state): State<Arc<AppState<O, I>>>,
) -> Response {
    let certificates: Result<Vec<Vec<u8>>, _> =
        state.roots.certs.iter().map(Encode::to_der).collect();
    match certificates {
        Ok(certificates) => Json(GetRootsResponse { certificates }).into_response(),
        Err(e) => internal_error(&state, &format!("encoding roots: {e}")),
    }
}

async fn add_chain<O: ObjectStore, I: IssuerStore>(
    State(state): State<Arc<AppState<O, I>>>,
    Json(req): Json<AddChainRequest>,
) -> Response {
    handle_add(&state, req, false).await
}

async fn add_pre_chain<O: ObjectStore, I: IssuerStore>(
    State(state): State<Arc<AppState<O, I>>>,
    Json(req): Json<AddChainRequest>,
) -> Response {
    handle_add(&state, req, true).await
}

async fn handle_add<O: ObjectStore, I: IssuerStore>(
    state: &AppState<O, I>,
    req: AddChainRequest,
    expect_precert: bool,
) -> Response {
    let endpoint = if expect_precert {
        "add-pre-chain"
    } else {
        "add-chain"
    };
    let start = now_millis();
    state.metrics.req_in_flight.inc();

    let response = handle_add_inner(state, req, expect_precert).await;

    state.metrics.req_in_flight.dec();
    state
        .metrics
        .req_count
        .with_label_values(&[endpoint, response.status().as_str()])
        .inc();
    state
        .metrics
        .req_duration
        .with_label_values(&[endpoint])
        .observe((now_millis().saturating_sub(start)) as f64 / 1e3);
    response
}

async fn handle_add_inner<O: ObjectStore, I: IssuerStore>(
    state: &AppState<O, I>,
    req: AddChainRequest,
    expect_precert: bool,
) -> Response {
    // The submission timestamp is assigned here, at queue admission, and is
    // what gets committed for a new entry.
    let now = now_millis();

    let validated = match validate_chain(&req.chain, &state.roots, &state.policy, expect_precert, now)
    {
        Ok(validated) => validated,
        Err(e) => {
            debug!("rejected submission: {e}");
            return chain_error_response(&e);
        }
    };
    let entry = match build_entry(&validated, now) {
        Ok(entry) => entry,
        Err(e) => {
            debug!("rejected submission while building entry: {e}");
            return chain_error_response(&e);
        }
    };

    let issuers_der: Result<Vec<Vec<u8>>, _> =
        validated.issuers.iter().map(Encode::to_der).collect();
    let issuers_der = match issuers_der {
        Ok(issuers_der) => issuers_der,
        Err(e) => return internal_error(state, &format!("encoding issuers: {e}")),
    };

    // Persist the issuing chain concurrently with sequencing; both must
    // succeed before the SCT promise goes out.
    let (sequenced, issuers_written) = tokio::join!(
        state.storage.add(entry.clone()),
        state.storage.add_issuer_chain(&issuers_der),
    );
    if let Err(e) = issuers_written {
        return add_error_response(state, &e);
    }
    let sequenced = match sequenced {
        Ok(sequenced) => sequenced,
        Err(e) => return add_error_response(state, &e),
    };

    // For duplicates, the SCT must cover the originally committed
    // timestamp. The rest of the entry is identical by determinism, so the
    // reissued SCT matches the one the first submitter got.
    let mut committed = entry;
    committed.timestamp = sequenced.timestamp;
    match signed_certificate_timestamp(&state.signing_key, &committed) {
        Ok(sct) => Json(sct).into_response(),
        Err(e) => internal_error(state, &format!("signing SCT: {e}")),
    }
}

/// Maps a validation error to the response taxonomy tag.
fn taxonomy(e: &StaticCTError) -> &'static str {
    match e {
        StaticCTError::Expired => "policy_rejected/expired",
        StaticCTError::Unexpired => "policy_rejected/unexpired",
        StaticCTError::NotAfterOutsideWindow => "policy_rejected/window",
        StaticCTError::DisallowedExtKeyUsage => "policy_rejected/ekus",
        StaticCTError::RejectedExtension(_) => "policy_rejected/extension",
        StaticCTError::InvalidCTPoison
        | StaticCTError::MissingPoison
        | StaticCTError::DuplicatePoison
        | StaticCTError::EndpointMismatch { .. } => "policy_rejected/poison",
        StaticCTError::UntrustedRoot(_) => "untrusted_root",
        _ => "bad_input",
    }
}

fn chain_error_response(e: &StaticCTError) -> Response {
    if e.is_client_error() {
        (StatusCode::BAD_REQUEST, format!("{}: {e}", taxonomy(e))).into_response()
    } else {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Internal Server Error".to_string(),
        )
            .into_response()
    }
}

fn add_error_response<O: ObjectStore, I: IssuerStore>(
    state: &AppState<O, I>,
    e: &AddError,
) -> Response {
    match e {
        AddError::Pushback(reason) => {
            debug!("pushback: {reason}");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                [(header::RETRY_AFTER, "30")],
                "pushback: retry later".to_string(),
            )
                .into_response()
        }
        AddError::StorageUnavailable(reason) => internal_error(state, reason),
        AddError::Internal(reason) => internal_error(state, reason),
    }
}

fn internal_error<O: ObjectStore, I: IssuerStore>(state: &AppState<O, I>, reason: &str) -> Response {
    warn!("internal error: {reason}");
    let body = if state.mask_internal_errors {
        "Internal Server Error".to_string()
    } else {
        format!("Internal Server Error: {reason}")
    };
    (StatusCode::INTERNAL_SERVER_ERROR, body).into_response()
}
