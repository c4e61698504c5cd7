// Copyright (c) 2025 Cloudflare, Inc.
// Licensed under the BSD-3-Clause license found in the LICENSE file or at https://opensource.org/licenses/BSD-3-Clause

//! TesseraCT: a [static-CT-API](https://c2sp.org/static-ct-api) Certificate
//! Transparency log server.
//!
//! Submissions enter through the HTTP handlers, are validated against the
//! configured trust store and policy, turned into canonical log entries, and
//! handed to the append pipeline alongside a content-addressed write of the
//! issuing chain. Duplicates resolve to their originally committed index and
//! timestamp, so resubmitting a certificate always yields the same SCT.

pub mod config;
pub mod http;
pub mod issuers;
pub mod metrics;
pub mod storage;

pub use config::*;
pub use http::*;
pub use issuers::*;
pub use metrics::*;
pub use storage::*;
