// Copyright (c) 2025 Cloudflare, Inc.
// Licensed under the BSD-3-Clause license found in the LICENSE file or at https://opensource.org/licenses/BSD-3-Clause

//! Support for the [Static CT API](https://c2sp.org/static-ct-api): the log
//! entry wire formats, submission chain validation per RFC 6962, precert
//! TBS reconstruction, and SCT / checkpoint signing with ECDSA P-256.

pub mod entry;
pub mod precert;
pub mod sct;
pub mod validate;

#[cfg(any(test, feature = "testutil"))]
pub mod testutil;

pub use entry::*;
pub use precert::*;
pub use sct::*;
pub use validate::*;

/// An error raised while handling a static-CT submission or wire structure.
#[derive(thiserror::Error, Debug)]
pub enum StaticCTError {
    // Submission parsing and chain structure.
    #[error(transparent)]
    Der(#[from] der::Error),
    #[error("empty chain")]
    EmptyChain,
    #[error("invalid leaf certificate")]
    InvalidLeaf,
    #[error("signature algorithm does not match TBS signature algorithm")]
    MismatchedSigAlg,
    #[error("invalid link in chain")]
    InvalidLinkInChain,
    #[error("intermediate missing CA basic constraint")]
    IntermediateMissingCaBasicConstraint,
    #[error("issuer not in root store: {0}")]
    UntrustedRoot(String),
    #[error(
        "{}certificate submitted to add-{}chain",
        if *.is_precert { "pre-" } else { "final " },
        if *.is_precert { "" } else { "pre-" }
    )]
    EndpointMismatch { is_precert: bool },

    // Policy.
    #[error("leaf certificate is expired")]
    Expired,
    #[error("leaf certificate is unexpired")]
    Unexpired,
    #[error("leaf NotAfter is outside the accepted window")]
    NotAfterOutsideWindow,
    #[error("leaf contains a rejected extension: {0}")]
    RejectedExtension(der::oid::ObjectIdentifier),
    #[error("leaf extended key usage not allowed")]
    DisallowedExtKeyUsage,

    // Precertificates.
    #[error("CT poison extension is not critical or invalid")]
    InvalidCTPoison,
    #[error("missing CT poison extension")]
    MissingPoison,
    #[error("multiple CT poison extensions")]
    DuplicatePoison,
    #[error("chain contains no issuer for the leaf")]
    NoIssuer,
    #[error("precertificate signing certificate has no issuer in the chain")]
    NoFinalIssuer,

    // Configuration.
    #[error("origin is not a valid checkpoint key name")]
    InvalidOrigin,
    #[error("unknown extended key usage: {0}")]
    UnknownExtKeyUsage(String),
    #[error("failed to parse RejectExtensions: {0}")]
    InvalidOid(String),

    // Wire formats.
    #[error("unknown entry type")]
    UnknownType,
    #[error("invalid length")]
    InvalidLength,
    #[error(transparent)]
    IO(#[from] std::io::Error),
    #[error(transparent)]
    Spki(#[from] x509_verify::spki::Error),
    #[error(transparent)]
    Signature(#[from] signature::Error),
}

impl StaticCTError {
    /// Whether this error is the submitter's fault (a 4xx) rather than the
    /// log's.
    pub fn is_client_error(&self) -> bool {
        !matches!(
            self,
            StaticCTError::IO(_) | StaticCTError::Spki(_) | StaticCTError::Signature(_)
        )
    }
}
