// Copyright (c) 2025 Cloudflare, Inc.
// Licensed under the BSD-3-Clause license found in the LICENSE file or at https://opensource.org/licenses/BSD-3-Clause

//! Primitives for tile-based transparency logs: RFC 6962 Merkle tree hashing,
//! compact ranges, the [tlog-tiles](https://c2sp.org/tlog-tiles) tile layout,
//! the [tlog-checkpoint](https://c2sp.org/tlog-checkpoint) format, and
//! [signed notes](https://c2sp.org/signed-note).

pub mod checkpoint;
pub mod note;
pub mod tile;
pub mod tree;

pub use checkpoint::*;
pub use note::*;
pub use tile::*;
pub use tree::*;

/// Unix timestamp in milliseconds since the epoch, ignoring leap seconds.
/// Unsigned because the log never deals with times before 1970.
pub type UnixTimestamp = u64;

#[derive(thiserror::Error, Debug)]
pub enum TlogError {
    #[error("malformed hash")]
    MalformedHash,
    #[error("malformed checkpoint")]
    MalformedCheckpoint,
    #[error("malformed note")]
    MalformedNote,
    #[error("note has too many signatures")]
    TooManySignatures,
    #[error("missing verifier signature")]
    MissingVerifierSignature,
    #[error("invalid note signature")]
    InvalidSignature,
    #[error("checkpoint origin does not match")]
    OriginMismatch,
    #[error("invalid key name")]
    InvalidKeyName,
    #[error("subtree size is not a power of two")]
    UnalignedSubtree,
    #[error(transparent)]
    InvalidBase64(#[from] base64::DecodeError),
    #[error(transparent)]
    Signature(#[from] signature::Error),
}
