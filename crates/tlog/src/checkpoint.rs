// Copyright (c) 2025 Cloudflare, Inc.
// Licensed under the BSD-3-Clause license found in the LICENSE file or at https://opensource.org/licenses/BSD-3-Clause

//! Checkpoints: signed tree heads in the
//! [C2SP tlog-checkpoint](https://c2sp.org/tlog-checkpoint) format.
//!
//! The body of a checkpoint is three newline-terminated lines:
//!
//! ```text
//! example.com/origin
//! 923748
//! nND/nri//U0xuHUrYSy0HtMeal2vzD9V4k/BO79C+QeI=
//! ```
//!
//! Static-CT checkpoints carry no extension lines, and this parser rejects
//! them. A published checkpoint is the body wrapped in a signed note.

use crate::{
    is_key_name_valid, Hash, Note, NoteSignature, NoteVerifier, TlogError, UnixTimestamp,
    VerifierList,
};

/// A parsed checkpoint body: the log's commitment to `(origin, size, root)`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Checkpoint {
    origin: String,
    size: u64,
    hash: Hash,
}

impl Checkpoint {
    /// Returns a new checkpoint body.
    ///
    /// # Errors
    ///
    /// Returns an error if the origin is not a valid key name.
    pub fn new(origin: &str, size: u64, hash: Hash) -> Result<Self, TlogError> {
        if !is_key_name_valid(origin) {
            return Err(TlogError::MalformedCheckpoint);
        }
        Ok(Self {
            origin: origin.to_string(),
            size,
            hash,
        })
    }

    /// The log identity baked into the checkpoint.
    pub fn origin(&self) -> &str {
        &self.origin
    }

    /// The number of leaves committed to by this checkpoint.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// The RFC 6962 tree head over leaves `[0, size)`.
    pub fn hash(&self) -> &Hash {
        &self.hash
    }

    /// Encodes the checkpoint body (the note text).
    pub fn to_bytes(&self) -> Vec<u8> {
        format!("{}\n{}\n{}\n", self.origin, self.size, self.hash).into_bytes()
    }

    /// Parses a checkpoint body.
    ///
    /// # Errors
    ///
    /// Returns an error on any deviation from the three-line format,
    /// including non-canonical size encodings and extension lines.
    pub fn from_bytes(text: &[u8]) -> Result<Self, TlogError> {
        let s = std::str::from_utf8(text).map_err(|_| TlogError::MalformedCheckpoint)?;
        let body = s.strip_suffix('\n').ok_or(TlogError::MalformedCheckpoint)?;
        let mut lines = body.split('\n');
        let (Some(origin), Some(size_str), Some(hash_str), None) =
            (lines.next(), lines.next(), lines.next(), lines.next())
        else {
            return Err(TlogError::MalformedCheckpoint);
        };
        let size: u64 = size_str
            .parse()
            .map_err(|_| TlogError::MalformedCheckpoint)?;
        if size_str != size.to_string() {
            return Err(TlogError::MalformedCheckpoint);
        }
        let hash = Hash::parse(hash_str).map_err(|_| TlogError::MalformedCheckpoint)?;
        Self::new(origin, size, hash)
    }
}

/// An object that can produce a note signature for a checkpoint.
///
/// Implementations embed whatever the signature format requires; the log's
/// own signer additionally commits to a timestamp inside the signature.
pub trait CheckpointSigner: Send + Sync {
    /// The key name, which for the log's own key equals the origin.
    fn name(&self) -> &str;

    /// The 32-bit key ID.
    fn key_id(&self) -> u32;

    /// Signs the checkpoint at the given timestamp.
    ///
    /// # Errors
    ///
    /// Returns an error if signing fails.
    fn sign(
        &self,
        timestamp: UnixTimestamp,
        checkpoint: &Checkpoint,
    ) -> Result<NoteSignature, TlogError>;

    /// Returns the verifier for this signer's key.
    fn verifier(&self) -> Box<dyn NoteVerifier>;
}

/// Opens a serialized checkpoint note: verifies its signatures against
/// `verifiers`, parses the body, and checks the origin. Returns the
/// checkpoint along with the timestamp embedded in the log's signature, if
/// any verifier reported one.
///
/// # Errors
///
/// Returns an error if the note or body is malformed, no known signature
/// verifies, or the origin does not match.
pub fn open_checkpoint(
    origin: &str,
    verifiers: &VerifierList,
    b: &[u8],
) -> Result<(Checkpoint, Option<UnixTimestamp>), TlogError> {
    let note = Note::from_bytes(b)?;
    let verified = note.verify(verifiers)?;

    let mut timestamp = None;
    for sig in &verified {
        let v = verifiers
            .get(sig.name(), sig.id())
            .ok_or(TlogError::MissingVerifierSignature)?;
        if let Some(t) = v.extract_timestamp_millis(sig.signature())? {
            timestamp = Some(t);
        }
    }

    let checkpoint = Checkpoint::from_bytes(note.text())?;
    if checkpoint.origin() != origin {
        return Err(TlogError::OriginMismatch);
    }
    Ok((checkpoint, timestamp))
}
