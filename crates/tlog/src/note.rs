// Copyright (c) 2025 Cloudflare, Inc.
// Licensed under the BSD-3-Clause license found in the LICENSE file or at https://opensource.org/licenses/BSD-3-Clause

//! Signed notes, per the [C2SP signed-note](https://c2sp.org/signed-note)
//! specification.
//!
//! A note is a UTF-8 text ending in a newline, followed by a blank line,
//! followed by one or more signature lines:
//!
//! ```text
//! <text>
//!
//! — <name> <base64(key-id || signature)>
//! ```
//!
//! The key ID is the big-endian first four bytes of
//! `SHA-256(name || '\n' || signature-type || public-key)`. Signature
//! algorithms are pluggable through the [`NoteSigner`] and [`NoteVerifier`]
//! traits; the checkpoint signature type used by this workspace lives in the
//! `static_ct` crate.

use crate::TlogError;
use base64::prelude::*;
use sha2::{Digest, Sha256};
use std::collections::HashMap;

const MAX_NOTE_SIZE: usize = 1_000_000;
const MAX_NOTE_SIGNATURES: usize = 100;

/// The signature-line marker: an em dash and a space.
const SIG_PREFIX: &str = "\u{2014} ";

/// A signer produces note signatures under one named key.
pub trait NoteSigner {
    /// The server name associated with the key. Must be non-empty with no
    /// Unicode spaces or pluses.
    fn name(&self) -> &str;

    /// The 32-bit key ID.
    fn key_id(&self) -> u32;

    /// Signs the note text (including its final newline).
    ///
    /// # Errors
    ///
    /// Returns an error if signing fails.
    fn sign(&self, msg: &[u8]) -> Result<Vec<u8>, signature::Error>;
}

/// A verifier checks note signatures made under one named key.
pub trait NoteVerifier {
    /// The server name associated with the key.
    fn name(&self) -> &str;

    /// The 32-bit key ID.
    fn key_id(&self) -> u32;

    /// Reports whether `sig` is a valid signature over `msg`.
    fn verify(&self, msg: &[u8], sig: &[u8]) -> bool;

    /// Extracts the Unix timestamp in milliseconds embedded in the signature,
    /// for signature types that carry one.
    ///
    /// # Errors
    ///
    /// Returns an error if the signature is malformed.
    fn extract_timestamp_millis(&self, _sig: &[u8]) -> Result<Option<u64>, TlogError> {
        Ok(None)
    }
}

/// Computes the key ID for the given server name and encoded public key, as
/// recommended at <https://c2sp.org/signed-note#signatures>.
pub fn key_id(name: &str, key: &[u8]) -> u32 {
    let mut hasher = Sha256::new();
    hasher.update(name.as_bytes());
    hasher.update(b"\n");
    hasher.update(key);
    let digest = hasher.finalize();
    u32::from_be_bytes(digest[..4].try_into().unwrap())
}

/// Reports whether `name` is a valid key name: non-empty, no Unicode spaces,
/// no pluses.
pub fn is_key_name_valid(name: &str) -> bool {
    !(name.is_empty() || name.chars().any(char::is_whitespace) || name.contains('+'))
}

/// A single signature line of a note, verified or not.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NoteSignature {
    name: String,
    id: u32,
    signature: Vec<u8>,
}

impl NoteSignature {
    /// Returns a new signature for the given key name and ID.
    pub fn new(name: String, id: u32, signature: Vec<u8>) -> Self {
        Self { name, id, signature }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    /// The raw signature bytes, without the key-id prefix.
    pub fn signature(&self) -> &[u8] {
        &self.signature
    }

    /// Parses a signature line without its trailing newline.
    fn from_line(line: &str) -> Result<Self, TlogError> {
        let rest = line.strip_prefix(SIG_PREFIX).ok_or(TlogError::MalformedNote)?;
        let (name, b64) = rest.split_once(' ').ok_or(TlogError::MalformedNote)?;
        if !is_key_name_valid(name) {
            return Err(TlogError::InvalidKeyName);
        }
        let blob = BASE64_STANDARD.decode(b64)?;
        if blob.len() < 5 {
            return Err(TlogError::MalformedNote);
        }
        let id = u32::from_be_bytes(blob[..4].try_into().unwrap());
        Ok(Self {
            name: name.to_string(),
            id,
            signature: blob[4..].to_vec(),
        })
    }

    /// Encodes the signature line, without a trailing newline.
    fn to_line(&self) -> String {
        let mut blob = Vec::with_capacity(4 + self.signature.len());
        blob.extend_from_slice(&self.id.to_be_bytes());
        blob.extend_from_slice(&self.signature);
        format!("{SIG_PREFIX}{} {}", self.name, BASE64_STANDARD.encode(blob))
    }
}

/// A text with zero or more signatures.
#[derive(Debug)]
pub struct Note {
    text: Vec<u8>,
    sigs: Vec<NoteSignature>,
}

impl Note {
    /// Returns a new unsigned note with the given text.
    ///
    /// # Errors
    ///
    /// Returns an error if the text is empty, does not end in a newline, is
    /// not UTF-8, or contains control characters other than newline.
    pub fn new(text: &[u8]) -> Result<Self, TlogError> {
        if !valid_text(text) {
            return Err(TlogError::MalformedNote);
        }
        Ok(Self {
            text: text.to_vec(),
            sigs: Vec::new(),
        })
    }

    /// The note text, including its final newline.
    pub fn text(&self) -> &[u8] {
        &self.text
    }

    pub fn signatures(&self) -> &[NoteSignature] {
        &self.sigs
    }

    /// Appends a signature produced by the given signer.
    ///
    /// # Errors
    ///
    /// Returns an error if the signer's key name is invalid or signing fails.
    pub fn add_signature(&mut self, signer: &dyn NoteSigner) -> Result<(), TlogError> {
        if !is_key_name_valid(signer.name()) {
            return Err(TlogError::InvalidKeyName);
        }
        let sig = signer.sign(&self.text)?;
        self.sigs
            .push(NoteSignature::new(signer.name().to_string(), signer.key_id(), sig));
        Ok(())
    }

    /// Appends an externally produced signature.
    pub fn add_raw_signature(&mut self, sig: NoteSignature) {
        self.sigs.push(sig);
    }

    /// Parses a signed note.
    ///
    /// # Errors
    ///
    /// Returns an error if the input is not a syntactically valid note.
    pub fn from_bytes(b: &[u8]) -> Result<Self, TlogError> {
        if b.len() > MAX_NOTE_SIZE {
            return Err(TlogError::MalformedNote);
        }
        let s = std::str::from_utf8(b).map_err(|_| TlogError::MalformedNote)?;
        // The text and the signature block are separated by a blank line.
        let (text, sig_block) = s.split_once("\n\n").ok_or(TlogError::MalformedNote)?;
        let text = format!("{text}\n").into_bytes();
        if !valid_text(&text) {
            return Err(TlogError::MalformedNote);
        }
        if !sig_block.ends_with('\n') {
            return Err(TlogError::MalformedNote);
        }
        let mut sigs = Vec::new();
        for line in sig_block[..sig_block.len() - 1].split('\n') {
            sigs.push(NoteSignature::from_line(line)?);
            if sigs.len() > MAX_NOTE_SIGNATURES {
                return Err(TlogError::TooManySignatures);
            }
        }
        if sigs.is_empty() {
            return Err(TlogError::MalformedNote);
        }
        Ok(Self { text, sigs })
    }

    /// Encodes the note in signed-note format.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = self.text.clone();
        out.push(b'\n');
        for sig in &self.sigs {
            out.extend_from_slice(sig.to_line().as_bytes());
            out.push(b'\n');
        }
        out
    }

    /// Verifies the note's signatures against the given verifiers, returning
    /// the signatures that verified.
    ///
    /// # Errors
    ///
    /// Returns an error if a signature matching a known `(name, key ID)` pair
    /// fails verification, or if no known signature is present.
    pub fn verify(&self, verifiers: &VerifierList) -> Result<Vec<&NoteSignature>, TlogError> {
        let mut verified = Vec::new();
        for sig in &self.sigs {
            // Unknown keys are ignored so that notes stay forward-compatible
            // with new signers.
            if let Some(v) = verifiers.get(sig.name(), sig.id()) {
                if !v.verify(&self.text, sig.signature()) {
                    return Err(TlogError::InvalidSignature);
                }
                verified.push(sig);
            }
        }
        if verified.is_empty() {
            return Err(TlogError::MissingVerifierSignature);
        }
        Ok(verified)
    }
}

fn valid_text(text: &[u8]) -> bool {
    let Ok(s) = std::str::from_utf8(text) else {
        return false;
    };
    !s.is_empty()
        && s.ends_with('\n')
        && !s.chars().any(|c| c.is_control() && c != '\n')
}

/// A set of verifiers, looked up by `(name, key ID)`.
pub struct VerifierList {
    map: HashMap<(String, u32), Box<dyn NoteVerifier>>,
}

impl VerifierList {
    pub fn new(verifiers: Vec<Box<dyn NoteVerifier>>) -> Self {
        let mut map = HashMap::new();
        for v in verifiers {
            map.insert((v.name().to_string(), v.key_id()), v);
        }
        Self { map }
    }

    pub fn get(&self, name: &str, id: u32) -> Option<&dyn NoteVerifier> {
        self.map.get(&(name.to_string(), id)).map(AsRef::as_ref)
    }
}
