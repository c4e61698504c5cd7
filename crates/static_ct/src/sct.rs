// Copyright (c) 2025 Cloudflare, Inc.
// Licensed under the BSD-3-Clause license found in the LICENSE file or at https://opensource.org/licenses/BSD-3-Clause

//! SCT issuance and checkpoint signing with ECDSA P-256.
//!
//! Signatures are deterministic (RFC 6979), so reissuing an SCT for a
//! deduplicated submission with the recovered timestamp and index produces
//! bytes identical to the original response.

use crate::{Entry, StaticCTError};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use p256::{
    ecdsa::{
        signature::{Signer, Verifier},
        Signature as EcdsaSignature, SigningKey as EcdsaSigningKey,
        VerifyingKey as EcdsaVerifyingKey,
    },
    pkcs8::EncodePublicKey,
};
use serde::{Deserialize, Serialize};
use serde_with::{base64::Base64, serde_as};
use sha2::{Digest, Sha256};
use std::io::{Cursor, Read};
use tlog::{
    key_id, Checkpoint, CheckpointSigner, NoteSignature, NoteVerifier, TlogError, UnixTimestamp,
};

/// The signed-note signature-type byte for RFC 6962 checkpoint signatures,
/// per <https://c2sp.org/static-ct-api#checkpoints>.
const SIG_TYPE_RFC6962: u8 = 0x05;

/// Add-(pre-)chain request body.
#[serde_as]
#[derive(Deserialize, Serialize)]
pub struct AddChainRequest {
    #[serde_as(as = "Vec<Base64>")]
    pub chain: Vec<Vec<u8>>,
}

/// Add-(pre-)chain response body: a serialized SCT.
#[serde_as]
#[derive(Serialize, Deserialize)]
pub struct AddChainResponse {
    pub sct_version: u8,
    #[serde_as(as = "Base64")]
    pub id: Vec<u8>,
    pub timestamp: UnixTimestamp,
    #[serde_as(as = "Base64")]
    pub extensions: Vec<u8>,
    #[serde_as(as = "Base64")]
    pub signature: Vec<u8>,
}

/// Get-roots response body.
#[serde_as]
#[derive(Serialize, Deserialize)]
pub struct GetRootsResponse {
    #[serde_as(as = "Vec<Base64>")]
    pub certificates: Vec<Vec<u8>>,
}

/// Computes the log ID: SHA-256 over the DER `SubjectPublicKeyInfo` of the
/// log's public key.
///
/// # Errors
///
/// Returns an error if the key fails to encode.
pub fn log_id_from_key(vkey: &EcdsaVerifyingKey) -> Result<[u8; 32], StaticCTError> {
    let spki = vkey.to_public_key_der()?;
    Ok(Sha256::digest(&spki).into())
}

/// Signs and serializes the SCT for a sequenced entry. Signatures are
/// deterministic, so reissuing for a deduplicated entry with its recovered
/// timestamp reproduces the original response byte for byte.
///
/// # Errors
///
/// Returns an error if the public key fails to encode.
pub fn signed_certificate_timestamp(
    signing_key: &EcdsaSigningKey,
    entry: &Entry,
) -> Result<AddChainResponse, StaticCTError> {
    // digitally-signed struct {
    //     Version sct_version;
    //     SignatureType signature_type = certificate_timestamp;
    //     uint64 timestamp;
    //     LogEntryType entry_type;
    //     select(entry_type) { ... } signed_entry;
    //     CtExtensions extensions;
    // };
    // The serialized MerkleTreeLeaf is that struct with its first two bytes
    // replaced, so reuse it rather than marshaling twice.
    let mut buf = entry.merkle_tree_leaf();
    buf[0] = 0; // sct_version = v1 (0)
    buf[1] = 0; // signature_type = certificate_timestamp (0)

    Ok(AddChainResponse {
        sct_version: 0,
        id: log_id_from_key(signing_key.verifying_key())?.to_vec(),
        timestamp: entry.timestamp,
        extensions: Vec::new(),
        signature: digitally_signed(signing_key, &buf),
    })
}

/// Produces an encoded digitally-signed signature as defined in RFC 5246
/// §4.7: hash algorithm, signature algorithm, and the length-prefixed DER
/// ECDSA signature.
pub fn digitally_signed(signing_key: &EcdsaSigningKey, msg: &[u8]) -> Vec<u8> {
    let sig: EcdsaSignature = signing_key.sign(msg);
    let sig_der = sig.to_der();
    let sig_bytes = sig_der.as_bytes();

    let mut out = Vec::with_capacity(4 + sig_bytes.len());
    out.push(4); // hash = sha256
    out.push(3); // signature = ecdsa
    out.write_u16::<BigEndian>(u16::try_from(sig_bytes.len()).unwrap())
        .unwrap();
    out.extend_from_slice(sig_bytes);
    out
}

/// Serializes the RFC 6962 §3.5 `TreeHeadSignature` input.
fn tree_head_signature_input(timestamp: u64, tree_size: u64, root_hash: &tlog::Hash) -> Vec<u8> {
    let mut buf = Vec::with_capacity(50);
    buf.push(0); // version = v1 (0)
    buf.push(1); // signature_type = tree_hash (1)
    buf.write_u64::<BigEndian>(timestamp).unwrap();
    buf.write_u64::<BigEndian>(tree_size).unwrap();
    buf.extend_from_slice(&root_hash.0);
    buf
}

/// Signs checkpoints with the log's P-256 key in the static-CT note
/// signature format:
///
/// ```text
/// struct {
///     uint64 timestamp;
///     TreeHeadSignature signature;
/// } RFC6962NoteSignature;
/// ```
pub struct CtCheckpointSigner {
    name: String,
    id: u32,
    signing_key: EcdsaSigningKey,
}

impl CtCheckpointSigner {
    /// Returns a new signer whose key name is the log origin.
    ///
    /// # Errors
    ///
    /// Returns an error if the origin is not a valid key name or the public
    /// key fails to encode.
    pub fn new(origin: &str, signing_key: EcdsaSigningKey) -> Result<Self, StaticCTError> {
        let id = rfc6962_key_id(origin, signing_key.verifying_key())?;
        Ok(Self {
            name: origin.to_string(),
            id,
            signing_key,
        })
    }
}

impl CheckpointSigner for CtCheckpointSigner {
    fn name(&self) -> &str {
        &self.name
    }

    fn key_id(&self) -> u32 {
        self.id
    }

    fn sign(
        &self,
        timestamp: UnixTimestamp,
        checkpoint: &Checkpoint,
    ) -> Result<NoteSignature, TlogError> {
        let sth = tree_head_signature_input(timestamp, checkpoint.size(), checkpoint.hash());
        let mut sig = Vec::with_capacity(80);
        sig.write_u64::<BigEndian>(timestamp).unwrap();
        sig.extend(digitally_signed(&self.signing_key, &sth));
        Ok(NoteSignature::new(self.name.clone(), self.id, sig))
    }

    fn verifier(&self) -> Box<dyn NoteVerifier> {
        Box::new(CtCheckpointVerifier {
            name: self.name.clone(),
            id: self.id,
            verifying_key: *self.signing_key.verifying_key(),
        })
    }
}

/// Verifies static-CT checkpoint note signatures.
#[derive(Clone)]
pub struct CtCheckpointVerifier {
    name: String,
    id: u32,
    verifying_key: EcdsaVerifyingKey,
}

impl CtCheckpointVerifier {
    /// Returns a new verifier for the given origin and log public key.
    ///
    /// # Errors
    ///
    /// Returns an error if the origin is not a valid key name or the key
    /// fails to encode.
    pub fn new(origin: &str, verifying_key: &EcdsaVerifyingKey) -> Result<Self, StaticCTError> {
        Ok(Self {
            name: origin.to_string(),
            id: rfc6962_key_id(origin, verifying_key)?,
            verifying_key: *verifying_key,
        })
    }
}

impl NoteVerifier for CtCheckpointVerifier {
    fn name(&self) -> &str {
        &self.name
    }

    fn key_id(&self) -> u32 {
        self.id
    }

    fn verify(&self, msg: &[u8], sig: &[u8]) -> bool {
        let Ok(checkpoint) = Checkpoint::from_bytes(msg) else {
            return false;
        };
        let mut cur = Cursor::new(sig);
        let Ok(timestamp) = cur.read_u64::<BigEndian>() else {
            return false;
        };
        if !matches!(cur.read_u8(), Ok(4)) {
            return false; // hash algorithm must be sha256
        }
        if !matches!(cur.read_u8(), Ok(3)) {
            return false; // signature algorithm must be ecdsa
        }
        let Ok(len) = cur.read_u16::<BigEndian>() else {
            return false;
        };
        let mut der = vec![0; usize::from(len)];
        if cur.read_exact(&mut der).is_err() || cur.position() != sig.len() as u64 {
            return false;
        }
        let Ok(signature) = EcdsaSignature::from_der(&der) else {
            return false;
        };
        let sth = tree_head_signature_input(timestamp, checkpoint.size(), checkpoint.hash());
        self.verifying_key.verify(&sth, &signature).is_ok()
    }

    fn extract_timestamp_millis(&self, sig: &[u8]) -> Result<Option<u64>, TlogError> {
        let timestamp = Cursor::new(sig)
            .read_u64::<BigEndian>()
            .map_err(|_| TlogError::MalformedNote)?;
        Ok(Some(timestamp))
    }
}

fn rfc6962_key_id(origin: &str, vkey: &EcdsaVerifyingKey) -> Result<u32, StaticCTError> {
    if !tlog::is_key_name_valid(origin) {
        return Err(StaticCTError::InvalidOrigin);
    }
    let spki = vkey.to_public_key_der()?;
    let key_hash = Sha256::digest(&spki);
    let mut id_input = Vec::with_capacity(33);
    id_input.push(SIG_TYPE_RFC6962);
    id_input.extend_from_slice(&key_hash);
    Ok(key_id(origin, &id_input))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tlog::{open_checkpoint, record_hash, Note, VerifierList};

    fn test_key() -> EcdsaSigningKey {
        EcdsaSigningKey::from_slice(&[42u8; 32]).unwrap()
    }

    #[test]
    fn test_sct_roundtrip() {
        let key = test_key();
        let entry = Entry {
            is_precert: false,
            timestamp: 1_700_000_000_000,
            certificate: b"leaf der".to_vec(),
            ..Entry::default()
        };
        let sct = signed_certificate_timestamp(&key, &entry).unwrap();
        assert_eq!(sct.sct_version, 0);
        assert_eq!(sct.timestamp, entry.timestamp);
        assert_eq!(sct.id, log_id_from_key(key.verifying_key()).unwrap());
        assert!(sct.extensions.is_empty());

        // Deterministic signatures: the same entry signs to the same bytes.
        let sct2 = signed_certificate_timestamp(&key, &entry).unwrap();
        assert_eq!(sct.signature, sct2.signature);

        // The signature verifies over the reconstructed input.
        let mut cur = Cursor::new(&sct.signature[..]);
        assert_eq!(cur.read_u8().unwrap(), 4);
        assert_eq!(cur.read_u8().unwrap(), 3);
        let len = cur.read_u16::<BigEndian>().unwrap();
        let mut der = vec![0; usize::from(len)];
        cur.read_exact(&mut der).unwrap();
        let sig = EcdsaSignature::from_der(&der).unwrap();
        let mut msg = entry.merkle_tree_leaf();
        msg[0] = 0;
        msg[1] = 0;
        key.verifying_key().verify(&msg, &sig).unwrap();
    }

    #[test]
    fn test_checkpoint_sign_and_open() {
        let key = test_key();
        let origin = "example.com/test-log";
        let signer = CtCheckpointSigner::new(origin, key.clone()).unwrap();
        let checkpoint = Checkpoint::new(origin, 42, record_hash(b"root")).unwrap();
        let timestamp = 1_700_000_000_000;

        let mut note = Note::new(&checkpoint.to_bytes()).unwrap();
        let sig = signer.sign(timestamp, &checkpoint).unwrap();
        note.add_raw_signature(sig);
        let encoded = note.to_bytes();

        let verifiers = VerifierList::new(vec![signer.verifier()]);
        let (opened, ts) = open_checkpoint(origin, &verifiers, &encoded).unwrap();
        assert_eq!(opened, checkpoint);
        assert_eq!(ts, Some(timestamp));

        // A different origin fails.
        assert!(open_checkpoint("example.com/other", &verifiers, &encoded).is_err());

        // Corrupting the size fails signature verification.
        let tampered = String::from_utf8(encoded).unwrap().replace("\n42\n", "\n43\n");
        assert!(open_checkpoint(origin, &verifiers, tampered.as_bytes()).is_err());
    }
}
