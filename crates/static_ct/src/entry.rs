// Copyright (c) 2025 Cloudflare, Inc.
// Licensed under the BSD-3-Clause license found in the LICENSE file or at https://opensource.org/licenses/BSD-3-Clause

//! Log entries and their wire encodings.
//!
//! An [`Entry`] is the canonical committed form of a submission: for final
//! certificates the leaf DER, for precertificates the defanged TBS plus the
//! raw precert and the effective issuer's key hash. Entries serialize three
//! ways:
//!
//! - the RFC 6962 `MerkleTreeLeaf`, which is what gets hashed into the tree;
//! - the static-CT `TileLeaf`, which is what entry bundles store;
//! - the identity prefix, whose SHA-256 is the deduplication key.
//!
//! Entry construction from a validated chain lives here too, so that the
//! derivation is a pure function of its inputs: identical submissions yield
//! byte-identical entries and therefore the same log index.

use crate::{build_precert_tbs, StaticCTError, ValidatedChain};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io::{Cursor, Read};
use tlog::UnixTimestamp;
use x509_cert::der::Encode;

/// Maximum size of a certificate or TBS in an entry, bounded by the 24-bit
/// length prefix of the wire format.
pub const MAX_CERTIFICATE_SIZE: usize = (1 << 24) - 1;

/// The deduplication key for an entry: SHA-256 over its identity prefix.
pub type IdentityHash = [u8; 32];

/// A log entry, either committed or about to be.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    /// True for precertificate entries.
    pub is_precert: bool,

    /// Milliseconds since the epoch, assigned when the submission was
    /// admitted to the sequencing queue.
    pub timestamp: UnixTimestamp,

    /// The leaf DER for certificates, or the defanged `TBSCertificate` for
    /// precertificates.
    pub certificate: Vec<u8>,

    /// The raw submitted precertificate DER. Empty unless `is_precert`.
    pub precertificate: Vec<u8>,

    /// SHA-256 of the effective issuer's `SubjectPublicKeyInfo`. Zero unless
    /// `is_precert`.
    pub issuer_key_hash: [u8; 32],

    /// SHA-256 fingerprints of the issuing chain above the leaf, excluding
    /// any CT pre-issuer.
    pub chain_fingerprints: Vec<[u8; 32]>,
}

impl Entry {
    /// The RFC 6962 `signed_entry` prefix: entry type, issuer key hash for
    /// precerts, and the length-prefixed certificate. This is both the core
    /// of the SCT signature input and the basis of the identity hash.
    fn write_signed_entry(&self, buf: &mut Vec<u8>) {
        if self.is_precert {
            buf.write_u16::<BigEndian>(1).unwrap(); // entry_type = precert_entry
            buf.extend_from_slice(&self.issuer_key_hash);
        } else {
            buf.write_u16::<BigEndian>(0).unwrap(); // entry_type = x509_entry
        }
        write_length_prefixed(buf, &self.certificate, 3);
    }

    /// The RFC 6962 `TimestampedEntry`. Extensions are always empty.
    fn write_timestamped_entry(&self, buf: &mut Vec<u8>) {
        buf.write_u64::<BigEndian>(self.timestamp).unwrap();
        self.write_signed_entry(buf);
        buf.write_u16::<BigEndian>(0).unwrap(); // extensions = empty
    }

    /// Returns the serialized [RFC 6962
    /// `MerkleTreeLeaf`](https://datatracker.ietf.org/doc/html/rfc6962#section-3.4)
    /// for this entry, whose record hash is the entry's leaf in the tree.
    pub fn merkle_tree_leaf(&self) -> Vec<u8> {
        let mut buf = vec![
            0, // version = v1 (0)
            0, // leaf_type = timestamped_entry (0)
        ];
        self.write_timestamped_entry(&mut buf);
        buf
    }

    /// Returns the serialized [static-CT
    /// `TileLeaf`](https://c2sp.org/static-ct-api#log-entries) for this
    /// entry, as stored in entry bundles.
    pub fn bundle_leaf(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.write_timestamped_entry(&mut buf);
        if self.is_precert {
            write_length_prefixed(&mut buf, &self.precertificate, 3);
        }
        write_length_prefixed(&mut buf, &self.chain_fingerprints.concat(), 2);
        buf
    }

    /// The deduplication key: SHA-256 over the `signed_entry` prefix. The
    /// timestamp is deliberately excluded so that resubmissions of the same
    /// (pre)certificate collide.
    pub fn identity_hash(&self) -> IdentityHash {
        let mut buf = Vec::with_capacity(self.certificate.len() + 64);
        self.write_signed_entry(&mut buf);
        Sha256::digest(&buf).into()
    }
}

/// Builds the canonical [`Entry`] for a validated chain.
///
/// For precertificates this computes the defanged TBS (poison removed, and
/// for pre-issuer chains the Issuer and AKI rewritten to the final issuer)
/// and hashes the effective issuer's key. The derivation is deterministic:
/// the same chain always produces the same bytes, regardless of timestamp.
///
/// # Errors
///
/// Returns [`StaticCTError::NoIssuer`] if a precert chain has no issuer
/// above the leaf, [`StaticCTError::NoFinalIssuer`] if a pre-issuer has no
/// parent in the chain, and TBS reconstruction errors from
/// [`build_precert_tbs`].
pub fn build_entry(
    chain: &ValidatedChain,
    timestamp: UnixTimestamp,
) -> Result<Entry, StaticCTError> {
    let mut entry = Entry {
        timestamp,
        ..Entry::default()
    };

    // Fingerprint the issuing chain, skipping the pre-issuer.
    for (i, issuer) in chain.issuers.iter().enumerate() {
        if chain.pre_issuer_idx == Some(i) {
            continue;
        }
        entry
            .chain_fingerprints
            .push(Sha256::digest(issuer.to_der()?).into());
    }

    if chain.is_precert {
        let pre_issuer = match chain.pre_issuer_idx {
            Some(i) => {
                if chain.issuers.len() <= i + 1 {
                    return Err(StaticCTError::NoFinalIssuer);
                }
                Some(&chain.issuers[i])
            }
            None => None,
        };
        let effective_issuer = match chain.pre_issuer_idx {
            Some(i) => &chain.issuers[i],
            None => chain.issuers.first().ok_or(StaticCTError::NoIssuer)?,
        };
        entry.is_precert = true;
        entry.issuer_key_hash = Sha256::digest(
            effective_issuer
                .tbs_certificate
                .subject_public_key_info
                .to_der()?,
        )
        .into();
        entry.precertificate = chain.leaf.to_der()?;
        entry.certificate = build_precert_tbs(
            &chain.leaf.tbs_certificate,
            pre_issuer.map(|c| &c.tbs_certificate),
        )?;
    } else {
        entry.certificate = chain.leaf.to_der()?;
    }

    if entry.certificate.len() > MAX_CERTIFICATE_SIZE
        || entry.precertificate.len() > MAX_CERTIFICATE_SIZE
    {
        return Err(StaticCTError::InvalidLength);
    }

    Ok(entry)
}

/// An iterator over the entries of a serialized entry bundle. Parses up to
/// `width` entries, stopping early at a clean end of input: a reader that
/// expected a partial bundle may be handed the full one if the tree grew in
/// between, and the surplus entries are simply not yielded to it.
pub struct BundleIterator<'a> {
    cur: Cursor<&'a [u8]>,
    width: usize,
    parsed: usize,
}

/// A parsed bundle entry. Indices are positional: the `i`-th entry of
/// bundle `k` is leaf `256k + i`.
#[derive(Debug)]
pub struct BundleEntry {
    pub entry: Entry,
}

impl<'a> BundleIterator<'a> {
    /// Returns an iterator over the `width` entries of `bundle`.
    pub fn new(bundle: &'a [u8], width: usize) -> Self {
        Self {
            cur: Cursor::new(bundle),
            width,
            parsed: 0,
        }
    }

    /// The byte offset of the first unparsed entry.
    pub fn position(&self) -> usize {
        usize::try_from(self.cur.position()).unwrap()
    }

    fn parse_next(&mut self) -> Result<BundleEntry, StaticCTError> {
        let mut entry = Entry {
            timestamp: self.cur.read_u64::<BigEndian>()?,
            ..Entry::default()
        };
        let entry_type = self.cur.read_u16::<BigEndian>()?;
        match entry_type {
            0 => {}
            1 => {
                entry.is_precert = true;
                self.cur.read_exact(&mut entry.issuer_key_hash)?;
            }
            _ => return Err(StaticCTError::UnknownType),
        }
        entry.certificate = read_length_prefixed(&mut self.cur, 3)?;
        // Extensions are opaque here and empty as written by this log.
        read_length_prefixed(&mut self.cur, 2)?;
        if entry.is_precert {
            entry.precertificate = read_length_prefixed(&mut self.cur, 3)?;
        }
        let fingerprints = read_length_prefixed(&mut self.cur, 2)?;

        if fingerprints.len() % 32 != 0 {
            return Err(StaticCTError::InvalidLength);
        }
        for chunk in fingerprints.chunks_exact(32) {
            entry.chain_fingerprints.push(chunk.try_into().unwrap());
        }

        Ok(BundleEntry { entry })
    }
}

impl Iterator for BundleIterator<'_> {
    type Item = Result<BundleEntry, StaticCTError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.parsed == self.width
            || self.cur.position() == self.cur.get_ref().len() as u64
        {
            return None;
        }
        let item = self.parse_next();
        self.parsed += 1;
        Some(item)
    }
}

/// Extracts the timestamp of the `n`-th entry in a serialized entry bundle,
/// skipping over preceding entries without parsing or allocating.
///
/// # Errors
///
/// Returns an error if the bundle is truncated or contains an unknown entry
/// type before the requested entry.
pub fn extract_timestamp_from_bundle(bundle: &[u8], n: u64) -> Result<u64, StaticCTError> {
    fn take<'a>(bundle: &'a [u8], off: &mut usize, len: usize) -> Result<&'a [u8], StaticCTError> {
        let end = off.checked_add(len).ok_or(StaticCTError::InvalidLength)?;
        let out = bundle.get(*off..end).ok_or(StaticCTError::InvalidLength)?;
        *off = end;
        Ok(out)
    }
    fn skip_length_prefixed(
        bundle: &[u8],
        off: &mut usize,
        len_bytes: usize,
    ) -> Result<(), StaticCTError> {
        let mut len: usize = 0;
        for b in take(bundle, off, len_bytes)? {
            len = len << 8 | usize::from(*b);
        }
        take(bundle, off, len)?;
        Ok(())
    }

    let mut off: usize = 0;
    for _ in 0..n {
        take(bundle, &mut off, 8)?; // timestamp
        let entry_type = u16::from_be_bytes(take(bundle, &mut off, 2)?.try_into().unwrap());
        match entry_type {
            0 => {}
            1 => {
                take(bundle, &mut off, 32)?; // issuer_key_hash
            }
            _ => return Err(StaticCTError::UnknownType),
        }
        skip_length_prefixed(bundle, &mut off, 3)?; // certificate
        skip_length_prefixed(bundle, &mut off, 2)?; // extensions
        if entry_type == 1 {
            skip_length_prefixed(bundle, &mut off, 3)?; // precertificate
        }
        skip_length_prefixed(bundle, &mut off, 2)?; // fingerprints
    }

    let ts = take(bundle, &mut off, 8)?;
    Ok(u64::from_be_bytes(ts.try_into().unwrap()))
}

fn write_length_prefixed(buf: &mut Vec<u8>, data: &[u8], len_bytes: usize) {
    buf.write_uint::<BigEndian>(data.len() as u64, len_bytes)
        .unwrap();
    buf.extend_from_slice(data);
}

fn read_length_prefixed(
    cur: &mut Cursor<&[u8]>,
    len_bytes: usize,
) -> Result<Vec<u8>, std::io::Error> {
    let len = cur.read_uint::<BigEndian>(len_bytes)?;
    let mut buf = vec![0; usize::try_from(len).unwrap()];
    cur.read_exact(&mut buf)?;
    Ok(buf)
}
