// Copyright (c) 2025 Cloudflare, Inc.
// Licensed under the BSD-3-Clause license found in the LICENSE file or at https://opensource.org/licenses/BSD-3-Clause

//! RFC 6962 Merkle tree hashing over an append-only sequence of records.
//!
//! The tree is never materialized. Writers carry a [`CompactRange`]: the
//! minimal set of perfect-subtree roots covering the leaves `[0, size)`.
//! Appending a leaf merges completed siblings, and the tree head for any
//! size is a right-to-left fold over the frontier. This is all a sequencer
//! needs to extend the log and sign checkpoints; readers that want proofs
//! recompute them from tiles.

use crate::TlogError;
use base64::prelude::*;
use sha2::{Digest, Sha256};
use std::fmt;

/// Size of a [`Hash`] in bytes.
pub const HASH_SIZE: usize = 32;

/// Root hash of the empty tree: `SHA-256()`.
pub const EMPTY_TREE_HASH: Hash = Hash([
    0xe3, 0xb0, 0xc4, 0x42, 0x98, 0xfc, 0x1c, 0x14, 0x9a, 0xfb, 0xf4, 0xc8, 0x99, 0x6f, 0xb9,
    0x24, 0x27, 0xae, 0x41, 0xe4, 0x64, 0x9b, 0x93, 0x4c, 0xa4, 0x95, 0x99, 0x1b, 0x78, 0x52,
    0xb8, 0x55,
]);

/// A hash identifying a log record or tree node.
#[derive(Copy, Clone, Default, PartialEq, Eq, Hash)]
pub struct Hash(pub [u8; HASH_SIZE]);

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", BASE64_STANDARD.encode(self.0))
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self}")
    }
}

impl Hash {
    /// Decodes a hash from its base64 encoding.
    ///
    /// # Errors
    ///
    /// Returns an error if the input is not base64 or decodes to the wrong
    /// length.
    pub fn parse(s: &str) -> Result<Self, TlogError> {
        let data = BASE64_STANDARD.decode(s)?;
        Ok(Hash(data.try_into().map_err(|_| TlogError::MalformedHash)?))
    }

    /// Decodes a hash from a raw byte slice.
    ///
    /// # Errors
    ///
    /// Returns an error if the slice is not exactly [`HASH_SIZE`] bytes.
    pub fn from_slice(b: &[u8]) -> Result<Self, TlogError> {
        Ok(Hash(b.try_into().map_err(|_| TlogError::MalformedHash)?))
    }
}

/// Returns the leaf hash for the given record data:
/// `SHA-256(0x00 || data)` per RFC 6962 §2.1.
pub fn record_hash(data: &[u8]) -> Hash {
    let mut hasher = Sha256::new();
    hasher.update([0x00]);
    hasher.update(data);
    Hash(hasher.finalize().into())
}

/// Returns the hash for an interior node with the given children:
/// `SHA-256(0x01 || left || right)` per RFC 6962 §2.1.
pub fn node_hash(left: Hash, right: Hash) -> Hash {
    let mut hasher = Sha256::new();
    hasher.update([0x01]);
    hasher.update(left.0);
    hasher.update(right.0);
    Hash(hasher.finalize().into())
}

/// The Merkle tree head over the given leaf hashes, computed by direct
/// recursion. Linear in memory; intended for verification and tests, not for
/// serving traffic (the sequencer uses [`CompactRange`]).
pub fn tree_hash(leaf_hashes: &[Hash]) -> Hash {
    match leaf_hashes.len() {
        0 => EMPTY_TREE_HASH,
        1 => leaf_hashes[0],
        n => {
            // Split at the largest power of two strictly smaller than n.
            let k = 1 << (usize::ilog2(n - 1));
            node_hash(tree_hash(&leaf_hashes[..k]), tree_hash(&leaf_hashes[k..]))
        }
    }
}

/// The minimal forest of perfect-subtree roots covering leaves `[0, size)`.
///
/// Frontier entries are kept left to right with strictly decreasing sizes,
/// each size a power of two (the binary decomposition of `size`). Pushing a
/// subtree whose size equals the rightmost entry merges the pair into their
/// parent, exactly like binary carry propagation.
#[derive(Clone, Debug, Default)]
pub struct CompactRange {
    size: u64,
    // (subtree size, subtree root), sizes strictly decreasing.
    frontier: Vec<(u64, Hash)>,
}

impl CompactRange {
    /// Returns an empty range.
    pub fn new() -> Self {
        Self::default()
    }

    /// The number of leaves covered by this range.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Appends a single record hash.
    pub fn push_leaf(&mut self, leaf_hash: Hash) {
        // A single leaf is a perfect subtree of size one.
        self.push_subtree_unchecked(1, leaf_hash);
    }

    /// Appends the root of a perfect subtree of `n` leaves. The subtree must
    /// be no larger than the rightmost frontier entry, i.e. subtrees must be
    /// appended in the order they appear along the tree's right edge.
    ///
    /// # Errors
    ///
    /// Returns an error if `n` is not a power of two, or if appending `n`
    /// leaves here would not form a perfect subtree at this position.
    pub fn push_subtree(&mut self, n: u64, root: Hash) -> Result<(), TlogError> {
        if n == 0 || !n.is_power_of_two() || self.size % n != 0 {
            return Err(TlogError::UnalignedSubtree);
        }
        if let Some(&(top, _)) = self.frontier.last() {
            if n > top {
                return Err(TlogError::UnalignedSubtree);
            }
        }
        self.push_subtree_unchecked(n, root);
        Ok(())
    }

    fn push_subtree_unchecked(&mut self, n: u64, root: Hash) {
        self.frontier.push((n, root));
        self.size += n;
        // Merge completed sibling pairs.
        while self.frontier.len() >= 2 {
            let (rn, right) = self.frontier[self.frontier.len() - 1];
            let (ln, left) = self.frontier[self.frontier.len() - 2];
            if ln != rn {
                break;
            }
            self.frontier.truncate(self.frontier.len() - 2);
            self.frontier.push((ln + rn, node_hash(left, right)));
        }
    }

    /// The RFC 6962 tree head over the covered leaves.
    pub fn root(&self) -> Hash {
        let mut iter = self.frontier.iter().rev();
        let Some(&(_, mut hash)) = iter.next() else {
            return EMPTY_TREE_HASH;
        };
        for &(_, left) in iter {
            hash = node_hash(left, hash);
        }
        hash
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_tree_hash() {
        assert_eq!(EMPTY_TREE_HASH.0, <[u8; 32]>::from(Sha256::digest([])));
        assert_eq!(tree_hash(&[]), EMPTY_TREE_HASH);
        assert_eq!(CompactRange::new().root(), EMPTY_TREE_HASH);
    }

    // Known-answer vectors from RFC 6962 §2.1.3 / the certificate-transparency
    // test suite, over the inputs "", "\x00", "\x10", "\x20\x21", "\x30\x31",
    // "\x40\x41\x42\x43", ...
    #[test]
    fn test_known_roots() {
        let inputs: Vec<Vec<u8>> = vec![
            vec![],
            vec![0x00],
            vec![0x10],
            vec![0x20, 0x21],
            vec![0x30, 0x31],
            vec![0x40, 0x41, 0x42, 0x43],
            vec![0x50, 0x51, 0x52, 0x53, 0x54, 0x55, 0x56, 0x57],
            vec![
                0x60, 0x61, 0x62, 0x63, 0x64, 0x65, 0x66, 0x67, 0x68, 0x69, 0x6a, 0x6b, 0x6c,
                0x6d, 0x6e, 0x6f,
            ],
        ];
        let roots = [
            "6e340b9cffb37a989ca544e6bb780a2c78901d3fb33738768511a30617afa01d",
            "fac54203e7cc696cf0dfcb42c92a1d9dbaf70ad9e621f4bd8d98662f00e3c125",
            "aeb6bcfe274b70a14fb067a5e5578264db0fa9b51af5e0ba159158f329e06e77",
            "d37ee418976dd95753c1c73862b9398fa2a2cf9b4ff0fdfe8b30cd95209614b7",
            "4e3bbb1f7b478dcfe71fb631631519a3bca12c9aefca1612bfce4c13a86264d4",
            "76e67dadbcdf1e10e1b74ddc608abd2f98dfb16fbce75277b5232a127f2087ef",
            "ddb89be403809e325750d3d263cd78929c2942b7942a34b77e122c9594a74c8c",
            "5dc9da79a70659a9ad559cb701ded9a2ab9d823aad2f4960cfe370eff4604328",
        ];
        for (want, inputs) in roots.iter().zip((1..=inputs.len()).map(|n| &inputs[..n])) {
            let hashes: Vec<Hash> = inputs.iter().map(|d| record_hash(d)).collect();
            assert_eq!(hex::encode(tree_hash(&hashes).0), *want);

            let mut range = CompactRange::new();
            for h in &hashes {
                range.push_leaf(*h);
            }
            assert_eq!(range.size(), inputs.len() as u64);
            assert_eq!(hex::encode(range.root().0), *want);
        }
    }

    #[test]
    fn test_compact_range_matches_naive() {
        let mut hashes = Vec::new();
        let mut range = CompactRange::new();
        // Span several tile boundaries.
        for i in 0..1000u64 {
            let h = record_hash(&i.to_be_bytes());
            hashes.push(h);
            range.push_leaf(h);
            assert_eq!(range.root(), tree_hash(&hashes), "size {}", i + 1);
        }
    }

    #[test]
    fn test_push_subtree() {
        let leaves: Vec<Hash> = (0..640u64).map(|i| record_hash(&i.to_be_bytes())).collect();

        // Rebuild the range from the frontier decomposition of 640 = 512 + 128.
        let mut range = CompactRange::new();
        range.push_subtree(512, tree_hash(&leaves[..512])).unwrap();
        range.push_subtree(128, tree_hash(&leaves[512..])).unwrap();
        assert_eq!(range.size(), 640);
        assert_eq!(range.root(), tree_hash(&leaves));

        // Growing subtrees and unaligned positions are rejected.
        let mut range = CompactRange::new();
        range.push_subtree(128, tree_hash(&leaves[..128])).unwrap();
        assert!(range.push_subtree(256, EMPTY_TREE_HASH).is_err());
        assert!(range.push_subtree(3, EMPTY_TREE_HASH).is_err());
    }

    #[test]
    fn test_hash_parse_roundtrip() {
        let h = record_hash(b"hello world");
        let h2 = Hash::parse(&h.to_string()).unwrap();
        assert_eq!(h, h2);
        assert!(Hash::parse("not base64!").is_err());
        assert!(Hash::parse("AAAA").is_err()); // wrong length
    }
}
