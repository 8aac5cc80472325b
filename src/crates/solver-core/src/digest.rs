//! Content-addressed digests.
//!
//! A [`ContentDigest`] identifies a graph node (an effective [`Vertex`](crate::vertex::Vertex))
//! by the content it depends on: its own description plus, transitively, the digests of its
//! inputs. Two vertices that hash to the same digest are the same node as far as the registry
//! is concerned, and are merged into a single [`SharedNodeState`](crate::state::SharedNodeState).
//!
//! Digests are also re-derived for the ignore-cache merge rule (see
//! [`ContentDigest::ignore_cache_variant`]), so the hash function needs to be stable and
//! collision-resistant but not cryptographically secret — `blake3` is used purely for its speed
//! and quality as a content hash, the same role it plays in other build/lockchain tooling.

use std::fmt;

/// A 32-byte content digest, keyed into the registry's active-node table.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContentDigest([u8; 32]);

impl ContentDigest {
    /// Hash a single byte string into a digest.
    pub fn hash(bytes: &[u8]) -> Self {
        ContentDigest(*blake3::hash(bytes).as_bytes())
    }

    /// Derive a digest from this node's own name plus its ordered input digests.
    ///
    /// This is the "`d`" of §3: the identity of a vertex before any ignore-cache
    /// re-keying is applied.
    pub fn from_parts(name: &str, inputs: &[ContentDigest]) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(name.as_bytes());
        for input in inputs {
            hasher.update(&input.0);
        }
        ContentDigest(*hasher.finalize().as_bytes())
    }

    /// Derive the `d'` digest used when a vertex is loaded with `ignoreCache = true`:
    /// `digest("{d}-ignorecache")`.
    pub fn ignore_cache_variant(&self) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(self.to_hex().as_bytes());
        hasher.update(b"-ignorecache");
        ContentDigest(*hasher.finalize().as_bytes())
    }

    /// Render the digest as a stable lowercase hex string.
    pub fn to_hex(&self) -> String {
        let mut s = String::with_capacity(64);
        for byte in self.0 {
            s.push_str(&format!("{byte:02x}"));
        }
        s
    }
}

impl fmt::Debug for ContentDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", &self.to_hex()[..12])
    }
}

impl fmt::Display for ContentDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_parts_hash_equal() {
        let a = ContentDigest::from_parts("v", &[]);
        let b = ContentDigest::from_parts("v", &[]);
        assert_eq!(a, b);
    }

    #[test]
    fn different_inputs_hash_differ() {
        let leaf = ContentDigest::from_parts("leaf", &[]);
        let a = ContentDigest::from_parts("v", &[leaf]);
        let b = ContentDigest::from_parts("v", &[]);
        assert_ne!(a, b);
    }

    #[test]
    fn ignore_cache_variant_is_deterministic_and_distinct() {
        let d = ContentDigest::from_parts("v", &[]);
        let d_prime = d.ignore_cache_variant();
        assert_ne!(d, d_prime);
        assert_eq!(d_prime, d.ignore_cache_variant());
    }
}
