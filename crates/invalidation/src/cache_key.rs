//! Cache keys and the digests used to derive and combine them

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Number of hex characters kept by [`hash_value`].
pub const DIGEST_LEN: usize = 32;

/// Identity plus content hash of one target or of a combined set of targets.
///
/// Two keys are equal iff both the id and the hash match; equality is the
/// only test used to decide whether previous results can be reused.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey {
    id: String,
    hash: String,
}

impl CacheKey {
    /// Create a key from a target id and its content hash
    #[must_use]
    pub fn new(id: impl Into<String>, hash: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            hash: hash.into(),
        }
    }

    /// Stable identifier of the target or target set
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Content-derived digest
    #[must_use]
    pub fn hash(&self) -> &str {
        &self.hash
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.id, self.hash)
    }
}

/// Short, directory-name-safe digest of a string.
///
/// SHA-256, hex encoded, truncated to [`DIGEST_LEN`] characters.
#[must_use]
pub fn hash_value(value: &str) -> String {
    let mut encoded = hex::encode(Sha256::digest(value.as_bytes()));
    encoded.truncate(DIGEST_LEN);
    encoded
}

/// Full hex SHA-256 over a sequence of items, each terminated by a NUL byte
/// so that `["ab", "c"]` and `["a", "bc"]` hash differently.
#[must_use]
pub fn hash_all<I, S>(items: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<[u8]>,
{
    let mut hasher = Sha256::new();
    for item in items {
        hasher.update(item.as_ref());
        hasher.update([0u8]);
    }
    hex::encode(hasher.finalize())
}

/// Combine the keys of a target set into one composite key.
///
/// A single key combines to itself. Otherwise the members are sorted by id
/// and each hash is digested right after its id, so the result depends only
/// on the member set and never on the order the members were listed in.
/// Two members trading hashes yields a different key.
pub fn combine_cache_keys(keys: &[CacheKey]) -> Result<CacheKey> {
    match keys {
        [] => Err(Error::EmptyTargetSet),
        [only] => Ok(only.clone()),
        many => {
            let mut members: Vec<(&str, &str)> =
                many.iter().map(|key| (key.id(), key.hash())).collect();
            members.sort_unstable();
            let id = hash_all(members.iter().map(|(id, _)| id));
            let hash = hash_all(members.iter().flat_map(|(id, hash)| [id, hash]));
            Ok(CacheKey::new(id, hash))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_equality_requires_id_and_hash() {
        let a = CacheKey::new("src/lib", "abc");
        assert_eq!(a, CacheKey::new("src/lib", "abc"));
        assert_ne!(a, CacheKey::new("src/lib", "abd"));
        assert_ne!(a, CacheKey::new("src/other", "abc"));
    }

    #[test]
    fn test_display() {
        assert_eq!(CacheKey::new("a", "123").to_string(), "a:123");
    }

    #[test]
    fn test_hash_value_is_short_and_stable() {
        let digest = hash_value("compile_3");
        assert_eq!(digest.len(), DIGEST_LEN);
        assert!(digest.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(digest, hash_value("compile_3"));
        assert_ne!(digest, hash_value("compile_4"));
    }

    #[test]
    fn test_hash_all_separates_items() {
        assert_ne!(hash_all(["ab", "c"]), hash_all(["a", "bc"]));
        assert_eq!(hash_all(["a", "b"]).len(), 64);
    }

    #[test]
    fn test_combine_single_key_is_identity() {
        let key = CacheKey::new("only", "h1");
        assert_eq!(combine_cache_keys(std::slice::from_ref(&key)).unwrap(), key);
    }

    #[test]
    fn test_combine_empty_is_error() {
        assert!(matches!(
            combine_cache_keys(&[]),
            Err(Error::EmptyTargetSet)
        ));
    }

    #[test]
    fn test_combine_is_order_normalized() {
        let a = CacheKey::new("a", "h1");
        let b = CacheKey::new("b", "h2");
        let c = CacheKey::new("c", "h3");
        let forward = combine_cache_keys(&[a.clone(), b.clone(), c.clone()]).unwrap();
        let shuffled = combine_cache_keys(&[c, a, b]).unwrap();
        assert_eq!(forward, shuffled);
    }

    #[test]
    fn test_combine_changes_when_member_hash_changes() {
        let before =
            combine_cache_keys(&[CacheKey::new("a", "h1"), CacheKey::new("b", "h2")]).unwrap();
        let after =
            combine_cache_keys(&[CacheKey::new("a", "h1"), CacheKey::new("b", "h9")]).unwrap();
        assert_eq!(before.id(), after.id());
        assert_ne!(before.hash(), after.hash());
    }

    #[test]
    fn test_combine_keeps_ids_paired_with_hashes() {
        let before =
            combine_cache_keys(&[CacheKey::new("a", "h1"), CacheKey::new("b", "h2")]).unwrap();
        let swapped =
            combine_cache_keys(&[CacheKey::new("a", "h2"), CacheKey::new("b", "h1")]).unwrap();
        assert_eq!(before.id(), swapped.id());
        assert_ne!(before.hash(), swapped.hash());
    }

    #[test]
    fn test_serde_shape() {
        let key = CacheKey::new("a", "h");
        let json = serde_json::to_string(&key).unwrap();
        assert_eq!(json, r#"{"id":"a","hash":"h"}"#);
        let parsed: CacheKey = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, key);
    }
}
