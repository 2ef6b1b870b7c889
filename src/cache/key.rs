//! Cache key derivation.

use std::fmt;

use md5::{Digest, Md5};

/// Namespace every logical cache key starts with.
pub const NAMESPACE: &str = "cache:";

/// A logical cache key: [`NAMESPACE`] followed by the lowercase hex md5 of the
/// request's path and query string.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<CacheKey> for String {
    fn from(key: CacheKey) -> String {
        key.0
    }
}

/// Derives the cache key for a request target such as `/products?id=5`.
///
/// Pure and unseeded, so the same input maps to the same key in every
/// process. Any input is accepted, including the empty string.
///
/// # Examples
///
/// ```
/// use cache_entity::cache::derive_key;
///
/// let key = derive_key("/products?id=5");
/// assert_eq!(key.as_str(), "cache:4c2784dad1a98fdcc258a60a9bd21aaf");
/// ```
pub fn derive_key(path_with_query: &str) -> CacheKey {
    let digest = Md5::digest(path_with_query.as_bytes());
    CacheKey(format!("{NAMESPACE}{digest:x}"))
}
