//! Tag-invalidated response caching.
//!
//! - [`derive_key`] — request target → [`CacheKey`].
//! - [`parse_tags`] — comma-separated tag lists.
//! - [`CacheEntry`] — what is stored per key.
//! - [`TaggedStore`] — the store seam, with [`RedisStore`] and [`MemoryStore`].
//! - [`CacheEntity`] — the access / rewrite / response controller.
//! - [`CacheEntityMiddleware`] — the controller mounted in a middleware pipeline.

pub mod entity;
pub mod entry;
pub mod key;
pub mod middleware;
pub mod store;
pub mod tags;

pub use entity::{Access, Buffering, CacheEntity, Evaluated};
pub use entry::CacheEntry;
pub use key::{CacheKey, derive_key};
pub use middleware::CacheEntityMiddleware;
pub use store::{MemoryStore, RedisStore, StoreError, TaggedStore};
pub use tags::{parse_optional_tags, parse_tags};
