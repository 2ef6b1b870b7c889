//! # cache_entity
//!
//! Tag-invalidated response caching for an async HTTP/1.1 gateway.
//!
//! GET responses from the upstream service are stored under a digest of the
//! request target together with the tags the upstream lists in
//! `x-cache-tags`. A later GET for the same target is answered from the
//! store without touching the upstream. Any response may name tags in
//! `x-invalidate-cache-tags` to drop every entry under them, and the
//! `invalidate_cache` admin path does the same for its `cache_tags` argument.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use cache_entity::cache::{CacheEntity, CacheEntityMiddleware, MemoryStore};
//! use cache_entity::config::CacheConfig;
//! use cache_entity::gateway::Gateway;
//! use cache_entity::server::Server;
//! use cache_entity::upstream::HttpUpstream;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let entity = CacheEntity::new(Arc::new(CacheConfig::default()), Arc::new(MemoryStore::new()));
//!     let gateway = Gateway::new(Arc::new(HttpUpstream::new("127.0.0.1:9000")))
//!         .layer(CacheEntityMiddleware::new(Arc::new(entity)));
//!
//!     let server = Server::bind("127.0.0.1:8000").await?;
//!     server.run(move |req| {
//!         let gateway = gateway.clone();
//!         async move { gateway.handle(req).await }
//!     }).await?;
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod cli;
pub mod config;
pub mod context;
pub mod gateway;
pub mod http;
pub mod middleware;
pub mod server;
pub mod upstream;

pub use cache::{CacheEntity, CacheEntityMiddleware, TaggedStore};
pub use config::CacheConfig;
pub use gateway::Gateway;
pub use http::{Headers, Method, Request, Response, StatusCode};
pub use server::{Server, ServerError};
