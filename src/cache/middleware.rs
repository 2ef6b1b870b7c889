//! The cache controller as a pipeline [`Middleware`].

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use super::entity::{Access, CacheEntity};
use crate::{
    Response,
    context::Context,
    middleware::{Middleware, Next},
};

/// Runs [`CacheEntity`]'s phases around the rest of the pipeline.
///
/// The access phase either answers the request on the spot, or the
/// request is rewritten for buffering, passed to the next layer, and the
/// response phase runs on whatever comes back.
///
/// # Examples
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use cache_entity::cache::{CacheEntity, CacheEntityMiddleware, MemoryStore};
/// use cache_entity::config::CacheConfig;
/// use cache_entity::middleware::from_middleware;
///
/// let entity = CacheEntity::new(Arc::new(CacheConfig::default()), Arc::new(MemoryStore::new()));
/// let handler = from_middleware(Arc::new(CacheEntityMiddleware::new(Arc::new(entity))));
/// ```
pub struct CacheEntityMiddleware {
    entity: Arc<CacheEntity>,
}

impl CacheEntityMiddleware {
    pub fn new(entity: Arc<CacheEntity>) -> Self {
        Self { entity }
    }
}

impl Middleware for CacheEntityMiddleware {
    fn handle(
        &self,
        mut ctx: Context,
        next: Next,
    ) -> Pin<Box<dyn Future<Output = Response> + Send>> {
        let entity = Arc::clone(&self.entity);

        Box::pin(async move {
            let evaluated = match entity.access(&mut ctx).await {
                Access::Exit(response) => return response,
                Access::Forward(evaluated) => evaluated,
            };
            let buffering = evaluated.rewrite(&mut ctx);

            let response = next.run(ctx).await;
            entity.response(buffering, response).await
        })
    }
}
