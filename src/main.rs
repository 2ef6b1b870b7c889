use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use cache_entity::cache::{CacheEntity, CacheEntityMiddleware, MemoryStore, RedisStore, TaggedStore};
use cache_entity::cli::CliArgs;
use cache_entity::gateway::Gateway;
use cache_entity::middleware::LoggerMiddleware;
use cache_entity::server::Server;
use cache_entity::upstream::HttpUpstream;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = CliArgs::parse();
    let config = Arc::new(args.cache_config()?);

    let store: Arc<dyn TaggedStore> = if args.memory_store {
        info!("using in-memory store");
        Arc::new(MemoryStore::new())
    } else {
        info!(host = %config.store.host, port = config.store.port, "using redis store");
        Arc::new(RedisStore::new(&config)?)
    };

    let entity = Arc::new(CacheEntity::new(Arc::clone(&config), store));
    let gateway = Gateway::new(Arc::new(HttpUpstream::new(args.upstream.clone())))
        .layer(LoggerMiddleware)
        .layer(CacheEntityMiddleware::new(entity));

    let server = Server::bind(&args.listen)
        .await?
        .idle_timeout(Duration::from_secs(args.idle_timeout_seconds));
    info!(upstream = %args.upstream, "forwarding to upstream");

    server
        .run(move |request| {
            let gateway = gateway.clone();
            async move { gateway.handle(request).await }
        })
        .await?;

    Ok(())
}
