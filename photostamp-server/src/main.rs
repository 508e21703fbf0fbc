mod cache;
mod config;
mod error;
mod http;
mod location;
mod metadata;
mod pipeline;
mod resolver;
mod stamp;

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use tracing_subscriber::{EnvFilter, fmt};

use crate::cache::{FileCache, LocationCache, MemoryCache};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load config first so we can honor logging.filter directive.
    let shared = config::ConfigManager::load(None).await?;
    let cfg_snapshot = config::ConfigManager::to_struct(&shared).await?;
    let filter_directive = cfg_snapshot
        .logging
        .as_ref()
        .and_then(|l| l.filter.clone())
        .or_else(|| std::env::var("RUST_LOG").ok())
        .unwrap_or_else(|| "info,photostamp_server=debug".to_string());
    fmt()
        .with_env_filter(EnvFilter::new(filter_directive))
        .init();

    let cache: Arc<dyn LocationCache> = match cfg_snapshot
        .cache
        .as_ref()
        .and_then(|c| c.dir.as_deref())
    {
        Some(dir) => {
            tracing::info!(dir = %dir, "using on-disk location cache");
            Arc::new(FileCache::new(Path::new(dir))?)
        }
        None => Arc::new(MemoryCache::default()),
    };
    let backend = cfg_snapshot.location.clone().unwrap_or_default();
    let resolver = Arc::new(resolver::ResolverHandle::new(cache, &backend)?);

    let state = http::AppState {
        cfg: shared,
        resolver,
        tasks: Arc::new(tokio::sync::RwLock::new(HashMap::new())),
    };
    let bind = cfg_snapshot.server.and_then(|s| s.bind_address);
    let app = http::router(state);
    http::serve(app, bind).await?;
    Ok(())
}
