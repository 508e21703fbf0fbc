use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;

use crate::cache::{self, CacheEntry, LocationCache};
use crate::config::{LocationBackend, RemoteBackend};
use crate::error::StampError;
use crate::location::{HttpGeoProvider, SmartLocationService};
use crate::metadata::GeoCoordinate;

/// Where display strings come from when the cache misses. Either the
/// in-process two-stage lookup or a remote endpoint implementing the same
/// contract.
#[async_trait]
pub trait LocationSource: Send + Sync {
    async fn fetch_location(&self, coordinate: GeoCoordinate) -> Result<String, StampError>;
}

#[async_trait]
impl LocationSource for SmartLocationService {
    async fn fetch_location(&self, coordinate: GeoCoordinate) -> Result<String, StampError> {
        self.lookup(coordinate).await
    }
}

#[derive(Debug, Deserialize)]
struct RemoteLocationBody {
    location: Option<String>,
    error: Option<String>,
}

/// Consumes an external `GET {base}/location?lat={}&lng={}` boundary that
/// answers `{"location": ...}` on success or `{"error": ...}` on failure.
pub struct RemoteLocationSource {
    client: reqwest::Client,
    base_url: String,
}

impl RemoteLocationSource {
    pub fn new(cfg: &RemoteBackend) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: cfg.base_url.clone().unwrap_or_default(),
        }
    }
}

#[async_trait]
impl LocationSource for RemoteLocationSource {
    async fn fetch_location(&self, coordinate: GeoCoordinate) -> Result<String, StampError> {
        let url = format!("{}/location", self.base_url.trim_end_matches('/'));
        let resp = self
            .client
            .get(&url)
            .query(&[
                ("lat", coordinate.latitude.to_string()),
                ("lng", coordinate.longitude.to_string()),
            ])
            .send()
            .await
            .map_err(|e| StampError::ResolutionFailed(e.to_string()))?;

        let status = resp.status();
        let body: RemoteLocationBody = resp
            .json()
            .await
            .map_err(|_| StampError::ResolutionFailed(format!("サーバーからの応答エラー: {}", status.as_u16())))?;

        if !status.is_success() {
            // Surface the server-provided message verbatim when present.
            return Err(StampError::ResolutionFailed(body.error.unwrap_or_else(
                || format!("サーバーからの応答エラー: {}", status.as_u16()),
            )));
        }
        match body.location {
            Some(location) if !location.is_empty() => Ok(location),
            _ => Err(StampError::ResolutionFailed(
                "場所を特定できませんでした。".into(),
            )),
        }
    }
}

/// Factory creating a concrete location source from the typed config enum.
pub fn build_location_source(backend: &LocationBackend) -> Result<Arc<dyn LocationSource>, anyhow::Error> {
    match backend {
        LocationBackend::Google { google } => {
            let cfg = google.clone().unwrap_or_default();
            let provider = Arc::new(HttpGeoProvider::new(&cfg));
            Ok(Arc::new(SmartLocationService::new(provider)))
        }
        LocationBackend::Remote { remote } => {
            let cfg = remote.clone().unwrap_or_default();
            Ok(Arc::new(RemoteLocationSource::new(&cfg)))
        }
        LocationBackend::Unknown => anyhow::bail!("unknown location backend kind"),
    }
}

/// Coordinate-to-display-string resolution with the 24h rounded-coordinate
/// cache in front of the source.
pub struct PlaceResolver {
    source: Arc<dyn LocationSource>,
    cache: Arc<dyn LocationCache>,
}

impl PlaceResolver {
    pub fn new(source: Arc<dyn LocationSource>, cache: Arc<dyn LocationCache>) -> Self {
        Self { source, cache }
    }

    pub async fn resolve(&self, coordinate: GeoCoordinate) -> Result<String, StampError> {
        let key = cache::cache_key(coordinate);
        if let Some(entry) = cache::fresh_entry(self.cache.as_ref(), &key) {
            tracing::debug!(key = %key, "location cache hit");
            return Ok(entry.location);
        }

        let location = self.source.fetch_location(coordinate).await?;
        self.cache.set(&key, CacheEntry::new(location.clone()));
        tracing::debug!(key = %key, location = %location, "resolved and cached location");
        Ok(location)
    }
}

/// Shared handle over the active resolver so the location backend can be
/// swapped at runtime (e.g. after credentials change) without restarting.
pub struct ResolverHandle {
    cache: Arc<dyn LocationCache>,
    resolver: tokio::sync::RwLock<Arc<PlaceResolver>>,
}

impl ResolverHandle {
    pub fn new(cache: Arc<dyn LocationCache>, backend: &LocationBackend) -> anyhow::Result<Self> {
        let source = build_location_source(backend)?;
        let resolver = Arc::new(PlaceResolver::new(source, Arc::clone(&cache)));
        Ok(Self {
            cache,
            resolver: tokio::sync::RwLock::new(resolver),
        })
    }

    pub async fn current(&self) -> Arc<PlaceResolver> {
        self.resolver.read().await.clone()
    }

    /// Rebuild the resolver from a fresh backend config. The cache carries
    /// over; only the source is replaced.
    pub async fn rebuild(&self, backend: &LocationBackend) -> anyhow::Result<()> {
        let source = build_location_source(backend)?;
        let resolver = Arc::new(PlaceResolver::new(source, Arc::clone(&self.cache)));
        *self.resolver.write().await = resolver;
        Ok(())
    }
}
