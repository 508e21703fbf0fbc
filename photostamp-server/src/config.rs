use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::RwLock;
use toml_edit::{DocumentMut, Item, value};

/// Default on-disk config filename
pub const DEFAULT_CONFIG_PATH: &str = "photostamp.toml";

const EXAMPLE_CONFIG: &str = include_str!("../photostamp.example.toml");

/// Strongly typed representation of the configuration.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Config {
    pub env: Option<String>,
    pub server: Option<Server>,
    pub logging: Option<Logging>,
    pub cache: Option<CacheSettings>,
    pub location: Option<LocationBackend>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Server {
    pub bind_address: Option<String>,
    pub public_url: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Logging {
    pub filter: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct CacheSettings {
    /// Directory for the on-disk location cache. Unset means the cache
    /// lives in process memory only.
    pub dir: Option<String>,
}

/// Which backend answers location lookups.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(tag = "kind")]
pub enum LocationBackend {
    #[serde(rename = "google")]
    Google { google: Option<GoogleBackend> },
    #[serde(rename = "remote")]
    Remote { remote: Option<RemoteBackend> },
    #[serde(other)]
    Unknown,
}

impl Default for LocationBackend {
    fn default() -> Self {
        Self::Google { google: None }
    }
}

/// In-process two-stage lookup against Google-style geocode/places APIs.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct GoogleBackend {
    pub geocode_url: Option<String>,
    pub places_url: Option<String>,
    pub api_key: Option<String>,
    pub language: Option<String>,
}

/// Delegation to an external `GET {base_url}/location` endpoint.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct RemoteBackend {
    pub base_url: Option<String>,
}

/// Internal manager state kept behind an `Arc<RwLock<_>>`.
#[derive(Debug)]
pub struct ConfigManager {
    path: PathBuf,
    doc: DocumentMut,
}

pub type SharedConfig = Arc<RwLock<ConfigManager>>;

impl ConfigManager {
    /// Load existing config file. If the file does not exist, creates it
    /// from the bundled example.
    pub async fn load(path: Option<PathBuf>) -> Result<SharedConfig> {
        let path = path.unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));

        if !path.exists() {
            fs::write(&path, EXAMPLE_CONFIG)
                .await
                .with_context(|| format!("writing example config to {}", path.display()))?;
            println!("📝 Created default config file: {}", path.display());
            println!("   Edit it to set the geocoding API key before stamping photos.");
        }

        let text = fs::read_to_string(&path)
            .await
            .with_context(|| format!("reading config file {}", path.display()))?;
        let doc = text.parse::<DocumentMut>()?;
        Ok(Arc::new(RwLock::new(Self { path, doc })))
    }

    /// Convert current document to strongly typed struct.
    pub async fn to_struct(cfg: &SharedConfig) -> Result<Config> {
        let guard = cfg.read().await;
        let typed: Config = toml_edit::de::from_document(guard.doc.clone())?;
        Ok(typed)
    }

    /// Persist API credentials for the Google location backend.
    pub async fn set_google_api_key(cfg: &SharedConfig, api_key: &str) -> Result<()> {
        let mut guard = cfg.write().await;
        let location = guard.doc["location"].or_insert(Item::Table(toml_edit::Table::new()));
        if let Item::Table(tbl) = location {
            if tbl.get("kind").is_none() {
                tbl["kind"] = value("google");
            }
            let google = tbl["google"].or_insert(Item::Table(toml_edit::Table::new()));
            if let Item::Table(gt) = google {
                gt["api_key"] = value(api_key);
            }
        } else {
            bail!("location is not a table");
        }
        Ok(())
    }

    /// Atomic write of current document to disk (best-effort durability via rename).
    pub async fn save(cfg: &SharedConfig) -> Result<()> {
        let (path, contents) = {
            let guard = cfg.read().await;
            (guard.path.clone(), guard.doc.to_string())
        };
        let tmp = path.with_extension("toml.tmp");
        fs::write(&tmp, contents)
            .await
            .with_context(|| format!("writing tmp config {}", tmp.display()))?;
        fs::rename(&tmp, &path)
            .await
            .with_context(|| format!("renaming tmp config to {}", path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn example_config_parses_into_typed_struct() {
        let doc = EXAMPLE_CONFIG.parse::<DocumentMut>().expect("parse example");
        let cfg: Config = toml_edit::de::from_document(doc).expect("typed config");
        assert!(cfg.server.and_then(|s| s.bind_address).is_some());
        match cfg.location {
            Some(LocationBackend::Google { google }) => {
                let google = google.expect("google table");
                assert_eq!(google.language.as_deref(), Some("ja"));
            }
            other => panic!("unexpected backend: {other:?}"),
        }
    }

    #[tokio::test]
    async fn api_key_update_round_trips() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("photostamp.toml");
        let shared = ConfigManager::load(Some(path)).await.expect("load");
        ConfigManager::set_google_api_key(&shared, "test-key")
            .await
            .expect("set key");
        ConfigManager::save(&shared).await.expect("save");

        let cfg = ConfigManager::to_struct(&shared).await.expect("to_struct");
        match cfg.location {
            Some(LocationBackend::Google { google }) => {
                assert_eq!(google.and_then(|g| g.api_key).as_deref(), Some("test-key"));
            }
            other => panic!("unexpected backend: {other:?}"),
        }
    }
}
