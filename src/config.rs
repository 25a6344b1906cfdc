// Server configuration and base-directory resolution.
// The config file is TOML under the XDG config dir; every value has a
// default so a missing file yields a fully usable configuration.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Name of the relational backend to open. Only the embedded backend ships
/// a driver; the others exist as dialects behind the query builder seam.
pub const DEFAULT_DRIVER: &str = "Sqlite";

/// Payload sizes above this many bytes are filed externally.
pub const DEFAULT_SIZE_THRESHOLD: i64 = 4096;

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct GeneralConfig {
    pub driver: String,
    pub size_threshold: i64,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            driver: DEFAULT_DRIVER.to_string(),
            size_threshold: DEFAULT_SIZE_THRESHOLD,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CacheCleanerConfig {
    pub enabled: bool,
}

impl Default for CacheCleanerConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SearchConfig {
    /// Engine names to register, in dispatch order.
    pub engines: Vec<String>,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            engines: vec!["Agent".to_string()],
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RetrievalConfig {
    /// How long to wait for a resource to answer a fetch request.
    pub timeout_secs: u64,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self { timeout_secs: 30 }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Override for the listening socket path. Defaults to the runtime dir.
    pub socket_file: Option<PathBuf>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self { socket_file: None }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    pub general: GeneralConfig,
    pub cache_cleaner: CacheCleanerConfig,
    pub search: SearchConfig,
    pub retrieval: RetrievalConfig,
    pub connection: ConnectionConfig,
}

impl ServerConfig {
    /// Load from an explicit path, or the instance's default config file.
    /// A missing file is not an error; defaults apply.
    pub fn load(path: Option<&Path>, instance: &Instance) -> Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => instance.config_file(),
        };
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: ServerConfig = toml::from_str(&raw)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        Ok(config)
    }

    pub fn size_threshold(&self) -> i64 {
        // A negative threshold would file every payload externally,
        // including empty ones; clamp like the original server does.
        self.general.size_threshold.max(0)
    }
}

/// Identifies one server instance. Multi-instance mode appends the
/// identifier to service names and all per-user directories.
#[derive(Debug, Clone, Default)]
pub struct Instance {
    id: Option<String>,
}

impl Instance {
    pub fn new(id: Option<String>) -> Self {
        Self {
            id: id.filter(|s| !s.is_empty()),
        }
    }

    pub fn identifier(&self) -> Option<&str> {
        self.id.as_deref()
    }

    /// Service name with the instance suffix applied, e.g. for the socket
    /// file and the single-instance lock.
    pub fn service_name(&self, base: &str) -> String {
        match &self.id {
            Some(id) => format!("{base}-{id}"),
            None => base.to_string(),
        }
    }

    fn subdir(&self) -> PathBuf {
        match &self.id {
            Some(id) => PathBuf::from("pimstore").join("instance").join(id),
            None => PathBuf::from("pimstore"),
        }
    }

    pub fn config_file(&self) -> PathBuf {
        self.config_dir().join("serverrc.toml")
    }

    pub fn config_dir(&self) -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(self.subdir())
    }

    pub fn data_dir(&self) -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(self.subdir())
    }

    /// Runtime dir for sockets and the service lock. Falls back to the data
    /// dir on systems without XDG_RUNTIME_DIR.
    pub fn runtime_dir(&self) -> PathBuf {
        std::env::var_os("XDG_RUNTIME_DIR")
            .map(|p| PathBuf::from(p).join(self.subdir()))
            .unwrap_or_else(|| self.data_dir().join("runtime"))
    }

    pub fn database_file(&self) -> PathBuf {
        self.data_dir().join("pimstore.db")
    }

    /// Where external payload parts are filed.
    pub fn payload_dir(&self) -> PathBuf {
        self.data_dir().join("file_db_data")
    }

    pub fn socket_file(&self, config: &ServerConfig) -> PathBuf {
        match &config.connection.socket_file {
            Some(path) => path.clone(),
            None => self
                .runtime_dir()
                .join(format!("{}.socket", self.service_name("pimstore"))),
        }
    }

    pub fn lock_file(&self) -> PathBuf {
        self.runtime_dir()
            .join(format!("{}.lock", self.service_name("pimstore")))
    }

    /// The control process publishes this socket; without it the storage
    /// server refuses to run.
    pub fn control_socket(&self) -> PathBuf {
        self.runtime_dir()
            .join(format!("{}.socket", self.service_name("pimstore-control")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_without_config_file() {
        let instance = Instance::new(None);
        let config =
            ServerConfig::load(Some(Path::new("/nonexistent/serverrc.toml")), &instance).unwrap();
        assert_eq!(config.general.driver, "Sqlite");
        assert_eq!(config.size_threshold(), 4096);
        assert!(config.cache_cleaner.enabled);
        assert_eq!(config.search.engines, vec!["Agent".to_string()]);
    }

    #[test]
    fn instance_suffix_lands_in_service_names_and_dirs() {
        let instance = Instance::new(Some("work".to_string()));
        assert_eq!(instance.service_name("pimstore"), "pimstore-work");
        assert!(instance
            .data_dir()
            .to_string_lossy()
            .contains("instance/work"));
    }

    #[test]
    fn parses_partial_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("serverrc.toml");
        std::fs::write(&path, "[general]\nsize_threshold = 128\n").unwrap();
        let config = ServerConfig::load(Some(&path), &Instance::new(None)).unwrap();
        assert_eq!(config.size_threshold(), 128);
        assert_eq!(config.general.driver, "Sqlite");
    }
}
