//! Process configuration.
//!
//! Values are layered, later sources overriding earlier ones:
//!
//! 1. built-in defaults,
//! 2. an optional configuration file (TOML, YAML or JSON, by extension),
//! 3. environment variables prefixed `STOW_`, with `__` separating nested
//!    keys (`STOW_WRITE_LOCK__LEASE_SECONDS=600`).
//!
//! ```toml
//! container_dir = "/var/lib/stow/containers"
//! settings = ["/etc/stow/settings.json"]
//!
//! [cloud_cache]
//! name = "shared"
//!
//! [accounts.share]
//! type = "local"
//! root = "/mnt/workspaces"
//!
//! [accounts.cloud]
//! type = "s3"
//! bucket = "workspaces"
//! region = "eu-west-1"
//! key_id = "..."
//! key_secret = "..."
//! ```

pub mod error;

use exn::{OptionExt, ResultExt};
use figment::Figment;
use figment::providers::{Env, Format, Json, Serialized, Toml, Yaml};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::error::{ErrorKind, Result};

const ENV_PREFIX: &str = "STOW_";
const DEFAULT_LEASE_SECONDS: u64 = 60 * 60;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Root directory of local containers; one subdirectory per container id.
    pub container_dir: PathBuf,
    pub cloud_cache: CloudCacheConfig,
    pub write_lock: WriteLockConfig,
    /// Named storage accounts that cloud containers can live in.
    pub accounts: BTreeMap<String, AccountConfig>,
    /// JSON settings files loaded at application priority.
    pub settings: Vec<PathBuf>,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            container_dir: default_container_dir(),
            cloud_cache: CloudCacheConfig::default(),
            write_lock: WriteLockConfig::default(),
            accounts: BTreeMap::new(),
            settings: Vec::new(),
            log_level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CloudCacheConfig {
    pub name: String,
    /// Defaults to `<container_dir>/.cloud-cache/<name>`.
    pub dir: Option<PathBuf>,
    /// Empty the cache directory on startup.
    pub clear_contents: bool,
}

impl Default for CloudCacheConfig {
    fn default() -> Self {
        Self { name: "default".to_string(), dir: None, clear_contents: false }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WriteLockConfig {
    pub lease_seconds: u64,
}

impl Default for WriteLockConfig {
    fn default() -> Self {
        Self { lease_seconds: DEFAULT_LEASE_SECONDS }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum AccountConfig {
    Local {
        root: PathBuf,
    },
    S3 {
        bucket: String,
        #[serde(default)]
        prefix: Option<String>,
        region: String,
        #[serde(default)]
        endpoint: Option<String>,
        key_id: String,
        key_secret: String,
    },
}

fn default_container_dir() -> PathBuf {
    directories::ProjectDirs::from("", "", "stow")
        .map(|dirs| dirs.cache_dir().join("containers"))
        .unwrap_or_else(|| std::env::temp_dir().join("stow").join("containers"))
}

impl Config {
    /// The layered configuration sources, without extracting them.
    pub fn figment(path: Option<&Path>) -> Result<Figment> {
        let mut figment = Figment::from(Serialized::defaults(Config::default()));
        if let Some(path) = path {
            let extension = path.extension().and_then(|e| e.to_str()).map(str::to_ascii_lowercase);
            figment = match extension.as_deref() {
                Some("toml") => figment.merge(Toml::file_exact(path)),
                Some("yaml" | "yml") => figment.merge(Yaml::file_exact(path)),
                Some("json") => figment.merge(Json::file_exact(path)),
                _ => exn::bail!(ErrorKind::UnsupportedFormat(path.to_path_buf())),
            };
        }
        Ok(figment.merge(Env::prefixed(ENV_PREFIX).split("__")))
    }

    /// Load and validate configuration.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config: Config = Self::figment(path)?.extract().or_raise(|| ErrorKind::Load)?;
        config.validate()?;
        tracing::debug!(container_dir = %config.container_dir.display(), accounts = config.accounts.len(), "loaded configuration");
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |key: &str, reason| exn::Exn::from(ErrorKind::Invalid { key: key.to_string(), reason });
        if self.container_dir.as_os_str().is_empty() {
            return Err(invalid("container_dir", "must not be empty"));
        }
        if self.cloud_cache.name.trim().is_empty() {
            return Err(invalid("cloud_cache.name", "must not be empty"));
        }
        if self.write_lock.lease_seconds == 0 {
            return Err(invalid("write_lock.lease_seconds", "must be greater than zero"));
        }
        for (name, account) in &self.accounts {
            match account {
                AccountConfig::Local { root } if !root.is_absolute() => {
                    return Err(invalid(&format!("accounts.{name}.root"), "must be an absolute path"));
                },
                AccountConfig::S3 { bucket, .. } if bucket.trim().is_empty() => {
                    return Err(invalid(&format!("accounts.{name}.bucket"), "must not be empty"));
                },
                _ => {},
            }
        }
        Ok(())
    }

    /// Directory holding the local copies of cloud containers.
    pub fn cloud_cache_dir(&self) -> PathBuf {
        match &self.cloud_cache.dir {
            Some(dir) => dir.clone(),
            None => self.container_dir.join(".cloud-cache").join(&self.cloud_cache.name),
        }
    }

    pub fn account(&self, name: &str) -> Result<&AccountConfig> {
        self.accounts.get(name).ok_or_raise(|| ErrorKind::UnknownAccount(name.to_string()))
    }
}
