use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::signing::ExAppIdentity;

const CONFIG_FILE_NAME: &str = "config.toml";
const ENV_DATA_DIR: &str = "UPSCALER_DATA_DIR";
pub const DEFAULT_AA_VERSION: &str = "2.3.0";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub exapp: ExAppConfig,
    pub restore: RestoreConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
    pub host: String,
}

/// Pairing data handed to the ExApp by the host at deploy time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ExAppConfig {
    pub nextcloud_url: String,
    pub app_id: String,
    pub app_version: String,
    pub app_secret: String,
    pub aa_version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RestoreConfig {
    pub models_dir: PathBuf,
    pub model_file: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_url: Option<String>,
    pub backend: String,
    pub tile_size: u32,
    pub tile_pad: u32,
    pub max_concurrent_jobs: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 9080,
            host: "127.0.0.1".to_string(),
        }
    }
}

impl Default for ExAppConfig {
    fn default() -> Self {
        Self {
            nextcloud_url: "http://localhost".to_string(),
            app_id: "upscaler".to_string(),
            app_version: "1.0.0".to_string(),
            app_secret: String::new(),
            aa_version: DEFAULT_AA_VERSION.to_string(),
        }
    }
}

impl Default for RestoreConfig {
    fn default() -> Self {
        Self {
            models_dir: PathBuf::from("models"),
            model_file: "RealESRGAN_x2plus.onnx".to_string(),
            model_url: None,
            backend: "cuda".to_string(),
            tile_size: 400,
            tile_pad: 10,
            max_concurrent_jobs: 1,
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            exapp: ExAppConfig::default(),
            restore: RestoreConfig::default(),
        }
    }
}

impl AppConfig {
    pub fn load_from_path(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;

        if raw.trim().is_empty() {
            return Ok(Self::default());
        }

        toml::from_str(&raw)
            .with_context(|| format!("failed to parse config TOML: {}", path.display()))
    }

    pub fn save_to_path(&self, path: &Path) -> Result<()> {
        let parent = path
            .parent()
            .context("config path does not have a parent directory")?;
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create config directory: {}", parent.display()))?;

        let encoded = toml::to_string_pretty(self).context("failed to serialize config TOML")?;
        fs::write(path, encoded)
            .with_context(|| format!("failed to write config file: {}", path.display()))?;

        Ok(())
    }

    /// Overlay values the host deploy daemon passes through the environment.
    ///
    /// `lookup` is `std::env::var(..).ok()` in production; tests pass a map.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup("NEXTCLOUD_URL") {
            self.exapp.nextcloud_url = value;
        }
        if let Some(value) = lookup("APP_ID") {
            self.exapp.app_id = value;
        }
        if let Some(value) = lookup("APP_VERSION") {
            self.exapp.app_version = value;
        }
        if let Some(value) = lookup("APP_SECRET") {
            self.exapp.app_secret = value;
        }
        if let Some(value) = lookup("AA_VERSION") {
            self.exapp.aa_version = value;
        }
        if let Some(value) = lookup("APP_HOST") {
            self.server.host = value;
        }
        if let Some(value) = lookup("APP_PORT") {
            self.server.port = value
                .trim()
                .parse()
                .with_context(|| format!("invalid APP_PORT value: {value}"))?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.exapp.app_id.trim().is_empty() {
            bail!("exapp.app_id must not be empty (set APP_ID)");
        }
        if self.exapp.app_version.trim().is_empty() {
            bail!("exapp.app_version must not be empty (set APP_VERSION)");
        }
        if self.exapp.app_secret.is_empty() {
            bail!("exapp.app_secret must not be empty (set APP_SECRET)");
        }
        if self.restore.max_concurrent_jobs == 0 {
            bail!("restore.max_concurrent_jobs must be at least 1");
        }
        self.nextcloud_base_url()?;
        Ok(())
    }

    pub fn identity(&self) -> ExAppIdentity {
        ExAppIdentity {
            app_id: self.exapp.app_id.clone(),
            app_version: self.exapp.app_version.clone(),
            app_secret: self.exapp.app_secret.clone(),
            aa_version: self.exapp.aa_version.clone(),
        }
    }

    pub fn nextcloud_base_url(&self) -> Result<Url> {
        let normalized = normalize_nextcloud_url(&self.exapp.nextcloud_url);
        Url::parse(&normalized)
            .with_context(|| format!("invalid NEXTCLOUD_URL: {}", self.exapp.nextcloud_url))
    }
}

/// Strip the `/index.php` front controller and trailing slashes; the host
/// is commonly registered with either form.
pub fn normalize_nextcloud_url(raw: &str) -> String {
    let mut url = raw.trim().trim_end_matches('/');
    if let Some(stripped) = url.strip_suffix("/index.php") {
        url = stripped.trim_end_matches('/');
    }
    url.to_string()
}

/// Resolve the data directory with 3-tier priority:
/// 1. CLI override if provided
/// 2. UPSCALER_DATA_DIR environment variable
/// 3. Default: ./data
pub fn data_dir(cli_override: Option<&Path>) -> PathBuf {
    if let Some(path) = cli_override {
        return path.to_path_buf();
    }

    if let Some(env_dir) = env::var_os(ENV_DATA_DIR) {
        return PathBuf::from(env_dir);
    }

    PathBuf::from("data")
}

/// Returns the path to config.toml within the given data directory.
pub fn config_path(data_dir: &Path) -> PathBuf {
    data_dir.join(CONFIG_FILE_NAME)
}

/// Create the data directory and a default config.toml on first run.
pub fn initialize_data_dir(data_dir: &Path) -> Result<()> {
    if !data_dir.exists() {
        fs::create_dir_all(data_dir)
            .with_context(|| format!("failed to create data directory: {}", data_dir.display()))?;
    }

    let cfg_path = config_path(data_dir);
    if !cfg_path.exists() {
        AppConfig::default().save_to_path(&cfg_path)?;
    }

    Ok(())
}

/// Returns the path as-is if absolute, otherwise joins it to base.
pub fn resolve_relative_to(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}
