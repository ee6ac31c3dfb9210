//! Configuration for runstore paths and store settings.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (RUNSTORE_HOME, RUNSTORE_DB)
//! 2. Config file (.runstore/config.yaml)
//! 3. Defaults (<data dir>/runstore/state.db)
//!
//! Config file discovery:
//! - Searches current directory and parents for .runstore/config.yaml
//! - Paths in config file are relative to the .runstore/ directory

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::store::StoreSettings;

/// Global cached configuration (stores Result to handle init errors)
static CONFIG: OnceLock<Result<ResolvedConfig, String>> = OnceLock::new();

/// Directory name searched for in the current directory and its parents
const CONFIG_DIR: &str = ".runstore";

/// Database file name inside the home directory
const DATABASE_FILE: &str = "state.db";

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Deserialize)]
pub struct ConfigFile {
    pub version: String,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub store: Option<StoreSettings>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PathsConfig {
    /// State directory (relative to .runstore/)
    pub home: Option<String>,
    /// Database file (relative to .runstore/)
    pub database: Option<String>,
}

/// Resolved configuration with absolute paths
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    /// Directory holding the database
    pub home: PathBuf,
    /// Database file
    pub database: PathBuf,
    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
    /// Store tunables
    pub store: StoreSettings,
}

/// Find config file by searching `start` and its parents
fn find_config_file(start: &Path) -> Option<PathBuf> {
    let mut current = start.to_path_buf();

    loop {
        let config_path = current.join(CONFIG_DIR).join("config.yaml");
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    None
}

/// Load and parse config file
fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Resolve a path that may be relative to the config directory
fn resolve_path(base: &Path, path_str: &str) -> PathBuf {
    let path = PathBuf::from(path_str);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
            .canonicalize()
            .unwrap_or_else(|_| base.join(path_str))
    }
}

/// Platform data directory, falling back to ~/.runstore
fn default_home() -> Result<PathBuf> {
    if let Some(data) = dirs::data_dir() {
        return Ok(data.join("runstore"));
    }
    Ok(dirs::home_dir()
        .context("Failed to determine home directory")?
        .join(CONFIG_DIR))
}

/// Load configuration from all sources
fn load_config() -> Result<ResolvedConfig> {
    let cwd = std::env::current_dir().context("Failed to read current directory")?;
    let config_file = find_config_file(&cwd);
    let file = match config_file {
        Some(ref path) => Some(load_config_file(path)?),
        None => None,
    };

    resolve(
        config_file,
        file,
        std::env::var("RUNSTORE_HOME").ok(),
        std::env::var("RUNSTORE_DB").ok(),
    )
}

/// Merge config file contents with environment overrides
fn resolve(
    config_file: Option<PathBuf>,
    file: Option<ConfigFile>,
    env_home: Option<String>,
    env_db: Option<String>,
) -> Result<ResolvedConfig> {
    // Paths in the file are relative to .runstore/
    let config_dir = config_file
        .as_deref()
        .and_then(Path::parent)
        .unwrap_or(Path::new("."));
    let paths = file.as_ref().map(|f| f.paths.clone()).unwrap_or_default();

    let home = if let Some(env_home) = env_home {
        PathBuf::from(env_home)
    } else if let Some(ref home_path) = paths.home {
        resolve_path(config_dir, home_path)
    } else {
        default_home()?
    };

    let database = if let Some(env_db) = env_db {
        PathBuf::from(env_db)
    } else if let Some(ref db_path) = paths.database {
        resolve_path(config_dir, db_path)
    } else {
        home.join(DATABASE_FILE)
    };

    let store = file.and_then(|f| f.store).unwrap_or_default();

    Ok(ResolvedConfig {
        home,
        database,
        config_file,
        store,
    })
}

/// Get the global configuration (loads once, then cached)
pub fn config() -> Result<&'static ResolvedConfig> {
    let result = CONFIG.get_or_init(|| load_config().map_err(|e| e.to_string()));

    match result {
        Ok(config) => Ok(config),
        Err(e) => anyhow::bail!("{}", e),
    }
}

/// Force reload configuration (useful for testing)
pub fn reload_config() -> Result<ResolvedConfig> {
    load_config()
}
