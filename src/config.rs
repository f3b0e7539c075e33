//! Configuration file handling for the ledger.
//!
//! The configuration file is stored at `$LEDGER_HOME/config.json` and names the budget the CLI
//! works on, how often to check the store for remote changes, and where the SQLite store lives.

use crate::error::{ErrorType, IntoResult, Res};
use crate::ledger::Ledger;
use crate::model::Budget;
use crate::store::{DocumentStore, SqliteStore};
use crate::{utils, Result};
use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

const APP_NAME: &str = "ledger";
const CONFIG_VERSION: u8 = 1;
const CONFIG_JSON: &str = "config.json";
const LEDGER_SQLITE: &str = "ledger.sqlite";
const DEFAULT_SYNC_INTERVAL_SECS: u64 = 30;

/// The `Config` object represents the configuration of the app. You instantiate it by providing
/// the path to `$LEDGER_HOME` and from there it loads `$LEDGER_HOME/config.json`.
#[derive(Debug, Clone)]
pub struct Config {
    root: PathBuf,
    config_path: PathBuf,
    config_file: ConfigFile,
    store: SqliteStore,
}

impl Config {
    /// Creates the ledger home directory and:
    /// - writes an initial `config.json` for `budget_id` with default settings,
    /// - creates the SQLite store,
    /// - seeds an empty budget document owned by `owner_id`.
    ///
    /// # Errors
    /// - Returns an error if any file operations fail, or if the home directory already holds a
    ///   store.
    pub async fn create(
        dir: impl Into<PathBuf>,
        budget_id: &str,
        owner_id: &str,
    ) -> Result<Self> {
        Self::create_inner(dir.into(), budget_id, owner_id)
            .await
            .pub_result(ErrorType::Config)
    }

    async fn create_inner(maybe_relative: PathBuf, budget_id: &str, owner_id: &str) -> Res<Self> {
        if budget_id.trim().is_empty() {
            bail!("The budget id must not be empty");
        }
        utils::make_dir(&maybe_relative)
            .await
            .context("Unable to create the ledger home directory")?;
        let root = utils::canonicalize(&maybe_relative).await?;
        let config_path = root.join(CONFIG_JSON);

        let config_file = ConfigFile {
            app_name: APP_NAME.to_string(),
            config_version: CONFIG_VERSION,
            budget_id: budget_id.to_string(),
            sync_interval_secs: DEFAULT_SYNC_INTERVAL_SECS,
            sqlite_path: None,
        };
        config_file.save(&config_path).await?;

        let store = SqliteStore::init(root.join(LEDGER_SQLITE))
            .await
            .context("Unable to create the SQLite store")?;

        let config = Self {
            root,
            config_path,
            config_file,
            store,
        };
        config
            .ledger()
            .repo()
            .create_budget(&Budget::new(budget_id, owner_id))
            .await
            .context("Unable to seed the budget")?;
        info!("Created budget '{budget_id}' in {}", config.root.display());
        Ok(config)
    }

    /// This will
    /// - validate that `ledger_home` exists and that the config file exists,
    /// - load the config file,
    /// - open the SQLite store,
    /// - return the loaded configuration object.
    pub async fn load(ledger_home: impl Into<PathBuf>) -> Result<Self> {
        Self::load_inner(ledger_home.into())
            .await
            .pub_result(ErrorType::Config)
    }

    async fn load_inner(maybe_relative: PathBuf) -> Res<Self> {
        let root = utils::canonicalize(&maybe_relative)
            .await
            .context("Ledger home is missing")?;
        utils::read_dir(&root).await.context("Ledger home is missing")?;

        let config_path = root.join(CONFIG_JSON);
        if !config_path.is_file() {
            bail!("The config file is missing '{}'", config_path.display())
        }
        let config_file = ConfigFile::load(&config_path).await?;
        let sqlite_path = config_file.sqlite_path(&root);
        let store = SqliteStore::load(&sqlite_path)
            .await
            .context("Unable to load the SQLite store")?;

        Ok(Self {
            root,
            config_path,
            config_file,
            store,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    pub fn budget_id(&self) -> &str {
        &self.config_file.budget_id
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.config_file.sync_interval_secs)
    }

    pub fn sqlite_path(&self) -> &Path {
        self.store.path()
    }

    /// A ledger over the configured store, with an empty cache.
    pub fn ledger(&self) -> Ledger {
        let store: Arc<dyn DocumentStore> = Arc::new(self.store.clone());
        Ledger::new(store)
    }
}

/// Represents the serialization and deserialization format of the configuration file.
///
/// Example configuration:
/// ```json
/// {
///   "app_name": "ledger",
///   "config_version": 1,
///   "budget_id": "household",
///   "sync_interval_secs": 30
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
struct ConfigFile {
    /// Application name, should always be "ledger"
    app_name: String,

    /// Configuration file version
    config_version: u8,

    /// The budget the CLI works on
    budget_id: String,

    /// Seconds between checks for remote changes
    #[serde(default = "default_sync_interval_secs")]
    sync_interval_secs: u64,

    /// Path to the SQLite store (optional, relative to the ledger home or absolute)
    /// Defaults to $LEDGER_HOME/ledger.sqlite if not specified
    #[serde(default, skip_serializing_if = "Option::is_none")]
    sqlite_path: Option<PathBuf>,
}

fn default_sync_interval_secs() -> u64 {
    DEFAULT_SYNC_INTERVAL_SECS
}

impl ConfigFile {
    /// Loads a ConfigFile from `path`, checking its `app_name`.
    async fn load(path: impl AsRef<Path>) -> Res<Self> {
        let path = path.as_ref();
        let config: ConfigFile = utils::deserialize(path).await?;
        anyhow::ensure!(
            config.app_name == APP_NAME,
            "Invalid app_name in config file: expected '{}', got '{}'",
            APP_NAME,
            config.app_name
        );
        anyhow::ensure!(
            config.sync_interval_secs > 0,
            "sync_interval_secs must be greater than zero"
        );
        Ok(config)
    }

    async fn save(&self, path: impl AsRef<Path>) -> Res<()> {
        let data = serde_json::to_string_pretty(self).context("Unable to serialize config")?;
        utils::write(path.as_ref(), data)
            .await
            .context("Unable to write config file")
    }

    /// The configured SQLite path if it is absolute, otherwise resolved against `root`.
    fn sqlite_path(&self, root: &Path) -> PathBuf {
        match &self.sqlite_path {
            Some(p) if p.is_absolute() => p.clone(),
            Some(p) => root.join(p),
            None => root.join(LEDGER_SQLITE),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorType;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_config_create_and_load() {
        let dir = TempDir::new().unwrap();
        let home = dir.path().join("ledger_home");
        let config = Config::create(&home, "household", "u1").await.unwrap();
        assert_eq!("household", config.budget_id());
        assert!(config.config_path().is_file());
        assert!(config.sqlite_path().is_file());
        assert_eq!(config.sync_interval(), Duration::from_secs(30));

        let loaded = Config::load(&home).await.unwrap();
        assert_eq!(loaded.budget_id(), "household");
        let budget = loaded.ledger().repo().read_budget("household").await.unwrap();
        assert_eq!(budget.owner_id, "u1");
    }

    #[tokio::test]
    async fn test_config_create_twice_fails() {
        let dir = TempDir::new().unwrap();
        Config::create(dir.path(), "b1", "u1").await.unwrap();
        let err = Config::create(dir.path(), "b1", "u1").await.unwrap_err();
        assert!(err.is(ErrorType::Config));
    }

    #[tokio::test]
    async fn test_config_load_missing_home() {
        let dir = TempDir::new().unwrap();
        let err = Config::load(dir.path().join("nope")).await.unwrap_err();
        assert!(err.is(ErrorType::Config));
    }

    #[tokio::test]
    async fn test_config_file_load_invalid_app_name() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        let json = r#"{
            "app_name": "wrong_app",
            "config_version": 1,
            "budget_id": "b1"
        }"#;
        utils::write(&path, json).await.unwrap();
        let err = ConfigFile::load(&path).await.unwrap_err();
        assert!(err.to_string().contains("Invalid app_name"));
    }

    #[tokio::test]
    async fn test_config_file_minimal() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        let json = r#"{ "app_name": "ledger", "config_version": 1, "budget_id": "b1" }"#;
        utils::write(&path, json).await.unwrap();
        let config = ConfigFile::load(&path).await.unwrap();
        assert_eq!(config.sync_interval_secs, DEFAULT_SYNC_INTERVAL_SECS);
        assert_eq!(
            config.sqlite_path(dir.path()),
            dir.path().join(LEDGER_SQLITE)
        );
    }

    #[test]
    fn test_config_file_serialization_omits_none_fields() {
        let config = ConfigFile {
            app_name: APP_NAME.to_string(),
            config_version: CONFIG_VERSION,
            budget_id: "b1".to_string(),
            sync_interval_secs: 5,
            sqlite_path: None,
        };
        let json = serde_json::to_string(&config).unwrap();
        assert!(!json.contains("sqlite_path"));
    }
}
