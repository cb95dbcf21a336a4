//! Subcommand implementations.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context as _, Result, bail};
use permgraph_core::{PermgraphConfig, SqliteStore};

pub mod path;
pub mod stats;
pub mod validate;
pub mod verify;

/// Exit codes shared by every subcommand.
pub mod exit_codes {
    /// Nothing to report.
    pub const SUCCESS: u8 = 0;
    /// The command ran and found problems.
    pub const FINDINGS: u8 = 1;
    /// The command could not run.
    pub const ERROR: u8 = 2;
}

/// Default configuration file looked up in the working directory.
const DEFAULT_CONFIG_FILE: &str = "permgraph.toml";

/// Resolved configuration and database location.
#[derive(Debug)]
pub struct Context {
    /// Parsed configuration (defaults when no file was found).
    pub config: PermgraphConfig,
    /// Database file to operate on.
    pub database: PathBuf,
}

impl Context {
    /// Loads the configuration and resolves the database path.
    ///
    /// An explicit `--config` must exist; the default file is optional.
    pub fn load(config_path: Option<&Path>, database: Option<PathBuf>) -> Result<Self> {
        let config = match config_path {
            Some(path) => PermgraphConfig::from_file(path)
                .with_context(|| format!("failed to load config {}", path.display()))?,
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => {
                PermgraphConfig::from_file(Path::new(DEFAULT_CONFIG_FILE))
                    .with_context(|| format!("failed to load config {DEFAULT_CONFIG_FILE}"))?
            },
            None => PermgraphConfig::default(),
        };
        let database = database.unwrap_or_else(|| config.database.path.clone());
        Ok(Self { config, database })
    }

    /// Opens the database. Refuses to create a new one.
    pub fn open_store(&self) -> Result<Arc<SqliteStore>> {
        if !self.database.exists() {
            bail!("database not found: {}", self.database.display());
        }
        let store = SqliteStore::open(&self.database)
            .with_context(|| format!("failed to open database {}", self.database.display()))?;
        Ok(Arc::new(store))
    }
}

/// Runs `command`, mapping an error to a printed message and
/// [`exit_codes::ERROR`].
pub fn finish(command: &str, result: Result<u8>) -> u8 {
    match result {
        Ok(code) => code,
        Err(e) => {
            tracing::error!(command, error = %e, "Command failed");
            eprintln!("Error: {e:#}");
            exit_codes::ERROR
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_database_overrides_config() {
        let ctx = Context::load(None, Some(PathBuf::from("/tmp/other.db"))).unwrap();
        assert_eq!(ctx.database, PathBuf::from("/tmp/other.db"));
    }

    #[test]
    fn missing_explicit_config_is_an_error() {
        let dir = tempfile::TempDir::new().unwrap();
        assert!(Context::load(Some(&dir.path().join("absent.toml")), None).is_err());
    }

    #[test]
    fn missing_database_is_not_created() {
        let dir = tempfile::TempDir::new().unwrap();
        let ctx = Context::load(None, Some(dir.path().join("absent.db"))).unwrap();
        assert!(ctx.open_store().is_err());
        assert!(!dir.path().join("absent.db").exists());
    }
}
