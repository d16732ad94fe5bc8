use std::env;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Environment variable naming the directory of the file-backed ledger.
pub const LEDGER_DIR_ENV_VAR: &str = "BUILDWARDEN_LEDGER_DIR";

/// Configuration for ledger storage.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// Directory for JSON-lines ledger files. `None` keeps the ledger in memory.
    pub dir: Option<PathBuf>,
}

impl LedgerConfig {
    /// Create a config backed by files under `dir`.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: Some(dir.into()),
        }
    }

    /// In-memory ledger.
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Build config from environment variables.
    pub fn from_env() -> Self {
        let dir = env::var(LEDGER_DIR_ENV_VAR)
            .ok()
            .filter(|value| !value.trim().is_empty())
            .map(PathBuf::from);
        Self { dir }
    }

    /// Use `dir` if one is not already set.
    pub fn or_dir(mut self, dir: Option<PathBuf>) -> Self {
        if self.dir.is_none() {
            self.dir = dir;
        }
        self
    }
}
