//! Atomic JSON persistence of the profile configuration.
//!
//! The store file is the single source of truth across restarts: profiles
//! come back in their last-known enabled state. Every successful mutation
//! rewrites the file through a temp-file-then-rename so a crash never
//! leaves a half-written configuration. Counters are never persisted.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::model::ProfileConfig;

/// On-disk shape of the configuration file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PersistedConfig {
    pub profiles: Vec<ProfileConfig>,
}

/// Handle on the configuration file passed on the command line.
pub struct ConfigStore {
    path: PathBuf,
}

impl ConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        ConfigStore { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the persisted configuration; an absent file is an empty one.
    pub fn load(&self) -> anyhow::Result<PersistedConfig> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("no configuration at {}; starting empty", self.path.display());
                return Ok(PersistedConfig::default());
            }
            Err(e) => return Err(e.into()),
        };
        let cfg: PersistedConfig = serde_json::from_str(&raw)?;
        tracing::info!(
            "loaded {} profile(s) from {}",
            cfg.profiles.len(),
            self.path.display()
        );
        Ok(cfg)
    }

    /// Write atomically: temp file in the same directory, then rename.
    pub fn save(&self, cfg: &PersistedConfig) -> anyhow::Result<()> {
        let tmp = self.path.with_extension("json.tmp");
        let raw = serde_json::to_string_pretty(cfg)?;
        std::fs::write(&tmp, raw)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}
