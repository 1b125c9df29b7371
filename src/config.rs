//! Client settings, read from TOML with environment overrides on top.

use std::{fs, path::Path, path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::{
    net::{Domain, DomainAllowList, DomainKind, TimeoutBudget},
    sort::{FilterDescriptor, UserIdentity},
};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Host every trust domain lives under, e.g. `example.com` for
    /// `domus.example.com`.
    pub host: String,
    pub action_timeout_ms: u64,
    /// Extra time allowed when the last hop is the user's data store.
    pub data_store_grace_ms: u64,
    pub default_filter: FilterDescriptor,
    pub user: Option<UserIdentity>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            action_timeout_ms: 30_000,
            data_store_grace_ms: 5_000,
            default_filter: FilterDescriptor {
                url: "filter.localhost/rhythm/newest".to_string(),
                name: "newest".to_string(),
                priority: 10,
            },
            user: None,
        }
    }
}

impl Config {
    /// Reads `path` if given, otherwise starts from the defaults, then
    /// applies `COBALT_*` environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::read(path)?,
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    fn read(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Applies overrides from `lookup`. Blank or unparseable values are
    /// ignored with a warning.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(raw) = lookup("COBALT_HOST") {
            let trimmed = raw.trim();
            if !trimmed.is_empty() {
                self.host = trimmed.to_string();
            }
        }

        for (key, slot) in [
            ("COBALT_ACTION_TIMEOUT_MS", &mut self.action_timeout_ms),
            ("COBALT_DATA_STORE_GRACE_MS", &mut self.data_store_grace_ms),
        ] {
            let Some(raw) = lookup(key) else { continue };
            let trimmed = raw.trim();
            if trimmed.is_empty() {
                continue;
            }
            match trimmed.parse::<u64>() {
                Ok(value) => *slot = value,
                Err(err) => warn!("invalid {key}, ignoring: {err}"),
            }
        }
    }

    pub fn allow_list(&self) -> DomainAllowList {
        DomainAllowList::for_host(self.host.as_str())
    }

    pub fn data_store(&self) -> Domain {
        Domain::new(DomainKind::Domus, self.host.as_str())
    }

    pub fn timeout_budget(&self) -> TimeoutBudget {
        TimeoutBudget {
            action_timeout: Duration::from_millis(self.action_timeout_ms),
            data_store_grace: Duration::from_millis(self.data_store_grace_ms),
        }
    }
}
