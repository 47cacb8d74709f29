//! Account configuration
//!
//! Accounts are read from a configuration file (TOML by default, any format the
//! `config` crate understands by extension):
//!
//! ```toml
//! [[accounts]]
//! name = "personal"
//! source = "maildir://~/mail"
//! default = "INBOX"
//! ```

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

fn default_folder() -> String {
    "INBOX".to_string()
}

/// Configuration for one account backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountConfig {
    pub name: String,
    /// Backend source URL, e.g. `maildir:///var/mail/alice` or `maildir://~/mail`
    pub source: String,
    /// Folder opened once the directory list arrives
    #[serde(default = "default_folder")]
    pub default: String,
    /// Backend-specific extra settings
    #[serde(default)]
    pub params: HashMap<String, String>,
}

impl AccountConfig {
    pub fn new(name: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source: source.into(),
            default: default_folder(),
            params: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub accounts: Vec<AccountConfig>,
}

impl Config {
    /// Load and validate the configuration at `path`
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(Error::Config(format!(
                "configuration file not found: {}",
                path.display()
            )));
        }

        let config: Config = ::config::Config::builder()
            .add_source(::config::File::from(path))
            .build()?
            .try_deserialize()?;

        config.validate()?;
        log::debug!(
            "Loaded {} account(s) from {}",
            config.accounts.len(),
            path.display()
        );
        Ok(config)
    }

    /// Load from the default location (`<config dir>/mailcache/accounts.toml`)
    pub fn load_default() -> Result<Self> {
        Self::load(Self::default_path()?)
    }

    pub fn default_path() -> Result<PathBuf> {
        let base = dirs::config_dir()
            .ok_or_else(|| Error::Config("could not resolve config directory".to_string()))?;
        Ok(base.join("mailcache").join("accounts.toml"))
    }

    pub fn account(&self, name: &str) -> Option<&AccountConfig> {
        self.accounts.iter().find(|a| a.name == name)
    }

    fn validate(&self) -> Result<()> {
        if self.accounts.is_empty() {
            return Err(Error::Config("no accounts configured".to_string()));
        }

        let mut names = HashSet::new();
        for account in &self.accounts {
            if account.source.trim().is_empty() {
                return Err(Error::Config(format!(
                    "account {} has no source",
                    account.name
                )));
            }
            if !names.insert(account.name.as_str()) {
                return Err(Error::Config(format!(
                    "duplicate account name: {}",
                    account.name
                )));
            }
        }
        Ok(())
    }
}
