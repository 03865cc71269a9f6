//! Vault service configuration
//!
//! TOML file (path from `VAULT_CONFIG_PATH`) with per-value env overrides.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::registry::VaultDefaults;
use crate::vault::types::DEFAULT_PLATFORM_LABEL;
use crate::vault::unlock_queue::DEFAULT_UNLOCK_LOCK_PERIOD_SECS;
use crate::vault::DEFAULT_MAX_PENDING_PAGE;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaultConfig {
    /// Seconds an unlock request waits before it can be settled
    #[serde(default = "default_unlock_lock_period_secs")]
    pub unlock_lock_period_secs: i64,

    /// Venue label hashed into target ids
    #[serde(default = "default_platform_label")]
    pub platform_label: String,

    #[serde(default)]
    pub allow_unlock_cancel: bool,

    /// Upper bound on `get_pending_unlock_requests(max)`
    #[serde(default = "default_max_pending_page")]
    pub max_pending_page: usize,

    /// Implementation id for newly created vaults when no registry is persisted
    #[serde(default = "default_implementation")]
    pub implementation: String,

    #[serde(default = "default_db_path")]
    pub db_path: String,

    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
}

fn default_unlock_lock_period_secs() -> i64 {
    DEFAULT_UNLOCK_LOCK_PERIOD_SECS
}

fn default_platform_label() -> String {
    DEFAULT_PLATFORM_LABEL.to_string()
}

fn default_max_pending_page() -> usize {
    DEFAULT_MAX_PENDING_PAGE
}

fn default_implementation() -> String {
    "strategy-vault-v1".to_string()
}

fn default_db_path() -> String {
    "strategy_vault.db".to_string()
}

fn default_bind_addr() -> String {
    "127.0.0.1:8088".to_string()
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            unlock_lock_period_secs: default_unlock_lock_period_secs(),
            platform_label: default_platform_label(),
            allow_unlock_cancel: false,
            max_pending_page: default_max_pending_page(),
            implementation: default_implementation(),
            db_path: default_db_path(),
            bind_addr: default_bind_addr(),
        }
    }
}

impl VaultConfig {
    /// Load from TOML file
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Load from `VAULT_CONFIG_PATH` (or the default path), then apply env overrides
    pub fn from_env() -> Self {
        let path =
            std::env::var("VAULT_CONFIG_PATH").unwrap_or_else(|_| "vault_config.toml".to_string());

        let mut config = Self::load(&path).unwrap_or_else(|e| {
            tracing::debug!("Using default vault config ({}): {}", path, e);
            Self::default()
        });
        config.apply_env_overrides();
        config
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(raw) = std::env::var("VAULT_UNLOCK_LOCK_PERIOD_SECS") {
            match raw.trim().parse::<i64>() {
                Ok(secs) if secs >= 0 => self.unlock_lock_period_secs = secs,
                _ => tracing::warn!("Ignoring invalid VAULT_UNLOCK_LOCK_PERIOD_SECS={}", raw),
            }
        }
        if let Ok(path) = std::env::var("VAULT_DB_PATH") {
            if !path.trim().is_empty() {
                self.db_path = path;
            }
        }
        if let Ok(addr) = std::env::var("VAULT_BIND_ADDR") {
            if !addr.trim().is_empty() {
                self.bind_addr = addr;
            }
        }
    }

    /// Save to TOML file
    pub fn save(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let contents = toml::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    pub fn vault_defaults(&self) -> VaultDefaults {
        VaultDefaults {
            platform_label: self.platform_label.clone(),
            unlock_lock_period_secs: self.unlock_lock_period_secs.max(0),
            allow_unlock_cancel: self.allow_unlock_cancel,
            max_pending_page: self.max_pending_page.max(1),
        }
    }
}
