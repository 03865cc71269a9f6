//! Strategy Vault Library
//!
//! Custodial strategy-vault accounting: per-vault ledger and position engine,
//! time-locked unlock queue, and the registry that creates vaults.
//! Exposes every module for use by the `vaultd` binary and tests.

pub mod api;
pub mod config;
pub mod middleware;
pub mod registry;
pub mod replay;
pub mod vault;

pub use config::VaultConfig;
pub use registry::{CreateVaultParams, VaultRegistry};
pub use vault::{Address, VaultError, VaultInstance};
