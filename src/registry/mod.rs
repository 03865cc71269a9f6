//! Vault registry: creation, symbol uniqueness, implementation versioning.

pub mod factory;
pub mod symbol_table;

pub use factory::{
    derive_vault_address, CreateVaultParams, VaultDefaults, VaultHandle, VaultListing,
    VaultRegistry,
};
pub use symbol_table::SymbolTable;
