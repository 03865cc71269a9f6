//! Vault Registry (Factory)
//!
//! Creates vaults, enforces global strategy-symbol uniqueness and tracks the
//! implementation version handed to future vaults.
//!
//! # Invariants
//!
//! 1. A strategy symbol maps to exactly one vault, forever.
//! 2. Strategy ids are issued from 1 upward and never reused.
//! 3. `update_implementation` affects vaults created afterwards only.
//! 4. `user_vault` is advisory: it remembers the latest vault per creator and
//!    does not cap how many vaults a creator may own.

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

use crate::registry::symbol_table::SymbolTable;
use crate::vault::access::{AccessPolicy, Role, RoleTable};
use crate::vault::asset::AssetProvider;
use crate::vault::clock::Clock;
use crate::vault::error::VaultError;
use crate::vault::fixed_point::asset_unit;
use crate::vault::instance::{VaultInstance, VaultProfile, DEFAULT_MAX_PENDING_PAGE};
use crate::vault::schema::VaultStorage;
use crate::vault::types::{Address, DEFAULT_PLATFORM_LABEL};
use crate::vault::unlock_queue::DEFAULT_UNLOCK_LOCK_PERIOD_SECS;
use crate::vault::vault_db::{RegistryStateRecord, RegistryVaultRecord, VaultDb};

/// One lock per vault; vaults never share ledger state.
pub type VaultHandle = Arc<Mutex<VaultInstance>>;

/// Settings stamped onto every vault the registry creates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VaultDefaults {
    pub platform_label: String,
    pub unlock_lock_period_secs: i64,
    pub allow_unlock_cancel: bool,
    pub max_pending_page: usize,
}

impl Default for VaultDefaults {
    fn default() -> Self {
        Self {
            platform_label: DEFAULT_PLATFORM_LABEL.to_string(),
            unlock_lock_period_secs: DEFAULT_UNLOCK_LOCK_PERIOD_SECS,
            allow_unlock_cancel: false,
            max_pending_page: DEFAULT_MAX_PENDING_PAGE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateVaultParams {
    pub admin: Address,
    pub manager: Address,
    pub asset: Address,
    pub name: String,
    pub symbol: String,
    pub strategy_symbol: String,
    pub end_time: i64,
}

/// Listing row for indexers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaultListing {
    pub address: Address,
    pub strategy_id: u64,
    pub strategy_symbol: String,
    pub creator: Address,
    #[serde(with = "crate::vault::fixed_point::serde_u128")]
    pub tvl: u128,
}

struct VaultEntry {
    record: RegistryVaultRecord,
    handle: VaultHandle,
}

struct RegistryState {
    implementation: Address,
    next_strategy_id: u64,
    salt: String,
    symbols: SymbolTable,
    vaults: HashMap<Address, VaultEntry>,
    user_vault: HashMap<Address, Address>,
}

pub struct VaultRegistry {
    owner_policy: Arc<dyn AccessPolicy>,
    assets: Arc<dyn AssetProvider>,
    clock: Arc<dyn Clock>,
    defaults: VaultDefaults,
    state: RwLock<RegistryState>,
}

impl VaultRegistry {
    pub fn new(
        owner_policy: Arc<dyn AccessPolicy>,
        assets: Arc<dyn AssetProvider>,
        clock: Arc<dyn Clock>,
        implementation: &Address,
        defaults: VaultDefaults,
    ) -> Result<Self, VaultError> {
        if implementation.is_zero() {
            return Err(VaultError::InvalidImplementationAddress);
        }
        Ok(Self {
            owner_policy,
            assets,
            clock,
            defaults,
            state: RwLock::new(RegistryState {
                implementation: implementation.clone(),
                next_strategy_id: 1,
                salt: uuid::Uuid::new_v4().to_string(),
                symbols: SymbolTable::new(),
                vaults: HashMap::new(),
                user_vault: HashMap::new(),
            }),
        })
    }

    /// Create a vault bound to the current implementation. Callable by anyone;
    /// the caller is recorded as the creator.
    pub fn create_vault(
        &self,
        caller: &Address,
        params: CreateVaultParams,
    ) -> Result<Address, VaultError> {
        if caller.is_zero() {
            return Err(VaultError::InvalidAddress { field: "creator" });
        }
        let mut state = self.state.write();
        if state.implementation.is_zero() {
            return Err(VaultError::InvalidImplementationAddress);
        }
        if params.admin.is_zero() {
            return Err(VaultError::InvalidAdminAddress);
        }
        if params.manager.is_zero() {
            return Err(VaultError::InvalidManagerAddress);
        }
        if params.asset.is_zero() {
            return Err(VaultError::InvalidAsset {
                asset: params.asset.to_string(),
            });
        }
        if params.strategy_symbol.trim().is_empty() {
            return Err(VaultError::InvalidStrategyId {
                reference: "empty strategy symbol".to_string(),
            });
        }
        if state.symbols.contains(&params.strategy_symbol) {
            return Err(VaultError::StrategySymbolAlreadyExists {
                symbol: params.strategy_symbol,
            });
        }

        let strategy_id = state.next_strategy_id;
        let address = derive_vault_address(&state.salt, strategy_id, &params.strategy_symbol);
        let binding = self
            .assets
            .bind(&params.asset, &address)
            .map_err(|_| VaultError::InvalidAsset {
                asset: params.asset.to_string(),
            })?;
        let asset_decimals = binding.decimals();
        asset_unit(asset_decimals).map_err(|_| VaultError::InvalidAsset {
            asset: params.asset.to_string(),
        })?;

        let policy = Arc::new(
            RoleTable::new()
                .with(&params.admin, Role::Admin)
                .with(&params.manager, Role::Manager),
        );
        let profile = VaultProfile {
            strategy_id,
            address: address.clone(),
            name: params.name,
            symbol: params.symbol,
            strategy_symbol: params.strategy_symbol.clone(),
            asset: params.asset,
            asset_decimals,
            admin: params.admin,
            manager: params.manager,
            end_time: params.end_time,
            platform_label: self.defaults.platform_label.clone(),
            unlock_lock_period_secs: self.defaults.unlock_lock_period_secs,
            allow_unlock_cancel: self.defaults.allow_unlock_cancel,
            max_pending_page: self.defaults.max_pending_page,
        };
        let vault = VaultInstance::new(
            profile,
            state.implementation.clone(),
            policy,
            binding,
            self.clock.clone(),
        )?;

        state.symbols.register(&params.strategy_symbol, &address)?;
        let record = RegistryVaultRecord {
            address: address.clone(),
            strategy_symbol: params.strategy_symbol.clone(),
            strategy_id,
            creator: caller.clone(),
            ordinal: state.vaults.len() as u64,
        };
        state.vaults.insert(
            address.clone(),
            VaultEntry {
                record,
                handle: Arc::new(Mutex::new(vault)),
            },
        );
        state.user_vault.insert(caller.clone(), address.clone());
        state.next_strategy_id += 1;

        info!(
            vault = %address,
            strategy_id,
            strategy_symbol = %params.strategy_symbol,
            creator = %caller,
            implementation = %state.implementation,
            "vault created"
        );
        Ok(address)
    }

    /// Owner-only. Applies to vaults created after this call.
    pub fn update_implementation(
        &self,
        caller: &Address,
        implementation: &Address,
    ) -> Result<(), VaultError> {
        if let Err(e) = self.owner_policy.require(caller, Role::Owner) {
            warn!(caller = %caller, "update_implementation rejected");
            return Err(e);
        }
        if implementation.is_zero() {
            return Err(VaultError::InvalidImplementationAddress);
        }
        let mut state = self.state.write();
        let previous = std::mem::replace(&mut state.implementation, implementation.clone());
        info!(from = %previous, to = %implementation, "vault implementation updated");
        Ok(())
    }

    // =========================================================================
    // QUERIES
    // =========================================================================

    /// Vault addresses in creation order.
    pub fn get_all_vaults(&self) -> Vec<Address> {
        self.state.read().symbols.all().to_vec()
    }

    pub fn get_vault_count(&self) -> usize {
        self.state.read().symbols.len()
    }

    pub fn symbol_vault(&self, strategy_symbol: &str) -> Option<Address> {
        self.state.read().symbols.lookup(strategy_symbol).cloned()
    }

    /// Latest vault created by `creator`.
    pub fn get_user_vault(&self, creator: &Address) -> Option<Address> {
        self.state.read().user_vault.get(creator).cloned()
    }

    pub fn vault_implementation(&self) -> Address {
        self.state.read().implementation.clone()
    }

    pub fn next_strategy_id(&self) -> u64 {
        self.state.read().next_strategy_id
    }

    pub fn get_vault(&self, address: &Address) -> Option<VaultHandle> {
        self.state
            .read()
            .vaults
            .get(address)
            .map(|e| e.handle.clone())
    }

    pub fn vault_by_symbol(&self, strategy_symbol: &str) -> Option<VaultHandle> {
        let state = self.state.read();
        let address = state.symbols.lookup(strategy_symbol)?;
        state.vaults.get(address).map(|e| e.handle.clone())
    }

    /// Like [`get_vault`](Self::get_vault) but fails with `InvalidStrategyId`.
    pub fn require_vault(&self, reference: &str) -> Result<VaultHandle, VaultError> {
        self.vault_by_symbol(reference)
            .or_else(|| self.get_vault(&Address::new(reference)))
            .ok_or_else(|| VaultError::InvalidStrategyId {
                reference: reference.to_string(),
            })
    }

    pub fn listings(&self) -> Vec<VaultListing> {
        let state = self.state.read();
        state
            .symbols
            .all()
            .iter()
            .filter_map(|addr| state.vaults.get(addr))
            .map(|e| VaultListing {
                address: e.record.address.clone(),
                strategy_id: e.record.strategy_id,
                strategy_symbol: e.record.strategy_symbol.clone(),
                creator: e.record.creator.clone(),
                tvl: e.handle.lock().tvl(),
            })
            .collect()
    }

    // =========================================================================
    // PERSISTENCE
    // =========================================================================

    fn snapshot(&self) -> (RegistryStateRecord, Vec<RegistryVaultRecord>, Vec<VaultStorage>) {
        let state = self.state.read();
        let record = RegistryStateRecord {
            implementation: state.implementation.clone(),
            next_strategy_id: state.next_strategy_id,
            salt: state.salt.clone(),
        };
        let mut rows = Vec::with_capacity(state.vaults.len());
        let mut storages = Vec::with_capacity(state.vaults.len());
        for addr in state.symbols.all() {
            if let Some(entry) = state.vaults.get(addr) {
                rows.push(entry.record.clone());
                storages.push(entry.handle.lock().storage());
            }
        }
        (record, rows, storages)
    }

    /// Write the registry and every vault's storage.
    pub async fn persist(&self, db: &VaultDb) -> anyhow::Result<()> {
        let (record, rows, storages) = self.snapshot();
        db.save_registry(&record, &rows).await?;
        for storage in &storages {
            db.save_vault(storage).await?;
        }
        info!(vaults = rows.len(), "registry persisted");
        Ok(())
    }

    /// Rebuild the registry and its vaults from `db`. An empty database yields
    /// a fresh registry using `implementation`.
    pub async fn restore(
        db: &VaultDb,
        owner_policy: Arc<dyn AccessPolicy>,
        assets: Arc<dyn AssetProvider>,
        clock: Arc<dyn Clock>,
        implementation: &Address,
        defaults: VaultDefaults,
    ) -> anyhow::Result<Self> {
        use anyhow::Context;

        let Some((record, rows)) = db.load_registry().await? else {
            info!("no persisted registry, starting empty");
            return Ok(Self::new(owner_policy, assets, clock, implementation, defaults)?);
        };

        let mut symbols = SymbolTable::new();
        let mut vaults = HashMap::new();
        let mut user_vault = HashMap::new();
        for row in rows {
            let storage = db
                .load_vault_storage(&row.address)
                .await?
                .with_context(|| format!("missing storage for vault {}", row.address))?;
            let binding = assets
                .bind(&storage.profile.asset, &row.address)
                .with_context(|| format!("bind asset for vault {}", row.address))?;
            let policy = Arc::new(
                RoleTable::new()
                    .with(&storage.profile.admin, Role::Admin)
                    .with(&storage.profile.manager, Role::Manager),
            );
            let vault = VaultInstance::from_storage(storage, policy, binding, clock.clone())
                .with_context(|| format!("restore vault {}", row.address))?;

            symbols.register(&row.strategy_symbol, &row.address)?;
            user_vault.insert(row.creator.clone(), row.address.clone());
            vaults.insert(
                row.address.clone(),
                VaultEntry {
                    record: row,
                    handle: Arc::new(Mutex::new(vault)),
                },
            );
        }

        info!(
            vaults = vaults.len(),
            implementation = %record.implementation,
            next_strategy_id = record.next_strategy_id,
            "registry restored"
        );
        Ok(Self {
            owner_policy,
            assets,
            clock,
            defaults,
            state: RwLock::new(RegistryState {
                implementation: record.implementation,
                next_strategy_id: record.next_strategy_id,
                salt: record.salt,
                symbols,
                vaults,
                user_vault,
            }),
        })
    }
}

/// First 20 bytes of `SHA-256("strategy-vault" || salt || id || symbol)`.
pub fn derive_vault_address(salt: &str, strategy_id: u64, strategy_symbol: &str) -> Address {
    let mut hasher = Sha256::new();
    hasher.update(b"strategy-vault");
    hasher.update(salt.as_bytes());
    hasher.update(strategy_id.to_be_bytes());
    hasher.update(strategy_symbol.as_bytes());
    let digest = hasher.finalize();
    Address::new(format!("0x{}", hex::encode(&digest[..20])))
}
