//! Registry persistence against a temporary SQLite database
//!
//! Snapshot, restore and legacy (schema v1) import.

use std::sync::Arc;

use serde_json::Value;
use tempfile::NamedTempFile;

use strategy_vault::registry::{CreateVaultParams, VaultDefaults, VaultRegistry};
use strategy_vault::vault::{
    Address, ManualClock, Role, RoleTable, TokenLedger, TokenRegistry, TradeDetail, TradeType,
    UnlockEntry, UnlockStatus, VaultDb, CURRENT_SCHEMA_VERSION,
};

const E18: u128 = 1_000_000_000_000_000_000;
const USDC: u128 = 1_000_000;

fn temp_db() -> (VaultDb, NamedTempFile) {
    let temp_file = NamedTempFile::new().unwrap();
    let db = VaultDb::new(temp_file.path().to_str().unwrap()).unwrap();
    (db, temp_file)
}

fn tokens() -> (Arc<TokenRegistry>, Arc<TokenLedger>) {
    let tokens = Arc::new(TokenRegistry::new());
    let usdc = Arc::new(TokenLedger::new(&Address::new("0xusdc"), "USDC", 6));
    tokens.register(usdc.clone());
    (tokens, usdc)
}

fn owner_policy() -> Arc<RoleTable> {
    Arc::new(RoleTable::new().with(&Address::new("0xowner"), Role::Owner))
}

fn params(strategy_symbol: &str) -> CreateVaultParams {
    CreateVaultParams {
        admin: Address::new("0xadmin"),
        manager: Address::new("0xmanager"),
        asset: Address::new("0xusdc"),
        name: "ETH Long".to_string(),
        symbol: "qETH".to_string(),
        strategy_symbol: strategy_symbol.to_string(),
        end_time: 0,
    }
}

/// Registry with one vault holding a deposit, a position and an open unlock.
fn populated(clock: Arc<ManualClock>) -> (VaultRegistry, Address) {
    let (tokens, usdc) = tokens();
    let registry = VaultRegistry::new(
        owner_policy(),
        tokens,
        clock,
        &Address::new("0ximpl-v1"),
        VaultDefaults::default(),
    )
    .unwrap();

    let user = Address::new("0xuser1");
    let manager = Address::new("0xmanager");
    let address = registry.create_vault(&user, params("ETH-PERP-LONG")).unwrap();
    usdc.mint(&user, 1_000 * USDC).unwrap();
    usdc.approve(&user, &address, u128::MAX);

    let handle = registry.get_vault(&address).unwrap();
    let mut vault = handle.lock();
    let target = vault
        .register_investment_target(&manager, "ETH-PERP", &Address::new("0xusdc"))
        .unwrap();
    vault.deposit(&user, 1_000 * USDC).unwrap();
    vault.admin_withdraw(&manager, &user, 1_000 * USDC).unwrap();
    vault
        .update_user_position_and_assets(
            &manager,
            &[TradeDetail {
                user: user.clone(),
                target_id: target,
                trade_type: TradeType::Invest,
                total_amount: 1_000 * USDC,
                total_shares: 10 * E18,
                trade_price: 100 * E18,
                trade_time: 0,
                unlock_request_id: 0,
            }],
        )
        .unwrap();
    vault
        .unlock_investment_shares(
            &user,
            &[UnlockEntry {
                target_id: target,
                unlock_shares: 3 * E18,
            }],
        )
        .unwrap();
    drop(vault);

    (registry, address)
}

#[tokio::test]
async fn restore_from_empty_database_starts_fresh() {
    let (db, _temp) = temp_db();
    let (tokens, _) = tokens();
    let registry = VaultRegistry::restore(
        &db,
        owner_policy(),
        tokens,
        Arc::new(ManualClock::new(1_000)),
        &Address::new("0ximpl-v1"),
        VaultDefaults::default(),
    )
    .await
    .unwrap();

    assert_eq!(registry.get_vault_count(), 0);
    assert_eq!(registry.next_strategy_id(), 1);
    assert_eq!(registry.vault_implementation(), Address::new("0ximpl-v1"));
}

#[tokio::test]
async fn persisted_registry_round_trips() {
    let (db, _temp) = temp_db();
    let clock = Arc::new(ManualClock::new(1_700_000_000));
    let (registry, address) = populated(clock.clone());
    let before = registry.get_vault(&address).unwrap().lock().storage();
    registry.persist(&db).await.unwrap();

    let (tokens, _) = tokens();
    let restored = VaultRegistry::restore(
        &db,
        owner_policy(),
        tokens,
        clock,
        // Ignored: the persisted registry carries its own implementation
        &Address::new("0ximpl-other"),
        VaultDefaults::default(),
    )
    .await
    .unwrap();

    assert_eq!(restored.get_all_vaults(), vec![address.clone()]);
    assert_eq!(restored.symbol_vault("ETH-PERP-LONG"), Some(address.clone()));
    assert_eq!(
        restored.get_user_vault(&Address::new("0xuser1")),
        Some(address.clone())
    );
    assert_eq!(restored.vault_implementation(), Address::new("0ximpl-v1"));
    assert_eq!(restored.next_strategy_id(), 2);

    let after = restored.get_vault(&address).unwrap().lock().storage();
    assert_eq!(after, before);

    // The next vault continues the id sequence
    let second = restored
        .create_vault(&Address::new("0xuser2"), params("BTC-PERP-LONG"))
        .unwrap();
    assert_ne!(second, address);
    let info = restored.get_vault(&second).unwrap().lock().get_strategy_info();
    assert_eq!(info.strategy_id, 2);
}

#[tokio::test]
async fn legacy_snapshot_is_migrated_on_load() {
    let (db, _temp) = temp_db();
    let clock = Arc::new(ManualClock::new(1_700_000_000));
    let (registry, address) = populated(clock.clone());
    registry.persist(&db).await.unwrap();

    // Rewrite the stored snapshot in the v1 layout
    let current = registry.get_vault(&address).unwrap().lock().storage();
    let mut legacy = serde_json::to_value(&current).unwrap();
    let root = legacy.as_object_mut().unwrap();
    root.remove("schema_version");
    root.remove("total_fees_collected");
    for req in root["unlock_requests"].as_array_mut().unwrap() {
        let fields = req.as_object_mut().unwrap();
        fields.remove("status");
        fields.remove("fulfilled_at");
        fields.insert("fulfilled".to_string(), Value::Bool(false));
    }
    db.import_raw_storage(
        &address,
        1,
        &current.implementation,
        &serde_json::to_string(&legacy).unwrap(),
    )
    .await
    .unwrap();
    assert_eq!(db.stored_schema_version(&address).await.unwrap(), Some(1));

    let loaded = db.load_vault_storage(&address).await.unwrap().unwrap();
    assert_eq!(loaded.schema_version, CURRENT_SCHEMA_VERSION);
    assert_eq!(loaded.total_fees_collected, 0);
    assert_eq!(loaded.unlock_requests[0].status, UnlockStatus::Pending);
    assert_eq!(loaded.positions, current.positions);

    let (tokens, _) = tokens();
    let restored = VaultRegistry::restore(
        &db,
        owner_policy(),
        tokens,
        clock,
        &Address::new("0ximpl-v1"),
        VaultDefaults::default(),
    )
    .await
    .unwrap();
    let vault = restored.get_vault(&address).unwrap();
    let vault = vault.lock();
    assert_eq!(vault.unlock_request(1).unwrap().status, UnlockStatus::Pending);
    assert_eq!(vault.tvl(), 1_000 * USDC);
}
