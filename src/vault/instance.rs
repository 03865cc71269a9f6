//! Vault instance: the public operations of one strategy vault.
//!
//! Composes the [`PositionLedger`], the [`UnlockQueue`] and the investment
//! target registry. Restricted calls check the [`AccessPolicy`] first; every
//! call validates in full, then performs at most one asset transfer, then
//! commits. A failed transfer therefore leaves the vault untouched.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::vault::access::{AccessPolicy, Role};
use crate::vault::asset::AssetTransferService;
use crate::vault::clock::Clock;
use crate::vault::error::VaultError;
use crate::vault::fixed_point::{Amount, BPS_DENOMINATOR};
use crate::vault::ledger::{FeeSchedule, PositionLedger, TradeOutcome};
use crate::vault::schema::{self, PositionRecord, UserAssetRecord, VaultStorage, CURRENT_SCHEMA_VERSION};
use crate::vault::types::{
    Address, InvestmentTarget, StrategyInfo, TargetId, TradeDetail, TradeType, UnlockEntry,
    UnlockRequest, UserAsset, UserPosition, DEFAULT_PLATFORM_LABEL,
};
use crate::vault::unlock_queue::{UnlockQueue, DEFAULT_UNLOCK_LOCK_PERIOD_SECS};

pub const DEFAULT_MAX_PENDING_PAGE: usize = 1_000;

fn default_platform_label() -> String {
    DEFAULT_PLATFORM_LABEL.to_string()
}

fn default_lock_period() -> i64 {
    DEFAULT_UNLOCK_LOCK_PERIOD_SECS
}

fn default_max_pending_page() -> usize {
    DEFAULT_MAX_PENDING_PAGE
}

/// Identity and fixed configuration of a vault, set at creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaultProfile {
    pub strategy_id: u64,
    pub address: Address,
    pub name: String,
    pub symbol: String,
    pub strategy_symbol: String,
    pub asset: Address,
    pub asset_decimals: u32,
    pub admin: Address,
    pub manager: Address,
    pub end_time: i64,
    #[serde(default = "default_platform_label")]
    pub platform_label: String,
    #[serde(default = "default_lock_period")]
    pub unlock_lock_period_secs: i64,
    #[serde(default)]
    pub allow_unlock_cancel: bool,
    #[serde(default = "default_max_pending_page")]
    pub max_pending_page: usize,
}

/// Per-user view: capital record plus every position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserSummary {
    pub user: Address,
    pub asset: UserAsset,
    pub positions: Vec<(TargetId, UserPosition)>,
}

pub struct VaultInstance {
    profile: VaultProfile,
    implementation: Address,
    ledger: PositionLedger,
    unlocks: UnlockQueue,
    targets: BTreeMap<TargetId, InvestmentTarget>,
    fees: FeeSchedule,
    policy: Arc<dyn AccessPolicy>,
    assets: Arc<dyn AssetTransferService>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for VaultInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VaultInstance")
            .field("address", &self.profile.address)
            .field("strategy_symbol", &self.profile.strategy_symbol)
            .field("implementation", &self.implementation)
            .field("tvl", &self.ledger.tvl())
            .finish()
    }
}

impl VaultInstance {
    pub fn new(
        profile: VaultProfile,
        implementation: Address,
        policy: Arc<dyn AccessPolicy>,
        assets: Arc<dyn AssetTransferService>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, VaultError> {
        Self::check_binding(&profile, &implementation, assets.as_ref())?;
        let unlocks = UnlockQueue::new(profile.unlock_lock_period_secs, profile.allow_unlock_cancel);
        Ok(Self {
            profile,
            implementation,
            ledger: PositionLedger::new(),
            unlocks,
            targets: BTreeMap::new(),
            fees: FeeSchedule::default(),
            policy,
            assets,
            clock,
        })
    }

    /// Rebuild from persisted storage, migrating it first if needed.
    pub fn from_storage(
        storage: VaultStorage,
        policy: Arc<dyn AccessPolicy>,
        assets: Arc<dyn AssetTransferService>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, VaultError> {
        let mut vault = Self::new(
            storage.profile.clone(),
            storage.implementation.clone(),
            policy,
            assets,
            clock,
        )?;
        vault.load_storage(storage)?;
        Ok(vault)
    }

    fn check_binding(
        profile: &VaultProfile,
        implementation: &Address,
        assets: &dyn AssetTransferService,
    ) -> Result<(), VaultError> {
        if implementation.is_zero() {
            return Err(VaultError::InvalidImplementationAddress);
        }
        if profile.admin.is_zero() {
            return Err(VaultError::InvalidAdminAddress);
        }
        if profile.manager.is_zero() {
            return Err(VaultError::InvalidManagerAddress);
        }
        if profile.asset.is_zero() || assets.asset() != &profile.asset {
            return Err(VaultError::InvalidAsset {
                asset: profile.asset.to_string(),
            });
        }
        Ok(())
    }

    fn authorize(&self, caller: &Address, role: Role, operation: &str) -> Result<(), VaultError> {
        self.policy.require(caller, role).map_err(|e| {
            warn!(
                vault = %self.profile.address,
                caller = %caller,
                role = role.as_str(),
                operation,
                "restricted call rejected"
            );
            e
        })
    }

    // =========================================================================
    // CAPITAL
    // =========================================================================

    /// Pull `amount` from `caller` into custody and credit their `total_amount`.
    pub fn deposit(&mut self, caller: &Address, amount: Amount) -> Result<UserAsset, VaultError> {
        require_address(caller, "user")?;
        let change = self.ledger.stage_deposit(caller, amount)?;
        self.assets.transfer_in(caller, amount)?;
        let next = change.next.clone();
        self.ledger.commit(change);

        info!(
            vault = %self.profile.address,
            user = %caller,
            amount = %amount,
            tvl = %self.ledger.tvl(),
            "deposit"
        );
        Ok(next)
    }

    /// Move `amount` of `user`'s available capital to the manager for deployment.
    pub fn admin_withdraw(
        &mut self,
        caller: &Address,
        user: &Address,
        amount: Amount,
    ) -> Result<UserAsset, VaultError> {
        self.authorize(caller, Role::Manager, "admin_withdraw")?;
        require_address(user, "user")?;
        let change = self.ledger.stage_lock(user, amount)?;
        self.assets.transfer_out(caller, amount)?;
        let next = change.next.clone();
        self.ledger.commit(change);

        info!(
            vault = %self.profile.address,
            manager = %caller,
            user = %user,
            amount = %amount,
            locked = %next.locked_amount,
            "capital deployed"
        );
        Ok(next)
    }

    /// Reconcile a batch of externally executed trades. All or nothing.
    pub fn update_user_position_and_assets(
        &mut self,
        caller: &Address,
        trades: &[TradeDetail],
    ) -> Result<Vec<TradeOutcome>, VaultError> {
        self.authorize(caller, Role::Manager, "update_user_position_and_assets")?;
        let now = self.clock.now();
        let decimals = self.profile.asset_decimals;
        let mut closing: Vec<u64> = Vec::new();
        let mut outcomes = Vec::with_capacity(trades.len());

        let mut batch = self.ledger.begin_settlement();
        for (index, trade) in trades.iter().enumerate() {
            if trade.user.is_zero() {
                return Err(VaultError::InvalidTrade {
                    index,
                    reason: "user address is zero".to_string(),
                });
            }
            if !self.targets.contains_key(&trade.target_id) {
                return Err(VaultError::InvestmentTargetNotRegistered {
                    target_id: trade.target_id,
                });
            }
            let release = match (trade.trade_type, trade.unlock_request_id) {
                (_, 0) => 0,
                (TradeType::Invest, request_id) => {
                    return Err(VaultError::InvalidTrade {
                        index,
                        reason: format!("INVEST trade cannot close unlock request {}", request_id),
                    });
                }
                (TradeType::Withdraw, request_id) => {
                    if closing.contains(&request_id) {
                        return Err(VaultError::UnlockRequestAlreadyClosed { request_id });
                    }
                    let shares = self.unlocks.check_fulfilment(
                        request_id,
                        &trade.user,
                        &trade.target_id,
                        now,
                    )?;
                    // The closing trade must cover every requested share
                    if trade.total_shares < shares {
                        return Err(VaultError::UnlockRequestMismatch {
                            request_id,
                            reason: format!(
                                "trade closes {} shares, request holds {}",
                                trade.total_shares, shares
                            ),
                        });
                    }
                    closing.push(request_id);
                    shares
                }
            };
            outcomes.push(batch.apply_trade(index, trade, decimals, &self.fees, release)?);
        }
        let changes = batch.finish();

        self.ledger.commit_settlement(changes);
        self.unlocks.mark_fulfilled(&closing, now);

        let fees: Amount = outcomes.iter().map(|o| o.fee).sum();
        info!(
            vault = %self.profile.address,
            trades = trades.len(),
            unlocks_fulfilled = closing.len(),
            fees = %fees,
            "trades settled"
        );
        Ok(outcomes)
    }

    /// Pay `amount` of realized proceeds to `caller`.
    pub fn withdraw(&mut self, caller: &Address, amount: Amount) -> Result<UserAsset, VaultError> {
        require_address(caller, "user")?;
        let change = self.ledger.stage_payout(caller, amount)?;
        self.assets.transfer_out(caller, amount)?;
        let next = change.next.clone();
        self.ledger.commit(change);

        info!(
            vault = %self.profile.address,
            user = %caller,
            amount = %amount,
            tvl = %self.ledger.tvl(),
            "withdraw"
        );
        Ok(next)
    }

    /// Bring deployed capital back from the manager into custody.
    pub fn return_capital(&mut self, caller: &Address, amount: Amount) -> Result<(), VaultError> {
        self.authorize(caller, Role::Manager, "return_capital")?;
        if amount == 0 {
            return Err(VaultError::ZeroAmount);
        }
        self.assets.transfer_in(caller, amount)?;
        info!(
            vault = %self.profile.address,
            manager = %caller,
            amount = %amount,
            "capital returned"
        );
        Ok(())
    }

    // =========================================================================
    // UNLOCKS
    // =========================================================================

    /// Earmark shares and open one unlock request per entry. Returns request ids.
    pub fn unlock_investment_shares(
        &mut self,
        caller: &Address,
        entries: &[UnlockEntry],
    ) -> Result<Vec<u64>, VaultError> {
        require_address(caller, "user")?;
        for entry in entries {
            if !self.targets.contains_key(&entry.target_id) {
                return Err(VaultError::InvestmentTargetNotRegistered {
                    target_id: entry.target_id,
                });
            }
        }
        let wanted: Vec<_> = entries
            .iter()
            .map(|e| (e.target_id, e.unlock_shares))
            .collect();
        let staged = self.ledger.stage_earmarks(caller, &wanted)?;

        let now = self.clock.now();
        self.ledger.commit_positions(caller, staged);
        let ids: Vec<u64> = entries
            .iter()
            .map(|e| self.unlocks.enqueue(caller, e.target_id, e.unlock_shares, now))
            .collect();

        info!(
            vault = %self.profile.address,
            user = %caller,
            requests = ?ids,
            eligible_at = now.saturating_add(self.unlocks.lock_period_secs()),
            "unlock requested"
        );
        Ok(ids)
    }

    /// Eligible pending requests in creation order. `max_count` is clamped to
    /// the vault's page limit.
    pub fn get_pending_unlock_requests(&self, max_count: usize) -> Vec<UnlockRequest> {
        let max = max_count.min(self.profile.max_pending_page);
        self.unlocks.pending(self.clock.now(), max)
    }

    /// Withdraw a pending request and release its earmark. Only available when
    /// the vault was created with unlock cancellation enabled.
    pub fn cancel_unlock_request(
        &mut self,
        caller: &Address,
        request_id: u64,
    ) -> Result<UnlockRequest, VaultError> {
        let request = self.unlocks.check_cancel(caller, request_id)?;
        let pos = self
            .ledger
            .stage_release(&request.user, &request.target_id, request.shares)?;
        self.ledger
            .commit_positions(&request.user, [(request.target_id, pos)]);
        self.unlocks.mark_cancelled(request_id);

        info!(
            vault = %self.profile.address,
            user = %caller,
            request_id,
            "unlock request cancelled"
        );
        Ok(request)
    }

    // =========================================================================
    // CONFIGURATION
    // =========================================================================

    pub fn register_investment_target(
        &mut self,
        caller: &Address,
        symbol: &str,
        asset: &Address,
    ) -> Result<TargetId, VaultError> {
        self.authorize(caller, Role::Manager, "register_investment_target")?;
        if asset.is_zero() || asset != &self.profile.asset {
            return Err(VaultError::InvalidAsset {
                asset: asset.to_string(),
            });
        }
        let target_id = self.target_id_for(symbol);
        if self.targets.contains_key(&target_id) {
            return Err(VaultError::InvestmentTargetAlreadyRegistered {
                symbol: symbol.to_string(),
                target_id,
            });
        }
        self.targets.insert(
            target_id,
            InvestmentTarget {
                target_id,
                symbol: symbol.to_string(),
                asset: asset.clone(),
                registered_at: self.clock.now(),
            },
        );
        info!(
            vault = %self.profile.address,
            symbol,
            target = %target_id,
            "investment target registered"
        );
        Ok(target_id)
    }

    pub fn set_fee_receiver(&mut self, caller: &Address, receiver: &Address) -> Result<(), VaultError> {
        self.authorize(caller, Role::Manager, "set_fee_receiver")?;
        require_address(receiver, "fee_receiver")?;
        self.fees.receiver = Some(receiver.clone());
        info!(vault = %self.profile.address, receiver = %receiver, "fee receiver set");
        Ok(())
    }

    pub fn set_fee_rate(&mut self, caller: &Address, rate_bps: u32) -> Result<(), VaultError> {
        self.authorize(caller, Role::Manager, "set_fee_rate")?;
        if rate_bps as u128 > BPS_DENOMINATOR {
            return Err(VaultError::InvalidFeeRate { rate_bps });
        }
        self.fees.rate_bps = rate_bps;
        info!(vault = %self.profile.address, rate_bps, "fee rate set");
        Ok(())
    }

    /// Swap vault logic in place. Storage is round-tripped through the
    /// versioned schema so the new version reads migrated records.
    pub fn upgrade_to(&mut self, caller: &Address, implementation: &Address) -> Result<(), VaultError> {
        self.authorize(caller, Role::Admin, "upgrade_to")?;
        if implementation.is_zero() {
            return Err(VaultError::InvalidImplementationAddress);
        }
        let raw = serde_json::to_value(self.storage()).map_err(|e| VaultError::Storage {
            reason: e.to_string(),
        })?;
        let migrated = schema::migrate(raw)?;
        self.load_storage(migrated)?;

        let previous = std::mem::replace(&mut self.implementation, implementation.clone());
        info!(
            vault = %self.profile.address,
            from = %previous,
            to = %implementation,
            "vault upgraded"
        );
        Ok(())
    }

    // =========================================================================
    // QUERIES
    // =========================================================================

    pub fn get_strategy_info(&self) -> StrategyInfo {
        StrategyInfo {
            strategy_id: self.profile.strategy_id,
            address: self.profile.address.clone(),
            name: self.profile.name.clone(),
            symbol: self.profile.symbol.clone(),
            strategy_symbol: self.profile.strategy_symbol.clone(),
            asset: self.profile.asset.clone(),
            asset_decimals: self.profile.asset_decimals,
            admin: self.profile.admin.clone(),
            manager: self.profile.manager.clone(),
            end_time: self.profile.end_time,
            tvl: self.ledger.tvl(),
            fee_rate_bps: self.fees.rate_bps,
            fee_receiver: self.fees.receiver.clone(),
            unlock_lock_period_secs: self.unlocks.lock_period_secs(),
            implementation: self.implementation.clone(),
            target_count: self.targets.len(),
            user_count: self.ledger.user_count(),
        }
    }

    pub fn get_user_asset(&self, user: &Address) -> UserAsset {
        self.ledger.user_asset(user)
    }

    pub fn user_assets(&self, user: &Address) -> UserAsset {
        self.get_user_asset(user)
    }

    pub fn user_positions(&self, user: &Address, target_id: &TargetId) -> UserPosition {
        self.ledger.position(user, target_id)
    }

    pub fn get_user_positions(&self, user: &Address) -> Vec<(TargetId, UserPosition)> {
        self.ledger.positions_of(user)
    }

    pub fn user_summary(&self, user: &Address) -> UserSummary {
        UserSummary {
            user: user.clone(),
            asset: self.get_user_asset(user),
            positions: self.get_user_positions(user),
        }
    }

    pub fn unlock_request(&self, request_id: u64) -> Option<UnlockRequest> {
        self.unlocks.get(request_id).cloned()
    }

    pub fn unlock_requests(&self) -> &[UnlockRequest] {
        self.unlocks.requests()
    }

    pub fn get_investment_target(&self, target_id: &TargetId) -> Option<&InvestmentTarget> {
        self.targets.get(target_id)
    }

    pub fn investment_targets(&self) -> Vec<InvestmentTarget> {
        self.targets.values().cloned().collect()
    }

    pub fn target_id_for(&self, symbol: &str) -> TargetId {
        TargetId::derive(&self.profile.platform_label, symbol)
    }

    pub fn has_role(&self, principal: &Address, role: Role) -> bool {
        self.policy.has_capability(principal, role)
    }

    pub fn tvl(&self) -> Amount {
        self.ledger.tvl()
    }

    pub fn total_fees_collected(&self) -> Amount {
        self.ledger.total_fees_collected()
    }

    pub fn address(&self) -> &Address {
        &self.profile.address
    }

    pub fn strategy_symbol(&self) -> &str {
        &self.profile.strategy_symbol
    }

    pub fn implementation(&self) -> &Address {
        &self.implementation
    }

    pub fn profile(&self) -> &VaultProfile {
        &self.profile
    }

    /// Asset held in custody by this vault.
    pub fn custody_balance(&self) -> Amount {
        self.assets.balance_of(&self.profile.address)
    }

    // =========================================================================
    // STORAGE
    // =========================================================================

    /// Complete persisted state at the current schema version.
    pub fn storage(&self) -> VaultStorage {
        VaultStorage {
            schema_version: CURRENT_SCHEMA_VERSION,
            profile: self.profile.clone(),
            implementation: self.implementation.clone(),
            fee_rate_bps: self.fees.rate_bps,
            fee_receiver: self.fees.receiver.clone(),
            tvl: self.ledger.tvl(),
            total_fees_collected: self.ledger.total_fees_collected(),
            user_assets: self
                .ledger
                .user_assets()
                .map(|(user, asset)| UserAssetRecord {
                    user: user.clone(),
                    asset: asset.clone(),
                })
                .collect(),
            positions: self
                .ledger
                .positions()
                .map(|(user, target_id, position)| PositionRecord {
                    user: user.clone(),
                    target_id: *target_id,
                    position: position.clone(),
                })
                .collect(),
            targets: self.investment_targets(),
            unlock_requests: self.unlocks.requests().to_vec(),
        }
    }

    fn load_storage(&mut self, storage: VaultStorage) -> Result<(), VaultError> {
        if storage.schema_version != CURRENT_SCHEMA_VERSION {
            return Err(VaultError::UnsupportedSchema {
                found: storage.schema_version,
                supported: CURRENT_SCHEMA_VERSION,
            });
        }
        if storage.profile.address != self.profile.address {
            return Err(VaultError::Storage {
                reason: format!(
                    "storage belongs to {}, not {}",
                    storage.profile.address, self.profile.address
                ),
            });
        }
        if storage.fee_rate_bps as u128 > BPS_DENOMINATOR {
            return Err(VaultError::InvalidFeeRate {
                rate_bps: storage.fee_rate_bps,
            });
        }

        self.ledger = PositionLedger::from_parts(
            storage.user_assets.into_iter().map(|r| (r.user, r.asset)),
            storage
                .positions
                .into_iter()
                .map(|r| (r.user, r.target_id, r.position)),
            storage.tvl,
            storage.total_fees_collected,
        );
        self.unlocks = UnlockQueue::from_requests(
            storage.unlock_requests,
            storage.profile.unlock_lock_period_secs,
            storage.profile.allow_unlock_cancel,
        )?;
        self.targets = storage
            .targets
            .into_iter()
            .map(|t| (t.target_id, t))
            .collect();
        self.fees = FeeSchedule {
            rate_bps: storage.fee_rate_bps,
            receiver: storage.fee_receiver,
        };
        self.profile = storage.profile;
        self.implementation = storage.implementation;

        debug!(
            vault = %self.profile.address,
            users = self.ledger.user_count(),
            requests = self.unlocks.len(),
            "storage loaded"
        );
        Ok(())
    }

    /// Users holding at least one record; used by summaries.
    pub fn users(&self) -> Vec<Address> {
        let mut seen = HashSet::new();
        self.ledger
            .user_assets()
            .map(|(u, _)| u.clone())
            .chain(self.ledger.positions().map(|(u, _, _)| u.clone()))
            .filter(|u| seen.insert(u.clone()))
            .collect()
    }
}

fn require_address(address: &Address, field: &'static str) -> Result<(), VaultError> {
    if address.is_zero() {
        return Err(VaultError::InvalidAddress { field });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vault::access::RoleTable;
    use crate::vault::asset::{TokenLedger, VaultTokenAccount};
    use crate::vault::clock::ManualClock;

    const E18: u128 = 1_000_000_000_000_000_000;
    const USDC: u128 = 1_000_000;

    struct Fixture {
        vault: VaultInstance,
        token: Arc<TokenLedger>,
        clock: Arc<ManualClock>,
        manager: Address,
        admin: Address,
        user: Address,
    }

    fn fixture(allow_cancel: bool) -> Fixture {
        let admin = Address::new("0xadmin");
        let manager = Address::new("0xmanager");
        let user = Address::new("0xuser1");
        let vault_addr = Address::new("0xvault");
        let asset = Address::new("0xusdc");

        let token = Arc::new(TokenLedger::new(&asset, "USDC", 6));
        token.mint(&user, 10_000 * USDC).unwrap();
        token.approve(&user, &vault_addr, u128::MAX);
        token.approve(&manager, &vault_addr, u128::MAX);

        let policy = Arc::new(
            RoleTable::new()
                .with(&admin, Role::Admin)
                .with(&manager, Role::Manager),
        );
        let clock = Arc::new(ManualClock::new(1_700_000_000));
        let profile = VaultProfile {
            strategy_id: 1,
            address: vault_addr.clone(),
            name: "ETH Long".to_string(),
            symbol: "qETH".to_string(),
            strategy_symbol: "ETH-PERP-LONG".to_string(),
            asset,
            asset_decimals: 6,
            admin: admin.clone(),
            manager: manager.clone(),
            end_time: 1_800_000_000,
            platform_label: DEFAULT_PLATFORM_LABEL.to_string(),
            unlock_lock_period_secs: DEFAULT_UNLOCK_LOCK_PERIOD_SECS,
            allow_unlock_cancel: allow_cancel,
            max_pending_page: 2,
        };
        let vault = VaultInstance::new(
            profile,
            Address::new("0ximpl1"),
            policy,
            Arc::new(VaultTokenAccount::new(token.clone(), &vault_addr)),
            clock.clone(),
        )
        .unwrap();
        Fixture {
            vault,
            token,
            clock,
            manager,
            admin,
            user,
        }
    }

    fn invested(f: &mut Fixture) -> TargetId {
        let asset = f.vault.profile().asset.clone();
        let target = f
            .vault
            .register_investment_target(&f.manager, "ETH-PERP", &asset)
            .unwrap();
        f.vault.deposit(&f.user, 1_000 * USDC).unwrap();
        f.vault.admin_withdraw(&f.manager, &f.user, 1_000 * USDC).unwrap();
        f.vault
            .update_user_position_and_assets(
                &f.manager,
                &[TradeDetail {
                    user: f.user.clone(),
                    target_id: target,
                    trade_type: TradeType::Invest,
                    total_amount: 1_000 * USDC,
                    total_shares: 10 * E18,
                    trade_price: 100 * E18,
                    trade_time: f.clock.now(),
                    unlock_request_id: 0,
                }],
            )
            .unwrap();
        target
    }

    #[test]
    fn test_restricted_calls_require_manager() {
        let mut f = fixture(false);
        let outsider = Address::new("0xoutsider");
        let asset = f.vault.profile().asset.clone();

        let err = f
            .vault
            .register_investment_target(&outsider, "ETH-PERP", &asset)
            .unwrap_err();
        assert!(matches!(err, VaultError::Unauthorized { role: Role::Manager, .. }));
        assert!(matches!(
            f.vault.set_fee_rate(&f.admin, 100),
            Err(VaultError::Unauthorized { .. })
        ));
        assert!(f.vault.investment_targets().is_empty());
    }

    #[test]
    fn test_register_target_rejects_foreign_asset() {
        let mut f = fixture(false);
        let err = f
            .vault
            .register_investment_target(&f.manager, "ETH-PERP", &Address::new("0xdai"))
            .unwrap_err();
        assert!(matches!(err, VaultError::InvalidAsset { .. }));
    }

    #[test]
    fn test_fee_rate_bounds() {
        let mut f = fixture(false);
        assert_eq!(
            f.vault.set_fee_rate(&f.manager, 10_001),
            Err(VaultError::InvalidFeeRate { rate_bps: 10_001 })
        );
        f.vault.set_fee_rate(&f.manager, 10_000).unwrap();
        assert_eq!(f.vault.get_strategy_info().fee_rate_bps, 10_000);
        assert!(matches!(
            f.vault.set_fee_receiver(&f.manager, &Address::zero()),
            Err(VaultError::InvalidAddress { .. })
        ));
    }

    #[test]
    fn test_deposit_without_allowance_changes_nothing() {
        let mut f = fixture(false);
        let stranger = Address::new("0xstranger");
        f.token.mint(&stranger, 100 * USDC).unwrap();

        let err = f.vault.deposit(&stranger, 100 * USDC).unwrap_err();
        assert!(matches!(err, VaultError::Transfer(_)));
        assert_eq!(f.vault.tvl(), 0);
        assert_eq!(f.vault.get_user_asset(&stranger), UserAsset::default());
    }

    #[test]
    fn test_settlement_rejects_unregistered_target() {
        let mut f = fixture(false);
        let trade = TradeDetail {
            user: f.user.clone(),
            target_id: f.vault.target_id_for("BTC-PERP"),
            trade_type: TradeType::Invest,
            total_amount: 0,
            total_shares: E18,
            trade_price: E18,
            trade_time: 0,
            unlock_request_id: 0,
        };
        assert!(matches!(
            f.vault.update_user_position_and_assets(&f.manager, &[trade]),
            Err(VaultError::InvestmentTargetNotRegistered { .. })
        ));
    }

    #[test]
    fn test_unlock_then_settle_against_request() {
        let mut f = fixture(false);
        let target = invested(&mut f);

        let ids = f
            .vault
            .unlock_investment_shares(
                &f.user,
                &[UnlockEntry {
                    target_id: target,
                    unlock_shares: 5 * E18,
                }],
            )
            .unwrap();
        assert_eq!(ids, vec![1]);

        let close = TradeDetail {
            user: f.user.clone(),
            target_id: target,
            trade_type: TradeType::Withdraw,
            total_amount: 600 * USDC,
            total_shares: 5 * E18,
            trade_price: 120 * E18,
            trade_time: f.clock.now(),
            unlock_request_id: 1,
        };

        // Still inside the lock period
        let err = f
            .vault
            .update_user_position_and_assets(&f.manager, &[close.clone()])
            .unwrap_err();
        assert!(matches!(err, VaultError::UnlockRequestNotEligible { .. }));

        f.clock.advance(DEFAULT_UNLOCK_LOCK_PERIOD_SECS + 1);
        f.vault
            .update_user_position_and_assets(&f.manager, &[close.clone()])
            .unwrap();

        let pos = f.vault.user_positions(&f.user, &target);
        assert_eq!(pos.hold_shares, 5 * E18);
        assert_eq!(pos.request_unhold_shares, 0);
        assert_eq!(f.vault.get_user_asset(&f.user).unlocked_amount, 600 * USDC);
        assert!(f.vault.get_pending_unlock_requests(10).is_empty());

        // No double fulfilment
        let err = f
            .vault
            .update_user_position_and_assets(&f.manager, &[close])
            .unwrap_err();
        assert_eq!(err, VaultError::UnlockRequestAlreadyClosed { request_id: 1 });
    }

    #[test]
    fn test_same_request_twice_in_batch_rejected() {
        let mut f = fixture(false);
        let target = invested(&mut f);
        f.vault
            .unlock_investment_shares(
                &f.user,
                &[UnlockEntry {
                    target_id: target,
                    unlock_shares: 2 * E18,
                }],
            )
            .unwrap();
        f.clock.advance(DEFAULT_UNLOCK_LOCK_PERIOD_SECS);

        let close = TradeDetail {
            user: f.user.clone(),
            target_id: target,
            trade_type: TradeType::Withdraw,
            total_amount: 200 * USDC,
            total_shares: 2 * E18,
            trade_price: 100 * E18,
            trade_time: f.clock.now(),
            unlock_request_id: 1,
        };
        let err = f
            .vault
            .update_user_position_and_assets(&f.manager, &[close.clone(), close])
            .unwrap_err();
        assert_eq!(err, VaultError::UnlockRequestAlreadyClosed { request_id: 1 });
        assert_eq!(f.vault.user_positions(&f.user, &target).hold_shares, 10 * E18);
        assert!(f.vault.unlock_request(1).unwrap().is_pending());
    }

    #[test]
    fn test_partial_close_cannot_consume_request() {
        let mut f = fixture(false);
        let target = invested(&mut f);
        f.vault
            .unlock_investment_shares(
                &f.user,
                &[UnlockEntry {
                    target_id: target,
                    unlock_shares: 5 * E18,
                }],
            )
            .unwrap();
        f.clock.advance(DEFAULT_UNLOCK_LOCK_PERIOD_SECS);
        let before = f.vault.storage();

        let partial = TradeDetail {
            user: f.user.clone(),
            target_id: target,
            trade_type: TradeType::Withdraw,
            total_amount: 100 * USDC,
            total_shares: E18,
            trade_price: 100 * E18,
            trade_time: f.clock.now(),
            unlock_request_id: 1,
        };
        let err = f
            .vault
            .update_user_position_and_assets(&f.manager, &[partial])
            .unwrap_err();
        assert!(matches!(err, VaultError::UnlockRequestMismatch { request_id: 1, .. }));
        assert_eq!(f.vault.storage(), before);
        assert!(f.vault.unlock_request(1).unwrap().is_pending());
        assert_eq!(f.vault.user_positions(&f.user, &target).request_unhold_shares, 5 * E18);

        // Closing more than requested releases the whole earmark
        let full = TradeDetail {
            user: f.user.clone(),
            target_id: target,
            trade_type: TradeType::Withdraw,
            total_amount: 600 * USDC,
            total_shares: 6 * E18,
            trade_price: 100 * E18,
            trade_time: f.clock.now(),
            unlock_request_id: 1,
        };
        f.vault
            .update_user_position_and_assets(&f.manager, &[full])
            .unwrap();
        let pos = f.vault.user_positions(&f.user, &target);
        assert_eq!(pos.hold_shares, 4 * E18);
        assert_eq!(pos.request_unhold_shares, 0);
        assert!(!f.vault.unlock_request(1).unwrap().is_pending());
    }

    #[test]
    fn test_duplicate_target_rejected_without_change() {
        let mut f = fixture(false);
        let asset = f.vault.profile().asset.clone();
        let target = f
            .vault
            .register_investment_target(&f.manager, "ETH-PERP", &asset)
            .unwrap();
        let before = f.vault.storage();

        let err = f
            .vault
            .register_investment_target(&f.manager, "ETH-PERP", &asset)
            .unwrap_err();
        assert!(matches!(err, VaultError::InvestmentTargetAlreadyRegistered { .. }));
        assert_eq!(f.vault.storage(), before);
        assert_eq!(f.vault.investment_targets().len(), 1);
        assert_eq!(f.vault.target_id_for("ETH-PERP"), target);
    }

    #[test]
    fn test_deposits_sum_to_tvl() {
        let mut f = fixture(false);
        let second = Address::new("0xuser2");
        f.token.mint(&second, 500 * USDC).unwrap();
        f.token.approve(&second, &Address::new("0xvault"), u128::MAX);

        f.vault.deposit(&f.user, 300 * USDC).unwrap();
        f.vault.deposit(&second, 500 * USDC).unwrap();
        f.vault.deposit(&f.user, 25 * USDC).unwrap();

        assert_eq!(f.vault.tvl(), 825 * USDC);
        assert_eq!(f.vault.ledger.total_deposits().unwrap(), f.vault.tvl());
        assert_eq!(f.vault.get_user_asset(&f.user).total_amount, 325 * USDC);
    }

    #[test]
    fn test_failed_unlock_batch_enqueues_nothing() {
        let mut f = fixture(false);
        let target = invested(&mut f);
        let before = f.vault.storage();

        let err = f
            .vault
            .unlock_investment_shares(
                &f.user,
                &[
                    UnlockEntry {
                        target_id: target,
                        unlock_shares: 4 * E18,
                    },
                    UnlockEntry {
                        target_id: target,
                        unlock_shares: 7 * E18,
                    },
                ],
            )
            .unwrap_err();
        assert!(matches!(err, VaultError::InsufficientShares { .. }));

        let err = f
            .vault
            .unlock_investment_shares(
                &f.user,
                &[
                    UnlockEntry {
                        target_id: target,
                        unlock_shares: E18,
                    },
                    UnlockEntry {
                        target_id: f.vault.target_id_for("BTC-PERP"),
                        unlock_shares: E18,
                    },
                ],
            )
            .unwrap_err();
        assert!(matches!(err, VaultError::InvestmentTargetNotRegistered { .. }));

        assert_eq!(f.vault.storage(), before);
        assert!(f.vault.unlock_requests().is_empty());
        assert!(f.vault.unlock_request(1).is_none());
        assert_eq!(f.vault.user_positions(&f.user, &target).request_unhold_shares, 0);
    }

    #[test]
    fn test_pending_page_is_clamped() {
        let mut f = fixture(false);
        let target = invested(&mut f);
        let entries: Vec<UnlockEntry> = (0..3)
            .map(|_| UnlockEntry {
                target_id: target,
                unlock_shares: E18,
            })
            .collect();
        f.vault.unlock_investment_shares(&f.user, &entries).unwrap();
        f.clock.advance(DEFAULT_UNLOCK_LOCK_PERIOD_SECS);

        assert_eq!(f.vault.get_pending_unlock_requests(10).len(), 2);
        assert_eq!(f.vault.get_pending_unlock_requests(1).len(), 1);
    }

    #[test]
    fn test_cancel_releases_earmark_when_enabled() {
        let mut f = fixture(true);
        let target = invested(&mut f);
        f.vault
            .unlock_investment_shares(
                &f.user,
                &[UnlockEntry {
                    target_id: target,
                    unlock_shares: 4 * E18,
                }],
            )
            .unwrap();

        f.vault.cancel_unlock_request(&f.user, 1).unwrap();
        assert_eq!(f.vault.user_positions(&f.user, &target).request_unhold_shares, 0);
        assert_eq!(
            f.vault.unlock_request(1).unwrap().status,
            crate::vault::types::UnlockStatus::Cancelled
        );
    }

    #[test]
    fn test_upgrade_requires_admin_and_preserves_state() {
        let mut f = fixture(false);
        let target = invested(&mut f);
        let before = f.vault.storage();

        assert!(matches!(
            f.vault.upgrade_to(&f.manager, &Address::new("0ximpl2")),
            Err(VaultError::Unauthorized { role: Role::Admin, .. })
        ));
        assert_eq!(
            f.vault.upgrade_to(&f.admin, &Address::zero()),
            Err(VaultError::InvalidImplementationAddress)
        );

        f.vault.upgrade_to(&f.admin, &Address::new("0ximpl2")).unwrap();
        assert_eq!(f.vault.implementation(), &Address::new("0ximpl2"));
        let after = f.vault.storage();
        assert_eq!(after.user_assets, before.user_assets);
        assert_eq!(after.positions, before.positions);
        assert_eq!(f.vault.user_positions(&f.user, &target).hold_shares, 10 * E18);
    }

    #[test]
    fn test_return_capital_refills_custody() {
        let mut f = fixture(false);
        invested(&mut f);
        assert_eq!(f.vault.custody_balance(), 0);
        f.vault.return_capital(&f.manager, 400 * USDC).unwrap();
        assert_eq!(f.vault.custody_balance(), 400 * USDC);
        assert_eq!(f.vault.return_capital(&f.manager, 0), Err(VaultError::ZeroAmount));
    }
}
