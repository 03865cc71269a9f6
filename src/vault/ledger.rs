//! Position Ledger
//!
//! Per-vault store of user capital records and per-(user, target) positions.
//!
//! # Invariants
//!
//! 1. `request_unhold_shares <= hold_shares` for every position after every call.
//! 2. `unlocked_amount` is the only balance a user can withdraw.
//! 3. Every change is computed in full before anything is written: callers
//!    stage a change, run the asset transfer, then commit. A staged change
//!    that is never committed leaves the ledger untouched.
//! 4. Trade batches run against an overlay ([`SettlementBatch`]) and land in
//!    a single [`PositionLedger::commit_settlement`].

use std::collections::BTreeMap;
use tracing::debug;

use crate::vault::error::VaultError;
use crate::vault::fixed_point::{
    fee_for, realized_profit, weighted_entry_price, Amount, Shares,
};
use crate::vault::types::{Address, TargetId, TradeDetail, TradeType, UserAsset, UserPosition};

// =============================================================================
// STAGED CHANGES
// =============================================================================

/// A fully computed capital-record update waiting to be committed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapitalChange {
    pub user: Address,
    pub next: UserAsset,
    pub next_tvl: Amount,
}

/// Fee configuration applied to realized profit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FeeSchedule {
    pub rate_bps: u32,
    pub receiver: Option<Address>,
}

impl FeeSchedule {
    fn active_receiver(&self) -> Option<&Address> {
        if self.rate_bps == 0 {
            return None;
        }
        self.receiver.as_ref()
    }
}

/// Result of settling one trade.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TradeOutcome {
    pub user: Address,
    pub target_id: TargetId,
    pub trade_type: TradeType,
    pub profit: Amount,
    pub fee: Amount,
    pub credited: Amount,
    pub position: UserPosition,
}

/// Buffered result of a whole trade batch.
#[derive(Debug, Default)]
pub struct SettlementChanges {
    assets: BTreeMap<Address, UserAsset>,
    positions: BTreeMap<(Address, TargetId), UserPosition>,
    fees: Amount,
}

// =============================================================================
// LEDGER
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PositionLedger {
    user_assets: BTreeMap<Address, UserAsset>,
    positions: BTreeMap<(Address, TargetId), UserPosition>,
    tvl: Amount,
    total_fees_collected: Amount,
}

impl PositionLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from persisted records.
    pub fn from_parts(
        user_assets: impl IntoIterator<Item = (Address, UserAsset)>,
        positions: impl IntoIterator<Item = (Address, TargetId, UserPosition)>,
        tvl: Amount,
        total_fees_collected: Amount,
    ) -> Self {
        Self {
            user_assets: user_assets.into_iter().collect(),
            positions: positions
                .into_iter()
                .map(|(user, target, pos)| ((user, target), pos))
                .collect(),
            tvl,
            total_fees_collected,
        }
    }

    pub fn tvl(&self) -> Amount {
        self.tvl
    }

    pub fn total_fees_collected(&self) -> Amount {
        self.total_fees_collected
    }

    pub fn user_count(&self) -> usize {
        self.user_assets.len()
    }

    pub fn user_asset(&self, user: &Address) -> UserAsset {
        self.user_assets.get(user).cloned().unwrap_or_default()
    }

    pub fn position(&self, user: &Address, target_id: &TargetId) -> UserPosition {
        self.positions
            .get(&(user.clone(), *target_id))
            .cloned()
            .unwrap_or_default()
    }

    /// Every position held by `user`, ordered by target id.
    pub fn positions_of(&self, user: &Address) -> Vec<(TargetId, UserPosition)> {
        self.positions
            .iter()
            .filter(|((owner, _), _)| owner == user)
            .map(|((_, target), pos)| (*target, pos.clone()))
            .collect()
    }

    pub fn user_assets(&self) -> impl Iterator<Item = (&Address, &UserAsset)> {
        self.user_assets.iter()
    }

    pub fn positions(&self) -> impl Iterator<Item = (&Address, &TargetId, &UserPosition)> {
        self.positions.iter().map(|((u, t), p)| (u, t, p))
    }

    /// Sum of every user's `total_amount`.
    pub fn total_deposits(&self) -> Result<Amount, VaultError> {
        self.user_assets.values().try_fold(0u128, |acc, a| {
            acc.checked_add(a.total_amount)
                .ok_or_else(|| overflow("total deposits"))
        })
    }

    // -------------------------------------------------------------------------
    // Capital movements
    // -------------------------------------------------------------------------

    /// User deposit: `total_amount += amount`, `tvl += amount`.
    pub fn stage_deposit(&self, user: &Address, amount: Amount) -> Result<CapitalChange, VaultError> {
        if amount == 0 {
            return Err(VaultError::ZeroAmount);
        }
        let mut next = self.user_asset(user);
        next.total_amount = next
            .total_amount
            .checked_add(amount)
            .ok_or_else(|| overflow("total_amount"))?;
        let next_tvl = self.tvl.checked_add(amount).ok_or_else(|| overflow("tvl"))?;
        Ok(CapitalChange {
            user: user.clone(),
            next,
            next_tvl,
        })
    }

    /// Manager deployment: moves `amount` of available capital into `locked_amount`.
    pub fn stage_lock(&self, user: &Address, amount: Amount) -> Result<CapitalChange, VaultError> {
        if amount == 0 {
            return Err(VaultError::ZeroAmount);
        }
        let mut next = self.user_asset(user);
        let available = next.available();
        if amount > available {
            return Err(VaultError::InsufficientFunds {
                requested: amount,
                available,
            });
        }
        next.locked_amount += amount;
        Ok(CapitalChange {
            user: user.clone(),
            next,
            next_tvl: self.tvl,
        })
    }

    /// User withdrawal of realized proceeds.
    pub fn stage_payout(&self, user: &Address, amount: Amount) -> Result<CapitalChange, VaultError> {
        if amount == 0 {
            return Err(VaultError::ZeroAmount);
        }
        let mut next = self.user_asset(user);
        if amount > next.unlocked_amount {
            return Err(VaultError::NotEnoughWithdrawableAssets {
                requested: amount,
                withdrawable: next.unlocked_amount,
            });
        }
        next.unlocked_amount -= amount;
        Ok(CapitalChange {
            user: user.clone(),
            next,
            next_tvl: self.tvl.saturating_sub(amount),
        })
    }

    pub fn commit(&mut self, change: CapitalChange) {
        self.user_assets.insert(change.user, change.next);
        self.tvl = change.next_tvl;
    }

    // -------------------------------------------------------------------------
    // Unlock earmarks
    // -------------------------------------------------------------------------

    /// Earmark shares for unlock. Entries for the same target accumulate, so a
    /// batch can never earmark more than the free shares at batch start.
    pub fn stage_earmarks(
        &self,
        user: &Address,
        entries: &[(TargetId, Shares)],
    ) -> Result<Vec<(TargetId, UserPosition)>, VaultError> {
        let mut working: BTreeMap<TargetId, UserPosition> = BTreeMap::new();
        for (target_id, shares) in entries {
            if *shares == 0 {
                return Err(VaultError::ZeroAmount);
            }
            let mut pos = working
                .get(target_id)
                .cloned()
                .unwrap_or_else(|| self.position(user, target_id));
            let free = pos.free_shares();
            if *shares > free {
                return Err(VaultError::InsufficientShares {
                    requested: *shares,
                    available: free,
                });
            }
            pos.request_unhold_shares += shares;
            working.insert(*target_id, pos);
        }
        Ok(working.into_iter().collect())
    }

    /// Release `shares` from an earmark (request cancelled).
    pub fn stage_release(
        &self,
        user: &Address,
        target_id: &TargetId,
        shares: Shares,
    ) -> Result<UserPosition, VaultError> {
        let mut pos = self.position(user, target_id);
        pos.request_unhold_shares = pos
            .request_unhold_shares
            .checked_sub(shares)
            .ok_or(VaultError::InsufficientShares {
                requested: shares,
                available: pos.request_unhold_shares,
            })?;
        Ok(pos)
    }

    pub fn commit_positions(
        &mut self,
        user: &Address,
        positions: impl IntoIterator<Item = (TargetId, UserPosition)>,
    ) {
        for (target_id, pos) in positions {
            self.positions.insert((user.clone(), target_id), pos);
        }
    }

    // -------------------------------------------------------------------------
    // Trade settlement
    // -------------------------------------------------------------------------

    pub fn begin_settlement(&self) -> SettlementBatch<'_> {
        SettlementBatch {
            ledger: self,
            changes: SettlementChanges::default(),
        }
    }

    pub fn commit_settlement(&mut self, changes: SettlementChanges) {
        for (user, asset) in changes.assets {
            self.user_assets.insert(user, asset);
        }
        for (key, pos) in changes.positions {
            self.positions.insert(key, pos);
        }
        // Headroom checked by apply_trade
        self.total_fees_collected += changes.fees;
    }
}

/// Overlay used while validating a trade batch.
///
/// Reads fall through to the ledger for records the batch has not touched yet.
pub struct SettlementBatch<'a> {
    ledger: &'a PositionLedger,
    changes: SettlementChanges,
}

impl<'a> SettlementBatch<'a> {
    fn asset(&self, user: &Address) -> UserAsset {
        self.changes
            .assets
            .get(user)
            .cloned()
            .unwrap_or_else(|| self.ledger.user_asset(user))
    }

    fn position(&self, user: &Address, target_id: &TargetId) -> UserPosition {
        self.changes
            .positions
            .get(&(user.clone(), *target_id))
            .cloned()
            .unwrap_or_else(|| self.ledger.position(user, target_id))
    }

    /// Settle one trade against the overlay.
    ///
    /// `release` is the earmark freed by the unlock request the trade closes
    /// (0 when it closes none).
    pub fn apply_trade(
        &mut self,
        index: usize,
        trade: &TradeDetail,
        asset_decimals: u32,
        fees: &FeeSchedule,
        release: Shares,
    ) -> Result<TradeOutcome, VaultError> {
        if trade.total_shares == 0 {
            return Err(VaultError::InvalidTrade {
                index,
                reason: "total_shares is zero".to_string(),
            });
        }
        if trade.trade_price == 0 {
            return Err(VaultError::InvalidTrade {
                index,
                reason: "trade_price is zero".to_string(),
            });
        }

        let mut pos = self.position(&trade.user, &trade.target_id);
        let outcome = match trade.trade_type {
            TradeType::Invest => {
                pos.entry_price = weighted_entry_price(
                    pos.hold_shares,
                    pos.entry_price,
                    trade.total_shares,
                    trade.trade_price,
                )?;
                pos.hold_shares = pos
                    .hold_shares
                    .checked_add(trade.total_shares)
                    .ok_or_else(|| overflow("hold_shares"))?;
                TradeOutcome {
                    user: trade.user.clone(),
                    target_id: trade.target_id,
                    trade_type: trade.trade_type,
                    profit: 0,
                    fee: 0,
                    credited: 0,
                    position: pos.clone(),
                }
            }
            TradeType::Withdraw => {
                if trade.total_shares > pos.hold_shares {
                    return Err(VaultError::InsufficientShares {
                        requested: trade.total_shares,
                        available: pos.hold_shares,
                    });
                }
                let profit = realized_profit(
                    pos.entry_price,
                    trade.trade_price,
                    trade.total_shares,
                    asset_decimals,
                )?;
                let fee = match fees.active_receiver() {
                    Some(_) => fee_for(profit, fees.rate_bps)?,
                    None => 0,
                };
                let credited = trade
                    .total_amount
                    .checked_sub(fee)
                    .ok_or_else(|| VaultError::InvalidTrade {
                        index,
                        reason: format!(
                            "fee {} exceeds settlement amount {}",
                            fee, trade.total_amount
                        ),
                    })?;

                pos.hold_shares -= trade.total_shares;
                pos.request_unhold_shares = pos
                    .request_unhold_shares
                    .checked_sub(release)
                    .ok_or(VaultError::InsufficientShares {
                        requested: release,
                        available: pos.request_unhold_shares,
                    })?;
                if pos.request_unhold_shares > pos.hold_shares {
                    return Err(VaultError::InsufficientShares {
                        requested: pos.request_unhold_shares,
                        available: pos.hold_shares,
                    });
                }
                if pos.hold_shares == 0 {
                    pos.entry_price = 0;
                }

                let mut user_asset = self.asset(&trade.user);
                user_asset.unlocked_amount = user_asset
                    .unlocked_amount
                    .checked_add(credited)
                    .ok_or_else(|| overflow("unlocked_amount"))?;
                self.changes.assets.insert(trade.user.clone(), user_asset);

                if let (Some(receiver), true) = (fees.active_receiver(), fee > 0) {
                    let mut receiver_asset = self.asset(receiver);
                    receiver_asset.unlocked_amount = receiver_asset
                        .unlocked_amount
                        .checked_add(fee)
                        .ok_or_else(|| overflow("fee receiver unlocked_amount"))?;
                    self.changes.assets.insert(receiver.clone(), receiver_asset);
                    self.changes.fees = self
                        .changes
                        .fees
                        .checked_add(fee)
                        .ok_or_else(|| overflow("fees collected"))?;
                    self.ledger
                        .total_fees_collected
                        .checked_add(self.changes.fees)
                        .ok_or_else(|| overflow("fees collected"))?;
                }

                TradeOutcome {
                    user: trade.user.clone(),
                    target_id: trade.target_id,
                    trade_type: trade.trade_type,
                    profit,
                    fee,
                    credited,
                    position: pos.clone(),
                }
            }
        };

        debug!(
            index,
            user = %trade.user,
            target = %trade.target_id,
            trade_type = ?trade.trade_type,
            shares = %trade.total_shares,
            profit = %outcome.profit,
            fee = %outcome.fee,
            "trade staged"
        );

        self.changes
            .positions
            .insert((trade.user.clone(), trade.target_id), pos);
        Ok(outcome)
    }

    pub fn finish(self) -> SettlementChanges {
        self.changes
    }
}

fn overflow(context: &str) -> VaultError {
    VaultError::Overflow {
        context: context.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vault::types::DEFAULT_PLATFORM_LABEL;

    const E18: u128 = 1_000_000_000_000_000_000;

    fn eth() -> TargetId {
        TargetId::derive(DEFAULT_PLATFORM_LABEL, "ETH-PERP")
    }

    fn trade(user: &Address, kind: TradeType, amount: u128, shares: u128, price: u128) -> TradeDetail {
        TradeDetail {
            user: user.clone(),
            target_id: eth(),
            trade_type: kind,
            total_amount: amount,
            total_shares: shares * E18,
            trade_price: price * E18,
            trade_time: 0,
            unlock_request_id: 0,
        }
    }

    fn settle(ledger: &mut PositionLedger, trades: &[TradeDetail], fees: &FeeSchedule) -> Result<Vec<TradeOutcome>, VaultError> {
        let mut batch = ledger.begin_settlement();
        let mut out = Vec::new();
        for (i, t) in trades.iter().enumerate() {
            out.push(batch.apply_trade(i, t, 6, fees, 0)?);
        }
        let changes = batch.finish();
        ledger.commit_settlement(changes);
        Ok(out)
    }

    #[test]
    fn test_deposit_then_lock() {
        let mut ledger = PositionLedger::new();
        let u = Address::new("0xu1");

        let change = ledger.stage_deposit(&u, 1_000_000_000).unwrap();
        ledger.commit(change);
        assert_eq!(ledger.tvl(), 1_000_000_000);
        assert_eq!(ledger.user_asset(&u).total_amount, 1_000_000_000);

        let change = ledger.stage_lock(&u, 400_000_000).unwrap();
        ledger.commit(change);
        let asset = ledger.user_asset(&u);
        assert_eq!(asset.locked_amount, 400_000_000);
        assert_eq!(asset.available(), 600_000_000);

        let err = ledger.stage_lock(&u, 600_000_001).unwrap_err();
        assert_eq!(
            err,
            VaultError::InsufficientFunds {
                requested: 600_000_001,
                available: 600_000_000
            }
        );
    }

    #[test]
    fn test_zero_amounts_rejected() {
        let ledger = PositionLedger::new();
        let u = Address::new("0xu1");
        assert_eq!(ledger.stage_deposit(&u, 0), Err(VaultError::ZeroAmount));
        assert_eq!(ledger.stage_lock(&u, 0), Err(VaultError::ZeroAmount));
        assert_eq!(ledger.stage_payout(&u, 0), Err(VaultError::ZeroAmount));
    }

    #[test]
    fn test_uncommitted_stage_leaves_ledger_untouched() {
        let ledger = PositionLedger::new();
        let _ = ledger.stage_deposit(&Address::new("0xu1"), 5).unwrap();
        assert_eq!(ledger.tvl(), 0);
        assert_eq!(ledger.user_count(), 0);
    }

    #[test]
    fn test_invest_then_close_with_fee() {
        let mut ledger = PositionLedger::new();
        let u = Address::new("0xu1");
        let fees = FeeSchedule {
            rate_bps: 2_000,
            receiver: Some(Address::new("0xfee")),
        };

        settle(&mut ledger, &[trade(&u, TradeType::Invest, 1_000_000_000, 10, 100)], &fees).unwrap();
        let pos = ledger.position(&u, &eth());
        assert_eq!(pos.hold_shares, 10 * E18);
        assert_eq!(pos.entry_price, 100 * E18);

        let out = settle(&mut ledger, &[trade(&u, TradeType::Withdraw, 1_200_000_000, 10, 120)], &fees).unwrap();
        assert_eq!(out[0].profit, 200_000_000);
        assert_eq!(out[0].fee, 40_000_000);
        assert_eq!(ledger.user_asset(&u).unlocked_amount, 1_160_000_000);
        assert_eq!(ledger.user_asset(&Address::new("0xfee")).unlocked_amount, 40_000_000);
        assert_eq!(ledger.total_fees_collected(), 40_000_000);

        let pos = ledger.position(&u, &eth());
        assert_eq!(pos.hold_shares, 0);
        assert_eq!(pos.entry_price, 0);
    }

    #[test]
    fn test_fee_counter_overflow_fails_batch() {
        let mut ledger = PositionLedger::from_parts(Vec::new(), Vec::new(), 0, u128::MAX - 1);
        let u = Address::new("0xu1");
        let fees = FeeSchedule {
            rate_bps: 2_000,
            receiver: Some(Address::new("0xfee")),
        };
        settle(&mut ledger, &[trade(&u, TradeType::Invest, 0, 10, 100)], &fees).unwrap();

        let err = settle(&mut ledger, &[trade(&u, TradeType::Withdraw, 1_200_000_000, 10, 120)], &fees).unwrap_err();
        assert!(matches!(err, VaultError::Overflow { .. }));
        assert_eq!(ledger.total_fees_collected(), u128::MAX - 1);
        assert_eq!(ledger.position(&u, &eth()).hold_shares, 10 * E18);
        assert_eq!(ledger.user_asset(&u).unlocked_amount, 0);
    }

    #[test]
    fn test_total_deposits_matches_tvl() {
        let mut ledger = PositionLedger::new();
        for (user, amount) in [("0xu1", 300), ("0xu2", 450), ("0xu1", 50)] {
            let change = ledger.stage_deposit(&Address::new(user), amount).unwrap();
            ledger.commit(change);
        }
        assert_eq!(ledger.user_count(), 2);
        assert_eq!(ledger.total_deposits().unwrap(), 800);
        assert_eq!(ledger.total_deposits().unwrap(), ledger.tvl());
    }

    #[test]
    fn test_fee_needs_receiver() {
        let mut ledger = PositionLedger::new();
        let u = Address::new("0xu1");
        let fees = FeeSchedule {
            rate_bps: 2_000,
            receiver: None,
        };
        settle(&mut ledger, &[trade(&u, TradeType::Invest, 0, 10, 100)], &fees).unwrap();
        let out = settle(&mut ledger, &[trade(&u, TradeType::Withdraw, 1_200_000_000, 10, 120)], &fees).unwrap();
        assert_eq!(out[0].fee, 0);
        assert_eq!(ledger.user_asset(&u).unlocked_amount, 1_200_000_000);
    }

    #[test]
    fn test_batch_order_drives_entry_price() {
        let mut ledger = PositionLedger::new();
        let u = Address::new("0xu1");
        let fees = FeeSchedule::default();
        settle(
            &mut ledger,
            &[
                trade(&u, TradeType::Invest, 0, 10, 100),
                trade(&u, TradeType::Invest, 0, 10, 120),
                trade(&u, TradeType::Withdraw, 550_000_000, 5, 110),
            ],
            &fees,
        )
        .unwrap();
        let pos = ledger.position(&u, &eth());
        assert_eq!(pos.hold_shares, 15 * E18);
        assert_eq!(pos.entry_price, 110 * E18);
    }

    #[test]
    fn test_failed_batch_discards_overlay() {
        let mut ledger = PositionLedger::new();
        let u = Address::new("0xu1");
        let fees = FeeSchedule::default();
        let err = settle(
            &mut ledger,
            &[
                trade(&u, TradeType::Invest, 0, 10, 100),
                trade(&u, TradeType::Withdraw, 0, 11, 100),
            ],
            &fees,
        )
        .unwrap_err();
        assert!(matches!(err, VaultError::InsufficientShares { .. }));
        assert_eq!(ledger.position(&u, &eth()), UserPosition::default());
    }

    #[test]
    fn test_close_cannot_eat_earmarked_shares() {
        let mut ledger = PositionLedger::new();
        let u = Address::new("0xu1");
        let fees = FeeSchedule::default();
        settle(&mut ledger, &[trade(&u, TradeType::Invest, 0, 10, 100)], &fees).unwrap();

        let staged = ledger.stage_earmarks(&u, &[(eth(), 8 * E18)]).unwrap();
        ledger.commit_positions(&u, staged);

        // Closing 5 without releasing the earmark would leave 8 earmarked of 5 held
        let err = settle(&mut ledger, &[trade(&u, TradeType::Withdraw, 0, 5, 100)], &fees).unwrap_err();
        assert!(matches!(err, VaultError::InsufficientShares { .. }));
    }

    #[test]
    fn test_earmarks_accumulate_within_batch() {
        let mut ledger = PositionLedger::new();
        let u = Address::new("0xu1");
        settle(&mut ledger, &[trade(&u, TradeType::Invest, 0, 10, 100)], &FeeSchedule::default()).unwrap();

        let err = ledger
            .stage_earmarks(&u, &[(eth(), 6 * E18), (eth(), 5 * E18)])
            .unwrap_err();
        assert_eq!(
            err,
            VaultError::InsufficientShares {
                requested: 5 * E18,
                available: 4 * E18
            }
        );

        let staged = ledger.stage_earmarks(&u, &[(eth(), 6 * E18), (eth(), 4 * E18)]).unwrap();
        ledger.commit_positions(&u, staged);
        assert_eq!(ledger.position(&u, &eth()).request_unhold_shares, 10 * E18);
    }

    #[test]
    fn test_payout_limited_to_unlocked() {
        let mut ledger = PositionLedger::from_parts(
            vec![(
                Address::new("0xu1"),
                UserAsset {
                    total_amount: 100,
                    locked_amount: 100,
                    unlocked_amount: 30,
                },
            )],
            Vec::new(),
            100,
            0,
        );
        let u = Address::new("0xu1");
        assert!(matches!(
            ledger.stage_payout(&u, 31),
            Err(VaultError::NotEnoughWithdrawableAssets { .. })
        ));
        let change = ledger.stage_payout(&u, 30).unwrap();
        ledger.commit(change);
        assert_eq!(ledger.user_asset(&u).unlocked_amount, 0);
        assert_eq!(ledger.tvl(), 70);
    }
}
