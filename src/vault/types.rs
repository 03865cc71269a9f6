//! Vault data model: identifiers, user records, positions, trades and unlock requests.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};

use crate::vault::fixed_point::{serde_u128, Amount, Price, Shares};

/// Type signature hashed into every investment target identifier.
pub const INVESTMENT_TYPE_SIGNATURE: &str = "Investment(string platform,string symbol)";

/// Default venue label used when deriving target identifiers.
pub const DEFAULT_PLATFORM_LABEL: &str = "HyperLiquid";

const ZERO_ADDRESS: &str = "0x0000000000000000000000000000000000000000";

// =============================================================================
// ADDRESS
// =============================================================================

/// Account identifier (wallet, vault, asset, implementation).
///
/// Normalized to trimmed lower-case so `0xAbC` and `0xabc ` compare equal.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Address(String);

impl Address {
    pub fn new(raw: impl AsRef<str>) -> Self {
        Self(raw.as_ref().trim().to_lowercase())
    }

    pub fn zero() -> Self {
        Self(ZERO_ADDRESS.to_string())
    }

    /// Empty, or the all-zero hex address.
    pub fn is_zero(&self) -> bool {
        let hex_part = self.0.trim_start_matches("0x");
        self.0.is_empty() || (!hex_part.is_empty() && hex_part.chars().all(|c| c == '0'))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Address {
    fn from(s: &str) -> Self {
        Address::new(s)
    }
}

// =============================================================================
// TARGET ID
// =============================================================================

/// 256-bit investment target identifier.
///
/// `SHA-256( SHA-256(INVESTMENT_TYPE_SIGNATURE) || platform || symbol )`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TargetId([u8; 32]);

impl TargetId {
    pub fn derive(platform: &str, symbol: &str) -> Self {
        let type_hash = Sha256::digest(INVESTMENT_TYPE_SIGNATURE.as_bytes());
        let mut hasher = Sha256::new();
        hasher.update(type_hash);
        hasher.update(platform.as_bytes());
        hasher.update(symbol.as_bytes());
        Self(hasher.finalize().into())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        format!("0x{}", hex::encode(self.0))
    }

    /// Parse `0x`-prefixed (or bare) 64-char hex.
    pub fn from_hex(s: &str) -> Option<Self> {
        let raw = s.trim().trim_start_matches("0x");
        let bytes = hex::decode(raw).ok()?;
        let arr: [u8; 32] = bytes.try_into().ok()?;
        Some(Self(arr))
    }
}

impl std::fmt::Display for TargetId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl Serialize for TargetId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for TargetId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        TargetId::from_hex(&s)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid target id '{}'", s)))
    }
}

// =============================================================================
// LEDGER RECORDS
// =============================================================================

/// Per-user capital record inside one vault.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserAsset {
    /// Cumulative net deposits.
    #[serde(with = "serde_u128")]
    pub total_amount: Amount,
    /// Capital moved out by the manager for external deployment.
    #[serde(with = "serde_u128")]
    pub locked_amount: Amount,
    /// Realized proceeds the user may withdraw.
    #[serde(with = "serde_u128")]
    pub unlocked_amount: Amount,
}

impl UserAsset {
    /// Deposited capital not yet deployed by the manager.
    pub fn available(&self) -> Amount {
        self.total_amount.saturating_sub(self.locked_amount)
    }
}

/// Per-(user, target) holding.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserPosition {
    #[serde(with = "serde_u128")]
    pub hold_shares: Shares,
    /// Share-weighted average acquisition price.
    #[serde(with = "serde_u128")]
    pub entry_price: Price,
    /// Shares earmarked by pending unlock requests. Never exceeds `hold_shares`.
    #[serde(with = "serde_u128")]
    pub request_unhold_shares: Shares,
}

impl UserPosition {
    pub fn free_shares(&self) -> Shares {
        self.hold_shares.saturating_sub(self.request_unhold_shares)
    }

    pub fn is_empty(&self) -> bool {
        self.hold_shares == 0 && self.request_unhold_shares == 0
    }
}

/// A registered investment venue/symbol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvestmentTarget {
    pub target_id: TargetId,
    pub symbol: String,
    pub asset: Address,
    pub registered_at: i64,
}

// =============================================================================
// TRADES
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TradeType {
    /// Capital deployed: shares acquired.
    Invest,
    /// Position closed: proceeds returned.
    Withdraw,
}

/// One externally executed trade to reconcile against the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TradeDetail {
    pub user: Address,
    pub target_id: TargetId,
    pub trade_type: TradeType,
    /// Settlement cash value of the trade.
    #[serde(with = "serde_u128")]
    pub total_amount: Amount,
    #[serde(with = "serde_u128")]
    pub total_shares: Shares,
    #[serde(with = "serde_u128")]
    pub trade_price: Price,
    pub trade_time: i64,
    /// Unlock request closed by this trade; 0 for none.
    #[serde(default)]
    pub unlock_request_id: u64,
}

// =============================================================================
// UNLOCK REQUESTS
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnlockStatus {
    Pending,
    Fulfilled,
    Cancelled,
}

/// A user's request to realize shares of one target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnlockRequest {
    pub id: u64,
    pub user: Address,
    pub target_id: TargetId,
    #[serde(with = "serde_u128")]
    pub shares: Shares,
    pub request_time: i64,
    pub status: UnlockStatus,
    #[serde(default)]
    pub fulfilled_at: Option<i64>,
}

impl UnlockRequest {
    pub fn is_pending(&self) -> bool {
        self.status == UnlockStatus::Pending
    }

    pub fn eligible_at(&self, lock_period_secs: i64) -> i64 {
        self.request_time.saturating_add(lock_period_secs)
    }

    /// Pending and past its lock period.
    pub fn is_eligible(&self, now: i64, lock_period_secs: i64) -> bool {
        self.is_pending() && now >= self.eligible_at(lock_period_secs)
    }
}

/// One entry of an `unlock_investment_shares` batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnlockEntry {
    pub target_id: TargetId,
    #[serde(with = "serde_u128")]
    pub unlock_shares: Shares,
}

// =============================================================================
// STRATEGY INFO
// =============================================================================

/// Read-only projection of a vault's identity and configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StrategyInfo {
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
    #[serde(with = "serde_u128")]
    pub tvl: Amount,
    pub fee_rate_bps: u32,
    pub fee_receiver: Option<Address>,
    pub unlock_lock_period_secs: i64,
    pub implementation: Address,
    pub target_count: usize,
    pub user_count: usize,
}
