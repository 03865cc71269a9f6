//! Vault error taxonomy.
//!
//! Every error aborts the whole call: operations validate before they mutate,
//! so a returned error always means "no state changed".

use crate::vault::access::Role;
use crate::vault::asset::TransferError;
use crate::vault::fixed_point::{Amount, Shares};
use crate::vault::types::{Address, TargetId};

/// Errors raised by vault and registry operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VaultError {
    /// A monetary or share quantity of zero where a positive one is required.
    ZeroAmount,
    /// Requested movement exceeds the user's available (non-locked) capital.
    InsufficientFunds { requested: Amount, available: Amount },
    /// Requested withdrawal exceeds the user's unlocked balance.
    NotEnoughWithdrawableAssets { requested: Amount, withdrawable: Amount },
    /// Not enough free shares to earmark or close.
    InsufficientShares { requested: Shares, available: Shares },
    /// Asset transfer service rejected the movement.
    Transfer(TransferError),
    /// Asset is zero or does not match the vault's configured asset.
    InvalidAsset { asset: String },
    InvalidAdminAddress,
    InvalidManagerAddress,
    InvalidImplementationAddress,
    /// A required user/receiver address is zero or empty.
    InvalidAddress { field: &'static str },
    InvestmentTargetAlreadyRegistered { symbol: String, target_id: TargetId },
    InvestmentTargetNotRegistered { target_id: TargetId },
    StrategySymbolAlreadyExists { symbol: String },
    /// Reference to a vault or strategy that does not exist.
    InvalidStrategyId { reference: String },
    /// Caller lacks the capability required by the operation.
    Unauthorized { principal: Address, role: Role },
    InvalidFeeRate { rate_bps: u32 },
    /// Malformed trade detail (zero price, unknown user, ...).
    InvalidTrade { index: usize, reason: String },
    UnlockRequestNotFound { request_id: u64 },
    /// Lock period has not elapsed yet.
    UnlockRequestNotEligible { request_id: u64, eligible_at: i64 },
    /// Request was already fulfilled or cancelled.
    UnlockRequestAlreadyClosed { request_id: u64 },
    /// Request does not belong to the trade's user/target.
    UnlockRequestMismatch { request_id: u64, reason: String },
    UnlockCancelDisabled,
    /// Arithmetic result does not fit the ledger's integer width.
    Overflow { context: String },
    UnsupportedSchema { found: u32, supported: u32 },
    /// Snapshot encode/decode failure.
    Storage { reason: String },
}

impl std::fmt::Display for VaultError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ZeroAmount => write!(f, "ZeroAmount: amount must be greater than zero"),
            Self::InsufficientFunds {
                requested,
                available,
            } => write!(
                f,
                "InsufficientFunds: requested {} but only {} available",
                requested, available
            ),
            Self::NotEnoughWithdrawableAssets {
                requested,
                withdrawable,
            } => write!(
                f,
                "NotEnoughWithdrawableAssets: requested {} but only {} withdrawable",
                requested, withdrawable
            ),
            Self::InsufficientShares {
                requested,
                available,
            } => write!(
                f,
                "InsufficientShares: requested {} but only {} free",
                requested, available
            ),
            Self::Transfer(e) => write!(f, "asset transfer failed: {}", e),
            Self::InvalidAsset { asset } => write!(f, "InvalidAsset: '{}'", asset),
            Self::InvalidAdminAddress => write!(f, "InvalidAdminAddress"),
            Self::InvalidManagerAddress => write!(f, "InvalidManagerAddress"),
            Self::InvalidImplementationAddress => write!(f, "InvalidImplementationAddress"),
            Self::InvalidAddress { field } => write!(f, "invalid address for '{}'", field),
            Self::InvestmentTargetAlreadyRegistered { symbol, target_id } => write!(
                f,
                "InvestmentTargetAlreadyRegistered: '{}' ({})",
                symbol, target_id
            ),
            Self::InvestmentTargetNotRegistered { target_id } => {
                write!(f, "investment target {} is not registered", target_id)
            }
            Self::StrategySymbolAlreadyExists { symbol } => {
                write!(f, "StrategySymbolAlreadyExists: '{}'", symbol)
            }
            Self::InvalidStrategyId { reference } => {
                write!(f, "InvalidStrategyId: '{}'", reference)
            }
            Self::Unauthorized { principal, role } => write!(
                f,
                "{} is missing capability {}",
                principal,
                role.as_str()
            ),
            Self::InvalidFeeRate { rate_bps } => {
                write!(f, "fee rate {} bps outside 0..=10000", rate_bps)
            }
            Self::InvalidTrade { index, reason } => {
                write!(f, "trade #{} rejected: {}", index, reason)
            }
            Self::UnlockRequestNotFound { request_id } => {
                write!(f, "unlock request {} not found", request_id)
            }
            Self::UnlockRequestNotEligible {
                request_id,
                eligible_at,
            } => write!(
                f,
                "unlock request {} is locked until {}",
                request_id, eligible_at
            ),
            Self::UnlockRequestAlreadyClosed { request_id } => {
                write!(f, "unlock request {} is already closed", request_id)
            }
            Self::UnlockRequestMismatch { request_id, reason } => {
                write!(f, "unlock request {} mismatch: {}", request_id, reason)
            }
            Self::UnlockCancelDisabled => {
                write!(f, "unlock request cancellation is disabled for this vault")
            }
            Self::Overflow { context } => write!(f, "arithmetic overflow in {}", context),
            Self::UnsupportedSchema { found, supported } => write!(
                f,
                "storage schema v{} is newer than supported v{}",
                found, supported
            ),
            Self::Storage { reason } => write!(f, "storage error: {}", reason),
        }
    }
}

impl std::error::Error for VaultError {}

impl From<TransferError> for VaultError {
    fn from(err: TransferError) -> Self {
        VaultError::Transfer(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_names_error_kind() {
        assert!(VaultError::ZeroAmount.to_string().starts_with("ZeroAmount"));

        let e = VaultError::StrategySymbolAlreadyExists {
            symbol: "ETH-PERP".to_string(),
        };
        assert_eq!(e.to_string(), "StrategySymbolAlreadyExists: 'ETH-PERP'");
    }

    #[test]
    fn test_transfer_error_conversion() {
        let err: VaultError = TransferError::NotEnoughAllowance {
            owner: Address::new("0xabc"),
            allowance: 1,
            requested: 2,
        }
        .into();
        assert!(matches!(err, VaultError::Transfer(_)));
    }
}
