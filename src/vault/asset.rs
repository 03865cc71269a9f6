//! Asset transfer service.
//!
//! Vaults never move value themselves; they ask an [`AssetTransferService`]
//! bound to their settlement asset. Any rejection aborts the calling
//! operation before ledger state changes.
//!
//! [`TokenLedger`] is an in-memory fungible token with balances, allowances
//! and decimals. [`TokenRegistry`] hands out per-vault bindings to it.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use crate::vault::fixed_point::Amount;
use crate::vault::types::Address;

/// Rejections from the asset layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferError {
    InsufficientFunds {
        account: Address,
        balance: Amount,
        requested: Amount,
    },
    NotEnoughAllowance {
        owner: Address,
        allowance: Amount,
        requested: Amount,
    },
    UnknownAsset {
        asset: Address,
    },
    Overflow,
}

impl std::fmt::Display for TransferError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InsufficientFunds {
                account,
                balance,
                requested,
            } => write!(
                f,
                "InsufficientFunds: {} holds {} but {} requested",
                account, balance, requested
            ),
            Self::NotEnoughAllowance {
                owner,
                allowance,
                requested,
            } => write!(
                f,
                "NotEnoughAllowance: {} approved {} but {} requested",
                owner, allowance, requested
            ),
            Self::UnknownAsset { asset } => write!(f, "unknown asset {}", asset),
            Self::Overflow => write!(f, "balance overflow"),
        }
    }
}

impl std::error::Error for TransferError {}

/// Moves the settlement asset in and out of one vault's custody.
pub trait AssetTransferService: Send + Sync {
    /// Asset this binding settles in.
    fn asset(&self) -> &Address;

    /// Base-unit decimals of the asset.
    fn decimals(&self) -> u32;

    /// Pull `amount` from `from` into vault custody (requires prior approval).
    fn transfer_in(&self, from: &Address, amount: Amount) -> Result<(), TransferError>;

    /// Pay `amount` from vault custody to `to`.
    fn transfer_out(&self, to: &Address, amount: Amount) -> Result<(), TransferError>;

    fn balance_of(&self, account: &Address) -> Amount;
}

/// Resolves an asset address to a transfer binding for a given vault.
pub trait AssetProvider: Send + Sync {
    fn bind(
        &self,
        asset: &Address,
        vault: &Address,
    ) -> Result<Arc<dyn AssetTransferService>, TransferError>;
}

// =============================================================================
// IN-MEMORY TOKEN
// =============================================================================

#[derive(Debug, Default)]
struct TokenState {
    balances: HashMap<Address, Amount>,
    allowances: HashMap<(Address, Address), Amount>,
    total_supply: Amount,
}

/// In-memory fungible token (balances, allowances, decimals).
#[derive(Debug)]
pub struct TokenLedger {
    address: Address,
    symbol: String,
    decimals: u32,
    state: RwLock<TokenState>,
}

impl TokenLedger {
    pub fn new(address: &Address, symbol: impl Into<String>, decimals: u32) -> Self {
        Self {
            address: address.clone(),
            symbol: symbol.into(),
            decimals,
            state: RwLock::new(TokenState::default()),
        }
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn decimals(&self) -> u32 {
        self.decimals
    }

    pub fn total_supply(&self) -> Amount {
        self.state.read().total_supply
    }

    pub fn mint(&self, to: &Address, amount: Amount) -> Result<(), TransferError> {
        let mut state = self.state.write();
        let balance = state.balances.get(to).copied().unwrap_or(0);
        let new_balance = balance.checked_add(amount).ok_or(TransferError::Overflow)?;
        let new_supply = state
            .total_supply
            .checked_add(amount)
            .ok_or(TransferError::Overflow)?;
        state.balances.insert(to.clone(), new_balance);
        state.total_supply = new_supply;
        Ok(())
    }

    pub fn approve(&self, owner: &Address, spender: &Address, amount: Amount) {
        self.state
            .write()
            .allowances
            .insert((owner.clone(), spender.clone()), amount);
    }

    pub fn allowance(&self, owner: &Address, spender: &Address) -> Amount {
        self.state
            .read()
            .allowances
            .get(&(owner.clone(), spender.clone()))
            .copied()
            .unwrap_or(0)
    }

    pub fn balance_of(&self, account: &Address) -> Amount {
        self.state.read().balances.get(account).copied().unwrap_or(0)
    }

    pub fn transfer(&self, from: &Address, to: &Address, amount: Amount) -> Result<(), TransferError> {
        let mut state = self.state.write();
        Self::move_balance(&mut state, from, to, amount)
    }

    /// Spend `owner`'s allowance to `spender`, moving funds to `to`.
    pub fn transfer_from(
        &self,
        spender: &Address,
        owner: &Address,
        to: &Address,
        amount: Amount,
    ) -> Result<(), TransferError> {
        let mut state = self.state.write();
        let key = (owner.clone(), spender.clone());
        let allowance = state.allowances.get(&key).copied().unwrap_or(0);
        if allowance < amount {
            return Err(TransferError::NotEnoughAllowance {
                owner: owner.clone(),
                allowance,
                requested: amount,
            });
        }
        Self::move_balance(&mut state, owner, to, amount)?;
        state.allowances.insert(key, allowance - amount);
        Ok(())
    }

    fn move_balance(
        state: &mut TokenState,
        from: &Address,
        to: &Address,
        amount: Amount,
    ) -> Result<(), TransferError> {
        let from_balance = state.balances.get(from).copied().unwrap_or(0);
        if from_balance < amount {
            return Err(TransferError::InsufficientFunds {
                account: from.clone(),
                balance: from_balance,
                requested: amount,
            });
        }
        if from == to {
            return Ok(());
        }
        let to_balance = state.balances.get(to).copied().unwrap_or(0);
        let new_to = to_balance.checked_add(amount).ok_or(TransferError::Overflow)?;
        state.balances.insert(from.clone(), from_balance - amount);
        state.balances.insert(to.clone(), new_to);
        Ok(())
    }
}

/// A vault's binding to a [`TokenLedger`]: the vault address is the custody account.
#[derive(Debug, Clone)]
pub struct VaultTokenAccount {
    token: Arc<TokenLedger>,
    vault: Address,
}

impl VaultTokenAccount {
    pub fn new(token: Arc<TokenLedger>, vault: &Address) -> Self {
        Self {
            token,
            vault: vault.clone(),
        }
    }

    pub fn custody_balance(&self) -> Amount {
        self.token.balance_of(&self.vault)
    }
}

impl AssetTransferService for VaultTokenAccount {
    fn asset(&self) -> &Address {
        self.token.address()
    }

    fn decimals(&self) -> u32 {
        self.token.decimals()
    }

    fn transfer_in(&self, from: &Address, amount: Amount) -> Result<(), TransferError> {
        self.token.transfer_from(&self.vault, from, &self.vault, amount)?;
        debug!(vault = %self.vault, from = %from, amount = %amount, "asset transferred in");
        Ok(())
    }

    fn transfer_out(&self, to: &Address, amount: Amount) -> Result<(), TransferError> {
        self.token.transfer(&self.vault, to, amount)?;
        debug!(vault = %self.vault, to = %to, amount = %amount, "asset transferred out");
        Ok(())
    }

    fn balance_of(&self, account: &Address) -> Amount {
        self.token.balance_of(account)
    }
}

/// Known tokens by address.
#[derive(Debug, Default)]
pub struct TokenRegistry {
    tokens: RwLock<HashMap<Address, Arc<TokenLedger>>>,
}

impl TokenRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, token: Arc<TokenLedger>) {
        self.tokens.write().insert(token.address().clone(), token);
    }

    pub fn get(&self, asset: &Address) -> Option<Arc<TokenLedger>> {
        self.tokens.read().get(asset).cloned()
    }

    /// Existing token, or a fresh empty one with `decimals`.
    pub fn ensure(&self, asset: &Address, symbol: &str, decimals: u32) -> Arc<TokenLedger> {
        self.tokens
            .write()
            .entry(asset.clone())
            .or_insert_with(|| Arc::new(TokenLedger::new(asset, symbol, decimals)))
            .clone()
    }
}

impl AssetProvider for TokenRegistry {
    fn bind(
        &self,
        asset: &Address,
        vault: &Address,
    ) -> Result<Arc<dyn AssetTransferService>, TransferError> {
        let token = self.get(asset).ok_or_else(|| TransferError::UnknownAsset {
            asset: asset.clone(),
        })?;
        Ok(Arc::new(VaultTokenAccount::new(token, vault)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn usdc() -> Arc<TokenLedger> {
        Arc::new(TokenLedger::new(&Address::new("0xusdc"), "USDC", 6))
    }

    #[test]
    fn test_mint_and_transfer() {
        let token = usdc();
        let a = Address::new("0xa");
        let b = Address::new("0xb");
        token.mint(&a, 100).unwrap();
        token.transfer(&a, &b, 40).unwrap();
        assert_eq!(token.balance_of(&a), 60);
        assert_eq!(token.balance_of(&b), 40);
        assert_eq!(token.total_supply(), 100);
    }

    #[test]
    fn test_transfer_insufficient_funds() {
        let token = usdc();
        let err = token
            .transfer(&Address::new("0xa"), &Address::new("0xb"), 1)
            .unwrap_err();
        assert!(matches!(err, TransferError::InsufficientFunds { .. }));
    }

    #[test]
    fn test_transfer_in_requires_allowance() {
        let token = usdc();
        let user = Address::new("0xuser");
        let vault = Address::new("0xvault");
        token.mint(&user, 1_000).unwrap();

        let account = VaultTokenAccount::new(token.clone(), &vault);
        let err = account.transfer_in(&user, 500).unwrap_err();
        assert!(matches!(err, TransferError::NotEnoughAllowance { .. }));

        token.approve(&user, &vault, 500);
        account.transfer_in(&user, 500).unwrap();
        assert_eq!(account.custody_balance(), 500);
        assert_eq!(token.allowance(&user, &vault), 0);

        // Failed pull leaves balances untouched
        token.approve(&user, &vault, 10_000);
        assert!(account.transfer_in(&user, 600).is_err());
        assert_eq!(token.balance_of(&user), 500);
        assert_eq!(token.allowance(&user, &vault), 10_000);
    }

    #[test]
    fn test_transfer_out_from_custody() {
        let token = usdc();
        let vault = Address::new("0xvault");
        let user = Address::new("0xuser");
        token.mint(&vault, 300).unwrap();

        let account = VaultTokenAccount::new(token.clone(), &vault);
        account.transfer_out(&user, 200).unwrap();
        assert_eq!(account.balance_of(&user), 200);
        assert!(account.transfer_out(&user, 200).is_err());
    }

    #[test]
    fn test_registry_bind_unknown_asset() {
        let registry = TokenRegistry::new();
        let err = registry
            .bind(&Address::new("0xnope"), &Address::new("0xvault"))
            .err()
            .unwrap();
        assert!(matches!(err, TransferError::UnknownAsset { .. }));

        registry.register(usdc());
        let bound = registry
            .bind(&Address::new("0xusdc"), &Address::new("0xvault"))
            .unwrap();
        assert_eq!(bound.decimals(), 6);
    }
}
