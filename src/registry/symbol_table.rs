//! Strategy symbol -> vault address table.
//!
//! The only place symbol uniqueness is enforced. Owned by the registry.

use std::collections::HashMap;

use crate::vault::error::VaultError;
use crate::vault::types::Address;

#[derive(Debug, Clone, Default)]
pub struct SymbolTable {
    by_symbol: HashMap<String, Address>,
    by_address: HashMap<Address, String>,
    ordered: Vec<Address>,
}

impl SymbolTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails if either the symbol or the address is already mapped.
    pub fn register(&mut self, symbol: &str, address: &Address) -> Result<(), VaultError> {
        if self.by_symbol.contains_key(symbol) {
            return Err(VaultError::StrategySymbolAlreadyExists {
                symbol: symbol.to_string(),
            });
        }
        if self.by_address.contains_key(address) {
            return Err(VaultError::InvalidStrategyId {
                reference: format!("address {} already registered", address),
            });
        }
        self.by_symbol.insert(symbol.to_string(), address.clone());
        self.by_address.insert(address.clone(), symbol.to_string());
        self.ordered.push(address.clone());
        Ok(())
    }

    pub fn lookup(&self, symbol: &str) -> Option<&Address> {
        self.by_symbol.get(symbol)
    }

    pub fn symbol_of(&self, address: &Address) -> Option<&str> {
        self.by_address.get(address).map(String::as_str)
    }

    pub fn contains(&self, symbol: &str) -> bool {
        self.by_symbol.contains_key(symbol)
    }

    /// Addresses in registration order.
    pub fn all(&self) -> &[Address] {
        &self.ordered
    }

    pub fn len(&self) -> usize {
        self.ordered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ordered.is_empty()
    }
}
