//! Capability checks.
//!
//! Restricted operations ask an [`AccessPolicy`] before touching state. The
//! policy is external to the ledger; [`RoleTable`] is the static in-process
//! implementation used by the registry and in tests.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::vault::error::VaultError;
use crate::vault::types::Address;

/// Capabilities recognised by vaults and the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Role {
    /// Registry-level: may change the implementation used for new vaults.
    #[serde(rename = "owner")]
    Owner,
    /// Vault-level: may swap vault logic.
    #[serde(rename = "admin")]
    Admin,
    /// Vault-level operations: capital movement, settlement, configuration.
    #[serde(rename = "manager")]
    Manager,
}

impl Role {
    pub fn as_str(&self) -> &str {
        match self {
            Role::Owner => "owner",
            Role::Admin => "admin",
            Role::Manager => "manager",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "owner" => Some(Role::Owner),
            "admin" => Some(Role::Admin),
            "manager" => Some(Role::Manager),
            _ => None,
        }
    }
}

/// Answers "does principal P hold capability C".
pub trait AccessPolicy: Send + Sync {
    fn has_capability(&self, principal: &Address, role: Role) -> bool;

    /// Capability check as a `Result`, for use at the top of restricted calls.
    fn require(&self, principal: &Address, role: Role) -> Result<(), VaultError> {
        if self.has_capability(principal, role) {
            Ok(())
        } else {
            Err(VaultError::Unauthorized {
                principal: principal.clone(),
                role,
            })
        }
    }
}

/// Static principal -> roles table.
#[derive(Debug, Default)]
pub struct RoleTable {
    grants: RwLock<BTreeMap<Address, BTreeSet<Role>>>,
}

impl RoleTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style grant.
    pub fn with(self, principal: &Address, role: Role) -> Self {
        self.grant(principal, role);
        self
    }

    pub fn grant(&self, principal: &Address, role: Role) {
        self.grants
            .write()
            .entry(principal.clone())
            .or_default()
            .insert(role);
    }

    pub fn revoke(&self, principal: &Address, role: Role) -> bool {
        let mut grants = self.grants.write();
        let Some(roles) = grants.get_mut(principal) else {
            return false;
        };
        let removed = roles.remove(&role);
        if roles.is_empty() {
            grants.remove(principal);
        }
        removed
    }

    /// Every (principal, role) pair, sorted.
    pub fn entries(&self) -> Vec<(Address, Role)> {
        self.grants
            .read()
            .iter()
            .flat_map(|(p, roles)| roles.iter().map(move |r| (p.clone(), *r)))
            .collect()
    }

    pub fn from_entries(entries: &[(Address, Role)]) -> Self {
        let table = Self::new();
        for (principal, role) in entries {
            table.grant(principal, *role);
        }
        table
    }
}

impl AccessPolicy for RoleTable {
    fn has_capability(&self, principal: &Address, role: Role) -> bool {
        self.grants
            .read()
            .get(principal)
            .map(|roles| roles.contains(&role))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_string_conversion() {
        assert_eq!(Role::Manager.as_str(), "manager");
        assert_eq!(Role::from_str("ADMIN"), Some(Role::Admin));
        assert_eq!(Role::from_str("root"), None);
    }

    #[test]
    fn test_grant_and_check() {
        let admin = Address::new("0xadmin");
        let table = RoleTable::new().with(&admin, Role::Admin);

        assert!(table.has_capability(&admin, Role::Admin));
        assert!(!table.has_capability(&admin, Role::Manager));
        assert!(table.require(&admin, Role::Admin).is_ok());

        let denied = table.require(&Address::new("0xnobody"), Role::Admin);
        assert!(matches!(
            denied,
            Err(VaultError::Unauthorized {
                role: Role::Admin,
                ..
            })
        ));
    }

    #[test]
    fn test_revoke_and_entries() {
        let m = Address::new("0xm");
        let table = RoleTable::new().with(&m, Role::Manager).with(&m, Role::Admin);
        assert_eq!(table.entries().len(), 2);

        assert!(table.revoke(&m, Role::Manager));
        assert!(!table.revoke(&m, Role::Manager));
        assert_eq!(table.entries(), vec![(m.clone(), Role::Admin)]);

        let rebuilt = RoleTable::from_entries(&table.entries());
        assert!(rebuilt.has_capability(&m, Role::Admin));
    }
}
