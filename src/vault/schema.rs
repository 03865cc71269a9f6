//! Versioned vault storage.
//!
//! `VaultStorage` is everything a vault persists. Older snapshots are brought
//! forward by [`migrate`], a pure function on the raw JSON, before any logic
//! version reads them.
//!
//! | version | unlock requests                     | fee totals              |
//! |---------|-------------------------------------|-------------------------|
//! | 1       | `fulfilled: bool`                   | absent                  |
//! | 2       | `status` + `fulfilled_at`           | `total_fees_collected`  |

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::vault::error::VaultError;
use crate::vault::fixed_point::{serde_u128, Amount};
use crate::vault::instance::VaultProfile;
use crate::vault::types::{Address, InvestmentTarget, TargetId, UnlockRequest, UserAsset, UserPosition};

pub const CURRENT_SCHEMA_VERSION: u32 = 2;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserAssetRecord {
    pub user: Address,
    pub asset: UserAsset,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PositionRecord {
    pub user: Address,
    pub target_id: TargetId,
    pub position: UserPosition,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaultStorage {
    pub schema_version: u32,
    pub profile: VaultProfile,
    pub implementation: Address,
    #[serde(default)]
    pub fee_rate_bps: u32,
    #[serde(default)]
    pub fee_receiver: Option<Address>,
    #[serde(with = "serde_u128")]
    pub tvl: Amount,
    #[serde(with = "serde_u128")]
    pub total_fees_collected: Amount,
    #[serde(default)]
    pub user_assets: Vec<UserAssetRecord>,
    #[serde(default)]
    pub positions: Vec<PositionRecord>,
    #[serde(default)]
    pub targets: Vec<InvestmentTarget>,
    #[serde(default)]
    pub unlock_requests: Vec<UnlockRequest>,
}

impl VaultStorage {
    pub fn to_json(&self) -> Result<String, VaultError> {
        serde_json::to_string(self).map_err(storage_error)
    }

    /// Parse and migrate a persisted snapshot.
    pub fn from_json(raw: &str) -> Result<Self, VaultError> {
        let value: Value = serde_json::from_str(raw).map_err(storage_error)?;
        migrate(value)
    }
}

/// Bring a raw snapshot of any supported version up to
/// [`CURRENT_SCHEMA_VERSION`] and decode it.
pub fn migrate(mut raw: Value) -> Result<VaultStorage, VaultError> {
    let version = schema_version(&raw)?;
    if version > CURRENT_SCHEMA_VERSION {
        return Err(VaultError::UnsupportedSchema {
            found: version,
            supported: CURRENT_SCHEMA_VERSION,
        });
    }
    if version < 2 {
        raw = migrate_v1_to_v2(raw)?;
    }
    serde_json::from_value(raw).map_err(storage_error)
}

/// Missing version means the original (v1) layout.
fn schema_version(raw: &Value) -> Result<u32, VaultError> {
    match raw.get("schema_version") {
        None | Some(Value::Null) => Ok(1),
        Some(v) => v
            .as_u64()
            .and_then(|n| u32::try_from(n).ok())
            .filter(|n| *n >= 1)
            .ok_or_else(|| VaultError::Storage {
                reason: format!("invalid schema_version {}", v),
            }),
    }
}

fn migrate_v1_to_v2(raw: Value) -> Result<Value, VaultError> {
    let Value::Object(mut root) = raw else {
        return Err(VaultError::Storage {
            reason: "vault storage is not an object".to_string(),
        });
    };

    if let Some(Value::Array(requests)) = root.get_mut("unlock_requests") {
        for req in requests.iter_mut() {
            let Value::Object(fields) = req else {
                return Err(VaultError::Storage {
                    reason: "unlock request is not an object".to_string(),
                });
            };
            upgrade_request(fields);
        }
    }

    root.entry("total_fees_collected")
        .or_insert_with(|| Value::String("0".to_string()));
    root.insert(
        "schema_version".to_string(),
        Value::from(CURRENT_SCHEMA_VERSION),
    );
    Ok(Value::Object(root))
}

fn upgrade_request(fields: &mut Map<String, Value>) {
    let fulfilled = fields
        .remove("fulfilled")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);
    if !fields.contains_key("status") {
        let status = if fulfilled { "fulfilled" } else { "pending" };
        fields.insert("status".to_string(), Value::String(status.to_string()));
    }
    fields.entry("fulfilled_at").or_insert(Value::Null);
}

fn storage_error(e: serde_json::Error) -> VaultError {
    VaultError::Storage {
        reason: e.to_string(),
    }
}
