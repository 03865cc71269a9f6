//! Strategy vault: ledger, unlock queue and the public vault operations.

pub mod access;
pub mod asset;
pub mod clock;
pub mod error;
pub mod fixed_point;
pub mod instance;
pub mod ledger;
pub mod schema;
pub mod types;
pub mod unlock_queue;
pub mod vault_db;

pub use access::{AccessPolicy, Role, RoleTable};
pub use asset::{
    AssetProvider, AssetTransferService, TokenLedger, TokenRegistry, TransferError,
    VaultTokenAccount,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::VaultError;
pub use fixed_point::{Amount, Price, Shares, PRICE_SCALE, SHARE_SCALE};
pub use instance::{UserSummary, VaultInstance, VaultProfile, DEFAULT_MAX_PENDING_PAGE};
pub use ledger::{FeeSchedule, PositionLedger, TradeOutcome};
pub use schema::{migrate, VaultStorage, CURRENT_SCHEMA_VERSION};
pub use types::{
    Address, InvestmentTarget, StrategyInfo, TargetId, TradeDetail, TradeType, UnlockEntry,
    UnlockRequest, UnlockStatus, UserAsset, UserPosition, DEFAULT_PLATFORM_LABEL,
};
pub use unlock_queue::{UnlockQueue, DEFAULT_UNLOCK_LOCK_PERIOD_SECS};
pub use vault_db::{RegistryStateRecord, RegistryVaultRecord, VaultDb};
