//! Scripted replay of vault operations.
//!
//! A script is a JSON document listing tokens and an ordered list of steps.
//! Quantities are human decimal strings: amounts in asset units, shares and
//! prices in whole shares / whole asset units per share. Vaults are referenced
//! by strategy symbol, targets by their symbol.
//!
//! ```json
//! {
//!   "owner": "0xowner",
//!   "tokens": [{ "address": "0xusdc", "symbol": "USDC", "decimals": 6 }],
//!   "steps": [
//!     { "op": "mint", "token": "0xusdc", "to": "0xuser1", "amount": "1000" },
//!     { "op": "deposit", "vault": "ETH-PERP-LONG", "user": "0xuser1", "amount": "0", "expect_error": "ZeroAmount" }
//!   ]
//! }
//! ```

use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};

use crate::config::VaultConfig;
use crate::registry::{CreateVaultParams, VaultHandle, VaultRegistry};
use crate::vault::access::{Role, RoleTable};
use crate::vault::asset::{TokenLedger, TokenRegistry};
use crate::vault::clock::{Clock, ManualClock};
use crate::vault::error::VaultError;
use crate::vault::fixed_point::{parse_units, serde_u128, Amount};
use crate::vault::instance::{UserSummary, VaultInstance};
use crate::vault::types::{
    Address, StrategyInfo, TradeDetail, TradeType, UnlockEntry, UnlockRequest,
};

const SHARE_DECIMALS: u32 = 18;
const PRICE_DECIMALS: u32 = 18;

fn default_owner() -> String {
    "0xowner".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReplayScript {
    /// Unix time the manual clock starts at; defaults to now.
    #[serde(default)]
    pub start_time: Option<i64>,
    /// Registry owner principal.
    #[serde(default = "default_owner")]
    pub owner: String,
    #[serde(default)]
    pub tokens: Vec<TokenSpec>,
    pub steps: Vec<ReplayStep>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TokenSpec {
    pub address: String,
    pub symbol: String,
    pub decimals: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReplayStep {
    #[serde(flatten)]
    pub op: ReplayOp,
    /// Substring the step's error must contain; the step must fail.
    #[serde(default)]
    pub expect_error: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScriptTrade {
    pub user: String,
    pub target: String,
    pub trade_type: TradeType,
    pub amount: String,
    pub shares: String,
    pub price: String,
    #[serde(default)]
    pub unlock_request_id: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScriptUnlock {
    pub target: String,
    pub shares: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ReplayOp {
    Mint {
        token: String,
        to: String,
        amount: String,
    },
    /// `owner` approves the vault registered under `vault`.
    Approve {
        token: String,
        owner: String,
        vault: String,
        amount: String,
    },
    CreateVault {
        caller: String,
        admin: String,
        manager: String,
        asset: String,
        name: String,
        symbol: String,
        strategy_symbol: String,
        #[serde(default)]
        end_time: i64,
    },
    Deposit {
        vault: String,
        user: String,
        amount: String,
    },
    AdminWithdraw {
        vault: String,
        caller: String,
        user: String,
        amount: String,
    },
    RegisterTarget {
        vault: String,
        caller: String,
        symbol: String,
        asset: String,
    },
    Trades {
        vault: String,
        caller: String,
        trades: Vec<ScriptTrade>,
    },
    Unlock {
        vault: String,
        user: String,
        entries: Vec<ScriptUnlock>,
    },
    CancelUnlock {
        vault: String,
        user: String,
        request_id: u64,
    },
    AdvanceTime {
        secs: i64,
    },
    Withdraw {
        vault: String,
        user: String,
        amount: String,
    },
    SetFeeReceiver {
        vault: String,
        caller: String,
        receiver: String,
    },
    SetFeeRate {
        vault: String,
        caller: String,
        rate_bps: u32,
    },
    ReturnCapital {
        vault: String,
        caller: String,
        amount: String,
    },
    Upgrade {
        vault: String,
        caller: String,
        implementation: String,
    },
    UpdateImplementation {
        caller: String,
        implementation: String,
    },
}

impl ReplayOp {
    pub fn name(&self) -> &'static str {
        match self {
            ReplayOp::Mint { .. } => "mint",
            ReplayOp::Approve { .. } => "approve",
            ReplayOp::CreateVault { .. } => "create_vault",
            ReplayOp::Deposit { .. } => "deposit",
            ReplayOp::AdminWithdraw { .. } => "admin_withdraw",
            ReplayOp::RegisterTarget { .. } => "register_target",
            ReplayOp::Trades { .. } => "trades",
            ReplayOp::Unlock { .. } => "unlock",
            ReplayOp::CancelUnlock { .. } => "cancel_unlock",
            ReplayOp::AdvanceTime { .. } => "advance_time",
            ReplayOp::Withdraw { .. } => "withdraw",
            ReplayOp::SetFeeReceiver { .. } => "set_fee_receiver",
            ReplayOp::SetFeeRate { .. } => "set_fee_rate",
            ReplayOp::ReturnCapital { .. } => "return_capital",
            ReplayOp::Upgrade { .. } => "upgrade",
            ReplayOp::UpdateImplementation { .. } => "update_implementation",
        }
    }
}

// =============================================================================
// REPORT
// =============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct StepResult {
    pub index: usize,
    pub op: &'static str,
    pub ok: bool,
    pub detail: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct VaultReport {
    pub info: StrategyInfo,
    #[serde(with = "serde_u128")]
    pub custody_balance: Amount,
    #[serde(with = "serde_u128")]
    pub total_fees_collected: Amount,
    pub users: Vec<UserSummary>,
    pub unlock_requests: Vec<UnlockRequest>,
    pub pending_unlocks: Vec<UnlockRequest>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReplayReport {
    pub final_time: i64,
    pub vault_implementation: Address,
    pub next_strategy_id: u64,
    pub steps: Vec<StepResult>,
    pub vaults: Vec<VaultReport>,
}

// =============================================================================
// EXECUTION
// =============================================================================

/// In-memory world a script runs against.
pub struct ReplayEnv {
    pub tokens: Arc<TokenRegistry>,
    pub clock: Arc<ManualClock>,
    pub registry: VaultRegistry,
}

impl ReplayEnv {
    pub fn new(script: &ReplayScript, config: &VaultConfig) -> Result<Self> {
        let tokens = Arc::new(TokenRegistry::new());
        for spec in &script.tokens {
            tokens.register(Arc::new(TokenLedger::new(
                &Address::new(&spec.address),
                spec.symbol.clone(),
                spec.decimals,
            )));
        }
        let clock = Arc::new(match script.start_time {
            Some(ts) => ManualClock::new(ts),
            None => ManualClock::starting_now(),
        });
        let owner = Address::new(&script.owner);
        let registry = VaultRegistry::new(
            Arc::new(RoleTable::new().with(&owner, Role::Owner)),
            tokens.clone(),
            clock.clone(),
            &Address::new(&config.implementation),
            config.vault_defaults(),
        )?;
        Ok(Self {
            tokens,
            clock,
            registry,
        })
    }

    fn token(&self, address: &str) -> Result<Arc<TokenLedger>> {
        self.tokens
            .get(&Address::new(address))
            .ok_or_else(|| anyhow!("unknown token {}", address))
    }

    fn vault(&self, reference: &str) -> Result<VaultHandle, VaultError> {
        self.registry.require_vault(reference)
    }

    /// Run one step. Ledger rejections come back as `Ok(Err(..))` so the caller
    /// can match them against `expect_error`; script mistakes are `Err`.
    fn apply(&self, op: &ReplayOp) -> Result<Result<String, VaultError>> {
        let outcome = match op {
            ReplayOp::Mint { token, to, amount } => {
                let token = self.token(token)?;
                let amount = parse_units(amount, token.decimals())?;
                token
                    .mint(&Address::new(to), amount)
                    .map_err(VaultError::from)
                    .map(|_| format!("minted {}", amount))
            }
            ReplayOp::Approve {
                token,
                owner,
                vault,
                amount,
            } => {
                let token = self.token(token)?;
                let amount = parse_units(amount, token.decimals())?;
                match self.vault(vault) {
                    Ok(handle) => {
                        let spender = handle.lock().address().clone();
                        token.approve(&Address::new(owner), &spender, amount);
                        Ok(format!("approved {} for {}", amount, spender))
                    }
                    Err(e) => Err(e),
                }
            }
            ReplayOp::CreateVault {
                caller,
                admin,
                manager,
                asset,
                name,
                symbol,
                strategy_symbol,
                end_time,
            } => self
                .registry
                .create_vault(
                    &Address::new(caller),
                    CreateVaultParams {
                        admin: Address::new(admin),
                        manager: Address::new(manager),
                        asset: Address::new(asset),
                        name: name.clone(),
                        symbol: symbol.clone(),
                        strategy_symbol: strategy_symbol.clone(),
                        end_time: *end_time,
                    },
                )
                .map(|addr| format!("vault {}", addr)),
            ReplayOp::Deposit {
                vault,
                user,
                amount,
            } => self.with_vault(vault, |v| {
                let amount = parse_units(amount, v.profile().asset_decimals)?;
                v.deposit(&Address::new(user), amount)
                    .map(|a| format!("total_amount {}", a.total_amount))
            }),
            ReplayOp::AdminWithdraw {
                vault,
                caller,
                user,
                amount,
            } => self.with_vault(vault, |v| {
                let amount = parse_units(amount, v.profile().asset_decimals)?;
                v.admin_withdraw(&Address::new(caller), &Address::new(user), amount)
                    .map(|a| format!("locked_amount {}", a.locked_amount))
            }),
            ReplayOp::RegisterTarget {
                vault,
                caller,
                symbol,
                asset,
            } => self.with_vault(vault, |v| {
                v.register_investment_target(&Address::new(caller), symbol, &Address::new(asset))
                    .map(|id| format!("target {}", id))
            }),
            ReplayOp::Trades {
                vault,
                caller,
                trades,
            } => {
                let now = self.clock.now();
                self.with_vault(vault, |v| {
                    let decimals = v.profile().asset_decimals;
                    let mut details = Vec::with_capacity(trades.len());
                    for t in trades {
                        details.push(TradeDetail {
                            user: Address::new(&t.user),
                            target_id: v.target_id_for(&t.target),
                            trade_type: t.trade_type,
                            total_amount: parse_units(&t.amount, decimals)?,
                            total_shares: parse_units(&t.shares, SHARE_DECIMALS)?,
                            trade_price: parse_units(&t.price, PRICE_DECIMALS)?,
                            trade_time: now,
                            unlock_request_id: t.unlock_request_id,
                        });
                    }
                    v.update_user_position_and_assets(&Address::new(caller), &details)
                        .map(|outcomes| {
                            let fees: Amount = outcomes.iter().map(|o| o.fee).sum();
                            format!("{} trades settled, fees {}", outcomes.len(), fees)
                        })
                })
            }
            ReplayOp::Unlock {
                vault,
                user,
                entries,
            } => self.with_vault(vault, |v| {
                let mut wanted = Vec::with_capacity(entries.len());
                for e in entries {
                    wanted.push(UnlockEntry {
                        target_id: v.target_id_for(&e.target),
                        unlock_shares: parse_units(&e.shares, SHARE_DECIMALS)?,
                    });
                }
                v.unlock_investment_shares(&Address::new(user), &wanted)
                    .map(|ids| format!("requests {:?}", ids))
            }),
            ReplayOp::CancelUnlock {
                vault,
                user,
                request_id,
            } => self.with_vault(vault, |v| {
                v.cancel_unlock_request(&Address::new(user), *request_id)
                    .map(|r| format!("cancelled request {}", r.id))
            }),
            ReplayOp::AdvanceTime { secs } => Ok(format!("now {}", self.clock.advance(*secs))),
            ReplayOp::Withdraw {
                vault,
                user,
                amount,
            } => self.with_vault(vault, |v| {
                let amount = parse_units(amount, v.profile().asset_decimals)?;
                v.withdraw(&Address::new(user), amount)
                    .map(|a| format!("unlocked_amount {}", a.unlocked_amount))
            }),
            ReplayOp::SetFeeReceiver {
                vault,
                caller,
                receiver,
            } => self.with_vault(vault, |v| {
                v.set_fee_receiver(&Address::new(caller), &Address::new(receiver))
                    .map(|_| format!("fee receiver {}", receiver))
            }),
            ReplayOp::SetFeeRate {
                vault,
                caller,
                rate_bps,
            } => self.with_vault(vault, |v| {
                v.set_fee_rate(&Address::new(caller), *rate_bps)
                    .map(|_| format!("fee rate {} bps", rate_bps))
            }),
            ReplayOp::ReturnCapital {
                vault,
                caller,
                amount,
            } => self.with_vault(vault, |v| {
                let amount = parse_units(amount, v.profile().asset_decimals)?;
                v.return_capital(&Address::new(caller), amount)
                    .map(|_| format!("custody {}", v.custody_balance()))
            }),
            ReplayOp::Upgrade {
                vault,
                caller,
                implementation,
            } => self.with_vault(vault, |v| {
                v.upgrade_to(&Address::new(caller), &Address::new(implementation))
                    .map(|_| format!("implementation {}", implementation))
            }),
            ReplayOp::UpdateImplementation {
                caller,
                implementation,
            } => self
                .registry
                .update_implementation(&Address::new(caller), &Address::new(implementation))
                .map(|_| format!("factory implementation {}", implementation)),
        };
        Ok(outcome)
    }

    fn with_vault<F>(&self, reference: &str, f: F) -> Result<String, VaultError>
    where
        F: FnOnce(&mut VaultInstance) -> Result<String, VaultError>,
    {
        let handle = self.vault(reference)?;
        let mut vault = handle.lock();
        f(&mut vault)
    }

    pub fn report(&self, steps: Vec<StepResult>) -> ReplayReport {
        let mut vaults = Vec::new();
        for address in self.registry.get_all_vaults() {
            let Some(handle) = self.registry.get_vault(&address) else {
                continue;
            };
            let v = handle.lock();
            vaults.push(VaultReport {
                info: v.get_strategy_info(),
                custody_balance: v.custody_balance(),
                total_fees_collected: v.total_fees_collected(),
                users: v.users().iter().map(|u| v.user_summary(u)).collect(),
                unlock_requests: v.unlock_requests().to_vec(),
                pending_unlocks: v.get_pending_unlock_requests(usize::MAX),
            });
        }
        ReplayReport {
            final_time: self.clock.now(),
            vault_implementation: self.registry.vault_implementation(),
            next_strategy_id: self.registry.next_strategy_id(),
            steps,
            vaults,
        }
    }
}

/// Execute every step of `script`. A step failing without a matching
/// `expect_error` (or succeeding when one is set) aborts the run.
pub fn run_script(script: &ReplayScript, config: &VaultConfig) -> Result<(ReplayEnv, ReplayReport)> {
    let env = ReplayEnv::new(script, config)?;
    let mut results = Vec::with_capacity(script.steps.len());

    for (index, step) in script.steps.iter().enumerate() {
        let name = step.op.name();
        let outcome = env
            .apply(&step.op)
            .with_context(|| format!("step {} ({})", index, name))?;
        let result = match (outcome, &step.expect_error) {
            (Ok(detail), None) => StepResult {
                index,
                op: name,
                ok: true,
                detail,
            },
            (Ok(detail), Some(expected)) => {
                bail!(
                    "step {} ({}) succeeded ({}) but was expected to fail with '{}'",
                    index,
                    name,
                    detail,
                    expected
                );
            }
            (Err(e), Some(expected)) if e.to_string().contains(expected.as_str()) => StepResult {
                index,
                op: name,
                ok: false,
                detail: e.to_string(),
            },
            (Err(e), _) => {
                return Err(anyhow::Error::new(e).context(format!("step {} ({}) failed", index, name)));
            }
        };
        debug!(index, op = name, ok = result.ok, detail = %result.detail, "replay step");
        results.push(result);
    }

    info!(steps = results.len(), vaults = env.registry.get_vault_count(), "replay complete");
    let report = env.report(results);
    Ok((env, report))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn script(steps: serde_json::Value) -> ReplayScript {
        serde_json::from_value(serde_json::json!({
            "start_time": 1_700_000_000,
            "tokens": [{ "address": "0xusdc", "symbol": "USDC", "decimals": 6 }],
            "steps": steps
        }))
        .unwrap()
    }

    #[test]
    fn test_step_wire_format() {
        let s = script(serde_json::json!([
            { "op": "advance_time", "secs": 60 },
            { "op": "set_fee_rate", "vault": "X", "caller": "0xm", "rate_bps": 2000, "expect_error": "InvalidStrategyId" }
        ]));
        assert!(matches!(s.steps[0].op, ReplayOp::AdvanceTime { secs: 60 }));
        assert_eq!(s.steps[1].expect_error.as_deref(), Some("InvalidStrategyId"));
    }

    #[test]
    fn test_expected_error_is_recorded() {
        let s = script(serde_json::json!([
            { "op": "create_vault", "caller": "0xc", "admin": "0xa", "manager": "0xm",
              "asset": "0xusdc", "name": "ETH", "symbol": "qETH", "strategy_symbol": "ETH-PERP-LONG" },
            { "op": "deposit", "vault": "ETH-PERP-LONG", "user": "0xu1", "amount": "0", "expect_error": "ZeroAmount" }
        ]));
        let (_, report) = run_script(&s, &VaultConfig::default()).unwrap();
        assert_eq!(report.steps.len(), 2);
        assert!(!report.steps[1].ok);
        assert_eq!(report.vaults.len(), 1);
        assert_eq!(report.next_strategy_id, 2);
    }

    #[test]
    fn test_unexpected_error_aborts() {
        let s = script(serde_json::json!([
            { "op": "deposit", "vault": "MISSING", "user": "0xu1", "amount": "1" }
        ]));
        assert!(run_script(&s, &VaultConfig::default()).is_err());
    }

    #[test]
    fn test_unknown_token_is_script_error() {
        let s = script(serde_json::json!([
            { "op": "mint", "token": "0xdai", "to": "0xu1", "amount": "1" }
        ]));
        let err = run_script(&s, &VaultConfig::default()).err().unwrap();
        assert!(format!("{:#}", err).contains("unknown token"));
    }
}
