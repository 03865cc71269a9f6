//! Fixed-Point Arithmetic for Vault Accounting
//!
//! All ledger values are unsigned integers. Three scales are in play:
//!
//! ```text
//! Amount  = settlement asset base units (10^asset_decimals per whole unit, e.g. 10^6 for USDC)
//! Shares  = SHARE_SCALE (10^18) per whole share
//! Price   = PRICE_SCALE (10^18) per whole asset unit, quoted per whole share
//! ```
//!
//! Converting `price * shares` into an `Amount` therefore divides by
//! `PRICE_SCALE * SHARE_SCALE` and multiplies by `10^asset_decimals`.
//! Intermediate products routinely exceed `u128` (10 shares at price 100 is
//! already 1e39), so every multiply-then-divide goes through [`mul_div`] on
//! arbitrary-precision integers and is narrowed back afterwards.

use num_bigint::BigUint;

use crate::vault::error::VaultError;

/// Asset base units.
pub type Amount = u128;

/// Share quantity, scaled by [`SHARE_SCALE`].
pub type Shares = u128;

/// Price per whole share in whole asset units, scaled by [`PRICE_SCALE`].
pub type Price = u128;

/// 1 share = 10^18 share units.
pub const SHARE_SCALE: u128 = 1_000_000_000_000_000_000;

/// 1.0 price = 10^18 price units.
pub const PRICE_SCALE: u128 = 1_000_000_000_000_000_000;

/// Fee rates are basis points: 10_000 = 100%.
pub const BPS_DENOMINATOR: u128 = 10_000;

/// Largest decimals value an asset may declare (10^38 still fits u128).
pub const MAX_ASSET_DECIMALS: u32 = 38;

/// `floor(a * b / denom)` computed without intermediate overflow.
pub fn mul_div(a: u128, b: u128, denom: u128) -> Result<u128, VaultError> {
    if denom == 0 {
        return Err(VaultError::Overflow {
            context: "division by zero".to_string(),
        });
    }
    let product = BigUint::from(a) * BigUint::from(b);
    narrow(product / BigUint::from(denom), "mul_div")
}

/// Value of `shares` at `price`, expressed in asset base units.
pub fn shares_value(shares: Shares, price: Price, asset_decimals: u32) -> Result<Amount, VaultError> {
    let unit = asset_unit(asset_decimals)?;
    let product = BigUint::from(shares) * BigUint::from(price) * BigUint::from(unit);
    let denom = BigUint::from(SHARE_SCALE) * BigUint::from(PRICE_SCALE);
    narrow(product / denom, "shares_value")
}

/// Realized profit of closing `shares` bought at `entry_price` and sold at
/// `exit_price`. Losses yield zero; they are already reflected in the
/// settlement proceeds and never carry a fee.
pub fn realized_profit(
    entry_price: Price,
    exit_price: Price,
    shares: Shares,
    asset_decimals: u32,
) -> Result<Amount, VaultError> {
    if exit_price <= entry_price {
        return Ok(0);
    }
    shares_value(shares, exit_price - entry_price, asset_decimals)
}

/// Share-weighted average of an existing position and a new fill.
pub fn weighted_entry_price(
    held_shares: Shares,
    held_price: Price,
    new_shares: Shares,
    new_price: Price,
) -> Result<Price, VaultError> {
    let total = held_shares
        .checked_add(new_shares)
        .ok_or_else(|| VaultError::Overflow {
            context: "position shares".to_string(),
        })?;
    if total == 0 {
        return Ok(0);
    }
    let weighted = BigUint::from(held_shares) * BigUint::from(held_price)
        + BigUint::from(new_shares) * BigUint::from(new_price);
    narrow(weighted / BigUint::from(total), "entry_price")
}

/// `amount * rate_bps / 10_000`, floored.
pub fn fee_for(amount: Amount, rate_bps: u32) -> Result<Amount, VaultError> {
    mul_div(amount, rate_bps as u128, BPS_DENOMINATOR)
}

/// 10^decimals as an integer.
pub fn asset_unit(decimals: u32) -> Result<u128, VaultError> {
    if decimals > MAX_ASSET_DECIMALS {
        return Err(VaultError::Overflow {
            context: format!("asset decimals {}", decimals),
        });
    }
    Ok(10u128.pow(decimals))
}

/// Whole units to base units, e.g. `units(1000, 6) == 1_000_000_000`.
pub fn units(whole: u128, decimals: u32) -> Result<u128, VaultError> {
    whole
        .checked_mul(asset_unit(decimals)?)
        .ok_or_else(|| VaultError::Overflow {
            context: format!("{} * 10^{}", whole, decimals),
        })
}

/// Parse a human decimal string ("1000", "12.5") into base units at `decimals`.
pub fn parse_units(raw: &str, decimals: u32) -> Result<u128, VaultError> {
    let bad = || VaultError::Overflow {
        context: format!("'{}' at {} decimals", raw, decimals),
    };
    let s = raw.trim();
    let (whole, frac) = match s.split_once('.') {
        Some((w, f)) => (w, f),
        None => (s, ""),
    };
    if whole.is_empty() && frac.is_empty() {
        return Err(bad());
    }
    if frac.len() > decimals as usize
        || !whole.chars().all(|c| c.is_ascii_digit())
        || !frac.chars().all(|c| c.is_ascii_digit())
    {
        return Err(bad());
    }
    let whole_units = if whole.is_empty() {
        0
    } else {
        units(whole.parse::<u128>().map_err(|_| bad())?, decimals)?
    };
    let frac_units = if frac.is_empty() {
        0
    } else {
        let scale = asset_unit(decimals - frac.len() as u32)?;
        frac.parse::<u128>()
            .map_err(|_| bad())?
            .checked_mul(scale)
            .ok_or_else(bad)?
    };
    whole_units.checked_add(frac_units).ok_or_else(bad)
}

fn narrow(value: BigUint, context: &str) -> Result<u128, VaultError> {
    u128::try_from(value).map_err(|_| VaultError::Overflow {
        context: context.to_string(),
    })
}

/// Serde adapter rendering `u128` as a decimal string.
///
/// JSON numbers cannot carry 18-decimal prices through `serde_json::Value`.
pub mod serde_u128 {
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &u128, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u128, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Text(String),
            Number(u64),
        }

        match Repr::deserialize(deserializer)? {
            Repr::Text(s) => s.trim().parse::<u128>().map_err(D::Error::custom),
            Repr::Number(n) => Ok(n as u128),
        }
    }
}
