use anyhow::Result;
use rust_decimal::{Decimal, RoundingStrategy};

/// Calculate target position quantity with leverage support
///
/// # Arguments
/// * `account_equity` - Current account equity in quote currency
/// * `leverage` - Leverage multiplier (1-50)
/// * `position_pct` - Fraction of equity to deploy (0.0-1.0)
/// * `max_position_pct` - Cap on `position_pct` (0.0-1.0)
/// * `price` - Current price of the instrument
/// * `qty_step` - Exchange quantity increment; the result is floored to it
///
/// # Errors
/// Returns error if parameters are invalid
pub fn calculate_position_size(
    account_equity: Decimal,
    leverage: u8,
    position_pct: Decimal,
    max_position_pct: Decimal,
    price: Decimal,
    qty_step: Decimal,
) -> Result<Decimal> {
    if leverage == 0 || leverage > 50 {
        anyhow::bail!("Leverage must be between 1 and 50");
    }

    if price <= Decimal::ZERO {
        anyhow::bail!("Price must be positive");
    }

    if position_pct <= Decimal::ZERO {
        anyhow::bail!("Position percentage must be positive");
    }

    let pct = position_pct.min(max_position_pct);

    // Position value = equity × leverage × pct
    let position_value = account_equity * Decimal::from(leverage) * pct;

    Ok(floor_to_step(position_value / price, qty_step))
}

/// Floors `quantity` to a multiple of `step` (no-op for a non-positive step).
#[must_use]
pub fn floor_to_step(quantity: Decimal, step: Decimal) -> Decimal {
    if step <= Decimal::ZERO {
        return quantity;
    }
    (quantity / step).round_dp_with_strategy(0, RoundingStrategy::ToZero) * step
}

/// Rounds `quantity` up to a multiple of `step`.
#[must_use]
pub fn ceil_to_step(quantity: Decimal, step: Decimal) -> Decimal {
    if step <= Decimal::ZERO {
        return quantity;
    }
    (quantity / step).round_dp_with_strategy(0, RoundingStrategy::AwayFromZero) * step
}
