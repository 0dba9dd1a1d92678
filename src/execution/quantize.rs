use rust_decimal::prelude::*;

use crate::error::Error;
use crate::models::SymbolRules;
use crate::Result;

/// Exact decimal form of an f64 as it prints (1.23456, not 1.2345599999...)
fn to_decimal(value: f64) -> Option<Decimal> {
    Decimal::from_str(&value.to_string())
        .ok()
        .or_else(|| Decimal::from_f64(value))
}

/// Floor `quantity` to a multiple of `step`, rounded to the step's precision
///
/// A non-positive step leaves the quantity at 6 decimal places.
pub fn floor_to_step(quantity: f64, step: f64) -> f64 {
    let (Some(qty), Some(step_dec)) = (to_decimal(quantity), to_decimal(step)) else {
        return 0.0;
    };

    if step_dec <= Decimal::ZERO {
        return to_f64(qty.round_dp_with_strategy(6, RoundingStrategy::ToZero));
    }

    let precision = step_dec.normalize().scale();
    let floored = ((qty / step_dec).floor() * step_dec).round_dp(precision);

    to_f64(floored)
}

fn to_f64(value: Decimal) -> f64 {
    value.to_string().parse::<f64>().unwrap_or(0.0)
}

/// Quantity that the venue will accept for `symbol`
///
/// Flooring to zero means sizing and venue rules disagree, which is raised
/// rather than refused.
pub fn executable_quantity(rules: &SymbolRules, quantity: f64) -> Result<f64> {
    let executable = floor_to_step(quantity, rules.step_size);

    if executable <= 0.0 {
        return Err(Error::NonPositiveQuantity {
            symbol: rules.symbol.clone(),
            requested: quantity,
            step: rules.step_size,
        });
    }

    Ok(executable)
}
