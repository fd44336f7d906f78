//! Amount handling utilities for quotes and stakes

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};

/// Round a stake to the nearest multiple of `increment` (half away from zero)
///
/// A non-positive increment leaves the value untouched.
pub fn round_to_increment(value: Decimal, increment: Decimal) -> Decimal {
    if increment <= Decimal::ZERO {
        return value;
    }
    let steps = (value / increment).round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero);
    (steps * increment).normalize()
}

/// Round then clamp a stake into `[min, max]`
///
/// The upper bound is the largest multiple of `increment` not above `max`,
/// so a cap that sits off the grid still yields a stake on it.
pub fn bounded_stake(value: Decimal, increment: Decimal, min: Decimal, max: Decimal) -> Decimal {
    let ceiling = floor_to_increment(max, increment).max(min);
    round_to_increment(value, increment).max(min).min(ceiling)
}

fn floor_to_increment(value: Decimal, increment: Decimal) -> Decimal {
    if increment <= Decimal::ZERO {
        return value;
    }
    ((value / increment).floor() * increment).normalize()
}

/// Last digit of a quote displayed at `decimals` precision
///
/// Quotes arrive without trailing zeros (`1234.5` at precision 2 is displayed
/// as `1234.50`), so the value is rescaled before taking the digit.
pub fn last_digit(quote: Decimal, decimals: u32) -> u8 {
    let rounded = quote
        .abs()
        .round_dp_with_strategy(decimals, RoundingStrategy::MidpointAwayFromZero);
    let scaled = (rounded * Decimal::from(10u64.pow(decimals))).trunc();
    (scaled % Decimal::TEN).to_u8().unwrap_or(0)
}
