//! Minor/major currency unit conversion
//!
//! Stripe reports amounts as integers in the currency's smallest unit
//! (cents for USD). Conversion to a major-unit [`Decimal`] happens once, where
//! provider data enters the crate.

use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;

use crate::error::{PaymentError, Result};

/// Currencies Stripe charges without a minor unit.
const ZERO_DECIMAL_CURRENCIES: &[&str] = &[
    "bif", "clp", "djf", "gnf", "jpy", "kmf", "krw", "mga", "pyg", "rwf", "ugx", "vnd", "vuv",
    "xaf", "xof", "xpf",
];

/// Number of decimal places in the currency's minor unit
pub fn minor_unit_exponent(currency: &str) -> u32 {
    let currency = currency.to_ascii_lowercase();
    if ZERO_DECIMAL_CURRENCIES.contains(&currency.as_str()) {
        0
    } else {
        2
    }
}

/// `4999` usd → `49.99`
pub fn from_minor(amount: i64, currency: &str) -> Decimal {
    Decimal::new(amount, minor_unit_exponent(currency))
}

/// `49.99` usd → `4999`
pub fn to_minor(amount: Decimal, currency: &str) -> Result<i64> {
    let factor = Decimal::from(10_i64.pow(minor_unit_exponent(currency)));
    amount
        .checked_mul(factor)
        .and_then(|minor| minor.round().to_i64())
        .ok_or_else(|| PaymentError::Config(format!("amount {amount} out of range for {currency}")))
}
