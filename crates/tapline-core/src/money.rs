//! # Money Module
//!
//! Amounts travel through the system as integer minor units. The only place
//! a float appears is the cashier's decimal text input, which is converted
//! here exactly once.
//!
//! ## Conversion Rule
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  "1.111"  ──parse──► 1.111  ──×100──► 111.1  ──round──► 111            │
//! │  "0.001"  ──parse──► 0.001  ──×100──►   0.1  ──round──►   0            │
//! │  "0.01"   ──parse──► 0.01   ──×100──►   1.0  ──round──►   1            │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::FieldError;

// =============================================================================
// Money Type
// =============================================================================

/// A monetary value in the smallest currency unit (haléř, cent, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Money(i64);

impl Money {
    /// Creates a value from minor units.
    ///
    /// ```rust
    /// use tapline_core::money::Money;
    ///
    /// let price = Money::from_minor(2050);
    /// assert_eq!(price.minor(), 2050);
    /// ```
    #[inline]
    pub const fn from_minor(minor: i64) -> Self {
        Money(minor)
    }

    /// Returns the value in minor units.
    #[inline]
    pub const fn minor(&self) -> i64 {
        self.0
    }

    /// Returns the major unit portion.
    #[inline]
    pub const fn major(&self) -> i64 {
        self.0 / 100
    }

    /// Returns the minor unit portion (always 0-99).
    #[inline]
    pub const fn minor_part(&self) -> i64 {
        (self.0 % 100).abs()
    }

    /// Checks if the value is strictly positive.
    #[inline]
    pub const fn is_positive(&self) -> bool {
        self.0 > 0
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        write!(f, "{}{}.{:02}", sign, self.major().abs(), self.minor_part())
    }
}

// =============================================================================
// Input Conversion
// =============================================================================

/// Parses cashier input as a decimal number.
///
/// Non-finite values (`inf`, `NaN`) are rejected like any other garbage.
pub fn parse_decimal(input: &str) -> Option<f64> {
    input.parse::<f64>().ok().filter(|value| value.is_finite())
}

/// Converts decimal amount text into minor units, rounding half away from zero.
///
/// ```rust
/// use tapline_core::money::convert_amount;
///
/// assert_eq!(convert_amount("1.111").unwrap().minor(), 111);
/// assert_eq!(convert_amount("0.01").unwrap().minor(), 1);
/// ```
pub fn convert_amount(input: &str) -> Result<Money, FieldError> {
    let value = parse_decimal(input).ok_or(FieldError::InvalidAmount)?;
    Ok(Money((value * 100.0).round() as i64))
}

// =============================================================================
// Unit Tests
// =============================================================================
