//! # Validation Module
//!
//! Cashier input rules for the payment form.
//!
//! ## Rules
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  Amount (checked in order)                                              │
//! │  ├── empty                         → EmptyAmount                        │
//! │  ├── not a decimal number          → InvalidAmount                      │
//! │  ├── < 20.0                        → TooSmall                           │
//! │  ├── > 50000.0                     → TooBig                             │
//! │  └── otherwise                     → valid                              │
//! │                                                                         │
//! │  Reference number (checked in order)                                    │
//! │  ├── empty                         → EmptyReference                     │
//! │  ├── longer than 20 characters     → InvalidReference                   │
//! │  ├── any non-digit character       → InvalidReference                   │
//! │  └── otherwise                     → valid                              │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Validators return `Option<FieldError>`: `None` means the input is valid,
//! which is what the field error slots in the session state store directly.

use crate::error::FieldError;
use crate::money::parse_decimal;
use crate::{MAX_AMOUNT, MAX_REFERENCE_LENGTH, MIN_AMOUNT};

/// Validates the amount text.
///
/// ```rust
/// use tapline_core::validation::validate_amount;
/// use tapline_core::FieldError;
///
/// assert_eq!(validate_amount("20"), None);
/// assert_eq!(validate_amount("19.99"), Some(FieldError::TooSmall));
/// ```
pub fn validate_amount(amount: &str) -> Option<FieldError> {
    if amount.is_empty() {
        return Some(FieldError::EmptyAmount);
    }

    let Some(value) = parse_decimal(amount) else {
        return Some(FieldError::InvalidAmount);
    };

    if value < MIN_AMOUNT {
        Some(FieldError::TooSmall)
    } else if value > MAX_AMOUNT {
        Some(FieldError::TooBig)
    } else {
        None
    }
}

/// Validates the merchant reference number.
pub fn validate_reference_number(reference: &str) -> Option<FieldError> {
    if reference.is_empty() {
        return Some(FieldError::EmptyReference);
    }

    if reference.chars().count() > MAX_REFERENCE_LENGTH {
        return Some(FieldError::InvalidReference);
    }

    if !reference.chars().all(|c| c.is_ascii_digit()) {
        return Some(FieldError::InvalidReference);
    }

    None
}

// =============================================================================
// Unit Tests
// =============================================================================
