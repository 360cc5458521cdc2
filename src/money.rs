//! Client amount parsing.
//!
//! Client-facing amounts travel as strings (JSON floats lose precision) and
//! are converted to [`rust_decimal::Decimal`] exactly once, here. No silent
//! truncation: inputs with more decimal places than the currency allows are
//! rejected, not rounded.

use rust_decimal::Decimal;
use std::str::FromStr;
use thiserror::Error;

/// Decimal places accepted for MWK and the other fiat currencies we settle.
const FIAT_SCALE: u32 = 2;

#[derive(Debug, Error, PartialEq)]
pub enum MoneyError {
    #[error("invalid amount format: {0}")]
    InvalidFormat(String),

    #[error("amount must be positive")]
    NotPositive,

    #[error("too many decimal places: provided {provided}, max allowed {max}")]
    PrecisionOverflow { provided: u32, max: u32 },
}

/// Parse a client amount string into a `Decimal`.
///
/// Rejects empty strings, signs, non-numeric input, zero/negative amounts,
/// and more than [`FIAT_SCALE`] decimal places.
pub fn parse_amount(amount_str: &str) -> Result<Decimal, MoneyError> {
    let amount_str = amount_str.trim();
    if amount_str.is_empty() {
        return Err(MoneyError::InvalidFormat("empty string".into()));
    }

    // Signs are rejected outright; amounts are magnitudes.
    if amount_str.starts_with('-') || amount_str.starts_with('+') {
        return Err(MoneyError::NotPositive);
    }

    let amount = Decimal::from_str(amount_str)
        .map_err(|e| MoneyError::InvalidFormat(e.to_string()))?;

    if amount <= Decimal::ZERO {
        return Err(MoneyError::NotPositive);
    }

    if amount.scale() > FIAT_SCALE {
        return Err(MoneyError::PrecisionOverflow {
            provided: amount.scale(),
            max: FIAT_SCALE,
        });
    }

    Ok(amount)
}

/// Format an amount for client display, always showing the currency scale.
pub fn format_amount(amount: Decimal) -> String {
    format!("{:.1$}", amount, FIAT_SCALE as usize)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dec(s: &str) -> Decimal {
        Decimal::from_str_exact(s).unwrap()
    }

    #[test]
    fn test_parse_valid_amounts() {
        assert_eq!(parse_amount("5000").unwrap(), dec("5000"));
        assert_eq!(parse_amount("5000.50").unwrap(), dec("5000.50"));
        assert_eq!(parse_amount(" 12.5 ").unwrap(), dec("12.5"));
    }

    #[test]
    fn test_parse_rejects_non_positive() {
        assert_eq!(parse_amount("0"), Err(MoneyError::NotPositive));
        assert_eq!(parse_amount("0.00"), Err(MoneyError::NotPositive));
        assert_eq!(parse_amount("-5"), Err(MoneyError::NotPositive));
        assert_eq!(parse_amount("+5"), Err(MoneyError::NotPositive));
    }

    #[test]
    fn test_parse_rejects_excess_precision() {
        assert_eq!(
            parse_amount("10.005"),
            Err(MoneyError::PrecisionOverflow {
                provided: 3,
                max: 2
            })
        );
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(matches!(parse_amount(""), Err(MoneyError::InvalidFormat(_))));
        assert!(matches!(parse_amount("abc"), Err(MoneyError::InvalidFormat(_))));
        assert!(matches!(
            parse_amount("1.2.3"),
            Err(MoneyError::InvalidFormat(_))
        ));
    }

    #[test]
    fn test_format_shows_currency_scale() {
        assert_eq!(format_amount(dec("5000")), "5000.00");
        assert_eq!(format_amount(dec("12.5")), "12.50");
    }
}
