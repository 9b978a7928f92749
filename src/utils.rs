use crate::error::{ReconcileError, Result};
use chrono::{Datelike, NaiveDate};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use std::str::FromStr;

/// Monetary amount scaled by 100 (two implied decimal places).
pub type Amount = i64;

pub const LEDGER_DATE_FORMAT: &str = "%d/%m/%Y";

/// Parses a ledger amount such as `"1,234.50"` into an [`Amount`].
///
/// Thousands separators and whitespace are ignored and an empty string is zero.
pub fn parse_amount(value: &str) -> Result<Amount> {
    let cleaned: String = value
        .chars()
        .filter(|c| *c != ',' && !c.is_whitespace())
        .collect();

    if cleaned.is_empty() {
        return Ok(0);
    }

    let decimal = Decimal::from_str(&cleaned)
        .map_err(|_| ReconcileError::InvalidAmount(value.to_string()))?;

    (decimal * Decimal::ONE_HUNDRED)
        .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
        .to_i64()
        .ok_or_else(|| ReconcileError::InvalidAmount(value.to_string()))
}

/// Parses a snapshot total. Unlike ledger amounts, an empty or non-numeric total is an error.
pub fn parse_total(column: &str, value: &str) -> Result<Amount> {
    let invalid = || ReconcileError::InvalidTotal {
        column: column.to_string(),
        value: value.to_string(),
    };

    if value.trim().is_empty() {
        return Err(invalid());
    }
    parse_amount(value).map_err(|_| invalid())
}

pub fn parse_ledger_date(value: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(value.trim(), LEDGER_DATE_FORMAT).map_err(|_| {
        ReconcileError::InvalidDate(format!(
            "'{}' does not match the expected DD/MM/YYYY format",
            value
        ))
    })
}

/// Formats a date as `dd/mm/yy` for display in change reasons.
pub fn format_short_date(date: NaiveDate) -> String {
    date.format("%d/%m/%y").to_string()
}

pub fn format_amount(amount: Amount) -> String {
    let sign = if amount < 0 { "-" } else { "" };
    let abs = amount.unsigned_abs();
    format!("{}{}.{:02}", sign, abs / 100, abs % 100)
}

/// Rounds an amount up to the next whole currency unit.
pub fn ceil_to_unit(amount: Amount) -> Amount {
    match amount.rem_euclid(100) {
        0 => amount,
        rem => amount.saturating_add(100 - rem),
    }
}

pub fn month_number(name: &str) -> Option<u32> {
    const MONTHS: [&str; 12] = [
        "january",
        "february",
        "march",
        "april",
        "may",
        "june",
        "july",
        "august",
        "september",
        "october",
        "november",
        "december",
    ];

    let name = name.trim().to_lowercase();
    if name.len() < 3 {
        return None;
    }
    MONTHS
        .iter()
        .position(|month| *month == name || month.starts_with(&name))
        .map(|idx| idx as u32 + 1)
}

/// True when the period covers a whole calendar year.
pub fn is_calendar_year(from: NaiveDate, to: NaiveDate) -> bool {
    from.year() == to.year()
        && from.month() == 1
        && from.day() == 1
        && to.month() == 12
        && to.day() == 31
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_amount() {
        assert_eq!(parse_amount("1,234.50").unwrap(), 123_450);
        assert_eq!(parse_amount("0.00").unwrap(), 0);
        assert_eq!(parse_amount("").unwrap(), 0);
        assert_eq!(parse_amount("  ").unwrap(), 0);
        assert_eq!(parse_amount("-12.3").unwrap(), -1_230);
        assert_eq!(parse_amount("1,000,000").unwrap(), 100_000_000);
        assert_eq!(parse_amount("0.005").unwrap(), 1);
        assert!(parse_amount("abc").is_err());
    }

    #[test]
    fn test_parse_total_rejects_blank_and_text() {
        assert_eq!(parse_total("principal", "600.00").unwrap(), 60_000);
        assert!(matches!(
            parse_total("principal", ""),
            Err(ReconcileError::InvalidTotal { .. })
        ));
        assert!(matches!(
            parse_total("interest", "n/a"),
            Err(ReconcileError::InvalidTotal { .. })
        ));
    }

    #[test]
    fn test_parse_ledger_date() {
        assert_eq!(
            parse_ledger_date("12/02/2013").unwrap(),
            NaiveDate::from_ymd_opt(2013, 2, 12).unwrap()
        );
        assert!(parse_ledger_date("2013-02-12").is_err());
        assert!(parse_ledger_date("").is_err());
    }

    #[test]
    fn test_format_helpers() {
        let date = NaiveDate::from_ymd_opt(2013, 2, 12).unwrap();
        assert_eq!(format_short_date(date), "12/02/13");
        assert_eq!(format_amount(123_450), "1234.50");
        assert_eq!(format_amount(-5), "-0.05");
    }

    #[test]
    fn test_ceil_to_unit() {
        assert_eq!(ceil_to_unit(150), 200);
        assert_eq!(ceil_to_unit(100), 100);
        assert_eq!(ceil_to_unit(1), 100);
        assert_eq!(ceil_to_unit(0), 0);
        assert_eq!(ceil_to_unit(-150), -100);
        assert_eq!(ceil_to_unit(Amount::MAX), Amount::MAX);
    }

    #[test]
    fn test_month_number() {
        assert_eq!(month_number("January"), Some(1));
        assert_eq!(month_number("sep"), Some(9));
        assert_eq!(month_number("december"), Some(12));
        assert_eq!(month_number("ja"), None);
        assert_eq!(month_number("smarch"), None);
    }
}
