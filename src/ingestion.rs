use crate::narration::{
    parse_narration, NarrationGroup, NarrationType, ParsedNarration, ValueColumn,
};
use crate::schema::{LiabilityType, RawLedgerRow};
use crate::utils::{parse_amount, parse_ledger_date, Amount};
use chrono::NaiveDate;
use log::debug;
use serde::{Deserialize, Serialize};

/// Columns of a raw row that could not be converted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParseIssues {
    pub unparseable_columns: Vec<ValueColumn>,
    pub invalid_dates: Vec<String>,
}

impl ParseIssues {
    pub fn is_empty(&self) -> bool {
        self.unparseable_columns.is_empty() && self.invalid_dates.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedLedgerRecord {
    pub raw: RawLedgerRow,
    pub narration: ParsedNarration,
    pub debit: Amount,
    pub credit: Amount,
    pub transaction_date: Option<NaiveDate>,
    pub from_date: Option<NaiveDate>,
    pub to_date: Option<NaiveDate>,
    pub issues: ParseIssues,
}

impl ParsedLedgerRecord {
    pub fn sr_no(&self) -> &str {
        &self.raw.sr_no
    }

    /// Net effect on the liability: debits raise it, credits lower it.
    pub fn balance(&self) -> Amount {
        self.debit.saturating_sub(self.credit)
    }

    pub fn narration_type(&self) -> Option<NarrationType> {
        self.narration.narration_type
    }

    pub fn group(&self) -> Option<NarrationGroup> {
        self.narration.group()
    }

    pub fn is_reversal(&self) -> bool {
        self.narration.reversal
    }

    pub fn liability(&self) -> Option<LiabilityType> {
        self.narration.liability()
    }

    /// Key identifying the accounting period the record was posted to.
    pub fn period_key(&self) -> String {
        format!("{}|{}", self.raw.from_date.trim(), self.raw.to_date.trim())
    }

    pub fn transaction_timestamp(&self) -> Option<i64> {
        self.transaction_date
            .and_then(|date| date.and_hms_opt(0, 0, 0))
            .map(|datetime| datetime.and_utc().timestamp())
    }
}

fn amount_or_zero(value: &str, column: ValueColumn, issues: &mut ParseIssues) -> Amount {
    match parse_amount(value) {
        Ok(amount) => amount,
        Err(_) => {
            issues.unparseable_columns.push(column);
            0
        }
    }
}

fn date_or_none(value: &str, column: &str, issues: &mut ParseIssues) -> Option<NaiveDate> {
    match parse_ledger_date(value) {
        Ok(date) => Some(date),
        Err(_) => {
            issues.invalid_dates.push(column.to_string());
            None
        }
    }
}

/// Converts a raw row into a typed record. Never fails: conversion problems are
/// recorded on [`ParsedLedgerRecord::issues`].
pub fn normalize_row(row: &RawLedgerRow) -> ParsedLedgerRecord {
    let mut issues = ParseIssues::default();

    let debit = amount_or_zero(&row.debit, ValueColumn::Debit, &mut issues);
    let credit = amount_or_zero(&row.credit, ValueColumn::Credit, &mut issues);
    let transaction_date = date_or_none(&row.transaction_date, "transactionDate", &mut issues);
    let from_date = date_or_none(&row.from_date, "fromDate", &mut issues);
    let to_date = date_or_none(&row.to_date, "toDate", &mut issues);

    ParsedLedgerRecord {
        raw: row.clone(),
        narration: parse_narration(&row.narration),
        debit,
        credit,
        transaction_date,
        from_date,
        to_date,
        issues,
    }
}

pub fn normalize_ledger(rows: &[RawLedgerRow]) -> Vec<ParsedLedgerRecord> {
    let records: Vec<ParsedLedgerRecord> = rows.iter().map(normalize_row).collect();

    let with_issues = records.iter().filter(|r| !r.issues.is_empty()).count();
    let unknown = records
        .iter()
        .filter(|r| r.narration_type().is_none())
        .count();
    debug!(
        "Normalized {} ledger rows ({} with conversion issues, {} with unknown narrations)",
        records.len(),
        with_issues,
        unknown
    );

    records
}
