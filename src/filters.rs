use crate::ingestion::ParsedLedgerRecord;
use crate::narration::NarrationType;
use crate::utils::parse_amount;
use log::debug;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashSet};

/// Closing balance records keyed by the raw `fromDate` of their period.
pub type ClosingBalanceMap = BTreeMap<String, ParsedLedgerRecord>;

#[derive(Debug, Clone, Default)]
pub struct FilteredLedger {
    pub records: Vec<ParsedLedgerRecord>,
    pub closing_balances: ClosingBalanceMap,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReversalPair {
    pub reversal: String,
    pub original: String,
}

/// Moves closing balance records out of the ledger into a map keyed by period start.
pub fn extract_closing_balances(
    records: Vec<ParsedLedgerRecord>,
) -> (Vec<ParsedLedgerRecord>, ClosingBalanceMap) {
    let mut closing_balances = ClosingBalanceMap::new();
    let mut remaining = Vec::with_capacity(records.len());

    for record in records {
        if record.narration.is(NarrationType::ClosingBalance) {
            closing_balances.insert(record.raw.from_date.trim().to_string(), record);
        } else {
            remaining.push(record);
        }
    }

    (remaining, closing_balances)
}

pub fn remove_zero_records(records: Vec<ParsedLedgerRecord>) -> Vec<ParsedLedgerRecord> {
    records
        .into_iter()
        .filter(|record| record.debit != 0 || record.credit != 0)
        .collect()
}

/// A closing balance is zero when its debit and credit are each zero or blank.
pub fn is_zero_closing_balance(record: &ParsedLedgerRecord) -> bool {
    let is_zero = |value: &str| matches!(parse_amount(value), Ok(0));
    is_zero(&record.raw.debit) && is_zero(&record.raw.credit)
}

fn compare_serial(a: &str, b: &str) -> Ordering {
    match (a.trim().parse::<u64>(), b.trim().parse::<u64>()) {
        (Ok(a), Ok(b)) => a.cmp(&b),
        (Ok(_), Err(_)) => Ordering::Less,
        (Err(_), Ok(_)) => Ordering::Greater,
        (Err(_), Err(_)) => a.cmp(b),
    }
}

fn is_reversal_of(reversal: &ParsedLedgerRecord, original: &ParsedLedgerRecord) -> bool {
    !original.is_reversal()
        && original.narration_type().is_some()
        && original.narration_type() == reversal.narration_type()
        && original.narration.meta == reversal.narration.meta
        && original.debit == reversal.credit
        && original.credit == reversal.debit
}

/// Matches every reversal with the nearest earlier record (by serial number) that it
/// exactly cancels. Each original is consumed by at most one reversal.
pub fn find_reversal_pairs(records: &[ParsedLedgerRecord]) -> Vec<ReversalPair> {
    let mut order: Vec<usize> = (0..records.len()).collect();
    order.sort_by(|&a, &b| compare_serial(records[a].sr_no(), records[b].sr_no()));

    let mut consumed = vec![false; records.len()];
    let mut pairs = Vec::new();

    for (pos, &idx) in order.iter().enumerate() {
        let reversal = &records[idx];
        if !reversal.is_reversal() {
            continue;
        }

        let original = order[..pos]
            .iter()
            .rev()
            .copied()
            .find(|&candidate| {
                !consumed[candidate] && is_reversal_of(reversal, &records[candidate])
            });

        if let Some(original) = original {
            consumed[idx] = true;
            consumed[original] = true;
            pairs.push(ReversalPair {
                reversal: reversal.sr_no().to_string(),
                original: records[original].sr_no().to_string(),
            });
        }
    }

    pairs
}

/// Drops every matched reversal together with the record it reverses.
pub fn remove_reversals(records: &[ParsedLedgerRecord]) -> Vec<ParsedLedgerRecord> {
    let pairs = find_reversal_pairs(records);
    let removed: HashSet<&str> = pairs
        .iter()
        .flat_map(|pair| [pair.reversal.as_str(), pair.original.as_str()])
        .collect();

    records
        .iter()
        .filter(|record| !removed.contains(record.sr_no()))
        .cloned()
        .collect()
}

/// Runs the closing balance, zero value and reversal filters in that order.
pub fn filter_ledger(records: Vec<ParsedLedgerRecord>) -> FilteredLedger {
    let total = records.len();
    let (records, closing_balances) = extract_closing_balances(records);
    let records = remove_zero_records(records);
    let non_zero = records.len();
    let records = remove_reversals(&records);

    debug!(
        "Filtered ledger: {} rows, {} closing balances, {} zero rows, {} reversed rows removed",
        total,
        closing_balances.len(),
        total - closing_balances.len() - non_zero,
        non_zero - records.len()
    );

    FilteredLedger {
        records,
        closing_balances,
    }
}
