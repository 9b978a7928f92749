//! Links payments to the liabilities they settle.
//!
//! Records live in one vector and the links between them live in a parallel vector of
//! [`RecordRelations`], addressed by serial number through an index. Nothing in the
//! ledger records themselves is mutated during pairing.

use crate::ingestion::ParsedLedgerRecord;
use crate::narration::{against, fields, NarrationGroup, NarrationType};
use crate::utils::Amount;
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::ops::Deref;

/// Links computed for one record. Serial numbers refer back into the ledger.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordRelations {
    /// The liability record a payment or advance payment was matched to.
    pub payment_of: Option<String>,
    pub payments: Vec<String>,
    pub payments_sum: Amount,
    /// Records that offset this one when balancing.
    pub counterparts: Vec<String>,
    pub counterparts_sum: Amount,
    pub advance_payments: Vec<String>,
    pub advance_payments_sum: Amount,
}

/// Borrowed view of a record together with its relations.
#[derive(Debug, Clone, Copy)]
pub struct PairedLedgerRecord<'a> {
    pub record: &'a ParsedLedgerRecord,
    pub relations: &'a RecordRelations,
}

impl Deref for PairedLedgerRecord<'_> {
    type Target = ParsedLedgerRecord;

    fn deref(&self) -> &Self::Target {
        self.record
    }
}

#[derive(Debug, Clone, Default)]
pub struct PairedLedger {
    records: Vec<ParsedLedgerRecord>,
    relations: Vec<RecordRelations>,
    index: HashMap<String, usize>,
}

impl PairedLedger {
    fn new(records: Vec<ParsedLedgerRecord>, relations: Vec<RecordRelations>) -> Self {
        let index = records
            .iter()
            .enumerate()
            .map(|(idx, record)| (record.sr_no().to_string(), idx))
            .collect();
        Self {
            records,
            relations,
            index,
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn contains(&self, sr_no: &str) -> bool {
        self.index.contains_key(sr_no)
    }

    pub fn get(&self, sr_no: &str) -> Option<PairedLedgerRecord<'_>> {
        self.index.get(sr_no).map(|&idx| PairedLedgerRecord {
            record: &self.records[idx],
            relations: &self.relations[idx],
        })
    }

    pub fn relations(&self, sr_no: &str) -> Option<&RecordRelations> {
        self.index.get(sr_no).map(|&idx| &self.relations[idx])
    }

    pub fn records(&self) -> &[ParsedLedgerRecord] {
        &self.records
    }

    pub fn iter(&self) -> impl Iterator<Item = PairedLedgerRecord<'_>> {
        self.records
            .iter()
            .zip(&self.relations)
            .map(|(record, relations)| PairedLedgerRecord { record, relations })
    }

    /// New ledger holding only the records `keep` accepts. Relations are carried over
    /// unchanged, so they may name records that are no longer present.
    pub fn filtered<F>(&self, mut keep: F) -> PairedLedger
    where
        F: FnMut(PairedLedgerRecord<'_>) -> bool,
    {
        let (records, relations) = self
            .iter()
            .filter(|paired| keep(*paired))
            .map(|paired| (paired.record.clone(), paired.relations.clone()))
            .unzip();
        PairedLedger::new(records, relations)
    }
}

/// What a payment's `against` field says it settles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentTarget {
    Returns,
    Variant(NarrationType),
}

pub fn payment_target(against_value: &str) -> Option<PaymentTarget> {
    let target = match against_value {
        against::PRINCIPAL_LIABILITY => PaymentTarget::Returns,
        against::INTEREST => PaymentTarget::Variant(NarrationType::LatePaymentInterest),
        against::PAYMENT_PENALTY => PaymentTarget::Variant(NarrationType::LatePaymentPenalty),
        against::LATE_RETURN_PENALTY => PaymentTarget::Variant(NarrationType::LateReturnPenalty),
        against::ASSESSMENT_LIABILITY => PaymentTarget::Variant(NarrationType::Assessment),
        against::ASSESSMENT_MANUAL_PENALTY => {
            PaymentTarget::Variant(NarrationType::AssessmentManualPenalty)
        }
        against::UNDER_ESTIMATION_PENALTY => {
            PaymentTarget::Variant(NarrationType::UnderEstimationPenalty)
        }
        _ => return None,
    };
    Some(target)
}

fn is_payment_target(payment: &ParsedLedgerRecord, candidate: &ParsedLedgerRecord) -> bool {
    if candidate.is_reversal() {
        return false;
    }

    match payment.narration.meta(fields::AGAINST).and_then(payment_target) {
        Some(PaymentTarget::Returns) => {
            if candidate.group() != Some(NarrationGroup::Returns) {
                return false;
            }
            if !candidate.narration.is(NarrationType::ProvisionalReturn) {
                return true;
            }
            match payment.narration.meta(fields::QUARTER) {
                Some(quarter) => candidate.narration.meta(fields::QUARTER) == Some(quarter),
                None => true,
            }
        }
        Some(PaymentTarget::Variant(variant)) => candidate.narration.is(variant),
        None => false,
    }
}

fn link_payment(
    records: &[ParsedLedgerRecord],
    relations: &mut [RecordRelations],
    payment_idx: usize,
    earlier: &[usize],
) {
    let payment = &records[payment_idx];
    let amount = payment.balance().saturating_neg();

    // A split payment must not push an already part-paid liability past its debit.
    let target = earlier.iter().rev().copied().find(|&candidate| {
        let links = &relations[candidate];
        is_payment_target(payment, &records[candidate])
            && (links.payments.is_empty()
                || links.payments_sum.saturating_add(amount) <= records[candidate].debit)
    });

    let Some(target_idx) = target else {
        debug!("No liability found for payment {}", payment.sr_no());
        return;
    };

    let target = &records[target_idx];
    let payment_sr = payment.sr_no().to_string();
    let target_sr = target.sr_no().to_string();

    let payment_links = &mut relations[payment_idx];
    payment_links.payment_of = Some(target_sr.clone());
    payment_links.counterparts.push(target_sr);
    payment_links.counterparts_sum = payment_links
        .counterparts_sum
        .saturating_add(target.balance());

    let target_links = &mut relations[target_idx];
    target_links.payments.push(payment_sr.clone());
    target_links.payments_sum = target_links.payments_sum.saturating_add(amount);
    target_links.counterparts.push(payment_sr);
    target_links.counterparts_sum = target_links
        .counterparts_sum
        .saturating_add(payment.balance());
}

fn link_advance_payment(
    records: &[ParsedLedgerRecord],
    relations: &mut [RecordRelations],
    payment_idx: usize,
    earlier: &[usize],
) {
    let payment = &records[payment_idx];

    let target = earlier.iter().rev().copied().find(|&candidate| {
        let candidate = &records[candidate];
        !candidate.is_reversal() && candidate.group() == Some(NarrationGroup::Returns)
    });

    let Some(target_idx) = target else {
        debug!("No return found for advance payment {}", payment.sr_no());
        return;
    };

    relations[payment_idx].payment_of = Some(records[target_idx].sr_no().to_string());

    let target_links = &mut relations[target_idx];
    target_links
        .advance_payments
        .push(payment.sr_no().to_string());
    target_links.advance_payments_sum = target_links
        .advance_payments_sum
        .saturating_add(payment.balance().saturating_neg());
}

/// Pairs payments and advance payments with earlier liability records of the same period.
pub fn pair_records(records: Vec<ParsedLedgerRecord>) -> PairedLedger {
    let mut relations = vec![RecordRelations::default(); records.len()];

    let mut periods: BTreeMap<String, Vec<usize>> = BTreeMap::new();
    for (idx, record) in records.iter().enumerate() {
        periods.entry(record.period_key()).or_default().push(idx);
    }

    for members in periods.values() {
        for (pos, &idx) in members.iter().enumerate() {
            let record = &records[idx];
            if record.is_reversal() {
                continue;
            }
            let earlier = &members[..pos];
            match record.narration_type() {
                Some(NarrationType::Payment) => {
                    link_payment(&records, &mut relations, idx, earlier)
                }
                Some(NarrationType::AdvancePayment) => {
                    link_advance_payment(&records, &mut relations, idx, earlier)
                }
                _ => {}
            }
        }
    }

    let linked = relations.iter().filter(|r| r.payment_of.is_some()).count();
    debug!(
        "Paired {} records across {} periods ({} payments linked)",
        records.len(),
        periods.len(),
        linked
    );

    PairedLedger::new(records, relations)
}
