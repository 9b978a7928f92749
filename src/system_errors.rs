//! Detection of known portal-side ledger anomalies.

use crate::error::Result;
use crate::filters::{is_zero_closing_balance, ClosingBalanceMap};
use crate::narration::NarrationGroup;
use crate::pairing::PairedLedgerRecord;
use crate::schema::{DiagnosticKind, LiabilityType, StructuredDiagnostic, TaxType};
use crate::utils::{ceil_to_unit, format_amount, Amount};
use chrono::NaiveDate;
use log::{debug, warn};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::future::Future;

/// Source of acknowledgement-of-return receipts.
///
/// Implementations own retries and timeouts; the detector awaits each call once.
pub trait ReceiptLookup: Sync {
    /// Liability amounts stated on receipts filed for the period on `applied_date`.
    fn acknowledgement_receipt_amounts(
        &self,
        tax_type: TaxType,
        period_from: NaiveDate,
        period_to: NaiveDate,
        applied_date: NaiveDate,
    ) -> impl Future<Output = Result<Vec<Amount>>> + Send;

    /// Whether receipts can be fetched at all. Detection still runs when they cannot,
    /// it just goes unconfirmed.
    fn is_available(&self) -> bool {
        true
    }
}

/// Lookup used when no receipt source is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoReceiptLookup;

impl ReceiptLookup for NoReceiptLookup {
    fn acknowledgement_receipt_amounts(
        &self,
        _tax_type: TaxType,
        _period_from: NaiveDate,
        _period_to: NaiveDate,
        _applied_date: NaiveDate,
    ) -> impl Future<Output = Result<Vec<Amount>>> + Send {
        futures::future::ready(Ok(Vec::new()))
    }

    fn is_available(&self) -> bool {
        false
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SystemError {
    /// The portal rounded the return's liability up to a whole unit and charged the
    /// fraction as a new liability.
    ReturnRoundedUp,
    /// An advance payment settled the return but was never allocated to it.
    UnallocatedAdvancePayment,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Detection {
    pub system_errors: Vec<SystemError>,
    pub processing_errors: Vec<StructuredDiagnostic>,
}

impl Detection {
    pub fn has(&self, error: SystemError) -> bool {
        self.system_errors.contains(&error)
    }
}

/// Run-level facts the detector needs besides the record itself.
#[derive(Debug, Clone, Copy)]
pub struct DetectionContext<'a> {
    pub tax_type: TaxType,
    pub liability: LiabilityType,
    pub difference: Amount,
    pub closing_balances: &'a ClosingBalanceMap,
}

pub struct SystemErrorDetector<'a, R: ReceiptLookup> {
    context: DetectionContext<'a>,
    receipts: &'a R,
}

impl<'a, R: ReceiptLookup> SystemErrorDetector<'a, R> {
    pub fn new(context: DetectionContext<'a>, receipts: &'a R) -> Self {
        Self { context, receipts }
    }

    pub async fn detect(&self, record: PairedLedgerRecord<'_>) -> Detection {
        let mut detection = Detection::default();
        if self.context.difference <= 0 || record.group() != Some(NarrationGroup::Returns) {
            return detection;
        }

        if self.is_rounded_up(record) {
            debug!("Return {} looks rounded up", record.sr_no());
            detection.system_errors.push(SystemError::ReturnRoundedUp);
            self.confirm_with_receipts(record, &mut detection).await;
        }

        if self.is_unallocated_advance_payment(record, &mut detection) {
            debug!("Return {} has an unallocated advance payment", record.sr_no());
            detection
                .system_errors
                .push(SystemError::UnallocatedAdvancePayment);
        }

        detection
    }

    fn is_rounded_up(&self, record: PairedLedgerRecord<'_>) -> bool {
        let payments_sum = record.relations.payments_sum;
        self.context.liability == LiabilityType::Principal
            && self.context.difference > 0
            && self.context.difference < 100
            && payments_sum > 0
            && ceil_to_unit(record.debit) == payments_sum
    }

    async fn confirm_with_receipts(
        &self,
        record: PairedLedgerRecord<'_>,
        detection: &mut Detection,
    ) {
        if !self.receipts.is_available() {
            return;
        }

        let liability = Some(self.context.liability);
        let (Some(from), Some(to), Some(applied)) =
            (record.from_date, record.to_date, record.transaction_date)
        else {
            detection.processing_errors.push(
                StructuredDiagnostic::new(
                    DiagnosticKind::ReceiptLookupFailed,
                    liability,
                    format!(
                        "Return {} has no usable period or transaction date, receipts not checked",
                        record.sr_no()
                    ),
                )
                .with_records([record.sr_no()]),
            );
            return;
        };

        let amounts = match self
            .receipts
            .acknowledgement_receipt_amounts(self.context.tax_type, from, to, applied)
            .await
        {
            Ok(amounts) => amounts,
            Err(e) => {
                warn!("Receipt lookup for return {} failed: {}", record.sr_no(), e);
                detection.processing_errors.push(
                    StructuredDiagnostic::new(
                        DiagnosticKind::ReceiptLookupFailed,
                        liability,
                        e.to_string(),
                    )
                    .with_records([record.sr_no()]),
                );
                return;
            }
        };

        let expected = record.relations.payments_sum;
        let matches = amounts.iter().filter(|amount| **amount == expected).count();
        let diagnostic = match matches {
            1 => {
                debug!("Receipt confirms rounding on return {}", record.sr_no());
                return;
            }
            0 => StructuredDiagnostic::new(
                DiagnosticKind::ReceiptNotFound,
                liability,
                format!(
                    "No acknowledgement receipt states a liability of {} for return {}",
                    format_amount(expected),
                    record.sr_no()
                ),
            ),
            n => StructuredDiagnostic::new(
                DiagnosticKind::AmbiguousReceipt,
                liability,
                format!(
                    "{} acknowledgement receipts state a liability of {} for return {}",
                    n,
                    format_amount(expected),
                    record.sr_no()
                ),
            ),
        };
        warn!("{}", diagnostic);
        detection
            .processing_errors
            .push(diagnostic.with_records([record.sr_no()]));
    }

    fn is_unallocated_advance_payment(
        &self,
        record: PairedLedgerRecord<'_>,
        detection: &mut Detection,
    ) -> bool {
        if record.relations.advance_payments.is_empty() {
            return false;
        }

        let period_start = record.raw.from_date.trim();
        match self.context.closing_balances.get(period_start) {
            Some(closing) => is_zero_closing_balance(closing),
            None => {
                let diagnostic = StructuredDiagnostic::new(
                    DiagnosticKind::MissingClosingBalance,
                    Some(self.context.liability),
                    format!("No closing balance found for period starting {}", period_start),
                )
                .with_records([record.sr_no()]);
                warn!("{}", diagnostic);
                detection.processing_errors.push(diagnostic);
                false
            }
        }
    }
}

/// Checks one return for system errors. Does nothing unless the liability increased.
pub async fn detect_system_errors<R: ReceiptLookup>(
    record: PairedLedgerRecord<'_>,
    context: DetectionContext<'_>,
    receipts: &R,
) -> Detection {
    SystemErrorDetector::new(context, receipts)
        .detect(record)
        .await
}
