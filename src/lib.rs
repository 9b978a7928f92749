//! # Tax Ledger Reconciler
//!
//! A library that explains why a taxpayer's pending liability changed between two
//! snapshot dates by mining the revenue authority's transactional ledger.
//!
//! ## Core Concepts
//!
//! - **Narrations**: free-text ledger descriptions classified into typed variants with metadata
//! - **Filtering**: closing balances are set aside, zero rows dropped and reversal pairs cancelled
//! - **Pairing**: payments are linked to the liabilities they settle
//! - **Balancing**: fully settled liabilities and their payments are removed
//! - **Attribution**: per liability type, the records whose sum explains the snapshot difference
//! - **System errors**: known portal-side anomalies such as rounded-up returns
//!
//! ## Example
//!
//! ```rust,ignore
//! use tax_ledger_reconciler::*;
//! use chrono::NaiveDate;
//!
//! let request = ReconciliationRequest {
//!     tax_type: TaxType::Itx,
//!     previous_date: NaiveDate::from_ymd_opt(2014, 2, 5).unwrap(),
//!     current_date: NaiveDate::from_ymd_opt(2014, 2, 12).unwrap(),
//!     previous_totals: generate_totals(&TotalColumn::ALL, "0.00"),
//!     current_totals: generate_totals(&TotalColumn::ALL, "1,000.00"),
//! };
//!
//! let rows: Vec<RawLedgerRow> = fetch_ledger_rows();
//! let report = reconcile(&request, &rows, &NoReceiptLookup).await?;
//! println!("{}", report.reason(LiabilityType::Principal).unwrap_or_default());
//! ```

pub mod balancer;
pub mod engine;
pub mod error;
pub mod filters;
pub mod ingestion;
pub mod narration;
pub mod pairing;
pub mod reasons;
pub mod schema;
pub mod system_errors;
pub mod utils;
pub mod validation;

pub use balancer::{remove_balanced_records, BalanceCanceler};
pub use engine::{
    explain_liability_change, prepare_ledger, ChangeAttributor, LiabilityOutcome, PreparedLedger,
};
pub use error::{ReconcileError, Result};
pub use filters::*;
pub use ingestion::*;
pub use narration::{
    parse_narration, NarrationGroup, NarrationType, ParsedNarration, ValueColumn,
};
pub use pairing::{pair_records, PairedLedger, PairedLedgerRecord, RecordRelations};
pub use reasons::{render_reason, render_reasons, ChangeReason, ChangeReasonDetails, NO_CHANGE};
pub use schema::*;
pub use system_errors::{
    detect_system_errors, Detection, NoReceiptLookup, ReceiptLookup, SystemError,
};
pub use utils::*;
pub use validation::{
    validate_narration, validate_record, validate_records, NarrationValidation, RecordValidation,
};

use log::{info, warn};
use std::collections::BTreeMap;

pub struct LedgerReconciler<R: ReceiptLookup = NoReceiptLookup> {
    receipts: R,
}

impl LedgerReconciler<NoReceiptLookup> {
    pub fn without_receipts() -> Self {
        Self {
            receipts: NoReceiptLookup,
        }
    }
}

impl<R: ReceiptLookup> LedgerReconciler<R> {
    pub fn new(receipts: R) -> Self {
        Self { receipts }
    }

    pub fn receipts(&self) -> &R {
        &self.receipts
    }

    pub async fn reconcile(
        &self,
        request: &ReconciliationRequest,
        rows: &[RawLedgerRow],
    ) -> Result<ReconciliationReport> {
        request.validate()?;
        let ledger = prepare_ledger(rows);
        Ok(build_report(request, &ledger, &self.receipts).await)
    }

    /// Reconciles against a ledger that was already prepared, e.g. when the same ledger
    /// is checked against several snapshot windows.
    pub async fn reconcile_prepared(
        &self,
        request: &ReconciliationRequest,
        ledger: &PreparedLedger,
    ) -> Result<ReconciliationReport> {
        request.validate()?;
        Ok(build_report(request, ledger, &self.receipts).await)
    }
}

pub async fn reconcile<R: ReceiptLookup>(
    request: &ReconciliationRequest,
    rows: &[RawLedgerRow],
    receipts: &R,
) -> Result<ReconciliationReport> {
    request.validate()?;
    let ledger = prepare_ledger(rows);
    Ok(build_report(request, &ledger, receipts).await)
}

/// Explains all three liability types concurrently. A branch that fails is reported as a
/// diagnostic and left out of `change_reasons`; the other branches are unaffected.
async fn build_report<R: ReceiptLookup>(
    request: &ReconciliationRequest,
    ledger: &PreparedLedger,
    receipts: &R,
) -> ReconciliationReport {
    info!(
        "Reconciling {} liabilities between {} and {}",
        request.tax_type, request.previous_date, request.current_date
    );

    let attributor = ChangeAttributor::new(request, ledger, receipts);
    let (principal, interest, penalty) = futures::join!(
        attributor.explain(LiabilityType::Principal),
        attributor.explain(LiabilityType::Interest),
        attributor.explain(LiabilityType::Penalty),
    );

    let mut report = ReconciliationReport {
        tax_type: request.tax_type,
        change_reasons: BTreeMap::new(),
        reason_details: BTreeMap::new(),
        changes: BTreeMap::new(),
        processing_errors: Vec::new(),
        invalid_records: ledger.invalid_records.clone(),
        any_errors: false,
    };

    for (liability, outcome) in LiabilityType::ALL
        .into_iter()
        .zip([principal, interest, penalty])
    {
        match outcome {
            Ok(outcome) => {
                report.change_reasons.insert(liability, outcome.rendered);
                report.reason_details.insert(liability, outcome.reasons);
                report.changes.insert(liability, outcome.change);
                report.processing_errors.extend(outcome.diagnostics);
            }
            Err(e) => {
                warn!("Could not explain {} liability: {}", liability, e);
                report.processing_errors.push(StructuredDiagnostic::new(
                    DiagnosticKind::LiabilityFailed,
                    Some(liability),
                    e.to_string(),
                ));
            }
        }
    }

    report.any_errors = !report.processing_errors.is_empty()
        || report.invalid_records.iter().any(|record| !record.valid);

    info!(
        "Finished {} reconciliation: {} diagnostics, {} invalid records",
        request.tax_type,
        report.processing_errors.len(),
        report.invalid_records.len()
    );

    report
}
