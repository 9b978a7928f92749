use crate::balancer::remove_balanced_records;
use crate::error::{ReconcileError, Result};
use crate::filters::{filter_ledger, ClosingBalanceMap};
use crate::ingestion::{normalize_ledger, ParsedLedgerRecord};
use crate::narration::{NarrationGroup, NarrationType};
use crate::pairing::{pair_records, PairedLedger, PairedLedgerRecord};
use crate::reasons::{render_reasons, ChangeReason, ChangeReasonDetails};
use crate::schema::{
    DiagnosticKind, LiabilityChange, LiabilityType, RawLedgerRow, ReconciliationRequest,
    StructuredDiagnostic,
};
use crate::system_errors::{
    detect_system_errors, Detection, DetectionContext, ReceiptLookup, SystemError,
};
use crate::utils::{format_amount, Amount};
use crate::validation::{validate_records, RecordValidation};
use futures::future::join_all;
use log::{debug, warn};
use std::collections::{HashMap, HashSet};

/// A ledger taken through every stage that does not depend on the snapshot totals.
#[derive(Debug, Clone, Default)]
pub struct PreparedLedger {
    /// Validation results for records that failed validation.
    pub invalid_records: Vec<RecordValidation>,
    /// Every filtered record with its pairing relations.
    pub paired: PairedLedger,
    /// The paired records left after balance cancellation.
    pub unbalanced: PairedLedger,
    pub closing_balances: ClosingBalanceMap,
}

pub fn prepare_ledger(rows: &[RawLedgerRow]) -> PreparedLedger {
    let records = normalize_ledger(rows);

    let invalid_records: Vec<RecordValidation> = validate_records(&records)
        .into_iter()
        .filter(|validation| !validation.valid)
        .collect();

    let filtered = filter_ledger(records);
    let paired = pair_records(filtered.records);
    let unbalanced = remove_balanced_records(&paired);

    debug!(
        "Prepared ledger: {} rows, {} invalid, {} paired, {} unbalanced",
        rows.len(),
        invalid_records.len(),
        paired.len(),
        unbalanced.len()
    );

    PreparedLedger {
        invalid_records,
        paired,
        unbalanced,
        closing_balances: filtered.closing_balances,
    }
}

/// Result of explaining one liability type.
#[derive(Debug, Clone, PartialEq)]
pub struct LiabilityOutcome {
    pub liability: LiabilityType,
    pub change: LiabilityChange,
    pub reasons: Vec<ChangeReason>,
    pub rendered: String,
    pub diagnostics: Vec<StructuredDiagnostic>,
}

pub struct ChangeAttributor<'a, R: ReceiptLookup> {
    request: &'a ReconciliationRequest,
    ledger: &'a PreparedLedger,
    receipts: &'a R,
}

impl<'a, R: ReceiptLookup> ChangeAttributor<'a, R> {
    pub fn new(
        request: &'a ReconciliationRequest,
        ledger: &'a PreparedLedger,
        receipts: &'a R,
    ) -> Self {
        Self {
            request,
            ledger,
            receipts,
        }
    }

    /// Explains why `liability` moved between the two snapshots.
    ///
    /// Only a non-numeric snapshot total, or a change too large to represent, is an error.
    /// Everything else that goes wrong is reported on [`LiabilityOutcome::diagnostics`].
    pub async fn explain(&self, liability: LiabilityType) -> Result<LiabilityOutcome> {
        let previous = self.request.previous_total(liability)?;
        let current = self.request.current_total(liability)?;
        let difference = current
            .checked_sub(previous)
            .ok_or_else(|| ReconcileError::TotalOutOfRange {
                liability: liability.to_string(),
                previous: format_amount(previous),
                current: format_amount(current),
            })?;
        let change = LiabilityChange {
            previous,
            current,
            difference,
        };

        if difference == 0 {
            debug!("No change in {} liability", liability);
            let reasons = vec![ChangeReason::NoChange];
            return Ok(LiabilityOutcome {
                liability,
                change,
                rendered: render_reasons(self.request.tax_type, &reasons),
                reasons,
                diagnostics: Vec::new(),
            });
        }

        let mut diagnostics = Vec::new();
        let candidates = self.candidates(liability);
        let change_set =
            self.select_change_set(liability, difference, &candidates, &mut diagnostics);

        if change_set.is_empty() {
            diagnostics.push(StructuredDiagnostic::new(
                DiagnosticKind::NoChangeRecords,
                Some(liability),
                format!(
                    "No ledger records found to explain a change of {}",
                    format_amount(difference)
                ),
            ));
        } else {
            let sum = change_set
                .iter()
                .try_fold(0 as Amount, |sum, record| sum.checked_add(record.balance()));
            if sum != Some(difference) {
                let boundary = candidates
                    .iter()
                    .filter(|record| self.on_window_boundary(record))
                    .map(|record| record.sr_no());
                let sum = sum.map_or_else(|| "an out of range amount".to_string(), format_amount);
                diagnostics.push(
                    StructuredDiagnostic::new(
                        DiagnosticKind::ChangeSumMismatch,
                        Some(liability),
                        format!(
                            "Change records sum to {} but the total changed by {}",
                            sum,
                            format_amount(difference)
                        ),
                    )
                    .with_records(boundary),
                );
            }
        }

        let detections = self.run_detector(liability, difference, &change_set).await;
        for (_, detection) in &detections {
            diagnostics.extend(detection.processing_errors.iter().cloned());
        }
        let detections: HashMap<String, Detection> = detections.into_iter().collect();

        let reasons = self.select_evidence(&change_set, &detections);
        for diagnostic in &diagnostics {
            warn!("{}", diagnostic);
        }

        Ok(LiabilityOutcome {
            liability,
            change,
            rendered: render_reasons(self.request.tax_type, &reasons),
            reasons,
            diagnostics,
        })
    }

    fn in_window(&self, record: &ParsedLedgerRecord) -> bool {
        record.transaction_date.is_some_and(|date| {
            date >= self.request.previous_date && date <= self.request.current_date
        })
    }

    fn on_window_boundary(&self, record: &ParsedLedgerRecord) -> bool {
        record.transaction_date.is_some_and(|date| {
            date == self.request.previous_date || date == self.request.current_date
        })
    }

    /// Unbalanced, in-window records of this liability type. Advance payments never move
    /// a total on their own.
    fn candidates(&self, liability: LiabilityType) -> Vec<PairedLedgerRecord<'a>> {
        self.ledger
            .unbalanced
            .iter()
            .filter(|record| {
                self.in_window(record)
                    && record.liability() == Some(liability)
                    && !record.narration.is(NarrationType::AdvancePayment)
            })
            .collect()
    }

    fn select_change_set(
        &self,
        liability: LiabilityType,
        difference: Amount,
        candidates: &[PairedLedgerRecord<'a>],
        diagnostics: &mut Vec<StructuredDiagnostic>,
    ) -> Vec<PairedLedgerRecord<'a>> {
        let exact: Vec<&PairedLedgerRecord<'a>> = candidates
            .iter()
            .filter(|record| record.balance() == difference)
            .collect();

        match exact.as_slice() {
            [single] => vec![**single],
            [] => candidates.to_vec(),
            many => {
                diagnostics.push(
                    StructuredDiagnostic::new(
                        DiagnosticKind::AmbiguousExactMatch,
                        Some(liability),
                        format!(
                            "{} records match the change of {} exactly, using all candidates",
                            many.len(),
                            format_amount(difference)
                        ),
                    )
                    .with_records(many.iter().map(|record| record.sr_no())),
                );
                candidates.to_vec()
            }
        }
    }

    /// The return a change record traces back to, if any.
    fn lineage(&self, record: PairedLedgerRecord<'a>) -> Option<PairedLedgerRecord<'a>> {
        if record.group() == Some(NarrationGroup::Returns) {
            return Some(record);
        }
        if !record.narration.is(NarrationType::Payment) {
            return None;
        }
        record
            .relations
            .payment_of
            .as_deref()
            .and_then(|sr_no| self.ledger.paired.get(sr_no))
            .filter(|target| target.group() == Some(NarrationGroup::Returns))
    }

    /// Runs the detector once per distinct return behind the change set.
    async fn run_detector(
        &self,
        liability: LiabilityType,
        difference: Amount,
        change_set: &[PairedLedgerRecord<'a>],
    ) -> Vec<(String, Detection)> {
        if difference <= 0 {
            return Vec::new();
        }

        let mut seen = HashSet::new();
        let returns: Vec<PairedLedgerRecord<'a>> = change_set
            .iter()
            .filter_map(|record| self.lineage(*record))
            .filter(|ret| seen.insert(ret.record.sr_no()))
            .collect();

        let context = DetectionContext {
            tax_type: self.request.tax_type,
            liability,
            difference,
            closing_balances: &self.ledger.closing_balances,
        };
        let detections = join_all(
            returns
                .iter()
                .map(|ret| detect_system_errors(*ret, context, self.receipts)),
        )
        .await;

        returns
            .iter()
            .map(|ret| ret.sr_no().to_string())
            .zip(detections)
            .collect()
    }

    fn payment_of_type(&self, record: PairedLedgerRecord<'a>) -> Option<NarrationType> {
        record
            .relations
            .payment_of
            .as_deref()
            .and_then(|sr_no| self.ledger.paired.get(sr_no))
            .and_then(|target| target.narration_type())
    }

    /// Picks the records each change is reported as. A return with a detected system
    /// error stands in for the payments against it.
    fn select_evidence(
        &self,
        change_set: &[PairedLedgerRecord<'a>],
        detections: &HashMap<String, Detection>,
    ) -> Vec<ChangeReason> {
        let mut evidence = Vec::new();

        for record in change_set {
            let flagged = self.lineage(*record).and_then(|ret| {
                detections
                    .get(ret.sr_no())
                    .filter(|detection| !detection.system_errors.is_empty())
                    .map(|detection| (ret, detection))
            });

            let Some((ret, detection)) = flagged else {
                evidence.push(ChangeReasonDetails::from_record(
                    record,
                    self.payment_of_type(*record),
                    Vec::new(),
                ));
                continue;
            };

            evidence.push(ChangeReasonDetails::from_record(
                &ret,
                None,
                detection.system_errors.clone(),
            ));
            if detection.has(SystemError::UnallocatedAdvancePayment) {
                for sr_no in &ret.relations.advance_payments {
                    if let Some(advance) = self.ledger.paired.get(sr_no) {
                        evidence.push(ChangeReasonDetails::from_record(
                            &advance,
                            ret.narration_type(),
                            Vec::new(),
                        ));
                    }
                }
            }
        }

        // Backdated originals can produce the same evidence twice.
        let mut seen = HashSet::new();
        evidence
            .into_iter()
            .filter(|details| seen.insert(details.clone()))
            .map(ChangeReason::Details)
            .collect()
    }
}

pub async fn explain_liability_change<R: ReceiptLookup>(
    request: &ReconciliationRequest,
    ledger: &PreparedLedger,
    receipts: &R,
    liability: LiabilityType,
) -> Result<LiabilityOutcome> {
    ChangeAttributor::new(request, ledger, receipts)
        .explain(liability)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{generate_totals, TaxType, TotalColumn};
    use crate::system_errors::NoReceiptLookup;
    use chrono::NaiveDate;
    use futures::executor::block_on;

    fn row(sr_no: &str, date: &str, narration: &str, debit: &str, credit: &str) -> RawLedgerRow {
        RawLedgerRow {
            sr_no: sr_no.to_string(),
            transaction_date: date.to_string(),
            from_date: "01/01/2013".to_string(),
            to_date: "31/12/2013".to_string(),
            narration: narration.to_string(),
            debit: debit.to_string(),
            credit: credit.to_string(),
            cumulative_balance: String::new(),
        }
    }

    fn request(liability: TotalColumn, previous: &str, current: &str) -> ReconciliationRequest {
        let mut request = ReconciliationRequest {
            tax_type: TaxType::Itx,
            previous_date: NaiveDate::from_ymd_opt(2014, 2, 5).unwrap(),
            current_date: NaiveDate::from_ymd_opt(2014, 2, 12).unwrap(),
            previous_totals: generate_totals(&TotalColumn::ALL, "0.00"),
            current_totals: generate_totals(&TotalColumn::ALL, "0.00"),
        };
        request.previous_totals.insert(liability, previous.to_string());
        request.current_totals.insert(liability, current.to_string());
        request
    }

    fn explain(
        request: &ReconciliationRequest,
        rows: &[RawLedgerRow],
        liability: LiabilityType,
    ) -> LiabilityOutcome {
        let ledger = prepare_ledger(rows);
        block_on(explain_liability_change(
            request,
            &ledger,
            &NoReceiptLookup,
            liability,
        ))
        .unwrap()
    }

    fn kinds(outcome: &LiabilityOutcome) -> Vec<DiagnosticKind> {
        outcome.diagnostics.iter().map(|d| d.kind).collect()
    }

    #[test]
    fn test_no_change() {
        let outcome = explain(
            &request(TotalColumn::Principal, "0.00", "0.00"),
            &[row("1", "10/02/2014", "original return", "100.00", "")],
            LiabilityType::Principal,
        );
        assert_eq!(outcome.rendered, "NC");
        assert_eq!(outcome.reasons, vec![ChangeReason::NoChange]);
        assert!(outcome.diagnostics.is_empty());
    }

    #[test]
    fn test_single_exact_match_is_used_alone() {
        let rows = [
            row("1", "06/02/2014", "late payment penalty", "50.00", ""),
            row("2", "07/02/2014", "late payment penalty", "30.00", ""),
        ];
        let outcome = explain(
            &request(TotalColumn::Penalty, "100.00", "150.00"),
            &rows,
            LiabilityType::Penalty,
        );
        assert_eq!(outcome.change.difference, 5_000);
        assert_eq!(outcome.rendered, "2013 Late payment penalty\non 06/02/14");
        assert!(outcome.diagnostics.is_empty());
    }

    #[test]
    fn test_ambiguous_match_falls_back_to_all_candidates() {
        let rows = [
            row("1", "06/02/2014", "late payment interest", "50.00", ""),
            row("2", "08/02/2014", "late payment interest", "50.00", ""),
        ];
        let outcome = explain(
            &request(TotalColumn::Interest, "0.00", "50.00"),
            &rows,
            LiabilityType::Interest,
        );
        assert_eq!(outcome.reasons.len(), 2);
        assert_eq!(
            kinds(&outcome),
            vec![DiagnosticKind::AmbiguousExactMatch, DiagnosticKind::ChangeSumMismatch]
        );
        assert_eq!(outcome.diagnostics[0].sr_nos, vec!["1", "2"]);
    }

    #[test]
    fn test_window_and_liability_filtering() {
        let rows = [
            row("1", "01/02/2014", "late payment penalty", "70.00", ""),
            row("2", "13/02/2014", "late payment penalty", "70.00", ""),
            row("3", "06/02/2014", "late payment interest", "70.00", ""),
            row("4", "12/02/2014", "late payment penalty", "20.00", ""),
        ];
        let outcome = explain(
            &request(TotalColumn::Penalty, "0.00", "20.00"),
            &rows,
            LiabilityType::Penalty,
        );
        assert_eq!(outcome.rendered, "2013 Late payment penalty\non 12/02/14");
    }

    #[test]
    fn test_sum_mismatch_names_boundary_records() {
        let rows = [
            row("1", "05/02/2014", "late payment penalty", "10.00", ""),
            row("2", "08/02/2014", "late payment penalty", "15.00", ""),
        ];
        let outcome = explain(
            &request(TotalColumn::Penalty, "0.00", "15.50"),
            &rows,
            LiabilityType::Penalty,
        );
        assert_eq!(kinds(&outcome), vec![DiagnosticKind::ChangeSumMismatch]);
        assert_eq!(outcome.diagnostics[0].sr_nos, vec!["1"]);
    }

    #[test]
    fn test_no_records_found() {
        let outcome = explain(
            &request(TotalColumn::Interest, "0.00", "10.00"),
            &[row("1", "06/02/2014", "original return", "10.00", "")],
            LiabilityType::Interest,
        );
        assert_eq!(kinds(&outcome), vec![DiagnosticKind::NoChangeRecords]);
        assert!(outcome.reasons.is_empty());
    }

    #[test]
    fn test_payment_renders_what_it_paid() {
        let rows = [
            row("1", "01/01/2014", "late payment interest", "80.00", ""),
            row("2", "07/02/2014", "payment against interest prn 118000000002", "", "30.00"),
        ];
        let outcome = explain(
            &request(TotalColumn::Interest, "80.00", "50.00"),
            &rows,
            LiabilityType::Interest,
        );
        assert_eq!(
            outcome.rendered,
            "2013 Payment against Late payment interest\non 07/02/14\nPRN: 118000000002"
        );
    }

    #[test]
    fn test_rounded_up_return_replaces_payment() {
        let rows = [
            row("1", "15/01/2014", "original return", "1,000.40", ""),
            row(
                "2",
                "10/02/2014",
                "payment against principal liability prn 118000000002",
                "",
                "1,001.00",
            ),
        ];
        let outcome = explain(
            &request(TotalColumn::Principal, "0.00", "0.60"),
            &rows,
            LiabilityType::Principal,
        );
        assert_eq!(
            outcome.rendered,
            "2013 System error: Return\non 15/01/14\nRounded up payment does not match return liability, ledger incorrect"
        );
    }

    #[test]
    fn test_unallocated_advance_payment_evidence() {
        let rows = [
            row("1", "06/02/2014", "original return", "500.00", ""),
            row("2", "07/02/2014", "advance payment prn 118000000002", "", "500.00"),
            row("3", "31/12/2013", "closing balance", "0.00", ""),
        ];
        let outcome = explain(
            &request(TotalColumn::Principal, "0.00", "500.00"),
            &rows,
            LiabilityType::Principal,
        );
        assert_eq!(
            outcome.rendered,
            "2013 System error: Return\non 06/02/14\nAdvance payment not allocated to return, ledger incorrect\n2013 Advance payment\non 07/02/14\nPRN: 118000000002"
        );
        assert!(outcome.diagnostics.is_empty());
    }

    #[test]
    fn test_duplicate_evidence_is_collapsed() {
        let rows = [
            row("1", "06/02/2014", "late payment penalty", "25.00", ""),
            row("2", "06/02/2014", "late payment penalty", "25.00", ""),
        ];
        let outcome = explain(
            &request(TotalColumn::Penalty, "0.00", "50.00"),
            &rows,
            LiabilityType::Penalty,
        );
        assert_eq!(outcome.reasons.len(), 1);
        assert!(outcome.diagnostics.is_empty());
    }

    #[test]
    fn test_non_numeric_total_fails_the_liability() {
        let ledger = prepare_ledger(&[]);
        let request = request(TotalColumn::Interest, "abc", "0.00");
        let result = block_on(explain_liability_change(
            &request,
            &ledger,
            &NoReceiptLookup,
            LiabilityType::Interest,
        ));
        assert!(matches!(result, Err(ReconcileError::InvalidTotal { .. })));
    }

    #[test]
    fn test_out_of_range_change_fails_the_liability() {
        let ledger = prepare_ledger(&[]);
        let request = request(
            TotalColumn::Interest,
            "-90,000,000,000,000,000.00",
            "90,000,000,000,000,000.00",
        );
        let result = block_on(explain_liability_change(
            &request,
            &ledger,
            &NoReceiptLookup,
            LiabilityType::Interest,
        ));
        assert!(matches!(result, Err(ReconcileError::TotalOutOfRange { .. })));
    }

    #[test]
    fn test_out_of_range_change_set_sum_is_a_mismatch() {
        let rows = vec![
            row("1", "06/02/2014", "late payment penalty", "60,000,000,000,000,000.00", ""),
            row("2", "07/02/2014", "late return penalty", "60,000,000,000,000,000.00", ""),
        ];
        let outcome = explain(
            &request(TotalColumn::Penalty, "0.00", "10.00"),
            &rows,
            LiabilityType::Penalty,
        );
        assert_eq!(outcome.reasons.len(), 2);
        assert_eq!(outcome.diagnostics.len(), 1);
        assert_eq!(outcome.diagnostics[0].kind, DiagnosticKind::ChangeSumMismatch);
        assert!(outcome.diagnostics[0].message.contains("an out of range amount"));
    }

    #[test]
    fn test_prepare_ledger_keeps_only_invalid_validations() {
        let ledger = prepare_ledger(&[
            row("1", "06/02/2014", "original return", "100.00", ""),
            row("2", "06/02/2014", "mystery entry", "5.00", ""),
        ]);
        assert_eq!(ledger.invalid_records.len(), 1);
        assert_eq!(ledger.invalid_records[0].sr_no, "2");
        assert_eq!(ledger.paired.len(), 2);
    }
}
