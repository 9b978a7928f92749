//! Human readable change reasons.
//!
//! Evidence is captured as [`ChangeReasonDetails`] first and rendered separately, so
//! callers can keep the structured form alongside the display string.

use crate::ingestion::ParsedLedgerRecord;
use crate::narration::{fields, NarrationGroup, NarrationType, ParsedNarration};
use crate::schema::TaxType;
use crate::system_errors::SystemError;
use crate::utils::{format_short_date, is_calendar_year};
use chrono::{Datelike, NaiveDate};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub const NO_CHANGE: &str = "NC";

/// Evidence for one line of a change reason.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub struct ChangeReasonDetails {
    pub narration: ParsedNarration,
    pub transaction_date: Option<NaiveDate>,
    pub from_date: Option<NaiveDate>,
    pub to_date: Option<NaiveDate>,
    pub prn: Option<String>,
    pub assessment_number: Option<String>,
    pub quarter: Option<String>,
    #[serde(default)]
    pub system_errors: Vec<SystemError>,
    #[schemars(description = "Narration type of the record a payment settled")]
    pub payment_of: Option<NarrationType>,
}

impl ChangeReasonDetails {
    pub fn from_record(
        record: &ParsedLedgerRecord,
        payment_of: Option<NarrationType>,
        system_errors: Vec<SystemError>,
    ) -> Self {
        let meta = |key: &str| record.narration.meta(key).map(str::to_string);
        Self {
            narration: record.narration.clone(),
            transaction_date: record.transaction_date,
            from_date: record.from_date,
            to_date: record.to_date,
            prn: meta(fields::PRN),
            assessment_number: meta(fields::ASSESSMENT_NUMBER),
            quarter: meta(fields::QUARTER),
            system_errors,
            payment_of,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChangeReason {
    /// The liability total did not move.
    NoChange,
    Details(ChangeReasonDetails),
}

fn month_year(date: NaiveDate) -> String {
    date.format("%m/%Y").to_string()
}

/// Income tax returns are labelled by charge year; other periods by calendar year, month
/// or range.
fn period_label(details: &ChangeReasonDetails, tax_type: TaxType) -> String {
    let charge_year =
        tax_type == TaxType::Itx && details.narration.group() == Some(NarrationGroup::Returns);

    match (details.from_date, details.to_date) {
        (Some(from), Some(to)) => {
            if charge_year || is_calendar_year(from, to) {
                to.year().to_string()
            } else if from.year() == to.year() && from.month() == to.month() {
                month_year(from)
            } else {
                format!("{} - {}", month_year(from), month_year(to))
            }
        }
        (Some(date), None) | (None, Some(date)) => month_year(date),
        (None, None) => String::new(),
    }
}

fn with_quarter(label: &str, quarter: Option<&str>) -> String {
    match quarter {
        Some(quarter) => format!("{} Q{}", label, quarter),
        None => label.to_string(),
    }
}

fn describe(details: &ChangeReasonDetails) -> (String, Vec<String>) {
    let narration = &details.narration;
    let mut extra = Vec::new();

    let Some(narration_type) = narration.narration_type else {
        return ("Unrecognised ledger entry".to_string(), extra);
    };

    let body = match narration_type {
        NarrationType::ProvisionalReturn => {
            with_quarter(narration_type.label(), details.quarter.as_deref())
        }
        NarrationType::Payment => {
            let target = details
                .payment_of
                .map(|paid| paid.label().to_string())
                .or_else(|| narration.meta(fields::AGAINST).map(str::to_string))
                .unwrap_or_else(|| "liability".to_string());
            if let Some(prn) = &details.prn {
                extra.push(format!("PRN: {}", prn));
            }
            format!(
                "Payment against {}",
                with_quarter(&target, details.quarter.as_deref())
            )
        }
        NarrationType::AdvancePayment => {
            if let Some(prn) = &details.prn {
                extra.push(format!("PRN: {}", prn));
            }
            narration_type.label().to_string()
        }
        NarrationType::RefundOffset => match narration.meta(fields::TAX_TYPE) {
            Some(code) => format!("{} from {}", narration_type.label(), code.to_uppercase()),
            None => narration_type.label().to_string(),
        },
        NarrationType::WithholdingTaxCredit => {
            if let Some(certificate) = narration.meta(fields::CERTIFICATE_NUMBER) {
                extra.push(format!("Certificate no.: {}", certificate));
            }
            narration_type.label().to_string()
        }
        other if other.group() == NarrationGroup::Assessments => {
            if let Some(number) = &details.assessment_number {
                extra.push(format!("Assessment no.: {}", number));
            }
            other.label().to_string()
        }
        other => other.label().to_string(),
    };

    (body, extra)
}

fn system_error_note(error: SystemError) -> &'static str {
    match error {
        SystemError::ReturnRoundedUp => {
            "Rounded up payment does not match return liability, ledger incorrect"
        }
        SystemError::UnallocatedAdvancePayment => {
            "Advance payment not allocated to return, ledger incorrect"
        }
    }
}

/// Renders a change reason. [`ChangeReason::NoChange`] renders as `"NC"`.
pub fn render_reason(tax_type: TaxType, reason: &ChangeReason) -> String {
    let details = match reason {
        ChangeReason::NoChange => return NO_CHANGE.to_string(),
        ChangeReason::Details(details) => details,
    };

    let (mut body, extra) = describe(details);
    if details.narration.reversal {
        body = format!("Reversal of {}", body);
    }
    if !details.system_errors.is_empty() {
        body = format!("System error: {}", body);
    }

    let period = period_label(details, tax_type);
    let mut lines = vec![if period.is_empty() {
        body
    } else {
        format!("{} {}", period, body)
    }];

    if let Some(date) = details.transaction_date {
        lines.push(format!("on {}", format_short_date(date)));
    }
    lines.extend(extra);
    lines.extend(
        details
            .system_errors
            .iter()
            .map(|error| system_error_note(*error).to_string()),
    );

    lines.join("\n")
}

/// Renders every reason and joins them one per line.
pub fn render_reasons(tax_type: TaxType, reasons: &[ChangeReason]) -> String {
    reasons
        .iter()
        .map(|reason| render_reason(tax_type, reason))
        .collect::<Vec<_>>()
        .join("\n")
}
