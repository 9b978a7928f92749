use crate::error::{ReconcileError, Result};
use crate::reasons::ChangeReason;
use crate::utils::{parse_total, Amount};
use crate::validation::RecordValidation;
use chrono::NaiveDate;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// One row of the ledger exactly as scraped from the portal.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RawLedgerRow {
    #[schemars(description = "Serial number of the row, unique within one ledger")]
    pub sr_no: String,
    #[schemars(description = "Date the transaction was posted, DD/MM/YYYY")]
    pub transaction_date: String,
    #[schemars(description = "Start of the accounting period the row belongs to, DD/MM/YYYY")]
    pub from_date: String,
    #[schemars(description = "End of the accounting period the row belongs to, DD/MM/YYYY")]
    pub to_date: String,
    pub narration: String,
    pub debit: String,
    pub credit: String,
    #[serde(default)]
    pub cumulative_balance: String,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "UPPERCASE")]
pub enum TaxType {
    #[schemars(description = "Income tax")]
    Itx,
    #[schemars(description = "Value added tax")]
    Vat,
    #[schemars(description = "Pay as you earn")]
    Paye,
    #[schemars(description = "Turnover tax")]
    Tot,
    #[schemars(description = "Withholding tax")]
    Wht,
    #[schemars(description = "Property transfer tax")]
    Ptt,
    #[schemars(description = "Mineral royalty")]
    Minroy,
    #[schemars(description = "Tourism levy")]
    Tlevy,
}

impl TaxType {
    pub const ALL: [TaxType; 8] = [
        TaxType::Itx,
        TaxType::Vat,
        TaxType::Paye,
        TaxType::Tot,
        TaxType::Wht,
        TaxType::Ptt,
        TaxType::Minroy,
        TaxType::Tlevy,
    ];

    /// Numeric id the portal uses for the tax type.
    pub fn id(self) -> u8 {
        match self {
            TaxType::Itx => 1,
            TaxType::Vat => 2,
            TaxType::Paye => 3,
            TaxType::Tot => 4,
            TaxType::Wht => 5,
            TaxType::Ptt => 6,
            TaxType::Minroy => 7,
            TaxType::Tlevy => 8,
        }
    }

    pub fn code(self) -> &'static str {
        match self {
            TaxType::Itx => "ITX",
            TaxType::Vat => "VAT",
            TaxType::Paye => "PAYE",
            TaxType::Tot => "TOT",
            TaxType::Wht => "WHT",
            TaxType::Ptt => "PTT",
            TaxType::Minroy => "MINROY",
            TaxType::Tlevy => "TLEVY",
        }
    }

    pub fn from_code(code: &str) -> Option<TaxType> {
        let code = code.trim();
        TaxType::ALL
            .into_iter()
            .find(|tax_type| tax_type.code().eq_ignore_ascii_case(code))
    }
}

impl fmt::Display for TaxType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// The three components a pending liability is broken into.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "lowercase")]
pub enum LiabilityType {
    Principal,
    Interest,
    Penalty,
}

impl LiabilityType {
    pub const ALL: [LiabilityType; 3] = [
        LiabilityType::Principal,
        LiabilityType::Interest,
        LiabilityType::Penalty,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            LiabilityType::Principal => "principal",
            LiabilityType::Interest => "interest",
            LiabilityType::Penalty => "penalty",
        }
    }
}

impl fmt::Display for LiabilityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "lowercase")]
pub enum TotalColumn {
    Principal,
    Interest,
    Penalty,
    Total,
}

impl TotalColumn {
    pub const ALL: [TotalColumn; 4] = [
        TotalColumn::Principal,
        TotalColumn::Interest,
        TotalColumn::Penalty,
        TotalColumn::Total,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            TotalColumn::Principal => "principal",
            TotalColumn::Interest => "interest",
            TotalColumn::Penalty => "penalty",
            TotalColumn::Total => "total",
        }
    }
}

impl From<LiabilityType> for TotalColumn {
    fn from(liability: LiabilityType) -> Self {
        match liability {
            LiabilityType::Principal => TotalColumn::Principal,
            LiabilityType::Interest => TotalColumn::Interest,
            LiabilityType::Penalty => TotalColumn::Penalty,
        }
    }
}

/// Pending liability totals for one tax type, as decimal strings.
pub type Totals = BTreeMap<TotalColumn, String>;

/// Builds a totals map containing exactly `columns`, each set to `value`.
pub fn generate_totals(columns: &[TotalColumn], value: &str) -> Totals {
    columns
        .iter()
        .map(|column| (*column, value.to_string()))
        .collect()
}

pub const DEFAULT_TOTAL: &str = "0.00";

/// Inputs for reconciling one tax type between two snapshot dates.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ReconciliationRequest {
    pub tax_type: TaxType,

    #[schemars(description = "Date of the earlier pending liability snapshot (start of the window)")]
    pub previous_date: NaiveDate,

    #[schemars(description = "Date of the later pending liability snapshot (end of the window)")]
    pub current_date: NaiveDate,

    #[serde(default)]
    #[schemars(description = "Totals at the previous date. Missing columns are read as 0.00")]
    pub previous_totals: Totals,

    #[serde(default)]
    #[schemars(description = "Totals at the current date. Missing columns are read as 0.00")]
    pub current_totals: Totals,
}

impl ReconciliationRequest {
    pub fn from_json(json: &str) -> Result<Self> {
        let request: ReconciliationRequest = serde_json::from_str(json)?;
        request.validate()?;
        Ok(request)
    }

    pub fn validate(&self) -> Result<()> {
        if self.current_date < self.previous_date {
            return Err(ReconcileError::InvalidWindow {
                previous: self.previous_date.to_string(),
                current: self.current_date.to_string(),
            });
        }
        Ok(())
    }

    pub fn previous_total(&self, liability: LiabilityType) -> Result<Amount> {
        read_total(&self.previous_totals, liability)
    }

    pub fn current_total(&self, liability: LiabilityType) -> Result<Amount> {
        read_total(&self.current_totals, liability)
    }
}

fn read_total(totals: &Totals, liability: LiabilityType) -> Result<Amount> {
    let column = TotalColumn::from(liability);
    let value = totals
        .get(&column)
        .map(String::as_str)
        .unwrap_or(DEFAULT_TOTAL);
    parse_total(column.as_str(), value)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticKind {
    MissingClosingBalance,
    AmbiguousExactMatch,
    ChangeSumMismatch,
    NoChangeRecords,
    ReceiptNotFound,
    AmbiguousReceipt,
    ReceiptLookupFailed,
    LiabilityFailed,
}

/// A non-fatal problem found while explaining a change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct StructuredDiagnostic {
    pub kind: DiagnosticKind,
    pub liability: Option<LiabilityType>,
    pub message: String,
    #[serde(default)]
    pub sr_nos: Vec<String>,
}

impl StructuredDiagnostic {
    pub fn new(
        kind: DiagnosticKind,
        liability: Option<LiabilityType>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            liability,
            message: message.into(),
            sr_nos: Vec::new(),
        }
    }

    pub fn with_records<I, S>(mut self, sr_nos: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.sr_nos = sr_nos.into_iter().map(Into::into).collect();
        self
    }
}

impl fmt::Display for StructuredDiagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(liability) = self.liability {
            write!(f, "[{}] ", liability)?;
        }
        f.write_str(&self.message)?;
        if !self.sr_nos.is_empty() {
            write!(f, " (records: {})", self.sr_nos.join(", "))?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct LiabilityChange {
    pub previous: Amount,
    pub current: Amount,
    pub difference: Amount,
}

/// Everything produced by one reconciliation run.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ReconciliationReport {
    pub tax_type: TaxType,

    #[schemars(
        description = "Newline separated change reasons per liability type, or NC when the total did not change. Liability types whose computation failed are absent."
    )]
    pub change_reasons: BTreeMap<LiabilityType, String>,

    #[serde(default)]
    pub reason_details: BTreeMap<LiabilityType, Vec<ChangeReason>>,

    #[serde(default)]
    pub changes: BTreeMap<LiabilityType, LiabilityChange>,

    #[serde(default)]
    pub processing_errors: Vec<StructuredDiagnostic>,

    #[schemars(description = "Records that failed validation")]
    #[serde(default)]
    pub invalid_records: Vec<RecordValidation>,

    pub any_errors: bool,
}

impl ReconciliationReport {
    pub fn reason(&self, liability: LiabilityType) -> Option<&str> {
        self.change_reasons.get(&liability).map(String::as_str)
    }

    pub fn generate_json_schema() -> schemars::schema::RootSchema {
        schemars::schema_for!(ReconciliationReport)
    }

    pub fn schema_as_json() -> std::result::Result<String, serde_json::Error> {
        let schema = Self::generate_json_schema();
        serde_json::to_string_pretty(&schema)
    }
}
