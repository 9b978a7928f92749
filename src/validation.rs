use crate::ingestion::ParsedLedgerRecord;
use crate::narration::{against, fields, NarrationType, ParsedNarration, ValueColumn};
use crate::utils::LEDGER_DATE_FORMAT;
use chrono::NaiveDate;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy)]
pub enum FieldRule {
    Numeric,
    Length(usize),
    DateFormat(&'static str),
    OneOf(&'static [&'static str]),
}

impl FieldRule {
    fn check(&self, value: &str) -> Result<(), String> {
        match self {
            FieldRule::Numeric => {
                if !value.is_empty() && value.chars().all(|c| c.is_ascii_digit()) {
                    Ok(())
                } else {
                    Err(format!("'{}' is not numeric", value))
                }
            }
            FieldRule::Length(len) => {
                if value.chars().count() == *len {
                    Ok(())
                } else {
                    Err(format!("'{}' is not {} characters long", value, len))
                }
            }
            FieldRule::DateFormat(format) => NaiveDate::parse_from_str(value, format)
                .map(|_| ())
                .map_err(|_| format!("'{}' is not a date in the format {}", value, format)),
            FieldRule::OneOf(allowed) => {
                if allowed.contains(&value) {
                    Ok(())
                } else {
                    Err(format!("'{}' is not one of [{}]", value, allowed.join(", ")))
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FieldSchema {
    pub name: &'static str,
    pub required: bool,
    pub rules: &'static [FieldRule],
}

const fn required(name: &'static str, rules: &'static [FieldRule]) -> FieldSchema {
    FieldSchema {
        name,
        required: true,
        rules,
    }
}

const fn optional(name: &'static str, rules: &'static [FieldRule]) -> FieldSchema {
    FieldSchema {
        name,
        required: false,
        rules,
    }
}

const MONTHS: &[&str] = &[
    "january", "february", "march", "april", "may", "june", "july", "august", "september",
    "october", "november", "december", "jan", "feb", "mar", "apr", "jun", "jul", "aug", "sep",
    "sept", "oct", "nov", "dec",
];
const QUARTERS: &[&str] = &["1", "2", "3", "4"];
const TAX_TYPE_CODES: &[&str] = &["itx", "vat", "paye", "tot", "wht", "ptt", "minroy", "tlevy"];
const PRN_LENGTH: usize = 12;

const PRN_RULES: &[FieldRule] = &[FieldRule::Numeric, FieldRule::Length(PRN_LENGTH)];
const QUARTER_RULES: &[FieldRule] = &[FieldRule::OneOf(QUARTERS)];
const MONTH_RULES: &[FieldRule] = &[FieldRule::OneOf(MONTHS)];

const NO_FIELDS: &[FieldSchema] = &[];
const PROVISIONAL_RETURN_SCHEMA: &[FieldSchema] = &[
    required(fields::FROM_MONTH, MONTH_RULES),
    required(fields::TO_MONTH, MONTH_RULES),
    required(fields::QUARTER, QUARTER_RULES),
];
const PAYMENT_SCHEMA: &[FieldSchema] = &[
    required(fields::AGAINST, &[FieldRule::OneOf(&against::ALL)]),
    required(fields::PRN, PRN_RULES),
    optional(fields::QUARTER, QUARTER_RULES),
];
const ADVANCE_PAYMENT_SCHEMA: &[FieldSchema] = &[required(fields::PRN, PRN_RULES)];
const ASSESSMENT_SCHEMA: &[FieldSchema] =
    &[required(fields::ASSESSMENT_NUMBER, &[FieldRule::Numeric])];
const REFUND_OFFSET_SCHEMA: &[FieldSchema] =
    &[required(fields::TAX_TYPE, &[FieldRule::OneOf(TAX_TYPE_CODES)])];
const REFUND_PAID_SCHEMA: &[FieldSchema] = &[optional(
    fields::VOUCHER_DATE,
    &[FieldRule::DateFormat(LEDGER_DATE_FORMAT)],
)];
const WITHHOLDING_TAX_CREDIT_SCHEMA: &[FieldSchema] =
    &[optional(fields::CERTIFICATE_NUMBER, &[FieldRule::Numeric])];

/// Field rules for the metadata each narration variant may carry.
pub fn field_schemas(narration_type: NarrationType) -> &'static [FieldSchema] {
    use NarrationType::*;
    match narration_type {
        ProvisionalReturn => PROVISIONAL_RETURN_SCHEMA,
        Payment => PAYMENT_SCHEMA,
        AdvancePayment => ADVANCE_PAYMENT_SCHEMA,
        Assessment | AssessmentInterest | AssessmentManualPenalty | AssessmentRevised
        | ObjectionAllowed | ObjectionPartiallyAllowed => ASSESSMENT_SCHEMA,
        RefundOffset => REFUND_OFFSET_SCHEMA,
        RefundPaid => REFUND_PAID_SCHEMA,
        WithholdingTaxCredit => WITHHOLDING_TAX_CREDIT_SCHEMA,
        OriginalReturn | AmendedReturn | LatePaymentPenalty | LateReturnPenalty
        | UnderEstimationPenalty | PenaltyWaiver | LatePaymentInterest | InterestWaiver
        | MigratedPrincipal | MigratedInterest | MigratedPenalty | ClosingBalance => NO_FIELDS,
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct NarrationValidation {
    pub valid: bool,
    pub errors: Vec<String>,
}

pub fn validate_narration(narration: &ParsedNarration) -> NarrationValidation {
    let Some(narration_type) = narration.narration_type else {
        return NarrationValidation {
            valid: false,
            errors: vec!["Narration does not match any known template".to_string()],
        };
    };

    let schemas = field_schemas(narration_type);
    let mut errors = Vec::new();

    for schema in schemas {
        match narration.meta(schema.name) {
            Some(value) => {
                for rule in schema.rules {
                    if let Err(e) = rule.check(value) {
                        errors.push(format!("Field '{}': {}", schema.name, e));
                    }
                }
            }
            None if schema.required => {
                errors.push(format!("Missing required field '{}'", schema.name));
            }
            None => {}
        }
    }

    for key in narration.meta.keys() {
        if !schemas.iter().any(|schema| schema.name == key) {
            errors.push(format!("Unexpected field '{}'", key));
        }
    }

    NarrationValidation {
        valid: errors.is_empty(),
        errors,
    }
}

/// Data quality verdict for a single ledger record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct RecordValidation {
    pub sr_no: String,
    pub valid: bool,
    pub multiple_value_columns: bool,
    pub invalid_value_column: bool,
    pub expected_value_column: ValueColumn,
    pub narration_validation: NarrationValidation,
    #[serde(default)]
    pub unparseable_columns: Vec<ValueColumn>,
    #[serde(default)]
    pub invalid_dates: Vec<String>,
}

/// Column a record should carry its value in, taking reversals into account.
pub fn expected_value_column(narration: &ParsedNarration) -> ValueColumn {
    let column = narration
        .narration_type
        .map(NarrationType::value_column)
        .unwrap_or(ValueColumn::Any);
    if narration.reversal {
        column.flipped()
    } else {
        column
    }
}

pub fn validate_record(record: &ParsedLedgerRecord) -> RecordValidation {
    let narration_validation = validate_narration(&record.narration);
    let expected = expected_value_column(&record.narration);

    let multiple_value_columns = record.debit != 0 && record.credit != 0;
    let invalid_value_column = match expected {
        ValueColumn::Debit => record.credit != 0,
        ValueColumn::Credit => record.debit != 0,
        ValueColumn::Any => false,
    };

    let valid = narration_validation.valid
        && !multiple_value_columns
        && !invalid_value_column
        && record.issues.is_empty();

    RecordValidation {
        sr_no: record.sr_no().to_string(),
        valid,
        multiple_value_columns,
        invalid_value_column,
        expected_value_column: expected,
        narration_validation,
        unparseable_columns: record.issues.unparseable_columns.clone(),
        invalid_dates: record.issues.invalid_dates.clone(),
    }
}

pub fn validate_records(records: &[ParsedLedgerRecord]) -> Vec<RecordValidation> {
    records.iter().map(validate_record).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingestion::normalize_row;
    use crate::narration::parse_narration;
    use crate::schema::RawLedgerRow;

    fn row(narration: &str, debit: &str, credit: &str) -> RawLedgerRow {
        RawLedgerRow {
            sr_no: "1".to_string(),
            transaction_date: "12/02/2013".to_string(),
            from_date: "01/01/2013".to_string(),
            to_date: "31/12/2013".to_string(),
            narration: narration.to_string(),
            debit: debit.to_string(),
            credit: credit.to_string(),
            cumulative_balance: String::new(),
        }
    }

    #[test]
    fn test_valid_payment_narration() {
        let parsed = parse_narration("payment against interest prn 118000123456");
        let result = validate_narration(&parsed);
        assert!(result.valid, "{:?}", result.errors);
    }

    #[test]
    fn test_payment_prn_rules() {
        let parsed = parse_narration("payment against interest prn 12ab");
        let result = validate_narration(&parsed);
        assert!(!result.valid);
        assert_eq!(result.errors.len(), 2, "{:?}", result.errors);
        assert!(result.errors.iter().any(|e| e.contains("not numeric")));
        assert!(result.errors.iter().any(|e| e.contains("12 characters")));
    }

    #[test]
    fn test_payment_against_must_be_known() {
        let parsed = parse_narration("payment against parking fines prn 118000123456");
        let result = validate_narration(&parsed);
        assert!(!result.valid);
        assert!(result.errors[0].contains("against"));
    }

    #[test]
    fn test_missing_required_field() {
        let parsed = parse_narration("advance payment");
        let result = validate_narration(&parsed);
        assert_eq!(result.errors, vec!["Missing required field 'prn'".to_string()]);
    }

    #[test]
    fn test_unexpected_field() {
        let mut parsed = parse_narration("late payment penalty");
        parsed.meta.insert("prn".to_string(), "118000123456".to_string());
        let result = validate_narration(&parsed);
        assert_eq!(result.errors, vec!["Unexpected field 'prn'".to_string()]);
    }

    #[test]
    fn test_date_format_rule() {
        assert!(validate_narration(&parse_narration("refund paid voucher dated 12/02/2013")).valid);
        let parsed = parse_narration("refund paid voucher dated 2013-02-12");
        assert!(!validate_narration(&parsed).valid);
        assert!(validate_narration(&parse_narration("refund paid")).valid);
    }

    #[test]
    fn test_unknown_type_single_error() {
        let result = validate_narration(&parse_narration("mystery entry"));
        assert!(!result.valid);
        assert_eq!(result.errors.len(), 1);
    }

    #[test]
    fn test_record_value_columns() {
        let ok = validate_record(&normalize_row(&row("original return", "1,000.00", "")));
        assert!(ok.valid);
        assert_eq!(ok.expected_value_column, ValueColumn::Debit);

        let wrong = validate_record(&normalize_row(&row("original return", "", "1,000.00")));
        assert!(!wrong.valid);
        assert!(wrong.invalid_value_column);

        let reversed = validate_record(&normalize_row(&row(
            "reversal of original return",
            "",
            "1,000.00",
        )));
        assert!(reversed.valid);
        assert_eq!(reversed.expected_value_column, ValueColumn::Credit);

        let both = validate_record(&normalize_row(&row("amended return", "10.00", "5.00")));
        assert!(both.multiple_value_columns);
        assert!(!both.invalid_value_column);
        assert!(!both.valid);
    }

    #[test]
    fn test_record_with_unparseable_amount() {
        let result = validate_record(&normalize_row(&row("late payment penalty", "abc", "")));
        assert!(!result.valid);
        assert_eq!(result.unparseable_columns, vec![ValueColumn::Debit]);
    }
}
