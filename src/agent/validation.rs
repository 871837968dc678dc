//! Numeric hallucination checks: every number the answer states should appear
//! (within tolerance) in the query result it was generated from.

use regex::Regex;
use serde::Serialize;
use std::sync::LazyLock;

use crate::db::executor::QueryResult;

/// Absolute slack used when the result value is zero.
const ZERO_EPSILON: f64 = 0.01;

static NUMBER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$?(\d{1,3}(?:,\d{3})+(?:\.\d+)?|\d+(?:\.\d+)?)(\s?%)?").expect("number regex")
});

static STREET_ADDRESS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"\b\d+\s+(?:[NSEW]\.?\s+)?(?:[A-Z][A-Za-z'-]*\s+){0,4}(?:St|Street|Rd|Road|Ave|Avenue|Blvd|Boulevard|Dr|Drive|Ln|Lane|Way|Ct|Court|Pl|Place|Pkwy|Parkway|Hwy|Highway|Ter|Terrace|Cir|Circle)\b",
    )
    .expect("address regex")
});

/// A number found in free text.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NumericClaim {
    pub value: f64,
    pub percent: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationReport {
    pub is_valid: bool,
    pub warning: Option<String>,
    pub confidence: f64,
    pub mismatched: Vec<f64>,
}

#[derive(Debug, Clone, Copy)]
pub struct AnswerValidator {
    pub tolerance: f64,
    pub valid_threshold: f64,
    pub low_confidence_threshold: f64,
}

impl Default for AnswerValidator {
    fn default() -> Self {
        Self {
            tolerance: 0.02,
            valid_threshold: 0.5,
            low_confidence_threshold: 0.25,
        }
    }
}

impl AnswerValidator {
    pub fn new(tolerance: f64, valid_threshold: f64, low_confidence_threshold: f64) -> Self {
        Self {
            tolerance,
            valid_threshold,
            low_confidence_threshold,
        }
    }

    /// Numeric claims in `text`, in order of appearance.
    pub fn extract_claims(text: &str) -> Vec<NumericClaim> {
        let addresses: Vec<_> = STREET_ADDRESS.find_iter(text).map(|m| m.range()).collect();
        let bytes = text.as_bytes();

        NUMBER
            .captures_iter(text)
            .filter_map(|caps| {
                let whole = caps.get(0)?;
                let digits = caps.get(1)?;

                if addresses.iter().any(|r| r.contains(&digits.start())) {
                    return None;
                }
                // Glued to a word on either side: LLC2, 3rd, Q4
                let before = whole.start().checked_sub(1).map(|i| bytes[i]);
                let after = bytes.get(digits.end()).copied();
                if before.is_some_and(|b| b.is_ascii_alphabetic() || b == b'_')
                    || after.is_some_and(|b| b.is_ascii_alphabetic() || b == b'_')
                {
                    return None;
                }

                let value = digits.as_str().replace(',', "").parse::<f64>().ok()?;
                Some(NumericClaim {
                    value,
                    percent: caps.get(2).is_some(),
                })
            })
            .collect()
    }

    /// Plain numeric values stated in `text`.
    pub fn extract_numbers(text: &str) -> Vec<f64> {
        Self::extract_claims(text).into_iter().map(|c| c.value).collect()
    }

    /// Whether a stated number agrees with a result value.
    pub fn numbers_match(claim: f64, actual: f64, tolerance: f64) -> bool {
        let (claim, actual) = (claim.abs(), actual.abs());
        if actual == 0.0 || claim == 0.0 {
            return (claim - actual).abs() <= ZERO_EPSILON;
        }
        (claim - actual).abs() / actual <= tolerance
    }

    fn claim_matches(&self, claim: &NumericClaim, actual: f64) -> bool {
        Self::numbers_match(claim.value, actual, self.tolerance)
            || (claim.percent && Self::numbers_match(claim.value, actual * 100.0, self.tolerance))
    }

    /// Cross-checks the numbers in `answer` against `result`.
    pub fn validate(&self, result: &QueryResult, answer: &str) -> ValidationReport {
        let claims = Self::extract_claims(answer);
        if claims.is_empty() {
            return ValidationReport {
                is_valid: true,
                warning: None,
                confidence: 1.0,
                mismatched: Vec::new(),
            };
        }

        let mut actual = result.numeric_values();
        actual.push(result.row_count() as f64);

        let mismatched: Vec<f64> = claims
            .iter()
            .filter(|claim| !actual.iter().any(|a| self.claim_matches(claim, *a)))
            .map(|claim| claim.value)
            .collect();

        let matched = claims.len() - mismatched.len();
        let confidence = matched as f64 / claims.len() as f64;
        let is_valid = confidence >= self.valid_threshold;

        let warning = if !is_valid || confidence < self.low_confidence_threshold {
            Some(Self::describe_mismatch(&mismatched, &result.numeric_values()))
        } else {
            None
        };

        ValidationReport {
            is_valid,
            warning,
            confidence,
            mismatched,
        }
    }

    fn describe_mismatch(mismatched: &[f64], actual: &[f64]) -> String {
        let claims: Vec<String> = mismatched.iter().map(|v| format_number(*v)).collect();
        let mut values: Vec<String> = Vec::new();
        for v in actual {
            let formatted = format_number(*v);
            if !values.contains(&formatted) {
                values.push(formatted);
            }
            if values.len() == 10 {
                break;
            }
        }
        let values = if values.is_empty() {
            "no numeric values".to_string()
        } else {
            values.join(", ")
        };
        format!(
            "The answer states {} which does not match the query result ({})",
            claims.join(", "),
            values
        )
    }

    /// Low, medium or high, by where the confidence falls against the thresholds.
    pub fn confidence_label(&self, confidence: f64) -> &'static str {
        if confidence < self.low_confidence_threshold {
            "LOW"
        } else if confidence < self.valid_threshold.max(0.75) {
            "MEDIUM"
        } else {
            "HIGH"
        }
    }

    /// Appends the warning, a confidence indicator and a raw-result preview when
    /// confidence is below the low threshold. The answer text itself is kept.
    pub fn annotate(&self, answer: &str, report: &ValidationReport, result: &QueryResult) -> String {
        if report.confidence >= self.low_confidence_threshold {
            return answer.to_string();
        }

        let mut annotated = answer.to_string();
        if let Some(warning) = &report.warning {
            annotated.push_str(&format!("\n\nWarning: {}", warning));
        }
        annotated.push_str(&format!(
            "\nConfidence: {:.0}% ({})",
            report.confidence * 100.0,
            self.confidence_label(report.confidence)
        ));
        annotated.push_str(&format!("\nRaw SQL Result: {}", result.preview(5)));
        annotated
    }
}

fn format_number(v: f64) -> String {
    if v.fract() == 0.0 && v.abs() < 1e15 {
        format!("{}", v as i64)
    } else {
        let s = format!("{:.4}", v);
        s.trim_end_matches('0').trim_end_matches('.').to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::executor::ScalarValue;

    fn single(value: ScalarValue) -> QueryResult {
        QueryResult::new(vec!["value".into()], vec![vec![value]])
    }

    #[test]
    fn extracts_plain_currency_and_separated_numbers() {
        assert_eq!(AnswerValidator::extract_numbers("You have 15 properties."), vec![15.0]);
        let numbers =
            AnswerValidator::extract_numbers("You have 15 properties with an average rent of $1,234.56.");
        assert_eq!(numbers, vec![15.0, 1234.56]);
        assert_eq!(AnswerValidator::extract_numbers("The value is 1,234,567.89"), vec![1234567.89]);
        assert!(AnswerValidator::extract_numbers("This is descriptive text only.").is_empty());
    }

    #[test]
    fn marks_percentages() {
        let claims = AnswerValidator::extract_claims("Occupancy is 85% overall");
        assert_eq!(claims, vec![NumericClaim { value: 85.0, percent: true }]);
    }

    #[test]
    fn ignores_identifiers_and_street_addresses() {
        assert_eq!(AnswerValidator::extract_numbers("LLC2 owns 12 properties"), vec![12.0]);
        assert!(AnswerValidator::extract_numbers("The top one is 5678 Eshelman Mill Rd").is_empty());
        assert_eq!(
            AnswerValidator::extract_numbers("1234 W Yucca St earns $3,500 a month"),
            vec![3500.0]
        );
        assert_eq!(AnswerValidator::extract_numbers("123 Main St and 4 units"), vec![4.0]);
    }

    #[test]
    fn matches_within_tolerance_and_near_zero() {
        assert!(AnswerValidator::numbers_match(100.0, 100.0, 0.02));
        assert!(AnswerValidator::numbers_match(102.0, 100.0, 0.02));
        assert!(!AnswerValidator::numbers_match(103.0, 100.0, 0.02));
        assert!(AnswerValidator::numbers_match(0.005, 0.0, 0.02));
        assert!(!AnswerValidator::numbers_match(0.02, 0.0, 0.02));
        assert!(AnswerValidator::numbers_match(500.0, -500.0, 0.02));
    }

    #[test]
    fn matching_answer_is_fully_confident() {
        let report = AnswerValidator::default().validate(
            &single(ScalarValue::Integer(12)),
            "You have 12 properties.",
        );
        assert!(report.is_valid);
        assert_eq!(report.confidence, 1.0);
        assert!(report.warning.is_none());
    }

    #[test]
    fn hallucinated_count_is_flagged() {
        let result = single(ScalarValue::Integer(12));
        let report = AnswerValidator::default().validate(&result, "You have 15 properties.");
        assert!(!report.is_valid);
        assert_eq!(report.confidence, 0.0);
        assert_eq!(report.mismatched, vec![15.0]);
        let warning = report.warning.unwrap();
        assert!(warning.contains("15"));
        assert!(warning.contains("12"));
    }

    #[test]
    fn answers_without_numbers_pass() {
        let report = AnswerValidator::default()
            .validate(&single(ScalarValue::Integer(12)), "Here are your properties:");
        assert!(report.is_valid);
        assert_eq!(report.confidence, 1.0);
    }

    #[test]
    fn partial_match_sits_on_the_validity_boundary() {
        let report = AnswerValidator::default().validate(
            &single(ScalarValue::Integer(12)),
            "You have 12 properties and 999 units.",
        );
        assert_eq!(report.confidence, 0.5);
        assert!(report.is_valid);
        assert!(report.warning.is_none());
        assert_eq!(report.mismatched, vec![999.0]);
    }

    #[test]
    fn numbers_without_numeric_result_are_unsupported() {
        let report = AnswerValidator::default()
            .validate(&single(ScalarValue::Text("text".into())), "You have 15 properties.");
        assert!(!report.is_valid);
        assert!(report.confidence < 0.25);
        assert!(report.warning.unwrap().contains("no numeric values"));
    }

    #[test]
    fn tolerance_is_configurable() {
        let result = single(ScalarValue::Integer(100));
        assert!(!AnswerValidator::default().validate(&result, "The value is 105.").is_valid);
        assert!(AnswerValidator::new(0.10, 0.5, 0.25).validate(&result, "The value is 105.").is_valid);
    }

    #[test]
    fn row_count_and_ratios_count_as_result_values() {
        let result = QueryResult::new(
            vec!["city".into(), "ratio".into()],
            vec![
                vec![ScalarValue::Text("Phoenix".into()), ScalarValue::Real(0.25)],
                vec![ScalarValue::Text("Miami".into()), ScalarValue::Real(0.5)],
                vec![ScalarValue::Text("Austin".into()), ScalarValue::Real(0.1)],
            ],
        );
        let report = AnswerValidator::default()
            .validate(&result, "3 cities; Miami leads with 50% and Phoenix has 25%.");
        assert_eq!(report.confidence, 1.0);
    }

    #[test]
    fn annotation_only_below_low_threshold() {
        let validator = AnswerValidator::default();
        let result = single(ScalarValue::Integer(12));

        let ok = validator.validate(&result, "You have 12 properties.");
        assert_eq!(validator.annotate("You have 12 properties.", &ok, &result), "You have 12 properties.");

        let bad = validator.validate(&result, "You have 15 properties.");
        let annotated = validator.annotate("You have 15 properties.", &bad, &result);
        assert!(annotated.starts_with("You have 15 properties."));
        assert!(annotated.contains("Confidence: 0% (LOW)"));
        assert!(annotated.contains("Raw SQL Result: [(12)]"));
    }

    #[test]
    fn labels_follow_thresholds() {
        let validator = AnswerValidator::default();
        assert_eq!(validator.confidence_label(0.1), "LOW");
        assert_eq!(validator.confidence_label(0.6), "MEDIUM");
        assert_eq!(validator.confidence_label(1.0), "HIGH");
    }
}
