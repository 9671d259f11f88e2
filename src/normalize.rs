// src/normalize.rs

//! Turns raw model output into an [`Extraction`].
//!
//! Models are told to answer with bare JSON but regularly wrap it in a
//! markdown fence or add a sentence around it. [`strip_fences`] peels that
//! off, [`normalize`] parses what is left and checks it against Schema A/B.
//!
//! Field types are coerced leniently: numbers may arrive as strings
//! (`"3"`, `"$1,204.50"`) and integral floats are accepted as quantities.
//! Missing required fields are still an error.

use crate::error::NormalizeError;
use crate::invoice::{Extraction, InvoiceRecord, LineItem};
use regex::Regex;
use serde_json::{Map, Value};
use time::Date;
use time::macros::format_description;
use tracing::{debug, warn};

const FENCE: &str = "```";

/// Remove markdown code fences and surrounding prose from a model reply.
///
/// - no fence: the trimmed text
/// - ```` ```json ... ``` ```` or ```` ``` ... ``` ````: the fenced body
/// - prose before/after a fence: the body of the first fenced block
/// - an unterminated fence: everything after the opening marker
///
/// Whatever remains is narrowed to its outermost `{ ... }` span when there is
/// one, which also drops prose around unfenced JSON.
pub fn strip_fences(raw: &str) -> &str {
    let mut body = raw.trim();

    if let Some(start) = body.find(FENCE) {
        let after = &body[start + FENCE.len()..];
        // Language tag, if any, runs up to the first non-identifier char
        let tag_len = after
            .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_' || c == '-'))
            .unwrap_or(after.len());
        let after = &after[tag_len..];
        body = match after.find(FENCE) {
            Some(end) => &after[..end],
            None => after,
        };
        body = body.trim();
    }

    outermost_object(body).unwrap_or(body)
}

fn outermost_object(s: &str) -> Option<&str> {
    let start = s.find('{')?;
    let end = s.rfind('}')?;
    if end <= start {
        return None;
    }
    Some(&s[start..=end])
}

/// Parse and validate raw model output.
pub fn normalize(raw: &str) -> Result<Extraction, NormalizeError> {
    // Bare JSON parses as-is; only fall back to fence stripping if it fails
    let value: Value = match serde_json::from_str(raw.trim()) {
        Ok(v) => v,
        Err(_) => serde_json::from_str(strip_fences(raw)).map_err(|e| NormalizeError::NotJson {
            reason: e.to_string(),
            raw: raw.to_string(),
        })?,
    };

    let Value::Object(obj) = value else {
        return Err(NormalizeError::UnknownStatus(None));
    };

    match obj.get("status").and_then(Value::as_str) {
        Some("success") => {
            let record = parse_record(&obj)?;
            debug!(vendor = %record.vendor, items = record.line_items.len(), "Parsed success record");
            Ok(Extraction::Success(record))
        }
        Some("error") => {
            let reason = obj
                .get("reason")
                .and_then(Value::as_str)
                .unwrap_or("no reason given")
                .to_string();
            Ok(Extraction::Rejected { reason })
        }
        other => Err(NormalizeError::UnknownStatus(other.map(str::to_string))),
    }
}

fn parse_record(obj: &Map<String, Value>) -> Result<InvoiceRecord, NormalizeError> {
    let vendor = required_string(obj, "vendor", "vendor")?;
    let date = required_string(obj, "date", "date")?;
    if !is_iso_date(&date) {
        warn!(date = %date, "Date is not in YYYY-MM-DD form; keeping as-is");
    }

    let line_items = match obj.get("line_items") {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(items)) => items
            .iter()
            .enumerate()
            .map(|(idx, v)| parse_line_item(idx, v))
            .collect::<Result<Vec<_>, _>>()?,
        Some(_) => return Err(invalid("line_items", "expected an array")),
    };

    let total_amount = obj
        .get("total_amount")
        .ok_or_else(|| invalid("total_amount", "missing"))
        .and_then(|v| as_amount(v, "total_amount"))?;

    let original_language = match obj.get("original_language") {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) if s.trim().is_empty() => None,
        Some(Value::String(s)) => Some(s.trim().to_string()),
        Some(_) => return Err(invalid("original_language", "expected a string")),
    };

    Ok(InvoiceRecord {
        vendor,
        date,
        line_items,
        total_amount,
        original_language,
    })
}

fn parse_line_item(idx: usize, value: &Value) -> Result<LineItem, NormalizeError> {
    let Value::Object(obj) = value else {
        return Err(invalid(&format!("line_items[{idx}]"), "expected an object"));
    };
    let field = |name: &str| format!("line_items[{idx}].{name}");

    let item = required_string(obj, "item", &field("item"))?;
    let qty = obj
        .get("qty")
        .ok_or_else(|| invalid(&field("qty"), "missing"))
        .and_then(|v| as_quantity(v, &field("qty")))?;
    let cost = obj
        .get("cost")
        .ok_or_else(|| invalid(&field("cost"), "missing"))
        .and_then(|v| as_amount(v, &field("cost")))?;

    Ok(LineItem { item, qty, cost })
}

fn required_string(
    obj: &Map<String, Value>,
    key: &str,
    field: &str,
) -> Result<String, NormalizeError> {
    match obj.get(key) {
        Some(Value::String(s)) => Ok(s.trim().to_string()),
        Some(Value::Number(n)) => Ok(n.to_string()),
        Some(Value::Null) | None => Err(invalid(field, "missing")),
        Some(_) => Err(invalid(field, "expected a string")),
    }
}

fn as_amount(value: &Value, field: &str) -> Result<f64, NormalizeError> {
    match value {
        Value::Number(n) => n.as_f64().ok_or_else(|| invalid(field, "not a finite number")),
        Value::String(s) => parse_number(s)
            .ok_or_else(|| invalid(field, &format!("cannot read {s:?} as a number"))),
        Value::Null => Err(invalid(field, "missing")),
        _ => Err(invalid(field, "expected a number")),
    }
}

fn as_quantity(value: &Value, field: &str) -> Result<i64, NormalizeError> {
    if let Some(n) = value.as_i64() {
        return Ok(n);
    }
    let f = as_amount(value, field)?;
    if f.fract() == 0.0 && f.abs() < i64::MAX as f64 {
        Ok(f as i64)
    } else {
        Err(invalid(field, &format!("{f} is not a whole quantity")))
    }
}

/// Read an amount written as a string, e.g. `"$1,204.50"`, `"12,5 EUR"` or
/// `"1.234,56 EUR"`.
///
/// The whole string must be one number, optionally signed and wrapped in a
/// currency symbol or code. A single `.` is a decimal point; `.`-grouped
/// thousands take a `,` decimal.
fn parse_number(s: &str) -> Option<f64> {
    let shape = Regex::new(
        r"^(-)?\s*(?:\p{Sc}|[A-Za-z]{1,3}\.?)?\s*(-)?(\d[\d.,]*)\s*(?:\p{Sc}|[A-Za-z]{1,3})?$",
    )
    .ok()?;
    let caps = shape.captures(s.trim())?;
    let negative = caps.get(1).is_some() || caps.get(2).is_some();
    let digits = caps.get(3)?.as_str();

    let plain = Regex::new(r"^\d+(?:\.\d+)?$").ok()?;
    let comma_grouped = Regex::new(r"^\d{1,3}(?:,\d{3})+(?:\.\d+)?$").ok()?;
    let dot_grouped = Regex::new(r"^\d{1,3}(?:\.\d{3})+(?:,\d+)?$").ok()?;
    let decimal_comma = Regex::new(r"^\d+,\d{1,2}$").ok()?;

    let normalized = if plain.is_match(digits) {
        digits.to_string()
    } else if comma_grouped.is_match(digits) {
        digits.replace(',', "")
    } else if dot_grouped.is_match(digits) {
        digits.replace('.', "").replace(',', ".")
    } else if decimal_comma.is_match(digits) {
        digits.replace(',', ".")
    } else {
        return None;
    };

    let value: f64 = normalized.parse().ok()?;
    Some(if negative { -value } else { value })
}

fn is_iso_date(s: &str) -> bool {
    let format = format_description!("[year]-[month]-[day]");
    Date::parse(s, format).is_ok()
}

fn invalid(field: &str, reason: &str) -> NormalizeError {
    NormalizeError::InvalidField {
        field: field.to_string(),
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SUCCESS: &str = r#"{"status": "success", "vendor": "Acme GmbH", "date": "2024-05-17",
        "line_items": [{"item": "Widget", "qty": 2, "cost": 3.5}, {"item": "Bolt", "qty": 10, "cost": 0.1}],
        "total_amount": 8.0, "original_language": "German"}"#;

    fn expected() -> InvoiceRecord {
        InvoiceRecord {
            vendor: "Acme GmbH".into(),
            date: "2024-05-17".into(),
            line_items: vec![
                LineItem { item: "Widget".into(), qty: 2, cost: 3.5 },
                LineItem { item: "Bolt".into(), qty: 10, cost: 0.1 },
            ],
            total_amount: 8.0,
            original_language: Some("German".into()),
        }
    }

    #[test]
    fn test_strip_no_fence() {
        assert_eq!(strip_fences("  {\"a\": 1}\n"), "{\"a\": 1}");
    }

    #[test]
    fn test_strip_fence_with_tag() {
        assert_eq!(strip_fences("```json\n{\"a\": 1}\n```"), "{\"a\": 1}");
        assert_eq!(strip_fences("```JSON {\"a\": 1}```"), "{\"a\": 1}");
    }

    #[test]
    fn test_strip_fence_without_tag() {
        assert_eq!(strip_fences("```\n{\"a\": 1}\n```"), "{\"a\": 1}");
    }

    #[test]
    fn test_strip_fence_with_prose() {
        let raw = "Sure! Here is the data:\n```json\n{\"a\": 1}\n```\nLet me know if you need more.";
        assert_eq!(strip_fences(raw), "{\"a\": 1}");
    }

    #[test]
    fn test_strip_unterminated_fence() {
        assert_eq!(strip_fences("```json\n{\"a\": 1}"), "{\"a\": 1}");
    }

    #[test]
    fn test_strip_unfenced_prose() {
        assert_eq!(strip_fences("Result: {\"a\": {\"b\": 2}} done"), "{\"a\": {\"b\": 2}}");
    }

    #[test]
    fn test_strip_plain_text_untouched() {
        assert_eq!(strip_fences("  I cannot help with that. "), "I cannot help with that.");
    }

    #[test]
    fn test_normalize_fenced_success_matches_embedded_json() {
        for raw in [
            SUCCESS.to_string(),
            format!("```json\n{SUCCESS}\n```"),
            format!("```{SUCCESS}```"),
            format!("\n\n   ```json\n\n{SUCCESS}\n\n```   \n"),
        ] {
            assert_eq!(normalize(&raw).unwrap(), Extraction::Success(expected()));
        }
    }

    #[test]
    fn test_normalize_error_schema() {
        let raw = r#"```json
{"status": "error", "reason": "Not an invoice"}
```"#;
        assert_eq!(
            normalize(raw).unwrap(),
            Extraction::Rejected { reason: "Not an invoice".into() }
        );
    }

    #[test]
    fn test_normalize_error_without_reason() {
        assert_eq!(
            normalize(r#"{"status": "error"}"#).unwrap(),
            Extraction::Rejected { reason: "no reason given".into() }
        );
    }

    #[test]
    fn test_normalize_non_json() {
        for raw in ["Sorry, I can't read this.", "", "```json\n```", "{not json}"] {
            let err = normalize(raw).unwrap_err();
            assert!(matches!(err, NormalizeError::NotJson { .. }), "{raw:?} gave {err:?}");
        }
    }

    #[test]
    fn test_normalize_unknown_status() {
        let err = normalize(r#"{"status": "maybe"}"#).unwrap_err();
        assert!(matches!(err, NormalizeError::UnknownStatus(Some(ref s)) if s == "maybe"));

        let err = normalize(r#"{"vendor": "Acme"}"#).unwrap_err();
        assert!(matches!(err, NormalizeError::UnknownStatus(None)));

        let err = normalize("[1, 2]").unwrap_err();
        assert!(matches!(err, NormalizeError::UnknownStatus(None)));
    }

    #[test]
    fn test_normalize_coerces_strings() {
        let raw = r#"{"status": "success", "vendor": "Shop", "date": "2024-01-02",
            "line_items": [{"item": "Tea", "qty": "3", "cost": "$1,204.50"},
                           {"item": 42, "qty": 2.0, "cost": "12,5 EUR"}],
            "total_amount": "1,229.50"}"#;
        let Extraction::Success(record) = normalize(raw).unwrap() else {
            panic!("expected success");
        };
        assert_eq!(record.line_items[0].qty, 3);
        assert_eq!(record.line_items[0].cost, 1204.5);
        assert_eq!(record.line_items[1].item, "42");
        assert_eq!(record.line_items[1].qty, 2);
        assert_eq!(record.line_items[1].cost, 12.5);
        assert_eq!(record.total_amount, 1229.5);
        assert_eq!(record.original_language, None);
    }

    #[test]
    fn test_normalize_missing_line_items_is_empty() {
        let raw = r#"{"status": "success", "vendor": "Shop", "date": "2024-01-02", "total_amount": 5}"#;
        let Extraction::Success(record) = normalize(raw).unwrap() else {
            panic!("expected success");
        };
        assert!(record.line_items.is_empty());
        assert_eq!(record.total_amount, 5.0);
    }

    #[test]
    fn test_normalize_rejects_fractional_qty() {
        let raw = r#"{"status": "success", "vendor": "Shop", "date": "2024-01-02",
            "line_items": [{"item": "Rope", "qty": 1.5, "cost": 2}], "total_amount": 3}"#;
        let err = normalize(raw).unwrap_err();
        assert!(
            matches!(err, NormalizeError::InvalidField { ref field, .. } if field == "line_items[0].qty")
        );
    }

    #[test]
    fn test_normalize_missing_total() {
        let raw = r#"{"status": "success", "vendor": "Shop", "date": "2024-01-02", "line_items": []}"#;
        let err = normalize(raw).unwrap_err();
        assert!(matches!(err, NormalizeError::InvalidField { ref field, .. } if field == "total_amount"));
    }

    #[test]
    fn test_normalize_keeps_non_iso_date() {
        let raw = r#"{"status": "success", "vendor": "Shop", "date": "17/05/2024", "total_amount": 1}"#;
        let Extraction::Success(record) = normalize(raw).unwrap() else {
            panic!("expected success");
        };
        assert_eq!(record.date, "17/05/2024");
    }

    #[test]
    fn test_parse_number() {
        assert_eq!(parse_number("10.50"), Some(10.5));
        assert_eq!(parse_number("USD 2,000"), Some(2000.0));
        assert_eq!(parse_number("-4.25"), Some(-4.25));
        assert_eq!(parse_number("n/a"), None);
    }

    #[test]
    fn test_parse_number_grouping() {
        assert_eq!(parse_number("1.234,56 EUR"), Some(1234.56));
        assert_eq!(parse_number("€1.234.567"), Some(1234567.0));
        assert_eq!(parse_number("1,234,567.89"), Some(1234567.89));
        assert_eq!(parse_number("12,5 EUR"), Some(12.5));
        assert_eq!(parse_number("$ -3"), Some(-3.0));
    }

    #[test]
    fn test_parse_number_rejects_extra_text() {
        for s in ["2 x 5.00", "10.50 or 11", "about 5 dollars", "1,23,4", "1.2.3", "5.", ""] {
            assert_eq!(parse_number(s), None, "{s:?}");
        }
    }

    #[test]
    fn test_normalize_rejects_ambiguous_total() {
        let raw = r#"{"status": "success", "vendor": "Shop", "date": "2024-01-02", "total_amount": "2 x 5.00"}"#;
        let err = normalize(raw).unwrap_err();
        assert!(matches!(err, NormalizeError::InvalidField { ref field, .. } if field == "total_amount"));
    }

    #[test]
    fn test_normalize_unfenced_json_with_backticks_in_reason() {
        let raw = r#"{"status":"error","reason":"remove ``` please"}"#;
        assert_eq!(
            normalize(raw).unwrap(),
            Extraction::Rejected { reason: "remove ``` please".into() }
        );
    }

    #[test]
    fn test_is_iso_date() {
        assert!(is_iso_date("2024-02-29"));
        assert!(!is_iso_date("2023-02-29"));
        assert!(!is_iso_date("May 5, 2024"));
    }
}
