//! Structured output contract for work-item extraction.
//!
//! The model's answer must parse into [`ExtractionResult`]. Parsing is fail-closed:
//! anything that does not match the shape below is a schema validation error and
//! no partially parsed items ever leave this module.

use std::sync::OnceLock;

use chrono::{SecondsFormat, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ExtractionError;

/// Tolerance used when comparing money amounts (document currency unit).
pub const RECONCILIATION_TOLERANCE: f64 = 0.01;

/// Generate ISO8601 timestamp for current time.
pub fn now_iso8601() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Round a money amount to two decimals for display.
pub fn round_currency(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// One line item of a bill of materials.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkItem {
    /// Item or serial number as printed in the source document.
    pub id: String,
    pub name: String,
    pub quantity: f64,
    pub unit_price: f64,
    #[serde(default)]
    pub discount: f64,
    /// Derived net value. Recomputed on every change, never trusted from input.
    #[serde(default)]
    pub total: f64,
}

impl WorkItem {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        quantity: f64,
        unit_price: f64,
        discount: f64,
    ) -> Self {
        let mut item = Self {
            id: id.into(),
            name: name.into(),
            quantity,
            unit_price,
            discount,
            total: 0.0,
        };
        item.recalculate();
        item
    }

    /// `quantity × unitPrice − discount`.
    pub fn net_value(&self) -> f64 {
        self.quantity * self.unit_price - self.discount
    }

    pub fn recalculate(&mut self) {
        self.total = self.net_value();
    }
}

/// Return value of the extraction flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractionResult {
    pub work_items: Vec<WorkItem>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtotal: Option<f64>,
}

impl ExtractionResult {
    /// Sum of the recomputed net values of all lines.
    pub fn computed_total(&self) -> f64 {
        self.work_items.iter().map(WorkItem::net_value).sum()
    }

    /// True when a subtotal was located and the line items do not add up to it.
    pub fn is_mismatched(&self) -> bool {
        match self.subtotal {
            Some(subtotal) => (self.computed_total() - subtotal).abs() > RECONCILIATION_TOLERANCE,
            None => false,
        }
    }
}

/// JSON schema handed to the model as its response format.
pub fn extraction_json_schema() -> serde_json::Value {
    serde_json::json!({
        "type": "object",
        "additionalProperties": false,
        "required": ["workItems"],
        "properties": {
            "workItems": {
                "type": "array",
                "description": "Atomic line items in document order. Never subtotal, total or summary rows.",
                "items": {
                    "type": "object",
                    "additionalProperties": false,
                    "required": ["id", "name", "quantity", "unitPrice", "total"],
                    "properties": {
                        "id": { "type": "string", "description": "Item or serial number exactly as printed." },
                        "name": { "type": "string", "description": "Description of the work or material." },
                        "quantity": { "type": "number", "description": "Quantity, 1 if not stated." },
                        "unitPrice": { "type": "number", "description": "Gross unit price, 0 if not stated." },
                        "discount": { "type": "number", "description": "Rebate on the same row as a positive amount, 0 if none." },
                        "total": { "type": "number", "description": "Net line value after any rebate on the same row." }
                    }
                }
            },
            "subtotal": {
                "type": ["number", "null"],
                "description": "The pre-tax total printed in the document, null if it cannot be located unambiguously."
            }
        }
    })
}

// ============================================================================
// Raw model output
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
struct RawExtraction {
    work_items: Vec<RawWorkItem>,
    #[serde(default)]
    subtotal: Option<f64>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
struct RawWorkItem {
    #[serde(default)]
    id: Option<String>,
    name: String,
    #[serde(default)]
    quantity: Option<f64>,
    #[serde(default)]
    unit_price: Option<f64>,
    #[serde(default)]
    discount: Option<f64>,
    #[serde(default)]
    total: Option<f64>,
}

/// Parse and normalize a raw model response.
pub fn parse_extraction(response: &str) -> Result<ExtractionResult, ExtractionError> {
    let json_str = strip_code_fence(response);

    let raw: RawExtraction = serde_json::from_str(json_str).map_err(|e| {
        ExtractionError::SchemaValidation(format!(
            "{} (near: {})",
            e,
            json_str.chars().take(200).collect::<String>()
        ))
    })?;

    validate(&raw)?;

    let subtotal = raw.subtotal;
    let work_items = normalize_items(raw.work_items);

    debug!(
        "Parsed {} work items (subtotal={:?})",
        work_items.len(),
        subtotal
    );

    Ok(ExtractionResult {
        work_items,
        subtotal,
    })
}

fn strip_code_fence(response: &str) -> &str {
    if response.contains("```json") {
        response
            .split("```json")
            .nth(1)
            .and_then(|s| s.split("```").next())
            .unwrap_or(response)
            .trim()
    } else if response.contains("```") {
        response.split("```").nth(1).unwrap_or(response).trim()
    } else {
        response.trim()
    }
}

fn validate(raw: &RawExtraction) -> Result<(), ExtractionError> {
    let invalid = |msg: String| Err(ExtractionError::SchemaValidation(msg));

    if let Some(subtotal) = raw.subtotal {
        if !subtotal.is_finite() {
            return invalid("subtotal is not a finite number".to_string());
        }
    }

    for (index, item) in raw.work_items.iter().enumerate() {
        if item.name.trim().is_empty() {
            return invalid(format!("workItems[{}] has an empty name", index));
        }
        let numbers = [
            ("quantity", item.quantity),
            ("unitPrice", item.unit_price),
            ("discount", item.discount),
            ("total", item.total),
        ];
        for (field, value) in numbers {
            if let Some(v) = value {
                if !v.is_finite() {
                    return invalid(format!("workItems[{}].{} is not finite", index, field));
                }
            }
        }
    }

    Ok(())
}

// ============================================================================
// Normalization
// ============================================================================

/// Apply defaults, drop summary rows, and fold detached rebate rows into their line.
fn normalize_items(raw: Vec<RawWorkItem>) -> Vec<WorkItem> {
    let mut items: Vec<WorkItem> = Vec::with_capacity(raw.len());

    for (index, line) in raw.into_iter().enumerate() {
        if is_summary_line(&line.name) {
            debug!("Dropping summary row: {}", line.name);
            continue;
        }

        let item = derive_item(index, line);

        if item.net_value() < 0.0 {
            if let Some(previous) = items.last_mut() {
                if previous.id == item.id || is_rebate_line(&item.name) {
                    debug!(
                        "Folding rebate row '{}' ({}) into '{}'",
                        item.name,
                        item.net_value(),
                        previous.name
                    );
                    previous.discount += -item.net_value();
                    previous.recalculate();
                    continue;
                }
            }
        }

        items.push(item);
    }

    items
}

/// Fill in quantity, unit price and discount from whatever the model provided.
///
/// A negative quantity or a negative printed amount marks a credit row: its net
/// value is kept negative so the caller can fold it into the line it rebates.
fn derive_item(index: usize, line: RawWorkItem) -> WorkItem {
    let stated_discount = line.discount.map(f64::abs);
    let quantity = derive_quantity(&line, stated_discount.unwrap_or(0.0));

    let mut unit_price = match (line.unit_price, line.total) {
        (Some(unit_price), _) => unit_price,
        (None, Some(total)) => (total + stated_discount.unwrap_or(0.0)) / quantity,
        (None, None) => 0.0,
    };

    // Sign carried only by the printed amount, e.g. unitPrice 190000 with total -190000.
    if let Some(total) = line.total {
        if total < 0.0 && quantity * unit_price > 0.0 {
            unit_price = total / quantity;
        }
    }

    let discount = stated_discount.unwrap_or_else(|| match (line.unit_price, line.total) {
        (Some(_), Some(total)) if total >= 0.0 => {
            let gap = quantity * unit_price - total;
            if gap > RECONCILIATION_TOLERANCE {
                gap
            } else {
                0.0
            }
        }
        _ => 0.0,
    });

    let id = line
        .id
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty())
        .unwrap_or_else(|| (index + 1).to_string());

    WorkItem::new(id, line.name.trim(), quantity, unit_price, discount)
}

/// Stated quantity with its sign, else `(total + discount) / unitPrice` when that
/// covers at least one unit, else 1.
fn derive_quantity(line: &RawWorkItem, discount: f64) -> f64 {
    if let Some(quantity) = line.quantity.filter(|q| q.is_finite() && *q != 0.0) {
        return quantity;
    }
    match (line.unit_price, line.total) {
        (Some(unit_price), Some(total)) if unit_price != 0.0 => {
            let units = (total + discount) / unit_price;
            if units >= 1.0 {
                units
            } else {
                1.0
            }
        }
        _ => 1.0,
    }
}

fn summary_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(
            r"(?i)^(?:[一二三四五六七八九十\d]+[、.．)\s]+)?(?:本頁|本页|本章|工程|項目|项目|page\s+)?\s*(?:小計|小计|合計|合计|總計|总计|總價|总价|總額|总额|sub-?\s*total|grand\s+total|total|summary)(?:\s*(?:amount|金額|金额))?\s*[:：]?$",
        )
        .expect("summary pattern is valid")
    })
}

fn rebate_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?i)(折讓|折让|折扣|優惠|优惠|讓價|让价|値引|rebate|discount)")
            .expect("rebate pattern is valid")
    })
}

/// Whether a row description reads as a subtotal/total/summary marker.
pub fn is_summary_line(name: &str) -> bool {
    summary_pattern().is_match(name.trim())
}

fn is_rebate_line(name: &str) -> bool {
    rebate_pattern().is_match(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_and_total_only_defaults() {
        let result = parse_extraction(r#"{"workItems":[{"name":"Site survey","total":1200}]}"#)
            .unwrap();

        let item = &result.work_items[0];
        assert_eq!(item.quantity, 1.0);
        assert_eq!(item.unit_price, 1200.0);
        assert_eq!(item.discount, 0.0);
        assert_eq!(item.total, 1200.0);
        assert_eq!(item.id, "1");
        assert_eq!(result.subtotal, None);
    }

    #[test]
    fn test_unit_price_derived_from_total_and_quantity() {
        let result =
            parse_extraction(r#"{"workItems":[{"id":"A-3","name":"Rebar","quantity":4,"total":100}]}"#)
                .unwrap();
        assert_eq!(result.work_items[0].unit_price, 25.0);
        assert_eq!(result.work_items[0].total, 100.0);
    }

    #[test]
    fn test_rebate_on_same_row_nets_into_one_line() {
        let result = parse_extraction(
            r#"{"workItems":[{"id":"5","name":"RC混凝土","quantity":1,"unitPrice":250000,"discount":-190000,"total":60000}],"subtotal":60000}"#,
        )
        .unwrap();

        assert_eq!(result.work_items.len(), 1);
        assert_eq!(result.work_items[0].discount, 190000.0);
        assert_eq!(result.work_items[0].total, 60000.0);
        assert!(!result.is_mismatched());
    }

    #[test]
    fn test_net_total_below_gross_becomes_discount() {
        let result = parse_extraction(
            r#"{"workItems":[{"id":"5","name":"RC混凝土","quantity":1,"unitPrice":250000,"total":60000}]}"#,
        )
        .unwrap();

        assert_eq!(result.work_items.len(), 1);
        assert_eq!(result.work_items[0].discount, 190000.0);
        assert_eq!(result.work_items[0].total, 60000.0);
    }

    #[test]
    fn test_detached_rebate_row_is_folded() {
        let result = parse_extraction(
            r#"{"workItems":[
                {"id":"5","name":"RC混凝土","quantity":1,"unitPrice":250000,"total":250000},
                {"id":"5","name":"RC混凝土","quantity":1,"unitPrice":-190000,"total":-190000}
            ]}"#,
        )
        .unwrap();

        assert_eq!(result.work_items.len(), 1);
        assert_eq!(result.work_items[0].total, 60000.0);
    }

    #[test]
    fn test_negative_quantity_credit_row_is_folded() {
        let result = parse_extraction(
            r#"{"workItems":[
                {"id":"5","name":"RC混凝土","quantity":1,"unitPrice":250000,"total":250000},
                {"id":"5","name":"RC混凝土 折讓","quantity":-1,"unitPrice":190000,"total":-190000}
            ],"subtotal":60000}"#,
        )
        .unwrap();

        assert_eq!(result.work_items.len(), 1);
        assert_eq!(result.work_items[0].discount, 190000.0);
        assert_eq!(result.work_items[0].total, 60000.0);
        assert!(!result.is_mismatched());
    }

    #[test]
    fn test_credit_sign_only_on_total_is_folded() {
        let result = parse_extraction(
            r#"{"workItems":[
                {"id":"1","name":"模板","quantity":1,"unitPrice":1000,"total":1000},
                {"id":"2","name":"優惠","unitPrice":300,"total":-300}
            ]}"#,
        )
        .unwrap();

        assert_eq!(result.work_items.len(), 1);
        assert_eq!(result.work_items[0].discount, 300.0);
        assert_eq!(result.work_items[0].total, 700.0);
    }

    #[test]
    fn test_missing_quantity_derived_from_amount() {
        let result = parse_extraction(
            r#"{"workItems":[{"id":"1","name":"Rebar","unitPrice":50,"total":200}],"subtotal":200}"#,
        )
        .unwrap();

        let item = &result.work_items[0];
        assert_eq!(item.quantity, 4.0);
        assert_eq!(item.unit_price, 50.0);
        assert_eq!(item.discount, 0.0);
        assert_eq!(item.total, 200.0);
        assert!(!result.is_mismatched());
    }

    #[test]
    fn test_missing_quantity_with_net_below_gross_keeps_one_unit() {
        let result = parse_extraction(
            r#"{"workItems":[{"id":"5","name":"RC混凝土","unitPrice":250000,"total":60000}]}"#,
        )
        .unwrap();

        let item = &result.work_items[0];
        assert_eq!(item.quantity, 1.0);
        assert_eq!(item.discount, 190000.0);
        assert_eq!(item.total, 60000.0);
    }

    #[test]
    fn test_rebate_row_matched_by_name() {
        let result = parse_extraction(
            r#"{"workItems":[
                {"id":"1","name":"鋼筋","quantity":10,"unitPrice":100,"total":1000},
                {"id":"2","name":"折讓","total":-200}
            ]}"#,
        )
        .unwrap();

        assert_eq!(result.work_items.len(), 1);
        assert_eq!(result.work_items[0].discount, 200.0);
        assert_eq!(result.work_items[0].total, 800.0);
    }

    #[test]
    fn test_summary_rows_are_dropped() {
        let result = parse_extraction(
            r#"{"workItems":[
                {"id":"1","name":"模板","quantity":2,"unitPrice":50,"total":100},
                {"id":"","name":"小計","quantity":1,"unitPrice":100,"total":100},
                {"id":"","name":"Grand Total:","total":105}
            ],"subtotal":100}"#,
        )
        .unwrap();

        assert_eq!(result.work_items.len(), 1);
        assert_eq!(result.work_items[0].name, "模板");
    }

    #[test]
    fn test_summary_detection() {
        assert!(is_summary_line("小計"));
        assert!(is_summary_line("合計金額"));
        assert!(is_summary_line("  Subtotal: "));
        assert!(is_summary_line("一、合計"));
        assert!(is_summary_line("TOTAL"));
        assert!(!is_summary_line("RC混凝土"));
        assert!(!is_summary_line("Total station survey"));
        assert!(!is_summary_line("Subtotal sheet piling"));
    }

    #[test]
    fn test_code_fenced_output_is_accepted() {
        let response = "```json\n{\"workItems\":[{\"id\":\"1\",\"name\":\"A\",\"quantity\":1,\"unitPrice\":5,\"total\":5}],\"subtotal\":5}\n```";
        let result = parse_extraction(response).unwrap();
        assert_eq!(result.subtotal, Some(5.0));
    }

    #[test]
    fn test_fail_closed_on_malformed_output() {
        let cases = [
            "not json at all",
            r#"{"items":[]}"#,
            r#"{"workItems":[{"name":"A","quantity":"2"}]}"#,
            r#"{"workItems":[{"name":"A","colour":"red"}]}"#,
            r#"{"workItems":[{"name":"   ","total":3}]}"#,
            r#"{"workItems":[{"id":"1"}]}"#,
            r#"{"workItems":{"name":"A"}}"#,
        ];

        for case in cases {
            let err = parse_extraction(case).unwrap_err();
            assert!(
                matches!(err, ExtractionError::SchemaValidation(_)),
                "expected schema failure for {}",
                case
            );
        }
    }

    #[test]
    fn test_mismatch_against_subtotal() {
        let result = ExtractionResult {
            work_items: vec![WorkItem::new("1", "A", 2.0, 100.0, 0.0)],
            subtotal: Some(200.02),
        };
        assert!(result.is_mismatched());

        let result = ExtractionResult {
            work_items: vec![WorkItem::new("1", "A", 2.0, 100.0, 0.0)],
            subtotal: Some(200.0),
        };
        assert!(!result.is_mismatched());
    }

    #[test]
    fn test_wire_names_are_camel_case() {
        let item = WorkItem::new("1", "A", 2.0, 10.0, 1.0);
        let json = serde_json::to_value(&item).unwrap();
        assert_eq!(json["unitPrice"], 10.0);
        assert_eq!(json["total"], 19.0);
    }

    #[test]
    fn test_round_currency() {
        assert_eq!(round_currency(0.1 + 0.2), 0.3);
        assert_eq!(round_currency(59999.999), 60000.0);
    }
}
