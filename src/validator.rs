//! Turns the structured task's final answer into a [`PortfolioRecord`].

use chrono::Utc;
use rust_decimal::Decimal;
use serde_json::{Map, Value};
use std::str::FromStr;
use tracing::warn;

use crate::brain::{outermost_object, strip_fences};
use crate::error::SchemaViolation;
use crate::types::{Holding, PortfolioRecord};

pub const MAX_ENTRIES: usize = 5;

const ASSET_KEYS: &[&str] = &["top_assets", "top_5_holdings", "top_5_assets", "holdings", "assets"];
const PLATFORM_KEYS: &[&str] = &["top_platforms", "top_5_platforms", "platforms"];
const NAME_KEYS: &[&str] = &["name", "asset", "platform", "symbol"];

/// Validate and normalize a structured answer.
///
/// Over-long lists are truncated rather than rejected. Missing optional
/// fields stay absent.
pub fn validate(text: &str) -> Result<PortfolioRecord, SchemaViolation> {
    let cleaned = strip_fences(text);
    let object = outermost_object(cleaned)
        .ok_or_else(|| SchemaViolation::new("$", "answer contains no JSON object"))?;
    let root: Value = serde_json::from_str(object)
        .map_err(|e| SchemaViolation::new("$", format!("not valid JSON: {e}")))?;
    let root = root
        .as_object()
        .ok_or_else(|| SchemaViolation::new("$", "expected a JSON object"))?;

    let (net_worth, nested_sol) = match root.get("net_worth") {
        Some(Value::Object(inner)) => (
            optional_amount(inner.get("net_worth"), "net_worth.net_worth")?,
            optional_amount(inner.get("sol_equivalent"), "net_worth.sol_equivalent")?,
        ),
        other => (optional_amount(other, "net_worth")?, None),
    };
    let sol_equivalent = match nested_sol {
        Some(sol) => Some(sol),
        None => optional_amount(root.get("sol_equivalent"), "sol_equivalent")?,
    };

    let top_assets = holdings(root, ASSET_KEYS)?;
    let top_platforms = holdings(root, PLATFORM_KEYS)?;

    Ok(PortfolioRecord {
        net_worth,
        sol_equivalent,
        top_assets,
        top_platforms,
        captured_at: Utc::now(),
    })
}

fn holdings(root: &Map<String, Value>, keys: &[&str]) -> Result<Vec<Holding>, SchemaViolation> {
    let Some((key, value)) = keys
        .iter()
        .find_map(|k| root.get(*k).map(|v| (*k, v)))
    else {
        return Ok(Vec::new());
    };

    let entries = match value {
        Value::Null => return Ok(Vec::new()),
        Value::Array(entries) => entries,
        _ => return Err(SchemaViolation::new(key, "expected a list")),
    };

    if entries.len() > MAX_ENTRIES {
        warn!(
            field = key,
            count = entries.len(),
            "Truncating list to {} entries",
            MAX_ENTRIES
        );
    }

    entries
        .iter()
        .take(MAX_ENTRIES)
        .enumerate()
        .map(|(i, entry)| holding(entry, &format!("{key}[{i}]")))
        .collect()
}

fn holding(entry: &Value, path: &str) -> Result<Holding, SchemaViolation> {
    let entry = entry
        .as_object()
        .ok_or_else(|| SchemaViolation::new(path, "expected an object"))?;

    let name = NAME_KEYS
        .iter()
        .find_map(|k| entry.get(*k).and_then(Value::as_str))
        .map(str::trim)
        .unwrap_or_default();
    if name.is_empty() {
        return Err(SchemaViolation::new(format!("{path}.name"), "missing name"));
    }

    let value_path = format!("{path}.value");
    let value = optional_amount(entry.get("value"), &value_path)?
        .ok_or_else(|| SchemaViolation::new(&value_path, "missing value"))?;

    let pct_path = format!("{path}.percentage");
    let percentage = optional_amount(entry.get("percentage"), &pct_path)?;
    if let Some(pct) = percentage {
        if pct > Decimal::ONE_HUNDRED {
            return Err(SchemaViolation::new(pct_path, format!("{pct} exceeds 100")));
        }
    }

    Ok(Holding {
        name: name.to_string(),
        value,
        percentage,
    })
}

/// Parse a non-negative amount; `None` when absent or null.
fn optional_amount(value: Option<&Value>, field: &str) -> Result<Option<Decimal>, SchemaViolation> {
    let amount = match value {
        None | Some(Value::Null) => return Ok(None),
        Some(Value::Number(n)) => parse_decimal(&n.to_string()),
        Some(Value::String(s)) => parse_decimal(&clean_number(s)),
        Some(other) => {
            return Err(SchemaViolation::new(
                field,
                format!("expected a number, got {other}"),
            ));
        }
    }
    .ok_or_else(|| SchemaViolation::new(field, format!("non-numeric value {}", display(value))))?;

    if amount.is_sign_negative() && !amount.is_zero() {
        return Err(SchemaViolation::new(field, format!("negative value {amount}")));
    }
    Ok(Some(amount.normalize()))
}

fn parse_decimal(text: &str) -> Option<Decimal> {
    Decimal::from_str(text)
        .or_else(|_| Decimal::from_scientific(text))
        .ok()
}

/// `"$1,234.50"` -> `"1234.50"`, `"12.5%"` -> `"12.5"`.
fn clean_number(text: &str) -> String {
    text.chars()
        .filter(|c| !matches!(c, '$' | ',' | '%' | ' ' | '_'))
        .collect()
}

fn display(value: Option<&Value>) -> String {
    value.map(Value::to_string).unwrap_or_default()
}
