// queryforge-core/src/schema/cast.rs
// Casting literals into the stored representation of a property

use super::{SchemaNode, TypeName};
use crate::error::{CompileError, Result};
use crate::regex_cache::QueryRegex;
use chrono::{DateTime, NaiveDate, SecondsFormat, TimeZone, Utc};
use serde_json::{json, Number, Value};

/// Cast a literal for a query against `node`.
///
/// `null` and regular expressions always pass through. Dates are emitted as
/// `{"$date": RFC3339}` and identifiers as `{"$oid": hex}`, the extended JSON
/// forms the driver understands.
pub fn cast_for_query(node: &SchemaNode, value: &Value, path: &str) -> Result<Value> {
    if value.is_null() || QueryRegex::from_value(value).is_some() {
        return Ok(value.clone());
    }
    let cast = match node.type_name {
        TypeName::String => cast_string(value),
        TypeName::Number => cast_number(value),
        TypeName::Boolean => cast_boolean(value),
        TypeName::Date => cast_date(value),
        TypeName::ObjectId | TypeName::Reference => cast_object_id(value),
        TypeName::Geometry
        | TypeName::Any
        | TypeName::Document
        | TypeName::Set
        | TypeName::List
        | TypeName::Unknown => Some(value.clone()),
    };
    cast.ok_or_else(|| {
        CompileError::invalid(
            format!("Cast to {} failed for value {}", node.type_name.as_str(), value),
            path,
        )
    })
}

fn cast_string(value: &Value) -> Option<Value> {
    match value {
        Value::String(_) => Some(value.clone()),
        Value::Number(n) => Some(Value::String(n.to_string())),
        Value::Bool(b) => Some(Value::String(b.to_string())),
        _ => None,
    }
}

fn cast_number(value: &Value) -> Option<Value> {
    match value {
        Value::Number(_) => Some(value.clone()),
        Value::String(s) => {
            let s = s.trim();
            if let Ok(i) = s.parse::<i64>() {
                return Some(Value::Number(i.into()));
            }
            s.parse::<f64>()
                .ok()
                .and_then(Number::from_f64)
                .map(Value::Number)
        }
        Value::Bool(b) => Some(Value::Number(i64::from(*b).into())),
        _ => None,
    }
}

fn cast_boolean(value: &Value) -> Option<Value> {
    match value {
        Value::Bool(_) => Some(value.clone()),
        Value::String(s) => match s.as_str() {
            "true" => Some(Value::Bool(true)),
            "false" => Some(Value::Bool(false)),
            _ => None,
        },
        Value::Number(n) => n.as_f64().map(|f| Value::Bool(f != 0.0)),
        _ => None,
    }
}

/// Parse the date forms the query language accepts
pub fn parse_date(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .map(|d| d.with_timezone(&Utc))
            .ok()
            .or_else(|| {
                NaiveDate::parse_from_str(s, "%Y-%m-%d")
                    .ok()
                    .and_then(|d| d.and_hms_opt(0, 0, 0))
                    .map(|d| Utc.from_utc_datetime(&d))
            }),
        Value::Number(n) => n
            .as_i64()
            .and_then(|millis| Utc.timestamp_millis_opt(millis).single()),
        Value::Object(map) if map.len() == 1 => map.get("$date").and_then(parse_date),
        _ => None,
    }
}

pub fn date_value(date: &DateTime<Utc>) -> Value {
    json!({ "$date": date.to_rfc3339_opts(SecondsFormat::Millis, true) })
}

fn cast_date(value: &Value) -> Option<Value> {
    parse_date(value).map(|d| date_value(&d))
}

pub fn is_object_id(s: &str) -> bool {
    s.len() == 24 && s.chars().all(|c| c.is_ascii_hexdigit())
}

/// The hex string of an identifier literal
pub fn object_id_hex(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if is_object_id(s) => Some(s.to_lowercase()),
        Value::Object(map) if map.len() == 1 => match map.get("$oid") {
            Some(Value::String(s)) if is_object_id(s) => Some(s.to_lowercase()),
            _ => None,
        },
        _ => None,
    }
}

fn cast_object_id(value: &Value) -> Option<Value> {
    object_id_hex(value).map(|hex| json!({ "$oid": hex }))
}
