//! Line-level encoding and decoding of CAD expressions.
//!
//! One parameter becomes one line of the form `TYPE_PREFIX[UNIT]name=FORMULA`:
//!
//! ```text
//! [mm]L4=2.0
//! (Point) shape=point(0, 0, 0)
//! (List) ribs={1, 2, 3}
//! ```

use super::parameter::{ParamType, Parameter};
use crate::errors::{ValidationCode, ValidationError};
use regex::Regex;
use serde_json::{Number, Value};
use std::sync::LazyLock;

/// Encodes one parameter as an expression line (without trailing newline).
///
/// # Errors
///
/// Returns a validation error if the value does not fit the parameter type.
pub fn encode(param: &Parameter) -> Result<String, ValidationError> {
    param.check_unit()?;
    let formula = formula(param)?;
    let unit = param
        .unit()
        .map(|u| format!("[{u}]"))
        .unwrap_or_default();
    Ok(format!(
        "{}{}{}={}",
        param.param_type.prefix(),
        unit,
        param.name,
        formula
    ))
}

fn formula(param: &Parameter) -> Result<String, ValidationError> {
    let name = param.name.as_str();
    match param.param_type {
        ParamType::Number => {
            let n = as_f64(&param.value)
                .ok_or_else(|| ValidationError::invalid_value(name, "expected a number"))?;
            format_float(n).ok_or_else(|| ValidationError::invalid_value(name, "number is not finite"))
        }
        ParamType::Integer => as_i64(&param.value)
            .map(|i| i.to_string())
            .ok_or_else(|| ValidationError::invalid_value(name, "expected an integer")),
        ParamType::String => {
            let text = match &param.value {
                Value::String(s) => s.clone(),
                Value::Null => String::new(),
                other => other.to_string(),
            };
            Ok(quote(&text))
        }
        ParamType::Boolean => as_bool(&param.value)
            .map(|b| b.to_string())
            .ok_or_else(|| ValidationError::invalid_value(name, "expected true or false")),
        ParamType::Point => triple(name, &param.value).map(|c| format!("point({c})")),
        ParamType::Vector => triple(name, &param.value).map(|c| format!("vector({c})")),
        ParamType::List => match &param.value {
            Value::Array(items) => {
                let rendered = items
                    .iter()
                    .map(|item| scalar(name, item))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(format!("{{{}}}", rendered.join(", ")))
            }
            _ => Ok("{}".to_string()),
        },
    }
}

fn triple(name: &str, value: &Value) -> Result<String, ValidationError> {
    let Value::Array(items) = value else {
        return Err(ValidationError::invalid_value(
            name,
            "expected a sequence of three numbers",
        ));
    };
    if items.len() != 3 {
        return Err(ValidationError::invalid_value(
            name,
            format!("expected three components, got {}", items.len()),
        ));
    }
    let parts = items
        .iter()
        .map(|item| match item {
            Value::Number(n) => format_number(n)
                .ok_or_else(|| ValidationError::invalid_value(name, "component is not finite")),
            _ => Err(ValidationError::invalid_value(name, "components must be numbers")),
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(parts.join(", "))
}

fn scalar(name: &str, value: &Value) -> Result<String, ValidationError> {
    match value {
        Value::Number(n) => format_number(n)
            .ok_or_else(|| ValidationError::invalid_value(name, "list item is not finite")),
        Value::Bool(b) => Ok(b.to_string()),
        Value::String(s) => Ok(quote(s)),
        _ => Err(ValidationError::invalid_value(
            name,
            "list items must be numbers, booleans or strings",
        )),
    }
}

fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn as_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| {
            n.as_f64()
                .filter(|f| f.fract() == 0.0 && f.abs() < 9.0e15)
                .map(|f| f as i64)
        }),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn as_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" => Some(true),
            "false" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

/// Renders a float so that it always reads back as a float (`2.0`, not `2`).
fn format_float(n: f64) -> Option<String> {
    if !n.is_finite() {
        return None;
    }
    if n.fract() == 0.0 {
        Some(format!("{n:.1}"))
    } else {
        Some(n.to_string())
    }
}

/// Integers stay integers, floats go through [`format_float`].
fn format_number(n: &Number) -> Option<String> {
    if let Some(i) = n.as_i64() {
        return Some(i.to_string());
    }
    if let Some(u) = n.as_u64() {
        return Some(u.to_string());
    }
    n.as_f64().and_then(format_float)
}

/// Quotes a string so it stays on one line.
fn quote(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 2);
    out.push('"');
    for c in text.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c => out.push(c),
        }
    }
    out.push('"');
    out
}

static LINE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(?:\((String|Boolean|Point|Vector|List)\) )?(?:\[([^\]]+)\])?([A-Za-z_][A-Za-z0-9_]*)=(.*)$",
    )
    .unwrap_or_else(|e| unreachable!("static regex: {e}"))
});

fn syntax(message: impl Into<String>) -> ValidationError {
    ValidationError::new(ValidationCode::Syntax, message)
}

/// Parses one expression line back into a parameter.
///
/// Untyped lines are numbers when the formula contains a decimal point or
/// exponent and integers otherwise.
///
/// # Errors
///
/// Returns a validation error if the line does not follow the grammar.
pub fn decode_line(line: &str) -> Result<Parameter, ValidationError> {
    let line = line.trim_end_matches(['\r', '\n']);
    let caps = LINE_PATTERN
        .captures(line)
        .ok_or_else(|| syntax(format!("Not an expression line: {line}")))?;

    let name = &caps[3];
    let formula = caps[4].trim();
    let unit = caps.get(2).map(|m| m.as_str().to_string());

    let (param_type, value) = match caps.get(1).map(|m| m.as_str()) {
        None => {
            if formula.contains(['.', 'e', 'E']) {
                let n: f64 = formula
                    .parse()
                    .map_err(|_| syntax(format!("Bad number for '{name}': {formula}")))?;
                (ParamType::Number, Value::from(n))
            } else {
                let i: i64 = formula
                    .parse()
                    .map_err(|_| syntax(format!("Bad integer for '{name}': {formula}")))?;
                (ParamType::Integer, Value::from(i))
            }
        }
        Some("String") => (ParamType::String, Value::String(unquote(formula)?)),
        Some("Boolean") => match formula {
            "true" => (ParamType::Boolean, Value::Bool(true)),
            "false" => (ParamType::Boolean, Value::Bool(false)),
            _ => return Err(syntax(format!("Bad boolean for '{name}': {formula}"))),
        },
        Some("Point") => (ParamType::Point, call_args(formula, "point")?),
        Some("Vector") => (ParamType::Vector, call_args(formula, "vector")?),
        Some("List") => {
            let inner = formula
                .strip_prefix('{')
                .and_then(|f| f.strip_suffix('}'))
                .ok_or_else(|| syntax(format!("Bad list for '{name}': {formula}")))?;
            let items = split_items(inner)?
                .iter()
                .map(|item| parse_scalar(item))
                .collect::<Result<Vec<_>, _>>()?;
            (ParamType::List, Value::Array(items))
        }
        Some(other) => return Err(ValidationError::unknown_type(other)),
    };

    let mut param = Parameter::new(name, param_type, value)?;
    if let Some(unit) = unit {
        param = param.with_unit(unit);
        param.check_unit()?;
    }
    Ok(param)
}

fn call_args(formula: &str, func: &str) -> Result<Value, ValidationError> {
    let inner = formula
        .strip_prefix(func)
        .and_then(|f| f.strip_prefix('('))
        .and_then(|f| f.strip_suffix(')'))
        .ok_or_else(|| syntax(format!("Expected {func}(x, y, z), got {formula}")))?;
    let items = split_items(inner)?
        .iter()
        .map(|item| parse_number(item))
        .collect::<Result<Vec<_>, _>>()?;
    if items.len() != 3 {
        return Err(syntax(format!("Expected three components in {formula}")));
    }
    Ok(Value::Array(items))
}

fn parse_number(text: &str) -> Result<Value, ValidationError> {
    if text.contains(['.', 'e', 'E']) {
        text.parse::<f64>()
            .map(Value::from)
            .map_err(|_| syntax(format!("Bad number: {text}")))
    } else {
        text.parse::<i64>()
            .map(Value::from)
            .map_err(|_| syntax(format!("Bad number: {text}")))
    }
}

fn parse_scalar(text: &str) -> Result<Value, ValidationError> {
    match text {
        "true" => Ok(Value::Bool(true)),
        "false" => Ok(Value::Bool(false)),
        t if t.starts_with('"') => unquote(t).map(Value::String),
        t => parse_number(t),
    }
}

fn unquote(text: &str) -> Result<String, ValidationError> {
    let inner = text
        .strip_prefix('"')
        .and_then(|t| t.strip_suffix('"'))
        .ok_or_else(|| syntax(format!("Expected a quoted string, got {text}")))?;
    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.next() {
                Some('n') => out.push('\n'),
                Some('r') => out.push('\r'),
                Some('t') => out.push('\t'),
                Some(escaped) => out.push(escaped),
                None => return Err(syntax("Dangling escape in string")),
            }
        } else {
            out.push(c);
        }
    }
    Ok(out)
}

/// Splits `a, "b, c", 3` on top-level commas, respecting quoted strings.
fn split_items(inner: &str) -> Result<Vec<String>, ValidationError> {
    let mut items = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut escaped = false;

    for c in inner.chars() {
        if escaped {
            current.push(c);
            escaped = false;
            continue;
        }
        match c {
            '\\' if in_quotes => {
                current.push(c);
                escaped = true;
            }
            '"' => {
                current.push(c);
                in_quotes = !in_quotes;
            }
            ',' if !in_quotes => {
                items.push(current.trim().to_string());
                current.clear();
            }
            _ => current.push(c),
        }
    }
    if in_quotes {
        return Err(syntax("Unterminated string in list"));
    }
    let last = current.trim();
    if !last.is_empty() || !items.is_empty() {
        items.push(last.to_string());
    }
    Ok(items)
}
