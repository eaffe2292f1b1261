//! Validation of the JSON beacon sent by the browser.

use serde_json::{Map, Number, Value};
use thiserror::Error;

/// Which optional payload fields a sink variant insists on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ValidationRules {
    /// `referrer` must be present as a string (it may be empty).
    pub require_referrer: bool,
    /// `timezone` must be present as a non-empty string. When false the
    /// timezone may instead come from the edge request context.
    pub require_timezone: bool,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum PayloadError {
    #[error("payload is not a JSON object")]
    NotAnObject,

    #[error("field `{0}` is missing or has the wrong type")]
    InvalidField(&'static str),
}

/// A beacon that passed validation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InboundPayload {
    pub hostname: String,
    pub pathname: String,
    /// `Some("")` when the browser sent an empty referrer.
    pub referrer: Option<String>,
    pub window_inner_width: i64,
    /// `None` when absent or empty; only possible when the rules allow it.
    pub timezone: Option<String>,
}

impl InboundPayload {
    pub fn from_json(value: &Value, rules: ValidationRules) -> Result<Self, PayloadError> {
        let object = value.as_object().ok_or(PayloadError::NotAnObject)?;

        let hostname = non_empty_str(object, "hostname")?.to_owned();
        let pathname = non_empty_str(object, "pathname")?.to_owned();
        let window_inner_width = integer(object, "windowInnerWidth")?;

        let referrer = match rules.require_referrer {
            true => Some(required_str(object, "referrer")?.to_owned()),
            false => optional_str(object, "referrer")?.map(str::to_owned),
        };

        let timezone = match rules.require_timezone {
            true => Some(non_empty_str(object, "timezone")?.to_owned()),
            false => optional_str(object, "timezone")?
                .filter(|tz| !tz.is_empty())
                .map(str::to_owned),
        };

        Ok(InboundPayload {
            hostname,
            pathname,
            referrer,
            window_inner_width,
            timezone,
        })
    }
}

#[cfg(test)]
fn is_valid(value: &Value, rules: ValidationRules) -> bool {
    InboundPayload::from_json(value, rules).is_ok()
}

fn required_str<'a>(
    object: &'a Map<String, Value>,
    field: &'static str,
) -> Result<&'a str, PayloadError> {
    object
        .get(field)
        .and_then(Value::as_str)
        .ok_or(PayloadError::InvalidField(field))
}

fn non_empty_str<'a>(
    object: &'a Map<String, Value>,
    field: &'static str,
) -> Result<&'a str, PayloadError> {
    required_str(object, field)
        .ok()
        .filter(|s| !s.is_empty())
        .ok_or(PayloadError::InvalidField(field))
}

// Absent is fine, present-but-not-a-string is not.
fn optional_str<'a>(
    object: &'a Map<String, Value>,
    field: &'static str,
) -> Result<Option<&'a str>, PayloadError> {
    match object.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.as_str())),
        Some(_) => Err(PayloadError::InvalidField(field)),
    }
}

fn integer(object: &Map<String, Value>, field: &'static str) -> Result<i64, PayloadError> {
    match object.get(field) {
        Some(Value::Number(n)) => integral_value(n).ok_or(PayloadError::InvalidField(field)),
        _ => Err(PayloadError::InvalidField(field)),
    }
}

/// Browsers may serialize whole numbers as `1024.0`; those count as integers.
fn integral_value(n: &Number) -> Option<i64> {
    if let Some(i) = n.as_i64() {
        return Some(i);
    }
    n.as_f64()
        .filter(|f| f.is_finite() && f.fract() == 0.0)
        .filter(|f| *f >= i64::MIN as f64 && *f < i64::MAX as f64)
        .map(|f| f as i64)
}
