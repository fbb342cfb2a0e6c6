//! Semantic-type coercion between JSON field values and typed column values.
//!
//! Each indexed field declares a [`FieldType`]; the write path projects the
//! JSON value into the column representation with [`coerce_field`], and the
//! read path reconstructs JSON from column values with [`column_to_json`].

use std::net::IpAddr;
use std::str::FromStr;

use cidr::{IpCidr, IpInet};
use serde_json::Value;

use crate::error::{CoerceError, Error};
use crate::session::SqlValue;
use crate::types::FieldType;

/// Characters that force quoting of a PostgreSQL array-literal element.
const ARRAY_ESCAPE_CHARS: &[char] = &['"', ',', '{', '}', '\\'];

/// Escape a string for use as a PostgreSQL array-literal element.
///
/// Elements containing any of `" , { } \` are wrapped in double quotes with
/// each occurrence backslash-escaped; all other elements pass through
/// unchanged.
pub fn escape_array_element(s: &str) -> String {
    if !s.contains(ARRAY_ESCAPE_CHARS) {
        return s.to_string();
    }
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        if ARRAY_ESCAPE_CHARS.contains(&c) {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('"');
    out
}

/// The string form of a JSON value: strings verbatim, everything else via
/// its JSON serialization.
fn string_form(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn invalid(ftype: FieldType, value: &Value) -> Error {
    CoerceError::InvalidIndexType {
        ftype: ftype.name().to_string(),
        value: string_form(value),
    }
    .into()
}

/// Coerce a JSON value to the scalar column representation of `ftype`.
///
/// `ftype` must be a scalar type; array fields coerce per element through
/// [`coerce_field`].
pub fn coerce_scalar(ftype: FieldType, value: &Value) -> Result<SqlValue, Error> {
    match ftype {
        FieldType::String => Ok(SqlValue::Text(string_form(value))),
        FieldType::Number => coerce_number(value).ok_or_else(|| invalid(ftype, value)),
        FieldType::Boolean => {
            let truthy = match value {
                Value::Bool(b) => *b,
                other => string_form(other).eq_ignore_ascii_case("true"),
            };
            Ok(SqlValue::Bool(truthy))
        }
        FieldType::Ip => {
            let addr = IpAddr::from_str(string_form(value).trim())
                .map_err(|_| invalid(ftype, value))?;
            Ok(SqlValue::Inet(IpInet::new_host(addr)))
        }
        FieldType::Subnet => {
            let net = IpCidr::from_str(string_form(value).trim())
                .map_err(|_| invalid(ftype, value))?;
            Ok(SqlValue::Cidr(net))
        }
        _ => Err(invalid(ftype, value)),
    }
}

fn coerce_number(value: &Value) -> Option<SqlValue> {
    match value {
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Some(SqlValue::Int(i))
            } else {
                // Integer-valued floats are accepted; fractions are not.
                let f = n.as_f64()?;
                if f.fract() == 0.0 && f.is_finite() {
                    Some(SqlValue::Int(f as i64))
                } else {
                    None
                }
            }
        }
        Value::String(s) => s.trim().parse::<i64>().ok().map(SqlValue::Int),
        _ => None,
    }
}

/// Coerce a JSON value to the full column representation of `ftype`,
/// including array variants. A scalar value supplied for an array field is
/// promoted to a one-element array.
pub fn coerce_field(ftype: FieldType, value: &Value) -> Result<SqlValue, Error> {
    if !ftype.is_array() {
        return coerce_scalar(ftype, value);
    }

    let one;
    let elems: &[Value] = match value {
        Value::Array(a) => a,
        scalar => {
            one = [scalar.clone()];
            &one
        }
    };

    let element = ftype.element();
    match element {
        FieldType::String => {
            let mut out = Vec::with_capacity(elems.len());
            for e in elems {
                match coerce_scalar(element, e)? {
                    SqlValue::Text(s) => out.push(s),
                    _ => unreachable!("string coercion yields text"),
                }
            }
            Ok(SqlValue::TextArray(out))
        }
        FieldType::Number => {
            let mut out = Vec::with_capacity(elems.len());
            for e in elems {
                match coerce_scalar(element, e)? {
                    SqlValue::Int(n) => out.push(n),
                    _ => unreachable!("number coercion yields bigint"),
                }
            }
            Ok(SqlValue::IntArray(out))
        }
        FieldType::Boolean => {
            let mut out = Vec::with_capacity(elems.len());
            for e in elems {
                match coerce_scalar(element, e)? {
                    SqlValue::Bool(b) => out.push(b),
                    _ => unreachable!("boolean coercion yields boolean"),
                }
            }
            Ok(SqlValue::BoolArray(out))
        }
        FieldType::Ip => {
            let mut out = Vec::with_capacity(elems.len());
            for e in elems {
                match coerce_scalar(element, e)? {
                    SqlValue::Inet(ip) => out.push(ip),
                    _ => unreachable!("ip coercion yields inet"),
                }
            }
            Ok(SqlValue::InetArray(out))
        }
        FieldType::Subnet => {
            let mut out = Vec::with_capacity(elems.len());
            for e in elems {
                match coerce_scalar(element, e)? {
                    SqlValue::Cidr(net) => out.push(net),
                    _ => unreachable!("subnet coercion yields cidr"),
                }
            }
            Ok(SqlValue::CidrArray(out))
        }
        _ => Err(invalid(ftype, value)),
    }
}

/// Reverse map: a column value back to its JSON form, or `None` for NULL.
///
/// Column values arrive already typed from the driver, so the declared
/// field type is not consulted; it is kept in the signature to mirror the
/// forward map. IP and subnet values come back in canonical textual form.
/// A NaN read from a floating-point projection maps to the `" "` sentinel.
pub fn column_to_json(_ftype: FieldType, value: &SqlValue) -> Option<Value> {
    match value {
        SqlValue::Null => None,
        SqlValue::Text(s) => Some(Value::String(s.clone())),
        SqlValue::Int(n) => Some(Value::from(*n)),
        SqlValue::Float(f) if f.is_nan() => Some(Value::String(" ".to_string())),
        SqlValue::Float(f) => serde_json::Number::from_f64(*f).map(Value::Number),
        SqlValue::Bool(b) => Some(Value::Bool(*b)),
        SqlValue::Timestamp(t) => Some(Value::String(t.to_rfc3339())),
        SqlValue::Inet(ip) => Some(Value::String(ip.address().to_string())),
        SqlValue::Cidr(net) => Some(Value::String(net.to_string())),
        SqlValue::TextArray(elems) => Some(Value::Array(
            elems.iter().map(|s| Value::String(s.clone())).collect(),
        )),
        SqlValue::IntArray(elems) => {
            Some(Value::Array(elems.iter().map(|n| Value::from(*n)).collect()))
        }
        SqlValue::BoolArray(elems) => {
            Some(Value::Array(elems.iter().map(|b| Value::Bool(*b)).collect()))
        }
        SqlValue::InetArray(elems) => Some(Value::Array(
            elems
                .iter()
                .map(|ip| Value::String(ip.address().to_string()))
                .collect(),
        )),
        SqlValue::CidrArray(elems) => Some(Value::Array(
            elems
                .iter()
                .map(|net| Value::String(net.to_string()))
                .collect(),
        )),
    }
}
