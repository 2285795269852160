//! Serde helpers for feeds that send the same field as a string one day and a
//! number the next.

use serde::{Deserialize, Deserializer};
use serde_json::Value;

fn value_to_string(v: Value) -> Option<String> {
    match v {
        Value::String(s) => Some(s),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

pub fn string<'de, D: Deserializer<'de>>(d: D) -> Result<String, D::Error> {
    let v = Value::deserialize(d)?;
    value_to_string(v).ok_or_else(|| serde::de::Error::custom("expected string or number"))
}

pub fn opt_string<'de, D: Deserializer<'de>>(d: D) -> Result<Option<String>, D::Error> {
    let v = Option::<Value>::deserialize(d)?;
    Ok(v.and_then(value_to_string).filter(|s| !s.is_empty()))
}

pub fn opt_i64<'de, D: Deserializer<'de>>(d: D) -> Result<Option<i64>, D::Error> {
    let v = Option::<Value>::deserialize(d)?;
    Ok(match v {
        Some(Value::Number(n)) => n.as_i64(),
        Some(Value::String(s)) => s.trim().parse().ok(),
        _ => None,
    })
}

pub fn opt_f64<'de, D: Deserializer<'de>>(d: D) -> Result<Option<f64>, D::Error> {
    let v = Option::<Value>::deserialize(d)?;
    Ok(match v {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => s.trim().parse().ok(),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Deserialize)]
    struct Row {
        #[serde(deserialize_with = "string")]
        id: String,
        #[serde(default, deserialize_with = "opt_i64")]
        time: Option<i64>,
        #[serde(default, deserialize_with = "opt_f64")]
        line: Option<f64>,
    }

    #[test]
    fn test_accepts_both_shapes() {
        let a: Row = serde_json::from_str(r#"{"id": 42, "time": "1700000000", "line": "2.5"}"#).unwrap();
        assert_eq!(a.id, "42");
        assert_eq!(a.time, Some(1_700_000_000));
        assert_eq!(a.line, Some(2.5));
        let b: Row = serde_json::from_str(r#"{"id": "42"}"#).unwrap();
        assert_eq!(b.time, None);
        assert_eq!(b.line, None);
    }
}
