use crate::{Error, Result};
use crate::types::TypeConverter;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime};
use driver::{DriverType, PreparedStatement, ResultCursor, Value};

const DATE_FORMAT: &str = "%Y-%m-%d";
const TIME_FORMAT: &str = "%H:%M:%S";
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

fn conversion_error(context: &str, value: &Value, wanted: &str) -> Error {
    Error::ConversionFailed {
        context: context.to_string(),
        reason: format!("cannot read {value} as {wanted}"),
    }
}

/// Passes values through unchanged. Serves `object`/`map` targets and
/// columns whose driver type is reported unsupported; binding infers the
/// driver type from the runtime value.
pub struct UnknownConverter;

impl UnknownConverter {
    fn infer(value: &Value) -> DriverType {
        match value {
            Value::Null => DriverType::Null,
            Value::Bool(_) => DriverType::Boolean,
            Value::Number(n) if n.is_f64() => DriverType::Double,
            Value::Number(_) => DriverType::BigInt,
            Value::String(_) => DriverType::Varchar,
            Value::Array(_) => DriverType::Array,
            Value::Object(_) => DriverType::Struct,
        }
    }
}

impl TypeConverter for UnknownConverter {
    fn bind(
        &self,
        stmt: &mut dyn PreparedStatement,
        index: usize,
        value: &Value,
        driver_type: DriverType,
    ) -> Result<()> {
        let driver_type = match driver_type {
            DriverType::Undefined | DriverType::Unsupported => Self::infer(value),
            other => other,
        };
        stmt.bind(index, value.clone(), driver_type)?;
        Ok(())
    }

    fn decode_by_index(&self, cursor: &dyn ResultCursor, index: usize) -> Result<Value> {
        Ok(cursor.get(index)?)
    }

    fn decode_out(&self, stmt: &mut dyn PreparedStatement, index: usize) -> Result<Value> {
        Ok(stmt.take_out(index)?)
    }
}

macro_rules! converter {
    ($name:ident, $wanted:literal, $coerce:expr) => {
        pub struct $name;

        impl TypeConverter for $name {
            fn bind(
                &self,
                stmt: &mut dyn PreparedStatement,
                index: usize,
                value: &Value,
                driver_type: DriverType,
            ) -> Result<()> {
                let coerce = $coerce;
                let coerced = if value.is_null() {
                    Value::Null
                } else {
                    coerce(value).ok_or_else(|| {
                        conversion_error(concat!("bind ", $wanted), value, $wanted)
                    })?
                };
                stmt.bind(index, coerced, driver_type)?;
                Ok(())
            }

            fn decode_by_index(&self, cursor: &dyn ResultCursor, index: usize) -> Result<Value> {
                let coerce = $coerce;
                let raw = cursor.get(index)?;
                if raw.is_null() {
                    return Ok(Value::Null);
                }
                coerce(&raw)
                    .ok_or_else(|| conversion_error(concat!("decode ", $wanted), &raw, $wanted))
            }

            fn decode_out(&self, stmt: &mut dyn PreparedStatement, index: usize) -> Result<Value> {
                let coerce = $coerce;
                let raw = stmt.take_out(index)?;
                if raw.is_null() {
                    return Ok(Value::Null);
                }
                coerce(&raw)
                    .ok_or_else(|| conversion_error(concat!("out ", $wanted), &raw, $wanted))
            }
        }
    };
}

converter!(StringConverter, "string", |value: &Value| match value {
    Value::String(s) => Some(Value::String(s.clone())),
    Value::Number(n) => Some(Value::String(n.to_string())),
    Value::Bool(b) => Some(Value::String(b.to_string())),
    _ => None,
});

converter!(IntegerConverter, "integer", |value: &Value| match value {
    Value::Number(n) => n
        .as_i64()
        .or_else(|| n.as_f64().map(|f| f as i64))
        .map(Value::from),
    Value::String(s) => s.trim().parse::<i64>().ok().map(Value::from),
    Value::Bool(b) => Some(Value::from(i64::from(*b))),
    _ => None,
});

converter!(DoubleConverter, "double", |value: &Value| match value {
    Value::Number(n) => n.as_f64().map(Value::from),
    Value::String(s) => s.trim().parse::<f64>().ok().map(Value::from),
    _ => None,
});

converter!(BooleanConverter, "boolean", |value: &Value| match value {
    Value::Bool(b) => Some(Value::Bool(*b)),
    Value::Number(n) => n.as_i64().map(|i| Value::Bool(i != 0)),
    Value::String(s) => match s.to_lowercase().as_str() {
        "true" | "1" => Some(Value::Bool(true)),
        "false" | "0" => Some(Value::Bool(false)),
        _ => None,
    },
    _ => None,
});

converter!(BytesConverter, "bytes", |value: &Value| match value {
    // byte payloads travel as arrays of numbers or base64-ish strings;
    // either passes through untouched
    Value::Array(_) | Value::String(_) => Some(value.clone()),
    _ => None,
});

converter!(DateConverter, "date", |value: &Value| {
    coerce_temporal(value, DATE_FORMAT, |s| {
        NaiveDate::parse_from_str(s, DATE_FORMAT)
            .ok()
            .map(|d| d.format(DATE_FORMAT).to_string())
    })
});

converter!(TimeConverter, "time", |value: &Value| {
    coerce_temporal(value, TIME_FORMAT, |s| {
        NaiveTime::parse_from_str(s, TIME_FORMAT)
            .ok()
            .map(|t| t.format(TIME_FORMAT).to_string())
    })
});

converter!(TimestampConverter, "timestamp", |value: &Value| {
    coerce_temporal(value, TIMESTAMP_FORMAT, |s| {
        NaiveDateTime::parse_from_str(s, TIMESTAMP_FORMAT)
            .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f"))
            .ok()
            .map(|t| t.format(TIMESTAMP_FORMAT).to_string())
    })
});

// Temporal values travel as formatted strings; numbers are read as epoch
// milliseconds.
fn coerce_temporal(
    value: &Value,
    format: &str,
    parse: impl Fn(&str) -> Option<String>,
) -> Option<Value> {
    match value {
        Value::String(s) => parse(s.trim()).map(Value::String),
        Value::Number(n) => n.as_i64().and_then(|ms| {
            DateTime::from_timestamp_millis(ms)
                .map(|dt| Value::String(dt.naive_utc().format(format).to_string()))
        }),
        _ => None,
    }
}

#[cfg(test)]
mod unit {
    use super::*;
    use driver::testing;
    use serde_json::json;
    use std::collections::HashMap;

    fn cursor_with(url: &str, value: Value, driver_type: DriverType) -> Box<dyn ResultCursor> {
        let script = testing::install(url);
        script
            .when("SELECT c")
            .returns(&[("c", driver_type)], vec![vec![value]]);
        let mut conn = driver::manager::connect(url, &HashMap::new()).unwrap();
        let mut stmt = conn
            .prepare("SELECT c", &driver::StatementConfig::default())
            .unwrap();
        let mut cursor = stmt.execute_query().unwrap();
        cursor.next().unwrap();
        cursor
    }

    #[test]
    fn integers_parse_from_strings() {
        let cursor = cursor_with("mem://conv-int", json!(" 42 "), DriverType::Varchar);
        assert_eq!(
            IntegerConverter.decode_by_index(cursor.as_ref(), 1).unwrap(),
            json!(42)
        );
    }

    #[test]
    fn decode_round_trips_simple_values() {
        let cursor = cursor_with("mem://conv-str", json!("Ann"), DriverType::Varchar);
        assert_eq!(
            StringConverter.decode_by_index(cursor.as_ref(), 1).unwrap(),
            json!("Ann")
        );
        let cursor = cursor_with("mem://conv-dbl", json!(2.5), DriverType::Double);
        assert_eq!(
            DoubleConverter.decode_by_index(cursor.as_ref(), 1).unwrap(),
            json!(2.5)
        );
        let cursor = cursor_with("mem://conv-bool", json!(true), DriverType::Boolean);
        assert_eq!(
            BooleanConverter.decode_by_index(cursor.as_ref(), 1).unwrap(),
            json!(true)
        );
    }

    #[test]
    fn nulls_decode_to_null() {
        let cursor = cursor_with("mem://conv-null", Value::Null, DriverType::Integer);
        assert_eq!(
            IntegerConverter.decode_by_index(cursor.as_ref(), 1).unwrap(),
            Value::Null
        );
    }

    #[test]
    fn timestamps_normalize() {
        let cursor = cursor_with(
            "mem://conv-ts",
            json!("2024-02-29 10:20:30.5"),
            DriverType::Timestamp,
        );
        assert_eq!(
            TimestampConverter
                .decode_by_index(cursor.as_ref(), 1)
                .unwrap(),
            json!("2024-02-29 10:20:30")
        );
    }

    #[test]
    fn mismatched_decode_is_a_conversion_error() {
        let cursor = cursor_with("mem://conv-bad", json!({"k": 1}), DriverType::Varchar);
        assert!(matches!(
            StringConverter.decode_by_index(cursor.as_ref(), 1),
            Err(Error::ConversionFailed { .. })
        ));
    }
}
