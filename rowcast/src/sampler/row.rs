//! Conversion of wire-format rows into JSON records.
//!
//! Values arrive in two shapes depending on which protocol served the query.
//! The binary protocol returns typed variants while the text protocol
//! returns nearly everything as bytes, so byte values are decoded according
//! to the column's declared type. Temporal values render in MySQL's own text
//! format, `YYYY-MM-DD hh:mm:ss` and friends.

use mysql_async::{Row, Value as SqlValue, consts::ColumnType};
use serde_json::{Number, Value};

use super::Record;

/// Convert a row into a [`Record`], keyed by column name.
pub(super) fn record_from_row(row: &Row) -> Record {
    let mut record = Record::new();
    for (index, column) in row.columns_ref().iter().enumerate() {
        let value = match row.as_ref(index) {
            Some(value) => json_value(value, column.column_type()),
            None => Value::Null,
        };
        record.insert(column.name_str().into_owned(), value);
    }
    record
}

/// Convert one wire value into JSON per the column's declared type.
fn json_value(value: &SqlValue, column_type: ColumnType) -> Value {
    match value {
        SqlValue::NULL => Value::Null,
        SqlValue::Bytes(bytes) => bytes_value(bytes, column_type),
        SqlValue::Int(n) => Value::Number(Number::from(*n)),
        SqlValue::UInt(n) => Value::Number(Number::from(*n)),
        SqlValue::Float(f) => float_value(f64::from(*f)),
        SqlValue::Double(f) => float_value(*f),
        SqlValue::Date(year, month, day, hour, minute, second, micros) => {
            let date = format!("{year:04}-{month:02}-{day:02}");
            if column_type == ColumnType::MYSQL_TYPE_DATE {
                Value::String(date)
            } else if *micros == 0 {
                Value::String(format!("{date} {hour:02}:{minute:02}:{second:02}"))
            } else {
                Value::String(format!(
                    "{date} {hour:02}:{minute:02}:{second:02}.{micros:06}"
                ))
            }
        }
        SqlValue::Time(negative, days, hours, minutes, seconds, micros) => {
            let sign = if *negative { "-" } else { "" };
            let hours = u32::from(*hours) + days * 24;
            if *micros == 0 {
                Value::String(format!("{sign}{hours:02}:{minutes:02}:{seconds:02}"))
            } else {
                Value::String(format!(
                    "{sign}{hours:02}:{minutes:02}:{seconds:02}.{micros:06}"
                ))
            }
        }
    }
}

/// Decode a bytes value per the column's declared type.
///
/// Numeric and JSON columns land here when served over the text protocol.
/// Anything unrecognized decodes as UTF-8 text, lossily.
fn bytes_value(bytes: &[u8], column_type: ColumnType) -> Value {
    let text = String::from_utf8_lossy(bytes);
    match column_type {
        ColumnType::MYSQL_TYPE_JSON => serde_json::from_str(&text)
            .unwrap_or_else(|_| Value::String(text.into_owned())),
        ColumnType::MYSQL_TYPE_TINY
        | ColumnType::MYSQL_TYPE_SHORT
        | ColumnType::MYSQL_TYPE_LONG
        | ColumnType::MYSQL_TYPE_LONGLONG
        | ColumnType::MYSQL_TYPE_INT24
        | ColumnType::MYSQL_TYPE_YEAR => match text.parse::<i64>() {
            Ok(n) => Value::Number(Number::from(n)),
            // BIGINT UNSIGNED values past i64::MAX still parse as u64.
            Err(_) => match text.parse::<u64>() {
                Ok(n) => Value::Number(Number::from(n)),
                Err(_) => Value::String(text.into_owned()),
            },
        },
        ColumnType::MYSQL_TYPE_DECIMAL
        | ColumnType::MYSQL_TYPE_NEWDECIMAL
        | ColumnType::MYSQL_TYPE_FLOAT
        | ColumnType::MYSQL_TYPE_DOUBLE => text
            .parse::<f64>()
            .ok()
            .and_then(Number::from_f64)
            .map_or_else(|| Value::String(text.into_owned()), Value::Number),
        _ => Value::String(text.into_owned()),
    }
}

fn float_value(f: f64) -> Value {
    // NaN and the infinities have no JSON representation.
    Number::from_f64(f).map_or(Value::Null, Value::Number)
}
