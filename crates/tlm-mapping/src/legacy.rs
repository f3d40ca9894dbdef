//! Fixed layout of the eHZ smart-meter telegram:
//!
//! ```json
//! { "Time": "2024-05-01T08:00:00", "eHZ": { "Power": -230, "E_in": 1234.5, "E_out": 0 } }
//! ```
//!
//! Columns: `time`, `power_curr` (int64), `total`, `power_out`.
//! A negative `Power` with no export reading is export: it moves to
//! `power_out` and `power_curr` becomes 0.

use serde_json::Value;

use tlm_schemas::{FieldValue, Payload};

use crate::table::coerce;
use crate::{FieldType, MappingError, Zone};

pub const TIME_COLUMN: &str = "time";
pub const POWER_CURRENT: &str = "power_curr";
pub const TOTAL: &str = "total";
pub const POWER_OUT: &str = "power_out";

/// Column layout written by [`parse_meter`].
pub const COLUMNS: &[(&str, FieldType)] = &[
    (TIME_COLUMN, FieldType::Time),
    (TOTAL, FieldType::Float64),
    (POWER_CURRENT, FieldType::Int64),
    (POWER_OUT, FieldType::Float64),
];

fn field<'v>(message: &'v Value, path: &[&str]) -> Result<&'v Value, MappingError> {
    path.iter()
        .try_fold(message, |node, seg| node.get(*seg))
        .ok_or_else(|| MappingError::MissingPath {
            source: path.join("/"),
        })
}

pub fn parse_meter(zone: Zone, message: &Value) -> Result<Payload, MappingError> {
    if !message.is_object() {
        return Err(MappingError::NotAnObject);
    }
    let read = |path: &[&str], ty: FieldType| {
        field(message, path).and_then(|raw| coerce(zone, &path.join("/"), ty, raw))
    };

    let time = read(&["Time"], FieldType::Time)?;
    let mut power_curr = read(&["eHZ", "Power"], FieldType::Int64)?
        .as_int()
        .unwrap_or_default();
    let total = read(&["eHZ", "E_in"], FieldType::Float64)?;
    let mut power_out = read(&["eHZ", "E_out"], FieldType::Float64)?
        .as_float()
        .unwrap_or_default();

    if power_curr < 0 && power_out == 0.0 {
        power_out = -(power_curr as f64);
        power_curr = 0;
    }

    let mut row = Payload::new();
    row.insert(TIME_COLUMN.to_string(), time);
    row.insert(POWER_CURRENT.to_string(), FieldValue::Int(power_curr));
    row.insert(TOTAL.to_string(), total);
    row.insert(POWER_OUT.to_string(), FieldValue::Float(power_out));
    Ok(row)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn negative_power_becomes_export() {
        let row = parse_meter(
            Zone::Utc,
            &json!({ "Time": "2024-05-01T08:00:00", "eHZ": { "Power": -230, "E_in": 10.5, "E_out": 0 } }),
        )
        .unwrap();
        assert_eq!(row.get(POWER_CURRENT), Some(&FieldValue::Int(0)));
        assert_eq!(row.get(POWER_OUT), Some(&FieldValue::Float(230.0)));
        assert_eq!(row.get(TOTAL), Some(&FieldValue::Float(10.5)));
    }

    #[test]
    fn negative_power_with_export_reading_is_kept() {
        let row = parse_meter(
            Zone::Utc,
            &json!({ "Time": "2024-05-01T08:00:00", "eHZ": { "Power": -230, "E_in": 10.5, "E_out": 3.25 } }),
        )
        .unwrap();
        assert_eq!(row.get(POWER_CURRENT), Some(&FieldValue::Int(-230)));
        assert_eq!(row.get(POWER_OUT), Some(&FieldValue::Float(3.25)));
    }

    #[test]
    fn missing_meter_block() {
        let err = parse_meter(Zone::Utc, &json!({ "Time": "2024-05-01T08:00:00" })).unwrap_err();
        assert_eq!(
            err,
            MappingError::MissingPath {
                source: "eHZ/Power".to_string()
            }
        );
    }
}
