//! Row decoding.
//!
//! A [`RowDecoder`] is built from read-session metadata and turns one binary
//! block into text rows. [`AvroRowDecoder`] handles blocks made of
//! concatenated Avro binary datums, one per row, all written with the
//! session's record schema.

use apache_avro::types::Value;
use apache_avro::{from_avro_datum, Schema};
use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::{DateTime, NaiveDate, SecondsFormat};

use crate::error::{Result, WarehouseError};
use crate::types::{ReadSession, Row};

/// Days between 0001-01-01 (CE day 1) and 1970-01-01.
const UNIX_EPOCH_DAYS_FROM_CE: i32 = 719_163;

/// Turns binary row blocks into text rows.
pub trait RowDecoder: Send + Sync {
    /// Output field names, in column order.
    fn field_names(&self) -> &[String];

    /// Decode exactly `row_count` rows from `block`.
    fn decode_rows(&self, block: &[u8], row_count: u64) -> Result<Vec<Row>>;
}

/// Decoder for Avro-encoded row blocks.
#[derive(Debug, Clone)]
pub struct AvroRowDecoder {
    schema: Schema,
    field_names: Vec<String>,
}

impl AvroRowDecoder {
    /// Parse an Avro record schema given as JSON.
    pub fn new(schema_json: &str) -> Result<Self> {
        let schema = Schema::parse_str(schema_json)
            .map_err(|e| WarehouseError::Schema(format!("invalid Avro schema: {}", e)))?;
        Self::from_schema(schema)
    }

    pub fn from_schema(schema: Schema) -> Result<Self> {
        let field_names = match &schema {
            Schema::Record(record) => record.fields.iter().map(|f| f.name.clone()).collect(),
            other => {
                return Err(WarehouseError::Schema(format!(
                    "expected a record schema, got {:?}",
                    other
                )))
            }
        };
        Ok(Self {
            schema,
            field_names,
        })
    }

    pub fn from_session(session: &ReadSession) -> Result<Self> {
        Self::new(&session.avro_schema)
    }

    fn record_to_row(&self, value: Value) -> Result<Row> {
        match value {
            Value::Record(fields) => fields.into_iter().map(|(_, v)| value_to_text(v)).collect(),
            other => Err(WarehouseError::Decode(format!(
                "expected a record datum, got {:?}",
                other
            ))),
        }
    }
}

impl RowDecoder for AvroRowDecoder {
    fn field_names(&self) -> &[String] {
        &self.field_names
    }

    fn decode_rows(&self, block: &[u8], row_count: u64) -> Result<Vec<Row>> {
        let mut reader = block;
        let mut rows = Vec::with_capacity(row_count.min(4096) as usize);
        for _ in 0..row_count {
            let exhausted = reader.is_empty();
            let value = match from_avro_datum(&self.schema, &mut reader, None) {
                Ok(value) => value,
                Err(_) if exhausted => {
                    return Err(WarehouseError::Decode(format!(
                        "block ended after {} of {} rows",
                        rows.len(),
                        row_count
                    )))
                }
                Err(e) => return Err(e.into()),
            };
            rows.push(self.record_to_row(value)?);
        }
        if !reader.is_empty() {
            return Err(WarehouseError::Decode(format!(
                "{} trailing bytes after {} rows",
                reader.len(),
                row_count
            )));
        }
        Ok(rows)
    }
}

/// Render one Avro value as a text cell.
fn value_to_text(value: Value) -> Result<String> {
    let text = match value {
        Value::Null => String::new(),
        Value::Boolean(b) => b.to_string(),
        Value::Int(i) => i.to_string(),
        Value::Long(l) => l.to_string(),
        Value::Float(f) => f.to_string(),
        Value::Double(d) => d.to_string(),
        Value::String(s) | Value::Enum(_, s) => s,
        Value::Bytes(b) | Value::Fixed(_, b) => STANDARD.encode(b),
        Value::Union(_, inner) => value_to_text(*inner)?,
        Value::Uuid(u) => u.to_string(),
        Value::Date(days) => days
            .checked_add(UNIX_EPOCH_DAYS_FROM_CE)
            .and_then(NaiveDate::from_num_days_from_ce_opt)
            .map(|d| d.format("%Y-%m-%d").to_string())
            .ok_or_else(|| WarehouseError::Decode(format!("date out of range: {}", days)))?,
        Value::TimestampMillis(ms) => DateTime::from_timestamp_millis(ms)
            .map(|dt| dt.to_rfc3339_opts(SecondsFormat::Millis, true))
            .ok_or_else(|| WarehouseError::Decode(format!("timestamp out of range: {}", ms)))?,
        Value::TimestampMicros(us) => DateTime::from_timestamp_micros(us)
            .map(|dt| dt.to_rfc3339_opts(SecondsFormat::Micros, true))
            .ok_or_else(|| WarehouseError::Decode(format!("timestamp out of range: {}", us)))?,
        other => serde_json::Value::try_from(other)
            .map_err(|e| WarehouseError::Decode(format!("cannot render value: {}", e)))?
            .to_string(),
    };
    Ok(text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use apache_avro::to_avro_datum;
    use apache_avro::types::Record;

    const SCHEMA: &str = r#"{
        "type": "record",
        "name": "Row",
        "fields": [
            {"name": "id", "type": "long"},
            {"name": "name", "type": ["null", "string"]},
            {"name": "payload", "type": "bytes"},
            {"name": "seen_at", "type": {"type": "long", "logicalType": "timestamp-micros"}}
        ]
    }"#;

    fn encode(schema: &Schema, id: i64, name: Option<&str>) -> Vec<u8> {
        let mut record = Record::new(schema).unwrap();
        record.put("id", id);
        match name {
            Some(n) => record.put("name", Value::Union(1, Box::new(Value::String(n.to_string())))),
            None => record.put("name", Value::Union(0, Box::new(Value::Null))),
        }
        record.put("payload", Value::Bytes(vec![0xde, 0xad]));
        record.put("seen_at", Value::TimestampMicros(1_700_000_000_000_000));
        to_avro_datum(schema, record).unwrap()
    }

    #[test]
    fn test_field_names_follow_schema_order() {
        let decoder = AvroRowDecoder::new(SCHEMA).unwrap();
        assert_eq!(decoder.field_names(), &["id", "name", "payload", "seen_at"]);
    }

    #[test]
    fn test_non_record_schema_rejected() {
        let err = AvroRowDecoder::new(r#""string""#).unwrap_err();
        assert!(matches!(err, WarehouseError::Schema(_)));
    }

    #[test]
    fn test_invalid_schema_rejected() {
        let err = AvroRowDecoder::new("{not json").unwrap_err();
        assert!(matches!(err, WarehouseError::Schema(_)));
    }

    #[test]
    fn test_decode_concatenated_datums() {
        let decoder = AvroRowDecoder::new(SCHEMA).unwrap();
        let schema = Schema::parse_str(SCHEMA).unwrap();
        let mut block = encode(&schema, 1, Some("alpha"));
        block.extend(encode(&schema, 2, None));

        let rows = decoder.decode_rows(&block, 2).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0], vec!["1", "alpha", "3q0=", "2023-11-14T22:13:20.000000Z"]);
        assert_eq!(rows[1][0], "2");
        assert_eq!(rows[1][1], "");
    }

    #[test]
    fn test_short_block_is_error() {
        let decoder = AvroRowDecoder::new(SCHEMA).unwrap();
        let schema = Schema::parse_str(SCHEMA).unwrap();
        let block = encode(&schema, 1, Some("alpha"));

        let err = decoder.decode_rows(&block, 2).unwrap_err();
        assert!(matches!(err, WarehouseError::Decode(_)));
    }

    #[test]
    fn test_trailing_bytes_are_error() {
        let decoder = AvroRowDecoder::new(SCHEMA).unwrap();
        let schema = Schema::parse_str(SCHEMA).unwrap();
        let mut block = encode(&schema, 1, Some("alpha"));
        block.extend(encode(&schema, 2, Some("beta")));

        let err = decoder.decode_rows(&block, 1).unwrap_err();
        assert!(err.to_string().contains("trailing bytes"));
    }

    #[test]
    fn test_zero_length_datums() {
        let decoder = AvroRowDecoder::new(
            r#"{"type": "record", "name": "r", "fields": [{"name": "nothing", "type": "null"}]}"#,
        )
        .unwrap();
        let rows = decoder.decode_rows(&[], 3).unwrap();
        assert_eq!(rows, vec![vec![String::new()]; 3]);
    }

    #[test]
    fn test_short_block_names_the_missing_rows() {
        let decoder = AvroRowDecoder::new(SCHEMA).unwrap();
        let schema = Schema::parse_str(SCHEMA).unwrap();
        let block = encode(&schema, 1, Some("alpha"));

        let err = decoder.decode_rows(&block, 3).unwrap_err();
        assert!(err.to_string().contains("after 1 of 3 rows"), "{}", err);
    }

    #[test]
    fn test_garbage_block_is_error() {
        let decoder = AvroRowDecoder::new(SCHEMA).unwrap();
        let err = decoder.decode_rows(&[0xff, 0xff, 0xff], 1).unwrap_err();
        assert!(matches!(err, WarehouseError::Decode(_)));
    }

    #[test]
    fn test_value_rendering() {
        assert_eq!(value_to_text(Value::Boolean(true)).unwrap(), "true");
        assert_eq!(value_to_text(Value::Double(2.5)).unwrap(), "2.5");
        assert_eq!(value_to_text(Value::Date(19_000)).unwrap(), "2022-01-08");
        assert_eq!(
            value_to_text(Value::TimestampMillis(0)).unwrap(),
            "1970-01-01T00:00:00.000Z"
        );
        assert_eq!(
            value_to_text(Value::Array(vec![Value::Long(1), Value::Long(2)])).unwrap(),
            "[1,2]"
        );
    }
}
