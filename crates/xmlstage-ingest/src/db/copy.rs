//! COPY text-format encoding
//!
//! Rows are tab separated, NULL is `\N`, and backslash, tab, newline,
//! carriage return, backspace, form feed and vertical tab inside values are
//! backslash escaped.

use crate::config::TableNames;
use crate::record::{Batch, BatchId, EntityKind, FieldValue, Record};

/// One batch, encoded and addressed, ready for the bulk-copy sink. Built
/// once per batch and reused across retries.
#[derive(Debug, Clone)]
pub struct CopyRequest {
    pub batch_id: BatchId,
    pub kind: EntityKind,
    pub table: String,
    pub columns: &'static [&'static str],
    pub rows: usize,
    pub payload: Vec<u8>,
}

impl CopyRequest {
    pub fn for_batch(batch: &Batch, tables: &TableNames) -> Self {
        Self {
            batch_id: batch.id(),
            kind: batch.kind(),
            table: tables.staging_table(batch.kind()),
            columns: batch.kind().columns(),
            rows: batch.len(),
            payload: encode_records(batch.records(), batch.bytes_estimate()),
        }
    }

    pub fn statement(&self) -> String {
        copy_statement(&self.table, self.columns)
    }
}

pub fn copy_statement(table: &str, columns: &[&str]) -> String {
    format!(
        "COPY {} ({}) FROM STDIN WITH (FORMAT text, DELIMITER E'\\t', NULL '\\N')",
        table,
        columns.join(", ")
    )
}

/// Encode records as COPY text rows.
pub fn encode_records(records: &[Record], size_hint: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(size_hint + size_hint / 16);
    for record in records {
        encode_row(&mut out, record.values());
    }
    out
}

pub fn encode_row(out: &mut Vec<u8>, values: &[FieldValue]) {
    for (i, value) in values.iter().enumerate() {
        if i > 0 {
            out.push(b'\t');
        }
        encode_value(out, value);
    }
    out.push(b'\n');
}

fn encode_value(out: &mut Vec<u8>, value: &FieldValue) {
    match value {
        FieldValue::Null => out.extend_from_slice(b"\\N"),
        FieldValue::Int(v) => out.extend_from_slice(v.to_string().as_bytes()),
        FieldValue::Float(v) if v.is_nan() => out.extend_from_slice(b"NaN"),
        FieldValue::Float(v) if v.is_infinite() => {
            let text: &[u8] = if *v > 0.0 { b"Infinity" } else { b"-Infinity" };
            out.extend_from_slice(text);
        },
        FieldValue::Float(v) => out.extend_from_slice(v.to_string().as_bytes()),
        FieldValue::Bool(v) => out.push(if *v { b't' } else { b'f' }),
        FieldValue::Text(s) => escape_text(out, s),
    }
}

fn escape_text(out: &mut Vec<u8>, s: &str) {
    for &b in s.as_bytes() {
        match b {
            b'\\' => out.extend_from_slice(b"\\\\"),
            b'\t' => out.extend_from_slice(b"\\t"),
            b'\n' => out.extend_from_slice(b"\\n"),
            b'\r' => out.extend_from_slice(b"\\r"),
            0x08 => out.extend_from_slice(b"\\b"),
            0x0c => out.extend_from_slice(b"\\f"),
            0x0b => out.extend_from_slice(b"\\v"),
            _ => out.push(b),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::record::SourcePosition;

    fn encoded(values: &[FieldValue]) -> String {
        let mut out = Vec::new();
        encode_row(&mut out, values);
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn test_null_and_scalars() {
        assert_eq!(
            encoded(&[FieldValue::Int(-3), FieldValue::Null, FieldValue::Bool(true)]),
            "-3\t\\N\tt\n"
        );
        assert_eq!(
            encoded(&[FieldValue::Float(1.5), FieldValue::Float(f64::NEG_INFINITY)]),
            "1.5\t-Infinity\n"
        );
    }

    #[test]
    fn test_special_characters_are_escaped() {
        let text = FieldValue::Text("a\tb\nc\\d\re\u{8}\u{c}\u{b}".into());
        assert_eq!(encoded(&[text]), "a\\tb\\nc\\\\d\\re\\b\\f\\v\n");
    }

    #[test]
    fn test_literal_backslash_n_is_not_null() {
        assert_eq!(encoded(&[FieldValue::Text("\\N".into())]), "\\\\N\n");
    }

    #[test]
    fn test_request_for_batch() {
        let records = vec![
            Record::event(1, 9, Some("Event 1".into()), SourcePosition::default()),
            Record::event(2, 9, None, SourcePosition::default()),
        ];
        let batch = Batch::new(7, EntityKind::Event, records, 0);
        let request = CopyRequest::for_batch(&batch, &TableNames::default());

        assert_eq!(request.batch_id, 7);
        assert_eq!(request.rows, 2);
        assert_eq!(request.table, "stg_event");
        assert_eq!(
            String::from_utf8(request.payload.clone()).unwrap(),
            "1\t9\tEvent 1\n2\t9\t\\N\n"
        );
        assert_eq!(
            request.statement(),
            "COPY stg_event (id, group_event_id, name) FROM STDIN WITH (FORMAT text, DELIMITER E'\\t', NULL '\\N')"
        );
    }
}
