//! Record model shared by every pipeline stage
//!
//! A [`Record`] is one parsed entity. It is built once by the XML reader and
//! then moved, never shared, from the producer to the batcher to a loader
//! worker. A [`Batch`] is an ordered run of records of a single kind, sized
//! by the batcher and consumed exactly once.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Entity kinds extracted from the document.
///
/// Declaration order is dependency order: events reference groups, so groups
/// are finalized first.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Group,
    Event,
}

const GROUP_COLUMNS: &[&str] = &["id", "name"];
const EVENT_COLUMNS: &[&str] = &["id", "group_event_id", "name"];

impl EntityKind {
    /// Every kind, parents before children.
    pub const ALL: [EntityKind; 2] = [EntityKind::Group, EntityKind::Event];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Group => "group",
            EntityKind::Event => "event",
        }
    }

    /// Column order used for staging rows and final tables.
    pub fn columns(&self) -> &'static [&'static str] {
        match self {
            EntityKind::Group => GROUP_COLUMNS,
            EntityKind::Event => EVENT_COLUMNS,
        }
    }

    pub fn natural_key(&self) -> &'static str {
        "id"
    }

    /// The referenced kind and the referencing column, if any.
    pub fn parent(&self) -> Option<(EntityKind, &'static str)> {
        match self {
            EntityKind::Group => None,
            EntityKind::Event => Some((EntityKind::Group, "group_event_id")),
        }
    }

    pub(crate) fn index(&self) -> usize {
        match self {
            EntityKind::Group => 0,
            EntityKind::Event => 1,
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A typed scalar field value.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum FieldValue {
    Null,
    Int(i64),
    Float(f64),
    Bool(bool),
    Text(String),
}

impl FieldValue {
    pub fn is_null(&self) -> bool {
        matches!(self, FieldValue::Null)
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            FieldValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            FieldValue::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Approximate width of this value in a COPY text row. NULL is `\N`.
    pub fn encoded_len(&self) -> usize {
        match self {
            FieldValue::Null => 2,
            FieldValue::Int(v) => decimal_len(*v),
            FieldValue::Float(v) => v.to_string().len(),
            FieldValue::Bool(_) => 1,
            FieldValue::Text(s) => s.len(),
        }
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        FieldValue::Int(value)
    }
}

impl From<Option<String>> for FieldValue {
    fn from(value: Option<String>) -> Self {
        value.map_or(FieldValue::Null, FieldValue::Text)
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::Text(value.to_string())
    }
}

fn decimal_len(v: i64) -> usize {
    let sign = usize::from(v < 0);
    let mut n = v.unsigned_abs();
    let mut digits = 1;
    while n >= 10 {
        n /= 10;
        digits += 1;
    }
    digits + sign
}

/// Where in the input a record came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SourcePosition {
    /// Offset in the decoded (decompressed) byte stream.
    pub byte_offset: u64,
    /// 1-based ordinal of the element among all start tags seen.
    pub element_index: u64,
}

impl fmt::Display for SourcePosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "byte {} (element #{})", self.byte_offset, self.element_index)
    }
}

/// One parsed entity. Values follow [`EntityKind::columns`] order.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    kind: EntityKind,
    values: Vec<FieldValue>,
    position: SourcePosition,
}

impl Record {
    pub fn group(id: i64, name: Option<String>, position: SourcePosition) -> Self {
        Self {
            kind: EntityKind::Group,
            values: vec![FieldValue::Int(id), name.into()],
            position,
        }
    }

    pub fn event(
        id: i64,
        group_event_id: i64,
        name: Option<String>,
        position: SourcePosition,
    ) -> Self {
        Self {
            kind: EntityKind::Event,
            values: vec![
                FieldValue::Int(id),
                FieldValue::Int(group_event_id),
                name.into(),
            ],
            position,
        }
    }

    pub fn kind(&self) -> EntityKind {
        self.kind
    }

    pub fn position(&self) -> SourcePosition {
        self.position
    }

    pub fn values(&self) -> &[FieldValue] {
        &self.values
    }

    /// Look a field up by column name.
    pub fn get(&self, field: &str) -> Option<&FieldValue> {
        self.kind
            .columns()
            .iter()
            .position(|c| *c == field)
            .and_then(|i| self.values.get(i))
    }

    pub fn fields(&self) -> impl Iterator<Item = (&'static str, &FieldValue)> + '_ {
        self.kind.columns().iter().copied().zip(self.values.iter())
    }

    /// Natural key value.
    pub fn key(&self) -> Option<i64> {
        self.get(self.kind.natural_key()).and_then(FieldValue::as_int)
    }

    /// Estimated size of the staging row: fields, tab separators, newline.
    pub fn estimated_size(&self) -> usize {
        let fields: usize = self.values.iter().map(FieldValue::encoded_len).sum();
        fields + self.values.len().saturating_sub(1) + 1
    }
}

/// Batch identifiers are unique within a run and start at 1.
pub type BatchId = u64;

/// An ordered group of same-kind records, loaded as one COPY.
#[derive(Debug, Clone)]
pub struct Batch {
    id: BatchId,
    kind: EntityKind,
    records: Vec<Record>,
    bytes_estimate: usize,
}

impl Batch {
    pub fn new(id: BatchId, kind: EntityKind, records: Vec<Record>, bytes_estimate: usize) -> Self {
        Self {
            id,
            kind,
            records,
            bytes_estimate,
        }
    }

    pub fn id(&self) -> BatchId {
        self.id
    }

    pub fn kind(&self) -> EntityKind {
        self.kind
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn bytes_estimate(&self) -> usize {
        self.bytes_estimate
    }

    pub fn records(&self) -> &[Record] {
        &self.records
    }

    pub fn into_records(self) -> Vec<Record> {
        self.records
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_event_fields_follow_column_order() {
        let record = Record::event(10, 1, Some("Event 10".into()), SourcePosition::default());
        let names: Vec<_> = record.fields().map(|(name, _)| name).collect();
        assert_eq!(names, vec!["id", "group_event_id", "name"]);
        assert_eq!(record.get("group_event_id"), Some(&FieldValue::Int(1)));
        assert_eq!(record.key(), Some(10));
        assert_eq!(record.get("missing"), None);
    }

    #[test]
    fn test_estimated_size_matches_copy_row_width() {
        // "1\tAlpha\n"
        let named = Record::group(1, Some("Alpha".into()), SourcePosition::default());
        assert_eq!(named.estimated_size(), 8);

        // "-42\t\\N\n"
        let unnamed = Record::group(-42, None, SourcePosition::default());
        assert_eq!(unnamed.estimated_size(), 7);
    }

    #[test]
    fn test_decimal_len() {
        assert_eq!(decimal_len(0), 1);
        assert_eq!(decimal_len(9), 1);
        assert_eq!(decimal_len(10), 2);
        assert_eq!(decimal_len(-100), 4);
        assert_eq!(decimal_len(i64::MIN), 20);
    }

    #[test]
    fn test_kind_order_is_dependency_order() {
        assert_eq!(EntityKind::ALL, [EntityKind::Group, EntityKind::Event]);
        assert!(EntityKind::Group < EntityKind::Event);
        assert_eq!(EntityKind::Event.parent(), Some((EntityKind::Group, "group_event_id")));
        assert_eq!(EntityKind::Group.parent(), None);
    }
}
