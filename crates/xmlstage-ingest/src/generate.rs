//! Synthetic input generator
//!
//! Produces documents in the shape the reader expects:
//!
//! ```xml
//! <xml>
//!   <group_event id="1" name="Group 1">
//!     <event id="1">Event 1</event>
//!   </group_event>
//! </xml>
//! ```
//!
//! Event ids are global and consecutive so every generated row has a unique
//! natural key.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;

use crate::config::XmlConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampleSpec {
    pub groups: u64,
    pub events_per_group: u64,
    /// First group id. Events of group `g` get ids
    /// `(g - 1) * events_per_group + 1 ..= g * events_per_group`.
    pub first_id: u64,
}

impl Default for SampleSpec {
    fn default() -> Self {
        Self {
            groups: 1_000,
            events_per_group: 10,
            first_id: 1,
        }
    }
}

impl SampleSpec {
    pub fn new(groups: u64, events_per_group: u64) -> Self {
        Self {
            groups,
            events_per_group,
            ..Self::default()
        }
    }

    pub fn total_records(&self) -> u64 {
        self.groups.saturating_mul(self.events_per_group.saturating_add(1))
    }

    /// Highest group and event ids the document will contain, or `None` when
    /// they do not fit a `BIGINT` key.
    pub fn last_ids(&self) -> Option<(u64, u64)> {
        let groups_before = self.first_id.checked_sub(1)?;
        let last_group = groups_before.checked_add(self.groups)?;
        let last_event = last_group.checked_mul(self.events_per_group)?;
        let limit = i64::MAX as u64;
        (last_group <= limit && last_event <= limit).then_some((last_group, last_event))
    }

    pub fn validate(&self) -> io::Result<()> {
        if self.first_id == 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "first id must be at least 1"));
        }
        if self.last_ids().is_none() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "{} groups of {} events starting at id {} overflow a BIGINT key",
                    self.groups, self.events_per_group, self.first_id
                ),
            ));
        }
        Ok(())
    }
}

/// Write a sample document to `out`.
pub fn write_sample<W: Write>(out: &mut W, spec: &SampleSpec, xml: &XmlConfig) -> io::Result<()> {
    spec.validate()?;
    let (group, event) = (&xml.group_tag, &xml.event_tag);
    let mut event_id = (spec.first_id - 1) * spec.events_per_group + 1;

    writeln!(out, r#"<?xml version="1.0" encoding="UTF-8"?>"#)?;
    writeln!(out, "<xml>")?;
    for group_id in spec.first_id..spec.first_id + spec.groups {
        writeln!(out, r#"  <{group} id="{group_id}" name="Group {group_id}">"#)?;
        for _ in 0..spec.events_per_group {
            writeln!(out, r#"    <{event} id="{event_id}">Event {event_id}</{event}>"#)?;
            event_id += 1;
        }
        writeln!(out, "  </{group}>")?;
    }
    writeln!(out, "</xml>")?;
    out.flush()
}

/// Generate a sample document in memory.
pub fn sample_bytes(spec: &SampleSpec, xml: &XmlConfig) -> Vec<u8> {
    let mut out = Vec::new();
    // Only an out-of-range spec fails here, leaving the buffer empty.
    let _ = write_sample(&mut out, spec, xml);
    out
}

/// Generate a sample file; returns bytes written.
pub fn write_sample_file(path: &Path, spec: &SampleSpec, xml: &XmlConfig) -> io::Result<u64> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let mut out = BufWriter::new(File::create(path)?);
    write_sample(&mut out, spec, xml)?;
    drop(out);
    Ok(std::fs::metadata(path)?.len())
}
