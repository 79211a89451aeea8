//! Pull-based record reader
//!
//! Wraps a `quick_xml::Reader` and walks the document one event at a time,
//! keeping only a stack of open elements. An event record is emitted when its
//! element closes; a group record is emitted when the group closes, after all
//! of its events.
//!
//! End-tag matching is done here rather than by quick-xml, which is told to
//! accept unmatched end tags. A missing close tag inside a group is reported
//! against the element it belongs to and parsing resumes at the enclosing
//! element; a stray end tag is reported and dropped. Lexical errors from the
//! tokenizer itself cannot be resynchronized and end the stream.

use std::collections::VecDeque;
use std::io::BufRead;

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use serde::Serialize;

use super::parser::{clean_text, group_fields, required_id};
use crate::config::XmlConfig;
use crate::error::ParseError;
use crate::record::{EntityKind, Record, SourcePosition};

/// Counters kept by the reader while it walks the document.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReaderStats {
    pub groups_seen: u64,
    pub groups_emitted: u64,
    pub events_emitted: u64,
    /// Elements reported as malformed.
    pub skipped: u64,
}

struct GroupFrame {
    id: i64,
    name: Option<String>,
    position: SourcePosition,
}

struct EventFrame {
    id: Result<i64, String>,
    group_event_id: i64,
    text: String,
    text_error: Option<String>,
    position: SourcePosition,
}

enum Frame {
    Group(GroupFrame),
    /// A group without a usable id. Everything inside it is swallowed.
    SkippedGroup {
        reason: String,
        position: SourcePosition,
        nested_events: u64,
    },
    Event(EventFrame),
    Other(Vec<u8>),
}

type Item = Result<Record, ParseError>;

/// Lazy, forward-only iterator of records. Not restartable: open the source
/// again to start over.
pub struct RecordReader<R: BufRead> {
    reader: Reader<R>,
    buf: Vec<u8>,
    group_tag: Vec<u8>,
    event_tag: Vec<u8>,
    stack: Vec<Frame>,
    skipped_groups_open: usize,
    pending: VecDeque<Item>,
    element_index: u64,
    stats: ReaderStats,
    finished: bool,
}

impl<R: BufRead> RecordReader<R> {
    pub fn new(input: R, xml: &XmlConfig) -> Self {
        let mut reader = Reader::from_reader(input);
        let config = reader.config_mut();
        config.check_end_names = false;
        config.allow_unmatched_ends = true;
        config.expand_empty_elements = false;
        config.trim_text(false);

        Self {
            reader,
            buf: Vec::with_capacity(1024),
            group_tag: xml.group_tag.as_bytes().to_vec(),
            event_tag: xml.event_tag.as_bytes().to_vec(),
            stack: Vec::new(),
            skipped_groups_open: 0,
            pending: VecDeque::new(),
            element_index: 0,
            stats: ReaderStats::default(),
            finished: false,
        }
    }

    pub fn stats(&self) -> ReaderStats {
        self.stats
    }

    fn source_position(&self, byte_offset: u64) -> SourcePosition {
        SourcePosition {
            byte_offset,
            element_index: self.element_index,
        }
    }

    /// Reads until at least one item is queued or the document ends.
    fn advance(&mut self) {
        while self.pending.is_empty() && !self.finished {
            let offset = self.reader.buffer_position() as u64;
            let mut buf = std::mem::take(&mut self.buf);
            buf.clear();

            match self.reader.read_event_into(&mut buf) {
                Err(e) => {
                    let at = SourcePosition {
                        byte_offset: self.reader.error_position() as u64,
                        element_index: self.element_index,
                    };
                    self.fail(ParseError::fatal(at, e.to_string()));
                },
                Ok(Event::Start(start)) => self.open(&start, offset),
                Ok(Event::Empty(start)) => {
                    self.open(&start, offset);
                    self.close_top();
                },
                Ok(Event::End(end)) => self.close(end.name().as_ref(), offset),
                Ok(Event::Text(text)) => {
                    if let Some(Frame::Event(frame)) = self.stack.last_mut() {
                        match text.unescape() {
                            Ok(s) => frame.text.push_str(&s),
                            Err(e) => {
                                frame.text_error.get_or_insert_with(|| e.to_string());
                            },
                        }
                    }
                },
                Ok(Event::CData(data)) => {
                    if let Some(Frame::Event(frame)) = self.stack.last_mut() {
                        frame.text.push_str(&String::from_utf8_lossy(&data));
                    }
                },
                Ok(Event::Eof) => {
                    if self.stack.is_empty() {
                        self.finished = true;
                    } else {
                        let at = self.source_position(offset);
                        let open = self.stack.len();
                        self.fail(ParseError::fatal(
                            at,
                            format!("document ended with {} unclosed element(s)", open),
                        ));
                    }
                },
                Ok(_) => {},
            }

            self.buf = buf;
        }
    }

    fn fail(&mut self, error: ParseError) {
        self.stats.skipped += 1;
        self.pending.push_back(Err(error));
        self.finished = true;
        self.stack.clear();
    }

    fn reject(&mut self, error: ParseError) {
        self.stats.skipped += 1;
        self.pending.push_back(Err(error));
    }

    fn nearest_group_id(&self) -> Option<i64> {
        self.stack.iter().rev().find_map(|frame| match frame {
            Frame::Group(group) => Some(group.id),
            _ => None,
        })
    }

    fn inside_group(&self) -> bool {
        self.skipped_groups_open > 0 || self.nearest_group_id().is_some()
    }

    fn open(&mut self, start: &BytesStart<'_>, offset: u64) {
        self.element_index += 1;
        let position = self.source_position(offset);
        let name = start.name().as_ref().to_vec();

        if self.skipped_groups_open > 0 {
            if name == self.event_tag {
                if let Some(Frame::SkippedGroup { nested_events, .. }) = self
                    .stack
                    .iter_mut()
                    .rev()
                    .find(|f| matches!(f, Frame::SkippedGroup { .. }))
                {
                    *nested_events += 1;
                }
            }
            self.stack.push(Frame::Other(name));
            return;
        }

        if name == self.group_tag {
            self.stats.groups_seen += 1;
            match group_fields(start) {
                Ok((id, name)) => self.stack.push(Frame::Group(GroupFrame { id, name, position })),
                Err(reason) => {
                    self.skipped_groups_open += 1;
                    self.stack.push(Frame::SkippedGroup {
                        reason,
                        position,
                        nested_events: 0,
                    });
                },
            }
            return;
        }

        let in_event = matches!(self.stack.last(), Some(Frame::Event(_)));
        if name == self.event_tag && !in_event {
            if let Some(group_event_id) = self.nearest_group_id() {
                self.stack.push(Frame::Event(EventFrame {
                    id: required_id(start),
                    group_event_id,
                    text: String::new(),
                    text_error: None,
                    position,
                }));
                return;
            }
        }

        self.stack.push(Frame::Other(name));
    }

    fn close(&mut self, name: &[u8], offset: u64) {
        let Some(depth) = self.stack.iter().rposition(|f| self.frame_name(f) == name) else {
            if self.inside_group() {
                let at = self.source_position(offset);
                self.reject(ParseError::recoverable(
                    None,
                    at,
                    format!("unexpected end tag </{}>", String::from_utf8_lossy(name)),
                ));
            }
            return;
        };

        while self.stack.len() > depth + 1 {
            self.abandon_top(offset);
        }
        self.close_top();
    }

    fn frame_name<'a>(&'a self, frame: &'a Frame) -> &'a [u8] {
        match frame {
            Frame::Group(_) | Frame::SkippedGroup { .. } => &self.group_tag,
            Frame::Event(_) => &self.event_tag,
            Frame::Other(name) => name,
        }
    }

    /// Pops an element whose end tag never arrived.
    fn abandon_top(&mut self, offset: u64) {
        let Some(frame) = self.stack.pop() else {
            return;
        };
        let at = self.source_position(offset);
        match frame {
            Frame::Event(event) => self.reject(ParseError::recoverable(
                Some(EntityKind::Event),
                event.position,
                format!("<{}> is never closed (detected at {})", self.event_tag_str(), at),
            )),
            Frame::Group(group) => self.reject(ParseError::recoverable(
                Some(EntityKind::Group),
                group.position,
                format!("<{}> id={} is never closed (detected at {})", self.group_tag_str(), group.id, at),
            )),
            Frame::SkippedGroup { reason, position, nested_events } => {
                self.skipped_groups_open -= 1;
                self.reject(ParseError::recoverable(
                    Some(EntityKind::Group),
                    position,
                    format!("{}; group is never closed, {} nested event(s) skipped", reason, nested_events),
                ));
            },
            Frame::Other(_) => {},
        }
    }

    /// Pops a properly closed element and emits its outcome.
    fn close_top(&mut self) {
        let Some(frame) = self.stack.pop() else {
            return;
        };
        match frame {
            Frame::Group(group) => {
                self.stats.groups_emitted += 1;
                self.pending
                    .push_back(Ok(Record::group(group.id, group.name, group.position)));
            },
            Frame::SkippedGroup { reason, position, nested_events } => {
                self.skipped_groups_open -= 1;
                self.reject(ParseError::recoverable(
                    Some(EntityKind::Group),
                    position,
                    format!("{}; {} nested event(s) skipped", reason, nested_events),
                ));
            },
            Frame::Event(event) => match (event.id, event.text_error) {
                (Ok(id), None) => {
                    self.stats.events_emitted += 1;
                    self.pending.push_back(Ok(Record::event(
                        id,
                        event.group_event_id,
                        clean_text(&event.text),
                        event.position,
                    )));
                },
                (Err(reason), _) | (Ok(_), Some(reason)) => self.reject(ParseError::recoverable(
                    Some(EntityKind::Event),
                    event.position,
                    reason,
                )),
            },
            Frame::Other(_) => {},
        }
    }

    fn group_tag_str(&self) -> String {
        String::from_utf8_lossy(&self.group_tag).into_owned()
    }

    fn event_tag_str(&self) -> String {
        String::from_utf8_lossy(&self.event_tag).into_owned()
    }
}

impl<R: BufRead> Iterator for RecordReader<R> {
    type Item = Item;

    fn next(&mut self) -> Option<Self::Item> {
        self.advance();
        self.pending.pop_front()
    }
}
