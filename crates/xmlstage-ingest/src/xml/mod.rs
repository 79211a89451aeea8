//! Streaming XML input
//!
//! [`RecordReader`] turns a byte stream into a lazy sequence of records
//! without ever holding more than the current element path in memory.
//! [`XmlSource`] names where the bytes come from.

pub mod parser;
pub mod reader;

pub use reader::{ReaderStats, RecordReader};

use std::fs::File;
use std::io::{BufRead, BufReader, Cursor, Read};
use std::path::{Path, PathBuf};

use flate2::read::MultiGzDecoder;

/// Input document for a run.
pub enum XmlSource {
    /// A file on disk; `*.gz` files are decompressed while streaming.
    Path(PathBuf),
    /// An already-open stream (stdin, tests).
    Reader(Box<dyn Read + Send>),
}

impl XmlSource {
    pub fn path(path: impl Into<PathBuf>) -> Self {
        XmlSource::Path(path.into())
    }

    pub fn from_reader(reader: impl Read + Send + 'static) -> Self {
        XmlSource::Reader(Box::new(reader))
    }

    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self::from_reader(Cursor::new(bytes.into()))
    }

    pub fn describe(&self) -> String {
        match self {
            XmlSource::Path(path) => path.display().to_string(),
            XmlSource::Reader(_) => "<stream>".to_string(),
        }
    }

    /// Open the source for sequential reading.
    pub fn open(self, buffer_size: usize) -> std::io::Result<Box<dyn BufRead + Send>> {
        match self {
            XmlSource::Path(path) => {
                let file = File::open(&path)?;
                if is_gzip(&path) {
                    Ok(Box::new(BufReader::with_capacity(
                        buffer_size,
                        MultiGzDecoder::new(file),
                    )))
                } else {
                    Ok(Box::new(BufReader::with_capacity(buffer_size, file)))
                }
            },
            XmlSource::Reader(reader) => Ok(Box::new(BufReader::with_capacity(buffer_size, reader))),
        }
    }
}

impl std::fmt::Debug for XmlSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("XmlSource").field(&self.describe()).finish()
    }
}

fn is_gzip(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("gz"))
}
