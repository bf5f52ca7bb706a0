//! Record source
//!
//! Reads a CSV file lazily, one [`Record`] per data row. The first row is the
//! header and fixes the column set for the whole run. Rows whose field count
//! differs from the header's are still produced; they carry a [`RowDefect`]
//! so the ingestor can report them instead of sending them.
//!
//! [`estimate_rows`] is a separate, cheap pass used only for progress display.

use csv::{ByteRecord, Reader, ReaderBuilder};
use serde::ser::{SerializeMap, Serializer};
use serde::Serialize;
use std::collections::HashSet;
use std::fmt;
use std::fs::File;
use std::io::{ErrorKind, Read};
use std::iter::FusedIterator;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

use crate::error::{IngestError, Result};

/// Field-count mismatch between a row and the header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RowDefect {
    pub expected: usize,
    pub found: usize,
}

/// One data row as an ordered column → value mapping
///
/// Columns are shared between all records of a source. Short rows map only
/// the columns they have values for; surplus values on long rows are kept in
/// [`Record::values`] but are not part of the mapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    line: u64,
    columns: Arc<[String]>,
    values: Vec<String>,
}

impl Record {
    /// Build a record directly, e.g. for tests or non-file sources
    pub fn new(line: u64, columns: Arc<[String]>, values: Vec<String>) -> Self {
        Self {
            line,
            columns,
            values,
        }
    }

    /// 1-based line in the source file where this row starts
    pub fn line(&self) -> u64 {
        self.line
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Raw cell values in file order, including surplus ones
    pub fn values(&self) -> &[String] {
        &self.values
    }

    pub fn get(&self, column: &str) -> Option<&str> {
        self.iter().find(|(name, _)| *name == column).map(|(_, value)| value)
    }

    /// Column/value pairs in header order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.columns
            .iter()
            .zip(self.values.iter())
            .map(|(name, value)| (name.as_str(), value.as_str()))
    }

    pub fn defect(&self) -> Option<RowDefect> {
        (self.values.len() != self.columns.len()).then(|| RowDefect {
            expected: self.columns.len(),
            found: self.values.len(),
        })
    }

    /// Rough size of the serialized document, used for batch byte budgets
    pub fn estimated_size(&self) -> usize {
        // braces plus, per field: two pairs of quotes, a colon and a comma
        2 + self
            .iter()
            .map(|(name, value)| name.len() + value.len() + 6)
            .sum::<usize>()
    }
}

impl Serialize for Record {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let len = self.columns.len().min(self.values.len());
        let mut map = serializer.serialize_map(Some(len))?;
        for (name, value) in self.iter() {
            map.serialize_entry(name, value)?;
        }
        map.end()
    }
}

/// Advisory number of data rows, or an explicit "unknown"
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExpectedTotal {
    Known(u64),
    #[default]
    Unknown,
}

impl ExpectedTotal {
    pub fn known(self) -> Option<u64> {
        match self {
            ExpectedTotal::Known(total) => Some(total),
            ExpectedTotal::Unknown => None,
        }
    }
}

impl fmt::Display for ExpectedTotal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExpectedTotal::Known(total) => write!(f, "{total}"),
            ExpectedTotal::Unknown => f.write_str("unknown"),
        }
    }
}

impl Serialize for ExpectedTotal {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.known().serialize(serializer)
    }
}

/// Count data rows by scanning the file once (lines minus the header)
///
/// Quoted cells spanning several lines make this an over-estimate. If the
/// file cannot be read the result is [`ExpectedTotal::Unknown`]; this never
/// fails the run.
pub fn estimate_rows(path: impl AsRef<Path>) -> ExpectedTotal {
    let path = path.as_ref();
    match count_lines(path) {
        Ok(lines) => ExpectedTotal::Known(lines.saturating_sub(1)),
        Err(err) => {
            debug!(path = %path.display(), error = %err, "Row estimate unavailable");
            ExpectedTotal::Unknown
        },
    }
}

fn count_lines(path: &Path) -> std::io::Result<u64> {
    let mut file = File::open(path)?;
    let mut buf = vec![0u8; 64 * 1024];
    let mut lines = 0u64;
    let mut last = None;

    loop {
        let n = match file.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        };
        lines += buf[..n].iter().filter(|byte| **byte == b'\n').count() as u64;
        last = Some(buf[n - 1]);
    }

    if matches!(last, Some(byte) if byte != b'\n') {
        lines += 1;
    }
    Ok(lines)
}

/// A read failure in the middle of the file; it ends the record sequence
#[derive(Error, Debug, Clone)]
#[error("read failed after line {line}: {message}")]
pub struct ReadError {
    pub line: u64,
    pub message: String,
}

/// Lazy, single-pass sequence of records from a CSV file
///
/// Consuming the iterator consumes the source; once it returns `None` (or a
/// [`ReadError`]) it stays closed.
pub struct RecordSource<R = File> {
    path: PathBuf,
    columns: Arc<[String]>,
    reader: Reader<R>,
    buffer: ByteRecord,
    last_line: u64,
    closed: bool,
}

impl RecordSource<File> {
    /// Open `path` and validate its header
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let file = File::open(&path).map_err(|source| IngestError::SourceNotFound {
            path: path.clone(),
            source,
        })?;
        let is_file = file.metadata().map(|meta| meta.is_file()).unwrap_or(false);
        if !is_file {
            return Err(IngestError::SourceNotFound {
                source: std::io::Error::new(ErrorKind::InvalidInput, "not a regular file"),
                path,
            });
        }

        Self::from_reader(path, file)
    }
}

impl<R: Read> RecordSource<R> {
    /// Read CSV from any byte stream; `path` only labels logs and errors
    pub fn from_reader(path: impl Into<PathBuf>, input: R) -> Result<Self> {
        let path = path.into();
        let mut reader = ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .from_reader(input);

        let header = reader
            .byte_headers()
            .map_err(|err| IngestError::malformed(&path, format!("unreadable header: {err}")))?
            .clone();
        let columns = parse_header(&header).map_err(|reason| IngestError::malformed(&path, reason))?;

        info!(
            path = %path.display(),
            columns = columns.len(),
            "Opened source"
        );

        Ok(Self {
            path,
            columns: columns.into(),
            reader,
            buffer: ByteRecord::new(),
            last_line: 1,
            closed: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Column names from the header, in file order
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// True once the sequence is exhausted or has failed
    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

fn parse_header(header: &ByteRecord) -> std::result::Result<Vec<String>, String> {
    if header.is_empty() {
        return Err("missing header row".to_string());
    }

    let mut seen = HashSet::with_capacity(header.len());
    let mut columns = Vec::with_capacity(header.len());
    for (position, raw) in header.iter().enumerate() {
        let name = std::str::from_utf8(raw)
            .map_err(|_| format!("column {} is not valid UTF-8", position + 1))?;
        if name.trim().is_empty() {
            return Err(format!("column {} has a blank name", position + 1));
        }
        if !seen.insert(name) {
            return Err(format!("duplicate column '{name}'"));
        }
        columns.push(name.to_string());
    }
    Ok(columns)
}

impl<R: Read> Iterator for RecordSource<R> {
    type Item = std::result::Result<Record, ReadError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.closed {
            return None;
        }

        match self.reader.read_byte_record(&mut self.buffer) {
            Ok(true) => {
                let line = self
                    .buffer
                    .position()
                    .map_or(self.last_line + 1, |pos| pos.line());
                self.last_line = line;
                let values = self
                    .buffer
                    .iter()
                    .map(|cell| String::from_utf8_lossy(cell).into_owned())
                    .collect();
                Some(Ok(Record::new(line, Arc::clone(&self.columns), values)))
            },
            Ok(false) => {
                self.closed = true;
                None
            },
            Err(err) => {
                self.closed = true;
                Some(Err(ReadError {
                    line: self.last_line,
                    message: err.to_string(),
                }))
            },
        }
    }
}

impl<R: Read> FusedIterator for RecordSource<R> {}

impl<R> fmt::Debug for RecordSource<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecordSource")
            .field("path", &self.path)
            .field("columns", &self.columns)
            .field("closed", &self.closed)
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn csv_file(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn test_reads_records_in_file_order() {
        let file = csv_file("name,city\nada,london\ngrace,\"new york, ny\"\n");
        let source = RecordSource::open(file.path()).unwrap();
        assert_eq!(source.columns(), ["name", "city"]);

        let records: Vec<Record> = source.map(|r| r.unwrap()).collect();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].get("name"), Some("ada"));
        assert_eq!(records[1].get("city"), Some("new york, ny"));
        assert_eq!(records[0].line(), 2);
        assert_eq!(records[1].line(), 3);
        assert!(records.iter().all(|r| r.defect().is_none()));
    }

    #[test]
    fn test_short_row_is_kept_with_defect() {
        let file = csv_file("a,b,c\n1,2,3\n4,5\n");
        let records: Vec<Record> = RecordSource::open(file.path())
            .unwrap()
            .map(|r| r.unwrap())
            .collect();

        assert_eq!(records.len(), 2);
        assert_eq!(
            records[1].defect(),
            Some(RowDefect {
                expected: 3,
                found: 2
            })
        );
        assert_eq!(records[1].get("b"), Some("5"));
        assert_eq!(records[1].get("c"), None);
    }

    #[test]
    fn test_invalid_utf8_cells_are_replaced() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"id,name\n1,caf\xe9\n2,\xff\xfe\n").unwrap();
        file.flush().unwrap();

        let records: Vec<Record> = RecordSource::open(file.path())
            .unwrap()
            .map(|r| r.unwrap())
            .collect();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].get("name"), Some("caf\u{FFFD}"));
        assert_eq!(records[1].get("name"), Some("\u{FFFD}\u{FFFD}"));
        assert!(records.iter().all(|r| r.defect().is_none()));
    }

    /// Serves `data` once, then fails every read
    struct FailsAfter {
        data: std::io::Cursor<Vec<u8>>,
    }

    impl Read for FailsAfter {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            match self.data.read(buf)? {
                0 => Err(std::io::Error::other("device went away")),
                n => Ok(n),
            }
        }
    }

    #[test]
    fn test_read_error_closes_the_source() {
        let input = FailsAfter {
            data: std::io::Cursor::new(b"id,name\n1,ada\n2,grace\n".to_vec()),
        };
        let mut source = RecordSource::from_reader("people.csv", input).unwrap();

        assert_eq!(source.next().unwrap().unwrap().get("name"), Some("ada"));
        assert_eq!(source.next().unwrap().unwrap().get("name"), Some("grace"));

        let err = source.next().unwrap().unwrap_err();
        assert_eq!(err.line, 3);
        assert!(err.message.contains("device went away"), "got {err}");
        assert!(source.is_closed());
        assert!(source.next().is_none());
    }

    #[test]
    fn test_missing_file_is_source_not_found() {
        let err = RecordSource::open("/definitely/not/here.csv").unwrap_err();
        assert!(matches!(err, IngestError::SourceNotFound { .. }));
    }

    #[test]
    fn test_directory_is_source_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let err = RecordSource::open(dir.path()).unwrap_err();
        assert!(matches!(err, IngestError::SourceNotFound { .. }));
    }

    #[test]
    fn test_malformed_headers() {
        for contents in ["", "id,name,id\n1,a,2\n", "id,,name\n"] {
            let file = csv_file(contents);
            let err = RecordSource::open(file.path()).unwrap_err();
            assert!(
                matches!(err, IngestError::MalformedSource { .. }),
                "expected malformed source for {contents:?}, got {err}"
            );
        }
    }

    #[test]
    fn test_header_only_file_yields_nothing() {
        let file = csv_file("id,name\n");
        let mut source = RecordSource::open(file.path()).unwrap();
        assert!(!source.is_closed());
        assert!(source.next().is_none());
        assert!(source.is_closed());
        assert!(source.next().is_none());
    }

    #[test]
    fn test_record_serializes_in_header_order() {
        let columns: Arc<[String]> = vec!["zeta".to_string(), "alpha".to_string()].into();
        let record = Record::new(2, columns, vec!["1".to_string(), "2".to_string()]);
        let json = serde_json::to_string(&record).unwrap();
        assert_eq!(json, r#"{"zeta":"1","alpha":"2"}"#);
    }

    #[test]
    fn test_estimate_rows() {
        assert_eq!(estimate_rows(csv_file("a,b\n1,2\n3,4\n").path()), ExpectedTotal::Known(2));
        assert_eq!(estimate_rows(csv_file("a,b\n1,2\n3,4").path()), ExpectedTotal::Known(2));
        assert_eq!(estimate_rows(csv_file("a,b\n").path()), ExpectedTotal::Known(0));
        assert_eq!(estimate_rows(csv_file("").path()), ExpectedTotal::Known(0));
        assert_eq!(estimate_rows("/no/such/file.csv"), ExpectedTotal::Unknown);
    }

    #[test]
    fn test_expected_total_display() {
        assert_eq!(ExpectedTotal::Known(12).to_string(), "12");
        assert_eq!(ExpectedTotal::Unknown.to_string(), "unknown");
        assert_eq!(serde_json::to_string(&ExpectedTotal::Unknown).unwrap(), "null");
    }
}
