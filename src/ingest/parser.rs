//! Streaming CSV reader producing header-keyed rows.
//!
//! Standard comma-separated values with double-quote quoting and quote
//! doubling. The first record is the header; names are trimmed and
//! lowercased. Data records are zipped positionally against the header:
//! missing trailing fields are absent from the row and extra trailing
//! fields are dropped. Blank lines are skipped. A field that is not valid
//! UTF-8 is left out of the row and its column is recorded as undecodable,
//! so only rows that bind that column are lost.

use crate::error::JobError;
use csv_async::{AsyncReader, AsyncReaderBuilder, ByteRecord};
use futures_util::Stream;
use std::collections::HashMap;
use tokio::io::AsyncRead;

/// One data line: lowercased header name → raw field text.
pub type RawRow = HashMap<String, String>;

/// A data record read from the input.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Record {
    pub line: u64,
    pub fields: RawRow,
    /// Header names whose field bytes were not valid UTF-8.
    pub undecodable: Vec<String>,
}

impl Record {
    pub fn new(line: u64, fields: RawRow) -> Self {
        Self {
            line,
            fields,
            undecodable: Vec::new(),
        }
    }

    pub fn line(&self) -> u64 {
        self.line
    }

    pub fn is_decodable(&self, name: &str) -> bool {
        !self.undecodable.iter().any(|n| n == name)
    }
}

pub struct RowParser<R> {
    reader: AsyncReader<R>,
    header: Vec<String>,
    record: ByteRecord,
    records_read: u64,
}

impl<R> RowParser<R>
where
    R: AsyncRead + Unpin + Send,
{
    /// Read the header record. Fails with [`JobError::EmptyInput`] when the
    /// input holds no records at all.
    pub async fn new(input: R) -> Result<Self, JobError> {
        let mut reader = AsyncReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .delimiter(b',')
            .quote(b'"')
            .double_quote(true)
            .create_reader(input);

        let mut record = ByteRecord::new();
        if !reader.read_byte_record(&mut record).await? {
            return Err(JobError::EmptyInput);
        }

        let header = record
            .iter()
            .enumerate()
            .map(|(idx, field)| {
                let name = String::from_utf8_lossy(field);
                // Spreadsheet exports often lead with a byte order mark.
                let name = if idx == 0 {
                    name.trim_start_matches('\u{feff}')
                } else {
                    name.as_ref()
                };
                name.trim().to_lowercase()
            })
            .collect();

        Ok(Self {
            reader,
            header,
            record,
            records_read: 1,
        })
    }

    pub fn header(&self) -> &[String] {
        &self.header
    }

    /// Next data record, or `None` once the input is exhausted.
    pub async fn next_record(&mut self) -> Result<Option<Record>, JobError> {
        if !self.reader.read_byte_record(&mut self.record).await? {
            return Ok(None);
        }
        self.records_read += 1;

        let line = self
            .record
            .position()
            .map(|pos| pos.line())
            .unwrap_or(self.records_read);

        let mut record = Record::new(line, RawRow::with_capacity(self.header.len()));
        for (name, raw) in self.header.iter().zip(self.record.iter()) {
            match std::str::from_utf8(raw) {
                Ok(value) => {
                    record.undecodable.retain(|n| n != name);
                    record.fields.insert(name.clone(), value.to_string());
                }
                Err(_) => {
                    record.fields.remove(name);
                    record.undecodable.push(name.clone());
                }
            }
        }

        Ok(Some(record))
    }

    /// Consume the parser as a lazy, single-pass stream of records.
    pub fn into_records(self) -> impl Stream<Item = Result<Record, JobError>> + Send
    where
        R: 'static,
    {
        futures_util::stream::try_unfold(self, |mut parser| async move {
            Ok(parser.next_record().await?.map(|record| (record, parser)))
        })
    }
}
