// src/input_format.rs
//! Source acquisition and parsing of raw lines into records.

use crate::error::ProcessingError;
use crate::pipeline::config::PipelineOptions;
use crate::pipeline::context::{render_value, Item, Metadata, Record};
use crate::pipeline::stream::{Emit, RecordProcessor, Seq, Step};
use serde_json::Value;
use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::sync::Arc;

/// Source name used for standard input
pub const STDIN_NAME: &str = "stdin";

const BOM: char = '\u{feff}';

/// One open input stream
pub struct Source {
    name: Arc<str>,
    reader: Box<dyn BufRead + Send>,
}

impl Source {
    pub fn from_reader<R>(name: &str, reader: R) -> Self
    where
        R: BufRead + Send + 'static,
    {
        Source {
            name: Arc::from(name),
            reader: Box::new(reader),
        }
    }

    /// Open a file, or standard input for `-`
    pub fn open(path: &str) -> Result<Self, ProcessingError> {
        if path == "-" {
            return Ok(Source::from_reader(STDIN_NAME, BufReader::new(io::stdin())));
        }

        let file = File::open(path).map_err(|source| ProcessingError::SourceUnavailable {
            path: path.to_string(),
            source,
        })?;
        tracing::debug!(source = path, "opened source");
        Ok(Source::from_reader(path, BufReader::new(file)))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Lines of this source, numbered from 0.
    ///
    /// Line terminators and a leading byte order mark are removed, invalid
    /// UTF-8 is replaced. A read error is yielded once and ends the
    /// sequence. The reader is released when the sequence finishes or is
    /// cancelled.
    pub fn into_lines(self) -> Seq<String> {
        let Source { name, mut reader } = self;

        Seq::new(move |emit: &mut Emit<'_, String>| {
            let mut buf = Vec::new();
            let mut record_number = 0;

            loop {
                buf.clear();
                match reader.read_until(b'\n', &mut buf) {
                    Ok(0) => break,
                    Ok(_) => {
                        let line = decode_line(&buf, record_number == 0);
                        let item = Item::new(line, Metadata::new(record_number, name.clone()));
                        record_number += 1;
                        if !emit(Ok(item)) {
                            break;
                        }
                    }
                    Err(err) => {
                        tracing::debug!(source = %name, error = %err, "read failed");
                        emit(Err(ProcessingError::IoError(err)));
                        break;
                    }
                }
            }

            tracing::debug!(source = %name, lines = record_number, "source closed");
        })
    }
}

fn decode_line(raw: &[u8], first: bool) -> String {
    let mut end = raw.len();
    if end > 0 && raw[end - 1] == b'\n' {
        end -= 1;
        if end > 0 && raw[end - 1] == b'\r' {
            end -= 1;
        }
    }

    let line = String::from_utf8_lossy(&raw[..end]);
    match line.strip_prefix(BOM) {
        Some(rest) if first => rest.to_string(),
        _ => line.into_owned(),
    }
}

/// Open every path up front; the first failure aborts.
pub fn open_sources(paths: &[String]) -> Result<Vec<Source>, ProcessingError> {
    paths.iter().map(|path| Source::open(path)).collect()
}

/// Parses each line as a JSON object. Anything else becomes
/// `{"raw": line}`.
pub struct RecordParser {
    duration_fields: Vec<String>,
}

impl RecordParser {
    pub fn new(duration_fields: &[String]) -> Self {
        RecordParser {
            duration_fields: duration_fields.to_vec(),
        }
    }

    pub fn parse(&self, line: &str) -> Record {
        let mut record = match serde_json::from_str::<Value>(line) {
            Ok(Value::Object(record)) => record,
            _ => {
                let mut record = Record::new();
                record.insert("raw".to_string(), Value::String(line.to_string()));
                record
            }
        };

        for field in &self.duration_fields {
            if let Some(millis) = record.get(field).and_then(duration_millis) {
                record.insert(field.clone(), Value::from(millis));
            }
        }

        record
    }
}

/// Milliseconds in a duration string such as `1m 5s`
fn duration_millis(value: &Value) -> Option<u64> {
    let duration = humantime::parse_duration(render_value(value).trim()).ok()?;
    u64::try_from(duration.as_millis()).ok()
}

impl RecordProcessor<String, Record> for RecordParser {
    fn process(&mut self, item: Item<String>, emit: &mut Emit<'_, Record>) -> bool {
        let record = self.parse(&item.value);
        emit(Ok(item.with_value(record)))
    }

    fn name(&self) -> &str {
        "parse"
    }
}

pub fn parse_records(opts: PipelineOptions, duration_fields: &[String]) -> Step<String, Record> {
    Step::from_processor(opts, RecordParser::new(duration_fields))
}
