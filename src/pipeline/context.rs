use crate::error::ProcessingError;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

/// A structured log record: an open mapping from field name to JSON value.
///
/// Keys iterate in lexicographic order, which is the order used whenever a
/// record is rendered for display.
pub type Record = serde_json::Map<String, Value>;

/// Per-item bookkeeping carried alongside every value in the pipeline
#[derive(Debug, Clone, PartialEq)]
pub struct Metadata {
    /// Soft-delete flag. Once set it is never cleared.
    pub removed: bool,
    /// 0-based position of the originating line within its source
    pub record_number: usize,
    /// Identifier of the originating source (file path or `stdin`)
    pub source_name: Arc<str>,
}

impl Default for Metadata {
    fn default() -> Self {
        Metadata::new(0, Arc::from(""))
    }
}

impl Metadata {
    pub fn new(record_number: usize, source_name: Arc<str>) -> Self {
        Metadata {
            removed: false,
            record_number,
            source_name,
        }
    }
}

/// A value flowing through the pipeline together with its metadata
#[derive(Debug, Clone, PartialEq)]
pub struct Item<T> {
    pub value: T,
    pub metadata: Metadata,
}

impl<T> Item<T> {
    pub fn new(value: T, metadata: Metadata) -> Self {
        Item { value, metadata }
    }

    /// Replace the value, keeping the metadata
    pub fn with_value<U>(self, value: U) -> Item<U> {
        Item {
            value,
            metadata: self.metadata,
        }
    }

    pub fn is_removed(&self) -> bool {
        self.metadata.removed
    }

    /// Soft-delete this item
    pub fn mark_removed(&mut self) {
        self.metadata.removed = true;
    }
}

/// Outcome of evaluating a predicate or transform against one record
#[derive(Debug)]
pub enum ProcessResult {
    /// Pass the record through unchanged
    Keep,
    /// Soft-delete the record
    Drop,
    /// Replace the record
    Transform(Record),
    /// Zero or more records sharing the input metadata
    FanOut(Vec<Record>),
    /// Evaluation failed
    Error(ProcessingError),
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct ProcessingStats {
    pub records_output: usize,
    pub errors: usize,
    pub processing_time: Duration,
}

/// Render a field value the way it is shown to users and compared as text.
///
/// Strings are taken verbatim, integral numbers print without a fraction,
/// containers print as compact JSON and null renders empty.
pub fn render_value(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::Bool(b) => b.to_string(),
        Value::String(s) => s.clone(),
        Value::Number(n) => match n.as_f64() {
            Some(f) if n.is_f64() => render_float(f),
            _ => n.to_string(),
        },
        Value::Array(_) | Value::Object(_) => value.to_string(),
    }
}

fn render_float(f: f64) -> String {
    if f.is_finite() && f.fract() == 0.0 && f.abs() < 1e21 {
        format!("{:.0}", f)
    } else {
        format!("{}", f)
    }
}
