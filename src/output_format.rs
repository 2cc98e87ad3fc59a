// src/output_format.rs
use crate::error::ProcessingError;
use crate::pipeline::config::PipelineOptions;
use crate::pipeline::context::{render_value, Item, ProcessingStats, Record};
use crate::pipeline::stream::{Emit, RecordProcessor, Seq, Step, StepResult};
use serde::Deserialize;
use std::collections::HashSet;
use std::io::Write;
use std::time::Instant;

#[derive(Debug, Clone, Copy, Default, PartialEq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    #[value(name = "text", help = "Head values followed by name:value pairs")]
    Text,
    #[value(name = "json", help = "One compact JSON object per line")]
    Json,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" => Ok(OutputFormat::Text),
            "json" => Ok(OutputFormat::Json),
            _ => Err(format!("Unknown output format: {}", s)),
        }
    }
}

/// Text layout options
#[derive(Debug, Clone, Default)]
pub struct TextLayout {
    pub head: Vec<String>,
    pub order: Vec<String>,
    pub no_newline: bool,
    pub no_properties: bool,
    pub delimiter: String,
}

/// Renders records as `head1|head2 name:value name:value ...`
pub struct TextFormatter {
    layout: TextLayout,
    listed: HashSet<String>,
}

impl TextFormatter {
    pub fn new(layout: TextLayout) -> Self {
        let listed = layout
            .head
            .iter()
            .chain(layout.order.iter())
            .cloned()
            .collect();
        TextFormatter { layout, listed }
    }

    /// `None` when nothing is left to print
    pub fn format(&self, record: &Record) -> Option<String> {
        let mut out = String::new();

        let last = self.layout.head.len().saturating_sub(1);
        for (i, field) in self.layout.head.iter().enumerate() {
            if let Some(value) = record.get(field) {
                out.push_str(&render_value(value));
                if i != last {
                    out.push_str(&self.layout.delimiter);
                }
            }
        }

        for field in &self.layout.order {
            if let Some(value) = record.get(field) {
                push_property(&mut out, field, value);
            }
        }

        if !self.layout.no_properties {
            for (field, value) in record {
                if !self.listed.contains(field) {
                    push_property(&mut out, field, value);
                }
            }
        }

        let mut text = out.trim().to_string();
        if text.is_empty() {
            return None;
        }
        if !self.layout.no_newline {
            text.push('\n');
        }
        Some(text)
    }
}

fn push_property(out: &mut String, name: &str, value: &serde_json::Value) {
    out.push(' ');
    out.push_str(name);
    out.push(':');
    out.push_str(&render_value(value));
}

impl RecordProcessor<Record, String> for TextFormatter {
    fn process(&mut self, item: Item<Record>, emit: &mut Emit<'_, String>) -> bool {
        match self.format(&item.value) {
            Some(text) => emit(Ok(item.with_value(text))),
            None => true,
        }
    }

    fn name(&self) -> &str {
        "text"
    }
}

/// Compact JSON, keys in lexicographic order
pub struct JsonFormatter;

impl RecordProcessor<Record, String> for JsonFormatter {
    fn process(&mut self, item: Item<Record>, emit: &mut Emit<'_, String>) -> bool {
        match serde_json::to_string(&item.value) {
            Ok(text) => emit(Ok(item.with_value(text))),
            Err(err) => emit(Err(ProcessingError::Serialization(err))),
        }
    }

    fn name(&self) -> &str {
        "json"
    }
}

pub fn formatter(opts: PipelineOptions, format: OutputFormat, layout: TextLayout) -> Step<Record, String> {
    // head fields only make sense in text form
    if format == OutputFormat::Text || !layout.head.is_empty() {
        Step::from_processor(opts, TextFormatter::new(layout))
    } else {
        Step::from_processor(opts, JsonFormatter)
    }
}

/// Terminal sink: one line per item. Error items are written only with
/// `show_errors`.
///
/// A broken pipe ends the run early without an error.
pub fn write_lines<W: Write>(
    writer: &mut W,
    show_errors: bool,
    lines: Seq<String>,
) -> Result<ProcessingStats, ProcessingError> {
    let start = Instant::now();
    let mut stats = ProcessingStats::default();
    let mut failure = None;

    lines.for_each(|result: StepResult<String>| {
        let written = match result {
            Ok(item) => {
                stats.records_output += 1;
                writeln!(writer, "{}", item.value)
            }
            Err(err) => {
                stats.errors += 1;
                if !show_errors {
                    return true;
                }
                writeln!(writer, "{}", err)
            }
        };

        match written {
            Ok(()) => true,
            Err(err) => {
                failure = Some(ProcessingError::IoError(err));
                false
            }
        }
    });

    if failure.is_none() {
        if let Err(err) = writer.flush() {
            failure = Some(ProcessingError::IoError(err));
        }
    }

    stats.processing_time = start.elapsed();
    match failure {
        Some(err) if err.is_broken_pipe() => {
            tracing::debug!("output closed, stopping");
            Ok(stats)
        }
        Some(err) => Err(err),
        None => Ok(stats),
    }
}
