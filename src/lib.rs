// src/lib.rs
pub mod error;
pub mod input_format;
pub mod output_format;
pub mod pipeline;
pub mod processors;

pub use error::*;

pub use input_format::{open_sources, Source};
pub use output_format::OutputFormat;
pub use pipeline::config::{PipelineConfig, PipelineOptions};
pub use pipeline::context::{Item, Metadata, ProcessResult, ProcessingStats, Record};
pub use pipeline::plan::PipelinePlan;
pub use pipeline::processors::{RecordPredicate, StarlarkFilter, StarlarkTransform};
pub use pipeline::stream::{Emit, RecordProcessor, Seq, Step, StepResult};
pub use processors::merge::merge;
pub use processors::window::RingBuffer;
