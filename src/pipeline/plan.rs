// src/pipeline/plan.rs
use crate::error::{CompilationError, ProcessingError};
use crate::input_format::{parse_records, Source};
use crate::output_format::{formatter, write_lines, OutputFormat, TextLayout};
use crate::pipeline::config::{PipelineConfig, PipelineOptions};
use crate::pipeline::context::{ProcessingStats, Record};
use crate::pipeline::meta::{add_meta, parse_meta_config, MetaConfig};
use crate::pipeline::processors::{predicate_step, RecordPredicate, StarlarkFilter, StarlarkTransform};
use crate::pipeline::stream::{Seq, Step};
use crate::processors::merge::merge;
use crate::processors::record::{distinct_by, expand, hide, select};
use crate::processors::text::{remove_prefix, substrings, MatchMode, RegexFilter};
use crate::processors::window;
use std::io::Write;
use std::sync::Arc;

/// A validated pipeline, ready to run over any set of sources.
///
/// Every expression, pattern and directive is checked by
/// [`PipelinePlan::compile`], so a run never fails on configuration.
pub struct PipelinePlan {
    opts: PipelineOptions,
    include: Vec<String>,
    exclude: Vec<String>,
    include_regexp: RegexFilter,
    exclude_regexp: RegexFilter,
    duration_fields: Vec<String>,
    meta: MetaConfig,
    expand: Vec<String>,
    filter: Option<Arc<dyn RecordPredicate>>,
    eval: Option<Arc<dyn RecordPredicate>>,
    hide: Vec<String>,
    select: Vec<String>,
    context_before: usize,
    context_after: usize,
    merge_keys: Vec<String>,
    distinct_by: String,
    first: i64,
    last: i64,
    format: OutputFormat,
    layout: TextLayout,
    show_errors: bool,
}

impl PipelinePlan {
    pub fn compile(config: &PipelineConfig) -> Result<Self, CompilationError> {
        let filter = match config.filter.as_deref().filter(|f| !f.trim().is_empty()) {
            Some(expression) => {
                Some(Arc::new(StarlarkFilter::from_expression(expression)?) as Arc<dyn RecordPredicate>)
            }
            None => None,
        };
        let eval = match config.eval.as_deref().filter(|e| !e.trim().is_empty()) {
            Some(expression) => {
                Some(Arc::new(StarlarkTransform::from_expression(expression)?) as Arc<dyn RecordPredicate>)
            }
            None => None,
        };

        let (context_before, context_after) = config.context_window();
        let plan = PipelinePlan {
            opts: config.options(),
            include: config.include.clone(),
            exclude: config.exclude.clone(),
            include_regexp: RegexFilter::compile(MatchMode::Include, &config.include_regexp)?,
            exclude_regexp: RegexFilter::compile(MatchMode::Exclude, &config.exclude_regexp)?,
            duration_fields: config.duration_ms.clone(),
            meta: parse_meta_config(&config.metadata)?,
            expand: config.expand.clone(),
            filter,
            eval,
            hide: config.hide.clone(),
            select: config.select.clone(),
            context_before,
            context_after,
            merge_keys: config.merge_keys(),
            distinct_by: config.distinct_by.clone().unwrap_or_default(),
            first: config.first,
            last: config.last,
            format: config.format,
            layout: TextLayout {
                head: config.txt_head.clone(),
                order: config.order.clone(),
                no_newline: config.txt_nonl,
                no_properties: config.txt_noprop,
                delimiter: config.txt_delim.clone(),
            },
            show_errors: config.show_errors,
        };

        tracing::debug!(
            context_enabled = plan.opts.context_enabled,
            context_before,
            context_after,
            merge_keys = ?plan.merge_keys,
            filter = plan.filter.is_some(),
            eval = plan.eval.is_some(),
            "pipeline compiled"
        );
        Ok(plan)
    }

    pub fn options(&self) -> PipelineOptions {
        self.opts
    }

    /// Line filters applied before parsing
    fn line_stages(&self) -> Step<String, String> {
        let opts = self.opts;
        Step::combine(
            remove_prefix(opts),
            substrings(opts, MatchMode::Exclude, &self.exclude),
            vec![
                substrings(opts, MatchMode::Include, &self.include),
                self.include_regexp.clone().into_step(opts),
                self.exclude_regexp.clone().into_step(opts),
            ],
        )
    }

    /// Record stages applied to each source before the merge
    fn record_stages(&self) -> Step<Record, Record> {
        let opts = self.opts;
        Step::combine(
            add_meta(opts, self.meta.clone()),
            expand(opts, &self.expand),
            vec![
                predicate_step(opts, self.filter.clone()),
                predicate_step(opts, self.eval.clone()),
                hide(opts, &self.hide),
                select(opts, &self.select),
                window::context(opts, self.context_before, self.context_after),
            ],
        )
    }

    /// Full per-source chain from raw lines to context-filtered records.
    ///
    /// Built fresh for every source so no stage state is shared.
    pub fn source_pipeline(&self) -> Step<String, Record> {
        self.line_stages()
            .then(parse_records(self.opts, &self.duration_fields))
            .then(self.record_stages())
    }

    fn post_merge_stages(&self) -> Step<Record, Record> {
        let opts = self.opts;
        Step::combine(
            distinct_by(opts, &self.distinct_by),
            window::first(opts, self.first),
            vec![window::last(opts, self.last)],
        )
    }

    /// Merged and post-processed records of all `sources`
    pub fn records(&self, sources: Vec<Source>) -> Seq<Record> {
        tracing::debug!(sources = sources.len(), "building pipeline");
        let inputs = sources
            .into_iter()
            .map(|source| self.source_pipeline().apply(source.into_lines()))
            .collect();

        self.post_merge_stages()
            .apply(merge(self.merge_keys.clone(), inputs))
    }

    /// Rendered output lines of all `sources`
    pub fn lines(&self, sources: Vec<Source>) -> Seq<String> {
        formatter(self.opts, self.format, self.layout.clone()).apply(self.records(sources))
    }

    /// Run over `sources` and write every output line to `writer`
    pub fn run<W: Write>(
        &self,
        sources: Vec<Source>,
        writer: &mut W,
    ) -> Result<ProcessingStats, ProcessingError> {
        write_lines(writer, self.show_errors, self.lines(sources))
    }
}
