// src/processors/text.rs
//! Raw-line stages that run before a line is parsed into a record.

use crate::error::CompilationError;
use crate::pipeline::config::PipelineOptions;
use crate::pipeline::context::Item;
use crate::pipeline::stream::{Emit, RecordProcessor, Step};
use regex::Regex;

/// Drops any text in front of the first `{`
pub struct RemovePrefix;

impl RecordProcessor<String, String> for RemovePrefix {
    fn process(&mut self, mut item: Item<String>, emit: &mut Emit<'_, String>) -> bool {
        if let Some(start) = item.value.find('{') {
            if start > 0 {
                item.value.replace_range(..start, "");
            }
        }
        emit(Ok(item))
    }

    fn name(&self) -> &str {
        "remove_prefix"
    }
}

pub fn remove_prefix(opts: PipelineOptions) -> Step<String, String> {
    Step::from_processor(opts, RemovePrefix)
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MatchMode {
    /// Keep only lines matching at least one pattern
    Include,
    /// Remove lines matching any pattern
    Exclude,
}

impl MatchMode {
    /// Whether a line with the given match outcome gets soft-deleted
    fn removes(self, matched: bool) -> bool {
        match self {
            MatchMode::Include => !matched,
            MatchMode::Exclude => matched,
        }
    }
}

/// Case-insensitive substring filter
pub struct SubstringFilter {
    mode: MatchMode,
    needles: Vec<String>,
}

impl SubstringFilter {
    pub fn new(mode: MatchMode, substrings: &[String]) -> Self {
        SubstringFilter {
            mode,
            needles: substrings.iter().map(|s| s.to_lowercase()).collect(),
        }
    }

    fn matches(&self, line: &str) -> bool {
        let haystack = line.to_lowercase();
        self.needles.iter().any(|needle| haystack.contains(needle.as_str()))
    }
}

impl RecordProcessor<String, String> for SubstringFilter {
    fn process(&mut self, mut item: Item<String>, emit: &mut Emit<'_, String>) -> bool {
        if !item.is_removed() && self.mode.removes(self.matches(&item.value)) {
            item.mark_removed();
        }
        emit(Ok(item))
    }

    fn name(&self) -> &str {
        match self.mode {
            MatchMode::Include => "include",
            MatchMode::Exclude => "exclude",
        }
    }
}

pub fn substrings(opts: PipelineOptions, mode: MatchMode, substrings: &[String]) -> Step<String, String> {
    if substrings.is_empty() {
        return Step::noop();
    }
    Step::from_processor(opts, SubstringFilter::new(mode, substrings))
}

/// Regular expression filter over raw lines
#[derive(Clone)]
pub struct RegexFilter {
    mode: MatchMode,
    patterns: Vec<Regex>,
}

impl RegexFilter {
    /// Compile every pattern; fails on the first invalid one
    pub fn compile(mode: MatchMode, patterns: &[String]) -> Result<Self, CompilationError> {
        let patterns = patterns
            .iter()
            .map(|pattern| {
                Regex::new(pattern).map_err(|source| CompilationError::InvalidRegex {
                    pattern: pattern.clone(),
                    source,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(RegexFilter { mode, patterns })
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn into_step(self, opts: PipelineOptions) -> Step<String, String> {
        if self.is_empty() {
            return Step::noop();
        }
        Step::from_processor(opts, self)
    }
}

impl RecordProcessor<String, String> for RegexFilter {
    fn process(&mut self, mut item: Item<String>, emit: &mut Emit<'_, String>) -> bool {
        if !item.is_removed() {
            let matched = self.patterns.iter().any(|re| re.is_match(&item.value));
            if self.mode.removes(matched) {
                item.mark_removed();
            }
        }
        emit(Ok(item))
    }

    fn name(&self) -> &str {
        match self.mode {
            MatchMode::Include => "include_regexp",
            MatchMode::Exclude => "exclude_regexp",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::stream::Seq;

    fn context_opts() -> PipelineOptions {
        PipelineOptions {
            context_enabled: true,
        }
    }

    fn lines(values: &[&str]) -> Seq<String> {
        Seq::from_values("test", values.iter().map(|s| s.to_string()).collect())
    }

    fn surviving(seq: Seq<String>) -> Vec<String> {
        seq.collect()
            .into_iter()
            .map(|r| r.unwrap())
            .filter(|item| !item.is_removed())
            .map(|item| item.value)
            .collect()
    }

    #[test]
    fn test_remove_prefix() {
        let out = remove_prefix(PipelineOptions::default())
            .apply(lines(&["2024-01-01 INFO {\"a\":1}", "{\"b\":2}", "no json"]))
            .collect_values();
        assert_eq!(out, vec!["{\"a\":1}", "{\"b\":2}", "no json"]);
    }

    #[test]
    fn test_include_is_case_insensitive() {
        let out = surviving(
            substrings(
                PipelineOptions::default(),
                MatchMode::Include,
                &["ERROR".to_string()],
            )
            .apply(lines(&["an error here", "all fine", "Error again"])),
        );
        assert_eq!(out, vec!["an error here", "Error again"]);
    }

    #[test]
    fn test_filters_mark_instead_of_dropping_with_context() {
        let results = substrings(context_opts(), MatchMode::Exclude, &["debug".to_string()])
            .apply(lines(&["debug noise", "payload"]))
            .collect();
        let removed: Vec<bool> = results
            .iter()
            .map(|r| r.as_ref().unwrap().is_removed())
            .collect();
        assert_eq!(removed, vec![true, false]);
    }

    #[test]
    fn test_regex_filters() {
        let include = RegexFilter::compile(MatchMode::Include, &["value[1-2]".to_string()]).unwrap();
        let out = surviving(
            include
                .into_step(PipelineOptions::default())
                .apply(lines(&["value1", "value2", "value3"])),
        );
        assert_eq!(out, vec!["value1", "value2"]);

        let exclude = RegexFilter::compile(MatchMode::Exclude, &["value[1-2]".to_string()]).unwrap();
        let out = surviving(
            exclude
                .into_step(PipelineOptions::default())
                .apply(lines(&["value1", "value2", "value3"])),
        );
        assert_eq!(out, vec!["value3"]);
    }

    #[test]
    fn test_invalid_regex_fails_at_construction() {
        let err = RegexFilter::compile(MatchMode::Include, &["(unclosed".to_string()])
            .err()
            .unwrap();
        assert!(err.to_string().contains("(unclosed"));
    }
}
