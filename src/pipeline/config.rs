use crate::error::CompilationError;
use crate::output_format::OutputFormat;
use serde::Deserialize;
use std::path::Path;

/// Merge key used when none is configured
pub const DEFAULT_MERGE_KEY: &str = "ts";

/// Metadata directive used when none is configured
pub const DEFAULT_METADATA: &str = "rnum";

/// Slots per source queue in the merge engine
pub const MERGE_QUEUE_CAPACITY: usize = 1000;

/// Options shared by every stage of one pipeline
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PipelineOptions {
    /// When set, soft-deleted items keep flowing so the context stage can
    /// use them as surrounding records.
    pub context_enabled: bool,
}

/// Configuration for pipeline behavior.
///
/// Loaded from a YAML file (kebab-case keys) and overlaid with command-line
/// flags. Non-positive window sizes disable the corresponding stage.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
pub struct PipelineConfig {
    pub filter: Option<String>,
    pub eval: Option<String>,
    pub include: Vec<String>,
    pub exclude: Vec<String>,
    pub include_regexp: Vec<String>,
    pub exclude_regexp: Vec<String>,
    pub duration_ms: Vec<String>,
    pub select: Vec<String>,
    pub hide: Vec<String>,
    pub expand: Vec<String>,
    pub metadata: String,
    pub format: OutputFormat,
    pub txt_head: Vec<String>,
    pub order: Vec<String>,
    pub txt_nonl: bool,
    pub txt_noprop: bool,
    pub txt_delim: String,
    pub distinct_by: Option<String>,
    pub merge: Vec<String>,
    pub first: i64,
    pub last: i64,
    pub context: i64,
    pub context_before: Option<i64>,
    pub context_after: Option<i64>,
    pub show_errors: bool,
    pub debug: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            filter: None,
            eval: None,
            include: Vec::new(),
            exclude: Vec::new(),
            include_regexp: Vec::new(),
            exclude_regexp: Vec::new(),
            duration_ms: Vec::new(),
            select: Vec::new(),
            hide: Vec::new(),
            expand: Vec::new(),
            metadata: DEFAULT_METADATA.to_string(),
            format: OutputFormat::default(),
            txt_head: Vec::new(),
            order: Vec::new(),
            txt_nonl: false,
            txt_noprop: false,
            txt_delim: "|".to_string(),
            distinct_by: None,
            merge: vec![DEFAULT_MERGE_KEY.to_string()],
            first: 0,
            last: 0,
            context: 0,
            context_before: None,
            context_after: None,
            show_errors: false,
            debug: false,
        }
    }
}

impl PipelineConfig {
    pub fn from_yaml_str(text: &str) -> Result<Self, CompilationError> {
        Ok(serde_yaml::from_str(text)?)
    }

    pub fn from_yaml_file(path: &Path) -> Result<Self, CompilationError> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            CompilationError::ConfigError(format!(
                "error loading config file '{}': {}",
                path.display(),
                e
            ))
        })?;
        Self::from_yaml_str(&text)
    }

    /// Effective (before, after) context sizes; zero means disabled
    pub fn context_window(&self) -> (usize, usize) {
        let before = self.context_before.unwrap_or(self.context);
        let after = self.context_after.unwrap_or(self.context);
        (clamp_count(before), clamp_count(after))
    }

    pub fn options(&self) -> PipelineOptions {
        let (before, after) = self.context_window();
        PipelineOptions {
            context_enabled: before > 0 || after > 0,
        }
    }

    pub fn merge_keys(&self) -> Vec<String> {
        if self.merge.is_empty() {
            vec![DEFAULT_MERGE_KEY.to_string()]
        } else {
            self.merge.clone()
        }
    }
}

/// Map a user-supplied count to a window size; non-positive means disabled
pub fn clamp_count(count: i64) -> usize {
    usize::try_from(count).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = PipelineConfig::default();
        assert_eq!(config.metadata, "rnum");
        assert_eq!(config.merge_keys(), vec!["ts".to_string()]);
        assert_eq!(config.context_window(), (0, 0));
        assert!(!config.options().context_enabled);
    }

    #[test]
    fn test_yaml_overrides() {
        let config = PipelineConfig::from_yaml_str(
            "include: [error]\ncontext: 2\ncontext-after: 0\nmerge: [time, ts]\nformat: json\n",
        )
        .unwrap();
        assert_eq!(config.include, vec!["error".to_string()]);
        assert_eq!(config.context_window(), (2, 0));
        assert!(config.options().context_enabled);
        assert_eq!(config.merge_keys(), vec!["time".to_string(), "ts".to_string()]);
        assert_eq!(config.format, OutputFormat::Json);
        assert_eq!(config.txt_delim, "|");
    }

    #[test]
    fn test_unknown_yaml_key_is_rejected() {
        assert!(PipelineConfig::from_yaml_str("no-such-option: 1\n").is_err());
    }

    #[test]
    fn test_negative_counts_disable() {
        let config = PipelineConfig {
            context: -3,
            ..PipelineConfig::default()
        };
        assert_eq!(config.context_window(), (0, 0));
        assert!(!config.options().context_enabled);
    }
}
