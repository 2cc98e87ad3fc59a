#[derive(Debug, thiserror::Error)]
pub enum ProcessingError {
    #[error("Script error in step '{step}' at record {record}: {source}")]
    ScriptError {
        step: String,
        record: usize,
        #[source]
        source: anyhow::Error,
    },

    #[error("Failed to open source '{path}': {source}")]
    SourceUnavailable {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl ProcessingError {
    /// True when the underlying IO error means the reader went away.
    pub fn is_broken_pipe(&self) -> bool {
        matches!(self, ProcessingError::IoError(e) if e.kind() == std::io::ErrorKind::BrokenPipe)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CompilationError {
    #[error("Starlark syntax error: {0}")]
    SyntaxError(String),

    #[error("Invalid regular expression {pattern}: {source}")]
    InvalidRegex {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("Unknown metadata field: {0}")]
    UnknownMetadataField(String),

    #[error("Invalid configuration: {0}")]
    ConfigError(String),
}

impl From<starlark::Error> for CompilationError {
    fn from(err: starlark::Error) -> Self {
        CompilationError::SyntaxError(format!("{}", err))
    }
}

impl From<serde_yaml::Error> for CompilationError {
    fn from(err: serde_yaml::Error) -> Self {
        CompilationError::ConfigError(err.to_string())
    }
}
