// src/pipeline/meta.rs
use crate::error::CompilationError;
use crate::pipeline::config::PipelineOptions;
use crate::pipeline::context::{Item, Record};
use crate::pipeline::stream::{Emit, RecordProcessor, Step};
use serde_json::Value;

/// Field names to inject metadata under; `None` means not injected.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetaConfig {
    pub record_number: Option<String>,
    pub source_name: Option<String>,
}

impl MetaConfig {
    pub fn is_empty(&self) -> bool {
        self.record_number.is_none() && self.source_name.is_none()
    }
}

/// Parse a metadata directive such as `"rnum:line file"`.
///
/// Tokens are `name[:alias]` separated by spaces. Known names are `rnum`
/// (record number) and `file` (source name); the alias defaults to the
/// name itself. Only the segment after the first `:` is the alias, and an
/// empty alias turns the injection off.
pub fn parse_meta_config(directive: &str) -> Result<MetaConfig, CompilationError> {
    let mut config = MetaConfig::default();

    for token in directive.split_whitespace() {
        let mut segments = token.split(':');
        let name = segments.next().unwrap_or_default();
        let alias = segments.next().unwrap_or(name);
        let field = (!alias.is_empty()).then(|| alias.to_string());

        match name {
            "rnum" => config.record_number = field,
            "file" => config.source_name = field,
            _ => return Err(CompilationError::UnknownMetadataField(name.to_string())),
        }
    }

    Ok(config)
}

/// Writes record metadata into the record itself
pub struct AddMeta {
    config: MetaConfig,
}

impl RecordProcessor<Record, Record> for AddMeta {
    fn process(&mut self, mut item: Item<Record>, emit: &mut Emit<'_, Record>) -> bool {
        if let Some(field) = &self.config.record_number {
            item.value
                .insert(field.clone(), Value::from(item.metadata.record_number));
        }
        if let Some(field) = &self.config.source_name {
            item.value.insert(
                field.clone(),
                Value::String(item.metadata.source_name.to_string()),
            );
        }
        emit(Ok(item))
    }

    fn name(&self) -> &str {
        "add_meta"
    }
}

pub fn add_meta(opts: PipelineOptions, config: MetaConfig) -> Step<Record, Record> {
    if config.is_empty() {
        return Step::noop();
    }
    Step::from_processor(opts, AddMeta { config })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(record_number: Option<&str>, source_name: Option<&str>) -> MetaConfig {
        MetaConfig {
            record_number: record_number.map(String::from),
            source_name: source_name.map(String::from),
        }
    }

    #[test]
    fn test_parse_meta_config() {
        let cases = [
            (" rnum:recnum", meta(Some("recnum"), None)),
            (" rnum  file", meta(Some("rnum"), Some("file"))),
            ("rnum file:f1 ", meta(Some("rnum"), Some("f1"))),
            ("rnum file ", meta(Some("rnum"), Some("file"))),
            ("file", meta(None, Some("file"))),
            ("file:f2", meta(None, Some("f2"))),
            ("", meta(None, None)),
            ("rnum: file", meta(None, Some("file"))),
            ("rnum:a:b file:", meta(Some("a"), None)),
        ];

        for (directive, expected) in cases {
            assert_eq!(
                parse_meta_config(directive).unwrap(),
                expected,
                "directive {:?}",
                directive
            );
        }
    }

    #[test]
    fn test_empty_alias_injects_nothing() {
        use crate::pipeline::stream::Seq;

        let record = serde_json::json!({"a": 1}).as_object().cloned().unwrap();
        let config = parse_meta_config("rnum:").unwrap();
        let out = add_meta(PipelineOptions::default(), config)
            .apply(Seq::from_values("test", vec![record.clone()]))
            .collect_values();
        assert_eq!(out, vec![record]);
    }

    #[test]
    fn test_unknown_meta_field() {
        match parse_meta_config("file:f2 foo:bar") {
            Err(CompilationError::UnknownMetadataField(name)) => assert_eq!(name, "foo"),
            other => panic!("expected UnknownMetadataField, got {:?}", other),
        }
    }
}
