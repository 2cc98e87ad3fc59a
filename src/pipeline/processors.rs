// src/pipeline/processors.rs
//! Starlark-backed predicate and transform stages.

use crate::pipeline::config::PipelineOptions;
use crate::pipeline::context::{Item, Metadata, ProcessResult, Record};
use crate::pipeline::stream::{Emit, RecordProcessor, Step};
use crate::{CompilationError, ProcessingError};
use starlark::environment::{Globals, GlobalsBuilder, Module};
use starlark::eval::Evaluator;
use starlark::starlark_module;
use starlark::syntax::{AstModule, Dialect};
use regex::Regex;
use starlark::values::{Heap, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

/// An externally defined decision over one record.
///
/// Implementations are compiled once and shared by every per-source
/// pipeline, so they must be usable from several threads at once.
pub trait RecordPredicate: Send + Sync {
    fn evaluate(&self, record: &Record, metadata: &Metadata) -> ProcessResult;

    fn name(&self) -> &str;
}

/// Adapts a [`RecordPredicate`] to the step protocol
pub struct PredicateProcessor {
    predicate: Arc<dyn RecordPredicate>,
}

impl PredicateProcessor {
    pub fn new(predicate: Arc<dyn RecordPredicate>) -> Self {
        PredicateProcessor { predicate }
    }
}

impl RecordProcessor<Record, Record> for PredicateProcessor {
    fn process(&mut self, mut item: Item<Record>, emit: &mut Emit<'_, Record>) -> bool {
        if item.is_removed() {
            return emit(Ok(item));
        }

        match self.predicate.evaluate(&item.value, &item.metadata) {
            ProcessResult::Keep => emit(Ok(item)),
            ProcessResult::Drop => {
                item.mark_removed();
                emit(Ok(item))
            }
            ProcessResult::Transform(record) => emit(Ok(item.with_value(record))),
            ProcessResult::FanOut(records) => {
                for record in records {
                    if !emit(Ok(Item::new(record, item.metadata.clone()))) {
                        return false;
                    }
                }
                true
            }
            ProcessResult::Error(err) => emit(Err(err)),
        }
    }

    fn name(&self) -> &str {
        self.predicate.name()
    }
}

pub fn predicate_step(
    opts: PipelineOptions,
    predicate: Option<Arc<dyn RecordPredicate>>,
) -> Step<Record, Record> {
    match predicate {
        Some(predicate) => Step::from_processor(opts, PredicateProcessor::new(predicate)),
        None => Step::noop(),
    }
}

fn dialect() -> Dialect {
    Dialect {
        enable_f_strings: true,
        ..Dialect::Extended
    }
}

// Compiled patterns shared by every script run
static REGEX_CACHE: OnceLock<Mutex<HashMap<String, Regex>>> = OnceLock::new();

fn get_regex(pattern: &str) -> Result<Regex, regex::Error> {
    let cache = REGEX_CACHE.get_or_init(|| Mutex::new(HashMap::new()));
    let mut cache_guard = cache.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

    if let Some(regex) = cache_guard.get(pattern) {
        return Ok(regex.clone());
    }
    let regex = Regex::new(pattern)?;
    cache_guard.insert(pattern.to_string(), regex.clone());
    Ok(regex)
}

#[starlark_module]
fn record_functions(builder: &mut GlobalsBuilder) {
    fn regex_match(pattern: String, text: String) -> anyhow::Result<bool> {
        match get_regex(&pattern) {
            Ok(regex) => Ok(regex.is_match(&text)),
            Err(_) => Ok(false),
        }
    }
}

/// A parsed Starlark expression plus the globals it runs against
struct StarlarkScript {
    globals: Globals,
    source: String,
    name: String,
}

impl StarlarkScript {
    fn compile(name: &str, source: &str) -> Result<Self, CompilationError> {
        AstModule::parse(name, source.to_string(), &dialect())?;
        tracing::debug!(step = name, "compiled starlark expression");

        Ok(StarlarkScript {
            globals: GlobalsBuilder::standard().with(record_functions).build(),
            source: source.to_string(),
            name: name.to_string(),
        })
    }

    /// Run the script for one record. `data`, `RNUM` and `FILENAME` are
    /// bound in a fresh module; `convert` turns the result into something
    /// that outlives the module.
    fn run<R, F>(&self, record: &Record, metadata: &Metadata, convert: F) -> anyhow::Result<R>
    where
        F: for<'v> FnOnce(Value<'v>) -> anyhow::Result<R>,
    {
        let module = Module::new();
        let heap = module.heap();

        let data = json_to_starlark_value(heap, &serde_json::Value::Object(record.clone()))?;
        module.set("data", data);
        module.set("RNUM", alloc_int(heap, metadata.record_number as i64));
        module.set("FILENAME", heap.alloc(&*metadata.source_name));

        let ast = AstModule::parse(&self.name, self.source.clone(), &dialect())
            .map_err(|e| anyhow::anyhow!("parse error: {}", e))?;
        let mut eval = Evaluator::new(&module);
        let result = eval
            .eval_module(ast, &self.globals)
            .map_err(|e| anyhow::anyhow!("execution error: {}", e))?;

        convert(result)
    }

    fn script_error(&self, metadata: &Metadata, source: anyhow::Error) -> ProcessResult {
        ProcessResult::Error(ProcessingError::ScriptError {
            step: self.name.clone(),
            record: metadata.record_number,
            source,
        })
    }
}

/// Boolean predicate: a truthy result keeps the record
pub struct StarlarkFilter {
    script: StarlarkScript,
}

impl StarlarkFilter {
    pub fn from_expression(expression: &str) -> Result<Self, CompilationError> {
        Ok(StarlarkFilter {
            script: StarlarkScript::compile("filter", expression)?,
        })
    }
}

impl RecordPredicate for StarlarkFilter {
    fn evaluate(&self, record: &Record, metadata: &Metadata) -> ProcessResult {
        match self.script.run(record, metadata, |result| Ok(result.to_bool())) {
            Ok(true) => ProcessResult::Keep,
            Ok(false) => ProcessResult::Drop,
            Err(err) => self.script.script_error(metadata, err),
        }
    }

    fn name(&self) -> &str {
        &self.script.name
    }
}

/// Record transformation.
///
/// The result decides what happens to the record: a bool keeps or drops
/// it, a dict replaces it, a list fans out into zero or more records and
/// `None` produces nothing. Anything else is wrapped as `{"item": value}`.
pub struct StarlarkTransform {
    script: StarlarkScript,
}

impl StarlarkTransform {
    pub fn from_expression(expression: &str) -> Result<Self, CompilationError> {
        Ok(StarlarkTransform {
            script: StarlarkScript::compile("eval", expression)?,
        })
    }
}

impl RecordPredicate for StarlarkTransform {
    fn evaluate(&self, record: &Record, metadata: &Metadata) -> ProcessResult {
        let outcome = self.script.run(record, metadata, |result| {
            use starlark::values::list::ListRef;

            if let Some(keep) = result.unpack_bool() {
                return Ok(if keep {
                    ProcessResult::Keep
                } else {
                    ProcessResult::Drop
                });
            }
            if result.is_none() {
                return Ok(ProcessResult::FanOut(Vec::new()));
            }
            if let Some(list) = ListRef::from_value(result) {
                let records = list
                    .iter()
                    .map(|v| starlark_to_json_value(v).map(into_record))
                    .collect::<anyhow::Result<Vec<_>>>()?;
                return Ok(ProcessResult::FanOut(records));
            }
            Ok(ProcessResult::Transform(into_record(starlark_to_json_value(
                result,
            )?)))
        });

        outcome.unwrap_or_else(|err| self.script.script_error(metadata, err))
    }

    fn name(&self) -> &str {
        &self.script.name
    }
}

/// Objects become records as they are; any other value is wrapped
fn into_record(value: serde_json::Value) -> Record {
    match value {
        serde_json::Value::Object(record) => record,
        other => {
            let mut record = Record::new();
            record.insert("item".to_string(), other);
            record
        }
    }
}

fn alloc_int(heap: &Heap, n: i64) -> Value<'_> {
    match i32::try_from(n) {
        Ok(small) => heap.alloc(small),
        Err(_) => heap.alloc(n as f64),
    }
}

fn json_to_starlark_value<'v>(heap: &'v Heap, json: &serde_json::Value) -> anyhow::Result<Value<'v>> {
    match json {
        serde_json::Value::Null => Ok(Value::new_none()),
        serde_json::Value::Bool(b) => Ok(Value::new_bool(*b)),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(alloc_int(heap, i))
            } else if let Some(f) = n.as_f64() {
                Ok(heap.alloc(f))
            } else {
                Ok(heap.alloc(n.to_string()))
            }
        }
        serde_json::Value::String(s) => Ok(heap.alloc(s.as_str())),
        serde_json::Value::Array(arr) => {
            let values = arr
                .iter()
                .map(|v| json_to_starlark_value(heap, v))
                .collect::<anyhow::Result<Vec<Value>>>()?;
            Ok(heap.alloc(values))
        }
        serde_json::Value::Object(obj) => {
            use starlark::collections::SmallMap;
            use starlark::values::dict::Dict;

            let mut content = SmallMap::new();
            for (k, v) in obj {
                let key = heap.alloc(k.as_str());
                let value = json_to_starlark_value(heap, v)?;
                content.insert_hashed(
                    key.get_hashed().map_err(|e| anyhow::anyhow!("{}", e))?,
                    value,
                );
            }
            Ok(heap.alloc(Dict::new(content)))
        }
    }
}

fn starlark_to_json_value(value: Value) -> anyhow::Result<serde_json::Value> {
    use starlark::values::{dict::DictRef, list::ListRef};

    if value.is_none() {
        Ok(serde_json::Value::Null)
    } else if let Some(b) = value.unpack_bool() {
        Ok(serde_json::Value::Bool(b))
    } else if let Some(i) = value.unpack_i32() {
        Ok(serde_json::Value::from(i))
    } else if value.get_type() == "int" {
        let text = value.to_string();
        match text.parse::<i64>() {
            Ok(i) => Ok(serde_json::Value::from(i)),
            Err(_) => Ok(number_or_null(text.parse::<f64>().ok())),
        }
    } else if value.get_type() == "float" {
        Ok(number_or_null(value.to_string().parse::<f64>().ok()))
    } else if let Some(s) = value.unpack_str() {
        Ok(serde_json::Value::String(s.to_string()))
    } else if let Some(list) = ListRef::from_value(value) {
        let arr = list
            .iter()
            .map(starlark_to_json_value)
            .collect::<anyhow::Result<Vec<_>>>()?;
        Ok(serde_json::Value::Array(arr))
    } else if let Some(dict) = DictRef::from_value(value) {
        let mut obj = serde_json::Map::new();
        for (k, v) in dict.iter() {
            let key = match k.unpack_str() {
                Some(s) => s.to_string(),
                None => k.to_string(),
            };
            obj.insert(key, starlark_to_json_value(v)?);
        }
        Ok(serde_json::Value::Object(obj))
    } else {
        Ok(serde_json::Value::String(value.to_string()))
    }
}

fn number_or_null(f: Option<f64>) -> serde_json::Value {
    f.and_then(serde_json::Number::from_f64)
        .map_or(serde_json::Value::Null, serde_json::Value::Number)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(value: serde_json::Value) -> Record {
        value.as_object().cloned().unwrap()
    }

    fn meta() -> Metadata {
        Metadata::new(4, Arc::from("app.log"))
    }

    #[test]
    fn test_filter_truthiness() {
        let filter = StarlarkFilter::from_expression("data['level'] == 'error'").unwrap();
        assert!(matches!(
            filter.evaluate(&record(json!({"level": "error"})), &meta()),
            ProcessResult::Keep
        ));
        assert!(matches!(
            filter.evaluate(&record(json!({"level": "info"})), &meta()),
            ProcessResult::Drop
        ));

        let filter = StarlarkFilter::from_expression("data.get('msg', '')").unwrap();
        assert!(matches!(
            filter.evaluate(&record(json!({"msg": ""})), &meta()),
            ProcessResult::Drop
        ));
    }

    #[test]
    fn test_filter_sees_metadata() {
        let filter = StarlarkFilter::from_expression("RNUM == 4 and FILENAME == 'app.log'").unwrap();
        assert!(matches!(
            filter.evaluate(&record(json!({})), &meta()),
            ProcessResult::Keep
        ));
    }

    #[test]
    fn test_filter_runtime_error() {
        let filter = StarlarkFilter::from_expression("data['missing'] > 1").unwrap();
        match filter.evaluate(&record(json!({})), &meta()) {
            ProcessResult::Error(ProcessingError::ScriptError { step, record, .. }) => {
                assert_eq!(step, "filter");
                assert_eq!(record, 4);
            }
            other => panic!("expected script error, got {:?}", other),
        }
    }

    #[test]
    fn test_syntax_error_at_construction() {
        assert!(matches!(
            StarlarkFilter::from_expression("data[["),
            Err(CompilationError::SyntaxError(_))
        ));
        assert!(StarlarkTransform::from_expression("{'a': ").is_err());
    }

    #[test]
    fn test_transform_results() {
        let input = record(json!({"n": 3, "name": "x"}));

        let t = StarlarkTransform::from_expression("{'double': data['n'] * 2}").unwrap();
        match t.evaluate(&input, &meta()) {
            ProcessResult::Transform(r) => assert_eq!(r, record(json!({"double": 6}))),
            other => panic!("unexpected {:?}", other),
        }

        let t = StarlarkTransform::from_expression("[{'a': 1}, 2]").unwrap();
        match t.evaluate(&input, &meta()) {
            ProcessResult::FanOut(rs) => {
                assert_eq!(rs, vec![record(json!({"a": 1})), record(json!({"item": 2}))])
            }
            other => panic!("unexpected {:?}", other),
        }

        let t = StarlarkTransform::from_expression("data['name']").unwrap();
        match t.evaluate(&input, &meta()) {
            ProcessResult::Transform(r) => assert_eq!(r, record(json!({"item": "x"}))),
            other => panic!("unexpected {:?}", other),
        }

        let t = StarlarkTransform::from_expression("data['n'] > 5").unwrap();
        assert!(matches!(t.evaluate(&input, &meta()), ProcessResult::Drop));

        let t = StarlarkTransform::from_expression("None").unwrap();
        assert!(matches!(
            t.evaluate(&input, &meta()),
            ProcessResult::FanOut(rs) if rs.is_empty()
        ));
    }

    #[test]
    fn test_values_survive_conversion() {
        let input = record(json!({"f": 1.5, "big": 10_000_000_000i64, "nested": {"k": [1, "a", null]}}));
        let t = StarlarkTransform::from_expression("data").unwrap();
        match t.evaluate(&input, &meta()) {
            ProcessResult::Transform(r) => {
                assert_eq!(r["f"], json!(1.5));
                assert_eq!(r["nested"], json!({"k": [1, "a", null]}));
                assert_eq!(r["big"].as_f64(), Some(10_000_000_000.0));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_regex_match_helper() {
        let filter = StarlarkFilter::from_expression("regex_match('^err', data['level'])").unwrap();
        assert!(matches!(
            filter.evaluate(&record(json!({"level": "error"})), &meta()),
            ProcessResult::Keep
        ));
        assert!(matches!(
            filter.evaluate(&record(json!({"level": "warn"})), &meta()),
            ProcessResult::Drop
        ));
    }

    #[test]
    fn test_regex_cache_reuses_compiled_pattern() {
        let pattern = "^cached-[0-9]+$";
        let first = get_regex(pattern).unwrap();
        let second = get_regex(pattern).unwrap();
        assert_eq!(first.as_str(), second.as_str());
        assert!(second.is_match("cached-42"));

        let cache = REGEX_CACHE.get().unwrap().lock().unwrap();
        assert!(cache.contains_key(pattern));
        drop(cache);

        assert!(get_regex("(unclosed").is_err());
        let cache = REGEX_CACHE.get().unwrap().lock().unwrap();
        assert!(!cache.contains_key("(unclosed"));
    }

    #[test]
    fn test_regex_match_with_invalid_pattern_is_false() {
        let filter = StarlarkFilter::from_expression("regex_match('(bad', data['level'])").unwrap();
        assert!(matches!(
            filter.evaluate(&record(json!({"level": "(bad"})), &meta()),
            ProcessResult::Drop
        ));
    }

    #[test]
    fn test_fan_out_shares_metadata_and_honours_stop() {
        use crate::pipeline::stream::Seq;

        let transform: Arc<dyn RecordPredicate> =
            Arc::new(StarlarkTransform::from_expression("[1, 2, 3]").unwrap());
        let step = predicate_step(PipelineOptions::default(), Some(transform));

        let input = Seq::from_values("src", vec![record(json!({}))]);
        let mut seen = Vec::new();
        step.apply(input).for_each(|result| {
            let item = result.unwrap();
            assert_eq!(item.metadata.record_number, 0);
            assert_eq!(&*item.metadata.source_name, "src");
            seen.push(item.value);
            seen.len() < 2
        });
        assert_eq!(seen, vec![record(json!({"item": 1})), record(json!({"item": 2}))]);
    }
}
