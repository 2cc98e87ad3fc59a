// src/processors/record.rs
use crate::pipeline::config::PipelineOptions;
use crate::pipeline::context::{render_value, Item, Record};
use crate::pipeline::stream::{Emit, RecordProcessor, Step};
use serde_json::Value;
use std::collections::HashSet;

/// Keep only the listed fields
pub struct SelectFields {
    fields: Vec<String>,
}

impl RecordProcessor<Record, Record> for SelectFields {
    fn process(&mut self, item: Item<Record>, emit: &mut Emit<'_, Record>) -> bool {
        let mut selected = Record::new();
        for field in &self.fields {
            if let Some(value) = item.value.get(field) {
                selected.insert(field.clone(), value.clone());
            }
        }
        emit(Ok(item.with_value(selected)))
    }

    fn name(&self) -> &str {
        "select"
    }
}

pub fn select(opts: PipelineOptions, fields: &[String]) -> Step<Record, Record> {
    if fields.is_empty() {
        return Step::noop();
    }
    Step::from_processor(
        opts,
        SelectFields {
            fields: fields.to_vec(),
        },
    )
}

/// Remove the listed fields
pub struct HideFields {
    fields: Vec<String>,
}

impl RecordProcessor<Record, Record> for HideFields {
    fn process(&mut self, mut item: Item<Record>, emit: &mut Emit<'_, Record>) -> bool {
        for field in &self.fields {
            item.value.remove(field);
        }
        emit(Ok(item))
    }

    fn name(&self) -> &str {
        "hide"
    }
}

pub fn hide(opts: PipelineOptions, fields: &[String]) -> Step<Record, Record> {
    if fields.is_empty() {
        return Step::noop();
    }
    Step::from_processor(
        opts,
        HideFields {
            fields: fields.to_vec(),
        },
    )
}

/// Parse string fields holding embedded JSON objects or arrays in place,
/// so later filters can look inside them.
pub struct ExpandFields {
    fields: Vec<String>,
}

impl RecordProcessor<Record, Record> for ExpandFields {
    fn process(&mut self, mut item: Item<Record>, emit: &mut Emit<'_, Record>) -> bool {
        if !item.is_removed() {
            for field in &self.fields {
                if let Some(Value::String(text)) = item.value.get(field) {
                    if let Ok(expanded @ (Value::Object(_) | Value::Array(_))) =
                        serde_json::from_str::<Value>(text)
                    {
                        item.value.insert(field.clone(), expanded);
                    }
                }
            }
        }
        emit(Ok(item))
    }

    fn name(&self) -> &str {
        "expand"
    }
}

pub fn expand(opts: PipelineOptions, fields: &[String]) -> Step<Record, Record> {
    if fields.is_empty() {
        return Step::noop();
    }
    Step::from_processor(
        opts,
        ExpandFields {
            fields: fields.to_vec(),
        },
    )
}

/// Soft-deletes records whose field value was already seen, or that lack
/// the field entirely.
///
/// Runs after the context stage, so with context windowing on nothing
/// downstream filters soft-deleted records any more; in that mode the
/// records it marks are withheld instead of forwarded.
pub struct DistinctBy {
    field: String,
    seen: HashSet<String>,
    withhold_marked: bool,
}

impl RecordProcessor<Record, Record> for DistinctBy {
    fn process(&mut self, mut item: Item<Record>, emit: &mut Emit<'_, Record>) -> bool {
        if item.is_removed() {
            return emit(Ok(item));
        }

        let is_new = match item.value.get(&self.field) {
            Some(value) => self.seen.insert(render_value(value)),
            None => false,
        };
        if is_new {
            return emit(Ok(item));
        }
        item.mark_removed();
        if self.withhold_marked {
            return true;
        }
        emit(Ok(item))
    }

    fn name(&self) -> &str {
        "distinct_by"
    }
}

pub fn distinct_by(opts: PipelineOptions, field: &str) -> Step<Record, Record> {
    if field.is_empty() {
        return Step::noop();
    }
    Step::from_processor(
        opts,
        DistinctBy {
            field: field.to_string(),
            seen: HashSet::new(),
            withhold_marked: opts.context_enabled,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::stream::Seq;
    use crate::processors::window;
    use serde_json::json;

    fn records(values: Vec<Value>) -> Seq<Record> {
        let records = values
            .into_iter()
            .map(|v| v.as_object().cloned().unwrap())
            .collect();
        Seq::from_values("test", records)
    }

    fn run(step: Step<Record, Record>, input: Vec<Value>) -> Vec<Value> {
        // the trailing context stage drops soft-deleted records
        step.then(window::context(PipelineOptions::default(), 0, 0))
            .apply(records(input))
            .collect_values()
            .into_iter()
            .map(Value::Object)
            .collect()
    }

    #[test]
    fn test_select() {
        let opts = PipelineOptions::default();
        let out = run(select(opts, &["a".to_string()]), vec![json!({"a": 1, "b": 2})]);
        assert_eq!(out, vec![json!({"a": 1})]);

        let out = run(select(opts, &["missing".to_string()]), vec![json!({"a": 1})]);
        assert_eq!(out, vec![json!({})]);
    }

    #[test]
    fn test_hide() {
        let opts = PipelineOptions::default();
        let out = run(
            hide(opts, &["field2".to_string()]),
            vec![json!({"field1": "value1", "field2": "value2"})],
        );
        assert_eq!(out, vec![json!({"field1": "value1"})]);
    }

    #[test]
    fn test_expand() {
        let opts = PipelineOptions::default();
        let out = run(
            expand(opts, &["inner".to_string(), "list".to_string(), "plain".to_string()]),
            vec![json!({
                "inner": r#"{"foo":"bar"}"#,
                "list": r#"[{"prop":"val2"}]"#,
                "plain": "not json",
            })],
        );
        assert_eq!(
            out,
            vec![json!({
                "inner": {"foo": "bar"},
                "list": [{"prop": "val2"}],
                "plain": "not json",
            })]
        );
    }

    #[test]
    fn test_distinct_by() {
        let opts = PipelineOptions::default();
        let out = run(
            distinct_by(opts, "k"),
            vec![json!({"k": 1}), json!({"k": 1}), json!({"x": 5}), json!({"k": 2})],
        );
        assert_eq!(out, vec![json!({"k": 1}), json!({"k": 2})]);
    }

    #[test]
    fn test_distinct_by_uses_rendered_values() {
        let opts = PipelineOptions::default();
        let out = run(
            distinct_by(opts, "k"),
            vec![json!({"k": 1}), json!({"k": "1"}), json!({"k": 1.0})],
        );
        assert_eq!(out, vec![json!({"k": 1})]);
    }

    #[test]
    fn test_distinct_by_with_context_keeps_context_records() {
        let opts = PipelineOptions {
            context_enabled: true,
        };
        let mut context_row = Item::new(
            json!({"k": 1, "ctx": true}).as_object().cloned().unwrap(),
            Default::default(),
        );
        context_row.mark_removed();
        let items = vec![
            Item::new(json!({"k": 1}).as_object().cloned().unwrap(), Default::default()),
            context_row,
            Item::new(json!({"k": 1}).as_object().cloned().unwrap(), Default::default()),
        ];

        let out: Vec<Value> = distinct_by(opts, "k")
            .apply(Seq::from_items(items))
            .collect_values()
            .into_iter()
            .map(Value::Object)
            .collect();
        assert_eq!(out, vec![json!({"k": 1}), json!({"k": 1, "ctx": true})]);
    }

    #[test]
    fn test_empty_configuration_is_identity() {
        let opts = PipelineOptions::default();
        let input = vec![json!({"a": 1}), json!({"b": 2})];
        let step = Step::combine(select(opts, &[]), hide(opts, &[]), vec![distinct_by(opts, "")]);
        assert_eq!(run(step, input.clone()), input);
    }
}
