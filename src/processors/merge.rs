// src/processors/merge.rs
//! K-way merge of independently paced record sequences.
//!
//! Each source gets a worker thread that pulls from its sequence and pushes
//! keyed items into a bounded queue. The consuming side repeatedly picks the
//! source whose head has the smallest key. Output is globally ordered only
//! if every source is already sorted by the merge key.

use crate::pipeline::config::MERGE_QUEUE_CAPACITY;
use crate::pipeline::context::{render_value, Item, Record};
use crate::pipeline::stream::{Emit, Seq, StepResult};
use crossbeam::channel::{self, select, Receiver, Sender};
use serde_json::Value;
use std::thread;

/// Merge key of one record: the value of the first configured key field
/// present in it.
#[derive(Debug, Clone, PartialEq)]
pub enum MergeKey {
    /// None of the key fields is present
    Missing,
    Present(Value),
}

impl MergeKey {
    pub fn extract(record: &Record, key_fields: &[String]) -> Self {
        key_fields
            .iter()
            .find_map(|field| record.get(field))
            .map_or(MergeKey::Missing, |value| MergeKey::Present(value.clone()))
    }

    fn kind(&self) -> KeyKind<'_> {
        match self {
            MergeKey::Present(Value::String(s)) => KeyKind::Text(s),
            MergeKey::Present(Value::Bool(b)) => KeyKind::Bool(*b),
            MergeKey::Present(Value::Number(n)) => match n.as_f64() {
                Some(f) => KeyKind::Number(f),
                None => KeyKind::Other,
            },
            _ => KeyKind::Other,
        }
    }

    /// Text form used by the comparison fallbacks; a missing key renders
    /// empty.
    fn render(&self) -> String {
        match self {
            MergeKey::Missing => String::new(),
            MergeKey::Present(value) => render_value(value),
        }
    }
}

enum KeyKind<'a> {
    Text(&'a str),
    Bool(bool),
    Number(f64),
    Other,
}

/// Ordering used by the merge. The dynamic type of `left` decides how the
/// two keys are compared, so the relation is not symmetric across types:
///
/// * string: byte-wise, against the text form of a non-string `right`
/// * bool: `false < true`; a non-bool `right` counts as `true` when its
///   text form is non-empty
/// * number: numeric, or text forms when `right` is not a number
/// * anything else: text forms of both sides
pub fn key_less(left: &MergeKey, right: &MergeKey) -> bool {
    match left.kind() {
        KeyKind::Text(l) => match right.kind() {
            KeyKind::Text(r) => l < r,
            _ => l < right.render().as_str(),
        },
        KeyKind::Bool(l) => match right.kind() {
            KeyKind::Bool(r) => !l && r,
            _ => !l && !right.render().is_empty(),
        },
        KeyKind::Number(l) => match right.kind() {
            KeyKind::Number(r) => l < r,
            _ => left.render() < right.render(),
        },
        KeyKind::Other => left.render() < right.render(),
    }
}

struct KeyedItem {
    result: StepResult<Record>,
    key: MergeKey,
}

impl KeyedItem {
    fn new(result: StepResult<Record>, key_fields: &[String]) -> Self {
        let key = match &result {
            Ok(item) => MergeKey::extract(&item.value, key_fields),
            Err(_) => MergeKey::Missing,
        };
        KeyedItem { result, key }
    }
}

/// Consumer-side view of one source queue
struct SourceCursor {
    index: usize,
    queue: Receiver<KeyedItem>,
    head: Option<Item<Record>>,
    key: MergeKey,
}

impl SourceCursor {
    fn new(index: usize, queue: Receiver<KeyedItem>) -> Self {
        SourceCursor {
            index,
            queue,
            head: None,
            key: MergeKey::Missing,
        }
    }

    /// Load the next record; false once the source is exhausted. Error
    /// items are skipped.
    fn advance(&mut self) -> bool {
        for keyed in self.queue.iter() {
            match keyed.result {
                Ok(item) => {
                    self.head = Some(item);
                    self.key = keyed.key;
                    return true;
                }
                Err(err) => {
                    tracing::debug!(source = self.index, error = %err, "merge dropped error item");
                }
            }
        }
        self.head = None;
        false
    }

    fn take_head(&mut self) -> Option<Item<Record>> {
        self.head.take()
    }
}

/// Merge `inputs` into one sequence ordered by `key_fields`.
///
/// A single input is returned as is, without starting any thread.
pub fn merge(key_fields: Vec<String>, mut inputs: Vec<Seq<Record>>) -> Seq<Record> {
    match inputs.len() {
        0 => return Seq::empty(),
        1 => return inputs.remove(0),
        _ => {}
    }

    Seq::new(move |emit: &mut Emit<'_, Record>| {
        let key_fields = key_fields.as_slice();
        thread::scope(|scope| {
            let mut cursors = Vec::with_capacity(inputs.len());
            let mut cancels = Vec::with_capacity(inputs.len());

            for (index, input) in inputs.into_iter().enumerate() {
                let (queue_tx, queue_rx) = channel::bounded(MERGE_QUEUE_CAPACITY);
                let (cancel_tx, cancel_rx) = channel::bounded(1);
                scope.spawn(move || feed_queue(index, input, key_fields, queue_tx, cancel_rx));
                cursors.push(SourceCursor::new(index, queue_rx));
                cancels.push(cancel_tx);
            }

            if !emit_in_key_order(cursors, emit) {
                tracing::debug!("merge cancelled by consumer, stopping workers");
                for cancel in &cancels {
                    let _ = cancel.try_send(());
                }
            }
        });
    })
}

/// Worker body: pull from `input` until it is exhausted or cancelled
fn feed_queue(
    index: usize,
    input: Seq<Record>,
    key_fields: &[String],
    queue: Sender<KeyedItem>,
    cancel: Receiver<()>,
) {
    tracing::debug!(source = index, "merge worker started");
    input.run(&mut |result: StepResult<Record>| {
        if cancel.try_recv().is_ok() {
            return false;
        }

        let keyed = KeyedItem::new(result, key_fields);
        select! {
            recv(cancel) -> _ => false,
            send(queue, keyed) -> sent => sent.is_ok(),
        }
    });
    tracing::debug!(source = index, "merge worker finished");
}

/// Selection loop. Returns false if the consumer asked to stop.
///
/// Dropping the cursors on return disconnects every queue, so a worker
/// blocked on a full queue wakes up and exits.
fn emit_in_key_order(mut cursors: Vec<SourceCursor>, emit: &mut Emit<'_, Record>) -> bool {
    cursors.retain_mut(SourceCursor::advance);

    while cursors.len() > 1 {
        let mut selected = 0;
        for i in 1..cursors.len() {
            if key_less(&cursors[i].key, &cursors[selected].key) {
                selected = i;
            }
        }

        if let Some(item) = cursors[selected].take_head() {
            if !emit(Ok(item)) {
                return false;
            }
        }

        if !cursors[selected].advance() {
            cursors.remove(selected);
        }
    }

    if let Some(last) = cursors.first_mut() {
        loop {
            if let Some(item) = last.take_head() {
                if !emit(Ok(item)) {
                    return false;
                }
            }
            if !last.advance() {
                break;
            }
        }
    }

    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn key(value: Value) -> MergeKey {
        MergeKey::Present(value)
    }

    #[test]
    fn test_extract_first_present_field() {
        let fields = vec!["ts1".to_string(), "ts2".to_string()];
        let record = json!({"ts2": "b", "ts1": "a"}).as_object().unwrap().clone();
        assert_eq!(MergeKey::extract(&record, &fields), key(json!("a")));

        let record = json!({"ts2": "b"}).as_object().unwrap().clone();
        assert_eq!(MergeKey::extract(&record, &fields), key(json!("b")));

        let record = json!({"other": 1}).as_object().unwrap().clone();
        assert_eq!(MergeKey::extract(&record, &fields), MergeKey::Missing);
    }

    #[test]
    fn test_string_keys() {
        assert!(key_less(&key(json!("2024-01-01")), &key(json!("2024-01-02"))));
        assert!(!key_less(&key(json!("b")), &key(json!("a"))));
        assert!(!key_less(&key(json!("a")), &key(json!("a"))));
        // falls back to the text form of the right side
        assert!(key_less(&key(json!("1")), &key(json!(2))));
        assert!(!key_less(&key(json!("3")), &key(json!(2))));
    }

    #[test]
    fn test_bool_keys() {
        assert!(key_less(&key(json!(false)), &key(json!(true))));
        assert!(!key_less(&key(json!(true)), &key(json!(false))));
        assert!(!key_less(&key(json!(false)), &key(json!(false))));
        assert!(key_less(&key(json!(false)), &key(json!("x"))));
        assert!(!key_less(&key(json!(false)), &key(json!(""))));
        assert!(!key_less(&key(json!(false)), &MergeKey::Missing));
    }

    #[test]
    fn test_number_keys() {
        assert!(key_less(&key(json!(2)), &key(json!(10))));
        assert!(key_less(&key(json!(1.5)), &key(json!(2))));
        assert!(!key_less(&key(json!(10)), &key(json!(2))));
        // text comparison against a non-number: "10" < "2"
        assert!(key_less(&key(json!(10)), &key(json!("2"))));
    }

    #[test]
    fn test_comparison_is_left_typed() {
        // number on the left compares text forms, string on the left too,
        // but a bool on the right is only special when it is on the left
        assert!(key_less(&key(json!(1)), &key(json!("a"))));
        assert!(key_less(&key(json!("false")), &key(json!(true))));
        assert!(!key_less(&key(json!(true)), &key(json!("false"))));
    }

    #[test]
    fn test_missing_key_compares_as_empty() {
        assert!(key_less(&MergeKey::Missing, &key(json!("a"))));
        assert!(key_less(&MergeKey::Missing, &key(json!(0))));
        assert!(!key_less(&key(json!("a")), &MergeKey::Missing));
        assert!(!key_less(&MergeKey::Missing, &MergeKey::Missing));
    }
}
