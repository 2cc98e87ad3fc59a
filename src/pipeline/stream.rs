// src/pipeline/stream.rs
use crate::error::ProcessingError;
use crate::pipeline::config::PipelineOptions;
use crate::pipeline::context::{Item, Metadata};
use std::sync::Arc;

/// What a producer hands to its consumer for every pull
pub type StepResult<T> = Result<Item<T>, ProcessingError>;

/// Consumer callback. Returning `false` asks the producer to stop.
pub type Emit<'a, T> = dyn FnMut(StepResult<T>) -> bool + 'a;

/// A lazy, pull-driven sequence of items.
///
/// Nothing is produced until [`Seq::run`] is called, and the producer stops
/// as soon as the consumer returns `false`.
pub struct Seq<T> {
    producer: Box<dyn FnOnce(&mut Emit<'_, T>) + Send>,
}

impl<T: Send + 'static> Seq<T> {
    pub fn new<F>(producer: F) -> Self
    where
        F: FnOnce(&mut Emit<'_, T>) + Send + 'static,
    {
        Seq {
            producer: Box::new(producer),
        }
    }

    pub fn empty() -> Self {
        Seq::new(|_emit: &mut Emit<'_, T>| {})
    }

    /// Sequence over already materialized items
    pub fn from_items(items: Vec<Item<T>>) -> Self {
        Seq::new(move |emit: &mut Emit<'_, T>| {
            for item in items {
                if !emit(Ok(item)) {
                    break;
                }
            }
        })
    }

    /// Sequence over plain values, numbered from 0 like lines of a source
    pub fn from_values(source_name: &str, values: Vec<T>) -> Self {
        let source_name: Arc<str> = Arc::from(source_name);
        let items = values
            .into_iter()
            .enumerate()
            .map(|(i, value)| Item::new(value, Metadata::new(i, source_name.clone())))
            .collect();
        Seq::from_items(items)
    }

    /// Drive the sequence, feeding every result to `emit`
    pub fn run(self, emit: &mut Emit<'_, T>) {
        (self.producer)(emit)
    }

    pub fn for_each<F>(self, mut consumer: F)
    where
        F: FnMut(StepResult<T>) -> bool,
    {
        self.run(&mut consumer)
    }

    /// Drain everything into a vector
    pub fn collect(self) -> Vec<StepResult<T>> {
        let mut results = Vec::new();
        self.for_each(|result| {
            results.push(result);
            true
        });
        results
    }

    /// Drain everything, keeping only the values of successful items
    pub fn collect_values(self) -> Vec<T> {
        self.collect()
            .into_iter()
            .filter_map(|result| result.ok().map(|item| item.value))
            .collect()
    }
}

/// Main trait for record processing steps.
///
/// `process` is called once per upstream item and may emit any number of
/// items. Returning `false` cancels everything upstream. `finish` runs
/// once after the upstream is exhausted, unless it was cancelled.
pub trait RecordProcessor<In, Out>: Send {
    fn process(&mut self, item: Item<In>, emit: &mut Emit<'_, Out>) -> bool;

    fn finish(&mut self, _emit: &mut Emit<'_, Out>) {}

    fn name(&self) -> &str;
}

/// A transformation from one sequence into another
pub struct Step<In, Out> {
    apply: Box<dyn FnOnce(Seq<In>) -> Seq<Out> + Send>,
}

impl<In: Send + 'static, Out: Send + 'static> Step<In, Out> {
    pub fn new<F>(apply: F) -> Self
    where
        F: FnOnce(Seq<In>) -> Seq<Out> + Send + 'static,
    {
        Step {
            apply: Box::new(apply),
        }
    }

    /// Build a step around a per-item processor.
    ///
    /// Upstream errors are forwarded untouched. When context windowing is
    /// off, soft-deleted items are dropped here before the processor sees
    /// them.
    pub fn from_processor<P>(opts: PipelineOptions, processor: P) -> Self
    where
        P: RecordProcessor<In, Out> + 'static,
    {
        Step::new(move |input: Seq<In>| {
            let mut processor = processor;
            Seq::new(move |emit: &mut Emit<'_, Out>| {
                let mut cancelled = false;
                input.run(&mut |result: StepResult<In>| {
                    let keep_going = match result {
                        Err(err) => emit(Err(err)),
                        Ok(item) if item.is_removed() && !opts.context_enabled => true,
                        Ok(item) => processor.process(item, &mut *emit),
                    };
                    if !keep_going {
                        cancelled = true;
                    }
                    keep_going
                });

                if !cancelled {
                    processor.finish(emit);
                } else {
                    tracing::trace!(step = processor.name(), "cancelled by consumer");
                }
            })
        })
    }

    pub fn apply(self, input: Seq<In>) -> Seq<Out> {
        (self.apply)(input)
    }

    /// Feed this step's output into `next`
    pub fn then<Next: Send + 'static>(self, next: Step<Out, Next>) -> Step<In, Next> {
        Step::new(move |input: Seq<In>| next.apply(self.apply(input)))
    }
}

impl<T: Send + 'static> Step<T, T> {
    /// Identity step
    pub fn noop() -> Self {
        Step::new(|input: Seq<T>| input)
    }

    /// Chain steps left to right: `first` sees the input, the last one
    /// produces the output.
    pub fn combine(first: Step<T, T>, second: Step<T, T>, rest: Vec<Step<T, T>>) -> Self {
        rest.into_iter()
            .fold(first.then(second), |combined, step| combined.then(step))
    }
}
