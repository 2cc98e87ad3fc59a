// src/processors/window.rs
use crate::pipeline::config::{clamp_count, PipelineOptions};
use crate::pipeline::context::Item;
use crate::pipeline::stream::{Emit, RecordProcessor, Step};

/// Fixed-capacity circular store; the oldest entry is overwritten once full
#[derive(Debug, Clone)]
pub struct RingBuffer<T> {
    items: Vec<T>,
    capacity: usize,
    head: usize,
    wrapped: bool,
}

impl<T> RingBuffer<T> {
    pub fn new(capacity: usize) -> Self {
        RingBuffer {
            items: Vec::with_capacity(capacity),
            capacity,
            head: 0,
            wrapped: false,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Store `item`, evicting the oldest entry when full. A zero-capacity
    /// buffer drops everything.
    pub fn add(&mut self, item: T) {
        if self.capacity == 0 {
            return;
        }

        if self.wrapped {
            self.items[self.head] = item;
        } else {
            self.items.push(item);
        }

        self.head += 1;
        if self.head >= self.capacity {
            self.head = 0;
            self.wrapped = true;
        }
    }

    /// Entries from oldest to newest
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        let split = if self.wrapped { self.head } else { self.items.len() };
        let (newer, older) = self.items.split_at(split);
        older.iter().chain(newer.iter())
    }

    /// Remove and return every entry, oldest first, leaving the buffer empty
    pub fn take(&mut self) -> Vec<T> {
        let mut items = std::mem::take(&mut self.items);
        if self.wrapped {
            items.rotate_left(self.head);
        }
        self.items = Vec::with_capacity(self.capacity);
        self.head = 0;
        self.wrapped = false;
        items
    }
}

/// Pass through the first `count` items, then cancel everything upstream
pub struct FirstProcessor {
    limit: usize,
    returned: usize,
}

impl<T: Send + 'static> RecordProcessor<T, T> for FirstProcessor {
    fn process(&mut self, item: Item<T>, emit: &mut Emit<'_, T>) -> bool {
        self.returned += 1;
        if self.returned > self.limit {
            return false;
        }

        emit(Ok(item)) && self.returned < self.limit
    }

    fn name(&self) -> &str {
        "first"
    }
}

pub fn first<T: Send + 'static>(opts: PipelineOptions, count: i64) -> Step<T, T> {
    match clamp_count(count) {
        0 => Step::noop(),
        limit => Step::from_processor(opts, FirstProcessor { limit, returned: 0 }),
    }
}

/// Keep the last `count` items and release them once upstream is exhausted
pub struct LastProcessor<T> {
    buffer: RingBuffer<Item<T>>,
}

impl<T: Send + 'static> RecordProcessor<T, T> for LastProcessor<T> {
    fn process(&mut self, item: Item<T>, _emit: &mut Emit<'_, T>) -> bool {
        self.buffer.add(item);
        true
    }

    fn finish(&mut self, emit: &mut Emit<'_, T>) {
        for item in self.buffer.take() {
            if !emit(Ok(item)) {
                return;
            }
        }
    }

    fn name(&self) -> &str {
        "last"
    }
}

pub fn last<T: Send + 'static>(opts: PipelineOptions, count: i64) -> Step<T, T> {
    match clamp_count(count) {
        0 => Step::noop(),
        size => Step::from_processor(
            opts,
            LastProcessor {
                buffer: RingBuffer::new(size),
            },
        ),
    }
}

/// Emits matches plus up to `before` leading and `after` trailing
/// soft-deleted neighbours.
///
/// With context disabled this only filters out removed items.
pub struct ContextProcessor<T> {
    enabled: bool,
    before: RingBuffer<Item<T>>,
    after: usize,
    remaining_after: usize,
}

impl<T: Send + 'static> RecordProcessor<T, T> for ContextProcessor<T> {
    fn process(&mut self, item: Item<T>, emit: &mut Emit<'_, T>) -> bool {
        if !self.enabled {
            return if item.is_removed() { true } else { emit(Ok(item)) };
        }

        if !item.is_removed() {
            for buffered in self.before.take() {
                if !emit(Ok(buffered)) {
                    return false;
                }
            }
            self.remaining_after = self.after;
            return emit(Ok(item));
        }

        if self.remaining_after > 0 {
            self.remaining_after -= 1;
            return emit(Ok(item));
        }

        self.before.add(item);
        true
    }

    fn name(&self) -> &str {
        "context"
    }
}

pub fn context<T: Send + 'static>(opts: PipelineOptions, before: usize, after: usize) -> Step<T, T> {
    Step::from_processor(
        opts,
        ContextProcessor {
            enabled: opts.context_enabled,
            before: RingBuffer::new(before),
            after,
            remaining_after: 0,
        },
    )
}
