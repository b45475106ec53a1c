//! Item reader, processor and writer contracts plus a few in-memory adapters.

use std::sync::{Arc, Mutex};

use forgebatch_core::ExecutionContext;

/// Lifecycle hooks for components that keep restart state in the step's
/// [`ExecutionContext`].
///
/// `update` is called after every committed chunk, so whatever it stores
/// reflects committed progress only.
pub trait ItemStream {
    fn open(&mut self, _context: &mut ExecutionContext) -> anyhow::Result<()> {
        Ok(())
    }

    fn update(&mut self, _context: &mut ExecutionContext) -> anyhow::Result<()> {
        Ok(())
    }

    fn close(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Source of items; `Ok(None)` means the source is exhausted.
pub trait ItemReader<T>: ItemStream {
    fn read(&mut self) -> anyhow::Result<Option<T>>;
}

/// Transform one item. `Ok(None)` filters the item out of the chunk.
pub trait ItemProcessor<I, O> {
    fn process(&mut self, item: &I) -> anyhow::Result<Option<O>>;
}

impl<I, O, F> ItemProcessor<I, O> for F
where
    F: FnMut(&I) -> anyhow::Result<Option<O>>,
{
    fn process(&mut self, item: &I) -> anyhow::Result<Option<O>> {
        self(item)
    }
}

/// Sink for a whole chunk; a failure fails the chunk.
pub trait ItemWriter<O>: ItemStream {
    fn write(&mut self, items: &[O]) -> anyhow::Result<()>;
}

/// Hands every item through unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassThroughItemProcessor;

impl<T: Clone> ItemProcessor<T, T> for PassThroughItemProcessor {
    fn process(&mut self, item: &T) -> anyhow::Result<Option<T>> {
        Ok(Some(item.clone()))
    }
}

/// Reads from a vector and records its offset so a restart resumes where the
/// last committed chunk ended.
#[derive(Debug, Clone)]
pub struct VecItemReader<T> {
    items: Vec<T>,
    offset: usize,
    offset_key: String,
}

impl<T> VecItemReader<T> {
    pub fn new(items: Vec<T>) -> Self {
        Self::named("vec_item_reader", items)
    }

    /// `name` scopes the context key, for steps with more than one reader.
    pub fn named(name: &str, items: Vec<T>) -> Self {
        Self {
            items,
            offset: 0,
            offset_key: format!("{name}.offset"),
        }
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn offset_key(&self) -> &str {
        &self.offset_key
    }
}

impl<T> ItemStream for VecItemReader<T> {
    fn open(&mut self, context: &mut ExecutionContext) -> anyhow::Result<()> {
        let offset = context.get_long_or(&self.offset_key, 0)?;
        self.offset = usize::try_from(offset)?.min(self.items.len());
        Ok(())
    }

    fn update(&mut self, context: &mut ExecutionContext) -> anyhow::Result<()> {
        context.put(self.offset_key.clone(), i64::try_from(self.offset)?);
        Ok(())
    }
}

impl<T: Clone> ItemReader<T> for VecItemReader<T> {
    fn read(&mut self) -> anyhow::Result<Option<T>> {
        let item = self.items.get(self.offset).cloned();
        if item.is_some() {
            self.offset += 1;
        }
        Ok(item)
    }
}

/// Collects written items into a shared vector.
#[derive(Debug)]
pub struct ListItemWriter<T> {
    written: Arc<Mutex<Vec<T>>>,
}

impl<T> Default for ListItemWriter<T> {
    fn default() -> Self {
        Self {
            written: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl<T: Clone> ListItemWriter<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shared view of the written items, usable after the writer moved into a step.
    pub fn handle(&self) -> Arc<Mutex<Vec<T>>> {
        Arc::clone(&self.written)
    }
}

impl<T> ItemStream for ListItemWriter<T> {}

impl<T: Clone> ItemWriter<T> for ListItemWriter<T> {
    fn write(&mut self, items: &[T]) -> anyhow::Result<()> {
        let mut written = self
            .written
            .lock()
            .map_err(|_| anyhow::anyhow!("list writer lock poisoned"))?;
        written.extend_from_slice(items);
        Ok(())
    }
}
