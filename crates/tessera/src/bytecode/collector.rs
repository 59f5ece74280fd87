//! Batching of collection literals and argument arrays.
//!
//! Elements are evaluated onto the value stack and folded into the collection
//! under construction once the batch is full. A starred element flushes the
//! pending batch and merges its iterable as a whole. Each collection opcode
//! carries at most [`CollectionBits::MAX_STACK_ELEMENT_COUNT`] stack items, so
//! arbitrarily long literals never need an unbounded stack.

use super::{
    op::{CollectionBits, Opcode},
    unit::CompilationUnit,
};

/// How pending items and merged collections are combined.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Merge {
    /// `COLLECTION_ADD_STACK` / `COLLECTION_ADD_COLLECTION` into the collection on the stack.
    Extend,
    /// Keyword dicts: build a fresh dict and merge it with `KWARGS_DICT_MERGE`,
    /// which rejects duplicate keys at runtime.
    KwargsMerge,
}

/// Tracks the stack while one collection is being built.
#[derive(Debug)]
pub(crate) struct Collector {
    type_bits: i32,
    items_per_entry: i32,
    batch_size: i32,
    /// Items pushed since the last flush.
    stack_items: i32,
    collection_on_stack: bool,
    merge: Merge,
}

impl Collector {
    /// Starts a collection of kind `type_bits`. `already_on_stack` items pushed
    /// before the collector was created become its first elements.
    pub fn new(type_bits: i32, batch_size: u8, already_on_stack: i32) -> Self {
        Self {
            type_bits,
            items_per_entry: if type_bits == CollectionBits::DICT { 2 } else { 1 },
            batch_size: i32::from(batch_size),
            stack_items: already_on_stack,
            collection_on_stack: false,
            merge: Merge::Extend,
        }
    }

    /// A dict collector for `**` keyword arguments.
    pub fn kwargs_merging(batch_size: u8) -> Self {
        Self {
            merge: Merge::KwargsMerge,
            ..Self::new(CollectionBits::DICT, batch_size, 0)
        }
    }

    /// Records one element (or one key/value pair) just pushed on the stack.
    pub fn append_item(&mut self, unit: &mut CompilationUnit<'_>) {
        self.stack_items += self.items_per_entry;
        if self.stack_items + self.items_per_entry > self.batch_size {
            self.flush(unit);
        }
    }

    /// Flushes pending items, before a starred element is evaluated.
    pub fn flush_if_necessary(&mut self, unit: &mut CompilationUnit<'_>) {
        if self.stack_items > 0 {
            self.flush(unit);
        }
    }

    /// Merges the iterable (or mapping) just pushed on the stack.
    pub fn append_collection(&mut self, unit: &mut CompilationUnit<'_>) {
        debug_assert_eq!(self.stack_items, 0, "pending items must be flushed before a splat");
        match (self.collection_on_stack, self.merge) {
            (true, Merge::Extend) => emit(unit, Opcode::CollectionAddCollection, self.type_bits),
            (true, Merge::KwargsMerge) => emit(unit, Opcode::KwargsDictMerge, 0),
            (false, _) => emit(unit, Opcode::CollectionFromCollection, self.type_bits),
        }
        self.collection_on_stack = true;
    }

    /// Leaves exactly one finished collection on the stack.
    pub fn finish(mut self, unit: &mut CompilationUnit<'_>) {
        if self.stack_items > 0 || !self.collection_on_stack {
            self.flush(unit);
        }
    }

    fn flush(&mut self, unit: &mut CompilationUnit<'_>) {
        debug_assert!(self.stack_items <= CollectionBits::MAX_STACK_ELEMENT_COUNT);
        let arg = self.type_bits | self.stack_items;
        match (self.collection_on_stack, self.merge) {
            (true, Merge::Extend) => emit(unit, Opcode::CollectionAddStack, arg),
            (true, Merge::KwargsMerge) => {
                emit(unit, Opcode::CollectionFromStack, arg);
                emit(unit, Opcode::KwargsDictMerge, 0);
            }
            (false, _) => emit(unit, Opcode::CollectionFromStack, arg),
        }
        self.collection_on_stack = true;
        self.stack_items = 0;
    }
}

fn emit(unit: &mut CompilationUnit<'_>, opcode: Opcode, arg: i32) {
    unit.emit(opcode, arg, Default::default(), None);
}
