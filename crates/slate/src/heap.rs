//! The reference-counted heap arena.
//!
//! Every `Value::Ref` variant is a `HeapId` handle into this arena. Slots
//! are reused via a free list once their refcount reaches zero; a
//! generation counter on each slot prevents a stale `HeapId` from a freed
//! slot resolving to whatever was reallocated into it afterward.

use std::sync::atomic::{AtomicUsize, Ordering};

use indexmap::IndexMap;

use crate::dynint::DynInt;
use crate::intern::StringId;
use crate::value::Value;

/// Handle to a heap-allocated value. Carries a generation so a handle
/// outliving its slot's reuse is detectable rather than silently aliasing
/// new data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HeapId {
    index: u32,
    generation: u32,
}

/// A single upvalue cell: open cells still read through a live stack slot;
/// closed cells own their captured value directly.
#[derive(Debug)]
pub enum Cell {
    Open(usize),
    Closed(Value),
}

/// An upvalue descriptor baked into a `Function`'s bytecode by the compiler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpvalueDesc {
    pub is_local: bool,
    pub parent_index: u16,
}

/// Everything a `Function` value needs at call time: its compiled chunk and
/// the shape of the upvalues it captures when a `Closure` is made from it.
#[derive(Debug)]
pub struct FunctionData {
    pub name: Option<StringId>,
    pub arity: u8,
    pub code: crate::bytecode::Code,
    pub upvalues: Vec<UpvalueDesc>,
}

#[derive(Debug)]
pub struct ClosureData {
    pub function: HeapId,
    pub cells: Vec<HeapId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IteratorKind {
    Array,
    Range,
}

#[derive(Debug)]
pub struct IteratorData {
    pub kind: IteratorKind,
    /// Next index to yield, for an array iterator; next value to yield, for
    /// a range iterator represented as an i64 when it fits (ranges over
    /// BigInt bounds fall back to stepping the `DynInt` stored in `cursor_big`).
    pub cursor: i64,
    pub cursor_big: Option<DynInt>,
    pub exhausted: bool,
    /// Strong reference to the array/range this iterator walks.
    pub source: HeapId,
}

#[derive(Debug)]
pub struct RangeData {
    pub start: Value,
    pub end: Value,
    pub exclusive: bool,
    pub step: Value,
}

#[derive(Debug)]
pub struct BoundMethodData {
    pub receiver: Value,
    pub method: Value,
}

#[derive(Debug)]
pub struct ClassData {
    pub name: StringId,
    pub prototype: IndexMap<StringId, Value>,
}

/// The payload stored behind a `HeapId`, one variant per heap-bearing
/// `Value` tag.
#[derive(Debug)]
pub enum HeapData {
    Str(Box<str>),
    Array(Vec<Value>),
    Object(IndexMap<StringId, Value>),
    Range(RangeData),
    Iterator(IteratorData),
    Function(FunctionData),
    Closure(ClosureData),
    BoundMethod(BoundMethodData),
    Class(ClassData),
    BigInt(DynInt),
    Cell(Cell),
}

struct Slot {
    refcount: AtomicUsize,
    generation: u32,
    data: Option<HeapData>,
}

/// The refcounted arena backing every heap-bearing `Value`.
#[derive(Default)]
pub struct Heap {
    slots: Vec<Slot>,
    free_list: Vec<u32>,
}

impl Heap {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates `data` with an initial refcount of 1, returning its handle.
    pub fn allocate(&mut self, data: HeapData) -> HeapId {
        if let Some(index) = self.free_list.pop() {
            let slot = &mut self.slots[index as usize];
            slot.generation = slot.generation.wrapping_add(1);
            slot.data = Some(data);
            *slot.refcount.get_mut() = 1;
            HeapId { index, generation: slot.generation }
        } else {
            let index = u32::try_from(self.slots.len()).expect("heap overflow");
            self.slots.push(Slot { refcount: AtomicUsize::new(1), generation: 0, data: Some(data) });
            HeapId { index, generation: 0 }
        }
    }

    fn slot(&self, id: HeapId) -> &Slot {
        let slot = &self.slots[id.index as usize];
        assert_eq!(slot.generation, id.generation, "stale HeapId access");
        slot
    }

    fn slot_mut(&mut self, id: HeapId) -> &mut Slot {
        let slot = &mut self.slots[id.index as usize];
        assert_eq!(slot.generation, id.generation, "stale HeapId access");
        slot
    }

    #[must_use]
    pub fn get(&self, id: HeapId) -> &HeapData {
        self.slot(id).data.as_ref().expect("use of released HeapId")
    }

    pub fn get_mut(&mut self, id: HeapId) -> &mut HeapData {
        self.slot_mut(id).data.as_mut().expect("use of released HeapId")
    }

    /// Increments the refcount of `id`. Takes `&self` (atomic counter) so
    /// callers holding only a shared reference (e.g. while also holding a
    /// borrow of another slot) can still retain a value.
    pub fn inc_ref(&self, id: HeapId) {
        self.slot(id).refcount.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn refcount(&self, id: HeapId) -> usize {
        self.slot(id).refcount.load(Ordering::Relaxed)
    }

    /// Decrements the refcount of `id`; at zero, frees the slot and
    /// recursively releases any `Value`s it contained.
    pub fn dec_ref(&mut self, id: HeapId) {
        let remaining = self.slot(id).refcount.fetch_sub(1, Ordering::Relaxed) - 1;
        if remaining != 0 {
            return;
        }
        let data = self.slot_mut(id).data.take().expect("double release of HeapId");
        self.slots[id.index as usize].refcount = AtomicUsize::new(0);
        self.free_list.push(id.index);
        self.release_children(data);
    }

    fn release_children(&mut self, data: HeapData) {
        match data {
            HeapData::Array(items) => {
                for item in items {
                    item.release(self);
                }
            }
            HeapData::Object(map) => {
                for (_, v) in map {
                    v.release(self);
                }
            }
            HeapData::Range(r) => {
                r.start.release(self);
                r.end.release(self);
                r.step.release(self);
            }
            HeapData::Iterator(it) => {
                self.dec_ref(it.source);
            }
            HeapData::Closure(c) => {
                self.dec_ref(c.function);
                for cell in c.cells {
                    self.dec_ref(cell);
                }
            }
            HeapData::BoundMethod(bm) => {
                bm.receiver.release(self);
                bm.method.release(self);
            }
            HeapData::Class(cls) => {
                for (_, v) in cls.prototype {
                    v.release(self);
                }
            }
            HeapData::Cell(Cell::Closed(v)) => {
                v.release(self);
            }
            HeapData::Cell(Cell::Open(_))
            | HeapData::Str(_)
            | HeapData::Function(_)
            | HeapData::BigInt(_) => {}
        }
    }

    /// Total number of live (non-freed) slots. Used by tests asserting that
    /// `destroy()` leaves no leaked allocations.
    #[must_use]
    pub fn live_count(&self) -> usize {
        self.slots.len() - self.free_list.len()
    }
}

#[cfg(test)]
mod tests {
    use super::{Heap, HeapData};

    #[test]
    fn allocate_and_release_frees_slot() {
        let mut heap = Heap::new();
        let id = heap.allocate(HeapData::Str("hi".into()));
        assert_eq!(heap.live_count(), 1);
        heap.dec_ref(id);
        assert_eq!(heap.live_count(), 0);
    }

    #[test]
    fn retain_keeps_alive_until_both_released() {
        let mut heap = Heap::new();
        let id = heap.allocate(HeapData::Str("hi".into()));
        heap.inc_ref(id);
        heap.dec_ref(id);
        assert_eq!(heap.live_count(), 1);
        heap.dec_ref(id);
        assert_eq!(heap.live_count(), 0);
    }

    #[test]
    fn releasing_array_releases_heap_children() {
        let mut heap = Heap::new();
        let inner = heap.allocate(HeapData::Str("inner".into()));
        let arr = heap.allocate(HeapData::Array(vec![crate::value::Value::Ref(inner)]));
        assert_eq!(heap.live_count(), 2);
        heap.dec_ref(arr);
        assert_eq!(heap.live_count(), 0);
    }

    #[test]
    fn freed_slot_is_reused() {
        let mut heap = Heap::new();
        let a = heap.allocate(HeapData::Str("a".into()));
        heap.dec_ref(a);
        let b = heap.allocate(HeapData::Str("b".into()));
        assert_eq!(heap.live_count(), 1);
        match heap.get(b) {
            HeapData::Str(s) => assert_eq!(&**s, "b"),
            _ => panic!("expected string"),
        }
    }
}
