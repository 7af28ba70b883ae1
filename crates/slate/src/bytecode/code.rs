//! `Code`: a compiled function body (bytecode + its constant pool + debug
//! info), grounded on the teacher's `bytecode/code.rs` shape as inferred
//! from `builder.rs`'s `Code::new(...)` call and `ConstPool`/`LocationEntry`
//! naming.

use crate::error::CodeLoc;
use crate::value::Value;

/// Maps a bytecode offset to the source location that produced it, used to
/// attach a `CodeLoc` to runtime errors. Entries are pushed in increasing
/// `offset` order; looking up a location finds the last entry at or before
/// the instruction pointer.
#[derive(Debug, Clone, Copy)]
pub struct LocationEntry {
    pub offset: u32,
    pub loc: CodeLoc,
}

#[derive(Debug, Default)]
pub struct ConstPool {
    values: Vec<Value>,
}

impl ConstPool {
    #[must_use]
    pub fn from_vec(values: Vec<Value>) -> Self {
        Self { values }
    }

    #[must_use]
    pub fn get(&self, index: u16) -> &Value {
        &self.values[index as usize]
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

#[derive(Debug)]
pub struct Code {
    pub(crate) bytecode: Vec<u8>,
    pub(crate) constants: ConstPool,
    pub(crate) locations: Vec<LocationEntry>,
    pub(crate) num_locals: u16,
    pub(crate) max_stack_depth: u16,
}

impl Code {
    #[must_use]
    pub fn new(
        bytecode: Vec<u8>,
        constants: ConstPool,
        locations: Vec<LocationEntry>,
        num_locals: u16,
        max_stack_depth: u16,
    ) -> Self {
        Self { bytecode, constants, locations, num_locals, max_stack_depth }
    }

    #[must_use]
    pub fn bytecode(&self) -> &[u8] {
        &self.bytecode
    }

    #[must_use]
    pub fn constants(&self) -> &ConstPool {
        &self.constants
    }

    #[must_use]
    pub fn num_locals(&self) -> u16 {
        self.num_locals
    }

    #[must_use]
    pub fn max_stack_depth(&self) -> u16 {
        self.max_stack_depth
    }

    /// Finds the source location recorded for (or immediately before)
    /// `offset`, for attaching a `CodeLoc` to a runtime error.
    #[must_use]
    pub fn location_at(&self, offset: usize) -> Option<CodeLoc> {
        let offset = u32::try_from(offset).ok()?;
        self.locations.partition_point(|e| e.offset <= offset).checked_sub(1).map(|i| self.locations[i].loc)
    }
}

#[cfg(test)]
mod tests {
    use super::{Code, ConstPool, LocationEntry};
    use crate::error::CodeLoc;

    #[test]
    fn location_at_finds_nearest_preceding_entry() {
        let code = Code::new(
            vec![0; 10],
            ConstPool::default(),
            vec![
                LocationEntry { offset: 0, loc: CodeLoc::new(1, 1) },
                LocationEntry { offset: 5, loc: CodeLoc::new(2, 1) },
            ],
            0,
            0,
        );
        assert_eq!(code.location_at(0), Some(CodeLoc::new(1, 1)));
        assert_eq!(code.location_at(3), Some(CodeLoc::new(1, 1)));
        assert_eq!(code.location_at(5), Some(CodeLoc::new(2, 1)));
        assert_eq!(code.location_at(9), Some(CodeLoc::new(2, 1)));
    }
}
