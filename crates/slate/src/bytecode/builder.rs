//! Emits bytecode during compilation: operand encoding, forward-jump
//! patching, and stack-depth tracking.
//!
//! Grounded directly on the teacher's `bytecode/builder.rs` (`CodeBuilder`,
//! `JumpLabel`, the `emit`/`emit_u8`/`emit_u16`/`emit_jump`/`patch_jump`
//! family, and the `build(self) -> Code` consuming constructor), trimmed of
//! the exception-table and peephole-optimization passes and the
//! assigned-vs-undefined local bookkeeping, none of which this language
//! needs.

use super::code::{Code, ConstPool, LocationEntry};
use super::op::Opcode;
use crate::error::CodeLoc;
use crate::value::Value;

/// Offset of a not-yet-patched forward jump's operand bytes.
#[derive(Debug, Clone, Copy)]
pub struct JumpLabel(usize);

#[derive(Debug, Default)]
pub struct CodeBuilder {
    bytecode: Vec<u8>,
    constants: Vec<Value>,
    locations: Vec<LocationEntry>,
    current_location: Option<CodeLoc>,
    current_stack_depth: u16,
    max_stack_depth: u16,
    num_locals: u16,
}

impl CodeBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_num_locals(&mut self, n: u16) {
        self.num_locals = n;
    }

    /// Records the source location to attach to the next emitted
    /// instruction (and every instruction after it, until called again).
    pub fn set_location(&mut self, loc: CodeLoc) {
        if self.current_location != Some(loc) {
            self.current_location = Some(loc);
            let offset = u32::try_from(self.bytecode.len()).expect("bytecode offset exceeds u32");
            self.locations.push(LocationEntry { offset, loc });
        }
    }

    pub fn emit(&mut self, op: Opcode) {
        self.bytecode.push(op as u8);
        if let Some(effect) = op.stack_effect() {
            self.adjust_stack(effect);
        }
    }

    pub fn emit_u8(&mut self, op: Opcode, operand: u8) {
        self.bytecode.push(op as u8);
        self.bytecode.push(operand);
        if let Some(effect) = op.stack_effect() {
            self.adjust_stack(effect);
        }
    }

    pub fn emit_u16(&mut self, op: Opcode, operand: u16) {
        self.bytecode.push(op as u8);
        self.bytecode.extend_from_slice(&operand.to_le_bytes());
        if let Some(effect) = op.stack_effect() {
            self.adjust_stack(effect);
        }
    }

    pub fn emit_u8_u8(&mut self, op: Opcode, a: u8, b: u8) {
        self.bytecode.push(op as u8);
        self.bytecode.push(a);
        self.bytecode.push(b);
        if let Some(effect) = op.stack_effect() {
            self.adjust_stack(effect);
        }
    }

    pub fn emit_u16_u16(&mut self, op: Opcode, a: u16, b: u16) {
        self.bytecode.push(op as u8);
        self.bytecode.extend_from_slice(&a.to_le_bytes());
        self.bytecode.extend_from_slice(&b.to_le_bytes());
        if let Some(effect) = op.stack_effect() {
            self.adjust_stack(effect);
        }
    }

    pub fn emit_u16_u8(&mut self, op: Opcode, a: u16, b: u8) {
        self.bytecode.push(op as u8);
        self.bytecode.extend_from_slice(&a.to_le_bytes());
        self.bytecode.push(b);
        if let Some(effect) = op.stack_effect() {
            self.adjust_stack(effect);
        }
    }

    /// Appends a raw `u8` operand byte with no opcode and no stack-depth
    /// effect, for inline descriptor bytes trailing a variable-arity
    /// instruction (`MakeClosure`'s upvalue descriptors, `MakeObject`'s
    /// key names).
    pub fn push_u8_operand(&mut self, v: u8) {
        self.bytecode.push(v);
    }

    /// Appends a raw `u16` operand with no opcode and no stack-depth effect.
    pub fn push_u16_operand(&mut self, v: u16) {
        self.bytecode.extend_from_slice(&v.to_le_bytes());
    }

    /// Emits a forward jump with a placeholder `i16` offset, returning a
    /// label to patch once the target is known. `stack_delta` is the net
    /// effect on the not-taken fallthrough path (`JumpIfFalse`/`JumpIfTrue`
    /// pop their condition either way; `...OrPop` variants only pop when
    /// falling through).
    pub fn emit_jump(&mut self, op: Opcode, stack_delta: i16) -> JumpLabel {
        let label = JumpLabel(self.bytecode.len());
        self.bytecode.push(op as u8);
        self.bytecode.extend_from_slice(&0i16.to_le_bytes());
        self.adjust_stack(stack_delta);
        label
    }

    /// Patches a forward jump to land at the current bytecode position.
    ///
    /// # Panics
    ///
    /// Panics if the distance from the jump to here exceeds `i16`'s range —
    /// a function that large is a compile error the caller should have
    /// caught before compiling this far.
    pub fn patch_jump(&mut self, label: JumpLabel) {
        let target = i64::try_from(self.bytecode.len()).expect("bytecode offset exceeds i64");
        let from = i64::try_from(label.0).expect("bytecode offset exceeds i64");
        let raw = target - from - 3;
        let offset = i16::try_from(raw).expect("jump offset exceeds i16 range; function too large to compile");
        let bytes = offset.to_le_bytes();
        self.bytecode[label.0 + 1] = bytes[0];
        self.bytecode[label.0 + 2] = bytes[1];
    }

    /// Emits a backward jump (e.g. a loop's back-edge) to an already-known
    /// offset; no patching needed since the target precedes the jump.
    pub fn emit_jump_to(&mut self, op: Opcode, target: usize, stack_delta: i16) {
        let current = i64::try_from(self.bytecode.len()).expect("bytecode offset exceeds i64");
        let target = i64::try_from(target).expect("bytecode offset exceeds i64");
        let raw = target - (current + 3);
        let offset = i16::try_from(raw).expect("jump offset exceeds i16 range; function too large to compile");
        self.bytecode.push(op as u8);
        self.bytecode.extend_from_slice(&offset.to_le_bytes());
        self.adjust_stack(stack_delta);
    }

    #[must_use]
    pub fn current_offset(&self) -> usize {
        self.bytecode.len()
    }

    /// Emits `LoadLocal`, using zero-operand specializations for slots 0-3.
    pub fn emit_load_local(&mut self, slot: u16) {
        match slot {
            0 => self.emit(Opcode::LoadLocal0),
            1 => self.emit(Opcode::LoadLocal1),
            2 => self.emit(Opcode::LoadLocal2),
            3 => self.emit(Opcode::LoadLocal3),
            _ => match u8::try_from(slot) {
                Ok(s) => self.emit_u8(Opcode::LoadLocal, s),
                Err(_) => self.emit_u16(Opcode::LoadLocalW, slot),
            },
        }
    }

    /// Emits `StoreLocal`, using zero-operand specializations for slots 0-3.
    pub fn emit_store_local(&mut self, slot: u16) {
        match slot {
            0 => self.emit(Opcode::StoreLocal0),
            1 => self.emit(Opcode::StoreLocal1),
            2 => self.emit(Opcode::StoreLocal2),
            3 => self.emit(Opcode::StoreLocal3),
            _ => match u8::try_from(slot) {
                Ok(s) => self.emit_u8(Opcode::StoreLocal, s),
                Err(_) => self.emit_u16(Opcode::StoreLocalW, slot),
            },
        }
    }

    /// Adds a constant to the pool, returning its index.
    ///
    /// # Panics
    ///
    /// Panics if the pool exceeds 65535 entries — a compile-time limit, not
    /// a runtime one.
    pub fn add_const(&mut self, value: Value) -> u16 {
        let idx = self.constants.len();
        let idx_u16 = u16::try_from(idx).expect("constant pool exceeds u16 range; too many constants");
        self.constants.push(value);
        idx_u16
    }

    /// Adjusts and records the high-water mark of the tracked stack depth.
    /// `delta` may be negative; going below zero indicates a compiler bug,
    /// not a runtime error, so it's checked with a debug assertion only.
    pub fn adjust_stack(&mut self, delta: i16) {
        let depth = i32::from(self.current_stack_depth) + i32::from(delta);
        debug_assert!(depth >= 0, "stack depth underflow during compilation");
        self.current_stack_depth = u16::try_from(depth.max(0)).unwrap_or(u16::MAX);
        self.max_stack_depth = self.max_stack_depth.max(self.current_stack_depth);
    }

    #[must_use]
    pub fn stack_depth(&self) -> u16 {
        self.current_stack_depth
    }

    #[must_use]
    pub fn build(self) -> Code {
        Code::new(self.bytecode, ConstPool::from_vec(self.constants), self.locations, self.num_locals, self.max_stack_depth)
    }
}
