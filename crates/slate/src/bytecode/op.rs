//! Opcode definitions (spec §4.6.1).
//!
//! Grounded on the teacher's `bytecode/builder.rs` usage of `Opcode` (the
//! teacher's own `op.rs` was not present in the retrieval pack, but its
//! shape is fully inferable from how `builder.rs` calls `op.stack_effect()`
//! and emits specialized `LoadLocal0..3`/`StoreLocal0..3` opcodes for common
//! slots). `#[repr(u8)]` so `op as u8` encodes directly into the bytecode
//! stream.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    Nop,

    // Stack / constants
    LoadConst,
    LoadConstW,
    LoadNull,
    LoadUndefined,
    LoadTrue,
    LoadFalse,
    Pop,
    PopN,
    /// Pops `operand` values but keeps the value just below them, used to
    /// collapse a block's intermediate statement values down to its last.
    PopNKeepTop,
    Dup,
    /// Peeks the top of the stack into the VM's result register, without
    /// popping it. Emitted at every statement boundary so the VM always
    /// has the value of the last-executed statement on hand for display.
    SetResult,

    // Locals / globals / upvalues
    LoadLocal0,
    LoadLocal1,
    LoadLocal2,
    LoadLocal3,
    LoadLocal,
    LoadLocalW,
    StoreLocal0,
    StoreLocal1,
    StoreLocal2,
    StoreLocal3,
    StoreLocal,
    StoreLocalW,
    LoadGlobal,
    StoreGlobal,
    /// operand: (u16 interned name, u8 flags; bit 0 = immutable). Pops the
    /// initializer value and inserts it as a fresh global binding, carrying
    /// whether later assignment to it should be rejected.
    DefineGlobal,
    LoadUpvalue,
    StoreUpvalue,
    CloseUpvalue,

    // Arithmetic
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
    FloorDiv,
    Neg,

    // Bitwise
    BitAnd,
    BitOr,
    BitXor,
    BitNot,
    Shl,
    Shr,
    UShr,

    // Comparison / logic
    Eq,
    NotEq,
    Lt,
    Le,
    Gt,
    Ge,
    Not,
    /// Membership test for `in`: `pop rhs, pop lhs, push lhs in rhs`.
    In,
    InstanceOf,

    // Control flow (operand: i16 offset relative to end of instruction)
    Jump,
    /// Pops the condition; jumps if falsy.
    JumpIfFalse,
    /// Pops the condition; jumps if truthy.
    JumpIfTrue,
    /// `&&`: if falsy, jumps leaving the value (the short-circuit result);
    /// if truthy, pops it and falls through to evaluate the right operand.
    JumpIfFalseOrPop,
    /// `||`: if truthy, jumps leaving the value; if falsy, pops it and
    /// falls through.
    JumpIfTrueOrPop,
    /// `??`: if not nullish, jumps leaving the value; if nullish, pops it
    /// and falls through to evaluate the right operand.
    JumpIfNotNullOrPop,

    // Calls / returns
    /// operand: u8 argument count. Pops the callee and its arguments,
    /// pushes the call's result.
    Call,
    /// Pops the return value and unwinds the current frame.
    Return,

    // Member / index access
    GetMember,
    GetMemberOptional,
    /// Pops a receiver and a value, sets `receiver[name] = value`, and
    /// pushes the value back — assignment is an expression.
    SetMember,
    GetIndex,
    /// Pops a target, an index, and a value, sets `target[index] = value`,
    /// and pushes the value back.
    SetIndex,
    /// operand: (u16 name, u16 local slot holding the receiver). Peeks the
    /// value on top of the stack, sets `local[slot][name] = value` without
    /// touching the stack otherwise. Used for member compound-assignment
    /// and increment/decrement, where the receiver is evaluated once into a
    /// temporary slot and then read twice (get, then set).
    SetMemberLocal,
    /// operand: (u16 local slot holding the target, u16 local slot holding
    /// the index). Same peek-and-write shape as `SetMemberLocal`, for index
    /// compound-assignment and increment/decrement.
    SetIndexLocal,

    // Aggregate construction
    /// operand: u16 element count. Pops that many values, pushes one array.
    MakeArray,
    /// operand: u16 pair count N, followed by N inline u16 interned-name
    /// operands (not on the value stack). Pops N values (in the same
    /// order as the inline names) and pushes one object.
    MakeObject,
    /// operand: u8 flags, bit0 = exclusive, bit1 = has_step. Pops 2 or 3
    /// stack values (start, end, [step]).
    MakeRange,
    /// operand: u16 index of the nested `FunctionData` constant, followed
    /// by an inline u8 upvalue count and that many inline `(u8 is_local,
    /// u16 parent_index)` descriptors (not on the value stack). Pushes one
    /// closure value.
    MakeClosure,

    // Template literals
    /// Concatenates the top `operand` stack values (as display strings)
    /// into one interned string value.
    ConcatTemplate,
}

impl Opcode {
    const ORDER: &'static [Opcode] = &[
        Opcode::Nop,
        Opcode::LoadConst,
        Opcode::LoadConstW,
        Opcode::LoadNull,
        Opcode::LoadUndefined,
        Opcode::LoadTrue,
        Opcode::LoadFalse,
        Opcode::Pop,
        Opcode::PopN,
        Opcode::PopNKeepTop,
        Opcode::Dup,
        Opcode::SetResult,
        Opcode::LoadLocal0,
        Opcode::LoadLocal1,
        Opcode::LoadLocal2,
        Opcode::LoadLocal3,
        Opcode::LoadLocal,
        Opcode::LoadLocalW,
        Opcode::StoreLocal0,
        Opcode::StoreLocal1,
        Opcode::StoreLocal2,
        Opcode::StoreLocal3,
        Opcode::StoreLocal,
        Opcode::StoreLocalW,
        Opcode::LoadGlobal,
        Opcode::StoreGlobal,
        Opcode::DefineGlobal,
        Opcode::LoadUpvalue,
        Opcode::StoreUpvalue,
        Opcode::CloseUpvalue,
        Opcode::Add,
        Opcode::Sub,
        Opcode::Mul,
        Opcode::Div,
        Opcode::Mod,
        Opcode::Pow,
        Opcode::FloorDiv,
        Opcode::Neg,
        Opcode::BitAnd,
        Opcode::BitOr,
        Opcode::BitXor,
        Opcode::BitNot,
        Opcode::Shl,
        Opcode::Shr,
        Opcode::UShr,
        Opcode::Eq,
        Opcode::NotEq,
        Opcode::Lt,
        Opcode::Le,
        Opcode::Gt,
        Opcode::Ge,
        Opcode::Not,
        Opcode::In,
        Opcode::InstanceOf,
        Opcode::Jump,
        Opcode::JumpIfFalse,
        Opcode::JumpIfTrue,
        Opcode::JumpIfFalseOrPop,
        Opcode::JumpIfTrueOrPop,
        Opcode::JumpIfNotNullOrPop,
        Opcode::Call,
        Opcode::Return,
        Opcode::GetMember,
        Opcode::GetMemberOptional,
        Opcode::SetMember,
        Opcode::GetIndex,
        Opcode::SetIndex,
        Opcode::SetMemberLocal,
        Opcode::SetIndexLocal,
        Opcode::MakeArray,
        Opcode::MakeObject,
        Opcode::MakeRange,
        Opcode::MakeClosure,
        Opcode::ConcatTemplate,
    ];

    /// Decodes a raw bytecode byte back into an [`Opcode`]. Bytecode is only
    /// ever produced by this crate's own compiler, so an out-of-range byte
    /// indicates corrupted or foreign bytecode rather than a user error.
    #[must_use]
    pub fn from_u8(byte: u8) -> Option<Self> {
        Self::ORDER.get(byte as usize).copied()
    }

    /// Fixed stack-depth delta for opcodes whose effect doesn't depend on
    /// their operand. Variable-effect opcodes (`PopN`, `Call`, `MakeArray`,
    /// ...) are accounted for directly at their emit sites in
    /// [`super::builder::CodeBuilder`].
    #[must_use]
    pub fn stack_effect(self) -> Option<i16> {
        use Opcode::{
            Add, BitAnd, BitNot, BitOr, BitXor, CloseUpvalue, DefineGlobal, Div, Dup, Eq, FloorDiv, Ge, GetIndex,
            GetMember, GetMemberOptional, Gt, In, InstanceOf, Le, LoadConst, LoadConstW, LoadFalse, LoadGlobal,
            LoadLocal, LoadLocal0, LoadLocal1, LoadLocal2, LoadLocal3, LoadLocalW, LoadNull, LoadTrue, LoadUndefined,
            LoadUpvalue, Lt, Mod, Mul, Neg, Nop, Not, NotEq, Pop, Pow, Return, SetIndex, SetIndexLocal, SetMember,
            SetMemberLocal, SetResult, Shl, Shr, StoreGlobal, StoreLocal, StoreLocal0, StoreLocal1, StoreLocal2,
            StoreLocal3, StoreLocalW, StoreUpvalue, Sub, UShr,
        };
        Some(match self {
            Nop | CloseUpvalue => 0,
            // Simulated-only: real control flow exits the frame here: kept
            // so dead code after a `return` still compiles without the
            // depth bookkeeping going negative.
            Return => -1,
            LoadConst | LoadConstW | LoadNull | LoadUndefined | LoadTrue | LoadFalse => 1,
            LoadLocal0 | LoadLocal1 | LoadLocal2 | LoadLocal3 | LoadLocal | LoadLocalW => 1,
            LoadGlobal | LoadUpvalue => 1,
            Dup => 1,
            // Peeks, doesn't pop.
            SetResult => 0,
            Pop => -1,
            // Assignment is an expression: stores peek the value (the
            // assignment's result) rather than popping it.
            StoreLocal0 | StoreLocal1 | StoreLocal2 | StoreLocal3 | StoreLocal | StoreLocalW => 0,
            StoreGlobal | StoreUpvalue => 0,
            DefineGlobal => -1,
            Add | Sub | Mul | Div | Mod | Pow | FloorDiv | BitAnd | BitOr | BitXor | Shl | Shr | UShr | Eq | NotEq
            | Lt | Le | Gt | Ge | In | InstanceOf => -1,
            Neg | Not | BitNot => 0,
            GetMember | GetMemberOptional => 0,
            GetIndex => -1,
            // Pops the receiver, leaves the assigned value.
            SetMember => -1,
            // Pops the target and index, leaves the assigned value.
            SetIndex => -2,
            SetMemberLocal | SetIndexLocal => 0,
            _ => return None,
        })
    }
}
