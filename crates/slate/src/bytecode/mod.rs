//! Bytecode representation, compiler, and virtual machine.
//!
//! - `op` - opcode definitions
//! - `code` - compiled code object (bytecode + constants + debug info)
//! - `builder` - `CodeBuilder` for emitting bytecode during compilation
//! - `compiler` - AST to bytecode compiler
//! - `vm` - virtual machine
//!
//! Grounded on the teacher's own `bytecode/mod.rs` module-doc-and-re-export
//! shape.

pub use code::{Code, ConstPool, LocationEntry};
pub use compiler::compile;
pub use op::Opcode;
pub use vm::{ExecOutcome, VM};

mod builder;
mod code;
mod compiler;
mod op;
mod vm;
