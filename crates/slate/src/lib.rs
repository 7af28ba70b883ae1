//! An embeddable interpreter for Slate, a small indentation-sensitive
//! expression language: layout-sensitive lexer, Pratt-style parser,
//! single-pass bytecode compiler, and a refcounted-heap stack VM.

mod ast;
mod builtins;
mod bytecode;
mod dynint;
mod error;
mod heap;
mod intern;
mod lexer;
mod parser;
mod resource;
mod tracer;
mod value;

pub use crate::{
    bytecode::{Code, ExecOutcome, Opcode, VM},
    error::{err, CodeLoc, ErrorKind, RunResult, SlateError},
    heap::{FunctionData, HeapId, UpvalueDesc},
    intern::StringId,
    resource::{ResourceLimits, DEFAULT_MAX_CALL_DEPTH},
    tracer::{NoopTracer, RecordingTracer, VmTracer},
    value::{NativeFunction, Value},
};
