//! Stack-based bytecode virtual machine (spec §4.6).
//!
//! Diverges from the teacher's `CachedFrame<'code>` pattern: the teacher's
//! `Code` lives in a separate function table indexed by `FunctionId`, so a
//! cached frame can borrow it for the frame's lifetime. Here every
//! `FunctionData` (and its `Code`) lives inside `HeapData::Function` in the
//! same `Heap` the VM mutates on nearly every instruction (allocating
//! strings, arrays, closures...), so a borrowed `&Code` would fight the
//! borrow checker against `&mut self.heap` at the next opcode. Bytecode
//! bytes are re-fetched fresh per `fetch_u8`/`fetch_u16` call instead.

use ahash::{AHashMap, AHashSet};

use super::code::Code;
use super::op::Opcode;
use crate::ast::BinaryOp;
use crate::dynint::{checked_add_i32, checked_mul_i32, checked_sub_i32, demote_or_box, DynInt};
use crate::error::{err, CodeLoc, ErrorKind, RunResult, SlateError};
use crate::heap::{
    Cell, ClosureData, FunctionData, Heap, HeapData, HeapId, IteratorData, IteratorKind, RangeData, UpvalueDesc,
};
use crate::intern::{Interns, StringId};
use crate::resource::ResourceLimits;
use crate::tracer::{NoopTracer, VmTracer};
use crate::value::{equals, to_display_string, truthy, type_name, NativeFunction, Value};

/// A single call frame: the function currently executing, the closure it
/// was invoked through (`None` for the top-level program and for bare
/// `Function` values executed without ever being closed over), the
/// instruction pointer into that function's chunk, and the base of its
/// locals within the shared operand stack.
struct Frame {
    function: HeapId,
    closure: Option<HeapId>,
    ip: usize,
    stack_base: usize,
}

/// Outcome of `interpret`/`execute` (spec §4.6.7, §6).
#[derive(Debug)]
pub enum ExecOutcome {
    Ok(Value),
    CompileError(Vec<SlateError>),
    RuntimeError(SlateError),
}

/// The virtual machine: heap, globals, operand stack, and frame stack.
/// Owns everything a running program can reach; `destroy` drops it all.
pub struct VM {
    heap: Heap,
    interns: Interns,
    globals: AHashMap<StringId, Value>,
    /// Globals declared `val` rather than `var`; checked by the compiler
    /// before accepting an assignment to a global name, and persisted
    /// across `interpret` calls on the same `VM` (a REPL session can't
    /// un-declare a `val` by simply calling `interpret` again).
    immutable_globals: AHashSet<StringId>,
    stack: Vec<Value>,
    frames: Vec<Frame>,
    /// Cells still reading through a live stack slot, keyed by absolute
    /// stack index, so `MakeClosure` can dedupe repeated captures of the
    /// same local within one frame.
    open_upvalues: Vec<(usize, HeapId)>,
    limits: ResourceLimits,
    current_loc: Option<CodeLoc>,
    args: Vec<String>,
    /// Holds the value of the last-executed statement, peeked by
    /// `SetResult` at every statement boundary, for a host to display
    /// between REPL entries without relying on `execute`'s return value
    /// alone.
    result: Value,
}

impl Default for VM {
    fn default() -> Self {
        Self::create()
    }
}

impl VM {
    #[must_use]
    pub fn create() -> Self {
        Self::create_with_args(Vec::new())
    }

    #[must_use]
    pub fn create_with_args(args: Vec<String>) -> Self {
        let mut vm = Self {
            heap: Heap::new(),
            interns: Interns::new(),
            globals: AHashMap::new(),
            immutable_globals: AHashSet::new(),
            stack: Vec::new(),
            frames: Vec::new(),
            open_upvalues: Vec::new(),
            limits: ResourceLimits::default(),
            current_loc: None,
            args,
            result: Value::Null,
        };
        crate::builtins::register_builtins(&mut vm);
        vm
    }

    #[must_use]
    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// Compiles `source` and runs it, per spec §6's `interpret`.
    pub fn interpret(&mut self, source: &str) -> ExecOutcome {
        self.interpret_with_tracer(source, &mut NoopTracer)
    }

    pub fn interpret_with_tracer(&mut self, source: &str, tracer: &mut dyn VmTracer) -> ExecOutcome {
        let mut parser = crate::parser::Parser::new(source);
        let (program, mut errors) = parser.parse_program();
        if !errors.is_empty() {
            return ExecOutcome::CompileError(std::mem::take(&mut errors));
        }
        match crate::bytecode::compile(&program, &mut self.interns, &mut self.heap, &mut self.immutable_globals) {
            Ok(function) => self.execute_with_tracer(function, tracer),
            Err(errors) => ExecOutcome::CompileError(errors),
        }
    }

    /// Runs a pre-compiled function, per spec §6's `execute`.
    pub fn execute(&mut self, function: FunctionData) -> ExecOutcome {
        self.execute_with_tracer(function, &mut NoopTracer)
    }

    pub fn execute_with_tracer(&mut self, function: FunctionData, tracer: &mut dyn VmTracer) -> ExecOutcome {
        let fn_id = self.heap.allocate(HeapData::Function(function));
        self.frames.push(Frame { function: fn_id, closure: None, ip: 0, stack_base: self.stack.len() });
        match self.run(tracer) {
            Ok(value) => ExecOutcome::Ok(value),
            Err(e) => ExecOutcome::RuntimeError(e),
        }
    }

    /// Clears the operand stack and frame stack, releasing every value they
    /// held; globals and interned strings survive (spec §6's `reset`).
    pub fn reset(&mut self) {
        while let Some(v) = self.stack.pop() {
            v.release(&mut self.heap);
        }
        for frame in self.frames.drain(..) {
            self.heap.dec_ref(frame.function);
            if let Some(closure) = frame.closure {
                self.heap.dec_ref(closure);
            }
        }
        self.open_upvalues.clear();
        self.current_loc = None;
        let old_result = std::mem::replace(&mut self.result, Value::Null);
        old_result.release(&mut self.heap);
    }

    /// Releases every resource the VM owns (spec §6's `destroy`).
    pub fn destroy(mut self) {
        self.reset();
        for (_, v) in self.globals.drain() {
            v.release(&mut self.heap);
        }
    }

    /// The value of the last-executed statement, for a host driving a
    /// REPL-style loop.
    #[must_use]
    pub fn result(&self) -> &Value {
        &self.result
    }

    #[must_use]
    pub(crate) fn heap(&self) -> &Heap {
        &self.heap
    }

    pub(crate) fn heap_mut(&mut self) -> &mut Heap {
        &mut self.heap
    }

    #[must_use]
    pub(crate) fn interns(&self) -> &Interns {
        &self.interns
    }

    pub(crate) fn interns_mut(&mut self) -> &mut Interns {
        &mut self.interns
    }

    pub(crate) fn current_location(&self) -> Option<CodeLoc> {
        self.current_loc
    }

    /// Inserts or overwrites a global binding, releasing any displaced
    /// value. Used at VM construction time to install built-ins.
    pub(crate) fn define_global(&mut self, name: StringId, value: Value) {
        if let Some(old) = self.globals.insert(name, value) {
            old.release(&mut self.heap);
        }
    }

    /// Calls a value with already-evaluated, owned arguments. Exposed so
    /// native built-ins (e.g. `Iterator` helpers) can invoke user callables.
    pub fn call_value(&mut self, callee: Value, args: Vec<Value>) -> RunResult<Value> {
        self.dispatch_call(callee, args)
    }

    /// Renders a value with the same stringification `+` concatenation
    /// uses (spec §4.6.2), for hosts (e.g. the CLI) that need to display an
    /// `interpret`/`execute` result without reaching into the heap directly.
    #[must_use]
    pub fn display_value(&self, value: &Value) -> String {
        let mut out = String::new();
        to_display_string(&self.heap, &self.interns, value, &mut out);
        out
    }

    /// The `type()` built-in's domain tag for `value` (spec §4.6.2), for
    /// hosts that need it without going through `interpret`/`call_value`.
    #[must_use]
    pub fn type_name_of(&self, value: &Value) -> &'static str {
        type_name(&self.heap, value)
    }

    /// `equals` per spec §4.1's I1, for hosts comparing values returned from
    /// separate `interpret`/`execute` calls.
    #[must_use]
    pub fn values_equal(&self, a: &Value, b: &Value) -> bool {
        equals(&self.heap, a, b)
    }

    /// `truthy` per spec §4.1's I, for hosts branching on a returned value.
    #[must_use]
    pub fn value_is_truthy(&self, value: &Value) -> bool {
        truthy(&self.heap, value)
    }

    fn code_of(&self, function: HeapId) -> &Code {
        match self.heap.get(function) {
            HeapData::Function(f) => &f.code,
            _ => unreachable!("frame.function must reference Function heap data"),
        }
    }

    fn fetch_u8(&mut self) -> u8 {
        let idx = self.frames.len() - 1;
        let ip = self.frames[idx].ip;
        self.frames[idx].ip += 1;
        let function = self.frames[idx].function;
        self.code_of(function).bytecode()[ip]
    }

    // Re-borrow split out since `code_of` takes `&self` but the frame's `ip`
    // must be mutated first; see `fetch_u8` above for the same pattern.
    fn fetch_u16(&mut self) -> u16 {
        let lo = self.fetch_u8();
        let hi = self.fetch_u8();
        u16::from_le_bytes([lo, hi])
    }

    fn fetch_i16(&mut self) -> i16 {
        self.fetch_u16() as i16
    }

    pub(crate) fn runtime_err(&self, kind: ErrorKind, message: impl Into<String>) -> SlateError {
        match self.current_loc {
            Some(loc) => SlateError::at(kind, message, loc),
            None => SlateError::new(kind, message),
        }
    }

    #[must_use]
    fn frame_depth(&self) -> usize {
        self.frames.len()
    }

    /// The main dispatch loop. Runs until the frame at `base_depth` returns
    /// or an error is raised. Shared by the top-level `interpret`/`execute`
    /// entry points and by `call_closure`'s nested invocation, so a call
    /// from Slate code back into Slate (the common case) reuses the native
    /// call stack rather than trampolining through a second copy of this
    /// loop.
    fn run_until_depth(&mut self, base_depth: usize, tracer: &mut dyn VmTracer) -> RunResult<Value> {
        loop {
            let idx = self.frames.len() - 1;
            let ip = self.frames[idx].ip;
            let function = self.frames[idx].function;
            if let Some(loc) = self.code_of(function).location_at(ip) {
                self.current_loc = Some(loc);
            }
            let byte = self.fetch_u8();
            let Some(op) = Opcode::from_u8(byte) else {
                return Err(self.runtime_err(ErrorKind::Value, "corrupt bytecode: unknown opcode"));
            };
            tracer.on_instruction(ip, op, self.stack.len(), self.frames.len());

            match self.step(op)? {
                StepResult::Continue => {}
                StepResult::Returned(value) => {
                    if self.frames.len() == base_depth {
                        return Ok(value);
                    }
                }
            }
        }
    }

    fn run(&mut self, tracer: &mut dyn VmTracer) -> RunResult<Value> {
        let base_depth = self.frames.len() - 1;
        self.run_until_depth(base_depth, tracer)
    }

    /// Executes one already-decoded instruction. Operand bytes are fetched
    /// from the current frame as needed.
    #[allow(clippy::too_many_lines)]
    fn step(&mut self, op: Opcode) -> RunResult<StepResult> {
        match op {
            Opcode::Nop => {}
            Opcode::LoadConst => {
                let idx = self.fetch_u8();
                self.push_const(u16::from(idx));
            }
            Opcode::LoadConstW => {
                let idx = self.fetch_u16();
                self.push_const(idx);
            }
            Opcode::LoadNull => self.stack.push(Value::Null),
            Opcode::LoadUndefined => self.stack.push(Value::Undefined),
            Opcode::LoadTrue => self.stack.push(Value::Boolean(true)),
            Opcode::LoadFalse => self.stack.push(Value::Boolean(false)),
            Opcode::Pop => {
                let v = self.stack.pop().expect("stack underflow on Pop");
                v.release(&mut self.heap);
            }
            Opcode::PopN => {
                let n = self.fetch_u8();
                for _ in 0..n {
                    let v = self.stack.pop().expect("stack underflow on PopN");
                    v.release(&mut self.heap);
                }
            }
            Opcode::PopNKeepTop => {
                let n = self.fetch_u16();
                let top = self.stack.pop().expect("stack underflow on PopNKeepTop");
                for _ in 0..n {
                    let v = self.stack.pop().expect("stack underflow on PopNKeepTop");
                    v.release(&mut self.heap);
                }
                self.stack.push(top);
            }
            Opcode::Dup => {
                let v = self.stack.last().expect("stack underflow on Dup").clone_retain(&self.heap);
                self.stack.push(v);
            }
            Opcode::SetResult => {
                let v = self.stack.last().expect("stack underflow on SetResult").clone_retain(&self.heap);
                let old = std::mem::replace(&mut self.result, v);
                old.release(&mut self.heap);
            }
            Opcode::LoadLocal0 => self.load_local(0),
            Opcode::LoadLocal1 => self.load_local(1),
            Opcode::LoadLocal2 => self.load_local(2),
            Opcode::LoadLocal3 => self.load_local(3),
            Opcode::LoadLocal => {
                let slot = self.fetch_u8();
                self.load_local(u16::from(slot));
            }
            Opcode::LoadLocalW => {
                let slot = self.fetch_u16();
                self.load_local(slot);
            }
            Opcode::StoreLocal0 => self.store_local(0),
            Opcode::StoreLocal1 => self.store_local(1),
            Opcode::StoreLocal2 => self.store_local(2),
            Opcode::StoreLocal3 => self.store_local(3),
            Opcode::StoreLocal => {
                let slot = self.fetch_u8();
                self.store_local(u16::from(slot));
            }
            Opcode::StoreLocalW => {
                let slot = self.fetch_u16();
                self.store_local(slot);
            }
            Opcode::LoadGlobal => {
                let idx = self.fetch_u16();
                let name = self.const_string_id(idx);
                let Some(value) = self.globals.get(&name) else {
                    let msg = format!("undefined global '{}'", self.interns.resolve(name));
                    return Err(self.runtime_err(ErrorKind::Reference, msg));
                };
                let value = value.clone_retain(&self.heap);
                self.stack.push(value);
            }
            Opcode::StoreGlobal => {
                let idx = self.fetch_u16();
                let name = self.const_string_id(idx);
                // The compiler rejects assignment to an immutable global
                // before ever emitting this opcode against it; this is a
                // defense-in-depth check, not the primary enforcement.
                if self.immutable_globals.contains(&name) {
                    let msg = format!("cannot assign to immutable binding '{}'", self.interns.resolve(name));
                    return Err(self.runtime_err(ErrorKind::Reference, msg));
                }
                let value = self.stack.last().expect("stack underflow on StoreGlobal").clone_retain(&self.heap);
                if let Some(old) = self.globals.insert(name, value) {
                    old.release(&mut self.heap);
                }
            }
            Opcode::DefineGlobal => {
                let idx = self.fetch_u16();
                let flags = self.fetch_u8();
                let name = self.const_string_id(idx);
                let value = self.stack.pop().expect("stack underflow on DefineGlobal");
                if flags & 0b1 != 0 {
                    self.immutable_globals.insert(name);
                } else {
                    self.immutable_globals.remove(&name);
                }
                if let Some(old) = self.globals.insert(name, value) {
                    old.release(&mut self.heap);
                }
            }
            Opcode::LoadUpvalue => {
                let slot = self.fetch_u8();
                let value = self.read_upvalue(usize::from(slot));
                self.stack.push(value);
            }
            Opcode::StoreUpvalue => {
                let slot = self.fetch_u8();
                let value = self.stack.last().expect("stack underflow on StoreUpvalue").clone_retain(&self.heap);
                self.write_upvalue(usize::from(slot), value);
            }
            Opcode::CloseUpvalue => {
                let abs_index = self.stack.len() - 1;
                self.close_upvalue(abs_index);
            }
            Opcode::Add
            | Opcode::Sub
            | Opcode::Mul
            | Opcode::Div
            | Opcode::Mod
            | Opcode::Pow
            | Opcode::FloorDiv
            | Opcode::BitAnd
            | Opcode::BitOr
            | Opcode::BitXor
            | Opcode::Shl
            | Opcode::Shr
            | Opcode::UShr => {
                let rhs = self.stack.pop().expect("stack underflow on binary op");
                let lhs = self.stack.pop().expect("stack underflow on binary op");
                let result = self.binary_op(binop_for(op), lhs, rhs)?;
                self.stack.push(result);
            }
            Opcode::Neg => {
                let v = self.stack.pop().expect("stack underflow on Neg");
                let result = self.negate(v)?;
                self.stack.push(result);
            }
            Opcode::BitNot => {
                let v = self.stack.pop().expect("stack underflow on BitNot");
                let i = self.to_i32_truncating(&v)?;
                v.release(&mut self.heap);
                self.stack.push(Value::Int32(!i));
            }
            Opcode::Eq | Opcode::NotEq => {
                let rhs = self.stack.pop().expect("stack underflow on Eq");
                let lhs = self.stack.pop().expect("stack underflow on Eq");
                let eq = equals(&self.heap, &lhs, &rhs);
                lhs.release(&mut self.heap);
                rhs.release(&mut self.heap);
                self.stack.push(Value::Boolean(if op == Opcode::Eq { eq } else { !eq }));
            }
            Opcode::Lt | Opcode::Le | Opcode::Gt | Opcode::Ge => {
                let rhs = self.stack.pop().expect("stack underflow on comparison");
                let lhs = self.stack.pop().expect("stack underflow on comparison");
                let result = self.compare(op, &lhs, &rhs)?;
                lhs.release(&mut self.heap);
                rhs.release(&mut self.heap);
                self.stack.push(Value::Boolean(result));
            }
            Opcode::Not => {
                let v = self.stack.pop().expect("stack underflow on Not");
                let b = truthy(&self.heap, &v);
                v.release(&mut self.heap);
                self.stack.push(Value::Boolean(!b));
            }
            Opcode::In => {
                let rhs = self.stack.pop().expect("stack underflow on In");
                let lhs = self.stack.pop().expect("stack underflow on In");
                let result = self.membership(&lhs, &rhs)?;
                lhs.release(&mut self.heap);
                rhs.release(&mut self.heap);
                self.stack.push(Value::Boolean(result));
            }
            Opcode::InstanceOf => {
                let rhs = self.stack.pop().expect("stack underflow on InstanceOf");
                let lhs = self.stack.pop().expect("stack underflow on InstanceOf");
                let result = Self::instance_of(&self.heap, &lhs, &rhs);
                lhs.release(&mut self.heap);
                rhs.release(&mut self.heap);
                self.stack.push(Value::Boolean(result));
            }
            Opcode::Jump => {
                let offset = self.fetch_i16();
                self.jump(offset);
            }
            Opcode::JumpIfFalse => {
                let offset = self.fetch_i16();
                let v = self.stack.pop().expect("stack underflow on JumpIfFalse");
                let cond = truthy(&self.heap, &v);
                v.release(&mut self.heap);
                if !cond {
                    self.jump(offset);
                }
            }
            Opcode::JumpIfTrue => {
                let offset = self.fetch_i16();
                let v = self.stack.pop().expect("stack underflow on JumpIfTrue");
                let cond = truthy(&self.heap, &v);
                v.release(&mut self.heap);
                if cond {
                    self.jump(offset);
                }
            }
            Opcode::JumpIfFalseOrPop => {
                let offset = self.fetch_i16();
                let cond = truthy(&self.heap, self.stack.last().expect("stack underflow on JumpIfFalseOrPop"));
                if cond {
                    let v = self.stack.pop().expect("stack underflow on JumpIfFalseOrPop");
                    v.release(&mut self.heap);
                } else {
                    self.jump(offset);
                }
            }
            Opcode::JumpIfTrueOrPop => {
                let offset = self.fetch_i16();
                let cond = truthy(&self.heap, self.stack.last().expect("stack underflow on JumpIfTrueOrPop"));
                if cond {
                    self.jump(offset);
                } else {
                    let v = self.stack.pop().expect("stack underflow on JumpIfTrueOrPop");
                    v.release(&mut self.heap);
                }
            }
            Opcode::JumpIfNotNullOrPop => {
                let offset = self.fetch_i16();
                let nullish = self.stack.last().expect("stack underflow on JumpIfNotNullOrPop").is_nullish();
                if nullish {
                    let v = self.stack.pop().expect("stack underflow on JumpIfNotNullOrPop");
                    v.release(&mut self.heap);
                } else {
                    self.jump(offset);
                }
            }
            Opcode::Call => {
                let argc = usize::from(self.fetch_u8());
                self.do_call(argc)?;
            }
            Opcode::Return => {
                let value = self.stack.pop().expect("stack underflow on Return");
                let result = self.do_return(value);
                return Ok(StepResult::Returned(result));
            }
            Opcode::GetMember => {
                let idx = self.fetch_u16();
                let name = self.const_string_id(idx);
                let receiver = self.stack.pop().expect("stack underflow on GetMember");
                let value = self.get_member(&receiver, name)?;
                receiver.release(&mut self.heap);
                self.stack.push(value);
            }
            Opcode::GetMemberOptional => {
                let idx = self.fetch_u16();
                let name = self.const_string_id(idx);
                let receiver = self.stack.pop().expect("stack underflow on GetMemberOptional");
                if receiver.is_nullish() {
                    receiver.release(&mut self.heap);
                    self.stack.push(Value::Undefined);
                } else {
                    let value = self.get_member(&receiver, name)?;
                    receiver.release(&mut self.heap);
                    self.stack.push(value);
                }
            }
            Opcode::SetMember => {
                let idx = self.fetch_u16();
                let name = self.const_string_id(idx);
                let receiver = self.stack.pop().expect("stack underflow on SetMember");
                let value = self.stack.last().expect("stack underflow on SetMember").clone_retain(&self.heap);
                self.set_member(&receiver, name, value)?;
                receiver.release(&mut self.heap);
            }
            Opcode::GetIndex => {
                let index = self.stack.pop().expect("stack underflow on GetIndex");
                let target = self.stack.pop().expect("stack underflow on GetIndex");
                let value = self.get_index(&target, &index)?;
                target.release(&mut self.heap);
                index.release(&mut self.heap);
                self.stack.push(value);
            }
            Opcode::SetIndex => {
                let index = self.stack.pop().expect("stack underflow on SetIndex");
                let target = self.stack.pop().expect("stack underflow on SetIndex");
                let value = self.stack.last().expect("stack underflow on SetIndex").clone_retain(&self.heap);
                self.set_index(&target, &index, value)?;
                target.release(&mut self.heap);
                index.release(&mut self.heap);
            }
            Opcode::SetMemberLocal => {
                let name_idx = self.fetch_u16();
                let recv_slot = self.fetch_u16();
                let name = self.const_string_id(name_idx);
                let value = self.stack.last().expect("stack underflow on SetMemberLocal").clone_retain(&self.heap);
                let base = self.frames.last().expect("no active frame").stack_base;
                let receiver = self.stack[base + usize::from(recv_slot)].clone_retain(&self.heap);
                self.set_member(&receiver, name, value)?;
                receiver.release(&mut self.heap);
            }
            Opcode::SetIndexLocal => {
                let t_slot = self.fetch_u16();
                let i_slot = self.fetch_u16();
                let value = self.stack.last().expect("stack underflow on SetIndexLocal").clone_retain(&self.heap);
                let base = self.frames.last().expect("no active frame").stack_base;
                let target = self.stack[base + usize::from(t_slot)].clone_retain(&self.heap);
                let index = self.stack[base + usize::from(i_slot)].clone_retain(&self.heap);
                self.set_index(&target, &index, value)?;
                target.release(&mut self.heap);
                index.release(&mut self.heap);
            }
            Opcode::MakeArray => {
                let n = usize::from(self.fetch_u16());
                let start = self.stack.len() - n;
                let items: Vec<Value> = self.stack.drain(start..).collect();
                let id = self.heap.allocate(HeapData::Array(items));
                self.stack.push(Value::Ref(id));
            }
            Opcode::MakeObject => {
                let n = self.fetch_u16();
                let mut keys = Vec::with_capacity(usize::from(n));
                for _ in 0..n {
                    let idx = self.fetch_u16();
                    keys.push(self.const_string_id(idx));
                }
                let start = self.stack.len() - keys.len();
                let values: Vec<Value> = self.stack.drain(start..).collect();
                let map = keys.into_iter().zip(values).collect();
                let id = self.heap.allocate(HeapData::Object(map));
                self.stack.push(Value::Ref(id));
            }
            Opcode::MakeRange => {
                let flags = self.fetch_u8();
                let exclusive = flags & 0b01 != 0;
                let has_step = flags & 0b10 != 0;
                let step = if has_step { self.stack.pop().expect("stack underflow on MakeRange step") } else { Value::Undefined };
                let end = self.stack.pop().expect("stack underflow on MakeRange end");
                let start = self.stack.pop().expect("stack underflow on MakeRange start");
                let step = self.default_range_step(&start, &end, step)?;
                let id = self.heap.allocate(HeapData::Range(RangeData { start, end, exclusive, step }));
                self.stack.push(Value::Ref(id));
            }
            Opcode::MakeClosure => {
                let const_idx = self.fetch_u16();
                let value = self.make_closure(const_idx)?;
                self.stack.push(value);
            }
            Opcode::ConcatTemplate => {
                let n = usize::from(self.fetch_u16());
                let start = self.stack.len() - n;
                let mut out = String::new();
                for v in self.stack.drain(start..) {
                    to_display_string(&self.heap, &self.interns, &v, &mut out);
                    v.release(&mut self.heap);
                }
                let id = self.heap.allocate(HeapData::Str(out.into_boxed_str()));
                self.stack.push(Value::Ref(id));
            }
        }
        Ok(StepResult::Continue)
    }

    fn push_const(&mut self, idx: u16) {
        let frame_fn = self.frames.last().expect("no active frame").function;
        let constant = self.code_of(frame_fn).constants().get(idx);
        let value = constant.clone_retain(&self.heap);
        self.stack.push(value);
    }

    /// `GetMember`/`SetMember`/`MakeObject` encode a member name as a raw
    /// `StringId` index (the compiler interns it once via
    /// `string_const_id`); no constant-pool or re-interning lookup needed.
    fn const_string_id(&self, idx: u16) -> StringId {
        StringId::from_index(idx)
    }

    fn load_local(&mut self, slot: u16) {
        let base = self.frames.last().expect("no active frame").stack_base;
        let value = self.stack[base + usize::from(slot)].clone_retain(&self.heap);
        self.stack.push(value);
    }

    fn store_local(&mut self, slot: u16) {
        let base = self.frames.last().expect("no active frame").stack_base;
        let value = self.stack.last().expect("stack underflow on StoreLocal").clone_retain(&self.heap);
        let abs = base + usize::from(slot);
        let old = std::mem::replace(&mut self.stack[abs], value);
        old.release(&mut self.heap);
    }

    fn jump(&mut self, offset: i16) {
        let frame = self.frames.last_mut().expect("no active frame");
        frame.ip = (frame.ip as i64 + i64::from(offset)) as usize;
    }

    // ---- upvalues ----------------------------------------------------

    fn find_open_upvalue(&self, abs_index: usize) -> Option<HeapId> {
        self.open_upvalues.iter().find(|(idx, _)| *idx == abs_index).map(|(_, id)| *id)
    }

    fn open_upvalue_for(&mut self, abs_index: usize) -> HeapId {
        if let Some(id) = self.find_open_upvalue(abs_index) {
            self.heap.inc_ref(id);
            return id;
        }
        let id = self.heap.allocate(HeapData::Cell(Cell::Open(abs_index)));
        self.open_upvalues.push((abs_index, id));
        id
    }

    fn close_upvalue(&mut self, abs_index: usize) {
        if let Some(pos) = self.open_upvalues.iter().position(|(idx, _)| *idx == abs_index) {
            let (_, id) = self.open_upvalues.remove(pos);
            let value = self.stack[abs_index].clone_retain(&self.heap);
            *self.heap.get_mut(id) = HeapData::Cell(Cell::Closed(value));
        }
    }

    fn read_upvalue(&self, slot: usize) -> Value {
        let closure_id = self.frames.last().expect("no active frame").closure.expect("LoadUpvalue outside closure");
        let cell_id = match self.heap.get(closure_id) {
            HeapData::Closure(c) => c.cells[slot],
            _ => unreachable!("frame.closure must reference Closure heap data"),
        };
        match self.heap.get(cell_id) {
            HeapData::Cell(Cell::Open(abs)) => self.stack[*abs].clone_retain(&self.heap),
            HeapData::Cell(Cell::Closed(v)) => v.clone_retain(&self.heap),
            _ => unreachable!("upvalue cell must reference Cell heap data"),
        }
    }

    fn write_upvalue(&mut self, slot: usize, value: Value) {
        let closure_id = self.frames.last().expect("no active frame").closure.expect("StoreUpvalue outside closure");
        let cell_id = match self.heap.get(closure_id) {
            HeapData::Closure(c) => c.cells[slot],
            _ => unreachable!("frame.closure must reference Closure heap data"),
        };
        match self.heap.get(cell_id) {
            HeapData::Cell(Cell::Open(abs)) => {
                let abs = *abs;
                let old = std::mem::replace(&mut self.stack[abs], value);
                old.release(&mut self.heap);
            }
            HeapData::Cell(Cell::Closed(_)) => {
                let old = std::mem::replace(self.heap.get_mut(cell_id), HeapData::Cell(Cell::Closed(value)));
                if let HeapData::Cell(Cell::Closed(old)) = old {
                    old.release(&mut self.heap);
                }
            }
            _ => unreachable!("upvalue cell must reference Cell heap data"),
        }
    }

    fn make_closure(&mut self, const_idx: u16) -> RunResult<Value> {
        let frame_fn = self.frames.last().expect("no active frame").function;
        let function_value = self.code_of(frame_fn).constants().get(const_idx);
        let function_id = function_value.as_heap_id().expect("closure constant must be a Function");
        self.heap.inc_ref(function_id);

        let count = self.fetch_u8();
        let mut descs = Vec::with_capacity(usize::from(count));
        for _ in 0..count {
            let is_local = self.fetch_u8() != 0;
            let parent_index = self.fetch_u16();
            descs.push(UpvalueDesc { is_local, parent_index });
        }

        let base = self.frames.last().expect("no active frame").stack_base;
        let closure_parent = self.frames.last().expect("no active frame").closure;
        let mut cells = Vec::with_capacity(descs.len());
        for desc in descs {
            let cell_id = if desc.is_local {
                self.open_upvalue_for(base + usize::from(desc.parent_index))
            } else {
                let parent = closure_parent.expect("non-local upvalue capture outside a closure");
                match self.heap.get(parent) {
                    HeapData::Closure(c) => {
                        let id = c.cells[usize::from(desc.parent_index)];
                        self.heap.inc_ref(id);
                        id
                    }
                    _ => unreachable!("enclosing closure must reference Closure heap data"),
                }
            };
            cells.push(cell_id);
        }

        let closure_id = self.heap.allocate(HeapData::Closure(ClosureData { function: function_id, cells }));
        Ok(Value::Ref(closure_id))
    }

    /// Resolves a `MakeRange`'s step: the implicit `+1`/`-1` per the
    /// `end`/`start` direction when none was given, or the explicit step
    /// after checking it's non-zero and points the same direction (spec
    /// §4.6.5).
    fn default_range_step(&mut self, start: &Value, end: &Value, step: Value) -> RunResult<Value> {
        let s = self.numeric_as_f64(start)?;
        let e = self.numeric_as_f64(end)?;
        let direction = if e >= s { 1.0 } else { -1.0 };
        if matches!(step, Value::Undefined) {
            return Ok(Value::Int32(direction as i32));
        }
        let step_f = match self.numeric_as_f64(&step) {
            Ok(f) => f,
            Err(e) => {
                step.release(&mut self.heap);
                return Err(e);
            }
        };
        if step_f == 0.0 {
            step.release(&mut self.heap);
            return Err(self.runtime_err(ErrorKind::Value, "range step must be non-zero"));
        }
        if step_f.signum() != direction.signum() {
            step.release(&mut self.heap);
            return Err(self.runtime_err(ErrorKind::Value, "range step direction does not match start/end"));
        }
        Ok(step)
    }

    // ---- calls ---------------------------------------------------------

    fn do_call(&mut self, argc: usize) -> RunResult<()> {
        let callee_idx = self.stack.len() - argc - 1;
        let callee = self.stack.remove(callee_idx);
        let args: Vec<Value> = self.stack.drain(callee_idx..).collect();
        let result = self.dispatch_call(callee, args)?;
        self.stack.push(result);
        Ok(())
    }

    fn dispatch_call(&mut self, callee: Value, mut args: Vec<Value>) -> RunResult<Value> {
        match &callee {
            Value::Native(native) => {
                if usize::from(native.arity) != args.len() {
                    let msg = format!("expected {} argument(s), got {}", native.arity, args.len());
                    for a in args {
                        a.release(&mut self.heap);
                    }
                    return Err(self.runtime_err(ErrorKind::Arity, msg));
                }
                let func = native.func;
                let result = func(self, &args)?;
                for a in args {
                    a.release(&mut self.heap);
                }
                Ok(result)
            }
            Value::Ref(id) => {
                let id = *id;
                match self.heap.get(id) {
                    HeapData::Closure(c) => {
                        let function_id = c.function;
                        self.call_closure(function_id, Some(id), args)
                    }
                    HeapData::Function(_) => self.call_closure(id, None, args),
                    HeapData::BoundMethod(bm) => {
                        let receiver = bm.receiver.clone_retain(&self.heap);
                        let method = bm.method.clone_retain(&self.heap);
                        self.heap.dec_ref(id);
                        args.insert(0, receiver);
                        self.dispatch_call(method, args)
                    }
                    HeapData::Class(_) => self.construct(id, args),
                    _ => {
                        for a in args {
                            a.release(&mut self.heap);
                        }
                        callee.release(&mut self.heap);
                        Err(self.runtime_err(ErrorKind::Type, "value is not callable"))
                    }
                }
            }
            _ => {
                for a in args {
                    a.release(&mut self.heap);
                }
                Err(self.runtime_err(ErrorKind::Type, "value is not callable"))
            }
        }
    }

    /// Invokes a `Function`/`Closure` by pushing a new frame with `args` as
    /// its locals. `closure_id`, if present, is an owned reference this
    /// frame now holds (transferred from whatever produced `callee`).
    fn call_closure(&mut self, function_id: HeapId, closure_id: Option<HeapId>, args: Vec<Value>) -> RunResult<Value> {
        let arity = match self.heap.get(function_id) {
            HeapData::Function(f) => f.arity,
            _ => unreachable!("call_closure requires Function heap data"),
        };
        if usize::from(arity) != args.len() {
            let msg = format!("expected {} argument(s), got {}", arity, args.len());
            for a in args {
                a.release(&mut self.heap);
            }
            if let Some(c) = closure_id {
                self.heap.dec_ref(c);
            }
            return Err(self.runtime_err(ErrorKind::Arity, msg));
        }
        if self.frames.len() >= self.limits.max_call_depth {
            for a in args {
                a.release(&mut self.heap);
            }
            if let Some(c) = closure_id {
                self.heap.dec_ref(c);
            }
            return Err(self.runtime_err(ErrorKind::Value, "maximum recursion depth exceeded"));
        }

        self.heap.inc_ref(function_id);
        let stack_base = self.stack.len();
        for a in args {
            self.stack.push(a);
        }
        self.frames.push(Frame { function: function_id, closure: closure_id, ip: 0, stack_base });

        let base_depth = self.frames.len() - 1;
        self.run_until_depth(base_depth, &mut NoopTracer)
    }

    /// Pops the current frame, closing any of its still-open upvalues and
    /// releasing its locals, and returns `value` to the caller.
    fn do_return(&mut self, value: Value) -> Value {
        let frame = self.frames.pop().expect("Return with no active frame");
        let to_close: Vec<usize> =
            self.open_upvalues.iter().filter(|(idx, _)| *idx >= frame.stack_base).map(|(idx, _)| *idx).collect();
        for abs in to_close {
            self.close_upvalue(abs);
        }
        for v in self.stack.drain(frame.stack_base..) {
            v.release(&mut self.heap);
        }
        self.heap.dec_ref(frame.function);
        if let Some(closure) = frame.closure {
            self.heap.dec_ref(closure);
        }
        value
    }

    /// Constructs an instance of a class (spec §4.6.3 step 3's "Class:
    /// treat as constructor"). `ClassData` carries no field/method
    /// distinction beyond callable-or-not, so this is deliberately simple:
    /// copy the prototype onto a fresh object, re-bind every callable entry
    /// to that object via `BoundMethod` (so later plain `GetMember` lookups
    /// need no further special-casing), then either call `init` with the
    /// given arguments or, if there's no `init`, apply them positionally to
    /// the prototype's non-callable keys in declaration order. Recorded as
    /// an open-question decision in DESIGN.md.
    fn construct(&mut self, class_id: HeapId, args: Vec<Value>) -> RunResult<Value> {
        let entries: Vec<(StringId, Value)> = match self.heap.get(class_id) {
            HeapData::Class(cls) => cls.prototype.iter().map(|(k, v)| (*k, v.clone_retain(&self.heap))).collect(),
            _ => unreachable!("construct requires Class heap data"),
        };

        let mut map = indexmap::IndexMap::new();
        let mut field_slots: Vec<StringId> = Vec::new();
        let mut init_key: Option<StringId> = None;
        for (k, v) in entries {
            if is_callable(&self.heap, &v) {
                if self.interns.resolve(k) == "init" {
                    init_key = Some(k);
                }
            } else {
                field_slots.push(k);
            }
            map.insert(k, v);
        }
        let obj_id = self.heap.allocate(HeapData::Object(map));

        let callables: Vec<StringId> = match self.heap.get(obj_id) {
            HeapData::Object(map) => map.iter().filter(|(_, v)| is_callable(&self.heap, v)).map(|(k, _)| *k).collect(),
            _ => unreachable!(),
        };
        for k in callables {
            let method = match self.heap.get_mut(obj_id) {
                HeapData::Object(map) => map.swap_remove(&k).expect("key just observed present"),
                _ => unreachable!(),
            };
            self.heap.inc_ref(obj_id);
            let receiver = Value::Ref(obj_id);
            let bm_id = self.heap.allocate(HeapData::BoundMethod(crate::heap::BoundMethodData { receiver, method }));
            if let HeapData::Object(map) = self.heap.get_mut(obj_id) {
                map.insert(k, Value::Ref(bm_id));
            }
        }

        if let Some(init_key) = init_key {
            let bound = match self.heap.get(obj_id) {
                HeapData::Object(map) => map.get(&init_key).expect("init just bound above").clone_retain(&self.heap),
                _ => unreachable!(),
            };
            let result = self.dispatch_call(bound, args)?;
            result.release(&mut self.heap);
        } else {
            if args.len() > field_slots.len() {
                for a in args {
                    a.release(&mut self.heap);
                }
                self.heap.dec_ref(obj_id);
                return Err(self.runtime_err(ErrorKind::Arity, "too many positional fields for class"));
            }
            if let HeapData::Object(map) = self.heap.get_mut(obj_id) {
                for (slot, value) in field_slots.into_iter().zip(args) {
                    if let Some(old) = map.insert(slot, value) {
                        old.release(&mut self.heap);
                    }
                }
            }
        }

        self.heap.dec_ref(class_id);
        Ok(Value::Ref(obj_id))
    }

    // ---- member / index access ------------------------------------------

    fn get_member(&mut self, receiver: &Value, name: StringId) -> RunResult<Value> {
        crate::builtins::get_member(self, receiver, name)
    }

    fn set_member(&mut self, receiver: &Value, name: StringId, value: Value) -> RunResult<()> {
        match receiver {
            Value::Ref(id) => match self.heap.get_mut(*id) {
                HeapData::Object(map) => {
                    if let Some(old) = map.insert(name, value) {
                        old.release(&mut self.heap);
                    }
                    Ok(())
                }
                _ => {
                    value.release(&mut self.heap);
                    Err(self.runtime_err(ErrorKind::Type, "cannot set a property on this value"))
                }
            },
            _ => {
                value.release(&mut self.heap);
                Err(self.runtime_err(ErrorKind::Type, "cannot set a property on this value"))
            }
        }
    }

    fn get_index(&mut self, target: &Value, index: &Value) -> RunResult<Value> {
        match target {
            Value::Ref(id) => match self.heap.get(*id) {
                HeapData::Array(items) => {
                    let i = self.index_as_usize(index, items.len())?;
                    items.get(i).map(|v| v.clone_retain(&self.heap)).ok_or_else(|| self.runtime_err(ErrorKind::Index, "array index out of bounds"))
                }
                HeapData::Str(s) => {
                    let chars: Vec<char> = s.chars().collect();
                    let i = self.index_as_usize(index, chars.len())?;
                    let ch = *chars.get(i).ok_or_else(|| self.runtime_err(ErrorKind::Index, "string index out of bounds"))?;
                    let id = self.heap.allocate(HeapData::Str(ch.to_string().into_boxed_str()));
                    Ok(Value::Ref(id))
                }
                HeapData::Object(_) => {
                    let key = self.value_as_string_key(index)?;
                    match self.heap.get(*id) {
                        HeapData::Object(map) => Ok(map.get(&key).map_or(Value::Undefined, |v| v.clone_retain(&self.heap))),
                        _ => unreachable!(),
                    }
                }
                _ => Err(self.runtime_err(ErrorKind::Type, "value is not indexable")),
            },
            _ => Err(self.runtime_err(ErrorKind::Type, "value is not indexable")),
        }
    }

    fn set_index(&mut self, target: &Value, index: &Value, value: Value) -> RunResult<()> {
        match target {
            Value::Ref(id) => {
                let id = *id;
                match self.heap.get(id) {
                    HeapData::Array(items) => {
                        let len = items.len();
                        let i = self.index_as_usize(index, len)?;
                        if i >= len {
                            value.release(&mut self.heap);
                            return Err(self.runtime_err(ErrorKind::Index, "array index out of bounds"));
                        }
                        if let HeapData::Array(items) = self.heap.get_mut(id) {
                            let old = std::mem::replace(&mut items[i], value);
                            old.release(&mut self.heap);
                        }
                        Ok(())
                    }
                    HeapData::Object(_) => {
                        let key = self.value_as_string_key(index)?;
                        if let HeapData::Object(map) = self.heap.get_mut(id) {
                            if let Some(old) = map.insert(key, value) {
                                old.release(&mut self.heap);
                            }
                        }
                        Ok(())
                    }
                    _ => {
                        value.release(&mut self.heap);
                        Err(self.runtime_err(ErrorKind::Type, "value does not support index assignment"))
                    }
                }
            }
            _ => {
                value.release(&mut self.heap);
                Err(self.runtime_err(ErrorKind::Type, "value does not support index assignment"))
            }
        }
    }

    fn index_as_usize(&self, index: &Value, len: usize) -> RunResult<usize> {
        let i = match index {
            Value::Int32(i) => i64::from(*i),
            _ => return Err(self.runtime_err(ErrorKind::Type, "index must be an int")),
        };
        let resolved = if i < 0 { i + len as i64 } else { i };
        usize::try_from(resolved).map_err(|_| self.runtime_err(ErrorKind::Index, "index out of bounds"))
    }

    fn value_as_string_key(&mut self, index: &Value) -> RunResult<StringId> {
        match index {
            Value::Ref(id) => match self.heap.get(*id) {
                HeapData::Str(s) => Ok(self.interns.intern(s)),
                _ => Err(self.runtime_err(ErrorKind::Type, "object key must be a string")),
            },
            _ => Err(self.runtime_err(ErrorKind::Type, "object key must be a string")),
        }
    }

    // ---- arithmetic ------------------------------------------------------

    pub(crate) fn numeric_as_f64(&self, v: &Value) -> RunResult<f64> {
        match v {
            Value::Int32(i) => Ok(f64::from(*i)),
            Value::Float32(f) => Ok(f64::from(*f)),
            Value::Float64(f) => Ok(*f),
            Value::Ref(id) => match self.heap.get(*id) {
                HeapData::BigInt(b) => Ok(b.to_f64()),
                _ => Err(self.runtime_err(ErrorKind::Type, "expected a number")),
            },
            _ => Err(self.runtime_err(ErrorKind::Type, "expected a number")),
        }
    }

    fn to_i32_truncating(&self, v: &Value) -> RunResult<i32> {
        match v {
            #[allow(clippy::cast_possible_truncation)]
            Value::Int32(i) => Ok(*i),
            #[allow(clippy::cast_possible_truncation)]
            Value::Float32(f) => Ok(*f as i32),
            #[allow(clippy::cast_possible_truncation)]
            Value::Float64(f) => Ok(*f as i32),
            Value::Ref(id) => match self.heap.get(*id) {
                HeapData::BigInt(b) => Ok(b.to_i64().unwrap_or(0) as i32),
                _ => Err(self.runtime_err(ErrorKind::Type, "expected an int")),
            },
            _ => Err(self.runtime_err(ErrorKind::Type, "expected an int")),
        }
    }

    fn negate(&mut self, v: Value) -> RunResult<Value> {
        let result = match &v {
            Value::Int32(i) => match i.checked_neg() {
                Some(n) => Value::Int32(n),
                None => self.box_bigint(-&DynInt::from_i64(i64::from(*i))),
            },
            Value::Float32(f) => Value::Float32(-f),
            Value::Float64(f) => Value::Float64(-f),
            Value::Ref(id) => match self.heap.get(*id) {
                HeapData::BigInt(b) => self.box_bigint(-b),
                _ => return Err(self.runtime_err(ErrorKind::Type, "cannot negate this value")),
            },
            _ => return Err(self.runtime_err(ErrorKind::Type, "cannot negate this value")),
        };
        v.release(&mut self.heap);
        Ok(result)
    }

    pub(crate) fn box_bigint(&mut self, v: DynInt) -> Value {
        match demote_or_box(v) {
            Ok(value) => value,
            Err(big) => Value::Ref(self.heap.allocate(HeapData::BigInt(big))),
        }
    }

    /// Extracts the `DynInt` a numeric value represents, for the BigInt
    /// tier of the promotion ladder (spec §4.6.2 rule 3).
    fn as_dyn_int(&self, v: &Value) -> DynInt {
        match v {
            Value::Int32(i) => DynInt::from_i64(i64::from(*i)),
            Value::Ref(id) => match self.heap.get(*id) {
                HeapData::BigInt(b) => b.clone(),
                _ => unreachable!("as_dyn_int requires a numeric value"),
            },
            _ => unreachable!("as_dyn_int requires a numeric value"),
        }
    }

    fn numeric_tier(&self, v: &Value) -> NumTier {
        match v {
            Value::Int32(_) => NumTier::Int32,
            Value::Float32(_) => NumTier::Float32,
            Value::Float64(_) => NumTier::Float64,
            Value::Ref(id) => match self.heap.get(*id) {
                HeapData::BigInt(_) => NumTier::BigInt,
                _ => NumTier::NotNumeric,
            },
            _ => NumTier::NotNumeric,
        }
    }

    fn binary_op(&mut self, op: BinaryOp, lhs: Value, rhs: Value) -> RunResult<Value> {
        if op == BinaryOp::Add {
            if let Some(result) = self.try_add_non_numeric(&lhs, &rhs)? {
                lhs.release(&mut self.heap);
                rhs.release(&mut self.heap);
                return Ok(result);
            }
        }
        let ltier = self.numeric_tier(&lhs);
        let rtier = self.numeric_tier(&rhs);
        if ltier == NumTier::NotNumeric || rtier == NumTier::NotNumeric {
            lhs.release(&mut self.heap);
            rhs.release(&mut self.heap);
            return Err(self.runtime_err(ErrorKind::Type, "operands must be numbers"));
        }

        let result = match op {
            BinaryOp::Shl | BinaryOp::Shr | BinaryOp::UShr | BinaryOp::BitAnd | BinaryOp::BitOr | BinaryOp::BitXor => {
                self.bitwise(op, &lhs, &rhs)?
            }
            BinaryOp::Pow => Value::Float64(self.numeric_as_f64(&lhs)?.powf(self.numeric_as_f64(&rhs)?)),
            _ if op == BinaryOp::Div => self.divide(&lhs, &rhs, ltier, rtier)?,
            _ if op == BinaryOp::FloorDiv => self.floor_div(&lhs, &rhs, ltier, rtier)?,
            _ if op == BinaryOp::Mod => self.modulo(&lhs, &rhs, ltier, rtier)?,
            BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul => self.checked_numeric(op, &lhs, &rhs, ltier, rtier)?,
            _ => unreachable!("non-arithmetic BinaryOp reached binary_op"),
        };
        lhs.release(&mut self.heap);
        rhs.release(&mut self.heap);
        Ok(result)
    }

    /// `+`'s string/array special cases (spec §4.6.2): string concatenation
    /// when either side is a string, array concatenation when both sides
    /// are arrays. Returns `None` to fall through to numeric addition.
    fn try_add_non_numeric(&mut self, lhs: &Value, rhs: &Value) -> RunResult<Option<Value>> {
        let lhs_is_str = matches!(lhs, Value::Ref(id) if matches!(self.heap.get(*id), HeapData::Str(_)));
        let rhs_is_str = matches!(rhs, Value::Ref(id) if matches!(self.heap.get(*id), HeapData::Str(_)));
        if lhs_is_str || rhs_is_str {
            let mut out = String::new();
            to_display_string(&self.heap, &self.interns, lhs, &mut out);
            to_display_string(&self.heap, &self.interns, rhs, &mut out);
            let id = self.heap.allocate(HeapData::Str(out.into_boxed_str()));
            return Ok(Some(Value::Ref(id)));
        }
        let lhs_is_arr = matches!(lhs, Value::Ref(id) if matches!(self.heap.get(*id), HeapData::Array(_)));
        let rhs_is_arr = matches!(rhs, Value::Ref(id) if matches!(self.heap.get(*id), HeapData::Array(_)));
        if lhs_is_arr && rhs_is_arr {
            let mut items = Vec::new();
            if let (Value::Ref(l), Value::Ref(r)) = (lhs, rhs) {
                if let HeapData::Array(a) = self.heap.get(*l) {
                    for v in a {
                        items.push(v.clone_retain(&self.heap));
                    }
                }
                if let HeapData::Array(b) = self.heap.get(*r) {
                    for v in b {
                        items.push(v.clone_retain(&self.heap));
                    }
                }
            }
            let id = self.heap.allocate(HeapData::Array(items));
            return Ok(Some(Value::Ref(id)));
        }
        if lhs_is_arr != rhs_is_arr && (lhs_is_arr || rhs_is_arr) {
            return Err(self.runtime_err(ErrorKind::Type, "cannot add an array to a non-array"));
        }
        Ok(None)
    }

    fn checked_numeric(&mut self, op: BinaryOp, lhs: &Value, rhs: &Value, ltier: NumTier, rtier: NumTier) -> RunResult<Value> {
        let tier = ltier.max(rtier);
        Ok(match tier {
            NumTier::Float64 => {
                let (a, b) = (self.numeric_as_f64(lhs)?, self.numeric_as_f64(rhs)?);
                Value::Float64(match op {
                    BinaryOp::Add => a + b,
                    BinaryOp::Sub => a - b,
                    BinaryOp::Mul => a * b,
                    _ => unreachable!(),
                })
            }
            NumTier::Float32 => {
                #[allow(clippy::cast_possible_truncation)]
                let (a, b) = (self.numeric_as_f64(lhs)? as f32, self.numeric_as_f64(rhs)? as f32);
                Value::Float32(match op {
                    BinaryOp::Add => a + b,
                    BinaryOp::Sub => a - b,
                    BinaryOp::Mul => a * b,
                    _ => unreachable!(),
                })
            }
            NumTier::BigInt => {
                let (a, b) = (self.as_dyn_int(lhs), self.as_dyn_int(rhs));
                let result = match op {
                    BinaryOp::Add => &a + &b,
                    BinaryOp::Sub => &a - &b,
                    BinaryOp::Mul => &a * &b,
                    _ => unreachable!(),
                };
                self.box_bigint(result)
            }
            NumTier::Int32 => {
                let (a, b) = (self.to_i32_truncating(lhs)?, self.to_i32_truncating(rhs)?);
                let checked = match op {
                    BinaryOp::Add => checked_add_i32(a, b),
                    BinaryOp::Sub => checked_sub_i32(a, b),
                    BinaryOp::Mul => checked_mul_i32(a, b),
                    _ => unreachable!(),
                };
                if checked.fits {
                    Value::Int32(checked.low_bits)
                } else {
                    let result = match op {
                        BinaryOp::Add => &DynInt::from_i64(i64::from(a)) + &DynInt::from_i64(i64::from(b)),
                        BinaryOp::Sub => &DynInt::from_i64(i64::from(a)) - &DynInt::from_i64(i64::from(b)),
                        BinaryOp::Mul => &DynInt::from_i64(i64::from(a)) * &DynInt::from_i64(i64::from(b)),
                        _ => unreachable!(),
                    };
                    self.box_bigint(result)
                }
            }
            NumTier::NotNumeric => unreachable!("checked by caller"),
        })
    }

    fn divide(&mut self, lhs: &Value, rhs: &Value, ltier: NumTier, rtier: NumTier) -> RunResult<Value> {
        let tier = ltier.max(rtier);
        if tier == NumTier::Int32 {
            let (a, b) = (self.to_i32_truncating(lhs)?, self.to_i32_truncating(rhs)?);
            if b == 0 {
                return Err(self.runtime_err(ErrorKind::DivisionByZero, "division by zero"));
            }
            if a % b == 0 {
                return Ok(match a.checked_div(b) {
                    Some(v) => Value::Int32(v),
                    None => self.box_bigint(DynInt::from_i64(-i64::from(a))),
                });
            }
            return Ok(Value::Float64(f64::from(a) / f64::from(b)));
        }
        if tier == NumTier::BigInt {
            let (a, b) = (self.as_dyn_int(lhs), self.as_dyn_int(rhs));
            if b.is_zero() {
                return Err(self.runtime_err(ErrorKind::DivisionByZero, "division by zero"));
            }
            if (&a % &b).is_zero() {
                return Ok(self.box_bigint(&a / &b));
            }
            return Ok(Value::Float64(a.to_f64() / b.to_f64()));
        }
        let (a, b) = (self.numeric_as_f64(lhs)?, self.numeric_as_f64(rhs)?);
        Ok(Value::Float64(a / b))
    }

    fn floor_div(&mut self, lhs: &Value, rhs: &Value, ltier: NumTier, rtier: NumTier) -> RunResult<Value> {
        let tier = ltier.max(rtier);
        if tier == NumTier::Int32 {
            let (a, b) = (self.to_i32_truncating(lhs)?, self.to_i32_truncating(rhs)?);
            if b == 0 {
                return Err(self.runtime_err(ErrorKind::DivisionByZero, "division by zero"));
            }
            return Ok(Value::Int32(a.div_euclid(b)));
        }
        if tier == NumTier::BigInt {
            let (a, b) = (self.as_dyn_int(lhs), self.as_dyn_int(rhs));
            if b.is_zero() {
                return Err(self.runtime_err(ErrorKind::DivisionByZero, "division by zero"));
            }
            return Ok(self.box_bigint(a.div_floor(&b)));
        }
        let (a, b) = (self.numeric_as_f64(lhs)?, self.numeric_as_f64(rhs)?);
        if b == 0.0 {
            return Err(self.runtime_err(ErrorKind::DivisionByZero, "division by zero"));
        }
        Ok(Value::Float64((a / b).floor()))
    }

    fn modulo(&mut self, lhs: &Value, rhs: &Value, ltier: NumTier, rtier: NumTier) -> RunResult<Value> {
        let tier = ltier.max(rtier);
        if tier == NumTier::Int32 {
            let (a, b) = (self.to_i32_truncating(lhs)?, self.to_i32_truncating(rhs)?);
            if b == 0 {
                return Err(self.runtime_err(ErrorKind::DivisionByZero, "modulo by zero"));
            }
            return Ok(Value::Int32(a.wrapping_rem(b)));
        }
        if tier == NumTier::BigInt {
            let (a, b) = (self.as_dyn_int(lhs), self.as_dyn_int(rhs));
            if b.is_zero() {
                return Err(self.runtime_err(ErrorKind::DivisionByZero, "modulo by zero"));
            }
            return Ok(self.box_bigint(&a % &b));
        }
        let (a, b) = (self.numeric_as_f64(lhs)?, self.numeric_as_f64(rhs)?);
        Ok(Value::Float64(a % b))
    }

    fn bitwise(&mut self, op: BinaryOp, lhs: &Value, rhs: &Value) -> RunResult<Value> {
        let a = self.to_i32_truncating(lhs)?;
        let b = self.to_i32_truncating(rhs)?;
        Ok(match op {
            BinaryOp::BitAnd => Value::Int32(a & b),
            BinaryOp::BitOr => Value::Int32(a | b),
            BinaryOp::BitXor => Value::Int32(a ^ b),
            BinaryOp::Shl => Value::Int32(a.wrapping_shl((b & 31) as u32)),
            BinaryOp::Shr => Value::Int32(a.wrapping_shr((b & 31) as u32)),
            #[allow(clippy::cast_sign_loss)]
            BinaryOp::UShr => Value::Int32(((a as u32).wrapping_shr((b & 31) as u32)) as i32),
            _ => unreachable!("non-bitwise BinaryOp reached bitwise"),
        })
    }

    fn compare(&mut self, op: Opcode, lhs: &Value, rhs: &Value) -> RunResult<bool> {
        let both_str = matches!(
            (lhs, rhs),
            (Value::Ref(l), Value::Ref(r))
                if matches!(self.heap.get(*l), HeapData::Str(_)) && matches!(self.heap.get(*r), HeapData::Str(_))
        );
        if both_str {
            let (a, b) = match (lhs, rhs) {
                (Value::Ref(l), Value::Ref(r)) => match (self.heap.get(*l), self.heap.get(*r)) {
                    (HeapData::Str(a), HeapData::Str(b)) => (a.clone(), b.clone()),
                    _ => unreachable!(),
                },
                _ => unreachable!(),
            };
            return Ok(match op {
                Opcode::Lt => a < b,
                Opcode::Le => a <= b,
                Opcode::Gt => a > b,
                Opcode::Ge => a >= b,
                _ => unreachable!(),
            });
        }
        let a = self.numeric_as_f64(lhs)?;
        let b = self.numeric_as_f64(rhs)?;
        Ok(match op {
            Opcode::Lt => a < b,
            Opcode::Le => a <= b,
            Opcode::Gt => a > b,
            Opcode::Ge => a >= b,
            _ => unreachable!(),
        })
    }

    fn membership(&mut self, lhs: &Value, rhs: &Value) -> RunResult<bool> {
        match rhs {
            Value::Ref(id) => match self.heap.get(*id) {
                HeapData::Array(items) => Ok(items.iter().any(|v| equals(&self.heap, lhs, v))),
                HeapData::Object(_) => {
                    let key = self.value_as_string_key(lhs)?;
                    match self.heap.get(*id) {
                        HeapData::Object(map) => Ok(map.contains_key(&key)),
                        _ => unreachable!(),
                    }
                }
                HeapData::Str(s) => match lhs {
                    Value::Ref(lid) => match self.heap.get(*lid) {
                        HeapData::Str(needle) => Ok(s.contains(needle.as_ref())),
                        _ => Err(self.runtime_err(ErrorKind::Type, "'in' on a string requires a string operand")),
                    },
                    _ => Err(self.runtime_err(ErrorKind::Type, "'in' on a string requires a string operand")),
                },
                _ => Err(self.runtime_err(ErrorKind::Type, "right-hand side of 'in' is not a container")),
            },
            _ => Err(self.runtime_err(ErrorKind::Type, "right-hand side of 'in' is not a container")),
        }
    }

    fn instance_of(heap: &Heap, lhs: &Value, rhs: &Value) -> bool {
        let Value::Ref(class_id) = rhs else { return false };
        if !matches!(heap.get(*class_id), HeapData::Class(_)) {
            return false;
        }
        type_name(heap, lhs) == "object" && matches!(lhs, Value::Ref(_))
    }
}

enum StepResult {
    Continue,
    Returned(Value),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum NumTier {
    NotNumeric,
    Int32,
    BigInt,
    Float32,
    Float64,
}

fn binop_for(op: Opcode) -> BinaryOp {
    match op {
        Opcode::Add => BinaryOp::Add,
        Opcode::Sub => BinaryOp::Sub,
        Opcode::Mul => BinaryOp::Mul,
        Opcode::Div => BinaryOp::Div,
        Opcode::Mod => BinaryOp::Mod,
        Opcode::Pow => BinaryOp::Pow,
        Opcode::FloorDiv => BinaryOp::FloorDiv,
        Opcode::BitAnd => BinaryOp::BitAnd,
        Opcode::BitOr => BinaryOp::BitOr,
        Opcode::BitXor => BinaryOp::BitXor,
        Opcode::Shl => BinaryOp::Shl,
        Opcode::Shr => BinaryOp::Shr,
        Opcode::UShr => BinaryOp::UShr,
        _ => unreachable!("binop_for called with a non-arithmetic opcode"),
    }
}

/// Whether a class prototype entry should be treated as a method (and so
/// rebound to a `BoundMethod` at construction time) rather than a plain
/// field. Natives and any heap callable (`Function`/`Closure`) qualify.
fn is_callable(heap: &Heap, v: &Value) -> bool {
    match v {
        Value::Native(_) => true,
        Value::Ref(id) => matches!(heap.get(*id), HeapData::Function(_) | HeapData::Closure(_)),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::{ExecOutcome, VM};
    use crate::value::Value;

    fn run_ok(source: &str) -> Value {
        let mut vm = VM::create();
        match vm.interpret(source) {
            ExecOutcome::Ok(v) => v,
            ExecOutcome::CompileError(e) => panic!("compile error: {e:?}"),
            ExecOutcome::RuntimeError(e) => panic!("runtime error: {e}"),
        }
    }

    #[test]
    fn arithmetic_precedence() {
        assert!(matches!(run_ok("2 + 3 * 4"), Value::Int32(14)));
    }

    #[test]
    fn int32_overflow_promotes_to_bigint() {
        let mut vm = VM::create();
        let result = vm.interpret("2147483647 + 1");
        match result {
            ExecOutcome::Ok(Value::Ref(id)) => match vm.heap().get(id) {
                crate::heap::HeapData::BigInt(b) => assert_eq!(b.to_i64(), Some(2_147_483_648)),
                other => panic!("expected BigInt, got {other:?}"),
            },
            other => panic!("expected Ok(Ref), got {other:?}"),
        }
    }

    #[test]
    fn compound_assignment_reads_back() {
        assert!(matches!(run_ok("var x = 10; x += 5; x"), Value::Int32(15)));
    }

    #[test]
    fn division_by_zero_is_a_runtime_error() {
        let mut vm = VM::create();
        assert!(matches!(vm.interpret("10 / 0"), ExecOutcome::RuntimeError(_)));
    }

    #[test]
    fn template_literal_interpolates() {
        let mut vm = VM::create();
        match vm.interpret("`sum=${1+2}`") {
            ExecOutcome::Ok(Value::Ref(id)) => match vm.heap().get(id) {
                crate::heap::HeapData::Str(s) => assert_eq!(&**s, "sum=3"),
                other => panic!("expected Str, got {other:?}"),
            },
            other => panic!("expected Ok(Ref), got {other:?}"),
        }
    }

    /// §8 quantified invariant: every heap value's refcount reaches zero
    /// once nothing references it anymore. Exercises nested arrays/strings
    /// (several refcounted allocations) so the dec_ref cascade through
    /// `release_children` is actually under test, not just a single slot.
    #[test]
    fn releasing_the_result_frees_every_heap_allocation() {
        let mut vm = VM::create();
        let value = match vm.interpret(r#"[["a", "b"], ["c", "d"]]"#) {
            ExecOutcome::Ok(v) => v,
            other => panic!("expected Ok, got {other:?}"),
        };
        assert!(vm.heap.live_count() > 0);
        value.release(&mut vm.heap);
        assert_eq!(vm.heap.live_count(), 0);
    }
}
