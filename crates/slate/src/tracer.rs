//! VM execution tracing hook.
//!
//! Mirrors the teacher's trait-of-hooks tracer, narrowed to the one event
//! this VM has that's worth observing from outside: instruction dispatch.
//! [`NoopTracer`] costs nothing — its calls are monomorphized away.

use crate::bytecode::Opcode;

pub trait VmTracer {
    fn on_instruction(&mut self, ip: usize, op: Opcode, stack_depth: usize, frame_depth: usize) {
        let _ = (ip, op, stack_depth, frame_depth);
    }
}

/// Production default: every hook is the trait's empty default body.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopTracer;

impl VmTracer for NoopTracer {}

/// Records every instruction dispatched, for tests and post-mortem
/// debugging.
#[derive(Debug, Default)]
pub struct RecordingTracer {
    pub events: Vec<(usize, Opcode, usize, usize)>,
}

impl VmTracer for RecordingTracer {
    fn on_instruction(&mut self, ip: usize, op: Opcode, stack_depth: usize, frame_depth: usize) {
        self.events.push((ip, op, stack_depth, frame_depth));
    }
}
