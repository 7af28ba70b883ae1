//! Native callables and member dispatch for the built-in types (spec
//! §4.6.5, §4.6.6; SPEC_FULL.md §11).
//!
//! `GetMember` on a heap-bearing receiver (`Str`, `Array`, `Range`,
//! `Iterator`) routes through [`get_member`] below rather than being
//! special-cased inline in the VM's dispatch loop, the way the teacher
//! keeps its builtin-method tables out of the opcode match. Every bound
//! method is a plain [`NativeFunction`] wrapped in a `BoundMethod` whose
//! receiver is prepended to the argument list by the existing
//! `dispatch_call` path (spec §4.6.6) — no separate bound-method calling
//! convention is needed. The same natives are also installed as globals
//! (`iterator`, `hasNext`, `next`, `isEmpty`, `toArray`, `length`,
//! `contains`, `type`), taking the receiver as their first argument, per
//! SPEC_FULL.md §11's "both as free functions and as bound methods".

use crate::bytecode::VM;
use crate::dynint::{demote_or_box, DynInt};
use crate::error::{ErrorKind, RunResult};
use crate::heap::{BoundMethodData, HeapData, HeapId, IteratorData, IteratorKind};
use crate::intern::StringId;
use crate::value::{type_name, Value};

/// Installs every global built-in. Called once from `VM::create_with_args`.
pub(crate) fn register_builtins(vm: &mut VM) {
    define_native(vm, "type", 1, native_type);
    define_native(vm, "iterator", 1, native_iterator);
    define_native(vm, "hasNext", 1, native_has_next);
    define_native(vm, "next", 1, native_next);
    define_native(vm, "isEmpty", 1, native_is_empty);
    define_native(vm, "toArray", 1, native_to_array);
    define_native(vm, "length", 1, native_length);
    define_native(vm, "contains", 2, native_contains);
}

fn define_native(vm: &mut VM, name: &str, arity: u8, func: fn(&mut VM, &[Value]) -> RunResult<Value>) {
    let id = vm.interns_mut().intern(name);
    let value = Value::Native(crate::value::NativeFunction { name: id, arity, func });
    vm.define_global(id, value);
}

/// `GetMember` dispatch for a built-in receiver. Plain data access (a
/// bare field, no call involved) returns the value directly; everything
/// else is wrapped in a `BoundMethod` around the matching native so it
/// reads the same as a user-defined method from the call site.
pub(crate) fn get_member(vm: &mut VM, receiver: &Value, name: StringId) -> RunResult<Value> {
    if receiver.is_nullish() {
        return Err(vm.runtime_err(ErrorKind::Index, "cannot read a property of a nullish value"));
    }
    let Value::Ref(id) = receiver else {
        return Ok(Value::Undefined);
    };
    let id = *id;
    let kind = match vm.heap().get(id) {
        HeapData::Str(_) => ReceiverKind::Str,
        HeapData::Array(_) => ReceiverKind::Array,
        HeapData::Object(_) => ReceiverKind::Object,
        HeapData::Range(_) => ReceiverKind::Range,
        HeapData::Iterator(_) => ReceiverKind::Iterator,
        HeapData::Class(_) => ReceiverKind::Class,
        _ => ReceiverKind::Other,
    };
    let member = vm.interns().resolve(name).to_string();
    match kind {
        ReceiverKind::Str => match member.as_str() {
            "length" => Ok(bind(vm, receiver, "length", 1, native_length)),
            _ => Ok(Value::Undefined),
        },
        ReceiverKind::Array => match member.as_str() {
            "length" => {
                let len = match vm.heap().get(id) {
                    HeapData::Array(items) => items.len(),
                    _ => unreachable!(),
                };
                Ok(Value::Int32(i32::try_from(len).unwrap_or(i32::MAX)))
            }
            "iterator" => Ok(bind(vm, receiver, "iterator", 1, native_iterator)),
            "toArray" => Ok(bind(vm, receiver, "toArray", 1, native_to_array)),
            _ => Ok(Value::Undefined),
        },
        ReceiverKind::Range => match member.as_str() {
            "length" => Ok(bind(vm, receiver, "length", 1, native_length)),
            "contains" => Ok(bind(vm, receiver, "contains", 2, native_contains)),
            "toArray" => Ok(bind(vm, receiver, "toArray", 1, native_to_array)),
            "iterator" => Ok(bind(vm, receiver, "iterator", 1, native_iterator)),
            _ => Ok(Value::Undefined),
        },
        ReceiverKind::Iterator => match member.as_str() {
            "hasNext" => Ok(bind(vm, receiver, "hasNext", 1, native_has_next)),
            "next" => Ok(bind(vm, receiver, "next", 1, native_next)),
            "isEmpty" => Ok(bind(vm, receiver, "isEmpty", 1, native_is_empty)),
            "toArray" => Ok(bind(vm, receiver, "toArray", 1, native_to_array)),
            _ => Ok(Value::Undefined),
        },
        ReceiverKind::Object => {
            let key = vm.interns_mut().intern(&member);
            match vm.heap().get(id) {
                HeapData::Object(map) => Ok(map.get(&key).map_or(Value::Undefined, |v| v.clone_retain(vm.heap()))),
                _ => unreachable!(),
            }
        }
        ReceiverKind::Class => {
            let key = vm.interns_mut().intern(&member);
            match vm.heap().get(id) {
                HeapData::Class(cls) => Ok(cls.prototype.get(&key).map_or(Value::Undefined, |v| v.clone_retain(vm.heap()))),
                _ => unreachable!(),
            }
        }
        ReceiverKind::Other => Ok(Value::Undefined),
    }
}

enum ReceiverKind {
    Str,
    Array,
    Object,
    Range,
    Iterator,
    Class,
    Other,
}

/// Wraps `func` as a `BoundMethod` over `receiver`, matching the
/// `GET_PROPERTY` contract of spec §4.6.6.
fn bind(vm: &mut VM, receiver: &Value, name: &str, arity: u8, func: fn(&mut VM, &[Value]) -> RunResult<Value>) -> Value {
    let receiver = receiver.clone_retain(vm.heap());
    let name_id = vm.interns_mut().intern(name);
    let method = Value::Native(crate::value::NativeFunction { name: name_id, arity, func });
    let bm_id = vm.heap_mut().allocate(HeapData::BoundMethod(BoundMethodData { receiver, method }));
    Value::Ref(bm_id)
}

fn native_type(vm: &mut VM, args: &[Value]) -> RunResult<Value> {
    let name = type_name(vm.heap(), &args[0]);
    let id = vm.heap_mut().allocate(HeapData::Str(name.into()));
    Ok(Value::Ref(id))
}

// ---- range bounds ---------------------------------------------------

struct RangeBounds {
    start: i64,
    end: i64,
    step: i64,
    exclusive: bool,
}

fn range_bounds(vm: &VM, range_id: HeapId) -> RunResult<RangeBounds> {
    let (start, end, step, exclusive) = match vm.heap().get(range_id) {
        HeapData::Range(r) => (
            range_value_as_i64(vm, &r.start)?,
            range_value_as_i64(vm, &r.end)?,
            range_value_as_i64(vm, &r.step)?,
            r.exclusive,
        ),
        _ => unreachable!("range_bounds requires Range heap data"),
    };
    Ok(RangeBounds { start, end, step, exclusive })
}

fn range_value_as_i64(vm: &VM, v: &Value) -> RunResult<i64> {
    match v {
        Value::Int32(i) => Ok(i64::from(*i)),
        Value::Ref(id) => match vm.heap().get(*id) {
            HeapData::BigInt(b) => {
                b.to_i64().ok_or_else(|| vm.runtime_err(ErrorKind::Value, "range bound too large to iterate"))
            }
            _ => Err(vm.runtime_err(ErrorKind::Type, "range bounds must be integers")),
        },
        _ => Err(vm.runtime_err(ErrorKind::Type, "range bounds must be integers")),
    }
}

fn range_count(b: &RangeBounds) -> i64 {
    if b.step > 0 {
        let bound = if b.exclusive { b.end } else { b.end + 1 };
        if bound <= b.start { 0 } else { (bound - b.start + b.step - 1) / b.step }
    } else {
        let neg = -b.step;
        let bound = if b.exclusive { b.end } else { b.end - 1 };
        if b.start <= bound { 0 } else { (b.start - bound + neg - 1) / neg }
    }
}

fn range_contains_value(b: &RangeBounds, v: i64) -> bool {
    if b.step > 0 {
        let in_bounds = if b.exclusive { v < b.end } else { v <= b.end };
        v >= b.start && in_bounds && (v - b.start) % b.step == 0
    } else {
        let neg = -b.step;
        let in_bounds = if b.exclusive { v > b.end } else { v >= b.end };
        v <= b.start && in_bounds && (b.start - v) % neg == 0
    }
}

fn int_to_value(vm: &mut VM, v: i64) -> Value {
    match demote_or_box(DynInt::from_i64(v)) {
        Ok(value) => value,
        Err(big) => Value::Ref(vm.heap_mut().allocate(HeapData::BigInt(big))),
    }
}

// ---- length() / contains(v) -----------------------------------------

fn native_length(vm: &mut VM, args: &[Value]) -> RunResult<Value> {
    match &args[0] {
        Value::Ref(id) => match vm.heap().get(*id) {
            HeapData::Str(s) => Ok(Value::Int32(i32::try_from(s.chars().count()).unwrap_or(i32::MAX))),
            HeapData::Range(_) => {
                let id = *id;
                let bounds = range_bounds(vm, id)?;
                Ok(Value::Int32(i32::try_from(range_count(&bounds).max(0)).unwrap_or(i32::MAX)))
            }
            _ => Err(vm.runtime_err(ErrorKind::Type, "value has no length")),
        },
        _ => Err(vm.runtime_err(ErrorKind::Type, "value has no length")),
    }
}

fn native_contains(vm: &mut VM, args: &[Value]) -> RunResult<Value> {
    let Value::Ref(id) = &args[0] else {
        return Err(vm.runtime_err(ErrorKind::Type, "contains() requires a range receiver"));
    };
    let id = *id;
    if !matches!(vm.heap().get(id), HeapData::Range(_)) {
        return Err(vm.runtime_err(ErrorKind::Type, "contains() requires a range receiver"));
    }
    let bounds = range_bounds(vm, id)?;
    let needle = range_value_as_i64(vm, &args[1])?;
    Ok(Value::Boolean(range_contains_value(&bounds, needle)))
}

// ---- iterator() -------------------------------------------------------

fn native_iterator(vm: &mut VM, args: &[Value]) -> RunResult<Value> {
    let Value::Ref(id) = &args[0] else {
        return Err(vm.runtime_err(ErrorKind::Type, "value is not iterable"));
    };
    let id = *id;
    let kind = match vm.heap().get(id) {
        HeapData::Array(_) => IteratorKind::Array,
        HeapData::Range(_) => IteratorKind::Range,
        HeapData::Iterator(_) => {
            // Already an iterator: return it as-is (retained).
            vm.heap().inc_ref(id);
            return Ok(Value::Ref(id));
        }
        _ => return Err(vm.runtime_err(ErrorKind::Type, "value is not iterable")),
    };
    let start = match kind {
        IteratorKind::Range => range_bounds(vm, id)?.start,
        IteratorKind::Array => 0,
    };
    vm.heap_mut().inc_ref(id);
    let iter_id =
        vm.heap_mut().allocate(HeapData::Iterator(IteratorData { kind, cursor: start, cursor_big: None, exhausted: false, source: id }));
    Ok(Value::Ref(iter_id))
}

// ---- hasNext() / next() / isEmpty() / toArray() -----------------------

fn iterator_id(vm: &VM, args: &[Value]) -> RunResult<HeapId> {
    match &args[0] {
        Value::Ref(id) if matches!(vm.heap().get(*id), HeapData::Iterator(_)) => Ok(*id),
        _ => Err(vm.runtime_err(ErrorKind::Type, "value is not an iterator")),
    }
}

fn iterator_has_next(vm: &VM, iter_id: HeapId) -> RunResult<bool> {
    let (kind, cursor, exhausted, source) = match vm.heap().get(iter_id) {
        HeapData::Iterator(it) => (it.kind, it.cursor, it.exhausted, it.source),
        _ => unreachable!(),
    };
    if exhausted {
        return Ok(false);
    }
    match kind {
        IteratorKind::Array => {
            let len = match vm.heap().get(source) {
                HeapData::Array(items) => items.len() as i64,
                _ => unreachable!("array iterator source must be an Array"),
            };
            Ok(cursor < len)
        }
        IteratorKind::Range => {
            let bounds = range_bounds(vm, source)?;
            Ok(if bounds.step > 0 {
                if bounds.exclusive { cursor < bounds.end } else { cursor <= bounds.end }
            } else if bounds.exclusive {
                cursor > bounds.end
            } else {
                cursor >= bounds.end
            })
        }
    }
}

fn native_has_next(vm: &mut VM, args: &[Value]) -> RunResult<Value> {
    let id = iterator_id(vm, args)?;
    Ok(Value::Boolean(iterator_has_next(vm, id)?))
}

fn native_is_empty(vm: &mut VM, args: &[Value]) -> RunResult<Value> {
    let id = iterator_id(vm, args)?;
    Ok(Value::Boolean(!iterator_has_next(vm, id)?))
}

fn native_next(vm: &mut VM, args: &[Value]) -> RunResult<Value> {
    let iter_id = iterator_id(vm, args)?;
    advance_iterator(vm, iter_id)
}

/// Yields the iterator's current element and advances its cursor. Callers
/// must have already confirmed `hasNext`.
fn advance_iterator(vm: &mut VM, iter_id: HeapId) -> RunResult<Value> {
    if !iterator_has_next(vm, iter_id)? {
        return Err(vm.runtime_err(ErrorKind::Value, "iterator is exhausted"));
    }
    let (kind, cursor, source) = match vm.heap().get(iter_id) {
        HeapData::Iterator(it) => (it.kind, it.cursor, it.source),
        _ => unreachable!(),
    };
    let (value, next_cursor) = match kind {
        IteratorKind::Array => {
            let value = match vm.heap().get(source) {
                HeapData::Array(items) => items[cursor as usize].clone_retain(vm.heap()),
                _ => unreachable!(),
            };
            (value, cursor + 1)
        }
        IteratorKind::Range => {
            let step = range_bounds(vm, source)?.step;
            (int_to_value(vm, cursor), cursor + step)
        }
    };
    match vm.heap_mut().get_mut(iter_id) {
        HeapData::Iterator(it) => it.cursor = next_cursor,
        _ => unreachable!(),
    }
    if !iterator_has_next(vm, iter_id)? {
        if let HeapData::Iterator(it) = vm.heap_mut().get_mut(iter_id) {
            it.exhausted = true;
        }
    }
    Ok(value)
}

fn native_to_array(vm: &mut VM, args: &[Value]) -> RunResult<Value> {
    let Value::Ref(id) = &args[0] else {
        return Err(vm.runtime_err(ErrorKind::Type, "toArray() requires an iterable receiver"));
    };
    let id = *id;
    if matches!(vm.heap().get(id), HeapData::Array(_)) {
        let items = match vm.heap().get(id) {
            HeapData::Array(items) => items.iter().map(|v| v.clone_retain(vm.heap())).collect(),
            _ => unreachable!(),
        };
        let out = vm.heap_mut().allocate(HeapData::Array(items));
        return Ok(Value::Ref(out));
    }
    let iter_id = if matches!(vm.heap().get(id), HeapData::Iterator(_)) {
        id
    } else {
        match native_iterator(vm, args)? {
            Value::Ref(fresh) => fresh,
            _ => unreachable!(),
        }
    };
    let mut items = Vec::new();
    while iterator_has_next(vm, iter_id)? {
        items.push(advance_iterator(vm, iter_id)?);
    }
    if iter_id != id {
        vm.heap_mut().dec_ref(iter_id);
    }
    let out = vm.heap_mut().allocate(HeapData::Array(items));
    Ok(Value::Ref(out))
}
