//! End-to-end source-to-value scenarios, grounded in the teacher's
//! `tests/vm_reuse.rs` style: one `VM` per program, `interpret` the source,
//! assert on the rendered result.

use slate::{ExecOutcome, VM};

fn run(source: &str) -> String {
    let mut vm = VM::create();
    match vm.interpret(source) {
        ExecOutcome::Ok(value) => vm.display_value(&value),
        ExecOutcome::CompileError(errors) => panic!("compile error in {source:?}: {errors:?}"),
        ExecOutcome::RuntimeError(err) => panic!("runtime error in {source:?}: {err}"),
    }
}

#[test]
fn curried_single_arg_closure() {
    assert_eq!(run("def adder(n) = x -> x + n\nadder(5)(10)"), "15");
}

#[test]
fn nested_curried_closures() {
    assert_eq!(run("def outer(x) = (y) -> (z) -> x + y + z\nouter(1)(2)(3)"), "6");
}

#[test]
fn indented_if_body() {
    assert_eq!(run("if true\n    42\n"), "42");
}

#[test]
fn range_with_step_to_array() {
    assert_eq!(run("(1..10 step 2).toArray()"), "[1, 3, 5, 7, 9]");
}

#[test]
fn string_length_is_callable() {
    assert_eq!(run("\"hello\".length()"), "5");
}

#[test]
fn array_length_is_a_plain_property() {
    assert_eq!(run("[1, 2, 3].length"), "3");
}

#[test]
fn division_by_zero_is_a_runtime_error() {
    let mut vm = VM::create();
    match vm.interpret("10 / 0") {
        ExecOutcome::RuntimeError(err) => assert_eq!(err.kind, slate::ErrorKind::DivisionByZero),
        other => panic!("expected a runtime error, got {other:?}"),
    }
}

#[test]
fn bigint_division_and_modulo_stay_exact() {
    assert_eq!(run("99999999999999999999 / 3"), "33333333333333333333");
    assert_eq!(run("99999999999999999999 % 10"), "9");
}

#[test]
fn bigint_floor_division_rounds_toward_negative_infinity() {
    assert_eq!(run("-99999999999999999999 // 10"), "-10000000000000000000");
}

#[test]
fn bigint_division_by_zero_is_a_runtime_error() {
    let mut vm = VM::create();
    match vm.interpret("99999999999999999999 / 0") {
        ExecOutcome::RuntimeError(err) => assert_eq!(err.kind, slate::ErrorKind::DivisionByZero),
        other => panic!("expected a runtime error, got {other:?}"),
    }
}

#[test]
fn val_reassignment_is_a_compile_error() {
    let mut vm = VM::create();
    match vm.interpret("val x = 5\nx = 10\nx\n") {
        ExecOutcome::CompileError(errors) => assert!(!errors.is_empty()),
        other => panic!("expected a compile error, got {other:?}"),
    }
}

#[test]
fn continue_skips_odd_numbers_while_summing_even() {
    let source = "var i = 0\nvar sum = 0\nwhile i < 10 do\n    i += 1\n    if i % 2 != 0 then continue\n    sum += i\nsum\n";
    assert_eq!(run(source), "30");
}

#[test]
fn template_literal_interpolates() {
    assert_eq!(run("`sum=${1+2}`"), "sum=3");
}

#[test]
fn array_iterator_reaches_exhaustion() {
    let source = "var it = iterator([1, 2, 3])\n[it.hasNext(), it.next(), it.next(), it.next(), it.hasNext()]";
    assert_eq!(run(source), "[true, 1, 2, 3, false]");
}

/// §8 quantified invariant: `r.toArray().length == r.length()`.
#[test]
fn range_to_array_length_matches_length() {
    let source = "var r = 1..10 step 2\nr.toArray().length == r.length()";
    assert_eq!(run(source), "true");
}

/// §8 quantified invariant: iteration followed by `toArray` on the same
/// iterator is exhaustive and idempotent after exhaustion.
#[test]
fn exhausted_iterator_to_array_is_empty() {
    let source = "var it = iterator(1..3)\nit.toArray()\nit.toArray()";
    assert_eq!(run(source), "[]");
}

/// §8 quantified invariant: `equals` is symmetric and reflexive, and numeric
/// equality is consistent across tags for equal mathematical values.
#[test]
fn numeric_equality_is_symmetric_across_tags() {
    assert_eq!(run("[1 == 1.0, 1.0 == 1, 1 == 1, \"ab\" == \"ab\"]"), "[true, true, true, true]");
}

/// §8 quantified invariant: mutating a captured variable through one
/// closure is observable through every other closure sharing the cell.
#[test]
fn closures_share_a_mutable_captured_cell() {
    let source = "\
def makeCounter() = () ->
    var counter = 0
    var inc = () -> counter += 1
    var get = () -> counter
    [inc, get]

var pair = makeCounter()()
var inc = pair[0]
var get = pair[1]
inc()
inc()
get()
";
    assert_eq!(run(source), "2");
}
