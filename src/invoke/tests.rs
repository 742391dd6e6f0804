#![cfg(all(any(target_arch = "x86_64", target_arch = "aarch64"), not(windows)))]
#![allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap, clippy::cast_precision_loss, clippy::float_cmp)]

use std::cell::{Cell, RefCell};
use std::sync::atomic::{AtomicBool, Ordering};

use super::*;
use crate::abi::ClassifyMode;
use crate::linker::Linker;
use crate::memory::ThrowingAllocator;

#[repr(C)]
#[derive(Clone, Copy)]
struct Pair {
    x: i32,
    y: i32,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct Triple {
    a: i64,
    b: i64,
    c: i64,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct Mixed {
    d: f64,
    l: i64,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct Quad {
    v: [f32; 4],
}

#[repr(C)]
#[derive(Clone, Copy)]
#[allow(dead_code)]
union IntOrFloat {
    i: i32,
    f: f32,
}

thread_local! {
    static CALLS: Cell<usize> = const { Cell::new(0) };
}

extern "C" fn make_pair(x: i32, y: i32) -> Pair {
    CALLS.with(|calls| calls.set(calls.get() + 1));
    Pair { x, y }
}

extern "C" fn sum_triple(t: Triple) -> i64 {
    t.a + t.b + t.c
}

extern "C" fn scale_triple(t: Triple, by: i64) -> Triple {
    Triple {
        a: t.a * by,
        b: t.b * by,
        c: t.c * by,
    }
}

extern "C" fn swap_mixed(m: Mixed) -> Mixed {
    Mixed {
        d: m.l as f64,
        l: m.d as i64,
    }
}

extern "C" fn reverse_quad(q: Quad) -> Quad {
    Quad {
        v: [q.v[3], q.v[2], q.v[1], q.v[0]],
    }
}

extern "C" fn union_bits(u: IntOrFloat) -> i32 {
    unsafe { u.i }
}

#[repr(C)]
#[derive(Clone, Copy)]
#[allow(dead_code)]
union Number {
    bits: i64,
    real: f64,
}

extern "C" fn negate_number(n: Number) -> Number {
    Number {
        bits: unsafe { n.bits } ^ i64::MIN,
    }
}

extern "C" fn widen(a: i8, b: u16, c: i16) -> i32 {
    i32::from(a) + i32::from(b) + i32::from(c)
}

#[allow(clippy::too_many_arguments)]
extern "C" fn spill(
    a: i64,
    b: i64,
    c: i64,
    d: i64,
    e: i64,
    f: i64,
    g: i64,
    h: i64,
    i: i64,
    x: f64,
    y: f64,
    z: f64,
    w: f64,
    p: f64,
    q: f64,
    r: f64,
    s: f64,
    t: f64,
    u: f32,
) -> f64 {
    (a + b + c + d + e + f + g + h + i) as f64 + x + y + z + w + p + q + r + s + t + f64::from(u)
}

extern "C" fn read_through(ptr: *const i32) -> i32 {
    unsafe { *ptr }
}

extern "C" fn negate(flag: bool) -> bool {
    !flag
}

extern "C" fn nothing() {}

thread_local! {
    static PENDING_CLOSE: RefCell<Option<Scope>> = const { RefCell::new(None) };
}
static CLOSE_REFUSED: AtomicBool = AtomicBool::new(false);

extern "C" fn close_during_call(ptr: *const i32) -> i32 {
    PENDING_CLOSE.with(|pending| {
        if let Some(scope) = pending.borrow().as_ref() {
            let refused = matches!(scope.close(), Err(Error::ScopeBusy(_)));
            CLOSE_REFUSED.store(refused, Ordering::SeqCst);
        }
    });
    unsafe { *ptr }
}

thread_local! {
    static PREFIX_SEEN: Cell<Option<bool>> = const { Cell::new(None) };
}

/// Define `$stacked` taking the standard forced-stack prefix (eight `i64`,
/// eight `f64`) ahead of `$plain`'s parameters. It records whether every
/// prefix slot arrived as zero, then forwards.
macro_rules! stacked {
    ($(fn $stacked:ident => $plain:ident($($arg:ident: $ty:ty),*) $(-> $ret:ty)?;)*) => {
        $(
            #[allow(clippy::too_many_arguments, clippy::float_cmp)]
            extern "C" fn $stacked(
                i0: i64, i1: i64, i2: i64, i3: i64, i4: i64, i5: i64, i6: i64, i7: i64,
                f0: f64, f1: f64, f2: f64, f3: f64, f4: f64, f5: f64, f6: f64, f7: f64,
                $($arg: $ty),*
            ) $(-> $ret)? {
                let ints = [i0, i1, i2, i3, i4, i5, i6, i7];
                let floats = [f0, f1, f2, f3, f4, f5, f6, f7];
                let zero = ints.iter().all(|v| *v == 0) && floats.iter().all(|v| *v == 0.0);
                PREFIX_SEEN.with(|seen| seen.set(Some(zero)));
                $plain($($arg),*)
            }
        )*
    };
}

stacked! {
    fn s_make_pair => make_pair(x: i32, y: i32) -> Pair;
    fn s_widen => widen(a: i8, b: u16, c: i16) -> i32;
    fn s_nothing => nothing();
    fn s_sum_triple => sum_triple(t: Triple) -> i64;
    fn s_scale_triple => scale_triple(t: Triple, by: i64) -> Triple;
    fn s_swap_mixed => swap_mixed(m: Mixed) -> Mixed;
    fn s_reverse_quad => reverse_quad(q: Quad) -> Quad;
    fn s_union_bits => union_bits(u: IntOrFloat) -> i32;
    fn s_negate_number => negate_number(n: Number) -> Number;
    fn s_spill => spill(
        a: i64, b: i64, c: i64, d: i64, e: i64, f: i64, g: i64, h: i64, i: i64,
        x: f64, y: f64, z: f64, w: f64, p: f64, q: f64, r: f64, s: f64, t: f64,
        u: f32
    ) -> f64;
}

/// A fixture with its register-mode entry point and its prefixed twin.
struct Native {
    name: &'static str,
    plain: *const (),
    stacked: *const (),
}

macro_rules! native {
    ($plain:ident, $stacked:ident) => {
        Native {
            name: stringify!($plain),
            plain: $plain as *const (),
            stacked: $stacked as *const (),
        }
    };
}

fn symbol(name: &str, ptr: *const ()) -> NativeSymbol {
    NativeSymbol::from_raw(name, ptr)
}

fn pair_layout() -> Layout {
    Layout::struct_of([("x", Layout::i32()), ("y", Layout::i32())]).expect("pair")
}

fn triple_layout() -> Layout {
    Layout::struct_of([
        ("a", Layout::i64()),
        ("b", Layout::i64()),
        ("c", Layout::i64()),
    ])
    .expect("triple")
}

/// Link `native` in register mode and, through its prefixed twin, in
/// forced-stack mode.
fn link_modes(
    linker: &Linker,
    native: &Native,
    descriptor: &FunctionDescriptor,
) -> Vec<(ClassifyMode, Arc<Invoker>)> {
    let stacked_name = format!("s_{}", native.name);
    [
        (ClassifyMode::Registers, symbol(native.name, native.plain)),
        (ClassifyMode::forced_stack(), symbol(&stacked_name, native.stacked)),
    ]
    .into_iter()
    .map(|(mode, symbol)| {
        let plan = linker.plan(descriptor, &mode).expect("plan");
        let invoker = linker.link(&symbol, descriptor, &plan).expect("link");
        (mode, invoker)
    })
    .collect()
}

/// Whether the last prefixed fixture saw a zero prefix, or `None` in
/// register mode.
fn take_prefix_seen() -> Option<bool> {
    PREFIX_SEEN.with(Cell::take)
}

#[test]
fn pair_return_lands_in_the_callers_scope() {
    let linker = Linker::default();
    let descriptor = FunctionDescriptor::of(pair_layout(), [Layout::i32(), Layout::i32()]);
    for (mode, invoker) in link_modes(&linker, &native!(make_pair, s_make_pair), &descriptor) {
        let scope = Scope::new_shared();
        let result = invoker
            .invoke(&scope, &[Value::I32(3), Value::I32(4)])
            .expect("invoke")
            .and_then(Value::into_segment)
            .expect("segment result");
        assert_eq!(result.scope(), &scope);
        assert_eq!(
            result.read_value(0, &pair_layout()).expect("decode"),
            Value::Fields(vec![Value::I32(3), Value::I32(4)])
        );
        assert_eq!(result.get::<i32>(4).expect("y"), 4);
        let expected_prefix = matches!(mode, ClassifyMode::ForcedStack(_)).then_some(true);
        assert_eq!(take_prefix_seen(), expected_prefix);
    }
}

#[test]
fn scalar_and_void_returns_do_not_allocate() {
    let linker = Linker::default();
    let widen_descriptor =
        FunctionDescriptor::of(Layout::i32(), [Layout::i8(), Layout::u16(), Layout::i16()]);
    let void_descriptor = FunctionDescriptor::of_void(Vec::<Layout>::new());
    let widen_modes = link_modes(&linker, &native!(widen, s_widen), &widen_descriptor);
    let void_modes = link_modes(&linker, &native!(nothing, s_nothing), &void_descriptor);
    for ((_, invoker), (_, void_invoker)) in widen_modes.into_iter().zip(void_modes) {
        let result = invoke(
            &invoker,
            &ThrowingAllocator,
            &[Value::I8(-3), Value::U16(65_535), Value::I16(-2)],
        )
        .expect("invoke");
        assert_eq!(result, Some(Value::I32(65_530)));

        assert_eq!(void_invoker.invoke(&ThrowingAllocator, &[]).expect("invoke"), None);
    }
}

#[test]
fn aggregate_return_with_throwing_allocator_fails_before_the_call() {
    let linker = Linker::default();
    let descriptor = FunctionDescriptor::of(pair_layout(), [Layout::i32(), Layout::i32()]);
    let invoker = linker
        .downcall(&symbol("make_pair", make_pair as *const ()), &descriptor)
        .expect("link");
    let before = CALLS.with(Cell::get);
    let err = invoker
        .invoke(&ThrowingAllocator, &[Value::I32(1), Value::I32(2)])
        .expect_err("allocation");
    assert!(matches!(err, Error::UnexpectedAllocation(_)));
    assert_eq!(err.to_string(), "unexpected allocation of 8 bytes (align 4)");
    assert_eq!(CALLS.with(Cell::get), before);
}

#[test]
fn bad_arguments_never_reach_native_code() {
    let linker = Linker::default();
    let descriptor = FunctionDescriptor::of(pair_layout(), [Layout::i32(), Layout::i32()]);
    let invoker = linker
        .downcall(&symbol("make_pair", make_pair as *const ()), &descriptor)
        .expect("link");
    let scope = Scope::new_shared();
    let before = CALLS.with(Cell::get);

    let err = invoker.invoke(&scope, &[Value::I32(1)]).expect_err("count");
    assert!(matches!(
        err,
        Error::Marshal(MarshalError::ArgumentCount {
            expected: 2,
            found: 1
        })
    ));

    let err = invoker
        .invoke(&scope, &[Value::I32(1), Value::F64(2.0)])
        .expect_err("shape");
    assert_eq!(err.to_string(), "arg1: expected i32, found f64");
    assert_eq!(CALLS.with(Cell::get), before);
    assert_eq!(scope.allocated_bytes(), 0);
}

#[test]
fn large_aggregates_pass_by_value_and_return_in_memory() {
    let linker = Linker::default();
    let sum = FunctionDescriptor::of(Layout::i64(), [triple_layout()]);
    let scale = FunctionDescriptor::of(triple_layout(), [triple_layout(), Layout::i64()]);
    let triple = Value::Fields(vec![Value::I64(1), Value::I64(20), Value::I64(300)]);
    let sum_modes = link_modes(&linker, &native!(sum_triple, s_sum_triple), &sum);
    let scale_modes = link_modes(&linker, &native!(scale_triple, s_scale_triple), &scale);
    for ((_, invoker), (_, scale_invoker)) in sum_modes.into_iter().zip(scale_modes) {
        assert_eq!(
            invoker
                .invoke(&ThrowingAllocator, std::slice::from_ref(&triple))
                .expect("invoke"),
            Some(Value::I64(321))
        );

        let scope = Scope::new_confined();
        let result = scale_invoker
            .invoke(&scope, &[triple.clone(), Value::I64(2)])
            .expect("invoke")
            .and_then(Value::into_segment)
            .expect("segment");
        assert_eq!(
            result.read_value(0, &triple_layout()).expect("decode"),
            Value::Fields(vec![Value::I64(2), Value::I64(40), Value::I64(600)])
        );
        // Only the result; indirect argument copies live in a per-call scope.
        assert_eq!(scope.allocated_bytes(), 24);
    }
}

#[test]
fn segments_pass_as_aggregates_and_pointers() {
    let linker = Linker::default();
    let scope = Scope::new_shared();
    let triple = scope.allocate(&triple_layout()).expect("segment");
    triple
        .write_value(
            0,
            &triple_layout(),
            &Value::Fields(vec![Value::I64(5), Value::I64(6), Value::I64(7)]),
        )
        .expect("write");
    let sum = FunctionDescriptor::of(Layout::i64(), [triple_layout()]);
    let invoker = linker
        .downcall(&symbol("sum_triple", sum_triple as *const ()), &sum)
        .expect("link");
    assert_eq!(
        invoker
            .invoke(&ThrowingAllocator, &[Value::Segment(triple.clone())])
            .expect("invoke"),
        Some(Value::I64(18))
    );

    let cell = scope.allocate(&Layout::i32()).expect("cell");
    cell.set::<i32>(0, 41).expect("set");
    let read = FunctionDescriptor::of(Layout::i32(), [Layout::pointer()]);
    let invoker = linker
        .downcall(&symbol("read_through", read_through as *const ()), &read)
        .expect("link");
    assert_eq!(
        invoker
            .invoke(&ThrowingAllocator, &[Value::Segment(cell)])
            .expect("invoke"),
        Some(Value::I32(41))
    );
}

#[test]
fn mixed_float_and_integer_aggregates() {
    let linker = Linker::default();
    let mixed = Layout::struct_of([("d", Layout::f64()), ("l", Layout::i64())]).expect("mixed");
    let quad = Layout::struct_of([("v", Layout::sequence(Layout::f32(), 4))]).expect("quad");
    let swap = FunctionDescriptor::of(mixed.clone(), [mixed.clone()]);
    let reverse = FunctionDescriptor::of(quad.clone(), [quad.clone()]);
    let swap_modes = link_modes(&linker, &native!(swap_mixed, s_swap_mixed), &swap);
    let reverse_modes = link_modes(&linker, &native!(reverse_quad, s_reverse_quad), &reverse);
    for ((_, invoker), (_, reverse_invoker)) in swap_modes.into_iter().zip(reverse_modes) {
        let scope = Scope::new_shared();
        let result = invoker
            .invoke(&scope, &[Value::Fields(vec![Value::F64(2.5), Value::I64(9)])])
            .expect("invoke")
            .and_then(Value::into_segment)
            .expect("segment");
        assert_eq!(
            result.read_value(0, &mixed).expect("decode"),
            Value::Fields(vec![Value::F64(9.0), Value::I64(2)])
        );

        let input = Value::Fields(vec![Value::Fields(vec![
            Value::F32(1.0),
            Value::F32(2.0),
            Value::F32(3.0),
            Value::F32(4.0),
        ])]);
        let result = reverse_invoker
            .invoke(&scope, &[input])
            .expect("invoke")
            .and_then(Value::into_segment)
            .expect("segment");
        assert_eq!(
            result.read_value(0, &quad).expect("decode"),
            Value::Fields(vec![Value::Fields(vec![
                Value::F32(4.0),
                Value::F32(3.0),
                Value::F32(2.0),
                Value::F32(1.0),
            ])])
        );
    }
}

#[test]
fn unions_pass_their_selected_member() {
    let linker = Linker::default();
    let layout = Layout::union_of([("i", Layout::i32()), ("f", Layout::f32())]).expect("union");
    let descriptor = FunctionDescriptor::of(Layout::i32(), [layout]);
    for (_, invoker) in link_modes(&linker, &native!(union_bits, s_union_bits), &descriptor) {
        let result = invoker
            .invoke(&ThrowingAllocator, &[Value::variant(1, Value::F32(1.0))])
            .expect("invoke");
        assert_eq!(result, Some(Value::I32(1.0f32.to_bits() as i32)));
    }
}

#[test]
fn union_returns_read_back_from_the_segment() {
    let linker = Linker::default();
    let number = Layout::union_of([("bits", Layout::i64()), ("real", Layout::f64())])
        .expect("number");
    let descriptor = FunctionDescriptor::of(number.clone(), [number.clone()]);
    for (mode, invoker) in link_modes(&linker, &native!(negate_number, s_negate_number), &descriptor) {
        let scope = Scope::new_shared();
        let result = invoker
            .invoke(&scope, &[Value::variant(1, Value::F64(2.5))])
            .expect("invoke")
            .and_then(Value::into_segment)
            .expect("segment");
        assert_eq!(result.scope(), &scope);
        assert_eq!(result.get::<f64>(0).expect("real"), -2.5, "{mode:?}");
        assert_eq!(
            result.read_value(0, &number).expect("decode"),
            Value::variant(0, Value::I64((-2.5f64).to_bits() as i64))
        );
    }
}

#[test]
fn exhausted_registers_spill_to_the_stack() {
    let linker = Linker::default();
    let mut params = vec![Layout::i64(); 9];
    params.extend(vec![Layout::f64(); 9]);
    params.push(Layout::f32());
    let descriptor = FunctionDescriptor::of(Layout::f64(), params);
    let mut args: Vec<Value> = (1..=9).map(Value::I64).collect();
    args.extend((1..=9i32).map(|n| Value::F64(f64::from(n) / 2.0)));
    args.push(Value::F32(0.25));
    for (_, invoker) in link_modes(&linker, &native!(spill, s_spill), &descriptor) {
        let result = invoker.invoke(&ThrowingAllocator, &args).expect("invoke");
        assert_eq!(result, Some(Value::F64(45.0 + 22.5 + 0.25)));
    }
}

#[test]
fn bool_round_trips() {
    let linker = Linker::default();
    let descriptor = FunctionDescriptor::of(Layout::bool(), [Layout::bool()]);
    let invoker = linker
        .downcall(&symbol("negate", negate as *const ()), &descriptor)
        .expect("link");
    assert_eq!(
        invoker.invoke(&ThrowingAllocator, &[Value::Bool(true)]).expect("invoke"),
        Some(Value::Bool(false))
    );
}

#[test]
fn closed_scopes_are_rejected_before_the_call() {
    let linker = Linker::default();
    let scope = Scope::new_shared();
    let cell = scope.allocate(&Layout::i32()).expect("cell");
    scope.close().expect("close");
    let descriptor = FunctionDescriptor::of(Layout::i32(), [Layout::pointer()]);
    let invoker = linker
        .downcall(&symbol("read_through", read_through as *const ()), &descriptor)
        .expect("link");
    let err = invoker
        .invoke(&ThrowingAllocator, &[Value::Segment(cell)])
        .expect_err("closed");
    assert!(matches!(err, Error::UseAfterClose(_)));
}

#[test]
fn scopes_stay_open_during_the_call() {
    let linker = Linker::default();
    let scope = Scope::new_shared();
    let cell = scope.allocate(&Layout::i32()).expect("cell");
    cell.set::<i32>(0, 7).expect("set");
    PENDING_CLOSE.with(|pending| *pending.borrow_mut() = Some(scope.clone()));

    let descriptor = FunctionDescriptor::of(Layout::i32(), [Layout::pointer()]);
    let invoker = linker
        .downcall(&symbol("close_during_call", close_during_call as *const ()), &descriptor)
        .expect("link");
    let result = invoker
        .invoke(&ThrowingAllocator, &[Value::Segment(cell)])
        .expect("invoke");
    PENDING_CLOSE.with(|pending| pending.borrow_mut().take());

    assert_eq!(result, Some(Value::I32(7)));
    assert!(CLOSE_REFUSED.load(Ordering::SeqCst));
    assert!(scope.is_alive());
    scope.close().expect("close after the call");
}
