//! Invocation executor.
//!
//! An [`Invoker`] is the immutable recipe the linker produces for one
//! (symbol, descriptor, plan) triple. Invoking it validates and marshals every
//! argument into a [`trampoline::CallFrame`] before any native code runs, calls
//! the target through the architecture trampoline, and demarshals the result.

#![allow(unsafe_code)]

pub(crate) mod marshal;
pub(crate) mod trampoline;

use std::fmt;
use std::sync::Arc;

pub use marshal::MarshalError;

use crate::abi::{ArgPlacement, Location, Plan, ResultPointer, ReturnPlacement};
use crate::descriptor::FunctionDescriptor;
use crate::error::{Error, Result};
use crate::layout::{Layout, ScalarKind};
use crate::lookup::NativeSymbol;
use crate::memory::{Scope, ScopeGuard, Segment, SegmentAllocator};
use crate::value::Value;
use marshal::ValuePath;
use trampoline::{CallFrame, Trampoline};

/// Compiled call path for one native function.
pub struct Invoker {
    symbol: NativeSymbol,
    descriptor: FunctionDescriptor,
    plan: Arc<Plan>,
    trampoline: Trampoline,
    packed_stack: bool,
    trace: bool,
}

impl Invoker {
    pub(crate) fn new(
        symbol: NativeSymbol,
        descriptor: FunctionDescriptor,
        plan: Arc<Plan>,
        trampoline: Trampoline,
        packed_stack: bool,
        trace: bool,
    ) -> Self {
        Self {
            symbol,
            descriptor,
            plan,
            trampoline,
            packed_stack,
            trace,
        }
    }

    #[must_use]
    pub fn symbol(&self) -> &NativeSymbol {
        &self.symbol
    }

    #[must_use]
    pub fn descriptor(&self) -> &FunctionDescriptor {
        &self.descriptor
    }

    #[must_use]
    pub fn plan(&self) -> &Arc<Plan> {
        &self.plan
    }

    /// Call the native function with `args`.
    ///
    /// `allocator` is consulted only for aggregate returns; the returned
    /// segment belongs to the allocator's scope. Scalar results come back as
    /// the matching [`Value`] variant and void functions yield `None`.
    ///
    /// Aggregates the plan passes indirectly (AAPCS64 values over 16 bytes)
    /// are copied into a confined scope owned by this call and freed when it
    /// returns. They never come from `allocator`, which therefore may be a
    /// [`crate::ThrowingAllocator`] whenever the return is scalar or void.
    ///
    /// # Errors
    ///
    /// [`MarshalError`] when `args` do not match the descriptor, scope errors
    /// for closed or foreign-thread segment arguments, and whatever the
    /// allocator reports. No native code runs when an error is returned.
    pub fn invoke(&self, allocator: &dyn SegmentAllocator, args: &[Value]) -> Result<Option<Value>> {
        let params = self.descriptor.params();
        if args.len() != params.len() {
            return Err(MarshalError::ArgumentCount {
                expected: params.len(),
                found: args.len(),
            }
            .into());
        }

        let mut guards = pin_scopes(args)?;
        let mut frame = FrameBuilder::new(&self.symbol, self.plan.stack_size(), self.packed_stack);
        for (index, ((layout, placement), value)) in
            params.iter().zip(self.plan.params()).zip(args).enumerate()
        {
            frame.marshal(layout, placement, value, &ValuePath::Arg(index))?;
        }

        let storage = match (self.plan.ret(), self.descriptor.return_layout()) {
            (ReturnPlacement::Registers { .. } | ReturnPlacement::InMemory { .. }, Some(layout)) => {
                let segment = allocator.allocate(layout)?;
                if !guards.iter().any(|guard| guard.scope() == segment.scope()) {
                    guards.push(segment.scope().acquire()?);
                }
                Some(segment)
            }
            (ReturnPlacement::Void | ReturnPlacement::Scalar { .. }, _) => None,
            (ret, None) => {
                return Err(Error::internal(format!(
                    "plan return {ret:?} has no return layout"
                )));
            }
        };
        if let (ReturnPlacement::InMemory { pointer, .. }, Some(segment)) =
            (self.plan.ret(), &storage)
        {
            let address = segment.address().as_usize() as u64;
            match pointer {
                ResultPointer::Argument(location) => frame.put_bits(*location, address, 8),
                ResultPointer::Dedicated => frame.frame.indirect_result = address,
            }
        }

        if self.trace {
            tracing::trace!(
                target: "downcall.invoke",
                symbol = %self.symbol,
                args = args.len(),
                stack_size = self.plan.stack_size(),
                return_storage = storage.is_some(),
                "calling native function"
            );
        }
        let frame = frame.call(self.trampoline);

        let result = match self.plan.ret() {
            ReturnPlacement::Void => None,
            ReturnPlacement::Scalar { kind, location } => {
                let bits = return_bits(&frame, *location)?;
                Some(scalar_from_bits(*kind, bits))
            }
            ReturnPlacement::Registers { chunks, size } => {
                let segment = storage.ok_or_else(|| Error::internal("missing return storage"))?;
                let mut bytes = vec![0u8; *size];
                for chunk in chunks {
                    let bits = return_bits(&frame, chunk.location)?;
                    bytes[chunk.offset..chunk.offset + chunk.size]
                        .copy_from_slice(&bits.to_le_bytes()[..chunk.size]);
                }
                segment.copy_from(&bytes)?;
                Some(Value::Segment(segment))
            }
            ReturnPlacement::InMemory { .. } => {
                let segment = storage.ok_or_else(|| Error::internal("missing return storage"))?;
                Some(Value::Segment(segment))
            }
        };
        drop(guards);
        Ok(result)
    }
}

impl fmt::Debug for Invoker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Invoker")
            .field("symbol", &self.symbol)
            .field("descriptor", &self.descriptor.to_string())
            .field("stack_size", &self.plan.stack_size())
            .finish_non_exhaustive()
    }
}

/// Call `invoker` with `args`; see [`Invoker::invoke`].
///
/// # Errors
///
/// As [`Invoker::invoke`].
pub fn invoke(
    invoker: &Invoker,
    allocator: &dyn SegmentAllocator,
    args: &[Value],
) -> Result<Option<Value>> {
    invoker.invoke(allocator, args)
}

/// Keep every scope reachable from `args` open until the call returns.
fn pin_scopes(args: &[Value]) -> Result<Vec<ScopeGuard>> {
    let mut segments: Vec<&Segment> = Vec::new();
    for arg in args {
        arg.for_each_segment(&mut |segment| segments.push(segment));
    }
    let mut guards: Vec<ScopeGuard> = Vec::new();
    for segment in segments {
        if guards.iter().any(|guard| guard.scope() == segment.scope()) {
            continue;
        }
        guards.push(segment.scope().acquire()?);
    }
    Ok(guards)
}

struct FrameBuilder {
    frame: CallFrame,
    stack: Vec<u8>,
    packed_stack: bool,
    /// Per-call scope holding copies of indirectly passed aggregates.
    scratch: Option<Scope>,
}

impl FrameBuilder {
    fn new(symbol: &NativeSymbol, stack_size: usize, packed_stack: bool) -> Self {
        Self {
            frame: CallFrame::new(symbol.address().as_usize()),
            stack: vec![0u8; stack_size],
            packed_stack,
            scratch: None,
        }
    }

    fn put_bits(&mut self, location: Location, bits: u64, width: usize) {
        match location {
            Location::IntReg(index) => self.frame.int_regs[index] = bits,
            Location::FloatReg(index) => self.frame.float_regs[index] = bits,
            Location::Stack(offset) => {
                self.stack[offset..offset + width].copy_from_slice(&bits.to_le_bytes()[..width]);
            }
        }
    }

    fn marshal(
        &mut self,
        layout: &Layout,
        placement: &ArgPlacement,
        value: &Value,
        path: &ValuePath<'_>,
    ) -> Result<()> {
        match placement {
            ArgPlacement::Scalar { kind, location } => {
                let bits = marshal::widen_small(*kind, marshal::scalar_bits(*kind, value, path)?);
                let width = if self.packed_stack {
                    kind.natural_size()
                } else {
                    kind.natural_size().max(4)
                };
                self.put_bits(*location, bits, width);
            }
            ArgPlacement::Registers { chunks } => {
                let mut bytes = vec![0u8; layout.size()];
                marshal::encode(layout, value, &mut bytes, path)?;
                for chunk in chunks {
                    let mut raw = [0u8; 8];
                    raw[..chunk.size].copy_from_slice(&bytes[chunk.offset..chunk.offset + chunk.size]);
                    self.put_bits(chunk.location, u64::from_le_bytes(raw), chunk.size);
                }
            }
            ArgPlacement::Stack { offset, size } => {
                marshal::encode(layout, value, &mut self.stack[*offset..*offset + *size], path)?;
            }
            ArgPlacement::Indirect {
                pointer,
                size,
                align,
            } => {
                let mut bytes = vec![0u8; *size];
                marshal::encode(layout, value, &mut bytes, path)?;
                let scratch = self.scratch.get_or_insert_with(Scope::new_confined);
                let copy = scratch.allocate_bytes(*size, *align)?;
                copy.copy_from(&bytes)?;
                self.put_bits(*pointer, copy.address().as_usize() as u64, 8);
            }
        }
        Ok(())
    }

    fn call(mut self, trampoline: Trampoline) -> CallFrame {
        self.frame.stack = self.stack.as_ptr();
        self.frame.stack_size = self.stack.len();
        unsafe { trampoline(&raw mut self.frame) };
        self.frame
    }
}

fn return_bits(frame: &CallFrame, location: Location) -> Result<u64> {
    let bits = match location {
        Location::IntReg(index) => frame.ret_int.get(index).copied(),
        Location::FloatReg(index) => frame.ret_float.get(index).copied(),
        Location::Stack(_) => None,
    };
    bits.ok_or_else(|| Error::internal(format!("no return register for {location:?}")))
}

fn scalar_from_bits(kind: ScalarKind, bits: u64) -> Value {
    let mut raw = [0u8; 16];
    raw[..8].copy_from_slice(&bits.to_le_bytes());
    marshal::decode_scalar(kind, &raw)
}

#[cfg(test)]
mod tests;
