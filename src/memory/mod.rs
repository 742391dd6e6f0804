//! Native memory: scopes, the segments they own, and allocators.
//!
//! A [`Scope`] is the sole owner of the memory behind its [`Segment`]s.
//! Closing the scope frees that memory at once; every later access through a
//! segment fails with [`UseAfterCloseError`]. Confined scopes additionally
//! reject use from any thread but their creator.

#![allow(unsafe_code)]

mod scope;
mod segment;

use std::fmt;
use std::thread::ThreadId;

pub use scope::{Scope, ScopeGuard, ScopeId, ScopeKind};
pub use segment::{Primitive, Segment};

use crate::error::{Error, Result};
use crate::layout::Layout;

/// Source of zero-initialised native memory.
///
/// The invocation executor asks its allocator for return storage only when
/// the function returns an aggregate.
pub trait SegmentAllocator {
    /// Allocate `size` bytes aligned to `align`.
    ///
    /// # Errors
    ///
    /// Implementations report closed scopes, bad requests and refusals
    /// through the crate [`Error`].
    fn allocate_bytes(&self, size: usize, align: usize) -> Result<Segment>;

    /// Allocate storage for one value of `layout`.
    ///
    /// # Errors
    ///
    /// As [`SegmentAllocator::allocate_bytes`].
    fn allocate(&self, layout: &Layout) -> Result<Segment> {
        self.allocate_bytes(layout.size(), layout.alignment())
    }
}

impl<A: SegmentAllocator + ?Sized> SegmentAllocator for &A {
    fn allocate_bytes(&self, size: usize, align: usize) -> Result<Segment> {
        (**self).allocate_bytes(size, align)
    }
}

impl SegmentAllocator for Scope {
    fn allocate_bytes(&self, size: usize, align: usize) -> Result<Segment> {
        Scope::allocate_bytes(self, size, align)
    }
}

/// Allocator that refuses every request. Passing it to an invocation asserts
/// that the call needs no return storage.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThrowingAllocator;

impl SegmentAllocator for ThrowingAllocator {
    fn allocate_bytes(&self, size: usize, align: usize) -> Result<Segment> {
        tracing::debug!(target: "downcall.scope", size, align, "throwing allocator refused request");
        Err(Error::UnexpectedAllocation(UnexpectedAllocationError {
            size,
            align,
        }))
    }
}

/// Access through a segment whose scope has been closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UseAfterCloseError {
    pub scope: ScopeId,
}

impl fmt::Display for UseAfterCloseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} is already closed", self.scope)
    }
}

impl std::error::Error for UseAfterCloseError {}

/// Use of a confined scope from a thread other than its owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WrongThreadError {
    pub scope: ScopeId,
    pub owner: ThreadId,
    pub current: ThreadId,
}

impl fmt::Display for WrongThreadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} is confined to thread {:?} but was used from {:?}",
            self.scope, self.owner, self.current
        )
    }
}

impl std::error::Error for WrongThreadError {}

/// Close requested while a native call still borrows the scope's memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScopeBusyError {
    pub scope: ScopeId,
    pub in_flight: usize,
}

impl fmt::Display for ScopeBusyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} cannot be closed while {} native call(s) use it",
            self.scope, self.in_flight
        )
    }
}

impl std::error::Error for ScopeBusyError {}

/// Request served by a [`ThrowingAllocator`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnexpectedAllocationError {
    pub size: usize,
    pub align: usize,
}

impl fmt::Display for UnexpectedAllocationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "unexpected allocation of {} bytes (align {})",
            self.size, self.align
        )
    }
}

impl std::error::Error for UnexpectedAllocationError {}

/// A scope could not satisfy an allocation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocationError {
    BadAlignment { align: usize },
    TooLarge { size: usize, limit: usize },
    OutOfMemory { size: usize, align: usize },
}

impl fmt::Display for AllocationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AllocationError::BadAlignment { align } => {
                write!(f, "alignment {align} is not a power of two")
            }
            AllocationError::TooLarge { size, limit } => {
                write!(f, "allocation of {size} bytes exceeds the {limit}-byte limit")
            }
            AllocationError::OutOfMemory { size, align } => {
                write!(f, "out of memory allocating {size} bytes (align {align})")
            }
        }
    }
}

impl std::error::Error for AllocationError {}

/// Segment access outside `0..size`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentBoundsError {
    pub offset: usize,
    pub len: usize,
    pub size: usize,
}

impl fmt::Display for SegmentBoundsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "access of {} bytes at offset {} is outside a {}-byte segment",
            self.len, self.offset, self.size
        )
    }
}

impl std::error::Error for SegmentBoundsError {}
