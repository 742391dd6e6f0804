#![deny(clippy::all, clippy::pedantic, clippy::perf, clippy::suspicious)] // Catch correctness + perf + suspicious patterns early.
#![deny(clippy::unwrap_used, clippy::expect_used)]
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]

//! Native downcall linking engine.
//!
//! Describe a C function with [`Layout`]s and a [`FunctionDescriptor`], let
//! the [`Linker`] classify it for the host calling convention and bind it to
//! a [`NativeSymbol`], then call the resulting [`Invoker`] with [`Value`]s.
//! Native memory handed to or returned from calls lives in [`Scope`]s.

pub mod abi;
pub mod config;
pub mod descriptor;
pub mod error;
pub mod invoke;
pub mod layout;
pub mod linker;
pub mod logging;
pub mod lookup;
pub mod memory;
pub mod target;
pub mod value;

#[cfg(test)]
mod test_lock;

pub use abi::{
    ArgPlacement, CallingConvention, ClassifyMode, Location, Plan, ReturnPlacement,
    StackPrefix, UnsupportedLayoutError, classify, classify_with,
};
pub use config::{ConfigError, LinkerConfig, LinkerConfigBuilder};
pub use descriptor::{DescriptorError, Fingerprint, FunctionDescriptor};
pub use error::{Error, Result};
pub use invoke::{Invoker, MarshalError, invoke};
pub use layout::{Field, Layout, LayoutError, ScalarKind};
pub use linker::{CacheStats, LinkError, Linker};
pub use lookup::{Library, LibraryError, NativeSymbol, SymbolNotFoundError};
pub use memory::{
    Scope, ScopeId, ScopeKind, Segment, SegmentAllocator, ThrowingAllocator,
    UnexpectedAllocationError, UseAfterCloseError, WrongThreadError,
};
pub use target::Target;
pub use value::{Address, Value};
