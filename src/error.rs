use std::backtrace::Backtrace;
use std::error::Error as StdError;
use std::fmt;

use crate::abi::UnsupportedLayoutError;
use crate::config::ConfigError;
use crate::descriptor::DescriptorError;
use crate::invoke::MarshalError;
use crate::layout::LayoutError;
use crate::linker::LinkError;
use crate::lookup::{LibraryError, SymbolNotFoundError};
use crate::memory::{
    AllocationError, ScopeBusyError, SegmentBoundsError, UnexpectedAllocationError,
    UseAfterCloseError, WrongThreadError,
};
use crate::target::TargetError;

/// Unified error type of the downcall engine.
#[derive(Debug)]
pub enum Error {
    Layout(LayoutError),
    Descriptor(DescriptorError),
    Unsupported(UnsupportedLayoutError),
    Target(TargetError),
    SymbolNotFound(SymbolNotFoundError),
    Library(LibraryError),
    Link(LinkError),
    Marshal(MarshalError),
    UseAfterClose(UseAfterCloseError),
    WrongThread(WrongThreadError),
    ScopeBusy(ScopeBusyError),
    UnexpectedAllocation(UnexpectedAllocationError),
    Allocation(AllocationError),
    Bounds(SegmentBoundsError),
    Config(ConfigError),
    Internal {
        message: String,
        backtrace: Option<Backtrace>,
    },
}

/// Convenience result alias used across the crate.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Construct an internal-invariant error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
            backtrace: capture_backtrace(),
        }
    }

    /// Return the captured backtrace, if any.
    pub fn backtrace(&self) -> Option<&Backtrace> {
        match self {
            Error::Internal { backtrace, .. } => backtrace.as_ref(),
            _ => None,
        }
    }

    /// Whether the error reports a scope lifetime or ownership violation.
    #[must_use]
    pub fn is_scope_error(&self) -> bool {
        matches!(
            self,
            Error::UseAfterClose(_) | Error::WrongThread(_) | Error::ScopeBusy(_)
        )
    }
}

fn capture_backtrace() -> Option<Backtrace> {
    if cfg!(debug_assertions) {
        Some(Backtrace::force_capture())
    } else {
        None
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Layout(err) => write!(f, "{err}"),
            Error::Descriptor(err) => write!(f, "{err}"),
            Error::Unsupported(err) => write!(f, "{err}"),
            Error::Target(err) => write!(f, "{err}"),
            Error::SymbolNotFound(err) => write!(f, "{err}"),
            Error::Library(err) => write!(f, "{err}"),
            Error::Link(err) => write!(f, "{err}"),
            Error::Marshal(err) => write!(f, "{err}"),
            Error::UseAfterClose(err) => write!(f, "{err}"),
            Error::WrongThread(err) => write!(f, "{err}"),
            Error::ScopeBusy(err) => write!(f, "{err}"),
            Error::UnexpectedAllocation(err) => write!(f, "{err}"),
            Error::Allocation(err) => write!(f, "{err}"),
            Error::Bounds(err) => write!(f, "{err}"),
            Error::Config(err) => write!(f, "{err}"),
            Error::Internal { message, .. } => write!(f, "internal error: {message}"),
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Error::Layout(err) => Some(err),
            Error::Descriptor(err) => Some(err),
            Error::Unsupported(err) => Some(err),
            Error::Target(err) => Some(err),
            Error::SymbolNotFound(err) => Some(err),
            Error::Library(err) => Some(err),
            Error::Link(err) => Some(err),
            Error::Marshal(err) => Some(err),
            Error::UseAfterClose(err) => Some(err),
            Error::WrongThread(err) => Some(err),
            Error::ScopeBusy(err) => Some(err),
            Error::UnexpectedAllocation(err) => Some(err),
            Error::Allocation(err) => Some(err),
            Error::Bounds(err) => Some(err),
            Error::Config(err) => Some(err),
            Error::Internal { .. } => None,
        }
    }
}

macro_rules! error_from {
    ($($source:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$source> for Error {
                fn from(error: $source) -> Self {
                    Error::$variant(error)
                }
            }
        )*
    };
}

error_from! {
    LayoutError => Layout,
    DescriptorError => Descriptor,
    UnsupportedLayoutError => Unsupported,
    TargetError => Target,
    SymbolNotFoundError => SymbolNotFound,
    LibraryError => Library,
    LinkError => Link,
    MarshalError => Marshal,
    UseAfterCloseError => UseAfterClose,
    WrongThreadError => WrongThread,
    ScopeBusyError => ScopeBusy,
    UnexpectedAllocationError => UnexpectedAllocation,
    AllocationError => Allocation,
    SegmentBoundsError => Bounds,
    ConfigError => Config,
}
