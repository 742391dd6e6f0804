use std::alloc::{self, Layout as AllocLayout};
use std::fmt;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::thread::{self, ThreadId};

use super::{
    AllocationError, ScopeBusyError, Segment, UseAfterCloseError, WrongThreadError,
};
use crate::config::with_linker_config;
use crate::error::{Error, Result};
use crate::layout::Layout;

static NEXT_SCOPE_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique scope identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ScopeId(u64);

impl ScopeId {
    fn next() -> Self {
        ScopeId(NEXT_SCOPE_ID.fetch_add(1, Ordering::Relaxed))
    }

    #[must_use]
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ScopeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "scope#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeKind {
    /// Usable from any thread.
    Shared,
    /// Usable only from the creating thread.
    Confined,
}

/// One zeroed heap block owned by a scope.
struct Block {
    ptr: NonNull<u8>,
    layout: AllocLayout,
}

// Blocks are plain heap memory; all access is serialised by the scope state.
unsafe impl Send for Block {}
unsafe impl Sync for Block {}

impl Drop for Block {
    fn drop(&mut self) {
        unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

#[derive(Default)]
struct ScopeState {
    closed: bool,
    blocks: Vec<Block>,
    bytes: usize,
}

struct ScopeInner {
    id: ScopeId,
    owner: Option<ThreadId>,
    max_allocation: usize,
    state: RwLock<ScopeState>,
    in_flight: AtomicUsize,
}

/// Ownership domain of native segments.
///
/// Handles are cheap to clone and compare by identity. Memory is released by
/// [`Scope::close`] or, for a scope that was never closed, when the last
/// handle (including those held by segments) is dropped.
#[derive(Clone)]
pub struct Scope {
    inner: Arc<ScopeInner>,
}

impl Scope {
    #[must_use]
    pub fn new_shared() -> Self {
        Self::with_owner(None)
    }

    #[must_use]
    pub fn new_confined() -> Self {
        Self::with_owner(Some(thread::current().id()))
    }

    fn with_owner(owner: Option<ThreadId>) -> Self {
        let scope = Self {
            inner: Arc::new(ScopeInner {
                id: ScopeId::next(),
                owner,
                max_allocation: with_linker_config(|config| config.max_allocation_bytes),
                state: RwLock::new(ScopeState::default()),
                in_flight: AtomicUsize::new(0),
            }),
        };
        tracing::trace!(target: "downcall.scope", scope = %scope.id(), kind = ?scope.kind(), "scope opened");
        scope
    }

    #[must_use]
    pub fn id(&self) -> ScopeId {
        self.inner.id
    }

    #[must_use]
    pub fn kind(&self) -> ScopeKind {
        if self.inner.owner.is_some() {
            ScopeKind::Confined
        } else {
            ScopeKind::Shared
        }
    }

    /// Owning thread of a confined scope.
    #[must_use]
    pub fn owner(&self) -> Option<ThreadId> {
        self.inner.owner
    }

    #[must_use]
    pub fn is_alive(&self) -> bool {
        !self.read_state().closed
    }

    /// Bytes currently allocated from this scope.
    #[must_use]
    pub fn allocated_bytes(&self) -> usize {
        self.read_state().bytes
    }

    /// Allocate zeroed storage for one value of `layout`.
    ///
    /// # Errors
    ///
    /// See [`Scope::allocate_bytes`].
    pub fn allocate(&self, layout: &Layout) -> Result<Segment> {
        self.allocate_bytes(layout.size(), layout.alignment())
    }

    /// Allocate `size` zeroed bytes aligned to `align`.
    ///
    /// # Errors
    ///
    /// [`WrongThreadError`] off the owner thread of a confined scope,
    /// [`UseAfterCloseError`] once closed, and [`AllocationError`] for a
    /// non-power-of-two alignment, a request above the configured limit, or
    /// heap exhaustion.
    pub fn allocate_bytes(&self, size: usize, align: usize) -> Result<Segment> {
        self.check_thread()?;
        if !align.is_power_of_two() {
            return Err(AllocationError::BadAlignment { align }.into());
        }
        if size > self.inner.max_allocation {
            return Err(AllocationError::TooLarge {
                size,
                limit: self.inner.max_allocation,
            }
            .into());
        }
        let layout = AllocLayout::from_size_align(size.max(1), align)
            .map_err(|_| AllocationError::TooLarge {
                size,
                limit: self.inner.max_allocation,
            })?;

        let mut state = self.write_state();
        if state.closed {
            return Err(self.closed_error());
        }
        let raw = unsafe { alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(raw).ok_or(AllocationError::OutOfMemory { size, align })?;
        state.blocks.push(Block { ptr, layout });
        state.bytes += size;
        drop(state);

        tracing::trace!(target: "downcall.scope", scope = %self.id(), size, align, "segment allocated");
        Ok(Segment::new(self.clone(), ptr.as_ptr() as usize, size, align))
    }

    /// Free every segment of this scope. Closing twice is a no-op.
    ///
    /// # Errors
    ///
    /// [`WrongThreadError`] off the owner thread of a confined scope and
    /// [`ScopeBusyError`] while an invocation holds the scope.
    pub fn close(&self) -> Result<()> {
        self.check_thread()?;
        let mut state = self.write_state();
        if state.closed {
            return Ok(());
        }
        let in_flight = self.inner.in_flight.load(Ordering::Acquire);
        if in_flight > 0 {
            return Err(ScopeBusyError {
                scope: self.id(),
                in_flight,
            }
            .into());
        }
        state.closed = true;
        let blocks = std::mem::take(&mut state.blocks);
        let bytes = std::mem::take(&mut state.bytes);
        let count = blocks.len();
        drop(blocks);
        drop(state);
        tracing::debug!(target: "downcall.scope", scope = %self.id(), segments = count, bytes, "scope closed");
        Ok(())
    }

    /// Pin the scope open for the duration of a native call.
    pub(crate) fn acquire(&self) -> Result<ScopeGuard> {
        self.check_thread()?;
        let state = self.read_state();
        if state.closed {
            return Err(self.closed_error());
        }
        self.inner.in_flight.fetch_add(1, Ordering::AcqRel);
        drop(state);
        Ok(ScopeGuard {
            scope: self.clone(),
        })
    }

    /// Run `access` while the scope is guaranteed to stay open.
    pub(crate) fn with_access<R>(&self, access: impl FnOnce() -> R) -> Result<R> {
        self.check_thread()?;
        let state = self.read_state();
        if state.closed {
            return Err(self.closed_error());
        }
        let result = access();
        drop(state);
        Ok(result)
    }

    fn check_thread(&self) -> Result<()> {
        if let Some(owner) = self.inner.owner {
            let current = thread::current().id();
            if owner != current {
                return Err(Error::WrongThread(WrongThreadError {
                    scope: self.id(),
                    owner,
                    current,
                }));
            }
        }
        Ok(())
    }

    fn closed_error(&self) -> Error {
        Error::UseAfterClose(UseAfterCloseError { scope: self.id() })
    }

    fn read_state(&self) -> RwLockReadGuard<'_, ScopeState> {
        self.inner
            .state
            .read()
            .unwrap_or_else(|err| err.into_inner())
    }

    fn write_state(&self) -> RwLockWriteGuard<'_, ScopeState> {
        self.inner
            .state
            .write()
            .unwrap_or_else(|err| err.into_inner())
    }
}

impl PartialEq for Scope {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Scope {}

impl fmt::Debug for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scope")
            .field("id", &self.inner.id)
            .field("kind", &self.kind())
            .finish_non_exhaustive()
    }
}

/// Keeps a scope from closing while held.
#[derive(Debug)]
pub struct ScopeGuard {
    scope: Scope,
}

impl ScopeGuard {
    #[must_use]
    pub fn scope(&self) -> &Scope {
        &self.scope
    }
}

impl Drop for ScopeGuard {
    fn drop(&mut self) {
        self.scope.inner.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}
