use std::fmt;
use std::ptr;

use super::{Scope, SegmentBoundsError};
use crate::error::Result;
use crate::invoke::marshal::{self, ValuePath};
use crate::layout::Layout;
use crate::value::{Address, Value};

mod sealed {
    pub trait Sealed {}
}

/// Plain scalar types that can be read from and written to a segment.
pub trait Primitive: Copy + sealed::Sealed {
    const SIZE: usize;

    #[doc(hidden)]
    fn from_bytes(bytes: &[u8]) -> Self;

    #[doc(hidden)]
    fn write_bytes(self, out: &mut [u8]);
}

macro_rules! primitive {
    ($($ty:ty),* $(,)?) => {
        $(
            impl sealed::Sealed for $ty {}

            impl Primitive for $ty {
                const SIZE: usize = size_of::<$ty>();

                fn from_bytes(bytes: &[u8]) -> Self {
                    let mut raw = [0u8; size_of::<$ty>()];
                    raw.copy_from_slice(&bytes[..size_of::<$ty>()]);
                    <$ty>::from_ne_bytes(raw)
                }

                fn write_bytes(self, out: &mut [u8]) {
                    out[..size_of::<$ty>()].copy_from_slice(&self.to_ne_bytes());
                }
            }
        )*
    };
}

primitive!(i8, u8, i16, u16, i32, u32, i64, u64, f32, f64, usize);

/// A contiguous region of native memory owned by a [`Scope`].
///
/// Every read or write checks that the scope is still open (and, for a
/// confined scope, that the caller is its owner thread) and that the access
/// stays inside the segment.
#[derive(Clone)]
pub struct Segment {
    scope: Scope,
    address: usize,
    size: usize,
    align: usize,
}

impl Segment {
    pub(super) fn new(scope: Scope, address: usize, size: usize, align: usize) -> Self {
        Self {
            scope,
            address,
            size,
            align,
        }
    }

    #[must_use]
    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    /// Base address. Valid for native use only while the scope is open.
    #[must_use]
    pub fn address(&self) -> Address {
        Address::new(self.address)
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    #[must_use]
    pub fn alignment(&self) -> usize {
        self.align
    }

    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.scope.is_alive()
    }

    fn check_bounds(&self, offset: usize, len: usize) -> Result<()> {
        match offset.checked_add(len) {
            Some(end) if end <= self.size => Ok(()),
            _ => Err(SegmentBoundsError {
                offset,
                len,
                size: self.size,
            }
            .into()),
        }
    }

    /// Copy `out.len()` bytes starting at `offset`.
    ///
    /// # Errors
    ///
    /// Fails when the scope is closed or foreign-owned, or the range is out
    /// of bounds.
    pub fn read_bytes(&self, offset: usize, out: &mut [u8]) -> Result<()> {
        self.check_bounds(offset, out.len())?;
        self.scope.with_access(|| unsafe {
            ptr::copy_nonoverlapping(
                (self.address + offset) as *const u8,
                out.as_mut_ptr(),
                out.len(),
            );
        })
    }

    /// Overwrite bytes starting at `offset`.
    ///
    /// # Errors
    ///
    /// As [`Segment::read_bytes`].
    pub fn write_bytes(&self, offset: usize, bytes: &[u8]) -> Result<()> {
        self.check_bounds(offset, bytes.len())?;
        self.scope.with_access(|| unsafe {
            ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                (self.address + offset) as *mut u8,
                bytes.len(),
            );
        })
    }

    /// Whole contents as a byte vector.
    ///
    /// # Errors
    ///
    /// As [`Segment::read_bytes`].
    pub fn to_vec(&self) -> Result<Vec<u8>> {
        let mut bytes = vec![0u8; self.size];
        self.read_bytes(0, &mut bytes)?;
        Ok(bytes)
    }

    /// Overwrite the start of the segment with `bytes`.
    ///
    /// # Errors
    ///
    /// As [`Segment::read_bytes`].
    pub fn copy_from(&self, bytes: &[u8]) -> Result<()> {
        self.write_bytes(0, bytes)
    }

    /// # Errors
    ///
    /// As [`Segment::read_bytes`].
    pub fn get<T: Primitive>(&self, offset: usize) -> Result<T> {
        let mut raw = [0u8; 16];
        self.read_bytes(offset, &mut raw[..T::SIZE])?;
        Ok(T::from_bytes(&raw))
    }

    /// # Errors
    ///
    /// As [`Segment::read_bytes`].
    pub fn set<T: Primitive>(&self, offset: usize, value: T) -> Result<()> {
        let mut raw = [0u8; 16];
        value.write_bytes(&mut raw);
        self.write_bytes(offset, &raw[..T::SIZE])
    }

    /// Decode the value of `layout` stored at `offset`. Structs and
    /// sequences decode to [`Value::Fields`], unions to their first field.
    ///
    /// # Errors
    ///
    /// As [`Segment::read_bytes`].
    pub fn read_value(&self, offset: usize, layout: &Layout) -> Result<Value> {
        let mut bytes = vec![0u8; layout.size()];
        self.read_bytes(offset, &mut bytes)?;
        Ok(marshal::decode(layout, &bytes))
    }

    /// Encode `value` as `layout` at `offset`.
    ///
    /// # Errors
    ///
    /// Returns a marshalling error when `value` does not have the shape of
    /// `layout`, otherwise as [`Segment::read_bytes`].
    pub fn write_value(&self, offset: usize, layout: &Layout, value: &Value) -> Result<()> {
        self.check_bounds(offset, layout.size())?;
        let mut bytes = vec![0u8; layout.size()];
        marshal::encode(layout, value, &mut bytes, &ValuePath::Root("value"))?;
        self.write_bytes(offset, &bytes)
    }
}

impl PartialEq for Segment {
    fn eq(&self, other: &Self) -> bool {
        self.scope == other.scope && self.address == other.address && self.size == other.size
    }
}

impl fmt::Debug for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Segment")
            .field("scope", &self.scope.id())
            .field("address", &self.address())
            .field("size", &self.size)
            .field("align", &self.align)
            .finish()
    }
}
