//! Host-side argument and result values.

use std::fmt;

use crate::memory::Segment;

/// A raw native address.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Address(usize);

impl Address {
    pub const NULL: Address = Address(0);

    #[must_use]
    pub const fn new(raw: usize) -> Self {
        Address(raw)
    }

    #[must_use]
    pub fn from_ptr<T>(ptr: *const T) -> Self {
        Address(ptr as usize)
    }

    #[must_use]
    pub const fn as_usize(self) -> usize {
        self.0
    }

    #[must_use]
    pub fn as_ptr<T>(self) -> *mut T {
        self.0 as *mut T
    }

    #[must_use]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({self})")
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// A value crossing the native boundary.
///
/// Scalars map one-to-one onto [`crate::ScalarKind`]s. Aggregates are given
/// either field by field ([`Value::Fields`] for structs and sequences,
/// [`Value::Variant`] for unions) or as a [`Value::Segment`] whose bytes are
/// copied. A segment passed for a pointer parameter contributes its address.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Bool(bool),
    I8(i8),
    U8(u8),
    I16(i16),
    U16(u16),
    I32(i32),
    U32(u32),
    I64(i64),
    U64(u64),
    F32(f32),
    F64(f64),
    Pointer(Address),
    Segment(Segment),
    Fields(Vec<Value>),
    Variant { index: usize, value: Box<Value> },
}

impl Value {
    #[must_use]
    pub fn variant(index: usize, value: Value) -> Self {
        Value::Variant {
            index,
            value: Box::new(value),
        }
    }

    /// Short name of the variant, used in marshalling diagnostics.
    #[must_use]
    pub fn kind_name(&self) -> &'static str {
        match self {
            Value::Bool(_) => "bool",
            Value::I8(_) => "i8",
            Value::U8(_) => "u8",
            Value::I16(_) => "i16",
            Value::U16(_) => "u16",
            Value::I32(_) => "i32",
            Value::U32(_) => "u32",
            Value::I64(_) => "i64",
            Value::U64(_) => "u64",
            Value::F32(_) => "f32",
            Value::F64(_) => "f64",
            Value::Pointer(_) => "ptr",
            Value::Segment(_) => "segment",
            Value::Fields(_) => "fields",
            Value::Variant { .. } => "variant",
        }
    }

    #[must_use]
    pub fn as_segment(&self) -> Option<&Segment> {
        match self {
            Value::Segment(segment) => Some(segment),
            _ => None,
        }
    }

    #[must_use]
    pub fn into_segment(self) -> Option<Segment> {
        match self {
            Value::Segment(segment) => Some(segment),
            _ => None,
        }
    }

    /// Integer payload widened to `i128`, for any integer or bool variant.
    #[must_use]
    pub fn as_integer(&self) -> Option<i128> {
        match *self {
            Value::Bool(value) => Some(i128::from(value)),
            Value::I8(value) => Some(value.into()),
            Value::U8(value) => Some(value.into()),
            Value::I16(value) => Some(value.into()),
            Value::U16(value) => Some(value.into()),
            Value::I32(value) => Some(value.into()),
            Value::U32(value) => Some(value.into()),
            Value::I64(value) => Some(value.into()),
            Value::U64(value) => Some(value.into()),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_f64(&self) -> Option<f64> {
        match *self {
            Value::F32(value) => Some(value.into()),
            Value::F64(value) => Some(value),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_fields(&self) -> Option<&[Value]> {
        match self {
            Value::Fields(fields) => Some(fields),
            _ => None,
        }
    }

    /// Visit every segment reachable from this value.
    pub(crate) fn for_each_segment<'a>(&'a self, visit: &mut impl FnMut(&'a Segment)) {
        match self {
            Value::Segment(segment) => visit(segment),
            Value::Fields(fields) => {
                for field in fields {
                    field.for_each_segment(visit);
                }
            }
            Value::Variant { value, .. } => value.for_each_segment(visit),
            _ => {}
        }
    }
}

macro_rules! value_from {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for Value {
                fn from(value: $ty) -> Self {
                    Value::$variant(value)
                }
            }
        )*
    };
}

value_from! {
    bool => Bool,
    i8 => I8,
    u8 => U8,
    i16 => I16,
    u16 => U16,
    i32 => I32,
    u32 => U32,
    i64 => I64,
    u64 => U64,
    f32 => F32,
    f64 => F64,
    Address => Pointer,
    Segment => Segment,
}

impl From<Vec<Value>> for Value {
    fn from(fields: Vec<Value>) -> Self {
        Value::Fields(fields)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conversions_pick_matching_variants() {
        assert_eq!(Value::from(3i32), Value::I32(3));
        assert_eq!(Value::from(7u8).as_integer(), Some(7));
        assert_eq!(Value::from(-1i64).as_integer(), Some(-1));
        assert_eq!(Value::from(1.5f32).as_f64(), Some(1.5));
        assert_eq!(Value::from(true).kind_name(), "bool");
        assert_eq!(
            Value::from(vec![Value::I32(1), Value::I32(2)]).as_fields(),
            Some(&[Value::I32(1), Value::I32(2)][..])
        );
    }

    #[test]
    fn address_formats_as_hex() {
        let address = Address::new(0x1000);
        assert_eq!(address.to_string(), "0x1000");
        assert!(!address.is_null());
        assert!(Address::NULL.is_null());
        let local = 5u32;
        assert_eq!(
            Address::from_ptr(&raw const local).as_ptr::<u32>().cast_const(),
            &raw const local
        );
    }
}
