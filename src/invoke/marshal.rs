//! Conversion between [`Value`]s and the native byte representation of a
//! [`Layout`].
//!
//! 128-bit scalars have no host value of their own; they are carried as
//! `Value::Fields([U64(low), U64(high)])`.

use std::fmt;

use crate::error::Result;
use crate::layout::{Layout, ScalarKind};
use crate::memory::Segment;
use crate::value::{Address, Value};

/// Location of a value inside an argument list, rendered only on error.
#[derive(Debug, Clone, Copy)]
pub(crate) enum ValuePath<'a> {
    Root(&'static str),
    Arg(usize),
    Field(&'a ValuePath<'a>, &'a str),
    Index(&'a ValuePath<'a>, usize),
}

impl fmt::Display for ValuePath<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValuePath::Root(name) => f.write_str(name),
            ValuePath::Arg(index) => write!(f, "arg{index}"),
            ValuePath::Field(parent, name) => write!(f, "{parent}.{name}"),
            ValuePath::Index(parent, index) => write!(f, "{parent}[{index}]"),
        }
    }
}

/// An argument list or value does not match the descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MarshalError {
    ArgumentCount {
        expected: usize,
        found: usize,
    },
    Shape {
        path: String,
        expected: String,
        found: &'static str,
    },
    FieldCount {
        path: String,
        expected: usize,
        found: usize,
    },
    VariantIndex {
        path: String,
        index: usize,
        fields: usize,
    },
    SegmentTooSmall {
        path: String,
        size: usize,
        required: usize,
    },
}

impl MarshalError {
    fn shape(path: &ValuePath<'_>, expected: impl fmt::Display, found: &Value) -> Self {
        MarshalError::Shape {
            path: path.to_string(),
            expected: expected.to_string(),
            found: found.kind_name(),
        }
    }
}

impl fmt::Display for MarshalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MarshalError::ArgumentCount { expected, found } => {
                write!(f, "expected {expected} argument(s), found {found}")
            }
            MarshalError::Shape {
                path,
                expected,
                found,
            } => write!(f, "{path}: expected {expected}, found {found}"),
            MarshalError::FieldCount {
                path,
                expected,
                found,
            } => write!(f, "{path}: expected {expected} field value(s), found {found}"),
            MarshalError::VariantIndex { path, index, fields } => write!(
                f,
                "{path}: variant index {index} is out of range for a union of {fields} field(s)"
            ),
            MarshalError::SegmentTooSmall {
                path,
                size,
                required,
            } => write!(
                f,
                "{path}: segment of {size} bytes is smaller than the {required}-byte layout"
            ),
        }
    }
}

impl std::error::Error for MarshalError {}

/// Raw bits of a scalar value at its natural width, zero-extended to 64.
pub(crate) fn scalar_bits(
    kind: ScalarKind,
    value: &Value,
    path: &ValuePath<'_>,
) -> std::result::Result<u64, MarshalError> {
    let bits = match (kind, value) {
        (ScalarKind::Bool, Value::Bool(flag)) => u64::from(*flag),
        (ScalarKind::I8, Value::I8(int)) => u64::from(*int as u8),
        (ScalarKind::U8, Value::U8(int)) => u64::from(*int),
        (ScalarKind::I16, Value::I16(int)) => u64::from(*int as u16),
        (ScalarKind::U16, Value::U16(int)) => u64::from(*int),
        (ScalarKind::I32, Value::I32(int)) => u64::from(*int as u32),
        (ScalarKind::U32, Value::U32(int)) => u64::from(*int),
        (ScalarKind::I64, Value::I64(int)) => *int as u64,
        (ScalarKind::U64, Value::U64(int)) => *int,
        (ScalarKind::F32, Value::F32(float)) => u64::from(float.to_bits()),
        (ScalarKind::F64, Value::F64(float)) => float.to_bits(),
        (ScalarKind::Pointer, Value::Pointer(address)) => address.as_usize() as u64,
        (ScalarKind::Pointer, Value::Segment(segment)) => segment.address().as_usize() as u64,
        _ => return Err(MarshalError::shape(path, kind, value)),
    };
    Ok(bits)
}

/// Sign- or zero-extend an integer narrower than 32 bits to 32 bits, as C
/// callers do for register and stack arguments.
pub(crate) fn widen_small(kind: ScalarKind, bits: u64) -> u64 {
    match kind {
        ScalarKind::I8 => u64::from(i32::from(bits as u8 as i8) as u32),
        ScalarKind::I16 => u64::from(i32::from(bits as u16 as i16) as u32),
        _ => bits,
    }
}

/// Write `value` into `out` (exactly `layout.size()` bytes) in native form.
pub(crate) fn encode(
    layout: &Layout,
    value: &Value,
    out: &mut [u8],
    path: &ValuePath<'_>,
) -> Result<()> {
    match layout {
        Layout::Scalar(scalar) => encode_scalar(scalar.kind(), value, out, path),
        Layout::Group(group) => match value {
            Value::Segment(segment) => copy_segment(segment, out, path),
            Value::Fields(values) if !group.is_union() => {
                if values.len() != group.fields().len() {
                    return Err(MarshalError::FieldCount {
                        path: path.to_string(),
                        expected: group.fields().len(),
                        found: values.len(),
                    }
                    .into());
                }
                for (field, value) in group.fields().iter().zip(values) {
                    let start = field.offset();
                    let end = start + field.layout().size();
                    encode(
                        field.layout(),
                        value,
                        &mut out[start..end],
                        &ValuePath::Field(path, field.name()),
                    )?;
                }
                Ok(())
            }
            Value::Variant { index, value } if group.is_union() => {
                let field = group.fields().get(*index).ok_or_else(|| MarshalError::VariantIndex {
                    path: path.to_string(),
                    index: *index,
                    fields: group.fields().len(),
                })?;
                out.fill(0);
                encode(
                    field.layout(),
                    value,
                    &mut out[..field.layout().size()],
                    &ValuePath::Field(path, field.name()),
                )
            }
            other => Err(MarshalError::shape(path, layout, other).into()),
        },
        Layout::Sequence(sequence) => match value {
            Value::Segment(segment) => copy_segment(segment, out, path),
            Value::Fields(values) => {
                if values.len() != sequence.count() {
                    return Err(MarshalError::FieldCount {
                        path: path.to_string(),
                        expected: sequence.count(),
                        found: values.len(),
                    }
                    .into());
                }
                let stride = sequence.element().size();
                for (index, value) in values.iter().enumerate() {
                    encode(
                        sequence.element(),
                        value,
                        &mut out[index * stride..(index + 1) * stride],
                        &ValuePath::Index(path, index),
                    )?;
                }
                Ok(())
            }
            other => Err(MarshalError::shape(path, layout, other).into()),
        },
    }
}

fn encode_scalar(
    kind: ScalarKind,
    value: &Value,
    out: &mut [u8],
    path: &ValuePath<'_>,
) -> Result<()> {
    if matches!(kind, ScalarKind::I128 | ScalarKind::F128) {
        let halves = match value {
            Value::Fields(halves) => halves.as_slice(),
            other => return Err(MarshalError::shape(path, kind, other).into()),
        };
        let [Value::U64(low), Value::U64(high)] = halves else {
            return Err(MarshalError::FieldCount {
                path: path.to_string(),
                expected: 2,
                found: halves.len(),
            }
            .into());
        };
        out[..8].copy_from_slice(&low.to_le_bytes());
        out[8..16].copy_from_slice(&high.to_le_bytes());
        return Ok(());
    }
    let bits = scalar_bits(kind, value, path)?;
    let size = kind.natural_size();
    out[..size].copy_from_slice(&bits.to_le_bytes()[..size]);
    Ok(())
}

fn copy_segment(segment: &Segment, out: &mut [u8], path: &ValuePath<'_>) -> Result<()> {
    if segment.size() < out.len() {
        return Err(MarshalError::SegmentTooSmall {
            path: path.to_string(),
            size: segment.size(),
            required: out.len(),
        }
        .into());
    }
    segment.read_bytes(0, out)
}

/// Decode `bytes` (at least `layout.size()` long) as a value of `layout`.
pub(crate) fn decode(layout: &Layout, bytes: &[u8]) -> Value {
    match layout {
        Layout::Scalar(scalar) => decode_scalar(scalar.kind(), bytes),
        Layout::Group(group) if group.is_union() => match group.fields().first() {
            Some(field) => Value::variant(0, decode(field.layout(), bytes)),
            None => Value::Fields(Vec::new()),
        },
        Layout::Group(group) => Value::Fields(
            group
                .fields()
                .iter()
                .map(|field| decode(field.layout(), &bytes[field.offset()..]))
                .collect(),
        ),
        Layout::Sequence(sequence) => {
            let stride = sequence.element().size();
            Value::Fields(
                (0..sequence.count())
                    .map(|index| decode(sequence.element(), &bytes[index * stride..]))
                    .collect(),
            )
        }
    }
}

pub(crate) fn decode_scalar(kind: ScalarKind, bytes: &[u8]) -> Value {
    let mut raw = [0u8; 16];
    let size = kind.natural_size();
    raw[..size].copy_from_slice(&bytes[..size]);
    let mut low = [0u8; 8];
    low.copy_from_slice(&raw[..8]);
    let bits = u64::from_le_bytes(low);
    match kind {
        ScalarKind::Bool => Value::Bool(bits & 0xff != 0),
        ScalarKind::I8 => Value::I8(bits as u8 as i8),
        ScalarKind::U8 => Value::U8(bits as u8),
        ScalarKind::I16 => Value::I16(bits as u16 as i16),
        ScalarKind::U16 => Value::U16(bits as u16),
        ScalarKind::I32 => Value::I32(bits as u32 as i32),
        ScalarKind::U32 => Value::U32(bits as u32),
        ScalarKind::I64 => Value::I64(bits as i64),
        ScalarKind::U64 => Value::U64(bits),
        ScalarKind::F32 => Value::F32(f32::from_bits(bits as u32)),
        ScalarKind::F64 => Value::F64(f64::from_bits(bits)),
        ScalarKind::Pointer => Value::Pointer(Address::new(bits as usize)),
        ScalarKind::I128 | ScalarKind::F128 => {
            let mut high = [0u8; 8];
            high.copy_from_slice(&raw[8..16]);
            Value::Fields(vec![Value::U64(bits), Value::U64(u64::from_le_bytes(high))])
        }
    }
}
