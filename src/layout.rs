//! Memory layouts describing the shape of native arguments and return values.
//!
//! A [`Layout`] is a closed tree of scalars, groups (structs and unions) and
//! sequences. Layouts are validated when they are built, so every value of the
//! type is internally consistent; [`Layout::validate`] re-checks a tree that
//! was assembled elsewhere.

use std::fmt;

use serde::Serialize;

/// Size in bytes of a native pointer on every supported platform family.
pub const POINTER_SIZE: usize = 8;

/// Primitive value kinds a scalar layout can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ScalarKind {
    Bool,
    I8,
    U8,
    I16,
    U16,
    I32,
    U32,
    I64,
    U64,
    I128,
    F32,
    F64,
    F128,
    Pointer,
}

impl ScalarKind {
    #[must_use]
    pub fn natural_size(self) -> usize {
        match self {
            ScalarKind::Bool | ScalarKind::I8 | ScalarKind::U8 => 1,
            ScalarKind::I16 | ScalarKind::U16 => 2,
            ScalarKind::I32 | ScalarKind::U32 | ScalarKind::F32 => 4,
            ScalarKind::I64 | ScalarKind::U64 | ScalarKind::F64 => 8,
            ScalarKind::Pointer => POINTER_SIZE,
            ScalarKind::I128 | ScalarKind::F128 => 16,
        }
    }

    #[must_use]
    pub fn is_float(self) -> bool {
        matches!(self, ScalarKind::F32 | ScalarKind::F64 | ScalarKind::F128)
    }

    #[must_use]
    pub fn is_signed(self) -> bool {
        matches!(
            self,
            ScalarKind::I8 | ScalarKind::I16 | ScalarKind::I32 | ScalarKind::I64 | ScalarKind::I128
        )
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ScalarKind::Bool => "bool",
            ScalarKind::I8 => "i8",
            ScalarKind::U8 => "u8",
            ScalarKind::I16 => "i16",
            ScalarKind::U16 => "u16",
            ScalarKind::I32 => "i32",
            ScalarKind::U32 => "u32",
            ScalarKind::I64 => "i64",
            ScalarKind::U64 => "u64",
            ScalarKind::I128 => "i128",
            ScalarKind::F32 => "f32",
            ScalarKind::F64 => "f64",
            ScalarKind::F128 => "f128",
            ScalarKind::Pointer => "ptr",
        }
    }
}

impl fmt::Display for ScalarKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A memory shape. New shapes are a deliberate extension point: consumers
/// match on this enum exhaustively.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(tag = "shape", rename_all = "lowercase")]
pub enum Layout {
    Scalar(ScalarLayout),
    Group(GroupLayout),
    Sequence(SequenceLayout),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct ScalarLayout {
    kind: ScalarKind,
    size: usize,
    align: usize,
}

impl ScalarLayout {
    #[must_use]
    pub fn kind(&self) -> ScalarKind {
        self.kind
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    #[must_use]
    pub fn align(&self) -> usize {
        self.align
    }
}

/// Named member of a group at a fixed byte offset.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct Field {
    name: String,
    layout: Layout,
    offset: usize,
}

impl Field {
    pub fn new(name: impl Into<String>, layout: Layout, offset: usize) -> Self {
        Self {
            name: name.into(),
            layout,
            offset,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    #[must_use]
    pub fn offset(&self) -> usize {
        self.offset
    }

    fn end(&self) -> usize {
        self.offset.saturating_add(self.layout.size())
    }
}

/// Struct or union layout with explicit field offsets.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct GroupLayout {
    name: Option<String>,
    fields: Vec<Field>,
    is_union: bool,
    packed: bool,
    size: usize,
    align: usize,
}

impl GroupLayout {
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    #[must_use]
    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    #[must_use]
    pub fn is_union(&self) -> bool {
        self.is_union
    }

    /// Packed groups may place fields at offsets that ignore field alignment.
    #[must_use]
    pub fn is_packed(&self) -> bool {
        self.packed
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    #[must_use]
    pub fn align(&self) -> usize {
        self.align
    }

    #[must_use]
    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|field| field.name == name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct SequenceLayout {
    element: Box<Layout>,
    count: usize,
}

impl SequenceLayout {
    #[must_use]
    pub fn element(&self) -> &Layout {
        &self.element
    }

    #[must_use]
    pub fn count(&self) -> usize {
        self.count
    }
}

/// Scalar leaf of a layout tree at an absolute byte offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ScalarLeaf {
    pub offset: usize,
    pub scalar: ScalarLayout,
}

impl Layout {
    #[must_use]
    pub const fn scalar(kind: ScalarKind) -> Self {
        let size = match kind {
            ScalarKind::Bool | ScalarKind::I8 | ScalarKind::U8 => 1,
            ScalarKind::I16 | ScalarKind::U16 => 2,
            ScalarKind::I32 | ScalarKind::U32 | ScalarKind::F32 => 4,
            ScalarKind::I64 | ScalarKind::U64 | ScalarKind::F64 | ScalarKind::Pointer => 8,
            ScalarKind::I128 | ScalarKind::F128 => 16,
        };
        Layout::Scalar(ScalarLayout {
            kind,
            size,
            align: size,
        })
    }

    /// Scalar with an explicit size and alignment.
    ///
    /// # Errors
    ///
    /// Returns [`LayoutError`] when `size` differs from the kind's natural
    /// size or `align` is not a power of two dividing `size`.
    pub fn scalar_with(kind: ScalarKind, size: usize, align: usize) -> Result<Self, LayoutError> {
        let layout = Layout::Scalar(ScalarLayout { kind, size, align });
        layout.validate()?;
        Ok(layout)
    }

    #[must_use]
    pub const fn bool() -> Self {
        Self::scalar(ScalarKind::Bool)
    }

    #[must_use]
    pub const fn i8() -> Self {
        Self::scalar(ScalarKind::I8)
    }

    #[must_use]
    pub const fn u8() -> Self {
        Self::scalar(ScalarKind::U8)
    }

    #[must_use]
    pub const fn i16() -> Self {
        Self::scalar(ScalarKind::I16)
    }

    #[must_use]
    pub const fn u16() -> Self {
        Self::scalar(ScalarKind::U16)
    }

    #[must_use]
    pub const fn i32() -> Self {
        Self::scalar(ScalarKind::I32)
    }

    #[must_use]
    pub const fn u32() -> Self {
        Self::scalar(ScalarKind::U32)
    }

    #[must_use]
    pub const fn i64() -> Self {
        Self::scalar(ScalarKind::I64)
    }

    #[must_use]
    pub const fn u64() -> Self {
        Self::scalar(ScalarKind::U64)
    }

    #[must_use]
    pub const fn f32() -> Self {
        Self::scalar(ScalarKind::F32)
    }

    #[must_use]
    pub const fn f64() -> Self {
        Self::scalar(ScalarKind::F64)
    }

    #[must_use]
    pub const fn pointer() -> Self {
        Self::scalar(ScalarKind::Pointer)
    }

    /// Struct with C layout rules: each field at the next offset aligned to
    /// the field, total size rounded up to the largest alignment.
    ///
    /// # Errors
    ///
    /// Returns [`LayoutError::DuplicateField`] when two fields share a name
    /// and [`LayoutError::SizeOverflow`] when the total size does not fit in
    /// a `usize`.
    pub fn struct_of<N: Into<String>>(
        fields: impl IntoIterator<Item = (N, Layout)>,
    ) -> Result<Self, LayoutError> {
        let mut placed = Vec::new();
        let mut offset = 0usize;
        let mut align = 1usize;
        for (name, layout) in fields {
            layout.validate()?;
            offset = checked_align_to(offset, layout.alignment())?;
            align = align.max(layout.alignment());
            let size = layout.size();
            placed.push(Field::new(name, layout, offset));
            offset = offset.checked_add(size).ok_or(LayoutError::SizeOverflow)?;
        }
        Self::group(placed, false, checked_align_to(offset, align)?, align)
    }

    /// Struct whose fields follow each other without padding (`packed(1)`).
    ///
    /// # Errors
    ///
    /// Returns [`LayoutError::DuplicateField`] when two fields share a name.
    pub fn packed_struct_of<N: Into<String>>(
        fields: impl IntoIterator<Item = (N, Layout)>,
    ) -> Result<Self, LayoutError> {
        let mut placed = Vec::new();
        let mut offset = 0usize;
        for (name, layout) in fields {
            layout.validate()?;
            let size = layout.size();
            placed.push(Field::new(name, layout, offset));
            offset = offset.checked_add(size).ok_or(LayoutError::SizeOverflow)?;
        }
        let layout = Layout::Group(GroupLayout {
            name: None,
            fields: placed,
            is_union: false,
            packed: true,
            size: offset,
            align: 1,
        });
        layout.validate()?;
        Ok(layout)
    }

    /// Union with every field at offset zero.
    ///
    /// # Errors
    ///
    /// Returns [`LayoutError::DuplicateField`] when two fields share a name.
    pub fn union_of<N: Into<String>>(
        fields: impl IntoIterator<Item = (N, Layout)>,
    ) -> Result<Self, LayoutError> {
        let mut placed = Vec::new();
        let mut size = 0usize;
        let mut align = 1usize;
        for (name, layout) in fields {
            layout.validate()?;
            size = size.max(layout.size());
            align = align.max(layout.alignment());
            placed.push(Field::new(name, layout, 0));
        }
        Self::group(placed, true, checked_align_to(size, align)?, align)
    }

    /// Group with caller-supplied offsets, size and alignment.
    ///
    /// # Errors
    ///
    /// Returns [`LayoutError`] when the description is inconsistent.
    pub fn group(
        fields: Vec<Field>,
        is_union: bool,
        size: usize,
        align: usize,
    ) -> Result<Self, LayoutError> {
        let layout = Layout::Group(GroupLayout {
            name: None,
            fields,
            is_union,
            packed: false,
            size,
            align,
        });
        layout.validate()?;
        Ok(layout)
    }

    /// Group assembled without validation, e.g. from externally generated
    /// binding metadata. Run [`Layout::validate`] before handing it to the
    /// classifier.
    #[must_use]
    pub fn group_unchecked(fields: Vec<Field>, is_union: bool, size: usize, align: usize) -> Self {
        Layout::Group(GroupLayout {
            name: None,
            fields,
            is_union,
            packed: false,
            size,
            align,
        })
    }

    #[must_use]
    pub fn sequence(element: Layout, count: usize) -> Self {
        Layout::Sequence(SequenceLayout {
            element: Box::new(element),
            count,
        })
    }

    /// Attach a display name to a group; other shapes are returned unchanged.
    #[must_use]
    pub fn named(self, name: impl Into<String>) -> Self {
        match self {
            Layout::Group(mut group) => {
                group.name = Some(name.into());
                Layout::Group(group)
            }
            other => other,
        }
    }

    /// Raise or lower the alignment of a scalar or group.
    ///
    /// Group sizes are rounded up to the new alignment; lowering a group's
    /// alignment below its fields' marks it packed.
    ///
    /// # Errors
    ///
    /// Returns [`LayoutError`] when the result is inconsistent, e.g. a scalar
    /// aligned beyond its size or a sequence (whose alignment is derived).
    pub fn with_align(self, align: usize) -> Result<Self, LayoutError> {
        let layout = match self {
            Layout::Scalar(scalar) => Layout::Scalar(ScalarLayout { align, ..scalar }),
            Layout::Group(mut group) => {
                let natural = group
                    .fields
                    .iter()
                    .map(|field| field.layout.alignment())
                    .max()
                    .unwrap_or(1);
                if align < natural {
                    group.packed = true;
                }
                if align.is_power_of_two() {
                    group.size = align_to(group.size, align);
                }
                group.align = align;
                Layout::Group(group)
            }
            Layout::Sequence(sequence) => {
                return Err(LayoutError::BadAlignment {
                    align,
                    size: Layout::Sequence(sequence).size(),
                });
            }
        };
        layout.validate()?;
        Ok(layout)
    }

    #[must_use]
    pub fn size(&self) -> usize {
        match self {
            Layout::Scalar(scalar) => scalar.size,
            Layout::Group(group) => group.size,
            Layout::Sequence(sequence) => sequence.element.size().saturating_mul(sequence.count),
        }
    }

    #[must_use]
    pub fn alignment(&self) -> usize {
        match self {
            Layout::Scalar(scalar) => scalar.align,
            Layout::Group(group) => group.align,
            Layout::Sequence(sequence) => sequence.element.alignment(),
        }
    }

    #[must_use]
    pub fn is_aggregate(&self) -> bool {
        !matches!(self, Layout::Scalar(_))
    }

    #[must_use]
    pub fn as_scalar(&self) -> Option<&ScalarLayout> {
        match self {
            Layout::Scalar(scalar) => Some(scalar),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_group(&self) -> Option<&GroupLayout> {
        match self {
            Layout::Group(group) => Some(group),
            _ => None,
        }
    }

    /// Byte offset of a top-level group field.
    #[must_use]
    pub fn field_offset(&self, name: &str) -> Option<usize> {
        self.as_group()
            .and_then(|group| group.field(name))
            .map(Field::offset)
    }

    /// Check the internal consistency of this layout and every nested layout.
    ///
    /// # Errors
    ///
    /// Returns the first [`LayoutError`] found in a depth-first walk.
    pub fn validate(&self) -> Result<(), LayoutError> {
        match self {
            Layout::Scalar(scalar) => {
                if scalar.size != scalar.kind.natural_size() {
                    return Err(LayoutError::ScalarSize {
                        kind: scalar.kind,
                        size: scalar.size,
                    });
                }
                check_alignment(scalar.align, scalar.size)
            }
            Layout::Group(group) => validate_group(group),
            Layout::Sequence(sequence) => {
                sequence.element.validate()?;
                sequence
                    .element
                    .size()
                    .checked_mul(sequence.count)
                    .map(drop)
                    .ok_or(LayoutError::SizeOverflow)
            }
        }
    }

    /// Visit every scalar leaf in offset order; sequences are expanded.
    pub(crate) fn scalar_leaves(&self) -> Vec<ScalarLeaf> {
        let mut leaves = Vec::new();
        self.collect_leaves(0, &mut leaves);
        leaves
    }

    fn collect_leaves(&self, base: usize, out: &mut Vec<ScalarLeaf>) {
        match self {
            Layout::Scalar(scalar) => out.push(ScalarLeaf {
                offset: base,
                scalar: *scalar,
            }),
            Layout::Group(group) => {
                for field in &group.fields {
                    field.layout.collect_leaves(base + field.offset, out);
                }
            }
            Layout::Sequence(sequence) => {
                let stride = sequence.element.size();
                for index in 0..sequence.count {
                    sequence.element.collect_leaves(base + index * stride, out);
                }
            }
        }
    }
}

fn check_alignment(align: usize, size: usize) -> Result<(), LayoutError> {
    if !align.is_power_of_two() || size % align != 0 {
        return Err(LayoutError::BadAlignment { align, size });
    }
    Ok(())
}

fn validate_group(group: &GroupLayout) -> Result<(), LayoutError> {
    check_alignment(group.align, group.size)?;
    for (index, field) in group.fields.iter().enumerate() {
        if group.fields[..index]
            .iter()
            .any(|earlier| earlier.name == field.name)
        {
            return Err(LayoutError::DuplicateField(field.name.clone()));
        }
        field.layout.validate()?;
    }

    if group.is_union {
        let mut max_size = 0usize;
        for field in &group.fields {
            if field.offset != 0 {
                return Err(LayoutError::UnionOffset {
                    field: field.name.clone(),
                    offset: field.offset,
                });
            }
            max_size = max_size.max(field.layout.size());
            check_field_alignment(group, field)?;
        }
        let expected = align_to(max_size, group.align);
        if group.size != expected {
            return Err(LayoutError::UnionSize {
                declared: group.size,
                expected,
            });
        }
        return Ok(());
    }

    let mut previous_end = 0usize;
    for field in &group.fields {
        if field.offset < previous_end {
            return Err(LayoutError::Overlap {
                field: field.name.clone(),
                offset: field.offset,
                previous_end,
            });
        }
        check_field_alignment(group, field)?;
        previous_end = field.end();
    }
    if group.size < previous_end {
        return Err(LayoutError::SizeTooSmall {
            declared: group.size,
            required: previous_end,
        });
    }
    Ok(())
}

fn check_field_alignment(group: &GroupLayout, field: &Field) -> Result<(), LayoutError> {
    if group.packed {
        return Ok(());
    }
    let align = field.layout.alignment();
    if field.offset % align != 0 || group.align < align {
        return Err(LayoutError::MisalignedField {
            field: field.name.clone(),
            offset: field.offset,
            align,
        });
    }
    Ok(())
}

fn checked_align_to(value: usize, align: usize) -> Result<usize, LayoutError> {
    if align <= 1 {
        return Ok(value);
    }
    value
        .checked_next_multiple_of(align)
        .ok_or(LayoutError::SizeOverflow)
}

pub(crate) fn align_to(value: usize, align: usize) -> usize {
    if align <= 1 {
        value
    } else {
        value.div_ceil(align) * align
    }
}

impl fmt::Display for Layout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Layout::Scalar(scalar) => {
                write!(f, "{}", scalar.kind)?;
                if scalar.align != scalar.size {
                    write!(f, " align({})", scalar.align)?;
                }
                Ok(())
            }
            Layout::Group(group) => {
                if group.packed {
                    f.write_str("packed ")?;
                }
                f.write_str(if group.is_union { "union" } else { "struct" })?;
                if let Some(name) = &group.name {
                    write!(f, " {name}")?;
                }
                f.write_str(" {")?;
                for (index, field) in group.fields.iter().enumerate() {
                    let sep = if index == 0 { " " } else { ", " };
                    write!(f, "{sep}{}: {}", field.name, field.layout)?;
                }
                if group.fields.is_empty() {
                    f.write_str("}")
                } else {
                    f.write_str(" }")
                }
            }
            Layout::Sequence(sequence) => write!(f, "[{}; {}]", sequence.element, sequence.count),
        }
    }
}

/// Inconsistencies detected while building or validating a layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LayoutError {
    Overlap {
        field: String,
        offset: usize,
        previous_end: usize,
    },
    SizeTooSmall {
        declared: usize,
        required: usize,
    },
    BadAlignment {
        align: usize,
        size: usize,
    },
    MisalignedField {
        field: String,
        offset: usize,
        align: usize,
    },
    UnionOffset {
        field: String,
        offset: usize,
    },
    UnionSize {
        declared: usize,
        expected: usize,
    },
    ScalarSize {
        kind: ScalarKind,
        size: usize,
    },
    DuplicateField(String),
    SizeOverflow,
}

impl fmt::Display for LayoutError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LayoutError::Overlap {
                field,
                offset,
                previous_end,
            } => write!(
                f,
                "field `{field}` at offset {offset} overlaps the previous field ending at {previous_end}"
            ),
            LayoutError::SizeTooSmall { declared, required } => write!(
                f,
                "declared size {declared} is smaller than the {required} bytes its fields require"
            ),
            LayoutError::BadAlignment { align, size } => write!(
                f,
                "alignment {align} must be a power of two dividing the size {size}"
            ),
            LayoutError::MisalignedField {
                field,
                offset,
                align,
            } => write!(
                f,
                "field `{field}` at offset {offset} violates its alignment of {align}"
            ),
            LayoutError::UnionOffset { field, offset } => write!(
                f,
                "union field `{field}` must be at offset 0, found {offset}"
            ),
            LayoutError::UnionSize { declared, expected } => {
                write!(f, "union size {declared} should be {expected}")
            }
            LayoutError::ScalarSize { kind, size } => write!(
                f,
                "scalar `{kind}` must be {} bytes, found {size}",
                kind.natural_size()
            ),
            LayoutError::DuplicateField(name) => write!(f, "duplicate field `{name}`"),
            LayoutError::SizeOverflow => f.write_str("layout size overflows the address space"),
        }
    }
}

impl std::error::Error for LayoutError {}
