//! Function descriptors: the parameter and return layouts of a native function.

use std::fmt;

use serde::Serialize;

use crate::layout::{Layout, LayoutError};

/// Parameter layouts plus an optional return layout. Structural equality is
/// the identity used by the plan and invoker caches.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct FunctionDescriptor {
    params: Vec<Layout>,
    ret: Option<Layout>,
}

impl FunctionDescriptor {
    #[must_use]
    pub fn of(ret: Layout, params: impl IntoIterator<Item = Layout>) -> Self {
        Self {
            params: params.into_iter().collect(),
            ret: Some(ret),
        }
    }

    #[must_use]
    pub fn of_void(params: impl IntoIterator<Item = Layout>) -> Self {
        Self {
            params: params.into_iter().collect(),
            ret: None,
        }
    }

    #[must_use]
    pub fn params(&self) -> &[Layout] {
        &self.params
    }

    #[must_use]
    pub fn return_layout(&self) -> Option<&Layout> {
        self.ret.as_ref()
    }

    #[must_use]
    pub fn is_void(&self) -> bool {
        self.ret.is_none()
    }

    /// Whether calling this function produces an aggregate that must be
    /// materialised in caller-supplied memory.
    #[must_use]
    pub fn returns_aggregate(&self) -> bool {
        self.ret.as_ref().is_some_and(Layout::is_aggregate)
    }

    /// New descriptor with `prefix` inserted before the existing parameters.
    #[must_use]
    pub fn with_prefix(&self, prefix: &[Layout]) -> Self {
        let mut params = prefix.to_vec();
        params.extend(self.params.iter().cloned());
        Self {
            params,
            ret: self.ret.clone(),
        }
    }

    /// Validate every parameter and the return layout.
    ///
    /// # Errors
    ///
    /// Returns [`DescriptorError`] naming the first invalid slot.
    pub fn validate(&self) -> Result<(), DescriptorError> {
        for (index, layout) in self.params.iter().enumerate() {
            layout.validate().map_err(|source| DescriptorError {
                slot: DescriptorSlot::Param(index),
                source,
            })?;
        }
        if let Some(ret) = &self.ret {
            ret.validate().map_err(|source| DescriptorError {
                slot: DescriptorSlot::Return,
                source,
            })?;
        }
        Ok(())
    }

    /// Stable digest of the descriptor's structure, used to tie a plan to the
    /// descriptor it was derived from.
    #[must_use]
    pub fn fingerprint(&self) -> Fingerprint {
        let mut hasher = blake3::Hasher::new();
        hasher.update(b"downcall.descriptor.v1");
        hasher.update(&(self.params.len() as u64).to_le_bytes());
        for param in &self.params {
            hash_layout(&mut hasher, param);
        }
        match &self.ret {
            Some(ret) => {
                hasher.update(&[1]);
                hash_layout(&mut hasher, ret);
            }
            None => {
                hasher.update(&[0]);
            }
        }
        Fingerprint(*hasher.finalize().as_bytes())
    }
}

fn hash_layout(hasher: &mut blake3::Hasher, layout: &Layout) {
    match layout {
        Layout::Scalar(scalar) => {
            hasher.update(b"s");
            hasher.update(scalar.kind().as_str().as_bytes());
            hasher.update(&(scalar.size() as u64).to_le_bytes());
            hasher.update(&(scalar.align() as u64).to_le_bytes());
        }
        Layout::Group(group) => {
            hasher.update(if group.is_union() { b"u" } else { b"g" });
            hasher.update(&[u8::from(group.is_packed())]);
            hasher.update(&(group.size() as u64).to_le_bytes());
            hasher.update(&(group.align() as u64).to_le_bytes());
            hasher.update(&(group.fields().len() as u64).to_le_bytes());
            for field in group.fields() {
                hasher.update(&(field.name().len() as u64).to_le_bytes());
                hasher.update(field.name().as_bytes());
                hasher.update(&(field.offset() as u64).to_le_bytes());
                hash_layout(hasher, field.layout());
            }
        }
        Layout::Sequence(sequence) => {
            hasher.update(b"q");
            hasher.update(&(sequence.count() as u64).to_le_bytes());
            hash_layout(hasher, sequence.element());
        }
    }
}

/// blake3 digest of a descriptor.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({self})")
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0[..8] {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl Serialize for Fingerprint {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl fmt::Display for FunctionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("(")?;
        for (index, param) in self.params.iter().enumerate() {
            if index > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{param}")?;
        }
        f.write_str(") -> ")?;
        match &self.ret {
            Some(ret) => write!(f, "{ret}"),
            None => f.write_str("void"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptorSlot {
    Param(usize),
    Return,
}

impl fmt::Display for DescriptorSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DescriptorSlot::Param(index) => write!(f, "parameter {index}"),
            DescriptorSlot::Return => f.write_str("return value"),
        }
    }
}

/// A descriptor slot holds an invalid layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescriptorError {
    pub slot: DescriptorSlot,
    pub source: LayoutError,
}

impl fmt::Display for DescriptorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid layout for {}: {}", self.slot, self.source)
    }
}

impl std::error::Error for DescriptorError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.source)
    }
}
