//! C calling-convention classification.
//!
//! [`classify`] maps a [`FunctionDescriptor`] and a [`Target`] to a [`Plan`]
//! describing, for every parameter and the return value, which registers or
//! stack bytes carry it. Classification is pure; the linker caches its output.

mod aapcs64;
mod plan;
mod sysv;

use std::fmt;

use serde::Serialize;

pub use plan::{ArgPlacement, Chunk, Location, Plan, ResultPointer, ReturnPlacement};

use crate::descriptor::{DescriptorSlot, FunctionDescriptor};
use crate::error::Result;
use crate::layout::{Layout, ScalarKind, align_to};
use crate::target::{Target, TargetArch, TargetOs};

/// Calling-convention families the classifier knows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConventionFamily {
    SysV64,
    Aapcs64,
}

/// Per-platform constants of a C calling convention.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallingConvention {
    pub name: &'static str,
    pub family: ConventionFamily,
    pub int_arg_regs: usize,
    pub float_arg_regs: usize,
    pub int_ret_regs: usize,
    pub float_ret_regs: usize,
    /// Largest aggregate that may travel in argument registers.
    pub max_by_value: usize,
    /// Largest aggregate returned in registers.
    pub max_direct_return: usize,
    /// Minimum size and alignment of a stack argument slot.
    pub stack_slot: usize,
    /// Scalars on the stack use their natural size and alignment instead of
    /// whole slots (Apple arm64).
    pub packed_stack_scalars: bool,
}

pub const SYSV_X86_64: CallingConvention = CallingConvention {
    name: "x86_64-sysv",
    family: ConventionFamily::SysV64,
    int_arg_regs: 6,
    float_arg_regs: 8,
    int_ret_regs: 2,
    float_ret_regs: 2,
    max_by_value: 16,
    max_direct_return: 16,
    stack_slot: 8,
    packed_stack_scalars: false,
};

pub const AAPCS64: CallingConvention = CallingConvention {
    name: "aarch64-aapcs64",
    family: ConventionFamily::Aapcs64,
    int_arg_regs: 8,
    float_arg_regs: 8,
    int_ret_regs: 2,
    float_ret_regs: 4,
    max_by_value: 16,
    max_direct_return: 16,
    stack_slot: 8,
    packed_stack_scalars: false,
};

pub const AAPCS64_APPLE: CallingConvention = CallingConvention {
    name: "aarch64-apple",
    packed_stack_scalars: true,
    ..AAPCS64
};

impl CallingConvention {
    /// Convention used by C code on `target`.
    ///
    /// # Errors
    ///
    /// Windows targets use a different convention and are rejected.
    pub fn for_target(target: &Target) -> std::result::Result<&'static Self, UnsupportedLayoutError> {
        match (target.arch(), target.os()) {
            (_, TargetOs::Windows) => Err(UnsupportedLayoutError::Platform {
                triple: target.triple().to_string(),
            }),
            (TargetArch::X86_64, _) => Ok(&SYSV_X86_64),
            (TargetArch::Aarch64, TargetOs::Macos) => Ok(&AAPCS64_APPLE),
            (TargetArch::Aarch64, _) => Ok(&AAPCS64),
        }
    }
}

/// Layouts prepended to a descriptor so that its real parameters are
/// classified after both register pools are exhausted.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StackPrefix {
    layouts: Vec<Layout>,
}

impl StackPrefix {
    #[must_use]
    pub fn new(layouts: Vec<Layout>) -> Self {
        Self { layouts }
    }

    /// Eight `i64` followed by eight `f64`: enough to fill the integer and
    /// float argument registers of every supported convention.
    #[must_use]
    pub fn standard() -> Self {
        let mut layouts = vec![Layout::i64(); 8];
        layouts.extend(std::iter::repeat_n(Layout::f64(), 8));
        Self { layouts }
    }

    #[must_use]
    pub fn layouts(&self) -> &[Layout] {
        &self.layouts
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.layouts.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.layouts.is_empty()
    }
}

/// Classification mode.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub enum ClassifyMode {
    /// Ordinary placement.
    #[default]
    Registers,
    /// Prepend `prefix` to exhaust the register pools; every real parameter
    /// then lands on the stack.
    ///
    /// The prefix is part of the native signature: the callee must declare
    /// the prefix parameters ahead of its own (for [`StackPrefix::standard`],
    /// eight `int64_t` then eight `double`). The executor passes zero in
    /// every prefix slot.
    ForcedStack(StackPrefix),
}

impl ClassifyMode {
    #[must_use]
    pub fn forced_stack() -> Self {
        ClassifyMode::ForcedStack(StackPrefix::standard())
    }

    fn prefix(&self) -> &[Layout] {
        match self {
            ClassifyMode::Registers => &[],
            ClassifyMode::ForcedStack(prefix) => prefix.layouts(),
        }
    }
}

/// Register and stack cursor shared by the convention implementations.
#[derive(Debug, Default)]
pub(crate) struct ArgCursor {
    pub next_int: usize,
    pub next_float: usize,
    pub stack: usize,
}

impl ArgCursor {
    /// Reserve `size` bytes of stack at `align`, returning the offset.
    pub fn reserve_stack(&mut self, size: usize, align: usize) -> usize {
        let offset = align_to(self.stack, align);
        self.stack = offset + size;
        offset
    }
}

/// Classify `descriptor` for `target` in register mode.
///
/// # Errors
///
/// Returns a descriptor error for invalid layouts and
/// [`UnsupportedLayoutError`] for layouts or platforms the classifier cannot
/// place.
pub fn classify(descriptor: &FunctionDescriptor, target: &Target) -> Result<Plan> {
    classify_with(descriptor, target, &ClassifyMode::Registers)
}

/// Classify `descriptor` for `target` in the given mode.
///
/// # Errors
///
/// As [`classify`]; forced-stack mode additionally fails when the prefix does
/// not exhaust both register pools.
pub fn classify_with(
    descriptor: &FunctionDescriptor,
    target: &Target,
    mode: &ClassifyMode,
) -> Result<Plan> {
    descriptor.validate()?;
    let conv = CallingConvention::for_target(target)?;
    let prefix = mode.prefix();
    let full = descriptor.with_prefix(prefix);

    for (index, layout) in full.params().iter().enumerate() {
        check_supported(layout, DescriptorSlot::Param(index))?;
    }
    if let Some(ret) = full.return_layout() {
        check_supported(ret, DescriptorSlot::Return)?;
    }

    let mut cursor = ArgCursor::default();
    let ret = match conv.family {
        ConventionFamily::SysV64 => sysv::classify_return(conv, full.return_layout(), &mut cursor),
        ConventionFamily::Aapcs64 => aapcs64::classify_return(conv, full.return_layout()),
    };

    let mut params = Vec::with_capacity(full.params().len());
    for (index, layout) in full.params().iter().enumerate() {
        if index == prefix.len() && !prefix.is_empty() {
            check_exhausted(conv, &cursor)?;
        }
        let placement = match conv.family {
            ConventionFamily::SysV64 => sysv::classify_arg(conv, layout, &mut cursor),
            ConventionFamily::Aapcs64 => aapcs64::classify_arg(conv, layout, &mut cursor),
        };
        params.push(placement);
    }
    if !prefix.is_empty() && descriptor.params().is_empty() {
        check_exhausted(conv, &cursor)?;
    }

    let plan = Plan {
        target: target.clone(),
        fingerprint: descriptor.fingerprint(),
        prefix_len: prefix.len(),
        params,
        ret,
        stack_size: align_to(cursor.stack, 16),
        int_regs_used: cursor.next_int.min(conv.int_arg_regs),
        float_regs_used: cursor.next_float.min(conv.float_arg_regs),
    };
    tracing::debug!(
        target: "downcall.classify",
        convention = conv.name,
        descriptor = %descriptor,
        prefix = prefix.len(),
        stack_size = plan.stack_size,
        return_storage = plan.needs_return_storage(),
    );
    tracing::trace!(target: "downcall.classify", plan = %plan.to_json());
    Ok(plan)
}

fn check_exhausted(
    conv: &CallingConvention,
    cursor: &ArgCursor,
) -> std::result::Result<(), UnsupportedLayoutError> {
    let int_free = conv.int_arg_regs.saturating_sub(cursor.next_int);
    let float_free = conv.float_arg_regs.saturating_sub(cursor.next_float);
    if int_free == 0 && float_free == 0 {
        Ok(())
    } else {
        Err(UnsupportedLayoutError::PrefixTooShort {
            int_free,
            float_free,
        })
    }
}

fn check_supported(
    layout: &Layout,
    slot: DescriptorSlot,
) -> std::result::Result<(), UnsupportedLayoutError> {
    if layout.is_aggregate() && layout.size() == 0 {
        return Err(UnsupportedLayoutError::ZeroSized { slot });
    }
    match wide_scalar(layout) {
        Some(kind) => Err(UnsupportedLayoutError::ScalarKind { slot, kind }),
        None => Ok(()),
    }
}

/// First `I128`/`F128` in `layout`, visiting each node once; sequence
/// elements are checked through their element layout.
fn wide_scalar(layout: &Layout) -> Option<ScalarKind> {
    match layout {
        Layout::Scalar(scalar) => {
            matches!(scalar.kind(), ScalarKind::I128 | ScalarKind::F128).then(|| scalar.kind())
        }
        Layout::Group(group) => group
            .fields()
            .iter()
            .find_map(|field| wide_scalar(field.layout())),
        Layout::Sequence(sequence) if sequence.count() > 0 => wide_scalar(sequence.element()),
        Layout::Sequence(_) => None,
    }
}

/// Eightbyte/register class of a scalar leaf.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RegClass {
    Integer,
    Float,
}

impl RegClass {
    pub fn of(kind: ScalarKind) -> Self {
        if kind.is_float() {
            RegClass::Float
        } else {
            RegClass::Integer
        }
    }
}

/// A layout the classifier cannot place on the requested platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnsupportedLayoutError {
    ScalarKind {
        slot: DescriptorSlot,
        kind: ScalarKind,
    },
    ZeroSized {
        slot: DescriptorSlot,
    },
    Platform {
        triple: String,
    },
    PrefixTooShort {
        int_free: usize,
        float_free: usize,
    },
}

impl fmt::Display for UnsupportedLayoutError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnsupportedLayoutError::ScalarKind { slot, kind } => {
                write!(f, "{slot} uses scalar `{kind}` which has no C ABI placement")
            }
            UnsupportedLayoutError::ZeroSized { slot } => {
                write!(f, "{slot} is a zero-sized aggregate")
            }
            UnsupportedLayoutError::Platform { triple } => {
                write!(f, "no C calling convention support for `{triple}`")
            }
            UnsupportedLayoutError::PrefixTooShort {
                int_free,
                float_free,
            } => write!(
                f,
                "stack prefix leaves {int_free} integer and {float_free} float registers free"
            ),
        }
    }
}

impl std::error::Error for UnsupportedLayoutError {}
