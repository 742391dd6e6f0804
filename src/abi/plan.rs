use std::fmt;

use serde::Serialize;

use crate::descriptor::Fingerprint;
use crate::layout::ScalarKind;
use crate::target::{Target, TargetArch};

/// Where one piece of an argument or return value lives at the call boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(tag = "kind", content = "index", rename_all = "snake_case")]
pub enum Location {
    /// Integer argument (or return) register by position in its pool.
    IntReg(usize),
    /// Floating-point argument (or return) register by position in its pool.
    FloatReg(usize),
    /// Byte offset from the stack pointer at the call instruction.
    Stack(usize),
}

impl Location {
    #[must_use]
    pub fn is_stack(self) -> bool {
        matches!(self, Location::Stack(_))
    }
}

/// A register-sized piece of an aggregate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct Chunk {
    /// Byte offset inside the aggregate.
    pub offset: usize,
    /// Bytes carried, at most eight.
    pub size: usize,
    pub location: Location,
}

/// Placement of a single parameter.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(tag = "pass", rename_all = "snake_case")]
pub enum ArgPlacement {
    /// Scalar in one register or stack slot.
    Scalar { kind: ScalarKind, location: Location },
    /// Aggregate split across registers, one chunk per register.
    Registers { chunks: Vec<Chunk> },
    /// Aggregate copied by value into the outgoing stack area.
    Stack { offset: usize, size: usize },
    /// Aggregate copied into engine-owned memory; its address travels at
    /// `pointer`.
    Indirect {
        pointer: Location,
        size: usize,
        align: usize,
    },
}

impl ArgPlacement {
    /// Whether any part of the argument travels in the stack area.
    #[must_use]
    pub fn uses_stack(&self) -> bool {
        match self {
            ArgPlacement::Scalar { location, .. } => location.is_stack(),
            ArgPlacement::Registers { chunks } => chunks.iter().any(|chunk| chunk.location.is_stack()),
            ArgPlacement::Stack { .. } => true,
            ArgPlacement::Indirect { pointer, .. } => pointer.is_stack(),
        }
    }

    #[must_use]
    pub fn is_indirect(&self) -> bool {
        matches!(self, ArgPlacement::Indirect { .. })
    }
}

/// How the address of caller-supplied return storage reaches the callee.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultPointer {
    /// Hidden leading argument (x86_64 System V: `rdi`).
    Argument(Location),
    /// Dedicated indirect-result register (AArch64: `x8`).
    Dedicated,
}

/// Placement of the return value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(tag = "pass", rename_all = "snake_case")]
pub enum ReturnPlacement {
    Void,
    Scalar { kind: ScalarKind, location: Location },
    /// Aggregate returned in registers; chunk locations index the return
    /// register pools.
    Registers { chunks: Vec<Chunk>, size: usize },
    /// Aggregate written by the callee into caller-supplied storage.
    InMemory { pointer: ResultPointer, size: usize },
}

/// Result of classifying a descriptor for one platform. Immutable; shared as
/// `Arc<Plan>` and cached by the linker.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct Plan {
    pub(crate) target: Target,
    pub(crate) fingerprint: Fingerprint,
    pub(crate) prefix_len: usize,
    pub(crate) params: Vec<ArgPlacement>,
    pub(crate) ret: ReturnPlacement,
    pub(crate) stack_size: usize,
    pub(crate) int_regs_used: usize,
    pub(crate) float_regs_used: usize,
}

impl Plan {
    #[must_use]
    pub fn target(&self) -> &Target {
        &self.target
    }

    /// Fingerprint of the descriptor this plan was derived from (without any
    /// forced-stack prefix).
    #[must_use]
    pub fn fingerprint(&self) -> Fingerprint {
        self.fingerprint
    }

    /// Number of leading padding slots added by forced-stack classification.
    #[must_use]
    pub fn prefix_len(&self) -> usize {
        self.prefix_len
    }

    /// Number of caller-visible parameters.
    #[must_use]
    pub fn param_count(&self) -> usize {
        self.params.len() - self.prefix_len
    }

    /// Placements of the caller-visible parameters.
    #[must_use]
    pub fn params(&self) -> &[ArgPlacement] {
        &self.params[self.prefix_len..]
    }

    /// Placements of every slot, prefix included.
    #[must_use]
    pub fn all_slots(&self) -> &[ArgPlacement] {
        &self.params
    }

    #[must_use]
    pub fn ret(&self) -> &ReturnPlacement {
        &self.ret
    }

    /// True when the callee writes its result through a hidden pointer to
    /// caller-supplied storage.
    #[must_use]
    pub fn needs_return_storage(&self) -> bool {
        matches!(self.ret, ReturnPlacement::InMemory { .. })
    }

    /// Bytes of outgoing stack arguments, rounded up to 16.
    #[must_use]
    pub fn stack_size(&self) -> usize {
        self.stack_size
    }

    #[must_use]
    pub fn int_regs_used(&self) -> usize {
        self.int_regs_used
    }

    #[must_use]
    pub fn float_regs_used(&self) -> usize {
        self.float_regs_used
    }

    /// JSON rendering used for diagnostics.
    #[must_use]
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|err| format!("{{\"error\":\"{err}\"}}"))
    }
}

struct Named {
    arch: TargetArch,
    location: Location,
    is_return: bool,
}

impl fmt::Display for Named {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const SYSV_INT: [&str; 6] = ["rdi", "rsi", "rdx", "rcx", "r8", "r9"];
        const SYSV_INT_RET: [&str; 2] = ["rax", "rdx"];
        match (self.arch, self.location) {
            (_, Location::Stack(offset)) => write!(f, "[sp+{offset}]"),
            (TargetArch::X86_64, Location::IntReg(index)) => {
                let names: &[&str] = if self.is_return {
                    &SYSV_INT_RET
                } else {
                    &SYSV_INT
                };
                match names.get(index) {
                    Some(name) => f.write_str(name),
                    None => write!(f, "int{index}"),
                }
            }
            (TargetArch::X86_64, Location::FloatReg(index)) => write!(f, "xmm{index}"),
            (TargetArch::Aarch64, Location::IntReg(index)) => write!(f, "x{index}"),
            (TargetArch::Aarch64, Location::FloatReg(index)) => write!(f, "v{index}"),
        }
    }
}

fn named(arch: TargetArch, location: Location, is_return: bool) -> Named {
    Named {
        arch,
        location,
        is_return,
    }
}

fn write_chunks(
    f: &mut fmt::Formatter<'_>,
    arch: TargetArch,
    chunks: &[Chunk],
    is_return: bool,
) -> fmt::Result {
    for (index, chunk) in chunks.iter().enumerate() {
        if index > 0 {
            f.write_str(", ")?;
        }
        write!(
            f,
            "{}..{} in {}",
            chunk.offset,
            chunk.offset + chunk.size,
            named(arch, chunk.location, is_return)
        )?;
    }
    Ok(())
}

impl fmt::Display for Plan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let arch = self.target.arch();
        writeln!(f, "plan for {}", self.target)?;
        for (index, placement) in self.params.iter().enumerate() {
            if index < self.prefix_len {
                write!(f, "  pad{index}: ")?;
            } else {
                write!(f, "  arg{}: ", index - self.prefix_len)?;
            }
            match placement {
                ArgPlacement::Scalar { kind, location } => {
                    write!(f, "{kind} in {}", named(arch, *location, false))?;
                }
                ArgPlacement::Registers { chunks } => {
                    f.write_str("aggregate ")?;
                    write_chunks(f, arch, chunks, false)?;
                }
                ArgPlacement::Stack { offset, size } => {
                    write!(f, "aggregate copy of {size} bytes at [sp+{offset}]")?;
                }
                ArgPlacement::Indirect { pointer, size, .. } => {
                    write!(
                        f,
                        "pointer to {size}-byte copy in {}",
                        named(arch, *pointer, false)
                    )?;
                }
            }
            writeln!(f)?;
        }
        f.write_str("  ret: ")?;
        match &self.ret {
            ReturnPlacement::Void => f.write_str("void")?,
            ReturnPlacement::Scalar { kind, location } => {
                write!(f, "{kind} in {}", named(arch, *location, true))?;
            }
            ReturnPlacement::Registers { chunks, .. } => {
                f.write_str("aggregate ")?;
                write_chunks(f, arch, chunks, true)?;
            }
            ReturnPlacement::InMemory { pointer, size } => {
                write!(f, "{size} bytes in caller storage via ")?;
                match pointer {
                    ResultPointer::Argument(location) => {
                        write!(f, "{}", named(arch, *location, false))?;
                    }
                    ResultPointer::Dedicated => f.write_str("x8")?,
                }
            }
        }
        writeln!(f)?;
        write!(f, "  stack: {} bytes", self.stack_size)
    }
}
