//! AArch64 procedure call standard classification, including the Apple
//! variant that packs stack scalars.

use super::{ArgCursor, ArgPlacement, CallingConvention, Chunk, Location, RegClass};
use super::{ResultPointer, ReturnPlacement};
use crate::layout::{Layout, ScalarKind, align_to};

const MAX_HFA_MEMBERS: usize = 4;

/// Homogeneous floating-point aggregate: one to four members of a single
/// float kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Hfa {
    elem: ScalarKind,
    count: usize,
}

impl Hfa {
    fn elem_size(self) -> usize {
        self.elem.natural_size()
    }

    fn chunks(self, first_reg: usize) -> Vec<Chunk> {
        (0..self.count)
            .map(|index| Chunk {
                offset: index * self.elem_size(),
                size: self.elem_size(),
                location: Location::FloatReg(first_reg + index),
            })
            .collect()
    }
}

fn hfa_of(layout: &Layout) -> Option<Hfa> {
    if !layout.is_aggregate() || layout.size() > MAX_HFA_MEMBERS * ScalarKind::F64.natural_size() {
        return None;
    }
    let leaves = layout.scalar_leaves();
    let elem = leaves.first()?.scalar.kind();
    if !matches!(elem, ScalarKind::F32 | ScalarKind::F64) {
        return None;
    }
    let elem_size = elem.natural_size();
    let mut offsets = Vec::with_capacity(leaves.len());
    for leaf in &leaves {
        if leaf.scalar.kind() != elem || leaf.offset % elem_size != 0 {
            return None;
        }
        if !offsets.contains(&leaf.offset) {
            offsets.push(leaf.offset);
        }
    }
    let count = offsets.len();
    if !(1..=MAX_HFA_MEMBERS).contains(&count) || layout.size() != count * elem_size {
        return None;
    }
    Some(Hfa { elem, count })
}

fn stack_align(layout: &Layout) -> usize {
    if layout.alignment() >= 16 { 16 } else { 8 }
}

fn stack_aggregate(layout: &Layout, cursor: &mut ArgCursor) -> ArgPlacement {
    let size = layout.size();
    let offset = cursor.reserve_stack(align_to(size, 8), stack_align(layout));
    ArgPlacement::Stack { offset, size }
}

fn stack_scalar(conv: &CallingConvention, kind: ScalarKind, cursor: &mut ArgCursor) -> Location {
    let size = kind.natural_size();
    if conv.packed_stack_scalars {
        Location::Stack(cursor.reserve_stack(size, size))
    } else {
        Location::Stack(cursor.reserve_stack(conv.stack_slot, conv.stack_slot))
    }
}

fn next_int_or_stack(conv: &CallingConvention, cursor: &mut ArgCursor) -> Location {
    if cursor.next_int < conv.int_arg_regs {
        cursor.next_int += 1;
        Location::IntReg(cursor.next_int - 1)
    } else {
        cursor.next_int = conv.int_arg_regs;
        stack_scalar(conv, ScalarKind::Pointer, cursor)
    }
}

pub(super) fn classify_arg(
    conv: &CallingConvention,
    layout: &Layout,
    cursor: &mut ArgCursor,
) -> ArgPlacement {
    if let Some(scalar) = layout.as_scalar() {
        let kind = scalar.kind();
        let location = match RegClass::of(kind) {
            RegClass::Float if cursor.next_float < conv.float_arg_regs => {
                cursor.next_float += 1;
                Location::FloatReg(cursor.next_float - 1)
            }
            RegClass::Float => {
                cursor.next_float = conv.float_arg_regs;
                stack_scalar(conv, kind, cursor)
            }
            RegClass::Integer => {
                if cursor.next_int < conv.int_arg_regs {
                    cursor.next_int += 1;
                    Location::IntReg(cursor.next_int - 1)
                } else {
                    stack_scalar(conv, kind, cursor)
                }
            }
        };
        return ArgPlacement::Scalar { kind, location };
    }

    if let Some(hfa) = hfa_of(layout) {
        if cursor.next_float + hfa.count <= conv.float_arg_regs {
            let chunks = hfa.chunks(cursor.next_float);
            cursor.next_float += hfa.count;
            return ArgPlacement::Registers { chunks };
        }
        cursor.next_float = conv.float_arg_regs;
        return stack_aggregate(layout, cursor);
    }

    let size = layout.size();
    if size > conv.max_by_value {
        let pointer = next_int_or_stack(conv, cursor);
        return ArgPlacement::Indirect {
            pointer,
            size,
            align: layout.alignment(),
        };
    }

    if layout.alignment() >= 16 {
        cursor.next_int = align_to(cursor.next_int, 2);
    }
    let regs = size.div_ceil(8);
    if cursor.next_int + regs <= conv.int_arg_regs {
        let chunks = (0..regs)
            .map(|index| Chunk {
                offset: index * 8,
                size: (size - index * 8).min(8),
                location: Location::IntReg(cursor.next_int + index),
            })
            .collect();
        cursor.next_int += regs;
        return ArgPlacement::Registers { chunks };
    }
    cursor.next_int = conv.int_arg_regs;
    stack_aggregate(layout, cursor)
}

pub(super) fn classify_return(conv: &CallingConvention, layout: Option<&Layout>) -> ReturnPlacement {
    let Some(layout) = layout else {
        return ReturnPlacement::Void;
    };
    if let Some(scalar) = layout.as_scalar() {
        let kind = scalar.kind();
        let location = match RegClass::of(kind) {
            RegClass::Float => Location::FloatReg(0),
            RegClass::Integer => Location::IntReg(0),
        };
        return ReturnPlacement::Scalar { kind, location };
    }

    let size = layout.size();
    if let Some(hfa) = hfa_of(layout).filter(|hfa| hfa.count <= conv.float_ret_regs) {
        return ReturnPlacement::Registers {
            chunks: hfa.chunks(0),
            size,
        };
    }
    if size > conv.max_direct_return {
        return ReturnPlacement::InMemory {
            pointer: ResultPointer::Dedicated,
            size,
        };
    }
    let chunks = (0..size.div_ceil(8))
        .map(|index| Chunk {
            offset: index * 8,
            size: (size - index * 8).min(8),
            location: Location::IntReg(index),
        })
        .collect();
    ReturnPlacement::Registers { chunks, size }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abi::{AAPCS64, AAPCS64_APPLE};

    fn doubles(count: usize) -> Layout {
        let names = ["a", "b", "c", "d", "e"];
        Layout::struct_of(names[..count].iter().map(|name| (*name, Layout::f64()))).expect("hfa")
    }

    #[test]
    fn four_doubles_form_an_hfa() {
        assert_eq!(
            hfa_of(&doubles(4)),
            Some(Hfa {
                elem: ScalarKind::F64,
                count: 4
            })
        );
        assert_eq!(hfa_of(&doubles(5)), None);
        let ret = classify_return(&AAPCS64, Some(&doubles(4)));
        assert!(matches!(ret, ReturnPlacement::Registers { ref chunks, size: 32 } if chunks.len() == 4));
    }

    #[test]
    fn mixed_kinds_and_unions_of_floats() {
        let mixed = Layout::struct_of([("f", Layout::f32()), ("d", Layout::f64())]).expect("mixed");
        assert_eq!(hfa_of(&mixed), None);

        let union = Layout::union_of([
            ("one", Layout::f32()),
            ("two", Layout::sequence(Layout::f32(), 2)),
        ])
        .expect("union");
        assert_eq!(
            hfa_of(&union),
            Some(Hfa {
                elem: ScalarKind::F32,
                count: 2
            })
        );
    }

    #[test]
    fn large_aggregate_is_passed_by_reference() {
        let big = Layout::struct_of([
            ("a", Layout::i64()),
            ("b", Layout::i64()),
            ("c", Layout::i64()),
        ])
        .expect("big");
        let mut cursor = ArgCursor::default();
        let placement = classify_arg(&AAPCS64, &big, &mut cursor);
        assert_eq!(
            placement,
            ArgPlacement::Indirect {
                pointer: Location::IntReg(0),
                size: 24,
                align: 8
            }
        );
        assert_eq!(
            classify_return(&AAPCS64, Some(&big)),
            ReturnPlacement::InMemory {
                pointer: ResultPointer::Dedicated,
                size: 24
            }
        );
    }

    #[test]
    fn quad_aligned_aggregate_starts_on_even_register() {
        let aligned = Layout::struct_of([("a", Layout::i64()), ("b", Layout::i64())])
            .and_then(|layout| layout.with_align(16))
            .expect("aligned");
        let mut cursor = ArgCursor {
            next_int: 1,
            ..ArgCursor::default()
        };
        let placement = classify_arg(&AAPCS64, &aligned, &mut cursor);
        assert_eq!(
            placement,
            ArgPlacement::Registers {
                chunks: vec![
                    Chunk {
                        offset: 0,
                        size: 8,
                        location: Location::IntReg(2)
                    },
                    Chunk {
                        offset: 8,
                        size: 8,
                        location: Location::IntReg(3)
                    },
                ]
            }
        );
        assert_eq!(cursor.next_int, 4);
    }

    #[test]
    fn exhausted_aggregate_closes_the_integer_pool() {
        let pair = Layout::struct_of([("a", Layout::i64()), ("b", Layout::i64())]).expect("pair");
        let mut cursor = ArgCursor {
            next_int: 7,
            ..ArgCursor::default()
        };
        let placement = classify_arg(&AAPCS64, &pair, &mut cursor);
        assert_eq!(placement, ArgPlacement::Stack { offset: 0, size: 16 });
        let next = classify_arg(&AAPCS64, &Layout::i32(), &mut cursor);
        assert_eq!(
            next,
            ArgPlacement::Scalar {
                kind: ScalarKind::I32,
                location: Location::Stack(16)
            }
        );
    }

    #[test]
    fn apple_packs_stack_scalars() {
        let mut cursor = ArgCursor {
            next_int: 8,
            next_float: 8,
            stack: 0,
        };
        let kinds = [Layout::i8(), Layout::i16(), Layout::i32(), Layout::i64()];
        let offsets: Vec<_> = kinds
            .iter()
            .map(|layout| match classify_arg(&AAPCS64_APPLE, layout, &mut cursor) {
                ArgPlacement::Scalar {
                    location: Location::Stack(offset),
                    ..
                } => offset,
                other => panic!("expected stack scalar, found {other:?}"),
            })
            .collect();
        assert_eq!(offsets, vec![0, 2, 4, 8]);

        let mut cursor = ArgCursor {
            next_int: 8,
            next_float: 8,
            stack: 0,
        };
        let offsets: Vec<_> = kinds
            .iter()
            .map(|layout| match classify_arg(&AAPCS64, layout, &mut cursor) {
                ArgPlacement::Scalar {
                    location: Location::Stack(offset),
                    ..
                } => offset,
                other => panic!("expected stack scalar, found {other:?}"),
            })
            .collect();
        assert_eq!(offsets, vec![0, 8, 16, 24]);
    }
}
