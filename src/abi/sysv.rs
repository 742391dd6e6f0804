//! x86_64 System V classification.

use super::{ArgCursor, ArgPlacement, CallingConvention, Chunk, Location, RegClass};
use super::{ResultPointer, ReturnPlacement};
use crate::layout::{Layout, align_to};

const EIGHTBYTE: usize = 8;

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
            RegClass::Integer if cursor.next_int < conv.int_arg_regs => {
                cursor.next_int += 1;
                Location::IntReg(cursor.next_int - 1)
            }
            _ => Location::Stack(cursor.reserve_stack(conv.stack_slot, conv.stack_slot)),
        };
        return ArgPlacement::Scalar { kind, location };
    }

    let size = layout.size();
    if let Some(classes) = eightbyte_classes(conv, layout) {
        let ints = classes
            .iter()
            .filter(|class| **class == Some(RegClass::Integer))
            .count();
        let floats = classes
            .iter()
            .filter(|class| **class == Some(RegClass::Float))
            .count();
        if cursor.next_int + ints <= conv.int_arg_regs
            && cursor.next_float + floats <= conv.float_arg_regs
        {
            let chunks = assign_chunks(&classes, size, &mut cursor.next_int, &mut cursor.next_float);
            return ArgPlacement::Registers { chunks };
        }
    }

    let offset = cursor.reserve_stack(
        align_to(size, EIGHTBYTE),
        layout.alignment().max(EIGHTBYTE),
    );
    ArgPlacement::Stack { offset, size }
}

pub(super) fn classify_return(
    conv: &CallingConvention,
    layout: Option<&Layout>,
    cursor: &mut ArgCursor,
) -> ReturnPlacement {
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
    match eightbyte_classes(conv, layout) {
        Some(classes) if size <= conv.max_direct_return => {
            let mut next_int = 0;
            let mut next_float = 0;
            let chunks = assign_chunks(&classes, size, &mut next_int, &mut next_float);
            ReturnPlacement::Registers { chunks, size }
        }
        _ => {
            // The hidden result pointer occupies the first integer register.
            cursor.next_int = 1;
            ReturnPlacement::InMemory {
                pointer: ResultPointer::Argument(Location::IntReg(0)),
                size,
            }
        }
    }
}

/// Per-eightbyte register class of an aggregate, or `None` when it is
/// classified MEMORY (too large, or holding fields at unaligned offsets).
/// Eightbytes covered only by padding have no class.
fn eightbyte_classes(conv: &CallingConvention, layout: &Layout) -> Option<Vec<Option<RegClass>>> {
    let size = layout.size();
    if size > conv.max_by_value {
        return None;
    }
    let mut classes = vec![None; size.div_ceil(EIGHTBYTE)];
    for leaf in layout.scalar_leaves() {
        let leaf_size = leaf.scalar.size();
        if leaf.offset % leaf_size != 0 {
            return None;
        }
        let slot = &mut classes[leaf.offset / EIGHTBYTE];
        *slot = match (*slot, RegClass::of(leaf.scalar.kind())) {
            (Some(RegClass::Integer), _) | (_, RegClass::Integer) => Some(RegClass::Integer),
            (_, RegClass::Float) => Some(RegClass::Float),
        };
    }
    Some(classes)
}

fn assign_chunks(
    classes: &[Option<RegClass>],
    size: usize,
    next_int: &mut usize,
    next_float: &mut usize,
) -> Vec<Chunk> {
    let mut chunks = Vec::with_capacity(classes.len());
    for (index, class) in classes.iter().enumerate() {
        let offset = index * EIGHTBYTE;
        let location = match class {
            Some(RegClass::Integer) => {
                *next_int += 1;
                Location::IntReg(*next_int - 1)
            }
            Some(RegClass::Float) => {
                *next_float += 1;
                Location::FloatReg(*next_float - 1)
            }
            None => continue,
        };
        chunks.push(Chunk {
            offset,
            size: (size - offset).min(EIGHTBYTE),
            location,
        });
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abi::SYSV_X86_64;
    use crate::layout::ScalarKind;

    fn classes(layout: &Layout) -> Option<Vec<Option<RegClass>>> {
        eightbyte_classes(&SYSV_X86_64, layout)
    }

    #[test]
    fn integer_class_wins_within_an_eightbyte() {
        let mixed = Layout::struct_of([("f", Layout::f32()), ("i", Layout::i32())]).expect("mixed");
        assert_eq!(classes(&mixed), Some(vec![Some(RegClass::Integer)]));

        let split = Layout::struct_of([("d", Layout::f64()), ("l", Layout::i64())]).expect("split");
        assert_eq!(
            classes(&split),
            Some(vec![Some(RegClass::Float), Some(RegClass::Integer)])
        );
    }

    #[test]
    fn large_and_unaligned_aggregates_are_memory() {
        let big = Layout::struct_of([
            ("a", Layout::i64()),
            ("b", Layout::i64()),
            ("c", Layout::i64()),
        ])
        .expect("big");
        assert_eq!(classes(&big), None);

        let packed =
            Layout::packed_struct_of([("a", Layout::u8()), ("b", Layout::u16())]).expect("packed");
        assert_eq!(classes(&packed), None);

        let mut cursor = ArgCursor::default();
        let placement = classify_arg(&SYSV_X86_64, &packed, &mut cursor);
        assert_eq!(placement, ArgPlacement::Stack { offset: 0, size: 3 });
        assert_eq!(cursor.stack, 8);
    }

    #[test]
    fn aggregate_that_does_not_fit_goes_whole_to_stack() {
        let pair = Layout::struct_of([("a", Layout::i64()), ("b", Layout::i64())]).expect("pair");
        let mut cursor = ArgCursor {
            next_int: 5,
            ..ArgCursor::default()
        };
        let placement = classify_arg(&SYSV_X86_64, &pair, &mut cursor);
        assert_eq!(placement, ArgPlacement::Stack { offset: 0, size: 16 });
        assert_eq!(cursor.next_int, 5);

        let next = classify_arg(&SYSV_X86_64, &Layout::i32(), &mut cursor);
        assert_eq!(
            next,
            ArgPlacement::Scalar {
                kind: ScalarKind::I32,
                location: Location::IntReg(5)
            }
        );
    }

    #[test]
    fn padding_only_eightbytes_are_skipped() {
        let padded = Layout::struct_of([("x", Layout::f64())])
            .and_then(|layout| layout.with_align(16))
            .expect("padded");
        assert_eq!(padded.size(), 16);
        let mut cursor = ArgCursor::default();
        let placement = classify_arg(&SYSV_X86_64, &padded, &mut cursor);
        assert_eq!(
            placement,
            ArgPlacement::Registers {
                chunks: vec![Chunk {
                    offset: 0,
                    size: 8,
                    location: Location::FloatReg(0)
                }]
            }
        );
    }

    #[test]
    fn sret_consumes_first_integer_register() {
        let big = Layout::struct_of([
            ("a", Layout::i64()),
            ("b", Layout::i64()),
            ("c", Layout::i64()),
        ])
        .expect("big");
        let mut cursor = ArgCursor::default();
        let ret = classify_return(&SYSV_X86_64, Some(&big), &mut cursor);
        assert_eq!(
            ret,
            ReturnPlacement::InMemory {
                pointer: ResultPointer::Argument(Location::IntReg(0)),
                size: 24
            }
        );
        assert_eq!(cursor.next_int, 1);
    }
}
