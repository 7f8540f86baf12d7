//! Calling-convention marshaling.
//!
//! `assign` maps a signature's parameters to registers and stack slots for a
//! target; `stub` turns that assignment plus concrete literals into assembler
//! glue that calls into the relocated code.

pub mod stub;

use crate::isa::Isa;
use crate::kind::{Kind, RegisterClass};
use serde::Serialize;
use thiserror::Error;

/// A floating register view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FloatReg {
    S(u8),
    D(u8),
}

/// Where one argument travels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ArgLocation {
    /// General register
    Gpr(u8),
    /// Consecutive general registers holding a 64-bit value on a 32-bit target
    GprPair { lo: u8, hi: u8 },
    Fpr(FloatReg),
    /// Outgoing stack slot, relative to the stack pointer at the call
    Stack { offset: u64, size: u64 },
}

/// Argument assignment for a whole signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArgumentLayout {
    pub locations: Vec<ArgLocation>,
    /// Outgoing stack area, padded to the call-boundary alignment
    pub stack_size: u64,
}

/// Where a return value is found after the call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReturnSlot {
    None,
    Gpr(u8),
    GprPair { lo: u8, hi: u8 },
    Fpr(FloatReg),
}

#[derive(Debug, Error, PartialEq)]
pub enum AbiError {
    #[error("{0} is not a valid parameter kind")]
    InvalidParameter(Kind),
}

const ARMV7_CORE_ARGS: u8 = 4;
const ARMV7_VFP_SINGLES: u32 = 16;
const AARCH64_ARGS: u8 = 8;

/// Assign each parameter of a signature to its location.
pub fn assign(isa: Isa, params: &[Kind]) -> Result<ArgumentLayout, AbiError> {
    match isa {
        Isa::Armv7 => assign_armv7(params),
        Isa::Aarch64 => assign_aarch64(params),
    }
}

fn align_up(value: u64, align: u64) -> u64 {
    value.div_ceil(align) * align
}

/// AAPCS with the VFP variant: core registers r0-r3, 64-bit values in an
/// even/odd pair, s0-s15 allocated with back-filling.
fn assign_armv7(params: &[Kind]) -> Result<ArgumentLayout, AbiError> {
    let mut ncrn: u8 = 0;
    let mut nsaa: u64 = 0;
    // bit n set = s<n> taken
    let mut vfp_used: u32 = 0;
    let mut locations = Vec::with_capacity(params.len());

    for kind in params {
        let location = match kind.register_class() {
            RegisterClass::Word | RegisterClass::Address => {
                if ncrn < ARMV7_CORE_ARGS {
                    ncrn += 1;
                    ArgLocation::Gpr(ncrn - 1)
                } else {
                    stack_slot(&mut nsaa, 4)
                }
            }
            RegisterClass::DoubleWord => {
                let lo = ncrn.next_multiple_of(2);
                if lo + 1 < ARMV7_CORE_ARGS {
                    ncrn = lo + 2;
                    ArgLocation::GprPair { lo, hi: lo + 1 }
                } else {
                    ncrn = ARMV7_CORE_ARGS;
                    stack_slot(&mut nsaa, 8)
                }
            }
            RegisterClass::Single => match (0..ARMV7_VFP_SINGLES).find(|s| vfp_used & (1 << s) == 0) {
                Some(s) => {
                    vfp_used |= 1 << s;
                    ArgLocation::Fpr(FloatReg::S(s as u8))
                }
                None => {
                    vfp_used = u32::MAX;
                    stack_slot(&mut nsaa, 4)
                }
            },
            RegisterClass::Double => {
                match (0..ARMV7_VFP_SINGLES / 2).find(|d| vfp_used & (0b11 << (2 * d)) == 0) {
                    Some(d) => {
                        vfp_used |= 0b11 << (2 * d);
                        ArgLocation::Fpr(FloatReg::D(d as u8))
                    }
                    None => {
                        vfp_used = u32::MAX;
                        stack_slot(&mut nsaa, 8)
                    }
                }
            }
            RegisterClass::None => return Err(AbiError::InvalidParameter(*kind)),
        };
        locations.push(location);
    }

    Ok(ArgumentLayout {
        locations,
        stack_size: align_up(nsaa, Isa::Armv7.stack_alignment()),
    })
}

fn stack_slot(nsaa: &mut u64, size: u64) -> ArgLocation {
    let offset = align_up(*nsaa, size);
    *nsaa = offset + size;
    ArgLocation::Stack { offset, size }
}

/// AAPCS64: x0-x7 and v0-v7 as independent sequences, 8-byte stack slots.
fn assign_aarch64(params: &[Kind]) -> Result<ArgumentLayout, AbiError> {
    let mut ngrn: u8 = 0;
    let mut nsrn: u8 = 0;
    let mut nsaa: u64 = 0;
    let mut locations = Vec::with_capacity(params.len());

    for kind in params {
        let class = kind.register_class();
        if class == RegisterClass::None {
            return Err(AbiError::InvalidParameter(*kind));
        }
        let is_float = matches!(class, RegisterClass::Single | RegisterClass::Double);
        let next = if is_float { &mut nsrn } else { &mut ngrn };

        let location = if *next < AARCH64_ARGS {
            let reg = *next;
            *next += 1;
            match class {
                RegisterClass::Single => ArgLocation::Fpr(FloatReg::S(reg)),
                RegisterClass::Double => ArgLocation::Fpr(FloatReg::D(reg)),
                _ => ArgLocation::Gpr(reg),
            }
        } else {
            let offset = nsaa;
            nsaa += 8;
            ArgLocation::Stack { offset, size: 8 }
        };
        locations.push(location);
    }

    Ok(ArgumentLayout {
        locations,
        stack_size: align_up(nsaa, Isa::Aarch64.stack_alignment()),
    })
}

/// Where a value of `kind` is returned.
pub fn return_slot(isa: Isa, kind: Kind) -> ReturnSlot {
    match (isa, kind.register_class()) {
        (_, RegisterClass::None) => ReturnSlot::None,
        (Isa::Armv7, RegisterClass::DoubleWord) => ReturnSlot::GprPair { lo: 0, hi: 1 },
        (_, RegisterClass::Word | RegisterClass::Address | RegisterClass::DoubleWord) => {
            ReturnSlot::Gpr(0)
        }
        (_, RegisterClass::Single) => ReturnSlot::Fpr(FloatReg::S(0)),
        (_, RegisterClass::Double) => ReturnSlot::Fpr(FloatReg::D(0)),
    }
}

/// Reassemble a 64-bit value from the two halves of a register pair.
///
/// Both halves are masked to 32 bits first, so a sign-extended low half can
/// never bleed into the high word.
pub fn join_long(lo: u64, hi: u64) -> i64 {
    ((lo & 0xFFFF_FFFF) | ((hi & 0xFFFF_FFFF) << 32)) as i64
}

/// Split a 64-bit value into (lo, hi) register halves.
pub fn split_long(value: i64) -> (u32, u32) {
    let bits = value as u64;
    (bits as u32, (bits >> 32) as u32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use Kind::*;

    #[test]
    fn test_armv7_long_pairs_are_even_aligned() {
        let layout = assign(Isa::Armv7, &[Int, Long, Int]).unwrap();
        assert_eq!(
            layout.locations,
            vec![
                ArgLocation::Gpr(0),
                ArgLocation::GprPair { lo: 2, hi: 3 },
                ArgLocation::Stack { offset: 0, size: 4 },
            ]
        );
        assert_eq!(layout.stack_size, 8);
    }

    #[test]
    fn test_armv7_long_does_not_split() {
        let layout = assign(Isa::Armv7, &[Int, Int, Int, Long, Int]).unwrap();
        assert_eq!(layout.locations[3], ArgLocation::Stack { offset: 0, size: 8 });
        // r3 is skipped once a long went to the stack
        assert_eq!(layout.locations[4], ArgLocation::Stack { offset: 8, size: 4 });
        assert_eq!(layout.stack_size, 16);
    }

    #[test]
    fn test_armv7_vfp_back_filling() {
        let layout = assign(Isa::Armv7, &[Float, Double, Float, Int]).unwrap();
        assert_eq!(
            layout.locations,
            vec![
                ArgLocation::Fpr(FloatReg::S(0)),
                ArgLocation::Fpr(FloatReg::D(1)),
                ArgLocation::Fpr(FloatReg::S(1)),
                ArgLocation::Gpr(0),
            ]
        );
        assert_eq!(layout.stack_size, 0);
    }

    #[test]
    fn test_aarch64_independent_sequences() {
        let mut params = vec![Double, Long, Float];
        params.extend(std::iter::repeat_n(Int, 8));
        let layout = assign(Isa::Aarch64, &params).unwrap();
        assert_eq!(layout.locations[0], ArgLocation::Fpr(FloatReg::D(0)));
        assert_eq!(layout.locations[1], ArgLocation::Gpr(0));
        assert_eq!(layout.locations[2], ArgLocation::Fpr(FloatReg::S(1)));
        assert_eq!(layout.locations[9], ArgLocation::Gpr(7));
        assert_eq!(layout.locations[10], ArgLocation::Stack { offset: 0, size: 8 });
        assert_eq!(layout.stack_size, 16);
    }

    #[test]
    fn test_void_parameter_rejected() {
        assert_eq!(
            assign(Isa::Aarch64, &[Int, Void]),
            Err(AbiError::InvalidParameter(Void))
        );
    }

    #[test]
    fn test_return_slots() {
        assert_eq!(return_slot(Isa::Armv7, Long), ReturnSlot::GprPair { lo: 0, hi: 1 });
        assert_eq!(return_slot(Isa::Aarch64, Long), ReturnSlot::Gpr(0));
        assert_eq!(return_slot(Isa::Armv7, Float), ReturnSlot::Fpr(FloatReg::S(0)));
        assert_eq!(return_slot(Isa::Aarch64, Void), ReturnSlot::None);
    }

    #[test]
    fn test_long_halves() {
        for v in [0, -1, i64::MIN, i64::MAX, -2, 0x1_0000_0000, -0x8000_0000, 0x7FFF_FFFF] {
            let (lo, hi) = split_long(v);
            assert_eq!(join_long(lo as u64, hi as u64), v);
            // halves captured from sign-extending 64-bit dumps
            let lo_ext = lo as i32 as i64 as u64;
            let hi_ext = hi as i32 as i64 as u64;
            assert_eq!(join_long(lo_ext, hi_ext), v);
        }
    }
}
