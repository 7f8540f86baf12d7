//! Target instruction sets.
//!
//! This module provides:
//! - Instruction encoders for AArch64 and ARMv7
//! - A code buffer for building routine bodies
//! - Call-site patching used by the linker

pub mod aarch64;
pub mod armv7;
pub mod codebuf;

use crate::routine::CallKind;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// A simulated target architecture.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Isa {
    /// ARMv7-A, hard-float AAPCS
    Armv7,
    /// AArch64, AAPCS64
    #[default]
    Aarch64,
}

#[derive(Debug, Clone, Copy, Error, PartialEq)]
pub enum PatchError {
    #[error("call site at buffer offset 0x{site:x} runs past the end of the buffer")]
    SiteOutOfBounds { site: usize },
    #[error("instruction at buffer offset 0x{site:x} is not a {kind} site (found {found:#010x})")]
    NotACallSite { site: usize, kind: CallKind, found: u32 },
    #[error("displacement {disp} cannot be encoded at buffer offset 0x{site:x}")]
    Unencodable { site: usize, disp: i64 },
}

const ARMV7_INTEGER_REGISTERS: &[&str] = &[
    "r0", "r1", "r2", "r3", "r4", "r5", "r6", "r7", "r8", "r9", "r10", "r11", "r12", "sp", "lr",
    "pc",
];

const ARMV7_FLOAT_REGISTERS: &[&str] = &[
    "d0", "d1", "d2", "d3", "d4", "d5", "d6", "d7", "d8", "d9", "d10", "d11", "d12", "d13", "d14",
    "d15",
];

const AARCH64_INTEGER_REGISTERS: &[&str] = &[
    "x0", "x1", "x2", "x3", "x4", "x5", "x6", "x7", "x8", "x9", "x10", "x11", "x12", "x13", "x14",
    "x15", "x16", "x17", "x18", "x19", "x20", "x21", "x22", "x23", "x24", "x25", "x26", "x27",
    "x28", "x29", "x30", "sp", "pc",
];

const AARCH64_FLOAT_REGISTERS: &[&str] = &["d0", "d1", "d2", "d3", "d4", "d5", "d6", "d7"];

impl Isa {
    pub const INSTRUCTION_SIZE: usize = 4;

    pub fn name(self) -> &'static str {
        match self {
            Isa::Armv7 => "armv7",
            Isa::Aarch64 => "aarch64",
        }
    }

    pub fn nop(self) -> u32 {
        match self {
            Isa::Armv7 => armv7::NOP,
            Isa::Aarch64 => aarch64::NOP,
        }
    }

    pub fn ret(self) -> u32 {
        match self {
            Isa::Armv7 => armv7::RET,
            Isa::Aarch64 => aarch64::RET,
        }
    }

    /// A jump to itself, used as a placeholder until the linker patches it.
    pub fn placeholder_jump(self) -> u32 {
        let encoded = match self {
            Isa::Armv7 => armv7::encode_branch(false, 0),
            Isa::Aarch64 => aarch64::encode_branch(false, 0),
        };
        encoded.unwrap_or_else(|| self.nop())
    }

    /// Stack pointer alignment required at a call boundary.
    pub fn stack_alignment(self) -> u64 {
        match self {
            Isa::Armv7 => 8,
            Isa::Aarch64 => 16,
        }
    }

    pub fn pointer_size(self) -> u64 {
        match self {
            Isa::Armv7 => 4,
            Isa::Aarch64 => 8,
        }
    }

    /// General registers in the order a register dump is captured.
    pub fn integer_registers(self) -> &'static [&'static str] {
        match self {
            Isa::Armv7 => ARMV7_INTEGER_REGISTERS,
            Isa::Aarch64 => AARCH64_INTEGER_REGISTERS,
        }
    }

    /// Double-precision views of the floating registers, in capture order.
    pub fn float_registers(self) -> &'static [&'static str] {
        match self {
            Isa::Armv7 => ARMV7_FLOAT_REGISTERS,
            Isa::Aarch64 => AARCH64_FLOAT_REGISTERS,
        }
    }

    /// Bytes taken by the call site at `site`: one branch, or on ARMv7 a
    /// call that is not a `bl` spans the whole call sequence.
    pub fn call_site_width(self, code: &[u8], site: usize, kind: CallKind) -> usize {
        let single = read_u32(code, site).is_some_and(|inst| match self {
            Isa::Armv7 => armv7::decode_branch(inst).is_some(),
            Isa::Aarch64 => true,
        });
        if self == Isa::Armv7 && kind == CallKind::Call && !single {
            armv7::CALL_SEQUENCE_SIZE
        } else {
            Self::INSTRUCTION_SIZE
        }
    }

    /// Rewrite the call site at `site` so it reaches `site + disp`.
    pub fn patch_call(
        self,
        code: &mut [u8],
        site: usize,
        kind: CallKind,
        disp: i64,
    ) -> Result<(), PatchError> {
        let first = read_u32(code, site).ok_or(PatchError::SiteOutOfBounds { site })?;
        let unencodable = PatchError::Unencodable { site, disp };
        let not_a_site = PatchError::NotACallSite {
            site,
            kind,
            found: first,
        };

        match self {
            Isa::Aarch64 => {
                let (link, _) = aarch64::decode_branch(first).ok_or(not_a_site)?;
                if link != (kind == CallKind::Call) {
                    return Err(not_a_site);
                }
                let inst = aarch64::encode_branch(link, disp).ok_or(unencodable)?;
                write_u32(code, site, inst);
            }
            Isa::Armv7 => match (kind, armv7::decode_branch(first)) {
                (CallKind::Jump, Some((false, _))) | (CallKind::Call, Some((true, _))) => {
                    let link = kind == CallKind::Call;
                    let inst = armv7::encode_branch(link, disp).ok_or(unencodable)?;
                    write_u32(code, site, inst);
                }
                (CallKind::Call, None) => {
                    let words = read_words(code, site).ok_or(PatchError::SiteOutOfBounds { site })?;
                    armv7::decode_call_sequence(words).ok_or(not_a_site)?;
                    let words = armv7::encode_call_sequence(disp).ok_or(unencodable)?;
                    for (i, word) in words.iter().enumerate() {
                        write_u32(code, site + 4 * i, *word);
                    }
                }
                _ => return Err(not_a_site),
            },
        }
        Ok(())
    }

    /// Decode the displacement a call site currently encodes.
    pub fn decode_call(self, code: &[u8], site: usize) -> Option<i64> {
        let first = read_u32(code, site)?;
        match self {
            Isa::Aarch64 => aarch64::decode_branch(first).map(|(_, disp)| disp),
            Isa::Armv7 => match armv7::decode_branch(first) {
                Some((_, disp)) => Some(disp),
                None => armv7::decode_call_sequence(read_words(code, site)?),
            },
        }
    }
}

impl fmt::Display for Isa {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

pub(crate) fn read_u32(code: &[u8], offset: usize) -> Option<u32> {
    let bytes = code.get(offset..offset.checked_add(4)?)?;
    Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

pub(crate) fn write_u32(code: &mut [u8], offset: usize, value: u32) {
    code[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

fn read_words(code: &[u8], offset: usize) -> Option<[u32; 4]> {
    Some([
        read_u32(code, offset)?,
        read_u32(code, offset + 4)?,
        read_u32(code, offset + 8)?,
        read_u32(code, offset + 12)?,
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_patch_aarch64_call() {
        let mut code = vec![0u8; 16];
        write_u32(&mut code, 4, 0x94000000);
        Isa::Aarch64
            .patch_call(&mut code, 4, CallKind::Call, 8)
            .unwrap();
        assert_eq!(Isa::Aarch64.decode_call(&code, 4), Some(8));
    }

    #[test]
    fn test_patch_rejects_wrong_instruction() {
        let mut code = vec![0u8; 8];
        write_u32(&mut code, 0, aarch64::NOP);
        let err = Isa::Aarch64
            .patch_call(&mut code, 0, CallKind::Call, 4)
            .unwrap_err();
        assert!(matches!(err, PatchError::NotACallSite { .. }));

        // a B is not a call
        write_u32(&mut code, 0, 0x14000000);
        assert!(Isa::Aarch64.patch_call(&mut code, 0, CallKind::Call, 4).is_err());
    }

    #[test]
    fn test_patch_armv7_sequence() {
        let mut code = vec![0u8; 32];
        for (i, word) in armv7::encode_call_sequence(0).unwrap().iter().enumerate() {
            write_u32(&mut code, 4 + 4 * i, *word);
        }
        Isa::Armv7
            .patch_call(&mut code, 4, CallKind::Call, 24)
            .unwrap();
        assert_eq!(Isa::Armv7.decode_call(&code, 4), Some(24));
    }

    #[test]
    fn test_patch_out_of_bounds() {
        let mut code = vec![0u8; 4];
        assert_eq!(
            Isa::Armv7.patch_call(&mut code, 2, CallKind::Jump, 0),
            Err(PatchError::SiteOutOfBounds { site: 2 })
        );
    }

    #[test]
    fn test_placeholder_is_self_jump() {
        for isa in [Isa::Armv7, Isa::Aarch64] {
            let mut code = vec![0u8; 4];
            write_u32(&mut code, 0, isa.placeholder_jump());
            assert_eq!(isa.decode_call(&code, 0), Some(0));
        }
    }
}
