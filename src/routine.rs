//! Compiled routine descriptors.
//!
//! A `CompiledRoutine` is the unit the linker works on: machine code bytes
//! at the address the compiler laid them out at, plus the direct call sites
//! that still point into that original address space.

use crate::isa::{write_u32, Isa};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoutineKind {
    Method,
    /// Runtime stub that binds static calls lazily by patching its caller.
    Trampoline,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallKind {
    /// Branch with link
    Call,
    /// Branch without link
    Jump,
}

impl fmt::Display for CallKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallKind::Call => f.write_str("call"),
            CallKind::Jump => f.write_str("jump"),
        }
    }
}

/// An unresolved direct call inside a routine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallSite {
    /// Offset of the call instruction relative to the owning routine
    pub site_offset: usize,
    /// Target in the original address space
    pub target_address: u64,
    pub kind: CallKind,
    /// The call is routed through the static trampoline
    #[serde(default)]
    pub via_trampoline: bool,
}

impl CallSite {
    pub fn call(site_offset: usize, target_address: u64) -> Self {
        Self {
            site_offset,
            target_address,
            kind: CallKind::Call,
            via_trampoline: false,
        }
    }
}

/// The self-modifying region of a trampoline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelfPatch {
    pub offset: usize,
    pub length: usize,
    /// Target the lazy binding would resolve to, when known
    pub resolves_to: Option<u64>,
}

#[derive(Debug, Error, PartialEq)]
pub enum RoutineError {
    #[error("routine `{0}` has no code")]
    Empty(String),
    #[error("routine `{name}` at 0x{address:x} overflows the address space")]
    AddressOverflow { name: String, address: u64 },
    #[error("call site at offset {offset} lies outside routine `{name}` ({length} bytes)")]
    SiteOutOfBounds {
        name: String,
        offset: usize,
        length: usize,
    },
    #[error("only trampolines may carry a self-patch region (routine `{0}`)")]
    SelfPatchOnMethod(String),
    #[error("self-patch region {offset}+{length} is invalid for routine `{name}`")]
    BadSelfPatch {
        name: String,
        offset: usize,
        length: usize,
    },
}

/// Machine code for one compiled method or runtime stub.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledRoutine {
    name: String,
    bytes: Vec<u8>,
    original_address: u64,
    direct_calls: Vec<CallSite>,
    kind: RoutineKind,
    self_patch: Option<SelfPatch>,
}

impl CompiledRoutine {
    pub fn method(
        name: impl Into<String>,
        original_address: u64,
        bytes: Vec<u8>,
        direct_calls: Vec<CallSite>,
    ) -> Result<Self, RoutineError> {
        Self::new(
            name.into(),
            original_address,
            bytes,
            direct_calls,
            RoutineKind::Method,
            None,
        )
    }

    pub fn trampoline(
        name: impl Into<String>,
        original_address: u64,
        bytes: Vec<u8>,
        direct_calls: Vec<CallSite>,
        self_patch: Option<SelfPatch>,
    ) -> Result<Self, RoutineError> {
        Self::new(
            name.into(),
            original_address,
            bytes,
            direct_calls,
            RoutineKind::Trampoline,
            self_patch,
        )
    }

    pub fn new(
        name: String,
        original_address: u64,
        bytes: Vec<u8>,
        direct_calls: Vec<CallSite>,
        kind: RoutineKind,
        self_patch: Option<SelfPatch>,
    ) -> Result<Self, RoutineError> {
        if bytes.is_empty() {
            return Err(RoutineError::Empty(name));
        }
        if original_address.checked_add(bytes.len() as u64).is_none() {
            return Err(RoutineError::AddressOverflow {
                name,
                address: original_address,
            });
        }
        let outside = |c: &&CallSite| {
            c.site_offset
                .checked_add(Isa::INSTRUCTION_SIZE)
                .is_none_or(|end| end > bytes.len())
        };
        if let Some(call) = direct_calls.iter().find(outside) {
            return Err(RoutineError::SiteOutOfBounds {
                offset: call.site_offset,
                length: bytes.len(),
                name,
            });
        }
        if let Some(patch) = self_patch {
            if kind != RoutineKind::Trampoline {
                return Err(RoutineError::SelfPatchOnMethod(name));
            }
            let fits = patch
                .offset
                .checked_add(patch.length)
                .is_some_and(|end| end <= bytes.len());
            if !fits || patch.length < Isa::INSTRUCTION_SIZE || patch.length % 4 != 0 {
                return Err(RoutineError::BadSelfPatch {
                    name,
                    offset: patch.offset,
                    length: patch.length,
                });
            }
        }
        Ok(Self {
            name,
            bytes,
            original_address,
            direct_calls,
            kind,
            self_patch,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn original_address(&self) -> u64 {
        self.original_address
    }

    /// One past the last byte, in the original address space.
    pub fn end_address(&self) -> u64 {
        self.original_address + self.bytes.len() as u64
    }

    pub fn contains(&self, address: u64) -> bool {
        (self.original_address..self.end_address()).contains(&address)
    }

    pub fn direct_calls(&self) -> &[CallSite] {
        &self.direct_calls
    }

    /// Check that every call site fits inside the code for `isa`.
    pub fn check_call_sites(&self, isa: Isa) -> Result<(), RoutineError> {
        for call in &self.direct_calls {
            let width = isa.call_site_width(&self.bytes, call.site_offset, call.kind);
            if call.site_offset + width > self.bytes.len() {
                return Err(RoutineError::SiteOutOfBounds {
                    name: self.name.clone(),
                    offset: call.site_offset,
                    length: self.bytes.len(),
                });
            }
        }
        Ok(())
    }

    pub fn kind(&self) -> RoutineKind {
        self.kind
    }

    pub fn is_trampoline(&self) -> bool {
        self.kind == RoutineKind::Trampoline
    }

    pub fn self_patch(&self) -> Option<SelfPatch> {
        self.self_patch
    }

    /// Neutralize the trampoline's lazy binding for execution outside the VM.
    ///
    /// The self-patch region becomes a direct jump to the known target
    /// (recorded as a `Jump` call site, to be relocated like any other)
    /// followed by no-ops, or a plain return when no target is known.
    /// Call sites inside the region disappear with it. Methods and already
    /// fixed-up trampolines are returned unchanged.
    pub fn offline_fixup(mut self, isa: Isa) -> Self {
        let Some(patch) = self.self_patch.take() else {
            return self;
        };
        let region = patch.offset..patch.offset + patch.length;

        self.direct_calls
            .retain(|call| !region.contains(&call.site_offset));
        for offset in region.clone().step_by(Isa::INSTRUCTION_SIZE) {
            write_u32(&mut self.bytes, offset, isa.nop());
        }

        match patch.resolves_to {
            Some(target) => {
                write_u32(&mut self.bytes, patch.offset, isa.placeholder_jump());
                self.direct_calls.push(CallSite {
                    site_offset: patch.offset,
                    target_address: target,
                    kind: CallKind::Jump,
                    via_trampoline: false,
                });
            }
            None => write_u32(&mut self.bytes, patch.offset, isa.ret()),
        }
        tracing::debug!(
            routine = %self.name,
            target = ?patch.resolves_to,
            "neutralized trampoline self-patch region"
        );
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::isa::{aarch64, read_u32};

    fn words(bytes: &[u8]) -> Vec<u32> {
        (0..bytes.len())
            .step_by(4)
            .map(|i| read_u32(bytes, i).unwrap())
            .collect()
    }

    fn trampoline(resolves_to: Option<u64>) -> CompiledRoutine {
        let mut bytes = Vec::new();
        // stp; bl resolver; ldp; br x16; resolver: ret
        for word in [0xA9BF7BFDu32, 0x94000004, 0xA8C17BFD, 0xD61F0200, aarch64::RET] {
            bytes.extend_from_slice(&word.to_le_bytes());
        }
        CompiledRoutine::trampoline(
            "trampoline",
            0x1000,
            bytes,
            vec![CallSite::call(4, 0x1010)],
            Some(SelfPatch {
                offset: 0,
                length: 16,
                resolves_to,
            }),
        )
        .unwrap()
    }

    #[test]
    fn test_validation() {
        assert_eq!(
            CompiledRoutine::method("m", 0, vec![], vec![]),
            Err(RoutineError::Empty("m".to_string()))
        );
        assert!(matches!(
            CompiledRoutine::method("m", 0, vec![0; 8], vec![CallSite::call(8, 0)]),
            Err(RoutineError::SiteOutOfBounds { offset: 8, .. })
        ));
        assert!(matches!(
            CompiledRoutine::method("m", 0, vec![0; 8], vec![CallSite::call(6, 0)]),
            Err(RoutineError::SiteOutOfBounds { offset: 6, .. })
        ));
        assert!(matches!(
            CompiledRoutine::method("m", u64::MAX - 2, vec![0; 8], vec![]),
            Err(RoutineError::AddressOverflow { .. })
        ));
        let patch = SelfPatch {
            offset: 4,
            length: 8,
            resolves_to: None,
        };
        assert!(matches!(
            CompiledRoutine::new("m".into(), 0, vec![0; 8], vec![], RoutineKind::Method, Some(patch)),
            Err(RoutineError::SelfPatchOnMethod(_))
        ));
        assert!(matches!(
            CompiledRoutine::trampoline("t", 0, vec![0; 8], vec![], Some(patch)),
            Err(RoutineError::BadSelfPatch { .. })
        ));
    }

    #[test]
    fn test_fixup_with_known_target() {
        let fixed = trampoline(Some(0x2000)).offline_fixup(Isa::Aarch64);

        assert_eq!(fixed.self_patch(), None);
        assert_eq!(
            &words(fixed.bytes())[..4],
            &[0x14000000, aarch64::NOP, aarch64::NOP, aarch64::NOP]
        );
        // the resolver call inside the region is gone; the new jump replaces it
        assert_eq!(
            fixed.direct_calls(),
            &[CallSite {
                site_offset: 0,
                target_address: 0x2000,
                kind: CallKind::Jump,
                via_trampoline: false,
            }]
        );
    }

    #[test]
    fn test_fixup_without_target_returns() {
        let fixed = trampoline(None).offline_fixup(Isa::Armv7);
        assert_eq!(words(fixed.bytes())[0], Isa::Armv7.ret());
        assert!(fixed.direct_calls().is_empty());
    }

    #[test]
    fn test_fixup_is_idempotent() {
        let once = trampoline(Some(0x2000)).offline_fixup(Isa::Aarch64);
        let twice = once.clone().offline_fixup(Isa::Aarch64);
        assert_eq!(once, twice);
    }
}
