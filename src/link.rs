//! Relocation and linking.
//!
//! The linker lays a set of compiled routines out in one zero-filled buffer
//! that spans exactly `[base, limit)` of the original address space, then
//! rewrites every direct call so it lands on the buffer copy of its target.
//! Once linked, no patched call refers to anything outside the buffer.

use crate::isa::{Isa, PatchError};
use crate::routine::{CompiledRoutine, RoutineError, RoutineKind};
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

/// Upper bound on a linked image unless configured otherwise.
pub const DEFAULT_MAX_IMAGE_SIZE: u64 = 16 * 1024 * 1024;

#[derive(Debug, Error, PartialEq)]
pub enum LinkError {
    #[error("no routines to link")]
    NoRoutines,
    #[error("routine `{0}` appears more than once")]
    DuplicateRoutine(String),
    #[error("entry method `{0}` is not among the compiled routines")]
    UnknownEntry(String),
    #[error("routines `{first}` and `{second}` overlap")]
    Overlap { first: String, second: String },
    #[error(
        "`{routine}` calls 0x{target:x} through the trampoline, but no trampoline was compiled"
    )]
    MissingTrampoline { routine: String, target: u64 },
    #[error(
        "relocation gap: call at `{routine}`+{site_offset} targets 0x{target:x}, outside [0x{base:x}, 0x{limit:x})"
    )]
    OutOfRange {
        routine: String,
        site_offset: usize,
        target: u64,
        base: u64,
        limit: u64,
    },
    #[error(
        "relocation gap: call at `{routine}`+{site_offset} targets 0x{target:x}, which no routine covers"
    )]
    Unmapped {
        routine: String,
        site_offset: usize,
        target: u64,
    },
    #[error("image of {size} bytes exceeds the {max} byte limit")]
    ImageTooLarge { size: u64, max: u64 },
    #[error("cannot patch call at `{routine}`+{site_offset}: {source}")]
    Patch {
        routine: String,
        site_offset: usize,
        #[source]
        source: PatchError,
    },
    #[error(transparent)]
    Routine(#[from] RoutineError),
    #[error("entry point at offset {offset} does not fit in a {size} byte image")]
    EntryOutOfBounds { offset: u64, size: u64 },
}

/// Contiguous copy of all linked routines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelocationBuffer {
    base: u64,
    bytes: Vec<u8>,
}

impl RelocationBuffer {
    /// Lowest original address covered by the buffer.
    pub fn base(&self) -> u64 {
        self.base
    }

    pub fn size(&self) -> u64 {
        self.bytes.len() as u64
    }

    /// One past the highest original address covered by the buffer.
    pub fn limit(&self) -> u64 {
        self.base + self.size()
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }
}

/// Buffer-relative offset of the method under test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EntryPoint {
    pub offset: u64,
}

/// Where a routine ended up in the buffer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Placement {
    pub name: String,
    pub kind: RoutineKind,
    pub offset: u64,
    pub length: usize,
}

/// A call site after patching, in buffer offsets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PatchedCall {
    pub routine: String,
    pub site: u64,
    pub target: u64,
}

/// Result of linking one compilation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkedImage {
    pub buffer: RelocationBuffer,
    pub entry: EntryPoint,
    pub placements: Vec<Placement>,
    pub calls: Vec<PatchedCall>,
}

/// Lays routines out in a relocation buffer.
#[derive(Debug, Clone)]
pub struct Linker {
    isa: Isa,
    max_image_size: u64,
}

impl Linker {
    pub fn new(isa: Isa) -> Self {
        Self {
            isa,
            max_image_size: DEFAULT_MAX_IMAGE_SIZE,
        }
    }

    pub fn with_max_image_size(mut self, max: u64) -> Self {
        self.max_image_size = max;
        self
    }

    pub fn isa(&self) -> Isa {
        self.isa
    }

    /// Link `routines` into one buffer with `test_method` as the entry point.
    pub fn link(
        &self,
        routines: Vec<CompiledRoutine>,
        test_method: &str,
    ) -> Result<LinkedImage, LinkError> {
        if routines.is_empty() {
            return Err(LinkError::NoRoutines);
        }

        let routines: Vec<CompiledRoutine> = routines
            .into_iter()
            .map(|r| r.offline_fixup(self.isa))
            .collect();

        check_names(&routines)?;
        check_trampoline(&routines)?;
        for routine in &routines {
            routine.check_call_sites(self.isa)?;
        }

        let targets = routines
            .iter()
            .flat_map(|r| r.direct_calls().iter().map(|c| c.target_address));
        let base = routines
            .iter()
            .map(|r| r.original_address())
            .chain(targets.clone())
            .min()
            .ok_or(LinkError::NoRoutines)?;
        let limit = routines
            .iter()
            .map(|r| r.end_address())
            .chain(targets)
            .max()
            .ok_or(LinkError::NoRoutines)?;

        check_overlaps(&routines)?;
        check_targets(&routines, base, limit)?;

        let size = limit - base;
        if size > self.max_image_size {
            return Err(LinkError::ImageTooLarge {
                size,
                max: self.max_image_size,
            });
        }

        let mut bytes = vec![0u8; size as usize];
        let mut placements = Vec::with_capacity(routines.len());
        for routine in &routines {
            let offset = routine.original_address() - base;
            let start = offset as usize;
            bytes[start..start + routine.len()].copy_from_slice(routine.bytes());
            placements.push(Placement {
                name: routine.name().to_string(),
                kind: routine.kind(),
                offset,
                length: routine.len(),
            });
        }

        let mut calls = Vec::new();
        for routine in &routines {
            let routine_offset = routine.original_address() - base;
            for call in routine.direct_calls() {
                let site = routine_offset + call.site_offset as u64;
                let target = call.target_address - base;
                let disp = target as i64 - site as i64;
                self.isa
                    .patch_call(&mut bytes, site as usize, call.kind, disp)
                    .map_err(|source| LinkError::Patch {
                        routine: routine.name().to_string(),
                        site_offset: call.site_offset,
                        source,
                    })?;
                calls.push(PatchedCall {
                    routine: routine.name().to_string(),
                    site,
                    target,
                });
            }
        }

        let entry_routine = routines
            .iter()
            .find(|r| r.name() == test_method)
            .ok_or_else(|| LinkError::UnknownEntry(test_method.to_string()))?;
        let entry = EntryPoint {
            offset: entry_routine.original_address() - base,
        };
        if entry.offset + Isa::INSTRUCTION_SIZE as u64 > size {
            return Err(LinkError::EntryOutOfBounds {
                offset: entry.offset,
                size,
            });
        }

        debug!(
            base = format_args!("{:#x}", base),
            limit = format_args!("{:#x}", limit),
            size,
            routines = routines.len(),
            calls = calls.len(),
            entry = entry.offset,
            "linked relocation buffer"
        );

        Ok(LinkedImage {
            buffer: RelocationBuffer { base, bytes },
            entry,
            placements,
            calls,
        })
    }
}

fn check_names(routines: &[CompiledRoutine]) -> Result<(), LinkError> {
    let mut seen = std::collections::HashSet::new();
    for routine in routines {
        if !seen.insert(routine.name()) {
            return Err(LinkError::DuplicateRoutine(routine.name().to_string()));
        }
    }
    Ok(())
}

fn check_trampoline(routines: &[CompiledRoutine]) -> Result<(), LinkError> {
    if routines.iter().any(|r| r.is_trampoline()) {
        return Ok(());
    }
    for routine in routines {
        if let Some(call) = routine.direct_calls().iter().find(|c| c.via_trampoline) {
            return Err(LinkError::MissingTrampoline {
                routine: routine.name().to_string(),
                target: call.target_address,
            });
        }
    }
    Ok(())
}

fn check_overlaps(routines: &[CompiledRoutine]) -> Result<(), LinkError> {
    let mut sorted: Vec<&CompiledRoutine> = routines.iter().collect();
    sorted.sort_by_key(|r| r.original_address());
    for pair in sorted.windows(2) {
        if pair[0].end_address() > pair[1].original_address() {
            return Err(LinkError::Overlap {
                first: pair[0].name().to_string(),
                second: pair[1].name().to_string(),
            });
        }
    }
    Ok(())
}

fn check_targets(routines: &[CompiledRoutine], base: u64, limit: u64) -> Result<(), LinkError> {
    for routine in routines {
        for call in routine.direct_calls() {
            let target = call.target_address;
            if !(base..limit).contains(&target) {
                return Err(LinkError::OutOfRange {
                    routine: routine.name().to_string(),
                    site_offset: call.site_offset,
                    target,
                    base,
                    limit,
                });
            }
            if !routines.iter().any(|r| r.contains(target)) {
                return Err(LinkError::Unmapped {
                    routine: routine.name().to_string(),
                    site_offset: call.site_offset,
                    target,
                });
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::isa::{aarch64, armv7};
    use crate::routine::{CallSite, SelfPatch};

    fn code(words: &[u32]) -> Vec<u8> {
        words.iter().flat_map(|w| w.to_le_bytes()).collect()
    }

    fn method(name: &str, address: u64, words: &[u32], calls: Vec<CallSite>) -> CompiledRoutine {
        CompiledRoutine::method(name, address, code(words), calls).unwrap()
    }

    #[test]
    fn test_base_and_limit() {
        let callee = method("callee", 0x2000, &[aarch64::RET], vec![]);
        // the call encodes the original, VM-relative displacement
        let caller = method(
            "caller",
            0x1000,
            &[0x94000400, aarch64::RET],
            vec![CallSite::call(0, 0x2000)],
        );
        let image = Linker::new(Isa::Aarch64)
            .link(vec![callee, caller], "caller")
            .unwrap();

        assert_eq!(image.buffer.base(), 0x1000);
        assert_eq!(image.buffer.size(), 0x1004);
        assert_eq!(image.entry.offset, 0);
        assert_eq!(Isa::Aarch64.decode_call(image.buffer.bytes(), 0), Some(0x1000));
        assert_eq!(
            image.calls,
            vec![PatchedCall {
                routine: "caller".to_string(),
                site: 0,
                target: 0x1000,
            }]
        );
    }

    #[test]
    fn test_gap_outside_range() {
        let caller = method(
            "caller",
            0x1000,
            &[0x94000000, aarch64::RET],
            vec![CallSite::call(0, 0x9000)],
        );
        let err = Linker::new(Isa::Aarch64)
            .link(vec![caller], "caller")
            .unwrap_err();
        assert!(matches!(err, LinkError::OutOfRange { target: 0x9000, .. }));
    }

    #[test]
    fn test_gap_between_routines() {
        let a = method(
            "a",
            0x1000,
            &[0x94000000, aarch64::RET],
            vec![CallSite::call(0, 0x1800)],
        );
        let b = method("b", 0x2000, &[aarch64::RET], vec![]);
        let err = Linker::new(Isa::Aarch64).link(vec![a, b], "a").unwrap_err();
        assert!(matches!(err, LinkError::Unmapped { target: 0x1800, .. }));
    }

    #[test]
    fn test_missing_trampoline() {
        let caller = method(
            "caller",
            0x1000,
            &[0x94000000, aarch64::RET],
            vec![CallSite {
                via_trampoline: true,
                ..CallSite::call(0, 0x1004)
            }],
        );
        let err = Linker::new(Isa::Aarch64)
            .link(vec![caller], "caller")
            .unwrap_err();
        assert!(matches!(err, LinkError::MissingTrampoline { .. }));
    }

    #[test]
    fn test_trampoline_is_fixed_up() {
        let callee = method("callee", 0x3000, &[aarch64::RET], vec![]);
        let caller = method(
            "caller",
            0x2000,
            &[0x94000000, aarch64::RET],
            vec![CallSite {
                via_trampoline: true,
                ..CallSite::call(0, 0x1000)
            }],
        );
        let trampoline = CompiledRoutine::trampoline(
            "trampoline",
            0x1000,
            code(&[0xA9BF7BFD, 0x94000000, 0xA8C17BFD, 0xD61F0200]),
            vec![CallSite::call(4, 0x3000)],
            Some(SelfPatch {
                offset: 0,
                length: 16,
                resolves_to: Some(0x3000),
            }),
        )
        .unwrap();

        let image = Linker::new(Isa::Aarch64)
            .link(vec![trampoline, caller, callee], "caller")
            .unwrap();
        let bytes = image.buffer.bytes();
        // caller -> trampoline -> callee
        assert_eq!(Isa::Aarch64.decode_call(bytes, 0x1000), Some(-0x1000));
        assert_eq!(Isa::Aarch64.decode_call(bytes, 0), Some(0x2000));
        assert_eq!(crate::isa::read_u32(bytes, 4), Some(aarch64::NOP));
    }

    #[test]
    fn test_overlap_and_duplicates() {
        let a = method("a", 0x1000, &[aarch64::NOP, aarch64::RET], vec![]);
        let b = method("b", 0x1004, &[aarch64::RET], vec![]);
        let err = Linker::new(Isa::Aarch64)
            .link(vec![a.clone(), b], "a")
            .unwrap_err();
        assert!(matches!(err, LinkError::Overlap { .. }));

        let err = Linker::new(Isa::Aarch64)
            .link(vec![a.clone(), a], "a")
            .unwrap_err();
        assert_eq!(err, LinkError::DuplicateRoutine("a".to_string()));
    }

    #[test]
    fn test_image_size_limit_and_entry() {
        let a = method("a", 0x1000, &[aarch64::RET], vec![]);
        let b = method("b", 0x9000, &[aarch64::RET], vec![]);
        let err = Linker::new(Isa::Aarch64)
            .with_max_image_size(0x1000)
            .link(vec![a.clone(), b], "a")
            .unwrap_err();
        assert!(matches!(err, LinkError::ImageTooLarge { size: 0x8004, .. }));

        let err = Linker::new(Isa::Aarch64).link(vec![a], "b").unwrap_err();
        assert_eq!(err, LinkError::UnknownEntry("b".to_string()));
    }

    #[test]
    fn test_truncated_call_sequence() {
        let caller = method(
            "caller",
            0x1000,
            &[armv7::NOP, armv7::movw(armv7::IP, 0)],
            vec![CallSite::call(4, 0x1000)],
        );
        let err = Linker::new(Isa::Armv7).link(vec![caller], "caller").unwrap_err();
        assert_eq!(
            err,
            LinkError::Routine(RoutineError::SiteOutOfBounds {
                name: "caller".to_string(),
                offset: 4,
                length: 8,
            })
        );
    }
}
