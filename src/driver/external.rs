//! Backend that shells out to a compiler command.
//!
//! The command prints a JSON manifest on stdout:
//!
//! ```json
//! {"routines": [{"name": "test", "kind": "method", "address": "0x10000000",
//!   "code": "<base64>", "calls": [{"offset": 8, "target": 4096, "kind": "call"}]}]}
//! ```
//!
//! Addresses may be JSON numbers or `0x` strings. The reset command prints
//! `{"start": .., "used": ..}` for the boot code region.

use super::{BackendError, BackendId, BootRegion, CompilerBackend};
use crate::isa::Isa;
use crate::process;
use crate::routine::{CallKind, CallSite, CompiledRoutine, RoutineKind, SelfPatch};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Address {
    Number(u64),
    Text(String),
}

impl Address {
    fn value(&self) -> Result<u64, BackendError> {
        match self {
            Address::Number(n) => Ok(*n),
            Address::Text(text) => {
                let parsed = match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
                    Some(hex) => u64::from_str_radix(hex, 16),
                    None => text.parse(),
                };
                parsed.map_err(|_| BackendError::Malformed(format!("bad address `{}`", text)))
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct Manifest {
    routines: Vec<RoutineEntry>,
}

#[derive(Debug, Deserialize)]
struct RoutineEntry {
    name: String,
    kind: RoutineKind,
    address: Address,
    code: String,
    #[serde(default)]
    calls: Vec<CallEntry>,
    #[serde(default)]
    self_patch: Option<SelfPatchEntry>,
}

#[derive(Debug, Deserialize)]
struct CallEntry {
    offset: usize,
    target: Address,
    #[serde(default = "default_call_kind")]
    kind: CallKind,
    #[serde(default)]
    via_trampoline: bool,
}

fn default_call_kind() -> CallKind {
    CallKind::Call
}

#[derive(Debug, Deserialize)]
struct SelfPatchEntry {
    offset: usize,
    length: usize,
    #[serde(default)]
    resolves_to: Option<Address>,
}

#[derive(Debug, Deserialize)]
struct RegionEntry {
    start: Address,
    used: u64,
}

/// Decode a routine manifest.
pub fn parse_manifest(json: &str) -> Result<Vec<CompiledRoutine>, BackendError> {
    let manifest: Manifest = serde_json::from_str(json)?;
    manifest
        .routines
        .into_iter()
        .map(|entry| {
            let bytes = STANDARD.decode(entry.code.trim()).map_err(|e| {
                BackendError::Malformed(format!("routine `{}`: bad code: {}", entry.name, e))
            })?;
            let calls = entry
                .calls
                .iter()
                .map(|call| {
                    Ok(CallSite {
                        site_offset: call.offset,
                        target_address: call.target.value()?,
                        kind: call.kind,
                        via_trampoline: call.via_trampoline,
                    })
                })
                .collect::<Result<Vec<_>, BackendError>>()?;
            let self_patch = entry
                .self_patch
                .map(|patch| {
                    Ok::<_, BackendError>(SelfPatch {
                        offset: patch.offset,
                        length: patch.length,
                        resolves_to: patch.resolves_to.as_ref().map(Address::value).transpose()?,
                    })
                })
                .transpose()?;
            Ok(CompiledRoutine::new(
                entry.name,
                entry.address.value()?,
                bytes,
                calls,
                entry.kind,
                self_patch,
            )?)
        })
        .collect()
}

/// Decode the reset command's report.
pub fn parse_region(json: &str) -> Result<BootRegion, BackendError> {
    let entry: RegionEntry = serde_json::from_str(json)?;
    Ok(BootRegion {
        start: entry.start.value()?,
        used: entry.used,
    })
}

/// Compiler driven through configured commands.
pub struct ExternalCompiler {
    isa: Isa,
    command: Vec<String>,
    reset: Vec<String>,
    timeout: Duration,
    /// Last trampoline seen in a manifest
    trampoline: Option<CompiledRoutine>,
}

impl ExternalCompiler {
    pub fn new(isa: Isa, command: Vec<String>, reset: Vec<String>, timeout: Duration) -> Self {
        Self {
            isa,
            command,
            reset,
            timeout,
            trampoline: None,
        }
    }

    fn run(&self, argv: Vec<String>) -> Result<String, BackendError> {
        let completed = process::run(&argv, None, self.timeout)
            .map_err(|e| BackendError::Command(e.to_string()))?;
        if !completed.success() {
            return Err(BackendError::Command(format!(
                "`{}` exited with {}: {}",
                argv.join(" "),
                completed.status,
                completed.output.stderr.trim()
            )));
        }
        Ok(completed.output.stdout)
    }
}

impl CompilerBackend for ExternalCompiler {
    fn isa(&self) -> Isa {
        self.isa
    }

    fn reset_boot_region(&mut self) -> Result<BootRegion, BackendError> {
        if self.reset.is_empty() {
            return Ok(BootRegion { start: 0, used: 0 });
        }
        let target = self.isa.name();
        let stdout = self.run(process::render(&self.reset, &[("target", target)]))?;
        parse_region(&stdout)
    }

    fn compile_method(
        &mut self,
        method: &str,
        backend: BackendId,
    ) -> Result<Vec<CompiledRoutine>, BackendError> {
        let argv = process::render(
            &self.command,
            &[
                ("method", method),
                ("backend", backend.name()),
                ("target", self.isa.name()),
            ],
        );
        let stdout = self.run(argv)?;
        let routines = parse_manifest(&stdout)?;
        for routine in &routines {
            routine.check_call_sites(self.isa)?;
        }
        if let Some(trampoline) = routines.iter().find(|r| r.is_trampoline()) {
            self.trampoline = Some(trampoline.clone());
        }
        debug!(method, %backend, routines = routines.len(), "read compiler manifest");
        Ok(routines)
    }

    fn static_trampoline(&mut self) -> Result<CompiledRoutine, BackendError> {
        self.trampoline.clone().ok_or_else(|| {
            BackendError::Malformed("compiler never reported the static trampoline".to_string())
        })
    }
}
