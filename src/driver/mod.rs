//! Compilation driver.
//!
//! The driver owns a compiler backend and hands out one `CompilationSession`
//! per (method, backend) pair. Every session starts from a freshly reset boot
//! code region, so two sessions for the same method produce identical
//! routines.

pub mod external;
#[cfg(feature = "template-backend")]
pub mod template;

use crate::config::{CompilerKind, HarnessConfig};
use crate::error::FatalError;
use crate::isa::codebuf::CodeBufferError;
use crate::isa::Isa;
use crate::link::{LinkedImage, Linker};
use crate::routine::{CompiledRoutine, RoutineError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

/// Which of the two compilers produces the code under test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendId {
    /// Template-driven compiler
    Baseline,
    Optimizing,
}

impl BackendId {
    pub const ALL: [BackendId; 2] = [BackendId::Baseline, BackendId::Optimizing];

    pub fn name(self) -> &'static str {
        match self {
            BackendId::Baseline => "baseline",
            BackendId::Optimizing => "optimizing",
        }
    }
}

impl fmt::Display for BackendId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// State of the compiler's boot code region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootRegion {
    pub start: u64,
    /// Bytes allocated since the last reset
    pub used: u64,
}

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("unknown method `{0}`")]
    UnknownMethod(String),
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("malformed compiler output: {0}")]
    Malformed(String),
    #[error("compiler command failed: {0}")]
    Command(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Routine(#[from] RoutineError),
    #[error(transparent)]
    CodeBuffer(#[from] CodeBufferError),
}

/// A compiler producing code for one target.
pub trait CompilerBackend {
    fn isa(&self) -> Isa;

    /// Clear the boot code region so the next compilation starts from scratch.
    fn reset_boot_region(&mut self) -> Result<BootRegion, BackendError>;

    /// Compile `method` and everything it needs, at the addresses the backend
    /// would use in the live VM.
    fn compile_method(
        &mut self,
        method: &str,
        backend: BackendId,
    ) -> Result<Vec<CompiledRoutine>, BackendError>;

    /// The runtime stub that binds static calls.
    fn static_trampoline(&mut self) -> Result<CompiledRoutine, BackendError>;
}

/// Backend selected by `config.compiler`.
pub fn backend_from_config(config: &HarnessConfig) -> Result<Box<dyn CompilerBackend>, BackendError> {
    match config.compiler.kind {
        CompilerKind::External => Ok(Box::new(external::ExternalCompiler::new(
            config.target,
            config.compiler.command.clone(),
            config.compiler.reset.clone(),
            Duration::from_secs(config.timeout_secs),
        ))),
        #[cfg(feature = "template-backend")]
        CompilerKind::Template => Ok(Box::new(template::TemplateBackend::for_target(
            config.target,
        )?)),
        #[cfg(not(feature = "template-backend"))]
        CompilerKind::Template => Err(BackendError::Unsupported(
            "built without the template backend".to_string(),
        )),
    }
}

pub struct Driver {
    backend: Box<dyn CompilerBackend>,
}

impl Driver {
    pub fn new(backend: Box<dyn CompilerBackend>) -> Self {
        Self { backend }
    }

    pub fn isa(&self) -> Isa {
        self.backend.isa()
    }

    /// Reset the backend, compile `method` and collect the routines to link.
    pub fn open_session(
        &mut self,
        method: &str,
        backend: BackendId,
    ) -> Result<CompilationSession, FatalError> {
        let state_error = |reason: String| FatalError::DriverState {
            method: method.to_string(),
            backend,
            reason,
        };
        let compile_error = |source: BackendError| FatalError::Compile {
            method: method.to_string(),
            backend,
            source,
        };

        let region = self
            .backend
            .reset_boot_region()
            .map_err(|e| state_error(format!("boot region reset failed: {}", e)))?;
        if region.used != 0 {
            return Err(state_error(format!(
                "boot region at 0x{:x} still holds {} bytes after reset",
                region.start, region.used
            )));
        }

        let mut routines = self
            .backend
            .compile_method(method, backend)
            .map_err(compile_error)?;
        if routines.is_empty() {
            return Err(compile_error(BackendError::Malformed(
                "compiler produced no routines".to_string(),
            )));
        }

        // methods below the region start were compiled before the reset
        if let Some(stale) = routines
            .iter()
            .find(|r| !r.is_trampoline() && r.original_address() < region.start)
        {
            return Err(state_error(format!(
                "routine `{}` at 0x{:x} lies below the reset boot region at 0x{:x}",
                stale.name(),
                stale.original_address(),
                region.start
            )));
        }

        if !routines.iter().any(|r| r.is_trampoline()) {
            let trampoline = self.backend.static_trampoline().map_err(compile_error)?;
            routines.push(trampoline);
        }

        info!(
            method,
            %backend,
            routines = routines.len(),
            "compiled"
        );
        for routine in &routines {
            debug!(
                name = routine.name(),
                kind = ?routine.kind(),
                address = format_args!("{:#x}", routine.original_address()),
                length = routine.len(),
                calls = routine.direct_calls().len(),
                "routine"
            );
        }

        Ok(CompilationSession {
            method: method.to_string(),
            backend,
            isa: self.backend.isa(),
            region,
            routines,
        })
    }
}

/// Routines compiled after one boot region reset, waiting to be linked.
#[derive(Debug)]
pub struct CompilationSession {
    method: String,
    backend: BackendId,
    isa: Isa,
    region: BootRegion,
    routines: Vec<CompiledRoutine>,
}

impl CompilationSession {
    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn backend(&self) -> BackendId {
        self.backend
    }

    pub fn isa(&self) -> Isa {
        self.isa
    }

    pub fn region(&self) -> BootRegion {
        self.region
    }

    pub fn routines(&self) -> &[CompiledRoutine] {
        &self.routines
    }

    /// Link the session's routines with its method as the entry point.
    pub fn link(self, linker: &Linker) -> Result<LinkedImage, FatalError> {
        if linker.isa() != self.isa {
            return Err(FatalError::DriverState {
                method: self.method,
                backend: self.backend,
                reason: format!(
                    "routines were compiled for {} but the linker targets {}",
                    self.isa,
                    linker.isa()
                ),
            });
        }
        linker
            .link(self.routines, &self.method)
            .map_err(|source| FatalError::Link {
                method: self.method,
                backend: self.backend,
                source,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::isa::aarch64;
    use crate::routine::{CallSite, SelfPatch};

    fn code(words: &[u32]) -> Vec<u8> {
        words.iter().flat_map(|w| w.to_le_bytes()).collect()
    }

    /// Backend replaying canned routines; counts how often it was reset.
    struct Canned {
        region: BootRegion,
        routines: Vec<CompiledRoutine>,
        resets: usize,
    }

    impl Canned {
        fn new(routines: Vec<CompiledRoutine>) -> Self {
            Self {
                region: BootRegion {
                    start: 0x2000,
                    used: 0,
                },
                routines,
                resets: 0,
            }
        }
    }

    impl CompilerBackend for Canned {
        fn isa(&self) -> Isa {
            Isa::Aarch64
        }

        fn reset_boot_region(&mut self) -> Result<BootRegion, BackendError> {
            self.resets += 1;
            Ok(self.region)
        }

        fn compile_method(
            &mut self,
            method: &str,
            _backend: BackendId,
        ) -> Result<Vec<CompiledRoutine>, BackendError> {
            if method == "missing" {
                return Err(BackendError::UnknownMethod(method.to_string()));
            }
            Ok(self.routines.clone())
        }

        fn static_trampoline(&mut self) -> Result<CompiledRoutine, BackendError> {
            Ok(CompiledRoutine::trampoline(
                "trampoline",
                0x1000,
                code(&[aarch64::NOP, aarch64::RET]),
                vec![],
                Some(SelfPatch {
                    offset: 0,
                    length: 4,
                    resolves_to: None,
                }),
            )?)
        }
    }

    fn test_method(address: u64) -> CompiledRoutine {
        CompiledRoutine::method("test", address, code(&[aarch64::RET]), vec![]).unwrap()
    }

    #[test]
    fn test_session_appends_trampoline() {
        let mut driver = Driver::new(Box::new(Canned::new(vec![test_method(0x2000)])));
        let session = driver.open_session("test", BackendId::Baseline).unwrap();
        assert_eq!(session.routines().len(), 2);
        assert!(session.routines()[1].is_trampoline());

        let image = session.link(&Linker::new(Isa::Aarch64)).unwrap();
        assert_eq!(image.buffer.base(), 0x1000);
        assert_eq!(image.entry.offset, 0x1000);
    }

    #[test]
    fn test_dirty_region_is_driver_state_error() {
        let mut backend = Canned::new(vec![test_method(0x2000)]);
        backend.region.used = 64;
        let mut driver = Driver::new(Box::new(backend));
        let err = driver.open_session("test", BackendId::Optimizing).unwrap_err();
        assert!(err.aborts_run());
    }

    #[test]
    fn test_stale_routine_is_driver_state_error() {
        let mut driver = Driver::new(Box::new(Canned::new(vec![test_method(0x1800)])));
        let err = driver.open_session("test", BackendId::Baseline).unwrap_err();
        assert!(matches!(err, FatalError::DriverState { .. }));
    }

    #[test]
    fn test_compile_error_does_not_abort_run() {
        let mut driver = Driver::new(Box::new(Canned::new(vec![test_method(0x2000)])));
        let err = driver.open_session("missing", BackendId::Baseline).unwrap_err();
        assert!(matches!(err, FatalError::Compile { .. }));
        assert!(!err.aborts_run());
    }

    #[test]
    fn test_link_failure_names_method_and_backend() {
        let caller = CompiledRoutine::method(
            "test",
            0x2000,
            code(&[0x94000000, aarch64::RET]),
            vec![CallSite::call(0, 0x9000)],
        )
        .unwrap();
        let mut driver = Driver::new(Box::new(Canned::new(vec![caller])));
        let session = driver.open_session("test", BackendId::Optimizing).unwrap();
        let err = session.link(&Linker::new(Isa::Aarch64)).unwrap_err();
        match err {
            FatalError::Link {
                method, backend, ..
            } => {
                assert_eq!(method, "test");
                assert_eq!(backend, BackendId::Optimizing);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_backend_from_config() {
        let mut config = HarnessConfig::for_target(Isa::Armv7);
        config.compiler.kind = CompilerKind::External;
        config.compiler.command = vec!["jitc".to_string()];
        let backend = backend_from_config(&config).unwrap();
        assert_eq!(backend.isa(), Isa::Armv7);

        config.compiler.kind = CompilerKind::Template;
        assert!(matches!(
            backend_from_config(&config),
            Err(BackendError::Unsupported(_))
        ));
    }
}
