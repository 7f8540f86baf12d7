//! Error channels of a harness run.
//!
//! `FatalError` aborts a compilation (or, for stale driver state, the whole
//! run). `VectorError` only ever aborts the one test vector it came from.

use crate::driver::{BackendError, BackendId};
use crate::link::LinkError;
use serde::Serialize;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FatalError {
    #[error("stale compiler state before `{method}` ({backend}): {reason}")]
    DriverState {
        method: String,
        backend: BackendId,
        reason: String,
    },
    #[error("failed to compile `{method}` ({backend}): {source}")]
    Compile {
        method: String,
        backend: BackendId,
        #[source]
        source: BackendError,
    },
    #[error("failed to link `{method}` ({backend}): {source}")]
    Link {
        method: String,
        backend: BackendId,
        #[source]
        source: LinkError,
    },
}

impl FatalError {
    /// Stale driver state poisons every later compilation.
    pub fn aborts_run(&self) -> bool {
        matches!(self, FatalError::DriverState { .. })
    }
}

/// Toolchain step that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Assemble,
    Link,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Assemble => f.write_str("assembler"),
            Stage::Link => f.write_str("linker"),
        }
    }
}

/// Output captured from a subprocess.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CapturedOutput {
    pub stdout: String,
    pub stderr: String,
}

impl CapturedOutput {
    pub fn is_empty(&self) -> bool {
        self.stdout.trim().is_empty() && self.stderr.trim().is_empty()
    }
}

#[derive(Debug, Error)]
pub enum VectorError {
    #[error("unsupported signature: {0}")]
    UnsupportedSignature(String),
    #[error("{stage} failed: {reason}")]
    Toolchain {
        stage: Stage,
        reason: String,
        output: CapturedOutput,
    },
    #[error("simulation failed: {reason}")]
    Simulation {
        reason: String,
        output: CapturedOutput,
        dump: Option<String>,
    },
}

impl VectorError {
    pub fn output(&self) -> Option<&CapturedOutput> {
        match self {
            VectorError::UnsupportedSignature(_) => None,
            VectorError::Toolchain { output, .. } | VectorError::Simulation { output, .. } => {
                Some(output)
            }
        }
    }

    pub fn dump(&self) -> Option<&str> {
        match self {
            VectorError::Simulation { dump, .. } => dump.as_deref(),
            _ => None,
        }
    }
}
