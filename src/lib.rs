//! crossjit - offline relocation, linking and differential execution of JIT code
//!
//! This library links the routines a JIT backend produced into a standalone
//! image, wraps them in an ABI-correct invocation stub, runs them under a
//! simulator and compares the results against host reference semantics.

pub mod abi;
pub mod config;
pub mod driver;
pub mod error;
pub mod harness;
pub mod isa;
pub mod kind;
pub mod link;
pub mod oracle;
pub mod process;
pub mod routine;
pub mod sim;
pub mod suite;

// Re-export commonly used types
pub use config::HarnessConfig;
pub use driver::{BackendId, CompilerBackend, Driver};
pub use error::{FatalError, VectorError};
pub use harness::{Harness, Report};
pub use isa::Isa;
pub use kind::{Kind, Signature, TestVector, Value};
pub use link::{LinkedImage, Linker};
pub use oracle::Verdict;
pub use suite::Suite;
