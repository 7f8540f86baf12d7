//! Differential test runs.
//!
//! For every backend and every suite operation the harness opens a fresh
//! compilation session, links it, and executes each vector through the
//! simulator. Compile and link failures end the operation; stale driver state
//! ends the run. A vector's own failure never touches its siblings.

use crate::abi::stub::{StubLayout, build_invocation_stub};
use crate::config::HarnessConfig;
use crate::driver::{BackendId, Driver};
use crate::error::FatalError;
use crate::isa::Isa;
use crate::kind::Value;
use crate::link::{LinkedImage, Linker};
use crate::oracle::{self, Verdict};
use crate::sim::Simulator;
use crate::suite::{Suite, SuiteOperation};
use serde::Serialize;
use std::fmt::Write;
use tracing::{debug, info, warn};

/// How an operation got on before its vectors ran.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum OperationStatus {
    Linked { base: u64, size: u64, entry: u64 },
    CompileFailed { reason: String },
    LinkFailed { reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VectorReport {
    pub index: usize,
    pub arguments: Vec<Value>,
    pub verdict: Verdict,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OperationReport {
    pub name: String,
    pub backend: BackendId,
    pub status: OperationStatus,
    pub vectors: Vec<VectorReport>,
}

/// Vector and operation counts of a report.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Tally {
    pub passed: usize,
    pub failed: usize,
    pub errors: usize,
    /// Operations that never got to run their vectors
    pub not_run: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Report {
    pub target: Isa,
    pub operations: Vec<OperationReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aborted: Option<String>,
}

impl Report {
    pub fn new(target: Isa) -> Self {
        Self {
            target,
            operations: Vec::new(),
            aborted: None,
        }
    }

    pub fn tally(&self) -> Tally {
        let mut tally = Tally::default();
        for op in &self.operations {
            if !matches!(op.status, OperationStatus::Linked { .. }) {
                tally.not_run += 1;
            }
            for vector in &op.vectors {
                match vector.verdict {
                    Verdict::Pass => tally.passed += 1,
                    Verdict::Fail { .. } => tally.failed += 1,
                    Verdict::Error { .. } => tally.errors += 1,
                }
            }
        }
        tally
    }

    /// True when the run finished and every vector passed.
    pub fn passed(&self) -> bool {
        let tally = self.tally();
        self.aborted.is_none() && tally.failed == 0 && tally.errors == 0 && tally.not_run == 0
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    pub fn render_human(&self) -> String {
        let mut out = String::new();
        for op in &self.operations {
            let _ = match &op.status {
                OperationStatus::Linked { base, size, entry } => writeln!(
                    out,
                    "{} ({}): linked {} bytes at 0x{:x}, entry +0x{:x}",
                    op.name, op.backend, size, base, entry
                ),
                OperationStatus::CompileFailed { reason } => {
                    writeln!(out, "{} ({}): ✗ {}", op.name, op.backend, reason)
                }
                OperationStatus::LinkFailed { reason } => {
                    writeln!(out, "{} ({}): ✗ {}", op.name, op.backend, reason)
                }
            };
            for vector in &op.vectors {
                let args = vector
                    .arguments
                    .iter()
                    .map(|v| v.to_string())
                    .collect::<Vec<_>>()
                    .join(", ");
                let _ = match &vector.verdict {
                    Verdict::Pass => writeln!(out, "  ✓ #{} ({})", vector.index, args),
                    Verdict::Fail { expected, actual } => writeln!(
                        out,
                        "  ✗ #{} ({}): expected {}, got {}",
                        vector.index, args, expected, actual
                    ),
                    Verdict::Error {
                        message,
                        dump,
                        output,
                    } => {
                        let _ = writeln!(out, "  ✗ #{} ({}): {}", vector.index, args, message);
                        if let Some(output) = output {
                            indent(&mut out, "stdout", &output.stdout);
                            indent(&mut out, "stderr", &output.stderr);
                        }
                        if let Some(dump) = dump {
                            indent(&mut out, "dump", dump);
                        }
                        Ok(())
                    }
                };
            }
        }

        let tally = self.tally();
        let _ = writeln!(
            out,
            "\n{} passed, {} failed, {} errors, {} operations not run",
            tally.passed, tally.failed, tally.errors, tally.not_run
        );
        if let Some(reason) = &self.aborted {
            let _ = writeln!(out, "run aborted: {}", reason);
        }
        out
    }
}

/// Drives compilation, linking and simulation for a suite.
pub struct Harness {
    driver: Driver,
    linker: Linker,
    layout: StubLayout,
}

impl Harness {
    pub fn new(driver: Driver, config: &HarnessConfig) -> Self {
        let linker = Linker::new(driver.isa()).with_max_image_size(config.max_image_size);
        Self {
            driver,
            linker,
            layout: config.layout,
        }
    }

    pub fn isa(&self) -> Isa {
        self.driver.isa()
    }

    /// Compile and link `method` without running anything.
    pub fn link_method(&mut self, method: &str, backend: BackendId) -> Result<LinkedImage, FatalError> {
        self.driver.open_session(method, backend)?.link(&self.linker)
    }

    pub fn run(
        &mut self,
        suite: &Suite,
        backends: &[BackendId],
        simulator: &mut dyn Simulator,
    ) -> Report {
        let mut report = Report::new(self.isa());
        for &backend in backends {
            for op in &suite.operations {
                match self.run_operation(op, backend, simulator) {
                    Ok(op_report) => report.operations.push(op_report),
                    Err(e) if e.aborts_run() => {
                        warn!(error = %e, "aborting run");
                        report.aborted = Some(e.to_string());
                        return report;
                    }
                    Err(e) => {
                        warn!(error = %e, "operation not run");
                        let status = match e {
                            FatalError::Link { .. } => OperationStatus::LinkFailed {
                                reason: e.to_string(),
                            },
                            _ => OperationStatus::CompileFailed {
                                reason: e.to_string(),
                            },
                        };
                        report.operations.push(OperationReport {
                            name: op.name.clone(),
                            backend,
                            status,
                            vectors: Vec::new(),
                        });
                    }
                }
            }
        }
        report
    }

    fn run_operation(
        &mut self,
        op: &SuiteOperation,
        backend: BackendId,
        simulator: &mut dyn Simulator,
    ) -> Result<OperationReport, FatalError> {
        let image = self.link_method(&op.name, backend)?;
        info!(
            operation = %op.name,
            %backend,
            base = format_args!("{:#x}", image.buffer.base()),
            size = image.buffer.size(),
            vectors = op.vectors.len(),
            "linked"
        );

        let vectors = op
            .vectors
            .iter()
            .enumerate()
            .map(|(index, vector)| {
                let verdict = self.run_vector(op, index, &image, simulator);
                debug!(operation = %op.name, index, ?verdict, "vector");
                VectorReport {
                    index,
                    arguments: vector.args.clone(),
                    verdict,
                }
            })
            .collect();

        Ok(OperationReport {
            name: op.name.clone(),
            backend,
            status: OperationStatus::Linked {
                base: image.buffer.base(),
                size: image.buffer.size(),
                entry: image.entry.offset,
            },
            vectors,
        })
    }

    fn run_vector(
        &self,
        op: &SuiteOperation,
        index: usize,
        image: &LinkedImage,
        simulator: &mut dyn Simulator,
    ) -> Verdict {
        let expected = match op.expected(index) {
            Ok(value) => value,
            Err(e) => {
                return Verdict::Error {
                    message: e.to_string(),
                    dump: None,
                    output: None,
                };
            }
        };

        let outcome = build_invocation_stub(
            self.isa(),
            &op.signature,
            &op.vectors[index],
            image.entry,
            image.buffer.base(),
            &self.layout,
        )
        .and_then(|stub| simulator.run(&stub, image.buffer.bytes()));

        match outcome {
            Ok(snapshot) => oracle::check(&expected, &snapshot, op.signature.ret, self.isa()),
            Err(e) => Verdict::Error {
                message: e.to_string(),
                dump: e.dump().map(str::to_string),
                output: e.output().filter(|output| !output.is_empty()).cloned(),
            },
        }
    }
}

fn indent(out: &mut String, label: &str, text: &str) {
    if text.trim().is_empty() {
        return;
    }
    let _ = writeln!(out, "    {}:", label);
    for line in text.lines() {
        let _ = writeln!(out, "      {}", line);
    }
}

/// Human-readable layout of a linked image.
pub fn render_layout(image: &LinkedImage) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "buffer: 0x{:x}..0x{:x} ({} bytes), entry +0x{:x}",
        image.buffer.base(),
        image.buffer.limit(),
        image.buffer.size(),
        image.entry.offset
    );
    for placement in &image.placements {
        let _ = writeln!(
            out,
            "  +0x{:06x} {:<10} {} ({} bytes)",
            placement.offset,
            format!("{:?}", placement.kind).to_lowercase(),
            placement.name,
            placement.length
        );
    }
    for call in &image.calls {
        let _ = writeln!(
            out,
            "  call {}: +0x{:x} -> +0x{:x}",
            call.routine, call.site, call.target
        );
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Report {
        let mut report = Report::new(Isa::Aarch64);
        report.operations.push(OperationReport {
            name: "iadd".to_string(),
            backend: BackendId::Baseline,
            status: OperationStatus::Linked {
                base: 0x1000,
                size: 64,
                entry: 0,
            },
            vectors: vec![
                VectorReport {
                    index: 0,
                    arguments: vec![Value::Int(1), Value::Int(2)],
                    verdict: Verdict::Pass,
                },
                VectorReport {
                    index: 1,
                    arguments: vec![Value::Int(2), Value::Int(2)],
                    verdict: Verdict::Fail {
                        expected: Value::Int(4),
                        actual: Value::Int(5),
                    },
                },
            ],
        });
        report.operations.push(OperationReport {
            name: "isub".to_string(),
            backend: BackendId::Baseline,
            status: OperationStatus::CompileFailed {
                reason: "boom".to_string(),
            },
            vectors: Vec::new(),
        });
        report
    }

    #[test]
    fn test_tally() {
        let report = sample();
        assert_eq!(
            report.tally(),
            Tally {
                passed: 1,
                failed: 1,
                errors: 0,
                not_run: 1
            }
        );
        assert!(!report.passed());
        assert!(Report::new(Isa::Armv7).passed());
    }

    #[test]
    fn test_render_human() {
        let text = sample().render_human();
        assert!(text.contains("iadd (baseline): linked 64 bytes at 0x1000"));
        assert!(text.contains("  ✓ #0 (1, 2)"));
        assert!(text.contains("  ✗ #1 (2, 2): expected 4, got 5"));
        assert!(text.contains("isub (baseline): ✗ boom"));
        assert!(text.contains("1 passed, 1 failed, 0 errors, 1 operations not run"));
    }

    #[test]
    fn test_json_shape() {
        let json: serde_json::Value = serde_json::from_str(&sample().to_json().unwrap()).unwrap();
        assert_eq!(json["target"], "aarch64");
        assert_eq!(json["operations"][0]["backend"], "baseline");
        assert_eq!(json["operations"][0]["status"]["outcome"], "linked");
        assert_eq!(json["operations"][0]["vectors"][1]["verdict"]["status"], "fail");
        assert_eq!(json["operations"][1]["status"]["outcome"], "compile_failed");
        assert!(json.get("aborted").is_none());
    }
}
