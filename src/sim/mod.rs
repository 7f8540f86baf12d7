//! Simulation executor.
//!
//! Every test vector runs in its own scratch directory:
//!
//! 1. `stub.s`, `code.bin` and `link.ld` are written.
//! 2. The assembler and linker produce `stub.elf`.
//! 3. The simulator runs the image. In `direct` mode it prints the register
//!    dump itself; in `gdb-remote` mode it starts halted behind a gdb stub and
//!    the debugger breaks at `crossjit_stop` and prints the registers.
//!
//! Every spawned process is killed and reaped on every exit path.

pub mod regdump;

use crate::abi::stub::{CODE_FILE, STOP_SYMBOL, StubSource};
use crate::config::{HarnessConfig, SimulatorConfig, SimulatorMode, ToolchainConfig};
use crate::error::{CapturedOutput, Stage, VectorError};
use crate::isa::Isa;
use crate::process::{self, ChildGuard, ProcessError};
use regdump::{RegisterSnapshot, parse_register_dump};
use std::fs;
use std::io;
use std::net::{Ipv4Addr, TcpListener};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tracing::{debug, info, trace};

pub const STUB_FILE: &str = "stub.s";
pub const OBJECT_FILE: &str = "stub.o";
pub const SCRIPT_FILE: &str = "link.ld";
pub const IMAGE_FILE: &str = "stub.elf";
pub const GDB_SCRIPT_FILE: &str = "gdb.cmd";

const PORT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Runs one invocation stub against one relocated code image.
pub trait Simulator {
    fn run(&mut self, stub: &StubSource, code: &[u8]) -> Result<RegisterSnapshot, VectorError>;
}

/// Drives the external toolchain and simulator.
#[derive(Debug, Clone)]
pub struct SimulationExecutor {
    isa: Isa,
    toolchain: ToolchainConfig,
    simulator: SimulatorConfig,
    timeout: Duration,
    keep_scratch: bool,
    scratch_root: Option<PathBuf>,
}

/// Paths of one vector's scratch files.
struct Scratch {
    dir: PathBuf,
}

impl Scratch {
    fn path(&self, file: &str) -> String {
        self.dir.join(file).display().to_string()
    }
}

impl SimulationExecutor {
    pub fn from_config(config: &HarnessConfig) -> Self {
        Self {
            isa: config.target,
            toolchain: config.toolchain.clone(),
            simulator: config.simulator.clone(),
            timeout: Duration::from_secs(config.timeout_secs),
            keep_scratch: config.keep_scratch,
            scratch_root: config.scratch_root.clone(),
        }
    }

    fn create_scratch(&self) -> io::Result<TempDir> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("crossjit-");
        match &self.scratch_root {
            Some(root) => {
                fs::create_dir_all(root)?;
                builder.tempdir_in(root)
            }
            None => builder.tempdir(),
        }
    }

    fn write_inputs(&self, dir: &Path, stub: &StubSource, code: &[u8]) -> io::Result<()> {
        fs::write(dir.join(STUB_FILE), &stub.assembly)?;
        fs::write(dir.join(CODE_FILE), code)?;
        fs::write(dir.join(SCRIPT_FILE), &stub.linker_script)?;
        Ok(())
    }

    fn vars(&self, scratch: &Scratch, port: &str) -> Vec<(&'static str, String)> {
        vec![
            ("source", scratch.path(STUB_FILE)),
            ("object", scratch.path(OBJECT_FILE)),
            ("script", scratch.path(SCRIPT_FILE)),
            ("image", scratch.path(IMAGE_FILE)),
            ("code", scratch.path(CODE_FILE)),
            ("gdb_script", scratch.path(GDB_SCRIPT_FILE)),
            ("scratch", scratch.dir.display().to_string()),
            ("port", port.to_string()),
        ]
    }

    fn render(&self, template: &[String], scratch: &Scratch, port: &str) -> Vec<String> {
        let vars = self.vars(scratch, port);
        let vars: Vec<(&str, &str)> = vars.iter().map(|(k, v)| (*k, v.as_str())).collect();
        process::render(template, &vars)
    }

    fn toolchain_step(
        &self,
        stage: Stage,
        template: &[String],
        scratch: &Scratch,
    ) -> Result<(), VectorError> {
        let argv = self.render(template, scratch, "0");
        let completed = process::run(&argv, Some(&scratch.dir), self.timeout).map_err(|e| {
            VectorError::Toolchain {
                stage,
                reason: e.to_string(),
                output: e.output(),
            }
        })?;
        if !completed.success() {
            return Err(VectorError::Toolchain {
                stage,
                reason: format!("`{}` exited with {}", argv[0], completed.status),
                output: completed.output,
            });
        }
        trace!(%stage, "toolchain step finished");
        Ok(())
    }

    fn simulate_direct(&self, scratch: &Scratch) -> Result<RegisterSnapshot, VectorError> {
        let argv = self.render(&self.simulator.command, scratch, "0");
        let completed = process::run(&argv, Some(&scratch.dir), self.timeout)
            .map_err(simulation_error)?;
        if !completed.success() {
            return Err(VectorError::Simulation {
                reason: format!("simulator exited with {}", completed.status),
                dump: non_empty(&completed.output.stdout),
                output: completed.output,
            });
        }
        parse_dump(self.isa, completed.output)
    }

    fn simulate_gdb(&self, scratch: &Scratch) -> Result<RegisterSnapshot, VectorError> {
        let port = match self.simulator.port {
            0 => free_port().map_err(|e| VectorError::Simulation {
                reason: format!("no free port for the gdb stub: {}", e),
                output: CapturedOutput::default(),
                dump: None,
            })?,
            port => port,
        };
        let port_text = port.to_string();

        let image = scratch.path(IMAGE_FILE);
        fs::write(
            scratch.dir.join(GDB_SCRIPT_FILE),
            gdb_script(self.isa, &image, port),
        )
        .map_err(|e| VectorError::Simulation {
            reason: format!("failed to write gdb script: {}", e),
            output: CapturedOutput::default(),
            dump: None,
        })?;

        // one budget covers both the stub coming up and the debugger session
        let deadline = Instant::now() + self.timeout;
        let argv = self.render(&self.simulator.command, scratch, &port_text);
        let mut simulator =
            ChildGuard::spawn(&argv, Some(&scratch.dir)).map_err(simulation_error)?;
        wait_for_port(&mut simulator, port, deadline)?;
        debug!(port, "gdb stub listening");

        let argv = self.render(&self.simulator.debugger, scratch, &port_text);
        let remaining = deadline.saturating_duration_since(Instant::now());
        let result = process::run(&argv, Some(&scratch.dir), remaining);
        simulator.kill();
        let sim_output = simulator.output();

        let completed = result.map_err(|e| {
            let mut output = e.output();
            output.stderr.push_str(&sim_output.stderr);
            VectorError::Simulation {
                reason: e.to_string(),
                dump: non_empty(&output.stdout),
                output,
            }
        })?;
        if !completed.output.stdout.contains(STOP_SYMBOL) {
            return Err(VectorError::Simulation {
                reason: format!("execution never reached {}", STOP_SYMBOL),
                dump: non_empty(&completed.output.stdout),
                output: merge_output(completed.output, sim_output),
            });
        }
        parse_dump(self.isa, merge_output(completed.output, sim_output))
    }
}

impl Simulator for SimulationExecutor {
    fn run(&mut self, stub: &StubSource, code: &[u8]) -> Result<RegisterSnapshot, VectorError> {
        let dir = self.create_scratch().map_err(|e| VectorError::Toolchain {
            stage: Stage::Assemble,
            reason: format!("failed to create scratch directory: {}", e),
            output: CapturedOutput::default(),
        })?;
        let scratch = Scratch {
            dir: dir.path().to_path_buf(),
        };
        debug!(scratch = %scratch.dir.display(), code_size = code.len(), "running vector");

        let result = self
            .write_inputs(&scratch.dir, stub, code)
            .map_err(|e| VectorError::Toolchain {
                stage: Stage::Assemble,
                reason: format!("failed to write scratch files: {}", e),
                output: CapturedOutput::default(),
            })
            .and_then(|()| self.toolchain_step(Stage::Assemble, &self.toolchain.assembler, &scratch))
            .and_then(|()| self.toolchain_step(Stage::Link, &self.toolchain.linker, &scratch))
            .and_then(|()| match self.simulator.mode {
                SimulatorMode::Direct => self.simulate_direct(&scratch),
                SimulatorMode::GdbRemote => self.simulate_gdb(&scratch),
            });

        if self.keep_scratch {
            let kept = dir.keep();
            info!(scratch = %kept.display(), "kept scratch directory");
        }
        result
    }
}

fn simulation_error(e: ProcessError) -> VectorError {
    let output = e.output();
    VectorError::Simulation {
        reason: e.to_string(),
        dump: non_empty(&output.stdout),
        output,
    }
}

fn non_empty(text: &str) -> Option<String> {
    (!text.trim().is_empty()).then(|| text.to_string())
}

fn merge_output(debugger: CapturedOutput, simulator: CapturedOutput) -> CapturedOutput {
    let mut merged = debugger;
    if !simulator.stdout.is_empty() {
        merged.stdout.push_str(&simulator.stdout);
    }
    merged.stderr.push_str(&simulator.stderr);
    merged
}

fn parse_dump(isa: Isa, output: CapturedOutput) -> Result<RegisterSnapshot, VectorError> {
    parse_register_dump(isa, &output.stdout).map_err(|e| VectorError::Simulation {
        reason: e.to_string(),
        dump: non_empty(&output.stdout),
        output,
    })
}

fn free_port() -> io::Result<u16> {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))?;
    Ok(listener.local_addr()?.port())
}

/// Wait until something listens on `port`, failing early if the simulator dies.
fn wait_for_port(
    simulator: &mut ChildGuard,
    port: u16,
    deadline: Instant,
) -> Result<(), VectorError> {
    loop {
        match TcpListener::bind((Ipv4Addr::LOCALHOST, port)) {
            Err(e) if e.kind() == io::ErrorKind::AddrInUse => return Ok(()),
            _ => {}
        }
        if let Some(status) = simulator.try_status().map_err(simulation_error)? {
            let output = simulator.output();
            return Err(VectorError::Simulation {
                reason: format!("simulator exited with {} before its gdb stub came up", status),
                dump: None,
                output,
            });
        }
        if Instant::now() >= deadline {
            simulator.kill();
            return Err(VectorError::Simulation {
                reason: format!("gdb stub on port {} did not come up", port),
                dump: None,
                output: simulator.output(),
            });
        }
        thread::sleep(PORT_POLL_INTERVAL);
    }
}

/// Debugger commands: attach, run to the stop symbol, print every register.
pub fn gdb_script(isa: Isa, image: &str, port: u16) -> String {
    let mut script = String::new();
    script.push_str("set pagination off\n");
    script.push_str("set confirm off\n");
    script.push_str(&format!("file {}\n", image));
    script.push_str(&format!("target remote localhost:{}\n", port));
    script.push_str(&format!("break {}\n", STOP_SYMBOL));
    script.push_str("continue\n");
    script.push_str("info registers\n");
    script.push_str(&format!("info registers {}\n", isa.float_registers().join(" ")));
    script.push_str("kill\n");
    script.push_str("quit\n");
    script
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gdb_script() {
        let script = gdb_script(Isa::Armv7, "/tmp/x/stub.elf", 1234);
        assert!(script.contains("file /tmp/x/stub.elf\n"));
        assert!(script.contains("target remote localhost:1234\n"));
        assert!(script.contains("break crossjit_stop\n"));
        assert!(script.contains("info registers d0 d1 d2"));
        assert!(script.contains("d15\n"));
        assert!(script.ends_with("quit\n"));
    }

    #[test]
    fn test_free_port_is_bindable() {
        let port = free_port().unwrap();
        assert_ne!(port, 0);
        TcpListener::bind((Ipv4Addr::LOCALHOST, port)).unwrap();
    }

    #[test]
    fn test_render_scratch_paths() {
        let executor = SimulationExecutor::from_config(&HarnessConfig::for_target(Isa::Armv7));
        let scratch = Scratch {
            dir: PathBuf::from("/scratch"),
        };
        let argv = executor.render(&executor.toolchain.linker, &scratch, "0");
        assert_eq!(
            argv,
            vec![
                "arm-none-eabi-ld",
                "-T",
                "/scratch/link.ld",
                "-o",
                "/scratch/stub.elf",
                "/scratch/stub.o"
            ]
        );
        let sim = executor.render(&executor.simulator.command, &scratch, "4321");
        assert!(sim.contains(&"tcp::4321".to_string()));
    }
}
