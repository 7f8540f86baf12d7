//! Subprocess plumbing shared by the external compiler and the simulation
//! executor.
//!
//! Commands are configured as argv templates. A child's stdout and stderr
//! go to anonymous temporary files, never pipes.

use crate::error::CapturedOutput;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::trace;

const POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("empty command line")]
    EmptyCommand,
    #[error("`{program}` not found: {source}")]
    NotFound {
        program: String,
        #[source]
        source: which::Error,
    },
    #[error("failed to start `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to wait for `{program}`: {source}")]
    Wait {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("`{program}` timed out after {:.1}s", .timeout.as_secs_f64())]
    TimedOut {
        program: String,
        timeout: Duration,
        output: CapturedOutput,
    },
}

impl ProcessError {
    pub fn output(&self) -> CapturedOutput {
        match self {
            ProcessError::TimedOut { output, .. } => output.clone(),
            _ => CapturedOutput::default(),
        }
    }
}

/// Substitute `{name}` placeholders in every argument.
pub fn render(template: &[String], vars: &[(&str, &str)]) -> Vec<String> {
    template
        .iter()
        .map(|arg| {
            vars.iter().fold(arg.clone(), |acc, (name, value)| {
                acc.replace(&format!("{{{}}}", name), value)
            })
        })
        .collect()
}

/// Locate a program on `PATH` (or as given, when it contains a separator).
pub fn resolve_program(program: &str) -> Result<PathBuf, ProcessError> {
    which::which(program).map_err(|source| ProcessError::NotFound {
        program: program.to_string(),
        source,
    })
}

/// A finished command.
#[derive(Debug)]
pub struct Completed {
    pub status: ExitStatus,
    pub output: CapturedOutput,
}

impl Completed {
    pub fn success(&self) -> bool {
        self.status.success()
    }
}

/// A running child that is killed and reaped when dropped.
pub struct ChildGuard {
    program: String,
    child: Child,
    stdout: File,
    stderr: File,
    reaped: bool,
}

impl ChildGuard {
    pub fn spawn(argv: &[String], cwd: Option<&Path>) -> Result<Self, ProcessError> {
        let (program, args) = argv.split_first().ok_or(ProcessError::EmptyCommand)?;
        let path = resolve_program(program)?;
        let spawn_err = |source| ProcessError::Spawn {
            program: program.clone(),
            source,
        };

        let stdout = tempfile::tempfile().map_err(spawn_err)?;
        let stderr = tempfile::tempfile().map_err(spawn_err)?;

        let mut command = Command::new(path);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout.try_clone().map_err(spawn_err)?))
            .stderr(Stdio::from(stderr.try_clone().map_err(spawn_err)?));
        if let Some(dir) = cwd {
            command.current_dir(dir);
        }
        // own process group, so a timeout also reaches whatever a wrapper script started
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }

        trace!(command = %argv.join(" "), "spawning");
        let child = command.spawn().map_err(spawn_err)?;
        Ok(Self {
            program: program.clone(),
            child,
            stdout,
            stderr,
            reaped: false,
        })
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Exit status if the child has already exited.
    pub fn try_status(&mut self) -> Result<Option<ExitStatus>, ProcessError> {
        let status = self.child.try_wait().map_err(|source| ProcessError::Wait {
            program: self.program.clone(),
            source,
        })?;
        if status.is_some() {
            self.reaped = true;
        }
        Ok(status)
    }

    /// Wait up to `timeout`; `None` means the child is still running.
    pub fn wait_timeout(&mut self, timeout: Duration) -> Result<Option<ExitStatus>, ProcessError> {
        let start = Instant::now();
        loop {
            if let Some(status) = self.try_status()? {
                return Ok(Some(status));
            }
            if start.elapsed() >= timeout {
                return Ok(None);
            }
            thread::sleep(POLL_INTERVAL);
        }
    }

    pub fn kill(&mut self) {
        if !self.reaped {
            #[cfg(unix)]
            if let Ok(pgid) = libc::pid_t::try_from(self.child.id()) {
                // SAFETY: the leader is not reaped yet, so the group id still belongs to this child
                unsafe {
                    libc::kill(-pgid, libc::SIGKILL);
                }
            }
            let _ = self.child.kill();
            let _ = self.child.wait();
            self.reaped = true;
        }
    }

    /// Everything the child has written so far.
    pub fn output(&mut self) -> CapturedOutput {
        CapturedOutput {
            stdout: read_all(&mut self.stdout),
            stderr: read_all(&mut self.stderr),
        }
    }
}

impl Drop for ChildGuard {
    fn drop(&mut self) {
        self.kill();
    }
}

fn read_all(file: &mut File) -> String {
    let mut bytes = Vec::new();
    if file.seek(SeekFrom::Start(0)).is_ok() {
        let _ = file.read_to_end(&mut bytes);
    }
    String::from_utf8_lossy(&bytes).into_owned()
}

/// Run a command to completion, killing it after `timeout`.
pub fn run(argv: &[String], cwd: Option<&Path>, timeout: Duration) -> Result<Completed, ProcessError> {
    let mut child = ChildGuard::spawn(argv, cwd)?;
    match child.wait_timeout(timeout)? {
        Some(status) => Ok(Completed {
            status,
            output: child.output(),
        }),
        None => {
            child.kill();
            Err(ProcessError::TimedOut {
                program: child.program().to_string(),
                timeout,
                output: child.output(),
            })
        }
    }
}
