//! Harness configuration (`harness.toml`).
//!
//! Every value has a target-specific default; a config file only needs to
//! name what differs. Command lines are argv templates whose `{placeholder}`
//! fields are filled in per test vector.

use crate::abi::stub::StubLayout;
use crate::isa::Isa;
use crate::link::DEFAULT_MAX_IMAGE_SIZE;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const CONFIG_FILE: &str = "harness.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("failed to serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{0} already exists")]
    AlreadyExists(PathBuf),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// How the simulator is driven.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SimulatorMode {
    /// Start the simulator halted with a gdb stub and capture registers through the debugger
    #[default]
    GdbRemote,
    /// The simulator prints the register dump on stdout itself
    Direct,
}

/// Which compiler backend produces routines.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompilerKind {
    /// Built-in AArch64 template compiler
    #[default]
    Template,
    /// External command printing a JSON routine manifest
    External,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolchainConfig {
    /// Placeholders: {source} {object}
    pub assembler: Vec<String>,
    /// Placeholders: {script} {object} {image}
    pub linker: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimulatorConfig {
    pub mode: SimulatorMode,
    /// Placeholders: {image} {port}
    pub command: Vec<String>,
    /// Placeholders: {gdb_script}
    pub debugger: Vec<String>,
    /// gdb stub port; 0 picks a free port per run
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompilerConfig {
    pub kind: CompilerKind,
    /// Placeholders: {method} {backend} {target}
    pub command: Vec<String>,
    /// Resets the compiler's boot code region; prints `{"start": .., "used": ..}`
    pub reset: Vec<String>,
}

/// Harness configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HarnessConfig {
    pub target: Isa,
    /// Per-subprocess timeout in seconds
    pub timeout_secs: u64,
    /// Keep scratch directories for inspection
    pub keep_scratch: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scratch_root: Option<PathBuf>,
    pub max_image_size: u64,
    pub layout: StubLayout,
    pub toolchain: ToolchainConfig,
    pub simulator: SimulatorConfig,
    pub compiler: CompilerConfig,
}

fn argv(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

impl HarnessConfig {
    /// Defaults for a target: GNU bare-metal toolchain, QEMU behind gdb.
    pub fn for_target(target: Isa) -> Self {
        let (toolchain, simulator) = match target {
            Isa::Armv7 => (
                ToolchainConfig {
                    assembler: argv(&[
                        "arm-none-eabi-as",
                        "-mcpu=cortex-a15",
                        "-mfpu=vfpv4",
                        "-mfloat-abi=hard",
                        "-o",
                        "{object}",
                        "{source}",
                    ]),
                    linker: argv(&["arm-none-eabi-ld", "-T", "{script}", "-o", "{image}", "{object}"]),
                },
                argv(&[
                    "qemu-system-arm",
                    "-cpu",
                    "cortex-a15",
                    "-M",
                    "versatilepb",
                    "-m",
                    "128M",
                    "-nographic",
                    "-gdb",
                    "tcp::{port}",
                    "-S",
                    "-kernel",
                    "{image}",
                ]),
            ),
            Isa::Aarch64 => (
                ToolchainConfig {
                    assembler: argv(&["aarch64-none-elf-as", "-o", "{object}", "{source}"]),
                    linker: argv(&[
                        "aarch64-none-elf-ld",
                        "-T",
                        "{script}",
                        "-o",
                        "{image}",
                        "{object}",
                    ]),
                },
                argv(&[
                    "qemu-system-aarch64",
                    "-cpu",
                    "cortex-a57",
                    "-M",
                    "virt",
                    "-m",
                    "256M",
                    "-nographic",
                    "-gdb",
                    "tcp::{port}",
                    "-S",
                    "-kernel",
                    "{image}",
                ]),
            ),
        };

        Self {
            target,
            timeout_secs: 30,
            keep_scratch: false,
            scratch_root: None,
            max_image_size: DEFAULT_MAX_IMAGE_SIZE,
            layout: StubLayout::for_target(target),
            toolchain,
            simulator: SimulatorConfig {
                mode: SimulatorMode::GdbRemote,
                command: simulator,
                debugger: argv(&["gdb-multiarch", "-q", "-batch", "-x", "{gdb_script}"]),
                port: 0,
            },
            compiler: CompilerConfig {
                kind: CompilerKind::Template,
                command: Vec::new(),
                reset: Vec::new(),
            },
        }
    }

    /// Parse a config file, filling unspecified values from the target defaults.
    pub fn from_toml_str(content: &str, path: &Path) -> Result<Self, ConfigError> {
        let parse_err = |source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        };
        let user: toml::Table = toml::from_str(content).map_err(parse_err)?;

        #[derive(Deserialize)]
        struct TargetOnly {
            #[serde(default)]
            target: Isa,
        }
        let TargetOnly { target } = toml::from_str(content).map_err(parse_err)?;

        let toml::Value::Table(mut merged) = toml::Value::try_from(Self::for_target(target))?
        else {
            return Err(ConfigError::Invalid("defaults are not a table".to_string()));
        };
        merge_tables(&mut merged, user);
        let config: Self = toml::Value::Table(merged).try_into().map_err(parse_err)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content, path)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content).map_err(|source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let non_empty = [
            ("toolchain.assembler", &self.toolchain.assembler),
            ("toolchain.linker", &self.toolchain.linker),
            ("simulator.command", &self.simulator.command),
        ];
        for (name, argv) in non_empty {
            if argv.is_empty() {
                return Err(ConfigError::Invalid(format!("{} must not be empty", name)));
            }
        }
        if self.simulator.mode == SimulatorMode::GdbRemote && self.simulator.debugger.is_empty() {
            return Err(ConfigError::Invalid(
                "simulator.debugger is required in gdb-remote mode".to_string(),
            ));
        }
        if self.compiler.kind == CompilerKind::External && self.compiler.command.is_empty() {
            return Err(ConfigError::Invalid(
                "compiler.command is required for the external compiler".to_string(),
            ));
        }
        if self.timeout_secs == 0 {
            return Err(ConfigError::Invalid("timeout_secs must be positive".to_string()));
        }
        if self.layout.stack_top % self.target.stack_alignment() != 0 {
            return Err(ConfigError::Invalid(format!(
                "layout.stack_top 0x{:x} is not {}-byte aligned",
                self.layout.stack_top,
                self.target.stack_alignment()
            )));
        }
        Ok(())
    }
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self::for_target(Isa::default())
    }
}

/// Overlay `overlay` onto `base`, recursing into nested tables.
fn merge_tables(base: &mut toml::Table, overlay: toml::Table) {
    for (key, value) in overlay {
        match (base.get_mut(&key), value) {
            (Some(toml::Value::Table(existing)), toml::Value::Table(nested)) => {
                merge_tables(existing, nested)
            }
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}

/// Write a default `harness.toml` into `dir`.
pub fn init_config(dir: &Path, target: Isa) -> Result<PathBuf, ConfigError> {
    let path = dir.join(CONFIG_FILE);
    if path.exists() {
        return Err(ConfigError::AlreadyExists(path));
    }
    HarnessConfig::for_target(target).save(&path)?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_per_target() {
        let arm = HarnessConfig::for_target(Isa::Armv7);
        assert_eq!(arm.toolchain.assembler[0], "arm-none-eabi-as");
        assert_eq!(arm.layout, StubLayout::for_target(Isa::Armv7));
        assert!(arm.validate().is_ok());

        let a64 = HarnessConfig::default();
        assert_eq!(a64.target, Isa::Aarch64);
        assert_eq!(a64.simulator.command[0], "qemu-system-aarch64");
    }

    #[test]
    fn test_partial_file_keeps_target_defaults() {
        let content = r#"
target = "armv7"
timeout_secs = 5

[simulator]
mode = "direct"
command = ["my-sim", "{image}"]
"#;
        let config = HarnessConfig::from_toml_str(content, Path::new("harness.toml")).unwrap();
        assert_eq!(config.target, Isa::Armv7);
        assert_eq!(config.timeout_secs, 5);
        assert_eq!(config.simulator.mode, SimulatorMode::Direct);
        assert_eq!(config.simulator.command, vec!["my-sim", "{image}"]);
        // untouched fields come from the armv7 defaults
        assert_eq!(config.simulator.debugger[0], "gdb-multiarch");
        assert_eq!(config.toolchain.linker[0], "arm-none-eabi-ld");
        assert_eq!(config.layout.stack_top, 0x07F0_0000);
    }

    #[test]
    fn test_invalid_values() {
        let err = HarnessConfig::from_toml_str("timeout_secs = 0", Path::new("h.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));

        let err = HarnessConfig::from_toml_str("[compiler]\nkind = \"external\"", Path::new("h.toml"))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));

        let err = HarnessConfig::from_toml_str("target = \"mips\"", Path::new("h.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_init_and_load() {
        let dir = TempDir::new().unwrap();
        let path = init_config(dir.path(), Isa::Armv7).unwrap();
        let loaded = HarnessConfig::load(&path).unwrap();
        assert_eq!(loaded, HarnessConfig::for_target(Isa::Armv7));

        assert!(matches!(
            init_config(dir.path(), Isa::Armv7),
            Err(ConfigError::AlreadyExists(_))
        ));
    }
}
