use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use crossjit::abi::stub::{StubLayout, build_invocation_stub};
use crossjit::config::{self, CONFIG_FILE, HarnessConfig};
use crossjit::driver::{self, BackendId, Driver};
use crossjit::harness::{self, Harness};
use crossjit::isa::Isa;
use crossjit::kind::{Signature, TestVector};
use crossjit::link::EntryPoint;
use crossjit::sim::SimulationExecutor;
use crossjit::suite::Suite;
use std::error::Error;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

// Wrapper types for clap ValueEnum support
#[derive(Debug, Clone, Copy, ValueEnum, Default)]
pub enum TargetArg {
    Armv7,
    #[default]
    Aarch64,
}

impl From<TargetArg> for Isa {
    fn from(arg: TargetArg) -> Self {
        match arg {
            TargetArg::Armv7 => Isa::Armv7,
            TargetArg::Aarch64 => Isa::Aarch64,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum, Default)]
pub enum BackendArg {
    Baseline,
    Optimizing,
    #[default]
    Both,
}

impl BackendArg {
    fn backends(self) -> Vec<BackendId> {
        match self {
            BackendArg::Baseline => vec![BackendId::Baseline],
            BackendArg::Optimizing => vec![BackendId::Optimizing],
            BackendArg::Both => BackendId::ALL.to_vec(),
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum, Default)]
pub enum ReportFormatArg {
    #[default]
    Human,
    Json,
}

#[derive(Parser)]
#[command(name = "crossjit")]
#[command(about = "Offline relocation, linking and differential execution of JIT code", long_about = None)]
struct Cli {
    /// Increase log verbosity (-v debug, -vv trace); RUST_LOG takes precedence
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default harness.toml into the current directory
    Init {
        #[arg(long, value_enum, default_value = "aarch64")]
        target: TargetArg,
    },
    /// Run a test suite under the simulator
    Run {
        /// Configuration file (defaults to ./harness.toml when present)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Suite file (defaults to the built-in suite)
        #[arg(long)]
        suite: Option<PathBuf>,

        /// Backends to test
        #[arg(long, value_enum, default_value = "both")]
        backend: BackendArg,

        /// Only run the named operations (repeatable)
        #[arg(long)]
        only: Vec<String>,

        /// Report format (human, json)
        #[arg(long, value_enum, default_value = "human")]
        report: ReportFormatArg,

        /// Per-subprocess timeout in seconds
        #[arg(long)]
        timeout: Option<u64>,

        /// Keep scratch directories for inspection
        #[arg(long)]
        keep_scratch: bool,
    },
    /// Print the invocation stub for one test vector
    Stub {
        /// Method signature, e.g. "long (long, int)"
        #[arg(long)]
        signature: String,

        /// Comma-separated argument literals
        #[arg(long, allow_hyphen_values = true)]
        args: String,

        /// Entry point offset within the relocation buffer
        #[arg(long, default_value = "0")]
        entry: u64,

        #[arg(long, value_enum, default_value = "aarch64")]
        target: TargetArg,
    },
    /// Compile and link a method, then print the relocation layout
    Layout {
        #[arg(long)]
        method: String,

        #[arg(long, value_enum, default_value = "baseline")]
        backend: BackendArg,

        /// Configuration file (defaults to ./harness.toml when present)
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

fn init_tracing(verbose: u8) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(match verbose {
            0 => "warn",
            1 => "debug",
            _ => "trace",
        })
    });
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .compact()
        .try_init();
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let result = match cli.command {
        Commands::Init { target } => cmd_init(target.into()),
        Commands::Run {
            config,
            suite,
            backend,
            only,
            report,
            timeout,
            keep_scratch,
        } => cmd_run(RunOptions {
            config,
            suite,
            backends: backend.backends(),
            only,
            report,
            timeout,
            keep_scratch,
        }),
        Commands::Stub {
            signature,
            args,
            entry,
            target,
        } => cmd_stub(&signature, &args, entry, target.into()),
        Commands::Layout {
            method,
            backend,
            config,
        } => cmd_layout(&method, backend, config.as_deref()),
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {}", e);
            let mut source = e.source();
            while let Some(cause) = source {
                eprintln!("  caused by: {}", cause);
                source = cause.source();
            }
            ExitCode::FAILURE
        }
    }
}

type CliResult = Result<ExitCode, Box<dyn Error>>;

fn cmd_init(target: Isa) -> CliResult {
    let cwd = std::env::current_dir()?;
    let path = config::init_config(&cwd, target)?;
    println!("Created {}", path.display());
    Ok(ExitCode::SUCCESS)
}

/// Explicit `--config`, else `./harness.toml` when present, else defaults.
fn load_config(path: Option<&Path>) -> Result<HarnessConfig, Box<dyn Error>> {
    match path {
        Some(path) => Ok(HarnessConfig::load(path)?),
        None if Path::new(CONFIG_FILE).exists() => Ok(HarnessConfig::load(Path::new(CONFIG_FILE))?),
        None => Ok(HarnessConfig::default()),
    }
}

struct RunOptions {
    config: Option<PathBuf>,
    suite: Option<PathBuf>,
    backends: Vec<BackendId>,
    only: Vec<String>,
    report: ReportFormatArg,
    timeout: Option<u64>,
    keep_scratch: bool,
}

fn cmd_run(options: RunOptions) -> CliResult {
    let mut config = load_config(options.config.as_deref())?;
    if let Some(timeout) = options.timeout {
        config.timeout_secs = timeout;
    }
    config.keep_scratch |= options.keep_scratch;
    config.validate()?;

    let mut suite = match &options.suite {
        Some(path) => Suite::load(path)?,
        None => Suite::builtin()?,
    };
    suite.retain_named(&options.only)?;

    let backend = driver::backend_from_config(&config)?;
    let mut harness = Harness::new(Driver::new(backend), &config);
    let mut simulator = SimulationExecutor::from_config(&config);
    let report = harness.run(&suite, &options.backends, &mut simulator);

    match options.report {
        ReportFormatArg::Human => print!("{}", report.render_human()),
        ReportFormatArg::Json => println!("{}", report.to_json()?),
    }

    Ok(if report.passed() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn cmd_stub(signature: &str, args: &str, entry: u64, target: Isa) -> CliResult {
    let signature = Signature::parse(signature)?;
    let vector = TestVector::parse(&signature, args)?;
    let stub = build_invocation_stub(
        target,
        &signature,
        &vector,
        EntryPoint { offset: entry },
        0,
        &StubLayout::for_target(target),
    )?;
    print!("{}", stub.assembly);
    println!();
    print!("{}", stub.linker_script);
    Ok(ExitCode::SUCCESS)
}

fn cmd_layout(method: &str, backend: BackendArg, config: Option<&Path>) -> CliResult {
    let config = load_config(config)?;
    let mut linker = Harness::new(Driver::new(driver::backend_from_config(&config)?), &config);
    for backend in backend.backends() {
        let image = linker.link_method(method, backend)?;
        println!("{} ({}):", method, backend);
        print!("{}", harness::render_layout(&image));
    }
    Ok(ExitCode::SUCCESS)
}
