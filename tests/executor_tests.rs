#![cfg(unix)]

use crossjit::abi::stub::{StubLayout, build_invocation_stub};
use crossjit::config::{HarnessConfig, SimulatorMode};
use crossjit::error::{Stage, VectorError};
use crossjit::isa::Isa;
use crossjit::kind::{Signature, TestVector};
use crossjit::link::EntryPoint;
use crossjit::sim::{SimulationExecutor, Simulator};
use std::net::{Ipv4Addr, TcpListener};
use std::thread;
use std::time::{Duration, Instant};
use tempfile::TempDir;

fn sh(script: &str) -> Vec<String> {
    vec!["sh".to_string(), "-c".to_string(), script.to_string()]
}

/// Config whose toolchain steps succeed without doing anything.
fn config(simulator: Vec<String>) -> HarnessConfig {
    let mut config = HarnessConfig::for_target(Isa::Aarch64);
    config.timeout_secs = 5;
    config.toolchain.assembler = sh("true");
    config.toolchain.linker = sh("true");
    config.simulator.mode = SimulatorMode::Direct;
    config.simulator.command = simulator;
    config
}

fn run(config: &HarnessConfig) -> Result<crossjit::sim::regdump::RegisterSnapshot, VectorError> {
    let signature = Signature::parse("int (int, int)").unwrap();
    let vector = TestVector::parse(&signature, "1, 2").unwrap();
    let stub = build_invocation_stub(
        Isa::Aarch64,
        &signature,
        &vector,
        EntryPoint { offset: 0 },
        0x1000_0000,
        &StubLayout::for_target(Isa::Aarch64),
    )
    .unwrap();
    SimulationExecutor::from_config(config).run(&stub, &[0xc0, 0x03, 0x5f, 0xd6])
}

#[test]
fn test_direct_mode_parses_stdout_dump() {
    let config = config(sh("printf 'x0             0x3                 3\\n'"));
    let snapshot = run(&config).unwrap();
    assert_eq!(snapshot.integer(0), Some(3));
}

#[test]
fn test_assembler_failure_is_toolchain_error() {
    let mut config = config(sh("true"));
    config.toolchain.assembler = sh("echo 'bad operand' >&2; exit 3");
    match run(&config) {
        Err(VectorError::Toolchain { stage, output, .. }) => {
            assert_eq!(stage, Stage::Assemble);
            assert!(output.stderr.contains("bad operand"));
        }
        other => panic!("unexpected result: {other:?}"),
    }
}

#[test]
fn test_linker_sees_scratch_files() {
    let mut config = config(sh("printf 'x0 0x1\\n'"));
    config.toolchain.assembler = sh("cp {source} {object}");
    config.toolchain.linker = sh("test -f {object} && test -f {script} && test -f {code}");
    assert!(run(&config).is_ok());
}

#[test]
fn test_hung_simulator_times_out() {
    let mut config = config(sh("sleep 30"));
    config.timeout_secs = 1;
    match run(&config) {
        Err(VectorError::Simulation { reason, .. }) => assert!(reason.contains("timed out")),
        other => panic!("unexpected result: {other:?}"),
    }
}

#[test]
fn test_garbage_output_keeps_dump() {
    let config = config(sh("echo 'guest crashed'"));
    match run(&config) {
        Err(VectorError::Simulation { dump, .. }) => {
            assert_eq!(dump.as_deref(), Some("guest crashed\n"));
        }
        other => panic!("unexpected result: {other:?}"),
    }
}

#[test]
fn test_gdb_mode_simulator_exits_early() {
    let mut config = config(sh("exit 1"));
    config.simulator.mode = SimulatorMode::GdbRemote;
    config.simulator.debugger = sh("true");
    match run(&config) {
        Err(VectorError::Simulation { reason, .. }) => {
            assert!(reason.contains("before its gdb stub came up"), "{reason}");
        }
        other => panic!("unexpected result: {other:?}"),
    }
}

#[test]
fn test_gdb_mode_shares_one_deadline() {
    let port = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
        .unwrap()
        .local_addr()
        .unwrap()
        .port();
    // the stub comes up late, then the debugger hangs
    let listener = thread::spawn(move || {
        thread::sleep(Duration::from_millis(1500));
        // the executor probes the port by binding it briefly
        let held = loop {
            if let Ok(listener) = TcpListener::bind((Ipv4Addr::LOCALHOST, port)) {
                break listener;
            }
            thread::sleep(Duration::from_millis(5));
        };
        thread::sleep(Duration::from_secs(4));
        drop(held);
    });

    let mut config = config(sh("sleep 30"));
    config.timeout_secs = 2;
    config.simulator.mode = SimulatorMode::GdbRemote;
    config.simulator.port = port;
    config.simulator.debugger = sh("sleep 30");

    let start = Instant::now();
    match run(&config) {
        Err(VectorError::Simulation { reason, .. }) => assert!(reason.contains("timed out"), "{reason}"),
        other => panic!("unexpected result: {other:?}"),
    }
    assert!(start.elapsed() < Duration::from_millis(3000), "{:?}", start.elapsed());
    listener.join().unwrap();
}

#[test]
fn test_keep_scratch() {
    let root = TempDir::new().unwrap();
    let mut config = config(sh("printf 'x0 0x1\\n'"));
    config.scratch_root = Some(root.path().to_path_buf());
    config.keep_scratch = true;
    run(&config).unwrap();

    let kept: Vec<_> = std::fs::read_dir(root.path())
        .unwrap()
        .map(|entry| entry.unwrap().path())
        .collect();
    assert_eq!(kept.len(), 1);
    assert!(kept[0].file_name().unwrap().to_string_lossy().starts_with("crossjit-"));
    assert!(kept[0].join("stub.s").exists());
    assert!(kept[0].join("code.bin").exists());
}
