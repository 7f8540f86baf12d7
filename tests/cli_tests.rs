use std::path::Path;
use std::process::{Command, Output};
use tempfile::TempDir;

fn crossjit(dir: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_crossjit"))
        .args(args)
        .current_dir(dir)
        .env_remove("RUST_LOG")
        .output()
        .expect("failed to execute crossjit")
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).to_string()
}

fn stderr(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).to_string()
}

#[test]
fn test_init_writes_config_once() {
    let dir = TempDir::new().unwrap();
    let output = crossjit(dir.path(), &["init", "--target", "armv7"]);
    assert!(output.status.success(), "stderr:\n{}", stderr(&output));

    let content = std::fs::read_to_string(dir.path().join("harness.toml")).unwrap();
    assert!(content.contains("target = \"armv7\""));
    assert!(content.contains("qemu-system-arm"));

    let again = crossjit(dir.path(), &["init"]);
    assert!(!again.status.success());
    assert!(stderr(&again).contains("already exists"));
}

#[test]
fn test_stub_prints_armv7_glue() {
    let dir = TempDir::new().unwrap();
    let output = crossjit(
        dir.path(),
        &[
            "stub",
            "--signature",
            "long (long, int)",
            "--args",
            "-1, 3",
            "--target",
            "armv7",
        ],
    );
    assert!(output.status.success(), "stderr:\n{}", stderr(&output));
    let text = stdout(&output);
    assert!(text.contains("ldr r0, =0xffffffff"));
    assert!(text.contains("ldr r1, =0xffffffff"));
    assert!(text.contains("ldr r2, =0x00000003"));
    assert!(text.contains(".incbin"));
    assert!(text.contains("ENTRY(_start)"));
}

#[test]
fn test_stub_rejects_bad_literal() {
    let dir = TempDir::new().unwrap();
    let output = crossjit(dir.path(), &["stub", "--signature", "int (int)", "--args", "x"]);
    assert!(!output.status.success());
    assert!(stderr(&output).contains("cannot parse `x`"));
}

#[test]
fn test_layout_shows_trampoline() {
    let dir = TempDir::new().unwrap();
    let output = crossjit(
        dir.path(),
        &["layout", "--method", "invokestatic", "--backend", "baseline"],
    );
    assert!(output.status.success(), "stderr:\n{}", stderr(&output));
    let text = stdout(&output);
    assert!(text.contains("invokestatic (baseline):"));
    assert!(text.contains("static_trampoline"));
    assert!(text.contains("invokestatic_helper"));
    assert!(text.contains("call invokestatic"));
}

#[test]
fn test_run_rejects_unknown_operation() {
    let dir = TempDir::new().unwrap();
    let output = crossjit(dir.path(), &["run", "--only", "frobnicate"]);
    assert!(!output.status.success());
    assert!(stderr(&output).contains("no operation named `frobnicate`"));
}

#[cfg(unix)]
mod with_fake_simulator {
    use super::*;

    const CONFIG: &str = r#"
target = "aarch64"
timeout_secs = 5

[toolchain]
assembler = ["true"]
linker = ["true"]

[simulator]
mode = "direct"
command = ["sh", "-c", "printf 'x0 0x3\\n'"]
"#;

    const SUITE: &str = r#"
[[operation]]
name = "iadd"
vectors = ["1, 2"]
"#;

    fn setup(suite: &str) -> TempDir {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("harness.toml"), CONFIG).unwrap();
        std::fs::write(dir.path().join("suite.toml"), suite).unwrap();
        dir
    }

    #[test]
    fn test_run_human_report() {
        let dir = setup(SUITE);
        let output = crossjit(
            dir.path(),
            &["run", "--suite", "suite.toml", "--backend", "baseline"],
        );
        assert!(output.status.success(), "stderr:\n{}", stderr(&output));
        let text = stdout(&output);
        assert!(text.contains("✓ #0 (1, 2)"));
        assert!(text.contains("1 passed, 0 failed, 0 errors"));
    }

    #[test]
    fn test_run_json_report_and_failure_exit() {
        let dir = setup("[[operation]]\nname = \"iadd\"\nvectors = [\"1, 2\", \"2, 2\"]\n");
        let output = crossjit(dir.path(), &["run", "--suite", "suite.toml", "--report", "json"]);
        assert!(!output.status.success());

        let report: serde_json::Value = serde_json::from_str(&stdout(&output)).unwrap();
        let operations = report["operations"].as_array().unwrap();
        assert_eq!(operations.len(), 2);
        assert_eq!(operations[0]["backend"], "baseline");
        assert_eq!(operations[1]["backend"], "optimizing");
        assert_eq!(operations[0]["vectors"][0]["verdict"]["status"], "pass");
        assert_eq!(operations[0]["vectors"][1]["verdict"]["status"], "fail");
        assert_eq!(operations[0]["vectors"][1]["verdict"]["expected"], "4");
        assert_eq!(operations[0]["vectors"][1]["verdict"]["actual"], "3");
    }
}
