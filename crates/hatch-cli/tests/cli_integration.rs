//! CLI subprocess integration tests.
//!
//! These tests invoke the `hatch` binary as a subprocess and verify exit
//! codes, stdout content, and JSON output.

#![cfg(unix)]

use std::path::Path;
use std::process::{Command, Output};

fn hatch_bin(dir: &Path) -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_hatch"));
    cmd.current_dir(dir)
        .arg("--config")
        .arg(dir.join("absent-config.toml"))
        .env_remove("HATCH_LOG");
    cmd
}

fn run_script(dir: &Path, runtime: &str, script: &str, extra: &[&str]) -> Output {
    hatch_bin(dir)
        .args(["run", "--runtime", runtime, "--script", script])
        .args(extra)
        .output()
        .unwrap()
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

fn stderr(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).into_owned()
}

#[test]
fn cli_version_exits_zero() {
    let dir = tempfile::tempdir().unwrap();
    let output = hatch_bin(dir.path()).arg("--version").output().unwrap();
    assert!(output.status.success());
    assert!(stdout(&output).contains("hatch"), "{}", stdout(&output));
}

#[test]
fn cli_help_lists_commands_but_not_internal_ones() {
    let dir = tempfile::tempdir().unwrap();
    let output = hatch_bin(dir.path()).arg("--help").output().unwrap();
    assert!(output.status.success());
    let out = stdout(&output);
    for cmd in ["run", "runtimes", "image-clean", "completions", "man-pages"] {
        assert!(out.contains(cmd), "help must list '{cmd}': {out}");
    }
    assert!(!out.contains("__exec-virtual"));
}

#[test]
fn cli_unknown_command_fails() {
    let dir = tempfile::tempdir().unwrap();
    let output = hatch_bin(dir.path()).arg("frobnicate").output().unwrap();
    assert!(!output.status.success());
}

#[test]
fn run_native_and_virtual_print_output() {
    let dir = tempfile::tempdir().unwrap();
    for runtime in ["native", "virtual"] {
        let output = run_script(dir.path(), runtime, "echo hi", &[]);
        assert!(output.status.success(), "{runtime}: {}", stderr(&output));
        assert_eq!(stdout(&output), "hi\n", "{runtime}");
    }
}

#[test]
fn run_exit_code_is_process_exit_code() {
    let dir = tempfile::tempdir().unwrap();
    for runtime in ["native", "virtual"] {
        let output = run_script(dir.path(), runtime, "exit 42", &[]);
        assert_eq!(output.status.code(), Some(42), "{runtime}");
    }
}

#[test]
fn run_passes_positional_arguments() {
    let dir = tempfile::tempdir().unwrap();
    for runtime in ["native", "virtual"] {
        let output = run_script(
            dir.path(),
            runtime,
            r#"echo "$1-$2 ($#)""#,
            &["--", "a", "b"],
        );
        assert!(output.status.success(), "{runtime}: {}", stderr(&output));
        assert_eq!(stdout(&output), "a-b (2)\n", "{runtime}");
    }
}

#[test]
fn run_env_flag_reaches_script() {
    let dir = tempfile::tempdir().unwrap();
    let output = run_script(
        dir.path(),
        "virtual",
        "echo \"$GREETING\"",
        &["--env", "GREETING=hello"],
    );
    assert!(output.status.success(), "{}", stderr(&output));
    assert_eq!(stdout(&output), "hello\n");
}

#[test]
fn run_inherit_none_hides_host_variables() {
    let dir = tempfile::tempdir().unwrap();
    let output = hatch_bin(dir.path())
        .env("HATCH_TEST_SECRET", "leak")
        .args([
            "run",
            "--runtime",
            "virtual",
            "--inherit",
            "none",
            "--script",
            "echo \"[${HATCH_TEST_SECRET:-}]\"",
        ])
        .output()
        .unwrap();
    assert!(output.status.success(), "{}", stderr(&output));
    assert_eq!(stdout(&output), "[]\n");
}

#[test]
fn run_script_file() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("task.sh");
    std::fs::write(&file, "echo from-file\n").unwrap();
    let output = hatch_bin(dir.path())
        .args(["run", "--runtime", "virtual", "--file"])
        .arg(&file)
        .output()
        .unwrap();
    assert!(output.status.success(), "{}", stderr(&output));
    assert_eq!(stdout(&output), "from-file\n");
}

#[test]
fn run_capture_prints_after_exit() {
    let dir = tempfile::tempdir().unwrap();
    let output = run_script(
        dir.path(),
        "native",
        "echo out; echo err >&2; exit 3",
        &["--capture"],
    );
    assert_eq!(output.status.code(), Some(3));
    assert_eq!(stdout(&output), "out\n");
    assert!(stderr(&output).contains("err"));
}

#[test]
fn run_virtual_rejects_interpreter() {
    let dir = tempfile::tempdir().unwrap();
    let output = run_script(
        dir.path(),
        "virtual",
        "print(1)",
        &["--interpreter", "python3"],
    );
    assert_eq!(output.status.code(), Some(1));
    let err = stderr(&output);
    assert!(err.contains("error:"), "{err}");
    assert!(err.contains("interpreter"), "{err}");
}

#[test]
fn run_missing_workdir_fails() {
    let dir = tempfile::tempdir().unwrap();
    let output = run_script(dir.path(), "native", "true", &["--workdir", "nope"]);
    assert_eq!(output.status.code(), Some(1));
    assert!(stderr(&output).contains("error:"));
}

#[test]
fn run_virtual_interactive_reinvokes_binary() {
    let dir = tempfile::tempdir().unwrap();
    let output = run_script(dir.path(), "virtual", "echo inter; exit 5", &["--interactive"]);
    assert_eq!(output.status.code(), Some(5), "{}", stderr(&output));
    assert_eq!(stdout(&output), "inter\n");
}

#[test]
fn runtimes_json_lists_host_backends() {
    let dir = tempfile::tempdir().unwrap();
    let output = hatch_bin(dir.path())
        .args(["runtimes", "--json"])
        .output()
        .unwrap();
    assert!(output.status.success(), "{}", stderr(&output));
    let report: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    let runtimes = report["runtimes"].as_array().unwrap();
    for name in ["native", "virtual"] {
        let row = runtimes
            .iter()
            .find(|r| r["name"] == name)
            .unwrap_or_else(|| panic!("missing {name}: {report}"));
        assert!(row["available"].is_boolean());
    }
    let has_container = runtimes.iter().any(|r| r["name"] == "container");
    let has_diagnostic = report["diagnostics"]
        .as_array()
        .unwrap()
        .iter()
        .any(|d| d["code"] == "container_runtime_init_failed");
    assert!(has_container ^ has_diagnostic, "{report}");
}

#[test]
fn exec_virtual_with_missing_invocation_fails() {
    let dir = tempfile::tempdir().unwrap();
    let output = hatch_bin(dir.path())
        .args(["__exec-virtual", "--invocation", "missing.json"])
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(1));
    assert!(stderr(&output).contains("invalid virtual invocation"));
}

#[test]
fn completions_bash_mentions_binary() {
    let dir = tempfile::tempdir().unwrap();
    let output = hatch_bin(dir.path())
        .args(["completions", "bash"])
        .output()
        .unwrap();
    assert!(output.status.success());
    assert!(stdout(&output).contains("hatch"));
}

#[test]
fn man_pages_skip_hidden_commands() {
    let dir = tempfile::tempdir().unwrap();
    let out_dir = dir.path().join("man");
    let output = hatch_bin(dir.path())
        .arg("man-pages")
        .arg(&out_dir)
        .output()
        .unwrap();
    assert!(output.status.success(), "{}", stderr(&output));
    assert!(out_dir.join("hatch.1").exists());
    assert!(out_dir.join("hatch-run.1").exists());
    assert!(!out_dir.join("hatch-__exec-virtual.1").exists());
}
