use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use tempfile::TempDir;

const PROGRAM: &str = "\
const n = slider({ value: 3 });
text(`n=${n}`);
";

fn atomflow(temp_dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("atomflow").unwrap();
    cmd.arg("--config").arg(temp_dir.path().join("atomflow.toml"));
    cmd
}

#[test]
fn test_lift_prints_rewritten_program() {
    let temp_dir = TempDir::new().unwrap();
    let file = temp_dir.path().join("app.js");
    fs::write(&file, PROGRAM).unwrap();

    atomflow(&temp_dir)
        .arg("lift")
        .arg(&file)
        .assert()
        .success()
        .stdout(predicate::str::contains("const __workflow = createWorkflow();"))
        .stdout(predicate::str::contains("__workflow.atom(\"slider_"))
        .stdout(predicate::str::contains("__workflow.execute();"));
}

#[test]
fn test_graph_prints_execution_order() {
    let temp_dir = TempDir::new().unwrap();
    let file = temp_dir.path().join("app.js");
    fs::write(&file, PROGRAM).unwrap();

    atomflow(&temp_dir)
        .arg("graph")
        .arg(&file)
        .assert()
        .success()
        .stdout(predicate::str::contains("Atoms (2):"))
        .stdout(predicate::str::contains("Execution order:"))
        .stdout(predicate::str::contains("1. slider_"))
        .stdout(predicate::str::contains("2. text_"));
}

#[test]
fn test_extra_directive_flag() {
    let temp_dir = TempDir::new().unwrap();
    let file = temp_dir.path().join("app.js");
    fs::write(&file, "gauge({ value: 1 });\n").unwrap();

    atomflow(&temp_dir)
        .args(["--directive", "gauge", "graph"])
        .arg(&file)
        .assert()
        .success()
        .stdout(predicate::str::contains("gauge_"));
}

#[test]
fn test_missing_file_fails() {
    let temp_dir = TempDir::new().unwrap();

    atomflow(&temp_dir)
        .arg("lift")
        .arg(temp_dir.path().join("missing.js"))
        .assert()
        .failure()
        .code(exitcode::NOINPUT)
        .stderr(predicate::str::contains("Error:"));
}

#[test]
fn test_parse_error_is_data_error() {
    let temp_dir = TempDir::new().unwrap();
    let file = temp_dir.path().join("broken.js");
    fs::write(&file, "const = ;").unwrap();

    atomflow(&temp_dir)
        .arg("lift")
        .arg(&file)
        .assert()
        .failure()
        .code(exitcode::DATAERR);
}
