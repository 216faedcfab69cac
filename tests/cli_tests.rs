//! The `templar` binary.

use std::io::Write;
use std::process::{Command, Output};

use tempfile::NamedTempFile;

fn templar(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_templar"))
        .args(args)
        .output()
        .expect("templar runs")
}

fn program_file(source: &str) -> NamedTempFile {
    let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
    file.write_all(source.as_bytes()).unwrap();
    file
}

const HELLO: &str = r#"
[[class]]
name = "Hello"

[[class.method]]
name = "main"
descriptor = "()I"
access = ["static"]
code = """
        ldc "hello"
        invokestatic java/lang/System.println(Ljava/lang/String;)V
        bipush 6
        bipush 7
        imul
        ireturn
"""

[[class.method]]
name = "boom"
descriptor = "()V"
access = ["static"]
code = """
        new java/lang/RuntimeException
        dup
        ldc "went wrong"
        invokespecial java/lang/RuntimeException.<init>(Ljava/lang/String;)V
        athrow
"""
"#;

#[test]
fn test_print_json_lists_codelets() {
    let out = templar(&["print", "--json"]);
    assert!(out.status.success(), "stderr: {}", String::from_utf8_lossy(&out.stderr));
    let report: serde_json::Value = serde_json::from_slice(&out.stdout).unwrap();
    assert_eq!(report["stats"]["backend"], "portable");
    assert!(report["stats"]["code_bytes"].as_u64().unwrap() > 0);
    let codelets = report["codelets"].as_array().unwrap();
    assert!(!codelets.is_empty());
    assert_eq!(codelets.len() as u64, report["stats"]["codelets"].as_u64().unwrap());
}

#[test]
fn test_print_x86_64_listing() {
    let out = templar(&["print", "--backend", "x86-64"]);
    assert!(out.status.success());
    assert!(!out.stdout.is_empty());
}

#[test]
fn test_print_with_config_file() {
    let mut config = NamedTempFile::new().unwrap();
    writeln!(config, "backend = \"x86-64\"").unwrap();
    let out = templar(&["print", "--json", "--config", config.path().to_str().unwrap()]);
    assert!(out.status.success());
    let report: serde_json::Value = serde_json::from_slice(&out.stdout).unwrap();
    assert_eq!(report["stats"]["backend"], "x86-64");
}

#[test]
fn test_invalid_config_fails() {
    let mut config = NamedTempFile::new().unwrap();
    writeln!(config, "stack_size = 12").unwrap();
    let out = templar(&["print", "--config", config.path().to_str().unwrap()]);
    assert!(!out.status.success());
    assert!(String::from_utf8_lossy(&out.stderr).contains("stack_size"));
}

#[test]
fn test_run_prints_output_and_result() {
    let program = program_file(HELLO);
    let path = program.path().to_str().unwrap();
    let out = templar(&["run", path, "--entry", "Hello.main"]);
    assert!(out.status.success(), "stderr: {}", String::from_utf8_lossy(&out.stderr));
    assert_eq!(String::from_utf8_lossy(&out.stdout), "hello\n42\n");

    let stepped = templar(&["run", path, "--entry", "Hello.main", "--safepoint-table"]);
    assert!(stepped.status.success());
    assert_eq!(stepped.stdout, out.stdout);
}

#[test]
fn test_run_reports_uncaught_exception() {
    let program = program_file(HELLO);
    let out = templar(&["run", program.path().to_str().unwrap(), "--entry", "Hello.boom"]);
    assert!(!out.status.success());
    let stderr = String::from_utf8_lossy(&out.stderr);
    assert!(
        stderr.contains("Exception in thread \"main\" java.lang.RuntimeException: went wrong"),
        "stderr: {}",
        stderr
    );
}

#[test]
fn test_run_rejects_bad_entries() {
    let program = program_file(HELLO);
    let path = program.path().to_str().unwrap();
    for entry in ["Hello", "Missing.main", "Hello.nothing"] {
        let out = templar(&["run", path, "--entry", entry]);
        assert!(!out.status.success(), "accepted entry {}", entry);
    }
}

#[test]
fn test_run_reports_assembly_errors_with_lines() {
    let program = program_file(
        "[[class]]\nname = \"Bad\"\n\n[[class.method]]\nname = \"main\"\ndescriptor = \"()V\"\naccess = [\"static\"]\ncode = \"\"\"\n        nop\n        frobnicate\n        return\n\"\"\"\n",
    );
    let out = templar(&["run", program.path().to_str().unwrap(), "--entry", "Bad.main"]);
    assert!(!out.status.success());
    let stderr = String::from_utf8_lossy(&out.stderr);
    assert!(stderr.contains("line 10"), "stderr: {}", stderr);
    assert!(stderr.contains("frobnicate"), "stderr: {}", stderr);
}
