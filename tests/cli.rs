//! Integration tests driving the exetest binary.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::time::Instant;
use tempfile::TempDir;

/// A scratch working directory with an `inputs` tree of test cases.
struct Workspace {
    _tmp: TempDir,
    root: PathBuf,
}

impl Workspace {
    fn new() -> Self {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().canonicalize().unwrap();
        fs::create_dir_all(root.join("inputs")).unwrap();
        Self { _tmp: tmp, root }
    }

    fn write(&self, rel: &str, contents: &str) -> PathBuf {
        let path = self.root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, contents).unwrap();
        path
    }

    fn case(&self, rel: &str, settings: &str) -> PathBuf {
        self.write(&format!("inputs/{rel}/test-settings.yaml"), settings)
    }

    fn exetest<I, S>(&self, args: I) -> Output
    where
        I: IntoIterator<Item = S>,
        S: AsRef<std::ffi::OsStr>,
    {
        self.exetest_in(&self.root, args)
    }

    fn exetest_in<I, S>(&self, cwd: &Path, args: I) -> Output
    where
        I: IntoIterator<Item = S>,
        S: AsRef<std::ffi::OsStr>,
    {
        Command::new(env!("CARGO_BIN_EXE_exetest"))
            .args(args)
            .current_dir(cwd)
            .output()
            .unwrap()
    }
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

fn stderr(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).into_owned()
}

fn assert_success(output: &Output) {
    assert!(
        output.status.success(),
        "stdout: {}\nstderr: {}",
        stdout(output),
        stderr(output)
    );
}

fn report_db(root: &Path) -> serde_yaml::Value {
    let text = fs::read_to_string(root.join("tests-output/tests_report_db.yaml")).unwrap();
    serde_yaml::from_str(&text).unwrap()
}

#[test]
#[cfg(unix)]
fn run_passes_and_writes_report_db() {
    let ws = Workspace::new();
    ws.case(
        "case",
        "runner:\n  value: '2.0'\nreferences:\n  - '*.dat'\ntolerances:\n  result:\n    rel: 0.1\n",
    );
    ws.write("inputs/case/mesh.txt", "mesh");
    ws.write("runner.sh", "cat mesh.txt > copy.txt\necho ${value} > ${output_path}/result.dat\n");
    ws.write("refs/case/result.dat", "2.1\n");

    let output = ws.exetest([
        "run",
        "inputs",
        "--runner",
        "runner.sh",
        "--regression-root",
        "refs",
    ]);
    assert_success(&output);
    assert!(stdout(&output).contains("✓ runner"));
    assert!(stdout(&output).contains("✓ regression[result.dat]"));
    assert!(stdout(&output).contains("1 passed, 0 failed"));

    let out = ws.root.join("tests-output/case");
    assert_eq!(fs::read_to_string(out.join("copy.txt")).unwrap(), "mesh");
    assert!(out.join("runner.sh").is_file());
    assert!(out.join("runner.sh.stdout").is_file());
    assert!(!out.join("test-settings.yaml").exists());

    let db = report_db(&ws.root);
    assert_eq!(db["case"]["status"], "passed");
}

#[test]
#[cfg(unix)]
fn regression_failure_exits_non_zero() {
    let ws = Workspace::new();
    ws.case("case", "references:\n  - '*.dat'\n");
    ws.write("runner.sh", "echo 3 > ${output_path}/result.dat\n");
    ws.write("refs/case/result.dat", "2\n");

    let output = ws.exetest([
        "run",
        "inputs",
        "--runner",
        "runner.sh",
        "--regression-root",
        "refs",
    ]);
    assert_eq!(output.status.code(), Some(1));
    assert!(stdout(&output).contains("✗ regression[result.dat]"));
    assert!(stdout(&output).contains("expected 2, got 3"));
    assert_eq!(report_db(&ws.root)["case"]["status"], "failed");
}

#[test]
fn existing_output_requires_clean_or_overwrite() {
    let ws = Workspace::new();
    ws.case("case", "");

    assert_success(&ws.exetest(["run", "inputs"]));

    let output = ws.exetest(["run", "inputs"]);
    assert_eq!(output.status.code(), Some(1));
    assert!(stdout(&output).contains("already exists"));

    assert_success(&ws.exetest(["run", "inputs", "--clean-output"]));
    assert_success(&ws.exetest(["run", "inputs", "--overwrite-output"]));
}

#[test]
fn inputs_outside_working_directory_are_an_error() {
    let ws = Workspace::new();
    ws.case("case", "");
    let work = ws.root.join("work");
    fs::create_dir_all(&work).unwrap();

    let output = ws.exetest_in(&work, ["run", "../inputs"]);
    assert_eq!(output.status.code(), Some(1));
    assert!(stdout(&output).contains("✗ output"));
    assert!(stdout(&output).contains("shall be a parent directory of the inputs directory"));
    assert!(!work.join("tests-output/case").exists());
}

#[test]
fn clean_and_overwrite_are_exclusive() {
    let ws = Workspace::new();
    ws.case("case", "");

    let output = ws.exetest(["run", "inputs", "--clean-output", "--overwrite-output"]);
    assert_eq!(output.status.code(), Some(2));
}

#[test]
fn missing_runner_is_a_usage_error() {
    let ws = Workspace::new();
    ws.case("case", "");

    let output = ws.exetest(["run", "inputs", "--runner", "nope.sh"]);
    assert_eq!(output.status.code(), Some(2));
    assert!(stderr(&output).contains("argument --runner: no such file or directory: nope.sh"));
}

#[test]
fn marks_select_cases() {
    let ws = Workspace::new();
    ws.case("slow", "marks: [slow]\n");
    ws.case("slow/nested", "");
    ws.case("fast", "");

    // the nested case creates the output directory of its parent
    let output = ws.exetest([
        "run",
        "inputs",
        "--mark",
        "slow",
        "--output",
        "json",
        "--overwrite-output",
    ]);
    assert_success(&output);
    let json: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    let names: Vec<&str> = json["results"]
        .as_array()
        .unwrap()
        .iter()
        .map(|r| r["case"]["name"].as_str().unwrap())
        .collect();
    assert_eq!(names, vec!["slow/nested", "slow"]);
    assert_eq!(json["skipped"], 2);
}

#[test]
fn report_db_keeps_entries_of_other_cases() {
    let ws = Workspace::new();
    ws.case("a", "");
    ws.case("b", "");

    assert_success(&ws.exetest(["run", "inputs"]));
    assert_success(&ws.exetest(["run", "inputs", "--filter", "a", "--clean-output"]));

    let db = report_db(&ws.root);
    assert_eq!(db["a"]["status"], "skipped");
    assert_eq!(db["b"]["status"], "skipped");
}

#[test]
#[cfg(unix)]
fn report_generator_runs_in_output_root() {
    let ws = Workspace::new();
    ws.case("case", "");
    let generator = ws.write("report.sh", "#!/bin/sh\ncp tests_report_db.yaml report.txt\n");
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(&generator, fs::Permissions::from_mode(0o755)).unwrap();

    assert_success(&ws.exetest(["run", "inputs", "--report-generator", "report.sh"]));
    assert!(ws.root.join("tests-output/report.txt").is_file());
}

#[test]
fn junit_output() {
    let ws = Workspace::new();
    ws.case("case", "");

    let output = ws.exetest(["run", "inputs", "-o", "junit"]);
    assert_success(&output);
    let xml = stdout(&output);
    assert!(xml.starts_with("<?xml"));
    assert!(xml.contains("<testsuite name=\"case\""));
    assert!(xml.contains("<skipped message="));
}

#[test]
#[cfg(unix)]
fn cases_run_in_parallel_by_default() {
    let ws = Workspace::new();
    ws.case("a", "");
    ws.case("b", "");
    ws.write("runner.sh", "sleep 0.3\n");

    let start = Instant::now();
    let output = ws.exetest(["run", "inputs", "--runner", "runner.sh"]);
    let elapsed = start.elapsed();
    assert_success(&output);

    // Use generous threshold to avoid flaky tests under system load
    assert!(
        elapsed.as_secs_f64() < 0.8,
        "Cases took {:.2}s to run (expected < 0.8s for parallel execution)",
        elapsed.as_secs_f64()
    );
}

#[test]
#[cfg(unix)]
fn cases_run_serially_when_asked() {
    let ws = Workspace::new();
    ws.case("a", "");
    ws.case("b", "");
    ws.write("runner.sh", "sleep 0.2\n");

    let start = Instant::now();
    let output = ws.exetest(["run", "inputs", "--runner", "runner.sh", "--serial"]);
    let elapsed = start.elapsed();
    assert_success(&output);

    assert!(
        elapsed.as_secs_f64() >= 0.4,
        "Cases took {:.2}s to run (expected >= 0.4s for serial execution)",
        elapsed.as_secs_f64()
    );
}

#[test]
fn validate_reports_invalid_settings() {
    let ws = Workspace::new();
    ws.case("good", "marks: [slow]\n");
    ws.case("bad", "tolerances:\n  x:\n    rel: -1\n");

    let output = ws.exetest(["validate", "inputs"]);
    assert_eq!(output.status.code(), Some(1));
    assert!(stdout(&output).contains("✓"));
    assert!(stderr(&output).contains("bad"));
    assert!(stderr(&output).contains("1 test case(s) failed validation"));
}

#[test]
fn validate_checks_runner_placeholders() {
    let ws = Workspace::new();
    ws.case("case", "runner:\n  nproc: '4'\n");
    ws.write("ok.sh", "mpirun -n ${nproc} solver ${output_path}\n");
    ws.write("bad.sh", "solver --threads ${nthreads}\n");

    assert_success(&ws.exetest(["validate", "inputs", "--runner", "ok.sh"]));

    let output = ws.exetest(["validate", "inputs", "--runner", "bad.sh"]);
    assert_eq!(output.status.code(), Some(1));
    assert!(stderr(&output).contains("'nthreads' is undefined"));
}

#[test]
fn schema_is_json() {
    let ws = Workspace::new();
    let output = ws.exetest(["schema"]);
    assert_success(&output);

    let schema: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(schema["title"], "test-settings");
    assert!(schema["properties"]["marks"].is_object());
}

#[test]
fn init_scaffolds_settings_from_runner() {
    let ws = Workspace::new();
    ws.write("runner.sh", "cd ${output_path}\nmpirun -n ${nproc} solver\n");

    let output = ws.exetest(["init", "inputs/new", "--runner", "runner.sh"]);
    assert_success(&output);
    let text = fs::read_to_string(ws.root.join("inputs/new/test-settings.yaml")).unwrap();
    assert!(text.contains("nproc:"));
    assert!(!text.contains("output_path:"));

    // the scaffold is a valid settings file
    assert_success(&ws.exetest(["validate", "inputs/new"]));

    let output = ws.exetest(["init", "inputs/new"]);
    assert_eq!(output.status.code(), Some(1));
    assert!(stderr(&output).contains("already exists"));
}
