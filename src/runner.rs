//! Test case execution engine.
//!
//! Runs every test case through the same pipeline: shallow copy of the case
//! directory to its output directory, execution of the runner script there,
//! then comparison of the output files with the reference files.

use crate::compare::compare_files;
use crate::loader::{self, CollectionContext, Selection};
use crate::mirror::{self, MirrorError, OUTPUT_IGNORED_FILES, OverwritePolicy};
use crate::references::find_references;
use crate::script::{RunnerError, ScriptRunner};
use crate::settings::{Defaults, Document, Settings, SettingsError, SettingsLoader};
use crate::SETTINGS_FILENAME;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Runner variable holding the output directory of the case.
pub const OUTPUT_PATH_KEY: &str = "output_path";

/// Outcome of a test, or of a whole case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Passed,
    Failed,
    Skipped,
    Error,
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Status::Passed => "passed",
            Status::Failed => "failed",
            Status::Skipped => "skipped",
            Status::Error => "error",
        };
        f.write_str(s)
    }
}

/// Result of a single test of a case.
#[derive(Debug, Clone, Serialize)]
pub struct TestResult {
    pub name: String,
    pub status: Status,
    #[serde(serialize_with = "serialize_duration")]
    pub duration: Duration,
    pub messages: Vec<String>,
}

impl TestResult {
    fn new(name: impl Into<String>, status: Status, duration: Duration, messages: Vec<String>) -> Self {
        Self {
            name: name.into(),
            status,
            duration,
            messages,
        }
    }

    fn skipped(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::new(name, Status::Skipped, Duration::ZERO, vec![reason.into()])
    }

    fn error(name: impl Into<String>, duration: Duration, message: impl Into<String>) -> Self {
        Self::new(name, Status::Error, duration, vec![message.into()])
    }
}

/// Result of running a test case.
#[derive(Debug, Clone, Serialize)]
pub struct CaseResult {
    /// Case name, relative to the inputs root.
    pub name: String,
    /// Case output directory relative to the output root, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<PathBuf>,
    pub marks: BTreeSet<String>,
    pub tests: Vec<TestResult>,
}

impl CaseResult {
    /// Status of the case.
    ///
    /// A case is errored if a test errored, failed if a test failed, skipped
    /// if all its tests were skipped, passed otherwise.
    pub fn status(&self) -> Status {
        let has = |status: Status| self.tests.iter().any(|t| t.status == status);
        if has(Status::Error) {
            Status::Error
        } else if has(Status::Failed) {
            Status::Failed
        } else if self.tests.iter().all(|t| t.status == Status::Skipped) {
            Status::Skipped
        } else {
            Status::Passed
        }
    }

    /// Error and failure messages of all the tests.
    pub fn messages(&self) -> Vec<String> {
        self.tests
            .iter()
            .filter(|t| matches!(t.status, Status::Error | Status::Failed))
            .flat_map(|t| t.messages.iter().map(|m| format!("{}: {m}", t.name)))
            .collect()
    }

    /// Total time spent in the tests of the case.
    pub fn duration(&self) -> Duration {
        self.tests.iter().map(|t| t.duration).sum()
    }
}

fn serialize_duration<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.serialize_f64(duration.as_secs_f64())
}

/// Options of a test session.
#[derive(Debug, Clone, Default)]
pub struct RunConfig {
    /// Runner script template.
    pub runner: Option<PathBuf>,
    /// Root of the output directories.
    pub output_root: PathBuf,
    /// Root of the reference directories.
    pub regression_root: Option<PathBuf>,
    /// Handling of existing output directories.
    pub policy: OverwritePolicy,
    /// Run every case one after the other.
    pub serial: bool,
}

/// A collected test case.
#[derive(Debug, Clone)]
pub struct Case {
    pub dir: PathBuf,
    pub name: String,
    /// Settings of the case, or the message of the error that prevented resolving them.
    pub settings: Result<Settings, String>,
    /// Marks of the case, including the ones of the cases above it.
    pub marks: BTreeSet<String>,
}

/// A test session: shared state for collecting and running cases.
pub struct Session {
    config: RunConfig,
    loader: SettingsLoader,
    defaults: Document,
    /// Directory the inputs are mirrored from, the working directory when unset.
    base: Option<PathBuf>,
}

impl Session {
    /// Create a session rooted at the process working directory.
    pub fn new(config: RunConfig, defaults: &Defaults) -> Result<Self, SettingsError> {
        Self::build(config, defaults, None)
    }

    /// Create a session whose input directories are resolved against `base`.
    pub fn with_base(config: RunConfig, defaults: &Defaults, base: PathBuf) -> Result<Self, SettingsError> {
        Self::build(config, defaults, Some(base))
    }

    fn build(config: RunConfig, defaults: &Defaults, base: Option<PathBuf>) -> Result<Self, SettingsError> {
        let loader = SettingsLoader::new()?;
        let defaults = loader.defaults(defaults)?;
        Ok(Self {
            config,
            loader,
            defaults,
            base,
        })
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// Resolve the settings of the case at `dir`.
    pub fn resolve(&self, dir: &Path) -> Result<Settings, SettingsError> {
        self.loader
            .resolve_with(self.defaults.clone(), &dir.join(SETTINGS_FILENAME))
    }

    /// Output directory of the case at `dir`.
    pub fn output_path(&self, dir: &Path) -> Result<PathBuf, MirrorError> {
        self.mirror(dir, &self.config.output_root)
    }

    fn mirror(&self, dir: &Path, root: &Path) -> Result<PathBuf, MirrorError> {
        match &self.base {
            Some(base) => mirror::mirror_path_from(base, dir, root),
            None => mirror::compute_mirror_path(dir, root),
        }
    }

    /// Collect the cases found under `root` that match `selection`.
    pub fn collect(&self, root: &Path, selection: &Selection) -> Result<Vec<Case>, walkdir::Error> {
        let dirs = loader::find_cases(root)?;

        let mut ctx = CollectionContext::new();
        let mut cases: Vec<Case> = dirs
            .into_iter()
            .map(|dir| {
                let settings = self.resolve(&dir).map_err(|e| e.to_string());
                if let Ok(settings) = &settings {
                    ctx.record(&dir, &settings.marks);
                }
                Case {
                    name: case_name(root, &dir),
                    dir,
                    settings,
                    marks: BTreeSet::new(),
                }
            })
            .collect();
        for case in &mut cases {
            case.marks = ctx.marks_for(&case.dir);
        }

        cases.retain(|case| selection.matches(&case.name, &case.marks));
        debug!("collected {} test case(s) under {}", cases.len(), root.display());
        Ok(cases)
    }

    /// Run `cases`, in parallel where their output directories do not overlap.
    ///
    /// Results come in the order of `cases`.
    pub fn run_all(&self, cases: &[Case]) -> Vec<CaseResult> {
        if self.config.serial {
            return cases.iter().map(|case| self.run_case(case)).collect();
        }

        let keys: Vec<PathBuf> = cases
            .iter()
            .map(|case| self.output_path(&case.dir).unwrap_or_else(|_| case.dir.clone()))
            .collect();
        let groups = loader::group_nested(&keys);

        let mut indexed: Vec<(usize, CaseResult)> = Vec::with_capacity(cases.len());
        thread::scope(|s| {
            let handles: Vec<_> = groups
                .iter()
                .map(|group| {
                    s.spawn(move || {
                        group
                            .iter()
                            .map(|&index| (index, self.run_case(&cases[index])))
                            .collect::<Vec<_>>()
                    })
                })
                .collect();

            for handle in handles {
                match handle.join() {
                    Ok(results) => indexed.extend(results),
                    Err(_) => tracing::error!("a test case thread panicked"),
                }
            }
        });

        indexed.sort_by_key(|(index, _)| *index);
        indexed.into_iter().map(|(_, result)| result).collect()
    }

    /// Run a single test case.
    pub fn run_case(&self, case: &Case) -> CaseResult {
        info!("running test case {}", case.name);
        let mut result = CaseResult {
            name: case.name.clone(),
            output: None,
            marks: case.marks.clone(),
            tests: Vec::new(),
        };

        let settings = match &case.settings {
            Ok(settings) => settings,
            Err(e) => {
                result
                    .tests
                    .push(TestResult::error("settings", Duration::ZERO, e.clone()));
                return result;
            }
        };

        let start = Instant::now();
        let output_path = match self.create_output_tree(&case.dir) {
            Ok(path) => path,
            Err(e) => {
                result
                    .tests
                    .push(TestResult::error("output", start.elapsed(), e));
                return result;
            }
        };
        result.output = Some(
            output_path
                .strip_prefix(&self.config.output_root)
                .unwrap_or(&output_path)
                .to_path_buf(),
        );

        result.tests.push(self.run_runner(settings, &output_path));
        result
            .tests
            .extend(self.run_regression(&case.dir, settings, &output_path));
        result
    }

    fn create_output_tree(&self, dir: &Path) -> Result<PathBuf, String> {
        let output_path = self.output_path(dir).map_err(|e| e.to_string())?;
        match mirror::materialize(dir, &output_path, self.config.policy, OUTPUT_IGNORED_FILES) {
            Ok(()) => Ok(output_path),
            Err(MirrorError::AlreadyExists(path)) => Err(format!(
                "the output directory \"{}\" already exists: either remove it manually or use \
                 the --clean-output option to remove it or use the --overwrite-output to \
                 overwrite it",
                path.display()
            )),
            Err(e) => Err(e.to_string()),
        }
    }

    fn run_runner(&self, settings: &Settings, output_path: &Path) -> TestResult {
        let Some(runner_path) = &self.config.runner else {
            return TestResult::skipped("runner", "no runner provided with --runner");
        };

        let start = Instant::now();
        let mut variables = settings.runner.clone();
        variables.insert(
            OUTPUT_PATH_KEY.to_string(),
            output_path.display().to_string(),
        );

        let runner = match ScriptRunner::new(runner_path, variables, output_path) {
            Ok(runner) => runner,
            Err(e) => return TestResult::error("runner", start.elapsed(), e.to_string()),
        };

        match runner.run() {
            Ok(_) => TestResult::new("runner", Status::Passed, start.elapsed(), vec![]),
            Err(e @ (RunnerError::Execution { .. } | RunnerError::Timeout { .. })) => {
                TestResult::new("runner", Status::Failed, start.elapsed(), vec![e.to_string()])
            }
            Err(e) => TestResult::error("runner", start.elapsed(), e.to_string()),
        }
    }

    fn run_regression(&self, dir: &Path, settings: &Settings, output_path: &Path) -> Vec<TestResult> {
        let Some(regression_root) = &self.config.regression_root else {
            return vec![TestResult::skipped(
                "regression",
                "no tests references root directory provided to --regression-root",
            )];
        };

        let start = Instant::now();
        let reference_dir = match self.mirror(dir, regression_root) {
            Ok(path) => path,
            Err(e) => return vec![TestResult::error("regression", start.elapsed(), e.to_string())],
        };
        let patterns: Vec<&String> = settings.references.iter().collect();
        let references = match find_references(&reference_dir, &patterns) {
            Ok(refs) => refs,
            Err(e) => return vec![TestResult::error("regression", start.elapsed(), e.to_string())],
        };
        if references.is_empty() {
            return vec![TestResult::skipped("regression", "no reference files")];
        }

        references
            .iter()
            .map(|reference| {
                let start = Instant::now();
                let quantity = reference
                    .relative
                    .file_stem()
                    .map(|s| s.to_string_lossy().into_owned())
                    .unwrap_or_default();
                let tolerances = settings.tolerances.get(&quantity).copied().unwrap_or_default();
                let failures = compare_files(
                    &output_path.join(&reference.relative),
                    &reference.absolute,
                    &tolerances,
                );
                let status = if failures.is_empty() {
                    Status::Passed
                } else {
                    Status::Failed
                };
                TestResult::new(
                    format!("regression[{}]", reference.relative.display()),
                    status,
                    start.elapsed(),
                    failures,
                )
            })
            .collect()
    }
}

/// Name of the case at `dir`, relative to the inputs `root`.
fn case_name(root: &Path, dir: &Path) -> String {
    match dir.strip_prefix(root) {
        Ok(rel) if !rel.as_os_str().is_empty() => rel.display().to_string(),
        _ => dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| dir.display().to_string()),
    }
}
