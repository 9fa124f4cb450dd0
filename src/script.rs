//! Runner script creation and execution.
//!
//! A runner script is a shell script template whose `${name}` placeholders are
//! replaced with the runner settings of a test case. The rendered script is
//! written to the case output directory and executed there with its standard
//! output and error redirected to files next to it.

use crate::template::{self, TemplateError};
use regex::Regex;
use std::collections::BTreeMap;
use std::ffi::OsString;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::LazyLock;
use std::time::{Duration, Instant};
use tracing::debug;

/// Shell used to execute the scripts.
pub const SHELL: &[&str] = &["/usr/bin/env", "bash"];

/// Suffix of the file with the script standard output.
pub const STDOUT_EXT: &str = "stdout";

/// Suffix of the file with the script standard error.
pub const STDERR_EXT: &str = "stderr";

/// Runner setting holding the optional execution timeout.
pub const TIMEOUT_KEY: &str = "timeout";

static TIMEOUT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:\d+(?:\.\d+)?(?:ms|h|m|s)?)+$").expect("valid timeout regex")
});

static TIMEOUT_PART_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+(?:\.\d+)?)(ms|h|m|s)?").expect("valid timeout part regex"));

/// Error type for runner scripts.
#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    /// The script template is missing or is not text.
    #[error("cannot read the script {}: {source}", path.display())]
    ScriptRead {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    /// The script template cannot be rendered.
    #[error("in {}: {source}", path.display())]
    Template {
        path: PathBuf,
        #[source]
        source: TemplateError,
    },
    /// The timeout setting is not a duration.
    #[error("invalid timeout {value:?}: expected a duration such as 90s, 1m30s or 0.5h")]
    InvalidTimeout { value: String },
    /// The script exited with a non-zero status.
    #[error("execution failure, see the stdout and stderr files in {}", workdir.display())]
    Execution {
        workdir: PathBuf,
        status: ExitStatus,
    },
    /// The script ran longer than its timeout and was killed.
    #[error("Command '{command}' timed out after {} seconds", timeout.as_secs_f64())]
    Timeout { command: String, timeout: Duration },
    /// Filesystem or process failure.
    #[error("{}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// A rendered runner script bound to its working directory.
#[derive(Debug)]
pub struct ScriptRunner {
    path: PathBuf,
    workdir: PathBuf,
    content: String,
    timeout: Option<Duration>,
}

impl ScriptRunner {
    /// Render the script template at `path` with `variables`.
    ///
    /// Fails if the template cannot be read as text, if one of its placeholders
    /// has no variable, or if the `timeout` variable is not a duration.
    pub fn new(
        path: &Path,
        variables: BTreeMap<String, String>,
        workdir: &Path,
    ) -> Result<Self, RunnerError> {
        let text = std::fs::read_to_string(path).map_err(|source| RunnerError::ScriptRead {
            path: path.to_path_buf(),
            source,
        })?;
        let content = template::render(&text, &variables).map_err(|source| RunnerError::Template {
            path: path.to_path_buf(),
            source,
        })?;
        let timeout = variables
            .get(TIMEOUT_KEY)
            .map(|value| parse_timeout(value))
            .transpose()?;

        Ok(Self {
            path: path.to_path_buf(),
            workdir: workdir.to_path_buf(),
            content,
            timeout,
        })
    }

    /// The rendered script.
    pub fn content(&self) -> &str {
        &self.content
    }

    /// Path of the rendered script in the working directory.
    pub fn script_path(&self) -> PathBuf {
        self.workdir.join(self.file_name())
    }

    /// Path of the file receiving the script standard output.
    pub fn stdout_path(&self) -> PathBuf {
        self.log_path(STDOUT_EXT)
    }

    /// Path of the file receiving the script standard error.
    pub fn stderr_path(&self) -> PathBuf {
        self.log_path(STDERR_EXT)
    }

    fn file_name(&self) -> OsString {
        self.path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| OsString::from("run.sh"))
    }

    fn log_path(&self, ext: &str) -> PathBuf {
        let mut name = self.file_name();
        name.push(".");
        name.push(ext);
        self.workdir.join(name)
    }

    fn command_line(&self) -> String {
        let mut parts: Vec<String> = SHELL.iter().map(|s| s.to_string()).collect();
        parts.push(self.file_name().to_string_lossy().into_owned());
        parts.join(" ")
    }

    /// Write the script to the working directory and execute it.
    ///
    /// Returns the exit code of the script. The stdout and stderr files are
    /// left in the working directory whatever the outcome.
    pub fn run(&self) -> Result<i32, RunnerError> {
        let script_path = self.script_path();
        debug!("writing the shell script {}", script_path.display());
        unlink(&script_path)?;
        std::fs::write(&script_path, &self.content).map_err(io_error(&script_path))?;
        make_executable(&script_path)?;

        let stdout_path = self.stdout_path();
        let stderr_path = self.stderr_path();
        unlink(&stdout_path)?;
        unlink(&stderr_path)?;
        let stdout = File::create(&stdout_path).map_err(io_error(&stdout_path))?;
        let stderr = File::create(&stderr_path).map_err(io_error(&stderr_path))?;

        debug!("executing the shell script {}", script_path.display());
        // the command owns the log files and closes them when dropped
        let child = {
            let mut cmd = Command::new(SHELL[0]);
            cmd.args(&SHELL[1..])
                .arg(self.file_name())
                .current_dir(&self.workdir)
                .stdin(Stdio::null())
                .stdout(Stdio::from(stdout))
                .stderr(Stdio::from(stderr));
            cmd.spawn().map_err(io_error(&script_path))?
        };

        let status = self.wait(child)?;
        match status.code() {
            Some(0) => Ok(0),
            _ => Err(RunnerError::Execution {
                workdir: self.workdir.clone(),
                status,
            }),
        }
    }

    fn wait(&self, mut child: Child) -> Result<ExitStatus, RunnerError> {
        let script_path = self.script_path();
        let Some(timeout) = self.timeout else {
            return child.wait().map_err(io_error(&script_path));
        };

        let start = Instant::now();
        loop {
            match child.try_wait().map_err(io_error(&script_path))? {
                Some(status) => return Ok(status),
                None => {
                    if start.elapsed() > timeout {
                        let _ = child.kill();
                        let _ = child.wait();
                        return Err(RunnerError::Timeout {
                            command: self.command_line(),
                            timeout,
                        });
                    }
                    std::thread::sleep(Duration::from_millis(10));
                }
            }
        }
    }
}

/// Remove `path` if it is a symbolic link, so writing it never reaches an input file.
fn unlink(path: &Path) -> Result<(), RunnerError> {
    if path.is_symlink() {
        std::fs::remove_file(path).map_err(io_error(path))?;
    }
    Ok(())
}

fn io_error(path: &Path) -> impl FnOnce(io::Error) -> RunnerError + '_ {
    move |source| RunnerError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Add the execute permission for the user and the group.
#[cfg(unix)]
fn make_executable(path: &Path) -> Result<(), RunnerError> {
    use std::os::unix::fs::PermissionsExt;

    let mut permissions = std::fs::metadata(path)
        .map_err(io_error(path))?
        .permissions();
    permissions.set_mode(permissions.mode() | 0o110);
    std::fs::set_permissions(path, permissions).map_err(io_error(path))
}

#[cfg(not(unix))]
fn make_executable(_path: &Path) -> Result<(), RunnerError> {
    Ok(())
}

/// Parse a duration such as `90`, `2s`, `0.1s`, `1m30s`, `250ms` or `1.5h`.
///
/// A number without unit is a number of seconds.
pub fn parse_timeout(value: &str) -> Result<Duration, RunnerError> {
    let invalid = || RunnerError::InvalidTimeout {
        value: value.to_string(),
    };
    let compact: String = value.chars().filter(|c| !c.is_whitespace()).collect();

    if !TIMEOUT_RE.is_match(&compact) {
        return Err(invalid());
    }

    let mut seconds = 0.0;
    for caps in TIMEOUT_PART_RE.captures_iter(&compact) {
        let number: f64 = caps[1].parse().map_err(|_| invalid())?;
        seconds += match caps.get(2).map(|m| m.as_str()) {
            Some("h") => number * 3600.0,
            Some("m") => number * 60.0,
            Some("ms") => number / 1000.0,
            _ => number,
        };
    }
    Duration::try_from_secs_f64(seconds).map_err(|_| invalid())
}
