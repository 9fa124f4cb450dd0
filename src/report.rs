//! Test report output.
//!
//! The report database is a YAML file in the output root mapping each case
//! output directory to its status and messages. It is updated, not replaced,
//! so running a subset of the cases keeps the entries of the others.

use crate::runner::{CaseResult, Status};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;
use tracing::debug;

/// Name of the report database file in the output root.
pub const REPORT_DB_FILENAME: &str = "tests_report_db.yaml";

/// Report of one test case.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportEntry {
    pub status: Status,
    #[serde(default)]
    pub messages: Vec<String>,
}

/// Case reports by case output path.
pub type ReportDb = BTreeMap<String, ReportEntry>;

/// Error type for report operations.
#[derive(Debug, thiserror::Error)]
pub enum ReportError {
    #[error("{}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid report database {}: {source}", path.display())]
    Yaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("the report generator {} failed with {status}", path.display())]
    Generator {
        path: PathBuf,
        status: std::process::ExitStatus,
    },
}

/// Create the report database of `results`.
pub fn create(results: &[CaseResult]) -> ReportDb {
    results
        .iter()
        .map(|case| {
            let key = case
                .output
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| case.name.clone());
            let entry = ReportEntry {
                status: case.status(),
                messages: case.messages(),
            };
            (key, entry)
        })
        .collect()
}

/// Merge `new_db` into the database stored at `path`.
///
/// Entries only in the stored database are kept, the others come from `new_db`.
pub fn merge(path: &Path, new_db: ReportDb) -> Result<ReportDb, ReportError> {
    let contents = std::fs::read_to_string(path).map_err(|source| ReportError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let mut db: ReportDb = if contents.trim().is_empty() {
        ReportDb::new()
    } else {
        serde_yaml::from_str(&contents).map_err(|source| ReportError::Yaml {
            path: path.to_path_buf(),
            source,
        })?
    };
    db.extend(new_db);
    Ok(db)
}

/// Write the report database of `results` to `path`, merging with an existing one.
pub fn dump(path: &Path, results: &[CaseResult]) -> Result<ReportDb, ReportError> {
    let mut db = create(results);
    if path.is_file() {
        db = merge(path, db)?;
    }

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|source| ReportError::Io {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    let yaml = serde_yaml::to_string(&db).map_err(|source| ReportError::Yaml {
        path: path.to_path_buf(),
        source,
    })?;
    std::fs::write(path, yaml).map_err(|source| ReportError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    debug!("wrote the report database {}", path.display());
    Ok(db)
}

/// Run the report generator script in the output root.
pub fn generate(generator: &Path, output_root: &Path) -> Result<(), ReportError> {
    debug!("running the report generator {}", generator.display());
    let status = Command::new("sh")
        .arg("-c")
        .arg(generator.as_os_str())
        .current_dir(output_root)
        .status()
        .map_err(|source| ReportError::Io {
            path: generator.to_path_buf(),
            source,
        })?;
    if status.success() {
        Ok(())
    } else {
        Err(ReportError::Generator {
            path: generator.to_path_buf(),
            status,
        })
    }
}

/// Format results as JSON.
pub fn format_json(results: &[CaseResult]) -> serde_json::Value {
    let count = |status: Status| results.iter().filter(|r| r.status() == status).count();
    serde_json::json!({
        "passed": count(Status::Passed),
        "failed": count(Status::Failed),
        "skipped": count(Status::Skipped),
        "errors": count(Status::Error),
        "results": results
            .iter()
            .map(|r| serde_json::json!({
                "case": r,
                "status": r.status(),
            }))
            .collect::<Vec<_>>(),
    })
}

/// Format results as JUnit XML, one test suite per case.
pub fn format_junit_xml(results: &[CaseResult], total_time: Duration) -> String {
    let mut xml = String::new();
    xml.push_str("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");

    let tests = results.iter().flat_map(|r| &r.tests);
    let total_tests = tests.clone().count();
    let total_failures = tests.clone().filter(|t| t.status == Status::Failed).count();
    let total_errors = tests.clone().filter(|t| t.status == Status::Error).count();
    let total_skipped = tests.filter(|t| t.status == Status::Skipped).count();
    let timestamp = chrono::Local::now().format("%Y-%m-%dT%H:%M:%S");

    let _ = writeln!(
        xml,
        "<testsuites tests=\"{total_tests}\" failures=\"{total_failures}\" errors=\"{total_errors}\" skipped=\"{total_skipped}\" time=\"{:.3}\">",
        total_time.as_secs_f64()
    );

    for case in results {
        let count = |status: Status| case.tests.iter().filter(|t| t.status == status).count();
        let _ = writeln!(
            xml,
            "  <testsuite name=\"{}\" tests=\"{}\" failures=\"{}\" errors=\"{}\" skipped=\"{}\" time=\"{:.3}\" timestamp=\"{timestamp}\">",
            escape_xml(&case.name),
            case.tests.len(),
            count(Status::Failed),
            count(Status::Error),
            count(Status::Skipped),
            case.duration().as_secs_f64()
        );

        for test in &case.tests {
            let _ = writeln!(
                xml,
                "    <testcase name=\"{}\" classname=\"{}\" time=\"{:.3}\">",
                escape_xml(&test.name),
                escape_xml(&case.name),
                test.duration.as_secs_f64()
            );

            let message = test.messages.first().map(|s| s.as_str()).unwrap_or("");
            let tag = match test.status {
                Status::Passed => None,
                Status::Failed => Some("failure"),
                Status::Error => Some("error"),
                Status::Skipped => Some("skipped"),
            };
            if let Some(tag) = tag {
                let _ = writeln!(xml, "      <{tag} message=\"{}\">", escape_xml(message));
                for m in &test.messages {
                    let _ = writeln!(xml, "{}", escape_xml(m));
                }
                let _ = writeln!(xml, "      </{tag}>");
            }

            xml.push_str("    </testcase>\n");
        }

        xml.push_str("  </testsuite>\n");
    }

    xml.push_str("</testsuites>\n");
    xml
}

/// Escape special XML characters.
fn escape_xml(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}
