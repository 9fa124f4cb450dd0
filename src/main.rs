use clap::{Parser, Subcommand, ValueEnum};
use exetest::loader::{self, Selection};
use exetest::mirror::OverwritePolicy;
use exetest::report::{self, REPORT_DB_FILENAME};
use exetest::runner::{CaseResult, OUTPUT_PATH_KEY, RunConfig, Session, Status};
use exetest::settings::{self, Defaults, SettingsLoader};
use exetest::{SETTINGS_FILENAME, template};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::exit;
use tracing_subscriber::EnvFilter;

#[derive(Clone, Copy, Default, ValueEnum)]
enum OutputFormat {
    /// Human-readable output with checkmarks
    #[default]
    Human,
    /// Machine-readable JSON output
    Json,
    /// JUnit XML output for CI systems
    Junit,
}

#[derive(Parser)]
#[command(name = "exetest")]
#[command(about = "A regression test runner for executables driven by per-case settings files")]
#[command(version)]
struct Cli {
    /// Show debug logs
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the test cases found under a path
    Run {
        /// Inputs directory, case directory or settings file
        path: PathBuf,
        /// Runner shell script template
        #[arg(long)]
        runner: Option<PathBuf>,
        /// Root directory of the test outputs
        #[arg(long, default_value = "tests-output")]
        output_root: PathBuf,
        /// Overwrite the existing output directories
        #[arg(long, conflicts_with = "clean_output")]
        overwrite_output: bool,
        /// Remove the existing output directories before running
        #[arg(long)]
        clean_output: bool,
        /// Root directory of the reference files
        #[arg(long)]
        regression_root: Option<PathBuf>,
        /// Global default settings file (YAML or TOML)
        #[arg(long)]
        default_settings: Option<PathBuf>,
        /// Script run in the output root once the report database is written
        #[arg(long)]
        report_generator: Option<PathBuf>,
        /// Output format
        #[arg(short, long, default_value = "human")]
        output: OutputFormat,
        /// Filter cases by name (substring match)
        #[arg(short, long)]
        filter: Option<String>,
        /// Only run the cases with this mark (repeatable)
        #[arg(short, long = "mark")]
        marks: Vec<String>,
        /// Run the cases one after the other
        #[arg(long)]
        serial: bool,
    },
    /// Check the settings of the test cases without running them
    Validate {
        /// Inputs directory, case directory or settings file
        path: PathBuf,
        /// Runner shell script template to check against each case
        #[arg(long)]
        runner: Option<PathBuf>,
        /// Global default settings file (YAML or TOML)
        #[arg(long)]
        default_settings: Option<PathBuf>,
    },
    /// Scaffold a test case settings file
    Init {
        /// Test case directory
        #[arg(default_value = ".")]
        dir: PathBuf,
        /// Runner shell script template whose placeholders are added to the settings
        #[arg(long)]
        runner: Option<PathBuf>,
    },
    /// Output the settings schema
    Schema,
}

fn main() {
    let cli = Cli::parse();
    install_tracing(cli.verbose);

    match cli.command {
        Command::Run {
            path,
            runner,
            output_root,
            overwrite_output,
            clean_output,
            regression_root,
            default_settings,
            report_generator,
            output,
            filter,
            marks,
            serial,
        } => {
            let path = existing_path("path", &path);
            let config = RunConfig {
                runner: runner.map(|p| existing_path("--runner", &p)),
                output_root: absolute_path(&output_root),
                regression_root: regression_root.map(|p| existing_path("--regression-root", &p)),
                policy: OverwritePolicy {
                    must_not_exist: !overwrite_output,
                    clean_if_exists: clean_output,
                },
                serial,
            };
            let defaults = defaults_from(default_settings);
            let report_generator = report_generator.map(|p| existing_path("--report-generator", &p));

            let session = match Session::new(config, &defaults) {
                Ok(s) => s,
                Err(e) => {
                    eprintln!("Error loading default settings: {e}");
                    exit(1);
                }
            };

            let selection = Selection { filter, marks };
            let cases = match session.collect(&path, &selection) {
                Ok(c) => c,
                Err(e) => {
                    eprintln!("Error finding test cases: {e}");
                    exit(1);
                }
            };
            if cases.is_empty() {
                eprintln!("No test cases found at: {}", path.display());
                exit(1);
            }

            let run_start = std::time::Instant::now();
            let results = session.run_all(&cases);
            let total_time = run_start.elapsed();

            match output {
                OutputFormat::Human => print_human(&results),
                OutputFormat::Json => match serde_json::to_string_pretty(&report::format_json(&results)) {
                    Ok(json) => println!("{json}"),
                    Err(e) => eprintln!("Error serializing results: {e}"),
                },
                OutputFormat::Junit => print!("{}", report::format_junit_xml(&results, total_time)),
            }

            let output_root = &session.config().output_root;
            let db_path = output_root.join(REPORT_DB_FILENAME);
            match report::dump(&db_path, &results) {
                Ok(_) => {
                    if let Some(generator) = &report_generator
                        && let Err(e) = report::generate(generator, output_root)
                    {
                        eprintln!("Error generating the report: {e}");
                    }
                }
                Err(e) => eprintln!("Error writing the report database: {e}"),
            }

            let broken = results
                .iter()
                .any(|r| matches!(r.status(), Status::Failed | Status::Error));
            if broken {
                exit(1);
            }
        }
        Command::Validate {
            path,
            runner,
            default_settings,
        } => {
            let path = existing_path("path", &path);
            let runner_text = runner.map(|p| {
                let p = existing_path("--runner", &p);
                match fs::read_to_string(&p) {
                    Ok(text) => text,
                    Err(e) => {
                        eprintln!("Error reading {}: {e}", p.display());
                        exit(1);
                    }
                }
            });

            let settings_loader = match SettingsLoader::new() {
                Ok(l) => l,
                Err(e) => {
                    eprintln!("Error: {e}");
                    exit(1);
                }
            };
            let defaults = match settings_loader.defaults(&defaults_from(default_settings)) {
                Ok(d) => d,
                Err(e) => {
                    eprintln!("Error loading default settings: {e}");
                    exit(1);
                }
            };

            let cases = match loader::find_cases(&path) {
                Ok(c) => c,
                Err(e) => {
                    eprintln!("Error finding test cases: {e}");
                    exit(1);
                }
            };
            if cases.is_empty() {
                eprintln!("No test cases found at: {}", path.display());
                exit(1);
            }

            let mut errors = 0;
            for dir in &cases {
                let checked = settings_loader
                    .resolve_with(defaults.clone(), &dir.join(SETTINGS_FILENAME))
                    .map_err(|e| e.to_string())
                    .and_then(|settings| match &runner_text {
                        Some(text) => {
                            let mut vars = settings.runner.clone();
                            vars.insert(OUTPUT_PATH_KEY.to_string(), dir.display().to_string());
                            template::render(text, &vars)
                                .map(|_| settings)
                                .map_err(|e| format!("runner: {e}"))
                        }
                        None => Ok(settings),
                    });
                match checked {
                    Ok(_) => println!("✓ {}", dir.display()),
                    Err(e) => {
                        eprintln!("✗ {}: {e}", dir.display());
                        errors += 1;
                    }
                }
            }

            if errors > 0 {
                eprintln!("\n{errors} test case(s) failed validation");
                exit(1);
            }
            println!("\nAll {} test case(s) valid", cases.len());
        }
        Command::Init { dir, runner } => {
            let path = dir.join(SETTINGS_FILENAME);
            if path.exists() {
                eprintln!("Error: file already exists: {}", path.display());
                exit(1);
            }

            let runner_keys = match runner {
                Some(p) => {
                    let p = existing_path("--runner", &p);
                    match fs::read_to_string(&p) {
                        Ok(text) => template::placeholders(&text),
                        Err(e) => {
                            eprintln!("Error reading {}: {e}", p.display());
                            exit(1);
                        }
                    }
                }
                None => Vec::new(),
            };

            if let Err(e) = fs::create_dir_all(&dir) {
                eprintln!("Error creating directory: {e}");
                exit(1);
            }
            if let Err(e) = fs::write(&path, scaffold(&runner_keys)) {
                eprintln!("Error writing file: {e}");
                exit(1);
            }
            println!("Created: {}", path.display());
        }
        Command::Schema => {
            let schema = settings::generate_schema();
            match serde_json::to_string_pretty(&schema) {
                Ok(json) => println!("{json}"),
                Err(e) => {
                    eprintln!("Error serializing the schema: {e}");
                    exit(1);
                }
            }
        }
    }
}

fn install_tracing(verbose: bool) {
    let mut filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    if verbose && let Ok(directive) = "exetest=debug".parse() {
        filter = filter.add_directive(directive);
    }
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

/// Resolve a path given on the command line, exiting on a missing path.
fn existing_path(option: &str, path: &Path) -> PathBuf {
    match path.canonicalize() {
        Ok(p) => p,
        Err(_) => {
            eprintln!("error: argument {option}: no such file or directory: {}", path.display());
            exit(2);
        }
    }
}

fn absolute_path(path: &Path) -> PathBuf {
    std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf())
}

fn defaults_from(path: Option<PathBuf>) -> Defaults {
    match path {
        Some(p) => Defaults::File(existing_path("--default-settings", &p)),
        None => Defaults::Builtin,
    }
}

fn print_human(results: &[CaseResult]) {
    for case in results {
        println!("\n{}", case.name);
        for test in &case.tests {
            match test.status {
                Status::Passed => println!("  ✓ {} ({:.2?})", test.name, test.duration),
                Status::Skipped => {
                    let reason = test.messages.first().map(String::as_str).unwrap_or("");
                    println!("  - {} (skipped: {reason})", test.name);
                }
                Status::Failed | Status::Error => {
                    println!("  ✗ {} ({:.2?})", test.name, test.duration);
                    for message in &test.messages {
                        println!("    {message}");
                    }
                }
            }
        }
    }

    let count = |status: Status| results.iter().filter(|r| r.status() == status).count();
    println!(
        "\n{} passed, {} failed, {} skipped, {} errors",
        count(Status::Passed),
        count(Status::Failed),
        count(Status::Skipped),
        count(Status::Error)
    );
}

/// Contents of a new settings file.
fn scaffold(runner_keys: &[String]) -> String {
    let mut text = String::from("# Settings of this test case.\n\n");
    let keys: Vec<&String> = runner_keys
        .iter()
        .filter(|k| k.as_str() != OUTPUT_PATH_KEY)
        .collect();
    if keys.is_empty() {
        text.push_str("runner: {}\n");
    } else {
        text.push_str("runner:\n");
        for key in keys {
            text.push_str(&format!("  {key}: \"\"\n"));
        }
    }
    text.push_str(
        "\n# marks:\n#   - slow\n\n# references:\n#   - \"*.dat\"\n\n# tolerances:\n#   result:\n#     rel: 0.0\n#     abs: 0.0\n",
    );
    text
}
