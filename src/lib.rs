//! Regression testing of executables driven by per-case settings files.
//!
//! A test case is a directory holding a `test-settings.yaml` file. Each case
//! is shallow copied to a mirrored output directory, a runner shell script
//! rendered from the case settings is executed there, and the produced files
//! are compared with reference files found in a mirrored reference directory.

pub mod compare;
pub mod loader;
pub mod mirror;
pub mod references;
pub mod report;
pub mod runner;
pub mod script;
pub mod settings;
pub mod template;

/// Name of the file that makes a directory a test case.
pub const SETTINGS_FILENAME: &str = "test-settings.yaml";
