//! Test case settings.
//!
//! The settings of a test case come from two documents: the global defaults
//! and the `test-settings.yaml` of the case directory. Both are validated
//! against the settings schema, merged, validated again, then projected onto
//! [`Settings`].

use jsonschema::{Draft, Validator};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use tracing::debug;

/// The built-in global defaults.
pub const DEFAULT_SETTINGS: &str = include_str!("test-settings.yaml");

/// A raw settings document: a mapping at the root level.
pub type Document = Map<String, Value>;

/// Comparison tolerances of a quantity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct Tolerances {
    /// The relative tolerance.
    #[serde(default)]
    #[schemars(range(min = 0.0))]
    pub rel: f64,

    /// The absolute tolerance.
    #[serde(default)]
    #[schemars(range(min = 0.0))]
    pub abs: f64,
}

impl Tolerances {
    /// Whether `actual` is within tolerance of `expected`.
    ///
    /// The accepted deviation is `abs + rel * |expected|`; with the default
    /// tolerances the values must be equal. Non-finite values are only accepted
    /// when equal, NaN matching NaN.
    pub fn accepts(&self, actual: f64, expected: f64) -> bool {
        if actual == expected || (actual.is_nan() && expected.is_nan()) {
            return true;
        }
        if !actual.is_finite() || !expected.is_finite() {
            return false;
        }
        (actual - expected).abs() <= self.abs + self.rel * expected.abs()
    }
}

/// The settings of a test case.
///
/// Keys of a settings document that are not fields of this type are accepted
/// and ignored.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[schemars(title = "test-settings")]
pub struct Settings {
    /// Variables substituted into the runner script.
    #[serde(default)]
    pub runner: BTreeMap<String, String>,

    /// Marks attached to the test case.
    #[serde(default)]
    pub marks: BTreeSet<String>,

    /// Glob patterns of the reference files.
    #[serde(default)]
    pub references: BTreeSet<String>,

    /// Comparison tolerances by quantity name.
    #[serde(default)]
    pub tolerances: BTreeMap<String, Tolerances>,
}

/// Generate the JSON schema of a settings document.
pub fn generate_schema() -> schemars::schema::RootSchema {
    schemars::schema_for!(Settings)
}

/// Error type for settings operations.
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    /// Failed to read a settings file.
    #[error("cannot read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    /// Failed to parse YAML.
    #[error("invalid YAML in {}: {source}", path.display())]
    Yaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    /// Failed to parse TOML.
    #[error("invalid TOML in {}: {source}", path.display())]
    Toml {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    /// Unsupported file extension.
    #[error("unsupported settings format: {ext} (expected .yaml, .yml, or .toml)")]
    UnsupportedFormat { ext: String },
    /// A document does not match the settings schema.
    #[error("{origin} does not match the settings schema:\n  {}", errors.join("\n  "))]
    Schema { origin: String, errors: Vec<String> },
    /// The settings schema itself could not be compiled.
    #[error("invalid settings schema: {0}")]
    InvalidSchema(String),
    /// A valid document could not be converted into [`Settings`].
    #[error("cannot read the settings of {origin}: {source}")]
    Projection {
        origin: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Where the global defaults come from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Defaults {
    /// The defaults shipped with this crate.
    #[default]
    Builtin,
    /// A user supplied settings file.
    File(PathBuf),
}

/// Loads settings documents and validates them against the settings schema.
pub struct SettingsLoader {
    validator: Validator,
}

impl SettingsLoader {
    pub fn new() -> Result<Self, SettingsError> {
        let schema = serde_json::to_value(generate_schema())
            .map_err(|e| SettingsError::InvalidSchema(e.to_string()))?;
        let validator = jsonschema::options()
            .with_draft(Draft::Draft7)
            .build(&schema)
            .map_err(|e| SettingsError::InvalidSchema(e.to_string()))?;
        Ok(Self { validator })
    }

    /// Load and validate a settings file.
    ///
    /// An empty file is an empty mapping.
    pub fn load(&self, path: &Path) -> Result<Document, SettingsError> {
        debug!("loading settings from {}", path.display());
        let contents = std::fs::read_to_string(path).map_err(|source| SettingsError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
        let data: Value = match ext {
            "yaml" | "yml" => {
                if is_blank_yaml(&contents) {
                    Value::Null
                } else {
                    serde_yaml::from_str(&contents).map_err(|source| SettingsError::Yaml {
                        path: path.to_path_buf(),
                        source,
                    })?
                }
            }
            "toml" => toml::from_str(&contents).map_err(|source| SettingsError::Toml {
                path: path.to_path_buf(),
                source,
            })?,
            other => {
                return Err(SettingsError::UnsupportedFormat {
                    ext: other.to_string(),
                });
            }
        };

        self.validated(data, &path.display().to_string())
    }

    /// Parse and validate the built-in defaults.
    pub fn builtin(&self) -> Result<Document, SettingsError> {
        let data: Value =
            serde_yaml::from_str(DEFAULT_SETTINGS).map_err(|source| SettingsError::Yaml {
                path: PathBuf::from("<builtin>"),
                source,
            })?;
        self.validated(data, "the built-in settings")
    }

    /// Load the global defaults.
    pub fn defaults(&self, defaults: &Defaults) -> Result<Document, SettingsError> {
        match defaults {
            Defaults::Builtin => self.builtin(),
            Defaults::File(path) => self.load(path),
        }
    }

    /// Validate a document against the settings schema.
    pub fn validate(&self, data: &Value, origin: &str) -> Result<(), SettingsError> {
        let errors: Vec<String> = self
            .validator
            .iter_errors(data)
            .map(|e| {
                let at = e.instance_path().to_string();
                if at.is_empty() {
                    e.to_string()
                } else {
                    format!("{e} at {at}")
                }
            })
            .collect();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(SettingsError::Schema {
                origin: origin.to_string(),
                errors,
            })
        }
    }

    fn validated(&self, data: Value, origin: &str) -> Result<Document, SettingsError> {
        let data = match data {
            Value::Null => Value::Object(Map::new()),
            other => other,
        };
        self.validate(&data, origin)?;
        match data {
            Value::Object(map) => Ok(map),
            _ => Err(SettingsError::Schema {
                origin: origin.to_string(),
                errors: vec!["the document root shall be a mapping".to_string()],
            }),
        }
    }

    /// Resolve the settings of a case from a global and a local file.
    pub fn resolve(&self, global_path: &Path, local_path: &Path) -> Result<Settings, SettingsError> {
        let global = self.load(global_path)?;
        self.resolve_with(global, local_path)
    }

    /// Resolve the settings of a case from already loaded defaults.
    pub fn resolve_with(&self, global: Document, local_path: &Path) -> Result<Settings, SettingsError> {
        let local = self.load(local_path)?;
        let merged = Value::Object(merge(global, local));

        let origin = format!("{} merged with the defaults", local_path.display());
        self.validate(&merged, &origin)?;
        serde_json::from_value(merged).map_err(|source| SettingsError::Projection { origin, source })
    }
}

fn is_blank_yaml(contents: &str) -> bool {
    contents.lines().all(|line| {
        let line = line.trim();
        line.is_empty() || line.starts_with('#')
    })
}

/// Resolve the settings of a case from a global and a local settings file.
pub fn resolve(global_path: &Path, local_path: &Path) -> Result<Settings, SettingsError> {
    SettingsLoader::new()?.resolve(global_path, local_path)
}

/// Merge `local` into `global`.
///
/// Mappings are merged recursively, local sequence items missing from the
/// global sequence are appended to it, any other local value replaces the
/// global one. Keys only in `global` are kept.
pub fn merge(mut global: Document, local: Document) -> Document {
    for (key, value) in local {
        let merged = merge_value(global.remove(&key), value);
        global.insert(key, merged);
    }
    global
}

fn merge_value(global: Option<Value>, local: Value) -> Value {
    match (global, local) {
        (Some(Value::Object(global)), Value::Object(local)) => Value::Object(merge(global, local)),
        (_, Value::Object(local)) => Value::Object(merge(Map::new(), local)),
        (Some(Value::Array(mut global)), Value::Array(local)) => {
            for item in local {
                if !global.contains(&item) {
                    global.push(item);
                }
            }
            Value::Array(global)
        }
        (_, local) => local,
    }
}
