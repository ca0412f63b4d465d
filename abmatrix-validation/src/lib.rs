//! Test matrix model and validation library for abmatrix
//!
//! This library provides the artifact data model, the rule language used by
//! test and allocation rules, structural validation of test definitions, and
//! loading of published artifacts from disk. Artifacts are checked against an
//! embedded JSON Schema before typed deserialization.

pub mod consistency;
pub mod dependency;
pub mod eval;
pub mod expr;
pub mod functions;
pub mod model;
pub mod partial;
pub mod rule;
pub mod value;
pub mod watcher;

pub use consistency::{
    ConsistencyValidator, IncompatibleTestMatrix, LoadResult, ProvidedContext, RANGE_TOLERANCE,
};
pub use dependency::{evaluation_order, verify_dependencies, with_dependencies};
pub use eval::Scope;
pub use functions::FunctionRegistry;
pub use model::{
    Allocation, Audit, Payload, PayloadExperimentConfig, Range, TestBucket, TestDefinition,
    TestDependency, TestMatrixArtifact, TestType,
};
pub use partial::{MaybeBool, PartialRule};
pub use rule::{RuleCache, RuleError, RuleEvaluator};
pub use value::{Context, ContextValue};
pub use watcher::{ArtifactSource, ArtifactWatcher, PrepareFn, RefreshOutcome, RefreshPolicy};

use std::fs;
use std::path::{Path, PathBuf};

use serde_json::Value;

/// Embedded schema describing the shape of a published test matrix
const ARTIFACT_SCHEMA_JSON: &str = include_str!("artifact-schema.json");

const ARTIFACT_ENV_VAR: &str = "ABMATRIX_ARTIFACT";
const SYSTEM_ARTIFACT_PATH: &str = "/etc/abmatrix/test-matrix.json";
const LOCAL_ARTIFACT_PATH: &str = "abmatrix/test-matrix.json";

/// Result type for validation operations
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Errors that can occur while loading and validating a test matrix
#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("Artifact error in {file}: {message}")]
    ArtifactError { file: PathBuf, message: String },

    #[error(transparent)]
    Incompatible(#[from] IncompatibleTestMatrix),

    #[error("No test matrix has been loaded")]
    NotLoaded,

    #[error("Failed to read file: {0}")]
    FileRead(#[from] std::io::Error),

    #[error("Failed to parse JSON: {0}")]
    JSONParse(#[from] serde_json::Error),
}

/// Artifact path using fallback chain: `ABMATRIX_ARTIFACT` env var, then
/// `/etc/abmatrix/test-matrix.json` if it exists, otherwise `abmatrix/test-matrix.json`.
pub fn resolve_artifact_path() -> PathBuf {
    if let Ok(path) = std::env::var(ARTIFACT_ENV_VAR)
        && !path.trim().is_empty()
    {
        return PathBuf::from(path);
    }
    let system = PathBuf::from(SYSTEM_ARTIFACT_PATH);
    if system.exists() {
        return system;
    }
    PathBuf::from(LOCAL_ARTIFACT_PATH)
}

/// Loads test matrix artifacts, checking their structure first.
pub struct ArtifactLoader {
    validator: jsonschema::Validator,
}

impl ArtifactLoader {
    /// Compile the embedded artifact schema
    pub fn new() -> ValidationResult<Self> {
        let schema_error = |message: String| ValidationError::ArtifactError {
            file: PathBuf::from("artifact-schema.json"),
            message,
        };
        let schema: Value = serde_json::from_str(ARTIFACT_SCHEMA_JSON)?;
        let validator = jsonschema::validator_for(&schema)
            .map_err(|e| schema_error(format!("Failed to compile artifact schema: {e}")))?;
        Ok(Self { validator })
    }

    /// Load and check an artifact file
    ///
    /// # Errors
    /// Returns error if the file can't be read, isn't JSON, or doesn't match
    /// the artifact schema
    pub fn load(&self, path: &Path) -> ValidationResult<TestMatrixArtifact> {
        let file = fs::File::open(path)?;
        let data: Value = serde_json::from_reader(std::io::BufReader::new(file))?;
        self.from_value(data, path)
    }

    /// Check an in-memory document; `source` only labels errors
    pub fn from_value(&self, data: Value, source: &Path) -> ValidationResult<TestMatrixArtifact> {
        self.check_structure(&data, source)?;
        serde_json::from_value(data).map_err(|e| ValidationError::ArtifactError {
            file: source.to_path_buf(),
            message: format!("Failed to deserialize test matrix: {e}"),
        })
    }

    pub fn parse_str(&self, json: &str, source: &Path) -> ValidationResult<TestMatrixArtifact> {
        let data: Value = serde_json::from_str(json)?;
        self.from_value(data, source)
    }

    fn check_structure(&self, data: &Value, path: &Path) -> ValidationResult<()> {
        let output = self.validator.evaluate(data);

        if output.flag().valid {
            Ok(())
        } else {
            let errors: Vec<String> = output
                .iter_errors()
                .map(|e| format!("Error: {}", e.error))
                .collect();

            Err(ValidationError::ArtifactError {
                file: path.to_path_buf(),
                message: format!("Artifact validation failed:\n{}", errors.join("\n")),
            })
        }
    }
}

/// Write an artifact as pretty JSON, creating parent directories
pub fn write_artifact(path: &Path, artifact: &TestMatrixArtifact) -> ValidationResult<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(artifact)?;
    fs::write(path, json)?;
    Ok(())
}
