//! What a client expects from the test matrix.
//!
//! A specification names the tests the client requires and the buckets it
//! knows for each, declares the context variables it will supply, and lists
//! dynamic filters for tests it wants without naming them.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;

use abmatrix_validation::{
    ConsistencyValidator, Context, IncompatibleTestMatrix, LoadResult, ProvidedContext,
    RuleEvaluator, TestMatrixArtifact, ValidationError,
};
use serde::{Deserialize, Serialize};

use crate::Result;
use crate::filters::{ConfigurationError, FilterRegistry, FilterSpec};

fn default_fallback_value() -> i32 {
    -1
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestSpecification {
    /// Bucket name to value, as the client code knows them.
    #[serde(default)]
    pub buckets: BTreeMap<String, i32>,
    /// Bucket value used when the test does not resolve.
    #[serde(default = "default_fallback_value")]
    pub fallback_value: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl Default for TestSpecification {
    fn default() -> Self {
        Self {
            buckets: BTreeMap::new(),
            fallback_value: default_fallback_value(),
            description: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Specification {
    #[serde(default)]
    pub tests: BTreeMap<String, TestSpecification>,
    /// Context variable name to a type label. When absent, rules are only
    /// checked for syntax.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provided_context: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dynamic_filters: Vec<FilterSpec>,
}

impl Specification {
    pub fn from_path(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path).map_err(ValidationError::from)?;
        let spec = serde_json::from_str(&contents).map_err(ValidationError::from)?;
        Ok(spec)
    }

    pub fn required_tests(&self) -> BTreeSet<String> {
        self.tests.keys().cloned().collect()
    }

    pub fn provided(&self) -> ProvidedContext {
        match &self.provided_context {
            Some(names) => ProvidedContext::new(Context::new(), names.keys().cloned().collect()),
            None => ProvidedContext::syntax_only(),
        }
    }

    /// Check `artifact` against this specification.
    ///
    /// Required tests must exist, pass consistency checks, and agree with the
    /// bucket values declared here. Invalid dynamically selected tests are
    /// reported separately.
    ///
    /// # Errors
    /// Fails only when the dynamic filters cannot be compiled.
    pub fn verify(
        &self,
        matrix_source: &str,
        artifact: &TestMatrixArtifact,
        evaluator: &RuleEvaluator,
        registry: &FilterRegistry,
    ) -> std::result::Result<LoadResult, ConfigurationError> {
        let filters = registry.compile(&self.dynamic_filters)?;
        let required = self.required_tests();
        let dynamic = filters.determine_tests(&artifact.tests, &required);

        let provided = self.provided();
        let validator = ConsistencyValidator::new(evaluator, &provided);
        let mut result =
            validator.verify_artifact(matrix_source, artifact, &required, &dynamic.names);

        for (name, test_spec) in &self.tests {
            if result.invalid_tests.contains_key(name) {
                continue;
            }
            let Some(def) = artifact.get(name) else {
                continue;
            };
            for (bucket_name, expected) in &test_spec.buckets {
                let Some(bucket) = def.bucket_by_name(bucket_name) else {
                    continue;
                };
                if bucket.value != *expected {
                    result.invalid_tests.insert(
                        name.clone(),
                        IncompatibleTestMatrix {
                            test: name.clone(),
                            matrix_source: matrix_source.to_string(),
                            message: format!(
                                "Bucket '{bucket_name}' has value {} in the test matrix, expected {expected}",
                                bucket.value
                            ),
                        },
                    );
                    break;
                }
            }
        }
        Ok(result)
    }
}
