//! Structural checks run whenever a test matrix is built or loaded.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use crate::dependency::{verify_dependencies, with_dependencies};
use crate::eval::Scope;
use crate::model::{TestDefinition, TestMatrixArtifact};
use crate::partial::PartialRule;
use crate::rule::{RuleCache, RuleError, RuleEvaluator, is_blank};
use crate::value::Context;

/// Ranges in one allocation must add up to 1 within this tolerance.
pub const RANGE_TOLERANCE: f64 = 1e-6;

/// A test definition that cannot be served.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("Invalid test '{test}' in {matrix_source}: {message}")]
pub struct IncompatibleTestMatrix {
    pub test: String,
    pub matrix_source: String,
    pub message: String,
}

/// Variables a client promises to supply when evaluating rules.
#[derive(Debug, Clone, Default)]
pub struct ProvidedContext {
    /// Sample values used to evaluate rules during validation.
    pub values: Context,
    /// Names the client declares but cannot give a value for at build time.
    pub uninstantiated: BTreeSet<String>,
    /// When false, rules are only checked for syntax.
    pub evaluate: bool,
}

impl ProvidedContext {
    pub fn new(values: Context, uninstantiated: BTreeSet<String>) -> Self {
        Self {
            values,
            uninstantiated,
            evaluate: true,
        }
    }

    /// Syntax checks only. Used when the client's context is not declared.
    pub fn syntax_only() -> Self {
        Self::default()
    }
}

/// Outcome of verifying an artifact against what a client requires.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoadResult {
    pub invalid_tests: BTreeMap<String, IncompatibleTestMatrix>,
    pub missing_tests: BTreeSet<String>,
    pub dynamic_test_errors: BTreeMap<String, IncompatibleTestMatrix>,
}

impl LoadResult {
    pub fn has_invalid_tests(&self) -> bool {
        !self.invalid_tests.is_empty()
    }

    pub fn has_missing_tests(&self) -> bool {
        !self.missing_tests.is_empty()
    }

    pub fn is_clean(&self) -> bool {
        !self.has_invalid_tests() && !self.has_missing_tests() && self.dynamic_test_errors.is_empty()
    }
}

pub struct ConsistencyValidator<'a> {
    evaluator: &'a RuleEvaluator,
    provided: &'a ProvidedContext,
}

impl<'a> ConsistencyValidator<'a> {
    pub fn new(evaluator: &'a RuleEvaluator, provided: &'a ProvidedContext) -> Self {
        Self {
            evaluator,
            provided,
        }
    }

    /// Check one definition, returning the first problem found.
    pub fn verify(
        &self,
        test_name: &str,
        matrix_source: &str,
        def: &TestDefinition,
    ) -> Result<(), IncompatibleTestMatrix> {
        let fail = |message: String| IncompatibleTestMatrix {
            test: test_name.to_string(),
            matrix_source: matrix_source.to_string(),
            message,
        };

        if def.buckets.is_empty() {
            return Err(fail(format!("No buckets specified in test {test_name}")));
        }
        let mut values = HashSet::new();
        let mut names = HashSet::new();
        for bucket in &def.buckets {
            if !values.insert(bucket.value) {
                return Err(fail(format!(
                    "Duplicate bucket value {} in test {test_name}",
                    bucket.value
                )));
            }
            if !names.insert(bucket.name.as_str()) {
                return Err(fail(format!(
                    "Duplicate bucket name '{}' in test {test_name}",
                    bucket.name
                )));
            }
        }

        self.verify_rule(def.rule.as_deref(), &def.parsed_rule, def)
            .map_err(|e| fail(format!("Invalid test rule: {e}")))?;

        if def.allocations.is_empty() {
            return Err(fail(format!("No allocations specified in test {test_name}")));
        }

        let last = def.allocations.len() - 1;
        for (index, allocation) in def.allocations.iter().enumerate() {
            let rule_label = allocation.rule.as_deref().unwrap_or("");
            if allocation.ranges.is_empty() {
                return Err(fail(format!(
                    "No ranges specified in allocation {index} of test {test_name}"
                )));
            }

            let mut total = 0.0;
            for range in &allocation.ranges {
                if !values.contains(&range.bucket_value) {
                    return Err(fail(format!(
                        "Allocation range in {test_name} from {matrix_source} refers to unknown bucket value {}",
                        range.bucket_value
                    )));
                }
                if !range.length.is_finite() || !(0.0..=1.0).contains(&range.length) {
                    return Err(fail(format!(
                        "Allocation range in {test_name} has invalid length {}",
                        range.length
                    )));
                }
                total += range.length;
            }
            if (total - 1.0).abs() > RANGE_TOLERANCE {
                let terms: Vec<String> = allocation
                    .ranges
                    .iter()
                    .map(|r| r.length.to_string())
                    .collect();
                return Err(fail(format!(
                    "{test_name} range with rule '{rule_label}' does not add up to 1 : {} = {total}",
                    terms.join(" + ")
                )));
            }

            if index < last && allocation.is_unconditional() {
                return Err(fail(format!(
                    "Allocation {index} of test {test_name} has an empty rule but is not the last allocation"
                )));
            }

            self.verify_rule(allocation.rule.as_deref(), &allocation.parsed_rule, def)
                .map_err(|e| fail(format!("Invalid allocation rule in allocation {index}: {e}")))?;
        }

        verify_payloads(def).map_err(fail)
    }

    /// Verify every test in the artifact, collecting failures by name.
    ///
    /// A test whose dependency is broken fails too, as does every test
    /// below it.
    pub fn verify_all(
        &self,
        matrix_source: &str,
        artifact: &TestMatrixArtifact,
    ) -> BTreeMap<String, IncompatibleTestMatrix> {
        let mut errors: BTreeMap<_, _> = artifact
            .tests
            .iter()
            .filter_map(|(name, def)| {
                self.verify(name, matrix_source, def)
                    .err()
                    .map(|e| (name.clone(), e))
            })
            .collect();
        let invalid = errors.keys().cloned().collect();
        for (name, message) in verify_dependencies(&artifact.tests, &invalid) {
            errors
                .entry(name.clone())
                .or_insert_with(|| IncompatibleTestMatrix {
                    test: name,
                    matrix_source: matrix_source.to_string(),
                    message,
                });
        }
        errors
    }

    /// Verify the tests a client requires plus those dynamically included.
    ///
    /// Tests they depend on are verified as well. A broken test reached only
    /// through a dependency is reported with the dynamic errors.
    pub fn verify_artifact(
        &self,
        matrix_source: &str,
        artifact: &TestMatrixArtifact,
        required: &BTreeSet<String>,
        dynamic: &BTreeSet<String>,
    ) -> LoadResult {
        let mut result = LoadResult::default();

        for name in required {
            if artifact.get(name).is_none() {
                tracing::error!(test = %name, source = matrix_source, "required test is missing from the test matrix");
                result.missing_tests.insert(name.clone());
            }
        }

        let reached = with_dependencies(&artifact.tests, required.union(dynamic));
        let mut errors = BTreeMap::new();
        for &name in &reached {
            if let Some(def) = artifact.get(name)
                && let Err(e) = self.verify(name, matrix_source, def)
            {
                errors.insert(name.to_string(), e);
            }
        }
        let invalid = errors.keys().cloned().collect();
        for (name, message) in verify_dependencies(&artifact.tests, &invalid) {
            if reached.contains(name.as_str()) && !errors.contains_key(&name) {
                let e = IncompatibleTestMatrix {
                    test: name.clone(),
                    matrix_source: matrix_source.to_string(),
                    message,
                };
                errors.insert(name, e);
            }
        }

        for (name, e) in errors {
            if required.contains(&name) {
                tracing::error!(test = %name, error = %e, "required test is invalid");
                result.invalid_tests.insert(name, e);
            } else {
                tracing::warn!(test = %name, error = %e, "dynamically included test is invalid");
                result.dynamic_test_errors.insert(name, e);
            }
        }

        result
    }

    fn verify_rule(
        &self,
        rule: Option<&str>,
        cache: &RuleCache,
        def: &TestDefinition,
    ) -> Result<(), RuleError> {
        let Some(rule) = rule.filter(|_| !is_blank(rule)) else {
            return Ok(());
        };
        let expr = cache.parsed(rule)?;
        if !self.provided.evaluate {
            return Ok(());
        }

        let scope = Scope::new(&self.provided.values)
            .with_constants(&def.constants, &def.special_constants);
        for name in expr.identifiers() {
            if !scope.contains(&name) && !self.provided.uninstantiated.contains(&name) {
                return Err(RuleError::UndefinedVariable {
                    rule: rule.to_string(),
                    name,
                });
            }
        }
        PartialRule::from_expr(rule, &expr, &scope.names())
            .evaluate(self.evaluator, scope)
            .map(|_| ())
    }
}

/// Drop every test the load result flagged, so it is never served.
pub fn consolidate(mut artifact: TestMatrixArtifact, result: &LoadResult) -> TestMatrixArtifact {
    artifact.tests.retain(|name, _| {
        !result.invalid_tests.contains_key(name) && !result.dynamic_test_errors.contains_key(name)
    });
    artifact
}

fn verify_payloads(def: &TestDefinition) -> Result<(), String> {
    let with_payload: Vec<_> = def
        .buckets
        .iter()
        .filter_map(|b| b.payload.as_ref().map(|p| (b, p)))
        .collect();
    let Some((_, first)) = with_payload.first() else {
        return Ok(());
    };
    if with_payload.len() != def.buckets.len() {
        return Err("Either all buckets must have payloads or none may".to_string());
    }
    for (bucket, payload) in &with_payload {
        if payload.kind() != first.kind() {
            return Err(format!(
                "Payload of bucket '{}' is {}, expected {}",
                bucket.name,
                payload.kind(),
                first.kind()
            ));
        }
    }
    Ok(())
}
