use std::fmt::Write as _;

use abmatrix_validation::{Audit, LoadResult, TestMatrixArtifact};
use chrono::{DateTime, Utc};

use crate::loader::Definitions;

/// Version used when none is given: the build time, sortable as a string
pub fn default_version(now: DateTime<Utc>) -> String {
    now.format("%Y%m%d%H%M%S").to_string()
}

pub fn assemble_artifact(
    definitions: Definitions,
    version: &str,
    author: &str,
    updated: DateTime<Utc>,
) -> TestMatrixArtifact {
    TestMatrixArtifact {
        audit: Audit {
            version: version.to_string(),
            updated: updated.timestamp_millis(),
            updated_by: author.to_string(),
        },
        tests: definitions
            .into_iter()
            .map(|(name, file)| (name, file.definition))
            .collect(),
    }
}

/// Human readable summary of a verification run
pub fn format_report(artifact: &TestMatrixArtifact, result: &LoadResult) -> String {
    let mut report = String::new();
    let updated = DateTime::<Utc>::from_timestamp_millis(artifact.audit.updated)
        .map(|t| t.to_rfc3339())
        .unwrap_or_else(|| artifact.audit.updated.to_string());
    let _ = writeln!(
        report,
        "test matrix version {} updated by {} at {}",
        artifact.audit.version, artifact.audit.updated_by, updated
    );

    let invalid = result.invalid_tests.len() + result.dynamic_test_errors.len();
    let valid = artifact.tests.len().saturating_sub(invalid);
    let _ = writeln!(report, "{valid} of {} tests valid", artifact.tests.len());

    for (name, error) in &result.invalid_tests {
        let _ = writeln!(report, "invalid: {name}: {}", error.message);
    }
    for name in &result.missing_tests {
        let _ = writeln!(report, "missing: {name}");
    }
    for (name, error) in &result.dynamic_test_errors {
        let _ = writeln!(report, "warning: dynamic test {name}: {}", error.message);
    }
    report.trim_end().to_string()
}
