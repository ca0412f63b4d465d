//! Serde model of a published test matrix.
//!
//! Field names follow the artifact's camelCase wire format so that documents
//! round-trip without loss.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::rule::RuleCache;
use crate::value::ContextValue;

/// Immutable, versioned snapshot of every test definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestMatrixArtifact {
    pub audit: Audit,
    #[serde(default)]
    pub tests: BTreeMap<String, TestDefinition>,
}

impl TestMatrixArtifact {
    pub fn version(&self) -> &str {
        &self.audit.version
    }

    pub fn get(&self, test_name: &str) -> Option<&TestDefinition> {
        self.tests.get(test_name)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Audit {
    pub version: String,
    /// Epoch milliseconds of the last update.
    #[serde(default)]
    pub updated: i64,
    #[serde(default)]
    pub updated_by: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestDefinition {
    #[serde(default)]
    pub version: String,
    pub test_type: TestType,
    pub salt: String,
    /// Eligibility rule checked before any allocation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule: Option<String>,
    #[serde(skip)]
    pub parsed_rule: RuleCache,
    /// Only resolve when another test resolved to a given bucket.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub depends_on: Option<TestDependency>,
    pub buckets: Vec<TestBucket>,
    pub allocations: Vec<Allocation>,
    #[serde(default)]
    pub constants: BTreeMap<String, ContextValue>,
    #[serde(default)]
    pub special_constants: BTreeMap<String, ContextValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub silent: bool,
    #[serde(default)]
    pub meta_tags: BTreeSet<String>,
    #[serde(default)]
    pub dynamic: bool,
    #[serde(default)]
    pub evaluate_for_incognito_users: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload_experiment_config: Option<PayloadExperimentConfig>,
}

impl TestDefinition {
    pub fn bucket(&self, value: i32) -> Option<&TestBucket> {
        self.buckets.iter().find(|b| b.value == value)
    }

    pub fn bucket_by_name(&self, name: &str) -> Option<&TestBucket> {
        self.buckets.iter().find(|b| b.name == name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestDependency {
    pub test_name: String,
    pub bucket_value: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestBucket {
    pub name: String,
    pub value: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Payload>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Allocation {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule: Option<String>,
    #[serde(skip)]
    pub parsed_rule: RuleCache,
    pub ranges: Vec<Range>,
    #[serde(default)]
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl Allocation {
    /// True when the allocation has no rule, or a blank one.
    pub fn is_unconditional(&self) -> bool {
        self.rule.as_deref().is_none_or(|r| r.trim().is_empty())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Range {
    pub bucket_value: i32,
    pub length: f64,
}

/// Per-bucket configuration. Exactly one kind per payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Payload {
    DoubleValue(f64),
    DoubleArray(Vec<f64>),
    LongValue(i64),
    LongArray(Vec<i64>),
    StringValue(String),
    StringArray(Vec<String>),
    Map(BTreeMap<String, serde_json::Value>),
    Json(serde_json::Value),
}

impl Payload {
    pub fn kind(&self) -> &'static str {
        match self {
            Payload::DoubleValue(_) => "doubleValue",
            Payload::DoubleArray(_) => "doubleArray",
            Payload::LongValue(_) => "longValue",
            Payload::LongArray(_) => "longArray",
            Payload::StringValue(_) => "stringValue",
            Payload::StringArray(_) => "stringArray",
            Payload::Map(_) => "map",
            Payload::Json(_) => "json",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PayloadExperimentConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<String>,
    #[serde(default)]
    pub namespaces: Vec<String>,
}

// TestType

/// Identity source a test hashes on.
///
/// Well-known names have dedicated variants. Anything else is kept as a
/// custom name so artifacts authored for other deployments still load.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TestType {
    User,
    Account,
    Email,
    Random,
    Page,
    Company,
    Custom(String),
}

impl TestType {
    pub fn name(&self) -> &str {
        match self {
            TestType::User => "USER",
            TestType::Account => "ACCOUNT",
            TestType::Email => "EMAIL",
            TestType::Random => "RANDOM",
            TestType::Page => "PAGE",
            TestType::Company => "COMPANY",
            TestType::Custom(name) => name,
        }
    }

    /// Only RANDOM tests resolve without an identity.
    pub fn requires_identity(&self) -> bool {
        !matches!(self, TestType::Random)
    }
}

impl From<&str> for TestType {
    fn from(name: &str) -> Self {
        match name.to_ascii_uppercase().as_str() {
            "USER" | "ANONYMOUS_USER" => TestType::User,
            "ACCOUNT" | "AUTHENTICATED_USER" => TestType::Account,
            "EMAIL" | "EMAIL_ADDRESS" => TestType::Email,
            "RANDOM" => TestType::Random,
            "PAGE" => TestType::Page,
            "COMPANY" => TestType::Company,
            other => TestType::Custom(other.to_string()),
        }
    }
}

impl fmt::Display for TestType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl Serialize for TestType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.name())
    }
}

impl<'de> Deserialize<'de> for TestType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        if name.trim().is_empty() {
            return Err(serde::de::Error::custom("testType must not be empty"));
        }
        Ok(TestType::from(name.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_json() -> serde_json::Value {
        json!({
            "audit": {"version": "42", "updated": 1700000000000i64, "updatedBy": "alice"},
            "tests": {
                "sample_tst": {
                    "version": "7",
                    "testType": "ANONYMOUS_USER",
                    "salt": "sample_tst",
                    "buckets": [
                        {"name": "inactive", "value": -1},
                        {"name": "control", "value": 0, "payload": {"stringValue": "blue"}},
                        {"name": "active", "value": 1, "payload": {"stringValue": "green"}}
                    ],
                    "allocations": [{
                        "id": "#A1",
                        "ranges": [
                            {"bucketValue": -1, "length": 0.5},
                            {"bucketValue": 0, "length": 0.25},
                            {"bucketValue": 1, "length": 0.25}
                        ]
                    }],
                    "constants": {"COUNTRIES": ["US", "CA"]},
                    "metaTags": ["checkout"]
                }
            }
        })
    }

    #[test]
    fn test_deserialize_artifact() {
        let artifact: TestMatrixArtifact = serde_json::from_value(sample_json()).unwrap();
        assert_eq!(artifact.version(), "42");
        assert_eq!(artifact.audit.updated_by, "alice");

        let def = artifact.get("sample_tst").unwrap();
        assert_eq!(def.test_type, TestType::User);
        assert_eq!(def.buckets.len(), 3);
        assert_eq!(def.bucket(0).unwrap().name, "control");
        assert_eq!(
            def.bucket_by_name("active").unwrap().payload,
            Some(Payload::StringValue("green".to_string()))
        );
        assert!(def.allocations[0].is_unconditional());
        assert!(def.meta_tags.contains("checkout"));
        assert!(!def.dynamic);
    }

    #[test]
    fn test_round_trip_preserves_fields() {
        let artifact: TestMatrixArtifact = serde_json::from_value(sample_json()).unwrap();
        let serialized = serde_json::to_value(&artifact).unwrap();
        let reparsed: TestMatrixArtifact = serde_json::from_value(serialized.clone()).unwrap();
        assert_eq!(artifact, reparsed);

        let def = &serialized["tests"]["sample_tst"];
        assert_eq!(def["testType"], json!("USER"));
        assert_eq!(def["allocations"][0]["ranges"][1]["bucketValue"], json!(0));
        assert_eq!(def["buckets"][1]["payload"], json!({"stringValue": "blue"}));
    }

    #[test]
    fn test_depends_on() {
        let mut document = sample_json();
        document["tests"]["sample_tst"]["dependsOn"] = json!({"testName": "parent_tst", "bucketValue": 1});
        let artifact: TestMatrixArtifact = serde_json::from_value(document).unwrap();
        let def = artifact.get("sample_tst").unwrap();
        assert_eq!(
            def.depends_on,
            Some(TestDependency {
                test_name: "parent_tst".to_string(),
                bucket_value: 1,
            })
        );

        let serialized = serde_json::to_value(&artifact).unwrap();
        assert_eq!(
            serialized["tests"]["sample_tst"]["dependsOn"],
            json!({"testName": "parent_tst", "bucketValue": 1})
        );
        // the parse cache never reaches the wire
        assert!(serialized["tests"]["sample_tst"].get("parsedRule").is_none());
    }

    #[test]
    fn test_test_type_aliases_and_custom() {
        assert_eq!(TestType::from("email_address"), TestType::Email);
        assert_eq!(TestType::from("RANDOM"), TestType::Random);
        assert_eq!(
            TestType::from("device"),
            TestType::Custom("DEVICE".to_string())
        );
        assert!(!TestType::Random.requires_identity());
        assert!(TestType::Page.requires_identity());
    }

    #[test]
    fn test_empty_test_type_rejected() {
        let result: Result<TestType, _> = serde_json::from_value(json!(" "));
        assert!(result.is_err());
    }

    #[test]
    fn test_blank_rule_is_unconditional() {
        let allocation = Allocation {
            rule: Some("  ".to_string()),
            parsed_rule: RuleCache::default(),
            ranges: vec![],
            id: String::new(),
            name: None,
        };
        assert!(allocation.is_unconditional());
    }
}
