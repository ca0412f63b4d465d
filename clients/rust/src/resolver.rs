//! Resolution of test groups over a whole test matrix.
//!
//! [`Resolver::resolve`] is a pure function of the artifact, the request's
//! identifiers and context, and the requested test set. A test that cannot be
//! resolved (missing identity, false rule, rule error) is left out of the
//! result; it never fails the call.
//!
//! Tests are walked parents first, so a test that depends on another only
//! resolves when that parent landed in the required bucket.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use abmatrix_validation::{
    Context, Payload, RuleEvaluator, TestBucket, TestDefinition, TestMatrixArtifact, TestType,
    evaluation_order,
};
use serde::ser::{Serialize, Serializer};

use crate::debug::debug_config;
use crate::filters::DynamicFilters;
use crate::selector::AllocationSelector;

/// Identity per test type for one request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Identifiers {
    ids: BTreeMap<TestType, String>,
    random_enabled: bool,
}

impl Identifiers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, test_type: TestType, identity: impl Into<String>) -> Self {
        self.insert(test_type, identity);
        self
    }

    pub fn insert(&mut self, test_type: TestType, identity: impl Into<String>) {
        self.ids.insert(test_type, identity.into());
    }

    pub fn get(&self, test_type: &TestType) -> Option<&str> {
        self.ids.get(test_type).map(String::as_str)
    }

    /// RANDOM tests only resolve for requests that enable them.
    pub fn with_random_enabled(mut self, enabled: bool) -> Self {
        self.random_enabled = enabled;
        self
    }

    pub fn random_enabled(&self) -> bool {
        self.random_enabled
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty() && !self.random_enabled
    }
}

/// Tests the caller asks for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestedTests {
    /// Every test in the artifact. Filters are not consulted.
    All,
    /// These tests plus whatever the dynamic filters add.
    Names(BTreeSet<String>),
}

impl RequestedTests {
    pub fn names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        RequestedTests::Names(names.into_iter().map(Into::into).collect())
    }
}

/// How tests without a forced group resolve.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DefaultMode {
    #[default]
    Normal,
    /// No group, so callers use their fallback bucket.
    Fallback,
    /// Lowest bucket value with a non-empty range in the matched allocation.
    MinLive,
}

/// Separates the allocation id from a test group in the exposure line.
const ALLOCATION_GROUP_SEPARATOR: char = ':';

const FALLBACK_TOKEN: &str = "default_to_fallback";
const MIN_LIVE_TOKEN: &str = "default_to_min_live";

/// Groups forced by the caller, typically for QA from a URL parameter or cookie.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ForceGroups {
    forced: BTreeMap<String, i32>,
    default_mode: DefaultMode,
}

impl ForceGroups {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn force(mut self, test_name: impl Into<String>, bucket_value: i32) -> Self {
        self.forced.insert(test_name.into(), bucket_value);
        self
    }

    pub fn with_default_mode(mut self, mode: DefaultMode) -> Self {
        self.default_mode = mode;
        self
    }

    pub fn forced_value(&self, test_name: &str) -> Option<i32> {
        self.forced.get(test_name).copied()
    }

    pub fn forced(&self) -> &BTreeMap<String, i32> {
        &self.forced
    }

    pub fn default_mode(&self) -> DefaultMode {
        self.default_mode
    }

    pub fn is_empty(&self) -> bool {
        self.forced.is_empty() && self.default_mode == DefaultMode::Normal
    }

    /// Parse `my_tst1,other_tst-1,default_to_min_live`.
    ///
    /// Later elements win. Elements that are neither a test name followed by
    /// a bucket value nor a mode token are ignored.
    pub fn parse(input: &str) -> Self {
        let mut groups = Self::new();
        for element in input.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            if element.eq_ignore_ascii_case(FALLBACK_TOKEN) {
                groups.default_mode = DefaultMode::Fallback;
            } else if element.eq_ignore_ascii_case(MIN_LIVE_TOKEN) {
                groups.default_mode = DefaultMode::MinLive;
            } else if let Some((name, value)) = split_forced_group(element) {
                groups.forced.insert(name.to_string(), value);
            }
        }
        groups
    }
}

fn split_forced_group(element: &str) -> Option<(&str, i32)> {
    let digits_start = element
        .trim_end_matches(|c: char| c.is_ascii_digit())
        .len();
    if digits_start == element.len() {
        return None;
    }
    let start = if element[..digits_start].ends_with('-') {
        digits_start - 1
    } else {
        digits_start
    };
    let name = &element[..start];
    if name.is_empty() || !name.chars().all(|c| c.is_alphanumeric() || c == '_') {
        return None;
    }
    element[start..].parse().ok().map(|value| (name, value))
}

/// Resolved group of one test.
#[derive(Debug, Clone, PartialEq)]
pub struct TestGroup {
    pub bucket: TestBucket,
    /// Empty when the group was forced.
    pub allocation_id: String,
    /// Selected through a namespaces filter.
    pub dynamic: bool,
}

#[derive(serde::Serialize)]
struct GroupView<'a> {
    bucket: &'a str,
    value: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    payload: Option<&'a Payload>,
    allocation: &'a str,
}

impl Serialize for TestGroup {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        GroupView {
            bucket: &self.bucket.name,
            value: self.bucket.value,
            payload: self.bucket.payload.as_ref(),
            allocation: &self.allocation_id,
        }
        .serialize(serializer)
    }
}

/// Groups resolved for one request, tied to the artifact they came from.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ResolvedGroups {
    version: String,
    groups: BTreeMap<String, TestGroup>,
    dynamic: BTreeSet<String>,
    #[serde(skip)]
    artifact: Option<Arc<TestMatrixArtifact>>,
}

impl ResolvedGroups {
    /// Result with no groups and no version, as returned for an empty
    /// request.
    pub fn empty() -> Self {
        Self {
            version: String::new(),
            groups: BTreeMap::new(),
            dynamic: BTreeSet::new(),
            artifact: None,
        }
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn groups(&self) -> &BTreeMap<String, TestGroup> {
        &self.groups
    }

    pub fn get(&self, test_name: &str) -> Option<&TestGroup> {
        self.groups.get(test_name)
    }

    /// Tests resolved because a filter selected them.
    pub fn dynamic(&self) -> &BTreeSet<String> {
        &self.dynamic
    }

    /// Definition a group was resolved from.
    pub fn definition(&self, test_name: &str) -> Option<&TestDefinition> {
        if !self.groups.contains_key(test_name) {
            return None;
        }
        self.artifact.as_ref()?.get(test_name)
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Copy keeping only tests for which `keep` is true.
    pub fn filtered(&self, keep: impl Fn(&str) -> bool) -> Self {
        Self {
            version: self.version.clone(),
            groups: self
                .groups
                .iter()
                .filter(|(name, _)| keep(name))
                .map(|(name, group)| (name.clone(), group.clone()))
                .collect(),
            dynamic: self
                .dynamic
                .iter()
                .filter(|name| keep(name))
                .cloned()
                .collect(),
            artifact: self.artifact.clone(),
        }
    }

    /// Exposure line for analytics logging.
    ///
    /// Each logged test appears twice: `name{value}` first, and after all of
    /// those `{allocation}:name{value}` when an allocation id is known.
    /// Silent tests and negative bucket values are left out.
    pub fn to_logging_string(&self) -> String {
        let logged: Vec<(&String, &TestGroup)> = self
            .groups
            .iter()
            .filter(|(name, group)| {
                group.bucket.value >= 0 && !self.definition(name).is_some_and(|def| def.silent)
            })
            .collect();

        let plain = logged
            .iter()
            .map(|(name, group)| format!("{name}{}", group.bucket.value));
        let with_allocation = logged
            .iter()
            .filter(|(_, group)| !group.allocation_id.is_empty())
            .map(|(name, group)| {
                format!(
                    "{}{ALLOCATION_GROUP_SEPARATOR}{name}{}",
                    group.allocation_id, group.bucket.value
                )
            });
        plain.chain(with_allocation).collect::<Vec<_>>().join(",")
    }

    /// `name-bucket` for every resolved test, silent and inactive included.
    pub fn to_long_string(&self) -> String {
        self.groups
            .iter()
            .map(|(name, group)| format!("{name}-{}", group.bucket.name))
            .collect::<Vec<_>>()
            .join(",")
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

/// Resolves test groups. Holds no per-request state.
#[derive(Debug, Default)]
pub struct Resolver {
    evaluator: RuleEvaluator,
    filters: DynamicFilters,
    test_filter: Option<BTreeSet<String>>,
}

impl Resolver {
    pub fn new(evaluator: RuleEvaluator, filters: DynamicFilters) -> Self {
        Self {
            evaluator,
            filters,
            test_filter: None,
        }
    }

    /// Only ever resolve tests in `names`, whatever is requested.
    pub fn with_test_filter(mut self, names: BTreeSet<String>) -> Self {
        self.test_filter = Some(names);
        self
    }

    pub fn evaluator(&self) -> &RuleEvaluator {
        &self.evaluator
    }

    pub fn resolve(
        &self,
        artifact: &Arc<TestMatrixArtifact>,
        identifiers: &Identifiers,
        context: &Context,
        requested: &RequestedTests,
    ) -> ResolvedGroups {
        self.resolve_with(artifact, identifiers, context, requested, &ForceGroups::default())
    }

    /// Resolve honoring forced groups.
    pub fn resolve_with(
        &self,
        artifact: &Arc<TestMatrixArtifact>,
        identifiers: &Identifiers,
        context: &Context,
        requested: &RequestedTests,
        force: &ForceGroups,
    ) -> ResolvedGroups {
        let (required, dynamic) = match requested {
            RequestedTests::All => (None, Default::default()),
            RequestedTests::Names(names) if names.is_empty() => {
                return ResolvedGroups::empty();
            }
            RequestedTests::Names(names) => (
                Some(names),
                self.filters.determine_tests(&artifact.tests, names),
            ),
        };

        let mut result = ResolvedGroups {
            version: artifact.version().to_string(),
            groups: BTreeMap::new(),
            dynamic: BTreeSet::new(),
            artifact: Some(Arc::clone(artifact)),
        };

        let selected: BTreeSet<&str> = artifact
            .tests
            .keys()
            .filter(|name| {
                required.is_none_or(|r| r.contains(*name)) || dynamic.names.contains(*name)
            })
            .map(String::as_str)
            .collect();

        // parents are resolved for gating even when nobody asked for them
        let mut values: BTreeMap<&str, i32> = BTreeMap::new();
        for name in evaluation_order(&artifact.tests, &selected) {
            let Some(def) = artifact.get(name) else {
                continue;
            };
            if self.test_filter.as_ref().is_some_and(|f| !f.contains(name)) {
                continue;
            }
            let Some((bucket, allocation_id)) =
                self.choose(name, def, identifiers, context, force, &values)
            else {
                continue;
            };
            values.insert(name, bucket.value);
            if !selected.contains(name) {
                continue;
            }

            if debug_config().trace_match() {
                tracing::debug!(
                    test = %name,
                    bucket = %bucket.name,
                    allocation = %allocation_id,
                    "resolved test group"
                );
            }
            if dynamic.names.contains(name) {
                result.dynamic.insert(name.to_string());
            }
            result.groups.insert(
                name.to_string(),
                TestGroup {
                    bucket,
                    allocation_id,
                    dynamic: dynamic.namespace_matched.contains(name),
                },
            );
        }
        result
    }

    fn choose(
        &self,
        name: &str,
        def: &TestDefinition,
        identifiers: &Identifiers,
        context: &Context,
        force: &ForceGroups,
        resolved: &BTreeMap<&str, i32>,
    ) -> Option<(TestBucket, String)> {
        if let Some(bucket) = force.forced_value(name).and_then(|v| def.bucket(v)) {
            return Some((bucket.clone(), String::new()));
        }
        if force.default_mode() == DefaultMode::Fallback {
            return None;
        }
        if let Some(dep) = &def.depends_on
            && resolved.get(dep.test_name.as_str()) != Some(&dep.bucket_value)
        {
            return None;
        }
        if def.test_type == TestType::Random && !identifiers.random_enabled() {
            return None;
        }

        let identity = identifiers.get(&def.test_type);
        let selection = match AllocationSelector::new(&self.evaluator).select(
            name,
            def,
            identity,
            context,
        ) {
            Ok(selection) => selection?,
            Err(e) => {
                tracing::warn!(test = name, error = %e, "skipping test, rule evaluation failed");
                return None;
            }
        };

        if force.default_mode() == DefaultMode::MinLive {
            let min_live = selection
                .allocation
                .ranges
                .iter()
                .filter(|r| r.length > 0.0)
                .map(|r| r.bucket_value)
                .min()?;
            return def.bucket(min_live).map(|b| (b.clone(), String::new()));
        }

        Some((selection.bucket.clone(), selection.allocation.id.clone()))
    }
}
