//! Dynamic test selection.
//!
//! A client lists the tests it needs by name, and may also ask for tests it
//! does not know about yet through filters: every defined test matched by at
//! least one filter is resolved as well. Filters are declared as
//! [`FilterSpec`] values (JSON discriminated by `type`) and compiled once
//! through a [`FilterRegistry`], which carries the external pattern source
//! used by `tag` filters.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use abmatrix_validation::TestDefinition;
use arc_swap::ArcSwap;
use regex::Regex;
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ConfigurationError {
    #[error("{kind} filter requires a non-empty {field}")]
    EmptyFilter {
        kind: &'static str,
        field: &'static str,
    },

    #[error("Invalid pattern '{pattern}': {source}")]
    InvalidPattern {
        pattern: String,
        source: regex::Error,
    },

    #[error("tag filter requires a pattern source, none is registered")]
    MissingPatternSource,
}

/// Declared dynamic filter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FilterSpec {
    /// Every defined test. Nothing about such tests can be checked up front.
    MatchAll,
    TestNames { names: BTreeSet<String> },
    /// Full match of the test name against `regex`.
    NamePattern { regex: String },
    NamePrefix { prefix: String },
    MetaTagsFilter { meta_tags: BTreeSet<String> },
    /// Tests whose payload experiment config lists one of `namespaces`.
    /// Matches are flagged as dynamic in the result.
    NamespacesFilter { namespaces: BTreeSet<String> },
    /// Patterns looked up by tag in the registry's pattern source.
    Tag { tags: BTreeSet<String> },
}

impl FilterSpec {
    pub fn kind(&self) -> &'static str {
        match self {
            FilterSpec::MatchAll => "match_all",
            FilterSpec::TestNames { .. } => "test_names",
            FilterSpec::NamePattern { .. } => "name_pattern",
            FilterSpec::NamePrefix { .. } => "name_prefix",
            FilterSpec::MetaTagsFilter { .. } => "meta_tags_filter",
            FilterSpec::NamespacesFilter { .. } => "namespaces_filter",
            FilterSpec::Tag { .. } => "tag",
        }
    }
}

/// Compile `pattern` so it has to match the whole name.
pub fn full_match_regex(pattern: &str) -> Result<Regex, ConfigurationError> {
    Regex::new(&format!("^(?:{pattern})$")).map_err(|source| ConfigurationError::InvalidPattern {
        pattern: pattern.to_string(),
        source,
    })
}

/// Supplies test name patterns for tags, usually managed centrally.
pub trait PatternSource: Send + Sync {
    fn patterns(&self, tags: &BTreeSet<String>) -> Vec<Regex>;
}

/// Fixed tag to patterns mapping.
#[derive(Debug, Clone, Default)]
pub struct StaticPatterns {
    by_tag: BTreeMap<String, Vec<Regex>>,
}

impl StaticPatterns {
    pub fn new(patterns: BTreeMap<String, Vec<String>>) -> Result<Self, ConfigurationError> {
        let mut by_tag = BTreeMap::new();
        for (tag, sources) in patterns {
            let compiled = sources
                .iter()
                .map(|p| full_match_regex(p))
                .collect::<Result<Vec<_>, _>>()?;
            by_tag.insert(tag, compiled);
        }
        Ok(Self { by_tag })
    }
}

impl PatternSource for StaticPatterns {
    fn patterns(&self, tags: &BTreeSet<String>) -> Vec<Regex> {
        tags.iter()
            .filter_map(|tag| self.by_tag.get(tag))
            .flatten()
            .cloned()
            .collect()
    }
}

/// Pattern source whose mapping can be replaced while filters are in use.
#[derive(Debug, Default)]
pub struct SwappablePatterns {
    current: ArcSwap<StaticPatterns>,
}

impl SwappablePatterns {
    pub fn new(initial: StaticPatterns) -> Self {
        Self {
            current: ArcSwap::from_pointee(initial),
        }
    }

    pub fn replace(&self, patterns: StaticPatterns) {
        self.current.store(Arc::new(patterns));
    }
}

impl PatternSource for SwappablePatterns {
    fn patterns(&self, tags: &BTreeSet<String>) -> Vec<Regex> {
        self.current.load().patterns(tags)
    }
}

/// Context needed to turn filter declarations into matchers.
#[derive(Clone, Default)]
pub struct FilterRegistry {
    pattern_source: Option<Arc<dyn PatternSource>>,
}

impl fmt::Debug for FilterRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FilterRegistry")
            .field("pattern_source", &self.pattern_source.is_some())
            .finish()
    }
}

impl FilterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_pattern_source(mut self, source: Arc<dyn PatternSource>) -> Self {
        self.pattern_source = Some(source);
        self
    }

    /// Validate and compile filter declarations.
    ///
    /// # Errors
    /// Returns a [`ConfigurationError`] for empty filter arguments, invalid
    /// regexes, or `tag` filters without a registered pattern source.
    pub fn compile(&self, specs: &[FilterSpec]) -> Result<DynamicFilters, ConfigurationError> {
        let filters = specs
            .iter()
            .map(|spec| self.compile_one(spec))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(DynamicFilters { filters })
    }

    fn compile_one(&self, spec: &FilterSpec) -> Result<Filter, ConfigurationError> {
        let empty = |field| ConfigurationError::EmptyFilter {
            kind: spec.kind(),
            field,
        };
        Ok(match spec {
            FilterSpec::MatchAll => Filter::MatchAll,
            FilterSpec::TestNames { names } => {
                if names.is_empty() {
                    return Err(empty("names"));
                }
                Filter::TestNames(names.clone())
            }
            FilterSpec::NamePattern { regex } => {
                if regex.is_empty() {
                    return Err(empty("regex"));
                }
                Filter::NamePattern(full_match_regex(regex)?)
            }
            FilterSpec::NamePrefix { prefix } => {
                if prefix.is_empty() {
                    return Err(empty("prefix"));
                }
                Filter::NamePrefix(prefix.clone())
            }
            FilterSpec::MetaTagsFilter { meta_tags } => {
                if meta_tags.is_empty() {
                    return Err(empty("meta_tags"));
                }
                Filter::MetaTags(meta_tags.clone())
            }
            FilterSpec::NamespacesFilter { namespaces } => {
                if namespaces.is_empty() {
                    return Err(empty("namespaces"));
                }
                Filter::Namespaces(namespaces.clone())
            }
            FilterSpec::Tag { tags } => {
                if tags.is_empty() {
                    return Err(empty("tags"));
                }
                let source = self
                    .pattern_source
                    .clone()
                    .ok_or(ConfigurationError::MissingPatternSource)?;
                Filter::Tag {
                    tags: tags.clone(),
                    source,
                }
            }
        })
    }
}

enum Filter {
    MatchAll,
    TestNames(BTreeSet<String>),
    NamePattern(Regex),
    NamePrefix(String),
    MetaTags(BTreeSet<String>),
    Namespaces(BTreeSet<String>),
    Tag {
        tags: BTreeSet<String>,
        source: Arc<dyn PatternSource>,
    },
}

impl Filter {
    fn matches(&self, name: &str, def: &TestDefinition) -> bool {
        match self {
            Filter::MatchAll => true,
            Filter::TestNames(names) => names.contains(name),
            Filter::NamePattern(regex) => regex.is_match(name),
            Filter::NamePrefix(prefix) => name.starts_with(prefix.as_str()),
            Filter::MetaTags(tags) => !tags.is_disjoint(&def.meta_tags),
            Filter::Namespaces(namespaces) => def
                .payload_experiment_config
                .as_ref()
                .is_some_and(|cfg| cfg.namespaces.iter().any(|ns| namespaces.contains(ns))),
            Filter::Tag { tags, source } => source
                .patterns(tags)
                .iter()
                .any(|pattern| pattern.is_match(name)),
        }
    }
}

/// Tests selected by filters beyond the required set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DynamicTests {
    pub names: BTreeSet<String>,
    /// Subset of `names` matched through a namespaces filter.
    pub namespace_matched: BTreeSet<String>,
}

/// Compiled filters. Matching is a union: a test matched by any filter is in.
#[derive(Default)]
pub struct DynamicFilters {
    filters: Vec<Filter>,
}

impl fmt::Debug for DynamicFilters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DynamicFilters")
            .field("filters", &self.filters.len())
            .finish()
    }
}

impl DynamicFilters {
    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    /// Tests in `defined`, other than the `required` ones, matched by any filter.
    pub fn determine_tests(
        &self,
        defined: &BTreeMap<String, TestDefinition>,
        required: &BTreeSet<String>,
    ) -> DynamicTests {
        let mut result = DynamicTests::default();
        if self.filters.is_empty() {
            return result;
        }
        for (name, def) in defined {
            if required.contains(name) {
                continue;
            }
            for filter in &self.filters {
                if filter.matches(name, def) {
                    result.names.insert(name.clone());
                    if matches!(filter, Filter::Namespaces(_)) {
                        result.namespace_matched.insert(name.clone());
                    }
                }
            }
        }
        result
    }
}
