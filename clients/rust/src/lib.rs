//! Client for resolving abmatrix test groups.
//!
//! A [`Matrix`] holds the current test matrix artifact and a [`Resolver`].
//! Backed by a file, it keeps the artifact fresh on a background thread and
//! every call to [`Matrix::resolve`] sees one complete artifact.

mod debug;
pub mod exposure;
pub mod filters;
pub mod hash;
pub mod resolver;
pub mod selector;
pub mod specification;
pub mod testing;

pub use abmatrix_validation::{Context, ContextValue, TestMatrixArtifact, TestType};
pub use exposure::{CompositeObserver, ExposureObserver, MarkingObserver};
pub use filters::{ConfigurationError, FilterRegistry, FilterSpec};
pub use resolver::{
    DefaultMode, ForceGroups, Identifiers, RequestedTests, ResolvedGroups, Resolver, TestGroup,
};
pub use specification::{Specification, TestSpecification};

use std::path::Path;
use std::sync::Arc;

use abmatrix_validation::{
    ArtifactSource, ArtifactWatcher, LoadResult, RefreshPolicy, RuleEvaluator, ValidationError,
    resolve_artifact_path,
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MatrixError {
    #[error("No test matrix is loaded")]
    NoArtifact,

    #[error("Unknown test: {0}")]
    UnknownTest(String),

    #[error("Test '{test}' has no bucket with value {value}")]
    UnknownBucket { test: String, value: i32 },

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),
}

pub type Result<T> = std::result::Result<T, MatrixError>;

/// Resolves test groups against the current artifact.
pub struct Matrix {
    source: Arc<dyn ArtifactSource>,
    resolver: Resolver,
}

impl Matrix {
    /// Load the artifact using fallback chain: `ABMATRIX_ARTIFACT` env var,
    /// then `/etc/abmatrix/test-matrix.json` if it exists, otherwise
    /// `abmatrix/test-matrix.json`.
    pub fn new() -> Result<Self> {
        Self::from_path(&resolve_artifact_path())
    }

    /// Load and watch the artifact at `path`.
    pub fn from_path(path: &Path) -> Result<Self> {
        let watcher = ArtifactWatcher::start(path, RefreshPolicy::from_env())?;
        Ok(Self::with_source(Arc::new(watcher)))
    }

    /// Fixed artifact, never refreshed.
    pub fn from_artifact(artifact: TestMatrixArtifact) -> Self {
        Self::with_source(Arc::new(Arc::new(artifact)))
    }

    pub fn with_source(source: Arc<dyn ArtifactSource>) -> Self {
        Self {
            source,
            resolver: Resolver::default(),
        }
    }

    pub fn with_resolver(mut self, resolver: Resolver) -> Self {
        self.resolver = resolver;
        self
    }

    /// Resolve with the dynamic filters declared in `spec`.
    pub fn with_specification(
        mut self,
        spec: &Specification,
        registry: &FilterRegistry,
    ) -> Result<Self> {
        let filters = registry.compile(&spec.dynamic_filters)?;
        self.resolver = Resolver::new(RuleEvaluator::default(), filters);
        Ok(self)
    }

    pub fn artifact(&self) -> Option<Arc<TestMatrixArtifact>> {
        self.source.current()
    }

    pub fn resolver(&self) -> &Resolver {
        &self.resolver
    }

    pub fn resolve(
        &self,
        identifiers: &Identifiers,
        context: &Context,
        requested: &RequestedTests,
    ) -> Result<ResolvedGroups> {
        self.resolve_with(identifiers, context, requested, &ForceGroups::default())
    }

    /// Resolve honoring `force` and any groups forced on this thread through
    /// [`testing::force_groups`].
    pub fn resolve_with(
        &self,
        identifiers: &Identifiers,
        context: &Context,
        requested: &RequestedTests,
        force: &ForceGroups,
    ) -> Result<ResolvedGroups> {
        if matches!(requested, RequestedTests::Names(names) if names.is_empty()) {
            return Ok(ResolvedGroups::empty());
        }
        let artifact = self.artifact().ok_or(MatrixError::NoArtifact)?;
        let result = match testing::layer_forced(force) {
            Some(layered) => {
                self.resolver
                    .resolve_with(&artifact, identifiers, context, requested, &layered)
            }
            None => self
                .resolver
                .resolve_with(&artifact, identifiers, context, requested, force),
        };
        Ok(result)
    }

    /// Check the current artifact against `spec`.
    pub fn verify(&self, spec: &Specification, registry: &FilterRegistry) -> Result<LoadResult> {
        let artifact = self.artifact().ok_or(MatrixError::NoArtifact)?;
        let result = spec.verify("matrix", &artifact, self.resolver.evaluator(), registry)?;
        Ok(result)
    }
}
