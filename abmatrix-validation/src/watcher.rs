//! Background refresh of the published test matrix.
//!
//! The watcher owns the only mutable slot in the system. Readers take a
//! snapshot with [`ArtifactSource::current`] and keep it for the duration of a
//! resolution, so a refresh never changes an artifact someone is reading.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime};

use arc_swap::ArcSwapOption;

use crate::consistency::{ConsistencyValidator, LoadResult, ProvidedContext, consolidate};
use crate::model::TestMatrixArtifact;
use crate::rule::RuleEvaluator;
use crate::{ArtifactLoader, ValidationError, ValidationResult};

const REFRESH_INTERVAL_ENV_VAR: &str = "ABMATRIX_REFRESH_INTERVAL_SECS";

/// Supplier of immutable artifacts.
pub trait ArtifactSource: Send + Sync {
    /// The artifact to resolve against, or `None` if nothing has loaded yet.
    fn current(&self) -> Option<Arc<TestMatrixArtifact>>;
}

impl ArtifactSource for Arc<TestMatrixArtifact> {
    fn current(&self) -> Option<Arc<TestMatrixArtifact>> {
        Some(Arc::clone(self))
    }
}

/// Step run on every freshly loaded artifact before it is published.
pub type PrepareFn =
    Arc<dyn Fn(TestMatrixArtifact, &Path) -> ValidationResult<TestMatrixArtifact> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefreshPolicy {
    pub interval: Duration,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RefreshPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
        }
    }
}

impl RefreshPolicy {
    /// Defaults, with the poll interval taken from `ABMATRIX_REFRESH_INTERVAL_SECS` when set.
    pub fn from_env() -> Self {
        let mut policy = Self::default();
        if let Some(secs) = std::env::var(REFRESH_INTERVAL_ENV_VAR)
            .ok()
            .and_then(|v| v.trim().parse::<u64>().ok())
            .filter(|secs| *secs > 0)
        {
            policy.interval = Duration::from_secs(secs);
        }
        policy
    }

    /// Delay before the next poll after `failures` consecutive failed loads.
    pub fn backoff(&self, failures: u32) -> Duration {
        if failures == 0 {
            return self.interval;
        }
        let factor = 2u32.saturating_pow(failures - 1);
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// A new artifact with this version was published.
    Loaded(String),
    /// The file held the version already being served.
    Unchanged,
}

/// Default preparation: verify every test and drop the ones that fail.
pub fn drop_invalid_tests(
    artifact: TestMatrixArtifact,
    path: &Path,
) -> ValidationResult<TestMatrixArtifact> {
    let evaluator = RuleEvaluator::default();
    let provided = ProvidedContext::syntax_only();
    let validator = ConsistencyValidator::new(&evaluator, &provided);

    let invalid_tests = validator.verify_all(&path.display().to_string(), &artifact);
    for (name, error) in &invalid_tests {
        tracing::warn!(test = %name, error = %error, "dropping invalid test from test matrix");
    }
    let result = LoadResult {
        invalid_tests,
        ..LoadResult::default()
    };
    Ok(consolidate(artifact, &result))
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn modified_time(path: &Path) -> Option<SystemTime> {
    fs::metadata(path).and_then(|m| m.modified()).ok()
}

struct Inner {
    path: PathBuf,
    loader: ArtifactLoader,
    prepare: PrepareFn,
    slot: ArcSwapOption<TestMatrixArtifact>,
    last_modified: Mutex<Option<SystemTime>>,
    last_error: Mutex<Option<String>>,
}

impl Inner {
    fn is_stale(&self) -> bool {
        let modified = modified_time(&self.path);
        modified.is_none() || modified != *lock(&self.last_modified)
    }

    fn refresh(&self) -> ValidationResult<RefreshOutcome> {
        let result = self.try_refresh();
        match &result {
            Ok(_) => *lock(&self.last_error) = None,
            Err(e) => *lock(&self.last_error) = Some(e.to_string()),
        }
        result
    }

    fn try_refresh(&self) -> ValidationResult<RefreshOutcome> {
        let modified = modified_time(&self.path);
        let artifact = self.loader.load(&self.path)?;
        let artifact = (self.prepare)(artifact, &self.path)?;
        *lock(&self.last_modified) = modified;

        if let Some(current) = self.slot.load_full()
            && current.version() == artifact.version()
        {
            return Ok(RefreshOutcome::Unchanged);
        }

        tracing::info!(
            "loaded test matrix version {} updated by {}",
            artifact.audit.version,
            artifact.audit.updated_by
        );
        let version = artifact.version().to_string();
        self.slot.store(Some(Arc::new(artifact)));
        Ok(RefreshOutcome::Loaded(version))
    }
}

/// Polls an artifact file and republishes it when it changes.
///
/// The background thread stops when the watcher is dropped.
pub struct ArtifactWatcher {
    inner: Arc<Inner>,
    stop_tx: Mutex<Option<Sender<()>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl ArtifactWatcher {
    /// Load `path` and keep it fresh. Fails if the first load fails.
    pub fn start(path: &Path, policy: RefreshPolicy) -> ValidationResult<Self> {
        Self::start_with(path, policy, Arc::new(drop_invalid_tests))
    }

    /// Like [`ArtifactWatcher::start`] with a custom preparation step.
    pub fn start_with(
        path: &Path,
        policy: RefreshPolicy,
        prepare: PrepareFn,
    ) -> ValidationResult<Self> {
        let inner = Self::inner(path, prepare)?;
        inner.refresh()?;
        Self::launch(inner, policy)
    }

    /// Start watching even if the file is missing or invalid right now.
    ///
    /// Until a load succeeds, [`ArtifactSource::current`] returns `None`.
    pub fn spawn(path: &Path, policy: RefreshPolicy) -> ValidationResult<Self> {
        let inner = Self::inner(path, Arc::new(drop_invalid_tests))?;
        if let Err(e) = inner.refresh() {
            tracing::warn!(path = %path.display(), error = %e, "initial test matrix load failed");
        }
        Self::launch(inner, policy)
    }

    fn inner(path: &Path, prepare: PrepareFn) -> ValidationResult<Arc<Inner>> {
        Ok(Arc::new(Inner {
            path: path.to_path_buf(),
            loader: ArtifactLoader::new()?,
            prepare,
            slot: ArcSwapOption::empty(),
            last_modified: Mutex::new(None),
            last_error: Mutex::new(None),
        }))
    }

    fn launch(inner: Arc<Inner>, policy: RefreshPolicy) -> ValidationResult<Self> {
        let (stop_tx, stop_rx) = mpsc::channel();
        let worker = Arc::clone(&inner);
        let handle = thread::Builder::new()
            .name("abmatrix-watcher".to_string())
            .spawn(move || run(&worker, policy, &stop_rx))
            .map_err(|e| ValidationError::ArtifactError {
                file: inner.path.clone(),
                message: format!("Failed to start watcher thread: {e}"),
            })?;

        Ok(Self {
            inner,
            stop_tx: Mutex::new(Some(stop_tx)),
            handle: Mutex::new(Some(handle)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Reload now, regardless of the file's modification time.
    pub fn refresh(&self) -> ValidationResult<RefreshOutcome> {
        self.inner.refresh()
    }

    /// Message of the most recent failed load, cleared by the next success.
    pub fn last_error(&self) -> Option<String> {
        lock(&self.inner.last_error).clone()
    }

    /// Stop the background thread. Safe to call more than once.
    pub fn stop(&self) {
        drop(lock(&self.stop_tx).take());
        if let Some(handle) = lock(&self.handle).take()
            && handle.join().is_err()
        {
            tracing::error!("test matrix watcher thread panicked");
        }
    }
}

impl ArtifactSource for ArtifactWatcher {
    fn current(&self) -> Option<Arc<TestMatrixArtifact>> {
        self.inner.slot.load_full()
    }
}

impl Drop for ArtifactWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(inner: &Inner, policy: RefreshPolicy, stop_rx: &Receiver<()>) {
    let mut failures = 0u32;
    loop {
        match stop_rx.recv_timeout(policy.backoff(failures)) {
            Err(RecvTimeoutError::Timeout) => {}
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }
        // after a failure, retry even if the file did not change
        if failures == 0 && !inner.is_stale() {
            continue;
        }
        match inner.refresh() {
            Ok(_) => failures = 0,
            Err(e) => {
                failures = failures.saturating_add(1);
                tracing::error!(
                    path = %inner.path.display(),
                    error = %e,
                    failures,
                    "failed to refresh test matrix"
                );
                sentry::capture_message(
                    &format!("abmatrix: failed to refresh test matrix: {e}"),
                    sentry::Level::Error,
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::time::Instant;
    use tempfile::TempDir;

    fn matrix(version: &str, length: f64) -> String {
        format!(
            r##"{{
                "audit": {{"version": "{version}", "updated": 0, "updatedBy": "alice"}},
                "tests": {{
                    "sample_tst": {{
                        "testType": "USER",
                        "salt": "sample_tst",
                        "buckets": [{{"name": "control", "value": 0}}, {{"name": "active", "value": 1}}],
                        "allocations": [{{"id": "#A1", "ranges": [
                            {{"bucketValue": 0, "length": 0.5}},
                            {{"bucketValue": 1, "length": {length}}}
                        ]}}]
                    }}
                }}
            }}"##
        )
    }

    fn write_matrix(path: &Path, json: &str) {
        fs::write(path, json).unwrap();
    }

    fn fast_policy() -> RefreshPolicy {
        RefreshPolicy {
            interval: Duration::from_millis(10),
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(40),
        }
    }

    #[test]
    fn test_backoff_doubles_up_to_cap() {
        let policy = RefreshPolicy::default();
        assert_eq!(policy.backoff(0), Duration::from_secs(5));
        assert_eq!(policy.backoff(1), Duration::from_secs(1));
        assert_eq!(policy.backoff(2), Duration::from_secs(2));
        assert_eq!(policy.backoff(4), Duration::from_secs(8));
        assert_eq!(policy.backoff(7), Duration::from_secs(60));
        assert_eq!(policy.backoff(u32::MAX), Duration::from_secs(60));
    }

    #[test]
    fn test_start_loads_artifact() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("test-matrix.json");
        write_matrix(&path, &matrix("1", 0.5));

        let watcher = ArtifactWatcher::start(&path, RefreshPolicy::default()).unwrap();
        let artifact = watcher.current().unwrap();
        assert_eq!(artifact.version(), "1");
        assert!(artifact.get("sample_tst").is_some());
        assert_eq!(watcher.last_error(), None);
    }

    #[test]
    fn test_start_fails_without_file() {
        let temp = TempDir::new().unwrap();
        let result = ArtifactWatcher::start(&temp.path().join("absent.json"), fast_policy());
        assert!(matches!(result, Err(ValidationError::FileRead(_))));
    }

    #[test]
    fn test_spawn_tolerates_missing_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("test-matrix.json");
        let watcher = ArtifactWatcher::spawn(&path, RefreshPolicy::default()).unwrap();
        assert!(watcher.current().is_none());
        assert!(watcher.last_error().is_some());

        write_matrix(&path, &matrix("1", 0.5));
        assert_eq!(
            watcher.refresh().unwrap(),
            RefreshOutcome::Loaded("1".to_string())
        );
        assert!(watcher.last_error().is_none());
    }

    #[test]
    fn test_refresh_skips_same_version() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("test-matrix.json");
        write_matrix(&path, &matrix("1", 0.5));
        let watcher = ArtifactWatcher::start(&path, RefreshPolicy::default()).unwrap();
        let before = watcher.current().unwrap();

        assert_eq!(watcher.refresh().unwrap(), RefreshOutcome::Unchanged);
        assert!(Arc::ptr_eq(&before, &watcher.current().unwrap()));

        write_matrix(&path, &matrix("2", 0.5));
        assert_eq!(
            watcher.refresh().unwrap(),
            RefreshOutcome::Loaded("2".to_string())
        );
        // readers holding the old snapshot are unaffected
        assert_eq!(before.version(), "1");
        assert_eq!(watcher.current().unwrap().version(), "2");
    }

    #[test]
    fn test_failed_refresh_keeps_previous_artifact() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("test-matrix.json");
        write_matrix(&path, &matrix("1", 0.5));
        let watcher = ArtifactWatcher::start(&path, RefreshPolicy::default()).unwrap();

        write_matrix(&path, "{broken");
        assert!(watcher.refresh().is_err());
        assert!(watcher.last_error().unwrap().contains("Failed to parse JSON"));
        assert_eq!(watcher.current().unwrap().version(), "1");
    }

    #[test]
    fn test_invalid_tests_are_dropped() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("test-matrix.json");
        write_matrix(&path, &matrix("1", 0.4));

        let watcher = ArtifactWatcher::start(&path, RefreshPolicy::default()).unwrap();
        let artifact = watcher.current().unwrap();
        assert!(artifact.tests.is_empty());
    }

    #[test]
    fn test_custom_prepare_can_reject() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("test-matrix.json");
        write_matrix(&path, &matrix("1", 0.5));

        let reject: PrepareFn = Arc::new(|_, path| {
            Err(ValidationError::ArtifactError {
                file: path.to_path_buf(),
                message: "rejected".to_string(),
            })
        });
        let result = ArtifactWatcher::start_with(&path, fast_policy(), reject);
        assert!(matches!(result, Err(ValidationError::ArtifactError { .. })));
    }

    #[test]
    fn test_background_thread_picks_up_changes() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("test-matrix.json");
        write_matrix(&path, &matrix("1", 0.5));
        let watcher = ArtifactWatcher::start(&path, fast_policy()).unwrap();

        write_matrix(&path, &matrix("2", 0.5));
        // make sure the mtime moves even on coarse-grained filesystems
        File::options()
            .write(true)
            .open(&path)
            .unwrap()
            .set_modified(SystemTime::now() + Duration::from_secs(10))
            .unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while watcher.current().unwrap().version() != "2" {
            assert!(Instant::now() < deadline, "watcher never reloaded");
            thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn test_stop_is_idempotent() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("test-matrix.json");
        write_matrix(&path, &matrix("1", 0.5));
        let watcher = ArtifactWatcher::start(&path, fast_policy()).unwrap();

        watcher.stop();
        watcher.stop();
        // the last published artifact stays readable
        assert_eq!(watcher.current().unwrap().version(), "1");
    }
}
