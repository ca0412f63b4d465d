//! Tracking which resolved tests a request actually used.
//!
//! Logging every resolved group inflates exposure counts for tests the
//! request never looked at. An observer wraps a [`ResolvedGroups`], code marks
//! tests as it reads them, and [`ExposureObserver::as_result`] returns only the
//! marked ones. Log the narrowed result with
//! [`ResolvedGroups::to_logging_string`].

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::resolver::ResolvedGroups;

pub trait ExposureObserver: Send + Sync {
    /// Mark a test as used. Unknown names and repeated marks are ignored.
    fn mark_used(&self, test_name: &str);

    fn mark_all_used(&self, test_names: &[&str]) {
        for name in test_names {
            self.mark_used(name);
        }
    }

    fn is_marked(&self, test_name: &str) -> bool;

    /// Snapshot of the marked groups at the time of the call.
    fn as_result(&self) -> ResolvedGroups;
}

/// Starts with nothing marked.
///
/// One flag per resolved test, so marking from several threads never blocks.
#[derive(Debug)]
pub struct MarkingObserver {
    result: Arc<ResolvedGroups>,
    marks: BTreeMap<String, AtomicBool>,
}

impl MarkingObserver {
    pub fn new(result: Arc<ResolvedGroups>) -> Self {
        let marks = result
            .groups()
            .keys()
            .map(|name| (name.clone(), AtomicBool::new(false)))
            .collect();
        Self { result, marks }
    }

    /// The full result this observer narrows.
    pub fn original(&self) -> &ResolvedGroups {
        &self.result
    }
}

impl ExposureObserver for MarkingObserver {
    fn mark_used(&self, test_name: &str) {
        if let Some(flag) = self.marks.get(test_name) {
            flag.store(true, Ordering::Relaxed);
        }
    }

    fn is_marked(&self, test_name: &str) -> bool {
        self.marks
            .get(test_name)
            .is_some_and(|flag| flag.load(Ordering::Relaxed))
    }

    fn as_result(&self) -> ResolvedGroups {
        self.result.filtered(|name| self.is_marked(name))
    }
}

/// Fans marks out to several observers of the same result.
pub struct CompositeObserver {
    result: Arc<ResolvedGroups>,
    observers: Vec<Arc<dyn ExposureObserver>>,
}

impl CompositeObserver {
    pub fn new(result: Arc<ResolvedGroups>, observers: Vec<Arc<dyn ExposureObserver>>) -> Self {
        Self { result, observers }
    }
}

impl ExposureObserver for CompositeObserver {
    fn mark_used(&self, test_name: &str) {
        for observer in &self.observers {
            observer.mark_used(test_name);
        }
    }

    fn is_marked(&self, test_name: &str) -> bool {
        self.observers.iter().any(|o| o.is_marked(test_name))
    }

    /// Groups marked in any underlying observer.
    fn as_result(&self) -> ResolvedGroups {
        self.result.filtered(|name| self.is_marked(name))
    }
}
