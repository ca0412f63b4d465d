//! Testing utilities for forcing test groups.
//!
//! # Example
//!
//! ```rust,ignore
//! use abmatrix::Matrix;
//! use abmatrix::testing::force_groups;
//!
//! #[test]
//! fn test_checkout_redesign() {
//!     let matrix = Matrix::from_path(&artifact_path).unwrap();
//!
//!     let _guard = force_groups(&matrix, &[("checkout_tst", 1)]).unwrap();
//!     let groups = matrix.resolve(&ids, &ctx, &RequestedTests::All).unwrap();
//!     assert_eq!(groups.get("checkout_tst").unwrap().bucket.value, 1);
//! }
//! ```

use std::cell::RefCell;
use std::collections::BTreeMap;

use crate::resolver::ForceGroups;
use crate::{Matrix, MatrixError, Result};

thread_local! {
    static FORCED: RefCell<BTreeMap<String, i32>> = const { RefCell::new(BTreeMap::new()) };
}

/// Force `test_name` into `bucket_value` on this thread.
pub fn set_forced_group(test_name: &str, bucket_value: i32) {
    FORCED.with(|f| {
        f.borrow_mut().insert(test_name.to_string(), bucket_value);
    });
}

pub fn get_forced_group(test_name: &str) -> Option<i32> {
    FORCED.with(|f| f.borrow().get(test_name).copied())
}

pub fn clear_forced_group(test_name: &str) {
    FORCED.with(|f| {
        f.borrow_mut().remove(test_name);
    });
}

/// Apply this thread's forced groups on top of `base`.
pub(crate) fn layer_forced(base: &ForceGroups) -> Option<ForceGroups> {
    FORCED.with(|f| {
        let forced = f.borrow();
        if forced.is_empty() {
            return None;
        }
        let layered = forced
            .iter()
            .fold(base.clone(), |groups, (name, value)| groups.force(name.clone(), *value));
        Some(layered)
    })
}

/// Guard that restores forced groups when dropped.
pub struct ForceGuard {
    previous: Vec<(String, Option<i32>)>,
}

impl Drop for ForceGuard {
    fn drop(&mut self) {
        FORCED.with(|f| {
            let mut map = f.borrow_mut();
            for (name, prev) in self.previous.drain(..).rev() {
                match prev {
                    Some(value) => {
                        map.insert(name, value);
                    }
                    None => {
                        map.remove(&name);
                    }
                }
            }
        });
    }
}

/// Force groups for the lifetime of the returned guard.
///
/// Every test must exist in the matrix's current artifact and every value
/// must be one of that test's buckets. Forced groups are thread-local and do
/// not apply to spawned threads.
///
/// # Errors
///
/// Returns an error if:
/// - No artifact is loaded
/// - Any test doesn't exist in the artifact
/// - Any bucket value isn't defined for its test
pub fn force_groups(matrix: &Matrix, groups: &[(&str, i32)]) -> Result<ForceGuard> {
    let artifact = matrix.artifact().ok_or(MatrixError::NoArtifact)?;
    for (name, value) in groups {
        let def = artifact
            .get(name)
            .ok_or_else(|| MatrixError::UnknownTest(name.to_string()))?;
        if def.bucket(*value).is_none() {
            return Err(MatrixError::UnknownBucket {
                test: name.to_string(),
                value: *value,
            });
        }
    }

    let mut previous = Vec::with_capacity(groups.len());
    FORCED.with(|f| {
        let mut map = f.borrow_mut();
        for (name, value) in groups {
            previous.push((name.to_string(), map.get(*name).copied()));
            map.insert(name.to_string(), *value);
        }
    });

    Ok(ForceGuard { previous })
}
