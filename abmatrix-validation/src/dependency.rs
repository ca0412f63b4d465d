//! Tests that only resolve when another test resolved to a given bucket.
//!
//! A dependency forms a tree edge from the parent test to the dependent one.
//! Broken edges are found when an artifact is verified, and resolution walks
//! tests parents first.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use crate::model::TestDefinition;

/// Why each test with a broken dependency cannot be served.
///
/// A dependency is broken when the parent is unknown, has another test type,
/// shares the salt, or lacks the bucket, or when the required bucket value is
/// negative. Tests in a cycle, and tests under a broken or `invalid` parent,
/// are broken too.
pub fn verify_dependencies(
    tests: &BTreeMap<String, TestDefinition>,
    invalid: &BTreeSet<String>,
) -> BTreeMap<String, String> {
    let children = children_of(tests);
    let roots = tests.iter().filter(|(_, def)| {
        def.depends_on
            .as_ref()
            .is_none_or(|dep| !tests.contains_key(&dep.test_name))
    });

    let mut reasons = BTreeMap::new();
    let mut traversed = BTreeSet::new();
    let mut queue: VecDeque<&str> = roots.map(|(name, _)| name.as_str()).collect();
    while let Some(name) = queue.pop_front() {
        let Some(def) = tests.get(name) else {
            continue;
        };
        traversed.insert(name);

        let parent_broken = def.depends_on.as_ref().is_some_and(|dep| {
            reasons.contains_key(&dep.test_name) || invalid.contains(&dep.test_name)
        });
        if let Err(reason) = verify_dependency(name, def, tests) {
            reasons.insert(name.to_string(), reason);
        } else if parent_broken {
            reasons.insert(
                name.to_string(),
                format!("Test {name} directly or indirectly depends on an invalid test"),
            );
        }
        queue.extend(children.get(name).into_iter().flatten());
    }

    for name in tests.keys() {
        if !traversed.contains(name.as_str()) {
            reasons.insert(
                name.clone(),
                format!("Test {name} depends on a test with circular dependency"),
            );
        }
    }
    reasons
}

/// Check the direct dependency of one test.
pub fn verify_dependency(
    name: &str,
    def: &TestDefinition,
    tests: &BTreeMap<String, TestDefinition>,
) -> Result<(), String> {
    let Some(dep) = &def.depends_on else {
        return Ok(());
    };
    let parent_name = &dep.test_name;
    let Some(parent) = tests.get(parent_name) else {
        return Err(format!("Test {name} depends on unknown test {parent_name}"));
    };
    // a different identity would skew the dependent's split
    if parent.test_type != def.test_type {
        return Err(format!(
            "Test {name} depends on {parent_name} with different test type: expected {} but {}",
            def.test_type, parent.test_type
        ));
    }
    if parent.salt == def.salt {
        return Err(format!(
            "Test {name} depends on {parent_name} with the same salt: {}",
            parent.salt
        ));
    }
    if dep.bucket_value < 0 {
        return Err(format!(
            "Test {name} depends on negative bucket value {} of {parent_name}",
            dep.bucket_value
        ));
    }
    if parent.bucket(dep.bucket_value).is_none() {
        return Err(format!(
            "Test {name} depends on an undefined bucket {} of {parent_name}",
            dep.bucket_value
        ));
    }
    Ok(())
}

/// `names` plus every test they transitively depend on.
///
/// Names missing from `tests` are dropped.
pub fn with_dependencies<'a, I, S>(
    tests: &'a BTreeMap<String, TestDefinition>,
    names: I,
) -> BTreeSet<&'a str>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut out = BTreeSet::new();
    for name in names {
        let mut current = tests.get_key_value(name.as_ref());
        while let Some((name, def)) = current {
            if !out.insert(name.as_str()) {
                break;
            }
            current = def
                .depends_on
                .as_ref()
                .and_then(|dep| tests.get_key_value(&dep.test_name));
        }
    }
    out
}

/// `names` and their parents, ordered so each parent comes before its
/// dependents. Tests in a dependency cycle are left out.
pub fn evaluation_order<'a, I, S>(
    tests: &'a BTreeMap<String, TestDefinition>,
    names: I,
) -> Vec<&'a str>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let wanted = with_dependencies(tests, names);
    let parent_of = |name: &str| {
        tests
            .get(name)
            .and_then(|def| def.depends_on.as_ref())
            .map(|dep| dep.test_name.as_str())
            .filter(|parent| wanted.contains(parent))
    };

    let mut children: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    let mut queue = VecDeque::new();
    for &name in &wanted {
        match parent_of(name) {
            Some(parent) => children.entry(parent).or_default().push(name),
            None => queue.push_back(name),
        }
    }

    let mut order = Vec::with_capacity(wanted.len());
    while let Some(name) = queue.pop_front() {
        order.push(name);
        queue.extend(children.remove(name).into_iter().flatten());
    }
    order
}

fn children_of(tests: &BTreeMap<String, TestDefinition>) -> BTreeMap<&str, Vec<&str>> {
    let mut children: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    for (name, def) in tests {
        if let Some(dep) = &def.depends_on {
            children
                .entry(dep.test_name.as_str())
                .or_default()
                .push(name.as_str());
        }
    }
    children
}
