//! First-match allocation selection and range walking.

use abmatrix_validation::{
    Allocation, Context, Range, RuleError, RuleEvaluator, Scope, TestBucket, TestDefinition,
};

use crate::debug::debug_config;
use crate::hash::HashAssigner;

/// The allocation a request fell into and the bucket it hashed to.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Selection<'a> {
    pub allocation: &'a Allocation,
    pub allocation_index: usize,
    pub bucket: &'a TestBucket,
}

/// Bucket value whose interval contains `position`.
///
/// Intervals are half-open and laid out in declaration order. A position at
/// or beyond the end of the last interval goes to the last non-empty range.
pub fn choose_range(ranges: &[Range], position: f64) -> Option<i32> {
    let mut cumulative = 0.0;
    for range in ranges {
        if range.length > 0.0 && position < cumulative + range.length {
            return Some(range.bucket_value);
        }
        cumulative += range.length;
    }
    ranges
        .iter()
        .rev()
        .find(|r| r.length > 0.0)
        .map(|r| r.bucket_value)
}

pub struct AllocationSelector<'a> {
    evaluator: &'a RuleEvaluator,
}

impl<'a> AllocationSelector<'a> {
    pub fn new(evaluator: &'a RuleEvaluator) -> Self {
        Self { evaluator }
    }

    /// Pick the allocation and bucket for one test.
    ///
    /// `Ok(None)` means the test does not apply: no identity for an
    /// identity-bound test, a false test rule, or no matching allocation.
    pub fn select<'d>(
        &self,
        test_name: &str,
        def: &'d TestDefinition,
        identity: Option<&str>,
        context: &Context,
    ) -> Result<Option<Selection<'d>>, RuleError> {
        if def.test_type.requires_identity() && identity.is_none() {
            return Ok(None);
        }

        let scope = Scope::new(context).with_constants(&def.constants, &def.special_constants);
        if !self
            .evaluator
            .evaluate_cached(def.rule.as_deref(), &def.parsed_rule, scope)?
        {
            self.trace(test_name, "test rule is false");
            return Ok(None);
        }

        let Some((allocation_index, allocation)) = self.match_allocation(test_name, def, scope)?
        else {
            self.trace(test_name, "no allocation matched");
            return Ok(None);
        };

        let position = HashAssigner::new(test_name, def).position(identity);
        let Some(bucket) = choose_range(&allocation.ranges, position).and_then(|v| def.bucket(v))
        else {
            tracing::warn!(
                test = test_name,
                allocation = %allocation.id,
                "allocation has no reachable bucket"
            );
            return Ok(None);
        };

        Ok(Some(Selection {
            allocation,
            allocation_index,
            bucket,
        }))
    }

    fn match_allocation<'d>(
        &self,
        test_name: &str,
        def: &'d TestDefinition,
        scope: Scope<'_>,
    ) -> Result<Option<(usize, &'d Allocation)>, RuleError> {
        for (index, allocation) in def.allocations.iter().enumerate() {
            if self.evaluator.evaluate_cached(
                allocation.rule.as_deref(),
                &allocation.parsed_rule,
                scope,
            )? {
                if debug_config().trace_rules() {
                    tracing::debug!(
                        test = test_name,
                        allocation = %allocation.id,
                        rule = allocation.rule.as_deref().unwrap_or(""),
                        "allocation rule matched"
                    );
                }
                return Ok(Some((index, allocation)));
            }
        }
        Ok(None)
    }

    fn trace(&self, test_name: &str, message: &str) {
        if debug_config().trace_rules() {
            tracing::debug!(test = test_name, "{message}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use abmatrix_validation::ContextValue;
    use serde_json::json;

    fn range(bucket_value: i32, length: f64) -> Range {
        Range {
            bucket_value,
            length,
        }
    }

    fn definition(value: serde_json::Value) -> TestDefinition {
        serde_json::from_value(value).unwrap()
    }

    fn two_allocations() -> TestDefinition {
        definition(json!({
            "testType": "USER",
            "salt": "sample_tst",
            "buckets": [
                {"name": "inactive", "value": -1},
                {"name": "control", "value": 0},
                {"name": "active", "value": 1}
            ],
            "allocations": [
                {"id": "#A1", "rule": "${country == 'US'}", "ranges": [{"bucketValue": 1, "length": 1.0}]},
                {"id": "#B1", "ranges": [{"bucketValue": 0, "length": 1.0}]}
            ]
        }))
    }

    #[test]
    fn test_choose_range_boundaries() {
        let ranges = [range(-1, 0.5), range(0, 0.25), range(1, 0.25)];
        assert_eq!(choose_range(&ranges, 0.0), Some(-1));
        assert_eq!(choose_range(&ranges, 0.4999), Some(-1));
        assert_eq!(choose_range(&ranges, 0.5), Some(0));
        assert_eq!(choose_range(&ranges, 0.75), Some(1));
        assert_eq!(choose_range(&ranges, 1.0), Some(1));
    }

    #[test]
    fn test_choose_range_skips_empty_ranges() {
        let ranges = [range(-1, 0.0), range(0, 1.0), range(1, 0.0)];
        assert_eq!(choose_range(&ranges, 0.0), Some(0));
        assert_eq!(choose_range(&ranges, 1.0), Some(0));
        assert_eq!(choose_range(&[range(3, 0.0)], 0.2), None);
        assert_eq!(choose_range(&[], 0.2), None);
    }

    #[test]
    fn test_first_matching_allocation_wins() {
        let def = two_allocations();
        let evaluator = RuleEvaluator::default();
        let selector = AllocationSelector::new(&evaluator);

        let mut ctx = Context::new();
        ctx.insert("country", ContextValue::from("US"));
        let selection = selector
            .select("sample_tst", &def, Some("user1"), &ctx)
            .unwrap()
            .unwrap();
        assert_eq!(selection.allocation.id, "#A1");
        assert_eq!(selection.allocation_index, 0);
        assert_eq!(selection.bucket.name, "active");

        ctx.insert("country", ContextValue::from("CA"));
        let selection = selector
            .select("sample_tst", &def, Some("user1"), &ctx)
            .unwrap()
            .unwrap();
        assert_eq!(selection.allocation.id, "#B1");
        assert_eq!(selection.bucket.name, "control");
    }

    #[test]
    fn test_always_true_first_allocation_shadows_rest() {
        let def = definition(json!({
            "testType": "USER",
            "salt": "sample_tst",
            "buckets": [{"name": "control", "value": 0}, {"name": "active", "value": 1}],
            "allocations": [
                {"id": "#A1", "rule": "${true}", "ranges": [{"bucketValue": 0, "length": 1.0}]},
                {"id": "#B1", "ranges": [{"bucketValue": 1, "length": 1.0}]}
            ]
        }));
        let evaluator = RuleEvaluator::default();
        let selector = AllocationSelector::new(&evaluator);
        for i in 0..50 {
            let selection = selector
                .select("sample_tst", &def, Some(&format!("user{i}")), &Context::new())
                .unwrap()
                .unwrap();
            assert_eq!(selection.allocation.id, "#A1");
        }
    }

    #[test]
    fn test_missing_identity_skips() {
        let def = two_allocations();
        let evaluator = RuleEvaluator::default();
        let selection = AllocationSelector::new(&evaluator)
            .select("sample_tst", &def, None, &Context::new())
            .unwrap();
        assert!(selection.is_none());
    }

    #[test]
    fn test_rule_error_is_returned() {
        let def = two_allocations();
        let evaluator = RuleEvaluator::default();
        let result =
            AllocationSelector::new(&evaluator).select("sample_tst", &def, Some("u"), &Context::new());
        assert!(matches!(result, Err(RuleError::UndefinedVariable { .. })));
    }

    #[test]
    fn test_test_rule_and_constants() {
        let def = definition(json!({
            "testType": "USER",
            "salt": "sample_tst",
            "rule": "${matrix:contains(LANGS, lang)}",
            "constants": {"LANGS": ["en", "fr"]},
            "buckets": [{"name": "control", "value": 0}],
            "allocations": [{"id": "#A1", "ranges": [{"bucketValue": 0, "length": 1.0}]}]
        }));
        let evaluator = RuleEvaluator::default();
        let selector = AllocationSelector::new(&evaluator);

        let mut ctx = Context::new();
        ctx.insert("lang", ContextValue::from("fr"));
        assert!(selector.select("sample_tst", &def, Some("u"), &ctx).unwrap().is_some());

        ctx.insert("lang", ContextValue::from("de"));
        assert!(selector.select("sample_tst", &def, Some("u"), &ctx).unwrap().is_none());
    }

    #[test]
    fn test_rules_are_parsed_once_per_definition() {
        let def = two_allocations();
        let evaluator = RuleEvaluator::default();
        let selector = AllocationSelector::new(&evaluator);
        assert!(!def.allocations[0].parsed_rule.is_filled());

        let mut ctx = Context::new();
        ctx.insert("country", ContextValue::from("CA"));
        selector.select("sample_tst", &def, Some("user1"), &ctx).unwrap();
        assert!(def.allocations[0].parsed_rule.is_filled());

        // later requests reuse the tree parsed by the first one
        let parsed = def.allocations[0].parsed_rule.parsed("${country == 'US'}").unwrap();
        assert!(matches!(parsed, std::borrow::Cow::Borrowed(_)));
        ctx.insert("country", ContextValue::from("US"));
        let selection = selector
            .select("sample_tst", &def, Some("user1"), &ctx)
            .unwrap()
            .unwrap();
        assert_eq!(selection.allocation.id, "#A1");
    }
}
