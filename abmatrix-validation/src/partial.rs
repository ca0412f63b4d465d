//! Three-valued analysis of rules whose variables are only partly known.
//!
//! [`PartialRule::analyze`] builds a new tree from a parsed rule: every
//! subexpression that reads an unknown variable becomes [`MaybeExpr::Unknown`],
//! except `&&`, `||` and `!`, which keep their structure and combine their
//! operands with [`MaybeBool`] logic. The result is read as "not FALSE", so an
//! unknown outcome counts as possibly true.
//!
//! This is a validation tool. Request-time evaluation never goes through it.

use std::collections::BTreeSet;
use std::fmt;

use crate::eval::Scope;
use crate::expr::{Expr, UnaryOp, parse_rule};
use crate::rule::{RuleError, RuleEvaluator};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaybeBool {
    True,
    False,
    Unknown,
}

impl MaybeBool {
    /// FALSE if either side is FALSE, TRUE if both are TRUE, else UNKNOWN.
    pub fn and(self, other: MaybeBool) -> MaybeBool {
        match (self, other) {
            (MaybeBool::False, _) | (_, MaybeBool::False) => MaybeBool::False,
            (MaybeBool::True, MaybeBool::True) => MaybeBool::True,
            _ => MaybeBool::Unknown,
        }
    }

    /// TRUE if either side is TRUE, FALSE if both are FALSE, else UNKNOWN.
    pub fn or(self, other: MaybeBool) -> MaybeBool {
        match (self, other) {
            (MaybeBool::True, _) | (_, MaybeBool::True) => MaybeBool::True,
            (MaybeBool::False, MaybeBool::False) => MaybeBool::False,
            _ => MaybeBool::Unknown,
        }
    }

    pub fn negate(self) -> MaybeBool {
        match self {
            MaybeBool::True => MaybeBool::False,
            MaybeBool::False => MaybeBool::True,
            MaybeBool::Unknown => MaybeBool::Unknown,
        }
    }
}

impl From<bool> for MaybeBool {
    fn from(b: bool) -> Self {
        if b { MaybeBool::True } else { MaybeBool::False }
    }
}

impl fmt::Display for MaybeBool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MaybeBool::True => "TRUE",
            MaybeBool::False => "FALSE",
            MaybeBool::Unknown => "UNKNOWN",
        };
        f.write_str(name)
    }
}

/// Rewritten rule tree.
#[derive(Debug, Clone, PartialEq)]
pub enum MaybeExpr {
    /// Subtree reading only known variables, evaluated as a plain boolean.
    Known(Expr),
    Unknown,
    And(Box<MaybeExpr>, Box<MaybeExpr>),
    Or(Box<MaybeExpr>, Box<MaybeExpr>),
    Not(Box<MaybeExpr>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum PartialTree {
    /// No unknown variables: the original expression, unchanged.
    Complete(Expr),
    /// Three-valued tree, true unless it evaluates to FALSE.
    NotFalse(MaybeExpr),
}

#[derive(Debug, Clone, PartialEq)]
pub struct PartialRule {
    rule: String,
    tree: PartialTree,
}

enum Rewrite {
    Plain(Expr),
    Maybe(MaybeExpr),
}

impl Rewrite {
    fn lift(self) -> MaybeExpr {
        match self {
            Rewrite::Plain(expr) => MaybeExpr::Known(expr),
            Rewrite::Maybe(maybe) => maybe,
        }
    }
}

fn rewrite(expr: &Expr, known: &BTreeSet<String>) -> Rewrite {
    if expr.identifiers().iter().all(|name| known.contains(name)) {
        return Rewrite::Plain(expr.clone());
    }
    match expr {
        Expr::And(left, right) => Rewrite::Maybe(MaybeExpr::And(
            Box::new(rewrite(left, known).lift()),
            Box::new(rewrite(right, known).lift()),
        )),
        Expr::Or(left, right) => Rewrite::Maybe(MaybeExpr::Or(
            Box::new(rewrite(left, known).lift()),
            Box::new(rewrite(right, known).lift()),
        )),
        Expr::Unary(UnaryOp::Not, inner) => {
            Rewrite::Maybe(MaybeExpr::Not(Box::new(rewrite(inner, known).lift())))
        }
        _ => Rewrite::Maybe(MaybeExpr::Unknown),
    }
}

impl PartialRule {
    /// Parse `rule` and rewrite it given the variables known to exist.
    pub fn analyze(rule: &str, known: &BTreeSet<String>) -> Result<Self, RuleError> {
        let expr = parse_rule(rule)?;
        Ok(Self::from_expr(rule, &expr, known))
    }

    pub fn from_expr(rule: &str, expr: &Expr, known: &BTreeSet<String>) -> Self {
        let tree = match rewrite(expr, known) {
            Rewrite::Plain(expr) => PartialTree::Complete(expr),
            Rewrite::Maybe(maybe) => PartialTree::NotFalse(maybe),
        };
        Self {
            rule: rule.to_string(),
            tree,
        }
    }

    pub fn tree(&self) -> &PartialTree {
        &self.tree
    }

    pub fn has_unknowns(&self) -> bool {
        matches!(self.tree, PartialTree::NotFalse(_))
    }

    /// Three-valued outcome of the rewritten tree.
    pub fn evaluate_maybe(
        &self,
        evaluator: &RuleEvaluator,
        scope: Scope<'_>,
    ) -> Result<MaybeBool, RuleError> {
        match &self.tree {
            PartialTree::Complete(expr) => evaluator
                .evaluate_expr(&self.rule, expr, scope)
                .map(MaybeBool::from),
            PartialTree::NotFalse(maybe) => self.eval_maybe(maybe, evaluator, scope),
        }
    }

    /// True unless the rule is decidably FALSE.
    pub fn evaluate(&self, evaluator: &RuleEvaluator, scope: Scope<'_>) -> Result<bool, RuleError> {
        Ok(self.evaluate_maybe(evaluator, scope)? != MaybeBool::False)
    }

    fn eval_maybe(
        &self,
        maybe: &MaybeExpr,
        evaluator: &RuleEvaluator,
        scope: Scope<'_>,
    ) -> Result<MaybeBool, RuleError> {
        Ok(match maybe {
            MaybeExpr::Known(expr) => evaluator
                .evaluate_expr(&self.rule, expr, scope)
                .map(MaybeBool::from)?,
            MaybeExpr::Unknown => MaybeBool::Unknown,
            // both operands are evaluated so errors on either side surface
            MaybeExpr::And(left, right) => {
                let left = self.eval_maybe(left, evaluator, scope)?;
                left.and(self.eval_maybe(right, evaluator, scope)?)
            }
            MaybeExpr::Or(left, right) => {
                let left = self.eval_maybe(left, evaluator, scope)?;
                left.or(self.eval_maybe(right, evaluator, scope)?)
            }
            MaybeExpr::Not(inner) => self.eval_maybe(inner, evaluator, scope)?.negate(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::{Context, ContextValue};

    fn known(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    fn ident(name: &str) -> Expr {
        Expr::Identifier(name.to_string())
    }

    fn outcome(rule: &str, pairs: &[(&str, ContextValue)]) -> MaybeBool {
        let ctx: Context = pairs.iter().cloned().collect();
        let names: BTreeSet<String> = ctx.keys().map(str::to_string).collect();
        let partial = PartialRule::analyze(rule, &names).unwrap();
        partial
            .evaluate_maybe(&RuleEvaluator::default(), Scope::new(&ctx))
            .unwrap()
    }

    #[test]
    fn test_truth_tables() {
        use MaybeBool::*;
        assert_eq!(Unknown.and(False), False);
        assert_eq!(Unknown.and(True), Unknown);
        assert_eq!(True.and(True), True);
        assert_eq!(Unknown.or(True), True);
        assert_eq!(Unknown.or(False), Unknown);
        assert_eq!(False.or(False), False);
        assert_eq!(Unknown.negate(), Unknown);
        assert_eq!(True.negate(), False);
    }

    #[test]
    fn test_no_unknowns_leaves_tree_unchanged() {
        let partial = PartialRule::analyze("${a && b}", &known(&["a", "b"])).unwrap();
        assert!(!partial.has_unknowns());
        assert_eq!(
            partial.tree(),
            &PartialTree::Complete(Expr::And(Box::new(ident("a")), Box::new(ident("b"))))
        );
    }

    #[test]
    fn test_rewrite_and_with_unknown() {
        let partial = PartialRule::analyze("${a && b}", &known(&["a"])).unwrap();
        assert_eq!(
            partial.tree(),
            &PartialTree::NotFalse(MaybeExpr::And(
                Box::new(MaybeExpr::Known(ident("a"))),
                Box::new(MaybeExpr::Unknown)
            ))
        );
    }

    #[test]
    fn test_and_follows_known_side() {
        assert_eq!(outcome("${a && b}", &[("a", true.into())]), MaybeBool::Unknown);
        assert_eq!(outcome("${a && b}", &[("a", false.into())]), MaybeBool::False);
    }

    #[test]
    fn test_or_follows_known_side() {
        assert_eq!(outcome("${a || b}", &[("a", true.into())]), MaybeBool::True);
        assert_eq!(outcome("${a || b}", &[("a", false.into())]), MaybeBool::Unknown);
    }

    #[test]
    fn test_not_keeps_unknown() {
        assert_eq!(outcome("${!b}", &[]), MaybeBool::Unknown);
        assert_eq!(
            outcome("${!(a && b)}", &[("a", false.into())]),
            MaybeBool::True
        );
    }

    #[test]
    fn test_other_operators_become_unknown() {
        let partial = PartialRule::analyze("${country == 'US' && lang == 'en'}", &known(&["lang"]))
            .unwrap();
        let PartialTree::NotFalse(MaybeExpr::And(left, right)) = partial.tree() else {
            panic!("Expected rewritten and");
        };
        assert_eq!(**left, MaybeExpr::Unknown);
        assert!(matches!(**right, MaybeExpr::Known(_)));

        assert_eq!(
            outcome("${fn:length(agent) > 3}", &[]),
            MaybeBool::Unknown
        );
    }

    #[test]
    fn test_never_false_when_true_is_possible() {
        // For every value of the unknown `b`, the partial answer must not be
        // FALSE when the full evaluation could be true.
        let rules = [
            "${a && b}",
            "${a || b}",
            "${!a && !b}",
            "${(a || b) && !(a && b)}",
            "${a && (b || !a)}",
        ];
        let evaluator = RuleEvaluator::default();
        for rule in rules {
            for a in [true, false] {
                let partial_ctx: Context = [("a", ContextValue::Bool(a))].into_iter().collect();
                let partial = evaluator
                    .evaluate_partial(Some(rule), Scope::new(&partial_ctx))
                    .unwrap();
                for b in [true, false] {
                    let full: Context = [("a", ContextValue::Bool(a)), ("b", ContextValue::Bool(b))]
                        .into_iter()
                        .collect();
                    if evaluator.evaluate(Some(rule), &full).unwrap() {
                        assert!(partial, "{rule} with a={a} reported FALSE but b={b} is true");
                    }
                }
            }
        }
    }

    #[test]
    fn test_errors_in_known_side_surface() {
        let ctx: Context = [("a", ContextValue::from("x"))].into_iter().collect();
        let partial = PartialRule::analyze("${a > 3 && b}", &known(&["a"])).unwrap();
        let result = partial.evaluate(&RuleEvaluator::default(), Scope::new(&ctx));
        assert!(matches!(result, Err(RuleError::Evaluation { .. })));
    }
}
