//! Boolean rule evaluation against a request context.

use std::borrow::Cow;
use std::collections::BTreeSet;
use std::sync::{Arc, OnceLock};

use crate::eval::{Interpreter, Scope};
use crate::expr::{Expr, parse_rule};
use crate::functions::FunctionRegistry;
use crate::partial::PartialRule;
use crate::value::Context;

/// Errors raised while parsing or evaluating a rule
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RuleError {
    #[error("Invalid rule '{rule}': {message}")]
    Syntax { rule: String, message: String },

    #[error("Rule '{rule}' references undefined variable '{name}'")]
    UndefinedVariable { rule: String, name: String },

    #[error("Rule '{rule}' calls unknown function '{name}'")]
    UnknownFunction { rule: String, name: String },

    #[error("Error evaluating rule '{rule}': {message}")]
    Evaluation { rule: String, message: String },

    #[error("Rule '{rule}' evaluated to {kind}, expected boolean")]
    NonBoolean { rule: String, kind: &'static str },
}

impl RuleError {
    pub fn rule(&self) -> &str {
        match self {
            RuleError::Syntax { rule, .. }
            | RuleError::UndefinedVariable { rule, .. }
            | RuleError::UnknownFunction { rule, .. }
            | RuleError::Evaluation { rule, .. }
            | RuleError::NonBoolean { rule, .. } => rule,
        }
    }
}

/// A blank or missing rule always passes.
pub fn is_blank(rule: Option<&str>) -> bool {
    rule.is_none_or(|r| r.trim().is_empty())
}

/// Names of every variable a rule reads.
pub fn referenced_variables(rule: &str) -> Result<BTreeSet<String>, RuleError> {
    if is_blank(Some(rule)) {
        return Ok(BTreeSet::new());
    }
    Ok(parse_rule(rule)?.identifiers())
}

/// Parsed form of a rule, filled on first use.
///
/// Sits next to the rule text in the model, so a published artifact parses
/// each rule once. A cache filled for different text is bypassed. Equality
/// ignores the cache.
#[derive(Debug, Clone, Default)]
pub struct RuleCache(OnceLock<(String, Result<Expr, RuleError>)>);

impl RuleCache {
    pub fn parsed(&self, rule: &str) -> Result<Cow<'_, Expr>, RuleError> {
        let (source, parsed) = self
            .0
            .get_or_init(|| (rule.to_string(), parse_rule(rule)));
        if source != rule {
            return parse_rule(rule).map(Cow::Owned);
        }
        match parsed {
            Ok(expr) => Ok(Cow::Borrowed(expr)),
            Err(e) => Err(e.clone()),
        }
    }

    pub fn is_filled(&self) -> bool {
        self.0.get().is_some()
    }
}

impl PartialEq for RuleCache {
    fn eq(&self, _: &Self) -> bool {
        true
    }
}

/// Evaluates rules with a fixed function library.
///
/// Cloning is cheap; the registry is shared.
#[derive(Debug, Clone)]
pub struct RuleEvaluator {
    functions: Arc<FunctionRegistry>,
}

impl RuleEvaluator {
    pub fn new(functions: FunctionRegistry) -> Self {
        Self {
            functions: Arc::new(functions),
        }
    }

    pub fn functions(&self) -> &FunctionRegistry {
        &self.functions
    }

    /// Evaluate `rule` against the request context alone.
    pub fn evaluate(&self, rule: Option<&str>, context: &Context) -> Result<bool, RuleError> {
        self.evaluate_in(rule, Scope::new(context))
    }

    /// Evaluate `rule` with an explicit variable scope, typically a test's
    /// constants layered over the request context.
    pub fn evaluate_in(&self, rule: Option<&str>, scope: Scope<'_>) -> Result<bool, RuleError> {
        let Some(rule) = rule.filter(|r| !r.trim().is_empty()) else {
            return Ok(true);
        };
        let expr = parse_rule(rule)?;
        self.evaluate_expr(rule, &expr, scope)
    }

    /// Same as [`Self::evaluate_in`], parsing through `cache`.
    pub fn evaluate_cached(
        &self,
        rule: Option<&str>,
        cache: &RuleCache,
        scope: Scope<'_>,
    ) -> Result<bool, RuleError> {
        let Some(rule) = rule.filter(|r| !r.trim().is_empty()) else {
            return Ok(true);
        };
        let expr = cache.parsed(rule)?;
        self.evaluate_expr(rule, &expr, scope)
    }

    pub(crate) fn evaluate_expr(
        &self,
        rule: &str,
        expr: &Expr,
        scope: Scope<'_>,
    ) -> Result<bool, RuleError> {
        self.interpreter(rule, scope).eval_bool(expr)
    }

    /// Evaluate `rule` treating every variable missing from `scope` as unknown.
    ///
    /// Returns false only when the rule is decidably false for every value the
    /// unknown variables could take.
    pub fn evaluate_partial(
        &self,
        rule: Option<&str>,
        scope: Scope<'_>,
    ) -> Result<bool, RuleError> {
        let Some(rule) = rule.filter(|r| !r.trim().is_empty()) else {
            return Ok(true);
        };
        let partial = PartialRule::analyze(rule, &scope.names())?;
        partial.evaluate(self, scope)
    }

    pub(crate) fn interpreter<'a>(&'a self, rule: &'a str, scope: Scope<'a>) -> Interpreter<'a> {
        Interpreter {
            functions: &self.functions,
            scope,
            rule,
        }
    }
}

impl Default for RuleEvaluator {
    fn default() -> Self {
        Self::new(FunctionRegistry::with_builtins())
    }
}
