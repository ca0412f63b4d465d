//! Functions callable from rules as `prefix:name(args)`.
//!
//! Nothing here is global: hosts build a [`FunctionRegistry`], optionally add
//! their own functions, and hand it to the evaluator.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use regex::Regex;

use crate::eval::{as_number, loosely_equal};
use crate::value::ContextValue;

/// Signature every rule function implements. Errors are plain messages and
/// surface as [`crate::rule::RuleError::Evaluation`].
pub type RuleFunction =
    Arc<dyn Fn(&[ContextValue]) -> Result<ContextValue, String> + Send + Sync>;

#[derive(Clone, Default)]
pub struct FunctionRegistry {
    functions: HashMap<String, RuleFunction>,
}

impl FunctionRegistry {
    /// An empty registry. Rules calling any function will fail to evaluate.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with the `fn:` string helpers and the `matrix:` helpers.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        register_string_functions(&mut registry);
        register_matrix_functions(&mut registry);
        registry
    }

    /// Register or replace a function under its fully-qualified name, e.g. `app:isMobile`.
    pub fn register<F>(&mut self, name: impl Into<String>, function: F)
    where
        F: Fn(&[ContextValue]) -> Result<ContextValue, String> + Send + Sync + 'static,
    {
        self.functions.insert(name.into(), Arc::new(function));
    }

    pub fn get(&self, name: &str) -> Option<&RuleFunction> {
        self.functions.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }
}

impl fmt::Debug for FunctionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&String> = self.functions.keys().collect();
        names.sort();
        f.debug_struct("FunctionRegistry")
            .field("functions", &names)
            .finish()
    }
}

// Argument helpers

fn expect_args(name: &str, args: &[ContextValue], count: usize) -> Result<(), String> {
    if args.len() != count {
        return Err(format!(
            "{name} expects {count} argument(s), got {}",
            args.len()
        ));
    }
    Ok(())
}

/// Null reads as the empty string, other scalars use their display form.
fn text(value: &ContextValue) -> String {
    match value {
        ContextValue::Null => String::new(),
        ContextValue::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn integer(name: &str, value: &ContextValue) -> Result<i64, String> {
    match value {
        ContextValue::Int(i) => Ok(*i),
        ContextValue::Float(f) => Ok(*f as i64),
        ContextValue::String(s) => s
            .trim()
            .parse()
            .map_err(|_| format!("{name}: '{s}' is not an integer")),
        other => Err(format!("{name}: expected integer, got {}", other.kind())),
    }
}

// fn: string helpers

fn register_string_functions(registry: &mut FunctionRegistry) {
    registry.register("fn:contains", |args| {
        expect_args("fn:contains", args, 2)?;
        Ok(text(&args[0]).contains(&text(&args[1])).into())
    });
    registry.register("fn:containsIgnoreCase", |args| {
        expect_args("fn:containsIgnoreCase", args, 2)?;
        let haystack = text(&args[0]).to_lowercase();
        Ok(haystack.contains(&text(&args[1]).to_lowercase()).into())
    });
    registry.register("fn:startsWith", |args| {
        expect_args("fn:startsWith", args, 2)?;
        Ok(text(&args[0]).starts_with(&text(&args[1])).into())
    });
    registry.register("fn:endsWith", |args| {
        expect_args("fn:endsWith", args, 2)?;
        Ok(text(&args[0]).ends_with(&text(&args[1])).into())
    });
    registry.register("fn:indexOf", |args| {
        expect_args("fn:indexOf", args, 2)?;
        let haystack = text(&args[0]);
        let index = haystack
            .find(&text(&args[1]))
            .map(|byte| haystack[..byte].chars().count() as i64)
            .unwrap_or(-1);
        Ok(ContextValue::Int(index))
    });
    registry.register("fn:length", |args| {
        expect_args("fn:length", args, 1)?;
        let length = match &args[0] {
            ContextValue::Null => 0,
            ContextValue::String(s) => s.chars().count(),
            ContextValue::List(items) => items.len(),
            ContextValue::Map(entries) => entries.len(),
            other => return Err(format!("fn:length: unsupported {}", other.kind())),
        };
        Ok(ContextValue::Int(length as i64))
    });
    registry.register("fn:toLowerCase", |args| {
        expect_args("fn:toLowerCase", args, 1)?;
        Ok(text(&args[0]).to_lowercase().into())
    });
    registry.register("fn:toUpperCase", |args| {
        expect_args("fn:toUpperCase", args, 1)?;
        Ok(text(&args[0]).to_uppercase().into())
    });
    registry.register("fn:trim", |args| {
        expect_args("fn:trim", args, 1)?;
        Ok(text(&args[0]).trim().into())
    });
    registry.register("fn:substring", |args| {
        expect_args("fn:substring", args, 3)?;
        let chars: Vec<char> = text(&args[0]).chars().collect();
        let len = chars.len() as i64;
        let begin = integer("fn:substring", &args[1])?.max(0);
        let mut end = integer("fn:substring", &args[2])?;
        if end < 0 || end > len {
            end = len;
        }
        if begin >= end {
            return Ok(ContextValue::String(String::new()));
        }
        Ok(chars[begin as usize..end as usize]
            .iter()
            .collect::<String>()
            .into())
    });
    registry.register("fn:substringBefore", |args| {
        expect_args("fn:substringBefore", args, 2)?;
        let value = text(&args[0]);
        let before = match value.find(&text(&args[1])) {
            Some(index) => value[..index].to_string(),
            None => String::new(),
        };
        Ok(before.into())
    });
    registry.register("fn:substringAfter", |args| {
        expect_args("fn:substringAfter", args, 2)?;
        let value = text(&args[0]);
        let needle = text(&args[1]);
        let after = match value.find(&needle) {
            Some(index) => value[index + needle.len()..].to_string(),
            None => String::new(),
        };
        Ok(after.into())
    });
    registry.register("fn:replace", |args| {
        expect_args("fn:replace", args, 3)?;
        let value = text(&args[0]);
        let before = text(&args[1]);
        if before.is_empty() {
            return Ok(value.into());
        }
        Ok(value.replace(&before, &text(&args[2])).into())
    });
    registry.register("fn:join", |args| {
        expect_args("fn:join", args, 2)?;
        let separator = text(&args[1]);
        let joined = match &args[0] {
            ContextValue::Null => String::new(),
            ContextValue::List(items) => items.iter().map(text).collect::<Vec<_>>().join(&separator),
            other => return Err(format!("fn:join: expected list, got {}", other.kind())),
        };
        Ok(joined.into())
    });
    registry.register("fn:split", |args| {
        expect_args("fn:split", args, 2)?;
        let value = text(&args[0]);
        let delimiters: Vec<char> = text(&args[1]).chars().collect();
        let parts: Vec<ContextValue> = value
            .split(|c| delimiters.contains(&c))
            .filter(|part| !part.is_empty())
            .map(ContextValue::from)
            .collect();
        Ok(ContextValue::List(parts))
    });
}

// matrix: helpers

fn register_matrix_functions(registry: &mut FunctionRegistry) {
    registry.register("matrix:contains", |args| {
        expect_args("matrix:contains", args, 2)?;
        let found = match &args[0] {
            ContextValue::Null => false,
            ContextValue::List(items) => items.iter().any(|item| loosely_equal(item, &args[1])),
            ContextValue::Map(entries) => entries.contains_key(&text(&args[1])),
            other => {
                return Err(format!(
                    "matrix:contains: expected collection, got {}",
                    other.kind()
                ));
            }
        };
        Ok(found.into())
    });
    registry.register("matrix:matches", |args| {
        expect_args("matrix:matches", args, 2)?;
        let pattern = text(&args[1]);
        let regex = Regex::new(&format!("^(?:{pattern})$"))
            .map_err(|e| format!("matrix:matches: invalid pattern '{pattern}': {e}"))?;
        Ok(regex.is_match(&text(&args[0])).into())
    });
    registry.register("matrix:now", |args| {
        expect_args("matrix:now", args, 0)?;
        Ok(ContextValue::Int(chrono::Utc::now().timestamp_millis()))
    });
    registry.register("matrix:inRange", |args| {
        expect_args("matrix:inRange", args, 3)?;
        let value = number("matrix:inRange", &args[0])?;
        let start = number("matrix:inRange", &args[1])?;
        let end = number("matrix:inRange", &args[2])?;
        Ok((start <= value && value < end).into())
    });
    registry.register("matrix:versionInRange", |args| {
        expect_args("matrix:versionInRange", args, 3)?;
        let version = text(&args[0]);
        let start = text(&args[1]);
        let end = text(&args[2]);
        let in_range = compare_versions(&start, &version) != Ordering::Greater
            && compare_versions(&version, &end) == Ordering::Less;
        Ok(in_range.into())
    });
}

fn number(name: &str, value: &ContextValue) -> Result<f64, String> {
    as_number(value)
        .map(|n| n.as_f64())
        .ok_or_else(|| format!("{name}: expected number, got {}", value.kind()))
}

/// Compare dotted versions numerically, missing components count as zero.
/// Non-numeric suffixes within a component are ignored (`1.2-beta` is `1.2`).
pub(crate) fn compare_versions(a: &str, b: &str) -> Ordering {
    let parse = |v: &str| -> Vec<u64> {
        v.trim()
            .split('.')
            .map(|part| {
                let digits: String = part.chars().take_while(char::is_ascii_digit).collect();
                digits.parse().unwrap_or(0)
            })
            .collect()
    };
    let (left, right) = (parse(a), parse(b));
    let len = left.len().max(right.len());
    for i in 0..len {
        let l = left.get(i).copied().unwrap_or(0);
        let r = right.get(i).copied().unwrap_or(0);
        match l.cmp(&r) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    Ordering::Equal
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(name: &str, args: &[ContextValue]) -> Result<ContextValue, String> {
        let registry = FunctionRegistry::with_builtins();
        let function = registry.get(name).unwrap();
        function(args)
    }

    #[test]
    fn test_string_helpers() {
        assert_eq!(
            call("fn:toUpperCase", &["abc".into()]).unwrap(),
            ContextValue::from("ABC")
        );
        assert_eq!(
            call("fn:containsIgnoreCase", &["Mozilla/5.0".into(), "mozilla".into()]).unwrap(),
            ContextValue::Bool(true)
        );
        assert_eq!(
            call("fn:indexOf", &["héllo".into(), "llo".into()]).unwrap(),
            ContextValue::Int(2)
        );
        assert_eq!(
            call("fn:substring", &["abcdef".into(), 2i64.into(), (-1i64).into()]).unwrap(),
            ContextValue::from("cdef")
        );
        assert_eq!(
            call("fn:substringAfter", &["en-US".into(), "-".into()]).unwrap(),
            ContextValue::from("US")
        );
        assert_eq!(
            call("fn:split", &["a,,b;c".into(), ",;".into()]).unwrap(),
            ContextValue::from(vec!["a", "b", "c"])
        );
        assert_eq!(
            call("fn:length", &[ContextValue::Null]).unwrap(),
            ContextValue::Int(0)
        );
    }

    #[test]
    fn test_null_reads_as_empty_string() {
        assert_eq!(
            call("fn:startsWith", &[ContextValue::Null, "".into()]).unwrap(),
            ContextValue::Bool(true)
        );
    }

    #[test]
    fn test_wrong_arity() {
        let result = call("fn:trim", &[]);
        assert!(result.unwrap_err().contains("expects 1 argument"));
    }

    #[test]
    fn test_matrix_contains() {
        let langs = ContextValue::from(vec!["en", "fr"]);
        assert_eq!(
            call("matrix:contains", &[langs.clone(), "fr".into()]).unwrap(),
            ContextValue::Bool(true)
        );
        assert_eq!(
            call("matrix:contains", &[langs, "de".into()]).unwrap(),
            ContextValue::Bool(false)
        );
        assert_eq!(
            call("matrix:contains", &[vec![1i64, 2].into(), ContextValue::Float(2.0)]).unwrap(),
            ContextValue::Bool(true)
        );
        assert!(call("matrix:contains", &["abc".into(), "a".into()]).is_err());
    }

    #[test]
    fn test_matrix_matches_is_full_match() {
        assert_eq!(
            call("matrix:matches", &["iPhone".into(), "i(Phone|Pad)".into()]).unwrap(),
            ContextValue::Bool(true)
        );
        assert_eq!(
            call("matrix:matches", &["my iPhone".into(), "i(Phone|Pad)".into()]).unwrap(),
            ContextValue::Bool(false)
        );
        assert!(call("matrix:matches", &["x".into(), "(".into()]).is_err());
    }

    #[test]
    fn test_version_in_range() {
        let check = |v: &str| {
            call(
                "matrix:versionInRange",
                &[v.into(), "1.2".into(), "2.0.0".into()],
            )
            .unwrap()
        };
        assert_eq!(check("1.2.0"), ContextValue::Bool(true));
        assert_eq!(check("1.10"), ContextValue::Bool(true));
        assert_eq!(check("2.0"), ContextValue::Bool(false));
        assert_eq!(check("1.1.9"), ContextValue::Bool(false));
    }

    #[test]
    fn test_in_range_and_now() {
        assert_eq!(
            call("matrix:inRange", &[5i64.into(), 0i64.into(), 10i64.into()]).unwrap(),
            ContextValue::Bool(true)
        );
        assert_eq!(
            call("matrix:inRange", &[10i64.into(), 0i64.into(), 10i64.into()]).unwrap(),
            ContextValue::Bool(false)
        );
        assert!(matches!(
            call("matrix:now", &[]).unwrap(),
            ContextValue::Int(ms) if ms > 0
        ));
    }

    #[test]
    fn test_custom_registration() {
        let mut registry = FunctionRegistry::new();
        assert!(!registry.contains("fn:trim"));
        registry.register("app:always", |_| Ok(ContextValue::Bool(true)));
        assert!(registry.contains("app:always"));
        let function = registry.get("app:always").unwrap();
        assert_eq!(function(&[]).unwrap(), ContextValue::Bool(true));
    }
}
