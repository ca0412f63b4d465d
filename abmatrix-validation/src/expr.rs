//! Parser for the rule expression language.
//!
//! A rule is written as `${ expression }`. The grammar is a small boolean
//! expression language with comparisons, arithmetic, property and index
//! access, and calls into a [`crate::functions::FunctionRegistry`].
//!
//! Precedence, lowest first: ternary, `||`, `&&`, equality, relational,
//! additive, multiplicative, unary, postfix access.

use std::collections::BTreeSet;

use crate::rule::RuleError;
use crate::value::ContextValue;

/// Deepest expression tree a rule may produce. Operator chains count one
/// level per operator, as they build left-leaning trees.
pub const MAX_DEPTH: usize = 128;

// AST

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(ContextValue),
    Identifier(String),
    Property(Box<Expr>, String),
    Index(Box<Expr>, Box<Expr>),
    Unary(UnaryOp, Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Conditional(Box<Expr>, Box<Expr>, Box<Expr>),
    Call { function: String, args: Vec<Expr> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    Negate,
    Empty,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Subtract,
    Multiply,
    Divide,
    Modulo,
    Equal,
    NotEqual,
    Less,
    Greater,
    LessEqual,
    GreaterEqual,
}

impl Expr {
    /// Collect every variable name the expression reads.
    pub fn identifiers(&self) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        self.collect_identifiers(&mut out);
        out
    }

    fn collect_identifiers(&self, out: &mut BTreeSet<String>) {
        match self {
            Expr::Literal(_) => {}
            Expr::Identifier(name) => {
                out.insert(name.clone());
            }
            Expr::Property(base, _) => base.collect_identifiers(out),
            Expr::Unary(_, inner) => inner.collect_identifiers(out),
            Expr::Index(a, b) | Expr::Binary(_, a, b) | Expr::And(a, b) | Expr::Or(a, b) => {
                a.collect_identifiers(out);
                b.collect_identifiers(out);
            }
            Expr::Conditional(cond, then, otherwise) => {
                cond.collect_identifiers(out);
                then.collect_identifiers(out);
                otherwise.collect_identifiers(out);
            }
            Expr::Call { args, .. } => {
                for arg in args {
                    arg.collect_identifiers(out);
                }
            }
        }
    }
}

/// Strip surrounding whitespace and the `${` `}` delimiters.
///
/// Returns `None` when the rule is not a single delimited expression.
pub fn strip_braces(rule: &str) -> Option<&str> {
    let trimmed = rule.trim();
    trimmed
        .strip_prefix("${")
        .and_then(|rest| rest.strip_suffix('}'))
        .map(str::trim)
}

/// Parse a delimited rule into an expression tree.
pub fn parse_rule(rule: &str) -> Result<Expr, RuleError> {
    let Some(body) = strip_braces(rule) else {
        return Err(syntax(rule, "rule must be a single ${...} expression"));
    };
    if body.is_empty() {
        return Ok(Expr::Literal(ContextValue::Bool(true)));
    }
    let tokens = tokenize(body).map_err(|message| syntax(rule, &message))?;
    let mut parser = Parser {
        tokens,
        pos: 0,
        depth: 0,
        rule,
    };
    let expr = parser.ternary()?;
    if let Some(token) = parser.peek() {
        return Err(syntax(rule, &format!("unexpected {token:?}")));
    }
    Ok(expr)
}

fn syntax(rule: &str, message: &str) -> RuleError {
    RuleError::Syntax {
        rule: rule.to_string(),
        message: message.to_string(),
    }
}

// Lexer

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Int(i64),
    Float(f64),
    Str(String),
    Ident(String),
    LParen,
    RParen,
    LBracket,
    RBracket,
    Dot,
    Comma,
    Question,
    Colon,
    Op(&'static str),
}

fn tokenize(src: &str) -> Result<Vec<Token>, String> {
    let chars: Vec<char> = src.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }

        if c.is_ascii_digit() {
            let start = i;
            while i < chars.len() && chars[i].is_ascii_digit() {
                i += 1;
            }
            let mut is_float = false;
            if i + 1 < chars.len() && chars[i] == '.' && chars[i + 1].is_ascii_digit() {
                is_float = true;
                i += 1;
                while i < chars.len() && chars[i].is_ascii_digit() {
                    i += 1;
                }
            }
            let text: String = chars[start..i].iter().collect();
            let token = if is_float {
                Token::Float(text.parse().map_err(|_| format!("invalid number '{text}'"))?)
            } else {
                Token::Int(text.parse().map_err(|_| format!("invalid number '{text}'"))?)
            };
            tokens.push(token);
            continue;
        }

        if c == '\'' || c == '"' {
            let quote = c;
            let mut value = String::new();
            i += 1;
            loop {
                let Some(&ch) = chars.get(i) else {
                    return Err("unterminated string literal".to_string());
                };
                i += 1;
                if ch == '\\' {
                    let Some(&escaped) = chars.get(i) else {
                        return Err("unterminated string literal".to_string());
                    };
                    value.push(escaped);
                    i += 1;
                } else if ch == quote {
                    break;
                } else {
                    value.push(ch);
                }
            }
            tokens.push(Token::Str(value));
            continue;
        }

        if c.is_alphabetic() || c == '_' || c == '$' {
            let start = i;
            while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '$')
            {
                i += 1;
            }
            let word: String = chars[start..i].iter().collect();
            tokens.push(keyword(word));
            continue;
        }

        let next = chars.get(i + 1).copied();
        let (token, width) = match (c, next) {
            ('=', Some('=')) => (Token::Op("=="), 2),
            ('!', Some('=')) => (Token::Op("!="), 2),
            ('<', Some('=')) => (Token::Op("<="), 2),
            ('>', Some('=')) => (Token::Op(">="), 2),
            ('&', Some('&')) => (Token::Op("&&"), 2),
            ('|', Some('|')) => (Token::Op("||"), 2),
            ('-', Some('>')) => return Err("lambda expressions are not allowed".to_string()),
            ('+', Some('=')) => return Err("string concatenation is not allowed".to_string()),
            ('=', _) => return Err("assignment is not allowed".to_string()),
            (';', _) => return Err("multiple expressions are not allowed".to_string()),
            ('{', _) => return Err("set and map literals are not allowed".to_string()),
            ('<', _) => (Token::Op("<"), 1),
            ('>', _) => (Token::Op(">"), 1),
            ('!', _) => (Token::Op("!"), 1),
            ('+', _) => (Token::Op("+"), 1),
            ('-', _) => (Token::Op("-"), 1),
            ('*', _) => (Token::Op("*"), 1),
            ('/', _) => (Token::Op("/"), 1),
            ('%', _) => (Token::Op("%"), 1),
            ('(', _) => (Token::LParen, 1),
            (')', _) => (Token::RParen, 1),
            ('[', _) => (Token::LBracket, 1),
            (']', _) => (Token::RBracket, 1),
            ('.', _) => (Token::Dot, 1),
            (',', _) => (Token::Comma, 1),
            ('?', _) => (Token::Question, 1),
            (':', _) => (Token::Colon, 1),
            _ => return Err(format!("unexpected character '{c}'")),
        };
        tokens.push(token);
        i += width;
    }

    Ok(tokens)
}

fn keyword(word: String) -> Token {
    match word.as_str() {
        "and" => Token::Op("&&"),
        "or" => Token::Op("||"),
        "not" => Token::Op("!"),
        "eq" => Token::Op("=="),
        "ne" => Token::Op("!="),
        "lt" => Token::Op("<"),
        "gt" => Token::Op(">"),
        "le" => Token::Op("<="),
        "ge" => Token::Op(">="),
        "div" => Token::Op("/"),
        "mod" => Token::Op("%"),
        "empty" => Token::Op("empty"),
        _ => Token::Ident(word),
    }
}

// Parser

struct Parser<'a> {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
    rule: &'a str,
}

impl Parser<'_> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn peek_at(&self, offset: usize) -> Option<&Token> {
        self.tokens.get(self.pos + offset)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn eat_op(&mut self, ops: &[&'static str]) -> Option<&'static str> {
        let op = match self.peek() {
            Some(Token::Op(op)) if ops.contains(op) => *op,
            _ => return None,
        };
        self.pos += 1;
        Some(op)
    }

    fn expect(&mut self, expected: Token) -> Result<(), RuleError> {
        match self.next() {
            Some(token) if token == expected => Ok(()),
            Some(token) => Err(self.error(&format!("expected {expected:?}, found {token:?}"))),
            None => Err(self.error(&format!("expected {expected:?}, found end of rule"))),
        }
    }

    fn error(&self, message: &str) -> RuleError {
        syntax(self.rule, message)
    }

    fn descend(&mut self) -> Result<(), RuleError> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(self.error("rule nests too deeply"));
        }
        Ok(())
    }

    fn ternary(&mut self) -> Result<Expr, RuleError> {
        let base = self.depth;
        self.descend()?;
        let cond = self.or()?;
        let expr = if self.peek() == Some(&Token::Question) {
            self.pos += 1;
            let then = self.ternary()?;
            self.expect(Token::Colon)?;
            let otherwise = self.ternary()?;
            Expr::Conditional(Box::new(cond), Box::new(then), Box::new(otherwise))
        } else {
            cond
        };
        self.depth = base;
        Ok(expr)
    }

    fn or(&mut self) -> Result<Expr, RuleError> {
        let base = self.depth;
        let mut left = self.and()?;
        while self.eat_op(&["||"]).is_some() {
            self.descend()?;
            let right = self.and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        self.depth = base;
        Ok(left)
    }

    fn and(&mut self) -> Result<Expr, RuleError> {
        let base = self.depth;
        let mut left = self.equality()?;
        while self.eat_op(&["&&"]).is_some() {
            self.descend()?;
            let right = self.equality()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        self.depth = base;
        Ok(left)
    }

    fn equality(&mut self) -> Result<Expr, RuleError> {
        let base = self.depth;
        let mut left = self.relational()?;
        while let Some(op) = self.eat_op(&["==", "!="]) {
            self.descend()?;
            let right = self.relational()?;
            let op = if op == "==" {
                BinaryOp::Equal
            } else {
                BinaryOp::NotEqual
            };
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
        self.depth = base;
        Ok(left)
    }

    fn relational(&mut self) -> Result<Expr, RuleError> {
        let base = self.depth;
        let mut left = self.additive()?;
        while let Some(op) = self.eat_op(&["<", ">", "<=", ">="]) {
            self.descend()?;
            let right = self.additive()?;
            let op = match op {
                "<" => BinaryOp::Less,
                ">" => BinaryOp::Greater,
                "<=" => BinaryOp::LessEqual,
                _ => BinaryOp::GreaterEqual,
            };
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
        self.depth = base;
        Ok(left)
    }

    fn additive(&mut self) -> Result<Expr, RuleError> {
        let base = self.depth;
        let mut left = self.multiplicative()?;
        while let Some(op) = self.eat_op(&["+", "-"]) {
            self.descend()?;
            let right = self.multiplicative()?;
            let op = if op == "+" {
                BinaryOp::Add
            } else {
                BinaryOp::Subtract
            };
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
        self.depth = base;
        Ok(left)
    }

    fn multiplicative(&mut self) -> Result<Expr, RuleError> {
        let base = self.depth;
        let mut left = self.unary()?;
        while let Some(op) = self.eat_op(&["*", "/", "%"]) {
            self.descend()?;
            let right = self.unary()?;
            let op = match op {
                "*" => BinaryOp::Multiply,
                "/" => BinaryOp::Divide,
                _ => BinaryOp::Modulo,
            };
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
        self.depth = base;
        Ok(left)
    }

    fn unary(&mut self) -> Result<Expr, RuleError> {
        if let Some(op) = self.eat_op(&["!", "-", "empty"]) {
            self.descend()?;
            let inner = self.unary()?;
            self.depth -= 1;
            let op = match op {
                "!" => UnaryOp::Not,
                "-" => UnaryOp::Negate,
                _ => UnaryOp::Empty,
            };
            return Ok(Expr::Unary(op, Box::new(inner)));
        }
        self.postfix()
    }

    fn postfix(&mut self) -> Result<Expr, RuleError> {
        let base = self.depth;
        let mut expr = self.primary()?;
        loop {
            match self.peek() {
                Some(Token::Dot) => {
                    self.descend()?;
                    self.pos += 1;
                    match self.next() {
                        Some(Token::Ident(name)) => expr = Expr::Property(Box::new(expr), name),
                        _ => return Err(self.error("expected property name after '.'")),
                    }
                }
                Some(Token::LBracket) => {
                    self.descend()?;
                    self.pos += 1;
                    let index = self.ternary()?;
                    self.expect(Token::RBracket)?;
                    expr = Expr::Index(Box::new(expr), Box::new(index));
                }
                _ => {
                    self.depth = base;
                    return Ok(expr);
                }
            }
        }
    }

    fn primary(&mut self) -> Result<Expr, RuleError> {
        let Some(token) = self.next() else {
            return Err(self.error("unexpected end of rule"));
        };
        match token {
            Token::Int(i) => Ok(Expr::Literal(ContextValue::Int(i))),
            Token::Float(f) => Ok(Expr::Literal(ContextValue::Float(f))),
            Token::Str(s) => Ok(Expr::Literal(ContextValue::String(s))),
            Token::LParen => {
                let inner = self.ternary()?;
                self.expect(Token::RParen)?;
                Ok(inner)
            }
            Token::LBracket => Err(self.error("list literals are not allowed")),
            Token::Ident(name) => self.identifier(name),
            other => Err(self.error(&format!("unexpected {other:?}"))),
        }
    }

    fn identifier(&mut self, name: String) -> Result<Expr, RuleError> {
        // prefix:function( binds tighter than the ternary's ':'
        if let (Some(Token::Colon), Some(Token::Ident(function)), Some(Token::LParen)) =
            (self.peek(), self.peek_at(1), self.peek_at(2))
        {
            let function = format!("{name}:{function}");
            self.pos += 3;
            let args = self.arguments()?;
            return Ok(Expr::Call { function, args });
        }
        if self.peek() == Some(&Token::LParen) {
            self.pos += 1;
            let args = self.arguments()?;
            return Ok(Expr::Call {
                function: name,
                args,
            });
        }
        Ok(match name.as_str() {
            "true" => Expr::Literal(ContextValue::Bool(true)),
            "false" => Expr::Literal(ContextValue::Bool(false)),
            "null" => Expr::Literal(ContextValue::Null),
            _ => Expr::Identifier(name),
        })
    }

    fn arguments(&mut self) -> Result<Vec<Expr>, RuleError> {
        let mut args = Vec::new();
        if self.peek() == Some(&Token::RParen) {
            self.pos += 1;
            return Ok(args);
        }
        loop {
            args.push(self.ternary()?);
            match self.next() {
                Some(Token::Comma) => continue,
                Some(Token::RParen) => return Ok(args),
                _ => return Err(self.error("expected ',' or ')' in argument list")),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ident(name: &str) -> Box<Expr> {
        Box::new(Expr::Identifier(name.to_string()))
    }

    fn string(value: &str) -> Box<Expr> {
        Box::new(Expr::Literal(ContextValue::String(value.to_string())))
    }

    #[test]
    fn test_strip_braces() {
        assert_eq!(strip_braces(" ${ a && b } "), Some("a && b"));
        assert_eq!(strip_braces("a && b"), None);
        assert_eq!(strip_braces("${a"), None);
    }

    #[test]
    fn test_parse_precedence() {
        let expr = parse_rule("${a || b && c}").unwrap();
        assert_eq!(
            expr,
            Expr::Or(ident("a"), Box::new(Expr::And(ident("b"), ident("c"))))
        );
    }

    #[test]
    fn test_parse_keyword_operators() {
        let expr = parse_rule("${country eq 'US' and not empty lang}").unwrap();
        assert_eq!(
            expr,
            Expr::And(
                Box::new(Expr::Binary(BinaryOp::Equal, ident("country"), string("US"))),
                Box::new(Expr::Unary(
                    UnaryOp::Not,
                    Box::new(Expr::Unary(UnaryOp::Empty, ident("lang")))
                ))
            )
        );
    }

    #[test]
    fn test_parse_function_call_and_access() {
        let expr = parse_rule("${fn:startsWith(user.agent, 'Mozilla') && langs[0] == \"en\"}")
            .unwrap();
        let Expr::And(call, index) = expr else {
            panic!("Expected and");
        };
        assert_eq!(
            *call,
            Expr::Call {
                function: "fn:startsWith".to_string(),
                args: vec![
                    Expr::Property(ident("user"), "agent".to_string()),
                    Expr::Literal(ContextValue::String("Mozilla".to_string())),
                ],
            }
        );
        assert!(matches!(*index, Expr::Binary(BinaryOp::Equal, _, _)));
    }

    #[test]
    fn test_parse_ternary_with_colon() {
        let expr = parse_rule("${ a ? b : c }").unwrap();
        assert_eq!(expr, Expr::Conditional(ident("a"), ident("b"), ident("c")));
    }

    #[test]
    fn test_parse_numbers() {
        assert_eq!(
            parse_rule("${1.5 >= 2}").unwrap(),
            Expr::Binary(
                BinaryOp::GreaterEqual,
                Box::new(Expr::Literal(ContextValue::Float(1.5))),
                Box::new(Expr::Literal(ContextValue::Int(2)))
            )
        );
    }

    #[test]
    fn test_empty_body_is_true() {
        assert_eq!(
            parse_rule("${ }").unwrap(),
            Expr::Literal(ContextValue::Bool(true))
        );
    }

    #[test]
    fn test_rejected_constructs() {
        for rule in [
            "${a = 1}",
            "${a += 'x'}",
            "${x -> x}",
            "${a; b}",
            "${[1, 2]}",
            "${{1, 2}}",
            "${a &&}",
            "${'open}",
            "no braces",
        ] {
            let result = parse_rule(rule);
            assert!(
                matches!(result, Err(RuleError::Syntax { .. })),
                "expected syntax error for {rule}"
            );
        }
    }

    #[test]
    fn test_deep_nesting_is_rejected() {
        let parens = format!("${{{}true{}}}", "(".repeat(5000), ")".repeat(5000));
        let negations = format!("${{{}true}}", "!".repeat(200_000));
        let chain = format!("${{a{}}}", " || a".repeat(100_000));
        let access = format!("${{a{}}}", ".b".repeat(100_000));
        for rule in [parens, negations, chain, access] {
            match parse_rule(&rule) {
                Err(RuleError::Syntax { message, .. }) => {
                    assert_eq!(message, "rule nests too deeply")
                }
                other => panic!("expected a nesting error, got ok = {}", other.is_ok()),
            }
        }
    }

    #[test]
    fn test_moderate_nesting_parses() {
        let nested = format!("${{{}true{}}}", "(".repeat(100), ")".repeat(100));
        assert_eq!(
            parse_rule(&nested).unwrap(),
            Expr::Literal(ContextValue::Bool(true))
        );

        let countries: Vec<String> = (0..100).map(|i| format!("country == 'C{i}'")).collect();
        let expr = parse_rule(&format!("${{{}}}", countries.join(" || "))).unwrap();
        assert_eq!(expr.identifiers().into_iter().collect::<Vec<_>>(), vec!["country"]);
    }

    #[test]
    fn test_identifiers() {
        let expr = parse_rule("${fn:contains(a.b, c) ? d[e] : 'x'}").unwrap();
        let names: Vec<String> = expr.identifiers().into_iter().collect();
        assert_eq!(names, vec!["a", "c", "d", "e"]);
    }
}
