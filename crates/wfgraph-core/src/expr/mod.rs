//! The `${{ ... }}` expression language used by workflow templates and
//! `if:` predicates.
//!
//! Expressions are parsed once into an [`Expr`] tree and evaluated against a
//! [`Resolver`], which supplies context values (`github`, `inputs`, `matrix`,
//! ...) and the status of the surrounding job for the status functions.

pub mod condition;
mod lexer;
mod parser;
pub mod template;

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use condition::Condition;
pub use template::{Segment, Template, TemplateDiagnostic};

/// Errors from tokenizing, parsing or strictly evaluating an expression.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ExprError {
    #[error("unexpected character {ch:?} at offset {pos}")]
    UnexpectedChar { pos: usize, ch: char },

    #[error("unterminated string literal starting at offset {pos}")]
    UnterminatedString { pos: usize },

    #[error("invalid number {text:?} at offset {pos}")]
    InvalidNumber { pos: usize, text: String },

    #[error("unexpected {found} at offset {pos}, expected {expected}")]
    UnexpectedToken {
        pos: usize,
        found: String,
        expected: String,
    },

    #[error("unexpected end of expression, expected {expected}")]
    UnexpectedEnd { expected: String },

    #[error("unknown context '{name}'")]
    UnknownContext { name: String },

    #[error("unknown function '{name}'")]
    UnknownFunction { name: String },

    #[error("function '{function}' takes {expected} argument(s), got {found}")]
    WrongArity {
        function: String,
        expected: usize,
        found: usize,
    },

    #[error("'${{{{' at offset {pos} is never closed")]
    UnterminatedExpression { pos: usize },

    #[error("empty expression at offset {pos}")]
    EmptyExpression { pos: usize },

    #[error("reference '{path}' did not resolve to a value")]
    UnresolvedReference { path: String },
}

/// A runtime value. Only scalars exist; objects from event payloads are
/// carried as their JSON text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ExprValue {
    Null,
    Bool(bool),
    Number(f64),
    String(String),
}

impl ExprValue {
    pub fn is_truthy(&self) -> bool {
        match self {
            ExprValue::Null => false,
            ExprValue::Bool(b) => *b,
            ExprValue::Number(n) => *n != 0.0 && !n.is_nan(),
            ExprValue::String(s) => !s.is_empty(),
        }
    }

    fn to_number(&self) -> f64 {
        match self {
            ExprValue::Null => 0.0,
            ExprValue::Bool(true) => 1.0,
            ExprValue::Bool(false) => 0.0,
            ExprValue::Number(n) => *n,
            ExprValue::String(s) => {
                let t = s.trim();
                if t.is_empty() {
                    0.0
                } else {
                    t.parse().unwrap_or(f64::NAN)
                }
            }
        }
    }

    /// Loose equality: strings compare case-insensitively, mixed types are
    /// coerced to numbers.
    pub fn loose_eq(&self, other: &ExprValue) -> bool {
        match (self, other) {
            (ExprValue::Null, ExprValue::Null) => true,
            (ExprValue::String(a), ExprValue::String(b)) => a.eq_ignore_ascii_case(b),
            (ExprValue::Bool(a), ExprValue::Bool(b)) => a == b,
            (ExprValue::Number(a), ExprValue::Number(b)) => a == b,
            (a, b) => a.to_number() == b.to_number(),
        }
    }

    fn compare(&self, other: &ExprValue) -> Option<std::cmp::Ordering> {
        match (self, other) {
            (ExprValue::String(a), ExprValue::String(b)) => {
                Some(a.to_ascii_lowercase().cmp(&b.to_ascii_lowercase()))
            }
            (a, b) => a.to_number().partial_cmp(&b.to_number()),
        }
    }

    /// Text used when the value is interpolated into a template.
    pub fn render(&self) -> String {
        match self {
            ExprValue::Null => String::new(),
            ExprValue::Bool(b) => b.to_string(),
            ExprValue::Number(n) => {
                if n.fract() == 0.0 && n.abs() < 1e15 {
                    format!("{}", *n as i64)
                } else {
                    n.to_string()
                }
            }
            ExprValue::String(s) => s.clone(),
        }
    }

    pub fn from_json(value: &serde_json::Value) -> ExprValue {
        match value {
            serde_json::Value::Null => ExprValue::Null,
            serde_json::Value::Bool(b) => ExprValue::Bool(*b),
            serde_json::Value::Number(n) => ExprValue::Number(n.as_f64().unwrap_or(f64::NAN)),
            serde_json::Value::String(s) => ExprValue::String(s.clone()),
            other => ExprValue::String(other.to_string()),
        }
    }
}

impl From<&str> for ExprValue {
    fn from(s: &str) -> Self {
        ExprValue::String(s.to_string())
    }
}

impl From<String> for ExprValue {
    fn from(s: String) -> Self {
        ExprValue::String(s)
    }
}

impl From<bool> for ExprValue {
    fn from(b: bool) -> Self {
        ExprValue::Bool(b)
    }
}

impl From<f64> for ExprValue {
    fn from(n: f64) -> Self {
        ExprValue::Number(n)
    }
}

impl fmt::Display for ExprValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

/// Named contexts an expression may reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Context {
    Github,
    Inputs,
    Matrix,
    Env,
    Secrets,
    Vars,
    Runner,
    Job,
    Needs,
    Steps,
    Strategy,
}

impl Context {
    pub fn from_name(name: &str) -> Result<Self, ExprError> {
        Ok(match name {
            "github" => Context::Github,
            "inputs" => Context::Inputs,
            "matrix" => Context::Matrix,
            "env" => Context::Env,
            "secrets" => Context::Secrets,
            "vars" => Context::Vars,
            "runner" => Context::Runner,
            "job" => Context::Job,
            "needs" => Context::Needs,
            "steps" => Context::Steps,
            "strategy" => Context::Strategy,
            other => {
                return Err(ExprError::UnknownContext {
                    name: other.to_string(),
                })
            }
        })
    }

    pub fn name(&self) -> &'static str {
        match self {
            Context::Github => "github",
            Context::Inputs => "inputs",
            Context::Matrix => "matrix",
            Context::Env => "env",
            Context::Secrets => "secrets",
            Context::Vars => "vars",
            Context::Runner => "runner",
            Context::Job => "job",
            Context::Needs => "needs",
            Context::Steps => "steps",
            Context::Strategy => "strategy",
        }
    }
}

/// `context.segment.segment...`, e.g. `github.event.pull_request.number`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContextPath {
    pub context: Context,
    pub segments: Vec<String>,
}

impl ContextPath {
    pub fn new(context: Context, segments: &[&str]) -> Self {
        Self {
            context,
            segments: segments.iter().map(|s| s.to_string()).collect(),
        }
    }

    /// First segment after the context name, if any.
    pub fn head(&self) -> Option<&str> {
        self.segments.first().map(String::as_str)
    }
}

impl fmt::Display for ContextPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.context.name())?;
        for seg in &self.segments {
            write!(f, ".{seg}")?;
        }
        Ok(())
    }
}

/// Built-in functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Function {
    Always,
    Success,
    Failure,
    Cancelled,
    Contains,
    StartsWith,
    EndsWith,
}

impl Function {
    pub fn from_name(name: &str) -> Result<Self, ExprError> {
        // Function names are case-insensitive.
        Ok(match name.to_ascii_lowercase().as_str() {
            "always" => Function::Always,
            "success" => Function::Success,
            "failure" => Function::Failure,
            "cancelled" => Function::Cancelled,
            "contains" => Function::Contains,
            "startswith" => Function::StartsWith,
            "endswith" => Function::EndsWith,
            _ => {
                return Err(ExprError::UnknownFunction {
                    name: name.to_string(),
                })
            }
        })
    }

    pub fn name(&self) -> &'static str {
        match self {
            Function::Always => "always",
            Function::Success => "success",
            Function::Failure => "failure",
            Function::Cancelled => "cancelled",
            Function::Contains => "contains",
            Function::StartsWith => "startsWith",
            Function::EndsWith => "endsWith",
        }
    }

    pub fn arity(&self) -> usize {
        match self {
            Function::Always | Function::Success | Function::Failure | Function::Cancelled => 0,
            Function::Contains | Function::StartsWith | Function::EndsWith => 2,
        }
    }

    pub fn is_status(&self) -> bool {
        self.arity() == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

impl BinaryOp {
    fn symbol(&self) -> &'static str {
        match self {
            BinaryOp::Eq => "==",
            BinaryOp::Ne => "!=",
            BinaryOp::Lt => "<",
            BinaryOp::Le => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::Ge => ">=",
            BinaryOp::And => "&&",
            BinaryOp::Or => "||",
        }
    }
}

/// Parsed expression tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(ExprValue),
    Ref(ContextPath),
    Call { func: Function, args: Vec<Expr> },
    Not(Box<Expr>),
    Binary {
        op: BinaryOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
}

/// Aggregate status visible to `success()`, `failure()` and `cancelled()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Success,
    Failure,
    Cancelled,
}

/// Supplies context values to the evaluator.
pub trait Resolver {
    /// Look up a context path. `None` means the path does not exist.
    fn resolve(&self, path: &ContextPath) -> Option<ExprValue>;

    /// Status of the surrounding job (or of its dependencies, for job-level
    /// predicates).
    fn status(&self) -> JobStatus {
        JobStatus::Success
    }
}

impl Expr {
    /// Parse an expression body (the text between `${{` and `}}`).
    pub fn parse(src: &str) -> Result<Expr, ExprError> {
        let tokens = lexer::tokenize(src)?;
        if tokens.is_empty() {
            return Err(ExprError::EmptyExpression { pos: 0 });
        }
        parser::Parser::new(tokens).parse()
    }

    /// Evaluate; missing references become `null`.
    pub fn evaluate(&self, resolver: &dyn Resolver) -> ExprValue {
        let mut unresolved = Vec::new();
        self.eval(resolver, &mut unresolved)
    }

    /// Evaluate, failing if the result is `null` because a reference was
    /// missing. A missing operand of `||` that falls through to a resolved
    /// value is fine.
    pub fn evaluate_strict(&self, resolver: &dyn Resolver) -> Result<ExprValue, ExprError> {
        let mut unresolved = Vec::new();
        let value = self.eval(resolver, &mut unresolved);
        if value == ExprValue::Null {
            if let Some(path) = unresolved.into_iter().next() {
                return Err(ExprError::UnresolvedReference { path });
            }
        }
        Ok(value)
    }

    fn eval(&self, r: &dyn Resolver, unresolved: &mut Vec<String>) -> ExprValue {
        match self {
            Expr::Literal(v) => v.clone(),
            Expr::Ref(path) => match r.resolve(path) {
                Some(v) => v,
                None => {
                    unresolved.push(path.to_string());
                    ExprValue::Null
                }
            },
            Expr::Not(inner) => ExprValue::Bool(!inner.eval(r, unresolved).is_truthy()),
            Expr::Binary { op, lhs, rhs } => {
                let left = lhs.eval(r, unresolved);
                match op {
                    BinaryOp::And => {
                        if !left.is_truthy() {
                            left
                        } else {
                            rhs.eval(r, unresolved)
                        }
                    }
                    BinaryOp::Or => {
                        if left.is_truthy() {
                            left
                        } else {
                            rhs.eval(r, unresolved)
                        }
                    }
                    _ => {
                        let right = rhs.eval(r, unresolved);
                        let result = match op {
                            BinaryOp::Eq => left.loose_eq(&right),
                            BinaryOp::Ne => !left.loose_eq(&right),
                            BinaryOp::Lt => left.compare(&right).is_some_and(|o| o.is_lt()),
                            BinaryOp::Le => left.compare(&right).is_some_and(|o| o.is_le()),
                            BinaryOp::Gt => left.compare(&right).is_some_and(|o| o.is_gt()),
                            BinaryOp::Ge => left.compare(&right).is_some_and(|o| o.is_ge()),
                            BinaryOp::And | BinaryOp::Or => false,
                        };
                        ExprValue::Bool(result)
                    }
                }
            }
            Expr::Call { func, args } => {
                let status = r.status();
                match func {
                    Function::Always => ExprValue::Bool(true),
                    Function::Success => ExprValue::Bool(status == JobStatus::Success),
                    Function::Failure => ExprValue::Bool(status == JobStatus::Failure),
                    Function::Cancelled => ExprValue::Bool(status == JobStatus::Cancelled),
                    Function::Contains | Function::StartsWith | Function::EndsWith => {
                        let (Some(a), Some(b)) = (args.first(), args.get(1)) else {
                            return ExprValue::Bool(false);
                        };
                        let haystack = a.eval(r, unresolved).render().to_ascii_lowercase();
                        let needle = b.eval(r, unresolved).render().to_ascii_lowercase();
                        ExprValue::Bool(match func {
                            Function::Contains => haystack.contains(&needle),
                            Function::StartsWith => haystack.starts_with(&needle),
                            _ => haystack.ends_with(&needle),
                        })
                    }
                }
            }
        }
    }

    /// Whether any status function appears in the tree.
    pub fn uses_status_function(&self) -> bool {
        match self {
            Expr::Literal(_) | Expr::Ref(_) => false,
            Expr::Call { func, args } => {
                func.is_status() || args.iter().any(Expr::uses_status_function)
            }
            Expr::Not(inner) => inner.uses_status_function(),
            Expr::Binary { lhs, rhs, .. } => {
                lhs.uses_status_function() || rhs.uses_status_function()
            }
        }
    }

    /// All context references, in source order.
    pub fn references(&self) -> Vec<&ContextPath> {
        let mut out = Vec::new();
        self.collect_refs(&mut out);
        out
    }

    fn collect_refs<'a>(&'a self, out: &mut Vec<&'a ContextPath>) {
        match self {
            Expr::Literal(_) => {}
            Expr::Ref(path) => out.push(path),
            Expr::Call { args, .. } => args.iter().for_each(|a| a.collect_refs(out)),
            Expr::Not(inner) => inner.collect_refs(out),
            Expr::Binary { lhs, rhs, .. } => {
                lhs.collect_refs(out);
                rhs.collect_refs(out);
            }
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Literal(ExprValue::String(s)) => write!(f, "'{}'", s.replace('\'', "''")),
            Expr::Literal(ExprValue::Null) => f.write_str("null"),
            Expr::Literal(v) => write!(f, "{v}"),
            Expr::Ref(path) => write!(f, "{path}"),
            Expr::Call { func, args } => {
                write!(f, "{}(", func.name())?;
                for (i, a) in args.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{a}")?;
                }
                f.write_str(")")
            }
            Expr::Not(inner) => write!(f, "!{inner}"),
            Expr::Binary { op, lhs, rhs } => write!(f, "({lhs} {} {rhs})", op.symbol()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct MapResolver {
        values: HashMap<String, ExprValue>,
        status: JobStatus,
    }

    impl MapResolver {
        fn new(pairs: &[(&str, ExprValue)]) -> Self {
            Self {
                values: pairs
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.clone()))
                    .collect(),
                status: JobStatus::Success,
            }
        }
    }

    impl Resolver for MapResolver {
        fn resolve(&self, path: &ContextPath) -> Option<ExprValue> {
            self.values.get(&path.to_string()).cloned()
        }

        fn status(&self) -> JobStatus {
            self.status
        }
    }

    fn eval(src: &str, r: &MapResolver) -> ExprValue {
        Expr::parse(src).unwrap().evaluate(r)
    }

    #[test]
    fn test_pr_number_or_ref_falls_back_to_ref() {
        let r = MapResolver::new(&[("github.ref", "refs/heads/develop".into())]);
        assert_eq!(
            eval("github.event.pull_request.number || github.ref", &r),
            ExprValue::from("refs/heads/develop")
        );
    }

    #[test]
    fn test_pr_number_preferred_when_present() {
        let r = MapResolver::new(&[
            ("github.event.pull_request.number", ExprValue::Number(42.0)),
            ("github.ref", "refs/pull/42/merge".into()),
        ]);
        assert_eq!(
            eval("github.event.pull_request.number || github.ref", &r).render(),
            "42"
        );
    }

    #[test]
    fn test_string_equality_is_case_insensitive() {
        let r = MapResolver::new(&[("github.event_name", "Pull_Request".into())]);
        assert_eq!(
            eval("github.event_name == 'pull_request'", &r),
            ExprValue::Bool(true)
        );
    }

    #[test]
    fn test_mixed_type_equality_coerces_to_number() {
        let r = MapResolver::new(&[]);
        assert_eq!(eval("'1' == 1", &r), ExprValue::Bool(true));
        assert_eq!(eval("true == 1", &r), ExprValue::Bool(true));
        assert_eq!(eval("'abc' == 0", &r), ExprValue::Bool(false));
    }

    #[test]
    fn test_status_functions_follow_resolver() {
        let mut r = MapResolver::new(&[]);
        assert_eq!(eval("success()", &r), ExprValue::Bool(true));
        r.status = JobStatus::Failure;
        assert_eq!(eval("failure()", &r), ExprValue::Bool(true));
        assert_eq!(eval("always()", &r), ExprValue::Bool(true));
        assert_eq!(eval("success()", &r), ExprValue::Bool(false));
    }

    #[test]
    fn test_contains_and_starts_with() {
        let r = MapResolver::new(&[("github.ref", "refs/heads/releases/2.1".into())]);
        assert_eq!(
            eval("startsWith(github.ref, 'refs/heads/releases')", &r),
            ExprValue::Bool(true)
        );
        assert_eq!(
            eval("contains(github.ref, 'RELEASES')", &r),
            ExprValue::Bool(true)
        );
    }

    #[test]
    fn test_strict_evaluation_reports_missing_reference() {
        let r = MapResolver::new(&[]);
        let err = Expr::parse("matrix.task")
            .unwrap()
            .evaluate_strict(&r)
            .unwrap_err();
        assert_eq!(
            err,
            ExprError::UnresolvedReference {
                path: "matrix.task".to_string()
            }
        );
    }

    #[test]
    fn test_uses_status_function() {
        assert!(Expr::parse("always()").unwrap().uses_status_function());
        assert!(Expr::parse("!cancelled() && inputs.x")
            .unwrap()
            .uses_status_function());
        assert!(!Expr::parse("github.event_name == 'push'")
            .unwrap()
            .uses_status_function());
    }

    #[test]
    fn test_display_round_trips_through_parser() {
        let src = "!(github.event.pull_request.head.repo.fork == true) && success()";
        let parsed = Expr::parse(src).unwrap();
        let reparsed = Expr::parse(&parsed.to_string()).unwrap();
        assert_eq!(parsed, reparsed);
    }

    #[test]
    fn test_number_rendering() {
        assert_eq!(ExprValue::Number(2.0).render(), "2");
        assert_eq!(ExprValue::Number(0.5).render(), "0.5");
    }
}
