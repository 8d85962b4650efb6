//! `if:` predicates on jobs and steps.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use super::{Expr, ExprError, Resolver};

/// A parsed `if:` predicate. Without a status function the predicate is
/// implicitly `success() && (<expr>)`.
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    source: String,
    expr: Expr,
}

impl Condition {
    /// Parse either a bare expression or one wrapped in `${{ }}`.
    pub fn parse(src: &str) -> Result<Self, ExprError> {
        let trimmed = src.trim();
        let body = trimmed
            .strip_prefix("${{")
            .and_then(|s| s.strip_suffix("}}"))
            .unwrap_or(trimmed);
        Ok(Self {
            source: src.to_string(),
            expr: Expr::parse(body)?,
        })
    }

    pub fn always() -> Self {
        Self {
            source: "always()".to_string(),
            expr: Expr::Call {
                func: super::Function::Always,
                args: Vec::new(),
            },
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn expr(&self) -> &Expr {
        &self.expr
    }

    /// Whether the predicate can hold after an earlier failure.
    pub fn runs_after_failure(&self) -> bool {
        self.expr.uses_status_function()
    }

    pub fn evaluate(&self, resolver: &dyn Resolver) -> bool {
        let value = self.expr.evaluate(resolver).is_truthy();
        if self.expr.uses_status_function() {
            value
        } else {
            resolver.status() == super::JobStatus::Success && value
        }
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

impl Serialize for Condition {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.source)
    }
}

impl<'de> Deserialize<'de> for Condition {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = serde_yaml::Value::deserialize(deserializer)?;
        let text = match value {
            serde_yaml::Value::String(s) => s,
            serde_yaml::Value::Bool(b) => b.to_string(),
            other => {
                return Err(serde::de::Error::custom(format!(
                    "expected an if: expression, found {other:?}"
                )))
            }
        };
        Condition::parse(&text).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::{ContextPath, ExprValue, JobStatus};

    struct Status(JobStatus, bool);

    impl Resolver for Status {
        fn resolve(&self, path: &ContextPath) -> Option<ExprValue> {
            (path.to_string() == "github.event.pull_request.head.repo.fork")
                .then_some(ExprValue::Bool(self.1))
        }

        fn status(&self) -> JobStatus {
            self.0
        }
    }

    #[test]
    fn test_implicit_success() {
        let c = Condition::parse("github.event.pull_request.head.repo.fork == false").unwrap();
        assert!(c.evaluate(&Status(JobStatus::Success, false)));
        assert!(!c.evaluate(&Status(JobStatus::Failure, false)));
        assert!(!c.evaluate(&Status(JobStatus::Success, true)));
    }

    #[test]
    fn test_always_runs_after_failure() {
        let c = Condition::parse("${{ always() }}").unwrap();
        assert!(c.runs_after_failure());
        assert!(c.evaluate(&Status(JobStatus::Failure, false)));
        assert!(c.evaluate(&Status(JobStatus::Cancelled, false)));
    }

    #[test]
    fn test_failure_only() {
        let c = Condition::parse("failure()").unwrap();
        assert!(!c.evaluate(&Status(JobStatus::Success, false)));
        assert!(c.evaluate(&Status(JobStatus::Failure, false)));
    }
}
