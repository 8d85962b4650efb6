//! String templates with embedded `${{ ... }}` expressions.
//!
//! A template is parsed once into literal and expression segments. Parsing
//! keeps the source faithfully: a `}` left over after an expression stays in
//! the literal text and is reported as a [`TemplateDiagnostic`] rather than
//! silently dropped.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use super::{ContextPath, Expr, ExprError, Resolver};

const OPEN: &str = "${{";
const CLOSE: &str = "}}";

#[derive(Debug, Clone, PartialEq)]
pub enum Segment {
    Literal(String),
    Expr(Expr),
}

/// Suspicious but well-formed template text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TemplateDiagnostic {
    /// A literal `}` in the template text, e.g. `${{ x }}}`.
    StrayClosingBrace { offset: usize },
}

impl fmt::Display for TemplateDiagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TemplateDiagnostic::StrayClosingBrace { offset } => {
                write!(f, "stray '}}' at offset {offset} is kept as literal text")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Template {
    source: String,
    segments: Vec<Segment>,
    diagnostics: Vec<TemplateDiagnostic>,
}

/// Byte offset of the `}}` closing an expression body, skipping quoted strings.
fn find_close(src: &str, from: usize) -> Option<usize> {
    let bytes = src.as_bytes();
    let mut in_str = false;
    let mut i = from;
    while i < bytes.len() {
        match bytes[i] {
            b'\'' => in_str = !in_str,
            b'}' if !in_str && bytes.get(i + 1) == Some(&b'}') => return Some(i),
            _ => {}
        }
        i += 1;
    }
    None
}

impl Template {
    pub fn parse(src: &str) -> Result<Self, ExprError> {
        let mut segments = Vec::new();
        let mut diagnostics = Vec::new();
        let mut rest_start = 0;

        let mut push_literal = |text: &str, base: usize, segments: &mut Vec<Segment>| {
            if text.is_empty() {
                return;
            }
            for (i, c) in text.char_indices() {
                if c == '}' {
                    diagnostics.push(TemplateDiagnostic::StrayClosingBrace { offset: base + i });
                }
            }
            segments.push(Segment::Literal(text.to_string()));
        };

        while let Some(rel) = src[rest_start..].find(OPEN) {
            let open = rest_start + rel;
            push_literal(&src[rest_start..open], rest_start, &mut segments);
            let body_start = open + OPEN.len();
            let close =
                find_close(src, body_start).ok_or(ExprError::UnterminatedExpression { pos: open })?;
            let body = &src[body_start..close];
            if body.trim().is_empty() {
                return Err(ExprError::EmptyExpression { pos: open });
            }
            segments.push(Segment::Expr(Expr::parse(body)?));
            rest_start = close + CLOSE.len();
        }
        push_literal(&src[rest_start..], rest_start, &mut segments);

        Ok(Self {
            source: src.to_string(),
            segments,
            diagnostics,
        })
    }

    /// A template with no expressions.
    pub fn literal(text: impl Into<String>) -> Self {
        let text = text.into();
        let segments = if text.is_empty() {
            Vec::new()
        } else {
            vec![Segment::Literal(text.clone())]
        };
        Self {
            source: text,
            segments,
            diagnostics: Vec::new(),
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn diagnostics(&self) -> &[TemplateDiagnostic] {
        &self.diagnostics
    }

    pub fn is_literal(&self) -> bool {
        self.segments.iter().all(|s| matches!(s, Segment::Literal(_)))
    }

    pub fn expressions(&self) -> impl Iterator<Item = &Expr> {
        self.segments.iter().filter_map(|s| match s {
            Segment::Expr(e) => Some(e),
            Segment::Literal(_) => None,
        })
    }

    pub fn references(&self) -> Vec<&ContextPath> {
        self.expressions().flat_map(Expr::references).collect()
    }

    /// Render, failing on any expression whose value is missing.
    pub fn render(&self, resolver: &dyn Resolver) -> Result<String, ExprError> {
        let mut out = String::new();
        for seg in &self.segments {
            match seg {
                Segment::Literal(text) => out.push_str(text),
                Segment::Expr(e) => out.push_str(&e.evaluate_strict(resolver)?.render()),
            }
        }
        Ok(out)
    }

    /// Render with missing values as empty strings.
    pub fn render_lenient(&self, resolver: &dyn Resolver) -> String {
        self.segments
            .iter()
            .map(|seg| match seg {
                Segment::Literal(text) => text.clone(),
                Segment::Expr(e) => e.evaluate(resolver).render(),
            })
            .collect()
    }
}

impl fmt::Display for Template {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

impl Serialize for Template {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.source)
    }
}

impl<'de> Deserialize<'de> for Template {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        // YAML scalars such as `1` or `true` are valid templates too.
        let value = serde_yaml::Value::deserialize(deserializer)?;
        let text = match value {
            serde_yaml::Value::String(s) => s,
            serde_yaml::Value::Number(n) => n.to_string(),
            serde_yaml::Value::Bool(b) => b.to_string(),
            serde_yaml::Value::Null => String::new(),
            other => {
                return Err(serde::de::Error::custom(format!(
                    "expected a scalar template, found {other:?}"
                )))
            }
        };
        Template::parse(&text).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::{ExprValue, JobStatus};

    struct Ctx;

    impl Resolver for Ctx {
        fn resolve(&self, path: &ContextPath) -> Option<ExprValue> {
            match path.to_string().as_str() {
                "github.workflow" => Some("PR Checks".into()),
                "github.ref" => Some("refs/heads/feature".into()),
                "matrix.task" => Some("detection".into()),
                _ => None,
            }
        }

        fn status(&self) -> JobStatus {
            JobStatus::Success
        }
    }

    #[test]
    fn test_concurrency_group_renders() {
        let t = Template::parse(
            "${{ github.workflow }}-Unit-Test-${{ github.event.pull_request.number || github.ref }}",
        )
        .unwrap();
        assert_eq!(t.render(&Ctx).unwrap(), "PR Checks-Unit-Test-refs/heads/feature");
        assert!(t.diagnostics().is_empty());
    }

    #[test]
    fn test_stray_brace_is_kept_and_flagged() {
        let src = "${{ github.workflow }}-Coverage-Test-${{ github.event.pull_request.number || github.ref }}}";
        let t = Template::parse(src).unwrap();
        assert_eq!(
            t.render(&Ctx).unwrap(),
            "PR Checks-Coverage-Test-refs/heads/feature}"
        );
        assert_eq!(
            t.diagnostics(),
            &[TemplateDiagnostic::StrayClosingBrace {
                offset: src.len() - 1
            }]
        );
    }

    #[test]
    fn test_unterminated_expression() {
        assert!(matches!(
            Template::parse("perf-${{ matrix.task"),
            Err(ExprError::UnterminatedExpression { pos: 5 })
        ));
    }

    #[test]
    fn test_empty_expression() {
        assert!(matches!(
            Template::parse("${{ }}"),
            Err(ExprError::EmptyExpression { .. })
        ));
    }

    #[test]
    fn test_strict_vs_lenient_rendering() {
        let t = Template::parse("perf-${{ inputs.artifact-prefix }}-${{ matrix.task }}").unwrap();
        assert!(t.render(&Ctx).is_err());
        assert_eq!(t.render_lenient(&Ctx), "perf--detection");
    }

    #[test]
    fn test_quoted_braces_do_not_close() {
        let t = Template::parse("${{ contains(github.ref, '}}') }}").unwrap();
        assert_eq!(t.render(&Ctx).unwrap(), "false");
    }

    #[test]
    fn test_deserialize_from_yaml_scalar() {
        let t: Template = serde_yaml::from_str("600").unwrap();
        assert!(t.is_literal());
        assert_eq!(t.source(), "600");
    }
}
