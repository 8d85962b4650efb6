//! Error taxonomy for workflow modelling, loading and planning.

use thiserror::Error;

use crate::expr::ExprError;

/// Errors produced while loading, validating or instantiating workflows.
#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("invalid job id {id:?}: must start with a letter or '_' and contain only alphanumerics, '-' or '_'")]
    InvalidJobId { id: String },

    #[error("duplicate job id '{job}' in workflow '{workflow}'")]
    DuplicateJob { workflow: String, job: String },

    #[error("job '{job}' needs unknown job '{missing}' in workflow '{workflow}'")]
    UnknownNeeds {
        workflow: String,
        job: String,
        missing: String,
    },

    #[error("dependency cycle detected involving jobs: {jobs:?}")]
    DependencyCycle { jobs: Vec<String> },

    #[error("job not found in graph: {job}")]
    JobNotFound { job: String },

    #[error("workflow not found: {workflow}")]
    WorkflowNotFound { workflow: String },

    #[error("matrix for job '{job}' is invalid: {reason}")]
    InvalidMatrix { job: String, reason: String },

    #[error("unknown input '{input}' for workflow '{workflow}'")]
    UnknownInput { workflow: String, input: String },

    #[error("missing required input '{input}' for workflow '{workflow}'")]
    MissingInput { workflow: String, input: String },

    #[error("input '{input}' value {value:?} is not one of {options:?}")]
    ChoiceOutOfRange {
        input: String,
        value: String,
        options: Vec<String>,
    },

    #[error("input '{input}' value {value:?} is not a valid {expected}")]
    InvalidInputValue {
        input: String,
        value: String,
        expected: String,
    },

    #[error("invalid action reference {reference:?}: {reason}")]
    InvalidActionRef { reference: String, reason: String },

    #[error("invalid workflow file '{file}': {reason}")]
    InvalidWorkflow { file: String, reason: String },

    #[error("invalid glob pattern {pattern:?}: {source}")]
    Pattern {
        pattern: String,
        #[source]
        source: glob::PatternError,
    },

    #[error("no files found for artifact '{artifact}' (paths: {paths:?})")]
    NoArtifactFiles { artifact: String, paths: Vec<String> },

    #[error("reusable workflow call nesting exceeds {max} levels at '{workflow}'")]
    CallDepthExceeded { workflow: String, max: usize },

    #[error("expression error in {location}: {source}")]
    Expression {
        location: String,
        #[source]
        source: ExprError,
    },

    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl WorkflowError {
    /// Attach a location (workflow/job/field) to an expression error.
    pub fn expression(location: impl Into<String>, source: ExprError) -> Self {
        WorkflowError::Expression {
            location: location.into(),
            source,
        }
    }
}

/// Result type for workflow operations.
pub type Result<T> = std::result::Result<T, WorkflowError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dependency_cycle_error_displays_job_names() {
        let err = WorkflowError::DependencyCycle {
            jobs: vec!["Unit-Test".to_string(), "Coverage-Test".to_string()],
        };
        let msg = err.to_string();
        assert!(msg.contains("Unit-Test"));
        assert!(msg.contains("Coverage-Test"));
    }

    #[test]
    fn test_choice_out_of_range_lists_options() {
        let err = WorkflowError::ChoiceOutOfRange {
            input: "data-size".to_string(),
            value: "huge".to_string(),
            options: vec!["small".to_string(), "medium".to_string()],
        };
        let msg = err.to_string();
        assert!(msg.contains("huge"));
        assert!(msg.contains("medium"));
    }

    #[test]
    fn test_expression_error_carries_location() {
        let err = WorkflowError::expression(
            "pr_check.yaml/Unit-Test/concurrency",
            ExprError::UnknownContext {
                name: "gihtub".to_string(),
            },
        );
        let msg = err.to_string();
        assert!(msg.contains("Unit-Test"));
        assert!(msg.contains("gihtub"));
    }
}
