//! wfgraph core library
//!
//! Typed model of the project's CI workflows: loading, expression
//! evaluation, trigger routing, matrix expansion, concurrency groups,
//! artifacts and static checks.
//!
//! ## Key Components
//!
//! - `loader` / `catalog`: parse workflow YAML into [`Workflow`] values
//! - `expr`: the `${{ ... }}` expression language
//! - `trigger`: match events to workflows and resolve dispatch inputs
//! - `plan`: flatten a triggered workflow into a [`RunPlan`]
//! - `lint`: collect findings over a workflow set
//! - `benchmark` / `container`: typed benchmark invocations and the
//!   container recipe

pub mod artifact;
pub mod benchmark;
pub mod catalog;
pub mod concurrency;
pub mod config;
pub mod container;
pub mod context;
pub mod error;
pub mod expr;
pub mod graph;
pub mod lint;
pub mod loader;
pub mod matrix;
pub mod model;
pub mod obs;
pub mod plan;
pub mod telemetry;
pub mod trigger;

pub use artifact::{ArtifactSpec, CollectedFile, IfNoFilesFound, Retention};
pub use benchmark::{BenchmarkInvocation, BenchmarkType, DataSize, EvalUpto, ModelCategory};
pub use catalog::Catalog;
pub use concurrency::{ConcurrencyKey, GroupShape, RenderedGroup, WorkUnit};
pub use config::{CiEnvironment, EngineConfig};
pub use container::{ContainerRecipe, RecipeHash};
pub use context::{EvalContext, GithubContext, JobConclusion, NeedResult, StepResult};
pub use error::{Result, WorkflowError};
pub use expr::{Condition, Expr, ExprError, ExprValue, JobStatus, Template};
pub use graph::{ExecutionPlan, JobGraph, PlanStep};
pub use lint::{lint_catalog, lint_workflow, Finding, LintOptions, LintReport, Severity};
pub use matrix::{Combination, Matrix};
pub use model::{Job, JobId, Step, StepKind, Workflow};
pub use plan::{JobInstance, PlannedJob, Planner, RunPlan};
pub use trigger::{instantiate, TriggerEvent, WorkflowInstance};
