//! wfgraph-engine: local execution of planned workflow runs
//!
//! Takes a [`wfgraph_core::RunPlan`] and:
//! - starts each job once every job it needs has finished
//! - runs matrix instances in parallel, honouring `fail-fast` and `max-parallel`
//! - gives every instance its own working directory
//! - serializes concurrency groups, cancelling or queueing per `cancel-in-progress`
//! - records every run and its events into a `RunLedger`
//! - stores uploaded artifacts in an `ArtifactStore`

pub mod engine;
pub mod error;
pub mod gate;
pub mod pool;
pub mod recorder;
pub mod runner;
pub mod verdict;
pub mod workspace;

pub use engine::{InstanceReport, JobReport, RunReport, StepReport, WorkflowEngine};
pub use error::{EngineError, Result};
pub use gate::{Admission, ConcurrencyGate, GroupPermit};
pub use pool::{RunnerLease, RunnerPools};
pub use recorder::RunRecorder;
pub use runner::{DryRunExecutor, ProcessExecutor, StepCommand, StepExecutor, StepOutcome};
pub use verdict::RunVerdict;
pub use workspace::InstanceWorkspace;
pub use tokio_util::sync::CancellationToken;
