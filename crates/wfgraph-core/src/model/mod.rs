//! Typed workflow records.
//!
//! These mirror the GitHub Actions schema closely enough to be deserialized
//! straight from workflow YAML (see [`crate::loader`]); every string that may
//! contain `${{ }}` is a [`Template`](crate::expr::Template) and every `if:` a
//! [`Condition`](crate::expr::Condition), so malformed expressions are
//! rejected at load time.

mod step;
mod triggers;
mod workflow;

pub use step::{ActionRef, ActionUse, Step, StepKind};
pub use triggers::{BranchFilter, InputKind, InputSpec, PullRequestFilter, TriggerSet};
pub use workflow::{ConcurrencySpec, ContainerSpec, Job, JobId, RunsOn, Strategy, Workflow};

use serde::{Deserialize, Deserializer};

/// Accept either a single value or a list.
pub(crate) fn one_or_many<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany<T> {
        One(T),
        Many(Vec<T>),
    }

    Ok(match Option::<OneOrMany<T>>::deserialize(deserializer)? {
        None => Vec::new(),
        Some(OneOrMany::One(v)) => vec![v],
        Some(OneOrMany::Many(v)) => v,
    })
}
