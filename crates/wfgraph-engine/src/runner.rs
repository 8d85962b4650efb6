//! Step execution.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::{EngineError, Result};

/// A rendered `run:` step, ready to execute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepCommand {
    /// Job instance label, e.g. `Unit-Test (3.10, py310)`.
    pub job: String,
    pub step: String,
    pub script: String,
    /// Shell override from the step; the executor default otherwise.
    pub shell: Option<String>,
    pub env: BTreeMap<String, String>,
    pub working_directory: PathBuf,
}

/// Result of one step execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepOutcome {
    /// Exit code (0 = success, -1 when killed or cancelled).
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
    pub cancelled: bool,
}

impl StepOutcome {
    pub fn passed(&self) -> bool {
        !self.cancelled && self.exit_code == 0
    }

    fn cancelled(started: Instant) -> Self {
        Self {
            exit_code: -1,
            stdout: String::new(),
            stderr: String::new(),
            duration_ms: started.elapsed().as_millis() as u64,
            cancelled: true,
        }
    }
}

/// Runs rendered step scripts. Implementations must return promptly once
/// `cancel` fires, reporting a cancelled outcome.
#[async_trait]
pub trait StepExecutor: Send + Sync {
    async fn execute(&self, command: &StepCommand, cancel: &CancellationToken) -> Result<StepOutcome>;
}

/// Executes scripts with `<shell> -e -c <script>` as child processes.
pub struct ProcessExecutor {
    shell: String,
}

impl ProcessExecutor {
    pub fn new(shell: impl Into<String>) -> Self {
        Self {
            shell: shell.into(),
        }
    }
}

impl Default for ProcessExecutor {
    fn default() -> Self {
        Self::new("bash")
    }
}

#[async_trait]
impl StepExecutor for ProcessExecutor {
    async fn execute(&self, command: &StepCommand, cancel: &CancellationToken) -> Result<StepOutcome> {
        let start = Instant::now();
        if command.script.trim().is_empty() {
            return Err(EngineError::EmptyCommand {
                job: command.job.clone(),
                step: command.step.clone(),
            });
        }
        let shell = command.shell.as_deref().unwrap_or(&self.shell);

        let child = Command::new(shell)
            .arg("-e")
            .arg("-c")
            .arg(&command.script)
            .envs(&command.env)
            .current_dir(&command.working_directory)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| EngineError::Spawn {
                job: command.job.clone(),
                step: command.step.clone(),
                source,
            })?;

        // Dropping the wait future on cancellation kills the child.
        let output = tokio::select! {
            output = child.wait_with_output() => output.map_err(|source| EngineError::Spawn {
                job: command.job.clone(),
                step: command.step.clone(),
                source,
            })?,
            _ = cancel.cancelled() => {
                debug!(job = %command.job, step = %command.step, "step cancelled");
                return Ok(StepOutcome::cancelled(start));
            }
        };

        Ok(StepOutcome {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            duration_ms: start.elapsed().as_millis() as u64,
            cancelled: false,
        })
    }
}

/// Logs and records commands instead of running them.
///
/// Scripts containing a registered marker can be made to fail or to take a
/// while, which is how engine behaviour is exercised without real processes.
#[derive(Default)]
pub struct DryRunExecutor {
    executed: Mutex<Vec<StepCommand>>,
    failures: Vec<(String, i32)>,
    delays: Vec<(String, Duration)>,
}

impl DryRunExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Scripts containing `marker` exit with `exit_code`.
    pub fn fail_when(mut self, marker: &str, exit_code: i32) -> Self {
        self.failures.push((marker.to_string(), exit_code));
        self
    }

    /// Scripts containing `marker` take `delay` before finishing.
    pub fn delay_when(mut self, marker: &str, delay: Duration) -> Self {
        self.delays.push((marker.to_string(), delay));
        self
    }

    /// Commands seen so far, in start order.
    pub fn executed(&self) -> Vec<StepCommand> {
        self.executed
            .lock()
            .map(|seen| seen.clone())
            .unwrap_or_default()
    }

    /// Labels of the job instances that ran a script containing `marker`.
    pub fn jobs_running(&self, marker: &str) -> Vec<String> {
        self.executed()
            .into_iter()
            .filter(|c| c.script.contains(marker))
            .map(|c| c.job)
            .collect()
    }
}

#[async_trait]
impl StepExecutor for DryRunExecutor {
    async fn execute(&self, command: &StepCommand, cancel: &CancellationToken) -> Result<StepOutcome> {
        let start = Instant::now();
        info!(job = %command.job, step = %command.step, script = %command.script, "dry run");
        if let Ok(mut seen) = self.executed.lock() {
            seen.push(command.clone());
        }

        let delay = self
            .delays
            .iter()
            .find(|(marker, _)| command.script.contains(marker.as_str()))
            .map(|(_, d)| *d);
        if let Some(delay) = delay {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => return Ok(StepOutcome::cancelled(start)),
            }
        }
        if cancel.is_cancelled() {
            return Ok(StepOutcome::cancelled(start));
        }

        let exit_code = self
            .failures
            .iter()
            .find(|(marker, _)| command.script.contains(marker.as_str()))
            .map(|(_, code)| *code)
            .unwrap_or(0);
        Ok(StepOutcome {
            exit_code,
            stdout: String::new(),
            stderr: String::new(),
            duration_ms: start.elapsed().as_millis() as u64,
            cancelled: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn command(script: &str) -> StepCommand {
        StepCommand {
            job: "Unit-Test (py310)".to_string(),
            step: "Run unit test".to_string(),
            script: script.to_string(),
            shell: None,
            env: BTreeMap::new(),
            working_directory: PathBuf::from("."),
        }
    }

    #[test]
    fn test_outcome_passed() {
        let outcome = StepOutcome {
            exit_code: 0,
            stdout: String::new(),
            stderr: String::new(),
            duration_ms: 100,
            cancelled: false,
        };
        assert!(outcome.passed());
        assert!(!StepOutcome::cancelled(Instant::now()).passed());
    }

    #[tokio::test]
    async fn test_process_executor_runs_script() {
        let mut cmd = command("echo \"hello $GREETING\"");
        cmd.env.insert("GREETING".to_string(), "world".to_string());
        let outcome = ProcessExecutor::default()
            .execute(&cmd, &CancellationToken::new())
            .await
            .expect("execute failed");
        assert!(outcome.passed());
        assert!(outcome.stdout.contains("hello world"));
    }

    #[tokio::test]
    async fn test_process_executor_stops_on_first_error() {
        let outcome = ProcessExecutor::default()
            .execute(&command("false\necho unreachable"), &CancellationToken::new())
            .await
            .expect("execute failed");
        assert!(!outcome.passed());
        assert_ne!(outcome.exit_code, 0);
        assert!(!outcome.stdout.contains("unreachable"));
    }

    #[tokio::test]
    async fn test_process_executor_cancellation() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });
        let outcome = ProcessExecutor::default()
            .execute(&command("sleep 30"), &cancel)
            .await
            .expect("execute failed");
        assert!(outcome.cancelled);
    }

    #[tokio::test]
    async fn test_empty_script_rejected() {
        let err = ProcessExecutor::default()
            .execute(&command("   "), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::EmptyCommand { .. }));
    }

    #[tokio::test]
    async fn test_dry_run_records_and_fails_on_marker() {
        let exec = DryRunExecutor::new().fail_when("unit-test-py311", 1);
        let ok = exec
            .execute(&command("tox -e unit-test-py310"), &CancellationToken::new())
            .await
            .unwrap();
        let bad = exec
            .execute(&command("tox -e unit-test-py311"), &CancellationToken::new())
            .await
            .unwrap();
        assert!(ok.passed());
        assert_eq!(bad.exit_code, 1);
        assert_eq!(exec.executed().len(), 2);
    }
}
