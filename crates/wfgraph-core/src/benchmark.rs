//! Typed command line of the external performance-benchmark driver.
//!
//! Only the invocation is modelled: which flags the workflows pass and how
//! the values derive from workflow inputs. What the driver measures is out
//! of scope.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::config::CiEnvironment;
use crate::error::{Result, WorkflowError};
use crate::expr::ExprValue;

macro_rules! choice_enum {
    ($(#[$meta:meta])* $name:ident, $input:literal { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = WorkflowError;

            fn from_str(s: &str) -> Result<Self> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(WorkflowError::ChoiceOutOfRange {
                        input: $input.to_string(),
                        value: other.to_string(),
                        options: $name::ALL.iter().map(|v| v.as_str().to_string()).collect(),
                    }),
                }
            }
        }
    };
}

choice_enum!(BenchmarkType, "benchmark-type" {
    Accuracy => "accuracy",
    Efficiency => "efficiency",
});

choice_enum!(
    /// `default` runs the speed/balance/accuracy templates only.
    ModelCategory, "model-category" {
    Default => "default",
    All => "all",
});

choice_enum!(DataSize, "data-size" {
    Small => "small",
    Medium => "medium",
    Large => "large",
    All => "all",
});

choice_enum!(
    /// Last stage evaluated; `optimize` means every stage.
    EvalUpto, "eval-upto" {
    Train => "train",
    Export => "export",
    Optimize => "optimize",
});

pub const DEFAULT_DATA_ROOT: &str = "/home/validation/data/new/";
pub const TOX_ENV: &str = "perf-benchmark";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BenchmarkInvocation {
    /// Task under `tests/perf`, e.g. `detection`.
    pub task: String,
    /// Short task tag used in file and artifact names, e.g. `det`.
    pub task_short: String,
    pub benchmark_type: BenchmarkType,
    pub model_category: ModelCategory,
    pub data_root: String,
    pub data_size: DataSize,
    /// `0` keeps the driver's per-data-size default.
    pub num_repeat: u32,
    /// `0` keeps the driver's per-model default.
    pub num_epoch: u32,
    pub eval_upto: EvalUpto,
    pub mlflow_tracking_uri: Option<String>,
    pub user_name: Option<String>,
    /// Extra pytest arguments, passed before the driver flags.
    pub pytest_args: Vec<String>,
}

fn text(inputs: &BTreeMap<String, ExprValue>, key: &str) -> Result<String> {
    inputs
        .get(key)
        .map(ExprValue::render)
        .ok_or_else(|| WorkflowError::MissingInput {
            workflow: "perf-benchmark".to_string(),
            input: key.to_string(),
        })
}

fn count(inputs: &BTreeMap<String, ExprValue>, key: &str) -> Result<u32> {
    let raw = text(inputs, key)?;
    raw.trim().parse().map_err(|_| WorkflowError::InvalidInputValue {
        input: key.to_string(),
        value: raw,
        expected: "non-negative integer".to_string(),
    })
}

impl BenchmarkInvocation {
    /// Build from resolved `workflow_call` inputs of the benchmark workflow.
    pub fn from_inputs(
        inputs: &BTreeMap<String, ExprValue>,
        task: &str,
        task_short: &str,
        env: &CiEnvironment,
        user_name: Option<&str>,
    ) -> Result<Self> {
        Ok(Self {
            task: task.to_string(),
            task_short: task_short.to_string(),
            benchmark_type: text(inputs, "benchmark-type")?.parse()?,
            model_category: text(inputs, "model-category")?.parse()?,
            data_root: DEFAULT_DATA_ROOT.to_string(),
            data_size: text(inputs, "data-size")?.parse()?,
            num_repeat: count(inputs, "num-repeat")?,
            num_epoch: count(inputs, "num-epoch")?,
            eval_upto: text(inputs, "eval-upto")?.parse()?,
            mlflow_tracking_uri: env.mlflow_tracking_server_uri.clone(),
            user_name: user_name.map(str::to_string),
            pytest_args: inputs
                .get("pytest-args")
                .map(|v| v.render().split_whitespace().map(str::to_string).collect())
                .unwrap_or_default(),
        })
    }

    pub fn summary_csv(&self) -> String {
        format!(".tox/perf-{}-benchmark-{}.csv", self.benchmark_type, self.task_short)
    }

    /// Driver flags.
    pub fn to_args(&self) -> Vec<String> {
        let mut args: Vec<String> = [
            ("--benchmark-type", self.benchmark_type.to_string()),
            ("--model-category", self.model_category.to_string()),
            ("--data-root", self.data_root.clone()),
            ("--data-size", self.data_size.to_string()),
            ("--num-repeat", self.num_repeat.to_string()),
            ("--num-epoch", self.num_epoch.to_string()),
            ("--eval-upto", self.eval_upto.to_string()),
            ("--summary-csv", self.summary_csv()),
        ]
        .into_iter()
        .flat_map(|(flag, value)| [flag.to_string(), value])
        .collect();
        if let Some(uri) = &self.mlflow_tracking_uri {
            args.push("--mlflow-tracking-uri".to_string());
            args.push(uri.clone());
        }
        if let Some(user) = &self.user_name {
            args.push("--user-name".to_string());
            args.push(user.clone());
        }
        args
    }

    /// Full `tox` command line.
    pub fn command(&self) -> Vec<String> {
        let mut cmd: Vec<String> = ["tox", "-vv", "-e", TOX_ENV, "--"]
            .into_iter()
            .map(str::to_string)
            .collect();
        cmd.push(format!("tests/perf/test_{}.py", self.task));
        cmd.extend(self.pytest_args.iter().cloned());
        cmd.extend(self.to_args());
        cmd
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inputs() -> BTreeMap<String, ExprValue> {
        [
            ("benchmark-type", ExprValue::from("efficiency")),
            ("model-category", ExprValue::from("default")),
            ("data-size", ExprValue::from("medium")),
            ("num-repeat", ExprValue::Number(1.0)),
            ("num-epoch", ExprValue::Number(2.0)),
            ("eval-upto", ExprValue::from("optimize")),
            ("pytest-args", ExprValue::from("-k yolox")),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
    }

    #[test]
    fn test_to_args_flag_order() {
        let inv = BenchmarkInvocation::from_inputs(
            &inputs(),
            "detection",
            "det",
            &CiEnvironment::default(),
            Some("ci-bot"),
        )
        .unwrap();
        let args = inv.to_args();
        assert_eq!(&args[..4], ["--benchmark-type", "efficiency", "--model-category", "default"]);
        assert!(args.windows(2).any(|w| w == ["--num-epoch", "2"]));
        assert!(args
            .windows(2)
            .any(|w| w == ["--summary-csv", ".tox/perf-efficiency-benchmark-det.csv"]));
        assert!(!args.contains(&"--mlflow-tracking-uri".to_string()));
        assert_eq!(args[args.len() - 2..], ["--user-name", "ci-bot"]);
    }

    #[test]
    fn test_command_places_pytest_args_first() {
        let inv = BenchmarkInvocation::from_inputs(
            &inputs(),
            "detection",
            "det",
            &CiEnvironment::default(),
            None,
        )
        .unwrap();
        let cmd = inv.command();
        assert_eq!(cmd[5], "tests/perf/test_detection.py");
        assert_eq!(&cmd[6..8], ["-k", "yolox"]);
        assert_eq!(cmd[8], "--benchmark-type");
    }

    #[test]
    fn test_invalid_choice() {
        let mut bad = inputs();
        bad.insert("data-size".to_string(), ExprValue::from("huge"));
        let err = BenchmarkInvocation::from_inputs(&bad, "detection", "det", &CiEnvironment::default(), None)
            .unwrap_err();
        assert!(matches!(err, WorkflowError::ChoiceOutOfRange { .. }));
        assert_eq!("all".parse::<DataSize>().unwrap(), DataSize::All);
    }
}
