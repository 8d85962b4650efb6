//! Declared `on:` triggers and workflow inputs.

use serde::{Deserialize, Deserializer, Serialize};

use super::one_or_many;

/// `type:` of a dispatch/call input together with its default.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InputKind {
    Choice {
        options: Vec<String>,
        default: Option<String>,
    },
    String {
        default: Option<String>,
    },
    Number {
        default: Option<f64>,
    },
    Boolean {
        default: Option<bool>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InputSpec {
    pub name: String,
    pub description: Option<String>,
    pub required: bool,
    pub kind: InputKind,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawInput {
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    required: bool,
    #[serde(rename = "type", default)]
    kind: Option<String>,
    #[serde(default)]
    options: Vec<String>,
    #[serde(default)]
    default: Option<serde_yaml::Value>,
}

fn scalar_text(value: &serde_yaml::Value) -> Option<String> {
    match value {
        serde_yaml::Value::String(s) => Some(s.clone()),
        serde_yaml::Value::Number(n) => Some(n.to_string()),
        serde_yaml::Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

impl InputSpec {
    fn from_raw(name: String, raw: RawInput) -> Result<Self, String> {
        let default_text = raw.default.as_ref().and_then(scalar_text);
        let kind = match raw.kind.as_deref().unwrap_or("string") {
            "choice" => {
                if raw.options.is_empty() {
                    return Err(format!("choice input '{name}' declares no options"));
                }
                InputKind::Choice {
                    options: raw.options,
                    default: default_text,
                }
            }
            "string" | "environment" => InputKind::String {
                default: default_text,
            },
            "number" => {
                let default = match &default_text {
                    None => None,
                    Some(t) => Some(t.parse::<f64>().map_err(|_| {
                        format!("number input '{name}' has non-numeric default {t:?}")
                    })?),
                };
                InputKind::Number { default }
            }
            "boolean" => {
                let default = match default_text.as_deref() {
                    None => None,
                    Some("true") => Some(true),
                    Some("false") => Some(false),
                    Some(other) => {
                        return Err(format!(
                            "boolean input '{name}' has non-boolean default {other:?}"
                        ))
                    }
                };
                InputKind::Boolean { default }
            }
            other => return Err(format!("input '{name}' has unknown type '{other}'")),
        };
        Ok(Self {
            name,
            description: raw.description,
            required: raw.required,
            kind,
        })
    }

    /// Declared default rendered as text.
    pub fn default_text(&self) -> Option<String> {
        match &self.kind {
            InputKind::Choice { default, .. } | InputKind::String { default } => default.clone(),
            InputKind::Number { default } => {
                default.map(|n| crate::expr::ExprValue::Number(n).render())
            }
            InputKind::Boolean { default } => default.map(|b| b.to_string()),
        }
    }
}

/// Inputs in declaration order.
fn inputs_from_mapping(
    mapping: Option<serde_yaml::Mapping>,
) -> Result<Vec<InputSpec>, String> {
    let mut out = Vec::new();
    for (key, value) in mapping.unwrap_or_default() {
        let name = scalar_text(&key).ok_or("input names must be strings")?;
        let raw: RawInput =
            serde_yaml::from_value(value).map_err(|e| format!("input '{name}': {e}"))?;
        out.push(InputSpec::from_raw(name, raw)?);
    }
    Ok(out)
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BranchFilter {
    #[serde(deserialize_with = "one_or_many")]
    pub branches: Vec<String>,
    #[serde(rename = "branches-ignore", deserialize_with = "one_or_many")]
    pub branches_ignore: Vec<String>,
    #[serde(deserialize_with = "one_or_many")]
    pub tags: Vec<String>,
    #[serde(deserialize_with = "one_or_many")]
    pub paths: Vec<String>,
    #[serde(rename = "paths-ignore", deserialize_with = "one_or_many")]
    pub paths_ignore: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PullRequestFilter {
    #[serde(flatten)]
    pub branches: BranchFilter,
    #[serde(deserialize_with = "one_or_many")]
    pub types: Vec<String>,
}

/// Everything under `on:`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TriggerSet {
    pub push: Option<BranchFilter>,
    pub pull_request: Option<PullRequestFilter>,
    pub workflow_dispatch: Option<Vec<InputSpec>>,
    pub workflow_call: Option<Vec<InputSpec>>,
    /// Cron expressions.
    pub schedule: Vec<String>,
    /// Events declared but not modelled (e.g. `merge_group`).
    pub other: Vec<String>,
}

impl TriggerSet {
    /// Inputs accepted by a dispatch or call, whichever is declared.
    pub fn inputs_for(&self, event: &str) -> Option<&[InputSpec]> {
        match event {
            "workflow_dispatch" => self.workflow_dispatch.as_deref(),
            "workflow_call" => self.workflow_call.as_deref(),
            _ => None,
        }
    }

    pub fn is_reusable(&self) -> bool {
        self.workflow_call.is_some()
    }

    fn add_event(&mut self, event: &str, body: serde_yaml::Value) -> Result<(), String> {
        let is_null = body.is_null();
        let mapping = |b: serde_yaml::Value| -> Result<Option<serde_yaml::Mapping>, String> {
            match b {
                serde_yaml::Value::Null => Ok(None),
                serde_yaml::Value::Mapping(m) => Ok(Some(m)),
                other => Err(format!("'{event}' must be a mapping, found {other:?}")),
            }
        };
        match event {
            "push" => {
                self.push = Some(if is_null {
                    BranchFilter::default()
                } else {
                    serde_yaml::from_value(body).map_err(|e| format!("push: {e}"))?
                })
            }
            "pull_request" | "pull_request_target" => {
                self.pull_request = Some(if is_null {
                    PullRequestFilter::default()
                } else {
                    serde_yaml::from_value(body).map_err(|e| format!("{event}: {e}"))?
                })
            }
            "workflow_dispatch" | "workflow_call" => {
                let mut m = mapping(body)?.unwrap_or_default();
                let inputs = match m.remove("inputs") {
                    None | Some(serde_yaml::Value::Null) => None,
                    Some(serde_yaml::Value::Mapping(i)) => Some(i),
                    Some(other) => return Err(format!("{event}.inputs: expected mapping, found {other:?}")),
                };
                let specs = inputs_from_mapping(inputs)?;
                if event == "workflow_dispatch" {
                    self.workflow_dispatch = Some(specs);
                } else {
                    self.workflow_call = Some(specs);
                }
            }
            "schedule" => {
                #[derive(Deserialize)]
                struct Cron {
                    cron: String,
                }
                let crons: Vec<Cron> =
                    serde_yaml::from_value(body).map_err(|e| format!("schedule: {e}"))?;
                self.schedule = crons.into_iter().map(|c| c.cron).collect();
            }
            other => self.other.push(other.to_string()),
        }
        Ok(())
    }
}

impl<'de> Deserialize<'de> for TriggerSet {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        use serde::de::Error;

        let value = serde_yaml::Value::deserialize(deserializer)?;
        let mut set = TriggerSet::default();
        match value {
            serde_yaml::Value::String(event) => set
                .add_event(&event, serde_yaml::Value::Null)
                .map_err(D::Error::custom)?,
            serde_yaml::Value::Sequence(events) => {
                for event in events {
                    let name = scalar_text(&event)
                        .ok_or_else(|| D::Error::custom("trigger names must be strings"))?;
                    set.add_event(&name, serde_yaml::Value::Null)
                        .map_err(D::Error::custom)?;
                }
            }
            serde_yaml::Value::Mapping(events) => {
                for (key, body) in events {
                    let name = scalar_text(&key)
                        .ok_or_else(|| D::Error::custom("trigger names must be strings"))?;
                    set.add_event(&name, body).map_err(D::Error::custom)?;
                }
            }
            other => {
                return Err(D::Error::custom(format!(
                    "'on' must be a string, list or mapping, found {other:?}"
                )))
            }
        }
        Ok(set)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PERF_ON: &str = r#"
workflow_dispatch:
  inputs:
    model-category:
      type: choice
      description: Model category to run benchmark
      options: [default, all]
      default: default
    num-repeat:
      type: number
      default: 1
schedule:
  - cron: "0 2 * * 1"
"#;

    #[test]
    fn test_dispatch_inputs_in_declaration_order() {
        let set: TriggerSet = serde_yaml::from_str(PERF_ON).unwrap();
        let inputs = set.workflow_dispatch.as_ref().unwrap();
        assert_eq!(inputs[0].name, "model-category");
        assert_eq!(inputs[1].name, "num-repeat");
        assert_eq!(inputs[1].default_text().as_deref(), Some("1"));
        assert_eq!(set.schedule, vec!["0 2 * * 1".to_string()]);
    }

    #[test]
    fn test_string_and_list_forms() {
        let set: TriggerSet = serde_yaml::from_str("push").unwrap();
        assert!(set.push.is_some());
        let set: TriggerSet = serde_yaml::from_str("[push, pull_request]").unwrap();
        assert!(set.pull_request.is_some());
    }

    #[test]
    fn test_choice_without_options_rejected() {
        let result: Result<TriggerSet, _> = serde_yaml::from_str(
            "workflow_dispatch:\n  inputs:\n    x:\n      type: choice\n",
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_pull_request_filter() {
        let set: TriggerSet = serde_yaml::from_str(
            "pull_request:\n  types: [opened, synchronize]\n  branches: [develop, 'releases/**']\n",
        )
        .unwrap();
        let pr = set.pull_request.unwrap();
        assert_eq!(pr.types.len(), 2);
        assert_eq!(pr.branches.branches[1], "releases/**");
    }
}
