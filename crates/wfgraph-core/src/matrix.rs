//! Matrix expansion.
//!
//! Expansion follows the hosted runner semantics:
//! 1. cartesian product of the axes, first axis outermost;
//! 2. `exclude` entries remove every combination they partially match;
//! 3. each `include` entry extends every combination whose *original* axis
//!    values it agrees with (it may overwrite values added by an earlier
//!    include, never original ones); if it extends none it is appended as a
//!    new combination.

use std::fmt;

use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{Result, WorkflowError};
use crate::expr::ExprValue;

/// Upper bound on combinations per job.
pub const MAX_COMBINATIONS: usize = 256;

/// One concrete assignment of matrix keys, in key declaration order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Combination(Vec<(String, ExprValue)>);

impl Combination {
    pub fn new(pairs: Vec<(String, ExprValue)>) -> Self {
        Self(pairs)
    }

    pub fn get(&self, key: &str) -> Option<&ExprValue> {
        self.0.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn set(&mut self, key: &str, value: ExprValue) {
        match self.0.iter_mut().find(|(k, _)| k == key) {
            Some((_, v)) => *v = value,
            None => self.0.push((key.to_string(), value)),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ExprValue)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Values joined as shown in job titles, e.g. `detection, 3.10`.
    pub fn values_text(&self) -> String {
        self.0
            .iter()
            .map(|(_, v)| v.render())
            .collect::<Vec<_>>()
            .join(", ")
    }

    fn matches(&self, other: &Combination) -> bool {
        other
            .iter()
            .all(|(k, v)| self.get(k).is_some_and(|mine| mine.loose_eq(v)))
    }
}

impl fmt::Display for Combination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(|(k, v)| format!("{k}={v}")).collect();
        f.write_str(&parts.join(","))
    }
}

impl Serialize for Combination {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (k, v) in &self.0 {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}

/// A `strategy.matrix` declaration.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Matrix {
    pub axes: Vec<(String, Vec<ExprValue>)>,
    pub include: Vec<Combination>,
    pub exclude: Vec<Combination>,
}

fn scalar(value: serde_yaml::Value) -> std::result::Result<ExprValue, String> {
    Ok(match value {
        serde_yaml::Value::Null => ExprValue::Null,
        serde_yaml::Value::Bool(b) => ExprValue::Bool(b),
        serde_yaml::Value::Number(n) => ExprValue::Number(n.as_f64().unwrap_or(f64::NAN)),
        serde_yaml::Value::String(s) => ExprValue::String(s),
        other => return Err(format!("matrix values must be scalars, found {other:?}")),
    })
}

fn key_text(key: &serde_yaml::Value) -> std::result::Result<String, String> {
    key.as_str()
        .map(str::to_string)
        .ok_or_else(|| format!("matrix keys must be strings, found {key:?}"))
}

fn combinations(value: serde_yaml::Value, what: &str) -> std::result::Result<Vec<Combination>, String> {
    let serde_yaml::Value::Sequence(entries) = value else {
        return Err(format!("matrix {what} must be a list"));
    };
    entries
        .into_iter()
        .map(|entry| {
            let serde_yaml::Value::Mapping(m) = entry else {
                return Err(format!("matrix {what} entries must be mappings"));
            };
            let mut pairs = Vec::with_capacity(m.len());
            for (k, v) in m {
                pairs.push((key_text(&k)?, scalar(v)?));
            }
            Ok(Combination(pairs))
        })
        .collect()
}

impl<'de> Deserialize<'de> for Matrix {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        use serde::de::Error;

        let serde_yaml::Value::Mapping(mapping) = serde_yaml::Value::deserialize(deserializer)?
        else {
            return Err(D::Error::custom(
                "matrix must be a mapping (expression matrices are not supported)",
            ));
        };
        let mut matrix = Matrix::default();
        for (key, value) in mapping {
            let key = key_text(&key).map_err(D::Error::custom)?;
            match key.as_str() {
                "include" => matrix.include = combinations(value, "include").map_err(D::Error::custom)?,
                "exclude" => matrix.exclude = combinations(value, "exclude").map_err(D::Error::custom)?,
                _ => {
                    let serde_yaml::Value::Sequence(values) = value else {
                        return Err(D::Error::custom(format!("matrix axis '{key}' must be a list")));
                    };
                    let values = values
                        .into_iter()
                        .map(scalar)
                        .collect::<std::result::Result<Vec<_>, _>>()
                        .map_err(D::Error::custom)?;
                    matrix.axes.push((key, values));
                }
            }
        }
        Ok(matrix)
    }
}

impl Serialize for Matrix {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(None)?;
        for (k, values) in &self.axes {
            map.serialize_entry(k, values)?;
        }
        if !self.include.is_empty() {
            map.serialize_entry("include", &self.include)?;
        }
        if !self.exclude.is_empty() {
            map.serialize_entry("exclude", &self.exclude)?;
        }
        map.end()
    }
}

impl Matrix {
    /// Build a matrix from axes only.
    pub fn from_axes(axes: Vec<(&str, Vec<ExprValue>)>) -> Self {
        Self {
            axes: axes
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect(),
            include: Vec::new(),
            exclude: Vec::new(),
        }
    }

    pub fn axis(&self, key: &str) -> Option<&[ExprValue]> {
        self.axes
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_slice())
    }

    /// Every key that can appear in a combination.
    pub fn keys(&self) -> Vec<&str> {
        let mut keys: Vec<&str> = self.axes.iter().map(|(k, _)| k.as_str()).collect();
        for (k, _) in self.include.iter().flat_map(|c| c.iter()) {
            if !keys.contains(&k) {
                keys.push(k);
            }
        }
        keys
    }

    /// All values a key can take, across axes and include entries.
    pub fn values_of(&self, key: &str) -> Vec<&ExprValue> {
        let mut out: Vec<&ExprValue> = self.axis(key).map(|v| v.iter().collect()).unwrap_or_default();
        out.extend(self.include.iter().filter_map(|c| c.get(key)));
        out
    }

    pub fn expand(&self, job: &str) -> Result<Vec<Combination>> {
        let invalid = |reason: String| WorkflowError::InvalidMatrix {
            job: job.to_string(),
            reason,
        };

        if self.axes.is_empty() && self.include.is_empty() {
            return Err(invalid("matrix declares no axes and no include entries".to_string()));
        }
        if let Some((key, _)) = self.axes.iter().find(|(_, v)| v.is_empty()) {
            return Err(invalid(format!("axis '{key}' has no values")));
        }
        let product: usize = self
            .axes
            .iter()
            .try_fold(1usize, |acc, (_, v)| acc.checked_mul(v.len()))
            .unwrap_or(usize::MAX);
        if product > MAX_COMBINATIONS {
            return Err(invalid(format!(
                "{product} combinations exceed the limit of {MAX_COMBINATIONS}"
            )));
        }
        for entry in &self.exclude {
            if let Some((k, _)) = entry.iter().find(|(k, _)| self.axis(k).is_none()) {
                return Err(invalid(format!("exclude references unknown key '{k}'")));
            }
        }

        let mut combos: Vec<Combination> = if self.axes.is_empty() {
            Vec::new()
        } else {
            let mut acc = vec![Combination::default()];
            for (key, values) in &self.axes {
                acc = acc
                    .into_iter()
                    .flat_map(|base| {
                        values.iter().map(move |v| {
                            let mut next = base.clone();
                            next.0.push((key.clone(), v.clone()));
                            next
                        })
                    })
                    .collect();
            }
            acc
        };

        combos.retain(|c| !self.exclude.iter().any(|ex| c.matches(ex)));

        let original_keys: Vec<&str> = self.axes.iter().map(|(k, _)| k.as_str()).collect();
        let base_len = combos.len();
        for entry in &self.include {
            let mut extended = false;
            for combo in combos.iter_mut().take(base_len) {
                let agrees = entry
                    .iter()
                    .filter(|(k, _)| original_keys.contains(k))
                    .all(|(k, v)| combo.get(k).is_some_and(|mine| mine.loose_eq(v)));
                if agrees {
                    for (k, v) in entry.iter() {
                        if !original_keys.contains(&k) {
                            combo.set(k, v.clone());
                        }
                    }
                    extended = true;
                }
            }
            if !extended {
                combos.push(entry.clone());
            }
        }

        if combos.len() > MAX_COMBINATIONS {
            return Err(invalid(format!(
                "{} combinations exceed the limit of {MAX_COMBINATIONS}",
                combos.len()
            )));
        }
        if combos.is_empty() {
            return Err(invalid("every combination is excluded".to_string()));
        }
        Ok(combos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn s(v: &str) -> ExprValue {
        ExprValue::from(v)
    }

    fn parse(yaml: &str) -> Matrix {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn test_cartesian_product_order() {
        let m = parse("python: ['3.10', '3.11']\ntask: [detection, classification]\n");
        let combos = m.expand("Unit-Test").unwrap();
        assert_eq!(combos.len(), 4);
        assert_eq!(combos[0].values_text(), "3.10, detection");
        assert_eq!(combos[1].values_text(), "3.10, classification");
        assert_eq!(combos[3].values_text(), "3.11, classification");
    }

    #[test]
    fn test_exclude_partial_match() {
        let m = parse(
            "python: ['3.10', '3.11']\ntask: [detection, classification]\nexclude:\n  - python: '3.11'\n    task: detection\n",
        );
        let combos = m.expand("Unit-Test").unwrap();
        assert_eq!(combos.len(), 3);
        assert!(!combos
            .iter()
            .any(|c| c.get("python") == Some(&s("3.11")) && c.get("task") == Some(&s("detection"))));
    }

    #[test]
    fn test_include_extends_matching_combinations() {
        let m = parse(
            "include:\n  - task: detection\n    test_dir: tests/integration/cli/detection\n  - task: segmentation\n    test_dir: tests/integration/cli/segmentation\ntask: [detection, segmentation]\n",
        );
        let combos = m.expand("Integration-Test").unwrap();
        assert_eq!(combos.len(), 2);
        assert_eq!(
            combos[0].get("test_dir"),
            Some(&s("tests/integration/cli/detection"))
        );
    }

    #[test]
    fn test_include_never_overwrites_original_values() {
        let m = parse("fruit: [apple, pear]\nanimal: [cat]\ninclude:\n  - fruit: apple\n    animal: dog\n");
        let combos = m.expand("j").unwrap();
        // Disagrees with the original `animal` value, so it is appended.
        assert_eq!(combos.len(), 3);
        assert_eq!(combos[2].get("animal"), Some(&s("dog")));
        assert_eq!(combos[0].get("animal"), Some(&s("cat")));
    }

    #[test]
    fn test_include_only_matrix() {
        let m = parse(
            "include:\n  - task: action\n  - task: anomaly\n",
        );
        let combos = m.expand("Perf").unwrap();
        assert_eq!(combos.len(), 2);
    }

    #[test]
    fn test_empty_axis_rejected() {
        let m = parse("task: []\n");
        assert!(matches!(
            m.expand("j"),
            Err(WorkflowError::InvalidMatrix { .. })
        ));
    }

    #[test]
    fn test_combination_limit() {
        let values: Vec<ExprValue> = (0..17).map(|i| ExprValue::Number(i as f64)).collect();
        let m = Matrix::from_axes(vec![("a", values.clone()), ("b", values)]);
        let err = m.expand("big").unwrap_err();
        assert!(err.to_string().contains("289"));
    }

    #[test]
    fn test_exclude_unknown_key_rejected() {
        let m = parse("task: [a]\nexclude:\n  - other: a\n");
        assert!(m.expand("j").is_err());
    }

    #[test]
    fn test_expression_matrix_rejected() {
        let result: std::result::Result<Matrix, _> =
            serde_yaml::from_str("\"${{ fromJSON(inputs.tasks) }}\"");
        assert!(result.is_err());
    }
}
