//! Input Mapping
//!
//! Derives a step's request payload from the workflow input and the outputs
//! of steps it depends on.
//!
//! ```yaml
//! input:
//!   fields:
//!     image_url: { from: input, pointer: /image_url }
//!     tags:      { from: step, step: analyze_image, pointer: /tags }
//!     locale:    { from: literal, value: en-US }
//! ```

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::model::WorkflowGraph;
use crate::error::InvariantError;

/// Key under which the workflow input appears in a dependencies payload.
/// No step may use it as its id.
pub const INPUT_KEY: &str = "input";

/// Rule for building a step's request payload.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(rename_all = "snake_case")]
pub enum InputMapping {
    /// `{"input": <workflow input>, "<dep id>": <dep output>, ...}` for every
    /// dependency that succeeded.
    #[default]
    Dependencies,
    /// The original workflow input, unchanged.
    WorkflowInput,
    /// An object whose fields are each drawn from a [`ValueSource`].
    Fields(BTreeMap<String, ValueSource>),
}

/// Where a single payload field comes from.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "from", rename_all = "snake_case")]
pub enum ValueSource {
    /// JSON pointer into the workflow input (empty pointer = whole value).
    Input {
        #[serde(default)]
        pointer: String,
    },
    /// JSON pointer into a dependency's output.
    Step {
        step: String,
        #[serde(default)]
        pointer: String,
    },
    Literal { value: Value },
}

impl ValueSource {
    pub fn input(pointer: impl Into<String>) -> Self {
        Self::Input {
            pointer: pointer.into(),
        }
    }

    pub fn step(step: impl Into<String>, pointer: impl Into<String>) -> Self {
        Self::Step {
            step: step.into(),
            pointer: pointer.into(),
        }
    }
}

/// Everything a mapping may read from.
pub struct ResolveScope<'a> {
    pub graph: &'a WorkflowGraph,
    pub workflow_input: &'a Value,
    /// Outputs of steps that succeeded so far.
    pub outputs: &'a HashMap<String, Value>,
}

impl ResolveScope<'_> {
    /// Output of `dependency`, `None` if it is an optional step that did not
    /// succeed.
    fn dependency_output(
        &self,
        step_id: &str,
        dependency: &str,
    ) -> Result<Option<&Value>, InvariantError> {
        if let Some(output) = self.outputs.get(dependency) {
            return Ok(Some(output));
        }

        match self.graph.step(dependency) {
            Some(dep) if dep.optional => Ok(None),
            _ => Err(InvariantError::UnresolvedInput {
                step_id: step_id.to_string(),
                dependency: dependency.to_string(),
            }),
        }
    }
}

fn select(value: &Value, pointer: &str) -> Value {
    if pointer.is_empty() {
        return value.clone();
    }
    value.pointer(pointer).cloned().unwrap_or(Value::Null)
}

impl InputMapping {
    /// Builds an object mapping from `(field, source)` pairs.
    pub fn fields<I, K>(fields: I) -> Self
    where
        I: IntoIterator<Item = (K, ValueSource)>,
        K: Into<String>,
    {
        Self::Fields(fields.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    /// Step ids this mapping reads explicitly.
    pub fn referenced_steps(&self) -> Vec<&str> {
        match self {
            Self::Fields(fields) => fields
                .values()
                .filter_map(|source| match source {
                    ValueSource::Step { step, .. } => Some(step.as_str()),
                    _ => None,
                })
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Resolves the payload for `step_id`.
    ///
    /// Reading a required dependency that has no output is an invariant
    /// violation: the scheduler never launches a step before its required
    /// dependencies succeed.
    pub fn resolve(&self, step_id: &str, scope: &ResolveScope<'_>) -> Result<Value, InvariantError> {
        match self {
            Self::WorkflowInput => Ok(scope.workflow_input.clone()),
            Self::Dependencies => {
                let step = scope
                    .graph
                    .step(step_id)
                    .ok_or_else(|| InvariantError::UnknownStep {
                        step_id: step_id.to_string(),
                    })?;

                let mut payload = Map::new();
                payload.insert(INPUT_KEY.to_string(), scope.workflow_input.clone());
                for dep in &step.depends_on {
                    if let Some(output) = scope.dependency_output(step_id, dep)? {
                        payload.insert(dep.clone(), output.clone());
                    }
                }
                Ok(Value::Object(payload))
            }
            Self::Fields(fields) => {
                let mut payload = Map::new();
                for (name, source) in fields {
                    let value = match source {
                        ValueSource::Input { pointer } => select(scope.workflow_input, pointer),
                        ValueSource::Step { step, pointer } => {
                            match scope.dependency_output(step_id, step)? {
                                Some(output) => select(output, pointer),
                                None => Value::Null,
                            }
                        }
                        ValueSource::Literal { value } => value.clone(),
                    };
                    payload.insert(name.clone(), value);
                }
                Ok(Value::Object(payload))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::model::Step;
    use serde_json::json;

    fn graph() -> WorkflowGraph {
        WorkflowGraph::new(
            "g",
            vec![
                Step::new("analyze", "image_analysis"),
                Step::new("feedback", "feedback").optional(),
                Step::new("recommend", "recommendation")
                    .depends_on("analyze")
                    .depends_on("feedback"),
            ],
        )
    }

    #[test]
    fn test_workflow_input_passthrough() {
        let graph = graph();
        let input = json!({"image_url": "s3://x.jpg"});
        let outputs = HashMap::new();
        let scope = ResolveScope {
            graph: &graph,
            workflow_input: &input,
            outputs: &outputs,
        };

        let payload = InputMapping::WorkflowInput.resolve("analyze", &scope).unwrap();
        assert_eq!(payload, input);
    }

    #[test]
    fn test_dependencies_mapping_includes_succeeded_outputs() {
        let graph = graph();
        let input = json!({"user": 7});
        let mut outputs = HashMap::new();
        outputs.insert("analyze".to_string(), json!({"tags": ["denim"]}));
        outputs.insert("feedback".to_string(), json!({"liked": true}));
        let scope = ResolveScope {
            graph: &graph,
            workflow_input: &input,
            outputs: &outputs,
        };

        let payload = InputMapping::Dependencies.resolve("recommend", &scope).unwrap();
        assert_eq!(
            payload,
            json!({
                "input": {"user": 7},
                "analyze": {"tags": ["denim"]},
                "feedback": {"liked": true}
            })
        );
    }

    #[test]
    fn test_dependencies_mapping_omits_failed_optional() {
        let graph = graph();
        let input = json!(null);
        let mut outputs = HashMap::new();
        outputs.insert("analyze".to_string(), json!(1));
        let scope = ResolveScope {
            graph: &graph,
            workflow_input: &input,
            outputs: &outputs,
        };

        let payload = InputMapping::Dependencies.resolve("recommend", &scope).unwrap();
        assert_eq!(payload, json!({"input": null, "analyze": 1}));
    }

    #[test]
    fn test_missing_required_output_is_invariant_violation() {
        let graph = graph();
        let input = json!({});
        let outputs = HashMap::new();
        let scope = ResolveScope {
            graph: &graph,
            workflow_input: &input,
            outputs: &outputs,
        };

        let err = InputMapping::Dependencies
            .resolve("recommend", &scope)
            .unwrap_err();
        assert_eq!(
            err,
            InvariantError::UnresolvedInput {
                step_id: "recommend".into(),
                dependency: "analyze".into(),
            }
        );
    }

    #[test]
    fn test_fields_mapping_with_pointers_and_literals() {
        let graph = graph();
        let input = json!({"image": {"url": "https://cdn/x.png"}});
        let mut outputs = HashMap::new();
        outputs.insert("analyze".to_string(), json!({"colors": ["navy", "white"]}));
        let scope = ResolveScope {
            graph: &graph,
            workflow_input: &input,
            outputs: &outputs,
        };

        let mapping = InputMapping::fields([
            ("url", ValueSource::input("/image/url")),
            ("primary", ValueSource::step("analyze", "/colors/0")),
            ("liked", ValueSource::step("feedback", "/liked")),
            ("missing", ValueSource::input("/nope")),
            (
                "locale",
                ValueSource::Literal {
                    value: json!("en-US"),
                },
            ),
        ]);

        let payload = mapping.resolve("recommend", &scope).unwrap();
        assert_eq!(
            payload,
            json!({
                "url": "https://cdn/x.png",
                "primary": "navy",
                "liked": null,
                "missing": null,
                "locale": "en-US"
            })
        );
    }

    #[test]
    fn test_referenced_steps() {
        let mapping = InputMapping::fields([
            ("a", ValueSource::step("analyze", "")),
            ("b", ValueSource::input("")),
        ]);
        assert_eq!(mapping.referenced_steps(), vec!["analyze"]);
        assert!(InputMapping::Dependencies.referenced_steps().is_empty());
    }

    #[test]
    fn test_fields_mapping_from_yaml() {
        let yaml = r#"
fields:
  url: { from: input, pointer: /image_url }
  tags: { from: step, step: analyze }
  n: { from: literal, value: 3 }
"#;
        let mapping: InputMapping = serde_yaml::from_str(yaml).unwrap();
        match mapping {
            InputMapping::Fields(fields) => {
                assert_eq!(fields.len(), 3);
                assert_eq!(fields["tags"], ValueSource::step("analyze", ""));
                assert_eq!(fields["n"], ValueSource::Literal { value: json!(3) });
            }
            other => panic!("unexpected mapping {:?}", other),
        }
    }

    #[test]
    fn test_unit_mapping_from_yaml() {
        let mapping: InputMapping = serde_yaml::from_str("workflow_input").unwrap();
        assert_eq!(mapping, InputMapping::WorkflowInput);
    }
}
