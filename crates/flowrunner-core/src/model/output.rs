//! Block outputs as a tagged sum over the well-known kinds, with a catch-all
//! for tool outputs. `to_value()` defines exactly what downstream template
//! references can see.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use super::LoopType;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum BlockOutput {
    /// The run input, passed through by the starter block.
    Starter { input: Value },
    /// Branch decision taken by a condition block.
    Condition { selected: String, evaluated: Value },
    /// Target chosen by a router block.
    Router { target: String },
    /// Per-iteration marker while a loop runs; replaced by the aggregate on
    /// completion.
    #[serde(rename_all = "camelCase")]
    LoopIteration {
        loop_id: String,
        index: u32,
        #[serde(skip_serializing_if = "Option::is_none")]
        current_item: Option<Value>,
    },
    /// Aggregated result of a completed loop.
    #[serde(rename_all = "camelCase")]
    Loop {
        loop_id: String,
        max_iterations: u32,
        loop_type: LoopType,
        completed: bool,
        results: Vec<Value>,
    },
    Function {
        result: Value,
    },
    Api {
        status: u16,
        headers: Map<String, Value>,
        body: Value,
    },
    Agent {
        content: Value,
        #[serde(skip_serializing_if = "Option::is_none")]
        model: Option<String>,
    },
    /// Terminal state of a block whose handler failed after retries.
    Failure {
        error: String,
    },
    /// Tool outputs and anything else without a dedicated shape.
    Generic(Map<String, Value>),
}

impl BlockOutput {
    /// Projection seen by template references and stored in iteration results.
    pub fn to_value(&self) -> Value {
        match self {
            BlockOutput::Starter { input } => json!({ "input": input }),
            BlockOutput::Condition {
                selected,
                evaluated,
            } => json!({ "selected": selected, "evaluated": evaluated }),
            BlockOutput::Router { target } => json!({ "target": target }),
            BlockOutput::LoopIteration {
                loop_id,
                index,
                current_item,
            } => json!({
                "loopId": loop_id,
                "index": index,
                "currentItem": current_item,
            }),
            BlockOutput::Loop {
                loop_id,
                max_iterations,
                loop_type,
                completed,
                results,
            } => json!({
                "loopId": loop_id,
                "maxIterations": max_iterations,
                "loopType": match loop_type {
                    LoopType::For => "for",
                    LoopType::ForEach => "forEach",
                },
                "completed": completed,
                "results": results,
            }),
            BlockOutput::Function { result } => result.clone(),
            BlockOutput::Api {
                status,
                headers,
                body,
            } => json!({ "status": status, "headers": headers, "body": body }),
            BlockOutput::Agent { content, model } => {
                json!({ "content": content, "model": model })
            }
            BlockOutput::Failure { error } => json!({ "error": error }),
            BlockOutput::Generic(map) => Value::Object(map.clone()),
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, BlockOutput::Failure { .. })
    }

    pub fn generic(map: Map<String, Value>) -> Self {
        BlockOutput::Generic(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn function_output_projects_raw_result() {
        let out = BlockOutput::Function {
            result: json!({"n": 8}),
        };
        assert_eq!(out.to_value(), json!({"n": 8}));
    }

    #[test]
    fn loop_output_projects_camel_case_fields() {
        let out = BlockOutput::Loop {
            loop_id: "l1".into(),
            max_iterations: 3,
            loop_type: LoopType::For,
            completed: true,
            results: vec![json!({"a": 1})],
        };
        let v = out.to_value();
        assert_eq!(v["maxIterations"], 3);
        assert_eq!(v["loopType"], "for");
        assert_eq!(v["completed"], true);
        assert_eq!(v["results"][0]["a"], 1);
    }

    #[test]
    fn failure_round_trips_through_serde() {
        let out = BlockOutput::Failure {
            error: "connection reset".into(),
        };
        let v = serde_json::to_value(&out).unwrap();
        assert_eq!(v["kind"], "failure");
        let back: BlockOutput = serde_json::from_value(v).unwrap();
        assert_eq!(back, out);
    }
}
