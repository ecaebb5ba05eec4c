//! Public engine API: `run` a serialized workflow to a structured report, or
//! `validate` it without running.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

use crate::error::{EngineError, ErrorKind};
use crate::executor::{Executor, RunOutcome, RunStatus};
use crate::handler::{HandlerRegistry, ParamRequirement};
use crate::model::validate::ValidationIssue;
use crate::model::SerializedWorkflow;
use crate::serializer;
use crate::trace::{CostSummary, Span};

/// Options for one run.
#[derive(Debug, Default)]
pub struct RunOptions {
    /// External cancellation signal; a fresh token is used when absent.
    pub cancel: Option<CancellationToken>,
    /// Whole-workflow timeout. Exceeding it cancels the run.
    pub timeout: Option<Duration>,
    /// Environment values for `{{ env.KEY }}` references.
    pub env: HashMap<String, String>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ValidateOptions {
    /// Also check params marked user-only required.
    pub validate_required: bool,
}

/// The single structured result every caller observes. The trace is populated
/// on success and on every failure path.
#[derive(Debug, Serialize)]
pub struct RunReport {
    pub status: RunStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<EngineError>,
    pub trace: Vec<Span>,
    pub cost: CostSummary,
}

impl RunReport {
    fn from_outcome(outcome: RunOutcome) -> Self {
        Self {
            status: outcome.status,
            output: outcome.output,
            error: outcome.error,
            trace: outcome.trace,
            cost: outcome.cost,
        }
    }

    fn failed(error: EngineError) -> Self {
        Self {
            status: RunStatus::Failed,
            output: None,
            error: Some(error),
            trace: Vec::new(),
            cost: CostSummary::default(),
        }
    }
}

/// Workflow engine bound to an immutable handler registry. Cheap to clone;
/// each run owns its context exclusively, so concurrent runs never share
/// mutable state.
#[derive(Clone)]
pub struct Engine {
    registry: Arc<HandlerRegistry>,
}

impl Engine {
    pub fn new(registry: Arc<HandlerRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    /// Execute a serialized workflow to completion.
    pub async fn run(
        &self,
        workflow: &SerializedWorkflow,
        input: Value,
        options: RunOptions,
    ) -> RunReport {
        let run_id = Uuid::new_v4();
        let compiled = match serializer::compile(workflow) {
            Ok(w) => w,
            Err(err) => return RunReport::failed(err),
        };
        let cancel = options.cancel.unwrap_or_default();
        let deadline = options.timeout.map(|t| Instant::now() + t);

        info!(%run_id, blocks = compiled.blocks.len(), "run started");
        let executor = Executor::new(&compiled, &self.registry, cancel, deadline);
        let outcome = executor.execute(input, options.env).await;
        info!(%run_id, status = ?outcome.status, "run finished");
        RunReport::from_outcome(outcome)
    }

    /// Validate without running: graph invariants, kind registration, and
    /// optionally required fields. Empty result means ok.
    pub fn validate(
        &self,
        workflow: &SerializedWorkflow,
        options: ValidateOptions,
    ) -> Vec<ValidationIssue> {
        let mut issues = crate::model::validate::check_graph(workflow);
        for (i, block) in workflow.blocks.iter().enumerate() {
            let Some(schema) = self.registry.schema(&block.kind) else {
                issues.push(ValidationIssue {
                    path: format!("blocks[{i}].kind"),
                    kind: ErrorKind::InvalidBlockKind,
                    message: format!("unknown block kind {:?}", block.kind),
                });
                continue;
            };
            if !options.validate_required {
                continue;
            }
            for param in &schema.params {
                if param.requirement != ParamRequirement::UserOnly {
                    continue;
                }
                let missing = match block.params.get(&param.name) {
                    None | Some(Value::Null) => true,
                    Some(Value::String(s)) => s.trim().is_empty(),
                    Some(_) => false,
                };
                if missing {
                    issues.push(ValidationIssue {
                        path: format!("blocks[{i}].params.{}", param.name),
                        kind: ErrorKind::MissingRequiredField,
                        message: format!(
                            "block {:?} is missing required field {:?}",
                            block.id, param.name
                        ),
                    });
                }
            }
        }
        issues
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Connection, SerializedBlock};
    use serde_json::{json, Map};

    fn engine() -> Engine {
        Engine::new(Arc::new(HandlerRegistry::with_control_handlers()))
    }

    fn starter_block(id: &str) -> SerializedBlock {
        SerializedBlock {
            id: id.into(),
            name: "Start".into(),
            kind: "starter".into(),
            enabled: true,
            params: Map::new(),
            position: None,
            extra: Map::new(),
        }
    }

    fn minimal_workflow() -> SerializedWorkflow {
        SerializedWorkflow {
            version: "2.0".into(),
            blocks: vec![starter_block("s")],
            connections: vec![],
            loops: Default::default(),
            extra: Map::new(),
        }
    }

    #[tokio::test]
    async fn run_of_minimal_workflow_succeeds() {
        let report = engine()
            .run(&minimal_workflow(), json!({"n": 1}), RunOptions::default())
            .await;
        assert_eq!(report.status, RunStatus::Completed);
        assert_eq!(report.output.unwrap()["input"]["n"], 1);
        assert_eq!(report.trace.len(), 1);
        assert_eq!(report.trace[0].kind, "starter");
    }

    #[tokio::test]
    async fn run_of_invalid_workflow_reports_failure() {
        let mut wf = minimal_workflow();
        wf.blocks.push(starter_block("s2"));
        let report = engine().run(&wf, Value::Null, RunOptions::default()).await;
        assert_eq!(report.status, RunStatus::Failed);
        assert_eq!(report.error.unwrap().kind, ErrorKind::InvalidWorkflow);
    }

    #[test]
    fn validate_flags_unknown_kinds_and_missing_fields() {
        let mut wf = minimal_workflow();
        wf.blocks.push(SerializedBlock {
            id: "r".into(),
            name: "Route".into(),
            kind: "router".into(),
            enabled: true,
            params: Map::new(),
            position: None,
            extra: Map::new(),
        });
        wf.blocks.push(SerializedBlock {
            id: "x".into(),
            name: "X".into(),
            kind: "warp".into(),
            enabled: true,
            params: Map::new(),
            position: None,
            extra: Map::new(),
        });
        wf.connections.push(Connection::new("s", "r"));
        wf.connections.push(Connection::new("s", "x"));

        let issues = engine().validate(
            &wf,
            ValidateOptions {
                validate_required: true,
            },
        );
        assert!(issues
            .iter()
            .any(|i| i.kind == ErrorKind::InvalidBlockKind && i.path == "blocks[2].kind"));
        assert!(issues
            .iter()
            .any(|i| i.kind == ErrorKind::MissingRequiredField
                && i.path == "blocks[1].params.expression"));
    }

    #[test]
    fn validate_of_clean_workflow_is_empty() {
        assert!(engine()
            .validate(&minimal_workflow(), ValidateOptions::default())
            .is_empty());
    }
}
