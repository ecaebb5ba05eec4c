//! Layered workflow executor.
//!
//! Each tick computes the set of runnable blocks (the *layer*), resolves
//! their inputs, invokes their handlers concurrently, then applies every
//! result in a single post-layer commit step, so the context has exactly one
//! writer. After each layer the loop manager inspects iteration boundaries
//! and may reset a loop body for its next pass.

pub mod loops;

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde_json::Value;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::context::{BlockState, ExecutionContext};
use crate::error::{EngineError, ErrorKind};
use crate::handler::policy::{block_timeout, RetryPolicy};
use crate::handler::{
    BlockHandler, HandlerOutput, HandlerRegistry, Invocation, LoopBinding, Routing,
};
use crate::model::{Block, BlockOutput, EdgeTag, LoopType, Workflow, kinds, normalize_name};
use crate::resolver::{self, ResolveScope};
use crate::trace::{CostSummary, Span, SpanStatus};

/// Hard cap on scheduler ticks, against graphs that never quiesce.
const LAYER_BUDGET: u32 = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Completed,
    Failed,
    Cancelled,
}

/// Terminal result of one run. The trace is populated on every path.
#[derive(Debug)]
pub struct RunOutcome {
    pub status: RunStatus,
    pub output: Option<Value>,
    pub error: Option<EngineError>,
    pub trace: Vec<Span>,
    pub cost: CostSummary,
}

/// Drives a single workflow run to completion.
pub struct Executor<'a> {
    workflow: &'a Workflow,
    registry: &'a HandlerRegistry,
    cancel: CancellationToken,
    deadline: Option<Instant>,
}

struct PreparedBlock {
    id: String,
    kind: String,
    name: String,
    params: serde_json::Map<String, Value>,
    binding: Option<LoopBinding>,
    handler: Arc<dyn BlockHandler>,
}

struct DispatchResult {
    outcome: Result<HandlerOutput, InvokeFailure>,
    started_at: DateTime<Utc>,
    ended_at: DateTime<Utc>,
}

struct InvokeFailure {
    message: String,
    timed_out: bool,
}

impl<'a> Executor<'a> {
    pub fn new(
        workflow: &'a Workflow,
        registry: &'a HandlerRegistry,
        cancel: CancellationToken,
        deadline: Option<Instant>,
    ) -> Self {
        Self {
            workflow,
            registry,
            cancel,
            deadline,
        }
    }

    pub async fn execute(&self, input: Value, env: HashMap<String, String>) -> RunOutcome {
        let mut ctx = ExecutionContext::new(input, env);
        ctx.active_path.insert(self.workflow.starter.clone());

        let result = self.drive(&mut ctx).await;
        let output = ctx.last_output.take();
        let (trace, cost) = std::mem::take(&mut ctx.trace).finish();
        match result {
            Ok(()) => RunOutcome {
                status: RunStatus::Completed,
                output,
                error: None,
                trace,
                cost,
            },
            Err(err) if err.kind == ErrorKind::Cancelled => RunOutcome {
                status: RunStatus::Cancelled,
                output: None,
                error: Some(err),
                trace,
                cost,
            },
            Err(err) => RunOutcome {
                status: RunStatus::Failed,
                output: None,
                error: Some(err),
                trace,
                cost,
            },
        }
    }

    async fn drive(&self, ctx: &mut ExecutionContext) -> Result<(), EngineError> {
        let mut budget = LAYER_BUDGET;
        loop {
            if self.cancel.is_cancelled() {
                return Err(EngineError::new(ErrorKind::Cancelled, "run cancelled"));
            }
            if self.deadline.is_some_and(|d| Instant::now() >= d) {
                return Err(EngineError::new(
                    ErrorKind::WorkflowTimeout,
                    "workflow timeout exceeded",
                ));
            }
            if budget == 0 {
                return Err(EngineError::invalid_workflow(
                    "scheduler budget exceeded; workflow never quiesces",
                ));
            }
            budget -= 1;

            let layer = self.runnable_blocks(ctx);
            let prepared = self.prepare_layer(ctx, &layer)?;
            if prepared.is_empty() {
                // Nothing dispatchable: let the loop manager advance an
                // iteration boundary, otherwise the run is done.
                if loops::advance(self.workflow, ctx)? {
                    continue;
                }
                return Ok(());
            }

            debug!(layer = ?prepared.iter().map(|p| p.id.as_str()).collect::<Vec<_>>(), "dispatching layer");
            let results = self.dispatch(ctx, &prepared).await?;
            for (block, result) in prepared.iter().zip(results) {
                self.commit(ctx, block, result)?;
            }
            loops::advance(self.workflow, ctx)?;
        }
    }

    /// Runnable: enabled, in the active path, not yet executed this
    /// iteration, and every inbound edge from an active-path source comes
    /// from an executed block. Edges from branches not taken do not count.
    fn runnable_blocks(&self, ctx: &ExecutionContext) -> Vec<String> {
        let mut layer: Vec<String> = self
            .workflow
            .blocks
            .values()
            .filter(|b| b.enabled && ctx.active_path.contains(&b.id) && !ctx.is_executed(&b.id))
            .filter(|b| {
                self.workflow.incoming(&b.id).all(|conn| {
                    !ctx.active_path.contains(&conn.source) || ctx.is_executed(&conn.source)
                })
            })
            .map(|b| b.id.clone())
            .collect();
        layer.sort();
        layer
    }

    /// Resolve inputs for the layer. Blocks whose references are not yet
    /// satisfiable are deferred, not failed.
    fn prepare_layer(
        &self,
        ctx: &mut ExecutionContext,
        layer: &[String],
    ) -> Result<Vec<PreparedBlock>, EngineError> {
        let projections = ctx.output_projections();
        let mut prepared = Vec::with_capacity(layer.len());
        for id in layer {
            let block = &self.workflow.blocks[id];
            if block.kind == kinds::LOOP && !self.prepare_loop(ctx, block, &projections)? {
                continue;
            }
            let binding = self.binding_for(ctx, block);
            let scope = ResolveScope {
                names: &self.workflow.names,
                outputs: &projections,
                env: &ctx.env,
                loop_binding: binding.as_ref(),
            };
            let params = match resolver::resolve_params(&block.params, &scope) {
                Ok(params) => params,
                Err(err) if err.kind == ErrorKind::UnresolvedReference => {
                    debug!(block = %id, %err, "deferring block");
                    continue;
                }
                Err(err) => return Err(err.with_block(id.clone())),
            };
            let handler = self.registry.lookup(&block.kind).ok_or_else(|| {
                EngineError::new(
                    ErrorKind::HandlerNotRegistered,
                    format!("no handler registered for kind {:?}", block.kind),
                )
                .with_block(id.clone())
            })?;
            prepared.push(PreparedBlock {
                id: id.clone(),
                kind: block.kind.clone(),
                name: block.name.clone(),
                params,
                binding,
                handler,
            });
        }
        Ok(prepared)
    }

    /// Materialize loop state on first entry. Returns false when the loop's
    /// forEach items still reference unexecuted blocks.
    fn prepare_loop(
        &self,
        ctx: &mut ExecutionContext,
        block: &Block,
        projections: &HashMap<String, Value>,
    ) -> Result<bool, EngineError> {
        if ctx.loops.contains_key(&block.id) {
            return Ok(true);
        }
        let descriptor = &self.workflow.loops[&block.id];
        let runtime = match descriptor.loop_type {
            LoopType::For => crate::context::LoopRuntime {
                loop_type: LoopType::For,
                max_iterations: descriptor.iterations,
                items: None,
                current_iteration: 0,
                iteration_results: Vec::new(),
            },
            LoopType::ForEach => {
                let raw = descriptor.for_each_items.clone().unwrap_or(Value::Null);
                let outer_binding = self
                    .workflow
                    .enclosing_loop(&block.id)
                    .and_then(|outer| ctx.loops.get(outer).map(|l| l.binding(outer)));
                let scope = ResolveScope {
                    names: &self.workflow.names,
                    outputs: projections,
                    env: &ctx.env,
                    loop_binding: outer_binding.as_ref(),
                };
                let resolved = match resolver::resolve_value(&raw, &scope) {
                    Ok(v) => v,
                    Err(_) => return Ok(false),
                };
                let items = materialize_items(&resolved).map_err(|message| {
                    EngineError::new(ErrorKind::ForEachNotIterable, message)
                        .with_block(block.id.clone())
                })?;
                crate::context::LoopRuntime {
                    loop_type: LoopType::ForEach,
                    max_iterations: items.len() as u32,
                    items: Some(items),
                    current_iteration: 0,
                    iteration_results: Vec::new(),
                }
            }
        };
        ctx.loops.insert(block.id.clone(), runtime);
        Ok(true)
    }

    fn binding_for(&self, ctx: &ExecutionContext, block: &Block) -> Option<LoopBinding> {
        if block.kind == kinds::LOOP
            && let Some(runtime) = ctx.loops.get(&block.id)
        {
            return Some(runtime.binding(&block.id));
        }
        let owner = self.workflow.enclosing_loop(&block.id)?;
        ctx.loops.get(owner).map(|l| l.binding(owner))
    }

    async fn dispatch(
        &self,
        ctx: &mut ExecutionContext,
        prepared: &[PreparedBlock],
    ) -> Result<Vec<DispatchResult>, EngineError> {
        let outputs_view = self.invocation_outputs(ctx);
        let futures: Vec<_> = prepared
            .iter()
            .map(|block| {
                let invocation = Invocation {
                    block_id: block.id.clone(),
                    block_name: block.name.clone(),
                    kind: block.kind.clone(),
                    params: block.params.clone(),
                    run_input: ctx.run_input.clone(),
                    loop_binding: block.binding.clone(),
                    outputs: outputs_view.clone(),
                    cancel: self.cancel.clone(),
                };
                invoke_with_retry(Arc::clone(&block.handler), invocation)
            })
            .collect();
        let gathered = join_all(futures);

        tokio::select! {
            results = gathered => Ok(results),
            _ = self.cancel.cancelled() => {
                self.record_skipped(ctx, prepared);
                Err(EngineError::new(ErrorKind::Cancelled, "run cancelled"))
            }
            _ = deadline_wait(self.deadline) => {
                self.record_skipped(ctx, prepared);
                Err(EngineError::new(ErrorKind::WorkflowTimeout, "workflow timeout exceeded"))
            }
        }
    }

    /// Prior outputs as value copies, keyed by id and by normalized name.
    fn invocation_outputs(&self, ctx: &ExecutionContext) -> HashMap<String, Value> {
        let mut view = HashMap::new();
        for (id, state) in &ctx.states {
            if !state.executed {
                continue;
            }
            let value = state.output.to_value();
            if let Some(block) = self.workflow.block(id)
                && !block.name.trim().is_empty()
            {
                view.insert(normalize_name(&block.name), value.clone());
            }
            view.insert(id.clone(), value);
        }
        view
    }

    fn record_skipped(&self, ctx: &mut ExecutionContext, prepared: &[PreparedBlock]) {
        let now = Utc::now();
        for block in prepared {
            let owner = self.span_owner(block);
            ctx.trace.record(
                Span {
                    block_id: block.id.clone(),
                    block_name: block.name.clone(),
                    kind: block.kind.clone(),
                    started_at: now,
                    ended_at: now,
                    duration_ms: 0,
                    status: SpanStatus::Skipped,
                    input: resolver::redact(&Value::Object(block.params.clone())),
                    output: Value::Null,
                    cost: None,
                    tokens: None,
                    children: Vec::new(),
                },
                owner.as_deref(),
            );
        }
    }

    /// Loop frame a block's span belongs to: the block's own frame for loop
    /// blocks, the innermost enclosing loop otherwise.
    fn span_owner(&self, block: &PreparedBlock) -> Option<String> {
        if block.kind == kinds::LOOP {
            return Some(block.id.clone());
        }
        self.workflow.enclosing_loop(&block.id).map(String::from)
    }

    fn commit(
        &self,
        ctx: &mut ExecutionContext,
        block: &PreparedBlock,
        result: DispatchResult,
    ) -> Result<(), EngineError> {
        let duration_ms = (result.ended_at - result.started_at)
            .num_milliseconds()
            .max(0) as u64;
        let owner = self.span_owner(block);
        let mut span = Span {
            block_id: block.id.clone(),
            block_name: block.name.clone(),
            kind: block.kind.clone(),
            started_at: result.started_at,
            ended_at: result.ended_at,
            duration_ms,
            status: SpanStatus::Success,
            input: resolver::redact(&Value::Object(block.params.clone())),
            output: Value::Null,
            cost: None,
            tokens: None,
            children: Vec::new(),
        };

        match result.outcome {
            Ok(handler_output) => {
                let mut output = handler_output.output;
                match handler_output.routing {
                    Some(Routing::Target(target)) => {
                        let target_id = self
                            .workflow
                            .resolve_block_ref(&target)
                            .ok_or_else(|| {
                                EngineError::new(
                                    ErrorKind::BlockFailed,
                                    format!("router chose unknown target {target:?}"),
                                )
                                .with_block(block.id.clone())
                            })?
                            .to_string();
                        ctx.decisions
                            .router
                            .insert(block.id.clone(), target_id.clone());
                        if let BlockOutput::Router { target } = &mut output {
                            *target = target_id.clone();
                        }
                        // Router exclusivity: only the chosen target joins the
                        // active path; sibling edges stay dark.
                        ctx.active_path.insert(target_id);
                    }
                    Some(Routing::Branch(tag)) => {
                        ctx.decisions.condition.insert(block.id.clone(), tag.clone());
                        for conn in self.workflow.outgoing(&block.id) {
                            if conn.source_handle == tag {
                                ctx.active_path.insert(conn.target.clone());
                            }
                        }
                    }
                    None => {
                        let start_tag = if block.kind == kinds::LOOP {
                            // A zero-iteration loop skips its body entirely;
                            // the loop manager completes it on this boundary.
                            let empty = ctx
                                .loops
                                .get(&block.id)
                                .is_some_and(|l| l.max_iterations == 0);
                            if empty { None } else { Some(EdgeTag::LoopStart) }
                        } else {
                            Some(EdgeTag::Source)
                        };
                        if let Some(tag) = start_tag {
                            for conn in self.workflow.outgoing(&block.id) {
                                if conn.source_handle == tag {
                                    ctx.active_path.insert(conn.target.clone());
                                }
                            }
                        }
                    }
                }

                if let Some(usage) = &handler_output.usage {
                    ctx.trace.add_usage(&usage.model, &usage.cost, &usage.tokens);
                    span.cost = Some(usage.cost);
                    span.tokens = Some(usage.tokens);
                }
                span.output = resolver::redact(&output.to_value());
                ctx.trace.record(span, owner.as_deref());
                ctx.mark_executed(
                    &block.id,
                    BlockState {
                        output,
                        executed: true,
                        duration_ms,
                    },
                );
                Ok(())
            }
            Err(failure) => {
                span.status = SpanStatus::Error;
                let has_error_edge = self
                    .workflow
                    .outgoing(&block.id)
                    .any(|c| c.source_handle == EdgeTag::Error);
                if has_error_edge {
                    warn!(block = %block.id, error = %failure.message, "block failed; taking error branch");
                    for conn in self.workflow.outgoing(&block.id) {
                        if conn.source_handle == EdgeTag::Error {
                            ctx.active_path.insert(conn.target.clone());
                        }
                    }
                    let output = BlockOutput::Failure {
                        error: failure.message,
                    };
                    span.output = output.to_value();
                    ctx.trace.record(span, owner.as_deref());
                    ctx.mark_executed(
                        &block.id,
                        BlockState {
                            output,
                            executed: true,
                            duration_ms,
                        },
                    );
                    Ok(())
                } else {
                    span.output = Value::String(failure.message.clone());
                    ctx.trace.record(span, owner.as_deref());
                    let kind = if failure.timed_out {
                        ErrorKind::BlockTimeout
                    } else {
                        ErrorKind::BlockFailed
                    };
                    Err(EngineError::new(kind, failure.message).with_block(block.id.clone()))
                }
            }
        }
    }
}

async fn deadline_wait(deadline: Option<Instant>) {
    match deadline {
        Some(d) => tokio::time::sleep_until(d).await,
        None => std::future::pending().await,
    }
}

/// Retry/timeout decorator around a handler invocation. One span covers the
/// whole attempt sequence.
async fn invoke_with_retry(
    handler: Arc<dyn BlockHandler>,
    invocation: Invocation,
) -> DispatchResult {
    let policy = RetryPolicy::from_params(&invocation.params);
    let timeout = block_timeout(&invocation.params);
    let started_at = Utc::now();
    let mut attempts = 0u32;

    let outcome = loop {
        attempts += 1;
        match tokio::time::timeout(timeout, handler.invoke(invocation.clone())).await {
            Ok(Ok(output)) => break Ok(output),
            Ok(Err(err)) if err.transient && policy.can_retry(attempts) => {
                debug!(block = %invocation.block_id, attempts, error = %err, "transient failure; retrying");
                tokio::time::sleep(policy.backoff_duration(attempts)).await;
            }
            Ok(Err(err)) => {
                break Err(InvokeFailure {
                    message: err.message,
                    timed_out: false,
                });
            }
            Err(_) if policy.can_retry(attempts) => {
                debug!(block = %invocation.block_id, attempts, "invocation timed out; retrying");
                tokio::time::sleep(policy.backoff_duration(attempts)).await;
            }
            Err(_) => {
                break Err(InvokeFailure {
                    message: format!(
                        "handler timed out after {}ms ({attempts} attempts)",
                        timeout.as_millis()
                    ),
                    timed_out: true,
                });
            }
        }
    };

    DispatchResult {
        outcome,
        started_at,
        ended_at: Utc::now(),
    }
}

/// Materialize forEach items: arrays iterate values, mappings iterate keys in
/// insertion order, strings are parsed as JSON first.
fn materialize_items(value: &Value) -> Result<Vec<Value>, String> {
    match value {
        Value::Array(items) => Ok(items.clone()),
        Value::Object(map) => Ok(map.keys().map(|k| Value::String(k.clone())).collect()),
        Value::String(raw) => {
            let parsed: Value = serde_json::from_str(raw)
                .map_err(|e| format!("forEach items string is not valid JSON: {e}"))?;
            match parsed {
                Value::String(_) => Err("forEach items resolved to a bare string".to_string()),
                other => materialize_items(&other),
            }
        }
        other => Err(format!("forEach items are not iterable: {other}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn materialize_array_and_mapping() {
        assert_eq!(
            materialize_items(&json!([1, 2, 3])).unwrap(),
            vec![json!(1), json!(2), json!(3)]
        );
        let keys = materialize_items(&json!({"a": 1, "b": 2})).unwrap();
        assert_eq!(keys, vec![json!("a"), json!("b")]);
    }

    #[test]
    fn materialize_parses_json_strings() {
        assert_eq!(
            materialize_items(&json!("[true, false]")).unwrap(),
            vec![json!(true), json!(false)]
        );
        assert!(materialize_items(&json!("not json")).is_err());
        assert!(materialize_items(&json!(42)).is_err());
    }
}
