//! Control-flow handlers that ship with the engine: starter, condition,
//! router, loop. Compute and I/O handlers (function, api, agent) live in the
//! blocks crate; everything else arrives through external registration.

use async_trait::async_trait;
use serde_json::Value;
#[cfg(test)]
use serde_json::Map;
use tracing::debug;

use crate::expr;
use crate::model::{BlockOutput, EdgeTag, kinds};

use super::{
    BlockHandler, HandlerError, HandlerOutput, HandlerRegistry, Invocation, KindSchema,
    ParamRequirement, Routing,
};

/// Register starter/condition/router/loop into `registry`.
pub fn register_control_handlers(registry: &mut HandlerRegistry) {
    registry.register(KindSchema::new(kinds::STARTER), StarterHandler);
    registry.register(
        KindSchema::new(kinds::CONDITION)
            .param("condition", ParamRequirement::Optional)
            .param("conditions", ParamRequirement::Optional),
        ConditionHandler,
    );
    registry.register(
        KindSchema::new(kinds::ROUTER).param("expression", ParamRequirement::UserOnly),
        RouterHandler,
    );
    registry.register(KindSchema::new(kinds::LOOP), LoopHandler);
}

/// Variables visible to condition/router expressions: the run input under
/// `input.*` plus every resolved param under its own name.
fn expression_scope(invocation: &Invocation, skip: &[&str]) -> Vec<(String, Value)> {
    let mut vars = Vec::new();
    expr::flatten("input", &invocation.run_input, &mut vars);
    for (name, value) in &invocation.params {
        if !skip.contains(&name.as_str()) {
            expr::flatten(name, value, &mut vars);
        }
    }
    vars
}

/// Passes the workflow's initial input straight through.
pub struct StarterHandler;

#[async_trait]
impl BlockHandler for StarterHandler {
    async fn invoke(&self, invocation: Invocation) -> Result<HandlerOutput, HandlerError> {
        Ok(HandlerOutput::output(BlockOutput::Starter {
            input: invocation.run_input,
        }))
    }
}

/// Evaluates a Boolean expression (or an ordered branch list) and commits a
/// branch tag.
pub struct ConditionHandler;

#[async_trait]
impl BlockHandler for ConditionHandler {
    async fn invoke(&self, invocation: Invocation) -> Result<HandlerOutput, HandlerError> {
        if let Some(branches) = invocation.params.get("conditions").and_then(Value::as_array) {
            let vars = expression_scope(&invocation, &["conditions"]);
            for branch in branches {
                let id = branch
                    .get("id")
                    .and_then(Value::as_str)
                    .ok_or_else(|| HandlerError::permanent("condition branch missing id"))?;
                let expression = branch
                    .get("expression")
                    .and_then(Value::as_str)
                    .ok_or_else(|| HandlerError::permanent("condition branch missing expression"))?;
                if expr::evaluate_bool(expression, &vars).map_err(HandlerError::permanent)? {
                    return Ok(branch_output(EdgeTag::Condition(id.to_string()), Value::Bool(true)));
                }
            }
            return Ok(branch_output(
                EdgeTag::Condition("else".to_string()),
                Value::Bool(false),
            ));
        }

        let expression = invocation
            .params
            .get("condition")
            .and_then(Value::as_str)
            .ok_or_else(|| HandlerError::permanent("condition block requires a condition param"))?;
        let vars = expression_scope(&invocation, &["condition"]);
        let truth = expr::evaluate_bool(expression, &vars).map_err(HandlerError::permanent)?;
        debug!(block = %invocation.block_id, %expression, result = truth, "condition evaluated");
        let tag = if truth {
            EdgeTag::ConditionTrue
        } else {
            EdgeTag::ConditionFalse
        };
        Ok(branch_output(tag, Value::Bool(truth)))
    }
}

fn branch_output(tag: EdgeTag, evaluated: Value) -> HandlerOutput {
    HandlerOutput::output(BlockOutput::Condition {
        selected: tag.as_str().into_owned(),
        evaluated,
    })
    .with_routing(Routing::Branch(tag))
}

/// Evaluates an expression that yields the target block for the next hop.
/// A bare name that is not a bound variable is taken as a literal target.
pub struct RouterHandler;

#[async_trait]
impl BlockHandler for RouterHandler {
    async fn invoke(&self, invocation: Invocation) -> Result<HandlerOutput, HandlerError> {
        let expression = invocation
            .params
            .get("expression")
            .and_then(Value::as_str)
            .ok_or_else(|| HandlerError::permanent("router block requires an expression param"))?;
        let vars = expression_scope(&invocation, &["expression"]);
        let target = match expr::evaluate(expression, &vars) {
            Ok(Value::String(s)) if !s.is_empty() => s,
            Ok(other) => {
                return Err(HandlerError::permanent(format!(
                    "router expression yielded non-target value {other}"
                )));
            }
            Err(_) if is_bare_name(expression) => expression.trim().to_string(),
            Err(e) => return Err(HandlerError::permanent(e)),
        };
        debug!(block = %invocation.block_id, %target, "router decided");
        Ok(
            HandlerOutput::output(BlockOutput::Router {
                target: target.clone(),
            })
            .with_routing(Routing::Target(target)),
        )
    }
}

fn is_bare_name(expression: &str) -> bool {
    let trimmed = expression.trim();
    !trimmed.is_empty()
        && trimmed
            .chars()
            .all(|c| c.is_alphanumeric() || c == '_' || c == '-' || c == ' ')
}

/// Marks loop entry: echoes the engine-established iteration binding. The
/// engine activates the loop-start edges after this runs; completion and exit
/// edges belong to the loop manager.
pub struct LoopHandler;

#[async_trait]
impl BlockHandler for LoopHandler {
    async fn invoke(&self, invocation: Invocation) -> Result<HandlerOutput, HandlerError> {
        let binding = invocation.loop_binding.as_ref();
        Ok(HandlerOutput::output(BlockOutput::LoopIteration {
            loop_id: binding
                .map(|b| b.loop_id.clone())
                .unwrap_or_else(|| invocation.block_id.clone()),
            index: binding.map(|b| b.index).unwrap_or(0),
            current_item: binding.and_then(|b| b.current_item.clone()),
        }))
    }
}
