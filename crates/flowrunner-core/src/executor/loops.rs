//! Loop manager: detects iteration boundaries after every layer, resets the
//! loop body between iterations, and transitions out of completed loops. It
//! is the only component that closes the cycle a loop region implies; the
//! scheduler itself only ever walks forward edges.

use std::collections::{HashSet, VecDeque};

use serde_json::{Map, Value};
use tracing::debug;

use crate::context::{BlockState, ExecutionContext};
use crate::error::EngineError;
use crate::model::{BlockOutput, EdgeTag, LoopDescriptor, Workflow, kinds};
use crate::resolver;

/// Inspect every entered, uncompleted loop and act on iteration boundaries.
/// Returns true when any loop reset or completed, meaning the scheduler has
/// new work even though the last layer was empty.
pub fn advance(workflow: &Workflow, ctx: &mut ExecutionContext) -> Result<bool, EngineError> {
    let mut progressed = false;
    // Innermost first: an inner loop must settle before its enclosing loop's
    // iteration can be judged.
    for loop_id in workflow.loops_innermost_first() {
        if !ctx.is_executed(loop_id) || ctx.completed_loops.contains(loop_id) {
            continue;
        }
        let Some(runtime) = ctx.loops.get(loop_id) else {
            continue;
        };
        let descriptor = &workflow.loops[loop_id];

        if runtime.max_iterations == 0 {
            complete_loop(workflow, ctx, loop_id);
            progressed = true;
            continue;
        }

        let reachable = reachable_body(workflow, ctx, loop_id, descriptor);
        if !reachable.iter().all(|b| ctx.is_executed(b)) {
            continue;
        }

        let results = aggregate_iteration(workflow, ctx, descriptor);
        let Some(runtime) = ctx.loops.get_mut(loop_id) else {
            continue;
        };
        runtime.iteration_results.push(results.clone());
        let finished_index = runtime.current_iteration;
        let last = runtime.current_iteration + 1 >= runtime.max_iterations;
        ctx.trace
            .close_iteration(loop_id, finished_index, resolver::redact(&results));

        if last {
            complete_loop(workflow, ctx, loop_id);
        } else {
            reset_body(workflow, ctx, loop_id, descriptor);
            if let Some(runtime) = ctx.loops.get_mut(loop_id) {
                runtime.current_iteration += 1;
                debug!(loop_id, iteration = runtime.current_iteration, "loop reset for next iteration");
            }
        }
        progressed = true;
    }
    Ok(progressed)
}

/// Body subset reachable in the current iteration, honoring routing
/// decisions and error-versus-success edges. Unexecuted blocks are reachable
/// but not traversed through; disabled blocks are invisible.
fn reachable_body(
    workflow: &Workflow,
    ctx: &ExecutionContext,
    loop_id: &str,
    descriptor: &LoopDescriptor,
) -> HashSet<String> {
    let body: HashSet<&str> = descriptor.nodes.iter().map(String::as_str).collect();
    let enabled = |id: &str| workflow.block(id).is_some_and(|b| b.enabled);

    let mut reachable: HashSet<String> = HashSet::new();
    let mut queue: VecDeque<String> = workflow
        .outgoing(loop_id)
        .filter(|c| c.source_handle == EdgeTag::LoopStart)
        .filter(|c| body.contains(c.target.as_str()) && enabled(&c.target))
        .map(|c| c.target.clone())
        .collect();

    while let Some(id) = queue.pop_front() {
        if !reachable.insert(id.clone()) {
            continue;
        }
        if !ctx.is_executed(&id) {
            continue;
        }
        let block = match workflow.block(&id) {
            Some(b) => b,
            None => continue,
        };
        let errored = ctx
            .states
            .get(&id)
            .is_some_and(|s| s.output.is_failure());

        let followed: Vec<String> = if errored {
            successors_by_tag(workflow, &id, |tag| *tag == EdgeTag::Error)
        } else if block.kind == kinds::ROUTER {
            match ctx.decisions.router.get(&id) {
                Some(target) => vec![target.clone()],
                None => Vec::new(),
            }
        } else if block.kind == kinds::CONDITION {
            match ctx.decisions.condition.get(&id) {
                Some(selected) => successors_by_tag(workflow, &id, |tag| tag == selected),
                None => Vec::new(),
            }
        } else if block.kind == kinds::LOOP {
            // Inner loop: past it only once it has fully completed.
            if ctx.completed_loops.contains(&id) {
                successors_by_tag(workflow, &id, |tag| *tag == EdgeTag::LoopEnd)
            } else {
                successors_by_tag(workflow, &id, |tag| *tag == EdgeTag::LoopStart)
            }
        } else {
            successors_by_tag(workflow, &id, |tag| *tag == EdgeTag::Source)
        };

        for next in followed {
            if body.contains(next.as_str()) && enabled(&next) {
                queue.push_back(next);
            }
        }
    }
    reachable
}

fn successors_by_tag(
    workflow: &Workflow,
    id: &str,
    matches: impl Fn(&EdgeTag) -> bool,
) -> Vec<String> {
    workflow
        .outgoing(id)
        .filter(|c| matches(&c.source_handle))
        .map(|c| c.target.clone())
        .collect()
}

/// Per-block outputs of the iteration that just finished, keyed by block
/// name (id when unnamed), in stable order.
fn aggregate_iteration(
    workflow: &Workflow,
    ctx: &ExecutionContext,
    descriptor: &LoopDescriptor,
) -> Value {
    let mut nodes: Vec<&String> = descriptor.nodes.iter().collect();
    nodes.sort();
    let mut results = Map::new();
    for node in nodes {
        let Some(state) = ctx.states.get(node).filter(|s| s.executed) else {
            continue;
        };
        let key = workflow
            .block(node)
            .filter(|b| !b.name.trim().is_empty())
            .map(|b| b.name.clone())
            .unwrap_or_else(|| node.clone());
        results.insert(key, state.output.to_value());
    }
    Value::Object(results)
}

/// Clear every body block back to its default state so the next iteration
/// re-executes it, and re-arm the loop block itself. Nested loops inside the
/// body lose their completion state and runtime entirely.
fn reset_body(
    workflow: &Workflow,
    ctx: &mut ExecutionContext,
    loop_id: &str,
    descriptor: &LoopDescriptor,
) {
    for node in &descriptor.nodes {
        ctx.reset_block(node);
        if workflow.loops.contains_key(node) {
            ctx.completed_loops.remove(node);
            ctx.loops.remove(node);
        }
    }
    // The loop block re-executes, but stays on the active path.
    ctx.executed.remove(loop_id);
    ctx.states.remove(loop_id);
    ctx.decisions.clear_block(loop_id);
}

/// Write the aggregated output, mark the loop completed, and activate its
/// exit edges.
fn complete_loop(workflow: &Workflow, ctx: &mut ExecutionContext, loop_id: &str) {
    let Some(runtime) = ctx.loops.get(loop_id) else {
        return;
    };
    let output = BlockOutput::Loop {
        loop_id: loop_id.to_string(),
        max_iterations: runtime.max_iterations,
        loop_type: runtime.loop_type,
        completed: true,
        results: runtime.iteration_results.clone(),
    };
    let projection = output.to_value();

    let duration_ms = ctx
        .states
        .get(loop_id)
        .map(|s| s.duration_ms)
        .unwrap_or(0);
    ctx.states.insert(
        loop_id.to_string(),
        BlockState {
            output,
            executed: true,
            duration_ms,
        },
    );
    ctx.executed.insert(loop_id.to_string());
    ctx.completed_loops.insert(loop_id.to_string());
    ctx.last_output = Some(projection.clone());

    let block_name = workflow
        .block(loop_id)
        .map(|b| b.name.clone())
        .unwrap_or_else(|| loop_id.to_string());
    ctx.trace.close_loop(
        loop_id,
        &block_name,
        resolver::redact(&projection),
        workflow.enclosing_loop(loop_id),
    );

    for conn in workflow.outgoing(loop_id) {
        if conn.source_handle == EdgeTag::LoopEnd {
            ctx.active_path.insert(conn.target.clone());
        }
    }
    debug!(loop_id, "loop completed");
}
