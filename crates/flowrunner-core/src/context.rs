//! Per-run execution state. One context exists per run, owned exclusively by
//! the executor; handlers only ever see value-copies of it.

use std::collections::{HashMap, HashSet};

use serde_json::Value;

use crate::handler::LoopBinding;
use crate::model::{BlockOutput, EdgeTag, LoopType};
use crate::trace::TraceCollector;

/// Recorded result of one executed block.
#[derive(Debug, Clone)]
pub struct BlockState {
    pub output: BlockOutput,
    pub executed: bool,
    pub duration_ms: u64,
}

/// Routing decisions committed so far in the current iteration.
#[derive(Debug, Clone, Default)]
pub struct Decisions {
    /// Router block id -> chosen target block id.
    pub router: HashMap<String, String>,
    /// Condition block id -> selected branch tag.
    pub condition: HashMap<String, EdgeTag>,
}

impl Decisions {
    pub fn clear_block(&mut self, block_id: &str) {
        self.router.remove(block_id);
        self.condition.remove(block_id);
    }
}

/// Live state of one loop region.
#[derive(Debug, Clone)]
pub struct LoopRuntime {
    pub loop_type: LoopType,
    pub max_iterations: u32,
    /// Materialized sequence for forEach loops.
    pub items: Option<Vec<Value>>,
    /// Completed iterations so far; also the zero-based index of the current one.
    pub current_iteration: u32,
    /// Aggregated per-block outputs, one entry per completed iteration.
    pub iteration_results: Vec<Value>,
}

impl LoopRuntime {
    pub fn binding(&self, loop_id: &str) -> LoopBinding {
        LoopBinding {
            loop_id: loop_id.to_string(),
            index: self.current_iteration,
            current_item: self
                .items
                .as_ref()
                .and_then(|items| items.get(self.current_iteration as usize).cloned()),
        }
    }
}

/// Engine-private state for a single run.
pub struct ExecutionContext {
    pub run_input: Value,
    pub env: HashMap<String, String>,
    /// Block id -> recorded state. Written only by the executor's post-layer
    /// commit and by loop reset.
    pub states: HashMap<String, BlockState>,
    pub executed: HashSet<String>,
    pub active_path: HashSet<String>,
    pub loops: HashMap<String, LoopRuntime>,
    pub completed_loops: HashSet<String>,
    pub decisions: Decisions,
    pub trace: TraceCollector,
    /// Projection of the most recently committed block output.
    pub last_output: Option<Value>,
}

impl ExecutionContext {
    pub fn new(run_input: Value, env: HashMap<String, String>) -> Self {
        Self {
            run_input,
            env,
            states: HashMap::new(),
            executed: HashSet::new(),
            active_path: HashSet::new(),
            loops: HashMap::new(),
            completed_loops: HashSet::new(),
            decisions: Decisions::default(),
            trace: TraceCollector::new(),
            last_output: None,
        }
    }

    /// Output projections of every executed block, for resolver lookups.
    pub fn output_projections(&self) -> HashMap<String, Value> {
        self.states
            .iter()
            .filter(|(_, s)| s.executed)
            .map(|(id, s)| (id.clone(), s.output.to_value()))
            .collect()
    }

    pub fn is_executed(&self, block_id: &str) -> bool {
        self.executed.contains(block_id)
    }

    pub fn mark_executed(&mut self, block_id: &str, state: BlockState) {
        self.executed.insert(block_id.to_string());
        self.last_output = Some(state.output.to_value());
        self.states.insert(block_id.to_string(), state);
    }

    /// Clear one block back to its pre-execution state (loop reset).
    pub fn reset_block(&mut self, block_id: &str) {
        self.executed.remove(block_id);
        self.states.remove(block_id);
        self.active_path.remove(block_id);
        self.decisions.clear_block(block_id);
    }

    /// Current iteration index per loop, zero-based.
    pub fn loop_iterations(&self) -> HashMap<String, u32> {
        self.loops
            .iter()
            .map(|(id, l)| (id.clone(), l.current_iteration))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn reset_block_clears_all_traces_of_execution() {
        let mut ctx = ExecutionContext::new(Value::Null, HashMap::new());
        ctx.active_path.insert("a".into());
        ctx.mark_executed(
            "a",
            BlockState {
                output: BlockOutput::Function { result: json!(1) },
                executed: true,
                duration_ms: 5,
            },
        );
        ctx.decisions.router.insert("a".into(), "b".into());

        ctx.reset_block("a");
        assert!(!ctx.is_executed("a"));
        assert!(ctx.states.get("a").is_none());
        assert!(!ctx.active_path.contains("a"));
        assert!(ctx.decisions.router.get("a").is_none());
    }

    #[test]
    fn loop_runtime_binding_tracks_current_item() {
        let runtime = LoopRuntime {
            loop_type: LoopType::ForEach,
            max_iterations: 2,
            items: Some(vec![json!("a"), json!("b")]),
            current_iteration: 1,
            iteration_results: vec![json!({})],
        };
        let binding = runtime.binding("l1");
        assert_eq!(binding.index, 1);
        assert_eq!(binding.current_item, Some(json!("b")));
    }

    #[test]
    fn output_projections_only_include_executed_blocks() {
        let mut ctx = ExecutionContext::new(Value::Null, HashMap::new());
        ctx.mark_executed(
            "a",
            BlockState {
                output: BlockOutput::Function { result: json!({"v": 1}) },
                executed: true,
                duration_ms: 1,
            },
        );
        let projections = ctx.output_projections();
        assert_eq!(projections["a"]["v"], 1);
        assert!(!projections.contains_key("b"));
    }
}
