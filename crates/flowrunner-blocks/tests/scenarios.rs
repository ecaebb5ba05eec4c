//! End-to-end scenarios that need real compute handlers: linear function
//! chains, for/forEach loops with reset semantics, and nested loop regions.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::{json, Map, Value};

use flowrunner_blocks::register_builtins;
use flowrunner_core::handler::HandlerRegistry;
use flowrunner_core::model::{
    Connection, EdgeTag, LoopDescriptor, LoopType, SerializedBlock, SerializedWorkflow,
};
use flowrunner_core::{Engine, RunOptions, RunStatus, Span};

fn block(id: &str, name: &str, kind: &str, params: Value) -> SerializedBlock {
    SerializedBlock {
        id: id.into(),
        name: name.into(),
        kind: kind.into(),
        enabled: true,
        params: params.as_object().cloned().unwrap_or_default(),
        position: None,
        extra: Map::new(),
    }
}

fn for_loop(nodes: &[&str], iterations: u32) -> LoopDescriptor {
    LoopDescriptor {
        nodes: nodes.iter().map(|s| s.to_string()).collect(),
        iterations,
        loop_type: LoopType::For,
        for_each_items: None,
    }
}

fn for_each(nodes: &[&str], items: Value) -> LoopDescriptor {
    LoopDescriptor {
        nodes: nodes.iter().map(|s| s.to_string()).collect(),
        iterations: 1,
        loop_type: LoopType::ForEach,
        for_each_items: Some(items),
    }
}

fn workflow(
    blocks: Vec<SerializedBlock>,
    connections: Vec<Connection>,
    loops: BTreeMap<String, LoopDescriptor>,
) -> SerializedWorkflow {
    SerializedWorkflow {
        version: "2.0".into(),
        blocks,
        connections,
        loops,
        extra: Map::new(),
    }
}

fn engine() -> Engine {
    let mut registry = HandlerRegistry::with_control_handlers();
    register_builtins(&mut registry);
    Engine::new(Arc::new(registry))
}

fn find_span<'a>(trace: &'a [Span], block_id: &str) -> &'a Span {
    trace
        .iter()
        .find(|s| s.block_id == block_id)
        .unwrap_or_else(|| panic!("no span for {block_id}"))
}

#[tokio::test]
async fn linear_function_chain_propagates_outputs() {
    let wf = workflow(
        vec![
            block("s", "Start", "starter", json!({})),
            block(
                "a",
                "A",
                "function",
                json!({"outputs": {"n": "{{ Start.input.n }} + 1"}}),
            ),
            block(
                "b",
                "B",
                "function",
                json!({"outputs": {"n": "{{ A.n }} * 2"}}),
            ),
        ],
        vec![Connection::new("s", "a"), Connection::new("a", "b")],
        BTreeMap::new(),
    );
    let report = engine().run(&wf, json!({"n": 3}), RunOptions::default()).await;

    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.output.unwrap(), json!({"n": 8}));
    let ids: Vec<&str> = report.trace.iter().map(|s| s.block_id.as_str()).collect();
    assert_eq!(ids, ["s", "a", "b"]);
}

#[tokio::test]
async fn for_loop_runs_n_iterations_and_aggregates_results() {
    let wf = workflow(
        vec![
            block("s", "Start", "starter", json!({})),
            block("l", "Loop", "loop", json!({})),
            block("a", "A", "function", json!({"outputs": {"v": "loop.index"}})),
            block(
                "p",
                "Post",
                "function",
                json!({"done": "{{ Loop.completed }}", "outputs": {"completed": "done"}}),
            ),
        ],
        vec![
            Connection::new("s", "l"),
            Connection::tagged("l", "a", EdgeTag::LoopStart),
            Connection::new("a", "l"),
            Connection::tagged("l", "p", EdgeTag::LoopEnd),
        ],
        BTreeMap::from([("l".to_string(), for_loop(&["a"], 3))]),
    );
    let report = engine().run(&wf, json!({}), RunOptions::default()).await;

    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.output.unwrap(), json!({"completed": true}));

    let loop_span = report
        .trace
        .iter()
        .find(|s| s.block_id == "l" && s.kind == "loop" && !s.children.is_empty())
        .expect("aggregated loop span");
    assert_eq!(loop_span.children.len(), 3);
    assert_eq!(
        loop_span.output["results"],
        json!([{"A": {"v": 0}}, {"A": {"v": 1}}, {"A": {"v": 2}}])
    );
    assert_eq!(loop_span.output["maxIterations"], 3);
    assert_eq!(loop_span.output["completed"], true);
    // Each iteration nests the loop entry and the body block.
    for (i, iteration) in loop_span.children.iter().enumerate() {
        assert_eq!(iteration.block_name, format!("iteration {i}"));
        assert!(iteration.children.iter().any(|s| s.block_id == "a"));
        assert_eq!(iteration.output["A"]["v"], i);
    }
}

#[tokio::test]
async fn for_each_over_mapping_binds_keys_in_insertion_order() {
    let wf = workflow(
        vec![
            block("s", "Start", "starter", json!({})),
            block("l", "Each", "loop", json!({})),
            block(
                "a",
                "A",
                "function",
                json!({"outputs": {"echo": "loop.currentItem"}}),
            ),
        ],
        vec![
            Connection::new("s", "l"),
            Connection::tagged("l", "a", EdgeTag::LoopStart),
            Connection::new("a", "l"),
        ],
        BTreeMap::from([("l".to_string(), for_each(&["a"], json!({"a": 1, "b": 2})))]),
    );
    let report = engine().run(&wf, json!({}), RunOptions::default()).await;

    assert_eq!(report.status, RunStatus::Completed);
    let loop_span = report
        .trace
        .iter()
        .find(|s| s.block_id == "l" && !s.children.is_empty())
        .expect("aggregated loop span");
    assert_eq!(loop_span.children.len(), 2);
    assert_eq!(
        loop_span.output["results"],
        json!([{"A": {"echo": "a"}}, {"A": {"echo": "b"}}])
    );
}

#[tokio::test]
async fn for_each_items_accept_json_strings() {
    let wf = workflow(
        vec![
            block("s", "Start", "starter", json!({})),
            block("l", "Each", "loop", json!({})),
            block(
                "a",
                "A",
                "function",
                json!({"item": "{{ loop.currentItem }}", "outputs": {"doubled": "item * 2"}}),
            ),
        ],
        vec![
            Connection::new("s", "l"),
            Connection::tagged("l", "a", EdgeTag::LoopStart),
            Connection::new("a", "l"),
        ],
        BTreeMap::from([("l".to_string(), for_each(&["a"], json!("[2, 5]")))]),
    );
    let report = engine().run(&wf, json!({}), RunOptions::default()).await;

    assert_eq!(report.status, RunStatus::Completed);
    let loop_span = find_span(&report.trace, "l");
    assert_eq!(
        loop_span.output["results"],
        json!([{"A": {"doubled": 4}}, {"A": {"doubled": 10}}])
    );
}

#[tokio::test]
async fn empty_for_each_completes_with_no_iterations() {
    let wf = workflow(
        vec![
            block("s", "Start", "starter", json!({})),
            block("l", "Each", "loop", json!({})),
            block("a", "A", "function", json!({"outputs": {"v": "1"}})),
            block(
                "p",
                "Post",
                "function",
                json!({"count": "{{ Each.results }}", "outputs": {"ok": "true"}}),
            ),
        ],
        vec![
            Connection::new("s", "l"),
            Connection::tagged("l", "a", EdgeTag::LoopStart),
            Connection::new("a", "l"),
            Connection::tagged("l", "p", EdgeTag::LoopEnd),
        ],
        BTreeMap::from([("l".to_string(), for_each(&["a"], json!([])))]),
    );
    let report = engine().run(&wf, json!({}), RunOptions::default()).await;

    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.output.unwrap(), json!({"ok": true}));
    let loop_span = find_span(&report.trace, "l");
    assert_eq!(loop_span.output["completed"], true);
    assert_eq!(loop_span.output["results"], json!([]));
    // The body never ran.
    assert!(!report.trace.iter().any(|s| s.block_id == "a"));
}

#[tokio::test]
async fn non_iterable_for_each_items_fail_the_run() {
    let wf = workflow(
        vec![
            block("s", "Start", "starter", json!({})),
            block("l", "Each", "loop", json!({})),
            block("a", "A", "function", json!({"outputs": {"v": "1"}})),
        ],
        vec![
            Connection::new("s", "l"),
            Connection::tagged("l", "a", EdgeTag::LoopStart),
            Connection::new("a", "l"),
        ],
        BTreeMap::from([("l".to_string(), for_each(&["a"], json!(42)))]),
    );
    let report = engine().run(&wf, json!({}), RunOptions::default()).await;

    assert_eq!(report.status, RunStatus::Failed);
    let error = report.error.unwrap();
    assert_eq!(error.kind, flowrunner_core::ErrorKind::ForEachNotIterable);
    assert_eq!(error.block_id.as_deref(), Some("l"));
}

#[tokio::test]
async fn nested_loops_complete_inner_before_outer_advances() {
    let wf = workflow(
        vec![
            block("s", "Start", "starter", json!({})),
            block("lo", "Outer", "loop", json!({})),
            block("li", "Inner", "loop", json!({})),
            block("a", "A", "function", json!({"outputs": {"v": "loop.index"}})),
            block(
                "p",
                "Post",
                "function",
                json!({"done": "{{ Outer.completed }}", "outputs": {"completed": "done"}}),
            ),
        ],
        vec![
            Connection::new("s", "lo"),
            Connection::tagged("lo", "li", EdgeTag::LoopStart),
            Connection::tagged("li", "a", EdgeTag::LoopStart),
            Connection::new("a", "li"),
            Connection::tagged("li", "lo", EdgeTag::LoopEnd),
            Connection::tagged("lo", "p", EdgeTag::LoopEnd),
        ],
        BTreeMap::from([
            ("lo".to_string(), for_loop(&["li", "a"], 2)),
            ("li".to_string(), for_loop(&["a"], 2)),
        ]),
    );
    let report = engine().run(&wf, json!({}), RunOptions::default()).await;

    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.output.unwrap(), json!({"completed": true}));

    let outer = report
        .trace
        .iter()
        .find(|s| s.block_id == "lo" && !s.children.is_empty())
        .expect("outer loop span");
    assert_eq!(outer.children.len(), 2);
    let results = outer.output["results"].as_array().unwrap();
    assert_eq!(results.len(), 2);
    for outer_result in results {
        // Each outer iteration contains a freshly completed inner loop.
        assert_eq!(outer_result["Inner"]["completed"], true);
        assert_eq!(
            outer_result["Inner"]["results"],
            json!([{"A": {"v": 0}}, {"A": {"v": 1}}])
        );
    }
    // Inner loop spans nest inside outer iterations, not at the top level.
    assert!(!report
        .trace
        .iter()
        .any(|s| s.block_id == "li" && !s.children.is_empty()));
    let inner_in_first_iteration = outer.children[0]
        .children
        .iter()
        .find(|s| s.block_id == "li" && s.kind == "loop" && !s.children.is_empty())
        .expect("inner loop span nested in outer iteration");
    assert_eq!(inner_in_first_iteration.children.len(), 2);
}

#[tokio::test]
async fn loop_state_resets_between_iterations() {
    // The body re-reads its own previous output; a stale state would resolve
    // instead of deferring, so the chain proves the reset.
    let wf = workflow(
        vec![
            block("s", "Start", "starter", json!({})),
            block("l", "Loop", "loop", json!({})),
            block(
                "a",
                "A",
                "function",
                json!({"outputs": {"first": "loop.index"}}),
            ),
            block(
                "b",
                "B",
                "function",
                json!({"outputs": {"second": "{{ A.first }} * 10"}}),
            ),
        ],
        vec![
            Connection::new("s", "l"),
            Connection::tagged("l", "a", EdgeTag::LoopStart),
            Connection::new("a", "b"),
            Connection::new("b", "l"),
        ],
        BTreeMap::from([("l".to_string(), for_loop(&["a", "b"], 2))]),
    );
    let report = engine().run(&wf, json!({}), RunOptions::default()).await;

    assert_eq!(report.status, RunStatus::Completed);
    let loop_span = find_span(&report.trace, "l");
    assert_eq!(
        loop_span.output["results"],
        json!([
            {"A": {"first": 0}, "B": {"second": 0}},
            {"A": {"first": 1}, "B": {"second": 10}},
        ])
    );
}
