//! Conversion between the authoring form (blocks as a mapping, edge list,
//! loop side table) and the executable forms: the wire-stable
//! [`SerializedWorkflow`] and the compiled [`Workflow`] the executor walks.

use std::collections::{BTreeMap, HashMap};

use serde_json::{Map, Value};

use crate::error::{EngineError, ErrorKind};
use crate::handler::{HandlerRegistry, ParamRequirement};
use crate::model::{
    Block, Connection, FORMAT_VERSION, LoopDescriptor, SerializedBlock, SerializedWorkflow,
    Workflow, kinds, normalize_name, validate,
};

/// One block as authored. `extra` carries authoring-only fields that survive
/// a round-trip but mean nothing to the engine.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct AuthoringBlock {
    pub name: String,
    pub kind: String,
    pub enabled: bool,
    pub params: Map<String, Value>,
    pub position: Option<Value>,
    pub extra: Map<String, Value>,
}

/// The authoring form: blocks keyed by id, edges, loops as a side table.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct AuthoringGraph {
    pub blocks: BTreeMap<String, AuthoringBlock>,
    pub edges: Vec<Connection>,
    pub loops: BTreeMap<String, LoopDescriptor>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SerializeOptions {
    /// Validate params whose schema marks them user-only required.
    pub validate_required: bool,
}

/// Convert the authoring form into the wire form. Fails synchronously on
/// unknown kinds and (optionally) missing required fields; performs no I/O.
pub fn serialize(
    graph: &AuthoringGraph,
    registry: &HandlerRegistry,
    options: SerializeOptions,
) -> Result<SerializedWorkflow, EngineError> {
    let mut blocks = Vec::with_capacity(graph.blocks.len());
    for (id, block) in &graph.blocks {
        let Some(schema) = registry.schema(&block.kind) else {
            return Err(EngineError::new(
                ErrorKind::InvalidBlockKind,
                format!("unknown block kind {:?}", block.kind),
            )
            .with_block(id.clone()));
        };
        if options.validate_required {
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
                    return Err(EngineError::new(
                        ErrorKind::MissingRequiredField,
                        format!("block {:?} is missing required field {:?}", id, param.name),
                    )
                    .with_block(id.clone()));
                }
            }
        }
        blocks.push(SerializedBlock {
            id: id.clone(),
            name: block.name.clone(),
            kind: block.kind.clone(),
            enabled: block.enabled,
            params: block.params.clone(),
            position: block.position.clone(),
            extra: block.extra.clone(),
        });
    }

    Ok(SerializedWorkflow {
        version: FORMAT_VERSION.to_string(),
        blocks,
        connections: graph.edges.clone(),
        loops: graph.loops.clone(),
        extra: Map::new(),
    })
}

/// Convert the wire form back to the authoring form. Exact inverse of
/// [`serialize`] on recognized fields; authoring-only extras come back too.
pub fn deserialize(workflow: &SerializedWorkflow) -> AuthoringGraph {
    let blocks = workflow
        .blocks
        .iter()
        .map(|b| {
            (
                b.id.clone(),
                AuthoringBlock {
                    name: b.name.clone(),
                    kind: b.kind.clone(),
                    enabled: b.enabled,
                    params: b.params.clone(),
                    position: b.position.clone(),
                    extra: b.extra.clone(),
                },
            )
        })
        .collect();
    AuthoringGraph {
        blocks,
        edges: workflow.connections.clone(),
        loops: workflow.loops.clone(),
    }
}

/// Compile the wire form into the executable form: validate graph invariants,
/// build the name map and innermost-loop membership.
pub fn compile(workflow: &SerializedWorkflow) -> Result<Workflow, EngineError> {
    let issues = validate::check_graph(workflow);
    if let Some(first) = issues.first() {
        return Err(EngineError::new(
            first.kind,
            format!("{} ({} issue(s) total)", first.message, issues.len()),
        ));
    }

    let mut blocks = HashMap::with_capacity(workflow.blocks.len());
    let mut names = HashMap::new();
    let mut starter = None;
    for block in &workflow.blocks {
        if block.kind == kinds::STARTER {
            starter = Some(block.id.clone());
        }
        if !block.name.trim().is_empty() {
            let normalized = normalize_name(&block.name);
            if let Some(existing) = names.insert(normalized, block.id.clone())
                && existing != block.id
            {
                return Err(EngineError::invalid_workflow(format!(
                    "blocks {:?} and {:?} share the name {:?}",
                    existing, block.id, block.name
                )));
            }
        }
        blocks.insert(
            block.id.clone(),
            Block {
                id: block.id.clone(),
                name: block.name.clone(),
                kind: block.kind.clone(),
                enabled: block.enabled,
                params: block.params.clone(),
            },
        );
    }
    let starter =
        starter.ok_or_else(|| EngineError::invalid_workflow("workflow has no starter block"))?;

    // Innermost enclosing loop: the smallest body containing the block.
    let mut loop_of: HashMap<String, String> = HashMap::new();
    for (loop_id, descriptor) in &workflow.loops {
        for node in &descriptor.nodes {
            match loop_of.get(node) {
                Some(current)
                    if workflow.loops[current].nodes.len() <= descriptor.nodes.len() => {}
                _ => {
                    loop_of.insert(node.clone(), loop_id.clone());
                }
            }
        }
    }

    Ok(Workflow {
        blocks,
        connections: workflow.connections.clone(),
        loops: workflow.loops.clone(),
        starter,
        names,
        loop_of,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{EdgeTag, LoopType};
    use serde_json::json;

    fn registry() -> HandlerRegistry {
        HandlerRegistry::with_control_handlers()
    }

    fn authoring_block(name: &str, kind: &str) -> AuthoringBlock {
        AuthoringBlock {
            name: name.into(),
            kind: kind.into(),
            enabled: true,
            params: Map::new(),
            position: Some(json!({"x": 0, "y": 0})),
            extra: Map::new(),
        }
    }

    fn linear_graph() -> AuthoringGraph {
        let mut graph = AuthoringGraph::default();
        graph
            .blocks
            .insert("s".into(), authoring_block("Start", "starter"));
        graph
            .blocks
            .insert("c".into(), authoring_block("Check", "condition"));
        graph.edges.push(Connection::new("s", "c"));
        graph
    }

    #[test]
    fn round_trip_is_identity_on_recognized_fields() {
        let mut graph = linear_graph();
        graph
            .blocks
            .get_mut("c")
            .unwrap()
            .extra
            .insert("uiColor".into(), json!("blue"));
        let wf = serialize(&graph, &registry(), SerializeOptions::default()).unwrap();
        let back = deserialize(&wf);
        assert_eq!(back, graph);
    }

    #[test]
    fn unknown_kind_fails_serialize() {
        let mut graph = linear_graph();
        graph
            .blocks
            .insert("x".into(), authoring_block("X", "teleport"));
        let err = serialize(&graph, &registry(), SerializeOptions::default()).unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidBlockKind);
        assert_eq!(err.block_id.as_deref(), Some("x"));
    }

    #[test]
    fn missing_user_only_required_field_fails_when_validated() {
        let mut graph = linear_graph();
        // Router's expression is user-only required.
        graph
            .blocks
            .insert("r".into(), authoring_block("Route", "router"));
        graph.edges.push(Connection::new("c", "r"));

        let relaxed = serialize(&graph, &registry(), SerializeOptions::default());
        assert!(relaxed.is_ok());

        let err = serialize(
            &graph,
            &registry(),
            SerializeOptions {
                validate_required: true,
            },
        )
        .unwrap_err();
        assert_eq!(err.kind, ErrorKind::MissingRequiredField);
    }

    #[test]
    fn compile_builds_name_map_and_loop_membership() {
        let mut graph = linear_graph();
        graph
            .blocks
            .insert("l".into(), authoring_block("Outer  Loop", "loop"));
        graph
            .blocks
            .insert("a".into(), authoring_block("Body", "function"));
        graph.edges.push(Connection::new("c", "l"));
        graph
            .edges
            .push(Connection::tagged("l", "a", EdgeTag::LoopStart));
        graph.loops.insert(
            "l".into(),
            LoopDescriptor {
                nodes: vec!["a".into()],
                iterations: 2,
                loop_type: LoopType::For,
                for_each_items: None,
            },
        );
        // "function" is not a control handler; register a schema for it.
        let mut registry = registry();
        registry.register(
            crate::handler::KindSchema::new("function"),
            crate::handler::builtin::StarterHandler,
        );
        let wf = serialize(&graph, &registry, SerializeOptions::default()).unwrap();
        let compiled = compile(&wf).unwrap();
        assert_eq!(compiled.starter, "s");
        assert_eq!(compiled.names["outer loop"], "l");
        assert_eq!(compiled.enclosing_loop("a"), Some("l"));
        assert_eq!(compiled.enclosing_loop("c"), None);
    }

    #[test]
    fn compile_rejects_duplicate_names() {
        let mut graph = linear_graph();
        graph
            .blocks
            .insert("c2".into(), authoring_block("  check ", "condition"));
        graph.edges.push(Connection::new("s", "c2"));
        let wf = serialize(&graph, &registry(), SerializeOptions::default()).unwrap();
        let err = compile(&wf).unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidWorkflow);
        assert!(err.message.contains("share the name"));
    }
}
