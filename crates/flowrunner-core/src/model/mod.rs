//! Workflow data model: the wire format (version 2.0) and the compiled
//! executable form the executor walks.

mod output;
pub mod validate;

pub use output::BlockOutput;

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

/// Declared schema version of the serialized workflow format.
pub const FORMAT_VERSION: &str = "2.0";

/// Well-known block kinds. Anything else resolves through the handler registry.
pub mod kinds {
    pub const STARTER: &str = "starter";
    pub const AGENT: &str = "agent";
    pub const FUNCTION: &str = "function";
    pub const API: &str = "api";
    pub const CONDITION: &str = "condition";
    pub const ROUTER: &str = "router";
    pub const LOOP: &str = "loop";
}

/// Tag carried on a connection's `sourceHandle`. Unrecognized tags round-trip
/// through [`EdgeTag::Other`] and are never interpreted by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub enum EdgeTag {
    #[default]
    Source,
    Error,
    ConditionTrue,
    ConditionFalse,
    Condition(String),
    LoopStart,
    LoopEnd,
    Other(String),
}

impl EdgeTag {
    pub fn parse(s: &str) -> Self {
        match s {
            "source" => EdgeTag::Source,
            "error" => EdgeTag::Error,
            "condition-true" => EdgeTag::ConditionTrue,
            "condition-false" => EdgeTag::ConditionFalse,
            "loop-start-source" => EdgeTag::LoopStart,
            "loop-end-source" => EdgeTag::LoopEnd,
            other => {
                if let Some(id) = other.strip_prefix("condition-") {
                    EdgeTag::Condition(id.to_string())
                } else {
                    EdgeTag::Other(other.to_string())
                }
            }
        }
    }

    pub fn as_str(&self) -> std::borrow::Cow<'static, str> {
        match self {
            EdgeTag::Source => "source".into(),
            EdgeTag::Error => "error".into(),
            EdgeTag::ConditionTrue => "condition-true".into(),
            EdgeTag::ConditionFalse => "condition-false".into(),
            EdgeTag::Condition(id) => format!("condition-{id}").into(),
            EdgeTag::LoopStart => "loop-start-source".into(),
            EdgeTag::LoopEnd => "loop-end-source".into(),
            EdgeTag::Other(s) => s.clone().into(),
        }
    }

    fn is_source(&self) -> bool {
        matches!(self, EdgeTag::Source)
    }
}

impl std::fmt::Display for EdgeTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.as_str())
    }
}

impl Serialize for EdgeTag {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.as_str())
    }
}

impl<'de> Deserialize<'de> for EdgeTag {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(EdgeTag::parse(&s))
    }
}

/// A directed edge between two blocks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Connection {
    pub source: String,
    pub target: String,
    #[serde(
        rename = "sourceHandle",
        default,
        skip_serializing_if = "EdgeTag::is_source"
    )]
    pub source_handle: EdgeTag,
}

impl Connection {
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            source_handle: EdgeTag::Source,
        }
    }

    pub fn tagged(
        source: impl Into<String>,
        target: impl Into<String>,
        source_handle: EdgeTag,
    ) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            source_handle,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LoopType {
    For,
    ForEach,
}

/// Side-table entry describing one loop region. The id equals the owning loop
/// block's id; `nodes` is the loop body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoopDescriptor {
    #[serde(default)]
    pub nodes: Vec<String>,
    #[serde(default = "default_iterations")]
    pub iterations: u32,
    #[serde(default = "default_loop_type")]
    pub loop_type: LoopType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub for_each_items: Option<Value>,
}

fn default_iterations() -> u32 {
    1
}

fn default_loop_type() -> LoopType {
    LoopType::For
}

fn default_enabled() -> bool {
    true
}

/// One block in the serialized workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerializedBlock {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub kind: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub params: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<Value>,
    /// Authoring-only fields the engine ignores but preserves on round-trip.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// The wire form of a workflow. Field names are bit-stable across versions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerializedWorkflow {
    pub version: String,
    pub blocks: Vec<SerializedBlock>,
    #[serde(default)]
    pub connections: Vec<Connection>,
    #[serde(default)]
    pub loops: BTreeMap<String, LoopDescriptor>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Executable block: the engine-facing view of a [`SerializedBlock`].
#[derive(Debug, Clone, PartialEq)]
pub struct Block {
    pub id: String,
    pub name: String,
    pub kind: String,
    pub enabled: bool,
    pub params: Map<String, Value>,
}

/// Normalize a user-assigned block name for reference lookup: lowercase with
/// runs of whitespace collapsed to single spaces.
pub fn normalize_name(name: &str) -> String {
    name.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Compiled executable form: blocks by id, forward edges, loops as a side
/// table, plus the name map built once at compile time. Back-edges (body block
/// to its own loop block) are not materialized as connections the scheduler
/// sees; the loop manager closes that cycle by resetting the body.
#[derive(Debug, Clone)]
pub struct Workflow {
    pub blocks: HashMap<String, Block>,
    pub connections: Vec<Connection>,
    pub loops: BTreeMap<String, LoopDescriptor>,
    pub starter: String,
    /// Normalized name -> block id.
    pub names: HashMap<String, String>,
    /// Block id -> innermost enclosing loop id.
    pub loop_of: HashMap<String, String>,
}

impl Workflow {
    pub fn block(&self, id: &str) -> Option<&Block> {
        self.blocks.get(id)
    }

    pub fn outgoing<'a>(&'a self, id: &'a str) -> impl Iterator<Item = &'a Connection> {
        self.connections.iter().filter(move |c| c.source == id)
    }

    pub fn incoming<'a>(&'a self, id: &'a str) -> impl Iterator<Item = &'a Connection> {
        self.connections.iter().filter(move |c| c.target == id)
    }

    /// Resolve a block reference that may be an id or a user-assigned name.
    pub fn resolve_block_ref<'a>(&'a self, reference: &'a str) -> Option<&'a str> {
        if self.blocks.contains_key(reference) {
            return Some(reference);
        }
        self.names
            .get(&normalize_name(reference))
            .map(String::as_str)
    }

    /// True when the edge is the implicit loop back-edge: its source is in the
    /// target loop's body.
    pub fn is_back_edge(&self, conn: &Connection) -> bool {
        self.loops
            .get(&conn.target)
            .is_some_and(|l| l.nodes.iter().any(|n| *n == conn.source))
    }

    /// Innermost enclosing loop of a block, if any.
    pub fn enclosing_loop(&self, block_id: &str) -> Option<&str> {
        self.loop_of.get(block_id).map(String::as_str)
    }

    /// Loop ids ordered innermost-first (by ascending body size).
    pub fn loops_innermost_first(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.loops.keys().map(String::as_str).collect();
        ids.sort_by_key(|id| {
            (
                self.loops.get(*id).map(|l| l.nodes.len()).unwrap_or(0),
                *id,
            )
        });
        ids
    }
}
