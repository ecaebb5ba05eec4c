//! # Handler SDK
//!
//! Handlers are the units of work the engine invokes for each block kind.
//! A handler implements [`BlockHandler`] and is registered under its kind in
//! the [`HandlerRegistry`] once at process start; the engine reads the
//! registry as immutable during a run.
//!
//! ## Contract
//!
//! - A handler receives an [`Invocation`]: the resolved parameter mapping plus
//!   an immutable, value-copied view of the run (prior outputs by id and name,
//!   the run input, the current loop binding).
//! - The return value is the handler's only channel back to the engine.
//!   Routing blocks return a [`Routing`] alongside their output; everything
//!   else returns output alone.
//! - Failures are [`HandlerError`]s carrying a `transient` classification.
//!   Only transient failures are retried; retry and timeout wrapping happen
//!   in the engine, never inside handlers.

pub mod builtin;
pub mod policy;

pub use policy::RetryPolicy;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::model::{BlockOutput, EdgeTag};

/// Loop variables bound for blocks executing inside a loop region.
#[derive(Debug, Clone, PartialEq)]
pub struct LoopBinding {
    pub loop_id: String,
    pub index: u32,
    pub current_item: Option<Value>,
}

/// Everything a handler invocation sees. Values are copies; handlers cannot
/// reach the live execution context.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub block_id: String,
    pub block_name: String,
    pub kind: String,
    /// Parameter mapping after template resolution.
    pub params: Map<String, Value>,
    /// The workflow's initial input.
    pub run_input: Value,
    /// Innermost loop binding, when executing inside a loop body.
    pub loop_binding: Option<LoopBinding>,
    /// Prior block outputs, keyed by block id and by normalized name.
    pub outputs: HashMap<String, Value>,
    /// Fired when the run is cancelled; long handlers should observe it.
    pub cancel: CancellationToken,
}

/// Handler failure with its retry classification.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct HandlerError {
    pub message: String,
    pub transient: bool,
}

impl HandlerError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            transient: true,
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            transient: false,
        }
    }
}

/// Control-flow decision returned by router and condition handlers.
#[derive(Debug, Clone, PartialEq)]
pub enum Routing {
    /// Router: the single target block (id or user-assigned name) to activate.
    Target(String),
    /// Condition: the branch tag whose edges activate.
    Branch(EdgeTag),
}

/// Per-invocation model usage, aggregated into the run's cost summary.
#[derive(Debug, Clone, PartialEq)]
pub struct Usage {
    pub model: String,
    pub cost: crate::trace::CostBreakdown,
    pub tokens: crate::trace::TokenUsage,
}

/// What a handler returns on success.
#[derive(Debug, Clone)]
pub struct HandlerOutput {
    pub output: BlockOutput,
    pub routing: Option<Routing>,
    pub usage: Option<Usage>,
}

impl HandlerOutput {
    pub fn output(output: BlockOutput) -> Self {
        Self {
            output,
            routing: None,
            usage: None,
        }
    }

    pub fn with_routing(mut self, routing: Routing) -> Self {
        self.routing = Some(routing);
        self
    }

    pub fn with_usage(mut self, usage: Usage) -> Self {
        self.usage = Some(usage);
        self
    }
}

/// Async block capability. Implementations must be cheap to share.
#[async_trait]
pub trait BlockHandler: Send + Sync {
    async fn invoke(&self, invocation: Invocation) -> Result<HandlerOutput, HandlerError>;
}

/// How a parameter may be supplied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamRequirement {
    /// Must be present in the authored params; validated at serialize time.
    UserOnly,
    /// May be filled at runtime by an upstream block; never validated early.
    UserOrLlm,
    Optional,
}

#[derive(Debug, Clone)]
pub struct ParamSchema {
    pub name: String,
    pub requirement: ParamRequirement,
}

impl ParamSchema {
    pub fn new(name: impl Into<String>, requirement: ParamRequirement) -> Self {
        Self {
            name: name.into(),
            requirement,
        }
    }
}

/// Declared shape of a block kind, used by serialize-time validation.
#[derive(Debug, Clone)]
pub struct KindSchema {
    pub kind: String,
    pub params: Vec<ParamSchema>,
}

impl KindSchema {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            params: Vec::new(),
        }
    }

    pub fn param(mut self, name: impl Into<String>, requirement: ParamRequirement) -> Self {
        self.params.push(ParamSchema::new(name, requirement));
        self
    }
}

struct RegistryEntry {
    handler: Arc<dyn BlockHandler>,
    schema: KindSchema,
}

/// Kind -> handler capability. Tool kinds register through the same door as
/// the built-ins.
#[derive(Default)]
pub struct HandlerRegistry {
    entries: HashMap<String, RegistryEntry>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the engine's control handlers (starter,
    /// condition, router, loop).
    pub fn with_control_handlers() -> Self {
        let mut registry = Self::new();
        builtin::register_control_handlers(&mut registry);
        registry
    }

    pub fn register(&mut self, schema: KindSchema, handler: impl BlockHandler + 'static) {
        self.register_arc(schema, Arc::new(handler));
    }

    pub fn register_arc(&mut self, schema: KindSchema, handler: Arc<dyn BlockHandler>) {
        self.entries
            .insert(schema.kind.clone(), RegistryEntry { handler, schema });
    }

    pub fn lookup(&self, kind: &str) -> Option<Arc<dyn BlockHandler>> {
        self.entries.get(kind).map(|e| Arc::clone(&e.handler))
    }

    pub fn schema(&self, kind: &str) -> Option<&KindSchema> {
        self.entries.get(kind).map(|e| &e.schema)
    }

    pub fn knows(&self, kind: &str) -> bool {
        self.entries.contains_key(kind)
    }

    pub fn kinds(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }
}
