pub mod context;
pub mod engine;
pub mod error;
pub mod executor;
pub mod expr;
pub mod handler;
pub mod model;
pub mod observability;
pub mod resolver;
pub mod serializer;
pub mod trace;

pub use engine::{Engine, RunOptions, RunReport, ValidateOptions};
pub use error::{EngineError, ErrorKind};
pub use executor::RunStatus;
pub use handler::{
    BlockHandler, HandlerError, HandlerOutput, HandlerRegistry, Invocation, KindSchema,
    LoopBinding, ParamRequirement, RetryPolicy, Routing, Usage,
};
pub use model::{
    BlockOutput, Connection, EdgeTag, LoopDescriptor, LoopType, SerializedBlock,
    SerializedWorkflow, Workflow,
};
pub use trace::{CostBreakdown, CostSummary, Span, SpanStatus, TokenUsage};
