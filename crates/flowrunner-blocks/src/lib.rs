//! Built-in compute and I/O handlers for the flowrunner engine. The engine
//! crate ships the control handlers (starter, condition, router, loop); this
//! crate adds the kinds that need an expression evaluator or a network stack.

pub mod agent;
pub mod api;
pub mod function;

use std::sync::Arc;

use flowrunner_core::handler::HandlerRegistry;

pub use agent::{AgentHandler, ChatModel, ChatReply};
pub use api::{ApiHandler, ReqwestRequester, Requester};
pub use function::FunctionHandler;

/// Register function and api with their defaults. Agent needs a chat
/// delegate, so it registers separately via [`register_agent`].
pub fn register_builtins(registry: &mut HandlerRegistry) {
    registry.register(function::schema(), FunctionHandler);
    registry.register(
        api::schema(),
        ApiHandler::new(Arc::new(ReqwestRequester::new())),
    );
}

/// Register the api block with a custom transport.
pub fn register_api(registry: &mut HandlerRegistry, requester: Arc<dyn Requester>) {
    registry.register(api::schema(), ApiHandler::new(requester));
}

/// Register the agent block around the embedder's chat-completion client.
pub fn register_agent(registry: &mut HandlerRegistry, delegate: Arc<dyn ChatModel>) {
    registry.register(agent::schema(), AgentHandler::new(delegate));
}
