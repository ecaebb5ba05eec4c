//! Agent block: delegates to a caller-supplied chat-completion capability.
//! The engine never talks to a model vendor directly; embedders register an
//! [`AgentHandler`] around their own client and the block reports token and
//! cost usage into the run trace.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use flowrunner_core::handler::{
    BlockHandler, HandlerError, HandlerOutput, Invocation, KindSchema, ParamRequirement, Usage,
};
use flowrunner_core::model::BlockOutput;
use flowrunner_core::trace::{CostBreakdown, TokenUsage};

/// One completed chat turn from the delegate.
#[derive(Debug, Clone)]
pub struct ChatReply {
    pub content: Value,
    pub model: String,
    pub tokens: TokenUsage,
    pub cost: CostBreakdown,
}

/// Chat-completion capability. Classify failures via [`HandlerError`] so the
/// engine's retry policy applies (rate limits and timeouts are transient).
#[async_trait]
pub trait ChatModel: Send + Sync {
    async fn complete(&self, prompt: &str, model: Option<&str>) -> Result<ChatReply, HandlerError>;
}

pub struct AgentHandler {
    delegate: Arc<dyn ChatModel>,
}

impl AgentHandler {
    pub fn new(delegate: Arc<dyn ChatModel>) -> Self {
        Self { delegate }
    }
}

pub fn schema() -> KindSchema {
    KindSchema::new("agent")
        .param("prompt", ParamRequirement::UserOrLlm)
        .param("model", ParamRequirement::Optional)
}

#[async_trait]
impl BlockHandler for AgentHandler {
    async fn invoke(&self, invocation: Invocation) -> Result<HandlerOutput, HandlerError> {
        let prompt = invocation
            .params
            .get("prompt")
            .and_then(Value::as_str)
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| HandlerError::permanent("agent block requires a prompt param"))?;
        let model = invocation.params.get("model").and_then(Value::as_str);

        let reply = self.delegate.complete(prompt, model).await?;
        let usage = Usage {
            model: reply.model.clone(),
            cost: reply.cost,
            tokens: reply.tokens,
        };
        Ok(HandlerOutput::output(BlockOutput::Agent {
            content: reply.content,
            model: Some(reply.model),
        })
        .with_usage(usage))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Map};
    use std::collections::HashMap;
    use tokio_util::sync::CancellationToken;

    struct CannedModel;

    #[async_trait]
    impl ChatModel for CannedModel {
        async fn complete(
            &self,
            prompt: &str,
            model: Option<&str>,
        ) -> Result<ChatReply, HandlerError> {
            Ok(ChatReply {
                content: json!(format!("echo: {prompt}")),
                model: model.unwrap_or("test-model").to_string(),
                tokens: TokenUsage {
                    input: 10,
                    output: 5,
                    total: 15,
                },
                cost: CostBreakdown {
                    input: 0.001,
                    output: 0.002,
                    total: 0.003,
                },
            })
        }
    }

    #[tokio::test]
    async fn agent_reports_usage() {
        let handler = AgentHandler::new(Arc::new(CannedModel));
        let mut params = Map::new();
        params.insert("prompt".into(), json!("summarize"));
        let out = handler
            .invoke(Invocation {
                block_id: "g1".into(),
                block_name: "G1".into(),
                kind: "agent".into(),
                params,
                run_input: Value::Null,
                loop_binding: None,
                outputs: HashMap::new(),
                cancel: CancellationToken::new(),
            })
            .await
            .unwrap();
        assert_eq!(out.output.to_value()["content"], "echo: summarize");
        let usage = out.usage.unwrap();
        assert_eq!(usage.tokens.total, 15);
        assert!((usage.cost.total - 0.003).abs() < 1e-9);
    }

    #[tokio::test]
    async fn missing_prompt_is_permanent() {
        let handler = AgentHandler::new(Arc::new(CannedModel));
        let err = handler
            .invoke(Invocation {
                block_id: "g1".into(),
                block_name: "G1".into(),
                kind: "agent".into(),
                params: Map::new(),
                run_input: Value::Null,
                loop_binding: None,
                outputs: HashMap::new(),
                cancel: CancellationToken::new(),
            })
            .await
            .unwrap_err();
        assert!(!err.transient);
    }
}
