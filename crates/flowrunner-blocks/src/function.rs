//! Function block: evaluates sandboxed expressions over the block's resolved
//! params. Either a single `expression` param, or an `outputs` mapping of
//! field name to expression for shaped results.

use async_trait::async_trait;
use serde_json::{Map, Value};

use flowrunner_core::expr;
use flowrunner_core::handler::{
    BlockHandler, HandlerError, HandlerOutput, Invocation, KindSchema, ParamRequirement,
};
use flowrunner_core::model::BlockOutput;

pub struct FunctionHandler;

pub fn schema() -> KindSchema {
    KindSchema::new("function")
        .param("expression", ParamRequirement::UserOrLlm)
        .param("outputs", ParamRequirement::UserOrLlm)
}

/// Variables visible to function expressions: the run input under `input.*`,
/// the loop binding under `loop.*`, and every other resolved param.
fn scope(invocation: &Invocation) -> Vec<(String, Value)> {
    let mut vars = Vec::new();
    expr::flatten("input", &invocation.run_input, &mut vars);
    if let Some(binding) = &invocation.loop_binding {
        vars.push(("loop.index".to_string(), Value::Number(binding.index.into())));
        if let Some(item) = &binding.current_item {
            expr::flatten("loop.currentItem", item, &mut vars);
        }
    }
    for (name, value) in &invocation.params {
        if name != "expression" && name != "outputs" {
            expr::flatten(name, value, &mut vars);
        }
    }
    vars
}

#[async_trait]
impl BlockHandler for FunctionHandler {
    async fn invoke(&self, invocation: Invocation) -> Result<HandlerOutput, HandlerError> {
        let vars = scope(&invocation);

        if let Some(outputs) = invocation.params.get("outputs").and_then(Value::as_object) {
            let mut result = Map::new();
            for (field, spec) in outputs {
                let value = match spec {
                    Value::String(expression) => {
                        expr::evaluate(expression, &vars).map_err(HandlerError::permanent)?
                    }
                    literal => literal.clone(),
                };
                result.insert(field.clone(), value);
            }
            return Ok(HandlerOutput::output(BlockOutput::Function {
                result: Value::Object(result),
            }));
        }

        let expression = invocation
            .params
            .get("expression")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                HandlerError::permanent("function block requires an expression or outputs param")
            })?;
        let result = expr::evaluate(expression, &vars).map_err(HandlerError::permanent)?;
        Ok(HandlerOutput::output(BlockOutput::Function { result }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowrunner_core::handler::LoopBinding;
    use serde_json::json;
    use std::collections::HashMap;
    use tokio_util::sync::CancellationToken;

    fn invocation(params: Map<String, Value>, run_input: Value) -> Invocation {
        Invocation {
            block_id: "f1".into(),
            block_name: "F1".into(),
            kind: "function".into(),
            params,
            run_input,
            loop_binding: None,
            outputs: HashMap::new(),
            cancel: CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn single_expression_yields_result() {
        let mut params = Map::new();
        params.insert("expression".into(), json!("input.n + 1"));
        let out = FunctionHandler
            .invoke(invocation(params, json!({"n": 3})))
            .await
            .unwrap();
        assert_eq!(out.output.to_value(), json!(4));
    }

    #[tokio::test]
    async fn outputs_map_builds_shaped_result() {
        let mut params = Map::new();
        params.insert(
            "outputs".into(),
            json!({"n": "input.n * 2", "label": "\"doubled\"", "fixed": 7}),
        );
        let out = FunctionHandler
            .invoke(invocation(params, json!({"n": 4})))
            .await
            .unwrap();
        let v = out.output.to_value();
        assert_eq!(v, json!({"n": 8, "label": "doubled", "fixed": 7}));
    }

    #[tokio::test]
    async fn loop_binding_is_visible() {
        let mut params = Map::new();
        params.insert("outputs".into(), json!({"v": "loop.index"}));
        let mut inv = invocation(params, Value::Null);
        inv.loop_binding = Some(LoopBinding {
            loop_id: "l".into(),
            index: 2,
            current_item: None,
        });
        let out = FunctionHandler.invoke(inv).await.unwrap();
        assert_eq!(out.output.to_value(), json!({"v": 2}));
    }

    #[tokio::test]
    async fn bad_expression_is_permanent_error() {
        let mut params = Map::new();
        params.insert("expression".into(), json!("nope +"));
        let err = FunctionHandler
            .invoke(invocation(params, Value::Null))
            .await
            .unwrap_err();
        assert!(!err.transient);
    }
}
