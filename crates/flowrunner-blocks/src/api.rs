//! Api block: outbound HTTP call. The transport lives behind [`Requester`]
//! so tests (and embedders with their own HTTP stack) can swap it; pass your
//! requester when registering.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::debug;

use flowrunner_core::handler::{
    BlockHandler, HandlerError, HandlerOutput, Invocation, KindSchema, ParamRequirement,
};
use flowrunner_core::model::BlockOutput;

/// Transport failure with its retry classification already decided.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct RequestError {
    pub message: String,
    pub transient: bool,
}

#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: Map<String, Value>,
    pub body: String,
}

/// HTTP transport abstraction. Implement and pass when registering.
#[async_trait]
pub trait Requester: Send + Sync {
    async fn send(
        &self,
        method: &str,
        url: &str,
        headers: &Map<String, Value>,
        body: Option<&Value>,
        timeout: Duration,
    ) -> Result<HttpResponse, RequestError>;
}

/// Default transport on the shared reqwest client.
pub struct ReqwestRequester {
    client: reqwest::Client,
}

impl ReqwestRequester {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for ReqwestRequester {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Requester for ReqwestRequester {
    async fn send(
        &self,
        method: &str,
        url: &str,
        headers: &Map<String, Value>,
        body: Option<&Value>,
        timeout: Duration,
    ) -> Result<HttpResponse, RequestError> {
        let method = reqwest::Method::from_bytes(method.as_bytes()).map_err(|_| RequestError {
            message: format!("invalid http method {method:?}"),
            transient: false,
        })?;
        let mut request = self.client.request(method, url).timeout(timeout);
        for (name, value) in headers {
            if let Some(v) = value.as_str() {
                request = request.header(name, v);
            }
        }
        if let Some(body) = body {
            request = match body {
                Value::String(raw) => request.body(raw.clone()),
                other => request.json(other),
            };
        }
        let response = request.send().await.map_err(|e| RequestError {
            // Connect/timeout problems are worth another attempt.
            transient: e.is_timeout() || e.is_connect() || e.is_request(),
            message: format!("request to {url} failed: {e}"),
        })?;

        let status = response.status().as_u16();
        let mut header_map = Map::new();
        for (name, value) in response.headers() {
            if let Ok(v) = value.to_str() {
                header_map.insert(name.to_string(), Value::String(v.to_string()));
            }
        }
        let body = response.text().await.map_err(|e| RequestError {
            message: format!("reading body from {url} failed: {e}"),
            transient: true,
        })?;
        Ok(HttpResponse {
            status,
            headers: header_map,
            body,
        })
    }
}

pub struct ApiHandler {
    requester: Arc<dyn Requester>,
}

impl ApiHandler {
    pub fn new(requester: Arc<dyn Requester>) -> Self {
        Self { requester }
    }
}

pub fn schema() -> KindSchema {
    KindSchema::new("api")
        .param("url", ParamRequirement::UserOnly)
        .param("method", ParamRequirement::Optional)
        .param("headers", ParamRequirement::UserOrLlm)
        .param("body", ParamRequirement::UserOrLlm)
}

#[async_trait]
impl BlockHandler for ApiHandler {
    async fn invoke(&self, invocation: Invocation) -> Result<HandlerOutput, HandlerError> {
        let url = invocation
            .params
            .get("url")
            .and_then(Value::as_str)
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| HandlerError::permanent("api block requires a url param"))?;
        let method = invocation
            .params
            .get("method")
            .and_then(Value::as_str)
            .unwrap_or("GET")
            .to_uppercase();
        let empty = Map::new();
        let headers = invocation
            .params
            .get("headers")
            .and_then(Value::as_object)
            .unwrap_or(&empty);
        let body = invocation.params.get("body");
        // The engine's timeout decorator is the enforcement layer; the
        // transport gets the same bound so sockets do not outlive it.
        let timeout = flowrunner_core::handler::policy::block_timeout(&invocation.params);

        debug!(block = %invocation.block_id, %method, %url, "api request");
        let response = self
            .requester
            .send(&method, url, headers, body, timeout)
            .await
            .map_err(|e| HandlerError {
                message: e.message,
                transient: e.transient,
            })?;

        if response.status >= 500 {
            return Err(HandlerError::transient(format!(
                "{url} answered {}: {}",
                response.status, response.body
            )));
        }
        if response.status >= 400 {
            return Err(HandlerError::permanent(format!(
                "{url} answered {}: {}",
                response.status, response.body
            )));
        }

        let body_value = serde_json::from_str(&response.body)
            .unwrap_or(Value::String(response.body.clone()));
        Ok(HandlerOutput::output(BlockOutput::Api {
            status: response.status,
            headers: response.headers,
            body: body_value,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use tokio_util::sync::CancellationToken;

    /// Scripted transport: pops one canned result per call.
    struct ScriptedRequester {
        script: Mutex<Vec<Result<HttpResponse, RequestError>>>,
    }

    #[async_trait]
    impl Requester for ScriptedRequester {
        async fn send(
            &self,
            _method: &str,
            _url: &str,
            _headers: &Map<String, Value>,
            _body: Option<&Value>,
            _timeout: Duration,
        ) -> Result<HttpResponse, RequestError> {
            self.script.lock().unwrap().remove(0)
        }
    }

    fn handler_with(script: Vec<Result<HttpResponse, RequestError>>) -> ApiHandler {
        ApiHandler::new(Arc::new(ScriptedRequester {
            script: Mutex::new(script),
        }))
    }

    fn invocation(params: Map<String, Value>) -> Invocation {
        Invocation {
            block_id: "a1".into(),
            block_name: "A1".into(),
            kind: "api".into(),
            params,
            run_input: Value::Null,
            loop_binding: None,
            outputs: HashMap::new(),
            cancel: CancellationToken::new(),
        }
    }

    fn url_params() -> Map<String, Value> {
        let mut params = Map::new();
        params.insert("url".into(), json!("https://api.test/items"));
        params
    }

    #[tokio::test]
    async fn success_parses_json_body() {
        let handler = handler_with(vec![Ok(HttpResponse {
            status: 200,
            headers: Map::new(),
            body: "{\"items\": [1, 2]}".into(),
        })]);
        let out = handler.invoke(invocation(url_params())).await.unwrap();
        let v = out.output.to_value();
        assert_eq!(v["status"], 200);
        assert_eq!(v["body"]["items"], json!([1, 2]));
    }

    #[tokio::test]
    async fn server_errors_are_transient() {
        let handler = handler_with(vec![Ok(HttpResponse {
            status: 503,
            headers: Map::new(),
            body: "unavailable".into(),
        })]);
        let err = handler.invoke(invocation(url_params())).await.unwrap_err();
        assert!(err.transient);
    }

    #[tokio::test]
    async fn client_errors_are_permanent() {
        let handler = handler_with(vec![Ok(HttpResponse {
            status: 404,
            headers: Map::new(),
            body: "missing".into(),
        })]);
        let err = handler.invoke(invocation(url_params())).await.unwrap_err();
        assert!(!err.transient);
    }

    #[tokio::test]
    async fn missing_url_is_permanent() {
        let handler = handler_with(vec![]);
        let err = handler.invoke(invocation(Map::new())).await.unwrap_err();
        assert!(!err.transient);
        assert!(err.message.contains("url"));
    }
}
