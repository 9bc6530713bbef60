//! Host-side handlers for tool calls issued by the remote service.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{EngineError, Result};

#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn call(&self, args: Value) -> std::result::Result<Value, String>;
}

/// Adapts a plain closure into a handler
pub struct FnTool<F>(pub F);

#[async_trait]
impl<F> ToolHandler for FnTool<F>
where
    F: Fn(Value) -> std::result::Result<Value, String> + Send + Sync,
{
    async fn call(&self, args: Value) -> std::result::Result<Value, String> {
        (self.0)(args)
    }
}

#[derive(Clone, Default)]
pub struct ToolRegistry {
    handlers: HashMap<String, Arc<dyn ToolHandler>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, handler: Arc<dyn ToolHandler>) {
        let name = name.into();
        log::debug!("Tools: Registered '{}'", name);
        self.handlers.insert(name, handler);
    }

    pub fn register_fn<F>(&mut self, name: impl Into<String>, f: F)
    where
        F: Fn(Value) -> std::result::Result<Value, String> + Send + Sync + 'static,
    {
        self.register(name, Arc::new(FnTool(f)));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Run the named handler. A handler failure is wrapped into an error
    /// payload; only an unknown name is an `Err`.
    pub async fn handle(&self, name: &str, args: Value) -> Result<Value> {
        let handler = self
            .handlers
            .get(name)
            .cloned()
            .ok_or_else(|| EngineError::ToolCallUnhandled(name.to_string()))?;

        match handler.call(args).await {
            Ok(value) => Ok(wrap_output(value)),
            Err(reason) => {
                log::warn!("Tools: '{}' failed: {}", name, reason);
                Ok(failure_response(&reason))
            }
        }
    }
}

/// The response body for a call that could not be served
pub fn failure_response(reason: &str) -> Value {
    json!({ "error": reason })
}

/// Function responses must be JSON objects
fn wrap_output(value: Value) -> Value {
    match value {
        Value::Object(_) => value,
        other => json!({ "output": other }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_known_tool_result() {
        let mut registry = ToolRegistry::new();
        registry.register_fn("updateBusinessProfile", |args| {
            Ok(json!({ "updated": args["name"] }))
        });

        let result = registry
            .handle("updateBusinessProfile", json!({"name": "Acme"}))
            .await
            .unwrap();
        assert_eq!(result, json!({"updated": "Acme"}));
    }

    #[tokio::test]
    async fn test_unknown_tool_is_unhandled() {
        let registry = ToolRegistry::new();
        let err = registry.handle("launchRockets", json!({})).await.unwrap_err();
        assert!(matches!(err, EngineError::ToolCallUnhandled(name) if name == "launchRockets"));
    }

    #[tokio::test]
    async fn test_handler_failure_becomes_error_payload() {
        let mut registry = ToolRegistry::new();
        registry.register_fn("flaky", |_| Err("backend down".to_string()));
        let result = registry.handle("flaky", Value::Null).await.unwrap();
        assert_eq!(result, json!({"error": "backend down"}));
    }

    #[tokio::test]
    async fn test_scalar_output_is_wrapped() {
        let mut registry = ToolRegistry::new();
        registry.register_fn("count", |_| Ok(json!(3)));
        assert_eq!(
            registry.handle("count", Value::Null).await.unwrap(),
            json!({"output": 3})
        );
    }
}
