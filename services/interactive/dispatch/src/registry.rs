//! Method handler registry.
//!
//! Routes inbound methods by name and turns handler outcomes into replies.

use async_trait::async_trait;
use dashmap::DashMap;
use interactive_wire::{Method, Reply, ReplyError};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};

/// Handles one inbound method name
#[async_trait]
pub trait MethodHandler: Send + Sync {
    /// Process a method. `Ok(None)` answers with a `null` result.
    async fn handle(&self, method: Method) -> Result<Option<Value>, ReplyError>;
}

/// Adapter for plain closures
pub struct FnHandler<F> {
    f: F,
}

impl<F> FnHandler<F>
where
    F: Fn(&Method) -> Result<Option<Value>, ReplyError> + Send + Sync + 'static,
{
    /// Wrap a closure
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F> MethodHandler for FnHandler<F>
where
    F: Fn(&Method) -> Result<Option<Value>, ReplyError> + Send + Sync + 'static,
{
    async fn handle(&self, method: Method) -> Result<Option<Value>, ReplyError> {
        (self.f)(&method)
    }
}

/// Name → handler table, cheap to clone and share with the method pump
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: Arc<DashMap<String, Arc<dyn MethodHandler>>>,
}

impl HandlerRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler, returning the one it replaced
    pub fn add_handler<H>(&self, method: impl Into<String>, handler: H) -> Option<Arc<dyn MethodHandler>>
    where
        H: MethodHandler + 'static,
    {
        let method = method.into();
        debug!("Registering handler for {}", method);
        self.handlers.insert(method, Arc::new(handler))
    }

    /// Register a closure
    pub fn add_fn<F>(&self, method: impl Into<String>, f: F) -> Option<Arc<dyn MethodHandler>>
    where
        F: Fn(&Method) -> Result<Option<Value>, ReplyError> + Send + Sync + 'static,
    {
        self.add_handler(method, FnHandler::new(f))
    }

    /// Unregister a handler; false if none was registered
    pub fn remove_handler(&self, method: &str) -> bool {
        self.handlers.remove(method).is_some()
    }

    /// Whether a handler is registered for `method`
    pub fn contains(&self, method: &str) -> bool {
        self.handlers.contains_key(method)
    }

    /// Number of registered handlers
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Whether no handler is registered
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Run the handler for `method` and build the reply to send, if any.
    ///
    /// Methods flagged `discard` never get a reply. Without a handler a
    /// discard method is dropped and any other method gets an
    /// unknown-method error.
    pub async fn handle(&self, method: Method) -> Option<Reply> {
        // Clone out of the map so no shard lock is held across the await
        let handler = self.handlers.get(&method.method).map(|entry| entry.value().clone());

        let Some(handler) = handler else {
            if method.discard {
                debug!("No handler for discarded method {}", method.method);
                return None;
            }
            warn!("No handler for method {} (id {})", method.method, method.id);
            return Some(method.reply_error(ReplyError::unknown_method(&method.method)));
        };

        let id = method.id;
        let discard = method.discard;
        let name = method.method.clone();
        let outcome = handler.handle(method).await;

        if discard {
            if let Err(e) = outcome {
                warn!("Handler for discarded method {} failed: {}", name, e);
            }
            return None;
        }

        Some(match outcome {
            Ok(result) => Reply::success(id, result.unwrap_or(Value::Null)),
            Err(error) => Reply::failure(id, error),
        })
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<String> = self.handlers.iter().map(|e| e.key().clone()).collect();
        names.sort();
        f.debug_struct("HandlerRegistry").field("methods", &names).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use interactive_wire::UNKNOWN_METHOD_NAME;
    use serde_json::json;

    struct Echo;

    #[async_trait]
    impl MethodHandler for Echo {
        async fn handle(&self, method: Method) -> Result<Option<Value>, ReplyError> {
            Ok(Some(method.params))
        }
    }

    #[tokio::test]
    async fn test_handler_result_becomes_reply() {
        let registry = HandlerRegistry::new();
        registry.add_handler("echo", Echo);

        let reply = registry
            .handle(Method::new(4, "echo", json!({ "foo": "bar" }), false))
            .await
            .unwrap();
        assert_eq!(reply, Reply::success(4, json!({ "foo": "bar" })));
    }

    #[tokio::test]
    async fn test_handler_error_becomes_error_reply() {
        let registry = HandlerRegistry::new();
        registry.add_fn("fail", |_| Err(ReplyError::new(4000, "nope").with_path("x")));

        let reply = registry.handle(Method::new(2, "fail", Value::Null, false)).await.unwrap();
        let error = reply.error.unwrap();
        assert_eq!(error.code, 4000);
        assert_eq!(error.path.as_deref(), Some("x"));
    }

    #[tokio::test]
    async fn test_none_result_is_null() {
        let registry = HandlerRegistry::new();
        registry.add_fn("ack", |_| Ok(None));

        let reply = registry.handle(Method::new(9, "ack", Value::Null, false)).await.unwrap();
        assert_eq!(reply, Reply::success(9, Value::Null));
    }

    #[tokio::test]
    async fn test_unknown_method() {
        let registry = HandlerRegistry::new();

        let reply = registry.handle(Method::new(3, "nope", Value::Null, false)).await.unwrap();
        assert_eq!(reply.id, 3);
        assert_eq!(reply.error.unwrap().code, UNKNOWN_METHOD_NAME);

        assert!(registry.handle(Method::new(4, "nope", Value::Null, true)).await.is_none());
    }

    #[tokio::test]
    async fn test_discard_never_replies() {
        let registry = HandlerRegistry::new();
        registry.add_handler("echo", Echo);
        registry.add_fn("fail", |_| Err(ReplyError::new(4000, "nope")));

        assert!(registry.handle(Method::new(1, "echo", json!(1), true)).await.is_none());
        assert!(registry.handle(Method::new(2, "fail", json!(1), true)).await.is_none());
    }

    #[tokio::test]
    async fn test_add_replaces_and_remove() {
        let registry = HandlerRegistry::new();
        assert!(registry.add_handler("echo", Echo).is_none());
        assert!(registry.add_fn("echo", |_| Ok(Some(json!("second")))).is_some());
        assert_eq!(registry.len(), 1);

        let reply = registry.handle(Method::new(1, "echo", json!(1), false)).await.unwrap();
        assert_eq!(reply.result, json!("second"));

        assert!(registry.remove_handler("echo"));
        assert!(!registry.remove_handler("echo"));
        assert!(registry.is_empty());
        assert!(!registry.contains("echo"));
    }
}
