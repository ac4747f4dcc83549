//! Operation dispatch table for incoming link requests

use crate::identity::Identity;
use futures::future::BoxFuture;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tracing::warn;

/// Who is asking
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestContext {
    /// Identity proven during the link handshake
    pub peer: Identity,
    /// Identity the request claims to act for
    pub caller: Identity,
}

impl RequestContext {
    /// Whether the claimed caller is the authenticated peer
    pub fn caller_is_peer(&self) -> bool {
        self.peer == self.caller
    }
}

/// Result handed back to the requesting peer
pub type HandlerResult = Result<Value, String>;

/// Boxed handler for one operation
pub type Handler = Arc<dyn Fn(RequestContext, Value) -> BoxFuture<'static, HandlerResult> + Send + Sync>;

/// Table from operation name to handler.
///
/// Handlers can be registered after the dispatcher is shared with links, so
/// the mesh and the components serving it can be built in either order.
#[derive(Default)]
pub struct Dispatcher {
    handlers: RwLock<HashMap<String, Handler>>,
}

impl Dispatcher {
    /// Create an empty dispatcher
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `op`, replacing any previous one
    pub fn register<F, Fut>(&self, op: impl Into<String>, handler: F)
    where
        F: Fn(RequestContext, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        let handler: Handler = Arc::new(move |ctx, payload| Box::pin(handler(ctx, payload)));
        self.handlers.write().insert(op.into(), handler);
    }

    /// Names of registered operations
    pub fn operations(&self) -> Vec<String> {
        let mut ops: Vec<String> = self.handlers.read().keys().cloned().collect();
        ops.sort();
        ops
    }

    /// Run the handler for `op`
    pub async fn dispatch(&self, ctx: RequestContext, op: &str, payload: Value) -> HandlerResult {
        let handler = self.handlers.read().get(op).cloned();
        match handler {
            Some(handler) => handler(ctx, payload).await,
            None => {
                warn!(op = %op, peer = %ctx.peer.short(), "ignoring request for unknown operation");
                Err(format!("unknown operation: {}", op))
            }
        }
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("operations", &self.operations())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx(peer: &str, caller: &str) -> RequestContext {
        RequestContext {
            peer: Identity::new(peer),
            caller: Identity::new(caller),
        }
    }

    #[tokio::test]
    async fn test_dispatch_registered() {
        let dispatcher = Dispatcher::new();
        dispatcher.register("echo", |ctx: RequestContext, payload: Value| async move {
            Ok::<_, String>(json!({"from": ctx.caller.as_str(), "payload": payload}))
        });

        let result = dispatcher
            .dispatch(ctx("aa", "aa"), "echo", json!(5))
            .await
            .unwrap();
        assert_eq!(result, json!({"from": "aa", "payload": 5}));
    }

    #[tokio::test]
    async fn test_dispatch_unknown_op() {
        let dispatcher = Dispatcher::new();
        let err = dispatcher
            .dispatch(ctx("aa", "aa"), "teleport", Value::Null)
            .await
            .unwrap_err();
        assert!(err.contains("teleport"));
    }

    #[tokio::test]
    async fn test_register_replaces() {
        let dispatcher = Dispatcher::new();
        dispatcher.register("op", |_, _| async { Ok::<_, String>(json!(1)) });
        dispatcher.register("op", |_, _| async { Ok::<_, String>(json!(2)) });

        assert_eq!(dispatcher.operations(), vec!["op".to_string()]);
        let result = dispatcher.dispatch(ctx("a", "a"), "op", Value::Null).await;
        assert_eq!(result, Ok(json!(2)));
    }

    #[test]
    fn test_caller_is_peer() {
        assert!(ctx("aa", "aa").caller_is_peer());
        assert!(!ctx("aa", "bb").caller_is_peer());
    }
}
