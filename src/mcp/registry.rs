//! Method and notification handler tables.
//!
//! A [`MethodRegistry`] maps a method name to an async handler producing a
//! result or an error. It is built once before the session starts and is
//! read-only afterwards. Lookup is a plain map access; there is no reflection.

use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::Arc;

use indexmap::IndexMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::mcp::error::{McpError, McpResult};
use crate::mcp::session::RequestContext;

/// Future returned by a method handler.
pub type HandlerFuture = Pin<Box<dyn Future<Output = McpResult<Value>> + Send>>;

/// A request handler.
pub type MethodHandler = Arc<dyn Fn(Option<Value>, RequestContext) -> HandlerFuture + Send + Sync>;

/// A notification handler. Errors are logged, never answered.
pub type NotificationHandler = Arc<dyn Fn(Option<Value>) -> McpResult<()> + Send + Sync>;

/// Maps method names to request handlers.
#[derive(Clone, Default)]
pub struct MethodRegistry {
    handlers: IndexMap<String, MethodHandler>,
}

impl MethodRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler working on raw JSON parameters.
    ///
    /// Re-registering a name replaces the previous handler.
    pub fn register<F, Fut>(&mut self, method: impl Into<String>, handler: F)
    where
        F: Fn(Option<Value>, RequestContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = McpResult<Value>> + Send + 'static,
    {
        let method = method.into();
        let boxed: MethodHandler =
            Arc::new(move |params: Option<Value>, ctx: RequestContext| -> HandlerFuture {
                Box::pin(handler(params, ctx))
            });

        if self.handlers.insert(method.clone(), boxed).is_some() {
            tracing::warn!(method = %method, "Method handler registered twice, keeping the last one");
        }
    }

    /// Registers a handler with typed parameters and result.
    ///
    /// Missing parameters are read as JSON `null`. Parameters that do not
    /// deserialise into `P` fail with [`McpError::InvalidParams`].
    pub fn register_typed<P, R, F, Fut>(&mut self, method: impl Into<String>, handler: F)
    where
        P: DeserializeOwned + Send + 'static,
        R: Serialize + 'static,
        F: Fn(P, RequestContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = McpResult<R>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        self.register(method, move |params: Option<Value>, ctx| {
            let handler = Arc::clone(&handler);
            async move {
                let params: P = serde_json::from_value(params.unwrap_or(Value::Null))
                    .map_err(|e| McpError::InvalidParams(e.to_string()))?;
                let result = (*handler)(params, ctx).await?;
                serde_json::to_value(result).map_err(|e| {
                    tracing::error!(error = %e, "Failed to serialise handler result");
                    McpError::Internal("failed to serialise result".to_string())
                })
            }
        });
    }

    /// Returns `true` if a handler is registered for `method`.
    #[must_use]
    pub fn contains(&self, method: &str) -> bool {
        self.handlers.contains_key(method)
    }

    /// Returns the registered method names in registration order.
    pub fn methods(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }

    /// Returns the number of registered methods.
    #[must_use]
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Returns `true` if no methods are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Looks up `method` and starts its handler.
    ///
    /// An unknown method yields a future resolving to
    /// [`McpError::MethodNotFound`]. The registry is never modified.
    #[must_use]
    pub fn dispatch(
        &self,
        method: &str,
        params: Option<Value>,
        ctx: RequestContext,
    ) -> HandlerFuture {
        match self.handlers.get(method) {
            Some(handler) => handler(params, ctx),
            None => {
                let method = method.to_string();
                Box::pin(async move { Err(McpError::MethodNotFound(method)) })
            }
        }
    }
}

impl std::fmt::Debug for MethodRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MethodRegistry")
            .field("methods", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Best-effort notification handlers.
#[derive(Clone, Default)]
pub struct NotificationRegistry {
    handlers: IndexMap<String, NotificationHandler>,
}

impl NotificationRegistry {
    /// Creates an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler for a notification method.
    pub fn register<F>(&mut self, method: impl Into<String>, handler: F)
    where
        F: Fn(Option<Value>) -> McpResult<()> + Send + Sync + 'static,
    {
        let method = method.into();
        if self.handlers.insert(method.clone(), Arc::new(handler)).is_some() {
            tracing::warn!(method = %method, "Notification handler registered twice, keeping the last one");
        }
    }

    /// Delivers a notification. Handler errors and panics are logged only.
    pub fn deliver(&self, method: &str, params: Option<Value>) {
        let Some(handler) = self.handlers.get(method) else {
            tracing::debug!(method = %method, "Ignoring notification without handler");
            return;
        };

        match panic::catch_unwind(AssertUnwindSafe(|| handler(params))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::warn!(method = %method, error = %e, "Notification handler failed");
            }
            Err(_) => tracing::error!(method = %method, "Notification handler panicked"),
        }
    }
}

impl std::fmt::Debug for NotificationRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationRegistry")
            .field("methods", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}
