//! Type-specific resource handlers and the registry that constructs them.
//!
//! The controller never knows what a resource kind does. It decodes
//! `spec.options`, asks the [`HandlerRegistry`] for a handler built from the
//! kind (and optionally the `plan_id`), and calls the operation matching the
//! resource's state.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use hangar_core::{ResourceKey, ResourceState};
use serde::Serialize;
use serde_json::Value;

/// Operation dispatched for an actionable state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    /// `in_queue` resources are created.
    Create,
    /// `update` resources are updated.
    Update,
    /// `delete` resources are deleted.
    Delete,
    /// `abort` resources are aborted.
    Abort,
}

impl Operation {
    /// Maps an actionable state to its operation.
    #[must_use]
    pub fn for_state(state: &ResourceState) -> Option<Self> {
        match state {
            ResourceState::InQueue => Some(Self::Create),
            ResourceState::Update => Some(Self::Update),
            ResourceState::Delete => Some(Self::Delete),
            ResourceState::Abort => Some(Self::Abort),
            _ => None,
        }
    }

    /// Returns the operation name as recorded in `status.lastOperation`.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Abort => "abort",
        }
    }

    /// State written when the handler completes.
    #[must_use]
    pub const fn success_state(self) -> ResourceState {
        match self {
            Self::Create | Self::Update | Self::Delete => ResourceState::Succeeded,
            Self::Abort => ResourceState::Aborted,
        }
    }

    /// State written when the handler fails.
    #[must_use]
    pub const fn failure_state(self) -> ResourceState {
        match self {
            Self::Delete => ResourceState::DeleteFailed,
            Self::Create | Self::Update | Self::Abort => ResourceState::Failed,
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything a handler needs to act on one claimed resource.
#[derive(Debug, Clone, PartialEq)]
pub struct HandlerContext {
    /// The claimed resource.
    pub key: ResourceKey,
    /// `plan_id` from the decoded options, if present.
    pub plan_id: Option<String>,
    /// Decoded `spec.options`.
    pub options: Value,
}

impl HandlerContext {
    /// Builds a context from decoded options, extracting `plan_id`.
    #[must_use]
    pub fn new(key: ResourceKey, options: Value) -> Self {
        let plan_id = options
            .get("plan_id")
            .and_then(Value::as_str)
            .map(str::to_string);
        Self {
            key,
            plan_id,
            options,
        }
    }
}

/// Successful handler result.
#[derive(Debug, Clone, PartialEq)]
pub enum HandlerOutcome {
    /// The operation finished; the payload becomes `status.response`.
    Completed(Value),
    /// The operation was accepted and continues elsewhere; the resource moves
    /// to `in_progress` and something else reports the final state.
    InProgress(Value),
}

/// Structured handler failure, written verbatim into `status.error`.
#[derive(Debug, Clone, PartialEq, Serialize, thiserror::Error)]
#[error("{code}: {message}")]
pub struct HandlerError {
    /// Machine-readable error code.
    pub code: String,
    /// Human-readable description.
    pub message: String,
    /// Optional extra context.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl HandlerError {
    /// Creates a handler error.
    #[must_use]
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            details: None,
        }
    }

    /// Attaches extra context.
    #[must_use]
    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    /// The operation is not supported by this kind.
    #[must_use]
    pub fn unsupported(operation: Operation) -> Self {
        Self::new(
            "Unsupported",
            format!("operation `{operation}` is not supported"),
        )
    }

    /// No handler is registered for the resource.
    #[must_use]
    pub fn no_handler(key: &ResourceKey) -> Self {
        Self::new(
            "HandlerNotFound",
            format!("no handler registered for {}/{}", key.group, key.resource_type),
        )
    }

    /// `spec.options` could not be decoded.
    #[must_use]
    pub fn invalid_options(message: impl Into<String>) -> Self {
        Self::new("InvalidOptions", message)
    }

    /// Encodes the error for `status.error`.
    #[must_use]
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or_else(|_| Value::String(self.to_string()))
    }
}

/// Capability interface implemented per resource kind.
#[async_trait]
pub trait ResourceHandler: Send + Sync {
    /// Provisions the resource.
    async fn create(&self, ctx: &HandlerContext) -> Result<HandlerOutcome, HandlerError>;

    /// Applies changed options.
    async fn update(&self, ctx: &HandlerContext) -> Result<HandlerOutcome, HandlerError>;

    /// Tears the resource down.
    async fn delete(&self, ctx: &HandlerContext) -> Result<HandlerOutcome, HandlerError>;

    /// Aborts an in-flight operation. Unsupported unless overridden.
    async fn abort(&self, _ctx: &HandlerContext) -> Result<HandlerOutcome, HandlerError> {
        Err(HandlerError::unsupported(Operation::Abort))
    }
}

/// Invokes the handler method for `operation`.
///
/// # Errors
///
/// Returns whatever the handler returns.
pub async fn dispatch(
    handler: &dyn ResourceHandler,
    operation: Operation,
    ctx: &HandlerContext,
) -> Result<HandlerOutcome, HandlerError> {
    match operation {
        Operation::Create => handler.create(ctx).await,
        Operation::Update => handler.update(ctx).await,
        Operation::Delete => handler.delete(ctx).await,
        Operation::Abort => handler.abort(ctx).await,
    }
}

/// Constructor for a handler, given the resource it will act on.
pub type HandlerFactory =
    Arc<dyn Fn(&HandlerContext) -> Result<Arc<dyn ResourceHandler>, HandlerError> + Send + Sync>;

/// Kind to constructor registry.
///
/// A plan-specific constructor wins over the kind constructor when the
/// resource's options carry a matching `plan_id`.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    kinds: HashMap<(String, String), HandlerFactory>,
    plans: HashMap<(String, String, String), HandlerFactory>,
}

impl HandlerRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the constructor for a resource kind.
    #[must_use]
    pub fn register_kind<F>(mut self, group: &str, resource_type: &str, factory: F) -> Self
    where
        F: Fn(&HandlerContext) -> Result<Arc<dyn ResourceHandler>, HandlerError>
            + Send
            + Sync
            + 'static,
    {
        self.kinds.insert(
            (group.to_string(), resource_type.to_string()),
            Arc::new(factory),
        );
        self
    }

    /// Registers a constructor used only for resources with the given `plan_id`.
    #[must_use]
    pub fn register_plan<F>(
        mut self,
        group: &str,
        resource_type: &str,
        plan_id: &str,
        factory: F,
    ) -> Self
    where
        F: Fn(&HandlerContext) -> Result<Arc<dyn ResourceHandler>, HandlerError>
            + Send
            + Sync
            + 'static,
    {
        self.plans.insert(
            (
                group.to_string(),
                resource_type.to_string(),
                plan_id.to_string(),
            ),
            Arc::new(factory),
        );
        self
    }

    /// Registers a single shared handler instance for a kind.
    #[must_use]
    pub fn register_handler(
        self,
        group: &str,
        resource_type: &str,
        handler: Arc<dyn ResourceHandler>,
    ) -> Self {
        self.register_kind(group, resource_type, move |_| Ok(Arc::clone(&handler)))
    }

    /// Constructs the handler for a resource.
    ///
    /// # Errors
    ///
    /// Returns [`HandlerError::no_handler`] if nothing is registered, or the
    /// constructor's own error.
    pub fn resolve(&self, ctx: &HandlerContext) -> Result<Arc<dyn ResourceHandler>, HandlerError> {
        let group = ctx.key.group.clone();
        let resource_type = ctx.key.resource_type.clone();
        if let Some(plan_id) = &ctx.plan_id {
            if let Some(factory) =
                self.plans
                    .get(&(group.clone(), resource_type.clone(), plan_id.clone()))
            {
                return factory(ctx);
            }
        }
        match self.kinds.get(&(group, resource_type)) {
            Some(factory) => factory(ctx),
            None => Err(HandlerError::no_handler(&ctx.key)),
        }
    }

    /// Returns true if a constructor exists for the kind.
    #[must_use]
    pub fn has_kind(&self, group: &str, resource_type: &str) -> bool {
        self.kinds
            .contains_key(&(group.to_string(), resource_type.to_string()))
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("kinds", &self.kinds.keys().collect::<Vec<_>>())
            .field("plans", &self.plans.keys().collect::<Vec<_>>())
            .finish()
    }
}
