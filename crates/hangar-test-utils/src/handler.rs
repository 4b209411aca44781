//! Recording resource handler.

use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use hangar_coord::handler::{
    HandlerContext, HandlerError, HandlerOutcome, Operation, ResourceHandler,
};
use serde_json::json;

/// Handler that counts invocations and optionally fails or stalls.
#[derive(Debug, Default)]
pub struct RecordingHandler {
    creates: AtomicU32,
    updates: AtomicU32,
    deletes: AtomicU32,
    aborts: AtomicU32,
    fail_with: Mutex<Option<HandlerError>>,
    delay: Option<Duration>,
    invoked_ids: Mutex<Vec<String>>,
}

impl RecordingHandler {
    /// Creates a handler that always succeeds.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a handler that sleeps before returning.
    #[must_use]
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    /// Makes every later call fail with `error`.
    pub fn fail_with(&self, error: HandlerError) {
        *self.fail_with.lock().expect("lock") = Some(error);
    }

    /// Returns how many times `operation` was invoked.
    #[must_use]
    pub fn calls(&self, operation: Operation) -> u32 {
        self.counter(operation).load(Ordering::SeqCst)
    }

    /// Returns the total number of invocations.
    #[must_use]
    pub fn total_calls(&self) -> u32 {
        [
            Operation::Create,
            Operation::Update,
            Operation::Delete,
            Operation::Abort,
        ]
        .into_iter()
        .map(|op| self.calls(op))
        .sum()
    }

    /// Returns resource ids in invocation order.
    #[must_use]
    pub fn invoked_ids(&self) -> Vec<String> {
        self.invoked_ids.lock().expect("lock").clone()
    }

    fn counter(&self, operation: Operation) -> &AtomicU32 {
        match operation {
            Operation::Create => &self.creates,
            Operation::Update => &self.updates,
            Operation::Delete => &self.deletes,
            Operation::Abort => &self.aborts,
        }
    }

    async fn invoke(
        &self,
        operation: Operation,
        ctx: &HandlerContext,
    ) -> Result<HandlerOutcome, HandlerError> {
        self.counter(operation).fetch_add(1, Ordering::SeqCst);
        self.invoked_ids
            .lock()
            .expect("lock")
            .push(ctx.key.id.clone());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(error) = self.fail_with.lock().expect("lock").clone() {
            return Err(error);
        }
        Ok(HandlerOutcome::Completed(json!({
            "operation": operation.as_str(),
            "id": ctx.key.id,
        })))
    }
}

#[async_trait]
impl ResourceHandler for RecordingHandler {
    async fn create(&self, ctx: &HandlerContext) -> Result<HandlerOutcome, HandlerError> {
        self.invoke(Operation::Create, ctx).await
    }

    async fn update(&self, ctx: &HandlerContext) -> Result<HandlerOutcome, HandlerError> {
        self.invoke(Operation::Update, ctx).await
    }

    async fn delete(&self, ctx: &HandlerContext) -> Result<HandlerOutcome, HandlerError> {
        self.invoke(Operation::Delete, ctx).await
    }

    async fn abort(&self, ctx: &HandlerContext) -> Result<HandlerOutcome, HandlerError> {
        self.invoke(Operation::Abort, ctx).await
    }
}
