//! Reconciliation controller.
//!
//! One controller serves one resource kind. Any number of processes may run a
//! controller for the same kind against the same store; the claim annotation
//! written in [`crate::claim::try_claim`] decides which of them dispatches a
//! given delivery.
//!
//! ## Per-event protocol
//!
//! 1. Ignore events whose `status.state` is not actionable.
//! 2. Skip resources already claimed, by this process or another.
//! 3. Claim with a conditional write; conflict or not-found abandons quietly.
//! 4. Resolve the handler and call the operation matching the state.
//! 5. Write the outcome to `status` (best effort, bounded attempts).
//! 6. Release the claim, whatever happened in 4 and 5.
//!
//! Nothing in this protocol returns an error to the watch loop.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use hangar_core::observability::reconcile_span;
use hangar_core::{
    ControllerConfig, LabelSelector, OwnerId, Resource, ResourceState, ResourceStatus,
    ResourceStore, WatchConfig, WatchEvent, WatchEventType, WatchRequest, resource::labels,
};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{Instrument, debug, error, info, warn};

use crate::claim::{ClaimOutcome, release_claim, try_claim, write_status};
use crate::handler::{
    HandlerContext, HandlerError, HandlerOutcome, HandlerRegistry, Operation, dispatch,
};
use crate::metrics::CoordMetrics;
use crate::watch::{WatchEventHandler, run_watch};

/// What the controller did with one event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventOutcome {
    /// The event's state is not actionable for this controller.
    Ignored,
    /// The resource is already claimed by this process.
    AlreadyServing,
    /// The resource is claimed by another process.
    HeldElsewhere(String),
    /// Another process won the conditional write.
    ClaimLost,
    /// The resource was deleted before it could be claimed.
    Vanished,
    /// The claim write failed for a reason other than a lost race.
    ClaimFailed,
    /// The handler ran.
    Dispatched {
        /// The operation invoked.
        operation: Operation,
        /// The state recorded (or attempted) in `status`.
        state: ResourceState,
        /// Whether the status write reached the store.
        status_written: bool,
    },
}

/// Watches one resource kind and dispatches claimed events to its handler.
pub struct ReconcileController<S: ResourceStore + ?Sized> {
    store: Arc<S>,
    owner: OwnerId,
    group: String,
    resource_type: String,
    actionable: Vec<ResourceState>,
    registry: HandlerRegistry,
    config: ControllerConfig,
    metrics: CoordMetrics,
}

impl<S: ResourceStore + ?Sized> ReconcileController<S> {
    /// Creates a controller for `group/resource_type`.
    ///
    /// Actionable states default to `in_queue`, `update`, `delete`, and `abort`.
    pub fn new(
        store: Arc<S>,
        owner: OwnerId,
        group: impl Into<String>,
        resource_type: impl Into<String>,
        registry: HandlerRegistry,
    ) -> Self {
        Self {
            store,
            owner,
            group: group.into(),
            resource_type: resource_type.into(),
            actionable: vec![
                ResourceState::InQueue,
                ResourceState::Update,
                ResourceState::Delete,
                ResourceState::Abort,
            ],
            registry,
            config: ControllerConfig::default(),
            metrics: CoordMetrics::new(),
        }
    }

    /// Restricts the states this controller acts on.
    ///
    /// States without a matching [`Operation`] are dropped.
    #[must_use]
    pub fn with_actionable_states(
        mut self,
        states: impl IntoIterator<Item = ResourceState>,
    ) -> Self {
        self.actionable = states
            .into_iter()
            .filter(|s| Operation::for_state(s).is_some())
            .collect();
        self
    }

    /// Overrides controller settings.
    #[must_use]
    pub fn with_config(mut self, config: ControllerConfig) -> Self {
        self.config = config;
        self
    }

    /// Returns this controller's claim identity.
    #[must_use]
    pub fn owner(&self) -> &OwnerId {
        &self.owner
    }

    /// Returns the states this controller acts on.
    #[must_use]
    pub fn actionable_states(&self) -> &[ResourceState] {
        &self.actionable
    }

    /// Builds the filtered watch request, e.g. `state in (in_queue,update,delete,abort)`.
    #[must_use]
    pub fn watch_request(&self) -> WatchRequest {
        WatchRequest::new(&self.group, &self.resource_type).with_selector(LabelSelector::key_in(
            labels::STATE,
            self.actionable.iter().map(ResourceState::as_str),
        ))
    }

    /// Handles one delivered event.
    pub async fn handle_event(&self, event: WatchEvent) -> EventOutcome {
        let resource = event.object;
        let state = resource.status_state().unwrap_or_default().to_string();
        let span = reconcile_span(&resource.key.to_string(), &state, self.owner.as_str());

        self.handle_resource(event.event_type, resource)
            .instrument(span)
            .await
    }

    async fn handle_resource(
        &self,
        event_type: WatchEventType,
        resource: Resource,
    ) -> EventOutcome {
        if event_type == WatchEventType::Deleted {
            return EventOutcome::Ignored;
        }
        let Some(operation) = self.operation_for(&resource) else {
            debug!("state not actionable");
            return EventOutcome::Ignored;
        };

        let claimed = match try_claim(self.store.as_ref(), &resource, &self.owner).await {
            Ok(outcome) => {
                self.metrics.record_claim(&self.resource_type, outcome.as_str());
                match outcome {
                    ClaimOutcome::Claimed(claimed) => claimed,
                    ClaimOutcome::AlreadyOwned => {
                        debug!("already serving resource");
                        return EventOutcome::AlreadyServing;
                    }
                    ClaimOutcome::HeldBy(holder) => {
                        debug!(holder = %holder, "resource claimed elsewhere");
                        return EventOutcome::HeldElsewhere(holder);
                    }
                    ClaimOutcome::Lost => return EventOutcome::ClaimLost,
                    ClaimOutcome::Vanished => return EventOutcome::Vanished,
                }
            }
            Err(e) => {
                self.metrics.record_claim(&self.resource_type, "error");
                warn!(error = %e, "claim failed");
                return EventOutcome::ClaimFailed;
            }
        };

        info!(operation = %operation, "claimed resource, dispatching");
        let started = Instant::now();
        let result = self.invoke(operation, &claimed).await;

        let (state, response, error, result_label) = match result {
            Ok(HandlerOutcome::Completed(response)) => {
                info!(operation = %operation, "handler completed");
                (operation.success_state(), Some(response), None, "succeeded")
            }
            Ok(HandlerOutcome::InProgress(response)) => {
                info!(operation = %operation, "handler accepted, operation in progress");
                (ResourceState::InProgress, Some(response), None, "in_progress")
            }
            Err(e) => {
                warn!(operation = %operation, error = %e, "handler failed");
                (operation.failure_state(), None, Some(e.to_value()), "failed")
            }
        };
        let status = ResourceStatus {
            state: Some(state.as_str().to_string()),
            response,
            error,
            last_operation: Some(operation.as_str().to_string()),
        };
        self.metrics.record_dispatch(
            &self.resource_type,
            operation.as_str(),
            result_label,
            started.elapsed(),
        );

        let status_written = match write_status(
            self.store.as_ref(),
            &claimed.key,
            &self.owner,
            status,
            self.config.status_write_retries,
        )
        .await
        {
            Ok(Some(_)) => true,
            Ok(None) => {
                warn!("status not written, resource gone or claim lost");
                false
            }
            Err(e) => {
                error!(error = %e, "status write failed");
                false
            }
        };

        if let Err(e) = release_claim(
            self.store.as_ref(),
            &claimed.key,
            &self.owner,
            self.config.status_write_retries,
        )
        .await
        {
            error!(error = %e, "claim release failed");
        }

        EventOutcome::Dispatched {
            operation,
            state,
            status_written,
        }
    }

    fn operation_for(&self, resource: &Resource) -> Option<Operation> {
        let state = resource.lifecycle_state()?;
        if !self.actionable.contains(&state) {
            return None;
        }
        Operation::for_state(&state)
    }

    async fn invoke(
        &self,
        operation: Operation,
        resource: &Resource,
    ) -> Result<HandlerOutcome, HandlerError> {
        if !resource.options.is_object() && !resource.options.is_null() {
            return Err(HandlerError::invalid_options(format!(
                "spec.options of {} is not an object",
                resource.key
            )));
        }
        let ctx = HandlerContext::new(resource.key.clone(), resource.options.clone());
        let handler = self.registry.resolve(&ctx)?;
        dispatch(handler.as_ref(), operation, &ctx).await
    }
}

impl<S: ResourceStore + ?Sized> ReconcileController<S> {
    /// Watches the kind until `shutdown` is cancelled, handling each event on
    /// its own task, then waits for in-flight events to finish.
    pub async fn run(self: Arc<Self>, watch: WatchConfig, shutdown: CancellationToken) {
        let request = self.watch_request();
        let tracker = TaskTracker::new();
        let dispatcher = Arc::new(Dispatcher {
            controller: Arc::clone(&self),
            tracker: tracker.clone(),
        });

        info!(
            group = %self.group,
            resource_type = %self.resource_type,
            owner = %self.owner,
            "reconcile controller starting"
        );
        run_watch(
            Arc::clone(&self.store),
            request,
            dispatcher,
            watch,
            shutdown,
            self.metrics.clone(),
        )
        .await;

        tracker.close();
        tracker.wait().await;
        info!(resource_type = %self.resource_type, "reconcile controller stopped");
    }
}

struct Dispatcher<S: ResourceStore + ?Sized> {
    controller: Arc<ReconcileController<S>>,
    tracker: TaskTracker,
}

#[async_trait]
impl<S: ResourceStore + ?Sized> WatchEventHandler for Dispatcher<S> {
    async fn on_event(&self, event: WatchEvent) {
        let controller = Arc::clone(&self.controller);
        self.tracker.spawn(async move {
            controller.handle_event(event).await;
        });
    }
}

impl<S: ResourceStore + ?Sized> std::fmt::Debug for ReconcileController<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReconcileController")
            .field("owner", &self.owner)
            .field("group", &self.group)
            .field("resource_type", &self.resource_type)
            .field("actionable", &self.actionable)
            .finish_non_exhaustive()
    }
}
