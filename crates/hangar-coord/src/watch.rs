//! Reconnecting watch loop.
//!
//! Registers a watch, feeds every event to a [`WatchEventHandler`], and
//! re-registers forever: after `refresh_interval` when the stream ends
//! normally, after `error_delay` when registration or the stream fails. A
//! permanently unavailable store is logged on every attempt but never ends the
//! loop; only the shutdown token does.

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use hangar_core::{ResourceStore, WatchConfig, WatchEvent, WatchRequest};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::metrics::CoordMetrics;

/// Receives events from [`run_watch`].
///
/// Implementations must not fail: anything that goes wrong while handling one
/// event is logged and absorbed so the loop keeps serving later events.
#[async_trait]
pub trait WatchEventHandler: Send + Sync {
    /// Handles one watch event.
    async fn on_event(&self, event: WatchEvent);
}

/// Why one registration of the watch ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamEnd {
    Clean,
    Failed,
    Shutdown,
}

/// Runs the watch loop until `shutdown` is cancelled.
pub async fn run_watch<S, H>(
    store: Arc<S>,
    request: WatchRequest,
    handler: Arc<H>,
    config: WatchConfig,
    shutdown: CancellationToken,
    metrics: CoordMetrics,
) where
    S: ResourceStore + ?Sized,
    H: WatchEventHandler + ?Sized,
{
    info!(
        group = %request.group,
        resource_type = %request.resource_type,
        selector = %request.selector,
        "starting watch"
    );

    loop {
        let end = watch_once(store.as_ref(), &request, handler.as_ref(), &shutdown).await;
        let delay = match end {
            StreamEnd::Shutdown => break,
            StreamEnd::Clean => {
                metrics.record_watch_reconnect(&request.resource_type, "stream_ended");
                config.refresh_interval
            }
            StreamEnd::Failed => {
                metrics.record_watch_reconnect(&request.resource_type, "error");
                config.error_delay
            }
        };

        debug!(resource_type = %request.resource_type, delay = ?delay, "re-registering watch");
        tokio::select! {
            () = shutdown.cancelled() => break,
            () = tokio::time::sleep(delay) => {}
        }
    }

    info!(resource_type = %request.resource_type, "watch stopped");
}

async fn watch_once<S, H>(
    store: &S,
    request: &WatchRequest,
    handler: &H,
    shutdown: &CancellationToken,
) -> StreamEnd
where
    S: ResourceStore + ?Sized,
    H: WatchEventHandler + ?Sized,
{
    let registration = tokio::select! {
        () = shutdown.cancelled() => return StreamEnd::Shutdown,
        registration = store.register_watcher(request.clone()) => registration,
    };
    let mut stream = match registration {
        Ok(stream) => stream,
        Err(e) => {
            warn!(resource_type = %request.resource_type, error = %e, "watch registration failed");
            return StreamEnd::Failed;
        }
    };

    loop {
        let next = tokio::select! {
            () = shutdown.cancelled() => return StreamEnd::Shutdown,
            next = stream.next() => next,
        };
        match next {
            Some(Ok(event)) => handler.on_event(event).await,
            Some(Err(e)) => {
                warn!(resource_type = %request.resource_type, error = %e, "watch stream failed");
                return StreamEnd::Failed;
            }
            None => {
                debug!(resource_type = %request.resource_type, "watch stream ended");
                return StreamEnd::Clean;
            }
        }
    }
}
