// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Service root wiring the URI permission manager to its collaborators and
//! to the lifecycle event stream.

use std::sync::Arc;

use anyhow::{Context, Result};
use lifecycle_subscriber::{EventPublisher, LifecycleSubscriber};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};
use uripermmgr::{Collaborators, UriPermissionManager};

pub mod config;
pub mod logging;

pub use config::{Config, ConfigOverrides};
pub use lifecycle_subscriber::SystemEvent;

/// A running permission service: the shared manager plus the background
/// task that releases grants on lifecycle events.
pub struct UriPermissionService {
    manager: Arc<UriPermissionManager>,
    subscriber: LifecycleSubscriber,
    publisher: EventPublisher,
    cancel: CancellationToken,
}

impl UriPermissionService {
    /// Builds the manager and spawns the lifecycle subscriber. Must be called
    /// from within a tokio runtime.
    #[instrument(skip_all, fields(event_queue_depth = config.event_queue_depth))]
    pub fn start(config: &Config, collaborators: Collaborators) -> Result<Self> {
        tokio::runtime::Handle::try_current()
            .context("The URI permission service must be started inside a tokio runtime")?;

        let manager = Arc::new(UriPermissionManager::new(
            config.manager.clone(),
            collaborators,
        ));
        let cancel = CancellationToken::new();
        let (subscriber, publisher) = LifecycleSubscriber::spawn(
            Arc::clone(&manager),
            config.event_queue_depth,
            cancel.child_token(),
        );
        info!(
            foundation = %config.manager.foundation_process_name,
            "URI permission service started"
        );

        Ok(Self {
            manager,
            subscriber,
            publisher,
            cancel,
        })
    }

    pub fn manager(&self) -> &Arc<UriPermissionManager> {
        &self.manager
    }

    /// A handle for feeding lifecycle events to the service.
    pub fn publisher(&self) -> EventPublisher {
        self.publisher.clone()
    }

    /// Stops the lifecycle subscriber. Events already queued may be dropped.
    pub async fn shutdown(self) -> Result<()> {
        self.cancel.cancel();
        let handled = self
            .subscriber
            .join()
            .await
            .context("Failed to stop the lifecycle subscriber")?;
        info!(handled, "URI permission service stopped");
        Ok(())
    }
}
