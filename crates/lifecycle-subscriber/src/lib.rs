// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Reacts to package, process and ability lifecycle events by releasing the
//! URI grants that depended on them.

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument};
use uri_policy::{AbilityId, TokenId};
use uripermmgr::UriPermissionManager;

/// A system event that may invalidate grants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SystemEvent {
    /// An application package was uninstalled
    PackageRemoved {
        bundle_name: String,
        app_index: i32,
        token: TokenId,
    },
    /// A process exited
    ProcessDied { token: TokenId },
    /// An ability instance was destroyed; `None` means the whole ability
    /// context of the token went away
    AbilityDestroyed {
        token: TokenId,
        ability_id: Option<AbilityId>,
    },
}

/// Sending half of the event queue.
#[derive(Debug, Clone)]
pub struct EventPublisher {
    tx: mpsc::Sender<SystemEvent>,
}

impl EventPublisher {
    /// Queues an event, waiting for room if the queue is full.
    pub async fn publish(&self, event: SystemEvent) -> Result<()> {
        self.tx
            .send(event)
            .await
            .map_err(|_| anyhow!("Lifecycle subscriber has stopped"))
    }

    /// Queues an event without waiting.
    pub fn try_publish(&self, event: SystemEvent) -> Result<()> {
        self.tx.try_send(event).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => anyhow!("Lifecycle event queue is full"),
            mpsc::error::TrySendError::Closed(_) => anyhow!("Lifecycle subscriber has stopped"),
        })
    }
}

/// Background task draining the event queue into the permission manager.
pub struct LifecycleSubscriber {
    task: JoinHandle<usize>,
    cancel: CancellationToken,
}

impl LifecycleSubscriber {
    /// Spawns the subscriber on the current runtime. It stops when `cancel`
    /// fires or every [`EventPublisher`] is dropped.
    pub fn spawn(
        manager: Arc<UriPermissionManager>,
        queue_depth: usize,
        cancel: CancellationToken,
    ) -> (Self, EventPublisher) {
        let (tx, rx) = mpsc::channel(queue_depth.max(1));
        let task = tokio::spawn(run(manager, rx, cancel.clone()));
        (Self { task, cancel }, EventPublisher { tx })
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Cancels the subscriber and waits for it. Events queued before the
    /// cancellation are still handled. Returns the number of events handled.
    pub async fn shutdown(self) -> Result<usize> {
        self.cancel.cancel();
        self.join().await
    }

    /// Waits for the subscriber to stop on its own.
    pub async fn join(self) -> Result<usize> {
        self.task.await.context("Lifecycle subscriber task failed")
    }
}

async fn run(
    manager: Arc<UriPermissionManager>,
    mut rx: mpsc::Receiver<SystemEvent>,
    cancel: CancellationToken,
) -> usize {
    info!("Lifecycle subscriber started");
    let mut handled = 0;
    loop {
        let event = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                handled += drain(&manager, &mut rx).await;
                break;
            }
            event = rx.recv() => match event {
                Some(event) => event,
                None => {
                    debug!("Lifecycle event queue closed");
                    break;
                }
            },
        };
        dispatch(&manager, event).await;
        handled += 1;
    }
    info!(handled, "Lifecycle subscriber stopped");
    handled
}

/// Closes the queue and handles what was already published, so queued
/// uninstall cleanup is not lost on shutdown.
async fn drain(manager: &Arc<UriPermissionManager>, rx: &mut mpsc::Receiver<SystemEvent>) -> usize {
    rx.close();
    let mut drained = 0;
    while let Some(event) = rx.recv().await {
        dispatch(manager, event).await;
        drained += 1;
    }
    debug!(drained, "Lifecycle subscriber cancelled, queue drained");
    drained
}

#[instrument(skip(manager))]
async fn dispatch(manager: &Arc<UriPermissionManager>, event: SystemEvent) {
    let manager = Arc::clone(manager);
    // Manager calls may block on remote services.
    match tokio::task::spawn_blocking(move || apply(&manager, event)).await {
        Ok(released) => debug!(released, "Lifecycle event handled"),
        Err(e) => error!(error = %e, "Lifecycle event handler failed"),
    }
}

fn apply(manager: &UriPermissionManager, event: SystemEvent) -> usize {
    match event {
        SystemEvent::PackageRemoved {
            bundle_name,
            app_index,
            token,
        } => {
            info!(%bundle_name, app_index, %token, "Package removed, revoking its grants");
            manager.on_package_removed(token)
        }
        SystemEvent::ProcessDied { token } => manager.on_process_died(token),
        SystemEvent::AbilityDestroyed { token, ability_id } => {
            manager.on_ability_destroyed(token, ability_id)
        }
    }
}
