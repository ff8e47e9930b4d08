// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Cached handles to remote collaborators.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{RemoteError, ServiceKind};

/// A live proxy to a remote service.
///
/// The transport cancels `liveness` when the remote object dies.
pub struct Connection<T: ?Sized> {
    proxy: Arc<T>,
    liveness: CancellationToken,
}

impl<T: ?Sized> Connection<T> {
    pub fn new(proxy: Arc<T>, liveness: CancellationToken) -> Self {
        Self { proxy, liveness }
    }

    pub fn is_alive(&self) -> bool {
        !self.liveness.is_cancelled()
    }
}

impl<T: ?Sized> Clone for Connection<T> {
    fn clone(&self) -> Self {
        Self {
            proxy: Arc::clone(&self.proxy),
            liveness: self.liveness.clone(),
        }
    }
}

/// Establishes a new connection to a remote service.
pub type Connector<T> = Arc<dyn Fn() -> Result<Connection<T>, RemoteError> + Send + Sync>;

/// Lazily connected, self-healing handle to one remote service.
///
/// The connection is dropped when its liveness token is cancelled or a call
/// reports [`RemoteError::Unavailable`]; the next use reconnects.
pub struct RemoteProxy<T: ?Sized> {
    service: ServiceKind,
    connector: Connector<T>,
    cached: Mutex<Option<Connection<T>>>,
    generation: AtomicU64,
}

impl<T: ?Sized> RemoteProxy<T> {
    pub fn new(service: ServiceKind, connector: Connector<T>) -> Self {
        Self {
            service,
            connector,
            cached: Mutex::new(None),
            generation: AtomicU64::new(0),
        }
    }

    pub fn service(&self) -> ServiceKind {
        self.service
    }

    /// Returns the cached proxy, reconnecting if there is none or the remote
    /// has died.
    pub fn get(&self) -> Result<Arc<T>, RemoteError> {
        let mut cached = self.cached.lock();
        if let Some(conn) = cached.as_ref() {
            if conn.is_alive() {
                return Ok(Arc::clone(&conn.proxy));
            }
            debug!(service = %self.service, "Remote died, dropping cached proxy");
            *cached = None;
        }

        let conn = (self.connector)().inspect_err(|e| {
            warn!(service = %self.service, error = %e, "Failed to connect to remote service");
        })?;
        let proxy = Arc::clone(&conn.proxy);
        *cached = Some(conn);
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(service = %self.service, generation, "Connected to remote service");
        Ok(proxy)
    }

    /// Runs `f` against the proxy. The lock is not held during the call.
    pub fn call<R>(&self, f: impl FnOnce(&T) -> Result<R, RemoteError>) -> Result<R, RemoteError> {
        let proxy = self.get()?;
        let result = f(&*proxy);
        if let Err(RemoteError::Unavailable) = result {
            self.invalidate();
        }
        result
    }

    pub fn invalidate(&self) {
        if self.cached.lock().take().is_some() {
            debug!(service = %self.service, "Invalidated cached proxy");
        }
    }

    /// Number of connections established so far. A change means the remote
    /// may have lost state held for the previous connection.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub fn is_connected(&self) -> bool {
        self.cached
            .lock()
            .as_ref()
            .is_some_and(Connection::is_alive)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    trait Echo: Send + Sync {
        fn echo(&self, v: u32) -> Result<u32, RemoteError>;
    }

    struct Fixed;

    impl Echo for Fixed {
        fn echo(&self, v: u32) -> Result<u32, RemoteError> {
            Ok(v)
        }
    }

    struct Dead;

    impl Echo for Dead {
        fn echo(&self, _v: u32) -> Result<u32, RemoteError> {
            Err(RemoteError::Unavailable)
        }
    }

    fn counting_connector(
        proxy: Arc<dyn Echo>,
        liveness: CancellationToken,
    ) -> (Connector<dyn Echo>, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);
        let connector: Connector<dyn Echo> = Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(Connection::new(Arc::clone(&proxy), liveness.clone()))
        });
        (connector, count)
    }

    #[test]
    fn test_connects_lazily_and_caches() {
        let (connector, count) = counting_connector(Arc::new(Fixed), CancellationToken::new());
        let proxy = RemoteProxy::new(ServiceKind::PolicyEngine, connector);
        assert!(!proxy.is_connected());
        assert_eq!(count.load(Ordering::SeqCst), 0);

        assert_eq!(proxy.call(|p| p.echo(1)), Ok(1));
        assert_eq!(proxy.call(|p| p.echo(2)), Ok(2));
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(proxy.is_connected());
        assert_eq!(proxy.generation(), 1);
    }

    #[test]
    fn test_reconnects_after_death_notification() {
        let liveness = CancellationToken::new();
        let (connector, count) = counting_connector(Arc::new(Fixed), liveness.clone());
        let proxy = RemoteProxy::new(ServiceKind::StorageManager, connector);

        proxy.call(|p| p.echo(1)).unwrap();
        liveness.cancel();
        assert!(!proxy.is_connected());

        // The connector hands out the same cancelled token, so every use reconnects.
        proxy.call(|p| p.echo(1)).unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert_eq!(proxy.generation(), 2);
    }

    #[test]
    fn test_unavailable_call_drops_connection() {
        let (connector, count) = counting_connector(Arc::new(Dead), CancellationToken::new());
        let proxy = RemoteProxy::new(ServiceKind::BundleManager, connector);

        assert_eq!(proxy.call(|p| p.echo(1)), Err(RemoteError::Unavailable));
        assert!(!proxy.is_connected());
        assert_eq!(proxy.call(|p| p.echo(1)), Err(RemoteError::Unavailable));
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_connect_failure_is_returned() {
        let connector: Connector<dyn Echo> = Arc::new(|| Err(RemoteError::Timeout));
        let proxy = RemoteProxy::new(ServiceKind::PolicyEngine, connector);
        assert_eq!(proxy.call(|p| p.echo(1)), Err(RemoteError::Timeout));
        assert!(!proxy.is_connected());
        assert_eq!(proxy.generation(), 0);
    }
}
