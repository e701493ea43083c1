//! Guaranteed, single release of the middleware connection.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::OnceCell;
use tracing::{Instrument, Span};

use crate::middleware::Middleware;

/// Default bound on the disconnect call.
pub const DEFAULT_DISCONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Releases the middleware connection exactly once.
///
/// [`shutdown`](Self::shutdown) may be called any number of times, from any
/// number of tasks: the first call runs `disconnect` (bounded by the
/// configured timeout), concurrent callers wait for it, later callers return
/// immediately. If the coordinator is dropped without having been shut down
/// (early return, panic unwind), the release runs from `Drop`.
pub struct ShutdownCoordinator {
    middleware: Arc<dyn Middleware>,
    timeout: Duration,
    released: OnceCell<()>,
    span: Span,
}

impl ShutdownCoordinator {
    pub fn new(middleware: Arc<dyn Middleware>) -> Self {
        Self {
            middleware,
            timeout: DEFAULT_DISCONNECT_TIMEOUT,
            released: OnceCell::new(),
            span: tracing::info_span!("shutdown"),
        }
    }

    /// Bound the disconnect call.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// Whether the release has completed.
    pub fn is_released(&self) -> bool {
        self.released.initialized()
    }

    /// Release the middleware connection (idempotent).
    pub async fn shutdown(&self) {
        self.released
            .get_or_init(|| {
                release(self.middleware.clone(), self.timeout).instrument(self.span.clone())
            })
            .await;
    }

    /// Run `work`, then release the connection.
    ///
    /// The connection is released on every exit path: normal completion here,
    /// unwinding or cancellation through `Drop`.
    pub async fn scoped<F>(self, work: F) -> F::Output
    where
        F: Future,
    {
        let output = work.await;
        self.shutdown().await;
        output
    }
}

impl Drop for ShutdownCoordinator {
    fn drop(&mut self) {
        if self.released.initialized() {
            return;
        }

        let _entered = self.span.enter();
        tracing::warn!("Coordinator dropped before shutdown; releasing middleware");

        let middleware = self.middleware.clone();
        let timeout = self.timeout;

        // Drop may run on a runtime thread, where block_on would panic.
        let handle = std::thread::spawn(move || {
            match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(runtime) => runtime.block_on(release(middleware, timeout)),
                Err(e) => tracing::error!(error = %e, "Failed to build release runtime"),
            }
        });

        if handle.join().is_err() {
            tracing::error!("Middleware release panicked");
        }
    }
}

async fn release(middleware: Arc<dyn Middleware>, timeout: Duration) {
    tracing::info!("Disconnecting middleware");
    match tokio::time::timeout(timeout, middleware.disconnect()).await {
        Ok(Ok(())) => tracing::info!("Middleware disconnected"),
        Ok(Err(e)) => tracing::warn!(error = %e, "Error disconnecting middleware"),
        Err(_) => tracing::warn!(timeout = ?timeout, "Middleware disconnect timed out"),
    }
}

/// Process termination requests: Ctrl+C, and SIGTERM on Unix.
///
/// Listening starts at [`install`](Self::install), so a signal that arrives
/// before [`recv`](Self::recv) is awaited is still observed.
pub struct TerminationSignal {
    #[cfg(unix)]
    interrupt: tokio::signal::unix::Signal,
    #[cfg(unix)]
    terminate: tokio::signal::unix::Signal,
}

impl TerminationSignal {
    #[cfg(unix)]
    pub fn install() -> std::io::Result<Self> {
        use tokio::signal::unix::{SignalKind, signal};
        Ok(Self {
            interrupt: signal(SignalKind::interrupt())?,
            terminate: signal(SignalKind::terminate())?,
        })
    }

    #[cfg(not(unix))]
    pub fn install() -> std::io::Result<Self> {
        Ok(Self {})
    }

    /// Resolve on the next termination request.
    #[cfg(unix)]
    pub async fn recv(&mut self) {
        tokio::select! {
            _ = self.interrupt.recv() => tracing::info!("Received Ctrl+C"),
            _ = self.terminate.recv() => tracing::info!("Received SIGTERM"),
        }
    }

    /// Resolve on the next termination request.
    #[cfg(not(unix))]
    pub async fn recv(&mut self) {
        match tokio::signal::ctrl_c().await {
            Ok(()) => tracing::info!("Received Ctrl+C"),
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for Ctrl+C");
                std::future::pending::<()>().await;
            }
        }
    }
}
