//! Cooperative shutdown signalling and owned background tasks.

use std::future::Future;

use thiserror::Error;
use tokio::{sync::watch, task::JoinHandle};
use tracing::*;

/// Sending half of a shutdown signal.
#[derive(Debug)]
pub struct ShutdownSignal(watch::Sender<bool>);

impl ShutdownSignal {
    pub fn new() -> Self {
        Self(watch::channel(false).0)
    }

    /// Creates a guard observing this signal.
    pub fn subscribe(&self) -> ShutdownGuard {
        ShutdownGuard(self.0.subscribe())
    }

    /// Requests shutdown. Idempotent.
    pub fn send(&self) {
        self.0.send_replace(true);
    }

    pub fn is_sent(&self) -> bool {
        *self.0.borrow()
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiving half of a shutdown signal, cheap to clone.
///
/// A guard whose signal was dropped reports shutdown, so an orphaned task
/// always winds down.
#[derive(Clone, Debug)]
pub struct ShutdownGuard(watch::Receiver<bool>);

impl ShutdownGuard {
    pub fn should_shutdown(&self) -> bool {
        *self.0.borrow() || self.0.has_changed().is_err()
    }

    /// Resolves once shutdown has been requested.
    pub async fn wait_for_shutdown(&self) {
        let mut rx = self.0.clone();
        // An error means the sender is gone, which counts as shutdown too.
        let _ = rx.wait_for(|stop| *stop).await;
    }
}

#[derive(Debug, Error)]
pub enum TaskError {
    #[error("task '{0}' panicked")]
    Panicked(&'static str),

    #[error("task '{0}' was cancelled")]
    Cancelled(&'static str),
}

/// A spawned task together with the signal that stops it.
///
/// Dropping the handle requests shutdown but does not wait for the task.
#[derive(Debug)]
pub struct ServiceHandle<T> {
    name: &'static str,
    signal: ShutdownSignal,
    join: Option<JoinHandle<T>>,
}

impl<T: Send + 'static> ServiceHandle<T> {
    /// Spawns `make(guard)` on the current tokio runtime.
    pub fn spawn<F, Fut>(name: &'static str, make: F) -> Self
    where
        F: FnOnce(ShutdownGuard) -> Fut,
        Fut: Future<Output = T> + Send + 'static,
    {
        let signal = ShutdownSignal::new();
        let fut = make(signal.subscribe());
        debug!(%name, "spawning service task");
        let join = tokio::spawn(fut);
        Self {
            name,
            signal,
            join: Some(join),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_finished(&self) -> bool {
        self.join.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Requests shutdown and waits for the task to exit.
    pub async fn stop(mut self) -> Result<T, TaskError> {
        self.signal.send();
        let Some(join) = self.join.take() else {
            return Err(TaskError::Cancelled(self.name));
        };

        match join.await {
            Ok(out) => {
                info!(name = %self.name, "service stopped");
                Ok(out)
            }
            Err(e) if e.is_panic() => {
                error!(name = %self.name, "service panicked");
                Err(TaskError::Panicked(self.name))
            }
            Err(_) => Err(TaskError::Cancelled(self.name)),
        }
    }
}

impl<T> Drop for ServiceHandle<T> {
    fn drop(&mut self) {
        self.signal.send();
    }
}
