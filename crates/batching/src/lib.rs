//! Debounced batching of concurrent requests into one shared execution.
//!
//! Callers [`Batch::submit`] items and all receive the output of the single
//! [`BatchRunner::run`] call that consumed them. The first item of an empty
//! queue opens a window; the window closes `interval` later, or earlier if
//! someone calls [`Batch::flush`].

use std::{error::Error as StdError, fmt, mem, sync::Arc, time::Duration};

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use thiserror::Error;
use tokio::{sync::watch, time::sleep};
use tracing::*;

/// Work performed once per closed window.
#[async_trait]
pub trait BatchRunner<T: Send + 'static>: Send + Sync + 'static {
    type Output: Clone + Send + Sync + 'static;
    type Error: StdError + Send + Sync + 'static;

    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Consumes every item of one window. Items arrive in random order.
    async fn run(&self, items: Vec<T>) -> Result<Self::Output, Self::Error>;
}

#[derive(Debug, Error)]
pub enum BatchError<E: StdError + 'static> {
    #[error("batch run failed: {0}")]
    Run(Arc<E>),

    #[error("batch window was dropped before it completed")]
    Abandoned,
}

impl<E: StdError + 'static> BatchError<E> {
    /// Returns the runner error, if that is what happened.
    pub fn run_error(&self) -> Option<&E> {
        match self {
            BatchError::Run(e) => Some(e),
            BatchError::Abandoned => None,
        }
    }
}

#[derive(Copy, Clone, Debug)]
pub struct BatchConfig {
    /// How long the first item of a window waits for company.
    pub interval: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(2),
        }
    }
}

type WindowResult<O, E> = Option<Result<O, Arc<E>>>;

struct Queue<T, O, E> {
    items: Vec<T>,
    window: watch::Sender<WindowResult<O, E>>,
}

struct Inner<T: Send + 'static, R: BatchRunner<T>> {
    runner: R,
    config: BatchConfig,
    queue: Mutex<Queue<T, R::Output, R::Error>>,
}

/// Coalesces concurrently submitted items. Cheap to clone.
pub struct Batch<T: Send + 'static, R: BatchRunner<T>> {
    inner: Arc<Inner<T, R>>,
}

impl<T: Send + 'static, R: BatchRunner<T>> Clone for Batch<T, R> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Send + 'static, R: BatchRunner<T>> fmt::Debug for Batch<T, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Batch")
            .field("name", &self.inner.runner.name())
            .field("config", &self.inner.config)
            .field("pending", &self.pending())
            .finish()
    }
}

impl<T: Send + 'static, R: BatchRunner<T>> Batch<T, R> {
    pub fn new(runner: R, config: BatchConfig) -> Self {
        let (window, _) = watch::channel(None);
        Self {
            inner: Arc::new(Inner {
                runner,
                config,
                queue: Mutex::new(Queue {
                    items: Vec::new(),
                    window,
                }),
            }),
        }
    }

    pub fn runner(&self) -> &R {
        &self.inner.runner
    }

    /// Number of items waiting in the open window.
    pub fn pending(&self) -> usize {
        self.inner.queue.lock().items.len()
    }

    /// Adds `item` to the open window and waits for that window's result.
    ///
    /// Must be called from within a tokio runtime. The window timer runs on
    /// its own task, so dropping a caller does not stall the others.
    pub async fn submit(&self, item: T) -> Result<R::Output, BatchError<R::Error>> {
        let (mut rx, opens_window) = {
            let mut queue = self.inner.queue.lock();
            queue.items.push(item);
            (queue.window.subscribe(), queue.items.len() == 1)
        };

        if opens_window {
            let inner = self.inner.clone();
            let mut timer_rx = rx.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = timer_rx.wait_for(Option::is_some) => {}
                    _ = sleep(inner.config.interval) => {}
                }
                // Somebody else may have flushed this window in the meantime.
                if timer_rx.borrow().is_none() {
                    inner.flush().await;
                }
            });
        }

        let res = rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| BatchError::Abandoned)?;
        match &*res {
            Some(Ok(out)) => Ok(out.clone()),
            Some(Err(e)) => Err(BatchError::Run(e.clone())),
            None => Err(BatchError::Abandoned),
        }
    }

    /// Closes the open window now, if it has any items.
    pub async fn flush(&self) {
        self.inner.flush().await;
    }
}

impl<T: Send + 'static, R: BatchRunner<T>> Inner<T, R> {
    async fn flush(&self) {
        let (mut items, window) = {
            let mut queue = self.queue.lock();
            if queue.items.is_empty() {
                return;
            }
            let (next, _) = watch::channel(None);
            let window = mem::replace(&mut queue.window, next);
            (mem::take(&mut queue.items), window)
        };

        items.shuffle(&mut rand::thread_rng());

        let name = self.runner.name();
        let count = items.len();
        debug!(%name, %count, "running batch");
        let res = self.runner.run(items).await.map_err(Arc::new);
        match &res {
            Ok(_) => info!(%name, %count, "batch completed"),
            Err(e) => warn!(%name, %count, err = %e, "batch failed"),
        }

        window.send_replace(Some(res));
    }
}

#[cfg(test)]
mod tests {
    use futures::future::join_all;
    use tokio::task::yield_now;

    use super::*;

    #[derive(Debug, Clone, Error)]
    #[error("not enough coins: missing {0}")]
    struct Shortfall(u64);

    /// Sums the submitted values and records every call.
    #[derive(Default)]
    struct SumRunner {
        calls: Mutex<Vec<Vec<u64>>>,
        fail_with: Option<u64>,
    }

    #[async_trait]
    impl BatchRunner<u64> for Arc<SumRunner> {
        type Output = u64;
        type Error = Shortfall;

        fn name(&self) -> &'static str {
            "sum"
        }

        async fn run(&self, items: Vec<u64>) -> Result<u64, Shortfall> {
            self.calls.lock().push(items.clone());
            if let Some(missing) = self.fail_with {
                return Err(Shortfall(missing));
            }
            Ok(items.iter().sum())
        }
    }

    fn batch(runner: Arc<SumRunner>, interval_ms: u64) -> Batch<u64, Arc<SumRunner>> {
        Batch::new(
            runner,
            BatchConfig {
                interval: Duration::from_millis(interval_ms),
            },
        )
    }

    #[tokio::test]
    async fn test_concurrent_submits_share_one_run() {
        let runner = Arc::new(SumRunner::default());
        let batch = batch(runner.clone(), 50);

        let results = join_all((1..=10).map(|i| {
            let batch = batch.clone();
            async move { batch.submit(i).await }
        }))
        .await;

        for res in results {
            assert_eq!(res.unwrap(), 55);
        }

        let calls = runner.calls.lock();
        assert_eq!(calls.len(), 1);
        let mut items = calls[0].clone();
        items.sort();
        assert_eq!(items, (1..=10).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_error_is_shared_by_all_waiters() {
        let runner = Arc::new(SumRunner {
            fail_with: Some(7),
            ..Default::default()
        });
        let batch = batch(runner.clone(), 30);

        let results = join_all((0..4).map(|i| {
            let batch = batch.clone();
            async move { batch.submit(i).await }
        }))
        .await;

        for res in results {
            let err = res.unwrap_err();
            assert_eq!(err.run_error().map(|e| e.0), Some(7));
        }
        assert_eq!(runner.calls.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_separate_windows_run_separately() {
        let runner = Arc::new(SumRunner::default());
        let batch = batch(runner.clone(), 20);

        assert_eq!(batch.submit(3).await.unwrap(), 3);
        assert_eq!(batch.submit(4).await.unwrap(), 4);

        let calls = runner.calls.lock();
        assert_eq!(*calls, vec![vec![3], vec![4]]);
    }

    #[tokio::test]
    async fn test_flush_on_empty_queue_is_noop() {
        let runner = Arc::new(SumRunner::default());
        let batch = batch(runner.clone(), 20);

        batch.flush().await;
        batch.flush().await;
        assert!(runner.calls.lock().is_empty());
        assert_eq!(batch.pending(), 0);
    }

    #[tokio::test]
    async fn test_flush_closes_window_early() {
        let runner = Arc::new(SumRunner::default());
        // long enough that only an explicit flush can close the window
        let batch = batch(runner.clone(), 60_000);

        let waiter = {
            let batch = batch.clone();
            tokio::spawn(async move { batch.submit(9).await })
        };

        while batch.pending() == 0 {
            yield_now().await;
        }
        batch.flush().await;

        assert_eq!(waiter.await.unwrap().unwrap(), 9);
        assert_eq!(runner.calls.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_racing_flushes_run_once() {
        let runner = Arc::new(SumRunner::default());
        let batch = batch(runner.clone(), 60_000);

        let waiter = {
            let batch = batch.clone();
            tokio::spawn(async move { batch.submit(1).await })
        };
        while batch.pending() == 0 {
            yield_now().await;
        }

        join_all((0..5).map(|_| batch.flush())).await;

        assert_eq!(waiter.await.unwrap().unwrap(), 1);
        assert_eq!(runner.calls.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_items_are_shuffled() {
        let runner = Arc::new(SumRunner::default());
        let batch = batch(runner.clone(), 30);

        // submitted in order, so staying sorted after a shuffle of 40 items is
        // vanishingly unlikely
        join_all((0..40).map(|i| {
            let batch = batch.clone();
            async move { batch.submit(i).await }
        }))
        .await;

        let calls = runner.calls.lock();
        assert_eq!(calls.len(), 1);
        let sorted: Vec<u64> = (0..40).collect();
        assert_ne!(calls[0], sorted);
    }
}
