use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::Error;

type TeardownFuture = Pin<Box<dyn Future<Output = Result<(), Error>> + Send>>;
type TeardownTask = Box<dyn Fn() -> TeardownFuture + Send + Sync>;

struct PendingTeardown {
    attempts: u32,
    description: String,
    task: TeardownTask,
}

/// Background retry of cleanup calls (unsubscribes, lease releases) that failed on the request
/// path.
///
/// The retry loop runs while anything is queued and exits once the queue drains, so a queue
/// outlives the component that filled it only until its last task succeeds or is given up.
#[derive(Clone)]
pub struct TeardownQueue {
    interval: Duration,
    max_attempts: u32,
    pending: Arc<Mutex<Vec<PendingTeardown>>>,
    shutdown_token: Arc<Mutex<Option<CancellationToken>>>,
}

impl std::fmt::Debug for TeardownQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TeardownQueue")
            .field("interval", &self.interval)
            .field("max_attempts", &self.max_attempts)
            .field("pending", &self.len())
            .finish_non_exhaustive()
    }
}

impl TeardownQueue {
    /// Creates an empty queue. The retry loop starts with the first pushed task.
    #[must_use]
    pub fn new(interval: Duration, max_attempts: u32) -> Self {
        Self {
            interval,
            max_attempts,
            pending: Arc::new(Mutex::new(Vec::new())),
            shutdown_token: Arc::new(Mutex::new(None)),
        }
    }

    /// Queues a cleanup call that already failed once.
    pub fn push<F, Fut>(&self, description: impl Into<String>, task: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), Error>> + Send + 'static,
    {
        let description = description.into();
        debug!(%description, "queued teardown for retry");

        self.pending.lock().push(PendingTeardown {
            attempts: 1,
            description,
            task: Box::new(move || -> TeardownFuture { Box::pin(task()) }),
        });

        self.ensure_running();
    }

    /// Number of queued cleanup calls.
    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    /// Whether nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Retries every queued call once.
    pub async fn retry_pending(&self) {
        let batch: Vec<PendingTeardown> = std::mem::take(&mut *self.pending.lock());
        let mut remaining = Vec::new();

        for mut teardown in batch {
            match (teardown.task)().await {
                Ok(()) => debug!(description = %teardown.description, "teardown succeeded"),
                Err(e) => {
                    teardown.attempts += 1;
                    if teardown.attempts >= self.max_attempts {
                        error!(
                            description = %teardown.description,
                            attempts = teardown.attempts,
                            error = %e,
                            "giving up on teardown"
                        );
                    } else {
                        warn!(description = %teardown.description, error = %e, "teardown failed");
                        remaining.push(teardown);
                    }
                }
            }
        }

        self.pending.lock().extend(remaining);
    }

    /// Stops the retry loop after one last attempt at everything queued.
    pub async fn shutdown(&self) {
        if let Some(token) = self.shutdown_token.lock().take() {
            token.cancel();
        }

        if !self.is_empty() {
            self.retry_pending().await;
        }
    }

    fn ensure_running(&self) {
        let mut shutdown_token = self.shutdown_token.lock();
        if shutdown_token.is_some() || Handle::try_current().is_err() {
            return;
        }

        let token = CancellationToken::new();
        *shutdown_token = Some(token.clone());
        drop(shutdown_token);

        let queue = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(
                tokio::time::Instant::now() + queue.interval,
                queue.interval,
            );

            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    _ = ticker.tick() => queue.retry_pending().await,
                }

                // Lock order matches `push` then `ensure_running`, so a task pushed after this
                // check starts a fresh loop.
                let mut shutdown_token = queue.shutdown_token.lock();
                if queue.pending.lock().is_empty() {
                    shutdown_token.take();
                    debug!("teardown queue drained");
                    break;
                }
            }
        });
    }
}
