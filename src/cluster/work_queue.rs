use std::{
    collections::HashSet,
    fmt::Debug,
    hash::Hash,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use async_trait::async_trait;
use executor_utils::retry::Backoff;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

pub const DEFAULT_MAX_RETRIES: u32 = 3;

const RETRY_BACKOFF: Backoff = Backoff::Exponential {
    initial: Duration::from_millis(100),
    max: Duration::from_secs(10),
};

#[async_trait]
pub trait WorkHandler<T>: Send + Sync {
    async fn handle(&self, item: &T) -> anyhow::Result<()>;
}

struct QueueItem<T> {
    item: T,
    attempt: u32,
}

/// Items waiting in the channel and items a worker is handling.
struct QueueState<T> {
    dirty: HashSet<T>,
    processing: HashSet<T>,
}

/// Named queue drained by a fixed set of workers. An item is never handled
/// by two workers at once, and adding an item that is already waiting is a
/// no-op. Failed items are re-added with exponential backoff until they run
/// out of retries.
pub struct WorkQueue<T> {
    name: String,
    tx: mpsc::UnboundedSender<QueueItem<T>>,
    state: Arc<Mutex<QueueState<T>>>,
}

impl<T> Clone for WorkQueue<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            tx: self.tx.clone(),
            state: self.state.clone(),
        }
    }
}

impl<T: Debug + Clone + Eq + Hash + Send + Sync + 'static> WorkQueue<T> {
    pub fn start(
        name: &str,
        workers: usize,
        handler: Arc<dyn WorkHandler<T>>,
        cancel: CancellationToken,
    ) -> Self {
        Self::start_with_retries(name, workers, DEFAULT_MAX_RETRIES, handler, cancel)
    }

    pub fn start_with_retries(
        name: &str,
        workers: usize,
        max_retries: u32,
        handler: Arc<dyn WorkHandler<T>>,
        cancel: CancellationToken,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let rx = Arc::new(AsyncMutex::new(rx));
        let queue = Self {
            name: name.to_string(),
            tx,
            state: Arc::new(Mutex::new(QueueState {
                dirty: HashSet::new(),
                processing: HashSet::new(),
            })),
        };
        for worker in 0..workers.max(1) {
            tokio::spawn(queue.clone().worker(
                worker,
                rx.clone(),
                max_retries,
                handler.clone(),
                cancel.clone(),
            ));
        }
        queue
    }

    /// Queues `item` unless it is already waiting. An item added while a
    /// worker handles it is queued again once that worker is done.
    pub fn add(&self, item: T) {
        self.enqueue(item, 0);
    }

    fn state(&self) -> MutexGuard<'_, QueueState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn enqueue(&self, item: T, attempt: u32) {
        let mut state = self.state();
        if !state.dirty.insert(item.clone()) {
            return;
        }
        if state.processing.contains(&item) {
            return;
        }
        self.send(item, attempt);
    }

    fn send(&self, item: T, attempt: u32) {
        if self.tx.send(QueueItem { item, attempt }).is_err() {
            warn!(queue = %self.name, "work queue stopped, dropping item");
        }
    }

    async fn worker(
        self,
        worker: usize,
        rx: Arc<AsyncMutex<mpsc::UnboundedReceiver<QueueItem<T>>>>,
        max_retries: u32,
        handler: Arc<dyn WorkHandler<T>>,
        cancel: CancellationToken,
    ) {
        loop {
            let next = {
                let mut rx = rx.lock().await;
                tokio::select! {
                    _ = cancel.cancelled() => None,
                    item = rx.recv() => item,
                }
            };
            let Some(QueueItem { item, attempt }) = next else {
                break;
            };
            {
                let mut state = self.state();
                state.dirty.remove(&item);
                state.processing.insert(item.clone());
            }

            let result = handler.handle(&item).await;

            let added_meanwhile = {
                let mut state = self.state();
                state.processing.remove(&item);
                state.dirty.contains(&item)
            };
            if added_meanwhile {
                self.send(item, 0);
                continue;
            }
            let Err(err) = result else {
                continue;
            };
            if attempt >= max_retries {
                error!(
                    queue = %self.name,
                    item = ?item,
                    error = %err,
                    "giving up on work item"
                );
                continue;
            }
            let delay = RETRY_BACKOFF.delay_for_attempt(attempt);
            warn!(
                queue = %self.name,
                item = ?item,
                attempt = attempt + 1,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "work item failed, requeueing"
            );
            let queue = self.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    _ = tokio::time::sleep(delay) => queue.enqueue(item, attempt + 1),
                }
            });
        }
        debug!(queue = %self.name, worker, "worker stopped");
    }
}
