//! Collapses concurrent work on the same key.
//!
//! The first caller for a key becomes the leader; callers arriving while it
//! runs wait for it to finish and then proceed as followers. Completion is
//! signalled from the leader's drop guard, so followers are released whether
//! the leader succeeded, failed or was cancelled.

use std::{
    collections::HashMap,
    future::Future,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
        Mutex,
        MutexGuard,
    },
    time::Duration,
};

use tokio::{sync::watch, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{ExecutorError, ExecutorResult};

struct KeyState {
    id: u64,
    done: Arc<watch::Sender<bool>>,
    started: Instant,
}

type KeyMap = Arc<Mutex<HashMap<String, KeyState>>>;

fn lock(keys: &KeyMap) -> MutexGuard<'_, HashMap<String, KeyState>> {
    keys.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct Throttler {
    keys: KeyMap,
    expiry: Duration,
    next_id: AtomicU64,
}

/// Held by the leader for as long as it works on the key.
pub struct LeaderGuard {
    key: String,
    id: u64,
    done: Arc<watch::Sender<bool>>,
    keys: KeyMap,
}

impl Drop for LeaderGuard {
    fn drop(&mut self) {
        self.done.send_replace(true);
        let mut keys = lock(&self.keys);
        if keys.get(&self.key).is_some_and(|state| state.id == self.id) {
            keys.remove(&self.key);
        }
    }
}

pub struct Follower {
    done: watch::Receiver<bool>,
    expiry: Duration,
}

impl Follower {
    /// Waits for the leader to finish, at most for the expiry window.
    pub async fn wait(mut self) {
        let _ = tokio::time::timeout(self.expiry, self.done.wait_for(|done| *done)).await;
    }
}

pub enum Ticket {
    Leader(LeaderGuard),
    Follower(Follower),
}

impl Throttler {
    pub fn new(expiry: Duration) -> Self {
        Self {
            keys: Arc::new(Mutex::new(HashMap::new())),
            expiry,
            next_id: AtomicU64::new(0),
        }
    }

    pub fn acquire(&self, key: &str) -> Ticket {
        let now = Instant::now();
        let mut keys = lock(&self.keys);
        if let Some(state) = keys.get(key) {
            if now.saturating_duration_since(state.started) < self.expiry && !*state.done.borrow()
            {
                return Ticket::Follower(Follower {
                    done: state.done.subscribe(),
                    expiry: self.expiry,
                });
            }
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (done, _) = watch::channel(false);
        let done = Arc::new(done);
        keys.insert(
            key.to_string(),
            KeyState {
                id,
                done: done.clone(),
                started: now,
            },
        );
        Ticket::Leader(LeaderGuard {
            key: key.to_string(),
            id,
            done,
            keys: self.keys.clone(),
        })
    }

    /// Calls `f(true)` for the leader; followers wait for it and then call
    /// `f(false)`.
    pub async fn run_once<F, Fut, T>(&self, key: &str, f: F) -> T
    where
        F: FnOnce(bool) -> Fut,
        Fut: Future<Output = T>,
    {
        match self.acquire(key) {
            Ticket::Leader(guard) => {
                let out = f(true).await;
                drop(guard);
                out
            }
            Ticket::Follower(follower) => {
                follower.wait().await;
                f(false).await
            }
        }
    }

    /// Like [`Throttler::run_once`], but followers get `NotFound` once the
    /// leader is done instead of running `f`.
    pub async fn run_once_strict<F, Fut, T>(&self, key: &str, f: F) -> ExecutorResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = ExecutorResult<T>>,
    {
        match self.acquire(key) {
            Ticket::Leader(guard) => {
                let out = f().await;
                drop(guard);
                out
            }
            Ticket::Follower(follower) => {
                follower.wait().await;
                Err(ExecutorError::not_found(format!(
                    "{key} was handled by a concurrent request"
                )))
            }
        }
    }

    /// Releases waiters of keys whose leader outlived the expiry window and
    /// forgets those keys.
    pub fn expire_stale(&self) -> usize {
        let now = Instant::now();
        let mut keys = lock(&self.keys);
        let before = keys.len();
        keys.retain(|_, state| {
            let fresh = now.saturating_duration_since(state.started) < self.expiry;
            if !fresh {
                state.done.send_replace(true);
            }
            fresh
        });
        before - keys.len()
    }

    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.expiry.max(Duration::from_millis(10)));
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let expired = self.expire_stale();
                    if expired > 0 {
                        debug!(expired, "expired throttler keys");
                    }
                }
            }
        }
    }
}
