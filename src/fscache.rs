//! Function service cache.
//!
//! Maps functions to live services. One task owns the indices and serves
//! requests sent over a channel, so every mutation is serialized and callers
//! only ever see clones. Entries are indexed three ways at once:
//!
//! - by function key (plus aliases for functions sharing one pod),
//! - by address,
//! - by the uid of every orchestrator object the entry owns.

use std::{collections::HashMap, time::Duration};

use data_model::{FuncSvc, FunctionKey};
use tokio::{
    sync::{mpsc, oneshot},
    time::Instant,
};
use tracing::{debug, info};

use crate::error::{ExecutorError, ExecutorResult};

/// Outcome of [`FunctionServiceCache::add`].
#[derive(Debug, Clone)]
pub enum AddResult {
    Inserted(FuncSvc),
    /// Another entry already owns the key, address or one of the objects.
    /// Carries that entry, touched.
    NameExists(FuncSvc),
}

enum Request {
    GetByFunction {
        key: FunctionKey,
        reply: oneshot::Sender<Option<FuncSvc>>,
    },
    GetByFunctionUid {
        uid: String,
        reply: oneshot::Sender<Option<FuncSvc>>,
    },
    Add {
        entry: FuncSvc,
        reply: oneshot::Sender<AddResult>,
    },
    TouchByAddress {
        address: String,
        reply: oneshot::Sender<bool>,
    },
    ListOld {
        age: Duration,
        reply: oneshot::Sender<Vec<FuncSvc>>,
    },
    DeleteOld {
        entry: FuncSvc,
        min_age: Duration,
        reply: oneshot::Sender<bool>,
    },
    DeleteEntry {
        entry: FuncSvc,
        reply: oneshot::Sender<()>,
    },
    DeleteByObjectUid {
        uid: String,
        reply: oneshot::Sender<Option<FuncSvc>>,
    },
    DeleteByEnvironment {
        env_uid: String,
        reply: oneshot::Sender<Vec<FuncSvc>>,
    },
    DeleteByFunctionUid {
        uid: String,
        reply: oneshot::Sender<Vec<FuncSvc>>,
    },
    Acquire {
        key: FunctionKey,
        reply: oneshot::Sender<ExecutorResult<FuncSvc>>,
    },
    Release {
        address: String,
        reply: oneshot::Sender<bool>,
    },
    ListAll {
        reply: oneshot::Sender<Vec<FuncSvc>>,
    },
}

#[derive(Default)]
struct CacheState {
    by_function: HashMap<FunctionKey, FuncSvc>,
    aliases: HashMap<FunctionKey, FunctionKey>,
    by_address: HashMap<String, FunctionKey>,
    by_object: HashMap<String, FunctionKey>,
}

impl CacheState {
    fn resolve(&self, key: &FunctionKey) -> Option<FunctionKey> {
        if self.by_function.contains_key(key) {
            return Some(key.clone());
        }
        self.aliases.get(key).cloned()
    }

    fn touch(&mut self, key: &FunctionKey, now: Instant) -> Option<FuncSvc> {
        let entry = self.by_function.get_mut(key)?;
        entry.atime = entry.atime.max(now);
        Some(entry.clone())
    }

    fn get_by_function(&mut self, key: &FunctionKey, now: Instant) -> Option<FuncSvc> {
        let owner = self.resolve(key)?;
        self.touch(&owner, now)
    }

    fn get_by_function_uid(&self, uid: &str) -> Option<FuncSvc> {
        self.by_function
            .values()
            .filter(|entry| entry.function.uid == uid)
            .max_by_key(|entry| entry.function.generation)
            .cloned()
    }

    fn add(&mut self, mut entry: FuncSvc, now: Instant) -> AddResult {
        let key = entry.key();
        if let Some(owner) = self.resolve(&key) {
            if let Some(existing) = self.touch(&owner, now) {
                return AddResult::NameExists(existing);
            }
        }

        if let Some(owner) = self.by_address.get(&entry.address).cloned() {
            let shares_pod = self
                .by_function
                .get(&owner)
                .is_some_and(|existing| existing.environment.functions_per_container.is_infinite());
            if shares_pod {
                debug!(function = %key, owner = %owner, "aliasing function onto shared pod");
                self.aliases.insert(key.clone(), owner.clone());
            }
            if let Some(existing) = self.touch(&owner, now) {
                return AddResult::NameExists(existing);
            }
        }

        if let Some(owner) = entry
            .kube_objects
            .iter()
            .find_map(|obj| self.by_object.get(&obj.uid).cloned())
        {
            if let Some(existing) = self.touch(&owner, now) {
                return AddResult::NameExists(existing);
            }
        }

        entry.atime = entry.atime.max(entry.ctime);
        self.by_address.insert(entry.address.clone(), key.clone());
        for obj in &entry.kube_objects {
            if !obj.uid.is_empty() {
                self.by_object.insert(obj.uid.clone(), key.clone());
            }
        }
        self.by_function.insert(key, entry.clone());
        AddResult::Inserted(entry)
    }

    fn touch_by_address(&mut self, address: &str, now: Instant) -> bool {
        let Some(key) = self.by_address.get(address).cloned() else {
            return false;
        };
        self.touch(&key, now).is_some()
    }

    fn list_old(&self, age: Duration, now: Instant) -> Vec<FuncSvc> {
        self.by_function
            .values()
            .filter(|entry| entry.idle_for(now) > age)
            .cloned()
            .collect()
    }

    fn remove(&mut self, key: &FunctionKey) -> Option<FuncSvc> {
        let entry = self.by_function.remove(key)?;
        if self.by_address.get(&entry.address) == Some(key) {
            self.by_address.remove(&entry.address);
        }
        for obj in &entry.kube_objects {
            if self.by_object.get(&obj.uid) == Some(key) {
                self.by_object.remove(&obj.uid);
            }
        }
        self.aliases.retain(|_, owner| owner != key);
        Some(entry)
    }

    fn delete_old(&mut self, entry: &FuncSvc, min_age: Duration, now: Instant) -> bool {
        let key = entry.key();
        let still_old = self
            .by_function
            .get(&key)
            .is_some_and(|stored| stored.address == entry.address && stored.idle_for(now) >= min_age);
        still_old && self.remove(&key).is_some()
    }

    fn delete_entry(&mut self, entry: &FuncSvc) {
        let key = entry.key();
        if self.aliases.remove(&key).is_some() {
            return;
        }
        self.remove(&key);
    }

    fn delete_matching(&mut self, matches: impl Fn(&FuncSvc) -> bool) -> Vec<FuncSvc> {
        let keys: Vec<FunctionKey> = self
            .by_function
            .iter()
            .filter(|(_, entry)| matches(entry))
            .map(|(key, _)| key.clone())
            .collect();
        keys.iter().filter_map(|key| self.remove(key)).collect()
    }

    fn acquire(&mut self, key: &FunctionKey, now: Instant) -> ExecutorResult<FuncSvc> {
        let owner = self
            .resolve(key)
            .ok_or_else(|| ExecutorError::not_found(format!("function service {key} not found")))?;
        let entry = self
            .by_function
            .get_mut(&owner)
            .ok_or_else(|| ExecutorError::not_found(format!("function service {key} not found")))?;
        if entry.requests_per_pod > 0 && entry.active_requests >= entry.requests_per_pod {
            return Err(ExecutorError::TooManyRequests(format!(
                "function {}/{} reached {} concurrent requests on {}",
                entry.function.namespace, entry.function.name, entry.requests_per_pod, entry.address
            )));
        }
        entry.active_requests += 1;
        entry.atime = entry.atime.max(now);
        Ok(entry.clone())
    }

    fn release(&mut self, address: &str) -> bool {
        let Some(key) = self.by_address.get(address).cloned() else {
            return false;
        };
        match self.by_function.get_mut(&key) {
            Some(entry) => {
                entry.active_requests = entry.active_requests.saturating_sub(1);
                true
            }
            None => false,
        }
    }

    fn handle(&mut self, request: Request) {
        let now = Instant::now();
        // A dropped reply means the caller went away; there is nothing to do.
        match request {
            Request::GetByFunction { key, reply } => {
                let _ = reply.send(self.get_by_function(&key, now));
            }
            Request::GetByFunctionUid { uid, reply } => {
                let _ = reply.send(self.get_by_function_uid(&uid));
            }
            Request::Add { entry, reply } => {
                let _ = reply.send(self.add(entry, now));
            }
            Request::TouchByAddress { address, reply } => {
                let _ = reply.send(self.touch_by_address(&address, now));
            }
            Request::ListOld { age, reply } => {
                let _ = reply.send(self.list_old(age, now));
            }
            Request::DeleteOld {
                entry,
                min_age,
                reply,
            } => {
                let _ = reply.send(self.delete_old(&entry, min_age, now));
            }
            Request::DeleteEntry { entry, reply } => {
                self.delete_entry(&entry);
                let _ = reply.send(());
            }
            Request::DeleteByObjectUid { uid, reply } => {
                let removed = self.by_object.get(&uid).cloned().and_then(|key| self.remove(&key));
                let _ = reply.send(removed);
            }
            Request::DeleteByEnvironment { env_uid, reply } => {
                let _ = reply.send(self.delete_matching(|entry| entry.environment.uid == env_uid));
            }
            Request::DeleteByFunctionUid { uid, reply } => {
                let _ = reply.send(self.delete_matching(|entry| entry.function.uid == uid));
            }
            Request::Acquire { key, reply } => {
                let _ = reply.send(self.acquire(&key, now));
            }
            Request::Release { address, reply } => {
                let _ = reply.send(self.release(&address));
            }
            Request::ListAll { reply } => {
                let _ = reply.send(self.by_function.values().cloned().collect());
            }
        }
    }

    #[cfg(test)]
    fn assert_consistent(&self) {
        for (key, entry) in &self.by_function {
            assert_eq!(&entry.key(), key);
            assert_eq!(self.by_address.get(&entry.address), Some(key));
            for obj in &entry.kube_objects {
                assert_eq!(self.by_object.get(&obj.uid), Some(key));
            }
        }
        assert!(self.by_address.values().all(|k| self.by_function.contains_key(k)));
        assert!(self.by_object.values().all(|k| self.by_function.contains_key(k)));
        assert!(self.aliases.values().all(|k| self.by_function.contains_key(k)));
    }
}

fn cache_stopped() -> ExecutorError {
    ExecutorError::Internal(anyhow::anyhow!("function service cache stopped"))
}

/// Handle to the cache task. Clones share the same cache; the task exits
/// once every handle is dropped.
#[derive(Clone)]
pub struct FunctionServiceCache {
    tx: mpsc::Sender<Request>,
}

impl Default for FunctionServiceCache {
    fn default() -> Self {
        Self::new()
    }
}

impl FunctionServiceCache {
    pub fn new() -> Self {
        let (tx, mut rx) = mpsc::channel::<Request>(1024);
        tokio::spawn(async move {
            let mut state = CacheState::default();
            while let Some(request) = rx.recv().await {
                state.handle(request);
            }
            debug!("function service cache stopped");
        });
        Self { tx }
    }

    async fn call<R>(&self, request: impl FnOnce(oneshot::Sender<R>) -> Request) -> ExecutorResult<R> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(request(reply))
            .await
            .map_err(|_| cache_stopped())?;
        rx.await.map_err(|_| cache_stopped())
    }

    /// Returns the entry for `key`, or the entry it is aliased to, and marks
    /// it as used.
    pub async fn get_by_function(&self, key: &FunctionKey) -> ExecutorResult<FuncSvc> {
        let key = key.clone();
        self.call(|reply| Request::GetByFunction {
            key: key.clone(),
            reply,
        })
        .await?
        .ok_or_else(|| ExecutorError::not_found(format!("function service {key} not found")))
    }

    /// Latest-generation entry of a function, regardless of its key.
    pub async fn get_by_function_uid(&self, uid: &str) -> ExecutorResult<FuncSvc> {
        self.call(|reply| Request::GetByFunctionUid {
            uid: uid.to_string(),
            reply,
        })
        .await?
        .ok_or_else(|| ExecutorError::not_found(format!("function service for uid {uid} not found")))
    }

    pub async fn add(&self, entry: FuncSvc) -> ExecutorResult<AddResult> {
        self.call(|reply| Request::Add { entry, reply }).await
    }

    pub async fn touch_by_address(&self, address: &str) -> ExecutorResult<()> {
        let found = self
            .call(|reply| Request::TouchByAddress {
                address: address.to_string(),
                reply,
            })
            .await?;
        if !found {
            return Err(ExecutorError::not_found(format!(
                "no function service at {address}"
            )));
        }
        Ok(())
    }

    /// Entries idle for longer than `age`.
    pub async fn list_old(&self, age: Duration) -> ExecutorResult<Vec<FuncSvc>> {
        self.call(|reply| Request::ListOld { age, reply }).await
    }

    /// Deletes `entry` only if the stored copy is still at least `min_age`
    /// idle. Returns whether it was deleted.
    pub async fn delete_old(&self, entry: &FuncSvc, min_age: Duration) -> ExecutorResult<bool> {
        self.call(|reply| Request::DeleteOld {
            entry: entry.clone(),
            min_age,
            reply,
        })
        .await
    }

    pub async fn delete_entry(&self, entry: &FuncSvc) -> ExecutorResult<()> {
        self.call(|reply| Request::DeleteEntry {
            entry: entry.clone(),
            reply,
        })
        .await
    }

    pub async fn delete_by_object_uid(&self, uid: &str) -> ExecutorResult<Option<FuncSvc>> {
        self.call(|reply| Request::DeleteByObjectUid {
            uid: uid.to_string(),
            reply,
        })
        .await
    }

    pub async fn delete_by_environment(&self, env_uid: &str) -> ExecutorResult<Vec<FuncSvc>> {
        self.call(|reply| Request::DeleteByEnvironment {
            env_uid: env_uid.to_string(),
            reply,
        })
        .await
    }

    /// Removes the entries of every generation of a function.
    pub async fn delete_by_function_uid(&self, uid: &str) -> ExecutorResult<Vec<FuncSvc>> {
        self.call(|reply| Request::DeleteByFunctionUid {
            uid: uid.to_string(),
            reply,
        })
        .await
    }

    /// Takes one request slot on the entry for `key`.
    pub async fn acquire(&self, key: &FunctionKey) -> ExecutorResult<FuncSvc> {
        self.call(|reply| Request::Acquire {
            key: key.clone(),
            reply,
        })
        .await?
    }

    pub async fn release(&self, address: &str) -> ExecutorResult<()> {
        let found = self
            .call(|reply| Request::Release {
                address: address.to_string(),
                reply,
            })
            .await?;
        if !found {
            return Err(ExecutorError::not_found(format!(
                "no function service at {address}"
            )));
        }
        Ok(())
    }

    pub async fn list_all(&self) -> ExecutorResult<Vec<FuncSvc>> {
        self.call(|reply| Request::ListAll { reply }).await
    }

    pub async fn log(&self) -> ExecutorResult<()> {
        let now = Instant::now();
        let entries = self.list_all().await?;
        info!(entries = entries.len(), "function service cache dump");
        for entry in entries {
            info!(
                function_name = %entry.function.name,
                function_namespace = %entry.function.namespace,
                key = %entry.key(),
                address = %entry.address,
                executor = %entry.executor,
                idle_secs = entry.idle_for(now).as_secs(),
                active_requests = entry.active_requests,
                "cached function service"
            );
        }
        Ok(())
    }
}
