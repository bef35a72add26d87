/*
 * Copyright (C) 2024 The Nanocloud Authors
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 * http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use crate::cdi::controller::reconcile::ReconcileContext;
use serde::{Deserialize, Serialize};
use std::any::{Any, TypeId};
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, RwLock as StdRwLock};
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

const BACKOFF_INITIAL_MS: u64 = 200;
const BACKOFF_MAX_MS: u64 = 10_000;

/// Generic Kubernetes-style watch event.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WatchEvent<T> {
    #[serde(rename = "type")]
    pub event_type: String,
    pub object: T,
}

pub const WATCH_ADDED: &str = "ADDED";
pub const WATCH_MODIFIED: &str = "MODIFIED";
pub const WATCH_DELETED: &str = "DELETED";

/// Controller manager runtime: shared dependencies plus the shutdown signal
/// every controller loop listens on.
pub struct ControllerRuntime {
    dependencies: DependencyRegistry,
    shutdown: CancellationToken,
}

impl ControllerRuntime {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            dependencies: DependencyRegistry::default(),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn register_dependency<T>(&self, dependency: Arc<T>) -> Option<Arc<T>>
    where
        T: Send + Sync + 'static,
    {
        self.dependencies.insert(dependency)
    }

    pub fn dependency<T>(&self) -> Option<Arc<T>>
    where
        T: Send + Sync + 'static,
    {
        self.dependencies.get::<T>()
    }

    pub fn context(self: &Arc<Self>) -> ReconcileContext {
        ReconcileContext::new(Arc::clone(self))
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

#[derive(Default)]
struct DependencyRegistry {
    values: StdRwLock<HashMap<TypeId, Arc<dyn Any + Send + Sync>>>,
}

impl DependencyRegistry {
    fn insert<T>(&self, dependency: Arc<T>) -> Option<Arc<T>>
    where
        T: Send + Sync + 'static,
    {
        let mut guard = self
            .values
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let existing = guard.insert(TypeId::of::<T>(), dependency as Arc<dyn Any + Send + Sync>);
        existing.and_then(|arc| arc.downcast::<T>().ok())
    }

    fn get<T>(&self) -> Option<Arc<T>>
    where
        T: Send + Sync + 'static,
    {
        let guard = self
            .values
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        guard
            .get(&TypeId::of::<T>())
            .and_then(|arc| arc.clone().downcast::<T>().ok())
    }
}

/// `(namespace, name)` work item. Cluster-scoped objects use an empty namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        ObjectKey {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    pub fn cluster(name: impl Into<String>) -> Self {
        ObjectKey::new(String::new(), name)
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() {
            f.write_str(&self.name)
        } else {
            write!(f, "{}/{}", self.namespace, self.name)
        }
    }
}

/// Keyed work queue. A key is handed to at most one worker at a time; adds
/// that arrive while it is being processed are coalesced and replayed by
/// [`WorkQueue::done`].
pub struct WorkQueue<K> {
    inner: Arc<WorkQueueInner<K>>,
}

impl<K> Clone for WorkQueue<K> {
    fn clone(&self) -> Self {
        WorkQueue {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct WorkQueueInner<K> {
    state: Mutex<QueueState<K>>,
    notify: Notify,
}

struct QueueState<K> {
    queue: VecDeque<K>,
    dirty: HashSet<K>,
    processing: HashSet<K>,
    failures: HashMap<K, u32>,
    shutting_down: bool,
}

impl<K> Default for WorkQueue<K>
where
    K: Clone + Eq + Hash + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K> WorkQueue<K>
where
    K: Clone + Eq + Hash + Send + 'static,
{
    pub fn new() -> Self {
        WorkQueue {
            inner: Arc::new(WorkQueueInner {
                state: Mutex::new(QueueState {
                    queue: VecDeque::new(),
                    dirty: HashSet::new(),
                    processing: HashSet::new(),
                    failures: HashMap::new(),
                    shutting_down: false,
                }),
                notify: Notify::new(),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, QueueState<K>> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn add(&self, key: K) {
        let mut state = self.state();
        if state.shutting_down || state.dirty.contains(&key) {
            return;
        }
        state.dirty.insert(key.clone());
        if state.processing.contains(&key) {
            return;
        }
        state.queue.push_back(key);
        drop(state);
        self.inner.notify.notify_one();
    }

    /// Waits for the next key; `None` once the queue is shut down.
    pub async fn get(&self) -> Option<K> {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut state = self.state();
                if state.shutting_down {
                    return None;
                }
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    let more = !state.queue.is_empty();
                    drop(state);
                    if more {
                        self.inner.notify.notify_one();
                    }
                    return Some(key);
                }
            }
            notified.await;
        }
    }

    pub fn done(&self, key: &K) {
        let mut state = self.state();
        state.processing.remove(key);
        if state.dirty.contains(key) && !state.shutting_down {
            state.queue.push_back(key.clone());
            drop(state);
            self.inner.notify.notify_one();
        }
    }

    pub fn add_after(&self, key: K, delay: Duration) {
        if delay.is_zero() {
            self.add(key);
            return;
        }
        let queue = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(key);
        });
    }

    /// Re-adds `key` after its per-key exponential backoff.
    pub fn add_rate_limited(&self, key: K) {
        let delay = {
            let mut state = self.state();
            let failures = state.failures.entry(key.clone()).or_insert(0);
            *failures = failures.saturating_add(1);
            backoff_delay(*failures)
        };
        self.add_after(key, delay);
    }

    pub fn forget(&self, key: &K) {
        self.state().failures.remove(key);
    }

    pub fn failures(&self, key: &K) -> u32 {
        self.state().failures.get(key).copied().unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.state().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn shutdown(&self) {
        self.state().shutting_down = true;
        self.inner.notify.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.state().shutting_down
    }
}

fn backoff_delay(failures: u32) -> Duration {
    let exponent = failures.saturating_sub(1).min(16);
    let millis = BACKOFF_INITIAL_MS
        .saturating_mul(1u64 << exponent)
        .min(BACKOFF_MAX_MS);
    Duration::from_millis(millis)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::timeout;

    #[test]
    fn registry_returns_registered_dependency() {
        let runtime = ControllerRuntime::new();
        assert!(runtime.register_dependency(Arc::new(7u32)).is_none());
        assert_eq!(runtime.dependency::<u32>().as_deref(), Some(&7));
        assert!(runtime.dependency::<String>().is_none());
    }

    #[tokio::test]
    async fn duplicate_adds_are_deduplicated() {
        let queue = WorkQueue::new();
        queue.add(ObjectKey::new("ns", "a"));
        queue.add(ObjectKey::new("ns", "a"));
        queue.add(ObjectKey::new("ns", "b"));
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.get().await, Some(ObjectKey::new("ns", "a")));
    }

    #[tokio::test]
    async fn key_in_flight_is_not_handed_out_twice() {
        let queue = WorkQueue::new();
        let key = ObjectKey::new("ns", "a");
        queue.add(key.clone());
        let first = queue.get().await.expect("key");
        queue.add(key.clone());
        assert!(queue.is_empty());
        assert!(timeout(Duration::from_millis(50), queue.get()).await.is_err());

        queue.done(&first);
        let again = timeout(Duration::from_millis(50), queue.get())
            .await
            .expect("re-added after done");
        assert_eq!(again, Some(key));
    }

    #[tokio::test]
    async fn shutdown_releases_waiting_workers() {
        let queue: WorkQueue<ObjectKey> = WorkQueue::new();
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.get().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.shutdown();
        let result = timeout(Duration::from_secs(1), waiter)
            .await
            .expect("worker released")
            .expect("join");
        assert!(result.is_none());
    }

    #[test]
    fn backoff_doubles_up_to_cap() {
        assert_eq!(backoff_delay(1), Duration::from_millis(200));
        assert_eq!(backoff_delay(2), Duration::from_millis(400));
        assert_eq!(backoff_delay(6), Duration::from_millis(6_400));
        assert_eq!(backoff_delay(7), Duration::from_millis(10_000));
        assert_eq!(backoff_delay(40), Duration::from_millis(10_000));
    }

    #[tokio::test]
    async fn rate_limited_add_tracks_failures_until_forgotten() {
        let queue = WorkQueue::new();
        let key = ObjectKey::cluster("profile");
        queue.add_rate_limited(key.clone());
        queue.add_rate_limited(key.clone());
        assert_eq!(queue.failures(&key), 2);
        let next = timeout(Duration::from_secs(2), queue.get())
            .await
            .expect("delayed add fires");
        assert_eq!(next, Some(key.clone()));
        queue.forget(&key);
        assert_eq!(queue.failures(&key), 0);
    }
}
