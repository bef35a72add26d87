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

//! Watch-driven controller loop: informers feed a keyed work queue, workers
//! drain it through a [`Reconciler`].

use crate::cdi::client::{ClientError, ClusterClient, WatchStream};
use crate::cdi::config::Settings;
use crate::cdi::controller::reconcile::{ReconcileOutcome, Reconciler};
use crate::cdi::controller::runtime::{ObjectKey, WorkQueue};
use crate::cdi::k8s::resource::ResourceKind;
use crate::cdi::logger::{log_debug, log_info, log_warn};
use crate::cdi::observability::metrics::{record_controller_reconcile, ControllerReconcileResult};
use crate::cdi::observability::tracing::with_span;
use crate::cdi::scheduler::{JobResult, ScheduleSpec, ScheduledTaskHandle, Scheduler};
use futures_util::StreamExt;
use serde_json::Value;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

const COMPONENT: &str = "controller";
const BACKOFF_INITIAL_MS: u64 = 200;
const BACKOFF_MAX_MS: u64 = 10_000;

type KeyMapper = Arc<dyn Fn(&Value) -> Vec<ObjectKey> + Send + Sync>;

/// How an event on a watched kind turns into work items.
#[derive(Clone)]
enum Mapping {
    Object(KeyMapper),
    /// Every object of the target kind in the event object's namespace.
    Namespace(ResourceKind),
    /// Every object of the target kind in the cluster.
    All(ResourceKind),
}

#[derive(Clone)]
pub struct WatchSpec {
    kind: ResourceKind,
    mapping: Mapping,
}

pub fn object_key(object: &Value) -> Option<ObjectKey> {
    let metadata = object.get("metadata")?;
    let name = metadata.get("name")?.as_str()?;
    let namespace = metadata
        .get("namespace")
        .and_then(Value::as_str)
        .unwrap_or_default();
    Some(ObjectKey::new(namespace, name))
}

impl WatchSpec {
    /// Events map to the object's own key.
    pub fn primary(kind: ResourceKind) -> Self {
        Self::mapped(kind, |object| object_key(object).into_iter().collect())
    }

    /// Events map to the owners of the given kind, in the object's namespace.
    pub fn owned_by(kind: ResourceKind, owner: ResourceKind) -> Self {
        Self::mapped(kind, move |object| {
            let namespace = object
                .pointer("/metadata/namespace")
                .and_then(Value::as_str)
                .unwrap_or_default();
            object
                .pointer("/metadata/ownerReferences")
                .and_then(Value::as_array)
                .map(|owners| {
                    owners
                        .iter()
                        .filter(|owner_ref| {
                            owner_ref.get("kind").and_then(Value::as_str) == Some(owner.kind())
                        })
                        .filter_map(|owner_ref| owner_ref.get("name").and_then(Value::as_str))
                        .map(|name| {
                            if owner.namespaced() {
                                ObjectKey::new(namespace, name)
                            } else {
                                ObjectKey::cluster(name)
                            }
                        })
                        .collect()
                })
                .unwrap_or_default()
        })
    }

    pub fn mapped<F>(kind: ResourceKind, mapper: F) -> Self
    where
        F: Fn(&Value) -> Vec<ObjectKey> + Send + Sync + 'static,
    {
        WatchSpec {
            kind,
            mapping: Mapping::Object(Arc::new(mapper)),
        }
    }

    pub fn namespace_of(kind: ResourceKind, target: ResourceKind) -> Self {
        WatchSpec {
            kind,
            mapping: Mapping::Namespace(target),
        }
    }

    pub fn all_of(kind: ResourceKind, target: ResourceKind) -> Self {
        WatchSpec {
            kind,
            mapping: Mapping::All(target),
        }
    }

    async fn enqueue(&self, client: &dyn ClusterClient, object: &Value, queue: &WorkQueue<ObjectKey>) {
        match &self.mapping {
            Mapping::Object(mapper) => {
                for key in mapper(object) {
                    queue.add(key);
                }
            }
            Mapping::Namespace(target) => {
                let namespace = object
                    .pointer("/metadata/namespace")
                    .and_then(Value::as_str)
                    .filter(|ns| !ns.is_empty());
                enqueue_listed(client, *target, namespace, queue).await;
            }
            Mapping::All(target) => enqueue_listed(client, *target, None, queue).await,
        }
    }
}

async fn enqueue_listed(
    client: &dyn ClusterClient,
    kind: ResourceKind,
    namespace: Option<&str>,
    queue: &WorkQueue<ObjectKey>,
) {
    match client.list(kind, namespace, None).await {
        Ok(objects) => {
            for key in objects.iter().filter_map(object_key) {
                queue.add(key);
            }
        }
        Err(err) => {
            let error = err.to_string();
            log_warn(
                COMPONENT,
                "Failed to list objects for requeue",
                &[("kind", kind.kind()), ("error", error.as_str())],
            );
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct ControllerOptions {
    pub workers: usize,
    pub reconcile_timeout: Duration,
}

impl Default for ControllerOptions {
    fn default() -> Self {
        ControllerOptions {
            workers: 3,
            reconcile_timeout: Duration::from_secs(180),
        }
    }
}

impl From<&Settings> for ControllerOptions {
    fn from(settings: &Settings) -> Self {
        ControllerOptions {
            workers: settings.workers.max(1),
            reconcile_timeout: settings.reconcile_timeout,
        }
    }
}

pub struct Controller {
    reconciler: Arc<dyn Reconciler>,
    watches: Vec<WatchSpec>,
    queue: WorkQueue<ObjectKey>,
    options: ControllerOptions,
}

impl Controller {
    pub fn new(reconciler: Arc<dyn Reconciler>, options: ControllerOptions) -> Self {
        Controller {
            reconciler,
            watches: Vec::new(),
            queue: WorkQueue::new(),
            options,
        }
    }

    pub fn watch(mut self, spec: WatchSpec) -> Self {
        self.watches.push(spec);
        self
    }

    pub fn name(&self) -> &'static str {
        self.reconciler.name()
    }

    pub fn queue(&self) -> WorkQueue<ObjectKey> {
        self.queue.clone()
    }

    /// Routes one object of `kind` through every watch on that kind into the
    /// work queue, as a watch event would.
    pub async fn observe(&self, client: &dyn ClusterClient, kind: ResourceKind, object: &Value) {
        for spec in self.watches.iter().filter(|spec| spec.kind == kind) {
            spec.enqueue(client, object, &self.queue).await;
        }
    }

    /// One synchronous pass: lists every watched kind, maps the objects to
    /// keys and reconciles each key once on the calling task. Returns the
    /// number of keys processed.
    pub async fn reconcile_listed(&self, client: &Arc<dyn ClusterClient>) -> usize {
        let queue = WorkQueue::new();
        for spec in &self.watches {
            enqueue_listed_spec(client.as_ref(), spec, &queue).await;
        }
        let mut processed = 0;
        while !queue.is_empty() {
            let Some(key) = queue.get().await else {
                break;
            };
            if let Err(err) = self.reconciler.reconcile(&key).await {
                let error = err.to_string();
                let key_label = key.to_string();
                log_debug(
                    COMPONENT,
                    "Reconcile pass failed",
                    &[
                        ("controller", self.name()),
                        ("key", key_label.as_str()),
                        ("error", error.as_str()),
                    ],
                );
            }
            queue.done(&key);
            processed += 1;
        }
        processed
    }

    /// Opens every watch, lists each kind once (the sync gate), then runs
    /// workers until `shutdown` fires.
    pub async fn run(
        self,
        client: Arc<dyn ClusterClient>,
        shutdown: CancellationToken,
    ) -> Result<(), ClientError> {
        let name = self.reconciler.name();
        let mut streams = Vec::with_capacity(self.watches.len());
        for spec in &self.watches {
            streams.push(client.watch(spec.kind).await?);
        }
        for spec in &self.watches {
            for object in client.list(spec.kind, None, None).await? {
                spec.enqueue(client.as_ref(), &object, &self.queue).await;
            }
        }
        let workers = self.options.workers.max(1).to_string();
        log_info(
            COMPONENT,
            "Caches synced; starting workers",
            &[("controller", name), ("workers", workers.as_str())],
        );

        let mut watch_tasks = Vec::with_capacity(streams.len());
        for (spec, stream) in self.watches.iter().cloned().zip(streams) {
            watch_tasks.push(spawn_watch(
                name,
                Arc::clone(&client),
                spec,
                stream,
                self.queue.clone(),
            ));
        }

        let mut worker_tasks = Vec::with_capacity(self.options.workers.max(1));
        for _ in 0..self.options.workers.max(1) {
            let queue = self.queue.clone();
            let reconciler = Arc::clone(&self.reconciler);
            let timeout = self.options.reconcile_timeout;
            worker_tasks.push(tokio::spawn(async move {
                while let Some(key) = queue.get().await {
                    process_key(reconciler.as_ref(), &queue, key, timeout).await;
                }
            }));
        }

        shutdown.cancelled().await;
        self.queue.shutdown();
        for task in &watch_tasks {
            task.cancel_and_abort();
        }
        for task in worker_tasks {
            let _ = task.await;
        }
        log_info(COMPONENT, "Controller stopped", &[("controller", name)]);
        Ok(())
    }
}

fn spawn_watch(
    controller: &'static str,
    client: Arc<dyn ClusterClient>,
    spec: WatchSpec,
    stream: WatchStream,
    queue: WorkQueue<ObjectKey>,
) -> ScheduledTaskHandle {
    let initial = Arc::new(Mutex::new(Some(stream)));
    Scheduler::global().schedule(
        ScheduleSpec::Immediate {
            label: "controller.watch-loop",
        },
        move |ctx| {
            let client = Arc::clone(&client);
            let spec = spec.clone();
            let queue = queue.clone();
            let stream = initial
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .take();
            Box::pin(async move {
                let cancellation = ctx.cancellation_token();
                tokio::select! {
                    _ = cancellation.cancelled() => {}
                    _ = run_watch_loop(controller, client, spec, stream, queue) => {}
                }
                JobResult::Stop
            })
        },
    )
}

async fn run_watch_loop(
    controller: &'static str,
    client: Arc<dyn ClusterClient>,
    spec: WatchSpec,
    mut stream: Option<WatchStream>,
    queue: WorkQueue<ObjectKey>,
) {
    let mut backoff = Duration::from_millis(BACKOFF_INITIAL_MS);
    loop {
        if let Some(mut events) = stream.take() {
            while let Some(event) = events.next().await {
                match event {
                    Ok(event) => {
                        backoff = Duration::from_millis(BACKOFF_INITIAL_MS);
                        spec.enqueue(client.as_ref(), &event.object, &queue).await;
                    }
                    Err(err) => {
                        let error = err.to_string();
                        log_debug(
                            COMPONENT,
                            "Watch stream error",
                            &[
                                ("controller", controller),
                                ("kind", spec.kind.kind()),
                                ("error", error.as_str()),
                            ],
                        );
                        break;
                    }
                }
            }
        }
        if queue.is_shutting_down() {
            return;
        }

        tokio::time::sleep(backoff).await;
        backoff = (backoff * 2).min(Duration::from_millis(BACKOFF_MAX_MS));

        // Events may have been missed while disconnected: re-watch, then relist.
        match client.watch(spec.kind).await {
            Ok(events) => {
                stream = Some(events);
                enqueue_listed_spec(client.as_ref(), &spec, &queue).await;
            }
            Err(err) => {
                let error = err.to_string();
                log_warn(
                    COMPONENT,
                    "Failed to re-establish watch",
                    &[
                        ("controller", controller),
                        ("kind", spec.kind.kind()),
                        ("error", error.as_str()),
                    ],
                );
            }
        }
    }
}

async fn enqueue_listed_spec(client: &dyn ClusterClient, spec: &WatchSpec, queue: &WorkQueue<ObjectKey>) {
    if let Ok(objects) = client.list(spec.kind, None, None).await {
        for object in &objects {
            spec.enqueue(client, object, queue).await;
        }
    }
}

async fn process_key(
    reconciler: &dyn Reconciler,
    queue: &WorkQueue<ObjectKey>,
    key: ObjectKey,
    timeout: Duration,
) {
    let name = reconciler.name();
    let started = Instant::now();
    let span_name = format!("reconcile {key}");
    let result = tokio::time::timeout(
        timeout,
        with_span(name, span_name, reconciler.reconcile(&key)),
    )
    .await;
    let key_label = key.to_string();

    match result {
        Ok(Ok(ReconcileOutcome::Done)) => {
            queue.forget(&key);
            record_controller_reconcile(name, ControllerReconcileResult::Success, started.elapsed());
        }
        Ok(Ok(ReconcileOutcome::RequeueAfter(delay))) => {
            queue.forget(&key);
            queue.add_after(key.clone(), delay);
            record_controller_reconcile(name, ControllerReconcileResult::Requeue, started.elapsed());
        }
        Ok(Err(err)) => {
            let error = err.to_string();
            let fields = [
                ("controller", name),
                ("key", key_label.as_str()),
                ("error", error.as_str()),
            ];
            if err.is_conflict() {
                log_debug(COMPONENT, "Reconcile conflicted; retrying", &fields);
            } else {
                log_warn(COMPONENT, "Reconcile failed", &fields);
            }
            queue.add_rate_limited(key.clone());
            record_controller_reconcile(name, ControllerReconcileResult::Error, started.elapsed());
        }
        Err(_) => {
            log_warn(
                COMPONENT,
                "Reconcile timed out",
                &[("controller", name), ("key", key_label.as_str())],
            );
            queue.add_rate_limited(key.clone());
            record_controller_reconcile(name, ControllerReconcileResult::Error, started.elapsed());
        }
    }
    queue.done(&key);
}
