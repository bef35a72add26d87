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

//! In-process cluster used by tests and by `cdi controller --in-memory`.
//! Mirrors the API server semantics the controllers depend on: optimistic
//! concurrency, finalizers, owner cascade, quota and watches.

use super::selector::LabelSelector;
use super::{ClientError, ClientFuture, ClusterClient, WatchStream};
use crate::cdi::controller::runtime::{WatchEvent, WATCH_ADDED, WATCH_DELETED, WATCH_MODIFIED};
use crate::cdi::k8s::authorization::{
    SubjectAccessReview, SubjectAccessReviewSpec, SubjectAccessReviewStatus,
};
use crate::cdi::k8s::resource::ResourceKind;
use crate::cdi::util::naming::{new_uid, random_suffix};
use crate::cdi::util::quantity::parse_quantity;
use crate::cdi::util::time::now_rfc3339;
use futures_util::StreamExt;
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

const WATCH_BUFFER_SIZE: usize = 1024;

type ObjectKey = (ResourceKind, String, String);

/// Decides access reviews; `Err` carries the denial reason.
pub type AccessPolicy = Arc<dyn Fn(&SubjectAccessReviewSpec) -> Result<(), String> + Send + Sync>;

#[derive(Default)]
struct State {
    objects: BTreeMap<ObjectKey, Value>,
    resource_version: u64,
}

pub struct InMemoryCluster {
    state: Mutex<State>,
    watchers: Mutex<HashMap<ResourceKind, broadcast::Sender<WatchEvent<Value>>>>,
    access_policy: RwLock<AccessPolicy>,
    preserve_data_source_ref: AtomicBool,
}

impl Default for InMemoryCluster {
    fn default() -> Self {
        InMemoryCluster {
            state: Mutex::new(State::default()),
            watchers: Mutex::new(HashMap::new()),
            access_policy: RwLock::new(Arc::new(|_| Ok(()))),
            preserve_data_source_ref: AtomicBool::new(true),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn meta_field<'v>(object: &'v Value, field: &str) -> Option<&'v str> {
    object.get("metadata")?.get(field)?.as_str()
}

fn metadata_mut(object: &mut Value) -> Result<&mut Map<String, Value>, ClientError> {
    let root = object
        .as_object_mut()
        .ok_or_else(|| ClientError::Invalid("object must be a JSON map".to_string()))?;
    root.entry("metadata")
        .or_insert_with(|| json!({}))
        .as_object_mut()
        .ok_or_else(|| ClientError::Invalid("metadata must be a JSON map".to_string()))
}

fn is_deleting(object: &Value) -> bool {
    meta_field(object, "deletionTimestamp").is_some()
}

fn has_finalizers(object: &Value) -> bool {
    object
        .pointer("/metadata/finalizers")
        .and_then(Value::as_array)
        .map(|finalizers| !finalizers.is_empty())
        .unwrap_or(false)
}

fn owner_uids(object: &Value) -> Vec<String> {
    object
        .pointer("/metadata/ownerReferences")
        .and_then(Value::as_array)
        .map(|owners| {
            owners
                .iter()
                .filter_map(|owner| owner.get("uid").and_then(Value::as_str))
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn labels_of(object: &Value) -> HashMap<String, String> {
    object
        .pointer("/metadata/labels")
        .cloned()
        .and_then(|labels| serde_json::from_value(labels).ok())
        .unwrap_or_default()
}

fn pod_is_terminal(object: &Value) -> bool {
    matches!(
        object.pointer("/status/phase").and_then(Value::as_str),
        Some("Succeeded") | Some("Failed")
    )
}

fn stamp_type(kind: ResourceKind, object: &mut Value) {
    if let Some(root) = object.as_object_mut() {
        root.insert("apiVersion".to_string(), Value::String(kind.api_version()));
        root.insert("kind".to_string(), Value::String(kind.kind().to_string()));
    }
}

impl InMemoryCluster {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Replaces the access-review decision function.
    pub fn set_access_policy<F>(&self, policy: F)
    where
        F: Fn(&SubjectAccessReviewSpec) -> Result<(), String> + Send + Sync + 'static,
    {
        let mut guard = self
            .access_policy
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = Arc::new(policy);
    }

    /// When false the cluster drops `spec.dataSourceRef` from new claims,
    /// like an API server without the any-volume-data-source feature.
    pub fn set_preserve_data_source_ref(&self, preserve: bool) {
        self.preserve_data_source_ref
            .store(preserve, Ordering::SeqCst);
    }

    /// Every stored object of a kind across namespaces.
    pub fn objects(&self, kind: ResourceKind) -> Vec<Value> {
        let state = lock(&self.state);
        state
            .objects
            .iter()
            .filter(|((candidate, _, _), _)| *candidate == kind)
            .map(|(_, object)| object.clone())
            .collect()
    }

    fn namespace_of(kind: ResourceKind, object: &Value) -> Result<String, ClientError> {
        if !kind.namespaced() {
            return Ok(String::new());
        }
        meta_field(object, "namespace")
            .filter(|namespace| !namespace.is_empty())
            .map(str::to_string)
            .ok_or_else(|| {
                ClientError::Invalid(format!("{} requires metadata.namespace", kind.kind()))
            })
    }

    fn scoped(kind: ResourceKind, namespace: Option<&str>) -> String {
        if kind.namespaced() {
            namespace.unwrap_or_default().to_string()
        } else {
            String::new()
        }
    }

    fn publish(&self, kind: ResourceKind, event_type: &str, object: &Value) {
        let watchers = lock(&self.watchers);
        if let Some(sender) = watchers.get(&kind) {
            let _ = sender.send(WatchEvent {
                event_type: event_type.to_string(),
                object: object.clone(),
            });
        }
    }

    fn check_pod_quota(state: &State, namespace: &str) -> Result<(), ClientError> {
        let used = state
            .objects
            .iter()
            .filter(|((kind, ns, _), object)| {
                *kind == ResourceKind::Pod && ns == namespace && !pod_is_terminal(object)
            })
            .count() as i64;
        for ((kind, ns, name), quota) in &state.objects {
            if *kind != ResourceKind::ResourceQuota || ns != namespace {
                continue;
            }
            let Some(limit) = quota
                .pointer("/spec/hard/pods")
                .and_then(Value::as_str)
                .and_then(|value| parse_quantity(value).ok())
            else {
                continue;
            };
            if used + 1 > limit {
                return Err(ClientError::Forbidden(format!(
                    "pods is forbidden: exceeded quota: {name}, requested: pods=1, used: pods={used}, limited: pods={limit}"
                )));
            }
        }
        Ok(())
    }

    fn create_object(&self, kind: ResourceKind, mut object: Value) -> Result<Value, ClientError> {
        let namespace = Self::namespace_of(kind, &object)?;
        {
            let meta = metadata_mut(&mut object)?;
            let named = meta
                .get("name")
                .and_then(Value::as_str)
                .map(|name| !name.is_empty())
                .unwrap_or(false);
            if !named {
                let prefix = meta
                    .get("generateName")
                    .and_then(Value::as_str)
                    .filter(|prefix| !prefix.is_empty())
                    .map(str::to_string)
                    .ok_or_else(|| {
                        ClientError::Invalid("metadata.name or generateName is required".into())
                    })?;
                meta.insert(
                    "name".to_string(),
                    Value::String(format!("{prefix}{}", random_suffix(5))),
                );
            }
        }
        let name = meta_field(&object, "name").unwrap_or_default().to_string();

        let mut state = lock(&self.state);
        let key = (kind, namespace, name);
        if state.objects.contains_key(&key) {
            return Err(ClientError::AlreadyExists);
        }
        if kind == ResourceKind::Pod {
            Self::check_pod_quota(&state, &key.1)?;
        }
        if kind == ResourceKind::PersistentVolumeClaim
            && !self.preserve_data_source_ref.load(Ordering::SeqCst)
        {
            if let Some(spec) = object.get_mut("spec").and_then(Value::as_object_mut) {
                spec.remove("dataSourceRef");
            }
        }

        state.resource_version += 1;
        let resource_version = state.resource_version.to_string();
        let meta = metadata_mut(&mut object)?;
        meta.insert("uid".to_string(), Value::String(new_uid()));
        meta.insert("resourceVersion".to_string(), Value::String(resource_version));
        meta.insert("creationTimestamp".to_string(), Value::String(now_rfc3339()));
        meta.insert("generation".to_string(), json!(1));
        meta.remove("deletionTimestamp");
        stamp_type(kind, &mut object);

        state.objects.insert(key, object.clone());
        self.publish(kind, WATCH_ADDED, &object);
        Ok(object)
    }

    fn replace_object(
        &self,
        kind: ResourceKind,
        mut object: Value,
        status_only: bool,
    ) -> Result<Value, ClientError> {
        let namespace = Self::namespace_of(kind, &object)?;
        let name = meta_field(&object, "name")
            .filter(|name| !name.is_empty())
            .ok_or_else(|| ClientError::Invalid("metadata.name is required".to_string()))?
            .to_string();

        let mut state = lock(&self.state);
        let key = (kind, namespace, name);
        let stored = state
            .objects
            .get(&key)
            .cloned()
            .ok_or(ClientError::NotFound)?;
        if let Some(version) = meta_field(&object, "resourceVersion").filter(|v| !v.is_empty()) {
            if Some(version) != meta_field(&stored, "resourceVersion") {
                return Err(ClientError::Conflict);
            }
        }

        let mut next = if status_only {
            let mut next = stored.clone();
            if let Some(root) = next.as_object_mut() {
                match object.get("status") {
                    Some(status) => root.insert("status".to_string(), status.clone()),
                    None => root.remove("status"),
                };
            }
            next
        } else {
            if kind.has_status_subresource() {
                if let Some(root) = object.as_object_mut() {
                    match stored.get("status") {
                        Some(status) => root.insert("status".to_string(), status.clone()),
                        None => root.remove("status"),
                    };
                }
            }
            let mut generation = stored
                .pointer("/metadata/generation")
                .and_then(Value::as_i64)
                .unwrap_or(1);
            if object.get("spec") != stored.get("spec") {
                generation += 1;
            }
            let meta = metadata_mut(&mut object)?;
            for field in ["uid", "creationTimestamp", "deletionTimestamp"] {
                match stored.get("metadata").and_then(|m| m.get(field)) {
                    Some(value) => meta.insert(field.to_string(), value.clone()),
                    None => meta.remove(field),
                };
            }
            meta.insert("generation".to_string(), json!(generation));
            object
        };

        state.resource_version += 1;
        let resource_version = state.resource_version.to_string();
        metadata_mut(&mut next)?.insert(
            "resourceVersion".to_string(),
            Value::String(resource_version),
        );
        stamp_type(kind, &mut next);

        if is_deleting(&next) && !has_finalizers(&next) {
            state.objects.remove(&key);
            self.publish(kind, WATCH_DELETED, &next);
            self.cascade(&mut state, &next);
            return Ok(next);
        }
        state.objects.insert(key, next.clone());
        self.publish(kind, WATCH_MODIFIED, &next);
        Ok(next)
    }

    fn delete_key(&self, state: &mut State, key: ObjectKey) -> Result<(), ClientError> {
        let mut object = state
            .objects
            .get(&key)
            .cloned()
            .ok_or(ClientError::NotFound)?;
        if has_finalizers(&object) {
            if !is_deleting(&object) {
                state.resource_version += 1;
                let resource_version = state.resource_version.to_string();
                let meta = metadata_mut(&mut object)?;
                meta.insert("deletionTimestamp".to_string(), Value::String(now_rfc3339()));
                meta.insert("resourceVersion".to_string(), Value::String(resource_version));
                state.objects.insert(key.clone(), object.clone());
                self.publish(key.0, WATCH_MODIFIED, &object);
            }
            return Ok(());
        }
        state.objects.remove(&key);
        self.publish(key.0, WATCH_DELETED, &object);
        self.cascade(state, &object);
        Ok(())
    }

    /// Removes dependents whose owners are all gone.
    fn cascade(&self, state: &mut State, owner: &Value) {
        let Some(uid) = meta_field(owner, "uid").map(str::to_string) else {
            return;
        };
        let live: Vec<String> = state
            .objects
            .values()
            .filter_map(|object| meta_field(object, "uid").map(str::to_string))
            .collect();
        let orphans: Vec<ObjectKey> = state
            .objects
            .iter()
            .filter(|(_, object)| {
                let owners = owner_uids(object);
                owners.contains(&uid) && !owners.iter().any(|owner| live.contains(owner))
            })
            .map(|(key, _)| key.clone())
            .collect();
        for key in orphans {
            let _ = self.delete_key(state, key);
        }
    }

    fn review(&self, mut review: SubjectAccessReview) -> SubjectAccessReview {
        let policy = self
            .access_policy
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        review.status = Some(match policy(&review.spec) {
            Ok(()) => SubjectAccessReviewStatus {
                allowed: true,
                denied: false,
                reason: None,
            },
            Err(reason) => SubjectAccessReviewStatus {
                allowed: false,
                denied: true,
                reason: Some(reason),
            },
        });
        review
    }
}

impl ClusterClient for InMemoryCluster {
    fn get<'a>(
        &'a self,
        kind: ResourceKind,
        namespace: Option<&'a str>,
        name: &'a str,
    ) -> ClientFuture<'a, Value> {
        Box::pin(async move {
            let state = lock(&self.state);
            state
                .objects
                .get(&(kind, Self::scoped(kind, namespace), name.to_string()))
                .cloned()
                .ok_or(ClientError::NotFound)
        })
    }

    fn list<'a>(
        &'a self,
        kind: ResourceKind,
        namespace: Option<&'a str>,
        selector: Option<&'a str>,
    ) -> ClientFuture<'a, Vec<Value>> {
        Box::pin(async move {
            let selector = LabelSelector::parse(selector.unwrap_or_default())
                .map_err(ClientError::Invalid)?;
            let namespace = namespace.filter(|_| kind.namespaced());
            let state = lock(&self.state);
            Ok(state
                .objects
                .iter()
                .filter(|((candidate, ns, _), _)| {
                    *candidate == kind && namespace.map(|wanted| wanted == ns).unwrap_or(true)
                })
                .filter(|(_, object)| selector.matches(&labels_of(object)))
                .map(|(_, object)| object.clone())
                .collect())
        })
    }

    fn create(&self, kind: ResourceKind, object: Value) -> ClientFuture<'_, Value> {
        Box::pin(async move { self.create_object(kind, object) })
    }

    fn update(&self, kind: ResourceKind, object: Value) -> ClientFuture<'_, Value> {
        Box::pin(async move { self.replace_object(kind, object, false) })
    }

    fn update_status(&self, kind: ResourceKind, object: Value) -> ClientFuture<'_, Value> {
        Box::pin(async move { self.replace_object(kind, object, true) })
    }

    fn delete<'a>(
        &'a self,
        kind: ResourceKind,
        namespace: Option<&'a str>,
        name: &'a str,
    ) -> ClientFuture<'a, ()> {
        Box::pin(async move {
            let mut state = lock(&self.state);
            let key = (kind, Self::scoped(kind, namespace), name.to_string());
            self.delete_key(&mut state, key)
        })
    }

    fn watch(&self, kind: ResourceKind) -> ClientFuture<'_, WatchStream> {
        Box::pin(async move {
            let receiver = {
                let mut watchers = lock(&self.watchers);
                watchers
                    .entry(kind)
                    .or_insert_with(|| broadcast::channel(WATCH_BUFFER_SIZE).0)
                    .subscribe()
            };
            let stream = BroadcastStream::new(receiver).map(|item| {
                item.map_err(|err| ClientError::Transport(format!("watch interrupted: {err}")))
            });
            Ok(Box::pin(stream) as WatchStream)
        })
    }

    fn create_subject_access_review(
        &self,
        review: SubjectAccessReview,
    ) -> ClientFuture<'_, SubjectAccessReview> {
        Box::pin(async move { Ok(self.review(review)) })
    }
}
