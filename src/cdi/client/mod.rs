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

//! Access to the orchestrator API. Controllers talk to the cluster only
//! through [`ClusterClient`]; [`Api`] adds typed encode/decode on top.

pub mod http;
pub mod memory;
pub mod selector;

use crate::cdi::controller::runtime::WatchEvent;
use crate::cdi::k8s::authorization::SubjectAccessReview;
use crate::cdi::k8s::resource::{Resource, ResourceKind};
use futures_util::Stream;
use serde_json::Value;
use std::error::Error;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;

pub use http::HttpClusterClient;
pub use memory::InMemoryCluster;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    NotFound,
    AlreadyExists,
    Conflict,
    Forbidden(String),
    Invalid(String),
    Transport(String),
    Decode(String),
}

impl ClientError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, ClientError::Conflict)
    }

    /// Namespace quota rejections surface as `Forbidden` with this marker.
    pub fn is_quota_exceeded(&self) -> bool {
        matches!(self, ClientError::Forbidden(reason) if reason.contains("exceeded quota"))
    }
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientError::NotFound => write!(f, "not found"),
            ClientError::AlreadyExists => write!(f, "already exists"),
            ClientError::Conflict => write!(f, "conflict: object has been modified"),
            ClientError::Forbidden(reason) => write!(f, "forbidden: {reason}"),
            ClientError::Invalid(reason) => write!(f, "invalid: {reason}"),
            ClientError::Transport(reason) => write!(f, "transport error: {reason}"),
            ClientError::Decode(reason) => write!(f, "decode error: {reason}"),
        }
    }
}

impl Error for ClientError {}

impl From<serde_json::Error> for ClientError {
    fn from(err: serde_json::Error) -> Self {
        ClientError::Decode(err.to_string())
    }
}

pub type ClientFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, ClientError>> + Send + 'a>>;

pub type WatchStream = Pin<Box<dyn Stream<Item = Result<WatchEvent<Value>, ClientError>> + Send>>;

/// Untyped object access. `namespace` is `None` for cluster-scoped kinds.
pub trait ClusterClient: Send + Sync {
    fn get<'a>(
        &'a self,
        kind: ResourceKind,
        namespace: Option<&'a str>,
        name: &'a str,
    ) -> ClientFuture<'a, Value>;

    /// Lists objects, optionally narrowed by an equality label selector.
    fn list<'a>(
        &'a self,
        kind: ResourceKind,
        namespace: Option<&'a str>,
        selector: Option<&'a str>,
    ) -> ClientFuture<'a, Vec<Value>>;

    fn create(&self, kind: ResourceKind, object: Value) -> ClientFuture<'_, Value>;

    /// Replaces the object; fails with `Conflict` on a stale `resourceVersion`.
    fn update(&self, kind: ResourceKind, object: Value) -> ClientFuture<'_, Value>;

    /// Replaces only `status` for kinds with a status subresource.
    fn update_status(&self, kind: ResourceKind, object: Value) -> ClientFuture<'_, Value>;

    fn delete<'a>(
        &'a self,
        kind: ResourceKind,
        namespace: Option<&'a str>,
        name: &'a str,
    ) -> ClientFuture<'a, ()>;

    fn watch(&self, kind: ResourceKind) -> ClientFuture<'_, WatchStream>;

    fn create_subject_access_review(
        &self,
        review: SubjectAccessReview,
    ) -> ClientFuture<'_, SubjectAccessReview>;
}

/// Serializes a typed object with its `apiVersion`/`kind` filled in.
pub fn encode<T: Resource>(object: &T) -> Result<Value, ClientError> {
    let mut value = serde_json::to_value(object)?;
    if let Value::Object(map) = &mut value {
        map.insert(
            "apiVersion".to_string(),
            Value::String(T::KIND.api_version()),
        );
        map.insert("kind".to_string(), Value::String(T::KIND.kind().to_string()));
    }
    Ok(value)
}

pub fn decode<T: Resource>(value: Value) -> Result<T, ClientError> {
    serde_json::from_value(value).map_err(ClientError::from)
}

/// Typed view of one kind.
pub struct Api<T> {
    client: Arc<dyn ClusterClient>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for Api<T> {
    fn clone(&self) -> Self {
        Api {
            client: Arc::clone(&self.client),
            _marker: PhantomData,
        }
    }
}

impl<T: Resource> Api<T> {
    pub fn new(client: Arc<dyn ClusterClient>) -> Self {
        Api {
            client,
            _marker: PhantomData,
        }
    }

    fn scope(namespace: &str) -> Option<&str> {
        if T::KIND.namespaced() && !namespace.is_empty() {
            Some(namespace)
        } else {
            None
        }
    }

    pub async fn get(&self, namespace: &str, name: &str) -> Result<T, ClientError> {
        let value = self
            .client
            .get(T::KIND, Self::scope(namespace), name)
            .await?;
        decode(value)
    }

    /// Like [`Api::get`] but maps `NotFound` to `None`.
    pub async fn get_opt(&self, namespace: &str, name: &str) -> Result<Option<T>, ClientError> {
        match self.get(namespace, name).await {
            Ok(object) => Ok(Some(object)),
            Err(ClientError::NotFound) => Ok(None),
            Err(err) => Err(err),
        }
    }

    pub async fn list(
        &self,
        namespace: Option<&str>,
        selector: Option<&str>,
    ) -> Result<Vec<T>, ClientError> {
        let namespace = namespace.and_then(Self::scope);
        self.client
            .list(T::KIND, namespace, selector)
            .await?
            .into_iter()
            .map(decode)
            .collect()
    }

    pub async fn create(&self, object: &T) -> Result<T, ClientError> {
        let value = self.client.create(T::KIND, encode(object)?).await?;
        decode(value)
    }

    pub async fn update(&self, object: &T) -> Result<T, ClientError> {
        let value = self.client.update(T::KIND, encode(object)?).await?;
        decode(value)
    }

    pub async fn update_status(&self, object: &T) -> Result<T, ClientError> {
        if !T::KIND.has_status_subresource() {
            return self.update(object).await;
        }
        let value = self.client.update_status(T::KIND, encode(object)?).await?;
        decode(value)
    }

    pub async fn delete(&self, namespace: &str, name: &str) -> Result<(), ClientError> {
        self.client
            .delete(T::KIND, Self::scope(namespace), name)
            .await
    }

    /// Deletes and treats an already-missing object as success.
    pub async fn delete_opt(&self, namespace: &str, name: &str) -> Result<bool, ClientError> {
        match self.delete(namespace, name).await {
            Ok(()) => Ok(true),
            Err(ClientError::NotFound) => Ok(false),
            Err(err) => Err(err),
        }
    }

    pub fn client(&self) -> &Arc<dyn ClusterClient> {
        &self.client
    }
}
