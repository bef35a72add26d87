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

use crate::cdi::client::{ClientError, ClusterClient};
use crate::cdi::controller::runtime::{ControllerRuntime, ObjectKey};
use crate::cdi::token::TokenError;
use std::error::Error;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

/// Execution context shared by every reconciler of a controller manager.
///
/// The context exposes the underlying `ControllerRuntime` so controllers can
/// reach dependency-injected helpers (cluster client, event recorder, profile
/// registry, token services, settings).
#[derive(Clone)]
pub struct ReconcileContext {
    runtime: Arc<ControllerRuntime>,
}

impl ReconcileContext {
    pub fn new(runtime: Arc<ControllerRuntime>) -> Self {
        Self { runtime }
    }

    pub fn runtime(&self) -> &Arc<ControllerRuntime> {
        &self.runtime
    }

    pub fn dependency<T>(&self) -> Option<Arc<T>>
    where
        T: Send + Sync + 'static,
    {
        self.runtime.dependency::<T>()
    }

    /// Like [`ReconcileContext::dependency`] but reports a missing registration.
    pub fn require<T>(&self) -> Result<Arc<T>, ReconcileError>
    where
        T: Send + Sync + 'static,
    {
        self.dependency::<T>().ok_or_else(|| {
            ReconcileError::Internal(format!(
                "dependency {} is not registered",
                std::any::type_name::<T>()
            ))
        })
    }

    pub fn client(&self) -> Result<Arc<dyn ClusterClient>, ReconcileError> {
        self.require::<DependencyHandle<dyn ClusterClient>>()
            .map(|handle| handle.get())
    }
}

/// Wrapper that stores an `Arc<T>` while remaining `Sized`, enabling trait-object dependencies.
pub struct DependencyHandle<T: ?Sized> {
    inner: Arc<T>,
}

impl<T: ?Sized> DependencyHandle<T> {
    pub fn new(inner: Arc<T>) -> Self {
        Self { inner }
    }

    pub fn get(&self) -> Arc<T> {
        Arc::clone(&self.inner)
    }
}

impl<T: ?Sized> Clone for DependencyHandle<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    Done,
    RequeueAfter(Duration),
}

#[derive(Debug)]
pub enum ReconcileError {
    Client(ClientError),
    Token(TokenError),
    Invalid(String),
    Internal(String),
}

impl fmt::Display for ReconcileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReconcileError::Client(err) => write!(f, "cluster request failed: {err}"),
            ReconcileError::Token(err) => write!(f, "token error: {err}"),
            ReconcileError::Invalid(reason) => write!(f, "invalid object: {reason}"),
            ReconcileError::Internal(reason) => f.write_str(reason),
        }
    }
}

impl Error for ReconcileError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            ReconcileError::Client(err) => Some(err),
            ReconcileError::Token(err) => Some(err),
            _ => None,
        }
    }
}

impl From<ClientError> for ReconcileError {
    fn from(err: ClientError) -> Self {
        ReconcileError::Client(err)
    }
}

impl From<TokenError> for ReconcileError {
    fn from(err: TokenError) -> Self {
        ReconcileError::Token(err)
    }
}

impl ReconcileError {
    /// Conflicts are expected under optimistic concurrency and retried quietly.
    pub fn is_conflict(&self) -> bool {
        matches!(self, ReconcileError::Client(ClientError::Conflict))
    }
}

pub type ReconcileResult = Result<ReconcileOutcome, ReconcileError>;

pub type ReconcileFuture<'a> = Pin<Box<dyn Future<Output = ReconcileResult> + Send + 'a>>;

/// One control loop. Reconciliation of a key must be idempotent: it reads
/// the current state and moves it one step closer to the desired state.
pub trait Reconciler: Send + Sync {
    /// Stable controller name used in logs, spans and metrics.
    fn name(&self) -> &'static str;

    fn reconcile<'a>(&'a self, key: &'a ObjectKey) -> ReconcileFuture<'a>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cdi::client::InMemoryCluster;

    struct Counter;

    impl Reconciler for Counter {
        fn name(&self) -> &'static str {
            "counter"
        }

        fn reconcile<'a>(&'a self, key: &'a ObjectKey) -> ReconcileFuture<'a> {
            Box::pin(async move {
                if key.name == "requeue" {
                    Ok(ReconcileOutcome::RequeueAfter(Duration::from_secs(1)))
                } else {
                    Ok(ReconcileOutcome::Done)
                }
            })
        }
    }

    #[tokio::test]
    async fn reconciler_is_object_safe() {
        let reconciler: Arc<dyn Reconciler> = Arc::new(Counter);
        let outcome = reconciler
            .reconcile(&ObjectKey::new("ns", "requeue"))
            .await
            .expect("reconcile");
        assert_eq!(outcome, ReconcileOutcome::RequeueAfter(Duration::from_secs(1)));
        assert_eq!(reconciler.name(), "counter");
    }

    #[test]
    fn context_resolves_trait_object_client() {
        let runtime = ControllerRuntime::new();
        let ctx = runtime.context();
        assert!(ctx.client().is_err());
        let cluster: Arc<dyn ClusterClient> = InMemoryCluster::new();
        runtime.register_dependency(Arc::new(DependencyHandle::new(cluster)));
        assert!(ctx.client().is_ok());
    }
}
