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

//! Controller manager: builds every control loop against one runtime and
//! runs them until shutdown.

use super::cdiconfig::CdiConfigReconciler;
use super::dataimportcron::DataImportCronReconciler;
use super::datasource::DataSourceReconciler;
use super::datavolume::DataVolumeReconciler;
use super::hostclone::HostCloneReconciler;
use super::import::ImportReconciler;
use super::informer::{Controller, ControllerOptions};
use super::reconcile::{ReconcileContext, ReconcileError};
use super::runtime::ControllerRuntime;
use super::storageprofile::StorageProfileReconciler;
use super::transfer::ObjectTransferReconciler;
use super::upload::UploadReconciler;
use crate::cdi::logger::{log_error, log_info};
use std::sync::Arc;
use tokio::task::JoinSet;

const COMPONENT: &str = "controller-manager";

/// Configuration and storage profiles come first so the claim controllers
/// start against a populated profile registry.
pub fn controllers(ctx: &ReconcileContext, options: ControllerOptions) -> Result<Vec<Controller>, ReconcileError> {
    Ok(vec![
        CdiConfigReconciler::controller(ctx, options)?,
        StorageProfileReconciler::controller(ctx, options)?,
        ImportReconciler::controller(ctx, options)?,
        UploadReconciler::controller(ctx, options)?,
        HostCloneReconciler::controller(ctx, options)?,
        DataVolumeReconciler::controller(ctx, options)?,
        DataImportCronReconciler::controller(ctx, options)?,
        DataSourceReconciler::controller(ctx, options)?,
        ObjectTransferReconciler::controller(ctx, options)?,
    ])
}

/// Runs every controller until the runtime shuts down. A controller whose
/// watches cannot be opened stops the whole manager.
pub async fn run(runtime: Arc<ControllerRuntime>, options: ControllerOptions) -> Result<(), ReconcileError> {
    let ctx = runtime.context();
    let client = ctx.client()?;
    let shutdown = runtime.shutdown_token();

    let mut tasks = JoinSet::new();
    for controller in controllers(&ctx, options)? {
        let name = controller.name();
        let client = Arc::clone(&client);
        let shutdown = shutdown.clone();
        tasks.spawn(async move { (name, controller.run(client, shutdown).await) });
    }
    let count = tasks.len().to_string();
    log_info(COMPONENT, "Controllers started", &[("count", count.as_str())]);

    let mut failure = None;
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((_, Ok(()))) => {}
            Ok((name, Err(err))) => {
                let error = err.to_string();
                log_error(
                    COMPONENT,
                    "Controller exited with error",
                    &[("controller", name), ("error", error.as_str())],
                );
                runtime.shutdown();
                failure.get_or_insert(ReconcileError::Client(err));
            }
            Err(err) => {
                let error = err.to_string();
                log_error(COMPONENT, "Controller task panicked", &[("error", error.as_str())]);
                runtime.shutdown();
                failure.get_or_insert(ReconcileError::Internal(error));
            }
        }
    }
    log_info(COMPONENT, "Controllers stopped", &[]);
    failure.map_or(Ok(()), Err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cdi::client::InMemoryCluster;
    use crate::cdi::test_support::context_for;
    use std::collections::HashSet;

    #[test]
    fn every_controller_has_a_distinct_name() {
        let cluster = InMemoryCluster::new();
        let ctx = context_for(&cluster);
        let names: Vec<&str> = controllers(&ctx, ControllerOptions::default())
            .unwrap()
            .iter()
            .map(Controller::name)
            .collect();
        let unique: HashSet<&str> = names.iter().copied().collect();
        assert_eq!(names.len(), 9);
        assert_eq!(unique.len(), names.len());
    }

    #[tokio::test]
    async fn shutdown_stops_the_manager() {
        let cluster = InMemoryCluster::new();
        let ctx = context_for(&cluster);
        let runtime = Arc::clone(ctx.runtime());
        let handle = tokio::spawn(run(Arc::clone(&runtime), ControllerOptions::default()));
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        runtime.shutdown();
        let result = tokio::time::timeout(std::time::Duration::from_secs(5), handle)
            .await
            .expect("manager did not stop")
            .expect("manager task panicked");
        assert!(result.is_ok());
    }
}
