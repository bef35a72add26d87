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

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use humantime::parse_duration;
use tokio_util::sync::CancellationToken;

use super::args::{ClusterArgs, Cli, Commands, ControllerArgs};
use crate::cdi::client::http::HttpClusterClient;
use crate::cdi::client::{ClusterClient, InMemoryCluster};
use crate::cdi::config::Settings;
use crate::cdi::controller::informer::ControllerOptions;
use crate::cdi::controller::manager;
use crate::cdi::controller::reconcile::DependencyHandle;
use crate::cdi::controller::runtime::ControllerRuntime;
use crate::cdi::logger::{self, log_info, log_warn, LogLevel};
use crate::cdi::observability::tracing;
use crate::cdi::server;
use crate::cdi::storage::ProfileRegistry;
use crate::cdi::token::keys::KeyStore;
use crate::cdi::util::error::{new_error, with_context, DynError};

const COMPONENT: &str = "cli";
const IN_CLUSTER_API: &str = "https://kubernetes.default.svc";
const IN_CLUSTER_TOKEN: &str = "/var/run/secrets/kubernetes.io/serviceaccount/token";

fn parse_reconcile_timeout(value: &str) -> Result<Duration, DynError> {
    match parse_duration(value.trim()) {
        Ok(timeout) if !timeout.is_zero() => Ok(timeout),
        _ => Err(new_error(
            "Invalid --reconcile-timeout value. Use durations like 90s, 3m or 1h",
        )),
    }
}

fn cluster_client(args: &ClusterArgs, settings: &Settings) -> Result<Arc<dyn ClusterClient>, DynError> {
    let base_url = args
        .kube_api
        .clone()
        .or_else(|| settings.kube_api.clone())
        .unwrap_or_else(|| IN_CLUSTER_API.to_string());
    let token_file = args
        .kube_token_file
        .clone()
        .or_else(|| settings.kube_token_file.clone())
        .or_else(|| Some(PathBuf::from(IN_CLUSTER_TOKEN)).filter(|path| path.exists()));
    let client = HttpClusterClient::new(&base_url, token_file)
        .map_err(|e| with_context(e, format!("Failed to create client for {base_url}")))?;
    Ok(Arc::new(client))
}

/// Cancels `shutdown` on Ctrl-C.
fn cancel_on_interrupt(shutdown: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log_info(COMPONENT, "Interrupt received, shutting down", &[]);
        }
        shutdown.cancel();
    });
}

async fn run_controller(args: &ControllerArgs, mut settings: Settings) -> Result<(), DynError> {
    if let Some(workers) = args.workers {
        if workers == 0 {
            return Err(new_error("--workers must be at least 1"));
        }
        settings.workers = workers;
    }
    if let Some(timeout) = args.reconcile_timeout.as_deref() {
        settings.reconcile_timeout = parse_reconcile_timeout(timeout)?;
    }
    if let Some(addr) = args.metrics_listen {
        settings.metrics_bind = addr;
    }
    let client: Arc<dyn ClusterClient> = if args.in_memory {
        log_warn(COMPONENT, "Running against an in-memory cluster", &[]);
        InMemoryCluster::new() as Arc<dyn ClusterClient>
    } else {
        cluster_client(&args.cluster, &settings)?
    };

    let runtime = ControllerRuntime::new();
    runtime.register_dependency(Arc::new(DependencyHandle::new(Arc::clone(&client))));
    runtime.register_dependency(Arc::new(ProfileRegistry::new(Arc::clone(&client))));
    runtime.register_dependency(Arc::new(KeyStore::new(Arc::clone(&client), &settings.namespace)));
    let options = ControllerOptions::from(&settings);
    let metrics_bind = settings.metrics_bind;
    runtime.register_dependency(Arc::new(settings));

    let shutdown = runtime.shutdown_token();
    cancel_on_interrupt(shutdown.clone());
    let probes = tokio::spawn(server::serve_probes(server::probe_router(), metrics_bind, shutdown.clone()));

    let result = manager::run(Arc::clone(&runtime), options).await;
    runtime.shutdown();
    if let Ok(Err(err)) = probes.await {
        let error = err.to_string();
        log_warn(COMPONENT, "Metrics server exited with error", &[("error", error.as_str())]);
    }
    result.map_err(|e| with_context(e, "Controller manager failed"))
}

pub async fn run(cli: &Cli) -> Result<(), DynError> {
    logger::set_log_format(cli.log_format.into());
    let level: LogLevel = cli.log_level.parse().map_err(new_error)?;
    logger::set_log_level(level);
    tracing::init();

    let settings = Settings::from_env().map_err(|e| with_context(e, "Invalid environment"))?;
    match &cli.command {
        Commands::Controller(args) => run_controller(args, settings).await,
        Commands::Apiserver(args) => {
            let mut settings = settings;
            if let Some(addr) = args.listen {
                settings.api_bind = addr;
            }
            if let Some(addr) = args.metrics_listen {
                settings.metrics_bind = addr;
            }
            let client = cluster_client(&args.cluster, &settings)?;
            let shutdown = CancellationToken::new();
            cancel_on_interrupt(shutdown.clone());
            server::run(client, &settings, shutdown).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reconcile_timeout_accepts_human_durations() {
        assert_eq!(parse_reconcile_timeout("90s").expect("seconds"), Duration::from_secs(90));
        assert_eq!(parse_reconcile_timeout(" 3m ").expect("minutes"), Duration::from_secs(180));
        assert!(parse_reconcile_timeout("0s").is_err());
        assert!(parse_reconcile_timeout("soon").is_err());
    }
}
