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

use serde::Serialize;

use crate::cdi::client::{Api, ClusterClient};
use crate::cdi::k8s::objects::ConfigMap;
use crate::cdi::token::keys::KeyStore;
use std::sync::Arc;

const ERROR_MAX_LEN: usize = 240;

#[derive(Clone, Debug, Serialize)]
pub struct ComponentHealth {
    pub name: &'static str,
    pub healthy: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ComponentHealth {
    fn healthy(name: &'static str) -> Self {
        ComponentHealth {
            name,
            healthy: true,
            error: None,
        }
    }

    fn unhealthy(name: &'static str, err: impl ToString) -> Self {
        let mut message = err.to_string();
        if message.len() > ERROR_MAX_LEN {
            let mut cut = ERROR_MAX_LEN;
            while !message.is_char_boundary(cut) {
                cut -= 1;
            }
            message.truncate(cut);
        }
        ComponentHealth {
            name,
            healthy: false,
            error: Some(message),
        }
    }
}

#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Ready,
    Degraded,
}

#[derive(Clone, Debug, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub components: Vec<ComponentHealth>,
}

impl HealthReport {
    pub fn is_ready(&self) -> bool {
        self.status == HealthStatus::Ready
    }

    fn from_components(components: Vec<ComponentHealth>) -> Self {
        let status = if components.iter().all(|component| component.healthy) {
            HealthStatus::Ready
        } else {
            HealthStatus::Degraded
        };
        HealthReport { status, components }
    }
}

/// Readiness used by `/healthz` on the API front-end: the orchestrator must
/// answer and the token signing key must be loaded.
pub async fn readiness_report(client: &Arc<dyn ClusterClient>, keys: &KeyStore, namespace: &str) -> HealthReport {
    let mut components = Vec::with_capacity(2);

    let config_maps: Api<ConfigMap> = Api::new(Arc::clone(client));
    match config_maps.list(Some(namespace), None).await {
        Ok(_) => components.push(ComponentHealth::healthy("cluster_api")),
        Err(err) => components.push(ComponentHealth::unhealthy("cluster_api", err)),
    }

    match keys.signing_key() {
        Ok(_) => components.push(ComponentHealth::healthy("signing_key")),
        Err(err) => components.push(ComponentHealth::unhealthy("signing_key", err)),
    }

    HealthReport::from_components(components)
}

/// Liveness only reports that the process is serving requests.
pub fn liveness_report() -> HealthReport {
    HealthReport::from_components(vec![ComponentHealth::healthy("process")])
}
