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

//! Maintains the CDIConfig singleton and its effective status.

use super::informer::{Controller, ControllerOptions, WatchSpec};
use super::reconcile::{
    ReconcileContext, ReconcileError, ReconcileFuture, ReconcileOutcome, ReconcileResult,
    Reconciler,
};
use super::runtime::ObjectKey;
use crate::cdi::api::cdiconfig::{
    CdiConfig, CdiConfigStatus, FilesystemOverhead, ImportProxy, CDI_CONFIG_NAME,
    DEFAULT_FILESYSTEM_OVERHEAD,
};
use crate::cdi::client::{Api, ClientError, ClusterClient};
use crate::cdi::config::Settings;
use crate::cdi::k8s::meta::ObjectMeta;
use crate::cdi::k8s::objects::Service;
use crate::cdi::k8s::pod::ResourceRequirements;
use crate::cdi::k8s::proxy::{ClusterProxy, CLUSTER_PROXY_NAME};
use crate::cdi::k8s::resource::ResourceKind;
use crate::cdi::k8s::storage::StorageClass;
use crate::cdi::logger::log_info;
use std::collections::HashMap;
use std::sync::Arc;

const NAME: &str = "cdiconfig-controller";
pub const UPLOAD_PROXY_SERVICE: &str = "cdi-uploadproxy";

/// The singleton, or an empty default while it does not exist yet.
pub async fn current_config(client: &Arc<dyn ClusterClient>) -> Result<CdiConfig, ClientError> {
    let configs: Api<CdiConfig> = Api::new(Arc::clone(client));
    Ok(configs
        .get_opt("", CDI_CONFIG_NAME)
        .await?
        .unwrap_or_default())
}

pub fn default_pod_resources() -> ResourceRequirements {
    ResourceRequirements {
        limits: HashMap::from([
            ("cpu".to_string(), "750m".to_string()),
            ("memory".to_string(), "600M".to_string()),
        ]),
        requests: HashMap::from([
            ("cpu".to_string(), "100m".to_string()),
            ("memory".to_string(), "60M".to_string()),
        ]),
    }
}

pub struct CdiConfigReconciler {
    configs: Api<CdiConfig>,
    classes: Api<StorageClass>,
    proxies: Api<ClusterProxy>,
    services: Api<Service>,
    namespace: String,
}

impl CdiConfigReconciler {
    pub fn new(ctx: &ReconcileContext) -> Result<Self, ReconcileError> {
        let client = ctx.client()?;
        let settings = ctx.require::<Settings>()?;
        Ok(CdiConfigReconciler {
            configs: Api::new(Arc::clone(&client)),
            classes: Api::new(Arc::clone(&client)),
            proxies: Api::new(Arc::clone(&client)),
            services: Api::new(client),
            namespace: settings.namespace.clone(),
        })
    }

    pub fn controller(ctx: &ReconcileContext, options: ControllerOptions) -> Result<Controller, ReconcileError> {
        let singleton = |_: &serde_json::Value| vec![ObjectKey::cluster(CDI_CONFIG_NAME)];
        Ok(Controller::new(Arc::new(Self::new(ctx)?), options)
            .watch(WatchSpec::primary(ResourceKind::CdiConfig))
            .watch(WatchSpec::mapped(ResourceKind::StorageClass, singleton))
            .watch(WatchSpec::mapped(ResourceKind::ClusterProxy, singleton))
            .watch(WatchSpec::mapped(ResourceKind::Service, singleton)))
    }

    async fn sync(&self) -> ReconcileResult {
        let mut config = match self.configs.get_opt("", CDI_CONFIG_NAME).await? {
            Some(config) => config,
            None => {
                let created = self
                    .configs
                    .create(&CdiConfig {
                        metadata: ObjectMeta::named(None, CDI_CONFIG_NAME),
                        ..Default::default()
                    })
                    .await;
                match created {
                    Ok(config) => {
                        log_info(NAME, "Created CDIConfig singleton", &[]);
                        config
                    }
                    Err(ClientError::AlreadyExists) => self.configs.get("", CDI_CONFIG_NAME).await?,
                    Err(err) => return Err(err.into()),
                }
            }
        };

        let status = self.desired_status(&config).await?;
        if config.status.as_ref() != Some(&status) {
            config.status = Some(status);
            self.configs.update_status(&config).await?;
        }
        Ok(ReconcileOutcome::Done)
    }

    async fn desired_status(&self, config: &CdiConfig) -> Result<CdiConfigStatus, ClientError> {
        let spec = &config.spec;
        let classes = self.classes.list(None, None).await?;

        let upload_proxy_url = match &spec.upload_proxy_url_override {
            Some(url) => Some(url.clone()),
            None => self
                .services
                .get_opt(&self.namespace, UPLOAD_PROXY_SERVICE)
                .await?
                .map(|_| format!("{UPLOAD_PROXY_SERVICE}.{}.svc", self.namespace)),
        };

        let import_proxy = match spec.import_proxy.as_ref().filter(|proxy| !proxy.is_empty()) {
            Some(proxy) => Some(proxy.clone()),
            None => self
                .proxies
                .get_opt("", CLUSTER_PROXY_NAME)
                .await?
                .map(|proxy| ImportProxy {
                    http_proxy: proxy.status.http_proxy.or(proxy.spec.http_proxy),
                    https_proxy: proxy.status.https_proxy.or(proxy.spec.https_proxy),
                    no_proxy: proxy.status.no_proxy.or(proxy.spec.no_proxy),
                    trusted_ca_proxy: proxy.spec.trusted_ca.map(|ca| ca.name),
                })
                .filter(|proxy| !proxy.is_empty()),
        };

        let scratch_space_storage_class = match &spec.scratch_space_storage_class {
            Some(name) if classes.iter().any(|class| class.metadata.name() == name) => {
                Some(name.clone())
            }
            _ => classes
                .iter()
                .find(|class| class.is_default())
                .map(|class| class.metadata.name().to_string()),
        };

        let requested = spec.filesystem_overhead.clone().unwrap_or_default();
        let global = if requested.global.parse::<f64>().is_ok() {
            requested.global.clone()
        } else {
            DEFAULT_FILESYSTEM_OVERHEAD.to_string()
        };
        let per_class = classes
            .iter()
            .map(|class| {
                let name = class.metadata.name().to_string();
                let value = requested
                    .storage_class
                    .get(&name)
                    .filter(|value| value.parse::<f64>().is_ok())
                    .cloned()
                    .unwrap_or_else(|| global.clone());
                (name, value)
            })
            .collect();

        Ok(CdiConfigStatus {
            upload_proxy_url,
            import_proxy,
            scratch_space_storage_class,
            default_pod_resource_requirements: Some(
                spec.pod_resource_requirements
                    .clone()
                    .unwrap_or_else(default_pod_resources),
            ),
            filesystem_overhead: Some(FilesystemOverhead {
                global,
                storage_class: per_class,
            }),
            preallocation: Some(spec.preallocation.unwrap_or(false)),
            data_volume_ttl_seconds: spec.data_volume_ttl_seconds,
            feature_gates: spec.feature_gates.clone(),
        })
    }
}

impl Reconciler for CdiConfigReconciler {
    fn name(&self) -> &'static str {
        NAME
    }

    fn reconcile<'a>(&'a self, _key: &'a ObjectKey) -> ReconcileFuture<'a> {
        Box::pin(self.sync())
    }
}
