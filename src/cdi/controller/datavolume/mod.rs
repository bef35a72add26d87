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

//! DataVolume controller. Turns a DataVolume into a claim, hands the claim to
//! the population path its source calls for, and lifts the claim's
//! annotations back into the DataVolume status.

pub(crate) mod adoption;
mod clone;
mod external;
mod gc;
mod import;
mod status;
pub(crate) mod upload;

use super::cdiconfig::current_config;
use super::clone::{CloneEngine, CloneRef};
use super::events::{EventRecorder, ERR_CLAIM_NOT_VALID};
use super::informer::{Controller, ControllerOptions, WatchSpec};
use super::reconcile::{
    ReconcileContext, ReconcileError, ReconcileFuture, ReconcileOutcome, ReconcileResult,
    Reconciler,
};
use super::runtime::ObjectKey;
use crate::cdi::api::annotations::*;
use crate::cdi::api::cdiconfig::{CdiConfig, FEATURE_HONOR_WAIT_FOR_FIRST_CONSUMER};
use crate::cdi::api::datasource::DataSource;
use crate::cdi::api::datavolume::{DataVolume, DataVolumePhase, SourceKind};
use crate::cdi::client::{Api, ClientError, ClusterClient};
use crate::cdi::k8s::meta::ObjectMeta;
use crate::cdi::k8s::pod::Pod;
use crate::cdi::k8s::resource::{Resource, ResourceKind};
use crate::cdi::k8s::storage::CsiDriver;
use crate::cdi::k8s::volume::{PersistentVolume, PersistentVolumeClaim, TypedObjectReference};
use crate::cdi::storage::ProfileRegistry;
use crate::cdi::token::keys::KeyStore;
use crate::cdi::util::quantity::format_quantity;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;

const NAME: &str = "datavolume-controller";

const LAST_APPLIED_CONFIG: &str = "kubectl.kubernetes.io/last-applied-configuration";

/// The population path a DataVolume takes.
#[derive(Debug, Clone, PartialEq)]
enum Flow {
    Import(SourceKind),
    Upload,
    Clone(CloneRef),
    /// A `dataSourceRef` naming a populator CDI does not implement.
    External(TypedObjectReference),
}

impl Flow {
    /// Reason and verb used when the DataVolume succeeds.
    fn succeeded_event(&self) -> (&'static str, &'static str) {
        match self {
            Flow::Import(_) => (super::events::IMPORT_SUCCEEDED, "imported"),
            Flow::Upload => (super::events::UPLOAD_SUCCEEDED, "uploaded"),
            Flow::Clone(_) => (super::events::CLONE_SUCCEEDED, "cloned"),
            Flow::External(_) => (super::events::EXTERNAL_POPULATION_SUCCEEDED, "populated"),
        }
    }
}

/// Outcome of one pass over a DataVolume, before it is written to status.
#[derive(Debug)]
struct Step {
    phase: DataVolumePhase,
    claim: Option<PersistentVolumeClaim>,
    requeue: Option<Duration>,
}

impl Step {
    fn new(phase: DataVolumePhase, claim: Option<PersistentVolumeClaim>) -> Self {
        Step {
            phase,
            claim,
            requeue: None,
        }
    }

    fn pending() -> Self {
        Step::new(DataVolumePhase::Pending, None)
    }
}

pub struct DataVolumeReconciler {
    dvs: Api<DataVolume>,
    claims: Api<PersistentVolumeClaim>,
    pods: Api<Pod>,
    sources: Api<DataSource>,
    volumes: Api<PersistentVolume>,
    drivers: Api<CsiDriver>,
    client: Arc<dyn ClusterClient>,
    profiles: Arc<ProfileRegistry>,
    engine: CloneEngine,
    recorder: EventRecorder,
    any_volume_data_source: OnceCell<bool>,
}

impl DataVolumeReconciler {
    pub fn new(ctx: &ReconcileContext) -> Result<Self, ReconcileError> {
        let client = ctx.client()?;
        let recorder = EventRecorder::new(Arc::clone(&client), NAME);
        let profiles = ctx.require::<ProfileRegistry>()?;
        let keys = ctx.require::<KeyStore>()?;
        Ok(DataVolumeReconciler {
            dvs: Api::new(Arc::clone(&client)),
            claims: Api::new(Arc::clone(&client)),
            pods: Api::new(Arc::clone(&client)),
            sources: Api::new(Arc::clone(&client)),
            volumes: Api::new(Arc::clone(&client)),
            drivers: Api::new(Arc::clone(&client)),
            engine: CloneEngine::new(
                Arc::clone(&client),
                Arc::clone(&profiles),
                keys,
                recorder.clone(),
            ),
            client,
            profiles,
            recorder,
            any_volume_data_source: OnceCell::new(),
        })
    }

    /// Source claims and snapshots may live in any namespace, so claim and
    /// snapshot changes requeue every DataVolume.
    pub fn controller(ctx: &ReconcileContext, options: ControllerOptions) -> Result<Controller, ReconcileError> {
        Ok(Controller::new(Arc::new(Self::new(ctx)?), options)
            .watch(WatchSpec::primary(ResourceKind::DataVolume))
            .watch(WatchSpec::owned_by(
                ResourceKind::PersistentVolumeClaim,
                ResourceKind::DataVolume,
            ))
            .watch(WatchSpec::all_of(
                ResourceKind::PersistentVolumeClaim,
                ResourceKind::DataVolume,
            ))
            .watch(WatchSpec::all_of(
                ResourceKind::VolumeSnapshot,
                ResourceKind::DataVolume,
            ))
            .watch(WatchSpec::namespace_of(
                ResourceKind::DataSource,
                ResourceKind::DataVolume,
            )))
    }

    async fn sync(&self, key: &ObjectKey) -> ReconcileResult {
        let Some(dv) = self.dvs.get_opt(&key.namespace, &key.name).await? else {
            return Ok(ReconcileOutcome::Done);
        };
        if dv.metadata.is_deleting() {
            return Ok(ReconcileOutcome::Done);
        }
        let config = current_config(&self.client).await?;
        let claim = self.claims.get_opt(&key.namespace, &key.name).await?;

        let requeue = match gc::collect(self, &dv, claim.as_ref(), &config).await? {
            gc::Collection::Collected => return Ok(ReconcileOutcome::Done),
            gc::Collection::Wait(delay) => Some(delay),
            gc::Collection::Skip => None,
        };

        let flow = match self.flow(&dv).await? {
            Ok(flow) => flow,
            Err(message) => {
                self.recorder.warning(&dv, ERR_CLAIM_NOT_VALID, &message).await;
                return status::lift(self, dv, None, Step::pending()).await;
            }
        };

        let dv = match (&flow, &claim) {
            (Flow::Clone(reference), None) => clone::extend_token(self, dv, reference).await?,
            _ => dv,
        };

        let mut step = match claim {
            Some(claim) if !claim.metadata.is_controlled_by(dv.metadata.uid()) => {
                adoption::adopt(self, &dv, claim, &config).await?
            }
            Some(claim) if claim.metadata.annotation(ANN_PERSISTENT_VOLUME_LIST).is_some() => {
                adoption::static_binding(self, &dv, claim).await?
            }
            Some(claim) => self.progress(&dv, &flow, claim, &config).await?,
            None => self.start(&dv, &flow, &config).await?,
        };
        if step.requeue.is_none() {
            step.requeue = requeue;
        }
        status::lift(self, dv, Some(&flow), step).await
    }

    /// Works out the population path. `Ok(Err(_))` carries a message for an
    /// intent that cannot be acted on yet.
    async fn flow(&self, dv: &DataVolume) -> Result<Result<Flow, String>, ClientError> {
        if let Some(source_ref) = &dv.spec.source_ref {
            let namespace = source_ref
                .namespace
                .as_deref()
                .unwrap_or(dv.metadata.namespace());
            let Some(source) = self.sources.get_opt(namespace, &source_ref.name).await? else {
                return Ok(Err(format!(
                    "DataSource {namespace}/{} not found",
                    source_ref.name
                )));
            };
            if let Some(pvc) = source.pvc_source() {
                return Ok(Ok(Flow::Clone(CloneRef::Claim {
                    namespace: pvc.namespace,
                    name: pvc.name,
                })));
            }
            if let Some(snapshot) = source.snapshot_source() {
                return Ok(Ok(Flow::Clone(CloneRef::Snapshot {
                    namespace: snapshot.namespace,
                    name: snapshot.name,
                })));
            }
            return Ok(Err(format!(
                "DataSource {namespace}/{} has no source",
                source_ref.name
            )));
        }
        let source = dv.spec.source.as_ref();
        let flow = match dv.spec.source_kind() {
            Some(SourceKind::Upload) => Flow::Upload,
            Some(SourceKind::Pvc) => {
                let Some(pvc) = source.and_then(|source| source.pvc.as_ref()) else {
                    return Ok(Err("missing pvc source".to_string()));
                };
                Flow::Clone(CloneRef::Claim {
                    namespace: default_namespace(&pvc.namespace, dv),
                    name: pvc.name.clone(),
                })
            }
            Some(SourceKind::Snapshot) => {
                let Some(snapshot) = source.and_then(|source| source.snapshot.as_ref()) else {
                    return Ok(Err("missing snapshot source".to_string()));
                };
                Flow::Clone(CloneRef::Snapshot {
                    namespace: default_namespace(&snapshot.namespace, dv),
                    name: snapshot.name.clone(),
                })
            }
            Some(kind) => Flow::Import(kind),
            None => match dv
                .spec
                .claim_template()
                .and_then(|template| template.data_source_ref.clone())
            {
                Some(reference) if source.is_none() => Flow::External(reference),
                _ => return Ok(Err("DataVolume needs exactly one source".to_string())),
            },
        };
        Ok(Ok(flow))
    }

    async fn start(&self, dv: &DataVolume, flow: &Flow, config: &CdiConfig) -> Result<Step, ReconcileError> {
        if let Flow::Clone(reference) = flow {
            return clone::start(self, dv, reference, config).await;
        }
        let Some(base) = self.base_claim(dv, config, None).await? else {
            return Ok(Step::pending());
        };
        if let Some(step) = adoption::start_static(self, dv, &base).await? {
            return Ok(step);
        }
        match flow {
            Flow::Import(kind) => import::start(self, dv, *kind, base).await,
            Flow::Upload => upload::start(self, base).await,
            Flow::External(reference) => external::start(self, dv, reference, base).await,
            Flow::Clone(_) => Ok(Step::pending()),
        }
    }

    async fn progress(
        &self,
        dv: &DataVolume,
        flow: &Flow,
        claim: PersistentVolumeClaim,
        config: &CdiConfig,
    ) -> Result<Step, ReconcileError> {
        match flow {
            Flow::Import(_) => import::progress(self, dv, claim, config).await,
            Flow::Upload => upload::progress(self, claim, config).await,
            Flow::Clone(_) => clone::progress(self, dv, claim, config).await,
            Flow::External(_) => external::progress(self, dv, claim).await,
        }
    }

    /// The claim every flow starts from: name, ownership, labels, carried
    /// annotations and a rendered spec. Returns `None` after recording why
    /// the template could not be rendered.
    async fn base_claim(
        &self,
        dv: &DataVolume,
        config: &CdiConfig,
        default_size: Option<i64>,
    ) -> Result<Option<PersistentVolumeClaim>, ReconcileError> {
        let spec = match self.render(dv, config, default_size).await {
            Ok(spec) => spec,
            Err(message) => {
                self.recorder.warning(dv, ERR_CLAIM_NOT_VALID, &message).await;
                return Ok(None);
            }
        };
        let mut metadata = ObjectMeta::named(Some(dv.metadata.namespace()), dv.metadata.name());
        metadata.labels = dv.metadata.labels.clone();
        metadata
            .labels
            .insert(LABEL_APP.to_string(), LABEL_APP_VALUE.to_string());
        metadata.annotations = dv
            .metadata
            .annotations
            .iter()
            .filter(|(key, _)| key.as_str() != LAST_APPLIED_CONFIG)
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        metadata.owner_references = vec![dv.owner_reference(true)];
        metadata.set_annotation(ANN_CONTENT_TYPE, dv.spec.content_type());
        if let Some(class) = &dv.spec.priority_class_name {
            metadata.set_annotation(ANN_PRIORITY_CLASS_NAME, class.clone());
        }
        if dv.spec.preallocation == Some(true) {
            metadata.set_annotation(ANN_PREALLOCATION_REQUESTED, "true");
        }
        Ok(Some(PersistentVolumeClaim {
            metadata,
            spec,
            status: None,
        }))
    }

    /// An explicit `pvc` template is used as written; a `storage` template is
    /// completed from the storage profile.
    async fn render(
        &self,
        dv: &DataVolume,
        config: &CdiConfig,
        default_size: Option<i64>,
    ) -> Result<crate::cdi::k8s::volume::PersistentVolumeClaimSpec, String> {
        let fill_size = |mut spec: crate::cdi::k8s::volume::PersistentVolumeClaimSpec| {
            if spec.requested_storage().is_none() {
                if let Some(size) = default_size {
                    spec.resources
                        .requests
                        .insert("storage".to_string(), format_quantity(size));
                }
            }
            spec
        };
        if let Some(pvc) = &dv.spec.pvc {
            let spec = fill_size(pvc.clone());
            if spec.requested_storage().is_none() {
                return Err("missing storage request in pvc template".to_string());
            }
            return Ok(spec);
        }
        let Some(storage) = &dv.spec.storage else {
            return Err("DataVolume has neither a pvc nor a storage template".to_string());
        };
        self.profiles
            .render_claim_spec(&fill_size(storage.clone()), |class| {
                config.filesystem_overhead(class)
            })
            .await
            .map_err(|err| err.to_string())
    }

    async fn create_claim(&self, claim: PersistentVolumeClaim) -> Result<PersistentVolumeClaim, ClientError> {
        match self.claims.create(&claim).await {
            Ok(created) => Ok(created),
            Err(ClientError::AlreadyExists) => {
                self.claims
                    .get(claim.metadata.namespace(), claim.metadata.name())
                    .await
            }
            Err(err) => Err(err),
        }
    }

    /// True while an unbound claim waits for a consumer on a delayed-binding
    /// class and the controller is told not to act as that consumer.
    async fn waits_for_first_consumer(
        &self,
        claim: &PersistentVolumeClaim,
        config: &CdiConfig,
    ) -> Result<bool, ClientError> {
        if claim.is_bound()
            || !config.feature_gate_enabled(FEATURE_HONOR_WAIT_FOR_FIRST_CONSUMER)
            || claim.metadata.is_annotation_true(ANN_IMMEDIATE_BINDING)
        {
            return Ok(false);
        }
        Ok(self
            .profiles
            .lookup(claim.storage_class())
            .await?
            .map(|profile| profile.wait_for_first_consumer)
            .unwrap_or(false))
    }
}

fn default_namespace(namespace: &str, dv: &DataVolume) -> String {
    if namespace.is_empty() {
        dv.metadata.namespace().to_string()
    } else {
        namespace.to_string()
    }
}

impl Reconciler for DataVolumeReconciler {
    fn name(&self) -> &'static str {
        NAME
    }

    fn reconcile<'a>(&'a self, key: &'a ObjectKey) -> ReconcileFuture<'a> {
        Box::pin(self.sync(key))
    }
}
