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

//! DataImportCron controller. Polls the registry for the digest behind the
//! cron's source on every schedule tick, imports each new digest into its own
//! DataVolume, points the managed DataSource at the newest successful import
//! and prunes older imports.

use super::events::{
    EventRecorder, DIGEST_NOT_FOUND, ERR_DATA_SOURCE_ALREADY_MANAGED, ERR_IMPORT_FAILED,
    ERR_INVALID_SCHEDULE,
};
use super::informer::{Controller, ControllerOptions, WatchSpec};
use super::pods::termination_message;
use super::reconcile::{
    ReconcileContext, ReconcileError, ReconcileFuture, ReconcileOutcome, ReconcileResult,
    Reconciler,
};
use super::runtime::ObjectKey;
use crate::cdi::api::annotations::*;
use crate::cdi::api::conditions::{
    find_condition, set_condition, CONDITION_PROGRESSING, CONDITION_RUNNING, CONDITION_UP_TO_DATE,
    STATUS_FALSE, STATUS_TRUE,
};
use crate::cdi::api::dataimportcron::*;
use crate::cdi::api::datasource::DataSource;
use crate::cdi::api::datavolume::{DataVolume, DataVolumePhase, NamespacedSource};
use crate::cdi::client::{Api, ClientError, ClusterClient};
use crate::cdi::config::Settings;
use crate::cdi::k8s::meta::ObjectMeta;
use crate::cdi::k8s::pod::{Container, EnvVar, Pod, PodSpec, POD_FAILED, POD_SUCCEEDED};
use crate::cdi::k8s::resource::{Resource, ResourceKind};
use crate::cdi::k8s::volume::PersistentVolumeClaim;
use crate::cdi::logger::{log_info, log_warn};
use crate::cdi::observability::metrics::{clear_dataimportcron, set_dataimportcron_outdated};
use crate::cdi::scheduler::CronSchedule;
use crate::cdi::util::naming::resource_name;
use crate::cdi::util::time::{now_rfc3339, parse_rfc3339};
use chrono::Utc;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

const NAME: &str = "dataimportcron-controller";

pub const FINALIZER: &str = "cdi.kubevirt.io/dataImportCronFinalizer";

const DIGEST_PREFIX: &str = "sha256:";
const DIGEST_NAME_LENGTH: usize = 12;
const POLLER_CONTAINER: &str = "poller";

/// Name of the DataVolume importing `digest` for a cron managing `data_source`.
pub fn import_name(data_source: &str, digest: &str) -> Option<String> {
    let hex = digest.strip_prefix(DIGEST_PREFIX)?;
    let short = hex.get(..DIGEST_NAME_LENGTH)?;
    Some(resource_name(data_source, short))
}

pub fn poller_name(cron: &str) -> String {
    resource_name(cron, "poller")
}

/// Pins a `docker://` reference to `digest`, dropping any tag or older digest.
pub fn digested_url(url: &str, digest: &str) -> String {
    let repository = url.split('@').next().unwrap_or(url);
    let last_slash = repository.rfind('/').unwrap_or(0);
    let untagged = match repository.rfind(':') {
        Some(colon) if colon > last_slash => &repository[..colon],
        _ => repository,
    };
    format!("{untagged}@{digest}")
}

/// Makes the cron due now. The next reconcile starts a poll.
pub async fn mark_tick(client: &Arc<dyn ClusterClient>, namespace: &str, name: &str) -> Result<(), ClientError> {
    let crons: Api<DataImportCron> = Api::new(Arc::clone(client));
    for _ in 0..3 {
        let mut cron = crons.get(namespace, name).await?;
        cron.metadata.set_annotation(ANN_NEXT_CRON_TIME, now_rfc3339());
        match crons.update(&cron).await {
            Err(ClientError::Conflict) => continue,
            other => return other.map(|_| ()),
        }
    }
    Err(ClientError::Conflict)
}

/// Result of looking at the poller pod during one reconcile.
#[derive(Debug, PartialEq)]
enum Probe {
    Idle,
    InFlight,
    Found,
    NotFound(String),
}

fn cron_label_mapper(object: &Value) -> Vec<ObjectKey> {
    let namespace = object
        .pointer("/metadata/namespace")
        .and_then(Value::as_str)
        .unwrap_or_default();
    object
        .pointer("/metadata/labels")
        .and_then(|labels| labels.get(LABEL_DATA_IMPORT_CRON))
        .and_then(Value::as_str)
        .filter(|name| !name.is_empty())
        .map(|name| vec![ObjectKey::new(namespace, name)])
        .unwrap_or_default()
}

pub struct DataImportCronReconciler {
    crons: Api<DataImportCron>,
    dvs: Api<DataVolume>,
    sources: Api<DataSource>,
    claims: Api<PersistentVolumeClaim>,
    pods: Api<Pod>,
    settings: Arc<Settings>,
    recorder: EventRecorder,
}

impl DataImportCronReconciler {
    pub fn new(ctx: &ReconcileContext) -> Result<Self, ReconcileError> {
        let client = ctx.client()?;
        Ok(DataImportCronReconciler {
            crons: Api::new(Arc::clone(&client)),
            dvs: Api::new(Arc::clone(&client)),
            sources: Api::new(Arc::clone(&client)),
            claims: Api::new(Arc::clone(&client)),
            pods: Api::new(Arc::clone(&client)),
            settings: ctx.require::<Settings>()?,
            recorder: EventRecorder::new(client, NAME),
        })
    }

    pub fn controller(ctx: &ReconcileContext, options: ControllerOptions) -> Result<Controller, ReconcileError> {
        Ok(Controller::new(Arc::new(Self::new(ctx)?), options)
            .watch(WatchSpec::primary(ResourceKind::DataImportCron))
            .watch(WatchSpec::owned_by(ResourceKind::Pod, ResourceKind::DataImportCron))
            .watch(WatchSpec::mapped(ResourceKind::DataVolume, cron_label_mapper))
            .watch(WatchSpec::mapped(ResourceKind::DataSource, cron_label_mapper)))
    }

    async fn sync(&self, key: &ObjectKey) -> ReconcileResult {
        let Some(mut cron) = self.crons.get_opt(&key.namespace, &key.name).await? else {
            clear_dataimportcron(&key.namespace, &key.name);
            return Ok(ReconcileOutcome::Done);
        };
        if cron.metadata.is_deleting() {
            self.cleanup(&cron).await?;
            if cron.metadata.remove_finalizer(FINALIZER) {
                self.crons.update(&cron).await?;
            }
            clear_dataimportcron(&key.namespace, &key.name);
            return Ok(ReconcileOutcome::Done);
        }
        if cron.metadata.add_finalizer(FINALIZER) {
            cron = self.crons.update(&cron).await?;
        }
        if !self.manages_data_source(&cron).await? {
            return Ok(ReconcileOutcome::Done);
        }
        let schedule = match CronSchedule::from_standard(&cron.spec.schedule) {
            Ok(schedule) => schedule,
            Err(err) => {
                self.recorder
                    .warning(&cron, ERR_INVALID_SCHEDULE, &err.to_string())
                    .await;
                return Ok(ReconcileOutcome::Done);
            }
        };

        let original = cron.clone();
        if cron.metadata.annotation(ANN_NEXT_CRON_TIME).is_none() {
            cron.metadata.set_annotation(ANN_NEXT_CRON_TIME, now_rfc3339());
        }
        let outcome = self.update(&mut cron, &schedule).await?;
        self.persist(&original, cron).await?;
        Ok(outcome)
    }

    /// A DataSource already labelled for another live cron that manages it
    /// is left alone.
    async fn manages_data_source(&self, cron: &DataImportCron) -> Result<bool, ReconcileError> {
        let namespace = cron.metadata.namespace();
        let Some(source) = self
            .sources
            .get_opt(namespace, &cron.spec.managed_data_source)
            .await?
        else {
            return Ok(true);
        };
        let owner = source.metadata.label(LABEL_DATA_IMPORT_CRON).unwrap_or_default();
        if owner.is_empty() || owner == cron.metadata.name() {
            return Ok(true);
        }
        let Some(other) = self.crons.get_opt(namespace, owner).await? else {
            return Ok(true);
        };
        if other.spec.managed_data_source != source.metadata.name() {
            return Ok(true);
        }
        let message = format!(
            "DataSource {} is already managed by DataImportCron {}",
            source.metadata.name(),
            other.metadata.name()
        );
        self.recorder
            .warning(cron, ERR_DATA_SOURCE_ALREADY_MANAGED, &message)
            .await;
        Ok(false)
    }

    async fn update(&self, cron: &mut DataImportCron, schedule: &CronSchedule) -> ReconcileResult {
        let namespace = cron.metadata.namespace().to_string();
        let imports = cron
            .status
            .as_ref()
            .map(|status| status.current_imports.clone())
            .unwrap_or_default();

        let mut current = None;
        if let Some(first) = imports.first() {
            match self.dvs.get_opt(&namespace, &first.data_volume_name).await? {
                Some(dv) => current = Some(dv),
                None => {
                    log_info(
                        NAME,
                        "Current import no longer exists",
                        &[("namespace", namespace.as_str()), ("datavolume", first.data_volume_name.as_str())],
                    );
                    cron.status_mut().current_imports.remove(0);
                }
            }
        }

        let mut import_succeeded = false;
        {
            let status = cron.status_mut();
            let (progressing, reason, message) = match current.as_ref().map(DataVolume::phase) {
                Some(DataVolumePhase::Succeeded) => {
                    import_succeeded = true;
                    (STATUS_FALSE, REASON_NO_IMPORT.to_string(), "No current import".to_string())
                }
                Some(DataVolumePhase::ImportScheduled) => (
                    STATUS_FALSE,
                    REASON_IMPORT_SCHEDULED.to_string(),
                    "Import is scheduled".to_string(),
                ),
                Some(DataVolumePhase::ImportInProgress) => (
                    STATUS_TRUE,
                    REASON_IMPORT_IN_PROGRESS.to_string(),
                    "Import is progressing".to_string(),
                ),
                Some(phase) => (
                    STATUS_FALSE,
                    phase.as_str().to_string(),
                    format!("Import DataVolume phase {phase}"),
                ),
                None => (STATUS_FALSE, REASON_NO_IMPORT.to_string(), "No current import".to_string()),
            };
            set_condition(&mut status.conditions, CONDITION_PROGRESSING, progressing, &reason, &message);
            if import_succeeded {
                if let Some(latest) = status.current_imports.first() {
                    let pvc = NamespacedSource {
                        namespace: namespace.clone(),
                        name: latest.data_volume_name.clone(),
                    };
                    if status.last_imported_pvc.as_ref() != Some(&pvc) {
                        status.last_imported_pvc = Some(pvc);
                        status.last_import_timestamp = Some(now_rfc3339());
                    }
                }
            }
        }
        if import_succeeded {
            self.collect_outdated(cron).await?;
        }

        self.update_data_source(cron).await?;
        let (probe, outcome) = self.poll(cron, schedule).await?;

        let desired = cron
            .metadata
            .annotation(ANN_SOURCE_DESIRED_DIGEST)
            .unwrap_or_default()
            .to_string();
        let latest_digest = imports.first().map(|import| import.digest.as_str());
        let digest_updated = !desired.is_empty() && latest_digest != Some(desired.as_str());
        let unusable_digest = !desired.is_empty() && import_name(&cron.spec.managed_data_source, &desired).is_none();
        let digest_missing = match &probe {
            Probe::NotFound(_) => true,
            Probe::Found => false,
            Probe::Idle | Probe::InFlight => cron
                .status
                .as_ref()
                .and_then(|status| find_condition(&status.conditions, CONDITION_UP_TO_DATE))
                .map(|condition| condition.reason == REASON_DIGEST_NOT_FOUND)
                .unwrap_or(false),
        } || unusable_digest;

        if digest_missing {
            let message = match probe {
                Probe::NotFound(message) => message,
                _ => "Source digest could not be resolved".to_string(),
            };
            let status = cron.status_mut();
            set_condition(&mut status.conditions, CONDITION_UP_TO_DATE, STATUS_FALSE, REASON_DIGEST_NOT_FOUND, &message);
            set_condition(&mut status.conditions, CONDITION_PROGRESSING, STATUS_TRUE, REASON_DIGEST_NOT_FOUND, &message);
        } else if digest_updated {
            set_condition(
                &mut cron.status_mut().conditions,
                CONDITION_UP_TO_DATE,
                STATUS_FALSE,
                REASON_OUTDATED,
                "Source digest updated since last import",
            );
            if let Some(dv) = current.as_ref() {
                self.delete_failed_import(cron, dv).await?;
            }
            if import_succeeded || imports.is_empty() {
                self.create_import(cron, &desired).await?;
            }
        } else if import_succeeded {
            set_condition(
                &mut cron.status_mut().conditions,
                CONDITION_UP_TO_DATE,
                STATUS_TRUE,
                REASON_UP_TO_DATE,
                "Latest import is up to date",
            );
        } else if !imports.is_empty() {
            set_condition(
                &mut cron.status_mut().conditions,
                CONDITION_UP_TO_DATE,
                STATUS_FALSE,
                REASON_IMPORT_IN_PROGRESS,
                "Import is progressing",
            );
        } else {
            set_condition(
                &mut cron.status_mut().conditions,
                CONDITION_UP_TO_DATE,
                STATUS_FALSE,
                REASON_NO_DIGEST,
                "No source digest",
            );
        }

        if let Some(last) = cron.metadata.annotation(ANN_LAST_CRON_TIME).map(str::to_string) {
            let status = cron.status_mut();
            if status.last_execution_timestamp.as_deref() != Some(last.as_str()) {
                status.last_execution_timestamp = Some(last);
            }
        }

        let up_to_date = cron
            .status
            .as_ref()
            .map(|status| crate::cdi::api::conditions::is_condition_true(&status.conditions, CONDITION_UP_TO_DATE))
            .unwrap_or(false);
        let pending = !import_succeeded
            && cron
                .status
                .as_ref()
                .map(|status| !status.current_imports.is_empty())
                .unwrap_or(false);
        set_dataimportcron_outdated(&namespace, cron.metadata.name(), pending, !up_to_date);
        Ok(outcome)
    }

    /// Drives the digest poller. A finished poller records the digest it saw;
    /// a due cron without one in flight starts a new one.
    async fn poll(
        &self,
        cron: &mut DataImportCron,
        schedule: &CronSchedule,
    ) -> Result<(Probe, ReconcileOutcome), ReconcileError> {
        let Some(url) = registry_url(cron).map(str::to_string) else {
            return Ok((Probe::Idle, ReconcileOutcome::Done));
        };
        let namespace = cron.metadata.namespace().to_string();
        let name = poller_name(cron.metadata.name());
        let mut probe = Probe::Idle;

        if let Some(pod) = self.pods.get_opt(&namespace, &name).await? {
            match pod.phase() {
                POD_SUCCEEDED => {
                    let digest = termination_message(&pod).map(str::trim).unwrap_or_default();
                    cron.metadata.set_annotation(ANN_LAST_CRON_TIME, now_rfc3339());
                    if digest.starts_with(DIGEST_PREFIX) {
                        if cron.metadata.set_annotation(ANN_SOURCE_DESIRED_DIGEST, digest) {
                            log_info(
                                NAME,
                                "Source digest changed",
                                &[("cron", cron.metadata.name()), ("digest", digest)],
                            );
                        }
                        probe = Probe::Found;
                    } else {
                        probe = Probe::NotFound(format!("poller reported no digest for {url}"));
                    }
                    self.pods.delete_opt(&namespace, &name).await?;
                }
                POD_FAILED => {
                    let message = termination_message(&pod).unwrap_or("digest poll failed").to_string();
                    cron.metadata.set_annotation(ANN_LAST_CRON_TIME, now_rfc3339());
                    self.recorder.warning(&*cron, DIGEST_NOT_FOUND, &message).await;
                    probe = Probe::NotFound(message);
                    self.pods.delete_opt(&namespace, &name).await?;
                }
                _ => probe = Probe::InFlight,
            }
        }

        let now = Utc::now();
        let next = cron
            .metadata
            .annotation(ANN_NEXT_CRON_TIME)
            .and_then(parse_rfc3339);
        let due = next.map(|next| next <= now).unwrap_or(true);
        if due && probe != Probe::InFlight {
            self.start_poller(cron, &url).await?;
            if let Some(next) = schedule.next_after(now) {
                cron.metadata
                    .set_annotation(ANN_NEXT_CRON_TIME, crate::cdi::util::time::format_rfc3339(next));
            }
        }
        let outcome = cron
            .metadata
            .annotation(ANN_NEXT_CRON_TIME)
            .and_then(parse_rfc3339)
            .and_then(|next| (next - now).to_std().ok())
            .map(|delay| ReconcileOutcome::RequeueAfter(delay.max(Duration::from_secs(1))))
            .unwrap_or(ReconcileOutcome::Done);
        Ok((probe, outcome))
    }

    async fn start_poller(&self, cron: &DataImportCron, url: &str) -> Result<(), ClientError> {
        let namespace = cron.metadata.namespace();
        let mut metadata = ObjectMeta::named(Some(namespace), &poller_name(cron.metadata.name()));
        metadata
            .labels
            .insert(LABEL_APP.to_string(), LABEL_APP_VALUE.to_string());
        metadata
            .labels
            .insert(LABEL_DATA_IMPORT_CRON_POLLER.to_string(), cron.metadata.name().to_string());
        metadata.owner_references.push(cron.owner_reference(true));
        let registry = cron
            .spec
            .template
            .spec
            .source
            .as_ref()
            .and_then(|source| source.registry.as_ref());
        let mut env = vec![
            EnvVar::new("IMPORTER_SOURCE", "registry"),
            EnvVar::new("IMPORTER_ENDPOINT", url),
            EnvVar::new("IMPORTER_DIGEST_ONLY", "true"),
        ];
        if let Some(secret) = registry.and_then(|registry| registry.secret_ref.as_deref()) {
            env.push(EnvVar::new("IMPORTER_SECRET", secret));
        }
        if let Some(certs) = registry.and_then(|registry| registry.cert_config_map.as_deref()) {
            env.push(EnvVar::new("IMPORTER_CERT_CONFIG_MAP", certs));
        }
        let pod = Pod {
            metadata,
            spec: PodSpec {
                containers: vec![Container {
                    name: POLLER_CONTAINER.to_string(),
                    image: Some(self.settings.poller_image.clone()),
                    image_pull_policy: Some(self.settings.pull_policy.clone()),
                    env,
                    termination_message_path: Some("/dev/termination-log".to_string()),
                    ..Default::default()
                }],
                restart_policy: Some("Never".to_string()),
                ..Default::default()
            },
            status: None,
        };
        match self.pods.create(&pod).await {
            Ok(_) => {
                log_info(
                    NAME,
                    "Started digest poller",
                    &[("namespace", namespace), ("cron", cron.metadata.name())],
                );
                Ok(())
            }
            Err(ClientError::AlreadyExists) => Ok(()),
            Err(err) => Err(err),
        }
    }

    async fn update_data_source(&self, cron: &DataImportCron) -> Result<(), ClientError> {
        let namespace = cron.metadata.namespace();
        let name = &cron.spec.managed_data_source;
        let source = match self.sources.get_opt(namespace, name).await? {
            Some(source) => source,
            None => {
                let mut metadata = ObjectMeta::named(Some(namespace), name);
                set_cron_labels(cron, &mut metadata);
                let created = self
                    .sources
                    .create(&DataSource {
                        metadata,
                        ..Default::default()
                    })
                    .await?;
                log_info(
                    NAME,
                    "Created managed DataSource",
                    &[("namespace", namespace), ("datasource", name.as_str())],
                );
                created
            }
        };
        if source.metadata.label(LABEL_DATA_IMPORT_CRON).unwrap_or_default().is_empty() {
            return Ok(());
        }
        let mut desired = source.clone();
        set_cron_labels(cron, &mut desired.metadata);
        if let Some(pvc) = cron.status.as_ref().and_then(|status| status.last_imported_pvc.clone()) {
            desired.spec.source.pvc = Some(pvc);
            desired.spec.source.snapshot = None;
        }
        if desired != source {
            self.sources.update(&desired).await?;
        }
        Ok(())
    }

    async fn create_import(&self, cron: &mut DataImportCron, digest: &str) -> Result<(), ClientError> {
        let Some(name) = import_name(&cron.spec.managed_data_source, digest) else {
            return Ok(());
        };
        let dv = source_data_volume(cron, &name, digest);
        match self.dvs.create(&dv).await {
            Ok(_) => log_info(
                NAME,
                "Created import DataVolume",
                &[("namespace", cron.metadata.namespace()), ("datavolume", name.as_str())],
            ),
            Err(ClientError::AlreadyExists) => {}
            Err(err) => return Err(err),
        }
        cron.status_mut().current_imports = vec![ImportStatus {
            data_volume_name: name,
            digest: digest.to_string(),
        }];
        Ok(())
    }

    /// Drops an import whose worker failed so the new digest can be tried.
    async fn delete_failed_import(&self, cron: &mut DataImportCron, dv: &DataVolume) -> Result<(), ClientError> {
        let failed = dv
            .status
            .as_ref()
            .and_then(|status| find_condition(&status.conditions, CONDITION_RUNNING))
            .map(|condition| condition.status == STATUS_FALSE && condition.reason == ERR_IMPORT_FAILED)
            .unwrap_or(false);
        if !failed {
            return Ok(());
        }
        log_warn(
            NAME,
            "Deleting failed import",
            &[("namespace", dv.metadata.namespace()), ("datavolume", dv.metadata.name())],
        );
        let mut unlabelled = dv.clone();
        unlabelled
            .metadata
            .labels
            .insert(LABEL_DATA_IMPORT_CRON.to_string(), String::new());
        match self.dvs.update(&unlabelled).await {
            Ok(_) | Err(ClientError::NotFound) => {}
            Err(err) => return Err(err),
        }
        self.dvs
            .delete_opt(dv.metadata.namespace(), dv.metadata.name())
            .await?;
        cron.status_mut().current_imports.clear();
        Ok(())
    }

    /// Keeps the newest `importsToKeep` imports; current imports always rank first.
    async fn collect_outdated(&self, cron: &DataImportCron) -> Result<(), ClientError> {
        if !cron.garbage_collects_outdated() {
            return Ok(());
        }
        let namespace = cron.metadata.namespace();
        let selector = format!("{LABEL_DATA_IMPORT_CRON}={}", cron.metadata.name());
        let mut imports = self.dvs.list(Some(namespace), Some(&selector)).await?;
        let keep = cron.imports_to_keep();
        if imports.len() <= keep {
            return Ok(());
        }
        let current: Vec<&str> = cron
            .status
            .as_ref()
            .map(|status| {
                status
                    .current_imports
                    .iter()
                    .map(|import| import.data_volume_name.as_str())
                    .collect()
            })
            .unwrap_or_default();
        imports.sort_by(|a, b| {
            let rank = |dv: &DataVolume| current.contains(&dv.metadata.name());
            rank(b)
                .cmp(&rank(a))
                .then_with(|| import_time(b).cmp(&import_time(a)))
        });
        for dv in imports.iter().skip(keep) {
            if self
                .dvs
                .delete_opt(dv.metadata.namespace(), dv.metadata.name())
                .await?
            {
                log_info(
                    NAME,
                    "Deleted outdated import",
                    &[("namespace", namespace), ("datavolume", dv.metadata.name())],
                );
            }
        }
        Ok(())
    }

    /// Applies the retention policy when the cron goes away.
    async fn cleanup(&self, cron: &DataImportCron) -> Result<(), ClientError> {
        let namespace = cron.metadata.namespace();
        self.pods
            .delete_opt(namespace, &poller_name(cron.metadata.name()))
            .await?;
        let selector = format!("{LABEL_DATA_IMPORT_CRON}={}", cron.metadata.name());
        match cron.retention_policy() {
            RETAIN_NONE => {
                for source in self.sources.list(Some(namespace), Some(&selector)).await? {
                    self.sources
                        .delete_opt(namespace, source.metadata.name())
                        .await?;
                }
                for dv in self.dvs.list(Some(namespace), Some(&selector)).await? {
                    self.dvs.delete_opt(namespace, dv.metadata.name()).await?;
                }
                for claim in self.claims.list(Some(namespace), Some(&selector)).await? {
                    self.claims
                        .delete_opt(namespace, claim.metadata.name())
                        .await?;
                }
            }
            RETAIN_LATEST => {
                let latest = cron
                    .status
                    .as_ref()
                    .and_then(|status| status.last_imported_pvc.as_ref())
                    .map(|pvc| pvc.name.clone());
                for dv in self.dvs.list(Some(namespace), Some(&selector)).await? {
                    if latest.as_deref() == Some(dv.metadata.name()) {
                        continue;
                    }
                    self.dvs.delete_opt(namespace, dv.metadata.name()).await?;
                }
            }
            _ => {}
        }
        log_info(
            NAME,
            "Cleaned up after DataImportCron",
            &[
                ("namespace", namespace),
                ("cron", cron.metadata.name()),
                ("retention", cron.retention_policy()),
            ],
        );
        Ok(())
    }

    /// Writes metadata and status separately; the status subresource ignores
    /// status fields on plain updates.
    async fn persist(&self, original: &DataImportCron, cron: DataImportCron) -> Result<(), ClientError> {
        let mut stored = original.clone();
        if cron.metadata != original.metadata {
            stored = self.crons.update(&cron).await?;
        }
        if cron.status != original.status {
            stored.status = cron.status;
            self.crons.update_status(&stored).await?;
        }
        Ok(())
    }
}

fn registry_url(cron: &DataImportCron) -> Option<&str> {
    cron.spec
        .template
        .spec
        .source
        .as_ref()?
        .registry
        .as_ref()?
        .url
        .as_deref()
}

fn set_cron_labels(cron: &DataImportCron, metadata: &mut ObjectMeta) {
    metadata
        .labels
        .insert(LABEL_DATA_IMPORT_CRON.to_string(), cron.metadata.name().to_string());
    if cron.retention_policy() == RETAIN_NONE {
        metadata
            .labels
            .insert(LABEL_DATA_IMPORT_CRON_CLEANUP.to_string(), "true".to_string());
    }
}

/// Ready heartbeat of an import, falling back to its creation time.
fn import_time(dv: &DataVolume) -> String {
    dv.status
        .as_ref()
        .and_then(|status| find_condition(&status.conditions, crate::cdi::api::conditions::CONDITION_READY))
        .and_then(|condition| condition.last_heartbeat_time.clone())
        .or_else(|| dv.metadata.creation_timestamp.clone())
        .unwrap_or_default()
}

/// The DataVolume importing `digest`, built from the cron's template.
fn source_data_volume(cron: &DataImportCron, name: &str, digest: &str) -> DataVolume {
    let template = &cron.spec.template;
    let mut spec = template.spec.clone();
    if let Some(registry) = spec.source.as_mut().and_then(|source| source.registry.as_mut()) {
        if let Some(url) = registry.url.as_deref() {
            registry.url = Some(digested_url(url, digest));
        }
    }
    let mut metadata = ObjectMeta::named(Some(cron.metadata.namespace()), name);
    metadata.labels = template.metadata.labels.clone();
    metadata.annotations = template.metadata.annotations.clone();
    set_cron_labels(cron, &mut metadata);
    for key in [ANN_IMMEDIATE_BINDING, ANN_POD_RETAIN_AFTER_COMPLETION] {
        if let Some(value) = cron.metadata.annotation(key).filter(|value| !value.is_empty()) {
            metadata.set_annotation(key, value);
        }
    }
    metadata.set_annotation(ANN_DELETE_AFTER_COMPLETION, "false");
    DataVolume {
        metadata,
        spec,
        status: None,
    }
}

impl Reconciler for DataImportCronReconciler {
    fn name(&self) -> &'static str {
        NAME
    }

    fn reconcile<'a>(&'a self, key: &'a ObjectKey) -> ReconcileFuture<'a> {
        Box::pin(self.sync(key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DIGEST: &str = "sha256:0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef";

    #[test]
    fn import_names_use_digest_prefix() {
        assert_eq!(
            import_name("fedora", DIGEST).as_deref(),
            Some("fedora-0123456789ab")
        );
        assert_eq!(import_name("fedora", "md5:abc"), None);
        assert_eq!(import_name("fedora", "sha256:abc"), None);
    }

    #[test]
    fn digested_url_drops_tag_and_old_digest() {
        assert_eq!(
            digested_url("docker://quay.io/containerdisks/fedora:latest", DIGEST),
            format!("docker://quay.io/containerdisks/fedora@{DIGEST}")
        );
        assert_eq!(
            digested_url("docker://registry:5000/disk@sha256:old", DIGEST),
            format!("docker://registry:5000/disk@{DIGEST}")
        );
        assert_eq!(
            digested_url("docker://registry:5000/disk", DIGEST),
            format!("docker://registry:5000/disk@{DIGEST}")
        );
    }

    #[test]
    fn source_data_volume_is_labelled_and_retained() {
        let mut cron = DataImportCron {
            metadata: ObjectMeta::named(Some("ns"), "nightly"),
            ..Default::default()
        };
        cron.spec.managed_data_source = "fedora".to_string();
        cron.spec.retention_policy = Some(RETAIN_NONE.to_string());
        cron.metadata.set_annotation(ANN_IMMEDIATE_BINDING, "true");
        let dv = source_data_volume(&cron, "fedora-0123456789ab", DIGEST);
        assert_eq!(dv.metadata.label(LABEL_DATA_IMPORT_CRON), Some("nightly"));
        assert_eq!(dv.metadata.label(LABEL_DATA_IMPORT_CRON_CLEANUP), Some("true"));
        assert_eq!(dv.metadata.annotation(ANN_DELETE_AFTER_COMPLETION), Some("false"));
        assert_eq!(dv.metadata.annotation(ANN_IMMEDIATE_BINDING), Some("true"));
    }
}
