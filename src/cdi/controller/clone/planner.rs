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

//! Clone strategy selection. Pure: the caller gathers the source, the
//! rendered target and the storage profiles; the planner decides how the
//! bytes move and why a cheaper path was skipped.

use crate::cdi::api::annotations::ANN_CONTENT_TYPE;
use crate::cdi::api::datavolume::CONTENT_TYPE_KUBEVIRT;
use crate::cdi::api::storageprofile::CloneStrategy;
use crate::cdi::k8s::storage::VolumeSnapshot;
use crate::cdi::k8s::volume::{PersistentVolumeClaim, PersistentVolumeClaimSpec};
use crate::cdi::storage::ResolvedProfile;
use std::fmt;

/// Why a strategy could not be used.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackReason {
    IncompatibleVolumeModes,
    NoVolumeExpansion,
    NoSnapshotClass,
    NoCsiClone,
    /// Storage-level copies stay inside one namespace.
    CrossNamespace,
}

impl FallbackReason {
    pub fn as_str(self) -> &'static str {
        match self {
            FallbackReason::IncompatibleVolumeModes => "IncompatibleVolumeModes",
            FallbackReason::NoVolumeExpansion => "NoVolumeExpansion",
            FallbackReason::NoSnapshotClass => "NoSnapshotClass",
            FallbackReason::NoCsiClone => "NoCSIClone",
            FallbackReason::CrossNamespace => "CrossNamespace",
        }
    }

    pub fn message(self) -> &'static str {
        match self {
            FallbackReason::IncompatibleVolumeModes => "source and target volume modes differ",
            FallbackReason::NoVolumeExpansion => {
                "target is larger than the source and the storage class does not allow volume expansion"
            }
            FallbackReason::NoSnapshotClass => "no volume snapshot class for the source provisioner",
            FallbackReason::NoCsiClone => "the storage class does not support CSI volume cloning",
            FallbackReason::CrossNamespace => "source and target are in different namespaces",
        }
    }
}

impl fmt::Display for FallbackReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the clone reads from.
#[derive(Debug, Clone)]
pub enum CloneSource {
    Claim(PersistentVolumeClaim),
    Snapshot(VolumeSnapshot),
}

impl CloneSource {
    pub fn namespace(&self) -> &str {
        match self {
            CloneSource::Claim(claim) => claim.metadata.namespace(),
            CloneSource::Snapshot(snapshot) => snapshot.metadata.namespace(),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            CloneSource::Claim(claim) => claim.metadata.name(),
            CloneSource::Snapshot(snapshot) => snapshot.metadata.name(),
        }
    }

    pub fn size(&self) -> Option<i64> {
        match self {
            CloneSource::Claim(claim) => claim.capacity(),
            CloneSource::Snapshot(snapshot) => snapshot.restore_size(),
        }
    }
}

pub struct PlanInput<'a> {
    pub source: &'a CloneSource,
    /// Volume mode of the source claim, or of the claim a snapshot was taken from.
    pub source_volume_mode: &'a str,
    pub source_profile: Option<&'a ResolvedProfile>,
    pub target: &'a PersistentVolumeClaimSpec,
    pub target_namespace: &'a str,
    pub target_profile: Option<&'a ResolvedProfile>,
    pub content_type: &'a str,
    pub forced: Option<CloneStrategy>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClonePlan {
    pub strategy: CloneStrategy,
    /// The preferred strategy and why it was skipped.
    pub fallback: Option<(CloneStrategy, FallbackReason)>,
    /// Host copies from a snapshot first restore it into a temporary claim.
    pub temporary_source: bool,
    /// The target is provisioned at the source size and grown afterwards.
    pub expand: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanError {
    /// Target smaller than the source.
    IncompatibleSize { source: i64, target: i64 },
    IncompatibleContentType { source: String, target: String },
    /// The annotated strategy cannot run.
    Infeasible(CloneStrategy, FallbackReason),
}

impl fmt::Display for PlanError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlanError::IncompatibleSize { source, target } => write!(
                f,
                "target resources requests storage size is smaller than the source ({target} < {source})"
            ),
            PlanError::IncompatibleContentType { source, target } => write!(
                f,
                "source contentType ({source}) and target contentType ({target}) do not match"
            ),
            PlanError::Infeasible(strategy, reason) => {
                write!(f, "clone strategy {strategy} cannot be used: {}", reason.message())
            }
        }
    }
}

impl std::error::Error for PlanError {}

pub fn plan(input: &PlanInput<'_>) -> Result<ClonePlan, PlanError> {
    let source_size = input.source.size();
    let target_size = input.target.requested_storage();
    if let (Some(source), Some(target)) = (source_size, target_size) {
        if target < source {
            return Err(PlanError::IncompatibleSize { source, target });
        }
    }
    if let CloneSource::Claim(claim) = input.source {
        let source_type = claim
            .metadata
            .annotation(ANN_CONTENT_TYPE)
            .unwrap_or(CONTENT_TYPE_KUBEVIRT);
        if source_type != input.content_type {
            return Err(PlanError::IncompatibleContentType {
                source: source_type.to_string(),
                target: input.content_type.to_string(),
            });
        }
    }

    let preferred = input
        .forced
        .or_else(|| input.target_profile.map(ResolvedProfile::effective_clone_strategy))
        .unwrap_or(CloneStrategy::HostAssisted);
    let larger = matches!((source_size, target_size), (Some(s), Some(t)) if t > s);
    let feasibility = match preferred {
        CloneStrategy::HostAssisted => Ok(false),
        CloneStrategy::Snapshot => check_snapshot(input, larger),
        CloneStrategy::CsiClone => check_csi(input).map(|()| false),
    };
    match feasibility {
        Ok(expand) => Ok(ClonePlan {
            strategy: preferred,
            fallback: None,
            temporary_source: preferred == CloneStrategy::HostAssisted
                && matches!(input.source, CloneSource::Snapshot(_)),
            expand,
        }),
        Err(reason) if input.forced.is_some() => Err(PlanError::Infeasible(preferred, reason)),
        Err(reason) => Ok(ClonePlan {
            strategy: CloneStrategy::HostAssisted,
            fallback: Some((preferred, reason)),
            temporary_source: matches!(input.source, CloneSource::Snapshot(_)),
            expand: false,
        }),
    }
}

fn same_storage(input: &PlanInput<'_>) -> bool {
    match (input.source_profile, input.target_profile) {
        (Some(source), Some(target)) => {
            source.storage_class == target.storage_class && source.provisioner == target.provisioner
        }
        _ => false,
    }
}

/// Ok(expand) when a snapshot restore can produce the target.
fn check_snapshot(input: &PlanInput<'_>, larger: bool) -> Result<bool, FallbackReason> {
    let Some(target) = input.target_profile else {
        return Err(FallbackReason::NoSnapshotClass);
    };
    if input.source.namespace() != input.target_namespace {
        return Err(FallbackReason::CrossNamespace);
    }
    if let CloneSource::Claim(_) = input.source {
        if target.snapshot_class.is_none() || !same_storage(input) {
            return Err(FallbackReason::NoSnapshotClass);
        }
    }
    if input.source_volume_mode != input.target.volume_mode_or_default() {
        return Err(FallbackReason::IncompatibleVolumeModes);
    }
    if larger && !target.allow_volume_expansion {
        return Err(FallbackReason::NoVolumeExpansion);
    }
    Ok(larger)
}

fn check_csi(input: &PlanInput<'_>) -> Result<(), FallbackReason> {
    let CloneSource::Claim(_) = input.source else {
        return Err(FallbackReason::NoCsiClone);
    };
    let supported = input
        .target_profile
        .map(|profile| profile.csi_clone_supported)
        .unwrap_or(false);
    if !supported || !same_storage(input) {
        return Err(FallbackReason::NoCsiClone);
    }
    if input.source.namespace() != input.target_namespace {
        return Err(FallbackReason::CrossNamespace);
    }
    if input.source_volume_mode != input.target.volume_mode_or_default() {
        return Err(FallbackReason::IncompatibleVolumeModes);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cdi::k8s::meta::ObjectMeta;
    use crate::cdi::k8s::storage::VolumeSnapshotStatus;
    use crate::cdi::k8s::volume::{VOLUME_MODE_BLOCK, VOLUME_MODE_FILESYSTEM};
    use crate::cdi::test_support::claim_spec;

    fn profile(snapshots: bool, csi: bool, expansion: bool) -> ResolvedProfile {
        ResolvedProfile {
            storage_class: "sc1".into(),
            provisioner: "csi.example.com".into(),
            snapshot_class: snapshots.then(|| "snapclass".to_string()),
            csi_clone_supported: csi,
            allow_volume_expansion: expansion,
            ..Default::default()
        }
    }

    fn source_claim(size: &str) -> CloneSource {
        CloneSource::Claim(PersistentVolumeClaim {
            metadata: ObjectMeta::named(Some("ns"), "src"),
            spec: claim_spec(size, Some("sc1")),
            status: None,
        })
    }

    fn input<'a>(
        source: &'a CloneSource,
        target: &'a PersistentVolumeClaimSpec,
        profile: &'a ResolvedProfile,
    ) -> PlanInput<'a> {
        PlanInput {
            source,
            source_volume_mode: VOLUME_MODE_FILESYSTEM,
            source_profile: Some(profile),
            target,
            target_namespace: "ns",
            target_profile: Some(profile),
            content_type: CONTENT_TYPE_KUBEVIRT,
            forced: None,
        }
    }

    #[test]
    fn snapshot_capable_profile_uses_snapshots() {
        let source = source_claim("1Gi");
        let target = claim_spec("1Gi", Some("sc1"));
        let profile = profile(true, true, false);
        let plan = plan(&input(&source, &target, &profile)).unwrap();
        assert_eq!(plan.strategy, CloneStrategy::Snapshot);
        assert_eq!(plan.fallback, None);
        assert!(!plan.expand);
    }

    #[test]
    fn larger_target_without_expansion_falls_back() {
        let source = source_claim("1Gi");
        let target = claim_spec("2Gi", Some("sc1"));
        let profile = profile(true, false, false);
        let plan = plan(&input(&source, &target, &profile)).unwrap();
        assert_eq!(plan.strategy, CloneStrategy::HostAssisted);
        assert_eq!(
            plan.fallback,
            Some((CloneStrategy::Snapshot, FallbackReason::NoVolumeExpansion))
        );

        let expandable = ResolvedProfile {
            allow_volume_expansion: true,
            ..profile
        };
        let plan = super::plan(&input(&source, &target, &expandable)).unwrap();
        assert_eq!(plan.strategy, CloneStrategy::Snapshot);
        assert!(plan.expand);
    }

    #[test]
    fn volume_mode_mismatch_is_reported() {
        let source = source_claim("1Gi");
        let mut target = claim_spec("1Gi", Some("sc1"));
        target.volume_mode = Some(VOLUME_MODE_BLOCK.to_string());
        let profile = profile(false, true, false);
        let plan = plan(&input(&source, &target, &profile)).unwrap();
        assert_eq!(
            plan.fallback,
            Some((CloneStrategy::CsiClone, FallbackReason::IncompatibleVolumeModes))
        );
    }

    #[test]
    fn forced_strategy_is_never_replaced() {
        let source = source_claim("1Gi");
        let target = claim_spec("1Gi", Some("sc1"));
        let profile = profile(false, false, false);
        let mut request = input(&source, &target, &profile);
        request.forced = Some(CloneStrategy::CsiClone);
        assert_eq!(
            plan(&request),
            Err(PlanError::Infeasible(CloneStrategy::CsiClone, FallbackReason::NoCsiClone))
        );
    }

    #[test]
    fn smaller_target_and_content_mismatch_fail() {
        let source = source_claim("2Gi");
        let target = claim_spec("1Gi", Some("sc1"));
        let profile = profile(false, false, false);
        assert!(matches!(
            plan(&input(&source, &target, &profile)),
            Err(PlanError::IncompatibleSize { .. })
        ));

        let source = source_claim("1Gi");
        let target = claim_spec("1Gi", Some("sc1"));
        let mut request = input(&source, &target, &profile);
        request.content_type = "archive";
        assert!(matches!(
            plan(&request),
            Err(PlanError::IncompatibleContentType { .. })
        ));
    }

    #[test]
    fn snapshot_sources_copy_through_a_temporary_claim() {
        let source = CloneSource::Snapshot(VolumeSnapshot {
            metadata: ObjectMeta::named(Some("ns"), "snap"),
            status: Some(VolumeSnapshotStatus {
                ready_to_use: Some(true),
                restore_size: Some("1Gi".into()),
                ..Default::default()
            }),
            ..Default::default()
        });
        let target = claim_spec("2Gi", Some("sc1"));
        let profile = profile(true, false, false);
        let plan = plan(&input(&source, &target, &profile)).unwrap();
        assert_eq!(plan.strategy, CloneStrategy::HostAssisted);
        assert!(plan.temporary_source);
        assert_eq!(
            plan.fallback,
            Some((CloneStrategy::Snapshot, FallbackReason::NoVolumeExpansion))
        );
    }
}
