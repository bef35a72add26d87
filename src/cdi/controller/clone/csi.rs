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

//! CSI volume clone: the driver copies the source when the target names it
//! as its data source.

use super::planner::CloneSource;
use super::{desired_size, CloneEngine, CloneProgress};
use crate::cdi::api::annotations::ANN_CLONE_TYPE;
use crate::cdi::api::datavolume::{DataVolume, DataVolumePhase};
use crate::cdi::api::storageprofile::CloneStrategy;
use crate::cdi::controller::events::CSI_CLONE_IN_PROGRESS;
use crate::cdi::controller::reconcile::ReconcileError;
use crate::cdi::k8s::volume::{PersistentVolumeClaim, TypedLocalObjectReference};

pub fn claim_data_source(name: &str) -> TypedLocalObjectReference {
    TypedLocalObjectReference {
        api_group: None,
        kind: "PersistentVolumeClaim".to_string(),
        name: name.to_string(),
    }
}

impl CloneEngine {
    pub(super) async fn start_csi(
        &self,
        source: &CloneSource,
        mut base: PersistentVolumeClaim,
    ) -> Result<CloneProgress, ReconcileError> {
        let CloneSource::Claim(source) = source else {
            return Err(ReconcileError::Invalid(
                "CSI clones need a source claim".to_string(),
            ));
        };
        base.metadata
            .set_annotation(ANN_CLONE_TYPE, CloneStrategy::CsiClone.as_str());
        base.spec.data_source = Some(claim_data_source(source.metadata.name()));
        let claim = self.create_target(base).await?;
        self.recorder
            .normal(
                &claim,
                CSI_CLONE_IN_PROGRESS,
                &format!("CSI Volume clone in progress (for pvc {})", source.metadata.name()),
            )
            .await;
        Ok(CloneProgress::new(
            DataVolumePhase::CsiCloneInProgress,
            Some(claim),
        ))
    }

    pub(super) async fn progress_csi(
        &self,
        _dv: &DataVolume,
        claim: PersistentVolumeClaim,
    ) -> Result<CloneProgress, ReconcileError> {
        if !claim.is_bound() {
            return Ok(CloneProgress::new(
                DataVolumePhase::CsiCloneInProgress,
                Some(claim),
            ));
        }
        if let (Some(desired), Some(capacity)) = (desired_size(&claim), claim.capacity()) {
            if capacity < desired {
                return Ok(CloneProgress::new(
                    DataVolumePhase::ExpansionInProgress,
                    Some(claim),
                ));
            }
        }
        let claim = self.mark_populated(claim).await?;
        Ok(CloneProgress::new(DataVolumePhase::Succeeded, Some(claim)))
    }
}
