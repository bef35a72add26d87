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

use super::admission::{self, StatusCause, OPERATION_CREATE, OPERATION_UPDATE};
use super::{client_failure, AdmissionContext, CDI_GROUP};
use crate::cdi::api::datavolume::DataVolume;
use crate::cdi::api::transfer::{ObjectTransfer, ObjectTransferSpec};
use crate::cdi::client::ClientError;
use crate::cdi::k8s::admission::{AdmissionRequest, AdmissionResponse};
use crate::cdi::k8s::volume::PersistentVolumeClaim;

const RESOURCE: &str = "objecttransfers";
const KIND_DATA_VOLUME: &str = "DataVolume";
const KIND_CLAIM: &str = "PersistentVolumeClaim";

fn check_spec(spec: &ObjectTransferSpec) -> Option<StatusCause> {
    if spec.target.namespace.is_none() && spec.target.name.is_none() {
        return Some(StatusCause::new("spec.target", "Target namespace and/or target name must be supplied"));
    }
    if spec.source.name.is_empty() || spec.source.namespace.is_empty() {
        return Some(StatusCause::new("spec.source", "Source namespace and name must be supplied"));
    }
    if spec.source.kind != KIND_DATA_VOLUME && spec.source.kind != KIND_CLAIM {
        return Some(StatusCause::new(
            "spec.source.kind",
            format!("Unsupported kind {}", spec.source.kind),
        ));
    }
    None
}

async fn target_exists(ctx: &AdmissionContext, transfer: &ObjectTransfer) -> Result<bool, ClientError> {
    let (namespace, name) = (transfer.target_namespace(), transfer.target_name());
    if transfer.spec.source.kind == KIND_DATA_VOLUME {
        Ok(ctx.api::<DataVolume>().get_opt(namespace, name).await?.is_some())
    } else {
        Ok(ctx.api::<PersistentVolumeClaim>().get_opt(namespace, name).await?.is_some())
    }
}

/// Name of another transfer already claiming the same source, if any.
async fn competing_transfer(ctx: &AdmissionContext, transfer: &ObjectTransfer) -> Result<Option<String>, ClientError> {
    let others = ctx.api::<ObjectTransfer>().list(None, None).await?;
    Ok(others
        .into_iter()
        .find(|other| {
            other.metadata.name() != transfer.metadata.name()
                && other.spec.source.kind == transfer.spec.source.kind
                && other.spec.source.namespace == transfer.spec.source.namespace
                && other.spec.source.name == transfer.spec.source.name
        })
        .map(|other| other.metadata.name().to_string()))
}

pub async fn validate(ctx: &AdmissionContext, request: &AdmissionRequest) -> AdmissionResponse {
    if let Err(err) = admission::expect_resource(request, CDI_GROUP, &[RESOURCE]) {
        return admission::errored(err);
    }
    let transfer: ObjectTransfer = match admission::decode(request, false) {
        Ok(transfer) => transfer,
        Err(err) => return admission::errored(err),
    };
    if request.operation == OPERATION_UPDATE {
        let old: ObjectTransfer = match admission::decode(request, true) {
            Ok(old) => old,
            Err(err) => return admission::errored(err),
        };
        if old.spec != transfer.spec {
            return admission::errored("ObjectTransfer spec is immutable");
        }
        return admission::allowed();
    }
    if request.operation != OPERATION_CREATE {
        return admission::allowed();
    }
    if let Some(cause) = check_spec(&transfer.spec) {
        return admission::rejected(&[cause]);
    }
    match target_exists(ctx, &transfer).await {
        Ok(true) => {
            return admission::rejected(&[StatusCause::new(
                "spec.target",
                format!(
                    "{} {}/{} already exists",
                    transfer.spec.source.kind,
                    transfer.target_namespace(),
                    transfer.target_name()
                ),
            )])
        }
        Ok(false) => {}
        Err(err) => return client_failure(err),
    }
    match competing_transfer(ctx, &transfer).await {
        Ok(Some(other)) => admission::rejected(&[StatusCause::new(
            "spec.source",
            format!("Source is already being transferred by {other}"),
        )]),
        Ok(None) => admission::allowed(),
        Err(err) => client_failure(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cdi::api::transfer::{TransferSource, TransferTarget};

    fn spec(kind: &str, target: TransferTarget) -> ObjectTransferSpec {
        ObjectTransferSpec {
            source: TransferSource {
                kind: kind.to_string(),
                namespace: "source".to_string(),
                name: "disk".to_string(),
                ..Default::default()
            },
            target,
            parent_name: None,
        }
    }

    #[test]
    fn a_target_must_be_named() {
        let cause = check_spec(&spec(KIND_CLAIM, TransferTarget::default())).expect("rejected");
        assert_eq!(cause.field, "spec.target");
    }

    #[test]
    fn only_claims_and_data_volumes_move() {
        let target = TransferTarget {
            namespace: Some("target".to_string()),
            name: None,
        };
        assert!(check_spec(&spec(KIND_CLAIM, target.clone())).is_none());
        assert!(check_spec(&spec(KIND_DATA_VOLUME, target.clone())).is_none());
        let cause = check_spec(&spec("Secret", target)).expect("rejected");
        assert_eq!(cause.message, "Unsupported kind Secret");
    }
}
