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

//! Admission webhooks served by the API front-end. Each hook receives an
//! `AdmissionReview`, decides on its request and answers with the same
//! review carrying a response.

pub mod admission;
pub mod dataimportcron;
pub mod datavolume;
pub mod populators;
pub mod transfer;

use std::sync::Arc;

use crate::cdi::api::cdiconfig::{CdiConfig, CDI_CONFIG_NAME};
use crate::cdi::client::{Api, ClientError, ClusterClient};
use crate::cdi::k8s::admission::{AdmissionResponse, AdmissionReview, ADMISSION_API_VERSION};
use crate::cdi::logger::{log_debug, log_info};
use crate::cdi::storage::profile::ProfileRegistry;
use crate::cdi::token::keys::KeyStore;

const COMPONENT: &str = "webhook";

/// Group of every resource the hooks admit.
pub const CDI_GROUP: &str = "cdi.kubevirt.io";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Webhook {
    DataVolumeValidate,
    DataVolumeMutate,
    DataImportCronValidate,
    DataImportCronMutate,
    ObjectTransferValidate,
    PopulatorValidate,
}

impl Webhook {
    pub const ALL: [Webhook; 6] = [
        Webhook::DataVolumeValidate,
        Webhook::DataVolumeMutate,
        Webhook::DataImportCronValidate,
        Webhook::DataImportCronMutate,
        Webhook::ObjectTransferValidate,
        Webhook::PopulatorValidate,
    ];

    pub fn path(self) -> &'static str {
        match self {
            Webhook::DataVolumeValidate => "/datavolume-validate",
            Webhook::DataVolumeMutate => "/datavolume-mutate",
            Webhook::DataImportCronValidate => "/dataimportcron-validate",
            Webhook::DataImportCronMutate => "/dataimportcron-mutate",
            Webhook::ObjectTransferValidate => "/objecttransfer-validate",
            Webhook::PopulatorValidate => "/populator-validate",
        }
    }
}

/// What the hooks need from the cluster.
pub struct AdmissionContext {
    pub client: Arc<dyn ClusterClient>,
    pub keys: Arc<KeyStore>,
    pub profiles: Arc<ProfileRegistry>,
}

impl AdmissionContext {
    pub fn new(client: Arc<dyn ClusterClient>, keys: Arc<KeyStore>, profiles: Arc<ProfileRegistry>) -> Self {
        AdmissionContext { client, keys, profiles }
    }

    pub fn api<T: crate::cdi::k8s::resource::Resource>(&self) -> Api<T> {
        Api::new(Arc::clone(&self.client))
    }

    /// The cluster configuration, or defaults before it exists.
    pub async fn config(&self) -> Result<CdiConfig, ClientError> {
        Ok(self
            .api::<CdiConfig>()
            .get_opt("", CDI_CONFIG_NAME)
            .await?
            .unwrap_or_default())
    }
}

/// Runs `hook` over `review`, echoing the request UID and API version.
pub async fn review(ctx: &AdmissionContext, hook: Webhook, review: AdmissionReview) -> AdmissionReview {
    let api_version = if review.api_version.is_empty() {
        ADMISSION_API_VERSION.to_string()
    } else {
        review.api_version.clone()
    };
    let mut response = match &review.request {
        None => admission::errored("AdmissionReview.Request is nil"),
        Some(request) => {
            log_debug(
                COMPONENT,
                "Handling admission request",
                &[
                    ("path", hook.path()),
                    ("operation", request.operation.as_str()),
                    ("namespace", request.namespace.as_str()),
                    ("name", request.name.as_str()),
                ],
            );
            let response = match hook {
                Webhook::DataVolumeValidate => datavolume::validate(ctx, request).await,
                Webhook::DataVolumeMutate => datavolume::mutate(ctx, request).await,
                Webhook::DataImportCronValidate => dataimportcron::validate(ctx, request).await,
                Webhook::DataImportCronMutate => dataimportcron::mutate(request),
                Webhook::ObjectTransferValidate => transfer::validate(ctx, request).await,
                Webhook::PopulatorValidate => populators::validate(request),
            };
            if !response.allowed {
                let message = response
                    .status
                    .as_ref()
                    .and_then(|status| status.message.clone())
                    .unwrap_or_default();
                log_info(
                    COMPONENT,
                    "Rejected admission request",
                    &[
                        ("path", hook.path()),
                        ("namespace", request.namespace.as_str()),
                        ("name", request.name.as_str()),
                        ("reason", message.as_str()),
                    ],
                );
            }
            response
        }
    };
    response.uid = review
        .request
        .as_ref()
        .map(|request| request.uid.clone())
        .unwrap_or_default();
    AdmissionReview {
        api_version,
        ..AdmissionReview::for_response(response)
    }
}

/// Shorthand for hooks that fail on client errors.
pub(crate) fn client_failure(err: ClientError) -> AdmissionResponse {
    admission::errored(err)
}
