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

use axum::Json;

use crate::cdi::k8s::admission::AdmissionReview;
use crate::cdi::server::AppState;
use crate::cdi::webhook::{self, Webhook};

/// Answers one AdmissionReview; the router binds a handler per [`Webhook`] path.
pub async fn review(state: AppState, hook: Webhook, body: AdmissionReview) -> Json<AdmissionReview> {
    Json(webhook::review(&state.admission, hook, body).await)
}
