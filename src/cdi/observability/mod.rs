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

//! Observability primitives shared across the CDI control plane.
//!
//! Metrics are registered under the `kubevirt_cdi` prefix so existing alert
//! rules and dashboards keep matching. Log lines carry the trace context
//! installed by [`tracing::with_span`].

pub mod health;
pub mod metrics;
pub mod tracing;
