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

//! Hand-written Kubernetes object models. Only the fields the control plane
//! reads or writes are modelled; the wire format is the upstream JSON.

pub mod admission;
pub mod authorization;
pub mod discovery;
pub mod event;
pub mod meta;
pub mod objects;
pub mod pod;
pub mod proxy;
pub mod resource;
pub mod storage;
pub mod volume;
