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

//! Custom resources served under `cdi.kubevirt.io` plus the annotation keys
//! the controllers exchange through claims.

pub mod annotations;
pub mod cdiconfig;
pub mod conditions;
pub mod dataimportcron;
pub mod datasource;
pub mod datavolume;
pub mod populators;
pub mod storageprofile;
pub mod transfer;
pub mod upload;
