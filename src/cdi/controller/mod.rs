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

pub mod cdiconfig;
pub mod clone;
pub mod dataimportcron;
pub mod datasource;
pub mod datavolume;
pub mod events;
pub mod hostclone;
pub mod import;
pub mod informer;
pub mod manager;
pub mod pods;
pub mod reconcile;
pub mod runtime;
pub mod storageprofile;
pub mod transfer;
pub mod upload;
