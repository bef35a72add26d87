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

//! Shared plumbing for admission webhooks: response builders and the JSON
//! patch a mutating hook sends back.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::fmt;

use crate::cdi::k8s::admission::{AdmissionRequest, AdmissionResponse, Status};

pub const OPERATION_CREATE: &str = "CREATE";
pub const OPERATION_UPDATE: &str = "UPDATE";

const PATCH_TYPE_JSON: &str = "JSONPatch";
/// Longest name a DNS-1123 subdomain may have.
pub const MAX_NAME_LENGTH: usize = 253;

/// One reason an object was refused, tied to the offending field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusCause {
    pub field: String,
    pub message: String,
}

impl StatusCause {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        StatusCause {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Failure that stops a hook before it reaches a verdict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdmissionError {
    Decode(String),
    UnexpectedResource(String),
    Internal(String),
}

impl fmt::Display for AdmissionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdmissionError::Decode(message) => write!(f, "failed to decode object: {message}"),
            AdmissionError::UnexpectedResource(resource) => write!(f, "unexpected resource: {resource}"),
            AdmissionError::Internal(message) => f.write_str(message),
        }
    }
}

impl std::error::Error for AdmissionError {}

/// Decodes `object` (or `oldObject` when `old` is set) from a request.
pub fn decode<T: DeserializeOwned>(request: &AdmissionRequest, old: bool) -> Result<T, AdmissionError> {
    let raw = if old { &request.old_object } else { &request.object };
    let value = raw
        .clone()
        .ok_or_else(|| AdmissionError::Decode("object is missing".to_string()))?;
    serde_json::from_value(value).map_err(|err| AdmissionError::Decode(err.to_string()))
}

pub fn expect_resource(request: &AdmissionRequest, group: &str, resources: &[&str]) -> Result<(), AdmissionError> {
    let resource = &request.resource;
    if resource.group == group && resources.contains(&resource.resource.as_str()) {
        return Ok(());
    }
    Err(AdmissionError::UnexpectedResource(resource.resource.clone()))
}

pub fn allowed() -> AdmissionResponse {
    AdmissionResponse {
        allowed: true,
        ..Default::default()
    }
}

/// Refusal carrying every cause, joined into one message.
pub fn rejected(causes: &[StatusCause]) -> AdmissionResponse {
    let message = causes
        .iter()
        .map(|cause| cause.message.as_str())
        .collect::<Vec<_>>()
        .join(", ");
    AdmissionResponse {
        allowed: false,
        status: Some(Status {
            code: Some(422),
            message: Some(message),
            reason: Some("Invalid".to_string()),
        }),
        ..Default::default()
    }
}

/// Refusal for a request the hook could not evaluate.
pub fn errored(err: impl fmt::Display) -> AdmissionResponse {
    AdmissionResponse {
        allowed: false,
        status: Some(Status {
            code: Some(400),
            message: Some(err.to_string()),
            reason: Some("BadRequest".to_string()),
        }),
        ..Default::default()
    }
}

pub fn name_length(name: &str, field: &str) -> Option<StatusCause> {
    (name.len() > MAX_NAME_LENGTH).then(|| {
        StatusCause::new(
            field,
            format!("Name cannot be more than {MAX_NAME_LENGTH} characters"),
        )
    })
}

/// Allows the request, attaching a patch from `original` to `modified`
/// when they differ.
pub fn patched<T: Serialize>(original: &T, modified: &T) -> AdmissionResponse {
    let (before, after) = match (serde_json::to_value(original), serde_json::to_value(modified)) {
        (Ok(before), Ok(after)) => (before, after),
        (Err(err), _) | (_, Err(err)) => return errored(err),
    };
    let operations = diff(&before, &after);
    if operations.is_empty() {
        return allowed();
    }
    let encoded = match serde_json::to_vec(&operations) {
        Ok(encoded) => encoded,
        Err(err) => return errored(err),
    };
    AdmissionResponse {
        allowed: true,
        patch: Some(STANDARD.encode(encoded)),
        patch_type: Some(PATCH_TYPE_JSON.to_string()),
        ..Default::default()
    }
}

fn escape(segment: &str) -> String {
    segment.replace('~', "~0").replace('/', "~1")
}

/// RFC 6902 operations turning `before` into `after`. Arrays and scalars
/// are replaced whole.
pub fn diff(before: &Value, after: &Value) -> Vec<Value> {
    let mut operations = Vec::new();
    diff_at("", before, after, &mut operations);
    operations
}

fn diff_at(path: &str, before: &Value, after: &Value, operations: &mut Vec<Value>) {
    match (before, after) {
        (Value::Object(old), Value::Object(new)) => diff_objects(path, old, new, operations),
        _ if before == after => {}
        _ => operations.push(json!({"op": "replace", "path": path, "value": after})),
    }
}

fn diff_objects(path: &str, old: &Map<String, Value>, new: &Map<String, Value>, operations: &mut Vec<Value>) {
    for (key, old_value) in old {
        let child = format!("{path}/{}", escape(key));
        match new.get(key) {
            Some(new_value) => diff_at(&child, old_value, new_value, operations),
            None => operations.push(json!({"op": "remove", "path": child})),
        }
    }
    for (key, new_value) in new {
        if !old.contains_key(key) {
            let child = format!("{path}/{}", escape(key));
            operations.push(json!({"op": "add", "path": child, "value": new_value}));
        }
    }
}
