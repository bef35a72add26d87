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

use super::{ClientError, ClientFuture, ClusterClient, WatchStream};
use crate::cdi::controller::runtime::WatchEvent;
use crate::cdi::k8s::authorization::SubjectAccessReview;
use crate::cdi::k8s::resource::ResourceKind;
use crate::cdi::logger::log_warn;
use bytes::{Buf, BytesMut};
use futures_util::stream::{self, StreamExt};
use reqwest::{Certificate, Client, Method, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::time::Duration;

const COMPONENT: &str = "cluster-client";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const SERVICE_ACCOUNT_CA: &str = "/var/run/secrets/kubernetes.io/serviceaccount/ca.crt";

#[derive(Debug, Deserialize, Default)]
struct StatusBody {
    #[serde(default)]
    reason: String,
    #[serde(default)]
    message: String,
}

/// REST client for a real API server, authenticated with a bearer token file.
pub struct HttpClusterClient {
    client: Client,
    watch_client: Client,
    base_url: String,
    token_file: Option<PathBuf>,
}

impl HttpClusterClient {
    pub fn new(base_url: &str, token_file: Option<PathBuf>) -> Result<Self, ClientError> {
        let mut builder = Client::builder().timeout(REQUEST_TIMEOUT);
        let mut watch_builder = Client::builder();
        if let Ok(pem) = std::fs::read(SERVICE_ACCOUNT_CA) {
            let certificate = Certificate::from_pem(&pem)
                .map_err(|err| ClientError::Transport(format!("invalid cluster CA: {err}")))?;
            builder = builder.add_root_certificate(certificate.clone());
            watch_builder = watch_builder.add_root_certificate(certificate);
        }
        let client = builder
            .build()
            .map_err(|err| ClientError::Transport(err.to_string()))?;
        let watch_client = watch_builder
            .build()
            .map_err(|err| ClientError::Transport(err.to_string()))?;
        Ok(HttpClusterClient {
            client,
            watch_client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token_file,
        })
    }

    fn collection_path(&self, kind: ResourceKind, namespace: Option<&str>) -> String {
        let prefix = match kind.group() {
            "" => format!("{}/api/{}", self.base_url, kind.version()),
            group => format!("{}/apis/{}/{}", self.base_url, group, kind.version()),
        };
        match namespace.filter(|ns| kind.namespaced() && !ns.is_empty()) {
            Some(namespace) => format!("{prefix}/namespaces/{namespace}/{}", kind.plural()),
            None => format!("{prefix}/{}", kind.plural()),
        }
    }

    fn object_path(&self, kind: ResourceKind, namespace: Option<&str>, name: &str) -> String {
        format!("{}/{}", self.collection_path(kind, namespace), name)
    }

    fn object_location(&self, kind: ResourceKind, object: &Value) -> Result<String, ClientError> {
        let name = object
            .pointer("/metadata/name")
            .and_then(Value::as_str)
            .ok_or_else(|| ClientError::Invalid("metadata.name is required".to_string()))?;
        let namespace = object.pointer("/metadata/namespace").and_then(Value::as_str);
        Ok(self.object_path(kind, namespace, name))
    }

    async fn authorize(&self, request: RequestBuilder) -> Result<RequestBuilder, ClientError> {
        match &self.token_file {
            Some(path) => {
                let token = read_token(path).await?;
                Ok(request.bearer_auth(token))
            }
            None => Ok(request),
        }
    }

    async fn send(
        &self,
        method: Method,
        url: String,
        body: Option<&Value>,
    ) -> Result<Value, ClientError> {
        let mut request = self.client.request(method, url);
        if let Some(body) = body {
            request = request.json(body);
        }
        let response = self
            .authorize(request)
            .await?
            .send()
            .await
            .map_err(|err| ClientError::Transport(err.to_string()))?;
        decode_response(response).await
    }
}

async fn read_token(path: &Path) -> Result<String, ClientError> {
    tokio::fs::read_to_string(path)
        .await
        .map(|token| token.trim().to_string())
        .map_err(|err| ClientError::Transport(format!("read token {}: {err}", path.display())))
}

async fn decode_response(response: Response) -> Result<Value, ClientError> {
    let status = response.status();
    let body = response
        .bytes()
        .await
        .map_err(|err| ClientError::Transport(err.to_string()))?;
    if status.is_success() {
        if body.is_empty() {
            return Ok(Value::Null);
        }
        return serde_json::from_slice(&body).map_err(ClientError::from);
    }
    let details: StatusBody = serde_json::from_slice(&body).unwrap_or_default();
    Err(status_error(status, details))
}

fn status_error(status: StatusCode, details: StatusBody) -> ClientError {
    match status {
        StatusCode::NOT_FOUND => ClientError::NotFound,
        StatusCode::CONFLICT if details.reason == "AlreadyExists" => ClientError::AlreadyExists,
        StatusCode::CONFLICT => ClientError::Conflict,
        StatusCode::FORBIDDEN => ClientError::Forbidden(details.message),
        StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => {
            ClientError::Invalid(details.message)
        }
        other => ClientError::Transport(format!("{other}: {}", details.message)),
    }
}

/// Splits a newline-delimited JSON body into watch events.
fn drain_lines(buffer: &mut BytesMut) -> Vec<Result<WatchEvent<Value>, ClientError>> {
    let mut events = Vec::new();
    while let Some(position) = buffer.iter().position(|byte| *byte == b'\n') {
        let line = buffer.split_to(position);
        buffer.advance(1);
        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }
        events.push(serde_json::from_slice(&line).map_err(ClientError::from));
    }
    events
}

impl ClusterClient for HttpClusterClient {
    fn get<'a>(
        &'a self,
        kind: ResourceKind,
        namespace: Option<&'a str>,
        name: &'a str,
    ) -> ClientFuture<'a, Value> {
        Box::pin(async move {
            self.send(Method::GET, self.object_path(kind, namespace, name), None)
                .await
        })
    }

    fn list<'a>(
        &'a self,
        kind: ResourceKind,
        namespace: Option<&'a str>,
        selector: Option<&'a str>,
    ) -> ClientFuture<'a, Vec<Value>> {
        Box::pin(async move {
            let mut request = self
                .client
                .get(self.collection_path(kind, namespace));
            if let Some(selector) = selector.filter(|s| !s.is_empty()) {
                request = request.query(&[("labelSelector", selector)]);
            }
            let response = self
                .authorize(request)
                .await?
                .send()
                .await
                .map_err(|err| ClientError::Transport(err.to_string()))?;
            let mut body = decode_response(response).await?;
            let items = match body.get_mut("items").map(Value::take) {
                Some(Value::Array(items)) => items,
                _ => Vec::new(),
            };
            // list items omit apiVersion/kind
            Ok(items
                .into_iter()
                .map(|mut item| {
                    if let Some(map) = item.as_object_mut() {
                        map.insert("apiVersion".into(), Value::String(kind.api_version()));
                        map.insert("kind".into(), Value::String(kind.kind().to_string()));
                    }
                    item
                })
                .collect())
        })
    }

    fn create(&self, kind: ResourceKind, object: Value) -> ClientFuture<'_, Value> {
        Box::pin(async move {
            let namespace = object
                .pointer("/metadata/namespace")
                .and_then(Value::as_str)
                .map(str::to_string);
            let url = self.collection_path(kind, namespace.as_deref());
            self.send(Method::POST, url, Some(&object)).await
        })
    }

    fn update(&self, kind: ResourceKind, object: Value) -> ClientFuture<'_, Value> {
        Box::pin(async move {
            let url = self.object_location(kind, &object)?;
            self.send(Method::PUT, url, Some(&object)).await
        })
    }

    fn update_status(&self, kind: ResourceKind, object: Value) -> ClientFuture<'_, Value> {
        Box::pin(async move {
            let url = format!("{}/status", self.object_location(kind, &object)?);
            self.send(Method::PUT, url, Some(&object)).await
        })
    }

    fn delete<'a>(
        &'a self,
        kind: ResourceKind,
        namespace: Option<&'a str>,
        name: &'a str,
    ) -> ClientFuture<'a, ()> {
        Box::pin(async move {
            let body = serde_json::json!({
                "apiVersion": "v1",
                "kind": "DeleteOptions",
                "propagationPolicy": "Background",
            });
            self.send(
                Method::DELETE,
                self.object_path(kind, namespace, name),
                Some(&body),
            )
            .await
            .map(|_| ())
        })
    }

    fn watch(&self, kind: ResourceKind) -> ClientFuture<'_, WatchStream> {
        Box::pin(async move {
            let request = self
                .watch_client
                .get(self.collection_path(kind, None))
                .query(&[("watch", "true"), ("allowWatchBookmarks", "false")]);
            let response = self
                .authorize(request)
                .await?
                .send()
                .await
                .map_err(|err| ClientError::Transport(err.to_string()))?;
            if !response.status().is_success() {
                let status = response.status();
                log_warn(
                    COMPONENT,
                    "Watch request rejected",
                    &[("kind", kind.kind()), ("status", status.as_str())],
                );
                return Err(status_error(status, StatusBody::default()));
            }
            let chunks = Box::pin(response.bytes_stream());
            let events = stream::unfold(
                (chunks, BytesMut::new()),
                |(mut chunks, mut buffer)| async move {
                    match chunks.next().await {
                        Some(Ok(chunk)) => {
                            buffer.extend_from_slice(&chunk);
                            let events = drain_lines(&mut buffer);
                            Some((stream::iter(events), (chunks, buffer)))
                        }
                        Some(Err(err)) => Some((
                            stream::iter(vec![Err(ClientError::Transport(err.to_string()))]),
                            (chunks, buffer),
                        )),
                        None => None,
                    }
                },
            )
            .flatten();
            Ok(Box::pin(events) as WatchStream)
        })
    }

    fn create_subject_access_review(
        &self,
        review: SubjectAccessReview,
    ) -> ClientFuture<'_, SubjectAccessReview> {
        Box::pin(async move {
            let url = format!(
                "{}/apis/authorization.k8s.io/v1/subjectaccessreviews",
                self.base_url
            );
            let body = serde_json::to_value(&review)?;
            let value = self.send(Method::POST, url, Some(&body)).await?;
            serde_json::from_value(value).map_err(ClientError::from)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_follow_api_groups() {
        let client = HttpClusterClient::new("https://api:6443/", None).unwrap();
        assert_eq!(
            client.object_path(ResourceKind::PersistentVolumeClaim, Some("ns"), "claim"),
            "https://api:6443/api/v1/namespaces/ns/persistentvolumeclaims/claim"
        );
        assert_eq!(
            client.collection_path(ResourceKind::StorageProfile, Some("ignored")),
            "https://api:6443/apis/cdi.kubevirt.io/v1beta1/storageprofiles"
        );
    }

    #[test]
    fn ndjson_lines_are_split() {
        let mut buffer = BytesMut::from(
            &b"{\"type\":\"ADDED\",\"object\":{\"a\":1}}\n\n{\"type\":\"DELETED\",\"obj"[..],
        );
        let events = drain_lines(&mut buffer);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].as_ref().unwrap().event_type, "ADDED");
        assert_eq!(&buffer[..], b"{\"type\":\"DELETED\",\"obj");
    }
}
