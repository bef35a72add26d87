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

use std::env;
use std::fmt;
use std::net::SocketAddr;
use std::path::{Component, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// File-system locations consumed by the control plane.
#[derive(Debug, Clone, Copy)]
pub enum Config {
    CertDir,
    SigningKeyDir,
}

impl Config {
    pub fn env_var(&self) -> &'static str {
        match self {
            Config::CertDir => "CDI_CERT_DIR",
            Config::SigningKeyDir => "CDI_SIGNING_KEY_DIR",
        }
    }

    pub fn default_path(&self) -> &'static str {
        match self {
            Config::CertDir => {
                #[cfg(test)]
                {
                    "/tmp/cdi-test/certs"
                }
                #[cfg(not(test))]
                {
                    "/var/run/certs/cdi-apiserver-server-cert"
                }
            }
            Config::SigningKeyDir => {
                #[cfg(test)]
                {
                    "/tmp/cdi-test/signing-key"
                }
                #[cfg(not(test))]
                {
                    "/var/run/cdi/signing-key"
                }
            }
        }
    }

    /// Returns the effective path, either from the environment or the default.
    pub fn get_path(&self) -> PathBuf {
        env::var(self.env_var()).map_or_else(
            |_| Self::normalize_path(self.default_path()),
            |value| Self::normalize_path(&value),
        )
    }

    /// Expands `~`, resolves `.`/`..` and makes the path absolute.
    fn normalize_path(input: &str) -> PathBuf {
        let path: PathBuf = match input {
            _ if input.starts_with("~/") => env::var("HOME")
                .ok()
                .map(|home| PathBuf::from(home).join(&input[2..])),
            _ if !input.starts_with('/') => env::current_dir().ok().map(|cwd| cwd.join(input)),
            _ => None,
        }
        .unwrap_or_else(|| PathBuf::from(input));

        path.components()
            .fold(PathBuf::new(), |mut normalized, component| {
                match component {
                    Component::CurDir => {}
                    Component::ParentDir => {
                        normalized.pop();
                    }
                    _ => normalized.push(component),
                }
                normalized
            })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigError {
    pub variable: &'static str,
    pub value: String,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid value '{}' for {}", self.value, self.variable)
    }
}

impl std::error::Error for ConfigError {}

/// Process settings shared by the controller manager and the API server.
#[derive(Debug, Clone)]
pub struct Settings {
    pub namespace: String,
    pub importer_image: String,
    pub uploadserver_image: String,
    pub cloner_image: String,
    pub poller_image: String,
    pub pull_policy: String,
    pub verbosity: String,
    pub workers: usize,
    pub reconcile_timeout: Duration,
    pub api_bind: SocketAddr,
    pub metrics_bind: SocketAddr,
    pub kube_api: Option<String>,
    pub kube_token_file: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            namespace: "cdi".to_string(),
            importer_image: "quay.io/kubevirt/cdi-importer:latest".to_string(),
            uploadserver_image: "quay.io/kubevirt/cdi-uploadserver:latest".to_string(),
            cloner_image: "quay.io/kubevirt/cdi-cloner:latest".to_string(),
            poller_image: "quay.io/kubevirt/cdi-importer:latest".to_string(),
            pull_policy: "IfNotPresent".to_string(),
            verbosity: "1".to_string(),
            workers: 3,
            reconcile_timeout: Duration::from_secs(180),
            api_bind: SocketAddr::from(([0, 0, 0, 0], 8443)),
            metrics_bind: SocketAddr::from(([0, 0, 0, 0], 8080)),
            kube_api: None,
            kube_token_file: None,
        }
    }
}

impl Settings {
    /// Loads settings from the process environment on top of the defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut settings = Settings::default();
        let text = |key: &'static str, target: &mut String| {
            if let Some(value) = lookup(key).filter(|value| !value.trim().is_empty()) {
                *target = value;
            }
        };
        text("CDI_NAMESPACE", &mut settings.namespace);
        text("IMPORTER_IMAGE", &mut settings.importer_image);
        text("UPLOADSERVER_IMAGE", &mut settings.uploadserver_image);
        text("CLONER_IMAGE", &mut settings.cloner_image);
        text("POLLER_IMAGE", &mut settings.poller_image);
        text("PULL_POLICY", &mut settings.pull_policy);
        text("VERBOSITY", &mut settings.verbosity);

        if let Some(value) = lookup("CDI_WORKERS") {
            settings.workers = parse_value("CDI_WORKERS", &value)?;
            if settings.workers == 0 {
                return Err(ConfigError {
                    variable: "CDI_WORKERS",
                    value,
                });
            }
        }
        if let Some(value) = lookup("CDI_RECONCILE_TIMEOUT_SECS") {
            let secs: u64 = parse_value("CDI_RECONCILE_TIMEOUT_SECS", &value)?;
            settings.reconcile_timeout = Duration::from_secs(secs);
        }
        if let Some(value) = lookup("CDI_API_BIND") {
            settings.api_bind = parse_value("CDI_API_BIND", &value)?;
        }
        if let Some(value) = lookup("CDI_METRICS_BIND") {
            settings.metrics_bind = parse_value("CDI_METRICS_BIND", &value)?;
        }
        settings.kube_api = lookup("CDI_KUBE_API").filter(|value| !value.is_empty());
        settings.kube_token_file = lookup("CDI_KUBE_TOKEN_FILE")
            .filter(|value| !value.is_empty())
            .map(PathBuf::from);
        Ok(settings)
    }
}

fn parse_value<T: FromStr>(variable: &'static str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError {
        variable,
        value: value.to_string(),
    })
}
