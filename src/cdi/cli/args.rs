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

use std::net::SocketAddr;

use clap::{Args, Parser, Subcommand, ValueEnum};

use crate::cdi::logger::LogFormat;

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum LogFormatArg {
    Text,
    Json,
}

impl From<LogFormatArg> for LogFormat {
    fn from(value: LogFormatArg) -> Self {
        match value {
            LogFormatArg::Text => LogFormat::Text,
            LogFormatArg::Json => LogFormat::Json,
        }
    }
}

/// Control plane for populating persistent volumes from external sources.
#[derive(Parser)]
#[command(name = env!("CARGO_PKG_NAME"))]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = env!("CARGO_PKG_DESCRIPTION"))]
pub struct Cli {
    /// Log line encoding
    #[arg(long, global = true, value_enum, env = "CDI_LOG_FORMAT", default_value = "text")]
    pub log_format: LogFormatArg,

    /// Minimum level written to the log (debug, info, warn, error)
    #[arg(long, global = true, env = "CDI_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the volume population controllers
    Controller(ControllerArgs),

    /// Run the upload token API and admission webhooks
    Apiserver(ApiServerArgs),
}

#[derive(Args)]
pub struct ClusterArgs {
    /// Base URL of the orchestrator API (defaults to the in-cluster service)
    #[arg(long, env = "KUBE_API")]
    pub kube_api: Option<String>,

    /// Bearer token file used against the orchestrator API
    #[arg(long, env = "KUBE_TOKEN_FILE")]
    pub kube_token_file: Option<std::path::PathBuf>,
}

#[derive(Args)]
pub struct ControllerArgs {
    #[command(flatten)]
    pub cluster: ClusterArgs,

    /// Run against an in-process cluster instead of a real API server
    #[arg(long)]
    pub in_memory: bool,

    /// Concurrent reconciles per controller
    #[arg(long)]
    pub workers: Option<usize>,

    /// Deadline for a single reconcile, e.g. 90s or 3m
    #[arg(long)]
    pub reconcile_timeout: Option<String>,

    /// Address for /metrics and /livez
    #[arg(long)]
    pub metrics_listen: Option<SocketAddr>,
}

#[derive(Args)]
pub struct ApiServerArgs {
    #[command(flatten)]
    pub cluster: ClusterArgs,

    /// Address to bind the HTTPS server (e.g. 0.0.0.0:8443)
    #[arg(long)]
    pub listen: Option<SocketAddr>,

    /// Address for /metrics, /healthz and /livez
    #[arg(long)]
    pub metrics_listen: Option<SocketAddr>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn controller_flags_parse() {
        let cli = Cli::try_parse_from(["cdi", "--log-format", "json", "controller", "--in-memory", "--workers", "5"])
            .expect("parse");
        assert_eq!(cli.log_format, LogFormatArg::Json);
        match cli.command {
            Commands::Controller(args) => {
                assert!(args.in_memory);
                assert_eq!(args.workers, Some(5));
                assert!(args.reconcile_timeout.is_none());
            }
            Commands::Apiserver(_) => panic!("expected controller"),
        }
    }

    #[test]
    fn apiserver_listen_must_be_an_address() {
        assert!(Cli::try_parse_from(["cdi", "apiserver", "--listen", "not-an-address"]).is_err());
        let cli = Cli::try_parse_from(["cdi", "apiserver", "--listen", "127.0.0.1:9443"]).expect("parse");
        match cli.command {
            Commands::Apiserver(args) => assert_eq!(args.listen, Some("127.0.0.1:9443".parse().unwrap())),
            Commands::Controller(_) => panic!("expected apiserver"),
        }
    }
}
