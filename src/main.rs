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

use std::process;

use cdi::cdi::cli::{self, Cli};
use cdi::cdi::logger::log_error;
use clap::Parser;

#[tokio::main]
async fn main() {
    let args = Cli::parse();
    if let Err(err) = cli::run(&args).await {
        let error = err.to_string();
        log_error("cdi", "Command failed", &[("error", error.as_str())]);
        process::exit(1);
    }
}
