// Copyright 2015-2020 Capital One Services, LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use cap_invoke::config::WorkerConfig;
use cap_invoke::WorkerHost;
use clap::Parser;
use std::path::PathBuf;

#[derive(Debug, Parser, Clone)]
#[command(name = "cap-invoke-worker", about = "A general-purpose capability worker host")]
struct Cli {
    /// Path to the worker pool manifest (YAML or JSON)
    #[arg(short = 'm', long = "manifest")]
    manifest_path: PathBuf,
    /// NATS URL for the default bus
    #[arg(short = 'n', long = "nats-url", default_value = "nats://127.0.0.1:4222")]
    nats_url: String,
    /// Whether to expand environment variables in the manifest
    #[arg(short = 'e', long = "expand-env")]
    expand_env: bool,
}

#[tokio::main]
async fn main() -> std::result::Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let cli = Cli::parse();
    cap_invoke::telemetry::init();

    let pools = cap_invoke::config::load_pools(&cli.manifest_path, cli.expand_env)?;
    tracing::info!(
        pool_count = pools.len(),
        cwd = ?std::env::current_dir()?,
        "capability worker manifest loaded"
    );

    let config = WorkerConfig {
        default_nats_url: cli.nats_url,
        pools,
        ..Default::default()
    };
    let host = WorkerHost::connect(config, None).await?;

    tokio::signal::ctrl_c().await?;
    host.close().await?;

    Ok(())
}
