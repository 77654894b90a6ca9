/*
 * Copyright 2026 The Tiller Authors
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use std::path::PathBuf;

use crate::cluster::ClusterManager;
use crate::proxy::Server;
use crate::Config;

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(clap::Parser)]
#[clap(version)]
pub struct Cli {
    #[clap(
        short,
        long,
        env = "TILLER_CONFIG",
        default_value = "tiller.yaml",
        help = "The YAML configuration file."
    )]
    config: PathBuf,
    #[clap(
        short,
        long,
        env,
        help = "Whether Tiller will report any results to stdout/stderr."
    )]
    quiet: bool,
    #[clap(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand)]
enum Commands {
    /// Runs the proxy with the provided configuration.
    Run,
}

impl Cli {
    /// Drives the main application lifecycle using the command line
    /// arguments.
    pub async fn drive(self) -> crate::Result<()> {
        if !self.quiet {
            let env_filter = tracing_subscriber::EnvFilter::builder()
                .with_default_directive(tracing_subscriber::filter::LevelFilter::INFO.into())
                .from_env_lossy();
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .init();
        }

        tracing::info!(version = VERSION, "starting tiller");

        match self.command {
            Commands::Run => self.run().await,
        }
    }

    async fn run(&self) -> crate::Result<()> {
        let config = self.read_config()?;

        let cluster_manager = ClusterManager::new(
            config.local_cluster.clone(),
            config.local_locality.clone(),
        );

        let mut engines = Vec::new();
        for cluster_config in &config.clusters {
            engines.push(cluster_manager.add_cluster(cluster_config.clone())?);
        }

        // Static assignments seed membership through the same engine the
        // discovery stream would use.
        for assignment in &config.static_assignments {
            let engine = engines
                .iter_mut()
                .find(|engine| engine.cluster().name() == assignment.cluster_name)
                .expect("validated against configured clusters");
            engine.on_assignment(std::slice::from_ref(assignment))?;
        }

        let listener = tokio::net::TcpListener::bind(config.proxy.address).await?;
        let server = Server::new(config.tcp_proxy.clone(), cluster_manager)?;

        let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(());
        tokio::spawn(async move {
            if let Err(error) = tokio::signal::ctrl_c().await {
                tracing::warn!(%error, "failed to listen for interrupt");
            }
            let _ = shutdown_tx.send(());
        });

        server.run(listener, shutdown_rx).await
    }

    /// Searches for the configuration file, trying the well-known system
    /// location when the configured path is missing.
    fn read_config(&self) -> crate::Result<Config> {
        std::fs::File::open(&self.config)
            .or_else(|error| {
                if cfg!(unix) {
                    std::fs::File::open("/etc/tiller/tiller.yaml")
                } else {
                    Err(error)
                }
            })
            .map_err(eyre::Error::from)
            .and_then(Config::from_reader)
    }
}
