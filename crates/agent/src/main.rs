// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::error;

use switchboard_agent::client::{AgentSession, EchoRunner};
use switchboard_agent::config::AgentConfig;
use switchboard_agent::credential::{self, CredentialBackend};
use switchboard_agent::identity;

#[derive(Parser)]
#[command(name = "switchboard-agent", about = "Switchboard agent runtime")]
struct Cli {
    #[command(flatten)]
    config: AgentConfig,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    if let Err(e) = start(cli.config).await {
        error!("fatal: {e:#}");
        std::process::exit(1);
    }
}

async fn start(config: AgentConfig) -> anyhow::Result<()> {
    // Stable identity under the state directory.
    let identity_path = credential::state_dir().join("identity.json");
    let mut identity_file = identity::load(&identity_path)?;
    let agent_identity = identity_file.identity_for(&config.agent_type, &config.name);
    identity::save(&identity_path, &identity_file)?;

    let credentials: Arc<dyn CredentialBackend> = Arc::new(credential::default_backends(
        &config.keychain_service,
        &agent_identity.id,
    ));

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                shutdown.cancel();
            }
        }
    });

    let session = AgentSession {
        config: config.clone(),
        identity: agent_identity,
        runner: Arc::new(EchoRunner),
        credentials: Arc::clone(&credentials),
        shutdown: shutdown.clone(),
    };
    switchboard_agent::run(config, session, credentials, shutdown).await
}
