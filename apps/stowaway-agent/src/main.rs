use std::time::Duration;

use anyhow::{bail, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use stowaway_agent::session::{self, SessionEnd};
use stowaway_agent::{setup, DEFAULT_BASTION_URL};

#[derive(Debug, Parser)]
#[command(
    name = "stowaway-agent",
    version,
    about = "Expose one directory to a stowaway bastion"
)]
struct Cli {
    /// Bastion WebSocket URL (e.g. wss://bastion.example.com/ws/agent).
    #[arg(long)]
    bastion_url: Option<String>,

    /// Agent token issued by the bastion console.
    #[arg(long)]
    token: Option<String>,

    /// Root directory to expose (e.g. /srv/data or ~/files).
    #[arg(long)]
    hosted_path: Option<String>,
}

const RECONNECT_DELAY: Duration = Duration::from_secs(5);
const MAX_AUTH_FAILURES: u32 = 3;

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let (url, token, hosted_path) = match (cli.token, cli.hosted_path) {
        (Some(token), Some(path)) => (
            cli.bastion_url
                .unwrap_or_else(|| DEFAULT_BASTION_URL.to_string()),
            token,
            path,
        ),
        (token, path) => setup::complete(cli.bastion_url, token, path)?,
    };

    let root = setup::resolve_dir(&hosted_path)?;
    if !root.is_dir() {
        bail!("hosted-path must be an existing directory: {}", root.display());
    }

    let mut auth_failures = 0u32;
    loop {
        match session::run_session(&url, &token, &root).await {
            SessionEnd::AuthFailed => {
                auth_failures += 1;
                if auth_failures >= MAX_AUTH_FAILURES {
                    bail!("authentication failed repeatedly; check the agent token in the console and restart");
                }
            }
            SessionEnd::Disconnected => auth_failures = 0,
        }
        info!(
            "disconnected; reconnecting in {}s",
            RECONNECT_DELAY.as_secs()
        );
        tokio::time::sleep(RECONNECT_DELAY).await;
    }
}
