//! Check command implementation.

use anyhow::{bail, Context, Result};
use clap::Args;
use std::path::Path;
use std::sync::Arc;
use toolprobe_sandbox::{Harness, LifecycleState, SandboxClient};
use tracing::{info, warn};

/// Arguments for the check command.
#[derive(Args)]
pub struct CheckArgs {
    /// Servers to check (default: every configured server)
    pub servers: Vec<String>,

    /// Run servers directly on the host instead of in containers
    #[arg(long)]
    pub host: bool,

    /// Keep ready servers running and monitored until interrupted
    #[arg(long)]
    pub hold: bool,
}

/// Outcome of initializing one server.
struct Outcome {
    client: Arc<SandboxClient>,
    error: Option<String>,
    tools: Option<usize>,
}

/// Executes the check command.
pub async fn execute(args: CheckArgs, config_path: Option<&Path>) -> Result<()> {
    let mut config = super::load_config(config_path)?;
    if args.host {
        config.use_containers = false;
    }

    let names = if args.servers.is_empty() {
        config.servers.keys().cloned().collect::<Vec<_>>()
    } else {
        args.servers.clone()
    };
    if names.is_empty() {
        bail!("no servers configured");
    }

    let harness = Harness::new(config).context("failed to set up sandbox harness")?;
    harness.initialize_once();
    let _exit_guard = harness.exit_guard();

    let clients = names
        .iter()
        .map(|name| harness.client(name))
        .collect::<toolprobe_sandbox::Result<Vec<_>>>()?;

    info!(count = clients.len(), mode = ?harness.mode(), "checking servers");
    let outcomes = futures::future::join_all(clients.into_iter().map(|client| async move {
        if let Err(e) = client.initialize().await {
            return Outcome {
                client,
                error: Some(e.to_string()),
                tools: None,
            };
        }
        let tools = match client.list_tools().await {
            Ok(tools) => Some(tools.len()),
            Err(e) => {
                warn!(server = client.name(), "listing tools failed: {}", e);
                None
            }
        };
        Outcome {
            client,
            error: None,
            tools,
        }
    }))
    .await;

    print_outcomes(&outcomes);
    let failed = outcomes.iter().filter(|o| o.error.is_some()).count();

    if args.hold {
        hold(&outcomes).await;
    }

    futures::future::join_all(outcomes.iter().map(|o| o.client.cleanup())).await;
    let report = harness.shutdown().await;
    if !report.is_clean() {
        warn!(remaining = ?report.remaining, "some sandboxes were not reaped");
    }

    if failed > 0 {
        bail!("{failed} of {} servers failed to start", outcomes.len());
    }
    Ok(())
}

fn print_outcomes(outcomes: &[Outcome]) {
    println!(
        "{:<20} {:<8} {:<6} {:<40} DETAIL",
        "SERVER", "STATUS", "TOOLS", "SANDBOX"
    );
    for outcome in outcomes {
        let client = &outcome.client;
        let (status, detail) = match &outcome.error {
            None => ("ready", String::new()),
            Some(error) => ("failed", error.clone()),
        };
        let tools = outcome
            .tools
            .map_or_else(|| "-".to_string(), |count| count.to_string());
        println!(
            "{:<20} {:<8} {:<6} {:<40} {}",
            client.name(),
            status,
            tools,
            client.sandbox_name().unwrap_or_else(|| "-".to_string()),
            detail
        );
    }
}

/// Waits until every ready server has gone idle.
///
/// A termination signal ends the process through the registry's signal
/// supervisor, which reaps all sandboxes first.
async fn hold(outcomes: &[Outcome]) {
    let ready: Vec<_> = outcomes
        .iter()
        .filter(|o| o.client.is_ready())
        .map(|o| &o.client)
        .collect();
    if ready.is_empty() {
        return;
    }

    info!(count = ready.len(), "holding servers, press Ctrl+C to stop");
    futures::future::join_all(ready.iter().map(|client| async move {
        let mut state = client.subscribe_state();
        if state.wait_for(|s| *s == LifecycleState::Idle).await.is_ok() {
            match client.last_probe_failure() {
                Some(failure) => warn!(server = client.name(), "server stopped: {}", failure),
                None => info!(server = client.name(), "server stopped"),
            }
        }
    }))
    .await;
}
