//! Plan command implementation.

use anyhow::{Context, Result};
use clap::Args;
use std::path::Path;
use toolprobe_sandbox::{Harness, LaunchMode, LaunchSpec};

/// Arguments for the plan command.
#[derive(Args)]
pub struct PlanArgs {
    /// Server to plan
    pub server: String,

    /// Plan a launch directly on the host
    #[arg(long)]
    pub host: bool,

    /// Print the launch specification as JSON
    #[arg(long)]
    pub json: bool,
}

/// Executes the plan command.
pub async fn execute(args: PlanArgs, config_path: Option<&Path>) -> Result<()> {
    let mut config = super::load_config(config_path)?;
    if args.host {
        config.use_containers = false;
    }
    let client = config.server(&args.server)?.clone();

    let harness = Harness::new(config).context("failed to set up sandbox harness")?;
    let launcher = harness.launcher();

    let spec = match harness.mode() {
        LaunchMode::Container => {
            let entry = launcher
                .resolve(&client)
                .with_context(|| format!("cannot resolve entry point of {}", args.server))?;
            let name = launcher.sandbox_name(&args.server, chrono::Utc::now().timestamp());
            launcher.container_spec(&name, &entry, &client)
        }
        LaunchMode::Host => launcher.host_spec(&client)?,
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&spec)?);
    } else {
        print_spec(&spec);
    }
    Ok(())
}

fn print_spec(spec: &LaunchSpec) {
    if let Some(container) = &spec.container {
        println!("Sandbox:  {}", container.name);
        println!("Image:    {}", container.image);
        for mount in &container.mounts {
            println!("Mount:    {} -> {}", mount.source.display(), mount.target);
        }
        for (key, value) in &container.env {
            println!("Env:      {key}={value}");
        }
        println!();
        println!("Bootstrap:");
        for line in container.bootstrap.lines() {
            println!("  {line}");
        }
        println!();
    }
    println!("Command:  {}", spec.command_line());
}
