//! Version command implementation.

use anyhow::Result;
use toolprobe_sandbox::channel::PROTOCOL_VERSION;

/// Executes the version command.
pub async fn execute() -> Result<()> {
    println!("toolprobe version {}", env!("CARGO_PKG_VERSION"));
    println!();
    println!("Platform: {} / {}", std::env::consts::OS, std::env::consts::ARCH);
    println!("Protocol: {PROTOCOL_VERSION}");

    Ok(())
}
