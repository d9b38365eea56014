use anyhow::Result;
use clap::{Args, Subcommand};

use crate::config::{Config, StrongIsolationMode};
use crate::sandbox::detect_capabilities;

#[derive(Args)]
pub struct SandboxArgs {
    #[command(subcommand)]
    pub command: SandboxCommands,
}

#[derive(Subcommand)]
pub enum SandboxCommands {
    /// Show isolation capabilities and configuration
    Status,
}

pub fn run(args: SandboxArgs, config: &Config) -> Result<()> {
    match args.command {
        SandboxCommands::Status => run_status(config),
    }
}

fn run_status(config: &Config) -> Result<()> {
    let caps = detect_capabilities();

    println!("Sandbox Capabilities:");
    for line in caps.status_lines() {
        println!("{}", line);
    }
    println!();

    let iso = &config.isolation;
    let limit = |v: u64, unit: &str| {
        if v == 0 {
            "none".to_string()
        } else {
            format!("{} {}", v, unit).trim_end().to_string()
        }
    };

    println!("Configuration:");
    println!(
        "  Strong:      {}",
        match (iso.strong, caps.strong_available()) {
            (StrongIsolationMode::Off, _) => "off",
            (StrongIsolationMode::Auto, true) => "auto (will be used for isolated directives)",
            (StrongIsolationMode::Auto, false) => "auto (unavailable, falls back)",
        }
    );
    println!("  Memory:      {}", limit(iso.max_memory_mb, "MiB"));
    println!("  Timeout:     {}", limit(iso.timeout_secs, "s"));
    println!("  Max procs:   {}", limit(iso.max_processes as u64, ""));
    println!("  Passthrough: {}", iso.passthrough_env.join(", "));

    Ok(())
}
