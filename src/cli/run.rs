//! CLI subcommand: `autorun run <ROOT> [-- ARGS...]`
//!
//! One-shot evaluation of the directive at a directory. Also the implicit
//! mode when the binary starts without a subcommand next to a directive.

use anyhow::{Context, Result};
use clap::Args;
use std::io::IsTerminal;
use std::path::{Path, PathBuf};

use crate::config::Config;
use crate::directive::has_directive;
use crate::monitor::{identify_root, platform_source};
use crate::orchestrator::FlowOutcome;

#[derive(Args)]
pub struct RunArgs {
    /// Directory holding the directive (usually a mount point)
    pub root: PathBuf,

    /// Arguments passed to the program
    #[arg(last = true)]
    pub args: Vec<String>,
}

pub async fn run(args: RunArgs, config: Config) -> Result<()> {
    let root = args
        .root
        .canonicalize()
        .with_context(|| format!("Cannot access {}", args.root.display()))?;
    run_root(&root, args.args, config).await
}

/// Directory of the running executable, if it carries a directive.
pub fn beside_executable() -> Option<PathBuf> {
    let exe = std::env::current_exe().ok()?;
    let dir = exe.parent()?.to_path_buf();
    has_directive(&dir).then_some(dir)
}

pub async fn run_root(root: &Path, args: Vec<String>, config: Config) -> Result<()> {
    let identity = identify_root(platform_source().as_ref(), root)?;

    let interactive = std::io::stdin().is_terminal();
    let mode = if interactive {
        config.prompt.mode
    } else {
        config.prompt.headless_default
    };
    let orchestrator =
        super::build_orchestrator(&config, super::prompt_for(mode, interactive), "run");

    match orchestrator.handle_attach_with_args(identity.clone(), args).await {
        FlowOutcome::NoDirective => {
            println!("No directive found at {}", root.display());
            Ok(())
        }
        FlowOutcome::Denied(decision) => {
            println!("Not running directive on {} ({})", identity, decision);
            Ok(())
        }
        FlowOutcome::Completed {
            exit_code: Some(code),
            ..
        } if code != 0 => anyhow::bail!("Program exited with code {}", code),
        FlowOutcome::Completed { .. } => Ok(()),
        FlowOutcome::Skipped => Ok(()),
        FlowOutcome::LaunchFailed(reason) => anyhow::bail!("Launch failed: {}", reason),
        FlowOutcome::Aborted(reason) => anyhow::bail!("{}", reason),
    }
}
