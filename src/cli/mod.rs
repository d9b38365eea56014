pub mod config;
pub mod daemon;
pub mod directive;
pub mod drives;
pub mod monitor;
pub mod paths;
pub mod run;
pub mod sandbox;
pub mod trust;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::Path;
use std::sync::Arc;

use crate::config::{Config, PromptMode};
use crate::orchestrator::Orchestrator;
use crate::sandbox::{IsolationBuilder, SystemLauncher};
use crate::trust::{ApprovalPrompt, AuditLog, PolicyPrompt, TerminalPrompt, TrustStore};

#[derive(Parser)]
#[command(name = "autorun")]
#[command(
    author,
    version,
    about = "Run programs from removable media, but only the ones you approved"
)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Without a subcommand, runs the directive next to the executable
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Path to config file
    #[arg(short, long, global = true, env = "AUTORUN_CONFIG")]
    pub config: Option<String>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Watch for attached drives and run approved directives
    Monitor,

    /// Manage the background monitor
    Daemon(daemon::DaemonArgs),

    /// Evaluate and run the directive on one directory
    Run(run::RunArgs),

    /// List attached volumes
    Drives,

    /// Trust store administration
    Trust(trust::TrustArgs),

    /// Directive file helpers
    Directive(directive::DirectiveArgs),

    /// Configuration management
    Config(config::ConfigArgs),

    /// Strong isolation support on this host
    Sandbox(sandbox::SandboxArgs),

    /// Show resolved directory paths
    Paths,
}

/// Load the config from `--config` or the default location.
pub fn load_config(path: Option<&str>) -> Result<Config> {
    let expanded = path.map(|p| shellexpand::tilde(p).to_string());
    Config::load_from(expanded.as_deref().map(Path::new))
}

/// Approval prompt for a mode. `Terminal` is only honored when `interactive`.
pub fn prompt_for(mode: PromptMode, interactive: bool) -> Arc<dyn ApprovalPrompt> {
    match mode {
        PromptMode::Terminal if interactive => Arc::new(TerminalPrompt::new()),
        PromptMode::Allow => Arc::new(PolicyPrompt::new(true)),
        PromptMode::Terminal | PromptMode::Deny => Arc::new(PolicyPrompt::new(false)),
    }
}

/// Wire the trust store, audit log, isolation builder and launcher from
/// config into one orchestrator.
pub fn build_orchestrator(
    config: &Config,
    prompt: Arc<dyn ApprovalPrompt>,
    source: &'static str,
) -> Orchestrator {
    let trust = TrustStore::open(config.trust_store_path())
        .with_rechallenge(config.trust.rechallenge_on_change);
    let audit = AuditLog::new(config.paths.audit_log(), config.trust.audit);

    Orchestrator::new(
        Arc::new(trust),
        prompt,
        Arc::new(SystemLauncher::new()),
        Arc::new(IsolationBuilder::new(&config.isolation)),
    )
    .with_audit(Arc::new(audit))
    .with_source(source)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_run_with_trailing_args() {
        let cli = Cli::parse_from(["autorun", "run", "/media/usb", "--", "-x", "file"]);
        match cli.command {
            Some(Commands::Run(args)) => {
                assert_eq!(args.root.to_str(), Some("/media/usb"));
                assert_eq!(args.args, vec!["-x", "file"]);
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn no_subcommand_is_accepted() {
        let cli = Cli::parse_from(["autorun", "-v"]);
        assert!(cli.command.is_none());
        assert!(cli.verbose);
    }
}
