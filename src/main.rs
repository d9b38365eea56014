use anyhow::Result;
use clap::Parser;

use autorun::cli::{self, Cli, Commands};

fn main() -> Result<()> {
    // argv[0] dispatch: if re-exec'd as "autorun-sandbox", enter the sandbox
    // helper immediately, before Tokio, Clap, or any other initialization.
    #[cfg(unix)]
    if let Some(arg0) = std::env::args_os().next()
        && arg0.to_string_lossy().ends_with(autorun::sandbox::SANDBOX_ARGV0)
    {
        autorun::sandbox::sandbox_child_main();
    }

    let cli = Cli::parse();

    // Daemon start must fork BEFORE starting Tokio runtime
    #[cfg(unix)]
    if let Some(Commands::Daemon(ref args)) = cli.command
        && let cli::daemon::DaemonCommands::Start { foreground: false } = args.command
    {
        return cli::daemon::daemonize_and_run(cli.config.as_deref());
    }

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async_main(cli))
}

async fn async_main(cli: Cli) -> Result<()> {
    let config = cli::load_config(cli.config.as_deref())?;

    // RUST_LOG wins, then --verbose, then the configured level
    let log_level = if cli.verbose {
        "debug"
    } else {
        config.logging.level.as_str()
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .init();

    let Some(command) = cli.command else {
        return match cli::run::beside_executable() {
            Some(root) => cli::run::run_root(&root, Vec::new(), config).await,
            None => {
                println!("No directive next to this executable. Try 'autorun --help'.");
                Ok(())
            }
        };
    };

    match command {
        Commands::Monitor => cli::monitor::run(config).await,
        Commands::Daemon(args) => cli::daemon::run(args, config).await,
        Commands::Run(args) => cli::run::run(args, config).await,
        Commands::Drives => cli::drives::run(&config),
        Commands::Trust(args) => cli::trust::run(args, &config),
        Commands::Directive(args) => cli::directive::run(args),
        Commands::Config(args) => cli::config::run(args, cli.config.as_deref()),
        Commands::Sandbox(args) => cli::sandbox::run(args, &config),
        Commands::Paths => cli::paths::run(&config),
    }
}
