//! CLI subcommand: `autorun monitor`
//!
//! Foreground monitor. The background daemon runs the same loop with a
//! non-interactive prompt.

use anyhow::Result;
use std::io::IsTerminal;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{info, warn};

use crate::concurrency::InstanceLock;
use crate::config::Config;
use crate::directive::has_directive;
use crate::monitor::{DriveMonitor, platform_source};
use crate::orchestrator::Orchestrator;

pub async fn run(config: Config) -> Result<()> {
    let lock = InstanceLock::new(&config.paths)?;
    let Some(_guard) = lock.try_acquire()? else {
        anyhow::bail!(
            "Another monitor is already running{}",
            lock.holder_pid()
                .map(|pid| format!(" (PID: {})", pid))
                .unwrap_or_default()
        );
    };

    let interactive = std::io::stdin().is_terminal();
    if !interactive && config.prompt.mode == crate::config::PromptMode::Terminal {
        warn!("No terminal attached; unknown devices will use the headless policy");
    }
    let prompt = if interactive {
        super::prompt_for(config.prompt.mode, true)
    } else {
        super::prompt_for(config.prompt.headless_default, false)
    };

    let orchestrator = Arc::new(super::build_orchestrator(&config, prompt, "monitor"));
    println!("Watching for drives (Ctrl+C to stop)...");

    run_monitor(&config, orchestrator).await
}

/// Run the monitor loop, one task per attach, until a shutdown signal.
pub async fn run_monitor(config: &Config, orchestrator: Arc<Orchestrator>) -> Result<()> {
    let monitor = Arc::new(DriveMonitor::new(platform_source(), &config.monitor));

    let refresh = tokio::spawn(refresh_listener(
        orchestrator.refresh_signal(),
        monitor.clone(),
    ));

    let flows = orchestrator.clone();
    let watch = monitor.run(config.poll_interval(), move |identity| {
        let flows = flows.clone();
        tokio::spawn(async move {
            flows.handle_attach(identity).await;
        });
    });

    tokio::select! {
        _ = watch => {}
        result = shutdown_signal() => {
            result?;
            info!("Shutdown requested");
        }
    }

    refresh.abort();
    Ok(())
}

/// Logs the device listing whenever a flow finishes. Bursts of
/// completions collapse into one listing.
async fn refresh_listener(signal: Arc<Notify>, monitor: Arc<DriveMonitor>) {
    loop {
        signal.notified().await;
        let tracked = monitor.tracked();
        info!("{} device(s) attached", tracked.len());
        for identity in tracked {
            info!(
                "  {}{}",
                identity,
                if has_directive(identity.root()) {
                    " [directive]"
                } else {
                    ""
                }
            );
        }
    }
}

#[cfg(unix)]
async fn shutdown_signal() -> Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut term = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result?,
        _ = term.recv() => {}
    }
    Ok(())
}

#[cfg(not(unix))]
async fn shutdown_signal() -> Result<()> {
    tokio::signal::ctrl_c().await?;
    Ok(())
}
