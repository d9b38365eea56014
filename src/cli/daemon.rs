use anyhow::Result;
use clap::{Args, Subcommand};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[cfg(unix)]
use daemonize::Daemonize;

use crate::concurrency::InstanceLock;
use crate::config::Config;

/// Fork and daemonize BEFORE starting the Tokio runtime.
#[cfg(unix)]
pub fn daemonize_and_run(config_path: Option<&str>) -> Result<()> {
    let config = super::load_config(config_path)?;

    let pid_file = config.paths.pid_file();
    if let Some(pid) = running_pid(&pid_file) {
        anyhow::bail!("Daemon already running (PID: {})", pid);
    }
    fs::remove_file(&pid_file).ok();

    let log_file = log_file(&config)?;

    println!("Starting autorun daemon in background...");
    println!("  PID file: {}", pid_file.display());
    println!("  Log file: {}", log_file.display());
    println!("  Unknown devices: {}", headless_label(&config));
    println!("\nUse 'autorun daemon status' to check status");
    println!("Use 'autorun daemon stop' to stop\n");

    // Append to keep earlier runs from the same day
    let stdout = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_file)?;
    let stderr = stdout.try_clone()?;

    let daemonize = Daemonize::new()
        .pid_file(&pid_file)
        .working_directory(std::env::current_dir()?)
        .stdout(stdout)
        .stderr(stderr);

    match daemonize.start() {
        Ok(_) => tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()?
            .block_on(run_daemon(config)),
        Err(e) => anyhow::bail!("Failed to daemonize: {}", e),
    }
}

/// Daemon body after the fork: file logging, then the monitor loop.
#[cfg(unix)]
async fn run_daemon(config: Config) -> Result<()> {
    // Writing to a file: no ANSI colors
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(&config.logging.level))
        .with_ansi(false)
        .init();

    let result = run_headless(&config).await;

    println!("\nShutting down...");
    fs::remove_file(config.paths.pid_file()).ok();
    result
}

async fn run_headless(config: &Config) -> Result<()> {
    let lock = InstanceLock::new(&config.paths)?;
    let Some(_guard) = lock.try_acquire()? else {
        anyhow::bail!("Another monitor is already running");
    };

    let prompt = super::prompt_for(config.prompt.headless_default, false);
    let orchestrator = Arc::new(super::build_orchestrator(config, prompt, "daemon"));

    println!("Daemon started successfully");
    super::monitor::run_monitor(config, orchestrator).await
}

#[derive(Args)]
pub struct DaemonArgs {
    #[command(subcommand)]
    pub command: DaemonCommands,
}

#[derive(Subcommand)]
pub enum DaemonCommands {
    /// Start the daemon
    Start {
        /// Run in foreground (don't daemonize)
        #[arg(short, long)]
        foreground: bool,
    },

    /// Stop the daemon
    Stop,

    /// Show daemon status
    Status,
}

pub async fn run(args: DaemonArgs, config: Config) -> Result<()> {
    match args.command {
        DaemonCommands::Start { foreground } => start_foreground(foreground, config).await,
        DaemonCommands::Stop => stop(&config),
        DaemonCommands::Status => show_status(&config),
    }
}

async fn start_foreground(foreground: bool, config: Config) -> Result<()> {
    let pid_file = config.paths.pid_file();
    if let Some(pid) = running_pid(&pid_file) {
        anyhow::bail!("Daemon already running (PID: {})", pid);
    }

    // Background mode on Unix is handled by daemonize_and_run() before Tokio starts
    #[cfg(unix)]
    if !foreground {
        anyhow::bail!("Background mode should be handled before Tokio starts");
    }

    #[cfg(not(unix))]
    if !foreground {
        println!(
            "Note: Background daemonization not supported on this platform. Running in foreground."
        );
    }

    println!("Starting autorun daemon in foreground...");
    fs::write(&pid_file, std::process::id().to_string())?;

    let result = run_headless(&config).await;

    println!("\nShutting down...");
    fs::remove_file(&pid_file).ok();
    result
}

fn stop(config: &Config) -> Result<()> {
    let pid_file = config.paths.pid_file();

    if !pid_file.exists() {
        println!("Daemon is not running");
        return Ok(());
    }

    let Some(pid) = running_pid(&pid_file) else {
        println!("Daemon is not running (stale PID file)");
        fs::remove_file(&pid_file)?;
        return Ok(());
    };

    terminate(pid)?;

    // Wait for process to stop (up to 5 seconds)
    for _ in 0..50 {
        if !is_process_running(pid) {
            break;
        }
        std::thread::sleep(std::time::Duration::from_millis(100));
    }

    if is_process_running(pid) {
        anyhow::bail!("Failed to stop daemon (PID: {})", pid);
    }

    println!("Daemon stopped");
    fs::remove_file(&pid_file).ok();
    Ok(())
}

fn show_status(config: &Config) -> Result<()> {
    let pid_file = config.paths.pid_file();
    let pid = running_pid(&pid_file);

    println!("Autorun Daemon Status");
    println!("---------------------");
    println!("Running: {}", if pid.is_some() { "yes" } else { "no" });
    if let Some(pid) = pid {
        println!("PID: {}", pid);
    }

    println!("\nConfiguration:");
    println!("  Poll interval:   {}s", config.poll_interval().as_secs());
    println!("  Unknown devices: {}", headless_label(config));
    println!("  Trust store:     {}", config.trust_store_path().display());
    println!("  Logs:            {}", config.paths.logs_dir().display());

    Ok(())
}

fn headless_label(config: &Config) -> &'static str {
    match config.prompt.headless_default {
        crate::config::PromptMode::Allow => "allowed once",
        _ => "denied once",
    }
}

/// Pid from `pid_file` if that process is alive.
fn running_pid(pid_file: &Path) -> Option<u32> {
    let pid: u32 = fs::read_to_string(pid_file).ok()?.trim().parse().ok()?;
    is_process_running(pid).then_some(pid)
}

fn log_file(config: &Config) -> Result<PathBuf> {
    let logs_dir = config.paths.logs_dir();
    fs::create_dir_all(&logs_dir)?;

    if config.logging.retention_days > 0 {
        prune_old_logs(&logs_dir, config.logging.retention_days as i64);
    }

    let date = chrono::Local::now().format("%Y-%m-%d");
    Ok(logs_dir.join(format!("autorun-{}.log", date)))
}

/// Prune `autorun-YYYY-MM-DD.log` files older than `keep_days` days
fn prune_old_logs(logs_dir: &Path, keep_days: i64) {
    let cutoff = chrono::Local::now() - chrono::Duration::days(keep_days);
    let cutoff_date = cutoff.format("%Y-%m-%d").to_string();

    if let Ok(entries) = fs::read_dir(logs_dir) {
        for entry in entries.flatten() {
            let name = entry.file_name();
            let name_str = name.to_string_lossy();

            if let Some(date_part) = name_str
                .strip_prefix("autorun-")
                .and_then(|s| s.strip_suffix(".log"))
                && date_part < cutoff_date.as_str()
            {
                let _ = fs::remove_file(entry.path());
            }
        }
    }
}

#[cfg(unix)]
fn terminate(pid: u32) -> Result<()> {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    kill(Pid::from_raw(pid as i32), Signal::SIGTERM)?;
    Ok(())
}

#[cfg(windows)]
fn terminate(pid: u32) -> Result<()> {
    std::process::Command::new("taskkill")
        .args(["/PID", &pid.to_string()])
        .status()?;
    Ok(())
}

#[cfg(unix)]
fn is_process_running(pid: u32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    // Signal 0 checks for existence; EPERM still means alive
    match kill(Pid::from_raw(pid as i32), None) {
        Ok(()) => true,
        Err(e) => e == nix::errno::Errno::EPERM,
    }
}

#[cfg(windows)]
fn is_process_running(pid: u32) -> bool {
    std::process::Command::new("tasklist")
        .args(["/FI", &format!("PID eq {}", pid)])
        .output()
        .map(|o| String::from_utf8_lossy(&o.stdout).contains(&pid.to_string()))
        .unwrap_or(false)
}
