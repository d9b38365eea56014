//! CLI subcommand: `autorun paths`
//!
//! Prints all resolved XDG-compliant paths for debugging and scripting.

use anyhow::Result;

use crate::config::Config;

pub fn run(config: &Config) -> Result<()> {
    let paths = &config.paths;

    println!("Autorun Paths (XDG Base Directory)");
    println!("==================================");
    println!();
    println!("Config:     {}", paths.config_dir.display());
    println!("  config.toml:    {}", paths.config_file().display());
    println!();
    println!("State:      {}", paths.state_dir.display());
    println!("  trust store:    {}", config.trust_store_path().display());
    println!("  audit log:      {}", paths.audit_log().display());
    println!("  logs:           {}", paths.logs_dir().display());
    println!();
    match paths.runtime_dir {
        Some(ref dir) => println!("Runtime:    {}", dir.display()),
        None => println!("Runtime:    (not available)"),
    }
    println!("  PID file:       {}", paths.pid_file().display());
    println!("  monitor lock:   {}", paths.instance_lock().display());

    Ok(())
}
