use anyhow::Result;
use clap::{Args, Subcommand};

use crate::config::{Config, write_template};

#[derive(Args)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommands,
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Show current configuration
    Show {
        /// Output format: toml (default) or json
        #[arg(short, long, default_value = "toml")]
        format: String,
    },

    /// Show config file path
    Path,

    /// Initialize default config file
    Init {
        /// Overwrite existing config
        #[arg(short, long)]
        force: bool,
    },
}

pub fn run(args: ConfigArgs, config_override: Option<&str>) -> Result<()> {
    match args.command {
        ConfigCommands::Show { format } => show_config(config_override, &format),
        ConfigCommands::Path => show_path(config_override),
        ConfigCommands::Init { force } => init_config(config_override, force),
    }
}

fn show_config(config_override: Option<&str>, format: &str) -> Result<()> {
    let config = super::load_config(config_override)?;

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&config)?),
        _ => println!("{}", toml::to_string_pretty(&config)?),
    }

    Ok(())
}

fn config_file(config_override: Option<&str>) -> Result<std::path::PathBuf> {
    match config_override {
        Some(path) => Ok(shellexpand::tilde(path).to_string().into()),
        None => Config::config_path(),
    }
}

fn show_path(config_override: Option<&str>) -> Result<()> {
    println!("{}", config_file(config_override)?.display());
    Ok(())
}

fn init_config(config_override: Option<&str>, force: bool) -> Result<()> {
    let path = config_file(config_override)?;

    if path.exists() && !force {
        anyhow::bail!(
            "Config file already exists at {}. Use --force to overwrite.",
            path.display()
        );
    }

    write_template(&path)?;
    Ok(())
}
