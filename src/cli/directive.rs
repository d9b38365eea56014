use anyhow::Result;
use clap::{Args, Subcommand};
use std::path::{Path, PathBuf};

use crate::directive::{directive_path, load_directive, save_directive, template};
use crate::trust::fingerprint;

#[derive(Args)]
pub struct DirectiveArgs {
    #[command(subcommand)]
    pub command: DirectiveCommands,
}

#[derive(Subcommand)]
pub enum DirectiveCommands {
    /// Write a template directive at ROOT
    Init {
        root: PathBuf,

        /// Overwrite an existing directive
        #[arg(short, long)]
        force: bool,
    },

    /// Show the directive at ROOT with its fingerprint
    Show { root: PathBuf },
}

pub fn run(args: DirectiveArgs) -> Result<()> {
    match args.command {
        DirectiveCommands::Init { root, force } => init(&root, force),
        DirectiveCommands::Show { root } => show(&root),
    }
}

fn init(root: &Path, force: bool) -> Result<()> {
    let path = directive_path(root);
    if path.exists() && !force {
        anyhow::bail!(
            "Directive already exists at {}. Use --force to overwrite.",
            path.display()
        );
    }

    save_directive(root, &template())?;
    println!("Created directive at {}", path.display());
    println!("Note: editing it changes its fingerprint; approved devices keep their decision");
    Ok(())
}

fn show(root: &Path) -> Result<()> {
    let Some(directive) = load_directive(root)? else {
        println!("No directive at {}", root.display());
        return Ok(());
    };

    let fp = fingerprint(&directive);
    println!("Directive:   {}", directive_path(root).display());
    println!("Fingerprint: {} ({})", fp.display_hash, fp.sha256_hash);
    println!("Program:     {}", directive.program);
    println!(
        "Work dir:    {}",
        if directive.work_dir.is_empty() {
            "(device root)"
        } else {
            &directive.work_dir
        }
    );
    println!("Isolated:    {}", directive.isolate);
    for (key, value) in &directive.environment {
        println!("  {}={}", key, value);
    }

    let expanded = directive.expand(root);
    println!("\nAt launch:   {}", expanded.program_path(root).display());
    Ok(())
}
