use anyhow::{Context, Result};
use clap::{Args, Subcommand};

use crate::config::Config;
use crate::device::VolumeSerial;
use crate::trust::audit::{read_audit_log, verify_audit_chain};
use crate::trust::{AuditAction, AuditEvent, AuditLog, TrustRecord, TrustStore};

#[derive(Args)]
pub struct TrustArgs {
    #[command(subcommand)]
    pub command: TrustCommands,
}

#[derive(Subcommand)]
pub enum TrustCommands {
    /// List remembered devices
    List,

    /// Show one device's record
    Show {
        /// Volume serial (hex, e.g. 1A2B3C4D)
        serial: String,
    },

    /// Forget one device so it is asked about again
    Forget {
        /// Volume serial (hex, e.g. 1A2B3C4D)
        serial: String,
    },

    /// Forget every device
    Clear {
        /// Skip confirmation
        #[arg(short, long)]
        yes: bool,
    },

    /// Show the decision audit log and verify its hash chain
    Audit {
        /// Only show the last N entries
        #[arg(short = 'n', long)]
        last: Option<usize>,
    },
}

pub fn run(args: TrustArgs, config: &Config) -> Result<()> {
    let store = TrustStore::open(config.trust_store_path());
    let audit = AuditLog::new(config.paths.audit_log(), config.trust.audit);

    match args.command {
        TrustCommands::List => list(&store),
        TrustCommands::Show { serial } => show(&store, &serial),
        TrustCommands::Forget { serial } => forget(&store, &audit, &serial),
        TrustCommands::Clear { yes } => clear(&store, &audit, yes),
        TrustCommands::Audit { last } => show_audit(config, last),
    }
}

fn parse_serial(serial: &str) -> Result<VolumeSerial> {
    VolumeSerial::parse(serial).with_context(|| {
        format!("Invalid volume serial '{}' (expected up to 8 hex digits)", serial)
    })
}

fn list(store: &TrustStore) -> Result<()> {
    let records = store.snapshot();
    if records.is_empty() {
        println!("No remembered devices");
        return Ok(());
    }

    println!(
        "{:<10} {:<11} {:<17} {:>5}  {:<20} PROGRAM",
        "SERIAL", "DECISION", "FINGERPRINT", "SEEN", "LAST SEEN"
    );
    for (key, record) in &records {
        println!(
            "{:<10} {:<11} {:<17} {:>5}  {:<20} {}",
            key,
            record.decision.to_string(),
            record.fingerprint.display_hash,
            record.seen_count,
            record.last_seen.format("%Y-%m-%d %H:%M:%S").to_string(),
            record.directive.program
        );
    }
    println!("\n{} device(s) in {}", records.len(), store.path().display());
    Ok(())
}

fn show(store: &TrustStore, serial: &str) -> Result<()> {
    let serial = parse_serial(serial)?;
    let Some(record) = store.get(serial) else {
        anyhow::bail!("No record for {}", serial);
    };
    print!("{}", describe_record(serial, &record));
    Ok(())
}

fn describe_record(serial: VolumeSerial, record: &TrustRecord) -> String {
    let mut out = String::new();
    out.push_str(&format!("Device:      {}\n", serial));
    out.push_str(&format!("Decision:    {}\n", record.decision));
    out.push_str(&format!("Fingerprint: {}\n", record.fingerprint.sha256_hash));
    out.push_str(&format!("First seen:  {}\n", record.first_seen.to_rfc3339()));
    out.push_str(&format!("Last seen:   {}\n", record.last_seen.to_rfc3339()));
    out.push_str(&format!("Seen:        {} time(s)\n", record.seen_count));
    out.push_str(&format!("Program:     {}\n", record.directive.program));
    if !record.directive.work_dir.is_empty() {
        out.push_str(&format!("Work dir:    {}\n", record.directive.work_dir));
    }
    out.push_str(&format!("Isolated:    {}\n", record.directive.isolate));
    if !record.environment.is_empty() {
        out.push_str("Environment:\n");
        for (key, value) in &record.environment {
            out.push_str(&format!("  {}={}\n", key, value));
        }
    }
    out
}

fn forget(store: &TrustStore, audit: &AuditLog, serial: &str) -> Result<()> {
    let serial = parse_serial(serial)?;
    let fingerprint = store
        .get(serial)
        .map(|r| r.fingerprint.display_hash)
        .unwrap_or_default();

    if !store.forget(serial) {
        println!("No record for {}", serial);
        return Ok(());
    }

    audit.record(AuditEvent {
        action: AuditAction::Forgotten,
        device: &serial.key(),
        fingerprint: &fingerprint,
        source: "cli",
        detail: None,
    });
    println!("Forgot {}; it will be asked about on next attach", serial);
    Ok(())
}

fn clear(store: &TrustStore, audit: &AuditLog, yes: bool) -> Result<()> {
    if !yes {
        let count = store.snapshot().len();
        if count == 0 {
            println!("No remembered devices");
            return Ok(());
        }
        print!("Forget all {} device(s)? [y/N] ", count);
        std::io::Write::flush(&mut std::io::stdout())?;
        let mut answer = String::new();
        std::io::stdin().read_line(&mut answer)?;
        if !matches!(answer.trim(), "y" | "Y" | "yes") {
            println!("Cancelled");
            return Ok(());
        }
    }

    let removed = store.forget_all();
    audit.record(AuditEvent {
        action: AuditAction::Cleared,
        device: "",
        fingerprint: "",
        source: "cli",
        detail: Some(format!("{} record(s)", removed)),
    });
    println!("Removed {} record(s)", removed);
    Ok(())
}

fn show_audit(config: &Config, last: Option<usize>) -> Result<()> {
    let path = config.paths.audit_log();
    let entries = read_audit_log(&path)?;

    if entries.is_empty() {
        println!("Audit log is empty ({})", path.display());
        return Ok(());
    }

    let skip = last.map_or(0, |n| entries.len().saturating_sub(n));
    for entry in &entries[skip..] {
        let action = serde_json::to_value(entry.action)?
            .as_str()
            .unwrap_or_default()
            .to_string();
        println!(
            "{}  {:<18} {:<9} {:<17} {:<8} {}",
            entry.ts,
            action,
            if entry.device.is_empty() { "-" } else { &entry.device },
            if entry.fingerprint.is_empty() { "-" } else { &entry.fingerprint },
            entry.source,
            entry.detail.as_deref().unwrap_or("")
        );
    }

    let broken = verify_audit_chain(&path)?;
    if broken.is_empty() {
        println!("\nChain intact ({} entries)", entries.len());
    } else {
        let lines: Vec<String> = broken.iter().map(|i| (i + 1).to_string()).collect();
        println!("\nChain BROKEN at line(s): {}", lines.join(", "));
    }
    Ok(())
}
