//! CLI subcommand: `autorun drives`

use anyhow::Result;

use crate::config::Config;
use crate::directive::has_directive;
use crate::monitor::{DriveMonitor, platform_source};
use crate::trust::TrustStore;

pub fn run(config: &Config) -> Result<()> {
    let source = platform_source();
    let monitor = DriveMonitor::new(source.clone(), &config.monitor);
    let eligible = monitor.eligible_volumes()?;
    let trust = TrustStore::open(config.trust_store_path());

    let mut volumes = source.enumerate()?;
    volumes.sort_by(|a, b| a.mount_path.cmp(&b.mount_path));

    if volumes.is_empty() {
        println!("No volumes found");
        return Ok(());
    }

    println!(
        "{:<10} {:<10} {:<10} {:<12} {:<9} {:<10} MOUNT",
        "SERIAL", "KIND", "FS", "LABEL", "WATCHED", "DECISION"
    );
    for volume in volumes {
        let watched = eligible.iter().any(|v| v.mount_path == volume.mount_path);
        let decision = trust
            .get(volume.serial)
            .map(|r| r.decision.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<10} {:<10} {:<10} {:<12} {:<9} {:<10} {}{}",
            volume.serial.to_string(),
            volume.kind.to_string(),
            volume.fs_type,
            volume.label.as_deref().unwrap_or("-"),
            if watched { "yes" } else { "no" },
            decision,
            volume.mount_path.display(),
            if has_directive(&volume.mount_path) {
                "  [directive]"
            } else {
                ""
            }
        );
    }

    Ok(())
}
