use super::profile::ConfinementPlan;
use nix::libc;
use std::path::Path;

/// System locations the confined program may read and execute from.
const SYSTEM_READ_PATHS: &[&str] = &[
    "/usr", "/bin", "/sbin", "/lib", "/lib32", "/lib64", "/etc", "/opt", "/proc", "/sys",
];

/// Device nodes a typical program expects to read and write.
const DEVICE_FILES: &[&str] = &[
    "/dev/null",
    "/dev/zero",
    "/dev/urandom",
    "/dev/random",
    "/dev/tty",
];

/// Apply Linux filesystem confinement: NO_NEW_PRIVS then Landlock.
///
/// Everything outside the system directories and the device root is
/// denied. Unlike a best-effort setup, an unenforced ruleset is an error:
/// the caller falls back to plain launch instead of pretending.
pub fn apply_sandbox(plan: &ConfinementPlan) -> Result<(), String> {
    set_no_new_privs()?;
    apply_landlock(plan)
}

fn set_no_new_privs() -> Result<(), String> {
    // prctl(PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0)
    let ret = unsafe { libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0) };
    if ret != 0 {
        return Err(format!(
            "PR_SET_NO_NEW_PRIVS failed: {}",
            std::io::Error::last_os_error()
        ));
    }
    Ok(())
}

/// Uses BestEffort ABI negotiation (V5→V1) so rules degrade gracefully
/// on older kernels.
fn apply_landlock(plan: &ConfinementPlan) -> Result<(), String> {
    use landlock::{
        ABI, Access, AccessFs, PathBeneath, PathFd, Ruleset, RulesetAttr, RulesetCreatedAttr,
        RulesetStatus,
    };

    let abi = ABI::V5;

    let read_access = AccessFs::ReadFile | AccessFs::ReadDir | AccessFs::Execute;
    let device_file_access = AccessFs::ReadFile | AccessFs::WriteFile;
    let write_access = read_access
        | AccessFs::WriteFile
        | AccessFs::RemoveFile
        | AccessFs::RemoveDir
        | AccessFs::MakeReg
        | AccessFs::MakeDir
        | AccessFs::MakeSym;

    let mut ruleset = Ruleset::default()
        .handle_access(AccessFs::from_all(abi))
        .map_err(|e| format!("Landlock ruleset creation: {}", e))?
        .create()
        .map_err(|e| format!("Landlock ruleset create: {}", e))?;

    for path in SYSTEM_READ_PATHS.iter().map(Path::new) {
        if path.exists()
            && let Ok(fd) = PathFd::new(path)
        {
            let _ = (&mut ruleset).add_rule(PathBeneath::new(fd, read_access));
        }
    }

    for path in DEVICE_FILES.iter().map(Path::new) {
        if path.exists()
            && let Ok(fd) = PathFd::new(path)
        {
            let _ = (&mut ruleset).add_rule(PathBeneath::new(fd, device_file_access));
        }
    }

    // The device itself (isolated root included) is read+write
    let fd = PathFd::new(&plan.device_root)
        .map_err(|e| format!("Landlock device root {}: {}", plan.device_root.display(), e))?;
    (&mut ruleset)
        .add_rule(PathBeneath::new(fd, write_access))
        .map_err(|e| format!("Landlock device root rule: {}", e))?;

    let status = ruleset
        .restrict_self()
        .map_err(|e| format!("Landlock restrict_self: {}", e))?;

    match status.ruleset {
        RulesetStatus::FullyEnforced => {}
        RulesetStatus::PartiallyEnforced => {
            eprintln!("autorun-sandbox: Landlock partially enforced (ABI downgrade)");
        }
        RulesetStatus::NotEnforced => {
            return Err("Landlock not enforced by kernel".to_string());
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    // Enforcement itself would confine the test process; only the rule
    // inputs are checked here.

    #[test]
    fn rule_paths_are_absolute() {
        for path in SYSTEM_READ_PATHS.iter().chain(DEVICE_FILES) {
            assert!(Path::new(path).is_absolute(), "{}", path);
        }
    }
}
