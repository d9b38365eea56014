use std::ffi::OsString;
use std::fs::File;
use std::io::Write;
use std::os::fd::{FromRawFd, RawFd};

use super::profile::ConfinementPlan;

/// Exit status of the helper when confinement could not be set up.
pub const SETUP_FAILED_EXIT: i32 = 127;

/// Entry point for the sandbox helper process.
///
/// Called when the binary detects argv[0] ends with "autorun-sandbox".
/// This function never returns: it either execs the target or exits.
///
/// argv layout:
///   argv[0] = "autorun-sandbox" (already consumed by dispatch)
///   argv[1] = ConfinementPlan JSON
///   argv[2] = status pipe write fd
///   argv[3] = program to execute
///   argv[4..] = program arguments
///
/// Environment, working directory and process group were set by the
/// parent and pass through exec unchanged. The time ceiling is not applied
/// here: the parent enforces it on the whole group. Any setup failure is written to the status fd
/// before exiting; a successful exec closes it (close-on-exec) with
/// nothing written.
pub fn sandbox_child_main() -> ! {
    let args: Vec<OsString> = std::env::args_os().collect();

    if args.len() < 4 {
        eprintln!("autorun-sandbox: expected plan JSON, status fd and program arguments");
        std::process::exit(SETUP_FAILED_EXIT);
    }

    let Some(status_fd) = args[2].to_str().and_then(|s| s.parse::<RawFd>().ok()) else {
        eprintln!("autorun-sandbox: invalid status fd {:?}", args[2]);
        std::process::exit(SETUP_FAILED_EXIT);
    };
    // SAFETY: the parent passed this descriptor open across exec for us alone
    let mut status = unsafe { File::from_raw_fd(status_fd) };

    let plan: ConfinementPlan = match args[1]
        .to_str()
        .ok_or_else(|| "plan is not UTF-8".to_string())
        .and_then(|s| serde_json::from_str(s).map_err(|e| e.to_string()))
    {
        Ok(p) => p,
        Err(e) => fail(&mut status, format!("failed to parse plan: {}", e)),
    };

    // Apply resource limits first (works on all platforms)
    if let Err(e) = apply_rlimits(&plan) {
        fail(&mut status, format!("failed to apply rlimits: {}", e));
    }

    if let Err(e) = apply_platform_sandbox(&plan) {
        fail(&mut status, format!("failed to apply sandbox: {}", e));
    }

    if let Err(e) = set_cloexec(status_fd) {
        fail(&mut status, format!("failed to mark status fd close-on-exec: {}", e));
    }

    exec_target(&args[3], &args[4..], &mut status);
}

/// Apply resource limits using setrlimit. Limits are only ever lowered.
fn apply_rlimits(plan: &ConfinementPlan) -> Result<(), String> {
    use nix::sys::resource::Resource;

    if let Some(bytes) = plan.max_memory_bytes {
        lower_limit(Resource::RLIMIT_AS, bytes).map_err(|e| format!("RLIMIT_AS: {}", e))?;
    }

    // RLIMIT_NPROC - max processes (Linux only; not available on macOS)
    #[cfg(target_os = "linux")]
    if let Some(nproc) = plan.max_processes {
        lower_limit(Resource::RLIMIT_NPROC, nproc).map_err(|e| format!("RLIMIT_NPROC: {}", e))?;
    }

    // RLIMIT_NOFILE - max open files
    lower_limit(Resource::RLIMIT_NOFILE, 1024).map_err(|e| format!("RLIMIT_NOFILE: {}", e))?;

    Ok(())
}

fn lower_limit(resource: nix::sys::resource::Resource, value: u64) -> nix::Result<()> {
    use nix::sys::resource::{getrlimit, setrlimit};

    let (soft, hard) = getrlimit(resource)?;
    let hard = hard.min(value);
    setrlimit(resource, soft.min(hard), hard)
}

/// Apply platform-specific sandbox enforcement.
fn apply_platform_sandbox(plan: &ConfinementPlan) -> Result<(), String> {
    #[cfg(target_os = "linux")]
    {
        super::linux::apply_sandbox(plan)
    }

    #[cfg(not(target_os = "linux"))]
    {
        let _ = plan;
        Err("no filesystem confinement on this platform".to_string())
    }
}

fn set_cloexec(fd: RawFd) -> std::io::Result<()> {
    let ret = unsafe { nix::libc::fcntl(fd, nix::libc::F_SETFD, nix::libc::FD_CLOEXEC) };
    if ret == -1 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

/// Exec the target, replacing the current process.
fn exec_target(program: &OsString, args: &[OsString], status: &mut File) -> ! {
    use std::os::unix::process::CommandExt;

    let err = std::process::Command::new(program).args(args).exec();

    // exec() only returns on error
    fail(
        status,
        format!("failed to exec {}: {}", program.to_string_lossy(), err),
    );
}

fn fail(status: &mut File, message: String) -> ! {
    let _ = status.write_all(message.as_bytes());
    eprintln!("autorun-sandbox: {}", message);
    std::process::exit(SETUP_FAILED_EXIT);
}
