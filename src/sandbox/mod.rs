//! Isolation builder and process launch.
//!
//! Every launch gets an [`IsolationProfile`]: a working directory and a
//! complete environment, redirected under `<device>/.isolated` when the
//! directive asks for isolation. Isolated launches additionally try the
//! strong path, which re-executes this binary with argv[0]="autorun-sandbox"
//! so confinement is set up in a fresh single-threaded child before exec.
//!
//! Platform enforcement:
//! - Linux: rlimits + Landlock LSM (filesystem allowlist)
//! - Elsewhere: environment redirection only

#[cfg(unix)]
pub mod child;
pub mod detect;
pub mod launch;
#[cfg(target_os = "linux")]
pub mod linux;
pub mod profile;

#[cfg(unix)]
pub use child::sandbox_child_main;
pub use detect::{SandboxCapabilities, detect_capabilities};
pub use launch::{
    LaunchError, LaunchSpec, LaunchedProcess, ProcessHandle, ProcessLauncher, SANDBOX_ARGV0,
    SandboxedProcess, SystemLauncher, attempt_strong_isolation, exit_code_of, launch_plain,
};
pub use profile::{
    ConfinementPlan, IsolationBuilder, IsolationError, IsolationProfile, ensure_isolated_dirs,
    isolated_root, map_to_isolated, resolve_working_directory,
};
