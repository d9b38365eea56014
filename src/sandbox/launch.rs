//! Process launch: strong isolation first, plain creation as fallback.
//!
//! Both paths start the program with exactly the profile's environment
//! (`env_clear` + the composed map) and working directory. They differ
//! only in confinement: the strong path re-execs this binary as the
//! `autorun-sandbox` helper, which applies resource ceilings and a
//! Landlock filesystem allowlist before exec'ing the target. The helper
//! leads its own process group, and the time ceiling is enforced on that
//! group from [`SandboxedProcess::wait`].

use std::io;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

use super::profile::{IsolationError, IsolationProfile};

/// argv[0] that routes the binary into the sandbox helper.
pub const SANDBOX_ARGV0: &str = "autorun-sandbox";

/// Program plus arguments to start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl LaunchSpec {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }
}

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Exit code of a finished process. Signal deaths map to `128 + signal`.
pub fn exit_code_of(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    -1
}

/// A started child. Waiting caches the status so repeated calls are safe.
#[derive(Debug)]
struct ChildSlot {
    child: Option<Child>,
    pid: u32,
    status: Option<ExitStatus>,
}

impl ChildSlot {
    fn new(child: Child) -> Self {
        Self {
            pid: child.id(),
            child: Some(child),
            status: None,
        }
    }

    fn try_wait(&mut self) -> io::Result<Option<ExitStatus>> {
        if self.status.is_none() {
            let child = self
                .child
                .as_mut()
                .ok_or_else(|| io::Error::other("process already released"))?;
            self.status = child.try_wait()?;
        }
        Ok(self.status)
    }

    fn wait(&mut self) -> io::Result<ExitStatus> {
        if let Some(status) = self.status {
            return Ok(status);
        }
        let child = self
            .child
            .as_mut()
            .ok_or_else(|| io::Error::other("process already released"))?;
        let status = child.wait()?;
        self.status = Some(status);
        Ok(status)
    }

    fn terminate(&mut self) -> io::Result<()> {
        if self.status.is_some() {
            return Ok(());
        }
        match self.child.as_mut() {
            Some(child) => child.kill(),
            None => Ok(()),
        }
    }

    fn exit_code(&mut self) -> Option<i32> {
        self.try_wait().ok().flatten().map(exit_code_of)
    }

    /// Drop the OS handle. Does not kill a still-running process.
    fn release(&mut self) {
        self.child.take();
    }
}

/// How often a ceiling-bound wait re-checks the process group.
const GROUP_POLL: Duration = Duration::from_millis(50);

/// A process started under strong isolation. It leads its own process
/// group (pgid == pid), so everything it forks can be signalled together.
#[derive(Debug)]
pub struct SandboxedProcess {
    slot: ChildSlot,
    /// Time ceiling for the whole group, if the plan set one.
    deadline: Option<Instant>,
}

impl SandboxedProcess {
    pub fn pid(&self) -> u32 {
        self.slot.pid
    }

    /// Block until the process exits.
    ///
    /// With a time ceiling, this waits for the whole group: it returns once
    /// the leader has exited and no member is left, or kills the group with
    /// SIGKILL when the deadline passes. Either way nothing the program
    /// started outlives the ceiling. The leader's status is returned.
    pub fn wait(&mut self) -> io::Result<ExitStatus> {
        let Some(deadline) = self.deadline else {
            return self.slot.wait();
        };

        loop {
            if self.slot.try_wait()?.is_some() && !self.group_alive() {
                break;
            }
            if Instant::now() >= deadline {
                warn!(
                    "Process group {} exceeded its time ceiling, killing it",
                    self.slot.pid
                );
                self.kill_group();
                break;
            }
            std::thread::sleep(GROUP_POLL);
        }

        // the group is gone; never signal this pgid again
        self.deadline = None;
        self.slot.wait()
    }

    /// Kill the whole process group.
    pub fn terminate(&mut self) -> io::Result<()> {
        if self.slot.status.is_none() || self.deadline.is_some() {
            self.kill_group();
        }
        self.slot.terminate()
    }

    #[cfg(unix)]
    fn group_alive(&self) -> bool {
        use nix::errno::Errno;
        use nix::sys::signal::killpg;
        use nix::unistd::Pid;

        !matches!(
            killpg(Pid::from_raw(self.slot.pid as i32), None),
            Err(Errno::ESRCH)
        )
    }

    #[cfg(not(unix))]
    fn group_alive(&self) -> bool {
        false
    }

    #[cfg(unix)]
    fn kill_group(&mut self) {
        use nix::sys::signal::{Signal, killpg};
        use nix::unistd::Pid;

        if let Err(e) = killpg(Pid::from_raw(self.slot.pid as i32), Signal::SIGKILL) {
            debug!("killpg({}) failed: {}", self.slot.pid, e);
        }
    }

    #[cfg(not(unix))]
    fn kill_group(&mut self) {
        let _ = self.slot.terminate();
    }

    /// `None` while still running.
    pub fn exit_code(&mut self) -> Option<i32> {
        self.slot.exit_code()
    }

    /// Idempotent.
    pub fn release(&mut self) {
        self.slot.release();
    }
}

/// A process started without confinement.
#[derive(Debug)]
pub struct ProcessHandle {
    slot: ChildSlot,
}

impl ProcessHandle {
    pub fn pid(&self) -> u32 {
        self.slot.pid
    }

    pub fn wait(&mut self) -> io::Result<ExitStatus> {
        self.slot.wait()
    }

    pub fn terminate(&mut self) -> io::Result<()> {
        self.slot.terminate()
    }

    pub fn exit_code(&mut self) -> Option<i32> {
        self.slot.exit_code()
    }

    pub fn release(&mut self) {
        self.slot.release();
    }
}

/// Result of a launch: which path actually started the process.
#[derive(Debug)]
pub enum LaunchedProcess {
    Strong(SandboxedProcess),
    Plain(ProcessHandle),
}

impl LaunchedProcess {
    pub fn is_confined(&self) -> bool {
        matches!(self, LaunchedProcess::Strong(_))
    }

    pub fn pid(&self) -> u32 {
        match self {
            LaunchedProcess::Strong(p) => p.pid(),
            LaunchedProcess::Plain(p) => p.pid(),
        }
    }

    pub fn wait(&mut self) -> io::Result<ExitStatus> {
        match self {
            LaunchedProcess::Strong(p) => p.wait(),
            LaunchedProcess::Plain(p) => p.wait(),
        }
    }

    pub fn terminate(&mut self) -> io::Result<()> {
        match self {
            LaunchedProcess::Strong(p) => p.terminate(),
            LaunchedProcess::Plain(p) => p.terminate(),
        }
    }

    pub fn exit_code(&mut self) -> Option<i32> {
        match self {
            LaunchedProcess::Strong(p) => p.exit_code(),
            LaunchedProcess::Plain(p) => p.exit_code(),
        }
    }

    pub fn release(&mut self) {
        match self {
            LaunchedProcess::Strong(p) => p.release(),
            LaunchedProcess::Plain(p) => p.release(),
        }
    }
}

/// Start processes for approved directives.
#[cfg_attr(test, mockall::automock)]
pub trait ProcessLauncher: Send + Sync {
    fn launch(
        &self,
        spec: &LaunchSpec,
        profile: &IsolationProfile,
    ) -> Result<LaunchedProcess, LaunchError>;
}

/// Real launcher: strong isolation when the profile carries a
/// confinement plan, plain creation otherwise or on any strong failure.
pub struct SystemLauncher {
    helper: Option<PathBuf>,
}

impl SystemLauncher {
    /// The helper is this executable, resolved at launch time.
    pub fn new() -> Self {
        Self { helper: None }
    }

    pub fn with_helper(helper: impl Into<PathBuf>) -> Self {
        Self {
            helper: Some(helper.into()),
        }
    }

    fn helper_path(&self) -> io::Result<PathBuf> {
        match &self.helper {
            Some(path) => Ok(path.clone()),
            None => std::env::current_exe(),
        }
    }
}

impl Default for SystemLauncher {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessLauncher for SystemLauncher {
    fn launch(
        &self,
        spec: &LaunchSpec,
        profile: &IsolationProfile,
    ) -> Result<LaunchedProcess, LaunchError> {
        if profile.confinement.is_some() {
            let attempt = self
                .helper_path()
                .map_err(IsolationError::Spawn)
                .and_then(|helper| attempt_strong_isolation(&helper, spec, profile));
            match attempt {
                Ok(process) => {
                    info!(
                        "Started {} under strong isolation (pid {})",
                        spec.program.display(),
                        process.pid()
                    );
                    return Ok(LaunchedProcess::Strong(process));
                }
                Err(e) => {
                    info!(
                        "Strong isolation unavailable for {}, using environment isolation: {}",
                        spec.program.display(),
                        e
                    );
                }
            }
        }

        let process = launch_plain(spec, profile)?;
        info!(
            "Started {} (pid {})",
            spec.program.display(),
            process.pid()
        );
        Ok(LaunchedProcess::Plain(process))
    }
}

/// Plain process creation with the profile's environment and directory.
pub fn launch_plain(
    spec: &LaunchSpec,
    profile: &IsolationProfile,
) -> Result<ProcessHandle, LaunchError> {
    let child = Command::new(&spec.program)
        .args(&spec.args)
        .env_clear()
        .envs(&profile.environment)
        .current_dir(&profile.working_dir)
        .spawn()
        .map_err(|source| LaunchError::Spawn {
            program: spec.program.clone(),
            source,
        })?;

    Ok(ProcessHandle {
        slot: ChildSlot::new(child),
    })
}

/// Start `spec` through the sandbox helper at `helper`.
///
/// Fails (for the caller to fall back) when the host lacks Landlock, the
/// mapped working directory cannot be created, the helper cannot be
/// spawned, or the helper reports a setup failure before exec.
#[cfg(target_os = "linux")]
pub fn attempt_strong_isolation(
    helper: &Path,
    spec: &LaunchSpec,
    profile: &IsolationProfile,
) -> Result<SandboxedProcess, IsolationError> {
    use std::io::Read;
    use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
    use std::os::unix::process::CommandExt;

    let Some(plan) = profile.confinement.as_ref() else {
        return Err(IsolationError::Unavailable(
            "profile carries no confinement".to_string(),
        ));
    };

    let caps = super::detect::detect_capabilities();
    if !caps.strong_available() {
        return Err(IsolationError::Unavailable(
            "Landlock is not supported by this kernel".to_string(),
        ));
    }

    let working_dir = super::profile::map_to_isolated(&profile.working_dir, plan);
    std::fs::create_dir_all(&working_dir).map_err(|source| IsolationError::CreateDir {
        path: working_dir.clone(),
        source,
    })?;

    let plan_json = serde_json::to_string(plan)
        .map_err(|e| IsolationError::Setup(format!("failed to serialize plan: {}", e)))?;

    // Status pipe, close-on-exec everywhere except in our helper
    let mut fds = [0; 2];
    if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) } != 0 {
        return Err(IsolationError::Spawn(io::Error::last_os_error()));
    }
    let (read_end, write_end) =
        unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };
    let status_fd = write_end.as_raw_fd();

    let mut command = Command::new(helper);
    command
        .arg0(SANDBOX_ARGV0)
        .arg(&plan_json)
        .arg(status_fd.to_string())
        .arg(&spec.program)
        .args(&spec.args)
        .env_clear()
        .envs(&profile.environment)
        .current_dir(&working_dir)
        .process_group(0);
    unsafe {
        command.pre_exec(move || {
            if libc::fcntl(status_fd, libc::F_SETFD, 0) == -1 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        });
    }

    let child = command.spawn().map_err(IsolationError::Spawn)?;
    drop(write_end);

    let mut slot = ChildSlot::new(child);
    let mut report = String::new();
    let read = std::fs::File::from(read_end).read_to_string(&mut report);

    if let Err(e) = read {
        let _ = slot.terminate();
        let _ = slot.wait();
        return Err(IsolationError::Setup(format!("status pipe: {}", e)));
    }
    if !report.is_empty() {
        let _ = slot.wait();
        return Err(IsolationError::Setup(report));
    }

    debug!(
        "Sandbox helper exec'd {} in {}",
        spec.program.display(),
        working_dir.display()
    );
    let deadline = plan
        .timeout_secs
        .and_then(|secs| Instant::now().checked_add(Duration::from_secs(secs)));
    Ok(SandboxedProcess { slot, deadline })
}

#[cfg(not(target_os = "linux"))]
pub fn attempt_strong_isolation(
    _helper: &Path,
    _spec: &LaunchSpec,
    _profile: &IsolationProfile,
) -> Result<SandboxedProcess, IsolationError> {
    Err(IsolationError::Unavailable(
        "no native confinement on this platform".to_string(),
    ))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::sandbox::profile::ConfinementPlan;
    use std::collections::BTreeMap;

    fn profile(dir: &Path, env: &[(&str, &str)]) -> IsolationProfile {
        IsolationProfile {
            working_dir: dir.to_path_buf(),
            environment: env
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<BTreeMap<_, _>>(),
            confinement: None,
        }
    }

    fn sh(script: &str) -> LaunchSpec {
        LaunchSpec::new("/bin/sh").with_args(vec!["-c".to_string(), script.to_string()])
    }

    #[test]
    fn plain_launch_reports_exit_code() {
        let tmp = tempfile::tempdir().unwrap();
        let mut process = launch_plain(&sh("exit 3"), &profile(tmp.path(), &[])).unwrap();

        assert_eq!(exit_code_of(process.wait().unwrap()), 3);
        assert_eq!(process.exit_code(), Some(3));
    }

    #[test]
    fn plain_launch_uses_only_the_profile_environment() {
        let tmp = tempfile::tempdir().unwrap();
        let script = r#"test "$FOO" = bar && test -z "$AUTORUN_HOST_ONLY" && test "$(pwd -P)" = "$EXPECTED""#;
        let dir = std::fs::canonicalize(tmp.path()).unwrap();
        let expected = dir.to_string_lossy().into_owned();

        let mut process = launch_plain(
            &sh(script),
            &profile(&dir, &[("FOO", "bar"), ("EXPECTED", &expected)]),
        )
        .unwrap();

        assert_eq!(exit_code_of(process.wait().unwrap()), 0);
    }

    #[test]
    fn missing_program_is_a_launch_error() {
        let tmp = tempfile::tempdir().unwrap();
        let err = launch_plain(
            &LaunchSpec::new(tmp.path().join("nope")),
            &profile(tmp.path(), &[]),
        )
        .unwrap_err();
        assert!(matches!(err, LaunchError::Spawn { .. }));
    }

    #[test]
    fn wait_and_release_are_repeatable() {
        let tmp = tempfile::tempdir().unwrap();
        let mut process =
            LaunchedProcess::Plain(launch_plain(&sh("exit 0"), &profile(tmp.path(), &[])).unwrap());

        let first = process.wait().unwrap();
        assert_eq!(process.wait().unwrap(), first);
        process.release();
        process.release();
        assert_eq!(process.exit_code(), Some(0));
        assert!(process.terminate().is_ok());
    }

    #[test]
    fn terminate_kills_a_running_process() {
        let tmp = tempfile::tempdir().unwrap();
        let mut process = launch_plain(&sh("sleep 30"), &profile(tmp.path(), &[])).unwrap();

        assert_eq!(process.exit_code(), None);
        process.terminate().unwrap();
        let status = process.wait().unwrap();
        assert_eq!(exit_code_of(status), 128 + 9);
    }

    /// A shell leading its own process group, as the sandbox helper does.
    fn group_leader(script: &str, dir: &Path, deadline: Option<Instant>) -> SandboxedProcess {
        use std::os::unix::process::CommandExt;

        let child = Command::new("/bin/sh")
            .arg("-c")
            .arg(script)
            .current_dir(dir)
            .process_group(0)
            .spawn()
            .unwrap();
        SandboxedProcess {
            slot: ChildSlot::new(child),
            deadline,
        }
    }

    #[test]
    fn time_ceiling_kills_everything_the_program_forked() {
        let tmp = tempfile::tempdir().unwrap();
        let marker = tmp.path().join("survived");
        let script = format!("(sleep 2; touch '{}') & sleep 30", marker.display());
        let deadline = Instant::now() + Duration::from_secs(1);
        let mut process = group_leader(&script, tmp.path(), Some(deadline));

        let started = Instant::now();
        let status = process.wait().unwrap();

        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(exit_code_of(status), 128 + 9);
        // the background subshell would have written the marker at 2s
        std::thread::sleep(Duration::from_millis(2500));
        assert!(!marker.exists());
    }

    #[test]
    fn terminate_kills_the_whole_group() {
        let tmp = tempfile::tempdir().unwrap();
        let marker = tmp.path().join("survived");
        let script = format!("(sleep 1; touch '{}') & sleep 30", marker.display());
        let mut process = group_leader(&script, tmp.path(), None);

        assert_eq!(process.exit_code(), None);
        process.terminate().unwrap();
        assert_eq!(exit_code_of(process.wait().unwrap()), 128 + 9);

        std::thread::sleep(Duration::from_millis(1500));
        assert!(!marker.exists());
    }

    #[test]
    fn strong_failure_falls_back_to_plain() {
        let tmp = tempfile::tempdir().unwrap();
        let mut p = profile(tmp.path(), &[]);
        p.confinement = Some(ConfinementPlan {
            device_root: tmp.path().to_path_buf(),
            isolated_root: tmp.path().join(".isolated"),
            max_memory_bytes: None,
            max_processes: None,
            timeout_secs: None,
        });

        let launcher = SystemLauncher::with_helper(tmp.path().join("no-such-helper"));
        let mut process = launcher.launch(&sh("exit 5"), &p).unwrap();

        assert!(!process.is_confined());
        assert_eq!(exit_code_of(process.wait().unwrap()), 5);
    }
}
