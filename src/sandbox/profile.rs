//! Isolation profiles: the working directory, environment and optional
//! confinement a directive's program is launched with.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;
use tracing::debug;

use crate::config::{IsolationConfig, StrongIsolationMode};
use crate::directive::Directive;

/// Directory under the device root holding redirected user state.
pub const ISOLATED_DIR: &str = ".isolated";

/// Profile variables redirected under the isolated root, with their
/// location relative to it.
#[cfg(unix)]
const REDIRECTS: &[(&str, &str)] = &[
    ("HOME", "User"),
    ("XDG_CONFIG_HOME", "User/.config"),
    ("XDG_DATA_HOME", "User/.local/share"),
    ("XDG_STATE_HOME", "User/.local/state"),
    ("XDG_CACHE_HOME", "User/.cache"),
    ("TMPDIR", "Temp"),
    ("TMP", "Temp"),
    ("TEMP", "Temp"),
];

#[cfg(windows)]
const REDIRECTS: &[(&str, &str)] = &[
    ("HOME", "User"),
    ("USERPROFILE", "User"),
    ("APPDATA", "AppData\\Roaming"),
    ("LOCALAPPDATA", "AppData\\Local"),
    ("TMP", "Temp"),
    ("TEMP", "Temp"),
];

/// System directories searched for executables in an isolated launch.
#[cfg(unix)]
const SYSTEM_BIN_DIRS: &[&str] = &["/usr/bin", "/bin"];

#[cfg(windows)]
const SYSTEM_BIN_DIRS: &[&str] = &["C:\\Windows\\System32", "C:\\Windows"];

/// Fixed variables describing the OS installation.
#[cfg(unix)]
const SYSTEM_VARS: &[(&str, &str)] = &[("SHELL", "/bin/sh")];

#[cfg(windows)]
const SYSTEM_VARS: &[(&str, &str)] = &[
    ("SystemRoot", "C:\\Windows"),
    ("ProgramFiles", "C:\\Program Files"),
    ("ProgramFiles(x86)", "C:\\Program Files (x86)"),
    ("ProgramData", "C:\\ProgramData"),
];

#[cfg(unix)]
const PATH_SEPARATOR: &str = ":";

#[cfg(windows)]
const PATH_SEPARATOR: &str = ";";

#[derive(Debug, Error)]
pub enum IsolationError {
    #[error("failed to create isolated directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("strong isolation unavailable: {0}")]
    Unavailable(String),

    #[error("failed to start sandbox helper: {0}")]
    Spawn(#[source] io::Error),

    #[error("sandbox setup failed: {0}")]
    Setup(String),
}

/// Confinement handed to the sandbox helper (serialized as JSON).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfinementPlan {
    pub device_root: PathBuf,
    pub isolated_root: PathBuf,
    /// Address-space ceiling in bytes.
    pub max_memory_bytes: Option<u64>,
    pub max_processes: Option<u64>,
    /// Wall-clock ceiling for the process group; killed with `SIGKILL`.
    pub timeout_secs: Option<u64>,
}

/// Everything a launch needs besides the program itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IsolationProfile {
    pub working_dir: PathBuf,
    /// Complete environment; nothing else is inherited.
    pub environment: BTreeMap<String, String>,
    /// Present when strong isolation should be attempted.
    pub confinement: Option<ConfinementPlan>,
}

pub fn isolated_root(device_root: &Path) -> PathBuf {
    device_root.join(ISOLATED_DIR)
}

/// Builds isolation profiles from a directive and the host environment.
pub struct IsolationBuilder {
    config: IsolationConfig,
    host_env: BTreeMap<String, String>,
}

impl IsolationBuilder {
    /// Snapshot the current process environment. Non-UTF-8 entries are
    /// dropped.
    pub fn new(config: &IsolationConfig) -> Self {
        let host_env = std::env::vars_os()
            .filter_map(|(k, v)| Some((k.into_string().ok()?, v.into_string().ok()?)))
            .collect();
        Self::with_host_env(config, host_env)
    }

    pub fn with_host_env(config: &IsolationConfig, host_env: BTreeMap<String, String>) -> Self {
        Self {
            config: config.clone(),
            host_env,
        }
    }

    /// Compose the launch environment for `directive` on `device_root`.
    ///
    /// Without isolation: the host environment with the directive's
    /// overrides on top. With isolation: profile variables redirected under
    /// `<root>/.isolated`, fixed system variables, `PATH` limited to the
    /// system binaries plus the device root, configured passthrough
    /// variables, then the overrides. Overrides always win.
    pub fn build_environment(
        &self,
        device_root: &Path,
        directive: &Directive,
    ) -> BTreeMap<String, String> {
        let mut env = if directive.isolate {
            self.isolated_baseline(device_root)
        } else {
            self.host_env.clone()
        };

        for (key, value) in &directive.environment {
            env.insert(key.clone(), value.clone());
        }
        env
    }

    fn isolated_baseline(&self, device_root: &Path) -> BTreeMap<String, String> {
        let root = isolated_root(device_root);
        let mut env = BTreeMap::new();

        for (key, rel) in REDIRECTS {
            env.insert(key.to_string(), root.join(rel).to_string_lossy().into_owned());
        }
        for (key, value) in SYSTEM_VARS {
            env.insert(key.to_string(), value.to_string());
        }

        let mut search: Vec<String> = SYSTEM_BIN_DIRS.iter().map(|d| d.to_string()).collect();
        search.push(device_root.to_string_lossy().into_owned());
        env.insert("PATH".to_string(), search.join(PATH_SEPARATOR));

        for key in &self.config.passthrough_env {
            if let Some(value) = self.host_env.get(key) {
                env.insert(key.clone(), value.clone());
            }
        }
        env
    }

    /// Build the full profile, creating the isolated directories when the
    /// directive asks for isolation. Directory creation failure is fatal.
    pub fn build(
        &self,
        device_root: &Path,
        directive: &Directive,
    ) -> Result<IsolationProfile, IsolationError> {
        let environment = self.build_environment(device_root, directive);
        let working_dir = resolve_working_directory(device_root, directive);

        if directive.isolate {
            ensure_isolated_dirs(device_root, &environment)?;
        }

        Ok(IsolationProfile {
            working_dir,
            environment,
            confinement: self.confinement_for(device_root, directive),
        })
    }

    fn confinement_for(
        &self,
        device_root: &Path,
        directive: &Directive,
    ) -> Option<ConfinementPlan> {
        if !directive.isolate || self.config.strong == StrongIsolationMode::Off {
            return None;
        }
        let nonzero = |v: u64| (v > 0).then_some(v);
        Some(ConfinementPlan {
            device_root: device_root.to_path_buf(),
            isolated_root: isolated_root(device_root),
            max_memory_bytes: nonzero(self.config.max_memory_mb).map(|mb| mb * 1024 * 1024),
            max_processes: nonzero(self.config.max_processes as u64),
            timeout_secs: nonzero(self.config.timeout_secs),
        })
    }
}

/// Working directory for a launch: the directive's own (joined onto the
/// device root when relative), else the isolated root when isolating,
/// else the device root.
pub fn resolve_working_directory(device_root: &Path, directive: &Directive) -> PathBuf {
    let work_dir = directive.work_dir.trim();
    if !work_dir.is_empty() {
        let path = Path::new(work_dir);
        if path.is_absolute() {
            return path.to_path_buf();
        }
        return without_cur_dir(&device_root.join(path));
    }
    if directive.isolate {
        isolated_root(device_root)
    } else {
        device_root.to_path_buf()
    }
}

fn without_cur_dir(path: &Path) -> PathBuf {
    path.components()
        .filter(|c| !matches!(c, Component::CurDir))
        .collect()
}

/// Create every redirected directory that lives on the device. Paths
/// elsewhere (overridden onto the host) are assumed to exist and skipped.
pub fn ensure_isolated_dirs(
    device_root: &Path,
    environment: &BTreeMap<String, String>,
) -> Result<(), IsolationError> {
    for (key, _) in REDIRECTS {
        let Some(value) = environment.get(*key) else {
            continue;
        };
        let path = Path::new(value);
        if !path.starts_with(device_root) {
            debug!("Skipping {} outside the device: {}", key, path.display());
            continue;
        }
        fs::create_dir_all(path).map_err(|source| IsolationError::CreateDir {
            path: path.to_path_buf(),
            source,
        })?;
    }
    Ok(())
}

/// Map a working directory into the isolated root: paths on the device
/// keep their device-relative location under the isolated root, anything
/// else becomes the isolated root itself.
pub fn map_to_isolated(working_dir: &Path, plan: &ConfinementPlan) -> PathBuf {
    if working_dir.starts_with(&plan.isolated_root) {
        return working_dir.to_path_buf();
    }
    match working_dir.strip_prefix(&plan.device_root) {
        Ok(rel) => plan.isolated_root.join(rel),
        Err(_) => plan.isolated_root.clone(),
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn config() -> IsolationConfig {
        IsolationConfig {
            strong: StrongIsolationMode::Auto,
            max_memory_mb: 64,
            timeout_secs: 0,
            max_processes: 32,
            passthrough_env: vec!["LANG".to_string()],
        }
    }

    fn host() -> BTreeMap<String, String> {
        BTreeMap::from([
            ("HOME".to_string(), "/home/alice".to_string()),
            ("PATH".to_string(), "/usr/local/bin:/usr/bin".to_string()),
            ("LANG".to_string(), "en_US.UTF-8".to_string()),
            ("SECRET_TOKEN".to_string(), "hunter2".to_string()),
        ])
    }

    fn builder() -> IsolationBuilder {
        IsolationBuilder::with_host_env(&config(), host())
    }

    fn directive(isolate: bool) -> Directive {
        Directive {
            program: "run.sh".to_string(),
            isolate,
            ..Directive::default()
        }
    }

    #[test]
    fn unisolated_env_is_host_plus_overrides() {
        let mut d = directive(false);
        d.environment.insert("PATH".into(), "/custom".into());
        d.environment.insert("EXTRA".into(), "1".into());

        let env = builder().build_environment(Path::new("/media/usb"), &d);

        assert_eq!(env["HOME"], "/home/alice");
        assert_eq!(env["SECRET_TOKEN"], "hunter2");
        assert_eq!(env["PATH"], "/custom");
        assert_eq!(env["EXTRA"], "1");
    }

    #[test]
    fn isolated_env_redirects_profile_under_device() {
        let root = Path::new("/media/usb");
        let env = builder().build_environment(root, &directive(true));

        for (key, _) in REDIRECTS {
            assert!(
                Path::new(&env[*key]).starts_with("/media/usb/.isolated"),
                "{} = {}",
                key,
                env[*key]
            );
        }
        assert_eq!(env["HOME"], "/media/usb/.isolated/User");
        assert_eq!(env["TMPDIR"], "/media/usb/.isolated/Temp");
    }

    #[test]
    fn isolated_env_does_not_leak_host_variables() {
        let env = builder().build_environment(Path::new("/media/usb"), &directive(true));

        assert!(!env.contains_key("SECRET_TOKEN"));
        assert_eq!(env["LANG"], "en_US.UTF-8");
        assert_eq!(env["SHELL"], "/bin/sh");
    }

    #[test]
    fn isolated_path_is_system_dirs_plus_device_root() {
        let env = builder().build_environment(Path::new("/media/usb"), &directive(true));
        assert_eq!(env["PATH"], "/usr/bin:/bin:/media/usb");
    }

    #[test]
    fn overrides_win_over_isolated_baseline() {
        let mut d = directive(true);
        d.environment.insert("HOME".into(), "/media/usb/home".into());

        let env = builder().build_environment(Path::new("/media/usb"), &d);
        assert_eq!(env["HOME"], "/media/usb/home");
    }

    #[test]
    fn working_directory_resolution() {
        let root = Path::new("/media/usb");

        let mut d = directive(false);
        assert_eq!(resolve_working_directory(root, &d), root);

        d.isolate = true;
        assert_eq!(resolve_working_directory(root, &d), root.join(".isolated"));

        d.work_dir = "tools".into();
        assert_eq!(resolve_working_directory(root, &d), root.join("tools"));

        d.work_dir = "./".into();
        assert_eq!(resolve_working_directory(root, &d), root);

        d.work_dir = "/opt/app".into();
        assert_eq!(resolve_working_directory(root, &d), PathBuf::from("/opt/app"));
    }

    #[test]
    fn build_creates_isolated_dirs() {
        let tmp = tempfile::tempdir().unwrap();
        let profile = builder().build(tmp.path(), &directive(true)).unwrap();

        assert!(tmp.path().join(".isolated/User").is_dir());
        assert!(tmp.path().join(".isolated/Temp").is_dir());
        assert!(tmp.path().join(".isolated/User/.cache").is_dir());
        assert_eq!(profile.working_dir, tmp.path().join(".isolated"));
    }

    #[test]
    fn build_without_isolation_creates_nothing() {
        let tmp = tempfile::tempdir().unwrap();
        let profile = builder().build(tmp.path(), &directive(false)).unwrap();

        assert!(!tmp.path().join(".isolated").exists());
        assert!(profile.confinement.is_none());
    }

    #[test]
    fn redirects_outside_device_are_skipped() {
        let tmp = tempfile::tempdir().unwrap();
        let host_dir = tempfile::tempdir().unwrap();
        let mut d = directive(true);
        let elsewhere = host_dir.path().join("not-created");
        d.environment
            .insert("HOME".into(), elsewhere.to_string_lossy().into_owned());

        builder().build(tmp.path(), &d).unwrap();

        assert!(!elsewhere.exists());
        assert!(tmp.path().join(".isolated/Temp").is_dir());
    }

    #[test]
    fn directory_creation_failure_is_fatal() {
        let tmp = tempfile::tempdir().unwrap();
        // a file where the isolated root should be
        fs::write(tmp.path().join(ISOLATED_DIR), "").unwrap();

        let err = builder().build(tmp.path(), &directive(true)).unwrap_err();
        assert!(matches!(err, IsolationError::CreateDir { .. }));
    }

    #[test]
    fn confinement_follows_config() {
        let tmp = tempfile::tempdir().unwrap();
        let plan = builder()
            .build(tmp.path(), &directive(true))
            .unwrap()
            .confinement
            .unwrap();
        assert_eq!(plan.max_memory_bytes, Some(64 * 1024 * 1024));
        assert_eq!(plan.max_processes, Some(32));
        assert_eq!(plan.timeout_secs, None);

        let mut off = config();
        off.strong = StrongIsolationMode::Off;
        let profile = IsolationBuilder::with_host_env(&off, host())
            .build(tmp.path(), &directive(true))
            .unwrap();
        assert!(profile.confinement.is_none());
    }

    #[test]
    fn working_dir_maps_into_isolated_root() {
        let plan = ConfinementPlan {
            device_root: PathBuf::from("/media/usb"),
            isolated_root: PathBuf::from("/media/usb/.isolated"),
            max_memory_bytes: None,
            max_processes: None,
            timeout_secs: None,
        };

        assert_eq!(
            map_to_isolated(Path::new("/media/usb/tools"), &plan),
            PathBuf::from("/media/usb/.isolated/tools")
        );
        assert_eq!(
            map_to_isolated(Path::new("/media/usb/.isolated/User"), &plan),
            PathBuf::from("/media/usb/.isolated/User")
        );
        assert_eq!(
            map_to_isolated(Path::new("/opt/app"), &plan),
            PathBuf::from("/media/usb/.isolated")
        );
    }
}
