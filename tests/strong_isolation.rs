//! Strong isolation end to end: the real binary as sandbox helper.
//!
//! Every test is skipped when the kernel has no Landlock support.
#![cfg(target_os = "linux")]

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use autorun::sandbox::{
    ConfinementPlan, IsolationProfile, LaunchError, LaunchSpec, ProcessLauncher, SystemLauncher,
    detect_capabilities, exit_code_of, isolated_root,
};

fn strong_available(test: &str) -> bool {
    if detect_capabilities().strong_available() {
        return true;
    }
    eprintln!("skipping {}: Landlock is not available", test);
    false
}

fn launcher() -> SystemLauncher {
    SystemLauncher::with_helper(env!("CARGO_BIN_EXE_autorun"))
}

/// A tempdir standing in for a mounted device, canonicalized so paths
/// compare equal to what `pwd -P` reports.
fn device() -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let root = fs::canonicalize(dir.path()).unwrap();
    (dir, root)
}

fn plan(root: &Path) -> ConfinementPlan {
    ConfinementPlan {
        device_root: root.to_path_buf(),
        isolated_root: isolated_root(root),
        max_memory_bytes: None,
        max_processes: None,
        timeout_secs: None,
    }
}

fn profile(working_dir: &Path, plan: ConfinementPlan, env: &[(&str, &str)]) -> IsolationProfile {
    let mut environment: BTreeMap<String, String> = env
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    environment.insert("PATH".into(), "/usr/bin:/bin".into());
    IsolationProfile {
        working_dir: working_dir.to_path_buf(),
        environment,
        confinement: Some(plan),
    }
}

fn sh(script: &str) -> LaunchSpec {
    LaunchSpec::new("/bin/sh").with_args(vec!["-c".to_string(), script.to_string()])
}

#[test]
fn confined_program_runs_in_isolated_dir_and_cannot_read_outside() {
    if !strong_available("confined_program_runs_in_isolated_dir_and_cannot_read_outside") {
        return;
    }
    let (_dev, root) = device();
    let outside = tempfile::tempdir().unwrap();
    let secret = outside.path().join("secret.txt");
    fs::write(&secret, "host data").unwrap();

    let root_str = root.to_string_lossy().into_owned();
    let secret_str = secret.to_string_lossy().into_owned();
    let outside_str = outside.path().to_string_lossy().into_owned();
    let profile = profile(
        &root.join("work"),
        plan(&root),
        &[
            ("DEVICE", root_str.as_str()),
            ("SECRET", secret_str.as_str()),
            ("OUTSIDE", outside_str.as_str()),
        ],
    );
    let script = r#"
        pwd -P > "$DEVICE/pwd.txt"
        cat "$SECRET" > /dev/null 2>&1 && touch "$DEVICE/read-leak"
        touch "$OUTSIDE/written" 2> /dev/null && touch "$DEVICE/write-leak"
        exit 4
    "#;

    let mut process = launcher().launch(&sh(script), &profile).unwrap();

    assert!(process.is_confined());
    assert_eq!(exit_code_of(process.wait().unwrap()), 4);

    let pwd = fs::read_to_string(root.join("pwd.txt")).unwrap();
    assert_eq!(Path::new(pwd.trim()), root.join(".isolated").join("work"));
    assert!(!root.join("read-leak").exists());
    assert!(!root.join("write-leak").exists());
    assert!(!outside.path().join("written").exists());
}

#[test]
fn resource_ceilings_reach_the_program() {
    if !strong_available("resource_ceilings_reach_the_program") {
        return;
    }
    let (_dev, root) = device();
    let mut plan = plan(&root);
    plan.max_memory_bytes = Some(512 * 1024 * 1024);
    let profile = profile(&root, plan, &[]);

    // ulimit reports the address-space ceiling in KiB
    let script = r#"test "$(ulimit -v)" = 524288 && test "$(ulimit -n)" -le 1024"#;
    let mut process = launcher().launch(&sh(script), &profile).unwrap();

    assert!(process.is_confined());
    assert_eq!(exit_code_of(process.wait().unwrap()), 0);
}

#[test]
fn time_ceiling_covers_forked_children() {
    if !strong_available("time_ceiling_covers_forked_children") {
        return;
    }
    let (_dev, root) = device();
    let mut plan = plan(&root);
    plan.timeout_secs = Some(1);
    let root_str = root.to_string_lossy().into_owned();
    let profile = profile(&root, plan, &[("DEVICE", root_str.as_str())]);

    let script = r#"(sleep 2; touch "$DEVICE/survived") & sleep 30"#;
    let started = Instant::now();
    let mut process = launcher().launch(&sh(script), &profile).unwrap();
    let status = process.wait().unwrap();

    assert!(process.is_confined());
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(exit_code_of(status), 128 + 9);
    // the background subshell would have written this at 2s
    std::thread::sleep(Duration::from_millis(2500));
    assert!(!root.join("survived").exists());
}

#[test]
fn helper_setup_failure_falls_back_to_plain() {
    if !strong_available("helper_setup_failure_falls_back_to_plain") {
        return;
    }
    let (_dev, root) = device();
    // the helper cannot open a Landlock rule for a missing device root
    let mut plan = plan(&root);
    plan.device_root = root.join("unplugged");
    let profile = profile(&root, plan, &[]);

    let mut process = launcher().launch(&sh("exit 6"), &profile).unwrap();

    assert!(!process.is_confined());
    assert_eq!(exit_code_of(process.wait().unwrap()), 6);
}

#[test]
fn missing_program_fails_after_fallback() {
    if !strong_available("missing_program_fails_after_fallback") {
        return;
    }
    let (_dev, root) = device();
    let profile = profile(&root, plan(&root), &[]);

    let err = launcher()
        .launch(&LaunchSpec::new(root.join("no-such-program")), &profile)
        .unwrap_err();

    assert!(matches!(err, LaunchError::Spawn { .. }));
}
