/// Strong-isolation capabilities of the current host.
#[derive(Debug, Clone)]
pub struct SandboxCapabilities {
    /// Landlock ABI version reported by the kernel (Linux only).
    pub landlock_abi: Option<u32>,

    /// Whether resource ceilings (setrlimit) can be applied.
    pub rlimits: bool,
}

impl SandboxCapabilities {
    /// Strong isolation needs an enforceable filesystem allowlist.
    pub fn strong_available(&self) -> bool {
        self.landlock_abi.is_some()
    }

    /// Human-readable status lines for `sandbox status` command.
    pub fn status_lines(&self) -> Vec<String> {
        let mut lines = Vec::new();

        if let Some(abi) = self.landlock_abi {
            lines.push(format!("  Landlock:  v{:<3}                    ok", abi));
        } else {
            lines.push("  Landlock:  not available           --".to_string());
        }

        if self.rlimits {
            lines.push("  Rlimits:   available               ok".to_string());
        } else {
            lines.push("  Rlimits:   not available           --".to_string());
        }

        lines.push(format!(
            "  Strong:    {}",
            if self.strong_available() {
                "available"
            } else {
                "unavailable (environment redirection only)"
            }
        ));

        lines
    }
}

/// Detect the sandbox capabilities of the current system.
pub fn detect_capabilities() -> SandboxCapabilities {
    #[cfg(target_os = "linux")]
    {
        SandboxCapabilities {
            landlock_abi: query_landlock_abi(),
            rlimits: true,
        }
    }

    #[cfg(not(target_os = "linux"))]
    {
        SandboxCapabilities {
            landlock_abi: None,
            rlimits: cfg!(unix),
        }
    }
}

#[cfg(target_os = "linux")]
fn query_landlock_abi() -> Option<u32> {
    // landlock_create_ruleset(NULL, 0, LANDLOCK_CREATE_RULESET_VERSION)
    const LANDLOCK_CREATE_RULESET_VERSION: libc::c_uint = 1;
    let ret = unsafe {
        libc::syscall(
            libc::SYS_landlock_create_ruleset,
            std::ptr::null::<libc::c_void>(),
            0usize,
            LANDLOCK_CREATE_RULESET_VERSION,
        )
    };
    (ret > 0).then_some(ret as u32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_capabilities_runs() {
        let caps = detect_capabilities();
        assert_eq!(caps.strong_available(), caps.landlock_abi.is_some());
    }

    #[test]
    fn test_status_lines() {
        let caps = SandboxCapabilities {
            landlock_abi: None,
            rlimits: true,
        };
        let lines = caps.status_lines();
        assert_eq!(lines.len(), 3);
        assert!(lines[2].contains("environment redirection only"));

        let caps = SandboxCapabilities {
            landlock_abi: Some(4),
            rlimits: true,
        };
        assert!(caps.status_lines()[0].contains("v4"));
    }
}
