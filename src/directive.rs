//! The autorun directive: a small TOML file at the root of a volume naming
//! the program to launch and how to launch it.
//!
//! ```toml
//! autorun = "tools/setup.sh"
//! workDir = "{drive}/tools"
//! isolated = true
//!
//! [environment]
//! MODE = "portable"
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

/// File name of the directive on a device root.
pub const DIRECTIVE_FILENAME: &str = ".autorun.toml";

/// Declarative autorun record read from a device root.
///
/// Treated as an immutable value once loaded. The environment map is a
/// `BTreeMap` so iteration (and therefore fingerprinting) is key-ordered.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Directive {
    /// Program reference, possibly relative to the device root.
    #[serde(rename = "autorun", default, skip_serializing_if = "String::is_empty")]
    pub program: String,

    /// Working directory, possibly relative to the device root.
    #[serde(rename = "workDir", default, skip_serializing_if = "String::is_empty")]
    pub work_dir: String,

    #[serde(rename = "isolated", default)]
    pub isolate: bool,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub environment: BTreeMap<String, String>,
}

#[derive(Debug, Error)]
pub enum DirectiveError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("malformed directive {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Path of the directive file for a device root.
pub fn directive_path(root: &Path) -> PathBuf {
    root.join(DIRECTIVE_FILENAME)
}

/// Whether a directive file is present on `root` (content is not checked).
pub fn has_directive(root: &Path) -> bool {
    directive_path(root).is_file()
}

/// Load the directive from a device root.
///
/// A missing file, or one whose `autorun` key is empty, is `Ok(None)`:
/// there is nothing to run.
pub fn load_directive(root: &Path) -> Result<Option<Directive>, DirectiveError> {
    let path = directive_path(root);

    let content = match fs::read_to_string(&path) {
        Ok(c) => c,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            debug!("No directive at {}", path.display());
            return Ok(None);
        }
        Err(source) => return Err(DirectiveError::Read { path, source }),
    };

    let directive: Directive =
        toml::from_str(&content).map_err(|source| DirectiveError::Parse {
            path: path.clone(),
            source,
        })?;

    if directive.program.trim().is_empty() {
        debug!("Directive at {} names no program", path.display());
        return Ok(None);
    }

    Ok(Some(directive))
}

/// Write a directive to a device root.
pub fn save_directive(root: &Path, directive: &Directive) -> Result<(), DirectiveError> {
    let path = directive_path(root);
    let content = toml::to_string_pretty(directive).map_err(|e| DirectiveError::Write {
        path: path.clone(),
        source: io::Error::new(io::ErrorKind::InvalidData, e),
    })?;
    fs::write(&path, content).map_err(|source| DirectiveError::Write { path, source })
}

/// Starter directive written by `directive init`.
pub fn template() -> Directive {
    Directive {
        program: "example.sh".to_string(),
        work_dir: "./".to_string(),
        isolate: false,
        environment: BTreeMap::from([("FOO".to_string(), "BAR".to_string())]),
    }
}

impl Directive {
    /// Substitute `{drive}` and `{work}` placeholders.
    ///
    /// `{drive}` is the device root; `{work}` is the working directory after
    /// its own `{drive}` substitution. Applied at launch time only: the
    /// fingerprint always covers the raw directive.
    pub fn expand(&self, root: &Path) -> Directive {
        let drive = root.to_string_lossy();
        let drive = drive.trim_end_matches('/');
        let work = self.work_dir.replace("{drive}", drive);

        let substitute = |s: &str| s.replace("{drive}", drive).replace("{work}", &work);

        Directive {
            program: substitute(&self.program),
            work_dir: work.clone(),
            isolate: self.isolate,
            environment: self
                .environment
                .iter()
                .map(|(k, v)| (k.clone(), substitute(v)))
                .collect(),
        }
    }

    /// Program path resolved against the device root when relative.
    pub fn program_path(&self, root: &Path) -> PathBuf {
        let program = Path::new(&self.program);
        if program.is_absolute() {
            program.to_path_buf()
        } else {
            root.join(program)
        }
    }
}
