//! Daemon identity and name sanitizing.

use std::path::{Path, PathBuf};

/// Characters that may not appear in a daemon name once it becomes a path.
const UNSAFE_CHARS: &[char] = &[
    '#', '$', '%', '^', '&', '*', '!', '~', '"', '\'', '=', '?', '/', '[', ']', '(', ')', '|',
    '<', '>', ';', ':', '\\', ',',
];

/// Replace filesystem and shell unsafe characters with `_`.
///
/// Used for pid-file paths and log-file names alike.
pub fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if UNSAFE_CHARS.contains(&c) { '_' } else { c })
        .collect()
}

/// Identity of a daemon. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaemonDescriptor {
    name: String,
    description: String,
    log_dir: Option<PathBuf>,
}

impl DaemonDescriptor {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            log_dir: None,
        }
    }

    /// Attach a log destination directory.
    pub fn with_log_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.log_dir = Some(dir.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn log_dir(&self) -> Option<&Path> {
        self.log_dir.as_deref()
    }

    /// Sanitized form of the name.
    pub fn sanitized_name(&self) -> String {
        sanitize(&self.name)
    }

    /// `{log_dir}/{sanitized}.log`, when a log directory is set.
    pub fn log_file(&self) -> Option<PathBuf> {
        self.log_dir
            .as_ref()
            .map(|dir| dir.join(format!("{}.log", self.sanitized_name())))
    }

    /// `{pid_root}/{sanitized}/{sanitized}.pid`
    pub fn pid_file_path(&self, pid_root: &Path) -> PathBuf {
        let name = self.sanitized_name();
        pid_root.join(&name).join(format!("{}.pid", name))
    }
}
