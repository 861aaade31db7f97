//! Shell detection and argv construction.
//!
//! [`ShellResolver`] turns the command string supplied to `create()` into
//! the argument vector handed to a process backend. It never fails: every
//! input yields a usable argv.

use std::path::{Path, PathBuf};

use crate::config::{AutomationConfig, Config};

/// Shells probed, in order, when `$SHELL` is unset or unusable.
#[cfg(unix)]
const FALLBACK_SHELLS: &[&str] = &[
    "/bin/bash",
    "/usr/bin/bash",
    "/usr/local/bin/bash",
    "/bin/zsh",
    "/usr/bin/zsh",
    "/bin/sh",
];

/// Builds argv vectors for session commands.
#[derive(Debug, Clone)]
pub struct ShellResolver {
    shell: String,
    automation: AutomationConfig,
}

impl ShellResolver {
    /// Creates a resolver.
    ///
    /// An empty `shell` means "detect from the environment".
    pub fn new(shell: &str, automation: AutomationConfig) -> Self {
        let shell = if shell.trim().is_empty() {
            detect_shell()
        } else {
            shell.to_string()
        };

        Self { shell, automation }
    }

    /// Creates a resolver from the session and automation config sections.
    pub fn from_config(config: &Config) -> Self {
        Self::new(&config.session.default_shell, config.automation.clone())
    }

    /// Returns the shell used for login shells and `-c` commands.
    pub fn shell(&self) -> &str {
        &self.shell
    }

    /// Builds the argv for `command`.
    ///
    /// - empty: an interactive login shell
    /// - ends with an automation suffix: the configured runner, or a file dump
    /// - anything else: `[shell, "-c", command]` (`/c` on Windows)
    pub fn resolve(&self, command: &str) -> Vec<String> {
        let command = command.trim();

        if command.is_empty() {
            return self.login_shell();
        }

        if self.is_automation_file(command) {
            return self.automation_argv(command);
        }

        vec![self.shell.clone(), shell_flag().to_string(), command.to_string()]
    }

    /// Returns true if `command` names an automation file.
    pub fn is_automation_file(&self, command: &str) -> bool {
        let lower = command.trim().to_lowercase();
        self.automation
            .suffixes
            .iter()
            .any(|suffix| lower.ends_with(&suffix.to_lowercase()))
    }

    fn login_shell(&self) -> Vec<String> {
        if cfg!(windows) {
            vec![self.shell.clone()]
        } else {
            vec![self.shell.clone(), "-l".to_string()]
        }
    }

    fn automation_argv(&self, file: &str) -> Vec<String> {
        if let Some(runner) = self.runner_path() {
            let mut argv = Vec::with_capacity(self.automation.runner_args.len() + 2);
            argv.push(runner.to_string_lossy().into_owned());
            argv.extend(self.automation.runner_args.iter().cloned());
            argv.push(file.to_string());
            return argv;
        }

        tracing::debug!(file = %file, "Automation runner unavailable, displaying file instead");

        if cfg!(windows) {
            vec![
                self.shell.clone(),
                "/c".to_string(),
                "type".to_string(),
                file.to_string(),
            ]
        } else {
            vec!["cat".to_string(), "--".to_string(), file.to_string()]
        }
    }

    /// Confirms the runner exists, either at an absolute path or on PATH.
    fn runner_path(&self) -> Option<PathBuf> {
        let runner = self.automation.runner.as_deref()?.trim();
        if runner.is_empty() {
            return None;
        }

        let path = Path::new(runner);
        if path.is_absolute() {
            return path.is_file().then(|| path.to_path_buf());
        }

        which::which(runner).ok()
    }
}

/// Returns the flag that makes the platform shell run a command string.
fn shell_flag() -> &'static str {
    if cfg!(windows) {
        "/c"
    } else {
        "-c"
    }
}

/// Detects the interactive shell for this platform.
///
/// On unix: `$SHELL` if it points to an existing program, then the first
/// existing entry of a fixed list, then `/bin/sh`.
#[cfg(unix)]
pub fn detect_shell() -> String {
    if let Ok(shell) = std::env::var("SHELL") {
        let shell = shell.trim();
        if !shell.is_empty() && shell_exists(shell) {
            return shell.to_string();
        }
    }

    FALLBACK_SHELLS
        .iter()
        .find(|candidate| Path::new(candidate).exists())
        .map(|s| s.to_string())
        .unwrap_or_else(|| "/bin/sh".to_string())
}

/// Detects the interactive shell for this platform (`%COMSPEC%` or `cmd.exe`).
#[cfg(not(unix))]
pub fn detect_shell() -> String {
    std::env::var("COMSPEC")
        .ok()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| "cmd.exe".to_string())
}

#[cfg(unix)]
fn shell_exists(shell: &str) -> bool {
    let path = Path::new(shell);
    if path.is_absolute() {
        path.exists()
    } else {
        which::which(shell).is_ok()
    }
}
