//! Working directory and environment preparation for spawned sessions.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Locale forced on every child so tools emit UTF-8.
#[cfg(target_os = "macos")]
const UTF8_LOCALE: &str = "en_US.UTF-8";
#[cfg(not(target_os = "macos"))]
const UTF8_LOCALE: &str = "C.UTF-8";

/// Variables that keep output colored, unbuffered and UTF-8 encoded.
const OUTPUT_VARS: &[(&str, &str)] = &[
    ("TERM", "xterm-256color"),
    ("COLORTERM", "truecolor"),
    ("FORCE_COLOR", "1"),
    ("CLICOLOR_FORCE", "1"),
    ("PYTHONUNBUFFERED", "1"),
    ("PYTHONIOENCODING", "utf-8"),
];

/// Variables that stop common tools from waiting on interactive prompts.
const NON_INTERACTIVE_VARS: &[(&str, &str)] = &[
    ("GIT_TERMINAL_PROMPT", "0"),
    ("DEBIAN_FRONTEND", "noninteractive"),
    ("PIP_NO_INPUT", "1"),
    ("PAGER", "cat"),
    ("GIT_PAGER", "cat"),
];

/// Returns a usable working directory for `requested`.
///
/// A missing directory is created. If `requested` is empty, cannot be
/// created, or is not a directory, the user's home directory is used,
/// then the system temp directory.
pub fn resolve_workspace(requested: &Path) -> PathBuf {
    if !requested.as_os_str().is_empty() {
        if requested.is_dir() {
            return requested.to_path_buf();
        }

        if !requested.exists() {
            match std::fs::create_dir_all(requested) {
                Ok(()) => return requested.to_path_buf(),
                Err(e) => tracing::warn!(
                    workspace = %requested.display(),
                    error = %e,
                    "Failed to create workspace, falling back to home directory"
                ),
            }
        } else {
            tracing::warn!(
                workspace = %requested.display(),
                "Workspace is not a directory, falling back to home directory"
            );
        }
    }

    dirs::home_dir()
        .filter(|home| home.is_dir())
        .unwrap_or_else(std::env::temp_dir)
}

/// Builds the variables layered over the inherited environment.
///
/// Fixed variables come first and `overrides` last, so configured values
/// win. The result is identical for identical inputs.
pub fn build_environment(overrides: &BTreeMap<String, String>) -> Vec<(String, String)> {
    let mut env: BTreeMap<String, String> = BTreeMap::new();

    env.insert("LANG".to_string(), UTF8_LOCALE.to_string());
    env.insert("LC_ALL".to_string(), UTF8_LOCALE.to_string());

    for (key, value) in OUTPUT_VARS.iter().chain(NON_INTERACTIVE_VARS) {
        env.insert(key.to_string(), value.to_string());
    }

    for (key, value) in overrides {
        env.insert(key.clone(), value.clone());
    }

    env.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn lookup<'a>(env: &'a [(String, String)], key: &str) -> Option<&'a str> {
        env.iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    #[test]
    fn test_existing_workspace_is_kept() {
        let dir = TempDir::new().unwrap();
        assert_eq!(resolve_workspace(dir.path()), dir.path());
    }

    #[test]
    fn test_missing_workspace_is_created() {
        let dir = TempDir::new().unwrap();
        let nested = dir.path().join("a").join("b");

        assert_eq!(resolve_workspace(&nested), nested);
        assert!(nested.is_dir());
    }

    #[test]
    fn test_file_workspace_falls_back() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("not_a_dir");
        std::fs::write(&file, "x").unwrap();

        let resolved = resolve_workspace(&file);
        assert_ne!(resolved, file);
        assert!(resolved.is_dir());
    }

    #[test]
    fn test_empty_workspace_falls_back() {
        let resolved = resolve_workspace(Path::new(""));
        assert!(resolved.is_dir());
    }

    #[test]
    fn test_environment_forces_utf8_and_color() {
        let env = build_environment(&BTreeMap::new());

        assert_eq!(lookup(&env, "LANG"), Some(UTF8_LOCALE));
        assert_eq!(lookup(&env, "LC_ALL"), Some(UTF8_LOCALE));
        assert_eq!(lookup(&env, "PYTHONIOENCODING"), Some("utf-8"));
        assert_eq!(lookup(&env, "FORCE_COLOR"), Some("1"));
        assert_eq!(lookup(&env, "GIT_TERMINAL_PROMPT"), Some("0"));
    }

    #[test]
    fn test_environment_overrides_win() {
        let mut overrides = BTreeMap::new();
        overrides.insert("TERM".to_string(), "dumb".to_string());
        overrides.insert("MY_VAR".to_string(), "1".to_string());

        let env = build_environment(&overrides);
        assert_eq!(lookup(&env, "TERM"), Some("dumb"));
        assert_eq!(lookup(&env, "MY_VAR"), Some("1"));
        assert_eq!(env.iter().filter(|(k, _)| k == "TERM").count(), 1);
    }

    #[test]
    fn test_environment_is_deterministic() {
        let overrides = BTreeMap::from([("Z".to_string(), "z".to_string())]);
        assert_eq!(build_environment(&overrides), build_environment(&overrides));
    }
}
