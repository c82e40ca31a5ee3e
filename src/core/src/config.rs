use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

use crate::error::{BoxError, Result};

/// Conventional plan file name used when none is given.
pub const DEFAULT_PLAN_FILE: &str = "box.plan";

/// Any non-empty value disables the step cache.
pub const NO_CACHE_ENV: &str = "NO_CACHE";

/// Overrides the persisted step cache location.
pub const CACHE_DIR_ENV: &str = "BOX_CACHE_DIR";

/// Per-build configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildConfig {
    /// Plan file name, also used to label log output
    pub file_name: PathBuf,

    /// Variables injected with `--var key=value`
    pub vars: HashMap<String, String>,

    /// Read and write the step cache
    pub cache: bool,

    /// Verbs the evaluator must reject
    pub omit: Vec<String>,

    /// Stream `run` output
    pub show_run: bool,

    /// Colourise output
    pub color: bool,

    /// Stdout is treated as a terminal
    pub tty: bool,

    /// Trim output lines to the terminal width
    pub trim: bool,

    /// Where the step cache is persisted; `None` keeps it in memory
    pub cache_dir: Option<PathBuf>,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            file_name: PathBuf::from(DEFAULT_PLAN_FILE),
            vars: HashMap::new(),
            cache: true,
            omit: Vec::new(),
            show_run: true,
            color: false,
            tty: false,
            trim: true,
            cache_dir: None,
        }
    }
}

impl BuildConfig {
    /// Short label for this build, the plan's file name.
    pub fn label(&self) -> String {
        self.file_name
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| self.file_name.display().to_string())
    }

    /// Directory that relative `copy` sources resolve against.
    pub fn context_dir(&self) -> PathBuf {
        match self.file_name.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        }
    }
}

/// Resolve whether caching is on: `NO_CACHE` disables it, the flag always wins.
pub fn cache_enabled(no_cache_flag: bool) -> bool {
    let env_disabled = std::env::var(NO_CACHE_ENV)
        .map(|v| !v.is_empty())
        .unwrap_or(false);
    !(no_cache_flag || env_disabled)
}

/// Default persisted cache location (~/.box/cache), or `BOX_CACHE_DIR`.
pub fn default_cache_dir() -> PathBuf {
    if let Ok(dir) = std::env::var(CACHE_DIR_ENV) {
        if !dir.is_empty() {
            return PathBuf::from(dir);
        }
    }
    dirs::home_dir()
        .map(|h| h.join(".box"))
        .unwrap_or_else(|| PathBuf::from(".box"))
        .join("cache")
}

/// Parse `key=value` pairs. Values may contain `=`.
pub fn parse_vars(args: &[String]) -> Result<HashMap<String, String>> {
    let mut map = HashMap::new();
    for arg in args {
        let (key, value) = arg.split_once('=').ok_or_else(|| {
            BoxError::ConfigError(format!("Invalid var (expected KEY=VALUE): {arg}"))
        })?;
        if key.is_empty() {
            return Err(BoxError::ConfigError(format!(
                "Invalid var (empty key): {arg}"
            )));
        }
        map.insert(key.to_string(), value.to_string());
    }
    Ok(map)
}

/// Terminal feature toggles resolved from flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TermFlags {
    pub no_tty: bool,
    pub force_tty: bool,
    pub no_color: bool,
    pub force_color: bool,
}

impl TermFlags {
    /// Returns `(tty, color)`. Colour follows the TTY unless forced either way.
    pub fn resolve(&self, is_terminal: bool) -> (bool, bool) {
        let mut tty = is_terminal;
        if self.no_tty {
            tty = false;
        }
        if self.force_tty {
            tty = true;
        }

        let mut color = tty;
        if self.no_color {
            color = false;
        }
        if self.force_color {
            color = true;
        }
        (tty, color)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_vars_valid() {
        let args = vec!["VERSION=1.0".to_string(), "DEBUG=true".to_string()];
        let result = parse_vars(&args).unwrap();
        assert_eq!(result.get("VERSION"), Some(&"1.0".to_string()));
        assert_eq!(result.get("DEBUG"), Some(&"true".to_string()));
    }

    #[test]
    fn test_parse_vars_empty() {
        assert!(parse_vars(&[]).unwrap().is_empty());
    }

    #[test]
    fn test_parse_vars_invalid() {
        let args = vec!["NOEQUALS".to_string()];
        assert!(matches!(parse_vars(&args), Err(BoxError::ConfigError(_))));
    }

    #[test]
    fn test_parse_vars_empty_key() {
        let args = vec!["=value".to_string()];
        assert!(parse_vars(&args).is_err());
    }

    #[test]
    fn test_parse_vars_value_with_equals() {
        let args = vec!["URL=http://example.com?a=1".to_string()];
        let result = parse_vars(&args).unwrap();
        assert_eq!(
            result.get("URL"),
            Some(&"http://example.com?a=1".to_string())
        );
    }

    #[test]
    fn test_cache_flag_wins() {
        assert!(!cache_enabled(true));
    }

    #[test]
    fn test_term_flags_default_follow_terminal() {
        assert_eq!(TermFlags::default().resolve(true), (true, true));
        assert_eq!(TermFlags::default().resolve(false), (false, false));
    }

    #[test]
    fn test_term_flags_overrides() {
        let flags = TermFlags {
            no_tty: true,
            force_color: true,
            ..Default::default()
        };
        assert_eq!(flags.resolve(true), (false, true));

        let flags = TermFlags {
            force_tty: true,
            no_color: true,
            ..Default::default()
        };
        assert_eq!(flags.resolve(false), (true, false));
    }

    #[test]
    fn test_label_and_context_dir() {
        let config = BuildConfig {
            file_name: PathBuf::from("plans/web.plan"),
            ..Default::default()
        };
        assert_eq!(config.label(), "web.plan");
        assert_eq!(config.context_dir(), PathBuf::from("plans"));

        let config = BuildConfig::default();
        assert_eq!(config.context_dir(), PathBuf::from("."));
    }
}
