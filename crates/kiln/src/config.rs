//! User configuration (`kiln.toml`) loading and merging.
//!
//! Configuration is resolved in three layers: built-in defaults, the user
//! config file (`$XDG_CONFIG_HOME/kiln/kiln.toml` by default), and the
//! project file's overrides. Every section is optional; omitted values fall
//! back to defaults.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use kiln_types::{Error, ErrorKind, RemoteSpec, RemoteType, Result};

/// What the scheduler does when a build fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorAction {
    /// Drain independent work, then report.
    #[default]
    Continue,
    /// Finish in-flight jobs, stop scheduling new ones.
    Quit,
    /// Abort workers immediately.
    Terminate,
}

/// Scheduler concurrency and retry knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Concurrent fetch/pull workers.
    #[serde(default = "default_fetchers")]
    pub fetchers: usize,
    /// Concurrent build workers.
    #[serde(default = "default_builders")]
    pub builders: usize,
    /// Concurrent push workers.
    #[serde(default = "default_pushers")]
    pub pushers: usize,
    /// Retries for transient network failures.
    #[serde(default = "default_network_retries", rename = "network-retries")]
    pub network_retries: u32,
    /// Failure policy.
    #[serde(default, rename = "on-error")]
    pub on_error: ErrorAction,
}

fn default_fetchers() -> usize {
    10
}

fn default_builders() -> usize {
    4
}

fn default_pushers() -> usize {
    4
}

fn default_network_retries() -> u32 {
    2
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            fetchers: default_fetchers(),
            builders: default_builders(),
            pushers: default_pushers(),
            network_retries: default_network_retries(),
            on_error: ErrorAction::Continue,
        }
    }
}

/// When buildtrees are kept in artifacts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildtreePolicy {
    /// Capture buildtrees only for failed builds.
    #[default]
    Auto,
    /// Always capture buildtrees.
    Always,
    /// Never capture buildtrees.
    Never,
}

/// Cache-related configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Local store quota in bytes; unset means unlimited.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quota_bytes: Option<u64>,
    /// Buildtree capture policy.
    #[serde(default, rename = "cache-buildtrees")]
    pub cache_buildtrees: BuildtreePolicy,
    /// Whether pulling requires buildtrees to be present.
    #[serde(default, rename = "require-buildtrees")]
    pub require_buildtrees: bool,
}

/// The user configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserConfig {
    /// Root directory for all caches; defaults to `$XDG_CACHE_HOME/kiln`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cachedir: Option<PathBuf>,
    /// Strict cache-key regime (default true).
    #[serde(default = "default_strict")]
    pub strict: bool,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    /// Artifact cache remote specs, in priority order.
    #[serde(default, rename = "artifact-remotes")]
    pub artifact_remotes: Vec<String>,
    /// Source cache remote specs, in priority order.
    #[serde(default, rename = "source-remotes")]
    pub source_remotes: Vec<String>,
    /// Remote execution endpoint spec, if any.
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "remote-execution")]
    pub remote_execution: Option<String>,
}

fn default_strict() -> bool {
    true
}

impl UserConfig {
    /// Load configuration from a specific file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            Error::io(
                ErrorKind::Load,
                format!("failed to read config {}", path.display()),
                &e,
            )
        })?;
        toml::from_str(&content).map_err(|e| {
            Error::new(
                ErrorKind::Load,
                "invalid-config",
                format!("invalid config {}: {}", path.display(), e),
            )
        })
    }

    /// Load the user config from the default location, or defaults when the
    /// file does not exist.
    pub fn load_default() -> Result<Self> {
        let path = default_config_path();
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// The effective cache directory, honoring `XDG_CACHE_HOME`.
    pub fn effective_cachedir(&self) -> PathBuf {
        if let Some(dir) = &self.cachedir {
            return dir.clone();
        }
        cache_home().join("kiln")
    }

    /// Parse the artifact remote specs in order.
    pub fn parsed_artifact_remotes(&self) -> Result<Vec<RemoteSpec>> {
        self.artifact_remotes.iter().map(|s| s.parse()).collect()
    }

    /// Parse the source remote specs in order.
    pub fn parsed_source_remotes(&self) -> Result<Vec<RemoteSpec>> {
        self.source_remotes.iter().map(|s| s.parse()).collect()
    }

    /// Parse the remote execution endpoint, if configured.
    pub fn parsed_remote_execution(&self) -> Result<Option<RemoteSpec>> {
        match &self.remote_execution {
            Some(s) => Ok(Some(RemoteSpec::parse_with_type(s, RemoteType::Endpoint)?)),
            None => Ok(None),
        }
    }
}

/// `$XDG_CONFIG_HOME/kiln/kiln.toml`, falling back to `~/.config`.
pub fn default_config_path() -> PathBuf {
    config_home().join("kiln").join("kiln.toml")
}

fn cache_home() -> PathBuf {
    std::env::var_os("XDG_CACHE_HOME")
        .map(PathBuf::from)
        .filter(|p| p.is_absolute())
        .or_else(dirs::cache_dir)
        .unwrap_or_else(|| PathBuf::from(".cache"))
}

fn config_home() -> PathBuf {
    std::env::var_os("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .filter(|p| p.is_absolute())
        .or_else(dirs::config_dir)
        .unwrap_or_else(|| PathBuf::from(".config"))
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    #[test]
    fn defaults_are_sensible() {
        let config = UserConfig::default();
        assert!(config.strict);
        assert_eq!(config.scheduler.builders, 4);
        assert_eq!(config.scheduler.network_retries, 2);
        assert_eq!(config.scheduler.on_error, ErrorAction::Continue);
        assert!(config.artifact_remotes.is_empty());
    }

    #[test]
    fn loads_partial_config() {
        let td = tempdir().expect("tempdir");
        let path = td.path().join("kiln.toml");
        fs::write(
            &path,
            r#"
strict = false

[scheduler]
builders = 2
on-error = "quit"

[cache]
quota_bytes = 1000000
"#,
        )
        .expect("write");

        let config = UserConfig::load(&path).expect("load");
        assert!(!config.strict);
        assert_eq!(config.scheduler.builders, 2);
        assert_eq!(config.scheduler.on_error, ErrorAction::Quit);
        // Unset sections keep defaults.
        assert_eq!(config.scheduler.fetchers, 10);
        assert_eq!(config.cache.quota_bytes, Some(1_000_000));
    }

    #[test]
    fn rejects_malformed_toml() {
        let td = tempdir().expect("tempdir");
        let path = td.path().join("kiln.toml");
        fs::write(&path, "strict = maybe").expect("write");

        let err = UserConfig::load(&path).expect_err("bad toml");
        assert_eq!(err.kind, ErrorKind::Load);
        assert_eq!(err.reason, "invalid-config");
    }

    #[test]
    fn remote_specs_parse_in_order() {
        let config = UserConfig {
            artifact_remotes: vec![
                "https://a.test,push=true".to_string(),
                "https://b.test".to_string(),
            ],
            ..Default::default()
        };
        let remotes = config.parsed_artifact_remotes().expect("parse");
        assert_eq!(remotes.len(), 2);
        assert!(remotes[0].push);
        assert!(!remotes[1].push);
    }

    #[test]
    fn cachedir_honors_xdg_cache_home() {
        temp_env::with_var("XDG_CACHE_HOME", Some("/xdg/cache"), || {
            let config = UserConfig::default();
            assert_eq!(config.effective_cachedir(), PathBuf::from("/xdg/cache/kiln"));
        });
    }

    #[test]
    fn explicit_cachedir_wins() {
        let config = UserConfig {
            cachedir: Some(PathBuf::from("/custom")),
            ..Default::default()
        };
        assert_eq!(config.effective_cachedir(), PathBuf::from("/custom"));
    }

    #[test]
    fn remote_execution_requires_endpoint_port() {
        let config = UserConfig {
            remote_execution: Some("http://exec.test".to_string()),
            ..Default::default()
        };
        assert!(config.parsed_remote_execution().is_err());

        let config = UserConfig {
            remote_execution: Some("http://exec.test:50051".to_string()),
            ..Default::default()
        };
        assert!(config.parsed_remote_execution().expect("parse").is_some());
    }
}
