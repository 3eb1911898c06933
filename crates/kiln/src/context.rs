//! The session context: configuration, cache directories, stores and
//! plugin registries, explicitly threaded through constructors.

use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use kiln_cas::CasCache;
use kiln_types::{Error, ErrorKind, RemoteSpec, Result, SourceRef};

use crate::artifactcache::ArtifactCache;
use crate::config::UserConfig;
use crate::plugin::{ElementRegistry, SourceRegistry};
use crate::remotes::CacheRemotes;
use crate::sourcecache::SourceCache;

/// Process-wide state for one session. There are no globals: anything a
/// component needs arrives through the context.
pub struct Context {
    pub config: UserConfig,
    pub cachedir: PathBuf,
    pub cas: Arc<CasCache>,
    pub artifacts: Arc<ArtifactCache>,
    pub sources: Arc<SourceCache>,
    pub source_kinds: SourceRegistry,
    pub element_kinds: ElementRegistry,
    /// Remote execution endpoint, when configured.
    pub remote_execution: Option<RemoteSpec>,
    /// Refs declared on sources that do not consume them.
    pub redundant_refs: Mutex<Vec<(String, SourceRef)>>,
    pub strict: bool,
}

impl Context {
    /// Build a context from configuration, creating the cache directory
    /// layout as needed.
    pub fn new(config: UserConfig) -> Result<Self> {
        let cachedir = config.effective_cachedir();
        for sub in ["cas", "artifacts", "sources", "build", "tmp", "logs"] {
            fs::create_dir_all(cachedir.join(sub))
                .map_err(|e| Error::io(ErrorKind::Load, "failed to create cache dir", &e))?;
        }

        let cas = Arc::new(CasCache::new(cachedir.join("cas"))?);

        let artifact_remotes = CacheRemotes::connect(&config.parsed_artifact_remotes()?)?;
        let source_remotes = CacheRemotes::connect(&config.parsed_source_remotes()?)?;
        let remote_execution = config.parsed_remote_execution()?;

        let artifacts = Arc::new(ArtifactCache::new(
            cas.clone(),
            &cachedir.join("artifacts"),
            artifact_remotes,
            config.cache.require_buildtrees,
        )?);
        let sources = Arc::new(SourceCache::new(
            cas.clone(),
            &cachedir.join("sources"),
            source_remotes,
        )?);

        let strict = config.strict;
        Ok(Self {
            config,
            cachedir,
            cas,
            artifacts,
            sources,
            source_kinds: SourceRegistry::with_builtins(),
            element_kinds: ElementRegistry::with_builtins(),
            remote_execution,
            redundant_refs: Mutex::new(Vec::new()),
            strict,
        })
    }

    pub fn builddir(&self) -> PathBuf {
        self.cachedir.join("build")
    }

    pub fn logdir(&self) -> PathBuf {
        self.cachedir.join("logs")
    }

    pub fn tmpdir(&self) -> PathBuf {
        self.cachedir.join("tmp")
    }

    /// Record a source ref that carries no information for its kind.
    pub fn record_redundant_ref(&self, source_name: &str, source_ref: SourceRef) {
        let mut refs = self.redundant_refs.lock().unwrap_or_else(|e| e.into_inner());
        refs.push((source_name.to_string(), source_ref));
    }

    /// Apply the configured quota, if any, evicting least-recently-used
    /// objects not referenced by the session.
    pub fn enforce_quota(&self) -> Result<()> {
        if let Some(quota) = self.config.cache.quota_bytes {
            self.cas.evict_to_quota(quota)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    fn config(root: &std::path::Path) -> UserConfig {
        UserConfig {
            cachedir: Some(root.join("cache")),
            ..UserConfig::default()
        }
    }

    #[test]
    fn context_creates_the_cache_layout() {
        let td = tempdir().expect("tempdir");
        let ctx = Context::new(config(td.path())).expect("context");

        for sub in ["cas", "artifacts/refs", "sources/refs", "build", "tmp", "logs"] {
            assert!(ctx.cachedir.join(sub).is_dir(), "{} missing", sub);
        }
        assert!(ctx.strict);
    }

    #[test]
    fn redundant_refs_accumulate() {
        let td = tempdir().expect("tempdir");
        let ctx = Context::new(config(td.path())).expect("context");

        ctx.record_redundant_ref("app.bst [source 0]", serde_json::json!("v1"));
        let refs = ctx.redundant_refs.lock().expect("lock");
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].0, "app.bst [source 0]");
    }

    #[test]
    fn quota_enforcement_is_a_noop_without_quota() {
        let td = tempdir().expect("tempdir");
        let ctx = Context::new(config(td.path())).expect("context");
        ctx.cas.add_blob(b"payload").expect("add");
        ctx.enforce_quota().expect("no quota");
    }
}
