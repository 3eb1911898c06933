//! Sources and the per-element source list.
//!
//! A [`Source`] pairs a plugin instance with its declaration. A source is
//! *resolved* iff a ref is present (or the kind needs none); only then can
//! its unique key — and therefore the element's cache key — be computed.

use std::path::Path;
use std::sync::Arc;

use serde_json::{Value, json};

use kiln_types::{Result, SourceRef};

use crate::plugin::SourcePlugin;

/// One declared source of an element.
pub struct Source {
    pub kind: String,
    pub config: Value,
    pub source_ref: Option<SourceRef>,
    pub plugin: Arc<dyn SourcePlugin>,
}

impl Source {
    pub fn new(
        kind: impl Into<String>,
        config: Value,
        source_ref: Option<SourceRef>,
        plugin: Box<dyn SourcePlugin>,
    ) -> Self {
        Self {
            kind: kind.into(),
            config,
            source_ref,
            plugin: Arc::from(plugin),
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.plugin.is_resolved()
    }

    /// Whether a declared ref carries no information for this kind.
    pub fn ref_is_redundant(&self) -> bool {
        self.source_ref.is_some() && !self.plugin.requires_ref()
    }
}

/// The ordered source list of one element, with its composite identity.
#[derive(Default)]
pub struct ElementSources {
    pub sources: Vec<Source>,
}

impl ElementSources {
    pub fn new(sources: Vec<Source>) -> Self {
        Self { sources }
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    /// All sources are pinned to concrete versions.
    pub fn is_resolved(&self) -> bool {
        self.sources.iter().all(Source::is_resolved)
    }

    /// Any source implements tracking.
    pub fn is_trackable(&self) -> bool {
        self.sources.iter().any(|s| s.plugin.is_trackable())
    }

    /// The composite unique key: one entry per source in declaration order.
    /// `None` until every source is resolved.
    pub fn unique_key(&self) -> Result<Option<Value>> {
        if !self.is_resolved() {
            return Ok(None);
        }
        let mut entries = Vec::with_capacity(self.sources.len());
        for source in &self.sources {
            entries.push(json!({
                "kind": source.kind,
                "key": source.plugin.get_unique_key()?,
            }));
        }
        Ok(Some(Value::Array(entries)))
    }

    /// Cache key of the composite staging tree; `None` until resolved.
    pub fn cache_key(&self) -> Result<Option<String>> {
        Ok(self.unique_key()?.map(|key| kiln_keys::generate_key(&key)))
    }

    /// Stage every source into `dest`, in declaration order.
    pub fn stage_all(&self, dest: &Path) -> Result<()> {
        for source in &self.sources {
            source.plugin.stage(dest)?;
        }
        Ok(())
    }

    /// Fetch every source that is not already locally available.
    pub fn fetch_all(&self) -> Result<()> {
        for source in &self.sources {
            source.plugin.fetch()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use kiln_types::{Error, ErrorKind};

    use super::*;

    /// Test double: a source resolved only when a ref is present.
    struct FakeSource {
        resolved: bool,
        key: &'static str,
        trackable: bool,
    }

    impl SourcePlugin for FakeSource {
        fn kind(&self) -> &str {
            "fake"
        }

        fn is_resolved(&self) -> bool {
            self.resolved
        }

        fn get_ref(&self) -> Option<SourceRef> {
            self.resolved.then(|| json!(self.key))
        }

        fn get_unique_key(&self) -> Result<Value> {
            if !self.resolved {
                return Err(Error::new(ErrorKind::CacheKey, "unresolved", "no ref yet"));
            }
            Ok(json!(self.key))
        }

        fn is_trackable(&self) -> bool {
            self.trackable
        }

        fn stage(&self, _dest: &Path) -> Result<()> {
            Ok(())
        }
    }

    fn source(resolved: bool, key: &'static str, trackable: bool) -> Source {
        Source::new(
            "fake",
            json!({}),
            resolved.then(|| json!(key)),
            Box::new(FakeSource {
                resolved,
                key,
                trackable,
            }),
        )
    }

    #[test]
    fn unresolved_source_blocks_the_composite_key() {
        let sources = ElementSources::new(vec![source(true, "a", false), source(false, "b", false)]);
        assert!(!sources.is_resolved());
        assert_eq!(sources.cache_key().expect("key"), None);
    }

    #[test]
    fn composite_key_is_order_sensitive() {
        let ab = ElementSources::new(vec![source(true, "a", false), source(true, "b", false)]);
        let ba = ElementSources::new(vec![source(true, "b", false), source(true, "a", false)]);
        assert_ne!(
            ab.cache_key().expect("key"),
            ba.cache_key().expect("key")
        );
    }

    #[test]
    fn composite_key_is_stable() {
        let sources = ElementSources::new(vec![source(true, "a", false)]);
        let k1 = sources.cache_key().expect("key").expect("some");
        let k2 = sources.cache_key().expect("key").expect("some");
        assert_eq!(k1, k2);
        assert!(kiln_keys::is_key(&k1));
    }

    #[test]
    fn trackability_is_any_source() {
        let none = ElementSources::new(vec![source(true, "a", false)]);
        assert!(!none.is_trackable());
        let one = ElementSources::new(vec![source(true, "a", false), source(false, "b", true)]);
        assert!(one.is_trackable());
    }

    #[test]
    fn empty_source_list_is_resolved() {
        let sources = ElementSources::default();
        assert!(sources.is_resolved());
        assert!(sources.cache_key().expect("key").is_some());
    }
}
