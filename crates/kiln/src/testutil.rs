//! Shared fixtures for unit tests: a small graph builder with fake sources.

use std::collections::BTreeMap;
use std::path::Path;

use serde_json::{Value, json};

use kiln_types::{DepKind, Error, Result, SourceRef};

use crate::element::{Dependency, ElementDecl, ElementId, Graph};
use crate::plugin::{ElementRegistry, SourcePlugin};
use crate::source::{ElementSources, Source};

/// A fake source pinned by an inline key; unresolved when the key is absent.
pub(crate) struct TestSource {
    key: Option<String>,
}

impl SourcePlugin for TestSource {
    fn kind(&self) -> &str {
        "test"
    }

    fn is_resolved(&self) -> bool {
        self.key.is_some()
    }

    fn get_ref(&self) -> Option<SourceRef> {
        self.key.as_ref().map(|k| json!(k))
    }

    fn get_unique_key(&self) -> Result<Value> {
        match &self.key {
            Some(key) => Ok(json!(key)),
            None => Err(Error::new(
                kiln_types::ErrorKind::CacheKey,
                "unresolved",
                "test source has no ref",
            )),
        }
    }

    fn fetch(&self) -> Result<()> {
        Ok(())
    }

    fn stage(&self, dest: &Path) -> Result<()> {
        let name = format!("source-{}.txt", self.key.as_deref().unwrap_or("none"));
        std::fs::write(dest.join(name), self.key.as_deref().unwrap_or(""))
            .map_err(|e| Error::io(kiln_types::ErrorKind::Source, "stage failed", &e))
    }
}

/// A graph under construction plus the strict-mode flag the cascade uses.
pub(crate) struct TestGraph {
    pub graph: Graph,
    pub strict: bool,
    elements: ElementRegistry,
}

impl TestGraph {
    pub fn new(strict: bool) -> Self {
        Self {
            graph: Graph::new(),
            strict,
            elements: ElementRegistry::with_builtins(),
        }
    }

    pub fn element(&mut self, name: &str) -> TestElementBuilder<'_> {
        TestElementBuilder {
            t: self,
            name: name.to_string(),
            kind: "manual".to_string(),
            deps: Vec::new(),
            sources: Vec::new(),
            environment: BTreeMap::new(),
            env_nocache: Vec::new(),
            public: json!({}),
        }
    }

    /// Add a minimal duplicate of `name` and return the load error.
    pub fn element_err(&mut self, name: &str) -> Error {
        let plugin = self.elements.create("stack", &json!({})).expect("plugin");
        self.graph
            .add_element(
                ElementDecl {
                    name: name.to_string(),
                    kind: "stack".to_string(),
                    ..ElementDecl::default()
                },
                plugin,
                ElementSources::default(),
                Vec::new(),
            )
            .expect_err("duplicate")
    }

    /// Run the key cascade to a fixpoint over the whole graph.
    pub fn cascade(&mut self) {
        for _ in 0..2 {
            for id in self.graph.ids().collect::<Vec<_>>() {
                self.graph
                    .update_cache_keys(id, self.strict)
                    .expect("cascade");
            }
        }
    }
}

pub(crate) struct TestElementBuilder<'a> {
    t: &'a mut TestGraph,
    name: String,
    kind: String,
    deps: Vec<Dependency>,
    sources: Vec<Source>,
    environment: BTreeMap<String, String>,
    env_nocache: Vec<String>,
    public: Value,
}

impl<'a> TestElementBuilder<'a> {
    pub fn kind(mut self, kind: &str) -> Self {
        self.kind = kind.to_string();
        self
    }

    pub fn source(mut self, key: &str) -> Self {
        self.sources.push(Source::new(
            "test",
            json!({}),
            Some(json!(key)),
            Box::new(TestSource {
                key: Some(key.to_string()),
            }),
        ));
        self
    }

    pub fn unresolved_source(mut self) -> Self {
        self.sources.push(Source::new(
            "test",
            json!({}),
            None,
            Box::new(TestSource { key: None }),
        ));
        self
    }

    pub fn dep(mut self, id: ElementId, dep_kind: DepKind, strict: bool) -> Self {
        self.deps.push(Dependency {
            id,
            dep_kind,
            strict,
        });
        self
    }

    pub fn env(mut self, key: &str, value: &str) -> Self {
        self.environment.insert(key.to_string(), value.to_string());
        self
    }

    pub fn env_nocache(mut self, key: &str) -> Self {
        self.env_nocache.push(key.to_string());
        self
    }

    #[allow(dead_code)]
    pub fn public(mut self, public: Value) -> Self {
        self.public = public;
        self
    }

    pub fn add(self) -> ElementId {
        let plugin = self
            .t
            .elements
            .create(&self.kind, &json!({}))
            .expect("plugin");
        self.t
            .graph
            .add_element(
                ElementDecl {
                    name: self.name,
                    kind: self.kind,
                    environment: self.environment,
                    env_nocache: self.env_nocache,
                    public: self.public,
                    ..ElementDecl::default()
                },
                plugin,
                ElementSources::new(self.sources),
                self.deps,
            )
            .expect("add element")
    }
}
