//! The element graph: immutable declarations, mutable session state, and
//! the cache-key algebra.
//!
//! Elements live in a typed arena for the whole session and reference each
//! other by [`ElementId`]. Reverse dependencies are kept as id sets so
//! "dependency became cached" notifications fan out cheaply.
//!
//! Three keys are computed per element:
//!
//! - **weak** — stable under *content* changes of build dependencies: each
//!   build-scope dependency contributes `(project, name)` only, unless the
//!   edge is strict or the plugin demands strict rebuilds, in which case the
//!   dependency's own weak key is included.
//! - **strict** — changes when any build dependency changes: each
//!   contributes `(project, name, strict_key)`, chained with the weak key.
//! - **strong** — equals strict in strict mode; in non-strict mode adopted
//!   from a pulled artifact or computed from dependency strong keys once the
//!   element is scheduled to build.
//!
//! Keys are monotone per session: once set they never change. The update
//! routines form a cascade where each step only adds known state, so cycles
//! are structurally impossible.

use std::collections::{BTreeMap, BTreeSet};

use serde_json::{Value, json};

use kiln_types::{DepKind, Error, ErrorKind, Result, Scope, SourceRef};

use crate::artifact::{Artifact, CORE_ARTIFACT_VERSION};
use crate::planner;
use crate::plugin::{ElementPlugin, SourceRegistry};
use crate::sandbox::SandboxConfig;
use crate::source::{ElementSources, Source};

/// Arena index of one element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ElementId(pub u32);

impl ElementId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// A typed dependency edge.
#[derive(Debug, Clone, Copy)]
pub struct Dependency {
    pub id: ElementId,
    pub dep_kind: DepKind,
    /// Strict edges force rebuilds on dependency change even in non-strict
    /// mode.
    pub strict: bool,
}

/// The immutable declaration of one element.
#[derive(Debug, Clone)]
pub struct ElementDecl {
    pub project: String,
    pub name: String,
    pub kind: String,
    pub config: Value,
    pub variables: BTreeMap<String, String>,
    pub environment: BTreeMap<String, String>,
    pub env_nocache: Vec<String>,
    pub public: Value,
    pub sandbox: SandboxConfig,
    pub fatal_warnings: Vec<String>,
    pub was_workspaced: bool,
}

impl Default for ElementDecl {
    fn default() -> Self {
        Self {
            project: "project".to_string(),
            name: String::new(),
            kind: String::new(),
            config: json!({}),
            variables: BTreeMap::new(),
            environment: BTreeMap::new(),
            env_nocache: Vec::new(),
            public: json!({}),
            sandbox: SandboxConfig::default(),
            fatal_warnings: Vec::new(),
            was_workspaced: false,
        }
    }
}

/// Externally computed view of an element's position in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementState {
    /// A source is not resolved.
    NoReference,
    /// Keys not yet computable, or cache not yet queried.
    Waiting,
    /// A subproject link; never built.
    Junction,
    /// Cached artifact recording a failed build.
    Failed,
    /// Artifact present locally and complete.
    Cached,
    /// Sources not cached and no pull pending.
    FetchNeeded,
    /// All build deps cached, sources cached, not pulling.
    Buildable,
}

/// One element: declaration plus per-session mutable state.
pub struct Element {
    pub id: ElementId,
    pub decl: ElementDecl,
    pub plugin: Box<dyn ElementPlugin>,
    pub sources: ElementSources,
    /// Dependency edges in declaration order.
    pub dependencies: Vec<Dependency>,
    /// Direct build deps declared strict.
    pub strict_dep_ids: BTreeSet<ElementId>,
    pub reverse_build: BTreeSet<ElementId>,
    pub reverse_runtime: BTreeSet<ElementId>,

    // -- session state, owned by the control thread --
    pub source_unique_key: Option<Value>,
    pub source_key: Option<String>,
    pub weak_key: Option<String>,
    pub strict_key: Option<String>,
    pub strong_key: Option<String>,
    cache_key_dict: Option<Value>,

    /// `None` until the cache was queried for this element.
    pub cached: Option<bool>,
    pub artifact: Option<Artifact>,
    pub sources_cached: bool,
    pub pull_pending: bool,
    pub required: bool,
    pub assemble_scheduled: bool,
    pub assemble_done: bool,
    pub tracking_requested: bool,
}

impl Element {
    pub fn full_name(&self) -> String {
        format!("{}/{}", self.decl.project, self.decl.name)
    }

    /// Direct build dependency ids, declaration order.
    pub fn direct_build_deps(&self) -> impl Iterator<Item = ElementId> + '_ {
        self.dependencies
            .iter()
            .filter(|d| d.dep_kind.is_build())
            .map(|d| d.id)
    }

    /// Direct runtime dependency ids, declaration order.
    pub fn direct_runtime_deps(&self) -> impl Iterator<Item = ElementId> + '_ {
        self.dependencies
            .iter()
            .filter(|d| d.dep_kind.is_runtime())
            .map(|d| d.id)
    }

    pub fn cached_success(&self) -> bool {
        self.cached == Some(true)
            && self.artifact.as_ref().map(|a| a.build_success).unwrap_or(false)
    }

    pub fn cached_failure(&self) -> bool {
        self.cached == Some(true)
            && self.artifact.as_ref().map(|a| !a.build_success).unwrap_or(false)
    }

    /// Keys are computable and the cache can be queried.
    pub fn can_query_cache(&self) -> bool {
        self.strict_key.is_some()
    }

    /// Short display form of the most specific known key.
    pub fn display_key(&self) -> String {
        let key = self
            .strong_key
            .as_deref()
            .or(self.strict_key.as_deref())
            .or(self.weak_key.as_deref())
            .unwrap_or("--------");
        key.chars().take(8).collect()
    }
}

/// The session-long element arena.
#[derive(Default)]
pub struct Graph {
    elements: Vec<Element>,
    by_name: BTreeMap<String, ElementId>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = ElementId> + '_ {
        (0..self.elements.len() as u32).map(ElementId)
    }

    pub fn get(&self, id: ElementId) -> &Element {
        &self.elements[id.index()]
    }

    pub fn get_mut(&mut self, id: ElementId) -> &mut Element {
        &mut self.elements[id.index()]
    }

    pub fn lookup(&self, name: &str) -> Option<ElementId> {
        self.by_name.get(name).copied()
    }

    /// Add an element. Dependencies must already be in the graph, which
    /// makes declared cycles unrepresentable.
    pub fn add_element(
        &mut self,
        decl: ElementDecl,
        plugin: Box<dyn ElementPlugin>,
        sources: ElementSources,
        dependencies: Vec<Dependency>,
    ) -> Result<ElementId> {
        if self.by_name.contains_key(&decl.name) {
            return Err(Error::new(
                ErrorKind::Load,
                "duplicate-element",
                format!("element '{}' declared twice", decl.name),
            ));
        }
        let id = ElementId(self.elements.len() as u32);
        for dep in &dependencies {
            if dep.id.index() >= self.elements.len() {
                return Err(Error::new(
                    ErrorKind::Load,
                    "invalid-dependency",
                    format!("element '{}' depends on an unknown element", decl.name),
                ));
            }
        }

        let strict_dep_ids = dependencies
            .iter()
            .filter(|d| d.strict && d.dep_kind.is_build())
            .map(|d| d.id)
            .collect();

        for dep in &dependencies {
            if dep.dep_kind.is_build() {
                self.elements[dep.id.index()].reverse_build.insert(id);
            }
            if dep.dep_kind.is_runtime() {
                self.elements[dep.id.index()].reverse_runtime.insert(id);
            }
        }

        self.by_name.insert(decl.name.clone(), id);
        self.elements.push(Element {
            id,
            decl,
            plugin,
            sources,
            dependencies,
            strict_dep_ids,
            reverse_build: BTreeSet::new(),
            reverse_runtime: BTreeSet::new(),
            source_unique_key: None,
            source_key: None,
            weak_key: None,
            strict_key: None,
            strong_key: None,
            cache_key_dict: None,
            cached: None,
            artifact: None,
            sources_cached: false,
            pull_pending: false,
            required: false,
            assemble_scheduled: false,
            assemble_done: false,
            tracking_requested: false,
        });
        Ok(id)
    }

    // -- state machine ------------------------------------------------------

    pub fn state(&self, id: ElementId) -> ElementState {
        let e = self.get(id);
        if !e.sources.is_resolved() {
            return ElementState::NoReference;
        }
        if e.plugin.is_junction() {
            return ElementState::Junction;
        }
        if e.strict_key.is_none() || e.cached.is_none() {
            return ElementState::Waiting;
        }
        if e.cached_failure() {
            return ElementState::Failed;
        }
        if e.cached == Some(true) {
            return ElementState::Cached;
        }
        if !e.sources_cached && !e.pull_pending {
            return ElementState::FetchNeeded;
        }
        if e.pull_pending {
            return ElementState::Waiting;
        }
        let deps_ready = planner::dependencies(self, &[id], Scope::Build)
            .into_iter()
            .all(|dep| self.get(dep).cached_success());
        if deps_ready && e.sources_cached {
            return ElementState::Buildable;
        }
        ElementState::Waiting
    }

    /// An element is scheduled for assembly iff it is required, not already
    /// scheduled or done, its artifact state is determined, no pull is
    /// pending, and it is not already cached successfully.
    pub fn should_schedule_assemble(&self, id: ElementId) -> bool {
        let e = self.get(id);
        e.required
            && !e.assemble_scheduled
            && !e.assemble_done
            && e.cached.is_some()
            && !e.pull_pending
            && !e.cached_success()
            && !e.cached_failure()
            && !e.plugin.is_junction()
    }

    /// Mark `id` and its RUN-scope closure required.
    pub fn mark_required(&mut self, id: ElementId) {
        for dep in planner::dependencies(self, &[id], Scope::Run) {
            self.get_mut(dep).required = true;
        }
    }

    /// Mark the BUILD-scope closure of `id` required; called when `id` is
    /// scheduled for assembly.
    pub fn mark_build_deps_required(&mut self, id: ElementId) {
        for dep in planner::dependencies(self, &[id], Scope::Build) {
            self.get_mut(dep).required = true;
        }
    }

    // -- key computation ----------------------------------------------------

    /// Compute the composite source key once all sources are resolved.
    /// No-op when already computed or still unresolved.
    pub fn update_source_state(&mut self, id: ElementId) -> Result<()> {
        if self.get(id).source_unique_key.is_some() {
            return Ok(());
        }
        let e = self.get(id);
        let Some(unique) = e.sources.unique_key()? else {
            return Ok(());
        };
        let key = kiln_keys::generate_key(&unique);
        let e = self.get_mut(id);
        e.source_unique_key = Some(unique);
        e.source_key = Some(key);
        Ok(())
    }

    /// Update weak and strict cache keys; in strict mode also the strong
    /// key. Runs to whatever point its inputs allow and is safe to call
    /// repeatedly: keys are only ever computed once.
    pub fn update_cache_keys(&mut self, id: ElementId, strict_mode: bool) -> Result<()> {
        if self.get(id).strict_key.is_some() {
            return Ok(());
        }
        if !self.get(id).sources.is_resolved() {
            // Tracking may still be pending.
            return Ok(());
        }
        self.update_source_state(id)?;

        let build_scope = planner::dependencies(self, &[id], Scope::Build);

        if self.get(id).weak_key.is_none() {
            // Weak keys encode the names of build dependencies, so only the
            // shape of the graph triggers rebuilds. Strict edges (and
            // strict-rebuild plugins) encode the dependency's weak key
            // instead of its name.
            let strict_rebuild = self.get(id).plugin.strict_rebuild();
            let mut deps_json = Vec::with_capacity(build_scope.len());
            for dep_id in &build_scope {
                let dep = self.get(*dep_id);
                if strict_rebuild || self.get(id).strict_dep_ids.contains(dep_id) {
                    match &dep.weak_key {
                        Some(weak) => {
                            deps_json.push(json!([dep.decl.project, dep.decl.name, weak]))
                        }
                        None => return Ok(()),
                    }
                } else {
                    deps_json.push(json!([dep.decl.project, dep.decl.name]));
                }
            }
            let Some(weak) = self.calculate_cache_key(id, Value::Array(deps_json), None)? else {
                return Ok(());
            };
            self.get_mut(id).weak_key = Some(weak);
        }

        let mut deps_json = Vec::with_capacity(build_scope.len());
        for dep_id in &build_scope {
            let dep = self.get(*dep_id);
            match &dep.strict_key {
                Some(strict) => deps_json.push(json!([dep.decl.project, dep.decl.name, strict])),
                // A build dependency has no cache key yet.
                None => return Ok(()),
            }
        }
        let weak = self
            .get(id)
            .weak_key
            .clone()
            .ok_or_else(|| missing_key_inputs(self.get(id)))?;
        let Some(strict) = self.calculate_cache_key(id, Value::Array(deps_json), Some(&weak))?
        else {
            return Ok(());
        };
        let e = self.get_mut(id);
        e.strict_key = Some(strict.clone());
        if strict_mode {
            // In strict mode the strong cache key always matches the strict
            // cache key.
            e.strong_key = Some(strict);
        }
        Ok(())
    }

    /// In non-strict mode, set the strong key once it becomes knowable:
    /// from the artifact after a pull, or from dependency strong keys once
    /// this element will definitely be built.
    pub fn update_cache_key_non_strict(&mut self, id: ElementId) -> Result<()> {
        if self.get(id).strong_key.is_some() {
            return Ok(());
        }
        if self.get(id).pull_pending {
            // Effective strong cache key is unknown until after the pull.
            return Ok(());
        }

        if self.get(id).cached == Some(true) {
            let strong = self
                .get(id)
                .artifact
                .as_ref()
                .map(|a| a.strong_key.clone())
                .ok_or_else(|| missing_key_inputs(self.get(id)))?;
            self.get_mut(id).strong_key = Some(strong);
            return Ok(());
        }

        let e = self.get(id);
        if !(e.assemble_scheduled || e.assemble_done) {
            return Ok(());
        }
        let weak = e.weak_key.clone().ok_or_else(|| missing_key_inputs(e))?;

        let build_scope = planner::dependencies(self, &[id], Scope::Build);
        let mut deps_json = Vec::with_capacity(build_scope.len());
        for dep_id in &build_scope {
            let dep = self.get(*dep_id);
            match &dep.strong_key {
                Some(strong) => deps_json.push(json!([dep.decl.project, dep.decl.name, strong])),
                None => return Ok(()),
            }
        }
        if let Some(strong) = self.calculate_cache_key(id, Value::Array(deps_json), Some(&weak))? {
            self.get_mut(id).strong_key = Some(strong);
        }
        Ok(())
    }

    fn calculate_cache_key(
        &mut self,
        id: ElementId,
        dependencies: Value,
        weak_cache_key: Option<&str>,
    ) -> Result<Option<String>> {
        let Some(mut dict) = self.ensure_cache_key_dict(id)? else {
            return Ok(None);
        };
        let map = dict.as_object_mut().ok_or_else(|| missing_key_inputs(self.get(id)))?;
        map.insert("dependencies".to_string(), dependencies);
        if let Some(weak) = weak_cache_key {
            map.insert("weak-cache-key".to_string(), json!(weak));
        }
        Ok(Some(kiln_keys::generate_key(&dict)))
    }

    /// The memoized base of every key for this element: configuration
    /// fingerprint, plugin identity, public data, sources, warnings, and —
    /// when commands run — sandbox config and the cacheable environment.
    fn ensure_cache_key_dict(&mut self, id: ElementId) -> Result<Option<Value>> {
        if let Some(dict) = &self.get(id).cache_key_dict {
            return Ok(Some(dict.clone()));
        }
        let e = self.get(id);
        let Some(sources_key) = e.source_unique_key.clone() else {
            return Ok(None);
        };

        let mut fatal_warnings = e.decl.fatal_warnings.clone();
        fatal_warnings.sort();

        let mut dict = json!({
            "core-artifact-version": CORE_ARTIFACT_VERSION,
            "element-plugin-key": e.plugin.get_unique_key(),
            "element-plugin-name": e.decl.kind,
            "element-plugin-version": e.plugin.version(),
            "public": e.decl.public,
            "sources": sources_key,
            "fatal-warnings": fatal_warnings,
        });

        if e.plugin.run_commands() {
            let cache_env: BTreeMap<&String, &String> = e
                .decl
                .environment
                .iter()
                .filter(|(k, _)| !e.decl.env_nocache.contains(k))
                .collect();
            let map = dict.as_object_mut().ok_or_else(|| missing_key_inputs(e))?;
            map.insert("sandbox".to_string(), e.decl.sandbox.to_key());
            map.insert(
                "environment".to_string(),
                serde_json::to_value(&cache_env).map_err(|err| {
                    Error::new(
                        ErrorKind::CacheKey,
                        "encode-failed",
                        format!("environment not encodable: {}", err),
                    )
                })?,
            );
        }

        self.get_mut(id).cache_key_dict = Some(dict.clone());
        Ok(Some(dict))
    }

    /// Replace one source's ref after tracking. Only legal before keys were
    /// computed; the key cascade picks the new ref up on its next run.
    pub fn set_source_ref(
        &mut self,
        id: ElementId,
        source_index: usize,
        new_ref: SourceRef,
        registry: &SourceRegistry,
        base_dir: &std::path::Path,
    ) -> Result<()> {
        if self.get(id).strict_key.is_some() {
            return Err(Error::new(
                ErrorKind::CacheKey,
                "keys-already-computed",
                format!(
                    "cannot change source ref of '{}' after cache keys were computed",
                    self.get(id).decl.name
                ),
            ));
        }
        let e = self.get(id);
        let source = e.sources.sources.get(source_index).ok_or_else(|| {
            Error::new(
                ErrorKind::Load,
                "invalid-source-index",
                format!("element '{}' has no source #{}", e.decl.name, source_index),
            )
        })?;
        let plugin = registry.create(&source.kind, &source.config, Some(new_ref.clone()), base_dir)?;
        let kind = source.kind.clone();
        let config = source.config.clone();

        let e = self.get_mut(id);
        e.sources.sources[source_index] = Source::new(kind, config, Some(new_ref), plugin);
        e.source_unique_key = None;
        e.source_key = None;
        e.cache_key_dict = None;
        Ok(())
    }
}

fn missing_key_inputs(e: &Element) -> Error {
    Error::new(
        ErrorKind::CacheKey,
        "missing-inputs",
        format!("cache key inputs not ready for '{}'", e.decl.name),
    )
}

#[cfg(test)]
mod tests {
    use kiln_types::DepKind;

    use crate::testutil::TestGraph;

    use super::*;

    #[test]
    fn unresolved_source_yields_no_reference_and_no_key() {
        let mut t = TestGraph::new(true);
        let e = t.element("app").unresolved_source().add();

        t.cascade();
        assert_eq!(t.graph.state(e), ElementState::NoReference);
        assert_eq!(t.graph.get(e).strict_key, None);
        assert_eq!(t.graph.get(e).source_key, None);
    }

    #[test]
    fn keys_compute_bottom_up() {
        let mut t = TestGraph::new(true);
        let lib = t.element("lib").source("lib-v1").add();
        let app = t
            .element("app")
            .source("app-v1")
            .dep(lib, DepKind::Build, false)
            .add();

        t.cascade();
        assert!(t.graph.get(lib).strict_key.is_some());
        assert!(t.graph.get(app).strict_key.is_some());
        // Strict mode: strong == strict.
        assert_eq!(
            t.graph.get(app).strong_key,
            t.graph.get(app).strict_key
        );
    }

    #[test]
    fn keys_are_deterministic_across_sessions() {
        let build = || {
            let mut t = TestGraph::new(true);
            let lib = t.element("lib").source("lib-v1").add();
            let app = t
                .element("app")
                .source("app-v1")
                .dep(lib, DepKind::Build, false)
                .add();
            t.cascade();
            (
                t.graph.get(lib).strict_key.clone().expect("lib key"),
                t.graph.get(app).strict_key.clone().expect("app key"),
            )
        };
        assert_eq!(build(), build());
    }

    #[test]
    fn dep_content_change_moves_strict_but_not_weak() {
        let run = |lib_src: &str| {
            let mut t = TestGraph::new(true);
            let lib = t.element("lib").source(lib_src).add();
            let app = t
                .element("app")
                .source("app-v1")
                .dep(lib, DepKind::Build, false)
                .add();
            t.cascade();
            (
                t.graph.get(app).weak_key.clone().expect("weak"),
                t.graph.get(app).strict_key.clone().expect("strict"),
            )
        };

        let (weak_a, strict_a) = run("lib-v1");
        let (weak_b, strict_b) = run("lib-v2");
        assert_eq!(weak_a, weak_b);
        assert_ne!(strict_a, strict_b);
    }

    #[test]
    fn strict_edge_moves_the_weak_key_too() {
        let run = |lib_src: &str| {
            let mut t = TestGraph::new(true);
            let lib = t.element("lib").source(lib_src).add();
            let app = t
                .element("app")
                .source("app-v1")
                .dep(lib, DepKind::Build, true)
                .add();
            t.cascade();
            t.graph.get(app).weak_key.clone().expect("weak")
        };

        assert_ne!(run("lib-v1"), run("lib-v2"));
    }

    #[test]
    fn adding_a_dependency_moves_the_weak_key() {
        let mut one = TestGraph::new(true);
        let lib = one.element("lib").source("lib-v1").add();
        let app1 = one
            .element("app")
            .source("app-v1")
            .dep(lib, DepKind::Build, false)
            .add();
        one.cascade();

        let mut two = TestGraph::new(true);
        let lib2 = two.element("lib").source("lib-v1").add();
        let extra = two.element("extra").source("extra-v1").add();
        let app2 = two
            .element("app")
            .source("app-v1")
            .dep(lib2, DepKind::Build, false)
            .dep(extra, DepKind::Build, false)
            .add();
        two.cascade();

        assert_ne!(one.graph.get(app1).weak_key, two.graph.get(app2).weak_key);
    }

    #[test]
    fn strict_key_is_set_at_most_once() {
        let mut t = TestGraph::new(true);
        let e = t.element("app").source("v1").add();
        t.cascade();

        let first = t.graph.get(e).strict_key.clone().expect("key");
        // Re-running the cascade is a no-op.
        t.cascade();
        assert_eq!(t.graph.get(e).strict_key.as_ref(), Some(&first));
    }

    #[test]
    fn ref_change_after_keys_is_rejected() {
        let mut t = TestGraph::new(true);
        let e = t.element("app").source("v1").add();
        t.cascade();

        let registry = SourceRegistry::with_builtins();
        let err = t
            .graph
            .set_source_ref(e, 0, json!("v2"), &registry, std::path::Path::new("."))
            .expect_err("too late");
        assert_eq!(err.reason, "keys-already-computed");
    }

    #[test]
    fn non_strict_strong_key_waits_for_schedule() {
        let mut t = TestGraph::new(false);
        let lib = t.element("lib").source("lib-v1").add();
        let app = t
            .element("app")
            .source("app-v1")
            .dep(lib, DepKind::Build, false)
            .add();
        t.cascade();

        assert!(t.graph.get(app).strict_key.is_some());
        assert_eq!(t.graph.get(app).strong_key, None);

        // Once both are scheduled to build, strong keys resolve bottom-up.
        t.graph.get_mut(lib).assemble_scheduled = true;
        t.graph.get_mut(app).assemble_scheduled = true;
        t.graph.update_cache_key_non_strict(lib).expect("lib strong");
        t.graph.update_cache_key_non_strict(app).expect("app strong");
        assert!(t.graph.get(lib).strong_key.is_some());
        assert!(t.graph.get(app).strong_key.is_some());
    }

    #[test]
    fn environment_nocache_names_do_not_affect_keys() {
        let run = |noise: &str| {
            let mut t = TestGraph::new(true);
            let e = t
                .element("app")
                .source("v1")
                .env("PATH", "/usr/bin")
                .env("BUILD_ID", noise)
                .env_nocache("BUILD_ID")
                .add();
            t.cascade();
            t.graph.get(e).strict_key.clone().expect("key")
        };
        assert_eq!(run("20260801"), run("20260802"));
    }

    #[test]
    fn junctions_report_their_own_state() {
        let mut t = TestGraph::new(true);
        let junction = t.element("subproject").kind("junction").source("v1").add();
        t.cascade();
        assert_eq!(t.graph.state(junction), ElementState::Junction);
    }

    #[test]
    fn duplicate_element_names_are_load_errors() {
        let mut t = TestGraph::new(true);
        t.element("same").source("v1").add();
        let err = t.element_err("same");
        assert_eq!(err.reason, "duplicate-element");
    }

    #[test]
    fn required_propagates_through_run_scope() {
        let mut t = TestGraph::new(true);
        let runtime = t.element("runtime").source("v1").add();
        let buildtool = t.element("buildtool").source("v1").add();
        let app = t
            .element("app")
            .source("v1")
            .dep(runtime, DepKind::Runtime, false)
            .dep(buildtool, DepKind::Build, false)
            .add();

        t.graph.mark_required(app);
        assert!(t.graph.get(app).required);
        assert!(t.graph.get(runtime).required);
        // Build deps only become required once assembly is scheduled.
        assert!(!t.graph.get(buildtool).required);

        t.graph.mark_build_deps_required(app);
        assert!(t.graph.get(buildtool).required);
    }

    #[test]
    fn display_key_abbreviates() {
        let mut t = TestGraph::new(true);
        let e = t.element("app").source("v1").add();
        assert_eq!(t.graph.get(e).display_key(), "--------");
        t.cascade();
        assert_eq!(t.graph.get(e).display_key().len(), 8);
    }
}
