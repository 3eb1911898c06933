//! Project file loading: the contract with the (out-of-core) front-end.
//!
//! The YAML front-end, include expansion and option resolution live outside
//! the core; what the core consumes is a frozen element graph. This module
//! loads that graph from a TOML project description, instantiates plugins,
//! wires typed dependency edges, and rejects declared cycles.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;

use serde::Deserialize;
use serde_json::{Value, json};

use kiln_types::{DepKind, Error, ErrorKind, Result};

use crate::context::Context;
use crate::element::{Dependency, ElementDecl, ElementId, Graph};
use crate::sandbox::SandboxConfig;
use crate::source::{ElementSources, Source};

/// Default project file name.
pub const PROJECT_FILE: &str = "project.toml";

#[derive(Debug, Deserialize)]
struct ProjectFile {
    name: String,
    #[serde(default, rename = "fatal-warnings")]
    fatal_warnings: Vec<String>,
    /// Base environment every element starts from.
    #[serde(default)]
    environment: BTreeMap<String, String>,
    #[serde(default)]
    sandbox: Option<SandboxConfig>,
    #[serde(default)]
    elements: BTreeMap<String, ElementEntry>,
}

#[derive(Debug, Deserialize)]
struct SourceEntry {
    kind: String,
    #[serde(default)]
    config: Option<toml::Table>,
    #[serde(default, rename = "ref")]
    source_ref: Option<toml::Value>,
}

#[derive(Debug, Deserialize)]
struct ElementEntry {
    kind: String,
    #[serde(default)]
    config: Option<toml::Table>,
    #[serde(default)]
    sources: Vec<SourceEntry>,
    #[serde(default, rename = "build-depends")]
    build_depends: Vec<String>,
    #[serde(default, rename = "runtime-depends")]
    runtime_depends: Vec<String>,
    #[serde(default)]
    depends: Vec<String>,
    #[serde(default, rename = "strict-depends")]
    strict_depends: Vec<String>,
    #[serde(default)]
    variables: BTreeMap<String, String>,
    #[serde(default)]
    environment: BTreeMap<String, String>,
    #[serde(default, rename = "environment-nocache")]
    env_nocache: Vec<String>,
    #[serde(default)]
    public: Option<toml::Table>,
    #[serde(default)]
    workspaced: bool,
}

/// A loaded project: its name and the frozen element graph.
pub struct LoadedProject {
    pub name: String,
    pub graph: Graph,
}

/// Environment every element inherits unless overridden.
fn base_environment() -> BTreeMap<String, String> {
    BTreeMap::from([
        ("PATH".to_string(), "/usr/bin:/bin:/usr/sbin:/sbin".to_string()),
        ("SHELL".to_string(), "/bin/sh".to_string()),
        ("TERM".to_string(), "dumb".to_string()),
    ])
}

fn to_json(value: &toml::Table) -> Result<Value> {
    serde_json::to_value(value).map_err(|e| {
        Error::new(
            ErrorKind::Load,
            "invalid-config",
            format!("unrepresentable configuration: {}", e),
        )
    })
}

/// Load a project file and build the element graph.
pub fn load_project(ctx: &Context, path: &Path) -> Result<LoadedProject> {
    let content = fs::read_to_string(path).map_err(|e| {
        Error::io(
            ErrorKind::Load,
            format!("failed to read project file {}", path.display()),
            &e,
        )
    })?;
    let file: ProjectFile = toml::from_str(&content).map_err(|e| {
        Error::new(
            ErrorKind::Load,
            "invalid-project",
            format!("invalid project file {}: {}", path.display(), e),
        )
    })?;
    let base_dir = path.parent().unwrap_or(Path::new(".")).to_path_buf();

    let mut graph = Graph::new();
    let mut visiting = BTreeSet::new();
    let names: Vec<String> = file.elements.keys().cloned().collect();
    for name in names {
        load_element(ctx, &file, &base_dir, &name, &mut graph, &mut visiting)?;
    }

    Ok(LoadedProject {
        name: file.name,
        graph,
    })
}

fn load_element(
    ctx: &Context,
    file: &ProjectFile,
    base_dir: &Path,
    name: &str,
    graph: &mut Graph,
    visiting: &mut BTreeSet<String>,
) -> Result<ElementId> {
    if let Some(id) = graph.lookup(name) {
        return Ok(id);
    }
    if !visiting.insert(name.to_string()) {
        return Err(Error::new(
            ErrorKind::Load,
            "circular-dependency",
            format!("circular dependency through element '{}'", name),
        ));
    }

    let entry = file.elements.get(name).ok_or_else(|| {
        Error::new(
            ErrorKind::Load,
            "unknown-element",
            format!("element '{}' is not declared in the project", name),
        )
    })?;

    // Dependencies first; the graph only accepts edges to known elements.
    let mut dependencies = Vec::new();
    for (names, dep_kind) in [
        (&entry.build_depends, DepKind::Build),
        (&entry.depends, DepKind::All),
        (&entry.runtime_depends, DepKind::Runtime),
    ] {
        for dep_name in names {
            let id = load_element(ctx, file, base_dir, dep_name, graph, visiting)?;
            dependencies.push(Dependency {
                id,
                dep_kind,
                strict: entry.strict_depends.contains(dep_name),
            });
        }
    }

    let config = match &entry.config {
        Some(table) => to_json(table)?,
        None => json!({}),
    };
    let public = match &entry.public {
        Some(table) => to_json(table)?,
        None => json!({}),
    };

    let plugin = ctx.element_kinds.create(&entry.kind, &config)?;

    let mut sources = Vec::new();
    for (index, source) in entry.sources.iter().enumerate() {
        let source_config = match &source.config {
            Some(table) => to_json(table)?,
            None => json!({}),
        };
        let source_ref = match &source.source_ref {
            Some(value) => Some(serde_json::to_value(value).map_err(|e| {
                Error::new(
                    ErrorKind::Load,
                    "invalid-ref",
                    format!("unrepresentable ref on '{}': {}", name, e),
                )
            })?),
            None => None,
        };
        let plugin = ctx.source_kinds.create(
            &source.kind,
            &source_config,
            source_ref.clone(),
            base_dir,
        )?;
        let source = Source::new(source.kind.clone(), source_config, source_ref, plugin);
        if source.ref_is_redundant() {
            ctx.record_redundant_ref(
                &format!("{} [source {}]", name, index),
                source.source_ref.clone().unwrap_or(Value::Null),
            );
        }
        sources.push(source);
    }

    let mut environment = base_environment();
    environment.extend(file.environment.clone());
    environment.extend(entry.environment.clone());

    let decl = ElementDecl {
        project: file.name.clone(),
        name: name.to_string(),
        kind: entry.kind.clone(),
        config,
        variables: entry.variables.clone(),
        environment,
        env_nocache: entry.env_nocache.clone(),
        public,
        sandbox: file.sandbox.clone().unwrap_or_default(),
        fatal_warnings: file.fatal_warnings.clone(),
        was_workspaced: entry.workspaced,
    };

    let id = graph.add_element(decl, plugin, ElementSources::new(sources), dependencies)?;
    visiting.remove(name);
    Ok(id)
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use crate::config::UserConfig;

    use super::*;

    fn context(root: &Path) -> Context {
        Context::new(UserConfig {
            cachedir: Some(root.join("cache")),
            ..UserConfig::default()
        })
        .expect("context")
    }

    fn write_project(root: &Path, content: &str) -> std::path::PathBuf {
        let path = root.join(PROJECT_FILE);
        fs::write(&path, content).expect("write");
        path
    }

    #[test]
    fn loads_elements_with_typed_dependencies() {
        let td = tempdir().expect("tempdir");
        fs::create_dir_all(td.path().join("files/lib")).expect("mkdir");
        fs::write(td.path().join("files/lib/lib.c"), "int x;").expect("write");

        let path = write_project(
            td.path(),
            r#"
name = "demo"

[elements.lib]
kind = "manual"
sources = [{ kind = "local", config = { path = "files/lib" } }]

[elements.app]
kind = "stack"
build-depends = ["lib"]
"#,
        );

        let ctx = context(td.path());
        let project = load_project(&ctx, &path).expect("load");
        assert_eq!(project.name, "demo");
        assert_eq!(project.graph.len(), 2);

        let app = project.graph.lookup("app").expect("app");
        let deps: Vec<_> = project.graph.get(app).direct_build_deps().collect();
        assert_eq!(deps.len(), 1);
        assert_eq!(project.graph.get(deps[0]).decl.name, "lib");
    }

    #[test]
    fn rejects_dependency_cycles() {
        let td = tempdir().expect("tempdir");
        let path = write_project(
            td.path(),
            r#"
name = "demo"

[elements.a]
kind = "stack"
build-depends = ["b"]

[elements.b]
kind = "stack"
build-depends = ["a"]
"#,
        );

        let ctx = context(td.path());
        let err = match load_project(&ctx, &path) {
            Err(err) => err,
            Ok(_) => panic!("cycle"),
        };
        assert_eq!(err.reason, "circular-dependency");
    }

    #[test]
    fn rejects_unknown_dependencies() {
        let td = tempdir().expect("tempdir");
        let path = write_project(
            td.path(),
            r#"
name = "demo"

[elements.app]
kind = "stack"
build-depends = ["ghost"]
"#,
        );

        let ctx = context(td.path());
        let err = match load_project(&ctx, &path) {
            Err(err) => err,
            Ok(_) => panic!("unknown"),
        };
        assert_eq!(err.reason, "unknown-element");
    }

    #[test]
    fn strict_depends_mark_edges_strict() {
        let td = tempdir().expect("tempdir");
        let path = write_project(
            td.path(),
            r#"
name = "demo"

[elements.lib]
kind = "stack"

[elements.app]
kind = "stack"
build-depends = ["lib"]
strict-depends = ["lib"]
"#,
        );

        let ctx = context(td.path());
        let project = load_project(&ctx, &path).expect("load");
        let app = project.graph.lookup("app").expect("app");
        let lib = project.graph.lookup("lib").expect("lib");
        assert!(project.graph.get(app).strict_dep_ids.contains(&lib));
    }

    #[test]
    fn redundant_refs_are_recorded() {
        let td = tempdir().expect("tempdir");
        fs::create_dir_all(td.path().join("files/src")).expect("mkdir");

        let path = write_project(
            td.path(),
            r#"
name = "demo"

[elements.app]
kind = "manual"
sources = [{ kind = "local", config = { path = "files/src" }, ref = "abcdef" }]
"#,
        );

        let ctx = context(td.path());
        load_project(&ctx, &path).expect("load");
        let refs = ctx.redundant_refs.lock().expect("lock");
        assert_eq!(refs.len(), 1);
        assert!(refs[0].0.starts_with("app"));
    }

    #[test]
    fn element_environment_layers_over_project_defaults() {
        let td = tempdir().expect("tempdir");
        let path = write_project(
            td.path(),
            r#"
name = "demo"

[environment]
LANG = "C"

[elements.app]
kind = "stack"
environment = { LANG = "C.UTF-8", EXTRA = "1" }
"#,
        );

        let ctx = context(td.path());
        let project = load_project(&ctx, &path).expect("load");
        let app = project.graph.lookup("app").expect("app");
        let env = &project.graph.get(app).decl.environment;
        assert_eq!(env.get("LANG").map(String::as_str), Some("C.UTF-8"));
        assert_eq!(env.get("EXTRA").map(String::as_str), Some("1"));
        assert!(env.contains_key("PATH"));
    }

    #[test]
    fn malformed_project_is_a_load_error() {
        let td = tempdir().expect("tempdir");
        let path = write_project(td.path(), "name = [broken");

        let ctx = context(td.path());
        let err = match load_project(&ctx, &path) {
            Err(err) => err,
            Ok(_) => panic!("malformed"),
        };
        assert_eq!(err.reason, "invalid-project");
    }
}
