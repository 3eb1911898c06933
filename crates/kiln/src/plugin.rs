//! Plugin capability surface: source and element kinds.
//!
//! The full plugin ecosystem (git, tarball, autotools, ...) lives outside
//! the core; what the core defines is the capability contract those plugins
//! satisfy, plus the handful of builtin kinds the orchestrator itself needs:
//! the `local` source and the `manual`, `stack` and `junction` element kinds.
//!
//! Optional capabilities default to a "not supported" domain error, so a
//! plugin only implements what it can honor. Source plugins are immutable
//! once constructed; a tracked ref produces a *new* plugin via the factory
//! rather than mutating the old one.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde_json::{Value, json};

use kiln_types::{Error, ErrorKind, Result, SourceRef};

// ---------------------------------------------------------------------------
// Source plugins
// ---------------------------------------------------------------------------

/// One source plugin instance, bound to its configuration and (if present)
/// its ref.
pub trait SourcePlugin: Send + Sync {
    fn kind(&self) -> &str;

    /// Early validation of the configuration; called once at load.
    fn preflight(&self) -> Result<()> {
        Ok(())
    }

    /// Whether the source is pinned to a concrete version.
    fn is_resolved(&self) -> bool;

    /// The current ref, when one is set.
    fn get_ref(&self) -> Option<SourceRef>;

    /// Whether this source kind consumes a ref at all. Sources that do not
    /// (e.g. `local`) report redundant refs at load.
    fn requires_ref(&self) -> bool {
        true
    }

    /// A deterministic fingerprint of this source's exact content identity.
    /// Only callable once resolved.
    fn get_unique_key(&self) -> Result<Value>;

    /// Ensure the source content is available locally for staging.
    fn fetch(&self) -> Result<()> {
        Err(not_supported(self.kind(), "fetch"))
    }

    /// Whether `track` is implemented.
    fn is_trackable(&self) -> bool {
        false
    }

    /// Query the upstream for a new ref; `None` when nothing was found.
    fn track(&self) -> Result<Option<SourceRef>> {
        Err(not_supported(self.kind(), "track"))
    }

    /// Write the source content into `dest`.
    fn stage(&self, dest: &Path) -> Result<()>;
}

fn not_supported(kind: &str, what: &str) -> Error {
    Error::new(
        ErrorKind::Source,
        "not-supported",
        format!("source kind '{}' does not implement {}", kind, what),
    )
}

pub type SourceFactory = fn(&Value, Option<SourceRef>, &Path) -> Result<Box<dyn SourcePlugin>>;

/// Kind → factory table for source plugins.
#[derive(Default)]
pub struct SourceRegistry {
    kinds: BTreeMap<String, SourceFactory>,
}

impl SourceRegistry {
    pub fn with_builtins() -> Self {
        let mut registry = Self::default();
        registry.register("local", LocalSource::create);
        registry
    }

    pub fn register(&mut self, kind: &str, factory: SourceFactory) {
        self.kinds.insert(kind.to_string(), factory);
    }

    pub fn create(
        &self,
        kind: &str,
        config: &Value,
        source_ref: Option<SourceRef>,
        base_dir: &Path,
    ) -> Result<Box<dyn SourcePlugin>> {
        let factory = self.kinds.get(kind).ok_or_else(|| {
            Error::new(
                ErrorKind::Load,
                "unknown-source-kind",
                format!("no source plugin for kind '{}'", kind),
            )
        })?;
        let plugin = factory(config, source_ref, base_dir)?;
        plugin.preflight()?;
        Ok(plugin)
    }
}

/// The builtin `local` source: a directory inside the project. It has no
/// upstream, so it is always resolved and never needs a ref; its unique key
/// is a content fingerprint of the tree.
pub struct LocalSource {
    path: PathBuf,
}

impl LocalSource {
    fn create(config: &Value, source_ref: Option<SourceRef>, base_dir: &Path) -> Result<Box<dyn SourcePlugin>> {
        let rel = config
            .get("path")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                Error::new(
                    ErrorKind::Load,
                    "invalid-source-config",
                    "local source requires a 'path' setting",
                )
            })?;
        if source_ref.is_some() {
            // Refs on local sources carry no information; the loader records
            // these in the redundant-ref table.
        }
        Ok(Box::new(Self {
            path: base_dir.join(rel),
        }))
    }
}

impl SourcePlugin for LocalSource {
    fn kind(&self) -> &str {
        "local"
    }

    fn preflight(&self) -> Result<()> {
        if !self.path.is_dir() {
            return Err(Error::new(
                ErrorKind::Source,
                "missing-path",
                format!("local source path does not exist: {}", self.path.display()),
            ));
        }
        Ok(())
    }

    fn is_resolved(&self) -> bool {
        true
    }

    fn get_ref(&self) -> Option<SourceRef> {
        None
    }

    fn requires_ref(&self) -> bool {
        false
    }

    fn get_unique_key(&self) -> Result<Value> {
        Ok(json!({ "tree": fingerprint_tree(&self.path)? }))
    }

    fn fetch(&self) -> Result<()> {
        // Content already lives in the project; nothing to transfer.
        Ok(())
    }

    fn stage(&self, dest: &Path) -> Result<()> {
        copy_tree(&self.path, dest)
    }
}

/// Deterministic content fingerprint of a directory: sorted walk over
/// (path, kind, executable bit, content hash).
fn fingerprint_tree(dir: &Path) -> Result<String> {
    let mut entries: Vec<String> = Vec::new();
    fingerprint_into(dir, "", &mut entries)?;
    Ok(kiln_keys::generate_key(&json!(entries)))
}

fn fingerprint_into(dir: &Path, prefix: &str, out: &mut Vec<String>) -> Result<()> {
    let mut names: Vec<(String, PathBuf)> = Vec::new();
    let iter = fs::read_dir(dir).map_err(|e| {
        Error::io(
            ErrorKind::Source,
            format!("failed to list {}", dir.display()),
            &e,
        )
    })?;
    for entry in iter {
        let entry = entry.map_err(|e| Error::io(ErrorKind::Source, "failed to read entry", &e))?;
        names.push((entry.file_name().to_string_lossy().into_owned(), entry.path()));
    }
    names.sort();

    for (name, path) in names {
        let rel = if prefix.is_empty() {
            name
        } else {
            format!("{}/{}", prefix, name)
        };
        let meta = fs::symlink_metadata(&path)
            .map_err(|e| Error::io(ErrorKind::Source, "failed to stat entry", &e))?;
        if meta.file_type().is_symlink() {
            let target = fs::read_link(&path)
                .map_err(|e| Error::io(ErrorKind::Source, "failed to read symlink", &e))?;
            out.push(format!("l {} -> {}", rel, target.to_string_lossy()));
        } else if meta.is_dir() {
            out.push(format!("d {}", rel));
            fingerprint_into(&path, &rel, out)?;
        } else {
            let bytes = fs::read(&path)
                .map_err(|e| Error::io(ErrorKind::Source, "failed to read file", &e))?;
            let exec = if is_executable(&meta) { "x" } else { "f" };
            out.push(format!("{} {} {}", exec, rel, kiln_keys::hash_bytes(&bytes)));
        }
    }
    Ok(())
}

#[cfg(unix)]
fn is_executable(meta: &fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o111 != 0
}

#[cfg(not(unix))]
fn is_executable(_meta: &fs::Metadata) -> bool {
    false
}

fn copy_tree(src: &Path, dest: &Path) -> Result<()> {
    fs::create_dir_all(dest)
        .map_err(|e| Error::io(ErrorKind::Source, "failed to create staging dir", &e))?;
    let iter = fs::read_dir(src).map_err(|e| {
        Error::io(
            ErrorKind::Source,
            format!("failed to list {}", src.display()),
            &e,
        )
    })?;
    for entry in iter {
        let entry = entry.map_err(|e| Error::io(ErrorKind::Source, "failed to read entry", &e))?;
        let from = entry.path();
        let to = dest.join(entry.file_name());
        let meta = fs::symlink_metadata(&from)
            .map_err(|e| Error::io(ErrorKind::Source, "failed to stat entry", &e))?;
        if meta.file_type().is_symlink() {
            let target = fs::read_link(&from)
                .map_err(|e| Error::io(ErrorKind::Source, "failed to read symlink", &e))?;
            make_symlink(&target, &to)?;
        } else if meta.is_dir() {
            copy_tree(&from, &to)?;
        } else {
            fs::copy(&from, &to)
                .map_err(|e| Error::io(ErrorKind::Source, "failed to copy file", &e))?;
        }
    }
    Ok(())
}

#[cfg(unix)]
fn make_symlink(target: &Path, path: &Path) -> Result<()> {
    std::os::unix::fs::symlink(target, path)
        .map_err(|e| Error::io(ErrorKind::Source, "failed to create symlink", &e))
}

#[cfg(not(unix))]
fn make_symlink(_target: &Path, path: &Path) -> Result<()> {
    Err(Error::new(
        ErrorKind::Source,
        "unsupported",
        format!("symlinks are not supported here: {}", path.display()),
    ))
}

// ---------------------------------------------------------------------------
// Element plugins
// ---------------------------------------------------------------------------

/// A batch of commands run together in the sandbox; batch boundaries are
/// observable in logs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandBatch {
    pub label: String,
    pub commands: Vec<String>,
}

/// One element plugin instance, bound to its configuration.
pub trait ElementPlugin: Send + Sync {
    fn kind(&self) -> &str;

    /// Plugin format version; participates in the cache key.
    fn version(&self) -> u32 {
        0
    }

    fn preflight(&self) -> Result<()> {
        Ok(())
    }

    /// A deterministic fingerprint of the plugin configuration.
    fn get_unique_key(&self) -> Value;

    /// Whether assembly runs sandbox commands.
    fn run_commands(&self) -> bool;

    /// Whether dependency content changes must rebuild this element even in
    /// non-strict mode.
    fn strict_rebuild(&self) -> bool {
        false
    }

    /// Whether this element is a subproject link.
    fn is_junction(&self) -> bool {
        false
    }

    /// The command batches to run at assembly. Commands may reference
    /// `%{...}` variables; the sandbox layer expands them against the
    /// effective variable table.
    fn assemble_batches(&self) -> Result<Vec<CommandBatch>> {
        Ok(Vec::new())
    }
}

pub type ElementFactory = fn(&Value) -> Result<Box<dyn ElementPlugin>>;

/// Kind → factory table for element plugins.
#[derive(Default)]
pub struct ElementRegistry {
    kinds: BTreeMap<String, ElementFactory>,
}

impl ElementRegistry {
    pub fn with_builtins() -> Self {
        let mut registry = Self::default();
        registry.register("manual", ManualElement::create);
        registry.register("stack", StackElement::create);
        registry.register("junction", JunctionElement::create);
        registry
    }

    pub fn register(&mut self, kind: &str, factory: ElementFactory) {
        self.kinds.insert(kind.to_string(), factory);
    }

    pub fn create(&self, kind: &str, config: &Value) -> Result<Box<dyn ElementPlugin>> {
        let factory = self.kinds.get(kind).ok_or_else(|| {
            Error::new(
                ErrorKind::Load,
                "unknown-element-kind",
                format!("no element plugin for kind '{}'", kind),
            )
        })?;
        let plugin = factory(config)?;
        plugin.preflight()?;
        Ok(plugin)
    }
}

/// The builtin `manual` element: explicit build and install command lists.
pub struct ManualElement {
    build_commands: Vec<String>,
    install_commands: Vec<String>,
}

impl ManualElement {
    fn create(config: &Value) -> Result<Box<dyn ElementPlugin>> {
        Ok(Box::new(Self {
            build_commands: string_list(config, "build-commands")?,
            install_commands: string_list(config, "install-commands")?,
        }))
    }
}

fn string_list(config: &Value, key: &str) -> Result<Vec<String>> {
    match config.get(key) {
        None => Ok(Vec::new()),
        Some(Value::Array(items)) => items
            .iter()
            .map(|v| {
                v.as_str().map(str::to_string).ok_or_else(|| {
                    Error::new(
                        ErrorKind::Load,
                        "invalid-element-config",
                        format!("'{}' entries must be strings", key),
                    )
                })
            })
            .collect(),
        Some(_) => Err(Error::new(
            ErrorKind::Load,
            "invalid-element-config",
            format!("'{}' must be a list of strings", key),
        )),
    }
}

impl ElementPlugin for ManualElement {
    fn kind(&self) -> &str {
        "manual"
    }

    fn get_unique_key(&self) -> Value {
        json!({
            "build-commands": self.build_commands,
            "install-commands": self.install_commands,
        })
    }

    fn run_commands(&self) -> bool {
        true
    }

    fn assemble_batches(&self) -> Result<Vec<CommandBatch>> {
        let mut batches = Vec::new();
        for (label, commands) in [
            ("build", &self.build_commands),
            ("install", &self.install_commands),
        ] {
            if commands.is_empty() {
                continue;
            }
            batches.push(CommandBatch {
                label: label.to_string(),
                commands: commands.clone(),
            });
        }
        Ok(batches)
    }
}

/// The builtin `stack` element: a dependency grouping with no build step
/// and an empty artifact of its own.
pub struct StackElement;

impl StackElement {
    fn create(_config: &Value) -> Result<Box<dyn ElementPlugin>> {
        Ok(Box::new(Self))
    }
}

impl ElementPlugin for StackElement {
    fn kind(&self) -> &str {
        "stack"
    }

    fn get_unique_key(&self) -> Value {
        json!({})
    }

    fn run_commands(&self) -> bool {
        false
    }
}

/// The builtin `junction` element: a link to a subproject. Junctions are
/// never built; the state machine reports them as such.
pub struct JunctionElement;

impl JunctionElement {
    fn create(_config: &Value) -> Result<Box<dyn ElementPlugin>> {
        Ok(Box::new(Self))
    }
}

impl ElementPlugin for JunctionElement {
    fn kind(&self) -> &str {
        "junction"
    }

    fn get_unique_key(&self) -> Value {
        json!({})
    }

    fn run_commands(&self) -> bool {
        false
    }

    fn is_junction(&self) -> bool {
        true
    }
}
