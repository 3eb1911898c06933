//! Assembly: turning a cache miss into a new artifact.
//!
//! The job specification is prepared on the control thread from graph
//! state; the assembly itself runs on a worker with an immutable snapshot
//! and produces an [`Artifact`] proto — successful or failed — whose blobs
//! are already committed to CAS. Failed builds still yield an artifact
//! (with logs) so rerun sessions surface the failure without re-executing.

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use globset::GlobSet;
use serde_json::{Value, json};

use kiln_cas::{CasCache, tree};
use kiln_types::{Digest, Error, ErrorKind, Result};

use crate::artifact::{Artifact, BuildDepRecord, CORE_ARTIFACT_VERSION, LogFile};
use crate::config::BuildtreePolicy;
use crate::overlap::{OverlapAction, OverlapCollector, OverlapWarning, StagedProvenance};
use crate::plugin::CommandBatch;
use crate::sandbox::{CommandExecutor, Sandbox, SandboxConfig, SandboxFlags};
use crate::variables::Variables;

/// One dependency to stage, in planner order.
pub struct StagedDepSpec {
    pub name: String,
    pub files: Digest,
    pub whitelist: Option<GlobSet>,
}

/// Everything a build worker needs, snapshotted off the graph.
pub struct BuildJobSpec {
    pub project: String,
    pub name: String,
    pub weak_key: String,
    pub strict_key: String,
    pub strong_key: String,
    pub run_commands: bool,
    pub batches: Vec<CommandBatch>,
    pub environment: BTreeMap<String, String>,
    pub variables: BTreeMap<String, String>,
    pub sandbox: SandboxConfig,
    pub deps: Vec<StagedDepSpec>,
    pub sources_digest: Option<Digest>,
    pub public: Value,
    pub fatal_warnings: Vec<String>,
    pub build_dep_records: Vec<BuildDepRecord>,
    pub was_workspaced: bool,
    pub cache_buildtrees: BuildtreePolicy,
    pub overlap_action: OverlapAction,
    pub log_path: PathBuf,
    pub build_root: String,
    pub install_root: String,
}

/// Worker-side resources for one assembly.
pub struct BuildResources {
    pub cas: Arc<CasCache>,
    pub build_dir: PathBuf,
    pub cancel: Arc<AtomicBool>,
    pub executor: Box<dyn CommandExecutor>,
}

/// The produced artifact plus any non-fatal staging warnings.
#[derive(Debug)]
pub struct AssembleOutcome {
    pub artifact: Artifact,
    pub warnings: Vec<OverlapWarning>,
}

/// Run one assembly. Command failures produce a failed artifact; setup
/// failures (staging, fatal overlaps, cancellation) surface as errors and
/// never write an artifact.
pub fn assemble(spec: &BuildJobSpec, resources: BuildResources) -> Result<AssembleOutcome> {
    let cas = resources.cas.clone();
    let sandbox_rooted = resources.executor.sandbox_rooted();
    let mut sandbox = Sandbox::new(
        cas.clone(),
        &resources.build_dir,
        spec.log_path.clone(),
        resources.cancel,
        resources.executor,
    )
    .map_err(|e| e.for_element(&spec.name))?;

    sandbox.set_environment(spec.environment.clone());
    sandbox.set_work_dir(&spec.build_root);
    sandbox.mark_directory(&spec.build_root)?;
    sandbox.mark_directory(&spec.install_root)?;

    // Expand command variables. A chrooted executor sees sandbox-absolute
    // paths as written; the local executor needs them rewritten to host
    // paths under the staged root.
    let mut declared = spec.variables.clone();
    let effective_root = |path: &str| {
        if sandbox_rooted {
            path.to_string()
        } else {
            sandbox
                .root()
                .join(path.trim_start_matches('/'))
                .display()
                .to_string()
        }
    };
    declared.insert("build-root".to_string(), effective_root(&spec.build_root));
    declared.insert("install-root".to_string(), effective_root(&spec.install_root));
    let vars = Variables::new(&declared);
    let mut batches = Vec::with_capacity(spec.batches.len());
    for batch in &spec.batches {
        let commands: Result<Vec<String>> = batch.commands.iter().map(|c| vars.expand(c)).collect();
        batches.push(CommandBatch {
            label: batch.label.clone(),
            commands: commands.map_err(|e| e.for_element(&spec.name))?,
        });
    }

    // Stage the BUILD scope in planner order under one overlap session.
    let mut collector = OverlapCollector::new();
    collector.begin_session(spec.overlap_action, "/");
    for dep in &spec.deps {
        let result = sandbox
            .stage_directory(&dep.files, "/")
            .map_err(|e| e.for_element(&spec.name))?;
        collector.collect_stage_result(
            StagedProvenance {
                name: dep.name.clone(),
                whitelist: dep.whitelist.clone(),
            },
            &result,
        );
    }
    let warnings = collector
        .end_session()
        .map_err(|e| e.for_element(&spec.name))?;
    for warning in &warnings {
        if spec.fatal_warnings.iter().any(|w| w == warning.token.as_str()) {
            return Err(Error::new(
                ErrorKind::Overlap,
                warning.token.as_str(),
                warning.brief.clone(),
            )
            .with_detail(warning.detail.clone())
            .for_element(&spec.name));
        }
    }

    // Element sources land in the build root.
    if let Some(sources) = &spec.sources_digest {
        sandbox
            .stage_directory(sources, &spec.build_root)
            .map_err(|e| e.for_element(&spec.name))?;
    }

    // Run the batches; the first nonzero exit fails the build.
    let mut failure: Option<(String, i32)> = None;
    if spec.run_commands {
        let flags = SandboxFlags::default();
        for batch in &batches {
            let code = sandbox
                .run(batch, flags)
                .map_err(|e| e.for_element(&spec.name))?;
            if code != 0 {
                failure = Some((batch.label.clone(), code));
                break;
            }
        }
    }
    let build_success = failure.is_none();

    // Collect: install root always, buildtree per policy.
    let vroot = sandbox.vroot().map_err(|e| e.for_element(&spec.name))?;
    let files = match sandbox.subtree(&vroot, &spec.install_root)? {
        Some(digest) => digest,
        None => tree::empty_digest(&cas)?,
    };
    let capture_buildtree = match spec.cache_buildtrees {
        BuildtreePolicy::Always => true,
        BuildtreePolicy::Auto => !build_success,
        BuildtreePolicy::Never => false,
    };
    let (buildroot, buildtree) = if capture_buildtree {
        (Some(vroot.clone()), sandbox.subtree(&vroot, &spec.build_root)?)
    } else {
        (None, None)
    };

    // Blobify the log and the metadata.
    let log_bytes = fs::read(&spec.log_path)
        .map_err(|e| Error::io(ErrorKind::Sandbox, "failed to read build log", &e))?;
    let log_digest = cas.add_blob(&log_bytes)?;

    let public_data = add_json(&cas, &spec.public)?;
    let low_diversity_meta = add_json(&cas, &json!({
        "environment": spec.environment,
        "sandbox-config": spec.sandbox.to_key(),
    }))?;
    let high_diversity_meta = add_json(&cas, &json!({
        "variables": spec.variables,
    }))?;

    let (build_error, build_error_details) = match &failure {
        Some((label, code)) => (
            Some(format!("command failed with exit status {}", code)),
            Some(format!("in batch '{}'", label)),
        ),
        None => (None, None),
    };

    let artifact = Artifact {
        version: CORE_ARTIFACT_VERSION,
        strong_key: spec.strong_key.clone(),
        strict_key: spec.strict_key.clone(),
        weak_key: spec.weak_key.clone(),
        build_success,
        build_error,
        build_error_details,
        files: Some(files),
        buildroot,
        buildtree,
        sources: spec.sources_digest.clone(),
        public_data: Some(public_data),
        low_diversity_meta: Some(low_diversity_meta),
        high_diversity_meta: Some(high_diversity_meta),
        logs: vec![LogFile {
            name: "build.log".to_string(),
            digest: log_digest,
        }],
        build_deps: spec.build_dep_records.clone(),
        was_workspaced: spec.was_workspaced,
    };

    Ok(AssembleOutcome { artifact, warnings })
}

fn add_json(cas: &CasCache, value: &Value) -> Result<Digest> {
    let bytes = serde_json::to_vec(value).map_err(|e| {
        Error::new(
            ErrorKind::Cas,
            "encode-failed",
            format!("failed to encode metadata: {}", e),
        )
    })?;
    cas.add_blob(&bytes)
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use crate::sandbox::LocalExecutor;
    use crate::variables::{BUILD_ROOT, INSTALL_ROOT};

    use super::*;

    fn spec(name: &str, batches: Vec<CommandBatch>, deps: Vec<StagedDepSpec>, log: PathBuf) -> BuildJobSpec {
        BuildJobSpec {
            project: "proj".to_string(),
            name: name.to_string(),
            weak_key: "aa".repeat(32),
            strict_key: "bb".repeat(32),
            strong_key: "bb".repeat(32),
            run_commands: !batches.is_empty(),
            batches,
            environment: BTreeMap::from([(
                "PATH".to_string(),
                "/usr/bin:/bin".to_string(),
            )]),
            variables: BTreeMap::new(),
            sandbox: SandboxConfig::default(),
            deps,
            sources_digest: None,
            public: json!({}),
            fatal_warnings: Vec::new(),
            build_dep_records: Vec::new(),
            was_workspaced: false,
            cache_buildtrees: BuildtreePolicy::Auto,
            overlap_action: OverlapAction::Warning,
            log_path: log,
            build_root: BUILD_ROOT.to_string(),
            install_root: INSTALL_ROOT.to_string(),
        }
    }

    fn resources(root: &std::path::Path, cas: Arc<CasCache>) -> BuildResources {
        BuildResources {
            cas,
            build_dir: root.join("build"),
            cancel: Arc::new(AtomicBool::new(false)),
            executor: Box::new(LocalExecutor),
        }
    }

    fn batch(label: &str, commands: &[&str]) -> CommandBatch {
        CommandBatch {
            label: label.to_string(),
            commands: commands.iter().map(|c| c.to_string()).collect(),
        }
    }

    #[test]
    fn successful_assembly_captures_the_install_root() {
        let td = tempdir().expect("tempdir");
        let cas = Arc::new(CasCache::new(td.path().join("cas")).expect("cas"));

        let spec = spec(
            "hello.bst",
            vec![batch(
                "install",
                &[
                    "mkdir -p %{install-root}/bin",
                    "printf hi > %{install-root}/bin/hello",
                ],
            )],
            vec![],
            td.path().join("logs/hello.log"),
        );
        let outcome = assemble(&spec, resources(td.path(), cas.clone())).expect("assemble");
        assert!(outcome.artifact.build_success);
        assert_eq!(outcome.artifact.logs.len(), 1);
        // Auto policy: no buildtree for successful builds.
        assert!(outcome.artifact.buildtree.is_none());

        let files = outcome.artifact.files.expect("files");
        assert_eq!(
            tree::list_files(&cas, &files).expect("list"),
            vec!["bin/hello".to_string()]
        );
    }

    #[test]
    fn failed_commands_produce_a_failed_artifact_with_logs() {
        let td = tempdir().expect("tempdir");
        let cas = Arc::new(CasCache::new(td.path().join("cas")).expect("cas"));

        let spec = spec(
            "broken.bst",
            vec![batch("build", &["echo about-to-fail", "exit 3"])],
            vec![],
            td.path().join("logs/broken.log"),
        );
        let outcome = assemble(&spec, resources(td.path(), cas.clone())).expect("assemble");
        assert!(!outcome.artifact.build_success);
        assert!(
            outcome
                .artifact
                .build_error
                .as_deref()
                .expect("error")
                .contains("exit status 3")
        );
        // Auto policy captures the buildtree on failure.
        assert!(outcome.artifact.buildroot.is_some());

        let log = cas
            .read_blob(&outcome.artifact.logs[0].digest)
            .expect("log blob");
        assert!(String::from_utf8_lossy(&log).contains("about-to-fail"));
    }

    #[test]
    fn staged_dependencies_are_visible_to_commands() {
        let td = tempdir().expect("tempdir");
        let cas = Arc::new(CasCache::new(td.path().join("cas")).expect("cas"));

        // A dep artifact providing usr/bin/tool.
        let dep_dir = td.path().join("dep");
        fs::create_dir_all(dep_dir.join("usr/bin")).expect("mkdir");
        fs::write(dep_dir.join("usr/bin/tool"), "#!/bin/sh\n").expect("write");
        let dep_files = tree::import_tree(&cas, &dep_dir).expect("import");

        let spec = spec(
            "app.bst",
            vec![batch("check", &["test -f %{build-root}/../usr/bin/tool"])],
            vec![StagedDepSpec {
                name: "dep.bst".to_string(),
                files: dep_files,
                whitelist: None,
            }],
            td.path().join("logs/app.log"),
        );
        let outcome = assemble(&spec, resources(td.path(), cas)).expect("assemble");
        assert!(outcome.artifact.build_success);
    }

    #[test]
    fn fatal_overlap_fails_the_assembly_without_an_artifact() {
        let td = tempdir().expect("tempdir");
        let cas = Arc::new(CasCache::new(td.path().join("cas")).expect("cas"));

        let mk_dep = |name: &str| {
            let dir = td.path().join(name);
            fs::create_dir_all(dir.join("usr/bin")).expect("mkdir");
            fs::write(dir.join("usr/bin/foo"), name).expect("write");
            tree::import_tree(&cas, &dir).expect("import")
        };
        let a = mk_dep("a");
        let b = mk_dep("b");

        let mut job = spec(
            "app.bst",
            vec![],
            vec![
                StagedDepSpec {
                    name: "a.bst".to_string(),
                    files: a,
                    whitelist: None,
                },
                StagedDepSpec {
                    name: "b.bst".to_string(),
                    files: b,
                    whitelist: None,
                },
            ],
            td.path().join("logs/app.log"),
        );
        job.fatal_warnings = vec!["overlaps".to_string()];

        let err = assemble(&job, resources(td.path(), cas)).expect_err("fatal overlap");
        assert_eq!(err.kind, ErrorKind::Overlap);
        assert_eq!(err.reason, "overlaps");
        let detail = err.detail.expect("detail");
        assert!(detail.contains("a.bst"));
        assert!(detail.contains("b.bst"));
        assert!(detail.contains("usr/bin/foo"));
    }

    #[test]
    fn non_fatal_overlap_surfaces_as_warning() {
        let td = tempdir().expect("tempdir");
        let cas = Arc::new(CasCache::new(td.path().join("cas")).expect("cas"));

        let mk_dep = |name: &str| {
            let dir = td.path().join(name);
            fs::create_dir_all(dir.join("etc")).expect("mkdir");
            fs::write(dir.join("etc/conf"), name).expect("write");
            tree::import_tree(&cas, &dir).expect("import")
        };
        let a = mk_dep("a");
        let b = mk_dep("b");

        let job = spec(
            "app.bst",
            vec![],
            vec![
                StagedDepSpec {
                    name: "a.bst".to_string(),
                    files: a,
                    whitelist: None,
                },
                StagedDepSpec {
                    name: "b.bst".to_string(),
                    files: b,
                    whitelist: None,
                },
            ],
            td.path().join("logs/app.log"),
        );
        let outcome = assemble(&job, resources(td.path(), cas)).expect("assemble");
        assert!(outcome.artifact.build_success);
        assert_eq!(outcome.warnings.len(), 1);
    }

    #[test]
    fn stack_elements_produce_an_empty_files_tree() {
        let td = tempdir().expect("tempdir");
        let cas = Arc::new(CasCache::new(td.path().join("cas")).expect("cas"));

        let job = spec("stack.bst", vec![], vec![], td.path().join("logs/stack.log"));
        let outcome = assemble(&job, resources(td.path(), cas.clone())).expect("assemble");
        assert!(outcome.artifact.build_success);

        let files = outcome.artifact.files.expect("files");
        assert_eq!(tree::list_files(&cas, &files).expect("list"), Vec::<String>::new());
    }
}
