//! The sandbox contract and its local implementation.
//!
//! A sandbox is a scoped resource: its root filesystem is assembled from CAS
//! digests, commands run against that root, and the resulting tree is
//! captured back into CAS as a virtual-root digest. The [`CommandExecutor`]
//! seam carries the two implementations — local process execution here,
//! remote execution in [`crate::sandbox_remote`].

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use kiln_cas::{CasCache, tree};
use kiln_types::{Digest, Error, ErrorKind, Result};

use crate::plugin::CommandBatch;

/// Platform parameters a build runs under; participates in the cache key
/// for elements that run commands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxConfig {
    pub build_os: String,
    pub build_arch: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_uid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_gid: Option<u32>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            build_os: std::env::consts::OS.to_string(),
            build_arch: std::env::consts::ARCH.to_string(),
            build_uid: None,
            build_gid: None,
        }
    }
}

impl SandboxConfig {
    /// The fingerprint entry for this configuration.
    pub fn to_key(&self) -> Value {
        json!({
            "build-os": self.build_os,
            "build-arch": self.build_arch,
            "build-uid": self.build_uid,
            "build-gid": self.build_gid,
        })
    }
}

/// Per-command execution flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SandboxFlags {
    pub root_read_only: bool,
    pub network_enabled: bool,
    pub inherit_uid: bool,
    pub interactive: bool,
}

/// The execution seam: runs one observable batch of commands against a
/// staged root and reports the first nonzero exit code.
pub trait CommandExecutor: Send {
    fn run_batch(
        &mut self,
        root: &Path,
        batch: &CommandBatch,
        env: &BTreeMap<String, String>,
        work_dir: &str,
        flags: SandboxFlags,
        log: &mut File,
        cancel: &AtomicBool,
    ) -> Result<i32>;

    /// Whether commands see sandbox-absolute paths (`/kiln-build`) as-is.
    /// When false, path variables are rewritten to host paths before
    /// expansion.
    fn sandbox_rooted(&self) -> bool {
        false
    }
}

/// Runs commands as host processes against the staged root.
///
/// Isolation is scoped: the environment is fully scrubbed and the working
/// directory confined to the staged root, which is what hermetic cache keys
/// need. Kernel-level containment is a platform concern outside the core.
#[derive(Debug, Default)]
pub struct LocalExecutor;

impl CommandExecutor for LocalExecutor {
    fn run_batch(
        &mut self,
        root: &Path,
        batch: &CommandBatch,
        env: &BTreeMap<String, String>,
        work_dir: &str,
        flags: SandboxFlags,
        log: &mut File,
        cancel: &AtomicBool,
    ) -> Result<i32> {
        let _ = flags;
        let cwd = root.join(work_dir.trim_start_matches('/'));
        fs::create_dir_all(&cwd)
            .map_err(|e| Error::io(ErrorKind::Sandbox, "failed to create work dir", &e))?;

        for command in &batch.commands {
            if cancel.load(Ordering::SeqCst) {
                return Err(cancelled());
            }
            writeln!(log, "$ {}", command)
                .map_err(|e| Error::io(ErrorKind::Sandbox, "failed to write log", &e))?;

            let stdout = log
                .try_clone()
                .map_err(|e| Error::io(ErrorKind::Sandbox, "failed to clone log handle", &e))?;
            let stderr = log
                .try_clone()
                .map_err(|e| Error::io(ErrorKind::Sandbox, "failed to clone log handle", &e))?;

            let status = Command::new("sh")
                .arg("-c")
                .arg(command)
                .current_dir(&cwd)
                .env_clear()
                .envs(env)
                .stdin(Stdio::null())
                .stdout(Stdio::from(stdout))
                .stderr(Stdio::from(stderr))
                .status()
                .map_err(|e| Error::io(ErrorKind::Sandbox, "failed to spawn command", &e))?;

            let code = status.code().unwrap_or(-1);
            if code != 0 {
                return Ok(code);
            }
        }
        Ok(0)
    }
}

pub(crate) fn cancelled() -> Error {
    Error::new(ErrorKind::Sandbox, "cancelled", "build cancelled")
}

/// A scoped sandbox: staged root, environment, log, and an executor.
pub struct Sandbox {
    cas: Arc<CasCache>,
    root: tempfile::TempDir,
    env: BTreeMap<String, String>,
    work_dir: String,
    log_path: PathBuf,
    log: File,
    cancel: Arc<AtomicBool>,
    executor: Box<dyn CommandExecutor>,
}

impl Sandbox {
    /// Create a sandbox whose root lives under `build_dir` and whose log is
    /// appended to `log_path`.
    pub fn new(
        cas: Arc<CasCache>,
        build_dir: &Path,
        log_path: PathBuf,
        cancel: Arc<AtomicBool>,
        executor: Box<dyn CommandExecutor>,
    ) -> Result<Self> {
        fs::create_dir_all(build_dir)
            .map_err(|e| Error::io(ErrorKind::Sandbox, "failed to create build dir", &e))?;
        let root = tempfile::TempDir::new_in(build_dir)
            .map_err(|e| Error::io(ErrorKind::Sandbox, "failed to create sandbox root", &e))?;
        if let Some(parent) = log_path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| Error::io(ErrorKind::Sandbox, "failed to create log dir", &e))?;
        }
        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .map_err(|e| Error::io(ErrorKind::Sandbox, "failed to open build log", &e))?;
        Ok(Self {
            cas,
            root,
            env: BTreeMap::new(),
            work_dir: "/".to_string(),
            log_path,
            log,
            cancel,
            executor,
        })
    }

    pub fn root(&self) -> &Path {
        self.root.path()
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    pub fn set_environment(&mut self, env: BTreeMap<String, String>) {
        self.env = env;
    }

    pub fn set_work_dir(&mut self, work_dir: &str) {
        self.work_dir = work_dir.to_string();
    }

    /// Ensure a directory exists and is writable inside the root.
    pub fn mark_directory(&self, path: &str) -> Result<()> {
        let dir = self.root.path().join(path.trim_start_matches('/'));
        fs::create_dir_all(&dir)
            .map_err(|e| Error::io(ErrorKind::Sandbox, "failed to mark directory", &e))
    }

    /// Stage a directory digest at a sandbox-relative location, reporting
    /// written/overwritten/ignored files for overlap collection.
    pub fn stage_directory(&self, digest: &Digest, location: &str) -> Result<tree::FileListResult> {
        let dest = self.root.path().join(location.trim_start_matches('/'));
        tree::checkout_tracked(&self.cas, digest, &dest)
    }

    /// Run one command batch; returns the first nonzero exit code, or 0.
    pub fn run(&mut self, batch: &CommandBatch, flags: SandboxFlags) -> Result<i32> {
        if self.cancel.load(Ordering::SeqCst) {
            return Err(cancelled());
        }
        writeln!(self.log, "[{}]", batch.label)
            .map_err(|e| Error::io(ErrorKind::Sandbox, "failed to write log", &e))?;
        self.executor.run_batch(
            self.root.path(),
            batch,
            &self.env,
            &self.work_dir,
            flags,
            &mut self.log,
            &self.cancel,
        )
    }

    /// Capture the virtual root as a directory digest.
    pub fn vroot(&self) -> Result<Digest> {
        tree::import_tree(&self.cas, self.root.path())
    }

    /// Digest of a sandbox-relative subtree of the virtual root, if present.
    pub fn subtree(&self, vroot: &Digest, path: &str) -> Result<Option<Digest>> {
        tree::subdir_digest(&self.cas, vroot, path)
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    fn sandbox(root: &Path) -> (Arc<CasCache>, Sandbox) {
        let cas = Arc::new(CasCache::new(root.join("cas")).expect("cas"));
        let sandbox = Sandbox::new(
            cas.clone(),
            &root.join("build"),
            root.join("logs/test.log"),
            Arc::new(AtomicBool::new(false)),
            Box::new(LocalExecutor),
        )
        .expect("sandbox");
        (cas, sandbox)
    }

    fn batch(commands: &[&str]) -> CommandBatch {
        CommandBatch {
            label: "test".to_string(),
            commands: commands.iter().map(|c| c.to_string()).collect(),
        }
    }

    #[test]
    fn commands_run_against_the_root() {
        let td = tempdir().expect("tempdir");
        let (_cas, mut sandbox) = sandbox(td.path());

        let code = sandbox
            .run(&batch(&["mkdir -p out", "echo made > out/file.txt"]), SandboxFlags::default())
            .expect("run");
        assert_eq!(code, 0);
        assert_eq!(
            fs::read_to_string(sandbox.root().join("out/file.txt")).expect("read"),
            "made\n"
        );
    }

    #[test]
    fn first_nonzero_exit_stops_the_batch() {
        let td = tempdir().expect("tempdir");
        let (_cas, mut sandbox) = sandbox(td.path());

        let code = sandbox
            .run(&batch(&["exit 7", "touch never.txt"]), SandboxFlags::default())
            .expect("run");
        assert_eq!(code, 7);
        assert!(!sandbox.root().join("never.txt").exists());
    }

    #[test]
    fn environment_is_scrubbed() {
        let td = tempdir().expect("tempdir");
        let (_cas, mut sandbox) = sandbox(td.path());
        sandbox.set_environment(BTreeMap::from([(
            "PATH".to_string(),
            "/usr/bin:/bin".to_string(),
        )]));

        let code = sandbox
            .run(
                &batch(&["test -z \"$HOME\"", "test \"$PATH\" = /usr/bin:/bin"]),
                SandboxFlags::default(),
            )
            .expect("run");
        assert_eq!(code, 0);
    }

    #[test]
    fn cancellation_is_observed_before_commands() {
        let td = tempdir().expect("tempdir");
        let cas = Arc::new(CasCache::new(td.path().join("cas")).expect("cas"));
        let cancel = Arc::new(AtomicBool::new(true));
        let mut sandbox = Sandbox::new(
            cas,
            &td.path().join("build"),
            td.path().join("logs/test.log"),
            cancel,
            Box::new(LocalExecutor),
        )
        .expect("sandbox");

        let err = sandbox
            .run(&batch(&["touch leaked.txt"]), SandboxFlags::default())
            .expect_err("cancelled");
        assert_eq!(err.reason, "cancelled");
        assert!(!sandbox.root().join("leaked.txt").exists());
    }

    #[test]
    fn vroot_captures_the_staged_tree() {
        let td = tempdir().expect("tempdir");
        let (cas, mut sandbox) = sandbox(td.path());

        sandbox
            .run(&batch(&["mkdir -p kiln-install/bin", "echo bin > kiln-install/bin/tool"]), SandboxFlags::default())
            .expect("run");

        let vroot = sandbox.vroot().expect("vroot");
        let install = sandbox
            .subtree(&vroot, "/kiln-install")
            .expect("subtree")
            .expect("present");
        let files = tree::list_files(&cas, &install).expect("list");
        assert_eq!(files, vec!["bin/tool".to_string()]);
    }

    #[test]
    fn commands_log_to_the_build_log() {
        let td = tempdir().expect("tempdir");
        let (_cas, mut sandbox) = sandbox(td.path());

        sandbox
            .run(&batch(&["echo visible-output"]), SandboxFlags::default())
            .expect("run");

        let log = fs::read_to_string(sandbox.log_path()).expect("read log");
        assert!(log.contains("[test]"));
        assert!(log.contains("$ echo visible-output"));
        assert!(log.contains("visible-output\n"));
    }

    #[test]
    fn sandbox_config_key_is_stable() {
        let config = SandboxConfig {
            build_os: "linux".into(),
            build_arch: "x86_64".into(),
            build_uid: Some(0),
            build_gid: None,
        };
        assert_eq!(config.to_key(), config.clone().to_key());
        assert_ne!(
            config.to_key(),
            SandboxConfig {
                build_arch: "aarch64".into(),
                ..config
            }
            .to_key()
        );
    }
}
