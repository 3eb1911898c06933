//! The artifact cache: Artifact protos in CAS plus local ref files.
//!
//! Each artifact is recorded twice locally: a CAS blob holding the proto and
//! a small serialized ref file under `artifacts/refs/<project>/<name>/<key>`
//! (written via temp file + rename). Pulls try the strict key first, then
//! fall back to the weak key in non-strict mode; pushes go to every
//! push-enabled remote.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use kiln_cas::{CasCache, remote::RemoteCas, tree};
use kiln_types::{Digest, Error, ErrorKind, Result};

use crate::artifact::{self, Artifact};
use crate::remotes::CacheRemotes;

/// Why a push was skipped, when it was.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushSkip {
    NoRemotes,
    Uncached,
    Tainted,
    MissingBuildtree,
}

impl PushSkip {
    pub fn reason(self) -> &'static str {
        match self {
            PushSkip::NoRemotes => "no push remotes configured",
            PushSkip::Uncached => "artifact is not cached",
            PushSkip::Tainted => "artifact is tainted",
            PushSkip::MissingBuildtree => "advertised buildtree is missing locally",
        }
    }
}

pub struct ArtifactCache {
    cas: Arc<CasCache>,
    refs_dir: PathBuf,
    remotes: CacheRemotes,
    require_buildtrees: bool,
}

impl ArtifactCache {
    pub fn new(
        cas: Arc<CasCache>,
        artifacts_dir: &Path,
        remotes: CacheRemotes,
        require_buildtrees: bool,
    ) -> Result<Self> {
        let refs_dir = artifacts_dir.join("refs");
        fs::create_dir_all(&refs_dir)
            .map_err(|e| Error::io(ErrorKind::Cas, "failed to create artifact refs dir", &e))?;
        Ok(Self {
            cas,
            refs_dir,
            remotes,
            require_buildtrees,
        })
    }

    pub fn has_fetch_remotes(&self) -> bool {
        self.remotes.has_fetch_remotes()
    }

    pub fn has_push_remotes(&self) -> bool {
        self.remotes.has_push_remotes()
    }

    fn ref_file(&self, project: &str, name: &str, key: &str) -> PathBuf {
        self.refs_dir.join(artifact::ref_path(project, name, key))
    }

    fn asset_name(project: &str, name: &str, key: &str) -> String {
        format!(
            "artifact/{}/{}/{}",
            project,
            artifact::normal_name(name),
            key
        )
    }

    /// Load the artifact recorded under a key, if any. The proto alone does
    /// not imply the artifact is usable; see [`Artifact::is_complete`].
    pub fn load(&self, project: &str, name: &str, key: &str) -> Result<Option<Artifact>> {
        let path = self.ref_file(project, name, key);
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&path)
            .map_err(|e| Error::io(ErrorKind::Cas, "failed to read artifact ref", &e))?;
        let proto = serde_json::from_str(&content).map_err(|e| {
            Error::new(
                ErrorKind::Cas,
                "decode-failed",
                format!("corrupt artifact ref {}: {}", path.display(), e),
            )
        })?;
        Ok(Some(proto))
    }

    /// Whether a complete artifact is locally cached under this key.
    pub fn contains(&self, project: &str, name: &str, key: &str) -> bool {
        match self.load(project, name, key) {
            Ok(Some(a)) => a.is_complete(&self.cas, self.require_buildtrees),
            _ => false,
        }
    }

    /// Record an artifact locally under its strong and weak keys, protecting
    /// its closure from eviction.
    pub fn store(&self, project: &str, name: &str, proto: &Artifact) -> Result<()> {
        self.protect_closure(proto)?;
        self.write_ref(project, name, &proto.strong_key, proto)?;
        if proto.weak_key != proto.strong_key {
            self.write_ref(project, name, &proto.weak_key, proto)?;
        }
        Ok(())
    }

    fn protect_closure(&self, proto: &Artifact) -> Result<()> {
        for dir in [&proto.files, &proto.buildtree, &proto.buildroot, &proto.sources]
            .into_iter()
            .flatten()
        {
            if self.cas.contains(dir) {
                self.cas.protect_directory(dir)?;
            }
        }
        for blob in [
            &proto.public_data,
            &proto.low_diversity_meta,
            &proto.high_diversity_meta,
        ]
        .into_iter()
        .flatten()
        {
            self.cas.protect(blob);
        }
        for log in &proto.logs {
            self.cas.protect(&log.digest);
        }
        Ok(())
    }

    fn write_ref(&self, project: &str, name: &str, key: &str, proto: &Artifact) -> Result<()> {
        let path = self.ref_file(project, name, key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| Error::io(ErrorKind::Cas, "failed to create ref dir", &e))?;
        }
        let json = serde_json::to_string_pretty(proto).map_err(|e| {
            Error::new(ErrorKind::Cas, "encode-failed", format!("artifact proto: {}", e))
        })?;
        // Write to temp file first, then rename for atomicity.
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, json)
            .map_err(|e| Error::io(ErrorKind::Cas, "failed to write artifact ref", &e))?;
        fs::rename(&tmp, &path)
            .map_err(|e| Error::io(ErrorKind::Cas, "failed to commit artifact ref", &e))?;
        Ok(())
    }

    /// Pull an artifact: strict key first; when `weak_key` is given
    /// (non-strict mode) retry with it. A pulled artifact whose stored
    /// success flag is false is discarded when its strong key no longer
    /// matches `current_strict_key` — the dependency graph moved on and the
    /// failure must be retried.
    pub fn pull(
        &self,
        project: &str,
        name: &str,
        strict_key: &str,
        weak_key: Option<&str>,
        current_strict_key: &str,
    ) -> Result<Option<Artifact>> {
        let mut keys = vec![strict_key];
        if let Some(weak) = weak_key
            && weak != strict_key
        {
            keys.push(weak);
        }

        for key in keys {
            if let Some(artifact) = self.pull_one(project, name, key)? {
                if !artifact.build_success && artifact.strong_key != current_strict_key {
                    continue;
                }
                self.store(project, name, &artifact)?;
                return Ok(Some(artifact));
            }
        }
        Ok(None)
    }

    fn pull_one(&self, project: &str, name: &str, key: &str) -> Result<Option<Artifact>> {
        let asset = Self::asset_name(project, name, key);
        for index in self.remotes.index() {
            let Some(proto_digest) = index.fetch_asset(&asset)? else {
                continue;
            };
            for storage in self.remotes.storage() {
                match self.pull_payload(storage, &proto_digest) {
                    Ok(artifact) => return Ok(Some(artifact)),
                    Err(e) if e.temporary => continue,
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(None)
    }

    fn pull_payload(&self, storage: &RemoteCas, proto_digest: &Digest) -> Result<Artifact> {
        if !self.cas.contains(proto_digest) {
            storage.fetch_blobs(&self.cas, std::slice::from_ref(proto_digest))?;
        }
        let bytes = self.cas.read_blob(proto_digest)?;
        let proto: Artifact = serde_json::from_slice(&bytes).map_err(|e| {
            Error::new(
                ErrorKind::Remote,
                "protocol-error",
                format!("remote sent corrupt artifact proto: {}", e),
            )
        })?;

        if let Some(files) = &proto.files {
            storage.pull_tree(&self.cas, files)?;
        }
        if self.require_buildtrees
            && let Some(buildtree) = &proto.buildtree
        {
            storage.pull_tree(&self.cas, buildtree)?;
        }
        let mut blobs: Vec<Digest> = Vec::new();
        for blob in [
            &proto.public_data,
            &proto.low_diversity_meta,
            &proto.high_diversity_meta,
        ]
        .into_iter()
        .flatten()
        {
            if !self.cas.contains(blob) {
                blobs.push(blob.clone());
            }
        }
        for log in &proto.logs {
            if !self.cas.contains(&log.digest) {
                blobs.push(log.digest.clone());
            }
        }
        if !blobs.is_empty() {
            storage.fetch_blobs(&self.cas, &blobs)?;
        }
        Ok(proto)
    }

    /// Check the push skip rules without transferring anything.
    pub fn check_push(&self, artifact: Option<&Artifact>) -> Option<PushSkip> {
        if !self.has_push_remotes() {
            return Some(PushSkip::NoRemotes);
        }
        let Some(artifact) = artifact else {
            return Some(PushSkip::Uncached);
        };
        if !artifact.is_complete(&self.cas, false) {
            return Some(PushSkip::Uncached);
        }
        if artifact.tainted() {
            return Some(PushSkip::Tainted);
        }
        if let Some(buildtree) = &artifact.buildtree
            && !self.cas.contains_directory(buildtree, true).unwrap_or(false)
        {
            return Some(PushSkip::MissingBuildtree);
        }
        None
    }

    /// Push an artifact to every push-enabled remote under both its keys.
    pub fn push(&self, project: &str, name: &str, proto: &Artifact) -> Result<bool> {
        if let Some(skip) = self.check_push(Some(proto)) {
            return Err(Error::new(
                ErrorKind::Remote,
                "push-skipped",
                format!("push skipped: {}", skip.reason()),
            ));
        }

        let bytes = serde_json::to_vec(proto).map_err(|e| {
            Error::new(ErrorKind::Cas, "encode-failed", format!("artifact proto: {}", e))
        })?;
        let proto_digest = self.cas.add_blob(&bytes)?;

        for storage in self.remotes.push_storage() {
            if let Some(files) = &proto.files {
                storage.send_tree(&self.cas, files)?;
            }
            if let Some(buildtree) = &proto.buildtree
                && self.cas.contains_directory(buildtree, true).unwrap_or(false)
            {
                storage.send_tree(&self.cas, buildtree)?;
            }
            let mut blobs: Vec<Digest> = Vec::new();
            for blob in [
                &proto.public_data,
                &proto.low_diversity_meta,
                &proto.high_diversity_meta,
            ]
            .into_iter()
            .flatten()
            {
                blobs.push(blob.clone());
            }
            for log in &proto.logs {
                blobs.push(log.digest.clone());
            }
            blobs.push(proto_digest.clone());
            let missing = storage.missing_blobs(&blobs)?;
            storage.send_blobs(&self.cas, &missing)?;
        }

        for index in self.remotes.push_index() {
            index.push_asset(&Self::asset_name(project, name, &proto.strong_key), &proto_digest)?;
            if proto.weak_key != proto.strong_key {
                index.push_asset(&Self::asset_name(project, name, &proto.weak_key), &proto_digest)?;
            }
        }
        Ok(true)
    }

    /// Checkout an artifact's files into a directory.
    pub fn checkout_files(&self, proto: &Artifact, dest: &Path) -> Result<()> {
        let Some(files) = &proto.files else {
            return Ok(());
        };
        tree::checkout(&self.cas, files, dest)
    }
}
