//! The source cache: staged source trees in CAS, keyed by source key.
//!
//! After a fetch, the composite staging tree of an element's sources is
//! imported into CAS and recorded under the sources' cache key. Entries are
//! immutable; a key either resolves to the same tree forever or is absent.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use kiln_cas::{CasCache, tree};
use kiln_types::{Digest, Error, ErrorKind, Result};

use crate::remotes::CacheRemotes;

/// Serialized metadata for one cached source tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceProto {
    pub files: Digest,
}

/// Façade over CAS for staged sources.
pub struct SourceCache {
    cas: Arc<CasCache>,
    refs_dir: PathBuf,
    remotes: CacheRemotes,
}

impl SourceCache {
    pub fn new(cas: Arc<CasCache>, sources_dir: &Path, remotes: CacheRemotes) -> Result<Self> {
        let refs_dir = sources_dir.join("refs");
        fs::create_dir_all(&refs_dir)
            .map_err(|e| Error::io(ErrorKind::Cas, "failed to create source refs dir", &e))?;
        Ok(Self {
            cas,
            refs_dir,
            remotes,
        })
    }

    fn ref_path(&self, key: &str) -> PathBuf {
        self.refs_dir.join(key)
    }

    fn asset_name(key: &str) -> String {
        format!("source/{}", key)
    }

    pub fn has_fetch_remotes(&self) -> bool {
        self.remotes.has_fetch_remotes()
    }

    pub fn has_push_remotes(&self) -> bool {
        self.remotes.has_push_remotes()
    }

    /// Whether the staged tree for `key` is fully present locally.
    pub fn contains(&self, key: &str) -> bool {
        match self.load(key) {
            Ok(Some(proto)) => self
                .cas
                .contains_directory(&proto.files, true)
                .unwrap_or(false),
            _ => false,
        }
    }

    /// Load the proto for `key`, if recorded locally.
    pub fn load(&self, key: &str) -> Result<Option<SourceProto>> {
        let path = self.ref_path(key);
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&path)
            .map_err(|e| Error::io(ErrorKind::Cas, "failed to read source ref", &e))?;
        let proto = serde_json::from_str(&content).map_err(|e| {
            Error::new(
                ErrorKind::Cas,
                "decode-failed",
                format!("corrupt source ref {}: {}", key, e),
            )
        })?;
        Ok(Some(proto))
    }

    /// Import a staged tree and record it under `key`. Returns the tree
    /// digest.
    pub fn commit(&self, key: &str, staged: &Path) -> Result<Digest> {
        let files = tree::import_tree(&self.cas, staged)?;
        self.cas.protect_directory(&files)?;
        self.write_ref(key, &SourceProto { files: files.clone() })?;
        Ok(files)
    }

    /// Check a cached tree out into `dest`.
    pub fn stage(&self, key: &str, dest: &Path) -> Result<Digest> {
        let proto = self.load(key)?.ok_or_else(|| {
            Error::new(
                ErrorKind::Cas,
                "blob-missing",
                format!("sources not cached for key {}", key),
            )
        })?;
        tree::checkout(&self.cas, &proto.files, dest)?;
        Ok(proto.files)
    }

    /// Try to pull `key` from the configured remotes; first success wins.
    pub fn pull(&self, key: &str) -> Result<bool> {
        let name = Self::asset_name(key);
        for index in self.remotes.index() {
            let Some(proto_digest) = index.fetch_asset(&name)? else {
                continue;
            };
            for storage in self.remotes.storage() {
                match self.pull_from(storage, &proto_digest, key) {
                    Ok(()) => return Ok(true),
                    Err(e) if e.temporary => continue,
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(false)
    }

    fn pull_from(
        &self,
        storage: &kiln_cas::remote::RemoteCas,
        proto_digest: &Digest,
        key: &str,
    ) -> Result<()> {
        if !self.cas.contains(proto_digest) {
            storage.fetch_blobs(&self.cas, std::slice::from_ref(proto_digest))?;
        }
        let bytes = self.cas.read_blob(proto_digest)?;
        let proto: SourceProto = serde_json::from_slice(&bytes).map_err(|e| {
            Error::new(
                ErrorKind::Remote,
                "protocol-error",
                format!("remote sent corrupt source proto for {}: {}", key, e),
            )
        })?;
        storage.pull_tree(&self.cas, &proto.files)?;
        self.cas.protect_directory(&proto.files)?;
        self.write_ref(key, &proto)
    }

    /// Push `key` to every push-enabled remote. Returns whether anything was
    /// pushed.
    pub fn push(&self, key: &str) -> Result<bool> {
        let Some(proto) = self.load(key)? else {
            return Ok(false);
        };
        if !self.has_push_remotes() {
            return Ok(false);
        }

        let bytes = serde_json::to_vec(&proto).map_err(|e| {
            Error::new(ErrorKind::Cas, "encode-failed", format!("source proto: {}", e))
        })?;
        let proto_digest = self.cas.add_blob(&bytes)?;

        let mut pushed = false;
        for storage in self.remotes.push_storage() {
            storage.send_tree(&self.cas, &proto.files)?;
            storage.send_blobs(&self.cas, std::slice::from_ref(&proto_digest))?;
            pushed = true;
        }
        for index in self.remotes.push_index() {
            index.push_asset(&Self::asset_name(key), &proto_digest)?;
        }
        Ok(pushed)
    }

    fn write_ref(&self, key: &str, proto: &SourceProto) -> Result<()> {
        let path = self.ref_path(key);
        let json = serde_json::to_string_pretty(proto).map_err(|e| {
            Error::new(ErrorKind::Cas, "encode-failed", format!("source ref: {}", e))
        })?;
        // Temp file + rename keeps refs atomic under concurrent sessions.
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, json)
            .map_err(|e| Error::io(ErrorKind::Cas, "failed to write source ref", &e))?;
        fs::rename(&tmp, &path)
            .map_err(|e| Error::io(ErrorKind::Cas, "failed to commit source ref", &e))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    fn cache(root: &Path) -> SourceCache {
        let cas = Arc::new(CasCache::new(root.join("cas")).expect("cas"));
        SourceCache::new(cas, &root.join("sources"), CacheRemotes::default()).expect("cache")
    }

    #[test]
    fn commit_then_stage_roundtrips() {
        let td = tempdir().expect("tempdir");
        let cache = cache(td.path());

        let staged = td.path().join("staged");
        fs::create_dir_all(staged.join("sub")).expect("mkdir");
        fs::write(staged.join("main.c"), "int main(){}").expect("write");
        fs::write(staged.join("sub/util.h"), "#pragma once").expect("write");

        let key = "ab".repeat(32);
        cache.commit(&key, &staged).expect("commit");
        assert!(cache.contains(&key));

        let dest = td.path().join("out");
        cache.stage(&key, &dest).expect("stage");
        assert_eq!(
            fs::read_to_string(dest.join("main.c")).expect("read"),
            "int main(){}"
        );
        assert_eq!(
            fs::read_to_string(dest.join("sub/util.h")).expect("read"),
            "#pragma once"
        );
    }

    #[test]
    fn missing_key_is_not_cached() {
        let td = tempdir().expect("tempdir");
        let cache = cache(td.path());
        assert!(!cache.contains(&"cd".repeat(32)));
        assert!(cache.load(&"cd".repeat(32)).expect("load").is_none());
    }

    #[test]
    fn staging_a_missing_key_is_a_domain_error() {
        let td = tempdir().expect("tempdir");
        let cache = cache(td.path());
        let err = cache
            .stage(&"ef".repeat(32), &td.path().join("out"))
            .expect_err("missing");
        assert_eq!(err.reason, "blob-missing");
    }

    #[test]
    fn contains_requires_full_closure() {
        let td = tempdir().expect("tempdir");
        let cas = Arc::new(CasCache::new(td.path().join("cas")).expect("cas"));
        let cache = SourceCache::new(cas.clone(), &td.path().join("sources"), CacheRemotes::default())
            .expect("cache");

        let staged = td.path().join("staged");
        fs::create_dir_all(&staged).expect("mkdir");
        fs::write(staged.join("f.txt"), "payload").expect("write");

        let key = "12".repeat(32);
        cache.commit(&key, &staged).expect("commit");

        // Drop the file blob behind the cache's back.
        let proto = cache.load(&key).expect("load").expect("some");
        let dir = cas.read_directory(&proto.files).expect("dir");
        fs::remove_file(cas.objpath(&dir.files[0].digest)).expect("remove");

        assert!(!cache.contains(&key));
    }

    #[test]
    fn push_without_remotes_is_a_noop() {
        let td = tempdir().expect("tempdir");
        let cache = cache(td.path());

        let staged = td.path().join("staged");
        fs::create_dir_all(&staged).expect("mkdir");
        fs::write(staged.join("f.txt"), "x").expect("write");

        let key = "34".repeat(32);
        cache.commit(&key, &staged).expect("commit");
        assert!(!cache.push(&key).expect("push"));
        assert!(!cache.pull(&key).expect("pull"));
    }
}
