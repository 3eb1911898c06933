//! Content-addressed storage for kiln.
//!
//! The local store keeps every blob under `objects/<xx>/<rest-of-hash>`,
//! addressed by its [`Digest`]. Insertion is atomic (temp file + rename into
//! place) and idempotent: concurrent insertion of equal content is serialized
//! by the rename and never duplicated. Directory trees are stored as
//! serialized [`proto::Directory`] blobs and compose recursively; equal
//! directories share digests.
//!
//! Quota-driven eviction removes least-recently-used objects, but never
//! content registered in the session's protected set.
//!
//! Modules:
//!
//! - [`proto`] — REAPI message types (native serde models).
//! - [`tree`] — Merkle directory import, checkout and closure walks.
//! - [`remote`] — remote CAS / execution client over the REAPI wire.

use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::SystemTime;

use sha2::{Digest as _, Sha256};

use kiln_types::{Digest, Error, ErrorKind, Result};

pub mod proto;
pub mod remote;
pub mod tree;

const OBJECTS_DIR: &str = "objects";
const TMP_DIR: &str = "tmp";
const LOCK_FILE: &str = "lock";

/// The local content-addressed store.
///
/// Shared across worker threads behind an `Arc`; all methods take `&self`.
/// Multi-process coordination (eviction vs. concurrent writers) goes through
/// a file lock on the store directory.
#[derive(Debug)]
pub struct CasCache {
    root: PathBuf,
    /// Digest hashes that must survive eviction for the current session.
    protected: Mutex<HashSet<String>>,
}

impl CasCache {
    /// Open (creating if needed) a store rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        for dir in [OBJECTS_DIR, TMP_DIR] {
            fs::create_dir_all(root.join(dir))
                .map_err(|e| Error::io(ErrorKind::Cas, "failed to create store directory", &e))?;
        }
        Ok(Self {
            root,
            protected: Mutex::new(HashSet::new()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Local path an object lives at (whether or not it exists yet).
    pub fn objpath(&self, digest: &Digest) -> PathBuf {
        let (prefix, rest) = digest.hash.split_at(2);
        self.root.join(OBJECTS_DIR).join(prefix).join(rest)
    }

    /// Directory for short-lived staging, on the same filesystem as the
    /// object store so renames stay atomic.
    pub fn tmpdir(&self) -> PathBuf {
        self.root.join(TMP_DIR)
    }

    // -- insertion ----------------------------------------------------------

    /// Add a blob; returns its digest. A digest only becomes visible once the
    /// bytes are durably written and hashed.
    pub fn add_blob(&self, bytes: &[u8]) -> Result<Digest> {
        let digest = Digest::new(kiln_keys::hash_bytes(bytes), bytes.len() as u64);
        if self.contains(&digest) {
            self.touch(&digest);
            return Ok(digest);
        }

        let tmp = tempfile::NamedTempFile::new_in(self.tmpdir())
            .map_err(|e| Error::io(ErrorKind::Cas, "failed to create temp object", &e))?;
        tmp.as_file()
            .write_all(bytes)
            .map_err(|e| Error::io(ErrorKind::Cas, "failed to write temp object", &e))?;
        self.commit(tmp, &digest)?;
        Ok(digest)
    }

    /// Add the content of a file on disk.
    pub fn add_file(&self, path: &Path) -> Result<Digest> {
        let file = File::open(path).map_err(|e| {
            Error::io(
                ErrorKind::Cas,
                format!("failed to open {}", path.display()),
                &e,
            )
        })?;
        let mut reader = BufReader::new(file);
        let mut hasher = Sha256::new();
        let mut size: u64 = 0;
        let mut buf = [0u8; 64 * 1024];
        loop {
            let n = reader
                .read(&mut buf)
                .map_err(|e| Error::io(ErrorKind::Cas, "failed to read file", &e))?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            size += n as u64;
        }
        let digest = Digest::new(hex::encode(hasher.finalize()), size);
        if self.contains(&digest) {
            self.touch(&digest);
            return Ok(digest);
        }

        let tmp = tempfile::NamedTempFile::new_in(self.tmpdir())
            .map_err(|e| Error::io(ErrorKind::Cas, "failed to create temp object", &e))?;
        fs::copy(path, tmp.path())
            .map_err(|e| Error::io(ErrorKind::Cas, "failed to copy file into store", &e))?;
        self.commit(tmp, &digest)?;
        Ok(digest)
    }

    /// Add several files; digests are returned in argument order.
    pub fn add_objects(&self, paths: &[PathBuf]) -> Result<Vec<Digest>> {
        paths.iter().map(|p| self.add_file(p)).collect()
    }

    /// Serialize and store a directory node.
    pub fn add_directory(&self, dir: &proto::Directory) -> Result<Digest> {
        let bytes = serde_json::to_vec(dir).map_err(|e| {
            Error::new(
                ErrorKind::Cas,
                "encode-failed",
                format!("failed to encode directory: {}", e),
            )
        })?;
        self.add_blob(&bytes)
    }

    fn commit(&self, tmp: tempfile::NamedTempFile, digest: &Digest) -> Result<()> {
        let dest = self.objpath(digest);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| Error::io(ErrorKind::Cas, "failed to create object dir", &e))?;
        }
        // Equal content racing here is harmless: both temp files hold the
        // same bytes and the last rename wins.
        tmp.persist(&dest).map_err(|e| {
            Error::new(
                ErrorKind::Cas,
                "io",
                format!("failed to commit object {}: {}", digest, e.error),
            )
        })?;
        Ok(())
    }

    // -- queries ------------------------------------------------------------

    /// Whether a blob is present locally with the advertised size.
    pub fn contains(&self, digest: &Digest) -> bool {
        match fs::metadata(self.objpath(digest)) {
            Ok(meta) => meta.len() == digest.size_bytes,
            Err(_) => false,
        }
    }

    /// Whether every listed blob is present locally.
    pub fn contains_files(&self, digests: &[Digest]) -> bool {
        digests.iter().all(|d| self.contains(d))
    }

    /// Whether a directory is fully cached: every descendant directory blob
    /// is present, and with `with_files` every descendant file blob too.
    pub fn contains_directory(&self, digest: &Digest, with_files: bool) -> Result<bool> {
        if !self.contains(digest) {
            return Ok(false);
        }
        let dir = self.read_directory(digest)?;
        if with_files {
            for file in &dir.files {
                if !self.contains(&file.digest) {
                    return Ok(false);
                }
            }
        }
        for sub in &dir.directories {
            if !self.contains_directory(&sub.digest, with_files)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Open a blob for reading. The size is checked; content verification
    /// happens in [`CasCache::read_blob`].
    pub fn open(&self, digest: &Digest) -> Result<File> {
        let path = self.objpath(digest);
        let file = File::open(&path).map_err(|_| missing(digest))?;
        let meta = file
            .metadata()
            .map_err(|e| Error::io(ErrorKind::Cas, "failed to stat object", &e))?;
        if meta.len() != digest.size_bytes {
            return Err(mismatch(digest, "size"));
        }
        self.touch(digest);
        Ok(file)
    }

    /// Read and verify a blob. A hash mismatch reports corruption so callers
    /// can refetch.
    pub fn read_blob(&self, digest: &Digest) -> Result<Vec<u8>> {
        let mut file = self.open(digest)?;
        let mut bytes = Vec::with_capacity(digest.size_bytes as usize);
        file.read_to_end(&mut bytes)
            .map_err(|e| Error::io(ErrorKind::Cas, "failed to read object", &e))?;
        if kiln_keys::hash_bytes(&bytes) != digest.hash {
            return Err(mismatch(digest, "hash"));
        }
        Ok(bytes)
    }

    /// Read and parse a directory node.
    pub fn read_directory(&self, digest: &Digest) -> Result<proto::Directory> {
        let bytes = self.read_blob(digest)?;
        serde_json::from_slice(&bytes).map_err(|e| {
            Error::new(
                ErrorKind::Cas,
                "decode-failed",
                format!("object {} is not a directory: {}", digest, e),
            )
        })
    }

    // -- session protection and eviction ------------------------------------

    /// Protect a digest from eviction for the rest of the session.
    pub fn protect(&self, digest: &Digest) {
        let mut protected = self.protected.lock().unwrap_or_else(|e| e.into_inner());
        protected.insert(digest.hash.clone());
    }

    /// Protect an entire directory closure.
    pub fn protect_directory(&self, digest: &Digest) -> Result<()> {
        for d in tree::walk_blobs(self, digest)? {
            self.protect(&d);
        }
        self.protect(digest);
        Ok(())
    }

    /// Total bytes in the object store.
    pub fn size(&self) -> Result<u64> {
        let mut total = 0;
        for entry in list_objects(&self.root)? {
            total += entry.size;
        }
        Ok(total)
    }

    /// Evict least-recently-used objects until the store fits in
    /// `quota_bytes`. Protected content is never evicted; if the quota cannot
    /// be met the error reports exhaustion.
    pub fn evict_to_quota(&self, quota_bytes: u64) -> Result<u64> {
        let lock_path = self.root.join(LOCK_FILE);
        let lock_file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)
            .map_err(|e| Error::io(ErrorKind::Cas, "failed to open store lock", &e))?;
        let mut lock = fd_lock::RwLock::new(lock_file);
        let _guard = lock
            .write()
            .map_err(|e| Error::io(ErrorKind::Cas, "failed to lock store", &e))?;

        let mut entries = list_objects(&self.root)?;
        entries.sort_by_key(|e| e.mtime);

        let mut total: u64 = entries.iter().map(|e| e.size).sum();
        let protected = {
            let guard = self.protected.lock().unwrap_or_else(|e| e.into_inner());
            guard.clone()
        };

        for entry in entries {
            if total <= quota_bytes {
                break;
            }
            if protected.contains(&entry.hash) {
                continue;
            }
            match fs::remove_file(&entry.path) {
                Ok(()) => total = total.saturating_sub(entry.size),
                Err(_) => continue,
            }
        }

        if total > quota_bytes {
            return Err(Error::new(
                ErrorKind::Cas,
                "quota-exhausted",
                format!(
                    "cannot reduce store below quota: {} bytes in use, {} allowed",
                    total, quota_bytes
                ),
            ));
        }
        Ok(total)
    }

    /// Refresh an object's recency for LRU accounting. Best-effort.
    fn touch(&self, digest: &Digest) {
        if let Ok(file) = File::open(self.objpath(digest)) {
            let _ = file.set_modified(SystemTime::now());
        }
    }
}

fn missing(digest: &Digest) -> Error {
    Error::new(
        ErrorKind::Cas,
        "blob-missing",
        format!("blob {} is not in the local store", digest),
    )
}

fn mismatch(digest: &Digest, what: &str) -> Error {
    Error::new(
        ErrorKind::Cas,
        "digest-mismatch",
        format!("blob {} failed {} verification", digest, what),
    )
}

struct ObjectEntry {
    hash: String,
    path: PathBuf,
    size: u64,
    mtime: SystemTime,
}

fn list_objects(root: &Path) -> Result<Vec<ObjectEntry>> {
    let mut out = Vec::new();
    let objects = root.join(OBJECTS_DIR);
    let prefixes = fs::read_dir(&objects)
        .map_err(|e| Error::io(ErrorKind::Cas, "failed to list store", &e))?;
    for prefix in prefixes.flatten() {
        let prefix_name = prefix.file_name().to_string_lossy().into_owned();
        let Ok(entries) = fs::read_dir(prefix.path()) else {
            continue;
        };
        for entry in entries.flatten() {
            let Ok(meta) = entry.metadata() else {
                continue;
            };
            let rest = entry.file_name().to_string_lossy().into_owned();
            out.push(ObjectEntry {
                hash: format!("{}{}", prefix_name, rest),
                path: entry.path(),
                size: meta.len(),
                mtime: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            });
        }
    }
    Ok(out)
}
