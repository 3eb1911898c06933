//! Merkle directory import, checkout and closure walks.
//!
//! A filesystem tree is imported bottom-up: file blobs first, then one
//! [`proto::Directory`] blob per directory with entries sorted by name, so
//! equal trees always produce equal digests. Checkouts apply a fixed
//! timestamp to keep staged trees byte-for-byte reproducible.

use std::fs;
use std::path::Path;
use std::time::{Duration, SystemTime};

use kiln_types::{Digest, Error, ErrorKind, Result};

use crate::proto::{Directory, DirectoryNode, FileNode, SymlinkNode};
use crate::CasCache;

/// Fixed timestamp applied to checked-out files (2011-11-11 11:11:11 UTC).
pub const ARBITRARY_TIMESTAMP: u64 = 1_321_009_871;

/// The outcome of staging a directory into a possibly non-empty root.
///
/// `files_written` and `overwritten` are staging-root-relative paths;
/// `ignored` lists files that were skipped because they would have replaced
/// a non-empty directory.
#[derive(Debug, Clone, Default)]
pub struct FileListResult {
    pub files_written: Vec<String>,
    pub overwritten: Vec<String>,
    pub ignored: Vec<String>,
}

/// A staged checkout in a scoped temporary directory. The directory is
/// removed on drop.
#[derive(Debug)]
pub struct StagedDirectory {
    dir: tempfile::TempDir,
}

impl StagedDirectory {
    pub fn path(&self) -> &Path {
        self.dir.path()
    }
}

/// Import a filesystem tree into the store; returns the root directory
/// digest.
pub fn import_tree(cas: &CasCache, dir: &Path) -> Result<Digest> {
    let directory = import_directory(cas, dir)?;
    cas.add_directory(&directory)
}

fn import_directory(cas: &CasCache, dir: &Path) -> Result<Directory> {
    let mut names: Vec<(String, std::path::PathBuf)> = Vec::new();
    let entries = fs::read_dir(dir).map_err(|e| {
        Error::io(
            ErrorKind::Cas,
            format!("failed to list {}", dir.display()),
            &e,
        )
    })?;
    for entry in entries {
        let entry =
            entry.map_err(|e| Error::io(ErrorKind::Cas, "failed to read dir entry", &e))?;
        names.push((entry.file_name().to_string_lossy().into_owned(), entry.path()));
    }
    names.sort();

    let mut directory = Directory::default();
    for (name, path) in names {
        let meta = fs::symlink_metadata(&path).map_err(|e| {
            Error::io(
                ErrorKind::Cas,
                format!("failed to stat {}", path.display()),
                &e,
            )
        })?;
        if meta.file_type().is_symlink() {
            let target = fs::read_link(&path)
                .map_err(|e| Error::io(ErrorKind::Cas, "failed to read symlink", &e))?;
            directory.symlinks.push(SymlinkNode {
                name,
                target: target.to_string_lossy().into_owned(),
            });
        } else if meta.is_dir() {
            let sub = import_directory(cas, &path)?;
            let digest = cas.add_directory(&sub)?;
            directory.directories.push(DirectoryNode { name, digest });
        } else {
            let digest = cas.add_file(&path)?;
            directory.files.push(FileNode {
                name,
                digest,
                is_executable: is_executable(&meta),
            });
        }
    }
    Ok(directory)
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

/// Check out a directory digest into an empty destination.
pub fn checkout(cas: &CasCache, digest: &Digest, dest: &Path) -> Result<()> {
    fs::create_dir_all(dest)
        .map_err(|e| Error::io(ErrorKind::Cas, "failed to create checkout dir", &e))?;
    let mut result = FileListResult::default();
    stage_into(cas, digest, dest, dest, &mut result)
}

/// Check out a directory digest into a scoped temporary directory under the
/// store's tmp area.
pub fn stage_directory(cas: &CasCache, digest: &Digest) -> Result<StagedDirectory> {
    let dir = tempfile::TempDir::new_in(cas.tmpdir())
        .map_err(|e| Error::io(ErrorKind::Cas, "failed to create staging dir", &e))?;
    let mut result = FileListResult::default();
    stage_into(cas, digest, dir.path(), dir.path(), &mut result)?;
    Ok(StagedDirectory { dir })
}

/// Stage a directory digest into a possibly non-empty root, recording
/// written, overwritten and ignored files.
pub fn checkout_tracked(cas: &CasCache, digest: &Digest, dest: &Path) -> Result<FileListResult> {
    fs::create_dir_all(dest)
        .map_err(|e| Error::io(ErrorKind::Cas, "failed to create staging root", &e))?;
    let mut result = FileListResult::default();
    stage_into(cas, digest, dest, dest, &mut result)?;
    Ok(result)
}

fn stage_into(
    cas: &CasCache,
    digest: &Digest,
    root: &Path,
    dest: &Path,
    result: &mut FileListResult,
) -> Result<()> {
    let directory = cas.read_directory(digest)?;

    for file in &directory.files {
        let target = dest.join(&file.name);
        let rel = relative(root, &target);
        if target.is_dir() {
            if fs::remove_dir(&target).is_err() {
                // Non-empty directory in the way: skip the file.
                result.ignored.push(rel);
                continue;
            }
            result.overwritten.push(rel.clone());
        } else if target.symlink_metadata().is_ok() {
            fs::remove_file(&target)
                .map_err(|e| Error::io(ErrorKind::Cas, "failed to replace staged file", &e))?;
            result.overwritten.push(rel.clone());
        }
        write_file(cas, file, &target)?;
        result.files_written.push(rel);
    }

    for link in &directory.symlinks {
        let target = dest.join(&link.name);
        let rel = relative(root, &target);
        if target.symlink_metadata().is_ok() {
            if target.is_dir() && fs::remove_dir(&target).is_err() {
                result.ignored.push(rel);
                continue;
            }
            let _ = fs::remove_file(&target);
            result.overwritten.push(rel.clone());
        }
        make_symlink(&link.target, &target)?;
        result.files_written.push(rel);
    }

    for sub in &directory.directories {
        let target = dest.join(&sub.name);
        if !target.is_dir() {
            if target.symlink_metadata().is_ok() {
                fs::remove_file(&target)
                    .map_err(|e| Error::io(ErrorKind::Cas, "failed to replace entry", &e))?;
                result.overwritten.push(relative(root, &target));
            }
            fs::create_dir_all(&target)
                .map_err(|e| Error::io(ErrorKind::Cas, "failed to create subdir", &e))?;
        }
        stage_into(cas, &sub.digest, root, &target, result)?;
    }

    Ok(())
}

fn write_file(cas: &CasCache, file: &FileNode, target: &Path) -> Result<()> {
    let bytes = cas.read_blob(&file.digest)?;
    fs::write(target, bytes).map_err(|e| {
        Error::io(
            ErrorKind::Cas,
            format!("failed to write {}", target.display()),
            &e,
        )
    })?;

    #[cfg(unix)]
    if file.is_executable {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(target, fs::Permissions::from_mode(0o755))
            .map_err(|e| Error::io(ErrorKind::Cas, "failed to set permissions", &e))?;
    }

    let mtime = SystemTime::UNIX_EPOCH + Duration::from_secs(ARBITRARY_TIMESTAMP);
    if let Ok(f) = fs::File::open(target) {
        let _ = f.set_modified(mtime);
    }
    Ok(())
}

#[cfg(unix)]
fn make_symlink(target: &str, path: &Path) -> Result<()> {
    std::os::unix::fs::symlink(target, path)
        .map_err(|e| Error::io(ErrorKind::Cas, "failed to create symlink", &e))
}

#[cfg(not(unix))]
fn make_symlink(_target: &str, path: &Path) -> Result<()> {
    Err(Error::new(
        ErrorKind::Cas,
        "unsupported",
        format!("symlinks are not supported here: {}", path.display()),
    ))
}

fn relative(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .to_string_lossy()
        .into_owned()
}

/// Digest of the subdirectory at `path` below `root`, or `None` when the
/// path does not name a directory. An empty path returns the root itself.
pub fn subdir_digest(cas: &CasCache, root: &Digest, path: &str) -> Result<Option<Digest>> {
    let mut current = root.clone();
    for segment in path.split('/').filter(|s| !s.is_empty()) {
        let directory = cas.read_directory(&current)?;
        match directory.directories.iter().find(|d| d.name == segment) {
            Some(node) => current = node.digest.clone(),
            None => return Ok(None),
        }
    }
    Ok(Some(current))
}

/// The digest of the empty directory, inserting it if needed.
pub fn empty_digest(cas: &CasCache) -> Result<Digest> {
    cas.add_directory(&Directory::default())
}

/// Every blob a directory references, recursively: file blobs and
/// subdirectory blobs. The root digest itself is not included.
pub fn walk_blobs(cas: &CasCache, digest: &Digest) -> Result<Vec<Digest>> {
    let mut out = Vec::new();
    collect_blobs(cas, digest, &mut out)?;
    Ok(out)
}

fn collect_blobs(cas: &CasCache, digest: &Digest, out: &mut Vec<Digest>) -> Result<()> {
    let directory = cas.read_directory(digest)?;
    for file in &directory.files {
        out.push(file.digest.clone());
    }
    for sub in &directory.directories {
        out.push(sub.digest.clone());
        collect_blobs(cas, &sub.digest, out)?;
    }
    Ok(())
}

/// All file paths under a directory digest, root-relative, in walk order.
pub fn list_files(cas: &CasCache, digest: &Digest) -> Result<Vec<String>> {
    let mut out = Vec::new();
    collect_files(cas, digest, "", &mut out)?;
    Ok(out)
}

fn collect_files(cas: &CasCache, digest: &Digest, prefix: &str, out: &mut Vec<String>) -> Result<()> {
    let directory = cas.read_directory(digest)?;
    for file in &directory.files {
        out.push(join(prefix, &file.name));
    }
    for link in &directory.symlinks {
        out.push(join(prefix, &link.name));
    }
    for sub in &directory.directories {
        collect_files(cas, &sub.digest, &join(prefix, &sub.name), out)?;
    }
    Ok(())
}

fn join(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", prefix, name)
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::tempdir;

    use super::*;

    fn write(path: &Path, content: &str) {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("mkdir");
        }
        fs::write(path, content).expect("write");
    }

    #[test]
    fn import_then_checkout_roundtrips() {
        let td = tempdir().expect("tempdir");
        let cas = CasCache::new(td.path().join("store")).expect("store");

        let src = td.path().join("src");
        write(&src.join("hello.txt"), "hello");
        write(&src.join("bin/run.sh"), "#!/bin/sh\n");
        write(&src.join("docs/a/deep.md"), "# deep");

        let digest = import_tree(&cas, &src).expect("import");

        let dest = td.path().join("dest");
        checkout(&cas, &digest, &dest).expect("checkout");

        assert_eq!(fs::read_to_string(dest.join("hello.txt")).expect("read"), "hello");
        assert_eq!(
            fs::read_to_string(dest.join("docs/a/deep.md")).expect("read"),
            "# deep"
        );
    }

    #[test]
    fn equal_trees_share_digests() {
        let td = tempdir().expect("tempdir");
        let cas = CasCache::new(td.path().join("store")).expect("store");

        let a = td.path().join("a");
        let b = td.path().join("b");
        for root in [&a, &b] {
            write(&root.join("x.txt"), "same content");
            write(&root.join("sub/y.txt"), "more");
        }

        let da = import_tree(&cas, &a).expect("import a");
        let db = import_tree(&cas, &b).expect("import b");
        assert_eq!(da, db);
    }

    #[test]
    fn entry_order_is_name_sorted_not_fs_ordered() {
        let td = tempdir().expect("tempdir");
        let cas = CasCache::new(td.path().join("store")).expect("store");

        let src = td.path().join("src");
        write(&src.join("zzz.txt"), "z");
        write(&src.join("aaa.txt"), "a");

        let digest = import_tree(&cas, &src).expect("import");
        let dir = cas.read_directory(&digest).expect("read");
        let names: Vec<&str> = dir.files.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["aaa.txt", "zzz.txt"]);
    }

    #[test]
    fn contains_directory_checks_closure() {
        let td = tempdir().expect("tempdir");
        let cas = CasCache::new(td.path().join("store")).expect("store");

        let src = td.path().join("src");
        write(&src.join("f.txt"), "payload");
        let digest = import_tree(&cas, &src).expect("import");

        assert!(cas.contains_directory(&digest, true).expect("contains"));

        // Remove the file blob; the directory is no longer fully cached.
        let dir = cas.read_directory(&digest).expect("read");
        fs::remove_file(cas.objpath(&dir.files[0].digest)).expect("remove");
        assert!(!cas.contains_directory(&digest, true).expect("contains"));
        assert!(cas.contains_directory(&digest, false).expect("contains"));
    }

    #[test]
    fn tracked_checkout_reports_overwrites_and_ignores() {
        let td = tempdir().expect("tempdir");
        let cas = CasCache::new(td.path().join("store")).expect("store");

        let src = td.path().join("src");
        write(&src.join("shared.txt"), "new");
        write(&src.join("blocked"), "file where dir lives");
        let digest = import_tree(&cas, &src).expect("import");

        let dest = td.path().join("dest");
        write(&dest.join("shared.txt"), "old");
        write(&dest.join("blocked/inner.txt"), "keep me");

        let result = checkout_tracked(&cas, &digest, &dest).expect("stage");
        assert_eq!(result.overwritten, vec!["shared.txt".to_string()]);
        assert_eq!(result.ignored, vec!["blocked".to_string()]);
        assert!(result.files_written.contains(&"shared.txt".to_string()));
        assert_eq!(
            fs::read_to_string(dest.join("blocked/inner.txt")).expect("read"),
            "keep me"
        );
    }

    #[test]
    fn walk_blobs_covers_the_closure() {
        let td = tempdir().expect("tempdir");
        let cas = CasCache::new(td.path().join("store")).expect("store");

        let src = td.path().join("src");
        write(&src.join("a.txt"), "a");
        write(&src.join("sub/b.txt"), "b");
        let digest = import_tree(&cas, &src).expect("import");

        let blobs = walk_blobs(&cas, &digest).expect("walk");
        // a.txt, sub directory node, b.txt
        assert_eq!(blobs.len(), 3);
        for blob in &blobs {
            assert!(cas.contains(blob));
        }
    }

    #[test]
    fn list_files_returns_relative_paths() {
        let td = tempdir().expect("tempdir");
        let cas = CasCache::new(td.path().join("store")).expect("store");

        let src = td.path().join("src");
        write(&src.join("top.txt"), "t");
        write(&src.join("usr/bin/foo"), "f");
        let digest = import_tree(&cas, &src).expect("import");

        let files = list_files(&cas, &digest).expect("list");
        assert!(files.contains(&"top.txt".to_string()));
        assert!(files.contains(&"usr/bin/foo".to_string()));
    }

    #[test]
    fn checkout_applies_fixed_timestamp() {
        let td = tempdir().expect("tempdir");
        let cas = CasCache::new(td.path().join("store")).expect("store");

        let src = td.path().join("src");
        write(&src.join("f.txt"), "content");
        let digest = import_tree(&cas, &src).expect("import");

        let dest = td.path().join("dest");
        checkout(&cas, &digest, &dest).expect("checkout");

        let mtime = fs::metadata(dest.join("f.txt"))
            .expect("meta")
            .modified()
            .expect("mtime");
        let expected = SystemTime::UNIX_EPOCH + Duration::from_secs(ARBITRARY_TIMESTAMP);
        assert_eq!(mtime, expected);
    }
}
