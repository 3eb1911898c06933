//! The versioned Artifact proto and its naming scheme.
//!
//! An artifact is one element's cached build result under one cache key:
//! a small serialized proto whose fields point into CAS. Artifacts are
//! written atomically and immutable thereafter.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use kiln_cas::CasCache;
use kiln_types::Digest;

/// Bumping this invalidates every artifact.
pub const CORE_ARTIFACT_VERSION: u32 = 1;

/// A named build log blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogFile {
    pub name: String,
    pub digest: Digest,
}

/// The cache key of one build dependency, as recorded in an artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildDepRecord {
    pub project: String,
    pub name: String,
    pub key: String,
    #[serde(default)]
    pub was_workspaced: bool,
}

/// The artifact proto.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    /// Proto format version.
    pub version: u32,
    pub strong_key: String,
    pub strict_key: String,
    pub weak_key: String,
    pub build_success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_error_details: Option<String>,
    /// The installed file tree.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub files: Option<Digest>,
    /// The build area root, when captured.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub buildroot: Option<Digest>,
    /// The build tree, when captured.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub buildtree: Option<Digest>,
    /// The staged sources the build consumed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sources: Option<Digest>,
    /// The element's public data, as a blob.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_data: Option<Digest>,
    /// `{environment, sandbox-config}`; deduplicates across elements.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub low_diversity_meta: Option<Digest>,
    /// `{variables}`; varies per element.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub high_diversity_meta: Option<Digest>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub logs: Vec<LogFile>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub build_deps: Vec<BuildDepRecord>,
    #[serde(default)]
    pub was_workspaced: bool,
}

impl Artifact {
    /// Tainted artifacts were produced from a workspaced element or with a
    /// workspaced dependency in their closure; they are never shared.
    pub fn tainted(&self) -> bool {
        self.was_workspaced || self.build_deps.iter().any(|d| d.was_workspaced)
    }

    /// An artifact counts as cached only when `files`, `public_data`, both
    /// meta blobs and all log blobs are locally present. The buildtree is
    /// optional unless explicitly required.
    pub fn is_complete(&self, cas: &CasCache, require_buildtree: bool) -> bool {
        if let Some(files) = &self.files
            && !cas.contains_directory(files, true).unwrap_or(false)
        {
            return false;
        }
        for blob in [
            &self.public_data,
            &self.low_diversity_meta,
            &self.high_diversity_meta,
        ]
        .into_iter()
        .flatten()
        {
            if !cas.contains(blob) {
                return false;
            }
        }
        for log in &self.logs {
            if !cas.contains(&log.digest) {
                return false;
            }
        }
        if require_buildtree
            && let Some(buildtree) = &self.buildtree
            && !cas.contains_directory(buildtree, true).unwrap_or(false)
        {
            return false;
        }
        true
    }
}

/// The element name without path separators or extension: separators become
/// `-`, anything outside `[0-9A-Za-z._-]` becomes `_`.
pub fn normal_name(element_name: &str) -> String {
    let stem = element_name
        .rsplit_once('.')
        .map(|(stem, _ext)| stem)
        .unwrap_or(element_name);
    stem.chars()
        .map(|c| match c {
            '/' | '\\' => '-',
            c if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') => c,
            _ => '_',
        })
        .collect()
}

/// Relative ref path for an artifact: `<project>/<normal_name>/<key>`.
pub fn ref_path(project: &str, element_name: &str, key: &str) -> PathBuf {
    PathBuf::from(project)
        .join(normal_name(element_name))
        .join(key)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tempfile::tempdir;

    use super::*;

    fn blank(strong: &str) -> Artifact {
        Artifact {
            version: CORE_ARTIFACT_VERSION,
            strong_key: strong.to_string(),
            strict_key: strong.to_string(),
            weak_key: strong.to_string(),
            build_success: true,
            build_error: None,
            build_error_details: None,
            files: None,
            buildroot: None,
            buildtree: None,
            sources: None,
            public_data: None,
            low_diversity_meta: None,
            high_diversity_meta: None,
            logs: vec![],
            build_deps: vec![],
            was_workspaced: false,
        }
    }

    #[test]
    fn normal_name_replaces_separators_and_strips_extension() {
        assert_eq!(normal_name("core/tools/gcc.bst"), "core-tools-gcc");
        assert_eq!(normal_name("hello.bst"), "hello");
        assert_eq!(normal_name("plain"), "plain");
    }

    #[test]
    fn normal_name_replaces_exotic_characters() {
        assert_eq!(normal_name("we ird$name.bst"), "we_ird_name");
        insta::assert_snapshot!(
            normal_name("deep/path/to/weird name.bst"),
            @"deep-path-to-weird_name"
        );
    }

    #[test]
    fn ref_path_has_three_components() {
        let path = ref_path("myproject", "core/hello.bst", &"ab".repeat(32));
        assert_eq!(
            path,
            PathBuf::from("myproject")
                .join("core-hello")
                .join("ab".repeat(32))
        );
    }

    #[test]
    fn taint_propagates_from_build_deps() {
        let mut artifact = blank(&"11".repeat(32));
        assert!(!artifact.tainted());

        artifact.build_deps.push(BuildDepRecord {
            project: "p".into(),
            name: "dep.bst".into(),
            key: "22".repeat(32),
            was_workspaced: true,
        });
        assert!(artifact.tainted());

        let mut own = blank(&"33".repeat(32));
        own.was_workspaced = true;
        assert!(own.tainted());
    }

    #[test]
    fn completeness_requires_all_referenced_blobs() {
        let td = tempdir().expect("tempdir");
        let cas = Arc::new(CasCache::new(td.path()).expect("cas"));

        let mut artifact = blank(&"44".repeat(32));
        assert!(artifact.is_complete(&cas, false));

        let public = cas.add_blob(b"{}").expect("add");
        artifact.public_data = Some(public);
        assert!(artifact.is_complete(&cas, false));

        artifact.logs.push(LogFile {
            name: "build.log".into(),
            digest: Digest::new("55".repeat(32), 10),
        });
        assert!(!artifact.is_complete(&cas, false));
    }

    #[test]
    fn buildtree_only_matters_when_required() {
        let td = tempdir().expect("tempdir");
        let cas = Arc::new(CasCache::new(td.path()).expect("cas"));

        let mut artifact = blank(&"66".repeat(32));
        artifact.buildtree = Some(Digest::new("77".repeat(32), 9));
        assert!(artifact.is_complete(&cas, false));
        assert!(!artifact.is_complete(&cas, true));
    }

    #[test]
    fn proto_roundtrips_through_json() {
        let artifact = blank(&"88".repeat(32));
        let json = serde_json::to_string(&artifact).expect("encode");
        let back: Artifact = serde_json::from_str(&json).expect("decode");
        assert_eq!(back.strong_key, artifact.strong_key);
        assert_eq!(back.build_success, artifact.build_success);
        assert!(back.logs.is_empty());
    }
}
