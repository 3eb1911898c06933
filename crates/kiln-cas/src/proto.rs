//! Remote Execution API message types.
//!
//! The subset of REAPI v2 messages kiln exchanges with remote caches and
//! execution services, modeled as native serde types. Digest hashes are
//! sha256, lower-hex, 64 characters.

use serde::{Deserialize, Serialize};

pub use kiln_types::Digest;

/// A single file in a [`Directory`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileNode {
    pub name: String,
    pub digest: Digest,
    #[serde(default)]
    pub is_executable: bool,
}

/// A subdirectory entry in a [`Directory`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryNode {
    pub name: String,
    pub digest: Digest,
}

/// A symbolic link in a [`Directory`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SymlinkNode {
    pub name: String,
    pub target: String,
}

/// A directory node in the Merkle tree. Entries are sorted by name within
/// each list so equal directories share digests.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Directory {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<FileNode>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub directories: Vec<DirectoryNode>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub symlinks: Vec<SymlinkNode>,
}

/// An environment variable for a [`Command`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentVariable {
    pub name: String,
    pub value: String,
}

/// A platform property requirement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformProperty {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Platform {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub properties: Vec<PlatformProperty>,
}

/// The command an [`Action`] executes.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Command {
    pub arguments: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub environment_variables: Vec<EnvironmentVariable>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub output_paths: Vec<String>,
    #[serde(default)]
    pub working_directory: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<Platform>,
}

/// The unit of remote execution: a command plus an input root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Action {
    pub command_digest: Digest,
    pub input_root_digest: Digest,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
    #[serde(default)]
    pub do_not_cache: bool,
}

/// An output file reported by an [`ActionResult`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputFile {
    pub path: String,
    pub digest: Digest,
    #[serde(default)]
    pub is_executable: bool,
}

/// An output directory reported by an [`ActionResult`], addressed by the
/// digest of its root [`Directory`]; the closure is fetched via `GetTree`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputDirectory {
    pub path: String,
    pub tree_digest: Digest,
}

/// The result of executing an [`Action`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ActionResult {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub output_files: Vec<OutputFile>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub output_directories: Vec<OutputDirectory>,
    #[serde(default)]
    pub exit_code: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdout_digest: Option<Digest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stderr_digest: Option<Digest>,
}

// ---------------------------------------------------------------------------
// RPC request/response bodies
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FindMissingBlobsRequest {
    pub blob_digests: Vec<Digest>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FindMissingBlobsResponse {
    #[serde(default)]
    pub missing_blob_digests: Vec<Digest>,
}

/// A blob payload for batch upload; `data` is base64-encoded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchBlob {
    pub digest: Digest,
    pub data: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchUpdateBlobsRequest {
    pub requests: Vec<BatchBlob>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchBlobStatus {
    pub digest: Digest,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<RpcStatus>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchUpdateBlobsResponse {
    #[serde(default)]
    pub responses: Vec<BatchBlobStatus>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchReadBlobsRequest {
    pub digests: Vec<Digest>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchReadBlobsResponse {
    #[serde(default)]
    pub responses: Vec<BatchBlob>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetTreeRequest {
    pub root_digest: Digest,
    /// Continuation token from a previous page; empty on the first call.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub page_token: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GetTreeResponse {
    #[serde(default)]
    pub directories: Vec<Directory>,
    /// Set when further pages remain; empty on the last page.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub next_page_token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetActionResultRequest {
    pub action_digest: Digest,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteRequest {
    pub action_digest: Digest,
    #[serde(default)]
    pub skip_cache_lookup: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WaitExecutionRequest {
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelOperationRequest {
    pub name: String,
}

/// Remote Asset-style lookup: resolve a symbolic name to a blob digest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchAssetRequest {
    pub name: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FetchAssetResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blob_digest: Option<Digest>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushAssetRequest {
    pub name: String,
    pub blob_digest: Digest,
}

/// gRPC-style status carried in operation and batch responses.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RpcStatus {
    #[serde(default)]
    pub code: i32,
    #[serde(default)]
    pub message: String,
}

/// gRPC status codes kiln reacts to.
pub mod code {
    pub const OK: i32 = 0;
    pub const CANCELLED: i32 = 1;
    pub const NOT_FOUND: i32 = 5;
    pub const UNIMPLEMENTED: i32 = 12;
    pub const UNAVAILABLE: i32 = 14;
    pub const DEADLINE_EXCEEDED: i32 = 4;
}

/// The response body of a finished execute operation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecuteResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<ActionResult>,
    #[serde(default)]
    pub cached_result: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<RpcStatus>,
}

/// A long-running execute operation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Operation {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub done: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<ExecuteResponse>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directory_serialization_skips_empty_lists() {
        let dir = Directory::default();
        let json = serde_json::to_string(&dir).expect("json");
        assert_eq!(json, "{}");
    }

    #[test]
    fn directory_roundtrips() {
        let dir = Directory {
            files: vec![FileNode {
                name: "hello".into(),
                digest: Digest::new("ab".repeat(32), 5),
                is_executable: true,
            }],
            directories: vec![],
            symlinks: vec![SymlinkNode {
                name: "link".into(),
                target: "hello".into(),
            }],
        };
        let json = serde_json::to_string(&dir).expect("json");
        let back: Directory = serde_json::from_str(&json).expect("parse");
        assert_eq!(back, dir);
    }

    #[test]
    fn operation_parses_with_missing_optionals() {
        let op: Operation = serde_json::from_str(r#"{"name":"ops/1"}"#).expect("parse");
        assert_eq!(op.name, "ops/1");
        assert!(!op.done);
        assert!(op.response.is_none());
    }

    #[test]
    fn get_tree_request_omits_empty_page_token() {
        let first = GetTreeRequest {
            root_digest: Digest::new("cd".repeat(32), 9),
            page_token: String::new(),
        };
        let json = serde_json::to_value(&first).expect("json");
        assert!(json.get("page_token").is_none());

        let next = GetTreeRequest {
            page_token: "page-2".to_string(),
            ..first
        };
        let json = serde_json::to_value(&next).expect("json");
        assert_eq!(json["page_token"], "page-2");
    }

    #[test]
    fn get_tree_response_parses_with_and_without_continuation() {
        let last: GetTreeResponse = serde_json::from_str(r#"{"directories":[{}]}"#).expect("parse");
        assert_eq!(last.directories.len(), 1);
        assert!(last.next_page_token.is_empty());

        let more: GetTreeResponse =
            serde_json::from_str(r#"{"directories":[{}],"next_page_token":"page-2"}"#)
                .expect("parse");
        assert_eq!(more.next_page_token, "page-2");
    }
}
