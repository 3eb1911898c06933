//! Core domain types shared across the kiln workspace.
//!
//! This crate defines the vocabulary the rest of kiln speaks:
//!
//! - [`Digest`] — the `(hash, size)` pair addressing a blob or directory in
//!   content-addressed storage.
//! - [`DepKind`] and [`Scope`] — typed dependency edges and traversal scopes
//!   over the element graph.
//! - [`RemoteSpec`] — a parsed remote cache/execution endpoint specification.
//! - [`Error`] / [`Result`] — the domain error carrying a machine-readable
//!   kind and reason, with transience as data rather than as a subclass.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Length of a sha256 hex digest, and therefore of every cache key.
pub const KEY_LENGTH: usize = 64;

/// A source reference: a plugin-chosen opaque scalar or nested list/map of
/// scalars that pins one source to one concrete version.
pub type SourceRef = serde_json::Value;

// ---------------------------------------------------------------------------
// Digest
// ---------------------------------------------------------------------------

/// Canonical identity for a blob or directory in CAS.
///
/// Two digests are equal iff the underlying bytes are equal.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Digest {
    /// Lower-case sha256 hex digest of the content.
    pub hash: String,
    /// Size of the content in bytes.
    pub size_bytes: u64,
}

impl Digest {
    pub fn new(hash: impl Into<String>, size_bytes: u64) -> Self {
        Self {
            hash: hash.into(),
            size_bytes,
        }
    }

    /// The digest of the empty blob is represented with an empty hash; it is
    /// never stored.
    pub fn is_valid(&self) -> bool {
        self.hash.len() == KEY_LENGTH
            && self
                .hash
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.hash, self.size_bytes)
    }
}

// ---------------------------------------------------------------------------
// Dependency typing
// ---------------------------------------------------------------------------

/// Bitmask describing how one element depends on another.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DepKind {
    /// Needed to build the dependent (staged into its sandbox).
    Build,
    /// Needed at runtime by the dependent.
    Runtime,
    /// Both build and runtime.
    All,
}

impl DepKind {
    pub fn is_build(self) -> bool {
        matches!(self, DepKind::Build | DepKind::All)
    }

    pub fn is_runtime(self) -> bool {
        matches!(self, DepKind::Runtime | DepKind::All)
    }
}

/// Traversal scope over the dependency graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scope {
    /// The element and all transitive dependencies of any kind.
    All,
    /// Build dependencies plus their run closures, excluding the element.
    Build,
    /// The element plus all transitive runtime dependencies.
    Run,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Machine-readable error domains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Malformed project data, missing project, invalid reference.
    Load,
    /// Blob missing, digest mismatch, quota exhausted.
    Cas,
    /// Network failure, auth failure, protocol error.
    Remote,
    /// Plugin-reported source error.
    Source,
    /// Command exit nonzero, sandbox setup failure, remote-exec error.
    Sandbox,
    /// Plugin-reported build-time error.
    Element,
    /// Staged file collision configured as fatal.
    Overlap,
    /// Missing inputs to compute a key; recoverable by waiting.
    CacheKey,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::Load => "load",
            ErrorKind::Cas => "cas",
            ErrorKind::Remote => "remote",
            ErrorKind::Source => "source",
            ErrorKind::Sandbox => "sandbox",
            ErrorKind::Element => "element",
            ErrorKind::Overlap => "overlap",
            ErrorKind::CacheKey => "cache-key",
        };
        f.write_str(s)
    }
}

/// The kiln domain error.
///
/// `reason` is a stable machine-readable token (e.g. `blob-missing`,
/// `overlaps`); `brief` is the one-line human summary; `detail` carries the
/// long-form context shown on demand. `temporary` marks errors worth
/// retrying with backoff.
#[derive(Debug, Clone, thiserror::Error, Serialize, Deserialize)]
#[error("[{kind}] {brief} ({reason})")]
pub struct Error {
    pub kind: ErrorKind,
    pub reason: String,
    pub brief: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(default)]
    pub temporary: bool,
    /// Element name the error was raised for, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub element: Option<String>,
}

impl Error {
    pub fn new(kind: ErrorKind, reason: impl Into<String>, brief: impl Into<String>) -> Self {
        Self {
            kind,
            reason: reason.into(),
            brief: brief.into(),
            detail: None,
            temporary: false,
            element: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn temporary(mut self) -> Self {
        self.temporary = true;
        self
    }

    pub fn for_element(mut self, element: impl Into<String>) -> Self {
        self.element = Some(element.into());
        self
    }

    /// Wrap an I/O failure in a domain error.
    pub fn io(kind: ErrorKind, brief: impl Into<String>, err: &std::io::Error) -> Self {
        Self::new(kind, "io", format!("{}: {}", brief.into(), err))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

// ---------------------------------------------------------------------------
// Remote specs
// ---------------------------------------------------------------------------

/// What services a remote provides.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteType {
    /// Index service only (artifact/source refs).
    Index,
    /// Storage service only (CAS blobs).
    Storage,
    /// Both index and storage.
    #[default]
    All,
    /// Remote execution endpoint.
    Endpoint,
}

impl fmt::Display for RemoteType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RemoteType::Index => "index",
            RemoteType::Storage => "storage",
            RemoteType::All => "all",
            RemoteType::Endpoint => "endpoint",
        };
        f.write_str(s)
    }
}

/// A parsed remote specification.
///
/// String syntax:
/// `url[,instance-name=NAME][,type=index|storage|all][,push=true|false]`
/// `[,server-cert=PATH][,client-key=PATH][,client-cert=PATH]`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RemoteSpec {
    pub url: String,
    #[serde(default)]
    pub remote_type: RemoteType,
    #[serde(default)]
    pub push: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_cert: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_key: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_cert: Option<PathBuf>,
}

impl RemoteSpec {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            remote_type: RemoteType::All,
            push: false,
            instance_name: None,
            server_cert: None,
            client_key: None,
            client_cert: None,
        }
    }

    /// Scheme of the url (`http`, `https`, `grpc`...).
    pub fn scheme(&self) -> &str {
        self.url.split("://").next().unwrap_or("")
    }

    /// Host and explicit port, applying the scheme defaults
    /// (`https` → 443, `http` → 80).
    pub fn host_port(&self) -> Result<(String, Option<u16>)> {
        let rest = self
            .url
            .split_once("://")
            .map(|(_, r)| r)
            .unwrap_or(self.url.as_str());
        let authority = rest.split('/').next().unwrap_or("");
        if authority.is_empty() {
            return Err(Error::new(
                ErrorKind::Load,
                "invalid-remote-url",
                format!("remote url has no host: {}", self.url),
            ));
        }
        match authority.rsplit_once(':') {
            Some((host, port)) => {
                let port: u16 = port.parse().map_err(|_| {
                    Error::new(
                        ErrorKind::Load,
                        "invalid-remote-url",
                        format!("invalid port in remote url: {}", self.url),
                    )
                })?;
                Ok((host.to_string(), Some(port)))
            }
            None => {
                let port = match self.scheme() {
                    "https" => Some(443),
                    "http" => Some(80),
                    _ => None,
                };
                Ok((authority.to_string(), port))
            }
        }
    }

    fn validate(&self) -> Result<()> {
        let scheme = self.scheme();
        if !matches!(scheme, "http" | "https") {
            return Err(Error::new(
                ErrorKind::Load,
                "invalid-remote-url",
                format!(
                    "only 'http' and 'https' protocols are supported, but '{}' was supplied",
                    scheme
                ),
            ));
        }
        if self.client_key.is_some() != self.client_cert.is_some() {
            return Err(Error::new(
                ErrorKind::Load,
                "invalid-remote-auth",
                "client-key and client-cert must be specified together",
            ));
        }
        if self.remote_type == RemoteType::Endpoint {
            let (_, port) = self.host_port()?;
            // Scheme defaults do not count for execution endpoints.
            let explicit = self
                .url
                .split_once("://")
                .map(|(_, r)| r)
                .unwrap_or(self.url.as_str())
                .split('/')
                .next()
                .unwrap_or("")
                .contains(':');
            if port.is_none() || !explicit {
                return Err(Error::new(
                    ErrorKind::Load,
                    "invalid-remote-url",
                    "remote execution endpoints must specify the port number, \
                     for example: http://buildservice:50051",
                ));
            }
        }
        Ok(())
    }

    /// Parse a spec string, with the given default remote type.
    pub fn parse_with_type(s: &str, default_type: RemoteType) -> Result<Self> {
        let mut parts = s.split(',');
        let url = parts.next().unwrap_or("").trim();
        if url.is_empty() {
            return Err(Error::new(
                ErrorKind::Load,
                "invalid-remote-spec",
                "empty remote specification",
            ));
        }
        let mut spec = RemoteSpec::new(url);
        spec.remote_type = default_type;

        for part in parts {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            let (key, value) = part.split_once('=').ok_or_else(|| {
                Error::new(
                    ErrorKind::Load,
                    "invalid-remote-spec",
                    format!("expected key=value in remote spec, got '{}'", part),
                )
            })?;
            match key {
                "instance-name" => spec.instance_name = Some(value.to_string()),
                "push" => {
                    spec.push = value.parse().map_err(|_| {
                        Error::new(
                            ErrorKind::Load,
                            "invalid-remote-spec",
                            format!("push must be true or false, got '{}'", value),
                        )
                    })?;
                }
                "type" => {
                    spec.remote_type = match value {
                        "index" => RemoteType::Index,
                        "storage" => RemoteType::Storage,
                        "all" => RemoteType::All,
                        other => {
                            return Err(Error::new(
                                ErrorKind::Load,
                                "invalid-remote-spec",
                                format!(
                                    "remote type must be one of index, storage, all; got '{}'",
                                    other
                                ),
                            ));
                        }
                    };
                }
                "server-cert" => spec.server_cert = Some(PathBuf::from(value)),
                "client-key" => spec.client_key = Some(PathBuf::from(value)),
                "client-cert" => spec.client_cert = Some(PathBuf::from(value)),
                other => {
                    return Err(Error::new(
                        ErrorKind::Load,
                        "invalid-remote-spec",
                        format!("unrecognized remote spec option '{}'", other),
                    ));
                }
            }
        }

        spec.validate()?;
        Ok(spec)
    }
}

impl FromStr for RemoteSpec {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse_with_type(s, RemoteType::All)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_display_includes_size() {
        let d = Digest::new("ab".repeat(32), 42);
        assert_eq!(d.to_string(), format!("{}/42", "ab".repeat(32)));
    }

    #[test]
    fn digest_validation_rejects_bad_hashes() {
        assert!(Digest::new("ab".repeat(32), 0).is_valid());
        assert!(!Digest::new("xyz", 0).is_valid());
        assert!(!Digest::new("AB".repeat(32), 0).is_valid());
        assert!(!Digest::new("g".repeat(64), 0).is_valid());
    }

    #[test]
    fn dep_kind_masks() {
        assert!(DepKind::Build.is_build());
        assert!(!DepKind::Build.is_runtime());
        assert!(DepKind::Runtime.is_runtime());
        assert!(!DepKind::Runtime.is_build());
        assert!(DepKind::All.is_build());
        assert!(DepKind::All.is_runtime());
    }

    #[test]
    fn error_display_has_kind_and_reason() {
        let e = Error::new(ErrorKind::Cas, "blob-missing", "blob not in local store");
        assert_eq!(e.to_string(), "[cas] blob not in local store (blob-missing)");
        assert!(!e.temporary);
        assert!(e.clone().temporary().temporary);
    }

    #[test]
    fn remote_spec_parses_bare_url() {
        let spec: RemoteSpec = "https://cache.example.com".parse().expect("spec");
        assert_eq!(spec.url, "https://cache.example.com");
        assert_eq!(spec.remote_type, RemoteType::All);
        assert!(!spec.push);
        assert_eq!(spec.host_port().expect("hp"), ("cache.example.com".into(), Some(443)));
    }

    #[test]
    fn remote_spec_parses_options() {
        let spec: RemoteSpec =
            "http://cache.example.com:8080,instance-name=main,type=storage,push=true"
                .parse()
                .expect("spec");
        assert_eq!(spec.instance_name.as_deref(), Some("main"));
        assert_eq!(spec.remote_type, RemoteType::Storage);
        assert!(spec.push);
        assert_eq!(spec.host_port().expect("hp").1, Some(8080));
    }

    #[test]
    fn remote_spec_rejects_unknown_scheme() {
        let err = "ftp://cache.example.com".parse::<RemoteSpec>().expect_err("err");
        assert_eq!(err.reason, "invalid-remote-url");
    }

    #[test]
    fn remote_spec_rejects_half_client_auth() {
        let err = "https://cache.example.com,client-key=/k.pem"
            .parse::<RemoteSpec>()
            .expect_err("err");
        assert_eq!(err.reason, "invalid-remote-auth");
    }

    #[test]
    fn remote_spec_endpoint_requires_explicit_port() {
        let err = RemoteSpec::parse_with_type("http://buildservice", RemoteType::Endpoint)
            .expect_err("err");
        assert!(err.brief.contains("port number"));

        let ok = RemoteSpec::parse_with_type("http://buildservice:50051", RemoteType::Endpoint)
            .expect("spec");
        assert_eq!(ok.host_port().expect("hp").1, Some(50051));
    }

    #[test]
    fn remote_spec_rejects_unknown_option() {
        let err = "https://x.test,frobnicate=1".parse::<RemoteSpec>().expect_err("err");
        assert_eq!(err.reason, "invalid-remote-spec");
    }

    #[test]
    fn error_serializes_without_empty_fields() {
        let e = Error::new(ErrorKind::Remote, "network", "connection reset").temporary();
        let json = serde_json::to_value(&e).expect("json");
        assert_eq!(json["kind"], "remote");
        assert_eq!(json["temporary"], true);
        assert!(json.get("detail").is_none());
    }

    proptest::proptest! {
        #[test]
        fn remote_spec_parsing_never_panics(s in ".{0,80}") {
            let _ = s.parse::<RemoteSpec>();
        }

        #[test]
        fn well_formed_digests_validate(hash in "[0-9a-f]{64}", size in proptest::prelude::any::<u64>()) {
            proptest::prop_assert!(Digest::new(hash, size).is_valid());
        }
    }
}
