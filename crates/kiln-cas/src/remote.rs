//! Remote CAS and execution clients speaking the REAPI wire.
//!
//! One [`Channel`] is built per remote spec and shared by the CAS-side
//! client ([`RemoteCas`]) and the execution-side client ([`RemoteExec`]).
//! Messages are the serde models from [`crate::proto`], exchanged as JSON
//! bodies against the service's method routes. Blob payloads travel
//! base64-encoded inside batch requests.
//!
//! Failures are classified at this layer: connection loss, timeouts and
//! 5xx answers are `temporary` (the scheduler retries them with backoff),
//! 401/403 are fatal authorization errors, anything else malformed is a
//! protocol error.

use std::fs;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use reqwest::StatusCode;
use reqwest::blocking::Client;
use serde::Serialize;
use serde::de::DeserializeOwned;

use kiln_types::{Digest, Error, ErrorKind, RemoteSpec, Result};

use crate::CasCache;
use crate::proto;

/// Upper bound on blobs per batch request.
const BATCH_BLOB_COUNT: usize = 64;
/// Upper bound on payload bytes per batch request.
const BATCH_BYTE_LIMIT: u64 = 4 * 1024 * 1024;

/// A connection to one remote, shared by every service client for the spec.
#[derive(Debug, Clone)]
pub struct Channel {
    spec: RemoteSpec,
    http: Client,
    base: String,
}

impl Channel {
    /// Build a channel for a remote spec, loading mTLS material if the spec
    /// carries any.
    pub fn connect(spec: &RemoteSpec) -> Result<Arc<Self>> {
        let mut builder = Client::builder()
            .user_agent(format!("kiln/{}", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(120));

        if let Some(path) = &spec.server_cert {
            let pem = fs::read(path)
                .map_err(|e| Error::io(ErrorKind::Remote, "failed to read server cert", &e))?;
            let cert = reqwest::Certificate::from_pem(&pem).map_err(|e| {
                Error::new(
                    ErrorKind::Remote,
                    "auth-failed",
                    format!("invalid server certificate: {}", e),
                )
            })?;
            builder = builder.add_root_certificate(cert);
        }

        if let (Some(cert), Some(key)) = (&spec.client_cert, &spec.client_key) {
            let mut pem = fs::read(cert)
                .map_err(|e| Error::io(ErrorKind::Remote, "failed to read client cert", &e))?;
            let key_pem = fs::read(key)
                .map_err(|e| Error::io(ErrorKind::Remote, "failed to read client key", &e))?;
            pem.extend_from_slice(&key_pem);
            let identity = reqwest::Identity::from_pem(&pem).map_err(|e| {
                Error::new(
                    ErrorKind::Remote,
                    "auth-failed",
                    format!("invalid client identity: {}", e),
                )
            })?;
            builder = builder.identity(identity);
        }

        let http = builder.build().map_err(|e| {
            Error::new(
                ErrorKind::Remote,
                "client-setup",
                format!("failed to build HTTP client: {}", e),
            )
        })?;

        Ok(Arc::new(Self {
            base: spec.url.trim_end_matches('/').to_string(),
            spec: spec.clone(),
            http,
        }))
    }

    pub fn spec(&self) -> &RemoteSpec {
        &self.spec
    }

    /// Method route for a service call, e.g. `blobs:findMissing`.
    fn route(&self, method: &str) -> String {
        match &self.spec.instance_name {
            Some(instance) => format!("{}/v2/{}/{}", self.base, instance, method),
            None => format!("{}/v2/{}", self.base, method),
        }
    }

    fn call<B: Serialize, R: DeserializeOwned>(&self, method: &str, body: &B) -> Result<R> {
        let resp = self
            .http
            .post(self.route(method))
            .json(body)
            .send()
            .map_err(|e| classify_transport(&e))?;

        match resp.status() {
            StatusCode::OK => resp.json().map_err(|e| {
                Error::new(
                    ErrorKind::Remote,
                    "protocol-error",
                    format!("malformed response from {}: {}", method, e),
                )
            }),
            status => Err(classify_status(status, method)),
        }
    }

    /// Like [`Channel::call`], but a 404 answer becomes `Ok(None)`.
    fn call_optional<B: Serialize, R: DeserializeOwned>(
        &self,
        method: &str,
        body: &B,
    ) -> Result<Option<R>> {
        match self.call(method, body) {
            Ok(r) => Ok(Some(r)),
            Err(e) if e.reason == "not-found" => Ok(None),
            Err(e) => Err(e),
        }
    }
}

fn classify_transport(err: &reqwest::Error) -> Error {
    Error::new(
        ErrorKind::Remote,
        "network",
        format!("remote request failed: {}", err),
    )
    .temporary()
}

fn classify_status(status: StatusCode, method: &str) -> Error {
    if status == StatusCode::NOT_FOUND {
        Error::new(
            ErrorKind::Remote,
            "not-found",
            format!("{}: not found", method),
        )
    } else if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        Error::new(
            ErrorKind::Remote,
            "auth-failed",
            format!("{}: authorization failed ({})", method, status),
        )
    } else if status == StatusCode::NOT_IMPLEMENTED {
        Error::new(
            ErrorKind::Remote,
            "unimplemented",
            format!("{}: not implemented by the server", method),
        )
    } else if status.is_server_error()
        || status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
    {
        Error::new(
            ErrorKind::Remote,
            "network",
            format!("{}: {}", method, status),
        )
        .temporary()
    } else {
        Error::new(
            ErrorKind::Remote,
            "protocol-error",
            format!("{}: unexpected status {}", method, status),
        )
    }
}

// ---------------------------------------------------------------------------
// CAS service
// ---------------------------------------------------------------------------

/// CAS-side operations against one remote.
#[derive(Debug, Clone)]
pub struct RemoteCas {
    channel: Arc<Channel>,
}

impl RemoteCas {
    pub fn new(channel: Arc<Channel>) -> Self {
        Self { channel }
    }

    pub fn spec(&self) -> &RemoteSpec {
        self.channel.spec()
    }

    /// Which of `digests` the remote does not have.
    pub fn missing_blobs(&self, digests: &[Digest]) -> Result<Vec<Digest>> {
        let mut missing = Vec::new();
        for chunk in digests.chunks(1024) {
            let req = proto::FindMissingBlobsRequest {
                blob_digests: chunk.to_vec(),
            };
            let resp: proto::FindMissingBlobsResponse =
                self.channel.call("blobs:findMissing", &req)?;
            missing.extend(resp.missing_blob_digests);
        }
        Ok(missing)
    }

    /// Upload local blobs to the remote, batched by count and payload size.
    pub fn send_blobs(&self, cas: &CasCache, digests: &[Digest]) -> Result<()> {
        let mut batch: Vec<proto::BatchBlob> = Vec::new();
        let mut batch_bytes: u64 = 0;

        for digest in digests {
            let bytes = cas.read_blob(digest)?;
            batch_bytes += digest.size_bytes;
            batch.push(proto::BatchBlob {
                digest: digest.clone(),
                data: BASE64.encode(&bytes),
            });
            if batch.len() >= BATCH_BLOB_COUNT || batch_bytes >= BATCH_BYTE_LIMIT {
                self.flush_batch(&mut batch)?;
                batch_bytes = 0;
            }
        }
        self.flush_batch(&mut batch)
    }

    fn flush_batch(&self, batch: &mut Vec<proto::BatchBlob>) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let req = proto::BatchUpdateBlobsRequest {
            requests: std::mem::take(batch),
        };
        let resp: proto::BatchUpdateBlobsResponse = self.channel.call("blobs:batchUpdate", &req)?;
        for status in resp.responses {
            if let Some(rpc) = status.status
                && rpc.code != proto::code::OK
            {
                return Err(Error::new(
                    ErrorKind::Remote,
                    "upload-failed",
                    format!("remote rejected blob {}: {}", status.digest, rpc.message),
                ));
            }
        }
        Ok(())
    }

    /// Download blobs into the local store, verifying content hashes.
    pub fn fetch_blobs(&self, cas: &CasCache, digests: &[Digest]) -> Result<()> {
        for chunk in digests.chunks(BATCH_BLOB_COUNT) {
            let req = proto::BatchReadBlobsRequest {
                digests: chunk.to_vec(),
            };
            let resp: proto::BatchReadBlobsResponse = self.channel.call("blobs:batchRead", &req)?;
            for blob in resp.responses {
                let bytes = BASE64.decode(blob.data.as_bytes()).map_err(|e| {
                    Error::new(
                        ErrorKind::Remote,
                        "protocol-error",
                        format!("undecodable blob payload for {}: {}", blob.digest, e),
                    )
                })?;
                let stored = cas.add_blob(&bytes)?;
                if stored != blob.digest {
                    return Err(Error::new(
                        ErrorKind::Remote,
                        "digest-mismatch",
                        format!("remote sent {} for requested {}", stored, blob.digest),
                    ));
                }
            }
        }
        // Verify nothing was silently dropped from the batches.
        for digest in digests {
            if !cas.contains(digest) {
                return Err(Error::new(
                    ErrorKind::Remote,
                    "blob-missing",
                    format!("remote did not return blob {}", digest),
                ));
            }
        }
        Ok(())
    }

    /// Pull a full directory closure rooted at `root`. Returns the root
    /// digest once every descendant blob is local.
    pub fn pull_tree(&self, cas: &CasCache, root: &Digest) -> Result<Digest> {
        if !cas.contains(root) {
            self.fetch_blobs(cas, std::slice::from_ref(root))?;
        }
        let directory = cas.read_directory(root)?;

        let file_digests: Vec<Digest> = directory
            .files
            .iter()
            .map(|f| f.digest.clone())
            .filter(|d| !cas.contains(d))
            .collect();
        if !file_digests.is_empty() {
            self.fetch_blobs(cas, &file_digests)?;
        }

        for sub in &directory.directories {
            self.pull_tree(cas, &sub.digest)?;
        }
        Ok(root.clone())
    }

    /// Upload a directory closure, sending only what the remote is missing.
    pub fn send_tree(&self, cas: &CasCache, root: &Digest) -> Result<()> {
        let mut all = crate::tree::walk_blobs(cas, root)?;
        all.push(root.clone());
        let missing = self.missing_blobs(&all)?;
        self.send_blobs(cas, &missing)
    }

    /// Fetch every directory node in the tree rooted at `root_digest` via
    /// the GetTree RPC, following pagination until the server is drained.
    pub fn get_tree(&self, root_digest: &Digest) -> Result<Vec<proto::Directory>> {
        let mut directories = Vec::new();
        let mut page_token = String::new();
        loop {
            let req = proto::GetTreeRequest {
                root_digest: root_digest.clone(),
                page_token,
            };
            let resp: proto::GetTreeResponse = self.channel.call("tree:get", &req)?;
            let proto::GetTreeResponse {
                directories: page,
                next_page_token,
            } = resp;
            directories.extend(page);
            if next_page_token.is_empty() {
                break;
            }
            page_token = next_page_token;
        }
        Ok(directories)
    }
}

// ---------------------------------------------------------------------------
// Asset (index) service
// ---------------------------------------------------------------------------

/// Symbolic-ref lookups against an index remote: maps cache ref names to
/// blob digests.
#[derive(Debug, Clone)]
pub struct RemoteAssets {
    channel: Arc<Channel>,
}

impl RemoteAssets {
    pub fn new(channel: Arc<Channel>) -> Self {
        Self { channel }
    }

    pub fn spec(&self) -> &RemoteSpec {
        self.channel.spec()
    }

    /// Resolve a ref name to a blob digest; `None` on a miss.
    pub fn fetch_asset(&self, name: &str) -> Result<Option<Digest>> {
        let req = proto::FetchAssetRequest {
            name: name.to_string(),
        };
        let resp: Option<proto::FetchAssetResponse> = self.channel.call_optional("assets:fetch", &req)?;
        Ok(resp.and_then(|r| r.blob_digest))
    }

    /// Publish a ref name → digest binding.
    pub fn push_asset(&self, name: &str, blob_digest: &Digest) -> Result<()> {
        let req = proto::PushAssetRequest {
            name: name.to_string(),
            blob_digest: blob_digest.clone(),
        };
        let _: serde_json::Value = self.channel.call("assets:push", &req)?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Execution service
// ---------------------------------------------------------------------------

/// Execution-side operations against one remote endpoint.
#[derive(Debug, Clone)]
pub struct RemoteExec {
    channel: Arc<Channel>,
}

impl RemoteExec {
    pub fn new(channel: Arc<Channel>) -> Self {
        Self { channel }
    }

    /// Submit an action for execution; returns the (possibly unfinished)
    /// operation.
    pub fn execute(&self, action_digest: &Digest, skip_cache_lookup: bool) -> Result<proto::Operation> {
        let req = proto::ExecuteRequest {
            action_digest: action_digest.clone(),
            skip_cache_lookup,
        };
        self.channel.call("executions:execute", &req)
    }

    /// Poll an operation by name.
    pub fn get_operation(&self, name: &str) -> Result<proto::Operation> {
        let req = proto::WaitExecutionRequest {
            name: name.to_string(),
        };
        self.channel.call("operations:get", &req)
    }

    /// Reattach to a running operation after channel loss.
    pub fn wait_execution(&self, name: &str) -> Result<proto::Operation> {
        let req = proto::WaitExecutionRequest {
            name: name.to_string(),
        };
        self.channel.call("operations:wait", &req)
    }

    /// Propagate cancellation to the server.
    pub fn cancel_operation(&self, name: &str) -> Result<()> {
        let req = proto::CancelOperationRequest {
            name: name.to_string(),
        };
        let _: serde_json::Value = self.channel.call("operations:cancel", &req)?;
        Ok(())
    }

    /// Consult the action cache; `None` on a miss.
    pub fn get_action_result(&self, action_digest: &Digest) -> Result<Option<proto::ActionResult>> {
        let req = proto::GetActionResultRequest {
            action_digest: action_digest.clone(),
        };
        self.channel.call_optional("actionResults:get", &req)
    }
}
