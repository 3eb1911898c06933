//! Remote execution of sandbox command batches over the REAPI wire.
//!
//! The staged input root is serialized into a directory digest, missing
//! blobs are uploaded, and an `Execute` operation is submitted and polled.
//! The action cache is consulted first to short-circuit known actions; on
//! completion, output directories are fetched via `GetTree` and stdout,
//! stderr and file content via batched CAS reads.
//!
//! Retry contract on a lost operation stream: exactly one
//! `WaitExecution(name)` reattach attempt is made before failing on
//! transient codes; only a server answer of UNIMPLEMENTED triggers a fresh
//! `Execute`. Cancellation propagates through `CancelOperation`.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use kiln_cas::remote::{RemoteCas, RemoteExec};
use kiln_cas::{CasCache, proto, tree};
use kiln_types::{Digest, Error, ErrorKind, Result};

use crate::plugin::CommandBatch;
use crate::sandbox::{CommandExecutor, SandboxFlags, cancelled};

/// How often the operation is polled while running.
const POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Executes batches on a remote execution service.
pub struct RemoteExecutor {
    cas: Arc<CasCache>,
    exec: RemoteExec,
    storage: RemoteCas,
    poll_interval: Duration,
}

impl RemoteExecutor {
    pub fn new(cas: Arc<CasCache>, exec: RemoteExec, storage: RemoteCas) -> Self {
        Self {
            cas,
            exec,
            storage,
            poll_interval: POLL_INTERVAL,
        }
    }

    fn build_action(
        &self,
        root: &Path,
        batch: &CommandBatch,
        env: &BTreeMap<String, String>,
        work_dir: &str,
        flags: SandboxFlags,
    ) -> Result<(Digest, Digest, Digest)> {
        let input_root = tree::import_tree(&self.cas, root)?;

        let mut platform = proto::Platform::default();
        if flags.network_enabled {
            platform.properties.push(proto::PlatformProperty {
                name: "network".to_string(),
                value: "enabled".to_string(),
            });
        }

        let command = proto::Command {
            arguments: vec![
                "sh".to_string(),
                "-c".to_string(),
                batch.commands.join(" && "),
            ],
            environment_variables: env
                .iter()
                .map(|(name, value)| proto::EnvironmentVariable {
                    name: name.clone(),
                    value: value.clone(),
                })
                .collect(),
            output_paths: vec![".".to_string()],
            working_directory: work_dir.trim_start_matches('/').to_string(),
            platform: Some(platform),
        };
        let command_digest = self.add_proto(&command)?;

        let action = proto::Action {
            command_digest: command_digest.clone(),
            input_root_digest: input_root.clone(),
            timeout_seconds: None,
            do_not_cache: false,
        };
        let action_digest = self.add_proto(&action)?;

        Ok((input_root, command_digest, action_digest))
    }

    fn add_proto<T: serde::Serialize>(&self, message: &T) -> Result<Digest> {
        let bytes = serde_json::to_vec(message).map_err(|e| {
            Error::new(
                ErrorKind::Sandbox,
                "encode-failed",
                format!("failed to encode REAPI message: {}", e),
            )
        })?;
        self.cas.add_blob(&bytes)
    }

    /// Poll the operation to completion, reattaching once on channel loss.
    fn await_operation(
        &self,
        mut operation: proto::Operation,
        action_digest: &Digest,
        cancel: &AtomicBool,
    ) -> Result<proto::Operation> {
        let mut reattached = false;
        while !operation.done {
            if cancel.load(Ordering::SeqCst) {
                let _ = self.exec.cancel_operation(&operation.name);
                return Err(cancelled());
            }
            std::thread::sleep(self.poll_interval);

            operation = match self.exec.get_operation(&operation.name) {
                Ok(op) => op,
                Err(e) if e.temporary && !reattached => {
                    reattached = true;
                    match self.exec.wait_execution(&operation.name) {
                        Ok(op) => op,
                        Err(we) if we.reason == "unimplemented" => {
                            // The server cannot reattach; re-submit, skipping
                            // the cache lookup we already performed.
                            self.exec.execute(action_digest, true)?
                        }
                        Err(we) => return Err(we),
                    }
                }
                Err(e) => return Err(e),
            };
        }
        Ok(operation)
    }

    /// Materialize an output directory locally: its directory nodes arrive
    /// through the GetTree RPC, file content through batched CAS reads.
    fn materialize_tree(&self, root_digest: &Digest) -> Result<Digest> {
        let directories = self.storage.get_tree(root_digest)?;
        for directory in &directories {
            self.cas.add_directory(directory)?;
        }
        if !self.cas.contains(root_digest) {
            return Err(Error::new(
                ErrorKind::Remote,
                "protocol-error",
                format!(
                    "GetTree response did not cover the output root {}",
                    root_digest
                ),
            ));
        }

        let missing: Vec<Digest> = tree::walk_blobs(&self.cas, root_digest)?
            .into_iter()
            .filter(|d| !self.cas.contains(d))
            .collect();
        if !missing.is_empty() {
            self.storage.fetch_blobs(&self.cas, &missing)?;
        }
        Ok(root_digest.clone())
    }

    /// Apply an action result to the local root and log.
    fn apply_result(
        &self,
        result: &proto::ActionResult,
        root: &Path,
        work_dir: &str,
        log: &mut File,
    ) -> Result<i32> {
        for stream in [&result.stdout_digest, &result.stderr_digest]
            .into_iter()
            .flatten()
        {
            if !self.cas.contains(stream) {
                self.storage
                    .fetch_blobs(&self.cas, std::slice::from_ref(stream))?;
            }
            let bytes = self.cas.read_blob(stream)?;
            log.write_all(&bytes)
                .map_err(|e| Error::io(ErrorKind::Sandbox, "failed to write log", &e))?;
        }

        let base = root.join(work_dir.trim_start_matches('/'));
        for output in &result.output_directories {
            let dir = self.materialize_tree(&output.tree_digest)?;
            let dest = base.join(output.path.trim_start_matches('/'));
            tree::checkout_tracked(&self.cas, &dir, &dest)?;
        }
        for output in &result.output_files {
            if !self.cas.contains(&output.digest) {
                self.storage
                    .fetch_blobs(&self.cas, std::slice::from_ref(&output.digest))?;
            }
            let bytes = self.cas.read_blob(&output.digest)?;
            let dest = base.join(output.path.trim_start_matches('/'));
            if let Some(parent) = dest.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| Error::io(ErrorKind::Sandbox, "failed to create output dir", &e))?;
            }
            std::fs::write(&dest, bytes)
                .map_err(|e| Error::io(ErrorKind::Sandbox, "failed to write output file", &e))?;
        }

        Ok(result.exit_code)
    }
}

impl CommandExecutor for RemoteExecutor {
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
        if batch.commands.is_empty() {
            return Ok(0);
        }
        let (input_root, command_digest, action_digest) =
            self.build_action(root, batch, env, work_dir, flags)?;

        // Ship the input closure before asking anything of the service.
        self.storage.send_tree(&self.cas, &input_root)?;
        self.storage
            .send_blobs(&self.cas, &[command_digest, action_digest.clone()])?;

        if cancel.load(Ordering::SeqCst) {
            return Err(cancelled());
        }

        // Action cache first: a known action needs no execution.
        if let Some(result) = self.exec.get_action_result(&action_digest)? {
            return self.apply_result(&result, root, work_dir, log);
        }

        let operation = self.exec.execute(&action_digest, false)?;
        let operation = self.await_operation(operation, &action_digest, cancel)?;

        if let Some(status) = &operation.error
            && status.code != proto::code::OK
        {
            return Err(Error::new(
                ErrorKind::Sandbox,
                "remote-exec-failed",
                format!("remote execution failed: {}", status.message),
            ));
        }
        let response = operation.response.ok_or_else(|| {
            Error::new(
                ErrorKind::Remote,
                "protocol-error",
                "operation finished without a response",
            )
        })?;
        if let Some(status) = &response.status
            && status.code != proto::code::OK
        {
            return Err(Error::new(
                ErrorKind::Sandbox,
                "remote-exec-failed",
                format!("remote execution failed: {}", status.message),
            ));
        }
        let result = response.result.ok_or_else(|| {
            Error::new(
                ErrorKind::Remote,
                "protocol-error",
                "execute response carried no action result",
            )
        })?;

        self.apply_result(&result, root, work_dir, log)
    }

    fn sandbox_rooted(&self) -> bool {
        // The remote worker chroots into the input root, so sandbox-absolute
        // paths are correct as written.
        true
    }
}
