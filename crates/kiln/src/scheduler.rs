//! The scheduler: five queues, bounded worker pools, one control thread.
//!
//! The control loop owns the element graph and is the sole mutator of
//! element state. Workers receive immutable snapshots of their inputs, run
//! the blocking part (network transfers, sandbox execution, source
//! plugins), and post a completion message back over a channel; the loop
//! applies each message to the graph before looking at the next, so state
//! transitions are serialized.
//!
//! Queues and their ready predicates:
//!
//! - **Track** — tracking requested, sources declare trackability.
//! - **Pull** — required, keys known, not cached, fetch remotes configured.
//! - **Fetch** — required, sources not cached, no pull pending.
//! - **Build** — buildable and scheduled for assembly.
//! - **Push** — cached successfully, push remotes configured, not tainted.
//!
//! Transient network failures retry with backoff up to the configured
//! budget; non-transient failures surface immediately and apply the
//! configured error action (`continue`, `quit`, `terminate`).

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError, Sender, channel};
use std::thread;
use std::time::Duration;

use kiln_cas::remote::{Channel, RemoteCas, RemoteExec};
use kiln_retry::{BackoffConfig, calculate_delay};
use kiln_types::{Digest, Error, ErrorKind, Result, Scope, SourceRef};

use crate::artifact::{Artifact, BuildDepRecord, normal_name};
use crate::artifactcache::PushSkip;
use crate::assemble::{AssembleOutcome, BuildJobSpec, BuildResources, StagedDepSpec, assemble};
use crate::config::ErrorAction;
use crate::context::Context;
use crate::element::{ElementId, Graph};
use crate::events::{EventLog, EventType, QueueName, events_path};
use crate::overlap::{OverlapAction, whitelist_from_public};
use crate::planner;
use crate::sandbox::{CommandExecutor, LocalExecutor};
use crate::sandbox_remote::RemoteExecutor;
use crate::variables::{BUILD_ROOT, INSTALL_ROOT, Variables};

/// Line-oriented progress reporting; the CLI implements this.
pub trait Reporter {
    fn info(&mut self, msg: &str);
    fn warn(&mut self, msg: &str);
    fn error(&mut self, msg: &str);
}

/// Discards everything; used by tests and embedders that only want the
/// summary.
#[derive(Debug, Default)]
pub struct NullReporter;

impl Reporter for NullReporter {
    fn info(&mut self, _msg: &str) {}
    fn warn(&mut self, _msg: &str) {}
    fn error(&mut self, _msg: &str) {}
}

enum JobOutcome {
    Tracked(Vec<(usize, Option<SourceRef>)>),
    Pulled(Option<Artifact>),
    Fetched(Digest),
    Built(Box<AssembleOutcome>),
    Pushed(bool),
}

struct JobResult {
    id: ElementId,
    queue: QueueName,
    attempt: u32,
    outcome: Result<JobOutcome>,
}

/// What a session is asked to accomplish; gates which queues dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionMode {
    /// The full pipeline: pull, fetch, build, push.
    Build,
    /// Fetch sources only.
    Fetch,
    /// Pull artifacts only.
    Pull,
    /// Push locally cached artifacts only.
    Push,
    /// Track source refs only.
    Track,
}

impl SessionMode {
    fn allows(self, queue: QueueName) -> bool {
        match self {
            SessionMode::Build => !matches!(queue, QueueName::Track),
            SessionMode::Fetch => matches!(queue, QueueName::Fetch),
            SessionMode::Pull => matches!(queue, QueueName::Pull),
            SessionMode::Push => matches!(queue, QueueName::Push),
            SessionMode::Track => matches!(queue, QueueName::Track),
        }
    }
}

/// What happened over one scheduler run.
#[derive(Debug, Default)]
pub struct SchedulerSummary {
    pub tracked: Vec<String>,
    pub pulled: Vec<String>,
    pub fetched: Vec<String>,
    pub built: Vec<String>,
    pub pushed: Vec<String>,
    /// Policy skips (push gating); these do not fail the session.
    pub push_skipped: Vec<(String, String)>,
    pub failed: Vec<(String, Error)>,
    /// Required elements left unprocessed (e.g. behind a failed dep).
    pub skipped: Vec<(String, String)>,
    pub cancelled: bool,
}

impl SchedulerSummary {
    /// The session succeeds iff every required element ended cached-success
    /// or was skipped by policy.
    pub fn success(&self) -> bool {
        self.failed.is_empty() && self.skipped.is_empty() && !self.cancelled
    }
}

#[derive(Default)]
struct QueueState {
    started: BTreeSet<ElementId>,
    attempts: BTreeMap<ElementId, u32>,
    in_flight: usize,
}

#[derive(Clone)]
enum ExecutorSpec {
    Local,
    Remote {
        exec: RemoteExec,
        storage: RemoteCas,
    },
}

enum Action {
    Track(ElementId),
    Pull(ElementId),
    Fetch(ElementId),
    Build(ElementId),
    Push(ElementId),
}

pub struct Scheduler<'a> {
    ctx: &'a Context,
    graph: &'a mut Graph,
    reporter: &'a mut dyn Reporter,
    base_dir: PathBuf,
    cancel: Arc<AtomicBool>,
    events: EventLog,
    backoff: BackoffConfig,
    executor_spec: ExecutorSpec,

    track: QueueState,
    pull: QueueState,
    fetch: QueueState,
    build: QueueState,
    push: QueueState,

    tx: Sender<JobResult>,
    rx: Receiver<JobResult>,
    in_flight: usize,
    stop_dispatching: bool,
    mode: SessionMode,
    summary: SchedulerSummary,
}

impl<'a> Scheduler<'a> {
    pub fn new(
        ctx: &'a Context,
        graph: &'a mut Graph,
        base_dir: PathBuf,
        reporter: &'a mut dyn Reporter,
    ) -> Result<Self> {
        let executor_spec = match &ctx.remote_execution {
            Some(spec) => {
                let channel = Channel::connect(spec)?;
                ExecutorSpec::Remote {
                    exec: RemoteExec::new(channel.clone()),
                    storage: RemoteCas::new(channel),
                }
            }
            None => ExecutorSpec::Local,
        };
        let (tx, rx) = channel();
        Ok(Self {
            backoff: BackoffConfig::network(ctx.config.scheduler.network_retries),
            executor_spec,
            ctx,
            graph,
            reporter,
            base_dir,
            cancel: Arc::new(AtomicBool::new(false)),
            events: EventLog::new(),
            track: QueueState::default(),
            pull: QueueState::default(),
            fetch: QueueState::default(),
            build: QueueState::default(),
            push: QueueState::default(),
            tx,
            rx,
            in_flight: 0,
            stop_dispatching: false,
            mode: SessionMode::Build,
            summary: SchedulerSummary::default(),
        })
    }

    /// The flag cooperative cancellation observes. Setting it stops new
    /// dispatches and interrupts workers at their next suspension point.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }

    /// Drive the graph until every required element is resolved or failed.
    pub fn run(
        mut self,
        targets: &[ElementId],
        mode: SessionMode,
        track: bool,
    ) -> Result<SchedulerSummary> {
        self.mode = mode;
        let target_names: Vec<String> = targets
            .iter()
            .map(|id| self.graph.get(*id).decl.name.clone())
            .collect();
        self.events
            .record("-", EventType::SessionStarted { targets: target_names });

        match mode {
            SessionMode::Build => {
                for target in targets {
                    self.graph.mark_required(*target);
                }
            }
            _ => {
                // Non-build sessions operate on the whole closure directly.
                for id in planner::dependencies(self.graph, targets, Scope::All) {
                    self.graph.get_mut(id).required = true;
                }
            }
        }
        if track || mode == SessionMode::Track {
            for id in planner::dependencies(self.graph, targets, Scope::All) {
                if self.graph.get(id).sources.is_trackable() {
                    self.graph.get_mut(id).tracking_requested = true;
                }
            }
        }

        loop {
            if self.cancel.load(Ordering::SeqCst) && !self.summary.cancelled {
                self.summary.cancelled = true;
                self.stop_dispatching = true;
                self.reporter.warn("cancellation requested; draining workers");
            }

            self.update_states()?;
            let dispatched = self.dispatch()?;

            if self.in_flight == 0 {
                if dispatched == 0 {
                    break;
                }
                continue;
            }

            match self.rx.recv_timeout(Duration::from_millis(200)) {
                Ok(result) => self.handle_result(result)?,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        self.finalize();
        Ok(self.summary)
    }

    // -- state cascade ------------------------------------------------------

    fn update_states(&mut self) -> Result<()> {
        let ids: Vec<ElementId> = self.graph.ids().collect();

        for id in &ids {
            // Tracking rewrites refs; keys wait until it lands.
            if self.graph.get(*id).tracking_requested {
                continue;
            }
            self.graph.update_cache_keys(*id, self.ctx.strict)?;
        }

        for id in &ids {
            self.query_cache(*id)?;
        }

        if !self.ctx.strict {
            for id in &ids {
                self.graph.update_cache_key_non_strict(*id)?;
            }
        }

        if self.mode == SessionMode::Build {
            for id in &ids {
                if self.graph.should_schedule_assemble(*id) {
                    self.graph.get_mut(*id).assemble_scheduled = true;
                    self.graph.mark_build_deps_required(*id);
                    if !self.ctx.strict {
                        self.graph.update_cache_key_non_strict(*id)?;
                    }
                }
            }
        }
        Ok(())
    }

    fn query_cache(&mut self, id: ElementId) -> Result<()> {
        if self.graph.get(id).strict_key.is_none() {
            return Ok(());
        }

        if let Some(key) = self.graph.get(id).source_key.clone() {
            let cached = self.ctx.sources.contains(&key);
            self.graph.get_mut(id).sources_cached = cached;
        }

        let e = self.graph.get(id);
        if e.cached.is_some() {
            return Ok(());
        }
        let strict_key = e.strict_key.clone().unwrap_or_default();
        let extract_key = if self.ctx.strict {
            strict_key.clone()
        } else {
            e.strong_key
                .clone()
                .or_else(|| e.weak_key.clone())
                .unwrap_or_default()
        };
        let project = e.decl.project.clone();
        let name = e.decl.name.clone();

        let loaded = match self.ctx.artifacts.load(&project, &name, &extract_key) {
            Ok(loaded) => loaded,
            Err(err) => {
                self.reporter
                    .warn(&format!("{}: unreadable artifact ref: {}", name, err));
                None
            }
        };

        let cached = match loaded {
            Some(artifact)
                if artifact.is_complete(&self.ctx.cas, self.ctx.config.cache.require_buildtrees) =>
            {
                // A recorded failure whose strong key no longer matches the
                // current strict key is stale; rebuild instead.
                if !self.ctx.strict
                    && !artifact.build_success
                    && artifact.strong_key != strict_key
                {
                    false
                } else {
                    self.graph.get_mut(id).artifact = Some(artifact);
                    true
                }
            }
            _ => false,
        };
        let pull_possible =
            self.mode.allows(QueueName::Pull) && self.ctx.artifacts.has_fetch_remotes();
        let e = self.graph.get_mut(id);
        e.cached = Some(cached);
        if !cached && pull_possible && !self.pull.started.contains(&id) {
            e.pull_pending = true;
        }
        Ok(())
    }

    // -- dispatch -----------------------------------------------------------

    fn dispatch(&mut self) -> Result<usize> {
        if self.stop_dispatching {
            return Ok(0);
        }

        let sched = &self.ctx.config.scheduler;
        let mut actions = Vec::new();
        let mut track_slots = sched.fetchers.saturating_sub(self.track.in_flight);
        let mut pull_slots = sched.fetchers.saturating_sub(self.pull.in_flight);
        let mut fetch_slots = sched.fetchers.saturating_sub(self.fetch.in_flight);
        let mut build_slots = sched.builders.saturating_sub(self.build.in_flight);
        let mut push_slots = sched.pushers.saturating_sub(self.push.in_flight);

        let track_allowed = self.mode == SessionMode::Track || self.mode == SessionMode::Build;
        for id in self.graph.ids().collect::<Vec<_>>() {
            let e = self.graph.get(id);

            if e.tracking_requested
                && track_allowed
                && track_slots > 0
                && !self.track.started.contains(&id)
                && e.sources.is_trackable()
            {
                actions.push(Action::Track(id));
                track_slots -= 1;
                continue;
            }
            if e.tracking_requested {
                // Nothing else can run for this element until refs land.
                continue;
            }

            if self.mode.allows(QueueName::Pull)
                && e.required
                && pull_slots > 0
                && e.can_query_cache()
                && e.cached == Some(false)
                && e.pull_pending
                && !self.pull.started.contains(&id)
            {
                actions.push(Action::Pull(id));
                pull_slots -= 1;
            }

            if self.mode.allows(QueueName::Fetch)
                && e.required
                && fetch_slots > 0
                && !self.fetch.started.contains(&id)
                && self.graph.state(id) == crate::element::ElementState::FetchNeeded
            {
                actions.push(Action::Fetch(id));
                fetch_slots -= 1;
            }

            let e = self.graph.get(id);
            if self.mode.allows(QueueName::Build)
                && e.assemble_scheduled
                && build_slots > 0
                && !e.assemble_done
                && !self.build.started.contains(&id)
                && e.strong_key.is_some()
                && self.graph.state(id) == crate::element::ElementState::Buildable
            {
                actions.push(Action::Build(id));
                build_slots -= 1;
            }

            let e = self.graph.get(id);
            if self.mode.allows(QueueName::Push)
                && e.required
                && push_slots > 0
                && e.cached_success()
                && !self.push.started.contains(&id)
            {
                let name = e.decl.name.clone();
                let skip = self.ctx.artifacts.check_push(e.artifact.as_ref());
                match skip {
                    None => {
                        actions.push(Action::Push(id));
                        push_slots -= 1;
                    }
                    Some(PushSkip::NoRemotes) => {
                        // Local-only session; nothing to record.
                        self.push.started.insert(id);
                    }
                    Some(skip) => {
                        self.push.started.insert(id);
                        self.events.record(
                            &name,
                            EventType::Skipped {
                                queue: QueueName::Push,
                                reason: skip.reason().to_string(),
                            },
                        );
                        self.reporter
                            .info(&format!("{}: push skipped ({})", name, skip.reason()));
                        self.summary
                            .push_skipped
                            .push((name, skip.reason().to_string()));
                    }
                }
            }
        }

        let count = actions.len();
        for action in actions {
            match action {
                Action::Track(id) => self.spawn_track(id),
                Action::Pull(id) => self.spawn_pull(id),
                Action::Fetch(id) => self.spawn_fetch(id)?,
                Action::Build(id) => self.spawn_build(id)?,
                Action::Push(id) => self.spawn_push(id),
            }
        }
        Ok(count)
    }

    fn begin(&mut self, queue: QueueName, id: ElementId) -> u32 {
        let state = self.queue_mut(queue);
        state.started.insert(id);
        state.in_flight += 1;
        let attempt = state.attempts.entry(id).or_insert(0);
        *attempt += 1;
        let attempt = *attempt;
        self.in_flight += 1;
        let name = self.graph.get(id).decl.name.clone();
        self.events.record(&name, EventType::Dispatched { queue });
        if attempt > 1 {
            self.events.record(&name, EventType::Retrying { queue, attempt });
        }
        attempt
    }

    fn queue_mut(&mut self, queue: QueueName) -> &mut QueueState {
        match queue {
            QueueName::Track => &mut self.track,
            QueueName::Pull => &mut self.pull,
            QueueName::Fetch => &mut self.fetch,
            QueueName::Build => &mut self.build,
            QueueName::Push => &mut self.push,
        }
    }

    fn spawn_track(&mut self, id: ElementId) {
        let attempt = self.begin(QueueName::Track, id);
        let e = self.graph.get(id);
        self.reporter
            .info(&format!("{}: tracking sources", e.decl.name));
        let plugins: Vec<(usize, Arc<dyn crate::plugin::SourcePlugin>)> = e
            .sources
            .sources
            .iter()
            .enumerate()
            .filter(|(_, s)| s.plugin.is_trackable())
            .map(|(i, s)| (i, s.plugin.clone()))
            .collect();

        let tx = self.tx.clone();
        let cancel = self.cancel.clone();
        let backoff = self.backoff.clone();
        thread::spawn(move || {
            let outcome = (|| {
                wait_before_retry(&backoff, attempt, &cancel)?;
                let mut refs = Vec::with_capacity(plugins.len());
                for (index, plugin) in &plugins {
                    check_cancelled(&cancel)?;
                    refs.push((*index, plugin.track()?));
                }
                Ok(JobOutcome::Tracked(refs))
            })();
            let _ = tx.send(JobResult {
                id,
                queue: QueueName::Track,
                attempt,
                outcome,
            });
        });
    }

    fn spawn_pull(&mut self, id: ElementId) {
        let attempt = self.begin(QueueName::Pull, id);
        let e = self.graph.get(id);
        self.reporter.info(&format!(
            "{}: pulling artifact ({})",
            e.decl.name,
            e.display_key()
        ));
        let project = e.decl.project.clone();
        let name = e.decl.name.clone();
        let strict_key = e.strict_key.clone().unwrap_or_default();
        let weak_key = if self.ctx.strict {
            None
        } else {
            e.weak_key.clone()
        };
        let artifacts = self.ctx.artifacts.clone();

        let tx = self.tx.clone();
        let cancel = self.cancel.clone();
        let backoff = self.backoff.clone();
        thread::spawn(move || {
            let outcome = (|| {
                wait_before_retry(&backoff, attempt, &cancel)?;
                check_cancelled(&cancel)?;
                let artifact =
                    artifacts.pull(&project, &name, &strict_key, weak_key.as_deref(), &strict_key)?;
                Ok(JobOutcome::Pulled(artifact))
            })();
            let _ = tx.send(JobResult {
                id,
                queue: QueueName::Pull,
                attempt,
                outcome,
            });
        });
    }

    fn spawn_fetch(&mut self, id: ElementId) -> Result<()> {
        let attempt = self.begin(QueueName::Fetch, id);
        let e = self.graph.get(id);
        self.reporter
            .info(&format!("{}: fetching sources", e.decl.name));
        let key = e.source_key.clone().ok_or_else(|| {
            Error::new(
                ErrorKind::CacheKey,
                "missing-inputs",
                format!("fetch dispatched before source key for '{}'", e.decl.name),
            )
        })?;
        let plugins: Vec<Arc<dyn crate::plugin::SourcePlugin>> =
            e.sources.sources.iter().map(|s| s.plugin.clone()).collect();
        let sources = self.ctx.sources.clone();
        let tmpdir = self.ctx.tmpdir();

        let tx = self.tx.clone();
        let cancel = self.cancel.clone();
        let backoff = self.backoff.clone();
        thread::spawn(move || {
            let outcome = (|| {
                wait_before_retry(&backoff, attempt, &cancel)?;
                check_cancelled(&cancel)?;

                // A cached copy on a remote beats running plugin fetches.
                if sources.pull(&key).unwrap_or(false)
                    && let Some(proto) = sources.load(&key)?
                {
                    return Ok(JobOutcome::Fetched(proto.files));
                }

                for plugin in &plugins {
                    check_cancelled(&cancel)?;
                    plugin.fetch()?;
                }
                let staging = tempfile::TempDir::new_in(&tmpdir).map_err(|err| {
                    Error::io(ErrorKind::Source, "failed to create staging dir", &err)
                })?;
                for plugin in &plugins {
                    plugin.stage(staging.path())?;
                }
                check_cancelled(&cancel)?;
                let digest = sources.commit(&key, staging.path())?;
                if sources.has_push_remotes() {
                    // Sharing staged sources is best-effort.
                    let _ = sources.push(&key);
                }
                Ok(JobOutcome::Fetched(digest))
            })();
            let _ = tx.send(JobResult {
                id,
                queue: QueueName::Fetch,
                attempt,
                outcome,
            });
        });
        Ok(())
    }

    fn spawn_build(&mut self, id: ElementId) -> Result<()> {
        let spec = self.build_job_spec(id)?;
        let attempt = self.begin(QueueName::Build, id);
        self.reporter.info(&format!(
            "{}: building ({})",
            spec.name,
            &spec.strong_key[..8.min(spec.strong_key.len())]
        ));

        let cas = self.ctx.cas.clone();
        let build_dir = self.ctx.builddir();
        let executor_spec = self.executor_spec.clone();
        let tx = self.tx.clone();
        let cancel = self.cancel.clone();
        thread::spawn(move || {
            let executor: Box<dyn CommandExecutor> = match executor_spec {
                ExecutorSpec::Local => Box::new(LocalExecutor),
                ExecutorSpec::Remote { exec, storage } => {
                    Box::new(RemoteExecutor::new(cas.clone(), exec, storage))
                }
            };
            let outcome = assemble(
                &spec,
                BuildResources {
                    cas,
                    build_dir,
                    cancel,
                    executor,
                },
            )
            .map(|outcome| JobOutcome::Built(Box::new(outcome)));
            let _ = tx.send(JobResult {
                id,
                queue: QueueName::Build,
                attempt,
                outcome,
            });
        });
        Ok(())
    }

    fn build_job_spec(&self, id: ElementId) -> Result<BuildJobSpec> {
        let e = self.graph.get(id);
        let strong_key = e.strong_key.clone().ok_or_else(|| {
            Error::new(
                ErrorKind::CacheKey,
                "missing-inputs",
                format!("build dispatched before strong key for '{}'", e.decl.name),
            )
        })?;

        let deps_order = planner::dependencies(self.graph, &[id], Scope::Build);
        let mut deps = Vec::with_capacity(deps_order.len());
        let mut build_dep_records = Vec::with_capacity(deps_order.len());
        for dep_id in &deps_order {
            let dep = self.graph.get(*dep_id);
            let artifact = dep.artifact.as_ref().ok_or_else(|| {
                Error::new(
                    ErrorKind::CacheKey,
                    "missing-inputs",
                    format!("dependency '{}' has no artifact", dep.decl.name),
                )
            })?;
            let files = artifact.files.clone().ok_or_else(|| {
                Error::new(
                    ErrorKind::Cas,
                    "blob-missing",
                    format!("dependency '{}' artifact has no files tree", dep.decl.name),
                )
            })?;
            let vars = Variables::new(&dep.decl.variables);
            deps.push(StagedDepSpec {
                name: dep.full_name(),
                files,
                whitelist: whitelist_from_public(&dep.decl.public, &vars)?,
            });
            build_dep_records.push(BuildDepRecord {
                project: dep.decl.project.clone(),
                name: dep.decl.name.clone(),
                key: dep
                    .strong_key
                    .clone()
                    .unwrap_or_else(|| artifact.strong_key.clone()),
                was_workspaced: dep.decl.was_workspaced || artifact.tainted(),
            });
        }

        let sources_digest = match &e.source_key {
            Some(key) => self.ctx.sources.load(key)?.map(|proto| proto.files),
            None => None,
        };

        let vars = Variables::new(&e.decl.variables);
        let build_root = vars.get("build-root").unwrap_or(BUILD_ROOT).to_string();
        let install_root = vars.get("install-root").unwrap_or(INSTALL_ROOT).to_string();

        let log_name = format!(
            "{}-{}.log",
            normal_name(&e.decl.name),
            &strong_key[..8.min(strong_key.len())]
        );

        Ok(BuildJobSpec {
            project: e.decl.project.clone(),
            name: e.decl.name.clone(),
            weak_key: e.weak_key.clone().unwrap_or_default(),
            strict_key: e.strict_key.clone().unwrap_or_default(),
            strong_key,
            run_commands: e.plugin.run_commands(),
            batches: e.plugin.assemble_batches()?,
            environment: e.decl.environment.clone(),
            variables: e.decl.variables.clone(),
            sandbox: e.decl.sandbox.clone(),
            deps,
            sources_digest,
            public: e.decl.public.clone(),
            fatal_warnings: e.decl.fatal_warnings.clone(),
            build_dep_records,
            was_workspaced: e.decl.was_workspaced,
            cache_buildtrees: self.ctx.config.cache.cache_buildtrees,
            overlap_action: OverlapAction::Warning,
            log_path: self.ctx.logdir().join(&e.decl.project).join(log_name),
            build_root,
            install_root,
        })
    }

    fn spawn_push(&mut self, id: ElementId) {
        let attempt = self.begin(QueueName::Push, id);
        let e = self.graph.get(id);
        self.reporter.info(&format!(
            "{}: pushing artifact ({})",
            e.decl.name,
            e.display_key()
        ));
        let project = e.decl.project.clone();
        let name = e.decl.name.clone();
        let artifact = e.artifact.clone();
        let artifacts = self.ctx.artifacts.clone();

        let tx = self.tx.clone();
        let cancel = self.cancel.clone();
        let backoff = self.backoff.clone();
        thread::spawn(move || {
            let outcome = (|| {
                wait_before_retry(&backoff, attempt, &cancel)?;
                check_cancelled(&cancel)?;
                let artifact = artifact.ok_or_else(|| {
                    Error::new(ErrorKind::Cas, "blob-missing", "artifact vanished before push")
                })?;
                let pushed = artifacts.push(&project, &name, &artifact)?;
                Ok(JobOutcome::Pushed(pushed))
            })();
            let _ = tx.send(JobResult {
                id,
                queue: QueueName::Push,
                attempt,
                outcome,
            });
        });
    }

    // -- completion handling ------------------------------------------------

    fn handle_result(&mut self, result: JobResult) -> Result<()> {
        self.in_flight -= 1;
        self.queue_mut(result.queue).in_flight -= 1;
        let name = self.graph.get(result.id).decl.name.clone();

        match result.outcome {
            Ok(outcome) => {
                self.events
                    .record(&name, EventType::Finished { queue: result.queue });
                self.apply_outcome(result.id, &name, outcome)?;
            }
            Err(error) => self.apply_error(result.id, result.queue, result.attempt, &name, error),
        }
        Ok(())
    }

    fn apply_outcome(&mut self, id: ElementId, name: &str, outcome: JobOutcome) -> Result<()> {
        match outcome {
            JobOutcome::Tracked(refs) => {
                for (index, new_ref) in refs {
                    if let Some(new_ref) = new_ref {
                        self.graph.set_source_ref(
                            id,
                            index,
                            new_ref,
                            &self.ctx.source_kinds,
                            &self.base_dir,
                        )?;
                    }
                }
                self.graph.get_mut(id).tracking_requested = false;
                self.summary.tracked.push(name.to_string());
                self.reporter.info(&format!("{}: tracked", name));
            }
            JobOutcome::Pulled(Some(artifact)) => {
                let e = self.graph.get_mut(id);
                e.artifact = Some(artifact);
                e.cached = Some(true);
                e.pull_pending = false;
                if !self.ctx.strict {
                    self.graph.update_cache_key_non_strict(id)?;
                }
                let key = self.graph.get(id).display_key();
                self.summary.pulled.push(name.to_string());
                self.reporter.info(&format!("{}: pulled ({})", name, key));
            }
            JobOutcome::Pulled(None) => {
                self.graph.get_mut(id).pull_pending = false;
                self.reporter
                    .info(&format!("{}: not available on any remote", name));
            }
            JobOutcome::Fetched(_digest) => {
                self.graph.get_mut(id).sources_cached = true;
                self.summary.fetched.push(name.to_string());
                self.reporter.info(&format!("{}: sources ready", name));
            }
            JobOutcome::Built(outcome) => {
                for warning in &outcome.warnings {
                    self.reporter
                        .warn(&format!("{}: {}\n{}", name, warning.brief, warning.detail));
                }
                let project = self.graph.get(id).decl.project.clone();
                self.ctx.artifacts.store(&project, name, &outcome.artifact)?;

                let success = outcome.artifact.build_success;
                let e = self.graph.get_mut(id);
                e.artifact = Some(outcome.artifact);
                e.cached = Some(true);
                e.assemble_done = true;

                if success {
                    let key = self.graph.get(id).display_key();
                    self.summary.built.push(name.to_string());
                    self.reporter.info(&format!("{}: built ({})", name, key));
                } else {
                    let e = self.graph.get(id);
                    let brief = e
                        .artifact
                        .as_ref()
                        .and_then(|a| a.build_error.clone())
                        .unwrap_or_else(|| "build failed".to_string());
                    let error = Error::new(ErrorKind::Element, "build-failed", brief)
                        .for_element(name);
                    self.reporter
                        .error(&format!("{}: {}", name, error.brief));
                    self.events.record(
                        name,
                        EventType::Failed {
                            queue: QueueName::Build,
                            error: error.brief.clone(),
                        },
                    );
                    self.summary.failed.push((name.to_string(), error));
                    self.apply_error_action();
                }
            }
            JobOutcome::Pushed(pushed) => {
                if pushed {
                    self.summary.pushed.push(name.to_string());
                    self.reporter.info(&format!("{}: pushed", name));
                }
            }
        }
        Ok(())
    }

    fn apply_error(
        &mut self,
        id: ElementId,
        queue: QueueName,
        attempt: u32,
        name: &str,
        error: Error,
    ) {
        let retryable = matches!(
            queue,
            QueueName::Track | QueueName::Pull | QueueName::Fetch | QueueName::Push
        );
        if error.temporary && retryable && self.backoff.should_retry(attempt) {
            self.reporter.warn(&format!(
                "{}: {} (retrying, attempt {}/{})",
                name,
                error.brief,
                attempt,
                self.backoff.max_retries + 1
            ));
            // Clearing the started mark lets dispatch reissue the job; the
            // worker sleeps the backoff delay before retrying.
            self.queue_mut(queue).started.remove(&id);
            return;
        }

        if error.reason == "cancelled" {
            self.summary.cancelled = true;
            return;
        }

        self.reporter.error(&format!("{}: {}", name, error));
        self.events.record(
            name,
            EventType::Failed {
                queue,
                error: error.brief.clone(),
            },
        );

        match queue {
            QueueName::Build => {
                // A setup failure (staging, fatal overlap) ends this
                // element's assembly for the session.
                self.graph.get_mut(id).assemble_done = true;
            }
            QueueName::Pull => {
                self.graph.get_mut(id).pull_pending = false;
            }
            _ => {}
        }
        self.summary.failed.push((name.to_string(), error));
        self.apply_error_action();
    }

    fn apply_error_action(&mut self) {
        match self.ctx.config.scheduler.on_error {
            ErrorAction::Continue => {}
            ErrorAction::Quit => self.stop_dispatching = true,
            ErrorAction::Terminate => {
                self.stop_dispatching = true;
                self.cancel.store(true, Ordering::SeqCst);
            }
        }
    }

    fn finalize(&mut self) {
        if self.mode == SessionMode::Build {
            let failed: BTreeSet<String> =
                self.summary.failed.iter().map(|(n, _)| n.clone()).collect();
            for id in self.graph.ids().collect::<Vec<_>>() {
                let e = self.graph.get(id);
                if !e.required || e.plugin.is_junction() || e.cached_success() {
                    continue;
                }
                let name = e.decl.name.clone();
                if !failed.contains(&name) {
                    self.summary
                        .skipped
                        .push((name, "not processed in this session".to_string()));
                }
            }
        }

        self.events.record(
            "-",
            EventType::SessionFinished {
                failed: self.summary.failed.len(),
            },
        );
        let path = events_path(&self.ctx.logdir());
        if let Err(err) = self.events.write_to_file(&path) {
            self.reporter
                .warn(&format!("failed to write event log: {}", err));
        }

        if !self.summary.failed.is_empty() {
            let names: Vec<String> = self
                .summary
                .failed
                .iter()
                .map(|(name, _)| {
                    let key = self
                        .graph
                        .lookup(name)
                        .map(|id| self.graph.get(id).display_key())
                        .unwrap_or_default();
                    format!("{} ({})", name, key)
                })
                .collect();
            self.reporter
                .error(&format!("failed elements: {}", names.join(", ")));
        }
    }
}

fn check_cancelled(cancel: &AtomicBool) -> Result<()> {
    if cancel.load(Ordering::SeqCst) {
        Err(crate::sandbox::cancelled())
    } else {
        Ok(())
    }
}

/// Sleep the backoff delay before a retry, waking early on cancellation.
fn wait_before_retry(backoff: &BackoffConfig, attempt: u32, cancel: &AtomicBool) -> Result<()> {
    if attempt <= 1 {
        return Ok(());
    }
    let mut remaining = calculate_delay(backoff, attempt - 1);
    while !remaining.is_zero() {
        check_cancelled(cancel)?;
        let step = remaining.min(Duration::from_millis(100));
        thread::sleep(step);
        remaining -= step;
    }
    check_cancelled(cancel)
}
