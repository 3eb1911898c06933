//! # Kiln
//!
//! A declarative, content-addressed build orchestrator core.
//!
//! Given a graph of *elements* — units of work with sources, typed
//! dependencies and build instructions — kiln produces reproducible
//! *artifacts* by executing commands in isolated sandboxes, and shares them
//! across machines through content-addressed caches.
//!
//! ## How a build happens
//!
//! 1. [`project::load_project`] freezes the element graph from a project
//!    description.
//! 2. Each element computes its **weak**, **strict** and **strong** cache
//!    keys ([`element`]); the key is the identity of an artifact.
//! 3. The [`scheduler`] advances every element through its state machine:
//!    resolve → keys → query-cache → (pull | fetch + build) → cached,
//!    dispatching work to bounded queues (track, pull, fetch, build, push).
//! 4. A cache miss reaches the [`sandbox`]: dependencies are staged from
//!    CAS in planner order (collecting overlaps), sources land in the build
//!    root, commands run, and the install root is captured back as the
//!    artifact's file tree.
//! 5. Artifacts ([`artifact`]) are stored under their cache keys in the
//!    local cache and optionally pushed to remotes.
//!
//! ## Modules
//!
//! - [`config`] — user configuration (`kiln.toml`) loading and merging.
//! - [`context`] — per-session state threaded through constructors.
//! - [`project`] — project file loading; the frozen-graph contract.
//! - [`plugin`] — source/element plugin traits and builtin kinds.
//! - [`source`] / [`sourcecache`] — sources and their CAS-backed cache.
//! - [`element`] — the element arena, cache-key algebra, state machine.
//! - [`planner`] — deterministic scope walks and the depth-based plan.
//! - [`artifact`] / [`artifactcache`] — the artifact proto and its cache.
//! - [`overlap`] — staged-file overlap collection and classification.
//! - [`sandbox`] / [`sandbox_remote`] — the execution contract, local and
//!   REAPI implementations.
//! - [`assemble`] — turning a cache miss into an artifact.
//! - [`scheduler`] — queues, worker pools, and the control loop.
//! - [`events`] — the append-only JSONL session event log.
//! - [`variables`] — `%{name}` substitution over commands and paths.

pub mod artifact;
pub mod artifactcache;
pub mod assemble;
pub mod config;
pub mod context;
pub mod element;
pub mod events;
pub mod overlap;
pub mod planner;
pub mod plugin;
pub mod project;
pub mod remotes;
pub mod sandbox;
pub mod sandbox_remote;
pub mod scheduler;
pub mod source;
pub mod sourcecache;
pub mod variables;

#[cfg(test)]
pub(crate) mod testutil;
