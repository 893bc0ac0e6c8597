//! # fleetd-agent
//!
//! Composition root and workers for the fleetd device agent.
//!
//! The [`Agent`](agent::Agent) wires the supervision hierarchy from
//! `fleetd-core` to a control-plane client and a container engine, handles
//! registration bootstrap and the on-disk state layout, and runs the
//! long-lived workers:
//!
//! - [`applier::BundleApplier`]: polls the control plane, merges with the
//!   last-known-good bundle, persists atomically, and fans the result out
//! - [`status_gc::StatusGarbageCollector`]: deletes upstream records for
//!   applications and services no longer in the bundle
//! - [`info::InfoReporter`] and [`metrics::MetricsPusher`]: periodic device
//!   facts and resource metrics
//! - [`updater::Updater`]: converges the agent binary on the desired version
//! - [`server`]: the local HTTP control API and the remote tunnel protocol
//!
//! Worker loops never propagate errors; they log and continue on their own
//! cadence. Only [`Agent::initialize`](agent::Agent::initialize) returns an
//! error to the caller.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod agent;
pub mod applier;
pub mod info;
pub mod metrics;
pub mod server;
pub mod service_api;
pub mod status_gc;
pub mod updater;

pub use agent::{Agent, AgentConfig, AgentError};
