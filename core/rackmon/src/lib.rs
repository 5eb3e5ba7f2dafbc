//! RACKMON: rack telemetry collection agent.
//!
//! Rackmon periodically gathers readings (switch port counters, server
//! statistics, host network stats) from a set of *input plugins*, normalizes
//! every reading into a tagged [`Metric`](metric::Metric), and streams the
//! records to an output sink.
//!
//! # This crate
//! This crate provides the measurement core:
//! 1. Inputs push raw readings into an [`Accumulator`](accumulator::Accumulator),
//!    which resolves names and tags, applies the configured
//!    [`Filter`](filter::Filter), normalizes the values and publishes the
//!    resulting metrics on the agent channel.
//! 2. The [`agent`] scheduler drives each input at its collection interval
//!    and drains the published metrics to an [`Output`](plugin::Output).
//!
//! Inputs that fan out over several remote targets in a single pass use the
//! [`gather`] coordinator to run one bounded worker per target.
//!
//! The scheduler is backed by asynchronous **Tokio** tasks; the gathering
//! itself runs on blocking threads, so inputs are free to do ordinary
//! blocking I/O.
//!
//! # Agents and plugins
//! The core does not measure anything by itself and does not parse any
//! configuration file. A runnable application (see the `rackmon-agent` crate)
//! selects the plugins, loads their configuration and hands everything to
//! [`agent::run`].

pub mod accumulator;
pub mod agent;
pub mod filter;
pub mod gather;
pub mod metric;
pub mod plugin;
