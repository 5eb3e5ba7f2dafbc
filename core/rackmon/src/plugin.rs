//! The contracts implemented by input and output plugins.

use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;
use serde::de::DeserializeOwned;

use crate::accumulator::Accumulator;
use crate::filter::Filter;
use crate::metric::{Metric, Tags};

/// An input gathers readings from one source (a local file, a remote server,
/// a fleet of servers) and pushes them through the accumulator.
///
/// # Errors
/// [`gather`](Input::gather) returns an error only when the whole collection
/// pass failed. Per-item anomalies that leave the rest of the pass usable are
/// reported with [`Accumulator::add_error`] instead. The scheduler logs the
/// error and calls `gather` again at the next interval tick: a failing input
/// never stops the agent.
///
/// # Connections
/// Inputs that talk to a remote endpoint connect lazily, on the first
/// `gather` that needs the link, and keep the connection for the following
/// passes. A broken link surfaces as a gather error; retrying is the
/// schedule's business (the next tick), not the input's, and there is no
/// background reconnection. [`disconnect`](Input::disconnect) releases the
/// link at shutdown.
pub trait Input: Send {
    /// One line describing what this input measures.
    fn description(&self) -> &'static str;

    /// Runs one collection pass.
    fn gather(&mut self, acc: &Accumulator) -> anyhow::Result<()>;

    /// Releases the resources held by the input. The default does nothing.
    fn disconnect(&mut self) {}
}

/// An output receives the batches of metrics drained from the agent channel.
pub trait Output: Send {
    /// One line describing where this output writes.
    fn description(&self) -> &'static str;

    /// Sinks one batch of metrics.
    ///
    /// On error, the agent logs and drops the batch.
    fn write(&mut self, metrics: &[Metric]) -> anyhow::Result<()>;
}

/// Scope configuration of one input instance: how the readings it pushes are
/// named, tagged and filtered.
///
/// These are the reserved keys of every input table in the configuration
/// file; the remaining keys belong to the plugin itself.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct InputScope {
    /// Plugin identity, used to tag errors in the log. Set by the agent, not
    /// by the configuration file.
    #[serde(skip)]
    pub name: String,
    /// Replaces the measurement name of every reading.
    pub name_override: String,
    /// Prepended to the measurement name (ignored when `name_override` is
    /// set).
    pub name_prefix: String,
    /// Appended to the measurement name (ignored when `name_override` is
    /// set).
    pub name_suffix: String,
    /// Tags applied to every reading of this input. Tags supplied explicitly
    /// by the input win over these.
    pub tags: Tags,
    /// Collection interval of this input; the agent-wide interval applies
    /// when unset.
    #[serde(default, with = "humantime_serde")]
    pub interval: Option<Duration>,
    /// Metric filtering rules.
    pub filter: Filter,
}

/// Deserializes the plugin-specific part of an input or output table.
pub fn deserialize_config<T: DeserializeOwned>(table: toml::Table) -> anyhow::Result<T> {
    table.try_into().context("invalid plugin configuration")
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn scope_deserializes_with_defaults() {
        let scope: InputScope = toml::from_str("").unwrap();
        assert_eq!(scope.name_override, "");
        assert_eq!(scope.interval, None);
        assert!(scope.filter.is_empty());
    }

    #[test]
    fn scope_deserializes_every_key() {
        let scope: InputScope = toml::from_str(indoc::indoc! {r#"
            name_override = "ports"
            name_prefix = "pfx_"
            name_suffix = "_sfx"
            interval = "30s"

            [tags]
            rack = "r12"

            [filter]
            name_drop = ["*_test"]
        "#})
        .unwrap();
        assert_eq!(scope.name_override, "ports");
        assert_eq!(scope.interval, Some(Duration::from_secs(30)));
        assert_eq!(scope.tags["rack"], "r12");
        assert_eq!(scope.filter.name_drop, vec!["*_test".to_string()]);
    }

    #[test]
    fn deserialize_config_reports_bad_tables() {
        #[derive(Deserialize)]
        #[serde(deny_unknown_fields)]
        struct Conf {
            #[allow(dead_code)]
            servers: Vec<String>,
        }
        let table: toml::Table = toml::from_str("unknown_key = 1").unwrap();
        let res: anyhow::Result<Conf> = deserialize_config(table);
        assert!(res.is_err());
    }
}
