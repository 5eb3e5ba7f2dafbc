//! Input plugin reading per-port packet counters from `/proc/net/dev`.
//!
//! The table can live in another network namespace (switch ports are
//! commonly isolated in one), in which case it is read through
//! `ip netns exec`.

use std::fs::File;
use std::io::{BufReader, Cursor};
use std::process::Command;

use anyhow::Context;
use procfs::FromBufRead;
use procfs::net::InterfaceDeviceStatus;
use serde::Deserialize;

use rackmon::accumulator::Accumulator;
use rackmon::metric::Timestamp;
use rackmon::plugin::Input;
use rackmon::{fields, tags};

const DEFAULT_STATS_FILE: &str = "/proc/net/dev";

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Path of the counter table.
    pub stats_file: String,
    /// Network namespace holding the ports, if not the agent's own.
    pub namespace: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            stats_file: DEFAULT_STATS_FILE.to_owned(),
            namespace: None,
        }
    }
}

pub struct NetdevInput {
    config: Config,
}

impl NetdevInput {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    fn read_stats(&self) -> anyhow::Result<InterfaceDeviceStatus> {
        let path = &self.config.stats_file;
        match &self.config.namespace {
            Some(ns) => {
                let out = Command::new("ip")
                    .args(["netns", "exec", ns, "cat", path])
                    .output()
                    .context("cannot run 'ip netns exec'")?;
                anyhow::ensure!(
                    out.status.success(),
                    "'ip netns exec {ns} cat {path}' failed: {}",
                    String::from_utf8_lossy(&out.stderr).trim()
                );
                InterfaceDeviceStatus::from_buf_read(Cursor::new(out.stdout))
                    .with_context(|| format!("error parsing {path} from namespace {ns}"))
            }
            None => {
                let file = File::open(path).with_context(|| format!("cannot open {path}"))?;
                InterfaceDeviceStatus::from_buf_read(BufReader::new(file))
                    .with_context(|| format!("error parsing {path}"))
            }
        }
    }
}

impl Input for NetdevInput {
    fn description(&self) -> &'static str {
        "reads per-port packet counters from a /proc/net/dev style table"
    }

    fn gather(&mut self, acc: &Accumulator) -> anyhow::Result<()> {
        let stats = self.read_stats()?;

        // One shared timestamp so that downstream consumers can correlate
        // the ports of a single pass.
        let now = Timestamp::now();
        for (port, dev) in &stats.0 {
            // Loopback and internal ports (named with an underscore) are
            // not front-panel ports.
            if port == "lo" || port.contains('_') {
                continue;
            }
            let fields = fields! {
                "rx_packets" => dev.recv_packets as f64,
                "rx_bytes" => dev.recv_bytes as f64,
                "rx_errors" => dev.recv_errs as f64,
                "tx_packets" => dev.sent_packets as f64,
                "tx_bytes" => dev.sent_bytes as f64,
                "tx_errors" => dev.sent_errs as f64,
            };
            acc.add_counter("port_stats", fields, tags! { "port" => port.as_str() }, Some(now));
        }
        Ok(())
    }
}
