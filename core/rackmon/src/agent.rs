//! The agent scheduler: drives every input at its collection interval and
//! drains the published metrics to the output.
//!
//! Scheduling runs on Tokio tasks, one per input plus one for the output.
//! The gather passes themselves run on the blocking thread pool, so inputs do
//! plain blocking I/O and the accumulator can block on a full channel without
//! stalling the runtime.

use std::time::{Duration, Instant};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::accumulator::Accumulator;
use crate::metric::{Metric, Tags};
use crate::plugin::{Input, InputScope, Output};

/// How many metrics are drained from the channel in one output batch.
const OUTPUT_BATCH: usize = 512;

/// Agent-wide settings, the `[agent]` table of the configuration file.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct AgentConfig {
    /// Default collection interval of the inputs.
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    /// Timestamp rounding precision; derived from the interval when unset.
    #[serde(default, with = "humantime_serde")]
    pub precision: Option<Duration>,
    /// Capacity of the metric channel between the inputs and the output.
    pub metric_buffer_limit: usize,
    /// Log a diagnostic for every field value dropped during normalization.
    pub debug: bool,
    /// Echo every published point to the log.
    pub trace: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            precision: None,
            metric_buffer_limit: 10_000,
            debug: false,
            trace: false,
        }
    }
}

/// One input instance, ready to be scheduled.
pub struct ConfiguredInput {
    pub input: Box<dyn Input>,
    pub scope: InputScope,
}

/// Runs the agent until `shutdown` is cancelled.
///
/// Spawns one task per input and one task draining the metric channel to the
/// output. Returns once every input has stopped and the channel has been
/// fully drained.
pub async fn run(
    config: AgentConfig,
    default_tags: Tags,
    inputs: Vec<ConfiguredInput>,
    output: Box<dyn Output>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let (tx, rx) = mpsc::channel::<Metric>(config.metric_buffer_limit.max(1));

    let mut tasks: JoinSet<()> = JoinSet::new();
    for configured in inputs {
        let interval = configured.scope.interval.unwrap_or(config.interval);
        anyhow::ensure!(
            !interval.is_zero(),
            "collection interval of input [{}] must be positive",
            configured.scope.name
        );
        let mut acc = Accumulator::new(&configured.scope, default_tags.clone(), tx.clone())
            .with_context(|| format!("invalid scope for input [{}]", configured.scope.name))?;
        acc.set_precision(config.precision, interval);
        acc.set_debug(config.debug);
        acc.set_trace(config.trace);
        tasks.spawn(run_input(configured.input, acc, interval, shutdown.clone()));
    }
    // The inputs hold the only senders: when they stop, the channel closes
    // and the output task drains what remains.
    drop(tx);

    let output_task = tokio::spawn(run_output(output, rx));

    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = joined {
            log::error!("input task aborted: {e}");
        }
    }
    if let Err(e) = output_task.await {
        log::error!("output task aborted: {e}");
    }
    Ok(())
}

/// Drives one input: gather at every interval tick until shutdown, then
/// disconnect.
async fn run_input(
    mut input: Box<dyn Input>,
    mut acc: Accumulator,
    interval: Duration,
    shutdown: CancellationToken,
) {
    let name = acc.input_name().to_owned();
    log::info!("input [{name}] started: {}", input.description());

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let started = Instant::now();
        let pass = tokio::task::spawn_blocking(move || {
            let result = input.gather(&acc);
            (input, acc, result)
        });
        match pass.await {
            Ok((i, a, result)) => {
                input = i;
                acc = a;
                let elapsed = started.elapsed();
                match result {
                    Ok(()) => log::debug!("input [{name}] gathered in {elapsed:?}"),
                    Err(e) => log::error!("input [{name}] gather failed: {e:#}"),
                }
                if elapsed > interval {
                    log::warn!("input [{name}] took longer than the collection interval ({elapsed:?} > {interval:?})");
                }
            }
            Err(e) => {
                // The pass panicked: the input is lost, stop this task.
                log::error!("input [{name}] gather panicked: {e}");
                return;
            }
        }
    }

    input.disconnect();
    log::info!("input [{name}] stopped");
}

/// Drains the metric channel into the output, in batches, until the channel
/// closes.
async fn run_output(mut output: Box<dyn Output>, mut rx: mpsc::Receiver<Metric>) {
    let mut batch: Vec<Metric> = Vec::with_capacity(OUTPUT_BATCH);
    loop {
        let received = rx.recv_many(&mut batch, OUTPUT_BATCH).await;
        if received == 0 {
            break;
        }
        let write = tokio::task::spawn_blocking(move || {
            let result = output.write(&batch);
            (output, batch, result)
        });
        match write.await {
            Ok((o, mut b, result)) => {
                output = o;
                if let Err(e) = result {
                    log::error!("output write failed, dropping {} metrics: {e:#}", b.len());
                }
                b.clear();
                batch = b;
            }
            Err(e) => {
                log::error!("output write panicked: {e}");
                return;
            }
        }
    }
    log::debug!("metric channel closed, output stopped");
}
