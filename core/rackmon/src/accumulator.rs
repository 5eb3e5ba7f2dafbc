//! The accumulator: normalizes raw readings into [`Metric`] records.
//!
//! Inputs do not build metric records themselves. They push raw readings
//! through an [`Accumulator`], which owns the whole construction pipeline:
//! name resolution, tag precedence, filtering, value normalization, timestamp
//! rounding and publication on the agent channel. Every published metric went
//! through that pipeline, there is no other way to produce one.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::Context;
use tokio::sync::mpsc;

use crate::filter::CompiledFilter;
use crate::metric::{FieldValue, Fields, Metric, Tags, Timestamp, ValueType};
use crate::plugin::InputScope;

/// Per-input normalization context. Publishes every accepted metric on the
/// shared agent channel.
///
/// The add-operations take `&self`: one accumulator is shared by all the
/// gather workers of its input. Publication uses a blocking send, so the
/// add-operations must be called from ordinary (or blocking-pool) threads,
/// never from an async task.
pub struct Accumulator {
    metrics: mpsc::Sender<Metric>,
    input_name: String,
    name_override: String,
    name_prefix: String,
    name_suffix: String,
    input_tags: Tags,
    default_tags: Tags,
    filter: CompiledFilter,
    precision: Duration,
    debug: bool,
    trace: bool,
    errors: AtomicU64,
}

impl Accumulator {
    /// Builds the accumulator of one input.
    ///
    /// `default_tags` are the daemon-wide tags; they are fixed for the
    /// lifetime of the accumulator. Fails when the filter patterns of the
    /// scope do not compile.
    pub fn new(scope: &InputScope, default_tags: Tags, metrics: mpsc::Sender<Metric>) -> anyhow::Result<Self> {
        let filter = scope.filter.compile().context("invalid filter patterns")?;
        Ok(Self {
            metrics,
            input_name: scope.name.clone(),
            name_override: scope.name_override.clone(),
            name_prefix: scope.name_prefix.clone(),
            name_suffix: scope.name_suffix.clone(),
            input_tags: scope.tags.clone(),
            default_tags,
            filter,
            precision: Duration::from_nanos(1),
            debug: false,
            trace: false,
            errors: AtomicU64::new(0),
        })
    }

    /// Name of the input this accumulator belongs to.
    pub fn input_name(&self) -> &str {
        &self.input_name
    }

    /// Records a reading with no declared accumulation semantics.
    ///
    /// `timestamp` is the instant of the reading, `None` means now. The
    /// reading goes through the normalization pipeline and, when accepted, is
    /// published on the agent channel; a full channel blocks the caller until
    /// the output side catches up.
    pub fn add_fields(&self, measurement: &str, fields: Fields, tags: Tags, timestamp: Option<Timestamp>) {
        self.add(measurement, fields, tags, ValueType::Untyped, timestamp);
    }

    /// Records a gauge: a value that goes up and down.
    pub fn add_gauge(&self, measurement: &str, fields: Fields, tags: Tags, timestamp: Option<Timestamp>) {
        self.add(measurement, fields, tags, ValueType::Gauge, timestamp);
    }

    /// Records a counter: a monotonically increasing value.
    pub fn add_counter(&self, measurement: &str, fields: Fields, tags: Tags, timestamp: Option<Timestamp>) {
        self.add(measurement, fields, tags, ValueType::Counter, timestamp);
    }

    /// Reports a non-fatal runtime error of the input.
    ///
    /// The error is counted and logged, tagged with the input's name. Use
    /// this for per-item failures that leave the rest of the gather pass
    /// usable; fail the whole pass by returning an error from
    /// [`gather`](crate::plugin::Input::gather) instead.
    pub fn add_error(&self, err: anyhow::Error) {
        self.errors.fetch_add(1, Ordering::Relaxed);
        log::error!("error in input [{}]: {err:#}", self.input_name);
    }

    /// Number of errors reported through [`add_error`](Self::add_error).
    pub fn error_count(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    /// Sets the timestamp rounding precision.
    ///
    /// An explicit non-zero `precision` is adopted as-is. Otherwise the
    /// precision is derived from the collection `interval`: at least one
    /// second rounds to the second, at least one millisecond to the
    /// millisecond, at least one microsecond to the microsecond, anything
    /// shorter keeps nanosecond resolution.
    ///
    /// The precision is read when a reading is timestamped, so changing it
    /// affects subsequent readings only.
    pub fn set_precision(&mut self, precision: Option<Duration>, interval: Duration) {
        match precision {
            Some(p) if !p.is_zero() => self.precision = p,
            _ => {
                self.precision = if interval >= Duration::from_secs(1) {
                    Duration::from_secs(1)
                } else if interval >= Duration::from_millis(1) {
                    Duration::from_millis(1)
                } else if interval >= Duration::from_micros(1) {
                    Duration::from_micros(1)
                } else {
                    Duration::from_nanos(1)
                };
            }
        }
    }

    /// Disables timestamp rounding (nanosecond resolution).
    pub fn disable_precision(&mut self) {
        self.precision = Duration::from_nanos(1);
    }

    pub fn debug(&self) -> bool {
        self.debug
    }

    /// Enables the diagnostic logged when a non-finite field value is
    /// dropped.
    pub fn set_debug(&mut self, debug: bool) {
        self.debug = debug;
    }

    pub fn trace(&self) -> bool {
        self.trace
    }

    /// Enables the echo of every published point to the log.
    pub fn set_trace(&mut self, trace: bool) {
        self.trace = trace;
    }

    fn add(&self, measurement: &str, fields: Fields, tags: Tags, value_type: ValueType, timestamp: Option<Timestamp>) {
        let Some(metric) = self.make_metric(measurement, fields, tags, value_type, timestamp) else {
            return;
        };
        if self.trace {
            log::trace!("> {metric}");
        }
        if self.metrics.blocking_send(metric).is_err() {
            // Shutdown race: the receiving side is gone.
            log::warn!("metric channel closed, dropping a point from input [{}]", self.input_name);
        }
    }

    /// Runs the construction pipeline on one reading. `None` means the
    /// reading was rejected (empty, filtered out, or failing validation).
    fn make_metric(
        &self,
        measurement: &str,
        mut fields: Fields,
        mut tags: Tags,
        value_type: ValueType,
        timestamp: Option<Timestamp>,
    ) -> Option<Metric> {
        if fields.is_empty() || measurement.is_empty() {
            return None;
        }

        let name = if self.name_override.is_empty() {
            format!("{}{measurement}{}", self.name_prefix, self.name_suffix)
        } else {
            self.name_override.clone()
        };

        // Tag precedence: explicit reading tags, then the input's configured
        // tags, then the daemon defaults. First writer wins.
        for (key, value) in &self.input_tags {
            if !tags.contains_key(key) {
                tags.insert(key.clone(), value.clone());
            }
        }
        for (key, value) in &self.default_tags {
            if !tags.contains_key(key) {
                tags.insert(key.clone(), value.clone());
            }
        }

        if !self.filter.apply(&name, &mut fields, &mut tags) {
            return None;
        }

        // Downstream consumers have no unsigned type: convert raw u64
        // counters, clamping to i64::MAX. Non-finite floats cannot be
        // serialized: drop the field, keep the rest of the reading.
        fields.retain(|key, value| match value {
            FieldValue::UInt(v) => {
                *value = FieldValue::Int(i64::try_from(*v).unwrap_or(i64::MAX));
                true
            }
            FieldValue::Float(v) if !v.is_finite() => {
                if self.debug {
                    log::debug!("measurement [{name}] field [{key}] is NaN or infinite, skipping the field");
                }
                false
            }
            _ => true,
        });

        let timestamp = timestamp.unwrap_or_else(Timestamp::now).round(self.precision);

        match Metric::new(name, tags, fields, timestamp, value_type) {
            Ok(metric) => Some(metric),
            Err(e) => {
                log::error!("error adding point [{measurement}]: {e}");
                None
            }
        }
    }
}
