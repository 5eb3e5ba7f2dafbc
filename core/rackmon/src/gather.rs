//! Concurrent gathering over several targets.
//!
//! Inputs that query a fleet of endpoints in one pass (one reading source per
//! configured server) run one worker per target through [`gather_targets`].
//! Workers run on scoped threads, so they can borrow the accumulator and the
//! input's state; the call returns once every worker has finished, with all
//! the failures aggregated.

use std::fmt;
use std::sync::mpsc;
use std::thread;

/// Runs `worker` once per target, concurrently, and joins all the workers.
///
/// Results are collected through a channel sized to the exact worker count,
/// so a finished worker never waits to report. One target failing does not
/// stop nor delay its siblings: the metrics pushed by successful workers are
/// untouched, and every failure ends up in the returned [`GatherErrors`].
///
/// The caller resolves the target list first. When the configuration lists no
/// target, the input substitutes its default target before calling, so the
/// list is normally not empty here (an empty list is a no-op).
pub fn gather_targets<T, F>(targets: &[T], worker: F) -> Result<(), GatherErrors>
where
    T: Sync,
    F: Fn(&T) -> anyhow::Result<()> + Sync,
{
    let (tx, rx) = mpsc::sync_channel(targets.len());
    thread::scope(|scope| {
        for target in targets {
            let tx = tx.clone();
            let worker = &worker;
            scope.spawn(move || {
                let result = worker(target);
                tx.send(result).expect("the result channel holds one slot per worker");
            });
        }
    });
    drop(tx);

    let errors: Vec<anyhow::Error> = rx.into_iter().filter_map(Result::err).collect();
    if errors.is_empty() { Ok(()) } else { Err(GatherErrors { errors }) }
}

/// Aggregate of the failures of a multi-target gather pass.
///
/// Holds every worker failure; the display joins all the messages, so one log
/// line shows every failing target.
#[derive(Debug)]
pub struct GatherErrors {
    errors: Vec<anyhow::Error>,
}

impl GatherErrors {
    /// Number of failed workers.
    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    /// The collected failures.
    pub fn errors(&self) -> &[anyhow::Error] {
        &self.errors
    }
}

impl fmt::Display for GatherErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} target(s) failed: ", self.errors.len())?;
        for (i, e) in self.errors.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{e:#}")?;
        }
        Ok(())
    }
}

impl std::error::Error for GatherErrors {}
