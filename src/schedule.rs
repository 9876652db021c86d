//! Timed and periodic command scheduling.
//!
//! The scheduler keeps a totally ordered set of commands keyed by due time,
//! with ties broken by insertion sequence. Commands only ever execute inside
//! [`Scheduler::run_pending`], so callback execution is single-threaded with
//! respect to the driving loop even though commands may be added or canceled
//! concurrently from other tasks.
//!
//! Two periodic policies exist: fixed-rate reinserts at `due + interval`
//! (missed executions are caught up, bounded by `max_catchup`), fixed-delay
//! reinserts at `now + interval` (missed executions are skipped).

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{ClientError, Result};

/// Identifies a scheduled command for cancellation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct CommandId(u64);

/// Scheduled callback signature.
pub type Callback = Box<dyn FnMut() -> anyhow::Result<()> + Send>;

/// Reinsertion policy after a command fires.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Repeat {
    /// One-shot: removed after firing.
    Never,
    /// Next due time is `previous_due + interval`; late fires catch up.
    FixedRate(Duration),
    /// Next due time is `now + interval`; late fires are skipped.
    FixedDelay(Duration),
}

struct Entry {
    id: u64,
    repeat: Repeat,
    callback: Callback,
}

#[derive(Default)]
struct Inner {
    queue: BTreeMap<(Instant, u64), Entry>,
    /// Id of the command currently executing, if any.
    in_flight: Option<u64>,
    /// Set when the in-flight command was canceled mid-execution;
    /// suppresses periodic reinsertion.
    cancel_in_flight: bool,
}

/// Scheduler tuning knobs.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Maximum consecutive catch-up fires for one fixed-rate command within
    /// a single `run_pending` call; past this the command skips ahead to
    /// `now + interval`.
    pub max_catchup: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self { max_catchup: 8 }
    }
}

/// Ordered collection of one-shot and periodic timed commands.
pub struct Scheduler {
    inner: Mutex<Inner>,
    seq: AtomicU64,
    config: SchedulerConfig,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new(SchedulerConfig::default())
    }
}

impl Scheduler {
    /// Create a scheduler with the given configuration.
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            seq: AtomicU64::new(0),
            config,
        }
    }

    fn insert(&self, due: Instant, repeat: Repeat, callback: Callback) -> CommandId {
        let id = self.seq.fetch_add(1, Ordering::Relaxed);
        self.inner.lock().queue.insert(
            (due, id),
            Entry {
                id,
                repeat,
                callback,
            },
        );
        CommandId(id)
    }

    /// Run `callback` once after `delay`.
    pub fn after(
        &self,
        delay: Duration,
        callback: impl FnMut() -> anyhow::Result<()> + Send + 'static,
    ) -> CommandId {
        self.insert(Instant::now() + delay, Repeat::Never, Box::new(callback))
    }

    /// Run `callback` once at a wall-clock instant (timezone-aware).
    ///
    /// An instant in the past is due immediately.
    pub fn at<Tz: TimeZone>(
        &self,
        when: DateTime<Tz>,
        callback: impl FnMut() -> anyhow::Result<()> + Send + 'static,
    ) -> CommandId {
        let delta = (when.with_timezone(&Utc) - Utc::now())
            .to_std()
            .unwrap_or(Duration::ZERO);
        self.after(delta, callback)
    }

    /// Run `callback` every `interval`, fixed-rate (missed runs catch up).
    pub fn every(
        &self,
        interval: Duration,
        callback: impl FnMut() -> anyhow::Result<()> + Send + 'static,
    ) -> Result<CommandId> {
        if interval.is_zero() {
            return Err(ClientError::InvalidInterval);
        }
        Ok(self.insert(
            Instant::now() + interval,
            Repeat::FixedRate(interval),
            Box::new(callback),
        ))
    }

    /// Run `callback` every `interval`, fixed-delay (missed runs skipped).
    pub fn every_fixed_delay(
        &self,
        interval: Duration,
        callback: impl FnMut() -> anyhow::Result<()> + Send + 'static,
    ) -> Result<CommandId> {
        if interval.is_zero() {
            return Err(ClientError::InvalidInterval);
        }
        Ok(self.insert(
            Instant::now() + interval,
            Repeat::FixedDelay(interval),
            Box::new(callback),
        ))
    }

    /// Remove a still-pending command. Canceling a command that already
    /// fired (or does not exist) has no effect and returns `false`.
    pub fn cancel(&self, id: CommandId) -> bool {
        let mut inner = self.inner.lock();
        if inner.in_flight == Some(id.0) {
            inner.cancel_in_flight = true;
            return false;
        }
        let key = inner
            .queue
            .iter()
            .find(|(_, e)| e.id == id.0)
            .map(|(k, _)| *k);
        match key {
            Some(key) => {
                inner.queue.remove(&key);
                true
            }
            None => false,
        }
    }

    /// The earliest pending due time, for the driving loop's wait bound.
    pub fn next_due(&self) -> Option<Instant> {
        self.inner.lock().queue.keys().next().map(|(due, _)| *due)
    }

    /// Number of pending commands.
    pub fn len(&self) -> usize {
        self.inner.lock().queue.len()
    }

    /// Whether no commands are pending.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fire every command whose due time has passed, in due-time order.
    /// Returns the number of fires.
    pub fn run_pending(&self) -> usize {
        self.run_pending_at(Instant::now())
    }

    /// [`Self::run_pending`] with an explicit clock, for deterministic tests.
    pub fn run_pending_at(&self, now: Instant) -> usize {
        let mut fired = 0usize;
        let mut catchup: HashMap<u64, u32> = HashMap::new();
        loop {
            let (key, mut entry) = {
                let mut inner = self.inner.lock();
                match inner.queue.first_key_value() {
                    Some((&(due, _), _)) if due <= now => {}
                    _ => break,
                }
                let Some((key, entry)) = inner.queue.pop_first() else {
                    break;
                };
                inner.in_flight = Some(entry.id);
                inner.cancel_in_flight = false;
                (key, entry)
            };

            if let Err(err) = (entry.callback)() {
                warn!(command = entry.id, error = %err, "scheduled command failed");
            }
            fired += 1;

            let mut inner = self.inner.lock();
            let canceled = std::mem::take(&mut inner.cancel_in_flight);
            inner.in_flight = None;
            if canceled {
                continue;
            }
            let next_due = match entry.repeat {
                Repeat::Never => continue,
                Repeat::FixedRate(interval) => {
                    let runs = catchup.entry(entry.id).or_insert(0);
                    *runs += 1;
                    let due = key.0 + interval;
                    if due <= now && *runs >= self.config.max_catchup {
                        // Stalled far past the catch-up budget; skip ahead.
                        now + interval
                    } else {
                        due
                    }
                }
                Repeat::FixedDelay(interval) => now + interval,
            };
            let seq = self.seq.fetch_add(1, Ordering::Relaxed);
            let id = entry.id;
            inner.queue.insert(
                (next_due, seq),
                Entry {
                    id,
                    repeat: entry.repeat,
                    callback: entry.callback,
                },
            );
        }
        fired
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn recorder() -> (Arc<Mutex<Vec<&'static str>>>, impl Fn(&'static str) -> Callback) {
        let log: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));
        let mk = {
            let log = log.clone();
            move |name: &'static str| -> Callback {
                let log = log.clone();
                Box::new(move || {
                    log.lock().push(name);
                    Ok(())
                })
            }
        };
        (log, mk)
    }

    #[test]
    fn fires_in_due_order() {
        let s = Scheduler::default();
        let (log, mk) = recorder();
        s.after(Duration::from_millis(30), {
            let mut cb = mk("t3");
            move || cb()
        });
        s.after(Duration::from_millis(10), {
            let mut cb = mk("t1");
            move || cb()
        });
        s.after(Duration::from_millis(20), {
            let mut cb = mk("t2");
            move || cb()
        });
        let fired = s.run_pending_at(Instant::now() + Duration::from_secs(1));
        assert_eq!(fired, 3);
        assert_eq!(*log.lock(), vec!["t1", "t2", "t3"]);
        assert!(s.is_empty());
    }

    #[test]
    fn equal_due_times_keep_insertion_order() {
        let s = Scheduler::default();
        let (log, mk) = recorder();
        for name in ["a", "b", "c"] {
            let mut cb = mk(name);
            s.after(Duration::ZERO, move || cb());
        }
        s.run_pending_at(Instant::now() + Duration::from_millis(1));
        assert_eq!(*log.lock(), vec!["a", "b", "c"]);
    }

    #[test]
    fn zero_interval_rejected() {
        let s = Scheduler::default();
        assert!(matches!(
            s.every(Duration::ZERO, || Ok(())),
            Err(ClientError::InvalidInterval)
        ));
        assert!(matches!(
            s.every_fixed_delay(Duration::ZERO, || Ok(())),
            Err(ClientError::InvalidInterval)
        ));
    }

    #[test]
    fn fixed_rate_catches_up() {
        let s = Scheduler::default();
        let count = Arc::new(Mutex::new(0u32));
        let c = count.clone();
        let d = Duration::from_millis(100);
        s.every(d, move || {
            *c.lock() += 1;
            Ok(())
        })
        .unwrap();
        // Stall 3 intervals past the first due time: k = 3, so k+1 fires.
        let fired = s.run_pending_at(Instant::now() + d * 4);
        assert_eq!(fired, 4);
        assert_eq!(*count.lock(), 4);
        // The reinserted due time is now in the future.
        assert_eq!(s.run_pending_at(Instant::now() + d * 4), 0);
    }

    #[test]
    fn fixed_rate_catchup_is_capped() {
        let s = Scheduler::new(SchedulerConfig { max_catchup: 3 });
        let d = Duration::from_millis(10);
        s.every(d, || Ok(())).unwrap();
        let fired = s.run_pending_at(Instant::now() + d * 1000);
        assert_eq!(fired, 3);
    }

    #[test]
    fn fixed_delay_never_catches_up() {
        let s = Scheduler::default();
        let d = Duration::from_millis(100);
        s.every_fixed_delay(d, || Ok(())).unwrap();
        let fired = s.run_pending_at(Instant::now() + d * 50);
        assert_eq!(fired, 1);
    }

    #[test]
    fn one_shot_removed_after_fire() {
        let s = Scheduler::default();
        let id = s.after(Duration::ZERO, || Ok(()));
        s.run_pending_at(Instant::now() + Duration::from_millis(1));
        assert!(!s.cancel(id), "cancel after fire is a no-op");
    }

    #[test]
    fn cancel_pending_removes() {
        let s = Scheduler::default();
        let (log, mk) = recorder();
        let mut cb = mk("never");
        let id = s.after(Duration::ZERO, move || cb());
        assert!(s.cancel(id));
        s.run_pending_at(Instant::now() + Duration::from_secs(1));
        assert!(log.lock().is_empty());
    }

    #[test]
    fn failing_command_does_not_block_others() {
        let s = Scheduler::default();
        let (log, mk) = recorder();
        s.after(Duration::ZERO, || anyhow::bail!("boom"));
        let mut cb = mk("ran");
        s.after(Duration::from_millis(1), move || cb());
        let fired = s.run_pending_at(Instant::now() + Duration::from_secs(1));
        assert_eq!(fired, 2);
        assert_eq!(*log.lock(), vec!["ran"]);
    }

    #[test]
    fn at_accepts_past_instants() {
        let s = Scheduler::default();
        let (log, mk) = recorder();
        let mut cb = mk("past");
        s.at(Utc::now() - chrono::Duration::seconds(5), move || cb());
        s.run_pending_at(Instant::now() + Duration::from_millis(1));
        assert_eq!(*log.lock(), vec!["past"]);
    }
}
