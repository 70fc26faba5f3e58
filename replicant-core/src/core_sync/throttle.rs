/*
    throttle.rs - Coalescing of incoming update bursts

    A trailing throttle in front of the sync client:

        new_update ─► pending queue ─(delay elapsed)─► merge ─► released
                 │
                 └─ full update / disabled / delay == 0 ─────► released

    - The first queued update arms a timer for `delay`. Updates arriving
      while it is armed only queue. On fire the queue is merged and
      released, and the timer is disarmed.
    - A full update flushes the queue and then passes through.
    - disable_until(target) suspends queueing after the client's own
      mutating request, until an update reaching `target` has been seen.
      The highest version ever seen is tracked so a push that overtook the
      HTTP response does not leave the window open forever.

    Released updates go to an unbounded channel, in order. The delay is
    fixed at construction.
*/

use parking_lot::Mutex;
use serde::Deserialize;
use std::collections::btree_map::Entry;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use super::types::{record_id, IncrementalUpdate, Version};
use crate::metrics::{self, THROTTLE_FLUSHES, THROTTLE_MERGED};

/// Server provided settings: `{"AUTOUPDATE_DELAY": seconds}`
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ThrottleSettings {
    #[serde(rename = "AUTOUPDATE_DELAY", default)]
    pub autoupdate_delay: Option<f64>,
}

impl ThrottleSettings {
    /// Server value if present and sane, `fallback` otherwise.
    pub fn delay(&self, fallback: Duration) -> Duration {
        match self.autoupdate_delay {
            Some(seconds) if seconds.is_finite() && seconds >= 0.0 => Duration::from_secs_f64(seconds),
            Some(seconds) => {
                warn!(seconds, "ignoring invalid AUTOUPDATE_DELAY");
                fallback
            }
            None => fallback,
        }
    }
}

#[derive(Default)]
struct GateState {
    pending: Vec<IncrementalUpdate>,
    timer: Option<JoinHandle<()>>,
    disabled_until: Option<Version>,
    max_seen: Version,
}

struct GateInner {
    delay: Duration,
    state: Mutex<GateState>,
    output: mpsc::UnboundedSender<IncrementalUpdate>,
}

impl GateInner {
    fn release(&self, update: IncrementalUpdate) {
        trace!(from = update.from_version, to = update.to_version, "releasing update");
        if self.output.send(update).is_err() {
            debug!("throttle output closed, dropping update");
        }
    }

    /// Merge and release everything pending. Caller holds the state lock.
    fn flush_locked(&self, state: &mut GateState) {
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
        if state.pending.is_empty() {
            return;
        }
        let pending = std::mem::take(&mut state.pending);
        let merged = merge_updates(&pending);
        metrics::record_counter(THROTTLE_FLUSHES, 1);
        metrics::record_counter(THROTTLE_MERGED, pending.len() as u64);
        debug!(queued = pending.len(), released = merged.len(), "throttle flush");
        for update in merged {
            self.release(update);
        }
    }

    fn on_timer(&self) {
        let mut state = self.state.lock();
        // the timer task is the one running, nothing to abort
        state.timer = None;
        self.flush_locked(&mut state);
    }
}

/// Burst-coalescing gate
#[derive(Clone)]
pub struct ThrottleGate {
    inner: Arc<GateInner>,
}

impl std::fmt::Debug for ThrottleGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThrottleGate")
            .field("delay", &self.inner.delay)
            .field("pending", &self.pending_len())
            .finish_non_exhaustive()
    }
}

impl ThrottleGate {
    /// A zero delay makes the gate a pass-through.
    pub fn new(delay: Duration) -> (Self, mpsc::UnboundedReceiver<IncrementalUpdate>) {
        let (output, rx) = mpsc::unbounded_channel();
        let gate = Self {
            inner: Arc::new(GateInner {
                delay,
                state: Mutex::new(GateState::default()),
                output,
            }),
        };
        (gate, rx)
    }

    pub fn delay(&self) -> Duration {
        self.inner.delay
    }

    pub fn is_active(&self) -> bool {
        !self.inner.delay.is_zero()
    }

    pub fn max_seen_version(&self) -> Version {
        self.inner.state.lock().max_seen
    }

    pub fn pending_len(&self) -> usize {
        self.inner.state.lock().pending.len()
    }

    pub fn is_disabled(&self) -> bool {
        self.inner.state.lock().disabled_until.is_some()
    }

    /// Hand an incoming update to the gate. Must run inside a tokio runtime
    /// since it may arm the timer.
    pub fn new_update(&self, update: IncrementalUpdate) {
        let inner = &self.inner;
        let mut state = inner.state.lock();
        state.max_seen = state.max_seen.max(update.to_version);

        if !self.is_active() {
            inner.release(update);
            return;
        }

        // every update, full ones included, may close the window
        let window_open = match state.disabled_until {
            Some(target) => {
                if update.to_version >= target {
                    debug!(target, "disable window closed");
                    state.disabled_until = None;
                }
                true
            }
            None => false,
        };

        if update.full || window_open {
            inner.flush_locked(&mut state);
            inner.release(update);
            return;
        }

        state.pending.push(update);
        if state.timer.is_none() {
            let timer_inner = inner.clone();
            let delay = inner.delay;
            state.timer = Some(tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                timer_inner.on_timer();
            }));
        }
    }

    /// Suspend throttling until an update reaching `target` is seen.
    pub fn disable_until(&self, target: Version) {
        if !self.is_active() {
            return;
        }
        let mut state = self.inner.state.lock();
        if target <= state.max_seen {
            trace!(target, max_seen = state.max_seen, "target already seen");
            return;
        }
        self.inner.flush_locked(&mut state);
        state.disabled_until = Some(state.disabled_until.map_or(target, |t| t.max(target)));
    }

    /// Release everything pending now.
    pub fn flush(&self) {
        let mut state = self.inner.state.lock();
        self.inner.flush_locked(&mut state);
    }

    /// Drop everything pending and reopen the gate.
    pub fn discard(&self) {
        let mut state = self.inner.state.lock();
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
        if !state.pending.is_empty() {
            debug!(dropped = state.pending.len(), "discarding pending updates");
        }
        state.pending.clear();
        state.disabled_until = None;
    }
}

/// Merge a queue of updates, left to right.
///
/// Consecutive updates are folded into one as long as they chain
/// (`next.from <= acc.to + 1`). A gap starts a new run, so the result holds
/// one update per contiguous run and the consumer sees the gap. A full
/// update replaces whatever was accumulated.
pub fn merge_updates(updates: &[IncrementalUpdate]) -> Vec<IncrementalUpdate> {
    let mut runs = Vec::new();
    let mut acc: Option<IncrementalUpdate> = None;

    for update in updates {
        match acc.as_mut() {
            None => acc = Some(update.clone()),
            Some(_) if update.full => acc = Some(update.clone()),
            Some(current) if update.from_version > current.to_version.saturating_add(1) => {
                warn!(
                    last_to = current.to_version,
                    next_from = update.from_version,
                    "queued updates do not chain, splitting merge"
                );
                runs.extend(acc.replace(update.clone()));
            }
            Some(current) => {
                if update.from_version != current.to_version.saturating_add(1)
                    && update.from_version != current.to_version
                {
                    debug!(
                        last_to = current.to_version,
                        next_from = update.from_version,
                        "queued updates overlap"
                    );
                }
                fold(current, update);
            }
        }
    }

    runs.extend(acc);
    runs
}

fn fold(acc: &mut IncrementalUpdate, next: &IncrementalUpdate) {
    acc.from_version = acc.from_version.min(next.from_version);
    acc.to_version = acc.to_version.max(next.to_version);

    for (collection, ids) in &next.deleted {
        if let Some(records) = acc.changed.get_mut(collection) {
            records.retain(|record| record_id(record).map_or(true, |id| !ids.contains(&id)));
        }
        let deleted = acc.deleted.entry(collection.clone()).or_default();
        for id in ids {
            if !deleted.contains(id) {
                deleted.push(*id);
            }
        }
    }

    for (collection, records) in &next.changed {
        if let Entry::Occupied(mut deleted) = acc.deleted.entry(collection.clone()) {
            deleted
                .get_mut()
                .retain(|id| !records.iter().any(|r| record_id(r) == Some(*id)));
            if deleted.get().is_empty() {
                deleted.remove();
            }
        }
        let changed = acc.changed.entry(collection.clone()).or_default();
        for record in records {
            if let Some(id) = record_id(record) {
                changed.retain(|r| record_id(r) != Some(id));
            }
            changed.push(record.clone());
        }
    }

    acc.changed.retain(|_, records| !records.is_empty());
}
