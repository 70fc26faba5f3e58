/*
    mutex.rs - FIFO async lock serializing store mutations

    Lockers queue in arrival order. Releasing hands the lock directly to
    the oldest live waiter, so a burst of lockers can never be overtaken by
    a later arrival. The guard releases on drop, which makes "release
    exactly once per lock" a property of ownership.

    Not reentrant: locking again while holding a guard waits forever.
*/

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::trace;

#[derive(Debug, Default)]
struct LockState {
    locked: bool,
    waiters: VecDeque<oneshot::Sender<()>>,
}

/// Hand the lock to the next waiter that is still listening, or unlock.
fn release(state: &Mutex<LockState>) {
    let mut state = state.lock();
    while let Some(waiter) = state.waiters.pop_front() {
        if waiter.send(()).is_ok() {
            // ownership moved to the waiter, stay locked
            return;
        }
    }
    state.locked = false;
}

/// FIFO async mutex guarding no data of its own
#[derive(Debug, Clone, Default)]
pub struct FifoMutex {
    state: Arc<Mutex<LockState>>,
}

impl FifoMutex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for the lock. Requests are served in arrival order.
    pub async fn lock(&self) -> FifoGuard {
        let rx = {
            let mut state = self.state.lock();
            if !state.locked {
                state.locked = true;
                return FifoGuard::new(self.state.clone());
            }
            let (tx, rx) = oneshot::channel();
            state.waiters.push_back(tx);
            trace!(waiting = state.waiters.len(), "mutex busy, queued");
            rx
        };

        let mut waiter = Waiter {
            rx,
            state: self.state.clone(),
            acquired: false,
        };

        // Senders are only consumed by `release`, which sends before
        // dropping, so the receiver cannot observe a closed channel while
        // the state is alive.
        let _ = (&mut waiter.rx).await;
        waiter.acquired = true;
        FifoGuard::new(self.state.clone())
    }

    /// Try to take the lock without waiting.
    pub fn try_lock(&self) -> Option<FifoGuard> {
        let mut state = self.state.lock();
        if state.locked {
            None
        } else {
            state.locked = true;
            Some(FifoGuard::new(self.state.clone()))
        }
    }

    pub fn is_locked(&self) -> bool {
        self.state.lock().locked
    }

    /// Number of queued lockers.
    pub fn waiting(&self) -> usize {
        self.state.lock().waiters.len()
    }
}

/// A queued `lock()` call. If the caller gives up after the lock was
/// already handed over, the lock is passed on instead of leaking.
struct Waiter {
    rx: oneshot::Receiver<()>,
    state: Arc<Mutex<LockState>>,
    acquired: bool,
}

impl Drop for Waiter {
    fn drop(&mut self) {
        if self.acquired {
            return;
        }
        self.rx.close();
        if self.rx.try_recv().is_ok() {
            release(&self.state);
        }
    }
}

/// Proof of holding the lock. Dropping it releases the lock.
#[derive(Debug)]
pub struct FifoGuard {
    state: Option<Arc<Mutex<LockState>>>,
}

impl FifoGuard {
    fn new(state: Arc<Mutex<LockState>>) -> Self {
        Self { state: Some(state) }
    }

    /// Release explicitly. Equivalent to dropping the guard.
    pub fn release(mut self) {
        self.unlock();
    }

    fn unlock(&mut self) {
        if let Some(state) = self.state.take() {
            release(&state);
        }
    }
}

impl Drop for FifoGuard {
    fn drop(&mut self) {
        self.unlock();
    }
}
