use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::debug;
use parking_lot::{Condvar, Mutex};

use crate::errors::{HarnessError, Result};
use crate::scenario::BarrierId;

#[derive(Debug, Default)]
struct BarrierState {
    arrived: usize,
    released: bool,
    cancelled: bool,
}

/// Single-use rendezvous point for a fixed number of parties.
///
/// Every party blocks in [`RendezvousBarrier::wait`] until all parties have
/// arrived, the deadline passes, or the barrier is cancelled. Unlike
/// `std::sync::Barrier` it supports a timeout and cancellation, which is what
/// lets a failing participant release its peers instead of leaving them parked
/// forever.
#[derive(Debug)]
pub struct RendezvousBarrier {
    id: BarrierId,
    parties: usize,
    state: Mutex<BarrierState>,
    released: Condvar,
}

impl RendezvousBarrier {
    pub fn new(id: BarrierId, parties: usize) -> Self {
        Self {
            id,
            parties,
            state: Mutex::new(BarrierState::default()),
            released: Condvar::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn parties(&self) -> usize {
        self.parties
    }

    /// Arrives at the barrier and blocks until every party has arrived.
    ///
    /// # Errors
    ///
    /// * `HarnessError::Timeout` if the remaining parties did not arrive within
    ///   `timeout`. The barrier is then closed and later arrivals get
    ///   `Cancelled`.
    /// * `HarnessError::Cancelled` if the barrier was cancelled before or while
    ///   waiting.
    pub fn wait(&self, timeout: Duration) -> Result<()> {
        let started = Instant::now();
        let deadline = started + timeout;
        let mut state = self.state.lock();
        if state.cancelled {
            return Err(self.cancelled());
        }
        state.arrived += 1;
        if state.arrived >= self.parties {
            state.released = true;
            self.released.notify_all();
            debug!("Barrier '{}' released ({} parties)", self.id, self.parties);
            return Ok(());
        }

        while !state.released && !state.cancelled {
            if self.released.wait_until(&mut state, deadline).timed_out() {
                break;
            }
        }

        if state.released {
            Ok(())
        } else if state.cancelled {
            Err(self.cancelled())
        } else {
            // Closed under the same lock, so no later arrival can cross a
            // barrier this party gave up on.
            state.cancelled = true;
            self.released.notify_all();
            debug!("Barrier '{}' abandoned after timeout", self.id);
            Err(HarnessError::Timeout {
                what: format!(
                    "barrier '{}' ({} of {} parties arrived)",
                    self.id, state.arrived, self.parties
                ),
                after: started.elapsed(),
            })
        }
    }

    /// Wakes every waiter with `Cancelled` and makes later arrivals fail fast.
    /// Has no effect on a barrier that was already released.
    pub fn cancel(&self) {
        let mut state = self.state.lock();
        if !state.released && !state.cancelled {
            state.cancelled = true;
            self.released.notify_all();
            debug!("Barrier '{}' cancelled", self.id);
        }
    }

    pub fn is_released(&self) -> bool {
        self.state.lock().released
    }

    fn cancelled(&self) -> HarnessError {
        HarnessError::Cancelled(format!("barrier '{}' was cancelled", self.id))
    }
}

/// The barriers of one scenario run, owned by the scheduler.
#[derive(Debug, Default)]
pub struct BarrierSet {
    barriers: BTreeMap<BarrierId, Arc<RendezvousBarrier>>,
}

impl BarrierSet {
    /// One barrier per id, sized by the number of participants naming it.
    pub fn new(parties: BTreeMap<BarrierId, usize>) -> Self {
        let barriers = parties
            .into_iter()
            .map(|(id, count)| {
                let barrier = Arc::new(RendezvousBarrier::new(id.clone(), count));
                (id, barrier)
            })
            .collect();
        Self { barriers }
    }

    pub fn get(&self, id: &str) -> Result<&Arc<RendezvousBarrier>> {
        self.barriers
            .get(id)
            .ok_or_else(|| HarnessError::State(format!("unknown barrier '{}'", id)))
    }

    /// Cancels every barrier that has not been released yet.
    pub fn cancel_all(&self) {
        for barrier in self.barriers.values() {
            barrier.cancel();
        }
    }

    pub fn len(&self) -> usize {
        self.barriers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.barriers.is_empty()
    }
}
