// SPDX-License-Identifier: MPL-2.0

//! Cross-thread handoff of a single frame slot to the event loop.
//!
//! ```text
//! producer thread                    event loop thread
//! ───────────────                    ─────────────────
//! Idle ── write slot
//!      ── Scheduled (release) ─────▶ task: Scheduled → Running (acquire)
//!                                          copy slot into texture
//!      ◀──────────────────────────── in_flight -= 1, Idle (release)
//! ```
//!
//! # Turn-taking
//!
//! The slot has exactly one owner at a time, decided by the state word:
//!
//! - **Idle**: the producer may write it.
//! - **Scheduled**: nobody touches it; a task is queued on the loop.
//! - **Running**: the task copies it into the texture.
//!
//! A frame produced while `Scheduled` cancels the queued task if the loop
//! allows it and takes the slot back; otherwise, and always while `Running`,
//! the frame is dropped. The producer never waits on the loop.
//!
//! # Teardown
//!
//! [`HandoffController::shutdown`] cancels a queued task if it can, then
//! blocks on a condition variable until nothing is in flight. Only then are
//! the slot and texture released. The wait has no deadline; it wakes up
//! periodically only to log that it is still waiting.

mod types;

#[cfg(test)]
mod tests;

pub use types::{Handoff, HandoffState, HandoffStats};

use std::{
    cell::UnsafeCell,
    sync::{
        Arc, Condvar, Mutex, PoisonError,
        atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering},
    },
    time::{Duration, Instant},
};

use tracing::{debug, error, trace, warn};

use crate::{
    error::BridgeError,
    event_loop::EventLoopAdapter,
    sink::TextureSink,
    slot::{self, FrameSlot},
};
use types::StatCounters;

const IDLE: u8 = 0;
const SCHEDULED: u8 = 1;
const RUNNING: u8 = 2;
const DESTROYED: u8 = 3;

/// Flags and counters readable from any thread.
#[derive(Debug, Default)]
struct Status {
    state: AtomicU8,
    in_flight: AtomicUsize,
    shutting_down: AtomicBool,
    stats: StatCounters,
}

impl Status {
    fn state(&self) -> HandoffState {
        match self.state.load(Ordering::Acquire) {
            DESTROYED => HandoffState::Destroyed,
            _ if self.shutting_down.load(Ordering::Acquire) => HandoffState::ShuttingDown,
            IDLE => HandoffState::Idle,
            _ => HandoffState::Scheduled,
        }
    }

    fn is_quiescent(&self) -> bool {
        self.in_flight.load(Ordering::Acquire) == 0 && self.state.load(Ordering::Acquire) == IDLE
    }
}

struct Resources<S> {
    slot: FrameSlot,
    sink: S,
}

struct Shared<S> {
    status: Arc<Status>,
    resources: UnsafeCell<Option<Resources<S>>>,
    quiescent: Mutex<()>,
    idle: Condvar,
}

// SAFETY: `resources` is only accessed by the side the state word hands it to:
// the producer while Idle, the consumption task while Running, and teardown
// once quiescent. `S` is never shared, only moved between those turns.
unsafe impl<S: Send> Sync for Shared<S> {}

impl<S: TextureSink> Shared<S> {
    /// Body of the consumption task, run on the event loop thread.
    fn consume(&self) {
        let status = &self.status;
        if let Err(state) = status.state.compare_exchange(
            SCHEDULED,
            RUNNING,
            Ordering::Acquire,
            Ordering::Relaxed,
        ) {
            error!(state, "Frame task ran without a scheduled frame");
            return;
        }

        let _finish = FinishGuard(self);

        // SAFETY: Running grants this task the slot until `_finish` stores Idle.
        let Some(Resources { slot, sink }) = (unsafe { &mut *self.resources.get() }).as_mut()
        else {
            return;
        };

        match slot.read_into(sink) {
            Ok(()) => {
                let delivered = StatCounters::bump(&status.stats.delivered);
                trace!(delivered, "Frame copied into texture");
            }
            Err(err) => {
                StatCounters::bump(&status.stats.failed);
                warn!(error = %err, "Texture upload failed");
            }
        }
    }

    fn finish_task(&self) {
        let status = &self.status;
        let previous = status.in_flight.fetch_sub(1, Ordering::AcqRel);
        debug_assert_eq!(previous, 1, "in-flight count underflow");
        status.state.store(IDLE, Ordering::Release);

        let _guard = self.quiescent.lock().unwrap_or_else(PoisonError::into_inner);
        self.idle.notify_all();
    }
}

/// Hands the slot back to the producer even if the texture upload panics.
struct FinishGuard<'a, S: TextureSink>(&'a Shared<S>);

impl<S: TextureSink> Drop for FinishGuard<'_, S> {
    fn drop(&mut self) {
        self.0.finish_task();
    }
}

/// Read-only view of a controller, usable from any thread.
#[derive(Debug, Clone)]
pub struct HandoffProbe(Arc<Status>);

impl HandoffProbe {
    #[must_use]
    pub fn state(&self) -> HandoffState {
        self.0.state()
    }

    /// Number of consumption tasks scheduled or running; never more than one.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.0.in_flight.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn stats(&self) -> HandoffStats {
        self.0.stats.snapshot()
    }
}

/// Owner of the frame slot and the producer side of the handoff.
///
/// Frames go in through [`produce`](Self::produce) on one thread and come out
/// on the event loop thread, copied into the sink. There is one controller per
/// slot and it is not `Clone`, so there is at most one writer.
pub struct HandoffController<S: TextureSink + 'static, E: EventLoopAdapter> {
    shared: Arc<Shared<S>>,
    event_loop: E,
    /// Handle of the most recently scheduled task.
    pending: Option<E::Handle>,
    dims: (u32, u32),
    progress_interval: Duration,
}

impl<S: TextureSink + 'static, E: EventLoopAdapter> HandoffController<S, E> {
    /// Take ownership of a slot and its texture.
    ///
    /// `progress_interval` only controls how often a blocked teardown logs.
    pub fn new(slot: FrameSlot, sink: S, event_loop: E, progress_interval: Duration) -> Self {
        let dims = (slot.width(), slot.height());
        Self {
            shared: Arc::new(Shared {
                status: Arc::new(Status::default()),
                resources: UnsafeCell::new(Some(Resources { slot, sink })),
                quiescent: Mutex::new(()),
                idle: Condvar::new(),
            }),
            event_loop,
            pending: None,
            dims,
            progress_interval,
        }
    }

    /// Offer a frame to the event loop.
    ///
    /// Never blocks. The frame is scheduled if the slot is free, replaces a
    /// pending frame whose task can still be cancelled, or is dropped.
    ///
    /// # Errors
    ///
    /// Fails with [`BridgeError::FrameSize`] if the frame does not match the
    /// slot; nothing is scheduled or cancelled in that case.
    pub fn produce(&mut self, pixels: &[u8], width: u32, height: u32) -> Result<Handoff, BridgeError> {
        slot::validate_frame(self.dims, pixels, width, height)?;

        let state = self.shared.status.state.load(Ordering::Acquire);
        let outcome = match state {
            IDLE => self.write_and_schedule(pixels, width, height, Handoff::Scheduled)?,
            SCHEDULED if self.reclaim() => {
                StatCounters::bump(&self.shared.status.stats.replaced);
                trace!("Frame replaced: pending task cancelled");
                self.write_and_schedule(pixels, width, height, Handoff::Replaced)?
            }
            _ => Handoff::Dropped,
        };

        if outcome == Handoff::Dropped {
            let dropped = StatCounters::bump(&self.shared.status.stats.dropped);
            trace!(dropped, "Frame dropped: consumption in flight");
        }

        Ok(outcome)
    }

    /// Write into the slot and hand a consumption task to the loop.
    ///
    /// The caller must have observed Idle, or cancelled the queued task.
    fn write_and_schedule(
        &mut self,
        pixels: &[u8],
        width: u32,
        height: u32,
        outcome: Handoff,
    ) -> Result<Handoff, BridgeError> {
        let status = &self.shared.status;

        // SAFETY: Idle means no task can reach the slot, and only this
        // controller moves the state out of Idle.
        let Some(resources) = (unsafe { &mut *self.shared.resources.get() }).as_mut() else {
            return Ok(Handoff::Dropped);
        };
        resources.slot.write(pixels, width, height)?;

        let previous = status.in_flight.fetch_add(1, Ordering::AcqRel);
        if previous != 0 {
            error!(previous, "Frame scheduled while another task is in flight");
            debug_assert_eq!(previous, 0);
        }
        status.state.store(SCHEDULED, Ordering::Release);

        let shared = Arc::clone(&self.shared);
        self.pending = Some(self.event_loop.schedule(Box::new(move || shared.consume())));
        StatCounters::bump(&status.stats.scheduled);

        Ok(outcome)
    }

    /// Cancel the queued task and take the slot back.
    ///
    /// Returns `false` if there is no queued task or it already started.
    fn reclaim(&mut self) -> bool {
        let Some(handle) = self.pending.take() else {
            return false;
        };
        if !self.event_loop.cancel(handle) {
            return false;
        }

        // The cancelled task never runs, so this is its completion.
        let status = &self.shared.status;
        status.in_flight.fetch_sub(1, Ordering::AcqRel);
        status.state.store(IDLE, Ordering::Release);
        true
    }

    #[must_use]
    pub fn state(&self) -> HandoffState {
        self.shared.status.state()
    }

    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.shared.status.in_flight.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn stats(&self) -> HandoffStats {
        self.shared.status.stats.snapshot()
    }

    #[must_use]
    pub fn probe(&self) -> HandoffProbe {
        HandoffProbe(Arc::clone(&self.shared.status))
    }

    /// Stop accepting frames, wait for the event loop, release the slot and
    /// texture.
    ///
    /// Blocks while a consumption task is running, or queued on a loop that
    /// cannot cancel it. Must not be called from the event loop thread.
    pub fn shutdown(mut self) -> HandoffStats {
        self.quiesce()
    }

    fn quiesce(&mut self) -> HandoffStats {
        let status = Arc::clone(&self.shared.status);
        status.shutting_down.store(true, Ordering::Release);
        debug!(in_flight = self.in_flight(), "Shutting down frame handoff");

        if self.reclaim() {
            debug!("Cancelled pending frame task");
        }

        let started = Instant::now();
        let mut guard = self
            .shared
            .quiescent
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        while !status.is_quiescent() {
            let (next, wait) = self
                .shared
                .idle
                .wait_timeout(guard, self.progress_interval)
                .unwrap_or_else(PoisonError::into_inner);
            guard = next;
            if wait.timed_out() && !status.is_quiescent() {
                warn!(
                    waited_ms = started.elapsed().as_millis(),
                    "Still waiting for the event loop to finish the in-flight frame"
                );
            }
        }
        drop(guard);

        status.state.store(DESTROYED, Ordering::Release);

        // SAFETY: nothing is in flight and nothing can be scheduled any more.
        if let Some(Resources { slot, sink }) = unsafe { (*self.shared.resources.get()).take() } {
            let bytes = slot.len();
            drop(sink);
            drop(slot);
            debug!(bytes, "Released frame buffer and texture");
        }

        status.stats.snapshot()
    }
}

impl<S: TextureSink + 'static, E: EventLoopAdapter> Drop for HandoffController<S, E> {
    fn drop(&mut self) {
        if self.shared.status.state.load(Ordering::Acquire) != DESTROYED {
            self.quiesce();
        }
    }
}

impl<S: TextureSink + 'static, E: EventLoopAdapter> std::fmt::Debug for HandoffController<S, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandoffController")
            .field("state", &self.state())
            .field("in_flight", &self.in_flight())
            .field("dims", &self.dims)
            .finish_non_exhaustive()
    }
}
