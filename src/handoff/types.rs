// SPDX-License-Identifier: MPL-2.0

//! Public types describing the handoff state machine.

use std::sync::atomic::{AtomicU64, Ordering};

/// Observable lifecycle of a handoff controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandoffState {
    /// No frame is waiting for the event loop.
    Idle,
    /// A consumption task was handed to the event loop and has not finished.
    Scheduled,
    /// Teardown started; no new frames are accepted.
    ShuttingDown,
    /// Buffer and texture have been released.
    Destroyed,
}

/// What happened to a frame passed to `produce`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub enum Handoff {
    /// The frame was written and a consumption task scheduled.
    Scheduled,
    /// A pending frame whose task had not started was cancelled and replaced
    /// by this one.
    Replaced,
    /// A consumption task was already running; the frame was discarded.
    Dropped,
}

/// Statistics about frame handoff.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HandoffStats {
    /// Consumption tasks handed to the event loop.
    pub frames_scheduled: u64,
    /// Pending frames cancelled in favour of a newer one.
    pub frames_replaced: u64,
    /// Frames discarded because a task was in flight.
    pub frames_dropped: u64,
    /// Frames copied into the texture.
    pub frames_delivered: u64,
    /// Uploads the texture rejected.
    pub uploads_failed: u64,
}

#[derive(Debug, Default)]
pub(crate) struct StatCounters {
    pub scheduled: AtomicU64,
    pub replaced: AtomicU64,
    pub dropped: AtomicU64,
    pub delivered: AtomicU64,
    pub failed: AtomicU64,
}

impl StatCounters {
    pub fn bump(counter: &AtomicU64) -> u64 {
        counter.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn snapshot(&self) -> HandoffStats {
        HandoffStats {
            frames_scheduled: self.scheduled.load(Ordering::Relaxed),
            frames_replaced: self.replaced.load(Ordering::Relaxed),
            frames_dropped: self.dropped.load(Ordering::Relaxed),
            frames_delivered: self.delivered.load(Ordering::Relaxed),
            uploads_failed: self.failed.load(Ordering::Relaxed),
        }
    }
}
