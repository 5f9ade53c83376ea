use tracing::warn;

use crate::arena::Arena;

/// Slot status codes as stored in the arena; values are part of the
/// cross-process contract.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerStatus {
    Dead = 0,
    Booting = 1,
    Idle = 2,
    Busy = 3,
    Error = 4,
}

impl From<u32> for WorkerStatus {
    fn from(value: u32) -> Self {
        match value {
            1 => WorkerStatus::Booting,
            2 => WorkerStatus::Idle,
            3 => WorkerStatus::Busy,
            4 => WorkerStatus::Error,
            _ => WorkerStatus::Dead,
        }
    }
}

impl WorkerStatus {
    /// Legal transitions: BOOTING → IDLE ⇄ BUSY, BUSY → ERROR → IDLE.
    /// DEAD is entered from anywhere, but only the supervisor writes it.
    pub fn can_transition(self, to: WorkerStatus) -> bool {
        use WorkerStatus::*;
        matches!(
            (self, to),
            (Booting, Idle)
                | (Idle, Busy)
                | (Busy, Idle)
                | (Busy, Error)
                | (Error, Idle)
                | (_, Dead)
        )
    }
}

/// Marks a slot BUSY for the lifetime of one job.
///
/// Dropping the guard restores IDLE and clears the slot's job fields on
/// every exit path out of job handling, unwinding included. A failed job
/// passes through ERROR first via [`JobGuard::mark_error`].
pub struct JobGuard<'a> {
    arena: &'a Arena,
    slot_index: usize,
}

impl<'a> JobGuard<'a> {
    pub fn begin(arena: &'a Arena, slot_index: usize, job_digest: u64) -> Self {
        if let Ok(slot) = arena.slot(slot_index) {
            let current = slot.status();
            if !current.can_transition(WorkerStatus::Busy) {
                warn!(?current, slot = slot_index, "starting job from unexpected slot state");
            }
        }
        let _ = arena.set_current_job(slot_index, job_digest);
        let _ = arena.set_progress(slot_index, 0.0);
        let _ = arena.set_status(slot_index, WorkerStatus::Busy);
        Self { arena, slot_index }
    }

    /// Record a successful run; the slot stays BUSY until drop.
    pub fn complete(&self) {
        let _ = self.arena.set_progress(self.slot_index, 1.0);
    }

    /// Record a failed run. The drop still restores IDLE afterwards:
    /// ERROR is a transient, observable state, never a resting one.
    pub fn mark_error(&self) {
        let _ = self.arena.set_status(self.slot_index, WorkerStatus::Error);
    }
}

impl Drop for JobGuard<'_> {
    fn drop(&mut self) {
        if self.arena.set_status(self.slot_index, WorkerStatus::Idle).is_err() {
            warn!(slot = self.slot_index, "failed to restore slot to IDLE");
        }
        let _ = self.arena.set_current_job(self.slot_index, 0);
        let _ = self.arena.set_progress(self.slot_index, 0.0);
    }
}
