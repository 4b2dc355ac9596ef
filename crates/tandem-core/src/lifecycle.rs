//! Disposal state machine.
//!
//! The whole state lives in one atomic byte: the low three bits hold the
//! phase, the next four bits record dispose requests of other kinds that
//! arrived while a teardown was already running, and the top bit is set
//! while the winning caller is still inside its synchronous section.
//!
//! ```text
//! Active ──┬── Sync ──────► Disposing ──────┐
//!          ├── Async ─────► DisposingAsync ─┤
//!          ├── Cancel ────► Cancelling ─────┼──► Disposed
//!          └── Finalize ──► Finalizing ─────┘
//! ```

use crate::error::{Result, RpcError};
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::debug;

const PHASE_MASK: u8 = 0b0000_0111;
const QUEUED_SHIFT: u8 = 3;
const ENTERED_BIT: u8 = 0b1000_0000;

/// Where a connection is in its lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Active,
    Disposing,
    DisposingAsync,
    Cancelling,
    Finalizing,
    Disposed,
}

impl Phase {
    fn to_bits(self) -> u8 {
        match self {
            Phase::Active => 0,
            Phase::Disposing => 1,
            Phase::DisposingAsync => 2,
            Phase::Cancelling => 3,
            Phase::Finalizing => 4,
            Phase::Disposed => 5,
        }
    }

    fn from_bits(bits: u8) -> Self {
        match bits & PHASE_MASK {
            0 => Phase::Active,
            1 => Phase::Disposing,
            2 => Phase::DisposingAsync,
            3 => Phase::Cancelling,
            4 => Phase::Finalizing,
            _ => Phase::Disposed,
        }
    }

    /// A teardown is running.
    pub fn is_tearing_down(&self) -> bool {
        matches!(
            self,
            Phase::Disposing | Phase::DisposingAsync | Phase::Cancelling | Phase::Finalizing
        )
    }
}

/// The four ways a teardown can be requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisposeKind {
    Sync,
    Async,
    Cancel,
    Finalize,
}

impl DisposeKind {
    const ALL: [DisposeKind; 4] = [
        DisposeKind::Sync,
        DisposeKind::Async,
        DisposeKind::Cancel,
        DisposeKind::Finalize,
    ];

    fn phase(self) -> Phase {
        match self {
            DisposeKind::Sync => Phase::Disposing,
            DisposeKind::Async => Phase::DisposingAsync,
            DisposeKind::Cancel => Phase::Cancelling,
            DisposeKind::Finalize => Phase::Finalizing,
        }
    }

    fn queued_bit(self) -> u8 {
        let index = match self {
            DisposeKind::Sync => 0,
            DisposeKind::Async => 1,
            DisposeKind::Cancel => 2,
            DisposeKind::Finalize => 3,
        };
        1 << (QUEUED_SHIFT + index)
    }

    fn operation(self) -> &'static str {
        match self {
            DisposeKind::Sync => "dispose",
            DisposeKind::Async => "dispose_async",
            DisposeKind::Cancel => "cancel",
            DisposeKind::Finalize => "finalize",
        }
    }
}

/// Result of asking to start a teardown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// This caller owns the teardown and must call [`Lifecycle::finish`].
    Won,
    /// A teardown is already running. Requests of another kind are recorded
    /// in the queued flags; a repeat of the running kind is not.
    Queued { running: Phase },
    /// Teardown already completed.
    AlreadyDisposed,
}

/// Point-in-time view of the lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LifecycleSnapshot {
    pub phase: Phase,
    pub queued: Vec<DisposeKind>,
}

/// Atomic disposal state.
#[derive(Debug, Default)]
pub struct Lifecycle {
    state: AtomicU8,
}

impl Lifecycle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn phase(&self) -> Phase {
        Phase::from_bits(self.state.load(Ordering::SeqCst))
    }

    pub fn is_active(&self) -> bool {
        self.phase() == Phase::Active
    }

    /// Fail with `Disposed` unless the connection is still active.
    pub fn ensure_active(&self) -> Result<()> {
        if self.is_active() {
            Ok(())
        } else {
            Err(RpcError::Disposed)
        }
    }

    /// Request a teardown of the given kind.
    ///
    /// Exactly one request ever wins. A request of the same kind as the
    /// running one fails with `DisposeInProgress` only while the winner has
    /// not yet called [`Lifecycle::release`]; after that it is reported as
    /// `Queued` without being recorded.
    pub fn begin(&self, kind: DisposeKind) -> Result<Transition> {
        let mut current = self.state.load(Ordering::SeqCst);
        loop {
            let phase = Phase::from_bits(current);
            let next = if phase == Phase::Active {
                (current & !PHASE_MASK) | kind.phase().to_bits() | ENTERED_BIT
            } else if !phase.is_tearing_down() {
                return Ok(Transition::AlreadyDisposed);
            } else if phase == kind.phase() {
                if current & ENTERED_BIT != 0 {
                    return Err(RpcError::DisposeInProgress {
                        operation: kind.operation(),
                    });
                }
                debug!("Lifecycle: repeated {:?} while teardown runs", kind);
                return Ok(Transition::Queued { running: phase });
            } else {
                current | kind.queued_bit()
            };

            match self
                .state
                .compare_exchange(current, next, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) if phase == Phase::Active => {
                    debug!("Lifecycle: {:?} won teardown", kind);
                    return Ok(Transition::Won);
                }
                Ok(_) => {
                    debug!("Lifecycle: {:?} queued behind {:?}", kind, phase);
                    return Ok(Transition::Queued { running: phase });
                }
                Err(actual) => current = actual,
            }
        }
    }

    /// The winner has left its synchronous section. Later requests of the
    /// same kind are no longer treated as re-entry.
    pub fn release(&self) {
        self.state.fetch_and(!ENTERED_BIT, Ordering::SeqCst);
    }

    /// Mark teardown complete. Queued flags are kept for inspection.
    pub fn finish(&self) {
        let mut current = self.state.load(Ordering::SeqCst);
        loop {
            let next = (current & !(PHASE_MASK | ENTERED_BIT)) | Phase::Disposed.to_bits();
            match self
                .state
                .compare_exchange(current, next, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }

    /// Dispose requests that arrived while another teardown was running.
    pub fn queued(&self) -> Vec<DisposeKind> {
        let bits = self.state.load(Ordering::SeqCst);
        DisposeKind::ALL
            .into_iter()
            .filter(|kind| bits & kind.queued_bit() != 0)
            .collect()
    }

    pub fn snapshot(&self) -> LifecycleSnapshot {
        LifecycleSnapshot {
            phase: self.phase(),
            queued: self.queued(),
        }
    }
}

/// Counts in-flight dispatch tasks so teardown can wait for them.
///
/// Entering increments first and then checks the closed flag, so once
/// [`TaskGate::close`] returns no new task can slip past a drain.
#[derive(Debug, Default)]
pub struct TaskGate {
    active: AtomicUsize,
    closed: AtomicBool,
    idle: Notify,
}

/// Held by a running task; leaving the gate on drop.
#[derive(Debug)]
pub struct TaskGuard {
    gate: Arc<TaskGate>,
}

impl TaskGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enter the gate. Returns `None` once the gate is closed.
    pub fn enter(gate: &Arc<TaskGate>) -> Option<TaskGuard> {
        gate.active.fetch_add(1, Ordering::SeqCst);
        if gate.closed.load(Ordering::SeqCst) {
            gate.leave();
            return None;
        }
        Some(TaskGuard { gate: gate.clone() })
    }

    fn leave(&self) {
        if self.active.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }

    /// Refuse new tasks.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Wait until no task is inside the gate.
    pub async fn drained(&self) {
        loop {
            let idle = self.idle.notified();
            if self.active() == 0 {
                return;
            }
            idle.await;
        }
    }
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.gate.leave();
    }
}
