//! Pending-call table: correlates outbound commands with their responses.
//!
//! Every slot settles exactly once. Settling removes the entry under the
//! same lock that registration takes, so a late or duplicate response for an
//! id that already timed out simply finds nothing.

use crate::error::{NoResponseCause, RemoteFailure, Result, RpcError};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use tokio::sync::oneshot;
use tracing::debug;

/// How a pending call was settled.
#[derive(Debug, Clone, PartialEq)]
pub enum CallOutcome {
    Completed(Value),
    Cancelled(NoResponseCause),
    Failed(RemoteFailure),
}

/// Receiving half of a registered slot, owned by the caller that registered it.
#[derive(Debug)]
pub struct PendingCall {
    id: u64,
    receiver: oneshot::Receiver<CallOutcome>,
}

impl PendingCall {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Wait for the slot to settle.
    ///
    /// A slot whose sender was dropped without settling (the table itself was
    /// dropped) reports `Disposed`.
    pub async fn outcome(&mut self) -> CallOutcome {
        match (&mut self.receiver).await {
            Ok(outcome) => outcome,
            Err(_) => CallOutcome::Cancelled(NoResponseCause::Disposed),
        }
    }
}

#[derive(Debug, Default)]
struct TableState {
    calls: HashMap<u64, oneshot::Sender<CallOutcome>>,
    closed: bool,
}

/// Concurrent map from packet id to a single-resolution completion slot.
#[derive(Debug, Default)]
pub struct PendingCallTable {
    state: Mutex<TableState>,
}

impl PendingCallTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, TableState> {
        // A panic while holding this lock cannot leave the map half-updated,
        // so a poisoned guard is still consistent.
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Insert a new slot for `id`.
    ///
    /// Fails with `DuplicatePendingId` if `id` is already outstanding and
    /// with `Disposed` once the table has been closed.
    pub fn register(&self, id: u64) -> Result<PendingCall> {
        let mut state = self.lock();
        if state.closed {
            return Err(RpcError::Disposed);
        }
        if state.calls.contains_key(&id) {
            return Err(RpcError::DuplicatePendingId(id));
        }
        let (tx, rx) = oneshot::channel();
        state.calls.insert(id, tx);
        Ok(PendingCall { id, receiver: rx })
    }

    /// Settle `id` with a success value.
    pub fn resolve(&self, id: u64, parameter: Value) -> bool {
        self.settle(id, CallOutcome::Completed(parameter))
    }

    /// Settle `id` with an arbitrary outcome.
    ///
    /// Returns `false` if `id` is unknown (never registered, already settled,
    /// or removed after a timeout).
    pub fn settle(&self, id: u64, outcome: CallOutcome) -> bool {
        let sender = self.lock().calls.remove(&id);
        match sender {
            Some(tx) => {
                // The waiter may have given up already; the entry is gone either way.
                let _ = tx.send(outcome);
                true
            }
            None => false,
        }
    }

    /// Unregister `id` without settling it.
    pub fn remove(&self, id: u64) -> bool {
        self.lock().calls.remove(&id).is_some()
    }

    /// Settle every slot as cancelled and empty the table.
    pub fn cancel_all(&self, cause: NoResponseCause) -> usize {
        let drained = self.drain();
        let count = drained.len();
        for tx in drained {
            let _ = tx.send(CallOutcome::Cancelled(cause.clone()));
        }
        if count > 0 {
            debug!("Cancelled {} pending call(s): {}", count, cause);
        }
        count
    }

    /// Settle every slot with the same failure and empty the table.
    pub fn fail_all(&self, failure: RemoteFailure) -> usize {
        let drained = self.drain();
        let count = drained.len();
        for tx in drained {
            let _ = tx.send(CallOutcome::Failed(failure.clone()));
        }
        if count > 0 {
            debug!("Failed {} pending call(s): {}", count, failure);
        }
        count
    }

    fn drain(&self) -> Vec<oneshot::Sender<CallOutcome>> {
        self.lock().calls.drain().map(|(_, tx)| tx).collect()
    }

    /// Stop accepting registrations. Existing slots are left untouched.
    pub fn close(&self) {
        self.lock().closed = true;
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn contains(&self, id: u64) -> bool {
        self.lock().calls.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.lock().calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
