//! Transaction state and the single-writer gate.
//!
//! A table handle admits one mutating thread at a time. Ordinary mutations
//! hold the gate for their own duration; [`WriterGate::begin`] hands it to the
//! calling thread until the transaction commits or aborts. Mutations issued
//! by that thread pass straight through, while every other thread waits. A
//! second `begin` fails no matter which thread issues it.
//!
//! ```text
//! Idle ──begin──> Active ──commit──> Committing ──> Idle
//!                   │
//!                   └────abort────> Aborting ────> Idle
//! ```

use std::thread::{self, ThreadId};

use parking_lot::{Condvar, Mutex};

use crate::error::{Error, Result};

/// Transaction lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TxnState {
    /// No transaction.
    #[default]
    Idle,
    /// A transaction is open.
    Active,
    /// The open transaction is being made durable.
    Committing,
    /// The open transaction is being undone.
    Aborting,
}

#[derive(Debug, Default)]
struct GateState {
    owner: Option<ThreadId>,
    /// Set while the owner holds the gate for a whole transaction.
    txn: TxnState,
}

/// Serializes mutations on one table handle.
#[derive(Debug, Default)]
pub struct WriterGate {
    state: Mutex<GateState>,
    released: Condvar,
}

/// Holds the gate for one mutation. Releases it on drop unless the thread
/// owns a transaction.
#[must_use]
pub struct GateGuard<'a> {
    gate: &'a WriterGate,
    owned: bool,
}

impl Drop for GateGuard<'_> {
    fn drop(&mut self) {
        if self.owned {
            self.gate.release();
        }
    }
}

impl WriterGate {
    /// Creates an open gate.
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits for the gate, unless the current thread already owns it through
    /// a transaction.
    pub fn acquire(&self) -> GateGuard<'_> {
        let me = thread::current().id();
        let mut state = self.state.lock();
        if state.owner == Some(me) {
            return GateGuard { gate: self, owned: false };
        }
        while state.owner.is_some() {
            self.released.wait(&mut state);
        }
        state.owner = Some(me);
        GateGuard { gate: self, owned: true }
    }

    /// Opens a transaction owned by the current thread.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Threading`] if any thread has a transaction open on
    /// this handle.
    pub fn begin(&self) -> Result<()> {
        let me = thread::current().id();
        let mut state = self.state.lock();
        // A single mutation in flight on another thread is waited out.
        loop {
            if state.txn != TxnState::Idle || state.owner == Some(me) {
                return Err(Error::threading("a transaction is already active on this handle"));
            }
            if state.owner.is_none() {
                break;
            }
            self.released.wait(&mut state);
        }
        state.owner = Some(me);
        state.txn = TxnState::Active;
        Ok(())
    }

    /// Moves the current thread's transaction from `Active` to `next`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Threading`] if the thread has no active transaction.
    pub fn transition(&self, next: TxnState) -> Result<()> {
        let mut state = self.state.lock();
        if state.owner != Some(thread::current().id()) || state.txn != TxnState::Active {
            return Err(Error::threading("no transaction is active on this thread"));
        }
        state.txn = next;
        Ok(())
    }

    /// Ends the current thread's transaction and opens the gate.
    pub fn finish(&self) {
        let mut state = self.state.lock();
        if state.owner == Some(thread::current().id()) {
            state.txn = TxnState::Idle;
            state.owner = None;
            self.released.notify_all();
        }
    }

    /// True if the current thread owns an open transaction.
    pub fn in_transaction(&self) -> bool {
        let state = self.state.lock();
        state.owner == Some(thread::current().id()) && state.txn != TxnState::Idle
    }

    /// State of the transaction owned by any thread.
    pub fn state(&self) -> TxnState {
        self.state.lock().txn
    }

    /// Fails with [`Error::Threading`] while the current thread has a
    /// transaction open.
    ///
    /// # Errors
    ///
    /// See above.
    pub fn ensure_idle(&self, operation: &str) -> Result<()> {
        if self.in_transaction() {
            let message = format!("{operation} is not allowed inside a transaction");
            return Err(Error::threading(message));
        }
        Ok(())
    }

    fn release(&self) {
        let mut state = self.state.lock();
        if state.txn == TxnState::Idle {
            state.owner = None;
            self.released.notify_all();
        }
    }
}
