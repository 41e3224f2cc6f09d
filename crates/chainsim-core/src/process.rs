//! The cooperative-process contract.
//!
//! A process is a resumable state machine. The kernel wakes it with a
//! [`Wakeup`]; the process runs to its next suspension point, mutating the
//! world through [`StepCtx`](crate::kernel::StepCtx) as it goes, and
//! returns a [`Suspend`] telling the kernel how to wake it next. No virtual
//! time passes inside a step; all state changes between two clock readings
//! are totally ordered by step execution.

use crate::claim::{ClaimError, Requirement};
use crate::fixed::Ticks;
use crate::id::ClaimId;
use crate::kernel::StepCtx;
use crate::location::StoreError;

// ---------------------------------------------------------------------------
// Wakeups & suspensions
// ---------------------------------------------------------------------------

/// Grants access to the resources a claim selected. Handles are spent by
/// `consume`, `transfer`, or `release`; holding one across those calls is a
/// state error, not undefined behaviour.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClaimHandle(pub(crate) ClaimId);

impl ClaimHandle {
    pub fn id(&self) -> ClaimId {
        self.0
    }
}

/// Why the kernel is resuming a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wakeup {
    /// First activation after spawn.
    Start,
    /// A `Hold` elapsed.
    Timer,
    /// A `Claim` was granted. Reservations are already taken.
    Granted(ClaimHandle),
    /// A `Claim`'s deadline elapsed first. The claim is already cancelled.
    Deadline,
}

/// How a process yields control back to the kernel.
#[derive(Debug)]
pub enum Suspend {
    /// Wake again after `0` or more ticks.
    Hold(Ticks),
    /// Acquire resources; wake with `Granted` once the whole requirement is
    /// satisfiable, or with `Deadline` if one is set and elapses first.
    Claim {
        req: Requirement,
        deadline: Option<Ticks>,
    },
    /// The process will never run again.
    Done,
}

impl Suspend {
    /// A claim with no deadline.
    pub fn claim(req: Requirement) -> Self {
        Suspend::Claim {
            req,
            deadline: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// A failure inside a process step. These abort the simulation; recoverable
/// conditions (unsatisfied claims, deadlines) are wakeups, not errors.
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("wakeup {wake:?} not valid in state {state}")]
    UnexpectedWakeup { state: &'static str, wake: Wakeup },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Claim(#[from] ClaimError),
}

// ---------------------------------------------------------------------------
// Process trait
// ---------------------------------------------------------------------------

/// A cooperative task driven by the kernel.
pub trait Process {
    /// Short name used in diagnostics.
    fn name(&self) -> &str;

    /// Run until the next suspension point.
    fn step(&mut self, ctx: &mut StepCtx<'_>, wake: Wakeup) -> Result<Suspend, ProcessError>;
}
