//! Typed trace bus for instrumentation.
//!
//! Processes and the kernel record typed events here instead of logging
//! text. Kinds can be suppressed, in which case recording them costs
//! nothing; the buffer is bounded and drops its oldest records when full,
//! keeping long runs from accumulating unbounded history.

use crate::fixed::Ticks;
use crate::id::{ClaimId, KindId, LocationId, ProcessId, RouteId, UnitId};
use std::collections::VecDeque;

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// A trace record. All records carry the tick at which they occurred.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TraceEvent {
    // -- claims --
    ClaimParked {
        process: ProcessId,
        claim: ClaimId,
        location: LocationId,
        missing: u32,
        tick: Ticks,
    },
    ClaimGranted {
        process: ProcessId,
        claim: ClaimId,
        tick: Ticks,
    },
    ClaimCancelled {
        process: ProcessId,
        claim: ClaimId,
        tick: Ticks,
    },

    // -- production --
    CycleStarted {
        unit: UnitId,
        tick: Ticks,
    },
    CycleCompleted {
        unit: UnitId,
        kind: KindId,
        produced: u32,
        tick: Ticks,
    },

    // -- shipping --
    BatchShipped {
        route: RouteId,
        receiver: LocationId,
        quantity: u32,
        tick: Ticks,
    },
    ShippingDelayed {
        route: RouteId,
        extra: Ticks,
        tick: Ticks,
    },

    // -- storage --
    /// A deposit would have breached the location's cap. Recorded before
    /// the hard error propagates, so an aborted run still shows where.
    DepositRejected {
        location: LocationId,
        quantity: u32,
        tick: Ticks,
    },

    // -- lifecycle --
    ProcessFinished {
        process: ProcessId,
        tick: Ticks,
    },
}

/// Discriminant tag for trace records, used for suppression and filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TraceKind {
    ClaimParked,
    ClaimGranted,
    ClaimCancelled,
    CycleStarted,
    CycleCompleted,
    BatchShipped,
    ShippingDelayed,
    DepositRejected,
    ProcessFinished,
}

const TRACE_KIND_COUNT: usize = 9;

impl TraceEvent {
    pub fn kind(&self) -> TraceKind {
        match self {
            TraceEvent::ClaimParked { .. } => TraceKind::ClaimParked,
            TraceEvent::ClaimGranted { .. } => TraceKind::ClaimGranted,
            TraceEvent::ClaimCancelled { .. } => TraceKind::ClaimCancelled,
            TraceEvent::CycleStarted { .. } => TraceKind::CycleStarted,
            TraceEvent::CycleCompleted { .. } => TraceKind::CycleCompleted,
            TraceEvent::BatchShipped { .. } => TraceKind::BatchShipped,
            TraceEvent::ShippingDelayed { .. } => TraceKind::ShippingDelayed,
            TraceEvent::DepositRejected { .. } => TraceKind::DepositRejected,
            TraceEvent::ProcessFinished { .. } => TraceKind::ProcessFinished,
        }
    }

    /// The tick the record was stamped with.
    pub fn tick(&self) -> Ticks {
        match self {
            TraceEvent::ClaimParked { tick, .. }
            | TraceEvent::ClaimGranted { tick, .. }
            | TraceEvent::ClaimCancelled { tick, .. }
            | TraceEvent::CycleStarted { tick, .. }
            | TraceEvent::CycleCompleted { tick, .. }
            | TraceEvent::BatchShipped { tick, .. }
            | TraceEvent::ShippingDelayed { tick, .. }
            | TraceEvent::DepositRejected { tick, .. }
            | TraceEvent::ProcessFinished { tick, .. } => *tick,
        }
    }
}

impl TraceKind {
    fn index(self) -> usize {
        self as usize
    }
}

// ---------------------------------------------------------------------------
// TraceBus
// ---------------------------------------------------------------------------

/// Bounded, suppressible record buffer.
#[derive(Debug)]
pub struct TraceBus {
    records: VecDeque<TraceEvent>,
    suppressed: [bool; TRACE_KIND_COUNT],
    capacity: usize,
    total_recorded: u64,
}

impl TraceBus {
    /// Create a bus keeping at most `capacity` records. A capacity of 0 is
    /// clamped to 1.
    pub fn new(capacity: usize) -> Self {
        Self {
            records: VecDeque::new(),
            suppressed: [false; TRACE_KIND_COUNT],
            capacity: capacity.max(1),
            total_recorded: 0,
        }
    }

    /// Suppress a record kind. Suppressed records are never stored.
    pub fn suppress(&mut self, kind: TraceKind) {
        self.suppressed[kind.index()] = true;
        self.records.retain(|r| r.kind() != kind);
    }

    pub fn is_suppressed(&self, kind: TraceKind) -> bool {
        self.suppressed[kind.index()]
    }

    /// Record an event. No-ops if its kind is suppressed; drops the oldest
    /// record when full.
    pub fn record(&mut self, event: TraceEvent) {
        if self.suppressed[event.kind().index()] {
            return;
        }
        if self.records.len() == self.capacity {
            self.records.pop_front();
        }
        self.records.push_back(event);
        self.total_recorded += 1;
    }

    /// Records currently retained, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &TraceEvent> {
        self.records.iter()
    }

    /// Retained records of one kind, oldest first.
    pub fn of_kind(&self, kind: TraceKind) -> impl Iterator<Item = &TraceEvent> {
        self.records.iter().filter(move |r| r.kind() == kind)
    }

    /// Retained record count of one kind.
    pub fn count(&self, kind: TraceKind) -> usize {
        self.of_kind(kind).count()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Records ever offered and not suppressed (including dropped ones).
    pub fn total_recorded(&self) -> u64 {
        self.total_recorded
    }

    /// Records dropped because the buffer was full.
    pub fn dropped(&self) -> u64 {
        self.total_recorded - self.records.len() as u64
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }
}

impl Default for TraceBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

// ===========================================================================
// Tests
// ===========================================================================
