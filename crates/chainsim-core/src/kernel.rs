//! The scheduler: owns the world, drives the event queue, and dispatches
//! process steps.
//!
//! Strictly single-threaded and cooperative. Between two suspensions of the
//! same process nothing else runs, so locations and the clock are stable
//! from the process's point of view and no state needs locking.
//!
//! # Ordering
//!
//! Events pop in `(due, seq)` order. A deposit made inside a step notifies
//! the claim engine before the step's suspension is recorded, and any claim
//! granted by that deposit is scheduled at the current instant with a fresh
//! sequence number, strictly after the running step and never interleaved.
//!
//! # The run-until horizon
//!
//! Wake-ups due strictly before the deadline always dispatch. When the
//! clock first reaches the deadline, the queue's next sequence number is
//! captured as a horizon: wake-ups due exactly at the deadline dispatch
//! only if they were scheduled before the horizon. Work spawned *at* the
//! deadline instant (an immediately re-granted claim, a zero-tick hold)
//! belongs to the next run and stays queued.

use crate::claim::{ClaimEngine, Submitted};
use crate::clock::{Clock, ClockError};
use crate::databag::DataBag;
use crate::fixed::{Fixed64, Ticks};
use crate::id::{KindId, LocationId, ProcessId, ResourceId};
use crate::location::{Store, StoreError};
use crate::process::{ClaimHandle, Process, ProcessError, Suspend, Wakeup};
use crate::queue::{EventQueue, ScheduledEvent, WakeKind};
use crate::rng::SimRng;
use crate::trace::{TraceBus, TraceEvent};
use slotmap::SlotMap;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Fatal failures of the event loop. Recoverable conditions never surface
/// here; they drive process state machines instead.
#[derive(Debug, thiserror::Error)]
pub enum KernelError {
    #[error("process '{process}' failed at tick {at}: {source}")]
    Process {
        process: String,
        at: Ticks,
        #[source]
        source: ProcessError,
    },
    #[error(transparent)]
    Clock(#[from] ClockError),
    #[error("invariant violated at tick {at}: {detail}")]
    Invariant { at: Ticks, detail: String },
}

// ---------------------------------------------------------------------------
// World
// ---------------------------------------------------------------------------

/// Everything a process step may touch: clock, queue, store, claims,
/// metrics, randomness, trace.
#[derive(Debug)]
pub(crate) struct World {
    pub(crate) clock: Clock,
    pub(crate) queue: EventQueue,
    pub(crate) store: Store,
    pub(crate) claims: ClaimEngine,
    pub(crate) bag: DataBag,
    pub(crate) rng: SimRng,
    pub(crate) trace: TraceBus,
}

impl World {
    /// Deposit resources and immediately retry parked claims watching the
    /// location. Grants are scheduled at the current instant. A deposit the
    /// cap rejects is traced before the error propagates.
    fn deposit(&mut self, loc: LocationId, ids: &[ResourceId]) -> Result<(), StoreError> {
        if let Err(err) = self.store.deposit(loc, ids) {
            if matches!(err, StoreError::CapacityExceeded { .. }) {
                self.trace.record(TraceEvent::DepositRejected {
                    location: loc,
                    quantity: ids.len() as u32,
                    tick: self.clock.now(),
                });
            }
            return Err(err);
        }
        self.notify_deposit(loc);
        Ok(())
    }

    fn notify_deposit(&mut self, loc: LocationId) {
        let now = self.clock.now();
        for (claim, process) in self.claims.on_deposit(&self.store, loc) {
            self.queue.push(now, process, WakeKind::Granted(claim));
            self.trace.record(TraceEvent::ClaimGranted {
                process,
                claim,
                tick: now,
            });
        }
    }
}

// ---------------------------------------------------------------------------
// StepCtx
// ---------------------------------------------------------------------------

/// The operations available to a process during one step. None of them
/// advance time; suspensions do that.
pub struct StepCtx<'a> {
    world: &'a mut World,
}

impl StepCtx<'_> {
    pub fn now(&self) -> Ticks {
        self.world.clock.now()
    }

    /// Resident resources at a location (reserved included).
    pub fn location_len(&self, loc: LocationId) -> Result<usize, StoreError> {
        Ok(self.world.store.location(loc)?.len())
    }

    /// Resident resources of one kind at a location.
    pub fn count_kind(&self, loc: LocationId, kind: KindId) -> Result<u32, StoreError> {
        Ok(self.world.store.location(loc)?.count_kind(kind))
    }

    /// Create a fresh resource instance. It belongs nowhere until deposited.
    pub fn create(&mut self, kind: KindId) -> ResourceId {
        self.world.store.create(kind)
    }

    /// Deposit resources, waking any claims the deposit satisfies.
    pub fn deposit(&mut self, loc: LocationId, ids: &[ResourceId]) -> Result<(), StoreError> {
        self.world.deposit(loc, ids)
    }

    /// Withdraw a granted claim's resources from their sources and hand them
    /// to the caller. The handle is spent.
    pub fn consume(&mut self, handle: ClaimHandle) -> Result<Vec<ResourceId>, ProcessError> {
        Ok(self.world.claims.consume(&mut self.world.store, handle.0)?)
    }

    /// Retire withdrawn instances for good (consumed inputs).
    pub fn discard(&mut self, ids: &[ResourceId]) -> Result<(), ProcessError> {
        Ok(self.world.store.retire(ids)?)
    }

    /// Move a granted claim's resources into `to` and spend the handle.
    /// Every source location must be linked to `to`. Returns how many
    /// resources moved.
    pub fn transfer(&mut self, handle: ClaimHandle, to: LocationId) -> Result<u32, ProcessError> {
        let sources = self.world.claims.sources(handle.0)?;
        for (from, _) in &sources {
            if !self.world.store.is_linked(*from, to) {
                return Err(ProcessError::Store(StoreError::NotLinked {
                    from: self.world.store.location(*from)?.name().to_string(),
                    to: self.world.store.location(to)?.name().to_string(),
                }));
            }
        }
        let ids = self.world.claims.consume(&mut self.world.store, handle.0)?;
        let moved = ids.len() as u32;
        self.world.deposit(to, &ids)?;
        Ok(moved)
    }

    /// Release a granted claim's reservations in place. The handle is spent
    /// and the locations are left exactly as they were.
    pub fn release(&mut self, handle: ClaimHandle) -> Result<(), ProcessError> {
        Ok(self.world.claims.release(handle.0)?)
    }

    /// Add to a metric counter.
    pub fn bag_add(&mut self, key: &str, delta: u64) {
        self.world.bag.add(key, delta);
    }

    /// Draw a uniform value in [0, 1) from the run's RNG.
    pub fn draw_unit(&mut self) -> Fixed64 {
        self.world.rng.next_unit()
    }

    /// Record a trace event.
    pub fn trace(&mut self, event: TraceEvent) {
        self.world.trace.record(event);
    }
}

// ---------------------------------------------------------------------------
// Processes
// ---------------------------------------------------------------------------

/// Scheduling state of a registered process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Ready,
    Running,
    Waiting(WaitReason),
    Done,
    Failed,
}

/// What a waiting process is suspended on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitReason {
    Timer,
    Claim,
}

struct ProcessEntry {
    name: String,
    /// Taken out of the slot while the process runs.
    body: Option<Box<dyn Process>>,
    state: ProcessState,
}

impl std::fmt::Debug for ProcessEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessEntry")
            .field("name", &self.name)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Audit
// ---------------------------------------------------------------------------

/// Conservation totals at a quiescent point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuditReport {
    /// Instances ever created.
    pub created: u64,
    /// Instances retired by consumption.
    pub retired: u64,
    /// Instances alive (all resident in exactly one location).
    pub live: u64,
    /// Instances currently reserved by satisfied claims.
    pub reserved: usize,
}

// ---------------------------------------------------------------------------
// Kernel
// ---------------------------------------------------------------------------

/// The event loop and process table.
#[derive(Debug)]
pub struct Kernel {
    world: World,
    processes: SlotMap<ProcessId, ProcessEntry>,
}

impl Kernel {
    pub fn new(store: Store, rng: SimRng, trace_capacity: usize) -> Self {
        Self {
            world: World {
                clock: Clock::new(),
                queue: EventQueue::new(),
                store,
                claims: ClaimEngine::new(),
                bag: DataBag::new(),
                rng,
                trace: TraceBus::new(trace_capacity),
            },
            processes: SlotMap::with_key(),
        }
    }

    // -- registration -------------------------------------------------------

    /// Register a process and schedule its first activation at the current
    /// instant. Registration order decides same-instant start order.
    pub fn spawn(&mut self, name: &str, body: Box<dyn Process>) -> ProcessId {
        let pid = self.processes.insert(ProcessEntry {
            name: name.to_string(),
            body: Some(body),
            state: ProcessState::Ready,
        });
        let now = self.world.clock.now();
        self.world.queue.push(now, pid, WakeKind::Start);
        pid
    }

    // -- world access -------------------------------------------------------

    pub fn now(&self) -> Ticks {
        self.world.clock.now()
    }

    pub fn store(&self) -> &Store {
        &self.world.store
    }

    pub fn bag(&self) -> &DataBag {
        &self.world.bag
    }

    pub fn trace(&self) -> &TraceBus {
        &self.world.trace
    }

    /// Configure the trace bus (suppression) before or between runs.
    pub fn trace_mut(&mut self) -> &mut TraceBus {
        &mut self.world.trace
    }

    pub fn rng_state(&self) -> u64 {
        self.world.rng.state()
    }

    pub fn process_state(&self, pid: ProcessId) -> Option<ProcessState> {
        self.processes.get(pid).map(|e| e.state)
    }

    /// Create a resource outside any process step (seeding).
    pub fn create(&mut self, kind: KindId) -> ResourceId {
        self.world.store.create(kind)
    }

    /// Deposit outside any process step (seeding). Parked claims are
    /// notified like any other deposit.
    pub fn deposit(&mut self, loc: LocationId, ids: &[ResourceId]) -> Result<(), StoreError> {
        self.world.deposit(loc, ids)
    }

    // -- event loop ---------------------------------------------------------

    /// Run until the clock reaches `deadline` or the queue empties. On
    /// return the clock reads exactly `deadline` unless an error aborted the
    /// run earlier.
    pub fn run_until(&mut self, deadline: Ticks) -> Result<(), KernelError> {
        let mut horizon: Option<u64> = None;
        loop {
            let Some((due, seq)) = self.world.queue.peek() else {
                break;
            };
            if due > deadline {
                break;
            }
            if due == deadline {
                let cutoff = *horizon.get_or_insert(self.world.queue.next_seq());
                if seq >= cutoff {
                    break;
                }
            }
            let Some(event) = self.world.queue.pop() else {
                break;
            };
            self.world.clock.advance_to(event.due)?;
            self.dispatch(event)?;
        }
        if self.world.clock.now() < deadline {
            self.world.clock.advance_to(deadline)?;
        }
        Ok(())
    }

    fn dispatch(&mut self, event: ScheduledEvent) -> Result<(), KernelError> {
        let pid = event.process;
        match self.processes.get(pid) {
            None => return Ok(()),
            Some(e) if matches!(e.state, ProcessState::Done | ProcessState::Failed) => {
                return Ok(())
            }
            Some(_) => {}
        }

        let now = self.world.clock.now();
        let wake = match event.wake {
            WakeKind::Start => Wakeup::Start,
            WakeKind::Timer => Wakeup::Timer,
            WakeKind::Granted(claim) => {
                // A grant outruns any deadline set for the same claim.
                if let Some(seq) = self.world.claims.take_deadline_event(claim) {
                    self.world.queue.cancel(seq);
                }
                Wakeup::Granted(ClaimHandle(claim))
            }
            WakeKind::DeadlineExpired(claim) => {
                if !self.world.claims.is_pending(claim) {
                    return Ok(());
                }
                if self.world.claims.cancel(claim).is_ok() {
                    self.world.trace.record(TraceEvent::ClaimCancelled {
                        process: pid,
                        claim,
                        tick: now,
                    });
                }
                Wakeup::Deadline
            }
        };

        let Some(mut body) = self.processes.get_mut(pid).and_then(|e| e.body.take()) else {
            return Ok(());
        };
        self.set_state(pid, ProcessState::Running);
        let outcome = body.step(
            &mut StepCtx {
                world: &mut self.world,
            },
            wake,
        );
        if let Some(entry) = self.processes.get_mut(pid) {
            entry.body = Some(body);
        }

        let now = self.world.clock.now();
        match outcome {
            Ok(Suspend::Hold(d)) => {
                self.set_state(pid, ProcessState::Waiting(WaitReason::Timer));
                self.world.queue.push(now + d, pid, WakeKind::Timer);
            }
            Ok(Suspend::Claim { req, deadline }) => {
                self.set_state(pid, ProcessState::Waiting(WaitReason::Claim));
                match self.world.claims.submit(&self.world.store, pid, req) {
                    Submitted::Granted(claim) => {
                        self.world.queue.push(now, pid, WakeKind::Granted(claim));
                        self.world.trace.record(TraceEvent::ClaimGranted {
                            process: pid,
                            claim,
                            tick: now,
                        });
                    }
                    Submitted::Parked { claim, failure } => {
                        self.world.trace.record(TraceEvent::ClaimParked {
                            process: pid,
                            claim,
                            location: failure.location,
                            missing: failure.missing,
                            tick: now,
                        });
                        if let Some(d) = deadline {
                            let seq =
                                self.world
                                    .queue
                                    .push(now + d, pid, WakeKind::DeadlineExpired(claim));
                            let _ = self.world.claims.set_deadline_event(claim, seq);
                        }
                    }
                }
            }
            Ok(Suspend::Done) => {
                self.set_state(pid, ProcessState::Done);
                self.world.trace.record(TraceEvent::ProcessFinished {
                    process: pid,
                    tick: now,
                });
            }
            Err(source) => {
                self.set_state(pid, ProcessState::Failed);
                let process = self
                    .processes
                    .get(pid)
                    .map(|e| e.name.clone())
                    .unwrap_or_default();
                return Err(KernelError::Process {
                    process,
                    at: now,
                    source,
                });
            }
        }
        Ok(())
    }

    fn set_state(&mut self, pid: ProcessId, state: ProcessState) {
        if let Some(entry) = self.processes.get_mut(pid) {
            entry.state = state;
        }
    }

    // -- audit --------------------------------------------------------------

    /// Check the conservation, storage-bound, and reservation invariants at
    /// a quiescent point.
    pub fn audit(&self) -> Result<AuditReport, KernelError> {
        let at = self.world.clock.now();
        let invariant = |detail: String| KernelError::Invariant { at, detail };

        let store = &self.world.store;
        store.check_indexes().map_err(|detail| invariant(detail))?;

        if store.live() != store.created() - store.retired() {
            return Err(invariant(format!(
                "conservation broken: {} live, {} created, {} retired",
                store.live(),
                store.created(),
                store.retired()
            )));
        }
        if store.resident() != store.live() {
            return Err(invariant(format!(
                "{} live instances but {} resident in locations",
                store.live(),
                store.resident()
            )));
        }

        for (name, loc) in store.locations_by_name() {
            let location = store.location(loc).map_err(|e| invariant(e.to_string()))?;
            if let Some(cap) = location.cap() {
                if location.len() > cap as usize {
                    return Err(invariant(format!(
                        "{name} holds {} over cap {cap}",
                        location.len()
                    )));
                }
            }
        }

        let reservations = self.world.claims.satisfied_reservations();
        for (claim, loc, rid) in &reservations {
            if self.world.claims.reserved_by(*rid) != Some(*claim) {
                return Err(invariant(format!(
                    "resource {rid:?} selection and reservation disagree"
                )));
            }
            let location = store.location(*loc).map_err(|e| invariant(e.to_string()))?;
            if !location.contents().contains(rid) {
                return Err(invariant(format!(
                    "reserved resource {rid:?} not resident at {}",
                    location.name()
                )));
            }
        }
        if reservations.len() != self.world.claims.reserved_total() {
            return Err(invariant(format!(
                "{} reservations recorded, {} selected",
                self.world.claims.reserved_total(),
                reservations.len()
            )));
        }

        Ok(AuditReport {
            created: store.created(),
            retired: store.retired(),
            live: store.live(),
            reserved: self.world.claims.reserved_total(),
        })
    }
}

// ===========================================================================
// Tests
// ===========================================================================
