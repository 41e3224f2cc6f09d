//! Atomic multi-location claims: logical reservation, FIFO parking, retry
//! on deposit.
//!
//! A claim is a conjunction of atoms `(location, predicate, count)` and is
//! all-or-nothing: either every atom can be satisfied against the live,
//! unreserved contents of its location, or the claim parks and is retried
//! whenever one of its locations receives a deposit. Reservation is logical:
//! selected resources stay resident in their location but become invisible
//! to other claims until the owner consumes, moves, or releases them.
//!
//! Fairness: parked claims are retried in park order (one global park
//! sequence), so an earlier claim is never starved by a later one. A
//! resource is never promised to two claims at once.

use crate::id::{ClaimId, LocationId, ProcessId, ResourceId};
use crate::location::{Store, StoreError};
use crate::resource::Predicate;
use slotmap::{SecondaryMap, SlotMap};
use std::collections::{BTreeSet, HashSet, VecDeque};

// ---------------------------------------------------------------------------
// Requirements
// ---------------------------------------------------------------------------

/// One conjunct of a claim: `count` resources at `location` matching
/// `predicate`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Atom {
    pub location: LocationId,
    pub predicate: Predicate,
    pub count: u32,
}

/// A conjunction of atoms, built up one atom at a time.
#[derive(Debug, Clone, Default)]
pub struct Requirement {
    atoms: Vec<Atom>,
}

impl Requirement {
    pub fn new() -> Self {
        Self::default()
    }

    /// A single-atom requirement.
    pub fn of(location: LocationId, predicate: Predicate, count: u32) -> Self {
        Self::new().and(location, predicate, count)
    }

    /// Append an atom.
    pub fn and(mut self, location: LocationId, predicate: Predicate, count: u32) -> Self {
        self.atoms.push(Atom {
            location,
            predicate,
            count,
        });
        self
    }

    pub fn atoms(&self) -> &[Atom] {
        &self.atoms
    }

    fn into_atoms(self) -> Vec<Atom> {
        self.atoms
    }
}

// ---------------------------------------------------------------------------
// Claims
// ---------------------------------------------------------------------------

/// Lifecycle of a claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimState {
    /// Parked; holds no reservations.
    Pending,
    /// Granted; holds reservations on its selected resources.
    Satisfied,
    /// Reserved resources were withdrawn by the owner.
    Consumed,
    /// Abandoned; any reservations were released in place.
    Cancelled,
}

#[derive(Debug)]
struct Claim {
    process: ProcessId,
    atoms: Vec<Atom>,
    state: ClaimState,
    /// Selected resources per atom, populated while `Satisfied`.
    selected: Vec<Vec<ResourceId>>,
    /// Sequence number of the park, for FIFO retry across locations.
    park_seq: u64,
    /// Queue sequence of the pending deadline wake-up, if any.
    deadline_event: Option<u64>,
}

/// Which atom first failed, and by how much.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AtomFailure {
    pub atom: usize,
    pub location: LocationId,
    pub missing: u32,
}

/// Result of submitting a requirement.
#[derive(Debug)]
pub enum Submitted {
    /// Satisfiable right now; reservations are taken.
    Granted(ClaimId),
    /// Parked until a deposit to one of its locations makes it satisfiable.
    Parked { claim: ClaimId, failure: AtomFailure },
}

/// Errors raised by claim operations on a handle in the wrong state.
#[derive(Debug, thiserror::Error)]
pub enum ClaimError {
    #[error("unknown claim {0:?}")]
    UnknownClaim(ClaimId),
    #[error("claim {claim:?} is {actual:?}, expected {expected}")]
    WrongState {
        claim: ClaimId,
        expected: &'static str,
        actual: ClaimState,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
}

// ---------------------------------------------------------------------------
// ClaimEngine
// ---------------------------------------------------------------------------

/// The claim table, reservation map, and per-location park lists.
#[derive(Debug, Default)]
pub struct ClaimEngine {
    claims: SlotMap<ClaimId, Claim>,
    /// Which claim a resource is reserved by, if any.
    reserved: SecondaryMap<ResourceId, ClaimId>,
    /// Parked claims watching each location, in park order. Entries whose
    /// claim has left `Pending` are dropped lazily on the next scan.
    parked: SecondaryMap<LocationId, VecDeque<ClaimId>>,
    next_park_seq: u64,
}

impl ClaimEngine {
    pub fn new() -> Self {
        Self::default()
    }

    // -- submission ---------------------------------------------------------

    /// Evaluate a requirement. Grants and reserves if satisfiable, parks
    /// otherwise.
    pub fn submit(&mut self, store: &Store, process: ProcessId, req: Requirement) -> Submitted {
        let atoms = req.into_atoms();
        match self.select(store, &atoms) {
            Ok(selected) => {
                let claim = self.claims.insert(Claim {
                    process,
                    atoms,
                    state: ClaimState::Satisfied,
                    selected,
                    park_seq: 0,
                    deadline_event: None,
                });
                self.take_reservations(claim);
                Submitted::Granted(claim)
            }
            Err(failure) => {
                let park_seq = self.next_park_seq;
                self.next_park_seq += 1;
                let watched: BTreeSet<LocationId> = atoms.iter().map(|a| a.location).collect();
                let claim = self.claims.insert(Claim {
                    process,
                    atoms,
                    state: ClaimState::Pending,
                    selected: Vec::new(),
                    park_seq,
                    deadline_event: None,
                });
                for loc in watched {
                    if self.parked.get(loc).is_none() {
                        self.parked.insert(loc, VecDeque::new());
                    }
                    if let Some(queue) = self.parked.get_mut(loc) {
                        queue.push_back(claim);
                    }
                }
                Submitted::Parked { claim, failure }
            }
        }
    }

    /// Retry parked claims watching `loc` after a deposit there. Every claim
    /// that has become satisfiable is granted (reservations taken) in park
    /// order; later claims re-evaluate against what the earlier ones left.
    /// Returns the granted claims with their owning processes.
    pub fn on_deposit(&mut self, store: &Store, loc: LocationId) -> Vec<(ClaimId, ProcessId)> {
        let Some(queue) = self.parked.get_mut(loc) else {
            return Vec::new();
        };
        let snapshot: Vec<ClaimId> = queue.drain(..).collect();

        let mut granted = Vec::new();
        let mut still_parked = VecDeque::new();
        for id in snapshot {
            let Some(claim) = self.claims.get(id) else {
                continue;
            };
            if claim.state != ClaimState::Pending {
                // Granted via another watched location, or cancelled.
                continue;
            }
            let atoms = claim.atoms.clone();
            match self.select(store, &atoms) {
                Ok(selected) => {
                    let process = claim.process;
                    if let Some(claim) = self.claims.get_mut(id) {
                        claim.state = ClaimState::Satisfied;
                        claim.selected = selected;
                    }
                    self.take_reservations(id);
                    granted.push((id, process));
                }
                Err(_) => still_parked.push_back(id),
            }
        }

        if let Some(queue) = self.parked.get_mut(loc) {
            *queue = still_parked;
        }
        granted
    }

    // -- handle operations --------------------------------------------------

    /// Withdraw the reserved resources from their source locations and hand
    /// them to the caller. The claim is spent.
    pub fn consume(&mut self, store: &mut Store, id: ClaimId) -> Result<Vec<ResourceId>, ClaimError> {
        let sources = self.sources(id)?;
        let mut all = Vec::new();
        for (loc, ids) in &sources {
            store.withdraw(*loc, ids)?;
            for &rid in ids {
                self.reserved.remove(rid);
            }
            all.extend_from_slice(ids);
        }
        self.spend(id, ClaimState::Consumed);
        Ok(all)
    }

    /// Release the reservations in place: the resources never left their
    /// locations. The claim is spent.
    pub fn release(&mut self, id: ClaimId) -> Result<(), ClaimError> {
        let sources = self.sources(id)?;
        for (_, ids) in &sources {
            for &rid in ids {
                self.reserved.remove(rid);
            }
        }
        self.spend(id, ClaimState::Cancelled);
        Ok(())
    }

    /// Cancel a claim in any live state. Pending claims simply leave the
    /// park lists (lazily); satisfied claims release their reservations.
    pub fn cancel(&mut self, id: ClaimId) -> Result<(), ClaimError> {
        match self.state(id)? {
            ClaimState::Pending => {
                self.spend(id, ClaimState::Cancelled);
                Ok(())
            }
            ClaimState::Satisfied => self.release(id),
            actual => Err(ClaimError::WrongState {
                claim: id,
                expected: "Pending or Satisfied",
                actual,
            }),
        }
    }

    /// Per-atom `(source location, selected resources)` of a satisfied claim.
    pub fn sources(&self, id: ClaimId) -> Result<Vec<(LocationId, Vec<ResourceId>)>, ClaimError> {
        let claim = self.get(id)?;
        if claim.state != ClaimState::Satisfied {
            return Err(ClaimError::WrongState {
                claim: id,
                expected: "Satisfied",
                actual: claim.state,
            });
        }
        Ok(claim
            .atoms
            .iter()
            .zip(&claim.selected)
            .map(|(atom, sel)| (atom.location, sel.clone()))
            .collect())
    }

    // -- accessors ----------------------------------------------------------

    pub fn state(&self, id: ClaimId) -> Result<ClaimState, ClaimError> {
        Ok(self.get(id)?.state)
    }

    pub fn is_pending(&self, id: ClaimId) -> bool {
        matches!(self.claims.get(id), Some(c) if c.state == ClaimState::Pending)
    }

    pub fn process_of(&self, id: ClaimId) -> Result<ProcessId, ClaimError> {
        Ok(self.get(id)?.process)
    }

    /// The claim a resource is reserved by, if any.
    pub fn reserved_by(&self, rid: ResourceId) -> Option<ClaimId> {
        self.reserved.get(rid).copied()
    }

    /// Total resources currently reserved.
    pub fn reserved_total(&self) -> usize {
        self.reserved.len()
    }

    /// Attach the queue sequence of a deadline wake-up to a parked claim.
    pub fn set_deadline_event(&mut self, id: ClaimId, seq: u64) -> Result<(), ClaimError> {
        self.get_mut(id)?.deadline_event = Some(seq);
        Ok(())
    }

    /// Detach and return the deadline wake-up sequence, if one was set.
    pub fn take_deadline_event(&mut self, id: ClaimId) -> Option<u64> {
        self.claims.get_mut(id).and_then(|c| c.deadline_event.take())
    }

    /// Every satisfied claim's reservations, for the conservation audit.
    pub fn satisfied_reservations(&self) -> Vec<(ClaimId, LocationId, ResourceId)> {
        let mut out = Vec::new();
        for (id, claim) in &self.claims {
            if claim.state != ClaimState::Satisfied {
                continue;
            }
            for (atom, sel) in claim.atoms.iter().zip(&claim.selected) {
                for &rid in sel {
                    out.push((id, atom.location, rid));
                }
            }
        }
        out
    }

    // -- internals ----------------------------------------------------------

    fn get(&self, id: ClaimId) -> Result<&Claim, ClaimError> {
        self.claims.get(id).ok_or(ClaimError::UnknownClaim(id))
    }

    fn get_mut(&mut self, id: ClaimId) -> Result<&mut Claim, ClaimError> {
        self.claims.get_mut(id).ok_or(ClaimError::UnknownClaim(id))
    }

    /// Select candidates for every atom against live, unreserved contents.
    /// All-or-nothing: the first failing atom aborts the whole selection and
    /// nothing is reserved.
    fn select(&self, store: &Store, atoms: &[Atom]) -> Result<Vec<Vec<ResourceId>>, AtomFailure> {
        let mut picked: HashSet<ResourceId> = HashSet::new();
        let mut selected = Vec::with_capacity(atoms.len());

        for (index, atom) in atoms.iter().enumerate() {
            let failure = |missing| AtomFailure {
                atom: index,
                location: atom.location,
                missing,
            };
            let location = store.location(atom.location).map_err(|_| failure(atom.count))?;
            let found = location
                .find_free(&atom.predicate, atom.count, |rid| {
                    !self.reserved.contains_key(rid) && !picked.contains(&rid)
                })
                .map_err(|short| failure(short.missing))?;
            picked.extend(found.iter().copied());
            selected.push(found);
        }

        Ok(selected)
    }

    fn take_reservations(&mut self, id: ClaimId) {
        let Some(claim) = self.claims.get(id) else {
            return;
        };
        let all: Vec<ResourceId> = claim.selected.iter().flatten().copied().collect();
        for rid in all {
            self.reserved.insert(rid, id);
        }
    }

    fn spend(&mut self, id: ClaimId, state: ClaimState) {
        if let Some(claim) = self.claims.get_mut(id) {
            claim.state = state;
            claim.selected.clear();
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::KindId;

    fn widget() -> KindId {
        KindId(0)
    }

    fn frame() -> KindId {
        KindId(1)
    }

    fn pid() -> ProcessId {
        let mut sm = SlotMap::<ProcessId, ()>::with_key();
        sm.insert(())
    }

    fn seeded_store(widgets: usize, frames: usize) -> (Store, LocationId) {
        let mut store = Store::new();
        let loc = store.add_location("depot");
        for _ in 0..widgets {
            let r = store.create(widget());
            store.deposit(loc, &[r]).unwrap();
        }
        for _ in 0..frames {
            let r = store.create(frame());
            store.deposit(loc, &[r]).unwrap();
        }
        (store, loc)
    }

    fn deposit_widgets(store: &mut Store, loc: LocationId, n: usize) {
        for _ in 0..n {
            let r = store.create(widget());
            store.deposit(loc, &[r]).unwrap();
        }
    }

    // -----------------------------------------------------------------------
    // Test 1: immediate grant reserves its selection
    // -----------------------------------------------------------------------
    #[test]
    fn grant_reserves_selection() {
        let (store, loc) = seeded_store(3, 0);
        let mut engine = ClaimEngine::new();

        let submitted = engine.submit(&store, pid(), Requirement::of(loc, Predicate::Kind(widget()), 2));
        let Submitted::Granted(claim) = submitted else {
            panic!("expected grant, got {submitted:?}");
        };
        assert_eq!(engine.state(claim).unwrap(), ClaimState::Satisfied);
        assert_eq!(engine.reserved_total(), 2);

        // Only one free widget remains; a second claim for two must park.
        let second = engine.submit(&store, pid(), Requirement::of(loc, Predicate::Kind(widget()), 2));
        let Submitted::Parked { failure, .. } = second else {
            panic!("expected park, got {second:?}");
        };
        assert_eq!(failure.missing, 1);
        assert_eq!(failure.atom, 0);
    }

    // -----------------------------------------------------------------------
    // Test 2: multi-atom claims are all-or-nothing
    // -----------------------------------------------------------------------
    #[test]
    fn multi_atom_all_or_nothing() {
        let (store, loc) = seeded_store(5, 0);
        let mut engine = ClaimEngine::new();

        // Widgets are plentiful but there are no frames: nothing may be
        // reserved.
        let submitted = engine.submit(
            &store,
            pid(),
            Requirement::new()
                .and(loc, Predicate::Kind(widget()), 2)
                .and(loc, Predicate::Kind(frame()), 1),
        );
        assert!(matches!(submitted, Submitted::Parked { .. }));
        assert_eq!(engine.reserved_total(), 0);
    }

    // -----------------------------------------------------------------------
    // Test 3: two atoms on the same bucket never double-pick
    // -----------------------------------------------------------------------
    #[test]
    fn same_location_atoms_pick_distinct_instances() {
        let (store, loc) = seeded_store(2, 0);
        let mut engine = ClaimEngine::new();

        let submitted = engine.submit(
            &store,
            pid(),
            Requirement::new()
                .and(loc, Predicate::Kind(widget()), 1)
                .and(loc, Predicate::Kind(widget()), 1),
        );
        let Submitted::Granted(claim) = submitted else {
            panic!("expected grant");
        };
        let sources = engine.sources(claim).unwrap();
        assert_ne!(sources[0].1[0], sources[1].1[0]);
    }

    // -----------------------------------------------------------------------
    // Test 4: deposit retries parked claims in park order
    // -----------------------------------------------------------------------
    #[test]
    fn deposit_grants_in_park_order() {
        let (mut store, loc) = seeded_store(0, 0);
        let mut engine = ClaimEngine::new();
        let p1 = pid();
        let p2 = pid();

        let Submitted::Parked { claim: first, .. } =
            engine.submit(&store, p1, Requirement::of(loc, Predicate::Kind(widget()), 2))
        else {
            panic!("expected park");
        };
        let Submitted::Parked { claim: second, .. } =
            engine.submit(&store, p2, Requirement::of(loc, Predicate::Kind(widget()), 2))
        else {
            panic!("expected park");
        };

        // Two widgets arrive: exactly enough for one claim. The earlier
        // parker wins.
        deposit_widgets(&mut store, loc, 2);
        let granted = engine.on_deposit(&store, loc);
        assert_eq!(granted.len(), 1);
        assert_eq!(granted[0].0, first);
        assert!(engine.is_pending(second));

        // Two more: the later parker gets its turn.
        deposit_widgets(&mut store, loc, 2);
        let granted = engine.on_deposit(&store, loc);
        assert_eq!(granted.len(), 1);
        assert_eq!(granted[0].0, second);
    }

    // -----------------------------------------------------------------------
    // Test 5: one deposit can grant several claims
    // -----------------------------------------------------------------------
    #[test]
    fn one_deposit_grants_several() {
        let (mut store, loc) = seeded_store(0, 0);
        let mut engine = ClaimEngine::new();

        for _ in 0..3 {
            let submitted = engine.submit(&store, pid(), Requirement::of(loc, Predicate::Kind(widget()), 1));
            assert!(matches!(submitted, Submitted::Parked { .. }));
        }

        deposit_widgets(&mut store, loc, 3);
        let granted = engine.on_deposit(&store, loc);
        assert_eq!(granted.len(), 3);
        assert_eq!(engine.reserved_total(), 3);
    }

    // -----------------------------------------------------------------------
    // Test 6: consume withdraws from the source
    // -----------------------------------------------------------------------
    #[test]
    fn consume_withdraws() {
        let (mut store, loc) = seeded_store(3, 0);
        let mut engine = ClaimEngine::new();

        let Submitted::Granted(claim) =
            engine.submit(&store, pid(), Requirement::of(loc, Predicate::Kind(widget()), 2))
        else {
            panic!("expected grant");
        };

        let taken = engine.consume(&mut store, claim).unwrap();
        assert_eq!(taken.len(), 2);
        assert_eq!(store.location(loc).unwrap().len(), 1);
        assert_eq!(engine.reserved_total(), 0);
        assert_eq!(engine.state(claim).unwrap(), ClaimState::Consumed);

        // A spent handle cannot be consumed again.
        assert!(matches!(
            engine.consume(&mut store, claim),
            Err(ClaimError::WrongState { .. })
        ));
    }

    // -----------------------------------------------------------------------
    // Test 7: claim then release leaves the location bitwise identical
    // -----------------------------------------------------------------------
    #[test]
    fn claim_release_is_identity() {
        let (store, loc) = seeded_store(4, 2);
        let mut engine = ClaimEngine::new();
        let before: Vec<ResourceId> = store.location(loc).unwrap().contents().to_vec();

        let Submitted::Granted(claim) = engine.submit(
            &store,
            pid(),
            Requirement::new()
                .and(loc, Predicate::Kind(widget()), 3)
                .and(loc, Predicate::Kind(frame()), 1),
        ) else {
            panic!("expected grant");
        };
        engine.release(claim).unwrap();

        assert_eq!(store.location(loc).unwrap().contents(), before.as_slice());
        assert_eq!(engine.reserved_total(), 0);
        assert_eq!(engine.state(claim).unwrap(), ClaimState::Cancelled);
    }

    // -----------------------------------------------------------------------
    // Test 8: cancelled pending claims never resurface
    // -----------------------------------------------------------------------
    #[test]
    fn cancelled_pending_claim_stays_dead() {
        let (mut store, loc) = seeded_store(0, 0);
        let mut engine = ClaimEngine::new();

        let Submitted::Parked { claim, .. } =
            engine.submit(&store, pid(), Requirement::of(loc, Predicate::Kind(widget()), 1))
        else {
            panic!("expected park");
        };
        engine.cancel(claim).unwrap();

        deposit_widgets(&mut store, loc, 1);
        assert!(engine.on_deposit(&store, loc).is_empty());
        assert_eq!(engine.state(claim).unwrap(), ClaimState::Cancelled);
    }

    // -----------------------------------------------------------------------
    // Test 9: grant via one location removes the claim from its other
    // watchlists
    // -----------------------------------------------------------------------
    #[test]
    fn cross_location_watch_is_cleared_on_grant() {
        let mut store = Store::new();
        let a = store.add_location("a");
        let b = store.add_location("b");
        let mut engine = ClaimEngine::new();

        let Submitted::Parked { claim, .. } = engine.submit(
            &store,
            pid(),
            Requirement::new()
                .and(a, Predicate::Kind(widget()), 1)
                .and(b, Predicate::Kind(widget()), 1),
        ) else {
            panic!("expected park");
        };

        deposit_widgets(&mut store, a, 1);
        assert!(engine.on_deposit(&store, a).is_empty(), "b is still empty");

        deposit_widgets(&mut store, b, 1);
        let granted = engine.on_deposit(&store, b);
        assert_eq!(granted.len(), 1);
        assert_eq!(granted[0].0, claim);

        // A later deposit to `a` must not touch the already-granted claim.
        deposit_widgets(&mut store, a, 1);
        assert!(engine.on_deposit(&store, a).is_empty());
        assert_eq!(engine.state(claim).unwrap(), ClaimState::Satisfied);
    }
}
