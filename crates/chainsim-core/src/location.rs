//! Locations, the per-kind resource index, and the store that owns both.
//!
//! A location is a named bag of resource instances in insertion order, with
//! directed links to peer locations. The [`Store`] is the single arena for
//! locations and resource instances; every deposit, withdrawal and move in
//! the simulation goes through it, which is what makes the conservation
//! audit possible.

use crate::id::{KindId, LocationId, ResourceId};
use crate::resource::{Predicate, Resource};
use slotmap::SlotMap;
use std::collections::BTreeMap;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors raised by store operations. All of these are fatal to the
/// simulation when they escape a process step; well-behaved processes
/// pre-check capacity and only move along existing links.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("unknown location {0:?}")]
    UnknownLocation(LocationId),
    #[error("unknown resource {0:?}")]
    UnknownResource(ResourceId),
    #[error("no link {from} -> {to}")]
    NotLinked { from: String, to: String },
    #[error("capacity exceeded at {location}: cap {cap}, attempted {attempted}")]
    CapacityExceeded {
        location: String,
        cap: u32,
        attempted: usize,
    },
    #[error("resource {resource:?} not present at {location}")]
    AbsentResource {
        resource: ResourceId,
        location: String,
    },
}

/// A `find` that could not satisfy its count. Recoverable: the claim engine
/// turns it into a park.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("insufficient resources: {missing} missing")]
pub struct Insufficient {
    pub missing: u32,
}

// ---------------------------------------------------------------------------
// ResourceIndex
// ---------------------------------------------------------------------------

/// Per-kind buckets over a location's contents. Buckets preserve insertion
/// order, so kind-filtered selection stays deterministic without scanning
/// the whole location.
#[derive(Debug, Clone, Default)]
pub struct ResourceIndex {
    buckets: BTreeMap<KindId, Vec<ResourceId>>,
}

impl ResourceIndex {
    fn insert(&mut self, kind: KindId, id: ResourceId) {
        self.buckets.entry(kind).or_default().push(id);
    }

    fn remove(&mut self, kind: KindId, id: ResourceId) -> bool {
        let Some(bucket) = self.buckets.get_mut(&kind) else {
            return false;
        };
        let Some(pos) = bucket.iter().position(|r| *r == id) else {
            return false;
        };
        bucket.remove(pos);
        if bucket.is_empty() {
            self.buckets.remove(&kind);
        }
        true
    }

    /// Number of resources of `kind` currently indexed.
    pub fn count(&self, kind: KindId) -> u32 {
        self.buckets.get(&kind).map(|b| b.len() as u32).unwrap_or(0)
    }

    fn bucket(&self, kind: KindId) -> &[ResourceId] {
        self.buckets.get(&kind).map(Vec::as_slice).unwrap_or(&[])
    }
}

// ---------------------------------------------------------------------------
// Location
// ---------------------------------------------------------------------------

/// A named container owning a multiset of resources, plus its outbound links.
#[derive(Debug)]
pub struct Location {
    name: String,
    /// Resident resources in insertion order.
    contents: Vec<ResourceId>,
    /// Outbound peers. Links are created at assembly and never removed.
    links: Vec<LocationId>,
    /// Storage cap. `None` means unbounded (non-unit locations).
    cap: Option<u32>,
    index: ResourceIndex,
}

impl Location {
    fn new(name: String) -> Self {
        Self {
            name,
            contents: Vec::new(),
            links: Vec::new(),
            cap: None,
            index: ResourceIndex::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of resident resources (reserved ones included; reservation is
    /// logical and does not move a resource).
    pub fn len(&self) -> usize {
        self.contents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contents.is_empty()
    }

    pub fn cap(&self) -> Option<u32> {
        self.cap
    }

    /// Resident resources of `kind`.
    pub fn count_kind(&self, kind: KindId) -> u32 {
        self.index.count(kind)
    }

    /// Resident resources in insertion order.
    pub fn contents(&self) -> &[ResourceId] {
        &self.contents
    }

    pub fn links(&self) -> &[LocationId] {
        &self.links
    }

    pub fn is_linked_to(&self, to: LocationId) -> bool {
        self.links.contains(&to)
    }

    /// First `count` resources matching `predicate` for which `is_free`
    /// holds, in insertion order. Fails with the number still missing.
    pub fn find_free<F>(
        &self,
        predicate: &Predicate,
        count: u32,
        mut is_free: F,
    ) -> Result<Vec<ResourceId>, Insufficient>
    where
        F: FnMut(ResourceId) -> bool,
    {
        let candidates: &[ResourceId] = match predicate {
            Predicate::Kind(kind) => self.index.bucket(*kind),
            Predicate::Any => &self.contents,
        };

        let mut picked = Vec::with_capacity(count as usize);
        for &id in candidates {
            if picked.len() as u32 == count {
                break;
            }
            if is_free(id) {
                picked.push(id);
            }
        }

        if picked.len() as u32 == count {
            Ok(picked)
        } else {
            Err(Insufficient {
                missing: count - picked.len() as u32,
            })
        }
    }

    /// First `count` resources matching `predicate`, ignoring reservations.
    pub fn find(&self, predicate: &Predicate, count: u32) -> Result<Vec<ResourceId>, Insufficient> {
        self.find_free(predicate, count, |_| true)
    }
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// Arena for locations and resource instances, with conservation counters.
///
/// Resources live in exactly one location at a time or are in flight inside
/// a committed operation; `created` and `retired` track the lifetime totals
/// the audit checks against.
#[derive(Debug, Default)]
pub struct Store {
    resources: SlotMap<ResourceId, Resource>,
    locations: SlotMap<LocationId, Location>,
    /// Location lookup by name, in name order for stable reporting.
    by_name: BTreeMap<String, LocationId>,
    created: u64,
    retired: u64,
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    // -- assembly -----------------------------------------------------------

    /// Create a location. Name uniqueness is validated at model build.
    pub fn add_location(&mut self, name: &str) -> LocationId {
        let id = self.locations.insert(Location::new(name.to_string()));
        self.by_name.insert(name.to_string(), id);
        id
    }

    /// Set the storage cap of a location.
    pub fn set_cap(&mut self, loc: LocationId, cap: u32) -> Result<(), StoreError> {
        self.location_mut(loc)?.cap = Some(cap);
        Ok(())
    }

    /// Add a directed link. Idempotent: re-linking an existing edge is a
    /// no-op.
    pub fn link(&mut self, from: LocationId, to: LocationId) -> Result<(), StoreError> {
        if !self.locations.contains_key(to) {
            return Err(StoreError::UnknownLocation(to));
        }
        let loc = self.location_mut(from)?;
        if !loc.links.contains(&to) {
            loc.links.push(to);
        }
        Ok(())
    }

    pub fn is_linked(&self, from: LocationId, to: LocationId) -> bool {
        self.locations
            .get(from)
            .map(|l| l.is_linked_to(to))
            .unwrap_or(false)
    }

    // -- lookup -------------------------------------------------------------

    pub fn location(&self, loc: LocationId) -> Result<&Location, StoreError> {
        self.locations.get(loc).ok_or(StoreError::UnknownLocation(loc))
    }

    fn location_mut(&mut self, loc: LocationId) -> Result<&mut Location, StoreError> {
        self.locations
            .get_mut(loc)
            .ok_or(StoreError::UnknownLocation(loc))
    }

    pub fn location_by_name(&self, name: &str) -> Option<LocationId> {
        self.by_name.get(name).copied()
    }

    /// Locations in name order.
    pub fn locations_by_name(&self) -> impl Iterator<Item = (&str, LocationId)> {
        self.by_name.iter().map(|(n, id)| (n.as_str(), *id))
    }

    pub fn resource(&self, id: ResourceId) -> Result<&Resource, StoreError> {
        self.resources.get(id).ok_or(StoreError::UnknownResource(id))
    }

    /// Resident kind counts of a location, for comparisons in tests and
    /// reports.
    pub fn kind_multiset(&self, loc: LocationId) -> Result<BTreeMap<KindId, u32>, StoreError> {
        let location = self.location(loc)?;
        let mut out = BTreeMap::new();
        for &rid in &location.contents {
            let kind = self.resource(rid)?.kind;
            *out.entry(kind).or_insert(0) += 1;
        }
        Ok(out)
    }

    // -- resource lifecycle -------------------------------------------------

    /// Create a fresh resource instance. It belongs to no location until
    /// deposited.
    pub fn create(&mut self, kind: KindId) -> ResourceId {
        self.created += 1;
        self.resources.insert(Resource::new(kind))
    }

    /// Retire withdrawn instances (consumed by production). They must not be
    /// resident anywhere.
    pub fn retire(&mut self, ids: &[ResourceId]) -> Result<(), StoreError> {
        for &id in ids {
            self.resources
                .remove(id)
                .ok_or(StoreError::UnknownResource(id))?;
            self.retired += 1;
        }
        Ok(())
    }

    /// Deposit resources, enforcing the location's cap.
    pub fn deposit(&mut self, loc: LocationId, ids: &[ResourceId]) -> Result<(), StoreError> {
        let attempted = self.location(loc)?.len() + ids.len();
        if let Some(cap) = self.location(loc)?.cap {
            if attempted > cap as usize {
                return Err(StoreError::CapacityExceeded {
                    location: self.location(loc)?.name.clone(),
                    cap,
                    attempted,
                });
            }
        }
        self.deposit_unchecked(loc, ids)
    }

    fn deposit_unchecked(&mut self, loc: LocationId, ids: &[ResourceId]) -> Result<(), StoreError> {
        for &id in ids {
            let kind = self.resource(id)?.kind;
            let location = self.location_mut(loc)?;
            location.contents.push(id);
            location.index.insert(kind, id);
        }
        Ok(())
    }

    /// Withdraw specific instances. Fails if any is absent.
    pub fn withdraw(&mut self, loc: LocationId, ids: &[ResourceId]) -> Result<(), StoreError> {
        for &id in ids {
            let kind = self.resource(id)?.kind;
            let location = self.location_mut(loc)?;
            let Some(pos) = location.contents.iter().position(|r| *r == id) else {
                return Err(StoreError::AbsentResource {
                    resource: id,
                    location: location.name.clone(),
                });
            };
            location.contents.remove(pos);
            location.index.remove(kind, id);
        }
        Ok(())
    }

    // -- conservation -------------------------------------------------------

    /// Total instances ever created.
    pub fn created(&self) -> u64 {
        self.created
    }

    /// Total instances retired (consumed).
    pub fn retired(&self) -> u64 {
        self.retired
    }

    /// Instances currently alive in the arena.
    pub fn live(&self) -> u64 {
        self.resources.len() as u64
    }

    /// Instances currently resident across all locations.
    pub fn resident(&self) -> u64 {
        self.locations.values().map(|l| l.len() as u64).sum()
    }

    /// Check the per-location index against the raw contents. Returns the
    /// name of the first inconsistent location.
    pub fn check_indexes(&self) -> Result<(), String> {
        for location in self.locations.values() {
            let mut counts: BTreeMap<KindId, u32> = BTreeMap::new();
            for &rid in &location.contents {
                let kind = self
                    .resources
                    .get(rid)
                    .ok_or_else(|| format!("{}: dangling resource", location.name))?
                    .kind;
                *counts.entry(kind).or_insert(0) += 1;
            }
            for (kind, n) in &counts {
                if location.index.count(*kind) != *n {
                    return Err(format!("{}: index out of sync for {kind:?}", location.name));
                }
            }
        }
        Ok(())
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn widget() -> KindId {
        KindId(0)
    }

    fn frame() -> KindId {
        KindId(1)
    }

    fn store_with_two_locations() -> (Store, LocationId, LocationId) {
        let mut store = Store::new();
        let a = store.add_location("a");
        let b = store.add_location("b");
        (store, a, b)
    }

    // -----------------------------------------------------------------------
    // Test 1: deposit preserves insertion order
    // -----------------------------------------------------------------------
    #[test]
    fn deposit_preserves_insertion_order() {
        let (mut store, a, _) = store_with_two_locations();
        let r1 = store.create(widget());
        let r2 = store.create(frame());
        let r3 = store.create(widget());
        store.deposit(a, &[r1, r2, r3]).unwrap();

        assert_eq!(store.location(a).unwrap().contents(), &[r1, r2, r3]);
        assert_eq!(store.location(a).unwrap().count_kind(widget()), 2);
        assert_eq!(store.location(a).unwrap().count_kind(frame()), 1);
    }

    // -----------------------------------------------------------------------
    // Test 2: find selects in insertion order
    // -----------------------------------------------------------------------
    #[test]
    fn find_selects_in_insertion_order() {
        let (mut store, a, _) = store_with_two_locations();
        let r1 = store.create(widget());
        let r2 = store.create(widget());
        let r3 = store.create(widget());
        store.deposit(a, &[r1, r2, r3]).unwrap();

        let found = store
            .location(a)
            .unwrap()
            .find(&Predicate::Kind(widget()), 2)
            .unwrap();
        assert_eq!(found, vec![r1, r2]);
    }

    // -----------------------------------------------------------------------
    // Test 3: an Any predicate selects across kinds in insertion order
    // -----------------------------------------------------------------------
    #[test]
    fn find_any_selects_across_kinds() {
        let (mut store, a, _) = store_with_two_locations();
        let r1 = store.create(widget());
        let r2 = store.create(frame());
        let r3 = store.create(widget());
        store.deposit(a, &[r1, r2, r3]).unwrap();

        let found = store.location(a).unwrap().find(&Predicate::Any, 2).unwrap();
        assert_eq!(found, vec![r1, r2]);
    }

    // -----------------------------------------------------------------------
    // Test 4: find reports how many are missing
    // -----------------------------------------------------------------------
    #[test]
    fn find_reports_missing_count() {
        let (mut store, a, _) = store_with_two_locations();
        let r1 = store.create(widget());
        store.deposit(a, &[r1]).unwrap();

        let err = store
            .location(a)
            .unwrap()
            .find(&Predicate::Kind(widget()), 4)
            .unwrap_err();
        assert_eq!(err.missing, 3);
    }

    // -----------------------------------------------------------------------
    // Test 5: find_free skips busy resources
    // -----------------------------------------------------------------------
    #[test]
    fn find_free_skips_busy() {
        let (mut store, a, _) = store_with_two_locations();
        let r1 = store.create(widget());
        let r2 = store.create(widget());
        store.deposit(a, &[r1, r2]).unwrap();

        let found = store
            .location(a)
            .unwrap()
            .find_free(&Predicate::Kind(widget()), 1, |rid| rid != r1)
            .unwrap();
        assert_eq!(found, vec![r2]);
    }

    // -----------------------------------------------------------------------
    // Test 6: withdraw removes the exact instances
    // -----------------------------------------------------------------------
    #[test]
    fn withdraw_removes_instances() {
        let (mut store, a, _) = store_with_two_locations();
        let r1 = store.create(widget());
        let r2 = store.create(widget());
        store.deposit(a, &[r1, r2]).unwrap();

        store.withdraw(a, &[r1]).unwrap();
        assert_eq!(store.location(a).unwrap().contents(), &[r2]);
        assert_eq!(store.location(a).unwrap().count_kind(widget()), 1);

        let err = store.withdraw(a, &[r1]).unwrap_err();
        assert!(matches!(err, StoreError::AbsentResource { .. }));
    }

    // -----------------------------------------------------------------------
    // Test 7: capacity is enforced on deposit
    // -----------------------------------------------------------------------
    #[test]
    fn deposit_enforces_cap() {
        let (mut store, a, _) = store_with_two_locations();
        store.set_cap(a, 2).unwrap();
        let r1 = store.create(widget());
        let r2 = store.create(widget());
        let r3 = store.create(widget());
        store.deposit(a, &[r1, r2]).unwrap();

        let err = store.deposit(a, &[r3]).unwrap_err();
        assert!(matches!(err, StoreError::CapacityExceeded { cap: 2, .. }));
        // The rejected deposit must not have changed the location.
        assert_eq!(store.location(a).unwrap().len(), 2);
    }

    // -----------------------------------------------------------------------
    // Test 8: linking is idempotent
    // -----------------------------------------------------------------------
    #[test]
    fn link_is_idempotent() {
        let (mut store, a, b) = store_with_two_locations();
        store.link(a, b).unwrap();
        store.link(a, b).unwrap();
        assert_eq!(store.location(a).unwrap().links(), &[b]);
        assert!(store.is_linked(a, b));
        assert!(!store.is_linked(b, a));
    }

    // -----------------------------------------------------------------------
    // Test 9: move there and back restores membership exactly
    // -----------------------------------------------------------------------
    #[test]
    fn move_round_trip_restores_membership() {
        let (mut store, a, b) = store_with_two_locations();
        let r1 = store.create(widget());
        let r2 = store.create(frame());
        store.deposit(a, &[r1, r2]).unwrap();
        let before = store.kind_multiset(a).unwrap();

        store.withdraw(a, &[r1, r2]).unwrap();
        store.deposit(b, &[r1, r2]).unwrap();
        store.withdraw(b, &[r1, r2]).unwrap();
        store.deposit(a, &[r1, r2]).unwrap();

        assert_eq!(store.kind_multiset(a).unwrap(), before);
        assert!(store.location(b).unwrap().is_empty());
    }

    // -----------------------------------------------------------------------
    // Test 10: conservation counters
    // -----------------------------------------------------------------------
    #[test]
    fn conservation_counters_track_lifecycle() {
        let (mut store, a, _) = store_with_two_locations();
        let r1 = store.create(widget());
        let r2 = store.create(widget());
        store.deposit(a, &[r1, r2]).unwrap();
        assert_eq!(store.created(), 2);
        assert_eq!(store.resident(), 2);

        store.withdraw(a, &[r1]).unwrap();
        store.retire(&[r1]).unwrap();
        assert_eq!(store.retired(), 1);
        assert_eq!(store.live(), 1);
        assert_eq!(store.resident(), 1);
        store.check_indexes().unwrap();
    }
}
