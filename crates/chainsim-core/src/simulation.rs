//! Top-level simulation lifecycle: seeding, process registration, the
//! run-until loop, and result extraction.
//!
//! On a fatal error the run stops at the current virtual time and the error
//! carries the metric counters accumulated so far, so a broken run can
//! still be inspected.

use crate::databag::DataBag;
use crate::fixed::Ticks;
use crate::id::{KindId, LocationId, RouteId, UnitId};
use crate::kernel::{AuditReport, Kernel, KernelError};
use crate::location::Store;
use crate::model::{ComponentDef, ManufacturingUnit, Model, ShippingRoute};
use crate::process::ProcessError;
use crate::production::ProductionProcess;
use crate::rng::SimRng;
use crate::shipping::{Leg, ShippingProcess};
use crate::trace::TraceBus;
use std::collections::BTreeMap;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Run parameters independent of the model.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SimConfig {
    /// Input components seeded per required kind at each seed unit,
    /// clamped to the input store's remaining capacity.
    pub seed_capacity: u32,
    pub rng_seed: u64,
    /// Retained trace records.
    pub trace_capacity: usize,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            seed_capacity: 20_000,
            rng_seed: 0,
            trace_capacity: 1024,
        }
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Fatal simulation failures. The counters accumulated up to the failure
/// ride along for inspection.
#[derive(Debug, thiserror::Error)]
pub enum SimError {
    #[error("process '{process}' failed at tick {at}: {source}")]
    Process {
        process: String,
        at: Ticks,
        #[source]
        source: ProcessError,
        bag: DataBag,
    },
    #[error("invariant violated at tick {at}: {detail}")]
    Invariant {
        at: Ticks,
        detail: String,
        bag: DataBag,
    },
}

impl SimError {
    fn from_kernel(err: KernelError, bag: DataBag) -> Self {
        match err {
            KernelError::Process {
                process,
                at,
                source,
            } => SimError::Process {
                process,
                at,
                source,
                bag,
            },
            KernelError::Clock(e) => SimError::Invariant {
                at: e.now,
                detail: e.to_string(),
                bag,
            },
            KernelError::Invariant { at, detail } => SimError::Invariant { at, detail, bag },
        }
    }

    /// The counters at the moment of failure.
    pub fn bag(&self) -> &DataBag {
        match self {
            SimError::Process { bag, .. } | SimError::Invariant { bag, .. } => bag,
        }
    }
}

// ---------------------------------------------------------------------------
// Report
// ---------------------------------------------------------------------------

/// What a completed run hands back to the caller.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct SimReport {
    pub finished_at: Ticks,
    pub bag: DataBag,
    /// Final contents of every location, as kind-name multisets.
    pub locations: BTreeMap<String, BTreeMap<String, u32>>,
    /// Deterministic digest of the final state; identical runs match.
    pub digest: u64,
}

/// FNV-1a, for the replay digest. Not cryptographic.
struct Fnv(u64);

impl Fnv {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;

    fn new() -> Self {
        Self(Self::OFFSET)
    }

    fn write(&mut self, bytes: &[u8]) {
        for &b in bytes {
            self.0 ^= b as u64;
            self.0 = self.0.wrapping_mul(Self::PRIME);
        }
    }

    fn write_u64(&mut self, v: u64) {
        self.write(&v.to_le_bytes());
    }

    fn finish(self) -> u64 {
        self.0
    }
}

// ---------------------------------------------------------------------------
// Simulation
// ---------------------------------------------------------------------------

/// A model bound to a kernel, seeded and ready to run.
#[derive(Debug)]
pub struct Simulation {
    kernel: Kernel,
    components: Vec<ComponentDef>,
    units: Vec<ManufacturingUnit>,
    routes: Vec<ShippingRoute>,
}

impl Simulation {
    /// Seed initial inputs and register one production process per unit and
    /// one shipping process per route, in model order. Seeding happens
    /// before the clock first advances.
    pub fn new(model: Model, config: &SimConfig) -> Result<Self, SimError> {
        let (store, components, units, routes) = model.into_parts();
        let kernel = Kernel::new(store, SimRng::new(config.rng_seed), config.trace_capacity);
        let mut sim = Self {
            kernel,
            components,
            units,
            routes,
        };
        sim.seed(config.seed_capacity)?;
        sim.spawn_processes();
        Ok(sim)
    }

    fn seed(&mut self, seed_capacity: u32) -> Result<(), SimError> {
        let plans: Vec<(LocationId, Vec<KindId>, u32, u32)> = self
            .units
            .iter()
            .map(|unit| {
                let quantity = if unit.seed_unit {
                    seed_capacity
                } else {
                    unit.production_size
                };
                let mut kinds = Vec::new();
                for &(kind, _) in &unit.inputs_needed {
                    if !kinds.contains(&kind) {
                        kinds.push(kind);
                    }
                }
                (unit.input, kinds, quantity, unit.input_cap)
            })
            .collect();

        for (input, kinds, quantity, cap) in plans {
            for kind in kinds {
                let resident = self
                    .kernel
                    .store()
                    .location(input)
                    .map_err(|e| self.invariant(e.to_string()))?
                    .len();
                let room = (cap as usize).saturating_sub(resident) as u32;
                let count = quantity.min(room);
                let ids: Vec<_> = (0..count).map(|_| self.kernel.create(kind)).collect();
                self.kernel
                    .deposit(input, &ids)
                    .map_err(|e| self.invariant(e.to_string()))?;
            }
        }
        Ok(())
    }

    fn spawn_processes(&mut self) {
        for (index, unit) in self.units.iter().enumerate() {
            let unit_id = UnitId(index as u32);
            let final_stage = !self.routes.iter().any(|r| r.supplier == unit_id);
            let body = ProductionProcess::new(unit_id, unit.clone(), final_stage);
            self.kernel.spawn(&format!("production-{index}"), Box::new(body));
        }

        for (index, route) in self.routes.iter().enumerate() {
            let supplier = &self.units[route.supplier.0 as usize];
            let legs: Vec<Leg> = route
                .receivers
                .iter()
                .map(|leg| {
                    let receiver = &self.units[leg.unit.0 as usize];
                    Leg {
                        input: receiver.input,
                        input_cap: receiver.input_cap,
                        shipping_time: leg.shipping_time,
                    }
                })
                .collect();
            let body = ShippingProcess::new(
                RouteId(index as u32),
                supplier.output,
                route.kind,
                route.batch_size,
                supplier.defect_rate,
                supplier.delay_threshold,
                legs,
            );
            self.kernel.spawn(&format!("shipping-{index}"), Box::new(body));
        }
    }

    fn invariant(&self, detail: String) -> SimError {
        SimError::Invariant {
            at: self.kernel.now(),
            detail,
            bag: self.kernel.bag().clone(),
        }
    }

    // -- running ------------------------------------------------------------

    /// Drive the event loop until the clock reaches `deadline` or the queue
    /// empties.
    pub fn run_until(&mut self, deadline: Ticks) -> Result<(), SimError> {
        self.kernel
            .run_until(deadline)
            .map_err(|e| SimError::from_kernel(e, self.kernel.bag().clone()))
    }

    /// Check conservation, storage bounds, and reservation consistency.
    pub fn audit(&self) -> Result<AuditReport, SimError> {
        self.kernel
            .audit()
            .map_err(|e| SimError::from_kernel(e, self.kernel.bag().clone()))
    }

    // -- inspection ---------------------------------------------------------

    pub fn now(&self) -> Ticks {
        self.kernel.now()
    }

    pub fn bag(&self) -> &DataBag {
        self.kernel.bag()
    }

    pub fn store(&self) -> &Store {
        self.kernel.store()
    }

    pub fn trace(&self) -> &TraceBus {
        self.kernel.trace()
    }

    pub fn trace_mut(&mut self) -> &mut TraceBus {
        self.kernel.trace_mut()
    }

    pub fn units(&self) -> &[ManufacturingUnit] {
        &self.units
    }

    pub fn location_id(&self, name: &str) -> Option<LocationId> {
        self.kernel.store().location_by_name(name)
    }

    pub fn kind_name(&self, kind: KindId) -> Option<&str> {
        self.components.get(kind.0 as usize).map(|c| c.name.as_str())
    }

    /// Final contents of one location as a kind-name multiset.
    pub fn multiset(&self, name: &str) -> BTreeMap<String, u32> {
        let mut out = BTreeMap::new();
        let Some(loc) = self.location_id(name) else {
            return out;
        };
        let Ok(counts) = self.kernel.store().kind_multiset(loc) else {
            return out;
        };
        for (kind, n) in counts {
            let label = self
                .kind_name(kind)
                .map(str::to_string)
                .unwrap_or_else(|| format!("kind-{}", kind.0));
            out.insert(label, n);
        }
        out
    }

    /// Deterministic digest of the current state: clock, every location's
    /// multiset in name order, every counter, and the RNG state.
    pub fn digest(&self) -> u64 {
        let mut fnv = Fnv::new();
        fnv.write_u64(self.kernel.now());

        let store = self.kernel.store();
        for (name, loc) in store.locations_by_name() {
            fnv.write(name.as_bytes());
            let Ok(counts) = store.kind_multiset(loc) else {
                continue;
            };
            for (kind, n) in counts {
                fnv.write_u64(kind.0 as u64);
                fnv.write_u64(n as u64);
            }
        }

        for (key, value) in self.kernel.bag().iter() {
            fnv.write(key.as_bytes());
            fnv.write_u64(value);
        }

        fnv.write_u64(self.kernel.rng_state());
        fnv.finish()
    }

    /// Snapshot the run's results.
    pub fn report(&self) -> SimReport {
        let mut locations = BTreeMap::new();
        for (name, _) in self.kernel.store().locations_by_name() {
            locations.insert(name.to_string(), self.multiset(name));
        }
        SimReport {
            finished_at: self.kernel.now(),
            bag: self.kernel.bag().clone(),
            locations,
            digest: self.digest(),
        }
    }
}

/// Build, run to `deadline`, audit, and report in one call.
pub fn simulate(model: Model, deadline: Ticks, config: &SimConfig) -> Result<SimReport, SimError> {
    let mut sim = Simulation::new(model, config)?;
    sim.run_until(deadline)?;
    sim.audit()?;
    Ok(sim.report())
}

// ===========================================================================
// Tests
// ===========================================================================
