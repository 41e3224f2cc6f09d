//! Model assembly: locations, component kinds, manufacturing units, and
//! shipping routes, with the build-time validation that rejects broken
//! configurations before any event runs.
//!
//! Assembly is a mutable builder frozen by `build()`: register everything,
//! then validate the whole graph at once so a broken model is reported as
//! configuration, never as a mid-run failure.

use crate::fixed::{Fixed64, Ticks};
use crate::id::{KindId, LocationId, RouteId, UnitId};
use crate::location::{Store, StoreError};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Structural configuration errors. Fatal: surfaced from [`ModelBuilder::build`].
#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error("duplicate location name '{0}'")]
    DuplicateLocation(String),
    #[error("unit '{unit}' has no component originating at its input location")]
    NoProducibleComponent { unit: String },
    #[error("unit '{unit}' has {count} components originating at its input location")]
    AmbiguousProducibleComponent { unit: String, count: usize },
    #[error("unit '{unit}': production size must be positive")]
    ZeroProductionSize { unit: String },
    #[error("unit '{unit}': storage caps must be positive")]
    ZeroCapacity { unit: String },
    #[error("unit '{unit}': {what} {value} outside [0, 1)")]
    RateOutOfRange {
        unit: String,
        what: &'static str,
        value: String,
    },
    #[error("unit '{unit}' declares no inputs")]
    NoInputs { unit: String },
    #[error("unit '{unit}': input counts must be positive")]
    ZeroInputCount { unit: String },
    #[error("route {route}: batch size must be positive")]
    ZeroBatchSize { route: usize },
    #[error("route {route} has no receivers")]
    NoReceivers { route: usize },
    #[error("route {route}: missing link {from} -> {to}")]
    MissingLink {
        route: usize,
        from: String,
        to: String,
    },
    #[error("route {route}: unknown unit reference")]
    UnknownUnit { route: usize },
    #[error("unknown component kind {0:?}")]
    UnknownKind(KindId),
    #[error(transparent)]
    Store(#[from] StoreError),
}

// ---------------------------------------------------------------------------
// Definitions
// ---------------------------------------------------------------------------

/// A registered component kind: a name and the location where instances of
/// it are produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComponentDef {
    pub name: String,
    pub origin: LocationId,
}

/// Parameters of a manufacturing unit, as supplied to the builder.
#[derive(Debug, Clone)]
pub struct UnitSpec {
    pub input: LocationId,
    pub output: LocationId,
    /// Consumed per production cycle: `(kind, count)`.
    pub inputs_needed: Vec<(KindId, u32)>,
    pub production_time: Ticks,
    pub production_size: u32,
    pub defect_rate: Fixed64,
    pub delay_threshold: Fixed64,
    pub input_cap: u32,
    pub output_cap: u32,
    /// Supply-chain root: seeded with a full input store instead of a primer.
    pub seed_unit: bool,
}

/// A validated manufacturing unit. `output_kind` is the unique component
/// originating at the unit's input location.
#[derive(Debug, Clone)]
pub struct ManufacturingUnit {
    pub input: LocationId,
    pub output: LocationId,
    pub inputs_needed: Vec<(KindId, u32)>,
    pub production_time: Ticks,
    pub production_size: u32,
    pub defect_rate: Fixed64,
    pub delay_threshold: Fixed64,
    pub input_cap: u32,
    pub output_cap: u32,
    pub seed_unit: bool,
    pub output_kind: KindId,
}

/// One receiver of a route, with its base transport time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceiverLeg {
    pub unit: UnitId,
    pub shipping_time: Ticks,
}

/// A validated shipping route: one supplier feeding its receivers in fixed
/// batches of one component kind.
#[derive(Debug, Clone)]
pub struct ShippingRoute {
    pub supplier: UnitId,
    pub receivers: Vec<ReceiverLeg>,
    pub batch_size: u32,
    pub kind: KindId,
}

#[derive(Debug, Clone)]
struct RouteSpec {
    supplier: UnitId,
    receivers: Vec<(UnitId, Ticks)>,
    batch_size: u32,
    kind: KindId,
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Registers locations, links, components, units, and routes, and freezes
/// them into a validated [`Model`].
#[derive(Debug, Default)]
pub struct ModelBuilder {
    store: Store,
    location_names: Vec<String>,
    components: Vec<ComponentDef>,
    units: Vec<UnitSpec>,
    routes: Vec<RouteSpec>,
}

impl ModelBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a location. Names must be unique; duplicates are reported at
    /// build.
    pub fn add_location(&mut self, name: &str) -> LocationId {
        self.location_names.push(name.to_string());
        self.store.add_location(name)
    }

    /// Add a directed link. Idempotent.
    pub fn link(&mut self, from: LocationId, to: LocationId) -> Result<(), ModelError> {
        Ok(self.store.link(from, to)?)
    }

    /// Register a component kind produced at `origin`.
    pub fn add_component(&mut self, name: &str, origin: LocationId) -> KindId {
        let id = KindId(self.components.len() as u32);
        self.components.push(ComponentDef {
            name: name.to_string(),
            origin,
        });
        id
    }

    /// Register a manufacturing unit. Its input and output locations are
    /// linked automatically at build.
    pub fn add_unit(&mut self, spec: UnitSpec) -> UnitId {
        let id = UnitId(self.units.len() as u32);
        self.units.push(spec);
        id
    }

    /// Register a shipping route. The links `supplier.output ->
    /// receiver.input` must already exist; they are validated at build.
    pub fn add_route(
        &mut self,
        supplier: UnitId,
        receivers: Vec<(UnitId, Ticks)>,
        batch_size: u32,
        kind: KindId,
    ) -> RouteId {
        let id = RouteId(self.routes.len() as u32);
        self.routes.push(RouteSpec {
            supplier,
            receivers,
            batch_size,
            kind,
        });
        id
    }

    /// Validate everything and freeze the model.
    pub fn build(mut self) -> Result<Model, ModelError> {
        // Location names must be unique.
        let mut seen = std::collections::HashSet::new();
        for name in &self.location_names {
            if !seen.insert(name.as_str()) {
                return Err(ModelError::DuplicateLocation(name.clone()));
            }
        }

        let one = Fixed64::from_num(1);
        let mut units = Vec::with_capacity(self.units.len());
        for spec in &self.units {
            // Units are labelled by their input location in diagnostics.
            let unit = self.store.location(spec.input)?.name().to_string();

            if spec.production_size == 0 {
                return Err(ModelError::ZeroProductionSize { unit });
            }
            if spec.input_cap == 0 || spec.output_cap == 0 {
                return Err(ModelError::ZeroCapacity { unit });
            }
            for (what, value) in [
                ("defect rate", spec.defect_rate),
                ("delay threshold", spec.delay_threshold),
            ] {
                if value < Fixed64::ZERO || value >= one {
                    return Err(ModelError::RateOutOfRange {
                        unit,
                        what,
                        value: value.to_string(),
                    });
                }
            }
            if spec.inputs_needed.is_empty() {
                return Err(ModelError::NoInputs { unit });
            }
            if spec.inputs_needed.iter().any(|(_, n)| *n == 0) {
                return Err(ModelError::ZeroInputCount { unit });
            }
            for (kind, _) in &spec.inputs_needed {
                if kind.0 as usize >= self.components.len() {
                    return Err(ModelError::UnknownKind(*kind));
                }
            }

            // The unit produces the unique component originating at its
            // input location.
            let producible: Vec<KindId> = self
                .components
                .iter()
                .enumerate()
                .filter(|(_, c)| c.origin == spec.input)
                .map(|(i, _)| KindId(i as u32))
                .collect();
            let output_kind = match producible.as_slice() {
                [kind] => *kind,
                [] => return Err(ModelError::NoProducibleComponent { unit }),
                many => {
                    return Err(ModelError::AmbiguousProducibleComponent {
                        unit,
                        count: many.len(),
                    })
                }
            };

            self.store.link(spec.input, spec.output)?;
            self.store.set_cap(spec.input, spec.input_cap)?;
            self.store.set_cap(spec.output, spec.output_cap)?;

            units.push(ManufacturingUnit {
                input: spec.input,
                output: spec.output,
                inputs_needed: spec.inputs_needed.clone(),
                production_time: spec.production_time,
                production_size: spec.production_size,
                defect_rate: spec.defect_rate,
                delay_threshold: spec.delay_threshold,
                input_cap: spec.input_cap,
                output_cap: spec.output_cap,
                seed_unit: spec.seed_unit,
                output_kind,
            });
        }

        let mut routes = Vec::with_capacity(self.routes.len());
        for (index, spec) in self.routes.iter().enumerate() {
            if spec.batch_size == 0 {
                return Err(ModelError::ZeroBatchSize { route: index });
            }
            if spec.receivers.is_empty() {
                return Err(ModelError::NoReceivers { route: index });
            }
            if spec.kind.0 as usize >= self.components.len() {
                return Err(ModelError::UnknownKind(spec.kind));
            }
            let supplier = units
                .get(spec.supplier.0 as usize)
                .ok_or(ModelError::UnknownUnit { route: index })?
                .clone();

            let mut receivers = Vec::with_capacity(spec.receivers.len());
            for (unit_id, shipping_time) in &spec.receivers {
                let receiver = units
                    .get(unit_id.0 as usize)
                    .ok_or(ModelError::UnknownUnit { route: index })?;
                if !self.store.is_linked(supplier.output, receiver.input) {
                    return Err(ModelError::MissingLink {
                        route: index,
                        from: self.store.location(supplier.output)?.name().to_string(),
                        to: self.store.location(receiver.input)?.name().to_string(),
                    });
                }
                receivers.push(ReceiverLeg {
                    unit: *unit_id,
                    shipping_time: *shipping_time,
                });
            }

            routes.push(ShippingRoute {
                supplier: spec.supplier,
                receivers,
                batch_size: spec.batch_size,
                kind: spec.kind,
            });
        }

        Ok(Model {
            store: self.store,
            components: self.components,
            units,
            routes,
        })
    }
}

// ---------------------------------------------------------------------------
// Model
// ---------------------------------------------------------------------------

/// A validated model, ready to simulate.
#[derive(Debug)]
pub struct Model {
    pub(crate) store: Store,
    components: Vec<ComponentDef>,
    units: Vec<ManufacturingUnit>,
    routes: Vec<ShippingRoute>,
}

impl Model {
    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn units(&self) -> &[ManufacturingUnit] {
        &self.units
    }

    pub fn unit(&self, id: UnitId) -> Option<&ManufacturingUnit> {
        self.units.get(id.0 as usize)
    }

    pub fn routes(&self) -> &[ShippingRoute] {
        &self.routes
    }

    pub fn route(&self, id: RouteId) -> Option<&ShippingRoute> {
        self.routes.get(id.0 as usize)
    }

    pub fn components(&self) -> &[ComponentDef] {
        &self.components
    }

    pub fn kind_name(&self, kind: KindId) -> Option<&str> {
        self.components.get(kind.0 as usize).map(|c| c.name.as_str())
    }

    pub fn kind_id(&self, name: &str) -> Option<KindId> {
        self.components
            .iter()
            .position(|c| c.name == name)
            .map(|i| KindId(i as u32))
    }

    pub fn location_id(&self, name: &str) -> Option<LocationId> {
        self.store.location_by_name(name)
    }

    /// A unit is final-stage when it supplies no shipping route; its output
    /// counts toward `total_final_output`.
    pub fn is_final_stage(&self, unit: UnitId) -> bool {
        !self.routes.iter().any(|r| r.supplier == unit)
    }

    pub(crate) fn into_parts(
        self,
    ) -> (
        Store,
        Vec<ComponentDef>,
        Vec<ManufacturingUnit>,
        Vec<ShippingRoute>,
    ) {
        (self.store, self.components, self.units, self.routes)
    }
}

// ===========================================================================
// Tests
// ===========================================================================
