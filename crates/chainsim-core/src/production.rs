//! The per-unit manufacturing loop.
//!
//! Forever: wait for output space, claim the unit's inputs, consume them,
//! fabricate for `production_time`, deposit fresh components. An
//! unsatisfiable input claim parks on the claim engine; no retry loop is
//! needed here. Output space is checked before claiming so the deposit at
//! the end of the cycle can never overflow the output store.

use crate::claim::Requirement;
use crate::databag::keys;
use crate::id::UnitId;
use crate::kernel::StepCtx;
use crate::model::ManufacturingUnit;
use crate::process::{Process, ProcessError, Suspend, Wakeup};
use crate::resource::Predicate;
use crate::trace::TraceEvent;

/// Phase of the production state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Output store too full for another batch; retrying every tick.
    AwaitSpace,
    /// Input claim submitted; waiting for the grant.
    AwaitInputs,
    /// Inputs consumed; fabricating until the timer fires.
    Fabricating,
}

/// The manufacturing loop of one unit.
pub struct ProductionProcess {
    unit_id: UnitId,
    unit: ManufacturingUnit,
    /// Whether deposits here count toward `total_final_output`.
    final_stage: bool,
    name: String,
    phase: Phase,
}

impl ProductionProcess {
    pub fn new(unit_id: UnitId, unit: ManufacturingUnit, final_stage: bool) -> Self {
        let name = format!("production-{}", unit_id.0);
        Self {
            unit_id,
            unit,
            final_stage,
            name,
            phase: Phase::AwaitSpace,
        }
    }

    /// Start the next cycle: throttle on output space, otherwise claim the
    /// inputs.
    fn begin_cycle(&mut self, ctx: &mut StepCtx<'_>) -> Result<Suspend, ProcessError> {
        let resident = ctx.location_len(self.unit.output)?;
        if resident + self.unit.production_size as usize > self.unit.output_cap as usize {
            self.phase = Phase::AwaitSpace;
            return Ok(Suspend::Hold(1));
        }

        let mut req = Requirement::new();
        for &(kind, count) in &self.unit.inputs_needed {
            req = req.and(self.unit.input, Predicate::Kind(kind), count);
        }
        self.phase = Phase::AwaitInputs;
        Ok(Suspend::claim(req))
    }
}

impl Process for ProductionProcess {
    fn name(&self) -> &str {
        &self.name
    }

    fn step(&mut self, ctx: &mut StepCtx<'_>, wake: Wakeup) -> Result<Suspend, ProcessError> {
        match (self.phase, wake) {
            (Phase::AwaitSpace, Wakeup::Start | Wakeup::Timer) => self.begin_cycle(ctx),

            (Phase::AwaitInputs, Wakeup::Granted(handle)) => {
                let inputs = ctx.consume(handle)?;
                ctx.discard(&inputs)?;
                ctx.trace(TraceEvent::CycleStarted {
                    unit: self.unit_id,
                    tick: ctx.now(),
                });
                self.phase = Phase::Fabricating;
                Ok(Suspend::Hold(self.unit.production_time))
            }

            (Phase::Fabricating, Wakeup::Timer) => {
                let fresh: Vec<_> = (0..self.unit.production_size)
                    .map(|_| ctx.create(self.unit.output_kind))
                    .collect();
                ctx.deposit(self.unit.output, &fresh)?;
                if self.final_stage {
                    ctx.bag_add(keys::TOTAL_FINAL_OUTPUT, self.unit.production_size as u64);
                }
                ctx.trace(TraceEvent::CycleCompleted {
                    unit: self.unit_id,
                    kind: self.unit.output_kind,
                    produced: self.unit.production_size,
                    tick: ctx.now(),
                });
                self.begin_cycle(ctx)
            }

            (phase, wake) => Err(ProcessError::UnexpectedWakeup {
                state: match phase {
                    Phase::AwaitSpace => "AwaitSpace",
                    Phase::AwaitInputs => "AwaitInputs",
                    Phase::Fabricating => "Fabricating",
                },
                wake,
            }),
        }
    }
}
