//! The per-route shipping loop.
//!
//! Forever, round-robin over the route's receivers: wait for space at the
//! receiver, claim a defect-adjusted batch at the supplier's output, hold
//! for the transport time (plus a drawn extra delay past the supplier's
//! threshold), then move the batch into the receiver's input store.
//!
//! Defective units are the `batch_size − actual_batch` difference: they are
//! accounted at claim time and never claimed or delivered.

use crate::claim::Requirement;
use crate::databag::keys;
use crate::fixed::{ceil_scaled, scale_ticks, Fixed64, Ticks};
use crate::id::{KindId, LocationId, RouteId};
use crate::kernel::StepCtx;
use crate::process::{ClaimHandle, Process, ProcessError, Suspend, Wakeup};
use crate::resource::Predicate;
use crate::trace::TraceEvent;

/// One receiver as the shipping loop sees it.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Leg {
    pub(crate) input: LocationId,
    pub(crate) input_cap: u32,
    pub(crate) shipping_time: Ticks,
}

/// Phase of the shipping state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Receiver too full for a batch; retrying every tick.
    AwaitSpace,
    /// Batch claim submitted; waiting for the grant.
    AwaitBatch,
    /// Batch reserved; holding for the transport time.
    InTransit,
}

/// The shipping loop of one route.
pub struct ShippingProcess {
    route: RouteId,
    supplier_output: LocationId,
    kind: KindId,
    batch_size: u32,
    defect_rate: Fixed64,
    delay_threshold: Fixed64,
    legs: Vec<Leg>,
    name: String,
    /// Index of the receiver currently being served.
    current: usize,
    /// Claimed batch size, set between grant and delivery.
    actual_batch: u32,
    handle: Option<ClaimHandle>,
    phase: Phase,
}

impl ShippingProcess {
    pub(crate) fn new(
        route: RouteId,
        supplier_output: LocationId,
        kind: KindId,
        batch_size: u32,
        defect_rate: Fixed64,
        delay_threshold: Fixed64,
        legs: Vec<Leg>,
    ) -> Self {
        let name = format!("shipping-{}", route.0);
        Self {
            route,
            supplier_output,
            kind,
            batch_size,
            defect_rate,
            delay_threshold,
            legs,
            name,
            current: 0,
            actual_batch: 0,
            handle: None,
            phase: Phase::AwaitSpace,
        }
    }

    fn leg(&self) -> Leg {
        self.legs[self.current % self.legs.len()]
    }

    /// Serve the current receiver: throttle on its input space, otherwise
    /// claim the defect-adjusted batch. Receivers whose adjusted batch is
    /// zero are skipped; if a full round-robin lap yields nothing, back off
    /// a tick.
    fn begin_leg(&mut self, ctx: &mut StepCtx<'_>) -> Result<Suspend, ProcessError> {
        for _ in 0..self.legs.len() {
            let leg = self.leg();
            if ctx.location_len(leg.input)? + self.batch_size as usize > leg.input_cap as usize {
                self.phase = Phase::AwaitSpace;
                return Ok(Suspend::Hold(1));
            }

            let keep = Fixed64::from_num(1) - self.defect_rate;
            let actual = ceil_scaled(self.batch_size, keep);
            if actual == 0 {
                self.current = (self.current + 1) % self.legs.len();
                continue;
            }

            self.actual_batch = actual;
            self.phase = Phase::AwaitBatch;
            return Ok(Suspend::claim(Requirement::of(
                self.supplier_output,
                Predicate::Kind(self.kind),
                actual,
            )));
        }

        self.phase = Phase::AwaitSpace;
        Ok(Suspend::Hold(1))
    }
}

impl Process for ShippingProcess {
    fn name(&self) -> &str {
        &self.name
    }

    fn step(&mut self, ctx: &mut StepCtx<'_>, wake: Wakeup) -> Result<Suspend, ProcessError> {
        match (self.phase, wake) {
            (Phase::AwaitSpace, Wakeup::Start | Wakeup::Timer) => self.begin_leg(ctx),

            (Phase::AwaitBatch, Wakeup::Granted(handle)) => {
                let discarded = self.batch_size - self.actual_batch;
                if discarded > 0 {
                    ctx.bag_add(keys::NUMBER_OF_DEFECTIVE_COMPONENTS, discarded as u64);
                }

                let leg = self.leg();
                let base = leg.shipping_time;
                let draw = ctx.draw_unit();
                let extra = if draw > self.delay_threshold {
                    let extra = scale_ticks(base, draw);
                    ctx.bag_add(keys::NUMBER_OF_SHIPPING_DELAYS, 1);
                    ctx.bag_add(keys::LENGTH_OF_DELAYS, extra);
                    ctx.trace(TraceEvent::ShippingDelayed {
                        route: self.route,
                        extra,
                        tick: ctx.now(),
                    });
                    extra
                } else {
                    0
                };
                ctx.bag_add(keys::TOTAL_SHIPPING_TIME_WITH_DELAYS, base + extra);

                self.handle = Some(handle);
                self.phase = Phase::InTransit;
                Ok(Suspend::Hold(base + extra))
            }

            (Phase::InTransit, Wakeup::Timer) => {
                let handle = self.handle.take().ok_or(ProcessError::UnexpectedWakeup {
                    state: "InTransit",
                    wake,
                })?;
                let leg = self.leg();
                let moved = ctx.transfer(handle, leg.input)?;
                ctx.bag_add(keys::NUMBER_OF_COMPONENTS_SHIPPED, moved as u64);
                ctx.bag_add(keys::NUMBER_OF_SHIPPINGS_DONE, 1);
                ctx.trace(TraceEvent::BatchShipped {
                    route: self.route,
                    receiver: leg.input,
                    quantity: moved,
                    tick: ctx.now(),
                });

                self.current = (self.current + 1) % self.legs.len();
                self.begin_leg(ctx)
            }

            (phase, wake) => Err(ProcessError::UnexpectedWakeup {
                state: match phase {
                    Phase::AwaitSpace => "AwaitSpace",
                    Phase::AwaitBatch => "AwaitBatch",
                    Phase::InTransit => "InTransit",
                },
                wake,
            }),
        }
    }
}
