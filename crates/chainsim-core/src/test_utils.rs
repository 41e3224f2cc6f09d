//! Shared model-building helpers for tests and benchmarks.
//!
//! Gated behind `#[cfg(any(test, feature = "test-utils"))]` so these helpers
//! are available to unit tests, integration tests, and benchmarks (via the
//! `test-utils` feature) without shipping in regular builds.

use crate::clock::hours;
use crate::fixed::Fixed64;
use crate::id::{KindId, LocationId};
use crate::model::{Model, ModelBuilder, UnitSpec};

pub fn fixed(v: f64) -> Fixed64 {
    Fixed64::from_num(v)
}

/// The largest threshold below one. Uniform draws live on the same 2^-32
/// grid, so no draw can exceed it and delays never fire.
pub fn no_delays() -> Fixed64 {
    Fixed64::from_bits((1_i64 << 32) - 1)
}

/// A unit spec with the defaults the test scenarios share: hourly cycles,
/// caps of 100, no defects, delays disabled.
pub fn basic_unit(
    input: LocationId,
    output: LocationId,
    inputs_needed: Vec<(KindId, u32)>,
) -> UnitSpec {
    UnitSpec {
        input,
        output,
        inputs_needed,
        production_time: hours(1),
        production_size: 10,
        defect_rate: Fixed64::ZERO,
        delay_threshold: no_delays(),
        input_cap: 100,
        output_cap: 100,
        seed_unit: false,
    }
}

/// A linear chain of `stages` units. Stage 0 is seeded; each stage ships
/// its product to the next with hourly transport and a batch of 6. Stage
/// `i` consumes the previous stage's kind and produces its own.
pub fn build_chain_model(stages: usize) -> Model {
    let mut builder = ModelBuilder::new();

    let mut inputs = Vec::new();
    let mut outputs = Vec::new();
    for i in 0..stages {
        inputs.push(builder.add_location(&format!("stage-{i}-in")));
        outputs.push(builder.add_location(&format!("stage-{i}-out")));
    }

    let kinds: Vec<KindId> = (0..stages)
        .map(|i| builder.add_component(&format!("part-{i}"), inputs[i]))
        .collect();

    let mut units = Vec::new();
    for i in 0..stages {
        let needs = if i == 0 {
            vec![(kinds[0], 1)]
        } else {
            vec![(kinds[i - 1], 2)]
        };
        let mut spec = basic_unit(inputs[i], outputs[i], needs);
        spec.seed_unit = i == 0;
        units.push(builder.add_unit(spec));
    }

    for i in 0..stages.saturating_sub(1) {
        builder.link(outputs[i], inputs[i + 1]).unwrap();
        builder.add_route(units[i], vec![(units[i + 1], hours(1))], 6, kinds[i]);
    }

    builder.build().unwrap()
}
