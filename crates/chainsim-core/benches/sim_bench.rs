//! Criterion benchmark: a four-stage chain simulated for a day of virtual
//! time, model assembly included.

use chainsim_core::clock::hours;
use chainsim_core::simulation::{simulate, SimConfig};
use chainsim_core::test_utils::build_chain_model;
use criterion::{criterion_group, criterion_main, Criterion};

fn bench_chain(c: &mut Criterion) {
    let config = SimConfig {
        seed_capacity: 100,
        rng_seed: 0,
        trace_capacity: 64,
    };

    c.bench_function("chain_4_stages_24h", |b| {
        b.iter(|| simulate(build_chain_model(4), hours(24), &config).unwrap())
    });
}

criterion_group!(benches, bench_chain);
criterion_main!(benches);
