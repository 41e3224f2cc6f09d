//! Drives a real two-stage simulation and aggregates its trace into rolling
//! statistics.

use chainsim_core::clock::hours;
use chainsim_core::fixed::Fixed64;
use chainsim_core::id::{RouteId, UnitId};
use chainsim_core::simulation::{SimConfig, Simulation};
use chainsim_core::test_utils::build_chain_model;
use chainsim_stats::{FlowStats, StatsConfig};

#[test]
fn simulation_trace_feeds_flow_stats() {
    let config = SimConfig {
        seed_capacity: 50,
        rng_seed: 0,
        trace_capacity: 8192,
    };
    let mut sim = Simulation::new(build_chain_model(2), &config).unwrap();
    sim.run_until(hours(12)).unwrap();

    let mut stats = FlowStats::new(StatsConfig {
        window: hours(12),
        history: 16,
    });
    for event in sim.trace().iter() {
        stats.observe(event);
    }
    stats.end_window(sim.now());

    // The upstream unit produced every hour.
    let upstream = stats.production_rate(UnitId(0)).unwrap();
    assert!(upstream > Fixed64::ZERO);

    // The route moved at least one batch.
    assert!(stats.total_shipped() >= 6);
    let route_rate = stats.shipping_rate(RouteId(0)).unwrap();
    assert!(route_rate > Fixed64::ZERO);

    // Downstream production appears too.
    assert!(stats.production_rate(UnitId(1)).unwrap() > Fixed64::ZERO);

    // Delays are disabled in the chain model.
    assert_eq!(stats.total_delays(), 0);
}
