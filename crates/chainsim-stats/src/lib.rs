//! Rolling throughput statistics for the chainsim engine.
//!
//! Feeds on core trace records (`CycleCompleted`, `BatchShipped`,
//! `ShippingDelayed`) and aggregates them into per-unit production and
//! per-route shipping rates over fixed windows of virtual time, using
//! [`Fixed64`] arithmetic so the numbers are as deterministic as the run
//! that produced them.
//!
//! # Usage
//!
//! ```ignore
//! let mut stats = FlowStats::new(StatsConfig::default());
//! for event in sim.trace().iter() {
//!     stats.observe(event);
//! }
//! stats.end_window(sim.now());
//! let rate = stats.production_rate(unit);
//! ```

use chainsim_core::fixed::{Fixed64, Ticks};
use chainsim_core::id::{RouteId, UnitId};
use chainsim_core::trace::TraceEvent;
use std::collections::HashMap;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Configuration for the statistics windows.
#[derive(Debug, Clone)]
pub struct StatsConfig {
    /// Window size in ticks for rate computation.
    pub window: Ticks,
    /// Historical windows retained per metric.
    pub history: usize,
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            window: 3_600,
            history: 256,
        }
    }
}

// ---------------------------------------------------------------------------
// SampleWindow: bounded history of per-window rates
// ---------------------------------------------------------------------------

/// A fixed-capacity ring of [`Fixed64`] samples. When full, the oldest
/// sample is overwritten. Iterates oldest-to-newest.
#[derive(Debug, Clone)]
pub struct SampleWindow {
    data: Vec<Fixed64>,
    head: usize,
    len: usize,
}

impl SampleWindow {
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "SampleWindow capacity must be > 0");
        Self {
            data: vec![Fixed64::ZERO; capacity],
            head: 0,
            len: 0,
        }
    }

    /// Push a sample, overwriting the oldest when at capacity.
    pub fn push(&mut self, value: Fixed64) {
        self.data[self.head] = value;
        self.head = (self.head + 1) % self.capacity();
        if self.len < self.capacity() {
            self.len += 1;
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// The most recent sample, if any.
    pub fn latest(&self) -> Option<Fixed64> {
        if self.len == 0 {
            return None;
        }
        let idx = if self.head == 0 {
            self.capacity() - 1
        } else {
            self.head - 1
        };
        Some(self.data[idx])
    }

    /// Mean of the stored samples.
    pub fn mean(&self) -> Option<Fixed64> {
        if self.len == 0 {
            return None;
        }
        let sum: Fixed64 = self.iter().sum();
        Some(sum / Fixed64::from_num(self.len as u32))
    }

    /// Samples oldest to newest.
    pub fn iter(&self) -> impl Iterator<Item = Fixed64> + '_ {
        let start = if self.len < self.capacity() {
            0
        } else {
            self.head
        };
        (0..self.len).map(move |i| self.data[(start + i) % self.capacity()])
    }

    pub fn to_vec(&self) -> Vec<Fixed64> {
        self.iter().collect()
    }
}

// ---------------------------------------------------------------------------
// FlowStats
// ---------------------------------------------------------------------------

/// Per-unit production and per-route shipping rates over rolling windows.
#[derive(Debug)]
pub struct FlowStats {
    config: StatsConfig,
    /// Counts accumulated in the window being filled.
    produced: HashMap<UnitId, u32>,
    shipped: HashMap<RouteId, u32>,
    delays: u32,
    /// Per-window rates (items per tick), newest last.
    production_history: HashMap<UnitId, SampleWindow>,
    shipping_history: HashMap<RouteId, SampleWindow>,
    /// Lifetime totals.
    total_produced: u64,
    total_shipped: u64,
    total_delays: u64,
    windows_closed: u64,
}

impl FlowStats {
    pub fn new(config: StatsConfig) -> Self {
        Self {
            config,
            produced: HashMap::new(),
            shipped: HashMap::new(),
            delays: 0,
            production_history: HashMap::new(),
            shipping_history: HashMap::new(),
            total_produced: 0,
            total_shipped: 0,
            total_delays: 0,
            windows_closed: 0,
        }
    }

    /// Accumulate one trace record into the open window. Records the stats
    /// do not care about are ignored.
    pub fn observe(&mut self, event: &TraceEvent) {
        match event {
            TraceEvent::CycleCompleted { unit, produced, .. } => {
                *self.produced.entry(*unit).or_insert(0) += produced;
                self.total_produced += *produced as u64;
            }
            TraceEvent::BatchShipped { route, quantity, .. } => {
                *self.shipped.entry(*route).or_insert(0) += quantity;
                self.total_shipped += *quantity as u64;
            }
            TraceEvent::ShippingDelayed { .. } => {
                self.delays += 1;
                self.total_delays += 1;
            }
            _ => {}
        }
    }

    /// Close the open window: convert its counts to per-tick rates, push
    /// them into the histories, and reset the counters.
    pub fn end_window(&mut self, _at: Ticks) {
        let window = Fixed64::from_num(self.config.window.max(1));
        let history = self.config.history;

        for (unit, count) in self.produced.drain() {
            self.production_history
                .entry(unit)
                .or_insert_with(|| SampleWindow::new(history))
                .push(Fixed64::from_num(count) / window);
        }
        for (route, count) in self.shipped.drain() {
            self.shipping_history
                .entry(route)
                .or_insert_with(|| SampleWindow::new(history))
                .push(Fixed64::from_num(count) / window);
        }
        self.delays = 0;
        self.windows_closed += 1;
    }

    // -- queries ------------------------------------------------------------

    /// Latest per-tick production rate of a unit.
    pub fn production_rate(&self, unit: UnitId) -> Option<Fixed64> {
        self.production_history.get(&unit).and_then(|w| w.latest())
    }

    /// Latest per-tick shipped volume of a route.
    pub fn shipping_rate(&self, route: RouteId) -> Option<Fixed64> {
        self.shipping_history.get(&route).and_then(|w| w.latest())
    }

    /// Mean production rate of a unit across retained windows.
    pub fn mean_production_rate(&self, unit: UnitId) -> Option<Fixed64> {
        self.production_history.get(&unit).and_then(|w| w.mean())
    }

    /// Per-window production rates of a unit, oldest first.
    pub fn production_trend(&self, unit: UnitId) -> Vec<Fixed64> {
        self.production_history
            .get(&unit)
            .map(|w| w.to_vec())
            .unwrap_or_default()
    }

    pub fn total_produced(&self) -> u64 {
        self.total_produced
    }

    pub fn total_shipped(&self) -> u64 {
        self.total_shipped
    }

    pub fn total_delays(&self) -> u64 {
        self.total_delays
    }

    pub fn windows_closed(&self) -> u64 {
        self.windows_closed
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chainsim_core::id::KindId;

    fn cycle(unit: u32, produced: u32, tick: Ticks) -> TraceEvent {
        TraceEvent::CycleCompleted {
            unit: UnitId(unit),
            kind: KindId(0),
            produced,
            tick,
        }
    }

    // -----------------------------------------------------------------------
    // Test 1: sample window push and latest
    // -----------------------------------------------------------------------
    #[test]
    fn sample_window_push_and_latest() {
        let mut window = SampleWindow::new(3);
        assert!(window.latest().is_none());

        window.push(Fixed64::from_num(1));
        window.push(Fixed64::from_num(2));
        assert_eq!(window.latest(), Some(Fixed64::from_num(2)));
        assert_eq!(window.len(), 2);
    }

    // -----------------------------------------------------------------------
    // Test 2: sample window wraps and keeps the newest
    // -----------------------------------------------------------------------
    #[test]
    fn sample_window_wraps() {
        let mut window = SampleWindow::new(2);
        for v in 1..=4 {
            window.push(Fixed64::from_num(v));
        }
        assert_eq!(
            window.to_vec(),
            vec![Fixed64::from_num(3), Fixed64::from_num(4)]
        );
        assert_eq!(window.mean(), Some(Fixed64::from_num(3.5)));
    }

    // -----------------------------------------------------------------------
    // Test 3: production counts become per-tick rates at window close
    // -----------------------------------------------------------------------
    #[test]
    fn production_counts_become_rates() {
        let mut stats = FlowStats::new(StatsConfig {
            window: 100,
            history: 8,
        });

        stats.observe(&cycle(0, 30, 10));
        stats.observe(&cycle(0, 20, 60));
        assert!(stats.production_rate(UnitId(0)).is_none(), "window still open");

        stats.end_window(100);
        assert_eq!(
            stats.production_rate(UnitId(0)),
            Some(Fixed64::from_num(0.5))
        );
        assert_eq!(stats.total_produced(), 50);
        assert_eq!(stats.windows_closed(), 1);
    }

    // -----------------------------------------------------------------------
    // Test 4: units are tracked independently
    // -----------------------------------------------------------------------
    #[test]
    fn units_tracked_independently() {
        let mut stats = FlowStats::new(StatsConfig {
            window: 10,
            history: 8,
        });

        stats.observe(&cycle(0, 10, 1));
        stats.observe(&cycle(1, 40, 2));
        stats.end_window(10);

        assert_eq!(stats.production_rate(UnitId(0)), Some(Fixed64::from_num(1)));
        assert_eq!(stats.production_rate(UnitId(1)), Some(Fixed64::from_num(4)));
        assert!(stats.production_rate(UnitId(2)).is_none());
    }

    // -----------------------------------------------------------------------
    // Test 5: an empty window pushes nothing
    // -----------------------------------------------------------------------
    #[test]
    fn empty_window_pushes_nothing() {
        let mut stats = FlowStats::new(StatsConfig {
            window: 10,
            history: 8,
        });
        stats.observe(&cycle(0, 5, 1));
        stats.end_window(10);
        stats.end_window(20);

        // Only the first window produced a sample.
        assert_eq!(stats.production_trend(UnitId(0)).len(), 1);
        assert_eq!(stats.windows_closed(), 2);
    }

    // -----------------------------------------------------------------------
    // Test 6: irrelevant records are ignored
    // -----------------------------------------------------------------------
    #[test]
    fn irrelevant_records_ignored() {
        let mut stats = FlowStats::new(StatsConfig::default());
        let mut sm = slotmap::SlotMap::<chainsim_core::id::ProcessId, ()>::with_key();
        stats.observe(&TraceEvent::ProcessFinished {
            process: sm.insert(()),
            tick: 5,
        });
        assert_eq!(stats.total_produced(), 0);
        assert_eq!(stats.total_shipped(), 0);
    }
}
