//! Named metric counters updated by processes during a run.
//!
//! Counters are integers, created on first touch and only ever added to.
//! Callers read them after the run; the well-known keys written by the
//! built-in processes live in [`keys`].

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Keys written by the built-in production and shipping processes.
pub mod keys {
    pub const NUMBER_OF_SHIPPING_DELAYS: &str = "number_of_shipping_delays";
    pub const NUMBER_OF_DEFECTIVE_COMPONENTS: &str = "number_of_defective_components";
    /// Accumulated extra transit time, in ticks.
    pub const LENGTH_OF_DELAYS: &str = "length_of_delays";
    /// Accumulated transit time including extra delays, in ticks.
    pub const TOTAL_SHIPPING_TIME_WITH_DELAYS: &str = "total_shipping_time_with_delays";
    pub const NUMBER_OF_SHIPPINGS_DONE: &str = "number_of_shippings_done";
    pub const TOTAL_FINAL_OUTPUT: &str = "total_final_output";
    pub const NUMBER_OF_COMPONENTS_SHIPPED: &str = "number_of_components_shipped";
}

/// Mapping of counter name to value. Iteration order is the key order, so
/// two identical runs serialize identically.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataBag {
    counters: BTreeMap<String, u64>,
}

impl DataBag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `delta` to the counter named `key`, creating it at zero first.
    pub fn add(&mut self, key: &str, delta: u64) {
        *self.counters.entry(key.to_string()).or_insert(0) += delta;
    }

    /// Read a counter. Untouched counters read as zero.
    pub fn get(&self, key: &str) -> u64 {
        self.counters.get(key).copied().unwrap_or(0)
    }

    /// Iterate counters in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, u64)> {
        self.counters.iter().map(|(k, v)| (k.as_str(), *v))
    }

    pub fn len(&self) -> usize {
        self.counters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }
}
