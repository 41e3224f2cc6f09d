pub mod claim;
pub mod clock;
pub mod databag;
pub mod fixed;
pub mod id;
pub mod kernel;
pub mod location;
pub mod model;
pub mod process;
pub mod production;
pub mod queue;
pub mod resource;
pub mod rng;
pub mod shipping;
pub mod simulation;
pub mod trace;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
