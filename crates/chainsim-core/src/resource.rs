use crate::id::KindId;
use serde::{Deserialize, Serialize};

/// A single resource instance.
///
/// Identity is the arena key it lives under, never the value: two widgets of
/// the same kind are distinct instances. Immutable after creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    pub kind: KindId,
}

impl Resource {
    pub fn new(kind: KindId) -> Self {
        Self { kind }
    }
}

/// Selects resources inside a location. A tagged variant rather than a
/// closure so claims stay plain data; selection itself lives in
/// [`Location::find_free`](crate::location::Location::find_free), where the
/// per-kind index serves `Kind` requests without touching the arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Predicate {
    /// Matches every resource.
    Any,
    /// Matches resources of exactly this kind.
    Kind(KindId),
}
