use serde::{Deserialize, Serialize};
use slotmap::new_key_type;

new_key_type! {
    /// Identifies a location (a named container of resources).
    pub struct LocationId;

    /// Identifies a single resource instance. Identity is by instance,
    /// never by value.
    pub struct ResourceId;

    /// Identifies a cooperative process registered with the kernel.
    pub struct ProcessId;

    /// Identifies a claim held by the claim engine.
    pub struct ClaimId;
}

/// Identifies a component kind in the model. Cheap to copy and compare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct KindId(pub u32);

/// Identifies a manufacturing unit in the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UnitId(pub u32);

/// Identifies a shipping route in the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RouteId(pub u32);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_id_equality() {
        assert_eq!(KindId(0), KindId(0));
        assert_ne!(KindId(0), KindId(1));
    }

    #[test]
    fn ids_are_hashable() {
        use std::collections::HashMap;
        let mut map = HashMap::new();
        map.insert(KindId(0), "widget");
        map.insert(KindId(1), "frame");
        assert_eq!(map[&KindId(0)], "widget");
    }

    #[test]
    fn unit_id_ordering() {
        assert!(UnitId(0) < UnitId(1));
    }
}
