//! Allocation and collection types for kiln.
//!
//! This module provides:
//! - Re-exports of hash collections using AHash
//! - SlotMap storage keyed by generational handles
//! - Common allocation utilities

pub mod slot_map;

pub use slot_map::{SlotKey, SlotMap};

// Re-export optimized hash collections
pub use ahash::{AHashMap as HashMap, AHashSet as HashSet, RandomState};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hashmap_ahash() {
        let mut map = HashMap::new();
        map.insert("key", "value");
        assert_eq!(map.get("key"), Some(&"value"));
    }

    #[test]
    fn test_hashset_ahash() {
        let mut set = HashSet::new();
        set.insert(42);
        assert!(set.contains(&42));
    }
}
