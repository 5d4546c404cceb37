//! §4.10: linear smallest-free address allocation over an overlay
//! prefix. Kept as a pure function over the caller-supplied assigned
//! set rather than owning any state itself, so the transactional
//! guarantee ("allocate inside the same transaction that creates the
//! peer record") is entirely the `PeerStore` implementation's to keep
//! — this function can't accidentally race with itself.

use std::collections::BTreeSet;
use std::net::Ipv4Addr;

use overlay_model::OverlayPrefix;

/// The smallest host address in `prefix` not in `assigned` and not
/// the network or broadcast address, or `None` if the prefix is full.
pub fn allocate(prefix: &OverlayPrefix, assigned: &BTreeSet<Ipv4Addr>) -> Option<Ipv4Addr> {
    prefix.host_addresses().find(|addr| !assigned.contains(addr))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slash_24() -> OverlayPrefix {
        OverlayPrefix::new(Ipv4Addr::new(100, 70, 0, 0), 24).unwrap()
    }

    #[test]
    fn first_allocation_in_empty_prefix_is_dot_one() {
        let assigned = BTreeSet::new();
        assert_eq!(allocate(&slash_24(), &assigned), Some(Ipv4Addr::new(100, 70, 0, 1)));
    }

    #[test]
    fn skips_assigned_addresses() {
        let mut assigned = BTreeSet::new();
        assigned.insert(Ipv4Addr::new(100, 70, 0, 1));
        assigned.insert(Ipv4Addr::new(100, 70, 0, 2));
        assert_eq!(allocate(&slash_24(), &assigned), Some(Ipv4Addr::new(100, 70, 0, 3)));
    }

    #[test]
    fn after_253_allocations_next_is_dot_254() {
        let assigned: BTreeSet<Ipv4Addr> = (1..=253).map(|n| Ipv4Addr::new(100, 70, 0, n)).collect();
        assert_eq!(allocate(&slash_24(), &assigned), Some(Ipv4Addr::new(100, 70, 0, 254)));
    }

    #[test]
    fn full_prefix_returns_none() {
        let assigned: BTreeSet<Ipv4Addr> = (1..=254).map(|n| Ipv4Addr::new(100, 70, 0, n)).collect();
        assert_eq!(allocate(&slash_24(), &assigned), None);
    }

    #[test]
    fn allocation_is_deterministic_for_a_given_assigned_set() {
        let mut assigned = BTreeSet::new();
        assigned.insert(Ipv4Addr::new(10, 0, 0, 5));
        let prefix = OverlayPrefix::new(Ipv4Addr::new(10, 0, 0, 0), 24).unwrap();
        let first = allocate(&prefix, &assigned);
        let second = allocate(&prefix, &assigned);
        assert_eq!(first, second);
    }
}
