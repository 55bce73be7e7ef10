//! Read-through cache over remote directory lookups.

use grainyard_core::{GrainAddress, GrainId};
use std::collections::HashMap;

/// One cached resolution.
#[derive(Debug, Clone)]
struct CacheSlot {
    address: GrainAddress,
    etag: u64,
    last_use: u64,
}

/// Bounded LRU cache mapping grain identity to its last-known activation
/// address and the etag the owner stamped on it.
///
/// The cache is an optimization, never a source of truth: a miss is not an
/// error, and a stale hit costs at most one extra hop before the entry is
/// evicted by a `CacheInvalidation` rejection.
///
/// Recency is a monotonic use counter; eviction removes the least recently
/// used slot. Eviction is a linear scan — the cache is bounded and
/// evictions are rare next to lookups, so the scan stays off the hot path.
#[derive(Debug)]
pub struct DirectoryCache {
    slots: HashMap<GrainId, CacheSlot>,
    capacity: usize,
    clock: u64,
}

impl DirectoryCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: HashMap::new(),
            capacity: capacity.max(1),
            clock: 0,
        }
    }

    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    /// Look up a cached address, bumping its recency.
    pub fn get(&mut self, grain: &GrainId) -> Option<(GrainAddress, u64)> {
        let tick = self.tick();
        let slot = self.slots.get_mut(grain)?;
        slot.last_use = tick;
        Some((slot.address.clone(), slot.etag))
    }

    /// Insert or replace a resolution, evicting the LRU slot when full.
    pub fn insert(&mut self, address: GrainAddress, etag: u64) {
        let tick = self.tick();
        if !self.slots.contains_key(&address.grain) && self.slots.len() >= self.capacity {
            if let Some(victim) = self
                .slots
                .iter()
                .min_by_key(|(_, slot)| slot.last_use)
                .map(|(grain, _)| grain.clone())
            {
                self.slots.remove(&victim);
            }
        }
        self.slots.insert(
            address.grain.clone(),
            CacheSlot {
                address,
                etag,
                last_use: tick,
            },
        );
    }

    /// Drop the entry for a grain, regardless of etag.
    pub fn invalidate(&mut self, grain: &GrainId) -> bool {
        self.slots.remove(grain).is_some()
    }

    /// Drop the entry only when its etag matches the rejected one.
    ///
    /// A reply tagged with an etag invalidates exactly the resolution it
    /// was made from; a newer cached resolution survives.
    pub fn invalidate_etag(&mut self, grain: &GrainId, etag: u64) -> bool {
        match self.slots.get(grain) {
            Some(slot) if slot.etag == etag => self.slots.remove(grain).is_some(),
            _ => false,
        }
    }

    /// Keep only entries satisfying the predicate.
    ///
    /// Membership changes call this to drop entries whose partition owner
    /// moved or whose hosting silo departed.
    pub fn retain(&mut self, mut keep: impl FnMut(&GrainId, &GrainAddress) -> bool) {
        self.slots.retain(|grain, slot| keep(grain, &slot.address));
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn clear(&mut self) {
        self.slots.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use grainyard_core::{ActivationId, SiloAddress};
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};

    fn address(port: u16, key: &str) -> GrainAddress {
        GrainAddress::new(
            SiloAddress::new(
                SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port),
                1,
            ),
            GrainId::from_parts("test", "Counter", key).unwrap(),
            ActivationId::random(),
        )
    }

    #[test]
    fn test_miss_then_hit() {
        let mut cache = DirectoryCache::new(8);
        let addr = address(5000, "alice");
        assert!(cache.get(&addr.grain).is_none());

        cache.insert(addr.clone(), 7);
        let (found, etag) = cache.get(&addr.grain).unwrap();
        assert_eq!(found, addr);
        assert_eq!(etag, 7);
    }

    #[test]
    fn test_lru_eviction() {
        let mut cache = DirectoryCache::new(2);
        let a = address(5000, "a");
        let b = address(5000, "b");
        let c = address(5000, "c");

        cache.insert(a.clone(), 1);
        cache.insert(b.clone(), 2);
        // Touch `a` so `b` becomes the LRU victim.
        cache.get(&a.grain);
        cache.insert(c.clone(), 3);

        assert_eq!(cache.len(), 2);
        assert!(cache.get(&a.grain).is_some());
        assert!(cache.get(&b.grain).is_none());
        assert!(cache.get(&c.grain).is_some());
    }

    #[test]
    fn test_invalidate_etag_only_matching() {
        let mut cache = DirectoryCache::new(8);
        let addr = address(5000, "alice");
        cache.insert(addr.clone(), 7);

        // Stale rejection for an older resolution does not clobber a newer
        // entry.
        assert!(!cache.invalidate_etag(&addr.grain, 6));
        assert!(cache.get(&addr.grain).is_some());

        assert!(cache.invalidate_etag(&addr.grain, 7));
        assert!(cache.get(&addr.grain).is_none());
    }

    #[test]
    fn test_retain_drops_departed_silo() {
        let mut cache = DirectoryCache::new(8);
        let on_5000 = address(5000, "alice");
        let on_5001 = address(5001, "bob");
        cache.insert(on_5000.clone(), 1);
        cache.insert(on_5001.clone(), 2);

        let departed = on_5000.silo.clone();
        cache.retain(|_, addr| addr.silo != departed);

        assert!(cache.get(&on_5000.grain).is_none());
        assert!(cache.get(&on_5001.grain).is_some());
    }

    #[test]
    fn test_replace_updates_etag() {
        let mut cache = DirectoryCache::new(8);
        let old = address(5000, "alice");
        let new = address(5001, "alice");

        cache.insert(old, 1);
        cache.insert(new.clone(), 2);

        let (found, etag) = cache.get(&new.grain).unwrap();
        assert_eq!(found, new);
        assert_eq!(etag, 2);
        assert_eq!(cache.len(), 1);
    }
}
