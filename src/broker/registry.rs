//! # Client Registry
//!
//! Ordered collection of registered tanks, read as a ring: the neighbor of
//! index `i` wraps around modulo the length. The registry is a plain data
//! structure with no internal synchronization; the broker keeps it behind its
//! `RwLock` and every multi-step sequence must run under one guard.

use std::net::SocketAddr;
use std::time::Duration;
use tokio::time::Instant;

/// One registered tank.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerRecord {
    pub id: String,
    pub address: SocketAddr,
    pub last_seen: Instant,
}

/// A record that left the ring, with the neighbors that must now be linked
/// to each other. Both are `None` when the ring became empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Departure {
    pub record: PeerRecord,
    pub left: Option<SocketAddr>,
    pub right: Option<SocketAddr>,
}

#[derive(Debug, Default, Clone)]
pub struct ClientRegistry {
    clients: Vec<PeerRecord>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a tank at the ring tail and return its index.
    pub fn add(&mut self, id: String, address: SocketAddr) -> usize {
        self.clients.push(PeerRecord {
            id,
            address,
            last_seen: Instant::now(),
        });
        self.clients.len() - 1
    }

    /// Remove the record at `index`.
    ///
    /// # Panics
    /// If `index` is out of range. Indices come from a lookup made under the
    /// same lock guard, so a bad index is a locking bug in the caller.
    pub fn remove(&mut self, index: usize) -> Departure {
        assert!(
            index < self.clients.len(),
            "registry index {} out of range (size {})",
            index,
            self.clients.len()
        );

        let record = self.clients.remove(index);
        if self.clients.is_empty() {
            return Departure {
                record,
                left: None,
                right: None,
            };
        }

        // The records that sat at index - 1 and index + 1 are now adjacent.
        let len = self.clients.len();
        let left = self.clients[(index + len - 1) % len].address;
        let right = self.clients[index % len].address;
        Departure {
            record,
            left: Some(left),
            right: Some(right),
        }
    }

    pub fn index_of_id(&self, id: &str) -> Option<usize> {
        self.clients.iter().position(|c| c.id == id)
    }

    pub fn index_of_address(&self, address: SocketAddr) -> Option<usize> {
        self.clients.iter().position(|c| c.address == address)
    }

    /// Address of the left neighbor of `index` (wraps around).
    pub fn left_neighbor_of(&self, index: usize) -> SocketAddr {
        let len = self.clients.len();
        self.clients[(index + len - 1) % len].address
    }

    /// Address of the right neighbor of `index` (wraps around).
    pub fn right_neighbor_of(&self, index: usize) -> SocketAddr {
        self.clients[(index + 1) % self.clients.len()].address
    }

    pub fn get(&self, index: usize) -> Option<&PeerRecord> {
        self.clients.get(index)
    }

    pub fn size(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Refresh the last-seen time of `index`.
    pub fn touch(&mut self, index: usize) {
        self.clients[index].last_seen = Instant::now();
    }

    pub fn iter(&self) -> impl Iterator<Item = &PeerRecord> {
        self.clients.iter()
    }

    /// Evict at most one record not seen for longer than `threshold`.
    pub fn evict_stale_since(&mut self, threshold: Duration) -> Option<Departure> {
        self.evict_stale_at(Instant::now(), threshold)
    }

    /// [`evict_stale_since`](Self::evict_stale_since) against an explicit clock.
    ///
    /// Scans from the tail so indices of unvisited records stay valid.
    pub fn evict_stale_at(&mut self, now: Instant, threshold: Duration) -> Option<Departure> {
        let stale = (0..self.clients.len())
            .rev()
            .find(|&i| now.saturating_duration_since(self.clients[i].last_seen) > threshold)?;
        Some(self.remove(stale))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn ring_of(n: u16) -> ClientRegistry {
        let mut registry = ClientRegistry::new();
        for i in 0..n {
            registry.add(format!("tank{}", i), addr(5000 + i));
        }
        registry
    }

    #[test]
    fn single_record_is_its_own_neighbor() {
        let registry = ring_of(1);
        assert_eq!(registry.left_neighbor_of(0), addr(5000));
        assert_eq!(registry.right_neighbor_of(0), addr(5000));
    }

    #[test]
    fn neighbors_wrap_around() {
        let registry = ring_of(3);
        assert_eq!(registry.left_neighbor_of(0), addr(5002));
        assert_eq!(registry.right_neighbor_of(2), addr(5000));
        assert_eq!(registry.right_neighbor_of(0), addr(5001));
    }

    #[test]
    fn remove_reports_the_bypass() {
        let mut registry = ring_of(4);
        let departure = registry.remove(0);
        assert_eq!(departure.record.id, "tank0");
        assert_eq!(departure.left, Some(addr(5003)));
        assert_eq!(departure.right, Some(addr(5001)));

        let departure = registry.remove(2);
        assert_eq!(departure.record.id, "tank3");
        assert_eq!(departure.left, Some(addr(5002)));
        assert_eq!(departure.right, Some(addr(5001)));
    }

    #[test]
    fn removing_the_last_record_leaves_no_neighbors() {
        let mut registry = ring_of(1);
        let departure = registry.remove(0);
        assert_eq!(departure.left, None);
        assert_eq!(departure.right, None);
        assert!(registry.is_empty());
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn remove_out_of_range_panics() {
        let mut registry = ring_of(2);
        registry.remove(2);
    }

    #[test]
    fn lookups_by_id_and_address() {
        let registry = ring_of(3);
        assert_eq!(registry.index_of_id("tank1"), Some(1));
        assert_eq!(registry.index_of_address(addr(5002)), Some(2));
        assert_eq!(registry.index_of_id("tank9"), None);
        assert_eq!(registry.index_of_address(addr(9999)), None);
    }

    #[test]
    fn eviction_removes_one_stale_record_per_call() {
        let mut registry = ring_of(3);
        let threshold = Duration::from_secs(20);
        let later = Instant::now() + Duration::from_secs(30);

        registry.clients[1].last_seen = later;

        let first = registry.evict_stale_at(later, threshold).unwrap();
        assert_eq!(first.record.id, "tank2");
        assert_eq!(registry.size(), 2);

        let second = registry.evict_stale_at(later, threshold).unwrap();
        assert_eq!(second.record.id, "tank0");
        assert_eq!(second.left, Some(addr(5001)));
        assert_eq!(second.right, Some(addr(5001)));

        assert!(registry.evict_stale_at(later, threshold).is_none());
        assert_eq!(registry.get(0).map(|r| r.id.as_str()), Some("tank1"));
    }
}
