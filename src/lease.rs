//! Lease bookkeeping.
//!
//! The [`LeaseTable`] is the only shared mutable state in the server. Every
//! lookup and mutation happens through a [`LeaseTableGuard`] so that a whole
//! allocate-or-lookup sequence runs under one lock acquisition.
//!
//! Leases are never evicted by a timer. Expiration is checked lazily when a
//! lease is looked up for reuse, and an expired lease keeps its address slot
//! until another client is rebound onto it.

use std::net::Ipv4Addr;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::client_id::ClientIdentifier;

/// Source of the current time in whole seconds.
pub trait Clock: Send + Sync {
    fn now(&self) -> u64;
}

/// Wall clock: seconds since the Unix epoch, UTC.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> u64 {
        u64::try_from(Utc::now().timestamp()).unwrap_or(0)
    }
}

impl<F> Clock for F
where
    F: Fn() -> u64 + Send + Sync,
{
    fn now(&self) -> u64 {
        self()
    }
}

/// One allocation record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub id: ClientIdentifier,
    pub address: Ipv4Addr,
    /// Expiration time in [`Clock`] seconds.
    pub expiration: u64,
}

impl Lease {
    pub fn new(id: ClientIdentifier, address: Ipv4Addr, expiration: u64) -> Self {
        Self {
            id,
            address,
            expiration,
        }
    }

    /// Returns true if the lease expired strictly before `now`.
    pub fn is_expired(&self, now: u64) -> bool {
        self.expiration < now
    }
}

/// Thread-safe set of leases, keyed logically by both identifier and address.
#[derive(Debug, Default)]
pub struct LeaseTable {
    leases: Mutex<Vec<Lease>>,
}

impl LeaseTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquires the table lock.
    ///
    /// A poisoned lock is recovered: each mutation is a single field
    /// assignment or push, so the data is consistent even after a panic.
    pub fn lock(&self) -> LeaseTableGuard<'_> {
        LeaseTableGuard {
            leases: self.leases.lock().unwrap_or_else(PoisonError::into_inner),
        }
    }

    /// Copies every lease out of the table, for saving.
    pub fn snapshot(&self) -> Vec<Lease> {
        self.lock().leases.clone()
    }

    /// Replaces the table contents with previously saved leases.
    ///
    /// When two leases claim the same address only the first is kept.
    /// Returns the number of leases loaded.
    pub fn restore(&self, leases: Vec<Lease>) -> usize {
        let mut guard = self.lock();
        guard.leases.clear();
        for lease in leases {
            if guard.leases.iter().any(|held| held.address == lease.address) {
                continue;
            }
            guard.leases.push(lease);
        }
        guard.leases.len()
    }

    pub fn len(&self) -> usize {
        self.lock().leases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Exclusive access to the lease set for the duration of one request.
pub struct LeaseTableGuard<'a> {
    leases: MutexGuard<'a, Vec<Lease>>,
}

impl LeaseTableGuard<'_> {
    /// Finds the lease held by `id`.
    ///
    /// If an identifier was rebound onto several addresses over time, the
    /// one with the latest expiration is returned.
    pub fn find_by_id(&mut self, id: &ClientIdentifier) -> Option<&mut Lease> {
        self.leases
            .iter_mut()
            .filter(|lease| &lease.id == id)
            .max_by_key(|lease| lease.expiration)
    }

    pub fn find_by_address(&mut self, address: Ipv4Addr) -> Option<&mut Lease> {
        self.leases.iter_mut().find(|lease| lease.address == address)
    }

    /// Appends a new lease. The caller guarantees no lease holds `address`.
    pub fn create(&mut self, id: ClientIdentifier, address: Ipv4Addr, expiration: u64) -> &mut Lease {
        debug_assert!(self.leases.iter().all(|lease| lease.address != address));
        let index = self.leases.len();
        self.leases.push(Lease::new(id, address, expiration));
        &mut self.leases[index]
    }

    /// Returns true if no unexpired lease holds `address`.
    pub fn is_free(&self, address: Ipv4Addr, now: u64) -> bool {
        !self
            .leases
            .iter()
            .any(|lease| lease.address == address && !lease.is_expired(now))
    }

    pub fn len(&self) -> usize {
        self.leases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.leases.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn make_client_id(mac: &[u8; 6]) -> ClientIdentifier {
        let mut id = vec![1u8];
        id.extend_from_slice(mac);
        ClientIdentifier::new(&id)
    }

    #[test]
    fn test_lease_expiry_is_strict() {
        let lease = Lease::new(make_client_id(&[1, 2, 3, 4, 5, 6]), Ipv4Addr::new(10, 0, 0, 5), 100);
        assert!(!lease.is_expired(99));
        assert!(!lease.is_expired(100));
        assert!(lease.is_expired(101));
    }

    #[test]
    fn test_system_clock_is_recent() {
        // 2020-01-01T00:00:00Z
        assert!(SystemClock.now() > 1_577_836_800);
    }

    #[test]
    fn test_closure_clock() {
        let clock = || 42u64;
        assert_eq!(clock.now(), 42);
    }

    #[test]
    fn test_create_and_find() {
        let table = LeaseTable::new();
        let id = make_client_id(&[0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]);
        let ip = Ipv4Addr::new(192, 168, 1, 100);

        let mut guard = table.lock();
        assert!(guard.find_by_id(&id).is_none());
        guard.create(id.clone(), ip, 500);

        assert_eq!(guard.find_by_id(&id).map(|lease| lease.address), Some(ip));
        assert_eq!(guard.find_by_address(ip).map(|lease| lease.id.clone()), Some(id));
        assert!(guard.find_by_address(Ipv4Addr::new(192, 168, 1, 101)).is_none());
        drop(guard);

        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_mutation_through_guard() {
        let table = LeaseTable::new();
        let first = make_client_id(&[1, 1, 1, 1, 1, 1]);
        let second = make_client_id(&[2, 2, 2, 2, 2, 2]);
        let ip = Ipv4Addr::new(192, 168, 1, 100);

        {
            let mut guard = table.lock();
            guard.create(first.clone(), ip, 10);
        }
        {
            let mut guard = table.lock();
            let lease = guard.find_by_address(ip).unwrap();
            lease.id = second.clone();
            lease.expiration = 20;
        }

        let mut guard = table.lock();
        assert!(guard.find_by_id(&first).is_none());
        assert_eq!(guard.find_by_id(&second).unwrap().expiration, 20);
        assert_eq!(guard.len(), 1);
    }

    #[test]
    fn test_find_by_id_prefers_latest_expiration() {
        let table = LeaseTable::new();
        let id = make_client_id(&[3, 3, 3, 3, 3, 3]);

        let mut guard = table.lock();
        guard.create(id.clone(), Ipv4Addr::new(10, 0, 0, 1), 50);
        guard.create(id.clone(), Ipv4Addr::new(10, 0, 0, 2), 90);
        guard.create(id.clone(), Ipv4Addr::new(10, 0, 0, 3), 70);

        assert_eq!(
            guard.find_by_id(&id).map(|lease| lease.address),
            Some(Ipv4Addr::new(10, 0, 0, 2))
        );
    }

    #[test]
    fn test_is_free() {
        let table = LeaseTable::new();
        let ip = Ipv4Addr::new(192, 168, 1, 100);

        let mut guard = table.lock();
        assert!(guard.is_free(ip, 0));
        guard.create(make_client_id(&[4, 4, 4, 4, 4, 4]), ip, 100);
        assert!(!guard.is_free(ip, 100));
        assert!(guard.is_free(ip, 101));
    }

    #[test]
    fn test_snapshot_and_restore() {
        let table = LeaseTable::new();
        {
            let mut guard = table.lock();
            guard.create(make_client_id(&[5, 5, 5, 5, 5, 5]), Ipv4Addr::new(10, 0, 0, 1), 10);
            guard.create(make_client_id(&[6, 6, 6, 6, 6, 6]), Ipv4Addr::new(10, 0, 0, 2), 20);
        }

        let saved = table.snapshot();
        assert_eq!(saved.len(), 2);

        let json = serde_json::to_string(&saved).unwrap();
        let loaded: Vec<Lease> = serde_json::from_str(&json).unwrap();
        assert_eq!(loaded, saved);

        let other = LeaseTable::new();
        assert_eq!(other.restore(loaded), 2);
        assert_eq!(other.snapshot(), saved);
    }

    #[test]
    fn test_restore_drops_duplicate_addresses() {
        let ip = Ipv4Addr::new(10, 0, 0, 1);
        let table = LeaseTable::new();
        let loaded = table.restore(vec![
            Lease::new(make_client_id(&[7, 7, 7, 7, 7, 7]), ip, 10),
            Lease::new(make_client_id(&[8, 8, 8, 8, 8, 8]), ip, 20),
        ]);
        assert_eq!(loaded, 1);
        assert_eq!(table.snapshot()[0].expiration, 10);
    }

    #[test]
    fn test_lock_recovers_from_poison() {
        let table = Arc::new(LeaseTable::new());
        let poisoner = Arc::clone(&table);
        let result = std::thread::spawn(move || {
            let mut guard = poisoner.lock();
            guard.create(make_client_id(&[9, 9, 9, 9, 9, 9]), Ipv4Addr::new(10, 0, 0, 9), 1);
            panic!("poison the table lock");
        })
        .join();
        assert!(result.is_err());

        assert_eq!(table.len(), 1);
        assert!(!table.is_empty());
    }

    #[test]
    fn test_concurrent_creates() {
        let table = Arc::new(LeaseTable::new());
        let handles: Vec<_> = (0..8u8)
            .map(|i| {
                let table = Arc::clone(&table);
                std::thread::spawn(move || {
                    let mut guard = table.lock();
                    guard.create(
                        make_client_id(&[i, 0, 0, 0, 0, 0]),
                        Ipv4Addr::new(10, 0, 0, 10 + i),
                        100,
                    );
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(table.len(), 8);
    }
}
