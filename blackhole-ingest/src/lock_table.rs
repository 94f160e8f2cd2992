//! Per-take lock table with lease expiry
//!
//! The only process-wide mutable state in the engine. A lease grants one
//! session exclusive ownership of a take id until it is released or its TTL
//! elapses. Expired leases are not swept; the next `acquire` for the same id
//! simply replaces them, so a crashed holder never blocks a take forever.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::error::{IngestError, IngestResult};

/// Time-bounded ownership of one take id
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub take_id: String,
    pub token: Uuid,
    pub ttl: Duration,
    pub expires_at: Instant,
}

impl Lease {
    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

#[derive(Debug)]
struct LeaseEntry {
    token: Uuid,
    expires_at: Instant,
}

/// Lease table keyed by take id
#[derive(Debug, Default)]
pub struct LockTable {
    leases: Mutex<HashMap<String, LeaseEntry>>,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, LeaseEntry>> {
        // No code path panics while holding the guard; recover the map if one ever does
        self.leases.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Acquire the take id, or `LockConflict` if an unexpired lease exists
    pub fn acquire(&self, take_id: &str, ttl: Duration) -> IngestResult<Lease> {
        let now = Instant::now();
        let mut leases = self.entries();

        if let Some(existing) = leases.get(take_id) {
            if existing.expires_at > now {
                tracing::debug!(take_id, "Lease conflict");
                return Err(IngestError::LockConflict(take_id.to_string()));
            }
            tracing::warn!(take_id, "Replacing expired lease");
        }

        let lease = Lease {
            take_id: take_id.to_string(),
            token: Uuid::new_v4(),
            ttl,
            expires_at: now + ttl,
        };
        leases.insert(
            take_id.to_string(),
            LeaseEntry {
                token: lease.token,
                expires_at: lease.expires_at,
            },
        );

        tracing::debug!(take_id, token = %lease.token, ttl_ms = ttl.as_millis() as u64, "Lease acquired");
        Ok(lease)
    }

    /// Extend a lease by its TTL
    ///
    /// Succeeds while the table still records this lease's token, even if it
    /// has expired in the meantime. Fails once another holder took over.
    pub fn renew(&self, lease: &Lease) -> IngestResult<Lease> {
        let mut leases = self.entries();
        match leases.get_mut(&lease.take_id) {
            Some(entry) if entry.token == lease.token => {
                entry.expires_at = Instant::now() + lease.ttl;
                Ok(Lease {
                    expires_at: entry.expires_at,
                    ..lease.clone()
                })
            }
            _ => Err(IngestError::LockConflict(lease.take_id.clone())),
        }
    }

    /// Release a lease; returns false if it was no longer ours
    pub fn release(&self, lease: &Lease) -> bool {
        let mut leases = self.entries();
        match leases.get(&lease.take_id) {
            Some(entry) if entry.token == lease.token => {
                leases.remove(&lease.take_id);
                tracing::debug!(take_id = %lease.take_id, "Lease released");
                true
            }
            _ => false,
        }
    }

    /// True if an unexpired lease exists for the take id
    pub fn is_held(&self, take_id: &str) -> bool {
        let now = Instant::now();
        self.entries()
            .get(take_id)
            .map(|entry| entry.expires_at > now)
            .unwrap_or(false)
    }

    /// Take ids with unexpired leases
    pub fn held_ids(&self) -> Vec<String> {
        let now = Instant::now();
        let mut ids: Vec<String> = self
            .entries()
            .iter()
            .filter(|(_, entry)| entry.expires_at > now)
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    const TTL: Duration = Duration::from_secs(30);

    #[test]
    fn test_acquire_then_conflict() {
        let table = LockTable::new();
        let lease = table.acquire("take07", TTL).unwrap();
        assert_eq!(lease.take_id, "take07");

        let second = table.acquire("take07", TTL);
        assert!(matches!(second, Err(IngestError::LockConflict(id)) if id == "take07"));
    }

    #[test]
    fn test_different_ids_do_not_conflict() {
        let table = LockTable::new();
        table.acquire("a", TTL).unwrap();
        table.acquire("b", TTL).unwrap();
        assert_eq!(table.held_ids(), vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_release_allows_reacquire() {
        let table = LockTable::new();
        let lease = table.acquire("take07", TTL).unwrap();
        assert!(table.release(&lease));
        assert!(!table.is_held("take07"));
        assert!(table.acquire("take07", TTL).is_ok());
    }

    #[test]
    fn test_expired_lease_is_replaced() {
        let table = LockTable::new();
        let stale = table.acquire("take07", Duration::from_millis(10)).unwrap();
        thread::sleep(Duration::from_millis(30));

        assert!(stale.is_expired());
        assert!(!table.is_held("take07"));
        let fresh = table.acquire("take07", TTL).unwrap();
        assert_ne!(fresh.token, stale.token);

        // The crashed holder can neither renew nor release the new lease
        assert!(table.renew(&stale).is_err());
        assert!(!table.release(&stale));
        assert!(table.is_held("take07"));
    }

    #[test]
    fn test_renew_extends_expiry() {
        let table = LockTable::new();
        let lease = table.acquire("take07", Duration::from_millis(40)).unwrap();
        thread::sleep(Duration::from_millis(20));
        let renewed = table.renew(&lease).unwrap();
        assert!(renewed.expires_at > lease.expires_at);
        assert_eq!(renewed.token, lease.token);
    }

    #[test]
    fn test_renew_after_expiry_without_takeover_succeeds() {
        let table = LockTable::new();
        let lease = table.acquire("take07", Duration::from_millis(10)).unwrap();
        thread::sleep(Duration::from_millis(30));
        let renewed = table.renew(&lease).unwrap();
        assert!(!renewed.is_expired());
        assert!(table.is_held("take07"));
    }

    #[test]
    fn test_concurrent_acquire_single_winner() {
        let table = Arc::new(LockTable::new());
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let table = Arc::clone(&table);
                thread::spawn(move || table.acquire("take07", TTL).is_ok())
            })
            .collect();

        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
    }
}
