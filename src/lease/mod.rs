//! Unique-id leasing.
//!
//! The master is the single authority handing out uids. A lease starts out
//! [`LeaseState::Pending`] and becomes [`LeaseState::Confirmed`] once its
//! requester acknowledges it. Pending leases which are not confirmed within
//! the configured timeout are reclaimed by [`LeaseTable::sweep`]; confirmed
//! leases live until they are released explicitly.

mod pending;
pub mod uid;

use std::collections::HashMap;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use log::{debug, info};
use sha2::{Digest, Sha256};

use crate::address::{Address, Uid, UID_LEN};
use crate::error::{Error, Result};

pub use pending::{LeaseClient, LeaseWaiter, PendingQueue, Resolution};

/// Floor for every periodic timer of a node loop.
pub const MIN_PERIOD: Duration = Duration::from_millis(10);

/// Reads the runtime clock, which a paused test runtime controls.
pub fn now() -> Instant {
    tokio::time::Instant::now().into_std()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseState {
    Pending,
    Confirmed,
}

#[derive(Debug, Clone)]
pub struct Lease {
    pub uid: Uid,
    pub state: LeaseState,
    pub issued_at: Instant,
    /// Node which requested the lease in-band. Bootstrap leases handed out
    /// on the uid port have no owner.
    pub owner: Option<Address>,
}

/// Lease table owned by the master.
pub struct LeaseTable {
    leases: HashMap<Uid, Lease>,
    timeout: Duration,
    secret: String,
    seed: u128,
    counter: u64,
}

impl LeaseTable {
    pub fn new(timeout: Duration, secret: impl Into<String>) -> Self {
        let seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();
        Self {
            leases: HashMap::new(),
            timeout,
            secret: secret.into(),
            seed,
            counter: 0,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Interval at which [`sweep`](Self::sweep) is expected to run.
    pub fn sweep_period(&self) -> Duration {
        (self.timeout / 2).max(MIN_PERIOD)
    }

    /// Allocates a uid distinct from every outstanding lease and records it
    /// as pending.
    pub fn issue(&mut self, owner: Option<Address>, now: Instant) -> Uid {
        let uid = loop {
            let candidate = self.next_candidate();
            if !candidate.is_reserved() && !self.leases.contains_key(&candidate) {
                break candidate;
            }
        };
        debug!("Issued lease {} (owner: {:?})", uid, owner);
        self.leases.insert(
            uid.clone(),
            Lease {
                uid: uid.clone(),
                state: LeaseState::Pending,
                issued_at: now,
                owner,
            },
        );
        uid
    }

    fn next_candidate(&mut self) -> Uid {
        self.counter = self.counter.wrapping_add(1);
        let mut hasher = Sha256::new();
        hasher.update(self.secret.as_bytes());
        hasher.update(self.seed.to_be_bytes());
        hasher.update(self.counter.to_be_bytes());
        let digest = hasher.finalize();
        let mut bytes = [0u8; UID_LEN / 2];
        bytes.copy_from_slice(&digest[..UID_LEN / 2]);
        Uid::from_digest(bytes)
    }

    /// Marks a lease as in use. When the lease has an owner only that owner
    /// may confirm it.
    pub fn confirm(&mut self, uid: &Uid, by: Option<&Address>) -> Result<()> {
        let lease = self
            .leases
            .get_mut(uid)
            .ok_or_else(|| Error::invalid(format!("no lease for {}", uid)))?;
        if lease.owner.is_some() && lease.owner.as_ref() != by {
            return Err(Error::invalid(format!("lease {} is not owned by requester", uid)));
        }
        lease.state = LeaseState::Confirmed;
        Ok(())
    }

    pub fn release(&mut self, uid: &Uid) -> Option<Lease> {
        self.leases.remove(uid)
    }

    /// Releases every lease requested by `owner`.
    pub fn release_owned_by(&mut self, owner: &Address) -> Vec<Uid> {
        let owned: Vec<Uid> = self
            .leases
            .values()
            .filter(|l| l.owner.as_ref() == Some(owner))
            .map(|l| l.uid.clone())
            .collect();
        for uid in &owned {
            self.leases.remove(uid);
        }
        owned
    }

    /// Reclaims every pending lease older than the timeout.
    pub fn sweep(&mut self, now: Instant) -> Vec<Uid> {
        let timeout = self.timeout;
        let stale: Vec<Uid> = self
            .leases
            .values()
            .filter(|l| {
                l.state == LeaseState::Pending
                    && now.saturating_duration_since(l.issued_at) > timeout
            })
            .map(|l| l.uid.clone())
            .collect();
        for uid in &stale {
            self.leases.remove(uid);
            info!("Reclaimed stale lease {}", uid);
        }
        stale
    }

    pub fn is_confirmed(&self, uid: &Uid) -> bool {
        self.leases
            .get(uid)
            .is_some_and(|l| l.state == LeaseState::Confirmed)
    }

    pub fn get(&self, uid: &Uid) -> Option<&Lease> {
        self.leases.get(uid)
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
    use crate::address::NodeKind;

    const TIMEOUT: Duration = Duration::from_secs(30);

    fn satellite(uid: &str) -> Address {
        Address::new(NodeKind::Satellite, uid.parse().unwrap())
    }

    #[test]
    fn issued_uids_are_distinct() {
        let mut table = LeaseTable::new(TIMEOUT, "secret");
        let now = Instant::now();
        let mut seen = std::collections::HashSet::new();
        for _ in 0..500 {
            let uid = table.issue(None, now);
            assert!(!uid.is_reserved());
            assert!(seen.insert(uid));
        }
        assert_eq!(table.len(), 500);
    }

    #[test]
    fn sweep_reclaims_only_stale_pending_leases() {
        let mut table = LeaseTable::new(TIMEOUT, "secret");
        let start = Instant::now();
        let stale = table.issue(None, start);
        let confirmed = table.issue(None, start);
        table.confirm(&confirmed, None).unwrap();
        let later = start + TIMEOUT + Duration::from_secs(1);
        let fresh = table.issue(None, later);

        assert!(table.get(&stale).is_some());
        let reclaimed = table.sweep(later);

        assert_eq!(reclaimed, vec![stale.clone()]);
        assert!(table.get(&stale).is_none());
        assert!(table.is_confirmed(&confirmed));
        assert!(table.get(&fresh).is_some());
    }

    #[test]
    fn pending_lease_survives_sweep_within_timeout() {
        let mut table = LeaseTable::new(TIMEOUT, "secret");
        let start = Instant::now();
        let uid = table.issue(None, start);
        assert!(table.sweep(start + TIMEOUT / 2).is_empty());
        assert_eq!(table.get(&uid).map(|l| l.state), Some(LeaseState::Pending));
    }

    #[test]
    fn confirm_checks_owner() {
        let mut table = LeaseTable::new(TIMEOUT, "secret");
        let owner = satellite("AAAAAA");
        let uid = table.issue(Some(owner.clone()), Instant::now());

        let err = table.confirm(&uid, Some(&satellite("BBBBBB"))).unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(_)));
        assert!(!table.is_confirmed(&uid));

        table.confirm(&uid, Some(&owner)).unwrap();
        assert!(table.is_confirmed(&uid));
    }

    #[test]
    fn confirm_unknown_lease_is_rejected() {
        let mut table = LeaseTable::new(TIMEOUT, "secret");
        let err = table.confirm(&"ABCDEF".parse().unwrap(), None).unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(_)));
    }

    #[test]
    fn release_owned_by_drops_only_that_owner() {
        let mut table = LeaseTable::new(TIMEOUT, "secret");
        let now = Instant::now();
        let a = satellite("AAAAAA");
        let mine = table.issue(Some(a.clone()), now);
        let other = table.issue(Some(satellite("BBBBBB")), now);

        assert_eq!(table.release_owned_by(&a), vec![mine.clone()]);
        assert!(table.get(&mine).is_none());
        assert!(table.get(&other).is_some());
    }
    #[test]
    fn zero_timeout_still_sweeps_on_a_positive_period() {
        let table = LeaseTable::new(Duration::ZERO, "secret");
        assert_eq!(table.sweep_period(), MIN_PERIOD);
        assert_eq!(LeaseTable::new(TIMEOUT, "secret").sweep_period(), TIMEOUT / 2);
    }
}
