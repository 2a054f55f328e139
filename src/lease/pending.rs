//! Requester side of the lease protocol.
//!
//! Replies to `ID_REQUEST` carry no correlation token. They are matched to
//! callers purely by order, so outstanding requests are kept in a FIFO and
//! every reply resolves the oldest one.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use log::warn;
use tokio::sync::oneshot;

use crate::address::Uid;
use crate::error::{Error, Result};

/// FIFO of outstanding requests, remembering when each was issued.
#[derive(Debug)]
pub struct PendingQueue<T> {
    entries: VecDeque<(Instant, T)>,
}

impl<T> Default for PendingQueue<T> {
    fn default() -> Self {
        Self {
            entries: VecDeque::new(),
        }
    }
}

impl<T> PendingQueue<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, item: T, now: Instant) {
        self.entries.push_back((now, item));
    }

    pub fn pop_oldest(&mut self) -> Option<T> {
        self.entries.pop_front().map(|(_, item)| item)
    }

    /// Removes every entry older than `timeout`, oldest first.
    pub fn expire(&mut self, now: Instant, timeout: Duration) -> Vec<T> {
        let mut expired = Vec::new();
        while let Some((issued_at, _)) = self.entries.front() {
            if now.saturating_duration_since(*issued_at) <= timeout {
                break;
            }
            if let Some((_, item)) = self.entries.pop_front() {
                expired.push(item);
            }
        }
        expired
    }

    pub fn drain(&mut self) -> Vec<T> {
        self.entries.drain(..).map(|(_, item)| item).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

pub type LeaseWaiter = oneshot::Sender<Result<Uid>>;

/// Outcome of matching an `ID_RESPONSE` against the queue.
#[derive(Debug, PartialEq, Eq)]
pub enum Resolution {
    Delivered,
    /// Nobody is interested in the uid anymore: its waiter timed out or went
    /// away. The lease should be handed back to the master.
    Unclaimed(Uid),
}

/// Waiters for uids requested from the master.
pub struct LeaseClient {
    pending: PendingQueue<LeaseWaiter>,
    timeout: Duration,
    /// Requests whose waiter expired before the reply arrived. Their
    /// replies are still in flight and come before any newer ones.
    orphaned: usize,
}

impl LeaseClient {
    pub fn new(timeout: Duration) -> Self {
        Self {
            pending: PendingQueue::new(),
            timeout,
            orphaned: 0,
        }
    }

    pub fn enqueue(&mut self, waiter: LeaseWaiter, now: Instant) {
        self.pending.push(waiter, now);
    }

    /// Hands `uid` to the oldest outstanding request.
    pub fn resolve(&mut self, uid: Uid) -> Result<Resolution> {
        if self.orphaned > 0 {
            self.orphaned -= 1;
            return Ok(Resolution::Unclaimed(uid));
        }
        let waiter = self
            .pending
            .pop_oldest()
            .ok_or_else(|| Error::internal(format!("uid {} received without a pending request", uid)))?;
        match waiter.send(Ok(uid)) {
            Ok(()) => Ok(Resolution::Delivered),
            Err(returned) => match returned {
                Ok(uid) => Ok(Resolution::Unclaimed(uid)),
                Err(_) => Err(Error::internal("lease waiter returned an error value")),
            },
        }
    }

    /// Fails every waiter older than the lease timeout with
    /// [`Error::LeaseTimeout`].
    pub fn expire(&mut self, now: Instant) -> usize {
        let expired = self.pending.expire(now, self.timeout);
        let count = expired.len();
        for waiter in expired {
            let _ = waiter.send(Err(Error::LeaseTimeout(self.timeout)));
        }
        if count > 0 {
            warn!("{} uid request(s) timed out", count);
        }
        self.orphaned += count;
        count
    }

    /// Fails every waiter; used when the channel to the master is gone and
    /// no reply can arrive anymore.
    pub fn fail_all(&mut self) {
        for waiter in self.pending.drain() {
            let _ = waiter.send(Err(Error::ConnectionClosed));
        }
        self.orphaned = 0;
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Interval at which [`expire`](Self::expire) is expected to run.
    pub fn expiry_period(&self) -> Duration {
        (self.timeout / 2).max(super::MIN_PERIOD)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TIMEOUT: Duration = Duration::from_secs(30);

    fn uid(s: &str) -> Uid {
        s.parse().unwrap()
    }

    #[test]
    fn replies_resolve_requests_in_issue_order() {
        let mut client = LeaseClient::new(TIMEOUT);
        let now = Instant::now();
        let mut receivers = Vec::new();
        for _ in 0..3 {
            let (tx, rx) = oneshot::channel();
            client.enqueue(tx, now);
            receivers.push(rx);
        }

        for id in ["AAAAAA", "BBBBBB", "CCCCCC"] {
            assert_eq!(client.resolve(uid(id)).unwrap(), Resolution::Delivered);
        }

        let got: Vec<Uid> = receivers
            .into_iter()
            .map(|mut rx| rx.try_recv().unwrap().unwrap())
            .collect();
        assert_eq!(got, vec![uid("AAAAAA"), uid("BBBBBB"), uid("CCCCCC")]);
    }

    #[test]
    fn reply_without_request_is_internal_error() {
        let mut client = LeaseClient::new(TIMEOUT);
        let err = client.resolve(uid("AAAAAA")).unwrap_err();
        assert!(matches!(err, Error::Internal(_)));
    }

    #[test]
    fn expired_waiter_gets_timeout_and_its_late_reply_is_unclaimed() {
        let mut client = LeaseClient::new(TIMEOUT);
        let start = Instant::now();
        let (old_tx, mut old_rx) = oneshot::channel();
        client.enqueue(old_tx, start);
        let later = start + TIMEOUT + Duration::from_secs(1);
        let (new_tx, mut new_rx) = oneshot::channel();
        client.enqueue(new_tx, later);

        assert_eq!(client.expire(later), 1);
        assert!(matches!(
            old_rx.try_recv().unwrap(),
            Err(Error::LeaseTimeout(_))
        ));

        // The reply to the expired request still arrives first.
        assert_eq!(
            client.resolve(uid("AAAAAA")).unwrap(),
            Resolution::Unclaimed(uid("AAAAAA"))
        );
        assert_eq!(client.resolve(uid("BBBBBB")).unwrap(), Resolution::Delivered);
        assert_eq!(new_rx.try_recv().unwrap().unwrap(), uid("BBBBBB"));
    }

    #[test]
    fn dropped_waiter_leaves_uid_unclaimed() {
        let mut client = LeaseClient::new(TIMEOUT);
        let (tx, rx) = oneshot::channel();
        client.enqueue(tx, Instant::now());
        drop(rx);
        assert_eq!(
            client.resolve(uid("AAAAAA")).unwrap(),
            Resolution::Unclaimed(uid("AAAAAA"))
        );
    }

    #[test]
    fn fail_all_closes_every_waiter() {
        let mut client = LeaseClient::new(TIMEOUT);
        let (tx, mut rx) = oneshot::channel();
        client.enqueue(tx, Instant::now());
        client.fail_all();
        assert_eq!(client.pending(), 0);
        assert!(matches!(rx.try_recv().unwrap(), Err(Error::ConnectionClosed)));
    }

    #[test]
    fn expiry_period_never_reaches_zero() {
        assert_eq!(LeaseClient::new(Duration::ZERO).expiry_period(), crate::lease::MIN_PERIOD);
        assert_eq!(LeaseClient::new(TIMEOUT).expiry_period(), TIMEOUT / 2);
    }

    #[test]
    fn queue_expires_from_the_front_only() {
        let mut queue = PendingQueue::new();
        let start = Instant::now();
        queue.push(1, start);
        queue.push(2, start + Duration::from_secs(20));
        let expired = queue.expire(start + Duration::from_secs(31), TIMEOUT);
        assert_eq!(expired, vec![1]);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.pop_oldest(), Some(2));
        assert!(queue.is_empty());
    }
}
