//! Client-side correlation of replies with the requests that caused them.
//!
//! Every request sent by a [`Client`](super::Client) registers an
//! expectation keyed by session-id and message-id. The reader thread
//! resolves it when the matching `<rpc-reply>` arrives. Expectations that
//! outlive their TTL are swept and their callbacks receive
//! [`ClientError::Timeout`]. Sweeping happens lazily on every insert and
//! resolve, and may also be driven by a timer.
use std::{
    collections::HashMap,
    sync::{Mutex, MutexGuard, PoisonError},
    time::{Duration, Instant},
};

use log::{debug, warn};

use super::{Response, client::ClientError};

pub type Outcome = Result<Response, ClientError>;
pub type Callback = Box<dyn FnOnce(Outcome) + Send>;

type Key = (String, String);

struct Expectation {
    callback: Callback,
    created: Instant,
    ttl: Duration,
}

impl Expectation {
    fn expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.created) >= self.ttl
    }
}

pub struct ExpectationRegistry {
    ttl: Duration,
    table: Mutex<HashMap<Key, Expectation>>,
}

impl ExpectationRegistry {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            table: Mutex::new(HashMap::new()),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn table(&self) -> MutexGuard<'_, HashMap<Key, Expectation>> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn len(&self) -> usize {
        self.table().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn insert(&self, session: &str, message_id: &str, callback: Callback) -> Result<(), ClientError> {
        self.insert_at(session, message_id, callback, Instant::now())
    }

    fn insert_at(
        &self,
        session: &str,
        message_id: &str,
        callback: Callback,
        now: Instant,
    ) -> Result<(), ClientError> {
        self.sweep_at(now);
        let key = (session.to_string(), message_id.to_string());
        let mut table = self.table();
        if table.contains_key(&key) {
            return Err(ClientError::DuplicateMessageId(message_id.to_string()));
        }
        table.insert(
            key,
            Expectation {
                callback,
                created: now,
                ttl: self.ttl,
            },
        );
        Ok(())
    }

    /// Deliver `outcome` to the expectation for this reply. Returns false
    /// when nothing was waiting for it.
    pub fn resolve(&self, session: &str, message_id: &str, outcome: Outcome) -> bool {
        self.sweep();
        let key = (session.to_string(), message_id.to_string());
        let Some(expectation) = self.table().remove(&key) else {
            warn!("no request waiting for reply {message_id} on session {session}");
            return false;
        };
        (expectation.callback)(outcome);
        true
    }

    pub fn sweep(&self) -> usize {
        self.sweep_at(Instant::now())
    }

    /// Time out every expectation whose TTL has elapsed at `now`.
    pub fn sweep_at(&self, now: Instant) -> usize {
        let expired: Vec<(Key, Expectation)> = {
            let mut table = self.table();
            let keys: Vec<Key> = table
                .iter()
                .filter(|(_, e)| e.expired(now))
                .map(|(k, _)| k.clone())
                .collect();
            keys.into_iter()
                .filter_map(|k| table.remove(&k).map(|e| (k, e)))
                .collect()
        };

        let count = expired.len();
        for ((session, message_id), expectation) in expired {
            warn!("request {message_id} on session {session} timed out");
            (expectation.callback)(Err(ClientError::Timeout { message_id }));
        }
        count
    }

    /// Fail everything still waiting on `session`.
    pub fn fail_session(&self, session: &str) -> usize {
        let pending: Vec<(Key, Expectation)> = {
            let mut table = self.table();
            let keys: Vec<Key> = table.keys().filter(|(s, _)| s == session).cloned().collect();
            keys.into_iter()
                .filter_map(|k| table.remove(&k).map(|e| (k, e)))
                .collect()
        };

        let count = pending.len();
        for ((_, message_id), expectation) in pending {
            debug!("failing request {message_id}: session {session} closed");
            (expectation.callback)(Err(ClientError::SessionClosed));
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, mpsc};

    use super::*;
    use crate::protocol::error::{ErrorTag, RpcError};

    fn recorder() -> (Callback, mpsc::Receiver<Outcome>) {
        let (tx, rx) = mpsc::channel();
        (
            Box::new(move |outcome| {
                let _ = tx.send(outcome);
            }),
            rx,
        )
    }

    #[test]
    fn resolve_delivers_once() {
        let registry = ExpectationRegistry::new(Duration::from_secs(8));
        let (callback, rx) = recorder();
        registry.insert("1", "101", callback).unwrap();

        assert!(registry.resolve("1", "101", Ok(Response::Ok)));
        assert!(matches!(rx.recv().unwrap(), Ok(Response::Ok)));
        assert!(!registry.resolve("1", "101", Ok(Response::Ok)));
        assert!(registry.is_empty());
    }

    #[test]
    fn errors_are_delivered_as_failures() {
        let registry = ExpectationRegistry::new(Duration::from_secs(8));
        let (callback, rx) = recorder();
        registry.insert("1", "7", callback).unwrap();
        let err = RpcError::new(ErrorTag::LockDenied);
        registry.resolve("1", "7", Err(ClientError::Rpc(err.clone())));
        match rx.recv().unwrap() {
            Err(ClientError::Rpc(got)) => assert_eq!(got, err),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn duplicate_keys_are_rejected() {
        let registry = ExpectationRegistry::new(Duration::from_secs(8));
        registry.insert("1", "5", Box::new(|_| {})).unwrap();
        assert!(matches!(
            registry.insert("1", "5", Box::new(|_| {})),
            Err(ClientError::DuplicateMessageId(_))
        ));
        registry.insert("2", "5", Box::new(|_| {})).unwrap();
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn sweep_times_out_expired_entries() {
        let registry = ExpectationRegistry::new(Duration::from_secs(8));
        let start = Instant::now();
        let (callback, rx) = recorder();
        registry.insert_at("1", "9", callback, start).unwrap();
        registry.insert_at("1", "10", Box::new(|_| {}), start + Duration::from_secs(5)).unwrap();

        assert_eq!(registry.sweep_at(start + Duration::from_secs(7)), 0);
        assert_eq!(registry.sweep_at(start + Duration::from_secs(9)), 1);
        match rx.recv().unwrap() {
            Err(ClientError::Timeout { message_id }) => assert_eq!(message_id, "9"),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn callbacks_may_reenter_the_registry() {
        let registry = Arc::new(ExpectationRegistry::new(Duration::from_millis(1)));
        let inner = Arc::clone(&registry);
        let start = Instant::now();
        registry
            .insert_at(
                "1",
                "1",
                Box::new(move |_| {
                    let _ = inner.len();
                }),
                start,
            )
            .unwrap();
        assert_eq!(registry.sweep_at(start + Duration::from_secs(1)), 1);
    }

    #[test]
    fn fail_session_only_touches_that_session() {
        let registry = ExpectationRegistry::new(Duration::from_secs(8));
        let (callback, rx) = recorder();
        registry.insert("1", "1", callback).unwrap();
        registry.insert("2", "1", Box::new(|_| {})).unwrap();

        assert_eq!(registry.fail_session("1"), 1);
        assert!(matches!(rx.recv().unwrap(), Err(ClientError::SessionClosed)));
        assert_eq!(registry.len(), 1);
    }
}
