//! Outstanding file requests
//!
//! Each `requestFile` sent to a peer gets an entry keyed by its request id.
//! An entry leaves the table exactly once: when the matching response arrives,
//! when the waiter gives up (deadline or drop), or when the peer goes away.
//! Whichever happens first wins; the others find nothing to do.

use super::protocol::FileResponse;
use crate::cas::ContentId;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use uuid::Uuid;

struct PendingRequest {
    peer_id: String,
    target: ContentId,
    issued_at: Instant,
    reply: oneshot::Sender<FileResponse>,
}

/// How a single peer branch of a fetch ended
#[derive(Debug)]
pub enum Outcome {
    Answered(FileResponse),
    TimedOut,
    /// The peer disconnected before answering
    Closed,
}

/// Request table shared by the dispatcher and fetching tasks
#[derive(Default)]
pub struct PendingTable {
    entries: Mutex<HashMap<String, PendingRequest>>,
}

impl PendingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a request to `peer_id` for `target`, answerable until `timeout` elapses
    pub fn register(&self, peer_id: &str, target: &ContentId, timeout: Duration) -> Waiter<'_> {
        let request_id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        let issued_at = Instant::now();

        self.entries.lock().unwrap().insert(
            request_id.clone(),
            PendingRequest {
                peer_id: peer_id.to_string(),
                target: target.clone(),
                issued_at,
                reply: tx,
            },
        );

        Waiter {
            table: self,
            request_id,
            deadline: issued_at + timeout,
            reply: rx,
        }
    }

    /// Hand a response to its waiter.
    /// Returns false for late, unknown or mismatched responses, which are left alone.
    pub fn resolve(&self, peer_id: &str, response: FileResponse) -> bool {
        let entry = {
            let mut entries = self.entries.lock().unwrap();
            let matches = entries
                .get(&response.request_id)
                .is_some_and(|pending| pending.peer_id == peer_id && pending.target == response.hash);
            if matches {
                entries.remove(&response.request_id)
            } else {
                None
            }
        };

        match entry {
            Some(pending) => {
                log::trace!(
                    "Request {} answered by {} after {:?}",
                    response.request_id,
                    peer_id,
                    pending.issued_at.elapsed()
                );
                // The waiter may have been dropped in the meantime; nothing to do then
                let _ = pending.reply.send(response);
                true
            }
            None => false,
        }
    }

    /// Drop an entry without answering it
    pub fn cancel(&self, request_id: &str) -> bool {
        self.entries.lock().unwrap().remove(request_id).is_some()
    }

    /// Drop every entry addressed to a peer; their waiters see [`Outcome::Closed`]
    pub fn abandon_peer(&self, peer_id: &str) -> usize {
        let mut entries = self.entries.lock().unwrap();
        let before = entries.len();
        entries.retain(|_, pending| pending.peer_id != peer_id);
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Receiving end of one pending request. Dropping it cancels the request.
pub struct Waiter<'a> {
    table: &'a PendingTable,
    request_id: String,
    deadline: Instant,
    reply: oneshot::Receiver<FileResponse>,
}

impl Waiter<'_> {
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Wait for the response or the deadline, whichever comes first
    pub async fn outcome(mut self) -> Outcome {
        match tokio::time::timeout_at(self.deadline, &mut self.reply).await {
            Ok(Ok(response)) => Outcome::Answered(response),
            Ok(Err(_)) => Outcome::Closed,
            Err(_) => Outcome::TimedOut,
        }
    }
}

impl Drop for Waiter<'_> {
    fn drop(&mut self) {
        self.table.cancel(&self.request_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TIMEOUT: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn test_response_resolves_waiter() {
        let table = PendingTable::new();
        let id = ContentId::derive(b"wanted");

        let waiter = table.register("peer-1", &id, TIMEOUT);
        let response = FileResponse::missing(waiter.request_id(), id.clone());
        assert!(table.resolve("peer-1", response.clone()));

        match waiter.outcome().await {
            Outcome::Answered(got) => assert_eq!(got, response),
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_second_response_is_ignored() {
        let table = PendingTable::new();
        let id = ContentId::derive(b"once");

        let waiter = table.register("peer-1", &id, TIMEOUT);
        let response = FileResponse::missing(waiter.request_id(), id.clone());
        assert!(table.resolve("peer-1", response.clone()));
        assert!(!table.resolve("peer-1", response));
        drop(waiter);
    }

    #[tokio::test]
    async fn test_mismatched_responses_are_ignored() {
        let table = PendingTable::new();
        let id = ContentId::derive(b"target");

        let waiter = table.register("peer-1", &id, TIMEOUT);

        // Wrong peer
        let response = FileResponse::missing(waiter.request_id(), id.clone());
        assert!(!table.resolve("peer-2", response));

        // Wrong hash
        let response = FileResponse::missing(waiter.request_id(), ContentId::derive(b"other"));
        assert!(!table.resolve("peer-1", response));

        // Unknown request
        assert!(!table.resolve("peer-1", FileResponse::missing("nope", id.clone())));

        assert_eq!(table.len(), 1);
        drop(waiter);
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_timeout_then_late_response() {
        let table = PendingTable::new();
        let id = ContentId::derive(b"slow");

        let waiter = table.register("peer-1", &id, Duration::from_millis(100));
        let request_id = waiter.request_id().to_string();

        assert!(matches!(waiter.outcome().await, Outcome::TimedOut));
        assert!(table.is_empty());

        // Late answer finds nothing to resolve
        assert!(!table.resolve("peer-1", FileResponse::missing(request_id, id)));
    }

    #[tokio::test]
    async fn test_abandon_peer_closes_waiters() {
        let table = PendingTable::new();
        let id = ContentId::derive(b"gone");

        let gone = table.register("peer-1", &id, TIMEOUT);
        let other = table.register("peer-2", &id, TIMEOUT);

        assert_eq!(table.abandon_peer("peer-1"), 1);
        assert!(matches!(gone.outcome().await, Outcome::Closed));
        assert_eq!(table.len(), 1);
        drop(other);
        assert!(table.is_empty());
    }
}
