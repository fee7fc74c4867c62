//! Upstream decision-service client abstraction
//!
//! The wire protocol to the rule engine is out of scope. This module fixes
//! the contract the correlator depends on: a best-effort notification per
//! detected parcel and a stream of [`ChuteAssignment`] replies delivered on
//! the client's own context.
//!
//! [`LoopbackUpstreamClient`] answers locally and is used by the demo binary
//! and by tests.

use crate::{ChuteId, ParcelId, SorterError};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::debug;

/// Capacity of the reply broadcast channel.
pub const ASSIGNMENT_CHANNEL_SIZE: usize = 1024;

/// A chute assignment pushed by the upstream service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChuteAssignment {
    /// Parcel the assignment refers to.
    pub parcel_id: ParcelId,
    /// Assigned chute.
    pub chute_id: ChuteId,
}

/// Client for the external decision service.
///
/// Implementations must be thread-safe; replies are delivered through
/// [`UpstreamClient::subscribe`], and dropping the receiver unsubscribes.
#[async_trait]
pub trait UpstreamClient: Send + Sync {
    /// Establish the connection. Returns whether the client is connected.
    async fn connect(&self) -> bool;

    /// Tell the service a parcel was detected.
    ///
    /// # Errors
    ///
    /// Returns [`SorterError::Upstream`] when the notification could not be
    /// delivered.
    async fn notify_detected(&self, parcel_id: ParcelId) -> Result<(), SorterError>;

    /// Whether the client currently holds a connection.
    fn is_connected(&self) -> bool;

    /// Subscribe to chute assignment replies.
    fn subscribe(&self) -> broadcast::Receiver<ChuteAssignment>;
}

/// How the loopback client answers notifications.
#[derive(Debug, Clone)]
pub enum LoopbackReply {
    /// Never answer.
    Silent,
    /// Always answer with the same chute.
    Fixed(ChuteId),
    /// Answer with chutes taken from the list in turn.
    Cycle(Vec<ChuteId>),
}

/// In-process upstream client.
pub struct LoopbackUpstreamClient {
    connected: AtomicBool,
    reply: LoopbackReply,
    delay: Duration,
    notify_calls: AtomicUsize,
    next: Mutex<usize>,
    tx: broadcast::Sender<ChuteAssignment>,
}

impl LoopbackUpstreamClient {
    /// Create a connected client that answers with `reply` after `delay`.
    pub fn new(reply: LoopbackReply, delay: Duration) -> Self {
        let (tx, _) = broadcast::channel(ASSIGNMENT_CHANNEL_SIZE);
        Self {
            connected: AtomicBool::new(true),
            reply,
            delay,
            notify_calls: AtomicUsize::new(0),
            next: Mutex::new(0),
            tx,
        }
    }

    /// A connected client that never replies.
    pub fn silent() -> Self {
        Self::new(LoopbackReply::Silent, Duration::ZERO)
    }

    /// Flip the connection flag.
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Number of `notify_detected` calls seen so far.
    pub fn notify_calls(&self) -> usize {
        self.notify_calls.load(Ordering::SeqCst)
    }

    /// Publish an assignment as if the service had sent it.
    pub fn push_assignment(&self, parcel_id: ParcelId, chute_id: ChuteId) {
        let _ = self.tx.send(ChuteAssignment {
            parcel_id,
            chute_id,
        });
    }

    fn next_reply(&self) -> Option<ChuteId> {
        match &self.reply {
            LoopbackReply::Silent => None,
            LoopbackReply::Fixed(chute) => Some(*chute),
            LoopbackReply::Cycle(chutes) if chutes.is_empty() => None,
            LoopbackReply::Cycle(chutes) => {
                let mut next = self.next.lock();
                let chute = chutes.get(*next % chutes.len()).copied();
                *next = (*next + 1) % chutes.len();
                chute
            }
        }
    }
}

#[async_trait]
impl UpstreamClient for LoopbackUpstreamClient {
    async fn connect(&self) -> bool {
        self.connected.store(true, Ordering::SeqCst);
        true
    }

    async fn notify_detected(&self, parcel_id: ParcelId) -> Result<(), SorterError> {
        self.notify_calls.fetch_add(1, Ordering::SeqCst);
        if !self.is_connected() {
            return Err(SorterError::Upstream("not connected".to_string()));
        }

        if let Some(chute_id) = self.next_reply() {
            let tx = self.tx.clone();
            let delay = self.delay;
            tokio::spawn(async move {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                debug!(target: "sorter::upstream", parcel_id = %parcel_id, chute_id = %chute_id, "loopback reply");
                let _ = tx.send(ChuteAssignment {
                    parcel_id,
                    chute_id,
                });
            });
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn subscribe(&self) -> broadcast::Receiver<ChuteAssignment> {
        self.tx.subscribe()
    }
}

/// Shared handle type used throughout the crate.
pub type SharedUpstream = Arc<dyn UpstreamClient>;

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_loopback_fixed_reply_is_published() {
        let client = LoopbackUpstreamClient::new(LoopbackReply::Fixed(ChuteId(5)), Duration::ZERO);
        let mut rx = client.subscribe();
        client.notify_detected(ParcelId(1)).await.unwrap();
        let reply = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            reply,
            ChuteAssignment {
                parcel_id: ParcelId(1),
                chute_id: ChuteId(5)
            }
        );
        assert_eq!(client.notify_calls(), 1);
    }

    #[tokio::test]
    async fn test_loopback_disconnected_notify_fails() {
        let client = LoopbackUpstreamClient::silent();
        client.set_connected(false);
        let result = client.notify_detected(ParcelId(1)).await;
        assert!(matches!(result, Err(SorterError::Upstream(_))));
        assert!(client.connect().await);
        assert!(client.is_connected());
    }

    #[tokio::test]
    async fn test_loopback_cycle_rotates_replies() {
        let client = LoopbackUpstreamClient::new(
            LoopbackReply::Cycle(vec![ChuteId(1), ChuteId(2)]),
            Duration::ZERO,
        );
        assert_eq!(client.next_reply(), Some(ChuteId(1)));
        assert_eq!(client.next_reply(), Some(ChuteId(2)));
        assert_eq!(client.next_reply(), Some(ChuteId(1)));
    }
}
