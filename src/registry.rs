//! # Parcel Registry
//!
//! ## Responsibility
//! Hold the authoritative in-memory record of every parcel currently being
//! processed, the pending upstream assignments keyed by parcel id, and the
//! round-robin chute cursor.
//!
//! ## Guarantees
//! - Parcel-First: a pending assignment can only be registered, and a reply
//!   can only be accepted, while a record for that parcel exists. The check
//!   and the mutation happen under the same lock acquisition.
//! - One mutex guards all three structures; no lock is held across an await.
//! - At most one pending assignment per parcel id; later requesters join it.
//! - A pending assignment is resolved exactly once: whoever removes it from
//!   the map (reply or deadline) is the resolver.
//! - Every `create` opens a new lifecycle. Re-detection makes the new
//!   lifecycle the visible record, but the displaced one stays registered
//!   until its own flow retires it, and retiring one lifecycle never
//!   removes another lifecycle's record or pending assignment.
//! - The round-robin cursor always lies in `[0, len)` of the list it was
//!   last advanced over.
//!
//! ## NOT Responsible For
//! - Talking to the upstream service (see: `correlator`)
//! - Choosing a sorting mode (see: `selector`)

use crate::{ChuteId, ParcelId};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Instant;
use tokio::sync::broadcast;
use tracing::{debug, error, warn};

/// Authoritative local record of one parcel's lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParcelRecord {
    /// Source-assigned parcel id.
    pub parcel_id: ParcelId,
    /// When the parcel was detected and the record created.
    pub created_at: Instant,
    /// When the upstream notification was sent, if it was.
    pub upstream_request_sent_at: Option<Instant>,
    /// When an upstream reply for this parcel was accepted.
    pub upstream_reply_received_at: Option<Instant>,
    /// When the reply was bound to the waiting request.
    pub route_bound_at: Option<Instant>,
    /// Token of the lifecycle this record belongs to; pass it to
    /// [`ParcelRegistry::retire`].
    pub lifecycle: u64,
}

impl ParcelRecord {
    fn new(parcel_id: ParcelId, now: Instant, lifecycle: u64) -> Self {
        Self {
            parcel_id,
            lifecycle,
            created_at: now,
            upstream_request_sent_at: None,
            upstream_reply_received_at: None,
            route_bound_at: None,
        }
    }
}

/// What waiters on a pending assignment are told when it resolves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingOutcome {
    /// The upstream reply arrived.
    Assigned(ChuteId),
    /// The deadline of the exchange passed first.
    Expired,
}

/// One outstanding request/reply exchange with the upstream service.
struct PendingAssignment {
    generation: u64,
    lifecycle: u64,
    waiter_tx: broadcast::Sender<PendingOutcome>,
}

/// Result of trying to register a pending assignment.
#[derive(Debug)]
pub enum PendingRegistration {
    /// A fresh exchange was opened; the caller owns the upstream notification.
    New {
        /// Generation tag used to expire exactly this exchange.
        generation: u64,
        /// Receiver resolved by the matching reply.
        rx: broadcast::Receiver<PendingOutcome>,
    },
    /// An exchange was already outstanding; the caller waits on it too.
    Joined {
        /// Generation tag of the exchange that was joined.
        generation: u64,
        /// Receiver resolved by the matching reply.
        rx: broadcast::Receiver<PendingOutcome>,
    },
    /// No parcel record exists; nothing was registered.
    NoRecord,
}

/// Result of offering an upstream reply to the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyResolution {
    /// The reply resolved an outstanding pending assignment.
    Resolved,
    /// A record exists but nothing was waiting (e.g. after a local timeout).
    NoPending,
    /// No record exists for the parcel; the reply was discarded.
    NoRecord,
}

#[derive(Default)]
struct RoutingState {
    /// Live lifecycles per parcel id, oldest first. The last one is the
    /// visible record.
    records: HashMap<ParcelId, Vec<ParcelRecord>>,
    pending: HashMap<ParcelId, PendingAssignment>,
    round_robin_cursor: usize,
    next_generation: u64,
}

/// Mutex-guarded parcel registry.
///
/// The raw maps are never exposed; every operation is a short critical
/// section over in-memory state.
#[derive(Default)]
pub struct ParcelRegistry {
    state: Mutex<RoutingState>,
}

impl ParcelRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a fresh record for `parcel_id`, overwriting any existing one.
    ///
    /// Re-detection of a known id starts a new lifecycle that becomes the
    /// visible record. The displaced lifecycle keeps its own record until
    /// it is retired. The overwrite is logged so that duplicate physical
    /// detections remain visible.
    pub fn create(&self, parcel_id: ParcelId, now: Instant) -> ParcelRecord {
        let mut state = self.state.lock();
        state.next_generation += 1;
        let record = ParcelRecord::new(parcel_id, now, state.next_generation);
        let lifecycles = state.records.entry(parcel_id).or_default();
        let overwritten = !lifecycles.is_empty();
        lifecycles.push(record.clone());
        drop(state);
        if overwritten {
            warn!(
                target: "sorter::registry",
                parcel_id = %parcel_id,
                lifecycle = record.lifecycle,
                "parcel record overwritten by re-detection"
            );
        }
        record
    }

    /// Whether a record exists for `parcel_id`.
    pub fn exists(&self, parcel_id: ParcelId) -> bool {
        self.state.lock().records.contains_key(&parcel_id)
    }

    /// Copy of the visible record for `parcel_id`, if present.
    pub fn get(&self, parcel_id: ParcelId) -> Option<ParcelRecord> {
        self.state
            .lock()
            .records
            .get(&parcel_id)
            .and_then(|lifecycles| lifecycles.last())
            .cloned()
    }

    /// Record when the upstream notification was sent. No-op if absent.
    pub fn mark_request_sent(&self, parcel_id: ParcelId, now: Instant) -> bool {
        self.update(parcel_id, "request_sent", |r| {
            r.upstream_request_sent_at = Some(now)
        })
    }

    /// Record when an upstream reply was received. No-op if absent.
    pub fn mark_reply_received(&self, parcel_id: ParcelId, now: Instant) -> bool {
        self.update(parcel_id, "reply_received", |r| {
            r.upstream_reply_received_at = Some(now)
        })
    }

    /// Record when the route was bound to the parcel. No-op if absent.
    pub fn mark_route_bound(&self, parcel_id: ParcelId, now: Instant) -> bool {
        self.update(parcel_id, "route_bound", |r| r.route_bound_at = Some(now))
    }

    fn update(&self, parcel_id: ParcelId, field: &str, f: impl FnOnce(&mut ParcelRecord)) -> bool {
        let updated = match self
            .state
            .lock()
            .records
            .get_mut(&parcel_id)
            .and_then(|lifecycles| lifecycles.last_mut())
        {
            Some(record) => {
                f(record);
                true
            }
            None => false,
        };
        if !updated {
            debug!(
                target: "sorter::registry",
                parcel_id = %parcel_id,
                field = field,
                "timestamp update ignored: no parcel record"
            );
        }
        updated
    }

    /// Remove every lifecycle of `parcel_id` and return the visible record.
    /// Idempotent.
    pub fn remove(&self, parcel_id: ParcelId) -> Option<ParcelRecord> {
        self.state
            .lock()
            .records
            .remove(&parcel_id)
            .and_then(|mut lifecycles| lifecycles.pop())
    }

    /// Retire one lifecycle of `parcel_id`: its record, and the pending
    /// assignment if that lifecycle opened it.
    ///
    /// Records and pending assignments of other lifecycles are left alone.
    /// Dropping the pending sender wakes any remaining waiters, which then
    /// observe a closed channel.
    pub fn retire(&self, parcel_id: ParcelId, lifecycle: u64) {
        let mut state = self.state.lock();
        let emptied = match state.records.get_mut(&parcel_id) {
            Some(lifecycles) => {
                lifecycles.retain(|r| r.lifecycle != lifecycle);
                lifecycles.is_empty()
            }
            None => false,
        };
        if emptied {
            state.records.remove(&parcel_id);
        }
        if state
            .pending
            .get(&parcel_id)
            .is_some_and(|p| p.lifecycle == lifecycle)
        {
            state.pending.remove(&parcel_id);
        }
    }

    /// Number of parcel ids with a live record.
    pub fn len(&self) -> usize {
        self.state.lock().records.len()
    }

    /// Whether no parcel record is live.
    pub fn is_empty(&self) -> bool {
        self.state.lock().records.is_empty()
    }

    /// Number of outstanding pending assignments.
    pub fn pending_len(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Whether a pending assignment is outstanding for `parcel_id`.
    pub fn has_pending(&self, parcel_id: ParcelId) -> bool {
        self.state.lock().pending.contains_key(&parcel_id)
    }

    /// Open (or join) the pending assignment for `parcel_id`.
    ///
    /// Fails with [`PendingRegistration::NoRecord`] when no record exists,
    /// in which case nothing may be sent upstream. On a fresh registration
    /// `UpstreamRequestSentAt` is stamped under the same lock.
    pub fn register_pending(&self, parcel_id: ParcelId, now: Instant) -> PendingRegistration {
        let mut state = self.state.lock();
        let RoutingState {
            records,
            pending,
            next_generation,
            ..
        } = &mut *state;

        let Some(record) = records.get_mut(&parcel_id).and_then(|l| l.last_mut()) else {
            return PendingRegistration::NoRecord;
        };

        if let Some(existing) = pending.get(&parcel_id) {
            return PendingRegistration::Joined {
                generation: existing.generation,
                rx: existing.waiter_tx.subscribe(),
            };
        }

        record.upstream_request_sent_at = Some(now);
        *next_generation += 1;
        let generation = *next_generation;
        let (waiter_tx, rx) = broadcast::channel(1);
        pending.insert(
            parcel_id,
            PendingAssignment {
                generation,
                lifecycle: record.lifecycle,
                waiter_tx,
            },
        );
        PendingRegistration::New { generation, rx }
    }

    /// Offer an upstream reply for `parcel_id`.
    ///
    /// Never creates a record. When a pending assignment is outstanding it is
    /// removed and resolved with `chute_id`, and `RouteBoundAt` is stamped on
    /// the lifecycle that opened it.
    pub fn resolve_pending(
        &self,
        parcel_id: ParcelId,
        chute_id: ChuteId,
        now: Instant,
    ) -> ReplyResolution {
        let mut state = self.state.lock();
        let RoutingState {
            records, pending, ..
        } = &mut *state;

        let Some(lifecycles) = records.get_mut(&parcel_id) else {
            return ReplyResolution::NoRecord;
        };

        match pending.remove(&parcel_id) {
            Some(assignment) => {
                let owner = lifecycles
                    .iter()
                    .position(|r| r.lifecycle == assignment.lifecycle)
                    .unwrap_or(lifecycles.len().saturating_sub(1));
                if let Some(record) = lifecycles.get_mut(owner) {
                    record.upstream_reply_received_at = Some(now);
                    record.route_bound_at = Some(now);
                }
                // Waiters may already be gone (retired parcel); that is fine.
                let _ = assignment.waiter_tx.send(PendingOutcome::Assigned(chute_id));
                ReplyResolution::Resolved
            }
            None => {
                if let Some(record) = lifecycles.last_mut() {
                    record.upstream_reply_received_at = Some(now);
                }
                ReplyResolution::NoPending
            }
        }
    }

    /// Expire the pending assignment for `parcel_id` if it is still the
    /// exchange identified by `generation`. Joined waiters are told
    /// [`PendingOutcome::Expired`].
    ///
    /// Returns `true` when this call won the resolution race.
    pub fn expire_pending(&self, parcel_id: ParcelId, generation: u64) -> bool {
        match self.take_pending(parcel_id, generation) {
            Some(assignment) => {
                let _ = assignment.waiter_tx.send(PendingOutcome::Expired);
                true
            }
            None => false,
        }
    }

    /// Drop the pending assignment identified by `generation` without a
    /// resolution. Joined waiters observe a closed channel.
    pub fn cancel_pending(&self, parcel_id: ParcelId, generation: u64) -> bool {
        self.take_pending(parcel_id, generation).is_some()
    }

    fn take_pending(&self, parcel_id: ParcelId, generation: u64) -> Option<PendingAssignment> {
        let mut state = self.state.lock();
        match state.pending.get(&parcel_id) {
            Some(p) if p.generation == generation => state.pending.remove(&parcel_id),
            _ => None,
        }
    }

    /// Return the chute under the round-robin cursor and advance it.
    ///
    /// Returns `None` for an empty list. The cursor is re-wrapped against
    /// the list it is given, so a shrinking configuration is safe.
    pub fn next_round_robin(&self, chutes: &[ChuteId]) -> Option<ChuteId> {
        if chutes.is_empty() {
            return None;
        }
        let mut state = self.state.lock();
        let index = state.round_robin_cursor % chutes.len();
        state.round_robin_cursor = (index + 1) % chutes.len();
        chutes.get(index).copied()
    }

    /// Current round-robin cursor position.
    pub fn round_robin_cursor(&self) -> usize {
        self.state.lock().round_robin_cursor
    }

    /// Log a Parcel-First violation.
    pub(crate) fn report_invariant_violation(parcel_id: ParcelId, what: &str) {
        error!(
            target: "sorter::registry",
            parcel_id = %parcel_id,
            what = what,
            "parcel-first invariant violated: no local parcel record"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_then_exists_and_remove_is_idempotent() {
        let registry = ParcelRegistry::new();
        let id = ParcelId(1);
        registry.create(id, Instant::now());
        assert!(registry.exists(id));
        assert!(registry.remove(id).is_some());
        assert!(registry.remove(id).is_none());
        assert!(!registry.exists(id));
    }

    #[test]
    fn test_create_overwrites_existing_record() {
        let registry = ParcelRegistry::new();
        let id = ParcelId(9);
        let first = Instant::now();
        registry.create(id, first);
        registry.mark_request_sent(id, first);

        let second = Instant::now();
        let record = registry.create(id, second);
        assert_eq!(record.upstream_request_sent_at, None);
        assert_eq!(registry.len(), 1);
        assert_eq!(
            registry.get(id).map(|r| r.upstream_request_sent_at),
            Some(None)
        );
    }

    #[test]
    fn test_marks_on_absent_record_are_noops() {
        let registry = ParcelRegistry::new();
        let now = Instant::now();
        assert!(!registry.mark_request_sent(ParcelId(5), now));
        assert!(!registry.mark_reply_received(ParcelId(5), now));
        assert!(!registry.mark_route_bound(ParcelId(5), now));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_marks_fill_timestamps() {
        let registry = ParcelRegistry::new();
        let id = ParcelId(2);
        let now = Instant::now();
        registry.create(id, now);
        assert!(registry.mark_request_sent(id, now));
        assert!(registry.mark_reply_received(id, now));
        assert!(registry.mark_route_bound(id, now));
        let record = registry.get(id).unwrap();
        assert_eq!(record.upstream_request_sent_at, Some(now));
        assert_eq!(record.upstream_reply_received_at, Some(now));
        assert_eq!(record.route_bound_at, Some(now));
    }

    #[test]
    fn test_register_pending_without_record_is_rejected() {
        let registry = ParcelRegistry::new();
        let reg = registry.register_pending(ParcelId(3), Instant::now());
        assert!(matches!(reg, PendingRegistration::NoRecord));
        assert_eq!(registry.pending_len(), 0);
    }

    #[test]
    fn test_second_registration_joins_first() {
        let registry = ParcelRegistry::new();
        let id = ParcelId(4);
        registry.create(id, Instant::now());
        let first = registry.register_pending(id, Instant::now());
        let second = registry.register_pending(id, Instant::now());
        let (g1, g2) = match (first, second) {
            (
                PendingRegistration::New { generation: a, .. },
                PendingRegistration::Joined { generation: b, .. },
            ) => (a, b),
            other => panic!("unexpected registrations: {other:?}"),
        };
        assert_eq!(g1, g2);
        assert_eq!(registry.pending_len(), 1);
    }

    #[test]
    fn test_resolve_pending_delivers_to_all_waiters() {
        let registry = ParcelRegistry::new();
        let id = ParcelId(6);
        registry.create(id, Instant::now());
        let PendingRegistration::New { mut rx, .. } = registry.register_pending(id, Instant::now())
        else {
            panic!("expected a new registration");
        };
        let PendingRegistration::Joined { rx: mut joined, .. } =
            registry.register_pending(id, Instant::now())
        else {
            panic!("expected a joined registration");
        };

        let outcome = registry.resolve_pending(id, ChuteId(12), Instant::now());
        assert_eq!(outcome, ReplyResolution::Resolved);
        assert_eq!(rx.try_recv().unwrap(), PendingOutcome::Assigned(ChuteId(12)));
        assert_eq!(joined.try_recv().unwrap(), PendingOutcome::Assigned(ChuteId(12)));
        assert!(!registry.has_pending(id));
        assert!(registry.get(id).unwrap().route_bound_at.is_some());
    }

    #[test]
    fn test_resolve_without_record_never_creates_one() {
        let registry = ParcelRegistry::new();
        let outcome = registry.resolve_pending(ParcelId(77), ChuteId(3), Instant::now());
        assert_eq!(outcome, ReplyResolution::NoRecord);
        assert!(!registry.exists(ParcelId(77)));
    }

    #[test]
    fn test_expired_assignment_cannot_be_resolved_later() {
        let registry = ParcelRegistry::new();
        let id = ParcelId(8);
        registry.create(id, Instant::now());
        let PendingRegistration::New { generation, .. } =
            registry.register_pending(id, Instant::now())
        else {
            panic!("expected a new registration");
        };
        assert!(registry.expire_pending(id, generation));
        assert!(!registry.expire_pending(id, generation));
        assert_eq!(
            registry.resolve_pending(id, ChuteId(2), Instant::now()),
            ReplyResolution::NoPending
        );
    }

    #[test]
    fn test_expire_ignores_stale_generation() {
        let registry = ParcelRegistry::new();
        let id = ParcelId(10);
        registry.create(id, Instant::now());
        let PendingRegistration::New { generation: old, .. } =
            registry.register_pending(id, Instant::now())
        else {
            panic!("expected a new registration");
        };
        registry.resolve_pending(id, ChuteId(1), Instant::now());
        let PendingRegistration::New { generation: new, .. } =
            registry.register_pending(id, Instant::now())
        else {
            panic!("expected a new registration");
        };
        assert_ne!(old, new);
        assert!(!registry.expire_pending(id, old));
        assert!(registry.has_pending(id));
    }

    #[test]
    fn test_retire_clears_record_and_pending() {
        let registry = ParcelRegistry::new();
        let id = ParcelId(11);
        registry.create(id, Instant::now());
        let record = registry.create(id, Instant::now());
        let _reg = registry.register_pending(id, Instant::now());
        registry.retire(id, record.lifecycle);
        assert!(!registry.exists(id));
        assert!(!registry.has_pending(id));
    }

    #[test]
    fn test_expire_tells_joined_waiters() {
        let registry = ParcelRegistry::new();
        let id = ParcelId(12);
        registry.create(id, Instant::now());
        let PendingRegistration::New { generation, .. } =
            registry.register_pending(id, Instant::now())
        else {
            panic!("expected a new registration");
        };
        let PendingRegistration::Joined { rx: mut joined, .. } =
            registry.register_pending(id, Instant::now())
        else {
            panic!("expected a joined registration");
        };
        assert!(registry.expire_pending(id, generation));
        assert_eq!(joined.try_recv().unwrap(), PendingOutcome::Expired);
    }

    #[test]
    fn test_cancel_closes_joined_waiters_without_outcome() {
        let registry = ParcelRegistry::new();
        let id = ParcelId(13);
        registry.create(id, Instant::now());
        let PendingRegistration::New { generation, mut rx } =
            registry.register_pending(id, Instant::now())
        else {
            panic!("expected a new registration");
        };
        assert!(registry.cancel_pending(id, generation));
        assert!(matches!(
            rx.try_recv(),
            Err(broadcast::error::TryRecvError::Closed)
        ));
    }

    #[test]
    fn test_retiring_newer_lifecycle_keeps_displaced_one() {
        let registry = ParcelRegistry::new();
        let id = ParcelId(14);
        let original = registry.create(id, Instant::now());
        let PendingRegistration::New { mut rx, .. } = registry.register_pending(id, Instant::now())
        else {
            panic!("expected a new registration");
        };

        let duplicate = registry.create(id, Instant::now());
        assert_ne!(original.lifecycle, duplicate.lifecycle);
        assert_eq!(registry.get(id).map(|r| r.lifecycle), Some(duplicate.lifecycle));

        registry.retire(id, duplicate.lifecycle);
        assert!(registry.exists(id));
        assert!(registry.has_pending(id));
        assert_eq!(registry.get(id).map(|r| r.lifecycle), Some(original.lifecycle));

        assert_eq!(
            registry.resolve_pending(id, ChuteId(4), Instant::now()),
            ReplyResolution::Resolved
        );
        assert_eq!(rx.try_recv().unwrap(), PendingOutcome::Assigned(ChuteId(4)));

        registry.retire(id, original.lifecycle);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_retire_leaves_pending_of_other_lifecycle() {
        let registry = ParcelRegistry::new();
        let id = ParcelId(15);
        registry.create(id, Instant::now());
        let _reg = registry.register_pending(id, Instant::now());
        let duplicate = registry.create(id, Instant::now());
        registry.retire(id, duplicate.lifecycle);
        assert!(registry.has_pending(id));
    }

    #[test]
    fn test_round_robin_wraps_in_order() {
        let registry = ParcelRegistry::new();
        let chutes = [ChuteId(1), ChuteId(2), ChuteId(3)];
        let picked: Vec<_> = (0..4)
            .filter_map(|_| registry.next_round_robin(&chutes))
            .collect();
        assert_eq!(picked, vec![ChuteId(1), ChuteId(2), ChuteId(3), ChuteId(1)]);
        assert!(registry.round_robin_cursor() < chutes.len());
    }

    #[test]
    fn test_round_robin_empty_list_returns_none() {
        let registry = ParcelRegistry::new();
        assert_eq!(registry.next_round_robin(&[]), None);
        assert_eq!(registry.round_robin_cursor(), 0);
    }

    #[test]
    fn test_round_robin_cursor_rewraps_when_list_shrinks() {
        let registry = ParcelRegistry::new();
        let long = [ChuteId(1), ChuteId(2), ChuteId(3), ChuteId(4)];
        for _ in 0..3 {
            registry.next_round_robin(&long);
        }
        let short = [ChuteId(5), ChuteId(6)];
        let next = registry.next_round_robin(&short);
        assert_eq!(next, Some(ChuteId(6)));
        assert!(registry.round_robin_cursor() < short.len());
    }
}
