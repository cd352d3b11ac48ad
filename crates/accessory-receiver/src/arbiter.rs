//! Resource arbitration.
//!
//! Tracks, per shared resource, who holds the Take, who has Borrowed it and
//! who is waiting. The arbiter is plain state with no queue of its own: the
//! server owns the only instance and mutates it from its queue, so a Take and
//! a concurrent Untake are never interleaved.
//!
//! Rules:
//! - At most one Take holder per resource.
//! - A Take at a strictly higher priority preempts the holder, which is
//!   reported as a [`Revocation`] before the new Take is recorded.
//! - A losing Take is denied or parked, per [`ContentionPolicy`].
//! - A Borrow needs an existing Take and never displaces it. Among several
//!   borrowers the most recently issued one is visible; ties on equal
//!   timestamps have no defined winner. Borrows end with the Take they
//!   attach to: when it is released or revoked, they are revoked too.
//! - Untake and Unborrow of a claim the caller does not hold succeed as no-ops.
//! - Constraints are opaque here; a [`ConstraintPolicy`] decides when a claim
//!   stops being valid after a mode change. Only the claims of the holder
//!   whose modes changed are rechecked.

use crate::config::ContentionPolicy;
use crate::errors::{ReceiverError, ReceiverResult};
use crate::protocol::{keys, Constraint, ModeState, ResourceChange, ResourceId, TransferPriority, TransferType};
use crate::value::{Dict, DictExt, Value};
use common::types::SessionId;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

const TAKE_RELEASED: &str = "take released";
const CONSTRAINT_LAPSED: &str = "constraint no longer satisfied";

/// Who a claim belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Holder {
    Session(SessionId),
    /// The accessory's own system (safety alerts, reverse camera, ...).
    Local,
}

impl fmt::Display for Holder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Holder::Session(id) => write!(f, "session:{id}"),
            Holder::Local => f.write_str("local"),
        }
    }
}

impl Holder {
    fn parse(raw: &str) -> ReceiverResult<Self> {
        if raw == "local" {
            return Ok(Holder::Local);
        }
        raw.strip_prefix("session:")
            .and_then(|id| Uuid::parse_str(id).ok())
            .map(|uuid| Holder::Session(SessionId(uuid)))
            .ok_or_else(|| ReceiverError::InvalidParameter(format!("unknown holder {raw:?}")))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum ClaimKind {
    Take,
    Borrow,
}

/// One recorded claim on a resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Claim {
    pub holder: Holder,
    pub kind: ClaimKind,
    pub priority: TransferPriority,
    pub take_constraint: Constraint,
    pub borrow_constraint: Constraint,
    /// When the request was issued, before it reached any queue.
    pub issued_at: Instant,
    pub reason: Option<String>,
}

impl Claim {
    fn from_change(holder: Holder, kind: ClaimKind, change: &ResourceChange, issued_at: Instant) -> Self {
        Self {
            holder,
            kind,
            priority: change.priority,
            take_constraint: change.take_constraint,
            borrow_constraint: change.borrow_constraint,
            issued_at,
            reason: change.reason.clone(),
        }
    }
}

/// A claim removed from its holder without the holder asking.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Revocation {
    pub resource: ResourceId,
    pub claim: Claim,
    /// Why: the preempting request's reason, or the constraint that lapsed.
    pub reason: Option<String>,
}

/// A parked Take that has now been granted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Promotion {
    pub ticket: u64,
    pub resource: ResourceId,
    pub holder: Holder,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DenyReason {
    HeldAtHigherPriority {
        holder: Holder,
        priority: TransferPriority,
    },
    /// Borrow without a Take to attach to.
    NoTakeHolder,
}

/// Result of applying one [`ResourceChange`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Take or Borrow recorded. `revoked` lists claims displaced first.
    Granted { revoked: Vec<Revocation> },
    Denied(DenyReason),
    /// Take parked until the holder releases.
    Queued { ticket: u64, position: usize },
    /// Claim released. Releasing a Take revokes the borrows attached to it
    /// and may promote a parked Take.
    Released {
        revoked: Vec<Revocation>,
        promoted: Option<Promotion>,
    },
    /// A parked Take withdrawn by its own Untake.
    Withdrawn { ticket: u64 },
    /// Release of a claim the caller did not hold.
    NotHeld,
}

impl Decision {
    /// The caller-visible outcome.
    #[must_use]
    pub fn outcome(&self) -> ResourceOutcome {
        match self {
            Decision::Granted { .. } => ResourceOutcome::Granted,
            Decision::Denied(DenyReason::HeldAtHigherPriority { holder, .. }) => {
                ResourceOutcome::Denied {
                    holder: Some(*holder),
                }
            }
            Decision::Denied(DenyReason::NoTakeHolder) => ResourceOutcome::Denied { holder: None },
            Decision::Queued { .. } => ResourceOutcome::Queued,
            Decision::Released { .. } | Decision::Withdrawn { .. } => ResourceOutcome::Released,
            Decision::NotHeld => ResourceOutcome::NotHeld,
        }
    }
}

/// What the caller of `changeResourceMode` sees. A denial is an ordinary
/// result, not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceOutcome {
    Granted,
    Denied { holder: Option<Holder> },
    Queued,
    Released,
    NotHeld,
}

impl ResourceOutcome {
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            ResourceOutcome::Granted => "granted",
            ResourceOutcome::Denied { .. } => "denied",
            ResourceOutcome::Queued => "queued",
            ResourceOutcome::Released => "released",
            ResourceOutcome::NotHeld => "not_held",
        }
    }

    #[must_use]
    pub fn to_value(&self) -> Value {
        let mut dict = Dict::new();
        dict.insert(keys::RESULT.to_string(), Value::from(self.label()));
        if let ResourceOutcome::Denied {
            holder: Some(holder),
        } = self
        {
            dict.insert(keys::HOLDER.to_string(), Value::from(holder.to_string()));
        }
        Value::Dict(dict)
    }

    /// # Errors
    ///
    /// `InvalidParameter` if `value` is not an outcome mapping.
    pub fn from_value(value: &Value) -> ReceiverResult<Self> {
        let dict = value.as_dict().ok_or_else(|| {
            ReceiverError::InvalidParameter("resource outcome must be a mapping".to_string())
        })?;
        match dict.require_str(keys::RESULT)? {
            "granted" => Ok(ResourceOutcome::Granted),
            "denied" => Ok(ResourceOutcome::Denied {
                holder: dict.str_field(keys::HOLDER).map(Holder::parse).transpose()?,
            }),
            "queued" => Ok(ResourceOutcome::Queued),
            "released" => Ok(ResourceOutcome::Released),
            "not_held" => Ok(ResourceOutcome::NotHeld),
            other => Err(ReceiverError::InvalidParameter(format!(
                "unknown resource outcome {other:?}"
            ))),
        }
    }
}

/// Decides whether a claim survives the current modes.
pub trait ConstraintPolicy: Send + Sync {
    fn still_valid(&self, resource: ResourceId, claim: &Claim, modes: &ModeState) -> bool;
}

/// Keeps every claim. Used when the embedder supplies no policy.
#[derive(Debug, Default, Clone, Copy)]
pub struct RetainAll;

impl ConstraintPolicy for RetainAll {
    fn still_valid(&self, _resource: ResourceId, _claim: &Claim, _modes: &ModeState) -> bool {
        true
    }
}

/// Outcome of dropping every claim of one holder.
#[derive(Debug, Default)]
pub struct HolderRelease {
    pub released: Vec<(ResourceId, ClaimKind)>,
    /// Other holders' borrows on Takes the holder gave up.
    pub revoked: Vec<Revocation>,
    /// Parked Takes of the holder, to be completed with `Cancelled`.
    pub cancelled_tickets: Vec<u64>,
    pub promoted: Vec<Promotion>,
}

/// Outcome of a constraint recheck.
#[derive(Debug, Default)]
pub struct Recheck {
    pub revoked: Vec<Revocation>,
    pub promoted: Vec<Promotion>,
}

/// Point-in-time view of one claim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClaimSnapshot {
    pub resource: ResourceId,
    pub holder: Holder,
    pub kind: ClaimKind,
    pub priority: TransferPriority,
    /// For borrows: whether this is the visible one.
    pub visible: bool,
}

#[derive(Debug)]
struct Parked {
    ticket: u64,
    claim: Claim,
}

#[derive(Debug, Default)]
struct ResourceState {
    take: Option<Claim>,
    borrows: Vec<Claim>,
    parked: Vec<Parked>,
}

impl ResourceState {
    /// Revoke every borrow; the Take they hung off is gone.
    fn drop_borrows(&mut self, resource: ResourceId, reason: &str) -> Vec<Revocation> {
        std::mem::take(&mut self.borrows)
            .into_iter()
            .map(|claim| Revocation {
                resource,
                claim,
                reason: Some(reason.to_string()),
            })
            .collect()
    }

    /// Most recently issued borrow. Equal timestamps: no defined winner.
    fn visible_borrow(&self) -> Option<&Claim> {
        self.borrows.iter().max_by_key(|c| c.issued_at)
    }

    /// Grant the best parked Take if the resource is free.
    fn promote(&mut self, resource: ResourceId) -> Option<Promotion> {
        if self.take.is_some() {
            return None;
        }
        // Highest priority first; FIFO among equals
        let best = self
            .parked
            .iter()
            .enumerate()
            .fold(None::<(usize, TransferPriority)>, |best, (idx, p)| match best {
                Some((_, prio)) if prio >= p.claim.priority => best,
                _ => Some((idx, p.claim.priority)),
            })
            .map(|(idx, _)| idx)?;
        let parked = self.parked.remove(best);
        let promotion = Promotion {
            ticket: parked.ticket,
            resource,
            holder: parked.claim.holder,
        };
        self.take = Some(parked.claim);
        Some(promotion)
    }
}

/// The claim table for every shared resource.
#[derive(Debug)]
pub struct ResourceArbiter {
    contention: ContentionPolicy,
    resources: BTreeMap<ResourceId, ResourceState>,
    next_ticket: u64,
}

impl ResourceArbiter {
    #[must_use]
    pub fn new(contention: ContentionPolicy) -> Self {
        Self {
            contention,
            resources: BTreeMap::new(),
            next_ticket: 0,
        }
    }

    /// Apply one change on behalf of `holder`.
    pub fn apply(&mut self, holder: Holder, change: &ResourceChange, issued_at: Instant) -> Decision {
        let decision = match change.transfer {
            TransferType::Take => self.take(holder, change, issued_at),
            TransferType::Borrow => self.borrow(holder, change, issued_at),
            TransferType::Untake => self.untake(holder, change.resource),
            TransferType::Unborrow => self.unborrow(holder, change.resource),
        };
        debug!(
            target: "ar.arbiter",
            resource = %change.resource,
            holder = %holder,
            transfer = ?change.transfer,
            priority = change.priority.0,
            outcome = decision.outcome().label(),
            "Resource change applied"
        );
        decision
    }

    fn take(&mut self, holder: Holder, change: &ResourceChange, issued_at: Instant) -> Decision {
        let claim = Claim::from_change(holder, ClaimKind::Take, change, issued_at);
        let state = self.resources.entry(change.resource).or_default();

        let current = match &state.take {
            None => {
                state.take = Some(claim);
                return Decision::Granted { revoked: vec![] };
            }
            Some(current) => current,
        };

        if current.holder == holder {
            state.take = Some(claim);
            return Decision::Granted { revoked: vec![] };
        }

        if current.priority < change.priority {
            let previous = state.take.replace(claim);
            let revoked = previous
                .map(|claim| Revocation {
                    resource: change.resource,
                    claim,
                    reason: change.reason.clone(),
                })
                .into_iter()
                .collect();
            return Decision::Granted { revoked };
        }

        match self.contention {
            ContentionPolicy::Deny => Decision::Denied(DenyReason::HeldAtHigherPriority {
                holder: current.holder,
                priority: current.priority,
            }),
            ContentionPolicy::Queue => {
                // One parked Take per holder; a repeat replaces the earlier one
                if let Some(existing) = state.parked.iter_mut().find(|p| p.claim.holder == holder) {
                    existing.claim = claim;
                    let ticket = existing.ticket;
                    let position = state
                        .parked
                        .iter()
                        .position(|p| p.ticket == ticket)
                        .unwrap_or(0);
                    return Decision::Queued { ticket, position };
                }
                self.next_ticket += 1;
                let ticket = self.next_ticket;
                state.parked.push(Parked { ticket, claim });
                Decision::Queued {
                    ticket,
                    position: state.parked.len() - 1,
                }
            }
        }
    }

    fn borrow(&mut self, holder: Holder, change: &ResourceChange, issued_at: Instant) -> Decision {
        let state = self.resources.entry(change.resource).or_default();
        if state.take.is_none() {
            return Decision::Denied(DenyReason::NoTakeHolder);
        }
        let claim = Claim::from_change(holder, ClaimKind::Borrow, change, issued_at);
        match state.borrows.iter_mut().find(|c| c.holder == holder) {
            Some(existing) => *existing = claim,
            None => state.borrows.push(claim),
        }
        Decision::Granted { revoked: vec![] }
    }

    fn untake(&mut self, holder: Holder, resource: ResourceId) -> Decision {
        let Some(state) = self.resources.get_mut(&resource) else {
            return Decision::NotHeld;
        };
        if state.take.as_ref().is_some_and(|c| c.holder == holder) {
            state.take = None;
            return Decision::Released {
                revoked: state.drop_borrows(resource, TAKE_RELEASED),
                promoted: state.promote(resource),
            };
        }
        if let Some(idx) = state.parked.iter().position(|p| p.claim.holder == holder) {
            let parked = state.parked.remove(idx);
            return Decision::Withdrawn {
                ticket: parked.ticket,
            };
        }
        Decision::NotHeld
    }

    fn unborrow(&mut self, holder: Holder, resource: ResourceId) -> Decision {
        let Some(state) = self.resources.get_mut(&resource) else {
            return Decision::NotHeld;
        };
        let before = state.borrows.len();
        state.borrows.retain(|c| c.holder != holder);
        if state.borrows.len() == before {
            Decision::NotHeld
        } else {
            Decision::Released {
                revoked: vec![],
                promoted: None,
            }
        }
    }

    /// Drop every claim and parked Take of `holder` (session ended).
    pub fn release_holder(&mut self, holder: Holder) -> HolderRelease {
        let mut release = HolderRelease::default();
        for (resource, state) in &mut self.resources {
            let before = state.borrows.len();
            state.borrows.retain(|c| c.holder != holder);
            if state.borrows.len() != before {
                release.released.push((*resource, ClaimKind::Borrow));
            }
            if state.take.as_ref().is_some_and(|c| c.holder == holder) {
                state.take = None;
                release.released.push((*resource, ClaimKind::Take));
                release
                    .revoked
                    .extend(state.drop_borrows(*resource, TAKE_RELEASED));
            }
            state.parked.retain(|p| {
                let keep = p.claim.holder != holder;
                if !keep {
                    release.cancelled_tickets.push(p.ticket);
                }
                keep
            });
            release.promoted.extend(state.promote(*resource));
        }
        release
    }

    /// Re-evaluate the claims of `holder` against its new `modes`,
    /// revoking those the policy no longer accepts. Other holders' claims
    /// are left alone, except borrows on a Take that lapsed.
    pub fn recheck(&mut self, holder: Holder, modes: &ModeState, policy: &dyn ConstraintPolicy) -> Recheck {
        let mut outcome = Recheck::default();
        for (resource, state) in &mut self.resources {
            let (kept, lapsed): (Vec<Claim>, Vec<Claim>) = std::mem::take(&mut state.borrows)
                .into_iter()
                .partition(|claim| claim.holder != holder || policy.still_valid(*resource, claim, modes));
            state.borrows = kept;
            outcome
                .revoked
                .extend(lapsed.into_iter().map(|claim| Revocation {
                    resource: *resource,
                    claim,
                    reason: Some(CONSTRAINT_LAPSED.to_string()),
                }));

            let take_lapsed = state
                .take
                .as_ref()
                .is_some_and(|take| take.holder == holder && !policy.still_valid(*resource, take, modes));
            if take_lapsed {
                if let Some(claim) = state.take.take() {
                    outcome.revoked.push(Revocation {
                        resource: *resource,
                        claim,
                        reason: Some(CONSTRAINT_LAPSED.to_string()),
                    });
                }
                outcome
                    .revoked
                    .extend(state.drop_borrows(*resource, TAKE_RELEASED));
            }

            outcome.promoted.extend(state.promote(*resource));
        }
        outcome
    }

    #[must_use]
    pub fn take_holder(&self, resource: ResourceId) -> Option<&Claim> {
        self.resources.get(&resource).and_then(|s| s.take.as_ref())
    }

    #[must_use]
    pub fn visible_borrower(&self, resource: ResourceId) -> Option<&Claim> {
        self.resources
            .get(&resource)
            .and_then(ResourceState::visible_borrow)
    }

    #[must_use]
    pub fn parked_count(&self, resource: ResourceId) -> usize {
        self.resources.get(&resource).map_or(0, |s| s.parked.len())
    }

    #[must_use]
    pub fn snapshot(&self) -> Vec<ClaimSnapshot> {
        let mut claims = Vec::new();
        for (resource, state) in &self.resources {
            if let Some(take) = &state.take {
                claims.push(ClaimSnapshot {
                    resource: *resource,
                    holder: take.holder,
                    kind: ClaimKind::Take,
                    priority: take.priority,
                    visible: true,
                });
            }
            let visible = state.visible_borrow().map(|c| c.holder);
            claims.extend(state.borrows.iter().map(|c| ClaimSnapshot {
                resource: *resource,
                holder: c.holder,
                kind: ClaimKind::Borrow,
                priority: c.priority,
                visible: visible == Some(c.holder),
            }));
        }
        claims
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::protocol::Entity;
    use std::time::Duration;

    fn session() -> Holder {
        Holder::Session(SessionId::new())
    }

    fn take(resource: ResourceId, priority: i64) -> ResourceChange {
        ResourceChange::take(resource, TransferPriority(priority))
    }

    #[tokio::test(start_paused = true)]
    async fn test_take_unheld_resource_is_granted() {
        let mut arbiter = ResourceArbiter::new(ContentionPolicy::Deny);
        let a = session();

        let decision = arbiter.apply(a, &take(ResourceId::MainScreen, 5), Instant::now());

        assert_eq!(decision, Decision::Granted { revoked: vec![] });
        assert_eq!(arbiter.take_holder(ResourceId::MainScreen).unwrap().holder, a);
    }

    #[tokio::test(start_paused = true)]
    async fn test_higher_priority_take_preempts_and_revokes() {
        let mut arbiter = ResourceArbiter::new(ContentionPolicy::Deny);
        let a = session();
        arbiter.apply(a, &take(ResourceId::MainScreen, 5), Instant::now());

        let change = take(ResourceId::MainScreen, 10).with_reason("safety alert");
        let decision = arbiter.apply(Holder::Local, &change, Instant::now());

        let Decision::Granted { revoked } = decision else {
            unreachable!("expected grant, got {decision:?}");
        };
        assert_eq!(revoked.len(), 1);
        let revocation = revoked.first().unwrap();
        assert_eq!(revocation.claim.holder, a);
        assert_eq!(revocation.resource, ResourceId::MainScreen);
        assert_eq!(revocation.reason.as_deref(), Some("safety alert"));
        assert_eq!(
            arbiter.take_holder(ResourceId::MainScreen).unwrap().holder,
            Holder::Local
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_equal_priority_take_is_denied() {
        let mut arbiter = ResourceArbiter::new(ContentionPolicy::Deny);
        let a = session();
        arbiter.apply(a, &take(ResourceId::MainAudio, 100), Instant::now());

        let decision = arbiter.apply(session(), &take(ResourceId::MainAudio, 100), Instant::now());

        assert_eq!(
            decision,
            Decision::Denied(DenyReason::HeldAtHigherPriority {
                holder: a,
                priority: TransferPriority(100),
            })
        );
        assert_eq!(arbiter.take_holder(ResourceId::MainAudio).unwrap().holder, a);
    }

    #[tokio::test(start_paused = true)]
    async fn test_at_most_one_take_holder_under_contention() {
        let mut arbiter = ResourceArbiter::new(ContentionPolicy::Deny);
        let holders: Vec<Holder> = (0..8).map(|_| session()).collect();

        for (i, holder) in holders.iter().enumerate() {
            let priority = i64::try_from(i % 3).unwrap() * 100;
            arbiter.apply(*holder, &take(ResourceId::MainScreen, priority), Instant::now());
            let takes = arbiter
                .snapshot()
                .into_iter()
                .filter(|c| c.resource == ResourceId::MainScreen && c.kind == ClaimKind::Take)
                .count();
            assert_eq!(takes, 1);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_of_unheld_claim_is_noop() {
        let mut arbiter = ResourceArbiter::new(ContentionPolicy::Deny);
        let a = session();
        let b = session();
        arbiter.apply(a, &take(ResourceId::MainScreen, 5), Instant::now());

        let untake = ResourceChange::untake(ResourceId::MainScreen);
        assert_eq!(arbiter.apply(b, &untake, Instant::now()), Decision::NotHeld);
        let unborrow = ResourceChange::unborrow(ResourceId::MainScreen);
        assert_eq!(arbiter.apply(b, &unborrow, Instant::now()), Decision::NotHeld);
        let untouched = ResourceChange::untake(ResourceId::MainAudio);
        assert_eq!(arbiter.apply(b, &untouched, Instant::now()), Decision::NotHeld);

        // The real holder is unaffected
        assert_eq!(arbiter.take_holder(ResourceId::MainScreen).unwrap().holder, a);

        // Releasing twice: second is a no-op
        assert_eq!(
            arbiter.apply(a, &untake, Instant::now()),
            Decision::Released {
                revoked: vec![],
                promoted: None
            }
        );
        assert_eq!(arbiter.apply(a, &untake, Instant::now()), Decision::NotHeld);
    }

    #[tokio::test(start_paused = true)]
    async fn test_borrow_requires_take() {
        let mut arbiter = ResourceArbiter::new(ContentionPolicy::Deny);
        let borrow = ResourceChange::borrow(ResourceId::MainAudio, TransferPriority::NICE_TO_HAVE);

        assert_eq!(
            arbiter.apply(session(), &borrow, Instant::now()),
            Decision::Denied(DenyReason::NoTakeHolder)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_borrow_coexists_and_latest_is_visible() {
        let mut arbiter = ResourceArbiter::new(ContentionPolicy::Deny);
        let owner = session();
        let first = session();
        let second = session();
        arbiter.apply(owner, &take(ResourceId::MainAudio, 100), Instant::now());

        let borrow = ResourceChange::borrow(ResourceId::MainAudio, TransferPriority::NICE_TO_HAVE);
        arbiter.apply(first, &borrow, Instant::now());
        tokio::time::advance(Duration::from_millis(5)).await;
        arbiter.apply(second, &borrow, Instant::now());

        assert_eq!(arbiter.take_holder(ResourceId::MainAudio).unwrap().holder, owner);
        assert_eq!(arbiter.visible_borrower(ResourceId::MainAudio).unwrap().holder, second);

        // The earlier borrower still owns its claim
        let snapshot = arbiter.snapshot();
        assert!(snapshot
            .iter()
            .any(|c| c.holder == first && c.kind == ClaimKind::Borrow && !c.visible));

        // Unborrow by the visible one exposes the earlier one again
        arbiter.apply(second, &ResourceChange::unborrow(ResourceId::MainAudio), Instant::now());
        assert_eq!(arbiter.visible_borrower(ResourceId::MainAudio).unwrap().holder, first);
    }

    #[tokio::test(start_paused = true)]
    async fn test_borrow_tie_has_some_visible_winner() {
        let mut arbiter = ResourceArbiter::new(ContentionPolicy::Deny);
        let first = session();
        let second = session();
        arbiter.apply(session(), &take(ResourceId::MainScreen, 100), Instant::now());

        // Same issue instant: either borrower may be the visible one
        let issued = Instant::now();
        let borrow = ResourceChange::borrow(ResourceId::MainScreen, TransferPriority::NICE_TO_HAVE);
        arbiter.apply(first, &borrow, issued);
        arbiter.apply(second, &borrow, issued);

        let visible = arbiter.visible_borrower(ResourceId::MainScreen).unwrap().holder;
        assert!(visible == first || visible == second);
        let borrows = arbiter
            .snapshot()
            .into_iter()
            .filter(|c| c.kind == ClaimKind::Borrow)
            .count();
        assert_eq!(borrows, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_queued_take_promoted_on_release() {
        let mut arbiter = ResourceArbiter::new(ContentionPolicy::Queue);
        let owner = session();
        let low = session();
        let high = session();
        arbiter.apply(owner, &take(ResourceId::MainScreen, 500), Instant::now());

        let Decision::Queued { ticket: low_ticket, .. } =
            arbiter.apply(low, &take(ResourceId::MainScreen, 100), Instant::now())
        else {
            unreachable!("low take should queue");
        };
        let Decision::Queued { ticket: high_ticket, position } =
            arbiter.apply(high, &take(ResourceId::MainScreen, 300), Instant::now())
        else {
            unreachable!("high take should queue");
        };
        assert_eq!(position, 1);
        assert_eq!(arbiter.parked_count(ResourceId::MainScreen), 2);

        let decision = arbiter.apply(owner, &ResourceChange::untake(ResourceId::MainScreen), Instant::now());
        assert_eq!(
            decision,
            Decision::Released {
                revoked: vec![],
                promoted: Some(Promotion {
                    ticket: high_ticket,
                    resource: ResourceId::MainScreen,
                    holder: high,
                })
            }
        );

        // The lower one can still withdraw
        assert_eq!(
            arbiter.apply(low, &ResourceChange::untake(ResourceId::MainScreen), Instant::now()),
            Decision::Withdrawn { ticket: low_ticket }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_holder_cancels_parked_and_promotes() {
        let mut arbiter = ResourceArbiter::new(ContentionPolicy::Queue);
        let owner = session();
        let waiter = session();
        arbiter.apply(owner, &take(ResourceId::MainScreen, 500), Instant::now());
        arbiter.apply(owner, &take(ResourceId::MainAudio, 500), Instant::now());
        let Decision::Queued { ticket, .. } =
            arbiter.apply(waiter, &take(ResourceId::MainScreen, 100), Instant::now())
        else {
            unreachable!("should queue");
        };
        arbiter.apply(owner, &take(ResourceId::MainAudio, 500), Instant::now());
        arbiter.apply(waiter, &take(ResourceId::MainAudio, 100), Instant::now());

        let release = arbiter.release_holder(waiter);
        assert_eq!(release.cancelled_tickets.len(), 2);
        assert!(release.cancelled_tickets.contains(&ticket));
        assert!(release.released.is_empty());

        let release = arbiter.release_holder(owner);
        assert_eq!(release.released.len(), 2);
        assert!(release.promoted.is_empty());
        assert!(arbiter.take_holder(ResourceId::MainScreen).is_none());
        assert!(arbiter.take_holder(ResourceId::MainAudio).is_none());
    }

    struct PhoneCallOnlyBorrows;

    impl ConstraintPolicy for PhoneCallOnlyBorrows {
        fn still_valid(&self, _resource: ResourceId, claim: &Claim, modes: &ModeState) -> bool {
            claim.kind != ClaimKind::Borrow
                || claim.borrow_constraint != Constraint::USER_INITIATED
                || modes.phone_call.is_some()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_recheck_revokes_lapsed_borrow() {
        let mut arbiter = ResourceArbiter::new(ContentionPolicy::Deny);
        let owner = session();
        let caller = session();
        arbiter.apply(owner, &take(ResourceId::MainAudio, 100), Instant::now());
        let borrow = ResourceChange::borrow(ResourceId::MainAudio, TransferPriority::USER_INITIATED)
            .with_constraints(Constraint::ANYTIME, Constraint::USER_INITIATED);
        arbiter.apply(caller, &borrow, Instant::now());

        let mut modes = ModeState {
            phone_call: Some(Entity::Controller),
            ..ModeState::default()
        };
        assert!(arbiter
            .recheck(caller, &modes, &PhoneCallOnlyBorrows)
            .revoked
            .is_empty());

        modes.phone_call = None;
        // Another holder's modes never touch the caller's borrow
        assert!(arbiter
            .recheck(owner, &modes, &PhoneCallOnlyBorrows)
            .revoked
            .is_empty());
        assert_eq!(arbiter.visible_borrower(ResourceId::MainAudio).unwrap().holder, caller);

        let outcome = arbiter.recheck(caller, &modes, &PhoneCallOnlyBorrows);
        assert_eq!(outcome.revoked.len(), 1);
        assert_eq!(outcome.revoked.first().unwrap().claim.holder, caller);
        assert!(arbiter.visible_borrower(ResourceId::MainAudio).is_none());
        assert_eq!(arbiter.take_holder(ResourceId::MainAudio).unwrap().holder, owner);
    }

    #[tokio::test(start_paused = true)]
    async fn test_untake_revokes_attached_borrows() {
        let mut arbiter = ResourceArbiter::new(ContentionPolicy::Deny);
        let owner = session();
        let borrower = session();
        arbiter.apply(owner, &take(ResourceId::MainAudio, 100), Instant::now());
        let borrow = ResourceChange::borrow(ResourceId::MainAudio, TransferPriority::NICE_TO_HAVE);
        arbiter.apply(borrower, &borrow, Instant::now());

        let decision = arbiter.apply(owner, &ResourceChange::untake(ResourceId::MainAudio), Instant::now());

        let Decision::Released { revoked, promoted } = decision else {
            unreachable!("expected release, got {decision:?}");
        };
        assert!(promoted.is_none());
        assert_eq!(revoked.len(), 1);
        let revocation = revoked.first().unwrap();
        assert_eq!(revocation.claim.holder, borrower);
        assert_eq!(revocation.claim.kind, ClaimKind::Borrow);
        assert!(arbiter.take_holder(ResourceId::MainAudio).is_none());
        assert!(arbiter.visible_borrower(ResourceId::MainAudio).is_none());

        // The revoked borrower has nothing left to give back
        assert_eq!(
            arbiter.apply(borrower, &ResourceChange::unborrow(ResourceId::MainAudio), Instant::now()),
            Decision::NotHeld
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_holder_revokes_borrows_on_its_takes() {
        let mut arbiter = ResourceArbiter::new(ContentionPolicy::Deny);
        let owner = session();
        let borrower = session();
        arbiter.apply(owner, &take(ResourceId::MainScreen, 100), Instant::now());
        arbiter.apply(borrower, &take(ResourceId::MainAudio, 100), Instant::now());
        let borrow = ResourceChange::borrow(ResourceId::MainScreen, TransferPriority::NICE_TO_HAVE);
        arbiter.apply(borrower, &borrow, Instant::now());
        // The owner's own borrow on someone else's Take is simply released
        let borrow_audio = ResourceChange::borrow(ResourceId::MainAudio, TransferPriority::NICE_TO_HAVE);
        arbiter.apply(owner, &borrow_audio, Instant::now());

        let release = arbiter.release_holder(owner);

        assert_eq!(
            release.released,
            vec![
                (ResourceId::MainScreen, ClaimKind::Take),
                (ResourceId::MainAudio, ClaimKind::Borrow)
            ]
        );
        assert_eq!(release.revoked.len(), 1);
        let revocation = release.revoked.first().unwrap();
        assert_eq!(revocation.claim.holder, borrower);
        assert_eq!(revocation.resource, ResourceId::MainScreen);
        assert!(arbiter.visible_borrower(ResourceId::MainScreen).is_none());
        assert!(arbiter.visible_borrower(ResourceId::MainAudio).is_none());
        assert_eq!(arbiter.take_holder(ResourceId::MainAudio).unwrap().holder, borrower);
    }

    struct NoTakeDuringPhoneCall;

    impl ConstraintPolicy for NoTakeDuringPhoneCall {
        fn still_valid(&self, _resource: ResourceId, claim: &Claim, modes: &ModeState) -> bool {
            claim.kind != ClaimKind::Take || modes.phone_call.is_none()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_recheck_only_touches_reporting_holder() {
        let mut arbiter = ResourceArbiter::new(ContentionPolicy::Deny);
        let a = session();
        let b = session();
        let borrower = session();
        arbiter.apply(a, &take(ResourceId::MainAudio, 100), Instant::now());
        arbiter.apply(b, &take(ResourceId::MainScreen, 100), Instant::now());
        let borrow = ResourceChange::borrow(ResourceId::MainAudio, TransferPriority::NICE_TO_HAVE);
        arbiter.apply(borrower, &borrow, Instant::now());

        let on_call = ModeState {
            phone_call: Some(Entity::Controller),
            ..ModeState::default()
        };
        let outcome = arbiter.recheck(b, &on_call, &NoTakeDuringPhoneCall);
        assert_eq!(outcome.revoked.len(), 1);
        assert_eq!(outcome.revoked.first().unwrap().claim.holder, b);
        assert_eq!(arbiter.take_holder(ResourceId::MainAudio).unwrap().holder, a);
        assert!(arbiter.take_holder(ResourceId::MainScreen).is_none());

        // A's Take lapses and takes the borrow on it along
        let outcome = arbiter.recheck(a, &on_call, &NoTakeDuringPhoneCall);
        let holders: Vec<Holder> = outcome.revoked.iter().map(|r| r.claim.holder).collect();
        assert_eq!(holders, vec![a, borrower]);
        assert!(arbiter.take_holder(ResourceId::MainAudio).is_none());
        assert!(arbiter.visible_borrower(ResourceId::MainAudio).is_none());
    }

    #[test]
    fn test_outcome_value_conversion() {
        let holder = Holder::Session(SessionId::new());
        for outcome in [
            ResourceOutcome::Granted,
            ResourceOutcome::Denied { holder: Some(holder) },
            ResourceOutcome::Denied {
                holder: Some(Holder::Local),
            },
            ResourceOutcome::Denied { holder: None },
            ResourceOutcome::Queued,
            ResourceOutcome::Released,
            ResourceOutcome::NotHeld,
        ] {
            assert_eq!(ResourceOutcome::from_value(&outcome.to_value()).unwrap(), outcome);
        }
    }
}
