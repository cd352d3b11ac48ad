//! Take/Borrow arbitration across sessions and the accessory itself.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use accessory_receiver::actors::Dispatcher;
use accessory_receiver::arbiter::{Claim, ClaimKind, ConstraintPolicy, Holder, ResourceOutcome};
use accessory_receiver::config::ContentionPolicy;
use accessory_receiver::protocol::{
    commands, keys, AppStateId, Constraint, Entity, ModeState, ResourceChange, ResourceId,
    TransferPriority, TransferType,
};
use accessory_receiver::value::{Dict, DictExt, Value};
use receiver_test_utils::{test_config, wait_for, TestReceiver};
use std::sync::Arc;

const LOW: TransferPriority = TransferPriority::NICE_TO_HAVE;
const HIGH: TransferPriority = TransferPriority::USER_INITIATED;

fn queueing_receiver() -> TestReceiver {
    let mut config = test_config();
    config.contention = ContentionPolicy::Queue;
    TestReceiver::builder().config(config).build()
}

/// Revokes user-initiated Takes while the controller owns a phone call.
struct PhoneCallRevokes;

impl ConstraintPolicy for PhoneCallRevokes {
    fn still_valid(&self, _resource: ResourceId, claim: &Claim, modes: &ModeState) -> bool {
        !(claim.take_constraint == Constraint::USER_INITIATED
            && modes.phone_call == Some(Entity::Controller))
    }
}

#[tokio::test]
async fn test_higher_priority_take_revokes_holder_before_grant() {
    let receiver = TestReceiver::builder().build();
    receiver.server.start().await.unwrap();
    let a = receiver.connect_active().await;
    let b = receiver.connect_active().await;

    assert_eq!(
        a.handle.take_resource(ResourceId::MainScreen, LOW).await.unwrap(),
        ResourceOutcome::Granted
    );

    let change = ResourceChange::take(ResourceId::MainScreen, HIGH).with_reason("navigation");
    assert_eq!(
        b.handle.change_resource_mode(&change).await.unwrap(),
        ResourceOutcome::Granted
    );

    // A heard about it before B's grant came back
    let revocations = a.delegate.revocations();
    assert_eq!(revocations.len(), 1);
    let revocation = revocations.first().unwrap();
    assert_eq!(revocation.resource, ResourceId::MainScreen);
    assert_eq!(revocation.claim.kind, ClaimKind::Take);
    assert_eq!(revocation.reason.as_deref(), Some("navigation"));

    let events = a.link.events_named(commands::CHANGE_MODES);
    assert_eq!(events.len(), 1);
    let event = events.first().unwrap();
    assert_eq!(event.int_field(keys::GRACE_MS), Some(250));
    assert_eq!(event.str_field(keys::REASON), Some("navigation"));

    let status = receiver.server.status().await.unwrap();
    let holders: Vec<_> = status
        .claims
        .iter()
        .filter(|c| c.resource == ResourceId::MainScreen && c.kind == ClaimKind::Take)
        .map(|c| c.holder)
        .collect();
    assert_eq!(holders, vec![Holder::Session(b.handle.id())]);

    assert!(a.handle.status().await.unwrap().claims.is_empty());
    assert_eq!(
        b.handle.status().await.unwrap().claims,
        vec![(ResourceId::MainScreen, ClaimKind::Take)]
    );

    receiver.shutdown().await;
}

#[tokio::test]
async fn test_equal_priority_take_is_denied_naming_holder() {
    let receiver = TestReceiver::builder().build();
    receiver.server.start().await.unwrap();
    let a = receiver.connect_active().await;
    let b = receiver.connect_active().await;

    a.handle.take_resource(ResourceId::MainAudio, HIGH).await.unwrap();
    assert_eq!(
        b.handle.take_resource(ResourceId::MainAudio, HIGH).await.unwrap(),
        ResourceOutcome::Denied {
            holder: Some(Holder::Session(a.handle.id()))
        }
    );
    assert_eq!(
        b.handle.take_resource(ResourceId::MainAudio, LOW).await.unwrap(),
        ResourceOutcome::Denied {
            holder: Some(Holder::Session(a.handle.id()))
        }
    );
    assert!(a.delegate.revocations().is_empty());
    assert!(b.handle.status().await.unwrap().claims.is_empty());

    receiver.shutdown().await;
}

#[tokio::test]
async fn test_local_take_preempts_session() {
    let receiver = TestReceiver::builder().build();
    receiver.server.start().await.unwrap();
    let a = receiver.connect_active().await;

    a.handle.take_resource(ResourceId::MainScreen, LOW).await.unwrap();

    let change = ResourceChange::take(ResourceId::MainScreen, HIGH).with_reason("reverse camera");
    assert_eq!(
        receiver.server.change_resource_mode(&change).await.unwrap(),
        ResourceOutcome::Granted
    );
    assert_eq!(a.delegate.revocations().len(), 1);

    // The session cannot take it back at the same priority
    assert_eq!(
        a.handle.take_resource(ResourceId::MainScreen, HIGH).await.unwrap(),
        ResourceOutcome::Denied {
            holder: Some(Holder::Local)
        }
    );

    assert_eq!(
        receiver.server.untake_resource(ResourceId::MainScreen).await.unwrap(),
        ResourceOutcome::Released
    );
    assert_eq!(
        a.handle.take_resource(ResourceId::MainScreen, LOW).await.unwrap(),
        ResourceOutcome::Granted
    );

    receiver.shutdown().await;
}

#[tokio::test]
async fn test_session_take_revokes_local_holder() {
    let receiver = TestReceiver::builder().build();
    receiver.server.start().await.unwrap();
    let a = receiver.connect_active().await;

    receiver
        .server
        .take_resource(ResourceId::MainAudio, LOW)
        .await
        .unwrap();
    assert_eq!(
        a.handle.take_resource(ResourceId::MainAudio, HIGH).await.unwrap(),
        ResourceOutcome::Granted
    );

    let revoked = receiver.delegate.revoked();
    assert_eq!(revoked.len(), 1);
    assert_eq!(revoked.first().unwrap().claim.holder, Holder::Local);

    receiver.shutdown().await;
}

#[tokio::test]
async fn test_borrow_needs_take_and_leaves_it_in_place() {
    let receiver = TestReceiver::builder().build();
    receiver.server.start().await.unwrap();
    let a = receiver.connect_active().await;
    let b = receiver.connect_active().await;

    assert_eq!(
        b.handle.borrow_resource(ResourceId::MainScreen, HIGH).await.unwrap(),
        ResourceOutcome::Denied { holder: None }
    );

    a.handle.take_resource(ResourceId::MainScreen, LOW).await.unwrap();
    assert_eq!(
        b.handle.borrow_resource(ResourceId::MainScreen, HIGH).await.unwrap(),
        ResourceOutcome::Granted
    );
    assert!(a.delegate.revocations().is_empty());

    let claims = receiver.server.status().await.unwrap().claims;
    assert!(claims
        .iter()
        .any(|c| c.holder == Holder::Session(a.handle.id()) && c.kind == ClaimKind::Take));
    assert!(claims.iter().any(|c| c.holder == Holder::Session(b.handle.id())
        && c.kind == ClaimKind::Borrow
        && c.visible));

    assert_eq!(
        b.handle.unborrow_resource(ResourceId::MainScreen).await.unwrap(),
        ResourceOutcome::Released
    );
    assert_eq!(
        b.handle.unborrow_resource(ResourceId::MainScreen).await.unwrap(),
        ResourceOutcome::NotHeld
    );

    receiver.shutdown().await;
}

#[tokio::test]
async fn test_untake_revokes_borrows_riding_on_it() {
    let receiver = TestReceiver::builder().build();
    receiver.server.start().await.unwrap();
    let a = receiver.connect_active().await;
    let b = receiver.connect_active().await;

    a.handle.take_resource(ResourceId::MainScreen, LOW).await.unwrap();
    b.handle.borrow_resource(ResourceId::MainScreen, HIGH).await.unwrap();

    assert_eq!(
        a.handle.untake_resource(ResourceId::MainScreen).await.unwrap(),
        ResourceOutcome::Released
    );
    wait_for(|| !b.delegate.revocations().is_empty()).await;
    let revocations = b.delegate.revocations();
    let revocation = revocations.first().unwrap();
    assert_eq!(revocation.resource, ResourceId::MainScreen);
    assert_eq!(revocation.claim.kind, ClaimKind::Borrow);
    assert_eq!(revocation.reason.as_deref(), Some("take released"));

    assert!(receiver.server.status().await.unwrap().claims.is_empty());
    assert!(b.handle.status().await.unwrap().claims.is_empty());

    receiver.shutdown().await;
}

#[tokio::test]
async fn test_releasing_unheld_claims_is_harmless() {
    let receiver = TestReceiver::builder().build();
    receiver.server.start().await.unwrap();
    let a = receiver.connect_active().await;

    assert_eq!(
        a.handle.untake_resource(ResourceId::MainAudio).await.unwrap(),
        ResourceOutcome::NotHeld
    );
    assert_eq!(
        a.handle.unborrow_resource(ResourceId::MainScreen).await.unwrap(),
        ResourceOutcome::NotHeld
    );

    receiver.shutdown().await;
}

#[tokio::test]
async fn test_resource_change_before_active_is_not_ready() {
    let receiver = TestReceiver::builder().build();
    receiver.server.start().await.unwrap();
    let a = receiver.connect().await;

    assert!(a
        .handle
        .take_resource(ResourceId::MainScreen, LOW)
        .await
        .is_err());
    assert!(receiver.server.status().await.unwrap().claims.is_empty());

    receiver.shutdown().await;
}

#[tokio::test]
async fn test_queued_take_promoted_on_untake() {
    let receiver = queueing_receiver();
    receiver.server.start().await.unwrap();
    let a = receiver.connect_active().await;
    let b = receiver.connect_active().await;

    a.handle.take_resource(ResourceId::MainScreen, HIGH).await.unwrap();

    let handle = b.handle.clone();
    let parked = tokio::spawn(async move { handle.take_resource(ResourceId::MainScreen, LOW).await });
    loop {
        if receiver.server.status().await.unwrap().parked_takes == 1 {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(1)).await;
    }
    assert!(!parked.is_finished());

    assert_eq!(
        a.handle.untake_resource(ResourceId::MainScreen).await.unwrap(),
        ResourceOutcome::Released
    );
    assert_eq!(parked.await.unwrap().unwrap(), ResourceOutcome::Granted);
    assert_eq!(
        b.handle.status().await.unwrap().claims,
        vec![(ResourceId::MainScreen, ClaimKind::Take)]
    );
    assert_eq!(receiver.server.status().await.unwrap().parked_takes, 0);

    receiver.shutdown().await;
}

#[tokio::test]
async fn test_session_end_releases_claims_and_promotes() {
    let receiver = queueing_receiver();
    receiver.server.start().await.unwrap();
    let a = receiver.connect_active().await;
    let b = receiver.connect_active().await;
    let a_id = a.handle.id();

    a.handle.take_resource(ResourceId::MainAudio, HIGH).await.unwrap();

    let handle = b.handle.clone();
    let parked = tokio::spawn(async move { handle.take_resource(ResourceId::MainAudio, LOW).await });
    loop {
        if receiver.server.status().await.unwrap().parked_takes == 1 {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(1)).await;
    }

    a.handle.tear_down(&[], None).await.unwrap();
    wait_for(|| receiver.delegate.has_ended(a_id)).await;

    assert_eq!(parked.await.unwrap().unwrap(), ResourceOutcome::Granted);
    let claims = receiver.server.status().await.unwrap().claims;
    assert_eq!(claims.len(), 1);
    assert_eq!(
        claims.first().unwrap().holder,
        Holder::Session(b.handle.id())
    );

    receiver.shutdown().await;
}

#[tokio::test]
async fn test_modes_change_revokes_claims_failing_constraints() {
    let receiver = TestReceiver::builder()
        .constraint_policy(Arc::new(PhoneCallRevokes))
        .build();
    receiver.server.start().await.unwrap();
    let a = receiver.connect_active().await;

    let guarded = ResourceChange::take(ResourceId::MainAudio, LOW)
        .with_constraints(Constraint::USER_INITIATED, Constraint::NOT_APPLICABLE);
    a.handle.change_resource_mode(&guarded).await.unwrap();
    let anytime = ResourceChange::take(ResourceId::MainScreen, LOW)
        .with_constraints(Constraint::ANYTIME, Constraint::NOT_APPLICABLE);
    a.handle.change_resource_mode(&anytime).await.unwrap();

    let params = Dict::from([(
        keys::APP_STATES.to_string(),
        Value::Array(vec![Value::Dict(Dict::from([
            (keys::APP_STATE_ID.to_string(), AppStateId::PhoneCall.into()),
            (keys::ENTITY.to_string(), Entity::Controller.into()),
        ]))]),
    )]);
    a.handle
        .send_event(commands::MODES_CHANGED, params)
        .await
        .unwrap();

    wait_for(|| !a.delegate.revocations().is_empty()).await;
    let revocations = a.delegate.revocations();
    assert_eq!(revocations.len(), 1);
    let revocation = revocations.first().unwrap();
    assert_eq!(revocation.resource, ResourceId::MainAudio);
    assert_eq!(
        revocation.reason.as_deref(),
        Some("constraint no longer satisfied")
    );

    let event = a
        .link
        .wait_for_events(commands::CHANGE_MODES, 1)
        .await
        .into_iter()
        .next()
        .unwrap();
    let released = event.array_field(keys::RESOURCES).unwrap();
    let released = released.first().and_then(Value::as_dict).unwrap();
    assert_eq!(
        released.int_field(keys::TRANSFER_TYPE),
        Some(TransferType::Untake.as_i64())
    );

    assert_eq!(
        a.handle.status().await.unwrap().claims,
        vec![(ResourceId::MainScreen, ClaimKind::Take)]
    );

    receiver.shutdown().await;
}

#[tokio::test]
async fn test_modes_change_rechecks_only_reporting_session() {
    let receiver = TestReceiver::builder()
        .constraint_policy(Arc::new(PhoneCallRevokes))
        .build();
    receiver.server.start().await.unwrap();
    let a = receiver.connect_active().await;
    let b = receiver.connect_active().await;

    let guarded_audio = ResourceChange::take(ResourceId::MainAudio, LOW)
        .with_constraints(Constraint::USER_INITIATED, Constraint::NOT_APPLICABLE);
    a.handle.change_resource_mode(&guarded_audio).await.unwrap();
    let guarded_screen = ResourceChange::take(ResourceId::MainScreen, LOW)
        .with_constraints(Constraint::USER_INITIATED, Constraint::NOT_APPLICABLE);
    b.handle.change_resource_mode(&guarded_screen).await.unwrap();

    // Only b's controller reports the phone call
    let params = Dict::from([(
        keys::APP_STATES.to_string(),
        Value::Array(vec![Value::Dict(Dict::from([
            (keys::APP_STATE_ID.to_string(), AppStateId::PhoneCall.into()),
            (keys::ENTITY.to_string(), Entity::Controller.into()),
        ]))]),
    )]);
    b.handle
        .send_event(commands::MODES_CHANGED, params)
        .await
        .unwrap();

    wait_for(|| !b.delegate.revocations().is_empty()).await;
    let revocations = b.delegate.revocations();
    assert_eq!(revocations.len(), 1);
    assert_eq!(revocations.first().unwrap().resource, ResourceId::MainScreen);

    assert!(a.delegate.revocations().is_empty());
    assert_eq!(
        a.handle.status().await.unwrap().claims,
        vec![(ResourceId::MainAudio, ClaimKind::Take)]
    );
    let claims = receiver.server.status().await.unwrap().claims;
    assert_eq!(claims.len(), 1);
    assert_eq!(claims.first().unwrap().holder, Holder::Session(a.handle.id()));

    receiver.shutdown().await;
}
