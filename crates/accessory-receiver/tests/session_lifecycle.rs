//! Session lifecycle through a running server.
//!
//! Each test spawns a real `ServerActor` against the mocks in
//! `receiver-test-utils` and drives sessions from authentication to
//! teardown.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use accessory_receiver::actors::{Dispatcher, SessionState};
use accessory_receiver::errors::{ReceiverError, STATUS_OK};
use accessory_receiver::protocol::{commands, keys, properties, AppStateId, Entity, StreamType};
use accessory_receiver::value::{Dict, DictExt, Value};
use receiver_test_utils::{stream_setup, wait_for, SessionCall, TestReceiver};
use std::time::Duration;
use tokio::time::Instant;

#[tokio::test]
async fn test_session_reaches_active_and_reports_timing() {
    let receiver = TestReceiver::builder().build();
    receiver.server.start().await.unwrap();

    let session = receiver.connect().await;
    assert_eq!(
        session.handle.status().await.unwrap().state,
        SessionState::Authenticated
    );
    assert_eq!(receiver.metrics.session_count(), 1);

    session.activate().await;

    let status = session.handle.status().await.unwrap();
    assert_eq!(status.state, SessionState::Active);
    assert_eq!(status.streams, vec![StreamType::Screen]);
    assert_eq!(
        session.delegate.calls(),
        vec![
            SessionCall::Initialize,
            SessionCall::SetupStream(StreamType::Screen),
            SessionCall::Started,
        ]
    );

    let timing = session
        .handle
        .get_property(properties::TIMESTAMP_INFO)
        .await
        .unwrap();
    let timing = timing.as_dict().unwrap();
    for phase in ["bonjourMs", "authMs", "announceMs", "setupScreenMs", "recordMs", "totalMs"] {
        assert!(timing.contains_key(phase), "missing phase {phase}");
    }
    // No audio stream was configured
    assert!(!timing.contains_key("setupAudioMs"));

    receiver.shutdown().await;
}

#[tokio::test]
async fn test_controller_teardown_removes_session() {
    let receiver = TestReceiver::builder().build();
    receiver.server.start().await.unwrap();
    let session = receiver.connect_active().await;
    let id = session.handle.id();

    assert!(session.handle.tear_down(&[], Some("user")).await.unwrap());
    // A second teardown is harmless
    assert!(session.handle.tear_down(&[], None).await.unwrap());

    wait_for(|| receiver.delegate.has_ended(id)).await;
    assert_eq!(session.delegate.finalized(), 1);
    assert!(receiver.server.session(id).await.unwrap().is_none());

    let ended = receiver.delegate.ended();
    assert_eq!(ended.len(), 1);
    assert_eq!(ended.first().unwrap().1, None);
    assert_eq!(receiver.metrics.session_count(), 0);

    receiver.shutdown().await;
}

#[tokio::test]
async fn test_partial_teardown_keeps_session_active() {
    let receiver = TestReceiver::builder().build();
    receiver.server.start().await.unwrap();
    let session = receiver.connect().await;
    session
        .activate_with(&[StreamType::Screen, StreamType::MainAudio])
        .await;
    assert_eq!(
        receiver.server.status().await.unwrap().audio_owner,
        Some(session.handle.id())
    );

    let done = session
        .handle
        .tear_down(&[StreamType::MainAudio], None)
        .await
        .unwrap();
    assert!(!done);

    let status = session.handle.status().await.unwrap();
    assert_eq!(status.state, SessionState::Active);
    assert_eq!(status.streams, vec![StreamType::Screen]);
    assert_eq!(session.delegate.finalized(), 0);

    // Dropping the last audio stream gives up audio ownership
    assert_eq!(receiver.server.status().await.unwrap().audio_owner, None);

    receiver.shutdown().await;
}

#[tokio::test]
async fn test_requests_out_of_order_are_not_ready() {
    let receiver = TestReceiver::builder().build();
    receiver.server.start().await.unwrap();
    let session = receiver.connect().await;

    assert!(matches!(
        session.handle.record().await,
        Err(ReceiverError::NotReady(_))
    ));
    assert!(matches!(
        session.handle.set_night_mode(true).await,
        Err(ReceiverError::NotReady(_))
    ));
    session.handle.set_up_streams(Dict::new()).await.unwrap();
    assert!(matches!(
        session.handle.start(Dict::new()).await,
        Err(ReceiverError::NotReady(_))
    ));

    receiver.shutdown().await;
}

#[tokio::test]
async fn test_outbound_command_completes_on_controller_reply() {
    let receiver = TestReceiver::builder().build();
    receiver.server.start().await.unwrap();
    let session = receiver.connect_active().await;

    let handle = session.handle.clone();
    let call = tokio::spawn(async move { handle.set_night_mode(true).await });

    let sent = session.link.wait_for_command(commands::SET_NIGHT_MODE).await;
    assert_eq!(sent.params.bool_field(keys::NIGHT_MODE), Some(true));

    let reply = Dict::from([
        (keys::STATUS.to_string(), Value::from(STATUS_OK)),
        ("applied".to_string(), Value::from(true)),
    ]);
    session
        .handle
        .controller_reply(sent.transaction, reply)
        .await
        .unwrap();

    let response = call.await.unwrap().unwrap();
    assert_eq!(response.bool_field("applied"), Some(true));
    assert_eq!(session.handle.status().await.unwrap().pending_commands, 0);

    receiver.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_unanswered_command_times_out() {
    let receiver = TestReceiver::builder().build();
    receiver.server.start().await.unwrap();
    let session = receiver.connect_active().await;

    let started = Instant::now();
    let result = session.handle.set_phone_call(true).await;
    assert!(matches!(result, Err(ReceiverError::Timeout(_))));
    assert!(started.elapsed() >= Duration::from_millis(500));

    // The session survives a timeout
    assert_eq!(
        session.handle.status().await.unwrap().state,
        SessionState::Active
    );

    // A reply after the deadline is dropped
    let sent = session.link.commands().first().cloned().unwrap();
    session
        .handle
        .controller_reply(sent.transaction, Dict::new())
        .await
        .unwrap();
    assert_eq!(session.handle.status().await.unwrap().pending_commands, 0);

    receiver.shutdown().await;
}

#[tokio::test]
async fn test_transport_failure_cancels_pending_and_tears_down() {
    let receiver = TestReceiver::builder().build();
    receiver.server.start().await.unwrap();
    let session = receiver.connect_active().await;
    let id = session.handle.id();

    let handle = session.handle.clone();
    let call = tokio::spawn(async move { handle.force_key_frame().await });
    session.link.wait_for_command(commands::FORCE_KEY_FRAME).await;

    session
        .handle
        .transport_failed(ReceiverError::NotReady("connection reset".to_string()))
        .await
        .unwrap();

    assert_eq!(call.await.unwrap(), Err(ReceiverError::Cancelled));
    wait_for(|| receiver.delegate.has_ended(id)).await;
    assert_eq!(session.delegate.finalized(), 1);

    let ended = receiver.delegate.ended();
    assert!(matches!(
        ended.first().unwrap().1,
        Some(ReceiverError::NotReady(_))
    ));

    receiver.shutdown().await;
}

#[tokio::test]
async fn test_modes_changed_event_updates_session_modes() {
    let receiver = TestReceiver::builder().build();
    receiver.server.start().await.unwrap();
    let session = receiver.connect_active().await;

    let params = Dict::from([(
        keys::APP_STATES.to_string(),
        Value::Array(vec![Value::Dict(Dict::from([
            (keys::APP_STATE_ID.to_string(), AppStateId::PhoneCall.into()),
            (keys::ENTITY.to_string(), Entity::Controller.into()),
        ]))]),
    )]);
    session
        .handle
        .send_event(commands::MODES_CHANGED, params)
        .await
        .unwrap();

    let modes = session.handle.get_property(properties::MODES).await.unwrap();
    assert_eq!(
        modes.as_dict().unwrap().get("phoneCall"),
        Some(&Value::from(Entity::Controller))
    );
    assert_eq!(
        session
            .delegate
            .count(|c| matches!(c, SessionCall::ModesChanged(m) if m.phone_call == Some(Entity::Controller))),
        1
    );

    receiver.shutdown().await;
}

#[tokio::test]
async fn test_flush_audio_reports_last_held_timestamp() {
    let receiver = TestReceiver::builder().build();
    receiver.server.start().await.unwrap();
    let session = receiver.connect().await;
    session.activate_with(&[StreamType::MainAudio]).await;

    let frame = [0x11_u8; 4];
    for n in 0..8_u32 {
        session
            .handle
            .write_audio(StreamType::MainAudio, n, u64::from(n), &frame)
            .unwrap();
    }

    // Frames before 4 are dropped; the rings still hold up to 7
    let last = session.handle.flush_audio(4, None).await.unwrap();
    assert_eq!(last, 7);

    receiver.shutdown().await;
}

#[tokio::test]
async fn test_stream_setup_rejected_for_unknown_type() {
    let receiver = TestReceiver::builder().build();
    receiver.server.start().await.unwrap();
    let session = receiver.connect().await;
    session.handle.set_up_streams(Dict::new()).await.unwrap();

    let mut setup = stream_setup(&[StreamType::Screen]);
    setup.insert(
        keys::STREAMS.to_string(),
        Value::Array(vec![Value::Dict(Dict::from([(
            keys::TYPE.to_string(),
            Value::from(9999_i64),
        )]))]),
    );
    assert!(matches!(
        session.handle.set_up_streams(setup).await,
        Err(ReceiverError::InvalidParameter(_))
    ));
    assert_eq!(
        session.handle.status().await.unwrap().state,
        SessionState::Announced
    );

    receiver.shutdown().await;
}
