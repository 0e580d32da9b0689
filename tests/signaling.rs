//! Relay behaviour over real WebSocket connections.

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use prostream_hub::client::SignalClient;
use prostream_hub::handlers::serve_signaling;
use prostream_hub::models::{kind, JoinRequest, Role, SignalMessage, SlotId, WireMessage};
use prostream_hub::registry::SessionRegistry;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::time::{sleep, timeout};

struct Hub {
    url: String,
    registry: Arc<SessionRegistry>,
}

async fn hub() -> Hub {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let registry = Arc::new(SessionRegistry::new(Duration::from_secs(60)));
    tokio::spawn(serve_signaling(listener, registry.clone()));
    Hub {
        url: format!("ws://{}", addr),
        registry,
    }
}

async fn wait_for_count(hub: &Hub, session: &str, count: usize) {
    for _ in 0..200 {
        if hub.registry.participant_count(session) == count {
            return;
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("session {} never reached {} participants", session, count);
}

async fn join(hub: &Hub, session: &str, role: Role, slot: Option<&str>) -> SignalClient {
    let client = SignalClient::connect(&hub.url).await.unwrap();
    let expected = hub.registry.participant_count(session) + 1;
    client
        .outbound
        .unbounded_send(WireMessage::Join(JoinRequest {
            session_id: session.to_string(),
            role,
            slot_id: slot.map(SlotId::from),
        }))
        .unwrap();
    wait_for_count(hub, session, expected).await;
    client
}

fn send(client: &SignalClient, signal: SignalMessage) {
    client.outbound.unbounded_send(WireMessage::Signal(signal)).unwrap();
}

async fn next(client: &mut SignalClient) -> SignalMessage {
    timeout(Duration::from_secs(2), client.inbound.next())
        .await
        .expect("timed out waiting for a signal")
        .expect("signaling stream closed")
}

async fn assert_silent(client: &mut SignalClient) {
    let received = timeout(Duration::from_millis(150), client.inbound.next()).await;
    assert!(received.is_err(), "unexpected signal: {:?}", received);
}

#[tokio::test]
async fn offer_answer_between_camera_and_controller() {
    let hub = hub().await;
    let mut camera = join(&hub, "abc", Role::Camera, Some("1")).await;
    let mut controller = join(&hub, "abc", Role::Controller, None).await;
    let mut elsewhere = join(&hub, "xyz", Role::Controller, None).await;

    send(
        &camera,
        SignalMessage::new("abc", kind::WEBRTC_OFFER)
            .slot("1")
            .payload(json!({"type": "offer", "sdp": "v=0"}))
            .target(Role::Controller),
    );

    let offer = next(&mut controller).await;
    assert_eq!(offer.kind, kind::WEBRTC_OFFER);
    assert_eq!(offer.slot_id, Some(SlotId::from(1)));
    assert_eq!(offer.payload, Some(json!({"type": "offer", "sdp": "v=0"})));
    assert_silent(&mut controller).await;

    send(
        &controller,
        SignalMessage::new("abc", kind::WEBRTC_ANSWER)
            .slot("1")
            .payload(json!({"type": "answer", "sdp": "v=0"}))
            .target(Role::Camera),
    );

    let answer = next(&mut camera).await;
    assert_eq!(answer.kind, kind::WEBRTC_ANSWER);
    assert_eq!(answer.target, Some(Role::Camera));
    assert_silent(&mut elsewhere).await;
}

#[tokio::test]
async fn sessions_sharing_a_suffix_stay_apart() {
    let hub = hub().await;
    let controller = join(&hub, "alpha:abc", Role::Controller, None).await;
    let mut same = join(&hub, "alpha:abc", Role::Display, None).await;
    let mut other = join(&hub, "beta:abc", Role::Display, None).await;

    send(&controller, SignalMessage::new("alpha:abc", "ping"));

    let received = next(&mut same).await;
    assert_eq!(received.session_id.as_deref(), Some("alpha:abc"));
    assert_silent(&mut other).await;
}

#[tokio::test]
async fn targeted_signal_skips_other_roles() {
    let hub = hub().await;
    let camera = join(&hub, "abc", Role::Camera, Some("1")).await;
    let mut controller = join(&hub, "abc", Role::Controller, None).await;
    let mut display = join(&hub, "abc", Role::Display, None).await;

    send(
        &camera,
        SignalMessage::new("abc", kind::WEBRTC_CANDIDATE)
            .slot("1")
            .payload(json!({"candidate": "c"}))
            .target(Role::Controller),
    );

    assert_eq!(next(&mut controller).await.kind, kind::WEBRTC_CANDIDATE);
    assert_silent(&mut display).await;
}

#[tokio::test]
async fn broadcast_reaches_everyone_but_the_sender_once() {
    let hub = hub().await;
    let mut controller = join(&hub, "abc", Role::Controller, None).await;
    let mut camera = join(&hub, "abc", Role::Camera, Some("2")).await;
    let mut display = join(&hub, "abc", Role::Display, None).await;

    send(
        &controller,
        SignalMessage::new("abc", kind::STATE_UPDATE).payload(json!({"activeCamera": 2})),
    );

    assert_eq!(next(&mut camera).await.kind, kind::STATE_UPDATE);
    assert_eq!(next(&mut display).await.kind, kind::STATE_UPDATE);
    assert_silent(&mut camera).await;
    assert_silent(&mut display).await;
    assert_silent(&mut controller).await;
}

#[tokio::test]
async fn late_display_gets_the_last_state() {
    let hub = hub().await;
    let controller = join(&hub, "abc", Role::Controller, None).await;
    let mut early = join(&hub, "abc", Role::Display, None).await;

    let state = json!({
        "activeCamera": 1,
        "lowerThird": { "isVisible": true, "mainText": "Welcome" }
    });
    send(
        &controller,
        SignalMessage::new("abc", kind::STATE_UPDATE).payload(state.clone()),
    );
    assert_eq!(next(&mut early).await.payload, Some(state.clone()));

    let mut late = join(&hub, "abc", Role::Display, None).await;
    let replay = next(&mut late).await;
    assert_eq!(replay.kind, kind::STATE_UPDATE);
    assert_eq!(replay.payload, Some(state));
}

#[tokio::test]
async fn disconnect_is_announced_to_the_room() {
    let hub = hub().await;
    let mut controller = join(&hub, "abc", Role::Controller, None).await;
    let camera = join(&hub, "abc", Role::Camera, Some("3")).await;

    drop(camera.outbound);
    let notice = next(&mut controller).await;
    assert_eq!(notice.kind, kind::PARTICIPANT_LEFT);
    assert_eq!(notice.slot_id, Some(SlotId::from(3)));
    assert_eq!(notice.payload, Some(json!({"role": "camera"})));
    wait_for_count(&hub, "abc", 1).await;
}

#[tokio::test]
async fn malformed_frames_do_not_disturb_the_room() {
    let hub = hub().await;
    let camera = join(&hub, "abc", Role::Camera, Some("1")).await;
    let mut controller = join(&hub, "abc", Role::Controller, None).await;

    let mut missing_session = SignalMessage::new("", kind::WEBRTC_OFFER).target(Role::Controller);
    missing_session.session_id = None;
    send(&camera, missing_session);
    send(
        &camera,
        SignalMessage::new("abc", kind::CAMERA_DISCONNECTED).slot("1"),
    );

    let relayed = next(&mut controller).await;
    assert_eq!(relayed.kind, kind::CAMERA_DISCONNECTED);
    assert_eq!(hub.registry.participant_count("abc"), 2);
}
