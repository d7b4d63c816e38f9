use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::audio;
use crate::config::{Config, DEFAULT_STUN_URL};
use crate::id_types::{ChannelId, ParticipantId, ServerId};
use crate::media_setup::MediaSetup;
use crate::protocol::{
    DescriptionPayload, Envelope, ErrorPayload, JoinedPayload, KickedPayload, MediaStatePayload,
    ParticipantInfo, ServerEvent, VideoAction, KIND_ANSWER, KIND_MEDIA_STATE,
};
use crate::session::{SessionPhase, SessionRegistry, VoiceSession};
use crate::ticket::{
    JoinTicket, LocalIdentity, Permissions, StaticTicketSource,
};
use crate::video::{SampleVideoSource, VideoKind};

fn test_config() -> Config {
    Config {
        rust_log: "info".to_string(),
        stun_fallback_url: DEFAULT_STUN_URL.to_string(),
        connect_timeout_ms: 1_000,
    }
}

fn full_permissions() -> Permissions {
    Permissions {
        speak: true,
        video: true,
        screenshare: true,
    }
}

fn test_ticket() -> JoinTicket {
    JoinTicket {
        token: "tok-1".to_string(),
        signaling_url: "ws://127.0.0.1:1".to_string(),
        ice_servers: vec![],
        permissions: full_permissions(),
    }
}

async fn joined_session() -> (Arc<VoiceSession>, mpsc::Receiver<Envelope>) {
    let session = VoiceSession::new(
        Arc::new(MediaSetup::create_webrtc_api()),
        ServerId::from("srv-1"),
        ChannelId::from("ch-1"),
        LocalIdentity {
            user_uid: "user-1".to_string(),
            device_id: "dev-1".to_string(),
        },
        test_config(),
        Arc::new(SampleVideoSource),
    );
    session.begin_join(&test_ticket()).await;
    let (tx, rx) = mpsc::channel(64);
    session.attach_transport(tx).await;
    (session, rx)
}

fn info(id: &str, uid: &str) -> ParticipantInfo {
    ParticipantInfo {
        participant_id: id.to_string(),
        user_uid: uid.to_string(),
        device_id: format!("dev-{}", id),
    }
}

fn joined_event(local: &str, remotes: &[&str]) -> ServerEvent {
    let mut participants = vec![info(local, "pending")];
    for remote in remotes {
        participants.push(info(remote, &format!("uid-{}", remote)));
    }
    ServerEvent::Joined(JoinedPayload {
        participant_id: local.to_string(),
        participants,
        permissions: full_permissions(),
    })
}

fn drain(rx: &mut mpsc::Receiver<Envelope>) -> Vec<Envelope> {
    let mut out = Vec::new();
    while let Ok(env) = rx.try_recv() {
        out.push(env);
    }
    out
}

#[tokio::test]
async fn test_join_builds_roster_and_mesh() {
    let (session, _rx) = joined_session().await;
    session
        .handle_event(joined_event("p-1", &["p-2", "p-3"]))
        .await;

    let snap = session.snapshot().await;
    assert_eq!(snap.phase, SessionPhase::Active);
    assert_eq!(snap.participants.len(), 3);

    let local = snap.participants.iter().find(|p| p.is_local).unwrap();
    assert_eq!(local.participant_id, ParticipantId::from("p-1"));
    // the server's placeholder row got replaced with the real identity
    assert_eq!(local.user_uid, "user-1");
    assert_eq!(local.device_id, "dev-1");

    // one connection per remote, none for ourselves
    assert_eq!(session.mesh().len(), 2);
    assert!(!session.mesh().contains(&ParticipantId::from("p-1")));

    session.leave().await;
    assert!(session.mesh().is_empty());
}

#[tokio::test]
async fn test_duplicate_participant_joined_is_ignored() {
    let (session, _rx) = joined_session().await;
    session.handle_event(joined_event("p-1", &["p-2"])).await;

    session
        .handle_event(ServerEvent::ParticipantJoined(info("p-2", "uid-p-2")))
        .await;

    let snap = session.snapshot().await;
    assert_eq!(snap.participants.len(), 2);
    assert_eq!(session.mesh().len(), 1);
}

#[tokio::test]
async fn test_participant_left_cleans_up() {
    let (session, _rx) = joined_session().await;
    session.handle_event(joined_event("p-1", &["p-2"])).await;
    assert_eq!(session.mesh().len(), 1);

    session
        .handle_event(ServerEvent::ParticipantLeft {
            participant_id: "p-2".to_string(),
        })
        .await;

    let snap = session.snapshot().await;
    assert_eq!(snap.participants.len(), 1);
    assert!(session.mesh().is_empty());
}

#[tokio::test]
async fn test_kicked_lands_idle_with_reason_and_stays_there() {
    let (session, _rx) = joined_session().await;
    session.handle_event(joined_event("p-1", &["p-2"])).await;

    session
        .handle_event(ServerEvent::Kicked(KickedPayload {
            reason: Some("moderation".to_string()),
        }))
        .await;

    let snap = session.snapshot().await;
    assert_eq!(snap.phase, SessionPhase::Idle);
    assert_eq!(snap.leave_reason.as_deref(), Some("moderation"));
    assert!(snap.participants.is_empty());
    assert!(session.mesh().is_empty());

    // nothing rejoins and late events are dropped
    session
        .handle_event(ServerEvent::ParticipantJoined(info("p-3", "uid-p-3")))
        .await;
    assert!(session.snapshot().await.participants.is_empty());
}

#[tokio::test]
async fn test_server_error_surfaces_verbatim() {
    let (session, _rx) = joined_session().await;
    session.handle_event(joined_event("p-1", &[])).await;

    session
        .handle_event(ServerEvent::ServerError(ErrorPayload {
            message: "channel is full".to_string(),
        }))
        .await;

    let snap = session.snapshot().await;
    assert_eq!(snap.phase, SessionPhase::Error);
    assert_eq!(snap.last_error.as_deref(), Some("channel is full"));
}

#[tokio::test]
async fn test_leave_when_idle_is_a_noop() {
    let session = VoiceSession::new(
        Arc::new(MediaSetup::create_webrtc_api()),
        ServerId::from("srv-1"),
        ChannelId::from("ch-1"),
        LocalIdentity {
            user_uid: "user-1".to_string(),
            device_id: "dev-1".to_string(),
        },
        test_config(),
        Arc::new(SampleVideoSource),
    );
    let (tx, mut rx) = mpsc::channel(8);
    session.attach_transport(tx).await;

    session.leave().await;
    assert_eq!(session.snapshot().await.phase, SessionPhase::Idle);
    assert!(drain(&mut rx).is_empty(), "idle leave must not signal");
}

#[tokio::test]
async fn test_camera_and_screen_share_run_concurrently() {
    let (session, mut rx) = joined_session().await;
    session.handle_event(joined_event("p-1", &["p-2"])).await;
    drain(&mut rx);

    session.enable_camera().await.unwrap();
    session
        .enable_screenshare(Some("display-1".to_string()))
        .await
        .unwrap();

    let snap = session.snapshot().await;
    assert!(snap.camera_enabled);
    assert!(snap.screen_enabled);

    let local_kinds: Vec<VideoKind> = snap
        .video_streams
        .iter()
        .filter(|s| s.is_local)
        .map(|s| s.kind)
        .collect();
    assert!(local_kinds.contains(&VideoKind::Camera));
    assert!(local_kinds.contains(&VideoKind::Screen));

    // both starts were announced over media.state
    let announced: Vec<Envelope> = drain(&mut rx)
        .into_iter()
        .filter(|e| e.kind == KIND_MEDIA_STATE)
        .collect();
    assert!(announced.len() >= 2);

    // and both tracks were attached to the existing peer connection
    let entry = session.mesh().get(&ParticipantId::from("p-2")).unwrap();
    assert_eq!(entry.pc.get_senders().await.len(), 2);

    session.disable_camera().await;
    let snap = session.snapshot().await;
    assert!(!snap.camera_enabled);
    assert!(snap.screen_enabled);
    assert!(snap
        .video_streams
        .iter()
        .all(|s| !(s.is_local && s.kind == VideoKind::Camera)));
}

#[tokio::test]
async fn test_video_requires_permission() {
    let session = VoiceSession::new(
        Arc::new(MediaSetup::create_webrtc_api()),
        ServerId::from("srv-1"),
        ChannelId::from("ch-1"),
        LocalIdentity {
            user_uid: "user-1".to_string(),
            device_id: "dev-1".to_string(),
        },
        test_config(),
        Arc::new(SampleVideoSource),
    );
    let mut ticket = test_ticket();
    ticket.permissions.video = false;
    ticket.permissions.screenshare = false;
    session.begin_join(&ticket).await;
    let (tx, _rx) = mpsc::channel(8);
    session.attach_transport(tx).await;

    session
        .handle_event(ServerEvent::Joined(JoinedPayload {
            participant_id: "p-1".to_string(),
            participants: vec![],
            permissions: ticket.permissions.clone(),
        }))
        .await;

    assert!(session.enable_camera().await.is_err());
    assert!(session.enable_screenshare(None).await.is_err());
    assert!(!session.snapshot().await.camera_enabled);
}

#[tokio::test]
async fn test_mute_deafen_interplay() {
    let (session, mut rx) = joined_session().await;
    session.handle_event(joined_event("p-1", &[])).await;
    drain(&mut rx);

    session.toggle_deafen().await;
    let snap = session.snapshot().await;
    assert!(snap.deafened, "deafen sets deafened");
    assert!(snap.mic_muted, "deafen implies mute");

    // unmuting while deafened clears the deafen too, never leaving the
    // inconsistent unmuted-but-deafened combination
    session.toggle_mic().await;
    let snap = session.snapshot().await;
    assert!(!snap.deafened);
    assert!(!snap.mic_muted);

    session.toggle_mic().await;
    let snap = session.snapshot().await;
    assert!(snap.mic_muted);
    assert!(!snap.deafened);

    // every toggle was broadcast
    let broadcasts = drain(&mut rx);
    assert_eq!(broadcasts.len(), 3);
    assert!(broadcasts.iter().all(|e| e.kind == KIND_MEDIA_STATE));
}

#[tokio::test]
async fn test_audio_chunks_drive_speaking_indicator() {
    let (session, _rx) = joined_session().await;
    session.handle_event(joined_event("p-1", &["p-2"])).await;

    let frame = vec![0.5_f32; audio::FRAME_SAMPLES];
    session
        .handle_event(ServerEvent::MediaState(MediaStatePayload::AudioChunk {
            participant_id: Some("p-2".to_string()),
            stream_id: "stream-a".to_string(),
            seq: 0,
            data: audio::encode_chunk(&frame),
        }))
        .await;

    let snap = session.snapshot().await;
    assert!(snap.speaking.contains(&ParticipantId::from("p-2")));

    // a remote mute clears the indicator immediately
    session
        .handle_event(ServerEvent::MediaState(MediaStatePayload::MicState {
            participant_id: Some("p-2".to_string()),
            muted: true,
            deafened: false,
        }))
        .await;
    assert!(!session
        .snapshot()
        .await
        .speaking
        .contains(&ParticipantId::from("p-2")));
}

#[tokio::test]
async fn test_inbound_offer_from_unknown_peer_gets_answered() {
    let (session, mut rx) = joined_session().await;
    session.handle_event(joined_event("p-1", &[])).await;
    drain(&mut rx);

    // a peer we have no roster entry for yet sends an offer; the
    // connection must be created lazily and answered
    let api = MediaSetup::create_webrtc_api();
    let remote_pc = api
        .new_peer_connection(Default::default())
        .await
        .unwrap();
    remote_pc
        .add_transceiver_from_kind(webrtc::rtp_transceiver::rtp_codec::RTPCodecType::Audio, None)
        .await
        .unwrap();
    let offer = remote_pc.create_offer(None).await.unwrap();
    remote_pc.set_local_description(offer.clone()).await.unwrap();

    session
        .handle_event(ServerEvent::Offer(DescriptionPayload {
            from: Some("p-9".to_string()),
            target: Some("p-1".to_string()),
            sdp: offer.sdp,
        }))
        .await;

    assert!(session.mesh().contains(&ParticipantId::from("p-9")));

    // trickle ICE may interleave candidate envelopes before the answer
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let env = tokio::time::timeout_at(deadline, rx.recv())
            .await
            .expect("answer within deadline")
            .expect("outbound channel open");
        if env.kind == KIND_ANSWER {
            break;
        }
    }
    remote_pc.close().await.unwrap();
}

#[tokio::test]
async fn test_video_stop_announcement_drops_remote_stream_rows() {
    let (session, _rx) = joined_session().await;
    session.handle_event(joined_event("p-1", &["p-2"])).await;

    session
        .handle_event(ServerEvent::MediaState(MediaStatePayload::Video {
            participant_id: Some("p-2".to_string()),
            action: VideoAction::Start,
            track_kind: VideoKind::Screen,
            track_id: "t-9".to_string(),
            stream_id: "s-9".to_string(),
        }))
        .await;

    session
        .handle_event(ServerEvent::MediaState(MediaStatePayload::Video {
            participant_id: Some("p-2".to_string()),
            action: VideoAction::Stop,
            track_kind: VideoKind::Screen,
            track_id: "t-9".to_string(),
            stream_id: "s-9".to_string(),
        }))
        .await;

    let snap = session.snapshot().await;
    assert!(snap
        .video_streams
        .iter()
        .all(|s| s.track_id.as_ref() != "t-9"));
}

#[tokio::test]
async fn test_registry_enforces_one_session_per_server() {
    let registry = SessionRegistry::new(test_config());
    let identity = LocalIdentity {
        user_uid: "user-1".to_string(),
        device_id: "dev-1".to_string(),
    };
    let tickets = StaticTicketSource {
        ticket: test_ticket(),
    };

    let first = registry
        .join(
            ServerId::from("srv-1"),
            ChannelId::from("ch-1"),
            identity.clone(),
            &tickets,
        )
        .await
        .unwrap();

    let _second = registry
        .join(
            ServerId::from("srv-1"),
            ChannelId::from("ch-2"),
            identity.clone(),
            &tickets,
        )
        .await
        .unwrap();

    // the first session was superseded and forgotten
    assert!(registry
        .get(&(ServerId::from("srv-1"), ChannelId::from("ch-1")))
        .is_none());
    assert!(registry
        .get(&(ServerId::from("srv-1"), ChannelId::from("ch-2")))
        .is_some());
    assert_eq!(first.snapshot().await.phase, SessionPhase::Idle);

    // a different server is unaffected
    registry
        .join(
            ServerId::from("srv-2"),
            ChannelId::from("ch-1"),
            identity,
            &tickets,
        )
        .await
        .unwrap();
    assert_eq!(registry.active().len(), 2);

    registry.leave_all().await;
    assert!(registry.active().is_empty());
}

struct DenyingTicketSource;

#[async_trait::async_trait]
impl crate::ticket::TicketSource for DenyingTicketSource {
    async fn acquire(
        &self,
        _server_id: &ServerId,
        _channel_id: &ChannelId,
        _identity: &LocalIdentity,
    ) -> Result<JoinTicket, crate::ticket::TicketError> {
        Err(crate::ticket::TicketError::Denied(
            "voice is disabled on this server".to_string(),
        ))
    }
}

#[tokio::test]
async fn test_ticket_denial_registers_error_session() {
    let registry = SessionRegistry::new(test_config());
    let identity = LocalIdentity {
        user_uid: "user-1".to_string(),
        device_id: "dev-1".to_string(),
    };

    let result = registry
        .join(
            ServerId::from("srv-1"),
            ChannelId::from("ch-1"),
            identity,
            &DenyingTicketSource,
        )
        .await;
    assert!(matches!(
        result,
        Err(crate::session::SessionError::Ticket(_))
    ));

    // the denial is visible on a registered session, message verbatim
    let session = registry
        .get(&(ServerId::from("srv-1"), ChannelId::from("ch-1")))
        .expect("session registered despite denial");
    let snap = session.snapshot().await;
    assert_eq!(snap.phase, SessionPhase::Error);
    assert_eq!(
        snap.last_error.as_deref(),
        Some("voice is disabled on this server")
    );
}
