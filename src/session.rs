//! Voice session lifecycle: the per-(server, channel) state machine that
//! owns roster, mesh, audio pipeline, and video state, plus the registry
//! that tracks every live session.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use webrtc::api::API;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use crate::audio::{
    self, mean_abs, CaptureHandle, MicUplink, PlaybackHandle, PlaybackMixer, SharedGain,
};
use crate::config::Config;
use crate::devices::{DeviceError, DeviceInventory};
use crate::id_types::{ChannelId, ParticipantId, ServerId, StreamId, TrackId};
use crate::media_setup::MediaSetup;
use crate::mesh::{MeshError, MeshEvent, PeerMesh};
use crate::protocol::{
    DescriptionPayload, Envelope, IcePayload, JoinedPayload, KickedPayload, MediaStatePayload,
    ParticipantInfo, ServerEvent, VideoAction,
};
use crate::ticket::{JoinTicket, LocalIdentity, Permissions, TicketError, TicketSource};
use crate::types::{EnvelopeSender, SessionKey, SharedEnvelopeSender};
use crate::video::{VideoHandle, VideoHintMap, VideoKind, VideoSource, VideoStream};

const SPEAKING_TICK: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionPhase {
    Idle,
    Joining,
    Active,
    Error,
}

impl std::fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionPhase::Idle => write!(f, "idle"),
            SessionPhase::Joining => write!(f, "joining"),
            SessionPhase::Active => write!(f, "active"),
            SessionPhase::Error => write!(f, "error"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Participant {
    pub participant_id: ParticipantId,
    pub user_uid: String,
    pub device_id: String,
    pub is_local: bool,
    pub joined_at: Instant,
}

#[derive(Debug)]
pub enum SessionError {
    Ticket(TicketError),
    Transport(String),
    /// The command needs an active session.
    NotActive,
    PermissionDenied(&'static str),
    Device(DeviceError),
    Mesh(MeshError),
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionError::Ticket(e) => write!(f, "{}", e),
            SessionError::Transport(msg) => write!(f, "signaling transport: {}", msg),
            SessionError::NotActive => write!(f, "no active voice session"),
            SessionError::PermissionDenied(what) => {
                write!(f, "channel permissions do not allow {}", what)
            }
            SessionError::Device(e) => write!(f, "{}", e),
            SessionError::Mesh(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for SessionError {}

impl From<TicketError> for SessionError {
    fn from(e: TicketError) -> Self {
        SessionError::Ticket(e)
    }
}

impl From<DeviceError> for SessionError {
    fn from(e: DeviceError) -> Self {
        SessionError::Device(e)
    }
}

impl From<MeshError> for SessionError {
    fn from(e: MeshError) -> Self {
        SessionError::Mesh(e)
    }
}

/// Point-in-time copy of everything the UI renders for one session.
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub server_id: ServerId,
    pub channel_id: ChannelId,
    pub phase: SessionPhase,
    pub participants: Vec<Participant>,
    pub speaking: HashSet<ParticipantId>,
    pub video_streams: Vec<VideoStream>,
    pub mic_muted: bool,
    pub deafened: bool,
    pub camera_enabled: bool,
    pub screen_enabled: bool,
    pub permissions: Permissions,
    pub input_device: String,
    pub output_device: String,
    pub last_error: Option<String>,
    pub leave_reason: Option<String>,
    pub joined_at: Option<Instant>,
    pub last_event_at: Option<Instant>,
}

struct SessionCore {
    phase: SessionPhase,
    local_participant: Option<ParticipantId>,
    participants: Vec<Participant>,
    permissions: Permissions,
    speaking: crate::speaking::SpeakingDetector,
    streams: Vec<VideoStream>,
    deafened: bool,
    /// Output gain to restore after undeafen.
    output_volume: f32,
    camera_track: Option<Arc<TrackLocalStaticSample>>,
    screen_track: Option<Arc<TrackLocalStaticSample>>,
    devices: DeviceInventory,
    /// PCM stream ids contributed by each remote, for mixer cleanup.
    audio_streams: HashMap<ParticipantId, HashSet<String>>,
    last_seq: HashMap<String, u64>,
    uplink: Option<MicUplink>,
    capture: Option<CaptureHandle>,
    playback: Option<PlaybackHandle>,
    tasks: Vec<JoinHandle<()>>,
    last_error: Option<String>,
    leave_reason: Option<String>,
    joined_at: Option<Instant>,
    last_event_at: Option<Instant>,
}

impl SessionCore {
    fn new() -> Self {
        SessionCore {
            phase: SessionPhase::Idle,
            local_participant: None,
            participants: Vec::new(),
            permissions: Permissions::default(),
            speaking: crate::speaking::SpeakingDetector::new(),
            streams: Vec::new(),
            deafened: false,
            output_volume: 1.0,
            camera_track: None,
            screen_track: None,
            devices: DeviceInventory::default(),
            audio_streams: HashMap::new(),
            last_seq: HashMap::new(),
            uplink: None,
            capture: None,
            playback: None,
            tasks: Vec::new(),
            last_error: None,
            leave_reason: None,
            joined_at: None,
            last_event_at: None,
        }
    }
}

pub struct VoiceSession {
    pub server_id: ServerId,
    pub channel_id: ChannelId,
    identity: LocalIdentity,
    config: Config,
    mesh: Arc<PeerMesh>,
    outbound: SharedEnvelopeSender,
    mixer: Arc<PlaybackMixer>,
    hints: Arc<VideoHintMap>,
    video_source: Arc<dyn VideoSource>,
    mic_muted: Arc<AtomicBool>,
    input_gain: Arc<SharedGain>,
    /// Set before any deliberate transport close so the read loop can tell
    /// a clean shutdown from a dropped connection.
    self_closed: Arc<AtomicBool>,
    core: Mutex<SessionCore>,
    mesh_events: Mutex<Option<mpsc::UnboundedReceiver<MeshEvent>>>,
    weak: Weak<VoiceSession>,
}

impl VoiceSession {
    pub fn new(
        api: Arc<API>,
        server_id: ServerId,
        channel_id: ChannelId,
        identity: LocalIdentity,
        config: Config,
        video_source: Arc<dyn VideoSource>,
    ) -> Arc<VoiceSession> {
        let outbound: SharedEnvelopeSender = Arc::new(Mutex::new(None));
        let (mesh_tx, mesh_rx) = mpsc::unbounded_channel();
        let mesh = Arc::new(PeerMesh::new(
            api,
            channel_id.as_ref().to_string(),
            outbound.clone(),
            mesh_tx,
        ));

        Arc::new_cyclic(|weak| VoiceSession {
            server_id,
            channel_id,
            identity,
            config,
            mesh,
            outbound,
            mixer: Arc::new(PlaybackMixer::new()),
            hints: Arc::new(VideoHintMap::new()),
            video_source,
            mic_muted: Arc::new(AtomicBool::new(false)),
            input_gain: Arc::new(SharedGain::new(1.0)),
            self_closed: Arc::new(AtomicBool::new(false)),
            core: Mutex::new(SessionCore::new()),
            mesh_events: Mutex::new(Some(mesh_rx)),
            weak: weak.clone(),
        })
    }

    pub fn key(&self) -> SessionKey {
        (self.server_id.clone(), self.channel_id.clone())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.config.connect_timeout_ms)
    }

    pub fn outbound(&self) -> SharedEnvelopeSender {
        self.outbound.clone()
    }

    pub fn mesh(&self) -> &Arc<PeerMesh> {
        &self.mesh
    }

    /// Moves to `Joining` before the ticket round-trip, so a ticket denial
    /// lands as a `Joining` to `Error` transition on this session.
    pub async fn mark_joining(&self) {
        let mut core = self.core.lock().await;
        core.phase = SessionPhase::Joining;
        core.last_error = None;
        core.leave_reason = None;
    }

    /// Installs the ticket's ICE configuration and moves to `Joining`.
    /// The transport layer connects and sends the `join` envelope next.
    pub async fn begin_join(&self, ticket: &JoinTicket) {
        self.self_closed.store(false, Ordering::Relaxed);
        self.mesh
            .set_rtc_config(MediaSetup::rtc_config_from_ticket(
                &ticket.ice_servers,
                &self.config.stun_fallback_url,
            ))
            .await;

        let mut core = self.core.lock().await;
        core.phase = SessionPhase::Joining;
        core.permissions = ticket.permissions.clone();
        core.last_error = None;
        core.leave_reason = None;
        info!(
            server = %self.server_id,
            channel = %self.channel_id,
            "Joining voice channel"
        );
    }

    /// Wires the outbound envelope channel once the transport is open.
    pub async fn attach_transport(&self, tx: EnvelopeSender) {
        *self.outbound.lock().await = Some(tx);
    }

    /// Called by the transport read loop when the connection ends.
    pub async fn transport_closed(&self, error: Option<String>) {
        if self.self_closed.load(Ordering::Relaxed) {
            debug!(channel = %self.channel_id, "Transport closed after local shutdown");
            return;
        }
        let message = error.unwrap_or_else(|| "signaling connection lost".to_string());
        self.fail(message).await;
    }

    /// Transitions to the error state and tears children down. The error
    /// message stays visible until the next join attempt.
    pub async fn fail(&self, message: String) {
        warn!(channel = %self.channel_id, error = %message, "Voice session failed");
        self.self_closed.store(true, Ordering::Relaxed);
        let mut core = self.core.lock().await;
        core.phase = SessionPhase::Error;
        core.last_error = Some(message);
        drop(core);
        self.teardown().await;
    }

    /// Voluntary leave. A no-op when nothing is joined.
    pub async fn leave(&self) {
        {
            let core = self.core.lock().await;
            if core.phase == SessionPhase::Idle {
                debug!(channel = %self.channel_id, "Leave ignored, session idle");
                return;
            }
        }

        // Mark before closing anything so the read loop treats the close
        // as intentional.
        self.self_closed.store(true, Ordering::Relaxed);
        self.send(Envelope::leave(self.channel_id.as_ref().to_string()))
            .await;
        *self.outbound.lock().await = None;

        {
            let mut core = self.core.lock().await;
            core.phase = SessionPhase::Idle;
        }
        self.teardown().await;
        info!(channel = %self.channel_id, "Left voice channel");
    }

    async fn teardown(&self) {
        let (uplink, capture, playback, tasks) = {
            let mut core = self.core.lock().await;
            core.local_participant = None;
            core.participants.clear();
            core.streams.clear();
            core.speaking.clear();
            core.camera_track = None;
            core.screen_track = None;
            core.joined_at = None;
            core.audio_streams.clear();
            core.last_seq.clear();
            (
                core.uplink.take(),
                core.capture.take(),
                core.playback.take(),
                std::mem::take(&mut core.tasks),
            )
        };
        if let Some(uplink) = uplink {
            uplink.stop();
        }
        drop(capture);
        drop(playback);
        for task in tasks {
            task.abort();
        }
        self.mesh.close_all().await;
        self.mixer.clear();
        self.hints.clear();
    }

    pub async fn snapshot(&self) -> SessionSnapshot {
        let core = self.core.lock().await;
        SessionSnapshot {
            server_id: self.server_id.clone(),
            channel_id: self.channel_id.clone(),
            phase: core.phase.clone(),
            participants: core.participants.clone(),
            speaking: core.speaking.speaking_set(),
            video_streams: core.streams.clone(),
            mic_muted: self.mic_muted.load(Ordering::Relaxed),
            deafened: core.deafened,
            camera_enabled: core.camera_track.is_some(),
            screen_enabled: core.screen_track.is_some(),
            permissions: core.permissions.clone(),
            input_device: core.devices.input_name().to_string(),
            output_device: core.devices.output_name().to_string(),
            last_error: core.last_error.clone(),
            leave_reason: core.leave_reason.clone(),
            joined_at: core.joined_at,
            last_event_at: core.last_event_at,
        }
    }

    // ---- inbound signaling -------------------------------------------------

    pub async fn handle_event(&self, event: ServerEvent) {
        {
            let mut core = self.core.lock().await;
            if core.phase == SessionPhase::Idle {
                debug!(channel = %self.channel_id, "Event dropped, session idle");
                return;
            }
            // any server traffic in the error state is stale
            if core.phase == SessionPhase::Error {
                return;
            }
            core.last_event_at = Some(Instant::now());
        }

        match event {
            ServerEvent::Joined(payload) => self.on_joined(payload).await,
            ServerEvent::ParticipantJoined(info) => self.on_participant_joined(info).await,
            ServerEvent::ParticipantLeft { participant_id } => {
                self.on_participant_left(&ParticipantId::from(participant_id))
                    .await
            }
            ServerEvent::Offer(payload) => self.on_offer(payload).await,
            ServerEvent::Answer(payload) => self.on_answer(payload).await,
            ServerEvent::IceCandidate(payload) => self.on_ice_candidate(payload).await,
            ServerEvent::MediaState(payload) => self.on_media_state(payload).await,
            ServerEvent::Kicked(payload) => self.on_kicked(payload).await,
            ServerEvent::ServerError(payload) => self.fail(payload.message).await,
            ServerEvent::Ignored(kind) => {
                debug!(kind = %kind, "Ignoring unknown envelope kind");
            }
        }
    }

    async fn on_joined(&self, payload: JoinedPayload) {
        let local_id = ParticipantId::from(payload.participant_id);
        self.mesh.set_local_participant(local_id.clone()).await;

        let remotes: Vec<ParticipantId> = {
            let mut core = self.core.lock().await;
            core.phase = SessionPhase::Active;
            core.permissions = payload.permissions;
            core.joined_at = Some(Instant::now());
            core.local_participant = Some(local_id.clone());
            core.participants.clear();

            for info in payload.participants {
                let id = ParticipantId::from(info.participant_id);
                if core.participants.iter().any(|p| p.participant_id == id) {
                    continue;
                }
                let is_local = id == local_id;
                // the server's row for us carries placeholder identity;
                // the local one is authoritative
                core.participants.push(Participant {
                    participant_id: id,
                    user_uid: if is_local {
                        self.identity.user_uid.clone()
                    } else {
                        info.user_uid
                    },
                    device_id: if is_local {
                        self.identity.device_id.clone()
                    } else {
                        info.device_id
                    },
                    is_local,
                    joined_at: Instant::now(),
                });
            }
            if !core.participants.iter().any(|p| p.is_local) {
                core.participants.push(Participant {
                    participant_id: local_id.clone(),
                    user_uid: self.identity.user_uid.clone(),
                    device_id: self.identity.device_id.clone(),
                    is_local: true,
                    joined_at: Instant::now(),
                });
            }

            core.participants
                .iter()
                .filter(|p| !p.is_local)
                .map(|p| p.participant_id.clone())
                .collect()
        };

        info!(
            channel = %self.channel_id,
            participant = %local_id,
            peers = remotes.len(),
            "Voice session active"
        );

        for remote in &remotes {
            if let Err(e) = self.connect_peer(remote).await {
                warn!(participant = %remote, error = %e, "Peer connect failed");
            }
        }

        self.start_audio().await;
        self.spawn_pumps().await;
    }

    async fn on_participant_joined(&self, info: ParticipantInfo) {
        let id = ParticipantId::from(info.participant_id);
        {
            let mut core = self.core.lock().await;
            if core.local_participant.as_ref() == Some(&id) {
                return;
            }
            if core.participants.iter().any(|p| p.participant_id == id) {
                debug!(participant = %id, "Duplicate participant.joined ignored");
                return;
            }
            core.participants.push(Participant {
                participant_id: id.clone(),
                user_uid: info.user_uid,
                device_id: info.device_id,
                is_local: false,
                joined_at: Instant::now(),
            });
        }
        info!(participant = %id, "Participant joined");
        if let Err(e) = self.connect_peer(&id).await {
            warn!(participant = %id, error = %e, "Peer connect failed");
        }
    }

    async fn on_participant_left(&self, id: &ParticipantId) {
        let contributed: Vec<String> = {
            let mut core = self.core.lock().await;
            core.participants.retain(|p| &p.participant_id != id);
            core.streams.retain(|s| &s.participant_id != id);
            core.speaking.remove(id);
            let streams: Vec<String> = core
                .audio_streams
                .remove(id)
                .map(|s| s.into_iter().collect())
                .unwrap_or_default();
            for stream_id in &streams {
                core.last_seq.remove(stream_id.as_str());
            }
            streams
        };
        for stream_id in &contributed {
            self.mixer.remove_stream(stream_id);
        }
        self.hints.remove_participant(id);
        self.mesh.remove_peer(id).await;
        info!(participant = %id, "Participant left");
    }

    async fn on_offer(&self, payload: DescriptionPayload) {
        let from = match payload.from {
            Some(from) => ParticipantId::from(from),
            None => {
                warn!("Offer without sender dropped");
                return;
            }
        };
        let entry = match self.mesh.ensure_peer(&from).await {
            Ok(entry) => entry,
            Err(e) => {
                warn!(participant = %from, error = %e, "Peer creation for offer failed");
                return;
            }
        };

        // resync runs inside the transaction so the answer already carries
        // the current local track set
        let desired = self.desired_tracks().await;
        match self.mesh.handle_remote_offer(&entry, payload.sdp, &desired).await {
            Ok(crate::negotiation::OfferOutcome::Ignored) => {
                debug!(participant = %from, "Glare offer ignored");
            }
            Ok(crate::negotiation::OfferOutcome::Answered { deferred }) => {
                if let Some(reason) = deferred {
                    self.mesh.flush_deferred(&entry, reason).await;
                }
            }
            Err(e) => {
                warn!(participant = %from, error = %e, "Remote offer rejected");
            }
        }
    }

    async fn on_answer(&self, payload: DescriptionPayload) {
        let from = match payload.from {
            Some(from) => ParticipantId::from(from),
            None => {
                warn!("Answer without sender dropped");
                return;
            }
        };
        let entry = match self.mesh.get(&from) {
            Some(entry) => entry,
            None => {
                warn!(participant = %from, "Answer for unknown peer dropped");
                return;
            }
        };
        match entry.apply_remote_answer(payload.sdp).await {
            Ok(Some(reason)) => self.mesh.flush_deferred(&entry, reason).await,
            Ok(None) => {}
            Err(e) => {
                warn!(participant = %from, error = %e, "Remote answer rejected");
            }
        }
    }

    async fn on_ice_candidate(&self, payload: IcePayload) {
        let from = match payload.from {
            Some(from) => ParticipantId::from(from),
            None => {
                warn!("ICE candidate without sender dropped");
                return;
            }
        };
        match self.mesh.ensure_peer(&from).await {
            Ok(entry) => {
                if let Err(e) = entry.add_remote_candidate(payload.candidate).await {
                    warn!(participant = %from, error = %e, "ICE candidate rejected");
                }
            }
            Err(e) => {
                warn!(participant = %from, error = %e, "Peer creation for candidate failed");
            }
        }
    }

    async fn on_media_state(&self, payload: MediaStatePayload) {
        match payload {
            MediaStatePayload::MicState {
                participant_id,
                muted,
                deafened,
            } => {
                let Some(id) = participant_id.map(ParticipantId::from) else {
                    debug!("mic_state without participant dropped");
                    return;
                };
                debug!(participant = %id, muted, deafened, "Remote mic state");
                if muted {
                    let mut core = self.core.lock().await;
                    core.speaking.remove(&id);
                }
            }
            MediaStatePayload::Video {
                participant_id,
                action,
                track_kind,
                track_id,
                stream_id: _,
            } => {
                let Some(id) = participant_id.map(ParticipantId::from) else {
                    debug!("video announcement without participant dropped");
                    return;
                };
                match action {
                    VideoAction::Start => {
                        debug!(participant = %id, kind = %track_kind, track_id = %track_id, "Video announced");
                        self.hints.insert(id, track_id, track_kind);
                    }
                    VideoAction::Stop => {
                        debug!(participant = %id, track_id = %track_id, "Video stopped");
                        self.hints.remove(&id, &track_id);
                        let mut core = self.core.lock().await;
                        core.streams.retain(|s| {
                            !(s.participant_id == id && s.track_id.as_ref() == track_id)
                        });
                    }
                }
            }
            MediaStatePayload::AudioChunk {
                participant_id,
                stream_id,
                seq,
                data,
            } => {
                let Some(id) = participant_id.map(ParticipantId::from) else {
                    debug!("audio chunk without participant dropped");
                    return;
                };
                let samples = match audio::decode_chunk(&data) {
                    Ok(samples) => samples,
                    Err(e) => {
                        warn!(participant = %id, stream_id = %stream_id, error = %e, "Audio chunk dropped");
                        return;
                    }
                };
                let level = mean_abs(&samples);
                self.mixer.submit(&stream_id, samples);
                let mut core = self.core.lock().await;
                if let Some(last) = core.last_seq.get(&stream_id) {
                    if seq > last + 1 {
                        debug!(stream_id = %stream_id, gap = seq - last - 1, "Audio sequence gap");
                    }
                }
                core.last_seq.insert(stream_id.clone(), seq);
                core.audio_streams
                    .entry(id.clone())
                    .or_default()
                    .insert(stream_id);
                core.speaking.observe(&id, level);
            }
        }
    }

    /// Server-initiated removal. Ends up idle with the reason visible, and
    /// nothing rejoins automatically.
    async fn on_kicked(&self, payload: KickedPayload) {
        let reason = payload
            .reason
            .unwrap_or_else(|| "removed from channel".to_string());
        info!(channel = %self.channel_id, reason = %reason, "Kicked from voice channel");
        self.self_closed.store(true, Ordering::Relaxed);
        *self.outbound.lock().await = None;
        {
            let mut core = self.core.lock().await;
            core.phase = SessionPhase::Idle;
            core.leave_reason = Some(reason);
        }
        self.teardown().await;
    }

    // ---- mesh plumbing -----------------------------------------------------

    async fn connect_peer(&self, remote: &ParticipantId) -> Result<(), MeshError> {
        let entry = self.mesh.ensure_peer(remote).await?;
        let desired = self.desired_tracks().await;
        if !desired.is_empty() {
            self.mesh
                .sync_and_offer(&entry, &desired, "peer-connect")
                .await?;
        }
        Ok(())
    }

    async fn desired_tracks(&self) -> Vec<Arc<dyn TrackLocal + Send + Sync>> {
        let core = self.core.lock().await;
        let mut tracks: Vec<Arc<dyn TrackLocal + Send + Sync>> = Vec::new();
        if let Some(camera) = &core.camera_track {
            tracks.push(camera.clone());
        }
        if let Some(screen) = &core.screen_track {
            tracks.push(screen.clone());
        }
        tracks
    }

    async fn handle_remote_track(&self, participant: ParticipantId, track: Arc<TrackRemote>) {
        if track.kind() != RTPCodecType::Video {
            // voice travels over the PCM side channel, not RTP
            debug!(participant = %participant, "Non-video remote track ignored");
            return;
        }
        let track_id = track.id();
        let kind = self.hints.classify(&participant, &track_id, &track_id);
        let stream = VideoStream {
            participant_id: participant.clone(),
            track_id: TrackId::from(track_id.clone()),
            stream_id: StreamId::from(track.stream_id()),
            kind,
            is_local: false,
            started_at: Instant::now(),
            handle: Some(VideoHandle::Remote(track)),
        };
        let mut core = self.core.lock().await;
        core.streams
            .retain(|s| !(s.participant_id == participant && s.track_id.as_ref() == track_id));
        core.streams.push(stream);
        info!(participant = %participant, track_id = %track_id, kind = %kind, "Remote video registered");
    }

    async fn handle_connection_terminal(&self, participant: ParticipantId) {
        {
            let mut core = self.core.lock().await;
            core.streams
                .retain(|s| s.participant_id != participant || s.is_local);
        }
        self.mesh.remove_peer(&participant).await;
        warn!(participant = %participant, "Peer connection lost");
    }

    async fn spawn_pumps(&self) {
        let Some(mesh_rx) = self.mesh_events.lock().await.take() else {
            return;
        };
        let mut mesh_rx = mesh_rx;

        let weak = self.weak.clone();
        let mesh_pump = tokio::spawn(async move {
            while let Some(event) = mesh_rx.recv().await {
                let Some(session) = weak.upgrade() else { break };
                match event {
                    MeshEvent::RemoteTrack { participant, track } => {
                        session.handle_remote_track(participant, track).await;
                    }
                    MeshEvent::ConnectionTerminal { participant, state } => {
                        debug!(participant = %participant, state = %state, "Terminal connection state");
                        session.handle_connection_terminal(participant).await;
                    }
                }
            }
        });

        let weak = self.weak.clone();
        let tick = tokio::spawn(async move {
            let mut interval = tokio::time::interval(SPEAKING_TICK);
            loop {
                interval.tick().await;
                let Some(session) = weak.upgrade() else { break };
                let mut core = session.core.lock().await;
                let stopped = core.speaking.expire();
                for participant in stopped {
                    debug!(participant = %participant, "Speaking ended");
                }
            }
        });

        let mut core = self.core.lock().await;
        core.tasks.push(mesh_pump);
        core.tasks.push(tick);
    }

    // ---- audio pipeline ----------------------------------------------------

    async fn start_audio(&self) {
        let (input_name, output_name, output_volume, deafened) = {
            let core = self.core.lock().await;
            (
                core.devices.input_name().to_string(),
                core.devices.output_name().to_string(),
                core.output_volume,
                core.deafened,
            )
        };
        self.mixer
            .set_gain(if deafened { 0.0 } else { output_volume });

        match audio::start_capture(&input_name) {
            Ok(mut capture) => {
                if let Some(frames) = capture.take_frames() {
                    let (level_tx, level_rx) = mpsc::unbounded_channel();
                    let uplink = MicUplink::start(
                        self.channel_id.as_ref().to_string(),
                        frames,
                        self.input_gain.clone(),
                        self.mic_muted.clone(),
                        self.outbound.clone(),
                        level_tx,
                    );
                    self.spawn_level_pump(level_rx).await;
                    let mut core = self.core.lock().await;
                    core.uplink = Some(uplink);
                    core.capture = Some(capture);
                }
            }
            Err(e) => {
                warn!(device = %input_name, error = %e, "Capture unavailable");
                let mut core = self.core.lock().await;
                core.devices.record_error(&e);
            }
        }

        match audio::start_playback(&output_name, self.mixer.clone()) {
            Ok(handle) => {
                let mut core = self.core.lock().await;
                core.playback = Some(handle);
            }
            Err(e) => {
                warn!(device = %output_name, error = %e, "Playback unavailable");
                let mut core = self.core.lock().await;
                core.devices.record_error(&e);
            }
        }
    }

    async fn spawn_level_pump(&self, mut level_rx: mpsc::UnboundedReceiver<f32>) {
        let weak = self.weak.clone();
        let pump = tokio::spawn(async move {
            while let Some(level) = level_rx.recv().await {
                let Some(session) = weak.upgrade() else { break };
                let mut core = session.core.lock().await;
                if let Some(local) = core.local_participant.clone() {
                    core.speaking.observe(&local, level);
                }
            }
        });
        let mut core = self.core.lock().await;
        core.tasks.push(pump);
    }

    async fn restart_capture(&self) {
        let (uplink, capture) = {
            let mut core = self.core.lock().await;
            (core.uplink.take(), core.capture.take())
        };
        if let Some(uplink) = uplink {
            uplink.stop();
        }
        drop(capture);

        let input_name = {
            let core = self.core.lock().await;
            core.devices.input_name().to_string()
        };
        match audio::start_capture(&input_name) {
            Ok(mut new_capture) => {
                if let Some(frames) = new_capture.take_frames() {
                    let (level_tx, level_rx) = mpsc::unbounded_channel();
                    let uplink = MicUplink::start(
                        self.channel_id.as_ref().to_string(),
                        frames,
                        self.input_gain.clone(),
                        self.mic_muted.clone(),
                        self.outbound.clone(),
                        level_tx,
                    );
                    self.spawn_level_pump(level_rx).await;
                    let mut core = self.core.lock().await;
                    core.uplink = Some(uplink);
                    core.capture = Some(new_capture);
                }
            }
            Err(e) => {
                warn!(device = %input_name, error = %e, "Capture restart failed");
                let mut core = self.core.lock().await;
                core.devices.record_error(&e);
            }
        }
    }

    // ---- user commands -----------------------------------------------------

    pub async fn toggle_mic(&self) {
        let (muted, deafened) = {
            let mut core = self.core.lock().await;
            if core.deafened {
                // unmuting while deafened undoes the deafen first, since
                // deafen implies mute
                core.deafened = false;
                self.mixer.set_gain(core.output_volume);
                self.mic_muted.store(false, Ordering::Relaxed);
            } else {
                let next = !self.mic_muted.load(Ordering::Relaxed);
                self.mic_muted.store(next, Ordering::Relaxed);
            }
            (self.mic_muted.load(Ordering::Relaxed), core.deafened)
        };
        info!(muted, deafened, "Mic toggled");
        self.broadcast_mic_state(muted, deafened).await;
    }

    pub async fn toggle_deafen(&self) {
        let (muted, deafened) = {
            let mut core = self.core.lock().await;
            if core.deafened {
                core.deafened = false;
                self.mixer.set_gain(core.output_volume);
            } else {
                core.deafened = true;
                self.mixer.set_gain(0.0);
                self.mic_muted.store(true, Ordering::Relaxed);
            }
            (self.mic_muted.load(Ordering::Relaxed), core.deafened)
        };
        info!(muted, deafened, "Deafen toggled");
        self.broadcast_mic_state(muted, deafened).await;
    }

    async fn broadcast_mic_state(&self, muted: bool, deafened: bool) {
        let payload = MediaStatePayload::MicState {
            participant_id: None,
            muted,
            deafened,
        };
        self.send(Envelope::media_state(
            self.channel_id.as_ref().to_string(),
            &payload,
        ))
        .await;
    }

    pub async fn toggle_camera(&self) -> Result<(), SessionError> {
        let enabled = {
            let core = self.core.lock().await;
            core.camera_track.is_some()
        };
        if enabled {
            self.disable_camera().await;
            Ok(())
        } else {
            self.enable_camera().await
        }
    }

    pub async fn enable_camera(&self) -> Result<(), SessionError> {
        {
            let core = self.core.lock().await;
            if core.phase != SessionPhase::Active {
                return Err(SessionError::NotActive);
            }
            if !core.permissions.video {
                return Err(SessionError::PermissionDenied("camera video"));
            }
            if core.camera_track.is_some() {
                return Ok(());
            }
        }
        let track = self.video_source.open_camera().await?;
        self.publish_local_track(track, VideoKind::Camera).await;
        Ok(())
    }

    pub async fn disable_camera(&self) {
        let track = {
            let mut core = self.core.lock().await;
            core.camera_track.take()
        };
        if let Some(track) = track {
            self.unpublish_local_track(&track, VideoKind::Camera).await;
        }
    }

    pub async fn toggle_screenshare(&self, source_id: Option<String>) -> Result<(), SessionError> {
        let enabled = {
            let core = self.core.lock().await;
            core.screen_track.is_some()
        };
        if enabled {
            self.disable_screenshare().await;
            Ok(())
        } else {
            self.enable_screenshare(source_id).await
        }
    }

    pub async fn enable_screenshare(&self, source_id: Option<String>) -> Result<(), SessionError> {
        {
            let core = self.core.lock().await;
            if core.phase != SessionPhase::Active {
                return Err(SessionError::NotActive);
            }
            if !core.permissions.screenshare {
                return Err(SessionError::PermissionDenied("screen sharing"));
            }
            if core.screen_track.is_some() {
                return Ok(());
            }
        }
        let track = self.video_source.open_screen(source_id).await?;
        self.publish_local_track(track, VideoKind::Screen).await;
        Ok(())
    }

    pub async fn disable_screenshare(&self) {
        let track = {
            let mut core = self.core.lock().await;
            core.screen_track.take()
        };
        if let Some(track) = track {
            self.unpublish_local_track(&track, VideoKind::Screen).await;
        }
    }

    /// A local capture track ending on its own (device unplugged, share
    /// window closed) is treated exactly like an explicit disable.
    pub async fn handle_local_track_ended(&self, track_id: &str) {
        let (is_camera, is_screen) = {
            let core = self.core.lock().await;
            (
                core.camera_track.as_ref().map(|t| t.id() == track_id) == Some(true),
                core.screen_track.as_ref().map(|t| t.id() == track_id) == Some(true),
            )
        };
        if is_camera {
            self.disable_camera().await;
        } else if is_screen {
            self.disable_screenshare().await;
        }
    }

    async fn publish_local_track(&self, track: Arc<TrackLocalStaticSample>, kind: VideoKind) {
        let (track_id, stream_id) = (track.id().to_string(), track.stream_id().to_string());
        {
            let mut core = self.core.lock().await;
            let local = core
                .local_participant
                .clone()
                .unwrap_or_else(|| ParticipantId::from("local"));
            core.streams.retain(|s| !(s.is_local && s.kind == kind));
            core.streams.push(VideoStream {
                participant_id: local,
                track_id: TrackId::from(track_id.clone()),
                stream_id: StreamId::from(stream_id.clone()),
                kind,
                is_local: true,
                started_at: Instant::now(),
                handle: Some(VideoHandle::Local(track.clone())),
            });
            match kind {
                VideoKind::Camera => core.camera_track = Some(track),
                VideoKind::Screen => core.screen_track = Some(track),
            }
        }
        info!(kind = %kind, track_id = %track_id, "Local video started");
        self.announce_video(VideoAction::Start, kind, &track_id, &stream_id)
            .await;
        self.resync_all(match kind {
            VideoKind::Camera => "camera-start",
            VideoKind::Screen => "screen-start",
        })
        .await;
    }

    async fn unpublish_local_track(&self, track: &Arc<TrackLocalStaticSample>, kind: VideoKind) {
        let (track_id, stream_id) = (track.id().to_string(), track.stream_id().to_string());
        {
            let mut core = self.core.lock().await;
            core.streams
                .retain(|s| !(s.is_local && s.track_id.as_ref() == track_id));
        }
        info!(kind = %kind, track_id = %track_id, "Local video stopped");
        self.announce_video(VideoAction::Stop, kind, &track_id, &stream_id)
            .await;
        self.resync_all(match kind {
            VideoKind::Camera => "camera-stop",
            VideoKind::Screen => "screen-stop",
        })
        .await;
    }

    async fn announce_video(
        &self,
        action: VideoAction,
        kind: VideoKind,
        track_id: &str,
        stream_id: &str,
    ) {
        let payload = MediaStatePayload::Video {
            participant_id: None,
            action,
            track_kind: kind,
            track_id: track_id.to_string(),
            stream_id: stream_id.to_string(),
        };
        self.send(Envelope::media_state(
            self.channel_id.as_ref().to_string(),
            &payload,
        ))
        .await;
    }

    async fn resync_all(&self, reason: &str) {
        let desired = self.desired_tracks().await;
        for (participant, error) in self.mesh.sync_all(&desired, reason).await {
            warn!(participant = %participant, error = %error, "Track resync failed");
        }
    }

    pub async fn select_input_device(&self, name: String) {
        let active = {
            let mut core = self.core.lock().await;
            core.devices.select_input(name);
            core.phase == SessionPhase::Active
        };
        if active {
            self.restart_capture().await;
        }
    }

    pub async fn select_output_device(&self, name: String) {
        let (active, playback) = {
            let mut core = self.core.lock().await;
            core.devices.select_output(name);
            (core.phase == SessionPhase::Active, core.playback.take())
        };
        drop(playback);
        if active {
            let output_name = {
                let core = self.core.lock().await;
                core.devices.output_name().to_string()
            };
            match audio::start_playback(&output_name, self.mixer.clone()) {
                Ok(handle) => {
                    let mut core = self.core.lock().await;
                    core.playback = Some(handle);
                }
                Err(e) => {
                    warn!(device = %output_name, error = %e, "Playback restart failed");
                    let mut core = self.core.lock().await;
                    core.devices.record_error(&e);
                }
            }
        }
    }

    pub fn set_input_volume(&self, volume: f32) {
        self.input_gain.set(volume.clamp(0.0, 2.0));
    }

    pub async fn set_output_volume(&self, volume: f32) {
        let volume = volume.clamp(0.0, 2.0);
        let mut core = self.core.lock().await;
        core.output_volume = volume;
        if !core.deafened {
            self.mixer.set_gain(volume);
        }
    }

    async fn send(&self, env: Envelope) {
        let tx_lock = self.outbound.lock().await;
        if let Some(tx) = tx_lock.as_ref() {
            let _ = tx.send(env).await;
        } else {
            debug!(kind = %env.kind, "Envelope dropped, no transport");
        }
    }
}

/// Owns every live voice session, keyed by (server, channel). A server
/// allows at most one active session at a time; joining another channel
/// on the same server supersedes the current one.
pub struct SessionRegistry {
    sessions: DashMap<SessionKey, Arc<VoiceSession>>,
    api: Arc<API>,
    config: Config,
    video_source: Arc<dyn VideoSource>,
}

impl SessionRegistry {
    pub fn new(config: Config) -> Self {
        Self::with_video_source(config, Arc::new(crate::video::SampleVideoSource))
    }

    pub fn with_video_source(config: Config, video_source: Arc<dyn VideoSource>) -> Self {
        SessionRegistry {
            sessions: DashMap::new(),
            api: Arc::new(MediaSetup::create_webrtc_api()),
            config,
            video_source,
        }
    }

    pub fn get(&self, key: &SessionKey) -> Option<Arc<VoiceSession>> {
        self.sessions.get(key).map(|e| e.value().clone())
    }

    pub fn active(&self) -> Vec<Arc<VoiceSession>> {
        self.sessions.iter().map(|e| e.value().clone()).collect()
    }

    /// Acquires a ticket and opens a session. Any session already live on
    /// the same server (this channel included) is left first.
    pub async fn join(
        &self,
        server_id: ServerId,
        channel_id: ChannelId,
        identity: LocalIdentity,
        tickets: &dyn TicketSource,
    ) -> Result<Arc<VoiceSession>, SessionError> {
        let superseded: Vec<Arc<VoiceSession>> = self
            .sessions
            .iter()
            .filter(|e| e.key().0 == server_id)
            .map(|e| e.value().clone())
            .collect();
        for session in superseded {
            info!(
                server = %session.server_id,
                channel = %session.channel_id,
                "Superseding existing session"
            );
            session.leave().await;
        }
        self.sessions.retain(|key, _| key.0 != server_id);

        // the session exists before the ticket round-trip so a denial is
        // visible as an error-state session, not a silent absence
        let session = VoiceSession::new(
            self.api.clone(),
            server_id.clone(),
            channel_id.clone(),
            identity.clone(),
            self.config.clone(),
            self.video_source.clone(),
        );
        session.mark_joining().await;
        self.sessions
            .insert((server_id.clone(), channel_id.clone()), session.clone());

        let ticket = match tickets.acquire(&server_id, &channel_id, &identity).await {
            Ok(ticket) => ticket,
            Err(e) => {
                session.fail(e.to_string()).await;
                return Err(SessionError::Ticket(e));
            }
        };

        session.begin_join(&ticket).await;
        crate::transport::spawn(session.clone(), ticket);
        Ok(session)
    }

    /// Leaves and forgets one session. A no-op for unknown keys.
    pub async fn leave(&self, key: &SessionKey) {
        if let Some((_, session)) = self.sessions.remove(key) {
            session.leave().await;
        }
    }

    pub async fn leave_all(&self) {
        let keys: Vec<SessionKey> = self.sessions.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            self.leave(&key).await;
        }
    }
}
