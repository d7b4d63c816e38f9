//! Video track management: local camera/screen acquisition and
//! classification of inbound tracks as camera or screen.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_remote::TrackRemote;

use crate::devices::DeviceError;
use crate::id_types::{ParticipantId, StreamId, TrackId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoKind {
    Camera,
    Screen,
}

impl std::fmt::Display for VideoKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VideoKind::Camera => write!(f, "camera"),
            VideoKind::Screen => write!(f, "screen"),
        }
    }
}

const SCREEN_LABEL_HINTS: [&str; 4] = ["screen", "display", "window", "monitor"];

impl VideoKind {
    /// Label-based fallback for tracks that arrived without a hint.
    pub fn from_label(label: &str) -> VideoKind {
        let lower = label.to_lowercase();
        if SCREEN_LABEL_HINTS.iter().any(|h| lower.contains(h)) {
            VideoKind::Screen
        } else {
            VideoKind::Camera
        }
    }
}

/// Ephemeral (participant, track) → kind hints announced by publishers
/// before or around track activation.
#[derive(Default)]
pub struct VideoHintMap {
    hints: DashMap<(ParticipantId, String), VideoKind>,
}

impl VideoHintMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, participant: ParticipantId, track_id: String, kind: VideoKind) {
        self.hints.insert((participant, track_id), kind);
    }

    pub fn get(&self, participant: &ParticipantId, track_id: &str) -> Option<VideoKind> {
        self.hints
            .get(&(participant.clone(), track_id.to_string()))
            .map(|entry| *entry.value())
    }

    pub fn remove(&self, participant: &ParticipantId, track_id: &str) {
        self.hints.remove(&(participant.clone(), track_id.to_string()));
    }

    pub fn remove_participant(&self, participant: &ParticipantId) {
        self.hints.retain(|(p, _), _| p != participant);
    }

    pub fn clear(&self) {
        self.hints.clear();
    }

    /// Hint first, label fallback second.
    pub fn classify(&self, participant: &ParticipantId, track_id: &str, label: &str) -> VideoKind {
        self.get(participant, track_id)
            .unwrap_or_else(|| VideoKind::from_label(label))
    }
}

/// Underlying media handle of a registered stream.
#[derive(Clone)]
pub enum VideoHandle {
    Local(Arc<TrackLocalStaticSample>),
    Remote(Arc<TrackRemote>),
}

impl std::fmt::Debug for VideoHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VideoHandle::Local(_) => write!(f, "VideoHandle::Local"),
            VideoHandle::Remote(_) => write!(f, "VideoHandle::Remote"),
        }
    }
}

/// One active video stream, keyed by (participant, track).
#[derive(Debug, Clone)]
pub struct VideoStream {
    pub participant_id: ParticipantId,
    pub track_id: TrackId,
    pub stream_id: StreamId,
    pub kind: VideoKind,
    pub is_local: bool,
    pub started_at: Instant,
    pub handle: Option<VideoHandle>,
}

/// Collaborator that acquires local capture tracks. The embedding
/// application supplies frames into the returned sample tracks.
#[async_trait]
pub trait VideoSource: Send + Sync {
    async fn open_camera(&self) -> Result<Arc<TrackLocalStaticSample>, DeviceError>;
    async fn open_screen(
        &self,
        source_id: Option<String>,
    ) -> Result<Arc<TrackLocalStaticSample>, DeviceError>;
}

fn vp8_capability() -> RTCRtpCodecCapability {
    RTCRtpCodecCapability {
        mime_type: "video/VP8".to_owned(),
        clock_rate: 90000,
        ..Default::default()
    }
}

/// Default source: creates sample-fed VP8 tracks with fresh ids.
#[derive(Default)]
pub struct SampleVideoSource;

#[async_trait]
impl VideoSource for SampleVideoSource {
    async fn open_camera(&self) -> Result<Arc<TrackLocalStaticSample>, DeviceError> {
        Ok(Arc::new(TrackLocalStaticSample::new(
            vp8_capability(),
            format!("camera-{}", Uuid::new_v4()),
            Uuid::new_v4().to_string(),
        )))
    }

    async fn open_screen(
        &self,
        source_id: Option<String>,
    ) -> Result<Arc<TrackLocalStaticSample>, DeviceError> {
        let suffix = source_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        Ok(Arc::new(TrackLocalStaticSample::new(
            vp8_capability(),
            format!("screen-{}", suffix),
            Uuid::new_v4().to_string(),
        )))
    }
}
