//! Wire-level signaling protocol: JSON envelopes exchanged over the
//! persistent transport.
//!
//! Inbound envelopes are resolved to the closed [`ServerEvent`] enum with an
//! explicit `Ignored` arm, so dispatch is an exhaustive match rather than
//! string comparison scattered through the session.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;

use crate::ticket::Permissions;
use crate::video::VideoKind;

/// A single signaling message as it appears on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

// Envelope kinds consumed from the server.
pub const KIND_JOINED: &str = "joined";
pub const KIND_PARTICIPANT_JOINED: &str = "participant.joined";
pub const KIND_PARTICIPANT_LEFT: &str = "participant.left";
pub const KIND_OFFER: &str = "offer.publish";
pub const KIND_ANSWER: &str = "answer.publish";
pub const KIND_ICE_CANDIDATE: &str = "ice.candidate";
pub const KIND_MEDIA_STATE: &str = "media.state";
pub const KIND_KICKED: &str = "kicked";
pub const KIND_ERROR: &str = "error";

// Envelope kinds produced by the client.
pub const KIND_JOIN: &str = "join";
pub const KIND_LEAVE: &str = "leave";

/// Roster entry as carried by `joined` and `participant.joined`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParticipantInfo {
    pub participant_id: String,
    #[serde(default)]
    pub user_uid: String,
    #[serde(default)]
    pub device_id: String,
}

/// Payload of the `joined` acceptance: roster + local participant id +
/// confirmed permissions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinedPayload {
    pub participant_id: String,
    #[serde(default)]
    pub participants: Vec<ParticipantInfo>,
    #[serde(default)]
    pub permissions: Permissions,
}

/// SDP-equivalent description relay (`offer.publish` / `answer.publish`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DescriptionPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    pub sdp: String,
}

/// ICE candidate relay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IcePayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    pub candidate: RTCIceCandidateInit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoAction {
    Start,
    Stop,
}

/// `media.state` is a multiplexed side channel: mic mute/deafen broadcast,
/// video start/stop hints, and raw PCM audio chunks all travel under it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MediaStatePayload {
    MicState {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        participant_id: Option<String>,
        muted: bool,
        deafened: bool,
    },
    Video {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        participant_id: Option<String>,
        action: VideoAction,
        track_kind: VideoKind,
        track_id: String,
        stream_id: String,
    },
    AudioChunk {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        participant_id: Option<String>,
        stream_id: String,
        seq: u64,
        /// Base64-encoded i16 little-endian PCM samples.
        data: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KickedPayload {
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub message: String,
}

/// Payload of the outbound `join`: the one-time ticket token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinPayload {
    pub ticket: String,
}

#[derive(Debug)]
pub enum ProtocolError {
    MissingPayload(String),
    Malformed(String, serde_json::Error),
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProtocolError::MissingPayload(kind) => {
                write!(f, "'{}' envelope arrived without a payload", kind)
            }
            ProtocolError::Malformed(kind, err) => {
                write!(f, "malformed '{}' payload: {}", kind, err)
            }
        }
    }
}

impl std::error::Error for ProtocolError {}

/// All inbound envelope kinds the session understands, plus an explicit
/// ignored arm for everything else.
#[derive(Debug, Clone)]
pub enum ServerEvent {
    Joined(JoinedPayload),
    ParticipantJoined(ParticipantInfo),
    ParticipantLeft { participant_id: String },
    Offer(DescriptionPayload),
    Answer(DescriptionPayload),
    IceCandidate(IcePayload),
    MediaState(MediaStatePayload),
    Kicked(KickedPayload),
    ServerError(ErrorPayload),
    /// Unknown kind; carried for logging, otherwise dropped.
    Ignored(String),
}

fn payload_as<T: serde::de::DeserializeOwned>(env: &Envelope) -> Result<T, ProtocolError> {
    let value = env
        .payload
        .clone()
        .ok_or_else(|| ProtocolError::MissingPayload(env.kind.clone()))?;
    serde_json::from_value(value).map_err(|e| ProtocolError::Malformed(env.kind.clone(), e))
}

impl ServerEvent {
    pub fn from_envelope(env: &Envelope) -> Result<ServerEvent, ProtocolError> {
        let event = match env.kind.as_str() {
            KIND_JOINED => ServerEvent::Joined(payload_as(env)?),
            KIND_PARTICIPANT_JOINED => ServerEvent::ParticipantJoined(payload_as(env)?),
            KIND_PARTICIPANT_LEFT => {
                let info: ParticipantInfo = payload_as(env)?;
                ServerEvent::ParticipantLeft {
                    participant_id: info.participant_id,
                }
            }
            KIND_OFFER => ServerEvent::Offer(payload_as(env)?),
            KIND_ANSWER => ServerEvent::Answer(payload_as(env)?),
            KIND_ICE_CANDIDATE => ServerEvent::IceCandidate(payload_as(env)?),
            KIND_MEDIA_STATE => ServerEvent::MediaState(payload_as(env)?),
            KIND_KICKED => ServerEvent::Kicked(payload_as(env).unwrap_or(KickedPayload {
                reason: None,
            })),
            KIND_ERROR => ServerEvent::ServerError(payload_as(env)?),
            other => ServerEvent::Ignored(other.to_string()),
        };
        Ok(event)
    }
}

fn to_payload<T: Serialize>(payload: &T) -> Option<Value> {
    // Our payload structs serialize infallibly; a failure here is a bug.
    Some(serde_json::to_value(payload).expect("payload serialization"))
}

impl Envelope {
    pub fn new(kind: &str, channel_id: Option<String>) -> Self {
        Envelope {
            kind: kind.to_string(),
            request_id: None,
            channel_id,
            payload: None,
        }
    }

    pub fn with_request_id(mut self, request_id: String) -> Self {
        self.request_id = Some(request_id);
        self
    }

    /// Command envelopes carry a fresh request id so server responses and
    /// error frames can be correlated.
    pub fn join(channel_id: String, ticket_token: String) -> Self {
        Envelope {
            payload: to_payload(&JoinPayload {
                ticket: ticket_token,
            }),
            ..Envelope::new(KIND_JOIN, Some(channel_id))
        }
        .with_request_id(Uuid::new_v4().to_string())
    }

    pub fn leave(channel_id: String) -> Self {
        Envelope::new(KIND_LEAVE, Some(channel_id)).with_request_id(Uuid::new_v4().to_string())
    }

    pub fn offer(channel_id: String, target: String, sdp: String) -> Self {
        Envelope {
            payload: to_payload(&DescriptionPayload {
                from: None,
                target: Some(target),
                sdp,
            }),
            ..Envelope::new(KIND_OFFER, Some(channel_id))
        }
    }

    pub fn answer(channel_id: String, target: String, sdp: String) -> Self {
        Envelope {
            payload: to_payload(&DescriptionPayload {
                from: None,
                target: Some(target),
                sdp,
            }),
            ..Envelope::new(KIND_ANSWER, Some(channel_id))
        }
    }

    pub fn ice_candidate(
        channel_id: String,
        target: String,
        candidate: RTCIceCandidateInit,
    ) -> Self {
        Envelope {
            payload: to_payload(&IcePayload {
                from: None,
                target: Some(target),
                candidate,
            }),
            ..Envelope::new(KIND_ICE_CANDIDATE, Some(channel_id))
        }
    }

    pub fn media_state(channel_id: String, payload: &MediaStatePayload) -> Self {
        Envelope {
            payload: to_payload(payload),
            ..Envelope::new(KIND_MEDIA_STATE, Some(channel_id))
        }
    }
}
