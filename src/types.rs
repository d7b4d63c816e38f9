use crate::id_types::{ChannelId, ParticipantId, ServerId};
use crate::negotiation::PeerEntry;
use crate::protocol::Envelope;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

/// (ServerId, ChannelId) — the identity of one channel session.
pub type SessionKey = (ServerId, ChannelId);

/// Channel carrying outbound signaling envelopes to the transport pump.
pub type EnvelopeSender = mpsc::Sender<Envelope>;

/// Wrapped envelope sender with mutex and option; `None` while no transport
/// is attached.
pub type SharedEnvelopeSender = Arc<Mutex<Option<EnvelopeSender>>>;

/// Thread-safe map of peer connection entries, one per remote participant.
pub type PeerMap = Arc<DashMap<ParticipantId, Arc<PeerEntry>>>;
