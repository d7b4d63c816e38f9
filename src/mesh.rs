//! Peer connection mesh: one connection per remote participant, sharing the
//! session's signaling transport for out-of-band relay.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};
use webrtc::api::API;
use webrtc::ice_transport::ice_candidate::RTCIceCandidate;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use crate::id_types::ParticipantId;
use crate::negotiation::{OfferOutcome, PeerEntry};
use crate::protocol::Envelope;
use crate::types::{PeerMap, SharedEnvelopeSender};

#[derive(Debug)]
pub enum MeshError {
    /// Mesh operations need the local participant id for the polite role.
    NoLocalParticipant,
    Rtc(webrtc::Error),
}

impl std::fmt::Display for MeshError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MeshError::NoLocalParticipant => write!(f, "local participant id not yet known"),
            MeshError::Rtc(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for MeshError {}

impl From<webrtc::Error> for MeshError {
    fn from(e: webrtc::Error) -> Self {
        MeshError::Rtc(e)
    }
}

/// Notifications the mesh pushes back to the owning session.
pub enum MeshEvent {
    RemoteTrack {
        participant: ParticipantId,
        track: Arc<TrackRemote>,
    },
    ConnectionTerminal {
        participant: ParticipantId,
        state: RTCPeerConnectionState,
    },
}

pub struct PeerMesh {
    pub peers: PeerMap,
    api: Arc<API>,
    channel_id: String,
    outbound: SharedEnvelopeSender,
    events: mpsc::UnboundedSender<MeshEvent>,
    rtc_config: Mutex<RTCConfiguration>,
    local: Mutex<Option<ParticipantId>>,
}

impl PeerMesh {
    pub fn new(
        api: Arc<API>,
        channel_id: String,
        outbound: SharedEnvelopeSender,
        events: mpsc::UnboundedSender<MeshEvent>,
    ) -> Self {
        PeerMesh {
            peers: Arc::new(DashMap::new()),
            api,
            channel_id,
            outbound,
            events,
            rtc_config: Mutex::new(RTCConfiguration::default()),
            local: Mutex::new(None),
        }
    }

    /// Installs the ICE configuration delivered by the join ticket.
    pub async fn set_rtc_config(&self, config: RTCConfiguration) {
        *self.rtc_config.lock().await = config;
    }

    pub async fn set_local_participant(&self, local: ParticipantId) {
        *self.local.lock().await = Some(local);
    }

    pub fn contains(&self, participant: &ParticipantId) -> bool {
        self.peers.contains_key(participant)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn get(&self, participant: &ParticipantId) -> Option<Arc<PeerEntry>> {
        self.peers.get(participant).map(|e| e.value().clone())
    }

    /// Returns the entry for a remote participant, creating the connection
    /// lazily. Inbound offers/candidates can race ahead of a roster add, so
    /// lazy creation is the only correct behavior.
    pub async fn ensure_peer(
        &self,
        remote: &ParticipantId,
    ) -> Result<Arc<PeerEntry>, MeshError> {
        if let Some(entry) = self.get(remote) {
            return Ok(entry);
        }

        let local = self
            .local
            .lock()
            .await
            .clone()
            .ok_or(MeshError::NoLocalParticipant)?;

        let config = self.rtc_config.lock().await.clone();
        let pc = Arc::new(self.api.new_peer_connection(config).await?);
        let entry = Arc::new(PeerEntry::new(pc, &local, remote.clone()));
        self.attach_handlers(&entry);

        info!(
            participant = %remote,
            polite = entry.polite,
            "Peer connection created"
        );
        self.peers.insert(remote.clone(), entry.clone());
        Ok(entry)
    }

    fn attach_handlers(&self, entry: &Arc<PeerEntry>) {
        let outbound = self.outbound.clone();
        let channel_id = self.channel_id.clone();
        let target = entry.participant_id.clone();
        entry
            .pc
            .on_ice_candidate(Box::new(move |c: Option<RTCIceCandidate>| {
                let outbound = outbound.clone();
                let channel_id = channel_id.clone();
                let target = target.clone();
                Box::pin(async move {
                    if let Some(candidate) = c {
                        let init = match candidate.to_json() {
                            Ok(init) => init,
                            Err(e) => {
                                warn!(error = %e, "ICE candidate serialization failed");
                                return;
                            }
                        };
                        debug!(participant = %target, "Relaying ICE candidate");
                        let env = Envelope::ice_candidate(
                            channel_id,
                            target.as_ref().to_string(),
                            init,
                        );
                        let tx_lock = outbound.lock().await;
                        if let Some(tx) = tx_lock.as_ref() {
                            let _ = tx.send(env).await;
                        }
                    }
                })
            }));

        let events = self.events.clone();
        let participant = entry.participant_id.clone();
        entry
            .pc
            .on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
                info!(participant = %participant, state = %s, "Peer connection state changed");
                if matches!(
                    s,
                    RTCPeerConnectionState::Failed | RTCPeerConnectionState::Closed
                ) {
                    let _ = events.send(MeshEvent::ConnectionTerminal {
                        participant: participant.clone(),
                        state: s,
                    });
                }
                Box::pin(async {})
            }));

        let events = self.events.clone();
        let participant = entry.participant_id.clone();
        entry
            .pc
            .on_track(Box::new(move |track: Arc<TrackRemote>, _receiver, _transceiver| {
                info!(
                    participant = %participant,
                    kind = %track.kind(),
                    track_id = %track.id(),
                    stream_id = %track.stream_id(),
                    "Remote track arrived"
                );
                let _ = events.send(MeshEvent::RemoteTrack {
                    participant: participant.clone(),
                    track,
                });
                Box::pin(async {})
            }));
    }

    /// Resync plus renegotiation when anything changed. The entry holds its
    /// signaling lock for the whole span.
    pub async fn sync_and_offer(
        &self,
        entry: &Arc<PeerEntry>,
        desired: &[Arc<dyn TrackLocal + Send + Sync>],
        reason: &str,
    ) -> Result<(), MeshError> {
        entry
            .sync_and_offer(&self.channel_id, &self.outbound, desired, reason)
            .await?;
        Ok(())
    }

    /// Feeds a remote offer through one connection's serialized
    /// offer-answer transaction, with the current local track set.
    pub async fn handle_remote_offer(
        &self,
        entry: &Arc<PeerEntry>,
        sdp: String,
        desired: &[Arc<dyn TrackLocal + Send + Sync>],
    ) -> Result<OfferOutcome, MeshError> {
        Ok(entry
            .answer_remote_offer(&self.channel_id, &self.outbound, sdp, desired)
            .await?)
    }

    /// Pushes the desired track set to every existing connection.
    pub async fn sync_all(
        &self,
        desired: &[Arc<dyn TrackLocal + Send + Sync>],
        reason: &str,
    ) -> Vec<(ParticipantId, MeshError)> {
        let entries: Vec<Arc<PeerEntry>> =
            self.peers.iter().map(|e| e.value().clone()).collect();
        let mut failures = Vec::new();
        for entry in entries {
            if let Err(e) = self.sync_and_offer(&entry, desired, reason).await {
                failures.push((entry.participant_id.clone(), e));
            }
        }
        failures
    }

    pub fn channel_id(&self) -> &str {
        &self.channel_id
    }

    pub fn outbound(&self) -> &SharedEnvelopeSender {
        &self.outbound
    }

    /// Retries a deferred renegotiation need once a connection settled.
    pub async fn flush_deferred(&self, entry: &Arc<PeerEntry>, reason: String) {
        if let Err(e) = entry.try_offer(&self.channel_id, &self.outbound, &reason).await {
            warn!(participant = %entry.participant_id, error = %e, "Deferred offer failed");
        }
    }

    /// Closes and removes one connection. Its in-flight negotiation is
    /// abandoned, never awaited.
    pub async fn remove_peer(&self, participant: &ParticipantId) {
        if let Some((_, entry)) = self.peers.remove(participant) {
            info!(participant = %participant, "Closing peer connection");
            entry.close().await;
        }
    }

    pub async fn close_all(&self) {
        let participants: Vec<ParticipantId> =
            self.peers.iter().map(|e| e.key().clone()).collect();
        for p in participants {
            self.remove_peer(&p).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media_setup::MediaSetup;
    use crate::video::{SampleVideoSource, VideoSource};

    fn test_mesh() -> (PeerMesh, mpsc::UnboundedReceiver<MeshEvent>) {
        let api = Arc::new(MediaSetup::create_webrtc_api());
        let outbound: SharedEnvelopeSender = Arc::new(Mutex::new(None));
        let (tx, rx) = mpsc::unbounded_channel();
        (PeerMesh::new(api, "ch-1".to_string(), outbound, tx), rx)
    }

    #[tokio::test]
    async fn test_ensure_peer_requires_local_identity() {
        let (mesh, _rx) = test_mesh();
        let err = mesh.ensure_peer(&ParticipantId::from("p-2")).await;
        assert!(matches!(err, Err(MeshError::NoLocalParticipant)));
    }

    #[tokio::test]
    async fn test_ensure_peer_is_idempotent() {
        let (mesh, _rx) = test_mesh();
        mesh.set_local_participant(ParticipantId::from("p-1")).await;

        let remote = ParticipantId::from("p-2");
        let first = mesh.ensure_peer(&remote).await.unwrap();
        let second = mesh.ensure_peer(&remote).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(mesh.len(), 1);

        mesh.close_all().await;
        assert!(mesh.is_empty());
    }

    #[tokio::test]
    async fn test_resync_senders_adds_and_removes() {
        let (mesh, _rx) = test_mesh();
        mesh.set_local_participant(ParticipantId::from("p-1")).await;
        let entry = mesh.ensure_peer(&ParticipantId::from("p-2")).await.unwrap();

        let source = SampleVideoSource;
        let camera = source.open_camera().await.unwrap();
        let screen = source.open_screen(None).await.unwrap();

        let desired: Vec<Arc<dyn TrackLocal + Send + Sync>> = vec![camera.clone()];
        assert!(entry.resync_senders(&desired).await.unwrap());
        assert_eq!(entry.pc.get_senders().await.len(), 1);

        // same set again: no change
        assert!(!entry.resync_senders(&desired).await.unwrap());

        // swap camera for screen
        let desired: Vec<Arc<dyn TrackLocal + Send + Sync>> = vec![screen.clone()];
        assert!(entry.resync_senders(&desired).await.unwrap());

        mesh.close_all().await;
    }
}
