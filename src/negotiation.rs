//! Perfect negotiation for one peer connection.
//!
//! Each connection carries a `polite` role fixed at creation so both ends
//! resolve simultaneous-offer collisions identically without extra round
//! trips. Negotiation progress is an explicit state machine; the per-entry
//! signaling lock serializes every description-touching transaction so two
//! suspended operations can never interleave on the same connection.

use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::track::track_local::TrackLocal;

use crate::id_types::ParticipantId;
use crate::protocol::Envelope;
use crate::types::SharedEnvelopeSender;

/// Both sides derive politeness from the same order-independent id
/// comparison, so the assignment is symmetric by construction.
pub fn is_polite(local: &ParticipantId, remote: &ParticipantId) -> bool {
    local.as_ref() < remote.as_ref()
}

/// Negotiation progress on one connection. `Deferred` records a local
/// renegotiation need that arrived while the connection was not in a state
/// to offer; it is flushed once the connection settles.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NegotiationPhase {
    Idle,
    Offering,
    AwaitingAnswer,
    ApplyingAnswer,
    Deferred(String),
}

#[derive(Debug)]
pub struct NegotiationState {
    phase: NegotiationPhase,
    /// Need that arrived while a phase was already in flight.
    pending: Option<String>,
}

impl Default for NegotiationState {
    fn default() -> Self {
        Self::new()
    }
}

impl NegotiationState {
    pub fn new() -> Self {
        NegotiationState {
            phase: NegotiationPhase::Idle,
            pending: None,
        }
    }

    pub fn phase(&self) -> &NegotiationPhase {
        &self.phase
    }

    /// Records a local renegotiation need. Returns true if an offer may be
    /// created right now; otherwise the need is deferred.
    pub fn begin_offer(&mut self, signaling_stable: bool, reason: &str) -> bool {
        match self.phase {
            NegotiationPhase::Idle | NegotiationPhase::Deferred(_) if signaling_stable => {
                self.phase = NegotiationPhase::Offering;
                true
            }
            NegotiationPhase::Idle | NegotiationPhase::Deferred(_) => {
                self.phase = NegotiationPhase::Deferred(reason.to_string());
                false
            }
            _ => {
                self.pending = Some(reason.to_string());
                false
            }
        }
    }

    pub fn offer_sent(&mut self) {
        self.phase = NegotiationPhase::AwaitingAnswer;
    }

    pub fn offer_failed(&mut self) {
        self.phase = NegotiationPhase::Idle;
    }

    /// A collision exists when we are mid-offer or the signaling state is
    /// not stable.
    pub fn collision(&self, signaling_stable: bool) -> bool {
        let mid_offer = matches!(
            self.phase,
            NegotiationPhase::Offering | NegotiationPhase::AwaitingAnswer
        );
        mid_offer || !signaling_stable
    }

    /// The impolite side drops a colliding inbound offer outright; its own
    /// offer wins the race.
    pub fn should_ignore_offer(&self, polite: bool, signaling_stable: bool) -> bool {
        !polite && self.collision(signaling_stable)
    }

    /// Remote offer fully handled (answer sent); returns any deferred need
    /// to flush. The deferred slot is drained before the phase resets so a
    /// need recorded while signaling was unstable is not lost.
    pub fn remote_offer_handled(&mut self) -> Option<String> {
        let deferred = self.take_deferred();
        self.phase = NegotiationPhase::Idle;
        deferred
    }

    pub fn begin_apply_answer(&mut self) {
        if let NegotiationPhase::Deferred(reason) = &self.phase {
            let reason = reason.clone();
            self.pending.get_or_insert(reason);
        }
        self.phase = NegotiationPhase::ApplyingAnswer;
    }

    /// Answer finished applying; returns any deferred need to flush.
    pub fn answer_applied(&mut self) -> Option<String> {
        let deferred = self.take_deferred();
        self.phase = NegotiationPhase::Idle;
        deferred
    }

    fn take_deferred(&mut self) -> Option<String> {
        if let NegotiationPhase::Deferred(reason) = &self.phase {
            let reason = reason.clone();
            self.phase = NegotiationPhase::Idle;
            return Some(reason);
        }
        self.pending.take()
    }
}

/// Outcome of feeding a remote offer into a connection.
#[derive(Debug, PartialEq, Eq)]
pub enum OfferOutcome {
    /// Impolite side mid-offer: the inbound offer was dropped.
    Ignored,
    /// Offer applied and answered; carries any deferred need to flush.
    Answered { deferred: Option<String> },
}

/// One peer connection toward a remote participant, with its negotiation
/// machinery. Created lazily on roster add or on an inbound offer/candidate
/// for an unknown participant.
pub struct PeerEntry {
    pub pc: Arc<RTCPeerConnection>,
    pub participant_id: ParticipantId,
    pub polite: bool,
    pub state: Mutex<NegotiationState>,
    /// Serializes offer creation and remote description application on
    /// this connection.
    pub signaling_lock: Arc<Mutex<()>>,
}

impl PeerEntry {
    pub fn new(pc: Arc<RTCPeerConnection>, local: &ParticipantId, remote: ParticipantId) -> Self {
        let polite = is_polite(local, &remote);
        PeerEntry {
            pc,
            participant_id: remote,
            polite,
            state: Mutex::new(NegotiationState::new()),
            signaling_lock: Arc::new(Mutex::new(())),
        }
    }

    fn signaling_stable(&self) -> bool {
        self.pc.signaling_state() == RTCSignalingState::Stable
    }

    /// Attempts a renegotiation offer. Deferred needs are retried by the
    /// mesh once the connection settles; this never blocks on the answer.
    pub async fn try_offer(
        &self,
        channel_id: &str,
        outbound: &SharedEnvelopeSender,
        reason: &str,
    ) -> Result<(), webrtc::Error> {
        let _guard = self.signaling_lock.lock().await;
        self.offer_locked(channel_id, outbound, reason).await
    }

    /// Reconciles senders against the desired local track set under the
    /// signaling lock, offering only when anything changed.
    pub async fn sync_and_offer(
        &self,
        channel_id: &str,
        outbound: &SharedEnvelopeSender,
        desired: &[Arc<dyn TrackLocal + Send + Sync>],
        reason: &str,
    ) -> Result<(), webrtc::Error> {
        let _guard = self.signaling_lock.lock().await;
        if self.resync_locked(desired).await? {
            self.offer_locked(channel_id, outbound, reason).await?;
        }
        Ok(())
    }

    async fn offer_locked(
        &self,
        channel_id: &str,
        outbound: &SharedEnvelopeSender,
        reason: &str,
    ) -> Result<(), webrtc::Error> {
        {
            let mut state = self.state.lock().await;
            if !state.begin_offer(self.signaling_stable(), reason) {
                debug!(
                    participant = %self.participant_id,
                    reason = reason,
                    "Offer deferred"
                );
                return Ok(());
            }
        }

        let result: Result<String, webrtc::Error> = async {
            let offer = self.pc.create_offer(None).await?;
            let sdp = offer.sdp.clone();
            self.pc.set_local_description(offer).await?;
            Ok(sdp)
        }
        .await;

        let mut state = self.state.lock().await;
        match result {
            Ok(sdp) => {
                state.offer_sent();
                drop(state);
                info!(participant = %self.participant_id, reason = reason, "Sending offer");
                send(
                    outbound,
                    Envelope::offer(
                        channel_id.to_string(),
                        self.participant_id.as_ref().to_string(),
                        sdp,
                    ),
                )
                .await;
                Ok(())
            }
            Err(e) => {
                state.offer_failed();
                Err(e)
            }
        }
    }

    /// Handles a remote offer end to end under the signaling lock: glare
    /// resolution, sender reconciliation so the answer already carries the
    /// current local track set, then the answer itself. The lock spans the
    /// whole transaction so an interleaving local offer cannot corrupt the
    /// descriptions.
    pub async fn answer_remote_offer(
        &self,
        channel_id: &str,
        outbound: &SharedEnvelopeSender,
        sdp: String,
        desired: &[Arc<dyn TrackLocal + Send + Sync>],
    ) -> Result<OfferOutcome, webrtc::Error> {
        let _guard = self.signaling_lock.lock().await;
        if !self.apply_remote_offer_locked(sdp).await? {
            return Ok(OfferOutcome::Ignored);
        }
        self.resync_locked(desired).await?;
        let deferred = self.answer_locked(channel_id, outbound).await?;
        Ok(OfferOutcome::Answered { deferred })
    }

    /// Stand-alone sender reconciliation under the signaling lock.
    pub async fn resync_senders(
        &self,
        desired: &[Arc<dyn TrackLocal + Send + Sync>],
    ) -> Result<bool, webrtc::Error> {
        let _guard = self.signaling_lock.lock().await;
        self.resync_locked(desired).await
    }

    /// Removes stale senders and adds missing tracks. Returns whether
    /// anything changed.
    async fn resync_locked(
        &self,
        desired: &[Arc<dyn TrackLocal + Send + Sync>],
    ) -> Result<bool, webrtc::Error> {
        let mut changed = false;
        let mut present: HashSet<String> = HashSet::new();

        for sender in self.pc.get_senders().await {
            if let Some(track) = sender.track().await {
                let id = track.id().to_string();
                if desired.iter().any(|d| d.id() == id) {
                    present.insert(id);
                } else {
                    debug!(participant = %self.participant_id, track_id = %id, "Removing stale sender");
                    self.pc.remove_track(&sender).await?;
                    changed = true;
                }
            }
        }

        for track in desired {
            if !present.contains(track.id()) {
                debug!(participant = %self.participant_id, track_id = %track.id(), "Adding sender");
                self.pc.add_track(Arc::clone(track)).await?;
                changed = true;
            }
        }

        Ok(changed)
    }

    /// Returns false when the offer was a glare loss for the remote side.
    async fn apply_remote_offer_locked(&self, sdp: String) -> Result<bool, webrtc::Error> {
        let collision = {
            let state = self.state.lock().await;
            let stable = self.signaling_stable();
            if state.should_ignore_offer(self.polite, stable) {
                info!(
                    participant = %self.participant_id,
                    "Ignoring colliding offer (impolite)"
                );
                return Ok(false);
            }
            state.collision(stable)
        };

        if collision {
            // Polite side: roll back our own pending local description so
            // the remote offer can apply cleanly.
            let mut rollback = RTCSessionDescription::default();
            rollback.sdp_type = RTCSdpType::Rollback;
            if let Err(e) = self.pc.set_local_description(rollback).await {
                warn!(
                    participant = %self.participant_id,
                    error = %e,
                    "Rollback failed; applying remote offer regardless"
                );
            }
            let mut state = self.state.lock().await;
            state.offer_failed();
        }

        let desc = RTCSessionDescription::offer(sdp)?;
        self.pc.set_remote_description(desc).await?;
        Ok(true)
    }

    async fn answer_locked(
        &self,
        channel_id: &str,
        outbound: &SharedEnvelopeSender,
    ) -> Result<Option<String>, webrtc::Error> {
        let answer = self.pc.create_answer(None).await?;
        let sdp = answer.sdp.clone();
        self.pc.set_local_description(answer).await?;

        send(
            outbound,
            Envelope::answer(
                channel_id.to_string(),
                self.participant_id.as_ref().to_string(),
                sdp,
            ),
        )
        .await;

        let mut state = self.state.lock().await;
        Ok(state.remote_offer_handled())
    }

    /// Applies a remote answer under the signaling lock and the
    /// `ApplyingAnswer` guard so the offer path cannot speculatively
    /// re-offer mid-apply. Returns any deferred need to flush.
    pub async fn apply_remote_answer(&self, sdp: String) -> Result<Option<String>, webrtc::Error> {
        let _guard = self.signaling_lock.lock().await;
        {
            let mut state = self.state.lock().await;
            state.begin_apply_answer();
        }

        let desc = RTCSessionDescription::answer(sdp)?;
        let applied = self.pc.set_remote_description(desc).await;

        let mut state = self.state.lock().await;
        match applied {
            Ok(()) => Ok(state.answer_applied()),
            Err(e) => {
                state.offer_failed();
                Err(e)
            }
        }
    }

    pub async fn add_remote_candidate(
        &self,
        candidate: RTCIceCandidateInit,
    ) -> Result<(), webrtc::Error> {
        self.pc.add_ice_candidate(candidate).await
    }

    /// Closing discards in-flight negotiation; late resolutions against a
    /// closed connection are no-ops.
    pub async fn close(&self) {
        if let Err(e) = self.pc.close().await {
            debug!(participant = %self.participant_id, error = %e, "Close failed");
        }
    }
}

async fn send(outbound: &SharedEnvelopeSender, env: Envelope) {
    let tx_lock = outbound.lock().await;
    if let Some(tx) = tx_lock.as_ref() {
        let _ = tx.send(env).await;
    } else {
        warn!("Envelope dropped: no transport attached");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use webrtc::api::APIBuilder;
    use webrtc::peer_connection::configuration::RTCConfiguration;

    #[test]
    fn test_polite_assignment_is_symmetric() {
        let a = ParticipantId::from("alpha");
        let b = ParticipantId::from("beta");
        assert!(is_polite(&a, &b));
        assert!(!is_polite(&b, &a));
        assert_eq!(is_polite(&a, &b), !is_polite(&b, &a));
    }

    #[test]
    fn test_begin_offer_stable_transitions_to_offering() {
        let mut state = NegotiationState::new();
        assert!(state.begin_offer(true, "tracks-changed"));
        assert_eq!(*state.phase(), NegotiationPhase::Offering);
    }

    #[test]
    fn test_begin_offer_unstable_defers() {
        let mut state = NegotiationState::new();
        assert!(!state.begin_offer(false, "tracks-changed"));
        assert_eq!(
            *state.phase(),
            NegotiationPhase::Deferred("tracks-changed".to_string())
        );

        // the deferred need survives until the connection settles
        assert_eq!(state.take_deferred(), Some("tracks-changed".to_string()));
        assert_eq!(*state.phase(), NegotiationPhase::Idle);
    }

    #[test]
    fn test_need_while_awaiting_answer_is_pended() {
        let mut state = NegotiationState::new();
        assert!(state.begin_offer(true, "first"));
        state.offer_sent();
        assert!(!state.begin_offer(true, "second"));
        assert_eq!(*state.phase(), NegotiationPhase::AwaitingAnswer);

        state.begin_apply_answer();
        assert_eq!(state.answer_applied(), Some("second".to_string()));
        assert_eq!(*state.phase(), NegotiationPhase::Idle);
    }

    #[test]
    fn test_ignore_offer_matrix() {
        // polite never ignores
        let mut state = NegotiationState::new();
        assert!(state.begin_offer(true, "r"));
        assert!(!state.should_ignore_offer(true, false));

        // impolite mid-offer ignores
        assert!(state.should_ignore_offer(false, true));

        // impolite and idle+stable accepts
        let idle = NegotiationState::new();
        assert!(!idle.should_ignore_offer(false, true));

        // impolite, idle but unstable signaling still ignores
        assert!(idle.should_ignore_offer(false, false));
    }

    #[test]
    fn test_offer_collision_converges() {
        // A impolite, B polite, both start offering simultaneously.
        let a_id = ParticipantId::from("zz-a");
        let b_id = ParticipantId::from("aa-b");
        let polite_of_a = is_polite(&a_id, &b_id);
        let polite_of_b = is_polite(&b_id, &a_id);
        assert!(!polite_of_a);
        assert!(polite_of_b);

        let mut a = NegotiationState::new();
        let mut b = NegotiationState::new();
        assert!(a.begin_offer(true, "glare"));
        assert!(b.begin_offer(true, "glare"));
        a.offer_sent();
        b.offer_sent();

        // A (impolite) receives B's offer mid-offer: ignored.
        assert!(a.should_ignore_offer(polite_of_a, false));

        // B (polite) receives A's offer mid-offer: accepted after rollback.
        assert!(!b.should_ignore_offer(polite_of_b, false));
        assert!(b.collision(false));
        b.offer_failed(); // rollback discards B's own offer
        assert!(b.remote_offer_handled().is_none());
        assert_eq!(*b.phase(), NegotiationPhase::Idle);

        // A's offer then completes normally.
        a.begin_apply_answer();
        assert!(a.answer_applied().is_none());
        assert_eq!(*a.phase(), NegotiationPhase::Idle);
    }

    #[tokio::test]
    async fn test_try_offer_emits_envelope() {
        let api = APIBuilder::new().build();
        let pc = Arc::new(
            api.new_peer_connection(RTCConfiguration::default())
                .await
                .unwrap(),
        );
        // give the connection something to negotiate
        pc.create_data_channel("probe", None).await.unwrap();

        let local = ParticipantId::from("p-local");
        let entry = PeerEntry::new(pc, &local, ParticipantId::from("p-remote"));

        let (tx, mut rx) = tokio::sync::mpsc::channel(4);
        let outbound: SharedEnvelopeSender = Arc::new(Mutex::new(Some(tx)));

        entry.try_offer("ch-1", &outbound, "join").await.unwrap();

        let env = rx.recv().await.unwrap();
        assert_eq!(env.kind, crate::protocol::KIND_OFFER);
        assert_eq!(
            *entry.state.lock().await.phase(),
            NegotiationPhase::AwaitingAnswer
        );

        // a second need while awaiting the answer is deferred, not sent
        entry.try_offer("ch-1", &outbound, "tracks").await.unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_full_offer_answer_exchange() {
        let api = APIBuilder::new().build();
        let pc_a = Arc::new(
            api.new_peer_connection(RTCConfiguration::default())
                .await
                .unwrap(),
        );
        let pc_b = Arc::new(
            api.new_peer_connection(RTCConfiguration::default())
                .await
                .unwrap(),
        );
        pc_a.create_data_channel("probe", None).await.unwrap();

        let a_id = ParticipantId::from("p-a");
        let b_id = ParticipantId::from("p-b");
        let a = PeerEntry::new(pc_a, &a_id, b_id.clone());
        let b = PeerEntry::new(pc_b, &b_id, a_id.clone());

        let (tx_a, mut rx_a) = tokio::sync::mpsc::channel(4);
        let out_a: SharedEnvelopeSender = Arc::new(Mutex::new(Some(tx_a)));
        let (tx_b, mut rx_b) = tokio::sync::mpsc::channel(4);
        let out_b: SharedEnvelopeSender = Arc::new(Mutex::new(Some(tx_b)));

        a.try_offer("ch", &out_a, "join").await.unwrap();
        let offer_env = rx_a.recv().await.unwrap();
        let offer: crate::protocol::DescriptionPayload =
            serde_json::from_value(offer_env.payload.unwrap()).unwrap();

        assert_eq!(
            b.answer_remote_offer("ch", &out_b, offer.sdp, &[]).await.unwrap(),
            OfferOutcome::Answered { deferred: None }
        );

        let answer_env = rx_b.recv().await.unwrap();
        assert_eq!(answer_env.kind, crate::protocol::KIND_ANSWER);
        let answer: crate::protocol::DescriptionPayload =
            serde_json::from_value(answer_env.payload.unwrap()).unwrap();

        assert!(a.apply_remote_answer(answer.sdp).await.unwrap().is_none());
        assert_eq!(*a.state.lock().await.phase(), NegotiationPhase::Idle);

        a.close().await;
        b.close().await;
    }

    #[test]
    fn test_deferred_need_survives_remote_offer() {
        let mut state = NegotiationState::new();
        // unstable signaling at the time of the local need
        assert!(!state.begin_offer(false, "camera-start"));
        assert_eq!(
            state.remote_offer_handled(),
            Some("camera-start".to_string())
        );
        assert_eq!(*state.phase(), NegotiationPhase::Idle);
    }

    #[test]
    fn test_deferred_need_survives_answer_application() {
        let mut state = NegotiationState::new();
        assert!(!state.begin_offer(false, "screen-start"));
        state.begin_apply_answer();
        assert_eq!(*state.phase(), NegotiationPhase::ApplyingAnswer);
        assert_eq!(state.answer_applied(), Some("screen-start".to_string()));
    }

    #[tokio::test]
    async fn test_remote_offer_waits_for_signaling_lock() {
        let api = APIBuilder::new().build();
        let pc_a = Arc::new(
            api.new_peer_connection(RTCConfiguration::default())
                .await
                .unwrap(),
        );
        let pc_b = Arc::new(
            api.new_peer_connection(RTCConfiguration::default())
                .await
                .unwrap(),
        );
        pc_a.create_data_channel("probe", None).await.unwrap();

        let a_id = ParticipantId::from("p-a");
        let b_id = ParticipantId::from("p-b");
        let a = PeerEntry::new(pc_a, &a_id, b_id.clone());
        let b = Arc::new(PeerEntry::new(pc_b, &b_id, a_id.clone()));

        let (tx_a, mut rx_a) = tokio::sync::mpsc::channel(4);
        let out_a: SharedEnvelopeSender = Arc::new(Mutex::new(Some(tx_a)));
        a.try_offer("ch", &out_a, "join").await.unwrap();
        let offer_env = rx_a.recv().await.unwrap();
        let offer: crate::protocol::DescriptionPayload =
            serde_json::from_value(offer_env.payload.unwrap()).unwrap();

        // another operation holds b's lock; the remote offer must queue
        let lock = b.signaling_lock.clone();
        let guard = lock.lock().await;

        let b_task = b.clone();
        let out_b: SharedEnvelopeSender = Arc::new(Mutex::new(None));
        let handle = tokio::spawn(async move {
            b_task
                .answer_remote_offer("ch", &out_b, offer.sdp, &[])
                .await
        });
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(!handle.is_finished());

        drop(guard);
        let outcome = handle.await.unwrap().unwrap();
        assert!(matches!(outcome, OfferOutcome::Answered { .. }));

        a.close().await;
        b.close().await;
    }

    #[tokio::test]
    async fn test_answer_carries_current_local_tracks() {
        use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

        let api = crate::media_setup::MediaSetup::create_webrtc_api();
        let pc_a = Arc::new(
            api.new_peer_connection(RTCConfiguration::default())
                .await
                .unwrap(),
        );
        let pc_b = Arc::new(
            api.new_peer_connection(RTCConfiguration::default())
                .await
                .unwrap(),
        );
        pc_a.create_data_channel("probe", None).await.unwrap();

        let a_id = ParticipantId::from("p-a");
        let b_id = ParticipantId::from("p-b");
        let a = PeerEntry::new(pc_a, &a_id, b_id.clone());
        let b = PeerEntry::new(pc_b, &b_id, a_id.clone());

        let (tx_a, mut rx_a) = tokio::sync::mpsc::channel(4);
        let out_a: SharedEnvelopeSender = Arc::new(Mutex::new(Some(tx_a)));
        a.try_offer("ch", &out_a, "join").await.unwrap();
        let offer_env = rx_a.recv().await.unwrap();
        let offer: crate::protocol::DescriptionPayload =
            serde_json::from_value(offer_env.payload.unwrap()).unwrap();

        let camera: Arc<dyn TrackLocal + Send + Sync> = Arc::new(TrackLocalStaticSample::new(
            webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability {
                mime_type: "video/VP8".to_string(),
                clock_rate: 90_000,
                ..Default::default()
            },
            "camera-1".to_string(),
            "stream-1".to_string(),
        ));

        let (tx_b, mut rx_b) = tokio::sync::mpsc::channel(4);
        let out_b: SharedEnvelopeSender = Arc::new(Mutex::new(Some(tx_b)));
        let outcome = b
            .answer_remote_offer("ch", &out_b, offer.sdp, &[camera])
            .await
            .unwrap();
        assert_eq!(outcome, OfferOutcome::Answered { deferred: None });

        // the track went out with the answer; no follow-up offer needed
        assert_eq!(b.pc.get_senders().await.len(), 1);
        let answer_env = rx_b.recv().await.unwrap();
        assert_eq!(answer_env.kind, crate::protocol::KIND_ANSWER);
        assert!(rx_b.try_recv().is_err());

        a.close().await;
        b.close().await;
    }
}
