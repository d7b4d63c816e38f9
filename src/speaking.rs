//! Debounced "who is talking" detection: per-frame mean absolute amplitude
//! against a fixed threshold, cleared by a decay timer instead of a lookback
//! buffer.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use crate::id_types::ParticipantId;

/// Activation threshold on mean absolute amplitude.
pub const SPEAKING_THRESHOLD: f32 = 0.01;
/// How long a participant stays marked speaking after the last active frame.
pub const SPEAKING_DECAY: Duration = Duration::from_millis(700);

#[derive(Default)]
pub struct SpeakingDetector {
    last_active: HashMap<ParticipantId, Instant>,
    speaking: HashSet<ParticipantId>,
}

impl SpeakingDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one frame's level. Returns true if the participant newly
    /// crossed into speaking.
    pub fn observe(&mut self, participant: &ParticipantId, level: f32) -> bool {
        self.observe_at(participant, level, Instant::now())
    }

    fn observe_at(&mut self, participant: &ParticipantId, level: f32, now: Instant) -> bool {
        if level < SPEAKING_THRESHOLD {
            return false;
        }
        self.last_active.insert(participant.clone(), now);
        self.speaking.insert(participant.clone())
    }

    /// Clears everyone whose decay expired; returns the participants that
    /// stopped speaking.
    pub fn expire(&mut self) -> Vec<ParticipantId> {
        self.expire_at(Instant::now())
    }

    fn expire_at(&mut self, now: Instant) -> Vec<ParticipantId> {
        let mut stopped = Vec::new();
        self.speaking.retain(|p| {
            let fresh = self
                .last_active
                .get(p)
                .map(|at| now.duration_since(*at) <= SPEAKING_DECAY)
                .unwrap_or(false);
            if !fresh {
                stopped.push(p.clone());
            }
            fresh
        });
        for p in &stopped {
            self.last_active.remove(p);
        }
        stopped
    }

    pub fn is_speaking(&self, participant: &ParticipantId) -> bool {
        self.speaking.contains(participant)
    }

    pub fn speaking_set(&self) -> HashSet<ParticipantId> {
        self.speaking.clone()
    }

    pub fn remove(&mut self, participant: &ParticipantId) {
        self.speaking.remove(participant);
        self.last_active.remove(participant);
    }

    pub fn clear(&mut self) {
        self.speaking.clear();
        self.last_active.clear();
    }
}
