//! Real-time voice/video channel sessions: signaling, a per-peer
//! negotiation mesh, a PCM side-channel audio pipeline, and camera/screen
//! track management for a multi-tenant chat client.

pub mod audio;
pub mod config;
pub mod devices;
pub mod id_types;
pub mod logging;
pub mod media_setup;
pub mod mesh;
pub mod negotiation;
pub mod protocol;
pub mod session;
pub mod speaking;
pub mod ticket;
pub mod transport;
pub mod types;
pub mod video;

pub use id_types::{ChannelId, ParticipantId, ServerId, StreamId, TrackId};
pub use media_setup::MediaSetup;
pub use protocol::{Envelope, ServerEvent};
pub use session::{SessionPhase, SessionRegistry, SessionSnapshot, VoiceSession};
pub use ticket::{JoinTicket, LocalIdentity, Permissions, TicketSource};
pub use types::{PeerMap, SessionKey};

#[cfg(test)]
mod tests;
