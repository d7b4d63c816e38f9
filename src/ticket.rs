//! Join-ticket collaborator boundary.
//!
//! A ticket is a short-lived, scoped credential authorizing one join attempt
//! to one channel's signaling session. The collaborator that issues tickets
//! (capability service) lives outside this crate; we only consume it.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::id_types::{ChannelId, ServerId};

/// Local identity presented when requesting a ticket.
#[derive(Debug, Clone)]
pub struct LocalIdentity {
    pub user_uid: String,
    pub device_id: String,
}

/// ICE server entry as delivered inside a ticket. Credentials are optional
/// (absent for plain STUN, present for TURN).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceServerConfig {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Permissions {
    #[serde(default)]
    pub speak: bool,
    #[serde(default)]
    pub video: bool,
    #[serde(default)]
    pub screenshare: bool,
}

/// Everything a successful ticket grant carries.
#[derive(Debug, Clone)]
pub struct JoinTicket {
    /// Opaque token forwarded verbatim in the `join` envelope.
    pub token: String,
    /// Short-lived signaling transport URL.
    pub signaling_url: String,
    pub ice_servers: Vec<IceServerConfig>,
    pub permissions: Permissions,
}

#[derive(Debug)]
pub enum TicketError {
    /// The server does not support voice signaling.
    Unsupported(String),
    /// Expired/invalid ticket or permission denied; message is surfaced
    /// verbatim to the session error field.
    Denied(String),
    Transport(String),
}

impl std::fmt::Display for TicketError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TicketError::Unsupported(msg) => write!(f, "signaling unsupported: {}", msg),
            TicketError::Denied(msg) => write!(f, "{}", msg),
            TicketError::Transport(msg) => write!(f, "ticket request failed: {}", msg),
        }
    }
}

impl std::error::Error for TicketError {}

/// The capability/ticketing collaborator.
#[async_trait]
pub trait TicketSource: Send + Sync {
    async fn acquire(
        &self,
        server_id: &ServerId,
        channel_id: &ChannelId,
        identity: &LocalIdentity,
    ) -> Result<JoinTicket, TicketError>;
}

/// Fixed-response source for tests and local development.
pub struct StaticTicketSource {
    pub ticket: JoinTicket,
}

#[async_trait]
impl TicketSource for StaticTicketSource {
    async fn acquire(
        &self,
        _server_id: &ServerId,
        _channel_id: &ChannelId,
        _identity: &LocalIdentity,
    ) -> Result<JoinTicket, TicketError> {
        Ok(self.ticket.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_source_returns_ticket() {
        let source = StaticTicketSource {
            ticket: JoinTicket {
                token: "tok".into(),
                signaling_url: "wss://example.test/voice".into(),
                ice_servers: vec![IceServerConfig {
                    urls: vec!["stun:stun.example.test:3478".into()],
                    username: None,
                    credential: None,
                }],
                permissions: Permissions {
                    speak: true,
                    video: true,
                    screenshare: true,
                },
            },
        };

        let ticket = source
            .acquire(
                &ServerId::from("srv"),
                &ChannelId::from("ch"),
                &LocalIdentity {
                    user_uid: "u".into(),
                    device_id: "d".into(),
                },
            )
            .await
            .unwrap();
        assert_eq!(ticket.token, "tok");
        assert!(ticket.permissions.speak);
    }

    #[test]
    fn test_permissions_default_to_denied() {
        let perms: Permissions = serde_json::from_str("{}").unwrap();
        assert!(!perms.speak);
        assert!(!perms.video);
        assert!(!perms.screenshare);
    }
}
