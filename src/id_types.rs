use std::fmt;
use std::sync::Arc;

/// Declares a strongly typed identifier wrapping an `Arc<String>` for cheap
/// cloning across tasks and maps.
macro_rules! id_type {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub Arc<String>);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                $name(Arc::new(s))
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                $name(Arc::new(s.to_string()))
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

id_type! {
    /// Identifier of a chat server (tenant).
    ServerId
}

id_type! {
    /// Identifier of a voice/video channel within a server.
    ChannelId
}

id_type! {
    /// Server-assigned identifier of a call participant, stable for the
    /// duration of the call.
    ParticipantId
}

id_type! {
    /// Identifier of a media stream (grouping of tracks).
    StreamId
}

id_type! {
    /// Identifier of a single media track.
    TrackId
}
