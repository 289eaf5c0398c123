//! # Disconnect Causes
//!
//! Every session close carries one [`DisconnectCause`]. Statistics and the
//! `ChannelInactive` event report it verbatim, so downstream logic can tell an
//! intentional close (client request, kick, ban, server shutdown) from an
//! abnormal one (lost peer, framing error, idle or orphan sweep).

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DisconnectCause {
    /// Closed by the application without a more specific reason
    Default,
    /// The client asked to leave
    ClientRequest,
    /// No activity within the configured idle time
    Idle,
    /// Peer unreachable, the transport reported end of stream
    Lost,
    /// Read failure or unrecoverable inbound data
    LostInRead,
    /// Write failure on the outbound side
    LostInWritten,
    /// Never associated to a player within the orphan allowance
    Orphan,
    /// Accepted while the server was at its connection limit
    ReachedMaxConnection,
    /// Superseded by a newer session for the same player
    Reconnection,
    /// Refused by the connection filter
    RefusedConnection,
    /// The server is shutting down
    ServerDown,
    /// Removed by the application
    Kick,
    /// The remote address was banned
    Ban,
    Unknown,
}

impl DisconnectCause {
    pub const ALL: [DisconnectCause; 14] = [
        DisconnectCause::Default,
        DisconnectCause::ClientRequest,
        DisconnectCause::Idle,
        DisconnectCause::Lost,
        DisconnectCause::LostInRead,
        DisconnectCause::LostInWritten,
        DisconnectCause::Orphan,
        DisconnectCause::ReachedMaxConnection,
        DisconnectCause::Reconnection,
        DisconnectCause::RefusedConnection,
        DisconnectCause::ServerDown,
        DisconnectCause::Kick,
        DisconnectCause::Ban,
        DisconnectCause::Unknown,
    ];

    /// Closes requested by one of the parties, as opposed to failures and sweeps.
    pub fn is_intentional(self) -> bool {
        matches!(
            self,
            DisconnectCause::Default
                | DisconnectCause::ClientRequest
                | DisconnectCause::Reconnection
                | DisconnectCause::ServerDown
                | DisconnectCause::Kick
                | DisconnectCause::Ban
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DisconnectCause::Default => "DEFAULT",
            DisconnectCause::ClientRequest => "CLIENT_REQUEST",
            DisconnectCause::Idle => "IDLE",
            DisconnectCause::Lost => "LOST",
            DisconnectCause::LostInRead => "LOST_IN_READ",
            DisconnectCause::LostInWritten => "LOST_IN_WRITTEN",
            DisconnectCause::Orphan => "ORPHAN",
            DisconnectCause::ReachedMaxConnection => "REACHED_MAX_CONNECTION",
            DisconnectCause::Reconnection => "RECONNECTION",
            DisconnectCause::RefusedConnection => "REFUSED_CONNECTION",
            DisconnectCause::ServerDown => "SERVER_DOWN",
            DisconnectCause::Kick => "KICK",
            DisconnectCause::Ban => "BAN",
            DisconnectCause::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for DisconnectCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_names_are_distinct() {
        let names: HashSet<_> = DisconnectCause::ALL.iter().map(|c| c.as_str()).collect();
        assert_eq!(names.len(), DisconnectCause::ALL.len());
    }

    #[test]
    fn test_intentional_split() {
        assert!(DisconnectCause::Kick.is_intentional());
        assert!(DisconnectCause::Reconnection.is_intentional());
        assert!(!DisconnectCause::Lost.is_intentional());
        assert!(!DisconnectCause::Idle.is_intentional());
        assert!(!DisconnectCause::Orphan.is_intentional());
        assert!(!DisconnectCause::Unknown.is_intentional());
    }

    #[test]
    fn test_display_matches_serde_name() {
        assert_eq!(DisconnectCause::ReachedMaxConnection.to_string(), "REACHED_MAX_CONNECTION");
    }
}
