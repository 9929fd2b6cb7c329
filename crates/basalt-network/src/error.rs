//! Network error types and disconnect reasons.

use basalt_types::encoding::EncodingError;
use thiserror::Error;

/// Reason codes reported when a peer is dropped.
///
/// The transport layer carries the code to the remote on disconnect;
/// within this crate they classify errors for logging and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DisconnectReason {
    /// Peer limit reached.
    TooManyPeers = 0x00,
    /// Network id, genesis or protocol version mismatch.
    IncompatibleConfig = 0x01,
    /// Message exceeded the protocol size limit.
    MsgTooLarge = 0x02,
    /// Status message received after the handshake.
    ExtraStatusMsg = 0x03,
    /// Malformed message payload.
    Decode = 0x04,
    /// Unknown or version-gated message code.
    InvalidMsgCode = 0x05,
    /// Verifier datagram failed validation.
    Verify = 0x06,
    /// Peer is of no use (stalled, failed fork check, duplicate).
    UselessPeer = 0x07,
    /// Local node is shutting down.
    Quitting = 0x08,
}

impl std::fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Self::TooManyPeers => "too many peers",
            Self::IncompatibleConfig => "incompatible configuration",
            Self::MsgTooLarge => "message too large",
            Self::ExtraStatusMsg => "extra status message",
            Self::Decode => "decode error",
            Self::InvalidMsgCode => "invalid message code",
            Self::Verify => "verification failed",
            Self::UselessPeer => "useless peer",
            Self::Quitting => "quitting",
        };
        write!(f, "{}", text)
    }
}

/// Network errors.
#[derive(Error, Debug)]
pub enum NetworkError {
    /// I/O error on the underlying stream.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Canonical decoding failed.
    #[error("decode error: {0}")]
    Encoding(#[from] EncodingError),

    /// Frame carried the wrong network magic.
    #[error("invalid network magic")]
    InvalidMagic,

    /// Frame checksum did not match the payload.
    #[error("frame checksum mismatch")]
    ChecksumMismatch,

    /// Message exceeded the size limit.
    #[error("message too large: {size} bytes, max {max} bytes")]
    MessageTooLarge { size: usize, max: usize },

    /// Unknown message code.
    #[error("invalid message code: {0:#04x}")]
    InvalidMessageCode(u8),

    /// Status message after the handshake completed.
    #[error("uncontrolled status message")]
    ExtraStatusMessage,

    /// The first message on the stream was not a status message.
    #[error("first message is not status, got code {0:#04x}")]
    NoStatusMessage(u8),

    /// Remote speaks a different network.
    #[error("network id mismatch: ours {ours}, theirs {theirs}")]
    NetworkIdMismatch { ours: u64, theirs: u64 },

    /// Remote has a different genesis block.
    #[error("genesis mismatch: ours {ours}, theirs {theirs}")]
    GenesisMismatch { ours: String, theirs: String },

    /// Remote's protocol version is not supported locally.
    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u32),

    /// The status exchange did not finish in time.
    #[error("handshake timed out")]
    HandshakeTimeout,

    /// Peer limit reached for untrusted peers.
    #[error("too many peers")]
    TooManyPeers,

    /// The peer set has been closed.
    #[error("peer set is closed")]
    PeerSetClosed,

    /// Peer id already present in the set.
    #[error("peer already registered")]
    AlreadyRegistered,

    /// The peer's connection is gone; sends can no longer be delivered.
    #[error("peer is gone")]
    PeerGone,

    /// A verifier datagram failed validation.
    #[error("verifier rejected datagram: {0}")]
    VerifierRejected(String),

    /// Peer failed the fork lineage check.
    #[error("fork check failed: {0}")]
    ForkCheckFailed(String),
}

impl NetworkError {
    /// Disconnect reason this error maps to.
    pub fn disconnect_reason(&self) -> DisconnectReason {
        match self {
            Self::MessageTooLarge { .. } => DisconnectReason::MsgTooLarge,
            Self::InvalidMessageCode(_) => DisconnectReason::InvalidMsgCode,
            Self::ExtraStatusMessage => DisconnectReason::ExtraStatusMsg,
            Self::NetworkIdMismatch { .. }
            | Self::GenesisMismatch { .. }
            | Self::UnsupportedVersion(_) => DisconnectReason::IncompatibleConfig,
            Self::TooManyPeers => DisconnectReason::TooManyPeers,
            Self::PeerSetClosed | Self::PeerGone => DisconnectReason::Quitting,
            Self::VerifierRejected(_) => DisconnectReason::Verify,
            Self::HandshakeTimeout | Self::AlreadyRegistered | Self::ForkCheckFailed(_) => {
                DisconnectReason::UselessPeer
            }
            _ => DisconnectReason::Decode,
        }
    }
}

/// Result type for network operations.
pub type NetworkResult<T> = Result<T, NetworkError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reason_mapping() {
        assert_eq!(
            NetworkError::NetworkIdMismatch { ours: 1, theirs: 2 }.disconnect_reason(),
            DisconnectReason::IncompatibleConfig
        );
        assert_eq!(
            NetworkError::ExtraStatusMessage.disconnect_reason(),
            DisconnectReason::ExtraStatusMsg
        );
        assert_eq!(
            NetworkError::MessageTooLarge { size: 1, max: 0 }.disconnect_reason(),
            DisconnectReason::MsgTooLarge
        );
        assert_eq!(
            NetworkError::PeerSetClosed.disconnect_reason(),
            DisconnectReason::Quitting
        );
    }

    #[test]
    fn test_reason_codes_are_stable() {
        assert_eq!(DisconnectReason::TooManyPeers as u8, 0x00);
        assert_eq!(DisconnectReason::Quitting as u8, 0x08);
    }
}
