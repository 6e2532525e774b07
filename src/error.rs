//! Error kinds propagated through result values

use thiserror::Error;

pub type Result<T> = std::result::Result<T, NetError>;

#[derive(Debug, Error)]
pub enum NetError {
    /// Socket closed, read/write failed, framing corrupt.
    #[error("transport: {0}")]
    Transport(String),

    /// Operation exceeded its deadline.
    #[error("operation timed out")]
    Timeout,

    /// Unexpected command, bad magic, version mismatch.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// Remote network_id differs from ours.
    #[error("network id mismatch")]
    NetworkMismatch,

    /// Remote peer_id equals ours.
    #[error("self connection detected")]
    SelfConnection,

    /// Address is in the blocklist or fail cooldown.
    #[error("address is blocked")]
    Blocked,

    /// RTA operation references an absent supernode id.
    #[error("unknown supernode: {0}")]
    UnknownSupernode(String),

    /// Invalid CLI or config combination.
    #[error("configuration: {0}")]
    Config(String),

    /// Peerlist blob unreadable. Tolerated on startup (fresh start).
    #[error("persistence: {0}")]
    Persistence(String),
}

impl From<std::io::Error> for NetError {
    fn from(e: std::io::Error) -> Self {
        NetError::Transport(e.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for NetError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        NetError::Timeout
    }
}

impl From<postcard::Error> for NetError {
    fn from(e: postcard::Error) -> Self {
        NetError::Protocol(format!("payload decode: {e}"))
    }
}
