//! Error taxonomy for the sync core.
//!
//! Nothing here is fatal to the process: transport and protocol errors
//! close one connection, cache errors are logged and survived. Only
//! startup failures (port bind, certificate load) abort `start`.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    /// Socket-level failure on read, write, connect or accept.
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// TLS configuration or handshake failure.
    #[error("tls error: {0}")]
    Tls(#[from] tokio_rustls::rustls::Error),

    /// TLS or hello exchange did not complete within the deadline.
    #[error("handshake timed out")]
    HandshakeTimeout,

    /// Malformed frame, unknown message tag, or a non-hello first frame.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// Frame could not be parsed as a message object.
    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),

    /// Hello gates: version, env, or userId differs from ours.
    #[error("identity mismatch on {field}: ours {ours:?}, theirs {theirs:?}")]
    IdentityMismatch {
        field: &'static str,
        ours: String,
        theirs: String,
    },

    /// The remote hello announced our own instance name.
    #[error("connection from ourselves")]
    SelfLoop,

    /// A message body named a peer we have never heard of.
    #[error("unknown peer: {0}")]
    UnknownPeer(String),

    /// A message body named a module the local registry does not know.
    #[error("unknown module: {0}")]
    UnknownModule(String),

    /// Rename-at-hello would collide with an existing table entry.
    #[error("peer rename collision: {0} already present")]
    RenameCollision(String),

    /// controlSwitch named a peer we outrank.
    #[error("control switch to {0} which we outrank")]
    RankParadox(String),

    /// Peer address cache could not be read or written.
    #[error("address cache error: {0}")]
    Cache(String),

    /// Invalid or missing configuration at startup.
    #[error("config error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_carries_context() {
        let err = SyncError::IdentityMismatch {
            field: "env",
            ours: "prod".into(),
            theirs: "dev".into(),
        };
        assert_eq!(
            err.to_string(),
            "identity mismatch on env: ours \"prod\", theirs \"dev\""
        );
    }

    #[test]
    fn io_errors_convert() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        let err: SyncError = io.into();
        assert!(matches!(err, SyncError::Transport(_)));
    }
}
