use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BridgeError {
    #[error("no session: call init before any other command")]
    NotInitialized,
    #[error("invalid server url: {0}")]
    InvalidUrl(String),
    #[error("host lifecycle is destroyed")]
    HostDestroyed,
    #[error("connection failed: {0}")]
    Connection(String),
    #[error("room error: {0}")]
    Room(String),
}
