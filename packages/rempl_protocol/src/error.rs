//! Protocol error type.

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed message: {0}")]
    Json(#[from] serde_json::Error),

    #[error("message has no type tag")]
    MissingType,

    #[error("unknown message type: {0}")]
    UnknownType(String),

    #[error("malformed remote UI descriptor: {0}")]
    MalformedDescriptor(String),

    /// The producer answered `getRemoteUI` with an error.
    #[error("{0}")]
    RemoteUi(String),
}
