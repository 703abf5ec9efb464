/// Errors surfaced by the actor handles.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    /// The actor behind a handle has shut down.
    #[error("{0} actor is gone")]
    ActorGone(&'static str),

    /// The actor dropped a request without answering.
    #[error("{0} actor didn't respond")]
    NoResponse(&'static str),

    #[error(transparent)]
    Protocol(#[from] rempl_protocol::ProtocolError),
}

/// Errors from loading or talking to a remote UI sandbox.
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("UI content is empty")]
    EmptyContent,

    #[error("failed to instantiate UI: {0}")]
    Instantiate(String),

    /// The sandbox was destroyed before the host answered.
    #[error("sandbox destroyed")]
    Destroyed,
}
