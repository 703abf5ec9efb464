//! Wire types and correlation primitives for the rempl inspector bridge.
//!
//! Everything in here is runtime-free: message shapes exchanged between the
//! page, the relay hub and the inspector panel, the ids they route on, and
//! the two bookkeeping primitives every context needs (a one-shot callback
//! table and cancellable task tokens).

pub mod callbacks;
pub mod error;
pub mod ids;
pub mod message;
pub mod task;

pub use callbacks::CallbackTable;
pub use error::ProtocolError;
pub use ids::{CallbackId, ChannelId, PublisherId, TabId, UID_LENGTH, gen_uid};
pub use message::{
    Frame, HandshakeState, Packet, PluginInit, PublisherInfo, PublisherList, RemplPayload,
    UiDescriptor, UiKind, WindowMessage,
};
pub use task::{TaskSlot, TaskToken};
