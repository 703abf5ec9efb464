//! Relay hub: pairs the page and panel endpoints of each inspected tab.

pub mod actor;
pub mod hub;
pub mod server;

pub use actor::{HubHandle, HubStats, Port, PortReceiver, PortSender};
pub use hub::{EndpointId, RelayHub, Side};
pub use server::{router, serve};
