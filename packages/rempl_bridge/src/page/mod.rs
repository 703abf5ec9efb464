//! Page side: producer discovery and the hub connection of one inspected page.

pub mod bus;
pub mod multiplexer;
pub mod runtime;

pub use bus::PageBus;
pub use multiplexer::{PageMultiplexer, PageOutput, PublisherHub};
pub use rempl_protocol::WindowMessage;
pub use runtime::{PageHandle, spawn_page};
