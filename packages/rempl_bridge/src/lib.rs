//! Bridge between rempl publishers running inside a page and an inspector
//! panel.
//!
//! Three cooperating parts, each owning its own state:
//!
//! - [`relay`]: pairs the page and panel endpoints of each inspected tab and
//!   forwards packets between them.
//! - [`page`]: discovers the producer hubs on a page and multiplexes them onto
//!   one hub connection.
//! - [`panel`]: keeps one producer selected and runs its remote UI in a
//!   [`sandbox`].

pub mod config;
pub mod error;
pub mod page;
pub mod panel;
pub mod relay;
pub mod sandbox;

pub use error::{BridgeError, SandboxError};

#[cfg(test)]
pub(crate) mod test_helpers;
