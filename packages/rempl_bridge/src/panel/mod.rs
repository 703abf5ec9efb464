//! Inspector panel: producer selection and the remote UI sandbox.

pub mod controller;
pub mod runtime;

pub use controller::{
    Connectivity, Listener, PanelController, PanelInput, PanelOutput, PanelSnapshot, UiRegion,
};
pub use runtime::{PanelHandle, spawn_panel};
