use std::sync::Arc;

use rempl_protocol::{PublisherId, TabId};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::controller::{Listener, PanelController, PanelInput, PanelOutput, PanelSnapshot};
use crate::config::PanelConfig;
use crate::error::BridgeError;
use crate::relay::Port;
use crate::sandbox::SandboxLoader;

/// Handle to a running panel. Dropping the last clone stops it.
#[derive(Clone)]
pub struct PanelHandle {
    sender: mpsc::UnboundedSender<PanelInput>,
    cancel: CancellationToken,
    _guard: Arc<CancelOnDrop>,
}

struct CancelOnDrop(CancellationToken);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.cancel();
    }
}

impl PanelHandle {
    fn send(&self, input: PanelInput) -> Result<(), BridgeError> {
        self.sender
            .send(input)
            .map_err(|_| BridgeError::ActorGone("panel"))
    }

    /// Select a producer, as if its tab was clicked.
    pub fn select(&self, id: PublisherId) -> Result<(), BridgeError> {
        self.send(PanelInput::Select(id))
    }

    pub fn subscribe(&self, listener: Listener) -> Result<(), BridgeError> {
        self.send(PanelInput::Subscribe(listener))
    }

    pub async fn snapshot(&self) -> Result<PanelSnapshot, BridgeError> {
        let (tx, rx) = oneshot::channel();
        self.send(PanelInput::Snapshot(tx))?;
        rx.await.map_err(|_| BridgeError::NoResponse("panel"))
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

/// Run a panel controller for `tab` on the hub behind `port`.
pub fn spawn_panel(
    port: Port,
    tab: TabId,
    loader: SandboxLoader,
    config: PanelConfig,
) -> Result<PanelHandle, BridgeError> {
    port.init(tab)?;

    let (sender, receiver) = mpsc::unbounded_channel();
    let cancel = CancellationToken::new();
    let controller = PanelController::new(config, loader, sender.clone());

    tokio::spawn(run(
        controller,
        port,
        receiver,
        sender.clone(),
        cancel.clone(),
    ));

    info!(%tab, "panel started");
    Ok(PanelHandle {
        sender,
        cancel: cancel.clone(),
        _guard: Arc::new(CancelOnDrop(cancel)),
    })
}

async fn run(
    mut controller: PanelController,
    mut port: Port,
    mut receiver: mpsc::UnboundedReceiver<PanelInput>,
    timers: mpsc::UnboundedSender<PanelInput>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            packet = port.recv() => match packet {
                Some(packet) => controller.handle(PanelInput::Hub(packet)),
                None => {
                    debug!("Hub gone, stopping panel");
                    break;
                }
            },
            Some(input) = receiver.recv() => controller.handle(input),
        }

        for output in controller.take_output() {
            match output {
                PanelOutput::ToHub(packet) => {
                    if let Err(e) = port.post(packet) {
                        debug!("Dropping packet for hub: {}", e);
                    }
                }
                PanelOutput::ScheduleSandboxDrop { token, after } => {
                    let timers = timers.clone();
                    let cancel = cancel.clone();
                    tokio::spawn(async move {
                        tokio::select! {
                            _ = cancel.cancelled() => {}
                            _ = tokio::time::sleep(after) => {
                                let _ = timers.send(PanelInput::DropSandbox(token));
                            }
                        }
                    });
                }
            }
        }
    }

    info!("panel stopped");
}
