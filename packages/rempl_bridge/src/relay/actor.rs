//! Relay hub actor and the ports connected to it.
//!
//! The [`RelayHub`] state lives inside one task; everything else talks to it
//! through a cloneable [`HubHandle`]. A [`Port`] is one endpoint. Dropping the
//! last half of a port disconnects it.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use rempl_protocol::{Frame, Packet, TabId};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use super::hub::{EndpointId, FrameSender, RelayHub, Side};
use crate::error::BridgeError;

/// Commands processed by the hub actor.
#[derive(Debug)]
pub enum HubCommand {
    /// A new endpoint. `bind` is `None` for plugin endpoints that still
    /// have to declare their tab.
    Open {
        id: EndpointId,
        bind: Option<(Side, TabId)>,
        tx: FrameSender,
    },
    Init {
        id: EndpointId,
        tab: TabId,
    },
    Message {
        id: EndpointId,
        frame: Frame,
    },
    Close {
        id: EndpointId,
    },
    Stats {
        respond_to: oneshot::Sender<HubStats>,
    },
}

/// Snapshot of hub bookkeeping.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct HubStats {
    pub sessions: usize,
}

/// Handle to the hub actor.
#[derive(Clone)]
pub struct HubHandle {
    sender: mpsc::UnboundedSender<HubCommand>,
    next_id: Arc<AtomicU64>,
}

impl HubHandle {
    /// Spawn the hub actor on the current runtime.
    pub fn spawn() -> HubHandle {
        let (sender, receiver) = mpsc::unbounded_channel();
        tokio::spawn(run(RelayHub::new(), receiver));
        HubHandle {
            sender,
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    fn open(&self, bind: Option<(Side, TabId)>) -> Result<Port, BridgeError> {
        let id = EndpointId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::unbounded_channel();
        self.sender
            .send(HubCommand::Open { id, bind, tx })
            .map_err(|_| BridgeError::ActorGone("hub"))?;

        let guard = Arc::new(PortGuard {
            id,
            hub: self.sender.clone(),
        });
        Ok(Port {
            sender: PortSender { guard },
            receiver: PortReceiver { rx },
        })
    }

    /// Connect the page side of `tab`.
    pub fn connect_page(&self, tab: TabId) -> Result<Port, BridgeError> {
        self.open(Some((Side::Page, tab)))
    }

    /// Connect a panel endpoint. It is not part of any session until
    /// [`Port::init`] is called.
    pub fn connect_plugin(&self) -> Result<Port, BridgeError> {
        self.open(None)
    }

    pub async fn stats(&self) -> Result<HubStats, BridgeError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(HubCommand::Stats { respond_to: tx })
            .map_err(|_| BridgeError::ActorGone("hub"))?;
        rx.await.map_err(|_| BridgeError::NoResponse("hub"))
    }
}

async fn run(mut hub: RelayHub, mut receiver: mpsc::UnboundedReceiver<HubCommand>) {
    debug!("Relay hub actor started");

    while let Some(cmd) = receiver.recv().await {
        match cmd {
            HubCommand::Open { id, bind, tx } => match bind {
                Some((side, tab)) => hub.on_peer_connect(side, tab, id, tx),
                None => hub.on_plugin_open(id, tx),
            },
            HubCommand::Init { id, tab } => {
                hub.on_plugin_init(id, tab);
            }
            HubCommand::Message { id, frame } => hub.on_peer_message(id, frame),
            HubCommand::Close { id } => hub.on_peer_disconnect(id),
            HubCommand::Stats { respond_to } => {
                let _ = respond_to.send(HubStats {
                    sessions: hub.session_count(),
                });
            }
        }
    }

    debug!("Relay hub actor stopped");
}

/// Sends `Close` once every clone of the sending half is gone.
struct PortGuard {
    id: EndpointId,
    hub: mpsc::UnboundedSender<HubCommand>,
}

impl Drop for PortGuard {
    fn drop(&mut self) {
        let _ = self.hub.send(HubCommand::Close { id: self.id });
    }
}

/// Sending half of a port.
#[derive(Clone)]
pub struct PortSender {
    guard: Arc<PortGuard>,
}

impl PortSender {
    pub fn id(&self) -> EndpointId {
        self.guard.id
    }

    /// Hand a packet to the hub for the other side of the session.
    pub fn post(&self, packet: Packet) -> Result<(), BridgeError> {
        self.post_frame(Frame::try_from(&packet)?)
    }

    /// Hand a frame to the hub as is.
    pub fn post_frame(&self, frame: Frame) -> Result<(), BridgeError> {
        self.guard
            .hub
            .send(HubCommand::Message {
                id: self.guard.id,
                frame,
            })
            .map_err(|_| BridgeError::ActorGone("hub"))
    }

    /// Declare which session this (plugin) endpoint belongs to.
    pub fn init(&self, tab: TabId) -> Result<(), BridgeError> {
        self.guard
            .hub
            .send(HubCommand::Init {
                id: self.guard.id,
                tab,
            })
            .map_err(|_| BridgeError::ActorGone("hub"))
    }
}

/// Receiving half of a port.
pub struct PortReceiver {
    rx: mpsc::UnboundedReceiver<Frame>,
}

impl PortReceiver {
    /// Next frame from the other side, untouched. `None` once the hub is gone.
    pub async fn recv_frame(&mut self) -> Option<Frame> {
        self.rx.recv().await
    }

    /// Next packet from the other side. Frames that don't decode are skipped.
    pub async fn recv(&mut self) -> Option<Packet> {
        loop {
            let frame = self.rx.recv().await?;
            match frame.decode() {
                Ok(packet) => return Some(packet),
                Err(e) => debug!(kind = frame.kind(), "Skipping undecodable packet: {}", e),
            }
        }
    }
}

/// One hub endpoint.
pub struct Port {
    sender: PortSender,
    receiver: PortReceiver,
}

impl Port {
    pub fn id(&self) -> EndpointId {
        self.sender.id()
    }

    pub fn post(&self, packet: Packet) -> Result<(), BridgeError> {
        self.sender.post(packet)
    }

    pub fn post_frame(&self, frame: Frame) -> Result<(), BridgeError> {
        self.sender.post_frame(frame)
    }

    pub fn init(&self, tab: TabId) -> Result<(), BridgeError> {
        self.sender.init(tab)
    }

    pub async fn recv(&mut self) -> Option<Packet> {
        self.receiver.recv().await
    }

    pub async fn recv_frame(&mut self) -> Option<Frame> {
        self.receiver.recv_frame().await
    }

    pub fn split(self) -> (PortSender, PortReceiver) {
        (self.sender, self.receiver)
    }
}
