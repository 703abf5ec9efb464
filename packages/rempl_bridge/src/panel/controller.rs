//! Inspector panel state machine.
//!
//! Tracks the page connection and the producer list, keeps exactly one
//! producer selected, fetches its remote UI and runs it in a [`Sandbox`].
//! Effects toward the hub come out of [`PanelController::take_output`];
//! messages from the sandbox and reply handles come back in through the
//! `ui_sink` as [`PanelInput`]s.

use std::fmt;
use std::time::Duration;

use rempl_protocol::{
    CallbackId, CallbackTable, ChannelId, Packet, PublisherId, PublisherInfo, PublisherList,
    RemplPayload, TaskSlot, TaskToken, UiDescriptor,
};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::config::PanelConfig;
use crate::sandbox::{ReplyHandle, Sandbox, SandboxId, SandboxLoader, UiMessage, UiReply};

/// Effects produced by the controller.
#[derive(Debug, Clone, PartialEq)]
pub enum PanelOutput {
    ToHub(Packet),
    /// Deliver `PanelInput::DropSandbox(token)` after `after`.
    ScheduleSandboxDrop { token: TaskToken, after: Duration },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Connectivity {
    /// No page endpoint.
    Disconnected,
    /// The page endpoint is there but hasn't introduced itself yet.
    PageOnly,
    Fully(Option<PublisherId>),
}

/// What the panel shows where the remote UI goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UiRegion {
    Idle,
    Loading,
    Failed(String),
    Ready,
}

enum Pending {
    RemoteUi(PublisherInfo),
    UiCall(UiReply),
}

/// A panel event subscriber.
pub enum Listener {
    Data(Box<dyn FnMut(&[Value]) + Send>),
    Session(Box<dyn FnMut(&str) + Send>),
    Connection(Box<dyn FnMut(bool) + Send>),
}

impl Listener {
    pub fn data(f: impl FnMut(&[Value]) + Send + 'static) -> Self {
        Listener::Data(Box::new(f))
    }

    pub fn session(f: impl FnMut(&str) + Send + 'static) -> Self {
        Listener::Session(Box::new(f))
    }

    pub fn connection(f: impl FnMut(bool) + Send + 'static) -> Self {
        Listener::Connection(Box::new(f))
    }
}

impl fmt::Debug for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Listener::Data(_) => f.write_str("Listener::Data"),
            Listener::Session(_) => f.write_str("Listener::Session"),
            Listener::Connection(_) => f.write_str("Listener::Connection"),
        }
    }
}

#[derive(Default)]
struct Listeners {
    data: Vec<Box<dyn FnMut(&[Value]) + Send>>,
    session: Vec<Box<dyn FnMut(&str) + Send>>,
    connection: Vec<Box<dyn FnMut(bool) + Send>>,
}

/// Everything the controller reacts to.
#[derive(Debug)]
pub enum PanelInput {
    Hub(Packet),
    FromUi {
        sandbox: SandboxId,
        message: UiMessage,
    },
    ReplyToProducer {
        channel_id: ChannelId,
        callback: CallbackId,
        data: Vec<Value>,
    },
    DropSandbox(TaskToken),
    Select(PublisherId),
    Subscribe(Listener),
    Snapshot(oneshot::Sender<PanelSnapshot>),
}

/// Read-only view of the controller.
#[derive(Debug, Clone, PartialEq)]
pub struct PanelSnapshot {
    pub connectivity: Connectivity,
    pub session: Option<String>,
    pub publishers: Vec<PublisherInfo>,
    pub selected: Option<PublisherInfo>,
    pub ui: UiRegion,
    pub sandbox: Option<SandboxId>,
    pub pending_callbacks: usize,
}

struct ActiveSandbox {
    sandbox: Sandbox,
    publisher: PublisherInfo,
}

pub struct PanelController {
    config: PanelConfig,
    loader: SandboxLoader,
    ui_sink: mpsc::UnboundedSender<PanelInput>,
    page_connected: bool,
    rempl_connected: bool,
    session: Option<String>,
    publishers: Vec<PublisherInfo>,
    selected: Option<PublisherInfo>,
    callbacks: CallbackTable<Pending>,
    sandbox: Option<ActiveSandbox>,
    sandbox_drop: TaskSlot,
    ui: UiRegion,
    listeners: Listeners,
    outbox: Vec<PanelOutput>,
}

impl PanelController {
    pub fn new(
        config: PanelConfig,
        loader: SandboxLoader,
        ui_sink: mpsc::UnboundedSender<PanelInput>,
    ) -> Self {
        Self {
            config,
            loader,
            ui_sink,
            page_connected: false,
            rempl_connected: false,
            session: None,
            publishers: Vec::new(),
            selected: None,
            callbacks: CallbackTable::new(),
            sandbox: None,
            sandbox_drop: TaskSlot::new(),
            ui: UiRegion::Idle,
            listeners: Listeners::default(),
            outbox: Vec::new(),
        }
    }

    pub fn connectivity(&self) -> Connectivity {
        if !self.page_connected {
            Connectivity::Disconnected
        } else if !self.rempl_connected {
            Connectivity::PageOnly
        } else {
            Connectivity::Fully(self.selected.as_ref().map(|p| p.id.clone()))
        }
    }

    pub fn selected(&self) -> Option<&PublisherInfo> {
        self.selected.as_ref()
    }

    pub fn ui(&self) -> &UiRegion {
        &self.ui
    }

    pub fn sandbox_id(&self) -> Option<SandboxId> {
        self.sandbox.as_ref().map(|a| a.sandbox.id())
    }

    pub fn snapshot(&self) -> PanelSnapshot {
        PanelSnapshot {
            connectivity: self.connectivity(),
            session: self.session.clone(),
            publishers: self.publishers.clone(),
            selected: self.selected.clone(),
            ui: self.ui.clone(),
            sandbox: self.sandbox_id(),
            pending_callbacks: self.callbacks.len(),
        }
    }

    pub fn take_output(&mut self) -> Vec<PanelOutput> {
        std::mem::take(&mut self.outbox)
    }

    pub fn handle(&mut self, input: PanelInput) {
        match input {
            PanelInput::Hub(packet) => self.handle_packet(packet),
            PanelInput::FromUi { sandbox, message } => self.on_ui_message(sandbox, message),
            PanelInput::ReplyToProducer {
                channel_id,
                callback,
                data,
            } => {
                debug!(%callback, "-> callback to producer");
                self.send_rempl(channel_id, RemplPayload::Callback { data, callback });
            }
            PanelInput::DropSandbox(token) => {
                if self.sandbox_drop.fire(token) {
                    info!("grace window elapsed, dropping sandbox");
                    self.drop_sandbox();
                    if self.selected.is_none() {
                        self.ui = UiRegion::Idle;
                    }
                }
            }
            PanelInput::Select(id) => self.select(&id),
            PanelInput::Subscribe(listener) => self.subscribe(listener),
            PanelInput::Snapshot(respond_to) => {
                let _ = respond_to.send(self.snapshot());
            }
        }
    }

    pub fn subscribe(&mut self, listener: Listener) {
        match listener {
            Listener::Data(f) => self.listeners.data.push(f),
            Listener::Session(f) => self.listeners.session.push(f),
            Listener::Connection(f) => self.listeners.connection.push(f),
        }
    }

    // =========================================================================
    // Hub traffic
    // =========================================================================

    pub fn handle_packet(&mut self, packet: Packet) {
        match packet {
            Packet::Connect => {
                // A pending sandbox drop stays armed until the same producer
                // is selected again.
                debug!("page endpoint connected");
                self.page_connected = true;
            }
            Packet::Disconnect => self.on_disconnect(),
            Packet::PageConnect(session, publishers) => {
                info!(%session, publishers = publishers.len(), "page connected");
                self.session = Some(session.clone());
                self.notify_session(&session);
                self.rempl_connected = true;
                self.notify_connection(true);
                self.update_publishers(publishers);
            }
            Packet::PagePublishers(PublisherList(publishers)) => {
                self.update_publishers(publishers);
            }
            Packet::Rempl(channel_id, payload) => self.on_rempl(channel_id, payload),
            other @ Packet::PluginSubscribers(_) => {
                warn!(kind = other.kind(), "Unexpected packet type on panel side");
            }
        }
    }

    fn on_disconnect(&mut self) {
        info!("page disconnected");
        self.page_connected = false;
        self.rempl_connected = false;
        self.notify_connection(false);
        self.publishers.clear();
        self.selected = None;
        self.callbacks.clear();

        match &self.sandbox {
            Some(active) => {
                active.sandbox.set_connected(false);
                let token = self.sandbox_drop.reschedule();
                self.outbox.push(PanelOutput::ScheduleSandboxDrop {
                    token,
                    after: self.config.sandbox_grace,
                });
            }
            None => self.ui = UiRegion::Idle,
        }
    }

    /// Replace the producer list and fix up the selection.
    pub fn update_publishers(&mut self, publishers: Vec<PublisherInfo>) {
        self.publishers = publishers;

        let kept = self
            .selected
            .as_ref()
            .and_then(|sel| self.publishers.iter().find(|p| p.id == sel.id));
        let next = kept.or_else(|| self.publishers.first()).cloned();

        self.set_selected(next);
    }

    /// Select a producer by id, as if its tab was clicked.
    pub fn select(&mut self, id: &PublisherId) {
        match self.publishers.iter().find(|p| &p.id == id).cloned() {
            Some(publisher) => self.set_selected(Some(publisher)),
            None => warn!(%id, "cannot select unknown publisher"),
        }
    }

    fn set_selected(&mut self, publisher: Option<PublisherInfo>) {
        let unchanged = match (&self.selected, &publisher) {
            (Some(current), Some(next)) => current.same_identity(next),
            (None, None) => true,
            _ => false,
        };
        if unchanged {
            return;
        }

        if self.selected.take().is_some() {
            self.callbacks.clear();
            self.drop_sandbox();
            self.ui = UiRegion::Idle;
        }

        if let Some(publisher) = publisher {
            info!(publisher = %publisher.id, "publisher selected");
            self.selected = Some(publisher.clone());
            self.request_ui(publisher);
        }
    }

    fn request_ui(&mut self, publisher: PublisherInfo) {
        self.to_hub(Packet::PluginSubscribers(PublisherList(vec![
            publisher.clone(),
        ])));

        if let Some(active) = &self.sandbox {
            if active.publisher.same_identity(&publisher) {
                debug!(publisher = %publisher.id, "reusing live sandbox");
                self.sandbox_drop.cancel();
                active.sandbox.set_connected(true);
                self.ui = UiRegion::Ready;
                return;
            }
        }

        self.drop_sandbox();
        self.ui = UiRegion::Loading;

        let channel_id = publisher.channel_id.clone();
        let endpoint = publisher.name.clone();
        let callback = self.callbacks.register(Pending::RemoteUi(publisher));
        self.send_rempl(
            channel_id,
            RemplPayload::GetRemoteUi {
                endpoint,
                data: vec![Value::Object(Default::default())],
                callback,
            },
        );
    }

    fn on_remote_ui(&mut self, publisher: PublisherInfo, args: Vec<Value>) {
        let still_selected = self
            .selected
            .as_ref()
            .is_some_and(|sel| sel.same_identity(&publisher));
        if !still_selected {
            debug!(publisher = %publisher.id, "remote UI for a deselected publisher");
            return;
        }

        let loaded = UiDescriptor::from_callback_args(&args)
            .map_err(|e| e.to_string())
            .and_then(|ui| self.loader.load(&ui).map_err(|e| e.to_string()));

        match loaded {
            Ok(sandbox) => {
                let id = sandbox.id();
                let sink = self.ui_sink.clone();
                sandbox.subscribe(move |message| {
                    let _ = sink.send(PanelInput::FromUi {
                        sandbox: id,
                        message,
                    });
                });
                sandbox.set_connected(true);

                info!(publisher = %publisher.id, %id, "remote UI ready");
                self.sandbox = Some(ActiveSandbox { sandbox, publisher });
                self.ui = UiRegion::Ready;
            }
            Err(e) => {
                warn!(publisher = %publisher.id, "Fetch UI error: {}", e);
                self.drop_sandbox();
                self.ui = UiRegion::Failed(format!("Fetch UI error: {}", e));
            }
        }
    }

    fn on_rempl(&mut self, channel_id: ChannelId, payload: RemplPayload) {
        let Some(selected) = &self.selected else {
            return;
        };
        if selected.channel_id != channel_id {
            return;
        }
        if let Some(endpoint) = payload.endpoint() {
            if endpoint != selected.name {
                return;
            }
        }

        match payload {
            RemplPayload::Callback { data, callback } => match self.callbacks.take(&callback) {
                Some(Pending::RemoteUi(publisher)) => self.on_remote_ui(publisher, data),
                Some(Pending::UiCall(reply)) => {
                    reply.send(data);
                }
                None => debug!(%callback, "stale callback"),
            },
            RemplPayload::Data { data, callback, .. } => {
                for listener in &mut self.listeners.data {
                    listener(&data);
                }

                if let Some(active) = &self.sandbox {
                    let reply = callback.map(|callback| {
                        let sink = self.ui_sink.clone();
                        let channel_id = channel_id.clone();
                        ReplyHandle::new(move |data| {
                            let _ = sink.send(PanelInput::ReplyToProducer {
                                channel_id,
                                callback,
                                data,
                            });
                        })
                    });
                    active.sandbox.send(data, reply);
                }
            }
            other => debug!(?other, "ignoring producer payload"),
        }
    }

    fn on_ui_message(&mut self, sandbox: SandboxId, message: UiMessage) {
        let Some(active) = &self.sandbox else {
            return;
        };
        if active.sandbox.id() != sandbox || self.selected.is_none() {
            debug!(%sandbox, "message from inactive sandbox");
            return;
        }

        let channel_id = active.publisher.channel_id.clone();
        let endpoint = active.publisher.name.clone();
        let callback = message
            .reply
            .map(|reply| self.callbacks.register(Pending::UiCall(reply)));
        self.send_rempl(
            channel_id,
            RemplPayload::Data {
                endpoint: Some(endpoint),
                data: message.data,
                callback,
            },
        );
    }

    fn drop_sandbox(&mut self) {
        self.sandbox_drop.cancel();
        if let Some(mut active) = self.sandbox.take() {
            active.sandbox.destroy();
        }
    }

    fn notify_session(&mut self, session: &str) {
        for listener in &mut self.listeners.session {
            listener(session);
        }
    }

    fn notify_connection(&mut self, connected: bool) {
        for listener in &mut self.listeners.connection {
            listener(connected);
        }
    }

    fn send_rempl(&mut self, channel_id: ChannelId, payload: RemplPayload) {
        self.to_hub(Packet::Rempl(channel_id, payload));
    }

    fn to_hub(&mut self, packet: Packet) {
        self.outbox.push(PanelOutput::ToHub(packet));
    }
}
