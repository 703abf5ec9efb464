//! Relay hub state machine.
//!
//! One [`Connection`] per tab pairs a page endpoint with a panel ("plugin")
//! endpoint. Packets from one side are forwarded verbatim to the other; a
//! side that is absent simply doesn't receive anything.

use std::collections::HashMap;
use std::fmt;

use rempl_protocol::{Frame, TabId};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Which end of a session an endpoint is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    Page,
    Plugin,
}

impl Side {
    pub fn other(self) -> Side {
        match self {
            Side::Page => Side::Plugin,
            Side::Plugin => Side::Page,
        }
    }
}

/// Unique id of one endpoint (one port / one socket).
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq)]
pub struct EndpointId(pub u64);

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "endpoint-{}", self.0)
    }
}

pub type FrameSender = mpsc::UnboundedSender<Frame>;

struct Endpoint {
    id: EndpointId,
    tx: FrameSender,
    /// Already told that the other side is present.
    notified: bool,
}

#[derive(Default)]
struct Connection {
    page: Option<Endpoint>,
    plugin: Option<Endpoint>,
}

impl Connection {
    fn slot(&self, side: Side) -> &Option<Endpoint> {
        match side {
            Side::Page => &self.page,
            Side::Plugin => &self.plugin,
        }
    }

    fn slot_mut(&mut self, side: Side) -> &mut Option<Endpoint> {
        match side {
            Side::Page => &mut self.page,
            Side::Plugin => &mut self.plugin,
        }
    }

    fn send(&self, side: Side, frame: Frame) {
        match self.slot(side) {
            Some(endpoint) => {
                debug!(?side, kind = frame.kind(), "-> relay");
                let _ = endpoint.tx.send(frame);
            }
            None => {
                debug!(?side, kind = frame.kind(), "not relayed: no endpoint");
            }
        }
    }

    /// Send `connect` to every side not yet told, once both sides are present.
    fn notify_connected(&mut self) {
        if self.page.is_none() || self.plugin.is_none() {
            return;
        }
        for side in [Side::Plugin, Side::Page] {
            if let Some(endpoint) = self.slot_mut(side) {
                if !endpoint.notified {
                    endpoint.notified = true;
                    let _ = endpoint.tx.send(Frame::connect());
                }
            }
        }
    }

    /// Clear `side` and tell the other side it is gone.
    fn detach(&mut self, side: Side) -> Option<Endpoint> {
        let removed = self.slot_mut(side).take()?;
        if let Some(other) = self.slot_mut(side.other()) {
            other.notified = false;
            let _ = other.tx.send(Frame::disconnect());
        }
        Some(removed)
    }
}

enum Route {
    /// Plugin endpoint that has not declared its tab yet.
    Unbound(FrameSender),
    Bound { side: Side, tab: TabId },
}

/// Session/connection bookkeeping for every tab.
#[derive(Default)]
pub struct RelayHub {
    connections: HashMap<TabId, Connection>,
    routes: HashMap<EndpointId, Route>,
}

impl RelayHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach an endpoint whose tab is known.
    ///
    /// An endpoint already holding that side of the session is replaced; the
    /// other side sees a `disconnect` followed by a fresh `connect`.
    pub fn on_peer_connect(&mut self, side: Side, tab: TabId, id: EndpointId, tx: FrameSender) {
        let connection = self.connections.entry(tab).or_default();

        if let Some(previous) = connection.detach(side) {
            info!(%tab, ?side, old = %previous.id, new = %id, "endpoint replaced");
            self.routes.remove(&previous.id);
        } else {
            info!(%tab, ?side, %id, "endpoint connected");
        }

        *connection.slot_mut(side) = Some(Endpoint {
            id,
            tx,
            notified: false,
        });
        connection.notify_connected();
        self.routes.insert(id, Route::Bound { side, tab });
    }

    /// Register a plugin endpoint that still has to send `plugin:init`.
    pub fn on_plugin_open(&mut self, id: EndpointId, tx: FrameSender) {
        debug!(%id, "plugin endpoint awaiting init");
        self.routes.insert(id, Route::Unbound(tx));
    }

    /// Bind a pending plugin endpoint to `tab`. Only the first init counts.
    pub fn on_plugin_init(&mut self, id: EndpointId, tab: TabId) -> bool {
        match self.routes.remove(&id) {
            Some(Route::Unbound(tx)) => {
                self.on_peer_connect(Side::Plugin, tab, id, tx);
                true
            }
            Some(bound @ Route::Bound { .. }) => {
                warn!(%id, "plugin endpoint sent init twice, ignoring");
                self.routes.insert(id, bound);
                false
            }
            None => {
                debug!(%id, "init from unknown endpoint");
                false
            }
        }
    }

    /// Forward a frame from endpoint `from` to the other side of its session.
    pub fn on_peer_message(&mut self, from: EndpointId, frame: Frame) {
        match self.routes.get(&from) {
            Some(Route::Bound { side, tab }) => {
                if let Some(connection) = self.connections.get(tab) {
                    connection.send(side.other(), frame);
                }
            }
            Some(Route::Unbound(_)) => {
                warn!(%from, kind = frame.kind(), "dropping packet from plugin before init");
            }
            None => {
                debug!(%from, kind = frame.kind(), "dropping packet from stale endpoint");
            }
        }
    }

    /// Endpoint `id` went away. The connection record is kept so a
    /// reconnect on the same tab resumes the pairing.
    pub fn on_peer_disconnect(&mut self, id: EndpointId) {
        let Some(route) = self.routes.remove(&id) else {
            return;
        };
        let Route::Bound { side, tab } = route else {
            debug!(%id, "unbound plugin endpoint closed");
            return;
        };
        if let Some(connection) = self.connections.get_mut(&tab) {
            if connection.slot(side).as_ref().map(|e| e.id) == Some(id) {
                info!(%tab, ?side, %id, "endpoint disconnected");
                connection.detach(side);
            }
        }
    }

    pub fn session_count(&self) -> usize {
        self.connections.len()
    }

    pub fn is_attached(&self, tab: TabId, side: Side) -> bool {
        self.connections
            .get(&tab)
            .is_some_and(|c| c.slot(side).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rempl_protocol::{ChannelId, Packet, PublisherList, RemplPayload};
    use serde_json::json;

    fn endpoint() -> (FrameSender, mpsc::UnboundedReceiver<Frame>) {
        mpsc::unbounded_channel()
    }

    fn drain_frames(rx: &mut mpsc::UnboundedReceiver<Frame>) -> Vec<Frame> {
        let mut frames = Vec::new();
        while let Ok(f) = rx.try_recv() {
            frames.push(f);
        }
        frames
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<Frame>) -> Vec<Packet> {
        drain_frames(rx)
            .iter()
            .map(|f| f.decode().unwrap())
            .collect()
    }

    fn frame(packet: Packet) -> Frame {
        Frame::try_from(&packet).unwrap()
    }

    fn rempl_packet(n: i64) -> Packet {
        Packet::Rempl(
            ChannelId::from("pub/1"),
            RemplPayload::Data {
                endpoint: None,
                data: vec![json!(n)],
                callback: None,
            },
        )
    }

    fn rempl(n: i64) -> Frame {
        frame(rempl_packet(n))
    }

    const TAB: TabId = TabId(1);
    const PAGE: EndpointId = EndpointId(1);
    const PLUGIN: EndpointId = EndpointId(2);

    fn paired() -> (
        RelayHub,
        mpsc::UnboundedReceiver<Frame>,
        mpsc::UnboundedReceiver<Frame>,
    ) {
        let mut hub = RelayHub::new();
        let (page_tx, page_rx) = endpoint();
        let (plugin_tx, plugin_rx) = endpoint();
        hub.on_peer_connect(Side::Page, TAB, PAGE, page_tx);
        hub.on_plugin_open(PLUGIN, plugin_tx);
        assert!(hub.on_plugin_init(PLUGIN, TAB));
        (hub, page_rx, plugin_rx)
    }

    #[test]
    fn connect_sent_once_both_sides_present() {
        let mut hub = RelayHub::new();
        let (page_tx, mut page_rx) = endpoint();
        hub.on_peer_connect(Side::Page, TAB, PAGE, page_tx);
        assert!(drain(&mut page_rx).is_empty());

        let (plugin_tx, mut plugin_rx) = endpoint();
        hub.on_plugin_open(PLUGIN, plugin_tx);
        assert!(drain(&mut plugin_rx).is_empty());

        hub.on_plugin_init(PLUGIN, TAB);
        assert_eq!(drain(&mut page_rx), vec![Packet::Connect]);
        assert_eq!(drain(&mut plugin_rx), vec![Packet::Connect]);
    }

    #[test]
    fn second_init_does_not_renotify() {
        let (mut hub, mut page_rx, mut plugin_rx) = paired();
        drain(&mut page_rx);
        drain(&mut plugin_rx);

        assert!(!hub.on_plugin_init(PLUGIN, TAB));
        assert!(drain(&mut page_rx).is_empty());
        assert!(drain(&mut plugin_rx).is_empty());
    }

    #[test]
    fn packets_relay_in_order_both_ways() {
        let (mut hub, mut page_rx, mut plugin_rx) = paired();
        drain(&mut page_rx);
        drain(&mut plugin_rx);

        hub.on_peer_message(PAGE, rempl(1));
        hub.on_peer_message(PAGE, rempl(2));
        hub.on_peer_message(PLUGIN, frame(Packet::PluginSubscribers(PublisherList::default())));

        assert_eq!(drain(&mut plugin_rx), vec![rempl_packet(1), rempl_packet(2)]);
        assert_eq!(
            drain(&mut page_rx),
            vec![Packet::PluginSubscribers(PublisherList::default())]
        );
    }

    #[test]
    fn unbound_plugin_traffic_is_dropped() {
        let mut hub = RelayHub::new();
        let (page_tx, mut page_rx) = endpoint();
        let (plugin_tx, _plugin_rx) = endpoint();
        hub.on_peer_connect(Side::Page, TAB, PAGE, page_tx);
        hub.on_plugin_open(PLUGIN, plugin_tx);

        hub.on_peer_message(PLUGIN, rempl(1));
        assert!(drain(&mut page_rx).is_empty());
    }

    #[test]
    fn missing_side_is_silent() {
        let mut hub = RelayHub::new();
        let (page_tx, _page_rx) = endpoint();
        hub.on_peer_connect(Side::Page, TAB, PAGE, page_tx);
        hub.on_peer_message(PAGE, rempl(1));
        assert!(hub.is_attached(TAB, Side::Page));
        assert!(!hub.is_attached(TAB, Side::Plugin));
    }

    #[test]
    fn disconnect_notifies_survivor_and_keeps_record() {
        let (mut hub, mut page_rx, mut plugin_rx) = paired();
        drain(&mut page_rx);
        drain(&mut plugin_rx);

        hub.on_peer_disconnect(PAGE);
        assert_eq!(drain(&mut plugin_rx), vec![Packet::Disconnect]);
        assert_eq!(hub.session_count(), 1);

        // A new page on the same tab resumes the pairing.
        let (page_tx, mut page_rx) = endpoint();
        hub.on_peer_connect(Side::Page, TAB, EndpointId(3), page_tx);
        assert_eq!(drain(&mut plugin_rx), vec![Packet::Connect]);
        assert_eq!(drain(&mut page_rx), vec![Packet::Connect]);
    }

    #[test]
    fn replacement_keeps_a_single_page_endpoint() {
        let (mut hub, mut old_page_rx, mut plugin_rx) = paired();
        drain(&mut old_page_rx);
        drain(&mut plugin_rx);

        let (new_tx, mut new_page_rx) = endpoint();
        hub.on_peer_connect(Side::Page, TAB, EndpointId(3), new_tx);
        assert_eq!(drain(&mut plugin_rx), vec![Packet::Disconnect, Packet::Connect]);

        hub.on_peer_message(PLUGIN, rempl(7));
        assert_eq!(drain(&mut new_page_rx), vec![Packet::Connect, rempl_packet(7)]);
        assert!(drain(&mut old_page_rx).is_empty());

        // The replaced endpoint can neither send nor evict its successor.
        hub.on_peer_message(PAGE, rempl(8));
        hub.on_peer_disconnect(PAGE);
        assert!(drain(&mut plugin_rx).is_empty());
        assert!(hub.is_attached(TAB, Side::Page));
    }

    #[test]
    fn sessions_are_isolated() {
        let (mut hub, mut page_rx, mut plugin_rx) = paired();
        let (other_tx, mut other_rx) = endpoint();
        hub.on_peer_connect(Side::Page, TabId(2), EndpointId(9), other_tx);

        hub.on_peer_message(EndpointId(9), rempl(1));
        assert!(drain(&mut other_rx).is_empty());
        drain(&mut page_rx);
        assert_eq!(drain(&mut plugin_rx), vec![Packet::Connect]);
        assert_eq!(hub.session_count(), 2);
    }

    #[test]
    fn frames_are_forwarded_byte_for_byte() {
        let (mut hub, mut page_rx, mut plugin_rx) = paired();
        drain(&mut page_rx);
        drain(&mut plugin_rx);

        let extra = r#"{"type":"rempl","data":["pub/x",{"type":"data","endpoint":"net","data":[1],"ts":42}]}"#;
        let unknown = r#"{"type":"rempl","data":["pub/x",{"type":"ping","data":[]}]}"#;
        hub.on_peer_message(PAGE, Frame::parse(extra).unwrap());
        hub.on_peer_message(PAGE, Frame::parse(unknown).unwrap());

        let texts: Vec<String> = drain_frames(&mut plugin_rx)
            .into_iter()
            .map(Frame::into_text)
            .collect();
        assert_eq!(texts, vec![extra, unknown]);
    }
}
