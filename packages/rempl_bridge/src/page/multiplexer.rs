//! Page-side multiplexer.
//!
//! Discovers producer hubs on the page through the handshake, keeps one
//! [`PublisherHub`] per hub channel, and tells each hub whether any of its
//! producers is wanted by the panel. Everything here is synchronous: inputs
//! go in through `handle_*`, effects come out of [`PageMultiplexer::take_output`].

use std::collections::{HashSet, VecDeque};

use rempl_protocol::{
    ChannelId, HandshakeState, Packet, PublisherId, PublisherInfo, PublisherList, RemplPayload,
    TaskSlot, TaskToken, UID_LENGTH, WindowMessage, gen_uid,
};
use tracing::{debug, info, trace, warn};

use crate::config::PageConfig;

/// One producer hub discovered on the page.
#[derive(Debug, Clone, PartialEq)]
pub struct PublisherHub {
    /// Discovery order, starting at 0.
    pub id: u32,
    pub channel_id: ChannelId,
    /// Whether the hub was last told `connect`.
    pub connected: bool,
    /// Whether our `acknowledged` handshake was already sent to it.
    pub acknowledged: bool,
    pub publishers: Vec<PublisherInfo>,
}

/// Effects produced by the multiplexer.
#[derive(Debug, Clone, PartialEq)]
pub enum PageOutput {
    ToHub(Packet),
    ToPage(WindowMessage),
}

#[derive(Debug, Clone, Copy)]
enum Microtask {
    SyncPublishers(TaskToken),
}

pub struct PageMultiplexer {
    config: PageConfig,
    session_id: String,
    input_channel: ChannelId,
    plugin_connected: bool,
    rempl_connected: bool,
    subscribers: Vec<PublisherInfo>,
    hubs: Vec<PublisherHub>,
    /// Every known producer, in discovery order.
    publishers: Vec<PublisherInfo>,
    publishers_sync: TaskSlot,
    microtasks: VecDeque<Microtask>,
    outbox: Vec<PageOutput>,
}

impl PageMultiplexer {
    pub fn new(config: PageConfig) -> Self {
        let input_channel = ChannelId::mint(&config.host_name);
        Self {
            config,
            session_id: gen_uid(UID_LENGTH),
            input_channel,
            plugin_connected: false,
            rempl_connected: false,
            subscribers: Vec::new(),
            hubs: Vec::new(),
            publishers: Vec::new(),
            publishers_sync: TaskSlot::new(),
            microtasks: VecDeque::new(),
            outbox: Vec::new(),
        }
    }

    /// Announce ourselves to any producer hub already on the page.
    pub fn start(&mut self) {
        info!(channel = %self.input_channel, "page multiplexer started");
        self.handshake(HandshakeState::Initiating);
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn input_channel(&self) -> &ChannelId {
        &self.input_channel
    }

    pub fn hubs(&self) -> &[PublisherHub] {
        &self.hubs
    }

    pub fn publishers(&self) -> &[PublisherInfo] {
        &self.publishers
    }

    pub fn is_plugin_connected(&self) -> bool {
        self.plugin_connected
    }

    /// Drain pending effects.
    pub fn take_output(&mut self) -> Vec<PageOutput> {
        std::mem::take(&mut self.outbox)
    }

    /// Run deferred work queued during the current turn.
    pub fn run_microtasks(&mut self) {
        while let Some(task) = self.microtasks.pop_front() {
            match task {
                Microtask::SyncPublishers(token) => {
                    if self.publishers_sync.fire(token) {
                        debug!(count = self.publishers.len(), "-> page:publishers");
                        self.to_hub(Packet::PagePublishers(PublisherList(
                            self.publishers.clone(),
                        )));
                    }
                }
            }
        }
    }

    // =========================================================================
    // Hub side
    // =========================================================================

    pub fn handle_packet(&mut self, packet: Packet) {
        trace!(kind = packet.kind(), "from hub");
        match packet {
            Packet::Connect => {
                if !self.plugin_connected && self.rempl_connected {
                    self.publishers_sync.cancel();
                    self.sync_publisher_connections();
                    self.send_page_connect();
                }
                self.plugin_connected = true;
            }
            Packet::Disconnect => {
                self.subscribers.clear();
                self.plugin_connected = false;
                self.sync_publisher_connections();
            }
            Packet::PluginSubscribers(PublisherList(subscribers)) => {
                self.subscribers = subscribers;
                self.sync_publisher_connections();
            }
            Packet::Rempl(channel_id, payload) => {
                if payload.is_panel_traffic() {
                    self.to_page(channel_id.0, payload);
                } else {
                    debug!(channel = %channel_id, "dropping non-panel payload from hub");
                }
            }
            other @ (Packet::PageConnect(..) | Packet::PagePublishers(_)) => {
                warn!(kind = other.kind(), "Unexpected packet type on page side");
            }
        }
    }

    // =========================================================================
    // Page side
    // =========================================================================

    pub fn handle_window_message(&mut self, msg: WindowMessage) {
        if msg.to == self.config.host_connect_address() {
            match msg.payload {
                RemplPayload::Handshake {
                    initiator,
                    state,
                    endpoints,
                } if initiator == self.config.publisher_name => {
                    self.on_page_connect(msg.from, state, endpoints);
                }
                _ => {}
            }
        } else if msg.to == self.input_channel.as_str() {
            self.on_page_data(msg.from, msg.payload);
        }
    }

    fn on_page_connect(&mut self, from: ChannelId, state: HandshakeState, endpoints: Vec<String>) {
        let already_acknowledged = self
            .hubs
            .iter()
            .any(|hub| hub.channel_id == from && hub.acknowledged);

        if state == HandshakeState::Initiating && !already_acknowledged {
            self.handshake(HandshakeState::Acknowledged);
        }

        self.rempl_connected = true;
        self.update_publisher_hub(&from, endpoints);
        if let Some(hub) = self.hubs.iter_mut().find(|hub| hub.channel_id == from) {
            hub.acknowledged |= state == HandshakeState::Initiating;
        }

        if self.plugin_connected {
            self.publishers_sync.cancel();
            self.sync_publisher_connections();
            self.send_page_connect();
        }
    }

    fn on_page_data(&mut self, from: ChannelId, payload: RemplPayload) {
        if let RemplPayload::Endpoints { data: (names,) } = &payload {
            self.update_publisher_hub(&from, names.clone());
            if !self.plugin_connected {
                return;
            }
        }
        self.to_hub(Packet::Rempl(from, payload));
    }

    /// Replace the producer list of the hub on `channel_id`, creating the
    /// hub on first sight.
    pub fn update_publisher_hub(&mut self, channel_id: &ChannelId, names: Vec<String>) {
        let index = match self.hubs.iter().position(|h| &h.channel_id == channel_id) {
            Some(index) => index,
            None => {
                let id = self.hubs.len() as u32;
                info!(hub = id, channel = %channel_id, "publisher hub discovered");
                self.hubs.push(PublisherHub {
                    id,
                    channel_id: channel_id.clone(),
                    connected: false,
                    acknowledged: false,
                    publishers: Vec::new(),
                });
                self.hubs.len() - 1
            }
        };
        let hub_id = self.hubs[index].id;

        let mut changed = false;
        let mut next: Vec<PublisherInfo> = Vec::with_capacity(names.len());
        for name in &names {
            let id = PublisherId::new(hub_id, name);
            if next.iter().any(|p| p.id == id) {
                continue;
            }
            match self.publishers.iter().find(|p| p.id == id) {
                Some(existing) => next.push(existing.clone()),
                None => {
                    changed = true;
                    let publisher = PublisherInfo::new(hub_id, channel_id.clone(), name);
                    self.publishers.push(publisher.clone());
                    next.push(publisher);
                }
            }
        }

        let removed: HashSet<PublisherId> = self.hubs[index]
            .publishers
            .iter()
            .filter(|old| !next.iter().any(|p| p.id == old.id))
            .map(|old| old.id.clone())
            .collect();
        if !removed.is_empty() {
            changed = true;
            self.publishers.retain(|p| !removed.contains(&p.id));
        }

        if changed {
            debug!(hub = hub_id, publishers = ?names, "publisher hub updated");
            self.hubs[index].publishers = next;
            self.sync_publisher_connections();
            self.schedule_publishers_sync();
        }
    }

    /// Tell each hub `connect`/`disconnect` when its wanted state changed.
    pub fn sync_publisher_connections(&mut self) {
        let wanted: HashSet<&PublisherId> = self.subscribers.iter().map(|s| &s.id).collect();
        let mut messages = Vec::new();

        for hub in &mut self.hubs {
            let endpoints: Vec<String> = hub
                .publishers
                .iter()
                .filter(|p| wanted.contains(&p.id))
                .map(|p| p.id.0.clone())
                .collect();
            let should_be_connected = !endpoints.is_empty();

            if hub.connected != should_be_connected {
                hub.connected = should_be_connected;
                let payload = if should_be_connected {
                    RemplPayload::Connect { endpoints }
                } else {
                    RemplPayload::Disconnect
                };
                messages.push((hub.channel_id.0.clone(), payload));
            }
        }

        for (to, payload) in messages {
            self.to_page(to, payload);
        }
    }

    fn schedule_publishers_sync(&mut self) {
        if let Some(token) = self.publishers_sync.schedule() {
            self.microtasks.push_back(Microtask::SyncPublishers(token));
        }
    }

    fn send_page_connect(&mut self) {
        info!(publishers = self.publishers.len(), "-> page:connect");
        self.to_hub(Packet::PageConnect(
            self.session_id.clone(),
            self.publishers.clone(),
        ));
    }

    fn handshake(&mut self, state: HandshakeState) {
        let to = self.config.publisher_connect_address();
        self.to_page(
            to,
            RemplPayload::Handshake {
                initiator: self.config.host_name.clone(),
                state,
                endpoints: Vec::new(),
            },
        );
    }

    fn to_hub(&mut self, packet: Packet) {
        self.outbox.push(PageOutput::ToHub(packet));
    }

    fn to_page(&mut self, to: String, payload: RemplPayload) {
        self.outbox.push(PageOutput::ToPage(WindowMessage {
            from: self.input_channel.clone(),
            to,
            payload,
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rempl_protocol::CallbackId;
    use serde_json::json;

    const HOST: &str = "rempl-browser-extension-host:connect";
    const PUBLISHER: &str = "rempl-browser-extension-publisher:connect";

    fn mux() -> PageMultiplexer {
        let mut mux = PageMultiplexer::new(PageConfig::default());
        mux.start();
        mux
    }

    fn hello(from: &str, state: HandshakeState, names: &[&str]) -> WindowMessage {
        WindowMessage {
            from: ChannelId::from(from),
            to: HOST.to_string(),
            payload: RemplPayload::Handshake {
                initiator: "rempl-browser-extension-publisher".into(),
                state,
                endpoints: names.iter().map(|n| n.to_string()).collect(),
            },
        }
    }

    fn endpoints(mux: &PageMultiplexer, from: &str, names: &[&str]) -> WindowMessage {
        WindowMessage {
            from: ChannelId::from(from),
            to: mux.input_channel().0.clone(),
            payload: RemplPayload::Endpoints {
                data: (names.iter().map(|n| n.to_string()).collect(),),
            },
        }
    }

    fn hub_packets(out: &[PageOutput]) -> Vec<&Packet> {
        out.iter()
            .filter_map(|o| match o {
                PageOutput::ToHub(p) => Some(p),
                _ => None,
            })
            .collect()
    }

    fn page_messages(out: &[PageOutput]) -> Vec<&WindowMessage> {
        out.iter()
            .filter_map(|o| match o {
                PageOutput::ToPage(m) => Some(m),
                _ => None,
            })
            .collect()
    }

    fn ids(list: &[PublisherInfo]) -> Vec<&str> {
        list.iter().map(|p| p.id.as_str()).collect()
    }

    #[test]
    fn start_sends_initiating_handshake() {
        let mut mux = mux();
        let out = mux.take_output();
        let msgs = page_messages(&out);
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].to, PUBLISHER);
        assert_eq!(&msgs[0].from, mux.input_channel());
        assert!(matches!(
            msgs[0].payload,
            RemplPayload::Handshake {
                state: HandshakeState::Initiating,
                ..
            }
        ));
    }

    #[test]
    fn initiating_hub_is_acknowledged_once() {
        let mut mux = mux();
        mux.take_output();

        mux.handle_window_message(hello("pub/a", HandshakeState::Initiating, &["net"]));
        mux.handle_window_message(hello("pub/a", HandshakeState::Initiating, &["net"]));
        let out = mux.take_output();
        let acks = page_messages(&out)
            .into_iter()
            .filter(|m| {
                matches!(
                    m.payload,
                    RemplPayload::Handshake {
                        state: HandshakeState::Acknowledged,
                        ..
                    }
                )
            })
            .count();
        assert_eq!(acks, 1);
    }

    #[test]
    fn acknowledged_reply_is_not_answered() {
        let mut mux = mux();
        mux.take_output();
        mux.handle_window_message(hello("pub/a", HandshakeState::Acknowledged, &["net"]));
        assert!(page_messages(&mux.take_output()).is_empty());
        assert_eq!(ids(mux.publishers()), vec!["0:net"]);
    }

    #[test]
    fn foreign_initiator_is_ignored() {
        let mut mux = mux();
        mux.take_output();
        let mut msg = hello("pub/a", HandshakeState::Initiating, &["net"]);
        if let RemplPayload::Handshake { initiator, .. } = &mut msg.payload {
            *initiator = "someone-else".into();
        }
        mux.handle_window_message(msg);
        assert!(mux.hubs().is_empty());
        assert!(mux.take_output().is_empty());
    }

    #[test]
    fn hubs_numbered_in_discovery_order() {
        let mut mux = mux();
        mux.handle_window_message(hello("pub/a", HandshakeState::Initiating, &["net"]));
        mux.handle_window_message(hello("pub/b", HandshakeState::Initiating, &["net"]));
        mux.handle_window_message(hello("pub/a", HandshakeState::Initiating, &["net"]));

        assert_eq!(mux.hubs().len(), 2);
        assert_eq!(mux.hubs()[0].id, 0);
        assert_eq!(mux.hubs()[1].id, 1);
        assert_eq!(ids(mux.publishers()), vec!["0:net", "1:net"]);
    }

    #[test]
    fn duplicate_names_collapse() {
        let mut mux = mux();
        mux.update_publisher_hub(&ChannelId::from("pub/a"), vec!["net".into(), "net".into()]);
        assert_eq!(ids(mux.publishers()), vec!["0:net"]);
        assert_eq!(mux.hubs()[0].publishers.len(), 1);
    }

    #[test]
    fn three_updates_in_one_turn_send_one_publisher_list() {
        let mut mux = mux();
        mux.take_output();
        let ch = ChannelId::from("pub/a");

        mux.update_publisher_hub(&ch, vec!["net".into()]);
        mux.update_publisher_hub(&ch, vec!["net".into(), "perf".into()]);
        mux.update_publisher_hub(&ch, vec!["perf".into(), "dom".into()]);
        mux.run_microtasks();

        let out = mux.take_output();
        let packets = hub_packets(&out);
        assert_eq!(packets.len(), 1);
        match packets[0] {
            Packet::PagePublishers(list) => assert_eq!(ids(list), vec!["0:perf", "0:dom"]),
            other => panic!("unexpected packet: {other:?}"),
        }
    }

    #[test]
    fn unchanged_update_schedules_nothing() {
        let mut mux = mux();
        let ch = ChannelId::from("pub/a");
        mux.update_publisher_hub(&ch, vec!["net".into()]);
        mux.run_microtasks();
        mux.take_output();

        mux.update_publisher_hub(&ch, vec!["net".into()]);
        mux.run_microtasks();
        assert!(mux.take_output().is_empty());
    }

    #[test]
    fn later_turn_schedules_again() {
        let mut mux = mux();
        let ch = ChannelId::from("pub/a");
        mux.update_publisher_hub(&ch, vec!["net".into()]);
        mux.run_microtasks();
        mux.take_output();

        mux.update_publisher_hub(&ch, vec!["perf".into()]);
        mux.run_microtasks();
        assert_eq!(hub_packets(&mux.take_output()).len(), 1);
    }

    #[test]
    fn plugin_connect_sends_full_page_connect_and_cancels_sync() {
        let mut mux = mux();
        mux.handle_window_message(hello("pub/a", HandshakeState::Initiating, &["net", "perf"]));
        mux.take_output();

        // Panel shows up in the same turn as the pending list sync.
        mux.handle_packet(Packet::Connect);
        mux.run_microtasks();

        let out = mux.take_output();
        let packets = hub_packets(&out);
        assert_eq!(packets.len(), 1);
        match packets[0] {
            Packet::PageConnect(session, list) => {
                assert_eq!(session, mux.session_id());
                assert_eq!(ids(list), vec!["0:net", "0:perf"]);
            }
            other => panic!("unexpected packet: {other:?}"),
        }
        assert!(mux.is_plugin_connected());
    }

    #[test]
    fn repeated_connect_sends_page_connect_once() {
        let mut mux = mux();
        mux.handle_window_message(hello("pub/a", HandshakeState::Initiating, &["net"]));
        mux.run_microtasks();
        mux.take_output();

        mux.handle_packet(Packet::Connect);
        mux.run_microtasks();
        let first = mux.take_output();
        assert!(matches!(hub_packets(&first)[..], [Packet::PageConnect(..)]));

        mux.handle_packet(Packet::Connect);
        mux.run_microtasks();
        assert!(hub_packets(&mux.take_output()).is_empty());
        assert!(mux.is_plugin_connected());
    }

    #[test]
    fn connect_before_any_hub_sends_nothing() {
        let mut mux = mux();
        mux.take_output();
        mux.handle_packet(Packet::Connect);
        assert!(mux.take_output().is_empty());

        // The first hub then triggers page:connect directly.
        mux.handle_window_message(hello("pub/a", HandshakeState::Acknowledged, &["net"]));
        let out = mux.take_output();
        assert!(matches!(hub_packets(&out)[..], [Packet::PageConnect(..)]));
    }

    #[test]
    fn subscribers_drive_hub_connections_edge_triggered() {
        let mut mux = mux();
        mux.handle_window_message(hello("pub/a", HandshakeState::Acknowledged, &["net", "perf"]));
        mux.handle_packet(Packet::Connect);
        mux.take_output();

        let net = mux.publishers()[0].clone();
        let perf = mux.publishers()[1].clone();
        mux.handle_packet(Packet::PluginSubscribers(vec![net.clone()].into()));
        let out = mux.take_output();
        let msgs = page_messages(&out);
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].to, "pub/a");
        assert_eq!(
            msgs[0].payload,
            RemplPayload::Connect {
                endpoints: vec!["0:net".into()]
            }
        );

        // Still connected: switching producers within the hub is not an edge.
        mux.handle_packet(Packet::PluginSubscribers(vec![perf].into()));
        assert!(mux.take_output().is_empty());

        mux.handle_packet(Packet::Disconnect);
        let out = mux.take_output();
        let msgs = page_messages(&out);
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].payload, RemplPayload::Disconnect);
        assert!(mux.hubs()[0].publishers.contains(&net));
    }

    #[test]
    fn producer_payloads_forwarded_tagged_with_channel() {
        let mut mux = mux();
        mux.handle_window_message(hello("pub/a", HandshakeState::Acknowledged, &["net"]));
        mux.handle_packet(Packet::Connect);
        mux.take_output();

        let payload = RemplPayload::Data {
            endpoint: Some("net".into()),
            data: vec![json!({ "x": 1 })],
            callback: None,
        };
        mux.handle_window_message(WindowMessage {
            from: ChannelId::from("pub/a"),
            to: mux.input_channel().0.clone(),
            payload: payload.clone(),
        });
        assert_eq!(
            mux.take_output(),
            vec![PageOutput::ToHub(Packet::Rempl(ChannelId::from("pub/a"), payload))]
        );
    }

    #[test]
    fn endpoints_update_forwarded_only_while_panel_connected() {
        let mut mux = mux();
        mux.handle_window_message(hello("pub/a", HandshakeState::Acknowledged, &["net"]));
        mux.take_output();

        let msg = endpoints(&mux, "pub/a", &["net", "perf"]);
        mux.handle_window_message(msg);
        assert!(
            !hub_packets(&mux.take_output())
                .iter()
                .any(|p| matches!(p, Packet::Rempl(..)))
        );
        assert_eq!(ids(mux.publishers()), vec!["0:net", "0:perf"]);

        mux.handle_packet(Packet::Connect);
        mux.take_output();
        let msg = endpoints(&mux, "pub/a", &["net"]);
        mux.handle_window_message(msg);
        assert!(
            hub_packets(&mux.take_output())
                .iter()
                .any(|p| matches!(p, Packet::Rempl(..)))
        );
    }

    #[test]
    fn inbound_panel_traffic_is_filtered_by_type() {
        let mut mux = mux();
        mux.take_output();

        let request = RemplPayload::GetRemoteUi {
            endpoint: "net".into(),
            data: vec![json!({})],
            callback: CallbackId("k1".into()),
        };
        mux.handle_packet(Packet::Rempl(ChannelId::from("pub/a"), request.clone()));
        mux.handle_packet(Packet::Rempl(
            ChannelId::from("pub/a"),
            RemplPayload::Endpoints {
                data: (vec!["spoof".into()],),
            },
        ));

        let out = mux.take_output();
        let msgs = page_messages(&out);
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].to, "pub/a");
        assert_eq!(msgs[0].payload, request);
    }

    #[test]
    fn messages_for_other_addresses_are_ignored() {
        let mut mux = mux();
        mux.take_output();
        mux.handle_window_message(WindowMessage {
            from: ChannelId::from("pub/a"),
            to: "someone-else/xyz".into(),
            payload: RemplPayload::Disconnect,
        });
        assert!(mux.take_output().is_empty());
    }
}
