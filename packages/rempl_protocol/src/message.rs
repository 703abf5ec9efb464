//! Message shapes exchanged across the three contexts.
//!
//! `Packet` is what travels over a hub endpoint (page ↔ hub ↔ panel).
//! `RemplPayload` is the producer-level payload carried inside
//! `Packet::Rempl` and inside in-page `WindowMessage`s.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::ops::Deref;

use crate::error::ProtocolError;
use crate::ids::{CallbackId, ChannelId, PublisherId, TabId};

/// A producer exposed by one publisher hub on the page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublisherInfo {
    pub id: PublisherId,
    pub channel_id: ChannelId,
    pub name: String,
}

impl PublisherInfo {
    pub fn new(hub_id: u32, channel_id: ChannelId, name: &str) -> Self {
        Self {
            id: PublisherId::new(hub_id, name),
            channel_id,
            name: name.to_string(),
        }
    }

    /// Same producer instance: same id on the same page channel.
    pub fn same_identity(&self, other: &PublisherInfo) -> bool {
        self.id == other.id && self.channel_id == other.channel_id
    }
}

/// A publisher list on the wire: `[publishers]`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "(Vec<PublisherInfo>,)", into = "(Vec<PublisherInfo>,)")]
pub struct PublisherList(pub Vec<PublisherInfo>);

impl From<(Vec<PublisherInfo>,)> for PublisherList {
    fn from((list,): (Vec<PublisherInfo>,)) -> Self {
        Self(list)
    }
}

impl From<PublisherList> for (Vec<PublisherInfo>,) {
    fn from(list: PublisherList) -> Self {
        (list.0,)
    }
}

impl From<Vec<PublisherInfo>> for PublisherList {
    fn from(list: Vec<PublisherInfo>) -> Self {
        Self(list)
    }
}

impl Deref for PublisherList {
    type Target = [PublisherInfo];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// Messages carried over a hub endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum Packet {
    /// Both sides of the session are present.
    #[serde(rename = "connect")]
    Connect,
    /// The other side went away.
    #[serde(rename = "disconnect")]
    Disconnect,
    /// Page → panel: page session id and the full publisher list.
    #[serde(rename = "page:connect")]
    PageConnect(String, Vec<PublisherInfo>),
    /// Page → panel: the publisher list changed.
    #[serde(rename = "page:publishers")]
    PagePublishers(PublisherList),
    /// Panel → page: publishers the panel wants connected.
    #[serde(rename = "plugin:subscribers")]
    PluginSubscribers(PublisherList),
    /// Opaque producer traffic, tagged with the page channel it belongs to.
    #[serde(rename = "rempl")]
    Rempl(ChannelId, RemplPayload),
}

impl Packet {
    pub const KNOWN_TYPES: [&'static str; 6] = [
        "connect",
        "disconnect",
        "page:connect",
        "page:publishers",
        "plugin:subscribers",
        "rempl",
    ];

    /// Wire type tag, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Packet::Connect => "connect",
            Packet::Disconnect => "disconnect",
            Packet::PageConnect(..) => "page:connect",
            Packet::PagePublishers(_) => "page:publishers",
            Packet::PluginSubscribers(_) => "plugin:subscribers",
            Packet::Rempl(..) => "rempl",
        }
    }

    /// Decode a JSON text frame, telling unknown types apart from malformed ones.
    pub fn decode(text: &str) -> Result<Packet, ProtocolError> {
        let value: Value = serde_json::from_str(text)?;
        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or(ProtocolError::MissingType)?;

        if !Self::KNOWN_TYPES.contains(&kind) {
            return Err(ProtocolError::UnknownType(kind.to_string()));
        }

        Ok(serde_json::from_value(value)?)
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// A hub packet as text, exactly as its sender produced it.
///
/// Only the outer `type` has been checked. The relay forwards frames without
/// touching their contents; endpoints that act on a packet call
/// [`Frame::decode`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    kind: String,
    text: String,
}

#[derive(Deserialize)]
struct TypeTag {
    #[serde(rename = "type")]
    kind: Option<String>,
}

impl Frame {
    /// Accept a JSON text frame whose outer type is a known packet type.
    pub fn parse(text: impl Into<String>) -> Result<Frame, ProtocolError> {
        let text = text.into();
        let tag: TypeTag = serde_json::from_str(&text)?;
        let kind = tag.kind.ok_or(ProtocolError::MissingType)?;
        if !Packet::KNOWN_TYPES.contains(&kind.as_str()) {
            return Err(ProtocolError::UnknownType(kind));
        }
        Ok(Frame { kind, text })
    }

    pub fn connect() -> Frame {
        Frame {
            kind: "connect".into(),
            text: r#"{"type":"connect"}"#.into(),
        }
    }

    pub fn disconnect() -> Frame {
        Frame {
            kind: "disconnect".into(),
            text: r#"{"type":"disconnect"}"#.into(),
        }
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    pub fn into_text(self) -> String {
        self.text
    }

    pub fn decode(&self) -> Result<Packet, ProtocolError> {
        Ok(serde_json::from_str(&self.text)?)
    }
}

impl TryFrom<&Packet> for Frame {
    type Error = ProtocolError;

    fn try_from(packet: &Packet) -> Result<Frame, ProtocolError> {
        Ok(Frame {
            kind: packet.kind().to_string(),
            text: packet.encode()?,
        })
    }
}

/// First frame of a panel endpoint: declares the session it belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename = "plugin:init")]
pub struct PluginInit {
    #[serde(rename = "tabId")]
    pub tab_id: TabId,
}

impl PluginInit {
    pub fn decode(text: &str) -> Result<PluginInit, ProtocolError> {
        let value: Value = serde_json::from_str(text)?;
        match value.get("type").and_then(Value::as_str) {
            Some("plugin:init") => Ok(serde_json::from_value(value)?),
            Some(other) => Err(ProtocolError::UnknownType(other.to_string())),
            None => Err(ProtocolError::MissingType),
        }
    }
}

/// Where a handshake stands. Sent in every handshake message so neither side
/// has to infer whether the other already answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HandshakeState {
    /// Sender has not heard from the peer yet and expects an answer.
    Initiating,
    /// Sender is answering a peer's handshake; must not be answered.
    Acknowledged,
}

/// Producer-level payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum RemplPayload {
    #[serde(rename = "handshake")]
    Handshake {
        initiator: String,
        state: HandshakeState,
        #[serde(default)]
        endpoints: Vec<String>,
    },

    /// Multiplexer → hub channel: these producers have a subscriber.
    #[serde(rename = "connect")]
    Connect { endpoints: Vec<String> },

    /// Multiplexer → hub channel: nobody is subscribed anymore.
    #[serde(rename = "disconnect")]
    Disconnect,

    /// Producer hub → multiplexer: the current producer names.
    #[serde(rename = "endpoints")]
    Endpoints { data: (Vec<String>,) },

    #[serde(rename = "getRemoteUI")]
    GetRemoteUi {
        endpoint: String,
        #[serde(default)]
        data: Vec<Value>,
        callback: CallbackId,
    },

    #[serde(rename = "data")]
    Data {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        endpoint: Option<String>,
        #[serde(default)]
        data: Vec<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        callback: Option<CallbackId>,
    },

    #[serde(rename = "callback")]
    Callback {
        #[serde(default)]
        data: Vec<Value>,
        callback: CallbackId,
    },
}

impl RemplPayload {
    /// Producer name this payload targets, if it names one.
    pub fn endpoint(&self) -> Option<&str> {
        match self {
            RemplPayload::GetRemoteUi { endpoint, .. } => Some(endpoint),
            RemplPayload::Data { endpoint, .. } => endpoint.as_deref(),
            _ => None,
        }
    }

    /// Payload kinds the panel may deliver into the page.
    pub fn is_panel_traffic(&self) -> bool {
        matches!(
            self,
            RemplPayload::GetRemoteUi { .. }
                | RemplPayload::Data { .. }
                | RemplPayload::Callback { .. }
        )
    }
}

/// An in-page broadcast message (`window.postMessage` envelope).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowMessage {
    pub from: ChannelId,
    /// A channel id, or a `"<name>:connect"` handshake address.
    pub to: String,
    pub payload: RemplPayload,
}

/// How the remote UI is to be loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UiKind {
    Script,
    Url,
}

/// A producer-supplied remote UI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UiDescriptor {
    pub kind: UiKind,
    pub content: String,
}

impl UiDescriptor {
    pub fn script(content: impl Into<String>) -> Self {
        Self {
            kind: UiKind::Script,
            content: content.into(),
        }
    }

    pub fn url(content: impl Into<String>) -> Self {
        Self {
            kind: UiKind::Url,
            content: content.into(),
        }
    }

    /// Parse the arguments of a `getRemoteUI` reply: `[error, kind, content]`.
    pub fn from_callback_args(args: &[Value]) -> Result<UiDescriptor, ProtocolError> {
        match args.first() {
            None | Some(Value::Null) => {}
            Some(Value::String(err)) => return Err(ProtocolError::RemoteUi(err.clone())),
            Some(other) => return Err(ProtocolError::RemoteUi(other.to_string())),
        }

        let kind = args
            .get(1)
            .cloned()
            .ok_or_else(|| ProtocolError::MalformedDescriptor("missing kind".into()))?;
        let kind: UiKind = serde_json::from_value(kind)
            .map_err(|e| ProtocolError::MalformedDescriptor(e.to_string()))?;
        let content = args
            .get(2)
            .and_then(Value::as_str)
            .ok_or_else(|| ProtocolError::MalformedDescriptor("missing content".into()))?;

        Ok(UiDescriptor {
            kind,
            content: content.to_string(),
        })
    }

    /// The reply a producer sends for this descriptor.
    pub fn to_callback_args(&self) -> Vec<Value> {
        let kind = match self.kind {
            UiKind::Script => "script",
            UiKind::Url => "url",
        };
        vec![Value::Null, kind.into(), self.content.clone().into()]
    }
}
