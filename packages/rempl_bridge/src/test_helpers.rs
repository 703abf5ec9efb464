use std::sync::{Arc, Mutex};
use std::time::Duration;

use rempl_protocol::{ChannelId, HandshakeState, RemplPayload, UiDescriptor, WindowMessage};
use serde_json::json;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::config::PageConfig;
use crate::error::SandboxError;
use crate::page::PageBus;
use crate::panel::{PanelHandle, PanelSnapshot};
use crate::sandbox::{ExecutionContext, SandboxBridge, SandboxRuntime};

// =============================================================================
// Sandbox runtime that records what it was asked to do
// =============================================================================

#[derive(Default)]
struct Recorded {
    loaded: Vec<UiDescriptor>,
    detached: usize,
    bridges: Vec<SandboxBridge>,
}

/// Creates inert contexts and keeps their bridges for the test to drive.
#[derive(Clone, Default)]
pub struct RecordingRuntime {
    inner: Arc<Mutex<Recorded>>,
}

impl RecordingRuntime {
    pub fn loads(&self) -> usize {
        self.inner.lock().unwrap().loaded.len()
    }

    pub fn loaded(&self) -> Vec<UiDescriptor> {
        self.inner.lock().unwrap().loaded.clone()
    }

    pub fn detaches(&self) -> usize {
        self.inner.lock().unwrap().detached
    }

    /// Bridge of the most recently loaded sandbox.
    pub fn take_bridge(&self) -> Option<SandboxBridge> {
        self.inner.lock().unwrap().bridges.pop()
    }
}

struct RecordingContext(Arc<Mutex<Recorded>>);

impl ExecutionContext for RecordingContext {
    fn detach(&mut self) {
        self.0.lock().unwrap().detached += 1;
    }
}

impl SandboxRuntime for RecordingRuntime {
    fn instantiate(
        &self,
        ui: &UiDescriptor,
        bridge: SandboxBridge,
    ) -> Result<Box<dyn ExecutionContext>, SandboxError> {
        let mut inner = self.inner.lock().unwrap();
        inner.loaded.push(ui.clone());
        inner.bridges.push(bridge);
        Ok(Box::new(RecordingContext(self.inner.clone())))
    }
}

// =============================================================================
// A producer hub living on the page
// =============================================================================

/// Speaks the producer side of the page protocol on a [`PageBus`]: answers
/// handshakes with its endpoint names, serves `ui` for `getRemoteUI`, and
/// echoes `data` requests that expect a reply.
pub struct FakePublisher {
    pub channel: ChannelId,
    bus: PageBus,
    /// Input channel of the multiplexer we last heard from.
    host: Arc<Mutex<Option<ChannelId>>>,
    received: Arc<Mutex<Vec<RemplPayload>>>,
    task: JoinHandle<()>,
}

impl FakePublisher {
    pub fn spawn(bus: &PageBus, names: &[&str], ui: UiDescriptor) -> FakePublisher {
        let config = PageConfig::default();
        let channel = ChannelId::mint(&config.publisher_name);
        let names: Vec<String> = names.iter().map(|n| n.to_string()).collect();
        let received = Arc::new(Mutex::new(Vec::new()));
        let host = Arc::new(Mutex::new(None));

        let mut rx = bus.subscribe();
        let hello = |state| WindowMessage {
            from: channel.clone(),
            to: config.host_connect_address(),
            payload: RemplPayload::Handshake {
                initiator: config.publisher_name.clone(),
                state,
                endpoints: names.clone(),
            },
        };
        let ack = hello(HandshakeState::Acknowledged);
        bus.post(hello(HandshakeState::Initiating));

        let task = {
            let bus = bus.clone();
            let channel = channel.clone();
            let received = received.clone();
            let host = host.clone();
            let connect_address = config.publisher_connect_address();
            let host_name = config.host_name.clone();
            tokio::spawn(async move {
                loop {
                    let msg = match rx.recv().await {
                        Ok(msg) => msg,
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => break,
                    };

                    if msg.to == connect_address {
                        if let RemplPayload::Handshake {
                            initiator,
                            state: HandshakeState::Initiating,
                            ..
                        } = &msg.payload
                        {
                            if *initiator == host_name {
                                *host.lock().unwrap() = Some(msg.from.clone());
                                bus.post(ack.clone());
                            }
                        }
                        continue;
                    }
                    if msg.to != channel.as_str() {
                        continue;
                    }

                    *host.lock().unwrap() = Some(msg.from.clone());
                    received.lock().unwrap().push(msg.payload.clone());
                    let reply = match msg.payload {
                        RemplPayload::GetRemoteUi { callback, .. } => Some(RemplPayload::Callback {
                            data: ui.to_callback_args(),
                            callback,
                        }),
                        RemplPayload::Data {
                            data,
                            callback: Some(callback),
                            ..
                        } => Some(RemplPayload::Callback { data, callback }),
                        _ => None,
                    };
                    if let Some(payload) = reply {
                        bus.post(WindowMessage {
                            from: channel.clone(),
                            to: msg.from.0.clone(),
                            payload,
                        });
                    }
                }
            })
        };

        FakePublisher {
            channel,
            bus: bus.clone(),
            host,
            received,
            task,
        }
    }

    pub fn received(&self) -> Vec<RemplPayload> {
        self.received.lock().unwrap().clone()
    }

    /// Push data to the multiplexer, as a producer would.
    pub fn push(&self, endpoint: &str, n: i64) {
        let Some(to) = self.host.lock().unwrap().clone() else {
            panic!("no multiplexer seen yet");
        };
        self.bus.post(WindowMessage {
            from: self.channel.clone(),
            to: to.0,
            payload: RemplPayload::Data {
                endpoint: Some(endpoint.to_string()),
                data: vec![json!(n)],
                callback: None,
            },
        });
    }
}

impl Drop for FakePublisher {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Poll the panel until `pred` holds.
pub async fn wait_for_panel(
    panel: &PanelHandle,
    pred: impl Fn(&PanelSnapshot) -> bool,
) -> PanelSnapshot {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let snapshot = panel.snapshot().await.expect("panel gone");
            if pred(&snapshot) {
                return snapshot;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("timed out waiting for panel state")
}

/// Poll until `pred` holds.
pub async fn wait_until(pred: impl Fn() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !pred() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("timed out waiting for condition")
}
