//! Isolated execution contexts for producer-supplied UIs.
//!
//! A [`SandboxLoader`] turns a [`UiDescriptor`] into a [`Sandbox`]: one
//! execution context created by a [`SandboxRuntime`], wired to the host only
//! through a [`SandboxBridge`]. The bridge is the UI's whole view of the
//! outside world: receive host messages, send messages (optionally waiting for
//! a reply), and observe connectivity.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use rempl_protocol::UiDescriptor;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::error::SandboxError;

#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq)]
pub struct SandboxId(pub u64);

impl fmt::Display for SandboxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sandbox-{}", self.0)
    }
}

/// Answers a host message that expects a reply. Consumed on use.
pub struct ReplyHandle(Box<dyn FnOnce(Vec<Value>) + Send>);

impl ReplyHandle {
    pub fn new(f: impl FnOnce(Vec<Value>) + Send + 'static) -> Self {
        Self(Box::new(f))
    }

    pub fn reply(self, data: Vec<Value>) {
        (self.0)(data)
    }
}

impl fmt::Debug for ReplyHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ReplyHandle")
    }
}

/// Host → UI.
#[derive(Debug)]
pub struct HostMessage {
    pub data: Vec<Value>,
    pub reply: Option<ReplyHandle>,
}

/// Reply slot of a UI message. Shared by every subscriber; the first
/// answer wins.
#[derive(Clone)]
pub struct UiReply(Arc<Mutex<Option<oneshot::Sender<Vec<Value>>>>>);

impl UiReply {
    fn new(tx: oneshot::Sender<Vec<Value>>) -> Self {
        Self(Arc::new(Mutex::new(Some(tx))))
    }

    /// Deliver the answer. Returns false if it was already answered.
    pub fn send(&self, data: Vec<Value>) -> bool {
        let tx = self.0.lock().unwrap_or_else(PoisonError::into_inner).take();
        match tx {
            Some(tx) => tx.send(data).is_ok(),
            None => false,
        }
    }
}

impl fmt::Debug for UiReply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("UiReply")
    }
}

/// UI → host.
#[derive(Debug, Clone)]
pub struct UiMessage {
    pub data: Vec<Value>,
    pub reply: Option<UiReply>,
}

type UiHandler = Box<dyn FnMut(UiMessage) + Send>;
type Handlers = Arc<Mutex<Vec<UiHandler>>>;

fn dispatch(handlers: &Handlers, msg: UiMessage) {
    let mut handlers = handlers.lock().unwrap_or_else(PoisonError::into_inner);
    for handler in handlers.iter_mut() {
        handler(msg.clone());
    }
}

/// The only capability a loaded UI gets.
pub struct SandboxBridge {
    from_host: mpsc::UnboundedReceiver<HostMessage>,
    handlers: Handlers,
    connected: watch::Receiver<bool>,
}

impl SandboxBridge {
    /// Next message from the host. `None` once the sandbox is destroyed.
    pub async fn recv(&mut self) -> Option<HostMessage> {
        self.from_host.recv().await
    }

    /// Fire-and-forget send to the host.
    pub fn send(&self, data: Vec<Value>) {
        dispatch(&self.handlers, UiMessage { data, reply: None });
    }

    /// Send to the host and wait for its answer.
    pub async fn call(&self, data: Vec<Value>) -> Result<Vec<Value>, SandboxError> {
        let (tx, rx) = oneshot::channel();
        dispatch(
            &self.handlers,
            UiMessage {
                data,
                reply: Some(UiReply::new(tx)),
            },
        );
        rx.await.map_err(|_| SandboxError::Destroyed)
    }

    pub fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    /// Watch the host's connectivity to the producer.
    pub fn connectivity(&self) -> watch::Receiver<bool> {
        self.connected.clone()
    }
}

/// A live execution context. `detach` must stop it synchronously.
pub trait ExecutionContext: Send {
    fn detach(&mut self);
}

/// Creates execution contexts.
pub trait SandboxRuntime: Send + Sync {
    fn instantiate(
        &self,
        ui: &UiDescriptor,
        bridge: SandboxBridge,
    ) -> Result<Box<dyn ExecutionContext>, SandboxError>;
}

/// Runs each UI as a tokio task; detaching aborts the task.
pub struct TaskRuntime<F> {
    start: F,
}

impl<F, Fut> TaskRuntime<F>
where
    F: Fn(UiDescriptor, SandboxBridge) -> Fut + Send + Sync,
    Fut: Future<Output = ()> + Send + 'static,
{
    pub fn new(start: F) -> Self {
        Self { start }
    }
}

struct TaskContext(JoinHandle<()>);

impl ExecutionContext for TaskContext {
    fn detach(&mut self) {
        self.0.abort();
    }
}

impl<F, Fut> SandboxRuntime for TaskRuntime<F>
where
    F: Fn(UiDescriptor, SandboxBridge) -> Fut + Send + Sync,
    Fut: Future<Output = ()> + Send + 'static,
{
    fn instantiate(
        &self,
        ui: &UiDescriptor,
        bridge: SandboxBridge,
    ) -> Result<Box<dyn ExecutionContext>, SandboxError> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| SandboxError::Instantiate(e.to_string()))?;
        let task = runtime.spawn((self.start)(ui.clone(), bridge));
        Ok(Box::new(TaskContext(task)))
    }
}

/// Loads remote UIs into fresh sandboxes.
#[derive(Clone)]
pub struct SandboxLoader {
    runtime: Arc<dyn SandboxRuntime>,
    next_id: Arc<AtomicU64>,
}

impl SandboxLoader {
    pub fn new(runtime: impl SandboxRuntime + 'static) -> Self {
        Self {
            runtime: Arc::new(runtime),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// One new execution context per call.
    pub fn load(&self, ui: &UiDescriptor) -> Result<Sandbox, SandboxError> {
        if ui.content.trim().is_empty() {
            return Err(SandboxError::EmptyContent);
        }

        let id = SandboxId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (to_ui, from_host) = mpsc::unbounded_channel();
        let (connected, connected_rx) = watch::channel(false);
        let handlers: Handlers = Arc::new(Mutex::new(Vec::new()));

        let bridge = SandboxBridge {
            from_host,
            handlers: handlers.clone(),
            connected: connected_rx,
        };
        let context = self.runtime.instantiate(ui, bridge)?;

        info!(%id, kind = ?ui.kind, "sandbox loaded");
        Ok(Sandbox {
            id,
            to_ui: Some(to_ui),
            handlers,
            connected,
            context: Some(context),
        })
    }
}

/// Host-side handle of a loaded UI.
pub struct Sandbox {
    id: SandboxId,
    to_ui: Option<mpsc::UnboundedSender<HostMessage>>,
    handlers: Handlers,
    connected: watch::Sender<bool>,
    context: Option<Box<dyn ExecutionContext>>,
}

impl Sandbox {
    pub fn id(&self) -> SandboxId {
        self.id
    }

    /// Deliver a message to the UI. No-op once destroyed.
    pub fn send(&self, data: Vec<Value>, reply: Option<ReplyHandle>) {
        if let Some(to_ui) = &self.to_ui {
            let _ = to_ui.send(HostMessage { data, reply });
        }
    }

    /// Receive everything the UI sends.
    pub fn subscribe(&self, handler: impl FnMut(UiMessage) + Send + 'static) {
        if self.is_destroyed() {
            return;
        }
        self.handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Box::new(handler));
    }

    pub fn set_connected(&self, connected: bool) {
        if !self.is_destroyed() {
            self.connected.send_replace(connected);
        }
    }

    pub fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    /// Detach the execution context and release the bridge. Idempotent.
    pub fn destroy(&mut self) {
        let Some(mut context) = self.context.take() else {
            return;
        };
        context.detach();
        self.to_ui = None;
        self.handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.connected.send_replace(false);
        debug!(id = %self.id, "sandbox destroyed");
    }

    pub fn is_destroyed(&self) -> bool {
        self.context.is_none()
    }
}

impl Drop for Sandbox {
    fn drop(&mut self) {
        self.destroy();
    }
}
