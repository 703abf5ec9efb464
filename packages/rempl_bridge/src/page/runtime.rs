use rempl_protocol::WindowMessage;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::bus::PageBus;
use super::multiplexer::{PageMultiplexer, PageOutput};
use crate::config::PageConfig;
use crate::relay::Port;

/// A running page multiplexer. Dropping the handle stops it, which also
/// disconnects its hub port.
pub struct PageHandle {
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl PageHandle {
    /// Stop the multiplexer and wait for it to finish.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for PageHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Run a multiplexer between `bus` and the hub behind `port`.
pub fn spawn_page(port: Port, bus: PageBus, config: PageConfig) -> PageHandle {
    let cancel = CancellationToken::new();
    // Subscribe before the handshake goes out so no reply is missed.
    let window_rx = bus.subscribe();
    let task = tokio::spawn(run(
        PageMultiplexer::new(config),
        port,
        bus,
        window_rx,
        cancel.clone(),
    ));
    PageHandle {
        cancel,
        task: Some(task),
    }
}

async fn run(
    mut mux: PageMultiplexer,
    mut port: Port,
    bus: PageBus,
    mut window_rx: broadcast::Receiver<WindowMessage>,
    cancel: CancellationToken,
) {
    mux.start();
    flush(&mut mux, &port, &bus);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            packet = port.recv() => match packet {
                Some(packet) => mux.handle_packet(packet),
                None => {
                    debug!("Hub gone, stopping page multiplexer");
                    break;
                }
            },
            msg = window_rx.recv() => match msg {
                Ok(msg) => {
                    if msg.from != *mux.input_channel() {
                        mux.handle_window_message(msg);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Page bus lagged by {} messages", n);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
        flush(&mut mux, &port, &bus);
    }

    info!(session = mux.session_id(), "page multiplexer stopped");
}

/// End of turn: run queued microtasks, then deliver every effect.
fn flush(mux: &mut PageMultiplexer, port: &Port, bus: &PageBus) {
    mux.run_microtasks();
    for output in mux.take_output() {
        match output {
            PageOutput::ToHub(packet) => {
                if let Err(e) = port.post(packet) {
                    debug!("Dropping packet for hub: {}", e);
                }
            }
            PageOutput::ToPage(msg) => {
                bus.post(msg);
            }
        }
    }
}
