//! SocketCAN interface (Linux)
//!
//! Pass-through over one kernel CAN device. A single bus per interface;
//! the kernel owns framing, so this adapter only converts between
//! [`CanMessage`] and `socketcan` frames.

use std::time::Duration;

use fps_comms_shared::types::BusRef;
use fps_comms_shared::wire::CanMessage;
use socketcan::tokio::CanSocket;
use socketcan::{CanFrame, EmbeddedFrame, ExtendedId, Id};
use tokio::sync::{mpsc, watch};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use super::{BusEvent, InterfaceHandle, InterfaceState, OutboundFrame, SEND_QUEUE_DEPTH};

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Spawn a SocketCAN interface on a kernel device such as `can0`
pub fn spawn(index: usize, device: String, events: mpsc::Sender<BusEvent>) -> InterfaceHandle {
    let (tx, rx) = mpsc::channel::<OutboundFrame>(SEND_QUEUE_DEPTH);
    let (state_tx, state_rx) = watch::channel(InterfaceState::Reconnecting);
    let name = format!("socketcan-{device}");

    let handle = InterfaceHandle::new(index, name.clone(), 1, tx, state_rx);
    tokio::spawn(run(index, name, device, rx, state_tx, events));
    handle
}

async fn run(
    index: usize,
    name: String,
    device: String,
    mut rx: mpsc::Receiver<OutboundFrame>,
    state_tx: watch::Sender<InterfaceState>,
    events: mpsc::Sender<BusEvent>,
) {
    let mut backoff = INITIAL_BACKOFF;
    let mut connected_before = false;

    loop {
        match CanSocket::open(&device) {
            Ok(socket) => {
                info!(interface = index, name = %name, "socketcan open");
                let _ = state_tx.send(InterfaceState::Connected);
                if connected_before {
                    let _ = events.send(BusEvent::Reconnected { interface: index }).await;
                }
                connected_before = true;
                backoff = INITIAL_BACKOFF;

                let reason = drive_socket(index, socket, &mut rx, &events).await;
                let Some(reason) = reason else {
                    let _ = state_tx.send(InterfaceState::Closed);
                    return;
                };

                warn!(interface = index, %reason, "socketcan transport lost");
                let _ = state_tx.send(InterfaceState::Reconnecting);
                let _ = events
                    .send(BusEvent::TransportError {
                        interface: index,
                        message: reason,
                    })
                    .await;
            }
            Err(error) => {
                debug!(interface = index, %error, "socketcan open failed");
            }
        }

        while let Ok(frame) = rx.try_recv() {
            debug!(interface = index, bus = frame.bus, "dropping frame while disconnected");
        }

        sleep(backoff).await;
        backoff = (backoff * 2).min(MAX_BACKOFF);
    }
}

async fn drive_socket(
    index: usize,
    socket: CanSocket,
    rx: &mut mpsc::Receiver<OutboundFrame>,
    events: &mpsc::Sender<BusEvent>,
) -> Option<String> {
    loop {
        tokio::select! {
            outbound = rx.recv() => {
                let Some(frame) = outbound else { return None };
                let Some(can_frame) = to_can_frame(&frame.message) else {
                    warn!(interface = index, "unencodable frame dropped");
                    continue;
                };
                if let Err(error) = socket.write_frame(can_frame).await {
                    return Some(format!("write failed: {error}"));
                }
            }
            read = socket.read_frame() => {
                match read {
                    Ok(frame) => {
                        if let Some(message) = from_can_frame(&frame) {
                            let _ = events
                                .send(BusEvent::Frame {
                                    message,
                                    bus: BusRef::new(index, 0),
                                })
                                .await;
                        }
                    }
                    Err(error) => return Some(format!("read failed: {error}")),
                }
            }
        }
    }
}

fn to_can_frame(message: &CanMessage) -> Option<CanFrame> {
    let id = ExtendedId::new(message.arbitration_id)?;
    CanFrame::new(Id::Extended(id), &message.data)
}

fn from_can_frame(frame: &CanFrame) -> Option<CanMessage> {
    match frame.id() {
        Id::Extended(id) => Some(CanMessage {
            arbitration_id: id.as_raw(),
            data: frame.data().to_vec(),
        }),
        // 11-bit traffic is not part of the positioner protocol.
        Id::Standard(_) => None,
    }
}
