//! In-process virtual bus backed by the simulated fleet
//!
//! Deterministic loopback used by tests and the `virtual` CAN profile.
//! Frames written to the handle are answered synchronously by a
//! [`SimFleet`]; a control handle can sever and restore the "link" to
//! exercise the transport failure paths.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use fps_comms_simulation::SimFleet;
use fps_comms_shared::types::BusRef;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, Instant};
use tracing::debug;

use super::{BusEvent, InterfaceHandle, InterfaceState, OutboundFrame, SEND_QUEUE_DEPTH};

/// How often the fleet clock advances when no frames arrive.
const ADVANCE_INTERVAL: Duration = Duration::from_millis(5);

/// Test-side control over the virtual link
#[derive(Debug, Clone)]
pub struct VirtualBusControl {
    connected: watch::Sender<bool>,
}

impl VirtualBusControl {
    /// Sever the link: sends start failing and replies stop arriving
    pub fn disconnect(&self) {
        let _ = self.connected.send(false);
    }

    /// Restore the link
    pub fn reconnect(&self) {
        let _ = self.connected.send(true);
    }
}

/// Spawn a virtual interface carrying `bus_count` buses over `fleet`
pub fn spawn(
    index: usize,
    bus_count: usize,
    fleet: Arc<Mutex<SimFleet>>,
    events: mpsc::Sender<BusEvent>,
) -> (InterfaceHandle, VirtualBusControl) {
    let (tx, mut rx) = mpsc::channel::<OutboundFrame>(SEND_QUEUE_DEPTH);
    let (state_tx, state_rx) = watch::channel(InterfaceState::Connected);
    let (connected_tx, mut connected_rx) = watch::channel(true);

    let control = VirtualBusControl {
        connected: connected_tx,
    };

    tokio::spawn(async move {
        let epoch = Instant::now();
        let mut ticker = interval(ADVANCE_INTERVAL);
        let mut link_up = *connected_rx.borrow();

        loop {
            tokio::select! {
                outbound = rx.recv() => {
                    let Some(frame) = outbound else { break };
                    let now = epoch.elapsed().as_secs_f64();

                    if !link_up {
                        let _ = events
                            .send(BusEvent::TransportError {
                                interface: index,
                                message: "virtual link is down".into(),
                            })
                            .await;
                        continue;
                    }

                    let replies = {
                        let mut fleet = match fleet.lock() {
                            Ok(fleet) => fleet,
                            Err(poisoned) => poisoned.into_inner(),
                        };
                        fleet.handle_frame(now, &frame.message)
                    };
                    for reply in replies {
                        let _ = events
                            .send(BusEvent::Frame {
                                message: reply,
                                bus: BusRef::new(index, frame.bus),
                            })
                            .await;
                    }
                }
                _ = ticker.tick() => {
                    let now = epoch.elapsed().as_secs_f64();
                    let mut fleet = match fleet.lock() {
                        Ok(fleet) => fleet,
                        Err(poisoned) => poisoned.into_inner(),
                    };
                    fleet.advance(now);
                }
                changed = connected_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let up = *connected_rx.borrow();
                    link_up = up;
                    debug!(interface = index, up, "virtual link state change");
                    if up {
                        let _ = state_tx.send(InterfaceState::Connected);
                        let _ = events.send(BusEvent::Reconnected { interface: index }).await;
                    } else {
                        let _ = state_tx.send(InterfaceState::Reconnecting);
                        let _ = events
                            .send(BusEvent::TransportError {
                                interface: index,
                                message: "virtual link dropped".into(),
                            })
                            .await;
                    }
                }
            }
        }
        let _ = state_tx.send(InterfaceState::Closed);
    });

    (
        InterfaceHandle::new(index, format!("virtual-{index}"), bus_count, tx, state_rx),
        control,
    )
}
