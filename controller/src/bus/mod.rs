//! Bus interface layer
//!
//! Every transport variant (the multibus TCP device, SLCAN serial adapters,
//! SocketCAN, and the in-process virtual bus) is run as a task behind an
//! [`InterfaceHandle`]: a bounded send queue (backpressure) and a shared
//! stream of [`BusEvent`]s carrying received frames tagged with their
//! `(interface, bus)` origin. The scheduler sees every variant identically.
//!
//! Writes and reads live in separate halves of each interface task, so a
//! slow or wedged write path never stalls reply reception.

use fps_comms_shared::error::{FpsError, Result};
use fps_comms_shared::types::BusRef;
use fps_comms_shared::wire::CanMessage;
use tokio::sync::{mpsc, watch};

pub mod virtual_bus;

pub mod multibus_tcp;

#[cfg(feature = "slcan")]
pub mod slcan;

#[cfg(feature = "socketcan")]
pub mod socketcan_bus;

/// Depth of each interface's bounded send queue.
///
/// Once full, submissions wait; this is the backpressure point between the
/// scheduler and a busy transport.
pub const SEND_QUEUE_DEPTH: usize = 64;

/// An outbound frame with its target bus on the owning interface
#[derive(Debug, Clone)]
pub struct OutboundFrame {
    /// Bus index within the interface
    pub bus: usize,
    /// The frame to write
    pub message: CanMessage,
}

/// Events flowing from every interface into the scheduler's demultiplexer
#[derive(Debug)]
pub enum BusEvent {
    /// A frame arrived
    Frame {
        /// The received frame
        message: CanMessage,
        /// Where it came from
        bus: BusRef,
    },
    /// The transport failed; in-flight commands on it must fail
    TransportError {
        /// Interface that failed
        interface: usize,
        /// Describes the failure
        message: String,
    },
    /// The transport came back after a reconnect
    Reconnected {
        /// Interface that recovered
        interface: usize,
    },
}

/// Connection state of an interface
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterfaceState {
    /// Healthy and exchanging frames
    Connected,
    /// Lost; a background task is retrying with backoff
    Reconnecting,
    /// Shut down for good
    Closed,
}

/// The scheduler-facing side of one bus interface
#[derive(Debug, Clone)]
pub struct InterfaceHandle {
    /// Index of this interface within the controller
    pub index: usize,
    /// Human-readable name for logs
    pub name: String,
    /// Number of sub-buses this interface carries
    pub bus_count: usize,
    sender: mpsc::Sender<OutboundFrame>,
    state: watch::Receiver<InterfaceState>,
}

impl InterfaceHandle {
    /// Assemble a handle; used by the transport implementations
    pub(crate) fn new(
        index: usize,
        name: String,
        bus_count: usize,
        sender: mpsc::Sender<OutboundFrame>,
        state: watch::Receiver<InterfaceState>,
    ) -> Self {
        Self {
            index,
            name,
            bus_count,
            sender,
            state,
        }
    }

    /// Queue a frame for writing, waiting when the send queue is full
    pub async fn send(&self, frame: OutboundFrame) -> Result<()> {
        self.sender
            .send(frame)
            .await
            .map_err(|_| FpsError::Transport {
                interface: self.index,
                message: format!("interface {} task terminated", self.name),
            })
    }

    /// Current connection state
    pub fn state(&self) -> InterfaceState {
        *self.state.borrow()
    }
}
