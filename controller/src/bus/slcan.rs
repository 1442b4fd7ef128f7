//! SLCAN (serial line CAN) interface
//!
//! ASCII-framed CAN over a serial adapter. Extended frames are
//! `T<id:8 hex><dlc:1 hex><data hex>\r`; everything this controller sends
//! uses the 29-bit identifier space, so only `T` records are produced and
//! consumed. The adapter carries a single bus.

use std::time::Duration;

use fps_comms_shared::types::BusRef;
use fps_comms_shared::wire::{CanMessage, MAX_PAYLOAD};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use tokio::time::sleep;
use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tracing::{debug, info, warn};

use super::{BusEvent, InterfaceHandle, InterfaceState, OutboundFrame, SEND_QUEUE_DEPTH};

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Serial adapter settings
#[derive(Debug, Clone)]
pub struct SlcanConfig {
    /// Serial device path, e.g. `/dev/ttyUSB0`
    pub device: String,
    /// Line rate in baud
    pub baud_rate: u32,
}

/// Spawn an SLCAN interface task
pub fn spawn(index: usize, config: SlcanConfig, events: mpsc::Sender<BusEvent>) -> InterfaceHandle {
    let (tx, rx) = mpsc::channel::<OutboundFrame>(SEND_QUEUE_DEPTH);
    let (state_tx, state_rx) = watch::channel(InterfaceState::Reconnecting);
    let name = format!("slcan-{}", config.device);

    let handle = InterfaceHandle::new(index, name.clone(), 1, tx, state_rx);
    tokio::spawn(run(index, name, config, rx, state_tx, events));
    handle
}

async fn run(
    index: usize,
    name: String,
    config: SlcanConfig,
    mut rx: mpsc::Receiver<OutboundFrame>,
    state_tx: watch::Sender<InterfaceState>,
    events: mpsc::Sender<BusEvent>,
) {
    let mut backoff = INITIAL_BACKOFF;
    let mut connected_before = false;

    loop {
        match tokio_serial::new(&config.device, config.baud_rate).open_native_async() {
            Ok(port) => {
                info!(interface = index, name = %name, "serial port open");
                let _ = state_tx.send(InterfaceState::Connected);
                if connected_before {
                    let _ = events.send(BusEvent::Reconnected { interface: index }).await;
                }
                connected_before = true;
                backoff = INITIAL_BACKOFF;

                let reason = drive_port(index, port, &mut rx, &events).await;
                let Some(reason) = reason else {
                    let _ = state_tx.send(InterfaceState::Closed);
                    return;
                };

                warn!(interface = index, %reason, "serial transport lost");
                let _ = state_tx.send(InterfaceState::Reconnecting);
                let _ = events
                    .send(BusEvent::TransportError {
                        interface: index,
                        message: reason,
                    })
                    .await;
            }
            Err(error) => {
                debug!(interface = index, %error, "serial open failed");
            }
        }

        while let Ok(frame) = rx.try_recv() {
            debug!(interface = index, bus = frame.bus, "dropping frame while disconnected");
        }

        sleep(backoff).await;
        backoff = (backoff * 2).min(MAX_BACKOFF);
    }
}

async fn drive_port(
    index: usize,
    port: SerialStream,
    rx: &mut mpsc::Receiver<OutboundFrame>,
    events: &mpsc::Sender<BusEvent>,
) -> Option<String> {
    let (mut read_half, mut write_half) = tokio::io::split(port);
    let mut line = String::new();
    let mut byte = [0u8; 1];

    loop {
        tokio::select! {
            outbound = rx.recv() => {
                let Some(frame) = outbound else { return None };
                let encoded = encode_frame(&frame.message);
                if let Err(error) = write_half.write_all(encoded.as_bytes()).await {
                    return Some(format!("write failed: {error}"));
                }
            }
            read = read_half.read(&mut byte) => {
                match read {
                    Ok(0) => return Some("serial port closed".into()),
                    Ok(_) => {
                        if byte[0] == b'\r' {
                            if let Some(message) = parse_line(&line) {
                                let _ = events
                                    .send(BusEvent::Frame {
                                        message,
                                        bus: BusRef::new(index, 0),
                                    })
                                    .await;
                            }
                            line.clear();
                        } else {
                            line.push(byte[0] as char);
                        }
                    }
                    Err(error) => return Some(format!("read failed: {error}")),
                }
            }
        }
    }
}

/// Encode one frame as an extended SLCAN record
fn encode_frame(message: &CanMessage) -> String {
    let mut out = format!("T{:08X}{:1X}", message.arbitration_id, message.data.len());
    for byte in &message.data {
        out.push_str(&format!("{byte:02X}"));
    }
    out.push('\r');
    out
}

/// Parse one extended SLCAN record, without its trailing `\r`
///
/// Anything that is not a well-formed `T` record is dropped; SLCAN adapters
/// interleave status lines on the same channel.
fn parse_line(line: &str) -> Option<CanMessage> {
    let rest = line.strip_prefix('T')?;
    if rest.len() < 9 {
        return None;
    }
    let arbitration_id = u32::from_str_radix(&rest[..8], 16).ok()?;
    let dlc = usize::from_str_radix(&rest[8..9], 16).ok()?;
    if dlc > MAX_PAYLOAD || rest.len() != 9 + dlc * 2 {
        return None;
    }

    let mut data = Vec::with_capacity(dlc);
    for chunk in 0..dlc {
        let offset = 9 + chunk * 2;
        data.push(u8::from_str_radix(&rest[offset..offset + 2], 16).ok()?);
    }
    Some(CanMessage {
        arbitration_id,
        data,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_round_trip() {
        let message = CanMessage {
            arbitration_id: 0x0010_0C10,
            data: vec![0xDE, 0xAD, 0xBE, 0xEF],
        };
        let encoded = encode_frame(&message);
        assert_eq!(encoded, "T00100C104DEADBEEF\r");
        assert_eq!(parse_line(encoded.trim_end()), Some(message));
    }

    #[test]
    fn test_garbage_lines_are_dropped() {
        assert_eq!(parse_line(""), None);
        assert_eq!(parse_line("t1230"), None); // standard frames unsupported
        assert_eq!(parse_line("T0010"), None); // truncated
        assert_eq!(parse_line("T00100C109AA"), None); // dlc exceeds CAN limit
    }
}
