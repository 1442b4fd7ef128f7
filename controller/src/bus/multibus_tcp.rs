//! Multibus TCP interface
//!
//! One TCP stream to a CAN gateway carrying several numbered buses. Each
//! record on the stream is `[bus: u8][arbitration_id: u32 LE][len: u8][data]`;
//! bus `0xFF` is reserved for the periodic health ping and its pong, which
//! never reach the scheduler. The task reconnects on its own with bounded
//! exponential backoff and reports every transition so the scheduler can
//! fail in-flight commands and gate new submissions.

use std::time::Duration;

use fps_comms_shared::types::BusRef;
use fps_comms_shared::wire::{CanMessage, MAX_PAYLOAD};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, sleep};
use tracing::{debug, info, warn};

use super::{BusEvent, InterfaceHandle, InterfaceState, OutboundFrame, SEND_QUEUE_DEPTH};

/// Bus index reserved for health pings.
const PING_BUS: u8 = 0xFF;

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Connection settings for a multibus TCP gateway
#[derive(Debug, Clone)]
pub struct MultibusTcpConfig {
    /// Gateway hostname or address
    pub host: String,
    /// Gateway port
    pub port: u16,
    /// Number of buses carried by the gateway
    pub bus_count: usize,
    /// Health ping period
    pub ping_interval: Duration,
}

/// Spawn a multibus TCP interface task
pub fn spawn(
    index: usize,
    config: MultibusTcpConfig,
    events: mpsc::Sender<BusEvent>,
) -> InterfaceHandle {
    let (tx, rx) = mpsc::channel::<OutboundFrame>(SEND_QUEUE_DEPTH);
    let (state_tx, state_rx) = watch::channel(InterfaceState::Reconnecting);
    let name = format!("cannet-{}:{}", config.host, config.port);

    let handle = InterfaceHandle::new(index, name.clone(), config.bus_count, tx, state_rx);

    tokio::spawn(run(index, name, config, rx, state_tx, events));

    handle
}

async fn run(
    index: usize,
    name: String,
    config: MultibusTcpConfig,
    mut rx: mpsc::Receiver<OutboundFrame>,
    state_tx: watch::Sender<InterfaceState>,
    events: mpsc::Sender<BusEvent>,
) {
    let mut backoff = INITIAL_BACKOFF;
    let mut connected_before = false;

    loop {
        match TcpStream::connect((config.host.as_str(), config.port)).await {
            Ok(stream) => {
                info!(interface = index, name = %name, "connected");
                let _ = state_tx.send(InterfaceState::Connected);
                if connected_before {
                    let _ = events.send(BusEvent::Reconnected { interface: index }).await;
                }
                connected_before = true;
                backoff = INITIAL_BACKOFF;

                let (read_half, write_half) = stream.into_split();
                let reason =
                    drive_connection(index, read_half, write_half, &mut rx, &events, &config)
                        .await;

                let Some(reason) = reason else {
                    // The scheduler dropped its sender: clean shutdown.
                    let _ = state_tx.send(InterfaceState::Closed);
                    return;
                };

                warn!(interface = index, %reason, "transport lost");
                let _ = state_tx.send(InterfaceState::Reconnecting);
                let _ = events
                    .send(BusEvent::TransportError {
                        interface: index,
                        message: reason,
                    })
                    .await;
            }
            Err(error) => {
                debug!(interface = index, %error, "connect attempt failed");
            }
        }

        // Discard anything queued while the link is down; the owning
        // commands have already been failed by the transport error.
        while let Ok(frame) = rx.try_recv() {
            debug!(interface = index, bus = frame.bus, "dropping frame while disconnected");
        }

        sleep(backoff).await;
        backoff = (backoff * 2).min(MAX_BACKOFF);
    }
}

/// Drive one live connection; returns the failure reason, or `None` when
/// the scheduler has shut down.
async fn drive_connection(
    index: usize,
    read_half: OwnedReadHalf,
    mut write_half: OwnedWriteHalf,
    rx: &mut mpsc::Receiver<OutboundFrame>,
    events: &mpsc::Sender<BusEvent>,
    config: &MultibusTcpConfig,
) -> Option<String> {
    let (dead_tx, mut dead_rx) = mpsc::channel::<String>(1);
    let reader = tokio::spawn(read_loop(
        index,
        read_half,
        events.clone(),
        dead_tx,
    ));

    let mut ping = interval(config.ping_interval);
    ping.tick().await; // the first tick fires immediately

    let reason = loop {
        tokio::select! {
            outbound = rx.recv() => {
                let Some(frame) = outbound else { break None };
                if let Err(error) = write_record(&mut write_half, frame.bus as u8, &frame.message).await {
                    break Some(format!("write failed: {error}"));
                }
            }
            _ = ping.tick() => {
                let ping_frame = CanMessage { arbitration_id: 0, data: Vec::new() };
                if let Err(error) = write_record(&mut write_half, PING_BUS, &ping_frame).await {
                    break Some(format!("ping failed: {error}"));
                }
            }
            reason = dead_rx.recv() => {
                break Some(reason.unwrap_or_else(|| "reader stopped".into()));
            }
        }
    };

    reader.abort();
    reason
}

async fn read_loop(
    index: usize,
    mut read_half: OwnedReadHalf,
    events: mpsc::Sender<BusEvent>,
    dead_tx: mpsc::Sender<String>,
) {
    loop {
        match read_record(&mut read_half).await {
            Ok(Some((bus, message))) => {
                if bus == PING_BUS {
                    continue;
                }
                if events
                    .send(BusEvent::Frame {
                        message,
                        bus: BusRef::new(index, bus as usize),
                    })
                    .await
                    .is_err()
                {
                    return;
                }
            }
            Ok(None) => {
                let _ = dead_tx.send("gateway closed the connection".into()).await;
                return;
            }
            Err(error) => {
                let _ = dead_tx.send(format!("read failed: {error}")).await;
                return;
            }
        }
    }
}

async fn write_record(
    write_half: &mut OwnedWriteHalf,
    bus: u8,
    message: &CanMessage,
) -> std::io::Result<()> {
    let mut record = Vec::with_capacity(6 + message.data.len());
    record.push(bus);
    record.extend_from_slice(&message.arbitration_id.to_le_bytes());
    record.push(message.data.len() as u8);
    record.extend_from_slice(&message.data);
    write_half.write_all(&record).await?;
    write_half.flush().await
}

async fn read_record(
    read_half: &mut OwnedReadHalf,
) -> std::io::Result<Option<(u8, CanMessage)>> {
    let mut header = [0u8; 6];
    match read_half.read_exact(&mut header).await {
        Ok(_) => {}
        Err(error) if error.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(error) => return Err(error),
    }

    let bus = header[0];
    let arbitration_id = u32::from_le_bytes([header[1], header[2], header[3], header[4]]);
    let len = header[5] as usize;
    if len > MAX_PAYLOAD {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("record claims {len} payload bytes"),
        ));
    }

    let mut data = vec![0u8; len];
    read_half.read_exact(&mut data).await?;
    Ok(Some((bus, CanMessage { arbitration_id, data })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt as _;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_record_round_trip_over_localhost() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let (mut read, mut write) = socket.split();
            // Echo one record back on bus 2.
            let mut header = [0u8; 6];
            read.read_exact(&mut header).await.unwrap();
            let len = header[5] as usize;
            let mut data = vec![0u8; len];
            read.read_exact(&mut data).await.unwrap();

            let mut echo = Vec::new();
            echo.push(2u8);
            echo.extend_from_slice(&header[1..5]);
            echo.push(header[5]);
            echo.extend_from_slice(&data);
            write.write_all(&echo).await.unwrap();
        });

        let stream = TcpStream::connect(addr).await.unwrap();
        let (mut read_half, mut write_half) = stream.into_split();

        let message = CanMessage {
            arbitration_id: 0x0010_0C10,
            data: vec![1, 2, 3, 4],
        };
        write_record(&mut write_half, 0, &message).await.unwrap();

        let (bus, echoed) = read_record(&mut read_half).await.unwrap().unwrap();
        assert_eq!(bus, 2);
        assert_eq!(echoed, message);

        server.await.unwrap();
    }
}
