//! The CAN scheduler: ordering, exclusion, and fan-out
//!
//! The scheduler admits commands under three rules:
//!
//! - per `(command_id, positioner_id)` exclusion: a fair async lock per
//!   key, so colliding submissions queue FIFO and complete in order;
//! - broadcast serialization, via a per-`command_id` reader/writer gate:
//!   unicasts hold it shared, a broadcast holds it exclusively, blocking
//!   every per-positioner submission of that opcode while it runs;
//! - uid allocation: a 64-bit bitset per key, scanned round-robin from a
//!   rolling cursor, so every message of a command carries a distinct
//!   nonce and late replies can never match a fresh command.
//!
//! Fan-out sends unicasts to the positioner's discovered `(interface, bus)`
//! and broadcasts to every bus of every interface. The reply demultiplexer
//! routes frames to the owning command by `(command_id, positioner_id,
//! uid)` (broadcast replies carry uid 0 and route by opcode alone) and
//! feeds positioner state updates to the coordinator. Unknown opcodes and
//! unowned uids are logged and dropped; they never fail a command.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use fps_comms_shared::commands::{CommandId, ReplyExpectation};
use fps_comms_shared::error::{FpsError, Result};
use fps_comms_shared::identifier::Identifier;
use fps_comms_shared::types::{BusRef, FirmwareVersion, PositionerId, Uid};
use fps_comms_shared::wire::{
    decode_firmware_version, decode_position, decode_status_word, CanMessage, Reply,
};
use tokio::sync::{mpsc, oneshot, watch, Mutex as AsyncMutex, RwLock as AsyncRwLock};
use tracing::{debug, warn};

use crate::bus::{BusEvent, InterfaceHandle, OutboundFrame};
use crate::command::{
    CommandFailure, CommandHandle, CommandRequest, CommandResult, CommandState, Target,
};

type ExclusionKey = (u8, PositionerId);

/// Positioner state changes extracted from the reply stream
///
/// Applied by the coordinator's single state task, in arrival order.
#[derive(Debug, Clone)]
pub enum StateUpdate {
    /// A firmware version reply
    Firmware {
        /// Replying positioner
        id: PositionerId,
        /// Reported version
        version: FirmwareVersion,
        /// Where the reply arrived
        bus: BusRef,
    },
    /// A status word reply
    Status {
        /// Replying positioner
        id: PositionerId,
        /// Raw status word
        raw: u32,
    },
    /// A position reply
    Position {
        /// Replying positioner
        id: PositionerId,
        /// Alpha axis, motor steps
        alpha_steps: i32,
        /// Beta axis, motor steps
        beta_steps: i32,
    },
    /// An interface failed and was quarantined
    TransportError {
        /// Failing interface
        interface: usize,
    },
    /// A quarantined interface came back
    Reconnected {
        /// Recovered interface
        interface: usize,
    },
}

/// Round-robin uid bitset for one `(command_id, positioner_id)` key
#[derive(Debug, Default)]
struct UidPool {
    bits: u64,
    cursor: u8,
}

impl UidPool {
    fn allocate(&mut self) -> Option<Uid> {
        for step in 0..u16::from(Uid::MAX) {
            let offset = ((u16::from(self.cursor) + step) % u16::from(Uid::MAX)) as u8;
            let uid = offset + 1;
            let bit = 1u64 << uid;
            if self.bits & bit == 0 {
                self.bits |= bit;
                self.cursor = uid % Uid::MAX;
                return Some(Uid::new(uid));
            }
        }
        None
    }

    fn release(&mut self, uid: Uid) {
        self.bits &= !(1u64 << uid.value());
    }

    fn in_use(&self) -> u32 {
        self.bits.count_ones()
    }
}

#[derive(Debug)]
enum DriverMsg {
    Reply(Reply),
    Transport { interface: usize, message: String },
}

#[derive(Debug)]
struct PendingEntry {
    tx: mpsc::UnboundedSender<DriverMsg>,
    interface: Option<usize>,
}

#[derive(Debug, Default)]
struct PendingRegistry {
    unicast: HashMap<(u8, PositionerId, Uid), PendingEntry>,
    broadcast: HashMap<u8, PendingEntry>,
}

#[derive(Debug)]
struct Inflight {
    cancel: Arc<watch::Sender<bool>>,
    safe: bool,
}

/// The scheduler; shared by the coordinator, pollers, and engine
#[derive(Debug)]
pub struct CanScheduler {
    interfaces: Vec<InterfaceHandle>,
    locked: Arc<AtomicBool>,
    routes: Mutex<HashMap<PositionerId, BusRef>>,
    pools: Mutex<HashMap<ExclusionKey, UidPool>>,
    exclusion: Mutex<HashMap<ExclusionKey, Arc<AsyncMutex<()>>>>,
    broadcast_gates: Mutex<HashMap<u8, Arc<AsyncRwLock<()>>>>,
    registry: Mutex<PendingRegistry>,
    inflight: Mutex<HashMap<u64, Inflight>>,
    quarantined: Mutex<HashSet<usize>>,
    next_seq: AtomicU64,
    me: Weak<CanScheduler>,
}

impl CanScheduler {
    /// Build a scheduler over the given interfaces
    ///
    /// `locked` is shared with the coordinator; while it is set, only safe
    /// opcodes are admitted.
    pub fn new(interfaces: Vec<InterfaceHandle>, locked: Arc<AtomicBool>) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            interfaces,
            locked,
            routes: Mutex::new(HashMap::new()),
            pools: Mutex::new(HashMap::new()),
            exclusion: Mutex::new(HashMap::new()),
            broadcast_gates: Mutex::new(HashMap::new()),
            registry: Mutex::new(PendingRegistry::default()),
            inflight: Mutex::new(HashMap::new()),
            quarantined: Mutex::new(HashSet::new()),
            next_seq: AtomicU64::new(0),
            me: me.clone(),
        })
    }

    /// The interfaces this scheduler fans out over
    pub fn interfaces(&self) -> &[InterfaceHandle] {
        &self.interfaces
    }

    /// Record the `(interface, bus)` a positioner answers on
    pub fn set_route(&self, id: PositionerId, bus: BusRef) {
        lock(&self.routes).entry(id).or_insert(bus);
    }

    /// Discovered route of a positioner, if any
    pub fn route(&self, id: PositionerId) -> Option<BusRef> {
        lock(&self.routes).get(&id).copied()
    }

    /// Number of uids currently allocated for a key; test hook
    pub fn uids_in_use(&self, command: CommandId, positioner: PositionerId) -> u32 {
        lock(&self.pools)
            .get(&(command.as_u8(), positioner))
            .map_or(0, UidPool::in_use)
    }

    /// Cancel every non-safe command currently in flight
    pub fn cancel_all_unsafe(&self) {
        for inflight in lock(&self.inflight).values() {
            if !inflight.safe {
                let _ = inflight.cancel.send(true);
            }
        }
    }

    /// Submit a command; returns a handle once it is queued
    ///
    /// Refuses synchronously, before any frame is written, when the fleet
    /// is locked and the opcode is not safe, when a broadcast is requested
    /// for a unicast-only opcode, or when the positioner has no discovered
    /// route.
    pub fn submit(&self, request: CommandRequest) -> Result<CommandHandle> {
        let spec = request.command.spec();

        if self.locked.load(Ordering::SeqCst) && !spec.safe {
            return Err(FpsError::Locked);
        }
        if matches!(request.target, Target::Broadcast) && !spec.broadcast {
            return Err(FpsError::NotBroadcastable {
                command: spec.name,
            });
        }

        let route = match request.target {
            Target::Unicast(id) => Some(
                self.route(id)
                    .ok_or(FpsError::UnknownPositioner(id))?,
            ),
            Target::Broadcast => None,
        };

        let Some(scheduler) = self.me.upgrade() else {
            return Err(FpsError::Transport {
                interface: 0,
                message: "scheduler is shutting down".into(),
            });
        };

        let (state_tx, state_rx) = watch::channel(CommandState::Ready);
        let (result_tx, result_rx) = oneshot::channel();
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let cancel_tx = Arc::new(cancel_tx);

        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        lock(&self.inflight).insert(
            seq,
            Inflight {
                cancel: Arc::clone(&cancel_tx),
                safe: spec.safe,
            },
        );

        let handle = CommandHandle {
            command: request.command,
            state: state_rx,
            result: result_rx,
            cancel: cancel_tx,
        };

        tokio::spawn(async move {
            let result = scheduler
                .run_command(request, route, &state_tx, cancel_rx)
                .await;
            lock(&scheduler.inflight).remove(&seq);
            let _ = result_tx.send(result);
        });

        Ok(handle)
    }

    /// Convenience: submit and wait
    pub async fn execute(&self, request: CommandRequest) -> Result<CommandResult> {
        self.submit(request)?.wait().await
    }

    fn broadcast_gate(&self, command: u8) -> Arc<AsyncRwLock<()>> {
        Arc::clone(
            lock(&self.broadcast_gates)
                .entry(command)
                .or_insert_with(|| Arc::new(AsyncRwLock::new(()))),
        )
    }

    fn exclusion_lock(&self, key: ExclusionKey) -> Arc<AsyncMutex<()>> {
        Arc::clone(
            lock(&self.exclusion)
                .entry(key)
                .or_insert_with(|| Arc::new(AsyncMutex::new(()))),
        )
    }

    async fn run_command(
        &self,
        request: CommandRequest,
        route: Option<BusRef>,
        state_tx: &watch::Sender<CommandState>,
        mut cancel_rx: watch::Receiver<bool>,
    ) -> CommandResult {
        let command = request.command;
        let spec = command.spec();
        let opcode = command.as_u8();
        let timeout = request.effective_timeout();
        let ignore_unknown = request.effective_ignore_unknown();

        let mut result = CommandResult {
            command,
            target: request.target,
            state: CommandState::Running,
            replies: Vec::new(),
            failure: None,
            timeout,
        };

        // Admission: broadcast gate, then the per-key lock for unicasts.
        // Guards are held for the whole command.
        let gate = self.broadcast_gate(opcode);
        let mut _write_guard = None;
        let mut _read_guard = None;
        let mut _key_guard = None;

        match request.target {
            Target::Broadcast => {
                tokio::select! {
                    guard = gate.write_owned() => _write_guard = Some(guard),
                    _ = cancelled(&mut cancel_rx) => {
                        return self.finish(result, CommandState::Cancelled, state_tx);
                    }
                }
            }
            Target::Unicast(id) => {
                tokio::select! {
                    guard = gate.read_owned() => _read_guard = Some(guard),
                    _ = cancelled(&mut cancel_rx) => {
                        return self.finish(result, CommandState::Cancelled, state_tx);
                    }
                }
                let key_lock = self.exclusion_lock((opcode, id));
                tokio::select! {
                    guard = key_lock.lock_owned() => _key_guard = Some(guard),
                    _ = cancelled(&mut cancel_rx) => {
                        return self.finish(result, CommandState::Cancelled, state_tx);
                    }
                }
            }
        }

        let _ = state_tx.send(CommandState::Running);

        // Uid allocation: one per outbound message, broadcast always 0.
        let message_count = request.message_count();
        let uids: Vec<Uid> = match request.target {
            Target::Broadcast => vec![Uid::BROADCAST; message_count],
            Target::Unicast(id) => {
                let mut pools = lock(&self.pools);
                let pool = pools.entry((opcode, id)).or_default();
                let mut allocated = Vec::with_capacity(message_count);
                for _ in 0..message_count {
                    match pool.allocate() {
                        Some(uid) => allocated.push(uid),
                        None => {
                            for uid in allocated {
                                pool.release(uid);
                            }
                            drop(pools);
                            warn!(command = spec.name, positioner = %id, "uid pool exhausted");
                            result.failure = Some(CommandFailure::UidExhausted);
                            return self.finish(result, CommandState::Failed, state_tx);
                        }
                    }
                }
                allocated
            }
        };

        // Reply routing registration.
        let (reply_tx, mut reply_rx) = mpsc::unbounded_channel();
        {
            let mut registry = lock(&self.registry);
            match request.target {
                Target::Broadcast => {
                    registry.broadcast.insert(
                        opcode,
                        PendingEntry {
                            tx: reply_tx.clone(),
                            interface: None,
                        },
                    );
                }
                Target::Unicast(id) => {
                    for uid in &uids {
                        registry.unicast.insert(
                            (opcode, id, *uid),
                            PendingEntry {
                                tx: reply_tx.clone(),
                                interface: route.map(|r| r.interface),
                            },
                        );
                    }
                }
            }
        }

        // Send every message, in order, without ever blocking reception.
        let target_id = request.target.positioner_id();
        let payloads: Vec<Vec<u8>> = if request.payloads.is_empty() {
            vec![Vec::new()]
        } else {
            request.payloads.clone()
        };

        for (payload, uid) in payloads.into_iter().zip(uids.iter()) {
            let message = CanMessage {
                arbitration_id: Identifier::command(target_id, opcode, *uid).encode(),
                data: payload,
            };
            if let Err(failure) = self.fan_out(request.target, route, message).await {
                self.unregister(&request, route, &uids);
                result.failure = Some(failure);
                return self.finish(result, CommandState::Failed, state_tx);
            }
        }

        // Fire-and-forget: done as soon as the frames are queued.
        if timeout.is_zero() {
            self.unregister(&request, route, &uids);
            return self.finish(result, CommandState::Done, state_tx);
        }

        let needed = message_count;
        let mut accepted = 0usize;
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        let terminal = loop {
            tokio::select! {
                message = reply_rx.recv() => match message {
                    Some(DriverMsg::Reply(reply)) => {
                        let code = reply.response_code;
                        let positioner = reply.positioner_id;
                        result.replies.push(reply);

                        let counts = code.is_accepted()
                            || (code.is_unknown_command() && ignore_unknown);
                        if !counts {
                            result.failure = Some(CommandFailure::Rejected { positioner, code });
                            break CommandState::Failed;
                        }
                        accepted += 1;

                        let complete_on_count = matches!(request.target, Target::Unicast(_))
                            && matches!(spec.replies, ReplyExpectation::AckPerMessage);
                        if complete_on_count && accepted >= needed {
                            break CommandState::Done;
                        }
                    }
                    Some(DriverMsg::Transport { interface, message }) => {
                        result.failure =
                            Some(CommandFailure::Transport { interface, message });
                        break CommandState::Failed;
                    }
                    None => {
                        result.failure = Some(CommandFailure::Transport {
                            interface: route.map_or(0, |r| r.interface),
                            message: "reply channel closed".into(),
                        });
                        break CommandState::Failed;
                    }
                },
                _ = &mut deadline => {
                    // Broadcasts (and until-timeout opcodes) complete with
                    // whatever arrived; a unicast needs every ack.
                    let counted = matches!(request.target, Target::Broadcast)
                        || matches!(spec.replies, ReplyExpectation::UntilTimeout);
                    if counted && accepted >= 1 {
                        break CommandState::Done;
                    }
                    break CommandState::TimedOut;
                }
                _ = cancelled(&mut cancel_rx) => {
                    break CommandState::Cancelled;
                }
            }
        };

        self.unregister(&request, route, &uids);
        self.finish(result, terminal, state_tx)
    }

    async fn fan_out(
        &self,
        target: Target,
        route: Option<BusRef>,
        message: CanMessage,
    ) -> std::result::Result<(), CommandFailure> {
        match target {
            Target::Unicast(_) => {
                let Some(route) = route else {
                    return Err(CommandFailure::Transport {
                        interface: 0,
                        message: "no route for unicast".into(),
                    });
                };
                if lock(&self.quarantined).contains(&route.interface) {
                    return Err(CommandFailure::Transport {
                        interface: route.interface,
                        message: "interface is retry-connecting".into(),
                    });
                }
                self.interfaces[route.interface]
                    .send(OutboundFrame {
                        bus: route.bus,
                        message,
                    })
                    .await
                    .map_err(|error| CommandFailure::Transport {
                        interface: route.interface,
                        message: error.to_string(),
                    })
            }
            Target::Broadcast => {
                // Best effort across the fabric; a quarantined interface is
                // skipped rather than failing the whole broadcast.
                for interface in &self.interfaces {
                    if lock(&self.quarantined).contains(&interface.index) {
                        continue;
                    }
                    for bus in 0..interface.bus_count {
                        if let Err(error) = interface
                            .send(OutboundFrame {
                                bus,
                                message: message.clone(),
                            })
                            .await
                        {
                            debug!(interface = interface.index, bus, %error,
                                   "broadcast leg dropped");
                        }
                    }
                }
                Ok(())
            }
        }
    }

    fn unregister(&self, request: &CommandRequest, _route: Option<BusRef>, uids: &[Uid]) {
        let opcode = request.command.as_u8();
        let mut registry = lock(&self.registry);
        match request.target {
            Target::Broadcast => {
                registry.broadcast.remove(&opcode);
            }
            Target::Unicast(id) => {
                for uid in uids {
                    registry.unicast.remove(&(opcode, id, *uid));
                }
                let mut pools = lock(&self.pools);
                if let Some(pool) = pools.get_mut(&(opcode, id)) {
                    for uid in uids {
                        pool.release(*uid);
                    }
                }
            }
        }
    }

    fn finish(
        &self,
        mut result: CommandResult,
        terminal: CommandState,
        state_tx: &watch::Sender<CommandState>,
    ) -> CommandResult {
        result.state = terminal;
        let _ = state_tx.send(terminal);

        // A cancelled motion command is chased by its abort form on the
        // same positioner set.
        if terminal == CommandState::Cancelled {
            if let Some(abort) = result.command.spec().abort_form {
                let abort_request = match result.target {
                    Target::Unicast(id) => CommandRequest::unicast(abort, id),
                    Target::Broadcast => CommandRequest::broadcast(abort),
                }
                .fire_and_forget();
                if let Err(error) = self.submit(abort_request) {
                    debug!(%error, "abort chase not submitted");
                }
            }
        }

        result
    }

    /// Spawn the reply demultiplexer
    ///
    /// Consumes the shared [`BusEvent`] stream, routes replies to owning
    /// commands, extracts positioner state updates, learns routes from
    /// first replies, and quarantines failing interfaces.
    pub fn spawn_demux(
        &self,
        mut events: mpsc::Receiver<BusEvent>,
        state_tx: mpsc::UnboundedSender<StateUpdate>,
    ) {
        let Some(scheduler) = self.me.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    BusEvent::Frame { message, bus } => {
                        scheduler.dispatch_frame(message, bus, &state_tx);
                    }
                    BusEvent::TransportError { interface, message } => {
                        warn!(interface, %message, "interface quarantined");
                        lock(&scheduler.quarantined).insert(interface);

                        let mut registry = lock(&scheduler.registry);
                        registry.unicast.retain(|_, entry| {
                            if entry.interface == Some(interface) {
                                let _ = entry.tx.send(DriverMsg::Transport {
                                    interface,
                                    message: message.clone(),
                                });
                                false
                            } else {
                                true
                            }
                        });
                        drop(registry);

                        let _ = state_tx.send(StateUpdate::TransportError { interface });
                    }
                    BusEvent::Reconnected { interface } => {
                        lock(&scheduler.quarantined).remove(&interface);
                        let _ = state_tx.send(StateUpdate::Reconnected { interface });
                    }
                }
            }
            debug!("bus event stream ended; demultiplexer stopping");
        });
    }

    fn dispatch_frame(
        &self,
        message: CanMessage,
        bus: BusRef,
        state_tx: &mpsc::UnboundedSender<StateUpdate>,
    ) {
        let reply = Reply::from_frame(message.arbitration_id, message.data, bus);

        let Some(command) = CommandId::from_u8(reply.command_id) else {
            debug!(opcode = reply.command_id, positioner = %reply.positioner_id,
                   "reply with unknown opcode dropped");
            return;
        };

        // First reply wins the route.
        self.set_route(reply.positioner_id, bus);

        if reply.is_accepted() {
            let update = match command {
                CommandId::GetFirmwareVersion => decode_firmware_version(&reply.data)
                    .ok()
                    .map(|version| StateUpdate::Firmware {
                        id: reply.positioner_id,
                        version,
                        bus,
                    }),
                CommandId::GetStatus => {
                    decode_status_word(&reply.data)
                        .ok()
                        .map(|raw| StateUpdate::Status {
                            id: reply.positioner_id,
                            raw,
                        })
                }
                CommandId::GetActualPosition => {
                    decode_position(&reply.data)
                        .ok()
                        .map(|(alpha_steps, beta_steps)| StateUpdate::Position {
                            id: reply.positioner_id,
                            alpha_steps,
                            beta_steps,
                        })
                }
                _ => None,
            };
            if let Some(update) = update {
                let _ = state_tx.send(update);
            }
        }

        let registry = lock(&self.registry);
        let entry = if reply.uid == Uid::BROADCAST {
            registry.broadcast.get(&reply.command_id)
        } else {
            registry
                .unicast
                .get(&(reply.command_id, reply.positioner_id, reply.uid))
        };

        match entry {
            Some(entry) => {
                let _ = entry.tx.send(DriverMsg::Reply(reply));
            }
            None => {
                debug!(command = command.name(), positioner = %reply.positioner_id,
                       uid = reply.uid.value(), "reply with unowned uid dropped");
            }
        }
    }
}

async fn cancelled(cancel_rx: &mut watch::Receiver<bool>) {
    loop {
        if *cancel_rx.borrow() {
            return;
        }
        if cancel_rx.changed().await.is_err() {
            // Handle dropped without cancelling; park forever.
            std::future::pending::<()>().await;
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_uid_pool_round_robin() {
        let mut pool = UidPool::default();
        let first = pool.allocate().unwrap();
        let second = pool.allocate().unwrap();
        assert_ne!(first, second);
        assert_eq!(pool.in_use(), 2);

        pool.release(first);
        // The cursor has moved on; the freed uid is not immediately reused.
        let third = pool.allocate().unwrap();
        assert_ne!(third, second);
        assert_eq!(pool.in_use(), 2);
    }

    #[test]
    fn test_uid_pool_never_issues_zero_or_duplicates() {
        let mut pool = UidPool::default();
        let mut seen = std::collections::HashSet::new();
        for _ in 0..u16::from(Uid::MAX) {
            let uid = pool.allocate().unwrap();
            assert_ne!(uid, Uid::BROADCAST);
            assert!(seen.insert(uid));
        }
        assert!(pool.allocate().is_none());
    }

    proptest! {
        /// Across arbitrary allocate/release interleavings, the number of
        /// uids in use equals the number of outstanding allocations.
        #[test]
        fn prop_uid_pool_closure(ops in proptest::collection::vec(any::<bool>(), 1..200)) {
            let mut pool = UidPool::default();
            let mut outstanding: Vec<Uid> = Vec::new();
            for allocate in ops {
                if allocate {
                    if let Some(uid) = pool.allocate() {
                        outstanding.push(uid);
                    } else {
                        prop_assert_eq!(outstanding.len(), usize::from(Uid::MAX));
                    }
                } else if let Some(uid) = outstanding.pop() {
                    pool.release(uid);
                }
                prop_assert_eq!(pool.in_use() as usize, outstanding.len());
            }
        }
    }
}
