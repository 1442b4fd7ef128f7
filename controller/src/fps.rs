//! The FPS coordinator
//!
//! [`Fps`] owns the scheduler, the interfaces, and the positioner table. It
//! runs discovery, keeps the two pollers alive, enforces the fleet safety
//! invariants (collision locking, disabled-positioner policy), and exposes
//! the operation surface: `send_command`, `goto`, `send_trajectory`,
//! `abort`, `lock`/`unlock`.
//!
//! All positioner mutation funnels through a single state task fed by the
//! reply demultiplexer, so updates apply in arrival order and observers
//! only ever see snapshots.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock};

use chrono::{DateTime, Utc};
use fps_comms_shared::commands::CommandId;
use fps_comms_shared::error::{FpsError, Result};
use fps_comms_shared::trajectory::Trajectory;
use fps_comms_shared::types::{BusRef, PositionerId};
use fps_comms_shared::wire::{self, decode_position};
use fps_comms_simulation::SimFleet;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::{interval, sleep};
use tracing::{debug, info, warn};

use crate::bus::virtual_bus::{self, VirtualBusControl};
use crate::bus::{multibus_tcp, BusEvent, InterfaceHandle};
use crate::command::{CommandRequest, CommandResult, Target};
use crate::config::{FpsConfig, InterfaceType};
use crate::events::{FpsEvent, FpsRequest, FpsResponse, PollerKind};
use crate::lockfile::InstanceLock;
use crate::positioner::Positioner;
use crate::scheduler::{CanScheduler, StateUpdate};
use crate::trajectory::TrajectoryEngine;

/// Fleet-wide state
#[derive(Debug, Clone, Default)]
pub struct FpsState {
    /// Non-safe commands are refused while set
    pub locked: bool,
    /// Positioners whose collision bits triggered the lock
    pub locked_by: BTreeSet<PositionerId>,
    /// A trajectory is currently executing
    pub moving: bool,
    /// When the last status reply was applied
    pub last_status_update: Option<DateTime<Utc>>,
    /// Trajectories completed since startup
    pub trajectories_executed: u64,
}

pub(crate) struct FpsInner {
    pub(crate) config: FpsConfig,
    pub(crate) scheduler: Arc<CanScheduler>,
    locked: Arc<AtomicBool>,
    positioners: RwLock<BTreeMap<PositionerId, Positioner>>,
    state: RwLock<FpsState>,
    events: broadcast::Sender<FpsEvent>,
    shutdown: watch::Sender<bool>,
    abort_epoch: watch::Sender<u64>,
    pollers_started: AtomicBool,
    shut_down: AtomicBool,
    _instance_lock: StdMutex<Option<InstanceLock>>,
}

/// The fleet coordinator; cheap to clone and share
#[derive(Clone)]
pub struct Fps {
    inner: Arc<FpsInner>,
}

impl std::fmt::Debug for Fps {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fps")
            .field("positioners", &self.inner.positioners.read().map(|p| p.len()))
            .finish_non_exhaustive()
    }
}

impl Fps {
    /// Build a coordinator over already-spawned interfaces
    ///
    /// `bus_events` is the receive side of the channel every interface was
    /// spawned with. Acquires the single-instance lock when one is
    /// configured.
    pub fn with_interfaces(
        config: FpsConfig,
        interfaces: Vec<InterfaceHandle>,
        bus_events: mpsc::Receiver<BusEvent>,
    ) -> Result<Self> {
        config.validate()?;

        let instance_lock = match &config.lockfile_path {
            Some(path) => Some(InstanceLock::acquire(path)?),
            None => None,
        };

        let locked = Arc::new(AtomicBool::new(false));
        let scheduler = CanScheduler::new(interfaces, Arc::clone(&locked));
        let (events, _) = broadcast::channel(256);
        let (shutdown, _) = watch::channel(false);
        let (abort_epoch, _) = watch::channel(0);

        let inner = Arc::new(FpsInner {
            config,
            scheduler: Arc::clone(&scheduler),
            locked,
            positioners: RwLock::new(BTreeMap::new()),
            state: RwLock::new(FpsState::default()),
            events,
            shutdown,
            abort_epoch,
            pollers_started: AtomicBool::new(false),
            shut_down: AtomicBool::new(false),
            _instance_lock: StdMutex::new(instance_lock),
        });

        let (state_tx, state_rx) = mpsc::unbounded_channel();
        scheduler.spawn_demux(bus_events, state_tx);
        spawn_state_task(Arc::clone(&inner), state_rx);

        Ok(Self { inner })
    }

    /// Build a coordinator over a virtual fleet; returns the link control
    ///
    /// Used by tests and the `virtual` CAN profile.
    pub fn with_virtual_fleet(
        config: FpsConfig,
        fleet: Arc<StdMutex<SimFleet>>,
    ) -> Result<(Self, VirtualBusControl)> {
        let (events_tx, events_rx) = mpsc::channel(1024);
        let buses = config
            .profile
            .channels
            .first()
            .map_or(1, |c| c.buses.max(1));
        let (handle, control) = virtual_bus::spawn(0, buses, fleet, events_tx);
        let fps = Self::with_interfaces(config, vec![handle], events_rx)?;
        Ok((fps, control))
    }

    /// Build a coordinator from configuration, spawning its interfaces
    pub fn from_config(config: FpsConfig) -> Result<Self> {
        match config.profile.interface_type {
            InterfaceType::Virtual => {
                let fleet = Arc::new(StdMutex::new(SimFleet::new()));
                Self::with_virtual_fleet(config, fleet).map(|(fps, _)| fps)
            }
            InterfaceType::Tcp => {
                let (events_tx, events_rx) = mpsc::channel(1024);
                let mut interfaces = Vec::new();
                for (index, channel) in config.profile.channels.iter().enumerate() {
                    let host = channel.host.clone().ok_or_else(|| {
                        FpsError::InvalidConfiguration {
                            message: format!("tcp channel {index} has no host"),
                        }
                    })?;
                    let port = channel.port.ok_or_else(|| FpsError::InvalidConfiguration {
                        message: format!("tcp channel {index} has no port"),
                    })?;
                    interfaces.push(multibus_tcp::spawn(
                        index,
                        multibus_tcp::MultibusTcpConfig {
                            host,
                            port,
                            bus_count: channel.buses.max(1),
                            ping_interval: std::time::Duration::from_secs_f64(
                                config.profile.ping_interval,
                            ),
                        },
                        events_tx.clone(),
                    ));
                }
                Self::with_interfaces(config, interfaces, events_rx)
            }
            #[cfg(feature = "slcan")]
            InterfaceType::Slcan => {
                let (events_tx, events_rx) = mpsc::channel(1024);
                let mut interfaces = Vec::new();
                for (index, channel) in config.profile.channels.iter().enumerate() {
                    let device = channel.device.clone().ok_or_else(|| {
                        FpsError::InvalidConfiguration {
                            message: format!("slcan channel {index} has no device"),
                        }
                    })?;
                    interfaces.push(crate::bus::slcan::spawn(
                        index,
                        crate::bus::slcan::SlcanConfig {
                            device,
                            baud_rate: config.profile.bitrate,
                        },
                        events_tx.clone(),
                    ));
                }
                Self::with_interfaces(config, interfaces, events_rx)
            }
            #[cfg(feature = "socketcan")]
            InterfaceType::Socketcan => {
                let (events_tx, events_rx) = mpsc::channel(1024);
                let mut interfaces = Vec::new();
                for (index, channel) in config.profile.channels.iter().enumerate() {
                    let device = channel.device.clone().ok_or_else(|| {
                        FpsError::InvalidConfiguration {
                            message: format!("socketcan channel {index} has no device"),
                        }
                    })?;
                    interfaces.push(crate::bus::socketcan_bus::spawn(
                        index,
                        device,
                        events_tx.clone(),
                    ));
                }
                Self::with_interfaces(config, interfaces, events_rx)
            }
            #[cfg(not(feature = "slcan"))]
            InterfaceType::Slcan => Err(FpsError::InvalidConfiguration {
                message: "slcan profile requires the `slcan` feature".into(),
            }),
            #[cfg(not(feature = "socketcan"))]
            InterfaceType::Socketcan => Err(FpsError::InvalidConfiguration {
                message: "socketcan profile requires the `socketcan` feature".into(),
            }),
        }
    }

    /// The active configuration
    pub fn config(&self) -> &FpsConfig {
        &self.inner.config
    }

    /// The scheduler, for direct command submission
    pub fn scheduler(&self) -> &Arc<CanScheduler> {
        &self.inner.scheduler
    }

    /// Subscribe to coordinator events
    pub fn subscribe(&self) -> broadcast::Receiver<FpsEvent> {
        self.inner.events.subscribe()
    }

    /// Snapshot of the fleet state
    pub fn state(&self) -> FpsState {
        read(&self.inner.state).clone()
    }

    /// Whether the fleet is locked
    pub fn is_locked(&self) -> bool {
        self.inner.locked.load(Ordering::SeqCst)
    }

    /// Snapshot of one positioner
    pub fn positioner(&self, id: PositionerId) -> Option<Positioner> {
        read(&self.inner.positioners).get(&id).cloned()
    }

    /// Snapshot of the whole table
    pub fn positioners(&self) -> BTreeMap<PositionerId, Positioner> {
        read(&self.inner.positioners).clone()
    }

    /// Discover the fleet and initialize every responding positioner
    ///
    /// Broadcasts GET_FIRMWARE_VERSION and GET_STATUS across all interfaces
    /// and buses, builds the positioner table from the replies, marks
    /// previously known ids that stayed silent as offline, applies the
    /// sticky disabled list, runs the per-positioner initialization
    /// sequence, and starts the pollers. Returns the number of positioners
    /// that answered.
    pub async fn initialize(&self) -> Result<usize> {
        let known_before: BTreeSet<PositionerId> =
            read(&self.inner.positioners).keys().copied().collect();

        let firmware = self
            .inner
            .scheduler
            .execute(CommandRequest::broadcast(CommandId::GetFirmwareVersion))
            .await;
        let mut answered = BTreeSet::new();

        if let Ok(result) = firmware {
            let mut table = write(&self.inner.positioners);
            for reply in &result.replies {
                let Ok(version) = wire::decode_firmware_version(&reply.data) else {
                    continue;
                };
                answered.insert(reply.positioner_id);
                let positioner = table
                    .entry(reply.positioner_id)
                    .or_insert_with(|| Positioner::new(reply.positioner_id));
                positioner.apply_firmware(version);
                positioner.bus.get_or_insert(reply.bus);
                positioner.flags.offline = false;
                self.inner.scheduler.set_route(reply.positioner_id, reply.bus);
            }
        }

        if let Ok(result) = self
            .inner
            .scheduler
            .execute(CommandRequest::broadcast(CommandId::GetStatus))
            .await
        {
            let mut table = write(&self.inner.positioners);
            for reply in &result.replies {
                let Ok(raw) = wire::decode_status_word(&reply.data) else {
                    continue;
                };
                answered.insert(reply.positioner_id);
                let positioner = table
                    .entry(reply.positioner_id)
                    .or_insert_with(|| Positioner::new(reply.positioner_id));
                positioner.apply_status(raw);
            }
        }

        {
            let mut table = write(&self.inner.positioners);
            for id in &known_before {
                if !answered.contains(id) {
                    if let Some(positioner) = table.get_mut(id) {
                        positioner.flags.offline = true;
                        warn!(positioner = %id, "offline: no reply during discovery");
                    }
                }
            }
            for id in self.inner.config.disabled_set() {
                if let Some(positioner) = table.get_mut(&id) {
                    positioner.flags.disabled = true;
                }
            }
        }

        for id in &answered {
            if !known_before.contains(id) {
                self.emit(FpsEvent::PositionerAdded { id: *id });
            }
        }

        for id in answered.iter().copied() {
            if let Err(error) = self.initialize_positioner(id).await {
                warn!(positioner = %id, %error, "initialization step failed");
            }
        }

        self.start_pollers();
        self.emit(FpsEvent::DiscoveryComplete {
            count: answered.len(),
        });
        info!(count = answered.len(), "discovery complete");
        Ok(answered.len())
    }

    /// Manually add one positioner at a known bus location
    pub async fn add_positioner(&self, id: PositionerId, bus: BusRef) -> Result<()> {
        if id.is_broadcast() {
            return Err(FpsError::UnknownPositioner(id));
        }
        self.inner.scheduler.set_route(id, bus);
        {
            let mut table = write(&self.inner.positioners);
            let positioner = table.entry(id).or_insert_with(|| Positioner::new(id));
            positioner.bus.get_or_insert(bus);
        }
        self.emit(FpsEvent::PositionerAdded { id });

        // Fetch what discovery would have fetched.
        let result = self
            .inner
            .scheduler
            .execute(CommandRequest::unicast(CommandId::GetFirmwareVersion, id))
            .await?;
        if let Some(reply) = result.replies.first() {
            if let Ok(version) = wire::decode_firmware_version(&reply.data) {
                write(&self.inner.positioners)
                    .entry(id)
                    .or_insert_with(|| Positioner::new(id))
                    .apply_firmware(version);
            }
        }
        self.update_status(id).await?;
        self.initialize_positioner(id).await
    }

    /// The per-positioner initialization sequence
    ///
    /// Stops residual motion with an abort (never a stop: collision flags
    /// must survive), sets the default speed, and reads the position. All
    /// motion-related steps are skipped for bootloader firmware.
    async fn initialize_positioner(&self, id: PositionerId) -> Result<()> {
        let Some(snapshot) = self.positioner(id) else {
            return Err(FpsError::UnknownPositioner(id));
        };

        if snapshot.flags.bootloader {
            debug!(positioner = %id, "bootloader mode: skipping motion initialization");
            return Ok(());
        }

        self.inner
            .scheduler
            .execute(CommandRequest::unicast(CommandId::SendTrajectoryAbort, id))
            .await?;

        if !self.is_locked() {
            let rpm = self.inner.config.default_speed_rpm;
            let speed = CommandRequest::unicast(CommandId::SetSpeed, id)
                .with_payload(wire::encode_speed(rpm, rpm));
            self.inner.scheduler.execute(speed).await?;
        }

        self.update_position(id).await?;

        write(&self.inner.positioners)
            .entry(id)
            .or_insert_with(|| Positioner::new(id))
            .flags
            .initialized = true;
        Ok(())
    }

    /// Submit a command, enforcing the disabled-positioner policy
    pub async fn send_command(&self, request: CommandRequest) -> Result<CommandResult> {
        if let Target::Unicast(id) = request.target {
            if !request.command.spec().safe {
                if let Some(positioner) = self.positioner(id) {
                    if positioner.flags.disabled {
                        return Err(FpsError::PositionerDisabled(id));
                    }
                }
            }
        }
        self.inner.scheduler.execute(request).await
    }

    /// Refresh one positioner's status word; retries once on timeout
    pub async fn update_status(&self, id: PositionerId) -> Result<()> {
        self.short_query(CommandRequest::unicast(CommandId::GetStatus, id))
            .await
            .map(|_| ())
    }

    /// Refresh one positioner's measured position; retries once on timeout
    pub async fn update_position(&self, id: PositionerId) -> Result<(f64, f64)> {
        let result = self
            .short_query(CommandRequest::unicast(CommandId::GetActualPosition, id))
            .await?;
        let reply = result
            .replies
            .first()
            .ok_or_else(|| FpsError::MalformedFrame {
                message: "position reply carried no frame".into(),
            })?;
        let (alpha_steps, beta_steps) = decode_position(&reply.data)?;
        let motor_steps = self.inner.config.motor_steps;

        // Applied here as well as by the state task; same value, and the
        // caller sees a coherent snapshot immediately.
        let mut table = write(&self.inner.positioners);
        let positioner = table.entry(id).or_insert_with(|| Positioner::new(id));
        positioner.apply_position(alpha_steps, beta_steps, motor_steps);
        Ok((
            fps_comms_shared::types::steps_to_degrees(alpha_steps, motor_steps),
            fps_comms_shared::types::steps_to_degrees(beta_steps, motor_steps),
        ))
    }

    async fn short_query(&self, request: CommandRequest) -> Result<CommandResult> {
        match self.inner.scheduler.execute(request.clone()).await {
            Err(FpsError::Timeout { .. }) => self.inner.scheduler.execute(request).await,
            other => other,
        }
    }

    /// Move one positioner to an absolute position
    ///
    /// Builds a two-point trajectory from the current position and
    /// delegates to the trajectory engine. The starting position may
    /// legitimately be negative; it is never clipped into [0, 360).
    pub async fn goto(
        &self,
        id: PositionerId,
        alpha: f64,
        beta: f64,
        speed_rpm: Option<(u32, u32)>,
    ) -> Result<()> {
        let positioner = self
            .positioner(id)
            .ok_or(FpsError::UnknownPositioner(id))?;
        if positioner.flags.disabled {
            return Err(FpsError::PositionerDisabled(id));
        }

        let (current_alpha, current_beta) = match (positioner.alpha, positioner.beta) {
            (Some(a), Some(b)) => (a, b),
            _ => self.update_position(id).await?,
        };

        let config = &self.inner.config;
        let (alpha_rpm, beta_rpm) =
            speed_rpm.unwrap_or((config.default_speed_rpm, config.default_speed_rpm));
        let alpha_speed = config.rpm_to_deg_per_sec(alpha_rpm).max(f64::EPSILON);
        let beta_speed = config.rpm_to_deg_per_sec(beta_rpm).max(f64::EPSILON);

        let duration = ((alpha - current_alpha).abs() / alpha_speed)
            .max((beta - current_beta).abs() / beta_speed)
            .max(0.5);

        let mut data = BTreeMap::new();
        data.insert(
            id,
            fps_comms_shared::trajectory::TrajectoryData::from_pairs(
                [(current_alpha, 0.0), (alpha, duration)],
                [(current_beta, 0.0), (beta, duration)],
            ),
        );
        self.send_trajectory(&Trajectory::new(data)).await
    }

    /// Validate and execute a multi-positioner trajectory
    pub async fn send_trajectory(&self, trajectory: &Trajectory) -> Result<()> {
        if self.is_locked() {
            return Err(FpsError::Locked);
        }

        {
            let table = read(&self.inner.positioners);
            for id in trajectory.positioner_ids() {
                let positioner = table
                    .get(&id)
                    .ok_or(FpsError::UnknownPositioner(id))?;
                if positioner.flags.disabled || positioner.flags.offline {
                    return Err(FpsError::PositionerDisabled(id));
                }
                if positioner.flags.bootloader {
                    return Err(FpsError::PositionerDisabled(id));
                }
            }
        }

        trajectory.validate(&self.inner.config.limits())?;

        TrajectoryEngine::new(self, trajectory).run().await
    }

    /// Abort all motion and lock the fleet
    ///
    /// Broadcasts SEND_TRAJECTORY_ABORT (preserving any latched collision
    /// flags), signals the trajectory engine, and locks the fleet so no
    /// motion command runs until an explicit `unlock`.
    pub async fn abort(&self) -> Result<()> {
        self.inner.abort_epoch.send_modify(|epoch| *epoch += 1);
        self.inner.trigger_lock(Vec::new());
        self.inner
            .scheduler
            .execute(CommandRequest::broadcast(CommandId::SendTrajectoryAbort))
            .await?;
        Ok(())
    }

    /// Lock the fleet without a collision (operator request)
    pub fn lock(&self) {
        self.inner.trigger_lock(Vec::new());
    }

    /// Clear the fleet lock
    ///
    /// Re-enables non-safe scheduling. Collision bits on the firmware are
    /// left latched; clearing them takes an explicit STOP_TRAJECTORY.
    pub fn unlock(&self) {
        {
            let mut state = write(&self.inner.state);
            state.locked = false;
            state.locked_by.clear();
        }
        self.inner.locked.store(false, Ordering::SeqCst);
        self.emit(FpsEvent::Unlocked);
        info!("fleet unlocked");
    }

    /// Clear a positioner's sticky disabled flag
    pub fn enable(&self, id: PositionerId) {
        if let Some(positioner) = write(&self.inner.positioners).get_mut(&id) {
            positioner.flags.disabled = false;
        }
    }

    /// Mark a positioner disabled
    ///
    /// The flag is sticky: it survives re-initialization until an explicit
    /// enable.
    pub fn disable(&self, id: PositionerId) {
        if let Some(positioner) = write(&self.inner.positioners).get_mut(&id) {
            positioner.flags.disabled = true;
        }
    }

    /// Handle one control-plane request
    pub async fn handle_request(&self, request: FpsRequest) -> Result<FpsResponse> {
        match request {
            FpsRequest::Goto { id, alpha, beta } => {
                self.goto(id, alpha, beta, None).await?;
                Ok(FpsResponse::Ack)
            }
            FpsRequest::SendTrajectory(trajectory) => {
                self.send_trajectory(&trajectory).await?;
                Ok(FpsResponse::Ack)
            }
            FpsRequest::Abort => {
                self.abort().await?;
                Ok(FpsResponse::Ack)
            }
            FpsRequest::Lock => {
                self.lock();
                Ok(FpsResponse::Ack)
            }
            FpsRequest::Unlock => {
                self.unlock();
                Ok(FpsResponse::Ack)
            }
            FpsRequest::Enable(id) => {
                self.enable(id);
                Ok(FpsResponse::Ack)
            }
            FpsRequest::Disable(id) => {
                self.disable(id);
                Ok(FpsResponse::Ack)
            }
            FpsRequest::Reload => {
                self.initialize().await?;
                Ok(FpsResponse::Ack)
            }
            FpsRequest::GetStatus(Some(id)) => {
                let positioner = self
                    .positioner(id)
                    .ok_or(FpsError::UnknownPositioner(id))?;
                Ok(FpsResponse::Positioners(vec![positioner]))
            }
            FpsRequest::GetStatus(None) => Ok(FpsResponse::Positioners(
                self.positioners().into_values().collect(),
            )),
        }
    }

    /// Serve control-plane requests until the channel closes
    pub fn serve_requests(
        &self,
        mut requests: mpsc::Receiver<(FpsRequest, oneshot::Sender<Result<FpsResponse>>)>,
    ) {
        let fps = self.clone();
        tokio::spawn(async move {
            while let Some((request, respond)) = requests.recv().await {
                let _ = respond.send(fps.handle_request(request).await);
            }
        });
    }

    /// Stop pollers and background tasks; idempotent
    ///
    /// A second call is a no-op: no errors, no further frames.
    pub async fn shutdown(&self) {
        if self.inner.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.inner.shutdown.send(true);
        info!("coordinator shut down");
    }

    fn start_pollers(&self) {
        if self.inner.pollers_started.swap(true, Ordering::SeqCst) {
            return;
        }
        spawn_poller(
            self.clone(),
            PollerKind::Status,
            CommandId::GetStatus,
        );
        spawn_poller(
            self.clone(),
            PollerKind::Position,
            CommandId::GetActualPosition,
        );
    }

    pub(crate) fn emit(&self, event: FpsEvent) {
        let _ = self.inner.events.send(event);
    }

    pub(crate) fn abort_epoch(&self) -> watch::Receiver<u64> {
        self.inner.abort_epoch.subscribe()
    }

    pub(crate) fn set_moving(&self, moving: bool) {
        write(&self.inner.state).moving = moving;
    }

    pub(crate) fn record_trajectory_executed(&self) {
        write(&self.inner.state).trajectories_executed += 1;
    }

    fn is_shut_down(&self) -> bool {
        self.inner.shut_down.load(Ordering::SeqCst)
    }
}

impl FpsInner {
    /// Apply one state update; the single-writer path onto the table
    fn apply_update(&self, update: StateUpdate, fps: &Fps) {
        match update {
            StateUpdate::Firmware { id, version, bus } => {
                let mut table = write(&self.positioners);
                let positioner = table.entry(id).or_insert_with(|| Positioner::new(id));
                positioner.apply_firmware(version);
                positioner.bus.get_or_insert(bus);
            }
            StateUpdate::Status { id, raw } => {
                let (changed, collided) = {
                    let mut table = write(&self.positioners);
                    let positioner = table.entry(id).or_insert_with(|| Positioner::new(id));
                    let changed = positioner.apply_status(raw);
                    let collided =
                        positioner.is_collided() && !positioner.flags.no_collision_detect;
                    (changed, collided)
                };
                write(&self.state).last_status_update = Some(Utc::now());

                if changed {
                    fps.emit(FpsEvent::StatusChanged { id, raw });
                }
                if collided && !read(&self.state).locked_by.contains(&id) {
                    warn!(positioner = %id, "collision bit set; locking the fleet");
                    self.trigger_lock(vec![id]);
                }
            }
            StateUpdate::Position {
                id,
                alpha_steps,
                beta_steps,
            } => {
                let motor_steps = self.config.motor_steps;
                let (alpha, beta) = {
                    let mut table = write(&self.positioners);
                    let positioner = table.entry(id).or_insert_with(|| Positioner::new(id));
                    positioner.apply_position(alpha_steps, beta_steps, motor_steps);
                    (positioner.alpha, positioner.beta)
                };
                if let (Some(alpha), Some(beta)) = (alpha, beta) {
                    fps.emit(FpsEvent::PositionChanged { id, alpha, beta });
                }
            }
            StateUpdate::TransportError { interface } => {
                fps.emit(FpsEvent::TransportReset { interface });
            }
            StateUpdate::Reconnected { interface } => {
                debug!(interface, "interface back online");
            }
        }
    }

    /// Lock the fleet: refuse non-safe submissions, cancel non-safe
    /// in-flight commands, and chase them with a broadcast abort
    fn trigger_lock(&self, by: Vec<PositionerId>) {
        let first = {
            let mut state = write(&self.state);
            let first = !state.locked;
            state.locked = true;
            state.locked_by.extend(by);
            first
        };
        self.locked.store(true, Ordering::SeqCst);

        if first {
            self.scheduler.cancel_all_unsafe();
            let scheduler = Arc::clone(&self.scheduler);
            tokio::spawn(async move {
                let abort =
                    CommandRequest::broadcast(CommandId::SendTrajectoryAbort).fire_and_forget();
                if let Err(error) = scheduler.execute(abort).await {
                    warn!(%error, "lock abort broadcast failed");
                }
            });
            let _ = self.events.send(FpsEvent::Locked {
                by: read(&self.state).locked_by.clone(),
            });
        }
    }
}

fn spawn_state_task(inner: Arc<FpsInner>, mut updates: mpsc::UnboundedReceiver<StateUpdate>) {
    let mut shutdown = inner.shutdown.subscribe();
    tokio::spawn(async move {
        let fps = Fps {
            inner: Arc::clone(&inner),
        };
        loop {
            tokio::select! {
                update = updates.recv() => match update {
                    Some(update) => inner.apply_update(update, &fps),
                    None => break,
                },
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        debug!("state task stopped");
    });
}

fn spawn_poller(fps: Fps, kind: PollerKind, command: CommandId) {
    let period = match kind {
        PollerKind::Status => fps.config().status_interval(),
        PollerKind::Position => fps.config().position_interval(),
    };
    let timeout = fps.config().poller_timeout();
    let mut shutdown = fps.inner.shutdown.subscribe();

    tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }
            if fps.is_shut_down() {
                break;
            }
            if fps.positioners().is_empty() {
                continue;
            }

            let request = CommandRequest::broadcast(command).with_timeout(timeout);
            match fps.inner.scheduler.execute(request.clone()).await {
                Ok(_) => {}
                Err(FpsError::Timeout { .. }) => {
                    // One automatic retry; alert on the second failure and
                    // keep polling.
                    if matches!(
                        fps.inner.scheduler.execute(request).await,
                        Err(FpsError::Timeout { .. })
                    ) {
                        warn!(?kind, "poller timed out twice");
                        fps.emit(FpsEvent::PollerAlert { kind });
                    }
                }
                Err(error) => {
                    debug!(?kind, %error, "poll skipped");
                    sleep(std::time::Duration::from_millis(100)).await;
                }
            }
        }
        debug!(?kind, "poller stopped");
    });
}

fn read<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    match lock.read() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn write<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    match lock.write() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
