use std::collections::{BTreeSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use btleplug::api::{
    Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter,
    ValueNotification, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::future::BoxFuture;
use futures::{Stream, StreamExt};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::error::ConnectionError;
use crate::parse::{packet_kind, ForceDecoder, PacketKind};
use crate::protocol::{
    build_command, has_name_prefix, CommandKind, COMMAND_CHARACTERISTIC, DEFAULT_SAMPLE_PERIOD_MS,
    DEVICE_NAME_PREFIX, RESPONSE_CHARACTERISTIC,
};
use crate::queue::{event_queue, EventReceiver, EventSender};
use crate::types::{BeltEvent, DisconnectCause, RawSample};

// ── Timestamp helper ──────────────────────────────────────────────────────────

/// Wall-clock milliseconds since Unix epoch.
pub fn now_ms() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
        * 1000.0
}

// ── LinkState ─────────────────────────────────────────────────────────────────

/// Lifecycle of the BLE link.
///
/// ```text
/// Disconnected → Scanning → Connecting → ServiceDiscovery → Subscribed → Streaming
///       ↑______________________________________________________________________|
///                         (teardown or link loss, from any state)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Scanning,
    Connecting,
    ServiceDiscovery,
    Subscribed,
    Streaming,
}

impl LinkState {
    /// Whether the state machine permits moving from `self` to `next`.
    ///
    /// `Disconnected → Connecting` is allowed for devices picked from a prior
    /// [`BeltClient::scan_all`].
    pub fn can_transition_to(self, next: LinkState) -> bool {
        use LinkState::*;
        matches!(
            (self, next),
            (_, Disconnected)
                | (Disconnected, Scanning)
                | (Disconnected, Connecting)
                | (Scanning, Connecting)
                | (Connecting, ServiceDiscovery)
                | (ServiceDiscovery, Subscribed)
                | (Subscribed, Streaming)
        )
    }

    /// `true` once notifications are subscribed.
    pub fn is_connected(self) -> bool {
        matches!(self, LinkState::Subscribed | LinkState::Streaming)
    }
}

// ── Transport seam ────────────────────────────────────────────────────────────

/// The two GATT operations the handle needs, abstracted so the command and
/// timer logic can run against something other than a real peripheral.
pub trait BeltLink: Send + Sync {
    /// Write one command frame to the command characteristic.
    fn write(&self, frame: Vec<u8>) -> BoxFuture<'_, Result<(), ConnectionError>>;
    /// Stop notifications and drop the link.
    fn release(&self) -> BoxFuture<'_, Result<(), ConnectionError>>;
    /// Whether the platform still reports the link as up.
    fn is_connected(&self) -> BoxFuture<'_, bool>;
}

/// [`BeltLink`] over a btleplug peripheral.
pub struct BlePeripheralLink {
    peripheral: Peripheral,
    command_char: Characteristic,
    response_char: Characteristic,
}

impl BeltLink for BlePeripheralLink {
    fn write(&self, frame: Vec<u8>) -> BoxFuture<'_, Result<(), ConnectionError>> {
        Box::pin(async move {
            self.peripheral
                .write(&self.command_char, &frame, WriteType::WithoutResponse)
                .await
                .map_err(ConnectionError::from)
        })
    }

    fn release(&self) -> BoxFuture<'_, Result<(), ConnectionError>> {
        Box::pin(async move {
            if let Err(e) = self.peripheral.unsubscribe(&self.response_char).await {
                debug!("unsubscribe before disconnect failed: {e}");
            }
            self.peripheral
                .disconnect()
                .await
                .map_err(ConnectionError::from)
        })
    }

    fn is_connected(&self) -> BoxFuture<'_, bool> {
        Box::pin(async move { self.peripheral.is_connected().await.unwrap_or(false) })
    }
}

// ── BeltDevice ────────────────────────────────────────────────────────────────

/// A belt discovered during a BLE scan.
///
/// Returned by [`BeltClient::scan_all`]; pass to [`BeltClient::connect_to`].
#[derive(Clone, Debug)]
pub struct BeltDevice {
    /// Advertised device name (e.g. `"GDX-RB 0K1023A7"`).
    pub name: String,
    /// Platform BLE identifier: a UUID string on macOS / Windows, a MAC
    /// address on Linux.
    pub id: String,
    pub(crate) peripheral: Peripheral,
    /// Adapter that discovered the device, reused for the disconnect watcher.
    pub(crate) adapter: Adapter,
}

// ── BeltClientConfig ──────────────────────────────────────────────────────────

/// Configuration for [`BeltClient`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BeltClientConfig {
    /// Match devices whose advertised name starts with this string.
    /// Default: `"GDX-RB"`.
    pub name_prefix: String,
    /// BLE scan duration in seconds before giving up. Default: `15`.
    pub scan_timeout_secs: u64,
    /// Deadline for `peripheral.connect()`. Default: `10`.
    pub connect_timeout_secs: u64,
    /// Deadline for GATT service discovery. Default: `15`.
    pub discovery_timeout_secs: u64,
    /// Deadline for a single command write. Default: `2_000`.
    pub write_timeout_ms: u64,
    /// Pause between consecutive startup commands.  Some belts silently
    /// drop a command that follows the previous one too closely.
    /// Default: `500`.
    pub command_spacing_ms: u64,
    /// Keep-alive period. Default: `3_000`.
    pub heartbeat_interval_ms: u64,
    /// If no notification arrives this long after streaming starts, the
    /// startup commands are sent once more. `0` disables. Default: `5_000`.
    pub stream_watchdog_ms: u64,
    /// Sample period requested from the device. Default: `100` (10 Hz).
    pub sample_period_ms: u16,
    /// Event queue capacity; the oldest event is dropped on overflow.
    /// Default: `512`.
    pub event_capacity: usize,
    /// Raw notifications retained for diagnostics. Default: `256`.
    pub raw_history: usize,
}

impl Default for BeltClientConfig {
    fn default() -> Self {
        Self {
            name_prefix: DEVICE_NAME_PREFIX.into(),
            scan_timeout_secs: 15,
            connect_timeout_secs: 10,
            discovery_timeout_secs: 15,
            write_timeout_ms: 2_000,
            command_spacing_ms: 500,
            heartbeat_interval_ms: 3_000,
            stream_watchdog_ms: 5_000,
            sample_period_ms: DEFAULT_SAMPLE_PERIOD_MS,
            event_capacity: 512,
            raw_history: 256,
        }
    }
}

// ── Shared link state ─────────────────────────────────────────────────────────

#[derive(Default)]
struct Timers {
    heartbeat: Option<JoinHandle<()>>,
    one_shots: Vec<JoinHandle<()>>,
    /// Notification dispatcher and disconnect watcher.
    background: Vec<JoinHandle<()>>,
}

/// State shared between a [`BeltHandle`] and the tasks it owns.
///
/// One per connection: tasks left over from an earlier link can only ever
/// reach their own instance.
struct LinkShared {
    state: watch::Sender<LinkState>,
    timers: Mutex<Timers>,
    /// Taken exactly once by whichever path reports the disconnect first.
    events: Mutex<Option<EventSender<BeltEvent>>>,
    /// An event queue was installed; the instance belongs to a connection.
    attached: AtomicBool,
    /// `BeltLink::release` has been called.
    released: AtomicBool,
    sample_count: AtomicU64,
    raw_history: Mutex<VecDeque<RawSample>>,
    raw_capacity: usize,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl LinkShared {
    fn new(raw_capacity: usize) -> Self {
        let (state, _) = watch::channel(LinkState::Disconnected);
        Self {
            state,
            timers: Mutex::new(Timers::default()),
            events: Mutex::new(None),
            attached: AtomicBool::new(false),
            released: AtomicBool::new(false),
            sample_count: AtomicU64::new(0),
            raw_history: Mutex::new(VecDeque::with_capacity(raw_capacity)),
            raw_capacity,
        }
    }

    fn state(&self) -> LinkState {
        *self.state.borrow()
    }

    /// Move to `next` if the state machine allows it.
    fn advance(&self, next: LinkState) -> bool {
        let current = self.state();
        if current == next {
            return true;
        }
        if !current.can_transition_to(next) {
            warn!("link: refusing transition {current:?} → {next:?}");
            return false;
        }
        debug!("link: {current:?} → {next:?}");
        self.state.send_replace(next);
        true
    }

    /// Install the event queue for this connection.
    fn attach(&self, tx: EventSender<BeltEvent>) {
        *lock(&self.events) = Some(tx);
        self.attached.store(true, Ordering::SeqCst);
    }

    fn emit(&self, event: BeltEvent) {
        if let Some(tx) = lock(&self.events).as_ref() {
            tx.push(event);
        }
    }

    fn cancel_timers(&self) {
        let mut t = lock(&self.timers);
        if let Some(h) = t.heartbeat.take() {
            h.abort();
        }
        for h in t.one_shots.drain(..) {
            h.abort();
        }
    }

    fn cancel_background(&self) {
        for h in lock(&self.timers).background.drain(..) {
            h.abort();
        }
    }

    /// Tear down after the link went away: timers, the dispatcher and the
    /// disconnect watcher all stop.  Returns `false`, touching nothing, when
    /// the disconnect was already reported.
    fn report_disconnect(&self, cause: DisconnectCause) -> bool {
        let Some(tx) = lock(&self.events).take() else {
            return false;
        };
        self.cancel_timers();
        self.state.send_replace(LinkState::Disconnected);
        tx.push(BeltEvent::Disconnected(cause));
        self.cancel_background();
        true
    }

    fn record_raw(&self, sample: &RawSample) {
        self.sample_count.fetch_add(1, Ordering::Relaxed);
        if self.raw_capacity == 0 {
            return;
        }
        let mut hist = lock(&self.raw_history);
        while hist.len() >= self.raw_capacity {
            hist.pop_front();
        }
        hist.push_back(sample.clone());
    }
}

// ── NotificationRouter ────────────────────────────────────────────────────────

/// Turns notification payloads into [`BeltEvent`]s.
///
/// The BLE dispatch task owns one; a simulated link uses the same router so
/// simulated and real packets travel the same path.
#[derive(Clone)]
pub struct NotificationRouter {
    shared: Arc<LinkShared>,
    decoder: Arc<ForceDecoder>,
}

impl NotificationRouter {
    /// Route one payload.  Decode failures are silent: they are expected for
    /// a sizeable share of packets.
    pub fn route(&self, bytes: Vec<u8>) {
        let raw = RawSample {
            bytes,
            received_at: now_ms(),
        };
        self.route_sample(raw);
    }

    /// Route a payload that already carries its arrival time.
    pub fn route_sample(&self, raw: RawSample) {
        self.shared.record_raw(&raw);
        let n = self.shared.sample_count.load(Ordering::Relaxed);
        if n <= 3 || n % 500 == 0 {
            debug!("notif #{n} len={} bytes={:02x?}", raw.bytes.len(), raw.bytes);
        }
        match packet_kind(&raw.bytes) {
            PacketKind::Empty => {}
            PacketKind::CommandResponse(id) => {
                debug!("command response for 0x{id:02x}");
                self.shared.emit(BeltEvent::CommandResponse(raw.bytes));
            }
            PacketKind::Measurement => {
                let force = self.decoder.decode_sample(&raw);
                self.shared.emit(BeltEvent::Sample { raw, force });
            }
        }
    }

    /// `false` once the link is torn down; further payloads are pointless.
    pub fn is_open(&self) -> bool {
        self.shared.state() != LinkState::Disconnected
    }

    /// The link dropped without a disconnect request.
    pub fn link_lost(&self) {
        if self.shared.report_disconnect(DisconnectCause::LinkLost) {
            info!("link lost; timers cancelled");
        }
    }
}

// ── BeltClient ────────────────────────────────────────────────────────────────

/// BLE client for respiration belts.
///
/// Handles scanning, connecting, GATT subscription, and notification
/// dispatch.  Each successful connect yields an [`EventReceiver`] and a
/// [`BeltHandle`] for commands and teardown.
pub struct BeltClient {
    config: BeltClientConfig,
    decoder: ForceDecoder,
    /// The current (or next) connection attempt.
    link: Mutex<Arc<LinkShared>>,
}

impl BeltClient {
    pub fn new(config: BeltClientConfig) -> Self {
        let link = Mutex::new(Arc::new(LinkShared::new(config.raw_history)));
        Self {
            config,
            decoder: ForceDecoder::default(),
            link,
        }
    }

    /// Use `decoder` instead of the default strategies and force window.
    pub fn with_decoder(mut self, decoder: ForceDecoder) -> Self {
        self.decoder = decoder;
        self
    }

    /// Observe link-state changes of the current connection attempt,
    /// including those during [`connect`](Self::connect).
    ///
    /// Once a connection has come up, the next attempt starts with a fresh
    /// state channel; subscribe again (or through [`BeltHandle`]) after it.
    pub fn subscribe_state(&self) -> watch::Receiver<LinkState> {
        self.current().state.subscribe()
    }

    pub fn link_state(&self) -> LinkState {
        self.current().state()
    }

    fn current(&self) -> Arc<LinkShared> {
        Arc::clone(&lock(&self.link))
    }

    /// Claim the link state for a new attempt.  An instance that already
    /// carried a connection is replaced so its leftover tasks stay isolated.
    fn begin_attempt(&self) -> Result<Arc<LinkShared>, ConnectionError> {
        let mut current = lock(&self.link);
        match current.state() {
            LinkState::Disconnected => {}
            other => {
                return Err(ConnectionError::Adapter(format!(
                    "link already in state {other:?}; disconnect first"
                )))
            }
        }
        if current.attached.load(Ordering::SeqCst) {
            *current = Arc::new(LinkShared::new(self.config.raw_history));
        }
        Ok(Arc::clone(&current))
    }

    // ── Public: scan ─────────────────────────────────────────────────────────

    /// Scan for **all** nearby belts and return them.
    ///
    /// Runs for the full `scan_timeout_secs` so several belts in range can be
    /// listed before the function returns.
    pub async fn scan_all(&self) -> Result<Vec<BeltDevice>, ConnectionError> {
        let adapter = first_adapter().await?;
        wait_powered_on(&adapter).await;

        info!("scan_all: scanning for {} s …", self.config.scan_timeout_secs);
        adapter.start_scan(ScanFilter::default()).await?;
        tokio::time::sleep(Duration::from_secs(self.config.scan_timeout_secs)).await;
        adapter.stop_scan().await.ok();

        let mut found = vec![];
        for p in adapter.peripherals().await? {
            if let Ok(Some(props)) = p.properties().await {
                if let Some(name) = props.local_name {
                    if has_name_prefix(&name, &self.config.name_prefix) {
                        let id = p.id().to_string();
                        info!("scan_all: found {name}  id={id}");
                        found.push(BeltDevice {
                            name,
                            id,
                            peripheral: p,
                            adapter: adapter.clone(),
                        });
                    }
                }
            }
        }
        info!("scan_all: {} device(s) found", found.len());
        Ok(found)
    }

    // ── Public: connect_to ────────────────────────────────────────────────────

    /// Connect to a device returned by [`BeltClient::scan_all`] and start
    /// streaming.
    pub async fn connect_to(
        &self,
        device: BeltDevice,
    ) -> Result<(EventReceiver<BeltEvent>, BeltHandle), ConnectionError> {
        let shared = self.begin_attempt()?;
        shared.advance(LinkState::Connecting);
        let result = self
            .setup_peripheral(&shared, device.peripheral, device.name, device.adapter)
            .await;
        if result.is_err() {
            shared.advance(LinkState::Disconnected);
        }
        result
    }

    // ── Public: connect (convenience) ────────────────────────────────────────

    /// Scan for the first matching belt, connect, subscribe, and send the
    /// startup command sequence.
    pub async fn connect(
        &self,
    ) -> Result<(EventReceiver<BeltEvent>, BeltHandle), ConnectionError> {
        let shared = self.begin_attempt()?;
        let result = self.scan_and_connect(&shared).await;
        if result.is_err() {
            shared.advance(LinkState::Disconnected);
        }
        result
    }

    async fn scan_and_connect(
        &self,
        shared: &Arc<LinkShared>,
    ) -> Result<(EventReceiver<BeltEvent>, BeltHandle), ConnectionError> {
        let adapter = first_adapter().await?;
        wait_powered_on(&adapter).await;

        shared.advance(LinkState::Scanning);
        info!(
            "Scanning for '{}' devices (timeout: {} s) …",
            self.config.name_prefix, self.config.scan_timeout_secs
        );
        adapter.start_scan(ScanFilter::default()).await?;
        let found = self
            .find_first(&adapter, &self.config.name_prefix, self.config.scan_timeout_secs)
            .await;
        adapter.stop_scan().await.ok();
        let peripheral = found?;

        let props = peripheral.properties().await?.unwrap_or_default();
        let device_name = props.local_name.unwrap_or_else(|| "Unknown".into());
        info!("Found device: {device_name}");

        shared.advance(LinkState::Connecting);
        self.setup_peripheral(shared, peripheral, device_name, adapter).await
    }

    // ── Private: setup_peripheral ─────────────────────────────────────────────

    /// Connect, discover, subscribe, spawn the dispatch tasks, and run the
    /// startup command sequence.
    async fn setup_peripheral(
        &self,
        shared: &Arc<LinkShared>,
        peripheral: Peripheral,
        device_name: String,
        adapter: Adapter,
    ) -> Result<(EventReceiver<BeltEvent>, BeltHandle), ConnectionError> {
        if peripheral.is_connected().await.unwrap_or(false) {
            info!("{device_name}: already connected at the adapter level, reusing link");
        } else {
            // BlueZ's Device1.Connect can block forever when the device is out
            // of range, hence the hard deadline.
            let secs = self.config.connect_timeout_secs;
            tokio::time::timeout(Duration::from_secs(secs), peripheral.connect())
                .await
                .map_err(|_| ConnectionError::Timeout { operation: "connect", secs })??;
        }

        shared.advance(LinkState::ServiceDiscovery);

        // On Linux the stack reports the connection before the remote GATT
        // cache is populated; discovering too early returns an empty set.
        #[cfg(target_os = "linux")]
        tokio::time::sleep(Duration::from_millis(600)).await;

        let secs = self.config.discovery_timeout_secs;
        tokio::time::timeout(Duration::from_secs(secs), peripheral.discover_services())
            .await
            .map_err(|_| ConnectionError::Timeout { operation: "discover_services", secs })??;
        info!("Connected and services discovered: {device_name}");

        let chars: BTreeSet<Characteristic> = peripheral.characteristics();
        let find_char = |uuid| -> Result<Characteristic, ConnectionError> {
            chars
                .iter()
                .find(|c| c.uuid == uuid)
                .cloned()
                .ok_or_else(|| ConnectionError::Adapter(format!("characteristic {uuid} not found")))
        };
        let command_char = find_char(COMMAND_CHARACTERISTIC)?;
        let response_char = find_char(RESPONSE_CHARACTERISTIC)?;
        peripheral.subscribe(&response_char).await?;
        let notifications = peripheral.notifications().await?;

        // ── Event queue ───────────────────────────────────────────────────────
        let (tx, rx) = event_queue::<BeltEvent>(self.config.event_capacity);
        tx.push(BeltEvent::Connected(device_name.clone()));
        shared.attach(tx);
        shared.advance(LinkState::Subscribed);

        let router = NotificationRouter {
            shared: Arc::clone(shared),
            decoder: Arc::new(self.decoder.clone()),
        };

        // ── Disconnect watcher ────────────────────────────────────────────────
        // The adapter's DeviceDisconnected event usually fires before the
        // notification stream closes.
        let watcher_router = router.clone();
        let peripheral_id = peripheral.id();
        let watcher = tokio::spawn(async move {
            match adapter.events().await {
                Ok(mut events) => {
                    while let Some(event) = events.next().await {
                        if let CentralEvent::DeviceDisconnected(id) = event {
                            if id == peripheral_id {
                                info!("Disconnect watcher: device {id:?} disconnected.");
                                watcher_router.link_lost();
                                break;
                            }
                        }
                    }
                }
                Err(e) => {
                    warn!("Disconnect watcher: could not subscribe to adapter events: {e}");
                }
            }
        });

        // ── Notification dispatcher ───────────────────────────────────────────
        let dispatcher = spawn_dispatcher(router.clone(), notifications);
        lock(&shared.timers).background.extend([watcher, dispatcher]);

        let link = BlePeripheralLink {
            peripheral,
            command_char,
            response_char,
        };
        let handle = BeltHandle {
            link: Arc::new(link),
            shared: Arc::clone(shared),
            router,
            config: self.config.clone(),
            device_name,
        };

        if let Err(e) = handle.start().await {
            warn!("startup sequence failed: {e}");
            handle.disconnect().await.ok();
            return Err(e);
        }
        handle.start_heartbeat();
        handle.arm_stream_watchdog();

        Ok((rx, handle))
    }

    // ── Private: find_first ───────────────────────────────────────────────────

    /// Poll until the first matching peripheral appears or the timeout expires.
    async fn find_first(
        &self,
        adapter: &Adapter,
        prefix: &str,
        timeout_secs: u64,
    ) -> Result<Peripheral, ConnectionError> {
        use tokio::time::{sleep, timeout};

        let result = timeout(Duration::from_secs(timeout_secs), async {
            loop {
                let peripherals = adapter.peripherals().await.unwrap_or_default();
                for p in peripherals {
                    if let Ok(Some(props)) = p.properties().await {
                        if let Some(name) = &props.local_name {
                            if has_name_prefix(name, prefix) {
                                return p;
                            }
                        }
                    }
                }
                sleep(Duration::from_millis(250)).await;
            }
        })
        .await;

        result.map_err(|_| {
            info!("no '{prefix}' device after {timeout_secs} s");
            ConnectionError::NoDeviceSelected
        })
    }
}

async fn first_adapter() -> Result<Adapter, ConnectionError> {
    let manager = Manager::new().await?;
    manager
        .adapters()
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| ConnectionError::Adapter("No Bluetooth adapter found".into()))
}

/// Forward every response-characteristic notification to `router` until the
/// stream ends, which counts as link loss.
fn spawn_dispatcher<S>(router: NotificationRouter, mut notifications: S) -> JoinHandle<()>
where
    S: Stream<Item = ValueNotification> + Send + Unpin + 'static,
{
    tokio::spawn(async move {
        info!("notification stream subscribed, waiting for data…");
        while let Some(notif) = notifications.next().await {
            if !router.is_open() {
                break;
            }
            if notif.uuid == RESPONSE_CHARACTERISTIC {
                router.route(notif.value);
            } else {
                debug!("Unknown notification from {}", notif.uuid);
            }
        }
        info!("notification stream ended – device disconnected.");
        router.link_lost();
    })
}

/// macOS: CBCentralManager starts in an "unknown" state and silently ignores
/// scans until it reaches poweredOn.  Poll for up to 3 s.
#[cfg(target_os = "macos")]
async fn wait_powered_on(adapter: &Adapter) {
    use btleplug::api::CentralState;

    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    loop {
        match adapter.adapter_state().await {
            Ok(CentralState::PoweredOn) => break,
            Ok(state) if tokio::time::Instant::now() >= deadline => {
                warn!("macOS: adapter still in state {state:?} after 3 s; proceeding anyway");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                warn!("macOS: adapter_state() error: {e}");
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
    tokio::time::sleep(Duration::from_millis(300)).await;
}

#[cfg(not(target_os = "macos"))]
async fn wait_powered_on(_adapter: &Adapter) {}

// ── BeltHandle ────────────────────────────────────────────────────────────────

/// Handle to an active belt connection: commands, keep-alive, teardown.
pub struct BeltHandle {
    link: Arc<dyn BeltLink>,
    shared: Arc<LinkShared>,
    router: NotificationRouter,
    config: BeltClientConfig,
    device_name: String,
}

impl BeltHandle {
    /// Wrap an already-subscribed link.
    ///
    /// Used for transports other than btleplug (the simulator, tests).
    /// Payloads are fed in through [`BeltHandle::router`].
    pub fn from_link(
        link: Arc<dyn BeltLink>,
        config: BeltClientConfig,
        decoder: ForceDecoder,
        device_name: impl Into<String>,
    ) -> (EventReceiver<BeltEvent>, BeltHandle) {
        let device_name = device_name.into();
        let shared = Arc::new(LinkShared::new(config.raw_history));
        let (tx, rx) = event_queue::<BeltEvent>(config.event_capacity);
        tx.push(BeltEvent::Connected(device_name.clone()));
        shared.attach(tx);
        shared.state.send_replace(LinkState::Subscribed);

        let router = NotificationRouter {
            shared: Arc::clone(&shared),
            decoder: Arc::new(decoder),
        };
        let handle = BeltHandle {
            link,
            shared,
            router,
            config,
            device_name,
        };
        (rx, handle)
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    /// Router feeding this handle's event queue.
    pub fn router(&self) -> NotificationRouter {
        self.router.clone()
    }

    pub fn link_state(&self) -> LinkState {
        self.shared.state()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<LinkState> {
        self.shared.state.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.shared.state().is_connected()
    }

    /// Snapshot of the most recent raw notifications, oldest first.
    pub fn recent_raw(&self) -> Vec<RawSample> {
        lock(&self.shared.raw_history).iter().cloned().collect()
    }

    /// Notifications received since the link came up.
    pub fn sample_count(&self) -> u64 {
        self.shared.sample_count.load(Ordering::Relaxed)
    }

    /// Write one command frame, bounded by `write_timeout_ms`.
    pub async fn send_command(&self, kind: CommandKind) -> Result<(), ConnectionError> {
        write_frame(&*self.link, kind, self.config.write_timeout_ms).await
    }

    /// Enable the sensor, set the sample period, and start measuring.
    ///
    /// Commands are spaced by `command_spacing_ms`; belts drop commands that
    /// arrive back-to-back.
    pub async fn start(&self) -> Result<(), ConnectionError> {
        let spacing = Duration::from_millis(self.config.command_spacing_ms);
        self.send_command(CommandKind::EnableSensor).await?;
        tokio::time::sleep(spacing).await;
        self.send_command(CommandKind::SetSamplePeriod(self.config.sample_period_ms))
            .await?;
        tokio::time::sleep(spacing).await;
        self.send_command(CommandKind::StartMeasurement).await?;
        self.shared.advance(LinkState::Streaming);
        Ok(())
    }

    /// Stop measurement without dropping the link.
    pub async fn stop(&self) -> Result<(), ConnectionError> {
        self.send_command(CommandKind::StopMeasurement).await
    }

    pub async fn request_device_info(&self) -> Result<(), ConnectionError> {
        self.send_command(CommandKind::GetDeviceInfo).await
    }

    pub async fn request_sensor_list(&self) -> Result<(), ConnectionError> {
        self.send_command(CommandKind::GetSensorList).await
    }

    /// Re-issue start-measurement every `heartbeat_interval_ms`.
    ///
    /// A second call while the heartbeat runs is a no-op.  The task ends on
    /// [`disconnect`](Self::disconnect) or link loss.
    pub fn start_heartbeat(&self) {
        let mut timers = lock(&self.shared.timers);
        if timers.heartbeat.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }
        let link = Arc::clone(&self.link);
        let shared = Arc::clone(&self.shared);
        let period = Duration::from_millis(self.config.heartbeat_interval_ms.max(1));
        let write_timeout_ms = self.config.write_timeout_ms;
        timers.heartbeat = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await; // first tick completes immediately
            loop {
                ticker.tick().await;
                if !shared.state().is_connected() {
                    break;
                }
                if let Err(e) = write_frame(&*link, CommandKind::KeepAlive, write_timeout_ms).await
                {
                    warn!("heartbeat write failed: {e}");
                }
            }
        }));
    }

    /// `true` while the keep-alive task is running.
    pub fn heartbeat_active(&self) -> bool {
        lock(&self.shared.timers)
            .heartbeat
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }

    /// One-shot recovery timer: if no notification arrives within
    /// `stream_watchdog_ms`, the startup commands are sent once more.
    pub fn arm_stream_watchdog(&self) {
        if self.config.stream_watchdog_ms == 0 {
            return;
        }
        let link = Arc::clone(&self.link);
        let shared = Arc::clone(&self.shared);
        let delay = Duration::from_millis(self.config.stream_watchdog_ms);
        let spacing = Duration::from_millis(self.config.command_spacing_ms);
        let write_timeout_ms = self.config.write_timeout_ms;
        let seen_at_arm = shared.sample_count.load(Ordering::Relaxed);
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if !shared.state().is_connected()
                || shared.sample_count.load(Ordering::Relaxed) > seen_at_arm
            {
                return;
            }
            warn!("no data {} ms after start; re-sending startup commands", delay.as_millis());
            if let Err(e) = write_frame(&*link, CommandKind::EnableSensor, write_timeout_ms).await {
                warn!("watchdog enable-sensor failed: {e}");
                return;
            }
            tokio::time::sleep(spacing).await;
            if let Err(e) =
                write_frame(&*link, CommandKind::StartMeasurement, write_timeout_ms).await
            {
                warn!("watchdog start-measurement failed: {e}");
            }
        });
        let mut timers = lock(&self.shared.timers);
        timers.one_shots.retain(|h| !h.is_finished());
        timers.one_shots.push(task);
    }

    /// Count of live timers (heartbeat + pending one-shots).
    pub fn pending_timers(&self) -> usize {
        let timers = lock(&self.shared.timers);
        timers.heartbeat.iter().filter(|h| !h.is_finished()).count()
            + timers.one_shots.iter().filter(|h| !h.is_finished()).count()
    }

    /// Stop measurement, cancel all timers, and release the link.
    ///
    /// After a link loss the link is still released.  Idempotent: a second
    /// call returns `Ok(())` without touching the link.
    pub async fn disconnect(&self) -> Result<(), ConnectionError> {
        if self.shared.released.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.shared.cancel_timers();

        let was_connected = self.shared.state().is_connected();
        self.shared.advance(LinkState::Disconnected);

        if was_connected {
            if let Err(e) = self.stop().await {
                debug!("stop-measurement during disconnect failed: {e}");
            }
        }
        let released = self.link.release().await;
        self.shared.cancel_background();
        self.shared.report_disconnect(DisconnectCause::Requested);
        info!("{}: disconnected", self.device_name);
        released
    }
}

async fn write_frame(
    link: &dyn BeltLink,
    kind: CommandKind,
    timeout_ms: u64,
) -> Result<(), ConnectionError> {
    let frame = build_command(kind);
    debug!("write {kind:?}: {frame:02x?}");
    tokio::time::timeout(Duration::from_millis(timeout_ms), link.write(frame))
        .await
        .map_err(|_| ConnectionError::Timeout {
            operation: "command write",
            secs: timeout_ms.div_ceil(1000),
        })?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{START_MEASUREMENT_COMMAND, STOP_MEASUREMENT_COMMAND};

    #[derive(Default)]
    struct RecordingLink {
        writes: Mutex<Vec<(tokio::time::Instant, Vec<u8>)>>,
        releases: AtomicU64,
    }

    impl RecordingLink {
        fn frames(&self) -> Vec<Vec<u8>> {
            lock(&self.writes).iter().map(|(_, f)| f.clone()).collect()
        }
    }

    impl BeltLink for RecordingLink {
        fn write(&self, frame: Vec<u8>) -> BoxFuture<'_, Result<(), ConnectionError>> {
            Box::pin(async move {
                lock(&self.writes).push((tokio::time::Instant::now(), frame));
                Ok(())
            })
        }
        fn release(&self) -> BoxFuture<'_, Result<(), ConnectionError>> {
            Box::pin(async move {
                self.releases.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        }
        fn is_connected(&self) -> BoxFuture<'_, bool> {
            Box::pin(async { true })
        }
    }

    fn handle_with(link: Arc<RecordingLink>) -> (EventReceiver<BeltEvent>, BeltHandle) {
        BeltHandle::from_link(link, BeltClientConfig::default(), ForceDecoder::default(), "GDX-RB test")
    }

    #[test]
    fn state_machine_edges() {
        use LinkState::*;
        assert!(Disconnected.can_transition_to(Scanning));
        assert!(Scanning.can_transition_to(Connecting));
        assert!(Subscribed.can_transition_to(Streaming));
        assert!(Streaming.can_transition_to(Disconnected));
        assert!(Scanning.can_transition_to(Disconnected));
        assert!(!Disconnected.can_transition_to(Streaming));
        assert!(!Streaming.can_transition_to(Scanning));
        assert!(!Subscribed.can_transition_to(Connecting));
    }

    #[tokio::test(start_paused = true)]
    async fn startup_sequence_is_spaced() {
        let link = Arc::new(RecordingLink::default());
        let (_rx, handle) = handle_with(Arc::clone(&link));
        handle.start().await.unwrap();

        let writes = lock(&link.writes).clone();
        assert_eq!(writes.len(), 3);
        assert_eq!(writes[0].1, build_command(CommandKind::EnableSensor));
        assert_eq!(writes[1].1, build_command(CommandKind::SetSamplePeriod(100)));
        assert_eq!(writes[2].1, START_MEASUREMENT_COMMAND.to_vec());
        for pair in writes.windows(2) {
            assert!(pair[1].0 - pair[0].0 >= Duration::from_millis(500));
        }
        assert_eq!(handle.link_state(), LinkState::Streaming);
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_reissues_start_and_stops_on_disconnect() {
        let link = Arc::new(RecordingLink::default());
        let (mut rx, handle) = handle_with(Arc::clone(&link));
        handle.start().await.unwrap();
        handle.start_heartbeat();
        handle.start_heartbeat();
        assert!(handle.heartbeat_active());

        tokio::time::sleep(Duration::from_millis(9_500)).await;
        let keep_alives = link
            .frames()
            .iter()
            .filter(|f| **f == START_MEASUREMENT_COMMAND.to_vec())
            .count();
        // one from start() + three heartbeats (3 s, 6 s, 9 s)
        assert_eq!(keep_alives, 4);

        handle.disconnect().await.unwrap();
        assert_eq!(handle.pending_timers(), 0);
        let after = link.frames().len();
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(link.frames().len(), after);
        assert_eq!(link.frames().last().unwrap(), &STOP_MEASUREMENT_COMMAND.to_vec());

        assert!(matches!(rx.recv().await, Some(BeltEvent::Connected(_))));
        assert!(matches!(
            rx.recv().await,
            Some(BeltEvent::Disconnected(DisconnectCause::Requested))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_is_idempotent() {
        let link = Arc::new(RecordingLink::default());
        let (_rx, handle) = handle_with(Arc::clone(&link));
        handle.disconnect().await.unwrap();
        handle.disconnect().await.unwrap();
        assert_eq!(link.releases.load(Ordering::SeqCst), 1);
        assert_eq!(handle.link_state(), LinkState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn link_loss_cancels_timers_and_notifies_once() {
        let link = Arc::new(RecordingLink::default());
        let (mut rx, handle) = handle_with(Arc::clone(&link));
        handle.start().await.unwrap();
        handle.start_heartbeat();
        handle.arm_stream_watchdog();
        assert_eq!(handle.pending_timers(), 2);

        let router = handle.router();
        router.link_lost();
        router.link_lost();
        assert_eq!(handle.pending_timers(), 0);
        assert!(!handle.is_connected());

        let mut disconnects = 0;
        while let Some(ev) = rx.try_recv() {
            if let BeltEvent::Disconnected(cause) = ev {
                assert_eq!(cause, DisconnectCause::LinkLost);
                disconnects += 1;
            }
        }
        assert_eq!(disconnects, 1);

        // Teardown after loss still releases the link exactly once.
        let writes_before = link.frames().len();
        handle.disconnect().await.unwrap();
        handle.disconnect().await.unwrap();
        assert_eq!(link.releases.load(Ordering::SeqCst), 1);
        assert_eq!(link.frames().len(), writes_before);
        assert!(rx.try_recv().is_none());
    }

    fn notification(value: Vec<u8>) -> ValueNotification {
        ValueNotification {
            uuid: RESPONSE_CHARACTERISTIC,
            value,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn link_loss_stops_the_dispatcher() {
        let link = Arc::new(RecordingLink::default());
        let (mut rx, handle) = handle_with(Arc::clone(&link));
        let (notif_tx, notif_rx) = futures::channel::mpsc::unbounded();
        let dispatcher = spawn_dispatcher(handle.router(), notif_rx);
        lock(&handle.shared.timers).background.push(dispatcher);

        notif_tx.unbounded_send(notification(vec![0x00, 0x80, 0x00, 0x00])).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(handle.sample_count(), 1);

        // The adapter reports the loss while the stream is still open.
        handle.router().link_lost();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(lock(&handle.shared.timers).background.is_empty());
        assert!(notif_tx.unbounded_send(notification(vec![0x00, 0x81])).is_err());
        assert_eq!(handle.sample_count(), 1);

        assert!(matches!(rx.try_recv(), Some(BeltEvent::Connected(_))));
        assert!(matches!(rx.try_recv(), Some(BeltEvent::Sample { .. })));
        assert!(matches!(
            rx.try_recv(),
            Some(BeltEvent::Disconnected(DisconnectCause::LinkLost))
        ));
        assert!(rx.try_recv().is_none());
    }

    #[test]
    fn a_new_attempt_is_isolated_from_the_previous_link() {
        let client = BeltClient::new(BeltClientConfig::default());
        let first = client.begin_attempt().unwrap();
        // An attempt that never got a connection is reused.
        assert!(Arc::ptr_eq(&first, &client.begin_attempt().unwrap()));

        first.advance(LinkState::Connecting);
        assert!(matches!(client.begin_attempt(), Err(ConnectionError::Adapter(_))));
        first.advance(LinkState::ServiceDiscovery);
        let (tx, _rx) = event_queue::<BeltEvent>(8);
        first.attach(tx);
        first.advance(LinkState::Subscribed);
        assert!(first.report_disconnect(DisconnectCause::LinkLost));

        let second = client.begin_attempt().unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        second.advance(LinkState::Connecting);
        second.advance(LinkState::ServiceDiscovery);
        let (tx, mut rx) = event_queue::<BeltEvent>(8);
        second.attach(tx);
        second.advance(LinkState::Subscribed);

        // A late report from the old link's tasks reaches only the old state.
        let stale = NotificationRouter {
            shared: Arc::clone(&first),
            decoder: Arc::new(ForceDecoder::default()),
        };
        stale.link_lost();
        stale.route(vec![0x00, 0x80]);
        assert!(rx.try_recv().is_none());
        assert_eq!(second.state(), LinkState::Subscribed);
        assert_eq!(client.link_state(), LinkState::Subscribed);
    }

    #[tokio::test(start_paused = true)]
    async fn watchdog_resends_startup_when_silent() {
        let link = Arc::new(RecordingLink::default());
        let (_rx, handle) = handle_with(Arc::clone(&link));
        handle.start().await.unwrap();
        handle.arm_stream_watchdog();
        tokio::time::sleep(Duration::from_secs(6)).await;
        let frames = link.frames();
        assert_eq!(frames.len(), 5);
        assert_eq!(frames[3], build_command(CommandKind::EnableSensor));
        assert_eq!(frames[4], START_MEASUREMENT_COMMAND.to_vec());
    }

    #[tokio::test(start_paused = true)]
    async fn watchdog_stays_quiet_when_data_flows() {
        let link = Arc::new(RecordingLink::default());
        let (_rx, handle) = handle_with(Arc::clone(&link));
        handle.start().await.unwrap();
        handle.arm_stream_watchdog();
        handle.router().route(vec![0x00, 0x80]);
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(link.frames().len(), 3);
    }

    #[tokio::test]
    async fn router_emits_samples_and_keeps_bounded_history() {
        let link = Arc::new(RecordingLink::default());
        let config = BeltClientConfig { raw_history: 4, ..Default::default() };
        let (mut rx, handle) =
            BeltHandle::from_link(link, config, ForceDecoder::default(), "GDX-RB test");
        let router = handle.router();
        for i in 0..10u8 {
            router.route(vec![0x00, i]);
        }
        router.route(vec![0x00, 0x00]);
        router.route(vec![0x20, 0x55, 0x01]);

        assert!(matches!(rx.recv().await, Some(BeltEvent::Connected(_))));
        // i = 0 packet is all-zero and undecodable but still delivered
        match rx.recv().await {
            Some(BeltEvent::Sample { force, .. }) => assert!(force.is_none()),
            other => panic!("unexpected {other:?}"),
        }
        match rx.recv().await {
            Some(BeltEvent::Sample { force: Some(f), .. }) => assert!((f.value - 0.01).abs() < 1e-6),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(handle.recent_raw().len(), 4);
        assert_eq!(handle.sample_count(), 12);
        let mut saw_response = false;
        while let Some(ev) = rx.try_recv() {
            if matches!(ev, BeltEvent::CommandResponse(_)) {
                saw_response = true;
            }
        }
        assert!(saw_response);
    }
}
