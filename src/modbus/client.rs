/// Modbus RTU master shared by the cyclic poller and the request worker
///
/// One serial line, two background loops:
///
/// - the cyclic poller sweeps the cycle-read slaves with read-holding-registers
///   while polling is enabled, and parks on the poll gate otherwise;
/// - the request worker drains the single-shot queue fed by [`RequestQueue`].
///
/// The line itself sits behind an async mutex, so at most one transaction is on
/// the wire. The poll gate adds priority on top: the worker and the direct
/// operations pause the gate for the duration of their transaction, and the
/// poller checks the gate before every slave, so a queued write is never stuck
/// behind a whole sweep.
///
/// Results are never returned to the caller. Successful outcomes go to the
/// registered [`ResponseHandler`]; failures are logged.
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::{BridgeConfig, SerialConfig};
use crate::error::{BridgeError, BridgeResult};
use crate::logging::CallbackLogger;
use crate::modbus::protocol::{
    ModbusAddress, ModbusValue, RegisterRequest, RegisterResponse, SlaveId, MAX_READ_REGISTERS,
};
use crate::modbus::transport::{ModbusTransport, RtuTransport, TransportStats};
use crate::utils::{validation, OperationTimer, PerformanceMetrics};

/// Time allowed for a background loop to finish its current transaction on disconnect
const TASK_JOIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Poller back-off when no slave is scheduled
const IDLE_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Receiver of successful register operations.
#[async_trait]
pub trait ResponseHandler: Send + Sync {
    async fn on_response(&self, response: RegisterResponse);
}

#[async_trait]
impl<F> ResponseHandler for F
where
    F: Fn(RegisterResponse) + Send + Sync,
{
    async fn on_response(&self, response: RegisterResponse) {
        self(response)
    }
}

/// Producer side of the single-shot request queue.
///
/// Cheap to clone. Enqueueing never blocks: when the queue is full, closed, or
/// the line is down the request is dropped with a warning.
#[derive(Clone)]
pub struct RequestQueue {
    tx: mpsc::Sender<RegisterRequest>,
    connected: Arc<AtomicBool>,
}

impl RequestQueue {
    /// Standalone queue that always reports the line as connected.
    pub fn bounded(capacity: usize) -> (Self, mpsc::Receiver<RegisterRequest>) {
        Self::with_link_flag(capacity, Arc::new(AtomicBool::new(true)))
    }

    fn with_link_flag(capacity: usize, connected: Arc<AtomicBool>) -> (Self, mpsc::Receiver<RegisterRequest>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx, connected }, rx)
    }

    /// Post a request; returns whether it was accepted.
    pub fn enqueue(&self, request: RegisterRequest) -> bool {
        if !self.connected.load(Ordering::SeqCst) {
            warn!("Dropping {}: serial line not connected", request);
            return false;
        }
        match self.tx.try_send(request) {
            Ok(()) => true,
            Err(TrySendError::Full(request)) => {
                warn!("Request queue full, dropping {}", request);
                false
            }
            Err(TrySendError::Closed(request)) => {
                warn!("Request queue closed, dropping {}", request);
                false
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct GateState {
    enabled: bool,
    paused: usize,
}

impl GateState {
    fn is_open(&self) -> bool {
        self.enabled && self.paused == 0
    }
}

/// Run flag for the cyclic poller.
///
/// `enabled` is the user's switch; `paused` counts transactions that asked the
/// poller to stand aside. Keeping them apart means a queued write finishing
/// never re-enables polling that the user turned off meanwhile.
struct PollGate {
    state: watch::Sender<GateState>,
}

impl PollGate {
    fn new() -> Self {
        let (state, _) = watch::channel(GateState::default());
        Self { state }
    }

    fn enable(&self) {
        self.state.send_modify(|state| state.enabled = true);
    }

    fn disable(&self) {
        self.state.send_modify(|state| state.enabled = false);
    }

    fn is_enabled(&self) -> bool {
        self.state.borrow().enabled
    }

    fn is_open(&self) -> bool {
        self.state.borrow().is_open()
    }

    fn pause(&self) -> PauseGuard<'_> {
        self.state.send_modify(|state| state.paused += 1);
        PauseGuard { gate: self }
    }

    /// Park until the gate opens. Returns `false` on shutdown.
    async fn wait_open(&self, shutdown: &mut watch::Receiver<bool>) -> bool {
        let mut state = self.state.subscribe();
        loop {
            if *shutdown.borrow() {
                return false;
            }
            if state.borrow_and_update().is_open() {
                return true;
            }
            tokio::select! {
                changed = state.changed() => {
                    if changed.is_err() {
                        return false;
                    }
                }
                _ = shutdown.changed() => {}
            }
        }
    }
}

struct PauseGuard<'a> {
    gate: &'a PollGate,
}

impl Drop for PauseGuard<'_> {
    fn drop(&mut self) {
        self.gate
            .state
            .send_modify(|state| state.paused = state.paused.saturating_sub(1));
    }
}

/// Slaves to poll and how many registers each exposes.
#[derive(Debug, Clone, Default)]
struct PollPlan {
    register_map: BTreeMap<SlaveId, u16>,
    cycle: Vec<SlaveId>,
}

impl PollPlan {
    fn targets(&self) -> Vec<(SlaveId, u16)> {
        self.cycle
            .iter()
            .filter_map(|slave| self.register_map.get(slave).map(|&count| (*slave, count)))
            .collect()
    }
}

struct ClientShared<T> {
    bus: AsyncMutex<Option<T>>,
    connected: Arc<AtomicBool>,
    gate: PollGate,
    shutdown: watch::Sender<bool>,
    requests: AsyncMutex<mpsc::Receiver<RegisterRequest>>,
    plan: RwLock<PollPlan>,
    handler: RwLock<Option<Arc<dyn ResponseHandler>>>,
    retries: u32,
    metrics: Mutex<PerformanceMetrics>,
}

impl<T: ModbusTransport> ClientShared<T> {
    /// One transaction on the line, with retries for recoverable failures.
    async fn transact(&self, request: &RegisterRequest) -> BridgeResult<RegisterResponse> {
        let wire = request.to_wire()?;
        let mut bus = self.bus.lock().await;
        let transport = bus
            .as_mut()
            .ok_or_else(|| BridgeError::not_connected("Serial line closed"))?;

        let mut attempt = 0;
        loop {
            let timer = OperationTimer::start(request.to_string());
            let result = match transport.request(&wire).await {
                Ok(response) => request.interpret(&response),
                Err(e) => Err(e),
            };
            let elapsed = timer.finish(result.is_ok());
            if let Ok(mut metrics) = self.metrics.lock() {
                metrics.record(elapsed, result.is_ok());
            }

            match result {
                Err(e) if attempt < self.retries && e.is_recoverable() && !e.is_link_failure() => {
                    attempt += 1;
                    debug!("Retrying {} ({}/{}): {}", request, attempt, self.retries, e);
                }
                Err(e) => {
                    if e.is_link_failure() {
                        self.connected.store(false, Ordering::SeqCst);
                    }
                    return Err(e);
                }
                ok => return ok,
            }
        }
    }

    async fn deliver(&self, response: RegisterResponse) {
        let handler = self.handler.read().ok().and_then(|handler| handler.clone());
        match handler {
            Some(handler) => handler.on_response(response).await,
            None => debug!("No response handler for slave {}", response.slave_id()),
        }
    }

    fn poll_targets(&self) -> Vec<(SlaveId, u16)> {
        self.plan.read().map(|plan| plan.targets()).unwrap_or_default()
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

/// Sleep unless shutdown arrives first. Returns `false` on shutdown.
async fn sleep_or_shutdown(duration: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(duration) => !*shutdown.borrow(),
        _ = shutdown.changed() => false,
    }
}

async fn poll_loop<T: ModbusTransport>(shared: Arc<ClientShared<T>>, interval: Duration) {
    let mut shutdown = shared.shutdown.subscribe();
    debug!("Cyclic polling task started");

    'sweeps: while shared.gate.wait_open(&mut shutdown).await {
        if !shared.is_connected() {
            break;
        }

        let targets = shared.poll_targets();
        if targets.is_empty() {
            if !sleep_or_shutdown(IDLE_POLL_INTERVAL, &mut shutdown).await {
                break;
            }
            continue;
        }

        for (slave_id, count) in targets {
            if !shared.gate.is_open() || *shutdown.borrow() {
                continue 'sweeps;
            }
            let request = RegisterRequest::read(slave_id, 0, count);
            match shared.transact(&request).await {
                Ok(response) => shared.deliver(response).await,
                Err(e) if e.is_link_failure() => {
                    error!("Cyclic polling stopped, serial line lost: {}", e);
                    break 'sweeps;
                }
                Err(e) => warn!("Cyclic read from slave {} failed: {}", slave_id, e),
            }
        }

        if interval.is_zero() {
            tokio::task::yield_now().await;
        } else if !sleep_or_shutdown(interval, &mut shutdown).await {
            break;
        }
    }

    debug!("Cyclic polling task stopped");
}

async fn worker_loop<T: ModbusTransport>(shared: Arc<ClientShared<T>>) {
    let mut shutdown = shared.shutdown.subscribe();
    let mut requests = shared.requests.lock().await;
    debug!("Request worker started");

    loop {
        if *shutdown.borrow() {
            break;
        }
        let request = tokio::select! {
            request = requests.recv() => match request {
                Some(request) => request,
                None => break,
            },
            _ = shutdown.changed() => continue,
        };

        if !shared.is_connected() {
            warn!("Dropping {}: serial line disconnected", request);
            break;
        }

        let result = {
            let _pause = shared.gate.pause();
            shared.transact(&request).await
        };
        match result {
            Ok(response) => shared.deliver(response).await,
            Err(e) if e.is_link_failure() => {
                error!("Request worker stopped, serial line lost: {}", e);
                break;
            }
            Err(e) => warn!("{} failed: {}", request, e),
        }
    }

    debug!("Request worker stopped");
}

/// Modbus RTU master with cyclic polling and a single-shot request queue.
///
/// Generic over the transport so the same client drives a real serial port
/// ([`RtuTransport`]) or a simulated bus.
pub struct ModbusRtuClient<T: ModbusTransport + 'static = RtuTransport> {
    serial: SerialConfig,
    probe_slave: Option<SlaveId>,
    probe_on_connect: bool,
    cycle_interval: Duration,
    logger: CallbackLogger,
    shared: Arc<ClientShared<T>>,
    queue: RequestQueue,
    tasks: Vec<JoinHandle<()>>,
}

impl ModbusRtuClient<RtuTransport> {
    /// Open the configured serial port and start both loops.
    pub async fn connect(&mut self) -> BridgeResult<()> {
        let transport = RtuTransport::open_with_logger(&self.serial, self.logger.clone())?;
        self.connect_with(transport).await
    }
}

impl<T: ModbusTransport + 'static> ModbusRtuClient<T> {
    pub fn new(config: &BridgeConfig) -> Self {
        let connected = Arc::new(AtomicBool::new(false));
        let (queue, requests) = RequestQueue::with_link_flag(config.queue_maxsize, connected.clone());
        let (shutdown, _) = watch::channel(false);
        let serial = config.serial();

        let shared = Arc::new(ClientShared {
            bus: AsyncMutex::new(None),
            connected,
            gate: PollGate::new(),
            shutdown,
            requests: AsyncMutex::new(requests),
            plan: RwLock::new(PollPlan {
                register_map: config.slaves_list.clone(),
                cycle: config.cycle_read_slaves_list.clone(),
            }),
            handler: RwLock::new(None),
            retries: serial.retries,
            metrics: Mutex::new(PerformanceMetrics::new()),
        });

        Self {
            serial,
            probe_slave: config.probe_slave(),
            probe_on_connect: config.probe_on_connect,
            cycle_interval: config.cycle_interval(),
            logger: CallbackLogger::disabled(),
            shared,
            queue,
            tasks: Vec::new(),
        }
    }

    /// Log every serial frame through `logger`.
    pub fn with_logger(mut self, logger: CallbackLogger) -> Self {
        self.logger = logger;
        self
    }

    /// Take ownership of an opened transport, probe it and start both loops.
    ///
    /// Cyclic polling starts disabled. Fails with `Connection` when a probe
    /// slave is configured and does not answer; the transport is closed then.
    pub async fn connect_with(&mut self, transport: T) -> BridgeResult<()> {
        if self.is_connected() {
            return Err(BridgeError::connection("Serial line already connected"));
        }
        self.reap_tasks().await;

        *self.shared.bus.lock().await = Some(transport);

        if self.probe_on_connect {
            if let Some(slave_id) = self.probe_slave {
                if let Err(e) = self.shared.transact(&RegisterRequest::read(slave_id, 0, 1)).await {
                    if let Some(mut transport) = self.shared.bus.lock().await.take() {
                        let _ = transport.close().await;
                    }
                    return Err(BridgeError::connection(format!(
                        "Slave {} did not answer connect probe: {}",
                        slave_id, e
                    )));
                }
            }
        }

        self.shared.gate.disable();
        self.shared.shutdown.send_replace(false);
        self.shared.connected.store(true, Ordering::SeqCst);

        let poller = tokio::spawn(poll_loop(self.shared.clone(), self.cycle_interval));
        let worker = tokio::spawn(worker_loop(self.shared.clone()));
        self.tasks = vec![poller, worker];

        info!("Connected to Modbus line {}", self.serial.port);
        Ok(())
    }

    /// Stop both loops and close the line.
    pub async fn disconnect(&mut self) -> BridgeResult<()> {
        self.shared.gate.disable();
        self.shared.shutdown.send_replace(true);
        self.reap_tasks().await;
        self.shared.connected.store(false, Ordering::SeqCst);

        let transport = self.shared.bus.lock().await.take();
        if let Some(mut transport) = transport {
            transport.close().await?;
            info!("Disconnected from Modbus line {}", self.serial.port);
        }
        Ok(())
    }

    async fn reap_tasks(&mut self) {
        for mut task in self.tasks.drain(..) {
            if tokio::time::timeout(TASK_JOIN_TIMEOUT, &mut task).await.is_err() {
                warn!("Background task did not stop in time, aborting");
                task.abort();
            }
        }
    }

    pub fn is_connected(&self) -> bool {
        self.shared.is_connected()
    }

    pub fn enable_cyclic_polling(&self) {
        self.shared.gate.enable();
        debug!("Cyclic polling enabled");
    }

    pub fn disable_cyclic_polling(&self) {
        self.shared.gate.disable();
        debug!("Cyclic polling disabled");
    }

    pub fn is_cyclic_polling_enabled(&self) -> bool {
        self.shared.gate.is_enabled()
    }

    pub fn set_response_handler(&self, handler: Arc<dyn ResponseHandler>) {
        if let Ok(mut slot) = self.shared.handler.write() {
            *slot = Some(handler);
        }
    }

    /// Handle for posting requests from other tasks.
    pub fn queue(&self) -> RequestQueue {
        self.queue.clone()
    }

    pub async fn read_holding_registers(&self, address: ModbusAddress, count: u16, slave_id: SlaveId) {
        self.execute_now(RegisterRequest::read(slave_id, address, count)).await
    }

    pub async fn write_register(&self, address: ModbusAddress, value: ModbusValue, slave_id: SlaveId) {
        self.execute_now(RegisterRequest::write_single(slave_id, address, value))
            .await
    }

    pub async fn write_registers(&self, address: ModbusAddress, values: Vec<ModbusValue>, slave_id: SlaveId) {
        self.execute_now(RegisterRequest::write_multiple(slave_id, address, values))
            .await
    }

    pub fn enqueue_read_holding_registers(&self, address: ModbusAddress, count: u16, slave_id: SlaveId) -> bool {
        self.queue.enqueue(RegisterRequest::read(slave_id, address, count))
    }

    pub fn enqueue_write_register(&self, address: ModbusAddress, value: ModbusValue, slave_id: SlaveId) -> bool {
        self.queue
            .enqueue(RegisterRequest::write_single(slave_id, address, value))
    }

    pub fn enqueue_write_registers(&self, address: ModbusAddress, values: Vec<ModbusValue>, slave_id: SlaveId) -> bool {
        self.queue
            .enqueue(RegisterRequest::write_multiple(slave_id, address, values))
    }

    /// Run one request immediately, ahead of the cyclic sweep.
    async fn execute_now(&self, request: RegisterRequest) {
        if !self.is_connected() {
            warn!("Skipping {}: serial line not connected", request);
            return;
        }
        let result = {
            let _pause = self.shared.gate.pause();
            self.shared.transact(&request).await
        };
        match result {
            Ok(response) => self.shared.deliver(response).await,
            Err(e) => warn!("{} failed: {}", request, e),
        }
    }

    /// Set how many registers are polled from `slave_id`.
    pub fn set_register_count(&self, slave_id: SlaveId, count: u16) -> BridgeResult<()> {
        validation::validate_slave_id(slave_id)?;
        validation::validate_register_count(count, MAX_READ_REGISTERS)?;
        self.update_plan(|plan| {
            plan.register_map.insert(slave_id, count);
        })
    }

    pub fn set_cycle_read_slaves(&self, slaves: Vec<SlaveId>) -> BridgeResult<()> {
        for &slave_id in &slaves {
            validation::validate_slave_id(slave_id)?;
        }
        self.update_plan(|plan| plan.cycle = slaves)
    }

    pub fn add_cycle_read_slave(&self, slave_id: SlaveId) -> BridgeResult<()> {
        validation::validate_slave_id(slave_id)?;
        self.update_plan(|plan| {
            if !plan.cycle.contains(&slave_id) {
                plan.cycle.push(slave_id);
            }
        })
    }

    pub fn remove_cycle_read_slave(&self, slave_id: SlaveId) -> BridgeResult<()> {
        self.update_plan(|plan| plan.cycle.retain(|&slave| slave != slave_id))
    }

    fn update_plan(&self, update: impl FnOnce(&mut PollPlan)) -> BridgeResult<()> {
        let mut plan = self
            .shared
            .plan
            .write()
            .map_err(|_| BridgeError::internal("poll plan lock poisoned"))?;
        update(&mut plan);
        Ok(())
    }

    pub fn register_map(&self) -> BTreeMap<SlaveId, u16> {
        self.shared
            .plan
            .read()
            .map(|plan| plan.register_map.clone())
            .unwrap_or_default()
    }

    pub fn cycle_read_slaves(&self) -> Vec<SlaveId> {
        self.shared
            .plan
            .read()
            .map(|plan| plan.cycle.clone())
            .unwrap_or_default()
    }

    pub fn metrics(&self) -> PerformanceMetrics {
        self.shared
            .metrics
            .lock()
            .map(|metrics| metrics.clone())
            .unwrap_or_default()
    }

    pub async fn transport_stats(&self) -> Option<TransportStats> {
        self.shared.bus.lock().await.as_ref().map(|transport| transport.get_stats())
    }
}
