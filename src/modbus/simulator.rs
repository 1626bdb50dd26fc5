/// In-memory Modbus bus for running the bridge without hardware
///
/// `SimulatedBus` implements [`ModbusTransport`] over a set of simulated
/// slaves, each with its own holding register bank. Clones share state, so a
/// test can keep a handle while the client owns the transport.
use async_trait::async_trait;
use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tracing::{debug, info};

use crate::error::{BridgeError, BridgeResult};
use crate::modbus::protocol::{
    ModbusException, ModbusFunction, ModbusRequest, ModbusResponse, SlaveId, MAX_READ_REGISTERS, MAX_WRITE_REGISTERS,
};
use crate::modbus::transport::{ModbusTransport, TransportStats};

/// Holding registers of one simulated slave
#[derive(Debug, Clone)]
struct RegisterBank {
    registers: Vec<u16>,
}

impl RegisterBank {
    fn new(size: u16) -> Self {
        Self {
            registers: vec![0; size as usize],
        }
    }

    fn range(&self, address: u16, quantity: u16) -> Option<std::ops::Range<usize>> {
        let start = address as usize;
        let end = start + quantity as usize;
        (end <= self.registers.len()).then_some(start..end)
    }
}

#[derive(Default)]
struct SimState {
    slaves: RwLock<HashMap<SlaveId, RegisterBank>>,
    offline: RwLock<HashSet<SlaveId>>,
    link_down: AtomicBool,
    closed: AtomicBool,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    transactions: Mutex<Vec<ModbusRequest>>,
    stats: Mutex<TransportStats>,
}

/// Simulated RTU line with any number of slaves
#[derive(Clone)]
pub struct SimulatedBus {
    state: Arc<SimState>,
    response_delay: Duration,
    error_rate: f64,
}

impl Default for SimulatedBus {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedBus {
    pub fn new() -> Self {
        Self {
            state: Arc::new(SimState::default()),
            response_delay: Duration::ZERO,
            error_rate: 0.0,
        }
    }

    /// Add a slave exposing `size` holding registers starting at address 0
    pub fn with_slave(self, slave_id: SlaveId, size: u16) -> Self {
        if let Ok(mut slaves) = self.state.slaves.write() {
            slaves.insert(slave_id, RegisterBank::new(size));
        }
        self
    }

    /// Delay every transaction, like a slow line
    pub fn with_response_delay(mut self, delay: Duration) -> Self {
        self.response_delay = delay;
        self
    }

    /// Answer a fraction of requests with a slave device failure
    pub fn with_error_rate(mut self, rate: f64) -> Self {
        self.error_rate = rate.clamp(0.0, 1.0);
        info!("Simulated error rate {:.1}%", self.error_rate * 100.0);
        self
    }

    pub fn set_register(&self, slave_id: SlaveId, address: u16, value: u16) -> BridgeResult<()> {
        let mut slaves = self
            .state
            .slaves
            .write()
            .map_err(|_| BridgeError::internal("simulated slaves lock poisoned"))?;
        let bank = slaves
            .get_mut(&slave_id)
            .ok_or_else(|| BridgeError::invalid_data(format!("No simulated slave {}", slave_id)))?;
        let range = bank
            .range(address, 1)
            .ok_or_else(|| BridgeError::invalid_address(address, 1))?;
        bank.registers[range.start] = value;
        Ok(())
    }

    pub fn registers(&self, slave_id: SlaveId, address: u16, quantity: u16) -> Option<Vec<u16>> {
        let slaves = self.state.slaves.read().ok()?;
        let bank = slaves.get(&slave_id)?;
        bank.range(address, quantity).map(|range| bank.registers[range].to_vec())
    }

    /// Stop a slave from answering; requests to it time out
    pub fn set_offline(&self, slave_id: SlaveId, offline: bool) {
        if let Ok(mut set) = self.state.offline.write() {
            if offline {
                set.insert(slave_id);
            } else {
                set.remove(&slave_id);
            }
        }
    }

    /// Make every following request fail with an I/O error, like an unplugged adapter
    pub fn break_link(&self) {
        self.state.link_down.store(true, Ordering::SeqCst);
    }

    /// Highest number of transactions ever observed in progress at once
    pub fn max_in_flight(&self) -> usize {
        self.state.max_in_flight.load(Ordering::SeqCst)
    }

    /// Every request that reached the bus, in order
    pub fn transactions(&self) -> Vec<ModbusRequest> {
        self.state
            .transactions
            .lock()
            .map(|log| log.clone())
            .unwrap_or_default()
    }

    fn process(&self, request: &ModbusRequest) -> BridgeResult<ModbusResponse> {
        let is_offline = self
            .state
            .offline
            .read()
            .map(|set| set.contains(&request.slave_id))
            .unwrap_or(false);
        if is_offline {
            return Err(BridgeError::timeout(
                format!("response from slave {}", request.slave_id),
                self.response_delay.as_millis() as u64,
            ));
        }

        if self.error_rate > 0.0 && rand::thread_rng().gen_bool(self.error_rate) {
            return Ok(ModbusResponse::new_exception(
                request.slave_id,
                request.function,
                ModbusException::ServerDeviceFailure.to_u8(),
            ));
        }

        let mut slaves = self
            .state
            .slaves
            .write()
            .map_err(|_| BridgeError::internal("simulated slaves lock poisoned"))?;
        let bank = match slaves.get_mut(&request.slave_id) {
            Some(bank) => bank,
            None => {
                return Err(BridgeError::timeout(
                    format!("response from slave {}", request.slave_id),
                    self.response_delay.as_millis() as u64,
                ))
            }
        };

        let exception = |code: ModbusException| {
            Ok(ModbusResponse::new_exception(
                request.slave_id,
                request.function,
                code.to_u8(),
            ))
        };

        match request.function {
            ModbusFunction::ReadHoldingRegisters => {
                if request.quantity == 0 || request.quantity > MAX_READ_REGISTERS {
                    return exception(ModbusException::IllegalDataValue);
                }
                let range = match bank.range(request.address, request.quantity) {
                    Some(range) => range,
                    None => return exception(ModbusException::IllegalDataAddress),
                };
                let mut data = vec![(request.quantity * 2) as u8];
                for value in &bank.registers[range] {
                    data.extend_from_slice(&value.to_be_bytes());
                }
                debug!(
                    "Simulated slave {} read {} registers @{}",
                    request.slave_id, request.quantity, request.address
                );
                Ok(ModbusResponse::new_success(request.slave_id, request.function, data))
            }
            ModbusFunction::WriteSingleRegister => {
                if request.data.len() < 2 {
                    return exception(ModbusException::IllegalDataValue);
                }
                let range = match bank.range(request.address, 1) {
                    Some(range) => range,
                    None => return exception(ModbusException::IllegalDataAddress),
                };
                bank.registers[range.start] = u16::from_be_bytes([request.data[0], request.data[1]]);

                let mut echo = request.address.to_be_bytes().to_vec();
                echo.extend_from_slice(&request.data[..2]);
                Ok(ModbusResponse::new_success(request.slave_id, request.function, echo))
            }
            ModbusFunction::WriteMultipleRegisters => {
                if request.quantity == 0
                    || request.quantity > MAX_WRITE_REGISTERS
                    || request.data.len() < request.quantity as usize * 2
                {
                    return exception(ModbusException::IllegalDataValue);
                }
                let range = match bank.range(request.address, request.quantity) {
                    Some(range) => range,
                    None => return exception(ModbusException::IllegalDataAddress),
                };
                for (slot, pair) in bank.registers[range].iter_mut().zip(request.data.chunks_exact(2)) {
                    *slot = u16::from_be_bytes([pair[0], pair[1]]);
                }

                let mut echo = request.address.to_be_bytes().to_vec();
                echo.extend_from_slice(&request.quantity.to_be_bytes());
                Ok(ModbusResponse::new_success(request.slave_id, request.function, echo))
            }
        }
    }

    fn update_stats(&self, update: impl FnOnce(&mut TransportStats)) {
        if let Ok(mut stats) = self.state.stats.lock() {
            update(&mut stats);
        }
    }
}

#[async_trait]
impl ModbusTransport for SimulatedBus {
    async fn request(&mut self, request: &ModbusRequest) -> BridgeResult<ModbusResponse> {
        if self.state.closed.load(Ordering::SeqCst) {
            return Err(BridgeError::not_connected("Simulated bus closed"));
        }
        if self.state.link_down.load(Ordering::SeqCst) {
            self.update_stats(|stats| stats.errors += 1);
            return Err(BridgeError::io("Simulated link down"));
        }
        request.validate()?;

        let current = self.state.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.state.max_in_flight.fetch_max(current, Ordering::SeqCst);
        if let Ok(mut log) = self.state.transactions.lock() {
            log.push(request.clone());
        }
        self.update_stats(|stats| stats.requests_sent += 1);

        if !self.response_delay.is_zero() {
            tokio::time::sleep(self.response_delay).await;
        }
        let result = self.process(request);
        self.state.in_flight.fetch_sub(1, Ordering::SeqCst);

        match result {
            Ok(response) => match response.exception_code {
                Some(code) => {
                    self.update_stats(|stats| stats.errors += 1);
                    Err(BridgeError::exception(response.function.to_u8(), code))
                }
                None => {
                    self.update_stats(|stats| stats.responses_received += 1);
                    Ok(response)
                }
            },
            Err(e) => {
                self.update_stats(|stats| {
                    stats.errors += 1;
                    if matches!(e, BridgeError::Timeout { .. }) {
                        stats.timeouts += 1;
                    }
                });
                Err(e)
            }
        }
    }

    fn is_connected(&self) -> bool {
        !self.state.closed.load(Ordering::SeqCst)
    }

    async fn close(&mut self) -> BridgeResult<()> {
        self.state.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn get_stats(&self) -> TransportStats {
        self.state
            .stats
            .lock()
            .map(|stats| stats.clone())
            .unwrap_or_default()
    }
}
