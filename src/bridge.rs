//! Glue between the FDX session and the Modbus client.
//!
//! Outbound, every holding-register snapshot read from slave `S` is packed as
//! big-endian words and sent as a data-exchange for group `S`. Inbound,
//! data-exchange commands on the two configured write groups become Modbus
//! writes on the request queue:
//!
//! | group | payload (frame byte order) |
//! |---|---|
//! | `write_register_command_fdx_group_id` | slave, address, value |
//! | `write_registers_command_fdx_group_id` | slave, address, count, `count` values |
//!
//! A write identical to the last one forwarded for its group is dropped, since
//! the simulation resends unchanged groups on every free-running cycle.

use async_trait::async_trait;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{watch, Mutex as AsyncMutex};
use tracing::{debug, info, trace, warn};

use crate::config::{BridgeConfig, FreeRunningConfig};
use crate::error::{BridgeError, BridgeResult};
use crate::fdx::protocol::{DataError, DataExchange, FdxByteOrder, SequenceNumberError, StatusCommand};
use crate::fdx::session::{CommandContext, FdxCommandHandler, FdxSession};
use crate::fdx::transport::FdxTransport;
use crate::modbus::client::{RequestQueue, ResponseHandler};
use crate::modbus::protocol::{RegisterRequest, RegisterResponse, SlaveId, MAX_WRITE_REGISTERS};
use crate::utils::{registers_to_bytes, validation};

/// Size of the (slave, address, value) and (slave, address, count) prefixes.
const WRITE_HEADER_SIZE: usize = 6;

/// Single-register write carried by the write-register group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SingleWrite {
    pub slave_id: SlaveId,
    pub address: u16,
    pub value: u16,
}

impl SingleWrite {
    pub fn decode(data: &[u8], order: FdxByteOrder) -> BridgeResult<Self> {
        if data.len() < WRITE_HEADER_SIZE {
            return Err(BridgeError::invalid_data(format!(
                "Write-register payload needs {} bytes, got {}",
                WRITE_HEADER_SIZE,
                data.len()
            )));
        }
        Ok(Self {
            slave_id: validation::slave_id_from_u16(order.read_u16(&data[0..2]))?,
            address: order.read_u16(&data[2..4]),
            value: order.read_u16(&data[4..6]),
        })
    }

    pub fn to_request(&self) -> RegisterRequest {
        RegisterRequest::write_single(self.slave_id, self.address, self.value)
    }
}

/// Multi-register write carried by the write-registers group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultiWrite {
    pub slave_id: SlaveId,
    pub address: u16,
    pub values: Vec<u16>,
}

impl MultiWrite {
    pub fn decode(data: &[u8], order: FdxByteOrder) -> BridgeResult<Self> {
        if data.len() < WRITE_HEADER_SIZE {
            return Err(BridgeError::invalid_data(format!(
                "Write-registers payload needs at least {} bytes, got {}",
                WRITE_HEADER_SIZE,
                data.len()
            )));
        }
        let slave_id = validation::slave_id_from_u16(order.read_u16(&data[0..2]))?;
        let address = order.read_u16(&data[2..4]);
        let count = order.read_u16(&data[4..6]);
        validation::validate_register_count(count, MAX_WRITE_REGISTERS)?;

        let needed = WRITE_HEADER_SIZE + count as usize * 2;
        if data.len() < needed {
            return Err(BridgeError::invalid_data(format!(
                "Write-registers payload declares {} registers but carries {} bytes",
                count,
                data.len()
            )));
        }

        let values = data[WRITE_HEADER_SIZE..needed]
            .chunks_exact(2)
            .map(|pair| order.read_u16(pair))
            .collect();
        Ok(Self {
            slave_id,
            address,
            values,
        })
    }

    pub fn to_request(&self) -> RegisterRequest {
        RegisterRequest::write_multiple(self.slave_id, self.address, self.values.clone())
    }
}

/// Forward `write` unless it equals the cached one; the cache moves only when the queue accepts.
fn forward_unless_repeated<W: PartialEq + Clone>(
    cache: &Mutex<Option<W>>,
    write: W,
    queue: &RequestQueue,
    request: impl FnOnce(&W) -> RegisterRequest,
) -> bool {
    let mut last = cache.lock().unwrap_or_else(PoisonError::into_inner);
    if last.as_ref() == Some(&write) {
        return false;
    }
    if queue.enqueue(request(&write)) {
        *last = Some(write);
        true
    } else {
        false
    }
}

/// FDX <-> Modbus bridge.
pub struct Bridge {
    session: AsyncMutex<FdxSession>,
    transport: Arc<FdxTransport>,
    queue: RequestQueue,
    write_register_group: Option<u16>,
    write_registers_group: Option<u16>,
    free_running: FreeRunningConfig,
    last_single: Mutex<Option<SingleWrite>>,
    last_multi: Mutex<Option<MultiWrite>>,
    status: watch::Sender<Option<StatusCommand>>,
}

impl Bridge {
    pub fn new(config: &BridgeConfig, transport: Arc<FdxTransport>, queue: RequestQueue) -> Self {
        let session = FdxSession::new(config.fdx.transport, config.fdx.version(), config.fdx.byte_order)
            .with_max_frame_size(config.fdx.max_frame_size);
        let (status, _) = watch::channel(None);

        Self {
            session: AsyncMutex::new(session),
            transport,
            queue,
            write_register_group: config.write_register_command_fdx_group_id,
            write_registers_group: config.write_registers_command_fdx_group_id,
            free_running: config.fdx.free_running.clone(),
            last_single: Mutex::new(None),
            last_multi: Mutex::new(None),
            status,
        }
    }

    pub fn transport(&self) -> &Arc<FdxTransport> {
        &self.transport
    }

    fn write_groups(&self) -> Vec<u16> {
        self.write_register_group
            .into_iter()
            .chain(self.write_registers_group)
            .collect()
    }

    /// Build one frame with `build` and send it.
    ///
    /// The session stays locked until the frame is on the wire, so frames
    /// leave in sequence-number order.
    async fn send_with<F>(&self, build: F) -> BridgeResult<()>
    where
        F: FnOnce(&mut FdxSession) -> BridgeResult<()> + Send,
    {
        let mut session = self.session.lock().await;
        if let Err(e) = build(&mut session) {
            session.take_frame();
            return Err(e);
        }
        let frame = session
            .take_frame()
            .ok_or_else(|| BridgeError::internal("No FDX frame was built"))?;
        self.transport.send(&frame).await
    }

    /// Open the FDX transport, start receiving and subscribe to the write groups.
    pub async fn open(self: &Arc<Self>) -> BridgeResult<()> {
        self.transport.open().await?;
        self.transport.start_receiving(self.clone())?;

        let groups = self.write_groups();
        if self.free_running.enabled && !groups.is_empty() {
            let config = &self.free_running;
            self.send_with(|session| {
                for (index, &group_id) in groups.iter().enumerate() {
                    session.free_running_request(
                        group_id,
                        config.flags,
                        config.cycle_time,
                        config.first_duration,
                        index > 0,
                    )?;
                }
                Ok(())
            })
            .await?;
            info!("Requested free-running transmission for groups {:?}", groups);
        }
        Ok(())
    }

    /// Cancel the free-running subscriptions and close the FDX transport.
    pub async fn close(&self) -> BridgeResult<()> {
        let groups = self.write_groups();
        if self.free_running.enabled && !groups.is_empty() && self.transport.is_open() {
            let cancelled = self
                .send_with(|session| {
                    for (index, &group_id) in groups.iter().enumerate() {
                        session.free_running_cancel(group_id, index > 0)?;
                    }
                    Ok(())
                })
                .await;
            if let Err(e) = cancelled {
                warn!("Could not cancel free-running groups {:?}: {}", groups, e);
            }
        }
        self.transport.close().await
    }

    /// Send a register snapshot of `slave_id` as data-exchange group `slave_id`.
    pub async fn publish_registers(&self, slave_id: SlaveId, values: &[u16]) -> BridgeResult<()> {
        let data = registers_to_bytes(values);
        self.send_with(|session| session.data_exchange(slave_id as u16, &data, false))
            .await
    }

    pub async fn start_measurement(&self) -> BridgeResult<()> {
        self.send_with(|session| session.start(false)).await
    }

    pub async fn stop_measurement(&self) -> BridgeResult<()> {
        self.send_with(|session| session.stop(false)).await
    }

    /// Ask the peer for its measurement state; the answer arrives on [`Bridge::status_updates`].
    pub async fn request_status(&self) -> BridgeResult<()> {
        self.send_with(|session| session.status_request(false)).await
    }

    pub fn status_updates(&self) -> watch::Receiver<Option<StatusCommand>> {
        self.status.subscribe()
    }

    /// Queue a single write regardless of what the simulation last sent.
    pub fn write_register_manually(&self, slave_id: SlaveId, address: u16, value: u16) -> bool {
        self.queue
            .enqueue(RegisterRequest::write_single(slave_id, address, value))
    }

    /// Turn a data-exchange on one of the write groups into a queued Modbus write.
    ///
    /// Returns whether a request was enqueued.
    pub fn apply_write_group(&self, exchange: &DataExchange, order: FdxByteOrder) -> bool {
        let group_id = exchange.group_id;

        if Some(group_id) == self.write_register_group {
            return match SingleWrite::decode(&exchange.data, order) {
                Ok(write) => {
                    let forwarded = forward_unless_repeated(&self.last_single, write, &self.queue, SingleWrite::to_request);
                    if !forwarded {
                        trace!("Write-register group {} unchanged", group_id);
                    }
                    forwarded
                }
                Err(e) => {
                    warn!("Ignoring write-register group {}: {}", group_id, e);
                    false
                }
            };
        }

        if Some(group_id) == self.write_registers_group {
            return match MultiWrite::decode(&exchange.data, order) {
                Ok(write) => {
                    let forwarded = forward_unless_repeated(&self.last_multi, write, &self.queue, MultiWrite::to_request);
                    if !forwarded {
                        trace!("Write-registers group {} unchanged", group_id);
                    }
                    forwarded
                }
                Err(e) => {
                    warn!("Ignoring write-registers group {}: {}", group_id, e);
                    false
                }
            };
        }

        false
    }
}

#[async_trait]
impl ResponseHandler for Bridge {
    async fn on_response(&self, response: RegisterResponse) {
        match response {
            RegisterResponse::HoldingRegisters { slave_id, values, .. } => {
                if let Err(e) = self.publish_registers(slave_id, &values).await {
                    warn!("Could not publish registers of slave {}: {}", slave_id, e);
                }
            }
            other => debug!("Slave {} acknowledged write: {:?}", other.slave_id(), other),
        }
    }
}

#[async_trait]
impl FdxCommandHandler for Bridge {
    async fn on_status(&self, _ctx: &CommandContext, status: StatusCommand) {
        info!(
            "Measurement state {:?} at {} ns",
            status.state, status.timestamp_ns
        );
        self.status.send_replace(Some(status));
    }

    async fn on_data_exchange(&self, ctx: &CommandContext, exchange: DataExchange) {
        if !self.apply_write_group(&exchange, ctx.byte_order) {
            trace!("Data exchange for group {} not forwarded", exchange.group_id);
        }
    }

    async fn on_data_error(&self, _ctx: &CommandContext, error: DataError) {
        warn!("Peer reported data error {} for group {}", error.error_code, error.group_id);
    }

    async fn on_sequence_number_error(&self, _ctx: &CommandContext, error: SequenceNumberError) {
        warn!(
            "Peer reported sequence error: received {}, expected {}",
            error.received, error.expected
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn bridge_with_queue(capacity: usize) -> (Bridge, tokio::sync::mpsc::Receiver<RegisterRequest>) {
        let mut config = BridgeConfig::default();
        config.write_register_command_fdx_group_id = Some(100);
        config.write_registers_command_fdx_group_id = Some(101);
        let (queue, rx) = RequestQueue::bounded(capacity);
        let transport = Arc::new(FdxTransport::new(&config.fdx));
        (Bridge::new(&config, transport, queue), rx)
    }

    fn exchange(group_id: u16, data: &[u8]) -> DataExchange {
        DataExchange {
            group_id,
            data: Bytes::copy_from_slice(data),
        }
    }

    #[test]
    fn test_decode_single_write_both_orders() {
        let big = SingleWrite::decode(&[0x00, 0x01, 0x00, 0x0A, 0x12, 0x34], FdxByteOrder::Big).unwrap();
        assert_eq!(
            big,
            SingleWrite {
                slave_id: 1,
                address: 10,
                value: 0x1234
            }
        );
        let little = SingleWrite::decode(&[0x01, 0x00, 0x0A, 0x00, 0x34, 0x12], FdxByteOrder::Little).unwrap();
        assert_eq!(little, big);

        assert!(SingleWrite::decode(&[0x00, 0x01, 0x00], FdxByteOrder::Big).is_err());
        assert!(SingleWrite::decode(&[0x01, 0x00, 0x00, 0x00, 0x00, 0x00], FdxByteOrder::Big).is_err());
    }

    #[test]
    fn test_decode_multi_write_checks_size() {
        let data = [0x00, 0x02, 0x00, 0x05, 0x00, 0x02, 0x00, 0x07, 0x00, 0x08];
        let write = MultiWrite::decode(&data, FdxByteOrder::Big).unwrap();
        assert_eq!(write.slave_id, 2);
        assert_eq!(write.address, 5);
        assert_eq!(write.values, vec![7, 8]);

        assert!(MultiWrite::decode(&data[..8], FdxByteOrder::Big).is_err());
        assert!(MultiWrite::decode(&[0x00, 0x02, 0x00, 0x05, 0x00, 0x00], FdxByteOrder::Big).is_err());
    }

    #[tokio::test]
    async fn test_repeated_single_write_enqueued_once() {
        let (bridge, mut rx) = bridge_with_queue(8);
        let payload = [0x00, 0x01, 0x00, 0x0A, 0x00, 0x05];

        assert!(bridge.apply_write_group(&exchange(100, &payload), FdxByteOrder::Big));
        assert!(!bridge.apply_write_group(&exchange(100, &payload), FdxByteOrder::Big));
        assert!(bridge.apply_write_group(&exchange(100, &[0x00, 0x01, 0x00, 0x0A, 0x00, 0x06]), FdxByteOrder::Big));

        assert_eq!(rx.recv().await, Some(RegisterRequest::write_single(1, 10, 5)));
        assert_eq!(rx.recv().await, Some(RegisterRequest::write_single(1, 10, 6)));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_groups_are_cached_separately() {
        let (bridge, mut rx) = bridge_with_queue(8);
        let multi = [0x00, 0x01, 0x00, 0x00, 0x00, 0x01, 0x00, 0x09];

        assert!(bridge.apply_write_group(&exchange(101, &multi), FdxByteOrder::Big));
        assert!(!bridge.apply_write_group(&exchange(101, &multi), FdxByteOrder::Big));
        assert!(!bridge.apply_write_group(&exchange(7, &multi), FdxByteOrder::Big));
        assert!(bridge.write_register_manually(1, 0, 9));

        assert_eq!(rx.recv().await, Some(RegisterRequest::write_multiple(1, 0, vec![9])));
        assert_eq!(rx.recv().await, Some(RegisterRequest::write_single(1, 0, 9)));
    }

    #[tokio::test]
    async fn test_rejected_enqueue_does_not_update_cache() {
        let (bridge, mut rx) = bridge_with_queue(1);
        assert!(bridge.write_register_manually(3, 3, 3));

        let payload = [0x00, 0x01, 0x00, 0x0A, 0x00, 0x05];
        assert!(!bridge.apply_write_group(&exchange(100, &payload), FdxByteOrder::Big));
        rx.recv().await;
        assert!(bridge.apply_write_group(&exchange(100, &payload), FdxByteOrder::Big));
    }

    #[tokio::test]
    async fn test_status_is_published() {
        let (bridge, _rx) = bridge_with_queue(1);
        let mut updates = bridge.status_updates();
        let ctx = CommandContext {
            peer: None,
            byte_order: FdxByteOrder::Big,
            header: crate::fdx::protocol::FdxHeader {
                version: crate::fdx::protocol::FdxVersion::default(),
                command_count: 1,
                sequence_or_length: 1,
                byte_order: FdxByteOrder::Big,
            },
        };
        let status = StatusCommand {
            state: crate::fdx::protocol::MeasurementState::Running,
            timestamp_ns: 42,
        };
        bridge.on_status(&ctx, status).await;
        updates.changed().await.unwrap();
        assert_eq!(*updates.borrow(), Some(status));
    }

    #[tokio::test]
    async fn test_send_without_open_transport_fails() {
        let (bridge, _rx) = bridge_with_queue(1);
        let err = bridge.publish_registers(1, &[1, 2]).await.unwrap_err();
        assert!(matches!(err, BridgeError::NotConnected { .. }));
    }
}
