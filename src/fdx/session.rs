//! FDX session state: outbound frame building and inbound dispatch.
//!
//! A session owns the protocol version, the negotiated byte order and the
//! sequence counter. Outbound builders either start a new frame or append to
//! the pending one; [`FdxSession::take_frame`] hands the finished frame to the
//! transport.
//!
//! Inbound frames are decoded by [`handle_datagram`], which dispatches every
//! command to an [`FdxCommandHandler`] in wire order.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use std::net::SocketAddr;
use tracing::{debug, trace, warn};

use super::codec::{self, put_command};
use super::protocol::*;
use crate::error::{BridgeError, BridgeResult};

/// Outbound frame builder with sequence bookkeeping.
#[derive(Debug)]
pub struct FdxSession {
    version: FdxVersion,
    byte_order: FdxByteOrder,
    kind: TransportKind,
    sequence_number: u16,
    max_frame_size: usize,
    pending: BytesMut,
    pending_commands: u16,
}

impl FdxSession {
    pub fn new(kind: TransportKind, version: FdxVersion, byte_order: FdxByteOrder) -> Self {
        Self {
            version,
            byte_order,
            kind,
            sequence_number: SEQUENCE_START,
            max_frame_size: MAX_FRAME_SIZE,
            pending: BytesMut::new(),
            pending_commands: 0,
        }
    }

    /// Lower the frame size limit, e.g. to match a peer with a smaller buffer.
    pub fn with_max_frame_size(mut self, max_frame_size: usize) -> Self {
        self.max_frame_size = max_frame_size.clamp(HEADER_SIZE + COMMAND_HEADER_SIZE, MAX_FRAME_SIZE);
        self
    }

    pub fn version(&self) -> FdxVersion {
        self.version
    }

    pub fn byte_order(&self) -> FdxByteOrder {
        self.byte_order
    }

    pub fn transport_kind(&self) -> TransportKind {
        self.kind
    }

    /// Sequence number the next non-append UDP frame will carry.
    pub fn sequence_number(&self) -> u16 {
        self.sequence_number
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    pub fn has_pending_frame(&self) -> bool {
        !self.pending.is_empty()
    }

    pub fn pending_frame(&self) -> Option<&[u8]> {
        if self.pending.is_empty() {
            None
        } else {
            Some(&self.pending)
        }
    }

    /// Remove the pending frame for sending.
    pub fn take_frame(&mut self) -> Option<Bytes> {
        if self.pending.is_empty() {
            return None;
        }
        self.pending_commands = 0;
        Some(self.pending.split().freeze())
    }

    pub fn start(&mut self, append: bool) -> BridgeResult<()> {
        self.push_command(&FdxCommand::Start, append)
    }

    pub fn stop(&mut self, append: bool) -> BridgeResult<()> {
        self.push_command(&FdxCommand::Stop, append)
    }

    pub fn key(&mut self, key_code: u32, append: bool) -> BridgeResult<()> {
        self.push_command(&FdxCommand::Key { key_code }, append)
    }

    pub fn status(&mut self, state: MeasurementState, timestamp_ns: i64, append: bool) -> BridgeResult<()> {
        self.push_command(&FdxCommand::Status(StatusCommand { state, timestamp_ns }), append)
    }

    pub fn status_request(&mut self, append: bool) -> BridgeResult<()> {
        self.push_command(&FdxCommand::StatusRequest, append)
    }

    pub fn data_request(&mut self, group_id: u16, append: bool) -> BridgeResult<()> {
        self.push_command(&FdxCommand::DataRequest { group_id }, append)
    }

    /// Queue a data-exchange command carrying `data` for `group_id`.
    ///
    /// Fails with `PayloadTooLarge` when `data` exceeds the frame size minus the header.
    pub fn data_exchange(&mut self, group_id: u16, data: &[u8], append: bool) -> BridgeResult<()> {
        let limit = self.max_frame_size - HEADER_SIZE;
        if data.len() > limit {
            return Err(BridgeError::payload_too_large(data.len(), limit));
        }
        let command = FdxCommand::DataExchange(DataExchange {
            group_id,
            data: Bytes::copy_from_slice(data),
        });
        self.push_command(&command, append)
    }

    pub fn free_running_request(
        &mut self,
        group_id: u16,
        flags: FreeRunningFlags,
        cycle_time: u32,
        first_duration: u32,
        append: bool,
    ) -> BridgeResult<()> {
        let command = FdxCommand::FreeRunningRequest(FreeRunningRequest {
            group_id,
            flags,
            cycle_time,
            first_duration,
        });
        self.push_command(&command, append)
    }

    pub fn free_running_cancel(&mut self, group_id: u16, append: bool) -> BridgeResult<()> {
        self.push_command(&FdxCommand::FreeRunningCancel { group_id }, append)
    }

    /// Encode any command into the pending frame.
    ///
    /// With `append == false` the pending frame is replaced by a fresh one
    /// holding only this command. With `append == true` the command joins the
    /// pending frame, which must exist. On error nothing is modified.
    pub fn push_command(&mut self, command: &FdxCommand, append: bool) -> BridgeResult<()> {
        let payload = command.encode_payload(self.byte_order)?;
        let command_len = COMMAND_HEADER_SIZE + payload.len();

        if append {
            if self.pending.is_empty() {
                return Err(BridgeError::protocol_usage(format!(
                    "cannot append {} without a pending frame header",
                    command.code().name()
                )));
            }
            let frame_len = self.pending.len() + command_len;
            if frame_len > self.max_frame_size {
                return Err(BridgeError::payload_too_large(frame_len, self.max_frame_size));
            }

            put_command(&mut self.pending, command.code().to_u16(), &payload, self.byte_order)?;
            self.pending_commands += 1;
            self.patch_header();
        } else {
            let frame_len = HEADER_SIZE + command_len;
            if frame_len > self.max_frame_size {
                return Err(BridgeError::payload_too_large(frame_len, self.max_frame_size));
            }
            if !self.pending.is_empty() {
                debug!("Discarding unsent FDX frame with {} commands", self.pending_commands);
            }

            let slot = match self.kind {
                TransportKind::Udp => self.next_sequence_number(),
                TransportKind::Tcp => frame_len as u16,
            };
            let mut frame = BytesMut::with_capacity(frame_len);
            frame.extend_from_slice(&codec::encode_header(slot, 1, self.version, self.byte_order));
            put_command(&mut frame, command.code().to_u16(), &payload, self.byte_order)?;
            self.pending = frame;
            self.pending_commands = 1;
        }

        trace!(
            "FDX {} queued ({} commands, {} bytes pending)",
            command.code(),
            self.pending_commands,
            self.pending.len()
        );
        Ok(())
    }

    fn next_sequence_number(&mut self) -> u16 {
        let current = self.sequence_number;
        let next = current.wrapping_add(1);
        self.sequence_number = if next >= SEQUENCE_LIMIT || next == 0 {
            SEQUENCE_START
        } else {
            next
        };
        current
    }

    fn patch_header(&mut self) {
        let order = self.byte_order;
        order.write_u16(
            &mut self.pending[OFFSET_COMMAND_COUNT..OFFSET_COMMAND_COUNT + 2],
            self.pending_commands,
        );
        if self.kind == TransportKind::Tcp {
            let len = self.pending.len() as u16;
            order.write_u16(
                &mut self.pending[OFFSET_SEQUENCE_OR_LENGTH..OFFSET_SEQUENCE_OR_LENGTH + 2],
                len,
            );
        }
    }
}

/// Where and how an inbound command arrived.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandContext {
    /// Sender address; `None` on TCP.
    pub peer: Option<SocketAddr>,
    pub byte_order: FdxByteOrder,
    pub header: FdxHeader,
}

/// Receiver of decoded inbound commands.
///
/// Every method defaults to a no-op so implementors override only what they use.
#[async_trait]
pub trait FdxCommandHandler: Send + Sync {
    async fn on_start(&self, _ctx: &CommandContext) {}

    async fn on_stop(&self, _ctx: &CommandContext) {}

    async fn on_key(&self, _ctx: &CommandContext, _key_code: u32) {}

    async fn on_status(&self, _ctx: &CommandContext, _status: StatusCommand) {}

    async fn on_data_exchange(&self, _ctx: &CommandContext, _exchange: DataExchange) {}

    async fn on_data_request(&self, _ctx: &CommandContext, _group_id: u16) {}

    async fn on_data_error(&self, _ctx: &CommandContext, _error: DataError) {}

    async fn on_free_running_request(&self, _ctx: &CommandContext, _request: FreeRunningRequest) {}

    async fn on_free_running_cancel(&self, _ctx: &CommandContext, _group_id: u16) {}

    async fn on_status_request(&self, _ctx: &CommandContext) {}

    async fn on_sequence_number_error(&self, _ctx: &CommandContext, _error: SequenceNumberError) {}

    async fn on_function_call(&self, _ctx: &CommandContext) {}

    async fn on_function_call_error(&self, _ctx: &CommandContext) {}

    async fn on_increment_time(&self, _ctx: &CommandContext, _time_step: u64) {}
}

/// Route one decoded command to its handler method.
pub async fn dispatch<H>(handler: &H, ctx: &CommandContext, command: FdxCommand)
where
    H: FdxCommandHandler + ?Sized,
{
    match command {
        FdxCommand::Start => handler.on_start(ctx).await,
        FdxCommand::Stop => handler.on_stop(ctx).await,
        FdxCommand::Key { key_code } => handler.on_key(ctx, key_code).await,
        FdxCommand::Status(status) => handler.on_status(ctx, status).await,
        FdxCommand::DataExchange(exchange) => handler.on_data_exchange(ctx, exchange).await,
        FdxCommand::DataRequest { group_id } => handler.on_data_request(ctx, group_id).await,
        FdxCommand::DataError(error) => handler.on_data_error(ctx, error).await,
        FdxCommand::FreeRunningRequest(request) => handler.on_free_running_request(ctx, request).await,
        FdxCommand::FreeRunningCancel { group_id } => handler.on_free_running_cancel(ctx, group_id).await,
        FdxCommand::StatusRequest => handler.on_status_request(ctx).await,
        FdxCommand::SequenceNumberError(error) => handler.on_sequence_number_error(ctx, error).await,
        FdxCommand::FunctionCall => handler.on_function_call(ctx).await,
        FdxCommand::FunctionCallError => handler.on_function_call_error(ctx).await,
        FdxCommand::IncrementTime { time_step } => handler.on_increment_time(ctx, time_step).await,
    }
}

/// Decode one datagram and dispatch its commands in order.
///
/// Returns the number of commands dispatched. A command with an unknown code
/// or an unreadable payload is logged and skipped. If the command section is
/// truncated, the commands before the cut are dispatched and the decode error
/// is returned afterwards.
pub async fn handle_datagram<H>(handler: &H, datagram: Bytes, peer: Option<SocketAddr>) -> BridgeResult<usize>
where
    H: FdxCommandHandler + ?Sized,
{
    let (header, decoded) = codec::decode_frame(&datagram)?;
    let ctx = CommandContext {
        peer,
        byte_order: header.byte_order,
        header,
    };

    let mut dispatched = 0;
    for raw in &decoded.commands {
        match FdxCommand::decode(raw, header.byte_order) {
            Ok(command) => {
                dispatch(handler, &ctx, command).await;
                dispatched += 1;
            }
            Err(e) => warn!("Skipping FDX command 0x{:04X}: {}", raw.code, e),
        }
    }

    match decoded.error {
        Some(error) => Err(error),
        None => Ok(dispatched),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<FdxCommandCode>>,
    }

    #[async_trait]
    impl FdxCommandHandler for Recorder {
        async fn on_start(&self, _ctx: &CommandContext) {
            self.seen.lock().unwrap().push(FdxCommandCode::Start);
        }

        async fn on_stop(&self, _ctx: &CommandContext) {
            self.seen.lock().unwrap().push(FdxCommandCode::Stop);
        }

        async fn on_key(&self, _ctx: &CommandContext, _key_code: u32) {
            self.seen.lock().unwrap().push(FdxCommandCode::Key);
        }
    }

    #[test]
    fn test_data_exchange_frame_bytes() {
        let mut session = FdxSession::new(TransportKind::Udp, FdxVersion::new(2, 1), FdxByteOrder::Big);
        session.data_exchange(1, &[0x01, 0x02, 0x03, 0x04], false).unwrap();
        let frame = session.take_frame().unwrap();
        assert_eq!(
            hex::encode(&frame),
            "43414e6f654644580201000100010100000c00050001000401020304"
        );
        assert_eq!(session.sequence_number(), 2);
        assert!(session.take_frame().is_none());
    }

    #[test]
    fn test_append_requires_header() {
        let mut session = FdxSession::new(TransportKind::Udp, FdxVersion::default(), FdxByteOrder::Big);
        let result = session.stop(true);
        assert!(matches!(result, Err(BridgeError::ProtocolUsage { .. })));
        assert!(!session.has_pending_frame());
        assert_eq!(session.sequence_number(), SEQUENCE_START);
    }

    #[test]
    fn test_append_updates_count_not_sequence() {
        let mut session = FdxSession::new(TransportKind::Udp, FdxVersion::default(), FdxByteOrder::Big);
        session.start(false).unwrap();
        session.key(0x41, true).unwrap();
        session.stop(true).unwrap();

        let frame = session.take_frame().unwrap();
        let header = codec::decode_header(&frame).unwrap();
        assert_eq!(header.command_count, 3);
        assert_eq!(header.sequence_or_length, 1);
        assert_eq!(session.sequence_number(), 2);
    }

    #[test]
    fn test_tcp_length_tracks_appends() {
        let mut session = FdxSession::new(TransportKind::Tcp, FdxVersion::default(), FdxByteOrder::Little);
        session.data_exchange(3, &[0xAA; 10], false).unwrap();
        session.data_request(4, true).unwrap();
        session.free_running_cancel(5, true).unwrap();

        let frame = session.take_frame().unwrap();
        let header = codec::decode_header(&frame).unwrap();
        assert_eq!(header.command_count, 3);
        assert_eq!(header.sequence_or_length as usize, frame.len());
        // TCP frames do not consume sequence numbers
        assert_eq!(session.sequence_number(), SEQUENCE_START);
    }

    #[test]
    fn test_sequence_wraps_before_limit() {
        let mut session = FdxSession::new(TransportKind::Udp, FdxVersion::default(), FdxByteOrder::Big);
        for expected in 1..SEQUENCE_LIMIT {
            session.status_request(false).unwrap();
            let frame = session.take_frame().unwrap();
            let header = codec::decode_header(&frame).unwrap();
            assert_eq!(header.sequence_or_length, expected);
        }
        session.status_request(false).unwrap();
        let header = codec::decode_header(&session.take_frame().unwrap()).unwrap();
        assert_eq!(header.sequence_or_length, 1);
    }

    #[test]
    fn test_oversized_payload_leaves_frame_untouched() {
        let mut session = FdxSession::new(TransportKind::Udp, FdxVersion::default(), FdxByteOrder::Big);
        session.start(false).unwrap();
        let before = session.pending_frame().unwrap().to_vec();

        let data = vec![0u8; MAX_FRAME_SIZE - HEADER_SIZE + 1];
        let result = session.data_exchange(1, &data, true);
        assert!(matches!(result, Err(BridgeError::PayloadTooLarge { .. })));
        assert_eq!(session.pending_frame().unwrap(), before.as_slice());
        assert_eq!(session.sequence_number(), 2);
    }

    #[test]
    fn test_append_past_frame_limit_rejected() {
        let mut session =
            FdxSession::new(TransportKind::Udp, FdxVersion::default(), FdxByteOrder::Big).with_max_frame_size(64);
        session.data_exchange(1, &[0u8; 30], false).unwrap();
        let result = session.data_exchange(2, &[0u8; 30], true);
        assert!(matches!(result, Err(BridgeError::PayloadTooLarge { .. })));
        let header = codec::decode_header(session.pending_frame().unwrap()).unwrap();
        assert_eq!(header.command_count, 1);
    }

    #[tokio::test]
    async fn test_start_stop_dispatched_in_order() {
        let mut session = FdxSession::new(TransportKind::Udp, FdxVersion::default(), FdxByteOrder::Big);
        session.start(false).unwrap();
        session.stop(true).unwrap();
        let frame = session.take_frame().unwrap();

        let recorder = Recorder::default();
        let count = handle_datagram(&recorder, frame, None).await.unwrap();
        assert_eq!(count, 2);
        assert_eq!(
            *recorder.seen.lock().unwrap(),
            vec![FdxCommandCode::Start, FdxCommandCode::Stop]
        );
    }

    #[tokio::test]
    async fn test_unknown_code_skipped() {
        let header = FdxHeader {
            version: FdxVersion::default(),
            command_count: 2,
            sequence_or_length: 1,
            byte_order: FdxByteOrder::Big,
        };
        let frame = codec::encode_frame(
            &header,
            &[RawCommand::new(0x0042, Bytes::new()), RawCommand::new(0x0002, Bytes::new())],
        )
        .unwrap();

        let recorder = Recorder::default();
        let count = handle_datagram(&recorder, frame, None).await.unwrap();
        assert_eq!(count, 1);
        assert_eq!(*recorder.seen.lock().unwrap(), vec![FdxCommandCode::Stop]);
    }

    #[tokio::test]
    async fn test_truncated_frame_dispatches_prefix() {
        let mut session = FdxSession::new(TransportKind::Udp, FdxVersion::default(), FdxByteOrder::Big);
        session.start(false).unwrap();
        session.key(7, true).unwrap();
        let frame = session.take_frame().unwrap();
        let truncated = frame.slice(..frame.len() - 2);

        let recorder = Recorder::default();
        let result = handle_datagram(&recorder, truncated, None).await;
        assert!(matches!(result, Err(BridgeError::TruncatedFrame { index: 1, .. })));
        assert_eq!(*recorder.seen.lock().unwrap(), vec![FdxCommandCode::Start]);
    }
}
