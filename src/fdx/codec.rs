//! Pure encode/decode functions for FDX frames.
//!
//! Nothing here owns state; the session decides sequence numbers and the
//! transport decides where bytes go.

use bytes::{BufMut, Bytes, BytesMut};

use super::protocol::*;
use crate::error::{BridgeError, BridgeResult};

/// Build the 16-byte datagram header.
pub fn encode_header(
    sequence_or_length: u16,
    command_count: u16,
    version: FdxVersion,
    order: FdxByteOrder,
) -> [u8; HEADER_SIZE] {
    let mut header = [0u8; HEADER_SIZE];
    header[..FDX_SIGNATURE.len()].copy_from_slice(&FDX_SIGNATURE);
    header[OFFSET_VERSION_MAJOR] = version.major;
    header[OFFSET_VERSION_MINOR] = version.minor;
    order.write_u16(&mut header[OFFSET_COMMAND_COUNT..OFFSET_COMMAND_COUNT + 2], command_count);
    order.write_u16(
        &mut header[OFFSET_SEQUENCE_OR_LENGTH..OFFSET_SEQUENCE_OR_LENGTH + 2],
        sequence_or_length,
    );
    header[OFFSET_FLAGS] = order.flags();
    header
}

/// Prefix a payload with its size and command code.
pub fn encode_command(code: u16, payload: &[u8], order: FdxByteOrder) -> BridgeResult<Bytes> {
    let mut buf = BytesMut::with_capacity(COMMAND_HEADER_SIZE + payload.len());
    put_command(&mut buf, code, payload, order)?;
    Ok(buf.freeze())
}

pub(crate) fn put_command(
    dst: &mut BytesMut,
    code: u16,
    payload: &[u8],
    order: FdxByteOrder,
) -> BridgeResult<()> {
    let size = COMMAND_HEADER_SIZE + payload.len();
    let size = u16::try_from(size).map_err(|_| BridgeError::payload_too_large(size, u16::MAX as usize))?;
    order.put_u16(dst, size);
    order.put_u16(dst, code);
    dst.put_slice(payload);
    Ok(())
}

/// True if the buffer starts with the FDX signature.
pub fn has_signature(bytes: &[u8]) -> bool {
    bytes.len() >= FDX_SIGNATURE.len() && bytes[..FDX_SIGNATURE.len()] == FDX_SIGNATURE
}

pub fn decode_header(bytes: &[u8]) -> BridgeResult<FdxHeader> {
    if bytes.len() < HEADER_SIZE {
        return Err(BridgeError::malformed_frame(format!(
            "header needs {} bytes, got {}",
            HEADER_SIZE,
            bytes.len()
        )));
    }
    if !has_signature(bytes) {
        return Err(BridgeError::malformed_frame(format!(
            "bad signature {}",
            hex::encode(&bytes[..FDX_SIGNATURE.len()])
        )));
    }

    let order = FdxByteOrder::from_flags(bytes[OFFSET_FLAGS]);
    Ok(FdxHeader {
        version: FdxVersion::new(bytes[OFFSET_VERSION_MAJOR], bytes[OFFSET_VERSION_MINOR]),
        command_count: order.read_u16(&bytes[OFFSET_COMMAND_COUNT..]),
        sequence_or_length: order.read_u16(&bytes[OFFSET_SEQUENCE_OR_LENGTH..]),
        byte_order: order,
    })
}

/// Result of walking the command section of a frame.
///
/// `error` is set when decoding stopped early; `commands` then holds every
/// command that preceded the failure.
#[derive(Debug, Default)]
pub struct DecodedCommands {
    pub commands: Vec<RawCommand>,
    pub error: Option<BridgeError>,
}

impl DecodedCommands {
    pub fn is_complete(&self) -> bool {
        self.error.is_none()
    }

    pub fn into_result(self) -> BridgeResult<Vec<RawCommand>> {
        match self.error {
            Some(error) => Err(error),
            None => Ok(self.commands),
        }
    }
}

/// Decode `header.command_count` commands following the header in `frame`.
///
/// `frame` is the whole datagram, header included.
pub fn decode_commands(frame: &Bytes, header: &FdxHeader) -> DecodedCommands {
    let order = header.byte_order;
    let mut decoded = DecodedCommands {
        commands: Vec::with_capacity(header.command_count as usize),
        error: None,
    };
    let mut offset = HEADER_SIZE.min(frame.len());

    for index in 0..header.command_count {
        let available = frame.len() - offset;
        if available < COMMAND_HEADER_SIZE {
            decoded.error = Some(BridgeError::truncated_frame(index, COMMAND_HEADER_SIZE, available));
            break;
        }

        let size = order.read_u16(&frame[offset..]) as usize;
        let code = order.read_u16(&frame[offset + 2..]);
        if size < COMMAND_HEADER_SIZE {
            decoded.error = Some(BridgeError::malformed_frame(format!(
                "command {} declares size {}",
                index, size
            )));
            break;
        }
        if size > available {
            decoded.error = Some(BridgeError::truncated_frame(index, size, available));
            break;
        }

        decoded.commands.push(RawCommand {
            code,
            payload: frame.slice(offset + COMMAND_HEADER_SIZE..offset + size),
        });
        offset += size;
    }

    decoded
}

/// Decode header and commands of one datagram.
pub fn decode_frame(frame: &Bytes) -> BridgeResult<(FdxHeader, DecodedCommands)> {
    let header = decode_header(frame)?;
    let commands = decode_commands(frame, &header);
    Ok((header, commands))
}

/// Encode a complete frame from an explicit header and raw commands.
///
/// The header's command count is taken as given.
pub fn encode_frame(header: &FdxHeader, commands: &[RawCommand]) -> BridgeResult<Bytes> {
    let body_len: usize = commands.iter().map(RawCommand::wire_len).sum();
    let mut buf = BytesMut::with_capacity(HEADER_SIZE + body_len);
    buf.put_slice(&encode_header(
        header.sequence_or_length,
        header.command_count,
        header.version,
        header.byte_order,
    ));
    for command in commands {
        put_command(&mut buf, command.code, &command.payload, header.byte_order)?;
    }
    Ok(buf.freeze())
}

/// Total frame length announced by a TCP header, if the bytes hold a full header.
pub(crate) fn peek_frame_length(bytes: &[u8]) -> Option<usize> {
    if bytes.len() < HEADER_SIZE {
        return None;
    }
    let order = FdxByteOrder::from_flags(bytes[OFFSET_FLAGS]);
    Some(order.read_u16(&bytes[OFFSET_SEQUENCE_OR_LENGTH..]) as usize)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn big_header(count: u16, seq: u16) -> FdxHeader {
        FdxHeader {
            version: FdxVersion::new(2, 1),
            command_count: count,
            sequence_or_length: seq,
            byte_order: FdxByteOrder::Big,
        }
    }

    #[test]
    fn test_encode_header_layout() {
        let header = encode_header(1, 1, FdxVersion::new(2, 1), FdxByteOrder::Big);
        assert_eq!(hex::encode(header), "43414e6f654644580201000100010100");

        let header = encode_header(0x0102, 3, FdxVersion::new(1, 0), FdxByteOrder::Little);
        assert_eq!(&header[8..16], &[0x01, 0x00, 0x03, 0x00, 0x02, 0x01, 0x00, 0x00]);
    }

    #[test]
    fn test_encode_command() {
        let cmd = encode_command(0x0005, &[0x00, 0x01, 0x00, 0x04, 1, 2, 3, 4], FdxByteOrder::Big).unwrap();
        assert_eq!(hex::encode(&cmd), "000c00050001000401020304");

        let empty = encode_command(0x0001, &[], FdxByteOrder::Little).unwrap();
        assert_eq!(empty.as_ref(), &[0x04, 0x00, 0x01, 0x00]);
    }

    #[test]
    fn test_decode_header_rejects_short_and_foreign() {
        assert!(matches!(
            decode_header(&[0x43, 0x41, 0x4E]),
            Err(BridgeError::MalformedFrame { .. })
        ));

        let mut bytes = encode_header(1, 0, FdxVersion::default(), FdxByteOrder::Big);
        bytes[0] = b'X';
        assert!(matches!(decode_header(&bytes), Err(BridgeError::MalformedFrame { .. })));
    }

    #[test]
    fn test_decode_commands_in_order() {
        let header = big_header(2, 9);
        let commands = vec![RawCommand::new(0x0001, Bytes::new()), RawCommand::new(0x0002, Bytes::new())];
        let frame = encode_frame(&header, &commands).unwrap();

        let (decoded_header, decoded) = decode_frame(&frame).unwrap();
        assert_eq!(decoded_header, header);
        assert!(decoded.is_complete());
        assert_eq!(decoded.commands, commands);
    }

    #[test]
    fn test_truncated_command_keeps_prefix() {
        let header = big_header(2, 1);
        let mut frame = BytesMut::new();
        frame.put_slice(&encode_header(1, 2, header.version, header.byte_order));
        frame.put_slice(&[0x00, 0x04, 0x00, 0x01]);
        // second command claims 12 bytes, only 6 follow
        frame.put_slice(&[0x00, 0x0C, 0x00, 0x05, 0xAA, 0xBB]);
        let frame = frame.freeze();

        let decoded = decode_commands(&frame, &header);
        assert_eq!(decoded.commands.len(), 1);
        assert_eq!(decoded.commands[0].code, 0x0001);
        assert!(matches!(
            decoded.error,
            Some(BridgeError::TruncatedFrame { index: 1, needed: 12, available: 6 })
        ));
    }

    #[test]
    fn test_size_below_prefix_is_malformed() {
        let header = big_header(1, 1);
        let mut frame = BytesMut::new();
        frame.put_slice(&encode_header(1, 1, header.version, header.byte_order));
        frame.put_slice(&[0x00, 0x02, 0x00, 0x01]);
        let decoded = decode_commands(&frame.freeze(), &header);
        assert!(decoded.commands.is_empty());
        assert!(matches!(decoded.error, Some(BridgeError::MalformedFrame { .. })));
    }

    #[test]
    fn test_peek_frame_length() {
        let header = encode_header(40, 1, FdxVersion::default(), FdxByteOrder::Little);
        assert_eq!(peek_frame_length(&header), Some(40));
        assert_eq!(peek_frame_length(&header[..10]), None);
    }
}
