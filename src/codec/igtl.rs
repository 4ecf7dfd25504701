//! Default codec - OpenIGTLink-style 58-byte header.
//!
//! ```text
//! ┌─────────┬─────────────┬─────────────┬───────────┬───────────┬─────────┐
//! │ Version │ Device type │ Device name │ Timestamp │ Body size │ CRC-64  │
//! │ 2 bytes │ 12 bytes    │ 20 bytes    │ 8 bytes   │ 8 bytes   │ 8 bytes │
//! │ u16 BE  │ ASCII, NUL  │ NUL padded  │ u64 BE    │ u64 BE    │ u64 BE  │
//! └─────────┴─────────────┴─────────────┴───────────┴───────────┴─────────┘
//! ```
//!
//! The timestamp carries whole seconds in its upper 32 bits and a binary
//! fraction (units of 2^-32 s) in the lower 32 bits. The CRC is
//! CRC-64/ECMA-182 over the body.

use bytes::{BufMut, Bytes, BytesMut};
use crc::{Crc, CRC_64_ECMA_182};

use super::{Codec, HeaderInfo, Message, PackedMessage};
use crate::clock;
use crate::error::{Result, TransportError};

/// Header size in bytes (fixed, exactly 58).
pub const HEADER_SIZE: usize = 58;

/// Width of the device type field.
pub const DEVICE_TYPE_SIZE: usize = 12;

/// Width of the device name field.
pub const DEVICE_NAME_SIZE: usize = 20;

/// Version written by [`IgtlCodec::pack`].
pub const IGTL_VERSION: u16 = 1;

/// Highest header version accepted on parse.
pub const MAX_IGTL_VERSION: u16 = 3;

const CRC64: Crc<u64> = Crc::<u64>::new(&CRC_64_ECMA_182);

const NANOS_PER_SEC: u64 = 1_000_000_000;

const TYPE_OFFSET: usize = 2;
const NAME_OFFSET: usize = TYPE_OFFSET + DEVICE_TYPE_SIZE;
const TIMESTAMP_OFFSET: usize = NAME_OFFSET + DEVICE_NAME_SIZE;
const BODY_SIZE_OFFSET: usize = TIMESTAMP_OFFSET + 8;
const CRC_OFFSET: usize = BODY_SIZE_OFFSET + 8;

/// OpenIGTLink-style codec.
#[derive(Debug, Clone, Copy, Default)]
pub struct IgtlCodec;

impl IgtlCodec {
    /// Create the codec.
    pub fn new() -> Self {
        Self
    }

    /// CRC-64/ECMA-182 of `data`.
    #[inline]
    pub fn checksum(data: &[u8]) -> u64 {
        CRC64.checksum(data)
    }
}

impl Codec for IgtlCodec {
    fn header_size(&self) -> usize {
        HEADER_SIZE
    }

    fn parse_header(&self, bytes: &[u8]) -> Result<HeaderInfo> {
        if bytes.len() < HEADER_SIZE {
            return Err(TransportError::MalformedHeader(format!(
                "need {} bytes, got {}",
                HEADER_SIZE,
                bytes.len()
            )));
        }

        let version = u16::from_be_bytes([bytes[0], bytes[1]]);
        if version == 0 || version > MAX_IGTL_VERSION {
            return Err(TransportError::MalformedHeader(format!(
                "unsupported version {}",
                version
            )));
        }

        let device_type = read_device_type(&bytes[TYPE_OFFSET..NAME_OFFSET])?;
        let device_name = read_padded(&bytes[NAME_OFFSET..TIMESTAMP_OFFSET]);

        Ok(HeaderInfo {
            version,
            device_type,
            device_name,
            timestamp: igtl_to_nanos(read_u64(bytes, TIMESTAMP_OFFSET)),
            body_length: read_u64(bytes, BODY_SIZE_OFFSET),
            crc: read_u64(bytes, CRC_OFFSET),
        })
    }

    fn unpack(&self, header: &HeaderInfo, body: Bytes) -> Result<Message> {
        if body.len() as u64 != header.body_length {
            return Err(TransportError::MalformedBody(format!(
                "header declares {} bytes, got {}",
                header.body_length,
                body.len()
            )));
        }

        let actual = Self::checksum(&body);
        if actual != header.crc {
            return Err(TransportError::CrcMismatch {
                expected: header.crc,
                actual,
            });
        }

        Ok(Message {
            version: header.version,
            device_type: header.device_type.clone(),
            device_name: header.device_name.clone(),
            timestamp: header.timestamp,
            body,
        })
    }

    fn pack(&self, message: &Message) -> Result<PackedMessage> {
        if message.device_type.is_empty()
            || message.device_type.len() > DEVICE_TYPE_SIZE
            || !message.device_type.bytes().all(|b| b.is_ascii_graphic())
        {
            return Err(TransportError::MalformedHeader(format!(
                "device type '{}' must be 1-{} printable ASCII bytes",
                message.device_type, DEVICE_TYPE_SIZE
            )));
        }
        if message.device_name.len() > DEVICE_NAME_SIZE {
            return Err(TransportError::MalformedHeader(format!(
                "device name '{}' longer than {} bytes",
                message.device_name, DEVICE_NAME_SIZE
            )));
        }

        let timestamp = match message.timestamp {
            0 => clock::now_nanos(),
            t => t,
        };

        let mut header = BytesMut::with_capacity(HEADER_SIZE);
        header.put_u16(message.version);
        put_padded(&mut header, message.device_type.as_bytes(), DEVICE_TYPE_SIZE);
        put_padded(&mut header, message.device_name.as_bytes(), DEVICE_NAME_SIZE);
        header.put_u64(nanos_to_igtl(timestamp));
        header.put_u64(message.body.len() as u64);
        header.put_u64(Self::checksum(&message.body));
        debug_assert_eq!(header.len(), HEADER_SIZE);

        Ok(PackedMessage {
            header: header.freeze(),
            body: message.body.clone(),
        })
    }
}

fn read_u64(bytes: &[u8], offset: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&bytes[offset..offset + 8]);
    u64::from_be_bytes(raw)
}

fn field_end(field: &[u8]) -> usize {
    field.iter().position(|&b| b == 0).unwrap_or(field.len())
}

fn read_device_type(field: &[u8]) -> Result<String> {
    let raw = &field[..field_end(field)];
    if raw.is_empty() {
        return Err(TransportError::MalformedHeader("empty device type".to_string()));
    }
    if !raw.iter().all(|b| b.is_ascii_graphic()) {
        return Err(TransportError::MalformedHeader(
            "device type is not printable ASCII".to_string(),
        ));
    }
    Ok(String::from_utf8_lossy(raw).into_owned())
}

fn read_padded(field: &[u8]) -> String {
    String::from_utf8_lossy(&field[..field_end(field)]).into_owned()
}

fn put_padded(buf: &mut BytesMut, value: &[u8], width: usize) {
    buf.put_slice(value);
    buf.put_bytes(0, width - value.len());
}

/// Convert nanoseconds since the epoch to the seconds/fraction format.
pub(crate) fn nanos_to_igtl(nanos: u64) -> u64 {
    let secs = nanos / NANOS_PER_SEC;
    let frac = ((nanos % NANOS_PER_SEC) << 32) / NANOS_PER_SEC;
    (secs << 32) | frac
}

/// Convert the seconds/fraction format to nanoseconds since the epoch.
pub(crate) fn igtl_to_nanos(stamp: u64) -> u64 {
    let secs = stamp >> 32;
    let frac = stamp & 0xFFFF_FFFF;
    // Round to nearest so a pack/parse cycle returns the original value.
    secs * NANOS_PER_SEC + ((frac * NANOS_PER_SEC + (1 << 31)) >> 32)
}
