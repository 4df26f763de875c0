//! Wire framing primitives: CompactSize, little-endian codec, frame header
//!
//! Every read checks remaining bytes before touching the buffer, and every
//! length field is capped before any allocation it sizes. CompactSize
//! decoding rejects non-canonical encodings: a value that fits in a shorter
//! form than the one used on the wire is a malformed message, full stop.

use sha2::{Digest, Sha256};
use thiserror::Error;

use super::types::{MAX_PROTOCOL_MESSAGE_LENGTH, MAX_SIZE, MESSAGE_HEADER_SIZE};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum WireError {
    #[error("unexpected end of data")]
    UnexpectedEnd,
    #[error("non-canonical compact size")]
    NonCanonicalVarInt,
    #[error("compact size exceeds limit")]
    SizeTooLarge,
    #[error("string is not valid utf-8")]
    InvalidUtf8,
    #[error("string exceeds length cap")]
    StringTooLong,
    #[error("bad magic bytes")]
    BadMagic,
    #[error("malformed command field")]
    BadCommand,
    #[error("payload length exceeds protocol maximum")]
    OversizedPayload,
    #[error("checksum mismatch")]
    BadChecksum,
    #[error("trailing bytes after payload")]
    TrailingBytes,
    #[error("invalid value for field")]
    InvalidValue,
    #[error("collection count exceeds cap")]
    OversizedCollection,
}

pub type WireResult<T> = Result<T, WireError>;

// =============================================================================
// CHECKSUM
// =============================================================================

/// Double SHA-256.
pub fn double_sha256(data: &[u8]) -> [u8; 32] {
    let first = Sha256::digest(data);
    let second = Sha256::digest(first);
    second.into()
}

/// Frame checksum: first four bytes of SHA256(SHA256(payload)).
pub fn checksum(payload: &[u8]) -> [u8; 4] {
    let hash = double_sha256(payload);
    [hash[0], hash[1], hash[2], hash[3]]
}

// =============================================================================
// COMPACTSIZE
// =============================================================================

/// Encoded length of a CompactSize for `value`. Fully determined by the
/// value: this is the only length a compliant encoder may produce.
pub fn varint_size(value: u64) -> usize {
    match value {
        0..=0xfc => 1,
        0xfd..=0xffff => 3,
        0x1_0000..=0xffff_ffff => 5,
        _ => 9,
    }
}

/// Append the canonical CompactSize encoding of `value`.
pub fn write_varint(out: &mut Vec<u8>, value: u64) {
    match value {
        0..=0xfc => out.push(value as u8),
        0xfd..=0xffff => {
            out.push(0xfd);
            out.extend_from_slice(&(value as u16).to_le_bytes());
        }
        0x1_0000..=0xffff_ffff => {
            out.push(0xfe);
            out.extend_from_slice(&(value as u32).to_le_bytes());
        }
        _ => {
            out.push(0xff);
            out.extend_from_slice(&value.to_le_bytes());
        }
    }
}

/// Decode a CompactSize. Returns (value, bytes consumed).
///
/// Rejects truncated input and any non-canonical encoding (e.g. `fd 05 00`
/// decodes to 5 but canonically encodes as `05`; that mismatch is an error).
pub fn read_varint(data: &[u8]) -> WireResult<(u64, usize)> {
    let first = *data.first().ok_or(WireError::UnexpectedEnd)?;
    match first {
        0xfd => {
            if data.len() < 3 {
                return Err(WireError::UnexpectedEnd);
            }
            let value = u16::from_le_bytes([data[1], data[2]]) as u64;
            if value < 0xfd {
                return Err(WireError::NonCanonicalVarInt);
            }
            Ok((value, 3))
        }
        0xfe => {
            if data.len() < 5 {
                return Err(WireError::UnexpectedEnd);
            }
            let value = u32::from_le_bytes([data[1], data[2], data[3], data[4]]) as u64;
            if value <= 0xffff {
                return Err(WireError::NonCanonicalVarInt);
            }
            Ok((value, 5))
        }
        0xff => {
            if data.len() < 9 {
                return Err(WireError::UnexpectedEnd);
            }
            let mut buf = [0u8; 8];
            buf.copy_from_slice(&data[1..9]);
            let value = u64::from_le_bytes(buf);
            if value <= 0xffff_ffff {
                return Err(WireError::NonCanonicalVarInt);
            }
            Ok((value, 9))
        }
        v => Ok((v as u64, 1)),
    }
}

// =============================================================================
// READER / WRITER
// =============================================================================

/// Little-endian serialization buffer for wire messages.
#[derive(Default)]
pub struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    pub fn with_capacity(cap: usize) -> Self {
        Self { buf: Vec::with_capacity(cap) }
    }

    pub fn write_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn write_u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn write_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn write_u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn write_i32(&mut self, v: i32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn write_i64(&mut self, v: i64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn write_bool(&mut self, v: bool) {
        self.buf.push(v as u8);
    }

    pub fn write_u16_be(&mut self, v: u16) {
        // Port fields are the one big-endian exception in the wire format
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn write_varint(&mut self, v: u64) {
        write_varint(&mut self.buf, v);
    }

    pub fn write_bytes(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// CompactSize length prefix followed by raw bytes.
    pub fn write_var_bytes(&mut self, data: &[u8]) {
        self.write_varint(data.len() as u64);
        self.buf.extend_from_slice(data);
    }

    /// Length-prefixed UTF-8 string.
    pub fn write_string(&mut self, s: &str) {
        self.write_var_bytes(s.as_bytes());
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }
}

/// Bounds-checked little-endian reader over a received payload.
///
/// Any failed read poisons the whole message: callers propagate the error
/// with `?` and the connection handles it as a decode failure.
pub struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    fn take(&mut self, n: usize) -> WireResult<&'a [u8]> {
        if self.remaining() < n {
            return Err(WireError::UnexpectedEnd);
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn read_u8(&mut self) -> WireResult<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn read_u16(&mut self) -> WireResult<u16> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub fn read_u32(&mut self) -> WireResult<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_u64(&mut self) -> WireResult<u64> {
        let b = self.take(8)?;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(b);
        Ok(u64::from_le_bytes(buf))
    }

    pub fn read_i32(&mut self) -> WireResult<i32> {
        let b = self.take(4)?;
        Ok(i32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_i64(&mut self) -> WireResult<i64> {
        let b = self.take(8)?;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(b);
        Ok(i64::from_le_bytes(buf))
    }

    pub fn read_bool(&mut self) -> WireResult<bool> {
        match self.read_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            _ => Err(WireError::InvalidValue),
        }
    }

    pub fn read_u16_be(&mut self) -> WireResult<u16> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub fn read_varint(&mut self) -> WireResult<u64> {
        let (value, consumed) = read_varint(&self.data[self.pos..])?;
        self.pos += consumed;
        Ok(value)
    }

    /// CompactSize used as a container length: additionally capped at
    /// MAX_SIZE to bound allocation before the elements are even parsed.
    pub fn read_count(&mut self) -> WireResult<u64> {
        let value = self.read_varint()?;
        if value > MAX_SIZE {
            return Err(WireError::SizeTooLarge);
        }
        Ok(value)
    }

    pub fn read_bytes(&mut self, n: usize) -> WireResult<&'a [u8]> {
        self.take(n)
    }

    pub fn read_array<const N: usize>(&mut self) -> WireResult<[u8; N]> {
        let b = self.take(N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(b);
        Ok(out)
    }

    /// Length-prefixed UTF-8 string with a hard cap.
    pub fn read_string(&mut self, max_length: usize) -> WireResult<String> {
        let len = self.read_count()? as usize;
        if len > max_length {
            return Err(WireError::StringTooLong);
        }
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| WireError::InvalidUtf8)
    }

    /// Fails unless every byte was consumed. Serialized messages carry no
    /// padding; trailing bytes mean the sender and we disagree on layout.
    pub fn expect_end(&self) -> WireResult<()> {
        if self.remaining() != 0 {
            return Err(WireError::TrailingBytes);
        }
        Ok(())
    }
}

// =============================================================================
// FRAME HEADER
// =============================================================================

/// Wire frame header: magic(4) | command(12, null-padded ASCII) |
/// length(4 LE) | checksum(4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub magic: [u8; 4],
    pub command: [u8; 12],
    pub length: u32,
    pub checksum: [u8; 4],
}

impl MessageHeader {
    pub fn new(magic: [u8; 4], command: &str, payload: &[u8]) -> Self {
        let mut cmd = [0u8; 12];
        cmd[..command.len()].copy_from_slice(command.as_bytes());
        Self {
            magic,
            command: cmd,
            length: payload.len() as u32,
            checksum: checksum(payload),
        }
    }

    /// Command as a str, stripped of null padding.
    pub fn command_str(&self) -> &str {
        let end = self.command.iter().position(|&b| b == 0).unwrap_or(12);
        // Validated printable-ASCII in deserialize_header
        std::str::from_utf8(&self.command[..end]).unwrap_or("")
    }
}

/// Serialize a frame header to exactly MESSAGE_HEADER_SIZE bytes.
pub fn serialize_header(header: &MessageHeader) -> Vec<u8> {
    let mut out = Vec::with_capacity(MESSAGE_HEADER_SIZE);
    out.extend_from_slice(&header.magic);
    out.extend_from_slice(&header.command);
    out.extend_from_slice(&header.length.to_le_bytes());
    out.extend_from_slice(&header.checksum);
    out
}

/// Parse and validate a frame header.
///
/// Rejects: short input, wrong magic, oversized length, and any non-null
/// byte after the first null in the command field (garbage trailers would
/// let two encodings name the same command).
pub fn deserialize_header(data: &[u8], expected_magic: [u8; 4]) -> WireResult<MessageHeader> {
    if data.len() < MESSAGE_HEADER_SIZE {
        return Err(WireError::UnexpectedEnd);
    }
    let mut magic = [0u8; 4];
    magic.copy_from_slice(&data[0..4]);
    if magic != expected_magic {
        return Err(WireError::BadMagic);
    }

    let mut command = [0u8; 12];
    command.copy_from_slice(&data[4..16]);
    let mut seen_null = false;
    for &b in &command {
        if seen_null {
            if b != 0 {
                return Err(WireError::BadCommand);
            }
        } else if b == 0 {
            seen_null = true;
        } else if !(0x20..0x7f).contains(&b) {
            return Err(WireError::BadCommand);
        }
    }

    let length = u32::from_le_bytes([data[16], data[17], data[18], data[19]]);
    if length > MAX_PROTOCOL_MESSAGE_LENGTH {
        return Err(WireError::OversizedPayload);
    }

    let mut cksum = [0u8; 4];
    cksum.copy_from_slice(&data[20..24]);

    Ok(MessageHeader { magic, command, length, checksum: cksum })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::types::MAINNET_MAGIC;

    fn roundtrip(value: u64) {
        let mut buf = Vec::new();
        write_varint(&mut buf, value);
        assert_eq!(buf.len(), varint_size(value));
        let (decoded, consumed) = read_varint(&buf).unwrap();
        assert_eq!(decoded, value);
        assert_eq!(consumed, buf.len());
    }

    #[test]
    fn test_varint_roundtrip_all_ranges() {
        for v in [0, 1, 0x7f, 0xfc] {
            roundtrip(v);
            assert_eq!(varint_size(v), 1);
        }
        for v in [0xfd, 0x100, 0xffff] {
            roundtrip(v);
            assert_eq!(varint_size(v), 3);
        }
        for v in [0x1_0000, 0x1234_5678, 0xffff_ffff] {
            roundtrip(v);
            assert_eq!(varint_size(v), 5);
        }
        for v in [0x1_0000_0000u64, 0x0123_4567_89ab_cdef, u64::MAX] {
            roundtrip(v);
            assert_eq!(varint_size(v), 9);
        }
    }

    #[test]
    fn test_varint_rejects_non_canonical() {
        // fd 05 00 decodes to 5, which encodes as a single byte
        assert_eq!(read_varint(&[0xfd, 0x05, 0x00]), Err(WireError::NonCanonicalVarInt));
        // fe with a value that fits in fd
        assert_eq!(
            read_varint(&[0xfe, 0xff, 0xff, 0x00, 0x00]),
            Err(WireError::NonCanonicalVarInt)
        );
        // ff with a value that fits in fe
        assert_eq!(
            read_varint(&[0xff, 0xff, 0xff, 0xff, 0xff, 0, 0, 0, 0]),
            Err(WireError::NonCanonicalVarInt)
        );
        // Canonical boundaries still pass
        assert_eq!(read_varint(&[0xfd, 0xfd, 0x00]).unwrap(), (0xfd, 3));
        assert_eq!(read_varint(&[0xfe, 0x00, 0x00, 0x01, 0x00]).unwrap(), (0x1_0000, 5));
    }

    #[test]
    fn test_varint_rejects_truncated() {
        assert_eq!(read_varint(&[]), Err(WireError::UnexpectedEnd));
        assert_eq!(read_varint(&[0xfd, 0x00]), Err(WireError::UnexpectedEnd));
        assert_eq!(read_varint(&[0xfe, 0, 0, 0]), Err(WireError::UnexpectedEnd));
        assert_eq!(read_varint(&[0xff, 0, 0, 0, 0, 0, 0, 0]), Err(WireError::UnexpectedEnd));
    }

    #[test]
    fn test_count_cap() {
        // CompactSize bomb: u64::MAX item count must be rejected before
        // any allocation happens
        let mut buf = Vec::new();
        write_varint(&mut buf, u64::MAX);
        let mut reader = Reader::new(&buf);
        assert_eq!(reader.read_count(), Err(WireError::SizeTooLarge));
    }

    #[test]
    fn test_primitives_little_endian() {
        let mut w = Writer::new();
        w.write_u16(0x1234);
        w.write_u32(0x1234_5678);
        w.write_i32(-1);
        let bytes = w.into_bytes();
        assert_eq!(&bytes[..2], &[0x34, 0x12]);
        assert_eq!(&bytes[2..6], &[0x78, 0x56, 0x34, 0x12]);
        assert_eq!(&bytes[6..10], &[0xff; 4]);

        let mut r = Reader::new(&bytes);
        assert_eq!(r.read_u16().unwrap(), 0x1234);
        assert_eq!(r.read_u32().unwrap(), 0x1234_5678);
        assert_eq!(r.read_i32().unwrap(), -1);
        assert!(r.expect_end().is_ok());
    }

    #[test]
    fn test_reader_underflow() {
        let mut r = Reader::new(&[0x01]);
        assert_eq!(r.read_u32(), Err(WireError::UnexpectedEnd));
    }

    #[test]
    fn test_bool_strict() {
        let mut r = Reader::new(&[2]);
        assert_eq!(r.read_bool(), Err(WireError::InvalidValue));
    }

    #[test]
    fn test_string_cap() {
        let mut w = Writer::new();
        w.write_string(&"x".repeat(300));
        let bytes = w.into_bytes();
        let mut r = Reader::new(&bytes);
        assert_eq!(r.read_string(256), Err(WireError::StringTooLong));
    }

    #[test]
    fn test_header_roundtrip() {
        let payload = b"hello".to_vec();
        let header = MessageHeader::new(MAINNET_MAGIC, "ping", &payload);
        let bytes = serialize_header(&header);
        assert_eq!(bytes.len(), MESSAGE_HEADER_SIZE);

        let parsed = deserialize_header(&bytes, MAINNET_MAGIC).unwrap();
        assert_eq!(parsed, header);
        assert_eq!(parsed.command_str(), "ping");
        assert_eq!(parsed.checksum, checksum(&payload));
    }

    #[test]
    fn test_header_rejects_bad_magic() {
        let header = MessageHeader::new(MAINNET_MAGIC, "ping", b"");
        let bytes = serialize_header(&header);
        assert_eq!(
            deserialize_header(&bytes, *b"XXXX"),
            Err(WireError::BadMagic)
        );
    }

    #[test]
    fn test_header_rejects_command_trailer_garbage() {
        let header = MessageHeader::new(MAINNET_MAGIC, "ping", b"");
        let mut bytes = serialize_header(&header);
        // byte after the terminating null must itself be null
        bytes[4 + 9] = b'x';
        assert_eq!(
            deserialize_header(&bytes, MAINNET_MAGIC),
            Err(WireError::BadCommand)
        );
    }

    #[test]
    fn test_header_rejects_oversized_length() {
        let header = MessageHeader::new(MAINNET_MAGIC, "headers", b"");
        let mut bytes = serialize_header(&header);
        bytes[16..20].copy_from_slice(&(MAX_PROTOCOL_MESSAGE_LENGTH + 1).to_le_bytes());
        assert_eq!(
            deserialize_header(&bytes, MAINNET_MAGIC),
            Err(WireError::OversizedPayload)
        );
    }

    #[test]
    fn test_checksum_known_shape() {
        // Empty payload checksum is the first 4 bytes of SHA256d("")
        let c = checksum(b"");
        assert_eq!(c, [0x5d, 0xf6, 0xe0, 0xe2]);
    }
}
