//! The underlying binary frame protocol of the 7Bot serial port
//!
//! ```text
//! [0xAA, 0x77, type, address, length, payload[0..length), crc_lo, crc_hi]
//! ```
//!
//! The checksum is MODBUS CRC16 over everything before the two CRC bytes.

use std::fmt;
use std::io::{self, Read};

use scroll::{LE, Pread, Pwrite};

use crate::constants::{HEADER_LEN, MAX_PAYLOAD_LEN, SYNC, packets};
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    Read = packets::READ,
    Write = packets::WRITE,
    /// Unsolicited push, sent by the device without a request.
    Feedback = packets::FEEDBACK,
}

impl TryFrom<u8> for PacketType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            packets::READ => Ok(PacketType::Read),
            packets::WRITE => Ok(PacketType::Write),
            packets::FEEDBACK => Ok(PacketType::Feedback),
            other => Err(Error::Framing(format!("unknown packet type 0x{:02x}", other))),
        }
    }
}

/// MODBUS CRC16: poly 0xA001 (reflected 0x8005), init 0xFFFF, LSB first.
pub fn crc16_modbus(data: &[u8]) -> u16 {
    data.iter().fold(0xffff, |mut crc, &byte| {
        crc ^= byte as u16;
        for _ in 0..8 {
            if crc & 1 != 0 {
                crc = (crc >> 1) ^ 0xa001;
            } else {
                crc >>= 1;
            }
        }
        crc
    })
}

/// Lays out sync + header + payload and appends the checksum, low byte first.
fn seal(kind: PacketType, address: u8, len_field: u8, payload: &[u8]) -> Result<Vec<u8>> {
    let body = HEADER_LEN + payload.len();
    let mut buf = vec![0u8; body + 2];
    buf[..2].copy_from_slice(&SYNC);
    buf[2] = kind as u8;
    buf[3] = address;
    buf[4] = len_field;
    buf[HEADER_LEN..body].copy_from_slice(payload);
    let crc = crc16_modbus(&buf[..body]);
    buf.pwrite_with(crc, body, LE)?;
    Ok(buf)
}

/// Encode one complete frame carrying `payload`.
pub fn encode_frame(kind: PacketType, address: u8, payload: &[u8]) -> Result<Vec<u8>> {
    if payload.len() > MAX_PAYLOAD_LEN {
        return Err(Error::InvalidArgument(format!(
            "payload of {} bytes does not fit in one frame",
            payload.len()
        )));
    }
    seal(kind, address, payload.len() as u8, payload)
}

/// Host to device request.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Request {
    /// Read `count` consecutive registers starting at `address`.
    ///
    /// Sent header-only: the length byte carries `count`, no payload follows.
    Read { address: u8, count: u8 },
    /// Write `data` into consecutive registers starting at `address`.
    Write { address: u8, data: Vec<u8> },
}

impl Request {
    pub fn read(address: u8, count: u8) -> Self {
        Request::Read { address, count }
    }

    pub fn write(address: u8, data: Vec<u8>) -> Self {
        Request::Write { address, data }
    }

    pub fn kind(&self) -> PacketType {
        match self {
            Request::Read { .. } => PacketType::Read,
            Request::Write { .. } => PacketType::Write,
        }
    }

    pub fn into_raw(self) -> Result<Vec<u8>> {
        match self {
            Request::Read { address, count } => seal(PacketType::Read, address, count, &[]),
            Request::Write { address, data } => encode_frame(PacketType::Write, address, &data),
        }
    }
}

/// A validated frame with sync, header length and checksum stripped.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Frame {
    pub kind: PacketType,
    pub address: u8,
    pub payload: Vec<u8>,
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?}@{}[{}]",
            self.kind,
            self.address,
            hex::encode(&self.payload)
        )
    }
}

impl Frame {
    pub fn expect(&self, kind: PacketType) -> Result<&Self> {
        if self.kind != kind {
            return Err(Error::Framing(format!(
                "mismatching packet type: expected {:?}, got {:?}",
                kind, self.kind
            )));
        }
        Ok(self)
    }
}

fn is_timeout(err: &io::Error) -> bool {
    matches!(err.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock)
}

/// `None` means the per-byte timeout expired without data.
fn read_byte<R: Read + ?Sized>(reader: &mut R) -> Result<Option<u8>> {
    let mut byte = [0u8; 1];
    loop {
        return match reader.read(&mut byte) {
            Ok(0) => Ok(None),
            Ok(_) => Ok(Some(byte[0])),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) if is_timeout(&e) => Ok(None),
            Err(e) => Err(e.into()),
        };
    }
}

fn fill<R: Read + ?Sized>(reader: &mut R, buf: &mut [u8]) -> Result<()> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => {
                return Err(Error::Timeout(format!(
                    "frame truncated after {} of {} bytes",
                    filled,
                    buf.len()
                )));
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) if is_timeout(&e) => {
                return Err(Error::Timeout(format!(
                    "frame truncated after {} of {} bytes",
                    filled,
                    buf.len()
                )));
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

/// Scan `reader` for the next frame and validate its checksum.
///
/// The sync scan gives up after `max_attempts` empty reads, or after
/// `2 * max_attempts` bytes that did not complete a sync sequence.
pub fn read_frame<R: Read + ?Sized>(reader: &mut R, max_attempts: usize) -> Result<Frame> {
    scan_frame(reader, max_attempts, max_attempts * 2)
}

/// [`read_frame`] with separate bounds on empty reads and on skipped bytes.
pub fn scan_frame<R: Read + ?Sized>(
    reader: &mut R,
    max_idle: usize,
    max_scanned: usize,
) -> Result<Frame> {
    let mut idle = 0;
    let mut scanned = 0;
    let mut prev = None;
    loop {
        match read_byte(reader)? {
            Some(byte) => {
                if prev == Some(SYNC[0]) && byte == SYNC[1] {
                    break;
                }
                prev = Some(byte);
                scanned += 1;
                if scanned >= max_scanned {
                    return Err(Error::Timeout(format!(
                        "no frame header within {} bytes",
                        scanned
                    )));
                }
            }
            None => {
                idle += 1;
                if idle >= max_idle {
                    return Err(Error::Timeout(format!(
                        "no frame header after {} empty reads",
                        idle
                    )));
                }
            }
        }
    }

    let mut raw = vec![0u8; HEADER_LEN];
    raw[..2].copy_from_slice(&SYNC);
    fill(reader, &mut raw[2..])?;
    let len = raw[4] as usize;
    raw.resize(HEADER_LEN + len + 2, 0);
    fill(reader, &mut raw[HEADER_LEN..])?;
    log::debug!("<= {}", hex::encode(&raw));

    let body = raw.len() - 2;
    let received: u16 = raw.pread_with(body, LE)?;
    let computed = crc16_modbus(&raw[..body]);
    if received != computed {
        return Err(Error::Framing(format!(
            "data corrupted: crc {:04x} != {:04x}",
            received, computed
        )));
    }

    Ok(Frame {
        kind: PacketType::try_from(raw[2])?,
        address: raw[3],
        payload: raw[HEADER_LEN..body].to_vec(),
    })
}

/// Read one frame of the `expected` type and return its payload.
pub fn decode_frame<R: Read + ?Sized>(
    reader: &mut R,
    expected: PacketType,
    max_attempts: usize,
) -> Result<Vec<u8>> {
    let frame = read_frame(reader, max_attempts)?;
    frame.expect(expected)?;
    Ok(frame.payload)
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    #[test]
    fn test_crc_reference_vectors() {
        assert_eq!(crc16_modbus(b"123456789"), 0x4b37);
        assert_eq!(crc16_modbus(&[0x01, 0x03, 0x00, 0x00, 0x00, 0x0a]), 0xcdc5);
        assert_eq!(crc16_modbus(&[]), 0xffff);
    }

    #[test]
    fn test_frame_round_trip() {
        let payloads: [&[u8]; 4] = [&[], &[0x2a], &[50, 80, 50, 50, 50, 50, 40], &[0xaa; 255]];
        for kind in [PacketType::Read, PacketType::Write, PacketType::Feedback] {
            for (address, payload) in payloads.iter().enumerate() {
                let raw = encode_frame(kind, address as u8 * 60, payload).unwrap();
                assert_eq!(raw.len(), HEADER_LEN + payload.len() + 2);
                let decoded = decode_frame(&mut Cursor::new(raw), kind, 50).unwrap();
                assert_eq!(&decoded[..], *payload);
            }
        }
    }

    #[test]
    fn test_oversized_payload_rejected() {
        let err = encode_frame(PacketType::Write, 0, &[0u8; 256]).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn test_read_request_is_header_only() {
        let raw = Request::read(11, 1).into_raw().unwrap();
        assert_eq!(&raw[..5], &[0xaa, 0x77, 0x03, 0x0b, 0x01]);
        assert_eq!(raw.len(), 7);
        let crc = crc16_modbus(&raw[..5]);
        assert_eq!(raw[5], (crc & 0xff) as u8);
        assert_eq!(raw[6], (crc >> 8) as u8);
    }

    #[test]
    fn test_recovers_after_garbage() {
        let mut stream = vec![0x00, 0x13, 0xaa, 0x00, 0x77, 0xaa, 0xaa];
        // the second 0xaa above starts the real frame
        let frame = encode_frame(PacketType::Read, 83, &[90, 91, 92]).unwrap();
        stream.extend_from_slice(&frame[1..]);
        let payload = decode_frame(&mut Cursor::new(stream), PacketType::Read, 50).unwrap();
        assert_eq!(payload, vec![90, 91, 92]);
    }

    #[test]
    fn test_pure_garbage_times_out() {
        let err =
            decode_frame(&mut Cursor::new(vec![0x11; 500]), PacketType::Read, 50).unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));

        // a line that never goes quiet must not block forever either
        let err = decode_frame(&mut io::repeat(0xaa), PacketType::Read, 50).unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));

        let err = decode_frame(&mut io::empty(), PacketType::Read, 50).unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
    }

    #[test]
    fn test_checksum_mismatch() {
        let mut raw = encode_frame(PacketType::Read, 11, &[7]).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0xff;
        let err = decode_frame(&mut Cursor::new(raw), PacketType::Read, 50).unwrap_err();
        assert!(matches!(err, Error::Framing(_)));
    }

    #[test]
    fn test_unexpected_type() {
        let raw = encode_frame(PacketType::Feedback, 83, &[1, 2, 3]).unwrap();
        let err = decode_frame(&mut Cursor::new(raw), PacketType::Read, 50).unwrap_err();
        assert!(matches!(err, Error::Framing(_)));
    }

    #[test]
    fn test_truncated_frame() {
        let raw = encode_frame(PacketType::Read, 2, &[1, 2, 3, 4, 5, 6]).unwrap();
        let err = read_frame(&mut Cursor::new(&raw[..8]), 50).unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
    }

    /// Fails every other read with EINTR.
    struct Interrupting {
        inner: Cursor<Vec<u8>>,
        interrupt: bool,
    }

    impl Read for Interrupting {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.interrupt = !self.interrupt;
            if self.interrupt {
                return Err(io::ErrorKind::Interrupted.into());
            }
            self.inner.read(buf)
        }
    }

    #[test]
    fn test_interrupted_reads_are_retried() {
        let raw = encode_frame(PacketType::Read, 83, &[1, 2, 3, 4, 5, 6, 7]).unwrap();
        let mut reader = Interrupting {
            inner: Cursor::new(raw),
            interrupt: false,
        };
        // one empty read allowed: EINTR must not use it up
        let frame = scan_frame(&mut reader, 1, 2).unwrap();
        assert_eq!(frame.payload, vec![1, 2, 3, 4, 5, 6, 7]);
    }

    #[test]
    fn test_scan_bounds_are_separate() {
        let mut stream = vec![0x00; 10];
        stream.extend(encode_frame(PacketType::Feedback, 54, &[2]).unwrap());
        let frame = scan_frame(&mut Cursor::new(stream.clone()), 1, 100).unwrap();
        assert_eq!(frame.address, 54);

        let err = scan_frame(&mut Cursor::new(stream), 1, 4).unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
    }
}
