//! Serial Transportation.
use std::{
    io::{Read, Write},
    time::{Duration, Instant},
};

use serialport::SerialPort;

use super::{Ack, ConnectionState, Transport};
use crate::constants::{BAUD_RATE, defaults};
use crate::error::{Error, Result};
use crate::protocol::{self, PacketType, Request};
use crate::registers::Register;

/// Empty reads tolerated while listening for an alarm. Skipped bytes are
/// bounded by the usual header scan limit.
const ALARM_IDLE_READS: usize = 1;

pub struct SerialTransport<P = Box<dyn SerialPort>> {
    port: P,
    max_header_attempts: usize,
}

impl SerialTransport<Box<dyn SerialPort>> {
    pub fn scan_ports() -> Result<Vec<String>> {
        let ports = serialport::available_ports()?;
        Ok(ports.into_iter().map(|p| p.port_name).collect())
    }

    pub fn open(port: &str, baud_rate: u32, timeout: Duration) -> Result<Self> {
        log::info!("Opening serial port: \"{}\" @ {} baud", port, baud_rate);
        let port = serialport::new(port, baud_rate).timeout(timeout).open()?;
        Ok(SerialTransport::new(port))
    }

    pub fn open_nth(nth: usize) -> Result<Self> {
        let ports = serialport::available_ports()?;

        match ports.get(nth) {
            Some(port) => Self::open(
                &port.port_name,
                BAUD_RATE,
                Duration::from_millis(defaults::SERIAL_TIMEOUT_MS),
            ),
            None => Err(Error::Configuration("No serial ports found!".into())),
        }
    }

    pub fn open_any() -> Result<Self> {
        Self::open_nth(0)
    }
}

impl<P: Read + Write> SerialTransport<P> {
    /// Wrap an already opened byte stream. Reads on it must time out rather than block.
    pub fn new(port: P) -> Self {
        SerialTransport {
            port,
            max_header_attempts: defaults::MAX_HEADER_ATTEMPTS,
        }
    }

    pub fn with_max_header_attempts(mut self, attempts: usize) -> Self {
        self.max_header_attempts = attempts;
        self
    }

    pub fn get_ref(&self) -> &P {
        &self.port
    }

    pub fn get_mut(&mut self) -> &mut P {
        &mut self.port
    }

    fn send(&mut self, req: Request) -> Result<()> {
        let raw = req.into_raw()?;
        log::debug!("=> {}", hex::encode(&raw));
        self.port.write_all(&raw)?;
        self.port.flush()?;
        Ok(())
    }
}

impl<P: Read + Write> Transport for SerialTransport<P> {
    fn name(&self) -> &'static str {
        "serial"
    }

    fn state(&self) -> ConnectionState {
        ConnectionState::Connected
    }

    fn read_register(&mut self, address: u8, count: u8) -> Result<Vec<u8>> {
        self.send(Request::read(address, count))?;
        protocol::decode_frame(&mut self.port, PacketType::Read, self.max_header_attempts)
    }

    fn write_register(&mut self, address: u8, values: &[u8]) -> Result<Ack> {
        // the device does not answer writes
        self.send(Request::write(address, values.to_vec()))?;
        Ok(Ack::Sent)
    }

    /// Waits for the next auto feedback push instead of polling.
    fn read_feedback(&mut self, register: &Register) -> Result<Vec<u8>> {
        let frame = protocol::read_frame(&mut self.port, self.max_header_attempts)?;
        frame.expect(PacketType::Feedback)?;
        if frame.address != register.address {
            return Err(Error::Framing(format!(
                "feedback for register {} while waiting for {} ({})",
                frame.address, register.address, register.name
            )));
        }
        Ok(frame.payload)
    }

    fn check_alarm(&mut self, address: u8, window: Duration) -> Result<()> {
        if window.is_zero() {
            return Ok(());
        }
        let deadline = Instant::now() + window;
        while Instant::now() < deadline {
            let scanned = self.max_header_attempts * 2;
            match protocol::scan_frame(&mut self.port, ALARM_IDLE_READS, scanned) {
                Ok(frame) if frame.kind == PacketType::Feedback && frame.address == address => {
                    return match frame.payload.first() {
                        Some(&code) if code != 0 => {
                            log::warn!("Device alarm 0x{:02x} for register {}", code, address);
                            Err(Error::Range {
                                address,
                                reason: format!("alarm code 0x{:02x}", code),
                            })
                        }
                        _ => Ok(()),
                    };
                }
                Ok(frame) => log::debug!("Ignoring {:?} while waiting for alarm", frame),
                Err(Error::Timeout(_)) => break,
                Err(Error::Framing(reason)) => log::debug!("Skipping bad frame: {}", reason),
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod mock {
    use std::collections::VecDeque;
    use std::io::{self, Read, Write};

    use crate::protocol::{PacketType, encode_frame};

    /// In-memory serial line: scripted device output, captured host output.
    #[derive(Debug, Default)]
    pub struct MockPort {
        pub rx: VecDeque<u8>,
        pub tx: Vec<u8>,
    }

    impl MockPort {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn push_bytes(&mut self, bytes: &[u8]) {
            self.rx.extend(bytes.iter().copied());
        }

        pub fn push_frame(&mut self, kind: PacketType, address: u8, payload: &[u8]) {
            let raw = encode_frame(kind, address, payload).unwrap();
            self.push_bytes(&raw);
        }
    }

    impl Read for MockPort {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.rx.is_empty() {
                return Err(io::ErrorKind::TimedOut.into());
            }
            let n = buf.len().min(self.rx.len());
            for (slot, byte) in buf.iter_mut().zip(self.rx.drain(..n)) {
                *slot = byte;
            }
            Ok(n)
        }
    }

    impl Write for MockPort {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.tx.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }
}
