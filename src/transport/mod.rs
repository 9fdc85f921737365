//! Abstract arm transport interface.
use std::time::Duration;

use serde::Serialize;

use crate::error::Result;
use crate::registers::{self, Register};

pub use self::serial::SerialTransport;
pub use self::socket::{Connector, SocketLink, SocketOptions, SocketTransport, WsConnector};

pub mod serial;
pub mod socket;

/// Connection lifecycle:
/// `Disconnected -> Connecting -> Connected <-> Reconnecting -> Stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Stopped,
}

/// Acknowledgement for commands that do not wait for a device reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Ack {
    /// Handed to the wire.
    Sent,
    /// Nothing to send on this transport.
    Local,
}

/// High level commands some transports carry with a dedicated verb.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Action {
    Status(u8),
    Vacuum(u8),
    /// 0 means maximum speed.
    Speed(u8),
    Angle { joint: usize, angle: u8 },
    Angles(Vec<u8>),
    Ik5 { pos: [i16; 3] },
    Ik6 { pos: [i16; 3], vec56: [i8; 3] },
    Ik7 { pos: [i16; 3], vec56: [i8; 3], vec67: [i8; 3] },
}

impl Action {
    /// The generic register write with the same device-visible effect.
    pub fn to_register_write(&self) -> Result<(u8, Vec<u8>)> {
        Ok(match self {
            Action::Status(status) => (registers::MOTOR_STATUS.address, vec![*status]),
            Action::Vacuum(on) => (registers::VACUUM.address, vec![*on]),
            Action::Speed(speed) => (registers::SPEED.address, registers::SPEED.broadcast(*speed)),
            Action::Angle { joint, angle } => (registers::ANGLE.joint(*joint)?, vec![*angle]),
            Action::Angles(angles) => (registers::ANGLE.address, angles.clone()),
            Action::Ik5 { pos } => (registers::IK5.address, registers::encode_ik5(*pos)?),
            Action::Ik6 { pos, vec56 } => {
                (registers::IK.address, registers::encode_ik6(*pos, *vec56)?)
            }
            Action::Ik7 { pos, vec56, vec67 } => (
                registers::IK.address,
                registers::encode_ik7(*pos, *vec56, *vec67)?,
            ),
        })
    }
}

/// Abstraction of the transport layer.
/// Either the framed serial link or the WebSocket link.
pub trait Transport {
    /// Short protocol name, e.g. for status reports.
    fn name(&self) -> &'static str;

    fn state(&self) -> ConnectionState;

    fn read_register(&mut self, address: u8, count: u8) -> Result<Vec<u8>>;

    fn write_register(&mut self, address: u8, values: &[u8]) -> Result<Ack>;

    /// Carry out `action`, by default as a plain register write.
    fn send_action(&mut self, action: &Action) -> Result<Ack> {
        let (address, values) = action.to_register_write()?;
        self.write_register(address, &values)
    }

    /// Read the latest values of a feedback register run.
    fn read_feedback(&mut self, register: &Register) -> Result<Vec<u8>> {
        self.read_register(register.address, register.len)
    }

    /// Give the device `window` to object to the value just written at `address`.
    fn check_alarm(&mut self, address: u8, window: Duration) -> Result<()>;

    fn ping(&mut self) -> Result<Ack> {
        Ok(Ack::Local)
    }
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    fn state(&self) -> ConnectionState {
        (**self).state()
    }

    fn read_register(&mut self, address: u8, count: u8) -> Result<Vec<u8>> {
        (**self).read_register(address, count)
    }

    fn write_register(&mut self, address: u8, values: &[u8]) -> Result<Ack> {
        (**self).write_register(address, values)
    }

    fn send_action(&mut self, action: &Action) -> Result<Ack> {
        (**self).send_action(action)
    }

    fn read_feedback(&mut self, register: &Register) -> Result<Vec<u8>> {
        (**self).read_feedback(register)
    }

    fn check_alarm(&mut self, address: u8, window: Duration) -> Result<()> {
        (**self).check_alarm(address, window)
    }

    fn ping(&mut self) -> Result<Ack> {
        (**self).ping()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_actions_lower_to_register_writes() {
        assert_eq!(
            Action::Speed(0).to_register_write().unwrap(),
            (32, vec![0; 7])
        );
        assert_eq!(
            Action::Angle { joint: 2, angle: 90 }.to_register_write().unwrap(),
            (48, vec![90])
        );
        assert_eq!(Action::Status(2).to_register_write().unwrap(), (29, vec![2]));
        assert_eq!(Action::Vacuum(1).to_register_write().unwrap(), (31, vec![1]));

        let (address, payload) = Action::Ik5 { pos: [0, 200, -24] }.to_register_write().unwrap();
        assert_eq!(address, 68);
        assert_eq!(payload, vec![0x04, 0x00, 0x04, 0xc8, 0x03, 0xe8]);

        assert!(Action::Angle { joint: 7, angle: 0 }.to_register_write().is_err());
    }
}
