//! Arm control logic.

use std::fmt;
use std::thread::sleep;
use std::time::Duration;

use serde::Serialize;

use crate::config::{ArmConfig, TransportConfig};
use crate::constants::{SERVO_NUM, defaults};
use crate::error::{Error, Result};
use crate::registers::{self, Register};
use crate::transport::{Ack, Action, ConnectionState, Transport};

/// Angles the firmware boots into.
pub const HOME_ANGLES: [u8; SERVO_NUM] = [90, 90, 65, 90, 90, 90, 80];
pub const SAFE_ANGLES: [u8; SERVO_NUM] = [90; SERVO_NUM];

/// Speed value that means "as fast as the joints go" (190°/s), not zero.
pub const SPEED_MAX: u8 = 0;

/// Motor mode. Only changes when set explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[repr(u8)]
pub enum MotorStatus {
    /// Joints locked in place.
    Protection = 0,
    /// Joints follow commanded angles.
    Servo = 1,
    /// Joints move freely by hand.
    Forceless = 2,
}

impl TryFrom<u8> for MotorStatus {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(MotorStatus::Protection),
            1 => Ok(MotorStatus::Servo),
            2 => Ok(MotorStatus::Forceless),
            other => Err(Error::Protocol(format!("unknown motor status {}", other))),
        }
    }
}

impl fmt::Display for MotorStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MotorStatus::Protection => "protection",
            MotorStatus::Servo => "servo",
            MotorStatus::Forceless => "forceless",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SystemInfo {
    pub device_code: u8,
    pub version: f32,
    pub mac: String,
    pub device_id: u8,
    pub protocol: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusReport {
    pub system_info: SystemInfo,
    pub angles: Vec<u8>,
    pub loads: Vec<u8>,
    pub motor_status: MotorStatus,
    pub vacuum: bool,
}

/// High level access to one arm over any [`Transport`].
pub struct Arm<T: Transport> {
    transport: T,
    feedback_retries: usize,
    feedback_retry_delay: Duration,
    alarm_window: Duration,
    settle_delay: Duration,
}

impl Arm<Box<dyn Transport + Send>> {
    /// Open the configured transport and wrap it.
    pub fn connect(config: &ArmConfig) -> Result<Self> {
        let transport = config.transport.open(config.max_header_attempts)?;
        log::info!("Connected to arm via {}", transport.name());
        Ok(Arm::new(transport).with_config(config))
    }

    /// Tear down the current link, then open the one `config` describes.
    ///
    /// If the new link cannot be opened the error is returned and the arm is
    /// left without a working transport; it never falls back to the old one.
    pub fn switch_transport(
        &mut self,
        config: &TransportConfig,
        max_header_attempts: usize,
    ) -> Result<()> {
        let old = std::mem::replace(&mut self.transport, Box::new(Detached));
        let from = old.name();
        drop(old);
        self.transport = config.open(max_header_attempts)?;
        log::info!("Switched from {} to {} protocol", from, self.transport.name());
        Ok(())
    }
}

/// Placeholder held while a transport is being replaced.
struct Detached;

impl Transport for Detached {
    fn name(&self) -> &'static str {
        "detached"
    }

    fn state(&self) -> ConnectionState {
        ConnectionState::Disconnected
    }

    fn read_register(&mut self, _address: u8, _count: u8) -> Result<Vec<u8>> {
        Err(Error::Connection("no transport attached".into()))
    }

    fn write_register(&mut self, _address: u8, _values: &[u8]) -> Result<Ack> {
        Err(Error::Connection("no transport attached".into()))
    }

    fn check_alarm(&mut self, _address: u8, _window: Duration) -> Result<()> {
        Err(Error::Connection("no transport attached".into()))
    }
}

fn exact_len(register: &Register, values: Vec<u8>) -> Result<Vec<u8>> {
    if values.len() != register.len as usize {
        return Err(Error::Protocol(format!(
            "{} returned {} bytes, expected {}",
            register.name,
            values.len(),
            register.len
        )));
    }
    Ok(values)
}

impl<T: Transport> Arm<T> {
    pub fn new(transport: T) -> Self {
        Arm {
            transport,
            feedback_retries: defaults::FEEDBACK_RETRIES,
            feedback_retry_delay: Duration::from_millis(defaults::FEEDBACK_RETRY_DELAY_MS),
            alarm_window: Duration::from_millis(defaults::ALARM_WINDOW_MS),
            settle_delay: Duration::from_millis(500),
        }
    }

    pub fn with_config(mut self, config: &ArmConfig) -> Self {
        self.feedback_retries = config.feedback_retries;
        self.feedback_retry_delay = config.feedback_retry_delay();
        self.alarm_window = config.alarm_window();
        self
    }

    pub fn with_alarm_window(mut self, window: Duration) -> Self {
        self.alarm_window = window;
        self
    }

    pub fn with_feedback_retry(mut self, retries: usize, delay: Duration) -> Self {
        self.feedback_retries = retries;
        self.feedback_retry_delay = delay;
        self
    }

    /// Pause used by [`Arm::home`] and [`Arm::reset`] between mode and motion.
    pub fn with_settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn into_transport(self) -> T {
        self.transport
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.transport.state()
    }

    pub fn ping(&mut self) -> Result<Ack> {
        self.transport.ping()
    }

    /// Read a whole register run, which must come back at its exact length.
    pub fn read_register(&mut self, register: &Register) -> Result<Vec<u8>> {
        let values = self.transport.read_register(register.address, register.len)?;
        exact_len(register, values)
    }

    fn read_byte(&mut self, address: u8, name: &str) -> Result<u8> {
        let values = self.transport.read_register(address, 1)?;
        match values[..] {
            [value] => Ok(value),
            _ => Err(Error::Protocol(format!(
                "{} returned {} bytes, expected 1",
                name,
                values.len()
            ))),
        }
    }

    /// Write a whole register run. ROM registers are refused before anything is sent.
    pub fn write_register(&mut self, register: &Register, values: &[u8]) -> Result<Ack> {
        register.check_writable()?;
        register.check_len(values)?;
        self.transport.write_register(register.address, values)
    }

    // Identity

    pub fn device_code(&mut self) -> Result<u8> {
        self.read_byte(registers::DEVICE_TYPE.address, registers::DEVICE_TYPE.name)
    }

    /// Firmware version, e.g. `2.1`.
    pub fn version(&mut self) -> Result<f32> {
        let raw = self.read_byte(registers::VERSION.address, registers::VERSION.name)?;
        Ok(raw as f32 / 10.0)
    }

    pub fn mac(&mut self) -> Result<String> {
        let raw = self.read_register(&registers::MAC)?;
        Ok(registers::format_mac(&raw))
    }

    pub fn id(&mut self) -> Result<u8> {
        self.read_byte(registers::DEVICE_ID.address, registers::DEVICE_ID.name)
    }

    /// Persistent; the EEPROM lock must be released first.
    pub fn set_id(&mut self, id: u8) -> Result<Ack> {
        self.write_register(&registers::DEVICE_ID, &[id])
    }

    pub fn system_info(&mut self) -> Result<SystemInfo> {
        Ok(SystemInfo {
            device_code: self.device_code()?,
            version: self.version()?,
            mac: self.mac()?,
            device_id: self.id()?,
            protocol: self.transport.name().to_uppercase(),
        })
    }

    pub fn status_report(&mut self) -> Result<StatusReport> {
        Ok(StatusReport {
            system_info: self.system_info()?,
            angles: self.angles()?,
            loads: self.loads()?,
            motor_status: self.motor_status()?,
            vacuum: self.vacuum()?,
        })
    }

    // EEPROM

    /// `true` while EEPROM writes are blocked.
    pub fn eeprom_lock(&mut self) -> Result<bool> {
        Ok(self.read_byte(registers::EEPROM_LOCK.address, registers::EEPROM_LOCK.name)? != 0)
    }

    pub fn set_eeprom_lock(&mut self, locked: bool) -> Result<Ack> {
        self.write_register(&registers::EEPROM_LOCK, &[locked as u8])
    }

    /// Reset the EEPROM block (device id, baud rate, offsets) to factory values.
    /// Erases any calibrated offsets.
    pub fn eeprom_init(&mut self) -> Result<()> {
        let mut block = vec![0u8, 0u8];
        block.extend(registers::OFFSETS.broadcast(registers::encode_vector(0)));
        self.set_eeprom_lock(false)?;
        self.write_register(&registers::EEPROM, &block)?;
        self.set_eeprom_lock(true)?;
        log::info!("EEPROM initialised");
        Ok(())
    }

    // Motor status

    pub fn motor_status(&mut self) -> Result<MotorStatus> {
        let raw = self.read_byte(registers::MOTOR_STATUS.address, registers::MOTOR_STATUS.name)?;
        MotorStatus::try_from(raw)
    }

    pub fn set_motor_status(&mut self, status: MotorStatus) -> Result<Ack> {
        self.transport.send_action(&Action::Status(status as u8))
    }

    // Offsets

    /// Per-joint calibration offsets in degrees.
    pub fn offsets(&mut self) -> Result<Vec<i8>> {
        let raw = self.read_register(&registers::OFFSETS)?;
        Ok(raw.into_iter().map(registers::decode_vector).collect())
    }

    pub fn set_offsets(&mut self, offsets: &[i8]) -> Result<Ack> {
        registers::OFFSETS.check_len(offsets)?;
        let raw: Vec<u8> = offsets.iter().map(|&o| registers::encode_vector(o)).collect();
        self.write_register(&registers::OFFSETS, &raw)
    }

    pub fn clear_offsets(&mut self) -> Result<Ack> {
        self.set_offsets(&[0; SERVO_NUM])
    }

    // Angles and loads

    pub fn angle(&mut self, joint: usize) -> Result<u8> {
        let address = registers::ANGLE_FEEDBACK.joint(joint)?;
        self.read_byte(address, registers::ANGLE_FEEDBACK.name)
    }

    pub fn angles(&mut self) -> Result<Vec<u8>> {
        self.read_register(&registers::ANGLE_FEEDBACK)
    }

    pub fn set_angle(&mut self, joint: usize, angle: u8) -> Result<Ack> {
        registers::ANGLE.joint(joint)?;
        self.transport.send_action(&Action::Angle { joint, angle })
    }

    /// All joints at once, in degrees (0..=180).
    pub fn set_angles(&mut self, angles: &[u8]) -> Result<Ack> {
        registers::ANGLE.check_len(angles)?;
        self.transport.send_action(&Action::Angles(angles.to_vec()))
    }

    pub fn load(&mut self, joint: usize) -> Result<u8> {
        let address = registers::LOAD_FEEDBACK.joint(joint)?;
        self.read_byte(address, registers::LOAD_FEEDBACK.name)
    }

    pub fn loads(&mut self) -> Result<Vec<u8>> {
        self.read_register(&registers::LOAD_FEEDBACK)
    }

    /// Next angle feedback report, retried a bounded number of times.
    pub fn read_angles_feedback(&mut self) -> Result<Vec<u8>> {
        let attempts = self.feedback_retries.max(1);
        let mut attempt = 1;
        loop {
            let feedback = self
                .transport
                .read_feedback(&registers::ANGLE_FEEDBACK)
                .and_then(|values| exact_len(&registers::ANGLE_FEEDBACK, values));
            match feedback {
                Ok(angles) => return Ok(angles),
                Err(e) if attempt < attempts => {
                    log::warn!(
                        "Angle feedback failed ({}), retrying... (attempt {}/{})",
                        e,
                        attempt + 1,
                        attempts
                    );
                    sleep(self.feedback_retry_delay);
                    attempt += 1;
                }
                Err(e) => {
                    log::warn!("Angle feedback failed after {} attempts", attempts);
                    return Err(e);
                }
            }
        }
    }

    // End effector

    pub fn vacuum(&mut self) -> Result<bool> {
        Ok(self.read_byte(registers::VACUUM.address, registers::VACUUM.name)? != 0)
    }

    pub fn set_vacuum(&mut self, on: bool) -> Result<Ack> {
        self.transport.send_action(&Action::Vacuum(on as u8))
    }

    pub fn set_effector(&mut self, effector: u8) -> Result<Ack> {
        self.write_register(&registers::EFFECTOR, &[effector])
    }

    // Motion

    /// Joint speed in units of 1.9°/s (0..=100). [`SPEED_MAX`] selects full speed.
    pub fn set_speed(&mut self, speed: u8) -> Result<Ack> {
        self.transport.send_action(&Action::Speed(speed))
    }

    /// Motion execution time in units of 100 ms (0..=100).
    pub fn set_time(&mut self, time: u8) -> Result<Ack> {
        self.write_register(&registers::TIME, &registers::TIME.broadcast(time))
    }

    /// Auto feedback rate of joint angles in Hz (0..=50), 0 turns it off.
    pub fn set_angle_feedback_freq(&mut self, hz: u8) -> Result<Ack> {
        self.write_register(&registers::ANGLE_FEEDBACK_FREQ, &[hz])
    }

    /// Auto feedback rate of joint loads in Hz (0..=50), 0 turns it off.
    pub fn set_load_feedback_freq(&mut self, hz: u8) -> Result<Ack> {
        self.write_register(&registers::LOAD_FEEDBACK_FREQ, &[hz])
    }

    // Inverse kinematics. Reachability is the device's call: a target it
    // cannot reach comes back as `Error::Range`.

    fn send_target(&mut self, action: Action, target: &Register) -> Result<Ack> {
        let ack = self.transport.send_action(&action)?;
        self.transport.check_alarm(target.address, self.alarm_window)?;
        Ok(ack)
    }

    /// Place joint 5 at `pos` (mm).
    pub fn set_ik5(&mut self, pos: [i16; 3]) -> Result<Ack> {
        registers::encode_ik5(pos)?;
        self.send_target(Action::Ik5 { pos }, &registers::IK5)
    }

    /// Place joint 6 at `pos` (mm), approaching along `vec56`.
    pub fn set_ik6(&mut self, pos: [i16; 3], vec56: [i8; 3]) -> Result<Ack> {
        registers::encode_ik6(pos, vec56)?;
        self.send_target(Action::Ik6 { pos, vec56 }, &registers::IK)
    }

    /// IK6 plus the direction from joint 6 to joint 7.
    pub fn set_ik7(&mut self, pos: [i16; 3], vec56: [i8; 3], vec67: [i8; 3]) -> Result<Ack> {
        registers::encode_ik7(pos, vec56, vec67)?;
        self.send_target(Action::Ik7 { pos, vec56, vec67 }, &registers::IK)
    }

    // Poses

    /// Servo mode, then the boot pose.
    pub fn home(&mut self) -> Result<()> {
        self.set_motor_status(MotorStatus::Servo)?;
        sleep(self.settle_delay);
        self.set_angles(&HOME_ANGLES)?;
        log::info!("Robot moved to home position");
        Ok(())
    }

    /// Protection mode, all joints to 90°, vacuum off.
    pub fn reset(&mut self) -> Result<()> {
        self.set_motor_status(MotorStatus::Protection)?;
        sleep(self.settle_delay);
        self.set_angles(&SAFE_ANGLES)?;
        sleep(self.settle_delay * 2);
        self.set_vacuum(false)?;
        log::info!("Robot reset to safe state");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{PacketType, Request, crc16_modbus, encode_frame};
    use crate::transport::SerialTransport;
    use crate::transport::serial::mock::MockPort;

    fn arm_with(port: MockPort) -> Arm<SerialTransport<MockPort>> {
        Arm::new(SerialTransport::new(port))
            .with_feedback_retry(3, Duration::from_millis(1))
            .with_settle_delay(Duration::ZERO)
    }

    fn sent(arm: &Arm<SerialTransport<MockPort>>) -> &[u8] {
        &arm.transport().get_ref().tx
    }

    #[test]
    fn test_set_angles_wire_bytes() {
        let mut arm = arm_with(MockPort::new());
        arm.set_angles(&[50, 80, 50, 50, 50, 50, 40]).unwrap();

        let body = [0xaa, 0x77, 0x04, 0x2e, 0x07, 50, 80, 50, 50, 50, 50, 40];
        let crc = crc16_modbus(&body);
        let mut expected = body.to_vec();
        expected.extend_from_slice(&[(crc & 0xff) as u8, (crc >> 8) as u8]);
        assert_eq!(sent(&arm), &expected[..]);
    }

    #[test]
    fn test_set_angles_wrong_count() {
        let mut arm = arm_with(MockPort::new());
        let err = arm.set_angles(&[90; 6]).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
        assert!(sent(&arm).is_empty());
    }

    #[test]
    fn test_read_id() {
        let mut port = MockPort::new();
        port.push_frame(PacketType::Read, 11, &[5]);
        let mut arm = arm_with(port);

        assert_eq!(arm.id().unwrap(), 5);
        assert_eq!(sent(&arm), &Request::read(11, 1).into_raw().unwrap()[..]);
    }

    #[test]
    fn test_ik6_out_of_workspace_is_range_error() {
        let mut port = MockPort::new();
        port.push_frame(PacketType::Feedback, 54, &[0x02]);
        let mut arm = arm_with(port);

        let err = arm.set_ik6([500, 185, 50], [0, 0, -1]).unwrap_err();
        assert!(matches!(err, Error::Range { address: 54, .. }));

        // forwarded unclamped
        let expected = encode_frame(
            PacketType::Write,
            54,
            &[0x05, 0xf4, 0x04, 0xb9, 0x04, 0x32, 128, 128, 127],
        )
        .unwrap();
        assert_eq!(sent(&arm), &expected[..]);
    }

    #[test]
    fn test_ik_accepted() {
        let mut arm = arm_with(MockPort::new());
        arm.set_ik6([-50, 185, 50], [0, 0, -1]).unwrap();
        arm.set_ik5([0, 200, 100]).unwrap();
        arm.set_ik7([0, 200, 100], [0, 0, -1], [1, 0, 0]).unwrap();
        assert!(matches!(arm.set_ik5([-2000, 0, 0]), Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn test_identity() {
        let mut port = MockPort::new();
        port.push_frame(PacketType::Read, 0, &[7]);
        port.push_frame(PacketType::Read, 1, &[21]);
        port.push_frame(PacketType::Read, 2, &[0x24, 0x0a, 0xc4, 0x00, 0x01, 0xff]);
        port.push_frame(PacketType::Read, 11, &[1]);
        let mut arm = arm_with(port);

        let info = arm.system_info().unwrap();
        assert_eq!(info.device_code, 7);
        assert!((info.version - 2.1).abs() < 1e-6);
        assert_eq!(info.mac, "24:0A:C4:00:01:FF");
        assert_eq!(info.device_id, 1);
        assert_eq!(info.protocol, "SERIAL");
    }

    #[test]
    fn test_motor_status() {
        let mut port = MockPort::new();
        port.push_frame(PacketType::Read, 29, &[2]);
        port.push_frame(PacketType::Read, 29, &[9]);
        let mut arm = arm_with(port);

        assert_eq!(arm.motor_status().unwrap(), MotorStatus::Forceless);
        assert!(matches!(arm.motor_status(), Err(Error::Protocol(_))));

        let mut arm = arm_with(MockPort::new());
        arm.set_motor_status(MotorStatus::Servo).unwrap();
        assert_eq!(sent(&arm), &encode_frame(PacketType::Write, 29, &[1]).unwrap()[..]);
    }

    #[test]
    fn test_offsets() {
        let mut arm = arm_with(MockPort::new());
        assert!(matches!(arm.set_offsets(&[0; 3]), Err(Error::InvalidArgument(_))));
        arm.clear_offsets().unwrap();
        assert_eq!(sent(&arm), &encode_frame(PacketType::Write, 13, &[128; 7]).unwrap()[..]);

        let mut port = MockPort::new();
        port.push_frame(PacketType::Read, 13, &[128, 130, 126, 128, 128, 128, 0]);
        let mut arm = arm_with(port);
        assert_eq!(arm.offsets().unwrap(), vec![0, 2, -2, 0, 0, 0, -128]);
    }

    #[test]
    fn test_speed_and_time_broadcast() {
        let mut arm = arm_with(MockPort::new());
        arm.set_speed(SPEED_MAX).unwrap();
        arm.set_time(15).unwrap();

        let mut expected = encode_frame(PacketType::Write, 32, &[0; 7]).unwrap();
        expected.extend(encode_frame(PacketType::Write, 39, &[15; 7]).unwrap());
        assert_eq!(sent(&arm), &expected[..]);
    }

    #[test]
    fn test_single_joint_access() {
        let mut port = MockPort::new();
        port.push_frame(PacketType::Read, 85, &[120]);
        port.push_frame(PacketType::Read, 97, &[3]);
        let mut arm = arm_with(port);

        assert_eq!(arm.angle(2).unwrap(), 120);
        assert_eq!(arm.load(6).unwrap(), 3);
        assert!(matches!(arm.angle(7), Err(Error::InvalidArgument(_))));
        assert!(matches!(arm.set_angle(9, 90), Err(Error::InvalidArgument(_))));

        let mut expected = Request::read(85, 1).into_raw().unwrap();
        expected.extend(Request::read(97, 1).into_raw().unwrap());
        assert_eq!(sent(&arm), &expected[..]);
    }

    #[test]
    fn test_read_angles_feedback_retries() {
        let mut port = MockPort::new();
        // corrupted push first, then a good one
        let mut bad = encode_frame(PacketType::Feedback, 83, &[1; 7]).unwrap();
        bad[6] ^= 0xff;
        port.push_bytes(&bad);
        port.push_frame(PacketType::Feedback, 83, &[90, 90, 65, 90, 90, 90, 80]);
        let mut arm = arm_with(port);

        assert_eq!(arm.read_angles_feedback().unwrap(), HOME_ANGLES.to_vec());
        assert!(matches!(arm.read_angles_feedback(), Err(Error::Timeout(_))));
    }

    #[test]
    fn test_eeprom_init() {
        let mut arm = arm_with(MockPort::new());
        arm.eeprom_init().unwrap();

        let mut block = vec![0, 0];
        block.extend([128; 7]);
        let mut expected = encode_frame(PacketType::Write, 28, &[0]).unwrap();
        expected.extend(encode_frame(PacketType::Write, 11, &block).unwrap());
        expected.extend(encode_frame(PacketType::Write, 28, &[1]).unwrap());
        assert_eq!(sent(&arm), &expected[..]);
    }

    #[test]
    fn test_home_and_reset() {
        let mut arm = arm_with(MockPort::new());
        arm.home().unwrap();
        let mut expected = encode_frame(PacketType::Write, 29, &[1]).unwrap();
        expected.extend(encode_frame(PacketType::Write, 46, &HOME_ANGLES).unwrap());
        assert_eq!(sent(&arm), &expected[..]);

        let mut arm = arm_with(MockPort::new());
        arm.reset().unwrap();
        let mut expected = encode_frame(PacketType::Write, 29, &[0]).unwrap();
        expected.extend(encode_frame(PacketType::Write, 46, &SAFE_ANGLES).unwrap());
        expected.extend(encode_frame(PacketType::Write, 31, &[0]).unwrap());
        assert_eq!(sent(&arm), &expected[..]);
    }

    #[test]
    fn test_ik_alarm_behind_line_noise() {
        let mut port = MockPort::new();
        port.push_bytes(&[0x00]);
        port.push_frame(PacketType::Feedback, 54, &[0x02]);
        let mut arm = arm_with(port);

        let err = arm.set_ik6([500, 185, 50], [0, 0, -1]).unwrap_err();
        assert!(matches!(err, Error::Range { address: 54, .. }));
    }

    #[test]
    fn test_reply_length_must_match() {
        let mut port = MockPort::new();
        port.push_frame(PacketType::Read, 83, &[1, 2, 3, 4, 5, 6, 7, 8, 9]);
        port.push_frame(PacketType::Read, 91, &[1, 2, 3]);
        port.push_frame(PacketType::Read, 11, &[1, 2]);
        let mut arm = arm_with(port);

        assert!(matches!(arm.angles(), Err(Error::Protocol(_))));
        assert!(matches!(arm.loads(), Err(Error::Protocol(_))));
        assert!(matches!(arm.id(), Err(Error::Protocol(_))));

        let mut port = MockPort::new();
        port.push_frame(PacketType::Feedback, 83, &[90; 9]);
        port.push_frame(PacketType::Feedback, 83, &[90; 7]);
        let mut arm = arm_with(port);
        assert_eq!(arm.read_angles_feedback().unwrap(), vec![90; 7]);
    }

    #[test]
    fn test_named_register_access() {
        let mut port = MockPort::new();
        port.push_frame(PacketType::Read, 13, &[128, 129, 128, 128, 128, 128, 127]);
        let mut arm = arm_with(port);

        let offsets = registers::lookup("offsets").unwrap();
        let raw = arm.read_register(offsets).unwrap();
        assert_eq!(offsets.render(&raw).unwrap(), "[0, 1, 0, 0, 0, 0, -1]");

        let err = arm.write_register(&registers::VERSION, &[30]).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
        arm.write_register(&registers::END_LENGTH, &[40]).unwrap();
        assert_eq!(
            sent(&arm)[7..],
            encode_frame(PacketType::Write, 53, &[40]).unwrap()[..]
        );
    }

    #[test]
    fn test_boxed_transport() {
        let mut port = MockPort::new();
        port.push_frame(PacketType::Read, 31, &[1]);
        let transport: Box<dyn Transport + Send> = Box::new(SerialTransport::new(port));
        let mut arm = Arm::new(transport);

        assert!(arm.vacuum().unwrap());
        assert_eq!(arm.ping().unwrap(), Ack::Local);
        assert_eq!(arm.connection_state(), ConnectionState::Connected);
    }

    #[test]
    fn test_switch_transport_failure_leaves_arm_detached() {
        let transport: Box<dyn Transport + Send> = Box::new(SerialTransport::new(MockPort::new()));
        let mut arm = Arm::new(transport);

        let missing = TransportConfig::serial("/dev/this-port-does-not-exist");
        assert!(arm.switch_transport(&missing, 50).is_err());
        assert_eq!(arm.connection_state(), ConnectionState::Disconnected);
        assert!(matches!(arm.id(), Err(Error::Connection(_))));
    }
}
