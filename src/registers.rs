//! Register map of the 7Bot arm, with the encoding rules for each register.
//!
//! This module is the only place register addresses are written down.

use scroll::{BE, Pread};

use crate::constants::SERVO_NUM;
use crate::error::{Error, Result};

/// Added to a signed coordinate (mm) to store it as an unsigned 16-bit value.
pub const COORDINATE_OFFSET: i32 = 1024;
/// Added to a signed byte (vector component, joint offset) to store it unsigned.
pub const BIAS: i16 = 128;

pub const COORDINATE_MIN: i16 = -(COORDINATE_OFFSET as i16);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Region {
    /// Read-only identity data.
    Rom,
    /// Persistent, guarded by the EEPROM lock.
    Eeprom,
    /// Volatile runtime state.
    Ram,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Encoding {
    /// One byte per register, as is.
    Raw,
    /// One logical value replicated across every joint register.
    Broadcast,
    /// Big-endian u16 per coordinate with [`COORDINATE_OFFSET`], then biased vectors.
    Coordinate,
    /// Signed byte stored with [`BIAS`].
    Bias,
    /// Bytes rendered as colon-separated hex pairs.
    Mac,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Register {
    pub name: &'static str,
    pub address: u8,
    pub len: u8,
    pub region: Region,
    pub encoding: Encoding,
}

const fn reg(
    name: &'static str,
    address: u8,
    len: u8,
    region: Region,
    encoding: Encoding,
) -> Register {
    Register {
        name,
        address,
        len,
        region,
        encoding,
    }
}

const JOINTS: u8 = SERVO_NUM as u8;

// ROM
pub const DEVICE_TYPE: Register = reg("device_type", 0, 1, Region::Rom, Encoding::Raw);
pub const VERSION: Register = reg("version", 1, 1, Region::Rom, Encoding::Raw);
pub const MAC: Register = reg("mac", 2, 6, Region::Rom, Encoding::Mac);
// EEPROM
/// Start of the EEPROM block; the device id is its first register.
pub const EEPROM: Register = reg("eeprom", 11, 9, Region::Eeprom, Encoding::Raw);
pub const DEVICE_ID: Register = reg("device_id", 11, 1, Region::Eeprom, Encoding::Raw);
pub const BAUD_RATE: Register = reg("baud_rate", 12, 1, Region::Eeprom, Encoding::Raw);
pub const OFFSETS: Register = reg("offsets", 13, JOINTS, Region::Eeprom, Encoding::Bias);
// RAM
pub const EEPROM_LOCK: Register = reg("eeprom_lock", 28, 1, Region::Ram, Encoding::Raw);
pub const MOTOR_STATUS: Register = reg("motor_status", 29, 1, Region::Ram, Encoding::Raw);
pub const EFFECTOR: Register = reg("effector", 30, 1, Region::Ram, Encoding::Raw);
pub const VACUUM: Register = reg("vacuum", 31, 1, Region::Ram, Encoding::Raw);
pub const SPEED: Register = reg("speed", 32, JOINTS, Region::Ram, Encoding::Broadcast);
pub const TIME: Register = reg("time", 39, JOINTS, Region::Ram, Encoding::Broadcast);
pub const ANGLE: Register = reg("angle", 46, JOINTS, Region::Ram, Encoding::Raw);
pub const END_LENGTH: Register = reg("end_length", 53, 1, Region::Ram, Encoding::Raw);
/// IK6 uses the first 9 bytes, IK7 all 12.
pub const IK: Register = reg("ik", 54, 12, Region::Ram, Encoding::Coordinate);
pub const IK5: Register = reg("ik5", 68, 6, Region::Ram, Encoding::Coordinate);
pub const ANGLE_FEEDBACK_FREQ: Register =
    reg("angle_feedback_freq", 82, 1, Region::Ram, Encoding::Raw);
pub const ANGLE_FEEDBACK: Register = reg("angle_feedback", 83, JOINTS, Region::Ram, Encoding::Raw);
pub const LOAD_FEEDBACK_FREQ: Register =
    reg("load_feedback_freq", 90, 1, Region::Ram, Encoding::Raw);
pub const LOAD_FEEDBACK: Register = reg("load_feedback", 91, JOINTS, Region::Ram, Encoding::Raw);

pub static TABLE: &[Register] = &[
    DEVICE_TYPE,
    VERSION,
    MAC,
    EEPROM,
    DEVICE_ID,
    BAUD_RATE,
    OFFSETS,
    EEPROM_LOCK,
    MOTOR_STATUS,
    EFFECTOR,
    VACUUM,
    SPEED,
    TIME,
    ANGLE,
    END_LENGTH,
    IK,
    IK5,
    ANGLE_FEEDBACK_FREQ,
    ANGLE_FEEDBACK,
    LOAD_FEEDBACK_FREQ,
    LOAD_FEEDBACK,
];

pub fn lookup(name: &str) -> Option<&'static Register> {
    TABLE.iter().find(|r| r.name == name)
}

impl Register {
    /// Address of joint `joint`'s register within a per-joint run.
    pub fn joint(&self, joint: usize) -> Result<u8> {
        if joint >= self.len as usize {
            return Err(Error::InvalidArgument(format!(
                "joint {} out of range for {} (0..{})",
                joint, self.name, self.len
            )));
        }
        Ok(self.address + joint as u8)
    }

    /// Check that `values` fills this register run exactly.
    pub fn check_len(&self, values: &[impl Copy]) -> Result<()> {
        if values.len() != self.len as usize {
            return Err(Error::InvalidArgument(format!(
                "{} takes {} values, got {}",
                self.name,
                self.len,
                values.len()
            )));
        }
        Ok(())
    }

    /// ROM registers only answer reads.
    pub fn check_writable(&self) -> Result<()> {
        if self.region == Region::Rom {
            return Err(Error::InvalidArgument(format!("{} is read-only", self.name)));
        }
        Ok(())
    }

    /// Human readable form of a raw read of this register.
    pub fn render(&self, raw: &[u8]) -> Result<String> {
        Ok(match self.encoding {
            Encoding::Raw | Encoding::Broadcast => format!("{:?}", raw),
            Encoding::Bias => {
                let values: Vec<i8> = raw.iter().map(|&b| decode_vector(b)).collect();
                format!("{:?}", values)
            }
            Encoding::Mac => format_mac(raw),
            Encoding::Coordinate => {
                let pos = decode_position(raw)?;
                let vectors: Vec<i8> = raw.iter().skip(6).map(|&b| decode_vector(b)).collect();
                if vectors.is_empty() {
                    format!("pos {:?}", pos)
                } else {
                    format!("pos {:?} vec {:?}", pos, vectors)
                }
            }
        })
    }

    /// Replicate `value` across the whole run.
    pub fn broadcast(&self, value: u8) -> Vec<u8> {
        broadcast(value, self.len as usize)
    }
}

pub fn broadcast(value: u8, n: usize) -> Vec<u8> {
    vec![value; n]
}

pub fn encode_coordinate(c: i16) -> Result<[u8; 2]> {
    if c < COORDINATE_MIN {
        return Err(Error::InvalidArgument(format!(
            "coordinate {} below {}",
            c, COORDINATE_MIN
        )));
    }
    Ok(((c as i32 + COORDINATE_OFFSET) as u16).to_be_bytes())
}

pub fn decode_coordinate(raw: [u8; 2]) -> Result<i16> {
    let wire = u16::from_be_bytes(raw);
    i16::try_from(wire as i32 - COORDINATE_OFFSET)
        .map_err(|_| Error::Protocol(format!("coordinate 0x{:04x} out of range", wire)))
}

pub fn encode_vector(v: i8) -> u8 {
    (v as i16 + BIAS) as u8
}

pub fn decode_vector(raw: u8) -> i8 {
    (raw as i16 - BIAS) as i8
}

pub fn format_mac(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(":")
}

fn encode_position(pos: [i16; 3], buf: &mut Vec<u8>) -> Result<()> {
    for c in pos {
        buf.extend_from_slice(&encode_coordinate(c)?);
    }
    Ok(())
}

/// IK5 target: position of joint 5 only.
pub fn encode_ik5(pos: [i16; 3]) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(IK5.len as usize);
    encode_position(pos, &mut buf)?;
    Ok(buf)
}

/// IK6 target: position of joint 6 and the joint 5 to 6 direction.
pub fn encode_ik6(pos: [i16; 3], vec56: [i8; 3]) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(9);
    encode_position(pos, &mut buf)?;
    buf.extend(vec56.into_iter().map(encode_vector));
    Ok(buf)
}

/// IK7 target: IK6 plus the joint 6 to 7 direction.
pub fn encode_ik7(pos: [i16; 3], vec56: [i8; 3], vec67: [i8; 3]) -> Result<Vec<u8>> {
    let mut buf = encode_ik6(pos, vec56)?;
    buf.extend(vec67.into_iter().map(encode_vector));
    Ok(buf)
}

/// Position part of an encoded IK payload.
pub fn decode_position(raw: &[u8]) -> Result<[i16; 3]> {
    let mut pos = [0i16; 3];
    for (i, c) in pos.iter_mut().enumerate() {
        let wire: u16 = raw.pread_with(i * 2, BE)?;
        *c = decode_coordinate(wire.to_be_bytes())?;
    }
    Ok(pos)
}
