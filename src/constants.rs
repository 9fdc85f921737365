/// Number of servo joints on the arm.
pub const SERVO_NUM: usize = 7;

/// Default baud rate of the arm's serial port.
pub const BAUD_RATE: u32 = 115200;

/// Serial frame prefix.
pub const SYNC: [u8; 2] = [0xaa, 0x77];

/// Sync(2) + type + address + length.
pub const HEADER_LEN: usize = 5;

/// Maximum payload length a single frame can carry.
pub const MAX_PAYLOAD_LEN: usize = u8::MAX as usize;

pub mod packets {
    pub const READ: u8 = 0x03;
    pub const WRITE: u8 = 0x04;
    /// Unsolicited push from the device (auto feedback, alarms).
    pub const FEEDBACK: u8 = 0x05;
}

pub mod defaults {
    pub const SERIAL_TIMEOUT_MS: u64 = 200;
    pub const MAX_HEADER_ATTEMPTS: usize = 50;

    pub const WS_HOST: &str = "192.168.4.1";
    pub const WS_PORT: u16 = 8080;
    pub const WS_TIMEOUT_MS: u64 = 5000;
    pub const WS_RECONNECT_DELAY_MS: u64 = 2000;
    pub const WS_POLL_INTERVAL_MS: u64 = 50;

    pub const FEEDBACK_RETRIES: usize = 3;
    pub const FEEDBACK_RETRY_DELAY_MS: u64 = 100;
    pub const ALARM_WINDOW_MS: u64 = 100;
}
