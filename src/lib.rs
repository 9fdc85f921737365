//! 7Bot arm communication layer.
//!
//! Register access over the framed serial protocol or the WebSocket JSON
//! protocol, and an [`Arm`] facade on top of either.

pub mod arm;
pub mod config;
pub mod constants;
pub mod error;
pub mod protocol;
pub mod registers;
pub mod transport;

pub use self::arm::{Arm, MotorStatus};
pub use self::config::{ArmConfig, TransportConfig};
pub use self::error::{Error, Result};
pub use self::transport::Transport;
