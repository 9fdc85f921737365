//! Connection and facade settings, from the command line or a YAML file.
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants::{BAUD_RATE, defaults};
use crate::error::{Error, Result};
use crate::transport::{SerialTransport, SocketOptions, SocketTransport, Transport};

/// Which link to use and how to reach it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "protocol", rename_all = "lowercase")]
pub enum TransportConfig {
    Serial {
        port: String,
        #[serde(default = "default_baud_rate")]
        baud_rate: u32,
        #[serde(default = "default_serial_timeout_ms")]
        timeout_ms: u64,
    },
    Websocket {
        #[serde(default = "default_ws_host")]
        host: String,
        #[serde(default = "default_ws_port")]
        port: u16,
        #[serde(default = "default_ws_timeout_ms")]
        timeout_ms: u64,
        #[serde(default = "default_reconnect_delay_ms")]
        reconnect_delay_ms: u64,
        #[serde(default = "default_poll_interval_ms")]
        poll_interval_ms: u64,
    },
}

fn default_baud_rate() -> u32 {
    BAUD_RATE
}

fn default_serial_timeout_ms() -> u64 {
    defaults::SERIAL_TIMEOUT_MS
}

fn default_ws_host() -> String {
    defaults::WS_HOST.to_owned()
}

fn default_ws_port() -> u16 {
    defaults::WS_PORT
}

fn default_ws_timeout_ms() -> u64 {
    defaults::WS_TIMEOUT_MS
}

fn default_reconnect_delay_ms() -> u64 {
    defaults::WS_RECONNECT_DELAY_MS
}

fn default_poll_interval_ms() -> u64 {
    defaults::WS_POLL_INTERVAL_MS
}

impl TransportConfig {
    pub fn serial(port: impl Into<String>) -> Self {
        TransportConfig::Serial {
            port: port.into(),
            baud_rate: BAUD_RATE,
            timeout_ms: defaults::SERIAL_TIMEOUT_MS,
        }
    }

    pub fn websocket(host: impl Into<String>, port: u16) -> Self {
        TransportConfig::Websocket {
            host: host.into(),
            port,
            timeout_ms: defaults::WS_TIMEOUT_MS,
            reconnect_delay_ms: defaults::WS_RECONNECT_DELAY_MS,
            poll_interval_ms: defaults::WS_POLL_INTERVAL_MS,
        }
    }

    /// Build from a protocol name (`serial` or `websocket`, any case) plus
    /// the parameters that protocol needs.
    pub fn from_selector(
        protocol: &str,
        port: Option<&str>,
        host: Option<&str>,
        ws_port: Option<u16>,
    ) -> Result<Self> {
        match protocol.to_ascii_lowercase().as_str() {
            "serial" => match port {
                Some(port) if !port.is_empty() => Ok(Self::serial(port)),
                _ => Err(Error::Configuration(
                    "Serial port must be specified for serial communication".into(),
                )),
            },
            "websocket" | "ws" => Ok(Self::websocket(
                host.unwrap_or(defaults::WS_HOST),
                ws_port.unwrap_or(defaults::WS_PORT),
            )),
            other => Err(Error::Configuration(format!(
                "Protocol must be 'serial' or 'websocket', got {:?}",
                other
            ))),
        }
    }

    pub fn socket_options(&self) -> Option<SocketOptions> {
        match self {
            TransportConfig::Websocket {
                timeout_ms,
                reconnect_delay_ms,
                poll_interval_ms,
                ..
            } => {
                let timeout = Duration::from_millis(*timeout_ms);
                Some(SocketOptions {
                    connect_timeout: timeout,
                    send_timeout: timeout,
                    response_timeout: timeout,
                    reconnect_delay: Duration::from_millis(*reconnect_delay_ms),
                    poll_interval: Duration::from_millis(*poll_interval_ms),
                })
            }
            TransportConfig::Serial { .. } => None,
        }
    }

    /// Open the transport this config describes.
    pub fn open(&self, max_header_attempts: usize) -> Result<Box<dyn Transport + Send>> {
        match self {
            TransportConfig::Serial {
                port,
                baud_rate,
                timeout_ms,
            } => {
                let transport =
                    SerialTransport::open(port, *baud_rate, Duration::from_millis(*timeout_ms))?
                        .with_max_header_attempts(max_header_attempts);
                Ok(Box::new(transport))
            }
            TransportConfig::Websocket { host, port, .. } => {
                let options = self.socket_options().unwrap_or_default();
                let url = SocketTransport::endpoint(host, *port);
                let transport = SocketTransport::connect(url, options)?;
                Ok(Box::new(transport))
            }
        }
    }
}

/// Everything needed to build an [`crate::Arm`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArmConfig {
    pub transport: TransportConfig,
    #[serde(default = "default_feedback_retries")]
    pub feedback_retries: usize,
    #[serde(default = "default_feedback_retry_delay_ms")]
    pub feedback_retry_delay_ms: u64,
    /// How long to listen for a device alarm after an IK target; 0 disables.
    #[serde(default = "default_alarm_window_ms")]
    pub alarm_window_ms: u64,
    #[serde(default = "default_max_header_attempts")]
    pub max_header_attempts: usize,
}

fn default_feedback_retries() -> usize {
    defaults::FEEDBACK_RETRIES
}

fn default_feedback_retry_delay_ms() -> u64 {
    defaults::FEEDBACK_RETRY_DELAY_MS
}

fn default_alarm_window_ms() -> u64 {
    defaults::ALARM_WINDOW_MS
}

fn default_max_header_attempts() -> usize {
    defaults::MAX_HEADER_ATTEMPTS
}

impl ArmConfig {
    pub fn new(transport: TransportConfig) -> Self {
        ArmConfig {
            transport,
            feedback_retries: defaults::FEEDBACK_RETRIES,
            feedback_retry_delay_ms: defaults::FEEDBACK_RETRY_DELAY_MS,
            alarm_window_ms: defaults::ALARM_WINDOW_MS,
            max_header_attempts: defaults::MAX_HEADER_ATTEMPTS,
        }
    }

    pub fn from_yaml(raw: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(raw)?)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            Error::Configuration(format!("cannot read {}: {}", path.display(), e))
        })?;
        log::debug!("Loaded config from {}", path.display());
        Self::from_yaml(&raw)
    }

    pub fn feedback_retry_delay(&self) -> Duration {
        Duration::from_millis(self.feedback_retry_delay_ms)
    }

    pub fn alarm_window(&self) -> Duration {
        Duration::from_millis(self.alarm_window_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_selector() {
        assert_eq!(
            TransportConfig::from_selector("Serial", Some("/dev/ttyUSB0"), None, None).unwrap(),
            TransportConfig::serial("/dev/ttyUSB0")
        );
        assert_eq!(
            TransportConfig::from_selector("websocket", None, None, None).unwrap(),
            TransportConfig::websocket("192.168.4.1", 8080)
        );
        assert!(matches!(
            TransportConfig::from_selector("serial", None, None, None),
            Err(Error::Configuration(_))
        ));
        assert!(matches!(
            TransportConfig::from_selector("bluetooth", Some("x"), None, None),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn test_yaml_defaults() {
        let config =
            ArmConfig::from_yaml("transport:\n  protocol: serial\n  port: COM11\n").unwrap();
        assert_eq!(config, ArmConfig::new(TransportConfig::serial("COM11")));

        let config = ArmConfig::from_yaml(
            "transport:\n  protocol: websocket\n  host: 10.0.0.7\nalarm_window_ms: 0\n",
        )
        .unwrap();
        assert_eq!(config.transport, TransportConfig::websocket("10.0.0.7", 8080));
        assert!(config.alarm_window().is_zero());
        assert_eq!(config.feedback_retries, 3);
    }

    #[test]
    fn test_yaml_errors() {
        assert!(matches!(
            ArmConfig::from_yaml("transport:\n  protocol: can\n"),
            Err(Error::Configuration(_))
        ));
        assert!(matches!(
            ArmConfig::from_yaml("transport:\n  protocol: serial\n"),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn test_socket_options() {
        let options = TransportConfig::websocket("h", 1).socket_options().unwrap();
        assert_eq!(options, SocketOptions::default());
        assert!(TransportConfig::serial("p").socket_options().is_none());
    }
}
