//! Interface configuration types
//!
//! This module defines the configuration snapshot applied by
//! [`CanInterface::init`](crate::CanInterface::init). Link-level settings
//! (bitrate, restart-ms, controller mode) are forwarded to the
//! [`LinkControl`](crate::LinkControl) collaborator; socket-level settings are
//! applied by the library itself.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::types::error_class;

/// Default interval of the background worker's poll
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(1);

/// Controller mode request, mirroring the kernel's `can_ctrlmode`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CtrlMode {
    /// Bits to change
    pub mask: u32,
    /// New values of the bits selected by `mask`
    pub flags: u32,
}

impl CtrlMode {
    pub const LOOPBACK: u32 = 0x01;
    pub const LISTENONLY: u32 = 0x02;
    pub const THREE_SAMPLES: u32 = 0x04;
    pub const ONE_SHOT: u32 = 0x08;
    pub const BERR_REPORTING: u32 = 0x10;
    pub const FD: u32 = 0x20;
    pub const PRESUME_ACK: u32 = 0x40;
    pub const FD_NON_ISO: u32 = 0x80;

    pub fn new(mask: u32, flags: u32) -> Self {
        Self { mask, flags }
    }
}

/// What happens to the background worker when the interface is freed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShutdownPolicy {
    /// Wake the worker and wait for its in-flight poll to finish
    #[default]
    Join,
    /// Wake the worker and let it exit on its own
    Detach,
}

/// Configuration for one CAN interface
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterfaceConfig {
    /// Nominal bitrate to program through the link collaborator
    #[serde(default)]
    pub bitrate: Option<u32>,

    /// FD data-phase bitrate
    #[serde(default)]
    pub data_bitrate: Option<u32>,

    /// Automatic restart delay after bus-off
    #[serde(default)]
    pub restart_ms: Option<u32>,

    /// Controller mode bits
    #[serde(default)]
    pub ctrl_mode: Option<CtrlMode>,

    /// Use CAN FD frames on every socket
    #[serde(default)]
    pub canfd_enabled: bool,

    /// Request timestamps and drop counters with every received frame
    #[serde(default = "default_true")]
    pub process_header: bool,

    /// Prefer hardware receive timestamps
    #[serde(default)]
    pub hw_timestamp: bool,

    /// Error classes reported as error frames
    #[serde(default = "default_error_mask")]
    pub error_mask: u32,

    /// No background worker: the caller drives `poll`/`poll_once`
    #[serde(default)]
    pub polled_mode: bool,

    /// Requested send buffer size in bytes (0 = leave the kernel default)
    #[serde(default)]
    pub tx_buf_len: usize,

    /// Requested receive buffer size in bytes (0 = leave the kernel default)
    #[serde(default)]
    pub rx_buf_len: usize,

    /// Background worker poll interval
    #[serde(default = "default_poll_timeout", with = "duration_ms")]
    pub poll_timeout: Duration,

    /// Worker teardown behaviour
    #[serde(default)]
    pub shutdown: ShutdownPolicy,
}

fn default_true() -> bool {
    true
}

fn default_error_mask() -> u32 {
    error_class::TX_TIMEOUT
        | error_class::CRTL
        | error_class::BUSOFF
        | error_class::BUSERROR
        | error_class::RESTARTED
}

fn default_poll_timeout() -> Duration {
    DEFAULT_POLL_TIMEOUT
}

/// Durations are written as plain milliseconds in configuration files
mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

impl Default for InterfaceConfig {
    fn default() -> Self {
        Self {
            bitrate: None,
            data_bitrate: None,
            restart_ms: None,
            ctrl_mode: None,
            canfd_enabled: false,
            process_header: true,
            hw_timestamp: false,
            error_mask: default_error_mask(),
            polled_mode: false,
            tx_buf_len: 0,
            rx_buf_len: 0,
            poll_timeout: DEFAULT_POLL_TIMEOUT,
            shutdown: ShutdownPolicy::Join,
        }
    }
}

impl InterfaceConfig {
    /// Create a configuration with default settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder method: program the nominal bitrate
    pub fn with_bitrate(mut self, bitrate: u32) -> Self {
        self.bitrate = Some(bitrate);
        self
    }

    /// Builder method: program the FD data bitrate
    pub fn with_data_bitrate(mut self, bitrate: u32) -> Self {
        self.data_bitrate = Some(bitrate);
        self
    }

    /// Builder method: program the bus-off restart delay
    pub fn with_restart_ms(mut self, restart_ms: u32) -> Self {
        self.restart_ms = Some(restart_ms);
        self
    }

    /// Builder method: program controller mode bits
    pub fn with_ctrl_mode(mut self, ctrl_mode: CtrlMode) -> Self {
        self.ctrl_mode = Some(ctrl_mode);
        self
    }

    /// Builder method: enable or disable CAN FD frames
    pub fn with_canfd(mut self, enabled: bool) -> Self {
        self.canfd_enabled = enabled;
        self
    }

    /// Builder method: enable or disable timestamp/drop-counter decoding
    pub fn with_process_header(mut self, enabled: bool) -> Self {
        self.process_header = enabled;
        self
    }

    /// Builder method: prefer hardware timestamps
    pub fn with_hw_timestamp(mut self, enabled: bool) -> Self {
        self.hw_timestamp = enabled;
        self
    }

    /// Builder method: set the error class mask
    pub fn with_error_mask(mut self, mask: u32) -> Self {
        self.error_mask = mask;
        self
    }

    /// Builder method: run without a background worker
    pub fn with_polled_mode(mut self, polled: bool) -> Self {
        self.polled_mode = polled;
        self
    }

    /// Builder method: request a send buffer size
    pub fn with_tx_buf_len(mut self, len: usize) -> Self {
        self.tx_buf_len = len;
        self
    }

    /// Builder method: request a receive buffer size
    pub fn with_rx_buf_len(mut self, len: usize) -> Self {
        self.rx_buf_len = len;
        self
    }

    /// Builder method: set the background worker poll interval
    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    /// Builder method: choose the worker teardown behaviour
    pub fn with_shutdown(mut self, policy: ShutdownPolicy) -> Self {
        self.shutdown = policy;
        self
    }

    /// True if any setting requires the link collaborator
    pub fn needs_link_config(&self) -> bool {
        self.bitrate.is_some()
            || self.data_bitrate.is_some()
            || self.restart_ms.is_some()
            || self.ctrl_mode.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = InterfaceConfig::new();

        assert!(config.process_header);
        assert!(!config.canfd_enabled);
        assert!(!config.hw_timestamp);
        assert!(!config.polled_mode);
        assert_eq!(config.error_mask, 0x1C5);
        assert_eq!(config.poll_timeout, Duration::from_secs(1));
        assert_eq!(config.shutdown, ShutdownPolicy::Join);
        assert!(!config.needs_link_config());
    }

    #[test]
    fn test_builder() {
        let config = InterfaceConfig::new()
            .with_bitrate(500_000)
            .with_canfd(true)
            .with_polled_mode(true)
            .with_rx_buf_len(65536)
            .with_poll_timeout(Duration::from_millis(20))
            .with_shutdown(ShutdownPolicy::Detach);

        assert_eq!(config.bitrate, Some(500_000));
        assert!(config.canfd_enabled);
        assert!(config.polled_mode);
        assert_eq!(config.rx_buf_len, 65536);
        assert_eq!(config.poll_timeout, Duration::from_millis(20));
        assert_eq!(config.shutdown, ShutdownPolicy::Detach);
        assert!(config.needs_link_config());
    }

    #[test]
    fn test_toml_deserialization() {
        let toml_content = r#"
            bitrate = 250000
            canfd_enabled = true
            polled_mode = true
            poll_timeout = 50
            shutdown = "detach"

            [ctrl_mode]
            mask = 1
            flags = 1
        "#;

        let config: InterfaceConfig = toml::from_str(toml_content).unwrap();
        assert_eq!(config.bitrate, Some(250_000));
        assert!(config.canfd_enabled);
        assert!(config.process_header); // default kept
        assert_eq!(config.ctrl_mode, Some(CtrlMode::new(CtrlMode::LOOPBACK, 1)));
        assert_eq!(config.poll_timeout, Duration::from_millis(50));
        assert_eq!(config.shutdown, ShutdownPolicy::Detach);
    }
}
