//! Link timing and retry configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::checksum::Checksum;
use crate::error::{LinkError, Result};

/// Timing, retry ceilings and checksum for one [`Protocol`](crate::Protocol).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Deadline for each acknowledgement or frame field read.
    pub field_timeout: Duration,
    /// Pause after releasing the wire in `retry` and `wait`.
    pub backoff: Duration,
    /// Send attempts before `send` gives up.
    pub max_send_attempts: u32,
    /// Receive attempts before `receive` gives up.
    pub max_receive_attempts: u32,
    /// The device is closed and reopened on every n-th send retry.
    pub reopen_interval: u32,
    pub checksum: Checksum,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            field_timeout: Duration::from_millis(50),
            backoff: Duration::from_millis(5),
            max_send_attempts: 240,
            max_receive_attempts: 5,
            reopen_interval: 6,
            checksum: Checksum::Xor,
        }
    }
}

impl LinkConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_send_attempts == 0 {
            return Err(LinkError::InvalidConfig("max_send_attempts must be non-zero"));
        }
        if self.max_receive_attempts == 0 {
            return Err(LinkError::InvalidConfig(
                "max_receive_attempts must be non-zero",
            ));
        }
        if self.reopen_interval == 0 {
            return Err(LinkError::InvalidConfig("reopen_interval must be non-zero"));
        }
        if self.field_timeout.is_zero() {
            return Err(LinkError::InvalidConfig("field_timeout must be non-zero"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_wire_protocol() {
        let config = LinkConfig::default();
        assert_eq!(config.field_timeout, Duration::from_millis(50));
        assert_eq!(config.backoff, Duration::from_millis(5));
        assert_eq!(config.max_send_attempts, 240);
        assert_eq!(config.max_receive_attempts, 5);
        assert_eq!(config.reopen_interval, 6);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn partial_document_keeps_defaults() {
        let config: LinkConfig =
            serde_json::from_str(r#"{ "max_send_attempts": 12, "checksum": "sum" }"#).unwrap();
        assert_eq!(config.max_send_attempts, 12);
        assert_eq!(config.checksum, Checksum::Sum);
        assert_eq!(config.max_receive_attempts, 5);
        assert_eq!(config.field_timeout, Duration::from_millis(50));
    }

    #[test]
    fn zero_ceilings_rejected() {
        let config = LinkConfig {
            reopen_interval: 0,
            ..Default::default()
        };
        assert_eq!(
            config.validate(),
            Err(LinkError::InvalidConfig("reopen_interval must be non-zero"))
        );

        let config = LinkConfig {
            max_receive_attempts: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
