//! Connection configuration.

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::packet::HEADER_SIZE;

/// The payload cipher selection.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Encryption {
    #[default]
    Off,
    Aes128,
    Aes192,
    Aes256,
}

impl Encryption {
    #[inline]
    pub fn is_enabled(self) -> bool {
        self != Self::Off
    }

    /// The handshake encryption-field code advertising this cipher.
    pub const fn field_code(self) -> u16 {
        match self {
            Self::Off => 0,
            Self::Aes128 => 1,
            Self::Aes256 => 2,
            Self::Aes192 => 3,
        }
    }

    pub const fn from_field_code(code: u16) -> Option<Self> {
        match code {
            0 => Some(Self::Off),
            1 => Some(Self::Aes128),
            2 => Some(Self::Aes256),
            3 => Some(Self::Aes192),
            _ => None,
        }
    }
}

/// Configuration of a single SRT connection.
///
/// All fields have working defaults; [`Config::validate`] enforces the documented ranges
/// and is called by the connection entry points before any packet is sent.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub encryption: Encryption,
    /// Required when `encryption` is not [`Encryption::Off`]; 10 to 79 characters.
    pub passphrase: Option<String>,
    /// TSBPD playback delay in milliseconds, 20 to 8000.
    pub playback_delay_ms: u32,
    /// Maximum segment size in bytes, header included. 76 to 65536.
    pub mss_bytes: u32,
    /// Upper bound for the sending rate in bits per second, at least 80000.
    pub max_bandwidth_bps: u64,
    pub send_window_packets: u32,
    pub recv_window_packets: u32,
    /// Number of packets a session key may encrypt before it is rotated.
    pub key_refresh_packets: u64,
    /// A cumulative ACK is emitted every this many accepted packets.
    pub ack_frequency_packets: u32,
    pub retransmit_timeout_min_us: u64,
    pub retransmit_timeout_max_us: u64,
    /// How often a packet is retransmitted before it is given up as lost.
    pub max_retransmits: u32,
    /// Live mode: deliver through the TSBPD scheduler and drop packets that miss their
    /// delivery time. When disabled, reassembled messages are delivered on arrival.
    pub live: bool,
    /// Bound for the draining phase on close, in milliseconds.
    pub linger_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            encryption: Encryption::Off,
            passphrase: None,
            playback_delay_ms: 120,
            mss_bytes: 1500,
            max_bandwidth_bps: 1_000_000,
            send_window_packets: 8192,
            recv_window_packets: 8192,
            key_refresh_packets: 1_000_000,
            ack_frequency_packets: 10,
            retransmit_timeout_min_us: 1_000,
            retransmit_timeout_max_us: 60_000_000,
            max_retransmits: 5,
            live: true,
            linger_ms: 0,
        }
    }
}

impl Config {
    pub fn from_file<P>(path: P) -> Result<Self, ConfigError>
    where
        P: AsRef<Path>,
    {
        let buf = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&buf)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.encryption.is_enabled() {
            match &self.passphrase {
                None => return Err(ConfigError::MissingPassphrase),
                Some(passphrase) if !(10..=79).contains(&passphrase.len()) => {
                    return Err(ConfigError::PassphraseLength(passphrase.len()));
                }
                Some(_) => (),
            }
        }

        range("playback_delay_ms", self.playback_delay_ms as u64, 20, 8000)?;
        range("mss_bytes", self.mss_bytes as u64, 76, 65536)?;
        range(
            "max_bandwidth_bps",
            self.max_bandwidth_bps,
            80_000,
            u64::MAX,
        )?;
        range(
            "send_window_packets",
            self.send_window_packets as u64,
            1,
            u64::MAX,
        )?;
        range(
            "recv_window_packets",
            self.recv_window_packets as u64,
            1,
            u64::MAX,
        )?;
        range("key_refresh_packets", self.key_refresh_packets, 1000, u64::MAX)?;
        range(
            "ack_frequency_packets",
            self.ack_frequency_packets as u64,
            1,
            u64::MAX,
        )?;
        range("max_retransmits", self.max_retransmits as u64, 1, u64::MAX)?;
        range(
            "retransmit_timeout_max_us",
            self.retransmit_timeout_max_us,
            self.retransmit_timeout_min_us,
            u64::MAX,
        )?;

        Ok(())
    }

    /// The maximum payload carried by a single data packet.
    #[inline]
    pub fn max_payload(&self) -> usize {
        self.mss_bytes as usize - HEADER_SIZE
    }

    #[inline]
    pub fn playback_delay(&self) -> Duration {
        Duration::from_millis(self.playback_delay_ms as u64)
    }

    #[inline]
    pub fn min_rto(&self) -> Duration {
        Duration::from_micros(self.retransmit_timeout_min_us)
    }

    #[inline]
    pub fn max_rto(&self) -> Duration {
        Duration::from_micros(self.retransmit_timeout_max_us)
    }
}

fn range(field: &'static str, value: u64, min: u64, max: u64) -> Result<(), ConfigError> {
    if value < min || value > max {
        Err(ConfigError::OutOfRange {
            field,
            value,
            min,
            max,
        })
    } else {
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("passphrase required when encryption is enabled")]
    MissingPassphrase,
    #[error("passphrase length {0} outside 10..=79")]
    PassphraseLength(usize),
    #[error("{field} = {value} outside {min}..={max}")]
    OutOfRange {
        field: &'static str,
        value: u64,
        min: u64,
        max: u64,
    },
}

#[cfg(test)]
mod tests {
    use super::{Config, ConfigError, Encryption};

    #[test]
    fn test_default_config_is_valid() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn test_passphrase_length_enforced() {
        let config = Config {
            encryption: Encryption::Aes256,
            passphrase: Some("short".into()),
            ..Default::default()
        };

        assert!(matches!(
            config.validate().unwrap_err(),
            ConfigError::PassphraseLength(5)
        ));

        let config = Config {
            encryption: Encryption::Aes256,
            passphrase: None,
            ..Default::default()
        };

        assert!(matches!(
            config.validate().unwrap_err(),
            ConfigError::MissingPassphrase
        ));
    }

    #[test]
    fn test_latency_range_enforced() {
        let config = Config {
            playback_delay_ms: 10_000,
            ..Default::default()
        };

        assert!(matches!(
            config.validate().unwrap_err(),
            ConfigError::OutOfRange {
                field: "playback_delay_ms",
                ..
            }
        ));
    }

    #[test]
    fn test_parse_toml() {
        let config: Config = toml::from_str(
            r#"
            encryption = "aes256"
            passphrase = "my_secret_passphrase"
            playback_delay_ms = 150
            "#,
        )
        .unwrap();

        assert_eq!(config.encryption, Encryption::Aes256);
        assert_eq!(config.playback_delay_ms, 150);
        assert_eq!(config.mss_bytes, 1500);
        config.validate().unwrap();
    }
}
