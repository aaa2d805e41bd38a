//! Link configuration loaded from TOML.
//!
//! ```toml
//! version = 1
//!
//! [pacing]
//! baud_rate = 57600
//! max_burst_length = 48
//! max_atomic_send_length = 16
//! ```

use serde::Deserialize;
use thiserror::Error;

use crate::link::LinkPacing;

pub const CONFIG_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid config TOML: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("unsupported config version {0}")]
    UnsupportedVersion(u32),
    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LinkConfigInput {
    pub version: u32,
    pub pacing: PacingInput,
    pub buffer_capacity: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PacingInput {
    pub max_burst_length: Option<usize>,
    pub max_atomic_send_length: Option<usize>,
    /// Takes precedence over `baud_rate`.
    pub ingestion_ns_per_byte: Option<u64>,
    pub baud_rate: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkConfig {
    pub version: u32,
    pub pacing: LinkPacing,
    /// Per-direction buffer of in-memory links.
    pub buffer_capacity: usize,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            pacing: LinkPacing::default(),
            buffer_capacity: 4096,
        }
    }
}

impl LinkConfigInput {
    pub fn resolve(self) -> Result<LinkConfig, ConfigError> {
        let version = if self.version == 0 {
            CONFIG_VERSION
        } else {
            self.version
        };
        if version != CONFIG_VERSION {
            return Err(ConfigError::UnsupportedVersion(version));
        }

        let defaults = LinkConfig::default();
        let pacing = LinkPacing {
            max_burst_length: nonzero(
                "pacing.max_burst_length",
                self.pacing.max_burst_length,
                defaults.pacing.max_burst_length,
            )?,
            max_atomic_send_length: nonzero(
                "pacing.max_atomic_send_length",
                self.pacing.max_atomic_send_length,
                defaults.pacing.max_atomic_send_length,
            )?,
            ingestion_ns_per_byte: match (self.pacing.ingestion_ns_per_byte, self.pacing.baud_rate)
            {
                (Some(ns), _) => ns,
                (None, Some(0)) => {
                    return Err(ConfigError::Zero {
                        field: "pacing.baud_rate",
                    })
                }
                (None, Some(baud)) => LinkPacing::ns_per_byte_at_baud(baud),
                (None, None) => defaults.pacing.ingestion_ns_per_byte,
            },
        };

        Ok(LinkConfig {
            version,
            pacing,
            buffer_capacity: nonzero(
                "buffer_capacity",
                self.buffer_capacity,
                defaults.buffer_capacity,
            )?,
        })
    }
}

fn nonzero(
    field: &'static str,
    value: Option<usize>,
    default: usize,
) -> Result<usize, ConfigError> {
    match value {
        Some(0) => Err(ConfigError::Zero { field }),
        Some(v) => Ok(v),
        None => Ok(default),
    }
}

impl LinkConfig {
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        if input.trim().is_empty() {
            return Ok(LinkConfig::default());
        }
        let parsed: LinkConfigInput = toml::from_str(input)?;
        parsed.resolve()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_input_yields_defaults() {
        let cfg = LinkConfig::from_toml_str("  \n").unwrap();
        assert_eq!(cfg, LinkConfig::default());
    }

    #[test]
    fn parses_pacing_from_baud_rate() {
        let toml = r#"
            version = 1

            [pacing]
            baud_rate = 57600
            max_burst_length = 48
            max_atomic_send_length = 16
        "#;
        let cfg = LinkConfig::from_toml_str(toml).unwrap();
        assert_eq!(cfg.pacing.max_burst_length, 48);
        assert_eq!(cfg.pacing.max_atomic_send_length, 16);
        assert_eq!(cfg.pacing.ingestion_ns_per_byte, 173_611);
        assert_eq!(cfg.buffer_capacity, 4096);
    }

    #[test]
    fn explicit_ingestion_rate_wins() {
        let toml = r#"
            buffer_capacity = 512
            [pacing]
            baud_rate = 9600
            ingestion_ns_per_byte = 0
        "#;
        let cfg = LinkConfig::from_toml_str(toml).unwrap();
        assert_eq!(cfg.pacing.ingestion_ns_per_byte, 0);
        assert_eq!(cfg.buffer_capacity, 512);
        assert_eq!(cfg.pacing.max_burst_length, 64);
    }

    #[test]
    fn rejects_unknown_version() {
        let err = LinkConfig::from_toml_str("version = 2").unwrap_err();
        assert!(matches!(err, ConfigError::UnsupportedVersion(2)));
    }

    #[test]
    fn rejects_zero_lengths() {
        let err = LinkConfig::from_toml_str("[pacing]\nmax_atomic_send_length = 0").unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Zero {
                field: "pacing.max_atomic_send_length"
            }
        ));
        let err = LinkConfig::from_toml_str("[pacing]\nbaud_rate = 0").unwrap_err();
        assert!(err.to_string().contains("baud_rate"));
    }

    #[test]
    fn rejects_malformed_toml() {
        let err = LinkConfig::from_toml_str("version = [").unwrap_err();
        assert!(matches!(err, ConfigError::Toml(_)));
    }
}
