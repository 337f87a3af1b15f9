//! Scenario configuration.
//!
//! Loaded from TOML via `serde`. Protocol- and attacker-specific subtables
//! are kept as generic [`toml::Value`] and passed verbatim to the relevant
//! constructor, since the kernel has no business knowing their shape.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct NetworkDelay {
    pub mean: f64,
    pub std: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub node_num: u32,
    pub byzantine_node_num: u32,
    /// Heartbeat/timeout tick base, in seconds.
    pub lambda: u64,
    pub protocol: String,
    pub attacker: String,
    pub network_delay: NetworkDelay,
    pub repeat_time: u32,
    #[serde(default)]
    pub log_to_file: bool,
    #[serde(default)]
    pub seed: Option<u64>,
    /// Virtual-time ceiling in seconds; a run that exceeds it without every
    /// correct replica deciding is recorded as `RunTimeout`.
    #[serde(default = "default_time_ceiling")]
    pub time_ceiling_secs: f64,
    /// Event-count ceiling; a second, independent way for a run to time out
    /// without waiting out the full virtual-time ceiling.
    #[serde(default = "default_event_ceiling")]
    pub event_ceiling: u64,
    /// Protocol-specific subtable (e.g. `babble.suspend_limit`), passed
    /// verbatim to the replica constructor.
    #[serde(default)]
    pub protocol_config: toml::value::Table,
    /// Attacker-specific subtable, passed verbatim to the attacker constructor.
    #[serde(default)]
    pub attacker_config: toml::value::Table,
    /// Where to append one JSON-lines record per run.
    #[serde(default)]
    pub results_path: Option<String>,
}

fn default_time_ceiling() -> f64 {
    300.0
}

fn default_event_ceiling() -> u64 {
    1_000_000
}

/// Protocol tags recognized by the kernel. Only the Babble family
/// (`ssb-babble`/`libp2p-babble`) is fully implemented; the rest name real
/// external consensus protocols this build does not include a replica for.
pub const KNOWN_PROTOCOLS: &[&str] =
    &["pbft", "hotstuff-ns", "librabft", "algorand", "async-ba", "ssb-babble", "libp2p-babble"];

impl Config {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| Error::InvalidConfig {
            field: "path".to_string(),
            reason: format!("could not read {}: {e}", path.display()),
        })?;
        let config: Config = toml::from_str(&text).map_err(|e| Error::InvalidConfig {
            field: "<file>".to_string(),
            reason: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn seed(&self) -> u64 {
        self.seed.unwrap_or(0)
    }

    /// `f = floor((N-1)/3)`, the conventional Byzantine tolerance for `node_num`.
    pub fn conventional_f(&self) -> u32 {
        self.node_num.saturating_sub(1) / 3
    }

    pub fn validate(&self) -> Result<()> {
        if self.node_num < 1 {
            return Err(Error::InvalidConfig { field: "node_num".into(), reason: "must be >= 1".into() });
        }
        if self.byzantine_node_num >= self.node_num {
            return Err(Error::InvalidConfig {
                field: "byzantine_node_num".into(),
                reason: format!("must be < node_num ({})", self.node_num),
            });
        }
        if !KNOWN_PROTOCOLS.contains(&self.protocol.as_str()) {
            return Err(Error::InvalidConfig {
                field: "protocol".into(),
                reason: format!("unknown tag `{}`, expected one of {KNOWN_PROTOCOLS:?}", self.protocol),
            });
        }
        if self.network_delay.mean < 0.0 || self.network_delay.std < 0.0 {
            return Err(Error::InvalidConfig {
                field: "network_delay".into(),
                reason: "mean and std must be non-negative".into(),
            });
        }
        if self.repeat_time < 1 {
            return Err(Error::InvalidConfig { field: "repeat_time".into(), reason: "must be >= 1".into() });
        }
        if self.lambda < 1 {
            return Err(Error::InvalidConfig { field: "lambda".into(), reason: "must be >= 1".into() });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_toml() -> &'static str {
        r#"
        node_num = 4
        byzantine_node_num = 1
        lambda = 5
        protocol = "ssb-babble"
        attacker = "identity"
        repeat_time = 1

        [network_delay]
        mean = 0.1
        std = 0.0
        "#
    }

    #[test]
    fn parses_minimal_config_with_defaults() {
        let config: Config = toml::from_str(minimal_toml()).unwrap();
        assert_eq!(config.seed(), 0);
        assert_eq!(config.conventional_f(), 1);
        assert!(!config.log_to_file);
        config.validate().unwrap();
    }

    #[test]
    fn rejects_byzantine_node_num_at_or_above_node_num() {
        let mut config: Config = toml::from_str(minimal_toml()).unwrap();
        config.byzantine_node_num = 4;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_unknown_protocol_tag() {
        let mut config: Config = toml::from_str(minimal_toml()).unwrap();
        config.protocol = "made-up-protocol".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_negative_delay_parameters() {
        let mut config: Config = toml::from_str(minimal_toml()).unwrap();
        config.network_delay.std = -1.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn from_path_loads_and_validates_a_scenario_file() {
        use std::io::Write;
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(minimal_toml().as_bytes()).unwrap();
        let config = Config::from_path(file.path()).unwrap();
        assert_eq!(config.node_num, 4);
    }

    #[test]
    fn from_path_surfaces_an_invalid_config_error_for_a_missing_file() {
        let err = Config::from_path("/nonexistent/chronobft-scenario.toml").unwrap_err();
        assert!(matches!(err, Error::InvalidConfig { .. }));
    }
}
