//! Robot build configuration.
//!
//! One TOML file per invocation describes the robot the image is
//! personalized for. The file feeds two consumers: the pipeline flags
//! (license acceptance, push target) and the placeholder render context.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::board::Board;
use crate::errors::BuildError;

pub const TOOL_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WifiNetwork {
    pub ssid: String,
    /// Empty string means an open network.
    #[serde(default)]
    pub psk: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RobotConfig {
    pub hostname: String,
    #[serde(default = "default_country")]
    pub country: String,
    pub token: String,
    pub robot_type: String,
    #[serde(default)]
    pub robot_configuration: String,
    pub robot_distro: String,
    #[serde(default)]
    pub wifi: Vec<WifiNetwork>,
    /// Files first boot must regenerate (host keys and the like).
    #[serde(default)]
    pub sanitize_files: Vec<String>,
    #[serde(default = "default_registry")]
    pub registry: String,
    #[serde(default)]
    pub accept_license: bool,
    #[serde(default)]
    pub push_url: Option<String>,
    /// RFC 3339 stamp for reproducible builds; defaults to now.
    #[serde(default)]
    pub build_timestamp: Option<String>,
}

fn default_country() -> String {
    "US".to_string()
}

fn default_registry() -> String {
    "docker.io".to_string()
}

impl RobotConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading robot config '{}'", path.display()))?;
        let config: RobotConfig = toml::from_str(&raw)
            .with_context(|| format!("parsing robot config '{}'", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.hostname.is_empty() {
            return Err(BuildError::Config("hostname must not be empty".into()).into());
        }
        let first = self.hostname.as_bytes()[0];
        if !first.is_ascii_lowercase() {
            return Err(
                BuildError::Config("hostname must start with a lowercase letter".into()).into(),
            );
        }
        for ch in self.hostname.chars() {
            if !ch.is_ascii_lowercase() && !ch.is_ascii_digit() && ch != '-' {
                return Err(BuildError::Config(
                    "hostname may only contain lowercase letters, digits, and hyphens".into(),
                )
                .into());
            }
        }
        Ok(())
    }

    /// wpa_supplicant network blocks for the declared networks.
    ///
    /// An empty list renders to an empty string, which is a valid
    /// configuration (no pre-provisioned networks).
    pub fn render_wifi_networks(&self) -> String {
        let mut out = String::new();
        for network in &self.wifi {
            out.push_str("network={\n");
            out.push_str(&format!("  ssid=\"{}\"\n", network.ssid));
            if network.psk.is_empty() {
                out.push_str("  key_mgmt=NONE\n");
            } else {
                out.push_str(&format!("  psk=\"{}\"\n", network.psk));
            }
            out.push_str("}\n");
        }
        out
    }

    /// Build stamp: fixed when `build_timestamp` is set, wall clock otherwise.
    pub fn stamp(&self) -> String {
        match &self.build_timestamp {
            Some(stamp) => stamp.clone(),
            None => OffsetDateTime::now_utc()
                .format(&Rfc3339)
                .unwrap_or_else(|_| "1970-01-01T00:00:00Z".to_string()),
        }
    }

    /// JSON stats blob placed both in the image and in rendered payloads.
    pub fn stats_json(&self, board: Board) -> String {
        serde_json::json!({
            "stamp": self.stamp(),
            "tool_version": TOOL_VERSION,
            "board": board.name(),
            "robot_type": self.robot_type,
        })
        .to_string()
    }

    /// The enumerated placeholder render context.
    pub fn render_context(&self, board: Board) -> BTreeMap<String, String> {
        let mut fields = BTreeMap::new();
        fields.insert("hostname".to_string(), self.hostname.clone());
        fields.insert("country".to_string(), self.country.clone());
        fields.insert("token".to_string(), self.token.clone());
        fields.insert("robot_type".to_string(), self.robot_type.clone());
        fields.insert(
            "robot_configuration".to_string(),
            self.robot_configuration.clone(),
        );
        fields.insert("robot_distro".to_string(), self.robot_distro.clone());
        fields.insert("wifi_networks".to_string(), self.render_wifi_networks());
        fields.insert(
            "sanitize_files".to_string(),
            self.sanitize_files.join("\n"),
        );
        fields.insert("stats".to_string(), self.stats_json(board));
        fields
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_toml() -> &'static str {
        r#"
hostname = "autobot01"
token = "dt1-abc"
robot_type = "duckiebot"
robot_distro = "ente"
"#
    }

    fn parse(toml_text: &str) -> RobotConfig {
        let config: RobotConfig = toml::from_str(toml_text).unwrap();
        config
    }

    #[test]
    fn minimal_config_parses_with_defaults() {
        let config = parse(minimal_toml());
        assert_eq!(config.country, "US");
        assert_eq!(config.registry, "docker.io");
        assert!(config.wifi.is_empty());
        assert!(!config.accept_license);
    }

    #[test]
    fn empty_wifi_renders_empty_but_valid() {
        let config = parse(minimal_toml());
        assert_eq!(config.render_wifi_networks(), "");
    }

    #[test]
    fn open_and_psk_networks_render_blocks() {
        let mut config = parse(minimal_toml());
        config.wifi = vec![
            WifiNetwork {
                ssid: "duckietown".into(),
                psk: "quackquack".into(),
            },
            WifiNetwork {
                ssid: "openlab".into(),
                psk: String::new(),
            },
        ];
        let rendered = config.render_wifi_networks();
        assert!(rendered.contains("ssid=\"duckietown\""));
        assert!(rendered.contains("psk=\"quackquack\""));
        assert!(rendered.contains("key_mgmt=NONE"));
    }

    #[test]
    fn render_context_has_exactly_the_enumerated_fields() {
        let config = parse(minimal_toml());
        let fields = config.render_context(Board::RaspberryPi64);
        let names: Vec<&str> = fields.keys().map(String::as_str).collect();
        assert_eq!(
            names,
            vec![
                "country",
                "hostname",
                "robot_configuration",
                "robot_distro",
                "robot_type",
                "sanitize_files",
                "stats",
                "token",
                "wifi_networks",
            ]
        );
    }

    #[test]
    fn fixed_timestamp_is_honored() {
        let mut config = parse(minimal_toml());
        config.build_timestamp = Some("2024-01-01T00:00:00Z".into());
        assert!(config
            .stats_json(Board::RaspberryPi64)
            .contains("2024-01-01T00:00:00Z"));
    }

    #[test]
    fn hostname_validation() {
        let mut config = parse(minimal_toml());
        config.hostname = "Bad_Name".into();
        assert!(config.validate().is_err());
        config.hostname = "autobot01".into();
        assert!(config.validate().is_ok());
    }
}
