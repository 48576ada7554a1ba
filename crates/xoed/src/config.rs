//! Process configuration.
//!
//! Resolution order: environment variables → config file → defaults,
//! mirroring `SummitConfig`'s layering from the prototype this daemon grew
//! out of.
//!
//! Config file location:
//!   1. $XOE_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/xoe/config.toml
//!   3. ~/.config/xoe/config.toml

use std::net::IpAddr;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// CLI mode selector (spec §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum, Default)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    Help,
    #[default]
    Server,
    ClientStd,
    ClientSerial,
    ClientUsb,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum, Default)]
#[serde(rename_all = "snake_case")]
pub enum EncryptionMode {
    #[default]
    None,
    Tls1_2,
    Tls1_3,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct XoeConfig {
    pub mode: Mode,
    pub network: NetworkConfig,
    pub tls: TlsConfig,
    pub serial: SerialConfig,
    pub usb: UsbConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub listen_address: Option<IpAddr>,
    pub listen_port: u16,
    pub connect_server_ip: Option<IpAddr>,
    pub connect_server_port: u16,
    /// Native NBD clients speak the standard wire protocol directly, never
    /// the XOE envelope (spec §4.F) — they need a dedicated port distinct
    /// from `listen_port`. `None` disables the NBD listener entirely.
    pub nbd_port: Option<u16>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    pub encryption_mode: EncryptionMode,
    pub cert_path: Option<PathBuf>,
    pub key_path: Option<PathBuf>,
    pub ca_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    pub device: Option<PathBuf>,
    pub baud: u32,
    pub parity: Parity,
    pub data_bits: u8,
    pub stop_bits: u8,
    pub flow_control: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Parity {
    #[default]
    None,
    Even,
    Odd,
}

/// One USB device this client is configured to bridge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsbDeviceConfig {
    pub vid: u16,
    pub pid: u16,
    pub endpoints: Vec<u8>,
    pub timeout_ms: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UsbConfig {
    pub devices: Vec<UsbDeviceConfig>,
    /// Empty disables HMAC authentication entirely (spec §4.H).
    pub auth_secret: String,
    /// Up to 16 class codes; empty means "block HID only" (spec §4.H).
    pub class_whitelist: Vec<u8>,
}

impl Default for XoeConfig {
    fn default() -> Self {
        Self {
            mode: Mode::default(),
            network: NetworkConfig::default(),
            tls: TlsConfig::default(),
            serial: SerialConfig::default(),
            usb: UsbConfig::default(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_address: None,
            listen_port: 12345,
            connect_server_ip: None,
            connect_server_port: 12345,
            nbd_port: None,
        }
    }
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            encryption_mode: EncryptionMode::default(),
            cert_path: None,
            key_path: None,
            ca_path: None,
        }
    }
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            device: None,
            baud: 115_200,
            parity: Parity::default(),
            data_bits: 8,
            stop_bits: 1,
            flow_control: false,
        }
    }
}

impl Default for UsbConfig {
    fn default() -> Self {
        Self {
            devices: Vec::new(),
            auth_secret: String::new(),
            class_whitelist: Vec::new(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("encryption mode requires both cert_path and key_path")]
    MissingCertOrKey,
    #[error("usb class_whitelist accepts at most 16 entries, got {0}")]
    WhitelistTooLarge(usize),
}

impl XoeConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            XoeConfig::default()
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn file_path() -> PathBuf {
        std::env::var("XOE_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.tls.encryption_mode != EncryptionMode::None
            && (self.tls.cert_path.is_none() || self.tls.key_path.is_none())
        {
            return Err(ConfigError::MissingCertOrKey);
        }
        if self.usb.class_whitelist.len() > 16 {
            return Err(ConfigError::WhitelistTooLarge(self.usb.class_whitelist.len()));
        }
        Ok(())
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("XOE_NETWORK__LISTEN_PORT") {
            if let Ok(p) = v.parse() {
                self.network.listen_port = p;
            }
        }
        if let Ok(v) = std::env::var("XOE_NETWORK__LISTEN_ADDRESS") {
            if let Ok(addr) = v.parse() {
                self.network.listen_address = Some(addr);
            }
        }
        if let Ok(v) = std::env::var("XOE_NETWORK__NBD_PORT") {
            if let Ok(p) = v.parse() {
                self.network.nbd_port = Some(p);
            }
        }
        if let Ok(v) = std::env::var("XOE_TLS__CERT_PATH") {
            self.tls.cert_path = Some(PathBuf::from(v));
        }
        if let Ok(v) = std::env::var("XOE_TLS__KEY_PATH") {
            self.tls.key_path = Some(PathBuf::from(v));
        }
        if let Ok(v) = std::env::var("XOE_USB__AUTH_SECRET") {
            self.usb.auth_secret = v;
        }
    }
}

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("xoe")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_disable_encryption_and_auth() {
        let config = XoeConfig::default();
        assert_eq!(config.tls.encryption_mode, EncryptionMode::None);
        assert!(config.usb.auth_secret.is_empty());
        assert_eq!(config.network.listen_port, 12345);
    }

    #[test]
    fn tls_without_cert_path_fails_validation() {
        let mut config = XoeConfig::default();
        config.tls.encryption_mode = EncryptionMode::Tls1_3;
        assert!(matches!(config.validate(), Err(ConfigError::MissingCertOrKey)));
    }

    #[test]
    fn oversized_whitelist_fails_validation() {
        let mut config = XoeConfig::default();
        config.usb.class_whitelist = vec![0u8; 17];
        assert!(matches!(
            config.validate(),
            Err(ConfigError::WhitelistTooLarge(17))
        ));
    }
}
