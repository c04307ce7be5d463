//! Configuration surface for the relay: everything read-only to the core
//! lives here, loaded from a YAML file.

use std::net::SocketAddr;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::error::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ThreadMode {
    /// Pick single vs. dual based on detected CPU count.
    #[default]
    Auto,
    Single,
    Dual,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ObfuscatorConfig {
    /// UDP address the relay listens on for client-side traffic.
    pub listen: SocketAddr,
    /// Upstream WireGuard server address traffic is forwarded to.
    pub forward: SocketAddr,
    /// Pre-shared XOR key. Either inline (`key`) or loaded from
    /// `key_file`. A `0x`-prefixed value is decoded as hex; anything else
    /// is used as a raw UTF-8 passphrase.
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default)]
    pub key_file: Option<String>,
    /// Cap on random padding added to Cookie/Data packets; 0 disables it.
    #[serde(default)]
    pub max_dummy_length_data: u16,
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
    #[serde(default)]
    pub thread_mode: ThreadMode,
    #[serde(default)]
    pub masking_handler: Option<String>,
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Resolved key bytes, populated by `validate`. Not deserialized.
    #[serde(skip)]
    pub key_bytes: Vec<u8>,
}

fn default_idle_timeout_ms() -> u64 {
    180_000
}

fn default_handshake_timeout_ms() -> u64 {
    5_000
}

fn default_log_level() -> String {
    "info".to_string()
}

impl ObfuscatorConfig {
    /// Validate the config and resolve the XOR key into bytes.
    ///
    /// Must be called once after deserialization; the pipeline assumes
    /// `key_bytes` is non-empty.
    pub fn validate(&mut self) -> Result<()> {
        let key_source = match (&self.key, &self.key_file) {
            (Some(_), Some(_)) => {
                anyhow::bail!(Error::Config(
                    "only one of `key` or `key_file` may be set".into()
                ))
            }
            (Some(k), None) => k.clone(),
            (None, Some(path)) => std::fs::read_to_string(path)
                .with_context(|| format!("reading key_file '{}'", path))?
                .trim()
                .to_string(),
            (None, None) => {
                anyhow::bail!(Error::Config("one of `key` or `key_file` is required".into()))
            }
        };

        if key_source.is_empty() {
            anyhow::bail!(Error::Config("XOR key must not be empty".into()));
        }
        self.key_bytes = decode_key(&key_source)
            .map_err(|e| Error::Config(format!("invalid key: {e}")))?;

        if self.handshake_timeout_ms == 0 {
            anyhow::bail!(Error::Config("handshake_timeout_ms must be > 0".into()));
        }
        if self.idle_timeout_ms == 0 {
            anyhow::bail!(Error::Config("idle_timeout_ms must be > 0".into()));
        }
        if self.listen == self.forward {
            anyhow::bail!(Error::Config(
                "listen and forward addresses must differ".into()
            ));
        }

        Ok(())
    }
}

/// Decodes a configured key string: a `0x`-prefixed value is parsed as
/// hex digit pairs, anything else is used as a raw UTF-8 passphrase.
fn decode_key(raw: &str) -> Result<Vec<u8>> {
    let Some(hex_digits) = raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X")) else {
        return Ok(raw.as_bytes().to_vec());
    };

    if hex_digits.is_empty() || hex_digits.len() % 2 != 0 {
        anyhow::bail!("hex key must have an even, non-zero number of digits after 0x");
    }
    (0..hex_digits.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&hex_digits[i..i + 2], 16)
                .with_context(|| format!("invalid hex digit pair '{}'", &hex_digits[i..i + 2]))
        })
        .collect()
}

pub fn load_config(path: &str) -> Result<ObfuscatorConfig> {
    let content = std::fs::read_to_string(Path::new(path))
        .with_context(|| format!("reading config '{}'", path))?;
    let mut config: ObfuscatorConfig =
        serde_yml::from_str(&content).with_context(|| format!("parsing config '{}'", path))?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_yaml() -> String {
        "listen: \"127.0.0.1:51821\"\nforward: \"127.0.0.1:51820\"\nkey: \"abc\"\n".to_string()
    }

    #[test]
    fn load_config_resolves_inline_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, base_yaml()).unwrap();

        let config = load_config(path.to_str().unwrap()).unwrap();
        assert_eq!(config.key_bytes, b"abc");
        assert_eq!(config.idle_timeout_ms, default_idle_timeout_ms());
        assert_eq!(config.thread_mode, ThreadMode::Auto);
    }

    #[test]
    fn validate_rejects_both_key_and_key_file() {
        let mut config: ObfuscatorConfig = serde_yml::from_str(&format!(
            "{}key_file: \"/tmp/whatever\"\n",
            base_yaml()
        ))
        .unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_empty_key() {
        let mut config: ObfuscatorConfig = serde_yml::from_str(
            "listen: \"127.0.0.1:51821\"\nforward: \"127.0.0.1:51820\"\nkey: \"\"\n",
        )
        .unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_same_listen_and_forward() {
        let mut config: ObfuscatorConfig = serde_yml::from_str(
            "listen: \"127.0.0.1:51820\"\nforward: \"127.0.0.1:51820\"\nkey: \"abc\"\n",
        )
        .unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_decodes_hex_key() {
        let mut config: ObfuscatorConfig = serde_yml::from_str(
            "listen: \"127.0.0.1:51821\"\nforward: \"127.0.0.1:51820\"\nkey: \"0xDEADBEEF\"\n",
        )
        .unwrap();
        config.validate().unwrap();
        assert_eq!(config.key_bytes, vec![0xDE, 0xAD, 0xBE, 0xEF]);
    }

    #[test]
    fn validate_rejects_odd_length_hex_key() {
        let mut config: ObfuscatorConfig = serde_yml::from_str(
            "listen: \"127.0.0.1:51821\"\nforward: \"127.0.0.1:51820\"\nkey: \"0xABC\"\n",
        )
        .unwrap();
        assert!(config.validate().is_err());
    }
}
