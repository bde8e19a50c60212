use serde::{Deserialize, Serialize};

use crate::settings::RelaySettings;

#[derive(Debug, thiserror::Error)]
pub enum GlobalConfigError {
    #[error("missing required global config field: {0}")]
    MissingField(&'static str),
}

/// Final, merged configuration of the running gateway.
///
/// Merge order (after DB connection): CLI > ENV > DB, then persisted back to DB.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalConfig {
    pub host: String,
    pub port: u16,
    /// Stored as a blake3 hex digest, never plaintext.
    pub admin_key_hash: String,
    /// Optional outbound proxy for upstream egress.
    pub proxy: Option<String>,
    pub dsn: String,
    /// Also print consume events on the terminal event sink.
    pub log_consume_content: bool,
    /// Relay tunables; only the DB layer carries them.
    #[serde(default)]
    pub settings: RelaySettings,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct GlobalConfigPatch {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub admin_key_hash: Option<String>,
    pub proxy: Option<String>,
    pub dsn: Option<String>,
    pub log_consume_content: Option<bool>,
    pub settings: Option<RelaySettings>,
}

impl GlobalConfigPatch {
    pub fn overlay(&mut self, other: GlobalConfigPatch) {
        if other.host.is_some() {
            self.host = other.host;
        }
        if other.port.is_some() {
            self.port = other.port;
        }
        if other.admin_key_hash.is_some() {
            self.admin_key_hash = other.admin_key_hash;
        }
        if other.proxy.is_some() {
            self.proxy = other.proxy;
        }
        if other.dsn.is_some() {
            self.dsn = other.dsn;
        }
        if other.log_consume_content.is_some() {
            self.log_consume_content = other.log_consume_content;
        }
        if other.settings.is_some() {
            self.settings = other.settings;
        }
    }

    pub fn into_config(self) -> Result<GlobalConfig, GlobalConfigError> {
        Ok(GlobalConfig {
            host: self.host.unwrap_or_else(|| "0.0.0.0".to_string()),
            port: self.port.unwrap_or(3000),
            admin_key_hash: self
                .admin_key_hash
                .ok_or(GlobalConfigError::MissingField("admin_key_hash"))?,
            proxy: self.proxy,
            dsn: self.dsn.ok_or(GlobalConfigError::MissingField("dsn"))?,
            log_consume_content: self.log_consume_content.unwrap_or(false),
            settings: self.settings.unwrap_or_default(),
        })
    }
}

impl From<GlobalConfig> for GlobalConfigPatch {
    fn from(value: GlobalConfig) -> Self {
        Self {
            host: Some(value.host),
            port: Some(value.port),
            admin_key_hash: Some(value.admin_key_hash),
            proxy: value.proxy,
            dsn: Some(value.dsn),
            log_consume_content: Some(value.log_consume_content),
            settings: Some(value.settings),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_layer_wins_over_db_layer() {
        let mut merged = GlobalConfigPatch {
            host: Some("127.0.0.1".to_string()),
            port: Some(4000),
            admin_key_hash: Some("db-hash".to_string()),
            dsn: Some("sqlite://db.sqlite".to_string()),
            ..Default::default()
        };
        merged.overlay(GlobalConfigPatch {
            port: Some(5000),
            admin_key_hash: Some("cli-hash".to_string()),
            ..Default::default()
        });

        let config = merged.into_config().unwrap();
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, 5000);
        assert_eq!(config.admin_key_hash, "cli-hash");
        assert_eq!(config.settings, RelaySettings::default());
    }

    #[test]
    fn missing_dsn_is_reported() {
        let patch = GlobalConfigPatch {
            admin_key_hash: Some("hash".to_string()),
            ..Default::default()
        };
        let err = patch.into_config().unwrap_err();
        assert!(matches!(err, GlobalConfigError::MissingField("dsn")));
    }
}
