//! Module configuration from the environment.
//!
//! The runtime has no CLI; everything it needs arrives through the init
//! blob or through `PYWATT_*` environment variables, which the
//! orchestrator may set directly or via `InitBlob.env`. Init-blob values
//! win over process environment when both are present.

use std::collections::HashMap;

use figment::providers::Env;
use figment::Figment;
use pywatt_proto::EncodingFormat;
use serde::Deserialize;
use tracing::warn;

/// Runtime configuration resolved from `PYWATT_*` variables.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ModuleConfig {
    /// Module identity override when no handshake occurred (test mode).
    /// `PYWATT_MODULE_ID`.
    pub module_id: Option<String>,

    /// Pre-allocated TCP port; bypasses port negotiation entirely.
    /// `PYWATT_PORT`.
    pub port: Option<u16>,

    /// Truthy value disables HTTP binding. `PYWATT_IPC_ONLY`.
    pub ipc_only: Option<String>,

    /// Preferred payload encoding for socket channels.
    /// `PYWATT_MESSAGE_FORMAT`, `Json` or `Binary`.
    pub message_format: Option<EncodingFormat>,
}

impl ModuleConfig {
    /// Reads configuration from the process environment.
    pub fn from_env() -> Result<Self, figment::Error> {
        Figment::new().merge(Env::prefixed("PYWATT_")).extract()
    }

    /// Overlays values from `InitBlob.env`, which take precedence.
    pub fn apply_init_env(&mut self, env: &HashMap<String, String>) {
        if let Some(module_id) = env.get("PYWATT_MODULE_ID") {
            self.module_id = Some(module_id.clone());
        }
        if let Some(port) = env.get("PYWATT_PORT") {
            match port.parse() {
                Ok(port) => self.port = Some(port),
                Err(e) => warn!(value = %port, error = %e, "ignoring unparsable PYWATT_PORT"),
            }
        }
        if let Some(ipc_only) = env.get("PYWATT_IPC_ONLY") {
            self.ipc_only = Some(ipc_only.clone());
        }
    }

    /// Whether HTTP binding is disabled.
    #[must_use]
    pub fn is_ipc_only(&self) -> bool {
        self.ipc_only
            .as_deref()
            .is_some_and(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
    }

    /// The preferred payload encoding, JSON unless configured otherwise.
    #[must_use]
    pub fn message_format(&self) -> EncodingFormat {
        self.message_format.unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_empty() {
        let config = ModuleConfig::default();
        assert!(config.module_id.is_none());
        assert!(config.port.is_none());
        assert!(!config.is_ipc_only());
        assert_eq!(config.message_format(), EncodingFormat::Json);
    }

    #[test]
    fn init_env_overrides_fields() {
        let mut config = ModuleConfig::default();
        let env: HashMap<String, String> = [
            ("PYWATT_MODULE_ID".to_owned(), "m42".to_owned()),
            ("PYWATT_PORT".to_owned(), "9001".to_owned()),
            ("PYWATT_IPC_ONLY".to_owned(), "true".to_owned()),
        ]
        .into();

        config.apply_init_env(&env);
        assert_eq!(config.module_id.as_deref(), Some("m42"));
        assert_eq!(config.port, Some(9001));
        assert!(config.is_ipc_only());
    }

    #[test]
    fn bad_port_value_is_ignored() {
        let mut config = ModuleConfig::default();
        let env: HashMap<String, String> =
            [("PYWATT_PORT".to_owned(), "not-a-port".to_owned())].into();

        config.apply_init_env(&env);
        assert!(config.port.is_none());
    }

    #[test]
    fn ipc_only_truthiness() {
        for truthy in ["1", "true", "TRUE", "yes", "on"] {
            let config = ModuleConfig {
                ipc_only: Some(truthy.to_owned()),
                ..ModuleConfig::default()
            };
            assert!(config.is_ipc_only(), "{truthy} should be truthy");
        }
        for falsy in ["0", "false", "off", ""] {
            let config = ModuleConfig {
                ipc_only: Some(falsy.to_owned()),
                ..ModuleConfig::default()
            };
            assert!(!config.is_ipc_only(), "{falsy} should be falsy");
        }
    }
}
