//! Control-plane message types.
//!
//! These are the shapes exchanged between a module and its orchestrator:
//! the startup handshake ([`InitBlob`] → [`AnnounceBlob`]) and the tagged
//! message sets flowing in each direction afterwards. On stdio every
//! message is one JSON object per line; on socket channels the same types
//! travel as [`EncodedMessage`](crate::EncodedMessage) payloads.
//!
//! Readers must ignore unknown fields and log-and-skip unknown message
//! kinds; receipt of an unrecognised message never aborts the process.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Address a module listens on, either TCP or Unix domain socket.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ListenAddress {
    /// TCP socket address.
    Tcp(SocketAddr),
    /// Unix domain socket path.
    Unix(PathBuf),
}

impl std::fmt::Display for ListenAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tcp(addr) => write!(f, "{addr}"),
            Self::Unix(path) => write!(f, "{}", path.display()),
        }
    }
}

/// Security level required on socket channels.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SecurityLevel {
    /// Plaintext, no authentication.
    #[default]
    None,
    /// Auth token presented on the first frame.
    Token,
    /// Mutual TLS.
    Mtls,
}

/// Configuration for the optional TCP channel.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct TcpChannelConfig {
    /// Orchestrator address to connect to.
    pub address: SocketAddr,
    /// Whether the connection must be TLS-secured.
    #[serde(default)]
    pub tls_enabled: bool,
    /// Whether bootstrap must fail if this channel cannot connect.
    #[serde(default)]
    pub required: bool,
}

impl TcpChannelConfig {
    /// Creates a plaintext, optional TCP channel configuration.
    #[must_use]
    pub fn new(address: SocketAddr) -> Self {
        Self {
            address,
            tls_enabled: false,
            required: false,
        }
    }

    /// Enables or disables TLS.
    #[must_use]
    pub fn with_tls(mut self, tls_enabled: bool) -> Self {
        self.tls_enabled = tls_enabled;
        self
    }

    /// Marks the channel as required.
    #[must_use]
    pub fn with_required(mut self, required: bool) -> Self {
        self.required = required;
        self
    }
}

/// Configuration for the optional Unix-socket IPC channel.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct IpcChannelConfig {
    /// Path to the orchestrator's Unix domain socket.
    pub socket_path: PathBuf,
    /// Whether bootstrap must fail if this channel cannot connect.
    #[serde(default)]
    pub required: bool,
}

impl IpcChannelConfig {
    /// Creates an optional IPC channel configuration.
    #[must_use]
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            required: false,
        }
    }

    /// Marks the channel as required.
    #[must_use]
    pub fn with_required(mut self, required: bool) -> Self {
        self.required = required;
        self
    }
}

/// Initialisation blob, sent orchestrator → module as one JSON line on
/// stdin before anything else.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct InitBlob {
    /// Opaque URL-shaped identifier of the orchestrator API.
    pub orchestrator_api: String,

    /// Module identity assigned by the orchestrator.
    pub module_id: String,

    /// Environment the orchestrator wants this module to see.
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Listen address assigned by the orchestrator.
    pub listen: ListenAddress,

    /// Optional TCP channel configuration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tcp_channel: Option<TcpChannelConfig>,

    /// Optional Unix-socket IPC channel configuration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipc_channel: Option<IpcChannelConfig>,

    /// Auth token for `Token`-level channels.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,

    /// Security level required on socket channels.
    #[serde(default)]
    pub security_level: SecurityLevel,
}

impl InitBlob {
    /// Creates a minimal init blob.
    #[must_use]
    pub fn new(
        orchestrator_api: impl Into<String>,
        module_id: impl Into<String>,
        listen: ListenAddress,
    ) -> Self {
        Self {
            orchestrator_api: orchestrator_api.into(),
            module_id: module_id.into(),
            env: HashMap::new(),
            listen,
            tcp_channel: None,
            ipc_channel: None,
            auth_token: None,
            security_level: SecurityLevel::None,
        }
    }

    /// Sets the environment map.
    #[must_use]
    pub fn with_env(mut self, env: HashMap<String, String>) -> Self {
        self.env = env;
        self
    }

    /// Adds a TCP channel configuration.
    #[must_use]
    pub fn with_tcp_channel(mut self, config: TcpChannelConfig) -> Self {
        self.tcp_channel = Some(config);
        self
    }

    /// Adds an IPC channel configuration.
    #[must_use]
    pub fn with_ipc_channel(mut self, config: IpcChannelConfig) -> Self {
        self.ipc_channel = Some(config);
        self
    }

    /// Sets the auth token.
    #[must_use]
    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    /// Sets the security level.
    #[must_use]
    pub fn with_security_level(mut self, level: SecurityLevel) -> Self {
        self.security_level = level;
        self
    }

    /// Checks whether any socket channel is configured.
    #[must_use]
    pub fn has_channels(&self) -> bool {
        self.tcp_channel.is_some() || self.ipc_channel.is_some()
    }

    /// Checks whether any configured socket channel is required.
    #[must_use]
    pub fn has_required_channels(&self) -> bool {
        self.tcp_channel.as_ref().is_some_and(|c| c.required)
            || self.ipc_channel.as_ref().is_some_and(|c| c.required)
    }
}

/// A single HTTP endpoint a module announces.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct EndpointAnnounce {
    /// Route path, e.g. `/health`.
    pub path: String,
    /// HTTP methods served on the path.
    pub methods: Vec<String>,
    /// Optional auth requirement tag understood by the orchestrator.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<String>,
}

/// Announcement blob, sent module → orchestrator as one JSON line on
/// stdout once the module has bound its listener. Exactly one per process
/// lifetime.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct AnnounceBlob {
    /// The address or path actually bound.
    pub listen: String,
    /// All endpoints exposed by the module, in order.
    pub endpoints: Vec<EndpointAnnounce>,
}

/// Request for a named secret.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct GetSecretRequest {
    /// Secret name, case-sensitive.
    pub name: String,
}

/// A secret value delivery, either answering a `GetSecret` or pushed as
/// part of a rotation batch (then `rotation_id` is set).
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SecretDelivery {
    pub name: String,
    pub value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rotation_id: Option<String>,
}

/// Notification that a batch of secrets was rotated. Cached values for the
/// listed keys must be invalidated and re-fetched on next use.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct RotatedNotification {
    pub keys: Vec<String>,
    pub rotation_id: String,
}

/// Outcome of processing a rotation batch.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RotationStatus {
    Ok,
    Failed,
}

/// Acknowledgement of a rotation batch.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct RotationAck {
    pub rotation_id: String,
    pub status: RotationStatus,
}

/// Port negotiation request.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct PortRequest {
    /// Fresh id correlating the eventual response.
    pub request_id: Uuid,
    /// Specific port the module would like, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub specific_port: Option<u16>,
}

/// Port negotiation response. Exactly one of `port` and `error` is set.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct PortResponse {
    /// Echoes the request id.
    pub request_id: Uuid,
    /// The allocated port on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    /// Failure reason otherwise.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// HTTP request tunnelled from the orchestrator to the module.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct IpcHttpRequest {
    /// Id the response must echo.
    pub request_id: String,
    pub method: String,
    pub uri: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Vec<u8>>,
}

/// HTTP response tunnelled back from the module.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct IpcHttpResponse {
    /// Echoes the originating request id.
    pub request_id: String,
    pub status_code: u16,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Vec<u8>>,
}

/// Messages sent from a module to the orchestrator.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum ModuleToOrchestrator {
    /// Declare the bound address and endpoints. Sent exactly once.
    Announce(AnnounceBlob),

    /// Fetch a secret by name.
    GetSecret(GetSecretRequest),

    /// Acknowledge a rotation batch.
    RotationAck(RotationAck),

    /// Request a TCP port for the HTTP server.
    PortRequest(PortRequest),

    /// A typed request for another module, routed by the orchestrator.
    InternalRequest {
        /// Fresh id used to correlate the routed response.
        request_id: Uuid,
        /// The module that should receive the payload.
        target_module_id: String,
        /// Endpoint within the target module.
        endpoint: String,
        /// The request payload.
        payload: serde_json::Value,
    },

    /// Answer to a tunnelled HTTP request.
    HttpResponse(IpcHttpResponse),

    /// Answer to an orchestrator heartbeat.
    HeartbeatAck,

    /// Answer to an earlier `RoutedModuleMessage`. Exactly one of `result`
    /// and `error` is set.
    RoutedModuleResponse {
        /// Echoes the `RoutedModuleMessage` id.
        request_id: Uuid,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<serde_json::Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

/// Messages sent from the orchestrator to a module.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum OrchestratorToModule {
    /// A secret value, on demand or as part of a rotation.
    Secret(SecretDelivery),

    /// A batch of secrets was rotated.
    Rotated(RotatedNotification),

    /// Begin graceful shutdown.
    Shutdown,

    /// Answer to a port negotiation request.
    PortResponse(PortResponse),

    /// A request from a peer module, routed here by the orchestrator.
    RoutedModuleMessage {
        /// The module that originated the request.
        source_module_id: String,
        /// Id to echo in the routed response.
        request_id: Uuid,
        /// The request payload.
        payload: serde_json::Value,
    },

    /// Answer to an earlier `InternalRequest`. Exactly one of `result` and
    /// `error` is set.
    RoutedModuleResponse {
        /// Echoes the `InternalRequest` id.
        request_id: Uuid,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<serde_json::Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    /// HTTP request tunnelled to the module.
    HttpRequest(IpcHttpRequest),

    /// Liveness probe; answered with `HeartbeatAck`.
    Heartbeat,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_blob_parses_minimal_handshake_line() {
        let line = r#"{"orchestrator_api":"x","module_id":"m1","env":{},"listen":{"tcp":"127.0.0.1:0"},"security_level":"None"}"#;
        let init: InitBlob = serde_json::from_str(line).unwrap();

        assert_eq!(init.module_id, "m1");
        assert_eq!(init.security_level, SecurityLevel::None);
        assert!(matches!(init.listen, ListenAddress::Tcp(addr) if addr.port() == 0));
        assert!(!init.has_channels());
    }

    #[test]
    fn init_blob_ignores_unknown_fields() {
        let line = r#"{"orchestrator_api":"x","module_id":"m1","listen":{"unix":"/tmp/m1.sock"},"future_field":{"nested":true}}"#;
        let init: InitBlob = serde_json::from_str(line).unwrap();
        assert!(matches!(init.listen, ListenAddress::Unix(_)));
    }

    #[test]
    fn init_blob_with_channel_configs() {
        let line = r#"{
            "orchestrator_api": "x",
            "module_id": "m1",
            "env": {"PYWATT_PORT": "8123"},
            "listen": {"tcp": "127.0.0.1:8123"},
            "tcp_channel": {"address": "127.0.0.1:9000", "tls_enabled": false, "required": true},
            "ipc_channel": {"socket_path": "/run/pywatt/m1.sock", "required": false},
            "security_level": "Token",
            "auth_token": "t0k3n"
        }"#;
        let init: InitBlob = serde_json::from_str(line).unwrap();

        assert!(init.has_channels());
        assert!(init.has_required_channels());
        assert_eq!(init.security_level, SecurityLevel::Token);
        assert_eq!(init.env.get("PYWATT_PORT").map(String::as_str), Some("8123"));
    }

    #[test]
    fn secret_delivery_wire_shape() {
        let line = r#"{"Secret":{"name":"DATABASE_URL","value":"postgres://u:p@h/db"}}"#;
        let message: OrchestratorToModule = serde_json::from_str(line).unwrap();

        match message {
            OrchestratorToModule::Secret(delivery) => {
                assert_eq!(delivery.name, "DATABASE_URL");
                assert!(delivery.rotation_id.is_none());
            }
            other => panic!("expected Secret, got {other:?}"),
        }
    }

    #[test]
    fn rotation_ack_wire_shape() {
        let ack = ModuleToOrchestrator::RotationAck(RotationAck {
            rotation_id: "r1".to_owned(),
            status: RotationStatus::Ok,
        });
        let json = serde_json::to_string(&ack).unwrap();
        assert_eq!(json, r#"{"RotationAck":{"rotation_id":"r1","status":"ok"}}"#);
    }

    #[test]
    fn rotated_notification_wire_shape() {
        let line = r#"{"Rotated":{"keys":["DATABASE_URL"],"rotation_id":"r1"}}"#;
        let message: OrchestratorToModule = serde_json::from_str(line).unwrap();
        assert!(matches!(
            message,
            OrchestratorToModule::Rotated(RotatedNotification { ref keys, .. }) if keys == &["DATABASE_URL".to_owned()]
        ));
    }

    #[test]
    fn http_request_wire_shape() {
        let line =
            r#"{"HttpRequest":{"request_id":"r","method":"GET","uri":"/health","headers":{}}}"#;
        let message: OrchestratorToModule = serde_json::from_str(line).unwrap();

        match message {
            OrchestratorToModule::HttpRequest(request) => {
                assert_eq!(request.request_id, "r");
                assert_eq!(request.method, "GET");
                assert!(request.body.is_none());
            }
            other => panic!("expected HttpRequest, got {other:?}"),
        }
    }

    #[test]
    fn routed_module_response_wire_shape() {
        let id = Uuid::new_v4();
        let line = format!(
            r#"{{"RoutedModuleResponse":{{"request_id":"{id}","result":{{"pong":true}}}}}}"#
        );
        let message: OrchestratorToModule = serde_json::from_str(&line).unwrap();

        match message {
            OrchestratorToModule::RoutedModuleResponse {
                request_id,
                result,
                error,
            } => {
                assert_eq!(request_id, id);
                assert_eq!(result, Some(serde_json::json!({"pong": true})));
                assert!(error.is_none());
            }
            other => panic!("expected RoutedModuleResponse, got {other:?}"),
        }
    }

    #[test]
    fn unknown_message_kind_is_a_parse_error() {
        let line = r#"{"FutureKind":{"anything":1}}"#;
        let parsed: Result<OrchestratorToModule, _> = serde_json::from_str(line);
        assert!(parsed.is_err());
    }

    #[test]
    fn announce_blob_roundtrip() {
        let announce = AnnounceBlob {
            listen: "127.0.0.1:4102".to_owned(),
            endpoints: vec![EndpointAnnounce {
                path: "/health".to_owned(),
                methods: vec!["GET".to_owned()],
                auth: None,
            }],
        };

        let json = serde_json::to_string(&announce).unwrap();
        let restored: AnnounceBlob = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, announce);
    }
}
