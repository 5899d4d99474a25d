//! Configuration model: YAML on disk, strict validation at startup.
//!
//! `${env:NAME}` and `${credential:key}` placeholders are substituted on
//! the raw text before parsing, so secrets never need to live in the file.
//! Validation failures abort startup; components receive immutable config
//! snapshots and never re-read the file themselves.

use crate::backoff::ReconnectPolicy;
use crate::credentials::CredentialStore;
use crate::error::ConfigError;
use crate::record::ProtocolKind;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration document.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BridgeConfig {
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
    #[serde(default)]
    pub zerobus: ZerobusConfig,
    #[serde(default)]
    pub backpressure: BackpressureConfig,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
}

/// One configured telemetry source.
#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub name: String,
    pub endpoint: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(flatten)]
    pub protocol: ProtocolConfig,
}

impl SourceConfig {
    pub fn kind(&self) -> ProtocolKind {
        self.protocol.kind()
    }
}

/// Protocol-specific source options, tagged by the `protocol` key.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "protocol", rename_all = "lowercase")]
pub enum ProtocolConfig {
    Opcua(OpcuaSourceOptions),
    Mqtt(MqttSourceOptions),
    Modbus(ModbusSourceOptions),
}

impl ProtocolConfig {
    pub fn kind(&self) -> ProtocolKind {
        match self {
            Self::Opcua(_) => ProtocolKind::Opcua,
            Self::Mqtt(_) => ProtocolKind::Mqtt,
            Self::Modbus(_) => ProtocolKind::Modbus,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OpcuaSourceOptions {
    /// Cap on Variable nodes collected while browsing.
    pub max_nodes: usize,
    /// How deep below the Objects folder the browse descends.
    pub max_browse_depth: usize,
    pub publishing_interval_ms: u64,
    pub session_timeout_ms: u64,
}

impl Default for OpcuaSourceOptions {
    fn default() -> Self {
        Self {
            max_nodes: 100,
            max_browse_depth: 4,
            publishing_interval_ms: 500,
            session_timeout_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MqttSourceOptions {
    pub topics: Vec<String>,
    pub qos: u8,
    pub client_id: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub clean_session: bool,
    pub keepalive_secs: u64,
    pub payload_format: PayloadFormat,
    /// Field extracted from JSON object payloads.
    pub value_field: String,
    pub tls: Option<MqttTlsOptions>,
}

impl Default for MqttSourceOptions {
    fn default() -> Self {
        Self {
            topics: vec!["#".to_string()],
            qos: 1,
            client_id: None,
            username: None,
            password: None,
            clean_session: true,
            keepalive_secs: 60,
            payload_format: PayloadFormat::Auto,
            value_field: "value".to_string(),
            tls: None,
        }
    }
}

/// How MQTT payloads are interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayloadFormat {
    #[default]
    Auto,
    Json,
    String,
    Bytes,
}

/// TLS material for `mqtts://` endpoints. Presenting both `cert_file` and
/// `key_file` enables mutual TLS.
#[derive(Debug, Clone, Deserialize)]
pub struct MqttTlsOptions {
    pub ca_file: PathBuf,
    #[serde(default)]
    pub cert_file: Option<PathBuf>,
    #[serde(default)]
    pub key_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ModbusSourceOptions {
    /// Slave / unit address.
    pub unit_id: u8,
    pub poll_interval_ms: u64,
    pub timeout_ms: u64,
    /// Word order for 32-bit values split across two registers.
    pub word_order: WordOrder,
    pub registers: Vec<RegisterBlock>,
}

impl Default for ModbusSourceOptions {
    fn default() -> Self {
        Self {
            unit_id: 1,
            poll_interval_ms: 1000,
            timeout_ms: 3000,
            word_order: WordOrder::default(),
            registers: vec![RegisterBlock {
                reg_type: RegisterType::Holding,
                address: 0,
                count: 10,
                name: None,
                scale: 1.0,
                offset: 0.0,
                data_type: DataType::Uint16,
            }],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WordOrder {
    #[default]
    Big,
    Little,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegisterType {
    Holding,
    Input,
    Coil,
    Discrete,
}

impl RegisterType {
    pub fn is_bit(self) -> bool {
        matches!(self, Self::Coil | Self::Discrete)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Int16,
    #[default]
    Uint16,
    Int32,
    Uint32,
    Float32,
    Bool,
}

impl DataType {
    /// Registers consumed per decoded value.
    pub fn width(self) -> u16 {
        match self {
            Self::Int16 | Self::Uint16 | Self::Bool => 1,
            Self::Int32 | Self::Uint32 | Self::Float32 => 2,
        }
    }
}

/// One polled block of registers.
#[derive(Debug, Clone, Deserialize)]
pub struct RegisterBlock {
    #[serde(rename = "type")]
    pub reg_type: RegisterType,
    pub address: u16,
    #[serde(default = "default_count")]
    pub count: u16,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default = "default_scale")]
    pub scale: f64,
    #[serde(default)]
    pub offset: f64,
    #[serde(default)]
    pub data_type: DataType,
}

impl RegisterBlock {
    pub fn label(&self) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| format!("{}_reg", type_name(self.reg_type)))
    }
}

fn type_name(t: RegisterType) -> &'static str {
    match t {
        RegisterType::Holding => "holding",
        RegisterType::Input => "input",
        RegisterType::Coil => "coil",
        RegisterType::Discrete => "discrete",
    }
}

/// Sink-side configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ZerobusConfig {
    pub enabled: bool,
    pub workspace_host: String,
    pub zerobus_endpoint: String,
    /// Derived from `zerobus_endpoint` when absent.
    pub workspace_id: Option<String>,
    pub auth: AuthConfig,
    pub target: Option<TargetConfig>,
    pub batch: BatchConfig,
    pub stream: StreamConfig,
    pub circuit_breaker: BreakerConfig,
    /// Optional egress rate cap in records per second.
    pub max_send_rps: Option<f64>,
}

impl ZerobusConfig {
    /// `<workspace_id>` from `<workspace_id>.zerobus.<region>...` unless set.
    pub fn workspace_id(&self) -> Option<String> {
        if let Some(id) = &self.workspace_id {
            if !id.trim().is_empty() {
                return Some(id.trim().to_string());
            }
        }
        let derived = self.zerobus_endpoint.split('.').next()?.trim();
        if derived.is_empty() {
            None
        } else {
            Some(derived.to_string())
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub client_id: Option<String>,
    pub client_id_env: Option<String>,
    pub client_secret: Option<String>,
    pub client_secret_env: Option<String>,
    pub scope: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            client_id: None,
            client_id_env: None,
            client_secret: None,
            client_secret_env: None,
            scope: "all-apis".to_string(),
        }
    }
}

impl AuthConfig {
    fn resolve_one(
        direct: &Option<String>,
        env_key: &Option<String>,
        what: &str,
    ) -> Result<String, ConfigError> {
        if let Some(v) = direct {
            if !v.trim().is_empty() {
                return Ok(v.trim().to_string());
            }
        }
        if let Some(name) = env_key {
            if !name.trim().is_empty() {
                return std::env::var(name.trim()).map_err(|_| {
                    ConfigError::Invalid(format!(
                        "credential missing: {what} env var `{}` is not set",
                        name.trim()
                    ))
                });
            }
        }
        Err(ConfigError::Invalid(format!(
            "credential missing: set zerobus.auth.{what} or zerobus.auth.{what}_env"
        )))
    }

    pub fn resolve_client_id(&self) -> Result<String, ConfigError> {
        Self::resolve_one(&self.client_id, &self.client_id_env, "client_id")
    }

    pub fn resolve_client_secret(&self) -> Result<String, ConfigError> {
        Self::resolve_one(&self.client_secret, &self.client_secret_env, "client_secret")
    }
}

/// The `(catalog, schema, table)` the stream is bound to.
#[derive(Debug, Clone, Deserialize)]
pub struct TargetConfig {
    pub catalog: String,
    pub schema: String,
    pub table: String,
}

impl TargetConfig {
    pub fn table_name(&self) -> String {
        format!("{}.{}.{}", self.catalog, self.schema, self.table)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    pub max_records: usize,
    pub timeout_seconds: f64,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self { max_records: 1000, timeout_seconds: 5.0 }
    }
}

impl BatchConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs_f64(self.timeout_seconds.max(0.0))
    }
}

/// Options carried through to the sink stream.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    pub record_type: RecordType,
    pub max_inflight_records: usize,
    pub flush_timeout_ms: u64,
    pub server_lack_of_ack_timeout_ms: u64,
    pub recovery: bool,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            record_type: RecordType::Json,
            max_inflight_records: 1000,
            flush_timeout_ms: 60_000,
            server_lack_of_ack_timeout_ms: 60_000,
            recovery: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RecordType {
    #[default]
    Json,
    Protobuf,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub cooldown_seconds: f64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self { failure_threshold: 5, cooldown_seconds: 30.0 }
    }
}

impl BreakerConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs_f64(self.cooldown_seconds.max(0.0))
    }
}

/// Backpressure tiers.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct BackpressureConfig {
    pub memory_queue: MemoryQueueConfig,
    pub disk_spool: DiskSpoolConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MemoryQueueConfig {
    pub max_size: usize,
    pub drop_policy: DropPolicy,
}

impl Default for MemoryQueueConfig {
    fn default() -> Self {
        Self { max_size: 10_000, drop_policy: DropPolicy::Oldest }
    }
}

/// What happens to a record when both tiers are saturated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DropPolicy {
    /// Evict the oldest memory record, insert the incoming one.
    #[default]
    Oldest,
    /// Reject the incoming record.
    Newest,
    /// Hard error back to the producer.
    Reject,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DiskSpoolConfig {
    pub enabled: bool,
    pub path: PathBuf,
    pub max_size_mb: u64,
    /// Kept for config compatibility; the spool always encrypts.
    pub encryption: bool,
}

impl Default for DiskSpoolConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: PathBuf::from("spool"),
            max_size_mb: 1000,
            encryption: true,
        }
    }
}

impl DiskSpoolConfig {
    pub fn max_bytes(&self) -> u64 {
        self.max_size_mb.saturating_mul(1024 * 1024)
    }
}

/// Supervisor reconnection tuning.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    #[serde(with = "humantime_serde")]
    pub initial_delay: Duration,
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
        }
    }
}

impl ReconnectConfig {
    pub fn policy(&self) -> ReconnectPolicy {
        ReconnectPolicy::new(self.initial_delay, self.max_delay)
    }
}

fn default_true() -> bool {
    true
}

fn default_count() -> u16 {
    1
}

fn default_scale() -> f64 {
    1.0
}

/// Load, substitute, parse and validate a config file.
pub fn load_file(path: &Path, creds: &dyn CredentialStore) -> Result<BridgeConfig, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
        path: path.display().to_string(),
        source: e,
    })?;
    parse(&raw, creds)
}

/// Parse and validate a config document from a string.
pub fn parse(raw: &str, creds: &dyn CredentialStore) -> Result<BridgeConfig, ConfigError> {
    let substituted = substitute(raw, creds)?;
    let cfg: BridgeConfig = serde_yaml::from_str(&substituted)?;
    cfg.validate()?;
    Ok(cfg)
}

/// Resolve `${env:NAME}` and `${credential:key}` placeholders in raw text.
pub fn substitute(raw: &str, creds: &dyn CredentialStore) -> Result<String, ConfigError> {
    let mut out = String::with_capacity(raw.len());
    let mut rest = raw;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let tail = &rest[start + 2..];
        let end = tail.find('}').ok_or_else(|| ConfigError::Unresolved {
            placeholder: rest[start..].chars().take(24).collect(),
            reason: "unterminated placeholder".to_string(),
        })?;
        let inner = &tail[..end];
        let resolved = if let Some(name) = inner.strip_prefix("env:") {
            std::env::var(name.trim()).map_err(|_| ConfigError::Unresolved {
                placeholder: format!("${{{inner}}}"),
                reason: format!("environment variable `{}` is not set", name.trim()),
            })?
        } else if let Some(key) = inner.strip_prefix("credential:") {
            creds.get(key.trim()).map_err(|e| ConfigError::Unresolved {
                placeholder: format!("${{{inner}}}"),
                reason: e.to_string(),
            })?
        } else {
            return Err(ConfigError::Unresolved {
                placeholder: format!("${{{inner}}}"),
                reason: "unknown scheme (expected env: or credential:)".to_string(),
            });
        };
        out.push_str(&resolved);
        rest = &tail[end + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

impl BridgeConfig {
    /// Startup validation; any error here aborts the process.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = std::collections::HashSet::new();
        for source in &self.sources {
            let name = source.name.trim();
            if name.is_empty() {
                return Err(ConfigError::Invalid("source name must not be empty".into()));
            }
            if !seen.insert(name.to_string()) {
                return Err(ConfigError::Invalid(format!("duplicate source name `{name}`")));
            }
            source.validate()?;
        }

        if self.backpressure.memory_queue.max_size == 0 {
            return Err(ConfigError::Invalid(
                "backpressure.memory_queue.max_size must be > 0".into(),
            ));
        }
        let spool = &self.backpressure.disk_spool;
        if spool.enabled && spool.path.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("backpressure.disk_spool.path must not be empty".into()));
        }

        if self.zerobus.enabled {
            let z = &self.zerobus;
            if z.workspace_host.trim().is_empty() {
                return Err(ConfigError::Invalid("zerobus.workspace_host is required".into()));
            }
            if z.zerobus_endpoint.trim().is_empty() {
                return Err(ConfigError::Invalid("zerobus.zerobus_endpoint is required".into()));
            }
            let target = z.target.as_ref().ok_or_else(|| {
                ConfigError::Invalid("zerobus.target {catalog, schema, table} is required".into())
            })?;
            for (field, value) in [
                ("catalog", &target.catalog),
                ("schema", &target.schema),
                ("table", &target.table),
            ] {
                if value.trim().is_empty() {
                    return Err(ConfigError::Invalid(format!("zerobus.target.{field} is required")));
                }
            }
            z.auth.resolve_client_id()?;
            z.auth.resolve_client_secret()?;
            if z.batch.max_records == 0 {
                return Err(ConfigError::Invalid("zerobus.batch.max_records must be > 0".into()));
            }
            if z.batch.timeout_seconds <= 0.0 {
                return Err(ConfigError::Invalid("zerobus.batch.timeout_seconds must be > 0".into()));
            }
            if z.circuit_breaker.failure_threshold == 0 {
                return Err(ConfigError::Invalid(
                    "zerobus.circuit_breaker.failure_threshold must be > 0".into(),
                ));
            }
            if z.stream.record_type == RecordType::Protobuf {
                return Err(ConfigError::Invalid(
                    "zerobus.stream.record_type PROTOBUF requires external descriptors; use JSON".into(),
                ));
            }
            if z.stream.max_inflight_records == 0 {
                return Err(ConfigError::Invalid(
                    "zerobus.stream.max_inflight_records must be > 0".into(),
                ));
            }
            if let Some(rps) = z.max_send_rps {
                if rps <= 0.0 {
                    return Err(ConfigError::Invalid("zerobus.max_send_rps must be > 0".into()));
                }
            }
        }
        Ok(())
    }
}

impl SourceConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.endpoint.trim().is_empty() {
            return Err(ConfigError::Invalid(format!(
                "source `{}`: endpoint must not be empty",
                self.name
            )));
        }
        match &self.protocol {
            ProtocolConfig::Opcua(_) => {
                if !self.endpoint.starts_with("opc.tcp://") {
                    return Err(ConfigError::Invalid(format!(
                        "source `{}`: OPC-UA endpoint must start with opc.tcp://",
                        self.name
                    )));
                }
                let parsed = url::Url::parse(&self.endpoint).map_err(|e| {
                    ConfigError::Invalid(format!("source `{}`: bad endpoint: {e}", self.name))
                })?;
                if parsed.host_str().is_none() {
                    return Err(ConfigError::Invalid(format!(
                        "source `{}`: endpoint has no host",
                        self.name
                    )));
                }
            }
            ProtocolConfig::Mqtt(opts) => {
                if self.endpoint.contains("://") {
                    let parsed = url::Url::parse(&self.endpoint).map_err(|e| {
                        ConfigError::Invalid(format!("source `{}`: bad endpoint: {e}", self.name))
                    })?;
                    if !matches!(parsed.scheme(), "mqtt" | "mqtts") {
                        return Err(ConfigError::Invalid(format!(
                            "source `{}`: MQTT endpoint scheme must be mqtt:// or mqtts://",
                            self.name
                        )));
                    }
                }
                if opts.qos > 2 {
                    return Err(ConfigError::Invalid(format!(
                        "source `{}`: qos must be 0, 1 or 2",
                        self.name
                    )));
                }
                if opts.topics.is_empty() {
                    return Err(ConfigError::Invalid(format!(
                        "source `{}`: at least one topic filter is required",
                        self.name
                    )));
                }
                if let Some(tls) = &opts.tls {
                    if tls.cert_file.is_some() != tls.key_file.is_some() {
                        return Err(ConfigError::Invalid(format!(
                            "source `{}`: mTLS needs both cert_file and key_file",
                            self.name
                        )));
                    }
                }
            }
            ProtocolConfig::Modbus(opts) => {
                if opts.registers.is_empty() {
                    return Err(ConfigError::Invalid(format!(
                        "source `{}`: at least one register block is required",
                        self.name
                    )));
                }
                for block in &opts.registers {
                    let cap: u16 = if block.reg_type.is_bit() { 2000 } else { 125 };
                    if block.count == 0 || block.count > cap {
                        return Err(ConfigError::Invalid(format!(
                            "source `{}`: register count {} out of range (1..={cap})",
                            self.name, block.count
                        )));
                    }
                    if !block.reg_type.is_bit() && block.count % block.data_type.width() != 0 {
                        return Err(ConfigError::Invalid(format!(
                            "source `{}`: count {} is not a multiple of the data type width",
                            self.name, block.count
                        )));
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::EnvCredentialStore;

    const MINIMAL: &str = r#"
sources:
  - name: line1
    protocol: mqtt
    endpoint: mqtt://broker:1883
    topics: ["plant/+/temp"]
backpressure:
  memory_queue:
    max_size: 10
  disk_spool:
    enabled: false
"#;

    #[test]
    fn minimal_document_parses_with_defaults() {
        let cfg = parse(MINIMAL, &EnvCredentialStore).unwrap();
        assert_eq!(cfg.sources.len(), 1);
        assert_eq!(cfg.sources[0].kind(), ProtocolKind::Mqtt);
        assert!(cfg.sources[0].enabled);
        assert!(!cfg.zerobus.enabled);
        assert_eq!(cfg.backpressure.memory_queue.max_size, 10);
        assert_eq!(cfg.backpressure.memory_queue.drop_policy, DropPolicy::Oldest);
        match &cfg.sources[0].protocol {
            ProtocolConfig::Mqtt(m) => {
                assert_eq!(m.qos, 1);
                assert_eq!(m.payload_format, PayloadFormat::Auto);
                assert_eq!(m.value_field, "value");
            }
            other => panic!("wrong protocol: {other:?}"),
        }
    }

    #[test]
    fn env_substitution_resolves_placeholders() {
        std::env::set_var("ZB_TEST_BROKER", "mqtt://sub:1883");
        let doc = MINIMAL.replace("mqtt://broker:1883", "${env:ZB_TEST_BROKER}");
        let cfg = parse(&doc, &EnvCredentialStore).unwrap();
        assert_eq!(cfg.sources[0].endpoint, "mqtt://sub:1883");
    }

    #[test]
    fn unknown_placeholder_scheme_is_rejected() {
        let err = substitute("a: ${vault:x}", &EnvCredentialStore).unwrap_err();
        assert!(err.to_string().contains("unknown scheme"));
    }

    #[test]
    fn missing_env_placeholder_is_rejected() {
        let err = substitute("a: ${env:ZB_TEST_DEFINITELY_UNSET}", &EnvCredentialStore).unwrap_err();
        assert!(err.to_string().contains("not set"));
    }

    #[test]
    fn duplicate_source_names_are_rejected() {
        let doc = r#"
sources:
  - name: a
    protocol: mqtt
    endpoint: mqtt://x:1883
  - name: a
    protocol: mqtt
    endpoint: mqtt://y:1883
"#;
        let err = parse(doc, &EnvCredentialStore).unwrap_err();
        assert!(err.to_string().contains("duplicate source name"));
    }

    #[test]
    fn enabled_sink_requires_target_and_credentials() {
        let doc = r#"
zerobus:
  enabled: true
  workspace_host: https://dbc-x.cloud.databricks.com
  zerobus_endpoint: 123.zerobus.us-east-1.cloud.databricks.com
"#;
        let err = parse(doc, &EnvCredentialStore).unwrap_err();
        assert!(err.to_string().contains("zerobus.target"));
    }

    #[test]
    fn protobuf_record_type_is_rejected() {
        std::env::set_var("ZB_TEST_ID", "svc-principal");
        std::env::set_var("ZB_TEST_SECRET", "s3cr3t-value-long");
        let doc = r#"
zerobus:
  enabled: true
  workspace_host: https://dbc-x.cloud.databricks.com
  zerobus_endpoint: 123.zerobus.us-east-1.cloud.databricks.com
  auth:
    client_id_env: ZB_TEST_ID
    client_secret_env: ZB_TEST_SECRET
  target:
    catalog: main
    schema: iot
    table: telemetry
  stream:
    record_type: PROTOBUF
"#;
        let err = parse(doc, &EnvCredentialStore).unwrap_err();
        assert!(err.to_string().contains("PROTOBUF"));
    }

    #[test]
    fn workspace_id_derives_from_endpoint() {
        let z = ZerobusConfig {
            zerobus_endpoint: "123456.zerobus.us-east-1.cloud.databricks.com".into(),
            ..ZerobusConfig::default()
        };
        assert_eq!(z.workspace_id().as_deref(), Some("123456"));
    }

    #[test]
    fn modbus_register_bounds_are_enforced() {
        let doc = r#"
sources:
  - name: plc
    protocol: modbus
    endpoint: modbus://plc:502
    registers:
      - { type: holding, address: 0, count: 500 }
"#;
        let err = parse(doc, &EnvCredentialStore).unwrap_err();
        assert!(err.to_string().contains("out of range"));
    }

    #[test]
    fn odd_count_for_wide_types_is_rejected() {
        let doc = r#"
sources:
  - name: plc
    protocol: modbus
    endpoint: modbus://plc:502
    registers:
      - { type: holding, address: 0, count: 3, data_type: float32 }
"#;
        let err = parse(doc, &EnvCredentialStore).unwrap_err();
        assert!(err.to_string().contains("multiple"));
    }

    #[test]
    fn reconnect_durations_use_humantime() {
        let doc = r#"
reconnect:
  initial_delay: 250ms
  max_delay: 2m
"#;
        let cfg = parse(doc, &EnvCredentialStore).unwrap();
        assert_eq!(cfg.reconnect.initial_delay, Duration::from_millis(250));
        assert_eq!(cfg.reconnect.max_delay, Duration::from_secs(120));
    }
}
