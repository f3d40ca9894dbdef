use std::fmt;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use tlm_mapping::{MappingSpec, MappingTable};
use tlm_schemas::{is_sql_identifier, TimeField};

/// Topic subscribed to when neither YAML, env nor flags name one.
pub const DEFAULT_TOPIC: &str = "#";

/// Messages between two progress lines on stdout.
pub const DEFAULT_PROGRESS_EVERY: u64 = 350;

/// Non-empty, trimmed value of an environment variable.
pub fn env_var(name: &str) -> Option<String> {
    match std::env::var(name) {
        Ok(v) if !v.trim().is_empty() => Some(v.trim().to_string()),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DatabaseConfig {
    pub url: String,
    pub store_tablename: String,
    /// Columns identifying a row for insert-or-update.
    pub key_fields: Vec<String>,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            store_tablename: String::new(),
            key_fields: vec!["time".to_string()],
        }
    }
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MqttConfig {
    /// `host:port`, optionally prefixed with `tcp://` or `mqtt://`.
    pub server: String,
    pub topic: String,
    pub username: String,
    pub password: String,
    pub qos: u8,
    /// Generated per process when empty.
    pub client_id: String,
    pub max_tries: u32,
    pub retry_delay_secs: u64,
    pub keep_alive_secs: u64,
    /// Reconnect if the bus is silent this long. 0 disables the check.
    pub liveness_timeout_secs: u64,
    pub progress_every: u64,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            server: String::new(),
            topic: String::new(),
            username: String::new(),
            password: String::new(),
            qos: 0,
            client_id: String::new(),
            max_tries: 10,
            retry_delay_secs: 10,
            keep_alive_secs: 30,
            liveness_timeout_secs: 120,
            progress_every: DEFAULT_PROGRESS_EVERY,
        }
    }
}

impl fmt::Debug for MqttConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MqttConfig")
            .field("server", &self.server)
            .field("topic", &self.topic)
            .field("username", &self.username)
            .field(
                "password",
                &(!self.password.is_empty()).then_some("<REDACTED>"),
            )
            .field("qos", &self.qos)
            .field("client_id", &self.client_id)
            .field("max_tries", &self.max_tries)
            .field("retry_delay_secs", &self.retry_delay_secs)
            .field("keep_alive_secs", &self.keep_alive_secs)
            .field("liveness_timeout_secs", &self.liveness_timeout_secs)
            .field("progress_every", &self.progress_every)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackfillMode {
    Disabled,
    ReplaySource,
    ReplayDestination,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReconcileConfig {
    pub time_field: TimeField,
    /// Defaults depend on `time_field`, see [`ReconcileConfig::tolerance_secs`].
    pub tolerance_secs: Option<u64>,
    pub report_every: u32,
    pub report_synced: bool,
    /// Defaults to `replay_source` for event time, `disabled` for insertion time.
    pub backfill: Option<BackfillMode>,
    pub backfill_on_drain: bool,
    pub validate_order: bool,
    pub channel_capacity: usize,
    /// Caller SQL whose rows are `(inserted_on, time, id)` in that order.
    pub raw_query: Option<String>,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            time_field: TimeField::Event,
            tolerance_secs: None,
            report_every: 25,
            report_synced: false,
            backfill: None,
            backfill_on_drain: true,
            validate_order: true,
            channel_capacity: 1024,
            raw_query: None,
        }
    }
}

impl ReconcileConfig {
    pub fn tolerance_secs(&self) -> u64 {
        self.tolerance_secs.unwrap_or(match self.time_field {
            TimeField::Event => 120,
            TimeField::Inserted => 60,
        })
    }

    /// Raw-query rows carry no readings, so a raw query never replays.
    pub fn backfill(&self) -> BackfillMode {
        if self.raw_query.is_some() {
            return self.backfill.unwrap_or(BackfillMode::Disabled);
        }
        self.backfill.unwrap_or(match self.time_field {
            TimeField::Event => BackfillMode::ReplaySource,
            TimeField::Inserted => BackfillMode::Disabled,
        })
    }
}

// ---------------------------------------------------------------------------
// Whole document
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TlmConfig {
    pub database: DatabaseConfig,
    pub mqtt: MqttConfig,
    pub mapping: MappingSpec,
    pub reconcile: ReconcileConfig,
}

impl TlmConfig {
    /// Typed view of a merged document. Checks everything that can be
    /// checked without the environment.
    pub fn from_json(config_json: &Value) -> Result<Self> {
        let cfg: TlmConfig = serde_json::from_value(config_json.clone())
            .context("config does not match the expected schema")?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<()> {
        MappingTable::compile(&self.mapping).context("invalid mapping")?;
        for key in &self.database.key_fields {
            if !is_sql_identifier(key) {
                bail!("database.keyFields: '{key}' is not a valid column name");
            }
        }
        if !self.database.store_tablename.is_empty()
            && !is_sql_identifier(&self.database.store_tablename)
        {
            bail!(
                "database.storeTablename: '{}' is not a valid table name",
                self.database.store_tablename
            );
        }
        if self.mqtt.qos > 2 {
            bail!("mqtt.qos must be 0, 1 or 2, got {}", self.mqtt.qos);
        }
        if self.reconcile.raw_query.is_some()
            && self.reconcile.backfill() != BackfillMode::Disabled
        {
            bail!(
                "reconcile.rawQuery rows carry no payload; reconcile.backfill must be disabled"
            );
        }
        if self.reconcile.channel_capacity == 0 {
            bail!("reconcile.channelCapacity must be at least 1");
        }
        Ok(())
    }

    /// Apply environment overrides. `lookup` returns a non-empty value or
    /// `None`; pass [`env_var`] for the process environment.
    pub fn apply_env(&mut self, lookup: &dyn Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(v) = lookup("MQTT_STORE_URL") {
            self.database.url = v;
        }
        if let Some(v) = lookup("MQTT_STORE_TABLENAME") {
            if !is_sql_identifier(&v) {
                bail!("MQTT_STORE_TABLENAME is not a valid table name");
            }
            self.database.store_tablename = v;
        }
        if let Some(v) = lookup("MQTT_TOPIC") {
            self.mqtt.topic = v;
        }
        if let Some(v) = lookup("MQTT_TOPIC_URL") {
            self.mqtt.server = v;
        }
        if let Some(v) = lookup("MQTT_TOPIC_USERNAME") {
            self.mqtt.username = v;
        }
        if let Some(v) = lookup("MQTT_TOPIC_PASSWORD") {
            self.mqtt.password = v;
        }
        self.fill_defaults();
        Ok(())
    }

    /// Defaults that depend on other layers having been applied.
    pub fn fill_defaults(&mut self) {
        if self.mqtt.topic.trim().is_empty() {
            self.mqtt.topic = DEFAULT_TOPIC.to_string();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn defaults_from_empty_document() {
        let cfg = TlmConfig::from_json(&serde_json::json!({})).unwrap();
        assert_eq!(cfg.database.key_fields, vec!["time".to_string()]);
        assert_eq!(cfg.mqtt.progress_every, 350);
        assert_eq!(cfg.reconcile.tolerance_secs(), 120);
        assert_eq!(cfg.reconcile.backfill(), BackfillMode::ReplaySource);
        assert_eq!(cfg.mapping.timezone, "Local");
    }

    #[test]
    fn inserted_time_changes_defaults() {
        let cfg = TlmConfig::from_json(&serde_json::json!({
            "reconcile": { "timeField": "inserted" }
        }))
        .unwrap();
        assert_eq!(cfg.reconcile.tolerance_secs(), 60);
        assert_eq!(cfg.reconcile.backfill(), BackfillMode::Disabled);
    }

    #[test]
    fn raw_query_never_replays() {
        let cfg = TlmConfig::from_json(&serde_json::json!({
            "reconcile": { "rawQuery": "select inserted_on, time, id from home order by time" }
        }))
        .unwrap();
        assert_eq!(cfg.reconcile.backfill(), BackfillMode::Disabled);

        let err = TlmConfig::from_json(&serde_json::json!({
            "reconcile": {
                "rawQuery": "select inserted_on, time, id from home order by time",
                "backfill": "replay_source"
            }
        }))
        .unwrap_err();
        assert!(err.to_string().contains("rawQuery"));
    }

    #[test]
    fn env_overrides_yaml_and_topic_defaults() {
        let mut cfg = TlmConfig::from_json(&serde_json::json!({
            "database": { "url": "postgres://yaml-host/db", "storeTablename": "home" }
        }))
        .unwrap();
        cfg.apply_env(&lookup_from(&[("MQTT_STORE_URL", "postgres://env-host/db")]))
            .unwrap();
        assert_eq!(cfg.database.url, "postgres://env-host/db");
        assert_eq!(cfg.database.store_tablename, "home");
        assert_eq!(cfg.mqtt.topic, "#");
    }

    #[test]
    fn rejects_bad_identifiers_and_qos() {
        let err = TlmConfig::from_json(&serde_json::json!({
            "database": { "storeTablename": "home; drop" }
        }))
        .unwrap_err();
        assert!(err.to_string().contains("storeTablename"));

        let err = TlmConfig::from_json(&serde_json::json!({ "mqtt": { "qos": 3 } })).unwrap_err();
        assert!(err.to_string().contains("qos"));

        let mut cfg = TlmConfig::default();
        let err = cfg
            .apply_env(&lookup_from(&[("MQTT_STORE_TABLENAME", "a-b")]))
            .unwrap_err();
        assert!(err.to_string().contains("MQTT_STORE_TABLENAME"));
    }

    #[test]
    fn unknown_mapping_type_fails_at_load() {
        let err = TlmConfig::from_json(&serde_json::json!({
            "mapping": { "fields": [ { "source": "a", "destination": "a", "type": "uint8" } ] }
        }))
        .unwrap_err();
        assert!(format!("{err:#}").contains("unknown field type 'uint8'"));
    }

    #[test]
    fn debug_redacts_broker_password() {
        let mut cfg = TlmConfig::default();
        cfg.mqtt.password = "hunter22".to_string();
        let dbg = format!("{cfg:?}");
        assert!(!dbg.contains("hunter22"));
        assert!(dbg.contains("<REDACTED>"));
    }
}
