//! scenario_config_layers
//!
//! GREEN when:
//! - Files passed in order are merged with later files winning per leaf.
//! - The config hash is stable across runs and insensitive to key order.
//! - A password literal in YAML (leaf or inside a URL) aborts loading.
//! - The typed view picks up the merged values.

use std::io::Write;

use tlm_config::{load_layered_yaml, load_layered_yaml_from_strings, TlmConfig};

const BASE_YAML: &str = r#"
database:
  url: postgres://admin@localhost:5432/telemetry
  storeTablename: home
mqtt:
  server: localhost:1883
  topic: "tele/#"
  qos: 0
mapping:
  timezone: Europe/Berlin
  fields:
    - { source: Time, destination: time, type: time.Time }
    - { source: eHZ/E_in, destination: total, type: float64 }
"#;

const BASE_YAML_REORDERED: &str = r#"
mqtt:
  qos: 0
  topic: "tele/#"
  server: localhost:1883
mapping:
  fields:
    - { source: Time, destination: time, type: time.Time }
    - { source: eHZ/E_in, destination: total, type: float64 }
  timezone: Europe/Berlin
database:
  storeTablename: home
  url: postgres://admin@localhost:5432/telemetry
"#;

const OVERLAY_YAML: &str = r#"
mqtt:
  qos: 1
reconcile:
  timeField: inserted
"#;

fn write_tmp(contents: &str) -> tempfile::NamedTempFile {
    let mut f = tempfile::NamedTempFile::new().unwrap();
    f.write_all(contents.as_bytes()).unwrap();
    f
}

#[test]
fn files_merge_in_order() {
    let base = write_tmp(BASE_YAML);
    let overlay = write_tmp(OVERLAY_YAML);
    let paths = [
        base.path().to_str().unwrap().to_string(),
        overlay.path().to_str().unwrap().to_string(),
    ];

    let loaded = load_layered_yaml(&paths).unwrap();
    let cfg = TlmConfig::from_json(&loaded.config_json).unwrap();

    assert_eq!(cfg.mqtt.qos, 1, "overlay wins");
    assert_eq!(cfg.mqtt.topic, "tele/#", "untouched leaves survive");
    assert_eq!(cfg.database.store_tablename, "home");
    assert_eq!(cfg.reconcile.tolerance_secs(), 60);
    assert_eq!(cfg.mapping.fields.len(), 2);
}

#[test]
fn hash_is_stable_and_order_insensitive() {
    let a = load_layered_yaml_from_strings(&[BASE_YAML]).unwrap();
    let b = load_layered_yaml_from_strings(&[BASE_YAML]).unwrap();
    let c = load_layered_yaml_from_strings(&[BASE_YAML_REORDERED]).unwrap();
    assert_eq!(a.config_hash, b.config_hash);
    assert_eq!(a.config_hash, c.config_hash);
    assert_eq!(a.canonical_json, c.canonical_json);

    let d = load_layered_yaml_from_strings(&[BASE_YAML, OVERLAY_YAML]).unwrap();
    assert_ne!(a.config_hash, d.config_hash);
}

#[test]
fn missing_file_names_the_path() {
    let err = load_layered_yaml(&["/definitely/not/here.yaml"]).unwrap_err();
    assert!(err.to_string().contains("/definitely/not/here.yaml"));
}

#[test]
fn password_literals_are_rejected() {
    let leaf = "mqtt:\n  password: hunter22\n";
    let err = load_layered_yaml_from_strings(&[leaf]).unwrap_err();
    let msg = err.to_string();
    assert!(msg.contains("CONFIG_SECRET_DETECTED"));
    assert!(msg.contains("/mqtt/password"));
    assert!(!msg.contains("hunter22"), "value must never be echoed");

    let in_url = "database:\n  url: postgres://admin:hunter22@db/telemetry\n";
    let err = load_layered_yaml_from_strings(&[in_url]).unwrap_err();
    assert!(err.to_string().contains("/database/url"));
    assert!(!err.to_string().contains("hunter22"));

    let empty = "mqtt:\n  password: \"\"\n";
    assert!(load_layered_yaml_from_strings(&[empty]).is_ok());
}
