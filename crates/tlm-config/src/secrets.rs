//! Store credential resolution.
//!
//! Called once at startup. The result is passed to the storage layer; nothing
//! else reads `MQTT_STORE_*` / `MQTT_DEST_*`.
//!
//! - Primary store: `database.url` (or `MQTT_STORE_URL`) is required in
//!   every mode.
//! - Destination store: `MQTT_DEST_URL` is required in `Reconcile` mode and
//!   ignored otherwise.
//! - User: from the URL, else `MQTT_STORE_USER`, else `admin`.
//! - Password: from the URL, else `MQTT_STORE_PASS` / `MQTT_DEST_PASS`.
//! - Errors name the variable, never its value. `Debug` redacts passwords.

use anyhow::{bail, Result};
use percent_encoding::percent_decode_str;
use url::Url;

use crate::{env_var, RunMode, TlmConfig};

pub const DEFAULT_STORE_USER: &str = "admin";

/// One Postgres store to connect to.
#[derive(Clone, PartialEq, Eq)]
pub struct StoreTarget {
    /// Connection URL with any credentials removed.
    pub url: String,
    pub user: String,
    pub password: Option<String>,
    pub table: String,
}

impl std::fmt::Debug for StoreTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreTarget")
            .field("url", &self.url)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "<REDACTED>"))
            .field("table", &self.table)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedStores {
    pub primary: StoreTarget,
    /// Present exactly in `Reconcile` mode.
    pub destination: Option<StoreTarget>,
}

/// Resolve against the process environment.
pub fn resolve_store_secrets(cfg: &TlmConfig, mode: RunMode) -> Result<ResolvedStores> {
    resolve_store_secrets_with(cfg, mode, &env_var)
}

pub fn resolve_store_secrets_with(
    cfg: &TlmConfig,
    mode: RunMode,
    lookup: &dyn Fn(&str) -> Option<String>,
) -> Result<ResolvedStores> {
    let table = cfg.database.store_tablename.trim();
    if table.is_empty() {
        bail!(
            "STORE_TABLE_MISSING (mode={}): set MQTT_STORE_TABLENAME or database.storeTablename",
            mode.as_str()
        );
    }

    let primary_url = cfg.database.url.trim();
    if primary_url.is_empty() {
        bail!(
            "STORE_URL_MISSING (mode={}): set MQTT_STORE_URL or database.url",
            mode.as_str()
        );
    }
    let primary = target(primary_url, "MQTT_STORE_URL", "MQTT_STORE_PASS", table, lookup)?;

    let destination = match mode {
        RunMode::Ingest => None,
        RunMode::Reconcile => {
            let Some(dest_url) = lookup("MQTT_DEST_URL") else {
                bail!(
                    "STORE_URL_MISSING (mode={}): destination store MQTT_DEST_URL is not set",
                    mode.as_str()
                );
            };
            Some(target(&dest_url, "MQTT_DEST_URL", "MQTT_DEST_PASS", table, lookup)?)
        }
    };

    Ok(ResolvedStores {
        primary,
        destination,
    })
}

fn target(
    raw_url: &str,
    url_var: &str,
    pass_var: &str,
    table: &str,
    lookup: &dyn Fn(&str) -> Option<String>,
) -> Result<StoreTarget> {
    // The parse error may echo the input, so it is not chained.
    let mut url = match Url::parse(raw_url) {
        Ok(u) => u,
        Err(_) => bail!("STORE_URL_INVALID: {url_var} is not a valid URL"),
    };

    let user = match url.username() {
        "" => None,
        u => Some(decode_userinfo(u, url_var, "user")?),
    }
    .or_else(|| lookup("MQTT_STORE_USER"))
    .unwrap_or_else(|| DEFAULT_STORE_USER.to_string());
    let password = match url.password() {
        None | Some("") => None,
        Some(p) => Some(decode_userinfo(p, url_var, "password")?),
    }
    .or_else(|| lookup(pass_var));

    if url.set_username("").is_err() || url.set_password(None).is_err() {
        bail!("STORE_URL_INVALID: {url_var} cannot carry credentials");
    }

    Ok(StoreTarget {
        url: url.to_string(),
        user,
        password,
        table: table.to_string(),
    })
}

/// `Url` keeps userinfo percent-encoded; the driver wants the raw text.
fn decode_userinfo(raw: &str, url_var: &str, part: &str) -> Result<String> {
    match percent_decode_str(raw).decode_utf8() {
        Ok(v) => Ok(v.into_owned()),
        Err(_) => bail!("STORE_URL_INVALID: {url_var} {part} is not valid UTF-8 once decoded"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credentials_are_split_out_of_the_url() {
        let mut cfg = TlmConfig::default();
        cfg.database.url = "postgres://meter:s3cret@db:5432/telemetry".to_string();
        cfg.database.store_tablename = "home".to_string();

        let stores = resolve_store_secrets_with(&cfg, RunMode::Ingest, &|_| None).unwrap();
        assert_eq!(stores.primary.user, "meter");
        assert_eq!(stores.primary.password.as_deref(), Some("s3cret"));
        assert!(!stores.primary.url.contains("s3cret"));
        assert!(stores.destination.is_none());
    }

    #[test]
    fn encoded_credentials_are_decoded() {
        let mut cfg = TlmConfig::default();
        cfg.database.url = "postgres://al%20ice:p%40ss@db:5432/tlm".to_string();
        cfg.database.store_tablename = "home".to_string();

        let stores = resolve_store_secrets_with(&cfg, RunMode::Ingest, &|_| None).unwrap();
        assert_eq!(stores.primary.user, "al ice");
        assert_eq!(stores.primary.password.as_deref(), Some("p@ss"));
        assert!(!stores.primary.url.contains("p%40ss"));
    }

    #[test]
    fn user_falls_back_to_admin() {
        let mut cfg = TlmConfig::default();
        cfg.database.url = "postgres://db:5432/telemetry".to_string();
        cfg.database.store_tablename = "home".to_string();

        let stores = resolve_store_secrets_with(&cfg, RunMode::Ingest, &|_| None).unwrap();
        assert_eq!(stores.primary.user, "admin");
        assert_eq!(stores.primary.password, None);
    }
}
