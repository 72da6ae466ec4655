//! INI configuration loading (spec §6), built on the `config` crate's `FileFormat::Ini`
//! source rather than introducing a dedicated ini-parsing dependency.

use std::path::{Path, PathBuf};

use config::{Config, File, FileFormat};
use serde::Deserialize;

use crate::error::BurError;
use crate::model::{Customer, OffsiteConfig};

const DEFAULT_OFFSITE_RETENTION: usize = 4;

#[derive(Debug, Deserialize, Default)]
struct RawConfig {
    #[serde(rename = "SUPPORT_CONTACT")]
    support_contact: Option<RawSupportContact>,
    #[serde(rename = "GNUPG")]
    gnupg: Option<RawGnupg>,
    #[serde(rename = "OFFSITE_CONN")]
    offsite_conn: Option<RawOffsiteConn>,
    #[serde(rename = "ONSITE_PARAMS")]
    onsite_params: Option<RawOnsiteParams>,
    #[serde(rename = "DELAY")]
    delay: Option<RawDelay>,
}

#[derive(Debug, Deserialize)]
struct RawSupportContact {
    #[serde(rename = "EMAIL_TO")]
    email_to: Option<String>,
    #[serde(rename = "EMAIL_URL")]
    email_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawGnupg {
    #[serde(rename = "GPG_USER_NAME")]
    gpg_user_name: String,
    #[serde(rename = "GPG_USER_EMAIL")]
    gpg_user_email: String,
}

#[derive(Debug, Deserialize)]
struct RawOffsiteConn {
    #[serde(rename = "IP")]
    ip: String,
    #[serde(rename = "USER")]
    user: String,
    #[serde(rename = "BKP_PATH")]
    bkp_path: String,
    #[serde(rename = "BKP_DIR")]
    bkp_dir: String,
    #[serde(rename = "RETENTION")]
    retention: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct RawOnsiteParams {
    #[serde(rename = "BKP_TEMP_FOLDER")]
    bkp_temp_folder: String,
}

#[derive(Debug, Deserialize)]
struct RawDelay {
    #[serde(rename = "BKP_MAX_DELAY")]
    bkp_max_delay: Option<String>,
}

/// Result of parsing the INI config: connection parameters, notification contact, GPG
/// identity, on-site temp root, watchdog delay, and the customer roster.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub offsite: OffsiteConfig,
    pub gpg_user_name: String,
    pub gpg_user_email: String,
    pub email_to: Option<String>,
    pub onsite_tmp_root: PathBuf,
    pub max_delay: Option<std::time::Duration>,
    pub customers: Vec<Customer>,
}

/// Load and validate an INI config file plus its `[CUSTOMER_*]` sections.
pub fn load(path: &Path) -> Result<LoadedConfig, BurError> {
    let settings = Config::builder()
        .add_source(File::new(
            path.to_str().ok_or_else(|| BurError::Config(format!("non-UTF8 config path: {}", path.display())))?,
            FileFormat::Ini,
        ))
        .build()
        .map_err(|e| BurError::Config(e.to_string()))?;

    let raw: RawConfig = settings.clone().try_deserialize().map_err(|e| BurError::Config(e.to_string()))?;

    let gnupg = raw.gnupg.ok_or_else(|| BurError::Config("missing [GNUPG] section".into()))?;
    let offsite_conn = raw
        .offsite_conn
        .ok_or_else(|| BurError::Config("missing [OFFSITE_CONN] section".into()))?;
    let onsite_params = raw
        .onsite_params
        .ok_or_else(|| BurError::Config("missing [ONSITE_PARAMS] section".into()))?;

    let offsite = OffsiteConfig {
        host: offsite_conn.ip,
        user: offsite_conn.user,
        remote_root: offsite_conn.bkp_path,
        folder: offsite_conn.bkp_dir,
        retention_count: offsite_conn.retention.unwrap_or(DEFAULT_OFFSITE_RETENTION),
    };

    let max_delay = raw
        .delay
        .and_then(|d| d.bkp_max_delay)
        .map(|s| parse_delay(&s))
        .transpose()?;

    let customers = load_customers(&settings)?;

    Ok(LoadedConfig {
        offsite,
        gpg_user_name: gnupg.gpg_user_name,
        gpg_user_email: gnupg.gpg_user_email,
        email_to: raw.support_contact.and_then(|c| c.email_to),
        onsite_tmp_root: PathBuf::from(onsite_params.bkp_temp_folder),
        max_delay,
        customers,
    })
}

/// Every `[CUSTOMER_*]` section names a customer whose id is the text after the prefix.
fn load_customers(settings: &Config) -> Result<Vec<Customer>, BurError> {
    let table = settings
        .collect()
        .map_err(|e| BurError::Config(e.to_string()))?;

    let mut customers = Vec::new();
    for (section, value) in table {
        let Some(name) = section.strip_prefix("CUSTOMER_") else {
            continue;
        };
        let table = value.into_table().map_err(|e| BurError::Config(e.to_string()))?;
        let path = table
            .get("CUSTOMER_PATH")
            .ok_or_else(|| BurError::Config(format!("[{section}] missing CUSTOMER_PATH")))?
            .clone()
            .into_string()
            .map_err(|e| BurError::Config(e.to_string()))?;
        customers.push(Customer::new(name, PathBuf::from(path)));
    }
    Ok(customers)
}

/// Parse a `\d+[smh]` duration string, e.g. `"30m"`, matching the `DELAY.BKP_MAX_DELAY` format.
fn parse_delay(raw: &str) -> Result<std::time::Duration, BurError> {
    let raw = raw.trim();
    let (digits, unit) = raw.split_at(raw.len().saturating_sub(1));
    let amount: u64 = digits
        .parse()
        .map_err(|_| BurError::Config(format!("invalid delay '{raw}'")))?;

    let seconds = match unit {
        "s" => amount,
        "m" => amount * 60,
        "h" => amount * 3600,
        _ => return Err(BurError::Config(format!("invalid delay unit in '{raw}'"))),
    };
    Ok(std::time::Duration::from_secs(seconds))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minutes_seconds_and_hours() {
        assert_eq!(parse_delay("30m").unwrap(), std::time::Duration::from_secs(1800));
        assert_eq!(parse_delay("45s").unwrap(), std::time::Duration::from_secs(45));
        assert_eq!(parse_delay("2h").unwrap(), std::time::Duration::from_secs(7200));
    }

    #[test]
    fn rejects_an_unknown_unit() {
        assert!(parse_delay("10x").is_err());
    }

    #[test]
    fn loads_a_minimal_ini_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("bur-offsite.ini");
        std::fs::write(
            &path,
            "\
[GNUPG]
GPG_USER_NAME=Offsite Backup
GPG_USER_EMAIL=offsite@example.com

[OFFSITE_CONN]
IP=archive.example.com
USER=bkpuser
BKP_PATH=/srv/archive
BKP_DIR=bur
RETENTION=4

[ONSITE_PARAMS]
BKP_TEMP_FOLDER=/var/tmp/bur

[CUSTOMER_ACME]
CUSTOMER_PATH=/data/acme
",
        )
        .unwrap();

        let loaded = load(&path).unwrap();
        assert_eq!(loaded.offsite.host, "archive.example.com");
        assert_eq!(loaded.offsite.retention_count, 4);
        assert_eq!(loaded.customers.len(), 1);
        assert_eq!(loaded.customers[0].name, "ACME");
    }
}
