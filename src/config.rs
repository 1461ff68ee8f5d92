//! Configuration for the Swift adapter and for the emulator server.
//!
//! [`SwiftConfig`] is what a storage-tier caller hands to
//! [`Container::from_config`](crate::services::container::Container::from_config):
//! it comes from YAML or from the usual `OS_*` OpenStack environment.
//! [`ServerConfig`] combines CLI arguments and environment variables for the
//! `serve` subcommand.

use crate::{
    connection::swift::ConnectOptions,
    errors::{Error, Result},
    services::container::ContainerSettings,
};
use anyhow::Context;
use clap::Args;
use serde::{Deserialize, Deserializer, Serialize};
use std::{env, time::Duration};

pub const DEFAULT_CHUNK_SIZE: u64 = 1 << 30;
pub const DEFAULT_RETRIES: u32 = 3;
pub const DEFAULT_CONNECT_TIMEOUT: &str = "10s";
pub const DEFAULT_TIMEOUT: &str = "5m";

/// Connection and container settings for a Swift-backed object store.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(deny_unknown_fields, default)]
pub struct SwiftConfig {
    /// 1, 2 or 3; 0 detects the version from `auth_url`.
    pub auth_version: u8,
    pub auth_url: String,
    pub username: String,
    pub user_domain_name: String,
    pub user_domain_id: String,
    pub user_id: String,
    pub password: String,
    pub domain_id: String,
    pub domain_name: String,
    pub project_id: String,
    pub project_name: String,
    pub project_domain_id: String,
    pub project_domain_name: String,
    pub region_name: String,
    pub container_name: String,
    /// Uploads of this many bytes or more (or of unknown size) are segmented.
    #[serde(deserialize_with = "deserialize_size")]
    pub large_object_chunk_size: u64,
    /// Container for segments; empty means `container_name`.
    pub large_object_segments_container_name: String,
    pub retries: u32,
    pub connect_timeout: String,
    pub timeout: String,
}

impl Default for SwiftConfig {
    fn default() -> Self {
        Self {
            auth_version: 0,
            auth_url: String::new(),
            username: String::new(),
            user_domain_name: String::new(),
            user_domain_id: String::new(),
            user_id: String::new(),
            password: String::new(),
            domain_id: String::new(),
            domain_name: String::new(),
            project_id: String::new(),
            project_name: String::new(),
            project_domain_id: String::new(),
            project_domain_name: String::new(),
            region_name: String::new(),
            container_name: String::new(),
            large_object_chunk_size: DEFAULT_CHUNK_SIZE,
            large_object_segments_container_name: String::new(),
            retries: DEFAULT_RETRIES,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT.into(),
            timeout: DEFAULT_TIMEOUT.into(),
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum SizeValue {
    Bytes(u64),
    Text(String),
}

fn deserialize_size<'de, D>(deserializer: D) -> std::result::Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    match SizeValue::deserialize(deserializer)? {
        SizeValue::Bytes(n) => Ok(n),
        SizeValue::Text(s) => parse_size(&s).map_err(serde::de::Error::custom),
    }
}

impl SwiftConfig {
    /// Parse and validate a YAML document.
    pub fn parse(yaml: &str) -> Result<Self> {
        let cfg: Self = serde_yaml::from_str(yaml)
            .map_err(|err| Error::Config(format!("parsing swift config: {err}")))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Build a config from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build a config from `lookup`, which maps variable names to values.
    /// Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |keys: &[&str]| {
            keys.iter()
                .filter_map(|k| lookup(k))
                .find(|v| !v.trim().is_empty())
        };
        let mut cfg = Self::default();
        let strings: [(&[&str], &mut String); 16] = [
            (&["OS_AUTH_URL"], &mut cfg.auth_url),
            (&["OS_USERNAME"], &mut cfg.username),
            (&["OS_USER_ID"], &mut cfg.user_id),
            (&["OS_PASSWORD"], &mut cfg.password),
            (&["OS_USER_DOMAIN_NAME"], &mut cfg.user_domain_name),
            (&["OS_USER_DOMAIN_ID"], &mut cfg.user_domain_id),
            (&["OS_PROJECT_NAME", "OS_TENANT_NAME"], &mut cfg.project_name),
            (&["OS_PROJECT_ID", "OS_TENANT_ID"], &mut cfg.project_id),
            (&["OS_PROJECT_DOMAIN_NAME"], &mut cfg.project_domain_name),
            (&["OS_PROJECT_DOMAIN_ID"], &mut cfg.project_domain_id),
            (&["OS_DOMAIN_NAME"], &mut cfg.domain_name),
            (&["OS_DOMAIN_ID"], &mut cfg.domain_id),
            (&["OS_REGION_NAME"], &mut cfg.region_name),
            (&["OS_CONTAINER_NAME"], &mut cfg.container_name),
            (
                &["SWIFT_SEGMENTS_CONTAINER_NAME"],
                &mut cfg.large_object_segments_container_name,
            ),
            (&["SWIFT_CONNECT_TIMEOUT"], &mut cfg.connect_timeout),
        ];
        for (keys, slot) in strings {
            if let Some(value) = get(keys) {
                *slot = value;
            }
        }
        if let Some(value) = get(&["SWIFT_TIMEOUT"]) {
            cfg.timeout = value;
        }
        if let Some(value) = get(&["OS_AUTH_VERSION", "OS_IDENTITY_API_VERSION"]) {
            let trimmed = value.trim().trim_start_matches(['v', 'V']);
            let major = trimmed.split('.').next().unwrap_or(trimmed);
            cfg.auth_version = major.parse().map_err(|_| {
                Error::Config(format!("invalid auth version `{value}`"))
            })?;
        }
        if let Some(value) = get(&["SWIFT_CHUNK_SIZE"]) {
            cfg.large_object_chunk_size = parse_size(&value)?;
        }
        if let Some(value) = get(&["SWIFT_RETRIES"]) {
            cfg.retries = value
                .trim()
                .parse()
                .map_err(|_| Error::Config(format!("invalid SWIFT_RETRIES `{value}`")))?;
        }
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.container_name.is_empty() {
            return Err(Error::Config("container_name is required".into()));
        }
        if self.large_object_chunk_size == 0 {
            return Err(Error::Config(
                "large_object_chunk_size must be positive".into(),
            ));
        }
        parse_duration(&self.connect_timeout)?;
        parse_duration(&self.timeout)?;
        Ok(())
    }

    /// Segment container name with the empty-means-primary fallback applied.
    pub fn segments_container(&self) -> &str {
        if self.large_object_segments_container_name.is_empty() {
            &self.container_name
        } else {
            &self.large_object_segments_container_name
        }
    }

    pub fn container_settings(&self) -> ContainerSettings {
        ContainerSettings::new(
            self.container_name.clone(),
            self.segments_container().to_string(),
            self.large_object_chunk_size,
        )
    }

    pub fn connect_options(&self) -> Result<ConnectOptions> {
        Ok(ConnectOptions {
            auth_version: self.auth_version,
            auth_url: self.auth_url.clone(),
            username: self.username.clone(),
            user_id: self.user_id.clone(),
            user_domain_name: self.user_domain_name.clone(),
            user_domain_id: self.user_domain_id.clone(),
            password: self.password.clone(),
            domain_id: self.domain_id.clone(),
            domain_name: self.domain_name.clone(),
            project_id: self.project_id.clone(),
            project_name: self.project_name.clone(),
            project_domain_id: self.project_domain_id.clone(),
            project_domain_name: self.project_domain_name.clone(),
            region_name: self.region_name.clone(),
            retries: self.retries,
            connect_timeout: parse_duration(&self.connect_timeout)?,
            timeout: parse_duration(&self.timeout)?,
        })
    }
}

/// Parse a Go-style duration such as `300ms`, `10s`, `1m30s` or `1.5h`.
pub fn parse_duration(input: &str) -> Result<Duration> {
    let bad = || Error::Config(format!("invalid duration `{input}`"));
    let s = input.trim();
    if s == "0" {
        return Ok(Duration::ZERO);
    }
    if s.is_empty() {
        return Err(bad());
    }

    let mut total = 0f64;
    let mut rest = s;
    while !rest.is_empty() {
        let num_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .ok_or_else(bad)?;
        if num_len == 0 {
            return Err(bad());
        }
        let value: f64 = rest[..num_len].parse().map_err(|_| bad())?;
        rest = &rest[num_len..];
        let unit_len = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let nanos_per_unit = match &rest[..unit_len] {
            "ns" => 1.0,
            "us" | "µs" => 1e3,
            "ms" => 1e6,
            "s" => 1e9,
            "m" => 60e9,
            "h" => 3600e9,
            _ => return Err(bad()),
        };
        rest = &rest[unit_len..];
        total += value * nanos_per_unit;
    }
    if !total.is_finite() || total > u64::MAX as f64 {
        return Err(bad());
    }
    Ok(Duration::from_nanos(total as u64))
}

/// Parse a byte size: a plain integer or a number with a binary unit
/// (`K`/`KiB`, `M`/`MiB`, `G`/`GiB`, `T`/`TiB`, case-insensitive).
pub fn parse_size(input: &str) -> Result<u64> {
    let bad = || Error::Config(format!("invalid size `{input}`"));
    let s = input.trim();
    let split = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    let (digits, unit) = s.split_at(split);
    if digits.is_empty() {
        return Err(bad());
    }
    let value: u64 = digits.parse().map_err(|_| bad())?;
    let shift = match unit.trim().to_ascii_lowercase().as_str() {
        "" | "b" => 0,
        "k" | "kb" | "kib" => 10,
        "m" | "mb" | "mib" => 20,
        "g" | "gb" | "gib" => 30,
        "t" | "tb" | "tib" => 40,
        _ => return Err(bad()),
    };
    value.checked_mul(1u64 << shift).ok_or_else(bad)
}

/// Emulator server configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub storage_dir: String,
    pub database_url: String,
    /// Account served under `/v1/{account}`.
    pub account: String,
    pub user: String,
    pub key: String,
}

/// Arguments of the `serve` subcommand.
#[derive(Args, Debug, Clone, Default)]
pub struct ServeArgs {
    /// Host to bind to (overrides SWIFT_EMULATOR_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides SWIFT_EMULATOR_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Directory where object payloads are stored (overrides SWIFT_EMULATOR_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<String>,

    /// Database URL (overrides SWIFT_EMULATOR_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Account name (overrides SWIFT_EMULATOR_ACCOUNT)
    #[arg(long)]
    pub account: Option<String>,

    /// User accepted by the auth endpoints (overrides SWIFT_EMULATOR_USER)
    #[arg(long)]
    pub user: Option<String>,

    /// Key accepted by the auth endpoints (overrides SWIFT_EMULATOR_KEY)
    #[arg(long)]
    pub key: Option<String>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,
}

impl ServerConfig {
    /// Merge CLI arguments over the process environment.
    pub fn from_env_and_args(args: &ServeArgs) -> anyhow::Result<Self> {
        Self::from_lookup_and_args(|key| env::var(key).ok(), args)
    }

    pub fn from_lookup_and_args<F>(lookup: F, args: &ServeArgs) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        // --- Environment fallback ---
        let env_or = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.into());
        let env_port = match lookup("SWIFT_EMULATOR_PORT") {
            Some(value) => value
                .parse::<u16>()
                .with_context(|| format!("parsing SWIFT_EMULATOR_PORT value `{}`", value))?,
            None => 8080,
        };

        // --- Merge ---
        Ok(Self {
            host: args
                .host
                .clone()
                .unwrap_or_else(|| env_or("SWIFT_EMULATOR_HOST", "0.0.0.0")),
            port: args.port.unwrap_or(env_port),
            storage_dir: args
                .storage_dir
                .clone()
                .unwrap_or_else(|| env_or("SWIFT_EMULATOR_STORAGE_DIR", "./data/objects")),
            database_url: args.database_url.clone().unwrap_or_else(|| {
                env_or("SWIFT_EMULATOR_DATABASE_URL", "sqlite://./data/meta/swift.db")
            }),
            account: args
                .account
                .clone()
                .unwrap_or_else(|| env_or("SWIFT_EMULATOR_ACCOUNT", "AUTH_test")),
            user: args
                .user
                .clone()
                .unwrap_or_else(|| env_or("SWIFT_EMULATOR_USER", "test:tester")),
            key: args
                .key
                .clone()
                .unwrap_or_else(|| env_or("SWIFT_EMULATOR_KEY", "testing")),
        })
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
