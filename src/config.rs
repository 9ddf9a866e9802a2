//! Config file handling
//!
//! Durations use humantime syntax (`"250ms"`, `"30s"`, `"2m"`).

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::client::{ClientBuilder, ReqwestTransport, TlsSettings, TlsVersion};
use crate::codec::Codec;
use crate::errors::{ErrorKind, PulsewireError, Result};
use crate::retry::{Jitter, RetryPolicy};

/// `[retry]` section; unset fields keep the defaults
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetrySection {
    pub max_retries: Option<u32>,
    pub base_delay: Option<String>,
    pub multiplier: Option<f64>,
    pub max_delay: Option<String>,
    /// `"none"` or `"full"`
    pub jitter: Option<String>,
    pub respect_retry_after: Option<bool>,
    pub retryable_status_codes: Option<Vec<u16>>,
    pub retryable_errors: Option<Vec<String>>,
}

/// `[client]` section
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClientSection {
    pub attempt_timeout: Option<String>,
    pub deadline: Option<String>,
    /// `"json"` or `"form"`
    pub codec: Option<String>,
}

/// `[tls]` section, applied to the default transport
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TlsSection {
    pub verify: Option<bool>,
    pub min_version: Option<String>,
    /// PEM file with extra trusted roots
    pub ca_bundle: Option<String>,
}

/// pulsewire configuration file (TOML format)
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    #[serde(default)]
    pub retry: RetrySection,
    #[serde(default)]
    pub client: ClientSection,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    pub tls: Option<TlsSection>,
}

impl ConfigFile {
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| PulsewireError::Config(format!("Invalid config TOML: {}", e)))
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| PulsewireError::Config(format!("Failed to read config '{}': {}", path.display(), e)))?;
        Self::from_toml(&content)
    }

    /// Retry policy described by `[retry]`, validated
    pub fn retry_policy(&self) -> Result<RetryPolicy> {
        let section = &self.retry;
        let mut policy = RetryPolicy::default();

        if let Some(max) = section.max_retries {
            policy.max_retries = max;
        }
        if let Some(ref delay) = section.base_delay {
            policy.base_delay = parse_duration("retry.base_delay", delay)?;
        }
        if let Some(multiplier) = section.multiplier {
            policy.multiplier = multiplier;
        }
        if let Some(ref delay) = section.max_delay {
            policy.max_delay = Some(parse_duration("retry.max_delay", delay)?);
        }
        if let Some(ref jitter) = section.jitter {
            policy.jitter = match jitter.to_lowercase().as_str() {
                "none" => Jitter::None,
                "full" => Jitter::Full,
                other => {
                    return Err(PulsewireError::Config(format!(
                        "retry.jitter: unknown value '{}', use 'none' or 'full'",
                        other
                    )))
                }
            };
        }
        if let Some(respect) = section.respect_retry_after {
            policy.respect_retry_after = respect;
        }
        if let Some(ref codes) = section.retryable_status_codes {
            if let Some(bad) = codes.iter().find(|c| !(100..=599).contains(*c)) {
                return Err(PulsewireError::Config(format!(
                    "retry.retryable_status_codes: {} is not an HTTP status",
                    bad
                )));
            }
            policy.retryable_status_codes = codes.iter().copied().collect();
        }
        if let Some(ref kinds) = section.retryable_errors {
            policy.retryable_error_kinds = kinds
                .iter()
                .map(|k| k.parse::<ErrorKind>())
                .collect::<std::result::Result<_, _>>()
                .map_err(|e| PulsewireError::Config(format!("retry.retryable_errors: {}", e)))?;
        }

        policy.validate()?;
        Ok(policy)
    }

    /// TLS settings from `[tls]`, if the section is present
    pub fn tls_settings(&self) -> Result<Option<TlsSettings>> {
        let Some(ref section) = self.tls else {
            return Ok(None);
        };
        let mut settings = TlsSettings::default();
        if let Some(verify) = section.verify {
            settings.verify = verify;
        }
        if let Some(ref version) = section.min_version {
            settings.min_version = TlsVersion::parse(version)
                .ok_or_else(|| PulsewireError::Config(format!("tls.min_version: unknown version '{}'", version)))?;
        }
        if let Some(ref path) = section.ca_bundle {
            let pem = std::fs::read(path)
                .map_err(|e| PulsewireError::Config(format!("Failed to read CA bundle '{}': {}", path, e)))?;
            settings.add_pem_bundle(&pem)?;
        }
        Ok(Some(settings))
    }

    /// Apply every section to `builder`
    pub fn apply(&self, mut builder: ClientBuilder) -> Result<ClientBuilder> {
        builder = builder.retry_policy(self.retry_policy()?);

        if let Some(ref timeout) = self.client.attempt_timeout {
            builder = builder.attempt_timeout(parse_duration("client.attempt_timeout", timeout)?);
        }
        if let Some(ref deadline) = self.client.deadline {
            builder = builder.deadline(parse_duration("client.deadline", deadline)?);
        }
        if let Some(ref codec) = self.client.codec {
            builder = builder.codec(match codec.to_lowercase().as_str() {
                "json" => Codec::Json,
                "form" => Codec::Form,
                other => return Err(PulsewireError::Config(format!("client.codec: unknown codec '{}'", other))),
            });
        }
        for (name, value) in &self.headers {
            builder = builder.default_header(name, value);
        }
        if let Some(tls) = self.tls_settings()? {
            builder = builder.transport(ReqwestTransport::builder().tls(tls).build()?);
        }
        Ok(builder)
    }
}

fn parse_duration(field: &str, value: &str) -> Result<Duration> {
    humantime::parse_duration(value.trim())
        .map_err(|e| PulsewireError::Config(format!("{}: invalid duration '{}': {}", field, value, e)))
}
