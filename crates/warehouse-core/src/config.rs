//! Process-wide settings, constructed once at startup and passed down.

use std::fmt::{Display, Formatter};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::genealogy::MAX_SINGLE_DIRECTION_DEPTH;
use crate::run::{validate_site_code, DEFAULT_SITE_CODE};
use crate::WarehouseError;

pub const INSECURE_SECRET_KEY: &str = "INSECURE-DEV-ONLY-CHANGE-ME";
const MIN_PRODUCTION_SECRET_CHARS: usize = 32;
const REDACTED: &str = "***";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    #[default]
    Development,
    Staging,
    Production,
}

impl Display for Environment {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Development => "development",
            Self::Staging => "staging",
            Self::Production => "production",
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct WarehouseSettings {
    pub environment: Environment,
    pub debug: bool,
    pub database_path: PathBuf,
    pub secret_key: String,
    pub site_code: String,
    pub genealogy_cache_ttl_secs: u64,
    pub deep_trace_max_depth: u8,
}

impl Default for WarehouseSettings {
    fn default() -> Self {
        Self {
            environment: Environment::Development,
            debug: false,
            database_path: PathBuf::from("./warehouse.sqlite3"),
            secret_key: INSECURE_SECRET_KEY.to_string(),
            site_code: DEFAULT_SITE_CODE.to_string(),
            genealogy_cache_ttl_secs: 300,
            deep_trace_max_depth: MAX_SINGLE_DIRECTION_DEPTH,
        }
    }
}

impl WarehouseSettings {
    #[must_use]
    pub fn is_production(&self) -> bool {
        self.environment == Environment::Production
    }

    /// Fails fast on unsafe or malformed settings.
    ///
    /// # Errors
    /// Returns [`WarehouseError::Configuration`] for an insecure production
    /// secret, debug enabled in production, a malformed site code, a zero
    /// cache TTL, or an out-of-range deep-trace depth.
    pub fn validate(&self) -> Result<(), WarehouseError> {
        if self.is_production() {
            if self.secret_key.contains("INSECURE")
                || self.secret_key.chars().count() < MIN_PRODUCTION_SECRET_CHARS
            {
                return Err(WarehouseError::Configuration(format!(
                    "secret_key must be set to a secure value (min {MIN_PRODUCTION_SECRET_CHARS} chars) in production"
                )));
            }
            if self.debug {
                return Err(WarehouseError::Configuration(
                    "debug must be false in production".to_string(),
                ));
            }
        }
        validate_site_code(&self.site_code)
            .map_err(|err| WarehouseError::Configuration(err.message().to_string()))?;
        if self.genealogy_cache_ttl_secs == 0 {
            return Err(WarehouseError::Configuration(
                "genealogy_cache_ttl_secs MUST be > 0".to_string(),
            ));
        }
        if self.deep_trace_max_depth == 0 || self.deep_trace_max_depth > MAX_SINGLE_DIRECTION_DEPTH
        {
            return Err(WarehouseError::Configuration(format!(
                "deep_trace_max_depth MUST be in [1, {MAX_SINGLE_DIRECTION_DEPTH}]"
            )));
        }
        Ok(())
    }

    /// Copy safe to print: the secret is masked.
    #[must_use]
    pub fn redacted(&self) -> Self {
        Self {
            secret_key: REDACTED.to_string(),
            ..self.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn production() -> WarehouseSettings {
        WarehouseSettings {
            environment: Environment::Production,
            secret_key: "k".repeat(40),
            ..WarehouseSettings::default()
        }
    }

    #[test]
    fn development_defaults_are_valid() {
        assert!(WarehouseSettings::default().validate().is_ok());
    }

    #[test]
    fn production_rejects_insecure_secrets_and_debug() {
        assert!(production().validate().is_ok());

        let insecure = WarehouseSettings {
            secret_key: format!("{INSECURE_SECRET_KEY}-but-long-enough-now"),
            ..production()
        };
        assert!(matches!(
            insecure.validate(),
            Err(WarehouseError::Configuration(_))
        ));

        let short = WarehouseSettings {
            secret_key: "k".repeat(31),
            ..production()
        };
        assert!(short.validate().is_err());

        let debug = WarehouseSettings {
            debug: true,
            ..production()
        };
        assert!(debug.validate().is_err());
    }

    #[test]
    fn site_code_and_ttl_are_checked() {
        let bad_site = WarehouseSettings {
            site_code: "Du1".to_string(),
            ..WarehouseSettings::default()
        };
        assert_eq!(
            bad_site.validate().err().map(|err| err.code()),
            Some("configuration_error")
        );
        let zero_ttl = WarehouseSettings {
            genealogy_cache_ttl_secs: 0,
            ..WarehouseSettings::default()
        };
        assert!(zero_ttl.validate().is_err());
    }

    #[test]
    fn redaction_masks_only_the_secret() {
        let redacted = production().redacted();
        assert_eq!(redacted.secret_key, "***");
        assert_eq!(redacted.environment, Environment::Production);
    }
}
