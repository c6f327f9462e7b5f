use std::path::Path;

use anyhow::Result;
use config::{Config, ConfigError, Environment, File, FileFormat};
use warehouse_core::config::WarehouseSettings;
use warehouse_core::WarehouseError;

const DEFAULT_CONFIG_FILE: &str = "warehouse.toml";
const ENV_PREFIX: &str = "WAREHOUSE";

/// Loads settings with precedence defaults < TOML file < `WAREHOUSE_*`
/// environment < `--db`.
///
/// An explicit `config_path` must exist; the default `warehouse.toml` is
/// only read when present. A `.env` file in the working directory is
/// folded into the process environment first.
///
/// # Errors
/// Returns [`WarehouseError::Configuration`] when a source cannot be read or
/// parsed, or when the merged settings fail validation.
pub fn load_settings(
    config_path: Option<&Path>,
    db_override: Option<&Path>,
) -> Result<WarehouseSettings> {
    if let Err(err) = dotenvy::dotenv() {
        if !err.not_found() {
            return Err(WarehouseError::Configuration(format!("failed to read .env: {err}")).into());
        }
    }

    let mut builder = Config::builder();
    match config_path {
        Some(path) => {
            builder = builder.add_source(File::from(path).format(FileFormat::Toml).required(true));
        }
        None if Path::new(DEFAULT_CONFIG_FILE).exists() => {
            builder = builder.add_source(
                File::new(DEFAULT_CONFIG_FILE, FileFormat::Toml).required(false),
            );
        }
        None => {}
    }
    builder = builder.add_source(Environment::with_prefix(ENV_PREFIX).try_parsing(true));

    let mut settings: WarehouseSettings = builder
        .build()
        .and_then(|config| config.try_deserialize())
        .map_err(configuration_error)?;
    if let Some(path) = db_override {
        settings.database_path = path.to_path_buf();
    }
    settings.validate()?;

    tracing::debug!(
        environment = %settings.environment,
        database_path = %settings.database_path.display(),
        site_code = %settings.site_code,
        "settings loaded"
    );
    Ok(settings)
}

fn configuration_error(err: ConfigError) -> WarehouseError {
    WarehouseError::Configuration(format!("invalid settings: {err}"))
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::PathBuf;

    use super::*;
    use warehouse_core::config::Environment as DeployEnvironment;
    use warehouse_store_sqlite::classify_failure;

    fn must<T>(result: Result<T>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err:#}"),
        }
    }

    fn toml_file(body: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!("whm-settings-{}.toml", ulid::Ulid::new()));
        if let Err(err) = fs::write(&path, body) {
            panic!("failed to write settings fixture: {err}");
        }
        path
    }

    #[test]
    fn file_values_override_defaults_and_db_flag_wins() {
        let path = toml_file(concat!(
            "site_code = \"BUDA\"\n",
            "genealogy_cache_ttl_secs = 60\n",
            "database_path = \"/tmp/from-file.sqlite3\"\n",
        ));
        let settings = must(load_settings(Some(&path), None));
        assert_eq!(settings.site_code, "BUDA");
        assert_eq!(settings.genealogy_cache_ttl_secs, 60);
        assert_eq!(settings.database_path, PathBuf::from("/tmp/from-file.sqlite3"));
        assert_eq!(settings.environment, DeployEnvironment::Development);

        let overridden = must(load_settings(Some(&path), Some(Path::new("/tmp/flag.sqlite3"))));
        assert_eq!(overridden.database_path, PathBuf::from("/tmp/flag.sqlite3"));
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn production_with_default_secret_is_rejected() {
        let path = toml_file("environment = \"production\"\n");
        let err = match load_settings(Some(&path), None) {
            Ok(settings) => panic!("expected configuration error, got {settings:?}"),
            Err(err) => err,
        };
        assert_eq!(classify_failure(&err).code, "configuration_error");
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn unreadable_sources_are_configuration_errors() {
        let missing = std::env::temp_dir().join(format!("whm-missing-{}.toml", ulid::Ulid::new()));
        let err = match load_settings(Some(&missing), None) {
            Ok(settings) => panic!("expected missing file error, got {settings:?}"),
            Err(err) => err,
        };
        assert_eq!(classify_failure(&err).code, "configuration_error");

        let malformed = toml_file("deep_trace_max_depth = \"deep\"\n");
        assert!(load_settings(Some(&malformed), None).is_err());
        let _ = fs::remove_file(&malformed);
    }
}
