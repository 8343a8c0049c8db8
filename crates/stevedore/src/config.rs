//! Engine configuration, layered defaults < config file < environment.

use figment::providers::Format;
use serde::{Deserialize, Serialize};
use stevedore_io::s3::S3Settings;
use url::Url;

/// Everything the engine needs to size its pool and talk to storage.
/// Extracted from defaults, an optional `stevedore.toml`, and
/// `STEVEDORE__*` environment variables; the CLI layers its flags on top.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
    /// Fixed degree of parallelism of the worker pool.
    pub workers: usize,
    /// Capacity of the main job queue.
    pub queue_capacity: usize,
    /// Custom S3-compatible endpoint.
    pub endpoint_url: Option<Url>,
    pub region: Option<String>,
    /// Path-style bucket addressing, needed by most non-AWS endpoints.
    pub path_style_access: bool,
    /// Objects at or above this size download as concurrent byte ranges.
    pub range_threshold_bytes: u64,
    pub range_size_bytes: u64,
    pub range_concurrency: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: 256,
            queue_capacity: 1024,
            endpoint_url: None,
            region: None,
            path_style_access: false,
            range_threshold_bytes: S3Settings::DEFAULT_RANGE_THRESHOLD,
            range_size_bytes: S3Settings::DEFAULT_RANGE_SIZE,
            range_concurrency: S3Settings::DEFAULT_RANGE_CONCURRENCY,
        }
    }
}

impl EngineConfig {
    /// Load the layered configuration.
    ///
    /// # Errors
    /// Fails on malformed values in the file or environment.
    pub fn load() -> Result<Self, Box<figment::Error>> {
        let defaults = figment::providers::Serialized::defaults(Self::default());
        figment::Figment::from(defaults)
            .merge(figment::providers::Toml::file("stevedore.toml"))
            .merge(figment::providers::Env::prefixed("STEVEDORE__").split("__"))
            .extract()
            .map_err(Box::new)
    }

    #[must_use]
    pub fn s3_settings(&self) -> S3Settings {
        let mut settings = S3Settings::builder()
            .range_threshold(self.range_threshold_bytes)
            .range_size(self.range_size_bytes)
            .range_concurrency(self.range_concurrency)
            .build();
        settings.endpoint = self.endpoint_url.clone();
        settings.region = self.region.clone();
        settings.path_style_access = Some(self.path_style_access);
        settings
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_defaults_load_without_environment() {
        figment::Jail::expect_with(|_jail| {
            let config = EngineConfig::load().unwrap();
            assert_eq!(config, EngineConfig::default());
            Ok(())
        });
    }

    #[test]
    fn test_environment_overrides_defaults() {
        figment::Jail::expect_with(|jail| {
            jail.set_env("STEVEDORE__WORKERS", "8");
            jail.set_env("STEVEDORE__REGION", "eu-central-1");
            jail.set_env("STEVEDORE__PATH_STYLE_ACCESS", "true");
            jail.set_env("STEVEDORE__ENDPOINT_URL", "http://localhost:9000");

            let config = EngineConfig::load().unwrap();
            assert_eq!(config.workers, 8);
            assert_eq!(config.region.as_deref(), Some("eu-central-1"));
            assert!(config.path_style_access);
            assert_eq!(
                config.endpoint_url.as_ref().map(Url::as_str),
                Some("http://localhost:9000/")
            );
            Ok(())
        });
    }

    #[test]
    fn test_file_is_overridden_by_environment() {
        figment::Jail::expect_with(|jail| {
            jail.create_file(
                "stevedore.toml",
                r#"
                workers = 4
                region = "us-west-2"
                "#,
            )?;
            jail.set_env("STEVEDORE__WORKERS", "16");

            let config = EngineConfig::load().unwrap();
            assert_eq!(config.workers, 16);
            assert_eq!(config.region.as_deref(), Some("us-west-2"));
            Ok(())
        });
    }

    #[test]
    fn test_s3_settings_mapping() {
        let config = EngineConfig {
            region: Some("us-east-2".to_string()),
            path_style_access: true,
            range_size_bytes: 1024,
            ..EngineConfig::default()
        };
        let settings = config.s3_settings();
        assert_eq!(settings.region.as_deref(), Some("us-east-2"));
        assert_eq!(settings.path_style_access, Some(true));
        assert_eq!(settings.range_size, 1024);
    }
}
