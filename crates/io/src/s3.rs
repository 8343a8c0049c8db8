use std::sync::LazyLock;

use aws_config::{BehaviorVersion, SdkConfig};
use aws_sdk_s3::config::{
    IdentityCache, SharedHttpClient, SharedIdentityCache,
};
use veil::Redact;

mod s3_error;
mod s3_storage;
pub use s3_storage::S3Storage;

static IDENTITY_CACHE: LazyLock<SharedIdentityCache> =
    LazyLock::new(|| IdentityCache::lazy().build());
static SMITHY_HTTP_CLIENT: LazyLock<SharedHttpClient> = LazyLock::new(|| {
    aws_smithy_http_client::Builder::new()
        .tls_provider(aws_smithy_http_client::tls::Provider::Rustls(
            aws_smithy_http_client::tls::rustls_provider::CryptoMode::AwsLc,
        ))
        .build_https()
});

#[derive(Debug, Clone, PartialEq, derive_more::From)]
pub enum S3Auth {
    AccessKey(S3AccessKeyAuth),
    SystemIdentity(S3SystemIdentityAuth),
}

/// Use the ambient AWS credential chain (env, profile, IMDS).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct S3SystemIdentityAuth {}

#[derive(Redact, Clone, PartialEq)]
pub struct S3AccessKeyAuth {
    pub access_key_id: String,
    #[redact(partial)]
    pub secret_access_key: String,
}

/// Connection settings for an S3-compatible endpoint plus the transfer
/// knobs of this backend.
#[derive(Debug, Clone, PartialEq, typed_builder::TypedBuilder)]
pub struct S3Settings {
    #[builder(default, setter(strip_option))]
    pub endpoint: Option<url::Url>,
    #[builder(default, setter(strip_option))]
    pub region: Option<String>,
    #[builder(default, setter(strip_option))]
    pub path_style_access: Option<bool>,
    /// Objects at or above this size are fetched as concurrent byte ranges.
    #[builder(default = S3Settings::DEFAULT_RANGE_THRESHOLD)]
    pub range_threshold: u64,
    /// Size of each ranged GET.
    #[builder(default = S3Settings::DEFAULT_RANGE_SIZE)]
    pub range_size: u64,
    /// Concurrent ranged GETs per object.
    #[builder(default = S3Settings::DEFAULT_RANGE_CONCURRENCY)]
    pub range_concurrency: usize,
}

impl Default for S3Settings {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl S3Settings {
    pub const DEFAULT_RANGE_THRESHOLD: u64 = 16 * 1024 * 1024;
    pub const DEFAULT_RANGE_SIZE: u64 = 8 * 1024 * 1024;
    pub const DEFAULT_RANGE_CONCURRENCY: usize = 8;

    pub async fn get_storage_client(&self, auth: Option<&S3Auth>) -> S3Storage {
        let sdk_config = self.get_sdk_config(auth).await;
        let s3_config: aws_sdk_s3::config::Config = (&sdk_config).into();
        let mut s3_builder = s3_config.to_builder();

        if self.path_style_access.unwrap_or(false) {
            s3_builder.set_force_path_style(Some(true));
        }

        let client = aws_sdk_s3::Client::from_conf(s3_builder.build());
        S3Storage::new(client, self.clone())
    }

    pub async fn get_sdk_config(&self, auth: Option<&S3Auth>) -> SdkConfig {
        let loader = match auth {
            Some(S3Auth::AccessKey(S3AccessKeyAuth {
                access_key_id,
                secret_access_key,
            })) => {
                let credentials = aws_credential_types::Credentials::new(
                    access_key_id,
                    secret_access_key,
                    None,
                    None,
                    "stevedore-settings",
                );
                aws_config::ConfigLoader::default().credentials_provider(credentials)
            }
            Some(S3Auth::SystemIdentity(S3SystemIdentityAuth {})) | None => aws_config::from_env(),
        }
        .behavior_version(BehaviorVersion::latest())
        .http_client((*SMITHY_HTTP_CLIENT).clone())
        .identity_cache(IDENTITY_CACHE.clone());

        let loader = if let Some(region) = &self.region {
            loader.region(aws_config::Region::new(region.clone()))
        } else {
            loader
        };

        let loader = if let Some(endpoint) = &self.endpoint {
            loader.endpoint_url(endpoint.to_string())
        } else {
            loader
        };

        loader.load().await
    }
}
