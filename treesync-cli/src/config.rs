use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use treesync::{EmptyDirPolicy, S3Config, SyncOptions};

/// Contents of a `--config` TOML file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    pub sync: SyncOptions,
    pub s3: S3Config,
}

impl FileConfig {
    pub async fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("cannot read config file {}", path.display()))?;
        let config: FileConfig =
            toml::from_str(&content).with_context(|| format!("invalid config file {}", path.display()))?;
        Ok(config)
    }
}

/// Run options given on the command line; unset values defer to the file
#[derive(Debug, Clone, Default)]
pub struct OptionOverrides {
    pub delete: bool,
    pub overwrite: bool,
    pub dry_run: bool,
    pub jobs: Option<usize>,
    pub mtime_granularity: Option<Duration>,
    pub dir_markers: bool,
    pub no_preserve_ownership: bool,
}

impl OptionOverrides {
    pub fn apply(&self, mut options: SyncOptions) -> SyncOptions {
        options.delete |= self.delete;
        options.overwrite |= self.overwrite;
        options.dry_run |= self.dry_run;
        if let Some(jobs) = self.jobs {
            options.max_concurrency = jobs;
        }
        if let Some(granularity) = self.mtime_granularity {
            options.mtime_granularity = granularity;
        }
        if self.dir_markers {
            options.empty_directories = EmptyDirPolicy::Marker;
        }
        if self.no_preserve_ownership {
            options.preserve_ownership = false;
        }
        options
    }
}

/// Connection settings from the command line or the environment
#[derive(Debug, Clone, Default)]
pub struct S3Overrides {
    pub endpoint: Option<String>,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub region: Option<String>,
}

impl S3Overrides {
    /// Merge over the file settings and check that nothing required is missing
    pub fn apply(&self, file: S3Config) -> Result<S3Config> {
        let config = S3Config {
            endpoint: self.endpoint.clone().or(file.endpoint),
            access_key_id: self.access_key_id.clone().or(file.access_key_id),
            secret_access_key: self.secret_access_key.clone().or(file.secret_access_key),
            region: self.region.clone().unwrap_or(file.region),
            max_retries: file.max_retries,
        };

        if config.endpoint.is_none() {
            bail!("no S3 endpoint given (--s3-endpoint or S3_ENDPOINT)");
        }
        if config.access_key_id.is_none() || config.secret_access_key.is_none() {
            bail!("no S3 credentials given (--s3-access-key-id/S3_ACCESS_KEY_ID and --s3-secret-access-key/S3_SECRET_ACCESS_KEY)");
        }
        Ok(config)
    }
}
