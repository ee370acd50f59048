//! Configuration options for pageblob.
//!
//! Settings can be built in code, read from a file, read from environment variables, or
//! merged from all of these.
//!
//! ```rust
//! use pageblob::config::Settings;
//! let settings = Settings::default();
//! assert_eq!(512, settings.page_size);
//! ```
//!
//! Loading from predefined files, PageBlob.json, PageBlob.toml, PageBlob.yaml, or
//! PageBlob.yml, then merging any environment variable that starts with `PAGEBLOB_`:
//!
//! ```rust
//! use pageblob::config::Settings;
//! let settings = Settings::load().expect("Failed to load settings");
//! ```
//!
//! Durations are human-friendly strings such as "10ms" or "1s". In TOML:
//!
//! ```toml
//! page_size = 512
//! initial_page_count = 10
//! growth_factor = 1.5
//!
//! [retry]
//! max_attempts = 50
//! min_delay = "10ms"
//! max_delay = "200ms"
//! ```

use duration_str::deserialize_duration;
use figment::providers::{Env, Format, Json, Toml, Yaml};
use figment::{Figment, Metadata, Provider};
use serde::{Deserialize, Serialize, Serializer};
use std::path::Path;
use std::time::Duration;

use crate::error::PageBlobError;

/// Settings represents the options a user can tweak to fit the store to a workload.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct Settings {
    /// Size of one page in bytes. Every write offset and length sent to the backend is a
    /// multiple of this value. It must be the same for every client of a store.
    pub page_size: u64,

    /// Number of pages allocated when a stream's blob is first created.
    pub initial_page_count: u32,

    /// When a record no longer fits in its blob, the blob is grown to at least this
    /// multiple of its current size. Larger values trade storage for fewer resizes.
    /// A value of 1.0 grows to exactly the needed size.
    pub growth_factor: f64,

    /// Options for the conflict retry loop.
    pub retry: RetrySettings,
}

/// Options for retrying optimistic-concurrency conflicts.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct RetrySettings {
    /// Maximum number of attempts before giving up with a retry exhausted error. If this
    /// value is None, conflicts are retried until the update succeeds.
    pub max_attempts: Option<u32>,

    /// Lower bound of every backoff delay, and the delay before the first retry. Must be
    /// greater than zero.
    #[serde(deserialize_with = "deserialize_duration")]
    #[serde(serialize_with = "serialize_duration")]
    pub min_delay: Duration,

    /// Upper bound of the backoff delay for any retry.
    #[serde(deserialize_with = "deserialize_duration")]
    #[serde(serialize_with = "serialize_duration")]
    pub max_delay: Duration,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: None,
            min_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(200),
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            page_size: 512,
            initial_page_count: 10,
            growth_factor: 1.5,
            retry: RetrySettings::default(),
        }
    }
}

impl Settings {
    /// Converts the Settings to a JSON string representation
    pub fn to_json_string(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Loads Settings from a file. The format is picked from the extension: ".json",
    /// ".toml", ".yaml" or ".yml". Missing fields keep their default values.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Settings, crate::Error> {
        let path = path.as_ref();
        let Some(ext) = path.extension() else {
            return Err(PageBlobError::UnknownConfigurationFormat(path.into()).into());
        };

        let mut builder = Figment::from(Settings::default());
        match ext.to_str().unwrap_or_default() {
            "json" => builder = builder.merge(Json::file(path)),
            "toml" => builder = builder.merge(Toml::file(path)),
            "yaml" | "yml" => builder = builder.merge(Yaml::file(path)),
            _ => return Err(PageBlobError::UnknownConfigurationFormat(path.into()).into()),
        }
        builder
            .extract()
            .map_err(|e| PageBlobError::InvalidConfigurationFormat(Box::new(e)).into())
    }

    /// Loads Settings from environment variables with a specified prefix. Nested options
    /// are separated by a dot, e.g. `PAGEBLOB_RETRY.MAX_ATTEMPTS`.
    pub fn from_env(prefix: &str) -> Result<Settings, crate::Error> {
        Figment::from(Settings::default())
            .merge(Env::prefixed(prefix))
            .extract()
            .map_err(|e| PageBlobError::InvalidConfigurationFormat(Box::new(e)).into())
    }

    /// Loads Settings by merging, in order: defaults, "PageBlob.json", "PageBlob.toml",
    /// "PageBlob.yaml", "PageBlob.yml", and environment variables prefixed with
    /// "PAGEBLOB_". Later sources override earlier ones.
    pub fn load() -> Result<Settings, crate::Error> {
        Figment::from(Settings::default())
            .merge(Json::file("PageBlob.json"))
            .merge(Toml::file("PageBlob.toml"))
            .merge(Yaml::file("PageBlob.yaml"))
            .merge(Yaml::file("PageBlob.yml"))
            .admerge(Env::prefixed("PAGEBLOB_"))
            .extract()
            .map_err(|e| PageBlobError::InvalidConfigurationFormat(Box::new(e)).into())
    }

    pub(crate) fn validate(&self) -> Result<(), PageBlobError> {
        if self.page_size == 0 {
            return Err(PageBlobError::InvalidPageSize(self.page_size));
        }
        if self.initial_page_count == 0 {
            return Err(PageBlobError::InvalidInitialPageCount(
                self.initial_page_count,
            ));
        }
        if self.growth_factor.is_nan() || self.growth_factor < 1.0 {
            return Err(PageBlobError::InvalidGrowthFactor(self.growth_factor));
        }
        self.retry.validate()
    }
}

impl RetrySettings {
    pub(crate) fn validate(&self) -> Result<(), PageBlobError> {
        if self.max_attempts == Some(0) {
            return Err(PageBlobError::InvalidMaxAttempts);
        }
        if self.min_delay.is_zero() {
            return Err(PageBlobError::InvalidMinDelay);
        }
        if self.min_delay > self.max_delay {
            return Err(PageBlobError::InvalidRetryDelays {
                min_delay: self.min_delay,
                max_delay: self.max_delay,
            });
        }
        Ok(())
    }
}

impl Provider for Settings {
    fn metadata(&self) -> figment::Metadata {
        Metadata::named("PageBlob configuration options")
    }

    fn data(
        &self,
    ) -> Result<figment::value::Map<figment::Profile, figment::value::Dict>, figment::Error> {
        figment::providers::Serialized::defaults(self).data()
    }
}

// Custom serializer for Duration
fn serialize_duration<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    let secs = duration.as_secs();
    let millis = duration.subsec_millis();
    let duration_str = if secs > 0 && millis > 0 {
        format!("{secs}s+{millis:03}ms")
    } else if millis > 0 {
        format!("{millis:03}ms")
    } else {
        format!("{secs}s")
    };
    serializer.serialize_str(&duration_str)
}
