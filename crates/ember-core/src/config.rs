//! Configuration loading and typed config structures for the collector.
//!
//! Values are layered, lowest precedence first:
//!
//! 1. built-in defaults (the `Default` impls below)
//! 2. an optional YAML or TOML file (`ember.yaml` unless overridden)
//! 3. `EMBER_`-prefixed environment variables, `__` between sections,
//!    e.g. `EMBER_SAMPLER__INTERVAL_SECS=10`
//! 4. the plain variables `EXPORTER_URL`, `SAMPLE_INTERVAL`, `MODE`,
//!    `DATABASE_URL` and `TSDB_DSN`
//!
//! [`CollectorConfig::validate`] runs after layering; a config that
//! passes can be turned into a pipeline without further checks.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::time::Duration;

use chrono::TimeDelta;
use config::builder::{ConfigBuilder, DefaultState};
use config::{Config, Environment, File, FileFormat};
use ember_types::{BlockGrid, CountryCode};
use serde::Deserialize;

/// Default carbon intensities in g/kWh for the static source.
pub const DEFAULT_INTENSITIES: [(&str, f64); 42] = [
    ("DE", 148.0),
    ("FR", 20.0),
    ("IT", 160.0),
    ("ES", 79.0),
    ("GB", 136.0),
    ("PL", 510.0),
    ("NL", 83.0),
    ("BE", 74.0),
    ("AT", 26.0),
    ("SE", 17.0),
    ("SI", 46.0),
    ("DK", 105.0),
    ("NO", 31.0),
    ("FI", 40.0),
    ("CH", 26.0),
    ("CZ", 339.0),
    ("HU", 111.0),
    ("RO", 309.0),
    ("PT", 120.0),
    ("IE", 329.0),
    ("GR", 274.0),
    ("HR", 183.0),
    ("SK", 156.0),
    ("BG", 311.0),
    ("EE", 50.0),
    ("LT", 95.0),
    ("LV", 122.0),
    ("IS", 28.0),
    ("AL", 25.0),
    ("AM", 190.0),
    ("BY", 350.0),
    ("BA", 620.0),
    ("CY", 600.0),
    ("GE", 150.0),
    ("KZ", 650.0),
    ("XK", 700.0),
    ("LU", 65.0),
    ("MT", 400.0),
    ("MD", 380.0),
    ("ME", 450.0),
    ("MK", 550.0),
    ("TR", 420.0),
];

/// Errors that can occur when loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A source could not be read or deserialized.
    #[error("failed to load config: {source}")]
    Load {
        /// The underlying loader error.
        #[from]
        source: config::ConfigError,
    },

    /// A value is present but unusable.
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Top-level collector configuration.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct CollectorConfig {
    /// Exporter polling.
    pub sampler: SamplerConfig,
    /// Block grid and buffer retention.
    pub blocks: BlockConfig,
    /// Durable storage and the flush worker.
    pub persistence: PersistenceConfig,
    /// Carbon-intensity refresh.
    pub intensity: IntensityConfig,
    /// Query API listener.
    pub server: HttpConfig,
    /// Log output.
    pub logging: LoggingConfig,
}

/// Exporter polling settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SamplerConfig {
    /// Seconds between exporter polls.
    pub interval_secs: u64,
    /// Prometheus text endpoint of the exporter.
    pub exporter_url: String,
    /// Per-request timeout in milliseconds.
    pub exporter_timeout_ms: u64,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            interval_secs: 10,
            exporter_url: String::from("http://localhost:9102/metrics"),
            exporter_timeout_ms: 5_000,
        }
    }
}

impl SamplerConfig {
    /// Poll interval.
    pub const fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    /// Exporter request timeout.
    pub const fn exporter_timeout(&self) -> Duration {
        Duration::from_millis(self.exporter_timeout_ms)
    }
}

/// Block grid and buffer retention.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct BlockConfig {
    /// Length of one grid cell in seconds.
    pub duration_secs: u64,
    /// How long closed blocks stay in memory, in seconds.
    pub retention_secs: u64,
}

impl Default for BlockConfig {
    fn default() -> Self {
        Self {
            duration_secs: 50,
            retention_secs: 7_200,
        }
    }
}

impl BlockConfig {
    /// The shared block grid.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] for a zero or oversized duration.
    pub fn grid(&self) -> Result<BlockGrid, ConfigError> {
        BlockGrid::from_secs(self.duration_secs).map_err(|e| ConfigError::Invalid(e.to_string()))
    }

    /// Retention horizon as a signed duration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] if the value does not fit.
    pub fn retention(&self) -> Result<TimeDelta, ConfigError> {
        i64::try_from(self.retention_secs)
            .ok()
            .and_then(TimeDelta::try_seconds)
            .ok_or_else(|| {
                ConfigError::Invalid(format!(
                    "blocks.retention_secs out of range: {}",
                    self.retention_secs
                ))
            })
    }
}

/// Durable storage settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    /// Whether closed blocks are written to the database.
    pub enabled: bool,
    /// `PostgreSQL` URL.
    pub database_url: Option<String>,
    /// Pool size.
    pub max_connections: u32,
    /// Capacity of the flush queue in blocks.
    pub queue_capacity: usize,
    /// Write attempts per block before it is dropped.
    pub max_attempts: u32,
    /// First retry delay in milliseconds.
    pub backoff_base_ms: u64,
    /// Upper bound on the retry delay in milliseconds.
    pub backoff_max_ms: u64,
    /// How long shutdown waits for the flush worker to drain.
    pub shutdown_timeout_ms: u64,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            database_url: None,
            max_connections: 5,
            queue_capacity: 1_024,
            max_attempts: 5,
            backoff_base_ms: 500,
            backoff_max_ms: 30_000,
            shutdown_timeout_ms: 10_000,
        }
    }
}

impl PersistenceConfig {
    /// Drain deadline at shutdown.
    pub const fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

/// Where intensity values come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntensitySourceKind {
    /// The configured `static_values` table.
    Static,
    /// An Electricity Maps compatible HTTP API.
    ElectricityMaps,
}

/// Carbon-intensity refresh settings.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct IntensityConfig {
    /// Upstream source.
    pub source: IntensitySourceKind,
    /// Seconds between refreshes.
    pub refresh_interval_secs: u64,
    /// Fetch attempts per country per refresh.
    pub fetch_attempts: u32,
    /// Delay between attempts in milliseconds.
    pub retry_delay_ms: u64,
    /// How many hours of history are kept.
    pub history_retention_hours: u64,
    /// Country used when a query names none.
    pub default_country: String,
    /// Tracked countries; empty means every key of `static_values`.
    pub countries: Vec<String>,
    /// Values served by the static source, in g/kWh.
    pub static_values: BTreeMap<String, f64>,
    /// Base URL of the HTTP source.
    pub api_url: String,
    /// Token sent as the `auth-token` header.
    pub api_token: Option<String>,
}

impl Default for IntensityConfig {
    fn default() -> Self {
        Self {
            source: IntensitySourceKind::Static,
            refresh_interval_secs: 3_600,
            fetch_attempts: 3,
            retry_delay_ms: 2_000,
            history_retention_hours: 168,
            default_country: String::from("DE"),
            countries: Vec::new(),
            static_values: DEFAULT_INTENSITIES
                .iter()
                .map(|(code, value)| ((*code).to_owned(), *value))
                .collect(),
            api_url: String::from("https://api.electricitymap.org/v3"),
            api_token: None,
        }
    }
}

impl IntensityConfig {
    /// Refresh period.
    pub const fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }

    /// Delay between fetch attempts.
    pub const fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    /// History window.
    pub fn history_retention(&self) -> TimeDelta {
        i64::try_from(self.history_retention_hours)
            .ok()
            .and_then(TimeDelta::try_hours)
            .unwrap_or(TimeDelta::MAX)
    }

    /// The default country, parsed.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] for a malformed code.
    pub fn default_country(&self) -> Result<CountryCode, ConfigError> {
        CountryCode::parse(&self.default_country)
            .map_err(|e| ConfigError::Invalid(format!("intensity.default_country: {e}")))
    }

    /// Tracked countries in configuration order, without duplicates.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] for a malformed code.
    pub fn tracked_countries(&self) -> Result<Vec<CountryCode>, ConfigError> {
        let raw: Vec<&str> = if self.countries.is_empty() {
            self.static_values.keys().map(String::as_str).collect()
        } else {
            self.countries.iter().map(String::as_str).collect()
        };
        let mut tracked: Vec<CountryCode> = Vec::with_capacity(raw.len());
        for code in raw {
            let code = CountryCode::parse(code)
                .map_err(|e| ConfigError::Invalid(format!("intensity.countries: {e}")))?;
            if !tracked.contains(&code) {
                tracked.push(code);
            }
        }
        Ok(tracked)
    }

    /// The static table with parsed country codes.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] for a malformed code or a
    /// negative or non-finite value.
    pub fn static_table(&self) -> Result<BTreeMap<CountryCode, f64>, ConfigError> {
        self.static_values
            .iter()
            .map(|(code, value)| {
                let code = CountryCode::parse(code)
                    .map_err(|e| ConfigError::Invalid(format!("intensity.static_values: {e}")))?;
                if !value.is_finite() || *value < 0.0 {
                    return Err(ConfigError::Invalid(format!(
                        "intensity.static_values.{code}: {value} is not a valid intensity"
                    )));
                }
                Ok((code, *value))
            })
            .collect()
    }
}

/// Query API listener settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    /// Bind address.
    pub host: String,
    /// Bind port.
    pub port: u16,
    /// Bound on store reads made while serving a request.
    pub request_timeout_ms: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            host: String::from("0.0.0.0"),
            port: 5001,
            request_timeout_ms: 5_000,
        }
    }
}

impl HttpConfig {
    /// Request-level store timeout.
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Log output settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `pretty` or `json`.
    pub format: String,
    /// Default filter when `RUST_LOG` is unset.
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: String::from("pretty"),
            level: String::from("info"),
        }
    }
}

impl CollectorConfig {
    /// Load configuration from an optional file plus the process
    /// environment, then validate it.
    ///
    /// A missing file is not an error; defaults and environment apply.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Load`] if a source cannot be parsed, or
    /// [`ConfigError::Invalid`] if validation fails.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let env: HashMap<String, String> = std::env::vars().collect();
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path).required(false));
        }
        Self::finish(builder, &env)
    }

    /// Parse configuration from a YAML string and an explicit environment.
    ///
    /// # Errors
    ///
    /// Same as [`CollectorConfig::load`].
    pub fn parse_yaml(yaml: &str, env: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let builder = Config::builder().add_source(File::from_str(yaml, FileFormat::Yaml));
        Self::finish(builder, env)
    }

    fn finish(
        builder: ConfigBuilder<DefaultState>,
        env: &HashMap<String, String>,
    ) -> Result<Self, ConfigError> {
        let prefixed: config::Map<String, String> = env
            .iter()
            .filter(|(k, _)| k.starts_with("EMBER_"))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let mut config: Self = builder
            .add_source(
                Environment::with_prefix("EMBER")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("intensity.countries")
                    .source(Some(prefixed)),
            )
            .build()?
            .try_deserialize()?;
        config.apply_overrides(|name| env.get(name).cloned())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply the plain, unprefixed environment overrides.
    ///
    /// `TSDB_DSN` is accepted as an alias of `DATABASE_URL`; `MODE=db`
    /// enables persistence and `MODE=local` disables it.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] for an unparseable value.
    pub fn apply_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(url) = lookup("EXPORTER_URL") {
            self.sampler.exporter_url = url;
        }
        if let Some(raw) = lookup("SAMPLE_INTERVAL") {
            self.sampler.interval_secs = raw
                .trim()
                .parse()
                .map_err(|e| ConfigError::Invalid(format!("invalid SAMPLE_INTERVAL: {e}")))?;
        }
        if let Some(url) = lookup("DATABASE_URL").or_else(|| lookup("TSDB_DSN")) {
            self.persistence.database_url = Some(url);
        }
        if let Some(mode) = lookup("MODE") {
            self.persistence.enabled = match mode.trim().to_ascii_lowercase().as_str() {
                "db" => true,
                "local" => false,
                other => {
                    return Err(ConfigError::Invalid(format!(
                        "invalid MODE {other:?} (expected local or db)"
                    )));
                }
            };
        }
        Ok(())
    }

    /// Check cross-field constraints.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] describing the first violation.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| -> Result<(), ConfigError> {
            Err(ConfigError::Invalid(msg.to_owned()))
        };

        if self.sampler.interval_secs == 0 {
            return invalid("sampler.interval_secs must be positive");
        }
        if self.blocks.duration_secs == 0 {
            return invalid("blocks.duration_secs must be positive");
        }
        if self.blocks.duration_secs.checked_rem(self.sampler.interval_secs) != Some(0) {
            return invalid("blocks.duration_secs must be a multiple of sampler.interval_secs");
        }
        if self.blocks.retention_secs < self.blocks.duration_secs {
            return invalid("blocks.retention_secs must be at least blocks.duration_secs");
        }
        self.blocks.grid()?;
        self.blocks.retention()?;

        if self.persistence.enabled && self.persistence.database_url.is_none() {
            return invalid("persistence.enabled requires persistence.database_url");
        }
        if self.persistence.queue_capacity == 0 {
            return invalid("persistence.queue_capacity must be positive");
        }
        if self.persistence.max_attempts == 0 {
            return invalid("persistence.max_attempts must be positive");
        }

        if self.intensity.refresh_interval_secs == 0 {
            return invalid("intensity.refresh_interval_secs must be positive");
        }
        if self.intensity.fetch_attempts == 0 {
            return invalid("intensity.fetch_attempts must be positive");
        }
        let default_country = self.intensity.default_country()?;
        let tracked = self.intensity.tracked_countries()?;
        if !tracked.contains(&default_country) {
            return Err(ConfigError::Invalid(format!(
                "intensity.default_country {default_country} is not tracked"
            )));
        }
        let table = self.intensity.static_table()?;
        if self.intensity.source == IntensitySourceKind::Static {
            if let Some(missing) = tracked.iter().find(|c| !table.contains_key(*c)) {
                return Err(ConfigError::Invalid(format!(
                    "tracked country {missing} has no static intensity value"
                )));
            }
        }

        if !matches!(self.logging.format.as_str(), "pretty" | "json") {
            return Err(ConfigError::Invalid(format!(
                "unknown logging.format {:?} (expected pretty or json)",
                self.logging.format
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect()
    }

    #[test]
    fn defaults_are_valid() {
        let config = CollectorConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.server.port, 5001);
        assert_eq!(config.intensity.tracked_countries().unwrap().len(), 42);
    }

    #[test]
    fn yaml_sections_override_defaults() {
        let yaml = r"
sampler:
  interval_secs: 5
blocks:
  duration_secs: 25
intensity:
  countries: [de, fr]
";
        let config = CollectorConfig::parse_yaml(yaml, &HashMap::new()).unwrap();
        assert_eq!(config.sampler.interval_secs, 5);
        assert_eq!(config.blocks.duration_secs, 25);
        assert_eq!(config.blocks.retention_secs, 7_200);
        let codes: Vec<String> = config
            .intensity
            .tracked_countries()
            .unwrap()
            .into_iter()
            .map(String::from)
            .collect();
        assert_eq!(codes, vec!["DE", "FR"]);
    }

    #[test]
    fn prefixed_env_overrides_file() {
        let config = CollectorConfig::parse_yaml(
            "server:\n  port: 8000\n",
            &env(&[("EMBER_SERVER__PORT", "9000")]),
        )
        .unwrap();
        assert_eq!(config.server.port, 9000);
    }

    #[test]
    fn plain_env_overrides_apply() {
        let config = CollectorConfig::parse_yaml(
            "",
            &env(&[
                ("EXPORTER_URL", "http://kepler:9102/metrics"),
                ("TSDB_DSN", "postgresql://db/ember"),
                ("MODE", "db"),
            ]),
        )
        .unwrap();
        assert_eq!(config.sampler.exporter_url, "http://kepler:9102/metrics");
        assert!(config.persistence.enabled);
        assert_eq!(
            config.persistence.database_url.as_deref(),
            Some("postgresql://db/ember")
        );
    }

    #[test]
    fn persistence_without_url_is_rejected() {
        let err = CollectorConfig::parse_yaml("", &env(&[("MODE", "db")])).unwrap_err();
        assert!(err.to_string().contains("database_url"));
    }

    #[test]
    fn block_duration_must_align_with_interval() {
        let mut config = CollectorConfig::default();
        config.blocks.duration_secs = 45;
        assert!(config.validate().is_err());
    }

    #[test]
    fn untracked_default_country_is_rejected() {
        let mut config = CollectorConfig::default();
        config.intensity.countries = vec![String::from("FR")];
        assert!(config.validate().is_err());
    }
}
