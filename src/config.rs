use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::export::{
    BodyEncoding, DEFAULT_METRIC_PREFIX, DEFAULT_RESOURCE_TYPE, MAX_TIME_SERIES_PER_UPLOAD,
};

/// Top-level configuration for the viewstat daemon.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Logging verbosity (debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// How often view snapshots are taken and handed to the exporter.
    /// Default: 60s.
    #[serde(default = "default_reporting_period", with = "humantime_serde")]
    pub reporting_period: Duration,

    /// RPC view registration.
    #[serde(default)]
    pub rpc: RpcConfig,

    /// Metric backend export configuration.
    #[serde(default)]
    pub exporter: ExporterConfig,

    /// Prometheus health metrics server configuration.
    #[serde(default)]
    pub health: HealthConfig,

    /// Synthetic RPC traffic generation.
    #[serde(default)]
    pub simulate: SimulateConfig,
}

/// Which RPC sides get their default views registered.
#[derive(Debug, Clone, Deserialize)]
pub struct RpcConfig {
    /// Register server-side views. Default: true.
    #[serde(default = "default_true")]
    pub server_views: bool,

    /// Register client-side views. Default: false.
    #[serde(default)]
    pub client_views: bool,
}

/// Metric backend export configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ExporterConfig {
    /// Enable uploads to the backend. Default: false.
    #[serde(default)]
    pub enabled: bool,

    /// Backend project the series are written to.
    #[serde(default)]
    pub project_id: String,

    /// Backend base URL. Default: "https://monitoring.googleapis.com".
    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    /// Prefix prepended to view names to form metric types.
    #[serde(default = "default_metric_prefix")]
    pub metric_prefix: String,

    /// Monitored resource type attached to every point. Default: "global".
    #[serde(default = "default_resource_type")]
    pub resource_type: String,

    /// Maximum time series per upload request. Default: 200.
    #[serde(default = "default_max_time_series_per_request")]
    pub max_time_series_per_request: usize,

    /// Maximum wait before uploading a partial bundle. Default: 2s.
    #[serde(default = "default_bundle_delay", with = "humantime_serde")]
    pub bundle_delay: Duration,

    /// View snapshots per bundle. Default: 50.
    #[serde(default = "default_bundle_count")]
    pub bundle_count: usize,

    /// Timeout of a single backend call. Default: 5s.
    #[serde(default = "default_upload_timeout", with = "humantime_serde")]
    pub upload_timeout: Duration,

    /// Maximum snapshots queued (dropped if full). Default: 1024.
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,

    /// Concurrent upload requests. Default: 4.
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Body compression (none, gzip, zstd, zlib, snappy). Default: none.
    #[serde(default)]
    pub compression: BodyEncoding,

    /// Additional HTTP headers, e.g. authorization.
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

/// Prometheus health metrics server configuration.
#[derive(Debug, Deserialize)]
pub struct HealthConfig {
    /// Serve /metrics and /healthz. Default: true.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Listen address. Default: ":9090".
    #[serde(default = "default_health_addr")]
    pub addr: String,
}

/// Synthetic RPC traffic, for exercising the pipeline without a real server.
#[derive(Debug, Default, Deserialize)]
pub struct SimulateConfig {
    /// Simulated calls per second. 0 disables simulation.
    #[serde(default)]
    pub rps: u32,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_reporting_period() -> Duration {
    Duration::from_secs(60)
}

fn default_true() -> bool {
    true
}

fn default_endpoint() -> String {
    "https://monitoring.googleapis.com".to_string()
}

fn default_metric_prefix() -> String {
    DEFAULT_METRIC_PREFIX.to_string()
}

fn default_resource_type() -> String {
    DEFAULT_RESOURCE_TYPE.to_string()
}

fn default_max_time_series_per_request() -> usize {
    MAX_TIME_SERIES_PER_UPLOAD
}

fn default_bundle_delay() -> Duration {
    Duration::from_secs(2)
}

fn default_bundle_count() -> usize {
    50
}

fn default_upload_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_max_queue_size() -> usize {
    1024
}

fn default_workers() -> usize {
    4
}

fn default_health_addr() -> String {
    ":9090".to_string()
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            reporting_period: default_reporting_period(),
            rpc: RpcConfig::default(),
            exporter: ExporterConfig::default(),
            health: HealthConfig::default(),
            simulate: SimulateConfig::default(),
        }
    }
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            server_views: true,
            client_views: false,
        }
    }
}

impl Default for ExporterConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            project_id: String::new(),
            endpoint: default_endpoint(),
            metric_prefix: default_metric_prefix(),
            resource_type: default_resource_type(),
            max_time_series_per_request: default_max_time_series_per_request(),
            bundle_delay: default_bundle_delay(),
            bundle_count: default_bundle_count(),
            upload_timeout: default_upload_timeout(),
            max_queue_size: default_max_queue_size(),
            workers: default_workers(),
            compression: BodyEncoding::None,
            headers: HashMap::new(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            addr: default_health_addr(),
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.reporting_period.is_zero() {
            bail!("reporting_period must be positive");
        }

        if !self.rpc.server_views && !self.rpc.client_views {
            bail!("at least one of rpc.server_views and rpc.client_views must be enabled");
        }

        self.exporter.validate()?;

        if self.health.enabled && self.health.addr.is_empty() {
            bail!("health.addr is required when health is enabled");
        }

        Ok(())
    }
}

impl ExporterConfig {
    /// Validate exporter settings. The project is only required when
    /// uploads are enabled.
    pub fn validate(&self) -> Result<()> {
        if self.enabled && self.project_id.is_empty() {
            bail!("exporter.project_id is required when the exporter is enabled");
        }

        if self.enabled && self.endpoint.is_empty() {
            bail!("exporter.endpoint is required when the exporter is enabled");
        }

        if self.metric_prefix.is_empty() {
            bail!("exporter.metric_prefix must not be empty");
        }

        if self.resource_type.is_empty() {
            bail!("exporter.resource_type must not be empty");
        }

        if self.max_time_series_per_request == 0
            || self.max_time_series_per_request > MAX_TIME_SERIES_PER_UPLOAD
        {
            bail!(
                "exporter.max_time_series_per_request must be between 1 and {}",
                MAX_TIME_SERIES_PER_UPLOAD
            );
        }

        if self.bundle_delay.is_zero() {
            bail!("exporter.bundle_delay must be positive");
        }

        if self.bundle_count == 0 {
            bail!("exporter.bundle_count must be positive");
        }

        if self.upload_timeout.is_zero() {
            bail!("exporter.upload_timeout must be positive");
        }

        if self.max_queue_size == 0 {
            bail!("exporter.max_queue_size must be positive");
        }

        if self.workers == 0 {
            bail!("exporter.workers must be positive");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn test_default_config_values() {
        let cfg = Config::default();
        assert_eq!(cfg.log_level, "info");
        assert_eq!(cfg.reporting_period, Duration::from_secs(60));
        assert!(cfg.rpc.server_views);
        assert!(!cfg.rpc.client_views);
        assert_eq!(cfg.exporter.max_time_series_per_request, 200);
        assert_eq!(cfg.exporter.metric_prefix, "custom.googleapis.com/opencensus/");
        assert_eq!(cfg.exporter.resource_type, "global");
        assert_eq!(cfg.health.addr, ":9090");
        assert_eq!(cfg.simulate.rps, 0);
        cfg.validate().expect("defaults are valid");
    }

    #[test]
    fn test_validation_enabled_exporter_needs_project() {
        let cfg = Config {
            exporter: ExporterConfig {
                enabled: true,
                ..Default::default()
            },
            ..Default::default()
        };
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("exporter.project_id"));
    }

    #[test]
    fn test_validation_batch_limit() {
        let cfg = ExporterConfig {
            max_time_series_per_request: 201,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());

        let cfg = ExporterConfig {
            max_time_series_per_request: 0,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_unknown_compression_rejected() {
        let err = serde_yaml::from_str::<ExporterConfig>("compression: brotli").unwrap_err();
        assert!(err.to_string().contains("brotli"), "{err}");
    }

    #[test]
    fn test_validation_no_rpc_side() {
        let cfg = Config {
            rpc: RpcConfig {
                server_views: false,
                client_views: false,
            },
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_validation_zero_reporting_period() {
        let cfg = Config {
            reporting_period: Duration::ZERO,
            ..Default::default()
        };
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("reporting_period"));
    }

    #[test]
    fn test_load_yaml() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        write!(
            file,
            r#"
log_level: debug
reporting_period: 10s
rpc:
  client_views: true
exporter:
  enabled: true
  project_id: my-project
  bundle_delay: 500ms
  compression: gzip
  headers:
    Authorization: Bearer token
health:
  addr: "127.0.0.1:9191"
simulate:
  rps: 20
"#
        )
        .expect("write config");

        let cfg = Config::load(file.path()).expect("load");
        assert_eq!(cfg.log_level, "debug");
        assert_eq!(cfg.reporting_period, Duration::from_secs(10));
        assert!(cfg.rpc.server_views);
        assert!(cfg.rpc.client_views);
        assert!(cfg.exporter.enabled);
        assert_eq!(cfg.exporter.project_id, "my-project");
        assert_eq!(cfg.exporter.bundle_delay, Duration::from_millis(500));
        assert_eq!(cfg.exporter.compression, BodyEncoding::Gzip);
        assert_eq!(
            cfg.exporter.headers.get("Authorization").map(String::as_str),
            Some("Bearer token")
        );
        assert_eq!(cfg.exporter.workers, 4);
        assert_eq!(cfg.health.addr, "127.0.0.1:9191");
        assert_eq!(cfg.simulate.rps, 20);
    }

    #[test]
    fn test_load_rejects_invalid() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        write!(file, "exporter:\n  workers: 0\n").expect("write config");
        let err = Config::load(file.path()).unwrap_err();
        assert!(format!("{err:#}").contains("exporter.workers"));
    }
}
