// Telemetry Module
//
// Console logging for the worker binary. Results go to stdout, so every log
// line is written to stderr.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Telemetry configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryConfig {
    /// Service name attached to the startup log
    pub service_name: String,
    /// Environment (e.g., "development", "production")
    pub environment: Option<String>,
    /// Whether to enable console logging
    pub enable_console: bool,
    /// Log filter (e.g., "info", "debug", "kgflow_runtime=debug")
    pub log_filter: Option<String>,
    /// Emit JSON log lines instead of human readable ones
    pub json: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: "kgflow-worker".to_string(),
            environment: None,
            enable_console: true,
            log_filter: None,
            json: false,
        }
    }
}

impl TelemetryConfig {
    /// Create configuration from environment variables
    ///
    /// Environment variables:
    /// - `OTEL_SERVICE_NAME`: Service name (default: "kgflow-worker")
    /// - `KGFLOW_ENVIRONMENT`: Deployment environment
    /// - `RUST_LOG` or `LOG_LEVEL`: Log filter
    /// - `KGFLOW_LOG_FORMAT`: "json" for structured log lines
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build configuration from an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let log_filter = lookup("RUST_LOG").or_else(|| {
            lookup("LOG_LEVEL").map(|level| {
                format!("kgflow_worker={level},kgflow_runtime={level}")
            })
        });

        Self {
            service_name: lookup("OTEL_SERVICE_NAME")
                .unwrap_or_else(|| "kgflow-worker".to_string()),
            environment: lookup("KGFLOW_ENVIRONMENT"),
            enable_console: true,
            log_filter,
            json: lookup("KGFLOW_LOG_FORMAT").is_some_and(|f| f.eq_ignore_ascii_case("json")),
        }
    }

    fn filter(&self) -> EnvFilter {
        self.log_filter
            .as_ref()
            .and_then(|f| EnvFilter::try_new(f).ok())
            .unwrap_or_else(|| EnvFilter::new("info"))
    }
}

/// Initialize the global tracing subscriber
pub fn init_telemetry(config: &TelemetryConfig) {
    let console_layer = config.enable_console.then(|| {
        let layer = tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_writer(std::io::stderr);
        if config.json {
            layer.json().with_filter(config.filter()).boxed()
        } else {
            layer.with_filter(config.filter()).boxed()
        }
    });

    tracing_subscriber::registry().with(console_layer).init();

    tracing::debug!(
        service = %config.service_name,
        environment = config.environment.as_deref().unwrap_or("unknown"),
        "Telemetry initialized"
    );
}
