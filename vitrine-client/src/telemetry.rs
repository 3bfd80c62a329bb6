//! Tracing subscriber setup for embedding hosts.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use vitrine_core::{VitrineError, VitrineResult};

pub const DEFAULT_FILTER: &str = "vitrine=debug,info";

/// Logging configuration from environment variables.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Filter directives used when `RUST_LOG` is unset.
    pub default_filter: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
    pub service_name: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            default_filter: std::env::var("VITRINE_LOG")
                .unwrap_or_else(|_| DEFAULT_FILTER.to_string()),
            json: std::env::var("VITRINE_LOG_FORMAT")
                .map(|s| s.eq_ignore_ascii_case("json"))
                .unwrap_or(false),
            service_name: std::env::var("VITRINE_SERVICE_NAME")
                .unwrap_or_else(|_| "vitrine-client".to_string()),
        }
    }
}

/// Install the global tracing subscriber.
///
/// Call once at startup. `RUST_LOG` overrides the configured filter.
pub fn init_tracing(config: &TelemetryConfig) -> VitrineResult<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.default_filter));

    let registry = tracing_subscriber::registry().with(env_filter);
    let installed = if config.json {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
    } else {
        registry.with(tracing_subscriber::fmt::layer()).try_init()
    };
    installed.map_err(|e| VitrineError::Telemetry {
        reason: format!("Failed to init subscriber: {}", e),
    })?;

    tracing::info!(
        service_name = %config.service_name,
        json = config.json,
        "Telemetry initialized"
    );
    Ok(())
}
