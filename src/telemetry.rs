//! Process-wide structured logging setup.
//!
//! Initializes a `tracing-subscriber` `fmt` layer driven by an `EnvFilter`, so
//! verbosity is controlled at deploy time via `RUST_LOG` (or `PAYGATE_LOG` as a
//! service-specific alias) without recompiling.

use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

const DEFAULT_FILTER: &str = "info";

/// Builder for the process's tracing subscriber.
#[derive(Debug, Default)]
pub struct Telemetry {
    name: Option<&'static str>,
    version: Option<&'static str>,
}

impl Telemetry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_name(mut self, name: &'static str) -> Self {
        self.name = Some(name);
        self
    }

    pub fn with_version(mut self, version: &'static str) -> Self {
        self.version = Some(version);
        self
    }

    /// Installs the global tracing subscriber. Panics if a subscriber is already
    /// installed, matching `tracing_subscriber`'s own contract.
    pub fn register(self) -> Self {
        let filter = std::env::var("PAYGATE_LOG")
            .or_else(|_| std::env::var("RUST_LOG"))
            .unwrap_or_else(|_| DEFAULT_FILTER.to_string());

        tracing_subscriber::registry()
            .with(EnvFilter::new(filter))
            .with(tracing_subscriber::fmt::layer())
            .init();

        if let (Some(name), Some(version)) = (self.name, self.version) {
            tracing::info!(name, version, "telemetry initialized");
        }

        self
    }

    /// `tower_http` layer for per-request HTTP tracing spans.
    pub fn http_tracing(&self) -> TraceLayer<tower_http::classify::SharedClassifier<tower_http::classify::ServerErrorsAsFailures>> {
        TraceLayer::new_for_http()
    }
}
