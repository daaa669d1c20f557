//! Demo Configuration

use std::path::Path;
use std::time::Duration;

use instance_writer::WriterConfig;
use serde::Deserialize;

/// Environment variable prefix, e.g. `WRITER_DEMO_WRITER__MAX_REQUESTS=4`
pub const ENV_PREFIX: &str = "WRITER_DEMO";

/// Demo harness configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DemoConfig {
    /// Writer limits
    pub writer: WriterConfig,
    /// Records produced per tick (default: 500)
    pub records_per_tick: usize,
    /// Producer tick interval in milliseconds (default: 10)
    pub tick_ms: u64,
    /// Simulated sink latency per batch in milliseconds (default: 50)
    pub sink_latency_ms: u64,
    /// Fail every Nth batch, 0 = never (default: 0)
    pub fail_every: u64,
    /// Stop after this many seconds, 0 = run until Ctrl-C (default: 0)
    pub run_secs: u64,
    /// Prometheus listen address, unset = no exporter
    pub metrics_addr: Option<String>,
    /// Emit logs as JSON
    pub json_logs: bool,
    /// Metrics report interval in seconds (default: 10)
    pub report_secs: u64,
}

impl Default for DemoConfig {
    fn default() -> Self {
        Self {
            writer: WriterConfig::default(),
            records_per_tick: 500,
            tick_ms: 10,
            sink_latency_ms: 50,
            fail_every: 0,
            run_secs: 0,
            metrics_addr: None,
            json_logs: false,
            report_secs: 10,
        }
    }
}

impl DemoConfig {
    /// Load from an optional file, overridden by `WRITER_DEMO_*` env vars.
    /// Nested writer keys use a double underscore.
    pub fn load(path: Option<&Path>) -> Result<Self, ::config::ConfigError> {
        let mut builder = ::config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(::config::File::from(path).required(true));
        }

        builder
            .add_source(
                ::config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }

    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms.max(1))
    }

    pub fn sink_latency(&self) -> Duration {
        Duration::from_millis(self.sink_latency_ms)
    }

    pub fn report_interval(&self) -> Duration {
        Duration::from_secs(self.report_secs.max(1))
    }
}
