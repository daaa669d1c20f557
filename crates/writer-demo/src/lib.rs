//! Instance Writer Demo
//!
//! Synthetic producer and simulated sink for exercising the instance writer
//! under sustained load.

pub mod config;
pub mod producer;
pub mod sink;

use tracing::Level;
use tracing_subscriber::FmtSubscriber;

pub use self::config::DemoConfig;
pub use producer::{run_producer, Datapoint};
pub use sink::SimulatedSink;

/// Initialize logging
pub fn init_logging(json: bool) -> Result<(), tracing::subscriber::SetGlobalDefaultError> {
    if json {
        let subscriber = FmtSubscriber::builder()
            .json()
            .with_max_level(Level::INFO)
            .with_target(true)
            .finish();
        tracing::subscriber::set_global_default(subscriber)
    } else {
        let subscriber = FmtSubscriber::builder()
            .with_max_level(Level::INFO)
            .with_target(true)
            .finish();
        tracing::subscriber::set_global_default(subscriber)
    }
}
