//! Instance Writer Demo - Main Entry Point

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use instance_writer::{InstanceWriter, MetricsReporter};
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use writer_demo::{init_logging, run_producer, DemoConfig, SimulatedSink};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let path = std::env::args().nth(1).map(PathBuf::from);
    let config = DemoConfig::load(path.as_deref()).context("loading demo configuration")?;
    init_logging(config.json_logs)?;

    info!("=== Instance Writer Demo v{} ===", env!("CARGO_PKG_VERSION"));

    if let Some(addr) = &config.metrics_addr {
        let addr: SocketAddr = addr.parse().context("parsing metrics_addr")?;
        PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .context("installing Prometheus exporter")?;
        info!("Prometheus exporter listening on {}", addr);
    }

    let cancel = CancellationToken::new();
    let sink = Arc::new(SimulatedSink::new(config.sink_latency(), config.fail_every));

    let (tx, writer) = InstanceWriter::channel(config.writer, Arc::clone(&sink), 64);
    let mut writer = writer.with_overwrite_callback(|| {
        tracing::trace!("Datapoint overwritten before send");
    });
    writer.start(cancel.clone())?;

    let reporter = MetricsReporter::new(writer.metrics(), "writer_demo_", config.report_interval());
    let reporter = tokio::spawn(reporter.run(cancel.clone()));
    let producer = tokio::spawn(run_producer(
        tx,
        config.records_per_tick,
        config.tick(),
        cancel.clone(),
    ));

    if config.run_secs > 0 {
        tokio::select! {
            result = tokio::signal::ctrl_c() => result?,
            _ = tokio::time::sleep(std::time::Duration::from_secs(config.run_secs)) => {}
        }
    } else {
        tokio::signal::ctrl_c().await?;
    }

    info!("Shutting down...");
    cancel.cancel();

    let produced = producer.await?;
    writer.wait_for_shutdown().await?;
    if let Err(e) = reporter.await {
        warn!("Metrics reporter ended abnormally: {}", e);
    }

    let snapshot = writer.metrics().snapshot();
    info!(
        produced,
        received = snapshot.received,
        sent = snapshot.sent,
        failed = snapshot.failed_to_send,
        overwritten = snapshot.overwritten,
        sink_batches = sink.batches(),
        sink_bytes = sink.bytes(),
        "Demo finished"
    );

    Ok(())
}
