//! Synthetic datapoint producer

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const METRICS: [&str; 4] = ["cpu.utilization", "memory.used", "disk.ops", "net.bytes_in"];

/// One measurement
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Datapoint {
    pub metric: String,
    pub value: f64,
    pub timestamp: DateTime<Utc>,
}

impl Datapoint {
    /// Deterministic datapoint for sequence number `seq`
    pub fn synthetic(seq: u64) -> Self {
        Self {
            metric: METRICS[(seq % METRICS.len() as u64) as usize].to_string(),
            value: (seq as f64 / 10.0).sin() * 100.0,
            timestamp: Utc::now(),
        }
    }
}

/// Send `records_per_tick` datapoints every `tick` until cancelled or the
/// writer's input closes. Returns the number of datapoints sent.
pub async fn run_producer(
    tx: mpsc::Sender<Vec<Datapoint>>,
    records_per_tick: usize,
    tick: Duration,
    cancel: CancellationToken,
) -> u64 {
    let mut ticker = interval(tick);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut seq = 0u64;

    info!("Producer started: {} records every {:?}", records_per_tick, tick);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let batch: Vec<Datapoint> = (seq..seq + records_per_tick as u64)
                    .map(Datapoint::synthetic)
                    .collect();

                tokio::select! {
                    _ = cancel.cancelled() => break,
                    sent = tx.send(batch) => {
                        if sent.is_err() {
                            warn!("Writer input closed, stopping producer");
                            break;
                        }
                        seq += records_per_tick as u64;
                    }
                }
            }
        }
    }

    info!("Producer stopped after {} records", seq);
    seq
}
