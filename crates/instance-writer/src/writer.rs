//! Instance Writer Implementation
//!
//! A single coordinator task owns the ring buffer and all request
//! bookkeeping. It pulls record batches off the input channel, filters and
//! buffers them, and hands batches to concurrently running send tasks. Send
//! tasks only touch atomic metrics, return their vector to the pool, and
//! report completion back over a channel, so the buffer needs no lock.

use std::sync::Arc;

use ring_buffer::RingBuffer;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::pool::{ChunkPool, ChunkReturn};
use crate::{
    InstancePreprocessor, InstanceSink, OverwriteCallback, WriterConfig, WriterError,
    WriterMetrics,
};

/// Everything the caller hands over before `start`
struct Parts<T> {
    input: mpsc::Receiver<Vec<T>>,
    sink: Arc<dyn InstanceSink<T>>,
    preprocessor: Option<InstancePreprocessor<T>>,
    on_overwrite: Option<OverwriteCallback>,
}

enum WriterState<T> {
    /// Configured, not started
    Idle(Parts<T>),
    /// Coordinator task running
    Running(JoinHandle<()>),
    /// Coordinator exited and was joined
    Stopped,
}

/// Buffers records in a circular buffer and sends them out in concurrent
/// batches. Newer records win over older ones when the sink falls behind.
///
/// Nothing happens until [`InstanceWriter::start`] is called.
pub struct InstanceWriter<T> {
    config: WriterConfig,
    metrics: Arc<WriterMetrics>,
    state: WriterState<T>,
}

impl<T> InstanceWriter<T>
where
    T: Send + Sync + 'static,
{
    /// Create a writer reading from an existing channel
    pub fn new<S>(input: mpsc::Receiver<Vec<T>>, config: WriterConfig, sink: S) -> Self
    where
        S: InstanceSink<T> + 'static,
    {
        Self {
            config,
            metrics: Arc::new(WriterMetrics::new()),
            state: WriterState::Idle(Parts {
                input,
                sink: Arc::new(sink),
                preprocessor: None,
                on_overwrite: None,
            }),
        }
    }

    /// Create a writer together with the sender side of its input channel
    pub fn channel<S>(
        config: WriterConfig,
        sink: S,
        input_capacity: usize,
    ) -> (mpsc::Sender<Vec<T>>, Self)
    where
        S: InstanceSink<T> + 'static,
    {
        let (tx, rx) = mpsc::channel(input_capacity.max(1));
        (tx, Self::new(rx, config, sink))
    }

    /// Filter records before they are buffered. Ignored once started.
    pub fn with_preprocessor<F>(mut self, preprocessor: F) -> Self
    where
        F: Fn(&T) -> bool + Send + Sync + 'static,
    {
        if let WriterState::Idle(parts) = &mut self.state {
            parts.preprocessor = Some(Box::new(preprocessor));
        }
        self
    }

    /// Get notified of every overwrite. Ignored once started.
    pub fn with_overwrite_callback<F>(mut self, callback: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        if let WriterState::Idle(parts) = &mut self.state {
            parts.on_overwrite = Some(Box::new(callback));
        }
        self
    }

    /// Spawn the coordinator. Returns immediately.
    ///
    /// Unset config values are resolved to their defaults here and fixed for
    /// the lifetime of the writer. Must be called from a tokio runtime.
    pub fn start(&mut self, cancel: CancellationToken) -> Result<(), WriterError> {
        if !matches!(self.state, WriterState::Idle(_)) {
            return Err(WriterError::AlreadyStarted);
        }

        let config = self.config.resolved();
        let buffer = RingBuffer::new(config.max_buffered)?;

        let WriterState::Idle(parts) = std::mem::replace(&mut self.state, WriterState::Stopped)
        else {
            return Err(WriterError::AlreadyStarted);
        };

        self.config = config;
        let metrics = Arc::clone(&self.metrics);
        let coordinator = Coordinator::new(config, parts, buffer, metrics, cancel);

        info!(
            max_buffered = config.max_buffered,
            max_requests = config.max_requests,
            max_batch_size = config.max_batch_size,
            "Starting instance writer"
        );
        self.state = WriterState::Running(tokio::spawn(coordinator.run()));
        Ok(())
    }

    /// Block until the coordinator has exited.
    ///
    /// The coordinator only exits after cancellation, once buffered input has
    /// been flushed and every in-flight send has completed. Returns
    /// [`WriterError::NotStarted`] right away if `start` was never called.
    pub async fn wait_for_shutdown(&mut self) -> Result<(), WriterError> {
        match std::mem::replace(&mut self.state, WriterState::Stopped) {
            WriterState::Idle(parts) => {
                self.state = WriterState::Idle(parts);
                Err(WriterError::NotStarted)
            }
            WriterState::Running(handle) => handle
                .await
                .map_err(|e| WriterError::Coordinator(e.to_string())),
            WriterState::Stopped => Ok(()),
        }
    }

    /// Check whether the coordinator task is still alive
    pub fn is_running(&self) -> bool {
        match &self.state {
            WriterState::Running(handle) => !handle.is_finished(),
            _ => false,
        }
    }

    /// Effective configuration (resolved once started)
    pub fn config(&self) -> WriterConfig {
        self.config
    }

    /// Shared handle to this writer's metrics
    pub fn metrics(&self) -> Arc<WriterMetrics> {
        Arc::clone(&self.metrics)
    }
}

/// State owned by the coordinator task
struct Coordinator<T> {
    config: WriterConfig,
    input: mpsc::Receiver<Vec<T>>,
    input_closed: bool,
    sink: Arc<dyn InstanceSink<T>>,
    preprocessor: Option<InstancePreprocessor<T>>,
    on_overwrite: Option<OverwriteCallback>,
    buffer: RingBuffer<T>,
    pool: ChunkPool<T>,
    done_tx: mpsc::Sender<u64>,
    done_rx: mpsc::Receiver<u64>,
    /// Send tasks that have not reported completion
    requests_active: usize,
    /// Records left buffered at the last dispatch attempt
    total_waiting: usize,
    metrics: Arc<WriterMetrics>,
    cancel: CancellationToken,
}

impl<T> Coordinator<T>
where
    T: Send + Sync + 'static,
{
    fn new(
        config: WriterConfig,
        parts: Parts<T>,
        buffer: RingBuffer<T>,
        metrics: Arc<WriterMetrics>,
        cancel: CancellationToken,
    ) -> Self {
        // Every active request holds at most one completion, so sends never block.
        let (done_tx, done_rx) = mpsc::channel(config.max_requests);
        metrics.set_max_buffered(buffer.size());

        Self {
            config,
            input: parts.input,
            input_closed: false,
            sink: parts.sink,
            preprocessor: parts.preprocessor,
            on_overwrite: parts.on_overwrite,
            buffer,
            pool: ChunkPool::new(config.max_requests, config.max_batch_size),
            done_tx,
            done_rx,
            requests_active: 0,
            total_waiting: 0,
            metrics,
            cancel,
        }
    }

    /// Main loop. Pulls input until the channel is momentarily empty, then
    /// tries to send what accumulated and blocks on the next event.
    async fn run(mut self) {
        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            if let Some(batch) = self.try_recv_input() {
                self.process_input(batch);
                continue;
            }

            if let Ok(count) = self.done_rx.try_recv() {
                self.handle_request_done(count);
                continue;
            }

            // Input exhausted, send whatever is there
            self.try_to_send_chunk();

            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => break,

                Some(count) = self.done_rx.recv() => self.handle_request_done(count),

                batch = self.input.recv(), if !self.input_closed => match batch {
                    Some(batch) => self.process_input(batch),
                    None => self.mark_input_closed(),
                },
            }
        }

        self.drain_and_flush().await;
    }

    fn try_recv_input(&mut self) -> Option<Vec<T>> {
        if self.input_closed {
            return None;
        }

        match self.input.try_recv() {
            Ok(batch) => Some(batch),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => {
                self.mark_input_closed();
                None
            }
        }
    }

    fn mark_input_closed(&mut self) {
        if !self.input_closed {
            info!("Instance writer input closed, waiting for cancellation");
            self.input_closed = true;
        }
    }

    fn process_input(&mut self, batch: Vec<T>) {
        self.metrics.record_received(batch.len() as u64);

        for record in batch {
            if let Some(preprocessor) = &self.preprocessor {
                if !preprocessor(&record) {
                    self.metrics.record_filtered();
                    continue;
                }
            }

            if self.buffer.add(record) {
                self.metrics.record_overwritten();
                if let Some(on_overwrite) = &self.on_overwrite {
                    on_overwrite();
                }
            }

            // Keep completions moving during large bursts so slots free up
            // before the buffer starts overwriting.
            if let Ok(count) = self.done_rx.try_recv() {
                self.handle_request_done(count);
            }

            if self.buffer.unprocessed_count() >= self.config.max_batch_size {
                self.try_to_send_chunk();
            }
        }

        self.update_gauges();
    }

    /// Send the next batch if a request slot is free
    fn try_to_send_chunk(&mut self) {
        let unprocessed = self.buffer.unprocessed_count();
        assert!(
            unprocessed <= self.buffer.size(),
            "ring buffer holds {} unprocessed records with capacity {}",
            unprocessed,
            self.buffer.size()
        );

        if self.requests_active >= self.config.max_requests {
            // handle_request_done sees the backlog and calls back in here
            self.total_waiting = unprocessed;
            trace!(waiting = unprocessed, "All request slots busy");
            self.update_gauges();
            return;
        }

        if unprocessed == 0 {
            return;
        }

        // Move records out of the buffer so wraparound can't touch them while
        // the send is in progress. Taking also clears the released slots.
        let mut chunk = self.pool.acquire();
        chunk.extend(
            self.buffer
                .next_batch(self.config.max_batch_size)
                .iter_mut()
                .filter_map(Option::take),
        );

        let count = chunk.len() as u64;
        self.metrics.record_dispatched(count);
        self.requests_active += 1;

        let sink = Arc::clone(&self.sink);
        let cancel = self.cancel.clone();
        let mut batch = InFlightBatch {
            chunk,
            count,
            returner: self.pool.returner(),
            done: self.done_tx.clone(),
            metrics: Arc::clone(&self.metrics),
            settled: false,
        };

        tokio::spawn(async move {
            match sink.send(cancel, &batch.chunk).await {
                Ok(()) => batch.metrics.record_sent(count),
                Err(e) => {
                    warn!("Failed to send batch of {} instances: {}", count, e);
                    batch.metrics.record_failed(count);
                }
            }
            batch.settled = true;
        });

        self.total_waiting = self.buffer.unprocessed_count();
        self.update_gauges();
        debug!(
            batch = count,
            active = self.requests_active,
            waiting = self.total_waiting,
            "Dispatched batch"
        );
    }

    fn handle_request_done(&mut self, count: u64) {
        self.requests_active = self.requests_active.saturating_sub(1);
        self.metrics.record_completed(count);
        debug!(batch = count, active = self.requests_active, "Batch completed");

        if self.total_waiting > 0 {
            self.try_to_send_chunk();
        } else {
            self.update_gauges();
        }
    }

    /// Shutdown path: take whatever input is still queued, send it, and wait
    /// for every outstanding request.
    async fn drain_and_flush(&mut self) {
        info!("Instance writer shutting down, draining input");

        while let Some(batch) = self.try_recv_input() {
            self.process_input(batch);
        }
        self.try_to_send_chunk();

        while self.requests_active > 0 {
            match self.done_rx.recv().await {
                Some(count) => self.handle_request_done(count),
                None => break,
            }
        }

        self.update_gauges();
        let snapshot = self.metrics.snapshot();
        info!(
            received = snapshot.received,
            sent = snapshot.sent,
            failed = snapshot.failed_to_send,
            overwritten = snapshot.overwritten,
            "Instance writer stopped"
        );
    }

    fn update_gauges(&self) {
        self.metrics.set_gauges(
            self.buffer.unprocessed_count(),
            self.total_waiting,
            self.requests_active,
        );
    }
}

/// One dispatched batch, owned by its send task.
///
/// Dropping it hands the vector back to the pool and reports completion to
/// the coordinator. This also runs when the sink panics, so the request slot
/// is always freed.
struct InFlightBatch<T> {
    chunk: Vec<T>,
    count: u64,
    returner: ChunkReturn<T>,
    done: mpsc::Sender<u64>,
    metrics: Arc<WriterMetrics>,
    /// Sink returned and the outcome was counted
    settled: bool,
}

impl<T> Drop for InFlightBatch<T> {
    fn drop(&mut self) {
        if !self.settled {
            error!("Sink panicked while sending batch of {} instances", self.count);
            self.metrics.record_failed(self.count);
        }

        self.returner.release(std::mem::take(&mut self.chunk));
        // Sized to max_requests and each active request reports once, so
        // there is always room.
        let _ = self.done.try_send(self.count);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SinkError;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::sync::Semaphore;

    /// Sink that records every batch, optionally gated or failing
    struct RecordingSink<T> {
        batches: Mutex<Vec<Vec<T>>>,
        gate: Option<Arc<Semaphore>>,
        delay: Option<Duration>,
        fail: bool,
        active: AtomicUsize,
        max_active: AtomicUsize,
    }

    impl<T> RecordingSink<T> {
        fn new() -> Self {
            Self {
                batches: Mutex::new(Vec::new()),
                gate: None,
                delay: None,
                fail: false,
                active: AtomicUsize::new(0),
                max_active: AtomicUsize::new(0),
            }
        }

        fn gated(gate: Arc<Semaphore>) -> Self {
            Self {
                gate: Some(gate),
                ..Self::new()
            }
        }

        fn batches(&self) -> Vec<Vec<T>>
        where
            T: Clone,
        {
            self.batches.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl<T> InstanceSink<T> for RecordingSink<T>
    where
        T: Clone + Send + Sync + 'static,
    {
        async fn send(&self, _cancel: CancellationToken, batch: &[T]) -> Result<(), SinkError> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(now, Ordering::SeqCst);

            if let Some(gate) = &self.gate {
                gate.acquire()
                    .await
                    .map_err(|_| SinkError::Cancelled)?
                    .forget();
            }
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }

            self.batches.lock().unwrap().push(batch.to_vec());
            self.active.fetch_sub(1, Ordering::SeqCst);

            if self.fail {
                Err(SinkError::Transport("endpoint unavailable".into()))
            } else {
                Ok(())
            }
        }
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    fn config(max_buffered: usize, max_requests: usize, max_batch_size: usize) -> WriterConfig {
        WriterConfig::unset()
            .with_max_buffered(max_buffered)
            .with_max_requests(max_requests)
            .with_max_batch_size(max_batch_size)
    }

    #[tokio::test]
    async fn test_wait_before_start_fails() {
        let sink = Arc::new(RecordingSink::<u32>::new());
        let (_tx, mut writer) = InstanceWriter::<u32>::channel(WriterConfig::default(), sink, 8);

        let result = writer.wait_for_shutdown().await;
        assert!(matches!(result, Err(WriterError::NotStarted)));
        assert!(!writer.is_running());
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let sink = Arc::new(RecordingSink::<u32>::new());
        let (_tx, mut writer) = InstanceWriter::<u32>::channel(WriterConfig::default(), sink, 8);
        let cancel = CancellationToken::new();

        writer.start(cancel.clone()).unwrap();
        assert!(matches!(
            writer.start(cancel.clone()),
            Err(WriterError::AlreadyStarted)
        ));

        cancel.cancel();
        writer.wait_for_shutdown().await.unwrap();
        // Already joined, returns straight away
        writer.wait_for_shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_unset_config_resolves_on_start() {
        let sink = Arc::new(RecordingSink::<u32>::new());
        let (_tx, mut writer) = InstanceWriter::<u32>::channel(WriterConfig::unset(), sink, 8);
        let cancel = CancellationToken::new();

        writer.start(cancel.clone()).unwrap();
        assert_eq!(writer.config(), WriterConfig::default());
        assert_eq!(writer.metrics().snapshot().max_buffered, 10_000);

        cancel.cancel();
        writer.wait_for_shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_sends_in_size_limited_batches() {
        let sink = Arc::new(RecordingSink::new());
        let (tx, mut writer) = InstanceWriter::<u32>::channel(config(100, 2, 3), Arc::clone(&sink), 8);
        let metrics = writer.metrics();
        let cancel = CancellationToken::new();
        writer.start(cancel.clone()).unwrap();

        tx.send((0..7u32).collect()).await.unwrap();
        wait_until(|| metrics.sent() == 7).await;

        cancel.cancel();
        writer.wait_for_shutdown().await.unwrap();

        let batches = sink.batches();
        assert!(batches.iter().all(|b| !b.is_empty() && b.len() <= 3));
        let mut flat: Vec<u32> = batches.into_iter().flatten().collect();
        flat.sort_unstable();
        assert_eq!(flat, (0..7).collect::<Vec<_>>());
        assert_eq!(metrics.snapshot().received, 7);
    }

    #[tokio::test]
    async fn test_overwrite_keeps_newest_records() {
        let gate = Arc::new(Semaphore::new(0));
        let sink = Arc::new(RecordingSink::gated(Arc::clone(&gate)));
        let overwrites = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&overwrites);

        let (tx, writer) = InstanceWriter::<char>::channel(config(3, 1, 3), Arc::clone(&sink), 8);
        let mut writer = writer.with_overwrite_callback(move || {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        let metrics = writer.metrics();
        let cancel = CancellationToken::new();
        writer.start(cancel.clone()).unwrap();

        // Fills the buffer and goes straight out, then blocks in the sink
        tx.send(vec!['A', 'B', 'C']).await.unwrap();
        wait_until(|| metrics.in_flight() == 3).await;

        // D, E, F wait for the busy slot; G overwrites D
        tx.send(vec!['D', 'E', 'F', 'G']).await.unwrap();
        wait_until(|| metrics.snapshot().overwritten == 1).await;
        assert_eq!(overwrites.load(Ordering::SeqCst), 1);

        gate.add_permits(3);
        wait_until(|| metrics.sent() == 6).await;

        cancel.cancel();
        writer.wait_for_shutdown().await.unwrap();

        let flat: Vec<char> = sink.batches().into_iter().flatten().collect();
        assert_eq!(flat, vec!['A', 'B', 'C', 'E', 'F', 'G']);
        assert_eq!(sink.max_active.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_batches_are_counted_not_retried() {
        let sink = Arc::new(RecordingSink {
            fail: true,
            ..RecordingSink::new()
        });
        let (tx, mut writer) = InstanceWriter::<u32>::channel(config(100, 2, 10), Arc::clone(&sink), 8);
        let metrics = writer.metrics();
        let cancel = CancellationToken::new();
        writer.start(cancel.clone()).unwrap();

        tx.send((0..5u32).collect()).await.unwrap();
        wait_until(|| metrics.failed_to_send() == 5).await;
        assert_eq!(metrics.sent(), 0);
        assert!(writer.is_running());

        // Still accepting input after the failure
        tx.send(vec![5, 6, 7]).await.unwrap();
        wait_until(|| metrics.failed_to_send() == 8).await;

        cancel.cancel();
        writer.wait_for_shutdown().await.unwrap();

        assert_eq!(sink.batches(), vec![vec![0, 1, 2, 3, 4], vec![5, 6, 7]]);
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.sent, 0);
        assert_eq!(snapshot.in_flight, 0);
    }

    #[tokio::test]
    async fn test_shutdown_flushes_in_flight_and_buffered() {
        let gate = Arc::new(Semaphore::new(0));
        let sink = Arc::new(RecordingSink::gated(Arc::clone(&gate)));
        let (tx, mut writer) = InstanceWriter::<u32>::channel(config(10, 2, 2), Arc::clone(&sink), 8);
        let metrics = writer.metrics();
        let cancel = CancellationToken::new();
        writer.start(cancel.clone()).unwrap();

        tx.send(vec![1u32, 2]).await.unwrap();
        tx.send(vec![3, 4]).await.unwrap();
        tx.send(vec![5, 6]).await.unwrap();
        wait_until(|| {
            let snap = metrics.snapshot();
            snap.in_flight == 4 && snap.waiting == 2
        })
        .await;

        cancel.cancel();
        gate.add_permits(3);
        writer.wait_for_shutdown().await.unwrap();

        let mut batches = sink.batches();
        batches.sort();
        assert_eq!(batches, vec![vec![1, 2], vec![3, 4], vec![5, 6]]);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.sent, 6);
        assert_eq!(snapshot.in_flight, 0);
        assert_eq!(snapshot.requests_active, 0);
        assert_eq!(snapshot.buffered, 0);
    }

    #[tokio::test]
    async fn test_shutdown_drains_queued_input() {
        let sink = Arc::new(RecordingSink::new());
        let (tx, mut writer) = InstanceWriter::<u32>::channel(config(100, 1, 4), Arc::clone(&sink), 8);
        let metrics = writer.metrics();
        let cancel = CancellationToken::new();

        // Queued before the coordinator ever runs
        tx.send(vec![1u32, 2, 3]).await.unwrap();
        tx.send(vec![4, 5, 6]).await.unwrap();
        cancel.cancel();

        writer.start(cancel).unwrap();
        writer.wait_for_shutdown().await.unwrap();

        let flat: Vec<u32> = sink.batches().into_iter().flatten().collect();
        assert_eq!(flat, vec![1, 2, 3, 4, 5, 6]);
        assert_eq!(metrics.sent(), 6);
    }

    #[tokio::test]
    async fn test_backpressure_resolves_on_completion() {
        let gate = Arc::new(Semaphore::new(0));
        let sink = Arc::new(RecordingSink::gated(Arc::clone(&gate)));
        let (tx, mut writer) = InstanceWriter::<u32>::channel(config(10, 1, 2), Arc::clone(&sink), 8);
        let metrics = writer.metrics();
        let cancel = CancellationToken::new();
        writer.start(cancel.clone()).unwrap();

        tx.send(vec![1u32, 2, 3, 4]).await.unwrap();
        wait_until(|| {
            let snap = metrics.snapshot();
            snap.requests_active == 1 && snap.waiting == 2
        })
        .await;

        // No new input: the completion alone must push out the backlog
        gate.add_permits(2);
        wait_until(|| metrics.sent() == 4).await;
        assert_eq!(sink.batches(), vec![vec![1, 2], vec![3, 4]]);

        cancel.cancel();
        writer.wait_for_shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_sends_never_exceed_limit() {
        let sink = Arc::new(RecordingSink {
            delay: Some(Duration::from_millis(3)),
            ..RecordingSink::new()
        });
        let (tx, mut writer) = InstanceWriter::<u32>::channel(config(1_000, 3, 5), Arc::clone(&sink), 64);
        let metrics = writer.metrics();
        let cancel = CancellationToken::new();
        writer.start(cancel.clone()).unwrap();

        for chunk in 0..20u32 {
            tx.send((chunk * 10..chunk * 10 + 10).collect()).await.unwrap();
        }
        wait_until(|| metrics.sent() == 200).await;

        cancel.cancel();
        writer.wait_for_shutdown().await.unwrap();

        let max_active = sink.max_active.load(Ordering::SeqCst);
        assert!(max_active >= 1 && max_active <= 3, "max_active = {max_active}");
        let mut flat: Vec<u32> = sink.batches().into_iter().flatten().collect();
        flat.sort_unstable();
        assert_eq!(flat, (0..200).collect::<Vec<_>>());
    }

    #[derive(Debug, Clone, PartialEq)]
    struct Reading {
        source: &'static str,
        value: u32,
    }

    #[tokio::test]
    async fn test_preprocessor_drops_records() {
        let sink = Arc::new(RecordingSink::new());
        let (tx, writer) = InstanceWriter::<Reading>::channel(config(100, 2, 50), Arc::clone(&sink), 8);
        let mut writer = writer.with_preprocessor(|r: &Reading| r.source != "debug");
        let metrics = writer.metrics();
        let cancel = CancellationToken::new();
        writer.start(cancel.clone()).unwrap();

        let readings: Vec<Reading> = (0..10)
            .map(|value| Reading {
                source: if value % 3 == 0 { "debug" } else { "engine" },
                value,
            })
            .collect();
        tx.send(readings).await.unwrap();
        wait_until(|| metrics.sent() == 6).await;

        cancel.cancel();
        writer.wait_for_shutdown().await.unwrap();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.received, 10);
        assert_eq!(snapshot.filtered_out, 4);
        let delivered: Vec<Reading> = sink.batches().into_iter().flatten().collect();
        assert_eq!(delivered.len(), 6);
        assert!(delivered.iter().all(|r| r.source == "engine"));
    }

    #[tokio::test]
    async fn test_closed_input_runs_until_cancelled() {
        let sink = Arc::new(RecordingSink::new());
        let (tx, mut writer) = InstanceWriter::<u32>::channel(config(100, 2, 10), Arc::clone(&sink), 8);
        let metrics = writer.metrics();
        let cancel = CancellationToken::new();
        writer.start(cancel.clone()).unwrap();

        tx.send(vec![1u32, 2]).await.unwrap();
        drop(tx);
        wait_until(|| metrics.sent() == 2).await;

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(writer.is_running());

        cancel.cancel();
        writer.wait_for_shutdown().await.unwrap();
        assert!(!writer.is_running());
    }

    #[tokio::test]
    async fn test_dispatch_with_empty_buffer_is_noop() {
        let sink = Arc::new(RecordingSink::<u32>::new());
        let (_tx, rx) = mpsc::channel(1);
        let config = config(8, 2, 4).resolved();
        let metrics = Arc::new(WriterMetrics::new());
        let parts = Parts {
            input: rx,
            sink: Arc::clone(&sink) as Arc<dyn InstanceSink<u32>>,
            preprocessor: None,
            on_overwrite: None,
        };
        let mut coordinator = Coordinator::new(
            config,
            parts,
            RingBuffer::new(8).unwrap(),
            Arc::clone(&metrics),
            CancellationToken::new(),
        );

        let before = metrics.snapshot();
        coordinator.try_to_send_chunk();
        tokio::task::yield_now().await;

        assert_eq!(metrics.snapshot(), before);
        assert_eq!(coordinator.requests_active, 0);
        assert_eq!(coordinator.total_waiting, 0);
        assert!(sink.batches().is_empty());
    }

    #[tokio::test]
    async fn test_wrapped_backlog_is_sent_in_order() {
        let gate = Arc::new(Semaphore::new(0));
        let sink = Arc::new(RecordingSink::gated(Arc::clone(&gate)));
        let (tx, mut writer) =
            InstanceWriter::<u32>::channel(config(4, 1, 3), Arc::clone(&sink), 8);
        let metrics = writer.metrics();
        let cancel = CancellationToken::new();
        writer.start(cancel.clone()).unwrap();

        // Slots 0..3 go out and block in the sink
        tx.send(vec![1u32, 2, 3]).await.unwrap();
        wait_until(|| metrics.in_flight() == 3).await;

        // 4 lands in the last slot, 5 and 6 wrap to the front
        tx.send(vec![4, 5, 6]).await.unwrap();
        wait_until(|| {
            let snap = metrics.snapshot();
            snap.requests_active == 1 && snap.waiting == 3
        })
        .await;

        gate.add_permits(3);
        wait_until(|| metrics.sent() == 6).await;

        cancel.cancel();
        writer.wait_for_shutdown().await.unwrap();

        assert_eq!(sink.batches(), vec![vec![1, 2, 3], vec![4], vec![5, 6]]);
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.overwritten, 0);
        assert_eq!(snapshot.in_flight, 0);
    }

    struct PanickingSink;

    #[async_trait]
    impl InstanceSink<u32> for PanickingSink {
        async fn send(
            &self,
            _cancel: CancellationToken,
            _batch: &[u32],
        ) -> Result<(), SinkError> {
            panic!("sink exploded");
        }
    }

    #[tokio::test]
    async fn test_panicking_sink_frees_request_slot() {
        let (tx, mut writer) = InstanceWriter::<u32>::channel(config(10, 1, 2), PanickingSink, 8);
        let metrics = writer.metrics();
        let cancel = CancellationToken::new();
        writer.start(cancel.clone()).unwrap();

        tx.send(vec![1u32, 2]).await.unwrap();
        wait_until(|| metrics.failed_to_send() == 2).await;

        // The only slot must be usable again
        tx.send(vec![3, 4]).await.unwrap();
        wait_until(|| metrics.failed_to_send() == 4).await;

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(2), writer.wait_for_shutdown())
            .await
            .expect("shutdown hung after sink panic")
            .unwrap();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.sent, 0);
        assert_eq!(snapshot.in_flight, 0);
        assert_eq!(snapshot.requests_active, 0);
        assert_eq!(snapshot.waiting, 0);
    }
}
