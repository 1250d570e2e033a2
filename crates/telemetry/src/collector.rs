//! The collector's two background loops: a flusher draining the queue into
//! the emitter, and a health snapshotter feeding `worker_health` records back
//! into the queue.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::emitter::JsonLinesEmitter;
use crate::queue::BoundedQueue;
use crate::record::{Record, WorkerHealthRecord, FORMAT_VERSION};

/// Live gauges sampled into each health snapshot.
pub trait HealthProvider: Send + Sync {
    fn active_vus(&self) -> u32;
    fn active_sessions(&self) -> u32;
    fn in_flight_ops(&self) -> u32;
}

#[derive(Debug, Clone)]
pub struct CollectorConfig {
    pub worker_id: String,
    pub queue_size: usize,
    pub batch_size: usize,
    pub flush_interval: Duration,
    pub health_snapshot_interval: Duration,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            worker_id: String::new(),
            queue_size: 0, // queue default
            batch_size: 64,
            flush_interval: Duration::from_millis(500),
            health_snapshot_interval: Duration::from_secs(5),
        }
    }
}

pub struct Collector {
    queue: Arc<BoundedQueue>,
    cancel: CancellationToken,
    flusher: JoinHandle<()>,
    snapshotter: JoinHandle<()>,
}

impl Collector {
    /// Start both loops. The emitter moves into the flusher.
    pub fn start(
        config: CollectorConfig,
        emitter: JsonLinesEmitter,
        health: Arc<dyn HealthProvider>,
    ) -> Self {
        let queue = Arc::new(BoundedQueue::new(config.queue_size));
        let cancel = CancellationToken::new();

        let flusher = tokio::spawn(flusher_loop(
            queue.clone(),
            emitter,
            config.batch_size.max(1),
            config.flush_interval,
            cancel.clone(),
        ));
        let snapshotter = tokio::spawn(snapshot_loop(
            queue.clone(),
            health,
            config.worker_id.clone(),
            config.health_snapshot_interval,
            cancel.clone(),
        ));

        Self {
            queue,
            cancel,
            flusher,
            snapshotter,
        }
    }

    /// Where producers hand records in. Ownership transfers on enqueue.
    pub fn queue(&self) -> Arc<BoundedQueue> {
        self.queue.clone()
    }

    /// Stop both loops, then drain whatever is still queued.
    pub async fn stop(self) {
        self.cancel.cancel();
        self.queue.close();
        let _ = self.snapshotter.await;
        let _ = self.flusher.await;
    }
}

async fn flusher_loop(
    queue: Arc<BoundedQueue>,
    mut emitter: JsonLinesEmitter,
    batch_size: usize,
    flush_interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(flush_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = cancel.cancelled() => break,
        }
        emit_batch(&queue, &mut emitter, batch_size);
    }

    // Drain: everything still queued goes out before we return.
    loop {
        let batch = queue.dequeue_batch(batch_size);
        if batch.is_empty() {
            break;
        }
        for record in batch {
            if let Err(err) = emitter.emit(&record.payload) {
                tracing::warn!(error = %err, "failed to emit telemetry record during drain");
            }
        }
    }
    if let Err(err) = emitter.flush() {
        tracing::warn!(error = %err, "failed to flush telemetry on shutdown");
    }
}

fn emit_batch(queue: &BoundedQueue, emitter: &mut JsonLinesEmitter, batch_size: usize) {
    let batch = queue.dequeue_batch(batch_size);
    if batch.is_empty() {
        return;
    }
    let count = batch.len();
    for record in batch {
        if let Err(err) = emitter.emit(&record.payload) {
            tracing::warn!(error = %err, "failed to emit telemetry record");
        }
    }
    if let Err(err) = emitter.flush() {
        tracing::warn!(error = %err, "failed to flush telemetry batch");
    }
    tracing::trace!(records = count, "telemetry batch flushed");
}

async fn snapshot_loop(
    queue: Arc<BoundedQueue>,
    health: Arc<dyn HealthProvider>,
    worker_id: String,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The immediate first tick would snapshot an empty worker.
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = cancel.cancelled() => return,
        }
        let (dropped_tier1, dropped_tier2) = queue.take_drop_counts();
        let record = WorkerHealthRecord {
            format: FORMAT_VERSION.into(),
            ts: chrono::Utc::now(),
            worker_id: worker_id.clone(),
            active_vus: health.active_vus(),
            active_sessions: health.active_sessions(),
            in_flight_ops: health.in_flight_ops(),
            rss_bytes: process_rss_bytes(),
            queue_depth: queue.len(),
            queue_capacity: queue.capacity(),
            dropped_tier1,
            dropped_tier2,
        };
        queue.enqueue(Record::worker_health(record));
    }
}

/// Resident set size. Linux reads `/proc/self/statm`; elsewhere reports 0.
#[cfg(target_os = "linux")]
fn process_rss_bytes() -> u64 {
    let Ok(statm) = std::fs::read_to_string("/proc/self/statm") else {
        return 0;
    };
    let resident_pages: u64 = statm
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or(0);
    resident_pages * 4096
}

#[cfg(not(target_os = "linux"))]
fn process_rss_bytes() -> u64 {
    0
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::Mutex;

    use crate::record::tests::sample_result;
    use crate::record::TelemetryRecord;

    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl SharedBuf {
        fn lines(&self) -> Vec<serde_json::Value> {
            let bytes = self.0.lock().unwrap().clone();
            String::from_utf8(bytes)
                .unwrap()
                .lines()
                .map(|l| serde_json::from_str(l).unwrap())
                .collect()
        }
    }

    struct StaticHealth;

    impl HealthProvider for StaticHealth {
        fn active_vus(&self) -> u32 {
            7
        }
        fn active_sessions(&self) -> u32 {
            4
        }
        fn in_flight_ops(&self) -> u32 {
            2
        }
    }

    fn config() -> CollectorConfig {
        CollectorConfig {
            worker_id: "wkr_00000001".into(),
            queue_size: 100,
            batch_size: 16,
            flush_interval: Duration::from_millis(50),
            health_snapshot_interval: Duration::from_millis(200),
            ..CollectorConfig::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn flusher_emits_queued_records() {
        let buf = SharedBuf::default();
        let emitter = JsonLinesEmitter::new(Box::new(buf.clone()));
        let collector = Collector::start(config(), emitter, Arc::new(StaticHealth));

        let queue = collector.queue();
        queue.enqueue(Record::op_log(sample_result()));
        queue.enqueue(Record::op_log(sample_result()));

        tokio::time::sleep(Duration::from_millis(120)).await;
        collector.stop().await;

        let lines = buf.lines();
        assert!(lines.iter().filter(|l| l["type"] == "op_log").count() >= 2);
    }

    #[tokio::test(start_paused = true)]
    async fn health_snapshots_carry_gauges_and_drop_deltas() {
        let buf = SharedBuf::default();
        let emitter = JsonLinesEmitter::new(Box::new(buf.clone()));
        let collector = Collector::start(config(), emitter, Arc::new(StaticHealth));

        tokio::time::sleep(Duration::from_millis(450)).await;
        collector.stop().await;

        let lines = buf.lines();
        let health: Vec<_> = lines
            .iter()
            .filter(|l| l["type"] == "worker_health")
            .collect();
        assert!(!health.is_empty());
        assert_eq!(health[0]["active_vus"], 7);
        assert_eq!(health[0]["active_sessions"], 4);
        assert_eq!(health[0]["in_flight_ops"], 2);
        assert_eq!(health[0]["worker_id"], "wkr_00000001");
    }

    #[tokio::test(start_paused = true)]
    async fn stop_drains_pending_records() {
        let buf = SharedBuf::default();
        let emitter = JsonLinesEmitter::new(Box::new(buf.clone()));
        // Long flush interval: records only reach the sink via the drain.
        let collector = Collector::start(
            CollectorConfig {
                flush_interval: Duration::from_secs(3600),
                health_snapshot_interval: Duration::from_secs(3600),
                ..config()
            },
            emitter,
            Arc::new(StaticHealth),
        );

        let queue = collector.queue();
        for _ in 0..5 {
            queue.enqueue(Record::op_log(sample_result()));
        }
        collector.stop().await;

        let count = buf
            .lines()
            .iter()
            .filter(|l| l["type"] == "op_log")
            .count();
        assert_eq!(count, 5);
    }

    #[tokio::test]
    async fn records_flow_fifo_through_the_pipeline() {
        let buf = SharedBuf::default();
        let emitter = JsonLinesEmitter::new(Box::new(buf.clone()));
        let collector = Collector::start(
            CollectorConfig {
                flush_interval: Duration::from_secs(3600),
                health_snapshot_interval: Duration::from_secs(3600),
                ..config()
            },
            emitter,
            Arc::new(StaticHealth),
        );

        let queue = collector.queue();
        for i in 0..4 {
            let mut result = sample_result();
            result.correlation.op_id = Some(format!("op-{i}"));
            queue.enqueue(Record {
                tier: crate::record::Tier::Operation,
                payload: TelemetryRecord::OpLog(crate::record::OpLogRecord::new(result)),
            });
        }
        collector.stop().await;

        let op_ids: Vec<String> = buf
            .lines()
            .iter()
            .filter(|l| l["type"] == "op_log")
            .map(|l| l["op_id"].as_str().unwrap().to_owned())
            .collect();
        assert_eq!(op_ids, vec!["op-0", "op-1", "op-2", "op-3"]);
    }
}
