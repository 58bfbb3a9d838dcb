//! Pipeline metrics for the Wiretap sensor
//!
//! Every stage owns a group of relaxed atomic counters. The collector is
//! shared as an `Arc` and snapshotted to JSON for the periodic stats log.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Global metrics collector
#[derive(Debug)]
pub struct MetricsCollector {
    /// When the collector was started
    start_time: Instant,
    pub capture: CaptureMetrics,
    pub flows: FlowMetrics,
    pub decode: DecodeMetrics,
    pub correlate: CorrelateMetrics,
    pub filter: FilterMetrics,
    pub publish: PublishMetrics,
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            capture: CaptureMetrics::default(),
            flows: FlowMetrics::default(),
            decode: DecodeMetrics::default(),
            correlate: CorrelateMetrics::default(),
            filter: FilterMetrics::default(),
            publish: PublishMetrics::default(),
        }
    }

    /// Get uptime in seconds
    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Export metrics as JSON
    pub fn to_json(&self) -> serde_json::Value {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        serde_json::json!({
            "uptime_seconds": self.uptime_seconds(),
            "capture": {
                "packets_seen": get(&self.capture.packets_seen),
                "packets_dropped": get(&self.capture.packets_dropped),
                "packets_dropped_kernel": get(&self.capture.packets_dropped_kernel),
                "packets_malformed": get(&self.capture.packets_malformed),
                "packets_ignored": get(&self.capture.packets_ignored),
                "bytes": get(&self.capture.bytes),
            },
            "flows": {
                "opened": get(&self.flows.opened),
                "closed": get(&self.flows.closed),
                "expired": get(&self.flows.expired),
                "evicted": get(&self.flows.evicted),
                "active": get(&self.flows.active),
                "reassembly_loss_bytes": get(&self.flows.reassembly_loss_bytes),
                "retransmitted_bytes": get(&self.flows.retransmitted_bytes),
            },
            "decode": {
                "messages": get(&self.decode.messages),
                "errors": get(&self.decode.errors),
                "discarded_bytes": get(&self.decode.discarded_bytes),
                "unclassified_flows": get(&self.decode.unclassified_flows),
            },
            "correlate": {
                "transactions": get(&self.correlate.transactions),
                "no_reply": get(&self.correlate.no_reply),
                "one_way": get(&self.correlate.one_way),
                "unmatched_responses": get(&self.correlate.unmatched_responses),
            },
            "filter": {
                "kept": get(&self.filter.kept),
                "dropped": get(&self.filter.dropped),
            },
            "publish": {
                "queued": get(&self.publish.queued),
                "published": get(&self.publish.published),
                "batches": get(&self.publish.batches),
                "failures": get(&self.publish.failures),
                "retries": get(&self.publish.retries),
                "spooled": get(&self.publish.spooled),
                "replayed": get(&self.publish.replayed),
                "dropped_overflow": get(&self.publish.dropped_overflow),
                "dropped_failed": get(&self.publish.dropped_failed),
                "item_errors": get(&self.publish.item_errors),
            },
        })
    }
}

/// Packet source counters
#[derive(Debug, Default)]
pub struct CaptureMetrics {
    pub packets_seen: AtomicU64,
    /// Lost before reaching the pipeline: queue full, or dropped by the
    /// kernel or interface
    pub packets_dropped: AtomicU64,
    /// Share of `packets_dropped` reported by libpcap
    pub packets_dropped_kernel: AtomicU64,
    pub packets_malformed: AtomicU64,
    /// Frames without a TCP/UDP payload we track (ARP, ICMP, ...)
    pub packets_ignored: AtomicU64,
    pub bytes: AtomicU64,
}

/// Flow table counters
#[derive(Debug, Default)]
pub struct FlowMetrics {
    pub opened: AtomicU64,
    /// Closed by FIN/RST
    pub closed: AtomicU64,
    /// Closed by idle timeout
    pub expired: AtomicU64,
    /// Evicted because the table was full
    pub evicted: AtomicU64,
    /// Currently tracked (gauge)
    pub active: AtomicU64,
    /// Bytes dropped outside the reorder window or skipped at a gap
    pub reassembly_loss_bytes: AtomicU64,
    pub retransmitted_bytes: AtomicU64,
}

/// Decoder counters
#[derive(Debug, Default)]
pub struct DecodeMetrics {
    pub messages: AtomicU64,
    pub errors: AtomicU64,
    pub discarded_bytes: AtomicU64,
    /// Flows on ports no decoder claims
    pub unclassified_flows: AtomicU64,
}

/// Correlator counters
#[derive(Debug, Default)]
pub struct CorrelateMetrics {
    /// All transactions emitted, whatever their status
    pub transactions: AtomicU64,
    pub no_reply: AtomicU64,
    pub one_way: AtomicU64,
    pub unmatched_responses: AtomicU64,
}

/// Filter counters
#[derive(Debug, Default)]
pub struct FilterMetrics {
    pub kept: AtomicU64,
    pub dropped: AtomicU64,
}

/// Publisher counters
#[derive(Debug, Default)]
pub struct PublishMetrics {
    pub queued: AtomicU64,
    pub published: AtomicU64,
    pub batches: AtomicU64,
    pub failures: AtomicU64,
    pub retries: AtomicU64,
    pub spooled: AtomicU64,
    pub replayed: AtomicU64,
    pub dropped_overflow: AtomicU64,
    pub dropped_failed: AtomicU64,
    /// Per-document errors reported inside an accepted bulk response
    pub item_errors: AtomicU64,
}

/// Increment a counter by one
#[inline]
pub fn inc(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// Increment a counter by `n`
#[inline]
pub fn add(counter: &AtomicU64, n: u64) {
    counter.fetch_add(n, Ordering::Relaxed);
}

/// Shared metrics instance
pub type SharedMetrics = Arc<MetricsCollector>;

/// Create a new shared metrics collector
pub fn create_metrics() -> SharedMetrics {
    Arc::new(MetricsCollector::new())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_snapshot() {
        let metrics = create_metrics();
        inc(&metrics.capture.packets_seen);
        add(&metrics.capture.bytes, 1500);
        inc(&metrics.correlate.no_reply);
        add(&metrics.publish.published, 3);

        let json = metrics.to_json();
        assert_eq!(json["capture"]["packets_seen"], 1);
        assert_eq!(json["capture"]["bytes"], 1500);
        assert_eq!(json["correlate"]["no_reply"], 1);
        assert_eq!(json["publish"]["published"], 3);
        assert_eq!(json["flows"]["evicted"], 0);
    }
}
