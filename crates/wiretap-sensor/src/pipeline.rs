//! Packet pipeline
//!
//! A dispatcher routes every packet to one of N workers by flow key, so a
//! flow is only ever handled by one worker. Each worker owns one shard of the
//! flow table and runs reassembly, decoding and correlation for its flows,
//! then passes finished transactions through the filter to the publisher.

use crate::session::Session;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use wiretap_core::config::WiretapConfig;
use wiretap_core::filter::{FilterEngine, FilterVerdict};
use wiretap_core::metrics::{add, inc, SharedMetrics};
use wiretap_core::packet::Packet;
use wiretap_core::transaction::Transaction;
use wiretap_correlate::CorrelationConfig;
use wiretap_decode::DecoderRegistry;
use wiretap_export::PublisherHandle;
use wiretap_flows::{Flow, FlowKey, FlowTableConfig, ShardedFlowTable};

/// Where "now" comes from when expiring flows and requests
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockMode {
    /// Wall clock, for live interfaces
    Live,
    /// Newest packet timestamp, for capture file replay
    Replay,
}

#[derive(Debug)]
struct Clock {
    mode: ClockMode,
    newest_ns: AtomicU64,
}

impl Clock {
    fn observe(&self, timestamp_ns: u64) {
        self.newest_ns.fetch_max(timestamp_ns, Ordering::Relaxed);
    }

    fn now_ns(&self) -> u64 {
        let newest = self.newest_ns.load(Ordering::Relaxed);
        match self.mode {
            ClockMode::Replay => newest,
            ClockMode::Live => SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_nanos() as u64)
                .unwrap_or_default()
                .max(newest),
        }
    }
}

/// Pipeline tuning
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub workers: usize,
    pub worker_queue_size: usize,
    pub expire_interval: Duration,
    pub flows: FlowTableConfig,
    pub correlation: CorrelationConfig,
}

impl From<&WiretapConfig> for PipelineConfig {
    fn from(config: &WiretapConfig) -> Self {
        Self {
            workers: config.sensor.workers.max(1),
            worker_queue_size: config.flows.worker_queue_size.max(1),
            expire_interval: Duration::from_millis(config.flows.expire_interval_ms.max(1)),
            flows: FlowTableConfig::from(&config.flows).with_server_ports(
                config
                    .protocols
                    .enabled_ports()
                    .into_iter()
                    .flat_map(|(_, ports)| ports.iter().copied()),
            ),
            correlation: CorrelationConfig::from(&config.correlation),
        }
    }
}

/// State shared by all workers
struct Shared {
    table: ShardedFlowTable<Session>,
    registry: DecoderRegistry,
    correlation: CorrelationConfig,
    filter: FilterEngine,
    publisher: PublisherHandle,
    metrics: SharedMetrics,
    clock: Clock,
}

pub struct Pipeline {
    config: PipelineConfig,
    shared: Arc<Shared>,
}

impl Pipeline {
    pub fn new(
        config: &WiretapConfig,
        clock: ClockMode,
        publisher: PublisherHandle,
        metrics: SharedMetrics,
    ) -> anyhow::Result<Self> {
        let registry = DecoderRegistry::from_settings(&config.protocols);
        if registry.is_empty() {
            anyhow::bail!("No protocol decoder is enabled");
        }
        let filter = FilterEngine::new(&config.filter).map_err(anyhow::Error::msg)?;
        let pipeline_config = PipelineConfig::from(config);

        let shared = Shared {
            table: ShardedFlowTable::new(pipeline_config.flows.clone(), pipeline_config.workers),
            registry,
            correlation: pipeline_config.correlation,
            filter,
            publisher,
            metrics,
            clock: Clock {
                mode: clock,
                newest_ns: AtomicU64::new(0),
            },
        };
        Ok(Self {
            config: pipeline_config,
            shared: Arc::new(shared),
        })
    }

    /// Process packets until `rx` closes, then close every remaining flow
    pub async fn run(self, mut rx: mpsc::Receiver<Packet>) {
        info!(
            workers = self.config.workers,
            protocols = ?DecoderRegistry::protocols().collect::<Vec<_>>(),
            "Pipeline started"
        );

        let mut senders = Vec::with_capacity(self.config.workers);
        let mut workers = Vec::with_capacity(self.config.workers);
        for shard in 0..self.config.workers {
            let (tx, worker_rx) = mpsc::channel(self.config.worker_queue_size);
            senders.push(tx);
            workers.push(tokio::spawn(worker(
                self.shared.clone(),
                shard,
                worker_rx,
                self.config.expire_interval,
            )));
        }

        while let Some(packet) = rx.recv().await {
            self.shared.clock.observe(packet.timestamp_ns);
            let shard = self.shared.table.shard_for(&FlowKey::from_packet(&packet));
            if senders[shard].send(packet).await.is_err() {
                warn!(shard, "Worker stopped unexpectedly");
                break;
            }
        }
        drop(senders);

        for handle in workers {
            if let Err(e) = handle.await {
                warn!("Worker task failed: {}", e);
            }
        }
        info!("Pipeline drained");
    }
}

async fn worker(shared: Arc<Shared>, shard: usize, mut rx: mpsc::Receiver<Packet>, expire_interval: Duration) {
    let mut tick = tokio::time::interval(expire_interval);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    debug!(shard, "Worker started");

    loop {
        let out = tokio::select! {
            packet = rx.recv() => match packet {
                Some(packet) => shared.ingest(shard, packet),
                None => break,
            },
            _ = tick.tick() => shared.expire(shard),
        };
        shared.emit(out).await;
    }

    let out = shared.drain(shard);
    shared.emit(out).await;
    debug!(shard, "Worker stopped");
}

impl Shared {
    fn ingest(&self, shard: usize, packet: Packet) -> Vec<Transaction> {
        let metrics = &self.metrics;
        let mut out = Vec::new();
        let mut table = self.table.lock(shard);

        let Some(ingest) = table.ingest(packet, |info| {
            let decoder = self.registry.for_flow(info);
            if decoder.is_none() {
                inc(&metrics.decode.unclassified_flows);
            }
            Session::new(decoder, self.correlation)
        }) else {
            return out;
        };

        if ingest.opened {
            inc(&metrics.flows.opened);
            inc(&metrics.flows.active);
        }
        if let Some(mut evicted) = ingest.evicted {
            inc(&metrics.flows.evicted);
            metrics.flows.active.fetch_sub(1, Ordering::Relaxed);
            out.extend(self.close_flow(&mut evicted));
        }
        add(&metrics.flows.retransmitted_bytes, ingest.retransmitted as u64);
        add(&metrics.flows.reassembly_loss_bytes, ingest.lost as u64);

        let flow = ingest.flow;
        let info = flow.info();
        for chunk in ingest.chunks {
            out.extend(flow.state.on_chunk(&info, ingest.direction, chunk, metrics));
        }

        if ingest.closing {
            let key = flow.key;
            if let Some(mut closed) = table.remove(&key) {
                inc(&metrics.flows.closed);
                metrics.flows.active.fetch_sub(1, Ordering::Relaxed);
                out.extend(self.close_flow(&mut closed));
            }
        }
        out
    }

    fn expire(&self, shard: usize) -> Vec<Transaction> {
        let now_ns = self.clock.now_ns();
        let mut out = Vec::new();
        let mut table = self.table.lock(shard);

        for mut flow in table.expire(now_ns) {
            inc(&self.metrics.flows.expired);
            self.metrics.flows.active.fetch_sub(1, Ordering::Relaxed);
            out.extend(self.close_flow(&mut flow));
        }
        for flow in table.iter_mut() {
            let info = flow.info();
            out.extend(flow.state.expire(&info, now_ns, &self.metrics));
        }
        out
    }

    fn drain(&self, shard: usize) -> Vec<Transaction> {
        let flows = self.table.lock(shard).drain();
        let mut out = Vec::new();
        for mut flow in flows {
            self.metrics.flows.active.fetch_sub(1, Ordering::Relaxed);
            out.extend(self.close_flow(&mut flow));
        }
        out
    }

    /// Push out parked bytes, then finish the session
    fn close_flow(&self, flow: &mut Flow<Session>) -> Vec<Transaction> {
        let info = flow.info();
        let mut out = Vec::new();
        for (direction, chunk) in flow.flush() {
            out.extend(flow.state.on_chunk(&info, direction, chunk, &self.metrics));
        }
        out.extend(flow.state.close(&info, &self.metrics));
        out
    }

    async fn emit(&self, transactions: Vec<Transaction>) {
        for transaction in transactions {
            if self.filter.evaluate(&transaction) == FilterVerdict::Drop {
                inc(&self.metrics.filter.dropped);
                continue;
            }
            inc(&self.metrics.filter.kept);
            if let Err(closed) = self.publisher.publish(transaction).await {
                warn!(id = %closed.0.id, "Publisher closed, transaction lost");
                inc(&self.metrics.publish.dropped_failed);
            }
        }
    }
}
