//! Packet sources
//!
//! Capture plugins push decoded `Packet`s into the pipeline channel:
//!
//! - [`PcapCapture`]: live interface or capture file via libpcap
//! - [`TrafficGenerator`]: synthetic conversations for demos and tests

use thiserror::Error;
use tokio::sync::mpsc;
use tracing::info;
use wiretap_core::packet::Packet;
use wiretap_core::plugins::{CapturePlugin, CaptureStats, PluginError, PluginResult};

pub mod filter;
pub mod frame;
pub mod generator;
pub mod pcap_source;

pub use generator::{GeneratorConfig, TrafficGenerator};
pub use pcap_source::{list_devices, CaptureSource, DeviceInfo, PcapCapture, PcapConfig};

/// Capture errors
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("No capture source configured (set an interface or a file)")]
    NoSource,

    #[error("Failed to open {target}: {source}")]
    Open {
        target: String,
        #[source]
        source: pcap::Error,
    },

    #[error("Invalid BPF filter '{filter}': {source}")]
    Filter {
        filter: String,
        #[source]
        source: pcap::Error,
    },

    #[error("Unsupported link type {0}")]
    UnsupportedLink(i32),

    #[error("Failed to list devices: {0}")]
    DeviceList(#[source] pcap::Error),
}

impl From<CaptureError> for PluginError {
    fn from(err: CaptureError) -> Self {
        PluginError::InitializationFailed(err.to_string())
    }
}

/// Runs a set of capture plugins into one channel
#[derive(Default)]
pub struct CaptureManager {
    plugins: Vec<Box<dyn CapturePlugin>>,
}

impl CaptureManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_plugin(&mut self, plugin: Box<dyn CapturePlugin>) {
        self.plugins.push(plugin);
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    /// Start every plugin. The channel closes once all of them have finished.
    pub async fn start(&mut self, tx: mpsc::Sender<Packet>) -> PluginResult<()> {
        for plugin in &mut self.plugins {
            plugin.init()?;
            plugin.start(tx.clone()).await?;
            info!(plugin = plugin.name(), "Capture plugin started");
        }
        Ok(())
    }

    pub async fn stop(&mut self) -> PluginResult<()> {
        for plugin in &mut self.plugins {
            plugin.stop().await?;
            plugin.shutdown()?;
        }
        Ok(())
    }

    /// Any plugin still producing packets
    pub fn is_running(&self) -> bool {
        self.plugins.iter().any(|p| p.is_running())
    }

    pub fn stats(&self) -> CaptureStats {
        self.plugins
            .iter()
            .map(|p| p.stats())
            .fold(CaptureStats::default(), |mut acc, s| {
                acc.packets_captured += s.packets_captured;
                acc.packets_dropped += s.packets_dropped;
                acc.packets_malformed += s.packets_malformed;
                acc.packets_ignored += s.packets_ignored;
                acc.bytes_captured += s.bytes_captured;
                acc
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiretap_core::metrics::create_metrics;

    #[tokio::test]
    async fn test_manager_closes_channel_when_sources_finish() {
        let metrics = create_metrics();
        let mut manager = CaptureManager::new();
        manager.add_plugin(Box::new(TrafficGenerator::new(
            GeneratorConfig {
                interval_ms: 1,
                rounds: 1,
                unanswered_every: 0,
            },
            metrics,
        )));

        let (tx, mut rx) = mpsc::channel(1024);
        manager.start(tx).await.unwrap();

        let mut count = 0;
        while rx.recv().await.is_some() {
            count += 1;
        }
        assert!(count > 0);
        manager.stop().await.unwrap();
        assert!(!manager.is_running());
    }
}
