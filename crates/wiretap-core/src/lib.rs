//! Wiretap Core - packet and transaction types, plugin traits, configuration
//!
//! This crate provides the foundational types shared by every pipeline stage:
//!
//! - **Packets**: decoded capture records handed from the packet source to the flow table
//! - **Messages**: decoder output consumed by the transaction correlator
//! - **Transactions**: finished request/response documents shipped by the publisher
//! - **Plugins**: trait definitions for capture sources and export sinks
//! - **Filter**: keep/drop rules evaluated over complete transactions
//! - **Config / Metrics**: process-wide settings and atomic counters

pub mod config;
pub mod filter;
pub mod message;
pub mod metrics;
pub mod packet;
pub mod plugins;
pub mod transaction;

// Re-export commonly used types
pub use config::{ConfigLoader, WiretapConfig};
pub use filter::{FilterEngine, FilterVerdict};
pub use message::{Correlation, DecodeEvent, Diagnostic, Message, MessageKind};
pub use metrics::{create_metrics, MetricsCollector, SharedMetrics};
pub use packet::{Direction, Packet, TcpFlags, TcpHeader, Transport};
pub use plugins::{
    CapturePlugin, CaptureStats, ExportPlugin, Plugin, PluginError, PluginInfo, PluginResult,
};
pub use transaction::{Transaction, TransactionStatus};

/// Sensor version
pub const SENSOR_VERSION: &str = env!("CARGO_PKG_VERSION");
