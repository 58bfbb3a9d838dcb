//! Plugin traits for the pipeline edges
//!
//! Packet sources and export sinks are the two places where Wiretap talks to
//! the outside world, so both are defined as traits. Everything in between
//! (flows, decoders, correlation, filtering) is statically dispatched.

use crate::packet::Packet;
use crate::transaction::Transaction;
use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

/// Plugin error type
#[derive(Error, Debug)]
pub enum PluginError {
    #[error("Plugin initialization failed: {0}")]
    InitializationFailed(String),

    #[error("Plugin operation failed: {0}")]
    OperationFailed(String),

    #[error("Plugin configuration error: {0}")]
    ConfigurationError(String),

    /// Backend temporarily unreachable or overloaded; the operation may be retried
    #[error("Backend unavailable: {0}")]
    Unavailable(String),

    /// Backend refused the payload; retrying the same payload will not help
    #[error("Backend rejected payload: {0}")]
    Rejected(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

impl PluginError {
    /// Whether the failed operation is worth retrying
    pub fn is_retryable(&self) -> bool {
        matches!(self, PluginError::Unavailable(_) | PluginError::IoError(_))
    }
}

pub type PluginResult<T> = Result<T, PluginError>;

/// Basic plugin information
pub trait PluginInfo {
    /// Plugin name
    fn name(&self) -> &str;

    /// Plugin version
    fn version(&self) -> &str {
        crate::SENSOR_VERSION
    }

    /// Plugin description
    fn description(&self) -> &str {
        ""
    }
}

/// Base plugin trait - all plugins implement this
pub trait Plugin: PluginInfo + Send + Sync {
    /// Prepare the plugin (open files, build clients)
    fn init(&mut self) -> PluginResult<()> {
        Ok(())
    }

    /// Shutdown the plugin
    fn shutdown(&mut self) -> PluginResult<()> {
        Ok(())
    }
}

// =============================================================================
// CAPTURE PLUGINS
// =============================================================================

/// Capture statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CaptureStats {
    /// Frames read from the device or file
    pub packets_captured: u64,
    /// Packets dropped because the pipeline queue was full
    pub packets_dropped: u64,
    /// Frames that could not be decoded
    pub packets_malformed: u64,
    /// Frames that decoded fine but carry no TCP/UDP payload we track
    pub packets_ignored: u64,
    /// Bytes captured
    pub bytes_captured: u64,
}

/// Capture plugin - produces packets from a device, file or generator
#[async_trait]
pub trait CapturePlugin: Plugin {
    /// Start capturing; packets are pushed into `tx`
    async fn start(&mut self, tx: mpsc::Sender<Packet>) -> PluginResult<()>;

    /// Stop capturing
    async fn stop(&mut self) -> PluginResult<()>;

    /// Check if capture is running
    fn is_running(&self) -> bool;

    /// Get capture statistics
    fn stats(&self) -> CaptureStats {
        CaptureStats::default()
    }
}

// =============================================================================
// EXPORT PLUGINS
// =============================================================================

/// Export plugin - ships transaction batches to a backend
#[async_trait]
pub trait ExportPlugin: Plugin {
    /// Export a batch. Either the whole batch is accepted or an error is returned.
    async fn export_batch(&self, batch: &[Transaction]) -> PluginResult<()>;

    /// Flush any buffered output
    async fn flush(&self) -> PluginResult<()> {
        Ok(())
    }
}
