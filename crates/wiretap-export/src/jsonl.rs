//! JSONL file exporter

use async_trait::async_trait;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::info;
use wiretap_core::config::JsonlSettings;
use wiretap_core::plugins::{ExportPlugin, Plugin, PluginError, PluginInfo, PluginResult};
use wiretap_core::transaction::Transaction;

/// JSONL exporter configuration
#[derive(Debug, Clone)]
pub struct JsonlExporterConfig {
    /// Output file path
    pub path: PathBuf,

    /// Whether to append to existing file
    pub append: bool,

    /// Flush after each line instead of after each batch
    pub flush_each: bool,
}

impl Default for JsonlExporterConfig {
    fn default() -> Self {
        Self::from(&JsonlSettings::default())
    }
}

impl From<&JsonlSettings> for JsonlExporterConfig {
    fn from(settings: &JsonlSettings) -> Self {
        Self {
            path: PathBuf::from(&settings.path),
            append: settings.append,
            flush_each: settings.flush_each,
        }
    }
}

/// Writes one transaction document per line
pub struct JsonlExporter {
    config: JsonlExporterConfig,
    writer: Option<Mutex<BufWriter<File>>>,
    written: AtomicU64,
}

impl JsonlExporter {
    pub fn new(config: JsonlExporterConfig) -> Self {
        Self {
            config,
            writer: None,
            written: AtomicU64::new(0),
        }
    }

    /// Lines written so far
    pub fn written(&self) -> u64 {
        self.written.load(Ordering::Relaxed)
    }

    fn ensure_writer(&mut self) -> PluginResult<()> {
        if self.writer.is_none() {
            if let Some(parent) = self.config.path.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }
            let file = if self.config.append {
                OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&self.config.path)?
            } else {
                File::create(&self.config.path)?
            };

            self.writer = Some(Mutex::new(BufWriter::new(file)));
            info!("JSONL exporter writing to: {:?}", self.config.path);
        }
        Ok(())
    }
}

impl PluginInfo for JsonlExporter {
    fn name(&self) -> &str {
        "jsonl-exporter"
    }

    fn description(&self) -> &str {
        "Writes transactions to a JSONL file"
    }
}

impl Plugin for JsonlExporter {
    fn init(&mut self) -> PluginResult<()> {
        self.ensure_writer()
    }

    fn shutdown(&mut self) -> PluginResult<()> {
        if let Some(writer) = &self.writer {
            writer.lock().flush()?;
        }
        self.writer = None;
        Ok(())
    }
}

#[async_trait]
impl ExportPlugin for JsonlExporter {
    async fn export_batch(&self, batch: &[Transaction]) -> PluginResult<()> {
        let writer = self
            .writer
            .as_ref()
            .ok_or_else(|| PluginError::OperationFailed("JSONL exporter not initialized".into()))?;

        // Serialize first so a bad document never leaves half a batch on disk
        let lines = batch
            .iter()
            .map(serde_json::to_string)
            .collect::<Result<Vec<_>, _>>()?;

        let mut w = writer.lock();
        for line in &lines {
            writeln!(w, "{}", line)?;
            if self.config.flush_each {
                w.flush()?;
            }
        }
        w.flush()?;
        self.written.fetch_add(lines.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    async fn flush(&self) -> PluginResult<()> {
        if let Some(writer) = &self.writer {
            writer.lock().flush()?;
        }
        Ok(())
    }
}
