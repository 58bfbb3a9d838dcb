//! Wiretap - network traffic sniffer and protocol transaction decoder
//!
//! Captures packets from an interface or capture file, reassembles flows,
//! decodes HTTP, Thrift, TLS and DNS into request/response transactions and
//! publishes them to Elasticsearch or a JSONL file.

mod pipeline;
mod session;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use pipeline::{ClockMode, Pipeline};
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};
use wiretap_capture::{list_devices, CaptureManager, GeneratorConfig, PcapCapture, PcapConfig, TrafficGenerator};
use wiretap_core::config::{ConfigLoader, FailureAction, PublishSettings, WiretapConfig};
use wiretap_core::metrics::{create_metrics, SharedMetrics};
use wiretap_core::plugins::{CapturePlugin, ExportPlugin};
use wiretap_export::{
    ElasticsearchConfig, ElasticsearchExporter, JsonlExporter, JsonlExporterConfig, Publisher, PublisherConfig,
    Spool,
};

/// Output written by `demo` when no sink is configured
const DEMO_OUTPUT: &str = "wiretap-demo.jsonl";

#[derive(Parser)]
#[command(name = "wiretap")]
#[command(version)]
#[command(about = "Network traffic sniffer and protocol transaction decoder", long_about = None)]
struct Cli {
    /// Increase verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Log output format
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    format: LogFormat,

    /// Path to configuration file
    #[arg(short, long, global = true, env = "WIRETAP_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Sniff an interface or replay a capture file
    Run {
        /// Interface to capture on
        #[arg(short, long, conflicts_with = "file")]
        interface: Option<String>,

        /// Capture file to replay
        #[arg(short = 'r', long)]
        file: Option<PathBuf>,

        /// BPF filter, replacing the one generated from protocol ports
        #[arg(long)]
        bpf: Option<String>,

        /// Write transactions to this JSONL file instead of the configured sink
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Decode synthetic traffic (no capture privileges needed)
    Demo {
        /// Pause between conversation rounds in milliseconds
        #[arg(long, default_value = "1000")]
        interval: u64,

        /// Number of rounds (0 = until interrupted)
        #[arg(long, default_value = "0")]
        rounds: u64,

        /// Write transactions to this JSONL file
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// List capture devices
    Devices,

    /// Print the effective configuration as TOML
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let loaded = ConfigLoader::new().with_cli_path(cli.config.clone()).load();

    // CLI verbosity wins, then the configured level
    let level = match cli.verbose {
        0 => loaded
            .as_ref()
            .map(|c| c.sensor.log_level.to_lowercase())
            .unwrap_or_else(|_| "info".to_string()),
        1 => "info".to_string(),
        2 => "debug".to_string(),
        _ => "trace".to_string(),
    };
    init_logging(&level, cli.format)?;

    let config = loaded.context("Failed to load configuration")?;

    match cli.command {
        Commands::Run {
            interface,
            file,
            bpf,
            output,
        } => {
            let config = apply_run_args(config, interface, file, bpf, output);
            run_command(config).await
        }
        Commands::Demo {
            interval,
            rounds,
            output,
        } => demo_command(config, interval, rounds, output).await,
        Commands::Devices => devices_command(),
        Commands::Config => {
            print!("{}", config.to_toml()?);
            Ok(())
        }
    }
}

fn init_logging(level: &str, format: LogFormat) -> anyhow::Result<()> {
    // RUST_LOG overrides everything
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let builder = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);

    match format {
        LogFormat::Json => tracing::subscriber::set_global_default(builder.json().finish())?,
        LogFormat::Text => tracing::subscriber::set_global_default(builder.finish())?,
    }
    Ok(())
}

/// Command line arguments take precedence over the configuration file
fn apply_run_args(
    mut config: WiretapConfig,
    interface: Option<String>,
    file: Option<PathBuf>,
    bpf: Option<String>,
    output: Option<PathBuf>,
) -> WiretapConfig {
    if let Some(interface) = interface {
        config.capture.interface = Some(interface);
        config.capture.file = None;
    }
    if let Some(file) = file {
        config.capture.file = Some(file.to_string_lossy().into_owned());
        config.capture.interface = None;
    }
    if bpf.is_some() {
        config.capture.bpf_filter = bpf;
    }
    if let Some(output) = output {
        use_jsonl(&mut config.publish, output);
    }
    config
}

fn use_jsonl(publish: &mut PublishSettings, path: PathBuf) {
    publish.elasticsearch.enabled = false;
    publish.jsonl.enabled = true;
    publish.jsonl.path = path.to_string_lossy().into_owned();
}

async fn run_command(config: WiretapConfig) -> anyhow::Result<()> {
    let metrics = create_metrics();
    let pcap_config = PcapConfig::from_settings(&config.capture, &config.protocols)
        .context("Nothing to capture: pass --interface or --file")?;
    let clock = if pcap_config.source.is_live() {
        ClockMode::Live
    } else {
        ClockMode::Replay
    };
    let capture = PcapCapture::new(pcap_config, metrics.clone());
    run_sensor(config, Box::new(capture), clock, metrics).await
}

async fn demo_command(
    mut config: WiretapConfig,
    interval_ms: u64,
    rounds: u64,
    output: Option<PathBuf>,
) -> anyhow::Result<()> {
    match output {
        Some(path) => use_jsonl(&mut config.publish, path),
        None if !config.publish.elasticsearch.enabled => use_jsonl(&mut config.publish, PathBuf::from(DEMO_OUTPUT)),
        None => {}
    }

    let metrics = create_metrics();
    let generator = TrafficGenerator::new(
        GeneratorConfig {
            interval_ms,
            rounds,
            ..Default::default()
        },
        metrics.clone(),
    );
    run_sensor(config, Box::new(generator), ClockMode::Live, metrics).await
}

fn devices_command() -> anyhow::Result<()> {
    let devices = list_devices()?;
    if devices.is_empty() {
        println!("No capture devices found (missing privileges?)");
        return Ok(());
    }
    for device in devices {
        println!(
            "{:<16} {}",
            device.name,
            device.description.as_deref().unwrap_or("")
        );
        for address in &device.addresses {
            println!("{:<16} {}", "", address);
        }
    }
    Ok(())
}

/// The configured sink, initialized
fn build_sink(publish: &PublishSettings, metrics: &SharedMetrics) -> anyhow::Result<Box<dyn ExportPlugin>> {
    let mut sink: Box<dyn ExportPlugin> = if publish.elasticsearch.enabled {
        Box::new(ElasticsearchExporter::new(
            ElasticsearchConfig::from(&publish.elasticsearch),
            metrics.clone(),
        ))
    } else if publish.jsonl.enabled {
        Box::new(JsonlExporter::new(JsonlExporterConfig::from(&publish.jsonl)))
    } else {
        anyhow::bail!("No publish sink enabled: enable publish.elasticsearch or publish.jsonl");
    };
    sink.init()
        .with_context(|| format!("Failed to initialize {}", sink.name()))?;
    Ok(sink)
}

fn open_spool(publish: &PublishSettings) -> anyhow::Result<Option<Spool>> {
    if publish.on_failure != FailureAction::Spool {
        return Ok(None);
    }
    let spool = Spool::open(&publish.spool.path, publish.spool.max_events)
        .with_context(|| format!("Failed to open spool at {}", publish.spool.path))?;
    Ok(Some(spool))
}

async fn run_sensor(
    config: WiretapConfig,
    source: Box<dyn CapturePlugin>,
    clock: ClockMode,
    metrics: SharedMetrics,
) -> anyhow::Result<()> {
    info!("Starting Wiretap v{}", wiretap_core::SENSOR_VERSION);

    let sink = build_sink(&config.publish, &metrics)?;
    let spool = open_spool(&config.publish)?;
    let (publisher, handle) = Publisher::new(
        PublisherConfig::from(&config.publish),
        sink,
        spool,
        metrics.clone(),
    );
    let publisher_task = tokio::spawn(publisher.run());

    let pipeline = Pipeline::new(&config, clock, handle.clone(), metrics.clone())?;
    let (tx, rx) = mpsc::channel(config.capture.queue_size.max(1));
    let mut pipeline_task = tokio::spawn(pipeline.run(rx));

    let mut capture = CaptureManager::new();
    capture.add_plugin(source);
    if let Err(e) = capture.start(tx).await {
        handle.close();
        if let Err(join) = publisher_task.await {
            error!("Publisher task failed: {}", join);
        }
        return Err(e).context("Failed to start capture");
    }

    let stats_task = (config.sensor.stats_interval_secs > 0).then(|| {
        let metrics = metrics.clone();
        let period = Duration::from_secs(config.sensor.stats_interval_secs);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(period);
            tick.tick().await;
            loop {
                tick.tick().await;
                info!(stats = %metrics.to_json(), "Pipeline stats");
            }
        })
    });

    // Run until the source runs dry or the user interrupts
    let finished = tokio::select! {
        result = &mut pipeline_task => Some(result),
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted, shutting down");
            None
        }
    };

    if let Err(e) = capture.stop().await {
        warn!("Failed to stop capture: {}", e);
    }
    let pipeline_result = match finished {
        Some(result) => result,
        None => pipeline_task.await,
    };
    if let Err(e) = pipeline_result {
        error!("Pipeline task failed: {}", e);
    }

    handle.close();
    if let Err(e) = publisher_task.await {
        error!("Publisher task failed: {}", e);
    }
    if let Some(task) = stats_task {
        task.abort();
    }

    info!(stats = %metrics.to_json(), "Final stats");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_run() {
        let cli = Cli::try_parse_from(["wiretap", "-vv", "run", "--interface", "eth0", "--bpf", "tcp port 80"]).unwrap();
        assert_eq!(cli.verbose, 2);
        assert!(matches!(
            cli.command,
            Commands::Run { interface: Some(ref i), bpf: Some(_), file: None, .. } if i == "eth0"
        ));
    }

    #[test]
    fn test_cli_rejects_interface_and_file() {
        assert!(Cli::try_parse_from(["wiretap", "run", "-i", "eth0", "-r", "x.pcap"]).is_err());
    }

    #[test]
    fn test_run_args_override_config() {
        let mut config = WiretapConfig::default();
        config.capture.interface = Some("eth0".into());
        config.publish.elasticsearch.enabled = true;
        config.publish.jsonl.enabled = false;

        let config = apply_run_args(config, None, Some("trace.pcap".into()), None, Some("out.jsonl".into()));
        assert_eq!(config.capture.file.as_deref(), Some("trace.pcap"));
        assert!(config.capture.interface.is_none());
        assert!(!config.publish.elasticsearch.enabled);
        assert!(config.publish.jsonl.enabled);
        assert_eq!(config.publish.jsonl.path, "out.jsonl");
    }

    #[test]
    fn test_build_sink_requires_one_enabled() {
        let mut publish = PublishSettings::default();
        publish.jsonl.enabled = false;
        assert!(build_sink(&publish, &create_metrics()).is_err());
    }

    #[test]
    fn test_spool_only_when_configured() {
        let dir = tempfile::tempdir().unwrap();
        let mut publish = PublishSettings::default();
        publish.spool.path = dir.path().join("spool.db").to_string_lossy().into_owned();
        assert!(open_spool(&publish).unwrap().is_none());

        publish.on_failure = FailureAction::Spool;
        assert!(open_spool(&publish).unwrap().is_some());
    }
}
