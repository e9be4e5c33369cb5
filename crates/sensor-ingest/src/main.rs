// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Sensor ingest server CLI
//!
//! # Usage
//!
//! ```bash
//! # Defaults: port 5123, empty static registry, stdout sink
//! sensor-ingest
//!
//! # Configuration file, port from the environment
//! RECEIVER_PORT=6000 sensor-ingest --config ingest.toml
//!
//! # Write an example configuration
//! sensor-ingest gen-config --output ingest.toml
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use sensor_ingest::registry::{DeviceSeed, MeasurementSeed, SensorSeed};
use sensor_ingest::{DeviceFamily, IngestConfig, IngestServer, RegistryConfig, SinkConfig};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Sensor telemetry ingest server
#[derive(Parser, Debug)]
#[command(name = "sensor-ingest")]
#[command(about = "TCP ingest server for sensor nodes and FBGuard devices")]
#[command(version)]
struct Args {
    /// Configuration file path (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Bind address
    #[arg(long, env = "RECEIVER_HOST")]
    host: Option<IpAddr>,

    /// TCP port
    #[arg(short, long, env = "RECEIVER_PORT")]
    port: Option<u16>,

    /// InfluxDB URL; selects the InfluxDB sink
    #[arg(long, env = "INFLUXDB_URL")]
    influx_url: Option<String>,

    /// InfluxDB API token; selects the InfluxDB sink
    #[arg(long, env = "INFLUXDB_ADMIN_TOKEN", hide_env_values = true)]
    influx_token: Option<String>,

    /// InfluxDB organization
    #[arg(long, env = "INFLUXDB_ORG")]
    influx_org: Option<String>,

    /// Log level or filter directives (overrides the config file)
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Generate example configuration file
    GenConfig {
        /// Output file path
        #[arg(short, long, default_value = "ingest.toml")]
        output: PathBuf,
    },

    /// Validate a configuration file
    Validate {
        /// Configuration file path
        #[arg(short, long)]
        config: PathBuf,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();

    match &args.command {
        Some(Commands::GenConfig { output }) => return cmd_gen_config(output),
        Some(Commands::Validate { config }) => return cmd_validate(config),
        None => {}
    }

    let config = build_config(&args)?;

    let level = args.log_level.as_deref().unwrap_or(&config.log_level);
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        "Sensor ingest server v{} (registry: {}, sink: {})",
        env!("CARGO_PKG_VERSION"),
        registry_label(&config.registry),
        sink_label(&config.sink)
    );

    let server = IngestServer::from_config(config).context("failed to start ingest server")?;

    let stop = server.stop_handle();
    ctrlc::set_handler(move || {
        info!("Shutdown signal received, stopping server...");
        stop.stop();
    })
    .context("failed to install Ctrl+C handler")?;

    let metrics = server.metrics();
    server.run().context("ingest server failed")?;

    if let Ok(json) = serde_json::to_string(&metrics.snapshot()) {
        info!("Final statistics: {}", json);
    }
    Ok(())
}

/// File (or defaults), then command line and environment overrides.
fn build_config(args: &Args) -> Result<IngestConfig> {
    let mut config = match &args.config {
        Some(path) => IngestConfig::from_file(path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => IngestConfig::default(),
    };

    if let Some(host) = args.host {
        config.server.bind_address = host;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }

    let wants_influx = args.influx_url.is_some() || args.influx_token.is_some();
    if wants_influx && !matches!(config.sink, SinkConfig::Influx { .. }) {
        config.sink = SinkConfig::influx("");
    }
    if let SinkConfig::Influx { url, org, token, .. } = &mut config.sink {
        if let Some(v) = &args.influx_url {
            *url = v.clone();
        }
        if let Some(v) = &args.influx_org {
            *org = v.clone();
        }
        if let Some(v) = &args.influx_token {
            *token = v.clone();
        }
    }

    config.validate().context("invalid configuration")?;
    Ok(config)
}

fn registry_label(config: &RegistryConfig) -> String {
    match config {
        RegistryConfig::Static { devices } => format!("static, {} devices", devices.len()),
        RegistryConfig::Sqlite { path } => format!("sqlite {}", path.display()),
    }
}

fn sink_label(config: &SinkConfig) -> String {
    match config {
        SinkConfig::Stdout => "stdout".to_string(),
        SinkConfig::Influx { url, org, .. } => format!("influx {} org={}", url, org),
    }
}

fn cmd_gen_config(output: &Path) -> Result<()> {
    let config = IngestConfig {
        registry: RegistryConfig::Static {
            devices: vec![
                DeviceSeed {
                    name: "node1".into(),
                    family: DeviceFamily::SensorNode,
                    sensors: vec![
                        SensorSeed {
                            name: "temp".into(),
                            sample_period_ms: Some(100),
                            samples_per_message: Some(10),
                        },
                        SensorSeed {
                            name: "hum".into(),
                            sample_period_ms: Some(200),
                            samples_per_message: Some(5),
                        },
                    ],
                    measurements: vec![MeasurementSeed {
                        name: "example-project".into(),
                        id: 1,
                    }],
                },
                DeviceSeed {
                    name: "guard1".into(),
                    family: DeviceFamily::FbGuard,
                    sensors: Vec::new(),
                    measurements: vec![MeasurementSeed {
                        name: "example-project".into(),
                        id: 1,
                    }],
                },
            ],
        },
        sink: SinkConfig::Stdout,
        ..Default::default()
    };

    let content = format!(
        "# Sensor ingest configuration\n# Generated by sensor-ingest gen-config\n\n{}",
        config.to_toml()?
    );
    std::fs::write(output, content)
        .with_context(|| format!("failed to write {}", output.display()))?;
    println!("Generated configuration file: {}", output.display());
    Ok(())
}

fn cmd_validate(path: &Path) -> Result<()> {
    match IngestConfig::from_file(path) {
        Ok(config) => {
            println!("Configuration valid!");
            println!();
            println!("Listen:   {}", config.server.socket_addr());
            println!("Registry: {}", registry_label(&config.registry));
            println!("Sink:     {}", sink_label(&config.sink));
            Ok(())
        }
        Err(e) => {
            eprintln!("Configuration invalid: {}", e);
            std::process::exit(1);
        }
    }
}
