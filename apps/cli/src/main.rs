use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use luxfw_core::package::FirmwarePackage;
use luxfw_core::updater::{FirmwareUpdater, UpdaterConfig};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(author, version, about = "Inverter/BMS firmware updater over the WiFi datalogger", long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Push a firmware package to the device
    Update {
        /// Package manifest (TOML)
        #[arg(long)]
        manifest: PathBuf,

        /// Updater config file (TOML)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Datalogger address
        #[arg(long)]
        host: Option<String>,

        /// Datalogger port
        #[arg(long)]
        port: Option<u16>,

        /// Inverter/BMS serial encoded into every frame
        #[arg(long)]
        serial: Option<String>,
    },
    /// Print a summary of a firmware package
    Inspect {
        /// Package manifest (TOML)
        #[arg(long)]
        manifest: PathBuf,
    },
    /// Write a default config file
    InitConfig {
        #[arg(long, default_value = "luxfw.toml")]
        output: PathBuf,
    },
}

fn main() {
    let cli = Cli::parse();

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(if cli.verbose {
                    tracing::Level::DEBUG.into()
                } else {
                    tracing::Level::INFO.into()
                })
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    if let Err(e) = run(cli.command) {
        error!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn run(command: Command) -> Result<()> {
    match command {
        Command::Update {
            manifest,
            config,
            host,
            port,
            serial,
        } => {
            let mut config = match config {
                Some(path) => UpdaterConfig::load_from_file(&path)
                    .with_context(|| format!("loading config {}", path.display()))?,
                None => UpdaterConfig::default(),
            };
            if let Some(host) = host {
                config.host = host;
            }
            if let Some(port) = port {
                config.port = port;
            }
            if serial.is_some() {
                config.inverter_sn = serial;
            }

            let package = load_package(&manifest)?;
            if !package.done_download {
                bail!("firmware in {} is not fully downloaded", manifest.display());
            }

            info!(
                host = %config.host,
                port = config.port,
                device = %config.device_serial(),
                packages = package.package_count(),
                "Starting update"
            );
            let mut updater = FirmwareUpdater::new(config);
            let report = updater.update_firmware(&package)?;
            info!(
                resume_index = report.resume_index,
                packages_sent = report.packages_sent,
                "Update finished, device is restarting"
            );
        }
        Command::Inspect { manifest } => {
            let package = load_package(&manifest)?;
            let count = package.package_count();
            println!("Name:          {}", package.name.as_deref().unwrap_or("-"));
            println!("Variant:       {}", package.variant);
            println!("File type:     {}", package.file_type);
            println!("File size:     {} bytes", package.file_size);
            println!("Payload:       {} bytes", package.total_bytes());
            println!("Checksum32:    0x{:08X}", package.checksum32);
            println!("Packages:      {}", count);
            println!("Reset count:   {}", package.reset_count(count));
            println!("Downloaded:    {}", package.done_download);
        }
        Command::InitConfig { output } => {
            UpdaterConfig::default()
                .save_to_file(&output)
                .with_context(|| format!("writing {}", output.display()))?;
            info!("Wrote default config to {}", output.display());
        }
    }
    Ok(())
}

fn load_package(manifest: &Path) -> Result<FirmwarePackage> {
    FirmwarePackage::load_manifest(manifest)
        .with_context(|| format!("loading manifest {}", manifest.display()))
}
