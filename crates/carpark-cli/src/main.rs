//! carpark - bench and operator tool for the entry/exit station devices.
//!
//! Loads the station configuration, opens the serial line of every enabled
//! device and either streams device events (`run`) or performs one
//! transaction and exits once it completes.

use anyhow::{Context, Result, bail};
use bytes::Bytes;
use carpark_core::{DeviceKind, StationConfig};
use carpark_devices::{DeviceEvent, StationHandle, StationManager};
use carpark_protocol::CdFileKind;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "carpark")]
#[command(about = "Drive the antenna, KSM and LCSC devices of a car park station")]
#[command(version)]
struct Cli {
    /// Station configuration file
    #[arg(short, long, env = "CARPARK_CONFIG", default_value = "station.toml")]
    config: PathBuf,

    /// Log filter used when RUST_LOG is not set
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Seconds to wait for a one-shot transaction to finish
    #[arg(short, long, default_value = "60")]
    wait: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate the configuration and print it
    CheckConfig,

    /// Start every enabled device and print events until Ctrl+C
    Run {
        /// Start IU scanning on the antenna
        #[arg(long)]
        scan: bool,
    },

    /// Scan until a vehicle unit is confirmed
    ScanIu,

    /// Wait for a card in the KSM reader and read it
    ReadCard,

    /// Log in to the LCSC reader and query the card balance
    Balance,

    /// Log in to the LCSC reader and deduct from the card
    Deduct {
        /// Amount in cents
        amount: u32,
    },

    /// Set the LCSC reader clock to local time
    SyncTime,

    /// Query the versions of the CD files held by the LCSC reader
    CdVersions,

    /// Upload a CD file to the LCSC reader
    Upload {
        /// blacklist, issuer_list or config
        kind: CdFileKind,

        /// File to upload
        file: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = StationConfig::load(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;

    if let Commands::CheckConfig = cli.command {
        println!("{config:#?}");
        return Ok(());
    }

    let mut manager = StationManager::new(config);
    manager
        .open_serial_ports()
        .context("opening serial ports")?;
    let mut station = manager.start()?;
    let wait = Duration::from_secs(cli.wait);

    let outcome = match cli.command {
        Commands::CheckConfig => Ok(()),
        Commands::Run { scan } => run(&mut station, scan).await,
        Commands::ScanIu => {
            station
                .antenna()
                .context("antenna is disabled")?
                .start_scanning();
            wait_for(&mut station, wait, |event| {
                matches!(event, DeviceEvent::IuArrived { .. })
                    || faulted(event, DeviceKind::Antenna)
            })
            .await
        }
        Commands::ReadCard => {
            let ksm = station.ksm().context("KSM reader is disabled")?;
            ksm.detect_card();
            ksm.read_card();
            wait_for(&mut station, wait, |event| {
                finished(event, DeviceKind::Ksm, "ReadCard")
            })
            .await
        }
        Commands::Balance => {
            let lcsc = station.lcsc().context("LCSC reader is disabled")?;
            lcsc.login();
            lcsc.get_card_balance();
            wait_for(&mut station, wait, |event| {
                finished(event, DeviceKind::Lcsc, "GetCardBalance")
            })
            .await
        }
        Commands::Deduct { amount } => {
            let lcsc = station.lcsc().context("LCSC reader is disabled")?;
            lcsc.login();
            lcsc.deduct(amount);
            wait_for(&mut station, wait, |event| {
                finished(event, DeviceKind::Lcsc, "CardDeduct")
            })
            .await
        }
        Commands::SyncTime => {
            let now = chrono::Local::now().naive_local();
            station
                .lcsc()
                .context("LCSC reader is disabled")?
                .set_time(now);
            wait_for(&mut station, wait, |event| {
                finished(event, DeviceKind::Lcsc, "SetTime")
            })
            .await
        }
        Commands::CdVersions => {
            station
                .lcsc()
                .context("LCSC reader is disabled")?
                .get_cd_versions();
            wait_for(&mut station, wait, |event| {
                finished(event, DeviceKind::Lcsc, "GetCdVersions")
            })
            .await
        }
        Commands::Upload { kind, file } => {
            let data = tokio::fs::read(&file)
                .await
                .with_context(|| format!("reading {}", file.display()))?;
            let chunks = station
                .lcsc()
                .context("LCSC reader is disabled")?
                .upload_cd_file(kind, Bytes::from(data))?;
            info!(%kind, chunks, "Upload queued");
            wait_for(&mut station, wait, |event| {
                matches!(
                    event,
                    DeviceEvent::UploadCompleted { .. } | DeviceEvent::UploadFailed { .. }
                ) || faulted(event, DeviceKind::Lcsc)
            })
            .await
        }
    };

    if let Err(e) = station.shutdown().await {
        warn!(error = %e, "Station shutdown reported an error");
    }
    outcome
}

/// Print every event until Ctrl+C or until all devices stop.
async fn run(station: &mut StationHandle, scan: bool) -> Result<()> {
    if scan {
        station
            .antenna()
            .context("antenna is disabled")?
            .start_scanning();
    }
    eprintln!("Press Ctrl+C to stop...");

    loop {
        tokio::select! {
            event = station.recv() => match event {
                Some(event) => print_event(&event)?,
                None => {
                    warn!("All devices stopped");
                    break;
                }
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Stopping station");
                break;
            }
        }
    }
    Ok(())
}

/// Print events until `done` matches one, failing after `limit`.
async fn wait_for(
    station: &mut StationHandle,
    limit: Duration,
    done: impl Fn(&DeviceEvent) -> bool,
) -> Result<()> {
    match timeout(limit, print_until(station, done)).await {
        Ok(outcome) => outcome,
        Err(_) => bail!("no result within {}s", limit.as_secs()),
    }
}

async fn print_until(station: &mut StationHandle, done: impl Fn(&DeviceEvent) -> bool) -> Result<()> {
    while let Some(event) = station.recv().await {
        print_event(&event)?;
        if done(&event) {
            return Ok(());
        }
    }
    bail!("event stream closed before the transaction finished")
}

fn print_event(event: &DeviceEvent) -> Result<()> {
    println!("{}", serde_json::to_string(event)?);
    Ok(())
}

/// Final outcome of `command`, or a fault of its device.
fn finished(event: &DeviceEvent, device: DeviceKind, command: &str) -> bool {
    match event {
        DeviceEvent::CommandSucceeded {
            device: d,
            command: c,
            ..
        }
        | DeviceEvent::CommandFailed {
            device: d,
            command: c,
            ..
        } => *d == device && *c == command,
        _ => faulted(event, device),
    }
}

fn faulted(event: &DeviceEvent, device: DeviceKind) -> bool {
    matches!(event, DeviceEvent::DeviceFault { device: d, .. } if *d == device)
}

#[cfg(test)]
mod tests {
    use super::*;
    use carpark_core::{EventFields, FailureReason};
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_upload_kind_parsed() {
        let cli = Cli::try_parse_from(["carpark", "upload", "issuer_list", "issuers.bin"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Upload {
                kind: CdFileKind::IssuerList,
                ..
            }
        ));
        assert!(Cli::try_parse_from(["carpark", "upload", "photos", "x.bin"]).is_err());
    }

    #[test]
    fn test_finished_matches_command_or_fault() {
        let deduct = DeviceEvent::CommandSucceeded {
            device: DeviceKind::Lcsc,
            command: "CardDeduct",
            fields: EventFields::new(),
        };
        let login = DeviceEvent::CommandSucceeded {
            device: DeviceKind::Lcsc,
            command: "Login2",
            fields: EventFields::new(),
        };
        let fault = DeviceEvent::DeviceFault {
            device: DeviceKind::Lcsc,
            command: "Login1",
            reason: FailureReason::NoResponse,
        };
        let other_fault = DeviceEvent::DeviceFault {
            device: DeviceKind::Ksm,
            command: "GetStatus",
            reason: FailureReason::NoResponse,
        };

        assert!(finished(&deduct, DeviceKind::Lcsc, "CardDeduct"));
        assert!(!finished(&login, DeviceKind::Lcsc, "CardDeduct"));
        assert!(finished(&fault, DeviceKind::Lcsc, "CardDeduct"));
        assert!(!finished(&other_fault, DeviceKind::Lcsc, "CardDeduct"));
    }
}
